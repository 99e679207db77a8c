//! Line-oriented annotation scanning over decompiled source text
//!
//! Recognition is textual: each line is matched on its own, so annotations
//! split across lines or with computed arguments are not seen.

use regex::Regex;

/// Remote-client annotation naming its target service
pub const CLIENT_BINDING_PATTERN: &str =
    r#"@FeignClient\(\s*(?:(?:value|name)\s*=\s*)?"([^"]+)""#;

/// Marker of the registry/discovery server itself
pub const DISCOVERY_SERVER_PATTERN: &str = r"@EnableEurekaServer\b";

/// What a source file declares
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Annotation {
    /// The file binds a client to the named service
    ClientOf(String),
    /// The file enables the discovery server
    DiscoveryServer,
}

/// Extracts at most one annotation from a source file
pub trait AnnotationScanner: Send + Sync {
    fn scan_line(&self, line: &str) -> Option<Annotation>;

    /// First recognized annotation in the file; scanning stops there
    fn scan(&self, text: &str) -> Option<Annotation> {
        text.lines().find_map(|line| self.scan_line(line))
    }
}

/// Regex implementation of [`AnnotationScanner`]
#[derive(Debug, Clone)]
pub struct RegexScanner {
    client: Regex,
    discovery: Regex,
}

impl RegexScanner {
    /// Scanner with custom patterns; the client pattern must capture the
    /// target service name in group 1
    pub fn with_patterns(client: &str, discovery: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            client: Regex::new(client)?,
            discovery: Regex::new(discovery)?,
        })
    }
}

impl Default for RegexScanner {
    fn default() -> Self {
        Self::with_patterns(CLIENT_BINDING_PATTERN, DISCOVERY_SERVER_PATTERN)
            .expect("built-in scanner patterns are valid")
    }
}

impl AnnotationScanner for RegexScanner {
    fn scan_line(&self, line: &str) -> Option<Annotation> {
        if let Some(caps) = self.client.captures(line) {
            let target = caps.get(1)?.as_str().trim().to_lowercase();
            if !target.is_empty() {
                return Some(Annotation::ClientOf(target));
            }
        }
        if self.discovery.is_match(line) {
            return Some(Annotation::DiscoveryServer);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_binding_forms() {
        let scanner = RegexScanner::default();
        for line in [
            r#"@FeignClient(value="payments")"#,
            r#"@FeignClient(value = "payments", url = "http://x")"#,
            r#"@FeignClient(name="payments")"#,
            r#"  @FeignClient("PAYMENTS")"#,
        ] {
            assert_eq!(
                scanner.scan_line(line),
                Some(Annotation::ClientOf("payments".to_string())),
                "line: {}",
                line
            );
        }
    }

    #[test]
    fn test_discovery_marker() {
        let scanner = RegexScanner::default();
        assert_eq!(
            scanner.scan_line("@EnableEurekaServer"),
            Some(Annotation::DiscoveryServer)
        );
        assert_eq!(scanner.scan_line("@EnableEurekaServerX"), None);
    }

    #[test]
    fn test_first_match_per_file() {
        let scanner = RegexScanner::default();
        let text = r#"
package com.example;

@FeignClient(value="orders")
public interface OrdersClient {}

@FeignClient(value="payments")
"#;
        assert_eq!(
            scanner.scan(text),
            Some(Annotation::ClientOf("orders".to_string()))
        );
    }

    #[test]
    fn test_multi_line_annotation_not_recognized() {
        let scanner = RegexScanner::default();
        let text = "@FeignClient(\n    value = \"orders\")\ninterface OrdersClient {}";
        assert_eq!(scanner.scan(text), None);
    }

    #[test]
    fn test_custom_patterns() {
        let scanner =
            RegexScanner::with_patterns(r#"@RemoteService\("([^"]+)"\)"#, r"@Registry").unwrap();
        assert_eq!(
            scanner.scan_line(r#"@RemoteService("ledger")"#),
            Some(Annotation::ClientOf("ledger".to_string()))
        );
        assert_eq!(scanner.scan_line("@Registry"), Some(Annotation::DiscoveryServer));
    }
}
