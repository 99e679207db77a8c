//! Network policy synthesis and persistence

pub mod store;
pub mod synth;

pub use store::PolicyStore;
pub use synth::{parse_selector, PolicyDocument, PolicySynthesizer, SynthesizerConfig};
