//! Topology agent: configuration and HTTP control surface

pub mod api;
pub mod config;
