//! Core types, configuration and the provider boundary

pub mod chunker;
pub mod client;
pub mod config;
pub mod errors;
pub mod models;
