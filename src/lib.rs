//! LOOPER: leverage loop orchestrator
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod chain;
pub mod strategy;
pub mod engine;
pub mod dashboard;
