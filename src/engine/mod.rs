//! Core engine: plan → orchestrate → run.

pub mod planner;
pub mod orchestrator;
pub mod runner;
