// Public API - engine, codec, and state types plus the CLI surface
pub mod cli;
pub mod config;
pub mod engine;
pub mod lookup;
pub mod probe;
pub mod report;
pub mod state;
pub mod target;
