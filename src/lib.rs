pub mod board;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod finding;
pub mod mapping;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod sources;
pub mod templates;
