#![forbid(unsafe_code)]

//! `storyloop`: autonomous "spawn a worker per job" execution engine.
//!
//! A durable JSON job queue is drained one job at a time: each iteration
//! merges externally staged updates, auto-unblocks jobs whose dependencies
//! passed, dispatches the head of `pending` to a fresh executor process,
//! classifies its output, and applies the reported progress.

pub mod config;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod ipc;
pub mod models;
pub mod observer;
pub mod registry;
pub mod store;

pub use config::EngineConfig;
pub use errors::{AppError, Result};
