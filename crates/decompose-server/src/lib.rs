//! # decompose-server
//!
//! HTTP front end for the decompose job orchestrator.
//!
//! Producers submit jobs over HTTP; a worker pool executes them against the
//! container runtime and records each completion in Postgres (or in memory
//! when no database is configured).
//!
//! ## Configuration
//!
//! See [`DecomposeConfig::from_env`] for the environment variables.

pub mod config;
pub mod http;
pub mod state;
pub mod store;
pub mod types;

pub use config::{ConfigError, DecomposeConfig, RuntimeKind};
pub use state::AppState;
pub use store::PgCompletionSink;
