//! # HelixAgent Gateway
//!
//! The HTTP face of the HelixAgent ensemble: an OpenAI-compatible
//! completion endpoint backed by multi-provider debate, plus the
//! operational surface - models, asynchronous debates, verification
//! triggers, provider health and the scored ranking.
//!
//! The heavy lifting (provider federation, debate orchestration, memory
//! and caching) lives in `helixagent-ensemble`; this crate wires it to
//! axum, loads configuration, and ships the `helixagent` binary with its
//! `serve`, `mcp-server` and `check-health` subcommands.

pub mod config;
pub mod debate_jobs;
pub mod gateway_error;
pub mod handlers;
pub mod mcp;
pub mod request_context;
pub mod server;

pub use config::Config;
pub use gateway_error::GatewayError;
pub use server::{create_server, AppState, GatewayRuntime};
