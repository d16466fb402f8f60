//! Agent gateway for cadence.
//!
//! This crate provides:
//!
//! - **HTTP gateway**: [`HttpAgentGateway`], the scheduler's `AgentGateway`
//!   over the agent's JSON API
//! - **Configuration**: [`AgentConfig`], where the agent lives

pub mod client;
pub mod config;

pub use client::HttpAgentGateway;
pub use config::AgentConfig;
