//! onboard-sync — multi-actor onboarding workflow state synchronization.
//!
//! Keeps one authoritative run per participant, ingests progress events from
//! the client-side agent, advances a per-run step ledger through a keyword
//! completion heuristic, and fans state changes out to live SSE observers
//! with an always-consistent poll fallback.

pub mod config;
pub mod delivery;
pub mod error;
pub mod gateway;
pub mod provision;
pub mod registry;
pub mod run;

pub use error::{Error, Result};
