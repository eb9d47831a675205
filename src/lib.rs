//! Hivemind - swarm coordination substrate
//!
//! A shared-workspace coordination core for fleets of autonomous coding
//! agents:
//! - Append-only event log with monotonic sequencing and synchronous,
//!   idempotent projections
//! - Inter-agent messaging, file reservations with TTL, a distributed
//!   lock with fencing tokens, durable cursors and deferreds
//! - Work-item ("cell") graph with dependency cycle prevention, a blocked
//!   cache, and hash-stable JSONL sync for git
//! - Semantic memory with vector + full-text search and graceful
//!   degradation when the embedder is down
//! - An HTTP event stream (JSON slices and live SSE) for dashboards

pub mod adapters;
pub mod cli;
pub mod config;
pub mod domain;
pub mod services;

pub use domain::{CoreError, CoreResult};
