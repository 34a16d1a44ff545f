//! The WideFM parameter store.
//!
//! Model parameters are sharded across server nodes by contiguous ranges of
//! the 64-bit feature-ID space. Workers move data with two asynchronous
//! operations, `push(keys, kind, values)` and `pull(keys, kind)`, that
//! return a timestamp immediately and complete through callbacks;
//! `wait(timestamp)` blocks until an operation is acknowledged by every
//! involved server.
//!
//! Two consistency modes are supported:
//!
//! - **Asynchronous** (default): each server applies pushes and answers
//!   pulls in arrival order. A worker is serialized only against itself: a
//!   pull issued after that worker's own push on the same keys observes the
//!   push.
//! - **Bounded staleness / BSP** (`sync_mode=true`): each server keeps
//!   vector clocks of per-worker push and pull counts. A worker may not run
//!   further ahead of the slowest worker than `max_delay` iterations;
//!   requests that would violate the bound are buffered and drained when
//!   the global clock advances.
//!
//! The server side hands every request to an installed [`Updater`], the
//! optimizer-specific state holder. The wire RPC transport is an external
//! collaborator; this crate defines the messages it must carry
//! ([`bus::Payload`]) and ships the in-process transport used by the
//! combined-role local mode and the test suites.

pub mod bus;
pub mod client;
mod error;
pub mod pool;
pub mod server;
pub mod updater;
pub mod vector_clock;

pub use bus::{Bus, Envelope, KvRequest, KvResponse, Payload};
pub use client::{PullValue, StoreClient};
pub use error::{Result, StoreError};
pub use pool::TaskPool;
pub use server::{ServerConfig, ServerNode};
pub use updater::{Updater, UpdaterError};
pub use vector_clock::VectorClock;

/// What a push or pull payload holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Feature appearance counts.
    FeaCount,
    /// Model parameters.
    Weight,
    /// Gradients (or optimizer-specific update payloads).
    Gradient,
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ValueKind::FeaCount => "fea_count",
            ValueKind::Weight => "weight",
            ValueKind::Gradient => "gradient",
        };
        f.write_str(name)
    }
}
