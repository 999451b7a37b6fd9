//! Host-side attestation engine for match result claims.
//!
//! Claims are accepted, corroborated by weighted attestations and disputes,
//! and settled against a reputation ledger. The relational store is the
//! source of truth; every state change is mirrored to a distributed ledger
//! through a write-behind outbox.

pub mod chain;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod locks;
pub mod reputation;
pub mod retry;
pub mod roles;
pub mod server;
pub mod store;

pub use config::{EngineConfig, MirrorConfig, PolicyArgs};
pub use engine::Engine;
pub use error::EngineError;
pub use store::{MemoryStore, PgStore, Store, StoreError};
