//! Core types and consensus rules for match result attestation.
//!
//! Everything here is pure and deterministic: the data model, the role
//! weight table, the threshold state machine and the reputation arithmetic.
//! Storage, chain mirroring and transport live in `matchproof-host`.

pub mod consensus;
pub mod hash;
pub mod reputation;
pub mod types;

pub use consensus::*;
pub use hash::*;
pub use reputation::*;
pub use types::*;
