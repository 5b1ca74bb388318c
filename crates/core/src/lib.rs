//! `batchq-core`: foundation types shared by the scheduler crates.
//!
//! This crate contains **pure** primitives (no async, no IO).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{JobName, OperationId};
