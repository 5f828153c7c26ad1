//! # courier-store
//!
//! Durable record of direct messages and their read state.
//!
//! The hub talks to storage only through the async [`MessageStore`] trait.
//! Two implementations ship with the crate: [`SqliteStore`], which wraps a
//! synchronous [`Database`] handle and runs every query on the blocking
//! pool, and [`MemoryStore`], a process-local store with fault injection
//! used by tests and throwaway deployments.

pub mod database;
pub mod memory;
pub mod messages;
pub mod migrations;
pub mod store;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use memory::{MemoryStore, StoreOp};
pub use store::{MessageStore, SqliteStore};
