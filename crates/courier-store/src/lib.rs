//! # courier-store
//!
//! Reference implementations of the collaborator traits from
//! `courier-core::store`:
//!
//! - [`MemoryStore`]: process memory, used by tests and single-node demos
//! - [`SqliteStore`]: `SQLite` through an `r2d2` pool, blocking work moved off
//!   the async runtime with `spawn_blocking`
//!
//! Both expose seeding helpers (users, contacts, group conversations) since
//! account management lives outside the delivery layer.

#![deny(unsafe_code)]

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{ConnectionConfig, SqliteStore};
