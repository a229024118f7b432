//! Node cache for ArborDB.
//!
//! This crate provides a bounded, position-keyed LRU cache that limits how
//! many loaded nodes stay resident in memory. Eviction releases a node's
//! in-memory data while leaving its handle addressable, so the owner can
//! re-load it from storage on the next access.

mod cache;

pub use cache::{NodeCache, Resident};
