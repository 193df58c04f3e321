//! Durable storage layer
//!
//! This module provides the persistence layer using SQLite with:
//! - Schema migrations
//! - A FIFO event queue that survives process restarts
//! - Settings and super-property tables

pub mod repo;
pub mod schema;

pub use repo::Store;
