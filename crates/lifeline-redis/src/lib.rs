//! Lifeline Redis document store
//!
//! Stores each document as a hash (`data` holds the JSON body, with
//! `version` and `isDeleted` mirrored as plain fields) and keeps a sorted
//! set of ids per collection. Transactions stage their writes locally and
//! send them on commit as one Lua script that first checks no staged
//! document changed since it was read.

pub mod client;
pub mod codec;
pub mod store;

pub use client::{init_pool, RedisConfig, RedisPool, RedisResult, RedisStoreError};
pub use store::RedisDocumentStore;
