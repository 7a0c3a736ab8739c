//! # Sluice KV
//!
//! Key-value store contract for the Sluice sync gateway.
//!
//! This crate provides:
//! - The [`Bucket`] trait: get/set/delete, CAS-protected `update`, and
//!   materialized views
//! - [`MemoryBucket`]: a thread-safe in-memory implementation with native
//!   (Rust-closure) views, used by tests and embedded deployments
//!
//! The gateway core owns all value interpretation - buckets store opaque
//! bytes and run the view map functions they are given.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bucket;
mod error;
mod memory;
mod view;

pub use bucket::{Bucket, UpdateAction, UpdateFn, UpdateResult};
pub use error::{BoxError, KvError, KvResult};
pub use memory::MemoryBucket;
pub use view::{collate, DesignDoc, MapFn, ViewParams, ViewResult, ViewRow};
