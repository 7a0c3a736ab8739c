//! # Sluice Core
//!
//! The document-revision-channel engine of the Sluice sync gateway.
//!
//! Sluice mediates between mobile document-database clients and a
//! server-side key-value store. This crate provides:
//! - Documents stored as revision trees with CAS-protected writes and
//!   a deterministic conflict winner
//! - Channel assignment via user-supplied mapping functions, with
//!   membership history for incremental replication
//! - Users, roles, and channel-based read authorization, including
//!   channels granted to principals by documents
//! - The replication queries: `revs_diff` and the incremental changes
//!   query, plus an in-process change feed
//!
//! The HTTP surface, the sandboxed evaluator for mapping functions and
//! the long-poll changes transport are external collaborators reached
//! through traits; persistence is delegated to a [`sluice_kv::Bucket`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod attachments;
pub mod auth;
mod body;
mod changes;
pub mod channels;
mod config;
mod crud;
mod database;
mod document;
mod error;
pub mod mapper;
mod revid;
pub mod revtree;
mod sequence;
mod server;
pub mod special;

pub use body::Body;
pub use changes::{ChangeEntry, ChangeFeed, ChangesOptions};
pub use channels::{AccessMap, ChannelMap, ChannelRemoval, ChannelSet};
pub use config::{DbConfig, ServerConfig};
pub use crud::{authorize_any_doc_channels, Database, RevsDiffEntry, RevsDiffInput};
pub use database::{gateway_design_doc, DatabaseContext, DESIGN_DOC};
pub use document::Document;
pub use error::{CoreError, CoreResult};
pub use revid::{create_rev_id, create_uuid, parse_rev_id};
pub use sequence::SequenceAllocator;
pub use server::{is_valid_database_name, ServerContext, ServerContextBuilder};
