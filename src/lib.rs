//! Core storage engine for Ori, a distributed, content-addressed, versioned
//! file system.
//!
//! This crate implements the content-addressed object store, the
//! packfile-based on-disk layout with its index and metadata log, the
//! commit/tree data model, reference-counted garbage collection, and the
//! object replication protocol between a local and a remote repository. A
//! FUSE front-end and a command-line driver are expected to sit on top of
//! [`Repository`] but are not part of this crate.
//!
//! [`Repository`]: crate::repository::Repository

pub mod codec;
pub mod commit;
pub mod config;
pub mod error;
pub(crate) mod file_util;
pub mod hash;
pub mod index;
pub mod large_blob;
pub mod metadata;
pub mod object_store;
pub mod packfile;
pub mod packfile_manager;
pub mod repository;
pub mod signature;
pub mod transfer;
pub mod tree;
pub mod typed_stream;

pub use error::OriError;
pub use error::OriResult;
pub use hash::HashedId;
pub use repository::Repository;
