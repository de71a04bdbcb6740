//! Cold storage for aged samples.
//!
//! Aged hot-store partitions are encoded as zstd-compressed Parquet files
//! and written to object storage, one immutable object per
//! `(site, point, day)`. The [`ObjectStore`] trait abstracts the backend;
//! the local-filesystem backend serves single-node deployments and the
//! in-memory backend serves tests. Verification before hot-store deletion
//! is a metadata read ([`ObjectStore::head`]): existence plus non-zero size.

pub mod error;
pub mod parquet;
pub mod storage;

pub use error::{Error, Result};
pub use parquet::{decode_partition, encode_partition};
pub use storage::{LocalStore, MemoryStore, ObjectMeta, ObjectStore};
