//! # Skeleton B-tree map
//!
//! `skeleton-btree` is an ordered map whose B-tree nodes can individually
//! live in memory or as lightweight ghosts backed by an external,
//! possibly high-latency, content-addressed store. This is useful if you
//!
//! - keep an index that is much larger than what you want resident, and
//!   can fetch missing subtrees on demand,
//! - publish an index into a store that hands out opaque handles for
//!   serialized blocks (an [`Archiver`]), and
//! - want bulk loads to run through a pool of parallel fetch workers while
//!   lookups stay single-threaded.
//!
//! Deflating the tree pushes bare subtrees outward and replaces them with
//! ghosts; inflating pulls them back, either one key path at a time
//! ([`SkeletonBtreeMap::inflate_key`]) or for the whole tree at once. Any
//! operation that runs into a ghost fails with [`Error::NotLoaded`] so the
//! caller can inflate the missing range and retry.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use skeleton_btree::{ArchiverKind, BtreeConfig, Error, MemoryArchiver, SkeletonBtreeMap};
//!
//! fn main() -> Result<(), Error> {
//!     let mut tree = SkeletonBtreeMap::new(BtreeConfig::default().node_min(2))?;
//!     for i in 0..100u32 {
//!         tree.insert(i, i * 2)?;
//!     }
//!     assert_eq!(Some(&84), tree.get(&42)?);
//!
//!     // Push the whole tree out, keeping only the root skeleton.
//!     let archiver = Arc::new(MemoryArchiver::new());
//!     tree.set_archiver(ArchiverKind::Scheduled(archiver))?;
//!     tree.deflate()?;
//!     assert!(tree.is_bare());
//!
//!     // A lookup now reports the missing range; inflate the key and retry.
//!     assert!(tree.get(&42).is_err());
//!     tree.inflate_key(&42)?;
//!     assert_eq!(Some(&84), tree.get(&42)?);
//!
//!     // Or re-materialize everything through the worker pool.
//!     tree.inflate()?;
//!     assert_eq!(100, tree.iter().count());
//!     Ok(())
//! }
//! ```

mod btree;
mod error;
mod exec;
mod serial;
mod translate;

pub use btree::{BtreeConfig, Iter, SkeletonBtreeMap};
pub use error::{Error, Result};
pub use exec::{CompletionQueue, ErrorMap, ProgressTracker, Scheduler, TaskQueue};
pub use serial::memory::MemoryArchiver;
pub use serial::{Archiver, ArchiverKind, BatchArchiver, Meta, PullTask, PushTask, ScheduledArchiver};
pub use translate::{NodeRepr, Translator, TreeRepr, TreeTranslator};
