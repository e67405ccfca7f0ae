//! Embedded index core for an append-only key-value store: a hierarchical
//! B+-tree trie ("HB+-trie") over a block-addressed file.
//!
//! Each level of the trie is a node-sized B+-tree indexing one fixed-width
//! chunk of the key; values with the MSB set point at child tree roots,
//! values with a clear MSB are document offsets. The `btreeblock` handle
//! stages dirty and clean nodes between the trees and the file, packing
//! small trees into sub-block slots.

pub mod address;
pub mod block_file;
pub mod btree;
pub mod btreeblock;
pub mod chunk;
pub mod docio;
pub mod hbtrie;
pub mod types;

pub use block_file::{BlockFile, DirtyTag, FileBlocks};
pub use btreeblock::BtreeBlkHandle;
pub use docio::{DocStore, KeyReader};
pub use hbtrie::{BulkSource, HBTrie, HBTrieIterator, HBTRIE_FLAG_COMPACT};
pub use types::{Bid, Result, TrieError, BLK_NOT_FOUND};
