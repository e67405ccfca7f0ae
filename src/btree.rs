use crate::block_file::FileBlocks;
use crate::btreeblock::*;
use crate::types::*;

use byteorder::{BigEndian, ByteOrder};
use log::debug;
use more_asserts::debug_assert_le;
use std::cmp::Ordering;

/// Node-sized B+-tree over the block handle. A node occupies one section
/// handed out by `BtreeBlkHandle` (a sub-block slot for small trees, a
/// whole node otherwise) and grows through the sub-block class ladder
/// before it ever splits.

pub const BNODE_HDR_SIZE: usize = 8;

const FLAG_ROOT: u16 = 0x1;
const FLAG_META: u16 = 0x2;

/// Comparator plugged into variable-key (leaf) trees.
pub type KeyCmpFn = fn(&[u8], &[u8]) -> Ordering;

fn bytes_cmp(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum KeyFormat {
    /// Fixed-width keys (`ksize` bytes each).
    Fixed,
    /// `[klen u16 BE][key]` entries; used by leaf trees indexing raw key
    /// remainders.
    Var,
}

/// In-memory image of one node; `data.len()` is the node's section size.
struct Node {
    data: Vec<u8>,
}

impl Node {
    fn new(cap: usize) -> Node {
        Node { data: vec![0u8; cap] }
    }

    fn cap(&self) -> usize {
        self.data.len()
    }

    fn ksize(&self) -> u8 {
        (BigEndian::read_u16(&self.data[0..2]) >> 8) as u8
    }

    fn vsize(&self) -> u8 {
        (BigEndian::read_u16(&self.data[0..2]) & 0xff) as u8
    }

    fn set_kvsize(&mut self, ksize: u8, vsize: u8) {
        BigEndian::write_u16(&mut self.data[0..2], ((ksize as u16) << 8) | vsize as u16);
    }

    fn flag(&self) -> u16 {
        BigEndian::read_u16(&self.data[2..4])
    }

    fn set_flag(&mut self, flag: u16) {
        BigEndian::write_u16(&mut self.data[2..4], flag);
    }

    fn level(&self) -> u16 {
        BigEndian::read_u16(&self.data[4..6])
    }

    fn set_level(&mut self, level: u16) {
        BigEndian::write_u16(&mut self.data[4..6], level);
    }

    fn nentry(&self) -> usize {
        BigEndian::read_u16(&self.data[6..8]) as usize
    }

    fn set_nentry(&mut self, n: usize) {
        BigEndian::write_u16(&mut self.data[6..8], n as u16);
    }

    fn metasize(&self) -> usize {
        if self.flag() & FLAG_META != 0 {
            BigEndian::read_u16(&self.data[8..10]) as usize
        } else {
            0
        }
    }

    fn meta(&self) -> &[u8] {
        if self.flag() & FLAG_META != 0 {
            let len = self.metasize();
            &self.data[10..10 + len]
        } else {
            &[]
        }
    }

    fn kv_offset(&self) -> usize {
        if self.flag() & FLAG_META != 0 {
            BNODE_HDR_SIZE + 2 + self.metasize()
        } else {
            BNODE_HDR_SIZE
        }
    }
}

struct Locate {
    exact: Option<usize>,
    insert: usize,
    /// Largest entry `<=` the key.
    le: Option<usize>,
}

pub struct BTree {
    pub root_bid: Bid,
    pub ksize: u8,
    pub vsize: u8,
    pub height: u16,
    format: KeyFormat,
    cmp: Option<KeyCmpFn>,
}

struct RecOut {
    bid: Bid,
    split: Option<(Vec<u8>, Bid)>,
    meta: Option<Vec<u8>>,
    left_first: Option<Vec<u8>>,
}

struct RemoveOut {
    bid: Bid,
    emptied: bool,
}

impl BTree {
    /// Create a tree with a fresh root (leaf) node carrying `meta`.
    pub fn new<F: FileBlocks>(
        blk: &mut BtreeBlkHandle<F>,
        ksize: u8,
        vsize: u8,
        format: KeyFormat,
        cmp: Option<KeyCmpFn>,
        meta: &[u8],
    ) -> Result<BTree> {
        assert_eq!(vsize as usize, 8);
        let required = BNODE_HDR_SIZE + if meta.is_empty() { 0 } else { 2 + meta.len() };
        if required > blk.max_section_size() {
            return Err(TrieError::Fail);
        }

        let mut bid = blk.alloc_sub()?;
        if blk.section_size(bid) < required {
            bid = blk.enlarge(bid, required)?;
        }

        let mut node = Node::new(blk.section_size(bid));
        node.set_kvsize(ksize, vsize);
        node.set_level(1);
        node.set_nentry(0);
        if meta.is_empty() {
            node.set_flag(FLAG_ROOT);
        } else {
            node.set_flag(FLAG_ROOT | FLAG_META);
            BigEndian::write_u16(&mut node.data[8..10], meta.len() as u16);
            node.data[10..10 + meta.len()].copy_from_slice(meta);
        }
        blk.write_from(bid, &node.data)?;

        Ok(BTree {
            root_bid: bid,
            ksize,
            vsize,
            height: 1,
            format,
            cmp,
        })
    }

    /// Attach to an existing tree; key/value widths and height come from
    /// the root node header.
    pub fn open<F: FileBlocks>(blk: &mut BtreeBlkHandle<F>, root_bid: Bid) -> Result<BTree> {
        let mut data = vec![0u8; blk.section_size(root_bid)];
        blk.read_into(root_bid, &mut data)?;
        let node = Node { data };
        Ok(BTree {
            root_bid,
            ksize: node.ksize(),
            vsize: node.vsize(),
            height: node.level(),
            format: KeyFormat::Fixed,
            cmp: None,
        })
    }

    /// Switch to the variable-key entry layout (leaf trees).
    pub fn set_var_key_mode(&mut self, cmp: Option<KeyCmpFn>) {
        self.format = KeyFormat::Var;
        self.cmp = cmp;
    }

    fn keycmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.cmp {
            Some(f) => f(a, b),
            None => bytes_cmp(a, b),
        }
    }

    fn read_node<F: FileBlocks>(&self, blk: &mut BtreeBlkHandle<F>, bid: Bid) -> Result<Node> {
        let mut data = vec![0u8; blk.section_size(bid)];
        blk.read_into(bid, &mut data)?;
        Ok(Node { data })
    }

    fn ensure_writable<F: FileBlocks>(
        &self,
        blk: &mut BtreeBlkHandle<F>,
        bid: Bid,
    ) -> Result<Bid> {
        if blk.is_writable(bid) {
            Ok(bid)
        } else {
            blk.move_node(bid)
        }
    }

    // ---- entry layout -------------------------------------------------

    fn entry_size(&self, key: &[u8]) -> usize {
        match self.format {
            KeyFormat::Fixed => self.ksize as usize + self.vsize as usize,
            KeyFormat::Var => 2 + key.len() + self.vsize as usize,
        }
    }

    /// Byte offset of entry `idx` within the node.
    fn entry_offset(&self, node: &Node, idx: usize) -> usize {
        match self.format {
            KeyFormat::Fixed => {
                node.kv_offset() + idx * (self.ksize as usize + self.vsize as usize)
            }
            KeyFormat::Var => {
                let mut off = node.kv_offset();
                for _ in 0..idx {
                    let klen = BigEndian::read_u16(&node.data[off..off + 2]) as usize;
                    off += 2 + klen + self.vsize as usize;
                }
                off
            }
        }
    }

    fn entry<'n>(&self, node: &'n Node, idx: usize) -> (&'n [u8], &'n [u8]) {
        let off = self.entry_offset(node, idx);
        match self.format {
            KeyFormat::Fixed => {
                let k = &node.data[off..off + self.ksize as usize];
                let v = &node.data
                    [off + self.ksize as usize..off + self.ksize as usize + self.vsize as usize];
                (k, v)
            }
            KeyFormat::Var => {
                let klen = BigEndian::read_u16(&node.data[off..off + 2]) as usize;
                let k = &node.data[off + 2..off + 2 + klen];
                let v = &node.data[off + 2 + klen..off + 2 + klen + self.vsize as usize];
                (k, v)
            }
        }
    }

    fn used_bytes(&self, node: &Node) -> usize {
        self.entry_offset(node, node.nentry())
    }

    // TODO: binary search for the fixed-key format; nodes are wide and the
    // scan shows up in deep-tree profiles.
    fn locate(&self, node: &Node, key: &[u8]) -> Locate {
        let n = node.nentry();
        for i in 0..n {
            let (k, _) = self.entry(node, i);
            match self.keycmp(k, key) {
                Ordering::Equal => {
                    return Locate {
                        exact: Some(i),
                        insert: i,
                        le: Some(i),
                    }
                }
                Ordering::Greater => {
                    return Locate {
                        exact: None,
                        insert: i,
                        le: if i > 0 { Some(i - 1) } else { None },
                    }
                }
                Ordering::Less => {}
            }
        }
        Locate {
            exact: None,
            insert: n,
            le: if n > 0 { Some(n - 1) } else { None },
        }
    }

    fn fits(&self, node: &Node, key: &[u8]) -> bool {
        self.used_bytes(node) + self.entry_size(key) <= node.cap()
    }

    fn insert_entry(&self, node: &mut Node, idx: usize, key: &[u8], value: &[u8]) {
        debug_assert!(self.fits(node, key));
        let off = self.entry_offset(node, idx);
        let used = self.used_bytes(node);
        let esize = self.entry_size(key);
        node.data.copy_within(off..used, off + esize);
        match self.format {
            KeyFormat::Fixed => {
                node.data[off..off + key.len()].copy_from_slice(key);
                node.data[off + self.ksize as usize..off + self.ksize as usize + value.len()]
                    .copy_from_slice(value);
            }
            KeyFormat::Var => {
                BigEndian::write_u16(&mut node.data[off..off + 2], key.len() as u16);
                node.data[off + 2..off + 2 + key.len()].copy_from_slice(key);
                node.data[off + 2 + key.len()..off + 2 + key.len() + value.len()]
                    .copy_from_slice(value);
            }
        }
        node.set_nentry(node.nentry() + 1);
    }

    fn remove_entry(&self, node: &mut Node, idx: usize) {
        let off = self.entry_offset(node, idx);
        let next = self.entry_offset(node, idx + 1);
        let used = self.used_bytes(node);
        node.data.copy_within(next..used, off);
        node.set_nentry(node.nentry() - 1);
    }

    fn replace_value(&self, node: &mut Node, idx: usize, value: &[u8]) {
        let off = self.entry_offset(node, idx);
        let voff = match self.format {
            KeyFormat::Fixed => off + self.ksize as usize,
            KeyFormat::Var => {
                let klen = BigEndian::read_u16(&node.data[off..off + 2]) as usize;
                off + 2 + klen
            }
        };
        node.data[voff..voff + value.len()].copy_from_slice(value);
    }

    /// Detach the metadata section, repacking the entry area. Returns the
    /// old metadata.
    fn strip_meta(&self, node: &mut Node) -> Vec<u8> {
        if node.flag() & FLAG_META == 0 {
            return Vec::new();
        }
        let meta = node.meta().to_vec();
        let old_off = node.kv_offset();
        let used = self.used_bytes(node);
        node.data.copy_within(old_off..used, BNODE_HDR_SIZE);
        node.set_flag(node.flag() & !FLAG_META);
        meta
    }

    /// Attach (or replace) the metadata section, repacking the entry area.
    /// The caller guarantees the result fits.
    fn put_meta(&self, node: &mut Node, meta: &[u8]) {
        let _ = self.strip_meta(node);
        if meta.is_empty() {
            return;
        }
        let used = self.used_bytes(node);
        let new_off = BNODE_HDR_SIZE + 2 + meta.len();
        node.data.copy_within(BNODE_HDR_SIZE..used, new_off);
        node.set_flag(node.flag() | FLAG_META);
        BigEndian::write_u16(&mut node.data[8..10], meta.len() as u16);
        node.data[10..10 + meta.len()].copy_from_slice(meta);
    }

    // ---- metadata -----------------------------------------------------

    pub fn read_meta<F: FileBlocks>(&self, blk: &mut BtreeBlkHandle<F>) -> Result<Vec<u8>> {
        let node = self.read_node(blk, self.root_bid)?;
        Ok(node.meta().to_vec())
    }

    pub fn update_meta<F: FileBlocks>(
        &mut self,
        blk: &mut BtreeBlkHandle<F>,
        meta: &[u8],
    ) -> Result<()> {
        let mut bid = self.ensure_writable(blk, self.root_bid)?;
        let mut node = self.read_node(blk, bid)?;
        let required = self.used_bytes(&node) - node.kv_offset()
            + BNODE_HDR_SIZE
            + if meta.is_empty() { 0 } else { 2 + meta.len() };
        if required > node.cap() {
            if required > blk.max_section_size() {
                return Err(TrieError::Fail);
            }
            bid = blk.enlarge(bid, required)?;
            node = self.read_node(blk, bid)?;
        }
        self.put_meta(&mut node, meta);
        blk.write_from(bid, &node.data)?;
        self.root_bid = bid;
        Ok(())
    }

    /// Entry count of the root node (callers use this on single-level
    /// trees to detect emptiness).
    pub fn root_entries<F: FileBlocks>(&self, blk: &mut BtreeBlkHandle<F>) -> Result<usize> {
        let node = self.read_node(blk, self.root_bid)?;
        Ok(node.nentry())
    }

    // ---- point lookup -------------------------------------------------

    pub fn find<F: FileBlocks>(
        &self,
        blk: &mut BtreeBlkHandle<F>,
        key: &[u8],
        value_out: &mut [u8],
    ) -> Result<()> {
        let mut bid = self.root_bid;
        loop {
            let node = self.read_node(blk, bid)?;
            let loc = self.locate(&node, key);
            if node.level() == 1 {
                match loc.exact {
                    Some(i) => {
                        let (_, v) = self.entry(&node, i);
                        value_out.copy_from_slice(v);
                        return Ok(());
                    }
                    None => return Err(TrieError::NotFound),
                }
            }
            if node.nentry() == 0 {
                return Err(TrieError::NotFound);
            }
            // keys below the leftmost separator can only live under child 0
            let idx = loc.le.unwrap_or(0);
            let (_, v) = self.entry(&node, idx);
            bid = BigEndian::read_u64(v);
        }
    }

    // ---- insert -------------------------------------------------------

    pub fn insert<F: FileBlocks>(
        &mut self,
        blk: &mut BtreeBlkHandle<F>,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        debug_assert_eq!(value.len(), self.vsize as usize);
        let out = self.insert_rec(blk, self.root_bid, key, value)?;

        if let Some((right_key, right_bid)) = out.split {
            // root split: hoist a new root carrying the old metadata
            let left_first = out.left_first.expect("split root without first key");
            let meta = out.meta.unwrap_or_default();
            let mut right_val = [0u8; 8];
            BigEndian::write_u64(&mut right_val, right_bid);
            let mut left_val = [0u8; 8];
            BigEndian::write_u64(&mut left_val, out.bid);

            let required = BNODE_HDR_SIZE
                + if meta.is_empty() { 0 } else { 2 + meta.len() }
                + self.entry_size(&left_first)
                + self.entry_size(&right_key);
            let mut bid = blk.alloc_sub()?;
            if blk.section_size(bid) < required {
                bid = blk.enlarge(bid, required)?;
            }
            let mut node = Node::new(blk.section_size(bid));
            node.set_kvsize(self.ksize, self.vsize);
            node.set_level(self.height + 1);
            node.set_nentry(0);
            node.set_flag(FLAG_ROOT);
            self.put_meta(&mut node, &meta);
            self.insert_entry(&mut node, 0, &left_first, &left_val);
            self.insert_entry(&mut node, 1, &right_key, &right_val);
            blk.write_from(bid, &node.data)?;

            debug!(
                "btree root split, new root {} at height {}",
                bid,
                self.height + 1
            );
            self.root_bid = bid;
            self.height += 1;
        } else {
            self.root_bid = out.bid;
        }
        Ok(())
    }

    fn insert_rec<F: FileBlocks>(
        &self,
        blk: &mut BtreeBlkHandle<F>,
        bid: Bid,
        key: &[u8],
        value: &[u8],
    ) -> Result<RecOut> {
        let node = self.read_node(blk, bid)?;

        if node.level() == 1 {
            let loc = self.locate(&node, key);
            let new_bid = self.ensure_writable(blk, bid)?;
            let mut node = if new_bid == bid {
                node
            } else {
                self.read_node(blk, new_bid)?
            };
            if let Some(i) = loc.exact {
                self.replace_value(&mut node, i, value);
                blk.write_from(new_bid, &node.data)?;
                return Ok(RecOut {
                    bid: new_bid,
                    split: None,
                    meta: None,
                    left_first: None,
                });
            }
            return self.insert_into(blk, new_bid, node, loc.insert, key, value);
        }

        if node.nentry() == 0 {
            return Err(TrieError::IndexCorrupted);
        }
        let loc = self.locate(&node, key);
        let child_idx = loc.le.unwrap_or(0);
        let (_, v) = self.entry(&node, child_idx);
        let child_bid = BigEndian::read_u64(v);

        let child_out = self.insert_rec(blk, child_bid, key, value)?;
        debug_assert!(child_out.meta.is_none());

        let new_bid = self.ensure_writable(blk, bid)?;
        let mut node = self.read_node(blk, new_bid)?;
        if child_out.bid != child_bid {
            let mut val = [0u8; 8];
            BigEndian::write_u64(&mut val, child_out.bid);
            self.replace_value(&mut node, child_idx, &val);
        }

        if let Some((rkey, rbid)) = child_out.split {
            let mut val = [0u8; 8];
            BigEndian::write_u64(&mut val, rbid);
            return self.insert_into(blk, new_bid, node, child_idx + 1, &rkey, &val);
        }

        blk.write_from(new_bid, &node.data)?;
        Ok(RecOut {
            bid: new_bid,
            split: None,
            meta: None,
            left_first: None,
        })
    }

    /// Insert an entry at a known position, growing the node through the
    /// sub-block ladder and splitting once it is a full whole block.
    fn insert_into<F: FileBlocks>(
        &self,
        blk: &mut BtreeBlkHandle<F>,
        mut bid: Bid,
        mut node: Node,
        idx: usize,
        key: &[u8],
        value: &[u8],
    ) -> Result<RecOut> {
        if BNODE_HDR_SIZE + self.entry_size(key) > blk.max_section_size() {
            // a single entry that cannot fit any node
            return Err(TrieError::Fail);
        }
        if !self.fits(&node, key) && node.cap() < blk.max_section_size() {
            let required = self.used_bytes(&node) + self.entry_size(key);
            bid = blk.enlarge(bid, required.min(blk.max_section_size()))?;
            let grown = self.read_node(blk, bid)?;
            // the enlarged section keeps the old image as a prefix
            debug_assert_le!(node.cap(), grown.cap());
            node = grown;
        }

        if self.fits(&node, key) {
            self.insert_entry(&mut node, idx, key, value);
            blk.write_from(bid, &node.data)?;
            return Ok(RecOut {
                bid,
                split: None,
                meta: None,
                left_first: None,
            });
        }

        // split: the node is a full whole block
        let was_root = node.flag() & FLAG_ROOT != 0;
        let meta = self.strip_meta(&mut node);
        node.set_flag(0);

        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(node.nentry() + 1);
        for i in 0..node.nentry() {
            let (k, v) = self.entry(&node, i);
            entries.push((k.to_vec(), v.to_vec()));
        }
        entries.insert(idx, (key.to_vec(), value.to_vec()));

        let total: usize = entries.iter().map(|(k, _)| self.entry_size(k)).sum();
        let mut acc = 0usize;
        let mut split_at = entries.len() - 1;
        for (i, (k, _)) in entries.iter().enumerate() {
            acc += self.entry_size(k);
            if acc >= total / 2 {
                split_at = (i + 1).min(entries.len() - 1);
                break;
            }
        }

        let level = node.level();
        let left_first = entries[0].0.clone();
        let right_first = entries[split_at].0.clone();

        let mut left = Node::new(node.cap());
        left.set_kvsize(self.ksize, self.vsize);
        left.set_level(level);
        left.set_flag(0);
        left.set_nentry(0);
        for (i, (k, v)) in entries[..split_at].iter().enumerate() {
            self.insert_entry(&mut left, i, k, v);
        }

        let right_bid = blk.alloc()?;
        let mut right = Node::new(blk.section_size(right_bid));
        right.set_kvsize(self.ksize, self.vsize);
        right.set_level(level);
        right.set_flag(0);
        right.set_nentry(0);
        for (i, (k, v)) in entries[split_at..].iter().enumerate() {
            self.insert_entry(&mut right, i, k, v);
        }

        blk.write_from(bid, &left.data)?;
        blk.write_from(right_bid, &right.data)?;
        debug!(
            "btree node {} split at entry {} -> {}",
            bid, split_at, right_bid
        );

        Ok(RecOut {
            bid,
            split: Some((right_first, right_bid)),
            meta: if was_root { Some(meta) } else { None },
            left_first: if was_root { Some(left_first) } else { None },
        })
    }

    // ---- remove -------------------------------------------------------

    pub fn remove<F: FileBlocks>(&mut self, blk: &mut BtreeBlkHandle<F>, key: &[u8]) -> Result<()> {
        let out = self.remove_rec(blk, self.root_bid, key)?;
        self.root_bid = out.bid;

        if out.emptied && self.height > 1 {
            // the whole tree drained; restart from an empty leaf root so the
            // next insert has a sane target
            let meta = self.read_meta(blk)?;
            blk.remove_node(self.root_bid);
            let fresh = BTree::new(blk, self.ksize, self.vsize, self.format, self.cmp, &meta)?;
            self.root_bid = fresh.root_bid;
            self.height = 1;
        }
        Ok(())
    }

    fn remove_rec<F: FileBlocks>(
        &self,
        blk: &mut BtreeBlkHandle<F>,
        bid: Bid,
        key: &[u8],
    ) -> Result<RemoveOut> {
        let node = self.read_node(blk, bid)?;

        if node.level() == 1 {
            let loc = self.locate(&node, key);
            let idx = match loc.exact {
                Some(i) => i,
                None => return Err(TrieError::Fail),
            };
            let new_bid = self.ensure_writable(blk, bid)?;
            let mut node = if new_bid == bid {
                node
            } else {
                self.read_node(blk, new_bid)?
            };
            self.remove_entry(&mut node, idx);
            blk.write_from(new_bid, &node.data)?;
            return Ok(RemoveOut {
                bid: new_bid,
                emptied: node.nentry() == 0,
            });
        }

        if node.nentry() == 0 {
            return Err(TrieError::Fail);
        }
        let loc = self.locate(&node, key);
        let child_idx = loc.le.unwrap_or(0);
        let (_, v) = self.entry(&node, child_idx);
        let child_bid = BigEndian::read_u64(v);

        let child_out = self.remove_rec(blk, child_bid, key)?;

        let new_bid = self.ensure_writable(blk, bid)?;
        let mut node = self.read_node(blk, new_bid)?;
        if child_out.emptied {
            self.remove_entry(&mut node, child_idx);
            blk.remove_node(child_out.bid);
        } else if child_out.bid != child_bid {
            let mut val = [0u8; 8];
            BigEndian::write_u64(&mut val, child_out.bid);
            self.replace_value(&mut node, child_idx, &val);
        }
        blk.write_from(new_bid, &node.data)?;
        Ok(RemoveOut {
            bid: new_bid,
            emptied: node.nentry() == 0,
        })
    }

    // ---- iteration ----------------------------------------------------

    fn descend_ge<F: FileBlocks>(
        &self,
        blk: &mut BtreeBlkHandle<F>,
        bid: Bid,
        bound: Option<(&[u8], bool)>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let node = self.read_node(blk, bid)?;
        if node.level() == 1 {
            for i in 0..node.nentry() {
                let (k, v) = self.entry(&node, i);
                let take = match bound {
                    None => true,
                    Some((b, incl)) => match self.keycmp(k, b) {
                        Ordering::Greater => true,
                        Ordering::Equal => incl,
                        Ordering::Less => false,
                    },
                };
                if take {
                    return Ok(Some((k.to_vec(), v.to_vec())));
                }
            }
            return Ok(None);
        }

        let start = match bound {
            None => 0,
            Some((b, _)) => self.locate(&node, b).le.unwrap_or(0),
        };
        for i in start..node.nentry() {
            let (_, v) = self.entry(&node, i);
            let child = BigEndian::read_u64(v);
            let sub_bound = if i == start { bound } else { None };
            if let Some(found) = self.descend_ge(blk, child, sub_bound)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    fn descend_le<F: FileBlocks>(
        &self,
        blk: &mut BtreeBlkHandle<F>,
        bid: Bid,
        bound: Option<(&[u8], bool)>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let node = self.read_node(blk, bid)?;
        if node.level() == 1 {
            for i in (0..node.nentry()).rev() {
                let (k, v) = self.entry(&node, i);
                let take = match bound {
                    None => true,
                    Some((b, incl)) => match self.keycmp(k, b) {
                        Ordering::Less => true,
                        Ordering::Equal => incl,
                        Ordering::Greater => false,
                    },
                };
                if take {
                    return Ok(Some((k.to_vec(), v.to_vec())));
                }
            }
            return Ok(None);
        }

        if node.nentry() == 0 {
            return Ok(None);
        }
        let end = match bound {
            None => node.nentry() - 1,
            Some((b, _)) => self.locate(&node, b).le.unwrap_or(0),
        };
        for i in (0..=end).rev() {
            let (_, v) = self.entry(&node, i);
            let child = BigEndian::read_u64(v);
            let sub_bound = if i == end { bound } else { None };
            if let Some(found) = self.descend_le(blk, child, sub_bound)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    pub fn iterator(&self, seek: SeekKey) -> BTreeIterator {
        BTreeIterator { seek, cursor: None }
    }
}

#[derive(Clone)]
pub enum SeekKey {
    Min,
    Max,
    Key(Vec<u8>),
}

/// Seek-based cursor: each step re-descends from the root, so the cursor
/// stays valid across the flush barrier. `next` yields entries at or above
/// the seek key in ascending order; `prev` mirrors it downward.
pub struct BTreeIterator {
    seek: SeekKey,
    cursor: Option<Vec<u8>>,
}

impl BTreeIterator {
    pub fn next<F: FileBlocks>(
        &mut self,
        btree: &BTree,
        blk: &mut BtreeBlkHandle<F>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let found = match (&self.cursor, &self.seek) {
            (Some(c), _) => btree.descend_ge(blk, btree.root_bid, Some((c.as_slice(), false)))?,
            (None, SeekKey::Key(k)) => {
                btree.descend_ge(blk, btree.root_bid, Some((k.as_slice(), true)))?
            }
            (None, SeekKey::Min) => btree.descend_ge(blk, btree.root_bid, None)?,
            (None, SeekKey::Max) => None,
        };
        if let Some((k, _)) = &found {
            self.cursor = Some(k.clone());
        }
        Ok(found)
    }

    pub fn prev<F: FileBlocks>(
        &mut self,
        btree: &BTree,
        blk: &mut BtreeBlkHandle<F>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let found = match (&self.cursor, &self.seek) {
            (Some(c), _) => btree.descend_le(blk, btree.root_bid, Some((c.as_slice(), false)))?,
            (None, SeekKey::Key(k)) => {
                btree.descend_le(blk, btree.root_bid, Some((k.as_slice(), true)))?
            }
            (None, SeekKey::Max) => btree.descend_le(blk, btree.root_bid, None)?,
            (None, SeekKey::Min) => None,
        };
        if let Some((k, _)) = &found {
            self.cursor = Some(k.clone());
        }
        Ok(found)
    }
}

/// Streamed bottom-up build from `n` pre-sorted pairs. Leaves fill left to
/// right; each finished block is handed to `write_done` so the handle can
/// release it. Metadata and the root flag land on the top node.
pub fn init_and_load<F: FileBlocks>(
    blk: &mut BtreeBlkHandle<F>,
    ksize: u8,
    vsize: u8,
    format: KeyFormat,
    meta: &[u8],
    n: u64,
    mut next_kv: impl FnMut(u64) -> (Vec<u8>, Vec<u8>),
) -> Result<BTree> {
    assert!(n > 0);
    let mut tree = BTree {
        root_bid: BLK_NOT_FOUND,
        ksize,
        vsize,
        height: 1,
        format,
        cmp: None,
    };

    // leaf level
    let mut records: Vec<(Vec<u8>, Bid)> = Vec::new();
    let mut node = new_level_node(blk, &tree, 1);
    let mut first_key: Option<Vec<u8>> = None;
    for i in 0..n {
        let (k, v) = next_kv(i);
        debug_assert_eq!(v.len(), vsize as usize);
        if !tree.fits(&node, &k) {
            let bid = flush_level_node(blk, node)?;
            records.push((first_key.take().unwrap(), bid));
            node = new_level_node(blk, &tree, 1);
        }
        if first_key.is_none() {
            first_key = Some(k.clone());
        }
        let idx = node.nentry();
        tree.insert_entry(&mut node, idx, &k, &v);
    }

    let mut level = 1u16;
    loop {
        if records.is_empty() {
            // `node` is the root; give it the metadata and a right-sized home
            let required = tree.used_bytes(&node) - node.kv_offset()
                + BNODE_HDR_SIZE
                + if meta.is_empty() { 0 } else { 2 + meta.len() };
            if required > blk.max_section_size() {
                return Err(TrieError::Fail);
            }
            let mut bid = blk.alloc_sub()?;
            if blk.section_size(bid) < required {
                bid = blk.enlarge(bid, required)?;
            }
            let mut root = Node::new(blk.section_size(bid));
            let keep = node.data.len().min(root.data.len());
            root.data[..keep].copy_from_slice(&node.data[..keep]);
            root.set_flag(FLAG_ROOT);
            tree.put_meta(&mut root, meta);
            blk.write_from(bid, &root.data)?;
            tree.root_bid = bid;
            tree.height = level;
            return Ok(tree);
        }

        // close the trailing node of the finished level
        let bid = flush_level_node(blk, node)?;
        records.push((first_key.take().unwrap(), bid));

        // build the next level up from the collected records
        level += 1;
        let lower = std::mem::take(&mut records);
        node = new_level_node(blk, &tree, level);
        for (k, child) in lower {
            let mut val = [0u8; 8];
            BigEndian::write_u64(&mut val, child);
            if !tree.fits(&node, &k) {
                let bid = flush_level_node(blk, node)?;
                records.push((first_key.take().unwrap(), bid));
                node = new_level_node(blk, &tree, level);
            }
            if first_key.is_none() {
                first_key = Some(k.clone());
            }
            let idx = node.nentry();
            tree.insert_entry(&mut node, idx, &k, &val);
        }
    }
}

fn new_level_node<F: FileBlocks>(blk: &BtreeBlkHandle<F>, tree: &BTree, level: u16) -> Node {
    let mut node = Node::new(blk.max_section_size());
    node.set_kvsize(tree.ksize, tree.vsize);
    node.set_level(level);
    node.set_flag(0);
    node.set_nentry(0);
    node
}

fn flush_level_node<F: FileBlocks>(blk: &mut BtreeBlkHandle<F>, node: Node) -> Result<Bid> {
    let bid = blk.alloc()?;
    blk.write_from(bid, &node.data)?;
    blk.write_done(bid)?;
    Ok(bid)
}
