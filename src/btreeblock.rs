use crate::address::*;
use crate::block_file::*;
use crate::types::*;

use log::{debug, error};
use more_asserts::debug_assert_le;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::BTreeMap;

/// Block-sized buffer with sector/page alignment, allocated through the
/// global allocator with an explicit layout.
pub struct AlignedBuf {
    ptr: *mut u8,
    layout: Layout,
}

impl AlignedBuf {
    fn new(size: usize, align: usize) -> AlignedBuf {
        let layout = Layout::from_size_align(size, align).expect("bad buffer layout");
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "aligned block buffer allocation failed");
        AlignedBuf { ptr, layout }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.layout.size()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.layout.size()) }
    }

    fn zero(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

fn pool_align(blocksize: usize) -> usize {
    let page = sysconf::page::pagesize();
    if blocksize % page == 0 {
        page
    } else {
        SECTOR_SIZE
    }
}

/// Free-list of aligned block buffers, one pool per handle.
pub struct BufferPool {
    free: Vec<AlignedBuf>,
    size: usize,
    align: usize,
}

impl BufferPool {
    fn new(blocksize: usize) -> BufferPool {
        BufferPool {
            free: Vec::new(),
            size: blocksize,
            align: pool_align(blocksize),
        }
    }

    fn get(&mut self) -> AlignedBuf {
        match self.free.pop() {
            Some(buf) => buf,
            None => AlignedBuf::new(self.size, self.align),
        }
    }

    fn put(&mut self, buf: AlignedBuf) {
        debug_assert_eq!(buf.layout.size(), self.size);
        self.free.push(buf);
    }
}

/// One cached file block. `pos` is the in-block offset of the next node
/// allocation; a full block has `pos == blocksize`.
struct CacheBlock {
    bid: Bid, // file bid
    pos: u32,
    dirty: bool,
    age: u8,
    sb_class: Option<usize>,
    buf: AlignedBuf,
}

struct SubblockClass {
    bid: Bid, // untagged node bid of the current packing block
    size: u32,
    nblocks: usize,
    bitmap: Vec<bool>,
}

impl SubblockClass {
    fn free_slot(&self) -> Option<usize> {
        self.bitmap.iter().position(|b| !b)
    }

    fn occupied(&self) -> usize {
        self.bitmap.iter().filter(|b| **b).count()
    }
}

/// Staging layer between in-memory B+-tree nodes and the block file.
///
/// Node bids are file bids scaled by nodes-per-block; sub-block bids add a
/// `(class, slot)` tag in the high bytes (see `address`). Two lists back
/// the cache: the allocation list (blocks carved out since the last flush;
/// the tail is the current allocation target) and a bid-indexed read list
/// whose entries age toward eviction.
pub struct BtreeBlkHandle<F: FileBlocks> {
    file: F,
    nodesize: u32,
    nnodeperblock: u32,
    blocksize: u32,
    nlivenodes: i64,
    ndeltanodes: i64,
    alc_list: Vec<CacheBlock>,
    read_list: BTreeMap<Bid, CacheBlock>,
    pool: BufferPool,
    sub: Vec<SubblockClass>,
    dirty_reader: Option<DirtyTag>,
    dirty_writer: Option<DirtyTag>,
}

impl<F: FileBlocks> BtreeBlkHandle<F> {
    pub fn new(file: F, nodesize: u32) -> BtreeBlkHandle<F> {
        let blocksize = file.blocksize() as u32;
        assert!(nodesize >= MIN_SUBBLOCK_SIZE && nodesize <= blocksize);
        assert_eq!(blocksize % nodesize, 0);

        // sub-block classes: 128, 256, ... while smaller than the node size
        let mut sub = Vec::new();
        let mut size = MIN_SUBBLOCK_SIZE;
        while size < nodesize && sub.len() < MAX_SUBBLOCK_CLASSES {
            let nblocks = (nodesize / size) as usize;
            sub.push(SubblockClass {
                bid: BLK_NOT_FOUND,
                size,
                nblocks,
                bitmap: vec![false; nblocks],
            });
            size <<= 1;
        }

        BtreeBlkHandle {
            pool: BufferPool::new(blocksize as usize),
            file,
            nodesize,
            nnodeperblock: blocksize / nodesize,
            blocksize,
            nlivenodes: 0,
            ndeltanodes: 0,
            alc_list: Vec::new(),
            read_list: BTreeMap::new(),
            sub,
            dirty_reader: None,
            dirty_writer: None,
        }
    }

    pub fn nodesize(&self) -> u32 {
        self.nodesize
    }

    pub fn live_nodes(&self) -> i64 {
        self.nlivenodes
    }

    pub fn delta_nodes(&self) -> i64 {
        self.ndeltanodes
    }

    pub fn file(&self) -> &F {
        &self.file
    }

    pub fn file_mut(&mut self) -> &mut F {
        &mut self.file
    }

    pub fn set_dirty_update(&mut self, reader: Option<DirtyTag>, writer: Option<DirtyTag>) {
        self.dirty_reader = reader;
        self.dirty_writer = writer;
    }

    pub fn clear_dirty_update(&mut self) {
        self.dirty_reader = None;
        self.dirty_writer = None;
    }

    /// Usable bytes of the node behind `bid`: its sub-block class size, or
    /// the node size minus the marker footer for a whole block.
    pub fn section_size(&self, bid: Bid) -> usize {
        if is_subblock(bid) && bid != BLK_NOT_FOUND {
            let (_, class, _) = decode_subblock(bid);
            self.sub[class].size as usize
        } else {
            self.nodesize as usize - BLK_MARKER_SIZE
        }
    }

    pub fn max_section_size(&self) -> usize {
        self.nodesize as usize - BLK_MARKER_SIZE
    }

    /// (file bid, byte offset within the block, region length)
    fn region(&self, bid: Bid) -> (Bid, usize, usize) {
        if is_subblock(bid) {
            let (bbid, class, slot) = decode_subblock(bid);
            let filebid = bbid / self.nnodeperblock as u64;
            let off = (bbid % self.nnodeperblock as u64) as usize * self.nodesize as usize
                + slot * self.sub[class].size as usize;
            (filebid, off, self.sub[class].size as usize)
        } else {
            let filebid = bid / self.nnodeperblock as u64;
            let off = (bid % self.nnodeperblock as u64) as usize * self.nodesize as usize;
            (filebid, off, self.nodesize as usize)
        }
    }

    fn sb_class_of(bid: Bid) -> Option<usize> {
        if is_subblock(bid) {
            Some(decode_subblock(bid).1)
        } else {
            None
        }
    }

    fn cached_mut(&mut self, filebid: Bid) -> Option<&mut CacheBlock> {
        if let Some(i) = self.alc_list.iter().position(|b| b.bid == filebid) {
            return Some(&mut self.alc_list[i]);
        }
        self.read_list.get_mut(&filebid)
    }

    /// Make sure the file block is in one of the lists, reading it through
    /// the dirty-update session if one is pinned.
    fn ensure_cached(&mut self, filebid: Bid, sb_class: Option<usize>) -> Result<()> {
        if let Some(block) = self.cached_mut(filebid) {
            block.age = 0;
            return Ok(());
        }

        let mut buf = self.pool.get();
        let res = if self.dirty_reader.is_some() || self.dirty_writer.is_some() {
            self.file
                .read_dirty(filebid, buf.as_mut_slice(), self.dirty_reader, self.dirty_writer)
        } else {
            self.file.read(filebid, buf.as_mut_slice())
        };
        if let Err(e) = res {
            error!("failed to read b+tree block {}: {}", filebid, e);
            self.pool.put(buf);
            return Err(e);
        }

        self.read_list.insert(
            filebid,
            CacheBlock {
                bid: filebid,
                pos: self.blocksize,
                dirty: false,
                age: 0,
                sb_class,
                buf,
            },
        );
        Ok(())
    }

    /// Copy the node bytes behind `bid` into `out` (`section_size` long).
    pub fn read_into(&mut self, bid: Bid, out: &mut [u8]) -> Result<()> {
        let (filebid, off, _) = self.region(bid);
        debug_assert_le!(out.len(), self.blocksize as usize - off);
        self.ensure_cached(filebid, Self::sb_class_of(bid))?;
        let block = self.cached_mut(filebid).unwrap();
        block.age = 0;
        out.copy_from_slice(&block.buf.as_slice()[off..off + out.len()]);
        Ok(())
    }

    /// Write node bytes back behind `bid`, marking the cached block dirty
    /// when it lives on the read list.
    pub fn write_from(&mut self, bid: Bid, data: &[u8]) -> Result<()> {
        let (filebid, off, len) = self.region(bid);
        debug_assert_le!(data.len(), len);
        self.ensure_cached(filebid, Self::sb_class_of(bid))?;
        let in_read_list = self.read_list.contains_key(&filebid);
        let block = self.cached_mut(filebid).unwrap();
        block.age = 0;
        block.buf.as_mut_slice()[off..off + data.len()].copy_from_slice(data);
        if in_read_list {
            block.dirty = true;
        }
        Ok(())
    }

    fn alloc_ex(&mut self, sb_class: Option<usize>) -> Result<Bid> {
        // reuse the tail of the allocation list while it has room
        if sb_class.is_none() {
            if let Some(tail) = self.alc_list.last() {
                if tail.pos + self.nodesize <= self.blocksize && self.file.is_writable(tail.bid) {
                    let tail = self.alc_list.last_mut().unwrap();
                    let cur = tail.pos;
                    tail.pos += self.nodesize;
                    tail.buf.as_mut_slice()[(cur + self.nodesize) as usize - BLK_MARKER_SIZE] =
                        BLK_MARKER_BNODE;
                    let bid = tail.bid * self.nnodeperblock as u64
                        + (cur / self.nodesize) as u64;
                    return Ok(bid);
                }
            }
        }

        let mut buf = self.pool.get();
        if sb_class.is_some() {
            // sub-block container: zero-filled so that free regions are
            // distinguishable from allocated ones
            buf.zero();
        } else {
            buf.as_mut_slice()[self.nodesize as usize - BLK_MARKER_SIZE] = BLK_MARKER_BNODE;
        }

        let filebid = self.file.alloc();
        // An allocated-but-unflushed block would otherwise be read back as
        // garbage; pre-write a sentinel at the block's last byte.
        self.file
            .write_offset(filebid, self.blocksize as usize - 1, &[BLK_MARKER_BNODE])?;

        self.alc_list.push(CacheBlock {
            bid: filebid,
            pos: self.nodesize,
            dirty: true,
            age: 0,
            sb_class,
            buf,
        });
        self.nlivenodes += 1;
        self.ndeltanodes += 1;

        Ok(filebid * self.nnodeperblock as u64)
    }

    /// Allocate a whole node, preferring the tail of the allocation list.
    pub fn alloc(&mut self) -> Result<Bid> {
        self.alloc_ex(None)
    }

    /// Allocate a slot in the smallest sub-block class.
    pub fn alloc_sub(&mut self) -> Result<Bid> {
        if self.sub.is_empty() {
            return self.alloc();
        }

        if self.sub[0].bid != BLK_NOT_FOUND {
            let container = self.sub[0].bid;
            let filebid = container / self.nnodeperblock as u64;
            if self.file.is_writable(filebid) {
                if let Some(slot) = self.sub[0].free_slot() {
                    self.sub[0].bitmap[slot] = true;
                    self.ensure_cached(filebid, Some(0))?;
                    self.set_dirty(container);
                    return Ok(encode_subblock(container, 0, slot));
                }
            } else {
                // the old packing block is frozen; its unused slots are garbage now
                self.stale_unused_slots(0);
            }
        }

        let bid = self.alloc_ex(Some(0))?;
        self.sub[0].bid = bid;
        self.sub[0].bitmap.fill(false);
        self.sub[0].bitmap[0] = true;
        Ok(encode_subblock(bid, 0, 0))
    }

    fn stale_unused_slots(&mut self, class: usize) {
        let bid = self.sub[class].bid;
        if bid == BLK_NOT_FOUND {
            return;
        }
        let size = self.sub[class].size as usize;
        for slot in 0..self.sub[class].nblocks {
            if !self.sub[class].bitmap[slot] {
                self.file
                    .add_stale_block(bid * self.nodesize as u64 + (slot * size) as u64, size);
            }
        }
    }

    /// Move a node's single sub-block payload to a class large enough for
    /// `req_size` (or to a whole block if no class fits).
    pub fn enlarge(&mut self, old_bid: Bid, req_size: usize) -> Result<Bid> {
        if !is_subblock(old_bid) {
            return Err(TrieError::Fail);
        }
        let (src_bbid, src_class, src_idx) = decode_subblock(old_bid);
        let src_size = self.sub[src_class].size as usize;

        let dst_class = (src_class + 1..self.sub.len())
            .find(|i| self.sub[*i].size as usize > req_size);
        if dst_class.is_none() && req_size > self.max_section_size() {
            return Err(TrieError::Fail);
        }

        let src_nitems = self.sub[src_class].occupied();
        let (dst_nitems, dst_idx) = match dst_class {
            Some(dc) => (self.sub[dc].occupied(), self.sub[dc].free_slot()),
            None => (0, Some(0)),
        };

        let new_bid;
        if dst_nitems == 0 {
            let src_filebid = src_bbid / self.nnodeperblock as u64;
            if src_nitems == 1
                && src_bbid == self.sub[src_class].bid
                && self.file.is_writable(src_filebid)
            {
                // case 1: the source block has a single occupant and is
                // still writable; repurpose it in place
                self.ensure_cached(src_filebid, Some(src_class))?;
                if src_idx > 0 {
                    let (_, off, _) = self.region(src_bbid);
                    let block = self.cached_mut(src_filebid).unwrap();
                    let data = block.buf.as_mut_slice();
                    data.copy_within(
                        off + src_idx * src_size..off + (src_idx + 1) * src_size,
                        off,
                    );
                }
                if dst_class.is_none() {
                    let (_, off, len) = self.region(src_bbid);
                    let block = self.cached_mut(src_filebid).unwrap();
                    block.buf.as_mut_slice()[off + len - BLK_MARKER_SIZE] = BLK_MARKER_BNODE;
                }
                self.set_dirty(src_bbid);
                let block = self.cached_mut(src_filebid).unwrap();
                block.sb_class = dst_class;

                if let Some(dc) = dst_class {
                    self.sub[dc].bid = src_bbid;
                    self.sub[dc].bitmap.fill(false);
                    self.sub[dc].bitmap[0] = true;
                    new_bid = encode_subblock(src_bbid, dc, 0);
                } else {
                    new_bid = src_bbid;
                }
                self.sub[src_class].bid = BLK_NOT_FOUND;
                self.sub[src_class].bitmap.fill(false);
                return Ok(new_bid);
            }

            // case 2: move the payload into a fresh destination
            let mut payload = vec![0u8; src_size];
            self.read_into(old_bid, &mut payload)?;
            match dst_class {
                Some(dc) => {
                    let nb = self.alloc_ex(Some(dc))?;
                    self.sub[dc].bid = nb;
                    self.sub[dc].bitmap.fill(false);
                    self.sub[dc].bitmap[0] = true;
                    new_bid = encode_subblock(nb, dc, 0);
                    self.write_from(new_bid, &payload)?;
                }
                None => {
                    let nb = self.alloc()?;
                    new_bid = nb;
                    self.write_from(nb, &payload)?;
                }
            }
        } else {
            // case 3: destination packing block already exists
            let dc = dst_class.unwrap();
            let mut payload = vec![0u8; src_size];
            self.read_into(old_bid, &mut payload)?;

            let dst_filebid = self.sub[dc].bid / self.nnodeperblock as u64;
            if self.file.is_writable(dst_filebid) && dst_idx.is_some() {
                let slot = dst_idx.unwrap();
                let tagged = encode_subblock(self.sub[dc].bid, dc, slot);
                self.write_from(tagged, &payload)?;
                self.set_dirty(self.sub[dc].bid);
                self.sub[dc].bitmap[slot] = true;
                new_bid = tagged;
            } else {
                let nb = self.alloc_ex(Some(dc))?;
                self.sub[dc].bid = nb;
                self.sub[dc].bitmap.fill(false);
                self.sub[dc].bitmap[0] = true;
                new_bid = encode_subblock(nb, dc, 0);
                self.write_from(new_bid, &payload)?;
            }
        }

        // release the source slot
        if src_bbid == self.sub[src_class].bid {
            // still the active packing block; unused slots are staled when
            // it becomes immutable
            self.sub[src_class].bitmap[src_idx] = false;
        } else {
            self.file.add_stale_block(
                src_bbid * self.nodesize as u64 + (src_idx * src_size) as u64,
                src_size,
            );
        }

        Ok(new_bid)
    }

    /// Copy-on-write: relocate a node to a writable location and mark the
    /// old region stale.
    pub fn move_node(&mut self, bid: Bid) -> Result<Bid> {
        if !is_subblock(bid) {
            let mut payload = vec![0u8; self.nodesize as usize];
            self.read_into(bid, &mut payload)?;
            let new_bid = self.alloc()?;
            self.write_from(new_bid, &payload)?;
            self.nlivenodes -= 1;
            self.file
                .add_stale_block(bid * self.nodesize as u64, self.nodesize as usize);
            return Ok(new_bid);
        }

        let (old_bbid, class, old_slot) = decode_subblock(bid);
        let size = self.sub[class].size as usize;
        let mut payload = vec![0u8; size];
        self.read_into(bid, &mut payload)?;

        let mut slot = self.sub[class].free_slot();
        let container = self.sub[class].bid;
        let container_writable = container != BLK_NOT_FOUND
            && self.file.is_writable(container / self.nnodeperblock as u64);
        if container == BLK_NOT_FOUND || slot.is_none() || !container_writable {
            // no room in the current packing block; retire it and open a new one
            self.stale_unused_slots(class);
            let nb = self.alloc_ex(Some(class))?;
            self.nlivenodes -= 1;
            self.sub[class].bid = nb;
            self.sub[class].bitmap.fill(false);
            slot = Some(0);
        }
        let slot = slot.unwrap();
        self.sub[class].bitmap[slot] = true;
        let new_bid = encode_subblock(self.sub[class].bid, class, slot);
        self.write_from(new_bid, &payload)?;
        self.set_dirty(self.sub[class].bid);

        self.file.add_stale_block(
            old_bbid * self.nodesize as u64 + (old_slot * size) as u64,
            size,
        );
        Ok(new_bid)
    }

    /// Release a node. Clearing the last occupied slot of the current
    /// packing block invalidates the whole block.
    pub fn remove_node(&mut self, bid: Bid) {
        if is_subblock(bid) {
            let (bbid, class, slot) = decode_subblock(bid);
            if self.sub[class].bid == bbid {
                self.sub[class].bitmap[slot] = false;
                if self.sub[class].occupied() == 0 {
                    self.sub[class].bid = BLK_NOT_FOUND;
                    self.nlivenodes -= 1;
                    self.file
                        .add_stale_block(bbid * self.nodesize as u64, self.nodesize as usize);
                }
            }
        } else {
            self.nlivenodes -= 1;
            self.file
                .add_stale_block(bid * self.nodesize as u64, self.nodesize as usize);
        }
    }

    pub fn is_writable(&self, bid: Bid) -> bool {
        let filebid = untagged_bid(bid) / self.nnodeperblock as u64;
        self.file.is_writable(filebid)
    }

    pub fn set_dirty(&mut self, bid: Bid) {
        let filebid = untagged_bid(bid) / self.nnodeperblock as u64;
        if let Some(block) = self.read_list.get_mut(&filebid) {
            block.dirty = true;
        }
    }

    /// Flush barrier. Writes the allocation list (failing the whole flush
    /// on a non-writable block), demotes full blocks to the read list,
    /// writes back dirty read-list blocks, then ages and evicts.
    pub fn operation_end(&mut self) -> Result<()> {
        let mut i = 0;
        while i < self.alc_list.len() {
            let block = &self.alc_list[i];
            if !self.file.is_writable(block.bid) {
                error!("b+tree block {} became immutable before flush", block.bid);
                return Err(TrieError::write_failed("block no longer writable"));
            }
            match self.dirty_writer {
                Some(w) => self
                    .file
                    .write_dirty(block.bid, block.buf.as_slice(), w)?,
                None => self.file.write(block.bid, block.buf.as_slice())?,
            }
            if self.alc_list[i].pos + self.nodesize > self.blocksize {
                let mut block = self.alc_list.remove(i);
                block.dirty = false;
                self.read_list.insert(block.bid, block);
            } else {
                // keep the block as the allocation target
                i += 1;
            }
        }

        let mut evict = Vec::new();
        for (bid, block) in self.read_list.iter_mut() {
            if block.dirty {
                match self.dirty_writer {
                    Some(w) => self.file.write_dirty(*bid, block.buf.as_slice(), w)?,
                    None => self.file.write(*bid, block.buf.as_slice())?,
                }
                block.dirty = false;
            }
            if block.age >= BLOCK_AGE_LIMIT {
                evict.push(*bid);
            } else {
                block.age += 1;
            }
        }
        for bid in evict {
            let block = self.read_list.remove(&bid).unwrap();
            self.pool.put(block.buf);
        }
        Ok(())
    }

    /// Flush, then demote every remaining allocation-list block.
    pub fn end(&mut self) -> Result<()> {
        self.operation_end()?;
        while let Some(mut block) = self.alc_list.pop() {
            block.dirty = false;
            self.read_list.insert(block.bid, block);
        }
        Ok(())
    }

    /// Drop all read-list entries. Called before pinning a dirty-update
    /// session so no stale clean block shadows the session's view.
    pub fn discard_clean(&mut self) {
        let bids: Vec<Bid> = self.read_list.keys().copied().collect();
        for bid in bids {
            let block = self.read_list.remove(&bid).unwrap();
            self.pool.put(block.buf);
        }
    }

    /// Stale-out unused slots of every packing block and forget them.
    pub fn reset_subblock_info(&mut self) {
        for class in 0..self.sub.len() {
            self.stale_unused_slots(class);
            self.sub[class].bid = BLK_NOT_FOUND;
            self.sub[class].bitmap.fill(false);
        }
    }

    /// Bulk-load hook: persist a finished block immediately and demote it
    /// so the loader's working set stays bounded.
    pub fn write_done(&mut self, bid: Bid) -> Result<()> {
        let filebid = untagged_bid(bid) / self.nnodeperblock as u64;
        if let Some(i) = self.alc_list.iter().position(|b| b.bid == filebid) {
            let block = &self.alc_list[i];
            match self.dirty_writer {
                Some(w) => self
                    .file
                    .write_dirty(block.bid, block.buf.as_slice(), w)?,
                None => self.file.write(block.bid, block.buf.as_slice())?,
            }
            let mut block = self.alc_list.remove(i);
            block.dirty = false;
            self.read_list.insert(block.bid, block);
        } else if let Some(block) = self.read_list.get_mut(&filebid) {
            if block.dirty {
                match self.dirty_writer {
                    Some(w) => self.file.write_dirty(filebid, block.buf.as_slice(), w)?,
                    None => self.file.write(filebid, block.buf.as_slice())?,
                }
                block.dirty = false;
            }
        }
        debug!("bulk-load block {} flushed", filebid);
        Ok(())
    }
}
