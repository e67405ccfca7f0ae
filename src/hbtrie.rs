use crate::block_file::FileBlocks;
use crate::btree::{self, BTree, BTreeIterator, KeyCmpFn, KeyFormat, SeekKey};
use crate::btreeblock::BtreeBlkHandle;
use crate::chunk::*;
use crate::docio::KeyReader;
use crate::types::*;

use byteorder::{BigEndian, ByteOrder};
use log::debug;
use std::cmp::Ordering;

/// Hierarchical B+-tree trie: each level indexes one fixed-width chunk of
/// the (chunk-aligned) user key; values whose MSB is set point at the root
/// of a deeper B+-tree, values with a clear MSB are document offsets.

const CHUNK_FLAG: u16 = 0x8000;

/// Force leaf-mode (raw-remainder) trees from the root chunk on.
pub const HBTRIE_FLAG_COMPACT: u8 = 0x01;

/// Comparator resolver for leaf trees, keyed by the first chunk of a key.
pub type CmpMap = fn(&[u8]) -> Option<KeyCmpFn>;

/// A value slot with its MSB borrowed as the child/document discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrieValue {
    Doc(u64),
    ChildRoot(Bid),
}

impl TrieValue {
    pub(crate) fn decode(raw: &[u8]) -> TrieValue {
        let v = BigEndian::read_u64(raw);
        if v & (1u64 << 63) != 0 {
            TrieValue::ChildRoot(v & !(1u64 << 63))
        } else {
            TrieValue::Doc(v)
        }
    }

    pub(crate) fn encode(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        match self {
            TrieValue::Doc(offset) => BigEndian::write_u64(&mut out, *offset),
            TrieValue::ChildRoot(bid) => BigEndian::write_u64(&mut out, bid | (1u64 << 63)),
        }
        out
    }
}

/// Per-sub-tree metadata kept in the B+-tree's meta section:
/// `[chunkno u16 BE, top bit = leaf][value_len u16 BE][value?][prefix?]`.
struct TrieMeta {
    chunkno: u16,
    leaf: bool,
    value: Option<Vec<u8>>,
    prefix: Vec<u8>,
}

impl TrieMeta {
    fn decode(valuelen: usize, raw: &[u8]) -> TrieMeta {
        let chunkno_raw = BigEndian::read_u16(&raw[0..2]);
        let value_len = BigEndian::read_u16(&raw[2..4]) as usize;
        let mut offset = 4;
        let value = if value_len > 0 {
            let v = raw[offset..offset + valuelen].to_vec();
            offset += valuelen;
            Some(v)
        } else {
            None
        };
        TrieMeta {
            chunkno: chunkno_raw & !CHUNK_FLAG,
            leaf: chunkno_raw & CHUNK_FLAG != 0,
            value,
            prefix: raw[offset..].to_vec(),
        }
    }

    fn encode(
        valuelen: usize,
        chunkno: u16,
        leaf: bool,
        prefix: &[u8],
        value: Option<&[u8]>,
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + valuelen + prefix.len());
        let chunkno_raw = if leaf { chunkno | CHUNK_FLAG } else { chunkno };
        out.extend_from_slice(&chunkno_raw.to_be_bytes());
        match value {
            Some(v) => {
                debug_assert_eq!(v.len(), valuelen);
                out.extend_from_slice(&(valuelen as u16).to_be_bytes());
                out.extend_from_slice(v);
            }
            None => out.extend_from_slice(&0u16.to_be_bytes()),
        }
        out.extend_from_slice(prefix);
        out
    }
}

fn l2c(chunksize: usize, len: usize) -> usize {
    (len + chunksize - 1) / chunksize
}

/// Chunk `idx` of a raw key, zero-padded; when the key ends before the
/// chunk, the synthesized terminator chunk `[0..0, remainder]` is returned.
fn raw_chunk(chunksize: usize, key: &[u8], idx: usize) -> Vec<u8> {
    let mut out = vec![0u8; chunksize];
    if key.len() > idx * chunksize {
        let n = (key.len() - idx * chunksize).min(chunksize);
        out[..n].copy_from_slice(&key[idx * chunksize..idx * chunksize + n]);
    } else {
        out[chunksize - 1] = key.len().saturating_sub((idx - 1) * chunksize) as u8;
    }
    out
}

fn raw_diff_chunk(
    chunksize: usize,
    key1: &[u8],
    key2: &[u8],
    start_chunk: usize,
    end_chunk: usize,
) -> usize {
    for i in start_chunk..end_chunk {
        if raw_chunk(chunksize, key1, i) != raw_chunk(chunksize, key2, i) {
            return i;
        }
    }
    end_chunk
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum MatchMode {
    Exact,
    /// Skip the document re-read and trust the indexed prefix.
    PrefixOnly,
    /// Stop at the penultimate chunk.
    Partial,
}

struct BtreeListItem {
    btree: BTree,
    chunkno: u16,
    leaf: bool,
    child_rootbid: Bid,
}

#[derive(Clone)]
pub struct HBTrie {
    chunksize: usize,
    valuelen: usize,
    nodesize: u32,
    pub root_bid: Bid,
    flag: u8,
    leaf_height_limit: u16,
    map: Option<CmpMap>,
    last_map_chunk: Vec<u8>,
    active_cmp: Option<KeyCmpFn>,
}

impl HBTrie {
    pub fn new(chunksize: usize, valuelen: usize, nodesize: u32, root_bid: Bid) -> HBTrie {
        assert_eq!(valuelen, 8);
        assert!(chunksize >= 4 && chunksize <= 0xff);
        HBTrie {
            chunksize,
            valuelen,
            nodesize,
            root_bid,
            flag: 0,
            leaf_height_limit: 0,
            map: None,
            last_map_chunk: vec![0xff; chunksize],
            active_cmp: None,
        }
    }

    pub fn chunksize(&self) -> usize {
        self.chunksize
    }

    pub fn set_flag(&mut self, flag: u8) {
        self.flag = flag;
        if self.leaf_height_limit == 0 {
            self.leaf_height_limit = 1;
        }
    }

    pub fn set_leaf_height_limit(&mut self, limit: u16) {
        self.leaf_height_limit = limit;
    }

    pub fn set_map_function(&mut self, map: CmpMap) {
        self.map = Some(map);
    }

    /// Resolve the leaf comparator for this key's first chunk, caching the
    /// last successful resolution. Returns true when leaf mode applies.
    fn update_leaf_cmp(&mut self, key: &[u8]) -> bool {
        let map = match self.map {
            Some(m) => m,
            None => return false,
        };
        let first = &key[..self.chunksize];
        if self.last_map_chunk == first {
            return true;
        }
        if let Some(cmp) = map(first) {
            self.last_map_chunk.copy_from_slice(first);
            self.active_cmp = Some(cmp);
            return true;
        }
        false
    }

    fn leaf_cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.active_cmp {
            Some(f) => f(a, b),
            None => a.cmp(b),
        }
    }

    /// Open the root B+-tree, gating on the node header matching this
    /// trie's configuration.
    fn open_root<F: FileBlocks>(&self, blk: &mut BtreeBlkHandle<F>) -> Result<BTree> {
        let bt = BTree::open(blk, self.root_bid)?;
        if bt.ksize as usize != self.chunksize || bt.vsize as usize != self.valuelen {
            if ((self.chunksize << 4) | self.valuelen) == bt.ksize as usize {
                return Err(TrieError::IndexVersionUnsupported);
            }
            return Err(TrieError::IndexCorrupted);
        }
        Ok(bt)
    }

    fn new_item(btree: BTree) -> BtreeListItem {
        BtreeListItem {
            btree,
            chunkno: 0,
            leaf: false,
            child_rootbid: BLK_NOT_FOUND,
        }
    }

    // ---- find ---------------------------------------------------------

    pub fn find<F: FileBlocks>(
        &mut self,
        blk: &mut BtreeBlkHandle<F>,
        docs: &dyn KeyReader,
        rawkey: &[u8],
        valuebuf: &mut [u8],
    ) -> Result<()> {
        let key = reform_key(self.chunksize, rawkey)?;
        self.find_internal(blk, docs, &key, valuebuf, MatchMode::Exact)
            .map(|_| ())
    }

    /// Prefix-match-only find: trusts the index and skips the document
    /// key verification.
    pub fn find_offset<F: FileBlocks>(
        &mut self,
        blk: &mut BtreeBlkHandle<F>,
        docs: &dyn KeyReader,
        rawkey: &[u8],
        valuebuf: &mut [u8],
    ) -> Result<()> {
        let key = reform_key(self.chunksize, rawkey)?;
        self.find_internal(blk, docs, &key, valuebuf, MatchMode::PrefixOnly)
            .map(|_| ())
    }

    /// Stop at the penultimate chunk without checking the last one.
    pub fn find_partial<F: FileBlocks>(
        &mut self,
        blk: &mut BtreeBlkHandle<F>,
        docs: &dyn KeyReader,
        rawkey: &[u8],
        valuebuf: &mut [u8],
    ) -> Result<()> {
        let key = reform_key(self.chunksize, rawkey)?;
        self.find_internal(blk, docs, &key, valuebuf, MatchMode::Partial)
            .map(|_| ())
    }

    /// Walk the trie for a chunk-aligned key. On success the value is in
    /// `valuebuf` and the visited path is returned for cascaded updates.
    fn find_internal<F: FileBlocks>(
        &mut self,
        blk: &mut BtreeBlkHandle<F>,
        docs: &dyn KeyReader,
        key: &[u8],
        valuebuf: &mut [u8],
        mode: MatchMode,
    ) -> Result<Vec<BtreeListItem>> {
        let cs = self.chunksize;
        if self.root_bid == BLK_NOT_FOUND {
            return Err(TrieError::NotFound);
        }
        let nchunk_total = nchunk(cs, key.len());
        let rawkeylen = reform_key_reverse(cs, key)?;
        self.update_leaf_cmp(key);

        let mut list = vec![Self::new_item(self.open_root(blk)?)];
        let mut curchunkno = 0usize;
        let mut cpt_node = false;

        while curchunkno < nchunk_total {
            let idx = list.len() - 1;
            let meta_raw = list[idx].btree.read_meta(blk)?;
            let meta = TrieMeta::decode(self.valuelen, &meta_raw);
            let prev = curchunkno;
            if meta.leaf {
                cpt_node = true;
                list[idx].btree.set_var_key_mode(self.active_cmp);
            }
            curchunkno = meta.chunkno as usize;
            list[idx].chunkno = meta.chunkno;
            list[idx].leaf = meta.leaf;

            // skipped prefix: all chunks must match (byte order, always)
            if curchunkno > prev + 1 {
                let plen = curchunkno - (prev + 1);
                for i in 0..plen {
                    if meta.prefix[i * cs..(i + 1) * cs]
                        != key[(prev + 1 + i) * cs..(prev + 2 + i) * cs]
                    {
                        return Err(TrieError::NotFound);
                    }
                }
            }

            let terminal = (cpt_node && rawkeylen == curchunkno * cs)
                || (!cpt_node && nchunk_total == curchunkno);
            if terminal {
                // the key is exactly this sub-tree's prefix
                return match meta.value {
                    Some(v) => {
                        valuebuf.copy_from_slice(&v);
                        Ok(list)
                    }
                    None => Err(TrieError::NotFound),
                };
            }

            let chunk = &key[curchunkno * cs..(curchunkno + 1) * cs];
            let mut bval = vec![0u8; self.valuelen];
            let r = if cpt_node {
                let leaf_len = rawkeylen - curchunkno * cs;
                let leaf_key = &key[curchunkno * cs..curchunkno * cs + leaf_len];
                list[idx].btree.find(blk, leaf_key, &mut bval)
            } else {
                list[idx].btree.find(blk, chunk, &mut bval)
            };
            r?;

            if mode == MatchMode::Partial && curchunkno + 1 == nchunk_total - 1 {
                valuebuf.copy_from_slice(&bval);
                return Ok(list);
            }

            match TrieValue::decode(&bval) {
                TrieValue::ChildRoot(bid) => {
                    list[idx].child_rootbid = bid;
                    let child = BTree::open(blk, bid)?;
                    list.push(Self::new_item(child));
                }
                TrieValue::Doc(offset) => {
                    if mode == MatchMode::PrefixOnly {
                        valuebuf.copy_from_slice(&bval);
                        return Ok(list);
                    }
                    let mut rawdoc = Vec::new();
                    docs.read_key(offset, &mut rawdoc)?;
                    let dockey =
                        reform_key(cs, &rawdoc).map_err(|_| TrieError::IndexCorrupted)?;
                    let docnchunk = nchunk(cs, dockey.len());
                    if docnchunk == nchunk_total
                        && first_diff_chunk(cs, key, &dockey, curchunkno, nchunk_total)
                            == nchunk_total
                    {
                        valuebuf.copy_from_slice(&bval);
                        return Ok(list);
                    }
                    return Err(TrieError::NotFound);
                }
            }
        }

        Err(TrieError::NotFound)
    }

    // ---- cascaded root update ------------------------------------------

    /// Walk the visited path leaf to root; wherever a child's root moved,
    /// re-point the parent entry, then publish the (possibly new) root.
    fn cascaded_update<F: FileBlocks>(
        &mut self,
        blk: &mut BtreeBlkHandle<F>,
        list: &mut [BtreeListItem],
        key: &[u8],
    ) -> Result<()> {
        let cs = self.chunksize;
        for i in (0..list.len().saturating_sub(1)).rev() {
            let child_root = list[i + 1].btree.root_bid;
            if list[i].child_rootbid != child_root {
                let val = TrieValue::ChildRoot(child_root).encode();
                let chunk_off = list[i].chunkno as usize * cs;
                let chunk = key[chunk_off..chunk_off + cs].to_vec();
                list[i].btree.insert(blk, &chunk, &val)?;
            }
        }
        self.root_bid = list[0].btree.root_bid;
        Ok(())
    }

    // ---- insert --------------------------------------------------------

    pub fn insert<F: FileBlocks>(
        &mut self,
        blk: &mut BtreeBlkHandle<F>,
        docs: &dyn KeyReader,
        rawkey: &[u8],
        value: &[u8],
        oldvalue_out: Option<&mut [u8]>,
    ) -> Result<()> {
        self.insert_internal(blk, docs, rawkey, value, oldvalue_out, false)
    }

    /// Partial-update mode: only replaces the value at the penultimate
    /// chunk; never creates a new key.
    pub fn insert_partial<F: FileBlocks>(
        &mut self,
        blk: &mut BtreeBlkHandle<F>,
        docs: &dyn KeyReader,
        rawkey: &[u8],
        value: &[u8],
        oldvalue_out: Option<&mut [u8]>,
    ) -> Result<()> {
        self.insert_internal(blk, docs, rawkey, value, oldvalue_out, true)
    }

    fn insert_internal<F: FileBlocks>(
        &mut self,
        blk: &mut BtreeBlkHandle<F>,
        docs: &dyn KeyReader,
        rawkey: &[u8],
        value: &[u8],
        mut oldvalue_out: Option<&mut [u8]>,
        partial: bool,
    ) -> Result<()> {
        let cs = self.chunksize;
        let rawkeylen = rawkey.len();
        let nchunk_total = nchunk_raw(cs, rawkeylen);
        let key = reform_key(cs, rawkey)?;
        let leaf_cond = self.update_leaf_cmp(&key);

        debug!(
            "trie insert key {} ({} chunks)",
            hex::encode(rawkey),
            nchunk_total
        );

        let mut list: Vec<BtreeListItem> = Vec::new();
        if self.root_bid == BLK_NOT_FOUND {
            let meta = TrieMeta::encode(self.valuelen, 0, false, &[], None);
            let bt = BTree::new(blk, cs as u8, self.valuelen as u8, KeyFormat::Fixed, None, &meta)?;
            list.push(Self::new_item(bt));
        } else {
            list.push(Self::new_item(self.open_root(blk)?));
        }

        if let Some(out) = oldvalue_out.as_deref_mut() {
            out.fill(0xff);
        }

        let mut curchunkno = 0usize;
        let mut cpt_node = false;
        let mut ret: Result<()> = Ok(());

        while curchunkno < nchunk_total {
            let idx = list.len() - 1;
            let meta_raw = list[idx].btree.read_meta(blk)?;
            let meta = TrieMeta::decode(self.valuelen, &meta_raw);
            let prev = curchunkno;
            if meta.leaf {
                cpt_node = true;
                list[idx].btree.set_var_key_mode(self.active_cmp);
            }
            curchunkno = meta.chunkno as usize;
            list[idx].chunkno = meta.chunkno;
            list[idx].leaf = meta.leaf;

            // skipped-prefix mismatch: split this sub-tree's prefix
            if curchunkno > prev + 1 {
                let plen = curchunkno - (prev + 1);
                let mut diff = plen;
                for i in 0..plen {
                    if meta.prefix[i * cs..(i + 1) * cs]
                        != key[(prev + 1 + i) * cs..(prev + 2 + i) * cs]
                    {
                        diff = i;
                        break;
                    }
                }
                if diff < plen {
                    let old_prefix = meta.prefix.clone();

                    // this sub-tree keeps the suffix of its old prefix
                    let suffix = &old_prefix[(diff + 1) * cs..];
                    let new_meta = TrieMeta::encode(
                        self.valuelen,
                        curchunkno as u16,
                        meta.leaf,
                        suffix,
                        meta.value.as_deref(),
                    );
                    list[idx].btree.update_meta(blk, &new_meta)?;

                    // intermediate sub-tree carrying the common prefix
                    let int_chunkno = prev + diff + 1;
                    let int_meta = TrieMeta::encode(
                        self.valuelen,
                        int_chunkno as u16,
                        false,
                        &old_prefix[..diff * cs],
                        None,
                    );
                    let mut int_tree = BTree::new(
                        blk,
                        cs as u8,
                        self.valuelen as u8,
                        KeyFormat::Fixed,
                        None,
                        &int_meta,
                    )?;
                    int_tree.insert(blk, &key[int_chunkno * cs..(int_chunkno + 1) * cs], value)?;

                    let child_bid = list[idx].btree.root_bid;
                    int_tree.insert(
                        blk,
                        &old_prefix[diff * cs..(diff + 1) * cs],
                        &TrieValue::ChildRoot(child_bid).encode(),
                    )?;

                    list.insert(
                        idx,
                        BtreeListItem {
                            btree: int_tree,
                            chunkno: int_chunkno as u16,
                            leaf: false,
                            child_rootbid: child_bid,
                        },
                    );
                    break;
                }
            }

            // key ends exactly at this sub-tree's chunk: value lives in meta
            if (cpt_node && rawkeylen == curchunkno * cs)
                || (!cpt_node && nchunk_total == curchunkno)
            {
                let new_meta = TrieMeta::encode(
                    self.valuelen,
                    curchunkno as u16,
                    cpt_node,
                    &meta.prefix,
                    Some(value),
                );
                list[idx].btree.update_meta(blk, &new_meta)?;
                break;
            }

            let chunk = key[curchunkno * cs..(curchunkno + 1) * cs].to_vec();
            let mut bval = vec![0u8; self.valuelen];
            let found = if cpt_node {
                let leaf_key = &key[curchunkno * cs..rawkeylen];
                list[idx].btree.find(blk, leaf_key, &mut bval)
            } else {
                list[idx].btree.find(blk, &chunk, &mut bval)
            };

            match found {
                Err(TrieError::NotFound) => {
                    // no entry for this chunk: plain insert
                    if partial {
                        ret = Err(TrieError::Fail);
                        break;
                    }
                    if cpt_node {
                        let leaf_key = key[curchunkno * cs..rawkeylen].to_vec();
                        list[idx].btree.insert(blk, &leaf_key, value)?;
                        if list[idx].btree.height > self.leaf_height_limit {
                            let pre_len = curchunkno * cs;
                            let pre_str = key[..pre_len].to_vec();
                            self.extend_leaf_tree(blk, docs, &mut list, idx, &pre_str)?;
                            return ret;
                        }
                    } else {
                        list[idx].btree.insert(blk, &chunk, value)?;
                    }
                    break;
                }
                Err(e) => return Err(e),
                Ok(()) => {}
            }

            // same chunk already exists
            if partial && curchunkno + 1 == nchunk_total - 1 {
                if let Some(out) = oldvalue_out.as_deref_mut() {
                    out.copy_from_slice(&bval);
                }
                list[idx].btree.insert(blk, &chunk, value)?;
                break;
            }

            match TrieValue::decode(&bval) {
                TrieValue::ChildRoot(bid) => {
                    list[idx].child_rootbid = bid;
                    let child = BTree::open(blk, bid)?;
                    list.push(Self::new_item(child));
                    continue;
                }
                TrieValue::Doc(offset) => {
                    // collision with an existing document: grow sub-trees
                    let mut docraw = Vec::new();
                    docs.read_key(offset, &mut docraw)?;
                    let dockey = reform_key(cs, &docraw).map_err(|_| TrieError::IndexCorrupted)?;
                    let mut docnchunk = nchunk(cs, dockey.len());

                    let (newchunkno, minchunkno, diffchunkno, opt_leaf) =
                        if self.flag & HBTRIE_FLAG_COMPACT != 0 || leaf_cond {
                            let newchunkno = curchunkno + 1;
                            let minchunkno = l2c(cs, rawkeylen).min(l2c(cs, docraw.len()));
                            let minrawlen = rawkeylen.min(docraw.len());
                            let diff;
                            if curchunkno == 0 {
                                let full =
                                    minchunkno - if minrawlen % cs == 0 { 0 } else { 1 };
                                let mut d = raw_diff_chunk(cs, rawkey, &docraw, 0, full);
                                if rawkeylen == docraw.len()
                                    && d + 1 == minchunkno
                                    && rawkey == docraw.as_slice()
                                {
                                    d = minchunkno;
                                }
                                diff = d;
                            } else {
                                // leaf trees order by the user comparator only
                                let k_rem = &rawkey[curchunkno * cs..];
                                let d_rem = &docraw[(curchunkno * cs).min(docraw.len())..];
                                if self.leaf_cmp(k_rem, d_rem) == Ordering::Equal {
                                    diff = minchunkno;
                                    docnchunk = nchunk_total;
                                } else {
                                    diff = curchunkno;
                                }
                            }
                            (newchunkno, minchunkno, diff, true)
                        } else {
                            let minchunkno = nchunk_total.min(docnchunk);
                            let diff = first_diff_chunk(cs, &key, &dockey, curchunkno, minchunkno);
                            (diff, minchunkno, diff, false)
                        };

                    if minchunkno == diffchunkno && docnchunk == nchunk_total {
                        // same key: update in place
                        if let Some(out) = oldvalue_out.as_deref_mut() {
                            out.copy_from_slice(&bval);
                        }
                        if cpt_node {
                            let leaf_key = key[curchunkno * cs..rawkeylen].to_vec();
                            list[idx].btree.insert(blk, &leaf_key, value)?;
                        } else {
                            list[idx].btree.insert(blk, &chunk, value)?;
                        }
                        break;
                    }

                    // a prefix longer than one node's meta section is chained
                    // through intermediate sub-trees
                    let mut curchunkno = curchunkno;
                    while (self.nodesize as usize) > HBTRIE_HEADROOM as usize
                        && (newchunkno - curchunkno) * cs
                            > self.nodesize as usize - HBTRIE_HEADROOM as usize
                    {
                        debug_assert!(!opt_leaf);
                        let midchunkno = curchunkno
                            + (self.nodesize as usize - HBTRIE_HEADROOM as usize) / cs;
                        let mid_meta = TrieMeta::encode(
                            self.valuelen,
                            midchunkno as u16,
                            false,
                            &key[(curchunkno + 1) * cs..midchunkno * cs],
                            None,
                        );
                        let mid = BTree::new(
                            blk,
                            cs as u8,
                            self.valuelen as u8,
                            KeyFormat::Fixed,
                            None,
                            &mid_meta,
                        )?;
                        let mid_bid = mid.root_bid;

                        let parent_idx = list.len() - 1;
                        list[parent_idx].child_rootbid = mid_bid;
                        list[parent_idx].btree.insert(
                            blk,
                            &key[curchunkno * cs..(curchunkno + 1) * cs],
                            &TrieValue::ChildRoot(mid_bid).encode(),
                        )?;
                        list.push(BtreeListItem {
                            btree: mid,
                            chunkno: midchunkno as u16,
                            leaf: false,
                            child_rootbid: BLK_NOT_FOUND,
                        });
                        curchunkno = midchunkno;
                    }

                    let format = if opt_leaf { KeyFormat::Var } else { KeyFormat::Fixed };
                    let cmp = if opt_leaf { self.active_cmp } else { None };
                    let sub_prefix = key[(curchunkno + 1) * cs..newchunkno * cs].to_vec();

                    if minchunkno == diffchunkno && minchunkno == newchunkno {
                        // one key is a strict prefix of the other: the
                        // shorter one's value lives in the child's meta
                        let key_is_short = docnchunk >= nchunk_total;
                        let value_short: &[u8] = if key_is_short { value } else { &bval };
                        let value_long: &[u8] = if key_is_short { &bval } else { value };

                        let sub_meta = TrieMeta::encode(
                            self.valuelen,
                            newchunkno as u16,
                            opt_leaf,
                            &sub_prefix,
                            Some(value_short),
                        );
                        let mut sub = BTree::new(
                            blk,
                            cs as u8,
                            self.valuelen as u8,
                            format,
                            cmp,
                            &sub_meta,
                        )?;
                        if opt_leaf {
                            let long_raw: &[u8] = if key_is_short { &docraw } else { rawkey };
                            sub.insert(blk, &long_raw[newchunkno * cs..], value_long)?;
                        } else {
                            let long_chunked: &[u8] = if key_is_short { &dockey } else { &key };
                            sub.insert(
                                blk,
                                &long_chunked[newchunkno * cs..(newchunkno + 1) * cs],
                                value_long,
                            )?;
                        }
                        list.push(BtreeListItem {
                            btree: sub,
                            chunkno: newchunkno as u16,
                            leaf: opt_leaf,
                            child_rootbid: BLK_NOT_FOUND,
                        });
                    } else {
                        // both keys become entries of the new child
                        let sub_meta = TrieMeta::encode(
                            self.valuelen,
                            newchunkno as u16,
                            opt_leaf,
                            &sub_prefix,
                            None,
                        );
                        let mut sub = BTree::new(
                            blk,
                            cs as u8,
                            self.valuelen as u8,
                            format,
                            cmp,
                            &sub_meta,
                        )?;
                        if opt_leaf {
                            sub.insert(blk, &rawkey[newchunkno * cs..], value)?;
                            sub.insert(blk, &docraw[newchunkno * cs..], &bval)?;
                        } else {
                            sub.insert(blk, &key[newchunkno * cs..(newchunkno + 1) * cs], value)?;
                            sub.insert(
                                blk,
                                &dockey[newchunkno * cs..(newchunkno + 1) * cs],
                                &bval,
                            )?;
                        }
                        list.push(BtreeListItem {
                            btree: sub,
                            chunkno: newchunkno as u16,
                            leaf: opt_leaf,
                            child_rootbid: BLK_NOT_FOUND,
                        });
                    }

                    // point the parent at the new child
                    let sub_idx = list.len() - 1;
                    let sub_root = list[sub_idx].btree.root_bid;
                    let parent_idx = sub_idx - 1;
                    list[parent_idx].child_rootbid = sub_root;
                    let pchunk =
                        key[curchunkno * cs..(curchunkno + 1) * cs].to_vec();
                    list[parent_idx].btree.insert(
                        blk,
                        &pchunk,
                        &TrieValue::ChildRoot(sub_root).encode(),
                    )?;
                    break;
                }
            }
        }

        self.cascaded_update(blk, &mut list, &key)?;
        ret
    }

    /// A leaf tree grew past the height limit: re-index its raw-remainder
    /// entries under a new chunk tree carrying their common prefix.
    fn extend_leaf_tree<F: FileBlocks>(
        &mut self,
        blk: &mut BtreeBlkHandle<F>,
        docs: &dyn KeyReader,
        list: &mut Vec<BtreeListItem>,
        idx: usize,
        pre_str: &[u8],
    ) -> Result<()> {
        let cs = self.chunksize;
        let pre_len = pre_str.len();

        let meta_raw = list[idx].btree.read_meta(blk)?;
        let meta = TrieMeta::decode(self.valuelen, &meta_raw);

        // drain all raw-remainder entries
        let mut keys: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut it = list[idx].btree.iterator(SeekKey::Min);
        while let Some((k, v)) = it.next(&list[idx].btree, blk)? {
            keys.push((k, v));
        }
        debug!(
            "extending leaf tree at chunk {} with {} entries",
            meta.chunkno,
            keys.len()
        );

        // longest common chunk prefix across the entries
        let mut minchunkno = 0usize;
        if meta.value.is_none() {
            for (i, (k, _)) in keys.iter().enumerate() {
                if i == 0 {
                    minchunkno = l2c(cs, k.len());
                } else {
                    minchunkno =
                        raw_diff_chunk(cs, &keys[0].0, k, 0, l2c(cs, k.len()).min(minchunkno));
                }
            }
        }
        let mut prefix = Vec::with_capacity(minchunkno * cs);
        for i in 0..minchunkno {
            prefix.extend_from_slice(&raw_chunk(cs, &keys[0].0, i));
        }

        let new_chunkno = meta.chunkno as usize + minchunkno;
        let new_meta =
            TrieMeta::encode(self.valuelen, new_chunkno as u16, false, &prefix, None);
        let new_btree = BTree::new(
            blk,
            cs as u8,
            self.valuelen as u8,
            KeyFormat::Fixed,
            None,
            &new_meta,
        )?;
        list[idx].btree = new_btree;
        list[idx].chunkno = new_chunkno as u16;
        list[idx].leaf = false;

        self.cascaded_update(blk, list, pre_str)?;

        // re-insert everything through the regular path
        let mut rawbuf = pre_str.to_vec();
        for (k, v) in keys {
            rawbuf.truncate(pre_len);
            rawbuf.extend_from_slice(&k);
            self.insert(blk, docs, &rawbuf, &v, None)?;
        }
        if let Some(v) = meta.value {
            rawbuf.truncate(pre_len);
            self.insert(blk, docs, &rawbuf, &v, None)?;
        }
        Ok(())
    }

    // ---- remove --------------------------------------------------------

    pub fn remove<F: FileBlocks>(
        &mut self,
        blk: &mut BtreeBlkHandle<F>,
        docs: &dyn KeyReader,
        rawkey: &[u8],
    ) -> Result<()> {
        self.remove_internal(blk, docs, rawkey, false)
    }

    pub fn remove_partial<F: FileBlocks>(
        &mut self,
        blk: &mut BtreeBlkHandle<F>,
        docs: &dyn KeyReader,
        rawkey: &[u8],
    ) -> Result<()> {
        self.remove_internal(blk, docs, rawkey, true)
    }

    fn remove_internal<F: FileBlocks>(
        &mut self,
        blk: &mut BtreeBlkHandle<F>,
        docs: &dyn KeyReader,
        rawkey: &[u8],
        partial: bool,
    ) -> Result<()> {
        let cs = self.chunksize;
        let key = reform_key(cs, rawkey)?;
        let nchunk_total = nchunk(cs, key.len());
        let mut valuebuf = vec![0u8; self.valuelen];
        let mode = if partial {
            MatchMode::Partial
        } else {
            MatchMode::Exact
        };

        let mut list = match self.find_internal(blk, docs, &key, &mut valuebuf, mode) {
            Ok(list) => list,
            Err(TrieError::NotFound) => return Err(TrieError::Fail),
            Err(e) => return Err(e),
        };

        let idx = list.len() - 1;
        let item_chunkno = list[idx].chunkno as usize;
        if (list[idx].leaf && rawkey.len() == item_chunkno * cs)
            || (!list[idx].leaf && nchunk_total == item_chunkno)
        {
            // the key is this sub-tree's prefix: clear the meta value
            let meta_raw = list[idx].btree.read_meta(blk)?;
            let meta = TrieMeta::decode(self.valuelen, &meta_raw);
            let new_meta = TrieMeta::encode(
                self.valuelen,
                meta.chunkno,
                meta.leaf,
                &meta.prefix,
                None,
            );
            list[idx].btree.update_meta(blk, &new_meta)?;
        } else if list[idx].leaf {
            let leaf_key = &rawkey[item_chunkno * cs..];
            list[idx].btree.remove(blk, leaf_key)?;
        } else {
            let chunk = &key[item_chunkno * cs..(item_chunkno + 1) * cs];
            list[idx].btree.remove(blk, chunk)?;
        }

        self.cascaded_update(blk, &mut list, &key)?;

        // a trie drained back to nothing forgets its root entirely
        if list.len() == 1 && list[0].btree.height == 1 {
            let root = &list[0].btree;
            if root.root_entries(blk)? == 0 {
                let meta = TrieMeta::decode(self.valuelen, &root.read_meta(blk)?);
                if meta.value.is_none() {
                    blk.remove_node(self.root_bid);
                    self.root_bid = BLK_NOT_FOUND;
                }
            }
        }
        Ok(())
    }

    // ---- iteration -----------------------------------------------------

    pub fn iterator(&self, initial_key: Option<&[u8]>) -> Result<HBTrieIterator> {
        let cs = self.chunksize;
        let mut curkey = vec![0u8; HBTRIE_MAX_KEYLEN + 2 * cs];
        let keylen = match initial_key {
            Some(raw) => {
                if raw.len() > HBTRIE_MAX_KEYLEN {
                    return Err(TrieError::Fail);
                }
                let len = reform_key_into(cs, raw, &mut curkey)?;
                if len >= HBTRIE_MAX_KEYLEN {
                    return Err(TrieError::Fail);
                }
                curkey[len..len + cs].fill(0);
                len
            }
            None => 0,
        };

        let mut trie = self.clone();
        trie.last_map_chunk = vec![0xff; cs];
        Ok(HBTrieIterator {
            trie,
            curkey,
            keylen,
            stack: Vec::new(),
            dir: None,
            moved: false,
            failed: false,
            dead: false,
        })
    }

    // ---- bulk load -----------------------------------------------------

    /// Build a complete trie bottom-up from `num_keys` entries sorted by
    /// their chunk-aligned form.
    pub fn init_and_load<F: FileBlocks, S: BulkSource>(
        chunksize: usize,
        valuelen: usize,
        nodesize: u32,
        blk: &mut BtreeBlkHandle<F>,
        src: &S,
        num_keys: u64,
    ) -> Result<HBTrie> {
        let mut trie = HBTrie::new(chunksize, valuelen, nodesize, BLK_NOT_FOUND);
        if num_keys == 0 {
            return Ok(trie);
        }
        trie.root_bid = trie.load_recursive(blk, src, 0, 0, 0, num_keys)?;
        Ok(trie)
    }

    fn load_recursive<F: FileBlocks, S: BulkSource>(
        &self,
        blk: &mut BtreeBlkHandle<F>,
        src: &S,
        cur_chunk_idx: usize,
        cp_start_chunk_idx: usize,
        start: u64,
        count: u64,
    ) -> Result<Bid> {
        let cs = self.chunksize;

        struct LocalChunk {
            chunk: Vec<u8>,
            keylen: usize,
            value: [u8; 8],
        }

        let mut chunks: Vec<LocalChunk> = Vec::new();
        let mut prev: Option<(u64, usize)> = None; // (start index, raw key length)
        let mut prev_value = [0u8; 8];
        let mut dup_cnt: u64 = 1;
        let mut skip_this_chunk = false;
        let mut ret_bid: Bid = BLK_NOT_FOUND;

        for ii in 0..=count {
            let prev_chunk = prev.map(|(pstart, _)| {
                let (pkey, _) = src.entry(pstart);
                raw_chunk(cs, pkey, cur_chunk_idx)
            });
            let cur = if ii < count {
                let (k, v) = src.entry(start + ii);
                let mut val = [0u8; 8];
                val.copy_from_slice(v);
                Some((raw_chunk(cs, k, cur_chunk_idx), k.len(), val))
            } else {
                None
            };

            let same_as_prev = match (&prev_chunk, &cur) {
                (Some(pc), Some((kc, _, _))) => pc == kc,
                _ => false,
            };
            if same_as_prev {
                dup_cnt += 1;
                continue;
            }

            if let Some((pstart, plen)) = prev {
                let mut lc = LocalChunk {
                    chunk: prev_chunk.unwrap(),
                    keylen: plen,
                    value: [0u8; 8],
                };
                if dup_cnt == 1 {
                    lc.value = prev_value;
                } else {
                    // a whole level sharing one chunk is folded into the
                    // child's prefix instead of a one-entry tree
                    let mut next_cp = cur_chunk_idx + 1;
                    if ii == count && cur_chunk_idx > 0 && chunks.is_empty() {
                        next_cp = cp_start_chunk_idx;
                        skip_this_chunk = true;
                    }
                    let bid = self.load_recursive(
                        blk,
                        src,
                        cur_chunk_idx + 1,
                        next_cp,
                        pstart,
                        dup_cnt,
                    )?;
                    lc.value = TrieValue::ChildRoot(bid).encode();
                    if skip_this_chunk {
                        ret_bid = bid;
                    }
                }
                chunks.push(lc);
                dup_cnt = 1;
            }

            if let Some((_, klen, kval)) = cur {
                prev = Some((start + ii, klen));
                prev_value = kval;
            }
        }

        if skip_this_chunk {
            return Ok(ret_bid);
        }

        // meta-value promotion / terminator-marker reordering
        let mut meta_value: Option<[u8; 8]> = None;
        if cur_chunk_idx > 0 && !chunks.is_empty() {
            if chunks[0].keylen <= (cur_chunk_idx - 1) * cs {
                // the first key equals the common prefix itself
                meta_value = Some(chunks[0].value);
                chunks.remove(0);
            } else if chunks[0].keylen == cur_chunk_idx * cs {
                // terminator chunk [0..0, chunksize]: raw order put it
                // first, byte order may not agree
                let marker = chunks.remove(0);
                let pos = chunks
                    .iter()
                    .position(|c| marker.chunk < c.chunk)
                    .unwrap_or(chunks.len());
                chunks.insert(pos, marker);
            }
        }

        // common prefix of every key below this level
        let mut prefix = Vec::new();
        if cp_start_chunk_idx < cur_chunk_idx {
            let (pkey, _) = src.entry(prev.unwrap().0);
            for i in cp_start_chunk_idx..cur_chunk_idx {
                prefix.extend_from_slice(&raw_chunk(cs, pkey, i));
            }
        }

        let meta = TrieMeta::encode(
            self.valuelen,
            cur_chunk_idx as u16,
            false,
            &prefix,
            meta_value.as_ref().map(|v| &v[..]),
        );

        let bid = if chunks.is_empty() {
            let bt = BTree::new(
                blk,
                cs as u8,
                self.valuelen as u8,
                KeyFormat::Fixed,
                None,
                &meta,
            )?;
            bt.root_bid
        } else {
            let bt = btree::init_and_load(
                blk,
                cs as u8,
                self.valuelen as u8,
                KeyFormat::Fixed,
                &meta,
                chunks.len() as u64,
                |i| {
                    let c = &chunks[i as usize];
                    (c.chunk.clone(), c.value.to_vec())
                },
            )?;
            bt.root_bid
        };
        blk.end()?;
        Ok(bid)
    }
}

/// Sorted source for the bulk loader; entries indexed 0..num_keys in
/// chunk-aligned key order.
pub trait BulkSource {
    fn entry(&self, idx: u64) -> (&[u8], &[u8]);
}

impl BulkSource for [(Vec<u8>, Vec<u8>)] {
    fn entry(&self, idx: u64) -> (&[u8], &[u8]) {
        let (k, v) = &self[idx as usize];
        (k, v)
    }
}

impl BulkSource for Vec<(Vec<u8>, Vec<u8>)> {
    fn entry(&self, idx: u64) -> (&[u8], &[u8]) {
        self.as_slice().entry(idx)
    }
}

// ---- iterator ----------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Fwd,
    Rev,
}

struct IterItem {
    btree: BTree,
    it: BTreeIterator,
    chunkno: u16,
    leaf: bool,
    meta_value: Option<Vec<u8>>,
    meta_pending: bool,
}

/// Cursor over the whole trie: a stack of per-level B+-tree cursors plus
/// the chunk-aligned current key.
pub struct HBTrieIterator {
    trie: HBTrie,
    curkey: Vec<u8>,
    keylen: usize,
    stack: Vec<IterItem>,
    dir: Option<Direction>,
    moved: bool,
    failed: bool,
    dead: bool,
}

enum Yield {
    Pair(Vec<u8>, Vec<u8>),
    None,
}

impl HBTrieIterator {
    /// Reposition past the end of the key range; `prev` then walks
    /// backward from the last key.
    pub fn seek_last(&mut self) {
        let cs = self.trie.chunksize;
        self.stack.clear();
        self.curkey.fill(0);
        self.curkey[..cs].fill(0xff);
        self.keylen = cs;
        self.dir = None;
        self.moved = false;
        self.failed = false;
        self.dead = false;
    }

    pub fn next<F: FileBlocks>(
        &mut self,
        blk: &mut BtreeBlkHandle<F>,
        docs: &dyn KeyReader,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.dead || (self.dir == Some(Direction::Fwd) && self.failed) {
            return Ok(None);
        }
        let r = self.step(blk, docs, Direction::Fwd, MatchMode::Exact);
        self.dir = Some(Direction::Fwd);
        self.settle(r)
    }

    pub fn prev<F: FileBlocks>(
        &mut self,
        blk: &mut BtreeBlkHandle<F>,
        docs: &dyn KeyReader,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.dead || (self.dir == Some(Direction::Rev) && self.failed) {
            return Ok(None);
        }
        let r = self.step(blk, docs, Direction::Rev, MatchMode::Exact);
        self.dir = Some(Direction::Rev);
        self.settle(r)
    }

    /// Forward step returning only the indexed chunks, without touching
    /// the document store.
    pub fn next_partial<F: FileBlocks>(
        &mut self,
        blk: &mut BtreeBlkHandle<F>,
        docs: &dyn KeyReader,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.dead || (self.dir == Some(Direction::Fwd) && self.failed) {
            return Ok(None);
        }
        let r = self.step(blk, docs, Direction::Fwd, MatchMode::Partial);
        self.dir = Some(Direction::Fwd);
        self.settle(r)
    }

    /// Forward step returning only the value. After exhaustion the
    /// iterator is terminally dead.
    pub fn next_value_only<F: FileBlocks>(
        &mut self,
        blk: &mut BtreeBlkHandle<F>,
        docs: &dyn KeyReader,
    ) -> Result<Option<Vec<u8>>> {
        if self.dead {
            return Ok(None);
        }
        let r = self.step(blk, docs, Direction::Fwd, MatchMode::PrefixOnly)?;
        match r {
            Yield::Pair(_, v) => Ok(Some(v)),
            Yield::None => {
                self.dead = true;
                Ok(None)
            }
        }
    }

    fn settle(&mut self, r: Result<Yield>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match r {
            Ok(Yield::Pair(k, v)) => {
                self.failed = false;
                self.moved = true;
                Ok(Some((k, v)))
            }
            Ok(Yield::None) => {
                self.failed = true;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn step<F: FileBlocks>(
        &mut self,
        blk: &mut BtreeBlkHandle<F>,
        docs: &dyn KeyReader,
        dir: Direction,
        mode: MatchMode,
    ) -> Result<Yield> {
        let cs = self.trie.chunksize;
        if self.stack.is_empty() {
            if self.trie.root_bid == BLK_NOT_FOUND {
                return Ok(Yield::None);
            }
            let bt = self.trie.open_root(blk)?;
            let seek = SeekKey::Key(self.curkey[..cs].to_vec());
            let it = bt.iterator(seek);
            self.stack.push(IterItem {
                btree: bt,
                it,
                chunkno: 0,
                leaf: false,
                meta_value: None,
                meta_pending: false,
            });
        }
        self.walk(blk, docs, 0, dir, mode)
    }

    /// Recursive worker: drive the deepest cursor first, then advance this
    /// level and descend into child trees as they appear.
    fn walk<F: FileBlocks>(
        &mut self,
        blk: &mut BtreeBlkHandle<F>,
        docs: &dyn KeyReader,
        depth: usize,
        dir: Direction,
        mode: MatchMode,
    ) -> Result<Yield> {
        let cs = self.trie.chunksize;

        if depth + 1 < self.stack.len() {
            let r = self.walk(blk, docs, depth + 1, dir, mode)?;
            if let Yield::Pair(..) = r {
                return Ok(r);
            }
            self.keylen = (self.stack[depth].chunkno as usize + 1) * cs;
        }

        loop {
            let adv = {
                let IterItem { btree, it, .. } = &mut self.stack[depth];
                match dir {
                    Direction::Fwd => it.next(btree, blk)?,
                    Direction::Rev => it.prev(btree, blk)?,
                }
            };

            let (k, v) = match adv {
                Some(kv) => kv,
                None => {
                    // exhausted; in reverse the sub-tree's own key (meta
                    // value) comes after all of its entries
                    if dir == Direction::Rev && self.stack[depth].meta_pending {
                        self.stack[depth].meta_pending = false;
                        let value = self.stack[depth].meta_value.clone().unwrap();
                        let parent_chunkno = if depth > 0 {
                            self.stack[depth - 1].chunkno as usize
                        } else {
                            0
                        };
                        return self.yield_doc(docs, depth, &value, parent_chunkno, mode);
                    }
                    debug_assert_eq!(depth + 1, self.stack.len());
                    self.stack.pop();
                    return Ok(Yield::None);
                }
            };

            let item_chunkno = self.stack[depth].chunkno as usize;
            let item_leaf = self.stack[depth].leaf;

            if !item_leaf {
                let cur_chunk = &self.curkey[item_chunkno * cs..(item_chunkno + 1) * cs];
                if k != cur_chunk {
                    // the cursor left the original key's path
                    self.keylen = (item_chunkno + 1) * cs;
                    self.moved = true;
                }
                if mode == MatchMode::Partial {
                    self.curkey[item_chunkno * cs..(item_chunkno + 1) * cs]
                        .copy_from_slice(&k);
                }
            } else if mode == MatchMode::Partial {
                let n = k.len().min(cs);
                self.curkey[item_chunkno * cs..item_chunkno * cs + n].copy_from_slice(&k[..n]);
            }

            match TrieValue::decode(&v) {
                TrieValue::Doc(_) => {
                    return self.yield_doc(docs, depth, &v, item_chunkno, mode);
                }
                TrieValue::ChildRoot(bid) => {
                    let mut child = BTree::open(blk, bid)?;
                    let meta_raw = child.read_meta(blk)?;
                    let meta = TrieMeta::decode(self.trie.valuelen, &meta_raw);
                    let child_chunkno = meta.chunkno as usize;

                    if mode == MatchMode::Partial && !meta.prefix.is_empty() {
                        self.curkey[(item_chunkno + 1) * cs
                            ..(item_chunkno + 1) * cs + meta.prefix.len()]
                            .copy_from_slice(&meta.prefix);
                        self.keylen = child_chunkno * cs;
                    }

                    if meta.leaf {
                        let first_chunk = self.curkey[..cs].to_vec();
                        self.trie.update_leaf_cmp(&first_chunk);
                        child.set_var_key_mode(self.trie.active_cmp);
                    }

                    // compare the skipped prefix against the cursor key to
                    // decide where to enter the child
                    #[derive(PartialEq)]
                    enum Descent {
                        AtChunk,
                        Edge, // smallest (fwd) / largest (rev)
                        Back, // retry at the parent level
                    }
                    let mut descent = Descent::AtChunk;

                    if (child_chunkno + 1) * cs <= self.keylen {
                        if item_chunkno + 1 < child_chunkno {
                            for i in item_chunkno + 1..child_chunkno {
                                let off_meta = cs * (i - (item_chunkno + 1));
                                let off_key = cs * i;
                                let ord = self.curkey[off_key..off_key + cs]
                                    .cmp(&meta.prefix[off_meta..off_meta + cs]);
                                match (dir, ord) {
                                    (_, Ordering::Equal) => continue,
                                    (Direction::Fwd, Ordering::Less)
                                    | (Direction::Rev, Ordering::Greater) => {
                                        self.keylen = off_key;
                                        descent = Descent::Edge;
                                        break;
                                    }
                                    (Direction::Fwd, Ordering::Greater)
                                    | (Direction::Rev, Ordering::Less) => {
                                        self.keylen = off_key;
                                        self.moved = true;
                                        descent = Descent::Back;
                                        break;
                                    }
                                }
                            }
                        }
                    } else {
                        // the child indexes past the cursor key
                        descent = Descent::Edge;
                        if dir == Direction::Fwd || !self.moved {
                            let num_chunks_in_key = self.keylen / cs;
                            for i in item_chunkno + 1..num_chunks_in_key {
                                let off_meta = cs * (i - (item_chunkno + 1));
                                let off_key = cs * i;
                                let ord = self.curkey[off_key..off_key + cs]
                                    .cmp(&meta.prefix[off_meta..off_meta + cs]);
                                match (dir, ord) {
                                    (_, Ordering::Equal) => continue,
                                    (Direction::Fwd, Ordering::Greater)
                                    | (Direction::Rev, Ordering::Less) => {
                                        self.keylen = (item_chunkno + 1) * cs;
                                        self.moved = true;
                                        descent = Descent::Back;
                                        break;
                                    }
                                    _ => break,
                                }
                            }
                        }
                    }

                    if descent == Descent::Back {
                        continue;
                    }
                    let at_edge = descent == Descent::Edge;

                    let seek = if meta.leaf {
                        if at_edge {
                            match dir {
                                Direction::Fwd => SeekKey::Min,
                                Direction::Rev => SeekKey::Max,
                            }
                        } else {
                            let leaf_keylen = self.keylen - child_chunkno * cs;
                            let rem =
                                &self.curkey[child_chunkno * cs..child_chunkno * cs + leaf_keylen];
                            match reform_key_reverse(cs, rem) {
                                Ok(raw) if raw > 0 => SeekKey::Key(rem[..raw].to_vec()),
                                _ => match dir {
                                    Direction::Fwd => SeekKey::Min,
                                    Direction::Rev => SeekKey::Max,
                                },
                            }
                        }
                    } else if at_edge {
                        match dir {
                            Direction::Fwd => SeekKey::Min,
                            Direction::Rev => SeekKey::Max,
                        }
                    } else {
                        let chunk =
                            &self.curkey[child_chunkno * cs..(child_chunkno + 1) * cs];
                        let mut terminator = vec![0u8; cs];
                        terminator[cs - 1] = cs as u8;
                        if dir == Direction::Fwd
                            && !self.moved
                            && (child_chunkno + 1) * cs == self.keylen
                            && chunk == terminator.as_slice()
                        {
                            // the cursor key ends exactly here; the tree's
                            // own (shorter) key sorts before the zero chunk
                            SeekKey::Min
                        } else {
                            SeekKey::Key(chunk.to_vec())
                        }
                    };

                    let descend_smallest =
                        matches!(seek, SeekKey::Min) && dir == Direction::Fwd;
                    let it = child.iterator(seek);
                    let child_leaf = meta.leaf;
                    self.stack.push(IterItem {
                        btree: child,
                        it,
                        chunkno: child_chunkno as u16,
                        leaf: child_leaf,
                        meta_value: meta.value.clone(),
                        meta_pending: dir == Direction::Rev && meta.value.is_some(),
                    });

                    if let (Some(value), true) = (&meta.value, descend_smallest) {
                        // smallest key of this sub-tree is the tree's own key
                        let value = value.clone();
                        return self.yield_doc(docs, depth + 1, &value, item_chunkno, mode);
                    }

                    let r = self.walk(blk, docs, depth + 1, dir, mode)?;
                    if let Yield::Pair(..) = r {
                        return Ok(r);
                    }
                    self.keylen = (item_chunkno + 1) * cs;
                    if dir == Direction::Rev {
                        self.moved = true;
                    }
                }
            }
        }
    }

    /// Produce a document result, reading back its raw key unless the
    /// mode says otherwise.
    fn yield_doc(
        &mut self,
        docs: &dyn KeyReader,
        depth: usize,
        value: &[u8],
        chunkno_for_partial: usize,
        mode: MatchMode,
    ) -> Result<Yield> {
        let cs = self.trie.chunksize;
        match mode {
            MatchMode::Partial => {
                let klen = (chunkno_for_partial + 1) * cs;
                Ok(Yield::Pair(self.curkey[..klen].to_vec(), value.to_vec()))
            }
            MatchMode::PrefixOnly => Ok(Yield::Pair(Vec::new(), value.to_vec())),
            MatchMode::Exact => {
                let offset = match TrieValue::decode(value) {
                    TrieValue::Doc(o) => o,
                    TrieValue::ChildRoot(_) => return Err(TrieError::IndexCorrupted),
                };
                let mut raw = Vec::new();
                docs.read_key(offset, &mut raw)?;
                match reform_key_into(cs, &raw, &mut self.curkey) {
                    Ok(len) => {
                        self.keylen = len;
                        Ok(Yield::Pair(raw, value.to_vec()))
                    }
                    Err(_) => {
                        self.stack.truncate(depth);
                        Err(TrieError::IndexCorrupted)
                    }
                }
            }
        }
    }
}
