use crate::types::*;

use log::{debug, error};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Token naming a dirty-update session: a set of block versions staged in
/// memory but not yet persisted. Writers stage into their own session;
/// readers pin a session to see a consistent in-progress view.
pub type DirtyTag = u64;

/// The file-manager surface the block handle depends on. Block ids are
/// dense, allocation never reuses an id, and a block stays writable until
/// a commit pins its current version.
pub trait FileBlocks {
    fn blocksize(&self) -> usize;

    /// Next free file block id.
    fn alloc(&mut self) -> Bid;

    /// True iff `bid` is still the most recent version.
    fn is_writable(&self, bid: Bid) -> bool;

    fn read(&self, bid: Bid, buf: &mut [u8]) -> Result<()>;

    fn write(&mut self, bid: Bid, buf: &[u8]) -> Result<()>;

    /// Partial write within a block.
    fn write_offset(&mut self, bid: Bid, offset: usize, data: &[u8]) -> Result<()>;

    /// Read honouring staged dirty sets: the writer's set first, then the
    /// reader's pinned set, then the file itself.
    fn read_dirty(
        &self,
        bid: Bid,
        buf: &mut [u8],
        reader: Option<DirtyTag>,
        writer: Option<DirtyTag>,
    ) -> Result<()>;

    /// Stage a block into the writer's dirty set instead of the file.
    fn write_dirty(&mut self, bid: Bid, buf: &[u8], writer: DirtyTag) -> Result<()>;

    /// Register a byte range as garbage to reclaim later.
    fn add_stale_block(&mut self, pos: u64, len: usize);
}

/// A fixed-size-block file over `std::fs::File`.
///
/// Writability follows a commit watermark: every block allocated since the
/// last `commit` may still be mutated in place; anything below the
/// watermark is frozen and must be rewritten elsewhere (move-on-write).
pub struct BlockFile {
    file: File,
    blocksize: usize,
    nblocks: u64,
    watermark: u64,
    stale: Vec<(u64, usize)>,
    dirty: HashMap<DirtyTag, HashMap<Bid, Vec<u8>>>,
    next_tag: DirtyTag,
}

impl BlockFile {
    pub fn open(path: &Path, blocksize: usize) -> Result<BlockFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(TrieError::ReadFailed)?;
        let len = file.metadata().map_err(TrieError::ReadFailed)?.len();
        let nblocks = len / blocksize as u64;
        debug!(
            "opened block file {} with {} blocks of {} bytes",
            path.display(),
            nblocks,
            blocksize
        );
        Ok(BlockFile {
            file,
            blocksize,
            nblocks,
            watermark: nblocks,
            stale: Vec::new(),
            dirty: HashMap::new(),
            next_tag: 1,
        })
    }

    /// Freeze every allocated block, making further mutation copy-on-write.
    pub fn commit(&mut self) -> Result<()> {
        self.file.sync_all().map_err(TrieError::WriteFailed)?;
        self.watermark = self.nblocks;
        Ok(())
    }

    pub fn num_blocks(&self) -> u64 {
        self.nblocks
    }

    pub fn stale_regions(&self) -> &[(u64, usize)] {
        &self.stale
    }

    pub fn begin_dirty(&mut self) -> DirtyTag {
        let tag = self.next_tag;
        self.next_tag += 1;
        self.dirty.insert(tag, HashMap::new());
        tag
    }

    /// Flush a staged dirty set into the file.
    pub fn commit_dirty(&mut self, tag: DirtyTag) -> Result<()> {
        if let Some(set) = self.dirty.remove(&tag) {
            let mut bids: Vec<&Bid> = set.keys().collect();
            bids.sort_unstable();
            for bid in bids {
                self.file
                    .write_all_at(&set[bid], *bid * self.blocksize as u64)
                    .map_err(TrieError::WriteFailed)?;
            }
        }
        Ok(())
    }

    pub fn drop_dirty(&mut self, tag: DirtyTag) {
        self.dirty.remove(&tag);
    }

    fn check_bid(&self, bid: Bid) -> Result<()> {
        if bid >= self.nblocks {
            error!("block {} is out of range ({} allocated)", bid, self.nblocks);
            return Err(TrieError::read_failed("block id out of range"));
        }
        Ok(())
    }
}

impl FileBlocks for BlockFile {
    fn blocksize(&self) -> usize {
        self.blocksize
    }

    fn alloc(&mut self) -> Bid {
        let bid = self.nblocks;
        self.nblocks += 1;
        bid
    }

    fn is_writable(&self, bid: Bid) -> bool {
        bid >= self.watermark && bid < self.nblocks
    }

    fn read(&self, bid: Bid, buf: &mut [u8]) -> Result<()> {
        self.check_bid(bid)?;
        debug_assert_eq!(buf.len(), self.blocksize);
        self.file
            .read_exact_at(buf, bid * self.blocksize as u64)
            .map_err(TrieError::ReadFailed)
    }

    fn write(&mut self, bid: Bid, buf: &[u8]) -> Result<()> {
        self.check_bid(bid)?;
        debug_assert_eq!(buf.len(), self.blocksize);
        self.file
            .write_all_at(buf, bid * self.blocksize as u64)
            .map_err(TrieError::WriteFailed)
    }

    fn write_offset(&mut self, bid: Bid, offset: usize, data: &[u8]) -> Result<()> {
        self.check_bid(bid)?;
        more_asserts::debug_assert_le!(offset + data.len(), self.blocksize);
        self.file
            .write_all_at(data, bid * self.blocksize as u64 + offset as u64)
            .map_err(TrieError::WriteFailed)
    }

    fn read_dirty(
        &self,
        bid: Bid,
        buf: &mut [u8],
        reader: Option<DirtyTag>,
        writer: Option<DirtyTag>,
    ) -> Result<()> {
        for tag in [writer, reader].into_iter().flatten() {
            if let Some(block) = self.dirty.get(&tag).and_then(|set| set.get(&bid)) {
                buf.copy_from_slice(block);
                return Ok(());
            }
        }
        self.read(bid, buf)
    }

    fn write_dirty(&mut self, bid: Bid, buf: &[u8], writer: DirtyTag) -> Result<()> {
        self.check_bid(bid)?;
        match self.dirty.get_mut(&writer) {
            Some(set) => {
                set.insert(bid, buf.to_vec());
                Ok(())
            }
            None => Err(TrieError::write_failed("unknown dirty-update session")),
        }
    }

    fn add_stale_block(&mut self, pos: u64, len: usize) {
        self.stale.push((pos, len));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!("hbtrie_bf_{}_{}", name, std::process::id()));
        let _ = std::fs::remove_file(&p);
        p
    }

    #[test]
    fn write_read_round_trip() -> Result<()> {
        let path = temp_path("rw");
        let mut f = BlockFile::open(&path, 512)?;
        let bid = f.alloc();
        let block = vec![0xabu8; 512];
        f.write(bid, &block)?;
        let mut out = vec![0u8; 512];
        f.read(bid, &mut out)?;
        assert_eq!(block, out);
        std::fs::remove_file(&path).ok();
        Ok(())
    }

    #[test]
    fn commit_freezes_blocks() -> Result<()> {
        let path = temp_path("commit");
        let mut f = BlockFile::open(&path, 512)?;
        let b0 = f.alloc();
        f.write(b0, &vec![1u8; 512])?;
        assert!(f.is_writable(b0));
        f.commit()?;
        assert!(!f.is_writable(b0));
        let b1 = f.alloc();
        assert!(f.is_writable(b1));
        std::fs::remove_file(&path).ok();
        Ok(())
    }

    #[test]
    fn dirty_session_masks_file_content() -> Result<()> {
        let path = temp_path("dirty");
        let mut f = BlockFile::open(&path, 512)?;
        let bid = f.alloc();
        f.write(bid, &vec![1u8; 512])?;

        let tag = f.begin_dirty();
        f.write_dirty(bid, &vec![2u8; 512], tag)?;

        let mut out = vec![0u8; 512];
        f.read(bid, &mut out)?;
        assert_eq!(out[0], 1);
        f.read_dirty(bid, &mut out, None, Some(tag))?;
        assert_eq!(out[0], 2);

        f.commit_dirty(tag)?;
        f.read(bid, &mut out)?;
        assert_eq!(out[0], 2);
        std::fs::remove_file(&path).ok();
        Ok(())
    }

    #[test]
    fn stale_ledger_accumulates() -> Result<()> {
        let path = temp_path("stale");
        let mut f = BlockFile::open(&path, 512)?;
        f.add_stale_block(1024, 512);
        f.add_stale_block(4096, 128);
        assert_eq!(f.stale_regions(), &[(1024, 512), (4096, 128)]);
        std::fs::remove_file(&path).ok();
        Ok(())
    }
}
