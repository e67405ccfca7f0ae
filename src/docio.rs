use crate::types::*;

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_32_ISCSI};

/// The document-side collaborator: hand back the full raw key that was
/// appended at `offset`. The index stores nothing about a document except
/// this offset.
pub trait KeyReader {
    fn read_key(&self, offset: u64, keybuf: &mut Vec<u8>) -> Result<usize>;
}

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const DOC_HDR_SIZE: usize = 2 + 4; // keylen + checksum

/// Append-only key store. Each record is
/// `[keylen u16 BE][crc32c u32 BE][key bytes]`; the checksum is verified on
/// every read. Offsets are plain byte positions and stay far below 2^63,
/// so the index can borrow the value MSB.
pub struct DocStore {
    data: Vec<u8>,
}

impl DocStore {
    pub fn new() -> DocStore {
        DocStore { data: Vec::new() }
    }

    pub fn append_key(&mut self, key: &[u8]) -> u64 {
        assert!(key.len() <= HBTRIE_MAX_KEYLEN);
        let offset = self.data.len() as u64;
        let mut hdr = [0u8; DOC_HDR_SIZE];
        BigEndian::write_u16(&mut hdr[0..2], key.len() as u16);
        BigEndian::write_u32(&mut hdr[2..6], CASTAGNOLI.checksum(key));
        self.data.extend_from_slice(&hdr);
        self.data.extend_from_slice(key);
        offset
    }
}

impl Default for DocStore {
    fn default() -> Self {
        DocStore::new()
    }
}

impl KeyReader for DocStore {
    fn read_key(&self, offset: u64, keybuf: &mut Vec<u8>) -> Result<usize> {
        let off = offset as usize;
        if off + DOC_HDR_SIZE > self.data.len() {
            return Err(TrieError::read_failed("document offset out of range"));
        }
        let keylen = BigEndian::read_u16(&self.data[off..off + 2]) as usize;
        let stored_crc = BigEndian::read_u32(&self.data[off + 2..off + 6]);
        let start = off + DOC_HDR_SIZE;
        if start + keylen > self.data.len() {
            return Err(TrieError::read_failed("document record truncated"));
        }
        let key = &self.data[start..start + keylen];
        if CASTAGNOLI.checksum(key) != stored_crc {
            return Err(TrieError::IndexCorrupted);
        }
        keybuf.clear();
        keybuf.extend_from_slice(key);
        Ok(keylen)
    }
}
