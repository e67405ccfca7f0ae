use crate::types::*;

/// Chunk codec: keys are stored chunk-aligned so that every level of the
/// trie can discriminate on a fixed-width slice. A raw key of `len` bytes
/// becomes `ceil(len / chunksize) + 1` chunks: the raw bytes, zero padding,
/// and a trailing byte holding the remainder size within the last data
/// chunk. Lexicographic order over the chunked form sorts a key before any
/// longer key it prefixes.

/// Number of chunks the chunked form of a `rawkeylen`-byte key occupies.
pub fn nchunk_raw(chunksize: usize, rawkeylen: usize) -> usize {
    (rawkeylen + chunksize - 1) / chunksize + 1
}

/// Number of chunks in an already chunk-aligned key of `keylen` bytes.
pub fn nchunk(chunksize: usize, keylen: usize) -> usize {
    (keylen - 1) / chunksize + 1
}

/// Chunk `idx` of a chunk-aligned key.
pub fn chunk_of(chunksize: usize, key: &[u8], idx: usize) -> &[u8] {
    &key[idx * chunksize..(idx + 1) * chunksize]
}

/// Reform `rawkey` into `out`, returning the chunked length.
/// `out` must hold at least `nchunk_raw(..) * chunksize` bytes.
pub fn reform_key_into(chunksize: usize, rawkey: &[u8], out: &mut [u8]) -> Result<usize> {
    let nchunk = nchunk_raw(chunksize, rawkey.len());
    let outlen = nchunk * chunksize;

    let rsize = if nchunk > 2 {
        rawkey.len() - (nchunk - 2) * chunksize
    } else {
        rawkey.len()
    };
    if rsize == 0 || rsize > chunksize {
        return Err(TrieError::MalformedKey);
    }

    out[..rawkey.len()].copy_from_slice(rawkey);
    if rsize < chunksize {
        // zero-fill the rest of the last data chunk and the dummy chunk
        let start = (nchunk - 2) * chunksize + rsize;
        out[start..outlen].fill(0);
    } else {
        out[(nchunk - 1) * chunksize..outlen].fill(0);
    }
    out[outlen - 1] = rsize as u8;

    Ok(outlen)
}

pub fn reform_key(chunksize: usize, rawkey: &[u8]) -> Result<Vec<u8>> {
    let mut out = vec![0u8; nchunk_raw(chunksize, rawkey.len()) * chunksize];
    let len = reform_key_into(chunksize, rawkey, &mut out)?;
    out.truncate(len);
    Ok(out)
}

/// Recover the raw key length from a chunk-aligned key.
pub fn reform_key_reverse(chunksize: usize, key: &[u8]) -> Result<usize> {
    let rsize = key[key.len() - 1] as usize;
    if rsize == 0 {
        return Err(TrieError::MalformedKey);
    }
    if rsize == chunksize {
        Ok(key.len() - chunksize)
    } else {
        // rsize: 1 ~ chunksize-1
        Ok(key.len() - 2 * chunksize + rsize)
    }
}

/// First chunk index in `[start_chunk, end_chunk)` at which the two keys
/// differ; `end_chunk` if all compared chunks are equal.
pub fn first_diff_chunk(
    chunksize: usize,
    key1: &[u8],
    key2: &[u8],
    start_chunk: usize,
    end_chunk: usize,
) -> usize {
    for i in start_chunk..end_chunk {
        if key1[i * chunksize..(i + 1) * chunksize] != key2[i * chunksize..(i + 1) * chunksize] {
            return i;
        }
    }
    end_chunk
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(chunksize: usize, raw: &[u8]) {
        let chunked = reform_key(chunksize, raw).unwrap();
        assert_eq!(chunked.len(), nchunk_raw(chunksize, raw.len()) * chunksize);
        assert_eq!(&chunked[..raw.len()], raw);
        assert_eq!(reform_key_reverse(chunksize, &chunked).unwrap(), raw.len());
    }

    #[test]
    fn reform_round_trip_boundaries() {
        for cs in [4usize, 8, 16] {
            for len in [1, cs - 1, cs, cs + 1, 2 * cs, 2 * cs + 3, HBTRIE_MAX_KEYLEN] {
                let raw: Vec<u8> = (0..len).map(|i| (i % 251) as u8 + 1).collect();
                round_trip(cs, &raw);
            }
        }
    }

    #[test]
    fn empty_key_is_malformed() {
        assert!(matches!(reform_key(8, b""), Err(TrieError::MalformedKey)));
    }

    #[test]
    fn zero_remainder_byte_is_malformed() {
        let chunked = [0u8; 16];
        assert!(matches!(
            reform_key_reverse(8, &chunked),
            Err(TrieError::MalformedKey)
        ));
    }

    #[test]
    fn shorter_prefix_sorts_first() {
        let a = reform_key(4, b"abcd").unwrap();
        let b = reform_key(4, b"abcdE").unwrap();
        assert!(a.as_slice() < b.as_slice());

        let c = reform_key(8, b"abcd").unwrap();
        let d = reform_key(8, b"abce").unwrap();
        assert!(c.as_slice() < d.as_slice());
    }

    #[test]
    fn identical_keys_reform_identically() {
        let a = reform_key(8, b"same-key-bytes").unwrap();
        let b = reform_key(8, b"same-key-bytes").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn diff_chunk_scan() {
        let k1 = reform_key(4, b"aaaabbbbcccc").unwrap();
        let k2 = reform_key(4, b"aaaabbbbdddd").unwrap();
        assert_eq!(first_diff_chunk(4, &k1, &k2, 0, 3), 2);
        assert_eq!(first_diff_chunk(4, &k1, &k2, 0, 2), 2);
        assert_eq!(first_diff_chunk(4, &k1, &k1, 0, 4), 4);
    }
}
