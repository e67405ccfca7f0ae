use anyhow::Result;
use byteorder::{BigEndian, ByteOrder};
use hbtrie_kit::btree::{BTree, KeyFormat};
use hbtrie_kit::types::TrieError;
use hbtrie_kit::{BlockFile, BtreeBlkHandle, HBTrie, KeyReader, BLK_NOT_FOUND, HBTRIE_FLAG_COMPACT};
use std::collections::HashMap;
use std::path::PathBuf;

fn temp_path(name: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!("hbtrie_trie_{}_{}", name, std::process::id()));
    let _ = std::fs::remove_file(&p);
    p
}

fn open_handle(name: &str, blocksize: usize, nodesize: u32) -> BtreeBlkHandle<BlockFile> {
    let file = BlockFile::open(&temp_path(name), blocksize).unwrap();
    BtreeBlkHandle::new(file, nodesize)
}

/// Document-side stub: values double as "offsets" resolving back to the
/// raw key they were inserted with.
#[derive(Default)]
struct MapDocs {
    map: HashMap<u64, Vec<u8>>,
}

impl MapDocs {
    fn put(&mut self, value: &[u8], key: &[u8]) {
        self.map.insert(BigEndian::read_u64(value), key.to_vec());
    }
}

impl KeyReader for MapDocs {
    fn read_key(&self, offset: u64, keybuf: &mut Vec<u8>) -> hbtrie_kit::Result<usize> {
        match self.map.get(&offset) {
            Some(key) => {
                keybuf.clear();
                keybuf.extend_from_slice(key);
                Ok(key.len())
            }
            None => Err(TrieError::IndexCorrupted),
        }
    }
}

fn be64(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}

#[test]
fn point_insert_find() -> Result<()> {
    let _ = env_logger::try_init();
    let mut blk = open_handle("point", 4096, 4096);
    let mut docs = MapDocs::default();
    let mut trie = HBTrie::new(8, 8, 4096, BLK_NOT_FOUND);

    let mut v = [0u8; 8];
    for i in 0..10u32 {
        let key = format!("k{:07}", i);
        let val = format!("v{:07}", i);
        docs.put(val.as_bytes(), key.as_bytes());
        trie.insert(&mut blk, &docs, key.as_bytes(), val.as_bytes(), None)?;
        blk.end()?;

        for j in 0..=i {
            let key = format!("k{:07}", j);
            trie.find(&mut blk, &docs, key.as_bytes(), &mut v)?;
            assert_eq!(&v, format!("v{:07}", j).as_bytes());
        }
    }
    Ok(())
}

#[test]
fn common_prefix_split() -> Result<()> {
    let mut blk = open_handle("split", 4096, 4096);
    let mut docs = MapDocs::default();
    let mut trie = HBTrie::new(8, 8, 4096, BLK_NOT_FOUND);

    docs.put(&be64(1), b"aaaaaaaa1");
    trie.insert(&mut blk, &docs, b"aaaaaaaa1", &be64(1), None)?;
    docs.put(&be64(2), b"aaaaaaaa2");
    trie.insert(&mut blk, &docs, b"aaaaaaaa2", &be64(2), None)?;
    blk.end()?;

    let mut v = [0u8; 8];
    trie.find(&mut blk, &docs, b"aaaaaaaa1", &mut v)?;
    assert_eq!(v, be64(1));
    trie.find(&mut blk, &docs, b"aaaaaaaa2", &mut v)?;
    assert_eq!(v, be64(2));
    assert!(matches!(
        trie.find(&mut blk, &docs, b"aaaaaaaa", &mut v),
        Err(TrieError::NotFound)
    ));
    Ok(())
}

#[test]
fn prefix_is_a_key() -> Result<()> {
    let mut blk = open_handle("prefkey", 4096, 4096);
    let mut docs = MapDocs::default();
    let mut trie = HBTrie::new(8, 8, 4096, BLK_NOT_FOUND);

    docs.put(&be64(0xA), b"abcd");
    trie.insert(&mut blk, &docs, b"abcd", &be64(0xA), None)?;
    docs.put(&be64(0xB), b"abcdEF");
    trie.insert(&mut blk, &docs, b"abcdEF", &be64(0xB), None)?;
    blk.end()?;

    let mut v = [0u8; 8];
    trie.find(&mut blk, &docs, b"abcd", &mut v)?;
    assert_eq!(v, be64(0xA));
    trie.find(&mut blk, &docs, b"abcdEF", &mut v)?;
    assert_eq!(v, be64(0xB));

    trie.remove(&mut blk, &docs, b"abcd")?;
    blk.end()?;
    assert!(matches!(
        trie.find(&mut blk, &docs, b"abcd", &mut v),
        Err(TrieError::NotFound)
    ));
    trie.find(&mut blk, &docs, b"abcdEF", &mut v)?;
    assert_eq!(v, be64(0xB));
    Ok(())
}

#[test]
fn overwrite_returns_old_value() -> Result<()> {
    let mut blk = open_handle("oldout", 4096, 4096);
    let mut docs = MapDocs::default();
    let mut trie = HBTrie::new(8, 8, 4096, BLK_NOT_FOUND);

    docs.put(&be64(11), b"some-key");
    trie.insert(&mut blk, &docs, b"some-key", &be64(11), None)?;
    docs.put(&be64(22), b"some-key");
    let mut old = [0u8; 8];
    trie.insert(&mut blk, &docs, b"some-key", &be64(22), Some(&mut old[..]))?;
    blk.end()?;

    assert_eq!(old, be64(11));
    let mut v = [0u8; 8];
    trie.find(&mut blk, &docs, b"some-key", &mut v)?;
    assert_eq!(v, be64(22));
    Ok(())
}

#[test]
fn insert_then_remove_leaves_no_root() -> Result<()> {
    let mut blk = open_handle("drain", 4096, 4096);
    let mut docs = MapDocs::default();
    let mut trie = HBTrie::new(8, 8, 4096, BLK_NOT_FOUND);

    docs.put(&be64(5), b"only-key");
    trie.insert(&mut blk, &docs, b"only-key", &be64(5), None)?;
    assert_ne!(trie.root_bid, BLK_NOT_FOUND);
    trie.remove(&mut blk, &docs, b"only-key")?;
    blk.end()?;
    assert_eq!(trie.root_bid, BLK_NOT_FOUND);

    assert!(matches!(
        trie.remove(&mut blk, &docs, b"only-key"),
        Err(TrieError::Fail)
    ));
    Ok(())
}

#[test]
fn boundary_key_lengths() -> Result<()> {
    let mut blk = open_handle("bounds", 4096, 4096);
    let mut docs = MapDocs::default();
    let mut trie = HBTrie::new(8, 8, 4096, BLK_NOT_FOUND);

    let lengths = [1usize, 7, 8, 9, hbtrie_kit::types::HBTRIE_MAX_KEYLEN];
    for (i, len) in lengths.iter().enumerate() {
        let key: Vec<u8> = (0..*len).map(|j| b'a' + ((i + j) % 26) as u8).collect();
        let val = be64(1000 + i as u64);
        docs.put(&val, &key);
        trie.insert(&mut blk, &docs, &key, &val, None)?;
        blk.end()?;
    }

    let mut v = [0u8; 8];
    for (i, len) in lengths.iter().enumerate() {
        let key: Vec<u8> = (0..*len).map(|j| b'a' + ((i + j) % 26) as u8).collect();
        trie.find(&mut blk, &docs, &key, &mut v)?;
        assert_eq!(v, be64(1000 + i as u64));
    }

    // removing one boundary key leaves the rest intact
    let victim: Vec<u8> = (0..8usize).map(|j| b'a' + ((2 + j) % 26) as u8).collect();
    trie.remove(&mut blk, &docs, &victim)?;
    blk.end()?;
    assert!(matches!(
        trie.find(&mut blk, &docs, &victim, &mut v),
        Err(TrieError::NotFound)
    ));
    for (i, len) in lengths.iter().enumerate() {
        if i == 2 {
            continue;
        }
        let key: Vec<u8> = (0..*len).map(|j| b'a' + ((i + j) % 26) as u8).collect();
        trie.find(&mut blk, &docs, &key, &mut v)?;
        assert_eq!(v, be64(1000 + i as u64));
    }
    Ok(())
}

#[test]
fn forward_and_backward_iteration() -> Result<()> {
    let mut blk = open_handle("iter", 4096, 4096);
    let mut docs = MapDocs::default();
    let mut trie = HBTrie::new(8, 8, 4096, BLK_NOT_FOUND);

    for i in 10u64..40 {
        let key = be64(i * 0x10);
        let val = be64(i * 0x100);
        docs.put(&val, &key);
        trie.insert(&mut blk, &docs, &key, &val, None)?;
    }
    blk.end()?;

    // forward from the start: 30 pairs, strictly increasing
    let mut it = trie.iterator(None)?;
    let mut count = 0u64;
    let mut prev_key: Option<Vec<u8>> = None;
    while let Some((k, v)) = it.next(&mut blk, &docs)? {
        assert_eq!(k, be64((10 + count) * 0x10));
        assert_eq!(v.as_slice(), &be64((10 + count) * 0x100));
        if let Some(pk) = &prev_key {
            assert!(pk.as_slice() < k.as_slice());
        }
        prev_key = Some(k);
        count += 1;
    }
    assert_eq!(count, 30);

    // backward from past the end: the same pairs in reverse
    let mut it = trie.iterator(Some(be64(0x10000).as_slice()))?;
    let mut count = 30u64;
    while let Some((k, v)) = it.prev(&mut blk, &docs)? {
        count -= 1;
        assert_eq!(k, be64((10 + count) * 0x10));
        assert_eq!(v.as_slice(), &be64((10 + count) * 0x100));
    }
    assert_eq!(count, 0);

    // backward from between two keys: 0x170 down to 0xa0, 14 pairs
    let mut it = trie.iterator(Some(be64(0x175).as_slice()))?;
    let mut expect = 0x170u64;
    let mut pairs = 0;
    while let Some((k, _)) = it.prev(&mut blk, &docs)? {
        assert_eq!(k, be64(expect));
        expect -= 0x10;
        pairs += 1;
    }
    assert_eq!(pairs, 14);

    // seek_last then prev picks up the largest key
    let mut it = trie.iterator(None)?;
    it.seek_last();
    let (k, _) = it.prev(&mut blk, &docs)?.unwrap();
    assert_eq!(k, be64(39 * 0x10));
    Ok(())
}

#[test]
fn iteration_from_all_zero_and_all_ff() -> Result<()> {
    let mut blk = open_handle("iterzf", 4096, 4096);
    let mut docs = MapDocs::default();
    let mut trie = HBTrie::new(8, 8, 4096, BLK_NOT_FOUND);

    for i in 1u64..=5 {
        let key = be64(i * 1000);
        let val = be64(i);
        docs.put(&val, &key);
        trie.insert(&mut blk, &docs, &key, &val, None)?;
    }
    blk.end()?;

    let mut it = trie.iterator(Some(&[0u8; 8][..]))?;
    let mut n = 0;
    while it.next(&mut blk, &docs)?.is_some() {
        n += 1;
    }
    assert_eq!(n, 5);

    let mut it = trie.iterator(Some(&[0xffu8; 8][..]))?;
    assert!(it.next(&mut blk, &docs)?.is_none());
    let mut n = 0;
    while it.prev(&mut blk, &docs)?.is_some() {
        n += 1;
    }
    assert_eq!(n, 5);
    Ok(())
}

#[test]
fn skipped_prefix_and_headroom_split() -> Result<()> {
    // nodesize 512 leaves 256 bytes of prefix per sub-tree: a 600-byte
    // common prefix must be chained through intermediate trees
    let mut blk = open_handle("headroom", 512, 512);
    let mut docs = MapDocs::default();
    let mut trie = HBTrie::new(8, 8, 512, BLK_NOT_FOUND);

    let mut k1 = vec![b'p'; 600];
    k1.extend_from_slice(b"AAAAAAAA");
    let mut k2 = vec![b'p'; 600];
    k2.extend_from_slice(b"BBBBBBBB");

    docs.put(&be64(1), &k1);
    trie.insert(&mut blk, &docs, &k1, &be64(1), None)?;
    docs.put(&be64(2), &k2);
    trie.insert(&mut blk, &docs, &k2, &be64(2), None)?;
    blk.end()?;

    let mut v = [0u8; 8];
    trie.find(&mut blk, &docs, &k1, &mut v)?;
    assert_eq!(v, be64(1));
    trie.find(&mut blk, &docs, &k2, &mut v)?;
    assert_eq!(v, be64(2));

    // a key diverging inside the stored prefix splits it
    let mut k3 = vec![b'p'; 300];
    k3.extend_from_slice(&vec![b'q'; 300]);
    k3.extend_from_slice(b"CCCCCCCC");
    docs.put(&be64(3), &k3);
    trie.insert(&mut blk, &docs, &k3, &be64(3), None)?;
    blk.end()?;

    for (k, val) in [(&k1, 1u64), (&k2, 2), (&k3, 3)] {
        trie.find(&mut blk, &docs, k, &mut v)?;
        assert_eq!(v, be64(val), "key starting {:?}", &k[..4]);
    }
    Ok(())
}

#[test]
fn leaf_trees_and_extension() -> Result<()> {
    let mut blk = open_handle("leaf", 4096, 4096);
    let mut docs = MapDocs::default();
    let mut trie = HBTrie::new(8, 8, 4096, BLK_NOT_FOUND);
    trie.set_flag(HBTRIE_FLAG_COMPACT);

    let n = 400usize;
    let mut keys = Vec::new();
    for i in 0..n {
        let mut key = b"aaaaaaaa".to_vec();
        key.push(b'A' + (i / 26) as u8);
        key.push(b'A' + (i % 26) as u8);
        keys.push(key);
    }

    // two colliding keys open a leaf tree under the first chunk
    for (i, key) in keys.iter().take(2).enumerate() {
        let val = be64(5000 + i as u64);
        docs.put(&val, key);
        trie.insert(&mut blk, &docs, key, &val, None)?;
        blk.end()?;
    }

    // the key equal to the shared prefix lands in the leaf's metadata
    docs.put(&be64(4999), b"aaaaaaaa");
    trie.insert(&mut blk, &docs, b"aaaaaaaa", &be64(4999), None)?;
    blk.end()?;
    let mut v = [0u8; 8];
    trie.find(&mut blk, &docs, b"aaaaaaaa", &mut v)?;
    assert_eq!(v, be64(4999));

    // growing past the height limit re-indexes the leaf as a chunk tree,
    // carrying the meta value along
    for (i, key) in keys.iter().enumerate().skip(2) {
        let val = be64(5000 + i as u64);
        docs.put(&val, key);
        trie.insert(&mut blk, &docs, key, &val, None)?;
        blk.end()?;
    }

    trie.find(&mut blk, &docs, b"aaaaaaaa", &mut v)?;
    assert_eq!(v, be64(4999));
    for (i, key) in keys.iter().enumerate() {
        trie.find(&mut blk, &docs, key, &mut v)?;
        assert_eq!(v, be64(5000 + i as u64), "key {}", i);
    }

    // removing the prefix key clears the meta value only
    trie.remove(&mut blk, &docs, b"aaaaaaaa")?;
    blk.end()?;
    assert!(matches!(
        trie.find(&mut blk, &docs, b"aaaaaaaa", &mut v),
        Err(TrieError::NotFound)
    ));
    trie.find(&mut blk, &docs, &keys[0], &mut v)?;
    assert_eq!(v, be64(5000));
    Ok(())
}

#[test]
fn partial_and_value_only_iteration() -> Result<()> {
    let mut blk = open_handle("partial", 4096, 4096);
    let mut docs = MapDocs::default();
    let mut trie = HBTrie::new(8, 8, 4096, BLK_NOT_FOUND);

    let k1 = b"aaaaaaaabbbbbbbbc1x".to_vec();
    let k2 = b"aaaaaaaabbbbbbbbc2x".to_vec();
    docs.put(&be64(71), &k1);
    trie.insert(&mut blk, &docs, &k1, &be64(71), None)?;
    docs.put(&be64(72), &k2);
    trie.insert(&mut blk, &docs, &k2, &be64(72), None)?;
    blk.end()?;

    // partial mode returns the indexed chunks, skipped prefix included,
    // without consulting the document store
    let empty_docs = MapDocs::default();
    let mut it = trie.iterator(None)?;
    let (k, v) = it.next_partial(&mut blk, &empty_docs)?.unwrap();
    assert_eq!(k.len(), 24);
    assert_eq!(&k[..16], b"aaaaaaaabbbbbbbb");
    assert_eq!(&k[16..18], b"c1");
    assert_eq!(v.as_slice(), &be64(71));
    let (k, v) = it.next_partial(&mut blk, &empty_docs)?.unwrap();
    assert_eq!(&k[16..18], b"c2");
    assert_eq!(v.as_slice(), &be64(72));
    assert!(it.next_partial(&mut blk, &empty_docs)?.is_none());

    // value-only mode never touches keys; exhaustion is terminal
    let mut it = trie.iterator(None)?;
    assert_eq!(
        it.next_value_only(&mut blk, &empty_docs)?.unwrap().as_slice(),
        &be64(71)
    );
    assert_eq!(
        it.next_value_only(&mut blk, &empty_docs)?.unwrap().as_slice(),
        &be64(72)
    );
    assert!(it.next_value_only(&mut blk, &empty_docs)?.is_none());
    assert!(it.next_value_only(&mut blk, &empty_docs)?.is_none());
    Ok(())
}

#[test]
fn find_offset_skips_doc_verification() -> Result<()> {
    let mut blk = open_handle("prefonly", 4096, 4096);
    let mut docs = MapDocs::default();
    let mut trie = HBTrie::new(8, 8, 4096, BLK_NOT_FOUND);

    docs.put(&be64(9), b"offsetkey");
    trie.insert(&mut blk, &docs, b"offsetkey", &be64(9), None)?;
    blk.end()?;

    // no doc store needed on the prefix-only path
    let empty_docs = MapDocs::default();
    let mut v = [0u8; 8];
    trie.find_offset(&mut blk, &empty_docs, b"offsetkey", &mut v)?;
    assert_eq!(v, be64(9));
    Ok(())
}

#[test]
fn bulk_load_and_point_find() -> Result<()> {
    let mut blk = open_handle("bulk", 4096, 4096);
    let mut docs = MapDocs::default();

    let n = 100_000u64;
    let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(n as usize);
    for i in 0..n {
        let key = format!("k{:07}", i).into_bytes();
        let val = format!("v{:07}", i).into_bytes();
        docs.put(&val, &key);
        entries.push((key, val));
    }

    let mut trie = HBTrie::init_and_load(8, 8, 4096, &mut blk, &entries, n)?;
    assert_ne!(trie.root_bid, BLK_NOT_FOUND);
    blk.end()?;

    let mut v = [0u8; 8];
    for i in 0..n {
        let key = format!("k{:07}", i);
        trie.find(&mut blk, &docs, key.as_bytes(), &mut v)?;
        assert_eq!(&v, format!("v{:07}", i).as_bytes(), "key {}", i);
    }

    // full scan returns every key exactly once, in order
    let mut it = trie.iterator(None)?;
    let mut count = 0u64;
    while let Some((k, _)) = it.next(&mut blk, &docs)? {
        assert_eq!(k, format!("k{:07}", count).into_bytes());
        count += 1;
    }
    assert_eq!(count, n);
    Ok(())
}

#[test]
fn bulk_load_matches_sequential_inserts() -> Result<()> {
    let n = 500u64;
    let mut docs = MapDocs::default();
    let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    for i in 0..n {
        let key = format!("key-{:04}", i).into_bytes();
        let val = be64(i).to_vec();
        docs.put(&val, &key);
        entries.push((key, val));
    }

    let mut blk_a = open_handle("bulkeq_a", 4096, 4096);
    let loaded = HBTrie::init_and_load(8, 8, 4096, &mut blk_a, &entries, n)?;
    blk_a.end()?;

    let mut blk_b = open_handle("bulkeq_b", 4096, 4096);
    let mut inserted = HBTrie::new(8, 8, 4096, BLK_NOT_FOUND);
    for (k, v) in &entries {
        inserted.insert(&mut blk_b, &docs, k, v, None)?;
    }
    blk_b.end()?;

    let mut it_a = loaded.iterator(None)?;
    let mut it_b = inserted.iterator(None)?;
    loop {
        let a = it_a.next(&mut blk_a, &docs)?;
        let b = it_b.next(&mut blk_b, &docs)?;
        assert_eq!(a, b);
        if a.is_none() {
            break;
        }
    }
    Ok(())
}

#[test]
fn bulk_load_marker_key() -> Result<()> {
    // "aaaaaaaa" ends exactly at a chunk boundary; raw order puts it before
    // a sibling whose continuation bytes sort below the terminator chunk
    let mut blk = open_handle("marker", 4096, 4096);
    let mut docs = MapDocs::default();

    let k_short = b"aaaaaaaa".to_vec();
    let mut k_long = b"aaaaaaaa".to_vec();
    k_long.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 1]);

    let mut entries = Vec::new();
    docs.put(&be64(100), &k_short);
    entries.push((k_short.clone(), be64(100).to_vec()));
    docs.put(&be64(200), &k_long);
    entries.push((k_long.clone(), be64(200).to_vec()));

    let mut trie = HBTrie::init_and_load(8, 8, 4096, &mut blk, &entries, 2)?;
    blk.end()?;

    let mut v = [0u8; 8];
    trie.find(&mut blk, &docs, &k_short, &mut v)?;
    assert_eq!(v, be64(100));
    trie.find(&mut blk, &docs, &k_long, &mut v)?;
    assert_eq!(v, be64(200));
    Ok(())
}

#[test]
fn bulk_load_prefix_key_promotion() -> Result<()> {
    // all three keys share two full chunks; the shortest equals the shared
    // prefix and must surface as the deeper tree's meta value
    let mut blk = open_handle("promote", 4096, 4096);
    let mut docs = MapDocs::default();

    let k1 = b"aaaaaaaa".to_vec();
    let mut k2 = b"aaaaaaaa".to_vec();
    k2.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 8]);
    k2.extend_from_slice(b"11111111");
    let mut k3 = b"aaaaaaaa".to_vec();
    k3.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 8]);
    k3.extend_from_slice(b"22222222");

    let mut entries = Vec::new();
    for (k, val) in [(&k1, 301u64), (&k2, 302), (&k3, 303)] {
        docs.put(&be64(val), k);
        entries.push((k.clone(), be64(val).to_vec()));
    }

    let mut trie = HBTrie::init_and_load(8, 8, 4096, &mut blk, &entries, 3)?;
    blk.end()?;

    let mut v = [0u8; 8];
    for (k, val) in [(&k1, 301u64), (&k2, 302), (&k3, 303)] {
        trie.find(&mut blk, &docs, k, &mut v)?;
        assert_eq!(v, be64(val));
    }
    Ok(())
}

#[test]
fn version_gate_and_corruption() -> Result<()> {
    let mut blk = open_handle("gate", 4096, 4096);
    let docs = MapDocs::default();

    // legacy encoding: ksize == (chunksize << 4) | valuelen
    let legacy = BTree::new(&mut blk, (8 << 4) | 8, 8, KeyFormat::Fixed, None, &[])?;
    blk.end()?;
    let mut trie = HBTrie::new(8, 8, 4096, legacy.root_bid);
    let mut v = [0u8; 8];
    assert!(matches!(
        trie.find(&mut blk, &docs, b"whatever", &mut v),
        Err(TrieError::IndexVersionUnsupported)
    ));
    let mut it = trie.iterator(None)?;
    assert!(matches!(
        it.next(&mut blk, &docs),
        Err(TrieError::IndexVersionUnsupported)
    ));

    // any other width mismatch is corruption
    let odd = BTree::new(&mut blk, 9, 8, KeyFormat::Fixed, None, &[])?;
    blk.end()?;
    let mut trie = HBTrie::new(8, 8, 4096, odd.root_bid);
    assert!(matches!(
        trie.find(&mut blk, &docs, b"whatever", &mut v),
        Err(TrieError::IndexCorrupted)
    ));
    Ok(())
}

#[test]
fn dirty_update_session_round_trip() -> Result<()> {
    let mut blk = open_handle("dirty", 4096, 4096);
    let mut docs = MapDocs::default();
    let mut trie = HBTrie::new(8, 8, 4096, BLK_NOT_FOUND);

    let tag = blk.file_mut().begin_dirty();
    blk.set_dirty_update(None, Some(tag));

    for i in 0..20u64 {
        let key = format!("dirty-{:03}", i);
        let val = be64(i);
        docs.put(&val, key.as_bytes());
        trie.insert(&mut blk, &docs, key.as_bytes(), &val, None)?;
    }
    blk.end()?;

    // drop the clean cache so the next reads go through the session
    blk.discard_clean();
    let mut v = [0u8; 8];
    trie.find(&mut blk, &docs, b"dirty-007", &mut v)?;
    assert_eq!(v, be64(7));

    blk.file_mut().commit_dirty(tag)?;
    blk.clear_dirty_update();
    blk.discard_clean();

    for i in 0..20u64 {
        let key = format!("dirty-{:03}", i);
        trie.find(&mut blk, &docs, key.as_bytes(), &mut v)?;
        assert_eq!(v, be64(i));
    }
    Ok(())
}

#[test]
fn removal_keeps_siblings() -> Result<()> {
    let mut blk = open_handle("rmkeep", 4096, 4096);
    let mut docs = MapDocs::default();
    let mut trie = HBTrie::new(8, 8, 4096, BLK_NOT_FOUND);

    let n = 200u64;
    for i in 0..n {
        let key = format!("shared-prefix-{:05}", i);
        let val = be64(i);
        docs.put(&val, key.as_bytes());
        trie.insert(&mut blk, &docs, key.as_bytes(), &val, None)?;
    }
    blk.end()?;

    let mut v = [0u8; 8];
    for i in (0..n).step_by(2) {
        let key = format!("shared-prefix-{:05}", i);
        trie.remove(&mut blk, &docs, key.as_bytes())?;
    }
    blk.end()?;

    for i in 0..n {
        let key = format!("shared-prefix-{:05}", i);
        let r = trie.find(&mut blk, &docs, key.as_bytes(), &mut v);
        if i % 2 == 0 {
            assert!(matches!(r, Err(TrieError::NotFound)), "key {}", i);
        } else {
            r?;
            assert_eq!(v, be64(i));
        }
    }
    Ok(())
}
