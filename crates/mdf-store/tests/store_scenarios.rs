//! End-to-end storage scenarios against a real upload directory.

use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mdf_store::{FileInfo, MdfStore, StoreError};
use tempfile::TempDir;

fn read_all(store: &MdfStore, id: &str) -> Vec<u8> {
    let mut content = Vec::new();
    store
        .get_reader(id)
        .unwrap()
        .read_to_end(&mut content)
        .unwrap();
    content
}

#[test]
fn test_two_chunks_then_read() {
    let temp = TempDir::new().unwrap();
    let store = MdfStore::new(temp.path());
    store.new_upload(FileInfo::with_size(15).with_id("u1")).unwrap();

    assert_eq!(store.write_chunk("u1", 0, &b"0123456789"[..]).unwrap(), 10);
    assert_eq!(store.write_chunk("u1", 10, &b"abcde"[..]).unwrap(), 5);

    assert_eq!(store.chunks().offset("u1").unwrap(), 15);
    assert_eq!(read_all(&store, "u1"), b"0123456789abcde");
    assert!(store.get_info("u1").unwrap().is_complete());
}

#[test]
fn test_lock_busy_unlock_relock() {
    let temp = TempDir::new().unwrap();
    let store = MdfStore::new(temp.path());

    store.lock_upload("u2").unwrap();
    let err = store.lock_upload("u2").unwrap_err();
    assert!(matches!(err, StoreError::LockBusy { ref id } if id == "u2"));
    store.unlock_upload("u2").unwrap();
    store.lock_upload("u2").unwrap();
}

#[test]
fn test_unlock_never_locked_upload() {
    let temp = TempDir::new().unwrap();
    let store = MdfStore::new(temp.path());
    store.new_upload(FileInfo::with_size(1).with_id("free")).unwrap();
    store.unlock_upload("free").unwrap();
    store.unlock_upload("free").unwrap();
}

#[test]
fn test_concat_with_empty_part() {
    let temp = TempDir::new().unwrap();
    let store = MdfStore::new(temp.path());

    store.new_upload(FileInfo::with_size(15).with_id("u1")).unwrap();
    store.write_chunk("u1", 0, &b"fifteen bytes!!"[..]).unwrap();
    store.new_upload(FileInfo::with_size(0).with_id("u2")).unwrap();
    store.new_upload(FileInfo::deferred().with_id("dest")).unwrap();

    let sources = vec!["u1".to_string(), "u2".to_string()];
    assert_eq!(store.concat_uploads("dest", &sources).unwrap(), 15);

    assert_eq!(read_all(&store, "dest"), read_all(&store, "u1"));
    // destination metadata is the caller's business
    let info = store.get_info("dest").unwrap();
    assert!(info.size_is_deferred);
    assert_eq!(info.offset, 15);
}

#[test]
fn test_concat_three_parts_of_different_lengths() {
    let temp = TempDir::new().unwrap();
    let store = MdfStore::new(temp.path());
    let parts: [(&str, &[u8]); 3] = [("a", b"A"), ("b", b""), ("c", b"CCCCCCCC")];

    for (id, data) in parts {
        store.new_upload(FileInfo::with_size(data.len() as u64).with_id(id)).unwrap();
        store.write_chunk(id, 0, data).unwrap();
    }
    store.new_upload(FileInfo::deferred().with_id("final")).unwrap();

    store.concat_uploads("final", &["a", "b", "c"]).unwrap();
    assert_eq!(read_all(&store, "final"), b"ACCCCCCCC");
}

#[test]
fn test_metadata_roundtrip_and_declare_length() {
    let temp = TempDir::new().unwrap();
    let store = MdfStore::new(temp.path());

    let info = FileInfo::deferred()
        .with_id("m")
        .with_metadata("filename", "run-42.mdf")
        .with_metadata("content-type", "application/octet-stream");
    store.new_upload(info.clone()).unwrap();
    store.write_chunk("m", 0, &[7u8; 32][..]).unwrap();

    let loaded = store.get_info("m").unwrap();
    assert_eq!(loaded.metadata, info.metadata);
    assert!(loaded.size_is_deferred);
    assert_eq!(loaded.offset, 32);

    store.declare_length("m", 64).unwrap();
    let loaded = store.get_info("m").unwrap();
    assert_eq!(loaded.size, 64);
    assert!(!loaded.size_is_deferred);
    assert_eq!(loaded.offset, 32);
    assert_eq!(loaded.metadata, info.metadata);
}

#[test]
fn test_corrupt_metadata_is_reported() {
    let temp = TempDir::new().unwrap();
    let store = MdfStore::new(temp.path());
    store.new_upload(FileInfo::with_size(1).with_id("bad")).unwrap();
    std::fs::write(store.paths("bad").info, "not json").unwrap();

    assert!(matches!(
        store.get_info("bad").unwrap_err(),
        StoreError::Corrupt { .. }
    ));
}

#[test]
fn test_locked_appends_from_many_threads() {
    const WRITERS: usize = 8;
    const CHUNKS: usize = 25;
    const CHUNK_LEN: usize = 97;

    let temp = TempDir::new().unwrap();
    let store = Arc::new(MdfStore::new(temp.path()));
    store.new_upload(FileInfo::deferred().with_id("shared")).unwrap();

    let handles: Vec<_> = (0..WRITERS)
        .map(|w| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let chunk = vec![b'a' + w as u8; CHUNK_LEN];
                let mut written = 0u64;
                for _ in 0..CHUNKS {
                    while store.lock_upload("shared").is_err() {
                        thread::sleep(Duration::from_micros(50));
                    }
                    let offset = store.get_info("shared").unwrap().offset;
                    written += store.write_chunk("shared", offset, chunk.as_slice()).unwrap();
                    store.unlock_upload("shared").unwrap();
                }
                written
            })
        })
        .collect();

    let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(total, (WRITERS * CHUNKS * CHUNK_LEN) as u64);
    assert_eq!(store.get_info("shared").unwrap().offset, total);

    // every chunk landed whole: no interleaving between writers
    let content = read_all(&store, "shared");
    for block in content.chunks(CHUNK_LEN) {
        assert!(block.iter().all(|b| *b == block[0]));
    }
}

#[test]
fn test_store_root_missing() {
    let temp = TempDir::new().unwrap();
    let store = MdfStore::new(temp.path().join("not-created"));

    let err = store.new_upload(FileInfo::with_size(1)).unwrap_err();
    assert!(matches!(err, StoreError::StorageRootMissing { .. }));
    assert!(matches!(
        store.lock_upload("x").unwrap_err(),
        StoreError::StorageRootMissing { .. }
    ));
}
