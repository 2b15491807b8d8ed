use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::{tempdir, TempDir};

use crate::{
    HashTree, Storage, StorageConfig, StorageError, StorageState, MULTIFILE_PATHNAME,
};

fn config_in(dir: &Path) -> StorageConfig {
    StorageConfig::new(dir.join("content"), dir.join("dest"))
}

async fn open_client(dir: &Path) -> Storage {
    std::fs::create_dir_all(dir.join("dest")).unwrap();
    Storage::open(config_in(dir)).await
}

/// Build a spec whose declared size matches its real byte length: the
/// header line counts itself.
fn make_spec(entries: &[(&str, u64)]) -> Vec<u8> {
    let body: String = entries
        .iter()
        .map(|(path, size)| format!("{} {}\n", path, size))
        .collect();
    let mut total = body.len() as u64;
    loop {
        let header = format!("{} {}\n", MULTIFILE_PATHNAME, total);
        let t = (header.len() + body.len()) as u64;
        if t == total {
            let mut spec = header.into_bytes();
            spec.extend_from_slice(body.as_bytes());
            return spec;
        }
        total = t;
    }
}

struct RecordingHashTree {
    size: Arc<Mutex<Option<u64>>>,
}

impl HashTree for RecordingHashTree {
    fn set_size(&mut self, size: u64) {
        *self.size.lock().unwrap() = Some(size);
    }

    fn size(&self) -> Option<u64> {
        *self.size.lock().unwrap()
    }
}

#[tokio::test]
async fn test_client_single_file() {
    let dir = tempdir().unwrap();
    let mut storage = open_client(dir.path()).await;
    assert_eq!(storage.state(), StorageState::Init);
    assert!(storage.is_operational());

    let n = storage.write(b"abcd", 0).await.unwrap();
    assert_eq!(n, 4);
    assert_eq!(storage.state(), StorageState::SingleFile);

    let mut buf = [0u8; 4];
    let n = storage.read(&mut buf, 0).await.unwrap();
    assert_eq!(n, 4);
    assert_eq!(&buf, b"abcd");
    assert!(storage.size_from_spec().is_none());
    assert_eq!(storage.minimal_reserved_size(), Some(0));
}

#[tokio::test]
async fn test_client_multi_file() {
    let dir = tempdir().unwrap();
    let mut storage = open_client(dir.path()).await;

    let spec = make_spec(&[("a.txt", 3), ("b.txt", 2)]);
    let spec_len = spec.len() as u64;
    assert_eq!(spec_len, 46);

    let n = storage.write(&spec, 0).await.unwrap();
    assert_eq!(n, spec.len());
    assert_eq!(storage.state(), StorageState::SpecComplete);
    assert_eq!(storage.size_from_spec(), Some(spec_len + 5));

    let starts: Vec<u64> = storage.files().iter().map(|sf| sf.start()).collect();
    assert_eq!(starts, vec![0, spec_len, spec_len + 3]);

    let n = storage.write(b"XYZab", spec_len).await.unwrap();
    assert_eq!(n, 5);
    assert_eq!(
        std::fs::read(dir.path().join("dest").join("a.txt")).unwrap(),
        b"XYZ"
    );
    assert_eq!(
        std::fs::read(dir.path().join("dest").join("b.txt")).unwrap(),
        b"ab"
    );

    let mut buf = [0u8; 5];
    let n = storage.read(&mut buf, spec_len).await.unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf, b"XYZab");
}

#[tokio::test]
async fn test_spec_arriving_in_parts() {
    let dir = tempdir().unwrap();
    let mut storage = open_client(dir.path()).await;

    let spec = make_spec(&[("a.txt", 3), ("b.txt", 2)]);

    // First part carries the whole header line but not the whole spec.
    let n = storage.write(&spec[..30], 0).await.unwrap();
    assert_eq!(n, 30);
    assert_eq!(storage.state(), StorageState::SpecSizeKnown);
    assert!(storage.size_from_spec().is_none());
    assert!(storage.minimal_reserved_size().is_none());

    let n = storage.write(&spec[30..], 30).await.unwrap();
    assert_eq!(n, spec.len() - 30);
    assert_eq!(storage.state(), StorageState::SpecComplete);
    assert_eq!(storage.size_from_spec(), Some(spec.len() as u64 + 5));
    assert_eq!(storage.minimal_reserved_size(), Some(spec.len() as u64));
}

#[tokio::test]
async fn test_spec_completion_with_payload_in_same_chunk() {
    let dir = tempdir().unwrap();
    let mut storage = open_client(dir.path()).await;

    // One network chunk holds the whole spec plus the first payload bytes.
    let spec = make_spec(&[("a.txt", 3), ("b.txt", 2)]);
    let mut chunk = spec.clone();
    chunk.extend_from_slice(b"XYZab");

    let n = storage.write(&chunk, 0).await.unwrap();
    assert_eq!(n, chunk.len());
    assert_eq!(storage.state(), StorageState::SpecComplete);
    assert_eq!(
        std::fs::read(dir.path().join("dest").join("a.txt")).unwrap(),
        b"XYZ"
    );
    assert_eq!(
        std::fs::read(dir.path().join("dest").join("b.txt")).unwrap(),
        b"ab"
    );
}

#[tokio::test]
async fn test_seeding_existing_spec() {
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("dest")).unwrap();
    let spec = make_spec(&[("a.txt", 3), ("b.txt", 2)]);
    std::fs::write(dir.path().join("content"), &spec).unwrap();

    let storage = Storage::open(config_in(dir.path())).await;
    assert!(storage.is_operational());
    assert_eq!(storage.state(), StorageState::SpecComplete);
    assert_eq!(storage.size_from_spec(), Some(spec.len() as u64 + 5));
    assert_eq!(storage.minimal_reserved_size(), Some(spec.len() as u64));
    assert_eq!(storage.spec_size(), spec.len() as u64);
}

#[tokio::test]
async fn test_seeding_existing_single_file() {
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("dest")).unwrap();
    std::fs::write(dir.path().join("content"), b"plain payload").unwrap();

    let mut storage = Storage::open(config_in(dir.path())).await;
    assert!(storage.is_operational());
    assert_eq!(storage.state(), StorageState::SingleFile);

    let mut buf = [0u8; 5];
    let n = storage.read(&mut buf, 6).await.unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf, b"paylo");
}

#[tokio::test]
async fn test_seeding_spec_at_alternate_location() {
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("dest")).unwrap();
    let spec = make_spec(&[("a.txt", 3), ("b.txt", 2)]);
    std::fs::write(dir.path().join("checkpoint.mfspec"), &spec).unwrap();

    let mut config = config_in(dir.path());
    config.meta_spec_path = Some(dir.path().join("checkpoint.mfspec"));
    let storage = Storage::open(config).await;
    assert!(storage.is_operational());
    assert_eq!(storage.state(), StorageState::SpecComplete);
    assert_eq!(storage.size_from_spec(), Some(spec.len() as u64 + 5));
}

#[tokio::test]
async fn test_live_ring_wraps() {
    let dir = tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.live_window_bytes = 1024;
    let mut storage = Storage::open(config).await;
    assert_eq!(storage.state(), StorageState::SingleLiveWrap);
    assert!(storage.is_operational());

    // A write past the window lands at offset mod window.
    let n = storage.write(b"Z", 2048).await.unwrap();
    assert_eq!(n, 1);
    let mut buf = [0u8; 1];
    storage.read(&mut buf, 0).await.unwrap();
    assert_eq!(&buf, b"Z");

    // A write crossing the boundary splits at the window edge and wraps to
    // offset 0, possibly several times. The byte written last to each
    // physical slot wins.
    let payload: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
    let n = storage.write(&payload, 600).await.unwrap();
    assert_eq!(n, 1500);

    let mut expected = vec![0u8; 1024];
    expected[0] = b'Z';
    for (i, b) in payload.iter().enumerate() {
        expected[(600 + i) % 1024] = *b;
    }
    let disk = std::fs::read(dir.path().join("content")).unwrap();
    assert_eq!(disk.len(), 1024);
    assert_eq!(disk, expected);

    // The most recent write to any congruent offset is what a read sees.
    let mut buf = [0u8; 4];
    storage.read(&mut buf, 600).await.unwrap();
    assert_eq!(&buf, &expected[600..604]);
}

#[tokio::test]
async fn test_live_ring_reads_do_not_wrap() {
    let dir = tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.live_window_bytes = 1024;
    let mut storage = Storage::open(config).await;

    let payload = vec![0x5Au8; 1024];
    storage.write(&payload, 0).await.unwrap();

    // Reads land at offset mod window but do not split at the boundary:
    // a read near the end of the window comes back short.
    let mut buf = [0u8; 8];
    let n = storage.read(&mut buf, 1020).await.unwrap();
    assert_eq!(n, 4);
}

#[tokio::test]
async fn test_live_ring_newest_write_wins() {
    let dir = tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.live_window_bytes = 256;
    let mut storage = Storage::open(config).await;

    storage.write(&vec![b'A'; 256], 0).await.unwrap();
    storage.write(b"B", 256 + 5).await.unwrap();

    let mut buf = [0u8; 3];
    storage.read(&mut buf, 4).await.unwrap();
    assert_eq!(&buf, b"ABA");
}

#[tokio::test]
async fn test_unsafe_spec_breaks_storage() {
    let dir = tempdir().unwrap();
    let mut storage = open_client(dir.path()).await;

    let spec = make_spec(&[("../etc/passwd", 10)]);
    let err = storage.write(&spec, 0).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidData(_)));
    assert!(!storage.is_operational());

    // Nothing was created under the destination directory.
    let mut entries = std::fs::read_dir(dir.path().join("dest")).unwrap();
    assert!(entries.next().is_none());

    // The broken latch is sticky.
    let err = storage.write(b"more", 100).await.unwrap_err();
    assert!(matches!(err, StorageError::Broken(_)));
}

#[tokio::test]
async fn test_unsafe_spec_breaks_seeding() {
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("dest")).unwrap();
    let spec = make_spec(&[("/etc/passwd", 10)]);
    std::fs::write(dir.path().join("content"), &spec).unwrap();

    let storage = Storage::open(config_in(dir.path())).await;
    assert!(!storage.is_operational());
    let mut entries = std::fs::read_dir(dir.path().join("dest")).unwrap();
    assert!(entries.next().is_none());
}

#[tokio::test]
async fn test_deferred_resize_applied_on_first_open() {
    let dir = tempdir().unwrap();
    let mut storage = open_client(dir.path()).await;

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    storage.set_alloc_callback(Box::new(move |_td| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    // No file open yet: the reservation is deferred, not an error.
    storage.resize_reserved(1 << 30).await.unwrap();
    assert_eq!(storage.state(), StorageState::Init);
    assert!(storage.reserved_size().await.is_err());

    storage.write(b"abcd", 0).await.unwrap();
    assert_eq!(storage.state(), StorageState::SingleFile);
    assert_eq!(storage.reserved_size().await.unwrap(), 1 << 30);

    // The allocation callback is one-shot.
    storage.resize_reserved(1 << 30).await.unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_multi_file_coverage_is_contiguous() {
    let dir = tempdir().unwrap();
    let mut storage = open_client(dir.path()).await;

    let spec = make_spec(&[("x.bin", 4), ("docs/read me.txt", 7), ("z.bin", 1)]);
    storage.write(&spec, 0).await.unwrap();

    let files = storage.files();
    assert_eq!(files[0].start(), 0);
    for pair in files.windows(2) {
        assert_eq!(pair[1].start(), pair[0].limit());
    }
    let total: u64 = files.iter().map(|sf| sf.size()).sum();
    assert_eq!(storage.size_from_spec(), Some(total));

    // Entries with subdirectories were created under dest_dir.
    assert!(dir
        .path()
        .join("dest")
        .join("docs")
        .join("read me.txt")
        .exists());
}

#[tokio::test]
async fn test_write_spanning_several_boundaries() {
    let dir = tempdir().unwrap();
    let mut storage = open_client(dir.path()).await;

    let spec = make_spec(&[("x.bin", 4), ("y.bin", 4), ("z.bin", 4)]);
    let base = spec.len() as u64;
    storage.write(&spec, 0).await.unwrap();

    let payload: Vec<u8> = (1..=10u8).collect();
    let n = storage.write(&payload, base + 2).await.unwrap();
    assert_eq!(n, 10);

    let x = std::fs::read(dir.path().join("dest").join("x.bin")).unwrap();
    let y = std::fs::read(dir.path().join("dest").join("y.bin")).unwrap();
    let z = std::fs::read(dir.path().join("dest").join("z.bin")).unwrap();
    assert_eq!(&x[2..4], &payload[..2]);
    assert_eq!(&y[..], &payload[2..6]);
    assert_eq!(&z[..], &payload[6..10]);

    // Round trip through the same mapping.
    let mut buf = vec![0u8; 10];
    let n = storage.read(&mut buf, base + 2).await.unwrap();
    assert_eq!(n, 10);
    assert_eq!(buf, payload);
}

#[tokio::test]
async fn test_resize_reserved_is_grow_only() {
    let dir = tempdir().unwrap();
    let mut storage = open_client(dir.path()).await;

    let spec = make_spec(&[("a.txt", 3), ("b.txt", 2)]);
    let total = spec.len() as u64 + 5;
    storage.write(&spec, 0).await.unwrap();
    assert_eq!(storage.reserved_size().await.unwrap(), total);

    // Same size again and a smaller size are both no-ops.
    storage.resize_reserved(total).await.unwrap();
    assert_eq!(storage.reserved_size().await.unwrap(), total);
    storage.resize_reserved(10).await.unwrap();
    assert_eq!(storage.reserved_size().await.unwrap(), total);
}

#[tokio::test]
async fn test_hash_tree_learns_size_from_spec() {
    let dir = tempdir().unwrap();
    let mut storage = open_client(dir.path()).await;

    let reported = Arc::new(Mutex::new(None));
    storage.set_hash_tree(Box::new(RecordingHashTree {
        size: reported.clone(),
    }));

    let spec = make_spec(&[("a.txt", 3), ("b.txt", 2)]);
    storage.write(&spec, 0).await.unwrap();
    assert_eq!(*reported.lock().unwrap(), Some(spec.len() as u64 + 5));
}

#[tokio::test]
async fn test_read_before_first_chunk_is_invalid() {
    let dir = tempdir().unwrap();
    let mut storage = open_client(dir.path()).await;

    let mut buf = [0u8; 4];
    let err = storage.read(&mut buf, 0).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidState(_)));
}

#[tokio::test]
async fn test_write_outside_mapped_range_fails() {
    let dir = tempdir().unwrap();
    let mut storage = open_client(dir.path()).await;

    let spec = make_spec(&[("a.txt", 3)]);
    storage.write(&spec, 0).await.unwrap();
    let total = storage.size_from_spec().unwrap();

    let err = storage.write(b"overflow", total + 10).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidParam(_)));
}

#[tokio::test]
async fn test_first_write_at_nonzero_offset_is_tolerated() {
    let dir = tempdir().unwrap();
    let mut storage = open_client(dir.path()).await;

    // A live swarm tuned into mid-stream: tolerated, not rejected.
    let n = storage.write(b"late", 4096).await.unwrap();
    assert_eq!(n, 4);
    assert_eq!(storage.state(), StorageState::SingleFile);

    let mut buf = [0u8; 4];
    storage.read(&mut buf, 4096).await.unwrap();
    assert_eq!(&buf, b"late");
}

#[tokio::test]
async fn test_config_from_json() {
    let config = StorageConfig::from_json_str(
        r#"{"os_path":"/tmp/content","dest_dir":"/tmp/dest","transfer_id":7}"#,
    )
    .unwrap();
    assert_eq!(config.transfer_id, 7);
    assert_eq!(config.live_window_bytes, 0);
    assert!(config.meta_spec_path.is_none());

    let err = StorageConfig::from_json_str("not json").unwrap_err();
    assert!(matches!(err, StorageError::InvalidData(_)));
}

// Keep a TempDir alive alongside a storage for drop-order tests.
#[tokio::test]
async fn test_drop_releases_backing_files() {
    let dir: TempDir = tempdir().unwrap();
    {
        let mut storage = open_client(dir.path()).await;
        storage.write(b"abcd", 0).await.unwrap();
    }
    // All descriptors are closed; the file can be reopened exclusively.
    let reopened = Storage::open(config_in(dir.path())).await;
    assert!(reopened.is_operational());
    assert_eq!(reopened.state(), StorageState::SingleFile);
}
