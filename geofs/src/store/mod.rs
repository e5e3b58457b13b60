//! Content-addressed blob store.
//!
//! Blobs live at `content/<first-2-hex>/<digest-hex>` under the volume
//! root, written once via write-to-temp + rename and never mutated or
//! reclaimed. `put` is idempotent: identical content lands on the same
//! digest and is stored exactly once.

use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use walkdir::WalkDir;

use crate::digest::ContentDigest;
use crate::errors::{GeofsError, GeofsResult};

/// Append-only, deduplicated blob store.
pub struct ContentStore {
    root: PathBuf,
    state: Mutex<StoreState>,
}

struct StoreState {
    unique_blobs: u64,
    bytes_stored: u64,
    /// Capacity cap over physical blob bytes. `None` means unbounded.
    capacity: Option<u64>,
}

impl ContentStore {
    /// Open the store rooted at `root`, creating the directory if absent.
    /// Counters are rebuilt by scanning the shard directories.
    pub fn open(root: impl Into<PathBuf>, capacity: Option<u64>) -> GeofsResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        let mut unique_blobs = 0u64;
        let mut bytes_stored = 0u64;
        for entry in WalkDir::new(&root).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| {
                GeofsError::Io(e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::other("walkdir loop while scanning content store")
                }))
            })?;
            if entry.file_type().is_file() {
                unique_blobs += 1;
                bytes_stored += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }

        tracing::debug!(
            root = %root.display(),
            unique_blobs,
            bytes_stored,
            "opened content store"
        );

        Ok(Self {
            root,
            state: Mutex::new(StoreState {
                unique_blobs,
                bytes_stored,
                capacity,
            }),
        })
    }

    fn blob_path(&self, digest: &ContentDigest) -> PathBuf {
        self.root.join(digest.shard()).join(digest.to_hex())
    }

    /// Store `bytes`, returning their digest.
    ///
    /// Idempotent: if a blob with the same digest already exists the
    /// existing digest is returned without writing.
    pub fn put(&self, bytes: &[u8]) -> GeofsResult<ContentDigest> {
        let digest = ContentDigest::compute(bytes);
        let path = self.blob_path(&digest);

        if path.is_file() {
            tracing::trace!(digest = %digest, "content store hit, deduplicated");
            return Ok(digest);
        }

        {
            let state = self.state.lock();
            if let Some(cap) = state.capacity {
                if state.bytes_stored + bytes.len() as u64 > cap {
                    return Err(GeofsError::QuotaExceeded(format!(
                        "content store capacity {cap} bytes would be crossed"
                    )));
                }
            }
        }

        let shard_dir = self.root.join(digest.shard());
        std::fs::create_dir_all(&shard_dir)?;

        write_atomic(&shard_dir, &path, bytes)?;

        let mut state = self.state.lock();
        state.unique_blobs += 1;
        state.bytes_stored += bytes.len() as u64;
        tracing::trace!(digest = %digest, size = bytes.len(), "stored new blob");
        Ok(digest)
    }

    /// Fetch the bytes behind `digest`.
    pub fn get(&self, digest: &ContentDigest) -> GeofsResult<Vec<u8>> {
        match std::fs::read(self.blob_path(digest)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(GeofsError::not_found(
                format!("blob {}", digest.to_hex()),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a blob with this digest is present. Once true, always true.
    pub fn has(&self, digest: &ContentDigest) -> bool {
        self.blob_path(digest).is_file()
    }

    pub fn unique_blobs(&self) -> u64 {
        self.state.lock().unique_blobs
    }

    pub fn bytes_stored(&self) -> u64 {
        self.state.lock().bytes_stored
    }
}

/// Write `bytes` to `dest` atomically: temp file in the same directory,
/// flushed, then renamed over the destination.
pub fn write_atomic(dir: &Path, dest: &Path, bytes: &[u8]) -> GeofsResult<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(dest)
        .map_err(|e| GeofsError::Io(e.error))?;
    Ok(())
}
