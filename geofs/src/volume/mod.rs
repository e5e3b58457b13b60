//! The GeoFS volume facade.
//!
//! A volume composes the content store, the ref index and the view graph
//! behind one handle. Writers extend the single unsealed *working view*;
//! `snapshot` is the commit point that seals it into an immutable
//! stratum. Reads resolve against the *read binding*: the head (working
//! view plus its ancestors) by default, or a sealed view pinned by
//! `switch`.
//!
//! Concurrency follows the single-writer principle: the interior write
//! lock is the volume's write lease and serializes `write`, `hide`,
//! `snapshot` and `switch`; readers share the lock and never block each
//! other. Content I/O happens before the lease is taken, so a failed put
//! leaves the index untouched.

mod layout;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::deadline::Deadline;
use crate::errors::{GeofsError, GeofsResult};
use crate::path;
use crate::refs::{Delta, DeltaLookup, RefEntry, RefKind};
use crate::store::{ContentStore, write_atomic};
use crate::views::{SealedView, ViewGraph, ViewId, ViewRecord};

pub use layout::VolumeLayout;

/// Tunables supplied at `create`/`open` time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeOptions {
    /// Advisory budget over logical bytes recorded in ref entries.
    /// Crossing it fails `write` with `quota-exceeded`.
    pub quota_bytes: Option<u64>,
    /// Hard capacity of the physical content store.
    pub store_capacity: Option<u64>,
}

/// Aggregate counters reported by [`Volume::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeStats {
    /// Sealed views.
    pub views: u64,
    /// Ref entries across all sealed views plus the working view.
    pub refs: u64,
    /// Distinct blobs in the content store.
    pub unique_blobs: u64,
    /// Physical bytes held by the content store.
    pub bytes_stored: u64,
    /// Logical bytes written minus physical bytes stored.
    pub dedup_savings: u64,
}

/// What reads currently resolve against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadBinding {
    /// The working view and its ancestors; follows each seal.
    Head,
    /// A sealed view chosen by `switch`.
    Pinned(ViewId),
}

struct WorkingView {
    id: ViewId,
    parent: Option<ViewId>,
    delta: Delta,
}

struct VolumeState {
    graph: ViewGraph,
    working: WorkingView,
    binding: ReadBinding,
}

impl VolumeState {
    fn current_id(&self) -> ViewId {
        match self.binding {
            ReadBinding::Head => self.working.id,
            ReadBinding::Pinned(id) => id,
        }
    }

    /// Resolve `path` at `view`, which may be the unsealed working view.
    fn resolve_at(&self, view: ViewId, path: &str) -> GeofsResult<Option<RefEntry>> {
        if view == self.working.id {
            return match self.working.delta.lookup(path) {
                DeltaLookup::Entry(entry) => Ok(Some(entry.clone())),
                DeltaLookup::Hidden => Ok(None),
                DeltaLookup::Absent => match self.working.parent {
                    Some(parent) => self.graph.resolve(parent, path),
                    None => Ok(None),
                },
            };
        }
        self.graph.resolve(view, path)
    }

    /// Delta chain for `view`, nearest first.
    fn chain_at(&self, view: ViewId) -> GeofsResult<Vec<&Delta>> {
        if view == self.working.id {
            let mut chain = vec![&self.working.delta];
            if let Some(parent) = self.working.parent {
                chain.extend(self.graph.chain(parent)?);
            }
            return Ok(chain);
        }
        self.graph.chain(view)
    }

    fn list_at(&self, view: ViewId, dir: &str) -> GeofsResult<Vec<(String, RefEntry)>> {
        if dir != "/" {
            match self.resolve_at(view, dir)? {
                Some(entry) if entry.kind == RefKind::Directory => {}
                Some(_) => {
                    return Err(GeofsError::invalid(format!("not a directory: {dir}")));
                }
                None => return Err(GeofsError::not_found(dir)),
            }
        }

        // Nearest delta decides each name; a hide and an entry never
        // coexist for one path within a single delta.
        let mut decided: BTreeMap<String, Option<RefEntry>> = BTreeMap::new();
        for delta in self.chain_at(view)? {
            for hidden in delta.hidden() {
                if path::is_direct_child(dir, hidden) {
                    let name = path::file_name(hidden).unwrap_or_default().to_string();
                    decided.entry(name).or_insert(None);
                }
            }
            for (entry_path, entry) in delta.entries() {
                if path::is_direct_child(dir, entry_path) {
                    let name = path::file_name(entry_path).unwrap_or_default().to_string();
                    decided.entry(name).or_insert_with(|| Some(entry.clone()));
                }
            }
        }

        Ok(decided
            .into_iter()
            .filter_map(|(name, entry)| entry.map(|e| (name, e)))
            .collect())
    }

    fn logical_bytes(&self) -> u64 {
        self.graph.total_logical_bytes() + self.working.delta.logical_bytes()
    }
}

struct VolumeShared {
    layout: VolumeLayout,
    store: ContentStore,
    state: RwLock<VolumeState>,
    quota_bytes: Option<u64>,
}

/// Handle to a preservation-first volume. Cheap to clone; all clones
/// share state.
#[derive(Clone)]
pub struct Volume {
    shared: Arc<VolumeShared>,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("root", &self.shared.layout.root())
            .finish()
    }
}

impl Volume {
    /// Create a fresh volume at `root`, sealing the empty bedrock view.
    pub fn create(root: impl Into<PathBuf>) -> GeofsResult<Self> {
        Self::create_with(root, VolumeOptions::default())
    }

    pub fn create_with(root: impl Into<PathBuf>, options: VolumeOptions) -> GeofsResult<Self> {
        let layout = VolumeLayout::new(root);
        layout.prepare()?;

        if layout.index_path().exists() {
            return Err(GeofsError::Exists(format!(
                "volume at {}",
                layout.root().display()
            )));
        }

        let store = ContentStore::open(layout.content_dir(), options.store_capacity)?;

        let mut graph = ViewGraph::new();
        let bedrock = SealedView {
            record: ViewRecord {
                id: ViewId(0),
                parent: None,
                label: "bedrock".to_string(),
                created: Utc::now(),
            },
            delta: Delta::new(),
        };

        let view_dir = layout.view_dir(ViewId(0));
        std::fs::create_dir_all(&view_dir)?;
        write_atomic(&view_dir, &layout.delta_path(ViewId(0)), &[])?;
        write_atomic(&view_dir, &layout.hide_path(ViewId(0)), &[])?;

        graph.append(bedrock)?;
        write_atomic(
            &layout.views_dir(),
            &layout.index_path(),
            &graph.encode_index(),
        )?;

        tracing::info!(root = %layout.root().display(), "created volume");

        Ok(Self {
            shared: Arc::new(VolumeShared {
                layout,
                store,
                state: RwLock::new(VolumeState {
                    graph,
                    working: WorkingView {
                        id: ViewId(1),
                        parent: Some(ViewId(0)),
                        delta: Delta::new(),
                    },
                    binding: ReadBinding::Head,
                }),
                quota_bytes: options.quota_bytes,
            }),
        })
    }

    /// Open an existing volume, reloading every sealed view.
    ///
    /// Crash recovery: a `refs/<id>/` directory whose id is absent from
    /// `views/index` belongs to a working view that was never sealed; it
    /// is ignored, never deleted.
    pub fn open(root: impl Into<PathBuf>) -> GeofsResult<Self> {
        Self::open_with(root, VolumeOptions::default())
    }

    pub fn open_with(root: impl Into<PathBuf>, options: VolumeOptions) -> GeofsResult<Self> {
        let layout = VolumeLayout::new(root);

        let index_bytes = match std::fs::read(layout.index_path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(GeofsError::not_found(format!(
                    "volume at {}",
                    layout.root().display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let records = ViewGraph::decode_index(&index_bytes)?;

        let store = ContentStore::open(layout.content_dir(), options.store_capacity)?;

        let mut graph = ViewGraph::new();
        for record in records {
            let id = record.id;
            let entries = std::fs::read(layout.delta_path(id)).map_err(|e| {
                GeofsError::Corrupt(format!("sealed view {id} has no delta file: {e}"))
            })?;
            let hidden = std::fs::read(layout.hide_path(id)).map_err(|e| {
                GeofsError::Corrupt(format!("sealed view {id} has no hide file: {e}"))
            })?;
            graph.append(SealedView {
                record,
                delta: Delta::decode(&entries, &hidden)?,
            })?;
        }

        Self::report_orphan_deltas(&layout, &graph)?;

        let next = graph.max_id().map(|id| id.0 + 1).unwrap_or(0);
        let parent = graph.max_id();

        tracing::info!(
            root = %layout.root().display(),
            views = graph.len(),
            "opened volume"
        );

        Ok(Self {
            shared: Arc::new(VolumeShared {
                layout,
                store,
                state: RwLock::new(VolumeState {
                    graph,
                    working: WorkingView {
                        id: ViewId(next),
                        parent,
                        delta: Delta::new(),
                    },
                    binding: ReadBinding::Head,
                }),
                quota_bytes: options.quota_bytes,
            }),
        })
    }

    fn report_orphan_deltas(layout: &VolumeLayout, graph: &ViewGraph) -> GeofsResult<()> {
        for entry in std::fs::read_dir(layout.refs_dir())? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|s| s.parse::<u64>().ok()) else {
                continue;
            };
            if !graph.contains(ViewId(id)) {
                tracing::warn!(
                    view = id,
                    "ignoring delta of un-sealed working view left by a crash"
                );
            }
        }
        Ok(())
    }

    pub fn layout(&self) -> &VolumeLayout {
        &self.shared.layout
    }

    // ------------------------------------------------------------------
    // Writes (serialized by the write lease)
    // ------------------------------------------------------------------

    /// Record `bytes` at `path` in the working view, creating missing
    /// parent directories as directory-kind entries.
    pub fn write(&self, path: &str, bytes: &[u8]) -> GeofsResult<()> {
        self.write_deadline(path, bytes, Deadline::NONE)
    }

    pub fn write_deadline(&self, path: &str, bytes: &[u8], deadline: Deadline) -> GeofsResult<()> {
        let path = path::normalize(path)?;
        if path == "/" {
            return Err(GeofsError::invalid("cannot write the volume root"));
        }
        deadline.check("write")?;

        // Validate against the head before touching the store.
        {
            let state = self.shared.state.read();
            Self::check_write_target(&state, &path)?;
            if let Some(quota) = self.shared.quota_bytes {
                if state.logical_bytes() + bytes.len() as u64 > quota {
                    return Err(GeofsError::QuotaExceeded(format!(
                        "volume quota {quota} bytes would be crossed by {path}"
                    )));
                }
            }
        }

        deadline.check("write")?;
        let digest = self.shared.store.put(bytes)?;

        deadline.check("write")?;
        let mut state = self.shared.state.write();
        Self::check_write_target(&state, &path)?;
        Self::insert_parents(&mut state, &path)?;
        state
            .working
            .delta
            .insert(path.clone(), RefEntry::file(digest, bytes.len() as u64));

        tracing::debug!(%path, size = bytes.len(), digest = %digest, "recorded ref entry");
        Ok(())
    }

    fn check_write_target(state: &VolumeState, path: &str) -> GeofsResult<()> {
        let head = state.working.id;
        if let Some(existing) = state.resolve_at(head, path)? {
            if existing.kind == RefKind::Directory {
                return Err(GeofsError::invalid(format!("is a directory: {path}")));
            }
        }
        for ancestor in path::ancestors(path) {
            if let Some(entry) = state.resolve_at(head, &ancestor)? {
                if entry.kind != RefKind::Directory {
                    return Err(GeofsError::invalid(format!(
                        "not a directory: {ancestor}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn insert_parents(state: &mut VolumeState, path: &str) -> GeofsResult<()> {
        let head = state.working.id;
        for ancestor in path::ancestors(path).into_iter().rev() {
            if state.resolve_at(head, &ancestor)?.is_none() {
                state
                    .working
                    .delta
                    .insert(ancestor, RefEntry::directory());
            }
        }
        Ok(())
    }

    /// Record an explicit directory entry.
    pub fn mkdir(&self, path: &str) -> GeofsResult<()> {
        let path = path::normalize(path)?;
        if path == "/" {
            return Err(GeofsError::Exists("/".to_string()));
        }
        let mut state = self.shared.state.write();
        if state.resolve_at(state.working.id, &path)?.is_some() {
            return Err(GeofsError::Exists(path));
        }
        Self::insert_parents(&mut state, &path)?;
        state.working.delta.insert(path, RefEntry::directory());
        Ok(())
    }

    /// Record a symlink whose content is the target path.
    pub fn symlink(&self, path: &str, target: &str) -> GeofsResult<()> {
        let path = path::normalize(path)?;
        if path == "/" {
            return Err(GeofsError::invalid("cannot symlink the volume root"));
        }
        let digest = self.shared.store.put(target.as_bytes())?;
        let mut state = self.shared.state.write();
        if state.resolve_at(state.working.id, &path)?.is_some() {
            return Err(GeofsError::Exists(path));
        }
        Self::insert_parents(&mut state, &path)?;
        state.working.delta.insert(
            path,
            RefEntry::symlink(digest, target.len() as u64),
        );
        Ok(())
    }

    /// Make `path` absent from the working view and its descendants.
    /// Idempotent: hiding an absent path succeeds without effect. The
    /// entry remains resolvable in every ancestor view.
    pub fn hide(&self, path: &str) -> GeofsResult<()> {
        self.hide_deadline(path, Deadline::NONE)
    }

    pub fn hide_deadline(&self, path: &str, deadline: Deadline) -> GeofsResult<()> {
        let path = path::normalize(path)?;
        if path == "/" {
            return Err(GeofsError::invalid("cannot hide the volume root"));
        }
        deadline.check("hide")?;

        let mut state = self.shared.state.write();
        if state.resolve_at(state.working.id, &path)?.is_none() {
            tracing::trace!(%path, "hide of absent path, nothing to do");
            return Ok(());
        }
        state.working.delta.hide(path.clone());
        tracing::debug!(%path, "hid path in working view");
        Ok(())
    }

    /// Seal the working view under `label` and start a fresh working
    /// view parented on it. This is the commit point: the sealed delta
    /// and the updated index reach disk before the in-memory graph
    /// changes.
    pub fn snapshot(&self, label: &str) -> GeofsResult<ViewId> {
        self.snapshot_deadline(label, Deadline::NONE)
    }

    pub fn snapshot_deadline(&self, label: &str, deadline: Deadline) -> GeofsResult<ViewId> {
        deadline.check("snapshot")?;
        let mut state = self.shared.state.write();

        let sealed_id = state.working.id;
        let record = ViewRecord {
            id: sealed_id,
            parent: state.working.parent,
            label: label.to_string(),
            created: Utc::now(),
        };

        let view_dir = self.shared.layout.view_dir(sealed_id);
        std::fs::create_dir_all(&view_dir)?;
        deadline.check("snapshot")?;
        write_atomic(
            &view_dir,
            &self.shared.layout.delta_path(sealed_id),
            &state.working.delta.encode_entries(),
        )?;
        write_atomic(
            &view_dir,
            &self.shared.layout.hide_path(sealed_id),
            &state.working.delta.encode_hidden(),
        )?;

        deadline.check("snapshot")?;
        let index = state.graph.encode_index_with(&record);
        write_atomic(
            &self.shared.layout.views_dir(),
            &self.shared.layout.index_path(),
            &index,
        )?;

        // Durable from here on; mutate memory last.
        let delta = std::mem::take(&mut state.working.delta);
        state.graph.append(SealedView { record, delta })?;
        state.working = WorkingView {
            id: ViewId(sealed_id.0 + 1),
            parent: Some(sealed_id),
            delta: Delta::new(),
        };

        tracing::info!(view = %sealed_id, label, "sealed view");
        Ok(sealed_id)
    }

    /// Bind subsequent reads to `view`. Passing the working view's id
    /// re-binds reads to the head. Reader-side only; the working view is
    /// unaffected.
    pub fn switch(&self, view: ViewId) -> GeofsResult<()> {
        let mut state = self.shared.state.write();
        if view == state.working.id {
            state.binding = ReadBinding::Head;
        } else if state.graph.contains(view) {
            state.binding = ReadBinding::Pinned(view);
        } else {
            return Err(GeofsError::not_found(format!("view {view}")));
        }
        tracing::debug!(view = %view, "switched read binding");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads (shared access)
    // ------------------------------------------------------------------

    /// The view id reads currently resolve against.
    pub fn current_view(&self) -> ViewId {
        self.shared.state.read().current_id()
    }

    /// The unsealed working view's id.
    pub fn working_view(&self) -> ViewId {
        self.shared.state.read().working.id
    }

    pub fn read(&self, path: &str) -> GeofsResult<Vec<u8>> {
        let view = self.current_view();
        self.read_at(view, path)
    }

    pub fn read_deadline(&self, path: &str, deadline: Deadline) -> GeofsResult<Vec<u8>> {
        deadline.check("read")?;
        self.read(path)
    }

    /// Read `path` as of a specific view.
    pub fn read_at(&self, view: ViewId, path: &str) -> GeofsResult<Vec<u8>> {
        let path = path::normalize(path)?;
        let entry = {
            let state = self.shared.state.read();
            state
                .resolve_at(view, &path)?
                .ok_or_else(|| GeofsError::not_found(&path))?
        };
        if entry.kind == RefKind::Directory {
            return Err(GeofsError::invalid(format!("is a directory: {path}")));
        }
        self.shared.store.get(&entry.digest)
    }

    pub fn exists(&self, path: &str) -> GeofsResult<bool> {
        let view = self.current_view();
        self.exists_at(view, path)
    }

    pub fn exists_at(&self, view: ViewId, path: &str) -> GeofsResult<bool> {
        Ok(self.lookup_at(view, path)?.is_some())
    }

    /// Ref entry for `path` at the current read binding.
    pub fn lookup(&self, path: &str) -> GeofsResult<Option<RefEntry>> {
        let view = self.current_view();
        self.lookup_at(view, path)
    }

    pub fn lookup_at(&self, view: ViewId, path: &str) -> GeofsResult<Option<RefEntry>> {
        let path = path::normalize(path)?;
        let state = self.shared.state.read();
        if path == "/" {
            return Ok(Some(RefEntry::directory()));
        }
        state.resolve_at(view, &path)
    }

    /// Children of `dir` at the current read binding, ordered by name
    /// byte value.
    pub fn list(&self, dir: &str) -> GeofsResult<Vec<(String, RefEntry)>> {
        let view = self.current_view();
        self.list_at(view, dir)
    }

    pub fn list_at(&self, view: ViewId, dir: &str) -> GeofsResult<Vec<(String, RefEntry)>> {
        let dir = path::normalize(dir)?;
        let state = self.shared.state.read();
        state.list_at(view, &dir)
    }

    /// Resolve a symlink entry to its target path.
    pub fn readlink(&self, path: &str) -> GeofsResult<String> {
        let view = self.current_view();
        let entry = self
            .lookup_at(view, path)?
            .ok_or_else(|| GeofsError::not_found(path))?;
        if entry.kind != RefKind::Symlink {
            return Err(GeofsError::invalid(format!("not a symlink: {path}")));
        }
        let bytes = self.shared.store.get(&entry.digest)?;
        String::from_utf8(bytes)
            .map_err(|e| GeofsError::Corrupt(format!("symlink target is not utf-8: {e}")))
    }

    /// Sealed views in creation order.
    pub fn list_views(&self) -> Vec<ViewRecord> {
        self.shared.state.read().graph.records().cloned().collect()
    }

    pub fn parent(&self, view: ViewId) -> GeofsResult<Option<ViewId>> {
        self.shared.state.read().graph.parent_of(view)
    }

    pub fn stats(&self) -> VolumeStats {
        let state = self.shared.state.read();
        let logical = state.logical_bytes();
        let bytes_stored = self.shared.store.bytes_stored();
        VolumeStats {
            views: state.graph.len(),
            refs: state.graph.total_entries() + state.working.delta.entry_count(),
            unique_blobs: self.shared.store.unique_blobs(),
            bytes_stored,
            dedup_savings: logical.saturating_sub(bytes_stored),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::ContentDigest;
    use std::time::Duration;
    use tempfile::tempdir;

    fn volume() -> (tempfile::TempDir, Volume) {
        let dir = tempdir().unwrap();
        let vol = Volume::create(dir.path().join("vol")).unwrap();
        (dir, vol)
    }

    #[test]
    fn test_write_read_round_trip() {
        let (_dir, vol) = volume();
        vol.write("/a", b"hello").unwrap();
        vol.snapshot("v1").unwrap();
        assert_eq!(vol.read("/a").unwrap(), b"hello");
        assert_eq!(vol.stats().unique_blobs, 1);
    }

    #[test]
    fn test_deduplication() {
        let (_dir, vol) = volume();
        vol.write("/a", b"dup").unwrap();
        vol.write("/b", b"dup").unwrap();
        vol.snapshot("v1").unwrap();
        assert_eq!(vol.read("/a").unwrap(), b"dup");
        assert_eq!(vol.read("/b").unwrap(), b"dup");
        let stats = vol.stats();
        assert_eq!(stats.unique_blobs, 1);
        assert_eq!(stats.refs, 2);
        assert_eq!(stats.dedup_savings, 3);
    }

    #[test]
    fn test_hide_preserves_history() {
        let (_dir, vol) = volume();
        vol.write("/x", b"one").unwrap();
        let v1 = vol.snapshot("v1").unwrap();
        vol.hide("/x").unwrap();
        let v2 = vol.snapshot("v2").unwrap();

        assert!(!vol.exists("/x").unwrap());
        vol.switch(v1).unwrap();
        assert_eq!(vol.read("/x").unwrap(), b"one");
        vol.switch(v2).unwrap();
        assert!(!vol.exists("/x").unwrap());
    }

    #[test]
    fn test_view_tree_shape() {
        let (_dir, vol) = volume();
        vol.write("/a", b"A").unwrap();
        let v1 = vol.snapshot("v1").unwrap();
        vol.hide("/a").unwrap();
        let v2 = vol.snapshot("v2").unwrap();

        let v0 = ViewId(0);
        assert_eq!(vol.parent(v2).unwrap(), Some(v1));
        assert_eq!(vol.parent(v1).unwrap(), Some(v0));
        assert_eq!(vol.parent(v0).unwrap(), None);
        let ids: Vec<ViewId> = vol.list_views().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![v0, v1, v2]);
        assert_eq!(vol.list_views()[0].label, "bedrock");
    }

    #[test]
    fn test_write_twice_single_entry_single_blob() {
        let (_dir, vol) = volume();
        vol.write("/a", b"same").unwrap();
        vol.write("/a", b"same").unwrap();
        let stats = vol.stats();
        assert_eq!(stats.refs, 1);
        assert_eq!(stats.unique_blobs, 1);
    }

    #[test]
    fn test_hide_is_idempotent() {
        let (_dir, vol) = volume();
        vol.write("/a", b"x").unwrap();
        vol.snapshot("v1").unwrap();
        let views_before = vol.list_views().len();
        vol.hide("/a").unwrap();
        vol.hide("/a").unwrap();
        vol.hide("/never-existed").unwrap();
        assert_eq!(vol.list_views().len(), views_before);
        assert!(!vol.exists("/a").unwrap());
    }

    #[test]
    fn test_consecutive_snapshots_chain() {
        let (_dir, vol) = volume();
        let v1 = vol.snapshot("L1").unwrap();
        let v2 = vol.snapshot("L2").unwrap();
        assert_ne!(v1, v2);
        assert_eq!(vol.parent(v2).unwrap(), Some(v1));
    }

    #[test]
    fn test_hide_in_working_view_erases_write() {
        let (_dir, vol) = volume();
        vol.write("/a", b"short lived").unwrap();
        vol.hide("/a").unwrap();
        assert!(!vol.exists("/a").unwrap());
        vol.snapshot("v1").unwrap();
        assert!(!vol.exists("/a").unwrap());
        assert_eq!(vol.stats().refs, 0);
    }

    #[test]
    fn test_implicit_parent_directories() {
        let (_dir, vol) = volume();
        vol.write("/deep/nest/file", b"x").unwrap();
        let entry = vol.lookup("/deep").unwrap().unwrap();
        assert_eq!(entry.kind, RefKind::Directory);
        let listed = vol.list("/deep").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "nest");
    }

    #[test]
    fn test_write_through_file_component_rejected() {
        let (_dir, vol) = volume();
        vol.write("/plain", b"file").unwrap();
        assert!(matches!(
            vol.write("/plain/child", b"x"),
            Err(GeofsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_list_ordering_by_byte_value() {
        let (_dir, vol) = volume();
        vol.write("/dir/b", b"2").unwrap();
        vol.write("/dir/a", b"1").unwrap();
        vol.write("/dir/Z", b"0").unwrap();
        let names: Vec<String> = vol.list("/dir").unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Z", "a", "b"]);
    }

    #[test]
    fn test_escape_above_root_invalid() {
        let (_dir, vol) = volume();
        assert!(matches!(
            vol.read("/../etc/passwd"),
            Err(GeofsError::InvalidArgument(_))
        ));
        assert!(matches!(
            vol.write("/a/../../b", b"x"),
            Err(GeofsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_switch_unknown_view_not_found() {
        let (_dir, vol) = volume();
        assert!(matches!(
            vol.switch(ViewId(99)),
            Err(GeofsError::NotFound(_))
        ));
    }

    #[test]
    fn test_sealed_view_resolution_is_stable() {
        let (_dir, vol) = volume();
        vol.write("/a", b"first").unwrap();
        let v1 = vol.snapshot("v1").unwrap();
        let before = vol.lookup_at(v1, "/a").unwrap().unwrap();

        vol.write("/a", b"second").unwrap();
        vol.snapshot("v2").unwrap();

        let after = vol.lookup_at(v1, "/a").unwrap().unwrap();
        assert_eq!(before, after);
        assert_eq!(vol.read_at(v1, "/a").unwrap(), b"first");
        assert_eq!(vol.read("/a").unwrap(), b"second");
    }

    #[test]
    fn test_reopen_preserves_views() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("vol");
        let v1;
        {
            let vol = Volume::create(&root).unwrap();
            vol.write("/a", b"persisted").unwrap();
            v1 = vol.snapshot("v1").unwrap();
        }
        let vol = Volume::open(&root).unwrap();
        assert_eq!(vol.read("/a").unwrap(), b"persisted");
        assert_eq!(vol.read_at(v1, "/a").unwrap(), b"persisted");
        assert_eq!(vol.list_views().len(), 2);
        // working view id advanced past every sealed id
        assert_eq!(vol.working_view(), ViewId(2));
    }

    #[test]
    fn test_unsealed_writes_lost_on_reopen() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("vol");
        {
            let vol = Volume::create(&root).unwrap();
            vol.write("/committed", b"yes").unwrap();
            vol.snapshot("v1").unwrap();
            vol.write("/uncommitted", b"no").unwrap();
            // no snapshot; the working delta never reaches the index
        }
        let vol = Volume::open(&root).unwrap();
        assert!(vol.exists("/committed").unwrap());
        assert!(!vol.exists("/uncommitted").unwrap());
    }

    #[test]
    fn test_orphan_delta_ignored_on_open() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("vol");
        {
            let vol = Volume::create(&root).unwrap();
            vol.write("/a", b"x").unwrap();
            vol.snapshot("v1").unwrap();
        }
        // simulate a crash that left a partial delta for an unsealed view
        let orphan = root.join("refs").join("2");
        std::fs::create_dir_all(&orphan).unwrap();
        std::fs::write(orphan.join("delta"), b"partial garbage").unwrap();

        let vol = Volume::open(&root).unwrap();
        assert_eq!(vol.list_views().len(), 2);
        assert_eq!(vol.read("/a").unwrap(), b"x");
    }

    #[test]
    fn test_quota_exceeded_commits_nothing() {
        let dir = tempdir().unwrap();
        let vol = Volume::create_with(
            dir.path().join("vol"),
            VolumeOptions {
                quota_bytes: Some(8),
                store_capacity: None,
            },
        )
        .unwrap();
        vol.write("/a", b"12345").unwrap();
        let err = vol.write("/b", b"67890").unwrap_err();
        assert!(matches!(err, GeofsError::QuotaExceeded(_)));
        assert!(!vol.exists("/b").unwrap());
        assert_eq!(vol.read("/a").unwrap(), b"12345");
    }

    #[test]
    fn test_expired_deadline_commits_nothing() {
        let (_dir, vol) = volume();
        let gone = Deadline::at(std::time::Instant::now() - Duration::from_millis(1));
        assert!(matches!(
            vol.write_deadline("/a", b"x", gone),
            Err(GeofsError::DeadlineExceeded(_))
        ));
        assert!(!vol.exists("/a").unwrap());
        assert!(matches!(
            vol.snapshot_deadline("v1", gone),
            Err(GeofsError::DeadlineExceeded(_))
        ));
        assert_eq!(vol.list_views().len(), 1);
    }

    #[test]
    fn test_empty_content_round_trip() {
        let (_dir, vol) = volume();
        vol.write("/empty", b"").unwrap();
        assert_eq!(vol.read("/empty").unwrap(), b"");
        assert_eq!(
            vol.lookup("/empty").unwrap().unwrap().digest,
            ContentDigest::empty()
        );
    }

    #[test]
    fn test_symlink_round_trip() {
        let (_dir, vol) = volume();
        vol.write("/target", b"content").unwrap();
        vol.symlink("/link", "/target").unwrap();
        assert_eq!(vol.readlink("/link").unwrap(), "/target");
        assert!(matches!(
            vol.readlink("/target"),
            Err(GeofsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_mkdir_exists() {
        let (_dir, vol) = volume();
        vol.mkdir("/d").unwrap();
        assert!(matches!(vol.mkdir("/d"), Err(GeofsError::Exists(_))));
        vol.write("/f", b"x").unwrap();
        assert!(matches!(vol.mkdir("/f"), Err(GeofsError::Exists(_))));
    }

    #[test]
    fn test_create_refuses_existing_volume() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("vol");
        Volume::create(&root).unwrap();
        assert!(matches!(
            Volume::create(&root),
            Err(GeofsError::Exists(_))
        ));
    }
}
