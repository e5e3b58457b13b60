//! The virtual filesystem layer.
//!
//! Pluggable filesystems register a type, mount at a path, and service
//! operations through two capability tables: inode operations (namespace)
//! and file operations (handles). Unset operations fail with
//! `not-supported`. The registry is where the no-destructive-operations
//! invariant is enforced structurally: an operation table that names a
//! destructive operation is refused at `register` time, and the layer
//! exposes `hide` where a conventional VFS would expose `unlink`.

pub mod devfs;
pub mod procfs;

mod geo;
mod handle;
mod resolver;

use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::errors::{GeofsError, GeofsResult};
use crate::path;
use crate::refs::RefKind;
use crate::volume::Volume;

pub use geo::GeoFilesystem;
pub use handle::{FileHandle, HandleState, OpenMode};

/// Operation names no filesystem may expose. Screened when a type
/// registers; there is no code path that dispatches them.
pub const FORBIDDEN_OPERATIONS: &[&str] =
    &["unlink", "rmdir", "truncate", "delete", "rm", "erase", "purge"];

/// Attributes reported by `getattr`.
#[derive(Debug, Clone, PartialEq)]
pub struct FileAttr {
    pub kind: RefKind,
    pub size: u64,
    pub mtime: DateTime<Utc>,
}

/// One directory entry from `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: RefKind,
}

/// Filesystem-specific inode payload; one variant per known kind.
pub enum NodePayload {
    Geo {
        volume: Volume,
        path: String,
    },
    Dev {
        state: Arc<devfs::DevState>,
        node: devfs::DevNode,
    },
    Proc {
        state: Arc<procfs::ProcState>,
        node: procfs::ProcNode,
    },
}

/// An in-memory namespace object: type, payload, and the two operation
/// tables calls dispatch through.
pub struct Inode {
    pub kind: RefKind,
    pub fs_name: &'static str,
    pub inode_ops: Arc<dyn InodeOps>,
    pub file_ops: Arc<dyn FileOps>,
    pub payload: NodePayload,
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode")
            .field("fs", &self.fs_name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Namespace operations. Default bodies leave the capability unset.
pub trait InodeOps: Send + Sync {
    fn lookup(&self, _dir: &Arc<Inode>, _name: &str) -> GeofsResult<Arc<Inode>> {
        Err(GeofsError::NotSupported("lookup"))
    }

    fn create(&self, _dir: &Arc<Inode>, _name: &str, _bytes: &[u8]) -> GeofsResult<Arc<Inode>> {
        Err(GeofsError::NotSupported("create"))
    }

    fn mkdir(&self, _dir: &Arc<Inode>, _name: &str) -> GeofsResult<Arc<Inode>> {
        Err(GeofsError::NotSupported("mkdir"))
    }

    fn symlink(&self, _dir: &Arc<Inode>, _name: &str, _target: &str) -> GeofsResult<Arc<Inode>> {
        Err(GeofsError::NotSupported("symlink"))
    }

    fn readlink(&self, _inode: &Inode) -> GeofsResult<String> {
        Err(GeofsError::NotSupported("readlink"))
    }

    /// Make the named child absent from the current view onward. The
    /// preservation-first replacement for `unlink`.
    fn hide(&self, _dir: &Inode, _name: &str) -> GeofsResult<()> {
        Err(GeofsError::NotSupported("hide"))
    }

    fn getattr(&self, inode: &Inode) -> GeofsResult<FileAttr>;
}

/// Handle operations. Default bodies leave the capability unset.
pub trait FileOps: Send + Sync {
    fn open(&self, inode: &Arc<Inode>, mode: OpenMode) -> GeofsResult<FileHandle>;

    fn read(&self, _file: &mut FileHandle, _buf: &mut [u8]) -> GeofsResult<usize> {
        Err(GeofsError::NotSupported("read"))
    }

    fn write(&self, _file: &mut FileHandle, _buf: &[u8]) -> GeofsResult<usize> {
        Err(GeofsError::NotSupported("write"))
    }

    fn seek(&self, _file: &mut FileHandle, _pos: SeekFrom) -> GeofsResult<u64> {
        Err(GeofsError::NotSupported("seek"))
    }

    fn readdir(&self, _file: &mut FileHandle) -> GeofsResult<Vec<DirEntry>> {
        Err(GeofsError::NotSupported("readdir"))
    }

    fn sync(&self, _file: &mut FileHandle) -> GeofsResult<()> {
        Err(GeofsError::NotSupported("sync"))
    }

    fn ioctl(&self, _file: &mut FileHandle, _cmd: u32, _arg: u64) -> GeofsResult<u64> {
        Err(GeofsError::NotSupported("ioctl"))
    }
}

/// A registrable filesystem kind.
pub trait FilesystemType: Send + Sync {
    fn name(&self) -> &'static str;

    /// Every operation name this type's tables expose. The registry
    /// refuses destructive names.
    fn operation_names(&self) -> &'static [&'static str];

    fn mount(&self, source: &str) -> GeofsResult<Superblock>;
}

/// The mounted instance of a filesystem: its root inode.
#[derive(Clone)]
pub struct Superblock {
    pub fs_name: &'static str,
    pub root: Arc<Inode>,
}

/// One row of the mount table, visible through `/proc/mounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub mount_path: String,
    pub fs_name: &'static str,
}

struct Mount {
    path: String,
    sb: Superblock,
}

/// Ordered mount table; the longest mount-path prefix wins resolution.
/// Mount and unmount take the exclusive side of the lock, resolution the
/// shared side.
pub struct MountTable {
    mounts: RwLock<Vec<Mount>>,
}

impl MountTable {
    fn new() -> Self {
        Self {
            mounts: RwLock::new(Vec::new()),
        }
    }

    fn mount(&self, mount_path: String, sb: Superblock) -> GeofsResult<()> {
        let mut mounts = self.mounts.write();
        if mounts.iter().any(|m| m.path == mount_path) {
            return Err(GeofsError::Exists(format!("mount at {mount_path}")));
        }
        tracing::info!(path = %mount_path, fs = sb.fs_name, "mounted filesystem");
        mounts.push(Mount {
            path: mount_path,
            sb,
        });
        Ok(())
    }

    fn unmount(&self, mount_path: &str) -> GeofsResult<()> {
        let mut mounts = self.mounts.write();
        let idx = mounts
            .iter()
            .position(|m| m.path == mount_path)
            .ok_or_else(|| GeofsError::not_found(format!("mount at {mount_path}")))?;
        let removed = mounts.remove(idx);
        tracing::info!(path = %mount_path, fs = removed.sb.fs_name, "unmounted filesystem");
        Ok(())
    }

    /// Superblock owning `path` and the remainder of `path` inside it.
    pub(crate) fn resolve_mount(&self, path: &str) -> GeofsResult<(Superblock, String)> {
        let mounts = self.mounts.read();
        let best = mounts
            .iter()
            .filter(|m| path::is_within(&m.path, path))
            .max_by_key(|m| m.path.len())
            .ok_or_else(|| GeofsError::not_found(format!("no filesystem mounted for {path}")))?;
        let rel = path::strip_mount(&best.path, path)
            .expect("prefix-matched mount must strip")
            .to_string();
        Ok((best.sb.clone(), rel))
    }

    pub fn list(&self) -> Vec<MountInfo> {
        self.mounts
            .read()
            .iter()
            .map(|m| MountInfo {
                mount_path: m.path.clone(),
                fs_name: m.sb.fs_name,
            })
            .collect()
    }
}

/// The dispatch layer: type registry plus mount table.
pub struct Vfs {
    types: RwLock<HashMap<&'static str, Arc<dyn FilesystemType>>>,
    mounts: Arc<MountTable>,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    pub fn new() -> Self {
        Self {
            types: RwLock::new(HashMap::new()),
            mounts: Arc::new(MountTable::new()),
        }
    }

    /// Register a filesystem type. Refused outright if its operation
    /// table names a destructive operation.
    pub fn register(&self, fs: Arc<dyn FilesystemType>) -> GeofsResult<()> {
        for op in fs.operation_names() {
            if FORBIDDEN_OPERATIONS.contains(op) {
                return Err(GeofsError::Forbidden(format!(
                    "filesystem {:?} exposes destructive operation {:?}",
                    fs.name(),
                    op
                )));
            }
        }
        let mut types = self.types.write();
        if types.contains_key(fs.name()) {
            return Err(GeofsError::Exists(format!(
                "filesystem type {:?}",
                fs.name()
            )));
        }
        tracing::debug!(fs = fs.name(), "registered filesystem type");
        types.insert(fs.name(), fs);
        Ok(())
    }

    pub fn mount(&self, kind: &str, source: &str, mount_path: &str) -> GeofsResult<()> {
        let mount_path = path::normalize(mount_path)?;
        let fs = self
            .types
            .read()
            .get(kind)
            .cloned()
            .ok_or_else(|| GeofsError::not_found(format!("filesystem type {kind:?}")))?;
        let sb = fs.mount(source)?;
        self.mounts.mount(mount_path, sb)
    }

    pub fn unmount(&self, mount_path: &str) -> GeofsResult<()> {
        let mount_path = path::normalize(mount_path)?;
        self.mounts.unmount(&mount_path)
    }

    pub fn mounts(&self) -> Vec<MountInfo> {
        self.mounts.list()
    }

    /// Shared mount table handle, for consumers that render mount state.
    pub fn mount_table(&self) -> Arc<MountTable> {
        Arc::clone(&self.mounts)
    }

    /// Resolve an absolute path to its inode, crossing mount points.
    pub fn resolve(&self, path: &str) -> GeofsResult<Arc<Inode>> {
        resolver::resolve(&self.mounts, path)
    }

    pub fn open(&self, path: &str, mode: OpenMode) -> GeofsResult<FileHandle> {
        let inode = self.resolve(path)?;
        let ops = inode.file_ops.clone();
        ops.open(&inode, mode)
    }

    /// Close a handle, flushing buffered writes first.
    pub fn close(&self, mut handle: FileHandle) -> GeofsResult<()> {
        if handle.is_dirty() {
            handle.sync()?;
        }
        Ok(())
    }

    pub fn getattr(&self, path: &str) -> GeofsResult<FileAttr> {
        let inode = self.resolve(path)?;
        let ops = inode.inode_ops.clone();
        ops.getattr(&inode)
    }

    /// Directory listing, unioned with any mount roots directly beneath
    /// the directory.
    pub fn readdir(&self, dir: &str) -> GeofsResult<Vec<DirEntry>> {
        let dir = path::normalize(dir)?;
        let mut handle = self.open(&dir, OpenMode::Read)?;
        let mut entries = handle.readdir()?;

        for info in self.mounts.list() {
            if path::parent(&info.mount_path) == Some(dir.as_str()) {
                let name = path::file_name(&info.mount_path).unwrap_or_default();
                if !entries.iter().any(|e| e.name == name) {
                    entries.push(DirEntry {
                        name: name.to_string(),
                        kind: RefKind::Directory,
                    });
                }
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub fn create(&self, path_str: &str, bytes: &[u8]) -> GeofsResult<()> {
        let (dir, name) = resolver::resolve_parent(&self.mounts, path_str)?;
        let ops = dir.inode_ops.clone();
        ops.create(&dir, &name, bytes)?;
        Ok(())
    }

    pub fn mkdir(&self, path_str: &str) -> GeofsResult<()> {
        let (dir, name) = resolver::resolve_parent(&self.mounts, path_str)?;
        let ops = dir.inode_ops.clone();
        ops.mkdir(&dir, &name)?;
        Ok(())
    }

    pub fn symlink(&self, path_str: &str, target: &str) -> GeofsResult<()> {
        let (dir, name) = resolver::resolve_parent(&self.mounts, path_str)?;
        let ops = dir.inode_ops.clone();
        ops.symlink(&dir, &name, target)?;
        Ok(())
    }

    pub fn readlink(&self, path_str: &str) -> GeofsResult<String> {
        let inode = self.resolve(path_str)?;
        let ops = inode.inode_ops.clone();
        ops.readlink(&inode)
    }

    /// Hide a path. On GeoFS this extends the working view's hide set;
    /// pseudo-filesystems leave the capability unset.
    pub fn hide(&self, path_str: &str) -> GeofsResult<()> {
        let (dir, name) = resolver::resolve_parent(&self.mounts, path_str)?;
        let ops = dir.inode_ops.clone();
        ops.hide(&dir, &name)
    }
}
