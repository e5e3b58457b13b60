//! Kernel state under `/proc`.
//!
//! A read-only directory whose lookup recognizes a fixed set of names
//! plus numeric PIDs. Each file's content is produced by a generator
//! invoked at `open`; the handle holds that render, so reads are stable
//! for the handle's lifetime. Inodes are constructed eagerly on every
//! lookup with no cache; walks are shallow here and the trade-off keeps
//! lookups free of shared mutable state.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::Utc;

use crate::errors::{GeofsError, GeofsResult};
use crate::refs::RefKind;
use crate::volume::Volume;

use super::handle::{read_from_content, seek_in_content, take_dir_entries};
use super::{
    DirEntry, FileAttr, FileHandle, FileOps, FilesystemType, HandleState, Inode, InodeOps,
    MountTable, NodePayload, OpenMode, Superblock,
};

/// The constitution rendered at `/proc/constitution`.
const CONSTITUTION: &str = "\
THE PRESERVATION CONSTITUTION

Article I.   No data may be destroyed. Storage is append-only; every
             published view remains resolvable forever.
Article II.  Deletion is hiding. A hidden path is absent from the
             present and the future, never from the past.
Article III. No code runs unexamined. Every payload is evaluated
             against this constitution and every decision is recorded
             in the geology, where no actor can truncate it.
";

const KERNEL_PID: u32 = 1;

/// Data sources behind the generated files. Owned by the kernel
/// context; the mount table is held weakly to avoid an ownership cycle
/// through the procfs superblock.
pub struct ProcState {
    version: String,
    started: Instant,
    volume: Volume,
    mounts: Weak<MountTable>,
    processes: BTreeMap<u32, &'static str>,
}

impl ProcState {
    pub fn new(version: impl Into<String>, volume: Volume, mounts: Weak<MountTable>) -> Arc<Self> {
        let mut processes = BTreeMap::new();
        processes.insert(KERNEL_PID, "kernel");
        Arc::new(Self {
            version: version.into(),
            started: Instant::now(),
            volume,
            mounts,
            processes,
        })
    }

    fn render(&self, node: &ProcNode) -> GeofsResult<Vec<u8>> {
        let text = match node {
            ProcNode::Root => {
                return Err(GeofsError::invalid("/proc is a directory"));
            }
            ProcNode::File(ProcFile::Version) => {
                format!("geofs {} preservation-first core\n", self.version)
            }
            ProcNode::File(ProcFile::Uptime) => {
                let up = self.started.elapsed();
                format!("{}.{:02}\n", up.as_secs(), up.subsec_millis() / 10)
            }
            ProcNode::File(ProcFile::Stat) => {
                let stats = self.volume.stats();
                let mounts = self.mounts.upgrade().map(|m| m.list().len()).unwrap_or(0);
                format!(
                    "views {}\nrefs {}\nblobs {}\nbytes {}\ndedup {}\nmounts {}\nprocs {}\n",
                    stats.views,
                    stats.refs,
                    stats.unique_blobs,
                    stats.bytes_stored,
                    stats.dedup_savings,
                    mounts,
                    self.processes.len()
                )
            }
            ProcNode::File(ProcFile::Constitution) => CONSTITUTION.to_string(),
            ProcNode::File(ProcFile::Mounts) => {
                let Some(mounts) = self.mounts.upgrade() else {
                    return Ok(Vec::new());
                };
                let mut out = String::new();
                for info in mounts.list() {
                    out.push_str(&format!(
                        "{} {} {} preserve 0 0\n",
                        info.fs_name, info.mount_path, info.fs_name
                    ));
                }
                out
            }
            ProcNode::SelfLink => KERNEL_PID.to_string(),
            ProcNode::Pid(pid) => {
                let name = self
                    .processes
                    .get(pid)
                    .ok_or_else(|| GeofsError::not_found(format!("/proc/{pid}")))?;
                format!("Name:\t{name}\nPid:\t{pid}\nState:\tR (running)\n")
            }
        };
        Ok(text.into_bytes())
    }
}

/// Named files directly under `/proc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcFile {
    Version,
    Uptime,
    Stat,
    Constitution,
    Mounts,
}

impl ProcFile {
    const ALL: [(&'static str, ProcFile); 5] = [
        ("version", ProcFile::Version),
        ("uptime", ProcFile::Uptime),
        ("stat", ProcFile::Stat),
        ("constitution", ProcFile::Constitution),
        ("mounts", ProcFile::Mounts),
    ];

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find_map(|(n, f)| (n == name).then_some(f))
    }
}

/// Inode payload for procfs.
pub enum ProcNode {
    Root,
    File(ProcFile),
    SelfLink,
    Pid(u32),
}

/// The `"procfs"` filesystem type.
pub struct ProcFilesystem {
    state: Arc<ProcState>,
}

impl ProcFilesystem {
    pub fn new(state: Arc<ProcState>) -> Arc<Self> {
        Arc::new(Self { state })
    }
}

impl FilesystemType for ProcFilesystem {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn operation_names(&self) -> &'static [&'static str] {
        &["lookup", "readlink", "getattr", "open", "read", "seek", "readdir"]
    }

    fn mount(&self, _source: &str) -> GeofsResult<Superblock> {
        Ok(Superblock {
            fs_name: "procfs",
            root: make_node(&self.state, ProcNode::Root),
        })
    }
}

fn make_node(state: &Arc<ProcState>, node: ProcNode) -> Arc<Inode> {
    let kind = match node {
        ProcNode::Root => RefKind::Directory,
        ProcNode::SelfLink => RefKind::Symlink,
        _ => RefKind::File,
    };
    Arc::new(Inode {
        kind,
        fs_name: "procfs",
        inode_ops: Arc::new(ProcInodeOps),
        file_ops: Arc::new(ProcFileOps),
        payload: NodePayload::Proc {
            state: Arc::clone(state),
            node,
        },
    })
}

fn proc_payload(inode: &Inode) -> (&Arc<ProcState>, &ProcNode) {
    match &inode.payload {
        NodePayload::Proc { state, node } => (state, node),
        _ => unreachable!("procfs operation dispatched on foreign inode"),
    }
}

struct ProcInodeOps;

impl InodeOps for ProcInodeOps {
    fn lookup(&self, dir: &Arc<Inode>, name: &str) -> GeofsResult<Arc<Inode>> {
        let (state, node) = proc_payload(dir);
        match node {
            ProcNode::Root => {
                if let Some(file) = ProcFile::from_name(name) {
                    return Ok(make_node(state, ProcNode::File(file)));
                }
                if name == "self" {
                    return Ok(make_node(state, ProcNode::SelfLink));
                }
                if let Ok(pid) = name.parse::<u32>() {
                    if state.processes.contains_key(&pid) {
                        return Ok(make_node(state, ProcNode::Pid(pid)));
                    }
                }
                Err(GeofsError::not_found(format!("/proc/{name}")))
            }
            _ => Err(GeofsError::invalid("proc entries have no children")),
        }
    }

    fn readlink(&self, inode: &Inode) -> GeofsResult<String> {
        let (_, node) = proc_payload(inode);
        match node {
            ProcNode::SelfLink => Ok(KERNEL_PID.to_string()),
            _ => Err(GeofsError::invalid("not a symlink")),
        }
    }

    fn getattr(&self, inode: &Inode) -> GeofsResult<FileAttr> {
        Ok(FileAttr {
            kind: inode.kind,
            size: 0,
            mtime: Utc::now(),
        })
    }
}

struct ProcFileOps;

impl FileOps for ProcFileOps {
    fn open(&self, inode: &Arc<Inode>, mode: OpenMode) -> GeofsResult<FileHandle> {
        if mode.writable() {
            return Err(GeofsError::NotSupported("write"));
        }
        let (state, node) = proc_payload(inode);
        match node {
            ProcNode::Root => {
                let mut entries: Vec<DirEntry> = ProcFile::ALL
                    .iter()
                    .map(|(name, _)| DirEntry {
                        name: name.to_string(),
                        kind: RefKind::File,
                    })
                    .collect();
                entries.push(DirEntry {
                    name: "self".to_string(),
                    kind: RefKind::Symlink,
                });
                entries.extend(state.processes.keys().map(|pid| DirEntry {
                    name: pid.to_string(),
                    kind: RefKind::File,
                }));
                Ok(FileHandle::new(
                    inode.clone(),
                    mode,
                    HandleState::Dir {
                        entries,
                        emitted: false,
                    },
                ))
            }
            node => {
                // generator runs here, once per open
                let content = state.render(node)?;
                Ok(FileHandle::new(
                    inode.clone(),
                    mode,
                    HandleState::Proc { content },
                ))
            }
        }
    }

    fn read(&self, file: &mut FileHandle, buf: &mut [u8]) -> GeofsResult<usize> {
        let pos = &mut file.pos;
        match &file.state {
            HandleState::Proc { content } => Ok(read_from_content(content, pos, buf)),
            _ => Err(GeofsError::invalid("not a procfs handle")),
        }
    }

    fn seek(&self, file: &mut FileHandle, target: std::io::SeekFrom) -> GeofsResult<u64> {
        let pos = &mut file.pos;
        match &file.state {
            HandleState::Proc { content } => seek_in_content(content.len() as u64, pos, target),
            _ => Err(GeofsError::NotSupported("seek")),
        }
    }

    fn readdir(&self, file: &mut FileHandle) -> GeofsResult<Vec<DirEntry>> {
        take_dir_entries(file)
    }
}
