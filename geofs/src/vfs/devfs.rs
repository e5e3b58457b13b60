//! Pseudo-devices under `/dev`.
//!
//! A read-only directory of fixed device names with the classic
//! semantics: `null` reads EOF and discards writes, `zero` reads zeros,
//! the random devices fill from the kernel context's RNG, `full` fails
//! writes with `quota-exceeded`, and console-family writes land in the
//! in-memory kernel message ring served by `kmsg`. There is no create,
//! mkdir or hide here.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::errors::{GeofsError, GeofsResult};
use crate::refs::RefKind;

use super::handle::{read_from_content, take_dir_entries};
use super::{
    DirEntry, FileAttr, FileHandle, FileOps, FilesystemType, HandleState, Inode, InodeOps,
    NodePayload, OpenMode, Superblock,
};

const KMSG_CAPACITY: usize = 1024;

/// Per-device mutable state, owned by the kernel context rather than any
/// process-wide global.
pub struct DevState {
    rng: Mutex<StdRng>,
    kmsg: Mutex<VecDeque<String>>,
}

impl DevState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rng: Mutex::new(StdRng::from_os_rng()),
            kmsg: Mutex::new(VecDeque::new()),
        })
    }

    /// Append a line to the kernel message ring.
    pub fn push_kmsg(&self, line: impl Into<String>) {
        let mut ring = self.kmsg.lock();
        if ring.len() == KMSG_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(line.into());
    }

    fn render_kmsg(&self) -> Vec<u8> {
        let ring = self.kmsg.lock();
        let mut out = String::new();
        for line in ring.iter() {
            out.push_str(line);
            out.push('\n');
        }
        out.into_bytes()
    }

    fn fill_random(&self, buf: &mut [u8]) {
        self.rng.lock().fill_bytes(buf);
    }
}

/// The fixed device set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevKind {
    Null,
    Zero,
    Random,
    Urandom,
    Full,
    Tty,
    Console,
    Kmsg,
}

impl DevKind {
    pub const ALL: [DevKind; 8] = [
        DevKind::Null,
        DevKind::Zero,
        DevKind::Random,
        DevKind::Urandom,
        DevKind::Full,
        DevKind::Tty,
        DevKind::Console,
        DevKind::Kmsg,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DevKind::Null => "null",
            DevKind::Zero => "zero",
            DevKind::Random => "random",
            DevKind::Urandom => "urandom",
            DevKind::Full => "full",
            DevKind::Tty => "tty",
            DevKind::Console => "console",
            DevKind::Kmsg => "kmsg",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

/// Inode payload for devfs.
pub enum DevNode {
    Root,
    Device(DevKind),
}

/// The `"devfs"` filesystem type.
pub struct DevFilesystem {
    state: Arc<DevState>,
}

impl DevFilesystem {
    pub fn new(state: Arc<DevState>) -> Arc<Self> {
        Arc::new(Self { state })
    }
}

impl FilesystemType for DevFilesystem {
    fn name(&self) -> &'static str {
        "devfs"
    }

    fn operation_names(&self) -> &'static [&'static str] {
        &["lookup", "getattr", "open", "read", "write", "readdir"]
    }

    fn mount(&self, _source: &str) -> GeofsResult<Superblock> {
        Ok(Superblock {
            fs_name: "devfs",
            root: make_node(&self.state, DevNode::Root),
        })
    }
}

fn make_node(state: &Arc<DevState>, node: DevNode) -> Arc<Inode> {
    let kind = match node {
        DevNode::Root => RefKind::Directory,
        DevNode::Device(_) => RefKind::Device,
    };
    Arc::new(Inode {
        kind,
        fs_name: "devfs",
        inode_ops: Arc::new(DevInodeOps),
        file_ops: Arc::new(DevFileOps),
        payload: NodePayload::Dev {
            state: Arc::clone(state),
            node,
        },
    })
}

fn dev_payload(inode: &Inode) -> (&Arc<DevState>, &DevNode) {
    match &inode.payload {
        NodePayload::Dev { state, node } => (state, node),
        _ => unreachable!("devfs operation dispatched on foreign inode"),
    }
}

struct DevInodeOps;

impl InodeOps for DevInodeOps {
    fn lookup(&self, dir: &Arc<Inode>, name: &str) -> GeofsResult<Arc<Inode>> {
        let (state, node) = dev_payload(dir);
        match node {
            DevNode::Root => {
                let kind = DevKind::from_name(name)
                    .ok_or_else(|| GeofsError::not_found(format!("/dev/{name}")))?;
                Ok(make_node(state, DevNode::Device(kind)))
            }
            DevNode::Device(_) => Err(GeofsError::invalid("devices have no children")),
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

struct DevFileOps;

impl FileOps for DevFileOps {
    fn open(&self, inode: &Arc<Inode>, mode: OpenMode) -> GeofsResult<FileHandle> {
        let (state, node) = dev_payload(inode);
        match node {
            DevNode::Root => {
                if mode.writable() {
                    return Err(GeofsError::invalid("cannot open /dev for writing"));
                }
                let entries = DevKind::ALL
                    .into_iter()
                    .map(|k| DirEntry {
                        name: k.name().to_string(),
                        kind: RefKind::Device,
                    })
                    .collect();
                Ok(FileHandle::new(
                    inode.clone(),
                    mode,
                    HandleState::Dir {
                        entries,
                        emitted: false,
                    },
                ))
            }
            DevNode::Device(kind) => {
                // kmsg snapshots the ring at open so reads are stable
                let content = (*kind == DevKind::Kmsg).then(|| state.render_kmsg());
                Ok(FileHandle::new(
                    inode.clone(),
                    mode,
                    HandleState::Dev {
                        device: *kind,
                        content,
                    },
                ))
            }
        }
    }

    fn read(&self, file: &mut FileHandle, buf: &mut [u8]) -> GeofsResult<usize> {
        let state = {
            let (state, _) = dev_payload(file.inode());
            Arc::clone(state)
        };
        let pos = &mut file.pos;
        match &file.state {
            HandleState::Dev { device, content } => match device {
                DevKind::Null | DevKind::Tty | DevKind::Console => Ok(0),
                DevKind::Zero | DevKind::Full => {
                    buf.fill(0);
                    *pos += buf.len() as u64;
                    Ok(buf.len())
                }
                DevKind::Random | DevKind::Urandom => {
                    state.fill_random(buf);
                    *pos += buf.len() as u64;
                    Ok(buf.len())
                }
                DevKind::Kmsg => {
                    let content = content.as_deref().unwrap_or_default();
                    Ok(read_from_content(content, pos, buf))
                }
            },
            _ => Err(GeofsError::invalid("not a devfs handle")),
        }
    }

    fn write(&self, file: &mut FileHandle, buf: &[u8]) -> GeofsResult<usize> {
        let state = {
            let (state, _) = dev_payload(file.inode());
            Arc::clone(state)
        };
        match &file.state {
            HandleState::Dev { device, .. } => match device {
                // accept and discard
                DevKind::Null | DevKind::Zero | DevKind::Random | DevKind::Urandom => {
                    Ok(buf.len())
                }
                DevKind::Full => Err(GeofsError::QuotaExceeded(
                    "device is always full".to_string(),
                )),
                DevKind::Tty | DevKind::Console | DevKind::Kmsg => {
                    let text = String::from_utf8_lossy(buf);
                    for line in text.lines() {
                        tracing::info!(target: "console", "{line}");
                        state.push_kmsg(line.to_string());
                    }
                    Ok(buf.len())
                }
            },
            _ => Err(GeofsError::invalid("not a devfs handle")),
        }
    }

    fn readdir(&self, file: &mut FileHandle) -> GeofsResult<Vec<DirEntry>> {
        take_dir_entries(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::Vfs;

    fn setup() -> (Arc<DevState>, Vfs) {
        let state = DevState::new();
        let vfs = Vfs::new();
        vfs.register(DevFilesystem::new(Arc::clone(&state))).unwrap();
        vfs.mount("devfs", "", "/dev").unwrap();
        (state, vfs)
    }

    #[test]
    fn test_zero_reads_zeros() {
        let (_state, vfs) = setup();
        let mut handle = vfs.open("/dev/zero", OpenMode::Read).unwrap();
        let mut buf = [0xAAu8; 64];
        assert_eq!(handle.read(&mut buf).unwrap(), 64);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_full_write_fails_quota() {
        let (_state, vfs) = setup();
        let mut handle = vfs.open("/dev/full", OpenMode::Write).unwrap();
        assert!(matches!(
            handle.write(b"anything"),
            Err(GeofsError::QuotaExceeded(_))
        ));
    }

    #[test]
    fn test_null_semantics() {
        let (_state, vfs) = setup();
        let mut handle = vfs.open("/dev/null", OpenMode::ReadWrite).unwrap();
        assert_eq!(handle.write(b"discarded").unwrap(), 9);
        let mut buf = [0u8; 8];
        assert_eq!(handle.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_random_fills_buffer() {
        let (_state, vfs) = setup();
        let mut handle = vfs.open("/dev/urandom", OpenMode::Read).unwrap();
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        handle.read(&mut a).unwrap();
        handle.read(&mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_console_feeds_kmsg() {
        let (_state, vfs) = setup();
        let mut console = vfs.open("/dev/console", OpenMode::Write).unwrap();
        console.write(b"hello ring\n").unwrap();

        let mut kmsg = vfs.open("/dev/kmsg", OpenMode::Read).unwrap();
        let mut buf = [0u8; 64];
        let n = kmsg.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello ring\n");
    }

    #[test]
    fn test_no_create_or_hide() {
        let (_state, vfs) = setup();
        assert!(matches!(
            vfs.create("/dev/newdev", b""),
            Err(GeofsError::NotSupported("create"))
        ));
        assert!(matches!(
            vfs.hide("/dev/null"),
            Err(GeofsError::NotSupported("hide"))
        ));
        assert!(matches!(
            vfs.mkdir("/dev/sub"),
            Err(GeofsError::NotSupported("mkdir"))
        ));
    }

    #[test]
    fn test_unknown_device_not_found() {
        let (_state, vfs) = setup();
        assert!(matches!(
            vfs.resolve("/dev/sda"),
            Err(GeofsError::NotFound(_))
        ));
    }

    #[test]
    fn test_readdir_lists_fixed_names() {
        let (_state, vfs) = setup();
        let names: Vec<String> = vfs
            .readdir("/dev")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        for expect in ["null", "zero", "random", "urandom", "full", "tty", "console", "kmsg"] {
            assert!(names.contains(&expect.to_string()), "missing {expect}");
        }
    }
}
