//! File handles.
//!
//! A handle binds an inode, a position, an access mode and
//! filesystem-private state. GeoFS handles pin the volume's current view
//! at open time (snapshot-on-open), so their reads stay stable across
//! concurrent view switches; buffered writes publish to the working view
//! on `sync`/close.

use std::io::SeekFrom;
use std::sync::Arc;

use crate::errors::{GeofsError, GeofsResult};
use crate::views::ViewId;

use super::devfs::DevKind;
use super::{DirEntry, Inode};

/// Access mode requested at `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
}

impl OpenMode {
    pub fn readable(self) -> bool {
        matches!(self, OpenMode::Read | OpenMode::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, OpenMode::Write | OpenMode::ReadWrite)
    }
}

/// Filesystem-private handle state.
pub enum HandleState {
    /// GeoFS file pinned to the view current at open time.
    Geo {
        path: String,
        view: ViewId,
        content: Vec<u8>,
        dirty: bool,
    },
    /// Pseudo-device; `content` carries a render for snapshot devices
    /// such as kmsg.
    Dev {
        device: DevKind,
        content: Option<Vec<u8>>,
    },
    /// procfs content generated at open.
    Proc { content: Vec<u8> },
    /// One-shot directory listing.
    Dir {
        entries: Vec<DirEntry>,
        emitted: bool,
    },
}

/// An open file. Owned by its opener; close it through the VFS.
pub struct FileHandle {
    inode: Arc<Inode>,
    pub(crate) pos: u64,
    mode: OpenMode,
    pub(crate) state: HandleState,
}

impl FileHandle {
    pub(crate) fn new(inode: Arc<Inode>, mode: OpenMode, state: HandleState) -> Self {
        Self {
            inode,
            pos: 0,
            mode,
            state,
        }
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub(crate) fn is_dirty(&self) -> bool {
        matches!(self.state, HandleState::Geo { dirty: true, .. })
    }

    pub fn read(&mut self, buf: &mut [u8]) -> GeofsResult<usize> {
        if !self.mode.readable() {
            return Err(GeofsError::invalid("handle not open for reading"));
        }
        let ops = self.inode.file_ops.clone();
        ops.read(self, buf)
    }

    pub fn write(&mut self, buf: &[u8]) -> GeofsResult<usize> {
        if !self.mode.writable() {
            return Err(GeofsError::invalid("handle not open for writing"));
        }
        let ops = self.inode.file_ops.clone();
        ops.write(self, buf)
    }

    pub fn seek(&mut self, pos: SeekFrom) -> GeofsResult<u64> {
        let ops = self.inode.file_ops.clone();
        ops.seek(self, pos)
    }

    pub fn readdir(&mut self) -> GeofsResult<Vec<DirEntry>> {
        let ops = self.inode.file_ops.clone();
        ops.readdir(self)
    }

    pub fn sync(&mut self) -> GeofsResult<()> {
        let ops = self.inode.file_ops.clone();
        ops.sync(self)
    }

    pub fn ioctl(&mut self, cmd: u32, arg: u64) -> GeofsResult<u64> {
        let ops = self.inode.file_ops.clone();
        ops.ioctl(self, cmd, arg)
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if self.is_dirty() {
            if let HandleState::Geo { path, .. } = &self.state {
                tracing::warn!(%path, "file handle dropped with unsynced writes");
            }
        }
    }
}

/// One-shot directory iteration shared by every filesystem's `readdir`.
pub(crate) fn take_dir_entries(file: &mut FileHandle) -> GeofsResult<Vec<DirEntry>> {
    match &mut file.state {
        HandleState::Dir { entries, emitted } => {
            if *emitted {
                return Ok(Vec::new());
            }
            *emitted = true;
            Ok(std::mem::take(entries))
        }
        _ => Err(GeofsError::invalid("handle is not a directory")),
    }
}

/// Position-tracked copy out of an in-memory content snapshot.
pub(crate) fn read_from_content(
    content: &[u8],
    pos: &mut u64,
    buf: &mut [u8],
) -> usize {
    let start = (*pos).min(content.len() as u64) as usize;
    let n = (content.len() - start).min(buf.len());
    buf[..n].copy_from_slice(&content[start..start + n]);
    *pos += n as u64;
    n
}

/// Seek within an in-memory content snapshot.
pub(crate) fn seek_in_content(len: u64, pos: &mut u64, target: SeekFrom) -> GeofsResult<u64> {
    let next = match target {
        SeekFrom::Start(offset) => offset as i128,
        SeekFrom::Current(delta) => *pos as i128 + delta as i128,
        SeekFrom::End(delta) => len as i128 + delta as i128,
    };
    if next < 0 || next > u64::MAX as i128 {
        return Err(GeofsError::invalid(format!("seek out of range: {next}")));
    }
    *pos = next as u64;
    Ok(*pos)
}
