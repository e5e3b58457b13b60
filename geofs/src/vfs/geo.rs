//! GeoFS mounted as a filesystem.
//!
//! The primary store behind the VFS. Namespace operations delegate to
//! the volume; file handles pin the view that was current at open time,
//! buffer writes in memory, and publish them to the working view on
//! `sync`.

use std::io::SeekFrom;
use std::sync::Arc;

use crate::errors::{GeofsError, GeofsResult};
use crate::path;
use crate::refs::RefKind;
use crate::volume::Volume;

use super::handle::{read_from_content, seek_in_content, take_dir_entries};
use super::{
    DirEntry, FileAttr, FileHandle, FileOps, FilesystemType, HandleState, Inode, InodeOps,
    NodePayload, OpenMode, Superblock,
};

/// The `"geofs"` filesystem type, wrapping one volume.
pub struct GeoFilesystem {
    volume: Volume,
}

impl GeoFilesystem {
    pub fn new(volume: Volume) -> Arc<Self> {
        Arc::new(Self { volume })
    }
}

impl FilesystemType for GeoFilesystem {
    fn name(&self) -> &'static str {
        "geofs"
    }

    fn operation_names(&self) -> &'static [&'static str] {
        &[
            "lookup", "create", "mkdir", "symlink", "readlink", "hide", "getattr", "open",
            "read", "write", "seek", "readdir", "sync",
        ]
    }

    fn mount(&self, _source: &str) -> GeofsResult<Superblock> {
        Ok(Superblock {
            fs_name: "geofs",
            root: make_node(&self.volume, "/".to_string(), RefKind::Directory),
        })
    }
}

fn make_node(volume: &Volume, path: String, kind: RefKind) -> Arc<Inode> {
    Arc::new(Inode {
        kind,
        fs_name: "geofs",
        inode_ops: Arc::new(GeoInodeOps),
        file_ops: Arc::new(GeoFileOps),
        payload: NodePayload::Geo {
            volume: volume.clone(),
            path,
        },
    })
}

fn geo_payload(inode: &Inode) -> (&Volume, &str) {
    match &inode.payload {
        NodePayload::Geo { volume, path } => (volume, path),
        _ => unreachable!("geofs operation dispatched on foreign inode"),
    }
}

struct GeoInodeOps;

impl InodeOps for GeoInodeOps {
    fn lookup(&self, dir: &Arc<Inode>, name: &str) -> GeofsResult<Arc<Inode>> {
        let (volume, dir_path) = geo_payload(dir);
        let target = path::join(dir_path, name);
        let entry = volume
            .lookup(&target)?
            .ok_or_else(|| GeofsError::not_found(&target))?;
        Ok(make_node(volume, target, entry.kind))
    }

    fn create(&self, dir: &Arc<Inode>, name: &str, bytes: &[u8]) -> GeofsResult<Arc<Inode>> {
        let (volume, dir_path) = geo_payload(dir);
        let target = path::join(dir_path, name);
        volume.write(&target, bytes)?;
        Ok(make_node(volume, target, RefKind::File))
    }

    fn mkdir(&self, dir: &Arc<Inode>, name: &str) -> GeofsResult<Arc<Inode>> {
        let (volume, dir_path) = geo_payload(dir);
        let target = path::join(dir_path, name);
        volume.mkdir(&target)?;
        Ok(make_node(volume, target, RefKind::Directory))
    }

    fn symlink(&self, dir: &Arc<Inode>, name: &str, link_target: &str) -> GeofsResult<Arc<Inode>> {
        let (volume, dir_path) = geo_payload(dir);
        let target = path::join(dir_path, name);
        volume.symlink(&target, link_target)?;
        Ok(make_node(volume, target, RefKind::Symlink))
    }

    fn readlink(&self, inode: &Inode) -> GeofsResult<String> {
        let (volume, node_path) = geo_payload(inode);
        volume.readlink(node_path)
    }

    fn hide(&self, dir: &Inode, name: &str) -> GeofsResult<()> {
        let (volume, dir_path) = geo_payload(dir);
        volume.hide(&path::join(dir_path, name))
    }

    fn getattr(&self, inode: &Inode) -> GeofsResult<FileAttr> {
        let (volume, node_path) = geo_payload(inode);
        let entry = volume
            .lookup(node_path)?
            .ok_or_else(|| GeofsError::not_found(node_path))?;
        Ok(FileAttr {
            kind: entry.kind,
            size: entry.size,
            mtime: entry.mtime,
        })
    }
}

struct GeoFileOps;

impl FileOps for GeoFileOps {
    fn open(&self, inode: &Arc<Inode>, mode: OpenMode) -> GeofsResult<FileHandle> {
        let (volume, node_path) = geo_payload(inode);

        if inode.kind == RefKind::Directory {
            if mode.writable() {
                return Err(GeofsError::invalid(format!(
                    "cannot open directory for writing: {node_path}"
                )));
            }
            let entries = volume
                .list(node_path)?
                .into_iter()
                .map(|(name, entry)| DirEntry {
                    name,
                    kind: entry.kind,
                })
                .collect();
            return Ok(FileHandle::new(
                inode.clone(),
                mode,
                HandleState::Dir {
                    entries,
                    emitted: false,
                },
            ));
        }

        // Snapshot-on-open: the handle reads the view that is current
        // now, whatever later switches do.
        let view = volume.current_view();
        let content = volume.read_at(view, node_path)?;
        Ok(FileHandle::new(
            inode.clone(),
            mode,
            HandleState::Geo {
                path: node_path.to_string(),
                view,
                content,
                dirty: false,
            },
        ))
    }

    fn read(&self, file: &mut FileHandle, buf: &mut [u8]) -> GeofsResult<usize> {
        let pos = &mut file.pos;
        match &file.state {
            HandleState::Geo { content, .. } => Ok(read_from_content(content, pos, buf)),
            _ => Err(GeofsError::invalid("not a geofs handle")),
        }
    }

    fn write(&self, file: &mut FileHandle, buf: &[u8]) -> GeofsResult<usize> {
        match &mut file.state {
            HandleState::Geo { content, dirty, .. } => {
                let start = file.pos as usize;
                if start > content.len() {
                    content.resize(start, 0);
                }
                let overlap = (content.len() - start).min(buf.len());
                content[start..start + overlap].copy_from_slice(&buf[..overlap]);
                content.extend_from_slice(&buf[overlap..]);
                *dirty = true;
                file.pos += buf.len() as u64;
                Ok(buf.len())
            }
            _ => Err(GeofsError::invalid("not a geofs handle")),
        }
    }

    fn seek(&self, file: &mut FileHandle, target: SeekFrom) -> GeofsResult<u64> {
        match &file.state {
            HandleState::Geo { content, .. } => {
                let len = content.len() as u64;
                seek_in_content(len, &mut file.pos, target)
            }
            HandleState::Dir { .. } => Err(GeofsError::NotSupported("seek")),
            _ => Err(GeofsError::invalid("not a geofs handle")),
        }
    }

    fn readdir(&self, file: &mut FileHandle) -> GeofsResult<Vec<DirEntry>> {
        take_dir_entries(file)
    }

    fn sync(&self, file: &mut FileHandle) -> GeofsResult<()> {
        let volume = {
            let (volume, _) = geo_payload(file.inode());
            volume.clone()
        };
        match &mut file.state {
            HandleState::Geo {
                path,
                content,
                dirty,
                ..
            } => {
                if *dirty {
                    volume.write(path, content)?;
                    *dirty = false;
                }
                Ok(())
            }
            _ => Err(GeofsError::invalid("not a geofs handle")),
        }
    }
}
