//! The kernel context.
//!
//! One explicit context passed to every consumer instead of
//! process-wide mutable state: it owns the volume, the VFS registry and
//! mount table, the governor, and per-device state (the devfs RNG and
//! the kernel message ring).

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::GeofsResult;
use crate::governor::Governor;
use crate::logging;
use crate::vfs::devfs::{DevFilesystem, DevState};
use crate::vfs::procfs::{ProcFilesystem, ProcState};
use crate::vfs::{GeoFilesystem, Vfs};
use crate::volume::{Volume, VolumeOptions};

/// Bootstrap configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelOptions {
    /// Home directory; the volume lives at `<home>/volume`.
    pub home_dir: PathBuf,
    /// Advisory logical byte budget for the volume.
    pub quota_bytes: Option<u64>,
}

impl Default for KernelOptions {
    fn default() -> Self {
        let home_dir = std::env::var_os("GEOFS_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("geofs")
            });
        Self {
            home_dir,
            quota_bytes: None,
        }
    }
}

/// The assembled system: volume, VFS with the three filesystem types
/// mounted, governor, and device state.
pub struct Kernel {
    volume: Volume,
    vfs: Arc<Vfs>,
    governor: Governor,
    dev_state: Arc<DevState>,
}

impl Kernel {
    /// Open (or create on first boot) the volume, initialize logging and
    /// the governor, register the filesystem types, and mount geofs at
    /// `/`, devfs at `/dev`, procfs at `/proc`.
    pub fn bootstrap(options: KernelOptions) -> GeofsResult<Self> {
        let volume_root = options.home_dir.join("volume");
        let volume_options = VolumeOptions {
            quota_bytes: options.quota_bytes,
            store_capacity: None,
        };

        let volume = if volume_root.join("views").join("index").exists() {
            Volume::open_with(&volume_root, volume_options)?
        } else {
            Volume::create_with(&volume_root, volume_options)?
        };

        logging::init_for(&volume.layout().logs_dir())?;

        let governor = Governor::init(volume.clone())?;

        let vfs = Arc::new(Vfs::new());
        let dev_state = DevState::new();

        vfs.register(GeoFilesystem::new(volume.clone()))?;
        vfs.register(DevFilesystem::new(Arc::clone(&dev_state)))?;
        let proc_state = ProcState::new(
            env!("CARGO_PKG_VERSION"),
            volume.clone(),
            Arc::downgrade(&vfs.mount_table()),
        );
        vfs.register(ProcFilesystem::new(proc_state))?;

        vfs.mount("geofs", "", "/")?;
        vfs.mount("devfs", "", "/dev")?;
        vfs.mount("procfs", "", "/proc")?;

        dev_state.push_kmsg(format!(
            "geofs {} booted, {} views",
            env!("CARGO_PKG_VERSION"),
            volume.list_views().len()
        ));
        tracing::info!(home = %options.home_dir.display(), "kernel context ready");

        Ok(Self {
            volume,
            vfs,
            governor,
            dev_state,
        })
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    pub fn dev_state(&self) -> &Arc<DevState> {
        &self.dev_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::{Capability, DecisionKind};
    use crate::vfs::OpenMode;
    use tempfile::tempdir;

    fn kernel() -> (tempfile::TempDir, Kernel) {
        let dir = tempdir().unwrap();
        let kernel = Kernel::bootstrap(KernelOptions {
            home_dir: dir.path().join("home"),
            quota_bytes: None,
        })
        .unwrap();
        (dir, kernel)
    }

    #[test]
    fn test_bootstrap_mounts_three_filesystems() {
        let (_dir, kernel) = kernel();
        let mounts = kernel.vfs().mounts();
        let paths: Vec<&str> = mounts.iter().map(|m| m.mount_path.as_str()).collect();
        assert!(paths.contains(&"/"));
        assert!(paths.contains(&"/dev"));
        assert!(paths.contains(&"/proc"));
    }

    #[test]
    fn test_end_to_end_write_hide_history() {
        let (_dir, kernel) = kernel();
        let volume = kernel.volume();

        volume.write("/story", b"it happened").unwrap();
        let v1 = volume.snapshot("published").unwrap();
        volume.hide("/story").unwrap();
        volume.snapshot("redacted").unwrap();

        // the human-visible story: the file is gone
        assert!(!volume.exists("/story").unwrap());
        assert!(matches!(
            kernel.vfs().resolve("/story"),
            Err(crate::errors::GeofsError::NotFound(_))
        ));
        // but every prior stratum still resolves it
        assert_eq!(volume.read_at(v1, "/story").unwrap(), b"it happened");
    }

    #[test]
    fn test_pseudo_filesystems_dispatch() {
        let (_dir, kernel) = kernel();
        let mut zero = kernel.vfs().open("/dev/zero", OpenMode::Read).unwrap();
        let mut buf = [0xFFu8; 16];
        assert_eq!(zero.read(&mut buf).unwrap(), 16);
        assert!(buf.iter().all(|&b| b == 0));

        let mut version = kernel.vfs().open("/proc/version", OpenMode::Read).unwrap();
        let mut text = [0u8; 128];
        let n = version.read(&mut text).unwrap();
        assert!(String::from_utf8_lossy(&text[..n]).contains("geofs"));
    }

    #[test]
    fn test_governor_wired_to_volume() {
        let (_dir, kernel) = kernel();
        let submission = kernel
            .governor()
            .submit(b"shred -r /", Capability::STORAGE_READ, "boot-test")
            .unwrap();
        assert_eq!(submission.decision.kind(), DecisionKind::Decline);

        let names = kernel.volume().list("/governor/audit").unwrap();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn test_reboot_preserves_geology() {
        let dir = tempdir().unwrap();
        let home = dir.path().join("home");
        let v1;
        {
            let kernel = Kernel::bootstrap(KernelOptions {
                home_dir: home.clone(),
                quota_bytes: None,
            })
            .unwrap();
            kernel.volume().write("/persist", b"across boots").unwrap();
            v1 = kernel.volume().snapshot("boot-1").unwrap();
        }
        let kernel = Kernel::bootstrap(KernelOptions {
            home_dir: home,
            quota_bytes: None,
        })
        .unwrap();
        assert_eq!(kernel.volume().read_at(v1, "/persist").unwrap(), b"across boots");
        // second boot does not reinstall the policy view
        let policy_views = kernel
            .volume()
            .list_views()
            .into_iter()
            .filter(|r| r.label == "governor-policy-v1")
            .count();
        assert_eq!(policy_views, 1);
    }

    #[test]
    fn test_audit_trail_cannot_be_truncated() {
        let (_dir, kernel) = kernel();
        let submission = kernel
            .governor()
            .submit(b"harmless", Capability::STORAGE_WRITE, "a")
            .unwrap();
        let sealed = kernel.volume().snapshot("audit-sealed").unwrap();
        let record_path = format!("/governor/audit/{:08}", submission.record_id);

        // the strongest move any later actor has is hide, and hide
        // leaves the record resolvable in every earlier stratum
        kernel.volume().hide(&record_path).unwrap();
        kernel.volume().snapshot("attempted-coverup").unwrap();

        assert!(!kernel.volume().exists(&record_path).unwrap());
        assert!(kernel.volume().exists_at(sealed, &record_path).unwrap());
        assert!(!kernel.volume().read_at(sealed, &record_path).unwrap().is_empty());
    }
}
