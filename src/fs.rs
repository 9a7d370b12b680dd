use std::{
    ffi::CStr,
    fs::{self, create_dir},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Result, anyhow};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use rustix::{
    fs::{Mode, chmod},
    mount::{MountFlags, UnmountFlags, mount, unmount},
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::constants::{DIR_DISK_BY_LABEL, DIR_MNT};
use crate::error::PlatformError;
use crate::transport::cancellable;

const CONFIG_VOLUME_FS_TYPES: &[&str] = &["iso9660", "vfat"];

/// Block devices that may carry a labeled config volume.
pub trait VolumeManager {
    /// Find a device whose filesystem label matches `label`, ignoring case.
    fn find_by_label(&self, label: &str) -> Result<Option<PathBuf>>;
    fn mount(&self, device: &Path, target: &Path) -> Result<()>;
    fn unmount(&self, target: &Path) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct BlockVolumes {
    by_label_dir: PathBuf,
}

impl Default for BlockVolumes {
    fn default() -> Self {
        Self {
            by_label_dir: PathBuf::from(DIR_DISK_BY_LABEL),
        }
    }
}

impl VolumeManager for BlockVolumes {
    fn find_by_label(&self, label: &str) -> Result<Option<PathBuf>> {
        let entries = match fs::read_dir(&self.by_label_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow!(
                    "unable to read {:?}: {}",
                    self.by_label_dir,
                    e
                ));
            }
        };
        for entry_res in entries {
            let entry = entry_res
                .map_err(|e| anyhow!("unable to read entry in {:?}: {}", self.by_label_dir, e))?;
            if !entry.file_name().to_string_lossy().eq_ignore_ascii_case(label) {
                continue;
            }
            let device = fs::canonicalize(entry.path())
                .map_err(|e| anyhow!("unable to resolve {:?}: {}", entry.path(), e))?;
            debug!("Found volume labeled {} at {:?}", label, device);
            return Ok(Some(device));
        }
        Ok(None)
    }

    fn mount(&self, device: &Path, target: &Path) -> Result<()> {
        mkdir_p(target, Mode::from(0o755))?;
        let data: Option<&CStr> = None;
        let mut last_error = None;
        for fs_type in CONFIG_VOLUME_FS_TYPES {
            match mount(device, target, *fs_type, MountFlags::RDONLY, data) {
                Ok(()) => {
                    debug!("Mounted {:?} ({}) on {:?}", device, fs_type, target);
                    return Ok(());
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(PlatformError::Mount {
            device: device.display().to_string(),
            target: target.display().to_string(),
            reason: last_error.map_or_else(|| "no filesystem types".into(), |e| e.to_string()),
        }
        .into())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        unmount(target, UnmountFlags::empty()).map_err(|e| {
            PlatformError::Unmount {
                target: target.display().to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }
}

static SHARED_MOUNT_POINT: Lazy<Arc<MountPoint>> =
    Lazy::new(|| Arc::new(MountPoint::new(DIR_MNT)));

/// A mount target that only one reader may use at a time.
#[derive(Debug)]
pub struct MountPoint {
    path: PathBuf,
    lock: Mutex<()>,
}

impl MountPoint {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    /// The process-wide mount point used for config volumes.
    pub fn shared() -> Arc<Self> {
        SHARED_MOUNT_POINT.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mount `device`, run `read` against the mounted tree, then unmount.
    ///
    /// The unmount happens on every path out of `read`. A failed unmount is
    /// reported even when `read` succeeded, since the mount stays behind.
    pub async fn with_mounted<V, T, F>(
        &self,
        volumes: &V,
        device: &Path,
        ctx: &CancellationToken,
        read: F,
    ) -> Result<T>
    where
        V: VolumeManager + ?Sized,
        F: FnOnce(&Path) -> Result<T>,
    {
        let _guard = cancellable(ctx, async { Ok(self.lock.lock().await) }).await?;
        volumes.mount(device, &self.path)?;
        info!("Mounted config volume {:?} at {:?}", device, self.path);

        let result = read(&self.path);

        if let Err(e) = volumes.unmount(&self.path) {
            if let Err(read_err) = &result {
                warn!("Reading config volume failed before unmount: {}", read_err);
            }
            return Err(e);
        }
        result
    }
}

/// Read `name` under `dir`; a missing file is `None`.
pub fn read_optional(dir: &Path, name: &str) -> Result<Option<Vec<u8>>> {
    let path = dir.join(name);
    match fs::read(&path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("{:?} does not exist", path);
            Ok(None)
        }
        Err(e) => Err(anyhow!("unable to read {:?}: {}", path, e)),
    }
}

pub fn mkdir_p<P: AsRef<Path>>(path: P, mode: Mode) -> Result<()> {
    let path = path.as_ref();
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow!("path {:?} is not valid UTF-8", path))?;
    for dir in descending_dirs(path_str) {
        match create_dir(&dir) {
            Err(e) if e.kind() == ErrorKind::AlreadyExists => (),
            Err(e) => return Err(anyhow!("unable to create directory {}: {}", dir, e)),
            Ok(_) => {
                debug!("Created directory: {}", &dir);
                chmod(&dir, mode)
                    .map_err(|e| anyhow!("unable to change mode of {}: {}", dir, e))?;
            }
        }
    }
    Ok(())
}

// Given a path, return a list of it and its parents in descending order.
// For example, "/a/b/c", returns the Vector ["/a", "/a/b", "/a/b/c"].
fn descending_dirs(path: &str) -> Vec<String> {
    let dirs = path.split("/").collect::<Vec<&str>>();
    (1..=dirs.len())
        .map(|i| dirs[..i].join("/"))
        .filter(|s| !s.is_empty())
        .collect()
}
