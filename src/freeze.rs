//! Filesystem-freeze state machine: global guest-FS quiesce/thaw, and the
//! admission policy that gates the RPC command surface while frozen.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Mutex;

use nix::errno::Errno;

use crate::error::{Error, Result};

// from linux/fs.h
const FIFREEZE: libc::c_ulong = 0xC0045877;
const FITHAW: libc::c_ulong = 0xC0045878;

/// Methods reachable while the filesystems are frozen. Renaming any of these
/// strings is a wire-level breaking change.
const UNARY_ALLOWLIST: &[&str] = &[
    "/agent.v1.Agent/GetAgentInfo",
    "/agent.v1.Agent/GetGuestInfo",
    "/agent.v1.Filesystem/Unfreeze",
];
const STREAMING_ALLOWLIST: &[&str] = &["/agent.v1.Filesystem/DownloadFile"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device_spec: String,
    pub mount_file: String,
    pub fs_type: String,
}

/// Reads `/proc/self/mounts` and returns the filtered, ordered, deduplicated
/// set of local block-backed mount points eligible for freeze/thaw.
pub fn mount_points() -> Result<Vec<MountEntry>> {
    mount_points_from(Path::new("/proc/self/mounts"))
}

fn mount_points_from(path: &Path) -> Result<Vec<MountEntry>> {
    let contents = std::fs::read_to_string(path)?;
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    for line in contents.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        let mut device_spec = fields[0].to_string();
        let mount_file = fields[1].to_string();
        let fs_type = fields[2].to_string();

        if !device_spec.starts_with('/') {
            continue;
        }
        if fs_type == "smbfs" || fs_type == "cifs" {
            continue;
        }
        if device_spec.starts_with("/dev/loop") {
            continue;
        }

        if let Ok(meta) = std::fs::symlink_metadata(&device_spec) {
            if meta.file_type().is_symlink() {
                if let Ok(target) = std::fs::read_link(&device_spec) {
                    if let Some(base) = target.file_name().and_then(|n| n.to_str()) {
                        device_spec = base.to_string();
                    }
                }
            }
        }
        if device_spec.starts_with("dm-") {
            continue;
        }

        if seen.insert(device_spec.clone()) {
            out.push(MountEntry {
                device_spec,
                mount_file,
                fs_type,
            });
        }
    }

    Ok(out)
}

fn ioctl_no_arg(fd: i32, request: libc::c_ulong) -> std::result::Result<(), Errno> {
    let ret = unsafe { libc::ioctl(fd, request, 0) };
    if ret < 0 {
        Err(Errno::last())
    } else {
        Ok(())
    }
}

/// Process-wide freeze flag, owned by `server::ServerState`.
#[derive(Debug, Default)]
pub struct FreezeState {
    locked: Mutex<bool>,
}

impl FreezeState {
    pub fn new() -> Self {
        Self {
            locked: Mutex::new(false),
        }
    }

    pub fn is_locked(&self) -> bool {
        *self.locked.lock().expect("freeze mutex poisoned")
    }

    /// Returns `Ok(())` when `method` may run given the current lock state.
    pub fn admit(&self, method: &str, is_stream: bool) -> Result<()> {
        if !self.is_locked() {
            return Ok(());
        }
        let allowed = if is_stream {
            STREAMING_ALLOWLIST.contains(&method)
        } else {
            UNARY_ALLOWLIST.contains(&method)
        };
        if allowed {
            Ok(())
        } else {
            Err(Error::AdmissionDenied(method.to_string()))
        }
    }

    /// Flips `locked` to true *before* issuing any ioctl, then FIFREEZEs every
    /// mount point in order. `EOPNOTSUPP`/`EBUSY` are tolerated per entry.
    pub fn freeze(&self) -> Result<()> {
        let entries = mount_points()?;
        *self.locked.lock().expect("freeze mutex poisoned") = true;

        for entry in &entries {
            let file = File::open(&entry.mount_file)?;
            match ioctl_no_arg(file.as_raw_fd(), FIFREEZE) {
                Ok(()) | Err(Errno::EOPNOTSUPP) | Err(Errno::EBUSY) => {}
                Err(errno) => {
                    return Err(Error::Internal(format!(
                        "FIFREEZE on {}: {errno}",
                        entry.mount_file
                    )));
                }
            }
        }
        Ok(())
    }

    /// FITHAWs every mount point in order, tolerating `EINVAL`, then flips
    /// `locked` back to false on success.
    pub fn unfreeze(&self) -> Result<()> {
        let entries = mount_points()?;

        for entry in &entries {
            let file = File::open(&entry.mount_file)?;
            match ioctl_no_arg(file.as_raw_fd(), FITHAW) {
                Ok(()) | Err(Errno::EINVAL) => {}
                Err(errno) => {
                    return Err(Error::Internal(format!(
                        "FITHAW on {}: {errno}",
                        entry.mount_file
                    )));
                }
            }
        }

        *self.locked.lock().expect("freeze mutex poisoned") = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_mounts(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn filters_non_local_and_excluded_entries() {
        let f = write_mounts(
            "/dev/sda1 / ext4 rw 0 0\n\
             proc /proc proc rw 0 0\n\
             //server/share /mnt smbfs rw 0 0\n\
             /dev/loop0 /snap squashfs ro 0 0\n\
             /dev/sda1 / ext4 rw 0 0\n",
        );
        let entries = mount_points_from(f.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].device_spec, "/dev/sda1");
    }

    #[test]
    fn preserves_order_and_dedups() {
        let f = write_mounts(
            "/dev/sda1 / ext4 rw 0 0\n\
             /dev/sdb1 /data xfs rw 0 0\n\
             /dev/sda1 /other ext4 rw 0 0\n",
        );
        let entries = mount_points_from(f.path()).unwrap();
        let specs: Vec<&str> = entries.iter().map(|e| e.device_spec.as_str()).collect();
        assert_eq!(specs, vec!["/dev/sda1", "/dev/sdb1"]);
    }

    #[test]
    fn admission_allows_allowlisted_methods_while_locked() {
        let state = FreezeState::new();
        *state.locked.lock().unwrap() = true;
        assert!(state.admit("/agent.v1.Agent/GetAgentInfo", false).is_ok());
        assert!(state
            .admit("/agent.v1.Filesystem/DownloadFile", true)
            .is_ok());
        assert!(state
            .admit("/agent.v1.Filesystem/UploadFile", true)
            .is_err());
        assert!(state
            .admit("/agent.v1.Network/GetInterfaces", false)
            .is_err());
    }

    #[test]
    fn admission_allows_everything_unlocked() {
        let state = FreezeState::new();
        assert!(state.admit("/anything/At/All", false).is_ok());
    }
}
