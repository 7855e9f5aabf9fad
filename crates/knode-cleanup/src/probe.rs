//! Heuristic mount-point detection.
//!
//! Decides whether a directory entry is a mount point using the cheapest
//! conclusive check first: an `openat2` open constrained with
//! `RESOLVE_NO_XDEV` (a "crossed device" refusal is itself definitive),
//! then a device-number comparison against the parent, then an attempt to
//! mark the entry as an expiring mount while holding it open. Only the
//! caller's mountinfo fallback has cost proportional to the system's
//! mount count; nothing here does.

use std::ffi::OsStr;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use rustix::fs::{OFlags, ResolveFlags};
use rustix::io::Errno;
use rustix::mount::{self, UnmountFlags};

use crate::dirfd::Dir;
use crate::teardown::{CLEANUP_OFLAGS, CLEANUP_RESOLVE};

/// The mount status of a single directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStatus {
    /// No check was conclusive. Callers must treat this conservatively:
    /// proceed as if the entry were regular, but be prepared for it to
    /// be a mount point after all.
    Unknown,
    /// Definitely not a mount point.
    Regular,
    /// Definitely a mount point.
    MountPoint,
}

/// Failure while probing mount status.
#[derive(Debug)]
pub(crate) enum ProbeError {
    /// An ordinary syscall failure; contained per entry by the caller.
    Os(Errno),
    /// The mount-expiry probe returned a response that should be
    /// impossible while an open descriptor to the target is held.
    /// Propagated as a hard error, since silently mis-classifying mount
    /// status could delete data outside the target tree.
    Invariant(InvariantViolation),
}

/// See [`ProbeError::Invariant`].
#[derive(Debug)]
pub(crate) struct InvariantViolation {
    pub path: PathBuf,
    pub detail: &'static str,
}

impl From<Errno> for ProbeError {
    fn from(err: Errno) -> Self {
        Self::Os(err)
    }
}

/// Determine the mount status of the entry `name` below `dir`.
pub(crate) fn mount_status_at(
    dir: &Dir,
    dir_path: &Path,
    name: &OsStr,
) -> Result<MountStatus, ProbeError> {
    match dir.open_at2(
        name,
        CLEANUP_OFLAGS | OFlags::PATH,
        CLEANUP_RESOLVE | ResolveFlags::NO_XDEV,
    ) {
        Ok(_path) => return Ok(MountStatus::Regular),
        Err(Errno::XDEV) => return Ok(MountStatus::MountPoint),
        Err(Errno::NOSYS) => {} // openat2 unsupported, fall back below.
        Err(err) => return Err(err.into()),
    }

    let fd = dir.open_at(name, CLEANUP_OFLAGS | OFlags::PATH, rustix::fs::Mode::empty())?;
    mount_status(dir, &fd, &dir_path.join(name))
}

/// Determine the mount status of `fd`, an open handle to `path` whose
/// parent directory is `dir`.
pub(crate) fn mount_status(
    dir: &Dir,
    fd: &impl AsFd,
    path: &Path,
) -> Result<MountStatus, ProbeError> {
    // Don't bother with statx() here. The interesting fields (stx_mnt_id)
    // and attributes (STATX_ATTR_MOUNT_ROOT) arrived in Linux 5.8, whereas
    // openat2() is a thing since 5.6. It's highly unlikely that those are
    // available when openat2() isn't.

    // Check if the paths have different device numbers.
    let dir_stat = dir.stat_self().map_err(ProbeError::Os)?;
    let fd_stat = rustix::fs::fstat(fd).map_err(ProbeError::Os)?;
    if dir_stat.st_dev != fd_stat.st_dev {
        return Ok(MountStatus::MountPoint);
    }

    // Try to expire the mount point. The open descriptor to path keeps an
    // actual mount busy, so the expiry can never go through.
    match mount::unmount(path, UnmountFlags::EXPIRE | UnmountFlags::NOFOLLOW) {
        Err(Errno::INVAL) => {
            // The expected error when path is not a mount point. There's
            // still the chance that path refers to a locked mount point,
            // i.e. one that belongs to a more privileged mount namespace.
            // That's not easy to rule out.
            // See https://www.man7.org/linux/man-pages/man2/umount.2.html#ERRORS.
            // See https://man7.org/linux/man-pages/man7/mount_namespaces.7.html.
            Ok(MountStatus::Unknown)
        }
        Err(Errno::BUSY) => {
            // The expected error when path is a mount point: the resource
            // is in use, guaranteed by the open file descriptor.
            Ok(MountStatus::MountPoint)
        }
        Err(Errno::PERM) => {
            // Not privileged to unmount path. This code is expected to run
            // as root, but don't bail out over it.
            tracing::debug!(
                path = %path.display(),
                "Not permitted to probe mount expiry, mount status stays unknown"
            );
            Ok(MountStatus::Unknown)
        }
        Err(Errno::AGAIN) => {
            // The expected error for an unused mount point that has now
            // been marked as expired. Impossible while the descriptor to
            // path is open.
            Err(ProbeError::Invariant(InvariantViolation {
                path: path.to_owned(),
                detail: "mount expiry marked an in-use mount as expired",
            }))
        }
        Ok(()) => {
            // The path was unmounted because it had already been expired
            // before. Impossible while the descriptor to path is open.
            Err(ProbeError::Invariant(InvariantViolation {
                path: path.to_owned(),
                detail: "mount expiry unmounted an in-use mount",
            }))
        }
        Err(err) => Err(ProbeError::Os(err)),
    }
}
