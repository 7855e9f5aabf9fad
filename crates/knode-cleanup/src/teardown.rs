//! Race-safe recursive removal of a directory tree.
//!
//! Deletes everything beneath a root directory owned by Knode while never
//! deleting into or through filesystem mount points it does not own:
//! symlinks are removed but never followed, foreign mounts are unmounted
//! as a whole and their contents left untouched, and every traversal step
//! is anchored to an open directory descriptor so that concurrent
//! renames, symlink swaps or mount activity cannot redirect the walk
//! outside the intended subtree.
//!
//! The walk is maximal-effort: entries that cannot be removed are logged
//! and left behind, and only a failure to open or enumerate the root
//! itself (or a mount-probe invariant violation) surfaces as an error.

use std::ffi::OsStr;
use std::io;
use std::path::Path;

use knode_common::{KnodeError, KnodeResult};
use rustix::fs::{OFlags, ResolveFlags};
use rustix::io::Errno;
use rustix::mount::{self, UnmountFlags};

use crate::dirfd::Dir;
use crate::mountinfo;
use crate::probe::{self, MountStatus, ProbeError};

pub(crate) const CLEANUP_OFLAGS: OFlags = OFlags::NOFOLLOW;
pub(crate) const CLEANUP_RESOLVE: ResolveFlags =
    ResolveFlags::BENEATH.union(ResolveFlags::NO_MAGICLINKS);

/// Upper bound on re-examinations of a single entry. Unmounting can
/// reveal another overmount underneath, so an entry may legitimately
/// need several attempts, but the loop must terminate even against a
/// hostile mount storm.
const MAX_ATTEMPTS: u32 = 256;

/// Recursively removes the directory at `root_path` and everything
/// beneath it.
///
/// Mount points below the root are unmounted rather than descended into;
/// their contents are never deleted. Symlinks are removed without being
/// followed. Entries that cannot be removed (foreign mounts this process
/// cannot detach, permission-denied subtrees) are reported as warnings
/// and left in place. A root that does not exist is treated as success.
///
/// Note that this code assumes to be run with elevated privileges.
///
/// # Errors
///
/// Returns an error only if the root itself cannot be opened or
/// enumerated for a reason other than its absence, or if the mount probe
/// hits an internal invariant violation.
pub fn cleanup_beneath(root_path: &Path) -> KnodeResult<()> {
    // The real path is required because the mount checks may compare
    // against paths listed in the proc filesystem.
    let real_path = match std::fs::canonicalize(root_path) {
        Ok(path) => path,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    let dir = match Dir::open(&real_path, CLEANUP_OFLAGS) {
        Ok(dir) => dir,
        Err(Errno::NOENT) => return Ok(()), // Went away since canonicalization.
        Err(err) => return Err(io::Error::from(err).into()),
    };

    let empty = match cleanup_path_names(&dir, &real_path, true) {
        Ok(empty) => empty,
        Err(WalkError::Enumerate(err)) => return Err(io::Error::from(err).into()),
        Err(WalkError::Probe(violation)) => {
            return Err(KnodeError::MountProbe {
                path: violation.path,
                detail: violation.detail.to_string(),
            });
        }
    };
    drop(dir);

    if empty {
        match std::fs::remove_dir(&real_path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %real_path.display(), error = %err, "Leaving behind");
            }
        }
    }

    Ok(())
}

/// Failures that escape the per-entry containment.
enum WalkError {
    /// Enumerating a directory's entries failed.
    Enumerate(Errno),
    /// The mount probe hit an invariant violation; aborts the walk.
    Probe(probe::InvariantViolation),
}

/// Outcome of one attempt on a single named entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CleanupOutcome {
    /// The entry was left in place.
    Ignored,
    /// The situation changed (something was unmounted); the same name
    /// must be re-examined.
    Retry,
    /// The entry no longer exists.
    Unlinked,
}

/// Outcome of the plain unlink/rmdir stage on a single named entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnlinkOutcome {
    /// The entry no longer exists.
    Unlinked,
    /// The entry is a non-empty directory (or something went wrong that
    /// recursion may still resolve).
    Recurse,
    /// The entry was a mounted file and has been unmounted.
    Unmounted,
}

/// A per-entry failure during one cleanup attempt.
enum EntryError {
    /// Contained: the entry is logged and left behind.
    Os(Errno),
    /// Fatal: propagated to the top-level caller.
    Probe(probe::InvariantViolation),
}

impl From<Errno> for EntryError {
    fn from(err: Errno) -> Self {
        Self::Os(err)
    }
}

impl From<ProbeError> for EntryError {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::Os(err) => Self::Os(err),
            ProbeError::Invariant(violation) => Self::Probe(violation),
        }
    }
}

/// Runs the per-entry cleanup over every child of `dir`. Returns whether
/// the directory is believed to be empty afterwards.
fn cleanup_path_names(dir: &Dir, dir_path: &Path, unlink: bool) -> Result<bool, WalkError> {
    let mut leftovers = false;
    for name in dir.entry_names().map_err(WalkError::Enumerate)? {
        let name = name.map_err(WalkError::Enumerate)?;
        if !cleanup_path_name_loop(dir, dir_path, &name, unlink)
            .map_err(WalkError::Probe)?
        {
            leftovers = true;
        }
    }

    Ok(!leftovers)
}

/// Re-enters the per-entry cleanup until it reaches a terminal outcome,
/// bounded by [`MAX_ATTEMPTS`]. Returns whether the entry is gone.
///
/// Modeled as an explicit loop with an attempt counter rather than
/// recursion, to keep the termination bound visible: every retry means
/// something was unmounted, and a hostile peer could remount forever.
fn cleanup_path_name_loop(
    dir: &Dir,
    dir_path: &Path,
    name: &OsStr,
    unlink: bool,
) -> Result<bool, probe::InvariantViolation> {
    for attempt in 1.. {
        let err = match cleanup_path_name(dir, dir_path, name, unlink) {
            Ok(CleanupOutcome::Unlinked) => return Ok(true),
            Ok(CleanupOutcome::Ignored) => return Ok(false),
            Ok(CleanupOutcome::Retry) if attempt < MAX_ATTEMPTS => {
                tracing::debug!(
                    path = %dir_path.join(name).display(),
                    attempt,
                    unlink,
                    "Retrying after unmount"
                );
                continue;
            }
            Ok(CleanupOutcome::Retry) => {
                tracing::warn!(
                    path = %dir_path.join(name).display(),
                    attempts = MAX_ATTEMPTS,
                    "Too many attempts, leaving behind"
                );
                return Ok(false);
            }
            Err(EntryError::Probe(violation)) => return Err(violation),
            Err(EntryError::Os(err)) => err,
        };

        match err {
            Errno::NOENT => return Ok(true),
            Errno::INTR => continue,
            err => {
                tracing::warn!(
                    path = %dir_path.join(name).display(),
                    error = %io::Error::from(err),
                    "Leaving behind"
                );
                return Ok(false);
            }
        }
    }

    unreachable!("attempt counter ranges over all of u32")
}

/// One cleanup attempt on the entry `name` below `dir`.
///
/// With `unlink` set, tries plain unlink/rmdir first. Without it (inside
/// a foreign mount), the walk is read-only: only overmounts are detached,
/// nothing is deleted.
fn cleanup_path_name(
    dir: &Dir,
    dir_path: &Path,
    name: &OsStr,
    unlink: bool,
) -> Result<CleanupOutcome, EntryError> {
    if unlink {
        tracing::debug!(path = %dir_path.join(name).display(), "Trying to unlink");
        match unlink_path_name(dir, dir_path, name)? {
            UnlinkOutcome::Unlinked => return Ok(CleanupOutcome::Unlinked),
            // Unmounted; retry to catch overmounts.
            UnlinkOutcome::Unmounted => return Ok(CleanupOutcome::Retry),
            UnlinkOutcome::Recurse => {}
        }
    }

    // Try to recurse into the directory.
    tracing::debug!(path = %dir_path.join(name).display(), "Trying to open");
    let (sub_dir, is_mount_point) = match open_dir_name(dir, dir_path, name) {
        Ok(opened) => opened,
        Err(EntryError::Os(Errno::NOTDIR)) if !unlink => {
            // Not unlinking and not a directory: this might be a mounted
            // file. Try to unmount it.
            let status = probe::mount_status_at(dir, dir_path, name)?;
            if status == MountStatus::Regular {
                // Definitely not a mount point. Ignore the file.
                return Ok(CleanupOutcome::Ignored);
            }

            let path = dir_path.join(name);
            return match unmount_path(&path) {
                // Unmounted; retry to catch overmounts.
                Ok(()) => Ok(CleanupOutcome::Retry),
                // Not a mount point after all (or a locked one).
                Err(Errno::INVAL) if status == MountStatus::Unknown => {
                    Ok(CleanupOutcome::Ignored)
                }
                Err(err) => Err(err.into()),
            };
        }
        Err(err) => return Err(err),
    };

    // Never delete the contents of a foreign mount; only walk it to find
    // and detach overmounts.
    let unlink = unlink && !is_mount_point;

    let sub_path = dir_path.join(name);
    let empty = match cleanup_path_names(&sub_dir, &sub_path, unlink) {
        Ok(empty) => empty,
        Err(WalkError::Enumerate(err)) => return Err(err.into()),
        Err(WalkError::Probe(violation)) => return Err(EntryError::Probe(violation)),
    };

    // The subdirectory handle must be closed now: an open descriptor
    // anywhere beneath a mount keeps that mount busy.
    drop(sub_dir);

    if is_mount_point {
        unmount_path(&sub_path)?;
        // Retry to catch overmounts.
        return Ok(CleanupOutcome::Retry);
    }

    if unlink && empty {
        dir.remove_dir(name)?;
        return Ok(CleanupOutcome::Unlinked);
    }

    Ok(CleanupOutcome::Ignored)
}

/// The plain unlink/rmdir stage.
///
/// The assumption here is that mount points cannot be simply unlinked,
/// so an unlink that succeeds proves the entry was no mount.
fn unlink_path_name(
    dir: &Dir,
    dir_path: &Path,
    name: &OsStr,
) -> Result<UnlinkOutcome, EntryError> {
    // First try to simply unlink the name.
    let file_err = match dir.remove(name) {
        Ok(()) | Err(Errno::NOENT) => return Ok(UnlinkOutcome::Unlinked),
        Err(err) => err,
    };

    // Try to remove an empty directory.
    match dir.remove_dir(name) {
        Ok(()) => Ok(UnlinkOutcome::Unlinked),

        // It's a non-empty directory.
        Err(Errno::NOTEMPTY | Errno::EXIST) => Ok(UnlinkOutcome::Recurse),

        // Neither file nor directory semantics apply directly. If it's a
        // mount point, try to unmount it.
        Err(Errno::NOTDIR) => {
            let status = probe::mount_status_at(dir, dir_path, name)?;
            if status == MountStatus::Regular {
                return Err(file_err.into());
            }

            unmount_path(&dir_path.join(name))?;
            Ok(UnlinkOutcome::Unmounted)
        }

        // Try to clean up recursively for all other errors.
        Err(_) => Ok(UnlinkOutcome::Recurse),
    }
}

/// Opens the entry `name` as a directory without crossing devices, and
/// reports whether it is a mount point.
///
/// Prefers `openat2` with `RESOLVE_NO_XDEV`: a device-crossing refusal is
/// itself a definitive mount-point signal, after which the entry is
/// reopened without the device constraint. On kernels without `openat2`,
/// falls back to a legacy open followed by the mount status probe, with
/// the mountinfo table as the last resort.
fn open_dir_name(dir: &Dir, dir_path: &Path, name: &OsStr) -> Result<(Dir, bool), EntryError> {
    match dir.open_dir_at2(name, CLEANUP_OFLAGS, CLEANUP_RESOLVE | ResolveFlags::NO_XDEV) {
        Ok(sub_dir) => return Ok((sub_dir, false)),
        // Tried to cross a mount point; reopen without the constraint.
        Err(Errno::XDEV) => {
            let sub_dir = dir.open_dir_at2(name, CLEANUP_OFLAGS, CLEANUP_RESOLVE)?;
            return Ok((sub_dir, true));
        }
        Err(Errno::NOSYS) => {} // Fall back to the legacy open below.
        Err(err) => return Err(err.into()),
    }

    let sub_dir = dir.open_dir_at(name, CLEANUP_OFLAGS)?;
    let sub_path = dir_path.join(name);

    let is_mount_point = match probe::mount_status(dir, &sub_dir, &sub_path)? {
        MountStatus::MountPoint => true,
        MountStatus::Regular => false,
        MountStatus::Unknown => {
            // Still no bullet-proof evidence either way. As a last
            // resort, have a look at the proc filesystem. If that check
            // fails too, no other checks are left; assume it's not a
            // mount point.
            mountinfo::lists_mount_point(Path::new("/proc/self/mountinfo"), &sub_path)
                .unwrap_or(false)
        }
    };

    Ok((sub_dir, is_mount_point))
}

/// Detaches the mount at `path`.
fn unmount_path(path: &Path) -> Result<(), Errno> {
    tracing::debug!(path = %path.display(), "Attempting to unmount");
    mount::unmount(path, UnmountFlags::NOFOLLOW)?;
    tracing::info!(path = %path.display(), "Unmounted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_equality() {
        assert_ne!(CleanupOutcome::Ignored, CleanupOutcome::Retry);
        assert_ne!(UnlinkOutcome::Recurse, UnlinkOutcome::Unmounted);
    }

    #[test]
    fn missing_root_is_success() {
        let tmp = tempfile::tempdir().unwrap();
        cleanup_beneath(&tmp.path().join("non-existent")).unwrap();
        assert!(tmp.path().is_dir());
    }
}
