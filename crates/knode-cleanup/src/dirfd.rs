//! Descriptor-anchored directory handles.
//!
//! Everything in this module works relative to an already-open directory
//! descriptor (`openat`, `fstatat`, `unlinkat`, ...), never by re-resolving
//! a string path from the filesystem root. A descriptor pins one directory
//! instance: if the directory is renamed or moved the handle stays valid,
//! and a symlink or rename inserted mid-traversal cannot redirect an
//! operation outside the subtree the handle was opened in.

use std::ffi::{OsStr, OsString};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::ffi::OsStringExt;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};

use rustix::fs::{self, AtFlags, Mode, OFlags, ResolveFlags, Stat};
use rustix::io::{Errno, Result as SysResult};

/// A file descriptor pointing to a path of unspecified type (file,
/// directory, device, pipe).
///
/// A `PathFd` can only be obtained relative to an already-open [`Dir`],
/// and can be converted into a [`Dir`] once its type is known to be a
/// directory.
#[derive(Debug)]
pub struct PathFd {
    fd: OwnedFd,
}

impl PathFd {
    /// Convert this handle into a [`Dir`] without any additional checks.
    ///
    /// The caller must know that the descriptor refers to a directory,
    /// e.g. because it was opened with [`OFlags::DIRECTORY`].
    #[must_use]
    pub fn into_dir(self) -> Dir {
        Dir { fd: self.fd }
    }
}

impl AsFd for PathFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// A file descriptor pointing to a directory (a.k.a. dirfd).
///
/// The descriptor is opened with `O_DIRECTORY | O_CLOEXEC`, so it is
/// guaranteed to refer to a directory and is not inherited across process
/// replacement. Once closed (dropped), it is never reused.
#[derive(Debug)]
pub struct Dir {
    fd: OwnedFd,
}

impl Dir {
    /// Open a `Dir` referring to the given path.
    ///
    /// Note that this is not a chroot: the `*at` syscalls only use the
    /// descriptor to resolve relative paths, and will happily follow
    /// symlinks and cross mount points unless told otherwise.
    pub fn open(path: &Path, flags: OFlags) -> SysResult<Self> {
        let fd = fs::open(
            path,
            flags | OFlags::DIRECTORY | OFlags::CLOEXEC,
            Mode::empty(),
        )?;
        Ok(Self { fd })
    }

    /// Open the path with the given name relative to this directory,
    /// using the `openat` syscall.
    ///
    /// `mode` is only meaningful together with [`OFlags::CREATE`].
    pub fn open_at(&self, name: &OsStr, flags: OFlags, mode: Mode) -> SysResult<PathFd> {
        let fd = fs::openat(&self.fd, name, flags | OFlags::CLOEXEC, mode)?;
        Ok(PathFd { fd })
    }

    /// Open the directory with the given name relative to this directory.
    pub fn open_dir_at(&self, name: &OsStr, flags: OFlags) -> SysResult<Self> {
        Ok(self
            .open_at(name, flags | OFlags::DIRECTORY, Mode::empty())?
            .into_dir())
    }

    /// Open the path with the given name using the `openat2` syscall,
    /// constraining path resolution with `resolve`.
    ///
    /// Returns [`Errno::NOSYS`] on kernels that lack `openat2` (pre-5.6).
    /// Support is probed once per process and memoized; see
    /// [`openat2_with_support_probe`].
    pub fn open_at2(&self, name: &OsStr, flags: OFlags, resolve: ResolveFlags) -> SysResult<PathFd> {
        let fd = openat2_with_support_probe(self.fd.as_fd(), name, flags, resolve)?;
        Ok(PathFd { fd })
    }

    /// Open the directory with the given name using the `openat2` syscall.
    ///
    /// Returns [`Errno::NOSYS`] on kernels that lack `openat2`.
    pub fn open_dir_at2(
        &self,
        name: &OsStr,
        flags: OFlags,
        resolve: ResolveFlags,
    ) -> SysResult<Self> {
        Ok(self
            .open_at2(name, flags | OFlags::DIRECTORY, resolve)?
            .into_dir())
    }

    /// Stat the directory this descriptor refers to.
    pub fn stat_self(&self) -> SysResult<Stat> {
        fs::fstat(&self.fd)
    }

    /// Stat the path with the given name relative to this directory,
    /// using the `fstatat` syscall.
    pub fn stat_at(&self, name: &OsStr, flags: AtFlags) -> SysResult<Stat> {
        fs::statat(&self.fd, name, flags)
    }

    /// Create a new directory relative to this directory,
    /// using the `mkdirat` syscall.
    pub fn create_dir(&self, name: &OsStr, mode: Mode) -> SysResult<()> {
        fs::mkdirat(&self.fd, name, mode)
    }

    /// Remove the name and possibly the file it refers to,
    /// using the `unlinkat` syscall.
    pub fn remove(&self, name: &OsStr) -> SysResult<()> {
        fs::unlinkat(&self.fd, name, AtFlags::empty())
    }

    /// Remove the empty directory with the given name,
    /// using the `unlinkat` syscall with `AT_REMOVEDIR`.
    ///
    /// Fails with [`Errno::NOTEMPTY`] (or [`Errno::EXIST`], depending on
    /// the filesystem) for a non-empty directory, and with
    /// [`Errno::NOTDIR`] if the name is not a directory. Callers branch
    /// on exactly these.
    pub fn remove_dir(&self, name: &OsStr) -> SysResult<()> {
        fs::unlinkat(&self.fd, name, AtFlags::REMOVEDIR)
    }

    /// Iterate over the names of this directory's entries, in no
    /// particular order, skipping `.` and `..`.
    ///
    /// Iteration is lazy and always starts at the beginning of the
    /// directory. The iterator may be partially consumed, dropped, and a
    /// new one created without skipping or repeating entries that were
    /// present throughout. Entries removed via this handle mid-iteration
    /// may or may not still be yielded; callers must tolerate names that
    /// no longer exist.
    pub fn entry_names(&self) -> SysResult<EntryNames> {
        let mut inner = fs::Dir::read_from(&self.fd)?;
        inner.rewind();
        Ok(EntryNames { inner })
    }
}

impl AsFd for Dir {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Iterator over directory entry names, see [`Dir::entry_names`].
pub struct EntryNames {
    inner: fs::Dir,
}

impl Iterator for EntryNames {
    type Item = SysResult<OsString>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok(entry) => {
                    let name = entry.file_name().to_bytes();
                    if name == b"." || name == b".." {
                        continue;
                    }
                    return Some(Ok(OsString::from_vec(name.to_vec())));
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

const OPENAT2_UNTESTED: u8 = 0;
const OPENAT2_SUPPORTED: u8 = 1;
const OPENAT2_UNSUPPORTED: u8 = 2;

/// Whether the running kernel supports `openat2`, probed lazily.
static OPENAT2_SUPPORT: AtomicU8 = AtomicU8::new(OPENAT2_UNTESTED);

/// Calls `openat2`, memoizing kernel support process-wide.
///
/// The first successful call locks in "supported"; the first
/// [`Errno::NOSYS`] locks in "unsupported", after which all later calls
/// short-circuit without a syscall. Any other error leaves the probe
/// state untouched, so a transient failure for unrelated reasons is
/// never mistaken for missing kernel support.
fn openat2_with_support_probe(
    dirfd: BorrowedFd<'_>,
    name: &OsStr,
    flags: OFlags,
    resolve: ResolveFlags,
) -> SysResult<OwnedFd> {
    if OPENAT2_SUPPORT.load(Ordering::Relaxed) == OPENAT2_UNSUPPORTED {
        return Err(Errno::NOSYS);
    }

    match fs::openat2(dirfd, name, flags | OFlags::CLOEXEC, Mode::empty(), resolve) {
        Ok(fd) => {
            let _ = OPENAT2_SUPPORT.compare_exchange(
                OPENAT2_UNTESTED,
                OPENAT2_SUPPORTED,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
            Ok(fd)
        }
        Err(Errno::NOSYS) => {
            let _ = OPENAT2_SUPPORT.compare_exchange(
                OPENAT2_UNTESTED,
                OPENAT2_UNSUPPORTED,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
            Err(Errno::NOSYS)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::fs::FileType;

    fn tempdir_handle() -> (tempfile::TempDir, Dir) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Dir::open(tmp.path(), OFlags::empty()).unwrap();
        (tmp, dir)
    }

    #[test]
    fn open_missing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let err = Dir::open(&tmp.path().join("nope"), OFlags::empty()).unwrap_err();
        assert_eq!(err, Errno::NOENT);
    }

    #[test]
    fn open_file_as_dir() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("file"), b"x").unwrap();
        let err = Dir::open(&tmp.path().join("file"), OFlags::empty()).unwrap_err();
        assert_eq!(err, Errno::NOTDIR);
    }

    #[test]
    fn create_and_list_entries() {
        let (_tmp, dir) = tempdir_handle();

        dir.open_at(
            OsStr::new("file"),
            OFlags::CREATE | OFlags::WRONLY,
            Mode::from_raw_mode(0o644),
        )
        .unwrap();
        dir.create_dir(OsStr::new("subdir"), Mode::from_raw_mode(0o755))
            .unwrap();

        let mut names: Vec<_> = dir
            .entry_names()
            .unwrap()
            .map(|name| name.unwrap())
            .collect();
        names.sort();
        assert_eq!(names, [OsString::from("file"), OsString::from("subdir")]);
    }

    #[test]
    fn entry_names_restartable() {
        let (_tmp, dir) = tempdir_handle();
        for name in ["a", "b", "c"] {
            dir.create_dir(OsStr::new(name), Mode::from_raw_mode(0o755))
                .unwrap();
        }

        // Partially consume one iterator, then start over with another.
        let mut first = dir.entry_names().unwrap();
        assert!(first.next().is_some());
        drop(first);

        let names: Vec<_> = dir
            .entry_names()
            .unwrap()
            .map(|name| name.unwrap())
            .collect();
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn stat_at_does_not_follow_symlinks() {
        let (tmp, dir) = tempdir_handle();
        std::fs::write(tmp.path().join("target"), b"x").unwrap();
        std::os::unix::fs::symlink("target", tmp.path().join("link")).unwrap();

        let stat = dir
            .stat_at(
                OsStr::new("link"),
                AtFlags::SYMLINK_NOFOLLOW | AtFlags::NO_AUTOMOUNT,
            )
            .unwrap();
        assert_eq!(FileType::from_raw_mode(stat.st_mode), FileType::Symlink);
    }

    #[test]
    fn remove_distinguishes_outcomes() {
        let (tmp, dir) = tempdir_handle();
        std::fs::write(tmp.path().join("file"), b"x").unwrap();
        std::fs::create_dir(tmp.path().join("full")).unwrap();
        std::fs::write(tmp.path().join("full/inner"), b"x").unwrap();

        assert_eq!(dir.remove(OsStr::new("missing")).unwrap_err(), Errno::NOENT);
        assert_eq!(
            dir.remove_dir(OsStr::new("file")).unwrap_err(),
            Errno::NOTDIR
        );
        let err = dir.remove_dir(OsStr::new("full")).unwrap_err();
        assert!(err == Errno::NOTEMPTY || err == Errno::EXIST);

        dir.remove(OsStr::new("file")).unwrap();
        assert!(!tmp.path().join("file").exists());
    }

    #[test]
    fn openat2_stays_beneath() {
        let (tmp, dir) = tempdir_handle();
        std::fs::create_dir(tmp.path().join("subdir")).unwrap();

        match dir.open_dir_at2(
            OsStr::new("subdir"),
            OFlags::NOFOLLOW,
            ResolveFlags::BENEATH | ResolveFlags::NO_MAGICLINKS | ResolveFlags::NO_XDEV,
        ) {
            Ok(sub) => {
                // Same filesystem, so no device crossing.
                let parent_dev = dir.stat_self().unwrap().st_dev;
                assert_eq!(sub.stat_self().unwrap().st_dev, parent_dev);
            }
            // Pre-5.6 kernels only.
            Err(err) => assert_eq!(err, Errno::NOSYS),
        }
    }

    #[test]
    fn handle_survives_rename() {
        let (tmp, _keep) = tempdir_handle();
        std::fs::create_dir(tmp.path().join("old")).unwrap();
        let dir = Dir::open(&tmp.path().join("old"), OFlags::empty()).unwrap();

        std::fs::rename(tmp.path().join("old"), tmp.path().join("new")).unwrap();

        // The descriptor still points at the same directory instance.
        dir.open_at(
            OsStr::new("inside"),
            OFlags::CREATE | OFlags::WRONLY,
            Mode::from_raw_mode(0o644),
        )
        .unwrap();
        assert!(tmp.path().join("new/inside").exists());
    }
}
