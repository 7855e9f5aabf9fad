//! # knode-cleanup
//!
//! Race-safe teardown of Knode-owned directory trees, used when
//! uninstalling a node.
//!
//! The engine deletes an entire data-directory tree while never deleting
//! into or through filesystem mount points it does not own (persistent
//! volumes, bind mounts, tmpfs), never following symlinks out of the
//! tree, and staying correct under concurrent mount and rename activity.
//! It is built from:
//!
//! - [`dirfd`]: descriptor-anchored open/stat/unlink primitives,
//! - a layered mount-status probe ([`MountStatus`]),
//! - a hand-written parser for the kernel's escaped mountinfo table,
//! - the recursive teardown itself ([`cleanup_beneath`]),
//! - and the uninstall [`steps`] framework driving it.
//!
//! The engine is Linux-specific and assumes elevated privileges.

#![warn(missing_docs)]
#![cfg(target_os = "linux")]

pub mod dirfd;
mod mountinfo;
mod probe;
pub mod steps;
mod teardown;

pub use probe::MountStatus;
pub use steps::{Cleanup, CleanupConfig, CleanupStep, DirectoriesStep};
pub use teardown::cleanup_beneath;
