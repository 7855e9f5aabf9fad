//! # knode-common
//!
//! Shared utilities and types for the Knode node-lifecycle manager.
//!
//! This crate provides common functionality used across all Knode crates:
//! - Standard filesystem paths
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod paths;

pub use error::{KnodeError, KnodeResult};
pub use paths::KnodePaths;
