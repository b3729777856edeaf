//! # plumb-common
//!
//! Shared types for the plumb container-networking crates.
//!
//! This crate provides:
//! - The error taxonomy used by every link and namespace operation
//! - Container ID and interface name validation
//! - Standard procfs/cgroupfs paths for namespace lookup
//! - Networking configuration

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod id;
pub mod paths;

pub use config::NetConfig;
pub use error::{PlumbError, PlumbResult};
pub use id::{ContainerId, validate_ifname};
pub use paths::PlumbPaths;
