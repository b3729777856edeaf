//! # plumb-network
//!
//! Link plumbing for container network namespaces.
//!
//! This crate provides:
//! - Veth pair creation with confirmation from the kernel's link notifications
//! - Link handles for renaming, addressing, up/down and deletion
//! - Migration of a link into another network namespace (by handle, pid or
//!   container id), reporting how far it got when something fails
//! - A [`NetDriver`] seam with an rtnetlink implementation
//!
//! Namespace switches are thread-local. Run migrations through
//! [`worker::run_confined`] or [`worker::spawn_confined`] so the switch never
//! affects other tasks of a multi-threaded runtime.

#![warn(missing_docs)]

pub mod context;
pub mod driver;
pub mod link;
pub mod migrate;
pub mod netns;
pub mod rtnl;
pub mod veth;
pub mod watcher;
pub mod worker;

pub use context::ContextGuard;
pub use driver::{LinkEvent, LinkFlags, LinkInfo, LinkSubscription, NetDriver};
pub use link::{Link, LinkAddress, default_prefix_len, delete_link};
pub use migrate::{MigratedLink, MigrationError, MigrationState, Migrator};
pub use netns::{NamespaceResolver, NetNs, NsId, ProcResolver};
pub use rtnl::RtnetlinkDriver;
pub use veth::VethPair;
pub use watcher::LinkWatcher;
pub use worker::{run_confined, spawn_confined};
