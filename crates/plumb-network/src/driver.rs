//! Kernel-facing collaborator traits.
//!
//! Every link and namespace primitive the migrator needs goes through
//! [`NetDriver`]. The production implementation is
//! [`RtnetlinkDriver`](crate::rtnl::RtnetlinkDriver).

use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use plumb_common::PlumbResult;
use tokio::task::JoinHandle;

/// Interface flag bitmask as reported in link notifications (`IFF_*`).
pub use rtnetlink::packet_route::link::LinkFlags;

/// Snapshot of a link as seen in the current namespace context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// Kernel interface index.
    pub index: u32,
    /// Interface name.
    pub name: String,
    /// Interface flags.
    pub flags: LinkFlags,
}

/// A link-update notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    /// Interface name carried by the notification.
    pub name: String,
    /// Interface index. Zero never identifies a link.
    pub index: u32,
    /// Flags after the change.
    pub flags: LinkFlags,
}

impl LinkEvent {
    /// Whether this notification satisfies a wait for `name` with `required` flags.
    ///
    /// An empty `required` mask matches any notification for the link; a
    /// non-empty mask matches once any of its bits is set.
    #[must_use]
    pub fn matches(&self, name: &str, required: LinkFlags) -> bool {
        self.index != 0
            && self.name == name
            && (required.is_empty() || self.flags.intersects(required))
    }
}

impl From<LinkInfo> for LinkEvent {
    fn from(info: LinkInfo) -> Self {
        Self {
            name: info.name,
            index: info.index,
            flags: info.flags,
        }
    }
}

/// A live subscription to link notifications in one namespace.
///
/// Dropping the subscription unsubscribes: the reader task, if any, is
/// aborted and the underlying socket closed.
pub struct LinkSubscription {
    events: BoxStream<'static, LinkEvent>,
    reader: Option<JoinHandle<()>>,
}

impl LinkSubscription {
    /// Wrap a stream of notifications.
    pub fn new(events: impl Stream<Item = LinkEvent> + Send + 'static) -> Self {
        Self {
            events: events.boxed(),
            reader: None,
        }
    }

    /// Attach the task that feeds the stream so it is stopped with the subscription.
    #[must_use]
    pub fn with_reader(mut self, reader: JoinHandle<()>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Next notification, or `None` once the channel is closed.
    pub async fn next_event(&mut self) -> Option<LinkEvent> {
        self.events.next().await
    }
}

impl Drop for LinkSubscription {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl fmt::Debug for LinkSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkSubscription")
            .field("has_reader", &self.reader.is_some())
            .finish_non_exhaustive()
    }
}

/// Link primitives, execution-context switching and notification subscription.
///
/// Link operations are evaluated against the driver's current namespace
/// context, which [`enter_namespace`](Self::enter_namespace) changes.
/// Subscription and namespace reassignment take the namespace explicitly.
///
/// Error contract: an unknown name or index yields
/// [`PlumbError::LinkNotFound`](plumb_common::PlumbError::LinkNotFound); a name
/// already taken yields [`PlumbError::NameConflict`](plumb_common::PlumbError::NameConflict).
#[async_trait]
pub trait NetDriver: Send + Sync {
    /// Namespace handle type.
    type Namespace: Clone + PartialEq + fmt::Debug + Send + Sync;

    /// Namespace the driver currently operates in.
    fn current_namespace(&self) -> PlumbResult<Self::Namespace>;

    /// Make `ns` the context for subsequent link operations.
    fn enter_namespace(&self, ns: &Self::Namespace) -> PlumbResult<()>;

    /// Subscribe to link notifications raised inside `ns`.
    fn subscribe_links(&self, ns: &Self::Namespace) -> PlumbResult<LinkSubscription>;

    /// Look a link up by name.
    async fn link_by_name(&self, name: &str) -> PlumbResult<LinkInfo>;

    /// Create a veth pair.
    async fn add_veth(&self, name: &str, peer: &str) -> PlumbResult<()>;

    /// Delete a link (and, for veth, its peer).
    async fn delete_link(&self, index: u32) -> PlumbResult<()>;

    /// Set `IFF_UP`.
    async fn set_link_up(&self, index: u32) -> PlumbResult<()>;

    /// Clear `IFF_UP`.
    async fn set_link_down(&self, index: u32) -> PlumbResult<()>;

    /// Rename a link.
    async fn rename_link(&self, index: u32, name: &str) -> PlumbResult<()>;

    /// Assign an address.
    async fn add_address(&self, index: u32, address: IpAddr, prefix_len: u8) -> PlumbResult<()>;

    /// Move a link into `ns`. Issued from the namespace that currently holds it.
    async fn set_link_namespace(&self, index: u32, ns: &Self::Namespace) -> PlumbResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str, index: u32, flags: LinkFlags) -> LinkEvent {
        LinkEvent {
            name: name.to_string(),
            index,
            flags,
        }
    }

    #[test]
    fn empty_mask_matches_any_flags() {
        assert!(event("eth0", 3, LinkFlags::empty()).matches("eth0", LinkFlags::empty()));
        assert!(event("eth0", 3, LinkFlags::Up).matches("eth0", LinkFlags::empty()));
    }

    #[test]
    fn non_empty_mask_needs_intersection() {
        let down = event("eth0", 3, LinkFlags::empty());
        let running = event("eth0", 3, LinkFlags::Running);
        let up = event("eth0", 3, LinkFlags::Up | LinkFlags::LowerUp);
        assert!(!down.matches("eth0", LinkFlags::Up));
        assert!(!running.matches("eth0", LinkFlags::Up));
        assert!(up.matches("eth0", LinkFlags::Up));
        assert!(running.matches("eth0", LinkFlags::Up | LinkFlags::Running));
    }

    #[test]
    fn other_names_and_index_zero_never_match() {
        assert!(!event("eth1", 3, LinkFlags::Up).matches("eth0", LinkFlags::empty()));
        assert!(!event("eth0", 0, LinkFlags::Up).matches("eth0", LinkFlags::empty()));
    }
}
