//! Bounded waits on link-update notifications.
//!
//! Netlink changes are asynchronous: the request is acknowledged before the
//! affected namespace necessarily shows the result. A [`LinkWatcher`] turns
//! the notification stream into a bounded wait for one link reaching a state.
//!
//! # Ordering
//!
//! Subscribe **before** issuing the operation you want to observe. The kernel
//! only delivers notifications to sockets that are already subscribed, so a
//! watcher created after the trigger can miss the event and time out.
//!
//! ```ignore
//! let watcher = LinkWatcher::subscribe(&*driver, &ns, timeout)?;
//! driver.add_veth("vA", "vB").await?;
//! let index = watcher.expect_link("vA", LinkFlags::empty()).await?;
//! ```

use std::time::Duration;

use plumb_common::{PlumbError, PlumbResult};
use tokio::time::Instant;

use crate::driver::{LinkFlags, LinkSubscription, NetDriver};

/// A single-use wait on link notifications in one namespace.
///
/// The watcher is consumed by its wait, so the subscription is released as
/// soon as the wait matches, times out, or is dropped.
#[derive(Debug)]
pub struct LinkWatcher {
    subscription: LinkSubscription,
    timeout: Duration,
}

impl LinkWatcher {
    /// Subscribe to link notifications raised inside `ns`.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver cannot open a subscription.
    pub fn subscribe<D: NetDriver + ?Sized>(
        driver: &D,
        ns: &D::Namespace,
        timeout: Duration,
    ) -> PlumbResult<Self> {
        let subscription = driver.subscribe_links(ns)?;
        tracing::trace!(?ns, ?timeout, "Subscribed to link notifications");
        Ok(Self::from_subscription(subscription, timeout))
    }

    /// Wrap an existing subscription.
    #[must_use]
    pub fn from_subscription(subscription: LinkSubscription, timeout: Duration) -> Self {
        Self {
            subscription,
            timeout,
        }
    }

    /// The wait bound.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait until a notification for `name` matches `required`.
    ///
    /// With an empty mask the first notification for `name` matches; otherwise
    /// a notification matches once its flags intersect `required`. Returns the
    /// link index, or `None` on timeout or when the notification channel closes.
    pub async fn wait_for(self, name: &str, required: LinkFlags) -> Option<u32> {
        self.wait(name, required).await.0
    }

    /// Like [`wait_for`](Self::wait_for) but reports a miss as an error.
    ///
    /// # Errors
    ///
    /// Returns [`PlumbError::Timeout`] if no matching notification arrives.
    pub async fn expect_link(self, name: &str, required: LinkFlags) -> PlumbResult<u32> {
        match self.wait(name, required).await {
            (Some(index), _) => Ok(index),
            (None, waited) => Err(PlumbError::Timeout {
                link: name.to_string(),
                waited,
            }),
        }
    }

    async fn wait(mut self, name: &str, required: LinkFlags) -> (Option<u32>, Duration) {
        let started = Instant::now();
        let subscription = &mut self.subscription;
        let matched = tokio::time::timeout(self.timeout, async {
            while let Some(event) = subscription.next_event().await {
                if event.matches(name, required) {
                    return Some(event.index);
                }
                tracing::trace!(link = %event.name, flags = event.flags.bits(), "Ignoring link notification");
            }
            None
        })
        .await;

        let waited = started.elapsed();
        match matched {
            Ok(Some(index)) => {
                tracing::debug!(link = name, index, ?waited, "Link notification matched");
                (Some(index), waited)
            }
            Ok(None) => {
                tracing::debug!(link = name, "Link notification channel closed");
                (None, waited)
            }
            Err(_) => {
                tracing::debug!(link = name, timeout = ?self.timeout, "Timed out waiting for link");
                (None, waited)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::LinkEvent;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn channel_watcher() -> (mpsc::UnboundedSender<LinkEvent>, LinkWatcher) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = LinkSubscription::new(UnboundedReceiverStream::new(rx));
        (tx, LinkWatcher::from_subscription(subscription, TIMEOUT))
    }

    fn event(name: &str, index: u32, flags: LinkFlags) -> LinkEvent {
        LinkEvent {
            name: name.to_string(),
            index,
            flags,
        }
    }

    #[tokio::test]
    async fn empty_mask_returns_first_notification_for_link() {
        let (tx, watcher) = channel_watcher();
        tx.send(event("other", 2, LinkFlags::Up)).unwrap();
        tx.send(event("vA", 7, LinkFlags::empty())).unwrap();
        tx.send(event("vA", 8, LinkFlags::Up)).unwrap();

        assert_eq!(watcher.wait_for("vA", LinkFlags::empty()).await, Some(7));
    }

    #[tokio::test]
    async fn flag_mask_skips_until_intersection() {
        let (tx, watcher) = channel_watcher();
        tx.send(event("eth0", 4, LinkFlags::empty())).unwrap();
        tx.send(event("eth0", 4, LinkFlags::Running)).unwrap();
        tx.send(event("eth0", 4, LinkFlags::Up | LinkFlags::Running))
            .unwrap();

        assert_eq!(watcher.wait_for("eth0", LinkFlags::Up).await, Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_matching_notification() {
        let (tx, watcher) = channel_watcher();
        tx.send(event("eth0", 4, LinkFlags::empty())).unwrap();

        let started = Instant::now();
        assert_eq!(watcher.wait_for("eth0", LinkFlags::Up).await, None);
        assert!(started.elapsed() >= TIMEOUT);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn expect_link_reports_timeout_error() {
        let (_tx, watcher) = channel_watcher();
        let err = watcher
            .expect_link("vA", LinkFlags::empty())
            .await
            .unwrap_err();
        match err {
            PlumbError::Timeout { link, waited } => {
                assert_eq!(link, "vA");
                assert!(waited >= TIMEOUT);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn closed_channel_ends_wait_early() {
        let (tx, watcher) = channel_watcher();
        drop(tx);
        assert_eq!(watcher.wait_for("vA", LinkFlags::empty()).await, None);
    }

    #[tokio::test]
    async fn wait_releases_subscription() {
        let (tx, watcher) = channel_watcher();
        tx.send(event("vA", 3, LinkFlags::empty())).unwrap();
        watcher.wait_for("vA", LinkFlags::empty()).await;
        assert!(tx.is_closed());
    }
}
