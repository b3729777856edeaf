//! Virtual ethernet pair management.

use std::fmt;
use std::sync::Arc;

use plumb_common::{NetConfig, PlumbError, PlumbResult, validate_ifname};

use crate::driver::{LinkFlags, NetDriver};
use crate::link::{Link, LinkAddress};
use crate::migrate::{MigratedLink, MigrationError, Migrator};
use crate::watcher::LinkWatcher;

/// Both endpoints of a veth pair.
///
/// Creation is all-or-nothing: either both endpoints are bound, or the
/// caller gets an error and no handle.
pub struct VethPair<D: NetDriver> {
    local: Link<D>,
    peer: Link<D>,
}

impl<D: NetDriver> VethPair<D> {
    /// Create a veth pair `name <-> peer` in the driver's current namespace.
    ///
    /// Returns once the kernel has announced the new link and both endpoints
    /// resolve by name.
    ///
    /// # Errors
    ///
    /// Returns [`PlumbError::InvalidArgument`] for empty, malformed, or equal
    /// names, and [`PlumbError::PairCreationFailed`] otherwise; a name already
    /// in use surfaces as a wrapped [`PlumbError::NameConflict`].
    pub async fn create(
        driver: Arc<D>,
        name: &str,
        peer: &str,
        config: &NetConfig,
    ) -> PlumbResult<Self> {
        if name.is_empty() || peer.is_empty() {
            return Err(PlumbError::invalid_argument(
                "both veth endpoint names are required",
            ));
        }
        validate_ifname(name)?;
        validate_ifname(peer)?;
        if name == peer {
            return Err(PlumbError::invalid_argument(format!(
                "veth endpoints cannot share the name {name}"
            )));
        }

        tracing::debug!(name, peer, "Creating veth pair");
        let failed = |source: PlumbError| PlumbError::PairCreationFailed {
            name: name.to_string(),
            peer: peer.to_string(),
            source: Box::new(source),
        };

        let ns = driver.current_namespace().map_err(failed)?;
        let created = LinkWatcher::subscribe(driver.as_ref(), &ns, config.link_wait_timeout())
            .map_err(failed)?;
        driver.add_veth(name, peer).await.map_err(failed)?;

        match Self::bind(&driver, created, name, peer).await {
            Ok(pair) => {
                tracing::info!(
                    name,
                    peer,
                    index = pair.local.index(),
                    peer_index = pair.peer.index(),
                    "Veth pair created"
                );
                Ok(pair)
            }
            Err(e) => {
                if config.cleanup_failed_pairs {
                    discard(driver.as_ref(), name, peer).await;
                }
                Err(failed(e))
            }
        }
    }

    async fn bind(
        driver: &Arc<D>,
        created: LinkWatcher,
        name: &str,
        peer: &str,
    ) -> PlumbResult<Self> {
        created.expect_link(name, LinkFlags::empty()).await?;
        let local = Link::by_name(driver.clone(), name).await?;
        let peer = Link::by_name(driver.clone(), peer).await?;
        Ok(Self { local, peer })
    }

    /// The local endpoint.
    #[must_use]
    pub fn local(&self) -> &Link<D> {
        &self.local
    }

    /// The peer endpoint.
    #[must_use]
    pub fn peer(&self) -> &Link<D> {
        &self.peer
    }

    /// Split into `(local, peer)`.
    #[must_use]
    pub fn into_parts(self) -> (Link<D>, Link<D>) {
        (self.local, self.peer)
    }

    /// Move the peer endpoint into `target`, keeping the local endpoint.
    ///
    /// # Errors
    ///
    /// See [`Migrator::migrate`].
    pub async fn move_peer_to(
        self,
        target: &D::Namespace,
        new_name: &str,
        address: Option<LinkAddress>,
        config: &NetConfig,
    ) -> Result<(Link<D>, MigratedLink<D::Namespace>), MigrationError> {
        let Self { local, peer } = self;
        let moved = Migrator::new(config.clone())
            .migrate(peer, target, new_name, address)
            .await?;
        Ok((local, moved))
    }

    /// Delete the pair. Removing one endpoint removes the other.
    ///
    /// # Errors
    ///
    /// Returns [`PlumbError::LinkNotFound`] if the local endpoint is gone.
    pub async fn delete(self) -> PlumbResult<()> {
        self.local.delete().await
    }
}

impl<D: NetDriver> fmt::Debug for VethPair<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VethPair")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish()
    }
}

/// Best-effort removal of a half-created pair.
///
/// Either endpoint may be the one that exists; deleting it takes the other
/// with it.
async fn discard<D: NetDriver + ?Sized>(driver: &D, name: &str, peer: &str) {
    for endpoint in [name, peer] {
        match driver.link_by_name(endpoint).await {
            Ok(info) => {
                if let Err(e) = driver.delete_link(info.index).await {
                    tracing::warn!(link = endpoint, error = %e, "Failed to remove half-created veth pair");
                }
                return;
            }
            Err(e) if e.is_link_not_found() => {}
            Err(e) => {
                tracing::warn!(link = endpoint, error = %e, "Failed to look up half-created veth pair");
                return;
            }
        }
    }
}
