//! Moving a link into another network namespace.
//!
//! A migration walks these states, each confirmed before the next starts:
//!
//! ```text
//! Initial -> Detached -> ContextSwitched -> Reattached -> Confirmed
//!         -> Renamed -> Configured -> Up -> Restored
//! ```
//!
//! The context switch into the target namespace is undone on every exit
//! path. A failure reports the last state that completed, so the caller can
//! tell e.g. a link still down in its original namespace (`Initial`/`Detached`)
//! from one already sitting in the target (`ContextSwitched` and later).
//! Steps are not rolled back.

use std::fmt;

use miette::Diagnostic;
use plumb_common::{ContainerId, NetConfig, PlumbError, validate_ifname};
use thiserror::Error;

use crate::context::ContextGuard;
use crate::driver::{LinkFlags, NetDriver};
use crate::link::{Link, LinkAddress};
use crate::netns::NamespaceResolver;
use crate::watcher::LinkWatcher;

/// Progress of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MigrationState {
    /// Nothing done yet.
    Initial,
    /// Link set down in its original namespace.
    Detached,
    /// Link reassigned and the context switched into the target.
    ContextSwitched,
    /// The target namespace reported the link.
    Reattached,
    /// The link resolved by name inside the target.
    Confirmed,
    /// The link carries its requested name.
    Renamed,
    /// The requested address is assigned.
    Configured,
    /// The link is up.
    Up,
    /// The original context is back in place.
    Restored,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initial => "initial",
            Self::Detached => "detached",
            Self::ContextSwitched => "context-switched",
            Self::Reattached => "reattached",
            Self::Confirmed => "confirmed",
            Self::Renamed => "renamed",
            Self::Configured => "configured",
            Self::Up => "up",
            Self::Restored => "restored",
        };
        f.write_str(name)
    }
}

/// A failed migration and the last state it completed.
#[derive(Error, Diagnostic, Debug)]
#[error("Link migration failed after state '{state}'")]
#[diagnostic(code(plumb::migration::failed))]
pub struct MigrationError {
    /// Last state that completed before the failure.
    pub state: MigrationState,
    /// What went wrong.
    #[source]
    #[diagnostic_source]
    pub source: PlumbError,
}

impl MigrationError {
    fn new(state: MigrationState, source: PlumbError) -> Self {
        Self { state, source }
    }

    /// Drop the progress information.
    #[must_use]
    pub fn into_source(self) -> PlumbError {
        self.source
    }

    /// Whether the link may have left its original namespace.
    ///
    /// A failed context switch happens after the reassignment, so the link
    /// already sits in the target even though the state is still `Detached`.
    #[must_use]
    pub fn link_moved(&self) -> bool {
        self.state >= MigrationState::ContextSwitched
            || matches!(self.source, PlumbError::ContextSwitchFailed { .. })
    }
}

/// Result of a successful migration.
#[derive(Debug, Clone, PartialEq)]
pub struct MigratedLink<N> {
    /// Name inside the target namespace.
    pub name: String,
    /// Index inside the target namespace.
    pub index: u32,
    /// Address assigned, if any.
    pub address: Option<LinkAddress>,
    /// The target namespace.
    pub namespace: N,
}

/// Drives link migrations with a fixed configuration.
#[derive(Debug, Clone, Default)]
pub struct Migrator {
    config: NetConfig,
}

impl Migrator {
    /// Create a migrator.
    #[must_use]
    pub fn new(config: NetConfig) -> Self {
        Self { config }
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Move `link` into the namespace of process `pid`.
    ///
    /// # Errors
    ///
    /// Resolution failures are reported with state [`MigrationState::Initial`];
    /// see [`migrate`](Self::migrate) for the rest.
    pub async fn migrate_to_pid<D, R>(
        &self,
        link: Link<D>,
        resolver: &R,
        pid: u32,
        new_name: &str,
        address: Option<LinkAddress>,
    ) -> Result<MigratedLink<D::Namespace>, MigrationError>
    where
        D: NetDriver,
        R: NamespaceResolver<Namespace = D::Namespace>,
    {
        let target = resolver
            .by_pid(pid)
            .map_err(|e| MigrationError::new(MigrationState::Initial, e))?;
        tracing::debug!(pid, "Resolved target namespace from pid");
        self.migrate(link, &target, new_name, address).await
    }

    /// Move `link` into the namespace of a running container.
    ///
    /// # Errors
    ///
    /// An empty or malformed id is [`PlumbError::InvalidArgument`]; an unknown container is
    /// [`PlumbError::ContainerNotFound`]. Both are reported with state
    /// [`MigrationState::Initial`].
    pub async fn migrate_to_container<D, R>(
        &self,
        link: Link<D>,
        resolver: &R,
        container_id: &str,
        new_name: &str,
        address: Option<LinkAddress>,
    ) -> Result<MigratedLink<D::Namespace>, MigrationError>
    where
        D: NetDriver,
        R: NamespaceResolver<Namespace = D::Namespace>,
    {
        let initial = |e| MigrationError::new(MigrationState::Initial, e);
        if container_id.is_empty() {
            return Err(initial(PlumbError::invalid_argument(
                "the container id cannot be empty",
            )));
        }
        let id = ContainerId::new(container_id)
            .map_err(|e| initial(PlumbError::invalid_argument(e.to_string())))?;
        let target = resolver.by_container_id(&id).map_err(initial)?;
        tracing::debug!(container = id.short(), "Resolved target namespace from container");
        self.migrate(link, &target, new_name, address).await
    }

    /// Move `link` into `target`, rename it to `new_name`, optionally assign
    /// `address`, and bring it up.
    ///
    /// The calling context is restored before returning, whether or not the
    /// migration succeeded.
    ///
    /// # Errors
    ///
    /// Returns a [`MigrationError`] carrying the last completed state and one
    /// of [`PlumbError::LinkDownFailed`], [`PlumbError::NamespaceAssignFailed`],
    /// [`PlumbError::ContextSwitchFailed`], [`PlumbError::Timeout`],
    /// [`PlumbError::LinkNotFound`], [`PlumbError::RenameFailed`],
    /// [`PlumbError::AddressConfigFailed`], [`PlumbError::LinkUpFailed`] or
    /// [`PlumbError::ContextRestoreFailed`].
    pub async fn migrate<D: NetDriver>(
        &self,
        link: Link<D>,
        target: &D::Namespace,
        new_name: &str,
        address: Option<LinkAddress>,
    ) -> Result<MigratedLink<D::Namespace>, MigrationError> {
        let mut state = MigrationState::Initial;
        validate_ifname(new_name).map_err(|e| MigrationError::new(state, e))?;
        tracing::debug!(link = %link.name(), to = new_name, ?target, "Migrating link");

        link.down().await.map_err(|e| {
            MigrationError::new(
                state,
                PlumbError::LinkDownFailed {
                    link: link.name().to_string(),
                    source: Box::new(e),
                },
            )
        })?;
        state = MigrationState::Detached;

        let driver = link.driver().clone();
        let guard =
            ContextGuard::capture(driver.as_ref()).map_err(|e| MigrationError::new(state, e))?;
        let outcome = self
            .move_and_configure(&guard, link, target, new_name, address, &mut state)
            .await;
        let restored = guard.restore();

        match (outcome, restored) {
            (Ok(moved), Ok(())) => {
                tracing::info!(
                    link = %moved.name,
                    index = moved.index,
                    state = %MigrationState::Restored,
                    "Link migrated"
                );
                Ok(moved)
            }
            (Ok(_), Err(restore)) => Err(MigrationError::new(state, restore)),
            (Err(err), Ok(())) => {
                tracing::debug!(%state, error = %err, "Link migration failed");
                Err(MigrationError::new(state, err))
            }
            (Err(err), Err(restore)) => {
                Err(MigrationError::new(state, masking(restore, err)))
            }
        }
    }

    async fn move_and_configure<D: NetDriver>(
        &self,
        guard: &ContextGuard<'_, D>,
        link: Link<D>,
        target: &D::Namespace,
        new_name: &str,
        address: Option<LinkAddress>,
        state: &mut MigrationState,
    ) -> Result<MigratedLink<D::Namespace>, PlumbError> {
        let driver = link.driver().clone();
        let old_name = link.name().to_string();
        let timeout = self.config.link_wait_timeout();

        // Subscribed inside the target before the move so the arrival is not missed.
        let arrival = LinkWatcher::subscribe(driver.as_ref(), target, timeout)?;
        let index = driver.link_by_name(&old_name).await?.index;
        driver
            .set_link_namespace(index, target)
            .await
            .map_err(|e| PlumbError::NamespaceAssignFailed {
                link: old_name.clone(),
                source: Box::new(e),
            })?;
        guard.switch_to(target)?;
        *state = MigrationState::ContextSwitched;

        arrival.expect_link(&old_name, LinkFlags::empty()).await?;
        *state = MigrationState::Reattached;

        let mut link = Link::by_name(driver.clone(), &old_name).await?;
        *state = MigrationState::Confirmed;

        if old_name != new_name {
            link.rename(new_name)
                .await
                .map_err(|e| PlumbError::RenameFailed {
                    from: old_name.clone(),
                    to: new_name.to_string(),
                    source: Box::new(e),
                })?;
        }
        *state = MigrationState::Renamed;

        if let Some(address) = address {
            link.add_address(address)
                .await
                .map_err(|e| PlumbError::AddressConfigFailed {
                    link: new_name.to_string(),
                    address: address.to_string(),
                    source: Box::new(e),
                })?;
        }
        *state = MigrationState::Configured;

        let raised = if self.config.confirm_up {
            Some(LinkWatcher::subscribe(driver.as_ref(), target, timeout)?)
        } else {
            None
        };
        link.up().await.map_err(|e| PlumbError::LinkUpFailed {
            link: new_name.to_string(),
            source: Box::new(e),
        })?;
        if let Some(raised) = raised {
            raised.expect_link(new_name, LinkFlags::Up).await?;
        }
        *state = MigrationState::Up;

        Ok(MigratedLink {
            name: link.name().to_string(),
            index: link.index(),
            address,
            namespace: target.clone(),
        })
    }
}

/// Attach the error a failed restore is hiding.
fn masking(restore: PlumbError, earlier: PlumbError) -> PlumbError {
    match restore {
        PlumbError::ContextRestoreFailed { message, .. } => PlumbError::ContextRestoreFailed {
            message,
            masked: Some(Box::new(earlier)),
        },
        other => other,
    }
}
