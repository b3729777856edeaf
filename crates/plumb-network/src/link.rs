//! Link handles.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use plumb_common::{NetConfig, PlumbError, PlumbResult, validate_ifname};

use crate::driver::{LinkInfo, NetDriver};
use crate::migrate::{MigratedLink, MigrationError, Migrator};
use crate::netns::NamespaceResolver;

/// An address with prefix length, e.g. `10.0.0.2/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkAddress {
    address: IpAddr,
    prefix_len: u8,
}

impl LinkAddress {
    /// Build an address, deriving the prefix from the address class when
    /// `prefix_len` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`PlumbError::InvalidArgument`] if the prefix exceeds the
    /// family's bit width.
    pub fn new(address: IpAddr, prefix_len: Option<u8>) -> PlumbResult<Self> {
        let max = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix_len = prefix_len.unwrap_or_else(|| default_prefix_len(address));
        if prefix_len > max {
            return Err(PlumbError::invalid_argument(format!(
                "prefix /{prefix_len} is too long for {address}"
            )));
        }
        Ok(Self {
            address,
            prefix_len,
        })
    }

    /// The address.
    #[must_use]
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// The prefix length.
    #[must_use]
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }
}

/// Classful default prefix: /8, /16 or /24 for IPv4 classes A, B and C-E; /64 for IPv6.
#[must_use]
pub fn default_prefix_len(address: IpAddr) -> u8 {
    match address {
        IpAddr::V4(v4) => match v4.octets()[0] {
            0..=0x7f => 8,
            0x80..=0xbf => 16,
            _ => 24,
        },
        IpAddr::V6(_) => 64,
    }
}

impl fmt::Display for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for LinkAddress {
    type Err = PlumbError;

    /// Parse `addr/prefix` or a bare `addr` (classful prefix).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => {
                let prefix = prefix.parse::<u8>().map_err(|_| {
                    PlumbError::invalid_argument(format!("invalid prefix length in '{s}'"))
                })?;
                (addr, Some(prefix))
            }
            None => (s, None),
        };
        let address = addr
            .parse::<IpAddr>()
            .map_err(|_| PlumbError::invalid_argument(format!("invalid IP address '{addr}'")))?;
        Self::new(address, prefix)
    }
}

/// A handle to one network interface in the driver's current namespace.
///
/// The handle tracks the link by name and re-resolves it on every operation,
/// so it fails with [`PlumbError::LinkNotFound`] once the link has been
/// deleted or moved out of the namespace.
pub struct Link<D: NetDriver> {
    driver: Arc<D>,
    name: String,
    index: u32,
}

impl<D: NetDriver> Link<D> {
    /// Bind to an existing link.
    ///
    /// # Errors
    ///
    /// Returns [`PlumbError::InvalidArgument`] for an empty name and
    /// [`PlumbError::LinkNotFound`] if no such link exists.
    pub async fn by_name(driver: Arc<D>, name: &str) -> PlumbResult<Self> {
        if name.is_empty() {
            return Err(PlumbError::invalid_argument("link name cannot be empty"));
        }
        let info = driver.link_by_name(name).await?;
        Ok(Self::from_info(driver, info))
    }

    pub(crate) fn from_info(driver: Arc<D>, info: LinkInfo) -> Self {
        Self {
            driver,
            name: info.name,
            index: info.index,
        }
    }

    /// Current name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index seen at the last resolution.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The driver this handle issues operations through.
    #[must_use]
    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// Re-resolve the link and return its current state.
    ///
    /// # Errors
    ///
    /// Returns [`PlumbError::LinkNotFound`] if the link is gone.
    pub async fn refresh(&mut self) -> PlumbResult<LinkInfo> {
        let info = self.driver.link_by_name(&self.name).await?;
        self.index = info.index;
        Ok(info)
    }

    async fn resolve(&self) -> PlumbResult<u32> {
        Ok(self.driver.link_by_name(&self.name).await?.index)
    }

    /// Bring the link administratively up.
    ///
    /// # Errors
    ///
    /// Returns [`PlumbError::LinkNotFound`] if the link is gone.
    pub async fn up(&self) -> PlumbResult<()> {
        let index = self.resolve().await?;
        self.driver.set_link_up(index).await?;
        tracing::debug!(link = %self.name, index, "Link up");
        Ok(())
    }

    /// Bring the link administratively down.
    ///
    /// # Errors
    ///
    /// Returns [`PlumbError::LinkNotFound`] if the link is gone.
    pub async fn down(&self) -> PlumbResult<()> {
        let index = self.resolve().await?;
        self.driver.set_link_down(index).await?;
        tracing::debug!(link = %self.name, index, "Link down");
        Ok(())
    }

    /// Rename the link.
    ///
    /// # Errors
    ///
    /// Returns [`PlumbError::InvalidArgument`] for an empty or malformed name
    /// without contacting the kernel, and [`PlumbError::NameConflict`] if the
    /// namespace already has a link with that name.
    pub async fn rename(&mut self, new_name: &str) -> PlumbResult<()> {
        if new_name.is_empty() {
            return Err(PlumbError::invalid_argument("the link name cannot be empty"));
        }
        validate_ifname(new_name)?;
        let index = self.resolve().await?;
        if new_name == self.name {
            return Ok(());
        }
        self.driver.rename_link(index, new_name).await?;
        tracing::debug!(from = %self.name, to = new_name, index, "Link renamed");
        self.name = new_name.to_string();
        self.index = index;
        Ok(())
    }

    /// Assign an address; a missing prefix is derived from the address class.
    ///
    /// # Errors
    ///
    /// Returns [`PlumbError::InvalidArgument`] if `address` is `None` or the
    /// prefix is out of range.
    pub async fn configure_address(
        &self,
        address: Option<IpAddr>,
        prefix_len: Option<u8>,
    ) -> PlumbResult<LinkAddress> {
        let Some(address) = address else {
            return Err(PlumbError::invalid_argument("an IP address is required"));
        };
        let address = LinkAddress::new(address, prefix_len)?;
        self.add_address(address).await?;
        Ok(address)
    }

    /// Assign a prepared address.
    ///
    /// # Errors
    ///
    /// Returns the driver's error if the kernel rejects the address.
    pub async fn add_address(&self, address: LinkAddress) -> PlumbResult<()> {
        let index = self.resolve().await?;
        self.driver
            .add_address(index, address.address(), address.prefix_len())
            .await?;
        tracing::debug!(link = %self.name, %address, "Address configured");
        Ok(())
    }

    /// Delete the link. Deleting a veth endpoint removes its peer too.
    ///
    /// # Errors
    ///
    /// Returns [`PlumbError::LinkNotFound`] if the link is already gone.
    pub async fn delete(&self) -> PlumbResult<()> {
        let index = self.resolve().await?;
        self.driver.delete_link(index).await?;
        tracing::debug!(link = %self.name, index, "Link deleted");
        Ok(())
    }

    /// Move the link into `target` under `new_name`, optionally assigning an address.
    ///
    /// # Errors
    ///
    /// See [`Migrator::migrate`].
    pub async fn move_to_namespace(
        self,
        target: &D::Namespace,
        new_name: &str,
        address: Option<LinkAddress>,
        config: &NetConfig,
    ) -> Result<MigratedLink<D::Namespace>, MigrationError> {
        Migrator::new(config.clone())
            .migrate(self, target, new_name, address)
            .await
    }

    /// Move the link into the namespace of process `pid`.
    ///
    /// # Errors
    ///
    /// See [`Migrator::migrate_to_pid`].
    pub async fn move_to_pid<R>(
        self,
        resolver: &R,
        pid: u32,
        new_name: &str,
        address: Option<LinkAddress>,
        config: &NetConfig,
    ) -> Result<MigratedLink<D::Namespace>, MigrationError>
    where
        R: NamespaceResolver<Namespace = D::Namespace>,
    {
        Migrator::new(config.clone())
            .migrate_to_pid(self, resolver, pid, new_name, address)
            .await
    }

    /// Move the link into the namespace of a running container.
    ///
    /// # Errors
    ///
    /// See [`Migrator::migrate_to_container`].
    pub async fn move_to_container<R>(
        self,
        resolver: &R,
        container_id: &str,
        new_name: &str,
        address: Option<LinkAddress>,
        config: &NetConfig,
    ) -> Result<MigratedLink<D::Namespace>, MigrationError>
    where
        R: NamespaceResolver<Namespace = D::Namespace>,
    {
        Migrator::new(config.clone())
            .migrate_to_container(self, resolver, container_id, new_name, address)
            .await
    }
}

impl<D: NetDriver> fmt::Debug for Link<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("name", &self.name)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// Delete a link by name in the driver's current namespace.
///
/// # Errors
///
/// Returns [`PlumbError::InvalidArgument`] for an empty name and
/// [`PlumbError::LinkNotFound`] if no such link exists.
pub async fn delete_link<D: NetDriver + ?Sized>(driver: &D, name: &str) -> PlumbResult<()> {
    if name.is_empty() {
        return Err(PlumbError::invalid_argument("the name of the link is not valid"));
    }
    let info = driver.link_by_name(name).await?;
    driver.delete_link(info.index).await?;
    tracing::debug!(link = name, index = info.index, "Link deleted");
    Ok(())
}
