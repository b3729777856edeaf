//! In-memory network driver for tests.
//!
//! Models namespaces as link tables, keeps a per-driver "current" namespace
//! that `enter_namespace` changes, and delivers link notifications only to
//! subscribers that exist when the change happens.

#![allow(dead_code, missing_docs)]

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use plumb_common::{PlumbError, PlumbResult};
use plumb_network::{LinkEvent, LinkFlags, LinkInfo, LinkSubscription, NetDriver};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FakeNs(pub u32);

pub const HOST: FakeNs = FakeNs(0);
pub const CONTAINER: FakeNs = FakeNs(1);

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fail {
    Enter(FakeNs),
    Subscribe,
    AddVeth,
    SetNamespace,
    Rename,
    AddAddress,
    Up,
    Down,
}

#[derive(Debug, Clone)]
struct FakeLink {
    name: String,
    index: u32,
    flags: LinkFlags,
    peer: Option<u32>,
    addresses: Vec<(IpAddr, u8)>,
}

#[derive(Debug, Default)]
struct State {
    current: FakeNs,
    links: HashMap<FakeNs, Vec<FakeLink>>,
    next_index: u32,
    subscribers: HashMap<FakeNs, Vec<UnboundedSender<LinkEvent>>>,
    failures: HashSet<Fail>,
    silent: bool,
    quiet_up: bool,
    lose_local: bool,
    entered: Vec<FakeNs>,
}

impl Default for FakeNs {
    fn default() -> Self {
        HOST
    }
}

impl State {
    fn injected(&self, fail: Fail) -> PlumbResult<()> {
        if self.failures.contains(&fail) {
            return Err(PlumbError::Netlink {
                operation: format!("{fail:?}"),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn table(&mut self, ns: FakeNs) -> &mut Vec<FakeLink> {
        self.links.entry(ns).or_default()
    }

    fn by_index(&mut self, index: u32) -> PlumbResult<&mut FakeLink> {
        let current = self.current;
        self.table(current)
            .iter_mut()
            .find(|link| link.index == index)
            .ok_or_else(|| PlumbError::LinkNotFound {
                name: format!("#{index}"),
            })
    }

    fn name_taken(&mut self, ns: FakeNs, name: &str) -> bool {
        self.table(ns).iter().any(|link| link.name == name)
    }

    fn notify(&mut self, ns: FakeNs, link: &FakeLink) {
        if self.silent {
            return;
        }
        let event = LinkEvent {
            name: link.name.clone(),
            index: link.index,
            flags: link.flags,
        };
        if let Some(subscribers) = self.subscribers.get_mut(&ns) {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    fn notify_index(&mut self, index: u32) {
        let current = self.current;
        if let Some(link) = self
            .table(current)
            .iter()
            .find(|link| link.index == index)
            .cloned()
        {
            self.notify(current, &link);
        }
    }

    fn fresh_index(&mut self) -> u32 {
        self.next_index += 1;
        self.next_index
    }
}

#[derive(Debug, Default)]
pub struct FakeDriver {
    state: Mutex<State>,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        let driver = Self::default();
        driver.state.lock().next_index = 1;
        driver.insert_link(HOST, "lo", LinkFlags::Up);
        driver.insert_link(CONTAINER, "lo", LinkFlags::Up);
        Arc::new(driver)
    }

    /// Add a standalone link without notifications.
    pub fn insert_link(&self, ns: FakeNs, name: &str, flags: LinkFlags) -> u32 {
        let mut state = self.state.lock();
        let index = state.fresh_index();
        state.table(ns).push(FakeLink {
            name: name.to_string(),
            index,
            flags,
            peer: None,
            addresses: Vec::new(),
        });
        index
    }

    pub fn fail(&self, fail: Fail) {
        self.state.lock().failures.insert(fail);
    }

    pub fn silence(&self) {
        self.state.lock().silent = true;
    }

    /// Raise links without announcing it.
    pub fn quiet_up(&self) {
        self.state.lock().quiet_up = true;
    }

    /// Create veth pairs whose local endpoint never appears.
    pub fn lose_local(&self) {
        self.state.lock().lose_local = true;
    }

    pub fn current(&self) -> FakeNs {
        self.state.lock().current
    }

    /// Every namespace entered, in order.
    pub fn entered(&self) -> Vec<FakeNs> {
        self.state.lock().entered.clone()
    }

    pub fn has_link(&self, ns: FakeNs, name: &str) -> bool {
        self.state.lock().name_taken(ns, name)
    }

    pub fn link_names(&self, ns: FakeNs) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .table(ns)
            .iter()
            .map(|link| link.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn flags(&self, ns: FakeNs, name: &str) -> Option<LinkFlags> {
        self.state
            .lock()
            .table(ns)
            .iter()
            .find(|link| link.name == name)
            .map(|link| link.flags)
    }

    pub fn addresses(&self, ns: FakeNs, name: &str) -> Vec<(IpAddr, u8)> {
        self.state
            .lock()
            .table(ns)
            .iter()
            .find(|link| link.name == name)
            .map(|link| link.addresses.clone())
            .unwrap_or_default()
    }

    /// Subscriptions whose receiving end is still alive.
    pub fn active_subscriptions(&self) -> usize {
        self.state
            .lock()
            .subscribers
            .values()
            .flatten()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Change a link's flags from outside and notify subscribers.
    pub fn set_flags(&self, ns: FakeNs, name: &str, flags: LinkFlags) {
        let mut state = self.state.lock();
        let link = state
            .table(ns)
            .iter_mut()
            .find(|link| link.name == name)
            .map(|link| {
                link.flags = flags;
                link.clone()
            });
        if let Some(link) = link {
            state.notify(ns, &link);
        }
    }
}

#[async_trait]
impl NetDriver for FakeDriver {
    type Namespace = FakeNs;

    fn current_namespace(&self) -> PlumbResult<FakeNs> {
        Ok(self.state.lock().current)
    }

    fn enter_namespace(&self, ns: &FakeNs) -> PlumbResult<()> {
        let mut state = self.state.lock();
        if state.failures.contains(&Fail::Enter(*ns)) {
            return Err(PlumbError::ContextSwitchFailed {
                message: format!("injected setns failure into {ns:?}"),
            });
        }
        state.current = *ns;
        state.entered.push(*ns);
        Ok(())
    }

    fn subscribe_links(&self, ns: &FakeNs) -> PlumbResult<LinkSubscription> {
        let mut state = self.state.lock();
        state.injected(Fail::Subscribe)?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.entry(*ns).or_default().push(tx);
        Ok(LinkSubscription::new(UnboundedReceiverStream::new(rx)))
    }

    async fn link_by_name(&self, name: &str) -> PlumbResult<LinkInfo> {
        let mut state = self.state.lock();
        let current = state.current;
        state
            .table(current)
            .iter()
            .find(|link| link.name == name)
            .map(|link| LinkInfo {
                index: link.index,
                name: link.name.clone(),
                flags: link.flags,
            })
            .ok_or_else(|| PlumbError::LinkNotFound {
                name: name.to_string(),
            })
    }

    async fn add_veth(&self, name: &str, peer: &str) -> PlumbResult<()> {
        let mut state = self.state.lock();
        state.injected(Fail::AddVeth)?;
        let current = state.current;
        for taken in [name, peer] {
            if state.name_taken(current, taken) {
                return Err(PlumbError::NameConflict {
                    name: taken.to_string(),
                });
            }
        }
        let index = state.fresh_index();
        let peer_index = state.fresh_index();
        let local = FakeLink {
            name: name.to_string(),
            index,
            flags: LinkFlags::empty(),
            peer: Some(peer_index),
            addresses: Vec::new(),
        };
        let remote = FakeLink {
            name: peer.to_string(),
            index: peer_index,
            flags: LinkFlags::empty(),
            peer: Some(index),
            addresses: Vec::new(),
        };
        if !state.lose_local {
            state.table(current).push(local.clone());
            state.notify(current, &local);
        }
        state.table(current).push(remote.clone());
        state.notify(current, &remote);
        Ok(())
    }

    async fn delete_link(&self, index: u32) -> PlumbResult<()> {
        let mut state = self.state.lock();
        let peer = state.by_index(index)?.peer;
        let current = state.current;
        state.table(current).retain(|link| link.index != index);
        if let Some(peer) = peer {
            for table in state.links.values_mut() {
                table.retain(|link| link.index != peer);
            }
        }
        Ok(())
    }

    async fn set_link_up(&self, index: u32) -> PlumbResult<()> {
        let mut state = self.state.lock();
        state.injected(Fail::Up)?;
        let link = state.by_index(index)?;
        link.flags = link.flags | LinkFlags::Up | LinkFlags::Running;
        if !state.quiet_up {
            state.notify_index(index);
        }
        Ok(())
    }

    async fn set_link_down(&self, index: u32) -> PlumbResult<()> {
        let mut state = self.state.lock();
        state.injected(Fail::Down)?;
        let link = state.by_index(index)?;
        link.flags = link.flags.difference(LinkFlags::Up | LinkFlags::Running);
        state.notify_index(index);
        Ok(())
    }

    async fn rename_link(&self, index: u32, name: &str) -> PlumbResult<()> {
        let mut state = self.state.lock();
        state.injected(Fail::Rename)?;
        let current = state.current;
        state.by_index(index)?;
        if state.name_taken(current, name) {
            return Err(PlumbError::NameConflict {
                name: name.to_string(),
            });
        }
        state.by_index(index)?.name = name.to_string();
        state.notify_index(index);
        Ok(())
    }

    async fn add_address(&self, index: u32, address: IpAddr, prefix_len: u8) -> PlumbResult<()> {
        let mut state = self.state.lock();
        state.injected(Fail::AddAddress)?;
        let link = state.by_index(index)?;
        if link.addresses.iter().any(|(existing, _)| *existing == address) {
            return Err(PlumbError::Netlink {
                operation: "add address".to_string(),
                message: format!("{address}/{prefix_len} is already assigned"),
            });
        }
        link.addresses.push((address, prefix_len));
        Ok(())
    }

    async fn set_link_namespace(&self, index: u32, ns: &FakeNs) -> PlumbResult<()> {
        let mut state = self.state.lock();
        state.injected(Fail::SetNamespace)?;
        let current = state.current;
        let name = state.by_index(index)?.name.clone();
        if state.name_taken(*ns, &name) {
            return Err(PlumbError::NameConflict { name });
        }
        let table = state.table(current);
        let Some(position) = table.iter().position(|link| link.index == index) else {
            return Err(PlumbError::LinkNotFound {
                name: format!("#{index}"),
            });
        };
        let link = table.remove(position);
        state.table(*ns).push(link.clone());
        state.notify(*ns, &link);
        Ok(())
    }
}

/// Resolver over fixed pid and container tables.
#[derive(Debug, Default)]
pub struct FakeResolver {
    pub pids: HashMap<u32, FakeNs>,
    pub containers: HashMap<String, FakeNs>,
}

impl FakeResolver {
    pub fn with_container(id: &str, pid: u32, ns: FakeNs) -> Self {
        let mut resolver = Self::default();
        resolver.pids.insert(pid, ns);
        resolver.containers.insert(id.to_string(), ns);
        resolver
    }
}

impl plumb_network::NamespaceResolver for FakeResolver {
    type Namespace = FakeNs;

    fn by_pid(&self, pid: u32) -> PlumbResult<FakeNs> {
        self.pids
            .get(&pid)
            .copied()
            .ok_or_else(|| PlumbError::NamespaceNotFound {
                target: format!("pid {pid}"),
            })
    }

    fn by_container_id(&self, id: &plumb_common::ContainerId) -> PlumbResult<FakeNs> {
        self.containers
            .get(id.as_str())
            .copied()
            .ok_or_else(|| PlumbError::ContainerNotFound { id: id.to_string() })
    }

    fn current(&self) -> PlumbResult<FakeNs> {
        Ok(HOST)
    }
}
