//! [`NetDriver`] implementation over rtnetlink.
//!
//! The driver keeps one rtnetlink connection whose socket lives in the
//! namespace the calling thread was in when the connection was opened.
//! [`NetDriver::enter_namespace`] moves the calling thread with `setns` and
//! reopens the connection, so the driver must stay on one OS thread for the
//! duration of a migration. Opening a driver outside a current-thread runtime
//! is refused. Use [`worker::run_confined`](crate::worker::run_confined) to get
//! such a thread.

use std::net::IpAddr;
use std::os::fd::{AsFd, AsRawFd};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, future};
use parking_lot::Mutex;
use plumb_common::{PlumbError, PlumbPaths, PlumbResult};
use rtnetlink::constants::RTMGRP_LINK;
use rtnetlink::packet_core::{NetlinkMessage, NetlinkPayload};
use rtnetlink::packet_route::RouteNetlinkMessage;
use rtnetlink::packet_route::link::{LinkAttribute, LinkMessage};
use rtnetlink::sys::{AsyncSocket, SocketAddr};
use rtnetlink::{Handle, LinkUnspec, LinkVeth, new_connection};
use rustix::thread::{LinkNameSpaceType, move_into_link_name_space};
use tokio::runtime::RuntimeFlavor;
use tokio::task::JoinHandle;

use crate::driver::{LinkEvent, LinkInfo, LinkSubscription, NetDriver};
use crate::netns::NetNs;

/// An rtnetlink request handle plus the task driving its socket.
struct Connection {
    handle: Handle,
    task: JoinHandle<()>,
}

impl Connection {
    fn open() -> PlumbResult<Self> {
        let (connection, handle, _) = new_connection()?;
        let task = tokio::spawn(connection);
        Ok(Self { handle, task })
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Link primitives backed by the kernel's rtnetlink interface.
///
/// Must be created and used inside a current-thread Tokio runtime.
pub struct RtnetlinkDriver {
    paths: PlumbPaths,
    connection: Mutex<Connection>,
}

impl RtnetlinkDriver {
    /// Open a driver in the calling thread's namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the netlink socket cannot be created.
    pub fn new() -> PlumbResult<Self> {
        Self::with_paths(PlumbPaths::default())
    }

    /// Open a driver that resolves procfs paths from `paths`.
    ///
    /// # Errors
    ///
    /// Returns [`PlumbError::Unsupported`] when called outside a
    /// current-thread runtime, or an error if the netlink socket cannot be
    /// created.
    pub fn with_paths(paths: PlumbPaths) -> PlumbResult<Self> {
        require_current_thread_runtime()?;
        Ok(Self {
            paths,
            connection: Mutex::new(Connection::open()?),
        })
    }

    fn handle(&self) -> Handle {
        self.connection.lock().handle.clone()
    }

    fn thread_netns(&self) -> PlumbResult<NetNs> {
        NetNs::from_path(self.paths.thread_netns())
    }

    fn open_link_monitor() -> PlumbResult<LinkSubscription> {
        let (mut connection, _, messages) = new_connection()?;
        connection
            .socket_mut()
            .socket_mut()
            .bind(&SocketAddr::new(0, RTMGRP_LINK))?;
        let reader = tokio::spawn(connection);
        let events = messages.filter_map(|(message, _)| future::ready(link_event(message)));
        Ok(LinkSubscription::new(events).with_reader(reader))
    }
}

/// `setns` moves one OS thread; a work-stealing runtime would run later
/// requests of the same migration on other threads.
fn require_current_thread_runtime() -> PlumbResult<()> {
    let flavor = tokio::runtime::Handle::try_current().map(|handle| handle.runtime_flavor());
    match flavor {
        Ok(RuntimeFlavor::CurrentThread) => Ok(()),
        Ok(other) => Err(PlumbError::Unsupported {
            feature: format!("rtnetlink driver on a {other:?} runtime"),
        }),
        Err(_) => Err(PlumbError::Unsupported {
            feature: "rtnetlink driver outside a Tokio runtime".to_string(),
        }),
    }
}

fn move_thread_into(ns: &NetNs) -> PlumbResult<()> {
    move_into_link_name_space(ns.as_fd(), Some(LinkNameSpaceType::Network)).map_err(|e| {
        PlumbError::ContextSwitchFailed {
            message: format!("setns({}): {e}", ns.path().display()),
        }
    })
}

fn link_info(message: &LinkMessage) -> Option<LinkInfo> {
    let name = message.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::IfName(name) => Some(name.clone()),
        _ => None,
    })?;
    Some(LinkInfo {
        index: message.header.index,
        name,
        flags: message.header.flags,
    })
}

fn link_event(message: NetlinkMessage<RouteNetlinkMessage>) -> Option<LinkEvent> {
    match message.payload {
        NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => {
            link_info(&link).map(LinkEvent::from)
        }
        _ => None,
    }
}

fn errno(err: &rtnetlink::Error) -> Option<i32> {
    match err {
        rtnetlink::Error::NetlinkError(message) => message.code.map(|code| -code.get()),
        _ => None,
    }
}

fn map_error(operation: &str, subject: &str, err: &rtnetlink::Error) -> PlumbError {
    match errno(err) {
        Some(libc::ENODEV) => PlumbError::LinkNotFound {
            name: subject.to_string(),
        },
        Some(libc::EEXIST) => PlumbError::NameConflict {
            name: subject.to_string(),
        },
        Some(libc::EPERM | libc::EACCES) => PlumbError::PermissionDenied {
            operation: format!("{operation} {subject}"),
        },
        _ => PlumbError::Netlink {
            operation: operation.to_string(),
            message: err.to_string(),
        },
    }
}

fn by_index(index: u32) -> String {
    format!("#{index}")
}

#[async_trait]
impl NetDriver for RtnetlinkDriver {
    type Namespace = NetNs;

    fn current_namespace(&self) -> PlumbResult<NetNs> {
        self.thread_netns()
    }

    fn enter_namespace(&self, ns: &NetNs) -> PlumbResult<()> {
        move_thread_into(ns)?;
        let fresh = Connection::open().map_err(|e| PlumbError::ContextSwitchFailed {
            message: format!("reopening netlink socket in {}: {e}", ns.path().display()),
        })?;
        *self.connection.lock() = fresh;
        Ok(())
    }

    fn subscribe_links(&self, ns: &NetNs) -> PlumbResult<LinkSubscription> {
        let current = self.thread_netns()?;
        if current == *ns {
            return Self::open_link_monitor();
        }

        // The socket joins the namespace it is created in.
        move_thread_into(ns)?;
        let monitor = Self::open_link_monitor();
        if let Err(e) = move_thread_into(&current) {
            return Err(PlumbError::ContextRestoreFailed {
                message: e.to_string(),
                masked: monitor.err().map(Box::new),
            });
        }
        monitor
    }

    async fn link_by_name(&self, name: &str) -> PlumbResult<LinkInfo> {
        let mut links = self
            .handle()
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(message)) => link_info(&message).ok_or_else(|| PlumbError::Netlink {
                operation: "get link".to_string(),
                message: format!("reply for {name} carries no interface name"),
            }),
            Ok(None) => Err(PlumbError::LinkNotFound {
                name: name.to_string(),
            }),
            Err(e) => Err(map_error("get link", name, &e)),
        }
    }

    async fn add_veth(&self, name: &str, peer: &str) -> PlumbResult<()> {
        let result = self
            .handle()
            .link()
            .add(LinkVeth::new(name, peer).build())
            .execute()
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if errno(&e) == Some(libc::EEXIST) => {
                let taken = if self.link_by_name(name).await.is_ok() {
                    name
                } else {
                    peer
                };
                Err(PlumbError::NameConflict {
                    name: taken.to_string(),
                })
            }
            Err(e) => Err(map_error("add veth", name, &e)),
        }
    }

    async fn delete_link(&self, index: u32) -> PlumbResult<()> {
        self.handle()
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| map_error("delete link", &by_index(index), &e))
    }

    async fn set_link_up(&self, index: u32) -> PlumbResult<()> {
        self.handle()
            .link()
            .set(LinkUnspec::new_with_index(index).up().build())
            .execute()
            .await
            .map_err(|e| map_error("set link up", &by_index(index), &e))
    }

    async fn set_link_down(&self, index: u32) -> PlumbResult<()> {
        self.handle()
            .link()
            .set(LinkUnspec::new_with_index(index).down().build())
            .execute()
            .await
            .map_err(|e| map_error("set link down", &by_index(index), &e))
    }

    async fn rename_link(&self, index: u32, name: &str) -> PlumbResult<()> {
        let result = self
            .handle()
            .link()
            .set(
                LinkUnspec::new_with_index(index)
                    .name(name.to_string())
                    .build(),
            )
            .execute()
            .await;
        result.map_err(|e| match errno(&e) {
            Some(libc::EEXIST) => PlumbError::NameConflict {
                name: name.to_string(),
            },
            _ => map_error("rename link", &by_index(index), &e),
        })
    }

    async fn add_address(&self, index: u32, address: IpAddr, prefix_len: u8) -> PlumbResult<()> {
        let result = self
            .handle()
            .address()
            .add(index, address, prefix_len)
            .execute()
            .await;
        result.map_err(|e| match errno(&e) {
            Some(libc::EEXIST) => PlumbError::Netlink {
                operation: "add address".to_string(),
                message: format!("{address}/{prefix_len} is already assigned"),
            },
            Some(libc::EINVAL) => PlumbError::invalid_argument(format!(
                "kernel rejected {address}/{prefix_len}"
            )),
            _ => map_error("add address", &by_index(index), &e),
        })
    }

    async fn set_link_namespace(&self, index: u32, ns: &NetNs) -> PlumbResult<()> {
        self.handle()
            .link()
            .set(
                LinkUnspec::new_with_index(index)
                    .setns_by_fd(ns.as_raw_fd())
                    .build(),
            )
            .execute()
            .await
            .map_err(|e| map_error("set link netns", &by_index(index), &e))
    }
}
