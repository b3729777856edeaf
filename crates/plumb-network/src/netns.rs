//! Network namespace handles and resolution.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use plumb_common::{ContainerId, PlumbError, PlumbPaths, PlumbResult};
use walkdir::WalkDir;

/// Kernel identity of a namespace: device and inode of its nsfs file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NsId {
    /// Device number.
    pub dev: u64,
    /// Inode number.
    pub ino: u64,
}

/// An open reference to a network namespace.
///
/// Holding the handle keeps the namespace alive. Handles compare equal when
/// they refer to the same namespace, whatever path they were opened from.
#[derive(Debug, Clone)]
pub struct NetNs {
    fd: Arc<OwnedFd>,
    id: NsId,
    path: PathBuf,
}

impl NetNs {
    /// Open a namespace file such as `/proc/<pid>/ns/net`.
    ///
    /// # Errors
    ///
    /// Returns [`PlumbError::NamespaceNotFound`] if the file does not exist.
    pub fn from_path(path: impl AsRef<Path>) -> PlumbResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PlumbError::NamespaceNotFound {
                target: path.display().to_string(),
            },
            std::io::ErrorKind::PermissionDenied => PlumbError::PermissionDenied {
                operation: format!("open {}", path.display()),
            },
            _ => PlumbError::Io(e),
        })?;
        let fd = OwnedFd::from(file);
        let stat = rustix::fs::fstat(&fd).map_err(std::io::Error::from)?;

        #[allow(clippy::unnecessary_cast)]
        let id = NsId {
            dev: stat.st_dev as u64,
            ino: stat.st_ino as u64,
        };

        Ok(Self {
            fd: Arc::new(fd),
            id,
            path: path.to_path_buf(),
        })
    }

    /// Namespace of a process.
    ///
    /// # Errors
    ///
    /// Returns [`PlumbError::NamespaceNotFound`] if the process does not exist.
    pub fn from_pid(pid: u32) -> PlumbResult<Self> {
        Self::from_path(PlumbPaths::default().process_netns(pid))
    }

    /// Namespace of the calling thread.
    ///
    /// # Errors
    ///
    /// Returns an error if procfs is unavailable.
    pub fn current() -> PlumbResult<Self> {
        Self::from_path(PlumbPaths::default().thread_netns())
    }

    /// Namespace created with `ip netns add <name>`.
    ///
    /// # Errors
    ///
    /// Returns [`PlumbError::NamespaceNotFound`] if no such namespace exists.
    pub fn named(name: &str) -> PlumbResult<Self> {
        Self::from_path(PlumbPaths::default().named_netns(name))
    }

    /// Kernel identity.
    #[must_use]
    pub fn id(&self) -> NsId {
        self.id
    }

    /// Path the handle was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PartialEq for NetNs {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NetNs {}

impl AsFd for NetNs {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for NetNs {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Resolves migration targets to namespace handles.
pub trait NamespaceResolver {
    /// Handle type produced.
    type Namespace;

    /// Namespace of a process.
    fn by_pid(&self, pid: u32) -> PlumbResult<Self::Namespace>;

    /// Namespace of a running container.
    fn by_container_id(&self, id: &ContainerId) -> PlumbResult<Self::Namespace>;

    /// Namespace of the calling thread.
    fn current(&self) -> PlumbResult<Self::Namespace>;
}

/// Resolver backed by procfs and the cgroup filesystem.
///
/// Containers are located by scanning the cgroup tree for a directory whose
/// name contains the container id (`docker-<id>.scope`, `docker/<id>`,
/// `cri-containerd-<id>.scope`, ...) and taking the first pid listed in it.
#[derive(Debug, Clone, Default)]
pub struct ProcResolver {
    paths: PlumbPaths,
}

impl ProcResolver {
    /// Deepest cgroup directory level searched for a container.
    const MAX_CGROUP_DEPTH: usize = 8;

    /// Create a resolver over the default paths.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a resolver over custom paths.
    #[must_use]
    pub fn with_paths(paths: PlumbPaths) -> Self {
        Self { paths }
    }

    /// Namespace created with `ip netns add <name>`.
    ///
    /// # Errors
    ///
    /// Returns [`PlumbError::NamespaceNotFound`] if no such namespace exists.
    pub fn by_name(&self, name: &str) -> PlumbResult<NetNs> {
        if name.is_empty() || name.contains('/') {
            return Err(PlumbError::invalid_argument(format!(
                "invalid namespace name '{name}'"
            )));
        }
        NetNs::from_path(self.paths.named_netns(name))
    }

    /// First pid of the container's cgroup.
    ///
    /// # Errors
    ///
    /// Returns [`PlumbError::ContainerNotFound`] if no populated cgroup matches.
    pub fn container_pid(&self, id: &ContainerId) -> PlumbResult<u32> {
        let entries = WalkDir::new(&self.paths.cgroup_root)
            .max_depth(Self::MAX_CGROUP_DEPTH)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_dir())
            .filter(|entry| cgroup_matches(&entry.file_name().to_string_lossy(), id.as_str()));

        for entry in entries {
            if let Some(pid) = first_pid(entry.path()) {
                tracing::debug!(container = id.short(), pid, cgroup = %entry.path().display(), "Resolved container");
                return Ok(pid);
            }
        }

        Err(PlumbError::ContainerNotFound {
            id: id.to_string(),
        })
    }
}

/// Scope prefixes used by docker, containerd, cri-o and podman under systemd.
const SCOPE_PREFIXES: [&str; 4] = ["docker-", "cri-containerd-", "crio-", "libpod-"];

/// Whether the cgroup directory `name` belongs to container `id`.
///
/// The directory is either the full container id (cgroupfs driver) or a
/// runtime scope `<prefix><id>.scope` (systemd driver). `id` may be a short
/// prefix of at least 12 characters of a 64-character id.
fn cgroup_matches(name: &str, id: &str) -> bool {
    let candidate = match name.strip_suffix(".scope") {
        Some(unit) => match SCOPE_PREFIXES.iter().find_map(|p| unit.strip_prefix(p)) {
            Some(candidate) => candidate,
            None => return false,
        },
        None => name,
    };
    candidate == id
        || (id.len() >= 12
            && candidate.len() == 64
            && candidate.bytes().all(|b| b.is_ascii_hexdigit())
            && candidate.starts_with(id))
}

/// First pid in `cgroup.procs` (v2) or `tasks` (v1).
fn first_pid(cgroup: &Path) -> Option<u32> {
    ["cgroup.procs", "tasks"].iter().find_map(|file| {
        let reader = BufReader::new(File::open(cgroup.join(file)).ok()?);
        reader
            .lines()
            .map_while(Result::ok)
            .find_map(|line| line.trim().parse::<u32>().ok())
            .filter(|pid| *pid != 0)
    })
}

impl NamespaceResolver for ProcResolver {
    type Namespace = NetNs;

    fn by_pid(&self, pid: u32) -> PlumbResult<NetNs> {
        if pid == 0 {
            return Err(PlumbError::invalid_argument("pid 0 has no network namespace"));
        }
        NetNs::from_path(self.paths.process_netns(pid))
    }

    fn by_container_id(&self, id: &ContainerId) -> PlumbResult<NetNs> {
        let pid = self.container_pid(id)?;
        self.by_pid(pid).map_err(|e| match e {
            PlumbError::NamespaceNotFound { .. } => PlumbError::ContainerNotFound {
                id: id.to_string(),
            },
            other => other,
        })
    }

    fn current(&self) -> PlumbResult<NetNs> {
        NetNs::from_path(self.paths.thread_netns())
    }
}
