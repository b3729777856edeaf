//! Standard filesystem paths used to locate network namespaces.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default procfs mount point.
pub static PLUMB_PROC_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("PLUMB_PROC_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/proc"))
});

/// Default cgroup filesystem mount point.
pub static PLUMB_CGROUP_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("PLUMB_CGROUP_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/sys/fs/cgroup"))
});

/// Directory holding `ip netns` named namespaces.
pub static PLUMB_NETNS_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("PLUMB_NETNS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/run/netns"))
});

/// Paths used to resolve namespace handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlumbPaths {
    /// procfs mount point (default: /proc).
    pub proc_root: PathBuf,
    /// cgroupfs mount point (default: /sys/fs/cgroup).
    pub cgroup_root: PathBuf,
    /// Named namespace directory (default: /var/run/netns).
    pub netns_dir: PathBuf,
}

impl PlumbPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different cgroup root, e.g. a fixture tree in tests.
    #[must_use]
    pub fn with_cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = root.into();
        self
    }

    /// Use a different named-namespace directory.
    #[must_use]
    pub fn with_netns_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.netns_dir = dir.into();
        self
    }

    /// Network namespace file of a process.
    #[must_use]
    pub fn process_netns(&self, pid: u32) -> PathBuf {
        self.proc_root
            .join(pid.to_string())
            .join("ns")
            .join("net")
    }

    /// Network namespace file of the calling thread.
    ///
    /// `setns(CLONE_NEWNET)` only moves the calling thread, so this can differ
    /// from `/proc/self/ns/net`.
    #[must_use]
    pub fn thread_netns(&self) -> PathBuf {
        self.proc_root.join("thread-self").join("ns").join("net")
    }

    /// Named namespace file created by `ip netns add`.
    #[must_use]
    pub fn named_netns(&self, name: &str) -> PathBuf {
        self.netns_dir.join(name)
    }
}

impl Default for PlumbPaths {
    fn default() -> Self {
        Self {
            proc_root: PLUMB_PROC_ROOT.clone(),
            cgroup_root: PLUMB_CGROUP_ROOT.clone(),
            netns_dir: PLUMB_NETNS_DIR.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths() {
        let paths = PlumbPaths::new();
        assert_eq!(paths.process_netns(42), PathBuf::from("/proc/42/ns/net"));
        assert_eq!(
            paths.thread_netns(),
            PathBuf::from("/proc/thread-self/ns/net")
        );
        assert_eq!(
            paths.named_netns("blue"),
            PathBuf::from("/var/run/netns/blue")
        );
    }

    #[test]
    fn custom_cgroup_root() {
        let paths = PlumbPaths::new().with_cgroup_root("/tmp/cg");
        assert_eq!(paths.cgroup_root, PathBuf::from("/tmp/cg"));
        assert_eq!(paths.proc_root, PathBuf::from("/proc"));
    }
}
