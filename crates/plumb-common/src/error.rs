//! Common error types for plumb.

use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`PlumbError`].
pub type PlumbResult<T> = Result<T, PlumbError>;

/// Errors raised while creating, configuring, or migrating links.
#[derive(Error, Diagnostic, Debug)]
pub enum PlumbError {
    /// A required input was empty or malformed.
    #[error("Invalid argument: {message}")]
    #[diagnostic(code(plumb::invalid_argument))]
    InvalidArgument {
        /// What was wrong with the input.
        message: String,
    },

    /// The link does not exist in the current namespace context.
    #[error("Link not found: {name}")]
    #[diagnostic(
        code(plumb::link::not_found),
        help("Link handles go stale once the link moves to another network namespace")
    )]
    LinkNotFound {
        /// Name (or `#index`) of the missing link.
        name: String,
    },

    /// The namespace already holds a link with this name.
    #[error("Link name already in use: {name}")]
    #[diagnostic(code(plumb::link::name_conflict))]
    NameConflict {
        /// The conflicting name.
        name: String,
    },

    /// A network namespace could not be opened.
    #[error("Network namespace not found: {target}")]
    #[diagnostic(code(plumb::netns::not_found))]
    NamespaceNotFound {
        /// Path or description of the namespace.
        target: String,
    },

    /// The kernel refused to reassign the link to the target namespace.
    #[error("Failed to move link {link} into the target namespace")]
    #[diagnostic(code(plumb::netns::assign_failed))]
    NamespaceAssignFailed {
        /// The link being moved.
        link: String,
        /// Underlying cause.
        #[source]
        source: Box<PlumbError>,
    },

    /// Switching the thread's namespace context failed.
    #[error("Failed to switch network namespace context: {message}")]
    #[diagnostic(code(plumb::context::switch_failed))]
    ContextSwitchFailed {
        /// Description of the failure.
        message: String,
    },

    /// Switching back to the original namespace context failed.
    ///
    /// The calling thread may still be inside the target namespace.
    #[error("Failed to restore the original network namespace context: {message}")]
    #[diagnostic(
        code(plumb::context::restore_failed),
        severity(Error),
        help("Netlink calls issued from this thread may now target the wrong namespace; discard the thread")
    )]
    ContextRestoreFailed {
        /// Description of the failure.
        message: String,
        /// Earlier error that the failed restore is hiding, if any.
        #[source]
        masked: Option<Box<PlumbError>>,
    },

    /// A bounded wait for a link notification expired.
    #[error("Timed out after {waited:?} waiting for link {link}")]
    #[diagnostic(code(plumb::watcher::timeout))]
    Timeout {
        /// The awaited link name.
        link: String,
        /// How long the wait lasted.
        waited: Duration,
    },

    /// Renaming a link failed.
    #[error("Failed to rename link {from} to {to}")]
    #[diagnostic(code(plumb::link::rename_failed))]
    RenameFailed {
        /// Old name.
        from: String,
        /// Requested name.
        to: String,
        /// Underlying cause.
        #[source]
        source: Box<PlumbError>,
    },

    /// The kernel rejected an address assignment.
    #[error("Failed to configure address {address} on link {link}")]
    #[diagnostic(code(plumb::link::address_failed))]
    AddressConfigFailed {
        /// The link being configured.
        link: String,
        /// The requested address in CIDR notation.
        address: String,
        /// Underlying cause.
        #[source]
        source: Box<PlumbError>,
    },

    /// Bringing a link up failed.
    #[error("Failed to bring link {link} up")]
    #[diagnostic(code(plumb::link::up_failed))]
    LinkUpFailed {
        /// The link.
        link: String,
        /// Underlying cause.
        #[source]
        source: Box<PlumbError>,
    },

    /// Bringing a link down failed.
    #[error("Failed to bring link {link} down")]
    #[diagnostic(code(plumb::link::down_failed))]
    LinkDownFailed {
        /// The link.
        link: String,
        /// Underlying cause.
        #[source]
        source: Box<PlumbError>,
    },

    /// Creating a veth pair failed.
    #[error("Failed to create veth pair {name} <-> {peer}")]
    #[diagnostic(code(plumb::veth::creation_failed))]
    PairCreationFailed {
        /// Local endpoint name.
        name: String,
        /// Peer endpoint name.
        peer: String,
        /// Underlying cause.
        #[source]
        source: Box<PlumbError>,
    },

    /// No running container matches the id.
    #[error("Container not found: {id}")]
    #[diagnostic(code(plumb::container::not_found))]
    ContainerNotFound {
        /// The container ID that was not found.
        id: String,
    },

    /// Invalid container ID format.
    #[error("Invalid container ID: {id}")]
    #[diagnostic(
        code(plumb::container::invalid_id),
        help("Container IDs must be alphanumeric with '-', '_' or '.', 1-128 characters")
    )]
    InvalidContainerId {
        /// The invalid container ID.
        id: String,
    },

    /// A netlink request failed for a reason without a dedicated variant.
    #[error("Netlink {operation} failed: {message}")]
    #[diagnostic(code(plumb::netlink))]
    Netlink {
        /// The request that failed.
        operation: String,
        /// Kernel or transport message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(plumb::io))]
    Io(#[from] std::io::Error),

    /// Permission denied.
    #[error("Permission denied: {operation}")]
    #[diagnostic(
        code(plumb::permission_denied),
        help("Moving links between namespaces requires CAP_NET_ADMIN and CAP_SYS_ADMIN")
    )]
    PermissionDenied {
        /// The operation that was denied.
        operation: String,
    },

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(code(plumb::unsupported), help("Namespace switches are per OS thread; run the work under plumb_network::run_confined"))]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(plumb::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(plumb::internal), help("This is a bug, please report it"))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl PlumbError {
    /// Shorthand for [`PlumbError::InvalidArgument`].
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Whether this error, or any error it wraps, is a [`PlumbError::NameConflict`].
    #[must_use]
    pub fn is_name_conflict(&self) -> bool {
        self.any_cause(|e| matches!(e, Self::NameConflict { .. }))
    }

    /// Whether this error, or any error it wraps, is a [`PlumbError::LinkNotFound`].
    #[must_use]
    pub fn is_link_not_found(&self) -> bool {
        self.any_cause(|e| matches!(e, Self::LinkNotFound { .. }))
    }

    fn any_cause(&self, pred: impl Fn(&Self) -> bool) -> bool {
        let mut current = Some(self);
        while let Some(err) = current {
            if pred(err) {
                return true;
            }
            current = err.wrapped();
        }
        false
    }

    fn wrapped(&self) -> Option<&Self> {
        match self {
            Self::NamespaceAssignFailed { source, .. }
            | Self::RenameFailed { source, .. }
            | Self::AddressConfigFailed { source, .. }
            | Self::LinkUpFailed { source, .. }
            | Self::LinkDownFailed { source, .. }
            | Self::PairCreationFailed { source, .. } => Some(source),
            Self::ContextRestoreFailed { masked, .. } => masked.as_deref(),
            _ => None,
        }
    }
}

impl From<toml::de::Error> for PlumbError {
    fn from(err: toml::de::Error) -> Self {
        PlumbError::Config {
            message: err.to_string(),
        }
    }
}
