//! Scoped namespace context switching.

use plumb_common::{PlumbError, PlumbResult};

use crate::driver::NetDriver;

/// Captures the driver's current namespace and switches back to it on every
/// exit path.
///
/// Call [`restore`](Self::restore) to observe a failed switch-back. If the
/// guard is dropped instead (early return, panic, cancelled future) the
/// restore still runs and a failure is logged.
pub struct ContextGuard<'a, D: NetDriver + ?Sized> {
    driver: &'a D,
    original: Option<D::Namespace>,
}

impl<'a, D: NetDriver + ?Sized> ContextGuard<'a, D> {
    /// Record the current namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the current namespace cannot be determined.
    pub fn capture(driver: &'a D) -> PlumbResult<Self> {
        let original = driver.current_namespace()?;
        tracing::trace!(?original, "Captured namespace context");
        Ok(Self {
            driver,
            original: Some(original),
        })
    }

    /// The namespace that will be restored.
    pub fn original(&self) -> Option<&D::Namespace> {
        self.original.as_ref()
    }

    /// Switch into `target`.
    ///
    /// # Errors
    ///
    /// Returns [`PlumbError::ContextSwitchFailed`]; the original context is
    /// still restored when the guard goes away.
    pub fn switch_to(&self, target: &D::Namespace) -> PlumbResult<()> {
        self.driver.enter_namespace(target).map_err(|e| match e {
            PlumbError::ContextSwitchFailed { .. } => e,
            other => PlumbError::ContextSwitchFailed {
                message: other.to_string(),
            },
        })?;
        tracing::debug!(?target, "Switched namespace context");
        Ok(())
    }

    /// Switch back to the captured namespace.
    ///
    /// # Errors
    ///
    /// Returns [`PlumbError::ContextRestoreFailed`].
    pub fn restore(mut self) -> PlumbResult<()> {
        match self.original.take() {
            Some(original) => restore_into(self.driver, &original),
            None => Ok(()),
        }
    }
}

fn restore_into<D: NetDriver + ?Sized>(driver: &D, original: &D::Namespace) -> PlumbResult<()> {
    driver
        .enter_namespace(original)
        .map_err(|e| PlumbError::ContextRestoreFailed {
            message: e.to_string(),
            masked: None,
        })?;
    tracing::trace!(?original, "Restored namespace context");
    Ok(())
}

impl<D: NetDriver + ?Sized> Drop for ContextGuard<'_, D> {
    fn drop(&mut self) {
        if let Some(original) = self.original.take() {
            if let Err(e) = restore_into(self.driver, &original) {
                tracing::error!(error = %e, ?original, "Namespace context left switched");
            }
        }
    }
}
