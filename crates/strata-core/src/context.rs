//! Per-call context threaded through every metastore operation.
//!
//! The context bundles the realm the call is scoped to, the time source,
//! the diagnostics service, configuration, and a cooperative cancellation
//! flag. Public entry points acquire their backend handles once and pass
//! the same context to every downstream helper.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::ConfigurationStore;
use crate::diagnostics::Diagnostics;
use crate::realm::RealmId;

/// Context for a single metastore call.
///
/// Cheap to clone; clones share the same clock, configuration and
/// cancellation flag.
#[derive(Debug, Clone)]
pub struct CallContext {
    realm: RealmId,
    clock: Arc<dyn Clock>,
    diagnostics: Diagnostics,
    config: Arc<ConfigurationStore>,
    cancelled: Arc<AtomicBool>,
}

impl CallContext {
    /// Creates a context for the given realm with the system clock and
    /// empty configuration.
    #[must_use]
    pub fn new(realm: RealmId) -> Self {
        Self {
            realm,
            clock: Arc::new(SystemClock),
            diagnostics: Diagnostics::new(),
            config: Arc::new(ConfigurationStore::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replaces the clock (e.g. with a simulated one in tests).
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the configuration store.
    #[must_use]
    pub fn with_config(mut self, config: ConfigurationStore) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// The realm this call is scoped to.
    #[must_use]
    pub fn realm(&self) -> &RealmId {
        &self.realm
    }

    /// The time source for this call.
    #[must_use]
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// The diagnostics service for this call.
    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// The configuration for this call.
    #[must_use]
    pub fn config(&self) -> &ConfigurationStore {
        &self.config
    }

    /// Marks this call (and all clones of the context) cancelled.
    ///
    /// Long-running iterations check the flag between per-entity operations
    /// and stop with the last accumulated result.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_shared_across_clones() {
        let ctx = CallContext::new(RealmId::new_unchecked("test-realm"));
        let clone = ctx.clone();
        assert!(!clone.is_cancelled());
        ctx.cancel();
        assert!(clone.is_cancelled());
    }
}
