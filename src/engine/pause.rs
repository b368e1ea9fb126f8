use tracing::debug;

use crate::{
    host::FlushScope,
    taint::{GcReport, TaintPolicy},
    Engine, Result,
};

/// Proof that the guest is paused.
///
/// Taint store operations that create, destroy or sweep nodes take a `&MutationToken`.
/// Only a [`PauseGuard`] can create one, so these operations cannot run while translated
/// code might still be executing against the old tree.
#[derive(Debug)]
pub struct MutationToken {
    _private: (),
}

impl MutationToken {
    pub(crate) fn new() -> Self {
        MutationToken { _private: () }
    }
}

/// Exclusive access to the engine with the guest paused.
///
/// Created by [`Engine::pause_for_mutation`], which stops the VM; dropping the guard
/// starts it again.
///
/// # Example
///
/// ```rust
/// use vmscope::host::{FlushScope, HostEvent, RecordingHost};
/// use vmscope::prelude::*;
///
/// let host = RecordingHost::new();
/// let mut engine = Engine::new(EngineConfig::for_ram(16 << 20), host.clone())?;
///
/// {
///     let mut guard = engine.pause_for_mutation();
///     assert!(guard.enable_taint());
///     assert_eq!(guard.tainted_bytes()?, 0);
/// }
///
/// assert_eq!(
///     host.events(),
///     vec![HostEvent::StopVm, HostEvent::Flush(FlushScope::All), HostEvent::StartVm]
/// );
/// # Ok::<(), vmscope::Error>(())
/// ```
pub struct PauseGuard<'a> {
    engine: &'a mut Engine,
    token: MutationToken,
}

impl<'a> PauseGuard<'a> {
    pub(crate) fn new(engine: &'a mut Engine) -> Self {
        engine.host.stop_vm();
        debug!("guest paused");
        PauseGuard {
            engine,
            token: MutationToken::new(),
        }
    }

    /// The paused engine.
    pub fn engine(&mut self) -> &mut Engine {
        self.engine
    }

    /// Token for the structural [`crate::taint::TaintStore`] operations.
    #[must_use]
    pub fn token(&self) -> &MutationToken {
        &self.token
    }

    /// Enables taint tracking and flushes all translated code, which lacks taint checks.
    ///
    /// # Returns
    ///
    /// `false` if tracking was already enabled.
    pub fn enable_taint(&mut self) -> bool {
        if !self.engine.taint.enable(&self.token) {
            return false;
        }
        self.engine.host.flush_translation_cache(FlushScope::All);
        true
    }

    /// Disables taint tracking, releasing every node, and flushes all translated code.
    ///
    /// # Returns
    ///
    /// `false` if tracking was already disabled.
    pub fn disable_taint(&mut self) -> bool {
        if !self.engine.taint.disable(&self.token) {
            return false;
        }
        self.engine.host.flush_translation_cache(FlushScope::All);
        true
    }

    /// Returns all-zero leaves and empty middle nodes to their pools.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::TaintDisabled`] while tracking is disabled.
    pub fn collect_taint_garbage(&mut self) -> Result<GcReport> {
        self.engine.taint.collect(&self.token)
    }

    /// Counts tainted bytes of guest physical memory.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::TaintDisabled`] while tracking is disabled.
    pub fn tainted_bytes(&self) -> Result<u64> {
        self.engine.taint.tainted_bytes(&self.token)
    }

    /// Replaces the taint propagation policy.
    ///
    /// Changing either pointer flag flushes all translated code, since the translator
    /// emits pointer propagation inline.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::TaintDisabled`] while tracking is disabled.
    pub fn set_taint_policy(&mut self, policy: TaintPolicy) -> Result<()> {
        let previous = self.engine.taint.policy();
        self.engine.taint.set_policy(&self.token, policy)?;

        let pointers = TaintPolicy::LOAD_POINTERS | TaintPolicy::STORE_POINTERS;
        if (previous ^ policy).intersects(pointers) {
            self.engine.host.flush_translation_cache(FlushScope::All);
        }
        debug!(?previous, ?policy, "taint policy changed");
        Ok(())
    }
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.engine.host.start_vm();
        debug!("guest resumed");
    }
}
