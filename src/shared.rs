use std::sync::{Arc, Mutex};

use crate::{Engine, Error, Result};

/// An [`Engine`] shared between vCPU threads.
///
/// One mutex guards the whole core. Hot-path calls hold it for the duration of a single
/// invoke or taint access; clones share the same engine.
///
/// # Example
///
/// ```rust
/// use std::thread;
/// use vmscope::prelude::*;
///
/// let shared = SharedEngine::new(Engine::new(EngineConfig::for_ram(16 << 20), NullHost)?);
/// shared.with(|engine| engine.enable_taint())?;
///
/// let workers: Vec<_> = (0..4u32)
///     .map(|cpu| {
///         let shared = shared.clone();
///         thread::spawn(move || {
///             shared.with(|engine| engine.taint_store(cpu * 8, 0, AccessSize::Quad, u64::MAX))
///         })
///     })
///     .collect();
/// for worker in workers {
///     worker.join().unwrap()??;
/// }
///
/// assert_eq!(shared.with(|engine| engine.tainted_bytes())??, 32);
/// # Ok::<(), vmscope::Error>(())
/// ```
#[derive(Clone)]
pub struct SharedEngine {
    inner: Arc<Mutex<Engine>>,
}

impl SharedEngine {
    /// Wraps `engine`.
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        SharedEngine {
            inner: Arc::new(Mutex::new(engine)),
        }
    }

    /// Runs `f` with exclusive access to the engine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if another thread panicked while holding the engine.
    pub fn with<R>(&self, f: impl FnOnce(&mut Engine) -> R) -> Result<R> {
        let mut engine = self.inner.lock().map_err(|_| Error::LockError)?;
        Ok(f(&mut engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dispatch::CallbackKind, host::NullHost, EngineConfig};

    #[test]
    fn clones_share_the_engine() {
        let shared = SharedEngine::new(Engine::new(EngineConfig::default(), NullHost).unwrap());
        let other = shared.clone();

        other
            .with(|engine| engine.register(CallbackKind::InsnBegin, None, |_, _| {}))
            .unwrap()
            .unwrap();
        assert!(shared
            .with(|engine| engine.is_callback_needed(CallbackKind::InsnBegin))
            .unwrap());
    }

    #[test]
    fn poisoned_lock_is_reported() {
        let shared = SharedEngine::new(Engine::new(EngineConfig::default(), NullHost).unwrap());
        let other = shared.clone();
        let _ = std::thread::spawn(move || {
            other.with(|_| panic!("vCPU thread died")).unwrap();
        })
        .join();

        assert!(matches!(shared.with(|_| ()), Err(Error::LockError)));
    }
}
