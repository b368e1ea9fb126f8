//! Callback dispatch.
//!
//! Analysis code registers callbacks per [`CallbackKind`]. The translator asks the
//! dispatcher at code generation time whether a block, opcode or event kind needs a call
//! into the dispatcher at all ([`Dispatcher::is_block_begin_needed`] and friends); the
//! emitted code then calls the engine's invoke entry points at run time, which walk the
//! registrations of that kind, most recent first.
//!
//! # Filters
//!
//! Block callbacks can be narrowed to a page (or, opt-in, a single block address) through
//! [`BlockFilter`]; block-end callbacks to a source page, a target page or both. The
//! [`FilterIndex`] keeps a reference count per filter key so that registering and
//! unregistering are exact inverses, and only the 0→1 and 1→0 transitions invalidate
//! translated code.
//!
//! # Example
//!
//! ```rust
//! use vmscope::host::FlushScope;
//! use vmscope::prelude::*;
//!
//! let mut engine = Engine::new(EngineConfig::default(), NullHost)?;
//! let handle = engine.register_block_end(Some(0x40_1000), None, None, |_, _| {})?;
//!
//! assert!(engine.is_block_end_needed(0x40_1ABC, None));
//! assert_eq!(engine.dispatcher().pending_flushes(), vec![FlushScope::Page(0x40_1000)]);
//!
//! engine.unregister(handle)?;
//! assert!(engine.dispatcher().filter_index().is_empty());
//! # Ok::<(), vmscope::Error>(())
//! ```

pub(crate) mod dispatcher;
mod event;
mod filter;
mod kind;
mod opcode;
pub(crate) mod registry;

pub use dispatcher::Dispatcher;
pub use event::{BlockInfo, CallbackEvent, CallbackParams, GuestCpu, MemAccess, TaintAccess};
pub use filter::{CountingSet, FilterIndex, PairIndex};
pub use kind::{BlockFilter, CallbackKind, EnableFlag, TransitionCondition};
pub use opcode::{normalize_opcode, OPCODE_TABLE_SIZE};
pub use registry::{Callback, CallbackHandle};
