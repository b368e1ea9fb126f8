use thiserror::Error;

use crate::{dispatch::CallbackHandle, Gva};

macro_rules! config_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::InvalidConfig {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::InvalidConfig {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Every condition here is local and synchronous: the failing operation made no structural
/// change, and the caller decides how to proceed. The one exception is
/// [`Error::PoolExhausted`], which indicates a sizing mistake in [`crate::TaintConfig`] and
/// aborts the operation that hit it.
///
/// # Error Categories
///
/// ## Registration Errors
/// - [`Error::InvalidHandle`] - Handle was never issued for this kind
/// - [`Error::StaleHandle`] - Handle was already unregistered
/// - [`Error::InvalidOpcodeRange`] - Opcode range is reversed or outside the table
/// - [`Error::UnsupportedFilter`] - Filter class that is not implemented
///
/// ## Taint Errors
/// - [`Error::TaintDisabled`] - Operation requires taint tracking to be enabled
/// - [`Error::PoolExhausted`] - Node pool ran out of nodes
/// - [`Error::InvalidAccessSize`] - Access width other than 1, 2, 4 or 8
/// - [`Error::TranslationFault`] - Guest virtual address has no mapping
/// - [`Error::OutOfBounds`] - Range exceeds a fixed-size buffer
///
/// ## Mark Errors
/// - [`Error::MarkSpanTooLarge`] - More than 64 bytes in a single bitmap
/// - [`Error::NotMarked`] - Payload access on a byte without a mark
///
/// # Examples
///
/// ```rust
/// use vmscope::prelude::*;
///
/// let mut engine = Engine::new(EngineConfig::default(), NullHost)?;
/// let handle = engine.register(CallbackKind::InsnBegin, None, |_, _| {})?;
/// engine.unregister(handle)?;
///
/// match engine.unregister(handle) {
///     Err(Error::StaleHandle(h)) => println!("{h} was already removed"),
///     other => panic!("unexpected {other:?}"),
/// }
/// # Ok::<(), vmscope::Error>(())
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // Registration errors
    /// The handle does not name a registration of its kind.
    ///
    /// Returned when the handle's slot was never allocated, or when the slot holds a
    /// record of a different event kind. No structural change was made.
    #[error("Invalid callback handle - {0}")]
    InvalidHandle(CallbackHandle),

    /// The handle names a registration that has already been removed.
    ///
    /// Unregistering the same handle twice is a logic error in the caller. The slot's
    /// generation counter has moved on, so the stale handle can never alias a newer record.
    #[error("Callback handle is stale - {0}")]
    StaleHandle(CallbackHandle),

    /// The opcode range is reversed or does not fit the opcode dispatch table.
    ///
    /// # Fields
    ///
    /// * `start` - First opcode as passed by the caller
    /// * `end` - Last opcode as passed by the caller
    #[error("Invalid opcode range {start:#x}..={end:#x}")]
    InvalidOpcodeRange {
        /// First opcode of the rejected range
        start: u16,
        /// Last opcode of the rejected range
        end: u16,
    },

    /// The requested filter class is not implemented.
    #[error("Filter class is not supported - {0}")]
    UnsupportedFilter(&'static str),

    // Taint errors
    /// Taint tracking must be enabled for this operation.
    #[error("Taint tracking is disabled")]
    TaintDisabled,

    /// A node pool could not hand out another node.
    ///
    /// Pools are sized from the same RAM size as the root array, so this only happens
    /// when [`crate::TaintConfig::leaf_pool_limit`] caps the pool below what the guest
    /// needs. The tree is left unchanged for the failing access.
    ///
    /// # Fields
    ///
    /// * `pool` - Which pool ran dry
    /// * `capacity` - Number of nodes the pool may hold
    #[error("The {pool} pool is exhausted ({capacity} nodes)")]
    PoolExhausted {
        /// Name of the exhausted pool
        pool: &'static str,
        /// Maximum number of nodes of that pool
        capacity: usize,
    },

    /// Access width other than 1, 2, 4 or 8 bytes.
    #[error("Invalid access size - {0}")]
    InvalidAccessSize(usize),

    /// The guest virtual address is not mapped.
    #[error("No translation for guest virtual address {0:#x}")]
    TranslationFault(Gva),

    /// A range did not fit into a fixed-size buffer.
    #[error("Out of bound access - offset {offset:#x}, length {len}")]
    OutOfBounds {
        /// Start of the rejected range
        offset: usize,
        /// Length of the rejected range
        len: usize,
    },

    // Mark errors
    /// A mark bitmap covers at most 64 bytes.
    #[error("Mark span of {0} bytes exceeds the 64 byte bitmap")]
    MarkSpanTooLarge(usize),

    /// Payloads can only be attached to marked bytes.
    #[error("Address {0:#x} carries no mark")]
    NotMarked(Gva),

    // Ambient errors
    /// The configuration is inconsistent.
    ///
    /// # Fields
    ///
    /// * `message` - What is wrong with the configuration
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Invalid configuration - {file}:{line}: {message}")]
    InvalidConfig {
        /// The message to be printed for the InvalidConfig error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// Failed to lock target.
    ///
    /// The mutex of a [`crate::SharedEngine`] was poisoned by a panicking callback.
    #[error("Failed to lock target")]
    LockError,
}
