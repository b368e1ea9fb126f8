//! # vmscope Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the vmscope library. Import this module to get quick access to the engine, the
//! registration API and the types callbacks receive.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all vmscope operations
pub use crate::Error;

/// The result type used throughout vmscope
pub use crate::Result;

/// Guest address types
pub use crate::{Gpa, Gva};

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// The instrumentation core and its pause guard
pub use crate::{Engine, PauseGuard};

/// Engine shared between vCPU threads
pub use crate::SharedEngine;

/// Configuration
pub use crate::{DispatchConfig, EngineConfig, TaintConfig};

// ================================================================================================
// Host Contract
// ================================================================================================

/// Interface implemented by the emulator, plus ready-made hosts
pub use crate::host::{FlushScope, NullHost, RecordingHost, TranslationHost};

// ================================================================================================
// Callback Dispatch
// ================================================================================================

/// Registration API
pub use crate::dispatch::{
    BlockFilter, CallbackHandle, CallbackKind, EnableFlag, TransitionCondition,
};

/// Payloads delivered to callbacks
pub use crate::dispatch::{
    BlockInfo, CallbackEvent, CallbackParams, GuestCpu, MemAccess, TaintAccess,
};

// ================================================================================================
// Taint Tracking
// ================================================================================================

/// Access widths and taint values
pub use crate::taint::{AccessSize, TaintBytes, TaintValue};

/// Taint store state and reporting
pub use crate::taint::{GcReport, TaintPolicy, TaintUsage};

// ================================================================================================
// Address Marks
// ================================================================================================

/// Sparse marks over guest virtual memory
pub use crate::marks::MarkIndex;
