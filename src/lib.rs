// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

//! # vmscope
//!
//! The instrumentation core of a whole-system emulator. `vmscope` decides, for every
//! translated block of guest code and every guest memory access, whether analysis code
//! has to run, and it keeps a taint byte for every byte of guest physical memory so that
//! data flow can be observed across loads and stores without touching the emulated
//! program.
//!
//! ## Features
//!
//! - **Callback dispatch** - Per-event registries with LIFO ordering, generation-checked
//!   handles and re-entrancy safe invocation
//! - **Translation filters** - Reference counted indexes answering "does this block need
//!   instrumentation" in O(1) at code generation time
//! - **Taint memory** - Sparse two-level radix tree over guest physical memory with pooled
//!   nodes and deferred garbage collection
//! - **Address marks** - Flat page table of 64-byte entries tagging guest virtual ranges
//!   with 64-bit markers
//!
//! ## Quick Start
//!
//! ```rust
//! use vmscope::prelude::*;
//!
//! let mut engine = Engine::new(EngineConfig::for_ram(16 << 20), NullHost)?;
//!
//! // Instrument every block that starts in page 0x40_1000
//! let handle = engine.register_block_begin(BlockFilter::Page(0x40_1000), None, |_, params| {
//!     if let CallbackEvent::BlockBegin { block, .. } = params.event {
//!         println!("entered block at {:#x}", block.pc);
//!     }
//! })?;
//!
//! assert!(engine.is_block_begin_needed(0x40_1234));
//! assert!(!engine.is_block_begin_needed(0x40_2000));
//!
//! engine.unregister(handle)?;
//! # Ok::<(), vmscope::Error>(())
//! ```
//!
//! ### Taint Tracking
//!
//! ```rust
//! use vmscope::prelude::*;
//!
//! let mut engine = Engine::new(EngineConfig::for_ram(16 << 20), NullHost)?;
//! engine.enable_taint();
//!
//! engine.taint_store(0x1000, 0, AccessSize::Long, 0xFF00_0000)?;
//! assert_eq!(engine.taint_load(0x1000, 0, AccessSize::Byte).bits(), 0x00);
//! assert_eq!(engine.taint_load(0x1003, 0, AccessSize::Byte).bits(), 0xFF);
//! # Ok::<(), vmscope::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`engine`] - The [`Engine`] context owning every store, plus the invoke entry points
//! - [`dispatch`] - Callback registries, the opcode table and the filter index
//! - [`taint`] - Pool allocator and taint memory store
//! - [`marks`] - Address mark index
//! - [`host`] - The contract with the translation engine and the deferred flush queue
//! - [`config`] - Engine, dispatch and taint configuration
//!
//! ## Threading
//!
//! All mutating operations take `&mut Engine`, which makes the single emulation thread
//! assumption visible in the type system. Hosts running several vCPU threads wrap the
//! engine in a [`SharedEngine`].
#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust
/// use vmscope::prelude::*;
///
/// let engine = Engine::new(EngineConfig::default(), NullHost)?;
/// assert!(!engine.is_taint_enabled());
/// # Ok::<(), vmscope::Error>(())
/// ```
pub mod prelude;

/// Engine, dispatch and taint configuration.
pub mod config;

/// The boundary with the translation and execution engine.
///
/// Contains the [`host::TranslationHost`] trait implemented by the emulator, the deferred
/// [`host::FlushQueue`] and a page-table walker for alternate page directories.
pub mod host;

/// Callback registries, the opcode dispatch table and the filter index.
///
/// # Key Types
///
/// - [`dispatch::Dispatcher`] - Registries plus the translation-time "is needed" queries
/// - [`dispatch::CallbackHandle`] - Generation checked identity of one registration
/// - [`dispatch::CallbackEvent`] - Tagged payload delivered to callbacks
/// - [`dispatch::FilterIndex`] - Reference counted address and page filters
pub mod dispatch;

/// Byte-granular taint tracking over guest physical memory.
///
/// # Key Types
///
/// - [`taint::TaintStore`] - Two-level radix tree of taint bytes
/// - [`taint::NodePool`] - Index based pool the tree draws its nodes from
/// - [`taint::TaintValue`] - Taint of one 1, 2, 4 or 8 byte access
pub mod taint;

/// Sparse marks over guest virtual address space.
pub mod marks;

/// The engine context, its pause guard and the invoke entry points.
pub mod engine;

/// Mutex wrapped engine for hosts with several vCPU threads.
pub mod shared;

/// `vmscope` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `vmscope` Error type
///
/// # Examples
///
/// ```rust
/// use vmscope::prelude::*;
///
/// let mut engine = Engine::new(EngineConfig::default(), NullHost)?;
/// match engine.register_opcode_range(0x20, 0x10, TransitionCondition::empty(), |_, _| {}) {
///     Err(Error::InvalidOpcodeRange { start, end }) => println!("rejected {start:#x}..{end:#x}"),
///     Ok(_) => unreachable!(),
///     Err(e) => return Err(e),
/// }
/// # Ok::<(), vmscope::Error>(())
/// ```
pub use error::Error;

/// Guest virtual address.
pub type Gva = u32;

/// Guest physical address.
pub type Gpa = u32;

pub use config::{DispatchConfig, EngineConfig, TaintConfig};
pub use engine::{Engine, PauseGuard};
pub use shared::SharedEngine;
