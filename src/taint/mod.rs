//! Byte-granular taint memory.
//!
//! Every byte of guest physical memory has an 8-bit taint tag. The tags live in a sparse
//! two-level radix tree: a root array of middle nodes, each holding leaf indices, each leaf
//! holding one taint byte per guest byte of its range. A missing node means "never
//! tainted", so a guest that touches little tainted data costs little memory.
//!
//! # Lifecycle
//!
//! The tree exists only while tracking is enabled. Enabling, disabling, garbage
//! collection and byte accounting run under a [`crate::PauseGuard`], because translated
//! code generated before the change may still hold on to tree state.
//!
//! # Reclamation
//!
//! Clearing taint never frees a node on the write path. Leaves that became all-zero are
//! returned to the [`NodePool`] by the next garbage collection sweep, which runs every
//! [`crate::TaintConfig::gc_interval`] stores at a safe point, or on request.
//!
//! # Example
//!
//! ```rust
//! use vmscope::prelude::*;
//!
//! let mut engine = Engine::new(EngineConfig::for_ram(64 << 20), NullHost)?;
//! engine.enable_taint();
//!
//! engine.taint_range(0x2000, &[0xFF; 16])?;
//! assert!(engine.taint().is_page_tainted(0x2000));
//! assert_eq!(engine.tainted_bytes()?, 16);
//!
//! engine.taint_range(0x2000, &[0; 16])?;
//! let report = engine.collect_taint_garbage()?;
//! assert_eq!(report.leaves_freed, 1);
//! # Ok::<(), vmscope::Error>(())
//! ```

mod layout;
mod nic;
mod pool;
mod stats;
mod store;
mod tree;
mod value;

pub use layout::TaintLayout;
pub use nic::{NicTaintBuffer, NIC_BUFFER_SIZE};
pub use pool::{LeafNode, MiddleNode, NodePool, PoolNode};
pub use stats::{GcReport, TaintUsage};
pub use store::{StoreOutcome, TaintPolicy, TaintStore};
pub use tree::WriteOutcome;
pub use value::{AccessSize, TaintBytes, TaintValue};
