// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write path: dirty tracking and statement execution.
//!
//! ```text
//! Record edits ──► DirtyTracker ──► PendingOperation[] ──┬─► executor (sync / transaction)
//!                                                        └─► lazy queue ─► consumer ─► executor
//! ```

pub(crate) mod executor;
pub mod operation;
pub mod tracker;

pub use operation::{OperationKind, PendingOperation};
pub use tracker::DirtyTracker;
