// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use serde::{Deserialize, Serialize};

use crate::codec::Bind;

/// One write waiting to be flushed.
///
/// Self-contained: it carries everything needed to execute the statement and
/// invalidate caches afterwards, so it can travel through the lazy queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PendingOperation {
    Insert {
        entity: String,
        id: u64,
        /// Every column of the new row.
        bind: Bind,
        snapshot: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_duplicate: Option<Bind>,
    },
    Update {
        entity: String,
        id: u64,
        /// Changed columns only, before and after.
        old: Bind,
        new: Bind,
        source: Vec<u8>,
        snapshot: Vec<u8>,
    },
    Delete {
        entity: String,
        id: u64,
        /// Last known state, used to release unique keys and evict references.
        snapshot: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperationKind {
    Delete,
    Insert,
    Update,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Delete => "delete",
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
        }
    }
}

impl PendingOperation {
    pub fn entity(&self) -> &str {
        match self {
            PendingOperation::Insert { entity, .. }
            | PendingOperation::Update { entity, .. }
            | PendingOperation::Delete { entity, .. } => entity,
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            PendingOperation::Insert { id, .. }
            | PendingOperation::Update { id, .. }
            | PendingOperation::Delete { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            PendingOperation::Insert { .. } => OperationKind::Insert,
            PendingOperation::Update { .. } => OperationKind::Update,
            PendingOperation::Delete { .. } => OperationKind::Delete,
        }
    }
}
