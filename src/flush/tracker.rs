// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-context dirty tracking.
//!
//! New records are inserted with their state at flush time. Loaded records
//! keep the snapshot taken when they were tracked; at flush time the current
//! state is re-encoded and compared against it, and only differing columns
//! are written.

use std::collections::HashMap;

use super::operation::PendingOperation;
use crate::codec::{self, Bind, Value};
use crate::error::OrmError;
use crate::record::{Record, RecordState};
use crate::schema::FieldKind;

struct TrackedRecord {
    record: Record,
    /// Snapshot at track time; `None` for records not yet persisted.
    source: Option<Vec<u8>>,
}

#[derive(Default)]
pub struct DirtyTracker {
    entries: Vec<TrackedRecord>,
    index: HashMap<(String, u64), usize>,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `record`. A second call for the same entity and id keeps the
    /// entry tracked first and returns it.
    pub fn track(&mut self, record: Record) -> Result<&mut Record, OrmError> {
        let key = (record.entity().to_string(), record.id());
        let position = match self.index.get(&key) {
            Some(position) => *position,
            None => {
                let source = match record.state() {
                    RecordState::New => None,
                    _ => Some(record.snapshot()?),
                };
                self.entries.push(TrackedRecord { record, source });
                self.index.insert(key, self.entries.len() - 1);
                self.entries.len() - 1
            }
        };
        Ok(&mut self.entries[position].record)
    }

    pub fn mark_deleted(&mut self, record: Record) -> Result<(), OrmError> {
        let tracked = self.track(record)?;
        tracked.set_state(RecordState::Deleted);
        Ok(())
    }

    pub fn get(&self, entity: &str, id: u64) -> Option<&Record> {
        let position = self.index.get(&(entity.to_string(), id))?;
        Some(&self.entries[*position].record)
    }

    pub fn get_mut(&mut self, entity: &str, id: u64) -> Option<&mut Record> {
        let position = self.index.get(&(entity.to_string(), id))?;
        Some(&mut self.entries[*position].record)
    }

    /// Tracked records in tracking order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.entries.iter().map(|tracked| &tracked.record)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    /// `(old, new, dirty)` for a tracked record.
    ///
    /// New records report their full bind, deleted ones their last known
    /// columns; loaded records report only the columns that changed.
    pub fn is_dirty(&self, entity: &str, id: u64, offset: i64) -> Result<(Bind, Bind, bool), OrmError> {
        let position = self
            .index
            .get(&(entity.to_string(), id))
            .ok_or_else(|| OrmError::Validation(format!("{} #{} is not tracked", entity, id)))?;
        let tracked = &self.entries[*position];
        let layout = &tracked.record.metadata().layout;
        match (tracked.record.state(), &tracked.source) {
            (RecordState::New, _) => {
                let bind = codec::full_bind(layout, tracked.record.values()?, offset)?;
                Ok((Bind::new(), bind, true))
            }
            (RecordState::Deleted, source) => {
                let values = match source {
                    Some(source) => codec::decode(layout, source)?,
                    None => tracked.record.values()?.to_vec(),
                };
                Ok((codec::full_bind(layout, &values, offset)?, Bind::new(), true))
            }
            (RecordState::Loaded, Some(source)) => {
                let current = tracked.record.snapshot()?;
                if &current == source {
                    return Ok((Bind::new(), Bind::new(), false));
                }
                let before = codec::decode(layout, source)?;
                let (old, new) = codec::diff(layout, &before, tracked.record.values()?, offset)?;
                let dirty = !new.is_empty();
                Ok((old, new, dirty))
            }
            (RecordState::Loaded, None) => Ok((Bind::new(), Bind::new(), false)),
        }
    }

    /// Pending operations in tracking order.
    pub fn operations(&self, offset: i64) -> Result<Vec<PendingOperation>, OrmError> {
        let mut operations = Vec::new();
        for tracked in &self.entries {
            let record = &tracked.record;
            let entity = record.entity().to_string();
            let id = record.id();
            match record.state() {
                RecordState::Deleted => {
                    // never persisted: nothing to remove
                    let Some(source) = &tracked.source else { continue };
                    operations.push(PendingOperation::Delete {
                        entity,
                        id,
                        snapshot: source.clone(),
                    });
                }
                RecordState::New => {
                    validate_required(record)?;
                    let bind = codec::full_bind(&record.metadata().layout, record.values()?, offset)?;
                    operations.push(PendingOperation::Insert {
                        entity,
                        id,
                        bind,
                        snapshot: record.snapshot()?,
                        on_duplicate: record.on_duplicate_key_update().cloned(),
                    });
                }
                RecordState::Loaded => {
                    let (old, new, dirty) = self.is_dirty(&entity, id, offset)?;
                    if !dirty {
                        continue;
                    }
                    validate_required(record)?;
                    operations.push(PendingOperation::Update {
                        entity,
                        id,
                        old,
                        new,
                        source: tracked.source.clone().unwrap_or_default(),
                        snapshot: record.snapshot()?,
                    });
                }
            }
        }
        Ok(operations)
    }
}

/// Required enums and sets may not be empty.
fn validate_required(record: &Record) -> Result<(), OrmError> {
    let values = record.values()?;
    for (field, value) in record.metadata().layout.fields().iter().zip(values) {
        if !field.required || !matches!(field.kind, FieldKind::Enum(_) | FieldKind::Set(_)) {
            continue;
        }
        if matches!(value, Value::Null) {
            return Err(OrmError::Validation(format!(
                "{}.{} cannot be empty",
                record.entity(),
                field.name
            )));
        }
    }
    Ok(())
}
