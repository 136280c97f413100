// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record instances.
//!
//! A record is either materialized (decoded values present) or lazy (only
//! the raw snapshot is held). Lazy records decode on first full access;
//! [`Record::get_lazy`] reads one field straight from the snapshot.

use std::sync::{Arc, OnceLock};

use crate::codec::{self, Bind, Value};
use crate::error::OrmError;
use crate::schema::{EntityMetadata, FieldKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Not yet persisted.
    New,
    /// Hydrated from storage or cache.
    Loaded,
    /// Flagged for removal in the owning context.
    Deleted,
}

#[derive(Debug, Clone)]
pub struct Record {
    meta: Arc<EntityMetadata>,
    id: u64,
    state: RecordState,
    values: OnceLock<Vec<Value>>,
    raw: Option<Arc<[u8]>>,
    on_duplicate_key_update: Option<Bind>,
}

impl Record {
    /// Fresh record with zero values; required enums and sets get their default.
    pub(crate) fn new(meta: Arc<EntityMetadata>, id: u64) -> Self {
        let mut values = codec::default_values(&meta.layout);
        for (index, field) in meta.layout.fields().iter().enumerate() {
            if !field.required {
                continue;
            }
            match &field.kind {
                FieldKind::Enum(def) => values[index] = Value::Enum(def.default.clone()),
                FieldKind::Set(def) => values[index] = Value::Set(vec![def.default.clone()]),
                _ => {}
            }
        }
        Self::with_values(meta, id, values, RecordState::New)
    }

    pub(crate) fn loaded(meta: Arc<EntityMetadata>, id: u64, values: Vec<Value>) -> Self {
        Self::with_values(meta, id, values, RecordState::Loaded)
    }

    fn with_values(meta: Arc<EntityMetadata>, id: u64, values: Vec<Value>, state: RecordState) -> Self {
        Self {
            meta,
            id,
            state,
            values: OnceLock::from(values),
            raw: None,
            on_duplicate_key_update: None,
        }
    }

    /// Loaded record backed only by snapshot bytes.
    pub(crate) fn lazy(meta: Arc<EntityMetadata>, id: u64, snapshot: Arc<[u8]>) -> Self {
        Self {
            meta,
            id,
            state: RecordState::Loaded,
            values: OnceLock::new(),
            raw: Some(snapshot),
            on_duplicate_key_update: None,
        }
    }

    /// Eagerly decoded record built from a snapshot.
    pub(crate) fn from_snapshot(meta: Arc<EntityMetadata>, id: u64, snapshot: &[u8]) -> Result<Self, OrmError> {
        let values = codec::decode(&meta.layout, snapshot)?;
        Ok(Self::loaded(meta, id, values))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn entity(&self) -> &str {
        &self.meta.name
    }

    pub fn metadata(&self) -> &Arc<EntityMetadata> {
        &self.meta
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: RecordState) {
        self.state = state;
    }

    pub fn is_new(&self) -> bool {
        self.state == RecordState::New
    }

    /// True while only the raw snapshot is held.
    pub fn is_lazy(&self) -> bool {
        self.values.get().is_none()
    }

    /// All values by declaration index, decoding a lazy record on first use.
    pub fn values(&self) -> Result<&[Value], OrmError> {
        if let Some(values) = self.values.get() {
            return Ok(values);
        }
        let raw = self
            .raw
            .as_ref()
            .ok_or_else(|| OrmError::Validation(format!("{} #{} holds no data", self.meta.name, self.id)))?;
        let decoded = codec::decode(&self.meta.layout, raw)?;
        Ok(self.values.get_or_init(|| decoded))
    }

    fn field_index(&self, name: &str) -> Result<usize, OrmError> {
        self.meta
            .layout
            .index_of(name)
            .ok_or_else(|| OrmError::Validation(format!("{} has no field {}", self.meta.name, name)))
    }

    pub fn get(&self, field: &str) -> Result<&Value, OrmError> {
        let index = self.field_index(field)?;
        Ok(&self.values()?[index])
    }

    /// Read one field without materializing a lazy record.
    pub fn get_lazy(&self, field: &str) -> Result<Value, OrmError> {
        let index = self.field_index(field)?;
        match (self.values.get(), &self.raw) {
            (Some(values), _) => Ok(values[index].clone()),
            (None, Some(raw)) => Ok(codec::decode_field(&self.meta.layout, raw, index)?),
            (None, None) => Err(OrmError::Validation(format!("{} #{} holds no data", self.meta.name, self.id))),
        }
    }

    /// Decode a lazy record in place.
    pub fn materialize(&mut self) -> Result<(), OrmError> {
        self.values()?;
        self.raw = None;
        Ok(())
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<(), OrmError> {
        let index = self.field_index(field)?;
        let normalized = codec::normalize(self.meta.layout.field(index), value.into())?;
        self.materialize()?;
        if let Some(values) = self.values.get_mut() {
            values[index] = normalized;
        }
        Ok(())
    }

    /// Columns to overwrite when an insert collides with an existing row.
    pub fn set_on_duplicate_key_update(&mut self, bind: Bind) {
        self.on_duplicate_key_update = Some(bind);
    }

    pub fn on_duplicate_key_update(&self) -> Option<&Bind> {
        self.on_duplicate_key_update.as_ref()
    }

    /// Current field state in wire form.
    pub fn snapshot(&self) -> Result<Vec<u8>, OrmError> {
        if let (None, Some(raw)) = (self.values.get(), &self.raw) {
            return Ok(raw.to_vec());
        }
        Ok(codec::encode(&self.meta.layout, self.values()?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntitySchema, EnumDefinition, FieldDescriptor};
    use std::collections::HashMap;

    fn meta() -> Arc<EntityMetadata> {
        let mut enums = HashMap::new();
        enums.insert(
            "status".to_string(),
            Arc::new(EnumDefinition::new("status", &["active", "banned"]).unwrap()),
        );
        let schema = EntitySchema::new("User")
            .field(FieldDescriptor::text("Name"))
            .field(FieldDescriptor::uint("Age"))
            .field(FieldDescriptor::enumeration("Status", "status").required())
            .field(FieldDescriptor::enumeration("Mood", "status"));
        Arc::new(EntityMetadata::build(&schema, &enums).unwrap())
    }

    #[test]
    fn test_new_record_gets_required_enum_default() {
        let record = Record::new(meta(), 1);
        assert_eq!(record.get("Status").unwrap(), &Value::Enum("active".into()));
        assert_eq!(record.get("Mood").unwrap(), &Value::Null);
        assert!(record.is_new());
    }

    #[test]
    fn test_set_normalizes_and_validates() {
        let mut record = Record::new(meta(), 1);
        record.set("Age", 18i64).unwrap();
        assert_eq!(record.get("Age").unwrap(), &Value::Uint(18));
        assert!(record.set("Status", "unknown").is_err());
        assert!(record.set("Missing", 1u64).is_err());
        assert!(record.set("Age", "eighteen").is_err());
    }

    #[test]
    fn test_lazy_record_reads_single_field() {
        let meta = meta();
        let mut source = Record::new(meta.clone(), 5);
        source.set("Name", "John").unwrap();
        let snapshot: Arc<[u8]> = source.snapshot().unwrap().into();

        let lazy = Record::lazy(meta, 5, snapshot.clone());
        assert!(lazy.is_lazy());
        assert_eq!(lazy.get_lazy("Name").unwrap(), Value::from("John"));
        assert!(lazy.is_lazy());
        assert_eq!(lazy.snapshot().unwrap(), snapshot.to_vec());

        assert_eq!(lazy.get("Name").unwrap(), &Value::from("John"));
        assert!(!lazy.is_lazy());
    }

    #[test]
    fn test_corrupt_lazy_snapshot_surfaces_error() {
        let lazy = Record::lazy(meta(), 1, Arc::from(&b"\x01"[..]));
        assert!(matches!(lazy.get("Name"), Err(OrmError::Codec(_))));
    }
}
