// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::field::{EnumDefinition, FieldDescriptor, FieldKind, FieldLayout};
use crate::error::OrmError;

/// Pool code used when an entity does not name one.
pub const DEFAULT_POOL: &str = "default";

/// Sentinel reference name for the whole-table collection.
pub const ALL_REFERENCE: &str = "_all";

/// Entity declaration, turned into [`EntityMetadata`] by the registry.
#[derive(Debug, Clone)]
pub struct EntitySchema {
    pub name: String,
    pub table: String,
    pub fields: Vec<FieldDescriptor>,
    pub storage_pool: String,
    /// `Some(0)` is an unbounded local cache.
    pub local_cache: Option<usize>,
    pub remote_cache: Option<String>,
    pub unique_indexes: Vec<(String, Vec<String>)>,
    pub cached_references: Vec<String>,
    pub cache_all: bool,
}

impl EntitySchema {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table: name.clone(),
            name,
            fields: Vec::new(),
            storage_pool: DEFAULT_POOL.to_string(),
            local_cache: None,
            remote_cache: None,
            unique_indexes: Vec::new(),
            cached_references: Vec::new(),
            cache_all: false,
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn storage_pool(mut self, code: impl Into<String>) -> Self {
        self.storage_pool = code.into();
        self
    }

    pub fn local_cache(mut self, limit: usize) -> Self {
        self.local_cache = Some(limit);
        self
    }

    pub fn remote_cache(mut self, code: impl Into<String>) -> Self {
        self.remote_cache = Some(code.into());
        self
    }

    pub fn unique(mut self, index: impl Into<String>, columns: &[&str]) -> Self {
        self.unique_indexes
            .push((index.into(), columns.iter().map(|c| c.to_string()).collect()));
        self
    }

    pub fn cached_reference(mut self, field: impl Into<String>) -> Self {
        self.cached_references.push(field.into());
        self
    }

    pub fn cache_all(mut self) -> Self {
        self.cache_all = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct UniqueIndex {
    pub name: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ReferenceDefinition {
    pub name: String,
    pub column: String,
    pub field_index: usize,
    pub target: String,
    pub cached: bool,
}

/// Validated, immutable description of one entity type.
#[derive(Debug)]
pub struct EntityMetadata {
    pub name: String,
    pub table: String,
    pub layout: Arc<FieldLayout>,
    pub storage_pool: String,
    pub local_cache: Option<usize>,
    pub remote_cache: Option<String>,
    pub unique_indexes: Vec<UniqueIndex>,
    pub references: Vec<ReferenceDefinition>,
    pub cache_all: bool,
    /// Remote cache namespace; changes whenever the column layout changes.
    pub cache_key: String,
    columns: Vec<String>,
}

impl EntityMetadata {
    pub(crate) fn build(
        schema: &EntitySchema,
        enums: &HashMap<String, Arc<EnumDefinition>>,
    ) -> Result<Self, OrmError> {
        let layout = Arc::new(FieldLayout::build(&schema.fields, "", enums)?);
        let columns = layout.columns();

        let mut unique_indexes = Vec::with_capacity(schema.unique_indexes.len());
        for (name, index_columns) in &schema.unique_indexes {
            if index_columns.is_empty() {
                return Err(OrmError::Registration(format!(
                    "unique index {} on {} has no columns",
                    name, schema.name
                )));
            }
            for column in index_columns {
                if !columns.contains(column) {
                    return Err(OrmError::Registration(format!(
                        "unique index {} on {} uses unknown column {}",
                        name, schema.name, column
                    )));
                }
            }
            unique_indexes.push(UniqueIndex {
                name: name.clone(),
                columns: index_columns.clone(),
            });
        }

        let mut references = Vec::new();
        for (index, field) in layout.fields().iter().enumerate() {
            if let FieldKind::Reference { target } = &field.kind {
                references.push(ReferenceDefinition {
                    name: field.name.clone(),
                    column: field.column.clone(),
                    field_index: index,
                    target: target.clone(),
                    cached: schema.cached_references.contains(&field.name),
                });
            }
        }
        for cached in &schema.cached_references {
            if !references.iter().any(|r| &r.name == cached) {
                return Err(OrmError::Registration(format!(
                    "cached reference {} on {} is not a reference field",
                    cached, schema.name
                )));
            }
        }

        let mut hasher = Sha256::new();
        hasher.update(schema.table.as_bytes());
        for field in layout.fields() {
            hasher.update(format!("|{}:{:?}:{}", field.column, field.group, field.required).as_bytes());
        }
        let digest = hex::encode(hasher.finalize());
        let cache_key = format!("{}:{}", schema.name, &digest[..8]);

        Ok(Self {
            name: schema.name.clone(),
            table: schema.table.clone(),
            layout,
            storage_pool: schema.storage_pool.clone(),
            local_cache: schema.local_cache,
            remote_cache: schema.remote_cache.clone(),
            unique_indexes,
            references,
            cache_all: schema.cache_all,
            cache_key,
            columns,
        })
    }

    /// Flattened storage columns, excluding `ID`.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn reference(&self, name: &str) -> Option<&ReferenceDefinition> {
        self.references.iter().find(|r| r.name == name)
    }

    pub fn cached_references(&self) -> impl Iterator<Item = &ReferenceDefinition> {
        self.references.iter().filter(|r| r.cached)
    }

    pub fn has_local_cache(&self) -> bool {
        self.local_cache.is_some()
    }
}
