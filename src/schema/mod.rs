// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity schemas and their validated metadata.
//!
//! Entities are declared as [`EntitySchema`] values with explicit field
//! descriptors, registered on a [`Registry`], and turned into immutable
//! [`EntityMetadata`] by [`Registry::validate`]. Field values are addressed
//! by their stable declaration index; the wire order is derived once per
//! layout.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tiered_orm::schema::{EntitySchema, FieldDescriptor, Registry};
//! use tiered_orm::storage::InMemoryPool;
//!
//! let mut registry = Registry::new();
//! registry.register_storage_pool(Arc::new(InMemoryPool::new("default")));
//! registry.register_enum("status", &["active", "banned"]).unwrap();
//! registry.register_entity(
//!     EntitySchema::new("User")
//!         .field(FieldDescriptor::text("Email"))
//!         .field(FieldDescriptor::enumeration("Status", "status").required())
//!         .field(FieldDescriptor::uint("Age").bits(8))
//!         .unique("Email", &["Email"])
//!         .local_cache(10_000),
//! );
//! let engine = registry.validate().unwrap();
//! assert_eq!(engine.metadata("User").unwrap().columns(), ["Email", "Status", "Age"]);
//! ```

mod entity;
mod field;
mod registry;

pub use entity::{
    EntityMetadata, EntitySchema, ReferenceDefinition, UniqueIndex, ALL_REFERENCE, DEFAULT_POOL,
};
pub use field::{EnumDefinition, Field, FieldDescriptor, FieldKind, FieldLayout, FieldType, WireGroup};
pub use registry::Registry;
