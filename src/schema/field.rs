// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Field declarations and the resolved, immutable field layout.
//!
//! A [`FieldDescriptor`] is what callers declare. During registry validation
//! each descriptor is resolved into a [`Field`] (enum codes looked up, nested
//! structs laid out) and assigned a [`WireGroup`]. The codec walks
//! [`FieldLayout::wire_order`], never declaration order, so the encoding only
//! depends on the metadata.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::OrmError;

/// Declared enum or set membership list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumDefinition {
    pub code: String,
    pub values: Vec<String>,
    /// Value given to required fields of freshly created records.
    pub default: String,
}

impl EnumDefinition {
    pub fn new(code: impl Into<String>, values: &[&str]) -> Result<Self, OrmError> {
        let code = code.into();
        let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        let default = values
            .first()
            .cloned()
            .ok_or_else(|| OrmError::Registration(format!("enum {} has no values", code)))?;
        Ok(Self { code, values, default })
    }

    /// 1-based position of `value`, 0 when not a member.
    pub fn index_of(&self, value: &str) -> u64 {
        self.values
            .iter()
            .position(|v| v == value)
            .map(|p| p as u64 + 1)
            .unwrap_or(0)
    }

    pub fn value_at(&self, index: u64) -> Option<&str> {
        if index == 0 {
            return None;
        }
        self.values.get(index as usize - 1).map(String::as_str)
    }
}

/// Declared type of a field.
#[derive(Debug, Clone)]
pub enum FieldType {
    /// Unsigned integer of 8, 16, 32 or 64 bits.
    Uint(u8),
    Int(u8),
    Bool,
    /// Float rounded to the given number of decimal places.
    Float(u8),
    Text,
    Bytes,
    DateTime,
    Date,
    Enum(String),
    Set(String),
    Json,
    Reference(String),
    References(String),
    Struct(Vec<FieldDescriptor>),
}

#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
    pub required: bool,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: false,
            required: false,
        }
    }

    pub fn uint(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Uint(64))
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Int(64))
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Bool)
    }

    pub fn float(name: impl Into<String>, precision: u8) -> Self {
        Self::new(name, FieldType::Float(precision))
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Text)
    }

    pub fn bytes(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Bytes)
    }

    pub fn datetime(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::DateTime)
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Date)
    }

    pub fn enumeration(name: impl Into<String>, enum_code: impl Into<String>) -> Self {
        Self::new(name, FieldType::Enum(enum_code.into()))
    }

    pub fn set(name: impl Into<String>, enum_code: impl Into<String>) -> Self {
        Self::new(name, FieldType::Set(enum_code.into()))
    }

    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Json)
    }

    pub fn reference(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, FieldType::Reference(target.into()))
    }

    pub fn references(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, FieldType::References(target.into()))
    }

    pub fn structure(name: impl Into<String>, fields: Vec<FieldDescriptor>) -> Self {
        Self::new(name, FieldType::Struct(fields))
    }

    /// Change the integer size class (8, 16, 32 or 64 bits).
    pub fn bits(mut self, bits: u8) -> Self {
        match &mut self.field_type {
            FieldType::Uint(b) | FieldType::Int(b) => *b = bits,
            _ => {}
        }
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Resolved type of a field.
#[derive(Debug, Clone)]
pub enum FieldKind {
    Uint { bits: u8 },
    Int { bits: u8 },
    Bool,
    Float { precision: u8 },
    Text,
    Bytes,
    DateTime,
    Date,
    Enum(Arc<EnumDefinition>),
    Set(Arc<EnumDefinition>),
    Json,
    Reference { target: String },
    References { target: String },
    Struct(Arc<FieldLayout>),
}

/// Encoding category. The derived ordering is the order groups appear on
/// the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WireGroup {
    Reference,
    Uint,
    Int,
    Bool,
    Float,
    DateTime,
    Date,
    Text,
    NullableUint,
    NullableInt,
    Enum,
    Bytes,
    Set,
    NullableBool,
    NullableFloat,
    NullableDateTime,
    NullableDate,
    Json,
    References,
    Struct,
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    /// Storage column; nested struct fields are prefixed with the parent name.
    pub column: String,
    pub kind: FieldKind,
    pub nullable: bool,
    pub required: bool,
    pub group: WireGroup,
}

impl Field {
    fn resolve(
        descriptor: &FieldDescriptor,
        prefix: &str,
        enums: &HashMap<String, Arc<EnumDefinition>>,
    ) -> Result<Self, OrmError> {
        let column = format!("{}{}", prefix, descriptor.name);
        let lookup_enum = |code: &str| {
            enums.get(code).cloned().ok_or_else(|| {
                OrmError::Registration(format!(
                    "field {} uses unregistered enum {}",
                    descriptor.name, code
                ))
            })
        };
        let kind = match &descriptor.field_type {
            FieldType::Uint(bits) => FieldKind::Uint { bits: check_bits(&descriptor.name, *bits)? },
            FieldType::Int(bits) => FieldKind::Int { bits: check_bits(&descriptor.name, *bits)? },
            FieldType::Bool => FieldKind::Bool,
            FieldType::Float(precision) => FieldKind::Float { precision: *precision },
            FieldType::Text => FieldKind::Text,
            FieldType::Bytes => FieldKind::Bytes,
            FieldType::DateTime => FieldKind::DateTime,
            FieldType::Date => FieldKind::Date,
            FieldType::Enum(code) => FieldKind::Enum(lookup_enum(code)?),
            FieldType::Set(code) => FieldKind::Set(lookup_enum(code)?),
            FieldType::Json => FieldKind::Json,
            FieldType::Reference(target) => FieldKind::Reference { target: target.clone() },
            FieldType::References(target) => FieldKind::References { target: target.clone() },
            FieldType::Struct(fields) => {
                FieldKind::Struct(Arc::new(FieldLayout::build(fields, &column, enums)?))
            }
        };
        let group = match (&kind, descriptor.nullable) {
            (FieldKind::Uint { .. }, false) => WireGroup::Uint,
            (FieldKind::Int { .. }, false) => WireGroup::Int,
            (FieldKind::Bool, false) => WireGroup::Bool,
            (FieldKind::Float { .. }, false) => WireGroup::Float,
            (FieldKind::DateTime, false) => WireGroup::DateTime,
            (FieldKind::Date, false) => WireGroup::Date,
            (FieldKind::Uint { .. }, true) => WireGroup::NullableUint,
            (FieldKind::Int { .. }, true) => WireGroup::NullableInt,
            (FieldKind::Bool, true) => WireGroup::NullableBool,
            (FieldKind::Float { .. }, true) => WireGroup::NullableFloat,
            (FieldKind::DateTime, true) => WireGroup::NullableDateTime,
            (FieldKind::Date, true) => WireGroup::NullableDate,
            // null for these is marked by the presence flag alone
            (FieldKind::Reference { .. }, _) => WireGroup::Reference,
            (FieldKind::Text, _) => WireGroup::Text,
            (FieldKind::Enum(_), _) => WireGroup::Enum,
            (FieldKind::Bytes, _) => WireGroup::Bytes,
            (FieldKind::Set(_), _) => WireGroup::Set,
            (FieldKind::Json, _) => WireGroup::Json,
            (FieldKind::References { .. }, _) => WireGroup::References,
            (FieldKind::Struct(_), false) => WireGroup::Struct,
            (FieldKind::Struct(_), true) => {
                return Err(OrmError::Registration(format!(
                    "struct field {} cannot be nullable",
                    descriptor.name
                )))
            }
        };
        Ok(Self {
            name: descriptor.name.clone(),
            column,
            kind,
            nullable: descriptor.nullable,
            required: descriptor.required,
            group,
        })
    }
}

fn check_bits(name: &str, bits: u8) -> Result<u8, OrmError> {
    match bits {
        8 | 16 | 32 | 64 => Ok(bits),
        _ => Err(OrmError::Registration(format!(
            "field {} has invalid integer size {}",
            name, bits
        ))),
    }
}

/// Immutable field table for one entity (or nested struct).
///
/// Fields are addressed by their stable declaration index; the codec visits
/// them through `wire_order`.
#[derive(Debug, Clone)]
pub struct FieldLayout {
    fields: Vec<Field>,
    wire_order: Vec<usize>,
    by_name: HashMap<String, usize>,
}

impl FieldLayout {
    pub fn build(
        descriptors: &[FieldDescriptor],
        prefix: &str,
        enums: &HashMap<String, Arc<EnumDefinition>>,
    ) -> Result<Self, OrmError> {
        let mut fields = Vec::with_capacity(descriptors.len());
        let mut by_name = HashMap::with_capacity(descriptors.len());
        for (index, descriptor) in descriptors.iter().enumerate() {
            if descriptor.name.eq_ignore_ascii_case("id") {
                return Err(OrmError::Registration("field ID is reserved".into()));
            }
            if by_name.insert(descriptor.name.clone(), index).is_some() {
                return Err(OrmError::Registration(format!(
                    "field {} declared twice",
                    descriptor.name
                )));
            }
            fields.push(Field::resolve(descriptor, prefix, enums)?);
        }
        let mut wire_order: Vec<usize> = (0..fields.len()).collect();
        // sort_by_key is stable: declaration order is kept inside a group
        wire_order.sort_by_key(|&i| fields[i].group);
        Ok(Self { fields, wire_order, by_name })
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> &Field {
        &self.fields[index]
    }

    pub fn wire_order(&self) -> &[usize] {
        &self.wire_order
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Storage columns in declaration order, nested structs flattened.
    pub fn columns(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut Vec<String>) {
        for field in &self.fields {
            match &field.kind {
                FieldKind::Struct(layout) => layout.collect_columns(out),
                _ => out.push(field.column.clone()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enums() -> HashMap<String, Arc<EnumDefinition>> {
        let mut map = HashMap::new();
        map.insert(
            "color".to_string(),
            Arc::new(EnumDefinition::new("color", &["red", "green"]).unwrap()),
        );
        map
    }

    #[test]
    fn test_wire_order_groups_ignore_declaration_order() {
        let layout = FieldLayout::build(
            &[
                FieldDescriptor::text("Name"),
                FieldDescriptor::uint("Age").nullable(),
                FieldDescriptor::reference("Owner", "User"),
                FieldDescriptor::uint("Score"),
            ],
            "",
            &enums(),
        )
        .unwrap();

        let order: Vec<&str> = layout
            .wire_order()
            .iter()
            .map(|&i| layout.field(i).name.as_str())
            .collect();
        assert_eq!(order, vec!["Owner", "Score", "Name", "Age"]);
    }

    #[test]
    fn test_struct_columns_are_prefixed() {
        let layout = FieldLayout::build(
            &[
                FieldDescriptor::text("Name"),
                FieldDescriptor::structure(
                    "Address",
                    vec![FieldDescriptor::text("City"), FieldDescriptor::uint("Zip")],
                ),
            ],
            "",
            &enums(),
        )
        .unwrap();
        assert_eq!(layout.columns(), vec!["Name", "AddressCity", "AddressZip"]);
    }

    #[test]
    fn test_unknown_enum_is_registration_error() {
        let result = FieldLayout::build(&[FieldDescriptor::enumeration("Size", "size")], "", &enums());
        assert!(matches!(result, Err(OrmError::Registration(_))));
    }

    #[test]
    fn test_nullable_text_and_reference_keep_their_groups() {
        let layout = FieldLayout::build(
            &[
                FieldDescriptor::text("Email").nullable(),
                FieldDescriptor::reference("Owner", "User").nullable(),
                FieldDescriptor::enumeration("Color", "color").nullable(),
            ],
            "",
            &enums(),
        )
        .unwrap();
        assert_eq!(layout.field(0).group, WireGroup::Text);
        assert!(layout.field(0).nullable);
        assert_eq!(layout.field(1).group, WireGroup::Reference);
        assert_eq!(layout.field(2).group, WireGroup::Enum);
    }

    #[test]
    fn test_nullable_struct_rejected() {
        let result = FieldLayout::build(
            &[FieldDescriptor::structure("Address", vec![FieldDescriptor::text("City")]).nullable()],
            "",
            &enums(),
        );
        assert!(matches!(result, Err(OrmError::Registration(_))));
    }

    #[test]
    fn test_enum_indexes_are_one_based() {
        let def = EnumDefinition::new("color", &["red", "green"]).unwrap();
        assert_eq!(def.index_of("red"), 1);
        assert_eq!(def.index_of("blue"), 0);
        assert_eq!(def.value_at(2), Some("green"));
        assert_eq!(def.value_at(0), None);
        assert_eq!(def.default, "red");
    }
}
