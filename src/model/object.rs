//! `ObjectDescriptor` / `FieldDescriptor`: the described-schema half of the
//! data model (spec §3). Cross-references between objects are held as
//! names/indices into an [`ObjectTable`], never as owning pointers, so the
//! (legitimately cyclic, e.g. Account ↔ Contact) object graph never forms
//! a reference cycle in memory.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::model::complex_field::ComplexField;

/// The operation declared for an object in the migration script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Insert,
    Update,
    Upsert,
    Delete,
    Readonly,
}

impl Operation {
    /// Readonly objects are queried (to satisfy relationship closure) but
    /// never written.
    pub fn is_write(self) -> bool {
        !matches!(self, Operation::Readonly)
    }
}

/// Field data types as reported by the target/source schema describe call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    String,
    TextArea,
    Int,
    Double,
    Currency,
    Boolean,
    Date,
    DateTime,
    Id,
    Reference,
    Picklist,
    MultiPicklist,
    Email,
    Phone,
    Url,
    Other(String),
}

/// One field on an [`ObjectDescriptor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
    /// Whether this field's value is itself a [`ComplexField`] path rather
    /// than a plain column (e.g. a composite external id component or a
    /// `$$A$B$extId` phantom column).
    pub complex_path: Option<ComplexField>,
    pub is_lookup: bool,
    /// Candidate target object names for this lookup. More than one entry
    /// means a polymorphic lookup (spec §9); the resolver tries each in
    /// declaration order, preferring one explicitly pinned via the
    /// `Field$ParentObject` query syntax.
    pub referenced_objects: Vec<String>,
    pub is_master_detail: bool,
    pub is_auto_number: bool,
    pub is_createable: bool,
    pub is_updateable: bool,
    pub is_nillable: bool,
    pub is_custom: bool,
}

impl FieldDescriptor {
    pub fn simple(name: impl Into<String>, field_type: FieldType) -> Self {
        FieldDescriptor {
            name: name.into(),
            field_type,
            complex_path: None,
            is_lookup: false,
            referenced_objects: Vec::new(),
            is_master_detail: false,
            is_auto_number: false,
            is_createable: true,
            is_updateable: true,
            is_nillable: true,
            is_custom: false,
        }
    }

    pub fn lookup(name: impl Into<String>, referenced_object: impl Into<String>) -> Self {
        FieldDescriptor {
            name: name.into(),
            field_type: FieldType::Reference,
            complex_path: None,
            is_lookup: true,
            referenced_objects: vec![referenced_object.into()],
            is_master_detail: false,
            is_auto_number: false,
            is_createable: true,
            is_updateable: true,
            is_nillable: true,
            is_custom: false,
        }
    }

    pub fn is_polymorphic(&self) -> bool {
        self.referenced_objects.len() > 1
    }

    pub fn readonly(&self) -> bool {
        !self.is_createable && !self.is_updateable
    }
}

/// A described object, bound to both its source and target metadata (the
/// target may be a rename via field-mapping).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    pub source_name: String,
    pub target_name: String,
    /// The field (simple or composite) that uniquely identifies a record
    /// across organizations.
    pub external_id: ComplexField,
    pub operation: Operation,
    pub fields: Vec<FieldDescriptor>,
    /// Priority used by the task graph builder's smart-mode ordering
    /// (spec §4.2); lower sorts earlier.
    pub priority: u32,
}

impl ObjectDescriptor {
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }

    pub fn lookup_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.is_lookup)
    }

    /// Invariant (spec §3): every field referenced in the parsed query
    /// either exists in the metadata, or is a complex-field expansion
    /// component (already represented via `complex_path`, not a bare name).
    pub fn validate_query_fields(&self, queried: &[String]) -> Result<(), String> {
        for name in queried {
            if name == "all" {
                continue;
            }
            if ComplexField::parse(name).map(|p| !p.is_simple()).unwrap_or(false) {
                continue;
            }
            if self.field(name).is_none() {
                return Err(format!(
                    "field '{name}' is not described on object '{}'",
                    self.source_name
                ));
            }
        }
        Ok(())
    }
}

/// An indexed table of described objects. Cross-references (a lookup
/// field's `referenced_objects`) are resolved by name lookup through this
/// table rather than stored as owning references, per spec §9.
#[derive(Debug, Clone, Default)]
pub struct ObjectTable {
    objects: Vec<ObjectDescriptor>,
    by_name: HashMap<String, usize>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, descriptor: ObjectDescriptor) {
        let idx = self.objects.len();
        self.by_name.insert(descriptor.source_name.clone(), idx);
        self.objects.push(descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&ObjectDescriptor> {
        self.by_name.get(name).map(|&i| &self.objects[i])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ObjectDescriptor> {
        if let Some(&i) = self.by_name.get(name) {
            Some(&mut self.objects[i])
        } else {
            None
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectDescriptor> {
        self.objects.iter()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// All referencing fields across the whole table whose
    /// `referenced_objects` contains `target`: the `childReferencingFields`
    /// back-reference from spec §3, computed on demand rather than stored,
    /// so it can never become a stale owning link.
    pub fn child_referencing_fields(&self, target: &str) -> Vec<(&str, &FieldDescriptor)> {
        let mut out = Vec::new();
        for obj in &self.objects {
            for field in obj.lookup_fields() {
                if field.referenced_objects.iter().any(|r| r == target) {
                    out.push((obj.source_name.as_str(), field));
                }
            }
        }
        out
    }
}
