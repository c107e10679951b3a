//! Query builder & field describer (C1, spec §4.1).
//!
//! Takes a parsed query (fields, from-object, optional where/order-by/limit),
//! an external-id declaration, and a field-selection pattern, and produces a
//! fully expanded [`ObjectDescriptor`] plus a list of non-fatal warnings.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::MigrateError;
use crate::model::{ComplexField, CompositeExternalId, FieldDescriptor, ObjectDescriptor, ObjectTable, Operation};

/// Matches the `Field$ParentObject` pinning syntax spec §9 names for
/// polymorphic lookups (e.g. `WhatId$Opportunity`): pins which of a
/// polymorphic field's several candidate parent objects the resolver
/// should prefer, without the describer needing a full query-grammar
/// parser for what is otherwise a plain field reference.
static POLYMORPHIC_HINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<field>[A-Za-z_][A-Za-z0-9_]*)\$(?P<object>[A-Za-z_][A-Za-z0-9_]*)$").unwrap());

/// Split a requested query field into its base name and an optional pinned
/// polymorphic parent object, per the `Field$ParentObject` syntax.
fn split_polymorphic_hint(requested: &str) -> (&str, Option<&str>) {
    match POLYMORPHIC_HINT.captures(requested) {
        Some(caps) => {
            let field = caps.name("field").unwrap().as_str();
            let object = caps.name("object").unwrap().as_str();
            (field, Some(object))
        }
        None => (requested, None),
    }
}

/// Reorder a polymorphic lookup's candidate list so `preferred` is tried
/// first by the resolver (spec §9: "preferring the explicitly-declared
/// polymorphic type when provided via `Field$ParentObject` syntax").
/// No-op for a non-polymorphic field or when `preferred` isn't a declared
/// candidate.
fn with_pinned_candidate(field: &FieldDescriptor, preferred: &str) -> FieldDescriptor {
    if !field.is_polymorphic() {
        return field.clone();
    }
    let mut pinned = field.clone();
    if let Some(pos) = pinned.referenced_objects.iter().position(|o| o.eq_ignore_ascii_case(preferred)) {
        let object = pinned.referenced_objects.remove(pos);
        pinned.referenced_objects.insert(0, object);
    }
    pinned
}

/// A query as produced by the out-of-scope parser: selected fields,
/// from-object, and the optional clauses. This crate only consumes this
/// shape; it never parses SOQL text itself.
#[derive(Debug, Clone)]
pub struct ParsedQuery {
    pub fields: Vec<String>,
    pub from_object: String,
    pub where_clause: Option<String>,
    pub order_by: Option<String>,
    pub limit: Option<u32>,
}

/// A field-selection pattern such as `readonly_true;custom_false;lookup_true`,
/// expanding the `all` pseudo-field to "every described field matching this
/// predicate conjunction".
#[derive(Debug, Clone, Default)]
pub struct FieldPattern {
    readonly: Option<bool>,
    custom: Option<bool>,
    lookup: Option<bool>,
}

impl FieldPattern {
    pub fn parse(pattern: &str) -> Self {
        let mut p = FieldPattern::default();
        for clause in pattern.split(';') {
            let clause = clause.trim();
            let Some((key, value)) = clause.split_once('_') else { continue };
            let value = match value {
                "true" => true,
                "false" => false,
                _ => continue,
            };
            match key {
                "readonly" => p.readonly = Some(value),
                "custom" => p.custom = Some(value),
                "lookup" => p.lookup = Some(value),
                _ => {}
            }
        }
        p
    }

    pub fn matches(&self, field: &FieldDescriptor) -> bool {
        if let Some(want) = self.readonly {
            if field.readonly() != want {
                return false;
            }
        }
        if let Some(want) = self.custom {
            if field.is_custom != want {
                return false;
            }
        }
        if let Some(want) = self.lookup {
            if field.is_lookup != want {
                return false;
            }
        }
        true
    }
}

/// Known Salesforce compound fields and the simple fields they expand to.
fn compound_field_components(name: &str) -> Option<Vec<&'static str>> {
    match name {
        "BillingAddress" => Some(vec![
            "BillingStreet", "BillingCity", "BillingState", "BillingPostalCode",
            "BillingCountry", "BillingLatitude", "BillingLongitude",
        ]),
        "ShippingAddress" => Some(vec![
            "ShippingStreet", "ShippingCity", "ShippingState", "ShippingPostalCode",
            "ShippingCountry", "ShippingLatitude", "ShippingLongitude",
        ]),
        "MailingAddress" => Some(vec![
            "MailingStreet", "MailingCity", "MailingState", "MailingPostalCode",
            "MailingCountry", "MailingLatitude", "MailingLongitude",
        ]),
        "OtherAddress" => Some(vec![
            "OtherStreet", "OtherCity", "OtherState", "OtherPostalCode",
            "OtherCountry", "OtherLatitude", "OtherLongitude",
        ]),
        _ => None,
    }
}

/// Mandatory fields injected per object + operation (spec §4.1's example:
/// "Body, ParentId, Name for attachments on insert").
fn mandatory_fields(object: &str, operation: Operation) -> &'static [&'static str] {
    match (object, operation) {
        ("Attachment", Operation::Insert) => &["Body", "ParentId", "Name"],
        _ => &[],
    }
}

/// Candidate fallback fields tried, in order, when a lookup parent's
/// external id value is empty (spec §4.1).
fn external_id_fallback_chain(parent: &ObjectDescriptor) -> Vec<String> {
    let mut chain = Vec::new();
    if parent.field("Name").is_some() {
        chain.push("Name".to_string());
    }
    for field in &parent.fields {
        if field.is_auto_number {
            chain.push(field.name.clone());
        }
    }
    // any other field not marked nillable stands in as "unique enough"
    for field in &parent.fields {
        if !field.is_nillable && !chain.contains(&field.name) {
            chain.push(field.name.clone());
        }
    }
    chain.push("Id".to_string());
    chain
}

/// Auto-correct a field name against the described field set:
/// case-insensitive exact match first, then Levenshtein-closest (spec §4.1).
pub fn correct_field_name(requested: &str, described: &[FieldDescriptor]) -> Option<String> {
    if let Some(f) = described.iter().find(|f| f.name.eq_ignore_ascii_case(requested)) {
        return Some(f.name.clone());
    }
    described
        .iter()
        .map(|f| (f, strsim::levenshtein(&f.name.to_lowercase(), &requested.to_lowercase())))
        .min_by_key(|(_, dist)| *dist)
        .filter(|(_, dist)| *dist <= 3)
        .map(|(f, _)| f.name.clone())
}

/// Result of describing one object's query: the fully expanded descriptor
/// plus non-fatal warnings (unknown non-external-id fields, dropped).
pub struct DescribeResult {
    pub descriptor: ObjectDescriptor,
    pub warnings: Vec<String>,
}

/// Expand a parsed query against described source/target schema into a
/// fully populated [`ObjectDescriptor`].
pub fn describe_query(
    query: &ParsedQuery,
    external_id_decl: &str,
    pattern: &str,
    source_schema: &ObjectTable,
    target_schema: &ObjectTable,
    operation: Operation,
    excluded_fields: &[String],
) -> Result<DescribeResult, MigrateError> {
    let source = source_schema.get(&query.from_object).ok_or_else(|| {
        MigrateError::schema(format!("object '{}' does not exist on source", query.from_object))
    })?;
    if target_schema.get(&query.from_object).is_none() {
        return Err(MigrateError::schema(format!(
            "object '{}' does not exist on target",
            query.from_object
        )));
    }

    let field_pattern = FieldPattern::parse(pattern);
    let mut warnings = Vec::new();
    let mut selected: Vec<FieldDescriptor> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    let mut push_field = |field: &FieldDescriptor, selected: &mut Vec<FieldDescriptor>, seen: &mut HashSet<String>| {
        if seen.insert(field.name.to_lowercase()) {
            selected.push(field.clone());
        }
    };

    for requested in &query.fields {
        if requested == "all" {
            for field in &source.fields {
                if field_pattern.matches(field) {
                    push_field(field, &mut selected, &mut seen);
                }
            }
            continue;
        }

        if let Some(components) = compound_field_components(requested) {
            for component in components {
                if let Some(field) = source.field(component) {
                    push_field(field, &mut selected, &mut seen);
                } else {
                    warnings.push(format!("compound component '{component}' not described, dropped"));
                }
            }
            continue;
        }

        let (base_name, pinned_object) = split_polymorphic_hint(requested);

        match source.field(base_name) {
            Some(field) => {
                let field = match pinned_object {
                    Some(object) => with_pinned_candidate(field, object),
                    None => field.clone(),
                };
                push_field(&field, &mut selected, &mut seen);
            }
            None => match correct_field_name(base_name, &source.fields) {
                Some(corrected) => {
                    if let Some(field) = source.field(&corrected) {
                        warnings.push(format!("field '{base_name}' auto-corrected to '{corrected}'"));
                        let field = match pinned_object {
                            Some(object) => with_pinned_candidate(field, object),
                            None => field.clone(),
                        };
                        push_field(&field, &mut selected, &mut seen);
                    }
                }
                None => {
                    warnings.push(format!("unknown field '{base_name}' dropped from query"));
                }
            },
        }
    }

    for name in mandatory_fields(&query.from_object, operation) {
        if let Some(field) = source.field(name) {
            push_field(field, &mut selected, &mut seen);
        }
    }

    selected.retain(|f| !excluded_fields.iter().any(|e| e.eq_ignore_ascii_case(&f.name)));

    // Every lookup resolves by id at retrieval time (spec §4.4's four-hop
    // chain), but spec §4.1 also wants the relationship form added to the
    // field list alongside the id form "letting the writer choose" — so for
    // every lookup whose parent has a usable external-id fallback, add a
    // second, complex-path `FieldDescriptor` for `<relationship>.<extId>`.
    let lookups: Vec<FieldDescriptor> = selected.iter().filter(|f| f.is_lookup).cloned().collect();
    for lookup in &lookups {
        for referenced_name in &lookup.referenced_objects {
            if let Some(parent) = source_schema.get(referenced_name) {
                let fallback_chain = external_id_fallback_chain(parent);
                if let Some(ext_field) = fallback_chain.first() {
                    let relationship_path = format!(
                        "{}.{}",
                        lookup.name.strip_suffix("Id").unwrap_or(&lookup.name),
                        ext_field
                    );
                    match ComplexField::parse(&relationship_path) {
                        Ok(path) => {
                            let mut relationship_field = FieldDescriptor::simple(relationship_path, lookup.field_type.clone());
                            relationship_field.complex_path = Some(path);
                            relationship_field.is_createable = false;
                            relationship_field.is_updateable = false;
                            push_field(&relationship_field, &mut selected, &mut seen);
                        }
                        Err(_) => {
                            warnings.push(format!("could not build relationship path for '{}'", lookup.name));
                        }
                    }
                }
            }
        }
    }

    let external_id = if external_id_decl.contains(';') {
        let composite = CompositeExternalId::parse(external_id_decl);
        ComplexField::from_segments(composite.components.clone())
            .map_err(|e| MigrateError::schema(e.to_string()))?
    } else {
        let resolved_name = source
            .field(external_id_decl)
            .map(|f| f.name.clone())
            .or_else(|| correct_field_name(external_id_decl, &source.fields))
            .ok_or_else(|| {
                MigrateError::schema(format!(
                    "declared external id '{external_id_decl}' does not resolve to a field on '{}'",
                    query.from_object
                ))
            })?;
        ComplexField::parse(&resolved_name).map_err(|e| MigrateError::schema(e.to_string()))?
    };

    let descriptor = ObjectDescriptor {
        source_name: query.from_object.clone(),
        target_name: query.from_object.clone(),
        external_id,
        operation,
        fields: selected,
        priority: source.priority,
    };

    Ok(DescribeResult { descriptor, warnings })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldType;

    fn schema_with_account_and_contact() -> ObjectTable {
        let mut table = ObjectTable::new();
        table.insert(ObjectDescriptor {
            source_name: "Account".into(),
            target_name: "Account".into(),
            external_id: ComplexField::parse("Name").unwrap(),
            operation: Operation::Insert,
            fields: vec![
                FieldDescriptor::simple("Name", FieldType::String),
                FieldDescriptor::simple("Industry", FieldType::String),
                FieldDescriptor::lookup("ParentId", "Account"),
            ],
            priority: 0,
        });
        table.insert(ObjectDescriptor {
            source_name: "Contact".into(),
            target_name: "Contact".into(),
            external_id: ComplexField::parse("LastName").unwrap(),
            operation: Operation::Insert,
            fields: vec![
                FieldDescriptor::simple("LastName", FieldType::String),
                FieldDescriptor::lookup("AccountId", "Account"),
            ],
            priority: 1,
        });
        table
    }

    #[test]
    fn all_pseudo_field_expands_to_every_field() {
        let schema = schema_with_account_and_contact();
        let query = ParsedQuery {
            fields: vec!["all".into()],
            from_object: "Account".into(),
            where_clause: None,
            order_by: None,
            limit: None,
        };
        let result = describe_query(&query, "Name", "", &schema, &schema, Operation::Insert, &[]).unwrap();
        // Name, Industry, ParentId (lookup), plus the relationship-form
        // `Parent.Name` spec §4.1 adds alongside every lookup's id form.
        assert_eq!(result.descriptor.fields.len(), 4);
        assert!(result.descriptor.field("Parent.Name").is_some());
    }

    #[test]
    fn unknown_object_is_schema_error() {
        let schema = schema_with_account_and_contact();
        let query = ParsedQuery {
            fields: vec!["Name".into()],
            from_object: "Bogus".into(),
            where_clause: None,
            order_by: None,
            limit: None,
        };
        let result = describe_query(&query, "Name", "", &schema, &schema, Operation::Insert, &[]);
        assert!(result.is_err());
    }

    #[test]
    fn typo_in_field_name_is_autocorrected_with_warning() {
        let schema = schema_with_account_and_contact();
        let query = ParsedQuery {
            fields: vec!["Nmae".into()],
            from_object: "Account".into(),
            where_clause: None,
            order_by: None,
            limit: None,
        };
        let result = describe_query(&query, "Name", "", &schema, &schema, Operation::Insert, &[]).unwrap();
        assert_eq!(result.descriptor.fields[0].name, "Name");
        assert!(result.warnings.iter().any(|w| w.contains("auto-corrected")));
    }

    #[test]
    fn excluded_fields_are_removed() {
        let schema = schema_with_account_and_contact();
        let query = ParsedQuery {
            fields: vec!["all".into()],
            from_object: "Account".into(),
            where_clause: None,
            order_by: None,
            limit: None,
        };
        let result = describe_query(
            &query, "Name", "", &schema, &schema, Operation::Insert, &["Industry".into()],
        ).unwrap();
        assert!(result.descriptor.field("Industry").is_none());
    }

    #[test]
    fn lookup_gets_both_id_form_and_relationship_form() {
        let schema = schema_with_account_and_contact();
        let query = ParsedQuery {
            fields: vec!["LastName".into(), "AccountId".into()],
            from_object: "Contact".into(),
            where_clause: None,
            order_by: None,
            limit: None,
        };
        let result = describe_query(&query, "LastName", "", &schema, &schema, Operation::Insert, &[]).unwrap();
        assert!(result.descriptor.field("AccountId").is_some());
        let relationship = result
            .descriptor
            .field("Account.Name")
            .expect("relationship-form field for AccountId should be added alongside the id form");
        assert!(relationship.complex_path.is_some());
    }

    #[test]
    fn bogus_external_id_is_schema_error() {
        let schema = schema_with_account_and_contact();
        let query = ParsedQuery {
            fields: vec!["Name".into()],
            from_object: "Account".into(),
            where_clause: None,
            order_by: None,
            limit: None,
        };
        let result = describe_query(&query, "TotallyNotAField", "", &schema, &schema, Operation::Insert, &[]);
        assert!(result.is_err());
    }

    #[test]
    fn polymorphic_hint_pins_preferred_candidate_first() {
        let mut schema = schema_with_account_and_contact();
        let mut what_id = FieldDescriptor::lookup("WhatId", "Account");
        what_id.referenced_objects.push("Opportunity".into());
        schema.insert(ObjectDescriptor {
            source_name: "Task".into(),
            target_name: "Task".into(),
            external_id: ComplexField::parse("Subject").unwrap(),
            operation: Operation::Insert,
            fields: vec![FieldDescriptor::simple("Subject", FieldType::String), what_id],
            priority: 2,
        });

        let query = ParsedQuery {
            fields: vec!["WhatId$Opportunity".into()],
            from_object: "Task".into(),
            where_clause: None,
            order_by: None,
            limit: None,
        };
        let result = describe_query(&query, "Subject", "", &schema, &schema, Operation::Insert, &[]).unwrap();
        let field = result.descriptor.field("WhatId").unwrap();
        assert_eq!(field.referenced_objects[0], "Opportunity");
    }

    #[test]
    fn split_polymorphic_hint_leaves_plain_field_names_untouched() {
        assert_eq!(split_polymorphic_hint("AccountId"), ("AccountId", None));
        assert_eq!(split_polymorphic_hint("WhatId$Opportunity"), ("WhatId", Some("Opportunity")));
    }
}
