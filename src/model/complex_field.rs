//! `ComplexField`: a dotted lookup-traversal path, e.g. `Account.Owner.Email`,
//! denoting "resolve `Account`, then `Owner`, then read `Email`".
//!
//! Unlike the single-hop `accountid.name` lookup path this type generalizes
//! to arbitrary depth, because a Salesforce external-id declaration may
//! legitimately need to walk several lookup hops to reach the field that
//! uniquely identifies a record (e.g. `ParentAccount.Owner.Username`).
//!
//! Two equivalent representations exist: the dotted form above, and an
//! encoded single-token form used anywhere a complex field must be packed
//! into something that is otherwise a plain identifier — a CSV column
//! header or a stored query string — without being confused for a normal
//! relationship-traversal field reference (which Salesforce also writes
//! with dots, e.g. `Account.Name`). The encoded form is prefixed with `$$`
//! and joins segments with `$` instead of `.`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComplexField {
    segments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComplexFieldError {
    Empty,
    EmptySegment,
    /// A segment contains the `$` encoding delimiter, which would make
    /// `encode(decode(x)) = x` impossible to guarantee.
    ReservedCharacter { segment: String },
}

impl std::fmt::Display for ComplexFieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComplexFieldError::Empty => write!(f, "complex field path cannot be empty"),
            ComplexFieldError::EmptySegment => {
                write!(f, "complex field path contains an empty segment")
            }
            ComplexFieldError::ReservedCharacter { segment } => write!(
                f,
                "segment '{segment}' contains the reserved '$' delimiter"
            ),
        }
    }
}

impl std::error::Error for ComplexFieldError {}

impl ComplexField {
    /// Parse the dotted form, e.g. `"Account.Owner.Email"`.
    pub fn parse(path: &str) -> Result<Self, ComplexFieldError> {
        if path.is_empty() {
            return Err(ComplexFieldError::Empty);
        }
        let segments: Vec<String> = path.split('.').map(|s| s.to_string()).collect();
        Self::from_segments(segments)
    }

    pub fn from_segments(segments: Vec<String>) -> Result<Self, ComplexFieldError> {
        if segments.is_empty() {
            return Err(ComplexFieldError::Empty);
        }
        for s in &segments {
            if s.is_empty() {
                return Err(ComplexFieldError::EmptySegment);
            }
            if s.contains('$') {
                return Err(ComplexFieldError::ReservedCharacter { segment: s.clone() });
            }
        }
        Ok(ComplexField { segments })
    }

    /// Decode the `$$A$B$C` encoded single-token form.
    pub fn decode(token: &str) -> Result<Self, ComplexFieldError> {
        let rest = token.strip_prefix("$$").unwrap_or(token);
        let segments: Vec<String> = rest.split('$').map(|s| s.to_string()).collect();
        Self::from_segments(segments)
    }

    /// Encode to the `$$A$B$C` single-token form.
    pub fn encode(&self) -> String {
        format!("$${}", self.segments.join("$"))
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// All but the last segment: the chain of lookup hops to resolve.
    pub fn lookup_chain(&self) -> &[String] {
        &self.segments[..self.segments.len() - 1]
    }

    /// The final segment: the field to read once the chain is resolved.
    pub fn leaf_field(&self) -> &str {
        self.segments.last().expect("segments is non-empty by construction")
    }

    pub fn is_simple(&self) -> bool {
        self.segments.len() == 1
    }
}

impl std::fmt::Display for ComplexField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl TryFrom<&str> for ComplexField {
    type Error = ComplexFieldError;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        ComplexField::parse(value)
    }
}

/// A composite external id: several simple fields joined by `;`, whose
/// value is the `;`-joined concatenation of the component field values,
/// emitted as a phantom column named by [`ComplexField::encode`]-like
/// convention once every source fetch has completed (spec §4.1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompositeExternalId {
    pub components: Vec<String>,
}

impl CompositeExternalId {
    pub fn parse(decl: &str) -> Self {
        CompositeExternalId {
            components: decl.split(';').map(|s| s.trim().to_string()).collect(),
        }
    }

    pub fn is_composite(&self) -> bool {
        self.components.len() > 1
    }

    /// The synthetic column name this composite is emitted under, e.g.
    /// `$$FirstName$LastName` for `FirstName;LastName`.
    pub fn phantom_column(&self) -> String {
        format!("$${}", self.components.join("$"))
    }

    /// Join component values with `;` once all component fields have been
    /// fetched, per spec §4.1.
    pub fn join_values<'a>(&self, values: impl IntoIterator<Item = &'a str>) -> String {
        values.into_iter().collect::<Vec<_>>().join(";")
    }
}
