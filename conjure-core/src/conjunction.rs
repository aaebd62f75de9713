//! Conjunction model: field values, conjunctions, schemes and disjunctions.
//!
//! A cached query depends on a disjunction of equality conjunctions. Each
//! conjunction is indexed under its exact `field=value` pairs, and its field
//! names (its *scheme*) are recorded per table. When a record changes, the
//! record's current values are projected onto every recorded scheme to find
//! the conjunctions it could satisfy, which is what makes invalidation
//! proportional to the number of schemes rather than the number of entries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Field name to current value mapping for a changed record.
pub type RecordValues = BTreeMap<String, FieldValue>;

// ============================================================================
// FIELD VALUES
// ============================================================================

/// A scalar field value as it appears in an equality constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl FieldValue {
    /// Canonical string form used inside conjunction keys.
    ///
    /// Booleans are lower-cased and null renders as `None`, so the same value
    /// always serializes identically whichever side produced it.
    pub fn canonical(&self) -> String {
        match self {
            FieldValue::Null => "None".to_string(),
            FieldValue::Bool(true) => "true".to_string(),
            FieldValue::Bool(false) => "false".to_string(),
            FieldValue::Int(i) => i.to_string(),
            FieldValue::Float(f) => format!("{:?}", f),
            FieldValue::Str(s) => s.clone(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(i64::from(v))
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::Int(i64::from(v))
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

// ============================================================================
// CONJUNCTION
// ============================================================================

/// A set of `field=value` equality constraints that must all hold.
///
/// Fields are kept sorted, so two conjunctions with the same pairs always
/// encode to the same string regardless of construction order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conjunction {
    pairs: BTreeMap<String, FieldValue>,
}

impl Conjunction {
    /// Create an empty conjunction. It matches every record of its table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a constraint, replacing any previous value for the field.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.pairs.insert(field.into(), value.into());
        self
    }

    /// Get the constrained value of a field.
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.pairs.get(field)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Iterate over the constraints in field order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The field-name shape of this conjunction.
    pub fn scheme(&self) -> Scheme {
        Scheme {
            fields: self.pairs.keys().cloned().collect(),
        }
    }

    /// Encode as `field1=val1&field2=val2`.
    pub fn encode(&self) -> String {
        self.pairs
            .iter()
            .map(|(field, value)| format!("{}={}", field, value.canonical()))
            .collect::<Vec<_>>()
            .join("&")
    }
}

impl<K, V> FromIterator<(K, V)> for Conjunction
where
    K: Into<String>,
    V: Into<FieldValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            pairs: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

// ============================================================================
// SCHEME
// ============================================================================

/// The sorted field names of a conjunction, stored as `field1,field2`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scheme {
    fields: Vec<String>,
}

impl Scheme {
    /// Parse the stored `field1,field2` form. Empty segments are ignored,
    /// so the empty string parses to the empty scheme.
    pub fn parse(raw: &str) -> Self {
        let mut fields: Vec<String> = raw
            .split(',')
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect();
        fields.sort();
        fields.dedup();
        Self { fields }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Stored form, `field1,field2`.
    pub fn encode(&self) -> String {
        self.fields.join(",")
    }

    /// Build the conjunction a record with `values` would satisfy under this
    /// scheme.
    ///
    /// Returns `None` when any scheme field is absent from `values`: a record
    /// that does not report a field cannot be matched on it. The empty scheme
    /// always projects to the empty conjunction.
    pub fn project(&self, values: &RecordValues) -> Option<Conjunction> {
        let mut pairs = BTreeMap::new();
        for field in &self.fields {
            let value = values.get(field)?;
            pairs.insert(field.clone(), value.clone());
        }
        Some(Conjunction { pairs })
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

// ============================================================================
// DISJUNCTION
// ============================================================================

/// The conjunctions a cached query depends on for one table.
///
/// A query touching several tables yields one disjunction per table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disjunction {
    pub table: String,
    pub conjunctions: Vec<Conjunction>,
}

impl Disjunction {
    pub fn new(table: impl Into<String>, conjunctions: Vec<Conjunction>) -> Self {
        Self {
            table: table.into(),
            conjunctions,
        }
    }

    /// A dependency on every row of `table` (a query without conditions).
    pub fn whole_table(table: impl Into<String>) -> Self {
        Self::new(table, vec![Conjunction::new()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, FieldValue)]) -> RecordValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_canonical_values() {
        assert_eq!(FieldValue::Bool(true).canonical(), "true");
        assert_eq!(FieldValue::Bool(false).canonical(), "false");
        assert_eq!(FieldValue::Null.canonical(), "None");
        assert_eq!(FieldValue::Int(-42).canonical(), "-42");
        assert_eq!(FieldValue::Float(1.0).canonical(), "1.0");
        assert_eq!(FieldValue::from("abc").canonical(), "abc");
        assert_eq!(FieldValue::from(None::<i64>), FieldValue::Null);
    }

    #[test]
    fn test_encode_sorts_fields() {
        let a = Conjunction::new().with("label_id", 2).with("brand_id", 7);
        let b = Conjunction::new().with("brand_id", 7).with("label_id", 2);
        assert_eq!(a.encode(), "brand_id=7&label_id=2");
        assert_eq!(a.encode(), b.encode());
    }

    #[test]
    fn test_scheme_roundtrip() {
        let conj = Conjunction::new().with("label_id", 2).with("brand_id", 7);
        let scheme = conj.scheme();
        assert_eq!(scheme.encode(), "brand_id,label_id");
        assert_eq!(Scheme::parse(&scheme.encode()), scheme);
    }

    #[test]
    fn test_empty_scheme_parses_and_projects() {
        let scheme = Scheme::parse("");
        assert!(scheme.is_empty());
        let projected = scheme.project(&RecordValues::new()).unwrap();
        assert!(projected.is_empty());
        assert_eq!(projected.encode(), "");
    }

    #[test]
    fn test_project_uses_record_values() {
        let scheme = Scheme::parse("x,y");
        let record = values(&[
            ("x", FieldValue::Int(1)),
            ("y", FieldValue::Int(3)),
            ("z", FieldValue::Bool(true)),
        ]);
        let conj = scheme.project(&record).unwrap();
        assert_eq!(conj.encode(), "x=1&y=3");
    }

    #[test]
    fn test_project_skips_absent_fields() {
        let scheme = Scheme::parse("x,y");
        let record = values(&[("x", FieldValue::Int(1))]);
        assert!(scheme.project(&record).is_none());
    }

    #[test]
    fn test_project_keeps_null_values() {
        let scheme = Scheme::parse("parent_id");
        let record = values(&[("parent_id", FieldValue::Null)]);
        assert_eq!(scheme.project(&record).unwrap().encode(), "parent_id=None");
    }

    #[test]
    fn test_field_value_json_untagged() {
        let parsed: RecordValues =
            serde_json::from_str(r#"{"a": 1, "b": "x", "c": null, "d": false, "e": 2.5}"#)
                .unwrap();
        assert_eq!(parsed["a"], FieldValue::Int(1));
        assert_eq!(parsed["b"], FieldValue::Str("x".to_string()));
        assert_eq!(parsed["c"], FieldValue::Null);
        assert_eq!(parsed["d"], FieldValue::Bool(false));
        assert_eq!(parsed["e"], FieldValue::Float(2.5));
    }

    #[test]
    fn test_whole_table_disjunction() {
        let dnf = Disjunction::whole_table("post");
        assert_eq!(dnf.conjunctions.len(), 1);
        assert!(dnf.conjunctions[0].is_empty());
    }
}
