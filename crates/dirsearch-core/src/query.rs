//! Record-list and attribute-value query descriptions.
//!
//! Queries are plain values: the broker stores a copy in every continuation so that a paginated
//! query resumes with exactly the filters it started with.

use serde::{Deserialize, Serialize};

use crate::types::Record;

/// How a name or value pattern is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// Matches everything; the pattern is ignored.
    Any,
    /// Case-insensitive equality.
    #[default]
    Equals,
    /// Case-insensitive prefix.
    BeginsWith,
    /// Case-insensitive suffix.
    EndsWith,
    /// Case-insensitive substring.
    Contains,
}

impl MatchType {
    /// Returns true if `candidate` matches `pattern` under this match type.
    #[must_use]
    pub fn matches(self, candidate: &str, pattern: &str) -> bool {
        let candidate = candidate.to_lowercase();
        let pattern = pattern.to_lowercase();
        match self {
            Self::Any => true,
            Self::Equals => candidate == pattern,
            Self::BeginsWith => candidate.starts_with(&pattern),
            Self::EndsWith => candidate.ends_with(&pattern),
            Self::Contains => candidate.contains(&pattern),
        }
    }
}

/// Which attributes a caller wants returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AttributeSelection {
    /// Every attribute the node has.
    #[default]
    All,
    /// Only the listed attributes.
    Only(Vec<String>),
}

impl AttributeSelection {
    /// Returns true if `attribute` is selected.
    #[must_use]
    pub fn includes(&self, attribute: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(names) => names.iter().any(|name| name == attribute),
        }
    }

    /// Keeps only the elements of `candidates` that are selected.
    #[must_use]
    pub fn restrict(&self, candidates: &[String]) -> Vec<String> {
        candidates
            .iter()
            .filter(|name| self.includes(name))
            .cloned()
            .collect()
    }

    /// Drops unselected attributes from `record`.
    pub fn apply(&self, record: &mut Record) {
        if let Self::Only(_) = self {
            record.attributes.retain(|name, _| self.includes(name));
        }
    }
}

/// Filters for a record-list request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RecordQuery {
    /// Record names to match; empty means all names.
    #[serde(default)]
    pub record_names: Vec<String>,
    /// Record types to search; empty means all types the node serves.
    #[serde(default)]
    pub record_types: Vec<String>,
    /// How `record_names` are compared.
    #[serde(default)]
    pub match_type: MatchType,
    /// Attributes to return.
    #[serde(default)]
    pub attributes: AttributeSelection,
}

impl RecordQuery {
    /// Creates a query that matches every record.
    #[must_use]
    pub fn new() -> Self {
        Self {
            match_type: MatchType::Any,
            ..Self::default()
        }
    }

    /// Restricts the query to one record type (may be called repeatedly).
    #[must_use]
    pub fn with_record_type(mut self, record_type: impl Into<String>) -> Self {
        self.record_types.push(record_type.into());
        self
    }

    /// Restricts the query to a record name (may be called repeatedly).
    ///
    /// Switches an `Any` match to `Equals`.
    #[must_use]
    pub fn with_record_name(mut self, name: impl Into<String>) -> Self {
        self.record_names.push(name.into());
        if self.match_type == MatchType::Any {
            self.match_type = MatchType::Equals;
        }
        self
    }

    /// Sets the name match type.
    #[must_use]
    pub const fn with_match_type(mut self, match_type: MatchType) -> Self {
        self.match_type = match_type;
        self
    }

    /// Sets the attributes to return.
    #[must_use]
    pub fn with_attributes(mut self, attributes: AttributeSelection) -> Self {
        self.attributes = attributes;
        self
    }

    /// Returns true if `record` passes the type and name filters.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        let type_ok = self.record_types.is_empty()
            || self
                .record_types
                .iter()
                .any(|t| t.eq_ignore_ascii_case(&record.record_type));
        let name_ok = self.match_type == MatchType::Any
            || self.record_names.is_empty()
            || self
                .record_names
                .iter()
                .any(|pattern| self.match_type.matches(&record.name, pattern));
        type_ok && name_ok
    }
}

/// Filters for a search-by-attribute-value request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeQuery {
    /// Record types to search; empty means all types the node serves.
    #[serde(default)]
    pub record_types: Vec<String>,
    /// Attribute whose values are compared.
    pub attribute: String,
    /// Value pattern.
    pub value: String,
    /// How `value` is compared.
    #[serde(default)]
    pub match_type: MatchType,
    /// Attributes to return.
    #[serde(default)]
    pub attributes: AttributeSelection,
}

impl AttributeQuery {
    /// Creates an equality search on `attribute`.
    #[must_use]
    pub fn new(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            record_types: Vec::new(),
            attribute: attribute.into(),
            value: value.into(),
            match_type: MatchType::Equals,
            attributes: AttributeSelection::All,
        }
    }

    /// Restricts the search to one record type (may be called repeatedly).
    #[must_use]
    pub fn with_record_type(mut self, record_type: impl Into<String>) -> Self {
        self.record_types.push(record_type.into());
        self
    }

    /// Sets the value match type.
    #[must_use]
    pub const fn with_match_type(mut self, match_type: MatchType) -> Self {
        self.match_type = match_type;
        self
    }

    /// Sets the attributes to return.
    #[must_use]
    pub fn with_attributes(mut self, attributes: AttributeSelection) -> Self {
        self.attributes = attributes;
        self
    }

    /// Returns true if `record` passes the type filter and has a matching value.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        let type_ok = self.record_types.is_empty()
            || self
                .record_types
                .iter()
                .any(|t| t.eq_ignore_ascii_case(&record.record_type));
        type_ok
            && record.values(&self.attribute).is_some_and(|values| {
                values
                    .iter()
                    .any(|value| self.match_type.matches(value, &self.value))
            })
    }
}

/// A query the broker can run across a search path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchRequest {
    /// Record-list request.
    Records(RecordQuery),
    /// Search-by-attribute-value request.
    AttributeValue(AttributeQuery),
}

impl SearchRequest {
    /// Attributes requested by the caller.
    #[must_use]
    pub fn attributes(&self) -> &AttributeSelection {
        match self {
            Self::Records(query) => &query.attributes,
            Self::AttributeValue(query) => &query.attributes,
        }
    }

    /// Short label used in logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Records(_) => "record-list",
            Self::AttributeValue(_) => "attribute-search",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{attributes, record_types};

    fn jdoe() -> Record {
        Record::new(record_types::USERS, "jdoe")
            .with_attribute(attributes::EMAIL, ["jdoe@example.com"])
            .with_attribute(attributes::REAL_NAME, ["John Doe"])
    }

    #[test]
    fn match_types() {
        assert!(MatchType::Any.matches("x", "y"));
        assert!(MatchType::Equals.matches("JDoe", "jdoe"));
        assert!(MatchType::BeginsWith.matches("jdoe", "jd"));
        assert!(MatchType::EndsWith.matches("jdoe", "DOE"));
        assert!(MatchType::Contains.matches("jdoe", "do"));
        assert!(!MatchType::Equals.matches("jdoe", "jd"));
    }

    #[test]
    fn record_query_defaults_match_everything() {
        assert!(RecordQuery::new().matches(&jdoe()));
    }

    #[test]
    fn record_query_filters_by_type_and_name() {
        let query = RecordQuery::new()
            .with_record_type(record_types::USERS)
            .with_record_name("jdoe");
        assert_eq!(query.match_type, MatchType::Equals);
        assert!(query.matches(&jdoe()));

        let groups = RecordQuery::new().with_record_type(record_types::GROUPS);
        assert!(!groups.matches(&jdoe()));

        let other = RecordQuery::new().with_record_name("asmith");
        assert!(!other.matches(&jdoe()));
    }

    #[test]
    fn attribute_query_matches_values() {
        let query = AttributeQuery::new(attributes::EMAIL, "example.com")
            .with_match_type(MatchType::EndsWith);
        assert!(query.matches(&jdoe()));

        let missing = AttributeQuery::new(attributes::HOME_DIRECTORY, "/home/jdoe");
        assert!(!missing.matches(&jdoe()));
    }

    #[test]
    fn attribute_selection_apply_and_restrict() {
        let selection = AttributeSelection::Only(vec![attributes::EMAIL.to_string()]);
        let mut record = jdoe();
        selection.apply(&mut record);
        assert!(record.has_attribute(attributes::EMAIL));
        assert!(!record.has_attribute(attributes::REAL_NAME));

        let restricted = selection.restrict(&[
            attributes::EMAIL.to_string(),
            attributes::HOME_DIRECTORY.to_string(),
        ]);
        assert_eq!(restricted, vec![attributes::EMAIL.to_string()]);
        assert_eq!(
            AttributeSelection::All
                .restrict(&[attributes::EMAIL.to_string()])
                .len(),
            1
        );
    }
}
