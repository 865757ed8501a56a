//! Record-type to LDAP schema mappings and filter construction.

use dirsearch_core::error::Error as CoreError;
use dirsearch_core::query::{AttributeQuery, AttributeSelection, MatchType, RecordQuery};
use dirsearch_core::types::{attributes, record_types, Record};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::client::LdapEntry;

/// Errors raised while translating a query into an LDAP filter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    /// No mapping is configured for the record type.
    #[error("record type `{0}` is not mapped")]
    UnmappedRecordType(String),
    /// The record type has no LDAP attribute for the requested attribute.
    #[error("attribute `{attribute}` is not mapped for `{record_type}`")]
    UnmappedAttribute {
        /// Record type searched.
        record_type: String,
        /// Attribute requested.
        attribute: String,
    },
}

impl From<FilterError> for CoreError {
    fn from(err: FilterError) -> Self {
        match err {
            FilterError::UnmappedRecordType(_) => CoreError::InvalidRecordType(err.to_string()),
            FilterError::UnmappedAttribute { .. } => CoreError::NoMapping(err.to_string()),
        }
    }
}

/// How one record type is stored in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordTypeMapping {
    /// Record type served, e.g. `Standard:Users`.
    pub record_type: String,
    /// Object classes every entry of the type carries.
    pub object_classes: Vec<String>,
    /// LDAP attribute holding the record name.
    pub name_attribute: String,
    /// Search base overriding the node's base DN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_base: Option<String>,
    /// Record attribute name to LDAP attribute name.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl RecordTypeMapping {
    /// Creates a mapping with no object classes and no attributes.
    #[must_use]
    pub fn new(record_type: impl Into<String>, name_attribute: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            object_classes: Vec::new(),
            name_attribute: name_attribute.into(),
            search_base: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Adds a required object class.
    #[must_use]
    pub fn with_object_class(mut self, object_class: impl Into<String>) -> Self {
        self.object_classes.push(object_class.into());
        self
    }

    /// Maps a record attribute to an LDAP attribute.
    #[must_use]
    pub fn with_attribute(mut self, attribute: impl Into<String>, ldap: impl Into<String>) -> Self {
        self.attributes.insert(attribute.into(), ldap.into());
        self
    }

    /// Overrides the search base for this record type.
    #[must_use]
    pub fn with_search_base(mut self, base: impl Into<String>) -> Self {
        self.search_base = Some(base.into());
        self
    }

    /// RFC 2307 user accounts.
    #[must_use]
    pub fn users() -> Self {
        Self::new(record_types::USERS, "uid")
            .with_object_class("posixAccount")
            .with_attribute(attributes::REAL_NAME, "cn")
            .with_attribute(attributes::EMAIL, "mail")
            .with_attribute(attributes::UNIQUE_ID, "uidNumber")
            .with_attribute(attributes::PRIMARY_GROUP_ID, "gidNumber")
            .with_attribute(attributes::HOME_DIRECTORY, "homeDirectory")
            .with_attribute(attributes::USER_SHELL, "loginShell")
            .with_attribute(attributes::RECORD_GUID, "entryUUID")
    }

    /// RFC 2307 groups.
    #[must_use]
    pub fn groups() -> Self {
        Self::new(record_types::GROUPS, "cn")
            .with_object_class("posixGroup")
            .with_attribute(attributes::PRIMARY_GROUP_ID, "gidNumber")
            .with_attribute(attributes::GROUP_MEMBERSHIP, "memberUid")
            .with_attribute(attributes::RECORD_GUID, "entryUUID")
    }

    /// Address-book entries.
    #[must_use]
    pub fn people() -> Self {
        Self::new(record_types::PEOPLE, "cn")
            .with_object_class("inetOrgPerson")
            .with_attribute(attributes::REAL_NAME, "displayName")
            .with_attribute(attributes::EMAIL, "mail")
            .with_attribute(attributes::RECORD_GUID, "entryUUID")
    }

    /// Mappings used when a node configures none.
    #[must_use]
    pub fn defaults() -> Vec<Self> {
        vec![Self::users(), Self::groups(), Self::people()]
    }

    /// LDAP attribute backing a record attribute.
    #[must_use]
    pub fn ldap_attribute(&self, attribute: &str) -> Option<&str> {
        if attribute == attributes::RECORD_NAME {
            return Some(&self.name_attribute);
        }
        self.attributes.get(attribute).map(String::as_str)
    }

    /// LDAP attributes to request for `selection`.
    #[must_use]
    pub fn ldap_attributes(&self, selection: &AttributeSelection) -> Vec<String> {
        let mut requested = vec![self.name_attribute.clone()];
        for (attribute, ldap) in &self.attributes {
            if selection.includes(attribute) && !requested.contains(ldap) {
                requested.push(ldap.clone());
            }
        }
        requested
    }

    /// Filter selecting the records of `query` for this type.
    #[must_use]
    pub fn record_filter(&self, query: &RecordQuery) -> String {
        let mut clauses = self.class_clauses();
        if query.match_type != MatchType::Any && !query.record_names.is_empty() {
            let names: Vec<String> = query
                .record_names
                .iter()
                .map(|name| match_clause(&self.name_attribute, query.match_type, name))
                .collect();
            clauses.push(any_of(names));
        }
        all_of(clauses)
    }

    /// Filter selecting records of this type whose attribute matches `query`.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::UnmappedAttribute`] if the attribute has no LDAP counterpart.
    pub fn attribute_filter(&self, query: &AttributeQuery) -> Result<String, FilterError> {
        let ldap = self
            .ldap_attribute(&query.attribute)
            .ok_or_else(|| FilterError::UnmappedAttribute {
                record_type: self.record_type.clone(),
                attribute: query.attribute.clone(),
            })?;
        let mut clauses = self.class_clauses();
        clauses.push(match_clause(ldap, query.match_type, &query.value));
        Ok(all_of(clauses))
    }

    /// Filter selecting the single record called `name`.
    #[must_use]
    pub fn name_filter(&self, name: &str) -> String {
        let mut clauses = self.class_clauses();
        clauses.push(match_clause(&self.name_attribute, MatchType::Equals, name));
        all_of(clauses)
    }

    /// Converts a directory entry into a record, restricted to `selection`.
    ///
    /// Entries without a name attribute are skipped.
    #[must_use]
    pub fn entry_to_record(&self, entry: &LdapEntry, selection: &AttributeSelection) -> Option<Record> {
        let name = entry.first(&self.name_attribute)?;
        let mut record = Record::new(&self.record_type, name);

        if selection.includes(attributes::RECORD_NAME) {
            if let Some(values) = entry.values(&self.name_attribute) {
                record
                    .attributes
                    .insert(attributes::RECORD_NAME.to_string(), values.to_vec());
            }
        }
        for (attribute, ldap) in &self.attributes {
            if !selection.includes(attribute) {
                continue;
            }
            if let Some(values) = entry.values(ldap) {
                record
                    .attributes
                    .insert(attribute.clone(), values.to_vec());
            }
        }
        Some(record)
    }

    fn class_clauses(&self) -> Vec<String> {
        self.object_classes
            .iter()
            .map(|class| format!("(objectClass={})", escape_filter_value(class)))
            .collect()
    }
}

/// Resolves the mappings for the requested record types.
///
/// An empty request selects every mapping. Unmapped types among several are skipped.
///
/// # Errors
///
/// Returns [`FilterError::UnmappedRecordType`] when none of the requested types is mapped.
pub fn select_mappings<'a>(
    mappings: &'a [RecordTypeMapping],
    record_types: &[String],
) -> Result<Vec<&'a RecordTypeMapping>, FilterError> {
    if record_types.is_empty() {
        return Ok(mappings.iter().collect());
    }
    let selected: Vec<&RecordTypeMapping> = record_types
        .iter()
        .filter_map(|wanted| {
            mappings
                .iter()
                .find(|mapping| mapping.record_type.eq_ignore_ascii_case(wanted))
        })
        .collect();
    if selected.is_empty() {
        return Err(FilterError::UnmappedRecordType(record_types.join(",")));
    }
    Ok(selected)
}

fn match_clause(attribute: &str, match_type: MatchType, value: &str) -> String {
    let value = escape_filter_value(value);
    match match_type {
        MatchType::Any => format!("({attribute}=*)"),
        MatchType::Equals => format!("({attribute}={value})"),
        MatchType::BeginsWith => format!("({attribute}={value}*)"),
        MatchType::EndsWith => format!("({attribute}=*{value})"),
        MatchType::Contains => format!("({attribute}=*{value}*)"),
    }
}

fn all_of(mut clauses: Vec<String>) -> String {
    match clauses.len() {
        0 => "(objectClass=*)".to_string(),
        1 => clauses.remove(0),
        _ => format!("(&{})", clauses.concat()),
    }
}

fn any_of(mut clauses: Vec<String>) -> String {
    if clauses.len() == 1 {
        clauses.remove(0)
    } else {
        format!("(|{})", clauses.concat())
    }
}

/// Escapes a value for use inside an LDAP filter (RFC 4515).
#[must_use]
pub fn escape_filter_value(value: &str) -> String {
    value
        .chars()
        .flat_map(|ch| match ch {
            '*' => "\\2a".chars().collect::<Vec<_>>(),
            '(' => "\\28".chars().collect(),
            ')' => "\\29".chars().collect(),
            '\\' => "\\5c".chars().collect(),
            '\0' => "\\00".chars().collect(),
            _ => vec![ch],
        })
        .collect::<String>()
}
