//! Core directory-search domain types.
//!
//! This module provides search policies, search roles, directory records and the well-known
//! node, record-type and attribute names shared by the broker and its backends.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Name of the local directory node, always first in every search path.
pub const DEFAULT_LOCAL_NODE: &str = "/Local/Default";
/// Name of the local flat-file node, always second in every search path.
pub const DEFAULT_FLAT_FILE_NODE: &str = "/FlatFile/local";
/// Prefix shared by every LDAP node name.
pub const LDAP_NODE_PREFIX: &str = "/LDAPv3/";

/// Well-known record types.
pub mod record_types {
    /// User accounts.
    pub const USERS: &str = "Standard:Users";
    /// Groups.
    pub const GROUPS: &str = "Standard:Groups";
    /// Contact entries.
    pub const PEOPLE: &str = "Standard:People";
    /// Hosts.
    pub const HOSTS: &str = "Standard:Hosts";
    /// Companion records named `<type suffix>:<record name>`, e.g. `Users:jdoe`.
    pub const AUGMENTS: &str = "Standard:Augments";
}

/// Well-known attribute names.
pub mod attributes {
    /// Record name attribute.
    pub const RECORD_NAME: &str = "RecordName";
    /// Globally unique record identifier, used to pair companion records.
    pub const RECORD_GUID: &str = "RecordGUID";
    /// Full name.
    pub const REAL_NAME: &str = "RealName";
    /// E-mail address.
    pub const EMAIL: &str = "EMailAddress";
    /// Numeric user id.
    pub const UNIQUE_ID: &str = "UniqueID";
    /// Primary group id.
    pub const PRIMARY_GROUP_ID: &str = "PrimaryGroupID";
    /// Home directory.
    pub const HOME_DIRECTORY: &str = "HomeDirectory";
    /// Login shell.
    pub const USER_SHELL: &str = "UserShell";
    /// Group members.
    pub const GROUP_MEMBERSHIP: &str = "GroupMembership";
}

/// Search policy governing which nodes make up a search path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchPolicy {
    /// Local nodes plus automatically discovered network nodes.
    #[default]
    Automatic,
    /// Local nodes only.
    Local,
    /// Local nodes plus an administrator-specified list.
    Custom,
}

impl SearchPolicy {
    /// Returns the policy name as a string.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Local => "local",
            Self::Custom => "custom",
        }
    }

    /// Returns all policies.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Automatic, Self::Local, Self::Custom]
    }
}

impl FromStr for SearchPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "automatic" => Ok(Self::Automatic),
            "local" => Ok(Self::Local),
            "custom" => Ok(Self::Custom),
            _ => Err(Error::InvalidRequest(format!("Unknown search policy: {s}"))),
        }
    }
}

impl std::fmt::Display for SearchPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Logical search target. Each role owns one search configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchRole {
    /// Authentication lookups.
    Authentication,
    /// Contact lookups.
    Contacts,
    /// Network (host and service) lookups.
    Network,
}

impl SearchRole {
    /// Returns the role name as a string.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Contacts => "contacts",
            Self::Network => "network",
        }
    }

    /// Returns the target name clients open to reach this role.
    #[must_use]
    pub const fn target_name(&self) -> &'static str {
        match self {
            Self::Authentication => "/Search",
            Self::Contacts => "/Search/Contacts",
            Self::Network => "/Search/Network",
        }
    }

    /// Resolves a target name to its role.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTarget`] when no role is registered under `target`.
    pub fn from_target_name(target: &str) -> Result<Self> {
        let trimmed = target.trim_end_matches('/');
        Self::all()
            .iter()
            .copied()
            .find(|role| role.target_name().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| Error::UnknownTarget(target.to_string()))
    }

    /// Returns all roles.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Authentication, Self::Contacts, Self::Network]
    }
}

impl FromStr for SearchRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "authentication" => Ok(Self::Authentication),
            "contacts" => Ok(Self::Contacts),
            "network" => Ok(Self::Network),
            _ => Err(Error::InvalidRequest(format!("Unknown search role: {s}"))),
        }
    }
}

impl std::fmt::Display for SearchRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A directory record as delivered to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Record type, e.g. [`record_types::USERS`].
    pub record_type: String,
    /// Record name.
    pub name: String,
    /// Attribute values keyed by attribute name.
    #[serde(default)]
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl Record {
    /// Creates a record with no attributes.
    #[must_use]
    pub fn new(record_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Adds (or replaces) an attribute.
    #[must_use]
    pub fn with_attribute<I, V>(mut self, attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.attributes.insert(
            attribute.into(),
            values.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Returns the first value of the attribute if present.
    #[must_use]
    pub fn first(&self, attribute: &str) -> Option<&str> {
        self.attributes
            .get(attribute)
            .and_then(|values| values.first().map(String::as_str))
    }

    /// Returns all values for the attribute.
    #[must_use]
    pub fn values(&self, attribute: &str) -> Option<&[String]> {
        self.attributes.get(attribute).map(Vec::as_slice)
    }

    /// Returns true if the record carries the attribute.
    #[must_use]
    pub fn has_attribute(&self, attribute: &str) -> bool {
        self.attributes.contains_key(attribute)
    }

    /// Record type with any `Prefix:` stripped, e.g. `Users` for `Standard:Users`.
    #[must_use]
    pub fn type_suffix(&self) -> &str {
        record_type_suffix(&self.record_type)
    }

    /// Number of bytes the record occupies in a caller's output buffer.
    ///
    /// Layout: a 4-byte length for the type, the name and every attribute name and value, plus
    /// a 4-byte attribute count.
    #[must_use]
    pub fn wire_size(&self) -> usize {
        let header = 4 + self.record_type.len() + 4 + self.name.len() + 4;
        let body: usize = self
            .attributes
            .iter()
            .map(|(name, values)| {
                4 + name.len() + 4 + values.iter().map(|v| 4 + v.len()).sum::<usize>()
            })
            .sum();
        header + body
    }

    /// Copies attributes from `other` that this record does not carry yet.
    ///
    /// Returns the number of attributes added.
    pub fn merge_missing(&mut self, other: &Record, only: &[String]) -> usize {
        let mut added = 0;
        for attribute in only {
            if self.attributes.contains_key(attribute) {
                continue;
            }
            if let Some(values) = other.attributes.get(attribute) {
                self.attributes.insert(attribute.clone(), values.clone());
                added += 1;
            }
        }
        added
    }
}

/// Returns `record_type` with any `Prefix:` stripped.
#[must_use]
pub fn record_type_suffix(record_type: &str) -> &str {
    record_type
        .rsplit_once(':')
        .map_or(record_type, |(_, suffix)| suffix)
}

/// Returns true if `name` designates an LDAP node.
#[must_use]
pub fn is_ldap_node(name: &str) -> bool {
    name.starts_with(LDAP_NODE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_policy_name_and_parse() {
        for policy in SearchPolicy::all() {
            assert_eq!(policy.name().parse::<SearchPolicy>().unwrap(), *policy);
        }
        assert_eq!(
            "CUSTOM".parse::<SearchPolicy>().unwrap(),
            SearchPolicy::Custom
        );
        assert!("nonsense".parse::<SearchPolicy>().is_err());
    }

    #[test]
    fn test_search_policy_default_is_automatic() {
        assert_eq!(SearchPolicy::default(), SearchPolicy::Automatic);
    }

    #[test]
    fn test_search_policy_serialize() {
        let json = serde_json::to_string(&SearchPolicy::Local).unwrap();
        assert_eq!(json, "\"local\"");
        let parsed: SearchPolicy = serde_json::from_str("\"custom\"").unwrap();
        assert_eq!(parsed, SearchPolicy::Custom);
    }

    #[test]
    fn test_search_role_targets() {
        assert_eq!(
            SearchRole::from_target_name("/Search").unwrap(),
            SearchRole::Authentication
        );
        assert_eq!(
            SearchRole::from_target_name("/Search/Contacts/").unwrap(),
            SearchRole::Contacts
        );
        assert_eq!(
            SearchRole::from_target_name("/search/network").unwrap(),
            SearchRole::Network
        );
        assert!(matches!(
            SearchRole::from_target_name("/Local/Default"),
            Err(Error::UnknownTarget(_))
        ));
    }

    #[test]
    fn test_search_role_display() {
        assert_eq!(SearchRole::Authentication.to_string(), "authentication");
        assert_eq!("contacts".parse::<SearchRole>().unwrap(), SearchRole::Contacts);
    }

    #[test]
    fn test_record_accessors() {
        let record = Record::new(record_types::USERS, "jdoe")
            .with_attribute(attributes::REAL_NAME, ["John Doe"])
            .with_attribute(attributes::GROUP_MEMBERSHIP, ["staff", "admin"]);

        assert_eq!(record.first(attributes::REAL_NAME), Some("John Doe"));
        assert_eq!(record.values(attributes::GROUP_MEMBERSHIP).unwrap().len(), 2);
        assert!(!record.has_attribute(attributes::EMAIL));
        assert_eq!(record.type_suffix(), "Users");
    }

    #[test]
    fn test_record_type_suffix_without_prefix() {
        assert_eq!(record_type_suffix("Users"), "Users");
        assert_eq!(record_type_suffix("Standard:Groups"), "Groups");
    }

    #[test]
    fn test_wire_size_grows_with_attributes() {
        let bare = Record::new("T", "n");
        assert_eq!(bare.wire_size(), 4 + 1 + 4 + 1 + 4);

        let with_attr = bare.clone().with_attribute("a", ["xy"]);
        assert_eq!(with_attr.wire_size(), bare.wire_size() + 4 + 1 + 4 + 4 + 2);
    }

    #[test]
    fn test_merge_missing_keeps_primary_values() {
        let mut primary = Record::new(record_types::USERS, "jdoe")
            .with_attribute(attributes::REAL_NAME, ["Primary Name"]);
        let companion = Record::new(record_types::USERS, "Users:jdoe")
            .with_attribute(attributes::REAL_NAME, ["Companion Name"])
            .with_attribute(attributes::EMAIL, ["jdoe@example.com"])
            .with_attribute(attributes::HOME_DIRECTORY, ["/home/jdoe"]);

        let added = primary.merge_missing(
            &companion,
            &[attributes::REAL_NAME.to_string(), attributes::EMAIL.to_string()],
        );

        assert_eq!(added, 1);
        assert_eq!(primary.first(attributes::REAL_NAME), Some("Primary Name"));
        assert_eq!(primary.first(attributes::EMAIL), Some("jdoe@example.com"));
        assert!(!primary.has_attribute(attributes::HOME_DIRECTORY));
    }

    #[test]
    fn test_is_ldap_node() {
        assert!(is_ldap_node("/LDAPv3/ldap1.example.com"));
        assert!(!is_ldap_node(DEFAULT_LOCAL_NODE));
    }
}
