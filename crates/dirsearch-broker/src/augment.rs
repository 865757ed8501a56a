//! Attribute augmentation from a companion node.
//!
//! A record from a primary node can be completed with attributes held by a fixed augmenting
//! node. The companion record is of type [`record_types::AUGMENTS`] and is named
//! `<type suffix>:<record name>`, e.g. `Users:jdoe`.

use crate::policy_store::AugmentConfig;
use dirsearch_core::node::{FetchLimits, NodeConnection};
use dirsearch_core::query::{AttributeSelection, RecordQuery, SearchRequest};
use dirsearch_core::types::{attributes, record_type_suffix, record_types, Record};
use std::collections::BTreeMap;
use tracing::debug;

/// Name of the companion record of `record`.
#[must_use]
pub fn companion_name(record: &Record) -> String {
    format!("{}:{}", record.type_suffix(), record.name)
}

/// Attributes to augment per record type: the configured map restricted to what the caller
/// asked for. Empty when augmentation is off.
#[must_use]
pub fn plan(config: &AugmentConfig, request: &SearchRequest) -> BTreeMap<String, Vec<String>> {
    if !config.is_active() {
        return BTreeMap::new();
    }
    config
        .record_types
        .iter()
        .map(|(record_type, wanted)| (record_type.clone(), request.attributes().restrict(wanted)))
        .filter(|(_, wanted)| !wanted.is_empty())
        .collect()
}

/// Planned attributes for `record_type`, matched by full name or suffix.
pub(crate) fn planned_for<'a>(
    plan: &'a BTreeMap<String, Vec<String>>,
    record_type: &str,
) -> Option<&'a [String]> {
    plan.get(record_type)
        .or_else(|| plan.get(record_type_suffix(record_type)))
        .map(Vec::as_slice)
}

/// Returns true if records read from `node` are augmented.
#[must_use]
pub fn applies_to(config: &AugmentConfig, node: &str) -> bool {
    config.is_active()
        && node != config.target_node
        && (config.source_node.is_empty() || config.source_node == node)
}

/// Fills in `attributes` that `record` lacks from its companion record.
///
/// Returns the number of attributes added. A missing companion, a record GUID mismatch or a
/// failing companion node leave the record unchanged.
pub async fn augment_record(
    companion: &mut dyn NodeConnection,
    record: &mut Record,
    wanted: &[String],
) -> usize {
    let missing: Vec<String> = wanted
        .iter()
        .filter(|attribute| !record.has_attribute(attribute))
        .cloned()
        .collect();
    if missing.is_empty() {
        return 0;
    }

    let mut selection = missing.clone();
    selection.push(attributes::RECORD_GUID.to_string());
    let name = companion_name(record);
    let query = RecordQuery::new()
        .with_record_type(record_types::AUGMENTS)
        .with_record_name(name.clone())
        .with_attributes(AttributeSelection::Only(selection));

    let batch = match companion
        .list_records(&query, FetchLimits::new(usize::MAX).with_max_records(1), None)
        .await
    {
        Ok(batch) => batch,
        Err(err) => {
            debug!(node = companion.node_name(), record = %name, error = %err, "augmentation lookup failed");
            return 0;
        }
    };
    if let Some(token) = batch.continuation {
        if let Err(err) = companion.release_continuation(token).await {
            debug!(node = companion.node_name(), error = %err, "failed to release augmentation token");
        }
    }

    let Some(found) = batch.records.first() else {
        debug!(record = %name, "no companion record");
        return 0;
    };
    if let (Some(ours), Some(theirs)) = (
        record.first(attributes::RECORD_GUID),
        found.first(attributes::RECORD_GUID),
    ) {
        if ours != theirs {
            debug!(record = %name, "companion record GUID mismatch, skipping");
            return 0;
        }
    }
    record.merge_missing(found, &missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirsearch_core::memory::MemoryDirectory;
    use dirsearch_core::node::{BackendToken, DirectoryService, RecordBatch};
    use dirsearch_core::query::AttributeQuery;
    use dirsearch_core::Error;

    fn jdoe() -> Record {
        Record::new(record_types::USERS, "jdoe")
            .with_attribute(attributes::RECORD_NAME, ["jdoe"])
            .with_attribute(attributes::RECORD_GUID, ["guid-1"])
            .with_attribute(attributes::REAL_NAME, ["John Doe"])
    }

    fn config() -> AugmentConfig {
        AugmentConfig::new("/LDAPv3/augment").with_record_type(
            "Users",
            [attributes::EMAIL, attributes::REAL_NAME, attributes::USER_SHELL],
        )
    }

    #[test]
    fn companion_naming() {
        assert_eq!(companion_name(&jdoe()), "Users:jdoe");
    }

    #[test]
    fn plan_intersects_with_requested_attributes() {
        let request = SearchRequest::Records(RecordQuery::new().with_attributes(
            AttributeSelection::Only(vec![attributes::EMAIL.to_string()]),
        ));
        let plan = plan(&config(), &request);
        assert_eq!(
            planned_for(&plan, record_types::USERS),
            Some(&[attributes::EMAIL.to_string()][..])
        );

        let request = SearchRequest::AttributeValue(
            AttributeQuery::new(attributes::UNIQUE_ID, "501").with_attributes(
                AttributeSelection::Only(vec![attributes::UNIQUE_ID.to_string()]),
            ),
        );
        assert!(super::plan(&config(), &request).is_empty());

        let request = SearchRequest::Records(RecordQuery::new());
        assert!(super::plan(&AugmentConfig::default(), &request).is_empty());
    }

    #[test]
    fn source_node_rules() {
        let config = config();
        assert!(applies_to(&config, "/Local/Default"));
        assert!(!applies_to(&config, "/LDAPv3/augment"));

        let config = config.with_source_node("/LDAPv3/primary");
        assert!(applies_to(&config, "/LDAPv3/primary"));
        assert!(!applies_to(&config, "/Local/Default"));
    }

    #[tokio::test]
    async fn merges_only_missing_attributes() {
        let directory = MemoryDirectory::new();
        directory
            .add_node(
                "/LDAPv3/augment",
                vec![Record::new(record_types::AUGMENTS, "Users:jdoe")
                    .with_attribute(attributes::RECORD_GUID, ["guid-1"])
                    .with_attribute(attributes::EMAIL, ["jdoe@example.com"])
                    .with_attribute(attributes::REAL_NAME, ["Someone Else"])],
            )
            .unwrap();
        let mut companion = directory.open_node("/LDAPv3/augment").await.unwrap();

        let mut record = jdoe();
        let wanted = vec![attributes::EMAIL.to_string(), attributes::REAL_NAME.to_string()];
        let added = augment_record(companion.as_mut(), &mut record, &wanted).await;

        assert_eq!(added, 1);
        assert_eq!(record.first(attributes::EMAIL), Some("jdoe@example.com"));
        assert_eq!(record.first(attributes::REAL_NAME), Some("John Doe"));
    }

    #[tokio::test]
    async fn missing_companion_leaves_record_unchanged() {
        let directory = MemoryDirectory::new();
        directory.add_node("/LDAPv3/augment", Vec::new()).unwrap();
        let mut companion = directory.open_node("/LDAPv3/augment").await.unwrap();

        let mut record = jdoe();
        let before = record.clone();
        let added = augment_record(
            companion.as_mut(),
            &mut record,
            &[attributes::EMAIL.to_string()],
        )
        .await;
        assert_eq!(added, 0);
        assert_eq!(record, before);
    }

    /// Companion node answering every lookup with a fixed result.
    struct FixedCompanion {
        result: dirsearch_core::Result<RecordBatch>,
        lookups: usize,
    }

    impl FixedCompanion {
        fn new(result: dirsearch_core::Result<RecordBatch>) -> Self {
            Self { result, lookups: 0 }
        }
    }

    #[async_trait::async_trait]
    impl NodeConnection for FixedCompanion {
        fn node_name(&self) -> &str {
            "/LDAPv3/augment"
        }

        async fn list_records(
            &mut self,
            _query: &RecordQuery,
            _limits: FetchLimits,
            _continuation: Option<BackendToken>,
        ) -> dirsearch_core::Result<RecordBatch> {
            self.lookups += 1;
            self.result.clone()
        }

        async fn search_by_attribute_value(
            &mut self,
            _query: &AttributeQuery,
            _limits: FetchLimits,
            _continuation: Option<BackendToken>,
        ) -> dirsearch_core::Result<RecordBatch> {
            Err(Error::NotImplemented("attribute search".to_string()))
        }

        async fn get_attribute_value(
            &mut self,
            _record_type: &str,
            _record_name: &str,
            _attribute: &str,
        ) -> dirsearch_core::Result<Vec<String>> {
            Err(Error::NotImplemented("attribute lookup".to_string()))
        }

        async fn release_continuation(&mut self, _token: BackendToken) -> dirsearch_core::Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> dirsearch_core::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn guid_mismatch_skips_merge() {
        let mut companion = FixedCompanion::new(Ok(RecordBatch {
            records: vec![Record::new(record_types::AUGMENTS, "Users:jdoe")
                .with_attribute(attributes::RECORD_GUID, ["guid-2"])
                .with_attribute(attributes::EMAIL, ["other@example.com"])],
            continuation: None,
        }));

        let mut record = jdoe();
        let added =
            augment_record(&mut companion, &mut record, &[attributes::EMAIL.to_string()]).await;
        assert_eq!(added, 0);
        assert_eq!(companion.lookups, 1);
        assert!(!record.has_attribute(attributes::EMAIL));
    }

    #[tokio::test]
    async fn failing_companion_is_ignored() {
        let mut companion = FixedCompanion::new(Err(Error::NodeUnavailable(
            "/LDAPv3/augment".to_string(),
        )));

        let mut record = jdoe();
        let added =
            augment_record(&mut companion, &mut record, &[attributes::EMAIL.to_string()]).await;
        assert_eq!(added, 0);
    }

    #[tokio::test]
    async fn nothing_missing_skips_lookup() {
        let mut companion = FixedCompanion::new(Ok(RecordBatch::exhausted()));
        let mut record = jdoe();
        let added = augment_record(
            &mut companion,
            &mut record,
            &[attributes::REAL_NAME.to_string()],
        )
        .await;
        assert_eq!(added, 0);
        assert_eq!(companion.lookups, 0);
    }
}
