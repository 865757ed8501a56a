//! Active-policy marker files.
//!
//! For out-of-process introspection the broker keeps one empty blob `.search-<role>-<policy>`
//! per role in the marker directory, naming the policy currently in effect.

use crate::persistence::BlobStore;
use dirsearch_core::types::{SearchPolicy, SearchRole};
use dirsearch_core::Result;
use std::sync::Arc;

/// Marker blob name for `role` running `policy`.
#[must_use]
pub fn marker_name(role: SearchRole, policy: SearchPolicy) -> String {
    format!(".search-{}-{}", role.name(), policy.name())
}

/// Maintains the marker blobs.
#[derive(Clone)]
pub struct MarkerFiles {
    blobs: Arc<dyn BlobStore>,
}

impl MarkerFiles {
    /// Creates a marker writer over `blobs`.
    #[must_use]
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Makes `policy` the only marked policy of `role`.
    ///
    /// # Errors
    ///
    /// Returns the underlying store error; markers written before the failure are kept.
    pub async fn set_active(&self, role: SearchRole, policy: SearchPolicy) -> Result<()> {
        for other in SearchPolicy::all() {
            if *other != policy {
                self.blobs.remove(&marker_name(role, *other)).await?;
            }
        }
        self.blobs.write(&marker_name(role, policy), &[]).await
    }

    /// Returns the marked policy of `role`, if exactly one marker exists.
    ///
    /// # Errors
    ///
    /// Returns the underlying store error.
    pub async fn active(&self, role: SearchRole) -> Result<Option<SearchPolicy>> {
        let mut found = None;
        for policy in SearchPolicy::all() {
            if self.blobs.exists(&marker_name(role, *policy)).await? {
                if found.is_some() {
                    return Ok(None);
                }
                found = Some(*policy);
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryBlobStore;

    #[test]
    fn marker_names() {
        assert_eq!(
            marker_name(SearchRole::Authentication, SearchPolicy::Automatic),
            ".search-authentication-automatic"
        );
        assert_eq!(
            marker_name(SearchRole::Contacts, SearchPolicy::Custom),
            ".search-contacts-custom"
        );
    }

    #[tokio::test]
    async fn exactly_one_marker_per_role() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let markers = MarkerFiles::new(Arc::clone(&blobs) as Arc<dyn BlobStore>);

        markers
            .set_active(SearchRole::Authentication, SearchPolicy::Automatic)
            .await
            .unwrap();
        markers
            .set_active(SearchRole::Contacts, SearchPolicy::Local)
            .await
            .unwrap();
        markers
            .set_active(SearchRole::Authentication, SearchPolicy::Custom)
            .await
            .unwrap();

        assert_eq!(
            blobs.list().await.unwrap(),
            vec![
                ".search-authentication-custom".to_string(),
                ".search-contacts-local".to_string(),
            ]
        );
        assert_eq!(
            markers.active(SearchRole::Authentication).await.unwrap(),
            Some(SearchPolicy::Custom)
        );
        assert_eq!(markers.active(SearchRole::Network).await.unwrap(), None);
    }
}
