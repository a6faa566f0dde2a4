use tiersync_core::{NaturalKey, RowId};
use tiersync_storage::HierarchyStore;

use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Found(RowId),
    NotFound,
}

/// Exact-match lookup of a record's natural key against the store.
///
/// Check-then-insert is not atomic; it relies on the scheduler never running
/// two cycles at once.
#[derive(Clone, Copy)]
pub struct IdentityResolver<'a> {
    store: &'a dyn HierarchyStore,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(store: &'a dyn HierarchyStore) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, key: &NaturalKey<'_>) -> Result<Resolution, SyncError> {
        let found = match *key {
            NaturalKey::Parent { email } => self.store.find_parent_by_email(email).await,
            NaturalKey::Child { parent_id, title } => self.store.find_child(parent_id, title).await,
            NaturalKey::Grandchild { child_id, body } => {
                self.store.find_grandchild(child_id, body).await
            }
        }
        .map_err(|source| SyncError::ResolutionFailed {
            level: key.level(),
            source,
        })?;
        Ok(found.map_or(Resolution::NotFound, Resolution::Found))
    }
}
