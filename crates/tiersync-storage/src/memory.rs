use async_trait::async_trait;
use tiersync_core::{Child, Grandchild, GrandchildRecord, Level, Parent, ParentRecord, RowId};
use tokio::sync::Mutex;

use crate::{HierarchyStore, StoreError};

/// In-process store with the same foreign-key rules as the Postgres schema.
///
/// Ids are assigned per table starting at 1.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<MemorySnapshot>,
}

/// Copy of every row held by a [`MemoryStore`], in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub parents: Vec<Parent>,
    pub children: Vec<Child>,
    pub grandchildren: Vec<Grandchild>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> MemorySnapshot {
        self.tables.lock().await.clone()
    }
}

fn next_id(len: usize) -> RowId {
    RowId::try_from(len).unwrap_or(RowId::MAX - 1) + 1
}

#[async_trait]
impl HierarchyStore for MemoryStore {
    async fn find_parent_by_email(&self, email: &str) -> Result<Option<RowId>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.parents.iter().find(|p| p.email == email).map(|p| p.id))
    }

    async fn insert_parent(&self, parent: &ParentRecord) -> Result<RowId, StoreError> {
        let mut tables = self.tables.lock().await;
        let id = next_id(tables.parents.len());
        tables.parents.push(Parent {
            id,
            name: parent.name.clone(),
            username: parent.username.clone(),
            email: parent.email.clone(),
        });
        Ok(id)
    }

    async fn find_child(&self, parent_id: RowId, title: &str) -> Result<Option<RowId>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .children
            .iter()
            .find(|c| c.parent_id == parent_id && c.title == title)
            .map(|c| c.id))
    }

    async fn insert_child(
        &self,
        parent_id: RowId,
        title: &str,
        body: &str,
    ) -> Result<RowId, StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.parents.iter().any(|p| p.id == parent_id) {
            return Err(StoreError::MissingReference {
                level: Level::Parent,
                id: parent_id,
            });
        }
        let id = next_id(tables.children.len());
        tables.children.push(Child {
            id,
            parent_id,
            title: title.to_string(),
            body: body.to_string(),
        });
        Ok(id)
    }

    async fn find_grandchild(
        &self,
        child_id: RowId,
        body: &str,
    ) -> Result<Option<RowId>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .grandchildren
            .iter()
            .find(|g| g.child_id == child_id && g.body == body)
            .map(|g| g.id))
    }

    async fn insert_grandchild(
        &self,
        child_id: RowId,
        grandchild: &GrandchildRecord,
    ) -> Result<RowId, StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.children.iter().any(|c| c.id == child_id) {
            return Err(StoreError::MissingReference {
                level: Level::Child,
                id: child_id,
            });
        }
        let id = next_id(tables.grandchildren.len());
        tables.grandchildren.push(Grandchild {
            id,
            child_id,
            name: grandchild.name.clone(),
            email: grandchild.email.clone(),
            body: grandchild.body.clone(),
        });
        Ok(id)
    }

    async fn list_parents(&self, limit: usize) -> Result<Vec<Parent>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.parents.iter().take(limit).cloned().collect())
    }

    async fn list_children(&self, parent_id: RowId, limit: usize) -> Result<Vec<Child>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .children
            .iter()
            .filter(|c| c.parent_id == parent_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_grandchildren(
        &self,
        child_id: RowId,
        limit: usize,
    ) -> Result<Vec<Grandchild>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .grandchildren
            .iter()
            .filter(|g| g.child_id == child_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_parents(&self) -> Result<i64, StoreError> {
        let tables = self.tables.lock().await;
        Ok(i64::try_from(tables.parents.len()).unwrap_or(i64::MAX))
    }
}
