use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tiersync_core::{
    BatchLayout, Child, ChildKeyPolicy, ChildRecord, Grandchild, GrandchildRecord, Level, Parent,
    ParentRecord, RowId,
};
use tiersync_source::{FixtureDataSource, SourceBatch, StaticDataSource};
use tiersync_storage::{HierarchyStore, MemorySnapshot, MemoryStore, StoreError};
use tiersync_sync::{CycleGate, CycleState, SyncError, TriggerOutcome, UpsertEngine};
use tokio_util::sync::CancellationToken;

/// Memory store that fails selected lookups or inserts.
#[derive(Default)]
struct FaultyStore {
    inner: MemoryStore,
    failing_parent_lookups: Vec<String>,
    failing_child_titles: Vec<String>,
    failing_grandchild_bodies: Vec<String>,
}

fn refused() -> StoreError {
    StoreError::Unavailable("injected failure".into())
}

#[async_trait]
impl HierarchyStore for FaultyStore {
    async fn find_parent_by_email(&self, email: &str) -> Result<Option<RowId>, StoreError> {
        if self.failing_parent_lookups.iter().any(|e| e == email) {
            return Err(refused());
        }
        self.inner.find_parent_by_email(email).await
    }

    async fn insert_parent(&self, parent: &ParentRecord) -> Result<RowId, StoreError> {
        self.inner.insert_parent(parent).await
    }

    async fn find_child(&self, parent_id: RowId, title: &str) -> Result<Option<RowId>, StoreError> {
        self.inner.find_child(parent_id, title).await
    }

    async fn insert_child(&self, parent_id: RowId, title: &str, body: &str) -> Result<RowId, StoreError> {
        if self.failing_child_titles.iter().any(|t| title.starts_with(t.as_str())) {
            return Err(refused());
        }
        self.inner.insert_child(parent_id, title, body).await
    }

    async fn find_grandchild(&self, child_id: RowId, body: &str) -> Result<Option<RowId>, StoreError> {
        self.inner.find_grandchild(child_id, body).await
    }

    async fn insert_grandchild(
        &self,
        child_id: RowId,
        grandchild: &GrandchildRecord,
    ) -> Result<RowId, StoreError> {
        if self.failing_grandchild_bodies.contains(&grandchild.body) {
            return Err(refused());
        }
        self.inner.insert_grandchild(child_id, grandchild).await
    }

    async fn list_parents(&self, limit: usize) -> Result<Vec<Parent>, StoreError> {
        self.inner.list_parents(limit).await
    }

    async fn list_children(&self, parent_id: RowId, limit: usize) -> Result<Vec<Child>, StoreError> {
        self.inner.list_children(parent_id, limit).await
    }

    async fn list_grandchildren(&self, child_id: RowId, limit: usize) -> Result<Vec<Grandchild>, StoreError> {
        self.inner.list_grandchildren(child_id, limit).await
    }

    async fn count_parents(&self) -> Result<i64, StoreError> {
        self.inner.count_parents().await
    }
}

fn parent(name: &str, email: &str) -> ParentRecord {
    ParentRecord {
        name: name.into(),
        username: Some(name.to_ascii_lowercase()),
        email: email.into(),
    }
}

/// `parents` units of ten children each, with a hundred distinct grandchildren.
fn upstream_batch(parents: usize) -> SourceBatch {
    SourceBatch {
        parents: (0..parents)
            .map(|i| parent(&format!("Bot{i}"), &format!("bot{i}@cybertron.com")))
            .collect(),
        children: (0..parents * 10)
            .map(|n| ChildRecord {
                title: format!("post {n}"),
                body: format!("body of post {n}"),
            })
            .collect(),
        grandchildren: (0..100)
            .map(|n| GrandchildRecord {
                name: format!("reader {n}"),
                email: format!("reader{n}@earth.net"),
                body: format!("comment {n}"),
            })
            .collect(),
        digest: "upstream".into(),
    }
}

fn engine(batch: SourceBatch, store: Arc<dyn HierarchyStore>) -> UpsertEngine {
    UpsertEngine::new(Arc::new(StaticDataSource::new(batch)), store)
}

async fn run(engine: &UpsertEngine) -> tiersync_sync::CycleSummary {
    engine
        .run_cycle(&CancellationToken::new())
        .await
        .expect("cycle should not abort")
}

fn assert_referential_integrity(rows: &MemorySnapshot) {
    let parent_ids: HashSet<_> = rows.parents.iter().map(|p| p.id).collect();
    let child_ids: HashSet<_> = rows.children.iter().map(|c| c.id).collect();
    assert!(rows.children.iter().all(|c| parent_ids.contains(&c.parent_id)));
    assert!(rows.grandchildren.iter().all(|g| child_ids.contains(&g.child_id)));
}

#[tokio::test]
async fn repeated_cycles_insert_one_parent_per_email() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine(upstream_batch(3), store.clone());

    let first = run(&engine).await;
    let second = run(&engine).await;

    assert_eq!(first.parents.inserted, 3);
    assert_eq!(second.parents.inserted, 0);
    assert_eq!(second.parents.existing, 3);
    let rows = store.snapshot().await;
    let emails: HashSet<_> = rows.parents.iter().map(|p| p.email.as_str()).collect();
    assert_eq!(rows.parents.len(), 3);
    assert_eq!(emails.len(), 3);
}

#[tokio::test]
async fn duplicate_email_within_one_batch_resolves_to_the_first_row() {
    let mut batch = upstream_batch(2);
    batch.parents[1] = parent("Optimus Again", "bot0@cybertron.com");
    let store = Arc::new(MemoryStore::new());

    let summary = run(&engine(batch, store.clone())).await;

    assert_eq!(summary.parents.inserted, 1);
    assert_eq!(summary.parents.existing, 1);
    let rows = store.snapshot().await;
    assert_eq!(rows.parents.len(), 1);
    assert!(rows.children.iter().all(|c| c.parent_id == rows.parents[0].id));
    assert_eq!(rows.children.len(), 20);
}

#[tokio::test]
async fn existing_parent_is_reused_and_its_children_linked_to_it() {
    let store = Arc::new(MemoryStore::new());
    let existing = store
        .insert_parent(&parent("Optimus", "optimus@cybertron.com"))
        .await
        .unwrap();

    let mut batch = upstream_batch(1);
    batch.parents[0] = parent("Optimus", "optimus@cybertron.com");
    batch.children[0].title = "Why I Love Cybertron".into();

    let summary = run(&engine(batch, store.clone())).await;

    assert_eq!(summary.parents.inserted, 0);
    assert_eq!(summary.parents.existing, 1);
    let rows = store.snapshot().await;
    assert_eq!(rows.parents.len(), 1);
    assert_eq!(rows.children.len(), 10);
    assert!(rows.children.iter().all(|c| c.parent_id == existing));
    assert!(rows.children[0].title.starts_with("Why I Love Cybertron-"));
}

#[tokio::test]
async fn same_grandchild_body_twice_under_one_child_is_stored_once() {
    let mut batch = upstream_batch(1);
    batch.grandchildren[1].body = batch.grandchildren[0].body.clone();
    let store = Arc::new(MemoryStore::new());

    let summary = run(&engine(batch, store.clone())).await;

    let rows = store.snapshot().await;
    let first_child = rows.children[0].id;
    let under_first: Vec<_> = rows
        .grandchildren
        .iter()
        .filter(|g| g.child_id == first_child)
        .collect();
    assert_eq!(under_first.len(), 9);
    assert_eq!(summary.grandchildren.existing, 1);
}

#[tokio::test]
async fn second_cycle_finds_grandchild_under_the_resolved_child() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine(upstream_batch(1), store.clone()).with_child_key_policy(ChildKeyPolicy::Plain);

    let first = run(&engine).await;
    let second = run(&engine).await;

    assert_eq!(first.grandchildren.inserted, 100);
    assert_eq!(second.children.existing, 10);
    assert_eq!(second.grandchildren.inserted, 0);
    assert_eq!(second.grandchildren.existing, 100);
    assert_eq!(store.snapshot().await.grandchildren.len(), 100);
}

#[tokio::test]
async fn salted_child_titles_produce_fresh_children_every_cycle() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine(upstream_batch(1), store.clone());

    run(&engine).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = run(&engine).await;

    assert_eq!(second.parents.existing, 1);
    assert_eq!(second.children.inserted, 10);
    assert_eq!(store.snapshot().await.children.len(), 20);
}

#[tokio::test]
async fn failed_child_does_not_stop_its_siblings() {
    let batch = upstream_batch(8);
    // unit i = 7, child j = 3
    let failing_title = batch.children[73].title.clone();
    let store = Arc::new(FaultyStore {
        failing_child_titles: vec![format!("{failing_title}-")],
        ..FaultyStore::default()
    });

    let summary = run(&engine(batch, store.clone())).await;

    assert_eq!(summary.failures.len(), 1);
    let failure = &summary.failures[0];
    assert_eq!((failure.unit, failure.child, failure.grandchild), (7, Some(3), None));
    assert_eq!(failure.level, Some(Level::Child));

    let rows = store.inner.snapshot().await;
    let unit_seven = rows.parents[7].id;
    let titles: Vec<_> = rows
        .children
        .iter()
        .filter(|c| c.parent_id == unit_seven)
        .map(|c| c.title.split('-').next().unwrap_or_default().to_string())
        .collect();
    let expected: Vec<_> = [70, 71, 72, 74, 75, 76, 77, 78, 79]
        .iter()
        .map(|n| format!("post {n}"))
        .collect();
    assert_eq!(titles, expected);
    assert_eq!(rows.children.len(), 79);
    assert_referential_integrity(&rows);
}

#[tokio::test]
async fn failed_grandchild_is_skipped_alone() {
    let store = Arc::new(FaultyStore {
        failing_grandchild_bodies: vec!["comment 4".into()],
        ..FaultyStore::default()
    });

    let summary = run(&engine(upstream_batch(2), store.clone())).await;

    // comment 4 sits in the slice of child j = 0 for both units
    assert_eq!(summary.failures.len(), 2);
    assert!(summary
        .failures
        .iter()
        .all(|f| f.child == Some(0) && f.grandchild == Some(4)));
    assert_eq!(summary.grandchildren.inserted, 2 * 100 - 2);
    assert_referential_integrity(&store.inner.snapshot().await);
}

#[tokio::test]
async fn lookup_failure_skips_the_unit_instead_of_inserting_blindly() {
    let store = Arc::new(FaultyStore {
        failing_parent_lookups: vec!["bot1@cybertron.com".into()],
        ..FaultyStore::default()
    });

    let summary = run(&engine(upstream_batch(3), store.clone())).await;

    assert_eq!(summary.units_attempted, 3);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].unit, 1);
    assert_eq!(summary.failures[0].level, Some(Level::Parent));
    let rows = store.inner.snapshot().await;
    assert_eq!(rows.parents.len(), 2);
    assert!(rows.parents.iter().all(|p| p.email != "bot1@cybertron.com"));
    assert_eq!(rows.children.len(), 20);
    assert_referential_integrity(&rows);
}

#[tokio::test]
async fn failure_on_second_retrieval_aborts_before_any_insert() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("parents.json"),
        r#"[{"name":"Optimus","email":"optimus@cybertron.com"}]"#,
    )
    .unwrap();
    std::fs::write(dir.path().join("grandchildren.json"), "[]").unwrap();
    // children.json is missing

    let store = Arc::new(MemoryStore::new());
    let engine = UpsertEngine::new(Arc::new(FixtureDataSource::new(dir.path())), store.clone());
    let gate = CycleGate::new();

    let outcome = gate.trigger(&engine, &CancellationToken::new()).await;

    assert!(matches!(outcome, TriggerOutcome::Aborted(SyncError::SourceUnavailable(_))));
    assert_eq!(gate.state(), CycleState::Idle);
    assert_eq!(store.snapshot().await, MemorySnapshot::default());
}

#[tokio::test]
async fn sample_fixture_runs_end_to_end() {
    let dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sample");
    let store = Arc::new(MemoryStore::new());
    let engine = UpsertEngine::new(Arc::new(FixtureDataSource::new(dir)), store.clone())
        .with_layout(BatchLayout::default());

    let summary = run(&engine).await;

    assert_eq!(summary.units_attempted, 3);
    assert_eq!(summary.parents.inserted, 3);
    assert_eq!(summary.children.inserted, 30);
    assert_eq!(summary.grandchildren.inserted, 300);
    assert!(summary.failures.is_empty());
    assert_referential_integrity(&store.snapshot().await);
}
