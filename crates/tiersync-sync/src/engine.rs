use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tiersync_core::{BatchLayout, ChildKeyPolicy, ChildRecord, Level, NaturalKey, ParentRecord, RowId};
use tiersync_source::{DataSource, SourceBatch};
use tiersync_storage::{HierarchyStore, StoreError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{IdentityResolver, Resolution, SyncConfig, SyncError};

/// Result of resolving a record and inserting it only when absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    Inserted(RowId),
    Existing(RowId),
}

impl Upserted {
    pub fn id(&self) -> RowId {
        match self {
            Upserted::Inserted(id) | Upserted::Existing(id) => *id,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LevelCounts {
    pub inserted: usize,
    pub existing: usize,
}

impl LevelCounts {
    fn record(&mut self, outcome: Upserted) {
        match outcome {
            Upserted::Inserted(_) => self.inserted += 1,
            Upserted::Existing(_) => self.existing += 1,
        }
    }
}

/// A unit, child or grandchild that was skipped. Positions are batch-relative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub unit: usize,
    pub child: Option<usize>,
    pub grandchild: Option<usize>,
    pub level: Option<Level>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source: String,
    pub batch_digest: String,
    pub units_attempted: usize,
    pub parents: LevelCounts,
    pub children: LevelCounts,
    pub grandchildren: LevelCounts,
    pub failures: Vec<UnitFailure>,
    pub cancelled: bool,
}

impl CycleSummary {
    fn new(run_id: Uuid, started_at: DateTime<Utc>, source: &str, batch_digest: String) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            source: source.to_string(),
            batch_digest,
            units_attempted: 0,
            parents: LevelCounts::default(),
            children: LevelCounts::default(),
            grandchildren: LevelCounts::default(),
            failures: Vec::new(),
            cancelled: false,
        }
    }

    fn record_failure(
        &mut self,
        unit: usize,
        child: Option<usize>,
        grandchild: Option<usize>,
        err: &SyncError,
    ) {
        self.failures.push(UnitFailure {
            unit,
            child,
            grandchild,
            level: err.level(),
            error: err.to_string(),
        });
    }
}

/// Drives one fetch -> resolve -> insert cycle across the three levels.
///
/// A parent is always stored (or found) before its children are touched, and
/// a child before its grandchildren, so no insert ever references a row that
/// does not exist yet.
pub struct UpsertEngine {
    source: Arc<dyn DataSource>,
    store: Arc<dyn HierarchyStore>,
    layout: BatchLayout,
    child_keys: ChildKeyPolicy,
}

impl UpsertEngine {
    pub fn new(source: Arc<dyn DataSource>, store: Arc<dyn HierarchyStore>) -> Self {
        Self {
            source,
            store,
            layout: BatchLayout::default(),
            child_keys: ChildKeyPolicy::default(),
        }
    }

    pub fn from_config(config: &SyncConfig, store: Arc<dyn HierarchyStore>) -> anyhow::Result<Self> {
        Ok(Self::new(config.data_source()?, store)
            .with_layout(config.layout)
            .with_child_key_policy(config.child_key_policy))
    }

    pub fn with_layout(mut self, layout: BatchLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_child_key_policy(mut self, policy: ChildKeyPolicy) -> Self {
        self.child_keys = policy;
        self
    }

    /// Run one cycle. Only a failed fetch aborts; per-unit errors are recorded
    /// in the summary. `cancel` is checked between units.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_cycle", %run_id, source = self.source.name());
        self.run_cycle_inner(run_id, cancel).instrument(span).await
    }

    async fn run_cycle_inner(
        &self,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<CycleSummary, SyncError> {
        let started_at = Utc::now();
        let batch = self.source.fetch_batch().await?;
        info!(
            parents = batch.parents.len(),
            children = batch.children.len(),
            grandchildren = batch.grandchildren.len(),
            digest = %batch.digest,
            "fetched batch"
        );

        let mut summary = CycleSummary::new(run_id, started_at, self.source.name(), batch.digest.clone());
        for unit in 0..self.layout.units_per_cycle {
            if cancel.is_cancelled() {
                warn!(unit, "cycle cancelled before unit");
                summary.cancelled = true;
                break;
            }
            let Some(parent) = batch.parents.get(unit) else {
                debug!(unit, "parent batch exhausted");
                break;
            };

            summary.units_attempted += 1;
            if let Err(err) = self.sync_unit(&batch, &mut summary, unit, parent).await {
                warn!(unit, error = %err, "skipping unit");
                summary.record_failure(unit, None, None, &err);
            }
        }

        summary.finished_at = Utc::now();
        info!(
            units = summary.units_attempted,
            parents_inserted = summary.parents.inserted,
            parents_existing = summary.parents.existing,
            children_inserted = summary.children.inserted,
            grandchildren_inserted = summary.grandchildren.inserted,
            grandchildren_existing = summary.grandchildren.existing,
            failures = summary.failures.len(),
            cancelled = summary.cancelled,
            "sync cycle finished"
        );
        Ok(summary)
    }

    async fn sync_unit(
        &self,
        batch: &SourceBatch,
        summary: &mut CycleSummary,
        unit: usize,
        parent: &ParentRecord,
    ) -> Result<(), SyncError> {
        let key = NaturalKey::Parent { email: &parent.email };
        let outcome = self.upsert(key, self.store.insert_parent(parent)).await?;
        summary.parents.record(outcome);
        let parent_id = outcome.id();

        for j in 0..self.layout.children_per_parent {
            let index = self.layout.child_index(unit, j);
            let Some(child) = index.and_then(|i| batch.children.get(i)) else {
                debug!(unit, ?index, "child batch exhausted");
                break;
            };
            if let Err(err) = self.sync_child(batch, summary, unit, j, parent_id, child).await {
                warn!(unit, child = j, error = %err, "skipping child");
                summary.record_failure(unit, Some(j), None, &err);
            }
        }
        Ok(())
    }

    async fn sync_child(
        &self,
        batch: &SourceBatch,
        summary: &mut CycleSummary,
        unit: usize,
        j: usize,
        parent_id: RowId,
        child: &ChildRecord,
    ) -> Result<(), SyncError> {
        let title = self.child_keys.stored_title(&child.title, summary.started_at);
        let key = NaturalKey::Child {
            parent_id,
            title: &title,
        };
        let outcome = self
            .upsert(key, self.store.insert_child(parent_id, &title, &child.body))
            .await?;
        summary.children.record(outcome);
        let child_id = outcome.id();

        for k in 0..self.layout.grandchildren_per_child {
            let index = self.layout.grandchild_index(j, k);
            let Some(grandchild) = index.and_then(|i| batch.grandchildren.get(i)) else {
                debug!(unit, child = j, ?index, "grandchild batch exhausted");
                break;
            };
            let key = NaturalKey::Grandchild {
                child_id,
                body: &grandchild.body,
            };
            match self
                .upsert(key, self.store.insert_grandchild(child_id, grandchild))
                .await
            {
                Ok(outcome) => summary.grandchildren.record(outcome),
                Err(err) => {
                    warn!(unit, child = j, grandchild = k, error = %err, "skipping grandchild");
                    summary.record_failure(unit, Some(j), Some(k), &err);
                }
            }
        }
        Ok(())
    }

    /// Resolve `key`; the insert future is only polled when nothing matches.
    async fn upsert<F>(&self, key: NaturalKey<'_>, insert: F) -> Result<Upserted, SyncError>
    where
        F: Future<Output = Result<RowId, StoreError>>,
    {
        match IdentityResolver::new(self.store.as_ref()).resolve(&key).await? {
            Resolution::Found(id) => Ok(Upserted::Existing(id)),
            Resolution::NotFound => insert
                .await
                .map(Upserted::Inserted)
                .map_err(|source| SyncError::InsertFailed {
                    level: key.level(),
                    source,
                }),
        }
    }
}
