//! crates/study_state_core/src/context_tracker.rs
//!
//! Tracks each owner's single "current viewing position".
//!
//! The cache is authoritative for "current": updates land in the cache synchronously and
//! are mirrored to the durable store in the background. Mirror writes and `clear_context`
//! for one owner run through a per-owner lane (lane lock first, then the cache slot), so a
//! late mirror can neither resurrect a cleared row nor overwrite a newer one.

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::background::BestEffortWriter;
use crate::cache::{reconcile, KeyedSlots};
use crate::config::StateConfig;
use crate::domain::{ContextPosition, StudyContext};
use crate::ports::{Clock, PortError, PortResult, StudyStore};
use crate::session_manager::require_id;

#[derive(Debug, Clone)]
struct CachedContext {
    context: StudyContext,
    /// Bumped on every update; a mirror write only persists the revision it was spawned for.
    revision: u64,
    /// Whether this revision is known to be in the durable store.
    mirrored: bool,
}

pub struct ContextTracker {
    store: Arc<dyn StudyStore>,
    clock: Arc<dyn Clock>,
    mirror: BestEffortWriter,
    contexts: Arc<KeyedSlots<Uuid, CachedContext>>,
    lanes: Arc<KeyedSlots<Uuid, ()>>,
    revisions: AtomicU64,
    cache_ttl: Duration,
}

impl ContextTracker {
    pub fn new(
        store: Arc<dyn StudyStore>,
        clock: Arc<dyn Clock>,
        mirror: BestEffortWriter,
        config: &StateConfig,
    ) -> Self {
        Self {
            store,
            clock,
            mirror,
            contexts: Arc::new(KeyedSlots::new()),
            lanes: Arc::new(KeyedSlots::new()),
            revisions: AtomicU64::new(0),
            cache_ttl: config.context_cache_ttl,
        }
    }

    /// Overwrites the owner's context and returns the new snapshot.
    ///
    /// The durable upsert is scheduled, not awaited; its failure never touches the cache.
    #[instrument(skip(self, position))]
    pub async fn update_context(
        &self,
        owner_id: Uuid,
        resource_id: Uuid,
        position: ContextPosition,
    ) -> PortResult<StudyContext> {
        require_id(owner_id, "owner_id")?;
        require_id(resource_id, "resource_id")?;
        validate_position(&position)?;

        let context = {
            let mut guard = self.contexts.lock(&owner_id).await;
            let now = self.clock.now();
            let revision = self.revisions.fetch_add(1, Ordering::Relaxed) + 1;
            let context = StudyContext {
                owner_id,
                resource_id,
                page_number: position.page_number,
                timestamp_seconds: position.timestamp_seconds,
                metadata: position.metadata,
                last_activity_at: now,
                updated_at: now,
            };
            *guard = Some(CachedContext {
                context: context.clone(),
                revision,
                mirrored: false,
            });
            self.schedule_mirror(owner_id, revision);
            context
        };

        debug!(owner_id = %owner_id, "study context updated");
        Ok(context)
    }

    /// The owner's current context: the cached value, or the durable row on a miss.
    pub async fn get_current_context(&self, owner_id: Uuid) -> PortResult<Option<StudyContext>> {
        require_id(owner_id, "owner_id")?;

        let mut guard = self.contexts.lock(&owner_id).await;
        let slot: &mut Option<CachedContext> = &mut guard;
        let store = self.store.clone();
        let revision = self.revisions.fetch_add(1, Ordering::Relaxed) + 1;
        reconcile(slot, || async move {
            let row = store.get_study_context(owner_id).await?;
            Ok::<_, PortError>(row.map(|context| CachedContext {
                context,
                revision,
                mirrored: true,
            }))
        })
        .await?;
        Ok(slot.as_ref().map(|cached| cached.context.clone()))
    }

    /// Removes the cache entry and the durable row. Clearing nothing is not an error.
    #[instrument(skip(self))]
    pub async fn clear_context(&self, owner_id: Uuid) -> PortResult<()> {
        require_id(owner_id, "owner_id")?;

        let _lane = self.lanes.lock(&owner_id).await;
        self.store.delete_study_context(owner_id).await?;
        if let Some(mut guard) = self.contexts.lock_existing(&owner_id).await {
            *guard = None;
        }
        info!(owner_id = %owner_id, "study context cleared");
        Ok(())
    }

    /// Time since the cached context was last updated. Cache only.
    pub async fn get_context_age(&self, owner_id: Uuid) -> Option<Duration> {
        let cached = self.contexts.snapshot(&owner_id).await?;
        Some(self.clock.now() - cached.context.last_activity_at)
    }

    /// Drops cached contexts that are already durable and idle beyond the cache TTL.
    pub async fn evict_idle(&self) -> usize {
        let mut evicted = 0;
        for owner_id in self.contexts.keys() {
            let Some(mut guard) = self.contexts.lock_existing(&owner_id).await else {
                continue;
            };
            let now = self.clock.now();
            let expired = (*guard)
                .as_ref()
                .is_some_and(|cached| cached.mirrored && idle_since(cached, now) > self.cache_ttl);
            if expired {
                *guard = None;
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, "evicted idle study contexts");
        }
        evicted
    }

    pub fn prune(&self) -> usize {
        self.contexts.prune() + self.lanes.prune()
    }

    pub fn cached_contexts(&self) -> usize {
        self.contexts.occupied()
    }

    fn schedule_mirror(&self, owner_id: Uuid, revision: u64) {
        let store = self.store.clone();
        let contexts = self.contexts.clone();
        let lanes = self.lanes.clone();
        self.mirror.spawn("study_context_upsert", async move {
            let _lane = lanes.lock(&owner_id).await;

            let pending = contexts
                .snapshot(&owner_id)
                .await
                .filter(|cached| cached.revision == revision)
                .map(|cached| cached.context);
            // Superseded by a newer update (whose own mirror will write) or cleared.
            let Some(context) = pending else {
                return Ok(());
            };

            store.upsert_study_context(&context).await?;

            if let Some(mut guard) = contexts.lock_existing(&owner_id).await {
                if let Some(cached) = (*guard).as_mut().filter(|c| c.revision == revision) {
                    cached.mirrored = true;
                }
            }
            Ok(())
        });
    }
}

fn idle_since(cached: &CachedContext, now: DateTime<Utc>) -> Duration {
    now - cached.context.last_activity_at
}

fn validate_position(position: &ContextPosition) -> PortResult<()> {
    if position.page_number.is_some_and(|page| page < 0) {
        return Err(PortError::Validation("page_number must not be negative".to_string()));
    }
    if position
        .timestamp_seconds
        .is_some_and(|ts| !ts.is_finite() || ts < 0.0)
    {
        return Err(PortError::Validation(
            "timestamp_seconds must be a non-negative number".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::ports::ManualClock;
    use chrono::TimeZone;
    use serde_json::json;

    struct Fixture {
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
        mirror: BestEffortWriter,
        tracker: ContextTracker,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
        ));
        let mirror = BestEffortWriter::new();
        let tracker = ContextTracker::new(
            store.clone(),
            clock.clone(),
            mirror.clone(),
            &StateConfig::default(),
        );
        Fixture { store, clock, mirror, tracker }
    }

    fn page(n: i32) -> ContextPosition {
        ContextPosition {
            page_number: Some(n),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn update_is_visible_before_the_durable_write() {
        let f = fixture();
        let (owner, resource) = (Uuid::new_v4(), Uuid::new_v4());

        f.tracker.update_context(owner, resource, page(3)).await.unwrap();
        let reads_before = f.store.read_count();
        let current = f.tracker.get_current_context(owner).await.unwrap().unwrap();
        assert_eq!(current.resource_id, resource);
        assert_eq!(current.page_number, Some(3));
        assert_eq!(f.store.read_count(), reads_before);
    }

    #[tokio::test]
    async fn update_is_mirrored_to_the_durable_store() {
        let f = fixture();
        let (owner, resource) = (Uuid::new_v4(), Uuid::new_v4());

        for n in 1..=5 {
            f.tracker.update_context(owner, resource, page(n)).await.unwrap();
        }
        f.mirror.settle().await;

        let row = f.store.get_study_context(owner).await.unwrap().unwrap();
        assert_eq!(row.page_number, Some(5));
        assert_eq!(f.mirror.failure_count(), 0);
    }

    #[tokio::test]
    async fn mirror_failures_are_logged_and_the_cache_stands() {
        let f = fixture();
        let (owner, resource) = (Uuid::new_v4(), Uuid::new_v4());
        f.store.set_fail_writes(true);

        let position = ContextPosition {
            page_number: Some(8),
            timestamp_seconds: Some(12.5),
            metadata: json!({"zoom": 1.5}),
        };
        let snapshot = f.tracker.update_context(owner, resource, position).await.unwrap();
        f.mirror.settle().await;

        assert_eq!(f.mirror.failure_count(), 1);
        let current = f.tracker.get_current_context(owner).await.unwrap().unwrap();
        assert_eq!(current, snapshot);
        assert_eq!(current.metadata["zoom"], json!(1.5));
    }

    #[tokio::test]
    async fn cache_miss_loads_the_latest_durable_row() {
        let f = fixture();
        let (owner, resource) = (Uuid::new_v4(), Uuid::new_v4());
        f.tracker.update_context(owner, resource, page(11)).await.unwrap();
        f.mirror.settle().await;

        let restarted = ContextTracker::new(
            f.store.clone(),
            f.clock.clone(),
            f.mirror.clone(),
            &StateConfig::default(),
        );
        let loaded = restarted.get_current_context(owner).await.unwrap().unwrap();
        assert_eq!(loaded.page_number, Some(11));
        assert!(restarted.get_current_context(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_removes_cache_and_durable_row() {
        let f = fixture();
        let (owner, resource) = (Uuid::new_v4(), Uuid::new_v4());
        f.tracker.update_context(owner, resource, page(2)).await.unwrap();
        f.mirror.settle().await;

        f.tracker.clear_context(owner).await.unwrap();
        assert!(f.tracker.get_context_age(owner).await.is_none());
        assert!(f.store.get_study_context(owner).await.unwrap().is_none());
        assert!(f.tracker.get_current_context(owner).await.unwrap().is_none());

        f.tracker.clear_context(owner).await.unwrap();
    }

    #[tokio::test]
    async fn pending_mirror_does_not_resurrect_a_cleared_context() {
        let f = fixture();
        let (owner, resource) = (Uuid::new_v4(), Uuid::new_v4());

        f.tracker.update_context(owner, resource, page(4)).await.unwrap();
        f.tracker.clear_context(owner).await.unwrap();
        f.mirror.settle().await;

        assert!(f.store.get_study_context(owner).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_clear_keeps_the_cached_context() {
        let f = fixture();
        let (owner, resource) = (Uuid::new_v4(), Uuid::new_v4());
        f.tracker.update_context(owner, resource, page(6)).await.unwrap();
        f.mirror.settle().await;

        f.store.set_fail_writes(true);
        let err = f.tracker.clear_context(owner).await.unwrap_err();
        assert!(matches!(err, PortError::Persistence(_)));
        assert!(f.tracker.get_context_age(owner).await.is_some());
    }

    #[tokio::test]
    async fn context_age_is_cache_only() {
        let f = fixture();
        let (owner, resource) = (Uuid::new_v4(), Uuid::new_v4());
        assert!(f.tracker.get_context_age(owner).await.is_none());

        f.tracker.update_context(owner, resource, page(1)).await.unwrap();
        f.clock.advance(Duration::seconds(45));
        assert_eq!(
            f.tracker.get_context_age(owner).await,
            Some(Duration::seconds(45))
        );
    }

    #[tokio::test]
    async fn eviction_skips_contexts_not_yet_mirrored() {
        let f = fixture();
        let (mirrored, unmirrored) = (Uuid::new_v4(), Uuid::new_v4());
        f.tracker.update_context(mirrored, Uuid::new_v4(), page(1)).await.unwrap();
        f.mirror.settle().await;

        f.store.set_fail_writes(true);
        f.tracker.update_context(unmirrored, Uuid::new_v4(), page(1)).await.unwrap();
        f.mirror.settle().await;
        f.store.set_fail_writes(false);

        f.clock.advance(Duration::hours(2));
        assert_eq!(f.tracker.evict_idle().await, 1);
        assert!(f.tracker.get_context_age(mirrored).await.is_none());
        assert!(f.tracker.get_context_age(unmirrored).await.is_some());

        let reloaded = f.tracker.get_current_context(mirrored).await.unwrap().unwrap();
        assert_eq!(reloaded.page_number, Some(1));
    }

    #[tokio::test]
    async fn invalid_positions_are_rejected() {
        let f = fixture();
        let err = f
            .tracker
            .update_context(Uuid::new_v4(), Uuid::new_v4(), page(-1))
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::Validation(_)));

        let err = f
            .tracker
            .update_context(Uuid::nil(), Uuid::new_v4(), page(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::Validation(_)));
        assert_eq!(f.tracker.cached_contexts(), 0);
    }
}
