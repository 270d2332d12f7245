//! crates/study_state_core/src/session_manager.rs
//!
//! Tracks each owner's single open study session.
//!
//! The cache maps owner -> `ActiveSessionHandle`. Every read-modify-write runs while holding
//! the owner's slot, so a touch, an explicit end and a janitor sweep for the same owner are
//! applied one at a time and never leave two open sessions behind.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::background::BestEffortWriter;
use crate::cache::{reconcile, KeyedSlots, Reconciled};
use crate::config::StateConfig;
use crate::domain::{ActiveSessionHandle, StudySession};
use crate::ports::{Clock, PortError, PortResult, StudyStore};

pub struct SessionManager {
    store: Arc<dyn StudyStore>,
    clock: Arc<dyn Clock>,
    mirror: BestEffortWriter,
    handles: KeyedSlots<Uuid, ActiveSessionHandle>,
    inactivity_timeout: Duration,
    history_limit: i64,
}

impl SessionManager {
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
            handles: KeyedSlots::new(),
            inactivity_timeout: config.inactivity_timeout,
            history_limit: config.history_limit,
        }
    }

    /// Records activity for `owner_id` and returns the session it was attributed to.
    ///
    /// Within the inactivity timeout the open session is kept (same id, refreshed activity,
    /// possibly a new resource/section). Past it, the old session is closed at its last
    /// activity and a fresh one is opened.
    #[instrument(skip(self))]
    pub async fn touch(
        &self,
        owner_id: Uuid,
        resource_id: Uuid,
        section_id: Option<Uuid>,
    ) -> PortResult<ActiveSessionHandle> {
        require_id(owner_id, "owner_id")?;
        require_id(resource_id, "resource_id")?;

        let mut guard = self.handles.lock(&owner_id).await;
        let slot: &mut Option<ActiveSessionHandle> = &mut guard;
        let now = self.clock.now();
        self.reconcile_owner(slot, owner_id, now).await?;

        if let Some(handle) = slot.as_mut() {
            if handle.idle_for(now) <= self.inactivity_timeout {
                let moved = handle.resource_id != resource_id || handle.section_id != section_id;
                handle.last_activity_at = handle.last_activity_at.max(now);
                handle.resource_id = resource_id;
                handle.section_id = section_id;
                if moved {
                    self.mirror_position(handle);
                }
                return Ok(handle.clone());
            }

            let stale = handle.clone();
            self.close_tolerating_missing(&stale, stale.last_activity_at).await?;
            *slot = None;
            info!(
                session_id = %stale.id,
                idle_secs = stale.idle_for(now).num_seconds(),
                "closed study session after inactivity"
            );
        }

        let handle = self.open(owner_id, resource_id, section_id, now).await?;
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Explicitly starts a fresh session, closing whichever session the owner had open.
    #[instrument(skip(self))]
    pub async fn start(
        &self,
        owner_id: Uuid,
        resource_id: Uuid,
        section_id: Option<Uuid>,
    ) -> PortResult<ActiveSessionHandle> {
        require_id(owner_id, "owner_id")?;
        require_id(resource_id, "resource_id")?;

        let mut guard = self.handles.lock(&owner_id).await;
        let slot: &mut Option<ActiveSessionHandle> = &mut guard;
        let now = self.clock.now();
        self.reconcile_owner(slot, owner_id, now).await?;

        if let Some(previous) = slot.clone() {
            let ended_at = if previous.idle_for(now) > self.inactivity_timeout {
                previous.last_activity_at
            } else {
                now
            };
            self.close_tolerating_missing(&previous, ended_at).await?;
            *slot = None;
        }

        let handle = self.open(owner_id, resource_id, section_id, now).await?;
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Ends the owner's open session (or the given one) and returns the closed row.
    ///
    /// The cached handle is only dropped after the durable close succeeded, so a failed
    /// write leaves the session active and the call can be retried.
    #[instrument(skip(self))]
    pub async fn end(&self, owner_id: Uuid, session_id: Option<Uuid>) -> PortResult<StudySession> {
        require_id(owner_id, "owner_id")?;

        let mut guard = self.handles.lock(&owner_id).await;
        let slot: &mut Option<ActiveSessionHandle> = &mut guard;
        let now = self.clock.now();

        let cached = slot
            .as_ref()
            .filter(|h| session_id.map_or(true, |id| id == h.id))
            .map(|h| (h.id, h.started_at));
        let (target_id, started_at) = match cached {
            Some(target) => target,
            None => {
                let session = self.open_durable_session(owner_id, session_id).await?;
                (session.id, session.started_at)
            }
        };

        match self
            .store
            .close_study_session(target_id, now, elapsed_seconds(started_at, now))
            .await
        {
            Ok(closed) => {
                if slot.as_ref().is_some_and(|h| h.id == target_id) {
                    *slot = None;
                }
                info!(session_id = %closed.id, duration_secs = ?closed.duration_seconds, "study session ended");
                Ok(closed)
            }
            Err(PortError::NotFound(message)) => {
                // Closed behind our back; the cached handle is stale either way.
                if slot.as_ref().is_some_and(|h| h.id == target_id) {
                    *slot = None;
                }
                Err(PortError::NotFound(message))
            }
            Err(e) => Err(e),
        }
    }

    /// The owner's open session, reconciled from the durable store on a cache miss.
    pub async fn get_active_session(&self, owner_id: Uuid) -> PortResult<Option<ActiveSessionHandle>> {
        require_id(owner_id, "owner_id")?;
        let mut guard = self.handles.lock(&owner_id).await;
        let slot: &mut Option<ActiveSessionHandle> = &mut guard;
        self.reconcile_owner(slot, owner_id, self.clock.now()).await?;
        Ok(slot.clone())
    }

    /// Time since the cached session started. Cache only: no durable fallback.
    pub async fn get_duration_estimate(&self, owner_id: Uuid) -> Option<Duration> {
        let handle = self.handles.snapshot(&owner_id).await?;
        Some(self.clock.now() - handle.started_at)
    }

    /// The owner's study sessions, newest first.
    pub async fn get_session_history(
        &self,
        owner_id: Uuid,
        limit: Option<i64>,
    ) -> PortResult<Vec<StudySession>> {
        require_id(owner_id, "owner_id")?;
        let limit = limit.unwrap_or(self.history_limit).clamp(1, self.history_limit.max(1));
        self.store.list_study_sessions(owner_id, limit).await
    }

    /// Force-closes every cached session idle beyond the timeout. Returns how many closed.
    ///
    /// Failed closes are logged and the handle is kept for the next sweep.
    pub async fn cleanup_stale(&self) -> usize {
        let mut closed = 0;
        for owner_id in self.handles.keys() {
            let Some(mut guard) = self.handles.lock_existing(&owner_id).await else {
                continue;
            };
            let slot: &mut Option<ActiveSessionHandle> = &mut guard;
            let now = self.clock.now();
            let Some(stale) = slot
                .as_ref()
                .filter(|h| h.idle_for(now) > self.inactivity_timeout)
                .cloned()
            else {
                continue;
            };

            match self.close_tolerating_missing(&stale, stale.last_activity_at).await {
                Ok(()) => {
                    *slot = None;
                    closed += 1;
                    info!(owner_id = %owner_id, session_id = %stale.id, "janitor closed idle study session");
                }
                Err(e) => {
                    warn!(owner_id = %owner_id, session_id = %stale.id, error = %e, "failed to close idle study session");
                }
            }
        }
        closed
    }

    /// Drops empty per-owner slots.
    pub fn prune(&self) -> usize {
        self.handles.prune()
    }

    pub fn cached_sessions(&self) -> usize {
        self.handles.occupied()
    }

    //=====================================================================================
    // Helpers
    //=====================================================================================

    async fn reconcile_owner(
        &self,
        slot: &mut Option<ActiveSessionHandle>,
        owner_id: Uuid,
        now: DateTime<Utc>,
    ) -> PortResult<Reconciled> {
        let store = self.store.clone();
        let outcome = reconcile(slot, || async move {
            let open = store.find_open_study_session(owner_id).await?;
            Ok::<_, PortError>(open.map(|session| ActiveSessionHandle::adopt(&session, now)))
        })
        .await?;
        if outcome == Reconciled::Loaded {
            debug!(owner_id = %owner_id, "adopted open study session from the durable store");
        }
        Ok(outcome)
    }

    async fn open(
        &self,
        owner_id: Uuid,
        resource_id: Uuid,
        section_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> PortResult<ActiveSessionHandle> {
        let created = self
            .store
            .create_study_session(owner_id, resource_id, section_id, now)
            .await?;
        info!(owner_id = %owner_id, session_id = %created.id, "study session started");
        Ok(ActiveSessionHandle::adopt(&created, now))
    }

    /// Closes a cached session. A row that is already closed counts as success.
    async fn close_tolerating_missing(
        &self,
        handle: &ActiveSessionHandle,
        ended_at: DateTime<Utc>,
    ) -> PortResult<()> {
        let duration = elapsed_seconds(handle.started_at, ended_at);
        match self.store.close_study_session(handle.id, ended_at, duration).await {
            Ok(_) => Ok(()),
            Err(PortError::NotFound(_)) => {
                debug!(session_id = %handle.id, "study session was already closed durably");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn open_durable_session(
        &self,
        owner_id: Uuid,
        session_id: Option<Uuid>,
    ) -> PortResult<StudySession> {
        match session_id {
            Some(id) => {
                let session = self.store.get_study_session(id).await?;
                if session.owner_id != owner_id {
                    return Err(PortError::Unauthorized);
                }
                if !session.is_open() {
                    return Err(PortError::NotFound(format!("Study session {} is already closed", id)));
                }
                Ok(session)
            }
            None => self
                .store
                .find_open_study_session(owner_id)
                .await?
                .ok_or_else(|| {
                    PortError::NotFound(format!("No open study session for owner {}", owner_id))
                }),
        }
    }

    fn mirror_position(&self, handle: &ActiveSessionHandle) {
        let store = self.store.clone();
        let (id, resource_id, section_id) = (handle.id, handle.resource_id, handle.section_id);
        self.mirror.spawn("study_session_position", async move {
            store.update_study_session_position(id, resource_id, section_id).await
        });
    }
}

pub(crate) fn require_id(id: Uuid, field: &str) -> PortResult<()> {
    if id.is_nil() {
        return Err(PortError::Validation(format!("{} is required", field)));
    }
    Ok(())
}

fn elapsed_seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_seconds().max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::ports::ManualClock;
    use chrono::TimeZone;
    use futures::future::join_all;

    struct Fixture {
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
        mirror: BestEffortWriter,
        manager: Arc<SessionManager>,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let mirror = BestEffortWriter::new();
        let manager = Arc::new(SessionManager::new(
            store.clone(),
            clock.clone(),
            mirror.clone(),
            &StateConfig::default(),
        ));
        Fixture { store, clock, mirror, manager }
    }

    impl Fixture {
        fn restarted(&self) -> SessionManager {
            SessionManager::new(
                self.store.clone(),
                self.clock.clone(),
                self.mirror.clone(),
                &StateConfig::default(),
            )
        }
    }

    #[tokio::test]
    async fn touch_within_timeout_keeps_the_session_and_past_it_rolls_over() {
        let f = fixture();
        let owner = Uuid::new_v4();
        let (r1, r2) = (Uuid::new_v4(), Uuid::new_v4());

        let s1 = f.manager.touch(owner, r1, None).await.unwrap();
        assert_eq!(s1.started_at, t0());

        f.clock.advance(Duration::seconds(100));
        let again = f.manager.touch(owner, r1, None).await.unwrap();
        assert_eq!(again.id, s1.id);
        assert_eq!(again.last_activity_at, t0() + Duration::seconds(100));

        f.clock.advance(Duration::seconds(400));
        let s2 = f.manager.touch(owner, r2, None).await.unwrap();
        assert_ne!(s2.id, s1.id);
        assert_eq!(s2.started_at, t0() + Duration::seconds(500));
        assert_eq!(s2.resource_id, r2);

        let closed = f.store.get_study_session(s1.id).await.unwrap();
        assert_eq!(closed.duration_seconds, Some(100));
        assert_eq!(closed.ended_at, Some(t0() + Duration::seconds(100)));
        assert_eq!(f.store.open_study_sessions(owner).len(), 1);
    }

    #[tokio::test]
    async fn touch_never_moves_last_activity_backwards() {
        let f = fixture();
        let owner = Uuid::new_v4();
        let resource = Uuid::new_v4();

        f.clock.advance(Duration::seconds(30));
        let first = f.manager.touch(owner, resource, None).await.unwrap();
        f.clock.set(t0());
        let second = f.manager.touch(owner, resource, None).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.last_activity_at, first.last_activity_at);
    }

    #[tokio::test]
    async fn touch_switches_resource_in_place_and_mirrors_it() {
        let f = fixture();
        let owner = Uuid::new_v4();
        let (r1, r2, section) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let s1 = f.manager.touch(owner, r1, None).await.unwrap();
        let moved = f.manager.touch(owner, r2, Some(section)).await.unwrap();
        assert_eq!(moved.id, s1.id);
        assert_eq!(moved.resource_id, r2);

        f.mirror.settle().await;
        let durable = f.store.get_study_session(s1.id).await.unwrap();
        assert_eq!(durable.resource_id, r2);
        assert_eq!(durable.section_id, Some(section));
    }

    #[tokio::test]
    async fn touch_adopts_an_open_session_after_restart() {
        let f = fixture();
        let owner = Uuid::new_v4();
        let resource = Uuid::new_v4();
        let original = f.manager.touch(owner, resource, None).await.unwrap();

        let restarted = f.restarted();
        f.clock.advance(Duration::seconds(10));
        let adopted = restarted.touch(owner, resource, None).await.unwrap();
        assert_eq!(adopted.id, original.id);
        assert_eq!(f.store.open_study_sessions(owner).len(), 1);
    }

    #[tokio::test]
    async fn touch_rejects_missing_identifiers() {
        let f = fixture();
        let err = f.manager.touch(Uuid::nil(), Uuid::new_v4(), None).await.unwrap_err();
        assert!(matches!(err, PortError::Validation(_)));
        let err = f.manager.touch(Uuid::new_v4(), Uuid::nil(), None).await.unwrap_err();
        assert!(matches!(err, PortError::Validation(_)));
        assert_eq!(f.store.read_count(), 0);
    }

    #[tokio::test]
    async fn end_closes_the_cached_session_with_its_duration() {
        let f = fixture();
        let owner = Uuid::new_v4();
        let session = f.manager.touch(owner, Uuid::new_v4(), None).await.unwrap();

        f.clock.advance(Duration::seconds(42));
        let closed = f.manager.end(owner, None).await.unwrap();
        assert_eq!(closed.id, session.id);
        assert_eq!(closed.duration_seconds, Some(42));
        assert!(f.manager.get_duration_estimate(owner).await.is_none());

        let err = f.manager.end(owner, None).await.unwrap_err();
        assert!(matches!(err, PortError::NotFound(_)));
    }

    #[tokio::test]
    async fn end_falls_back_to_the_durable_store() {
        let f = fixture();
        let owner = Uuid::new_v4();
        let session = f.manager.touch(owner, Uuid::new_v4(), None).await.unwrap();

        let restarted = f.restarted();
        f.clock.advance(Duration::seconds(7));
        let closed = restarted.end(owner, Some(session.id)).await.unwrap();
        assert_eq!(closed.duration_seconds, Some(7));
        assert!(f.store.open_study_sessions(owner).is_empty());
    }

    #[tokio::test]
    async fn end_refuses_another_owners_session() {
        let f = fixture();
        let owner = Uuid::new_v4();
        let intruder = Uuid::new_v4();
        let session = f.manager.touch(owner, Uuid::new_v4(), None).await.unwrap();

        let err = f.manager.end(intruder, Some(session.id)).await.unwrap_err();
        assert_eq!(err, PortError::Unauthorized);
        assert_eq!(f.store.open_study_sessions(owner).len(), 1);
    }

    #[tokio::test]
    async fn failed_close_keeps_the_session_active_for_a_retry() {
        let f = fixture();
        let owner = Uuid::new_v4();
        let session = f.manager.touch(owner, Uuid::new_v4(), None).await.unwrap();

        f.store.set_fail_writes(true);
        let err = f.manager.end(owner, None).await.unwrap_err();
        assert!(matches!(err, PortError::Persistence(_)));
        let still_active = f.manager.get_active_session(owner).await.unwrap().unwrap();
        assert_eq!(still_active.id, session.id);

        f.store.set_fail_writes(false);
        let closed = f.manager.end(owner, None).await.unwrap();
        assert_eq!(closed.id, session.id);
    }

    #[tokio::test]
    async fn start_replaces_the_open_session() {
        let f = fixture();
        let owner = Uuid::new_v4();
        let first = f.manager.touch(owner, Uuid::new_v4(), None).await.unwrap();

        f.clock.advance(Duration::seconds(20));
        let second = f.manager.start(owner, Uuid::new_v4(), None).await.unwrap();
        assert_ne!(second.id, first.id);
        let closed = f.store.get_study_session(first.id).await.unwrap();
        assert_eq!(closed.duration_seconds, Some(20));
        assert_eq!(f.store.open_study_sessions(owner).len(), 1);
    }

    #[tokio::test]
    async fn duration_estimate_is_cache_only() {
        let f = fixture();
        let owner = Uuid::new_v4();
        f.manager.touch(owner, Uuid::new_v4(), None).await.unwrap();
        f.clock.advance(Duration::seconds(90));
        assert_eq!(
            f.manager.get_duration_estimate(owner).await,
            Some(Duration::seconds(90))
        );

        let reads_before = f.store.read_count();
        assert!(f.restarted().get_duration_estimate(owner).await.is_none());
        assert_eq!(f.store.read_count(), reads_before);
    }

    #[tokio::test]
    async fn cleanup_stale_closes_only_idle_sessions() {
        let f = fixture();
        let (idle, busy) = (Uuid::new_v4(), Uuid::new_v4());
        let idle_session = f.manager.touch(idle, Uuid::new_v4(), None).await.unwrap();
        f.clock.advance(Duration::seconds(250));
        f.manager.touch(busy, Uuid::new_v4(), None).await.unwrap();
        f.clock.advance(Duration::seconds(100));

        assert_eq!(f.manager.cleanup_stale().await, 1);
        let closed = f.store.get_study_session(idle_session.id).await.unwrap();
        assert_eq!(closed.duration_seconds, Some(0));
        assert!(f.manager.get_duration_estimate(idle).await.is_none());
        assert!(f.manager.get_duration_estimate(busy).await.is_some());
        assert_eq!(f.manager.prune(), 1);
    }

    #[tokio::test]
    async fn history_lists_newest_first() {
        let f = fixture();
        let owner = Uuid::new_v4();
        let first = f.manager.touch(owner, Uuid::new_v4(), None).await.unwrap();
        f.clock.advance(Duration::seconds(10));
        let second = f.manager.start(owner, Uuid::new_v4(), None).await.unwrap();

        let history = f.manager.get_session_history(owner, None).await.unwrap();
        let ids: Vec<Uuid> = history.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_touches_share_one_session() {
        let f = fixture();
        let owner = Uuid::new_v4();
        let resource = Uuid::new_v4();

        let calls = (0..32).map(|_| {
            let manager = f.manager.clone();
            tokio::spawn(async move { manager.touch(owner, resource, None).await })
        });
        let results = join_all(calls).await;
        let ids: std::collections::HashSet<Uuid> = results
            .into_iter()
            .map(|r| r.unwrap().unwrap().id)
            .collect();
        assert_eq!(ids.len(), 1);
        assert_eq!(f.store.open_study_sessions(owner).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_touch_and_end_never_leave_two_open_sessions() {
        let f = fixture();
        let owner = Uuid::new_v4();
        let resource = Uuid::new_v4();

        let calls = (0..40).map(|i| {
            let manager = f.manager.clone();
            tokio::spawn(async move {
                if i % 3 == 0 {
                    manager.end(owner, None).await.map(|_| ())
                } else {
                    manager.touch(owner, resource, None).await.map(|_| ())
                }
            })
        });
        for result in join_all(calls).await {
            match result.unwrap() {
                Ok(()) | Err(PortError::NotFound(_)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(f.store.open_study_sessions(owner).len() <= 1);
    }
}
