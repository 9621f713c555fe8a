//! Instance registry and per-PR lifecycle management.

pub mod interpreter;

use chrono::{DateTime, Utc};
use sitebot_core::{
    plan, transition, Event, InstanceData, InstanceError, InstanceRecord, InstanceState,
    PortAllocator, PrAction, PrId, TransitionResult,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{OwnedMutexGuard, RwLock};
use tracing::{error, info, warn};

use crate::builder::SiteBuilder;
use crate::comments::{template_ids, CommentComposer};
use crate::dispatch::{DelayedScheduler, TaskSeq};
use crate::github::CommentTarget;
use interpreter::{execute_effects, InterpreterContext};

/// Records and the port pool behind one lock, so that allocate-then-insert
/// and release-then-delete are each a single critical section.
pub struct InstanceRegistry {
    inner: RwLock<RegistryInner>,
}

struct RegistryInner {
    records: HashMap<PrId, InstanceRecord>,
    ports: PortAllocator,
    block_size: usize,
}

impl InstanceRegistry {
    pub fn new(ports: PortAllocator, block_size: usize) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                records: HashMap::new(),
                ports,
                block_size,
            }),
        }
    }

    pub async fn contains(&self, pr: PrId) -> bool {
        self.inner.read().await.records.contains_key(&pr)
    }

    pub async fn get(&self, pr: PrId) -> Result<InstanceRecord, InstanceError> {
        self.inner
            .read()
            .await
            .records
            .get(&pr)
            .cloned()
            .ok_or(InstanceError::NotFound(pr))
    }

    /// Reserve a port block and insert a `Provisioning` record.
    pub async fn spawn(
        &self,
        data: InstanceData,
        now: DateTime<Utc>,
    ) -> Result<InstanceRecord, InstanceError> {
        let mut inner = self.inner.write().await;
        if inner.records.contains_key(&data.pr_id) {
            return Err(InstanceError::AlreadyExists(data.pr_id));
        }

        let block_size = inner.block_size;
        let block = inner.ports.allocate(block_size)?;
        let record = InstanceRecord::new(data, block, now);
        inner.records.insert(record.pr_id(), record.clone());
        Ok(record)
    }

    /// Move a record to `state`. Entering `Running` stamps `last_deployed_at`.
    pub async fn set_state(
        &self,
        pr: PrId,
        state: InstanceState,
        now: DateTime<Utc>,
    ) -> Result<InstanceRecord, InstanceError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(&pr)
            .ok_or(InstanceError::NotFound(pr))?;

        if state == InstanceState::Running && record.state != InstanceState::Running {
            record.last_deployed_at = Some(now);
        }
        record.state = state;
        Ok(record.clone())
    }

    /// Delete the record and return its ports to the pool.
    pub async fn retire(&self, pr: PrId) -> Result<InstanceRecord, InstanceError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .remove(&pr)
            .ok_or(InstanceError::NotFound(pr))?;
        inner.ports.release(&record.ports)?;
        Ok(record)
    }

    /// All live records, ordered by PR number.
    pub async fn list(&self) -> Vec<InstanceRecord> {
        let inner = self.inner.read().await;
        let mut records: Vec<InstanceRecord> = inner.records.values().cloned().collect();
        records.sort_by_key(InstanceRecord::pr_id);
        records
    }

    pub async fn free_ports(&self) -> usize {
        self.inner.read().await.ports.free_count()
    }
}

fn lock_map<K, V>(map: &Mutex<HashMap<K, V>>) -> MutexGuard<'_, HashMap<K, V>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sequence numbers that make later-arriving dispatches for a PR stale.
#[derive(Debug, Default, Clone, Copy)]
struct SeqMarks {
    /// Latest pull request action applied.
    applied: Option<TaskSeq>,
    /// Latest remove with an origin.
    removed: Option<TaskSeq>,
}

fn raise(mark: &mut Option<TaskSeq>, seq: TaskSeq) {
    if mark.map_or(true, |current| current < seq) {
        *mark = Some(seq);
    }
}

/// Holds a PR's lock. Dropping it forgets the PR's lock and marks once no
/// other task for the PR is waiting, running or scheduled.
struct PrLease<'a> {
    manager: &'a InstanceManager,
    pr: PrId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PrLease<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.manager.prune(self.pr);
    }
}

/// Drives instances through their lifecycle, one operation per PR at a time.
pub struct InstanceManager {
    registry: InstanceRegistry,
    builder: Arc<dyn SiteBuilder>,
    composer: Arc<CommentComposer>,
    scheduler: Arc<DelayedScheduler>,
    pr_locks: Mutex<HashMap<PrId, Arc<tokio::sync::Mutex<()>>>>,
    marks: Mutex<HashMap<PrId, SeqMarks>>,
}

impl InstanceManager {
    pub fn new(
        registry: InstanceRegistry,
        builder: Arc<dyn SiteBuilder>,
        composer: Arc<CommentComposer>,
        scheduler: Arc<DelayedScheduler>,
    ) -> Self {
        Self {
            registry,
            builder,
            composer,
            scheduler,
            pr_locks: Mutex::new(HashMap::new()),
            marks: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn composer(&self) -> &Arc<CommentComposer> {
        &self.composer
    }

    pub async fn check_for_instance(&self, pr: PrId) -> bool {
        self.registry.contains(pr).await
    }

    pub async fn get_instance(&self, pr: PrId) -> Result<InstanceRecord, InstanceError> {
        self.registry.get(pr).await
    }

    /// Register a new instance and reserve its ports.
    ///
    /// Callers must hold the PR's lock or otherwise know no other operation
    /// for the PR is running.
    pub async fn spawn(&self, data: InstanceData) -> Result<InstanceRecord, InstanceError> {
        let record = self.registry.spawn(data, Utc::now()).await?;
        info!(
            "Spawned instance for PR #{} on ports {}",
            record.pr_id(),
            record.ports
        );
        Ok(record)
    }

    async fn lock_pr(&self, pr: PrId) -> PrLease<'_> {
        let lock = Arc::clone(lock_map(&self.pr_locks).entry(pr).or_default());
        PrLease {
            manager: self,
            pr,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Forget `pr`'s lock and marks if nothing else for the PR can still run.
    ///
    /// Every dispatch older than the marks is registered with the scheduler
    /// until it finishes, and every lock holder or waiter keeps a reference
    /// to the lock, so neither is needed once both checks pass.
    fn prune(&self, pr: PrId) {
        if self.scheduler.has_other_tasks(pr) {
            return;
        }
        let mut locks = lock_map(&self.pr_locks);
        if locks
            .get(&pr)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&pr);
            lock_map(&self.marks).remove(&pr);
        }
    }

    /// A dispatch is stale if a remove was accepted after it, or if it is a
    /// close and a later pull request action has already been applied.
    fn is_stale(&self, pr: PrId, seq: TaskSeq, action: PrAction) -> bool {
        let marks = lock_map(&self.marks).get(&pr).copied().unwrap_or_default();
        let before = |mark: Option<TaskSeq>| mark.is_some_and(|mark| seq < mark);
        before(marks.removed) || (action == PrAction::Closed && before(marks.applied))
    }

    /// Download and (re)start the site from scratch.
    pub async fn download(&self, pr: PrId) -> Result<Option<InstanceRecord>, InstanceError> {
        let _lease = self.lock_pr(pr).await;
        self.process_locked(pr, Event::DownloadRequested).await
    }

    /// Rebuild in place on the same ports.
    pub async fn edit(&self, pr: PrId) -> Result<Option<InstanceRecord>, InstanceError> {
        let _lease = self.lock_pr(pr).await;
        self.process_locked(pr, Event::EditRequested).await
    }

    /// Tear the instance down, release its ports and delete it.
    ///
    /// With an `origin`, still-pending dispatches for the PR accepted before
    /// it are cancelled, and ones already waiting for the PR are dropped.
    pub async fn remove(
        &self,
        pr: PrId,
        origin: Option<TaskSeq>,
    ) -> Result<InstanceRecord, InstanceError> {
        let _lease = self.lock_pr(pr).await;
        self.remove_locked(pr, origin).await
    }

    /// Remove the instance only if it has had no deployment since `idle_since`.
    pub async fn remove_if_idle(
        &self,
        pr: PrId,
        idle_since: DateTime<Utc>,
    ) -> Result<Option<InstanceRecord>, InstanceError> {
        let _lease = self.lock_pr(pr).await;
        let record = self.registry.get(pr).await?;
        if record.last_activity() >= idle_since {
            return Ok(None);
        }
        self.remove_locked(pr, None).await.map(Some)
    }

    async fn remove_locked(
        &self,
        pr: PrId,
        origin: Option<TaskSeq>,
    ) -> Result<InstanceRecord, InstanceError> {
        if let Some(seq) = origin {
            raise(&mut lock_map(&self.marks).entry(pr).or_default().removed, seq);
            let cancelled = self.scheduler.cancel_pending(pr, seq);
            if cancelled > 0 {
                info!(
                    "Cancelled {} pending operation(s) for PR #{}",
                    cancelled, pr
                );
            }
        }

        let record = self.registry.get(pr).await?;
        self.process_locked(pr, Event::RemoveRequested).await?;
        Ok(record)
    }

    /// Apply a `pull_request` webhook action.
    ///
    /// Never fails: problems are logged, and a full port pool is reported on
    /// the pull request.
    pub async fn handle_pull_request(&self, seq: TaskSeq, action: PrAction, data: InstanceData) {
        let pr = data.pr_id;
        let _lease = self.lock_pr(pr).await;

        if self.is_stale(pr, seq, action) {
            info!(
                "Dropping {:?} {} for PR #{}: a later event has already been applied",
                action, seq, pr
            );
            return;
        }
        raise(&mut lock_map(&self.marks).entry(pr).or_default().applied, seq);

        let plan = plan(action, self.registry.contains(pr).await);

        if plan.spawn {
            match self.spawn(data.clone()).await {
                Ok(_) => {}
                Err(e) if e.is_resource_exhausted() => {
                    if action == PrAction::Closed {
                        info!("PR #{} closed with no instance and no free ports", pr);
                        return;
                    }
                    warn!("No ports left for PR #{}: {}", pr, e);
                    self.composer
                        .notify(
                            &CommentTarget::from(&data),
                            template_ids::NEW_NO_RESOURCES,
                            &self.composer.request_context(&data),
                        )
                        .await;
                    return;
                }
                Err(e) => {
                    error!("Failed to spawn instance for PR #{}: {}", pr, e);
                    return;
                }
            }
        }

        let result = match plan.event {
            Event::RemoveRequested => self.remove_locked(pr, Some(seq)).await.map(|_| ()),
            event => self.process_locked(pr, event).await.map(|_| ()),
        };

        if let Err(e) = result {
            error!("Failed to apply {:?} to PR #{}: {}", action, pr, e);
        }
    }

    /// Run `event` and every event the resulting effects produce.
    ///
    /// The new state is stored before effects run, so `Updating` is visible
    /// while a rebuild is in flight. Returns the final record, or `None` once
    /// the instance has been retired.
    async fn process_locked(
        &self,
        pr: PrId,
        event: Event,
    ) -> Result<Option<InstanceRecord>, InstanceError> {
        let ctx = InterpreterContext {
            builder: self.builder.as_ref(),
            composer: &self.composer,
        };

        let mut record = self.registry.get(pr).await?;
        let mut next = Some(event);

        while let Some(event) = next.take() {
            info!(
                "Processing event {} for PR #{} in state {}",
                event.log_summary(),
                pr,
                record.state
            );

            let TransitionResult { state, effects } = transition(record.state, event);

            match state {
                Some(state) => {
                    record = self.registry.set_state(pr, state, Utc::now()).await?;
                    next = execute_effects(&ctx, &record, effects).await;
                }
                None => {
                    let retired = self.registry.retire(pr).await?;
                    info!(
                        "Removed instance for PR #{}, released ports {}",
                        pr, retired.ports
                    );
                    execute_effects(&ctx, &retired, effects).await;
                    return Ok(None);
                }
            }
        }

        info!("Final state for PR #{}: {}", pr, record.state);
        Ok(Some(record))
    }
}
