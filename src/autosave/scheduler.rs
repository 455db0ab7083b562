//! Debounced autosave with conflict detection.
//!
//! One scheduler owns the save slot for one (owner, repo, branch). Edits
//! replace the pending snapshot; only the latest one is ever committed.
//! Save cycles are serialized, so there is never more than one commit in
//! flight for the target.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument};
use ulid::Ulid;

use crate::autosave::conflict::{ConflictCheck, ConflictDetector, ConflictKind, ConflictRecord, ConflictReport};
use crate::autosave::connectivity::Connectivity;
use crate::autosave::events::{EventBus, ListenerId, SaveEvent, SaveFailure};
use crate::autosave::state::SaveState;
use crate::config::AutoSaveConfig;
use crate::error::{SyncError, SyncResult};
use crate::pipeline::{CommitOptions, CommitPipeline, CommitResult, FileChange};
use crate::types::{CommitSha, RepoTarget};

/// How to settle a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "data", rename_all = "camelCase")]
pub enum ConflictResolution {
    /// keep the local payload and write it on top of the remote tip
    PreferLocal,
    /// drop local edits and adopt the remote data file
    PreferRemote,
    /// write a payload merged by the user
    Manual(Value),
}

/// Snapshot returned by [`AutoSaveScheduler::get_status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveStatus {
    pub state: SaveState,
    pub is_online: bool,
    pub has_pending_save: bool,
    pub last_saved_data: Option<Value>,
    pub last_known_commit_sha: Option<CommitSha>,
    pub retry_count: u32,
    pub last_error: Option<SaveFailure>,
    pub conflict: Option<ConflictReport>,
}

#[derive(Default)]
struct SchedulerState {
    status: SaveState,
    /// latest snapshot not yet committed
    pending: Option<Value>,
    last_saved: Option<Value>,
    last_known_commit: Option<CommitSha>,
    retry_count: u32,
    /// payload of the save that landed in `Error`, for `retry()`
    failed: Option<Value>,
    last_error: Option<SaveFailure>,
    conflict: Option<ConflictReport>,
    /// local payload held back by a conflict
    conflict_payload: Option<Value>,
    timer: Option<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
}

impl SchedulerState {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct SchedulerInner {
    target: RepoTarget,
    pipeline: CommitPipeline,
    detector: ConflictDetector,
    connectivity: Arc<dyn Connectivity>,
    config: AutoSaveConfig,
    events: EventBus,
    runtime: Handle,
    state: Mutex<SchedulerState>,
    /// held for the whole of a save cycle
    save_slot: tokio::sync::Mutex<()>,
}

/// Debounces edits to a JSON document and commits them to `data_path`.
///
/// Must be created inside a tokio runtime; timers run on it.
pub struct AutoSaveScheduler {
    inner: Arc<SchedulerInner>,
}

impl AutoSaveScheduler {
    pub fn new(
        target: RepoTarget,
        pipeline: CommitPipeline,
        detector: ConflictDetector,
        connectivity: Arc<dyn Connectivity>,
        config: AutoSaveConfig,
    ) -> SyncResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|_| SyncError::InvalidState("autosave requires a tokio runtime".to_string()))?;

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                target,
                pipeline,
                detector,
                connectivity,
                config,
                events: EventBus::new(),
                runtime,
                state: Mutex::new(SchedulerState::default()),
                save_slot: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn target(&self) -> &RepoTarget {
        &self.inner.target
    }

    /// Start from data known to be committed at `commit`.
    pub fn seed(&self, data: Value, commit: CommitSha) {
        let mut st = self.inner.state.lock();
        st.last_saved = Some(data);
        st.last_known_commit = Some(commit);
    }

    /// Queue `data` for saving after the debounce interval, or right away
    /// when `immediate` is set.
    ///
    /// Data equal to the last saved snapshot is ignored. While a save is in
    /// flight every snapshot is kept; whether it is new is decided once the
    /// running save has landed.
    pub fn schedule_save(&self, data: Value, immediate: bool) {
        let delay = if immediate {
            Duration::ZERO
        } else {
            self.inner.config.debounce
        };

        let mut events = Vec::new();
        {
            let mut st = self.inner.state.lock();

            match st.status {
                SaveState::Conflict => st.conflict_payload = Some(data),
                // the running cycle picks the snapshot up when it finishes
                SaveState::Saving => st.pending = Some(data),
                SaveState::Retrying(_) => {
                    st.pending = Some(data);
                    if st.timer.is_none() {
                        self.inner.arm_timer(&mut st, delay);
                    }
                }
                _ if st.last_saved.as_ref() == Some(&data) => {
                    st.pending = None;
                    if st.status == SaveState::Pending {
                        st.cancel_timer();
                        self.inner.transition(&mut st, SaveState::Idle, &mut events);
                    }
                    debug!(repo = %self.inner.target, "data unchanged, nothing to save");
                }
                _ => {
                    st.pending = Some(data);
                    self.inner.transition(&mut st, SaveState::Pending, &mut events);
                    self.inner.arm_timer(&mut st, delay);
                }
            }
        }
        self.inner.emit_all(events);
    }

    /// Save `data` now and wait for the outcome.
    ///
    /// Returns `Ok(None)` when there was nothing to commit.
    pub async fn force_save(&self, data: Value) -> SyncResult<Option<CommitResult>> {
        let mut events = Vec::new();
        {
            let mut st = self.inner.state.lock();
            if let (SaveState::Conflict, Some(report)) = (st.status, st.conflict.clone()) {
                st.conflict_payload = Some(data);
                return Err(SyncError::Conflict(report));
            }
            st.cancel_timer();
            st.pending = Some(data);
            if !st.status.is_busy() {
                self.inner.transition(&mut st, SaveState::Pending, &mut events);
            }
        }
        self.inner.emit_all(events);

        self.inner.run_cycle().await
    }

    /// Drop a pending save. Has no effect once a save is in flight.
    pub fn cancel_save(&self) -> bool {
        let mut events = Vec::new();
        let cancelled = {
            let mut st = self.inner.state.lock();
            match st.status {
                SaveState::Pending | SaveState::Retrying(_) => {
                    st.cancel_timer();
                    st.pending = None;
                    st.retry_count = 0;
                    self.inner.transition(&mut st, SaveState::Idle, &mut events);
                    true
                }
                _ => false,
            }
        };
        self.inner.emit_all(events);
        if cancelled {
            debug!(repo = %self.inner.target, "pending save cancelled");
        }
        cancelled
    }

    /// Re-send the payload whose save ended in `Error`.
    pub fn retry(&self) -> SyncResult<()> {
        let mut events = Vec::new();
        {
            let mut st = self.inner.state.lock();
            if st.status != SaveState::Error {
                return Err(SyncError::InvalidState(format!(
                    "retry is only possible after an error, state is {}",
                    st.status
                )));
            }
            let payload = st.pending.take().or_else(|| st.failed.take());
            let Some(payload) = payload else {
                return Err(SyncError::InvalidState("no failed save to retry".to_string()));
            };
            st.pending = Some(payload);
            self.inner.transition(&mut st, SaveState::Pending, &mut events);
            self.inner.arm_timer(&mut st, Duration::ZERO);
        }
        self.inner.emit_all(events);
        Ok(())
    }

    /// Settle a conflict.
    ///
    /// `PreferRemote` returns the remote data the editor should load.
    pub async fn resolve_conflicts(&self, resolution: ConflictResolution) -> SyncResult<Option<Value>> {
        let report = {
            let st = self.inner.state.lock();
            match (st.status, &st.conflict) {
                (SaveState::Conflict, Some(report)) => report.clone(),
                _ => {
                    return Err(SyncError::InvalidState(format!(
                        "no conflict to resolve, state is {}",
                        st.status
                    )))
                }
            }
        };

        info!(repo = %self.inner.target, remote = %report.remote_sha.short(), ?resolution, "resolving conflict");

        let payload = match resolution {
            ConflictResolution::PreferRemote => {
                let (data, tip) = self.inner.load_remote().await?;
                let mut events = Vec::new();
                {
                    let mut st = self.inner.state.lock();
                    st.last_saved = Some(data.clone());
                    st.last_known_commit = Some(tip);
                    st.conflict = None;
                    st.conflict_payload = None;
                    st.pending = None;
                    st.retry_count = 0;
                    self.inner.transition(&mut st, SaveState::Idle, &mut events);
                }
                self.inner.emit_all(events);
                return Ok(Some(data));
            }
            ConflictResolution::PreferLocal => {
                let held = self.inner.state.lock().conflict_payload.clone();
                held.ok_or_else(|| SyncError::InvalidState("no local payload to keep".to_string()))?
            }
            ConflictResolution::Manual(data) => data,
        };

        let mut events = Vec::new();
        {
            let mut st = self.inner.state.lock();
            st.last_known_commit = Some(report.remote_sha);
            st.conflict = None;
            st.conflict_payload = None;
            st.pending = Some(payload);
            st.retry_count = 0;
            self.inner.transition(&mut st, SaveState::Pending, &mut events);
            self.inner.arm_timer(&mut st, Duration::ZERO);
        }
        self.inner.emit_all(events);
        Ok(None)
    }

    /// Adopt the remote tip as the last known commit.
    pub async fn sync(&self) -> SyncResult<CommitSha> {
        let tip = self.inner.pipeline.resolve_tip(&self.inner.target).await?;
        self.inner.state.lock().last_known_commit = Some(tip.commit_sha.clone());
        debug!(repo = %self.inner.target, tip = %tip.commit_sha.short(), "synced with remote");
        Ok(tip.commit_sha)
    }

    /// Compare the last known commit with the remote now, entering
    /// `Conflict` if the branch moved.
    pub async fn check_conflicts(&self) -> SyncResult<ConflictCheck> {
        self.inner.poll_once().await
    }

    pub fn get_status(&self) -> SaveStatus {
        let st = self.inner.state.lock();
        SaveStatus {
            state: st.status,
            is_online: self.inner.connectivity.is_online(),
            has_pending_save: st.pending.is_some(),
            last_saved_data: st.last_saved.clone(),
            last_known_commit_sha: st.last_known_commit.clone(),
            retry_count: st.retry_count,
            last_error: st.last_error.clone(),
            conflict: st.conflict.clone(),
        }
    }

    pub fn state(&self) -> SaveState {
        self.inner.state.lock().status
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SaveEvent> {
        self.inner.events.subscribe()
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SaveEvent) + Send + Sync + 'static,
    {
        self.inner.events.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.events.remove_listener(id)
    }

    /// Check for remote changes every `poll_interval`, even with no edit
    /// pending.
    pub fn start_conflict_polling(&self) {
        let weak: Weak<SchedulerInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.poll_interval;

        let handle = self.inner.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if let Err(e) = inner.poll_once().await {
                    debug!(repo = %inner.target, error = %e, "conflict poll failed");
                }
            }
        });

        let mut st = self.inner.state.lock();
        if let Some(previous) = st.poller.replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_conflict_polling(&self) {
        if let Some(poller) = self.inner.state.lock().poller.take() {
            poller.abort();
        }
    }
}

impl Drop for AutoSaveScheduler {
    fn drop(&mut self) {
        let mut st = self.inner.state.lock();
        st.cancel_timer();
        if let Some(poller) = st.poller.take() {
            poller.abort();
        }
    }
}

impl SchedulerInner {
    fn transition(&self, st: &mut SchedulerState, next: SaveState, events: &mut Vec<SaveEvent>) {
        let prev = st.status;
        if prev == next {
            return;
        }
        if !prev.can_transition_to(next) {
            warn!(repo = %self.target, from = %prev, to = %next, "unexpected save state transition");
        }
        debug!(repo = %self.target, from = %prev, to = %next, "save state changed");
        st.status = next;
        events.push(SaveEvent::StatusChange { from: prev, to: next });
    }

    fn emit_all(&self, events: Vec<SaveEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }

    /// Run a save cycle after `delay`. Replaces any armed timer.
    ///
    /// The cycle itself runs on its own task, so cancelling the timer never
    /// interrupts a save that has started.
    fn arm_timer(self: &Arc<Self>, st: &mut SchedulerState, delay: Duration) {
        st.cancel_timer();
        let weak = Arc::downgrade(self);
        let runtime = self.runtime.clone();
        st.timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                runtime.spawn(async move {
                    // outcome is reported through state and events
                    let _ = inner.run_cycle().await;
                });
            }
        }));
    }

    async fn run_cycle(self: &Arc<Self>) -> SyncResult<Option<CommitResult>> {
        let _slot = self.save_slot.lock().await;

        let mut events = Vec::new();
        let claimed = {
            let mut st = self.state.lock();
            match st.pending.take() {
                Some(data) if st.status == SaveState::Conflict => {
                    st.conflict_payload = Some(data);
                    None
                }
                Some(data) if st.last_saved.as_ref() != Some(&data) => {
                    self.transition(&mut st, SaveState::Saving, &mut events);
                    Some((data, st.last_known_commit.clone()))
                }
                _ => {
                    // the remote already holds the latest snapshot
                    if matches!(st.status, SaveState::Pending | SaveState::Retrying(_)) {
                        st.cancel_timer();
                        st.retry_count = 0;
                        st.last_error = None;
                        self.transition(&mut st, SaveState::Idle, &mut events);
                    }
                    None
                }
            }
        };
        self.emit_all(events);

        let Some((data, expected)) = claimed else {
            return Ok(None);
        };

        let span = info_span!("save_cycle", repo = %self.target, cycle = %Ulid::new());
        self.save_claimed(data, expected).instrument(span).await
    }

    async fn save_claimed(
        self: &Arc<Self>,
        data: Value,
        expected: Option<CommitSha>,
    ) -> SyncResult<Option<CommitResult>> {
        if !self.connectivity.is_online() {
            warn!(repo = %self.target, "offline, save not attempted");
            return Err(self.fail(data, SyncError::Offline));
        }

        if let Some(known) = &expected {
            match self.detector.check(&self.target, known, &self.watched()).await {
                Ok(ConflictCheck::Clear { .. }) => {}
                Ok(ConflictCheck::Diverged(report)) => return Err(self.enter_conflict(report, data)),
                Err(e) => return Err(self.handle_failure(data, e)),
            }
        }

        let content = match serde_json::to_vec_pretty(&data) {
            Ok(content) => content,
            Err(e) => return Err(self.fail(data, e.into())),
        };
        let changes = [FileChange::update(self.config.data_path.as_str(), content)];
        let options = CommitOptions {
            expected_parent: expected.clone(),
            ..CommitOptions::default()
        };

        match self
            .pipeline
            .create_commit(&self.target, &changes, &self.config.commit_message, &options)
            .await
        {
            Ok(result) => {
                self.succeed(data, &result);
                Ok(Some(result))
            }
            Err(SyncError::ConcurrentModification { expected: base, actual, .. }) => {
                let report = self.concurrent_report(&base, actual).await;
                Err(self.enter_conflict(report, data))
            }
            Err(e) => Err(self.handle_failure(data, e)),
        }
    }

    fn watched(&self) -> Vec<String> {
        vec![self.config.data_path.clone()]
    }

    fn succeed(self: &Arc<Self>, data: Value, result: &CommitResult) {
        let mut events = Vec::new();
        {
            let mut st = self.state.lock();
            st.last_saved = Some(data);
            st.last_known_commit = Some(result.commit_sha.clone());
            st.retry_count = 0;
            st.failed = None;
            st.last_error = None;
            self.transition(&mut st, SaveState::Saved, &mut events);
            events.push(SaveEvent::Save(result.clone()));

            if st.pending.is_some() {
                self.transition(&mut st, SaveState::Pending, &mut events);
                self.arm_timer(&mut st, self.config.debounce);
            } else {
                self.transition(&mut st, SaveState::Idle, &mut events);
            }
        }
        info!(repo = %self.target, commit = %result.commit_sha.short(), "autosave committed");
        self.emit_all(events);
    }

    /// Land in `Error` without scheduling anything.
    fn fail(&self, data: Value, error: SyncError) -> SyncError {
        let failure = SaveFailure::from(&error);
        let mut events = Vec::new();
        {
            let mut st = self.state.lock();
            st.retry_count = 0;
            st.failed = Some(data);
            st.last_error = Some(failure.clone());
            self.transition(&mut st, SaveState::Error, &mut events);
            events.push(SaveEvent::Error(failure));
        }
        warn!(repo = %self.target, error = %error, "save failed");
        self.emit_all(events);
        error
    }

    fn handle_failure(self: &Arc<Self>, data: Value, error: SyncError) -> SyncError {
        if !error.is_retryable() {
            return self.fail(data, error);
        }

        let mut events = Vec::new();
        let exhausted = {
            let mut st = self.state.lock();
            st.retry_count += 1;
            if st.retry_count > self.config.max_retries {
                true
            } else {
                let attempt = st.retry_count;
                // a newer snapshot supersedes the one that failed
                if st.pending.is_none() {
                    st.pending = Some(data.clone());
                }
                st.last_error = Some(SaveFailure::from(&error));
                self.transition(&mut st, SaveState::Retrying(attempt), &mut events);
                let delay = self.pipeline.gate().policy().backoff(attempt - 1);
                warn!(
                    repo = %self.target,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "save failed, retrying"
                );
                self.arm_timer(&mut st, delay);
                false
            }
        };
        self.emit_all(events);

        if exhausted {
            self.fail(data, error)
        } else {
            error
        }
    }

    fn enter_conflict(&self, report: ConflictReport, data: Value) -> SyncError {
        let mut events = Vec::new();
        {
            let mut st = self.state.lock();
            st.cancel_timer();
            // keep the newest local snapshot
            let newest = st.pending.take().unwrap_or(data);
            st.conflict_payload = Some(newest);
            st.conflict = Some(report.clone());
            st.retry_count = 0;
            self.transition(&mut st, SaveState::Conflict, &mut events);
            events.push(SaveEvent::Conflict(report.clone()));
        }
        warn!(repo = %self.target, conflict = %report, "save blocked by conflict");
        self.emit_all(events);
        SyncError::Conflict(report)
    }

    /// Build a report for a ref update the remote rejected.
    async fn concurrent_report(&self, base: &CommitSha, actual: Option<CommitSha>) -> ConflictReport {
        match self.detector.check(&self.target, base, &self.watched()).await {
            Ok(ConflictCheck::Diverged(report)) => report,
            Ok(ConflictCheck::Clear { .. }) | Err(_) => ConflictReport {
                target: self.target.clone(),
                local_sha: base.clone(),
                remote_sha: actual.unwrap_or_else(|| base.clone()),
                records: vec![ConflictRecord {
                    path: self.config.data_path.clone(),
                    kind: ConflictKind::ContentConflict,
                    remote_commits: Vec::new(),
                }],
            },
        }
    }

    async fn poll_once(self: &Arc<Self>) -> SyncResult<ConflictCheck> {
        // a running save does its own check
        let Ok(_slot) = self.save_slot.try_lock() else {
            return Err(SyncError::InvalidState("save in progress".to_string()));
        };

        let known = {
            let st = self.state.lock();
            if let (SaveState::Conflict, Some(report)) = (st.status, &st.conflict) {
                return Ok(ConflictCheck::Diverged(report.clone()));
            }
            st.last_known_commit.clone()
        };
        let Some(known) = known else {
            return Err(SyncError::InvalidState("no known commit; sync first".to_string()));
        };
        if !self.connectivity.is_online() {
            return Err(SyncError::Offline);
        }

        let check = self.detector.check(&self.target, &known, &self.watched()).await?;
        if let ConflictCheck::Diverged(report) = &check {
            let mut events = Vec::new();
            {
                let mut st = self.state.lock();
                st.cancel_timer();
                let held = st.pending.take();
                st.conflict_payload = held.or_else(|| st.last_saved.clone());
                st.conflict = Some(report.clone());
                self.transition(&mut st, SaveState::Conflict, &mut events);
                events.push(SaveEvent::Conflict(report.clone()));
            }
            warn!(repo = %self.target, conflict = %report, "remote changed while idle");
            self.emit_all(events);
        }
        Ok(check)
    }

    /// Read and parse the data file at the remote tip.
    async fn load_remote(&self) -> SyncResult<(Value, CommitSha)> {
        let tip = self.pipeline.resolve_tip(&self.target).await?;
        let data = match self
            .pipeline
            .read_file_at(&self.target, &tip, &self.config.data_path)
            .await?
        {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => Value::Null,
        };
        Ok((data, tip.commit_sha))
    }
}
