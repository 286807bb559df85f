use crate::application::aggregator::{FocusAggregator, FocusSummary};
use crate::application::bootstrap::bootstrap_workspace;
use crate::application::error::EngineError;
use crate::application::events::{EngineEvent, EventBus, Subscription};
use crate::application::pomodoro::{
    AbortOutcome, CycleEvent, IntervalEnd, PomodoroCycle, PomodoroPhase, PomodoroSnapshot,
};
use crate::application::recorder::{RecordOutcome, RecordRequest, SessionRecorder};
use crate::application::scheduler::RepeatingTask;
use crate::application::timer::{CompletedRun, ManualTimer, VisibilityChange};
use crate::domain::clock::elapsed_millis;
use crate::domain::models::{
    FocusTimeBreakdown, NewPomodoroSession, PomodoroSessionUpdate, PomodoroStatus, RunMode,
    SessionStatus, SessionType, TaskUpdate, TimerStatus,
};
use crate::infrastructure::config::EngineConfig;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::focus_store::FocusStore;
use crate::infrastructure::logging::init_logging;
use crate::infrastructure::sqlite_store::SqliteFocusStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TimerSnapshot {
    pub task_id: String,
    pub status: TimerStatus,
    pub display_seconds: u64,
    pub current_run_seconds: u64,
    pub run_started_at: Option<DateTime<Utc>>,
    pub away: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    Idle,
    Restored(TimerStatus),
    /// The persisted run was stale and has been closed as interrupted.
    Interrupted(RecordOutcome),
}

type RuntimeHandle = Arc<AsyncMutex<TaskRuntime>>;

#[derive(Default)]
struct TaskRuntime {
    base_total_seconds: u64,
    loaded: bool,
    timer: Option<ManualTimer>,
    pomodoro: Option<PomodoroCycle>,
    ticker: Option<RepeatingTask>,
    ticker_generation: u64,
    ticks: u64,
}

impl TaskRuntime {
    fn mode(&self) -> Option<RunMode> {
        if self.timer.as_ref().is_some_and(ManualTimer::is_active) {
            Some(RunMode::Manual)
        } else if self.pomodoro.as_ref().is_some_and(PomodoroCycle::is_active) {
            Some(RunMode::Pomodoro)
        } else {
            None
        }
    }

    fn current_session_seconds(&self, now: DateTime<Utc>) -> u64 {
        match self.mode() {
            Some(RunMode::Manual) => self
                .timer
                .as_ref()
                .map(|timer| timer.current_run_seconds(now))
                .unwrap_or(0),
            Some(RunMode::Pomodoro) => self
                .pomodoro
                .as_ref()
                .map(|cycle| cycle.focus_elapsed_seconds(now))
                .unwrap_or(0),
            None => 0,
        }
    }

    fn set_base_total(&mut self, total_seconds: u64) {
        self.base_total_seconds = total_seconds;
        self.loaded = true;
        if let Some(timer) = self.timer.as_mut() {
            timer.set_base_total_seconds(total_seconds);
        }
    }

    fn cancel_ticker(&mut self) {
        self.ticker_generation = self.ticker_generation.wrapping_add(1);
        self.ticks = 0;
        if let Some(ticker) = self.ticker.take() {
            ticker.cancel();
        }
    }
}

struct EngineInner {
    store: Arc<dyn FocusStore>,
    config: EngineConfig,
    user_id: String,
    bus: EventBus,
    recorder: SessionRecorder,
    aggregator: FocusAggregator,
    now_provider: NowProvider,
    tasks: Mutex<HashMap<String, RuntimeHandle>>,
}

pub struct FocusEngineBuilder {
    store: Arc<dyn FocusStore>,
    user_id: String,
    config: EngineConfig,
    now_provider: NowProvider,
    bus: EventBus,
}

impl FocusEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn build(self) -> Result<FocusEngine, EngineError> {
        self.config.validate()?;
        let user_id = self.user_id.trim().to_string();
        if user_id.is_empty() {
            return Err(EngineError::InvalidConfig("user_id must not be empty".to_string()));
        }
        let recorder = SessionRecorder::new(self.store.clone(), self.config.rewards, self.bus.clone());
        let aggregator = FocusAggregator::new(self.store.clone());
        Ok(FocusEngine {
            inner: Arc::new(EngineInner {
                store: self.store,
                config: self.config,
                user_id,
                bus: self.bus,
                recorder,
                aggregator,
                now_provider: self.now_provider,
                tasks: Mutex::new(HashMap::new()),
            }),
        })
    }
}

/// Per-user engine. Operations on one task are serialised; different tasks
/// run independently.
#[derive(Clone)]
pub struct FocusEngine {
    inner: Arc<EngineInner>,
}

impl FocusEngine {
    pub fn builder(store: Arc<dyn FocusStore>, user_id: impl Into<String>) -> FocusEngineBuilder {
        FocusEngineBuilder {
            store,
            user_id: user_id.into(),
            config: EngineConfig::default(),
            now_provider: Arc::new(Utc::now),
            bus: EventBus::default(),
        }
    }

    /// Bootstraps `<root>/{config,state,logs}`, installs logging and opens the
    /// local SQLite store.
    pub fn from_workspace(workspace_root: &Path, user_id: &str) -> Result<Self, EngineError> {
        let bootstrap = bootstrap_workspace(workspace_root)?;
        init_logging(&bootstrap.logs_dir, &bootstrap.config.log_level)?;
        let store = Arc::new(SqliteFocusStore::new(&bootstrap.database_path));
        info!(
            workspace = %bootstrap.workspace_root.display(),
            user_id,
            "focus engine ready"
        );
        Self::builder(store, user_id).config(bootstrap.config).build()
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.bus.subscribe()
    }

    pub async fn start_timer(&self, task_id: &str) -> Result<TimerSnapshot, EngineError> {
        let handle = self.runtime(task_id)?;
        let mut guard = handle.lock().await;
        let state = &mut *guard;
        if state.pomodoro.as_ref().is_some_and(PomodoroCycle::is_active) {
            return Err(EngineError::invalid_transition(
                task_id,
                "start timer",
                "pomodoro active",
            ));
        }
        if let Some(timer) = state.timer.as_ref().filter(|timer| timer.is_active()) {
            return Err(EngineError::invalid_transition(
                task_id,
                "start",
                timer.status().as_str(),
            ));
        }

        let base_total_seconds = self.load_base_total(task_id, state).await?;
        let now = self.now();
        let timer = state
            .timer
            .get_or_insert_with(|| ManualTimer::new(task_id, base_total_seconds));
        timer.set_base_total_seconds(base_total_seconds);
        let update = timer.start(now)?;
        let snapshot = timer_snapshot(timer, now);

        info!(task_id, "manual timer started");
        self.write_through(task_id, "start_timer", &update).await;
        self.spawn_ticker(task_id, state);
        self.publish_mode(task_id, Some(RunMode::Manual));
        self.publish_time(task_id, snapshot.display_seconds);
        Ok(snapshot)
    }

    pub async fn pause_timer(&self, task_id: &str) -> Result<TimerSnapshot, EngineError> {
        let handle = self.runtime(task_id)?;
        let mut guard = handle.lock().await;
        let state = &mut *guard;
        if state.timer.is_none() {
            return Err(self.missing_run_error(task_id, state, "pause").await);
        }
        let now = self.now();
        let timer = state
            .timer
            .as_mut()
            .ok_or_else(|| EngineError::invalid_transition(task_id, "pause", "idle"))?;
        let update = timer.pause(now)?;
        let snapshot = timer_snapshot(timer, now);

        state.cancel_ticker();
        info!(task_id, run_seconds = snapshot.current_run_seconds, "manual timer paused");
        self.write_through(task_id, "pause_timer", &update).await;
        self.publish_time(task_id, snapshot.display_seconds);
        Ok(snapshot)
    }

    pub async fn resume_timer(&self, task_id: &str) -> Result<TimerSnapshot, EngineError> {
        let handle = self.runtime(task_id)?;
        let mut guard = handle.lock().await;
        let state = &mut *guard;
        if state.timer.is_none() {
            return Err(self.missing_run_error(task_id, state, "resume").await);
        }
        let now = self.now();
        let timer = state
            .timer
            .as_mut()
            .ok_or_else(|| EngineError::invalid_transition(task_id, "resume", "idle"))?;
        let update = timer.resume(now)?;
        let snapshot = timer_snapshot(timer, now);

        info!(task_id, "manual timer resumed");
        self.write_through(task_id, "resume_timer", &update).await;
        self.spawn_ticker(task_id, state);
        self.publish_time(task_id, snapshot.display_seconds);
        Ok(snapshot)
    }

    /// Resets the task to idle and records the run. The recorder is awaited;
    /// if it fails the timer is still idle locally and the error is returned.
    pub async fn stop_timer(&self, task_id: &str) -> Result<RecordOutcome, EngineError> {
        let handle = self.runtime(task_id)?;
        let mut guard = handle.lock().await;
        let state = &mut *guard;
        if state.timer.is_none() {
            return Err(self.missing_run_error(task_id, state, "stop").await);
        }
        let now = self.now();
        let timer = state
            .timer
            .as_mut()
            .ok_or_else(|| EngineError::invalid_transition(task_id, "stop", "idle"))?;
        let (run, reset) = timer.stop(now)?;

        state.cancel_ticker();
        info!(task_id, active_ms = run.active_ms, "manual timer stopped");
        self.write_through(task_id, "stop_timer", &reset).await;
        let outcome = self
            .record_run(task_id, state, run, SessionStatus::Completed)
            .await;
        self.publish_mode(task_id, None);
        outcome
    }

    pub async fn page_hidden(&self, task_id: &str) -> Result<(), EngineError> {
        let handle = self.runtime(task_id)?;
        let mut guard = handle.lock().await;
        let now = self.now();
        if let Some(timer) = guard.timer.as_mut() {
            timer.page_hidden(now);
        }
        Ok(())
    }

    pub async fn page_visible(&self, task_id: &str) -> Result<VisibilityChange, EngineError> {
        let handle = self.runtime(task_id)?;
        let mut guard = handle.lock().await;
        let state = &mut *guard;
        let now = self.now();
        let Some(timer) = state.timer.as_mut() else {
            return Ok(VisibilityChange::Unchanged);
        };
        let change = timer.page_visible(now, self.inner.config.away_threshold_seconds);
        let display_seconds = timer.display_seconds(now);

        if let VisibilityChange::AwayDetected {
            away_seconds,
            auto_pause,
        } = &change
        {
            if let Some(update) = auto_pause {
                state.cancel_ticker();
                self.write_through(task_id, "auto_pause", update).await;
            }
            info!(task_id, away_seconds, "away detected on return");
            self.inner.bus.publish(EngineEvent::AwayDetected {
                task_id: task_id.to_string(),
                away_seconds: *away_seconds,
            });
            self.publish_time(task_id, display_seconds);
        }
        Ok(change)
    }

    pub async fn timer_state(&self, task_id: &str) -> Option<TimerSnapshot> {
        let handle = self.existing_runtime(task_id)?;
        let guard = handle.lock().await;
        let now = self.now();
        guard.timer.as_ref().map(|timer| timer_snapshot(timer, now))
    }

    pub async fn start_pomodoro(&self, task_id: &str) -> Result<PomodoroSnapshot, EngineError> {
        let handle = self.runtime(task_id)?;
        let mut guard = handle.lock().await;
        let state = &mut *guard;
        if state.timer.as_ref().is_some_and(ManualTimer::is_active) {
            return Err(EngineError::invalid_transition(
                task_id,
                "start pomodoro",
                "manual timer active",
            ));
        }
        if let Some(cycle) = state.pomodoro.as_ref().filter(|cycle| cycle.is_active()) {
            return Err(EngineError::invalid_transition(
                task_id,
                "start pomodoro",
                cycle.phase().as_str(),
            ));
        }

        self.load_base_total(task_id, state).await?;
        let now = self.now();
        let durations = self.inner.config.pomodoro;
        state
            .pomodoro
            .get_or_insert_with(|| PomodoroCycle::new(task_id, durations))
            .start_focus(now)?;

        info!(task_id, focus_seconds = durations.focus_seconds, "pomodoro started");
        self.open_pomodoro_session(task_id, state, now).await;
        self.spawn_ticker(task_id, state);
        self.publish_mode(task_id, Some(RunMode::Pomodoro));
        Ok(self.publish_phase(task_id, state, now))
    }

    pub async fn pause_pomodoro(&self, task_id: &str) -> Result<PomodoroSnapshot, EngineError> {
        let handle = self.runtime(task_id)?;
        let mut guard = handle.lock().await;
        let state = &mut *guard;
        if state.pomodoro.is_none() {
            return Err(self.missing_run_error(task_id, state, "pause pomodoro").await);
        }
        let now = self.now();
        self.active_cycle(task_id, state, "pause pomodoro")?.pause(now)?;
        state.cancel_ticker();
        info!(task_id, "pomodoro paused");
        Ok(self.publish_phase(task_id, state, now))
    }

    pub async fn resume_pomodoro(&self, task_id: &str) -> Result<PomodoroSnapshot, EngineError> {
        let handle = self.runtime(task_id)?;
        let mut guard = handle.lock().await;
        let state = &mut *guard;
        if state.pomodoro.is_none() {
            return Err(self.missing_run_error(task_id, state, "resume pomodoro").await);
        }
        let now = self.now();
        self.active_cycle(task_id, state, "resume pomodoro")?.resume(now)?;
        self.spawn_ticker(task_id, state);
        info!(task_id, "pomodoro resumed");
        Ok(self.publish_phase(task_id, state, now))
    }

    pub async fn skip_break(&self, task_id: &str) -> Result<PomodoroSnapshot, EngineError> {
        let handle = self.runtime(task_id)?;
        let mut guard = handle.lock().await;
        let state = &mut *guard;
        if state.pomodoro.is_none() {
            return Err(self.missing_run_error(task_id, state, "skip break").await);
        }
        let now = self.now();
        self.active_cycle(task_id, state, "skip break")?.skip_break(now)?;
        info!(task_id, "break skipped");
        self.open_pomodoro_session(task_id, state, now).await;
        self.spawn_ticker(task_id, state);
        Ok(self.publish_phase(task_id, state, now))
    }

    /// Aborting focus records the elapsed part as an abandoned pomodoro;
    /// aborting a break records nothing. A boundary the countdown already
    /// crossed without a tick is settled first, so a focus interval that hit
    /// zero is recorded as completed.
    pub async fn abort_pomodoro(&self, task_id: &str) -> Result<Option<RecordOutcome>, EngineError> {
        let handle = self.runtime(task_id)?;
        let mut guard = handle.lock().await;
        let state = &mut *guard;
        if state.pomodoro.is_none() {
            return Err(self.missing_run_error(task_id, state, "abort pomodoro").await);
        }
        let now = self.now();
        let pending = self.active_cycle(task_id, state, "abort pomodoro")?.tick(now);
        let settled = match pending {
            Some(event) => self.settle_boundary(task_id, state, event).await,
            None => Ok(None),
        };
        let outcome = self.active_cycle(task_id, state, "abort pomodoro")?.abort(now)?;
        state.cancel_ticker();

        let result = match outcome {
            AbortOutcome::FocusAborted(interval) => {
                info!(task_id, "pomodoro focus aborted");
                self.close_pomodoro_session(&interval, PomodoroStatus::Aborted)
                    .await;
                let recorded = self
                    .record_interval(task_id, state, &interval, SessionType::Pomodoro, SessionStatus::Abandoned)
                    .await;
                settled.and(recorded.map(Some))
            }
            AbortOutcome::BreakEnded => {
                info!(task_id, "pomodoro cycle ended during break");
                settled
            }
        };
        self.publish_mode(task_id, None);
        result
    }

    pub async fn pomodoro_state(&self, task_id: &str) -> Option<PomodoroSnapshot> {
        let handle = self.existing_runtime(task_id)?;
        let guard = handle.lock().await;
        let now = self.now();
        guard.pomodoro.as_ref().map(|cycle| cycle.snapshot(now))
    }

    /// Advances one tick for `task_id`: display update, away check, heartbeat
    /// and pomodoro phase boundaries. The scheduler calls this every
    /// `tick_interval_ms`; hosts may call it directly.
    pub async fn tick(&self, task_id: &str) {
        self.run_tick(task_id, None).await;
    }

    /// Live seconds of the active run, zero when nothing runs.
    pub async fn current_session_time(&self, task_id: &str) -> u64 {
        let Some(handle) = self.existing_runtime(task_id) else {
            return 0;
        };
        let guard = handle.lock().await;
        guard.current_session_seconds(self.now())
    }

    pub async fn display_seconds(&self, task_id: &str) -> Result<u64, EngineError> {
        let handle = self.runtime(task_id)?;
        let mut guard = handle.lock().await;
        let state = &mut *guard;
        if !state.loaded {
            self.load_base_total(task_id, state).await?;
        }
        Ok(state.base_total_seconds + state.current_session_seconds(self.now()))
    }

    pub async fn total_focus_time(&self, task_id: &str) -> Result<u64, EngineError> {
        let current = self.current_session_time(task_id).await;
        self.inner
            .aggregator
            .total_focus_time(&self.inner.user_id, task_id, current)
            .await
    }

    pub async fn time_breakdown(&self, task_id: &str) -> Result<FocusTimeBreakdown, EngineError> {
        let current = self.current_session_time(task_id).await;
        self.inner
            .aggregator
            .time_breakdown(&self.inner.user_id, task_id, current)
            .await
    }

    pub async fn focus_summary(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<FocusSummary, EngineError> {
        self.inner
            .aggregator
            .focus_summary(&self.inner.user_id, start, end)
            .await
    }

    pub async fn record_tally(&self, task_id: &str, marks: u32) -> Result<u32, EngineError> {
        let handle = self.runtime(task_id)?;
        let _guard = handle.lock().await;
        self.inner.aggregator.record_tally(task_id, marks).await
    }

    /// Rehydrates a persisted timer after a restart. A running timer whose
    /// last presence marker is older than the away threshold is closed as an
    /// interrupted session ending at that marker.
    pub async fn recover_task(&self, task_id: &str) -> Result<RecoveryOutcome, EngineError> {
        let handle = self.runtime(task_id)?;
        let mut guard = handle.lock().await;
        let state = &mut *guard;
        if let Some(timer) = state.timer.as_ref().filter(|timer| timer.is_active()) {
            return Ok(RecoveryOutcome::Restored(timer.status()));
        }

        let task = self
            .inner
            .store
            .get_task(task_id)
            .await
            .map_err(|error| not_found_or(task_id, "get_task", error))?;
        state.set_base_total(task.total_time_seconds);
        let now = self.now();
        let mut timer = ManualTimer::from_task(&task);

        match task.timer_status {
            TimerStatus::Idle => {
                state.timer = Some(timer);
                Ok(RecoveryOutcome::Idle)
            }
            TimerStatus::Paused => {
                state.timer = Some(timer);
                info!(task_id, "paused timer restored");
                self.publish_mode(task_id, Some(RunMode::Manual));
                Ok(RecoveryOutcome::Restored(TimerStatus::Paused))
            }
            TimerStatus::Running => {
                let last_seen = task
                    .last_active_at
                    .or(task.timer_started_at)
                    .unwrap_or(now);
                let threshold_ms = self.inner.config.away_threshold_seconds.saturating_mul(1000);
                if elapsed_millis(last_seen, now) > threshold_ms {
                    let (run, reset) = timer.stop(last_seen)?;
                    state.timer = Some(timer);
                    warn!(
                        task_id,
                        last_seen = %last_seen,
                        "stale running timer closed as interrupted"
                    );
                    self.write_through(task_id, "recover_task", &reset).await;
                    let outcome = self
                        .record_run(task_id, state, run, SessionStatus::Interrupted)
                        .await?;
                    Ok(RecoveryOutcome::Interrupted(outcome))
                } else {
                    state.timer = Some(timer);
                    self.spawn_ticker(task_id, state);
                    info!(task_id, "running timer restored");
                    self.publish_mode(task_id, Some(RunMode::Manual));
                    Ok(RecoveryOutcome::Restored(TimerStatus::Running))
                }
            }
        }
    }

    /// Stops every tick. Persisted timer columns are left as they are so a
    /// later `recover_task` can pick the runs up.
    pub async fn shutdown(&self) {
        let handles = match self.lock_tasks() {
            Ok(tasks) => tasks.values().cloned().collect::<Vec<_>>(),
            Err(error) => {
                warn!(%error, "shutdown could not read task runtimes");
                return;
            }
        };
        for handle in handles {
            handle.lock().await.cancel_ticker();
        }
        info!(user_id = %self.inner.user_id, "focus engine shut down");
    }

    async fn run_tick(&self, task_id: &str, generation: Option<u64>) -> bool {
        let Some(handle) = self.existing_runtime(task_id) else {
            return false;
        };
        let mut guard = handle.lock().await;
        let state = &mut *guard;
        if generation.is_some_and(|generation| generation != state.ticker_generation) {
            return false;
        }
        let now = self.now();
        let threshold = self.inner.config.away_threshold_seconds;
        let heartbeat_every = u64::from(self.inner.config.heartbeat_every_ticks.max(1));
        let mut keep_going = false;
        let mut writes: Vec<(&'static str, TaskUpdate)> = Vec::new();

        if let Some(timer) = state
            .timer
            .as_mut()
            .filter(|timer| timer.status() == TimerStatus::Running)
        {
            if let Some(update) = timer.check_away(now, threshold) {
                info!(task_id, "manual timer auto-paused while away");
                writes.push(("auto_pause", update));
            } else {
                keep_going = true;
                state.ticks = state.ticks.wrapping_add(1);
                if state.ticks % heartbeat_every == 0 {
                    if let Some(update) = timer.heartbeat(now) {
                        debug!(task_id, ticks = state.ticks, "heartbeat");
                        writes.push(("heartbeat", update));
                    }
                }
            }
            self.publish_time(task_id, timer.display_seconds(now));
        }

        let mut cycle_event = None;
        if let Some(cycle) = state.pomodoro.as_mut().filter(|cycle| {
            matches!(
                cycle.phase(),
                PomodoroPhase::Focus | PomodoroPhase::Break | PomodoroPhase::LongBreak
            )
        }) {
            keep_going = true;
            cycle_event = cycle.tick(now);
            if cycle_event.is_none() {
                self.publish_time(
                    task_id,
                    state.base_total_seconds + cycle.focus_elapsed_seconds(now),
                );
            }
        }

        if !keep_going {
            state.cancel_ticker();
        }
        for (operation, update) in &writes {
            self.write_through(task_id, operation, update).await;
        }

        if let Some(event) = cycle_event {
            let operation = match &event {
                CycleEvent::FocusCompleted(_) => "record_pomodoro",
                CycleEvent::BreakCompleted(_) => "record_break",
            };
            if let Err(error) = self.settle_boundary(task_id, state, event).await {
                self.sync_failed(operation, error.to_string());
            }
            self.publish_phase(task_id, state, now);
        }
        keep_going
    }

    /// Records the interval that ended at a phase boundary. Returns the focus
    /// outcome when a focus interval completed.
    async fn settle_boundary(
        &self,
        task_id: &str,
        state: &mut TaskRuntime,
        event: CycleEvent,
    ) -> Result<Option<RecordOutcome>, EngineError> {
        match event {
            CycleEvent::FocusCompleted(interval) => {
                info!(task_id, "pomodoro focus completed");
                self.close_pomodoro_session(&interval, PomodoroStatus::Completed)
                    .await;
                self.record_interval(task_id, state, &interval, SessionType::Pomodoro, SessionStatus::Completed)
                    .await
                    .map(Some)
            }
            CycleEvent::BreakCompleted(interval) => {
                info!(task_id, "break completed");
                let recorded = self
                    .record_interval(task_id, state, &interval, SessionType::Break, SessionStatus::Completed)
                    .await;
                self.open_pomodoro_session(task_id, state, interval.ended_at)
                    .await;
                recorded.map(|_| None)
            }
        }
    }

    fn spawn_ticker(&self, task_id: &str, state: &mut TaskRuntime) {
        state.cancel_ticker();
        let generation = state.ticker_generation;
        let engine = Arc::downgrade(&self.inner);
        let task_id = task_id.to_string();
        let period = Duration::from_millis(self.inner.config.tick_interval_ms);
        state.ticker = Some(RepeatingTask::spawn("focus-tick", period, move |_| {
            let engine = engine.clone();
            let task_id = task_id.clone();
            async move {
                match engine.upgrade() {
                    Some(inner) => FocusEngine { inner }.run_tick(&task_id, Some(generation)).await,
                    None => false,
                }
            }
        }));
    }

    async fn record_run(
        &self,
        task_id: &str,
        state: &mut TaskRuntime,
        run: CompletedRun,
        status: SessionStatus,
    ) -> Result<RecordOutcome, EngineError> {
        let outcome = self
            .inner
            .recorder
            .record(RecordRequest {
                task_id: task_id.to_string(),
                user_id: self.inner.user_id.clone(),
                start_time: run.run_started_at,
                end_time: run.ended_at,
                excluded_ms: run.excluded_ms,
                session_type: SessionType::Manual,
                status,
            })
            .await?;
        apply_recorded_total(state, &outcome);
        Ok(outcome)
    }

    async fn record_interval(
        &self,
        task_id: &str,
        state: &mut TaskRuntime,
        interval: &IntervalEnd,
        session_type: SessionType,
        status: SessionStatus,
    ) -> Result<RecordOutcome, EngineError> {
        let outcome = self
            .inner
            .recorder
            .record(RecordRequest {
                task_id: task_id.to_string(),
                user_id: self.inner.user_id.clone(),
                start_time: interval.started_at,
                end_time: interval.ended_at,
                excluded_ms: interval.excluded_ms,
                session_type,
                status,
            })
            .await?;
        apply_recorded_total(state, &outcome);
        Ok(outcome)
    }

    async fn open_pomodoro_session(
        &self,
        task_id: &str,
        state: &mut TaskRuntime,
        started_at: DateTime<Utc>,
    ) {
        let Some(cycle) = state.pomodoro.as_mut() else {
            return;
        };
        let created = self
            .inner
            .store
            .create_pomodoro_session(NewPomodoroSession {
                task_id: task_id.to_string(),
                user_id: self.inner.user_id.clone(),
                duration_seconds: cycle.focus_seconds(),
                started_at,
            })
            .await;
        match created {
            Ok(session) => cycle.attach_pomodoro_id(session.id),
            Err(error) => self.sync_failed("create_pomodoro_session", error.to_string()),
        }
    }

    async fn close_pomodoro_session(&self, interval: &IntervalEnd, status: PomodoroStatus) {
        let Some(pomodoro_id) = interval.pomodoro_id.as_deref() else {
            return;
        };
        let update = PomodoroSessionUpdate {
            status,
            completed_at: Some(interval.ended_at),
        };
        if let Err(error) = self
            .inner
            .store
            .update_pomodoro_session(pomodoro_id, &update)
            .await
        {
            self.sync_failed("update_pomodoro_session", error.to_string());
        }
    }

    fn active_cycle<'a>(
        &self,
        task_id: &str,
        state: &'a mut TaskRuntime,
        operation: &'static str,
    ) -> Result<&'a mut PomodoroCycle, EngineError> {
        state
            .pomodoro
            .as_mut()
            .ok_or_else(|| EngineError::invalid_transition(task_id, operation, "idle"))
    }

    /// Error for an operation on a task with no run: `TaskNotFound` when the
    /// store does not know the task, otherwise an idle transition.
    async fn missing_run_error(
        &self,
        task_id: &str,
        state: &mut TaskRuntime,
        operation: &'static str,
    ) -> EngineError {
        match self.load_base_total(task_id, state).await {
            Err(EngineError::TaskNotFound(missing)) => EngineError::TaskNotFound(missing),
            _ => EngineError::invalid_transition(task_id, operation, "idle"),
        }
    }

    async fn load_base_total(
        &self,
        task_id: &str,
        state: &mut TaskRuntime,
    ) -> Result<u64, EngineError> {
        match self.inner.store.get_task(task_id).await {
            Ok(task) => {
                state.set_base_total(task.total_time_seconds);
                Ok(task.total_time_seconds)
            }
            Err(InfraError::NotFound(_)) => Err(EngineError::TaskNotFound(task_id.to_string())),
            Err(error) if state.loaded => {
                self.sync_failed("get_task", error.to_string());
                Ok(state.base_total_seconds)
            }
            Err(error) => Err(EngineError::persistence("get_task", error)),
        }
    }

    async fn write_through(&self, task_id: &str, operation: &str, update: &TaskUpdate) -> bool {
        match self.inner.store.update_task(task_id, update).await {
            Ok(_) => true,
            Err(error) => {
                self.sync_failed(operation, error.to_string());
                false
            }
        }
    }

    fn sync_failed(&self, operation: &str, message: String) {
        warn!(operation, error = %message, "write-through failed; keeping local state");
        self.inner.bus.publish(EngineEvent::SyncFailed {
            operation: operation.to_string(),
            message,
        });
    }

    fn publish_time(&self, task_id: &str, seconds: u64) {
        self.inner.bus.publish(EngineEvent::TimeUpdated {
            task_id: task_id.to_string(),
            seconds,
        });
    }

    fn publish_mode(&self, task_id: &str, mode: Option<RunMode>) {
        self.inner.bus.publish(EngineEvent::ModeSwitched {
            task_id: task_id.to_string(),
            mode,
        });
    }

    fn publish_phase(
        &self,
        task_id: &str,
        state: &TaskRuntime,
        now: DateTime<Utc>,
    ) -> PomodoroSnapshot {
        let snapshot = state
            .pomodoro
            .as_ref()
            .map(|cycle| cycle.snapshot(now))
            .unwrap_or_else(|| PomodoroCycle::new(task_id, self.inner.config.pomodoro).snapshot(now));
        self.inner.bus.publish(EngineEvent::PomodoroPhaseChanged {
            task_id: task_id.to_string(),
            phase: snapshot.phase,
            remaining_seconds: snapshot.remaining_seconds,
        });
        snapshot
    }

    fn now(&self) -> DateTime<Utc> {
        (self.inner.now_provider)()
    }

    fn runtime(&self, task_id: &str) -> Result<RuntimeHandle, EngineError> {
        let mut tasks = self.lock_tasks()?;
        Ok(tasks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(TaskRuntime::default())))
            .clone())
    }

    fn existing_runtime(&self, task_id: &str) -> Option<RuntimeHandle> {
        self.lock_tasks().ok()?.get(task_id).cloned()
    }

    fn lock_tasks(&self) -> Result<MutexGuard<'_, HashMap<String, RuntimeHandle>>, EngineError> {
        self.inner
            .tasks
            .lock()
            .map_err(|error| EngineError::InvalidConfig(format!("task runtime lock poisoned: {error}")))
    }
}

fn timer_snapshot(timer: &ManualTimer, now: DateTime<Utc>) -> TimerSnapshot {
    TimerSnapshot {
        task_id: timer.task_id().to_string(),
        status: timer.status(),
        display_seconds: timer.display_seconds(now),
        current_run_seconds: timer.current_run_seconds(now),
        run_started_at: timer.run_started_at(),
        away: timer.is_away(),
    }
}

fn apply_recorded_total(state: &mut TaskRuntime, outcome: &RecordOutcome) {
    if let Some(total) = outcome
        .recorded()
        .and_then(|recorded| recorded.task_total_seconds)
    {
        state.set_base_total(total);
    }
}

fn not_found_or(task_id: &str, step: &'static str, error: InfraError) -> EngineError {
    match error {
        InfraError::NotFound(_) => EngineError::TaskNotFound(task_id.to_string()),
        other => EngineError::persistence(step, other),
    }
}
