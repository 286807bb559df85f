use crate::application::error::EngineError;
use crate::domain::clock::{elapsed_millis, elapsed_seconds};
use crate::domain::models::{Task, TaskUpdate, TimerStatus};
use chrono::{DateTime, Utc};

/// A finished manual run, ready for the recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedRun {
    pub run_started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub active_ms: u64,
    /// Paused and away time inside the run span.
    pub excluded_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisibilityChange {
    Unchanged,
    /// Came back before the away threshold; the hidden gap is credited.
    Continued,
    /// The run was auto-paused while hidden and stays paused.
    AwayDetected {
        away_seconds: u64,
        auto_pause: Option<TaskUpdate>,
    },
}

/// Manual stopwatch for one task. Every operation takes `now` explicitly so the
/// machine stays deterministic; the engine owns the clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualTimer {
    task_id: String,
    base_total_seconds: u64,
    status: TimerStatus,
    run_started_at: Option<DateTime<Utc>>,
    leg_started_at: Option<DateTime<Utc>>,
    paused_at: Option<DateTime<Utc>>,
    accumulated_ms: u64,
    hidden_at: Option<DateTime<Utc>>,
    away: bool,
}

impl ManualTimer {
    pub fn new(task_id: impl Into<String>, base_total_seconds: u64) -> Self {
        Self {
            task_id: task_id.into(),
            base_total_seconds,
            status: TimerStatus::Idle,
            run_started_at: None,
            leg_started_at: None,
            paused_at: None,
            accumulated_ms: 0,
            hidden_at: None,
            away: false,
        }
    }

    /// Rehydrates the persisted timer columns of `task`.
    pub fn from_task(task: &Task) -> Self {
        let mut timer = Self::new(task.id.clone(), task.total_time_seconds);
        match task.timer_status {
            TimerStatus::Idle => {}
            TimerStatus::Running => {
                timer.status = TimerStatus::Running;
                timer.leg_started_at = task.timer_started_at;
                timer.run_started_at = task.run_started_at.or(task.timer_started_at);
                timer.accumulated_ms = task.accumulated_time_seconds.saturating_mul(1000);
            }
            TimerStatus::Paused => {
                timer.status = TimerStatus::Paused;
                timer.paused_at = task.timer_paused_at;
                timer.run_started_at = task
                    .run_started_at
                    .or(task.timer_started_at)
                    .or(task.timer_paused_at);
                timer.accumulated_ms = task.accumulated_time_seconds.saturating_mul(1000);
            }
        }
        timer
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn status(&self) -> TimerStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status != TimerStatus::Idle
    }

    pub fn is_away(&self) -> bool {
        self.away
    }

    pub fn run_started_at(&self) -> Option<DateTime<Utc>> {
        self.run_started_at
    }

    pub fn base_total_seconds(&self) -> u64 {
        self.base_total_seconds
    }

    pub fn set_base_total_seconds(&mut self, total_seconds: u64) {
        self.base_total_seconds = total_seconds;
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<TaskUpdate, EngineError> {
        if self.status != TimerStatus::Idle {
            return Err(self.invalid("start"));
        }
        self.status = TimerStatus::Running;
        self.run_started_at = Some(now);
        self.leg_started_at = Some(now);
        self.paused_at = None;
        self.accumulated_ms = 0;
        self.hidden_at = None;
        self.away = false;
        Ok(TaskUpdate {
            timer_status: Some(TimerStatus::Running),
            timer_started_at: Some(Some(now)),
            timer_paused_at: Some(None),
            accumulated_time_seconds: Some(0),
            last_active_at: Some(Some(now)),
            run_started_at: Some(Some(now)),
            ..TaskUpdate::default()
        })
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<TaskUpdate, EngineError> {
        if self.status != TimerStatus::Running {
            return Err(self.invalid("pause"));
        }
        Ok(self.pause_at(now, now))
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<TaskUpdate, EngineError> {
        if self.status != TimerStatus::Paused {
            return Err(self.invalid("resume"));
        }
        self.status = TimerStatus::Running;
        self.leg_started_at = Some(now);
        self.paused_at = None;
        self.hidden_at = None;
        self.away = false;
        Ok(TaskUpdate {
            timer_status: Some(TimerStatus::Running),
            timer_started_at: Some(Some(now)),
            timer_paused_at: Some(None),
            last_active_at: Some(Some(now)),
            ..TaskUpdate::default()
        })
    }

    /// Ends the run. The task columns go back to idle; the total is left to the
    /// recorder.
    pub fn stop(&mut self, now: DateTime<Utc>) -> Result<(CompletedRun, TaskUpdate), EngineError> {
        if self.status == TimerStatus::Idle {
            return Err(self.invalid("stop"));
        }
        let active_ms = self.active_millis(now);
        let run_started_at = self.run_started_at.unwrap_or(now);
        let ended_at = now.max(run_started_at);
        let span_ms = elapsed_millis(run_started_at, ended_at);
        let run = CompletedRun {
            run_started_at,
            ended_at,
            active_ms: active_ms.min(span_ms),
            excluded_ms: span_ms.saturating_sub(active_ms),
        };
        self.reset();
        Ok((run, Self::idle_update()))
    }

    /// Abandons the in-memory run without producing a session.
    pub fn reset(&mut self) {
        let base_total_seconds = self.base_total_seconds;
        *self = Self::new(self.task_id.clone(), base_total_seconds);
    }

    pub fn idle_update() -> TaskUpdate {
        TaskUpdate {
            timer_status: Some(TimerStatus::Idle),
            timer_started_at: Some(None),
            timer_paused_at: Some(None),
            accumulated_time_seconds: Some(0),
            run_started_at: Some(None),
            ..TaskUpdate::default()
        }
    }

    /// Active milliseconds of the current run, live leg included.
    pub fn active_millis(&self, now: DateTime<Utc>) -> u64 {
        let live = match (self.status, self.leg_started_at) {
            (TimerStatus::Running, Some(leg_started_at)) => elapsed_millis(leg_started_at, now),
            _ => 0,
        };
        self.accumulated_ms.saturating_add(live)
    }

    pub fn current_run_seconds(&self, now: DateTime<Utc>) -> u64 {
        self.active_millis(now) / 1000
    }

    /// Value shown by the ticking display: stored total plus the live run.
    pub fn display_seconds(&self, now: DateTime<Utc>) -> u64 {
        self.base_total_seconds
            .saturating_add(self.current_run_seconds(now))
    }

    pub fn page_hidden(&mut self, now: DateTime<Utc>) {
        if self.status == TimerStatus::Running && self.hidden_at.is_none() {
            self.hidden_at = Some(now);
        }
    }

    /// Auto-pauses a hidden run once the gap exceeds `threshold_seconds`,
    /// backdated to the moment it was hidden.
    pub fn check_away(&mut self, now: DateTime<Utc>, threshold_seconds: u64) -> Option<TaskUpdate> {
        if self.status != TimerStatus::Running {
            return None;
        }
        let hidden_at = self.hidden_at?;
        if elapsed_millis(hidden_at, now) <= threshold_seconds.saturating_mul(1000) {
            return None;
        }
        let paused_at = self
            .leg_started_at
            .map(|leg_started_at| hidden_at.max(leg_started_at))
            .unwrap_or(hidden_at);
        let update = self.pause_at(paused_at, paused_at);
        self.hidden_at = Some(hidden_at);
        self.away = true;
        Some(update)
    }

    pub fn page_visible(&mut self, now: DateTime<Utc>, threshold_seconds: u64) -> VisibilityChange {
        let auto_pause = self.check_away(now, threshold_seconds);
        let Some(hidden_at) = self.hidden_at.take() else {
            return VisibilityChange::Unchanged;
        };
        if self.away {
            return VisibilityChange::AwayDetected {
                away_seconds: elapsed_seconds(hidden_at, now),
                auto_pause,
            };
        }
        if self.status == TimerStatus::Running {
            VisibilityChange::Continued
        } else {
            VisibilityChange::Unchanged
        }
    }

    /// Presence marker for crash recovery; only while running and visible.
    pub fn heartbeat(&self, now: DateTime<Utc>) -> Option<TaskUpdate> {
        if self.status != TimerStatus::Running || self.hidden_at.is_some() {
            return None;
        }
        Some(TaskUpdate {
            last_active_at: Some(Some(now)),
            ..TaskUpdate::default()
        })
    }

    fn pause_at(&mut self, paused_at: DateTime<Utc>, last_active_at: DateTime<Utc>) -> TaskUpdate {
        self.accumulated_ms = self.active_millis(paused_at);
        self.status = TimerStatus::Paused;
        self.leg_started_at = None;
        self.paused_at = Some(paused_at);
        self.hidden_at = None;
        TaskUpdate {
            timer_status: Some(TimerStatus::Paused),
            timer_started_at: Some(None),
            timer_paused_at: Some(Some(paused_at)),
            accumulated_time_seconds: Some(self.accumulated_ms / 1000),
            last_active_at: Some(Some(last_active_at)),
            ..TaskUpdate::default()
        }
    }

    fn invalid(&self, operation: &'static str) -> EngineError {
        EngineError::invalid_transition(&self.task_id, operation, self.status.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn t0() -> DateTime<Utc> {
        fixed_time("2026-02-16T09:00:00Z")
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        t0() + Duration::seconds(seconds)
    }

    #[test]
    fn pause_resume_stop_scenario_credits_active_time_only() {
        let mut timer = ManualTimer::new("tsk-1", 0);
        timer.start(at(0)).expect("start");
        timer.pause(at(45)).expect("pause");
        timer.resume(at(100)).expect("resume");
        let (run, update) = timer.stop(at(145)).expect("stop");

        assert_eq!(run.run_started_at, at(0));
        assert_eq!(run.ended_at, at(145));
        assert_eq!(run.active_ms, 90_000);
        assert_eq!(run.excluded_ms, 55_000);
        assert_eq!(update.timer_status, Some(TimerStatus::Idle));
        assert_eq!(timer.status(), TimerStatus::Idle);
    }

    #[test]
    fn transitions_are_guarded() {
        let mut timer = ManualTimer::new("tsk-1", 0);
        assert!(matches!(
            timer.pause(at(0)),
            Err(EngineError::InvalidTransition { operation: "pause", .. })
        ));
        assert!(timer.resume(at(0)).is_err());
        assert!(timer.stop(at(0)).is_err());

        timer.start(at(0)).expect("start");
        assert!(timer.start(at(1)).is_err());
        assert!(timer.resume(at(1)).is_err());

        timer.pause(at(2)).expect("pause");
        assert!(timer.pause(at(3)).is_err());
        assert!(timer.start(at(3)).is_err());
    }

    #[test]
    fn display_adds_live_leg_to_stored_total() {
        let mut timer = ManualTimer::new("tsk-1", 600);
        timer.start(at(0)).expect("start");
        assert_eq!(timer.display_seconds(at(0)), 600);
        assert_eq!(timer.display_seconds(at(75)), 675);
        timer.pause(at(80)).expect("pause");
        assert_eq!(timer.display_seconds(at(500)), 680);
    }

    #[test]
    fn hidden_past_threshold_auto_pauses_backdated() {
        let mut timer = ManualTimer::new("tsk-1", 0);
        timer.start(at(0)).expect("start");
        timer.page_hidden(at(20));

        assert!(timer.check_away(at(50), 30).is_none());
        let update = timer.check_away(at(51), 30).expect("auto pause");
        assert_eq!(update.timer_paused_at, Some(Some(at(20))));
        assert_eq!(timer.status(), TimerStatus::Paused);
        assert_eq!(timer.current_run_seconds(at(51)), 20);

        match timer.page_visible(at(90), 30) {
            VisibilityChange::AwayDetected {
                away_seconds,
                auto_pause,
            } => {
                assert_eq!(away_seconds, 70);
                assert!(auto_pause.is_none());
            }
            other => panic!("expected away detection, got {other:?}"),
        }
        assert_eq!(timer.status(), TimerStatus::Paused);

        timer.resume(at(95)).expect("resume");
        let (run, _) = timer.stop(at(105)).expect("stop");
        assert_eq!(run.active_ms, 30_000);
        assert_eq!(run.excluded_ms, 75_000);
    }

    #[test]
    fn short_absence_continues_and_counts() {
        let mut timer = ManualTimer::new("tsk-1", 0);
        timer.start(at(0)).expect("start");
        timer.page_hidden(at(10));
        assert_eq!(timer.page_visible(at(30), 30), VisibilityChange::Continued);
        assert_eq!(timer.status(), TimerStatus::Running);
        assert_eq!(timer.current_run_seconds(at(40)), 40);
    }

    #[test]
    fn returning_after_threshold_without_tick_still_detects_away() {
        let mut timer = ManualTimer::new("tsk-1", 0);
        timer.start(at(0)).expect("start");
        timer.page_hidden(at(5));
        match timer.page_visible(at(120), 30) {
            VisibilityChange::AwayDetected {
                away_seconds,
                auto_pause,
            } => {
                assert_eq!(away_seconds, 115);
                assert!(auto_pause.is_some());
            }
            other => panic!("expected away detection, got {other:?}"),
        }
        assert_eq!(timer.current_run_seconds(at(120)), 5);
    }

    #[test]
    fn heartbeat_only_while_running_and_visible() {
        let mut timer = ManualTimer::new("tsk-1", 0);
        assert!(timer.heartbeat(at(0)).is_none());
        timer.start(at(0)).expect("start");
        assert_eq!(
            timer.heartbeat(at(10)).and_then(|update| update.last_active_at),
            Some(Some(at(10)))
        );
        timer.page_hidden(at(11));
        assert!(timer.heartbeat(at(12)).is_none());
    }

    #[test]
    fn from_task_restores_paused_run() {
        let mut task = Task::new("tsk-1", "usr-1", "Recover");
        task.total_time_seconds = 300;
        task.timer_status = TimerStatus::Paused;
        task.timer_paused_at = Some(at(60));
        task.run_started_at = Some(at(0));
        task.accumulated_time_seconds = 60;

        let mut timer = ManualTimer::from_task(&task);
        assert_eq!(timer.display_seconds(at(200)), 360);
        timer.resume(at(200)).expect("resume");
        let (run, _) = timer.stop(at(230)).expect("stop");
        assert_eq!(run.run_started_at, at(0));
        assert_eq!(run.active_ms, 90_000);
    }

    proptest! {
        #[test]
        fn pause_resume_cycles_never_change_credited_time(
            legs in proptest::collection::vec((1i64..600i64, 1i64..600i64), 1..8)
        ) {
            let mut timer = ManualTimer::new("tsk-1", 0);
            let mut cursor = 0i64;
            let mut expected_active = 0i64;
            timer.start(at(cursor)).expect("start");
            for (active, paused) in &legs {
                cursor += active;
                expected_active += active;
                timer.pause(at(cursor)).expect("pause");
                cursor += paused;
                timer.resume(at(cursor)).expect("resume");
            }
            let (run, _) = timer.stop(at(cursor)).expect("stop");
            prop_assert_eq!(run.active_ms, expected_active as u64 * 1000);
            prop_assert_eq!(run.active_ms + run.excluded_ms, cursor as u64 * 1000);
        }
    }
}
