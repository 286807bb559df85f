use crate::application::error::EngineError;
use crate::domain::clock::elapsed_millis;
use crate::infrastructure::config::PomodoroDurations;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PomodoroPhase {
    Idle,
    Focus,
    Break,
    LongBreak,
    Paused,
}

impl PomodoroPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Focus => "focus",
            Self::Break => "break",
            Self::LongBreak => "long_break",
            Self::Paused => "paused",
        }
    }

    fn is_break(self) -> bool {
        matches!(self, Self::Break | Self::LongBreak)
    }
}

/// A finished interval, stamped with the instant the countdown hit zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalEnd {
    pub phase: PomodoroPhase,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub nominal_seconds: u64,
    pub excluded_ms: u64,
    pub pomodoro_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleEvent {
    FocusCompleted(IntervalEnd),
    BreakCompleted(IntervalEnd),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortOutcome {
    /// Focus cut short; `ended_at` is the abort instant.
    FocusAborted(IntervalEnd),
    BreakEnded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PomodoroSnapshot {
    pub task_id: String,
    pub phase: PomodoroPhase,
    pub paused_phase: Option<PomodoroPhase>,
    pub remaining_seconds: u64,
    pub completed_focus_count: u32,
    pub pomodoro_id: Option<String>,
}

/// Focus/break countdown for one task, driven by explicit timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PomodoroCycle {
    task_id: String,
    durations: PomodoroDurations,
    phase: PomodoroPhase,
    paused_phase: Option<PomodoroPhase>,
    phase_started_at: Option<DateTime<Utc>>,
    paused_at: Option<DateTime<Utc>>,
    paused_ms: u64,
    completed_focus_count: u32,
    pomodoro_id: Option<String>,
}

impl PomodoroCycle {
    pub fn new(task_id: impl Into<String>, durations: PomodoroDurations) -> Self {
        Self {
            task_id: task_id.into(),
            durations,
            phase: PomodoroPhase::Idle,
            paused_phase: None,
            phase_started_at: None,
            paused_at: None,
            paused_ms: 0,
            completed_focus_count: 0,
            pomodoro_id: None,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn phase(&self) -> PomodoroPhase {
        self.phase
    }

    /// The running phase, looking through a pause.
    pub fn effective_phase(&self) -> PomodoroPhase {
        self.paused_phase.unwrap_or(self.phase)
    }

    pub fn is_active(&self) -> bool {
        self.phase != PomodoroPhase::Idle
    }

    pub fn in_focus(&self) -> bool {
        self.effective_phase() == PomodoroPhase::Focus
    }

    pub fn completed_focus_count(&self) -> u32 {
        self.completed_focus_count
    }

    pub fn pomodoro_id(&self) -> Option<&str> {
        self.pomodoro_id.as_deref()
    }

    pub fn attach_pomodoro_id(&mut self, pomodoro_id: String) {
        self.pomodoro_id = Some(pomodoro_id);
    }

    pub fn focus_seconds(&self) -> u64 {
        self.durations.focus_seconds
    }

    pub fn start_focus(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if self.phase != PomodoroPhase::Idle {
            return Err(self.invalid("start pomodoro"));
        }
        self.begin(PomodoroPhase::Focus, now);
        Ok(())
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if !matches!(
            self.phase,
            PomodoroPhase::Focus | PomodoroPhase::Break | PomodoroPhase::LongBreak
        ) {
            return Err(self.invalid("pause pomodoro"));
        }
        self.paused_phase = Some(self.phase);
        self.phase = PomodoroPhase::Paused;
        self.paused_at = Some(now);
        Ok(())
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if self.phase != PomodoroPhase::Paused {
            return Err(self.invalid("resume pomodoro"));
        }
        let resume_phase = self
            .paused_phase
            .take()
            .ok_or_else(|| self.invalid("resume pomodoro"))?;
        if let Some(paused_at) = self.paused_at.take() {
            self.paused_ms = self
                .paused_ms
                .saturating_add(elapsed_millis(paused_at, now));
        }
        self.phase = resume_phase;
        Ok(())
    }

    /// Advances at most one phase boundary.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<CycleEvent> {
        if !matches!(
            self.phase,
            PomodoroPhase::Focus | PomodoroPhase::Break | PomodoroPhase::LongBreak
        ) {
            return None;
        }
        let completed_at = self.completion_instant()?;
        if now < completed_at {
            return None;
        }
        let finished = self.interval_end(completed_at);
        if self.phase == PomodoroPhase::Focus {
            self.completed_focus_count = self.completed_focus_count.saturating_add(1);
            self.pomodoro_id = None;
            let next = if self.durations.long_break_every > 0
                && self.completed_focus_count % self.durations.long_break_every == 0
            {
                PomodoroPhase::LongBreak
            } else {
                PomodoroPhase::Break
            };
            self.begin(next, completed_at);
            Some(CycleEvent::FocusCompleted(finished))
        } else {
            self.begin(PomodoroPhase::Focus, completed_at);
            Some(CycleEvent::BreakCompleted(finished))
        }
    }

    pub fn skip_break(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if !self.effective_phase().is_break() {
            return Err(self.invalid("skip break"));
        }
        self.begin(PomodoroPhase::Focus, now);
        Ok(())
    }

    pub fn abort(&mut self, now: DateTime<Utc>) -> Result<AbortOutcome, EngineError> {
        let outcome = match self.effective_phase() {
            PomodoroPhase::Focus => {
                let ended_at = self.paused_at.unwrap_or(now);
                let mut finished = self.interval_end(ended_at);
                finished.ended_at = now.max(finished.started_at);
                finished.excluded_ms = self.paused_ms_at(now);
                AbortOutcome::FocusAborted(finished)
            }
            PomodoroPhase::Break | PomodoroPhase::LongBreak => AbortOutcome::BreakEnded,
            PomodoroPhase::Idle | PomodoroPhase::Paused => {
                return Err(self.invalid("abort pomodoro"));
            }
        };
        let completed_focus_count = self.completed_focus_count;
        *self = Self::new(self.task_id.clone(), self.durations);
        self.completed_focus_count = completed_focus_count;
        Ok(outcome)
    }

    pub fn nominal_seconds(&self) -> u64 {
        match self.effective_phase() {
            PomodoroPhase::Focus => self.durations.focus_seconds,
            PomodoroPhase::Break => self.durations.break_seconds,
            PomodoroPhase::LongBreak => self.durations.long_break_seconds,
            PomodoroPhase::Idle | PomodoroPhase::Paused => 0,
        }
    }

    /// Active milliseconds spent in the current phase.
    pub fn elapsed_millis(&self, now: DateTime<Utc>) -> u64 {
        let Some(started_at) = self.phase_started_at else {
            return 0;
        };
        let until = self.paused_at.unwrap_or(now);
        elapsed_millis(started_at, until).saturating_sub(self.paused_ms)
    }

    /// Elapsed focus seconds, zero outside focus.
    pub fn focus_elapsed_seconds(&self, now: DateTime<Utc>) -> u64 {
        if !self.in_focus() {
            return 0;
        }
        (self.elapsed_millis(now) / 1000).min(self.durations.focus_seconds)
    }

    /// Countdown value, rounded up so zero only shows at completion.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> u64 {
        let nominal_ms = self.nominal_seconds().saturating_mul(1000);
        nominal_ms.saturating_sub(self.elapsed_millis(now)).div_ceil(1000)
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> PomodoroSnapshot {
        PomodoroSnapshot {
            task_id: self.task_id.clone(),
            phase: self.phase,
            paused_phase: self.paused_phase,
            remaining_seconds: self.remaining_seconds(now),
            completed_focus_count: self.completed_focus_count,
            pomodoro_id: self.pomodoro_id.clone(),
        }
    }

    fn completion_instant(&self) -> Option<DateTime<Utc>> {
        let started_at = self.phase_started_at?;
        let total_ms = self
            .nominal_seconds()
            .saturating_mul(1000)
            .saturating_add(self.paused_ms);
        Some(started_at + Duration::milliseconds(i64::try_from(total_ms).ok()?))
    }

    fn interval_end(&self, ended_at: DateTime<Utc>) -> IntervalEnd {
        let started_at = self.phase_started_at.unwrap_or(ended_at);
        IntervalEnd {
            phase: self.effective_phase(),
            started_at,
            ended_at,
            nominal_seconds: self.nominal_seconds(),
            excluded_ms: self.paused_ms,
            pomodoro_id: self.pomodoro_id.clone(),
        }
    }

    fn paused_ms_at(&self, now: DateTime<Utc>) -> u64 {
        let open_pause = self
            .paused_at
            .map(|paused_at| elapsed_millis(paused_at, now))
            .unwrap_or(0);
        self.paused_ms.saturating_add(open_pause)
    }

    fn begin(&mut self, phase: PomodoroPhase, started_at: DateTime<Utc>) {
        self.phase = phase;
        self.paused_phase = None;
        self.phase_started_at = Some(started_at);
        self.paused_at = None;
        self.paused_ms = 0;
    }

    fn invalid(&self, operation: &'static str) -> EngineError {
        EngineError::invalid_transition(&self.task_id, operation, self.phase.as_str())
    }
}
