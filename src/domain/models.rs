use crate::domain::rewards::level_for_xp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_id(prefix: &str) -> String {
    let sequence = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{sequence}", Utc::now().timestamp_micros())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    #[default]
    Idle,
    Running,
    Paused,
}

impl TimerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            other => Err(format!("unsupported timer status: {other}")),
        }
    }
}

/// The time-tracking slice of a task record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub total_time_seconds: u64,
    pub timer_status: TimerStatus,
    /// Start of the current leg, not of the run.
    pub timer_started_at: Option<DateTime<Utc>>,
    pub timer_paused_at: Option<DateTime<Utc>>,
    pub accumulated_time_seconds: u64,
    pub last_active_at: Option<DateTime<Utc>>,
    /// Origin of the current run; survives pause/resume legs.
    #[serde(default)]
    pub run_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tally_count: u32,
}

impl Task {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            title: title.into(),
            total_time_seconds: 0,
            timer_status: TimerStatus::Idle,
            timer_started_at: None,
            timer_paused_at: None,
            accumulated_time_seconds: 0,
            last_active_at: None,
            run_started_at: None,
            tally_count: 0,
        }
    }

    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), String> {
        validate_non_empty(&self.id, "task.id")?;
        validate_non_empty(&self.user_id, "task.user_id")?;
        match self.timer_status {
            TimerStatus::Idle => {
                if self.timer_started_at.is_some() || self.timer_paused_at.is_some() {
                    return Err("idle task must not carry timer timestamps".to_string());
                }
            }
            TimerStatus::Running => match self.timer_started_at {
                Some(started_at) if started_at <= now => {}
                Some(_) => return Err("task.timer_started_at must not be in the future".to_string()),
                None => return Err("running task requires task.timer_started_at".to_string()),
            },
            TimerStatus::Paused => {
                if self.timer_paused_at.is_none() {
                    return Err("paused task requires task.timer_paused_at".to_string());
                }
            }
        }
        Ok(())
    }
}

/// Partial task update. `Some(None)` clears a nullable column.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TaskUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_time_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timer_status: Option<TimerStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timer_started_at: Option<Option<DateTime<Utc>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timer_paused_at: Option<Option<DateTime<Utc>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accumulated_time_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<Option<DateTime<Utc>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_started_at: Option<Option<DateTime<Utc>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tally_count: Option<u32>,
}

impl TaskUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, task: &mut Task) {
        if let Some(total) = self.total_time_seconds {
            task.total_time_seconds = total;
        }
        if let Some(status) = self.timer_status {
            task.timer_status = status;
        }
        if let Some(started_at) = self.timer_started_at {
            task.timer_started_at = started_at;
        }
        if let Some(paused_at) = self.timer_paused_at {
            task.timer_paused_at = paused_at;
        }
        if let Some(accumulated) = self.accumulated_time_seconds {
            task.accumulated_time_seconds = accumulated;
        }
        if let Some(last_active_at) = self.last_active_at {
            task.last_active_at = last_active_at;
        }
        if let Some(run_started_at) = self.run_started_at {
            task.run_started_at = run_started_at;
        }
        if let Some(tally_count) = self.tally_count {
            task.tally_count = tally_count;
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Manual,
    Pomodoro,
    Break,
}

impl SessionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Pomodoro => "pomodoro",
            Self::Break => "break",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "pomodoro" => Ok(Self::Pomodoro),
            "break" => Ok(Self::Break),
            other => Err(format!("unsupported session type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Completed,
    Abandoned,
    Interrupted,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "completed" => Ok(Self::Completed),
            "abandoned" => Ok(Self::Abandoned),
            "interrupted" => Ok(Self::Interrupted),
            other => Err(format!("unsupported session status: {other}")),
        }
    }
}

/// Payload accepted by `FocusStore::create_session`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionPayload {
    pub task_id: String,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: u64,
    pub session_type: SessionType,
    pub xp_earned: u32,
    pub coins_earned: u32,
    pub status: SessionStatus,
}

impl SessionPayload {
    pub fn into_session(self, id: String) -> TimeTrackingSession {
        TimeTrackingSession {
            id,
            task_id: self.task_id,
            user_id: self.user_id,
            start_time: self.start_time,
            end_time: self.end_time,
            duration_seconds: self.duration_seconds,
            session_type: self.session_type,
            xp_earned: self.xp_earned,
            coins_earned: self.coins_earned,
            status: self.status,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeTrackingSession {
    pub id: String,
    pub task_id: String,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: u64,
    pub session_type: SessionType,
    pub xp_earned: u32,
    pub coins_earned: u32,
    pub status: SessionStatus,
}

impl TimeTrackingSession {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "session.id")?;
        validate_non_empty(&self.task_id, "session.task_id")?;
        validate_non_empty(&self.user_id, "session.user_id")?;
        if self.end_time < self.start_time {
            return Err("session.end_time must be >= session.start_time".to_string());
        }
        let span = (self.end_time - self.start_time).num_seconds().max(0) as u64;
        if self.duration_seconds > span {
            return Err("session.duration_seconds must not exceed its wall-clock span".to_string());
        }
        Ok(())
    }

    pub fn is_focus(&self) -> bool {
        self.session_type != SessionType::Break
    }
}

/// Filter for `FocusStore::list_sessions`; bounds apply to `start_time`, inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionQuery {
    pub user_id: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub task_id: Option<String>,
}

impl SessionQuery {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            start_date: None,
            end_date: None,
            task_id: None,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_date = Some(start);
        self.end_date = Some(end);
        self
    }

    pub fn matches(&self, session: &TimeTrackingSession) -> bool {
        session.user_id == self.user_id
            && self
                .task_id
                .as_deref()
                .map(|task_id| session.task_id == task_id)
                .unwrap_or(true)
            && self
                .start_date
                .map(|start| session.start_time >= start)
                .unwrap_or(true)
            && self
                .end_date
                .map(|end| session.start_time <= end)
                .unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PomodoroStatus {
    InProgress,
    Completed,
    Aborted,
}

impl PomodoroStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "in_progress" | "in-progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unsupported pomodoro status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewPomodoroSession {
    pub task_id: String,
    pub user_id: String,
    pub duration_seconds: u64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PomodoroSession {
    pub id: String,
    pub task_id: String,
    pub user_id: String,
    /// Planned length of the focus interval.
    pub duration_seconds: u64,
    pub status: PomodoroStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PomodoroSession {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "pomodoro.id")?;
        validate_non_empty(&self.task_id, "pomodoro.task_id")?;
        if self.duration_seconds == 0 {
            return Err("pomodoro.duration_seconds must be > 0".to_string());
        }
        match (self.status, self.completed_at) {
            (PomodoroStatus::InProgress, Some(_)) => {
                Err("in-progress pomodoro must not have completed_at".to_string())
            }
            (_, Some(completed_at)) if completed_at < self.started_at => {
                Err("pomodoro.completed_at must be >= pomodoro.started_at".to_string())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PomodoroSessionUpdate {
    pub status: PomodoroStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub user_id: String,
    pub xp: u64,
    pub coins: u64,
    pub level: u32,
}

impl Profile {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            xp: 0,
            coins: 0,
            level: level_for_xp(0),
        }
    }

    pub fn apply(&mut self, update: &ProfileUpdate) {
        if let Some(xp) = update.xp {
            self.xp = xp;
        }
        if let Some(coins) = update.coins {
            self.coins = coins;
        }
        self.level = level_for_xp(self.xp);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coins: Option<u64>,
}

/// Which controller owns a task's active run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Manual,
    Pomodoro,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FocusTimeBreakdown {
    pub manual_time: u64,
    pub completed_pomodoro_time: u64,
    pub incomplete_pomodoro_time: u64,
    pub current_session_time: u64,
    pub total: u64,
    pub tally_count: u32,
}

impl FocusTimeBreakdown {
    pub fn is_balanced(&self) -> bool {
        self.total
            == self.manual_time
                + self.completed_pomodoro_time
                + self.incomplete_pomodoro_time
                + self.current_session_time
    }
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}
