use crate::application::error::EngineError;
use crate::domain::models::{
    FocusTimeBreakdown, SessionQuery, SessionStatus, SessionType, TaskUpdate, TimeTrackingSession,
};
use crate::infrastructure::focus_store::FocusStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Splits recorded focus time into buckets. Breaks land in no bucket.
pub fn breakdown_from_sessions(
    sessions: &[TimeTrackingSession],
    current_session_time: u64,
    tally_count: u32,
) -> FocusTimeBreakdown {
    let mut breakdown = FocusTimeBreakdown {
        current_session_time,
        tally_count,
        ..FocusTimeBreakdown::default()
    };
    for session in sessions {
        match (session.session_type, session.status) {
            (SessionType::Manual, _) => breakdown.manual_time += session.duration_seconds,
            (SessionType::Pomodoro, SessionStatus::Completed) => {
                breakdown.completed_pomodoro_time += session.duration_seconds
            }
            (SessionType::Pomodoro, _) => {
                breakdown.incomplete_pomodoro_time += session.duration_seconds
            }
            (SessionType::Break, _) => {}
        }
    }
    breakdown.total = breakdown.manual_time
        + breakdown.completed_pomodoro_time
        + breakdown.incomplete_pomodoro_time
        + breakdown.current_session_time;
    breakdown
}

/// Every non-break session plus the live run.
pub fn total_focus_time(sessions: &[TimeTrackingSession], current_session_time: u64) -> u64 {
    sessions
        .iter()
        .filter(|session| session.is_focus())
        .map(|session| session.duration_seconds)
        .sum::<u64>()
        + current_session_time
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FocusSummary {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub completed_count: u32,
    pub interrupted_count: u32,
    pub total_focus_seconds: u64,
    pub xp_earned: u64,
    pub coins_earned: u64,
    pub sessions: Vec<TimeTrackingSession>,
}

#[derive(Clone)]
pub struct FocusAggregator {
    store: Arc<dyn FocusStore>,
}

impl FocusAggregator {
    pub fn new(store: Arc<dyn FocusStore>) -> Self {
        Self { store }
    }

    pub async fn time_breakdown(
        &self,
        user_id: &str,
        task_id: &str,
        current_session_time: u64,
    ) -> Result<FocusTimeBreakdown, EngineError> {
        let task = self
            .store
            .get_task(task_id)
            .await
            .map_err(|error| EngineError::persistence("get_task", error))?;
        let sessions = self.task_sessions(user_id, task_id).await?;
        Ok(breakdown_from_sessions(
            &sessions,
            current_session_time,
            task.tally_count,
        ))
    }

    pub async fn total_focus_time(
        &self,
        user_id: &str,
        task_id: &str,
        current_session_time: u64,
    ) -> Result<u64, EngineError> {
        let sessions = self.task_sessions(user_id, task_id).await?;
        Ok(total_focus_time(&sessions, current_session_time))
    }

    /// Range report over a user's sessions, bounded on `start_time`.
    pub async fn focus_summary(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<FocusSummary, EngineError> {
        if end <= start {
            return Err(EngineError::InvalidRange { start, end });
        }
        let sessions = self
            .store
            .list_sessions(&SessionQuery::for_user(user_id).between(start, end))
            .await
            .map_err(|error| EngineError::persistence("list_sessions", error))?;

        let completed_count = sessions
            .iter()
            .filter(|session| session.is_focus() && session.status == SessionStatus::Completed)
            .count() as u32;
        let interrupted_count = sessions
            .iter()
            .filter(|session| session.is_focus() && session.status != SessionStatus::Completed)
            .count() as u32;
        let total_focus_seconds = total_focus_time(&sessions, 0);
        let xp_earned = sessions.iter().map(|session| u64::from(session.xp_earned)).sum();
        let coins_earned = sessions
            .iter()
            .map(|session| u64::from(session.coins_earned))
            .sum();

        Ok(FocusSummary {
            start,
            end,
            completed_count,
            interrupted_count,
            total_focus_seconds,
            xp_earned,
            coins_earned,
            sessions,
        })
    }

    /// Adds tally marks; the count is display-only and never enters totals.
    pub async fn record_tally(&self, task_id: &str, marks: u32) -> Result<u32, EngineError> {
        let task = self
            .store
            .get_task(task_id)
            .await
            .map_err(|error| EngineError::persistence("get_task", error))?;
        let updated = self
            .store
            .update_task(
                task_id,
                &TaskUpdate {
                    tally_count: Some(task.tally_count.saturating_add(marks)),
                    ..TaskUpdate::default()
                },
            )
            .await
            .map_err(|error| EngineError::persistence("record_tally", error))?;
        Ok(updated.tally_count)
    }

    async fn task_sessions(
        &self,
        user_id: &str,
        task_id: &str,
    ) -> Result<Vec<TimeTrackingSession>, EngineError> {
        self.store
            .list_sessions(&SessionQuery::for_user(user_id).with_task(task_id))
            .await
            .map_err(|error| EngineError::persistence("list_sessions", error))
    }
}
