use crate::application::error::EngineError;
use crate::application::events::{EngineEvent, EventBus};
use crate::domain::clock::elapsed_millis;
use crate::domain::models::{
    Profile, ProfileUpdate, SessionPayload, SessionStatus, SessionType, TaskUpdate,
    TimeTrackingSession,
};
use crate::domain::rewards::{Reward, RewardPolicy, level_for_xp};
use crate::infrastructure::focus_store::FocusStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRequest {
    pub task_id: String,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Paused or away time inside `start_time..end_time`.
    pub excluded_ms: u64,
    pub session_type: SessionType,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSession {
    pub session: TimeTrackingSession,
    pub reward: Reward,
    /// Task total after crediting; `None` for breaks.
    pub task_total_seconds: Option<u64>,
    pub profile: Option<Profile>,
    pub level_up: Option<(u32, u32)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Recorded(Box<RecordedSession>),
    /// Shorter than the session floor; nothing was written.
    Discarded { duration_seconds: u64 },
}

impl RecordOutcome {
    pub fn recorded(&self) -> Option<&RecordedSession> {
        match self {
            Self::Recorded(recorded) => Some(recorded),
            Self::Discarded { .. } => None,
        }
    }
}

/// Turns a finished interval into a session row, a task total and a reward.
#[derive(Clone)]
pub struct SessionRecorder {
    store: Arc<dyn FocusStore>,
    policy: RewardPolicy,
    bus: EventBus,
}

impl SessionRecorder {
    pub fn new(store: Arc<dyn FocusStore>, policy: RewardPolicy, bus: EventBus) -> Self {
        Self { store, policy, bus }
    }

    pub fn policy(&self) -> &RewardPolicy {
        &self.policy
    }

    /// Credited seconds for a request: wall-clock span minus excluded time,
    /// floored.
    pub fn credited_seconds(request: &RecordRequest) -> u64 {
        elapsed_millis(request.start_time, request.end_time).saturating_sub(request.excluded_ms) / 1000
    }

    /// Writes in a fixed order: session, task total, profile. A failed step
    /// aborts the rest and earlier writes stay in place.
    pub async fn record(&self, request: RecordRequest) -> Result<RecordOutcome, EngineError> {
        let duration_seconds = Self::credited_seconds(&request);
        if duration_seconds < self.policy.session_floor_seconds {
            warn!(
                task_id = %request.task_id,
                duration_seconds,
                floor = self.policy.session_floor_seconds,
                "session below floor discarded"
            );
            return Ok(RecordOutcome::Discarded { duration_seconds });
        }

        let reward = self
            .policy
            .reward_for(request.session_type, request.status, duration_seconds);
        let session = self
            .store
            .create_session(SessionPayload {
                task_id: request.task_id.clone(),
                user_id: request.user_id.clone(),
                start_time: request.start_time,
                end_time: request.end_time.max(request.start_time),
                duration_seconds,
                session_type: request.session_type,
                xp_earned: reward.xp,
                coins_earned: reward.coins,
                status: request.status,
            })
            .await
            .map_err(|error| EngineError::persistence("create_session", error))?;

        let task_total_seconds = if request.session_type == SessionType::Break {
            None
        } else {
            Some(self.credit_task(&request.task_id, duration_seconds).await?)
        };

        let (profile, level_up) = if reward.is_empty() {
            (None, None)
        } else {
            let (profile, previous_level) = self
                .credit_profile(&request.user_id, request.session_type, reward)
                .await?;
            let level_up = (profile.level > previous_level).then_some((previous_level, profile.level));
            (Some(profile), level_up)
        };

        info!(
            task_id = %request.task_id,
            session_id = %session.id,
            session_type = session.session_type.as_str(),
            status = session.status.as_str(),
            duration_seconds,
            xp = reward.xp,
            coins = reward.coins,
            "session recorded"
        );

        if let Some(seconds) = task_total_seconds {
            self.bus.publish(EngineEvent::TimeUpdated {
                task_id: request.task_id.clone(),
                seconds,
            });
        }
        if let Some((previous_level, new_level)) = level_up {
            info!(user_id = %request.user_id, previous_level, new_level, "level up");
            self.bus.publish(EngineEvent::LevelUp {
                user_id: request.user_id.clone(),
                previous_level,
                new_level,
            });
        }
        if !reward.is_empty() {
            self.bus.publish(EngineEvent::RewardEarned {
                user_id: request.user_id.clone(),
                task_id: request.task_id.clone(),
                reward,
            });
        }
        self.bus.publish(EngineEvent::SessionRecorded {
            session: session.clone(),
        });

        Ok(RecordOutcome::Recorded(Box::new(RecordedSession {
            session,
            reward,
            task_total_seconds,
            profile,
            level_up,
        })))
    }

    async fn credit_task(&self, task_id: &str, duration_seconds: u64) -> Result<u64, EngineError> {
        let task = self
            .store
            .get_task(task_id)
            .await
            .map_err(|error| EngineError::persistence("update_task_total", error))?;
        let total = task.total_time_seconds.saturating_add(duration_seconds);
        let updated = self
            .store
            .update_task(
                task_id,
                &TaskUpdate {
                    total_time_seconds: Some(total),
                    ..TaskUpdate::default()
                },
            )
            .await
            .map_err(|error| EngineError::persistence("update_task_total", error))?;
        Ok(updated.total_time_seconds)
    }

    /// Returns the credited profile and the level it had before.
    async fn credit_profile(
        &self,
        user_id: &str,
        session_type: SessionType,
        reward: Reward,
    ) -> Result<(Profile, u32), EngineError> {
        if session_type == SessionType::Pomodoro {
            let credited = self
                .store
                .add_xp(user_id, u64::from(reward.xp))
                .await
                .map_err(|error| EngineError::persistence("add_xp", error))?;
            let previous_level = level_for_xp(credited.xp.saturating_sub(u64::from(reward.xp)));
            let profile = self
                .store
                .update_profile(
                    user_id,
                    &ProfileUpdate {
                        xp: None,
                        coins: Some(credited.coins.saturating_add(u64::from(reward.coins))),
                    },
                )
                .await
                .map_err(|error| EngineError::persistence("update_profile", error))?;
            return Ok((profile, previous_level));
        }

        let current = self
            .store
            .get_profile(user_id)
            .await
            .map_err(|error| EngineError::persistence("update_profile", error))?;
        let previous_level = level_for_xp(current.xp);
        let profile = self
            .store
            .update_profile(
                user_id,
                &ProfileUpdate {
                    xp: Some(current.xp.saturating_add(u64::from(reward.xp))),
                    coins: Some(current.coins.saturating_add(u64::from(reward.coins))),
                },
            )
            .await
            .map_err(|error| EngineError::persistence("update_profile", error))?;
        Ok((profile, previous_level))
    }
}
