use crate::domain::models::{
    NewPomodoroSession, PomodoroSession, PomodoroSessionUpdate, PomodoroStatus, Profile,
    ProfileUpdate, SessionPayload, SessionQuery, Task, TaskUpdate, TimeTrackingSession, next_id,
};
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Persistence seam consumed by the engine.
///
/// Profiles are created lazily by the local stores: reading or crediting an
/// unknown user starts from level 1 with zero balances.
#[async_trait]
pub trait FocusStore: Send + Sync {
    async fn create_session(
        &self,
        payload: SessionPayload,
    ) -> Result<TimeTrackingSession, InfraError>;

    /// Sessions matching `query`, newest `start_time` first.
    async fn list_sessions(
        &self,
        query: &SessionQuery,
    ) -> Result<Vec<TimeTrackingSession>, InfraError>;

    async fn get_task(&self, task_id: &str) -> Result<Task, InfraError>;

    async fn update_task(&self, task_id: &str, update: &TaskUpdate) -> Result<Task, InfraError>;

    async fn get_profile(&self, user_id: &str) -> Result<Profile, InfraError>;

    /// Overwrites the given balances and re-derives the level.
    async fn update_profile(
        &self,
        user_id: &str,
        update: &ProfileUpdate,
    ) -> Result<Profile, InfraError>;

    async fn add_xp(&self, user_id: &str, amount: u64) -> Result<Profile, InfraError>;

    async fn create_pomodoro_session(
        &self,
        session: NewPomodoroSession,
    ) -> Result<PomodoroSession, InfraError>;

    async fn update_pomodoro_session(
        &self,
        pomodoro_id: &str,
        update: &PomodoroSessionUpdate,
    ) -> Result<PomodoroSession, InfraError>;
}

#[derive(Debug, Default)]
struct InMemoryState {
    tasks: HashMap<String, Task>,
    sessions: Vec<TimeTrackingSession>,
    pomodoros: HashMap<String, PomodoroSession>,
    profiles: HashMap<String, Profile>,
}

#[derive(Debug, Default)]
pub struct InMemoryFocusStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryFocusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_task(&self, task: Task) -> Result<(), InfraError> {
        self.lock_state()?.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn insert_profile(&self, profile: Profile) -> Result<(), InfraError> {
        self.lock_state()?
            .profiles
            .insert(profile.user_id.clone(), profile);
        Ok(())
    }

    pub fn pomodoro_sessions(&self) -> Result<Vec<PomodoroSession>, InfraError> {
        let state = self.lock_state()?;
        let mut sessions = state.pomodoros.values().cloned().collect::<Vec<_>>();
        sessions.sort_by(|left, right| left.started_at.cmp(&right.started_at));
        Ok(sessions)
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, InMemoryState>, InfraError> {
        self.state
            .lock()
            .map_err(|error| InfraError::InvalidConfig(format!("focus store lock poisoned: {error}")))
    }
}

#[async_trait]
impl FocusStore for InMemoryFocusStore {
    async fn create_session(
        &self,
        payload: SessionPayload,
    ) -> Result<TimeTrackingSession, InfraError> {
        let session = payload.into_session(next_id("ses"));
        session.validate().map_err(InfraError::InvalidData)?;
        self.lock_state()?.sessions.push(session.clone());
        Ok(session)
    }

    async fn list_sessions(
        &self,
        query: &SessionQuery,
    ) -> Result<Vec<TimeTrackingSession>, InfraError> {
        let state = self.lock_state()?;
        let mut sessions = state
            .sessions
            .iter()
            .filter(|session| query.matches(session))
            .cloned()
            .collect::<Vec<_>>();
        sessions.sort_by(|left, right| right.start_time.cmp(&left.start_time));
        Ok(sessions)
    }

    async fn get_task(&self, task_id: &str) -> Result<Task, InfraError> {
        self.lock_state()?
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| InfraError::NotFound(format!("task {task_id}")))
    }

    async fn update_task(&self, task_id: &str, update: &TaskUpdate) -> Result<Task, InfraError> {
        let mut state = self.lock_state()?;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| InfraError::NotFound(format!("task {task_id}")))?;
        update.apply(task);
        Ok(task.clone())
    }

    async fn get_profile(&self, user_id: &str) -> Result<Profile, InfraError> {
        let state = self.lock_state()?;
        Ok(state
            .profiles
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| Profile::new(user_id)))
    }

    async fn update_profile(
        &self,
        user_id: &str,
        update: &ProfileUpdate,
    ) -> Result<Profile, InfraError> {
        let mut state = self.lock_state()?;
        let profile = state
            .profiles
            .entry(user_id.to_string())
            .or_insert_with(|| Profile::new(user_id));
        profile.apply(update);
        Ok(profile.clone())
    }

    async fn add_xp(&self, user_id: &str, amount: u64) -> Result<Profile, InfraError> {
        let mut state = self.lock_state()?;
        let profile = state
            .profiles
            .entry(user_id.to_string())
            .or_insert_with(|| Profile::new(user_id));
        let xp = profile.xp.saturating_add(amount);
        profile.apply(&ProfileUpdate {
            xp: Some(xp),
            coins: None,
        });
        Ok(profile.clone())
    }

    async fn create_pomodoro_session(
        &self,
        session: NewPomodoroSession,
    ) -> Result<PomodoroSession, InfraError> {
        let pomodoro = PomodoroSession {
            id: next_id("pom"),
            task_id: session.task_id,
            user_id: session.user_id,
            duration_seconds: session.duration_seconds,
            status: PomodoroStatus::InProgress,
            started_at: session.started_at,
            completed_at: None,
        };
        pomodoro.validate().map_err(InfraError::InvalidData)?;
        self.lock_state()?
            .pomodoros
            .insert(pomodoro.id.clone(), pomodoro.clone());
        Ok(pomodoro)
    }

    async fn update_pomodoro_session(
        &self,
        pomodoro_id: &str,
        update: &PomodoroSessionUpdate,
    ) -> Result<PomodoroSession, InfraError> {
        let mut state = self.lock_state()?;
        let pomodoro = state
            .pomodoros
            .get_mut(pomodoro_id)
            .ok_or_else(|| InfraError::NotFound(format!("pomodoro session {pomodoro_id}")))?;
        pomodoro.status = update.status;
        pomodoro.completed_at = update.completed_at;
        Ok(pomodoro.clone())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Wraps an in-memory store and fails the named operations on demand.
    #[derive(Default)]
    pub struct FlakyStore {
        pub inner: Arc<InMemoryFocusStore>,
        failing: Mutex<HashSet<&'static str>>,
        calls: Mutex<Vec<&'static str>>,
        pub task_updates: AtomicUsize,
    }

    impl FlakyStore {
        pub fn new(inner: Arc<InMemoryFocusStore>) -> Self {
            Self {
                inner,
                ..Self::default()
            }
        }

        pub fn fail(&self, operation: &'static str) {
            self.failing.lock().expect("failing lock").insert(operation);
        }

        pub fn heal(&self, operation: &'static str) {
            self.failing.lock().expect("failing lock").remove(operation);
        }

        pub fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().expect("calls lock").clone()
        }

        fn check(&self, operation: &'static str) -> Result<(), InfraError> {
            self.calls.lock().expect("calls lock").push(operation);
            if self.failing.lock().expect("failing lock").contains(operation) {
                return Err(InfraError::Http(format!("{operation} unavailable")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl FocusStore for FlakyStore {
        async fn create_session(
            &self,
            payload: SessionPayload,
        ) -> Result<TimeTrackingSession, InfraError> {
            self.check("create_session")?;
            self.inner.create_session(payload).await
        }

        async fn list_sessions(
            &self,
            query: &SessionQuery,
        ) -> Result<Vec<TimeTrackingSession>, InfraError> {
            self.check("list_sessions")?;
            self.inner.list_sessions(query).await
        }

        async fn get_task(&self, task_id: &str) -> Result<Task, InfraError> {
            self.check("get_task")?;
            self.inner.get_task(task_id).await
        }

        async fn update_task(&self, task_id: &str, update: &TaskUpdate) -> Result<Task, InfraError> {
            self.check("update_task")?;
            self.task_updates.fetch_add(1, Ordering::SeqCst);
            self.inner.update_task(task_id, update).await
        }

        async fn get_profile(&self, user_id: &str) -> Result<Profile, InfraError> {
            self.check("get_profile")?;
            self.inner.get_profile(user_id).await
        }

        async fn update_profile(
            &self,
            user_id: &str,
            update: &ProfileUpdate,
        ) -> Result<Profile, InfraError> {
            self.check("update_profile")?;
            self.inner.update_profile(user_id, update).await
        }

        async fn add_xp(&self, user_id: &str, amount: u64) -> Result<Profile, InfraError> {
            self.check("add_xp")?;
            self.inner.add_xp(user_id, amount).await
        }

        async fn create_pomodoro_session(
            &self,
            session: NewPomodoroSession,
        ) -> Result<PomodoroSession, InfraError> {
            self.check("create_pomodoro_session")?;
            self.inner.create_pomodoro_session(session).await
        }

        async fn update_pomodoro_session(
            &self,
            pomodoro_id: &str,
            update: &PomodoroSessionUpdate,
        ) -> Result<PomodoroSession, InfraError> {
            self.check("update_pomodoro_session")?;
            self.inner.update_pomodoro_session(pomodoro_id, update).await
        }
    }
}
