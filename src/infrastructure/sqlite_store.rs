use crate::domain::models::{
    NewPomodoroSession, PomodoroSession, PomodoroSessionUpdate, PomodoroStatus, Profile,
    ProfileUpdate, SessionPayload, SessionQuery, SessionStatus, SessionType, Task, TaskUpdate,
    TimeTrackingSession, TimerStatus, next_id,
};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::focus_store::FocusStore;
use crate::infrastructure::storage::open_connection;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::ToSql;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};

const TASK_COLUMNS: &str = "id, user_id, title, total_time_seconds, timer_status, timer_started_at,
    timer_paused_at, accumulated_time_seconds, last_active_at, run_started_at, tally_count";
const SESSION_COLUMNS: &str = "id, task_id, user_id, start_time, end_time, duration_seconds,
    session_type, xp_earned, coins_earned, status";
const POMODORO_COLUMNS: &str =
    "id, task_id, user_id, duration_seconds, status, started_at, completed_at";

/// Local store backed by the workspace database. Each call opens its own
/// connection on the blocking pool.
#[derive(Debug, Clone)]
pub struct SqliteFocusStore {
    db_path: PathBuf,
}

impl SqliteFocusStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    pub fn insert_task(&self, task: &Task) -> Result<(), InfraError> {
        let connection = open_connection(&self.db_path)?;
        write_task(&connection, task)
    }

    async fn run<T, F>(&self, operation: F) -> Result<T, InfraError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, InfraError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let connection = open_connection(&db_path)?;
            operation(&connection)
        })
        .await
        .map_err(|error| InfraError::InvalidData(format!("sqlite worker join: {error}")))?
    }
}

#[async_trait]
impl FocusStore for SqliteFocusStore {
    async fn create_session(
        &self,
        payload: SessionPayload,
    ) -> Result<TimeTrackingSession, InfraError> {
        let session = payload.into_session(next_id("ses"));
        session.validate().map_err(InfraError::InvalidData)?;
        self.run(move |connection| {
            connection.execute(
                &format!("INSERT INTO time_tracking_sessions ({SESSION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
                params![
                    session.id,
                    session.task_id,
                    session.user_id,
                    format_timestamp(session.start_time),
                    format_timestamp(session.end_time),
                    to_i64(session.duration_seconds)?,
                    session.session_type.as_str(),
                    session.xp_earned,
                    session.coins_earned,
                    session.status.as_str(),
                ],
            )?;
            Ok(session)
        })
        .await
    }

    async fn list_sessions(
        &self,
        query: &SessionQuery,
    ) -> Result<Vec<TimeTrackingSession>, InfraError> {
        let query = query.clone();
        self.run(move |connection| {
            let mut sql = format!(
                "SELECT {SESSION_COLUMNS} FROM time_tracking_sessions WHERE user_id = ?1"
            );
            let mut values: Vec<Box<dyn ToSql>> = vec![Box::new(query.user_id.clone())];
            if let Some(start) = query.start_date {
                values.push(Box::new(format_timestamp(start)));
                sql.push_str(&format!(" AND start_time >= ?{}", values.len()));
            }
            if let Some(end) = query.end_date {
                values.push(Box::new(format_timestamp(end)));
                sql.push_str(&format!(" AND start_time <= ?{}", values.len()));
            }
            if let Some(task_id) = &query.task_id {
                values.push(Box::new(task_id.clone()));
                sql.push_str(&format!(" AND task_id = ?{}", values.len()));
            }
            sql.push_str(" ORDER BY start_time DESC, id DESC");

            let references = values.iter().map(|value| value.as_ref()).collect::<Vec<&dyn ToSql>>();
            let mut statement = connection.prepare(&sql)?;
            let rows = statement.query_map(references.as_slice(), SessionRow::from_row)?;
            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(row?.into_session()?);
            }
            Ok(sessions)
        })
        .await
    }

    async fn get_task(&self, task_id: &str) -> Result<Task, InfraError> {
        let task_id = task_id.to_string();
        self.run(move |connection| load_task(connection, &task_id))
            .await
    }

    async fn update_task(&self, task_id: &str, update: &TaskUpdate) -> Result<Task, InfraError> {
        let task_id = task_id.to_string();
        let update = update.clone();
        self.run(move |connection| {
            let mut task = load_task(connection, &task_id)?;
            update.apply(&mut task);
            write_task(connection, &task)?;
            Ok(task)
        })
        .await
    }

    async fn get_profile(&self, user_id: &str) -> Result<Profile, InfraError> {
        let user_id = user_id.to_string();
        self.run(move |connection| load_profile(connection, &user_id))
            .await
    }

    async fn update_profile(
        &self,
        user_id: &str,
        update: &ProfileUpdate,
    ) -> Result<Profile, InfraError> {
        let user_id = user_id.to_string();
        let update = update.clone();
        self.run(move |connection| {
            let mut profile = load_profile(connection, &user_id)?;
            profile.apply(&update);
            write_profile(connection, &profile)?;
            Ok(profile)
        })
        .await
    }

    async fn add_xp(&self, user_id: &str, amount: u64) -> Result<Profile, InfraError> {
        let user_id = user_id.to_string();
        self.run(move |connection| {
            let mut profile = load_profile(connection, &user_id)?;
            let xp = profile.xp.saturating_add(amount);
            profile.apply(&ProfileUpdate {
                xp: Some(xp),
                coins: None,
            });
            write_profile(connection, &profile)?;
            Ok(profile)
        })
        .await
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
        self.run(move |connection| {
            connection.execute(
                &format!(
                    "INSERT INTO pomodoro_sessions ({POMODORO_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)"
                ),
                params![
                    pomodoro.id,
                    pomodoro.task_id,
                    pomodoro.user_id,
                    to_i64(pomodoro.duration_seconds)?,
                    pomodoro.status.as_str(),
                    format_timestamp(pomodoro.started_at),
                ],
            )?;
            Ok(pomodoro)
        })
        .await
    }

    async fn update_pomodoro_session(
        &self,
        pomodoro_id: &str,
        update: &PomodoroSessionUpdate,
    ) -> Result<PomodoroSession, InfraError> {
        let pomodoro_id = pomodoro_id.to_string();
        let update = update.clone();
        self.run(move |connection| {
            let changed = connection.execute(
                "UPDATE pomodoro_sessions SET status = ?2, completed_at = ?3 WHERE id = ?1",
                params![
                    pomodoro_id,
                    update.status.as_str(),
                    update.completed_at.map(format_timestamp),
                ],
            )?;
            if changed == 0 {
                return Err(InfraError::NotFound(format!("pomodoro session {pomodoro_id}")));
            }
            let row = connection.query_row(
                &format!("SELECT {POMODORO_COLUMNS} FROM pomodoro_sessions WHERE id = ?1"),
                params![pomodoro_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )?;
            let (id, task_id, user_id, duration_seconds, status, started_at, completed_at) = row;
            Ok(PomodoroSession {
                id,
                task_id,
                user_id,
                duration_seconds: to_u64(duration_seconds, "pomodoro_sessions.duration_seconds")?,
                status: PomodoroStatus::parse(&status).map_err(InfraError::InvalidData)?,
                started_at: parse_timestamp(&started_at, "pomodoro_sessions.started_at")?,
                completed_at: parse_optional_timestamp(
                    completed_at,
                    "pomodoro_sessions.completed_at",
                )?,
            })
        })
        .await
    }
}

struct SessionRow {
    id: String,
    task_id: String,
    user_id: String,
    start_time: String,
    end_time: String,
    duration_seconds: i64,
    session_type: String,
    xp_earned: u32,
    coins_earned: u32,
    status: String,
}

impl SessionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            user_id: row.get(2)?,
            start_time: row.get(3)?,
            end_time: row.get(4)?,
            duration_seconds: row.get(5)?,
            session_type: row.get(6)?,
            xp_earned: row.get(7)?,
            coins_earned: row.get(8)?,
            status: row.get(9)?,
        })
    }

    fn into_session(self) -> Result<TimeTrackingSession, InfraError> {
        Ok(TimeTrackingSession {
            start_time: parse_timestamp(&self.start_time, "time_tracking_sessions.start_time")?,
            end_time: parse_timestamp(&self.end_time, "time_tracking_sessions.end_time")?,
            duration_seconds: to_u64(
                self.duration_seconds,
                "time_tracking_sessions.duration_seconds",
            )?,
            session_type: SessionType::parse(&self.session_type).map_err(InfraError::InvalidData)?,
            status: SessionStatus::parse(&self.status).map_err(InfraError::InvalidData)?,
            id: self.id,
            task_id: self.task_id,
            user_id: self.user_id,
            xp_earned: self.xp_earned,
            coins_earned: self.coins_earned,
        })
    }
}

struct TaskRow {
    id: String,
    user_id: String,
    title: String,
    total_time_seconds: i64,
    timer_status: String,
    timer_started_at: Option<String>,
    timer_paused_at: Option<String>,
    accumulated_time_seconds: i64,
    last_active_at: Option<String>,
    run_started_at: Option<String>,
    tally_count: u32,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            total_time_seconds: row.get(3)?,
            timer_status: row.get(4)?,
            timer_started_at: row.get(5)?,
            timer_paused_at: row.get(6)?,
            accumulated_time_seconds: row.get(7)?,
            last_active_at: row.get(8)?,
            run_started_at: row.get(9)?,
            tally_count: row.get(10)?,
        })
    }

    fn into_task(self) -> Result<Task, InfraError> {
        Ok(Task {
            total_time_seconds: to_u64(self.total_time_seconds, "tasks.total_time_seconds")?,
            timer_status: TimerStatus::parse(&self.timer_status).map_err(InfraError::InvalidData)?,
            timer_started_at: parse_optional_timestamp(
                self.timer_started_at,
                "tasks.timer_started_at",
            )?,
            timer_paused_at: parse_optional_timestamp(self.timer_paused_at, "tasks.timer_paused_at")?,
            accumulated_time_seconds: to_u64(
                self.accumulated_time_seconds,
                "tasks.accumulated_time_seconds",
            )?,
            last_active_at: parse_optional_timestamp(self.last_active_at, "tasks.last_active_at")?,
            run_started_at: parse_optional_timestamp(self.run_started_at, "tasks.run_started_at")?,
            id: self.id,
            user_id: self.user_id,
            title: self.title,
            tally_count: self.tally_count,
        })
    }
}

fn load_task(connection: &Connection, task_id: &str) -> Result<Task, InfraError> {
    let row = connection
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![task_id],
            TaskRow::from_row,
        )
        .optional()?;
    row.ok_or_else(|| InfraError::NotFound(format!("task {task_id}")))?
        .into_task()
}

fn write_task(connection: &Connection, task: &Task) -> Result<(), InfraError> {
    connection.execute(
        &format!(
            "INSERT INTO tasks ({TASK_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
               user_id = excluded.user_id,
               title = excluded.title,
               total_time_seconds = excluded.total_time_seconds,
               timer_status = excluded.timer_status,
               timer_started_at = excluded.timer_started_at,
               timer_paused_at = excluded.timer_paused_at,
               accumulated_time_seconds = excluded.accumulated_time_seconds,
               last_active_at = excluded.last_active_at,
               run_started_at = excluded.run_started_at,
               tally_count = excluded.tally_count"
        ),
        params![
            task.id,
            task.user_id,
            task.title,
            to_i64(task.total_time_seconds)?,
            task.timer_status.as_str(),
            task.timer_started_at.map(format_timestamp),
            task.timer_paused_at.map(format_timestamp),
            to_i64(task.accumulated_time_seconds)?,
            task.last_active_at.map(format_timestamp),
            task.run_started_at.map(format_timestamp),
            task.tally_count,
        ],
    )?;
    Ok(())
}

fn load_profile(connection: &Connection, user_id: &str) -> Result<Profile, InfraError> {
    let row: Option<(i64, i64)> = connection
        .query_row(
            "SELECT xp, coins FROM profiles WHERE user_id = ?1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((xp, coins)) = row else {
        return Ok(Profile::new(user_id));
    };
    let mut profile = Profile::new(user_id);
    profile.apply(&ProfileUpdate {
        xp: Some(to_u64(xp, "profiles.xp")?),
        coins: Some(to_u64(coins, "profiles.coins")?),
    });
    Ok(profile)
}

fn write_profile(connection: &Connection, profile: &Profile) -> Result<(), InfraError> {
    connection.execute(
        "INSERT INTO profiles (user_id, xp, coins, level)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(user_id) DO UPDATE SET
           xp = excluded.xp,
           coins = excluded.coins,
           level = excluded.level",
        params![
            profile.user_id,
            to_i64(profile.xp)?,
            to_i64(profile.coins)?,
            profile.level,
        ],
    )?;
    Ok(())
}

fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: &str, field: &str) -> Result<DateTime<Utc>, InfraError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| InfraError::InvalidData(format!("invalid {field} '{raw}': {error}")))
}

fn parse_optional_timestamp(
    raw: Option<String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>, InfraError> {
    raw.map(|value| parse_timestamp(&value, field)).transpose()
}

fn to_i64(value: u64) -> Result<i64, InfraError> {
    i64::try_from(value).map_err(|_| InfraError::InvalidData(format!("{value} exceeds sqlite range")))
}

fn to_u64(value: i64, field: &str) -> Result<u64, InfraError> {
    u64::try_from(value).map_err(|_| InfraError::InvalidData(format!("negative {field}: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::initialize_database;
    use chrono::Duration;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_TEMP_DB: AtomicUsize = AtomicUsize::new(0);

    struct TempDatabase {
        dir: PathBuf,
        path: PathBuf,
    }

    impl TempDatabase {
        fn new() -> Self {
            let sequence = NEXT_TEMP_DB.fetch_add(1, Ordering::Relaxed);
            let dir = std::env::temp_dir().join(format!(
                "focusforge-sqlite-tests-{}-{}",
                std::process::id(),
                sequence
            ));
            fs::create_dir_all(&dir).expect("create temp dir");
            let path = dir.join("focusforge.sqlite");
            initialize_database(&path).expect("initialize database");
            Self { dir, path }
        }

        fn store(&self) -> SqliteFocusStore {
            SqliteFocusStore::new(&self.path)
        }
    }

    impl Drop for TempDatabase {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn task_update_roundtrip_preserves_timestamps() {
        let database = TempDatabase::new();
        let store = database.store();
        store
            .insert_task(&Task::new("tsk-1", "usr-1", "Draft outline"))
            .expect("insert task");

        let started_at = fixed_time("2026-02-16T09:00:00.250Z");
        let updated = store
            .update_task(
                "tsk-1",
                &TaskUpdate {
                    timer_status: Some(TimerStatus::Running),
                    timer_started_at: Some(Some(started_at)),
                    run_started_at: Some(Some(started_at)),
                    ..TaskUpdate::default()
                },
            )
            .await
            .expect("update task");
        assert_eq!(updated.timer_status, TimerStatus::Running);

        let loaded = store.get_task("tsk-1").await.expect("get task");
        assert_eq!(loaded.timer_started_at, Some(started_at));
        assert_eq!(loaded.run_started_at, Some(started_at));
        assert_eq!(loaded.timer_paused_at, None);

        let cleared = store
            .update_task(
                "tsk-1",
                &TaskUpdate {
                    timer_status: Some(TimerStatus::Idle),
                    timer_started_at: Some(None),
                    run_started_at: Some(None),
                    total_time_seconds: Some(90),
                    ..TaskUpdate::default()
                },
            )
            .await
            .expect("clear task");
        assert_eq!(cleared.timer_started_at, None);
        assert_eq!(store.get_task("tsk-1").await.expect("reload").total_time_seconds, 90);
    }

    #[tokio::test]
    async fn missing_task_is_not_found() {
        let database = TempDatabase::new();
        let result = database.store().get_task("missing").await;
        assert!(matches!(result, Err(InfraError::NotFound(_))));
    }

    #[tokio::test]
    async fn sessions_are_listed_newest_first_within_range() {
        let database = TempDatabase::new();
        let store = database.store();
        let base = fixed_time("2026-02-16T09:00:00Z");
        for (offset_minutes, task_id) in [(0, "tsk-1"), (30, "tsk-2"), (60, "tsk-1")] {
            let start = base + Duration::minutes(offset_minutes);
            store
                .create_session(SessionPayload {
                    task_id: task_id.to_string(),
                    user_id: "usr-1".to_string(),
                    start_time: start,
                    end_time: start + Duration::seconds(120),
                    duration_seconds: 120,
                    session_type: SessionType::Manual,
                    xp_earned: 2,
                    coins_earned: 1,
                    status: SessionStatus::Completed,
                })
                .await
                .expect("create session");
        }

        let listed = store
            .list_sessions(&SessionQuery::for_user("usr-1").with_task("tsk-1"))
            .await
            .expect("list sessions");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].start_time, base + Duration::minutes(60));

        let ranged = store
            .list_sessions(
                &SessionQuery::for_user("usr-1")
                    .between(base + Duration::minutes(10), base + Duration::minutes(45)),
            )
            .await
            .expect("list range");
        assert_eq!(ranged.len(), 1);
        assert_eq!(ranged[0].task_id, "tsk-2");
    }

    #[tokio::test]
    async fn profile_credits_accumulate() {
        let database = TempDatabase::new();
        let store = database.store();
        let profile = store.add_xp("usr-1", 95).await.expect("add xp");
        assert_eq!(profile.level, 1);
        let profile = store
            .update_profile(
                "usr-1",
                &ProfileUpdate {
                    xp: Some(105),
                    coins: Some(3),
                },
            )
            .await
            .expect("update profile");
        assert_eq!(profile.level, 2);
        assert_eq!(store.get_profile("usr-1").await.expect("get"), profile);
    }

    #[tokio::test]
    async fn pomodoro_session_update_persists() {
        let database = TempDatabase::new();
        let store = database.store();
        let started_at = fixed_time("2026-02-16T09:00:00Z");
        let created = store
            .create_pomodoro_session(NewPomodoroSession {
                task_id: "tsk-1".to_string(),
                user_id: "usr-1".to_string(),
                duration_seconds: 1500,
                started_at,
            })
            .await
            .expect("create pomodoro");
        let updated = store
            .update_pomodoro_session(
                &created.id,
                &PomodoroSessionUpdate {
                    status: PomodoroStatus::Aborted,
                    completed_at: Some(started_at + Duration::seconds(600)),
                },
            )
            .await
            .expect("update pomodoro");
        assert_eq!(updated.status, PomodoroStatus::Aborted);
        assert_eq!(updated.started_at, started_at);

        let missing = store
            .update_pomodoro_session(
                "pom-missing",
                &PomodoroSessionUpdate {
                    status: PomodoroStatus::Completed,
                    completed_at: None,
                },
            )
            .await;
        assert!(matches!(missing, Err(InfraError::NotFound(_))));
    }
}
