use crate::domain::models::{
    NewPomodoroSession, PomodoroSession, PomodoroSessionUpdate, Profile, ProfileUpdate,
    SessionPayload, SessionQuery, Task, TaskUpdate, TimeTrackingSession,
};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::focus_store::FocusStore;
use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

/// `FocusStore` over the application's JSON API.
#[derive(Debug, Clone)]
pub struct RestFocusStore {
    client: Client,
    base_url: Url,
    bearer_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct AddXpRequest {
    amount: u64,
}

impl RestFocusStore {
    pub fn new(base_url: &str) -> Result<Self, InfraError> {
        let base_url = Url::parse(base_url)
            .map_err(|error| InfraError::InvalidConfig(format!("invalid api base url: {error}")))?;
        if base_url.cannot_be_a_base() {
            return Err(InfraError::InvalidConfig(format!(
                "api base url cannot be a base: {base_url}"
            )));
        }
        Ok(Self {
            client: Client::new(),
            base_url,
            bearer_token: None,
        })
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.bearer_token = Some(token.trim().to_string()).filter(|value| !value.is_empty());
        self
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, InfraError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                InfraError::InvalidConfig("api base url cannot be a base".to_string())
            })?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.bearer_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        operation: &str,
    ) -> Result<T, InfraError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|error| InfraError::Http(format!("network error during {operation}: {error}")))?;

        let status = response.status();
        let body = response.text().await.map_err(|error| {
            InfraError::Http(format!("failed reading {operation} response: {error}"))
        })?;

        if status == StatusCode::NOT_FOUND {
            return Err(InfraError::NotFound(format!("{operation}: http 404")));
        }
        if !status.is_success() {
            return Err(Self::http_error(operation, status, &body));
        }

        serde_json::from_str(&body).map_err(|error| {
            InfraError::InvalidData(format!("invalid {operation} payload: {error}; body={body}"))
        })
    }

    fn http_error(operation: &str, status: StatusCode, body: &str) -> InfraError {
        let message = if body.trim().is_empty() {
            format!("{operation} failed: http {}", status.as_u16())
        } else {
            format!("{operation} failed: http {}; body={body}", status.as_u16())
        };
        InfraError::Http(message)
    }
}

#[async_trait]
impl FocusStore for RestFocusStore {
    async fn create_session(
        &self,
        payload: SessionPayload,
    ) -> Result<TimeTrackingSession, InfraError> {
        let url = self.endpoint(&["sessions"])?;
        self.send_json(self.client.post(url).json(&payload), "create session")
            .await
    }

    async fn list_sessions(
        &self,
        query: &SessionQuery,
    ) -> Result<Vec<TimeTrackingSession>, InfraError> {
        let url = self.endpoint(&["sessions"])?;
        let mut request = self
            .client
            .get(url)
            .query(&[("user_id", query.user_id.as_str())]);
        if let Some(start) = query.start_date {
            request = request.query(&[("start_date", start.to_rfc3339_opts(SecondsFormat::Millis, true))]);
        }
        if let Some(end) = query.end_date {
            request = request.query(&[("end_date", end.to_rfc3339_opts(SecondsFormat::Millis, true))]);
        }
        if let Some(task_id) = query.task_id.as_deref() {
            request = request.query(&[("task_id", task_id)]);
        }
        let mut sessions: Vec<TimeTrackingSession> =
            self.send_json(request, "list sessions").await?;
        sessions.sort_by(|left, right| right.start_time.cmp(&left.start_time));
        Ok(sessions)
    }

    async fn get_task(&self, task_id: &str) -> Result<Task, InfraError> {
        let url = self.endpoint(&["tasks", task_id])?;
        self.send_json(self.client.get(url), "get task").await
    }

    async fn update_task(&self, task_id: &str, update: &TaskUpdate) -> Result<Task, InfraError> {
        let url = self.endpoint(&["tasks", task_id])?;
        self.send_json(self.client.patch(url).json(update), "update task")
            .await
    }

    async fn get_profile(&self, user_id: &str) -> Result<Profile, InfraError> {
        let url = self.endpoint(&["profiles", user_id])?;
        self.send_json(self.client.get(url), "get profile").await
    }

    async fn update_profile(
        &self,
        user_id: &str,
        update: &ProfileUpdate,
    ) -> Result<Profile, InfraError> {
        let url = self.endpoint(&["profiles", user_id])?;
        self.send_json(self.client.patch(url).json(update), "update profile")
            .await
    }

    async fn add_xp(&self, user_id: &str, amount: u64) -> Result<Profile, InfraError> {
        let url = self.endpoint(&["profiles", user_id, "xp"])?;
        self.send_json(
            self.client.post(url).json(&AddXpRequest { amount }),
            "add xp",
        )
        .await
    }

    async fn create_pomodoro_session(
        &self,
        session: NewPomodoroSession,
    ) -> Result<PomodoroSession, InfraError> {
        let url = self.endpoint(&["pomodoro-sessions"])?;
        self.send_json(self.client.post(url).json(&session), "create pomodoro session")
            .await
    }

    async fn update_pomodoro_session(
        &self,
        pomodoro_id: &str,
        update: &PomodoroSessionUpdate,
    ) -> Result<PomodoroSession, InfraError> {
        let url = self.endpoint(&["pomodoro-sessions", pomodoro_id])?;
        self.send_json(self.client.patch(url).json(update), "update pomodoro session")
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{SessionStatus, SessionType, TimerStatus};
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn session_json(id: &str, start: &str, end: &str, duration: u64) -> serde_json::Value {
        json!({
            "id": id,
            "task_id": "tsk-1",
            "user_id": "usr-1",
            "start_time": start,
            "end_time": end,
            "duration_seconds": duration,
            "session_type": "manual",
            "xp_earned": 2,
            "coins_earned": 1,
            "status": "completed"
        })
    }

    #[tokio::test]
    async fn create_session_posts_payload_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/sessions"))
            .and(header("authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(201).set_body_json(session_json(
                "ses-1",
                "2026-02-16T09:00:00Z",
                "2026-02-16T09:02:05Z",
                125,
            )))
            .expect(1)
            .mount(&server)
            .await;

        let store = RestFocusStore::new(&format!("{}/api/", server.uri()))
            .expect("store")
            .with_bearer_token("token-1");
        let session = store
            .create_session(SessionPayload {
                task_id: "tsk-1".to_string(),
                user_id: "usr-1".to_string(),
                start_time: fixed_time("2026-02-16T09:00:00Z"),
                end_time: fixed_time("2026-02-16T09:02:05Z"),
                duration_seconds: 125,
                session_type: SessionType::Manual,
                xp_earned: 2,
                coins_earned: 1,
                status: SessionStatus::Completed,
            })
            .await
            .expect("create session");

        assert_eq!(session.id, "ses-1");
        assert_eq!(session.duration_seconds, 125);
    }

    #[tokio::test]
    async fn list_sessions_sends_filters_and_sorts_newest_first() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sessions"))
            .and(query_param("user_id", "usr-1"))
            .and(query_param("task_id", "tsk-1"))
            .and(query_param("start_date", "2026-02-16T00:00:00.250Z"))
            .and(query_param("end_date", "2026-02-17T00:00:00.000Z"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                session_json("ses-1", "2026-02-16T09:00:00Z", "2026-02-16T09:01:00Z", 60),
                session_json("ses-2", "2026-02-16T11:00:00Z", "2026-02-16T11:01:00Z", 60),
            ])))
            .mount(&server)
            .await;

        let store = RestFocusStore::new(&server.uri()).expect("store");
        let mut query = SessionQuery::for_user("usr-1").with_task("tsk-1");
        query.start_date = Some(fixed_time("2026-02-16T00:00:00.250Z"));
        query.end_date = Some(fixed_time("2026-02-17T00:00:00Z"));
        let sessions = store.list_sessions(&query).await.expect("list sessions");

        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, "ses-2");
    }

    #[tokio::test]
    async fn missing_task_maps_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tasks/tsk-404"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = RestFocusStore::new(&server.uri()).expect("store");
        let result = store.get_task("tsk-404").await;
        assert!(matches!(result, Err(InfraError::NotFound(_))));
    }

    #[tokio::test]
    async fn update_task_patches_only_set_fields() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/tasks/tsk-1"))
            .and(body_json(json!({
                "timer_status": "paused",
                "timer_paused_at": "2026-02-16T09:10:00Z"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "tsk-1",
                "user_id": "usr-1",
                "title": "Draft",
                "total_time_seconds": 0,
                "timer_status": "paused",
                "timer_started_at": "2026-02-16T09:00:00Z",
                "timer_paused_at": "2026-02-16T09:10:00Z",
                "accumulated_time_seconds": 600,
                "last_active_at": null
            })))
            .mount(&server)
            .await;

        let store = RestFocusStore::new(&server.uri()).expect("store");
        let task = store
            .update_task(
                "tsk-1",
                &TaskUpdate {
                    timer_status: Some(TimerStatus::Paused),
                    timer_paused_at: Some(Some(fixed_time("2026-02-16T09:10:00Z"))),
                    ..TaskUpdate::default()
                },
            )
            .await
            .expect("update task");
        assert_eq!(task.timer_status, TimerStatus::Paused);
        assert_eq!(task.run_started_at, None);
        assert_eq!(task.tally_count, 0);
    }

    #[tokio::test]
    async fn add_xp_posts_amount() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/profiles/usr-1/xp"))
            .and(body_json(json!({ "amount": 5 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "user_id": "usr-1",
                "xp": 105,
                "coins": 4,
                "level": 2
            })))
            .mount(&server)
            .await;

        let store = RestFocusStore::new(&server.uri()).expect("store");
        let profile = store.add_xp("usr-1", 5).await.expect("add xp");
        assert_eq!(profile.level, 2);
    }

    #[tokio::test]
    async fn server_error_keeps_body_in_message() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/profiles/usr-1"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let store = RestFocusStore::new(&server.uri()).expect("store");
        let result = store
            .update_profile(
                "usr-1",
                &ProfileUpdate {
                    xp: None,
                    coins: Some(3),
                },
            )
            .await;
        match result {
            Err(InfraError::Http(message)) => {
                assert!(message.contains("503"));
                assert!(message.contains("maintenance"));
            }
            other => panic!("expected http error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_non_base_url() {
        assert!(matches!(
            RestFocusStore::new("mailto:someone@example.com"),
            Err(InfraError::InvalidConfig(_))
        ));
    }
}
