//! Client seam for the remote job service.
//!
//! [`JobService`] is the fixed contract the engine relies on; the engine
//! never talks HTTP directly. [`HttpJobService`] implements it over the
//! service's REST endpoints using [`reqwest`]:
//!
//! | Operation        | Request                          |
//! |------------------|----------------------------------|
//! | start job        | `POST   /api/tasks`              |
//! | list jobs        | `GET    /api/tasks`              |
//! | status stream    | `GET    /api/tasks/{id}/stream`  |
//! | cancel job       | `POST   /api/tasks/{id}/cancel`  |
//! | dismiss job      | `DELETE /api/tasks/{id}`         |

use async_trait::async_trait;
use futures::TryStreamExt;
use pullsync_core::{TaskId, TaskMap};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

/// Raw byte stream of newline-delimited status frames for one task.
pub type StatusStream = Box<dyn AsyncRead + Send + Unpin>;

/// Errors from the remote job service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service returned a non-2xx status code.
    #[error("Job service error ({status}): {body}")]
    Api { status: u16, body: String },

    /// The service responded with a body of an unexpected shape.
    #[error("Unexpected response: {0}")]
    InvalidResponse(String),

    /// The configured base URL cannot be used.
    #[error("Invalid service URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Transport-level failure outside HTTP (used by alternative transports).
    #[error("Transport error: {0}")]
    Transport(String),
}

/// The remote job service.
#[async_trait]
pub trait JobService: Send + Sync {
    /// Start a job for `subject_name`; returns the new task id.
    async fn start_job(&self, subject_name: &str) -> Result<TaskId, ServiceError>;

    /// Authoritative list of all tasks the service knows about.
    async fn list_jobs(&self) -> Result<TaskMap, ServiceError>;

    /// Open the live status stream for one task.
    async fn open_status_stream(&self, task_id: &str) -> Result<StatusStream, ServiceError>;

    /// Request cancellation. Confirmed only by a later `cancelled` frame or
    /// the task's absence from a later listing.
    async fn cancel_job(&self, task_id: &str) -> Result<(), ServiceError>;

    /// Permanently remove the task server-side.
    async fn dismiss_job(&self, task_id: &str) -> Result<(), ServiceError>;
}

// ---------------------------------------------------------------------------
// HttpJobService
// ---------------------------------------------------------------------------

/// HTTP client for the job service.
pub struct HttpJobService {
    client: reqwest::Client,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    #[serde(alias = "id", alias = "task_id")]
    task_id: TaskId,
}

impl HttpJobService {
    /// Create a client for the service at `base_url`, e.g.
    /// `http://localhost:11434`.
    pub fn new(base_url: &str) -> Result<Self, ServiceError> {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Create a client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Result<Self, ServiceError> {
        let parsed = Url::parse(base_url).map_err(|e| ServiceError::InvalidUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        if parsed.cannot_be_a_base() {
            return Err(ServiceError::InvalidUrl {
                url: base_url.to_string(),
                reason: "URL cannot be a base".to_string(),
            });
        }
        Ok(Self {
            client,
            base_url: parsed,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Build `<base>/api/tasks[/<id>[/<suffix>]]` with the id percent-encoded.
    fn tasks_url(&self, task_id: Option<&str>, suffix: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["api", "tasks"]);
            if let Some(id) = task_id {
                segments.push(id);
            }
            if let Some(suffix) = suffix {
                segments.push(suffix);
            }
        }
        url
    }

    // ---- private helpers ----

    /// Return the response unchanged on success, or an
    /// [`ServiceError::Api`] carrying status and body.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ServiceError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ServiceError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl JobService for HttpJobService {
    async fn start_job(&self, subject_name: &str) -> Result<TaskId, ServiceError> {
        let response = self
            .client
            .post(self.tasks_url(None, None))
            .json(&serde_json::json!({ "subjectName": subject_name }))
            .send()
            .await?;

        let started: StartResponse = Self::ensure_success(response).await?.json().await?;
        tracing::info!(task_id = %started.task_id, subject_name, "Job started");
        Ok(started.task_id)
    }

    async fn list_jobs(&self) -> Result<TaskMap, ServiceError> {
        let response = self.client.get(self.tasks_url(None, None)).send().await?;
        let body: Value = Self::ensure_success(response).await?.json().await?;
        parse_task_list(body)
    }

    async fn open_status_stream(&self, task_id: &str) -> Result<StatusStream, ServiceError> {
        let response = self
            .client
            .get(self.tasks_url(Some(task_id), Some("stream")))
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;

        let bytes = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
        Ok(Box::new(StreamReader::new(bytes)))
    }

    async fn cancel_job(&self, task_id: &str) -> Result<(), ServiceError> {
        let response = self
            .client
            .post(self.tasks_url(Some(task_id), Some("cancel")))
            .send()
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    async fn dismiss_job(&self, task_id: &str) -> Result<(), ServiceError> {
        let response = self
            .client
            .delete(self.tasks_url(Some(task_id), None))
            .send()
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }
}

/// Accept either an id-keyed object or an array of records with ids.
/// Records missing an `id` take it from their key.
pub fn parse_task_list(body: Value) -> Result<TaskMap, ServiceError> {
    let invalid = |e: serde_json::Error| ServiceError::InvalidResponse(e.to_string());

    match body {
        Value::Object(_) => {
            let mut tasks: TaskMap = serde_json::from_value(body).map_err(invalid)?;
            for (id, task) in tasks.iter_mut() {
                if task.id.is_empty() {
                    task.id = id.clone();
                }
            }
            Ok(tasks)
        }
        Value::Array(_) => {
            let records: Vec<pullsync_core::Task> = serde_json::from_value(body).map_err(invalid)?;
            let mut tasks = TaskMap::new();
            for task in records {
                if task.id.is_empty() {
                    return Err(ServiceError::InvalidResponse(
                        "Task record in list without an id".to_string(),
                    ));
                }
                tasks.insert(task.id.clone(), task);
            }
            Ok(tasks)
        }
        other => Err(ServiceError::InvalidResponse(format!(
            "Expected an object or array of tasks, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pullsync_core::TaskStatus;
    use serde_json::json;

    #[test]
    fn builds_task_urls() {
        let service = HttpJobService::new("http://localhost:11434/").unwrap();
        assert_eq!(
            service.tasks_url(None, None).as_str(),
            "http://localhost:11434/api/tasks"
        );
        assert_eq!(
            service.tasks_url(Some("a b/c"), Some("stream")).as_str(),
            "http://localhost:11434/api/tasks/a%20b%2Fc/stream"
        );
    }

    #[test]
    fn keeps_base_path_prefix() {
        let service = HttpJobService::new("https://host/jobs").unwrap();
        assert_eq!(
            service.tasks_url(Some("t1"), Some("cancel")).as_str(),
            "https://host/jobs/api/tasks/t1/cancel"
        );
    }

    #[test]
    fn rejects_unusable_base_urls() {
        assert!(matches!(
            HttpJobService::new("not a url"),
            Err(ServiceError::InvalidUrl { .. })
        ));
        assert!(matches!(
            HttpJobService::new("mailto:ops@example.com"),
            Err(ServiceError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn parses_keyed_listing() {
        let tasks = parse_task_list(json!({
            "t1": {"subjectName": "llama3", "status": "running"},
            "t2": {"id": "t2", "subjectName": "phi3", "status": "completed"}
        }))
        .unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks["t1"].id, "t1");
        assert_eq!(tasks["t2"].status, TaskStatus::Completed);
    }

    #[test]
    fn parses_array_listing() {
        let tasks = parse_task_list(json!([
            {"id": "a", "subjectName": "m", "status": "pending"}
        ]))
        .unwrap();
        assert!(tasks.contains_key("a"));
    }

    #[test]
    fn rejects_bad_listings() {
        assert!(parse_task_list(json!([{"subjectName": "m", "status": "pending"}])).is_err());
        assert!(parse_task_list(json!("nope")).is_err());
        assert!(parse_task_list(json!({"t1": {"status": "exploded"}})).is_err());
    }
}
