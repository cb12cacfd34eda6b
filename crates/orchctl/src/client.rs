//! HTTP client for the platform orchestrator daemon's control plane
//! (Section 4.9 routes, Section 7 error taxonomy).

use std::time::Duration;

use futures::StreamExt;
use orch_core::{Operation, Project, RollbackScope};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const INITIAL_BACKOFF_MS: u64 = 200;
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not connect to orchd at {addr} (is it running? try `orchd` or set --addr)")]
    ConnectionFailed { addr: String },

    #[error("daemon at {addr} did not become ready within {timeout_ms}ms")]
    DaemonNotReady { addr: String, timeout_ms: u64 },

    #[error("request failed with status {status}: {message}")]
    HttpError { status: u16, message: String },

    #[error("unexpected response shape: {0}")]
    InvalidResponse(String),

    #[error("project {0} not found")]
    ProjectNotFound(String),

    #[error("operation {0} not found")]
    OpNotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("operation conflict: {reason} (requested {requested_kind}, active op {active_op})")]
    Conflict {
        reason: String,
        requested_kind: String,
        active_op: String,
    },

    #[error("unauthorized (check --token or ORCHD_TOKEN)")]
    Unauthorized,

    #[error("{0}")]
    IoError(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            ClientError::ConnectionFailed {
                addr: e.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else {
            ClientError::HttpError {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    requested_kind: Option<String>,
    #[serde(default)]
    active_op: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OpEnvelope {
    op: Operation,
}

#[derive(Debug, Deserialize)]
pub struct OpsPage {
    pub ops: Vec<Operation>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Serialize)]
struct RegistrationRequest<'a> {
    action: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    spec: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct DeploymentRequest<'a> {
    project_id: &'a str,
    environment: &'a str,
}

#[derive(Debug, Serialize)]
struct TransitionRequest<'a> {
    project_id: &'a str,
    from_env: &'a str,
    to_env: &'a str,
}

#[derive(Debug, Serialize)]
struct RollbackRequest<'a> {
    project_id: &'a str,
    target_release_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<RollbackScope>,
    #[serde(rename = "override")]
    force_override: bool,
}

pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(|t| t.to_string()),
            http: reqwest::Client::new(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.base_url
    }

    fn headers(&self) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        if let Some(token) = &self.token {
            if let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(reqwest::header::AUTHORIZATION, value);
            }
        }
        headers
    }

    pub async fn check_health(&self) -> Result<(), ClientError> {
        let url = format!("{}/api/healthz", self.base_url);
        self.http
            .get(&url)
            .send()
            .await
            .map_err(|_| ClientError::ConnectionFailed { addr: self.base_url.clone() })?;
        Ok(())
    }

    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        self.wait_for_ready_with_timeout(DEFAULT_READY_TIMEOUT_MS).await
    }

    pub async fn wait_for_ready_with_timeout(&self, timeout_ms: u64) -> Result<(), ClientError> {
        let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
        let mut backoff_ms = INITIAL_BACKOFF_MS;
        loop {
            if self.check_health().await.is_ok() {
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                return Err(ClientError::DaemonNotReady {
                    addr: self.base_url.clone(),
                    timeout_ms,
                });
            }
            eprintln!("waiting for orchd at {}...", self.base_url);
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms = (backoff_ms * 2).min(1000);
        }
    }

    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status();
        match status {
            reqwest::StatusCode::UNAUTHORIZED => ClientError::Unauthorized,
            _ => {
                let body = response.json::<ErrorResponse>().await;
                match body {
                    Ok(body) if status == reqwest::StatusCode::CONFLICT => ClientError::Conflict {
                        reason: body.reason.unwrap_or_default(),
                        requested_kind: body.requested_kind.unwrap_or_default(),
                        active_op: body
                            .active_op
                            .and_then(|v| v.get("id").and_then(|id| id.as_str().map(str::to_string)))
                            .unwrap_or_default(),
                    },
                    Ok(body) if status == reqwest::StatusCode::BAD_REQUEST => {
                        ClientError::Validation(body.reason.unwrap_or(body.error))
                    }
                    Ok(body) if status == reqwest::StatusCode::NOT_FOUND => {
                        if body.error.starts_with("project") {
                            ClientError::ProjectNotFound(body.error)
                        } else {
                            ClientError::OpNotFound(body.error)
                        }
                    }
                    Ok(body) => ClientError::HttpError { status: status.as_u16(), message: body.error },
                    Err(_) => ClientError::HttpError { status: status.as_u16(), message: status.to_string() },
                }
            }
        }
    }

    async fn post_op<T: Serialize>(&self, path: &str, body: &T) -> Result<Operation, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.post(&url).headers(self.headers()).json(body).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        let envelope: OpEnvelope = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(envelope.op)
    }

    pub async fn create_project(&self, spec: serde_json::Value) -> Result<Operation, ClientError> {
        let req = RegistrationRequest { action: "create", spec: Some(spec), project_id: None };
        self.post_op("/api/events/registration", &req).await
    }

    pub async fn update_project(&self, project_id: &str, spec: serde_json::Value) -> Result<Operation, ClientError> {
        let url = format!("{}/api/projects/{}", self.base_url, project_id);
        let response = self.http.put(&url).headers(self.headers()).json(&spec).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        let envelope: OpEnvelope = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(envelope.op)
    }

    pub async fn delete_project(&self, project_id: &str) -> Result<Operation, ClientError> {
        let url = format!("{}/api/projects/{}", self.base_url, project_id);
        let response = self.http.delete(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        let envelope: OpEnvelope = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(envelope.op)
    }

    pub async fn deploy(&self, project_id: &str, environment: &str) -> Result<Operation, ClientError> {
        let req = DeploymentRequest { project_id, environment };
        self.post_op("/api/events/deployment", &req).await
    }

    pub async fn promote(&self, project_id: &str, from_env: &str, to_env: &str) -> Result<Operation, ClientError> {
        let req = TransitionRequest { project_id, from_env, to_env };
        self.post_op("/api/events/promotion", &req).await
    }

    pub async fn promote_preview(
        &self,
        project_id: &str,
        from_env: &str,
        to_env: &str,
    ) -> Result<serde_json::Value, ClientError> {
        let req = TransitionRequest { project_id, from_env, to_env };
        self.post_preview("/api/events/promotion/preview", &req).await
    }

    pub async fn release(&self, project_id: &str, from_env: &str, to_env: &str) -> Result<Operation, ClientError> {
        let req = TransitionRequest { project_id, from_env, to_env };
        self.post_op("/api/events/release", &req).await
    }

    pub async fn rollback(
        &self,
        project_id: &str,
        target_release_id: &str,
        scope: Option<RollbackScope>,
        force_override: bool,
    ) -> Result<Operation, ClientError> {
        let req = RollbackRequest { project_id, target_release_id, scope, force_override };
        self.post_op("/api/events/rollback", &req).await
    }

    pub async fn rollback_preview(
        &self,
        project_id: &str,
        target_release_id: &str,
        scope: Option<RollbackScope>,
        force_override: bool,
    ) -> Result<serde_json::Value, ClientError> {
        let req = RollbackRequest { project_id, target_release_id, scope, force_override };
        self.post_preview("/api/events/rollback/preview", &req).await
    }

    async fn post_preview<T: Serialize>(&self, path: &str, body: &T) -> Result<serde_json::Value, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.post(&url).headers(self.headers()).json(body).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, ClientError> {
        let url = format!("{}/api/projects", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        #[derive(Deserialize)]
        struct Envelope {
            projects: Vec<Project>,
        }
        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(envelope.projects)
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Project, ClientError> {
        let url = format!("{}/api/projects/{}", self.base_url, project_id);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn list_artifacts(&self, project_id: &str) -> Result<Vec<String>, ClientError> {
        let url = format!("{}/api/projects/{}/artifacts", self.base_url, project_id);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        #[derive(Deserialize)]
        struct Envelope {
            files: Vec<String>,
        }
        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(envelope.files)
    }

    pub async fn get_artifact(&self, project_id: &str, path: &str) -> Result<Vec<u8>, ClientError> {
        let url = format!("{}/api/projects/{}/artifacts/{}", self.base_url, project_id, path);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(response.bytes().await?.to_vec())
    }

    pub async fn list_ops(
        &self,
        project_id: &str,
        limit: Option<usize>,
        cursor: Option<&str>,
        before: Option<&str>,
    ) -> Result<OpsPage, ClientError> {
        let mut url = format!("{}/api/projects/{}/ops", self.base_url, project_id);
        let mut params = Vec::new();
        if let Some(limit) = limit {
            params.push(format!("limit={}", limit));
        }
        if let Some(cursor) = cursor {
            params.push(format!("cursor={}", urlencoding::encode(cursor)));
        }
        if let Some(before) = before {
            params.push(format!("before={}", urlencoding::encode(before)));
        }
        if !params.is_empty() {
            url.push('?');
            url.push_str(&params.join("&"));
        }
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn get_op(&self, op_id: &str) -> Result<Operation, ClientError> {
        let url = format!("{}/api/ops/{}", self.base_url, op_id);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn system_info(&self) -> Result<serde_json::Value, ClientError> {
        let url = format!("{}/api/system", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// Tail an operation's SSE event stream, printing each event as it arrives.
    pub async fn tail_op(&self, op_id: &str, follow: bool) -> Result<(), ClientError> {
        let url = format!("{}/api/ops/{}/events", self.base_url, op_id);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        let mut stream = response.bytes_stream();
        let mut buf = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buf.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = buf.find("\n\n") {
                let block: String = buf.drain(..pos + 2).collect();
                if let Some(parsed) = parse_sse_block(&block) {
                    let is_terminal = parsed.event == "op.completed" || parsed.event == "op.failed";
                    print_sse_event(&parsed);
                    if !follow && is_terminal {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }
}

struct SseEventLine {
    event: String,
    data: String,
}

fn parse_sse_block(block: &str) -> Option<SseEventLine> {
    let mut event = String::from("message");
    let mut data = String::new();
    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.trim());
        }
    }
    if data.is_empty() && event == "message" {
        return None;
    }
    Some(SseEventLine { event, data })
}

fn print_sse_event(event: &SseEventLine) {
    match serde_json::from_str::<serde_json::Value>(&event.data) {
        Ok(value) => println!("[{}] {}", event.event, value),
        Err(_) => println!("[{}] {}", event.event, event.data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_trims_trailing_slash() {
        let client = Client::new("http://127.0.0.1:8080/", None);
        assert_eq!(client.addr(), "http://127.0.0.1:8080");
    }

    #[test]
    fn client_preserves_url_without_trailing_slash() {
        let client = Client::new("http://127.0.0.1:8080", None);
        assert_eq!(client.addr(), "http://127.0.0.1:8080");
    }

    #[test]
    fn client_addr_returns_base_url() {
        let client = Client::new("http://example.com:9000", None);
        assert_eq!(client.addr(), "http://example.com:9000");
    }

    #[test]
    fn client_headers_include_content_type() {
        let client = Client::new("http://127.0.0.1:8080", None);
        let headers = client.headers();
        assert_eq!(headers.get(reqwest::header::CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn client_headers_include_auth_when_token_set() {
        let client = Client::new("http://127.0.0.1:8080", Some("secret"));
        let headers = client.headers();
        assert_eq!(headers.get(reqwest::header::AUTHORIZATION).unwrap(), "Bearer secret");
    }

    #[test]
    fn client_headers_omit_auth_when_no_token() {
        let client = Client::new("http://127.0.0.1:8080", None);
        let headers = client.headers();
        assert!(headers.get(reqwest::header::AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn check_health_fails_when_daemon_not_running() {
        let client = Client::new("http://127.0.0.1:1", None);
        assert!(client.check_health().await.is_err());
    }

    #[tokio::test]
    async fn wait_for_ready_times_out_when_daemon_not_running() {
        let client = Client::new("http://127.0.0.1:1", None);
        let result = client.wait_for_ready_with_timeout(250).await;
        assert!(matches!(result, Err(ClientError::DaemonNotReady { .. })));
    }

    #[test]
    fn daemon_not_ready_error_message_includes_hint() {
        let err = ClientError::DaemonNotReady { addr: "http://127.0.0.1:8080".to_string(), timeout_ms: 5000 };
        assert!(err.to_string().contains("did not become ready"));
    }

    #[test]
    fn connection_failed_error_suggests_start_command() {
        let err = ClientError::ConnectionFailed { addr: "http://127.0.0.1:8080".to_string() };
        assert!(err.to_string().contains("orchd"));
    }

    #[test]
    fn unauthorized_error_suggests_token_options() {
        let err = ClientError::Unauthorized;
        assert!(err.to_string().contains("token"));
    }

    #[test]
    fn parse_sse_block_extracts_event_and_data() {
        let block = "id: 3\nevent: op.step\ndata: {\"worker\":\"registrar\"}\n\n";
        let parsed = parse_sse_block(block).unwrap();
        assert_eq!(parsed.event, "op.step");
        assert_eq!(parsed.data, "{\"worker\":\"registrar\"}");
    }

    #[test]
    fn parse_sse_block_handles_multiline_data() {
        let block = "event: op.heartbeat\ndata: line one\ndata: line two\n\n";
        let parsed = parse_sse_block(block).unwrap();
        assert_eq!(parsed.data, "line one\nline two");
    }

    #[test]
    fn parse_sse_block_ignores_empty_block() {
        assert!(parse_sse_block("\n\n").is_none());
    }
}
