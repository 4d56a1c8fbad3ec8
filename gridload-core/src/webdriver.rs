use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use crate::config::Credentials;
use crate::session::{RemoteSession, SessionCapabilities, SessionError, SessionGrid, SessionResult};

/// REST endpoint for job annotations, separate from the wire protocol.
const REST_BASE: &str = "https://saucelabs.com/rest/v1";
/// Slack added on top of the async-script bound for the wire round trip.
const SCRIPT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(rename = "sessionId", default)]
    session_id: Option<String>,
    #[serde(default)]
    status: Option<i64>,
    #[serde(default)]
    value: Value,
}

impl WireResponse {
    fn into_value(self) -> SessionResult<Value> {
        match self.status {
            Some(status) if status != 0 => Err(SessionError::Protocol(wire_message(
                &self.value,
                status,
            ))),
            _ => Ok(self.value),
        }
    }
}

fn wire_message(value: &Value, status: i64) -> String {
    value
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("command failed with status {status}"))
}

/// JSON-wire client for a remote browser grid.
pub struct WebDriverGrid {
    http: reqwest::Client,
    base: String,
    credentials: Credentials,
}

impl WebDriverGrid {
    pub fn new(host: &str, port: u16, credentials: Credentials) -> SessionResult<Self> {
        let base = format!("http://{host}:{port}/wd/hub");
        Url::parse(&base)
            .map_err(|err| SessionError::Protocol(format!("invalid grid endpoint {base}: {err}")))?;
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base,
            credentials,
        })
    }
}

#[async_trait]
impl SessionGrid for WebDriverGrid {
    /// Opens a session. No request timeout here: the caller bounds the whole
    /// init with its setup timeout and dropping the future aborts the call.
    async fn open(
        &self,
        capabilities: &SessionCapabilities,
    ) -> SessionResult<Arc<dyn RemoteSession>> {
        let response = self
            .http
            .post(format!("{}/session", self.base))
            .basic_auth(&self.credentials.user, Some(&self.credentials.key))
            .json(&json!({ "desiredCapabilities": capabilities }))
            .send()
            .await?;
        let payload: WireResponse = response.json().await?;
        if let Some(status) = payload.status {
            if status != 0 {
                return Err(SessionError::Protocol(wire_message(&payload.value, status)));
            }
        }
        let session_id = payload
            .session_id
            .or_else(|| {
                payload
                    .value
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .ok_or_else(|| {
                SessionError::Protocol("session response carried no session id".to_string())
            })?;

        Ok(Arc::new(WebDriverSession {
            http: self.http.clone(),
            base: self.base.clone(),
            credentials: self.credentials.clone(),
            session_id,
            step_timeout: capabilities.step_timeout,
            script_timeout: Mutex::new(Duration::ZERO),
        }))
    }

    async fn annotate(&self, session_id: &str, passed: bool) -> SessionResult<()> {
        self.http
            .put(format!(
                "{REST_BASE}/{}/jobs/{session_id}",
                self.credentials.user
            ))
            .basic_auth(&self.credentials.user, Some(&self.credentials.key))
            .json(&json!({ "passed": passed }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// One live wire-protocol session.
pub struct WebDriverSession {
    http: reqwest::Client,
    base: String,
    credentials: Credentials,
    session_id: String,
    step_timeout: Duration,
    script_timeout: Mutex<Duration>,
}

impl WebDriverSession {
    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        bound: Duration,
    ) -> SessionResult<Value> {
        let url = format!("{}/session/{}{path}", self.base, self.session_id);
        let mut request = self
            .http
            .request(method, url)
            .basic_auth(&self.credentials.user, Some(&self.credentials.key))
            .timeout(bound);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let payload: WireResponse = response.json().await?;
        payload.into_value()
    }
}

#[async_trait]
impl RemoteSession for WebDriverSession {
    fn session_id(&self) -> Option<&str> {
        Some(&self.session_id)
    }

    async fn navigate(&self, url: &str) -> SessionResult<()> {
        self.command(
            Method::POST,
            "/url",
            Some(json!({ "url": url })),
            self.step_timeout,
        )
        .await
        .map(drop)
    }

    async fn execute_async(&self, script: &str) -> SessionResult<Value> {
        // Async scripts legitimately run up to the configured script bound,
        // so the wire timeout follows that instead of the step timeout.
        let bound = *self.script_timeout.lock().unwrap() + SCRIPT_GRACE;
        self.command(
            Method::POST,
            "/execute_async",
            Some(json!({ "script": script, "args": [] })),
            bound,
        )
        .await
    }

    async fn evaluate(&self, expression: &str) -> SessionResult<Value> {
        let script = format!("return ({expression});");
        self.command(
            Method::POST,
            "/execute",
            Some(json!({ "script": script, "args": [] })),
            self.step_timeout,
        )
        .await
    }

    async fn set_async_script_timeout(&self, bound: Duration) -> SessionResult<()> {
        *self.script_timeout.lock().unwrap() = bound;
        self.command(
            Method::POST,
            "/timeouts/async_script",
            Some(json!({ "ms": bound.as_millis() as u64 })),
            self.step_timeout,
        )
        .await
        .map(drop)
    }

    async fn quit(&self) -> SessionResult<()> {
        self.command(Method::DELETE, "", None, self.step_timeout)
            .await
            .map(drop)
    }
}
