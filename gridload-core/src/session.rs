use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::{BrowserDescriptor, TestOptions};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("timed out initializing browser after {timeout}ms: {browser}")]
    SetupTimeout { timeout: u64, browser: String },
    #[error("timed out running test after {timeout}ms: {browser}")]
    RunTimeout { timeout: u64, browser: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("wire protocol error: {0}")]
    Protocol(String),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Capabilities sent to the grid when opening a session: the browser's own
/// tags plus the run-wide identification fields.
#[derive(Debug, Clone, Serialize)]
pub struct SessionCapabilities {
    #[serde(flatten)]
    pub browser: BrowserDescriptor,
    pub name: String,
    pub build: String,
    pub public: String,
    #[serde(rename = "tunnel-identifier")]
    pub tunnel_identifier: String,
    #[serde(skip)]
    pub step_timeout: Duration,
}

impl SessionCapabilities {
    pub fn new(
        browser: &BrowserDescriptor,
        name: &str,
        build: &str,
        options: &TestOptions,
        tunnel_identifier: &str,
    ) -> Self {
        let mut browser = browser.clone();
        browser.overrides = Default::default();
        Self {
            browser,
            name: name.to_string(),
            build: build.to_string(),
            public: options.visibility.clone(),
            tunnel_identifier: tunnel_identifier.to_string(),
            step_timeout: options.step_timeout,
        }
    }
}

/// Opaque handle to one live remote browser.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    fn session_id(&self) -> Option<&str>;
    async fn navigate(&self, url: &str) -> SessionResult<()>;
    async fn execute_async(&self, script: &str) -> SessionResult<Value>;
    async fn evaluate(&self, expression: &str) -> SessionResult<Value>;
    async fn set_async_script_timeout(&self, bound: Duration) -> SessionResult<()>;
    async fn quit(&self) -> SessionResult<()>;
}

/// Opens remote sessions and annotates finished jobs.
#[async_trait]
pub trait SessionGrid: Send + Sync {
    async fn open(&self, capabilities: &SessionCapabilities)
        -> SessionResult<Arc<dyn RemoteSession>>;
    /// Best-effort pass/fail annotation on a finished grid job.
    async fn annotate(&self, session_id: &str, passed: bool) -> SessionResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Initializing,
    Ready,
    Running,
    Closing,
    Closed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        write!(f, "{name}")
    }
}

/// Owns one remote browser session for the duration of one browser's run:
/// init under the setup bound, the caller-supplied body under the run bound,
/// then unconditional best-effort teardown.
pub struct SessionRunner {
    grid: Arc<dyn SessionGrid>,
    browser: BrowserDescriptor,
    options: TestOptions,
    capabilities: SessionCapabilities,
    phase: SessionPhase,
}

impl SessionRunner {
    pub fn new(
        grid: Arc<dyn SessionGrid>,
        browser: BrowserDescriptor,
        options: TestOptions,
        capabilities: SessionCapabilities,
    ) -> Self {
        Self {
            grid,
            browser,
            options,
            capabilities,
            phase: SessionPhase::Idle,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Drives the phases strictly in order. Only the runner's own loop
    /// transitions the phase; the closing phase always executes, but the
    /// quit call is skipped when no session id was ever obtained.
    pub async fn run<T, E, F, Fut>(mut self, body: F) -> Result<T, E>
    where
        E: From<SessionError> + fmt::Display,
        F: FnOnce(Arc<dyn RemoteSession>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let readable = self.browser.readable();
        info!(browser = %readable, "starting");
        self.phase = SessionPhase::Initializing;

        let session: Option<Arc<dyn RemoteSession>>;
        let outcome: Result<T, E>;

        let setup_bound = self.options.setup_timeout;
        match timeout(setup_bound, self.grid.open(&self.capabilities)).await {
            Err(_) => {
                session = None;
                outcome = Err(E::from(SessionError::SetupTimeout {
                    timeout: setup_bound.as_millis() as u64,
                    browser: readable.clone(),
                }));
            }
            Ok(Err(err)) => {
                session = None;
                outcome = Err(E::from(err));
            }
            Ok(Ok(opened)) => {
                self.phase = SessionPhase::Ready;
                if let Some(id) = opened.session_id() {
                    info!(
                        browser = %readable,
                        session = %format!("https://saucelabs.com/tests/{id}"),
                        "session open"
                    );
                }
                match opened
                    .set_async_script_timeout(self.options.max_duration)
                    .await
                {
                    Err(err) => {
                        outcome = Err(E::from(err));
                    }
                    Ok(()) => {
                        self.phase = SessionPhase::Running;
                        let run_bound = self.options.max_duration;
                        outcome = match timeout(run_bound, body(Arc::clone(&opened))).await {
                            Err(_) => Err(E::from(SessionError::RunTimeout {
                                timeout: run_bound.as_millis() as u64,
                                browser: readable.clone(),
                            })),
                            Ok(result) => result,
                        };
                    }
                }
                session = Some(opened);
            }
        }

        self.phase = SessionPhase::Closing;
        if let Some(open) = &session {
            if open.session_id().is_some() {
                // Quit trouble must not mask the outcome that led here.
                if let Err(err) = open.quit().await {
                    warn!(browser = %readable, error = %err, "session quit failed");
                }
            }
        }
        self.phase = SessionPhase::Closed;

        if let Err(err) = &outcome {
            error!(browser = %readable, error = %err, "failed");
        }
        outcome
    }
}
