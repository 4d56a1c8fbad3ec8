use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Credentials;
use crate::shutdown::Shutdown;

/// Line the tunnel process prints once the bridge is usable.
const READY_MARKER: &str = "you may start your tests";
/// Overrides the tunnel binary to launch; defaults to `sc` on PATH.
const TUNNEL_BINARY_VAR: &str = "SAUCE_CONNECT_BINARY";

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("timed out creating tunnel: {0}ms")]
    ConnectTimeout(u64),
    #[error("timed out closing tunnel: {0}ms")]
    CloseTimeout(u64),
    #[error("unable to open tunnel: {0}")]
    Start(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TunnelResult<T> = Result<T, TunnelError>;

/// Opaque secure-tunnel capability: an identifier plus a teardown action.
#[async_trait]
pub trait Tunnel: Send + Sync {
    fn identifier(&self) -> &str;
    async fn stop(&mut self) -> TunnelResult<()>;
}

#[async_trait]
pub trait TunnelLauncher: Send + Sync {
    async fn start(&self) -> TunnelResult<Box<dyn Tunnel>>;
}

enum StopState {
    Live(Box<dyn Tunnel>),
    Closed,
}

/// Teardown guard shared by the normal flow and the interrupt hook. Both
/// call sites race harmlessly: the async mutex serializes them and whoever
/// arrives second finds the tunnel already closed.
pub struct TunnelStopper {
    state: AsyncMutex<StopState>,
    close_timeout: Duration,
}

impl TunnelStopper {
    fn live(tunnel: Box<dyn Tunnel>, close_timeout: Duration) -> Self {
        Self {
            state: AsyncMutex::new(StopState::Live(tunnel)),
            close_timeout,
        }
    }

    fn noop() -> Self {
        Self {
            state: AsyncMutex::new(StopState::Closed),
            close_timeout: Duration::ZERO,
        }
    }

    /// At most one caller tears the tunnel down; the rest observe `Closed`.
    /// A teardown that exceeds the close bound is reported, but the tunnel
    /// still counts as closed and will not be stopped again.
    pub async fn stop(&self) -> TunnelResult<()> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, StopState::Closed) {
            StopState::Closed => Ok(()),
            StopState::Live(mut tunnel) => {
                info!(identifier = %tunnel.identifier(), "closing tunnel");
                match timeout(self.close_timeout, tunnel.stop()).await {
                    Ok(Ok(())) => {
                        info!("tunnel closed");
                        Ok(())
                    }
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(TunnelError::CloseTimeout(
                        self.close_timeout.as_millis() as u64
                    )),
                }
            }
        }
    }
}

/// One active or reused tunnel, shared read-only across browser workers.
#[derive(Clone)]
pub struct TunnelHandle {
    identifier: String,
    stopper: Arc<TunnelStopper>,
}

impl TunnelHandle {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub async fn stop(&self) -> TunnelResult<()> {
        self.stopper.stop().await
    }
}

/// Establishes or reuses a tunnel around a unit of work, guaranteeing the
/// teardown runs after the work settles, exactly once.
pub struct TunnelManager {
    launcher: Arc<dyn TunnelLauncher>,
    reuse_identifier: Option<String>,
    timeout_ms: u64,
}

impl TunnelManager {
    pub fn new(
        launcher: Arc<dyn TunnelLauncher>,
        reuse_identifier: Option<String>,
        timeout_ms: u64,
    ) -> Self {
        Self {
            launcher,
            reuse_identifier,
            timeout_ms,
        }
    }

    pub async fn run<T, E, F, Fut>(&self, shutdown: &Shutdown, work: F) -> Result<T, E>
    where
        E: From<TunnelError>,
        F: FnOnce(TunnelHandle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let handle = self.acquire(shutdown).await?;
        let outcome = work(handle.clone()).await;
        let closed = handle.stop().await;
        match outcome {
            Err(err) => {
                // Teardown trouble must not mask the failure that caused it.
                if let Err(close_err) = closed {
                    warn!(error = %close_err, "tunnel teardown after failed run");
                }
                Err(err)
            }
            Ok(value) => {
                closed?;
                Ok(value)
            }
        }
    }

    async fn acquire(&self, shutdown: &Shutdown) -> TunnelResult<TunnelHandle> {
        let bound = Duration::from_millis(self.timeout_ms);

        if let Some(identifier) = &self.reuse_identifier {
            info!(identifier = %identifier, "using existing tunnel");
            return Ok(TunnelHandle {
                identifier: identifier.clone(),
                stopper: Arc::new(TunnelStopper::noop()),
            });
        }

        info!("starting tunnel");
        let tunnel = match timeout(bound, self.launcher.start()).await {
            Ok(Ok(tunnel)) => tunnel,
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(TunnelError::ConnectTimeout(self.timeout_ms)),
        };
        info!(identifier = %tunnel.identifier(), "tunnel connected");

        let handle = TunnelHandle {
            identifier: tunnel.identifier().to_string(),
            stopper: Arc::new(TunnelStopper::live(tunnel, bound)),
        };

        // An operator interrupt goes through the same idempotent stopper as
        // normal completion.
        let stopper = Arc::clone(&handle.stopper);
        shutdown.on_interrupt(move || {
            let stopper = Arc::clone(&stopper);
            Box::pin(async move {
                if let Err(err) = stopper.stop().await {
                    warn!(error = %err, "tunnel teardown on interrupt failed");
                }
            })
        });

        Ok(handle)
    }
}

/// Stand-in tunnel for local runs: same lifecycle and identifier plumbing,
/// no external process.
pub struct MockTunnelLauncher;

#[async_trait]
impl TunnelLauncher for MockTunnelLauncher {
    async fn start(&self) -> TunnelResult<Box<dyn Tunnel>> {
        Ok(Box::new(MockTunnel {
            identifier: Uuid::new_v4().to_string(),
        }))
    }
}

struct MockTunnel {
    identifier: String,
}

#[async_trait]
impl Tunnel for MockTunnel {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn stop(&mut self) -> TunnelResult<()> {
        Ok(())
    }
}

/// Launches the external tunnel binary and waits for its ready line.
pub struct ProcessTunnelLauncher {
    binary: PathBuf,
    credentials: Credentials,
}

impl ProcessTunnelLauncher {
    pub fn new(credentials: Credentials) -> Self {
        let binary = std::env::var(TUNNEL_BINARY_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("sc"));
        Self {
            binary,
            credentials,
        }
    }
}

#[async_trait]
impl TunnelLauncher for ProcessTunnelLauncher {
    async fn start(&self) -> TunnelResult<Box<dyn Tunnel>> {
        let identifier = Uuid::new_v4().to_string();
        let mut child = Command::new(&self.binary)
            .arg("--user")
            .arg(&self.credentials.user)
            .arg("--api-key")
            .arg(&self.credentials.key)
            .arg("--tunnel-identifier")
            .arg(&identifier)
            .arg("--se-port")
            .arg("0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TunnelError::Start("tunnel process has no stdout".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            if line.contains(READY_MARKER) {
                return Ok(Box::new(ProcessTunnel { identifier, child }));
            }
        }
        Err(TunnelError::Start(
            "tunnel process exited before becoming ready".to_string(),
        ))
    }
}

struct ProcessTunnel {
    identifier: String,
    child: Child,
}

#[async_trait]
impl Tunnel for ProcessTunnel {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn stop(&mut self) -> TunnelResult<()> {
        self.child.start_kill()?;
        self.child.wait().await?;
        Ok(())
    }
}
