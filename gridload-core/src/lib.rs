pub mod config;
pub mod error;
pub mod loader;
pub mod queue;
pub mod results;
pub mod run;
pub mod session;
pub mod shutdown;
pub mod throttle;
pub mod tunnel;
pub mod webdriver;

pub use config::{
    BrowserDescriptor, BrowserSet, Credentials, LoadMode, RunConfig, TestOptions, TestOverrides,
};
pub use error::{ConfigError, RunError, RunResult};
pub use loader::{LoaderError, LoaderResult, MakeLoader, StandardLoaderFactory, UrlLoader};
pub use queue::{Enqueue, QueueError, QueueResult, Visited};
pub use results::{BrowserResults, SuiteResult, TestResult};
pub use run::TestRun;
pub use session::{
    RemoteSession, SessionCapabilities, SessionError, SessionGrid, SessionPhase, SessionResult,
    SessionRunner,
};
pub use shutdown::Shutdown;
pub use tunnel::{
    MockTunnelLauncher, ProcessTunnelLauncher, Tunnel, TunnelError, TunnelHandle, TunnelLauncher,
    TunnelManager, TunnelResult, TunnelStopper,
};
pub use webdriver::{WebDriverGrid, WebDriverSession};
