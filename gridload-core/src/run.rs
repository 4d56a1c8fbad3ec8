use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::{BrowserDescriptor, Credentials, RunConfig, TestOptions};
use crate::error::{RunError, RunResult};
use crate::loader::{MakeLoader, StandardLoaderFactory};
use crate::queue;
use crate::results::{BrowserResults, SuiteResult};
use crate::session::{SessionCapabilities, SessionGrid, SessionRunner};
use crate::shutdown::Shutdown;
use crate::throttle;
use crate::tunnel::{MockTunnelLauncher, ProcessTunnelLauncher, TunnelLauncher, TunnelManager};
use crate::webdriver::WebDriverGrid;

/// Composes the whole orchestration: tunnel around a throttled pool of
/// browsers, each driving a dedup queue of URLs through a page loader.
pub struct TestRun {
    config: RunConfig,
    grid: Arc<dyn SessionGrid>,
    launcher: Arc<dyn TunnelLauncher>,
    loader: Arc<dyn MakeLoader>,
    shutdown: Arc<Shutdown>,
}

impl TestRun {
    pub fn new(config: RunConfig, credentials: Credentials) -> RunResult<Self> {
        // Configuration errors surface here, before any session opens.
        config.validate()?;
        let grid = Arc::new(WebDriverGrid::new(
            &config.selenium_host,
            config.selenium_port,
            credentials.clone(),
        )?);
        let launcher: Arc<dyn TunnelLauncher> = if config.mock_tunnel {
            Arc::new(MockTunnelLauncher)
        } else {
            Arc::new(ProcessTunnelLauncher::new(credentials))
        };
        Ok(Self {
            config,
            grid,
            launcher,
            loader: Arc::new(StandardLoaderFactory),
            shutdown: Arc::new(Shutdown::new()),
        })
    }

    pub fn with_grid(mut self, grid: Arc<dyn SessionGrid>) -> Self {
        self.grid = grid;
        self
    }

    pub fn with_tunnel_launcher(mut self, launcher: Arc<dyn TunnelLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn MakeLoader>) -> Self {
        self.loader = loader;
        self
    }

    /// The shutdown registry to wire to the process interrupt signal.
    pub fn shutdown(&self) -> Arc<Shutdown> {
        Arc::clone(&self.shutdown)
    }

    pub async fn execute(&self) -> RunResult<BrowserResults> {
        info!(
            testname = %self.config.testname,
            build = %self.config.build_id(),
            "starting test run"
        );

        let manager = TunnelManager::new(
            Arc::clone(&self.launcher),
            self.config.tunnel_identifier.clone(),
            self.config.tunnel_timeout,
        );

        manager
            .run(&self.shutdown, |tunnel| async move {
                let browsers = self.config.browsers.flattened();
                let entries = throttle::map(self.config.throttled, browsers, |browser| {
                    let tunnel = tunnel.clone();
                    async move {
                        Ok::<_, RunError>(self.run_browser(tunnel.identifier(), browser).await)
                    }
                })
                .await?;
                Ok(BrowserResults::new(entries))
            })
            .await
    }

    /// One browser's whole journey. Failures are converted into a reported
    /// failed suite so one bad browser never aborts its siblings.
    async fn run_browser(
        &self,
        tunnel_identifier: &str,
        browser: BrowserDescriptor,
    ) -> (BrowserDescriptor, SuiteResult) {
        let outcome = match self.config.test_options(&browser) {
            Ok(options) => {
                self.drive_session(tunnel_identifier, &browser, &options)
                    .await
            }
            Err(err) => Err(RunError::from(err)),
        };
        let suite = match outcome {
            Ok(suite) => suite,
            Err(err) => {
                error!(browser = %browser.readable(), error = %err, "browser run failed");
                SuiteResult::from_failure(err.to_string())
            }
        };
        suite.report(&browser);
        (browser, suite)
    }

    async fn drive_session(
        &self,
        tunnel_identifier: &str,
        browser: &BrowserDescriptor,
        options: &TestOptions,
    ) -> RunResult<SuiteResult> {
        let capabilities = SessionCapabilities::new(
            browser,
            &self.config.testname,
            self.config.build_id(),
            options,
            tunnel_identifier,
        );
        let runner = SessionRunner::new(
            Arc::clone(&self.grid),
            browser.clone(),
            options.clone(),
            capabilities,
        );

        let loader_factory = Arc::clone(&self.loader);
        let grid = Arc::clone(&self.grid);
        let annotate = !self.config.mock_tunnel;
        let options = options.clone();

        runner
            .run(move |session| async move {
                let loader = loader_factory.make(Arc::clone(&session), &options);
                let visited = queue::drain(&options.urls, |url, enqueue| {
                    let loader = Arc::clone(&loader);
                    async move { loader.visit(&url, &enqueue).await.map_err(RunError::from) }
                })
                .await?;
                let suite = SuiteResult::combine(visited.into_iter().map(|visit| visit.outcome));

                if annotate {
                    if let Some(id) = session.session_id() {
                        if let Err(err) = grid.annotate(id, suite.failed == 0).await {
                            warn!(error = %err, "job status annotation failed");
                        }
                    }
                }
                Ok::<_, RunError>(suite)
            })
            .await
    }
}
