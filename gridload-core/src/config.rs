use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable holding the grid username.
pub const USERNAME_VAR: &str = "SAUCE_USERNAME";
/// Environment variable holding the grid access key.
pub const ACCESS_KEY_VAR: &str = "SAUCE_ACCESS_KEY";
/// Fallback source for a pre-established tunnel identifier.
const TUNNEL_ID_VAR: &str = "TRAVIS_JOB_NUMBER";

#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub key: String,
}

impl Credentials {
    /// Reads both credential variables, failing fast before any tunnel or
    /// session work begins.
    pub fn from_env() -> Result<Self, ConfigError> {
        let user = require_var(USERNAME_VAR)?;
        let key = require_var(ACCESS_KEY_VAR)?;
        Ok(Self { user, key })
    }
}

fn require_var(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingCredentials(name.to_string()))
}

/// One target browser/OS/device combination. Field order is significant for
/// display. Per-browser test option overrides ride along in the same table.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BrowserDescriptor {
    #[serde(rename = "browserName", skip_serializing_if = "Option::is_none")]
    pub browser_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "deviceName", skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(flatten)]
    pub overrides: TestOverrides,
}

impl BrowserDescriptor {
    /// Readable form used in every log line about this browser.
    pub fn readable(&self) -> String {
        [
            &self.browser_name,
            &self.platform,
            &self.version,
            &self.device_name,
        ]
        .into_iter()
        .flatten()
        .map(|value| capitalize(value))
        .collect::<Vec<_>>()
        .join(" / ")
    }
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Test parameters that may be set globally and overridden per browser.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TestOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    #[serde(rename = "setupTimeout", skip_serializing_if = "Option::is_none")]
    pub setup_timeout: Option<u64>,
    #[serde(rename = "max-duration", skip_serializing_if = "Option::is_none")]
    pub max_duration: Option<u64>,
    #[serde(rename = "stepTimeout", skip_serializing_if = "Option::is_none")]
    pub step_timeout: Option<u64>,
    #[serde(rename = "pollInterval", skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// How URLs are visited within one browser session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadMode {
    /// Every visited URL contributes its results to the suite.
    #[default]
    Aggregate,
    /// Only the first URL is scored; later visits exist for crawl discovery.
    Followup,
}

impl FromStr for LoadMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "aggregate" => Ok(Self::Aggregate),
            "followup" => Ok(Self::Followup),
            other => Err(ConfigError::InvalidLoadingMode(other.to_string())),
        }
    }
}

/// Fully resolved per-browser test parameters.
#[derive(Debug, Clone)]
pub struct TestOptions {
    pub urls: Vec<String>,
    pub setup_timeout: Duration,
    pub max_duration: Duration,
    pub step_timeout: Duration,
    pub poll_interval: Duration,
    pub visibility: String,
    pub mode: LoadMode,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            setup_timeout: Duration::from_millis(60_000),
            max_duration: Duration::from_millis(90_000),
            step_timeout: Duration::from_millis(5_000),
            poll_interval: Duration::from_millis(200),
            visibility: "public".to_string(),
            mode: LoadMode::Aggregate,
        }
    }
}

impl TestOptions {
    /// Layers a set of overrides on top of this snapshot. Mode strings are
    /// parsed here, so an invalid mode surfaces before any session opens.
    pub fn apply(&mut self, overrides: &TestOverrides) -> Result<(), ConfigError> {
        if let Some(urls) = &overrides.urls {
            self.urls = urls.clone();
        }
        if let Some(ms) = overrides.setup_timeout {
            self.setup_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.max_duration {
            self.max_duration = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.step_timeout {
            self.step_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.poll_interval {
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Some(visibility) = &overrides.public {
            self.visibility = visibility.clone();
        }
        if let Some(mode) = &overrides.mode {
            self.mode = mode.parse()?;
        }
        Ok(())
    }
}

/// The browsers to run: a flat list, or named groups of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BrowserSet {
    List(Vec<BrowserDescriptor>),
    Groups(BTreeMap<String, Vec<BrowserDescriptor>>),
}

impl BrowserSet {
    pub fn flattened(&self) -> Vec<BrowserDescriptor> {
        match self {
            Self::List(browsers) => browsers.clone(),
            Self::Groups(groups) => groups.values().flatten().cloned().collect(),
        }
    }

    pub fn group(&self, name: &str) -> Option<&[BrowserDescriptor]> {
        match self {
            Self::List(_) => None,
            Self::Groups(groups) => groups.get(name).map(Vec::as_slice),
        }
    }

    pub fn group_names(&self) -> Vec<&str> {
        match self {
            Self::List(_) => Vec::new(),
            Self::Groups(groups) => groups.keys().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_testname")]
    pub testname: String,
    #[serde(default)]
    pub build: Option<String>,
    pub browsers: BrowserSet,
    #[serde(default = "default_throttled")]
    pub throttled: usize,
    #[serde(rename = "tunnelTimeout", default = "default_tunnel_timeout")]
    pub tunnel_timeout: u64,
    #[serde(rename = "tunnel-identifier", default)]
    pub tunnel_identifier: Option<String>,
    #[serde(rename = "mockTunnel", default)]
    pub mock_tunnel: bool,
    #[serde(rename = "seleniumHost", default = "default_selenium_host")]
    pub selenium_host: String,
    #[serde(rename = "seleniumPort", default = "default_selenium_port")]
    pub selenium_port: u16,
    #[serde(flatten)]
    pub defaults: TestOverrides,
}

fn default_testname() -> String {
    "Unnamed".to_string()
}

fn default_throttled() -> usize {
    5
}

fn default_tunnel_timeout() -> u64 {
    90_000
}

fn default_selenium_host() -> String {
    "ondemand.saucelabs.com".to_string()
}

fn default_selenium_port() -> u16 {
    80
}

impl RunConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            source,
            path: path.to_path_buf(),
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            source,
            path: path.to_path_buf(),
        })?;
        Ok(config.normalized())
    }

    /// Fills load-time defaults: the build correlation id (current timestamp)
    /// and a tunnel identifier inherited from the environment.
    pub fn normalized(mut self) -> Self {
        if self.build.is_none() {
            self.build = Some(Utc::now().timestamp_millis().to_string());
        }
        if self.tunnel_identifier.is_none() {
            self.tunnel_identifier = std::env::var(TUNNEL_ID_VAR).ok();
        }
        self
    }

    pub fn build_id(&self) -> &str {
        self.build.as_deref().unwrap_or_default()
    }

    /// Resolves the effective options for one browser: defaults, then the
    /// run-wide overrides, then the browser's own.
    pub fn test_options(&self, browser: &BrowserDescriptor) -> Result<TestOptions, ConfigError> {
        let mut options = TestOptions::default();
        options.apply(&self.defaults)?;
        options.apply(&browser.overrides)?;
        Ok(options)
    }

    /// Checks every browser's resolved options so configuration errors are
    /// detected before any tunnel or session work starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for browser in self.browsers.flattened() {
            self.test_options(&browser)?;
        }
        Ok(())
    }

    /// A copy of this configuration restricted to one named group.
    pub fn with_group(&self, name: &str) -> Option<Self> {
        let browsers = self.browsers.group(name)?.to_vec();
        let mut config = self.clone();
        config.browsers = BrowserSet::List(browsers);
        Some(config)
    }
}
