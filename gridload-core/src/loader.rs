use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::config::{LoadMode, TestOptions};
use crate::queue::{Enqueue, QueueError};
use crate::results::SuiteResult;
use crate::session::{RemoteSession, SessionError};

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("timed out looking for window.global_test_results after {0}ms")]
    ResultsTimeout(u64),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

pub type LoaderResult<T> = Result<T, LoaderError>;

/// One "navigate, wait, harvest follow-ups, score" step against an open
/// session. Implementations may keep state across calls within one browser.
#[async_trait]
pub trait UrlLoader: Send + Sync {
    async fn visit(&self, url: &str, queue: &Enqueue) -> LoaderResult<SuiteResult>;
}

/// Builds the loader for one open session; the seam where a caller can
/// substitute a custom policy for the named ones.
pub trait MakeLoader: Send + Sync {
    fn make(&self, session: Arc<dyn RemoteSession>, options: &TestOptions) -> Arc<dyn UrlLoader>;
}

/// Default factory: builds whichever named policy the options select.
pub struct StandardLoaderFactory;

impl MakeLoader for StandardLoaderFactory {
    fn make(&self, session: Arc<dyn RemoteSession>, options: &TestOptions) -> Arc<dyn UrlLoader> {
        Arc::new(StandardLoader {
            session,
            options: options.clone(),
            visited_first: AtomicBool::new(false),
        })
    }
}

struct StandardLoader {
    session: Arc<dyn RemoteSession>,
    options: TestOptions,
    visited_first: AtomicBool,
}

#[async_trait]
impl UrlLoader for StandardLoader {
    async fn visit(&self, url: &str, queue: &Enqueue) -> LoaderResult<SuiteResult> {
        let score = match self.options.mode {
            LoadMode::Aggregate => true,
            // Follow-up visits exist for crawl discovery only; the first
            // page already produced the authoritative score.
            LoadMode::Followup => !self.visited_first.swap(true, Ordering::Relaxed),
        };

        let started = Instant::now();
        self.session.navigate(url).await?;
        self.wait_for_window_load().await?;
        self.wait_for_results().await?;
        self.harvest_followups(url, queue).await?;

        if score {
            let value = self.session.evaluate("window.global_test_results").await?;
            Ok(SuiteResult::from_value(
                &value,
                started.elapsed().as_millis() as u64,
            ))
        } else {
            Ok(SuiteResult::default())
        }
    }
}

impl StandardLoader {
    async fn wait_for_window_load(&self) -> LoaderResult<()> {
        const SCRIPT: &str = "\
            var done = arguments[arguments.length - 1];\
            document.readyState === 'complete' ?\
                done() :\
                window.addEventListener('load', done);";
        self.session.execute_async(SCRIPT).await?;
        Ok(())
    }

    /// Polls for the page's published results object. The in-page wait calls
    /// back with an explicit timeout marker instead of hanging, bounded by a
    /// fraction of the run bound so the session-level timeout stays last.
    async fn wait_for_results(&self) -> LoaderResult<()> {
        let bound = (self.options.max_duration.as_millis() as u64 * 9) / 10;
        let script = format!(
            "var done = arguments[arguments.length - 1];\
             var check = function () {{\
                 window.global_test_results ?\
                     done(true) :\
                     setTimeout(check, {poll});\
             }};\
             check();\
             setTimeout(function () {{ done(false); }}, {bound});",
            poll = self.options.poll_interval.as_millis(),
        );
        let value = self.session.execute_async(&script).await?;
        if value.as_bool() == Some(false) {
            return Err(LoaderError::ResultsTimeout(bound));
        }
        Ok(())
    }

    /// Reads the page's published follow-up list and enqueues each entry,
    /// resolved against the page's own URL. Malformed entries are dropped,
    /// not fatal: the page controls that list, not the configuration.
    async fn harvest_followups(&self, base: &str, queue: &Enqueue) -> LoaderResult<()> {
        let value = self.session.evaluate("window.global_load_urls").await?;
        let Some(entries) = value.as_array() else {
            return Ok(());
        };
        let base = Url::parse(base).map_err(|source| QueueError::InvalidUrl {
            url: base.to_string(),
            source,
        })?;
        for entry in entries {
            let Some(candidate) = entry.as_str() else {
                continue;
            };
            match base.join(candidate) {
                Ok(resolved) => queue.add(resolved.as_str())?,
                Err(err) => {
                    warn!(url = %candidate, error = %err, "discarding malformed follow-up url");
                }
            }
        }
        Ok(())
    }
}
