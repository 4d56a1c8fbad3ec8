use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue already completed; cannot add: {0}")]
    AlreadyCompleted(String),
    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Canonical dedup identity for a URL. Parsing folds scheme and host case
/// and drops default ports; fragments survive, so two URLs differing only in
/// fragment stay distinct.
pub fn canonicalize(url: &str) -> QueueResult<String> {
    Url::parse(url)
        .map(|parsed| parsed.to_string())
        .map_err(|source| QueueError::InvalidUrl {
            url: url.to_string(),
            source,
        })
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<String>,
    seen: HashSet<String>,
    completed: bool,
}

/// Handle passed to every drain step so newly discovered URLs can join the
/// same queue before it decides it is done.
#[derive(Clone)]
pub struct Enqueue {
    state: Arc<Mutex<QueueState>>,
}

impl Enqueue {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    /// Appends a URL unless its canonical form was already seen. Adding to a
    /// completed queue is a programming error, not a recoverable condition.
    pub fn add(&self, url: &str) -> QueueResult<()> {
        let canonical = canonicalize(url)?;
        let mut state = self.state.lock().unwrap();
        if state.completed {
            return Err(QueueError::AlreadyCompleted(canonical));
        }
        if state.seen.insert(canonical.clone()) {
            state.pending.push_back(canonical);
        }
        Ok(())
    }

    pub fn add_all<'a, I>(&self, urls: I) -> QueueResult<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for url in urls {
            self.add(url)?;
        }
        Ok(())
    }

    fn pop(&self) -> Option<String> {
        self.state.lock().unwrap().pending.pop_front()
    }

    fn complete(&self) {
        self.state.lock().unwrap().completed = true;
    }
}

/// One visited URL and what the step produced for it.
#[derive(Debug)]
pub struct Visited<R> {
    pub url: String,
    pub outcome: R,
}

/// Drains the queue strictly FIFO, one item at a time. Completion is
/// re-checked after every step rather than computed up front, because the
/// step may have enqueued more work through its `Enqueue` handle.
pub async fn drain<R, E, F, Fut>(initial: &[String], mut step: F) -> Result<Vec<Visited<R>>, E>
where
    E: From<QueueError>,
    F: FnMut(String, Enqueue) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let enqueue = Enqueue::new();
    enqueue.add_all(initial.iter().map(String::as_str))?;

    let mut visited = Vec::new();
    while let Some(url) = enqueue.pop() {
        match step(url.clone(), enqueue.clone()).await {
            Ok(outcome) => visited.push(Visited { url, outcome }),
            Err(err) => {
                enqueue.complete();
                return Err(err);
            }
        }
    }
    enqueue.complete();
    Ok(visited)
}
