use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use gridload_core::{
    Shutdown, Tunnel, TunnelError, TunnelHandle, TunnelLauncher, TunnelManager, TunnelResult,
};

#[derive(Default)]
struct Counters {
    starts: AtomicUsize,
    stops: AtomicUsize,
}

struct CountingLauncher {
    counters: Arc<Counters>,
    stop_delay: Duration,
    start_delay: Duration,
}

struct CountingTunnel {
    identifier: String,
    counters: Arc<Counters>,
    stop_delay: Duration,
}

#[async_trait]
impl TunnelLauncher for CountingLauncher {
    async fn start(&self) -> TunnelResult<Box<dyn Tunnel>> {
        sleep(self.start_delay).await;
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingTunnel {
            identifier: "fresh-tunnel".to_string(),
            counters: Arc::clone(&self.counters),
            stop_delay: self.stop_delay,
        }))
    }
}

#[async_trait]
impl Tunnel for CountingTunnel {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn stop(&mut self) -> TunnelResult<()> {
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
        sleep(self.stop_delay).await;
        Ok(())
    }
}

fn launcher(counters: &Arc<Counters>) -> Arc<CountingLauncher> {
    Arc::new(CountingLauncher {
        counters: Arc::clone(counters),
        stop_delay: Duration::ZERO,
        start_delay: Duration::ZERO,
    })
}

#[tokio::test]
async fn teardown_runs_once_even_when_interrupt_races_completion() {
    let counters = Arc::new(Counters::default());
    let shutdown = Shutdown::new();
    let manager = TunnelManager::new(launcher(&counters), None, 90_000);

    let outcome: Result<&str, TunnelError> = manager
        .run(&shutdown, |tunnel| async move {
            assert_eq!(tunnel.identifier(), "fresh-tunnel");
            Ok("done")
        })
        .await;
    assert_eq!(outcome.unwrap(), "done");

    // The interrupt hook fires after normal completion already closed the
    // tunnel; the cached stop state absorbs the second request.
    shutdown.trigger().await;
    assert_eq!(counters.starts.load(Ordering::SeqCst), 1);
    assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn teardown_still_runs_when_the_work_fails() {
    let counters = Arc::new(Counters::default());
    let shutdown = Shutdown::new();
    let manager = TunnelManager::new(launcher(&counters), None, 90_000);

    let outcome: Result<(), TunnelError> = manager
        .run(&shutdown, |_tunnel| async move {
            Err(TunnelError::Start("work blew up".to_string()))
        })
        .await;
    assert!(matches!(outcome, Err(TunnelError::Start(_))));
    assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reused_identifier_never_starts_or_stops_a_tunnel() {
    let counters = Arc::new(Counters::default());
    let shutdown = Shutdown::new();
    let manager = TunnelManager::new(launcher(&counters), Some("job-42".to_string()), 90_000);

    let outcome: Result<String, TunnelError> = manager
        .run(&shutdown, |tunnel| async move {
            Ok(tunnel.identifier().to_string())
        })
        .await;
    assert_eq!(outcome.unwrap(), "job-42");

    shutdown.trigger().await;
    assert_eq!(counters.starts.load(Ordering::SeqCst), 0);
    assert_eq!(counters.stops.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_aborts_the_run() {
    let counters = Arc::new(Counters::default());
    let shutdown = Shutdown::new();
    let slow = Arc::new(CountingLauncher {
        counters: Arc::clone(&counters),
        stop_delay: Duration::ZERO,
        start_delay: Duration::from_secs(3600),
    });
    let manager = TunnelManager::new(slow, None, 150);

    let outcome: Result<(), TunnelError> = manager
        .run(&shutdown, |_tunnel| async move { Ok(()) })
        .await;
    assert!(matches!(outcome, Err(TunnelError::ConnectTimeout(150))));
}

#[tokio::test(start_paused = true)]
async fn close_timeout_reports_but_still_counts_as_closed() {
    let counters = Arc::new(Counters::default());
    let shutdown = Shutdown::new();
    let sticky = Arc::new(CountingLauncher {
        counters: Arc::clone(&counters),
        stop_delay: Duration::from_secs(3600),
        start_delay: Duration::ZERO,
    });
    let manager = TunnelManager::new(sticky, None, 200);

    let captured: Arc<Mutex<Option<TunnelHandle>>> = Arc::new(Mutex::new(None));
    let stash = Arc::clone(&captured);
    let outcome: Result<(), TunnelError> = manager
        .run(&shutdown, move |tunnel| {
            *stash.lock().unwrap() = Some(tunnel);
            async move { Ok(()) }
        })
        .await;
    assert!(matches!(outcome, Err(TunnelError::CloseTimeout(200))));

    // Bookkeeping treats the tunnel as closed: a second stop is a no-op.
    let handle = captured.lock().unwrap().take().unwrap();
    handle.stop().await.unwrap();
    assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
}
