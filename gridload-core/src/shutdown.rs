use std::sync::Mutex;

use futures::future::BoxFuture;

type Hook = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Registry of teardown hooks to fire on a process interrupt. Components
/// never reach for global process state themselves: the orchestrator owns
/// this registry and the binary wires the interrupt signal to `trigger`
/// exactly once at top level.
#[derive(Default)]
pub struct Shutdown {
    hooks: Mutex<Vec<Hook>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_interrupt<F>(&self, hook: F)
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.hooks.lock().unwrap().push(Box::new(hook));
    }

    /// Fires every registered hook once. Racing with normal completion is
    /// harmless as long as hooks are idempotent, which tunnel teardown is.
    pub async fn trigger(&self) {
        let hooks = std::mem::take(&mut *self.hooks.lock().unwrap());
        for hook in hooks {
            hook().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn hooks_fire_once_even_when_triggered_twice() {
        let shutdown = Shutdown::new();
        let count = Arc::new(AtomicUsize::new(0));
        let hook_count = Arc::clone(&count);
        shutdown.on_interrupt(move || {
            let count = Arc::clone(&hook_count);
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
            })
        });

        shutdown.trigger().await;
        shutdown.trigger().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
