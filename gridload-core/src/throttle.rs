use std::future::Future;

use futures::stream::{FuturesUnordered, StreamExt};

/// Runs factory-produced units of work with at most `concurrent` active at
/// once. Each finished slot asks the factory for the next unit; a slot
/// handed `None` deactivates permanently. Output order follows the order
/// units were started, erasing completion-order nondeterminism.
///
/// On the first error no further units are launched, but in-flight units run
/// to completion before the error is returned; later errors are discarded.
pub async fn run<T, E, F, Fut>(concurrent: usize, mut factory: F) -> Result<Vec<T>, E>
where
    F: FnMut() -> Option<Fut>,
    Fut: Future<Output = Result<T, E>>,
{
    let mut slots = FuturesUnordered::new();
    let mut output: Vec<Option<T>> = Vec::new();
    let mut first_error: Option<E> = None;

    for _ in 0..concurrent.max(1) {
        let Some(unit) = factory() else { continue };
        let index = output.len();
        output.push(None);
        slots.push(tag(index, unit));
    }

    while let Some((index, outcome)) = slots.next().await {
        match outcome {
            Ok(value) => {
                output[index] = Some(value);
                if first_error.is_none() {
                    if let Some(unit) = factory() {
                        let next_index = output.len();
                        output.push(None);
                        slots.push(tag(next_index, unit));
                    }
                }
            }
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(output.into_iter().flatten().collect()),
    }
}

async fn tag<T, Fut>(index: usize, unit: Fut) -> (usize, T)
where
    Fut: Future<Output = T>,
{
    (index, unit.await)
}

/// Convenience form: hands out `items` in order, one per factory call, until
/// the sequence is exhausted.
pub async fn map<T, R, E, F, Fut>(concurrent: usize, items: Vec<T>, mut step: F) -> Result<Vec<R>, E>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let mut items = items.into_iter();
    run(concurrent, || items.next().map(&mut step)).await
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::time::sleep;

    use super::*;

    #[derive(Default)]
    struct Gauge {
        active: usize,
        peak: usize,
    }

    #[derive(Clone, Default)]
    struct Tracker {
        gauge: Arc<Mutex<Gauge>>,
    }

    impl Tracker {
        fn enter(&self) {
            let mut gauge = self.gauge.lock().unwrap();
            gauge.active += 1;
            gauge.peak = gauge.peak.max(gauge.active);
        }

        fn exit(&self) {
            self.gauge.lock().unwrap().active -= 1;
        }

        fn peak(&self) -> usize {
            self.gauge.lock().unwrap().peak
        }
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_the_concurrency_bound() {
        let tracker = Tracker::default();
        let inner = tracker.clone();
        let items: Vec<u64> = (0..7).collect();
        let out: Vec<u64> = map(2, items, |n| {
            let tracker = inner.clone();
            async move {
                tracker.enter();
                sleep(Duration::from_millis(10 + n)).await;
                tracker.exit();
                Ok::<_, String>(n)
            }
        })
        .await
        .unwrap();
        assert_eq!(out.len(), 7);
        assert!(tracker.peak() <= 2, "peak was {}", tracker.peak());
    }

    #[tokio::test]
    async fn empty_work_list_completes_immediately() {
        let out: Vec<u32> = map(4, Vec::<u32>::new(), |n| async move { Ok::<_, String>(n) })
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn fewer_items_than_slots() {
        let out = map(5, vec![1, 2], |n| async move { Ok::<_, String>(n * 10) })
            .await
            .unwrap();
        assert_eq!(out, vec![10, 20]);
    }

    #[tokio::test(start_paused = true)]
    async fn output_uses_start_order_not_completion_order() {
        // The first item sleeps longest, so it completes last.
        let delays = vec![30u64, 20, 10];
        let out = map(3, delays.clone(), |delay| async move {
            sleep(Duration::from_millis(delay)).await;
            Ok::<_, String>(delay)
        })
        .await
        .unwrap();
        assert_eq!(out, delays);
    }

    #[tokio::test(start_paused = true)]
    async fn first_error_wins_after_in_flight_units_settle() {
        let finished = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&finished);
        let result: Result<Vec<u64>, String> = map(2, vec![0u64, 1, 2, 3], |n| {
            let log = Arc::clone(&log);
            async move {
                if n == 0 {
                    sleep(Duration::from_millis(5)).await;
                    return Err(format!("unit {n} failed"));
                }
                sleep(Duration::from_millis(50)).await;
                log.lock().unwrap().push(n);
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap_err(), "unit 0 failed");
        // Unit 1 was already in flight when unit 0 failed; it ran to
        // completion. Units 2 and 3 were never launched.
        assert_eq!(*finished.lock().unwrap(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn later_errors_are_discarded() {
        let result: Result<Vec<u64>, String> = map(2, vec![0u64, 1], |n| async move {
            sleep(Duration::from_millis(5 + n)).await;
            Err(format!("unit {n} failed"))
        })
        .await;
        assert_eq!(result.unwrap_err(), "unit 0 failed");
    }
}
