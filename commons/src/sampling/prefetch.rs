//! Producer/consumer overlap: a background worker pulls batches from the
//! underlying loader and pushes them through a bounded channel so sampling
//! for batch `i + 1` runs while the consumer trains on batch `i`.

use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, SendTimeoutError, Sender};
use log::debug;

use crate::err::{GraphFlowError, Result};

// How long a blocked producer waits before re-checking the control lane.
const CTRL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Tagged result carried on the data lane.
enum Prefetched<T> {
    Item(T),
    Fault(GraphFlowError),
    Done,
}

/// Wraps a fallible iterator in a background worker with a bounded queue of
/// `num_prefetch` batches. Construction blocks until the worker has built
/// the inner iterator, so startup errors surface immediately instead of on
/// an arbitrarily later `next()`.
pub struct PrefetchLoader<T> {
    data_rx: Receiver<Prefetched<T>>,
    ctrl_tx: Sender<()>,
    worker: Option<JoinHandle<()>>,
    finished: bool,
}

impl<T: Send + 'static> PrefetchLoader<T> {
    pub fn new<F, I>(make_iter: F, num_prefetch: usize) -> Result<Self>
    where
        F: FnOnce() -> Result<I> + Send + 'static,
        I: Iterator<Item = Result<T>>,
    {
        if num_prefetch == 0 {
            return Err(GraphFlowError::config("num_prefetch must be at least 1"));
        }
        let (data_tx, data_rx) = bounded(num_prefetch);
        let (ctrl_tx, ctrl_rx) = bounded::<()>(1);
        let (start_tx, start_rx) = bounded::<Result<()>>(1);

        let worker = std::thread::spawn(move || {
            let iter = match make_iter() {
                Ok(iter) => {
                    let _ = start_tx.send(Ok(()));
                    iter
                }
                Err(e) => {
                    let _ = start_tx.send(Err(e));
                    return;
                }
            };
            for item in iter {
                let (msg, fault) = match item {
                    Ok(v) => (Prefetched::Item(v), false),
                    Err(e) => (Prefetched::Fault(e), true),
                };
                if !push(&data_tx, &ctrl_rx, msg) {
                    return;
                }
                if fault {
                    return;
                }
            }
            push(&data_tx, &ctrl_rx, Prefetched::Done);
            debug!("prefetch worker drained its loader");
        });

        // Startup handshake.
        match start_rx.recv() {
            Ok(Ok(())) => Ok(PrefetchLoader {
                data_rx,
                ctrl_tx,
                worker: Some(worker),
                finished: false,
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(GraphFlowError::internal("prefetch worker died during startup"))
            }
        }
    }
}

/// Blocking send that keeps an eye on the control lane; returns false when
/// the worker should exit.
fn push<T>(data_tx: &Sender<Prefetched<T>>, ctrl_rx: &Receiver<()>, msg: Prefetched<T>) -> bool {
    let mut pending = msg;
    loop {
        if ctrl_rx.try_recv().is_ok() {
            return false;
        }
        match data_tx.send_timeout(pending, CTRL_POLL_INTERVAL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => pending = back,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

impl<T> Iterator for PrefetchLoader<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.data_rx.recv() {
            Ok(Prefetched::Item(v)) => Some(Ok(v)),
            Ok(Prefetched::Fault(e)) => {
                // The worker captured the failure in its own thread; it is
                // re-raised here, in the consumer's thread, with the queue
                // still healthy.
                self.finished = true;
                Some(Err(e))
            }
            Ok(Prefetched::Done) | Err(_) => {
                self.finished = true;
                None
            }
        }
    }
}

impl<T> Drop for PrefetchLoader<T> {
    fn drop(&mut self) {
        let _ = self.ctrl_tx.try_send(());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumes_all_items_in_order() {
        let loader = PrefetchLoader::new(|| Ok((0..5).map(Ok)), 2).unwrap();
        let items: Vec<i32> = loader.map(|r| r.unwrap()).collect();
        assert_eq!(items, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn startup_error_surfaces_from_the_constructor() {
        let result = PrefetchLoader::<i32>::new(
            || -> Result<std::vec::IntoIter<Result<i32>>> {
                Err(GraphFlowError::config("broken loader"))
            },
            1,
        );
        assert!(matches!(result, Err(GraphFlowError::Config(_))));
    }

    #[test]
    fn zero_capacity_is_config_error() {
        let result = PrefetchLoader::new(|| Ok((0..3).map(Ok)), 0);
        assert!(matches!(result, Err(GraphFlowError::Config(_))));
    }

    #[test]
    fn mid_stream_fault_is_reraised_then_ends_iteration() {
        let mut loader = PrefetchLoader::new(
            || {
                Ok(vec![
                    Ok(1),
                    Err(GraphFlowError::internal("sampler exploded")),
                    Ok(2),
                ]
                .into_iter())
            },
            2,
        )
        .unwrap();
        assert_eq!(loader.next().unwrap().unwrap(), 1);
        assert!(matches!(loader.next(), Some(Err(GraphFlowError::Internal(_)))));
        assert!(loader.next().is_none());
    }

    #[test]
    fn dropping_early_stops_the_worker() {
        let loader = PrefetchLoader::new(|| Ok((0..1_000_000).map(Ok)), 1).unwrap();
        // Take a couple of items and walk away; Drop must join cleanly.
        let taken: Vec<i32> = loader.take(2).map(|r| r.unwrap()).collect();
        assert_eq!(taken, vec![0, 1]);
    }
}
