use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Receiving end of a handoff queue shared by every worker of a pool
pub type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

/// Wrap a receiver so several workers can pull from it
pub fn shared<T>(rx: mpsc::Receiver<T>) -> SharedReceiver<T> {
    Arc::new(Mutex::new(rx))
}

/// Take the next item from a shared queue, `None` once it is closed and empty
pub async fn next_item<T>(rx: &SharedReceiver<T>) -> Option<T> {
    rx.lock().await.recv().await
}

/// A fixed-size set of workers servicing one stage
pub struct WorkerPool {
    name: &'static str,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers, each built by `make_worker(index)`
    pub fn spawn<F, Fut>(name: &'static str, size: usize, mut make_worker: F) -> Self
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handles = (0..size)
            .map(|i| {
                debug!("Starting {} worker {}", name, i);
                tokio::spawn(make_worker(i))
            })
            .collect();

        Self { name, handles }
    }

    /// Completion barrier: wait until every worker has returned
    pub async fn join(self) {
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                error!("A {} worker terminated abnormally: {}", self.name, e);
            }
        }
        debug!("All {} workers finished", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_pool_drains_shared_queue() {
        let (tx, rx) = mpsc::channel::<usize>(4);
        let rx = shared(rx);
        let seen = Arc::new(AtomicUsize::new(0));

        let pool = WorkerPool::spawn("test", 3, |_| {
            let rx = rx.clone();
            let seen = seen.clone();
            async move {
                while let Some(n) = next_item(&rx).await {
                    seen.fetch_add(n, Ordering::SeqCst);
                }
            }
        });

        for n in 1..=10 {
            tx.send(n).await.unwrap();
        }
        drop(tx);

        pool.join().await;
        assert_eq!(seen.load(Ordering::SeqCst), 55);
    }
}
