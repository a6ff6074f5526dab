use std::sync::Arc;
use tokio::sync::watch;
use tracing::error;

/// Count of tasks inside the pipeline, including in-flight retries
///
/// Incremented when sanitize admits a task and whenever storage re-injects
/// one; decremented exactly once per attempt disposition.
#[derive(Debug, Clone)]
pub struct InFlight {
    count: Arc<watch::Sender<usize>>,
}

impl InFlight {
    /// Create a counter starting at zero
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
        }
    }

    /// Account for one more task in the pipeline
    pub fn add(&self) {
        self.count.send_modify(|count| *count += 1);
    }

    /// Close out one task slot
    pub fn done(&self) {
        self.count.send_modify(|count| {
            if *count == 0 {
                error!("In-flight counter decremented below zero");
            } else {
                *count -= 1;
            }
        });
    }

    /// Current number of tasks in flight
    pub fn current(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until no task is in flight
    pub async fn wait_zero(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives as long as self, so this cannot fail
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

impl Default for InFlight {
    fn default() -> Self {
        Self::new()
    }
}
