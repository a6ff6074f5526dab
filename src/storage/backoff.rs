use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cli::config::RemoteSettings;
use crate::storage::StorageError;

/// Exponential backoff: the delay after failure `i` (from 0) is `base * multiplier^i`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    multiplier: u32,
}

impl Backoff {
    pub fn new(base: Duration, multiplier: u32) -> Self {
        Self { base, multiplier }
    }

    pub fn from_settings(settings: &RemoteSettings) -> Self {
        Self::new(settings.backoff_base(), settings.backoff_multiplier)
    }

    /// Delay to wait after `failures` earlier consecutive failures
    pub fn delay(&self, failures: u32) -> Duration {
        self.base.saturating_mul(self.multiplier.saturating_pow(failures))
    }

    /// Run `op` until it succeeds, sleeping with backoff between failures
    ///
    /// There is no retry limit. Only cancellation ends the loop early, in
    /// which case `StorageError::Cancelled` is returned.
    pub async fn retry_forever<T, E, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, StorageError>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut failures = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }

            let err = tokio::select! {
                result = op() => match result {
                    Ok(value) => return Ok(value),
                    Err(e) => e,
                },
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
            };

            let delay = self.delay(failures);
            warn!("{} failed, retrying in {:?}: {}", what, delay, err);
            failures = failures.saturating_add(1);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
            }
        }
    }
}
