use std::fmt::Display;
use std::time::Duration;

use tokio::time::sleep;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{AgentError, Result};

/// Install the global `tracing` subscriber described by `cfg`.
///
/// `RUST_LOG` takes precedence over `cfg.filter`. Calling this more than once
/// is harmless: later calls leave the first subscriber in place.
pub fn init_tracing(cfg: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cfg.filter)
            .map_err(|err| AgentError::Config(format!("invalid log filter `{}`: {err}", cfg.filter)))?,
    };

    let installed = match cfg.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_external_call()
    }
}

impl RetryPolicy {
    pub fn default_external_call() -> Self {
        Self {
            max_retries: 2,
            backoff: Duration::from_millis(250),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Run `f` until it succeeds, `is_retryable` rejects the error, or the
    /// retry budget is spent. Backoff grows linearly with the attempt number.
    pub async fn retry<F, Fut, T, E>(
        &self,
        label: &str,
        mut f: F,
        is_retryable: impl Fn(&E) -> bool,
    ) -> std::result::Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_retries && is_retryable(&err) => {
                    tracing::warn!(%label, attempt, error = %err, "retrying external call");
                    attempt += 1;
                    sleep(self.backoff * attempt).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn retries_until_success() {
        let policy = RetryPolicy {
            max_retries: 2,
            backoff: Duration::from_millis(1),
        };
        let calls = Arc::new(Mutex::new(0u32));

        let res = policy
            .retry(
                "flaky",
                |_: u32| {
                    let calls = calls.clone();
                    async move {
                        let mut guard = calls.lock().await;
                        *guard += 1;
                        if *guard < 2 {
                            Err(AgentError::Protocol("fail".into()))
                        } else {
                            Ok(42)
                        }
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(res.unwrap(), 42);
        assert_eq!(*calls.lock().await, 2);
    }

    #[tokio::test]
    async fn stops_on_non_retryable_error() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff: Duration::from_millis(1),
        };
        let calls = Arc::new(Mutex::new(0u32));

        let res: std::result::Result<(), AgentError> = policy
            .retry(
                "fatal",
                |_: u32| {
                    let calls = calls.clone();
                    async move {
                        *calls.lock().await += 1;
                        Err(AgentError::Config("bad key".into()))
                    }
                },
                |err| !matches!(err, AgentError::Config(_)),
            )
            .await;

        assert!(res.is_err());
        assert_eq!(*calls.lock().await, 1);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let policy = RetryPolicy {
            max_retries: 1,
            backoff: Duration::from_millis(1),
        };
        let calls = Arc::new(Mutex::new(0u32));

        let res: std::result::Result<(), AgentError> = policy
            .retry(
                "down",
                |_: u32| {
                    let calls = calls.clone();
                    async move {
                        *calls.lock().await += 1;
                        Err(AgentError::LanguageModel("503".into()))
                    }
                },
                |_| true,
            )
            .await;

        assert!(res.is_err());
        assert_eq!(*calls.lock().await, 2);
    }
}
