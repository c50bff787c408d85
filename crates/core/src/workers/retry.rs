//! Bounded retries and dependency resolution.

use crate::workers::base::WorkerError;
use async_trait::async_trait;
use fg_protocol::config_models::RetryConfig;
use std::future::Future;
use std::time::Duration;

/// Retry policy for transient worker errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: Duration::from_millis(config.delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails permanently or attempts run out.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient error, or `Execution` wrapping the
    /// last transient error once attempts are exhausted.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, WorkerError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, WorkerError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= attempts => {
                    return Err(WorkerError::Execution(format!(
                        "giving up after {attempts} attempt(s): {e}"
                    )));
                }
                Err(e) => {
                    tracing::warn!(attempt, max_attempts = attempts, "Retrying after error: {e}");
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Resolves a process dependency before execution.
#[async_trait]
pub trait DependencyResolver: Send + Sync {
    /// Resolve one dependency. Transient failures are retried by the caller.
    async fn resolve(&self, dependency: &str) -> Result<(), WorkerError>;
}

/// Accepts any dependency with a supported URL scheme.
///
/// Fetching is done by the worker itself.
pub struct SchemeResolver {
    schemes: Vec<String>,
}

impl Default for SchemeResolver {
    fn default() -> Self {
        Self {
            schemes: ["https", "http", "mvn", "file"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[async_trait]
impl DependencyResolver for SchemeResolver {
    async fn resolve(&self, dependency: &str) -> Result<(), WorkerError> {
        let scheme = dependency.split_once("://").map(|(scheme, _)| scheme);
        match scheme {
            Some(s) if self.schemes.iter().any(|known| known == s) => Ok(()),
            _ => Err(WorkerError::Execution(format!(
                "unsupported dependency '{dependency}'"
            ))),
        }
    }
}

/// Resolve every dependency with a per-dependency timeout and retries.
///
/// # Errors
///
/// Returns the error of the first dependency that could not be resolved.
pub async fn resolve_all(
    resolver: &dyn DependencyResolver,
    dependencies: &[String],
    timeout: Duration,
    retry: &RetryPolicy,
) -> Result<(), WorkerError> {
    for dependency in dependencies {
        retry
            .run(|_| async {
                match tokio::time::timeout(timeout, resolver.resolve(dependency)).await {
                    Ok(result) => result,
                    Err(_) => Err(WorkerError::Timeout(format!(
                        "dependency '{dependency}' not resolved within {}s",
                        timeout.as_secs()
                    ))),
                }
            })
            .await?;
    }
    Ok(())
}
