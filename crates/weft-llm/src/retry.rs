use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{info, warn};

use weft_core::config::RetryConfig;
use weft_core::error::{Result, WeftError};
use weft_core::traits::GenerationService;

/// A generation service that retries failed requests and falls back to alternative services.
pub struct RetryingService {
    primary: Arc<dyn GenerationService>,
    fallbacks: Vec<(String, Arc<dyn GenerationService>)>,
    retry_config: RetryConfig,
}

impl RetryingService {
    pub fn new(
        primary: Arc<dyn GenerationService>,
        fallbacks: Vec<(String, Arc<dyn GenerationService>)>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            primary,
            fallbacks,
            retry_config,
        }
    }
}

fn is_retryable(e: &WeftError) -> bool {
    match e {
        WeftError::GenerationRequest(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        WeftError::GenerationStream(_) => true,
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl RetryingService {
    /// Run `call` against the primary with retries, then each fallback once.
    /// Gives up as soon as `can_restart` returns false after a failure.
    async fn with_retries<F, R>(&self, call: F, can_restart: R) -> Result<String>
    where
        F: Fn(Arc<dyn GenerationService>) -> BoxFuture<'static, Result<String>>,
        R: Fn() -> bool,
    {
        let max_retries = self.retry_config.max_retries;

        let mut last_err = None;
        for attempt in 0..=max_retries {
            match call(self.primary.clone()).await {
                Ok(text) => return Ok(text),
                Err(e) if !can_restart() => {
                    warn!(error = %e, "Generation failed after partial output, not retrying");
                    return Err(e);
                }
                Err(e) => {
                    if is_retryable(&e) && attempt < max_retries {
                        let backoff = calculate_backoff(attempt, &self.retry_config);
                        warn!(
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying generation request"
                        );
                        tokio::time::sleep(backoff).await;
                        last_err = Some(e);
                        continue;
                    }
                    last_err = Some(e);
                    break;
                }
            }
        }

        // Primary exhausted — try fallbacks
        if !self.fallbacks.is_empty() {
            info!("Primary generation service exhausted, trying fallbacks");
        }
        for (name, fallback) in &self.fallbacks {
            match call(fallback.clone()).await {
                Ok(text) => {
                    info!(model = %name, "Fell back to alternative model");
                    return Ok(text);
                }
                Err(e) => {
                    warn!(model = %name, error = %e, "Fallback model also failed");
                    if !can_restart() {
                        return Err(e);
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| WeftError::GenerationRequest("All providers failed".into())))
    }
}

impl GenerationService for RetryingService {
    fn generate(&self, system_prompt: &str, input: &str) -> BoxFuture<'_, Result<String>> {
        let system_prompt = system_prompt.to_string();
        let input = input.to_string();

        Box::pin(async move {
            self.with_retries(
                |service| -> BoxFuture<'static, Result<String>> {
                    let system_prompt = system_prompt.clone();
                    let input = input.clone();
                    Box::pin(async move { service.generate(&system_prompt, &input).await })
                },
                || true,
            )
            .await
        })
    }

    fn generate_streaming(
        &self,
        system_prompt: &str,
        input: &str,
        chunks: mpsc::UnboundedSender<String>,
    ) -> BoxFuture<'_, Result<String>> {
        let system_prompt = system_prompt.to_string();
        let input = input.to_string();

        // Chunks already forwarded cannot be taken back, so an attempt that
        // emitted any is final.
        let emitted = Arc::new(AtomicBool::new(false));

        Box::pin(async move {
            self.with_retries(
                |service| -> BoxFuture<'static, Result<String>> {
                    let system_prompt = system_prompt.clone();
                    let input = input.clone();
                    let chunks = chunks.clone();
                    let emitted = emitted.clone();
                    Box::pin(async move {
                        let (tx, mut rx) = mpsc::unbounded_channel();
                        let forward = async {
                            while let Some(chunk) = rx.recv().await {
                                emitted.store(true, Ordering::Relaxed);
                                let _ = chunks.send(chunk);
                            }
                        };
                        let (result, ()) = tokio::join!(
                            service.generate_streaming(&system_prompt, &input, tx),
                            forward
                        );
                        result
                    })
                },
                || !emitted.load(Ordering::Relaxed),
            )
            .await
        })
    }
}
