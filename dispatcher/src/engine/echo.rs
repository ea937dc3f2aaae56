//! Local stand-in engine that echoes the prompt reversed.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::Instant;

use super::{InferenceEngine, InferenceError};

/// Echo engine.
///
/// Sleeps for `latency` plus a random amount up to `jitter`, then returns the
/// payload reversed. Useful for exercising the dispatcher without a model.
pub struct EchoEngine {
    latency: Duration,
    jitter: Duration,
}

impl EchoEngine {
    pub fn new(latency: Duration) -> Self {
        Self::with_jitter(latency, Duration::ZERO)
    }

    pub fn with_jitter(latency: Duration, jitter: Duration) -> Self {
        Self { latency, jitter }
    }

    fn sample_latency(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.latency;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        self.latency + Duration::from_millis(extra)
    }
}

#[async_trait]
impl InferenceEngine for EchoEngine {
    fn engine_type(&self) -> &'static str {
        "echo"
    }

    fn supports_interrupt(&self) -> bool {
        true
    }

    async fn infer(&self, payload: &str, deadline: Option<Instant>) -> Result<String, InferenceError> {
        let finish_at = Instant::now() + self.sample_latency();

        if let Some(deadline) = deadline {
            if deadline < finish_at {
                tokio::time::sleep_until(deadline).await;
                return Err(InferenceError::Timeout);
            }
        }

        tokio::time::sleep_until(finish_at).await;
        Ok(format!("Model response: {}", payload.chars().rev().collect::<String>()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_echo_reverses_payload() {
        let engine = EchoEngine::new(Duration::from_millis(100));
        let started = Instant::now();

        let output = engine.infer("abc", None).await.unwrap();

        assert_eq!(output, "Model response: cba");
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_reports_timeout_at_deadline() {
        let engine = EchoEngine::new(Duration::from_secs(1));
        let deadline = Instant::now() + Duration::from_millis(200);

        let result = engine.infer("abc", Some(deadline)).await;

        assert_eq!(result, Err(InferenceError::Timeout));
        assert!(Instant::now() >= deadline);
        assert!(Instant::now() < deadline + Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_jitter_bounds() {
        let engine = EchoEngine::with_jitter(Duration::from_millis(10), Duration::from_millis(40));

        for _ in 0..5 {
            let started = Instant::now();
            engine.infer("x", None).await.unwrap();
            let elapsed = started.elapsed();
            assert!(elapsed >= Duration::from_millis(10));
            assert!(elapsed <= Duration::from_millis(51));
        }
    }
}
