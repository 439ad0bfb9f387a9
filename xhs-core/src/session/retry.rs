use std::time::Duration;

use futures::future::LocalBoxFuture;
use rand::Rng;
use tokio::time::{sleep, Instant};

use crate::session::error::{SessionError, SessionResult};

/// Bounded poll-with-backoff. Every wait in the session flows goes through
/// one of these instead of ad hoc sleeps, so timing is configurable and
/// testable under a paused clock.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    timeout: Duration,
    initial_interval: Duration,
    max_interval: Duration,
    backoff: f64,
    jitter_ms: u64,
}

impl PollPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            initial_interval: interval,
            max_interval: interval,
            backoff: 1.0,
            jitter_ms: 0,
        }
    }

    pub fn with_backoff(mut self, factor: f64, max_interval: Duration) -> Self {
        self.backoff = factor.max(1.0);
        self.max_interval = max_interval.max(self.initial_interval);
        self
    }

    pub fn with_jitter(mut self, jitter_ms: u64) -> Self {
        self.jitter_ms = jitter_ms;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Re-run `probe` until it yields a value or the deadline passes. The
    /// probe always runs at least once; `Ok(None)` means "not yet", any
    /// `Err` aborts immediately.
    pub async fn run<C, T, P>(&self, what: &str, ctx: &mut C, mut probe: P) -> SessionResult<T>
    where
        C: ?Sized,
        P: for<'a> FnMut(&'a mut C) -> LocalBoxFuture<'a, SessionResult<Option<T>>>,
    {
        let started = Instant::now();
        let mut interval = self.initial_interval;
        loop {
            if let Some(value) = probe(&mut *ctx).await? {
                return Ok(value);
            }
            let elapsed = started.elapsed();
            if elapsed >= self.timeout {
                return Err(SessionError::Timeout(what.to_string()));
            }
            let remaining = self.timeout - elapsed;
            let mut delay = interval;
            if self.jitter_ms > 0 {
                delay += Duration::from_millis(rand::thread_rng().gen_range(0..=self.jitter_ms));
            }
            sleep(delay.min(remaining)).await;
            if self.backoff > 1.0 {
                interval = interval.mul_f64(self.backoff).min(self.max_interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test(start_paused = true)]
    async fn resolves_once_probe_yields() {
        let policy = PollPolicy::new(Duration::from_secs(10), Duration::from_millis(100));
        let mut calls = 0usize;
        let value = policy
            .run("marker", &mut calls, |calls| {
                Box::pin(async move {
                    *calls += 1;
                    if *calls == 3 {
                        Ok(Some(*calls))
                    } else {
                        Ok(None)
                    }
                })
            })
            .await
            .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_with_label() {
        let policy = PollPolicy::new(Duration::from_secs(2), Duration::from_millis(250));
        let mut unit = ();
        let err = policy
            .run::<_, (), _>("upload completion", &mut unit, |_| {
                Box::pin(async { Ok(None) })
            })
            .await
            .unwrap_err();
        match err {
            SessionError::Timeout(what) => assert_eq!(what, "upload completion"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_spreads_attempts() {
        let policy = PollPolicy::new(Duration::from_secs(60), Duration::from_millis(100))
            .with_backoff(2.0, Duration::from_millis(400));
        let stamps: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = Arc::clone(&stamps);
        let _ = policy
            .run("growth", &mut ctx, |stamps| {
                let stamps = Arc::clone(stamps);
                Box::pin(async move {
                    let mut guard = stamps.lock().unwrap();
                    guard.push(Instant::now());
                    if guard.len() == 5 {
                        Ok(Some(()))
                    } else {
                        Ok(None)
                    }
                })
            })
            .await
            .unwrap();
        let stamps = stamps.lock().unwrap();
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps[0], Duration::from_millis(100));
        assert_eq!(gaps[1], Duration::from_millis(200));
        assert_eq!(gaps[2], Duration::from_millis(400));
        // Capped at max_interval from here on.
        assert_eq!(gaps[3], Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_errors_abort_immediately() {
        let policy = PollPolicy::new(Duration::from_secs(5), Duration::from_millis(100));
        let mut unit = ();
        let err = policy
            .run::<_, (), _>("probe", &mut unit, |_| {
                Box::pin(async { Err(SessionError::Detection("gone".into())) })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Detection(_)));
    }
}
