use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::WorkerConfig;
use crate::session::diagnostics::Diagnostics;
use crate::session::engine::SessionEngine;
use crate::session::error::{SessionError, SessionResult};
use crate::session::metrics::SessionMetrics;

struct PoolEntry {
    engine: Arc<SessionEngine>,
    idle_since: Instant,
}

#[derive(Default)]
struct PoolInner {
    available: Vec<PoolEntry>,
    checked_out: HashMap<String, Arc<SessionEngine>>,
}

/// Counts for health reporting and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolSnapshot {
    pub available: usize,
    pub checked_out: usize,
    pub capacity: usize,
}

enum AcquirePlan {
    Existing(Arc<SessionEngine>),
    Warm(Arc<SessionEngine>),
    Fresh(Arc<SessionEngine>),
    Rebind(Arc<SessionEngine>),
}

/// Bounded set of per-user session engines. A user checks an engine out for
/// the duration of an operation; released engines stay warm until the idle
/// sweeper or a rebind reclaims them.
pub struct SessionPool {
    config: Arc<WorkerConfig>,
    diagnostics: Arc<Diagnostics>,
    metrics: Arc<StdMutex<SessionMetrics>>,
    inner: StdMutex<PoolInner>,
}

impl SessionPool {
    pub fn new(
        config: Arc<WorkerConfig>,
        diagnostics: Arc<Diagnostics>,
        metrics: Arc<StdMutex<SessionMetrics>>,
    ) -> Self {
        Self {
            config,
            diagnostics,
            metrics,
            inner: StdMutex::new(PoolInner::default()),
        }
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let inner = self.inner.lock().unwrap();
        PoolSnapshot {
            available: inner.available.len(),
            checked_out: inner.checked_out.len(),
            capacity: self.config.pool.max_size,
        }
    }

    fn with_metrics<F: FnOnce(&mut SessionMetrics)>(&self, f: F) {
        let mut guard = self.metrics.lock().unwrap();
        f(&mut guard);
    }

    /// Check out the engine for `user_id`, reusing a warm one when possible.
    /// At capacity the least recently used idle engine is rebound; when every
    /// engine is busy the call fails with [`SessionError::PoolExhausted`].
    pub async fn acquire(&self, user_id: &str) -> SessionResult<Arc<SessionEngine>> {
        let plan = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(engine) = inner.checked_out.get(user_id) {
                AcquirePlan::Existing(Arc::clone(engine))
            } else if let Some(pos) = inner
                .available
                .iter()
                .position(|entry| entry.engine.user_id() == user_id)
            {
                let entry = inner.available.remove(pos);
                inner
                    .checked_out
                    .insert(user_id.to_string(), Arc::clone(&entry.engine));
                AcquirePlan::Warm(entry.engine)
            } else if inner.available.len() + inner.checked_out.len()
                < self.config.pool.max_size
            {
                let engine = Arc::new(SessionEngine::new(
                    user_id,
                    Arc::clone(&self.config),
                    Arc::clone(&self.diagnostics),
                    Arc::clone(&self.metrics),
                )?);
                inner
                    .checked_out
                    .insert(user_id.to_string(), Arc::clone(&engine));
                AcquirePlan::Fresh(engine)
            } else if !inner.available.is_empty() {
                // All seats taken but some are idle: recycle the LRU one.
                let pos = inner
                    .available
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, entry)| entry.idle_since)
                    .map(|(pos, _)| pos)
                    .unwrap_or(0);
                let entry = inner.available.remove(pos);
                inner
                    .checked_out
                    .insert(user_id.to_string(), Arc::clone(&entry.engine));
                AcquirePlan::Rebind(entry.engine)
            } else {
                self.with_metrics(|m| m.record_pool_exhaustion());
                return Err(SessionError::PoolExhausted {
                    in_use: inner.checked_out.len(),
                    capacity: self.config.pool.max_size,
                });
            }
        };

        match plan {
            AcquirePlan::Existing(engine) => Ok(engine),
            AcquirePlan::Warm(engine) => {
                debug!(user = user_id, "reusing warm session");
                self.with_metrics(|m| m.record_session_start(true));
                engine.touch_profile().await;
                Ok(engine)
            }
            AcquirePlan::Fresh(engine) => {
                self.with_metrics(|m| m.record_session_start(false));
                engine.touch_profile().await;
                Ok(engine)
            }
            AcquirePlan::Rebind(engine) => match engine.rebind(user_id).await {
                Ok(()) => {
                    self.with_metrics(|m| m.record_session_start(false));
                    engine.touch_profile().await;
                    Ok(engine)
                }
                Err(err) => {
                    let mut inner = self.inner.lock().unwrap();
                    inner.checked_out.remove(user_id);
                    drop(inner);
                    engine.close().await;
                    Err(err)
                }
            },
        }
    }

    /// Look up the engine for `user_id` without changing checkout state.
    pub fn find(&self, user_id: &str) -> Option<Arc<SessionEngine>> {
        let inner = self.inner.lock().unwrap();
        if let Some(engine) = inner.checked_out.get(user_id) {
            return Some(Arc::clone(engine));
        }
        inner
            .available
            .iter()
            .find(|entry| entry.engine.user_id() == user_id)
            .map(|entry| Arc::clone(&entry.engine))
    }

    /// Remove the engine for `user_id` from the pool without closing it.
    /// The caller owns the shutdown from here.
    pub fn take(&self, user_id: &str) -> Option<Arc<SessionEngine>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(engine) = inner.checked_out.remove(user_id) {
            return Some(engine);
        }
        let pos = inner
            .available
            .iter()
            .position(|entry| entry.engine.user_id() == user_id)?;
        Some(inner.available.remove(pos).engine)
    }

    /// Return a checked-out engine. `keep_alive` parks it warm for reuse;
    /// otherwise the browser is shut down and the seat freed. Releasing a
    /// user with nothing checked out is a no-op.
    pub async fn release(&self, user_id: &str, keep_alive: bool) {
        let engine = {
            let mut inner = self.inner.lock().unwrap();
            let Some(engine) = inner.checked_out.remove(user_id) else {
                debug!(user = user_id, "release without checkout");
                return;
            };
            if keep_alive {
                inner.available.push(PoolEntry {
                    engine,
                    idle_since: Instant::now(),
                });
                return;
            }
            engine
        };
        engine.close().await;
    }

    /// Close every available engine idle longer than the configured timeout.
    pub async fn evict_idle(&self) -> usize {
        let ttl = self.config.pool.idle_timeout();
        let expired: Vec<PoolEntry> = {
            let mut inner = self.inner.lock().unwrap();
            let mut kept = Vec::with_capacity(inner.available.len());
            let mut expired = Vec::new();
            for entry in inner.available.drain(..) {
                if entry.idle_since.elapsed() >= ttl {
                    expired.push(entry);
                } else {
                    kept.push(entry);
                }
            }
            inner.available = kept;
            expired
        };
        let count = expired.len();
        for entry in expired {
            info!(user = %entry.engine.user_id(), "evicting idle session");
            entry.engine.close().await;
        }
        count
    }

    /// Shut down everything, checked out or not.
    pub async fn close_all(&self) {
        let engines: Vec<Arc<SessionEngine>> = {
            let mut inner = self.inner.lock().unwrap();
            let mut engines: Vec<Arc<SessionEngine>> = inner
                .available
                .drain(..)
                .map(|entry| entry.engine)
                .collect();
            engines.extend(inner.checked_out.drain().map(|(_, engine)| engine));
            engines
        };
        for engine in engines {
            engine.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_worker_config;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    fn pool_for(root: &Path) -> SessionPool {
        let fixture = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/worker.toml");
        let mut config = load_worker_config(fixture).expect("fixture should parse");
        config.paths.data_dir = root.to_string_lossy().into_owned();
        let config = Arc::new(config);
        let diagnostics = Arc::new(
            Diagnostics::new(
                config.failure_log_path(),
                config.runs_db_path(),
                config.screenshots_root(),
            )
            .expect("diagnostics init"),
        );
        SessionPool::new(
            config,
            diagnostics,
            Arc::new(StdMutex::new(SessionMetrics::default())),
        )
    }

    #[tokio::test]
    async fn distinct_users_get_distinct_sessions() {
        let tmp = tempdir().expect("tempdir");
        let pool = pool_for(tmp.path());
        let a = pool.acquire("a").await.expect("a");
        let b = pool.acquire("b").await.expect("b");
        let c = pool.acquire("c").await.expect("c");
        assert_ne!(a.token(), b.token());
        assert_ne!(b.token(), c.token());
        assert_eq!(
            pool.snapshot(),
            PoolSnapshot {
                available: 0,
                checked_out: 3,
                capacity: 3
            }
        );
    }

    #[tokio::test]
    async fn fourth_user_is_rejected_when_every_seat_is_busy() {
        let tmp = tempdir().expect("tempdir");
        let pool = pool_for(tmp.path());
        for user in ["a", "b", "c"] {
            pool.acquire(user).await.expect("seat");
        }
        let err = pool.acquire("d").await.expect_err("over capacity");
        match err {
            SessionError::PoolExhausted { in_use, capacity } => {
                assert_eq!(in_use, 3);
                assert_eq!(capacity, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("3 of 3"));
    }

    #[tokio::test]
    async fn double_acquire_returns_the_same_session() {
        let tmp = tempdir().expect("tempdir");
        let pool = pool_for(tmp.path());
        let first = pool.acquire("a").await.expect("first");
        let second = pool.acquire("a").await.expect("second");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.snapshot().checked_out, 1);
    }

    #[tokio::test]
    async fn warm_reuse_keeps_the_session_identity() {
        let tmp = tempdir().expect("tempdir");
        let pool = pool_for(tmp.path());
        let first = pool.acquire("a").await.expect("first");
        let token = first.token();
        drop(first);
        pool.release("a", true).await;
        assert_eq!(pool.snapshot().available, 1);

        let again = pool.acquire("a").await.expect("again");
        assert_eq!(again.token(), token);
        assert_eq!(pool.snapshot().available, 0);
    }

    #[tokio::test]
    async fn cold_release_rotates_the_session_identity() {
        let tmp = tempdir().expect("tempdir");
        let pool = pool_for(tmp.path());
        let first = pool.acquire("a").await.expect("first");
        let token = first.token();
        drop(first);
        pool.release("a", false).await;
        assert_eq!(
            pool.snapshot(),
            PoolSnapshot {
                available: 0,
                checked_out: 0,
                capacity: 3
            }
        );

        let again = pool.acquire("a").await.expect("again");
        assert_ne!(again.token(), token);
    }

    #[tokio::test]
    async fn idle_engine_is_rebound_for_a_new_user_at_capacity() {
        let tmp = tempdir().expect("tempdir");
        let pool = pool_for(tmp.path());
        for user in ["a", "b", "c"] {
            pool.acquire(user).await.expect("seat");
            pool.release(user, true).await;
        }
        assert_eq!(pool.snapshot().available, 3);

        let engine = pool.acquire("d").await.expect("rebound seat");
        assert_eq!(engine.user_id(), "d");
        assert_eq!(
            pool.snapshot(),
            PoolSnapshot {
                available: 2,
                checked_out: 1,
                capacity: 3
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn evict_idle_closes_only_stale_sessions() {
        let tmp = tempdir().expect("tempdir");
        let pool = pool_for(tmp.path());
        pool.acquire("a").await.expect("a");
        pool.release("a", true).await;

        tokio::time::advance(Duration::from_secs(200)).await;
        pool.acquire("b").await.expect("b");
        pool.release("b", true).await;

        // "a" is now past the 300s idle timeout, "b" is not.
        tokio::time::advance(Duration::from_secs(150)).await;
        let evicted = pool.evict_idle().await;
        assert_eq!(evicted, 1);
        assert_eq!(pool.snapshot().available, 1);
        assert!(pool.find("b").is_some());
        assert!(pool.find("a").is_none());
    }

    #[tokio::test]
    async fn close_all_drains_the_pool() {
        let tmp = tempdir().expect("tempdir");
        let pool = pool_for(tmp.path());
        pool.acquire("a").await.expect("a");
        pool.acquire("b").await.expect("b");
        pool.release("b", true).await;
        pool.close_all().await;
        assert_eq!(
            pool.snapshot(),
            PoolSnapshot {
                available: 0,
                checked_out: 0,
                capacity: 3
            }
        );
    }

    #[tokio::test]
    async fn releasing_an_unknown_user_is_a_no_op() {
        let tmp = tempdir().expect("tempdir");
        let pool = pool_for(tmp.path());
        pool.release("ghost", true).await;
        assert_eq!(pool.snapshot().available, 0);
    }
}
