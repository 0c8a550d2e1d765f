//! Bounded pool of browser instances
//!
//! Launching Chrome costs seconds, so the pool keeps `size` instances alive
//! and hands them out one task at a time. An instance is checked out as a
//! [`BrowserLease`]; dropping the lease returns it to the pool, so a
//! cancelled or timed-out task can never leak an instance.
//!
//! `acquire` polls with a growing delay and gives up after a bounded number
//! of attempts instead of waiting forever.

use anyhow::Context;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use futures::future::join_all;
use futures::StreamExt;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::PoolError;

/// Creates browser instances for the pool
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> anyhow::Result<Box<dyn BrowserProcess>>;
}

/// A running browser instance
#[async_trait]
pub trait BrowserProcess: Send {
    /// DevTools websocket endpoint
    fn endpoint(&self) -> String;

    /// Terminate the instance
    async fn kill(&mut self) -> anyhow::Result<()>;
}

/// Pool-assigned instance identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "browser-{}", self.0)
    }
}

/// Pool sizing and acquire backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    /// Number of instances (at least 1)
    pub size: usize,
    /// Polls before `acquire` gives up
    pub max_acquire_attempts: u32,
    /// Delay after the first failed poll; grows linearly per attempt
    pub retry_delay: Duration,
    /// Upper bound for a single delay
    pub max_retry_delay: Duration,
}

impl PoolOptions {
    pub fn with_size(size: usize) -> Self {
        Self {
            size,
            ..Default::default()
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.retry_delay
            .saturating_mul(attempt)
            .min(self.max_retry_delay)
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: 1,
            max_acquire_attempts: 60,
            retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(2),
        }
    }
}

struct Slot {
    id: InstanceId,
    endpoint: String,
    in_use: bool,
}

#[derive(Default)]
struct PoolState {
    initialized: bool,
    slots: Vec<Slot>,
    processes: HashMap<InstanceId, Box<dyn BrowserProcess>>,
}

struct PoolInner {
    launcher: Arc<dyn BrowserLauncher>,
    options: PoolOptions,
    state: Mutex<PoolState>,
    /// Serializes initialize/cleanup
    lifecycle: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, id: InstanceId) {
        let mut state = self.lock();
        match state.slots.iter_mut().find(|s| s.id == id) {
            Some(slot) if slot.in_use => {
                slot.in_use = false;
                debug!("Released {}", id);
            }
            Some(_) => debug!("{} was not checked out; release ignored", id),
            None => debug!("{} is not tracked by the pool; release ignored", id),
        }
    }
}

/// A checked-out browser instance. Returned to the pool on drop.
pub struct BrowserLease {
    id: InstanceId,
    endpoint: String,
    pool: Arc<PoolInner>,
}

impl BrowserLease {
    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Return the instance now instead of at end of scope
    pub fn release(self) {}
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

impl fmt::Debug for BrowserLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserLease")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// The pool. Cheap to clone; clones share instances.
#[derive(Clone)]
pub struct BrowserPool {
    inner: Arc<PoolInner>,
}

impl BrowserPool {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, options: PoolOptions) -> Result<Self, PoolError> {
        if options.size == 0 {
            return Err(PoolError::InvalidSize);
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                launcher,
                options,
                state: Mutex::new(PoolState::default()),
                lifecycle: tokio::sync::Mutex::new(()),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Configured number of instances
    pub fn capacity(&self) -> usize {
        self.inner.options.size
    }

    /// Instances currently free
    pub fn size(&self) -> usize {
        self.inner.lock().slots.iter().filter(|s| !s.in_use).count()
    }

    /// Instances currently checked out
    pub fn checked_out(&self) -> usize {
        self.inner.lock().slots.iter().filter(|s| s.in_use).count()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().initialized
    }

    /// Launch all instances. A no-op when already initialized.
    ///
    /// If any launch fails, the instances that did start are killed and the
    /// pool stays uninitialized.
    #[instrument(skip(self), fields(size = self.inner.options.size))]
    pub async fn initialize(&self) -> Result<(), PoolError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.is_initialized() {
            return Ok(());
        }

        info!("Launching {} browser instances", self.inner.options.size);
        let launches = (0..self.inner.options.size).map(|_| self.inner.launcher.launch());
        let outcomes = join_all(launches).await;

        let mut launched = Vec::new();
        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(process) => launched.push(process),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(format!("{:#}", e));
                    }
                }
            }
        }

        if let Some(error) = first_error {
            warn!("Browser launch failed, tearing down {} instances", launched.len());
            kill_all(launched.into_iter().map(|p| (None, p)).collect()).await;
            return Err(PoolError::Launch(error));
        }

        let mut state = self.inner.lock();
        for process in launched {
            let id = InstanceId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
            state.slots.push(Slot {
                id,
                endpoint: process.endpoint(),
                in_use: false,
            });
            state.processes.insert(id, process);
        }
        state.initialized = true;
        info!("Browser pool ready");
        Ok(())
    }

    /// Check out a free instance, launching the pool first if needed.
    ///
    /// # Errors
    ///
    /// [`PoolError::Exhausted`] when no instance frees up within the
    /// configured number of attempts, or a launch error.
    #[instrument(skip(self))]
    pub async fn acquire(&self) -> Result<BrowserLease, PoolError> {
        let max_attempts = self.inner.options.max_acquire_attempts.max(1);

        for attempt in 1..=max_attempts {
            if !self.is_initialized() {
                self.initialize().await?;
            }

            {
                let mut state = self.inner.lock();
                if let Some(slot) = state.slots.iter_mut().find(|s| !s.in_use) {
                    slot.in_use = true;
                    debug!("Acquired {} on attempt {}", slot.id, attempt);
                    return Ok(BrowserLease {
                        id: slot.id,
                        endpoint: slot.endpoint.clone(),
                        pool: self.inner.clone(),
                    });
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.inner.options.delay_for(attempt)).await;
            }
        }

        warn!("No browser instance freed up after {} attempts", max_attempts);
        Err(PoolError::Exhausted {
            attempts: max_attempts,
        })
    }

    /// Return an instance by id. Unknown ids are ignored.
    pub fn release(&self, id: InstanceId) {
        self.inner.release(id);
    }

    /// Kill every instance and reset the pool.
    ///
    /// Each instance is killed independently; a failure is logged and does
    /// not stop the others. Later `acquire` calls relaunch the pool.
    #[instrument(skip(self))]
    pub async fn cleanup(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let processes: Vec<_> = {
            let mut state = self.inner.lock();
            state.initialized = false;
            state.slots.clear();
            state.processes.drain().collect()
        };

        if processes.is_empty() {
            return;
        }
        info!("Shutting down {} browser instances", processes.len());
        kill_all(processes.into_iter().map(|(id, p)| (Some(id), p)).collect()).await;
    }
}

async fn kill_all(processes: Vec<(Option<InstanceId>, Box<dyn BrowserProcess>)>) {
    let kills = processes.into_iter().map(|(id, mut process)| async move {
        if let Err(e) = process.kill().await {
            match id {
                Some(id) => warn!("Failed to kill {}: {:#}", id, e),
                None => warn!("Failed to kill browser instance: {:#}", e),
            }
        }
    });
    join_all(kills).await;
}

/// Launches headless Chrome via chromiumoxide
#[derive(Debug, Clone, Default)]
pub struct ChromeLauncher {
    /// Show the browser window
    pub headful: bool,
    /// Chrome binary; auto-detected when `None`
    pub executable: Option<PathBuf>,
    /// Extra command-line switches
    pub args: Vec<String>,
}

struct ChromeInstance {
    browser: Browser,
    handler: tokio::task::JoinHandle<()>,
    endpoint: String,
    user_data_dir: PathBuf,
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self) -> anyhow::Result<Box<dyn BrowserProcess>> {
        // Separate profile dirs let several instances run side by side
        let user_data_dir = std::env::temp_dir().join(format!(
            "vitals-gate-chrome-{}",
            uuid::Uuid::new_v4().simple()
        ));

        let mut builder = BrowserConfig::builder()
            .user_data_dir(&user_data_dir)
            .arg("--no-first-run")
            .arg("--disable-extensions");
        if self.headful {
            builder = builder.with_head();
        }
        if let Some(path) = &self.executable {
            builder = builder.chrome_executable(path);
        }
        for arg in &self.args {
            builder = builder.arg(arg.as_str());
        }
        let config = builder.build().map_err(|e| anyhow::anyhow!("{}", e))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("Failed to launch browser")?;

        // Spawn handler to process browser events
        let handler = tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if h.is_err() {
                    break;
                }
            }
        });

        let endpoint = browser.websocket_address().clone();
        debug!("Browser launched at {}", endpoint);
        Ok(Box::new(ChromeInstance {
            browser,
            handler,
            endpoint,
            user_data_dir,
        }))
    }
}

/// Log the outcome of a forced kill; true when it failed.
/// `None` means the process had already exited.
fn log_forced_kill(outcome: Option<std::io::Result<()>>) -> bool {
    match outcome {
        Some(Err(e)) => {
            warn!("Failed to kill browser process: {}", e);
            true
        }
        _ => false,
    }
}

#[async_trait]
impl BrowserProcess for ChromeInstance {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn kill(&mut self) -> anyhow::Result<()> {
        let closed = self.browser.close().await;
        if closed.is_err() {
            // Graceful close failed; make sure the process is gone anyway
            log_forced_kill(self.browser.kill().await);
        }
        self.browser.wait().await.context("Failed to reap browser process")?;
        self.handler.abort();
        if let Err(e) = std::fs::remove_dir_all(&self.user_data_dir) {
            debug!("Could not remove {}: {}", self.user_data_dir.display(), e);
        }
        closed.context("Failed to close browser")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeLauncher {
        launched: AtomicUsize,
        killed: Arc<AtomicUsize>,
        fail_kill_for: Option<usize>,
        fail_launch: bool,
    }

    struct FakeProcess {
        n: usize,
        killed: Arc<AtomicUsize>,
        fail_kill: bool,
    }

    #[async_trait]
    impl BrowserLauncher for FakeLauncher {
        async fn launch(&self) -> anyhow::Result<Box<dyn BrowserProcess>> {
            if self.fail_launch {
                anyhow::bail!("no chrome here");
            }
            let n = self.launched.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Box::new(FakeProcess {
                n,
                killed: self.killed.clone(),
                fail_kill: self.fail_kill_for == Some(n),
            }))
        }
    }

    #[async_trait]
    impl BrowserProcess for FakeProcess {
        fn endpoint(&self) -> String {
            format!("ws://127.0.0.1:9222/devtools/browser/{}", self.n)
        }

        async fn kill(&mut self) -> anyhow::Result<()> {
            if self.fail_kill {
                anyhow::bail!("refused to die");
            }
            self.killed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pool(launcher: Arc<FakeLauncher>, size: usize) -> BrowserPool {
        BrowserPool::new(
            launcher,
            PoolOptions {
                size,
                max_acquire_attempts: 5,
                retry_delay: Duration::from_millis(10),
                max_retry_delay: Duration::from_millis(50),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_zero_size_rejected() {
        let result = BrowserPool::new(Arc::new(FakeLauncher::default()), PoolOptions::with_size(0));
        assert!(matches!(result, Err(PoolError::InvalidSize)));
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let launcher = Arc::new(FakeLauncher::default());
        let pool = pool(launcher.clone(), 3);

        pool.initialize().await.unwrap();
        pool.initialize().await.unwrap();
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 3);
        assert_eq!(pool.size(), 3);
    }

    #[tokio::test]
    async fn test_acquire_initializes_lazily() {
        let launcher = Arc::new(FakeLauncher::default());
        let pool = pool(launcher.clone(), 2);
        assert!(!pool.is_initialized());

        let lease = pool.acquire().await.unwrap();
        assert!(lease.endpoint().starts_with("ws://"));
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 2);
        assert_eq!(pool.size() + pool.checked_out(), 2);
    }

    #[tokio::test]
    async fn test_leases_are_distinct_and_returned_on_drop() {
        let pool = pool(Arc::new(FakeLauncher::default()), 2);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.checked_out(), 2);

        drop(a);
        assert_eq!(pool.size(), 1);
        b.release();
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_fails_instead_of_hanging() {
        let pool = pool(Arc::new(FakeLauncher::default()), 2);

        let acquisitions = (0..3).map(|_| pool.acquire());
        let outcomes = join_all(acquisitions).await;

        let ok = outcomes.iter().filter(|o| o.is_ok()).count();
        let exhausted = outcomes
            .iter()
            .filter(|o| matches!(o, Err(PoolError::Exhausted { attempts: 5 })))
            .count();
        assert_eq!(ok, 2);
        assert_eq!(exhausted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_acquire_gets_released_instance() {
        let pool = pool(Arc::new(FakeLauncher::default()), 1);
        let held = pool.acquire().await.unwrap();

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await.map(|l| l.id()) }
        });
        tokio::time::sleep(Duration::from_millis(15)).await;
        let held_id = held.id();
        drop(held);

        assert_eq!(waiter.await.unwrap().unwrap(), held_id);
    }

    #[tokio::test]
    async fn test_release_untracked_is_noop() {
        let pool = pool(Arc::new(FakeLauncher::default()), 1);
        pool.release(InstanceId(999));
        pool.initialize().await.unwrap();
        pool.release(InstanceId(999));
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_kills_each_instance_independently() {
        let launcher = Arc::new(FakeLauncher {
            fail_kill_for: Some(1),
            ..Default::default()
        });
        let pool = pool(launcher.clone(), 3);
        pool.initialize().await.unwrap();

        pool.cleanup().await;
        assert_eq!(launcher.killed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.size(), 0);
        assert!(!pool.is_initialized());
    }

    #[tokio::test]
    async fn test_reinitialize_after_cleanup() {
        let launcher = Arc::new(FakeLauncher::default());
        let pool = pool(launcher.clone(), 2);
        let stale = pool.acquire().await.unwrap();
        pool.cleanup().await;

        // A lease from before cleanup no longer matches any slot
        drop(stale);
        let fresh = pool.acquire().await.unwrap();
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 4);
        assert_eq!(pool.checked_out(), 1);
        drop(fresh);
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test]
    async fn test_launch_failure_surfaces() {
        let pool = pool(
            Arc::new(FakeLauncher {
                fail_launch: true,
                ..Default::default()
            }),
            2,
        );
        assert!(matches!(pool.acquire().await, Err(PoolError::Launch(_))));
        assert!(!pool.is_initialized());
    }

    #[test]
    fn test_forced_kill_failure_is_reported() {
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(log_forced_kill(Some(Err(denied))));
        assert!(!log_forced_kill(Some(Ok(()))));
        assert!(!log_forced_kill(None));
    }
}
