//! Process-isolated worker boundary
//!
//! Each audit runs in its own short-lived child process. The parent hands
//! the request over through environment variables, designates a private
//! result file, and waits for the child under a hard wall-clock timeout:
//!
//! ```text
//!   WorkerBoundary::run
//!     ├─ spawn child   (URL, endpoint, settings, auth, result path in env)
//!     ├─ drain stderr  (kept as diagnostics)
//!     ├─ wait ──┬─ exit      → read result file → delete it → Value / error
//!     │         ├─ timeout   → kill child → WorkerError::Timeout
//!     │         └─ shutdown  → kill child → WorkerError::Shutdown
//! ```
//!
//! Children are spawned with `kill_on_drop`, so dropping the `run` future
//! (a scheduler watchdog firing, for instance) also terminates the child.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::auth::AuthConfig;
use crate::config::RunConfig;
use crate::error::{PoolError, WorkerError};
use crate::pool::{BrowserPool, ChromeLauncher, PoolOptions};

/// Target URL
pub const ENV_URL: &str = "VITALS_GATE_URL";
/// DevTools websocket of the pooled browser
pub const ENV_BROWSER_WS: &str = "VITALS_GATE_BROWSER_WS";
/// Resolved engine settings as JSON
pub const ENV_SETTINGS: &str = "VITALS_GATE_SETTINGS";
/// Resolved auth headers/cookies as JSON (absent when there is no auth)
pub const ENV_AUTH: &str = "VITALS_GATE_AUTH";
/// Where the child writes its [`WorkerOutput`]
pub const ENV_RESULT_FILE: &str = "VITALS_GATE_RESULT_FILE";

/// Lines of child stderr kept for error messages
const STDERR_TAIL_LINES: usize = 20;

/// How long stderr may stay open after the child exits. A grandchild that
/// inherited the pipe would otherwise hold the boundary past its timeout.
const STDERR_GRACE: Duration = Duration::from_millis(250);

/// Contents of the result file written by the child
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WorkerOutput {
    Ok { result: Value },
    Error { message: String },
}

/// Everything the engine needs for one audit
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRequest {
    pub task_id: String,
    pub url: String,
    /// Resolved profile settings
    pub settings: Value,
    /// Resolved auth material, environment variables already substituted
    pub auth: Option<AuthConfig>,
}

/// Runs one audit and returns the engine's raw result
#[async_trait]
pub trait AuditEngine: Send + Sync {
    async fn audit(&self, request: AuditRequest) -> Result<Value, WorkerError>;

    /// Release idle long-lived resources. Called when a run ends.
    async fn cleanup(&self) {}
}

/// Child processes currently running under one boundary
#[derive(Clone)]
pub struct ActiveProcesses {
    inner: Arc<ActiveInner>,
}

struct ActiveInner {
    pids: Mutex<HashSet<u32>>,
    shutdown: watch::Sender<bool>,
}

/// Removes a pid from the set when dropped
struct Registration {
    inner: Arc<ActiveInner>,
    pid: u32,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.inner.lock().remove(&self.pid);
    }
}

impl ActiveInner {
    fn lock(&self) -> MutexGuard<'_, HashSet<u32>> {
        self.pids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ActiveProcesses {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveProcesses {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ActiveInner {
                pids: Mutex::new(HashSet::new()),
                shutdown,
            }),
        }
    }

    fn register(&self, pid: u32) -> Registration {
        self.inner.lock().insert(pid);
        Registration {
            inner: self.inner.clone(),
            pid,
        }
    }

    /// Pids of running children
    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.inner.lock().iter().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutdown(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Kill every running child and refuse new ones
    pub fn shutdown(&self) {
        let running = self.len();
        if running > 0 {
            info!("Terminating {} running audit workers", running);
        }
        self.inner.shutdown.send_replace(true);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }
}

/// How the child process is launched
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOptions {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Hard wall-clock limit per child
    pub timeout: Duration,
    /// Directory for result files
    pub scratch_dir: PathBuf,
}

impl WorkerOptions {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
            scratch_dir: std::env::temp_dir(),
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            program: config
                .worker
                .program
                .clone()
                .unwrap_or_else(default_program),
            args: config.worker.args.clone(),
            timeout: config.timeout,
            scratch_dir: config
                .worker
                .scratch_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
        }
    }
}

/// `audit-worker` next to the running executable, else from `PATH`
pub fn default_program() -> PathBuf {
    let name = format!("audit-worker{}", std::env::consts::EXE_SUFFIX);
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
        .filter(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(name))
}

/// Spawns and supervises audit child processes
pub struct WorkerBoundary {
    options: WorkerOptions,
    processes: ActiveProcesses,
}

impl WorkerBoundary {
    pub fn new(options: WorkerOptions) -> Self {
        Self {
            options,
            processes: ActiveProcesses::new(),
        }
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    pub fn processes(&self) -> &ActiveProcesses {
        &self.processes
    }

    /// Kill running children; later `run` calls fail with [`WorkerError::Shutdown`]
    pub fn shutdown(&self) {
        self.processes.shutdown();
    }

    /// Run one audit in a child process attached to `endpoint`
    #[instrument(skip(self, request), fields(task = %request.task_id, url = %request.url))]
    pub async fn run(&self, endpoint: &str, request: &AuditRequest) -> Result<Value, WorkerError> {
        if self.processes.is_shutdown() {
            return Err(WorkerError::Shutdown);
        }

        let result_file = self
            .options
            .scratch_dir
            .join(format!("vitals-gate-{}.json", uuid::Uuid::new_v4().simple()));

        let mut command = self.command(endpoint, request, &result_file)?;
        let mut child = command.spawn().map_err(|source| WorkerError::Spawn {
            program: self.options.program.display().to_string(),
            source,
        })?;
        let _registration = child.id().map(|pid| self.processes.register(pid));
        debug!("Spawned audit worker (pid {:?})", child.id());

        let diagnostics = tokio::spawn(read_stderr_tail(child.stderr.take()));
        let mut shutdown = self.processes.subscribe();

        let waited = tokio::select! {
            status = child.wait() => Ok(status?),
            _ = tokio::time::sleep(self.options.timeout) => Err(WorkerError::Timeout(self.options.timeout)),
            _ = shutdown_signalled(&mut shutdown) => Err(WorkerError::Shutdown),
        };
        let status = match waited {
            Ok(status) => status,
            Err(e) => {
                warn!("Killing audit worker: {}", e);
                diagnostics.abort();
                terminate(&mut child).await;
                remove_result_file(&result_file).await;
                return Err(e);
            }
        };

        let stderr_tail = stderr_tail_within_grace(diagnostics).await;
        let output = read_result_file(&result_file).await;
        remove_result_file(&result_file).await;

        interpret(status, output, stderr_tail)
    }

    fn command(&self, endpoint: &str, request: &AuditRequest, result_file: &Path) -> Result<Command, WorkerError> {
        let settings = serde_json::to_string(&request.settings)
            .map_err(|e| WorkerError::InvalidResult(format!("settings not serializable: {}", e)))?;

        let mut command = Command::new(&self.options.program);
        command
            .args(&self.options.args)
            .env(ENV_URL, &request.url)
            .env(ENV_BROWSER_WS, endpoint)
            .env(ENV_SETTINGS, settings)
            .env(ENV_RESULT_FILE, result_file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match &request.auth {
            Some(auth) => {
                let auth = serde_json::to_string(auth)
                    .map_err(|e| WorkerError::InvalidResult(format!("auth not serializable: {}", e)))?;
                command.env(ENV_AUTH, auth);
            }
            None => {
                command.env_remove(ENV_AUTH);
            }
        }
        Ok(command)
    }
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!("Failed to kill audit worker: {}", e);
    }
}

async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn read_stderr_tail(stderr: Option<ChildStderr>) -> String {
    let Some(stderr) = stderr else {
        return String::new();
    };
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "audit_worker", "{}", line);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n").trim().to_string()
}

async fn stderr_tail_within_grace(mut diagnostics: JoinHandle<String>) -> String {
    match tokio::time::timeout(STDERR_GRACE, &mut diagnostics).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            debug!("Worker stderr still open {:?} after exit; dropping diagnostics", STDERR_GRACE);
            diagnostics.abort();
            String::new()
        }
    }
}

/// `None` when the child never wrote the file
async fn read_result_file(path: &Path) -> Option<Result<WorkerOutput, String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Some(serde_json::from_str(&content).map_err(|e| e.to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => Some(Err(e.to_string())),
    }
}

async fn remove_result_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not delete result file {}: {}", path.display(), e),
    }
}

fn interpret(
    status: ExitStatus,
    output: Option<Result<WorkerOutput, String>>,
    stderr_tail: String,
) -> Result<Value, WorkerError> {
    if status.success() {
        return match output {
            Some(Ok(WorkerOutput::Ok { result })) => Ok(result),
            Some(Ok(WorkerOutput::Error { message })) => Err(WorkerError::Audit(message)),
            Some(Err(e)) => Err(WorkerError::InvalidResult(e)),
            None => Err(WorkerError::InvalidResult(
                "worker exited successfully without writing a result".to_string(),
            )),
        };
    }

    let message = match output {
        Some(Ok(WorkerOutput::Error { message })) => message,
        _ if !stderr_tail.is_empty() => stderr_tail,
        _ => "no diagnostic output".to_string(),
    };
    Err(WorkerError::Exited {
        status: status.to_string(),
        message,
    })
}

/// Production engine: one pooled browser per audit, one child per audit
pub struct PooledWorkerEngine {
    pool: BrowserPool,
    boundary: WorkerBoundary,
}

impl PooledWorkerEngine {
    pub fn new(pool: BrowserPool, boundary: WorkerBoundary) -> Self {
        Self { pool, boundary }
    }

    /// Chrome pool sized by `pool_size` and a boundary for the configured worker
    pub fn from_config(config: &RunConfig) -> Result<Self, PoolError> {
        let launcher = ChromeLauncher {
            headful: config.worker.headful,
            ..Default::default()
        };
        let pool = BrowserPool::new(
            Arc::new(launcher),
            PoolOptions::with_size(config.effective_pool_size()),
        )?;
        Ok(Self::new(pool, WorkerBoundary::new(WorkerOptions::from_config(config))))
    }

    pub fn pool(&self) -> &BrowserPool {
        &self.pool
    }

    pub fn boundary(&self) -> &WorkerBoundary {
        &self.boundary
    }

    /// Kill running audits and every pooled browser
    pub async fn shutdown(&self) {
        self.boundary.shutdown();
        self.pool.cleanup().await;
    }
}

#[async_trait]
impl AuditEngine for PooledWorkerEngine {
    async fn audit(&self, request: AuditRequest) -> Result<Value, WorkerError> {
        // The lease goes back to the pool when this future completes or is dropped
        let lease = self.pool.acquire().await?;
        self.boundary.run(lease.endpoint(), &request).await
    }

    async fn cleanup(&self) {
        self.pool.cleanup().await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;

    fn boundary(script: &str, timeout: Duration, scratch: &Path) -> WorkerBoundary {
        let mut options = WorkerOptions::new("sh", timeout);
        options.args = vec!["-c".to_string(), script.to_string()];
        options.scratch_dir = scratch.to_path_buf();
        WorkerBoundary::new(options)
    }

    fn request() -> AuditRequest {
        AuditRequest {
            task_id: "home:desktop:1".to_string(),
            url: "https://example.com/".to_string(),
            settings: json!({"formFactor": "desktop"}),
            auth: None,
        }
    }

    fn scratch_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_success_reads_and_deletes_result() {
        let scratch = tempfile::tempdir().unwrap();
        let script = r#"printf '{"status":"ok","result":{"url":"%s","ws":"%s"}}' "$VITALS_GATE_URL" "$VITALS_GATE_BROWSER_WS" > "$VITALS_GATE_RESULT_FILE""#;
        let boundary = boundary(script, Duration::from_secs(10), scratch.path());

        let value = boundary.run("ws://127.0.0.1:9222/x", &request()).await.unwrap();
        assert_eq!(value["url"], "https://example.com/");
        assert_eq!(value["ws"], "ws://127.0.0.1:9222/x");
        assert!(scratch_is_empty(scratch.path()));
        assert!(boundary.processes().is_empty());
    }

    #[tokio::test]
    async fn test_settings_and_auth_are_passed() {
        let scratch = tempfile::tempdir().unwrap();
        let script = r#"printf '{"status":"ok","result":{"settings":%s,"auth":%s}}' "$VITALS_GATE_SETTINGS" "$VITALS_GATE_AUTH" > "$VITALS_GATE_RESULT_FILE""#;
        let boundary = boundary(script, Duration::from_secs(10), scratch.path());

        let mut auth = AuthConfig::default();
        auth.headers.insert("Authorization".to_string(), "Bearer abc".to_string());
        let mut req = request();
        req.auth = Some(auth);

        let value = boundary.run("ws://x", &req).await.unwrap();
        assert_eq!(value["settings"]["formFactor"], "desktop");
        assert_eq!(value["auth"]["headers"]["Authorization"], "Bearer abc");
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let scratch = tempfile::tempdir().unwrap();
        let boundary = boundary("echo 'chrome went away' >&2; exit 3", Duration::from_secs(10), scratch.path());

        match boundary.run("ws://x", &request()).await {
            Err(WorkerError::Exited { message, .. }) => assert_eq!(message, "chrome went away"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_prefers_reported_error() {
        let scratch = tempfile::tempdir().unwrap();
        let script = r#"echo noise >&2; printf '{"status":"error","message":"navigation failed"}' > "$VITALS_GATE_RESULT_FILE"; exit 1"#;
        let boundary = boundary(script, Duration::from_secs(10), scratch.path());

        match boundary.run("ws://x", &request()).await {
            Err(WorkerError::Exited { message, .. }) => assert_eq!(message, "navigation failed"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(scratch_is_empty(scratch.path()));
    }

    #[tokio::test]
    async fn test_inherited_stderr_does_not_outlive_timeout() {
        let scratch = tempfile::tempdir().unwrap();
        let script = r#"(sleep 5) & printf '{"status":"ok","result":{"score":1}}' > "$VITALS_GATE_RESULT_FILE"; exit 0"#;
        let boundary = boundary(script, Duration::from_millis(500), scratch.path());

        let started = Instant::now();
        let value = boundary.run("ws://x", &request()).await.unwrap();
        assert_eq!(value["score"], 1);
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    }

    #[tokio::test]
    async fn test_success_without_result_file_is_invalid() {
        let scratch = tempfile::tempdir().unwrap();
        let boundary = boundary("exit 0", Duration::from_secs(10), scratch.path());
        assert!(matches!(
            boundary.run("ws://x", &request()).await,
            Err(WorkerError::InvalidResult(_))
        ));
    }

    #[tokio::test]
    async fn test_garbage_result_is_invalid() {
        let scratch = tempfile::tempdir().unwrap();
        let boundary = boundary(r#"echo 'not json' > "$VITALS_GATE_RESULT_FILE""#, Duration::from_secs(10), scratch.path());
        assert!(matches!(
            boundary.run("ws://x", &request()).await,
            Err(WorkerError::InvalidResult(_))
        ));
        assert!(scratch_is_empty(scratch.path()));
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let scratch = tempfile::tempdir().unwrap();
        let boundary = boundary("sleep 30", Duration::from_millis(200), scratch.path());

        let started = Instant::now();
        let result = boundary.run("ws://x", &request()).await;
        assert!(matches!(result, Err(WorkerError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(boundary.processes().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let scratch = tempfile::tempdir().unwrap();
        let mut options = WorkerOptions::new("/nonexistent/audit-worker", Duration::from_secs(1));
        options.scratch_dir = scratch.path().to_path_buf();
        let boundary = WorkerBoundary::new(options);

        assert!(matches!(
            boundary.run("ws://x", &request()).await,
            Err(WorkerError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_kills_running_children_and_rejects_new_ones() {
        let scratch = tempfile::tempdir().unwrap();
        let boundary = Arc::new(boundary("sleep 30", Duration::from_secs(60), scratch.path()));

        let running = tokio::spawn({
            let boundary = boundary.clone();
            async move { boundary.run("ws://x", &request()).await }
        });
        while boundary.processes().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        boundary.shutdown();
        assert!(matches!(running.await.unwrap(), Err(WorkerError::Shutdown)));
        assert!(boundary.processes().is_empty());
        assert!(matches!(
            boundary.run("ws://x", &request()).await,
            Err(WorkerError::Shutdown)
        ));
    }

    #[test]
    fn test_worker_output_wire_format() {
        let ok: WorkerOutput = serde_json::from_value(json!({"status": "ok", "result": {"a": 1}})).unwrap();
        assert_eq!(ok, WorkerOutput::Ok { result: json!({"a": 1}) });
        let err = serde_json::to_value(WorkerOutput::Error { message: "boom".into() }).unwrap();
        assert_eq!(err, json!({"status": "error", "message": "boom"}));
    }
}
