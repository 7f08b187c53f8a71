use super::stream::{AbortableStream, BackupStream};
use crate::error::{BackupError, Result};
use crate::status::RunType;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn, Level};

const LOCK_POLL: Duration = Duration::from_millis(100);

/// Handle for work that runs under a [`RunGuard`].
///
/// Blocking work spawned through the scope is waited for before the lock
/// is released, and `aborted()` turns true once the guard gives up on the
/// run. A default scope has neither a deadline nor a guard behind it.
#[derive(Clone, Default)]
pub struct RunScope {
    abort: CancellationToken,
    tracker: TaskTracker,
    deadline: Option<Instant>,
}

impl RunScope {
    pub fn spawn_blocking<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.tracker.spawn_blocking(f)
    }

    /// Wraps `stream` so that reads fail once the run is abandoned.
    pub fn bind(&self, stream: BackupStream) -> BackupStream {
        Box::new(AbortableStream::new(stream, self.abort.clone()))
    }

    pub fn aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Time left before the guard gives up, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

/// Single-instance lock plus deadline around one backup run.
///
/// Waiting for the lock counts against the deadline. The lock is held until
/// the guarded job finishes, times out or is cancelled, and is released on
/// every one of those paths.
pub struct RunGuard {
    lock_path: PathBuf,
    run_type: RunType,
    deadline: Duration,
    cancel: CancellationToken,
    scope: RunScope,
}

impl RunGuard {
    pub fn new(lock_path: &Path, run_type: RunType, deadline: Duration) -> Self {
        Self {
            lock_path: lock_path.to_path_buf(),
            run_type,
            deadline,
            cancel: CancellationToken::new(),
            scope: RunScope {
                deadline: Some(Instant::now() + deadline),
                ..RunScope::default()
            },
        }
    }

    /// Scope to hand to the guarded job.
    pub fn scope(&self) -> RunScope {
        self.scope.clone()
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn acquire(&self) -> Result<Flock<File>> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;
        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => {
                    debug!("Acquired {}", self.lock_path.display());
                    return Ok(lock);
                }
                Err((returned, Errno::EWOULDBLOCK)) => {
                    file = returned;
                    sleep(LOCK_POLL).await;
                }
                Err((_, errno)) => return Err(std::io::Error::from(errno).into()),
            }
        }
    }

    fn busy_level(run_type: RunType) -> Level {
        if run_type.is_finest() {
            Level::DEBUG
        } else {
            Level::ERROR
        }
    }

    fn report_busy(&self) {
        let msg = "Another instance of tlm-backup is running?";
        if Self::busy_level(self.run_type) == Level::DEBUG {
            debug!("{}", msg);
        } else {
            error!("{}", msg);
        }
    }

    pub async fn run<F, T>(&self, job: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let lock = tokio::select! {
            acquired = timeout(self.deadline, self.acquire()) => match acquired {
                Ok(lock) => lock?,
                Err(_) => {
                    self.report_busy();
                    return Err(BackupError::LockBusy);
                }
            },
            _ = self.cancel.cancelled() => return Err(BackupError::Cancelled),
        };

        let remaining = self.deadline.saturating_sub(started.elapsed());
        let result = tokio::select! {
            finished = timeout(remaining, job) => match finished {
                Ok(result) => result,
                Err(_) => {
                    error!(
                        "{} backup did not finish within {} seconds",
                        self.run_type,
                        self.deadline.as_secs()
                    );
                    Err(BackupError::DeadlineExceeded(self.deadline.as_secs()))
                }
            },
            _ = self.cancel.cancelled() => {
                warn!("{} backup interrupted", self.run_type);
                Err(BackupError::Cancelled)
            }
        };

        if matches!(result, Err(BackupError::DeadlineExceeded(_) | BackupError::Cancelled)) {
            self.scope.abort.cancel();
        }
        self.scope.tracker.close();
        if !self.scope.tracker.is_empty() {
            warn!("Waiting for {} transfer(s) to stop", self.scope.tracker.len());
        }
        self.scope.tracker.wait().await;

        drop(lock);
        debug!("Released {}", self.lock_path.display());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
        }
    }

    async fn busy_log(run_type: RunType) -> String {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let dir = tempdir().unwrap();
        let lock = dir.path().join("lock");
        let outer = RunGuard::new(&lock, RunType::Daily, Duration::from_secs(5));
        let inner_result = outer
            .run(async {
                let inner = RunGuard::new(&lock, run_type, Duration::from_millis(200));
                Ok(inner.run(async { Ok(()) }).await)
            })
            .await
            .unwrap();
        assert!(matches!(inner_result, Err(BackupError::LockBusy)));

        captured
            .text()
            .lines()
            .find(|line| line.contains("Another instance"))
            .unwrap_or_default()
            .to_string()
    }

    #[tokio::test]
    async fn test_runs_job_under_lock() {
        let dir = tempdir().unwrap();
        let guard = RunGuard::new(&dir.path().join("lock"), RunType::Daily, Duration::from_secs(5));
        let value = guard.run(async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_second_guard_is_busy() {
        let dir = tempdir().unwrap();
        let lock = dir.path().join("lock");
        let outer = RunGuard::new(&lock, RunType::Daily, Duration::from_secs(5));

        let inner_result = outer
            .run(async {
                let inner = RunGuard::new(&lock, RunType::Hourly, Duration::from_millis(300));
                Ok(inner.run(async { Ok(()) }).await)
            })
            .await
            .unwrap();
        assert!(matches!(inner_result, Err(BackupError::LockBusy)));

        // released once the outer run is over
        let again = RunGuard::new(&lock, RunType::Hourly, Duration::from_millis(300));
        again.run(async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn test_deadline_interrupts_and_releases() {
        let dir = tempdir().unwrap();
        let lock = dir.path().join("lock");
        let guard = RunGuard::new(&lock, RunType::Weekly, Duration::from_millis(200));
        let result: Result<()> = guard
            .run(async {
                sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(BackupError::DeadlineExceeded(_))));
        assert_eq!(result.unwrap_err().exit_code(), 3);

        let again = RunGuard::new(&lock, RunType::Weekly, Duration::from_millis(300));
        again.run(async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation() {
        let dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        let guard = RunGuard::new(&dir.path().join("lock"), RunType::Daily, Duration::from_secs(30))
            .with_cancellation(cancel.clone());
        let result: Result<()> = guard
            .run(async {
                cancel.cancel();
                sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(BackupError::Cancelled)));
    }

    #[test]
    fn test_busy_severity_follows_cadence() {
        assert_eq!(RunGuard::busy_level(RunType::Hourly), Level::DEBUG);
        for run_type in [RunType::Daily, RunType::Weekly, RunType::Monthly, RunType::Yearly] {
            assert_eq!(RunGuard::busy_level(run_type), Level::ERROR);
        }
    }

    #[tokio::test]
    async fn test_busy_logged_at_debug_for_hourly() {
        let line = busy_log(RunType::Hourly).await;
        assert!(line.contains("DEBUG"), "{}", line);
    }

    #[tokio::test]
    async fn test_busy_logged_as_error_for_daily() {
        let line = busy_log(RunType::Daily).await;
        assert!(line.contains("ERROR"), "{}", line);
    }

    #[tokio::test]
    async fn test_lock_held_until_blocking_work_stops() {
        let dir = tempdir().unwrap();
        let lock = dir.path().join("lock");
        let guard = RunGuard::new(&lock, RunType::Daily, Duration::from_millis(200));
        let scope = guard.scope();
        let stopped = Arc::new(AtomicBool::new(false));

        let worker_scope = scope.clone();
        let worker_stopped = stopped.clone();
        let result: Result<()> = guard
            .run(async move {
                let transfer = worker_scope.spawn_blocking({
                    let scope = worker_scope.clone();
                    move || {
                        while !scope.aborted() {
                            std::thread::sleep(Duration::from_millis(20));
                        }
                        std::thread::sleep(Duration::from_millis(100));
                        worker_stopped.store(true, Ordering::SeqCst);
                    }
                });
                let _ = transfer.await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(BackupError::DeadlineExceeded(_))));
        assert!(scope.aborted());
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(scope.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_default_scope_is_unbounded() {
        let scope = RunScope::default();
        assert!(!scope.aborted());
        assert_eq!(scope.remaining(), None);
    }
}
