//! Byte streams flowing from a source through modifiers into a destination.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::debug;

pub type BackupStream = Box<dyn AsyncRead + Send + Unpin>;

/// stderr text of a child process, filled in while it runs.
#[derive(Debug, Clone, Default)]
pub struct ProcessLog(Arc<Mutex<String>>);

impl ProcessLog {
    pub fn text(&self) -> String {
        self.0.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn last_line(&self) -> String {
        self.text()
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or_default()
            .to_string()
    }
}

/// A spawned capture or filter program whose stdout becomes a stream.
pub struct Process {
    program: String,
    child: Child,
    log: ProcessLog,
    stderr_task: JoinHandle<()>,
}

impl Process {
    /// Spawns a producer: stdin is closed.
    pub fn spawn(cmd: Command) -> io::Result<Self> {
        Self::spawn_with_stdin(cmd, Stdio::null())
    }

    /// Spawns a filter that will read from a stream handed to [`Process::into_stream`].
    pub fn spawn_filter(cmd: Command) -> io::Result<Self> {
        Self::spawn_with_stdin(cmd, Stdio::piped())
    }

    fn spawn_with_stdin(mut cmd: Command, stdin: Stdio) -> io::Result<Self> {
        let program = cmd.as_std().get_program().to_string_lossy().to_string();
        debug!("Spawning {:?}", cmd.as_std());
        let mut child = cmd
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let log = ProcessLog::default();
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("stderr not captured"))?;
        let sink = log.clone();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            if let Ok(mut text) = sink.0.lock() {
                text.push_str(&String::from_utf8_lossy(&buf));
            }
        });

        Ok(Self {
            program,
            child,
            log,
            stderr_task,
        })
    }

    pub fn log(&self) -> ProcessLog {
        self.log.clone()
    }

    /// Turns the process into a stream of its stdout, feeding `input` to
    /// its stdin when given.
    pub fn into_stream(mut self, input: Option<BackupStream>) -> io::Result<ProcessStream> {
        let stdout = self
            .child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("stdout not captured"))?;

        let feeder = match input {
            Some(mut input) => {
                let mut stdin = self
                    .child
                    .stdin
                    .take()
                    .ok_or_else(|| io::Error::other(format!("{} has no stdin", self.program)))?;
                Some(tokio::spawn(async move {
                    let copied = tokio::io::copy(&mut input, &mut stdin).await?;
                    tokio::io::AsyncWriteExt::shutdown(&mut stdin).await?;
                    Ok::<u64, io::Error>(copied)
                }))
            }
            None => None,
        };

        let Process {
            program,
            mut child,
            log,
            stderr_task,
        } = self;

        let exit = async move {
            let status = child.wait().await?;
            let _ = stderr_task.await;
            if let Some(feeder) = feeder {
                feeder
                    .await
                    .map_err(|e| io::Error::other(format!("{} input task failed: {}", program, e)))??;
            }
            if !status.success() {
                return Err(io::Error::other(format!(
                    "{} exited with {}: {}",
                    program,
                    status,
                    log.last_line()
                )));
            }
            debug!("{} finished successfully", program);
            Ok(())
        }
        .boxed();

        Ok(CheckedStream::new(stdout, exit))
    }
}

/// stdout of a [`Process`].
pub type ProcessStream = CheckedStream<ChildStdout>;

/// A stream whose producer reports its outcome separately. Reaching the end
/// of the stream waits for `exit`, and a failed producer becomes a read
/// error instead of a silently truncated artifact.
pub struct CheckedStream<R> {
    inner: R,
    exit: Option<BoxFuture<'static, io::Result<()>>>,
}

impl<R> CheckedStream<R> {
    pub fn new(inner: R, exit: BoxFuture<'static, io::Result<()>>) -> Self {
        Self {
            inner,
            exit: Some(exit),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CheckedStream<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if buf.filled().len() > before {
            return Poll::Ready(Ok(()));
        }
        if let Some(exit) = this.exit.as_mut() {
            let result = ready!(exit.poll_unpin(cx));
            this.exit = None;
            result?;
        }
        Poll::Ready(Ok(()))
    }
}

/// Copies everything read through it into a second writer.
pub struct TeeReader<R, W> {
    inner: R,
    copy: W,
    pending: Vec<u8>,
    written: usize,
}

impl<R, W> TeeReader<R, W> {
    pub fn new(inner: R, copy: W) -> Self {
        Self {
            inner,
            copy,
            pending: Vec::new(),
            written: 0,
        }
    }
}

impl<R, W> AsyncRead for TeeReader<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        // the previous chunk must reach the copy before more is handed out
        while this.written < this.pending.len() {
            let n = ready!(Pin::new(&mut this.copy).poll_write(cx, &this.pending[this.written..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            this.written += n;
        }
        this.pending.clear();
        this.written = 0;

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let chunk = &buf.filled()[before..];
        if chunk.is_empty() {
            ready!(Pin::new(&mut this.copy).poll_flush(cx))?;
            return Poll::Ready(Ok(()));
        }
        this.pending.extend_from_slice(chunk);
        Poll::Ready(Ok(()))
    }
}

/// Fails with an error once `token` fires, even while `inner` is pending.
pub struct AbortableStream<R> {
    inner: R,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<R> AbortableStream<R> {
    pub fn new(inner: R, token: CancellationToken) -> Self {
        Self {
            inner,
            cancelled: Box::pin(token.cancelled_owned()),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for AbortableStream<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.cancelled.poll_unpin(cx).is_ready() {
            return Poll::Ready(Err(io::Error::other("backup run abandoned")));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_process_stream_reads_stdout() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf hello");
        let mut stream = Process::spawn(cmd).unwrap().into_stream(None).unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_process_stream_surfaces_exit_failure() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf partial; echo boom >&2; exit 3");
        let process = Process::spawn(cmd).unwrap();
        let log = process.log();
        let mut stream = process.into_stream(None).unwrap();
        let mut out = Vec::new();
        let err = stream.read_to_end(&mut out).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(log.text().contains("boom"));
    }

    #[tokio::test]
    async fn test_filter_process_consumes_input() {
        let cmd = Command::new("cat");
        let input: BackupStream = Box::new(Cursor::new(b"through cat".to_vec()));
        let mut stream = Process::spawn_filter(cmd)
            .unwrap()
            .into_stream(Some(input))
            .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "through cat");
    }

    #[tokio::test]
    async fn test_checked_stream_reports_producer_failure() {
        let exit = async { Err(io::Error::other("dump aborted")) }.boxed();
        let mut stream = CheckedStream::new(Cursor::new(b"half".to_vec()), exit);
        let mut out = Vec::new();
        let err = stream.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(out, b"half");
        assert!(err.to_string().contains("dump aborted"));
    }

    #[tokio::test]
    async fn test_tee_reader_copies_everything() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut copy = Vec::new();
        let mut out = Vec::new();
        {
            let mut tee = TeeReader::new(Cursor::new(data.clone()), &mut copy);
            tee.read_to_end(&mut out).await.unwrap();
        }
        assert_eq!(out, data);
        assert_eq!(copy, data);
    }

    #[tokio::test]
    async fn test_abortable_stream_ends_a_stalled_read() {
        let (reader, _writer) = tokio::io::duplex(64);
        let token = CancellationToken::new();
        let mut stream = AbortableStream::new(reader, token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            token.cancel();
        });
        let mut out = Vec::new();
        let err = stream.read_to_end(&mut out).await.unwrap_err();
        assert!(err.to_string().contains("abandoned"));
        canceller.await.unwrap();
    }
}
