use super::{in_run_type, Destination};
use crate::backup::{BackupStream, RunScope};
use crate::config::SshConfig;
use crate::error::{BackupError, Result};
use crate::status::{RunType, StatusDocument};
use async_trait::async_trait;
use ssh2::Session;
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, error, info};

/// Destination on a remote host reached over SSH, driven with plain shell
/// commands (`mkdir`, `cat`, `find`, `rm`).
#[derive(Clone)]
pub struct SshDestination {
    config: SshConfig,
    remote_path: String,
    status_path: String,
    scope: RunScope,
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn parent_dir(path: &str) -> &str {
    path.rfind('/').map(|i| &path[..i]).unwrap_or(".")
}

/// Replaces the status file only when the whole document arrived.
fn status_command(status_path: &str, tmp: &str, len: usize) -> String {
    format!(
        "mkdir -p {dir} && cat - > {tmp} && test \"$(wc -c < {tmp})\" -eq {len} && mv -f {tmp} {dst}",
        dir = quote(parent_dir(status_path)),
        tmp = quote(tmp),
        len = len,
        dst = quote(status_path),
    )
}

/// libssh2 timeout for blocking calls, 0 meaning none.
fn session_timeout_ms(remaining: Option<Duration>) -> u32 {
    match remaining {
        None => 0,
        Some(left) => u32::try_from(left.as_millis()).unwrap_or(u32::MAX).max(1),
    }
}

impl SshDestination {
    pub fn new(config: SshConfig, hostname: &str) -> Self {
        let remote_path = config.backup_dir.trim_end_matches('/').to_string();
        let status_path = format!("{}/{}/status", remote_path, hostname);
        Self {
            config,
            remote_path,
            status_path,
            scope: RunScope::default(),
        }
    }

    pub fn with_scope(mut self, scope: RunScope) -> Self {
        self.scope = scope;
        self
    }

    fn remote(&self, name: &str) -> String {
        format!("{}/{}", self.remote_path, name.trim_start_matches('/'))
    }

    fn relative(&self, remote: &str) -> String {
        remote
            .strip_prefix(&self.remote_path)
            .unwrap_or(remote)
            .trim_start_matches('/')
            .to_string()
    }

    fn connect(&self, remaining: Option<Duration>) -> Result<TcpStream> {
        let target = (self.config.backup_host.as_str(), self.config.port);
        let Some(left) = remaining else {
            return Ok(TcpStream::connect(target)?);
        };
        let mut last = io::Error::new(io::ErrorKind::NotFound, "no address resolved");
        for addr in target.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, left.max(Duration::from_millis(1))) {
                Ok(tcp) => return Ok(tcp),
                Err(e) => last = e,
            }
        }
        Err(last.into())
    }

    fn session(&self) -> Result<Session> {
        let remaining = self.scope.remaining();
        let tcp = self.connect(remaining)?;
        let mut session = Session::new()?;
        session.set_timeout(session_timeout_ms(remaining));
        session.set_tcp_stream(tcp);
        session.handshake()?;
        session.userauth_pubkey_file(&self.config.ssh_user, None, &self.config.ssh_key, None)?;
        Ok(session)
    }

    /// Runs `cmd` remotely, optionally piping `input` to its stdin, and
    /// returns its stdout. A non-zero exit status is an error.
    fn execute(&self, cmd: &str, input: Option<&mut dyn Read>) -> Result<Vec<u8>> {
        if self.scope.aborted() {
            return Err(BackupError::Cancelled);
        }
        debug!("Executing on {}: {}", self.config.backup_host, cmd);
        let session = self.session()?;
        let mut channel = session.channel_session()?;
        channel.exec(cmd)?;

        if let Some(input) = input {
            io::copy(input, &mut channel)?;
            channel.send_eof()?;
        }

        let mut stdout = Vec::new();
        channel.read_to_end(&mut stdout)?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr)?;
        channel.wait_close()?;

        let code = channel.exit_status()?;
        if code != 0 {
            return Err(BackupError::Destination(format!(
                "`{}` on {} exited with {}: {}",
                cmd,
                self.config.backup_host,
                code,
                stderr.trim()
            )));
        }
        Ok(stdout)
    }

    async fn run(&self, cmd: String) -> Result<Vec<u8>> {
        let this = self.clone();
        self.scope
            .spawn_blocking(move || this.execute(&cmd, None))
            .await
            .map_err(|e| BackupError::Destination(format!("ssh task failed: {}", e)))?
    }

    async fn list_remote(&self, cmd: String) -> Result<Vec<String>> {
        let out = self.run(cmd).await?;
        let mut names: Vec<String> = String::from_utf8_lossy(&out)
            .split_whitespace()
            .map(|p| self.relative(p))
            .collect();
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl Destination for SshDestination {
    async fn save(&self, stream: BackupStream, name: &str) -> Result<()> {
        let remote = self.remote(name);
        info!("Saving ssh://{}{}", self.config.backup_host, remote);

        let mkdir = format!("mkdir -p {}", quote(parent_dir(&remote)));
        if let Err(e) = self.run(mkdir).await {
            error!("Failed to create directory for {}: {}", remote, e);
            return Err(e);
        }

        let mut bridge = SyncIoBridge::new(self.scope.bind(stream));
        let this = self.clone();
        let cmd = format!("cat - > {}", quote(&remote));
        self.scope
            .spawn_blocking(move || this.execute(&cmd, Some(&mut bridge)).map(|_| ()))
            .await
            .map_err(|e| BackupError::Destination(format!("ssh task failed: {}", e)))?
    }

    async fn status(&self) -> Result<StatusDocument> {
        let path = quote(&self.status_path);
        let out = self
            .run(format!("if test -s {0}; then cat {0}; fi", path))
            .await?;
        if out.is_empty() {
            debug!("No status document yet at {}", self.status_path);
            return Ok(StatusDocument::new());
        }
        StatusDocument::from_json(&out)
    }

    async fn write_status(&self, status: &StatusDocument) -> Result<()> {
        let json = status.to_json()?;
        let this = self.clone();
        let tmp = format!("{}.tmp", self.status_path);
        let cmd = status_command(&self.status_path, &tmp, json.len());
        self.scope.spawn_blocking(move || {
            let mut reader = json.as_slice();
            this.execute(&cmd, Some(&mut reader)).map(|_| ())
        })
        .await
        .map_err(|e| BackupError::Destination(format!("ssh task failed: {}", e)))?
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<String>> {
        let base = quote(&self.remote(prefix));
        self.list_remote(format!("if test -d {0}; then find {0} -type f; fi", base))
            .await
    }

    async fn find_files(&self, prefix: &str, run_type: RunType) -> Result<Vec<String>> {
        let base = self.remote(prefix).trim_end_matches('/').to_string();
        let names = self
            .list_remote(format!(
                "if test -d {0}; then find {0} -type f; fi",
                quote(&base)
            ))
            .await?;
        let below_base = self.relative(&base);
        Ok(names
            .into_iter()
            .filter(|name| {
                let below = name.strip_prefix(below_base.as_str()).unwrap_or(name);
                in_run_type(below, run_type)
            })
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.run(format!("rm -f {}", quote(&self.remote(name))))
            .await
            .map(|_| ())
    }

    fn name(&self) -> &'static str {
        "ssh"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::RunGuard;
    use std::path::PathBuf;
    use tokio::io::AsyncReadExt;

    fn destination() -> SshDestination {
        SshDestination::new(
            SshConfig {
                backup_host: "backup.example.com".to_string(),
                port: 22,
                ssh_user: "root".to_string(),
                ssh_key: PathBuf::from("/root/.ssh/id_rsa"),
                backup_dir: "/var/backup/".to_string(),
            },
            "db01",
        )
    }

    #[test]
    fn test_paths() {
        let dst = destination();
        assert_eq!(dst.status_path, "/var/backup/db01/status");
        assert_eq!(
            dst.remote("db01/daily/files/a.tar"),
            "/var/backup/db01/daily/files/a.tar"
        );
        assert_eq!(
            dst.relative("/var/backup/db01/daily/files/a.tar"),
            "db01/daily/files/a.tar"
        );
    }

    #[test]
    fn test_status_command_checks_size_before_replacing() {
        assert_eq!(
            status_command("/var/backup/db01/status", "/var/backup/db01/status.tmp", 42),
            "mkdir -p '/var/backup/db01' && cat - > '/var/backup/db01/status.tmp' \
             && test \"$(wc -c < '/var/backup/db01/status.tmp')\" -eq 42 \
             && mv -f '/var/backup/db01/status.tmp' '/var/backup/db01/status'"
        );
    }

    #[test]
    fn test_session_timeout_follows_deadline() {
        assert_eq!(session_timeout_ms(None), 0);
        assert_eq!(session_timeout_ms(Some(Duration::ZERO)), 1);
        assert_eq!(session_timeout_ms(Some(Duration::from_secs(90))), 90_000);
        assert_eq!(session_timeout_ms(Some(Duration::from_secs(u64::MAX / 2))), u32::MAX);
    }

    #[tokio::test]
    async fn test_abandoned_run_stops_feeding_input() {
        let dir = tempfile::tempdir().unwrap();
        let guard = RunGuard::new(&dir.path().join("lock"), RunType::Daily, Duration::from_millis(50));
        let scope = guard.scope();
        let result: Result<()> = guard
            .run(std::future::pending::<Result<()>>())
            .await;
        assert!(matches!(result, Err(BackupError::DeadlineExceeded(_))));

        let mut upload = scope.bind(Box::new(std::io::Cursor::new(b"artifact".to_vec())));
        let mut buf = Vec::new();
        assert!(upload.read_to_end(&mut buf).await.is_err());

        let dst = destination().with_scope(scope);
        assert!(matches!(
            dst.execute("true", None),
            Err(BackupError::Cancelled)
        ));
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("/a b"), "'/a b'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(parent_dir("/var/backup/db01/status"), "/var/backup/db01");
    }
}
