use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use crate::engine::pool::{
    ChannelFactory, ConnectionFault, Credentials, ExecOutput, FaultKind, RemoteChannel,
};

/// Remote-exec channel backed by the system ssh/scp clients.
///
/// Password logins are delegated to `sshpass` when a password is supplied;
/// key-based logins go straight through `ssh`.
pub struct SshChannel {
    creds: Credentials,
}

impl SshChannel {
    fn ssh_command(&self) -> Command {
        let mut cmd = match &self.creds.password {
            Some(pw) => {
                let mut c = Command::new("sshpass");
                c.arg("-p").arg(pw).arg("ssh");
                c
            }
            None => {
                let mut c = Command::new("ssh");
                c.arg("-o").arg("BatchMode=yes");
                c
            }
        };
        cmd.arg("-p")
            .arg(self.creds.port.to_string())
            .arg(format!("{}@{}", self.creds.username, self.creds.host));
        cmd
    }

    fn run(mut cmd: Command) -> Result<ExecOutput> {
        let output = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .context("failed to spawn ssh client")?;
        Ok(ExecOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

impl RemoteChannel for SshChannel {
    fn exec(&mut self, command: &str) -> Result<ExecOutput> {
        let mut cmd = self.ssh_command();
        cmd.arg("--").arg(command);
        let out = Self::run(cmd)?;
        debug!(status = out.status, command, "remote exec");
        Ok(out)
    }

    fn upload_text(&mut self, remote_path: &str, contents: &str) -> Result<()> {
        // Stream through ssh rather than scp so no local temp file is needed.
        let mut cmd = self.ssh_command();
        cmd.arg("--")
            .arg(format!("cat > '{remote_path}'"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().context("failed to spawn ssh client")?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(contents.as_bytes())
                .context("failed to stream file to remote host")?;
        }
        let output = child.wait_with_output().context("ssh upload failed")?;
        if !output.status.success() {
            bail!(
                "upload to {remote_path} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    fn download_text(&mut self, remote_path: &str) -> Result<String> {
        let out = self.exec(&format!("cat '{remote_path}'"))?;
        if !out.success() {
            bail!("download of {remote_path} failed: {}", out.stderr);
        }
        Ok(out.stdout)
    }

    fn mkdir_all(&mut self, remote_path: &str) -> Result<()> {
        let out = self.exec(&format!("mkdir -p '{remote_path}'"))?;
        if !out.success() {
            bail!("mkdir -p {remote_path} failed: {}", out.stderr);
        }
        Ok(())
    }
}

/// Production channel factory. Classifies the ssh client's complaints into
/// the engine's fault kinds so the session-start loop can prompt and retry.
pub struct SshChannelFactory;

impl SshChannelFactory {
    fn classify(stderr: &str) -> FaultKind {
        let lower = stderr.to_ascii_lowercase();
        if lower.contains("host key verification failed")
            || lower.contains("remote host identification has changed")
            || lower.contains("no matching host key")
        {
            FaultKind::UnknownHost
        } else if lower.contains("permission denied") || lower.contains("authentication fail") {
            FaultKind::BadPassword
        } else if lower.contains("could not resolve hostname")
            || lower.contains("connection refused")
            || lower.contains("connection timed out")
            || lower.contains("no route to host")
            || lower.contains("network is unreachable")
        {
            FaultKind::ConnectionError
        } else {
            FaultKind::UnknownError
        }
    }

    fn keyscan(creds: &Credentials) -> Option<String> {
        let output = Command::new("ssh-keyscan")
            .arg("-p")
            .arg(creds.port.to_string())
            .arg(&creds.host)
            .stderr(Stdio::null())
            .output()
            .ok()?;
        let text = String::from_utf8_lossy(&output.stdout).to_string();
        (!text.trim().is_empty()).then_some(text)
    }

    fn known_hosts_path() -> Option<PathBuf> {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".ssh/known_hosts"))
    }
}

impl ChannelFactory for SshChannelFactory {
    fn connect(&self, creds: &Credentials) -> Result<Box<dyn RemoteChannel>, ConnectionFault> {
        let mut chan = SshChannel { creds: creds.clone() };
        // Probe with a no-op so authentication problems surface here, not
        // in the middle of a submission loop.
        match chan.exec("true") {
            Ok(out) if out.success() => Ok(Box::new(chan)),
            Ok(out) => Err(ConnectionFault::new(
                Self::classify(&out.stderr),
                out.stderr.trim().to_string(),
            )),
            Err(e) => Err(ConnectionFault::new(FaultKind::UnknownError, e.to_string())),
        }
    }

    fn server_key_hash(&self, creds: &Credentials) -> Option<String> {
        let keys = Self::keyscan(creds)?;
        let output = Command::new("ssh-keygen")
            .arg("-lf")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .ok()
            .and_then(|mut child| {
                child.stdin.take()?.write_all(keys.as_bytes()).ok()?;
                child.wait_with_output().ok()
            })?;
        let text = String::from_utf8_lossy(&output.stdout);
        text.split_whitespace().nth(1).map(str::to_string)
    }

    fn trust_server_key(&self, creds: &Credentials) -> bool {
        let Some(keys) = Self::keyscan(creds) else {
            return false;
        };
        let Some(path) = Self::known_hosts_path() else {
            return false;
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(mut f) => f.write_all(keys.as_bytes()).is_ok(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot update known_hosts");
                false
            }
        }
    }
}

/// Channel that runs everything on the local machine, used by optimizers
/// that do not need a cluster.
pub struct LocalChannel;

impl RemoteChannel for LocalChannel {
    fn exec(&mut self, command: &str) -> Result<ExecOutput> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .context("failed to spawn local shell")?;
        Ok(ExecOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn upload_text(&mut self, remote_path: &str, contents: &str) -> Result<()> {
        if let Some(parent) = std::path::Path::new(remote_path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(remote_path, contents)?;
        Ok(())
    }

    fn download_text(&mut self, remote_path: &str) -> Result<String> {
        Ok(std::fs::read_to_string(remote_path)?)
    }

    fn mkdir_all(&mut self, remote_path: &str) -> Result<()> {
        std::fs::create_dir_all(remote_path)?;
        Ok(())
    }
}
