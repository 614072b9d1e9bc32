//! Running commands inside the VM that hosts the daemon

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use crate::{Error, Result};

/// Captured output of a VM command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Executes shell commands in the VM
pub trait VmShell {
    /// Run `cmd`, feeding `stdin` if given. A non-zero exit is `Error::Command`.
    fn run(&self, cmd: &str, stdin: Option<&str>, show_spinner: bool) -> Result<CommandOutput>;
}

/// Runs commands over `ssh` against the VM's forwarded port
pub struct SshShell {
    port: u16,
    user: String,
    identity: Option<PathBuf>,
    known_hosts: Option<PathBuf>,
}

impl SshShell {
    pub fn new(port: u16, user: impl Into<String>) -> Self {
        Self {
            port,
            user: user.into(),
            identity: None,
            known_hosts: None,
        }
    }

    pub fn identity(mut self, key: impl Into<PathBuf>) -> Self {
        self.identity = Some(key.into());
        self
    }

    pub fn known_hosts(mut self, file: impl Into<PathBuf>) -> Self {
        self.known_hosts = Some(file.into());
        self
    }

    fn command(&self, cmd: &str) -> Command {
        let mut ssh = Command::new("ssh");
        ssh.arg("-p")
            .arg(self.port.to_string())
            .args(["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=accept-new"]);
        if let Some(key) = &self.identity {
            ssh.arg("-i").arg(key);
        }
        if let Some(file) = &self.known_hosts {
            ssh.arg("-o").arg(format!("UserKnownHostsFile={}", file.display()));
        }
        ssh.arg(format!("{}@127.0.0.1", self.user)).arg(cmd);
        ssh
    }
}

impl VmShell for SshShell {
    fn run(&self, cmd: &str, stdin: Option<&str>, show_spinner: bool) -> Result<CommandOutput> {
        tracing::debug!(command = %cmd, "Running command in VM");
        run_command(self.command(cmd), cmd, stdin, show_spinner)
    }
}

/// Run `command` to completion, feeding `stdin` and capturing its output.
/// `label` names the command in errors.
fn run_command(
    mut command: Command,
    label: &str,
    stdin: Option<&str>,
    show_spinner: bool,
) -> Result<CommandOutput> {
    let spinner = show_spinner.then(|| {
        let pb = ProgressBar::new_spinner();
        pb.set_style(ProgressStyle::default_spinner());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    });

    let child = command
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();
    let mut child = match child {
        Ok(child) => child,
        Err(e) => {
            if let Some(pb) = &spinner {
                pb.finish_and_clear();
            }
            return Err(e.into());
        }
    };

    // Feed stdin on its own thread so a chatty command cannot fill the
    // output pipes while we are still writing.
    let pipe = child.stdin.take();
    let (output, fed) = std::thread::scope(|scope| {
        let writer = scope.spawn(move || -> std::io::Result<()> {
            if let (Some(input), Some(mut pipe)) = (stdin, pipe) {
                pipe.write_all(input.as_bytes())?;
            }
            Ok(())
        });
        let output = child.wait_with_output();
        let fed = writer
            .join()
            .unwrap_or_else(|_| Err(std::io::Error::other("stdin writer panicked")));
        (output, fed)
    });

    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }
    let output = output?;

    let result = CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    };

    if !output.status.success() {
        return Err(Error::Command(format!(
            "`{}` exited with {:?}: {}",
            label,
            output.status.code(),
            result.stderr.trim()
        )));
    }

    if let Err(e) = fed {
        return Err(Error::Command(format!("`{}`: could not write stdin: {}", label, e)));
    }

    Ok(result)
}

/// Quote a string for a POSIX shell
pub fn quote_sh(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'\''"#))
}
