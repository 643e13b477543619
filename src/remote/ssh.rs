// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! An `Executor` that runs the remote command bodies through the local `ssh` client.

use std::{
    io,
    os::unix::process::ExitStatusExt,
    process::{ExitStatus, Stdio},
};

use {
    log::{debug, warn},
    nix::{
        sys::signal::{kill, Signal},
        unistd::Pid,
    },
    tokio::{
        io::AsyncReadExt,
        process::{Child, Command},
        sync::{mpsc, oneshot},
    },
};

use crate::{config, host::Host};

use super::{Executor, Output, RemoteCommand, CONNECTION_LOST};

/// Helper script expected on every cluster host.
const HELPER: &str = "/usr/local/bin/clusterwatch-helper";

/// The remote command body for a command id, unless the config overrides it.
fn default_command(id: &str) -> Option<String> {
    let body = match id {
        "PingCommand" => "while :; do echo; sleep 5; done".to_string(),
        "GetHostInfo" => format!("{HELPER} host-info-daemon"),
        "ClusterStatus" => format!("{HELPER} cluster-status"),
        "DrbdEvents" => format!("{HELPER} drbd-events"),
        _ => return None,
    };
    Some(body)
}

#[derive(Debug, Clone)]
pub struct SshExecutor {
    settings: config::Ssh,
}

impl SshExecutor {
    pub fn new(settings: config::Ssh) -> Self {
        Self { settings }
    }

    fn command_body(&self, id: &str) -> io::Result<String> {
        if let Some(body) = self.settings.commands.get(id) {
            return Ok(body.clone());
        }
        default_command(id).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no remote command configured for '{id}'"),
            )
        })
    }

    fn ssh_command(&self, host: &Host, body: &str) -> Command {
        let mut command = Command::new("ssh");
        command.args(["-o", "BatchMode=yes", "-p"]);
        command.arg(host.port().to_string());
        if let Some(user) = &self.settings.user {
            command.args(["-l", user]);
        }
        command
            .args(&self.settings.options)
            .arg(host.name())
            .arg(body)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

impl Executor for SshExecutor {
    fn exec(&self, host: &Host, command: &str) -> io::Result<RemoteCommand> {
        let body = self.command_body(command)?;
        let mut child = self.ssh_command(host, &body).spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("ssh stdout was not captured"))?;

        let (output_tx, output_rx) = mpsc::channel(64);
        let (kill_tx, kill_rx) = oneshot::channel();

        let label = format!("{command}@{}", host.name());
        tokio::spawn(pump_output(label, child, stdout, output_tx, kill_rx));

        Ok(RemoteCommand::new(output_rx, kill_tx))
    }
}

/// Forward the child's stdout as chunks until it closes, then report the exit code. A kill
/// request (or the command handle being dropped) terminates the child.
async fn pump_output(
    label: String,
    mut child: Child,
    mut stdout: tokio::process::ChildStdout,
    output: mpsc::Sender<Output>,
    mut kill_rx: oneshot::Receiver<()>,
) {
    let mut decoder = Utf8Decoder::default();
    let mut buf = [0u8; 4096];
    let mut killed = false;

    loop {
        tokio::select! {
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    let text = decoder.decode(&buf[..n]);
                    if !text.is_empty() && output.send(Output::Chunk(text)).await.is_err() {
                        // Nobody is listening any more.
                        terminate(&child, &label);
                        break;
                    }
                }
                Err(e) => {
                    warn!("reading output of {label} failed: {e}");
                    break;
                }
            },
            _ = &mut kill_rx, if !killed => {
                killed = true;
                terminate(&child, &label);
            }
        }
    }

    let code = match child.wait().await {
        Ok(status) => exit_code(status),
        Err(e) => {
            warn!("waiting for {label} failed: {e}");
            CONNECTION_LOST
        }
    };
    debug!("{label} exited with {code}");
    let _ = output.send(Output::Exit(code)).await;
}

/// Send SIGTERM to the ssh client so that it exits with 143.
fn terminate(child: &Child, label: &str) {
    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!("could not terminate {label}: {e}");
    }
}

/// Shell convention: a process killed by signal N exits with 128 + N.
fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => CONNECTION_LOST,
    }
}

/// Turns arbitrary byte chunks into text without splitting multi-byte characters that straddle
/// a chunk boundary.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                text
            }
            // An incomplete character at the end: keep it for the next chunk.
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let text = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                text
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                text
            }
        }
    }
}
