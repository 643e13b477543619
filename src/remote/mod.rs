// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The boundary to the transport that runs status commands on remote hosts.
//!
//! The status channels never build shell text. They ask an `Executor` to run a command by its id
//! on a host, and read the command's output back as a stream of `Output` values ending in the
//! command's exit code.

use std::io;

use tokio::sync::{mpsc, oneshot};

use crate::host::Host;

pub mod ssh;

/// The connection to the host was lost (this is also what `ssh` itself exits with).
pub const CONNECTION_LOST: i32 = 255;

/// The command was terminated with SIGTERM, i.e. killed on request.
pub const KILLED_SIGTERM: i32 = 143;

/// Exit code the remote DRBD event helper uses when it was told to stop.
pub const KILLED_BY_REQUEST: i32 = 100;

/// One item of a running command's output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Some text the command wrote. Chunk boundaries are arbitrary.
    Chunk(String),
    /// The command ended. Always the last item.
    Exit(i32),
}

/// A command running on a remote host.
#[derive(Debug)]
pub struct RemoteCommand {
    output: mpsc::Receiver<Output>,
    kill: Option<oneshot::Sender<()>>,
}

impl RemoteCommand {
    /// Build a command handle from the receiving half of its output stream and a sender the
    /// executor listens on for kill requests.
    pub fn new(output: mpsc::Receiver<Output>, kill: oneshot::Sender<()>) -> Self {
        Self {
            output,
            kill: Some(kill),
        }
    }

    /// The next piece of output. `None` means the executor went away without reporting an exit
    /// code.
    pub async fn recv(&mut self) -> Option<Output> {
        self.output.recv().await
    }

    /// Ask the executor to force-kill the command. The exit code still arrives through `recv`.
    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

/// Runs named remote commands on hosts.
pub trait Executor: Send + Sync {
    /// Start `command` on `host`. An `Err` means the command could not even be started; a command
    /// that starts and then fails reports that through its exit code instead.
    fn exec(&self, host: &Host, command: &str) -> io::Result<RemoteCommand>;
}
