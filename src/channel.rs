// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! A host status channel keeps one status command per (host, subsystem) running on a remote host
//! until it is stopped. The command's output is handed to a `StatusHandler`; when the command
//! ends, for whatever reason, the channel waits for the retry interval and runs it again.

use std::{fmt, sync::Arc, time::Duration};

use {
    log::{debug, info, warn},
    serde::Serialize,
    tokio::{sync::watch, task::JoinHandle},
    tokio_util::sync::CancellationToken,
};

use crate::{
    config::Polling,
    host::Host,
    remote::{Executor, Output, RemoteCommand, CONNECTION_LOST, KILLED_SIGTERM},
};

/// One polled aspect of a host. Every subsystem has its own channel and remote command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Subsystem {
    Ping,
    ServerInfo,
    CrmStatus,
    DrbdStatus,
}

impl Subsystem {
    pub const ALL: [Subsystem; 4] = [
        Subsystem::Ping,
        Subsystem::ServerInfo,
        Subsystem::CrmStatus,
        Subsystem::DrbdStatus,
    ];

    /// The id the executor knows this subsystem's remote command by.
    pub fn command_id(&self) -> &'static str {
        match self {
            Subsystem::Ping => "PingCommand",
            Subsystem::ServerInfo => "GetHostInfo",
            Subsystem::CrmStatus => "ClusterStatus",
            Subsystem::DrbdStatus => "DrbdEvents",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Subsystem::Ping => "ping",
                Subsystem::ServerInfo => "server-info",
                Subsystem::CrmStatus => "crm-status",
                Subsystem::DrbdStatus => "drbd-status",
            }
        )
    }
}

/// How one run of a status command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    pub code: i32,
    /// The channel was being stopped when the command ended.
    pub cancelled: bool,
}

impl Exit {
    pub fn connection_lost(&self) -> bool {
        self.code == CONNECTION_LOST
    }
}

/// The subsystem-specific half of a channel. All methods are called from the channel's own task,
/// one at a time, and never after `ChannelHandle::stop` has returned.
pub trait StatusHandler: Send + 'static {
    /// A new run of the command is about to start.
    fn restart(&mut self) {}

    /// Output from the command. Returns whether the text contained usable data, which releases
    /// the channel's loaded latch.
    fn chunk(&mut self, text: &str) -> bool;

    /// The command ended.
    fn done(&mut self, exit: Exit);

    /// The loaded latch was released. Called at most once per channel.
    fn loaded(&mut self) {}

    /// If set, `idle` is called whenever the command has been silent for this long.
    fn idle_timeout(&self) -> Option<Duration> {
        None
    }

    fn idle(&mut self) {}
}

pub struct Channel<H: StatusHandler> {
    host: Arc<Host>,
    subsystem: Subsystem,
    executor: Arc<dyn Executor>,
    polling: Polling,
    handler: H,
    cancel: CancellationToken,
    loaded: watch::Sender<bool>,
}

enum Event {
    Cancelled,
    Output(Option<Output>),
    Idle,
}

async fn idle_after(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

impl<H: StatusHandler> Channel<H> {
    /// Spawn the channel's task. It runs until `cancel` is cancelled.
    pub fn start(
        host: Arc<Host>,
        subsystem: Subsystem,
        executor: Arc<dyn Executor>,
        polling: Polling,
        handler: H,
        cancel: CancellationToken,
    ) -> ChannelHandle {
        let (loaded_tx, loaded_rx) = watch::channel(false);
        let channel = Channel {
            host: Arc::clone(&host),
            subsystem,
            executor,
            polling,
            handler,
            cancel: cancel.clone(),
            loaded: loaded_tx,
        };
        debug!("starting {subsystem} channel for {host}");
        let task = tokio::spawn(channel.run());

        ChannelHandle {
            host,
            subsystem,
            cancel,
            task,
            loaded: loaded_rx,
        }
    }

    async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.handler.restart();
            let exit = match self.executor.exec(&self.host, self.subsystem.command_id()) {
                Ok(command) => self.drive(command).await,
                Err(e) => {
                    warn!(
                        "could not start {} command on {}: {e}",
                        self.subsystem, self.host
                    );
                    Exit {
                        code: CONNECTION_LOST,
                        cancelled: self.cancel.is_cancelled(),
                    }
                }
            };
            self.log_exit(exit);

            self.handler.done(exit);
            self.release_latch();

            if exit.cancelled {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.polling.retry_interval()) => {},
                _ = self.cancel.cancelled() => break,
            }
        }
        debug!("{} channel for {} stopped", self.subsystem, self.host);
    }

    /// Feed the command's output to the handler until it exits or the channel is cancelled.
    async fn drive(&mut self, mut command: RemoteCommand) -> Exit {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Event::Cancelled,
                output = command.recv() => Event::Output(output),
                _ = idle_after(self.handler.idle_timeout()) => Event::Idle,
            };

            match event {
                Event::Cancelled => return self.kill(command).await,
                Event::Output(Some(Output::Chunk(text))) => {
                    if self.handler.chunk(&text) {
                        self.release_latch();
                    }
                }
                Event::Output(Some(Output::Exit(code))) => {
                    return Exit {
                        code,
                        cancelled: self.cancel.is_cancelled(),
                    }
                }
                Event::Output(None) => {
                    return Exit {
                        code: CONNECTION_LOST,
                        cancelled: self.cancel.is_cancelled(),
                    }
                }
                Event::Idle => self.handler.idle(),
            }
        }
    }

    /// Force-kill the command and wait for its exit code. Output arriving meanwhile is dropped. A
    /// command that does not report back within the kill timeout is taken to have been killed.
    async fn kill(&mut self, mut command: RemoteCommand) -> Exit {
        command.kill();
        let wait = async {
            loop {
                match command.recv().await {
                    Some(Output::Chunk(_)) => continue,
                    Some(Output::Exit(code)) => return code,
                    None => return KILLED_SIGTERM,
                }
            }
        };
        let code = match tokio::time::timeout(self.polling.kill_timeout(), wait).await {
            Ok(code) => code,
            Err(_) => {
                debug!(
                    "{} command on {} did not exit after being killed",
                    self.subsystem, self.host
                );
                KILLED_SIGTERM
            }
        };
        Exit {
            code,
            cancelled: true,
        }
    }

    fn log_exit(&self, exit: Exit) {
        let (subsystem, host, code) = (self.subsystem, &self.host, exit.code);
        if exit.cancelled {
            debug!("{subsystem} command on {host} ended with {code} while stopping");
        } else if exit.connection_lost() {
            warn!("{subsystem} command on {host}: connection lost");
        } else if code != 0 {
            info!("{subsystem} command on {host} exited with {code}");
        } else {
            debug!("{subsystem} command on {host} exited");
        }
    }

    /// Publish the handler's loaded notification, then wake the waiters, so that anyone woken
    /// already sees the notification.
    fn release_latch(&mut self) {
        let released = *self.loaded.borrow();
        if !released {
            self.handler.loaded();
            self.loaded.send_replace(true);
        }
    }
}

/// The caller's side of a running channel.
#[derive(Debug)]
pub struct ChannelHandle {
    host: Arc<Host>,
    subsystem: Subsystem,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    loaded: watch::Receiver<bool>,
}

impl ChannelHandle {
    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn subsystem(&self) -> Subsystem {
        self.subsystem
    }

    /// The channel's task has ended, because it was cancelled (or panicked).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// The channel has delivered data, or completed a run, at least once.
    pub fn loaded(&self) -> bool {
        *self.loaded.borrow()
    }

    /// A receiver that sees the loaded latch being released.
    pub fn subscribe_loaded(&self) -> watch::Receiver<bool> {
        self.loaded.clone()
    }

    /// Returns false if the channel ended without ever loading.
    pub async fn wait_loaded(&self) -> bool {
        let mut loaded = self.subscribe_loaded();
        let released = loaded.wait_for(|loaded| *loaded).await.is_ok();
        released
    }

    /// Cancel the channel and wait for its task to end. Once this returns the handler will not be
    /// called again.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(
                "{} channel for {} ended abnormally: {e}",
                self.subsystem, self.host
            );
        }
    }
}
