// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Tooling for tests: a scripted stand-in for the remote transport, a notifier that remembers
//! what it was told, and small fixtures.

use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::{mpsc, oneshot};

use crate::{
    cluster::Cluster,
    config::{Polling, Ssh},
    engine::StatusEngine,
    host::Host,
    manager::WatchContext,
    notify::{Change, Notifier},
    remote::{Executor, Output, RemoteCommand, KILLED_SIGTERM},
    Buffer, LogStream,
};

/// One step of a scripted remote command.
#[derive(Debug, Clone)]
pub enum Step {
    /// Write some output.
    Chunk(String),
    /// Pause. A kill request during the pause ends the command with 143.
    Sleep(Duration),
    /// End with this exit code.
    Exit(i32),
    /// Block until killed, then end with this exit code.
    UntilKilled(i32),
    /// Write this output over and over at the given interval, forever, ignoring kill requests.
    /// Models a transport that keeps delivering after being asked to stop.
    Repeat(String, Duration),
}

/// An `Executor` that plays back scripts instead of running anything.
///
/// Each (host, command id) pair has a queue of scripts; every `exec` takes the next one. When the
/// queue is empty the command produces no output and runs until killed.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<(String, String), VecDeque<Vec<Step>>>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a script for the next run of `command` on `host`.
    pub fn script(&self, host: &str, command: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .entry((host.to_string(), command.to_string()))
            .or_default()
            .push_back(steps);
    }

    /// How many times `command` was started on `host`.
    pub fn calls(&self, host: &str, command: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, c)| h == host && c == command)
            .count()
    }
}

impl Executor for ScriptedExecutor {
    fn exec(&self, host: &Host, command: &str) -> io::Result<RemoteCommand> {
        let key = (host.name().to_string(), command.to_string());
        self.calls.lock().unwrap().push(key.clone());
        let steps = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default();

        let (output_tx, output_rx) = mpsc::channel(16);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(play(steps, output_tx, kill_rx));
        Ok(RemoteCommand::new(output_rx, kill_tx))
    }
}

async fn play(steps: Vec<Step>, output: mpsc::Sender<Output>, mut kill_rx: oneshot::Receiver<()>) {
    for step in steps {
        match step {
            Step::Chunk(text) => {
                if output.send(Output::Chunk(text)).await.is_err() {
                    return;
                }
            }
            Step::Sleep(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {},
                    _ = &mut kill_rx => {
                        let _ = output.send(Output::Exit(KILLED_SIGTERM)).await;
                        return;
                    }
                }
            }
            Step::Exit(code) => {
                let _ = output.send(Output::Exit(code)).await;
                return;
            }
            Step::UntilKilled(code) => {
                let _ = (&mut kill_rx).await;
                let _ = output.send(Output::Exit(code)).await;
                return;
            }
            Step::Repeat(text, every) => loop {
                tokio::time::sleep(every).await;
                if output.send(Output::Chunk(text.clone())).await.is_err() {
                    return;
                }
            },
        }
    }

    let _ = kill_rx.await;
    let _ = output.send(Output::Exit(KILLED_SIGTERM)).await;
}

/// A `Notifier` that keeps every change it is given.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    changes: Mutex<Vec<Change>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn changes(&self) -> Vec<Change> {
        self.changes.lock().unwrap().clone()
    }

    pub fn count(&self, wanted: &Change) -> usize {
        self.changes
            .lock()
            .unwrap()
            .iter()
            .filter(|change| *change == wanted)
            .count()
    }

    pub fn clear(&self) {
        self.changes.lock().unwrap().clear();
    }
}

impl Notifier for RecordingNotifier {
    fn notify_changed(&self, change: Change) {
        self.changes.lock().unwrap().push(change);
    }
}

/// Polling intervals short enough for tests. The ping timeout is long so that idle hosts are not
/// disconnected behind a test's back.
pub fn test_polling() -> Polling {
    Polling {
        retry_interval_ms: 20,
        ping_timeout_ms: 10_000,
        kill_timeout_ms: 500,
    }
}

/// A context writing into a buffer, plus a handle on that buffer.
pub fn test_context_with_output(verbose: bool) -> (Arc<WatchContext>, Buffer) {
    let buffer = Buffer::new();
    let context = WatchContext {
        out_stream: LogStream::Buffer(buffer.clone()),
        verbose,
        polling: test_polling(),
        ssh: Ssh::default(),
    };
    (Arc::new(context), buffer)
}

pub fn test_context() -> Arc<WatchContext> {
    test_context_with_output(false).0
}

pub fn test_cluster(names: &[&str], context: Arc<WatchContext>) -> Arc<Cluster> {
    let hosts = names
        .iter()
        .map(|name| Arc::new(Host::new(name, Some(22))))
        .collect();
    Arc::new(Cluster::with_hosts("test", hosts, context))
}

/// Everything a test of the engine needs.
pub struct TestEngine {
    pub cluster: Arc<Cluster>,
    pub executor: Arc<ScriptedExecutor>,
    pub notifier: Arc<RecordingNotifier>,
    pub engine: StatusEngine,
}

pub fn test_engine(names: &[&str], context: Arc<WatchContext>) -> TestEngine {
    let cluster = test_cluster(names, context);
    let executor = Arc::new(ScriptedExecutor::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let engine = StatusEngine::new(
        Arc::clone(&cluster),
        Arc::clone(&executor) as Arc<dyn Executor>,
        Arc::clone(&notifier) as Arc<dyn Notifier>,
    );
    TestEngine {
        cluster,
        executor,
        notifier,
        engine,
    }
}

/// A complete CRM status frame with the given body lines.
pub fn crm_frame(lines: &[&str]) -> String {
    format!("---start---\r\n{}\r\n---done---\r\n", lines.join("\r\n"))
}

/// Poll `condition` until it holds or `timeout` passes. Returns whether it held.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
