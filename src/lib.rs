// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    collections::VecDeque,
    io::{self, Write},
    sync::{Arc, Mutex},
};

pub mod channel;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod crm;
pub mod drbd;
pub mod engine;
pub mod host;
pub mod manager;
pub mod notify;
pub mod parser;
pub mod remote;
pub mod test_env;

/// Gets the port that ssh should connect to when a host entry does not name one.
pub fn default_ssh_port() -> u16 {
    match std::env::var("CLUSTERWATCH_SSH_PORT") {
        Ok(port) => port
            .parse::<u16>()
            .expect("CLUSTERWATCH_SSH_PORT must be a valid port number"),
        Err(_) => 22,
    }
}

pub fn default_socket() -> String {
    match std::env::var("CLUSTERWATCH_SOCKET") {
        Ok(sock) => sock,
        Err(_) => "/var/run/clusterwatch.socket".to_string(),
    }
}

pub fn default_config_path() -> String {
    match std::env::var("CLUSTERWATCH_CONFIG") {
        Ok(conf) => conf,
        Err(_) => "/etc/clusterwatch/clusterwatch.conf".to_string(),
    }
}

/// Where verbose status-change lines are written.
///
/// In production this is stdout. Tests swap in a `Buffer` so they can read back the lines the
/// watcher produced and assert on them.
#[derive(Debug)]
pub enum LogStream {
    Stdout,
    Buffer(Buffer),
}

impl LogStream {
    pub fn new_stdout() -> Self {
        LogStream::Stdout
    }

    pub fn writeln(&self, line: &str) -> io::Result<()> {
        match self {
            LogStream::Stdout => {
                let mut out = io::stdout().lock();
                writeln!(out, "{line}")
            }
            LogStream::Buffer(buffer) => {
                buffer.push(line);
                Ok(())
            }
        }
    }
}

/// A shared, in-memory line buffer. Clones share the same lines.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, line: &str) {
        self.lines.lock().unwrap().push_back(line.to_string());
    }

    /// Remove and return the oldest line that has not been read yet.
    pub fn next_line(&self) -> Option<String> {
        self.lines.lock().unwrap().pop_front()
    }

    /// Copy of every unread line, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().iter().cloned().collect()
    }
}
