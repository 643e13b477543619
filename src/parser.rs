// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Turning streamed command output into complete frames.
//!
//! Output arrives in chunks with arbitrary boundaries. Each accumulator here keeps the text it has
//! not been able to use yet, and only ever hands out a frame once its terminator has arrived, so
//! a frame is never parsed speculatively, lost, or delivered twice.

use std::collections::HashMap;

use log::debug;

pub const CRM_START: &str = "---start---";
pub const CRM_DONE: &str = "---done---";
/// Out-of-band marker the CRM status helper may emit anywhere, even inside a frame.
pub const CRM_RESET: &str = "---reset---\r\n";
/// The whole frame the CRM status helper sends when its own status query failed.
pub const CRM_ERROR_FRAME: &str = "---start---\r\nerror\r\n\r\n---done---\r\n";

/// Length of `---done---\r\n`, the tail that has to be present for a frame to be complete.
const CRM_DONE_TAIL: usize = 12;

/// The DRBD helper's "no cluster manager / not applicable" line.
pub const DRBD_NO_MANAGER: &str = "--nm--";
const DRBD_NO_DRIVER: &str = "No response from the DRBD driver";

#[derive(Debug, Clone, PartialEq)]
pub enum CrmFrame {
    /// The remote status query itself failed.
    Error,
    /// A complete frame, markers included.
    Status(String),
}

/// Accumulates CRM status output and extracts `---start---` ... `---done---` frames.
#[derive(Debug, Default)]
pub struct CrmFrames {
    buffer: String,
}

impl CrmFrames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Text received but not yet part of a complete frame.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Append a chunk and return the frame it completed, if any.
    ///
    /// When several frames have piled up only the newest is returned; older ones are stale.
    pub fn push(&mut self, chunk: &str) -> Option<CrmFrame> {
        self.buffer.push_str(chunk);
        self.strip_resets();

        let len = self.buffer.len();
        // A frame is only complete once its final newline is in, so that a `\r` at the end of a
        // chunk does not cut the frame short.
        if len < CRM_DONE_TAIL || !self.buffer.ends_with('\n') {
            return None;
        }
        match self.buffer.get(len - CRM_DONE_TAIL..) {
            Some(tail) if tail.trim() == CRM_DONE => {}
            _ => return None,
        }

        let frame = match self.buffer.rfind(CRM_START) {
            Some(start) => self.buffer[start..].to_string(),
            None => {
                debug!("discarding CRM output without a start marker");
                self.buffer.clear();
                return None;
            }
        };
        self.buffer.clear();

        if frame == CRM_ERROR_FRAME {
            Some(CrmFrame::Error)
        } else {
            Some(CrmFrame::Status(frame))
        }
    }

    fn strip_resets(&mut self) {
        // Removing one marker can splice together another, hence the loop.
        while let Some(i) = self.buffer.find(CRM_RESET) {
            self.buffer.replace_range(i..i + CRM_RESET.len(), "");
        }
    }
}

/// One `--<tag>-info-start--` ... `--<tag>-info-end--` block of the server-info stream.
#[derive(Debug, Clone, PartialEq)]
pub struct InfoBlock {
    pub tag: &'static str,
    pub timestamp: Option<f64>,
    pub body: String,
}

/// Accumulates server-info output and extracts tagged blocks in stream order.
#[derive(Debug)]
pub struct InfoBlocks {
    tags: &'static [&'static str],
    buffer: String,
    last_timestamp: HashMap<&'static str, f64>,
}

impl InfoBlocks {
    pub fn new(tags: &'static [&'static str]) -> Self {
        Self {
            tags,
            buffer: String::new(),
            last_timestamp: HashMap::new(),
        }
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Append a chunk and return every block it completed, oldest first. Blocks with a
    /// timestamp older than the last accepted block of the same tag are dropped.
    pub fn push(&mut self, chunk: &str) -> Vec<InfoBlock> {
        self.buffer.push_str(chunk);

        let mut blocks = Vec::new();
        while let Some((block, consumed)) = self.next_block() {
            self.buffer.drain(..consumed);
            if let Some(block) = block {
                blocks.push(block);
            }
        }

        if self.find_start().is_none() {
            // Only noise is left. Keep the unterminated last line in case it is the beginning
            // of a start marker.
            if let Some(newline) = self.buffer.rfind('\n') {
                self.buffer.drain(..=newline);
            }
        }

        blocks
    }

    /// Position and tag of the earliest start marker in the buffer.
    fn find_start(&self) -> Option<(usize, &'static str)> {
        self.tags
            .iter()
            .filter_map(|tag| {
                self.buffer
                    .find(&start_marker(tag))
                    .map(|position| (position, *tag))
            })
            .min_by_key(|(position, _)| *position)
    }

    /// The earliest complete block, and how many bytes of the buffer it (and any noise before
    /// it) used. The block is `None` when it was stale.
    fn next_block(&mut self) -> Option<(Option<InfoBlock>, usize)> {
        let (start, tag) = self.find_start()?;
        let start_marker = start_marker(tag);
        let end_marker = format!("--{tag}-info-end--");

        let header_start = start + start_marker.len();
        let header_end = header_start + self.buffer[header_start..].find('\n')?;
        let body_start = header_end + 1;
        let body_end = body_start + self.buffer[body_start..].find(&end_marker)?;

        let mut consumed = body_end + end_marker.len();
        let rest = &self.buffer[consumed..];
        if rest.starts_with("\r\n") {
            consumed += 2;
        } else if rest.starts_with('\n') {
            consumed += 1;
        } else if rest.is_empty() || rest == "\r" {
            // The line terminator has not arrived yet.
            return None;
        }

        let timestamp = self.buffer[header_start..header_end]
            .trim()
            .parse::<f64>()
            .ok();
        let body = self.buffer[body_start..body_end].to_string();

        if let Some(timestamp) = timestamp {
            if let Some(last) = self.last_timestamp.get(tag) {
                if timestamp < *last {
                    debug!("dropping stale {tag} info block");
                    return Some((None, consumed));
                }
            }
            self.last_timestamp.insert(tag, timestamp);
        }

        Some((
            Some(InfoBlock {
                tag,
                timestamp,
                body,
            }),
            consumed,
        ))
    }
}

fn start_marker(tag: &str) -> String {
    format!("--{tag}-info-start--")
}

#[derive(Debug, Clone, PartialEq)]
pub enum DrbdMessage {
    /// A `drbd` line: a refinement of the resource/volume to device and disk mapping.
    Config(String),
    /// An `event` line: a DRBD state transition.
    Event(String),
    /// DRBD status is not available on this host.
    NoManager,
}

/// Accumulates DRBD status output and extracts tagged lines.
#[derive(Debug, Default)]
pub struct DrbdLines {
    buffer: String,
}

impl DrbdLines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Append a chunk and return the messages of every line it completed, in order.
    pub fn push(&mut self, chunk: &str) -> Vec<DrbdMessage> {
        self.buffer.push_str(chunk);

        let mut messages = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(message) = classify_drbd_line(line) {
                messages.push(message);
            }
        }

        // Only carriage returns are trimmed: the rest of an unterminated line may still arrive,
        // and its spaces are significant.
        let trimmed = self.buffer.trim_end_matches('\r').len();
        self.buffer.truncate(trimmed);

        messages
    }
}

fn classify_drbd_line(line: &str) -> Option<DrbdMessage> {
    if line.trim() == DRBD_NO_MANAGER || line.contains(DRBD_NO_DRIVER) {
        return Some(DrbdMessage::NoManager);
    }
    if let Some(config) = line.strip_prefix("drbd ") {
        return Some(DrbdMessage::Config(config.trim().to_string()));
    }
    if let Some(event) = line.strip_prefix("event ") {
        return Some(DrbdMessage::Event(event.trim().to_string()));
    }
    if !line.trim().is_empty() {
        debug!("ignoring DRBD status line '{line}'");
    }
    None
}
