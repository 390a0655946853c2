// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Continuous read loop of a connection.
//!
//! The loop is one spawned task per connection that keeps a single physical
//! read outstanding. Each completed read becomes a chunk which runs through
//! the inbound augmentation passes and is then fanned out as a raw chunk
//! event, a line event, or both, depending on which modes were enabled.
//!
//! Modes are additive: subscribing to chunks or lines enables the matching
//! mode, and enabling a second mode only widens what the running loop
//! dispatches. The loop ends when a read fails, the peer closes, or a
//! subscriber returns an error; in every case the connection is
//! force-stopped.
//!
//! A line is only detected when the decoded chunk itself ends with the read
//! terminator, so a terminator split across two reads is not recognised
//! until a later chunk ends with one.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, trace};

use crate::{AppError, AppResult};

use super::encoding::{TextDecoder, TextEncoding};
use super::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    RawChunk,
    Line,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEngineState {
    Stopped,
    RawOnly,
    LineOnly,
    Both,
}

/// Per-connection read loop bookkeeping.
#[derive(Debug, Default)]
pub struct ReadState {
    raw: bool,
    line: bool,
    loop_running: bool,
    /// decoded text not yet terminated
    accumulator: String,
    decoder: Option<TextDecoder>,
}

impl ReadState {
    fn enable(&mut self, mode: ReadMode) {
        match mode {
            ReadMode::RawChunk => self.raw = true,
            ReadMode::Line => self.line = true,
        }
    }

    pub fn engine_state(&self) -> ReadEngineState {
        match (self.raw, self.line) {
            (false, false) => ReadEngineState::Stopped,
            (true, false) => ReadEngineState::RawOnly,
            (false, true) => ReadEngineState::LineOnly,
            (true, true) => ReadEngineState::Both,
        }
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulator
    }

    /// Appends the decoded chunk and returns the finished line, terminator
    /// stripped, when the chunk ends with `terminator`.
    fn accumulate(
        &mut self,
        chunk: &[u8],
        encoding: TextEncoding,
        terminator: &str,
    ) -> Option<String> {
        if self.decoder.as_ref().map(TextDecoder::encoding) != Some(encoding) {
            self.decoder = Some(encoding.decoder());
        }
        let decoded = self
            .decoder
            .get_or_insert_with(|| encoding.decoder())
            .decode(chunk);
        self.accumulator.push_str(&decoded);
        if !decoded.ends_with(terminator) {
            return None;
        }
        let mut line = std::mem::take(&mut self.accumulator);
        line.truncate(line.len() - terminator.len());
        Some(line)
    }
}

impl Connection {
    pub fn read_engine_state(&self) -> ReadEngineState {
        self.read_state.lock().engine_state()
    }

    /// Text the line mode has buffered but not yet dispatched.
    pub fn pending_line(&self) -> String {
        self.read_state.lock().accumulated().to_string()
    }

    /// Adds `mode` to the active read modes.
    ///
    /// The first mode starts the loop (immediately when online, otherwise on
    /// `start`); further modes join the running loop without a new read.
    pub fn enable_read_mode(self: &Arc<Self>, mode: ReadMode) {
        let before = {
            let mut state = self.read_state.lock();
            let before = state.engine_state();
            state.enable(mode);
            before
        };
        debug!(
            "connection {} read engine {:?} -> {:?}",
            self.id(),
            before,
            self.read_engine_state()
        );
        self.arm_read_loop();
    }

    /// Spawns the loop unless it already runs, no mode is active, or the
    /// connection is not online.
    pub(super) fn arm_read_loop(self: &Arc<Self>) {
        {
            let mut state = self.read_state.lock();
            if state.loop_running
                || state.engine_state() == ReadEngineState::Stopped
                || !self.is_online()
            {
                return;
            }
            state.loop_running = true;
        }
        let connection = self.clone();
        tokio::spawn(async move {
            connection.read_loop().await;
        });
    }

    async fn read_loop(self: Arc<Self>) {
        trace!("connection {} read loop started", self.id());
        loop {
            let max_chunk_size = self.options().max_chunk_size;
            let chunk = match self.physical_read(max_chunk_size).await {
                Ok(chunk) if chunk.is_empty() => {
                    debug!("connection {} closed by peer", self.id());
                    break;
                }
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!("connection {} read loop ends: {}", self.id(), e);
                    break;
                }
            };
            if let Err(e) = self.handle_chunk(chunk) {
                error!("connection {} subscriber failed: {}", self.id(), e);
                break;
            }
            if !self.is_online() {
                break;
            }
        }
        self.read_state.lock().loop_running = false;
        self.force_stop().await;
        trace!("connection {} read loop exited", self.id());
    }

    /// Runs one chunk through the inbound chain and the active modes.
    pub(super) fn handle_chunk(&self, chunk: Bytes) -> AppResult<()> {
        let chain = self.augmentations().snapshot();
        let chunk = chain.receive_bytes(chunk);

        let engine_state = self.read_engine_state();
        if engine_state == ReadEngineState::Stopped {
            return Err(AppError::IllegalStateError(format!(
                "connection {} dispatching without an active read mode",
                self.id()
            )));
        }

        if matches!(engine_state, ReadEngineState::RawOnly | ReadEngineState::Both) {
            self.subscribers.dispatch_chunk(&chunk)?;
        }

        if matches!(engine_state, ReadEngineState::LineOnly | ReadEngineState::Both) {
            let options = self.options();
            let line = self.read_state.lock().accumulate(
                &chunk,
                options.receive_encoding,
                &options.read_line_terminator,
            );
            if let Some(line) = line {
                let line = chain.receive_line(line, options.receive_encoding);
                self.subscribers.dispatch_line(&line)?;
            }
        }
        Ok(())
    }
}
