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

//! Length-prefixed message framing.
//!
//! A frame is text in the connection's encoding:
//!
//! ```text
//! 0000000005<#!#>hello
//! ^ 10 digits ^ separator ^ payload
//! ```
//!
//! The length counts characters of the payload, not bytes. The header is
//! therefore always [`HEADER_LEN`] characters. All four constants are part of
//! the wire contract.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{trace, warn};

use crate::service::MultiClientServer;
use crate::{AppError, AppResult};

use super::encoding::{TextDecoder, TextEncoding};
use super::registry::ClientId;
use super::Connection;

pub const LENGTH_FIELD_WIDTH: usize = 10;
pub const SEPARATOR: &str = "<#!#>";
pub const HEADER_LEN: usize = 15;
/// Most messages extracted per chunk event; the rest wait for the next one.
pub const DRAIN_CAP: usize = 10;

pub fn format_message(text: &str) -> String {
    format!(
        "{:0width$}{}{}",
        text.chars().count(),
        SEPARATOR,
        text,
        width = LENGTH_FIELD_WIDTH
    )
}

/// Reassembles frames from arbitrarily split input.
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: String,
    /// declared payload length of the frame at the front, `None` while the
    /// header is still incomplete
    pending_len: Option<usize>,
    /// payload characters of the pending frame counted so far, and the byte
    /// offset in `buffer` where counting resumes
    scanned_chars: usize,
    scan_pos: usize,
    max_message_len: usize,
    decoder: Option<TextDecoder>,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        FrameAssembler::new(crate::service::DEFAULT_MAX_MESSAGE_LEN)
    }
}

impl FrameAssembler {
    pub fn new(max_message_len: usize) -> Self {
        FrameAssembler {
            buffer: String::new(),
            pending_len: None,
            scanned_chars: 0,
            scan_pos: HEADER_LEN,
            max_message_len,
            decoder: None,
        }
    }

    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    pub fn pending_len(&self) -> Option<usize> {
        self.pending_len
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.pending_len = None;
        self.scanned_chars = 0;
        self.scan_pos = HEADER_LEN;
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.reset();
        }
    }

    /// Decodes a raw chunk and feeds it to [`FrameAssembler::push`].
    pub fn push_bytes(&mut self, chunk: &[u8], encoding: TextEncoding) -> AppResult<Vec<String>> {
        if self.decoder.as_ref().map(TextDecoder::encoding) != Some(encoding) {
            self.decoder = Some(encoding.decoder());
        }
        let text = self
            .decoder
            .get_or_insert_with(|| encoding.decoder())
            .decode(chunk);
        self.push(&text)
    }

    /// Appends `text` and extracts at most [`DRAIN_CAP`] complete messages.
    pub fn push(&mut self, text: &str) -> AppResult<Vec<String>> {
        self.buffer.push_str(text);
        let mut messages = Vec::new();
        while messages.len() < DRAIN_CAP {
            let len = match self.pending_len {
                Some(len) => len,
                None => match self.parse_header()? {
                    Some(len) => {
                        self.pending_len = Some(len);
                        self.scanned_chars = 0;
                        self.scan_pos = HEADER_LEN;
                        len
                    }
                    None => break,
                },
            };
            let Some(end) = self.scan_payload(len) else {
                break;
            };
            let message = self.buffer[HEADER_LEN..end].to_string();
            self.buffer.drain(..end);
            self.pending_len = None;
            trace!("frame of {} chars extracted", len);
            messages.push(message);
        }
        Ok(messages)
    }

    /// Counts payload characters not seen by earlier pushes and returns the
    /// byte offset where the pending payload ends once `len` are buffered.
    ///
    /// Every buffered character is visited once per frame.
    fn scan_payload(&mut self, len: usize) -> Option<usize> {
        let mut chars = self.buffer[self.scan_pos..].chars();
        while self.scanned_chars < len {
            let c = chars.next()?;
            self.scan_pos += c.len_utf8();
            self.scanned_chars += 1;
        }
        Some(self.scan_pos)
    }

    fn parse_header(&self) -> AppResult<Option<usize>> {
        let Some(position) = self.buffer.find(SEPARATOR) else {
            if self.buffer.len() >= HEADER_LEN {
                return Err(AppError::MalformedProtocol(format!(
                    "no frame separator in {:?}",
                    self.buffer.chars().take(HEADER_LEN).collect::<String>()
                )));
            }
            return Ok(None);
        };
        let digits = &self.buffer[..position];
        if digits.len() != LENGTH_FIELD_WIDTH || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AppError::MalformedProtocol(format!(
                "frame length {:?} is not a {}-digit number",
                digits, LENGTH_FIELD_WIDTH
            )));
        }
        let len: usize = digits
            .parse()
            .map_err(|e| AppError::MalformedProtocol(format!("frame length {:?}: {}", digits, e)))?;
        if len > self.max_message_len {
            return Err(AppError::MalformedProtocol(format!(
                "frame of {} chars exceeds limit of {}",
                len, self.max_message_len
            )));
        }
        Ok(Some(len))
    }
}

fn check_outbound(text: &str, max_message_len: usize) -> AppResult<String> {
    let len = text.chars().count();
    if len > max_message_len {
        return Err(AppError::InvalidValue(format!(
            "message of {} chars exceeds limit of {}",
            len, max_message_len
        )));
    }
    Ok(format_message(text))
}

pub type MessageCallback = Arc<dyn Fn(&str) -> AppResult<()> + Send + Sync>;
pub type ClientMessageCallback = Arc<dyn Fn(&ClientId, &str) -> AppResult<()> + Send + Sync>;

/// Message framing over a single connection.
pub struct MessageChannel {
    connection: Arc<Connection>,
    assembler: Mutex<FrameAssembler>,
    subscribers: RwLock<Vec<MessageCallback>>,
}

impl MessageChannel {
    /// Subscribes to the connection's chunk events.
    pub fn attach(connection: &Arc<Connection>) -> Arc<Self> {
        let channel = Arc::new(MessageChannel {
            connection: connection.clone(),
            assembler: Mutex::new(FrameAssembler::new(connection.options().max_message_len)),
            subscribers: RwLock::new(Vec::new()),
        });
        let weak: Weak<MessageChannel> = Arc::downgrade(&channel);
        connection.subscribe_chunk(move |chunk| match weak.upgrade() {
            Some(channel) => channel.on_chunk(chunk),
            None => Ok(()),
        });
        channel
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn subscribe_message<F>(&self, callback: F)
    where
        F: Fn(&str) -> AppResult<()> + Send + Sync + 'static,
    {
        self.subscribers.write().push(Arc::new(callback));
    }

    pub async fn send_message(&self, text: &str) -> AppResult<()> {
        let options = self.connection.options();
        let frame = check_outbound(text, options.max_message_len)?;
        self.connection
            .direct_write(&options.send_encoding.encode(&frame))
            .await
    }

    fn on_chunk(&self, chunk: &Bytes) -> AppResult<()> {
        let encoding = self.connection.options().receive_encoding;
        let pushed = {
            let mut assembler = self.assembler.lock();
            let pushed = assembler.push_bytes(chunk, encoding);
            if pushed.is_err() {
                assembler.reset();
            }
            pushed
        };
        let messages = match pushed {
            Ok(messages) => messages,
            Err(e) => {
                warn!("connection {} bad frame: {}", self.connection.id(), e);
                return self.connection.posture().degrade(e);
            }
        };
        let subscribers = self.subscribers.read().clone();
        for message in messages {
            for subscriber in &subscribers {
                subscriber(&message)?;
            }
        }
        Ok(())
    }
}

/// Message framing over every client of a [`MultiClientServer`], one
/// assembler per client. Received messages carry the sender's id.
pub struct ServerMessageChannel {
    server: Arc<MultiClientServer>,
    assemblers: DashMap<ClientId, FrameAssembler>,
    subscribers: RwLock<Vec<ClientMessageCallback>>,
}

impl ServerMessageChannel {
    pub fn attach(server: &Arc<MultiClientServer>) -> Arc<Self> {
        let channel = Arc::new(ServerMessageChannel {
            server: server.clone(),
            assemblers: DashMap::new(),
            subscribers: RwLock::new(Vec::new()),
        });
        let weak = Arc::downgrade(&channel);
        server.subscribe_chunk(move |client_id, chunk| match weak.upgrade() {
            Some(channel) => channel.on_chunk(client_id, chunk),
            None => Ok(()),
        });
        let weak = Arc::downgrade(&channel);
        server.subscribe_client_disconnected(move |client_id| {
            if let Some(channel) = weak.upgrade() {
                channel.assemblers.remove(client_id);
            }
        });
        channel
    }

    pub fn server(&self) -> &Arc<MultiClientServer> {
        &self.server
    }

    pub fn subscribe_message<F>(&self, callback: F)
    where
        F: Fn(&ClientId, &str) -> AppResult<()> + Send + Sync + 'static,
    {
        self.subscribers.write().push(Arc::new(callback));
    }

    pub async fn send_message(&self, client_id: &ClientId, text: &str) -> AppResult<()> {
        let options = self.server.options();
        let frame = check_outbound(text, options.max_message_len)?;
        self.server
            .direct_write(client_id, &options.send_encoding.encode(&frame))
            .await
    }

    /// Sends `text` to every connected client except `except`, returning how
    /// many clients it reached. Failing clients are skipped.
    pub async fn broadcast(&self, text: &str, except: Option<&ClientId>) -> AppResult<usize> {
        let options = self.server.options();
        let frame = options
            .send_encoding
            .encode(&check_outbound(text, options.max_message_len)?);
        let mut delivered = 0;
        for client_id in self.server.list_clients() {
            if Some(&client_id) == except {
                continue;
            }
            match self.server.direct_write(&client_id, &frame).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("broadcast to client {} failed: {}", client_id, e),
            }
        }
        Ok(delivered)
    }

    fn on_chunk(&self, client_id: &ClientId, chunk: &Bytes) -> AppResult<()> {
        let options = self.server.options();
        let pushed = {
            let mut assembler = self
                .assemblers
                .entry(client_id.clone())
                .or_insert_with(|| FrameAssembler::new(options.max_message_len));
            let pushed = assembler.push_bytes(chunk, options.receive_encoding);
            if pushed.is_err() {
                assembler.reset();
            }
            pushed
        };
        let messages = match pushed {
            Ok(messages) => messages,
            Err(e) => {
                warn!("client {} bad frame: {}", client_id, e);
                return self.server.posture().degrade(e);
            }
        };
        let subscribers = self.subscribers.read().clone();
        for message in messages {
            for subscriber in &subscribers {
                subscriber(client_id, &message)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    use super::*;
    use crate::network::ConnectionState;
    use crate::{ConnectionOptions, Posture};

    #[test]
    fn test_format_hello() {
        assert_eq!(SEPARATOR.chars().count(), 5);
        assert_eq!(HEADER_LEN, LENGTH_FIELD_WIDTH + SEPARATOR.len());
        assert_eq!(format_message("hello"), "0000000005<#!#>hello");
    }

    #[test]
    fn test_decode_hello() -> AppResult<()> {
        let mut assembler = FrameAssembler::default();
        let messages = assembler.push("0000000005<#!#>hello")?;
        assert_eq!(messages, vec!["hello".to_string()]);
        assert!(assembler.buffered().is_empty());
        assert_eq!(assembler.pending_len(), None);
        Ok(())
    }

    #[rstest]
    #[case("hello")]
    #[case("")]
    #[case("héllo wörld ✓")]
    #[case("contains <#!#> the separator")]
    fn test_every_split_point_round_trips(#[case] text: &str) -> AppResult<()> {
        let wire = TextEncoding::Utf8.encode(&format_message(text));
        for first in 0..=wire.len() {
            for second in first..=wire.len() {
                let mut assembler = FrameAssembler::default();
                let mut out = Vec::new();
                out.extend(assembler.push_bytes(&wire[..first], TextEncoding::Utf8)?);
                out.extend(assembler.push_bytes(&wire[first..second], TextEncoding::Utf8)?);
                out.extend(assembler.push_bytes(&wire[second..], TextEncoding::Utf8)?);
                assert_eq!(out, vec![text.to_string()], "split at {}/{}", first, second);
            }
        }
        Ok(())
    }

    #[test]
    fn test_drain_cap_defers_eleventh_message() -> AppResult<()> {
        let wire: String = (0..11).map(|i| format_message(&format!("m{}", i))).collect();
        let mut assembler = FrameAssembler::default();
        let first = assembler.push(&wire)?;
        assert_eq!(first.len(), DRAIN_CAP);
        assert_eq!(first[9], "m9");
        let second = assembler.push("")?;
        assert_eq!(second, vec!["m10".to_string()]);
        Ok(())
    }

    #[test]
    fn test_malformed_headers() {
        let mut assembler = FrameAssembler::default();
        assert!(matches!(
            assembler.push("00000abcde<#!#>x"),
            Err(AppError::MalformedProtocol(_))
        ));
        let mut assembler = FrameAssembler::default();
        assert!(assembler.push("5<#!#>hello").is_err());
        let mut assembler = FrameAssembler::default();
        assert!(assembler.push("this is not a frame header").is_err());
        let mut assembler = FrameAssembler::new(4);
        assert!(assembler.push("0000000005<#!#>hello").is_err());
    }

    #[test]
    fn test_waits_for_full_payload() -> AppResult<()> {
        let mut assembler = FrameAssembler::default();
        assert!(assembler.push("0000000005<#!#>hel")?.is_empty());
        assert_eq!(assembler.pending_len(), Some(5));
        assert_eq!(assembler.push("lo00000")?, vec!["hello".to_string()]);
        assert_eq!(assembler.buffered(), "00000");
        Ok(())
    }

    #[test]
    fn test_large_frame_in_small_chunks() -> AppResult<()> {
        let text: String = "aé✓".chars().cycle().take(1_500_000).collect();
        let wire = TextEncoding::Utf8.encode(&format_message(&text));
        let mut assembler = FrameAssembler::default();
        let mut out = Vec::new();
        for chunk in wire.chunks(2048) {
            out.extend(assembler.push_bytes(chunk, TextEncoding::Utf8)?);
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], text);
        assert!(assembler.buffered().is_empty());
        assert_eq!(assembler.pending_len(), None);
        Ok(())
    }

    #[test]
    fn test_pending_frame_survives_following_header() -> AppResult<()> {
        let mut assembler = FrameAssembler::default();
        assert!(assembler.push("0000000003<#!#>é")?.is_empty());
        assert!(assembler.push("✓")?.is_empty());
        let wire = format!("a{}", format_message("next"));
        assert_eq!(
            assembler.push(&wire)?,
            vec!["é✓a".to_string(), "next".to_string()]
        );
        Ok(())
    }

    async fn channel_pair(posture: Posture) -> (Arc<MessageChannel>, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(8192);
        let connection = Arc::new(
            Connection::new(Box::new(local), ConnectionOptions::single_client())
                .with_posture(posture),
        );
        connection.start().await.unwrap();
        (MessageChannel::attach(&connection), remote)
    }

    #[tokio::test]
    async fn test_channel_send_and_receive() -> AppResult<()> {
        let (channel, mut remote) = channel_pair(Posture::Strict).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.subscribe_message(move |message| {
            let _ = tx.send(message.to_string());
            Ok(())
        });

        channel.send_message("hello").await?;
        let mut buf = vec![0u8; 20];
        remote.read_exact(&mut buf).await?;
        assert_eq!(buf, b"0000000005<#!#>hello");

        remote.write_all(b"0000000003<#!#>a").await?;
        remote.write_all(b"bc0000000001<#!#>z").await?;
        assert_eq!(rx.recv().await.unwrap(), "abc");
        assert_eq!(rx.recv().await.unwrap(), "z");
        Ok(())
    }

    #[tokio::test]
    async fn test_channel_batches_per_chunk() -> AppResult<()> {
        let (channel, mut remote) = channel_pair(Posture::Strict).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.subscribe_message(move |message| {
            let _ = tx.send(message.to_string());
            Ok(())
        });

        let wire: String = (0..11).map(|i| format_message(&format!("m{}", i))).collect();
        remote.write_all(wire.as_bytes()).await?;
        for i in 0..10 {
            assert_eq!(rx.recv().await.unwrap(), format!("m{}", i));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        // a chunk carrying only part of a header releases the deferred frame
        remote.write_all(b"00000").await?;
        assert_eq!(rx.recv().await.unwrap(), "m10");
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_frame_follows_posture() -> AppResult<()> {
        let (strict, mut remote) = channel_pair(Posture::Strict).await;
        remote.write_all(b"xxxxxxxxxx<#!#>boom").await?;
        tokio::time::timeout(Duration::from_secs(5), async {
            while strict.connection().state() != ConnectionState::Closed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("strict channel should close the connection");

        let (lenient, mut remote) = channel_pair(Posture::Lenient).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        lenient.subscribe_message(move |message| {
            let _ = tx.send(message.to_string());
            Ok(())
        });
        remote.write_all(b"xxxxxxxxxx<#!#>boom").await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        remote.write_all(b"0000000002<#!#>ok").await?;
        assert_eq!(rx.recv().await.unwrap(), "ok");
        assert!(lenient.connection().is_online());
        Ok(())
    }
}
