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

//! Text encodings negotiated per connection.
//!
//! Physical reads split the byte stream at arbitrary points, so decoding goes
//! through a [`TextDecoder`] that carries an incomplete multi-byte sequence
//! over to the next chunk instead of mangling it.

use serde::{Deserialize, Serialize};

const REPLACEMENT: char = '\u{FFFD}';

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextEncoding {
    #[default]
    Utf8,
    /// 7-bit ASCII, anything else becomes `?`
    Ascii,
    /// ISO-8859-1, one byte per character
    Latin1,
}

impl TextEncoding {
    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            TextEncoding::Utf8 => text.as_bytes().to_vec(),
            TextEncoding::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
            TextEncoding::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
        }
    }

    /// Stateless decode of a complete byte sequence.
    pub fn decode(&self, bytes: &[u8]) -> String {
        let mut decoder = self.decoder();
        let mut text = decoder.decode(bytes);
        text.push_str(&decoder.finish());
        text
    }

    pub fn decoder(&self) -> TextDecoder {
        TextDecoder {
            encoding: *self,
            carry: Vec::new(),
        }
    }
}

/// Incremental decoder for one direction of one connection.
#[derive(Debug, Clone)]
pub struct TextDecoder {
    encoding: TextEncoding,
    carry: Vec<u8>,
}

impl TextDecoder {
    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    /// Decodes `bytes`, holding back a trailing incomplete UTF-8 sequence.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        match self.encoding {
            TextEncoding::Ascii => bytes
                .iter()
                .map(|&b| if b.is_ascii() { b as char } else { '?' })
                .collect(),
            TextEncoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            TextEncoding::Utf8 => {
                self.carry.extend_from_slice(bytes);
                let pending = std::mem::take(&mut self.carry);
                let mut text = String::with_capacity(pending.len());
                let mut rest = &pending[..];
                loop {
                    match std::str::from_utf8(rest) {
                        Ok(valid) => {
                            text.push_str(valid);
                            break;
                        }
                        Err(e) => {
                            let (valid, after) = rest.split_at(e.valid_up_to());
                            text.push_str(std::str::from_utf8(valid).unwrap_or_default());
                            match e.error_len() {
                                Some(len) => {
                                    text.push(REPLACEMENT);
                                    rest = &after[len..];
                                }
                                None => {
                                    self.carry = after.to_vec();
                                    break;
                                }
                            }
                        }
                    }
                }
                text
            }
        }
    }

    /// Flushes whatever is still carried, as replacement characters.
    pub fn finish(&mut self) -> String {
        if self.carry.is_empty() {
            String::new()
        } else {
            self.carry.clear();
            REPLACEMENT.to_string()
        }
    }

    pub fn reset(&mut self) {
        self.carry.clear();
    }
}
