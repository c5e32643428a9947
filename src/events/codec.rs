// Copyright 2020 The Arbor Core Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::bail;
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::Message;

/// Length of the fixed-width command field in a frame header.
pub const COMMAND_LENGTH: usize = 12;
/// Length of a frame header: payload length plus command.
pub const HEADER_LENGTH: usize = 4 + COMMAND_LENGTH;

/// Frames committee messages: a little-endian `u32` payload length, a
/// NUL-padded 12-byte command, and the payload itself.
#[derive(Debug)]
pub struct MessagesCodec {
    /// Maximum payload length in bytes.
    max_message_len: u32,
}

impl MessagesCodec {
    pub fn new(max_message_len: u32) -> Self {
        Self { max_message_len }
    }
}

impl Decoder for MessagesCodec {
    type Item = Message;
    type Error = anyhow::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < HEADER_LENGTH {
            return Ok(None);
        }

        let len = LittleEndian::read_u32(buf) as usize;
        if len > self.max_message_len as usize {
            bail!(
                "Received message is too long: received_len = {}, allowed_len = {}",
                len,
                self.max_message_len
            );
        }
        if buf.len() < HEADER_LENGTH + len {
            return Ok(None);
        }

        let frame = buf.split_to(HEADER_LENGTH + len);
        let command_bytes = &frame[4..HEADER_LENGTH];
        let command_end = command_bytes
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(COMMAND_LENGTH);
        let command = match std::str::from_utf8(&command_bytes[..command_end]) {
            Ok(command) => command,
            Err(_) => bail!("received frame with non-utf8 command"),
        };

        let message = Message::decode_payload(command, &frame[HEADER_LENGTH..])?;
        Ok(Some(message))
    }
}

impl Encoder<Message> for MessagesCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let command = msg.command();
        debug_assert!(command.len() <= COMMAND_LENGTH);

        let payload = msg.encode_payload();
        if payload.len() > self.max_message_len as usize {
            bail!(
                "Outgoing message is too long: len = {}, allowed_len = {}",
                payload.len(),
                self.max_message_len
            );
        }

        buf.reserve(HEADER_LENGTH + payload.len());
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(command.as_bytes());
        buf.put_bytes(0, COMMAND_LENGTH - command.len());
        buf.put_slice(&payload);
        Ok(())
    }
}
