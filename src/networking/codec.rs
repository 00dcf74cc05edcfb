/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Framing of [`Message`]s on a byte stream.
//!
//! A frame is the message's [type code](Message::type_code) as a little-endian `u16`, the body length as
//! a little-endian `u32`, and the borsh-encoded body.

use std::fmt::{self, Display, Formatter};
use std::io::{self, Read, Write};

use super::messages::{Message, MessageDecodeError};

/// Bodies longer than this are refused without reading them.
pub const MAX_BODY_LENGTH: u32 = 64 * 1024 * 1024;

const HEADER_LENGTH: usize = 6;

#[derive(Debug)]
pub enum CodecError {
    Io(io::Error),
    InvalidLength(u32),
    UnknownMessage(u16),
    InvalidBody(String),
}

impl From<io::Error> for CodecError {
    fn from(error: io::Error) -> Self {
        CodecError::Io(error)
    }
}

impl From<MessageDecodeError> for CodecError {
    fn from(error: MessageDecodeError) -> Self {
        match error {
            MessageDecodeError::UnknownMessage(code) => CodecError::UnknownMessage(code),
            MessageDecodeError::InvalidBody(reason) => CodecError::InvalidBody(reason),
        }
    }
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Io(error) => write!(f, "io: {}", error),
            CodecError::InvalidLength(length) => write!(f, "invalid frame length {}", length),
            CodecError::UnknownMessage(code) => write!(f, "unknown message type {:#06x}", code),
            CodecError::InvalidBody(reason) => write!(f, "invalid message body: {}", reason),
        }
    }
}

/// The complete frame of `message`.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, CodecError> {
    let body = message.encode_body();
    let length = u32::try_from(body.len())
        .ok()
        .filter(|length| *length <= MAX_BODY_LENGTH)
        .ok_or(CodecError::InvalidLength(u32::MAX))?;

    let mut frame = Vec::with_capacity(HEADER_LENGTH + body.len());
    frame.extend_from_slice(&message.type_code().to_le_bytes());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn write_frame<W: Write>(writer: &mut W, message: &Message) -> Result<(), CodecError> {
    let frame = encode_frame(message)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one whole frame. Blocks until the frame is complete or the reader fails.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Message, CodecError> {
    let mut header = [0u8; HEADER_LENGTH];
    reader.read_exact(&mut header)?;
    let type_code = u16::from_le_bytes([header[0], header[1]]);
    let length = u32::from_le_bytes([header[2], header[3], header[4], header[5]]);
    if length > MAX_BODY_LENGTH {
        return Err(CodecError::InvalidLength(length));
    }

    let mut body = vec![0u8; length as usize];
    reader.read_exact(&mut body)?;
    Ok(Message::decode_body(type_code, &body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use crate::block_sync::messages::{RequestMessage, StatusMessage};
    use crate::types::basic::{BlockHeight, CryptoHash};

    #[test]
    fn frames_arrive_whole_and_in_order() {
        let first: Message = RequestMessage {
            height: BlockHeight::new(3),
            count: 10,
        }
        .into();
        let second: Message = StatusMessage {
            version: 1,
            height: BlockHeight::new(9),
            last_hash: CryptoHash::new([1; 32]),
        }
        .into();

        let mut stream = Vec::new();
        write_frame(&mut stream, &first).unwrap();
        write_frame(&mut stream, &second).unwrap();

        let mut reader = Cursor::new(stream);
        assert_eq!(read_frame(&mut reader).unwrap(), first);
        assert_eq!(read_frame(&mut reader).unwrap(), second);
        assert!(matches!(read_frame(&mut reader), Err(CodecError::Io(_))));
    }

    #[test]
    fn oversized_length_is_refused() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&0u16.to_le_bytes());
        frame.extend_from_slice(&(MAX_BODY_LENGTH + 1).to_le_bytes());
        assert!(matches!(
            read_frame(&mut Cursor::new(frame)),
            Err(CodecError::InvalidLength(length)) if length == MAX_BODY_LENGTH + 1
        ));
    }

    #[test]
    fn truncated_body_is_an_io_error() {
        let message: Message = RequestMessage {
            height: BlockHeight::new(3),
            count: 1,
        }
        .into();
        let mut frame = encode_frame(&message).unwrap();
        frame.pop();
        assert!(matches!(
            read_frame(&mut Cursor::new(frame)),
            Err(CodecError::Io(_))
        ));
    }
}
