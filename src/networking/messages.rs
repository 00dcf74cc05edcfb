/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The messages that travel over the network, and their wire type codes.
//!
//! Every message kind has a stable 16-bit type code: the first two bytes (little-endian) of the SHA-256
//! hash of the kind's qualified name, for example `pof.RoundVoteMessage`. Transports put the code in
//! front of the borsh-encoded body, see [codec](super::codec).

use borsh::{BorshDeserialize, BorshSerialize};

use crate::block_sync::messages::{BlockMessage, RequestMessage, StatusMessage};
use crate::formulator::messages::TransactionMessage;
use crate::observer::messages::{
    BlockGenMessage, BlockGenRequestMessage, BlockObSignMessage, BlockReqMessage,
    BlockVoteMessage, RoundVoteAckMessage, RoundVoteMessage,
};
use crate::types::crypto_primitives::hash_bytes;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    RoundVote(RoundVoteMessage),
    RoundVoteAck(RoundVoteAckMessage),
    BlockReq(BlockReqMessage),
    BlockGen(BlockGenMessage),
    BlockGenRequest(BlockGenRequestMessage),
    BlockVote(BlockVoteMessage),
    BlockObSign(BlockObSignMessage),
    Status(StatusMessage),
    Request(RequestMessage),
    Block(BlockMessage),
    Transaction(TransactionMessage),
}

/// Qualified names of every message kind, in the order of [`Message`]'s variants.
const MESSAGE_NAMES: [&str; 11] = [
    "pof.RoundVoteMessage",
    "pof.RoundVoteAckMessage",
    "pof.BlockReqMessage",
    "pof.BlockGenMessage",
    "pof.BlockGenRequestMessage",
    "pof.BlockVoteMessage",
    "pof.BlockObSignMessage",
    "pof.StatusMessage",
    "pof.RequestMessage",
    "pof.BlockMessage",
    "pof.TransactionMessage",
];

/// The type code of the message kind called `name`.
pub fn type_code(name: &str) -> u16 {
    let digest = hash_bytes(name.as_bytes());
    u16::from_le_bytes([digest.as_bytes()[0], digest.as_bytes()[1]])
}

#[derive(Debug)]
pub enum MessageDecodeError {
    UnknownMessage(u16),
    InvalidBody(String),
}

impl Message {
    fn index(&self) -> usize {
        match self {
            Message::RoundVote(_) => 0,
            Message::RoundVoteAck(_) => 1,
            Message::BlockReq(_) => 2,
            Message::BlockGen(_) => 3,
            Message::BlockGenRequest(_) => 4,
            Message::BlockVote(_) => 5,
            Message::BlockObSign(_) => 6,
            Message::Status(_) => 7,
            Message::Request(_) => 8,
            Message::Block(_) => 9,
            Message::Transaction(_) => 10,
        }
    }

    pub fn name(&self) -> &'static str {
        MESSAGE_NAMES[self.index()]
    }

    pub fn type_code(&self) -> u16 {
        type_code(self.name())
    }

    /// The borsh encoding of the message body, without the type code.
    pub fn encode_body(&self) -> Vec<u8> {
        let encoded = match self {
            Message::RoundVote(message) => message.try_to_vec(),
            Message::RoundVoteAck(message) => message.try_to_vec(),
            Message::BlockReq(message) => message.try_to_vec(),
            Message::BlockGen(message) => message.try_to_vec(),
            Message::BlockGenRequest(message) => message.try_to_vec(),
            Message::BlockVote(message) => message.try_to_vec(),
            Message::BlockObSign(message) => message.try_to_vec(),
            Message::Status(message) => message.try_to_vec(),
            Message::Request(message) => message.try_to_vec(),
            Message::Block(message) => message.try_to_vec(),
            Message::Transaction(message) => message.try_to_vec(),
        };
        // Serializing into a Vec never fails.
        encoded.unwrap_or_default()
    }

    /// Decode a body received under `type_code`.
    pub fn decode_body(type_code: u16, body: &[u8]) -> Result<Message, MessageDecodeError> {
        let index = MESSAGE_NAMES
            .iter()
            .position(|name| self::type_code(name) == type_code)
            .ok_or(MessageDecodeError::UnknownMessage(type_code))?;

        fn decode<T: BorshDeserialize>(body: &[u8]) -> Result<T, MessageDecodeError> {
            T::try_from_slice(body).map_err(|error| MessageDecodeError::InvalidBody(error.to_string()))
        }

        let message = match index {
            0 => Message::RoundVote(decode(body)?),
            1 => Message::RoundVoteAck(decode(body)?),
            2 => Message::BlockReq(decode(body)?),
            3 => Message::BlockGen(decode(body)?),
            4 => Message::BlockGenRequest(decode(body)?),
            5 => Message::BlockVote(decode(body)?),
            6 => Message::BlockObSign(decode(body)?),
            7 => Message::Status(decode(body)?),
            8 => Message::Request(decode(body)?),
            9 => Message::Block(decode(body)?),
            _ => Message::Transaction(decode(body)?),
        };
        Ok(message)
    }
}

macro_rules! impl_from_for_message {
    ($($message:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$message> for Message {
                fn from(message: $message) -> Message {
                    Message::$variant(message)
                }
            }
        )*
    };
}

impl_from_for_message!(
    RoundVoteMessage => RoundVote,
    RoundVoteAckMessage => RoundVoteAck,
    BlockReqMessage => BlockReq,
    BlockGenMessage => BlockGen,
    BlockGenRequestMessage => BlockGenRequest,
    BlockVoteMessage => BlockVote,
    BlockObSignMessage => BlockObSign,
    StatusMessage => Status,
    RequestMessage => Request,
    BlockMessage => Block,
    TransactionMessage => Transaction,
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::types::basic::{BlockHeight, CryptoHash};

    #[test]
    fn type_codes_are_distinct() {
        let codes: HashSet<u16> = MESSAGE_NAMES.iter().map(|name| type_code(name)).collect();
        assert_eq!(codes.len(), MESSAGE_NAMES.len());
    }

    #[test]
    fn unknown_type_code_is_rejected() {
        let unused = (0..=u16::MAX)
            .find(|code| MESSAGE_NAMES.iter().all(|name| type_code(name) != *code))
            .unwrap();
        assert!(matches!(
            Message::decode_body(unused, &[]),
            Err(MessageDecodeError::UnknownMessage(code)) if code == unused
        ));
    }

    #[test]
    fn body_decodes_under_its_own_code() {
        let status: Message = StatusMessage {
            version: 1,
            height: BlockHeight::new(12),
            last_hash: CryptoHash::new([4; 32]),
        }
        .into();
        let decoded = Message::decode_body(status.type_code(), &status.encode_body()).unwrap();
        assert_eq!(decoded, status);

        let request = RequestMessage {
            height: BlockHeight::new(1),
            count: 10,
        };
        assert!(matches!(
            Message::decode_body(status.type_code(), &request.try_to_vec().unwrap()),
            Err(MessageDecodeError::InvalidBody(_))
        ));
    }
}
