/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the node's configuration
//! ([observer](crate::config::ObserverConfiguration), [formulator](crate::config::FormulatorConfiguration)).
//!
//! Pof-rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages printed onto
//! a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [ReceiveBlockGen](crate::events::ReceiveBlockGenEvent) is printed:
//!
//! ```text
//! ReceiveBlockGen, 1701329264, Id5u7f6, fNGCJyk, 12
//! ```
//!
//! In the snippet:
//! - The third value is the first seven characters of the Base64 encoding of the identity of the peer
//!   that delivered the block.
//! - The fourth value is the first seven characters of the Base64 encoding of the hash of the block.
//! - The fifth value is the height of the block.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use std::time::SystemTime;

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const COMMIT_BLOCK: &str = "CommitBlock";
pub const CONSENSUS_HALTED: &str = "ConsensusHalted";
pub const INVALID_CONTEXT_HASH: &str = "InvalidContextHash";

pub const START_ROUND: &str = "StartRound";
pub const ROUND_TIMEOUT: &str = "RoundTimeout";
pub const IGNORE_FORMULATOR: &str = "IgnoreFormulator";
pub const SEND_BLOCK_REQ: &str = "SendBlockReq";
pub const RECEIVE_BLOCK_GEN: &str = "ReceiveBlockGen";

pub const GENERATE_BLOCK: &str = "GenerateBlock";
pub const RECEIVE_OB_SIGN: &str = "ReceiveObSign";

pub const RECEIVE_BLOCKS: &str = "ReceiveBlocks";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for CommitBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |commit_block_event: &CommitBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                COMMIT_BLOCK,
                secs_since_unix_epoch(commit_block_event.timestamp),
                first_seven_base64_chars(commit_block_event.block.as_bytes()),
                commit_block_event.height,
                first_seven_base64_chars(commit_block_event.generator.as_bytes()),
                commit_block_event.transactions
            )
        };
        Box::new(logger)
    }
}

impl Logger for ConsensusHaltedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |consensus_halted_event: &ConsensusHaltedEvent| {
            log::error!(
                "{}, {}, {}",
                CONSENSUS_HALTED,
                secs_since_unix_epoch(consensus_halted_event.timestamp),
                consensus_halted_event.reason
            )
        };
        Box::new(logger)
    }
}

impl Logger for InvalidContextHashEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |invalid_context_hash_event: &InvalidContextHashEvent| {
            log::error!(
                "{}, {}, {}, {}, {}, {}, {}",
                INVALID_CONTEXT_HASH,
                secs_since_unix_epoch(invalid_context_hash_event.timestamp),
                first_seven_base64_chars(invalid_context_hash_event.block.as_bytes()),
                invalid_context_hash_event.height,
                first_seven_base64_chars(invalid_context_hash_event.generator.as_bytes()),
                first_seven_base64_chars(invalid_context_hash_event.expected.as_bytes()),
                first_seven_base64_chars(invalid_context_hash_event.computed.as_bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for StartRoundEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_round_event: &StartRoundEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                START_ROUND,
                secs_since_unix_epoch(start_round_event.timestamp),
                start_round_event.target_height,
                start_round_event.timeout_count,
                first_seven_base64_chars(start_round_event.formulator.as_bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for RoundTimeoutEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |round_timeout_event: &RoundTimeoutEvent| {
            log::info!(
                "{}, {}, {}, {}",
                ROUND_TIMEOUT,
                secs_since_unix_epoch(round_timeout_event.timestamp),
                round_timeout_event.target_height,
                first_seven_base64_chars(round_timeout_event.formulator.as_bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for IgnoreFormulatorEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |ignore_formulator_event: &IgnoreFormulatorEvent| {
            log::info!(
                "{}, {}, {}, {}",
                IGNORE_FORMULATOR,
                secs_since_unix_epoch(ignore_formulator_event.timestamp),
                first_seven_base64_chars(ignore_formulator_event.formulator.as_bytes()),
                ignore_formulator_event.duration.as_secs()
            )
        };
        Box::new(logger)
    }
}

impl Logger for SendBlockReqEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |send_block_req_event: &SendBlockReqEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                SEND_BLOCK_REQ,
                secs_since_unix_epoch(send_block_req_event.timestamp),
                first_seven_base64_chars(send_block_req_event.formulator.as_bytes()),
                send_block_req_event.target_height,
                send_block_req_event.timeout_count
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveBlockGenEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_block_gen_event: &ReceiveBlockGenEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_BLOCK_GEN,
                secs_since_unix_epoch(receive_block_gen_event.timestamp),
                first_seven_base64_chars(&receive_block_gen_event.origin.to_bytes()),
                first_seven_base64_chars(receive_block_gen_event.block.as_bytes()),
                receive_block_gen_event.height
            )
        };
        Box::new(logger)
    }
}

impl Logger for GenerateBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |generate_block_event: &GenerateBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                GENERATE_BLOCK,
                secs_since_unix_epoch(generate_block_event.timestamp),
                first_seven_base64_chars(generate_block_event.block.as_bytes()),
                generate_block_event.height,
                generate_block_event.transactions
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveObSignEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_ob_sign_event: &ReceiveObSignEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_OB_SIGN,
                secs_since_unix_epoch(receive_ob_sign_event.timestamp),
                first_seven_base64_chars(receive_ob_sign_event.origin.as_bytes()),
                first_seven_base64_chars(receive_ob_sign_event.block.as_bytes()),
                receive_ob_sign_event.height,
                receive_ob_sign_event.signatures
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveBlocksEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_blocks_event: &ReceiveBlocksEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_BLOCKS,
                secs_since_unix_epoch(receive_blocks_event.timestamp),
                first_seven_base64_chars(&receive_blocks_event.peer.to_bytes()),
                receive_blocks_event.first_height,
                receive_blocks_event.blocks
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
