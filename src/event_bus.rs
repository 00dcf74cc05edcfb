/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Dispatch of published [events](crate::events) to user-registered handlers on a dedicated thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::events::*;
use crate::logging::Logger;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// Handlers for every kind of event. Fields a node never publishes simply stay empty.
#[derive(Default)]
pub(crate) struct EventHandlers {
    pub(crate) commit_block_handlers: Vec<HandlerPtr<CommitBlockEvent>>,
    pub(crate) consensus_halted_handlers: Vec<HandlerPtr<ConsensusHaltedEvent>>,
    pub(crate) invalid_context_hash_handlers: Vec<HandlerPtr<InvalidContextHashEvent>>,
    pub(crate) start_round_handlers: Vec<HandlerPtr<StartRoundEvent>>,
    pub(crate) round_timeout_handlers: Vec<HandlerPtr<RoundTimeoutEvent>>,
    pub(crate) ignore_formulator_handlers: Vec<HandlerPtr<IgnoreFormulatorEvent>>,
    pub(crate) send_block_req_handlers: Vec<HandlerPtr<SendBlockReqEvent>>,
    pub(crate) receive_block_gen_handlers: Vec<HandlerPtr<ReceiveBlockGenEvent>>,
    pub(crate) generate_block_handlers: Vec<HandlerPtr<GenerateBlockEvent>>,
    pub(crate) receive_ob_sign_handlers: Vec<HandlerPtr<ReceiveObSignEvent>>,
    pub(crate) receive_blocks_handlers: Vec<HandlerPtr<ReceiveBlocksEvent>>,
}

/// Push the default logger of `T` in front of the user's handler, if logging is enabled.
pub(crate) fn handlers_with_logger<T: Logger>(
    log_events: bool,
    user_handler: Option<HandlerPtr<T>>,
) -> Vec<HandlerPtr<T>> {
    let mut handlers: Vec<HandlerPtr<T>> = Vec::new();
    if log_events {
        handlers.push(T::get_logger());
    }
    if let Some(handler) = user_handler {
        handlers.push(handler);
    }
    handlers
}

impl EventHandlers {
    pub(crate) fn is_empty(&self) -> bool {
        self.commit_block_handlers.is_empty()
            && self.consensus_halted_handlers.is_empty()
            && self.invalid_context_hash_handlers.is_empty()
            && self.start_round_handlers.is_empty()
            && self.round_timeout_handlers.is_empty()
            && self.ignore_formulator_handlers.is_empty()
            && self.send_block_req_handlers.is_empty()
            && self.receive_block_gen_handlers.is_empty()
            && self.generate_block_handlers.is_empty()
            && self.receive_ob_sign_handlers.is_empty()
            && self.receive_blocks_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::CommitBlock(commit_block_event) => self
                .commit_block_handlers
                .iter()
                .for_each(|handler| handler(&commit_block_event)),

            Event::ConsensusHalted(consensus_halted_event) => self
                .consensus_halted_handlers
                .iter()
                .for_each(|handler| handler(&consensus_halted_event)),

            Event::InvalidContextHash(invalid_context_hash_event) => self
                .invalid_context_hash_handlers
                .iter()
                .for_each(|handler| handler(&invalid_context_hash_event)),

            Event::StartRound(start_round_event) => self
                .start_round_handlers
                .iter()
                .for_each(|handler| handler(&start_round_event)),

            Event::RoundTimeout(round_timeout_event) => self
                .round_timeout_handlers
                .iter()
                .for_each(|handler| handler(&round_timeout_event)),

            Event::IgnoreFormulator(ignore_formulator_event) => self
                .ignore_formulator_handlers
                .iter()
                .for_each(|handler| handler(&ignore_formulator_event)),

            Event::SendBlockReq(send_block_req_event) => self
                .send_block_req_handlers
                .iter()
                .for_each(|handler| handler(&send_block_req_event)),

            Event::ReceiveBlockGen(receive_block_gen_event) => self
                .receive_block_gen_handlers
                .iter()
                .for_each(|handler| handler(&receive_block_gen_event)),

            Event::GenerateBlock(generate_block_event) => self
                .generate_block_handlers
                .iter()
                .for_each(|handler| handler(&generate_block_event)),

            Event::ReceiveObSign(receive_ob_sign_event) => self
                .receive_ob_sign_handlers
                .iter()
                .for_each(|handler| handler(&receive_ob_sign_event)),

            Event::ReceiveBlocks(receive_blocks_event) => self
                .receive_blocks_handlers
                .iter()
                .for_each(|handler| handler(&receive_blocks_event)),
        }
    }
}

/// Start the thread that drains `event_subscriber` into `event_handlers` until `close` is set.
pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    close: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while !close.load(Ordering::Acquire) {
            match event_subscriber.recv_timeout(Duration::from_millis(50)) {
                Ok(event) => event_handlers.fire_handlers(event),
                Err(RecvTimeoutError::Timeout) => (),
                // Every publisher is gone, so no more events can arrive.
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    })
}
