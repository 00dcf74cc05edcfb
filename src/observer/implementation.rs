/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The observer thread: the voting state machine of Proof-of-Formulator consensus.
//!
//! The thread owns the current [`VoteRound`] and is its only writer. It wakes up for every consensus
//! message the poller hands it, and on every tick of the [watchdog](ObserverProcess::on_tick).
//!
//! ## Rounds
//!
//! A round decides which formulator produces the blocks of one turn, starting right after the local tip:
//! 1. **RoundVote.** Every observer broadcasts the formulator it prefers: the best ranked formulator it is
//!    not ignoring, together with that formulator's index in the rank table as the timeout count. Once a
//!    supermajority of votes is in (and either every observer voted or one more tick passed), the observer
//!    pins itself to the vote with the largest `(timeout_count, sender)`, whose sender becomes the leader
//!    of the turn.
//! 2. **RoundVoteAck.** Every observer broadcasts an ack of the vote it pinned. A quorum of agreeing acks
//!    settles the round. The leader then asks the formulator for blocks with a `BlockReq`.
//! 3. **BlockWait.** The observer waits for the formulator's block at the target height and checks it
//!    ([`validate_block_gen`](ObserverProcess::validate_block_gen)).
//! 4. **BlockVote.** The observer broadcasts its signature over the block, and commits the block once a
//!    quorum of observers signed it. The leader returns the certificate to the formulator.
//!
//! After a commit the round moves on to the next height of the turn, or starts a fresh round when the
//! turn is over.
//!
//! ## Timeouts
//!
//! A round that makes no progress for `round_timeout_ticks` ticks is abandoned. Its formulator is ignored
//! for a while, and a fresh round votes for the next best formulator.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use crate::block_sync::server::local_status;
use crate::chain::{Chain, ChainError};
use crate::config::ObserverConfiguration;
use crate::consensus::{Consensus, ConsensusError, ConsensusState};
use crate::events::*;
use crate::networking::messages::Message;
use crate::networking::network::{Network, PeerID};
use crate::networking::sending::SenderHandle;
use crate::rank_table::RankTableError;
use crate::types::basic::{timestamp_now, Address, BlockHeight, ChainID, CryptoHash, PublicHash};
use crate::types::block::{Block, BlockSign};
use crate::types::crypto_primitives::{Keypair, RecoverableSignature};

use super::messages::*;
use super::vote_round::{RoundState, VoteRound};

/// Blocks stamped further than this into the future are refused.
const MAX_FUTURE_BLOCK_TIME_NS: u64 = 10_000_000_000;

/// How many of the next candidates an observer pings with its status after a commit.
const STATUS_FANOUT: usize = 3;

/// Formulators an observer refuses to vote for, with the instant each one may be voted for again.
pub(crate) type IgnoreMap = Arc<Mutex<HashMap<Address, Instant>>>;

pub(crate) fn lock_ignore_map(
    ignore_map: &IgnoreMap,
) -> std::sync::MutexGuard<'_, HashMap<Address, Instant>> {
    ignore_map
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) struct ObserverProcess<C: Chain, N: Network> {
    consensus: Consensus<C>,
    sender: SenderHandle<N>,
    keypair: Keypair,
    me: PublicHash,
    chain_id: ChainID,
    tick_interval: Duration,
    round_timeout_ticks: u32,
    ignore_duration: Duration,
    repeat_ignore_duration: Duration,
    block_gen_request_interval: Duration,

    round: VoteRound<C::Context>,
    /// Whether the round moved forward since the last tick.
    progressed: bool,
    future_round_votes: HashMap<PublicHash, RoundVoteMessage>,
    future_round_vote_acks: HashMap<PublicHash, RoundVoteAckMessage>,
    ignore_map: IgnoreMap,
    last_ignored: HashMap<Address, Instant>,
    event_publisher: Option<Sender<Event>>,
}

impl<C: Chain, N: Network> ObserverProcess<C, N> {
    pub(crate) fn new(
        configuration: &ObserverConfiguration,
        consensus: Consensus<C>,
        network: N,
        ignore_map: IgnoreMap,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        let keypair = Keypair::new(configuration.me.clone());
        let me = keypair.public_hash();
        let target_height = consensus.chain().height().next();
        Self {
            consensus,
            sender: SenderHandle::new(network),
            keypair,
            me,
            chain_id: configuration.chain_id,
            tick_interval: configuration.tick_interval,
            round_timeout_ticks: configuration.round_timeout_ticks.max(1),
            ignore_duration: configuration.ignore_duration,
            repeat_ignore_duration: configuration.repeat_ignore_duration,
            block_gen_request_interval: configuration.block_gen_request_interval,
            round: VoteRound::new(target_height, 1),
            progressed: false,
            future_round_votes: HashMap::new(),
            future_round_vote_acks: HashMap::new(),
            ignore_map,
            last_ignored: HashMap::new(),
            event_publisher,
        }
    }

    pub(crate) fn on_message(&mut self, origin: PeerID, message: Message) {
        if self.consensus.is_halted() {
            return;
        }
        self.follow_chain();

        let result = match message {
            Message::RoundVote(round_vote) => self.on_round_vote(origin, round_vote),
            Message::RoundVoteAck(round_vote_ack) => self.on_round_vote_ack(origin, round_vote_ack),
            Message::BlockGen(block_gen) => self.on_block_gen(origin, block_gen),
            Message::BlockGenRequest(request) => self.on_block_gen_request(origin, request),
            Message::BlockVote(block_vote) => self.on_block_vote(origin, block_vote),
            _ => Ok(()),
        };
        if let Err(error) = result {
            log::debug!("dropped message from {}: {}", origin, error);
        }
    }

    /// Drive the round on a timer: settle votes that only wait for time to pass, ask for missing blocks,
    /// and give up on a round that stopped making progress.
    pub(crate) fn on_tick(&mut self) {
        if self.consensus.is_halted() {
            return;
        }
        let now = Instant::now();
        lock_ignore_map(&self.ignore_map).retain(|_, until| *until > now);
        self.follow_chain();

        match self.round.state {
            RoundState::RoundVote => self.try_settle_round_votes(),
            RoundState::BlockWait => self.request_block_gen(),
            _ => (),
        }

        if self.progressed {
            self.progressed = false;
            self.round.vote_fail_count = 0;
            return;
        }
        self.round.vote_fail_count += 1;
        if self.round.vote_fail_count >= self.round_timeout_ticks {
            self.on_round_timeout();
        }
    }

    /// Start a fresh round right after the local tip.
    pub(crate) fn start_round(&mut self) {
        let state = self.consensus.snapshot();
        let (height, last_hash) = self.consensus.chain().last_status();
        let target_height = height.next();

        let ignored: HashSet<Address> = lock_ignore_map(&self.ignore_map).keys().copied().collect();
        let active: HashSet<Address> = state
            .rank_table()
            .candidates()
            .iter()
            .map(|rank| rank.address)
            .filter(|address| !ignored.contains(address))
            .collect();
        let chosen = state
            .rank_table()
            .top_rank_in_map(&active)
            .or_else(|_| state.rank_table().top_rank(0).map(|rank| (rank, 0)));
        let (rank, timeout_count) = match chosen {
            Ok(chosen) => chosen,
            Err(error) => {
                log::error!("no formulator to vote for: {}", error);
                self.round = VoteRound::new(target_height, 1);
                return;
            }
        };

        self.round = VoteRound::new(target_height, state.remain_blocks(timeout_count));
        self.progressed = true;

        let my_vote = Signed::new(
            RoundVote {
                chain_id: self.chain_id,
                last_hash,
                target_height,
                timeout_count,
                formulator: rank.address,
                formulator_public_hash: rank.public_hash,
                timestamp: timestamp_now(),
                is_reply: false,
            },
            &self.keypair,
        );
        self.round.add_round_vote(self.me, my_vote.clone());
        self.round.my_vote = Some(my_vote.clone());
        self.sender.broadcast_to_observers(my_vote);

        log::debug!(
            "start round at {} for {} (timeout count {})",
            target_height,
            rank.address,
            timeout_count
        );
        Event::StartRound(StartRoundEvent {
            timestamp: SystemTime::now(),
            target_height,
            timeout_count,
            formulator: rank.address,
        })
        .publish(&self.event_publisher);

        self.replay_future_messages();
        if self.round.state == RoundState::RoundVote {
            self.try_settle_round_votes();
        }
    }

    /// Re-align the round with the chain after blocks were connected by block sync.
    fn follow_chain(&mut self) {
        let tip = self.consensus.chain().height();
        if tip < self.round.target_height {
            return;
        }
        let next = tip.next();
        let within_turn = self.round.min_round_vote_ack.is_some() && self.round.in_turn(next);
        if within_turn {
            self.round.block_round_map.retain(|height, _| *height >= next);
            self.round.block_gen_wait.retain(|height, _| *height >= next);
            self.round.target_height = next;
            self.round.state = RoundState::BlockWait;
            self.progressed = true;
            self.process_block_gen_wait();
        } else {
            self.start_round();
        }
    }

    fn replay_future_messages(&mut self) {
        let first_height = self.round.first_height;
        let round_votes: Vec<(PublicHash, RoundVoteMessage)> =
            self.future_round_votes.drain().collect();
        let round_vote_acks: Vec<(PublicHash, RoundVoteAckMessage)> =
            self.future_round_vote_acks.drain().collect();

        for (sender, round_vote) in round_votes {
            if round_vote.body.target_height >= first_height {
                let _ = self.on_round_vote(PeerID::Observer(sender), round_vote);
            }
        }
        for (sender, round_vote_ack) in round_vote_acks {
            if round_vote_ack.body.target_height >= first_height {
                let _ = self.on_round_vote_ack(PeerID::Observer(sender), round_vote_ack);
            }
        }
    }

    fn on_round_vote(
        &mut self,
        origin: PeerID,
        round_vote: RoundVoteMessage,
    ) -> Result<(), ObserverError> {
        let signer = round_vote
            .signer()
            .map_err(|_| ObserverError::InvalidObserverKey)?;
        let state = self.consensus.snapshot();
        check_observer(&state, &origin, &signer)?;

        let vote = &round_vote.body;
        if vote.target_height < self.round.first_height {
            self.sender
                .send(origin, local_status(self.consensus.chain()));
            return Ok(());
        }
        if vote.target_height > self.round.first_height {
            self.future_round_votes.insert(signer, round_vote);
            return Ok(());
        }
        self.check_round_fields(
            &state,
            vote.chain_id,
            vote.last_hash,
            vote.timeout_count,
            vote.formulator,
            vote.formulator_public_hash,
        )?;

        if !vote.is_reply && signer != self.me {
            self.reply_round(origin);
        }
        if !self.round.add_round_vote(signer, round_vote) {
            return Err(ObserverError::AlreadyVoted);
        }
        if self.round.state == RoundState::RoundVote {
            self.try_settle_round_votes();
        }
        Ok(())
    }

    fn on_round_vote_ack(
        &mut self,
        origin: PeerID,
        round_vote_ack: RoundVoteAckMessage,
    ) -> Result<(), ObserverError> {
        let signer = round_vote_ack
            .signer()
            .map_err(|_| ObserverError::InvalidObserverKey)?;
        let state = self.consensus.snapshot();
        check_observer(&state, &origin, &signer)?;

        let ack = &round_vote_ack.body;
        if ack.target_height < self.round.first_height {
            self.sender
                .send(origin, local_status(self.consensus.chain()));
            return Ok(());
        }
        if ack.target_height > self.round.first_height {
            self.future_round_vote_acks.insert(signer, round_vote_ack);
            return Ok(());
        }
        self.check_round_fields(
            &state,
            ack.chain_id,
            ack.last_hash,
            ack.timeout_count,
            ack.formulator,
            ack.formulator_public_hash,
        )?;
        if !state.is_observer(&ack.public_hash) {
            return Err(ObserverError::InvalidVote);
        }

        if !ack.is_reply && signer != self.me {
            self.reply_round(origin);
        }
        if let Some(known) = self.round.round_vote_acks.get(&signer) {
            if known.body.agrees_with(ack) {
                return Err(ObserverError::AlreadyVoted);
            }
        }
        self.round.round_vote_acks.insert(signer, round_vote_ack);
        if self.round.state <= RoundState::RoundVoteAck {
            self.try_settle_round_vote_acks();
        }
        Ok(())
    }

    /// Check the fields shared by round votes and acks against the local tip and rank table.
    fn check_round_fields(
        &self,
        state: &ConsensusState,
        chain_id: ChainID,
        last_hash: CryptoHash,
        timeout_count: u32,
        formulator: Address,
        formulator_public_hash: PublicHash,
    ) -> Result<(), ObserverError> {
        if chain_id != self.chain_id || last_hash != self.consensus.chain().last_hash() {
            return Err(ObserverError::InvalidVote);
        }
        let rank = state
            .rank_table()
            .top_rank(timeout_count)
            .map_err(|_| ObserverError::InvalidVote)?;
        if rank.address != formulator || rank.public_hash != formulator_public_hash {
            return Err(ObserverError::InvalidVote);
        }
        Ok(())
    }

    /// Send my vote and ack to an observer that may have missed them.
    fn reply_round(&mut self, origin: PeerID) {
        if let Some(my_vote) = &self.round.my_vote {
            let mut vote = my_vote.body.clone();
            vote.is_reply = true;
            self.sender.send(origin, Signed::new(vote, &self.keypair));
        }
        if let Some(my_ack) = &self.round.my_ack {
            let mut ack = my_ack.body.clone();
            ack.is_reply = true;
            self.sender.send(origin, Signed::new(ack, &self.keypair));
        }
    }

    /// Pin this observer to one round vote once a supermajority voted and every vote that is coming in
    /// time has arrived.
    fn try_settle_round_votes(&mut self) {
        let state = self.consensus.snapshot();
        let votes = self.round.round_votes.len();
        if votes < state.supermajority() {
            self.round.supermajority_since = None;
            return;
        }
        let since = *self
            .round
            .supermajority_since
            .get_or_insert_with(Instant::now);
        if votes < state.observer_count() && since.elapsed() < self.tick_interval {
            return;
        }

        let (leader, chosen) = match self.round.chosen_round_vote() {
            Some((leader, chosen)) => (leader, chosen.body.clone()),
            None => return,
        };
        let my_ack = Signed::new(
            RoundVoteAck {
                chain_id: chosen.chain_id,
                last_hash: chosen.last_hash,
                target_height: chosen.target_height,
                timeout_count: chosen.timeout_count,
                formulator: chosen.formulator,
                formulator_public_hash: chosen.formulator_public_hash,
                public_hash: leader,
                timestamp: timestamp_now(),
                is_reply: false,
            },
            &self.keypair,
        );
        self.round.round_vote_acks.insert(self.me, my_ack.clone());
        self.round.my_ack = Some(my_ack.clone());
        self.round.state = RoundState::RoundVoteAck;
        self.progressed = true;
        self.sender.broadcast_to_observers(my_ack);

        self.try_settle_round_vote_acks();
    }

    /// Settle the round on the ack a quorum of observers agree on.
    fn try_settle_round_vote_acks(&mut self) {
        let state = self.consensus.snapshot();
        let ack = match self.round.ack_with_quorum(state.quorum()) {
            Some(ack) => ack,
            None => return,
        };

        self.round
            .allocate_block_rounds(state.remain_blocks(ack.timeout_count));
        self.round.target_height = self.round.first_height;
        self.round.state = RoundState::BlockWait;
        self.round.first_time = Instant::now();
        self.round.min_round_vote_ack = Some(ack.clone());
        self.progressed = true;

        if ack.public_hash == self.me {
            self.sender.send(
                PeerID::Formulator(ack.formulator),
                BlockReqMessage {
                    prev_hash: ack.last_hash,
                    target_height: ack.target_height,
                    timeout_count: ack.timeout_count,
                    formulator: ack.formulator,
                    formulator_public_hash: ack.formulator_public_hash,
                },
            );
            Event::SendBlockReq(SendBlockReqEvent {
                timestamp: SystemTime::now(),
                formulator: ack.formulator,
                target_height: ack.target_height,
                timeout_count: ack.timeout_count,
            })
            .publish(&self.event_publisher);
        }

        self.process_block_gen_wait();
    }

    fn process_block_gen_wait(&mut self) {
        let target_height = self.round.target_height;
        self.round
            .block_gen_wait
            .retain(|height, _| *height >= target_height);
        if self.round.state != RoundState::BlockWait {
            return;
        }
        if let Some((origin, block_gen)) = self.round.block_gen_wait.remove(&target_height) {
            if let Err(error) = self.on_block_gen(origin, block_gen) {
                log::debug!("dropped waiting block {} from {}: {}", target_height, origin, error);
            }
        }
    }

    fn on_block_gen(&mut self, origin: PeerID, block_gen: BlockGenMessage) -> Result<(), ObserverError> {
        let height = block_gen.block.height();
        if height <= self.consensus.chain().height() {
            return Ok(());
        }

        let ready = self.round.state == RoundState::BlockWait && height == self.round.target_height;
        if !ready {
            let max_blocks = self.consensus.snapshot().max_blocks_per_formulator();
            let in_reach = height >= self.round.target_height
                && height < self.round.first_height + max_blocks;
            let has_block = self
                .round
                .block_round_map
                .get(&height)
                .map_or(false, |block_round| block_round.block_gen.is_some());
            if in_reach && !has_block {
                self.round
                    .block_gen_wait
                    .entry(height)
                    .or_insert((origin, block_gen));
            }
            return Ok(());
        }

        let context = self.validate_block_gen(&block_gen)?;
        let block_sign = block_gen.block_sign();
        let my_vote = BlockVoteMessage {
            target_height: height,
            header: block_gen.block.header.clone(),
            generator_signature: block_gen.generator_signature,
            observer_signature: self.keypair.sign(&block_sign.hash()),
            is_reply: false,
        };

        Event::ReceiveBlockGen(ReceiveBlockGenEvent {
            timestamp: SystemTime::now(),
            origin,
            block: block_sign.header_hash,
            height,
        })
        .publish(&self.event_publisher);

        let block_round = self
            .round
            .block_round(height)
            .ok_or(ObserverError::InvalidRoundState)?;
        block_round.block_gen = Some(block_gen);
        block_round.context = Some(context);
        block_round.block_votes.insert(self.me, my_vote.clone());
        self.round.state = RoundState::BlockVote;
        self.progressed = true;
        self.sender.broadcast_to_observers(my_vote);

        self.try_commit_block();
        Ok(())
    }

    /// Check a proposed block for the target height, and execute it on a scratch context.
    ///
    /// The block must:
    /// 1. Be generated by the formulator the round settled on, which must be the top rank at the timeout
    ///    count of its height.
    /// 2. Carry that formulator's signature over its header.
    /// 3. Pass the chain's header checks.
    /// 4. Be stamped after the tip, and not too far in the future.
    /// 5. Execute to the context hash its header claims.
    pub(crate) fn validate_block_gen(
        &self,
        block_gen: &BlockGenMessage,
    ) -> Result<C::Context, ObserverError> {
        let block = &block_gen.block;
        let header = &block.header;
        let ack = self
            .round
            .min_round_vote_ack
            .as_ref()
            .ok_or(ObserverError::InvalidRoundState)?;
        let timeout_count = self
            .round
            .timeout_count_at(block.height())
            .ok_or(ObserverError::InvalidRoundState)?;
        if header.timeout_count() != Some(timeout_count) {
            return Err(ConsensusError::InvalidConsensusData.into());
        }

        let top = self.consensus.snapshot().rank_table().top_rank(timeout_count)?;
        if header.generator != top.address || header.generator != ack.formulator {
            return Err(ConsensusError::InvalidTopAddress.into());
        }
        match block_gen.generator_signature.recover(&block.hash()) {
            Ok(signer) if signer == ack.formulator_public_hash => (),
            _ => return Err(ConsensusError::InvalidTopSignature.into()),
        }

        let chain = self.consensus.chain();
        chain.validate_header(header)?;
        if header.timestamp > timestamp_now().saturating_add(MAX_FUTURE_BLOCK_TIME_NS)
            || header.timestamp <= chain.last_timestamp()
        {
            return Err(ObserverError::InvalidTimestamp);
        }
        if !block.signatures.is_empty() || !block.is_body_consistent() {
            return Err(ObserverError::InvalidBlockBody);
        }

        let mut context = chain.new_context();
        chain.execute_block_on_context(block, &mut context, None)?;
        let computed = chain.context_hash(&context);
        if computed != header.context_hash {
            self.consensus.reject_context(block, header.context_hash, computed);
            return Err(ChainError::InvalidContextHash {
                expected: header.context_hash,
                computed,
            }
            .into());
        }
        Ok(context)
    }

    fn on_block_vote(&mut self, origin: PeerID, block_vote: BlockVoteMessage) -> Result<(), ObserverError> {
        let signer = block_vote
            .signer()
            .map_err(|_| ObserverError::InvalidObserverKey)?;
        check_observer(&self.consensus.snapshot(), &origin, &signer)?;

        let height = block_vote.target_height;
        if block_vote.header.height != height {
            return Err(ObserverError::InvalidVote);
        }
        if height <= self.consensus.chain().height() {
            return Ok(());
        }

        let is_reply = block_vote.is_reply;
        let block_round = match self.round.block_round(height) {
            Some(block_round) => block_round,
            None => return Ok(()),
        };
        if let Some(known) = block_round.block_votes.get(&signer) {
            if known.block_sign() == block_vote.block_sign() {
                return Err(ObserverError::AlreadyVoted);
            }
        }
        block_round.block_votes.insert(signer, block_vote);
        let my_vote = block_round.block_votes.get(&self.me).cloned();
        if let (false, Some(mut my_vote)) = (is_reply, my_vote) {
            my_vote.is_reply = true;
            self.sender.send(origin, my_vote);
        }

        if height == self.round.target_height {
            match self.round.state {
                RoundState::BlockVote => self.try_commit_block(),
                RoundState::BlockWait => self.request_block_gen(),
                _ => (),
            }
        }
        Ok(())
    }

    fn on_block_gen_request(
        &mut self,
        origin: PeerID,
        request: BlockGenRequestMessage,
    ) -> Result<(), ObserverError> {
        let signer = request
            .signer()
            .map_err(|_| ObserverError::InvalidObserverKey)?;
        check_observer(&self.consensus.snapshot(), &origin, &signer)?;
        if request.body.chain_id != self.chain_id {
            return Err(ObserverError::InvalidVote);
        }

        let height = request.body.target_height;
        let reply = if height <= self.consensus.chain().height() {
            let mut block = self.consensus.chain().block(height)?;
            let signatures = std::mem::take(&mut block.signatures);
            signatures.first().map(|generator_signature| BlockGenMessage {
                block,
                generator_signature: *generator_signature,
                is_reply: true,
            })
        } else {
            self.round
                .block_round_map
                .get(&height)
                .and_then(|block_round| block_round.block_gen.clone())
                .map(|mut block_gen| {
                    block_gen.is_reply = true;
                    block_gen
                })
        };
        if let Some(block_gen) = reply {
            self.sender.send(origin, block_gen);
        }
        Ok(())
    }

    /// Ask the observers that voted for the target height for the block this observer is missing, at most
    /// once per request interval.
    fn request_block_gen(&mut self) {
        let height = self.round.target_height;
        let ack = match &self.round.min_round_vote_ack {
            Some(ack) => ack.clone(),
            None => return,
        };
        let interval = self.block_gen_request_interval;
        let block_round = match self.round.block_round(height) {
            Some(block_round) => block_round,
            None => return,
        };
        if block_round.block_gen.is_some() || block_round.block_votes.is_empty() {
            return;
        }
        let due = block_round
            .last_block_gen_request
            .map_or(true, |last| last.elapsed() >= interval);
        if !due {
            return;
        }
        block_round.last_block_gen_request = Some(Instant::now());
        let voters: Vec<PublicHash> = block_round.block_votes.keys().copied().collect();

        let timeout_count = self.round.timeout_count_at(height).unwrap_or(0);
        let request = Signed::new(
            BlockGenRequest {
                chain_id: self.chain_id,
                last_hash: self.consensus.chain().last_hash(),
                target_height: height,
                timeout_count,
                formulator: ack.formulator,
                formulator_public_hash: ack.formulator_public_hash,
                public_hash: self.me,
                timestamp: timestamp_now(),
            },
            &self.keypair,
        );
        for voter in voters.into_iter().filter(|voter| *voter != self.me) {
            self.sender.send(PeerID::Observer(voter), request.clone());
        }
    }

    /// Commit the block of the target height once a quorum of observers signed it.
    fn try_commit_block(&mut self) {
        let height = self.round.target_height;
        let quorum = self.consensus.snapshot().quorum();
        let block_round = match self.round.block_round(height) {
            Some(block_round) => block_round,
            None => return,
        };
        let block_gen = match &block_round.block_gen {
            Some(block_gen) => block_gen,
            None => return,
        };
        let block_sign = block_gen.block_sign();
        let observer_signatures: Vec<RecoverableSignature> = block_round
            .votes_for(&block_sign)
            .into_iter()
            .take(quorum)
            .map(|(_, vote)| vote.observer_signature)
            .collect();
        if observer_signatures.len() < quorum {
            return;
        }

        let mut block: Block = block_gen.block.clone();
        block.signatures = std::iter::once(block_gen.generator_signature)
            .chain(observer_signatures.iter().copied())
            .collect();
        let context = block_round.context.take();

        match self.consensus.commit(&block, context, None) {
            Ok(()) => self.on_committed(&block, observer_signatures),
            Err(ConsensusError::AlreadyConnected(_)) => self.follow_chain(),
            Err(error) if error.is_fatal() => self.consensus.halt(error.to_string()),
            Err(error) => {
                log::warn!("failed to commit block {}: {}", height, error);
                self.follow_chain();
            }
        }
    }

    fn on_committed(&mut self, block: &Block, observer_signatures: Vec<RecoverableSignature>) {
        let height = block.height();
        log::debug!("committed block {} at {}", block.hash(), height);
        Event::CommitBlock(CommitBlockEvent {
            timestamp: SystemTime::now(),
            block: block.hash(),
            height,
            generator: block.header.generator,
            transactions: block.transactions.len(),
        })
        .publish(&self.event_publisher);

        let state = self.consensus.snapshot();
        let leader = self
            .round
            .min_round_vote_ack
            .as_ref()
            .map(|ack| (ack.public_hash, ack.formulator));
        match leader {
            Some((leader, formulator)) if leader == self.me => {
                let ob_sign = BlockObSignMessage {
                    target_height: height,
                    block_sign: BlockSign {
                        header_hash: block.hash(),
                        generator_signature: block.signatures[0],
                    },
                    observer_signatures,
                };
                self.sender
                    .send(PeerID::Formulator(formulator), ob_sign.clone());
                if let Ok(next) = state.rank_table().top_rank(0) {
                    if next.address != formulator {
                        self.sender.send(PeerID::Formulator(next.address), ob_sign);
                    }
                }
            }
            _ => {
                let status = local_status(self.consensus.chain());
                for rank in state.rank_table().candidates().iter().take(STATUS_FANOUT) {
                    self.sender
                        .send(PeerID::Formulator(rank.address), status.clone());
                }
            }
        }

        self.pace(height);
        self.progressed = true;
        if self.round.advance_height() {
            self.process_block_gen_wait();
        } else {
            self.start_round();
        }
    }

    /// Hold back a formulator that produces its turn faster than one block per block interval.
    fn pace(&self, height: BlockHeight) {
        let block_interval = self.consensus.policy().block_interval;
        let expected = block_interval * (height - self.round.first_height);
        let elapsed = self.round.first_time.elapsed();
        if elapsed < expected {
            thread::sleep((expected - elapsed).min(block_interval));
        }
    }

    fn on_round_timeout(&mut self) {
        let formulator = self.round.formulator();
        log::info!(
            "round at {} timed out in {:?}",
            self.round.target_height,
            self.round.state
        );
        if let Some(formulator) = formulator {
            Event::RoundTimeout(RoundTimeoutEvent {
                timestamp: SystemTime::now(),
                target_height: self.round.target_height,
                formulator,
            })
            .publish(&self.event_publisher);
            self.ignore(formulator);
        }
        self.start_round();
    }

    fn ignore(&mut self, formulator: Address) {
        let now = Instant::now();
        let repeated = self
            .last_ignored
            .get(&formulator)
            .map_or(false, |last| now.duration_since(*last) < self.repeat_ignore_duration);
        let duration = if repeated {
            self.repeat_ignore_duration
        } else {
            self.ignore_duration
        };
        lock_ignore_map(&self.ignore_map).insert(formulator, now + duration);
        self.last_ignored.insert(formulator, now);

        log::info!("ignoring formulator {} for {:?}", formulator, duration);
        Event::IgnoreFormulator(IgnoreFormulatorEvent {
            timestamp: SystemTime::now(),
            formulator,
            duration,
        })
        .publish(&self.event_publisher);
    }
}

/// Check that a vote signed by `signer` arrived from that same observer.
fn check_observer(
    state: &ConsensusState,
    origin: &PeerID,
    signer: &PublicHash,
) -> Result<(), ObserverError> {
    match origin {
        PeerID::Observer(public_hash) if public_hash == signer && state.is_observer(signer) => Ok(()),
        _ => Err(ObserverError::InvalidObserverKey),
    }
}

pub(crate) fn start_observer<C: Chain, N: Network + 'static>(
    mut process: ObserverProcess<C, N>,
    messages: Receiver<(PeerID, Message)>,
    close: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        process.start_round();
        let mut next_tick = Instant::now() + process.tick_interval;
        while !close.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= next_tick {
                process.on_tick();
                next_tick = now + process.tick_interval;
                continue;
            }
            match messages.recv_timeout(next_tick - now) {
                Ok((origin, message)) => process.on_message(origin, message),
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    })
}

#[derive(Debug)]
pub enum ObserverError {
    InvalidObserverKey,
    InvalidVote,
    InvalidRoundState,
    AlreadyVoted,
    InvalidTimestamp,
    InvalidBlockBody,
    Consensus(ConsensusError),
}

impl From<ConsensusError> for ObserverError {
    fn from(error: ConsensusError) -> Self {
        ObserverError::Consensus(error)
    }
}

impl From<ChainError> for ObserverError {
    fn from(error: ChainError) -> Self {
        ObserverError::Consensus(error.into())
    }
}

impl From<RankTableError> for ObserverError {
    fn from(error: RankTableError) -> Self {
        ObserverError::Consensus(error.into())
    }
}

impl Display for ObserverError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ObserverError::InvalidObserverKey => write!(f, "message is not signed by its observer"),
            ObserverError::InvalidVote => write!(f, "vote does not match the local view"),
            ObserverError::InvalidRoundState => write!(f, "message does not fit the round state"),
            ObserverError::AlreadyVoted => write!(f, "sender already voted"),
            ObserverError::InvalidTimestamp => write!(f, "block timestamp out of range"),
            ObserverError::InvalidBlockBody => write!(f, "block body does not match its header"),
            ObserverError::Consensus(error) => write!(f, "{}", error),
        }
    }
}
