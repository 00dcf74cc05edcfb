/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The bookkeeping of one voting round: the votes collected so far, the block proposed at each height of
//! the turn, and the messages that arrived before the round was ready for them.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use crate::networking::PeerID;
use crate::types::basic::{Address, BlockHeight, PublicHash, TimeoutCount};
use crate::types::block::BlockSign;

use super::messages::{
    BlockGenMessage, BlockVoteMessage, RoundVoteAck, RoundVoteAckMessage, RoundVoteMessage,
};

/// Phases of a round, in the order the round goes through them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum RoundState {
    RoundVote,
    RoundVoteAck,
    BlockWait,
    BlockVote,
}

/// The proposal and votes for a single height of the turn.
pub(crate) struct BlockRound<X> {
    pub(crate) block_gen: Option<BlockGenMessage>,
    /// Post-state of `block_gen`, kept to connect the block without executing it again.
    pub(crate) context: Option<X>,
    pub(crate) block_votes: HashMap<PublicHash, BlockVoteMessage>,
    pub(crate) last_block_gen_request: Option<Instant>,
}

impl<X> BlockRound<X> {
    fn new() -> Self {
        BlockRound {
            block_gen: None,
            context: None,
            block_votes: HashMap::new(),
            last_block_gen_request: None,
        }
    }

    /// Votes that sign `block_sign`, in ascending order of observer.
    pub(crate) fn votes_for(&self, block_sign: &BlockSign) -> Vec<(PublicHash, &BlockVoteMessage)> {
        let mut votes: Vec<(PublicHash, &BlockVoteMessage)> = self
            .block_votes
            .iter()
            .filter(|(_, vote)| vote.block_sign() == *block_sign)
            .map(|(observer, vote)| (*observer, vote))
            .collect();
        votes.sort_by_key(|(observer, _)| *observer);
        votes
    }
}

pub(crate) struct VoteRound<X> {
    pub(crate) state: RoundState,
    /// The height being voted on. Moves forward within the turn.
    pub(crate) target_height: BlockHeight,
    /// The first height of the turn.
    pub(crate) first_height: BlockHeight,
    pub(crate) remain_blocks: u32,

    pub(crate) my_vote: Option<RoundVoteMessage>,
    pub(crate) my_ack: Option<RoundVoteAckMessage>,
    pub(crate) round_votes: HashMap<PublicHash, RoundVoteMessage>,
    pub(crate) round_vote_acks: HashMap<PublicHash, RoundVoteAckMessage>,
    /// When the round votes first reached a supermajority.
    pub(crate) supermajority_since: Option<Instant>,
    /// The ack the round settled on. Set when the round leaves [`RoundState::RoundVoteAck`].
    pub(crate) min_round_vote_ack: Option<RoundVoteAck>,

    pub(crate) block_round_map: BTreeMap<BlockHeight, BlockRound<X>>,
    /// Proposals for later heights of the turn, waiting for the earlier heights to commit.
    pub(crate) block_gen_wait: BTreeMap<BlockHeight, (PeerID, BlockGenMessage)>,

    pub(crate) vote_fail_count: u32,
    pub(crate) first_time: Instant,
}

impl<X> VoteRound<X> {
    pub(crate) fn new(target_height: BlockHeight, remain_blocks: u32) -> Self {
        let mut round = VoteRound {
            state: RoundState::RoundVote,
            target_height,
            first_height: target_height,
            remain_blocks,
            my_vote: None,
            my_ack: None,
            round_votes: HashMap::new(),
            round_vote_acks: HashMap::new(),
            supermajority_since: None,
            min_round_vote_ack: None,
            block_round_map: BTreeMap::new(),
            block_gen_wait: BTreeMap::new(),
            vote_fail_count: 0,
            first_time: Instant::now(),
        };
        round.allocate_block_rounds(remain_blocks);
        round
    }

    /// Re-size the turn once the round settled on a formulator, which may be allowed a different number
    /// of blocks than the one this observer voted for.
    pub(crate) fn allocate_block_rounds(&mut self, remain_blocks: u32) {
        self.remain_blocks = remain_blocks.max(1);
        let end = self.end_height();
        let first = self.first_height;
        self.block_round_map
            .retain(|height, _| *height >= first && *height < end);
        for offset in 0..self.remain_blocks {
            self.block_round_map
                .entry(first + offset)
                .or_insert_with(BlockRound::new);
        }
        self.block_gen_wait.retain(|height, _| *height < end);
    }

    /// The first height after the turn.
    pub(crate) fn end_height(&self) -> BlockHeight {
        self.first_height + self.remain_blocks
    }

    pub(crate) fn in_turn(&self, height: BlockHeight) -> bool {
        height >= self.first_height && height < self.end_height()
    }

    pub(crate) fn block_round(&mut self, height: BlockHeight) -> Option<&mut BlockRound<X>> {
        self.block_round_map.get_mut(&height)
    }

    /// The timeout count that the block at `height` must carry: only the first block of a turn skips
    /// formulators.
    pub(crate) fn timeout_count_at(&self, height: BlockHeight) -> Option<TimeoutCount> {
        let ack = self.min_round_vote_ack.as_ref()?;
        Some(if height == self.first_height {
            ack.timeout_count
        } else {
            0
        })
    }

    /// The formulator this round settled on, or the one this observer voted for.
    pub(crate) fn formulator(&self) -> Option<Address> {
        self.min_round_vote_ack
            .as_ref()
            .map(|ack| ack.formulator)
            .or_else(|| self.my_vote.as_ref().map(|vote| vote.body.formulator))
    }

    /// Store a round vote unless the sender already voted at an equal or higher timeout count. Returns
    /// whether it was stored.
    pub(crate) fn add_round_vote(&mut self, sender: PublicHash, vote: RoundVoteMessage) -> bool {
        match self.round_votes.get(&sender) {
            Some(known) if known.body.timeout_count >= vote.body.timeout_count => false,
            _ => {
                self.round_votes.insert(sender, vote);
                true
            }
        }
    }

    /// The vote every observer pins its ack to: the one with the largest `(timeout_count, sender)`.
    pub(crate) fn chosen_round_vote(&self) -> Option<(PublicHash, &RoundVoteMessage)> {
        self.round_votes
            .iter()
            .max_by_key(|(sender, vote)| (vote.body.timeout_count, **sender))
            .map(|(sender, vote)| (*sender, vote))
    }

    /// The ack that at least `quorum` observers agree on, if any.
    pub(crate) fn ack_with_quorum(&self, quorum: usize) -> Option<RoundVoteAck> {
        let mut groups: Vec<(&RoundVoteAck, usize)> = Vec::new();
        for ack in self.round_vote_acks.values() {
            match groups.iter_mut().find(|(known, _)| known.agrees_with(&ack.body)) {
                Some((_, count)) => *count += 1,
                None => groups.push((&ack.body, 1)),
            }
        }
        groups
            .into_iter()
            .filter(|(_, count)| *count >= quorum)
            .max_by_key(|(ack, count)| (*count, ack.timeout_count, ack.public_hash))
            .map(|(ack, _)| ack.clone())
    }

    /// Move on to the next height of the turn after committing `target_height`. Returns `false` if the
    /// turn is over.
    pub(crate) fn advance_height(&mut self) -> bool {
        self.block_round_map.remove(&self.target_height);
        let next = self.target_height.next();
        if next >= self.end_height() {
            return false;
        }
        self.target_height = next;
        self.state = RoundState::BlockWait;
        self.vote_fail_count = 0;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::messages::{RoundVote, Signed};
    use crate::types::basic::{ChainID, CryptoHash};
    use crate::types::crypto_primitives::{Keypair, SigningKey};

    fn keypair(byte: u8) -> Keypair {
        Keypair::new(SigningKey::from_bytes(&[byte; 32]))
    }

    fn vote(timeout_count: TimeoutCount, formulator: u8) -> RoundVote {
        RoundVote {
            chain_id: ChainID::new(1),
            last_hash: CryptoHash::default(),
            target_height: BlockHeight::new(1),
            timeout_count,
            formulator: Address::new([formulator; 20]),
            formulator_public_hash: PublicHash::new([formulator; 32]),
            timestamp: 0,
            is_reply: false,
        }
    }

    fn ack(sender: &Keypair, timeout_count: TimeoutCount, leader: PublicHash) -> RoundVoteAckMessage {
        let vote = vote(timeout_count, 1);
        Signed::new(
            RoundVoteAck {
                chain_id: vote.chain_id,
                last_hash: vote.last_hash,
                target_height: vote.target_height,
                timeout_count,
                formulator: vote.formulator,
                formulator_public_hash: vote.formulator_public_hash,
                public_hash: leader,
                timestamp: 0,
                is_reply: false,
            },
            sender,
        )
    }

    #[test]
    fn block_rounds_cover_the_turn() {
        let mut round: VoteRound<()> = VoteRound::new(BlockHeight::new(10), 3);
        assert_eq!(round.state, RoundState::RoundVote);
        assert!(round.min_round_vote_ack.is_none());
        assert_eq!(round.block_round_map.len(), 3);
        assert!(round.in_turn(BlockHeight::new(12)));
        assert!(!round.in_turn(BlockHeight::new(13)));

        round.allocate_block_rounds(1);
        assert_eq!(round.block_round_map.len(), 1);
        assert!(!round.in_turn(BlockHeight::new(11)));
    }

    #[test]
    fn later_votes_replace_earlier_ones_only_with_a_higher_timeout_count() {
        let mut round: VoteRound<()> = VoteRound::new(BlockHeight::new(1), 10);
        let sender = keypair(1);
        assert!(round.add_round_vote(sender.public_hash(), Signed::new(vote(1, 2), &sender)));
        assert!(!round.add_round_vote(sender.public_hash(), Signed::new(vote(0, 1), &sender)));
        assert!(!round.add_round_vote(sender.public_hash(), Signed::new(vote(1, 2), &sender)));
        assert!(round.add_round_vote(sender.public_hash(), Signed::new(vote(2, 3), &sender)));
        assert_eq!(round.round_votes.len(), 1);
    }

    #[test]
    fn chosen_vote_has_the_largest_timeout_count_then_sender() {
        let mut round: VoteRound<()> = VoteRound::new(BlockHeight::new(1), 10);
        let (a, b, c) = (keypair(1), keypair(2), keypair(3));
        round.add_round_vote(a.public_hash(), Signed::new(vote(1, 2), &a));
        round.add_round_vote(b.public_hash(), Signed::new(vote(0, 1), &b));
        round.add_round_vote(c.public_hash(), Signed::new(vote(1, 2), &c));

        let expected = a.public_hash().max(c.public_hash());
        let (sender, chosen) = round.chosen_round_vote().unwrap();
        assert_eq!(sender, expected);
        assert_eq!(chosen.body.timeout_count, 1);
    }

    #[test]
    fn acks_need_a_quorum_that_agrees_on_the_leader() {
        let mut round: VoteRound<()> = VoteRound::new(BlockHeight::new(1), 10);
        let senders: Vec<Keypair> = (1..=4).map(keypair).collect();
        let leader = senders[0].public_hash();
        let other_leader = senders[1].public_hash();

        round.round_vote_acks.insert(senders[0].public_hash(), ack(&senders[0], 0, leader));
        round.round_vote_acks.insert(senders[1].public_hash(), ack(&senders[1], 0, other_leader));
        round.round_vote_acks.insert(senders[2].public_hash(), ack(&senders[2], 0, leader));
        assert!(round.ack_with_quorum(3).is_none());

        round.round_vote_acks.insert(senders[3].public_hash(), ack(&senders[3], 0, leader));
        let settled = round.ack_with_quorum(3).unwrap();
        assert_eq!(settled.public_hash, leader);
    }

    #[test]
    fn advancing_past_the_turn_ends_it() {
        let mut round: VoteRound<()> = VoteRound::new(BlockHeight::new(5), 2);
        round.state = RoundState::BlockVote;
        round.vote_fail_count = 7;

        assert!(round.advance_height());
        assert_eq!(round.target_height, BlockHeight::new(6));
        assert_eq!(round.state, RoundState::BlockWait);
        assert_eq!(round.vote_fail_count, 0);
        assert!(!round.block_round_map.contains_key(&BlockHeight::new(5)));

        assert!(!round.advance_height());
    }
}
