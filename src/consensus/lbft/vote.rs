// This file is part of TRINCI.
//
// Copyright (C) 2021 Affidaty Spa.
//
// TRINCI is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// TRINCI is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with TRINCI. If not, see <https://www.gnu.org/licenses/>.

//! Vote bookkeeping for the agreement phases and the view change campaigns.

use super::{
    message::{Commit, Prepare, ViewChange},
    timer::Timer,
    MIN_QUORUM,
};
use crate::base::schema::ChainCoordinate;
use std::collections::HashMap;

/// Phase vote.
pub trait Ballot: Clone {
    fn replica_id(&self) -> &str;
    fn chain(&self) -> &ChainCoordinate;
    fn seq_no(&self) -> u64;
    fn digest(&self) -> &str;
    /// Quorum announced by the voter for its own chain.
    fn quorum(&self) -> u64;
}

macro_rules! impl_ballot {
    ($t:ty) => {
        impl Ballot for $t {
            fn replica_id(&self) -> &str {
                &self.replica_id
            }
            fn chain(&self) -> &ChainCoordinate {
                &self.chain
            }
            fn seq_no(&self) -> u64 {
                self.seq_no
            }
            fn digest(&self) -> &str {
                &self.digest
            }
            fn quorum(&self) -> u64 {
                self.quorum
            }
        }
    };
}

impl_ballot!(Prepare);
impl_ballot!(Commit);

/// Votes of a phase, one per replica and ballot.
#[derive(Debug)]
pub struct VoteTally<B> {
    votes: Vec<B>,
}

impl<B> Default for VoteTally<B> {
    fn default() -> Self {
        VoteTally { votes: vec![] }
    }
}

impl<B: Ballot> VoteTally<B> {
    /// False when the replica already cast the same ballot.
    ///
    /// A replica holds one slot per chain, digest and sequence number, so a
    /// stray ballot never shadows its vote for the right batch.
    pub fn add(&mut self, vote: B) -> bool {
        let cast = self.votes.iter().any(|known| {
            known.replica_id() == vote.replica_id()
                && known.chain() == vote.chain()
                && known.digest() == vote.digest()
                && known.seq_no() == vote.seq_no()
        });
        if cast {
            return false;
        }
        self.votes.push(vote);
        true
    }

    pub fn has_voted(&self, replica_id: &str) -> bool {
        self.votes.iter().any(|vote| vote.replica_id() == replica_id)
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    /// Quorum check for the votes of one chain.
    ///
    /// Votes are grouped by sequence number; `seq_no` restricts the check to
    /// a single group. A group passes with at least `max(quorum, MIN_QUORUM)`
    /// votes, `quorum` being the highest one announced within the group.
    pub fn passed(&self, chain: &ChainCoordinate, digest: &str, seq_no: Option<u64>) -> bool {
        let mut groups: HashMap<u64, (usize, u64)> = HashMap::new();
        for vote in self.votes.iter().filter(|vote| {
            vote.chain() == chain
                && vote.digest() == digest
                && seq_no.map(|seq_no| vote.seq_no() == seq_no).unwrap_or(true)
        }) {
            let group = groups.entry(vote.seq_no()).or_default();
            group.0 += 1;
            group.1 = group.1.max(vote.quorum());
        }
        groups
            .values()
            .any(|(count, quorum)| *count >= (*quorum as usize).max(MIN_QUORUM))
    }
}

/// Votes of a view change campaign with its timers.
#[derive(Debug, Default)]
pub struct Campaign {
    votes: Vec<ViewChange>,
    /// Running until the quorum of votes is reached.
    pub timeout: Timer,
    /// Armed once the quorum is reached.
    pub resend: Timer,
}

impl Campaign {
    /// False when the replica already voted.
    pub fn add(&mut self, vote: ViewChange) -> bool {
        if self.has_voted(&vote.replica_id) {
            return false;
        }
        self.votes.push(vote);
        true
    }

    pub fn has_voted(&self, replica_id: &str) -> bool {
        self.votes.iter().any(|vote| vote.replica_id == replica_id)
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    pub fn clear(&mut self) {
        self.votes.clear();
    }

    /// Candidate backed by `quorum` matching votes, lowest bid first.
    pub fn elected<F>(&self, quorum: usize, accept: F) -> Option<ViewChange>
    where
        F: Fn(&ViewChange) -> bool,
    {
        let mut groups: HashMap<String, Vec<&ViewChange>> = HashMap::new();
        for vote in self.votes.iter().filter(|vote| accept(*vote)) {
            groups.entry(vote.content_digest()).or_default().push(vote);
        }
        groups
            .values()
            .filter(|group| group.len() >= quorum)
            .flat_map(|group| group.iter())
            .min_by_key(|vote| vote.priority)
            .map(|vote| (*vote).clone())
    }

    /// Lowest bid among the acceptable votes.
    pub fn best_candidate<F>(&self, accept: F) -> Option<ViewChange>
    where
        F: Fn(&ViewChange) -> bool,
    {
        self.votes
            .iter()
            .filter(|vote| accept(*vote))
            .min_by_key(|vote| vote.priority)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::schema::tests::chain;

    fn create_prepare(chain_hex: &str, replica: &str, seq_no: u64, quorum: u64) -> Prepare {
        Prepare {
            name: "n".to_string(),
            primary_id: "00:a".to_string(),
            chain: chain(chain_hex),
            replica_id: replica.to_string(),
            seq_no,
            digest: "d".to_string(),
            quorum,
        }
    }

    fn create_view_change(replica: &str, candidate: &str, priority: i64) -> ViewChange {
        ViewChange {
            replica_id: replica.to_string(),
            chain: chain("00"),
            priority,
            primary_id: candidate.to_string(),
            h: 0,
            id: "lbft".to_string(),
            seq_no: 0,
            opt_hash: "h".to_string(),
        }
    }

    #[test]
    fn duplicated_ballot_ignored() {
        let mut tally = VoteTally::default();

        assert!(tally.add(create_prepare("00", "00:a", 1, 3)));
        assert!(!tally.add(create_prepare("00", "00:a", 1, 3)));
        assert_eq!(tally.len(), 1);
    }

    #[test]
    fn stray_ballot_keeps_replica_slot() {
        let mut tally = VoteTally::default();
        let stray = Prepare {
            digest: "x".to_string(),
            ..create_prepare("00", "00:a", 1, 3)
        };

        assert!(tally.add(stray));
        assert!(tally.add(create_prepare("00", "00:a", 1, 3)));
        tally.add(create_prepare("00", "00:b", 1, 3));
        tally.add(create_prepare("00", "00:c", 1, 3));
        assert!(!tally.add(create_prepare("00", "00:c", 1, 3)));

        assert!(tally.passed(&chain("00"), "d", Some(1)));
    }

    #[test]
    fn min_quorum_enforced() {
        let mut tally = VoteTally::default();
        tally.add(create_prepare("00", "00:a", 1, 2));
        tally.add(create_prepare("00", "00:b", 1, 2));

        assert!(!tally.passed(&chain("00"), "d", Some(1)));
        tally.add(create_prepare("00", "00:c", 1, 2));
        assert!(tally.passed(&chain("00"), "d", Some(1)));
    }

    #[test]
    fn announced_quorum_enforced() {
        let mut tally = VoteTally::default();
        for replica in ["00:a", "00:b", "00:c"] {
            tally.add(create_prepare("00", replica, 1, 5));
        }

        assert!(!tally.passed(&chain("00"), "d", Some(1)));
    }

    #[test]
    fn local_side_requires_sequence_match() {
        let mut tally = VoteTally::default();
        tally.add(create_prepare("00", "00:a", 1, 3));
        tally.add(create_prepare("00", "00:b", 1, 3));
        tally.add(create_prepare("00", "00:c", 2, 3));

        assert!(!tally.passed(&chain("00"), "d", Some(1)));
        assert!(!tally.passed(&chain("00"), "d", None));
    }

    #[test]
    fn remote_side_grouped_by_sequence() {
        let mut tally = VoteTally::default();
        for replica in ["01:a", "01:b", "01:c"] {
            tally.add(create_prepare("01", replica, 40, 3));
        }

        assert!(tally.passed(&chain("01"), "d", None));
        assert!(!tally.passed(&chain("00"), "d", None));
        assert!(!tally.passed(&chain("01"), "x", None));
    }

    #[test]
    fn campaign_elects_lowest_bid_with_quorum() {
        let mut campaign = Campaign::default();
        campaign.add(create_view_change("00:a", "00:b", 5));
        campaign.add(create_view_change("00:b", "00:b", 5));
        campaign.add(create_view_change("00:c", "00:c", 1));

        assert_eq!(campaign.elected(3, |_| true), None);
        campaign.add(create_view_change("00:d", "00:b", 5));

        let elected = campaign.elected(3, |_| true).unwrap();
        assert_eq!(elected.primary_id, "00:b");
        assert_eq!(campaign.best_candidate(|_| true).unwrap().primary_id, "00:c");
        assert_eq!(
            campaign
                .best_candidate(|vote| vote.primary_id != "00:c")
                .unwrap()
                .primary_id,
            "00:b"
        );
    }
}
