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

//! Consensus plugin boundary.
//!
//! A consenter consumes raw consensus payloads and transaction batches and
//! produces payloads to broadcast plus committed transaction slices for the
//! block assembly.

pub mod lbft;

use crate::{
    base::schema::{ChainCoordinate, Transaction},
    channel::Sender,
    ledger::BlockchainInfo,
};
use std::time::Duration;

#[cfg(test)]
use mockall::automock;

/// Payload to deliver to every replica of a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Broadcast {
    pub to: ChainCoordinate,
    pub payload: Vec<u8>,
}

/// One committed batch within a block output.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedTxs {
    /// Slice giving the block its time.
    pub skip: bool,
    /// Batch originated on this node chain.
    pub is_local_chain: bool,
    pub seq_no: u64,
    pub time: u32,
    pub transactions: Vec<Transaction>,
}

/// Block assembly input.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTxs {
    pub outputs: Vec<CommittedTxs>,
    pub height: u64,
}

impl OutputTxs {
    /// Time of the first local slice, zero when there is none.
    pub fn block_time(&self) -> u32 {
        self.outputs
            .iter()
            .find(|slice| slice.skip)
            .map(|slice| slice.time)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.outputs
            .iter()
            .map(|slice| slice.transactions.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fate of a batch handed to the consenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Not proposed or dropped by a view change; the batch can be proposed again.
    Rewind,
    /// Accepted by the primary verification.
    Verified,
    /// Committed.
    Succeeded,
    /// Consensus failed.
    Failed,
}

/// Per-batch outcome notification channel.
pub type BatchTicket = Sender<BatchOutcome>;

/// Services the consenter needs from the hosting node.
#[cfg_attr(test, automock)]
pub trait Stack: Send + Sync + 'static {
    /// Re-run the sender sequencing on a proposed batch.
    fn verify_batch(&self, txs: &[Transaction], is_primary: bool) -> bool;

    /// Chain tip counters.
    fn blockchain_info(&self) -> BlockchainInfo;

    /// Next batch from the transaction pool.
    fn next_batch(&self, max_size: usize, max_wait: Duration) -> Vec<Transaction>;

    /// Notification for batches pulled through `next_batch`.
    fn handle_outcome(&self, outcome: BatchOutcome, txs: &[Transaction]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::schema::tests::create_test_tx;

    fn create_slice(skip: bool, time: u32, count: u32) -> CommittedTxs {
        CommittedTxs {
            skip,
            is_local_chain: skip,
            seq_no: 1,
            time,
            transactions: (1..=count).map(|n| create_test_tx(n, 1)).collect(),
        }
    }

    #[test]
    fn output_block_time() {
        let output = OutputTxs {
            outputs: vec![create_slice(false, 10, 1), create_slice(true, 20, 2)],
            height: 3,
        };

        assert_eq!(output.block_time(), 20);
        assert_eq!(output.len(), 3);
    }

    #[test]
    fn output_without_local_slice() {
        let output = OutputTxs {
            outputs: vec![create_slice(false, 10, 0)],
            height: 1,
        };

        assert_eq!(output.block_time(), 0);
        assert!(output.is_empty());
    }
}
