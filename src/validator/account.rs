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

//! Per-sender projection of the committed account state.
//!
//! The projection tracks the balance and the next expected nonce as if every
//! pending transaction of the sender was already executed. Transactions with
//! a nonce from the future are parked as orphans until the gap is filled.

use crate::{
    base::schema::{Address, Transaction, TxType},
    crypto::Hash,
    ledger::Ledger,
    ErrorKind, Result,
};
use num_bigint::BigInt;
use num_traits::Zero;
use std::collections::HashSet;

/// Max number of parked transactions per sender.
pub const MAX_ORPHANS: usize = 1_000_000;

/// Result of applying a transaction to a projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Nonce and balance checks passed, projection updated.
    Accepted,
    /// Nonce from the future, parked until its predecessors arrive.
    Orphaned,
    /// Refused, projection untouched.
    Rejected(ErrorKind),
}

/// Outcome of a successful exception replacement.
#[derive(Debug, Clone, PartialEq)]
pub struct Replacement {
    /// The pending entry swapped out by the incoming transaction.
    pub replaced: Transaction,
    /// Tail entries dropped to keep the balance non negative.
    pub evicted: Vec<Transaction>,
}

#[derive(Debug)]
pub struct AccountProjection {
    address: Address,
    balance: BigInt,
    /// Next expected nonce.
    nonce: u32,
    /// Accepted transactions, oldest first.
    txs: Vec<Transaction>,
    /// Hashes of `txs`.
    index: HashSet<Hash>,
    /// Parked transactions sorted by nonce.
    orphans: Vec<Transaction>,
    orphans_cap: usize,
    /// Last transaction handed to consensus.
    cursor: Option<Hash>,
}

impl AccountProjection {
    /// Load the committed state from the ledger.
    pub fn new<L: Ledger + ?Sized>(address: Address, ledger: &L) -> Result<Self> {
        let state = ledger.load_account(&address)?.unwrap_or_default();
        Ok(Self::with_state(
            address,
            state.balance,
            state.nonce.saturating_add(1),
        ))
    }

    /// Projection starting from an explicit state. `nonce` is the next expected one.
    pub fn with_state(address: Address, balance: BigInt, nonce: u32) -> Self {
        AccountProjection {
            address,
            balance,
            nonce,
            txs: vec![],
            index: HashSet::new(),
            orphans: vec![],
            orphans_cap: MAX_ORPHANS,
            cursor: None,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn balance(&self) -> &BigInt {
        &self.balance
    }

    pub fn nonce(&self) -> u32 {
        self.nonce
    }

    pub fn txs(&self) -> &[Transaction] {
        &self.txs
    }

    pub fn orphans(&self) -> &[Transaction] {
        &self.orphans
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.index.contains(hash)
    }

    /// No pending and no parked transaction.
    pub fn is_idle(&self) -> bool {
        self.txs.is_empty() && self.orphans.is_empty()
    }

    pub fn apply(&mut self, tx: &Transaction) -> Admission {
        let hash = tx.hash();
        if self.index.contains(&hash) {
            return Admission::Rejected(ErrorKind::DuplicatedUnconfirmedTx);
        }
        if tx.tx_type() == TxType::Merged {
            self.track(tx.clone());
            return Admission::Accepted;
        }
        if tx.nonce() < self.nonce {
            return Admission::Rejected(ErrorKind::NonceReplay);
        }
        if tx.nonce() > self.nonce {
            return self.park(tx.clone());
        }
        let balance = &self.balance - tx.cost();
        if balance < BigInt::zero() && !tx.tx_type().is_issue() {
            return Admission::Rejected(ErrorKind::InsufficientBalance);
        }
        self.balance = balance;
        self.nonce += 1;
        self.orphans.retain(|orphan| orphan.hash() != hash);
        self.track(tx.clone());
        Admission::Accepted
    }

    fn track(&mut self, tx: Transaction) {
        self.index.insert(tx.hash());
        self.txs.push(tx);
    }

    fn untrack(&mut self, pos: usize) -> Transaction {
        let tx = self.txs.remove(pos);
        let hash = tx.hash();
        self.index.remove(&hash);
        if self.cursor == Some(hash) {
            self.cursor = pos.checked_sub(1).map(|prev| self.txs[prev].hash());
        }
        tx
    }

    fn park(&mut self, tx: Transaction) -> Admission {
        let hash = tx.hash();
        if self.orphans.iter().any(|orphan| orphan.hash() == hash) {
            return Admission::Rejected(ErrorKind::DuplicatedUnconfirmedTx);
        }
        let pos = self
            .orphans
            .iter()
            .position(|orphan| orphan.nonce() > tx.nonce())
            .unwrap_or(self.orphans.len());
        self.orphans.insert(pos, tx);
        if self.orphans.len() > self.orphans_cap {
            let evicted = self.orphans.remove(0);
            debug!(
                "[account] {} orphans full, evicted nonce {}",
                self.address,
                evicted.nonce()
            );
        }
        Admission::Orphaned
    }

    /// Remove the longest run of orphans whose nonces follow the expected one.
    /// Orphans already behind the expected nonce are discarded.
    pub fn drain_orphans(&mut self) -> Vec<Transaction> {
        let stale = self
            .orphans
            .iter()
            .take_while(|orphan| orphan.nonce() < self.nonce)
            .count();
        self.orphans.drain(..stale);

        let mut next = self.nonce;
        let mut run = 0;
        for orphan in self.orphans.iter() {
            if orphan.nonce() != next {
                break;
            }
            next += 1;
            run += 1;
        }
        self.orphans.drain(..run).collect()
    }

    /// Account for a transaction included in a block.
    ///
    /// Pending entries with a nonce not greater than the committed one are
    /// dropped and refunded since the ledger is now authoritative for them.
    pub fn commit(&mut self, tx: &Transaction) {
        let hash = tx.hash();
        let merged = tx.tx_type() == TxType::Merged;
        let mut pos = 0;
        let mut found = false;
        while pos < self.txs.len() {
            let entry = &self.txs[pos];
            if entry.hash() == hash {
                self.untrack(pos);
                found = true;
            } else if !merged
                && entry.tx_type() != TxType::Merged
                && entry.nonce() <= tx.nonce()
            {
                let dropped = self.untrack(pos);
                self.balance += dropped.cost();
            } else {
                pos += 1;
            }
        }
        if merged {
            return;
        }
        if !found {
            self.balance -= tx.cost();
        }
        self.nonce = self.nonce.max(tx.nonce().saturating_add(1));
    }

    /// Undo the admission of a pending transaction.
    /// Returns false when the transaction is unknown.
    pub fn rollback(&mut self, tx: &Transaction) -> bool {
        let hash = tx.hash();
        let pos = match self.txs.iter().position(|entry| entry.hash() == hash) {
            Some(pos) => pos,
            None => return false,
        };
        let removed = self.untrack(pos);
        if removed.tx_type() == TxType::Merged {
            return true;
        }
        self.balance += removed.cost();
        if removed.nonce().saturating_add(1) == self.nonce {
            self.nonce = removed.nonce();
        }
        true
    }

    /// Credit a committed incoming transfer.
    pub fn credit(&mut self, amount: &BigInt) {
        self.balance += amount;
    }

    /// Replace a pending entry having the same nonce as `tx`.
    ///
    /// Accepted only when the nonce falls within the pending window. If the
    /// balance goes negative the tail is evicted until it recovers; when the
    /// replaced entry itself would be evicted the replacement is refused and
    /// the projection is left untouched.
    pub fn exception_check(&mut self, tx: &Transaction) -> Option<Replacement> {
        if tx.tx_type() == TxType::Merged || self.index.contains(&tx.hash()) {
            return None;
        }
        let diff = self.nonce.checked_sub(tx.nonce())? as usize;
        if diff == 0 || diff > self.txs.len() {
            return None;
        }
        let pos = self
            .txs
            .iter()
            .position(|entry| entry.tx_type() != TxType::Merged && entry.nonce() == tx.nonce())?;

        let mut balance = &self.balance + self.txs[pos].cost() - tx.cost();
        let mut tail = self.txs.len();
        while balance < BigInt::zero() {
            if tail == pos + 1 {
                return None;
            }
            tail -= 1;
            let entry = &self.txs[tail];
            if entry.tx_type() != TxType::Merged {
                balance += entry.cost();
            }
        }

        let mut evicted = vec![];
        while self.txs.len() > tail {
            let last = self.txs.len() - 1;
            evicted.push(self.untrack(last));
        }
        evicted.reverse();
        if let Some(lowest) = evicted
            .iter()
            .filter(|entry| entry.tx_type() != TxType::Merged)
            .map(|entry| entry.nonce())
            .min()
        {
            self.nonce = lowest;
        }

        let replaced = std::mem::replace(&mut self.txs[pos], tx.clone());
        self.index.remove(&replaced.hash());
        self.index.insert(tx.hash());
        if self.cursor == Some(replaced.hash()) {
            self.cursor = Some(tx.hash());
        }
        self.balance = balance;
        Some(Replacement { replaced, evicted })
    }

    /// Pending transactions not yet handed to consensus.
    pub fn pending_after_cursor(&self) -> &[Transaction] {
        let start = match self.cursor {
            Some(hash) => self
                .txs
                .iter()
                .position(|entry| entry.hash() == hash)
                .map(|pos| pos + 1)
                .unwrap_or(0),
            None => 0,
        };
        &self.txs[start..]
    }

    /// Move the cursor on a pending transaction.
    pub fn set_cursor(&mut self, hash: Hash) {
        if self.index.contains(&hash) {
            self.cursor = Some(hash);
        }
    }

    pub fn reset_cursor(&mut self) {
        self.cursor = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        base::schema::tests::{create_test_tx, create_test_tx_ext},
        crypto::ed25519::tests::ed25519_test_keypair,
        ledger::{AccountState, MockLedger},
        ErrorKind,
    };

    fn create_projection(balance: i64) -> AccountProjection {
        let address = ed25519_test_keypair().public_key().to_address();
        AccountProjection::with_state(address, BigInt::from(balance), 1)
    }

    #[test]
    fn new_from_ledger() {
        let mut ledger = MockLedger::new();
        ledger.expect_load_account().returning(|_| {
            Ok(Some(AccountState {
                balance: BigInt::from(100),
                nonce: 4,
            }))
        });

        let projection = AccountProjection::new(Address::default(), &ledger).unwrap();

        assert_eq!(projection.nonce(), 5);
        assert_eq!(projection.balance(), &BigInt::from(100));
    }

    #[test]
    fn new_from_ledger_failure() {
        let mut ledger = MockLedger::new();
        ledger
            .expect_load_account()
            .returning(|_| Err(ErrorKind::DatabaseFault.into()));

        let err = AccountProjection::new(Address::default(), &ledger).unwrap_err();

        assert_eq!(err.kind, ErrorKind::DatabaseFault);
    }

    #[test]
    fn apply_sequence() {
        let mut projection = create_projection(100);

        for nonce in 1..=3 {
            let res = projection.apply(&create_test_tx(nonce, 10));
            assert_eq!(res, Admission::Accepted);
        }

        assert_eq!(projection.nonce(), 4);
        assert_eq!(projection.balance(), &BigInt::from(70));
        assert_eq!(projection.txs().len(), 3);
    }

    #[test]
    fn apply_duplicate() {
        let mut projection = create_projection(100);
        let tx = create_test_tx(1, 10);
        projection.apply(&tx);

        let res = projection.apply(&tx);

        assert_eq!(res, Admission::Rejected(ErrorKind::DuplicatedUnconfirmedTx));
        assert_eq!(projection.txs().len(), 1);
    }

    #[test]
    fn apply_replayed_nonce() {
        let mut projection = create_projection(100);
        projection.apply(&create_test_tx(1, 10));

        let res = projection.apply(&create_test_tx(1, 20));

        assert_eq!(res, Admission::Rejected(ErrorKind::NonceReplay));
    }

    #[test]
    fn apply_insufficient_balance() {
        let mut projection = create_projection(5);

        let res = projection.apply(&create_test_tx(1, 10));

        assert_eq!(res, Admission::Rejected(ErrorKind::InsufficientBalance));
        assert_eq!(projection.nonce(), 1);
        assert_eq!(projection.balance(), &BigInt::from(5));
    }

    #[test]
    fn apply_issue_relaxes_balance() {
        let mut projection = create_projection(0);
        let tx = create_test_tx_ext(&ed25519_test_keypair(), TxType::Issue, "00", "00", 1, 50);

        let res = projection.apply(&tx);

        assert_eq!(res, Admission::Accepted);
        assert_eq!(projection.balance(), &BigInt::from(-50));
        assert_eq!(projection.nonce(), 2);
    }

    #[test]
    fn apply_merged_keeps_nonce() {
        let mut projection = create_projection(0);
        let tx = create_test_tx_ext(&ed25519_test_keypair(), TxType::Merged, "00", "00", 9, 50);

        let res = projection.apply(&tx);

        assert_eq!(res, Admission::Accepted);
        assert_eq!(projection.nonce(), 1);
        assert!(projection.contains(&tx.hash()));
    }

    #[test]
    fn orphan_drain() {
        let mut projection = create_projection(100);

        assert_eq!(projection.apply(&create_test_tx(3, 10)), Admission::Orphaned);
        assert_eq!(projection.apply(&create_test_tx(1, 10)), Admission::Accepted);
        assert!(projection.drain_orphans().is_empty());
        assert_eq!(projection.apply(&create_test_tx(2, 10)), Admission::Accepted);
        let drained = projection.drain_orphans();

        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].nonce(), 3);
        assert!(projection.orphans().is_empty());
    }

    #[test]
    fn orphan_drain_contiguous_run_only() {
        let mut projection = create_projection(100);
        for nonce in [5, 2, 3] {
            projection.apply(&create_test_tx(nonce, 1));
        }
        projection.apply(&create_test_tx(1, 1));

        let drained = projection.drain_orphans();

        let nonces: Vec<u32> = drained.iter().map(|tx| tx.nonce()).collect();
        assert_eq!(nonces, vec![2, 3]);
        assert_eq!(projection.orphans().len(), 1);
    }

    #[test]
    fn orphan_cap_evicts_lowest() {
        let mut projection = create_projection(100);
        projection.orphans_cap = 2;

        for nonce in [4, 3, 5] {
            projection.apply(&create_test_tx(nonce, 1));
        }

        let nonces: Vec<u32> = projection.orphans().iter().map(|tx| tx.nonce()).collect();
        assert_eq!(nonces, vec![4, 5]);
    }

    #[test]
    fn commit_known_transactions() {
        let mut projection = create_projection(100);
        let txs: Vec<Transaction> = (1..=3).map(|n| create_test_tx(n, 10)).collect();
        txs.iter().for_each(|tx| {
            projection.apply(tx);
        });

        txs.iter().for_each(|tx| projection.commit(tx));

        assert_eq!(projection.nonce(), 4);
        assert_eq!(projection.balance(), &BigInt::from(70));
        assert!(projection.txs().is_empty());
    }

    #[test]
    fn commit_unknown_drops_earlier_entries() {
        let mut projection = create_projection(100);
        projection.apply(&create_test_tx(1, 10));
        projection.apply(&create_test_tx(2, 10));
        let foreign = create_test_tx(2, 30);

        projection.commit(&foreign);

        // Pending 1 and 2 are refunded, the committed 2 is charged.
        assert_eq!(projection.balance(), &BigInt::from(70));
        assert_eq!(projection.nonce(), 3);
        assert!(projection.txs().is_empty());
    }

    #[test]
    fn rollback_last_entry() {
        let mut projection = create_projection(100);
        projection.apply(&create_test_tx(1, 10));
        let tx = create_test_tx(2, 10);
        projection.apply(&tx);

        let res = projection.rollback(&tx);

        assert!(res);
        assert_eq!(projection.nonce(), 2);
        assert_eq!(projection.balance(), &BigInt::from(90));
        assert!(!projection.rollback(&tx));
    }

    fn create_exception_projection() -> AccountProjection {
        let mut projection = create_projection(10);
        projection.nonce = 5;
        for (nonce, amount) in [(1, 100), (2, 80), (3, 60), (4, 30)] {
            projection.track(create_test_tx(nonce, amount));
        }
        projection
    }

    #[test]
    fn exception_replacement_in_place() {
        let mut projection = create_exception_projection();
        let incoming = create_test_tx(2, 40);

        let replacement = projection.exception_check(&incoming).unwrap();

        assert_eq!(replacement.replaced.nonce(), 2);
        assert!(replacement.evicted.is_empty());
        assert_eq!(projection.balance(), &BigInt::from(50));
        assert_eq!(projection.nonce(), 5);
        assert_eq!(projection.txs()[1], incoming);
        assert_eq!(projection.txs().len(), 4);
    }

    #[test]
    fn exception_replacement_cascade_eviction() {
        let mut projection = create_exception_projection();
        let incoming = create_test_tx(2, 110);

        let replacement = projection.exception_check(&incoming).unwrap();

        // 10 + 80 - 110 = -20, evicting nonce 4 (30) recovers it.
        assert_eq!(replacement.evicted.len(), 1);
        assert_eq!(replacement.evicted[0].nonce(), 4);
        assert_eq!(projection.balance(), &BigInt::from(10));
        assert_eq!(projection.nonce(), 4);
        assert_eq!(projection.txs().len(), 3);
    }

    #[test]
    fn exception_replacement_refused() {
        let mut projection = create_exception_projection();
        let incoming = create_test_tx(3, 500);

        let res = projection.exception_check(&incoming);

        assert!(res.is_none());
        assert_eq!(projection.balance(), &BigInt::from(10));
        assert_eq!(projection.txs().len(), 4);
    }

    #[test]
    fn exception_nonce_out_of_window() {
        let mut projection = create_exception_projection();

        assert!(projection.exception_check(&create_test_tx(5, 1)).is_none());
        assert!(projection.exception_check(&create_test_tx(0, 1)).is_none());
    }

    #[test]
    fn cursor_iteration() {
        let mut projection = create_projection(100);
        let txs: Vec<Transaction> = (1..=3).map(|n| create_test_tx(n, 1)).collect();
        txs.iter().for_each(|tx| {
            projection.apply(tx);
        });

        projection.set_cursor(txs[0].hash());

        assert_eq!(projection.pending_after_cursor(), &txs[1..]);
        projection.rollback(&txs[0]);
        assert_eq!(projection.pending_after_cursor(), &txs[1..]);
    }
}
