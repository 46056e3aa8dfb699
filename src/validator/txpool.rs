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

//! Pool of admitted transactions waiting to be proposed.
//!
//! Entries are kept sorted by creation time. A cursor separates the entries
//! already handed to consensus from the ones still to be proposed.

use crate::{
    base::{
        now_secs,
        schema::{Address, Transaction},
        Context,
    },
    crypto::Hash,
    validator::{check::check_legality, config::ValidatorConfig},
    Error, ErrorKind, Result,
};
use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

pub struct TxPool {
    capacity: usize,
    timeout: Duration,
    blacklist_duration: Duration,
    /// Pending transactions sorted by creation time.
    txs: Vec<Transaction>,
    /// Hashes of `txs`.
    mapping: HashSet<Hash>,
    /// Banned senders with the ban expiration.
    blacklist: HashMap<Address, Instant>,
    /// Index of the next entry to propose.
    cursor: usize,
    /// Entries dropped by the pool itself, waiting to be collected.
    evicted: Vec<Transaction>,
}

impl TxPool {
    pub fn new(config: &ValidatorConfig) -> Self {
        TxPool {
            capacity: config.tx_pool_capacity.max(1),
            timeout: config.tx_pool_timeout,
            blacklist_duration: config.blacklist_duration,
            txs: vec![],
            mapping: HashSet::new(),
            blacklist: HashMap::new(),
            cursor: 0,
            evicted: vec![],
        }
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.mapping.contains(hash)
    }

    /// In the pool and not yet handed to consensus.
    pub fn is_pending(&self, hash: &Hash) -> bool {
        self.txs[self.cursor.min(self.txs.len())..]
            .iter()
            .any(|tx| &tx.hash() == hash)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn txs(&self) -> &[Transaction] {
        &self.txs
    }

    fn is_expired(&self, tx: &Transaction, now: u32) -> bool {
        (tx.create_time() as u64 + self.timeout.as_secs()) < now as u64
    }

    fn is_blacklisted(&mut self, sender: &Address) -> bool {
        match self.blacklist.get(sender) {
            Some(expire) if *expire > Instant::now() => true,
            Some(_) => {
                self.blacklist.remove(sender);
                false
            }
            None => false,
        }
    }

    /// Checks not involving the chain coordinates.
    pub fn check_admission(&mut self, tx: &Transaction) -> Result<()> {
        if self.is_expired(tx, now_secs()) {
            return Err(Error::new_ext(
                ErrorKind::ExpiredTransaction,
                format!("created at {}", tx.create_time()),
            ));
        }
        if self.is_blacklisted(tx.sender()) {
            return Err(Error::new_ext(
                ErrorKind::BlacklistedSender,
                tx.sender().to_string(),
            ));
        }
        if self.mapping.contains(&tx.hash()) {
            return Err(ErrorKind::DuplicatedUnconfirmedTx.into());
        }
        Ok(())
    }

    /// Insert a transaction keeping the creation time order.
    ///
    /// Entries already proposed are never reordered: a late transaction is
    /// placed not before the cursor.
    pub fn push(&mut self, tx: Transaction, ctx: &Context) -> Result<()> {
        check_legality(&tx, ctx)?;
        self.check_admission(&tx)?;

        let pos = self
            .txs
            .iter()
            .rposition(|entry| entry.create_time() <= tx.create_time())
            .map(|pos| pos + 1)
            .unwrap_or(0)
            .max(self.cursor);
        self.mapping.insert(tx.hash());
        self.txs.insert(pos, tx);

        if self.txs.len() > self.capacity {
            let evicted = self.remove_at(0);
            warn!("[txpool] pool full, evicted {}", evicted.hash());
            self.evicted.push(evicted);
        }
        Ok(())
    }

    fn remove_at(&mut self, pos: usize) -> Transaction {
        let tx = self.txs.remove(pos);
        self.mapping.remove(&tx.hash());
        if pos < self.cursor {
            self.cursor -= 1;
        }
        tx
    }

    /// Collect the next batch starting from the cursor.
    ///
    /// The batch holds at most `max_size` entries sharing the chains of the
    /// first one. Expired entries and entries of banned senders
    /// found on the way are evicted.
    pub fn next(&mut self, max_size: usize, max_wait: Duration) -> Vec<Transaction> {
        let deadline = Instant::now() + max_wait;
        let now = now_secs();
        let mut batch: Vec<Transaction> = vec![];
        while self.cursor < self.txs.len() && batch.len() < max_size {
            let tx = &self.txs[self.cursor];
            let sender = *tx.sender();
            if self.is_expired(tx, now) || self.is_blacklisted(&sender) {
                let evicted = self.remove_at(self.cursor);
                debug!("[txpool] evicted stale {}", evicted.hash());
                self.evicted.push(evicted);
                continue;
            }
            let tx = &self.txs[self.cursor];
            if let Some(head) = batch.first() {
                if head.to_chain() != tx.to_chain() || head.from_chain() != tx.from_chain() {
                    break;
                }
            }
            batch.push(tx.clone());
            self.cursor += 1;
            if Instant::now() >= deadline {
                break;
            }
        }
        batch
    }

    /// Move the cursor `n` entries back.
    pub fn rewind_cursor(&mut self, n: usize) {
        self.cursor = self.cursor.min(self.txs.len()).saturating_sub(n);
    }

    pub fn reset_cursor(&mut self) {
        self.cursor = 0;
    }

    /// Delete entries by hash. Returns the number of removed entries.
    pub fn remove(&mut self, hashes: &[Hash]) -> usize {
        let targets: HashSet<&Hash> = hashes
            .iter()
            .filter(|hash| self.mapping.contains(*hash))
            .collect();
        if targets.is_empty() {
            return 0;
        }
        let before_cursor = self.txs[..self.cursor.min(self.txs.len())]
            .iter()
            .filter(|tx| targets.contains(&tx.hash()))
            .count();
        self.txs.retain(|tx| !targets.contains(&tx.hash()));
        for hash in targets.iter() {
            self.mapping.remove(*hash);
        }
        self.cursor -= before_cursor;
        targets.len()
    }

    /// Ban a sender for the configured duration.
    pub fn blacklist_sender(&mut self, sender: Address) {
        info!("[txpool] blacklisting {}", sender);
        self.blacklist
            .insert(sender, Instant::now() + self.blacklist_duration);
    }

    pub fn is_sender_blacklisted(&mut self, sender: &Address) -> bool {
        self.is_blacklisted(sender)
    }

    /// Entries dropped since the last call.
    pub fn take_evicted(&mut self) -> Vec<Transaction> {
        std::mem::take(&mut self.evicted)
    }
}
