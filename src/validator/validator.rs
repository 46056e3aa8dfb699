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

//! Transaction admission and batch sequencing.
//!
//! Lock order is validator accounts map, then a single sender projection,
//! then the pool. Two projections are never locked at the same time.

use crate::{
    base::{
        schema::{Address, ChainCoordinate, Transaction},
        Context, Mutex,
    },
    consensus::{BatchOutcome, OutputTxs, Stack},
    crypto::Hash,
    ledger::{BlockchainInfo, Ledger},
    validator::{
        account::{AccountProjection, Admission},
        check::check_transaction,
        config::ValidatorConfig,
        txpool::TxPool,
    },
    Error, ErrorKind, Result,
};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

type SharedProjection = Arc<Mutex<AccountProjection>>;

pub struct Validator<L: Ledger> {
    config: ValidatorConfig,
    ctx: Context,
    ledger: Arc<L>,
    /// Sender projections keyed by address string.
    accounts: Mutex<HashMap<String, SharedProjection>>,
    pool: Mutex<TxPool>,
}

impl<L: Ledger> Validator<L> {
    pub fn new(config: ValidatorConfig, chain: ChainCoordinate, ledger: Arc<L>) -> Self {
        let ctx = Context::new(chain, config.issuers.clone());
        let pool = TxPool::new(&config);
        Validator {
            config,
            ctx,
            ledger,
            accounts: Mutex::new(HashMap::new()),
            pool: Mutex::new(pool),
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn pool_len(&self) -> usize {
        self.pool.lock().len()
    }

    /// Snapshot of the pool content.
    pub fn pool_txs(&self) -> Vec<Transaction> {
        self.pool.lock().txs().to_vec()
    }

    /// Cached projection, loaded from the ledger on first access.
    pub fn fetch_account(&self, address: &Address) -> Result<SharedProjection> {
        let mut accounts = self.accounts.lock();
        if let Some(account) = accounts.get(&address.to_string()) {
            return Ok(account.clone());
        }
        let projection = AccountProjection::new(*address, self.ledger.as_ref())?;
        let account = Arc::new(Mutex::new(projection));
        accounts.insert(address.to_string(), account.clone());
        Ok(account)
    }

    fn cached_account(&self, address: &Address) -> Option<SharedProjection> {
        self.accounts.lock().get(&address.to_string()).cloned()
    }

    /// Admit a transaction into the pool.
    pub fn push_into_pool(&self, tx: Transaction) -> Result<()> {
        let sender = check_transaction(&tx, &self.ctx)?;
        if !self.ctx.is_local(tx.from_chain()) {
            return Err(Error::new_ext(
                ErrorKind::IllegalChainCoordinate,
                format!("{} enters through its source chain", tx.hash()),
            ));
        }
        self.pool.lock().check_admission(&tx)?;

        let account = self.fetch_account(&sender)?;
        let res = {
            let mut projection = account.lock();
            self.forward_orphans(&mut projection);
            match projection.apply(&tx) {
                Admission::Accepted => {
                    let pushed = self.pool.lock().push(tx.clone(), &self.ctx);
                    match pushed {
                        Ok(()) => {
                            self.forward_orphans(&mut projection);
                            Ok(())
                        }
                        Err(err) => {
                            projection.rollback(&tx);
                            Err(err)
                        }
                    }
                }
                Admission::Orphaned => {
                    debug!("[validator] {} parked nonce {}", sender, tx.nonce());
                    Err(Error::new_ext(
                        ErrorKind::NonceGap,
                        format!("expected {}", projection.nonce()),
                    ))
                }
                Admission::Rejected(ErrorKind::NonceReplay) => {
                    self.replace_pending(&mut projection, &tx)
                }
                Admission::Rejected(kind) => Err(kind.into()),
            }
        };
        self.settle_evicted();
        res
    }

    /// Re-apply the orphans made eligible by the last admission.
    fn forward_orphans(&self, projection: &mut AccountProjection) {
        loop {
            let run = projection.drain_orphans();
            if run.is_empty() {
                break;
            }
            for tx in run {
                if projection.apply(&tx) != Admission::Accepted {
                    debug!("[validator] dropped orphan {}", tx.hash());
                    continue;
                }
                let pushed = self.pool.lock().push(tx.clone(), &self.ctx);
                if let Err(err) = pushed {
                    debug!("[validator] orphan {} refused: {}", tx.hash(), err);
                    projection.rollback(&tx);
                }
            }
        }
    }

    /// Replacement of a pending entry sharing the nonce of `tx`.
    pub fn exception_transaction_check(&self, tx: &Transaction) -> Result<()> {
        let sender = check_transaction(tx, &self.ctx)?;
        let account = self.fetch_account(&sender)?;
        let res = self.replace_pending(&mut account.lock(), tx);
        self.settle_evicted();
        res
    }

    fn replace_pending(&self, projection: &mut AccountProjection, tx: &Transaction) -> Result<()> {
        let mut pool = self.pool.lock();
        let pending = projection
            .txs()
            .iter()
            .find(|entry| entry.nonce() == tx.nonce())
            .map(|entry| pool.is_pending(&entry.hash()))
            .unwrap_or(false);
        if !pending {
            return Err(ErrorKind::NonceReplay.into());
        }
        // Nothing may fail once the projection switched to the replacement.
        pool.check_admission(tx)?;
        let replacement = match projection.exception_check(tx) {
            Some(replacement) => replacement,
            None => return Err(ErrorKind::NonceReplay.into()),
        };

        let mut stale: Vec<Hash> = vec![replacement.replaced.hash()];
        stale.extend(replacement.evicted.iter().map(|entry| entry.hash()));
        pool.remove(&stale);
        pool.push(tx.clone(), &self.ctx)?;
        info!(
            "[validator] {} nonce {} replaced, {} evicted",
            projection.address(),
            tx.nonce(),
            replacement.evicted.len()
        );
        Ok(())
    }

    /// Roll back the projections of the transactions dropped by the pool.
    fn settle_evicted(&self) {
        let evicted = self.pool.lock().take_evicted();
        for tx in evicted {
            if let Some(account) = self.cached_account(tx.sender()) {
                account.lock().rollback(&tx);
            }
        }
    }

    /// Sequencing check of a proposed batch.
    ///
    /// On failure every projection change done by this call is undone.
    pub fn verify_batch(&self, txs: &[Transaction], is_primary: bool) -> bool {
        if is_primary || !self.config.is_valid {
            return true;
        }
        let mut applied: Vec<(SharedProjection, &Transaction)> = vec![];
        for tx in txs {
            match self.verify_one(tx) {
                Ok(Some(account)) => applied.push((account, tx)),
                Ok(None) => (),
                Err(err) => {
                    debug!("[validator] batch refused at {}: {}", tx.hash(), err);
                    for (account, tx) in applied.iter().rev() {
                        account.lock().rollback(tx);
                    }
                    return false;
                }
            }
        }
        true
    }

    /// Returns the projection touched, `None` when the tx was already known.
    fn verify_one(&self, tx: &Transaction) -> Result<Option<SharedProjection>> {
        let sender = check_transaction(tx, &self.ctx)?;
        let account = self.fetch_account(&sender)?;
        let admission = {
            let mut projection = account.lock();
            if projection.contains(&tx.hash()) {
                return Ok(None);
            }
            projection.apply(tx)
        };
        match admission {
            Admission::Accepted => Ok(Some(account)),
            Admission::Orphaned => Err(ErrorKind::NonceGap.into()),
            Admission::Rejected(kind) => Err(kind.into()),
        }
    }

    /// Account for a block.
    ///
    /// `committed` holds the local transactions agreed by consensus, `group`
    /// the ones actually included, `other` the incoming foreign ones.
    pub fn commit_batch(
        &self,
        committed: &[Transaction],
        group: &[Transaction],
        other: &[Transaction],
    ) -> Result<()> {
        if committed.len() < group.len() {
            return Err(Error::new_ext(
                ErrorKind::Fatal,
                format!("{} committed, {} included", committed.len(), group.len()),
            ));
        }
        let included: HashSet<Hash> = group.iter().map(|tx| tx.hash()).collect();
        for tx in committed.iter().filter(|tx| !included.contains(&tx.hash())) {
            let account = self.fetch_account(tx.sender())?;
            account.lock().rollback(tx);
        }
        for tx in group {
            let account = self.fetch_account(tx.sender())?;
            account.lock().commit(tx);
            self.credit_recipient(tx);
        }
        for tx in other {
            self.credit_recipient(tx);
        }

        let hashes: Vec<Hash> = committed.iter().map(|tx| tx.hash()).collect();
        let removed = self.pool.lock().remove(&hashes);
        debug!(
            "[validator] committed {}, removed {} from pool",
            group.len(),
            removed
        );
        Ok(())
    }

    /// Only cached projections are credited, the others are loaded later
    /// from the updated ledger.
    fn credit_recipient(&self, tx: &Transaction) {
        if !self.ctx.is_local(tx.to_chain()) || tx.sender() == tx.recipient() {
            return;
        }
        if let Some(account) = self.cached_account(tx.recipient()) {
            account.lock().credit(&tx.amount());
        }
    }

    /// Split a block output and commit it.
    pub fn commit_output(&self, output: &OutputTxs) -> Result<()> {
        let mut local = vec![];
        let mut other = vec![];
        for slice in output.outputs.iter() {
            if slice.is_local_chain {
                local.extend(slice.transactions.iter().cloned());
            } else {
                other.extend(slice.transactions.iter().cloned());
            }
        }
        self.commit_batch(&local, &local, &other)
    }

    /// Pending transactions grouped by destination chain.
    ///
    /// The first bucket is the local chain, at most `group_count` more are
    /// opened. A sender stops at its first transaction that does not fit, so
    /// nonces are increasing within each bucket.
    pub fn group_pending(&self, group_count: usize, max_per_group: usize) -> Vec<Vec<Transaction>> {
        let mut accounts: Vec<(String, SharedProjection)> = self
            .accounts
            .lock()
            .iter()
            .map(|(key, account)| (key.clone(), account.clone()))
            .collect();
        accounts.sort_by(|a, b| a.0.cmp(&b.0));

        let mut buckets: Vec<(ChainCoordinate, Vec<Transaction>)> =
            vec![(self.ctx.chain.clone(), vec![])];
        for (_, account) in accounts {
            let mut projection = account.lock();
            let mut last = None;
            for tx in projection.pending_after_cursor() {
                let pos = match buckets.iter().position(|(chain, _)| chain == tx.to_chain()) {
                    Some(pos) => pos,
                    None if buckets.len() <= group_count => {
                        buckets.push((tx.to_chain().clone(), vec![]));
                        buckets.len() - 1
                    }
                    None => break,
                };
                if buckets[pos].1.len() >= max_per_group {
                    break;
                }
                buckets[pos].1.push(tx.clone());
                last = Some(tx.hash());
            }
            if let Some(hash) = last {
                projection.set_cursor(hash);
            }
        }
        buckets.into_iter().map(|(_, txs)| txs).collect()
    }

    pub fn next_batch(&self, max_size: usize, max_wait: Duration) -> Vec<Transaction> {
        let batch = self.pool.lock().next(max_size, max_wait);
        self.settle_evicted();
        batch
    }

    /// Settle the fate of a batch pulled from the pool.
    pub fn handle_outcome(&self, outcome: BatchOutcome, txs: &[Transaction]) {
        match outcome {
            BatchOutcome::Rewind | BatchOutcome::Failed => {
                debug!("[validator] {:?} batch of {}", outcome, txs.len());
                self.pool.lock().rewind_cursor(txs.len());
                let senders: HashSet<&Address> = txs.iter().map(|tx| tx.sender()).collect();
                for sender in senders {
                    if let Some(account) = self.cached_account(sender) {
                        account.lock().reset_cursor();
                    }
                }
            }
            BatchOutcome::Verified | BatchOutcome::Succeeded => {
                trace!("[validator] {:?} batch of {}", outcome, txs.len());
            }
        }
    }

    pub fn blacklist_sender(&self, sender: Address) {
        self.pool.lock().blacklist_sender(sender);
    }
}

impl<L: Ledger> Stack for Validator<L> {
    fn verify_batch(&self, txs: &[Transaction], is_primary: bool) -> bool {
        Validator::verify_batch(self, txs, is_primary)
    }

    fn blockchain_info(&self) -> BlockchainInfo {
        self.ledger.blockchain_info()
    }

    fn next_batch(&self, max_size: usize, max_wait: Duration) -> Vec<Transaction> {
        Validator::next_batch(self, max_size, max_wait)
    }

    fn handle_outcome(&self, outcome: BatchOutcome, txs: &[Transaction]) {
        Validator::handle_outcome(self, outcome, txs)
    }
}
