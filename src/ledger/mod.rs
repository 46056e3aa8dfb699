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

//! Read access to the committed ledger state.
//!
//! Block storage lives outside of this crate; validator and consensus only
//! need the committed account state and the chain tip counters.

use crate::{
    base::{schema::Address, RwLock},
    Result,
};
use num_bigint::BigInt;
use std::collections::HashMap;

#[cfg(test)]
use mockall::automock;

/// Committed state of a sender account.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AccountState {
    pub balance: BigInt,
    /// Nonce of the last committed transaction (0 when none).
    pub nonce: u32,
}

/// Chain tip counters persisted with the last block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockchainInfo {
    pub height: u64,
    /// Sequence number of the last batch included in a block.
    pub seq_no: u64,
}

/// Trait providing access to the ledger.
#[cfg_attr(test, automock)]
pub trait Ledger: Send + Sync + 'static {
    /// Load committed account state. `None` for unknown accounts.
    fn load_account(&self, address: &Address) -> Result<Option<AccountState>>;

    /// Chain tip counters.
    fn blockchain_info(&self) -> BlockchainInfo;
}

/// In-memory ledger, used by embedders without a storage backend and by tests.
#[derive(Default)]
pub struct MemoryLedger {
    accounts: RwLock<HashMap<Address, AccountState>>,
    info: RwLock<BlockchainInfo>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_account(&self, address: Address, state: AccountState) {
        self.accounts.write().insert(address, state);
    }

    pub fn store_info(&self, info: BlockchainInfo) {
        *self.info.write() = info;
    }
}

impl Ledger for MemoryLedger {
    fn load_account(&self, address: &Address) -> Result<Option<AccountState>> {
        Ok(self.accounts.read().get(address).cloned())
    }

    fn blockchain_info(&self) -> BlockchainInfo {
        *self.info.read()
    }
}
