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

use crate::{
    base::{
        schema::Address,
        serialize::{duration_ms, json_load},
    },
    Result,
};
use std::{path::Path, time::Duration};

/// Default pool capacity.
pub const DEFAULT_TX_POOL_CAPACITY: usize = 200_000;
/// Default time a transaction may wait in the pool.
pub const DEFAULT_TX_POOL_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Default sender ban duration.
pub const DEFAULT_BLACKLIST_DURATION: Duration = Duration::from_secs(60);

/// Validator and transaction pool configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ValidatorConfig {
    /// When false every batch is accepted without re-running the sequencing.
    pub is_valid: bool,
    /// Max number of pending transactions.
    pub tx_pool_capacity: usize,
    /// Max age of a pending transaction.
    #[serde(with = "duration_ms")]
    pub tx_pool_timeout: Duration,
    /// Duration of a sender ban.
    #[serde(with = "duration_ms")]
    pub blacklist_duration: Duration,
    /// Addresses allowed to send Issue transactions.
    pub issuers: Vec<Address>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        ValidatorConfig {
            is_valid: true,
            tx_pool_capacity: DEFAULT_TX_POOL_CAPACITY,
            tx_pool_timeout: DEFAULT_TX_POOL_TIMEOUT,
            blacklist_duration: DEFAULT_BLACKLIST_DURATION,
            issuers: vec![],
        }
    }
}

impl ValidatorConfig {
    /// Load from a JSON file. Missing fields take the default value.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        json_load(path)
    }
}
