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

pub mod context;
pub mod schema;
pub mod serialize;

pub use context::Context;
pub use schema::{Address, AssetDescriptor, ChainCoordinate, Transaction, TransactionData, TxType};

use std::time::{SystemTime, UNIX_EPOCH};

/// Mutex with the `parking_lot` semantics (no poisoning).
pub type Mutex<T> = parking_lot::Mutex<T>;

/// RwLock with the `parking_lot` semantics (no poisoning).
pub type RwLock<T> = parking_lot::RwLock<T>;

/// Seconds since the Unix epoch.
pub fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}

/// Nanoseconds since the Unix epoch. Used for batch ids and primary bids.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}
