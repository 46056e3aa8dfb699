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

//! Lightweight byzantine fault tolerant consensus.
//!
//! Every batch runs its own three phase instance. The core sequences the
//! instances, elects the primary through view change campaigns and delivers
//! the committed batches in strict sequence order.

mod engine;
mod gate;
mod instance;
pub mod message;
pub mod options;
mod service;
mod timer;
mod vote;
mod worker;

pub use engine::LbftCore;
pub use message::{
    Commit, Committed, FetchCommitted, Message, NullRequest, PrePrepare, Prepare, RequestBatch,
    ViewChange,
};
pub use options::LbftOptions;
pub use service::LbftService;

/// Lowest quorum accepted for any phase.
pub const MIN_QUORUM: usize = 3;

/// Batch id of the empty batches keeping the block clock alive.
pub const EMPTY_BLOCK: i64 = 1_136_160_000;

/// View change campaign raised by request and block timeouts.
pub const CAMPAIGN_LBFT: &str = "lbft";

/// View change campaign rotating the primary.
pub const CAMPAIGN_PERIOD: &str = "lbft-period";
