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

//! Strict sequence order gate.
//!
//! Instance `n + 1` may complete a phase only after instance `n` completed
//! it or exited. Sequence numbers notified out of order are kept until the
//! gap before them is closed.

use std::collections::BTreeSet;

#[derive(Debug, Default)]
pub struct SeqGate {
    /// Highest sequence number with all its predecessors done.
    current: u64,
    /// Done sequence numbers beyond `current + 1`.
    ahead: BTreeSet<u64>,
}

impl SeqGate {
    pub fn new(current: u64) -> Self {
        SeqGate {
            current,
            ahead: BTreeSet::new(),
        }
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    /// True when every predecessor of `seq_no` is done.
    pub fn can_pass(&self, seq_no: u64) -> bool {
        seq_no <= self.current + 1
    }

    pub fn notify(&mut self, seq_no: u64) {
        if seq_no <= self.current {
            return;
        }
        self.ahead.insert(seq_no);
        while self.ahead.remove(&(self.current + 1)) {
            self.current += 1;
        }
    }

    /// Mark every sequence number up to `seq_no` as done.
    pub fn advance(&mut self, seq_no: u64) {
        if seq_no <= self.current {
            return;
        }
        self.current = seq_no;
        self.ahead.retain(|done| *done > seq_no);
        while self.ahead.remove(&(self.current + 1)) {
            self.current += 1;
        }
    }

    /// Restart from a new base, forgetting the pending notifications.
    pub fn reset(&mut self, current: u64) {
        self.current = current;
        self.ahead.clear();
    }
}
