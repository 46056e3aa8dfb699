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

//! Node-wide read-only settings handed to every component constructor.

use crate::base::schema::{Address, ChainCoordinate};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Context {
    /// Chain this node belongs to.
    pub chain: ChainCoordinate,
    /// Addresses allowed to send Issue and IssueUpdate transactions.
    pub issuers: Vec<Address>,
}

impl Context {
    pub fn new(chain: ChainCoordinate, issuers: Vec<Address>) -> Self {
        Context { chain, issuers }
    }

    pub fn is_local(&self, chain: &ChainCoordinate) -> bool {
        &self.chain == chain
    }

    pub fn is_issuer(&self, address: &Address) -> bool {
        self.issuers.contains(address)
    }
}
