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

//! Admission rules shared by the pool and the batch verification.

use crate::{
    base::{
        schema::{Address, AssetDescriptor, Transaction, TxType},
        Context,
    },
    Error, ErrorKind, Result,
};

fn illegal(tx: &Transaction, rule: &str) -> Error {
    Error::new_ext(
        ErrorKind::IllegalChainCoordinate,
        format!(
            "{:?} from {} to {}: {}",
            tx.tx_type(),
            tx.from_chain(),
            tx.to_chain(),
            rule
        ),
    )
}

/// Chain coordinates and type specific rules.
pub fn check_legality(tx: &Transaction, ctx: &Context) -> Result<()> {
    let from = tx.from_chain();
    let to = tx.to_chain();
    if !ctx.is_local(from) && !ctx.is_local(to) {
        return Err(illegal(tx, "no side on the local chain"));
    }
    match tx.tx_type() {
        TxType::Atomic => {
            if from != to {
                return Err(illegal(tx, "atomic must stay on one chain"));
            }
        }
        TxType::AcrossChain => {
            if from.len() != to.len() || from == to {
                return Err(illegal(tx, "across chain needs two sibling chains"));
            }
        }
        TxType::Distribute => {
            if from != &to.parent() || tx.sender() != tx.recipient() {
                return Err(illegal(tx, "distribute goes from parent to child"));
            }
        }
        TxType::Backfront => {
            if &from.parent() != to || tx.sender() != tx.recipient() {
                return Err(illegal(tx, "backfront goes from child to parent"));
            }
        }
        TxType::Merged => (),
        TxType::Issue | TxType::IssueUpdate => {
            if from.len() != to.len() {
                return Err(illegal(tx, "issue chains must be on the same level"));
            }
            if !ctx.is_issuer(tx.sender()) {
                return Err(Error::new_ext(
                    ErrorKind::UnauthorizedIssuer,
                    tx.sender().to_string(),
                ));
            }
            if !tx.data.payload.is_empty() {
                AssetDescriptor::parse(&tx.data.payload)?;
            }
        }
        TxType::ContractInit | TxType::ContractInvoke => (),
        TxType::ContractQuery => {
            return Err(Error::new_ext(
                ErrorKind::UnsupportedTransaction,
                "contract queries are never pooled",
            ));
        }
    }
    Ok(())
}

/// Legality followed by signature verification. Returns the signer.
pub fn check_transaction(tx: &Transaction, ctx: &Context) -> Result<Address> {
    check_legality(tx, ctx)?;
    tx.verify()
}
