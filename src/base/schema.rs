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

//! Core data structures shared by validator and consensus.

use crate::{
    base::serialize::rmp_serialize,
    crypto::{Hash, Hashable, KeyPair, PublicKey},
    Error, ErrorKind, Result,
};
use num_bigint::{BigInt, BigUint};
use serde::{de::Visitor, Deserializer, Serializer};
use std::{
    fmt::{Debug, Display, Formatter},
    sync::OnceLock,
};

/// Account address, derived from the owner public key.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address([u8; Address::LEN]);

impl Address {
    pub const LEN: usize = 20;

    pub fn new(bytes: [u8; Address::LEN]) -> Self {
        Address(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Address::LEN {
            return Err(Error::new_ext(
                ErrorKind::MalformedData,
                format!("bad address length {}", bytes.len()),
            ));
        }
        let mut buf = [0u8; Address::LEN];
        buf.copy_from_slice(bytes);
        Ok(Address(buf))
    }

    /// Parses the base58 textual form.
    pub fn from_str_b58(s: &str) -> Result<Self> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))?;
        Address::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", bs58::encode(&self.0).into_string())
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl serde::Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct AddressVisitor;

        impl<'v> Visitor<'v> for AddressVisitor {
            type Value = Address;

            fn expecting(&self, fmt: &mut Formatter<'_>) -> std::fmt::Result {
                write!(fmt, "expecting 20 bytes or a base58 string.")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> std::result::Result<Address, E> {
                Address::from_bytes(v).map_err(|_err| E::custom("Invalid address"))
            }

            fn visit_byte_buf<E: serde::de::Error>(
                self,
                v: Vec<u8>,
            ) -> std::result::Result<Address, E> {
                self.visit_bytes(&v)
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> std::result::Result<Address, E> {
                Address::from_str_b58(v).map_err(|_err| E::custom("Invalid address"))
            }
        }

        if deserializer.is_human_readable() {
            deserializer.deserialize_str(AddressVisitor)
        } else {
            deserializer.deserialize_byte_buf(AddressVisitor)
        }
    }
}

/// Position of a chain in the chains tree.
///
/// Each byte is a level: `00` is a root chain, `0001` is its child `01`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ChainCoordinate(Vec<u8>);

impl ChainCoordinate {
    pub fn new(bytes: Vec<u8>) -> Self {
        ChainCoordinate(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        hex::decode(s)
            .map(ChainCoordinate)
            .map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Parent coordinate. The parent of a root chain is the empty coordinate.
    pub fn parent(&self) -> ChainCoordinate {
        let end = self.0.len().saturating_sub(1);
        ChainCoordinate(self.0[..end].to_vec())
    }
}

impl Display for ChainCoordinate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl Debug for ChainCoordinate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Chain({})", self)
    }
}

impl serde::Serialize for ChainCoordinate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ChainCoordinate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ChainCoordinate::from_hex(&s)
            .map_err(|_err| serde::de::Error::custom("Invalid chain coordinate"))
    }
}

/// Transaction kinds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TxType {
    Atomic,
    AcrossChain,
    Distribute,
    Backfront,
    Merged,
    Issue,
    IssueUpdate,
    ContractInit,
    ContractInvoke,
    ContractQuery,
}

impl TxType {
    fn code(&self) -> u8 {
        use TxType::*;
        match self {
            Atomic => 0,
            AcrossChain => 1,
            Distribute => 2,
            Backfront => 3,
            Merged => 4,
            Issue => 5,
            IssueUpdate => 6,
            ContractInit => 7,
            ContractInvoke => 8,
            ContractQuery => 9,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        use TxType::*;
        let tx_type = match code {
            0 => Atomic,
            1 => AcrossChain,
            2 => Distribute,
            3 => Backfront,
            4 => Merged,
            5 => Issue,
            6 => IssueUpdate,
            7 => ContractInit,
            8 => ContractInvoke,
            9 => ContractQuery,
            _ => return None,
        };
        Some(tx_type)
    }

    /// Issue kinds are allowed to push the sender balance below zero.
    pub fn is_issue(&self) -> bool {
        matches!(self, TxType::Issue | TxType::IssueUpdate)
    }
}

impl serde::Serialize for TxType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> serde::Deserialize<'de> for TxType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        TxType::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("Unknown transaction type {}", code)))
    }
}

/// Signed transaction content.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct TransactionData {
    pub tx_type: TxType,
    pub from_chain: ChainCoordinate,
    pub to_chain: ChainCoordinate,
    pub sender: Address,
    pub recipient: Address,
    pub asset_id: u32,
    pub amount: BigUint,
    pub fee: BigUint,
    pub nonce: u32,
    /// Seconds since epoch.
    pub create_time: u32,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl TransactionData {
    /// Sign the MessagePack representation of the data.
    pub fn sign(&self, keypair: &KeyPair) -> Result<Vec<u8>> {
        let data = rmp_serialize(self)?;
        Ok(keypair.sign(&data))
    }
}

/// Transaction as exchanged by the network.
#[derive(Serialize, Deserialize, Clone)]
pub struct Transaction {
    pub data: TransactionData,
    pub public_key: PublicKey,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
    #[serde(skip)]
    hash: OnceLock<Hash>,
}

impl Debug for Transaction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("hash", &self.hash())
            .field("data", &self.data)
            .finish()
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
            && self.public_key == other.public_key
            && self.signature == other.signature
    }
}

impl Eq for Transaction {}

impl Transaction {
    /// Build a transaction signed with the given keypair.
    pub fn new(data: TransactionData, keypair: &KeyPair) -> Result<Self> {
        let signature = data.sign(keypair)?;
        Ok(Transaction {
            data,
            public_key: keypair.public_key(),
            signature,
            hash: OnceLock::new(),
        })
    }

    /// Transaction identifier. Computed once and cached.
    pub fn hash(&self) -> Hash {
        *self.hash.get_or_init(|| self.primary_hash())
    }

    /// Check the signature and return the address of the signer.
    ///
    /// Fails with `InvalidSignature` when the signature does not verify or
    /// when the signer is not the declared sender.
    pub fn verify(&self) -> Result<Address> {
        let data = rmp_serialize(&self.data)?;
        if !self.public_key.verify(&data, &self.signature) {
            return Err(ErrorKind::InvalidSignature.into());
        }
        let address = self.public_key.to_address();
        if address != self.data.sender {
            return Err(Error::new_ext(
                ErrorKind::InvalidSignature,
                format!("signer {} is not the sender {}", address, self.data.sender),
            ));
        }
        Ok(address)
    }

    pub fn tx_type(&self) -> TxType {
        self.data.tx_type
    }

    pub fn sender(&self) -> &Address {
        &self.data.sender
    }

    pub fn recipient(&self) -> &Address {
        &self.data.recipient
    }

    pub fn from_chain(&self) -> &ChainCoordinate {
        &self.data.from_chain
    }

    pub fn to_chain(&self) -> &ChainCoordinate {
        &self.data.to_chain
    }

    pub fn nonce(&self) -> u32 {
        self.data.nonce
    }

    pub fn create_time(&self) -> u32 {
        self.data.create_time
    }

    pub fn amount(&self) -> BigInt {
        BigInt::from(self.data.amount.clone())
    }

    /// Amount plus fee.
    pub fn cost(&self) -> BigInt {
        BigInt::from(&self.data.amount + &self.data.fee)
    }
}

/// Asset description carried by Issue and IssueUpdate payloads.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct AssetDescriptor {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub descr: Option<String>,
    #[serde(default)]
    pub precision: Option<u8>,
}

impl AssetDescriptor {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|err| Error::new_ext(ErrorKind::InvalidAsset, err))
    }
}
