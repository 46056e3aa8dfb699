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

//! LBFT wire records.
//!
//! Every message travels as an envelope `{tag, payload}` where the payload
//! is the MessagePack encoding of the record selected by the tag.

use super::EMPTY_BLOCK;
use crate::{
    base::{
        schema::{ChainCoordinate, Transaction},
        serialize::{rmp_deserialize, rmp_serialize},
    },
    crypto::Hash,
    Error, ErrorKind, Result,
};

pub const TAG_REQUEST_BATCH: u32 = 1;
pub const TAG_PRE_PREPARE: u32 = 2;
pub const TAG_PREPARE: u32 = 3;
pub const TAG_COMMIT: u32 = 4;
pub const TAG_COMMITTED: u32 = 5;
pub const TAG_FETCH_COMMITTED: u32 = 6;
pub const TAG_VIEW_CHANGE: u32 = 11;
pub const TAG_NULL_REQUEST: u32 = 12;

fn digest_of<T: serde::Serialize>(val: &T) -> String {
    rmp_serialize(val)
        .map(|buf| Hash::from_data(&buf).to_hex())
        .unwrap_or_default()
}

/// Bundle of transactions proposed atomically.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestBatch {
    /// Seconds since epoch.
    pub time: u32,
    pub requests: Vec<Transaction>,
    /// Nanosecond timestamp or `EMPTY_BLOCK`.
    pub id: i64,
    /// Slice position, zero for the first one.
    pub index: u32,
}

impl RequestBatch {
    pub fn new(requests: Vec<Transaction>, time: u32, id: i64) -> Self {
        RequestBatch {
            time,
            requests,
            id,
            index: 0,
        }
    }

    /// Batch without transactions advancing the block clock.
    pub fn empty_block(time: u32) -> Self {
        Self::new(vec![], time, EMPTY_BLOCK)
    }

    pub fn is_empty_block(&self) -> bool {
        self.id == EMPTY_BLOCK
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Source and destination chains shared by all the requests.
    ///
    /// `None` for an empty batch. Mixed coordinates are a `Fatal` error.
    pub fn chains(&self) -> Result<Option<(ChainCoordinate, ChainCoordinate)>> {
        let first = match self.requests.first() {
            Some(tx) => tx,
            None => return Ok(None),
        };
        let from = first.from_chain();
        let to = first.to_chain();
        for tx in self.requests.iter().skip(1) {
            if tx.from_chain() != from || tx.to_chain() != to {
                return Err(Error::new_ext(
                    ErrorKind::Fatal,
                    format!(
                        "mixed batch: {}->{} and {}->{}",
                        from,
                        to,
                        tx.from_chain(),
                        tx.to_chain()
                    ),
                ));
            }
        }
        Ok(Some((from.clone(), to.clone())))
    }

    /// Chains of the batch, the local one for an empty batch.
    pub fn chains_or(&self, local: &ChainCoordinate) -> Result<(ChainCoordinate, ChainCoordinate)> {
        Ok(self
            .chains()?
            .unwrap_or_else(|| (local.clone(), local.clone())))
    }

    pub fn from_chain(&self) -> Result<Option<ChainCoordinate>> {
        Ok(self.chains()?.map(|(from, _)| from))
    }

    pub fn to_chain(&self) -> Result<Option<ChainCoordinate>> {
        Ok(self.chains()?.map(|(_, to)| to))
    }

    pub fn digest(&self) -> String {
        digest_of(self)
    }

    /// Instance fingerprint: source, destination and digest.
    pub fn key(&self, local: &ChainCoordinate) -> Result<String> {
        let (from, to) = self.chains_or(local)?;
        Ok(format!("{}-{}-{}", from, to, self.digest()))
    }

    /// Instance name of the batch proposed as `seq_no`.
    ///
    /// Empty blocks carry no requests and may share a timestamp, so their
    /// name also includes the sequence number.
    pub fn name(&self, local: &ChainCoordinate, seq_no: u64) -> Result<String> {
        let key = self.key(local)?;
        if self.is_empty_block() {
            return Ok(format!("{}-{}", key, seq_no));
        }
        Ok(key)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PrePrepare {
    pub name: String,
    pub primary_id: String,
    pub chain: ChainCoordinate,
    pub replica_id: String,
    pub seq_no: u64,
    pub digest: String,
    pub quorum: u64,
    pub requests: RequestBatch,
}

impl PrePrepare {
    /// Digest independent from the sender.
    pub fn content_digest(&self) -> String {
        let mut content = self.clone();
        content.replica_id.clear();
        digest_of(&content)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Prepare {
    pub name: String,
    pub primary_id: String,
    pub chain: ChainCoordinate,
    pub replica_id: String,
    pub seq_no: u64,
    pub digest: String,
    pub quorum: u64,
}

impl Prepare {
    pub fn content_digest(&self) -> String {
        let mut content = self.clone();
        content.replica_id.clear();
        digest_of(&content)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Commit {
    pub name: String,
    pub primary_id: String,
    pub chain: ChainCoordinate,
    pub replica_id: String,
    pub seq_no: u64,
    pub digest: String,
    pub quorum: u64,
}

impl Commit {
    pub fn content_digest(&self) -> String {
        let mut content = self.clone();
        content.replica_id.clear();
        digest_of(&content)
    }
}

impl From<Prepare> for Commit {
    fn from(prepare: Prepare) -> Self {
        Commit {
            name: prepare.name,
            primary_id: prepare.primary_id,
            chain: prepare.chain,
            replica_id: prepare.replica_id,
            seq_no: prepare.seq_no,
            digest: prepare.digest,
            quorum: prepare.quorum,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Committed {
    pub name: String,
    pub primary_id: String,
    pub chain: ChainCoordinate,
    pub replica_id: String,
    pub seq_no: u64,
    pub requests: RequestBatch,
}

impl Committed {
    pub fn content_digest(&self) -> String {
        let mut content = self.clone();
        content.replica_id.clear();
        digest_of(&content)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FetchCommitted {
    pub chain: ChainCoordinate,
    pub replica_id: String,
    pub seq_no: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ViewChange {
    pub replica_id: String,
    pub chain: ChainCoordinate,
    /// Bid of the candidate, the lowest wins.
    pub priority: i64,
    /// Candidate primary.
    pub primary_id: String,
    /// Height of the voter.
    pub h: u64,
    /// Campaign.
    pub id: String,
    /// Last executed sequence number of the voter.
    pub seq_no: u64,
    pub opt_hash: String,
}

impl ViewChange {
    /// Digest shared by the votes for the same candidate.
    pub fn content_digest(&self) -> String {
        let mut content = self.clone();
        content.replica_id.clear();
        content.priority = 0;
        content.h = 0;
        digest_of(&content)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NullRequest {
    pub replica_id: String,
    pub chain: ChainCoordinate,
    pub primary_id: String,
    pub h: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct Envelope {
    tag: u32,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    RequestBatch(RequestBatch),
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),
    Committed(Committed),
    FetchCommitted(FetchCommitted),
    ViewChange(ViewChange),
    NullRequest(NullRequest),
}

impl Message {
    pub fn tag(&self) -> u32 {
        match self {
            Message::RequestBatch(_) => TAG_REQUEST_BATCH,
            Message::PrePrepare(_) => TAG_PRE_PREPARE,
            Message::Prepare(_) => TAG_PREPARE,
            Message::Commit(_) => TAG_COMMIT,
            Message::Committed(_) => TAG_COMMITTED,
            Message::FetchCommitted(_) => TAG_FETCH_COMMITTED,
            Message::ViewChange(_) => TAG_VIEW_CHANGE,
            Message::NullRequest(_) => TAG_NULL_REQUEST,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = match self {
            Message::RequestBatch(msg) => rmp_serialize(msg),
            Message::PrePrepare(msg) => rmp_serialize(msg),
            Message::Prepare(msg) => rmp_serialize(msg),
            Message::Commit(msg) => rmp_serialize(msg),
            Message::Committed(msg) => rmp_serialize(msg),
            Message::FetchCommitted(msg) => rmp_serialize(msg),
            Message::ViewChange(msg) => rmp_serialize(msg),
            Message::NullRequest(msg) => rmp_serialize(msg),
        }?;
        rmp_serialize(&Envelope {
            tag: self.tag(),
            payload,
        })
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let envelope: Envelope = rmp_deserialize(buf)?;
        let payload = envelope.payload.as_slice();
        let msg = match envelope.tag {
            TAG_REQUEST_BATCH => Message::RequestBatch(rmp_deserialize(payload)?),
            TAG_PRE_PREPARE => Message::PrePrepare(rmp_deserialize(payload)?),
            TAG_PREPARE => Message::Prepare(rmp_deserialize(payload)?),
            TAG_COMMIT => Message::Commit(rmp_deserialize(payload)?),
            TAG_COMMITTED => Message::Committed(rmp_deserialize(payload)?),
            TAG_FETCH_COMMITTED => Message::FetchCommitted(rmp_deserialize(payload)?),
            TAG_VIEW_CHANGE => Message::ViewChange(rmp_deserialize(payload)?),
            TAG_NULL_REQUEST => Message::NullRequest(rmp_deserialize(payload)?),
            tag => {
                return Err(Error::new_ext(
                    ErrorKind::MalformedData,
                    format!("unknown tag {}", tag),
                ))
            }
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        base::schema::{
            tests::{chain, create_test_tx, create_test_tx_ext},
            TxType,
        },
        crypto::ed25519::tests::ed25519_test_keypair,
    };

    const FETCH_COMMITTED_HEX: &str = "9206c40c93a23030a630303a61626305";

    fn create_fetch_committed() -> FetchCommitted {
        FetchCommitted {
            chain: chain("00"),
            replica_id: "00:abc".to_string(),
            seq_no: 5,
        }
    }

    fn create_prepare(replica: &str) -> Prepare {
        Prepare {
            name: "00-00-abcd".to_string(),
            primary_id: "00:a".to_string(),
            chain: chain("00"),
            replica_id: replica.to_string(),
            seq_no: 7,
            digest: "abcd".to_string(),
            quorum: 3,
        }
    }

    fn create_view_change(replica: &str, priority: i64) -> ViewChange {
        ViewChange {
            replica_id: replica.to_string(),
            chain: chain("00"),
            priority,
            primary_id: "00:b".to_string(),
            h: 4,
            id: "lbft".to_string(),
            seq_no: 9,
            opt_hash: "ff".to_string(),
        }
    }

    #[test]
    fn fetch_committed_serialize() {
        let msg = Message::FetchCommitted(create_fetch_committed());

        let buf = msg.encode().unwrap();

        assert_eq!(hex::encode(&buf), FETCH_COMMITTED_HEX);
    }

    #[test]
    fn fetch_committed_deserialize() {
        let buf = hex::decode(FETCH_COMMITTED_HEX).unwrap();

        let msg = Message::decode(&buf).unwrap();

        assert_eq!(msg, Message::FetchCommitted(create_fetch_committed()));
    }

    #[test]
    fn decode_unknown_tag() {
        let buf = hex::decode("9207c40190").unwrap();

        let err = Message::decode(&buf).unwrap_err();

        assert_eq!(err.kind, ErrorKind::MalformedData);
    }

    #[test]
    fn decode_truncated() {
        let buf = hex::decode(&FETCH_COMMITTED_HEX[..20]).unwrap();

        let err = Message::decode(&buf).unwrap_err();

        assert_eq!(err.kind, ErrorKind::MalformedData);
    }

    #[test]
    fn pre_prepare_carries_batch() {
        let batch = RequestBatch::new(vec![create_test_tx(1, 10)], 1_600_000_000, 42);
        let msg = Message::PrePrepare(PrePrepare {
            name: batch.key(&chain("00")).unwrap(),
            primary_id: "00:a".to_string(),
            chain: chain("00"),
            replica_id: "00:a".to_string(),
            seq_no: 1,
            digest: batch.digest(),
            quorum: 3,
            requests: batch,
        });

        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded, msg);
    }

    #[test]
    fn vote_digest_ignores_replica() {
        let a = create_prepare("00:a");
        let b = create_prepare("00:b");
        let c = Prepare {
            seq_no: 8,
            ..create_prepare("00:a")
        };

        assert_eq!(a.content_digest(), b.content_digest());
        assert_ne!(a.content_digest(), c.content_digest());
        assert_eq!(
            Commit::from(a.clone()).content_digest(),
            Commit::from(b).content_digest()
        );
    }

    #[test]
    fn view_change_digest_ignores_bid_and_height() {
        let a = create_view_change("00:a", 10);
        let b = ViewChange {
            h: 5,
            ..create_view_change("00:c", 20)
        };
        let c = ViewChange {
            primary_id: "00:c".to_string(),
            ..create_view_change("00:a", 10)
        };

        assert_eq!(a.content_digest(), b.content_digest());
        assert_ne!(a.content_digest(), c.content_digest());
    }

    #[test]
    fn batch_key_of_empty_block() {
        let batch = RequestBatch::empty_block(1_600_000_000);

        let key = batch.key(&chain("0001")).unwrap();

        assert!(batch.is_empty_block());
        assert!(key.starts_with("0001-0001-"));
    }

    #[test]
    fn empty_blocks_named_by_sequence() {
        let first = RequestBatch::empty_block(1_600_000_000);
        let second = RequestBatch::empty_block(1_600_000_000);
        let batch = RequestBatch::new(vec![create_test_tx(1, 10)], 1_600_000_000, 42);

        let first = first.name(&chain("00"), 1).unwrap();
        let second = second.name(&chain("00"), 2).unwrap();

        assert_ne!(first, second);
        assert!(second.ends_with("-2"));
        assert_eq!(batch.name(&chain("00"), 3).unwrap(), batch.key(&chain("00")).unwrap());
    }

    #[test]
    fn batch_key_of_cross_chain() {
        let tx = create_test_tx_ext(&ed25519_test_keypair(), TxType::AcrossChain, "00", "01", 1, 1);
        let batch = RequestBatch::new(vec![tx], 1_600_000_000, 1);

        let key = batch.key(&chain("00")).unwrap();

        assert_eq!(key, format!("00-01-{}", batch.digest()));
    }

    #[test]
    fn mixed_source_chain_is_fatal() {
        let keypair = ed25519_test_keypair();
        let batch = RequestBatch::new(
            vec![
                create_test_tx_ext(&keypair, TxType::AcrossChain, "00", "02", 1, 1),
                create_test_tx_ext(&keypair, TxType::AcrossChain, "01", "02", 2, 1),
            ],
            1_600_000_000,
            1,
        );

        let err = batch.from_chain().unwrap_err();

        assert_eq!(err.kind, ErrorKind::Fatal);
        assert_eq!(batch.key(&chain("00")).unwrap_err().kind, ErrorKind::Fatal);
    }
}
