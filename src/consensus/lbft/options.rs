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

//! LBFT configuration.

use super::MIN_QUORUM;
use crate::{
    base::{
        schema::ChainCoordinate,
        serialize::{duration_ms, json_load, rmp_serialize},
    },
    crypto::Hash,
    Error, ErrorKind, Result,
};
use std::{path::Path, time::Duration};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LbftOptions {
    /// Replica identifier, `chain:hex`.
    pub id: String,
    /// Chain of the replica group.
    pub chain: ChainCoordinate,
    /// Number of replicas.
    pub n: usize,
    /// Quorum.
    pub q: usize,
    /// Committed batches kept for the laggards.
    pub k: u64,
    pub batch_size: usize,
    #[serde(with = "duration_ms")]
    pub batch_timeout: Duration,
    pub block_size: usize,
    #[serde(with = "duration_ms")]
    pub block_timeout: Duration,
    /// A submitted batch not committed within this delay triggers a view change.
    #[serde(with = "duration_ms")]
    pub request: Duration,
    /// Campaign lifetime.
    #[serde(with = "duration_ms")]
    pub view_change: Duration,
    #[serde(with = "duration_ms")]
    pub resend_view_change: Duration,
    /// Primary rotation period, zero to disable.
    #[serde(with = "duration_ms")]
    pub view_change_period: Duration,
    /// Primary heartbeat period.
    #[serde(with = "duration_ms")]
    pub null_request: Duration,
    /// Capacity of the service channels.
    pub buffer_size: usize,
}

impl Default for LbftOptions {
    fn default() -> Self {
        LbftOptions {
            id: String::new(),
            chain: ChainCoordinate::default(),
            n: 4,
            q: 3,
            k: 10,
            batch_size: 100,
            batch_timeout: Duration::from_secs(1),
            block_size: 2000,
            block_timeout: Duration::from_secs(10),
            request: Duration::from_secs(30),
            view_change: Duration::from_secs(5),
            resend_view_change: Duration::from_secs(5),
            view_change_period: Duration::ZERO,
            null_request: Duration::from_secs(5),
            buffer_size: 100,
        }
    }
}

/// Replica identifier derived from the node key.
pub fn replica_id(chain: &ChainCoordinate, node_key: &[u8]) -> String {
    let mut data = node_key.to_vec();
    data.extend_from_slice(chain.as_bytes());
    let hash = Hash::from_data(&data);
    format!("{}:{}", chain, hex::encode(&hash.as_bytes()[..20]))
}

impl LbftOptions {
    /// Load from a JSON file and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        json_load::<Self, P>(path)?.validate()
    }

    /// Fix the inconsistent values, fail on the unrecoverable ones.
    pub fn validate(mut self) -> Result<Self> {
        if self.n < MIN_QUORUM {
            return Err(Error::new_ext(
                ErrorKind::Fatal,
                format!("{} replicas, at least {} required", self.n, MIN_QUORUM),
            ));
        }
        let min_q = ((2 * self.n - 1) / 3 + 1).max(MIN_QUORUM);
        if self.q < min_q {
            warn!("[lbft] quorum {} raised to {}", self.q, min_q);
            self.q = min_q;
        }
        if self.request <= self.view_change {
            self.request = 6 * self.view_change;
            warn!("[lbft] request timeout raised to {:?}", self.request);
        }
        if self.view_change_period > Duration::ZERO && self.view_change_period <= self.block_timeout {
            self.view_change_period = 1000 * self.block_timeout;
            warn!("[lbft] rotation period raised to {:?}", self.view_change_period);
        }
        if self.buffer_size == 0 {
            self.buffer_size = 1;
        }
        Ok(self)
    }

    /// Digest of the settings all the replicas must share.
    pub fn hash(&self) -> String {
        let shared = LbftOptions {
            id: String::new(),
            ..self.clone()
        };
        rmp_serialize(&shared)
            .map(|buf| Hash::from_data(&buf).to_hex())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::schema::tests::chain;
    use std::io::Write;

    fn create_options() -> LbftOptions {
        LbftOptions {
            id: "00:a".to_string(),
            chain: chain("00"),
            ..Default::default()
        }
    }

    #[test]
    fn validate_defaults() {
        let options = create_options().validate().unwrap();

        assert_eq!(options.q, 3);
        assert_eq!(options.request, Duration::from_secs(30));
    }

    #[test]
    fn validate_too_few_replicas() {
        let options = LbftOptions {
            n: 2,
            ..create_options()
        };

        let err = options.validate().unwrap_err();

        assert_eq!(err.kind, ErrorKind::Fatal);
    }

    #[test]
    fn validate_raises_quorum() {
        let options = LbftOptions {
            n: 7,
            q: 2,
            ..create_options()
        };

        let options = options.validate().unwrap();

        assert_eq!(options.q, 5);
    }

    #[test]
    fn validate_request_timeout() {
        let options = LbftOptions {
            request: Duration::from_millis(100),
            view_change: Duration::from_millis(100),
            ..create_options()
        };

        let options = options.validate().unwrap();

        assert_eq!(options.request, Duration::from_millis(600));
    }

    #[test]
    fn validate_rotation_period() {
        let options = LbftOptions {
            block_timeout: Duration::from_millis(100),
            view_change_period: Duration::from_millis(50),
            ..create_options()
        };

        let options = options.validate().unwrap();

        assert_eq!(options.view_change_period, Duration::from_secs(100));
    }

    #[test]
    fn hash_ignores_replica_id() {
        let a = create_options();
        let b = LbftOptions {
            id: "00:b".to_string(),
            ..create_options()
        };
        let c = LbftOptions {
            k: 20,
            ..create_options()
        };

        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
        assert_eq!(a.hash().len(), 64);
    }

    #[test]
    fn replica_id_format() {
        let id = replica_id(&chain("0001"), b"node-key");

        assert!(id.starts_with("0001:"));
        assert_eq!(id.len(), 5 + 40);
        assert_ne!(id, replica_id(&chain("0002"), b"node-key"));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"chain": "00", "n": 4, "q": 1, "block_timeout": 250}}"#).unwrap();

        let options = LbftOptions::load(file.path()).unwrap();

        assert_eq!(options.chain, chain("00"));
        assert_eq!(options.q, 3);
        assert_eq!(options.block_timeout, Duration::from_millis(250));
    }
}
