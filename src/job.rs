// Copyright (C) 2020  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Job construction: decoding of `mining.notify` parameters and their
//! transformation into the midstate/tail payload the accelerators consume.

use crate::btc;
use crate::client::Subscription;
use crate::error::{self, ErrorKind};
use crate::hal;

use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::Value;

use std::convert::TryInto;

/// `mining.notify` carries nine positional parameters
const NOTIFY_PARAMS_LEN: usize = 9;

/// Decoded form of a `mining.notify` server call. All fixed-width fields
/// are validated to their exact sizes; byte order is kept as the server
/// sent it.
#[derive(Clone, Debug, PartialEq)]
pub struct JobNotification {
    pub job_id: String,
    pub previous_hash: [u8; 32],
    pub coinbase_1: Vec<u8>,
    pub coinbase_2: Vec<u8>,
    pub merkle_branch: Vec<[u8; 32]>,
    pub version: [u8; 4],
    pub bits: [u8; 4],
    /// Kept as the original ASCII hex so it can be echoed verbatim on
    /// `mining.submit`
    pub timestamp: String,
    pub clean_jobs: bool,
}

/// Job transformed into the form the hardware consumes, queued for the
/// worker loop
#[derive(Clone, Debug, PartialEq)]
pub struct BuiltJob {
    pub job_id: String,
    /// ASCII hex, twice the extra-nonce-2 byte size
    pub extra_nonce_2: String,
    /// Echoed verbatim from the notification
    pub timestamp: String,
    /// SHA256 state after the first header chunk, big-endian words
    pub midstate: [u8; hal::MIDSTATE_SIZE],
    /// Header bytes 64..76 plus the reserved nonce region
    pub tail: [u8; hal::TAIL_SIZE],
}

fn framing_error<T>(message: String) -> error::Result<T> {
    Err(ErrorKind::Framing(message).into())
}

fn field_str<'a>(params: &'a [Value], index: usize, field: &str) -> error::Result<&'a str> {
    match params[index].as_str() {
        Some(value) => Ok(value),
        None => framing_error(format!("{} is not a string", field)),
    }
}

fn field_hex(params: &[Value], index: usize, field: &str) -> error::Result<Vec<u8>> {
    let text = field_str(params, index, field)?;
    match hex::decode(text) {
        Ok(bytes) => Ok(bytes),
        Err(e) => framing_error(format!("{} is not valid hex: {}", field, e)),
    }
}

fn field_hex_exact(
    params: &[Value],
    index: usize,
    field: &str,
    expected: usize,
) -> error::Result<Vec<u8>> {
    let bytes = field_hex(params, index, field)?;
    if bytes.len() != expected {
        framing_error(format!(
            "{} has {} bytes, expected {}",
            field,
            bytes.len(),
            expected
        ))?
    }
    Ok(bytes)
}

impl JobNotification {
    /// Decode the positional parameter list of a `mining.notify` call
    pub fn from_params(params: &Value) -> error::Result<Self> {
        let params = match params.as_array() {
            Some(params) => params,
            None => framing_error("notify params are not an array".to_string())?,
        };
        if params.len() != NOTIFY_PARAMS_LEN {
            framing_error(format!(
                "notify carries {} params, expected {}",
                params.len(),
                NOTIFY_PARAMS_LEN
            ))?
        }

        let previous_hash: [u8; 32] = field_hex_exact(params, 1, "previous hash", 32)?
            .as_slice()
            .try_into()
            .expect("slice with incorrect length");

        let merkle_branch = match params[4].as_array() {
            Some(entries) => {
                let mut branch = Vec::with_capacity(entries.len());
                for (i, entry) in entries.iter().enumerate() {
                    let digest = match entry.as_str().map(hex::decode) {
                        Some(Ok(digest)) => digest,
                        _ => framing_error(format!("merkle branch {} is not a hex string", i))?,
                    };
                    if digest.len() != 32 {
                        framing_error(format!(
                            "merkle branch {} has {} bytes, expected 32",
                            i,
                            digest.len()
                        ))?
                    }
                    branch.push(
                        digest
                            .as_slice()
                            .try_into()
                            .expect("slice with incorrect length"),
                    );
                }
                branch
            }
            None => framing_error("merkle branch is not an array".to_string())?,
        };

        let timestamp = field_str(params, 7, "timestamp")?.to_string();
        // validated here so the header assembly below cannot fail on it
        let timestamp_bytes = match hex::decode(&timestamp) {
            Ok(bytes) => bytes,
            Err(e) => framing_error(format!("timestamp is not valid hex: {}", e))?,
        };
        if timestamp_bytes.len() != 4 {
            framing_error(format!(
                "timestamp has {} bytes, expected 4",
                timestamp_bytes.len()
            ))?
        }

        let clean_jobs = match params[8].as_bool() {
            Some(value) => value,
            None => framing_error("clean jobs flag is not a boolean".to_string())?,
        };

        Ok(Self {
            job_id: field_str(params, 0, "job id")?.to_string(),
            previous_hash,
            coinbase_1: field_hex(params, 2, "coinbase 1")?,
            coinbase_2: field_hex(params, 3, "coinbase 2")?,
            merkle_branch,
            version: field_hex_exact(params, 5, "version", 4)?
                .as_slice()
                .try_into()
                .expect("slice with incorrect length"),
            bits: field_hex_exact(params, 6, "bits", 4)?
                .as_slice()
                .try_into()
                .expect("slice with incorrect length"),
            timestamp,
            clean_jobs,
        })
    }

    fn timestamp_bytes(&self) -> [u8; 4] {
        // length and hex validity checked during decoding
        hex::decode(&self.timestamp)
            .expect("timestamp no longer valid hex")
            .as_slice()
            .try_into()
            .expect("slice with incorrect length")
    }

    /// Deterministic job assembly from explicit extra nonces: coinbase
    /// double hash, Merkle reduction, header split and midstate
    /// pre-computation.
    pub fn assemble(&self, extra_nonce_1: &[u8], extra_nonce_2: &[u8]) -> BuiltJob {
        let coinbase_digest = btc::coinbase_digest(
            &self.coinbase_1,
            extra_nonce_1,
            extra_nonce_2,
            &self.coinbase_2,
        );
        let merkle_root = btc::merkle_root(coinbase_digest, &self.merkle_branch);

        let header = btc::pack_header_prefix(
            &self.version,
            &self.previous_hash,
            &merkle_root,
            &self.timestamp_bytes(),
            &self.bits,
        );

        let mut chunk1 = [0u8; btc::BLOCK_HEADER_CHUNK1_SIZE];
        chunk1.copy_from_slice(&header[..btc::BLOCK_HEADER_CHUNK1_SIZE]);

        let mut tail = [0u8; hal::TAIL_SIZE];
        tail[..btc::BLOCK_HEADER_PREFIX_SIZE - btc::BLOCK_HEADER_CHUNK1_SIZE]
            .copy_from_slice(&header[btc::BLOCK_HEADER_CHUNK1_SIZE..]);
        tail[btc::BLOCK_HEADER_PREFIX_SIZE - btc::BLOCK_HEADER_CHUNK1_SIZE..]
            .copy_from_slice(&hal::TAIL_NONCE_RESERVED);

        BuiltJob {
            job_id: self.job_id.clone(),
            extra_nonce_2: hex::encode(extra_nonce_2),
            timestamp: self.timestamp.clone(),
            midstate: btc::midstate(&chunk1),
            tail,
        }
    }

    /// Build a job with a freshly drawn extra-nonce-2
    pub fn build(&self, subscription: &Subscription) -> BuiltJob {
        let mut extra_nonce_2 = vec![0u8; subscription.extra_nonce_2_size];
        OsRng.fill_bytes(&mut extra_nonce_2);
        self.assemble(&subscription.extra_nonce_1, &extra_nonce_2)
    }
}
