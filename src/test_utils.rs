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

//! Shared test fixtures: a genuine block vector, a canned job notification
//! with independently computed expected outputs and a scriptable mock of
//! the accelerator bus.

use crate::client;
use crate::error::{self, ErrorKind};
use crate::hal;
use crate::job;

use lazy_static::lazy_static;
use serde_json::{json, Value};

use std::collections::VecDeque;
use std::convert::TryInto;
use std::sync::{Arc, Mutex as StdMutex};

/// Real block header with associated intermediate values
pub struct TestBlock {
    pub version: [u8; 4],
    pub previous_hash: [u8; 32],
    pub merkle_root: [u8; 32],
    pub time: [u8; 4],
    pub bits: [u8; 4],
    pub nonce: u32,
    pub header_bytes: [u8; 80],
    pub midstate: [u8; 32],
    /// Double hash in the usual reversed display order
    pub hash_str: &'static str,
}

fn hex_array_4(s: &str) -> [u8; 4] {
    hex::decode(s)
        .expect("invalid test vector hex")
        .as_slice()
        .try_into()
        .expect("slice with incorrect length")
}

fn hex_array_32(s: &str) -> [u8; 32] {
    hex::decode(s)
        .expect("invalid test vector hex")
        .as_slice()
        .try_into()
        .expect("slice with incorrect length")
}

fn hex_array_80(s: &str) -> [u8; 80] {
    hex::decode(s)
        .expect("invalid test vector hex")
        .as_slice()
        .try_into()
        .expect("slice with incorrect length")
}

lazy_static! {
    pub static ref TEST_BLOCKS: Vec<TestBlock> = vec![
        // mainnet block #125552
        TestBlock {
            version: hex_array_4("01000000"),
            previous_hash: hex_array_32(
                "81cd02ab7e569e8bcd9317e2fe99f2de44d49ab2b8851ba4a308000000000000"
            ),
            merkle_root: hex_array_32(
                "e320b6c2fffc8d750423db8b1eb942ae710e951ed797f7affc8892b0f1fc122b"
            ),
            time: hex_array_4("c7f5d74d"),
            bits: hex_array_4("f2b9441a"),
            nonce: 0x9546_a142,
            header_bytes: hex_array_80(
                "0100000081cd02ab7e569e8bcd9317e2fe99f2de44d49ab2b8851ba4a30800000000\
                 0000e320b6c2fffc8d750423db8b1eb942ae710e951ed797f7affc8892b0f1fc122b\
                 c7f5d74df2b9441a42a14695"
            ),
            midstate: hex_array_32(
                "9524c59305c5671316e669ba2d2810a007e86e372f56a9dacd5bce697a78da2d"
            ),
            hash_str: "00000000000000001e8d6829a8a21adc5d38d0a473b144b6765798e61f98bd1d",
        },
    ];
}

pub const NOTIFY_JOB_ID: &str = "ab12";
pub const NOTIFY_PREVIOUS_HASH: &str =
    "4d16b6f85af6e2198f44ae2a6de67f78487ae5611b77c6c0440b24b8b9ad751e";
pub const NOTIFY_TIMESTAMP: &str = "504e86ed";

/// Expected outputs for `notify_params` assembled with
/// `extra_nonce_1 = abcd`, `extra_nonce_2 = 000000c8`
pub const NOTIFY_JOB_MIDSTATE: &str =
    "eddd862d74a7cf320c830575cc832cb32b0251df681e25aa8b2590a15ab4b3f4";
pub const NOTIFY_JOB_TAIL: &str = "eb21932f504e86ed1c2ac4af00000000";

/// Canned `mining.notify` parameter list (clean_jobs off)
pub fn notify_params() -> Value {
    json!([
        NOTIFY_JOB_ID,
        NOTIFY_PREVIOUS_HASH,
        "01000000010000000000000000000000000000000000000000000000000000000000000000\
         ffffffff20020862062f503253482f04",
        "0d2f7374726174756d506f6f6c2f000000000100868591052100001976a914310000000000\
         00000000000000000000000000000088ac00000000",
        ["9a".repeat(32), "3c".repeat(32)],
        "00000002",
        "1c2ac4af",
        NOTIFY_TIMESTAMP,
        false
    ])
}

/// Deterministic built job for queue and worker tests
pub fn built_job(job_id: &str) -> job::BuiltJob {
    job::BuiltJob {
        job_id: job_id.to_string(),
        extra_nonce_2: "00000001".to_string(),
        timestamp: NOTIFY_TIMESTAMP.to_string(),
        midstate: [0x11; hal::MIDSTATE_SIZE],
        tail: [0x22; hal::TAIL_SIZE],
    }
}

/// Pretend the subscribe handshake already happened
pub fn install_subscription(client: &client::Client) {
    client.replace_subscription(client::Subscription {
        extra_nonce_1: vec![0xab, 0xcd],
        extra_nonce_2_size: 4,
    });
}

/// Snapshot of everything a [`MockBus`] observed
#[derive(Clone, Default)]
pub struct MockBusState {
    pub reset_asserted: bool,
    pub shared_selected: bool,
    pub daisy_selected: bool,
    pub shared_writes: Vec<Vec<u8>>,
    pub daisy_writes: Vec<Vec<u8>>,
    /// Select/deselect pairs with no payload in between
    pub daisy_pulses: usize,
    pub daisy_reads_taken: usize,
    daisy_reads: VecDeque<Vec<u8>>,
    ready_script: VecDeque<bool>,
    fail_next_daisy_read: bool,
    daisy_activity: bool,
}

/// Scriptable in-memory accelerator bus. Clones share the same state, so a
/// test can keep a handle while the controller owns the bus.
#[derive(Clone)]
pub struct MockBus {
    state: Arc<StdMutex<MockBusState>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(StdMutex::new(MockBusState::default())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<MockBusState> {
        self.state.lock().expect("mock bus lock poisoned")
    }

    pub fn state(&self) -> MockBusState {
        self.lock().clone()
    }

    /// Queue a canned daisy readback
    pub fn push_daisy_read(&self, data: Vec<u8>) {
        self.lock().daisy_reads.push_back(data);
    }

    /// Script the answers of the ready line; once exhausted it reads false
    pub fn script_ready(&self, answers: &[bool]) {
        self.lock().ready_script.extend(answers.iter().copied());
    }

    /// Make the next daisy read fail to exercise error paths
    pub fn fail_next_daisy_read(&self) {
        self.lock().fail_next_daisy_read = true;
    }
}

impl hal::Bus for MockBus {
    fn assert_reset(&mut self) -> error::Result<()> {
        self.lock().reset_asserted = true;
        Ok(())
    }

    fn deassert_reset(&mut self) -> error::Result<()> {
        self.lock().reset_asserted = false;
        Ok(())
    }

    fn select_shared(&mut self) -> error::Result<()> {
        let mut state = self.lock();
        assert!(!state.shared_selected, "shared bus selected twice");
        state.shared_selected = true;
        Ok(())
    }

    fn deselect_shared(&mut self) -> error::Result<()> {
        let mut state = self.lock();
        assert!(state.shared_selected, "shared bus deselected while idle");
        state.shared_selected = false;
        Ok(())
    }

    fn write_shared(&mut self, data: &[u8]) -> error::Result<()> {
        let mut state = self.lock();
        assert!(state.shared_selected, "shared write without selection");
        state.shared_writes.push(data.to_vec());
        Ok(())
    }

    fn select_daisy(&mut self) -> error::Result<()> {
        let mut state = self.lock();
        assert!(!state.daisy_selected, "daisy bus selected twice");
        state.daisy_selected = true;
        state.daisy_activity = false;
        Ok(())
    }

    fn deselect_daisy(&mut self) -> error::Result<()> {
        let mut state = self.lock();
        assert!(state.daisy_selected, "daisy bus deselected while idle");
        state.daisy_selected = false;
        if !state.daisy_activity {
            state.daisy_pulses += 1;
        }
        Ok(())
    }

    fn write_daisy(&mut self, data: &[u8]) -> error::Result<()> {
        let mut state = self.lock();
        assert!(state.daisy_selected, "daisy write without selection");
        state.daisy_activity = true;
        state.daisy_writes.push(data.to_vec());
        Ok(())
    }

    fn read_daisy(&mut self, len: usize) -> error::Result<Vec<u8>> {
        let mut state = self.lock();
        assert!(state.daisy_selected, "daisy read without selection");
        state.daisy_activity = true;
        if state.fail_next_daisy_read {
            state.fail_next_daisy_read = false;
            Err(ErrorKind::Bus("injected daisy read failure".to_string()))?
        }
        state.daisy_reads_taken += 1;
        Ok(state
            .daisy_reads
            .pop_front()
            .unwrap_or_else(|| vec![0u8; len]))
    }

    fn poll_ready(&mut self) -> error::Result<bool> {
        Ok(self.lock().ready_script.pop_front().unwrap_or(false))
    }
}
