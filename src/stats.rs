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

//! Session counters and the heartbeat task.

use crate::misc::LOGGER;

use slog::info;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// The heartbeat proves liveness every 5 minutes
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5 * 60);

static SUBMITTED_SHARES: AtomicU64 = AtomicU64::new(0);
static ACCEPTED_SHARES: AtomicU64 = AtomicU64::new(0);
static REJECTED_SHARES: AtomicU64 = AtomicU64::new(0);
/// Last difficulty the server asked for; informational until the chain
/// learns difficulty support
static SERVER_DIFFICULTY: AtomicU64 = AtomicU64::new(0);

pub fn account_submitted_share() {
    SUBMITTED_SHARES.fetch_add(1, Ordering::Relaxed);
}

pub fn account_accepted_share() {
    ACCEPTED_SHARES.fetch_add(1, Ordering::Relaxed);
}

pub fn account_rejected_share() {
    REJECTED_SHARES.fetch_add(1, Ordering::Relaxed);
}

pub fn record_difficulty(difficulty: u64) {
    SERVER_DIFFICULTY.store(difficulty, Ordering::Relaxed);
}

pub fn submitted_shares() -> u64 {
    SUBMITTED_SHARES.load(Ordering::Relaxed)
}

/// Emits a wall-clock log line in fixed intervals so that long stretches
/// without work are distinguishable from a hung client. Independent of all
/// other tasks.
pub async fn heartbeat_task() {
    loop {
        info!(
            LOGGER,
            "{} | shares: {} submitted, {} accepted, {} rejected",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S %z"),
            SUBMITTED_SHARES.load(Ordering::Relaxed),
            ACCEPTED_SHARES.load(Ordering::Relaxed),
            REJECTED_SHARES.load(Ordering::Relaxed)
        );
        tokio::time::sleep(HEARTBEAT_INTERVAL).await;
    }
}
