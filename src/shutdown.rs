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

//! Session shutdown messenger. Any task that hits a fatal condition sends
//! the reason here; the entry point waits for the first one and tears the
//! client down.

use futures::channel::mpsc;
use futures::stream::StreamExt;

/// Sender side of the shutdown messenger
#[derive(Clone)]
pub struct Sender(mpsc::UnboundedSender<String>);

impl Sender {
    pub fn send(&self, reason: String) {
        // losing the message just means another reason already won the race
        let _ = self.0.unbounded_send(reason);
    }
}

/// Receiver side of the shutdown messenger
pub struct Receiver(mpsc::UnboundedReceiver<String>);

impl Receiver {
    /// Wait for the first fatal condition of the session
    pub async fn receive(&mut self) -> String {
        match self.0.next().await {
            Some(reason) => reason,
            None => "all session tasks died".to_string(),
        }
    }
}

/// Shutdown messenger channel
pub fn channel() -> (Sender, Receiver) {
    let (shutdown_tx, shutdown_rx) = mpsc::unbounded();
    (Sender(shutdown_tx), Receiver(shutdown_rx))
}
