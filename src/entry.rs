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

//! Session entry point: brings up the accelerator chain, connects the
//! upstream session, performs the handshake and wires the four session
//! tasks together.

use crate::client;
use crate::config;
use crate::error::{self, ErrorKind};
use crate::hal;
use crate::misc::LOGGER;
use crate::shutdown;
use crate::stats;
use crate::work;

use futures::channel::mpsc;

use slog::info;

use std::sync::Arc;

/// Run one mining session until a fatal condition ends it. The returned
/// error carries the shutdown reason.
pub async fn run<B: hal::Bus>(
    bus: B,
    worker: config::Worker,
    password: String,
) -> error::Result<()> {
    let timeout = worker.timeout();

    // chain bring-up first so that broken hardware fails fast
    let ctl = Arc::new(hal::ChainCtl::new(
        bus,
        worker.number_of_devices,
        worker.cores_per_device,
    )?);
    {
        let ctl = ctl.clone();
        tokio::task::spawn_blocking(move || ctl.update_device_configs())
            .await
            .map_err(|e| ErrorKind::Chain(format!("device setup task died: {}", e)))??;
    }
    info!(
        LOGGER,
        "Accelerator chain up: {} devices, {} cores each",
        worker.number_of_devices,
        worker.cores_per_device
    );

    let (reader, writer) = client::connect(&worker.host, worker.port).await?;
    let (outbound_tx, outbound_rx) = mpsc::unbounded();
    let (shutdown_tx, mut shutdown_rx) = shutdown::channel();

    let stratum = Arc::new(client::Client::new(client::Caller::new(outbound_tx)));
    let queue = work::Queue::new();

    // the receive loop must run before the handshake so that responses can
    // reach their callers through the pending-call table
    tokio::spawn(client::send_task(
        writer,
        outbound_rx,
        shutdown_tx.clone(),
    ));
    tokio::spawn(client::receive_task(
        reader,
        stratum.clone(),
        queue.clone(),
        ctl.clone(),
        worker.interrupt_work,
        shutdown_tx.clone(),
    ));

    stratum.subscribe().await?;
    stratum.authorize(&worker.name, &password).await?;

    tokio::spawn(stats::heartbeat_task());
    tokio::spawn(work::solve_task(
        queue,
        ctl,
        stratum.caller().clone(),
        worker.name.clone(),
        timeout,
        shutdown_tx,
    ));

    let reason = shutdown_rx.receive().await;
    Err(ErrorKind::General(format!("session terminated: {}", reason)).into())
}
