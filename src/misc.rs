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

//! Global logger shared by all modules of the client.

use std::env;
use std::fs::{File, OpenOptions};

use lazy_static::lazy_static;
use slog::{o, Drain, Duplicate, Logger};

/// Terminal output is mirrored here for post-mortem reading
const LOG_FILE_PATH: &str = "/tmp/chainminer.log";

/// Filter applied when the user did not set `RUST_LOG`; a mining session
/// must report its progress out of the box
const DEFAULT_LOG_FILTER: &str = "info";

lazy_static! {
    pub static ref LOGGER: Logger = build_root_logger();
}

/// The mirror file is optional, the log path may not be writable on every
/// deployment
fn mirror_file() -> Option<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(LOG_FILE_PATH)
        .ok()
}

fn build_root_logger() -> Logger {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", DEFAULT_LOG_FILTER);
    }

    let terminal = slog_term::FullFormat::new(slog_term::TermDecorator::new().build())
        .build()
        .fuse();

    match mirror_file() {
        Some(file) => {
            let mirror = slog_term::FullFormat::new(slog_term::PlainDecorator::new(file))
                .build()
                .fuse();
            finish(Duplicate::new(terminal, mirror).ignore_res())
        }
        None => finish(terminal),
    }
}

/// Put the `RUST_LOG` filter and the asynchronous writer in front of the
/// formatted output
fn finish<D>(drain: D) -> Logger
where
    D: Drain<Ok = (), Err = slog::Never> + Send + 'static,
{
    let drain = slog_envlogger::new(drain);
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}
