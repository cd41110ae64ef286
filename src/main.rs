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

use chainminer::config;
use chainminer::misc::LOGGER;

use clap::{App, Arg};
use slog::{error, info};

use std::env;
use std::process;

fn main() {
    let args = App::new("chainminer")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Path to the worker configuration TOML file")
                .takes_value(true)
                .default_value(config::DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::with_name("name")
                .short("n")
                .long("name")
                .value_name("SECTION")
                .help("Worker section of the config file (default: the only section)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Output more detailed logging info"),
        )
        .get_matches();

    // has to happen before the logger is touched for the first time
    match args.occurrences_of("verbose") {
        0 => {}
        1 => env::set_var("RUST_LOG", "debug"),
        _ => env::set_var("RUST_LOG", "trace"),
    }

    // Unwrap is ok as long as the flag has a default value
    let config_path = expand_home(args.value_of("config").unwrap());

    let workers = match config::parse_file(&config_path) {
        Ok(workers) => workers,
        Err(e) => {
            error!(LOGGER, "{}", e);
            process::exit(1);
        }
    };
    let (section, worker) = match config::select_worker(workers, args.value_of("name")) {
        Ok(selected) => selected,
        Err(e) => {
            error!(LOGGER, "{}", e);
            process::exit(1);
        }
    };
    if let Err(e) = worker.validate() {
        error!(LOGGER, "{}", e);
        process::exit(1);
    }

    info!(
        LOGGER,
        "Using worker configuration '{}' from '{}'", section, config_path
    );
    let password = worker.resolve_password();

    run_with_backend(worker, password);
}

/// Expand a leading `~` to the home directory
fn expand_home(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => match env::var("HOME") {
            Ok(home) => format!("{}/{}", home, rest),
            Err(_) => path.to_string(),
        },
        None => path.to_string(),
    }
}

#[cfg(feature = "spi_chain")]
fn run_with_backend(worker: config::Worker, password: String) {
    use chainminer::entry;
    use chainminer::hal::spichain::SpiChainBus;

    let bus = match SpiChainBus::open() {
        Ok(bus) => bus,
        Err(e) => {
            error!(LOGGER, "cannot open accelerator bus: {}", e);
            process::exit(1);
        }
    };

    let runtime = tokio::runtime::Runtime::new().expect("cannot build async runtime");
    if let Err(e) = runtime.block_on(entry::run(bus, worker, password)) {
        error!(LOGGER, "{}", e);
        process::exit(1);
    }
}

#[cfg(not(feature = "spi_chain"))]
fn run_with_backend(_worker: config::Worker, _password: String) {
    error!(
        LOGGER,
        "no accelerator backend was compiled in, rebuild with --features spi_chain"
    );
    process::exit(2);
}
