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

//! Worker configuration. The TOML file holds one section per worker;
//! the section to use is picked on the command line.

use crate::error::{self, ErrorKind};
use crate::hal;

use serde::Deserialize;

use std::collections::HashMap;
use std::env;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "~/.chainminer/config.toml";

/// Jobs that found nothing within this window are abandoned
const DEFAULT_TIMEOUT_S: f64 = 5.0 * 60.0;

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Worker {
    /// Worker name sent with `mining.authorize` and `mining.submit`
    pub name: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Environment variable to take the password from when it is not in
    /// the file
    #[serde(default, rename = "password-env")]
    pub password_env: Option<String>,
    pub host: String,
    pub port: u16,
    pub number_of_devices: usize,
    pub cores_per_device: usize,
    /// Per-job timeout in seconds; 0 waits indefinitely
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    /// Interrupt a running search when the server flags clean jobs
    #[serde(default = "default_interrupt_work")]
    pub interrupt_work: bool,
}

fn default_timeout() -> f64 {
    DEFAULT_TIMEOUT_S
}

fn default_interrupt_work() -> bool {
    true
}

impl Worker {
    pub fn validate(&self) -> error::Result<()> {
        if self.number_of_devices == 0 || self.number_of_devices > hal::MAX_DEVICES {
            Err(ErrorKind::Config(format!(
                "number_of_devices must be between 1 and {}",
                hal::MAX_DEVICES
            )))?
        }
        if self.cores_per_device == 0
            || !self.cores_per_device.is_power_of_two()
            || self.cores_per_device > hal::MAX_CORES_PER_DEVICE
        {
            Err(ErrorKind::Config(format!(
                "cores_per_device must be a power of two between 1 and {}",
                hal::MAX_CORES_PER_DEVICE
            )))?
        }
        if self.timeout < 0.0 || !self.timeout.is_finite() {
            Err(ErrorKind::Config(
                "timeout must be a non-negative number of seconds".to_string(),
            ))?
        }
        Ok(())
    }

    /// Job timeout; `None` waits for the hardware indefinitely
    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout == 0.0 {
            None
        } else {
            Some(Duration::from_secs_f64(self.timeout))
        }
    }

    /// Password from the file, from the named environment variable, or
    /// empty as most pools accept
    pub fn resolve_password(&self) -> String {
        if let Some(password) = &self.password {
            return password.clone();
        }
        if let Some(variable) = &self.password_env {
            return env::var(variable).unwrap_or_default();
        }
        String::new()
    }
}

/// Parse a configuration file from `config_path`
pub fn parse_file(config_path: &str) -> error::Result<HashMap<String, Worker>> {
    let mut settings = config::Config::default();
    settings
        .merge(config::File::with_name(config_path))
        .map_err(|e| ErrorKind::Config(e.to_string()))?;

    settings
        .try_into::<HashMap<String, Worker>>()
        .map_err(|e| ErrorKind::Config(e.to_string()).into())
}

/// Pick the worker section by name, or the only one present
pub fn select_worker(
    mut workers: HashMap<String, Worker>,
    name: Option<&str>,
) -> error::Result<(String, Worker)> {
    match name {
        Some(name) => match workers.remove(name) {
            Some(worker) => Ok((name.to_string(), worker)),
            None => Err(ErrorKind::Config(format!(
                "config file has no worker section '{}'",
                name
            )))?,
        },
        None => {
            if workers.len() == 1 {
                Ok(workers.into_iter().next().expect("worker map is empty"))
            } else {
                Err(ErrorKind::Config(format!(
                    "config file defines {} worker sections, select one with --name",
                    workers.len()
                )))?
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs;

    fn parse_fixture(content: &str) -> error::Result<HashMap<String, Worker>> {
        let dir = tempfile::tempdir().expect("cannot create temp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, content).expect("cannot write config fixture");
        parse_file(path.to_str().expect("non-utf8 temp path"))
    }

    const FIXTURE: &str = r#"
        [rig0]
        name = "worker.0"
        host = "stratum.example.com"
        port = 3333
        number_of_devices = 4
        cores_per_device = 8
    "#;

    #[test]
    fn test_parse_and_defaults() {
        let workers = parse_fixture(FIXTURE).expect("config parsing failed");
        let (section, worker) = select_worker(workers, None).expect("selection failed");

        assert_eq!(section, "rig0");
        assert_eq!(worker.name, "worker.0");
        assert_eq!(worker.host, "stratum.example.com");
        assert_eq!(worker.port, 3333);
        assert_eq!(worker.timeout(), Some(Duration::from_secs(300)));
        assert!(worker.interrupt_work);
        assert_eq!(worker.resolve_password(), "");
        assert!(worker.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_waits_forever() {
        let workers = parse_fixture(
            r#"
            [rig0]
            name = "w"
            host = "h"
            port = 1
            number_of_devices = 1
            cores_per_device = 1
            timeout = 0
        "#,
        )
        .expect("config parsing failed");
        let (_, worker) = select_worker(workers, None).expect("selection failed");
        assert_eq!(worker.timeout(), None);
    }

    #[test]
    fn test_selection_by_name() {
        let two_workers = format!("{}\n[rig1]\nname = \"w1\"\nhost = \"h\"\nport = 1\nnumber_of_devices = 1\ncores_per_device = 1\n", FIXTURE);
        let workers = parse_fixture(&two_workers).expect("config parsing failed");

        // ambiguous without a name
        assert!(select_worker(workers.clone(), None).is_err());
        let (section, _) = select_worker(workers.clone(), Some("rig1")).expect("selection failed");
        assert_eq!(section, "rig1");
        assert!(select_worker(workers, Some("rig9")).is_err());
    }

    #[test]
    fn test_validate_geometry() {
        let workers = parse_fixture(
            r#"
            [rig0]
            name = "w"
            host = "h"
            port = 1
            number_of_devices = 0
            cores_per_device = 3
        "#,
        )
        .expect("config parsing failed");
        let (_, worker) = select_worker(workers, None).expect("selection failed");
        assert!(worker.validate().is_err());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(parse_fixture(
            r#"
            [rig0]
            name = "w"
            host = "h"
            port = 1
            number_of_devices = 1
            cores_per_device = 1
            typo_key = true
        "#,
        )
        .is_err());
    }
}
