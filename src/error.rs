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

//! Error handling of the client. Every fallible path funnels into
//! [`Error`], a classified [`ErrorKind`] carrying the originating failure
//! as its cause chain.

use failure::{Backtrace, Context, Fail};

use std::fmt;
use std::io;

#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum ErrorKind {
    /// Standard input/output error.
    #[fail(display = "IO error: {}", _0)]
    Io(String),

    /// Configuration file or option error.
    #[fail(display = "Config error: {}", _0)]
    Config(String),

    /// Malformed protocol frame that has been dropped.
    #[fail(display = "Framing error: {}", _0)]
    Framing(String),

    /// Protocol-level error reported by the upstream server.
    #[fail(display = "Stratum error ({}): {}", _0, _1)]
    Stratum(i64, String),

    /// Accelerator bus transport error.
    #[fail(display = "Bus error: {}", _0)]
    Bus(String),

    /// Accelerator chain controller error.
    #[fail(display = "Chain error: {}", _0)]
    Chain(String),

    /// General error used for more specific input/output error.
    #[fail(display = "General error: {}", _0)]
    General(String),
}

#[derive(Debug)]
pub struct Error(Context<ErrorKind>);

impl Error {
    /// Which class of failure this is
    pub fn kind(&self) -> &ErrorKind {
        self.0.get_context()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// a derived Fail would not forward the cause chain held by the context
impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.0.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.0.backtrace()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error(Context::new(kind))
    }
}

/// Attach a kind to a low-level failure, keeping it as the cause
fn wrap<E: Fail>(cause: E, kind: ErrorKind) -> Error {
    Error(cause.context(kind))
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let kind = ErrorKind::Io(e.to_string());
        wrap(e, kind)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        let kind = ErrorKind::Framing(e.to_string());
        wrap(e, kind)
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        let kind = ErrorKind::Framing(e.to_string());
        wrap(e, kind)
    }
}

/// Convenience alias used by all modules of the crate
pub type Result<T> = std::result::Result<T, Error>;
