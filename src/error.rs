/* This file is part of backhaul.
 *
 * backhaul is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * backhaul is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with backhaul.  If not, see <http://www.gnu.org/licenses/>.
 */

use std::io::ErrorKind;

use thiserror::Error;

pub type NetResult<T> = Result<T, NetError>;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("declared payload of {size} bytes exceeds the {limit} byte limit")]
    OversizedPayload { size: u64, limit: u64 },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("display name is already registered")]
    NameTaken,

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("checksum mismatch after {0} upload attempts")]
    CrcMismatch(u32),
}

impl NetError {
    // Process exit codes for the client CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            NetError::Config(_) => 1,
            NetError::ConnectionClosed
                | NetError::Io(_)
                | NetError::OversizedPayload { .. } => 2,
            NetError::Protocol(_)
                | NetError::Registry(_)
                | NetError::NameTaken
                | NetError::Crypto(_) => 3,
            NetError::CrcMismatch(_) => 4,
        }
    }

    // A peer that simply went away is routine; everything else is worth
    // a warning from the session loop.
    pub fn is_disconnect(&self) -> bool {
        match self {
            NetError::ConnectionClosed => true,
            NetError::Io(err) => matches!(
                err.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
