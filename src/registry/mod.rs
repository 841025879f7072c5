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

mod db_interface;
pub use db_interface::DbInterface;

mod db_memory;
pub use db_memory::DbMemory;

mod db_sqlite;
pub use db_sqlite::DbSqlite;

use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Result;
use rand::TryRngCore;
use uuid::Uuid;

use crate::config::{RegistryBackend, ServerConfig};
use crate::crypt::AES_KEY_SIZE;
use crate::error::{NetError, NetResult};

/// One registered client.  The public key is the verbatim 160-byte
/// document the client sent; the AES key is whatever was issued last.
#[derive(Clone, Debug)]
pub struct ClientRecord {
    pub client_id: Uuid,
    pub name: String,
    pub public_key: Option<Vec<u8>>,
    pub aes_key: Option<Vec<u8>>,
    pub last_seen: i64,
}

impl ClientRecord {
    /// A reconnect can only be honored when a usable public key is on
    /// file to wrap the fresh session key with.
    pub fn has_key_material(&self) -> bool {
        self.public_key.as_ref()
            .is_some_and(|key| key.len() == crate::crypt::PUBLIC_KEY_SIZE)
    }
}

#[derive(Clone, Debug)]
pub struct FileRecord {
    pub client_id: Uuid,
    pub filename: String,
    pub path: String,
    pub size: i64,
    pub crc32: u32,
    pub verified: bool,
    pub uploaded_at: i64,
}

pub async fn open_registry(config: &ServerConfig) -> Result<Arc<dyn DbInterface>> {
    match config.db_type {
        RegistryBackend::Memory => Ok(Arc::new(DbMemory::new())),
        RegistryBackend::Sqlite => Ok(Arc::new(DbSqlite::new(&config.db_uri).await?)),
    }
}

pub(crate) fn generate_aes_key() -> NetResult<[u8; AES_KEY_SIZE]> {
    let mut key = [0; AES_KEY_SIZE];
    rand::rngs::OsRng.try_fill_bytes(&mut key)
        .map_err(|err| NetError::Crypto(format!("Failed to generate an AES key: {err}")))?;
    Ok(key)
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
}
