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

use async_trait::async_trait;
use uuid::Uuid;

use crate::crypt::AES_KEY_SIZE;
use crate::error::NetResult;
use super::{ClientRecord, FileRecord};

/// The server's persistent registry of clients and uploaded files.
/// Mutating operations are serialized by the backend; sessions on
/// different clients never contend beyond a single statement.
#[async_trait]
pub trait DbInterface: Send + Sync {
    /// Registers a fresh client under `name` and returns its new random
    /// 16-byte id.  Fails with `NetError::NameTaken` when the name is
    /// already claimed; exactly one of two concurrent registrations for
    /// the same name can succeed.
    async fn register_client(&self, name: &str) -> NetResult<Uuid>;

    async fn lookup_by_name(&self, name: &str) -> NetResult<Option<ClientRecord>>;

    async fn lookup_by_id(&self, client_id: &Uuid) -> NetResult<Option<ClientRecord>>;

    /// Stores the verbatim public key document and issues a fresh
    /// AES-256 session key for the client.
    async fn set_public_key_and_generate_aes(&self, client_id: &Uuid, public_key: &[u8])
        -> NetResult<[u8; AES_KEY_SIZE]>;

    /// Issues a fresh AES-256 session key for a reconnecting client
    /// whose public key is already on file.
    async fn refresh_aes_key(&self, client_id: &Uuid) -> NetResult<[u8; AES_KEY_SIZE]>;

    async fn touch_last_seen(&self, client_id: &Uuid) -> NetResult<()>;

    /// Creates (or resets) the record for an upload in progress.  The
    /// record starts unverified; a re-upload of the same filename
    /// replaces the previous attempt.
    async fn record_file(&self, client_id: &Uuid, filename: &str, path: &str,
                         size: i64, crc: u32) -> NetResult<()>;

    async fn mark_file_verified(&self, client_id: &Uuid, filename: &str) -> NetResult<()>;

    async fn drop_file(&self, client_id: &Uuid, filename: &str) -> NetResult<()>;

    async fn lookup_file(&self, client_id: &Uuid, filename: &str)
        -> NetResult<Option<FileRecord>>;
}
