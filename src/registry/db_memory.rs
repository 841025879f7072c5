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

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::crypt::AES_KEY_SIZE;
use crate::error::{NetError, NetResult};
use super::db_interface::DbInterface;
use super::{generate_aes_key, unix_now, ClientRecord, FileRecord};

/// Volatile registry backend.  Everything is lost when the server
/// stops, which is exactly what development and the test suite want.
pub struct DbMemory {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    clients: HashMap<Uuid, ClientRecord>,
    names: HashMap<String, Uuid>,
    files: HashMap<(Uuid, String), FileRecord>,
}

impl DbMemory {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("Memory registry lock poisoned")
    }
}

impl Default for DbMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DbInterface for DbMemory {
    async fn register_client(&self, name: &str) -> NetResult<Uuid> {
        let mut inner = self.lock();
        if inner.names.contains_key(name) {
            return Err(NetError::NameTaken);
        }

        let client_id = Uuid::new_v4();
        inner.names.insert(name.to_string(), client_id);
        inner.clients.insert(client_id, ClientRecord {
            client_id,
            name: name.to_string(),
            public_key: None,
            aes_key: None,
            last_seen: unix_now(),
        });
        Ok(client_id)
    }

    async fn lookup_by_name(&self, name: &str) -> NetResult<Option<ClientRecord>> {
        let inner = self.lock();
        Ok(inner.names.get(name)
                .and_then(|client_id| inner.clients.get(client_id))
                .cloned())
    }

    async fn lookup_by_id(&self, client_id: &Uuid) -> NetResult<Option<ClientRecord>> {
        Ok(self.lock().clients.get(client_id).cloned())
    }

    async fn set_public_key_and_generate_aes(&self, client_id: &Uuid, public_key: &[u8])
        -> NetResult<[u8; AES_KEY_SIZE]>
    {
        let aes_key = generate_aes_key()?;
        let mut inner = self.lock();
        let Some(record) = inner.clients.get_mut(client_id) else {
            return Err(NetError::Registry(format!("No such client {client_id}")));
        };
        record.public_key = Some(public_key.to_vec());
        record.aes_key = Some(aes_key.to_vec());
        record.last_seen = unix_now();
        Ok(aes_key)
    }

    async fn refresh_aes_key(&self, client_id: &Uuid) -> NetResult<[u8; AES_KEY_SIZE]> {
        let aes_key = generate_aes_key()?;
        let mut inner = self.lock();
        let Some(record) = inner.clients.get_mut(client_id) else {
            return Err(NetError::Registry(format!("No such client {client_id}")));
        };
        if record.public_key.is_none() {
            return Err(NetError::Registry(format!(
                    "Client {client_id} has no public key on file")));
        }
        record.aes_key = Some(aes_key.to_vec());
        record.last_seen = unix_now();
        Ok(aes_key)
    }

    async fn touch_last_seen(&self, client_id: &Uuid) -> NetResult<()> {
        if let Some(record) = self.lock().clients.get_mut(client_id) {
            record.last_seen = unix_now();
        }
        Ok(())
    }

    async fn record_file(&self, client_id: &Uuid, filename: &str, path: &str,
                         size: i64, crc: u32) -> NetResult<()>
    {
        self.lock().files.insert(
            (*client_id, filename.to_string()),
            FileRecord {
                client_id: *client_id,
                filename: filename.to_string(),
                path: path.to_string(),
                size,
                crc32: crc,
                verified: false,
                uploaded_at: unix_now(),
            });
        Ok(())
    }

    async fn mark_file_verified(&self, client_id: &Uuid, filename: &str) -> NetResult<()> {
        let mut inner = self.lock();
        let Some(record) = inner.files.get_mut(&(*client_id, filename.to_string())) else {
            return Err(NetError::Registry(format!(
                    "No file record for '{filename}' of client {client_id}")));
        };
        record.verified = true;
        Ok(())
    }

    async fn drop_file(&self, client_id: &Uuid, filename: &str) -> NetResult<()> {
        self.lock().files.remove(&(*client_id, filename.to_string()));
        Ok(())
    }

    async fn lookup_file(&self, client_id: &Uuid, filename: &str)
        -> NetResult<Option<FileRecord>>
    {
        Ok(self.lock().files.get(&(*client_id, filename.to_string())).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_lookup() {
        let db = DbMemory::new();
        let client_id = db.register_client("alice").await.unwrap();

        let by_name = db.lookup_by_name("alice").await.unwrap().unwrap();
        assert_eq!(by_name.client_id, client_id);
        assert!(!by_name.has_key_material());

        let by_id = db.lookup_by_id(&client_id).await.unwrap().unwrap();
        assert_eq!(by_id.name, "alice");

        assert!(db.lookup_by_name("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let db = DbMemory::new();
        db.register_client("bob").await.unwrap();
        assert!(matches!(db.register_client("bob").await,
                         Err(NetError::NameTaken)));
    }

    #[tokio::test]
    async fn test_key_issue_and_refresh() {
        let db = DbMemory::new();
        let client_id = db.register_client("alice").await.unwrap();

        // No reconnect key before a public key is on file
        assert!(db.refresh_aes_key(&client_id).await.is_err());

        let public_key = vec![7; crate::crypt::PUBLIC_KEY_SIZE];
        let first = db.set_public_key_and_generate_aes(&client_id, &public_key)
            .await.unwrap();
        let record = db.lookup_by_id(&client_id).await.unwrap().unwrap();
        assert!(record.has_key_material());
        assert_eq!(record.aes_key.as_deref(), Some(first.as_slice()));

        // A reconnect issues a fresh key, never the stored one
        let second = db.refresh_aes_key(&client_id).await.unwrap();
        assert_ne!(first, second);
        let record = db.lookup_by_id(&client_id).await.unwrap().unwrap();
        assert_eq!(record.aes_key.as_deref(), Some(second.as_slice()));
    }

    #[tokio::test]
    async fn test_file_lifecycle() {
        let db = DbMemory::new();
        let client_id = db.register_client("alice").await.unwrap();

        db.record_file(&client_id, "backup.tar", "/srv/x/backup.tar", 1234, 42)
            .await.unwrap();
        let record = db.lookup_file(&client_id, "backup.tar").await.unwrap().unwrap();
        assert!(!record.verified);
        assert_eq!(record.size, 1234);

        db.mark_file_verified(&client_id, "backup.tar").await.unwrap();
        assert!(db.lookup_file(&client_id, "backup.tar").await.unwrap()
                    .unwrap().verified);

        // A re-upload resets the verified flag
        db.record_file(&client_id, "backup.tar", "/srv/x/backup.tar", 1234, 43)
            .await.unwrap();
        assert!(!db.lookup_file(&client_id, "backup.tar").await.unwrap()
                    .unwrap().verified);

        db.drop_file(&client_id, "backup.tar").await.unwrap();
        assert!(db.lookup_file(&client_id, "backup.tar").await.unwrap().is_none());
        assert!(db.mark_file_verified(&client_id, "backup.tar").await.is_err());
    }
}
