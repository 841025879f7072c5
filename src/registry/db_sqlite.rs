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

use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{FromRow, Row, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::crypt::AES_KEY_SIZE;
use crate::error::{NetError, NetResult};
use super::db_interface::DbInterface;
use super::{generate_aes_key, unix_now, ClientRecord, FileRecord};

pub struct DbSqlite {
    pool: SqlitePool,
}

impl DbSqlite {
    const SCHEMA_VERSION: i32 = 1;

    pub async fn new(db_uri: &str) -> Result<Self> {
        // A single persistent connection keeps every mutating statement
        // serialized, and also keeps :memory: databases alive.
        let pool_options = SqlitePoolOptions::new()
                        .max_connections(1)
                        .idle_timeout(None)
                        .max_lifetime(None);
        let pool = if db_uri.contains(":memory:") {
            pool_options.connect(db_uri).await?
        } else {
            let options = SqliteConnectOptions::from_str(db_uri)?
                            .create_if_missing(true);
            pool_options.connect_with(options).await?
        };

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<()> {
        let _ = sqlx::raw_sql("CREATE TABLE IF NOT EXISTS registry_meta ( \
                                   schema_version  INTEGER NOT NULL)")
            .execute(&self.pool).await?;

        let version: Option<i64> =
            sqlx::query_scalar("SELECT schema_version FROM registry_meta LIMIT 1")
                .fetch_optional(&self.pool).await?;
        let Some(version) = version else {
            // A freshly created (or pre-versioning) database
            debug!("Creating the client and file registry tables");
            let _ = sqlx::raw_sql(include_str!("sqlite_schema.sql"))
                .execute(&self.pool).await?;
            let _ = sqlx::query("INSERT INTO registry_meta (schema_version) VALUES ($1)")
                .bind(Self::SCHEMA_VERSION)
                .execute(&self.pool).await?;
            return Ok(());
        };

        if version != i64::from(Self::SCHEMA_VERSION) {
            anyhow::bail!("Registry database is at schema version {version}, \
                           but this build expects {}", Self::SCHEMA_VERSION);
        }
        Ok(())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.kind() == sqlx::error::ErrorKind::UniqueViolation
        }
        _ => false,
    }
}

#[async_trait]
impl DbInterface for DbSqlite {
    async fn register_client(&self, name: &str) -> NetResult<Uuid> {
        let existing: Option<Uuid> =
            sqlx::query("SELECT client_id FROM clients WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool).await
                .map_err(|err| {
                    warn!("Failed to query for client name: {err}");
                    NetError::Registry(err.to_string())
                })?
                .map(|row| row.get(0));
        if let Some(client_id) = existing {
            warn!("Client with name '{name}' already exists: {client_id}");
            return Err(NetError::NameTaken);
        }

        let client_id = Uuid::new_v4();
        let _ = sqlx::query("INSERT INTO clients (client_id, name, last_seen) \
                                    VALUES ($1, $2, $3)")
            .bind(client_id)
            .bind(name)
            .bind(unix_now())
            .execute(&self.pool).await
            .map_err(|err| {
                // Two sessions raced on the same name; exactly one of
                // them hits the UNIQUE constraint.
                if is_unique_violation(&err) {
                    warn!("Client with name '{name}' already exists");
                    NetError::NameTaken
                } else {
                    warn!("Failed to register client: {err}");
                    NetError::Registry(err.to_string())
                }
            })?;

        debug!("Registered client '{name}': {client_id}");
        Ok(client_id)
    }

    async fn lookup_by_name(&self, name: &str) -> NetResult<Option<ClientRecord>> {
        sqlx::query_as("SELECT client_id, name, public_key, aes_key, last_seen \
                            FROM clients WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool).await
            .map_err(|err| {
                warn!("Failed to fetch client by name: {err}");
                NetError::Registry(err.to_string())
            })
    }

    async fn lookup_by_id(&self, client_id: &Uuid) -> NetResult<Option<ClientRecord>> {
        sqlx::query_as("SELECT client_id, name, public_key, aes_key, last_seen \
                            FROM clients WHERE client_id = $1")
            .bind(client_id)
            .fetch_optional(&self.pool).await
            .map_err(|err| {
                warn!("Failed to fetch client by id: {err}");
                NetError::Registry(err.to_string())
            })
    }

    async fn set_public_key_and_generate_aes(&self, client_id: &Uuid, public_key: &[u8])
        -> NetResult<[u8; AES_KEY_SIZE]>
    {
        let aes_key = generate_aes_key()?;
        let result = sqlx::query("UPDATE clients \
                                    SET public_key = $2, aes_key = $3, last_seen = $4 \
                                    WHERE client_id = $1")
            .bind(client_id)
            .bind(public_key)
            .bind(aes_key.as_slice())
            .bind(unix_now())
            .execute(&self.pool).await
            .map_err(|err| {
                warn!("Failed to store public key: {err}");
                NetError::Registry(err.to_string())
            })?;
        if result.rows_affected() == 0 {
            return Err(NetError::Registry(format!("No such client {client_id}")));
        }
        Ok(aes_key)
    }

    async fn refresh_aes_key(&self, client_id: &Uuid) -> NetResult<[u8; AES_KEY_SIZE]> {
        let aes_key = generate_aes_key()?;
        let result = sqlx::query("UPDATE clients \
                                    SET aes_key = $2, last_seen = $3 \
                                    WHERE client_id = $1 AND public_key IS NOT NULL")
            .bind(client_id)
            .bind(aes_key.as_slice())
            .bind(unix_now())
            .execute(&self.pool).await
            .map_err(|err| {
                warn!("Failed to refresh AES key: {err}");
                NetError::Registry(err.to_string())
            })?;
        if result.rows_affected() == 0 {
            return Err(NetError::Registry(format!(
                    "Client {client_id} has no public key on file")));
        }
        Ok(aes_key)
    }

    async fn touch_last_seen(&self, client_id: &Uuid) -> NetResult<()> {
        let _ = sqlx::query("UPDATE clients SET last_seen = $2 WHERE client_id = $1")
            .bind(client_id)
            .bind(unix_now())
            .execute(&self.pool).await
            .map_err(|err| {
                warn!("Failed to update last_seen: {err}");
                NetError::Registry(err.to_string())
            })?;
        Ok(())
    }

    async fn record_file(&self, client_id: &Uuid, filename: &str, path: &str,
                         size: i64, crc: u32) -> NetResult<()>
    {
        let _ = sqlx::query("INSERT INTO files \
                                    (client_id, filename, path, size, crc32, \
                                     verified, uploaded_at) \
                                VALUES ($1, $2, $3, $4, $5, 0, $6) \
                                ON CONFLICT (client_id, filename) DO UPDATE \
                                    SET path = $3, size = $4, crc32 = $5, \
                                        verified = 0, uploaded_at = $6")
            .bind(client_id)
            .bind(filename)
            .bind(path)
            .bind(size)
            .bind(crc)
            .bind(unix_now())
            .execute(&self.pool).await
            .map_err(|err| {
                warn!("Failed to record file: {err}");
                NetError::Registry(err.to_string())
            })?;
        Ok(())
    }

    async fn mark_file_verified(&self, client_id: &Uuid, filename: &str) -> NetResult<()> {
        let result = sqlx::query("UPDATE files SET verified = 1 \
                                    WHERE client_id = $1 AND filename = $2")
            .bind(client_id)
            .bind(filename)
            .execute(&self.pool).await
            .map_err(|err| {
                warn!("Failed to mark file verified: {err}");
                NetError::Registry(err.to_string())
            })?;
        if result.rows_affected() == 0 {
            return Err(NetError::Registry(format!(
                    "No file record for '{filename}' of client {client_id}")));
        }
        Ok(())
    }

    async fn drop_file(&self, client_id: &Uuid, filename: &str) -> NetResult<()> {
        let _ = sqlx::query("DELETE FROM files WHERE client_id = $1 AND filename = $2")
            .bind(client_id)
            .bind(filename)
            .execute(&self.pool).await
            .map_err(|err| {
                warn!("Failed to drop file record: {err}");
                NetError::Registry(err.to_string())
            })?;
        Ok(())
    }

    async fn lookup_file(&self, client_id: &Uuid, filename: &str)
        -> NetResult<Option<FileRecord>>
    {
        sqlx::query_as("SELECT client_id, filename, path, size, crc32, \
                               verified, uploaded_at \
                            FROM files WHERE client_id = $1 AND filename = $2")
            .bind(client_id)
            .bind(filename)
            .fetch_optional(&self.pool).await
            .map_err(|err| {
                warn!("Failed to fetch file record: {err}");
                NetError::Registry(err.to_string())
            })
    }
}

impl FromRow<'_, SqliteRow> for ClientRecord {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            client_id: row.try_get("client_id")?,
            name: row.try_get("name")?,
            public_key: row.try_get("public_key")?,
            aes_key: row.try_get("aes_key")?,
            last_seen: row.try_get("last_seen")?,
        })
    }
}

impl FromRow<'_, SqliteRow> for FileRecord {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            client_id: row.try_get("client_id")?,
            filename: row.try_get("filename")?,
            path: row.try_get("path")?,
            size: row.try_get("size")?,
            crc32: row.try_get("crc32")?,
            verified: row.try_get("verified")?,
            uploaded_at: row.try_get("uploaded_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn volatile_db() -> DbSqlite {
        DbSqlite::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let db = volatile_db().await;
        let client_id = db.register_client("alice").await.unwrap();

        let record = db.lookup_by_name("alice").await.unwrap().unwrap();
        assert_eq!(record.client_id, client_id);
        assert!(record.public_key.is_none());
        assert!(!record.has_key_material());

        let record = db.lookup_by_id(&client_id).await.unwrap().unwrap();
        assert_eq!(record.name, "alice");

        assert!(db.lookup_by_name("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let db = volatile_db().await;
        db.register_client("bob").await.unwrap();
        assert!(matches!(db.register_client("bob").await,
                         Err(NetError::NameTaken)));
    }

    #[tokio::test]
    async fn test_key_issue_and_refresh() {
        let db = volatile_db().await;
        let client_id = db.register_client("alice").await.unwrap();

        assert!(db.refresh_aes_key(&client_id).await.is_err());

        let public_key = vec![7; crate::crypt::PUBLIC_KEY_SIZE];
        let first = db.set_public_key_and_generate_aes(&client_id, &public_key)
            .await.unwrap();

        let record = db.lookup_by_id(&client_id).await.unwrap().unwrap();
        assert!(record.has_key_material());
        assert_eq!(record.public_key.as_deref(), Some(public_key.as_slice()));
        assert_eq!(record.aes_key.as_deref(), Some(first.as_slice()));

        let second = db.refresh_aes_key(&client_id).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_file_lifecycle() {
        let db = volatile_db().await;
        let client_id = db.register_client("alice").await.unwrap();

        db.record_file(&client_id, "backup.tar", "/srv/x/backup.tar",
                       4096, 0xcafe_f00d).await.unwrap();
        let record = db.lookup_file(&client_id, "backup.tar").await.unwrap().unwrap();
        assert!(!record.verified);
        assert_eq!(record.crc32, 0xcafe_f00d);

        db.mark_file_verified(&client_id, "backup.tar").await.unwrap();
        assert!(db.lookup_file(&client_id, "backup.tar").await.unwrap()
                    .unwrap().verified);

        // A re-upload resets the verified flag
        db.record_file(&client_id, "backup.tar", "/srv/x/backup.tar",
                       4096, 0xcafe_f00d).await.unwrap();
        assert!(!db.lookup_file(&client_id, "backup.tar").await.unwrap()
                    .unwrap().verified);

        db.drop_file(&client_id, "backup.tar").await.unwrap();
        assert!(db.lookup_file(&client_id, "backup.tar").await.unwrap().is_none());
        assert!(db.mark_file_verified(&client_id, "backup.tar").await.is_err());
    }

    #[tokio::test]
    async fn test_schema_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_uri = format!("sqlite://{}/registry.db", dir.path().display());

        let db = DbSqlite::new(&db_uri).await.unwrap();
        let client_id = db.register_client("alice").await.unwrap();
        db.pool.close().await;

        let db = DbSqlite::new(&db_uri).await.unwrap();
        let record = db.lookup_by_id(&client_id).await.unwrap().unwrap();
        assert_eq!(record.name, "alice");
    }
}
