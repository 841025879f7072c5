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

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::NetResult;

// Rides on the end of the stored filename while an upload is unverified
const PARTIAL_SUFFIX: &str = ".partial";

/// The received-files tree: one subdirectory per client id, uploads
/// landing as `<filename>.partial` until their checksum is confirmed.
/// Filenames must already be sanitized to a single path component.
pub struct ClientStore {
    root: PathBuf,
}

impl ClientStore {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self { root: data_root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn final_path(&self, client_id: &Uuid, filename: &str) -> PathBuf {
        self.root.join(client_id.simple().to_string()).join(filename)
    }

    pub fn partial_path(&self, client_id: &Uuid, filename: &str) -> PathBuf {
        self.root.join(client_id.simple().to_string())
            .join(format!("{filename}{PARTIAL_SUFFIX}"))
    }

    /// Opens a fresh partial file for an upload, truncating any
    /// leftover from a previous attempt.
    pub async fn create_partial(&self, client_id: &Uuid, filename: &str)
        -> NetResult<tokio::fs::File>
    {
        let client_dir = self.root.join(client_id.simple().to_string());
        tokio::fs::create_dir_all(&client_dir).await?;
        Ok(tokio::fs::File::create(self.partial_path(client_id, filename)).await?)
    }

    /// Promotes a fully verified upload onto its final name.  The
    /// rename is atomic, so a verified file is never half-written.
    pub async fn commit(&self, client_id: &Uuid, filename: &str) -> NetResult<PathBuf> {
        let final_path = self.final_path(client_id, filename);
        tokio::fs::rename(self.partial_path(client_id, filename), &final_path).await?;
        debug!("Stored verified upload at {}", final_path.display());
        Ok(final_path)
    }

    /// Best-effort removal of a partial upload.
    pub async fn discard_partial(&self, client_id: &Uuid, filename: &str) {
        let path = self.partial_path(client_id, filename);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("Discarded partial upload {}", path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
            Err(err) => warn!("Could not remove {}: {err}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn test_partial_commit_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = ClientStore::new(dir.path());
        let client_id = Uuid::new_v4();

        let mut partial = store.create_partial(&client_id, "notes.txt").await.unwrap();
        partial.write_all(b"backup contents").await.unwrap();
        partial.sync_all().await.unwrap();
        drop(partial);

        assert!(store.partial_path(&client_id, "notes.txt").exists());
        assert!(!store.final_path(&client_id, "notes.txt").exists());

        let final_path = store.commit(&client_id, "notes.txt").await.unwrap();
        assert_eq!(std::fs::read(&final_path).unwrap(), b"backup contents");
        assert!(!store.partial_path(&client_id, "notes.txt").exists());
    }

    #[tokio::test]
    async fn test_discard_partial_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ClientStore::new(dir.path());
        let client_id = Uuid::new_v4();

        let mut partial = store.create_partial(&client_id, "notes.txt").await.unwrap();
        partial.write_all(b"junk").await.unwrap();
        drop(partial);

        store.discard_partial(&client_id, "notes.txt").await;
        assert!(!store.partial_path(&client_id, "notes.txt").exists());
        // Nothing left to remove; must not blow up
        store.discard_partial(&client_id, "notes.txt").await;
    }

    #[tokio::test]
    async fn test_create_partial_truncates_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let store = ClientStore::new(dir.path());
        let client_id = Uuid::new_v4();

        let mut partial = store.create_partial(&client_id, "a.bin").await.unwrap();
        partial.write_all(b"stale data from a failed attempt").await.unwrap();
        drop(partial);

        let partial = store.create_partial(&client_id, "a.bin").await.unwrap();
        drop(partial);
        assert_eq!(std::fs::metadata(store.partial_path(&client_id, "a.bin"))
                       .unwrap().len(), 0);
    }
}
