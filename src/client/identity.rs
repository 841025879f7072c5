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

use std::io::Write;
use std::path::Path;

use rsa::RsaPrivateKey;
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::crypt;
use crate::error::{NetError, NetResult};

pub const ME_INFO_NAME: &str = "me.info";
pub const PRIV_KEY_NAME: &str = "priv.key";

/// The client's persistent identity, kept in the three-line `me.info`
/// file: display name, client id as 32 hex digits, private key in
/// base64.  Its presence is what turns a first run into a reconnect.
pub struct Identity {
    pub name: String,
    pub client_id: Uuid,
    pub private_key: RsaPrivateKey,
}

impl Identity {
    /// Returns `Ok(None)` when no identity file exists (first run);
    /// a file that exists but cannot be used is a hard error the user
    /// has to resolve.
    pub fn load(dir: &Path) -> NetResult<Option<Identity>> {
        let path = dir.join(ME_INFO_NAME);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(NetError::Config(format!(
                        "Could not read {}: {err}", path.display())));
            }
        };

        let mut lines = contents.lines();
        let name = lines.next()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .ok_or_else(|| NetError::Config(
                    "me.info is missing the display name line".to_string()))?
            .to_string();

        let id_line = lines.next()
            .ok_or_else(|| NetError::Config(
                    "me.info is missing the client id line".to_string()))?;
        let client_id = Uuid::try_parse(id_line.trim()).map_err(|_| {
            NetError::Config(format!("'{}' is not a valid client id", id_line.trim()))
        })?;

        let key_line = lines.next()
            .ok_or_else(|| NetError::Config(
                    "me.info is missing the private key line".to_string()))?;
        let private_key = crypt::decode_private_key(key_line).map_err(|err| {
            NetError::Config(format!("me.info holds an unusable private key: {err}"))
        })?;

        Ok(Some(Identity { name, client_id, private_key }))
    }

    /// Writes `me.info` (and the `priv.key` copy) atomically so a
    /// crash mid-write can never destroy an identity that already
    /// registered with the server.
    pub fn store(&self, dir: &Path) -> NetResult<()> {
        let key_base64 = crypt::encode_private_key(&self.private_key)?;
        let me_info = format!("{}\n{}\n{}\n",
                              self.name, self.client_id.simple(), key_base64);
        write_atomic(dir, ME_INFO_NAME, &me_info)?;
        write_atomic(dir, PRIV_KEY_NAME, &format!("{key_base64}\n"))?;
        Ok(())
    }
}

fn write_atomic(dir: &Path, name: &str, contents: &str) -> NetResult<()> {
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(contents.as_bytes())?;
    file.persist(dir.join(name)).map_err(|err| NetError::Io(err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_identity_is_first_run() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Identity::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_store_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Identity {
            name: "alice".to_string(),
            client_id: Uuid::new_v4(),
            private_key: crypt::generate_keypair().unwrap(),
        };
        identity.store(dir.path()).unwrap();

        let loaded = Identity::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.name, "alice");
        assert_eq!(loaded.client_id, identity.client_id);
        assert_eq!(loaded.private_key, identity.private_key);

        // me.info carries the id as 32 lowercase hex digits
        let contents = std::fs::read_to_string(dir.path().join(ME_INFO_NAME)).unwrap();
        let id_line = contents.lines().nth(1).unwrap();
        assert_eq!(id_line.len(), 32);
        assert!(id_line.chars().all(|ch| ch.is_ascii_hexdigit()));

        // priv.key mirrors the private key line
        let key_copy = std::fs::read_to_string(dir.path().join(PRIV_KEY_NAME)).unwrap();
        assert_eq!(key_copy.trim(), contents.lines().nth(2).unwrap());
    }

    #[test]
    fn test_malformed_identity_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(ME_INFO_NAME),
                       "alice\nnot-a-client-id\nAAAA\n").unwrap();
        assert!(matches!(Identity::load(dir.path()),
                         Err(NetError::Config(_))));

        std::fs::write(dir.path().join(ME_INFO_NAME), "alice\n").unwrap();
        assert!(matches!(Identity::load(dir.path()),
                         Err(NetError::Config(_))));
    }
}
