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
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_derive::Deserialize;

use crate::error::{NetError, NetResult};
use crate::protocol::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_PAYLOAD};
use crate::sanitize;

pub const DEFAULT_LISTEN_PORT: u16 = 1256;

pub enum RegistryBackend {
    Memory,
    Sqlite,
}

pub struct ServerConfig {
    /* Listen address for the backup server */
    pub listen_address: String,

    /* Where verified uploads land, one subdirectory per client */
    pub data_root: PathBuf,

    /* Client/file registry backend */
    pub db_type: RegistryBackend,
    pub db_uri: String,

    /* Largest payload a frame header may declare */
    pub max_payload: u32,

    /* How long in-flight sessions get to finish on shutdown */
    pub drain_timeout: Duration,
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<ServerConfig> {
        let config_file = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: StructuredConfig = toml::from_str(&config_file)
                .context("Failed to parse config file")?;
        Self::from_structured(config)
    }

    pub fn defaults() -> ServerConfig {
        Self::from_structured(StructuredConfig::default())
            .expect("Default configuration is valid")
    }

    fn from_structured(config: StructuredConfig) -> Result<ServerConfig> {
        let server_section = config.server.unwrap_or_default();

        // The default is to listen on 127.0.0.1, which means that ONLY
        // connections from localhost are allowed.  To listen on any IPv4
        // address, you should set listen_address = "0.0.0.0"
        let listen_address = format!("{}:{}",
                server_section.listen_address.as_deref().unwrap_or("127.0.0.1"),
                server_section.listen_port.unwrap_or(DEFAULT_LISTEN_PORT));

        let data_root =
            if let Some(data_root) = config.data_root {
                PathBuf::from(data_root)
            } else {
                std::env::current_dir()
                    .context("Failed to determine current working directory")?
                    .join("received")
            };

        let registry_section = config.registry.unwrap_or_default();
        let db_type = if let Some(type_str) = registry_section.db_type {
            match type_str.as_str() {
                "none" => RegistryBackend::Memory,
                "sqlite" => RegistryBackend::Sqlite,
                _ => return Err(anyhow!("Unknown database type: {}", type_str))
            }
        } else {
            RegistryBackend::Sqlite
        };
        let db_uri = registry_section.db_uri
                .unwrap_or_else(|| "sqlite://backhaul.db".to_string());

        let max_payload = config.max_payload.unwrap_or(DEFAULT_MAX_PAYLOAD);
        let drain_timeout = Duration::from_secs(
                config.drain_timeout_secs.unwrap_or(10));

        Ok(ServerConfig {
            listen_address,
            data_root,
            db_type,
            db_uri,
            max_payload,
            drain_timeout,
        })
    }
}

#[derive(Deserialize, Default)]
struct StructuredConfig {
    data_root: Option<String>,
    max_payload: Option<u32>,
    drain_timeout_secs: Option<u64>,
    server: Option<ServerAddrConfig>,
    registry: Option<RegistryConfig>,
}

#[derive(Deserialize, Default)]
struct ServerAddrConfig {
    listen_address: Option<String>,
    listen_port: Option<u16>,
}

#[derive(Deserialize, Default)]
struct RegistryConfig {
    db_type: Option<String>,
    db_uri: Option<String>,
}

/// Per-run client settings, read from the three-line `transfer.info`
/// file next to which `me.info` is kept:
///
/// ```text
/// <host>:<port>
/// <display-name>
/// <absolute-file-path>
/// ```
pub struct ClientConfig {
    pub server_addr: String,
    pub display_name: String,
    pub file_path: PathBuf,
    pub identity_dir: PathBuf,
    pub chunk_size: usize,
}

impl ClientConfig {
    pub fn from_transfer_info(path: &Path) -> NetResult<ClientConfig> {
        let contents = std::fs::read_to_string(path).map_err(|err| {
            NetError::Config(format!("Could not read {}: {err}", path.display()))
        })?;
        let mut lines = contents.lines();

        let server_addr = lines.next()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .ok_or_else(|| NetError::Config(
                    "transfer.info is missing the server address line".to_string()))?
            .to_string();
        if !server_addr.contains(':') {
            return Err(NetError::Config(format!(
                    "Server address '{server_addr}' is not of the form host:port")));
        }

        let display_name = lines.next()
            .ok_or_else(|| NetError::Config(
                    "transfer.info is missing the display name line".to_string()))?;
        let display_name = sanitize::clean_display_name(display_name)
            .map_err(|err| NetError::Config(format!("Bad display name: {err}")))?;

        let file_path = lines.next()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .ok_or_else(|| NetError::Config(
                    "transfer.info is missing the file path line".to_string()))?;
        let file_path = PathBuf::from(file_path);

        let identity_dir = path.parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        Ok(ClientConfig {
            server_addr,
            display_name,
            file_path,
            identity_dir,
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::defaults();
        assert_eq!(config.listen_address, "127.0.0.1:1256");
        assert_eq!(config.max_payload, DEFAULT_MAX_PAYLOAD);
        assert_eq!(config.drain_timeout, Duration::from_secs(10));
        assert!(matches!(config.db_type, RegistryBackend::Sqlite));
    }

    #[test]
    fn test_server_config_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("backhauld.toml");
        std::fs::write(&config_path, concat!(
            "data_root = \"/srv/backups\"\n",
            "drain_timeout_secs = 3\n",
            "\n",
            "[server]\n",
            "listen_address = \"0.0.0.0\"\n",
            "listen_port = 9000\n",
            "\n",
            "[registry]\n",
            "db_type = \"none\"\n",
        )).unwrap();

        let config = ServerConfig::from_file(&config_path).unwrap();
        assert_eq!(config.listen_address, "0.0.0.0:9000");
        assert_eq!(config.data_root, PathBuf::from("/srv/backups"));
        assert_eq!(config.drain_timeout, Duration::from_secs(3));
        assert!(matches!(config.db_type, RegistryBackend::Memory));
    }

    #[test]
    fn test_transfer_info_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let info_path = dir.path().join("transfer.info");
        let mut file = std::fs::File::create(&info_path).unwrap();
        writeln!(file, "198.51.100.7:1256").unwrap();
        writeln!(file, "alice").unwrap();
        writeln!(file, "/home/alice/backup.tar").unwrap();
        drop(file);

        let config = ClientConfig::from_transfer_info(&info_path).unwrap();
        assert_eq!(config.server_addr, "198.51.100.7:1256");
        assert_eq!(config.display_name, "alice");
        assert_eq!(config.file_path, PathBuf::from("/home/alice/backup.tar"));
        assert_eq!(config.identity_dir, dir.path());
    }

    #[test]
    fn test_transfer_info_rejects_bad_address() {
        let dir = tempfile::tempdir().unwrap();
        let info_path = dir.path().join("transfer.info");
        std::fs::write(&info_path, "not-an-address\nalice\n/tmp/f\n").unwrap();
        assert!(matches!(ClientConfig::from_transfer_info(&info_path),
                         Err(NetError::Config(_))));
    }

    #[test]
    fn test_transfer_info_requires_three_lines() {
        let dir = tempfile::tempdir().unwrap();
        let info_path = dir.path().join("transfer.info");
        std::fs::write(&info_path, "127.0.0.1:1256\nalice\n").unwrap();
        assert!(ClientConfig::from_transfer_info(&info_path).is_err());
    }
}
