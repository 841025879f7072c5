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

#![deny(clippy::all)]
#![deny(clippy::pedantic)]

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use clap::{Arg, Command};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use backhaul::config::ServerConfig;
use backhaul::registry;
use backhaul::server::BackupServer;

#[cfg(debug_assertions)]
const DEFAULT_LOG_LEVEL: &str = "debug";

#[cfg(not(debug_assertions))]
const DEFAULT_LOG_LEVEL: &str = "info";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL)))
        .init();

    let args = Command::new("backhauld")
        .about("backhauld: the backhaul encrypted backup server")
        .version("0.1.0")
        .arg(Arg::new("config").long("config").value_name("FILE")
            .help("Load configuration from FILE instead of searching for backhauld.toml"))
        .get_matches();

    let server_config = match args.get_one::<String>("config") {
        Some(path) => load_config_file(Path::new(path)),
        None => load_config(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
                            .enable_all().build().unwrap();
    runtime.block_on(async {
        let registry = match registry::open_registry(&server_config).await {
            Ok(registry) => registry,
            Err(err) => {
                error!("Failed to open the registry: {err}");
                std::process::exit(1);
            }
        };

        let server = match BackupServer::start(server_config, registry).await {
            Ok(server) => server,
            Err(err) => {
                error!("Failed to start the server: {err}");
                std::process::exit(1);
            }
        };

        let shutdown = server.shutdown_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received; shutting down");
                let _ = shutdown.send(());
            }
        });

        server.run().await;
    });
}

fn load_config_file(path: &Path) -> ServerConfig {
    match ServerConfig::from_file(path) {
        Ok(config) => config,
        Err(err) => {
            error!("Failed to load config file {}: {err:#}", path.display());
            std::process::exit(1);
        }
    }
}

fn load_config() -> ServerConfig {
    // Look for a backhauld.toml config file with the following precedence:
    //  1) In the same directory as the executable
    //  2) If the executable is in a bin/ directory, in ../etc/
    //  3) In the current working dir (debug builds only)
    //  4) In the root /etc/ dir

    let mut try_paths: Vec<PathBuf> = Vec::new();
    let config_file = Path::new("backhauld.toml");

    let exe_path = match std::env::current_exe() {
        Ok(path) => path.parent().unwrap().to_owned(),
        Err(err) => {
            error!("Failed to get executable path: {err}");
            std::process::exit(1);
        }
    };
    try_paths.push([exe_path.as_path(), config_file].iter().collect());

    if exe_path.file_name() == Some(OsStr::new("bin")) {
        let exe_parent = exe_path.parent().unwrap();
        try_paths.push([exe_parent, Path::new("etc"), config_file].iter().collect());
    }

    #[cfg(debug_assertions)]
    try_paths.push(config_file.to_owned());

    #[cfg(not(windows))]
    try_paths.push(Path::new("/etc/backhauld.toml").to_owned());

    for path in &try_paths {
        if !path.exists() {
            continue;
        }
        return load_config_file(path);
    }

    info!("No backhauld.toml found; using the default configuration");
    ServerConfig::defaults()
}
