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

use std::path::Path;
use std::process::ExitCode;

use clap::{Arg, ArgAction, Command};
use tokio::sync::mpsc;
use tracing::error;
use tracing_subscriber::EnvFilter;

use backhaul::client::{BackupClient, TransferEvent};
use backhaul::config::ClientConfig;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Command::new("backhaul")
        .about("backhaul: encrypted one-shot file upload client")
        .version("0.1.0")
        .arg(Arg::new("transfer-info").long("transfer-info").value_name("FILE")
            .default_value("transfer.info")
            .help("Path to the transfer description file"))
        .arg(Arg::new("quiet").long("quiet").action(ArgAction::SetTrue)
            .help("Suppress progress output"))
        .get_matches();

    let info_path = args.get_one::<String>("transfer-info").unwrap();
    let config = match ClientConfig::from_transfer_info(Path::new(info_path)) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            return exit_code(&err);
        }
    };
    let quiet = args.get_flag("quiet");

    // One session, strictly sequential; a single-threaded runtime is
    // all the client needs (key generation runs on the blocking pool).
    let runtime = tokio::runtime::Builder::new_current_thread()
                            .enable_all().build().unwrap();
    let result = runtime.block_on(async {
        let (events_send, mut events_recv) = mpsc::unbounded_channel();
        let printer = tokio::spawn(async move {
            while let Some(event) = events_recv.recv().await {
                if !quiet {
                    print_event(&event);
                }
            }
        });

        let client = BackupClient::with_events(config, events_send);
        let result = client.run().await;
        drop(client);
        let _ = printer.await;
        result
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            exit_code(&err)
        }
    }
}

fn exit_code(err: &backhaul::NetError) -> ExitCode {
    ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1))
}

fn print_event(event: &TransferEvent) {
    match event {
        TransferEvent::Connected { server_addr } => {
            println!("Connected to {server_addr}");
        }
        TransferEvent::Registered { client_id } => {
            println!("Registered with id {}", client_id.simple());
        }
        TransferEvent::Reconnected { client_id } => {
            println!("Reconnected with id {}", client_id.simple());
        }
        TransferEvent::KeyReady => {
            println!("Session key established");
        }
        TransferEvent::Progress { sent_packets, total_packets } => {
            println!("Sent chunk {sent_packets}/{total_packets}");
        }
        TransferEvent::ServerCrc { local, remote } => {
            println!("Checksums: local {local:#010x}, server {remote:#010x}");
        }
        TransferEvent::Retrying { attempt } => {
            println!("Checksum mismatch; retry {attempt}");
        }
        TransferEvent::Verified { crc } => {
            println!("Upload verified (crc {crc:#010x})");
        }
        TransferEvent::Aborted => {
            println!("Upload abandoned after repeated checksum mismatches");
        }
    }
}
