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

mod identity;
pub use identity::Identity;

use std::io::Cursor;

use rsa::RsaPublicKey;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checksum::Crc32Stream;
use crate::config::ClientConfig;
use crate::crypt::{self, CbcEncryptStream, AES_KEY_SIZE};
use crate::error::{NetError, NetResult};
use crate::proto_error;
use crate::protocol::messages::{CliToSrv, Request, SrvToCli};
use crate::protocol::{DEFAULT_MAX_PAYLOAD, MAX_UPLOAD_RETRIES};
use crate::sanitize;

/// Progress notifications for whatever front-end drives the client.
/// Consumers only ever see this stream; none of the session internals
/// leak out.
#[derive(Clone, Debug)]
pub enum TransferEvent {
    Connected { server_addr: String },
    Registered { client_id: Uuid },
    Reconnected { client_id: Uuid },
    KeyReady,
    Progress { sent_packets: u16, total_packets: u16 },
    ServerCrc { local: u32, remote: u32 },
    Retrying { attempt: u32 },
    Verified { crc: u32 },
    Aborted,
}

type NetStream = BufReader<TcpStream>;

/// Uploads exactly one file per run: establish (or re-establish) the
/// identity, receive a session key, stream the file, verify checksums.
/// Dropping the returned future cancels the session with its socket.
pub struct BackupClient {
    config: ClientConfig,
    events: Option<mpsc::UnboundedSender<TransferEvent>>,
}

impl BackupClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config, events: None }
    }

    pub fn with_events(config: ClientConfig,
                       events: mpsc::UnboundedSender<TransferEvent>) -> Self {
        Self { config, events: Some(events) }
    }

    fn emit(&self, event: TransferEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    pub async fn run(&self) -> NetResult<()> {
        let sock = TcpStream::connect(&self.config.server_addr).await?;
        let mut stream = BufReader::new(sock);
        debug!("Connected to {}", self.config.server_addr);
        self.emit(TransferEvent::Connected {
            server_addr: self.config.server_addr.clone(),
        });

        let (identity, aes_key) = self.establish(&mut stream).await?;
        self.emit(TransferEvent::KeyReady);
        self.upload(&mut stream, &identity, &aes_key).await
    }

    /// Reconnect when an identity is on disk, register from scratch
    /// otherwise.  A denied reconnect falls back to a fresh
    /// registration, as a wiped server no longer knows this client.
    async fn establish(&self, stream: &mut NetStream)
        -> NetResult<(Identity, [u8; AES_KEY_SIZE])>
    {
        if let Some(identity) = Identity::load(&self.config.identity_dir)? {
            if identity.name != self.config.display_name {
                return Err(NetError::Config(format!(
                        "me.info belongs to '{}' but transfer.info names '{}'",
                        identity.name, self.config.display_name)));
            }

            send_request(stream, identity.client_id, CliToSrv::Reconnect {
                name: identity.name.clone(),
            }).await?;
            match read_response(stream).await? {
                SrvToCli::ReconnectAllowed { client_id, wrapped_key } => {
                    if client_id != identity.client_id {
                        return Err(proto_error!(
                                "Reconnect was answered for a different client id"));
                    }
                    let aes_key = crypt::unwrap_session_key(&identity.private_key,
                                                            wrapped_key.as_slice())?;
                    info!("Reconnected as '{}' ({client_id})", identity.name);
                    self.emit(TransferEvent::Reconnected { client_id });
                    return Ok((identity, aes_key));
                }
                SrvToCli::ReconnectDenied { .. } => {
                    warn!("Server denied the reconnect; registering from scratch");
                }
                _ => return Err(proto_error!("Unexpected response to a reconnect")),
            }
        }

        self.register(stream).await
    }

    async fn register(&self, stream: &mut NetStream)
        -> NetResult<(Identity, [u8; AES_KEY_SIZE])>
    {
        let name = self.config.display_name.clone();
        send_request(stream, Uuid::nil(), CliToSrv::Register {
            name: name.clone(),
        }).await?;
        let client_id = match read_response(stream).await? {
            SrvToCli::RegisterOk { client_id } => client_id,
            SrvToCli::RegisterFailed => {
                return Err(proto_error!("Server refused to register '{name}'"));
            }
            _ => return Err(proto_error!("Unexpected response to a registration")),
        };
        info!("Registered as '{name}' ({client_id})");
        self.emit(TransferEvent::Registered { client_id });

        // Key generation is the one CPU-heavy step; keep it off the
        // reactor so event consumers stay live.
        debug!("Generating an RSA-{} keypair", crypt::RSA_KEY_BITS);
        let private_key = tokio::task::spawn_blocking(crypt::generate_keypair)
            .await
            .map_err(|err| NetError::Crypto(format!("Key generation died: {err}")))??;
        let identity = Identity { name: name.clone(), client_id, private_key };
        identity.store(&self.config.identity_dir)?;

        let public_key = crypt::encode_public_key(
                &RsaPublicKey::from(&identity.private_key))?;
        send_request(stream, client_id, CliToSrv::SendPublicKey {
            name,
            public_key: Box::new(public_key),
        }).await?;
        match read_response(stream).await? {
            SrvToCli::PublicKeyReceived { client_id: confirmed, wrapped_key } => {
                if confirmed != client_id {
                    return Err(proto_error!(
                            "Key delivery was confirmed for a different client id"));
                }
                let aes_key = crypt::unwrap_session_key(&identity.private_key,
                                                        wrapped_key.as_slice())?;
                Ok((identity, aes_key))
            }
            _ => Err(proto_error!("Unexpected response to a public key delivery")),
        }
    }

    async fn upload(&self, stream: &mut NetStream, identity: &Identity,
                    aes_key: &[u8; AES_KEY_SIZE]) -> NetResult<()>
    {
        let path = &self.config.file_path;
        let filename = path.file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| NetError::Config(format!(
                    "{} has no usable file name", path.display())))?;
        let filename = sanitize::clean_filename(filename)
            .map_err(|err| NetError::Config(format!("Bad file name: {err}")))?;

        let metadata = tokio::fs::metadata(path).await.map_err(|err| {
            NetError::Config(format!("Cannot read {}: {err}", path.display()))
        })?;
        if !metadata.is_file() {
            return Err(NetError::Config(format!(
                    "{} is not a regular file", path.display())));
        }
        let orig_size = u32::try_from(metadata.len()).map_err(|_| {
            NetError::Config(format!(
                    "{} is too large for the 32-bit size field", path.display()))
        })?;

        let cipher_total = crypt::encrypted_size(u64::from(orig_size));
        // Chunk numbering is 16-bit; widen the chunks for files the
        // configured size could not cover in 65535 packets.
        let min_chunk = cipher_total.div_ceil(u64::from(u16::MAX));
        let chunk_size = usize::try_from(min_chunk).map_or(
                self.config.chunk_size,
                |min_chunk| self.config.chunk_size.max(min_chunk));
        let total_packets = cipher_total.div_ceil(chunk_size as u64);
        let total_packets = u16::try_from(total_packets).map_err(|_| {
            NetError::Config(format!(
                    "{} needs more chunks than the protocol can number",
                    path.display()))
        })?;

        for attempt in 0..=MAX_UPLOAD_RETRIES {
            let local_crc = self.send_file(stream, identity, aes_key, &filename,
                                           orig_size, cipher_total, chunk_size,
                                           total_packets).await?;
            let remote_crc = match read_response(stream).await? {
                SrvToCli::FileReceived { filename: echoed, crc, .. } => {
                    if echoed != filename {
                        return Err(proto_error!(
                                "Server acknowledged the wrong file '{echoed}'"));
                    }
                    crc
                }
                _ => return Err(proto_error!("Unexpected response to a file upload")),
            };
            self.emit(TransferEvent::ServerCrc { local: local_crc, remote: remote_crc });

            if remote_crc == local_crc {
                send_request(stream, identity.client_id, CliToSrv::CrcValid {
                    filename: filename.clone(),
                }).await?;
                expect_confirmed(stream).await?;
                info!("Upload of '{filename}' verified (crc {local_crc:#010x})");
                self.emit(TransferEvent::Verified { crc: local_crc });
                return Ok(());
            }

            if attempt == MAX_UPLOAD_RETRIES {
                send_request(stream, identity.client_id, CliToSrv::CrcInvalidAbort {
                    filename: filename.clone(),
                }).await?;
                expect_confirmed(stream).await?;
                warn!("Giving up on '{filename}': the server checksum never matched");
                self.emit(TransferEvent::Aborted);
                return Err(NetError::CrcMismatch(attempt + 1));
            }

            warn!("Server checksum {remote_crc:#010x} does not match local \
                   {local_crc:#010x}; re-uploading");
            self.emit(TransferEvent::Retrying { attempt: attempt + 1 });
            send_request(stream, identity.client_id, CliToSrv::CrcInvalidRetry {
                filename: filename.clone(),
            }).await?;
        }
        unreachable!("The retry loop always returns");
    }

    /// Streams one complete encrypted pass over the file and returns
    /// the plaintext checksum.  Only one chunk of plaintext and its
    /// ciphertext are in memory at any point.
    async fn send_file(&self, stream: &mut NetStream, identity: &Identity,
                       aes_key: &[u8; AES_KEY_SIZE], filename: &str,
                       orig_size: u32, cipher_total: u64, chunk_size: usize,
                       total_packets: u16)
        -> NetResult<u32>
    {
        let mut file = tokio::fs::File::open(&self.config.file_path).await?;
        let mut crc = Crc32Stream::new();
        let mut encryptor = Some(CbcEncryptStream::new(aes_key));
        let mut pending: Vec<u8> = Vec::new();
        let mut read_buf = vec![0; chunk_size];
        let mut sent_bytes = 0_u64;

        for packet_num in 1..=total_packets {
            let chunk_len = if packet_num < total_packets {
                chunk_size
            } else {
                usize::try_from(cipher_total - sent_bytes)
                    .expect("Final chunk fits in memory")
            };

            while pending.len() < chunk_len {
                let count = file.read(&mut read_buf).await?;
                if count == 0 {
                    let Some(enc) = encryptor.take() else {
                        return Err(NetError::Io(std::io::Error::other(
                                "File shrank while it was being uploaded")));
                    };
                    pending.extend(enc.finalize()?);
                } else {
                    crc.update(&read_buf[..count]);
                    let Some(enc) = encryptor.as_mut() else {
                        return Err(NetError::Io(std::io::Error::other(
                                "File grew while it was being uploaded")));
                    };
                    pending.extend(enc.update(&read_buf[..count]));
                }
            }

            let content: Vec<u8> = pending.drain(..chunk_len).collect();
            sent_bytes += content.len() as u64;
            send_request(stream, identity.client_id, CliToSrv::SendFile {
                content_size: u32::try_from(chunk_len)
                    .map_err(|_| proto_error!("Chunk too large for its wire field"))?,
                orig_size,
                packet_num,
                total_packets,
                filename: filename.to_string(),
                content,
            }).await?;
            self.emit(TransferEvent::Progress {
                sent_packets: packet_num,
                total_packets,
            });
        }

        if !pending.is_empty() || crc.len() != u64::from(orig_size) {
            return Err(NetError::Io(std::io::Error::other(
                    "File changed size while it was being uploaded")));
        }
        Ok(crc.finalize())
    }
}

async fn send_request(stream: &mut NetStream, client_id: Uuid, body: CliToSrv)
    -> NetResult<()>
{
    let mut buffer = Cursor::new(Vec::new());
    let request = Request { client_id, body };
    request.stream_write(&mut buffer)?;
    stream.get_mut().write_all(buffer.get_ref()).await?;
    Ok(())
}

async fn read_response(stream: &mut NetStream) -> NetResult<SrvToCli> {
    match SrvToCli::read(stream, DEFAULT_MAX_PAYLOAD).await? {
        SrvToCli::GeneralError => {
            Err(proto_error!("Server reported a protocol error"))
        }
        response => Ok(response),
    }
}

async fn expect_confirmed(stream: &mut NetStream) -> NetResult<()> {
    match read_response(stream).await? {
        SrvToCli::MessageConfirmed { .. } => Ok(()),
        _ => Err(proto_error!("Expected a confirmation from the server")),
    }
}
