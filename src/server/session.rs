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

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checksum::Crc32Stream;
use crate::crypt::{self, CbcDecryptStream, AES_KEY_SIZE};
use crate::error::NetResult;
use crate::proto_error;
use crate::protocol::messages::{CliToSrv, Request, SrvToCli};
use crate::protocol::MAX_UPLOAD_RETRIES;
use crate::sanitize;
use super::ServerContext;

enum SessionFlow {
    Continue,
    Close,
}

/// One upload mid-stream: decryption, checksumming, and the partial
/// file all advance a chunk at a time, so even multi-GB transfers hold
/// only one chunk in memory.
struct UploadState {
    wire_filename: String,
    filename: String,
    orig_size: u32,
    total_packets: u16,
    next_packet: u16,
    cipher_bytes: u64,
    plain_bytes: u64,
    decryptor: CbcDecryptStream,
    crc: Crc32Stream,
    out: tokio::fs::File,
}

/// A completed upload waiting for the client's checksum verdict.
struct PendingVerify {
    wire_filename: String,
    filename: String,
}

pub(super) struct Session {
    stream: BufReader<TcpStream>,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
    client_id: Option<Uuid>,
    aes_key: Option<[u8; AES_KEY_SIZE]>,
    upload: Option<UploadState>,
    pending: Option<PendingVerify>,
    retries: u32,
}

impl Session {
    pub(super) fn new(sock: TcpStream, peer: SocketAddr, ctx: Arc<ServerContext>) -> Self {
        Self {
            stream: BufReader::new(sock),
            peer,
            ctx,
            client_id: None,
            aes_key: None,
            upload: None,
            pending: None,
            retries: 0,
        }
    }

    pub(super) async fn run(mut self) {
        loop {
            let request = match Request::read(&mut self.stream,
                                              self.ctx.config.max_payload).await {
                Ok(request) => request,
                Err(err) if err.is_disconnect() => {
                    debug!("Client {} disconnected", self.peer);
                    break;
                }
                Err(err) => {
                    warn!("Bad frame from {}: {err}", self.peer);
                    let _ = self.send(&SrvToCli::GeneralError).await;
                    break;
                }
            };

            match self.handle(request).await {
                Ok(SessionFlow::Continue) => (),
                Ok(SessionFlow::Close) => break,
                Err(err) => {
                    warn!("Session error for {}: {err}", self.peer);
                    let _ = self.send(&SrvToCli::GeneralError).await;
                    break;
                }
            }
        }

        // Whatever was in flight dies with the socket; verified uploads
        // are already on their final names and stay put.
        self.abandon_upload().await;
    }

    async fn handle(&mut self, request: Request) -> NetResult<SessionFlow> {
        match request.body {
            CliToSrv::Register { name } => {
                self.handle_register(&name).await
            }
            CliToSrv::SendPublicKey { name, public_key } => {
                self.handle_public_key(request.client_id, &name, public_key.as_slice()).await
            }
            CliToSrv::Reconnect { name } => {
                self.handle_reconnect(request.client_id, &name).await
            }
            CliToSrv::SendFile {
                content_size: _, orig_size, packet_num, total_packets,
                filename, content,
            } => {
                self.handle_send_file(request.client_id, orig_size, packet_num,
                                      total_packets, filename, &content).await
            }
            CliToSrv::CrcValid { filename } => {
                self.handle_crc_valid(request.client_id, &filename).await
            }
            CliToSrv::CrcInvalidRetry { filename } => {
                self.handle_crc_retry(request.client_id, &filename).await
            }
            CliToSrv::CrcInvalidAbort { filename } => {
                self.handle_crc_abort(request.client_id, &filename).await
            }
        }
    }

    async fn handle_register(&mut self, name: &str) -> NetResult<SessionFlow> {
        if self.upload.is_some() || self.pending.is_some() {
            return Err(proto_error!("Register request in the middle of an upload"));
        }
        let name = sanitize::clean_display_name(name)?;

        match self.ctx.registry.register_client(&name).await {
            Ok(client_id) => {
                info!("Registered client '{name}' from {}: {client_id}", self.peer);
                self.client_id = Some(client_id);
                self.aes_key = None;
                self.send(&SrvToCli::RegisterOk { client_id }).await?;
                Ok(SessionFlow::Continue)
            }
            Err(crate::error::NetError::NameTaken) => {
                info!("Refused duplicate registration of '{name}' from {}", self.peer);
                self.send(&SrvToCli::RegisterFailed).await?;
                Ok(SessionFlow::Close)
            }
            Err(err) => Err(err),
        }
    }

    async fn handle_public_key(&mut self, header_id: Uuid, name: &str, public_key: &[u8])
        -> NetResult<SessionFlow>
    {
        let client_id = match self.client_id {
            Some(client_id) => client_id,
            // A client may deliver its key on a connection other than
            // the one it registered on
            None => header_id,
        };
        if header_id != client_id {
            return Err(proto_error!("Public key delivery for a different client id"));
        }

        let Some(record) = self.ctx.registry.lookup_by_id(&client_id).await? else {
            return Err(proto_error!("Public key delivery for unknown client {client_id}"));
        };
        let name = sanitize::clean_display_name(name)?;
        if record.name != name {
            return Err(proto_error!(
                "Public key delivery names '{name}' but client {client_id} is '{}'",
                record.name));
        }

        // The key must parse before anything is persisted
        let rsa_key = crypt::decode_public_key(public_key)?;
        let aes_key = self.ctx.registry
            .set_public_key_and_generate_aes(&client_id, public_key).await?;
        let wrapped_key = crypt::wrap_session_key(&rsa_key, &aes_key)?;

        debug!("Issued session key to client {client_id}");
        self.client_id = Some(client_id);
        self.aes_key = Some(aes_key);
        self.send(&SrvToCli::PublicKeyReceived {
            client_id,
            wrapped_key: Box::new(wrapped_key),
        }).await?;
        Ok(SessionFlow::Continue)
    }

    async fn handle_reconnect(&mut self, header_id: Uuid, name: &str)
        -> NetResult<SessionFlow>
    {
        if self.upload.is_some() || self.pending.is_some() {
            return Err(proto_error!("Reconnect request in the middle of an upload"));
        }
        let name = sanitize::clean_display_name(name)?;

        let Some(record) = self.ctx.registry.lookup_by_name(&name).await? else {
            info!("Denied reconnect for unknown client '{name}' from {}", self.peer);
            self.send(&SrvToCli::ReconnectDenied { client_id: header_id }).await?;
            return Ok(SessionFlow::Continue);
        };

        if !header_id.is_nil() && header_id != record.client_id {
            warn!("Client '{name}' reconnected with a stale id {header_id}");
            self.send(&SrvToCli::ReconnectDenied { client_id: record.client_id }).await?;
            return Ok(SessionFlow::Continue);
        }

        // Corrupt or missing key material means the client has to start
        // over with a fresh registration handshake.
        let rsa_key = if record.has_key_material() {
            match crypt::decode_public_key(record.public_key.as_deref().unwrap_or_default()) {
                Ok(key) => Some(key),
                Err(err) => {
                    warn!("Stored public key for '{name}' is unusable: {err}");
                    None
                }
            }
        } else {
            None
        };
        let Some(rsa_key) = rsa_key else {
            self.send(&SrvToCli::ReconnectDenied { client_id: record.client_id }).await?;
            return Ok(SessionFlow::Continue);
        };

        // Always a fresh session key, never the stored one
        let aes_key = self.ctx.registry.refresh_aes_key(&record.client_id).await?;
        let wrapped_key = crypt::wrap_session_key(&rsa_key, &aes_key)?;

        info!("Client '{name}' ({}) reconnected from {}", record.client_id, self.peer);
        self.client_id = Some(record.client_id);
        self.aes_key = Some(aes_key);
        self.send(&SrvToCli::ReconnectAllowed {
            client_id: record.client_id,
            wrapped_key: Box::new(wrapped_key),
        }).await?;
        Ok(SessionFlow::Continue)
    }

    async fn handle_send_file(&mut self, header_id: Uuid, orig_size: u32,
                              packet_num: u16, total_packets: u16,
                              wire_filename: String, content: &[u8])
        -> NetResult<SessionFlow>
    {
        let client_id = self.expect_keyed_client(header_id)?;
        if self.pending.is_some() {
            return Err(proto_error!("New chunk while a checksum verdict is outstanding"));
        }
        if total_packets == 0 {
            return Err(proto_error!("SendFile declares zero packets"));
        }

        if let Some(upload) = &self.upload {
            if packet_num == 1 && wire_filename != upload.wire_filename {
                // The client moved on to a different file; drop the
                // partial one and let the new upload take over.
                warn!("Client {client_id} abandoned upload of '{}' for '{}'",
                      upload.filename, wire_filename);
                self.abandon_upload().await;
            } else {
                if wire_filename != upload.wire_filename {
                    return Err(proto_error!(
                        "Chunk for '{wire_filename}' inside upload of '{}'",
                        upload.wire_filename));
                }
                if packet_num != upload.next_packet {
                    return Err(proto_error!(
                        "Out-of-order chunk {packet_num} (expected {})",
                        upload.next_packet));
                }
                if total_packets != upload.total_packets
                        || orig_size != upload.orig_size {
                    return Err(proto_error!("Upload metadata changed mid-stream"));
                }
            }
        }

        if self.upload.is_none() {
            if packet_num != 1 {
                return Err(proto_error!("Upload began at chunk {packet_num}"));
            }
            let filename = sanitize::clean_filename(&wire_filename)?;
            let aes_key = self.aes_key.as_ref()
                .ok_or_else(|| proto_error!("No session key established"))?;

            let path = self.ctx.store.final_path(&client_id, &filename);
            self.ctx.registry.record_file(&client_id, &filename,
                                          &path.to_string_lossy(),
                                          i64::from(orig_size), 0).await?;
            let out = self.ctx.store.create_partial(&client_id, &filename).await?;

            debug!("Client {client_id} started upload of '{filename}' \
                    ({orig_size} bytes, {total_packets} chunks)");
            self.upload = Some(UploadState {
                wire_filename,
                filename,
                orig_size,
                total_packets,
                next_packet: 1,
                cipher_bytes: 0,
                plain_bytes: 0,
                decryptor: CbcDecryptStream::new(aes_key),
                crc: Crc32Stream::new(),
                out,
            });
        }

        let upload = self.upload.as_mut().expect("Upload state exists");
        upload.cipher_bytes += content.len() as u64;
        upload.next_packet = packet_num.wrapping_add(1);
        let plaintext = upload.decryptor.update(content);
        upload.crc.update(&plaintext);
        upload.out.write_all(&plaintext).await?;
        upload.plain_bytes += plaintext.len() as u64;

        if packet_num == total_packets {
            self.finish_upload(client_id).await?;
        }
        Ok(SessionFlow::Continue)
    }

    async fn finish_upload(&mut self, client_id: Uuid) -> NetResult<()> {
        let UploadState {
            wire_filename, filename, orig_size, cipher_bytes,
            mut plain_bytes, decryptor, mut crc, mut out, ..
        } = self.upload.take().expect("Upload state exists");

        let tail = decryptor.finalize()?;
        crc.update(&tail);
        out.write_all(&tail).await?;
        plain_bytes += tail.len() as u64;
        out.flush().await?;
        out.sync_all().await?;
        drop(out);

        if plain_bytes != u64::from(orig_size) {
            self.ctx.store.discard_partial(&client_id, &filename).await;
            let _ = self.ctx.registry.drop_file(&client_id, &filename).await;
            return Err(proto_error!(
                "Decrypted size {plain_bytes} does not match declared size {orig_size}"));
        }

        let crc = crc.finalize();
        let path = self.ctx.store.final_path(&client_id, &filename);
        self.ctx.registry.record_file(&client_id, &filename,
                                      &path.to_string_lossy(),
                                      i64::from(orig_size), crc).await?;

        debug!("Client {client_id} finished upload of '{filename}' \
                ({plain_bytes} bytes, crc {crc:#010x})");
        let content_size = u32::try_from(cipher_bytes)
            .map_err(|_| proto_error!("Ciphertext size overflows its wire field"))?;
        self.pending = Some(PendingVerify { wire_filename: wire_filename.clone(), filename });
        self.send(&SrvToCli::FileReceived {
            client_id,
            content_size,
            filename: wire_filename,
            crc,
        }).await?;
        Ok(())
    }

    async fn handle_crc_valid(&mut self, header_id: Uuid, filename: &str)
        -> NetResult<SessionFlow>
    {
        let client_id = self.expect_keyed_client(header_id)?;
        let pending = self.take_pending(filename)?;

        self.ctx.store.commit(&client_id, &pending.filename).await?;
        self.ctx.registry.mark_file_verified(&client_id, &pending.filename).await?;
        self.ctx.registry.touch_last_seen(&client_id).await?;
        self.retries = 0;

        info!("Client {client_id} verified upload of '{}'", pending.filename);
        self.send(&SrvToCli::MessageConfirmed { client_id }).await?;
        Ok(SessionFlow::Continue)
    }

    async fn handle_crc_retry(&mut self, header_id: Uuid, filename: &str)
        -> NetResult<SessionFlow>
    {
        let client_id = self.expect_keyed_client(header_id)?;
        if self.retries >= MAX_UPLOAD_RETRIES {
            return Err(proto_error!("Checksum retry budget exhausted"));
        }
        let pending = self.take_pending(filename)?;

        self.retries += 1;
        self.ctx.store.discard_partial(&client_id, &pending.filename).await;

        // No response; the client re-uploads from the first chunk
        info!("Client {client_id} reported a checksum mismatch for '{}' \
               (attempt {} of {MAX_UPLOAD_RETRIES})",
              pending.filename, self.retries);
        Ok(SessionFlow::Continue)
    }

    async fn handle_crc_abort(&mut self, header_id: Uuid, filename: &str)
        -> NetResult<SessionFlow>
    {
        let client_id = self.expect_keyed_client(header_id)?;
        let pending = self.take_pending(filename)?;

        self.ctx.store.discard_partial(&client_id, &pending.filename).await;
        self.ctx.registry.drop_file(&client_id, &pending.filename).await?;

        warn!("Client {client_id} gave up on '{}' after repeated checksum \
               mismatches", pending.filename);
        self.send(&SrvToCli::MessageConfirmed { client_id }).await?;
        Ok(SessionFlow::Continue)
    }

    fn expect_keyed_client(&self, header_id: Uuid) -> NetResult<Uuid> {
        let Some(client_id) = self.client_id else {
            return Err(proto_error!("Request before any registration or reconnect"));
        };
        if header_id != client_id {
            return Err(proto_error!(
                "Request for client {header_id} on a session owned by {client_id}"));
        }
        if self.aes_key.is_none() {
            return Err(proto_error!("Request before the key exchange completed"));
        }
        Ok(client_id)
    }

    fn take_pending(&mut self, filename: &str) -> NetResult<PendingVerify> {
        let Some(pending) = self.pending.take() else {
            return Err(proto_error!("Checksum verdict with no finished upload"));
        };
        if pending.wire_filename != filename {
            self.pending = Some(pending);
            return Err(proto_error!("Checksum verdict for the wrong file '{filename}'"));
        }
        Ok(pending)
    }

    async fn abandon_upload(&mut self) {
        if let Some(upload) = self.upload.take() {
            drop(upload.out);
            if let Some(client_id) = self.client_id {
                self.ctx.store.discard_partial(&client_id, &upload.filename).await;
                let _ = self.ctx.registry.drop_file(&client_id, &upload.filename).await;
            }
        }
        if let Some(pending) = self.pending.take() {
            if let Some(client_id) = self.client_id {
                self.ctx.store.discard_partial(&client_id, &pending.filename).await;
                let _ = self.ctx.registry.drop_file(&client_id, &pending.filename).await;
            }
        }
    }

    async fn send(&mut self, reply: &SrvToCli) -> NetResult<()> {
        let mut buffer = Cursor::new(Vec::new());
        reply.stream_write(&mut buffer)?;
        self.stream.get_mut().write_all(buffer.get_ref()).await?;
        Ok(())
    }
}
