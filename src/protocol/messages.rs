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

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::crypt::{PUBLIC_KEY_SIZE, WRAPPED_KEY_SIZE};
use crate::error::NetResult;
use crate::proto_error;
use super::net_io;
use super::{
    RequestCode, RequestHeader, ResponseCode, ResponseHeader,
    MAX_CHUNK_SIZE, SEND_FILE_METADATA_SIZE, STRING_FIELD_SIZE,
};

const STRING_PAYLOAD_SIZE: u32 = STRING_FIELD_SIZE as u32;
const PUBKEY_PAYLOAD_SIZE: u32 = STRING_PAYLOAD_SIZE + PUBLIC_KEY_SIZE as u32;
const ID_PAYLOAD_SIZE: u32 = 16;
const KEYED_PAYLOAD_SIZE: u32 = ID_PAYLOAD_SIZE + WRAPPED_KEY_SIZE as u32;
const FILE_RECEIVED_PAYLOAD_SIZE: u32 = ID_PAYLOAD_SIZE + 4 + STRING_PAYLOAD_SIZE + 4;

/// One framed client request: the opaque 16-byte client id from the
/// header plus the decoded body.
pub struct Request {
    pub client_id: Uuid,
    pub body: CliToSrv,
}

pub enum CliToSrv {
    Register {
        name: String,
    },
    SendPublicKey {
        name: String,
        public_key: Box<[u8; PUBLIC_KEY_SIZE]>,
    },
    Reconnect {
        name: String,
    },
    SendFile {
        content_size: u32,
        orig_size: u32,
        packet_num: u16,
        total_packets: u16,
        filename: String,
        content: Vec<u8>,
    },
    CrcValid { filename: String },
    CrcInvalidRetry { filename: String },
    CrcInvalidAbort { filename: String },
}

pub enum SrvToCli {
    RegisterOk { client_id: Uuid },
    RegisterFailed,
    PublicKeyReceived {
        client_id: Uuid,
        wrapped_key: Box<[u8; WRAPPED_KEY_SIZE]>,
    },
    FileReceived {
        client_id: Uuid,
        content_size: u32,
        filename: String,
        crc: u32,
    },
    MessageConfirmed { client_id: Uuid },
    ReconnectAllowed {
        client_id: Uuid,
        wrapped_key: Box<[u8; WRAPPED_KEY_SIZE]>,
    },
    ReconnectDenied { client_id: Uuid },
    GeneralError,
}

// Payload sizes are pinned per code before the payload is read, so a
// hostile peer cannot make the session allocate more than one chunk.
fn check_payload_size(code: RequestCode, payload_size: u32) -> NetResult<()> {
    let valid = match code {
        RequestCode::Register
            | RequestCode::Reconnect
            | RequestCode::CrcValid
            | RequestCode::CrcInvalidRetry
            | RequestCode::CrcInvalidAbort => payload_size == STRING_PAYLOAD_SIZE,
        RequestCode::SendPublicKey => payload_size == PUBKEY_PAYLOAD_SIZE,
        RequestCode::SendFile => {
            payload_size >= SEND_FILE_METADATA_SIZE
                && payload_size <= SEND_FILE_METADATA_SIZE + MAX_CHUNK_SIZE
        }
    };
    if valid {
        Ok(())
    } else {
        Err(proto_error!("Bad payload size {} for request code {:?}",
                         payload_size, code))
    }
}

impl Request {
    pub async fn read<S>(stream: &mut S, max_payload: u32) -> NetResult<Self>
        where S: AsyncRead + Unpin
    {
        let header = RequestHeader::read(stream, max_payload).await?;
        check_payload_size(header.code, header.payload_size)?;
        let payload = net_io::read_payload(stream, header.payload_size, max_payload).await?;
        let mut cursor = Cursor::new(payload.as_slice());

        let body = match header.code {
            RequestCode::Register => CliToSrv::Register {
                name: net_io::read_string_field(&mut cursor)?,
            },
            RequestCode::SendPublicKey => {
                let name = net_io::read_string_field(&mut cursor)?;
                let mut public_key = Box::new([0; PUBLIC_KEY_SIZE]);
                cursor.read_exact(public_key.as_mut_slice())?;
                CliToSrv::SendPublicKey { name, public_key }
            }
            RequestCode::Reconnect => CliToSrv::Reconnect {
                name: net_io::read_string_field(&mut cursor)?,
            },
            RequestCode::SendFile => {
                let content_size = cursor.read_u32::<LittleEndian>()?;
                if content_size != header.payload_size - SEND_FILE_METADATA_SIZE {
                    return Err(proto_error!(
                        "SendFile content size {} does not match payload size {}",
                        content_size, header.payload_size));
                }
                let orig_size = cursor.read_u32::<LittleEndian>()?;
                let packet_num = cursor.read_u16::<LittleEndian>()?;
                let total_packets = cursor.read_u16::<LittleEndian>()?;
                let filename = net_io::read_string_field(&mut cursor)?;
                let mut content = vec![0; content_size as usize];
                cursor.read_exact(&mut content)?;
                CliToSrv::SendFile {
                    content_size, orig_size, packet_num, total_packets,
                    filename, content,
                }
            }
            RequestCode::CrcValid => CliToSrv::CrcValid {
                filename: net_io::read_string_field(&mut cursor)?,
            },
            RequestCode::CrcInvalidRetry => CliToSrv::CrcInvalidRetry {
                filename: net_io::read_string_field(&mut cursor)?,
            },
            RequestCode::CrcInvalidAbort => CliToSrv::CrcInvalidAbort {
                filename: net_io::read_string_field(&mut cursor)?,
            },
        };

        debug_assert_eq!(cursor.position(), u64::from(header.payload_size));
        Ok(Self { client_id: header.client_id, body })
    }

    pub fn stream_write<W>(&self, stream: &mut W) -> NetResult<()>
        where W: Write
    {
        let mut payload = Cursor::new(Vec::new());
        let code = match &self.body {
            CliToSrv::Register { name } => {
                net_io::write_string_field(&mut payload, name)?;
                RequestCode::Register
            }
            CliToSrv::SendPublicKey { name, public_key } => {
                net_io::write_string_field(&mut payload, name)?;
                payload.write_all(public_key.as_slice())?;
                RequestCode::SendPublicKey
            }
            CliToSrv::Reconnect { name } => {
                net_io::write_string_field(&mut payload, name)?;
                RequestCode::Reconnect
            }
            CliToSrv::SendFile {
                content_size, orig_size, packet_num, total_packets,
                filename, content,
            } => {
                if *content_size as usize != content.len() {
                    return Err(proto_error!(
                        "SendFile content size {} does not match chunk length {}",
                        content_size, content.len()));
                }
                payload.write_u32::<LittleEndian>(*content_size)?;
                payload.write_u32::<LittleEndian>(*orig_size)?;
                payload.write_u16::<LittleEndian>(*packet_num)?;
                payload.write_u16::<LittleEndian>(*total_packets)?;
                net_io::write_string_field(&mut payload, filename)?;
                payload.write_all(content)?;
                RequestCode::SendFile
            }
            CliToSrv::CrcValid { filename } => {
                net_io::write_string_field(&mut payload, filename)?;
                RequestCode::CrcValid
            }
            CliToSrv::CrcInvalidRetry { filename } => {
                net_io::write_string_field(&mut payload, filename)?;
                RequestCode::CrcInvalidRetry
            }
            CliToSrv::CrcInvalidAbort { filename } => {
                net_io::write_string_field(&mut payload, filename)?;
                RequestCode::CrcInvalidAbort
            }
        };

        let header = RequestHeader {
            client_id: self.client_id,
            code,
            payload_size: u32::try_from(payload.get_ref().len())
                .map_err(|_| proto_error!("Request payload too large"))?,
        };
        header.stream_write(stream)?;
        stream.write_all(payload.get_ref())?;
        Ok(())
    }
}

impl SrvToCli {
    pub async fn read<S>(stream: &mut S, max_payload: u32) -> NetResult<Self>
        where S: AsyncRead + Unpin
    {
        let header = ResponseHeader::read(stream, max_payload).await?;
        let expected = match header.code {
            ResponseCode::RegisterFailed | ResponseCode::GeneralError => 0,
            ResponseCode::RegisterOk
                | ResponseCode::MessageConfirmed
                | ResponseCode::ReconnectDenied => ID_PAYLOAD_SIZE,
            ResponseCode::PublicKeyReceived
                | ResponseCode::ReconnectAllowed => KEYED_PAYLOAD_SIZE,
            ResponseCode::FileReceived => FILE_RECEIVED_PAYLOAD_SIZE,
        };
        if header.payload_size != expected {
            return Err(proto_error!("Bad payload size {} for response code {:?}",
                                    header.payload_size, header.code));
        }

        let payload = net_io::read_payload(stream, header.payload_size, max_payload).await?;
        let mut cursor = Cursor::new(payload.as_slice());

        let message = match header.code {
            ResponseCode::RegisterOk => SrvToCli::RegisterOk {
                client_id: net_io::read_client_id(&mut cursor)?,
            },
            ResponseCode::RegisterFailed => SrvToCli::RegisterFailed,
            ResponseCode::PublicKeyReceived => {
                let client_id = net_io::read_client_id(&mut cursor)?;
                let mut wrapped_key = Box::new([0; WRAPPED_KEY_SIZE]);
                cursor.read_exact(wrapped_key.as_mut_slice())?;
                SrvToCli::PublicKeyReceived { client_id, wrapped_key }
            }
            ResponseCode::FileReceived => {
                let client_id = net_io::read_client_id(&mut cursor)?;
                let content_size = cursor.read_u32::<LittleEndian>()?;
                let filename = net_io::read_string_field(&mut cursor)?;
                let crc = cursor.read_u32::<LittleEndian>()?;
                SrvToCli::FileReceived { client_id, content_size, filename, crc }
            }
            ResponseCode::MessageConfirmed => SrvToCli::MessageConfirmed {
                client_id: net_io::read_client_id(&mut cursor)?,
            },
            ResponseCode::ReconnectAllowed => {
                let client_id = net_io::read_client_id(&mut cursor)?;
                let mut wrapped_key = Box::new([0; WRAPPED_KEY_SIZE]);
                cursor.read_exact(wrapped_key.as_mut_slice())?;
                SrvToCli::ReconnectAllowed { client_id, wrapped_key }
            }
            ResponseCode::ReconnectDenied => SrvToCli::ReconnectDenied {
                client_id: net_io::read_client_id(&mut cursor)?,
            },
            ResponseCode::GeneralError => SrvToCli::GeneralError,
        };

        Ok(message)
    }

    pub fn stream_write<W>(&self, stream: &mut W) -> NetResult<()>
        where W: Write
    {
        let mut payload = Cursor::new(Vec::new());
        let code = match self {
            SrvToCli::RegisterOk { client_id } => {
                net_io::write_client_id(&mut payload, client_id)?;
                ResponseCode::RegisterOk
            }
            SrvToCli::RegisterFailed => ResponseCode::RegisterFailed,
            SrvToCli::PublicKeyReceived { client_id, wrapped_key } => {
                net_io::write_client_id(&mut payload, client_id)?;
                payload.write_all(wrapped_key.as_slice())?;
                ResponseCode::PublicKeyReceived
            }
            SrvToCli::FileReceived { client_id, content_size, filename, crc } => {
                net_io::write_client_id(&mut payload, client_id)?;
                payload.write_u32::<LittleEndian>(*content_size)?;
                net_io::write_string_field(&mut payload, filename)?;
                payload.write_u32::<LittleEndian>(*crc)?;
                ResponseCode::FileReceived
            }
            SrvToCli::MessageConfirmed { client_id } => {
                net_io::write_client_id(&mut payload, client_id)?;
                ResponseCode::MessageConfirmed
            }
            SrvToCli::ReconnectAllowed { client_id, wrapped_key } => {
                net_io::write_client_id(&mut payload, client_id)?;
                payload.write_all(wrapped_key.as_slice())?;
                ResponseCode::ReconnectAllowed
            }
            SrvToCli::ReconnectDenied { client_id } => {
                net_io::write_client_id(&mut payload, client_id)?;
                ResponseCode::ReconnectDenied
            }
            SrvToCli::GeneralError => ResponseCode::GeneralError,
        };

        let header = ResponseHeader {
            code,
            payload_size: u32::try_from(payload.get_ref().len())
                .map_err(|_| proto_error!("Response payload too large"))?,
        };
        header.stream_write(stream)?;
        stream.write_all(payload.get_ref())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::{DEFAULT_MAX_PAYLOAD, REQUEST_HEADER_SIZE, RESPONSE_HEADER_SIZE};

    fn write_request(request: &Request) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        request.stream_write(&mut buffer).unwrap();
        buffer.into_inner()
    }

    fn write_response(response: &SrvToCli) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        response.stream_write(&mut buffer).unwrap();
        buffer.into_inner()
    }

    #[tokio::test]
    async fn test_register_round_trip() {
        let raw = write_request(&Request {
            client_id: Uuid::nil(),
            body: CliToSrv::Register { name: "alice".to_string() },
        });
        assert_eq!(raw.len(), REQUEST_HEADER_SIZE + STRING_FIELD_SIZE);

        let parsed = Request::read(&mut raw.as_slice(), DEFAULT_MAX_PAYLOAD)
            .await.unwrap();
        assert!(parsed.client_id.is_nil());
        let CliToSrv::Register { name } = parsed.body else {
            panic!("wrong body");
        };
        assert_eq!(name, "alice");
    }

    #[tokio::test]
    async fn test_send_public_key_round_trip() {
        let client_id = Uuid::new_v4();
        let mut key = [0_u8; PUBLIC_KEY_SIZE];
        for (i, b) in key.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        let raw = write_request(&Request {
            client_id,
            body: CliToSrv::SendPublicKey {
                name: "alice".to_string(),
                public_key: Box::new(key),
            },
        });
        assert_eq!(raw.len(),
                   REQUEST_HEADER_SIZE + STRING_FIELD_SIZE + PUBLIC_KEY_SIZE);

        let parsed = Request::read(&mut raw.as_slice(), DEFAULT_MAX_PAYLOAD)
            .await.unwrap();
        assert_eq!(parsed.client_id, client_id);
        let CliToSrv::SendPublicKey { name, public_key } = parsed.body else {
            panic!("wrong body");
        };
        assert_eq!(name, "alice");
        assert_eq!(*public_key, key);
    }

    #[tokio::test]
    async fn test_send_file_round_trip() {
        let content: Vec<u8> = (0_u32..4096).map(|i| (i % 256) as u8).collect();
        let raw = write_request(&Request {
            client_id: Uuid::new_v4(),
            body: CliToSrv::SendFile {
                content_size: 4096,
                orig_size: 4083,
                packet_num: 2,
                total_packets: 7,
                filename: "snapshot.tar".to_string(),
                content: content.clone(),
            },
        });
        assert_eq!(raw.len(),
                   REQUEST_HEADER_SIZE + SEND_FILE_METADATA_SIZE as usize + 4096);

        let parsed = Request::read(&mut raw.as_slice(), DEFAULT_MAX_PAYLOAD)
            .await.unwrap();
        let CliToSrv::SendFile {
            content_size, orig_size, packet_num, total_packets,
            filename, content: parsed_content,
        } = parsed.body else {
            panic!("wrong body");
        };
        assert_eq!(content_size, 4096);
        assert_eq!(orig_size, 4083);
        assert_eq!(packet_num, 2);
        assert_eq!(total_packets, 7);
        assert_eq!(filename, "snapshot.tar");
        assert_eq!(parsed_content, content);
    }

    #[tokio::test]
    async fn test_send_file_size_mismatch_rejected() {
        // A frame whose declared content size disagrees with the header
        // payload size must not parse.
        let mut raw = write_request(&Request {
            client_id: Uuid::new_v4(),
            body: CliToSrv::SendFile {
                content_size: 16,
                orig_size: 5,
                packet_num: 1,
                total_packets: 1,
                filename: "x".to_string(),
                content: vec![0; 16],
            },
        });
        // Corrupt the content_size field (first 4 payload bytes)
        raw[REQUEST_HEADER_SIZE] = 99;

        assert!(Request::read(&mut raw.as_slice(), DEFAULT_MAX_PAYLOAD)
            .await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_chunk_rejected() {
        let mut raw = Vec::new();
        RequestHeader {
            client_id: Uuid::nil(),
            code: RequestCode::SendFile,
            payload_size: SEND_FILE_METADATA_SIZE + MAX_CHUNK_SIZE + 1,
        }.stream_write(&mut raw).unwrap();

        assert!(Request::read(&mut raw.as_slice(), DEFAULT_MAX_PAYLOAD)
            .await.is_err());
    }

    #[tokio::test]
    async fn test_crc_ack_round_trip() {
        for (body, code) in [
            (CliToSrv::CrcValid { filename: "a.bin".to_string() }, RequestCode::CrcValid),
            (CliToSrv::CrcInvalidRetry { filename: "a.bin".to_string() },
             RequestCode::CrcInvalidRetry),
            (CliToSrv::CrcInvalidAbort { filename: "a.bin".to_string() },
             RequestCode::CrcInvalidAbort),
        ] {
            let raw = write_request(&Request { client_id: Uuid::new_v4(), body });
            let header = RequestHeader::read(&mut raw.as_slice(), DEFAULT_MAX_PAYLOAD)
                .await.unwrap();
            assert_eq!(header.code, code);
            assert!(Request::read(&mut raw.as_slice(), DEFAULT_MAX_PAYLOAD)
                .await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_response_round_trips() {
        let client_id = Uuid::new_v4();
        let wrapped = Box::new([0x5a_u8; WRAPPED_KEY_SIZE]);

        let raw = write_response(&SrvToCli::RegisterOk { client_id });
        assert_eq!(raw.len(), RESPONSE_HEADER_SIZE + 16);
        let SrvToCli::RegisterOk { client_id: parsed } =
            SrvToCli::read(&mut raw.as_slice(), DEFAULT_MAX_PAYLOAD).await.unwrap() else {
            panic!("wrong response");
        };
        assert_eq!(parsed, client_id);

        let raw = write_response(&SrvToCli::ReconnectAllowed {
            client_id, wrapped_key: wrapped.clone(),
        });
        assert_eq!(raw.len(), RESPONSE_HEADER_SIZE + 16 + WRAPPED_KEY_SIZE);
        let SrvToCli::ReconnectAllowed { wrapped_key, .. } =
            SrvToCli::read(&mut raw.as_slice(), DEFAULT_MAX_PAYLOAD).await.unwrap() else {
            panic!("wrong response");
        };
        assert_eq!(wrapped_key, wrapped);

        let raw = write_response(&SrvToCli::FileReceived {
            client_id,
            content_size: 4112,
            filename: "snapshot.tar".to_string(),
            crc: 0xdead_beef,
        });
        assert_eq!(raw.len(), RESPONSE_HEADER_SIZE + 279);
        let SrvToCli::FileReceived { content_size, filename, crc, .. } =
            SrvToCli::read(&mut raw.as_slice(), DEFAULT_MAX_PAYLOAD).await.unwrap() else {
            panic!("wrong response");
        };
        assert_eq!(content_size, 4112);
        assert_eq!(filename, "snapshot.tar");
        assert_eq!(crc, 0xdead_beef);

        let raw = write_response(&SrvToCli::GeneralError);
        assert_eq!(raw.len(), RESPONSE_HEADER_SIZE);
        assert!(matches!(
            SrvToCli::read(&mut raw.as_slice(), DEFAULT_MAX_PAYLOAD).await.unwrap(),
            SrvToCli::GeneralError));
    }
}
