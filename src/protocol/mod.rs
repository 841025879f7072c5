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

pub mod messages;
pub mod net_io;

use std::io::{Cursor, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::error::NetResult;
use crate::proto_error;

pub const PROTOCOL_VERSION: u8 = 3;

pub const REQUEST_HEADER_SIZE: usize = 23;
pub const RESPONSE_HEADER_SIZE: usize = 7;
pub const STRING_FIELD_SIZE: usize = 255;

// content_size[4] + orig_size[4] + packet_num[2] + total_packets[2]
// + filename[255]
pub const SEND_FILE_METADATA_SIZE: u32 = 267;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const MAX_CHUNK_SIZE: u32 = 4 * 1024 * 1024;
pub const DEFAULT_MAX_PAYLOAD: u32 = 0x8000_0000;
pub const MAX_UPLOAD_RETRIES: u32 = 3;

#[repr(u16)]
#[derive(FromPrimitive, Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestCode {
    Register = 1025,
    SendPublicKey = 1026,
    Reconnect = 1027,
    SendFile = 1028,
    CrcValid = 900,
    CrcInvalidRetry = 901,
    CrcInvalidAbort = 902,
}

#[repr(u16)]
#[derive(FromPrimitive, Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResponseCode {
    RegisterOk = 2100,
    RegisterFailed = 2101,
    PublicKeyReceived = 2102,
    FileReceived = 2103,
    MessageConfirmed = 2104,
    ReconnectAllowed = 2105,
    ReconnectDenied = 2106,
    GeneralError = 2107,
}

/// Fixed 23-byte header on every client request.  All integers are
/// little-endian; the client id is opaque and passed through raw.
pub struct RequestHeader {
    pub client_id: Uuid,
    pub code: RequestCode,
    pub payload_size: u32,
}

impl RequestHeader {
    pub async fn read<S>(stream: &mut S, max_payload: u32) -> NetResult<Self>
        where S: AsyncRead + Unpin
    {
        let mut buffer = [0; REQUEST_HEADER_SIZE];
        net_io::read_exact_buf(stream, &mut buffer).await?;

        let mut cursor = Cursor::new(buffer);
        let client_id = net_io::read_client_id(&mut cursor)?;
        let version = cursor.read_u8()?;
        if version != PROTOCOL_VERSION {
            return Err(proto_error!("Unsupported protocol version {}", version));
        }
        let raw_code = cursor.read_u16::<LittleEndian>()?;
        let Some(code) = RequestCode::from_u16(raw_code) else {
            return Err(proto_error!("Bad request code {}", raw_code));
        };
        let payload_size = cursor.read_u32::<LittleEndian>()?;
        if payload_size > max_payload {
            return Err(crate::error::NetError::OversizedPayload {
                size: u64::from(payload_size),
                limit: u64::from(max_payload),
            });
        }

        Ok(Self { client_id, code, payload_size })
    }

    pub fn stream_write<W>(&self, stream: &mut W) -> NetResult<()>
        where W: Write
    {
        net_io::write_client_id(stream, &self.client_id)?;
        stream.write_u8(PROTOCOL_VERSION)?;
        stream.write_u16::<LittleEndian>(self.code as u16)?;
        stream.write_u32::<LittleEndian>(self.payload_size)?;
        Ok(())
    }
}

/// Fixed 7-byte header on every server response.
pub struct ResponseHeader {
    pub code: ResponseCode,
    pub payload_size: u32,
}

impl ResponseHeader {
    pub async fn read<S>(stream: &mut S, max_payload: u32) -> NetResult<Self>
        where S: AsyncRead + Unpin
    {
        let mut buffer = [0; RESPONSE_HEADER_SIZE];
        net_io::read_exact_buf(stream, &mut buffer).await?;

        let mut cursor = Cursor::new(buffer);
        let version = cursor.read_u8()?;
        if version != PROTOCOL_VERSION {
            return Err(proto_error!("Unsupported protocol version {}", version));
        }
        let raw_code = cursor.read_u16::<LittleEndian>()?;
        let Some(code) = ResponseCode::from_u16(raw_code) else {
            return Err(proto_error!("Bad response code {}", raw_code));
        };
        let payload_size = cursor.read_u32::<LittleEndian>()?;
        if payload_size > max_payload {
            return Err(crate::error::NetError::OversizedPayload {
                size: u64::from(payload_size),
                limit: u64::from(max_payload),
            });
        }

        Ok(Self { code, payload_size })
    }

    pub fn stream_write<W>(&self, stream: &mut W) -> NetResult<()>
        where W: Write
    {
        stream.write_u8(PROTOCOL_VERSION)?;
        stream.write_u16::<LittleEndian>(self.code as u16)?;
        stream.write_u32::<LittleEndian>(self.payload_size)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_header_round_trip() {
        let header = RequestHeader {
            client_id: Uuid::new_v4(),
            code: RequestCode::SendFile,
            payload_size: 1234,
        };
        let mut buffer = Cursor::new(Vec::new());
        header.stream_write(&mut buffer).unwrap();
        assert_eq!(buffer.get_ref().len(), REQUEST_HEADER_SIZE);

        let parsed = RequestHeader::read(&mut buffer.get_ref().as_slice(),
                                         DEFAULT_MAX_PAYLOAD).await.unwrap();
        assert_eq!(parsed.client_id, header.client_id);
        assert_eq!(parsed.code, RequestCode::SendFile);
        assert_eq!(parsed.payload_size, 1234);
    }

    #[tokio::test]
    async fn test_response_header_round_trip() {
        let header = ResponseHeader {
            code: ResponseCode::FileReceived,
            payload_size: 279,
        };
        let mut buffer = Cursor::new(Vec::new());
        header.stream_write(&mut buffer).unwrap();
        assert_eq!(buffer.get_ref().len(), RESPONSE_HEADER_SIZE);

        let parsed = ResponseHeader::read(&mut buffer.get_ref().as_slice(),
                                          DEFAULT_MAX_PAYLOAD).await.unwrap();
        assert_eq!(parsed.code, ResponseCode::FileReceived);
        assert_eq!(parsed.payload_size, 279);
    }

    #[tokio::test]
    async fn test_bad_version_rejected() {
        let mut raw = Vec::new();
        RequestHeader {
            client_id: Uuid::nil(),
            code: RequestCode::Register,
            payload_size: 255,
        }.stream_write(&mut raw).unwrap();
        raw[16] = 2;

        assert!(RequestHeader::read(&mut raw.as_slice(), DEFAULT_MAX_PAYLOAD)
            .await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_code_rejected() {
        let mut raw = Vec::new();
        ResponseHeader {
            code: ResponseCode::GeneralError,
            payload_size: 0,
        }.stream_write(&mut raw).unwrap();
        raw[1] = 0xff;
        raw[2] = 0xff;

        assert!(ResponseHeader::read(&mut raw.as_slice(), DEFAULT_MAX_PAYLOAD)
            .await.is_err());
    }
}
