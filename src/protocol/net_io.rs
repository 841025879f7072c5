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

use std::io::{Read, Write};

use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::error::{NetError, NetResult};
use crate::proto_error;
use super::STRING_FIELD_SIZE;

/// Reads exactly `buf.len()` bytes or fails.  A peer that closes the
/// socket mid-frame is reported distinctly from other I/O trouble.
pub async fn read_exact_buf<S>(stream: &mut S, buf: &mut [u8]) -> NetResult<()>
    where S: AsyncRead + Unpin
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(NetError::ConnectionClosed)
        }
        Err(err) => Err(NetError::Io(err)),
    }
}

/// Reads a payload whose size was declared in a frame header, enforcing
/// the configured cap before any allocation happens.
pub async fn read_payload<S>(stream: &mut S, size: u32, limit: u32) -> NetResult<Vec<u8>>
    where S: AsyncRead + Unpin
{
    if size > limit {
        return Err(NetError::OversizedPayload {
            size: u64::from(size),
            limit: u64::from(limit),
        });
    }
    let mut buffer = vec![0; size as usize];
    read_exact_buf(stream, &mut buffer).await?;
    Ok(buffer)
}

/// Reads a fixed 255-byte string field: NUL-terminated, NUL-padded,
/// bytes past the first NUL ignored.
pub fn read_string_field<R>(stream: &mut R) -> NetResult<String>
    where R: Read
{
    let mut buffer = [0; STRING_FIELD_SIZE];
    stream.read_exact(&mut buffer)?;
    let Some(end) = buffer.iter().position(|b| *b == 0) else {
        return Err(proto_error!("String field is missing its NUL terminator"));
    };
    String::from_utf8(buffer[..end].to_vec())
        .map_err(|_| proto_error!("String field is not valid UTF-8"))
}

pub fn write_string_field<W>(stream: &mut W, value: &str) -> NetResult<()>
    where W: Write
{
    if value.len() >= STRING_FIELD_SIZE {
        return Err(proto_error!("String '{}' too long for its wire field", value));
    }
    let mut buffer = [0; STRING_FIELD_SIZE];
    buffer[..value.len()].copy_from_slice(value.as_bytes());
    stream.write_all(&buffer)?;
    Ok(())
}

pub fn read_client_id<R>(stream: &mut R) -> NetResult<Uuid>
    where R: Read
{
    let mut buffer = [0; 16];
    stream.read_exact(&mut buffer)?;
    Ok(Uuid::from_bytes(buffer))
}

pub fn write_client_id<W>(stream: &mut W, client_id: &Uuid) -> NetResult<()>
    where W: Write
{
    stream.write_all(client_id.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn test_string_field_round_trip() {
        let mut buffer = Cursor::new(Vec::new());
        write_string_field(&mut buffer, "backup_2024.tar").unwrap();
        assert_eq!(buffer.get_ref().len(), STRING_FIELD_SIZE);

        buffer.set_position(0);
        assert_eq!(read_string_field(&mut buffer).unwrap(), "backup_2024.tar");
    }

    #[test]
    fn test_string_field_ignores_bytes_past_nul() {
        let mut raw = [0x41; STRING_FIELD_SIZE];
        raw[3] = 0;
        assert_eq!(read_string_field(&mut Cursor::new(raw)).unwrap(), "AAA");
    }

    #[test]
    fn test_string_field_requires_terminator() {
        let raw = [0x41; STRING_FIELD_SIZE];
        assert!(read_string_field(&mut Cursor::new(raw)).is_err());
    }

    #[test]
    fn test_string_field_max_value_length() {
        let name = "x".repeat(STRING_FIELD_SIZE - 1);
        let mut buffer = Cursor::new(Vec::new());
        write_string_field(&mut buffer, &name).unwrap();
        buffer.set_position(0);
        assert_eq!(read_string_field(&mut buffer).unwrap(), name);

        let too_long = "x".repeat(STRING_FIELD_SIZE);
        assert!(write_string_field(&mut Cursor::new(Vec::new()), &too_long).is_err());
    }

    #[tokio::test]
    async fn test_read_payload_enforces_cap() {
        let data = [0_u8; 64];
        let result = read_payload(&mut data.as_slice(), 64, 32).await;
        assert!(matches!(result, Err(NetError::OversizedPayload { size: 64, limit: 32 })));

        let payload = read_payload(&mut data.as_slice(), 48, 64).await.unwrap();
        assert_eq!(payload.len(), 48);
    }

    #[tokio::test]
    async fn test_short_read_is_connection_closed() {
        let data = [0_u8; 10];
        let mut buffer = [0; 23];
        let result = read_exact_buf(&mut data.as_slice(), &mut buffer).await;
        assert!(matches!(result, Err(NetError::ConnectionClosed)));
    }
}
