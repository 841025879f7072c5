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

use crc::{Crc, Digest, CRC_32_CKSUM};

// POSIX cksum: MSB-first CRC over the data followed by the byte length,
// least significant octet first, using the minimal number of octets.
// The final complement is CRC_32_CKSUM's xorout.  Note this is NOT the
// Ethernet/zlib CRC-32; the two never agree.
static CKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_CKSUM);

/// Incremental POSIX `cksum` digest over a byte stream.
pub struct Crc32Stream {
    digest: Digest<'static, u32>,
    length: u64,
}

impl Crc32Stream {
    pub fn new() -> Self {
        Self { digest: CKSUM.digest(), length: 0 }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.digest.update(chunk);
        self.length += chunk.len() as u64;
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn finalize(self) -> u32 {
        let mut digest = self.digest;
        let mut length = self.length;
        while length != 0 {
            digest.update(&[(length & 0xff) as u8]);
            length >>= 8;
        }
        digest.finalize()
    }
}

impl Default for Crc32Stream {
    fn default() -> Self {
        Self::new()
    }
}

pub fn crc32(data: &[u8]) -> u32 {
    let mut stream = Crc32Stream::new();
    stream.update(data);
    stream.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        // cksum of an empty input folds in no length octets at all
        assert_eq!(crc32(b""), 4_294_967_295);
        // The classic check string, as reported by cksum(1)
        assert_eq!(crc32(b"123456789"), 930_766_865);
    }

    #[test]
    fn test_stream_matches_oneshot() {
        let data = b"The quick brown fox jumps over the lazy dog";
        let mut stream = Crc32Stream::new();
        stream.update(data);
        assert_eq!(stream.finalize(), crc32(data));
    }

    #[test]
    fn test_concat_property() {
        let a = b"backhaul test vector ";
        let b = b"split across two updates";
        let mut whole = Vec::from(a.as_slice());
        whole.extend_from_slice(b);

        let mut stream = Crc32Stream::new();
        stream.update(a);
        stream.update(b);
        assert_eq!(stream.finalize(), crc32(&whole));
    }

    #[test]
    fn test_chunk_boundaries_do_not_matter() {
        let data: Vec<u8> = (0..=255).cycle().take(1000).collect();
        let expected = crc32(&data);
        for chunk_size in [1, 7, 16, 255, 999] {
            let mut stream = Crc32Stream::new();
            for chunk in data.chunks(chunk_size) {
                stream.update(chunk);
            }
            assert_eq!(stream.finalize(), expected, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn test_length_affects_digest() {
        // Same bytes, different lengths of trailing zeros must differ;
        // the length suffix distinguishes them even when the data CRC
        // alone would not.
        assert_ne!(crc32(b"\0"), crc32(b"\0\0"));
    }
}
