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

use aes::Aes256;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use data_encoding::BASE64;
use rand_core::OsRng;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};

use crate::error::{NetError, NetResult};

pub const RSA_KEY_BITS: usize = 1024;
pub const PUBLIC_KEY_SIZE: usize = 160;
pub const WRAPPED_KEY_SIZE: usize = 128;
pub const AES_KEY_SIZE: usize = 32;
pub const AES_BLOCK_SIZE: usize = 16;

// The session cipher runs with a fixed zero IV.  Each session gets a
// fresh AES key, which bounds (but does not eliminate) the equal-prefix
// leak inherent to a static IV.
const ZERO_IV: [u8; AES_BLOCK_SIZE] = [0; AES_BLOCK_SIZE];

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

// SubjectPublicKeyInfo envelope for rsaEncryption with the optional
// AlgorithmIdentifier parameters omitted.  A 1024-bit modulus with a
// 65537 exponent always yields a 140-byte PKCS#1 RSAPublicKey, so the
// whole document is exactly PUBLIC_KEY_SIZE bytes.
const SPKI_HEADER: [u8; 20] = [
    0x30, 0x81, 0x9d,                               // SEQUENCE, 157 bytes
    0x30, 0x0b,                                     // AlgorithmIdentifier
    0x06, 0x09, 0x2a, 0x86, 0x48, 0x86,             // OID 1.2.840.113549.1.1.1
    0xf7, 0x0d, 0x01, 0x01, 0x01,
    0x03, 0x81, 0x8d, 0x00,                         // BIT STRING, 0 unused bits
];

pub fn generate_keypair() -> NetResult<RsaPrivateKey> {
    RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
        .map_err(|err| NetError::Crypto(format!("RSA key generation failed: {err}")))
}

pub fn encode_public_key(key: &RsaPublicKey) -> NetResult<[u8; PUBLIC_KEY_SIZE]> {
    let pkcs1 = key.to_pkcs1_der()
        .map_err(|err| NetError::Crypto(format!("Could not encode public key: {err}")))?;
    let body = pkcs1.as_bytes();
    if body.len() != PUBLIC_KEY_SIZE - SPKI_HEADER.len() {
        return Err(NetError::Crypto(format!(
            "Unexpected public key encoding size {} (not a {RSA_KEY_BITS}-bit key?)",
            body.len())));
    }

    let mut buffer = [0; PUBLIC_KEY_SIZE];
    buffer[..SPKI_HEADER.len()].copy_from_slice(&SPKI_HEADER);
    buffer[SPKI_HEADER.len()..].copy_from_slice(body);
    Ok(buffer)
}

pub fn decode_public_key(der: &[u8]) -> NetResult<RsaPublicKey> {
    if der.len() != PUBLIC_KEY_SIZE {
        return Err(NetError::Crypto(format!("Bad public key size {}", der.len())));
    }
    if der[..SPKI_HEADER.len()] != SPKI_HEADER {
        return Err(NetError::Crypto("Unrecognized public key envelope".to_string()));
    }
    let key = RsaPublicKey::from_pkcs1_der(&der[SPKI_HEADER.len()..])
        .map_err(|err| NetError::Crypto(format!("Could not parse public key: {err}")))?;
    if key.size() != WRAPPED_KEY_SIZE {
        return Err(NetError::Crypto(format!("Bad RSA modulus size {}", key.size())));
    }
    Ok(key)
}

pub fn encode_private_key(key: &RsaPrivateKey) -> NetResult<String> {
    let der = key.to_pkcs8_der()
        .map_err(|err| NetError::Crypto(format!("Could not encode private key: {err}")))?;
    Ok(BASE64.encode(der.as_bytes()))
}

pub fn decode_private_key(base64: &str) -> NetResult<RsaPrivateKey> {
    let der = BASE64.decode(base64.trim().as_bytes())
        .map_err(|err| NetError::Crypto(format!("Invalid private key encoding: {err}")))?;
    RsaPrivateKey::from_pkcs8_der(&der)
        .map_err(|err| NetError::Crypto(format!("Could not parse private key: {err}")))
}

// PKCS#1 v1.5 padding; both endpoints must agree, and the 128-byte wire
// field leaves no room for negotiation.
pub fn wrap_session_key(public_key: &RsaPublicKey, aes_key: &[u8; AES_KEY_SIZE])
    -> NetResult<[u8; WRAPPED_KEY_SIZE]>
{
    let wrapped = public_key.encrypt(&mut OsRng, Pkcs1v15Encrypt, aes_key)
        .map_err(|err| NetError::Crypto(format!("Key wrap failed: {err}")))?;
    wrapped.try_into()
        .map_err(|_| NetError::Crypto("Key wrap produced a bad ciphertext size".to_string()))
}

pub fn unwrap_session_key(private_key: &RsaPrivateKey, wrapped: &[u8])
    -> NetResult<[u8; AES_KEY_SIZE]>
{
    if wrapped.len() != WRAPPED_KEY_SIZE {
        return Err(NetError::Crypto(format!("Bad wrapped key size {}", wrapped.len())));
    }
    let key = private_key.decrypt(Pkcs1v15Encrypt, wrapped)
        .map_err(|err| NetError::Crypto(format!("Key unwrap failed: {err}")))?;
    key.try_into()
        .map_err(|_| NetError::Crypto("Unwrapped key has a bad size".to_string()))
}

/// Ciphertext size for a plaintext of `plain_size` bytes under CBC with
/// PKCS#7 padding (always at least one padding byte).
pub fn encrypted_size(plain_size: u64) -> u64 {
    (plain_size / AES_BLOCK_SIZE as u64 + 1) * AES_BLOCK_SIZE as u64
}

/// Streaming AES-256-CBC encryption.  Feed arbitrary plaintext slices;
/// each call returns whatever whole ciphertext blocks are ready, and
/// `finalize` emits the padded tail.  Peak memory stays at one chunk
/// regardless of the total stream size.
pub struct CbcEncryptStream {
    cipher: Aes256CbcEnc,
    carry: Vec<u8>,
}

impl CbcEncryptStream {
    pub fn new(key: &[u8; AES_KEY_SIZE]) -> Self {
        Self {
            cipher: Aes256CbcEnc::new(GenericArray::from_slice(key),
                                      GenericArray::from_slice(&ZERO_IV)),
            carry: Vec::new(),
        }
    }

    pub fn update(&mut self, plaintext: &[u8]) -> Vec<u8> {
        self.carry.extend_from_slice(plaintext);
        let whole = self.carry.len() - self.carry.len() % AES_BLOCK_SIZE;
        let mut out: Vec<u8> = self.carry.drain(..whole).collect();
        for block in out.chunks_exact_mut(AES_BLOCK_SIZE) {
            self.cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        out
    }

    pub fn finalize(self) -> NetResult<Vec<u8>> {
        let tail_len = self.carry.len();
        let mut buffer = self.carry;
        buffer.resize(tail_len + AES_BLOCK_SIZE, 0);
        let ciphertext = self.cipher.encrypt_padded_mut::<Pkcs7>(&mut buffer, tail_len)
            .map_err(|err| NetError::Crypto(format!("CBC padding failed: {err}")))?
            .to_vec();
        Ok(ciphertext)
    }
}

/// Streaming AES-256-CBC decryption.  The final block is withheld until
/// `finalize` so the PKCS#7 padding can be stripped no matter how the
/// ciphertext was chunked in transit.
pub struct CbcDecryptStream {
    cipher: Aes256CbcDec,
    pending: Vec<u8>,
}

impl CbcDecryptStream {
    pub fn new(key: &[u8; AES_KEY_SIZE]) -> Self {
        Self {
            cipher: Aes256CbcDec::new(GenericArray::from_slice(key),
                                      GenericArray::from_slice(&ZERO_IV)),
            pending: Vec::new(),
        }
    }

    pub fn update(&mut self, ciphertext: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(ciphertext);
        // Always hold back at least one full block; it may turn out to
        // be the padded tail.
        let take = self.pending.len().saturating_sub(AES_BLOCK_SIZE)
                    & !(AES_BLOCK_SIZE - 1);
        let mut out: Vec<u8> = self.pending.drain(..take).collect();
        for block in out.chunks_exact_mut(AES_BLOCK_SIZE) {
            self.cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        out
    }

    pub fn finalize(self) -> NetResult<Vec<u8>> {
        let mut buffer = self.pending;
        if buffer.is_empty() || buffer.len() % AES_BLOCK_SIZE != 0 {
            return Err(NetError::Crypto(format!(
                "Ciphertext length is not a whole number of blocks ({} trailing bytes)",
                buffer.len())));
        }
        let plaintext = self.cipher.decrypt_padded_mut::<Pkcs7>(&mut buffer)
            .map_err(|err| NetError::Crypto(format!("CBC unpadding failed: {err}")))?
            .to_vec();
        Ok(plaintext)
    }
}
