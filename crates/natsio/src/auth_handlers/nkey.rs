//! Ed25519 nkeys: seed decoding, public key encoding and nonce signing.
//!
//! An encoded key is base32 (RFC 4648, no padding) over
//! `prefix || payload || crc16`, with the CRC-16/XMODEM checksum stored
//! little-endian.

use crate::error::{NatsError, Result};
use natsio_protocol::NonceSigner;
use ring::signature::{Ed25519KeyPair, KeyPair as _, UnparsedPublicKey, ED25519};
use std::fmt;

const PREFIX_BYTE_SEED: u8 = 18 << 3;
const PREFIX_BYTE_USER: u8 = 20 << 3;
const SEED_LEN: usize = 32;
const PUBLIC_KEY_LEN: usize = 32;

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

pub struct KeyPair {
    inner: Ed25519KeyPair,
    public_key: String,
}

impl KeyPair {
    /// Decodes a user seed (`SU...`).
    pub fn from_seed(seed: &str) -> Result<Self> {
        let raw = decode_checked(seed.trim())?;
        if raw.len() != 2 + SEED_LEN {
            return Err(NatsError::InvalidNkey("seed has the wrong length".into()));
        }
        if raw[0] & 0xf8 != PREFIX_BYTE_SEED {
            return Err(NatsError::InvalidNkey("not a seed".into()));
        }
        let kind = ((raw[0] & 0x07) << 5) | ((raw[1] & 0xf8) >> 3);
        if kind != PREFIX_BYTE_USER {
            return Err(NatsError::InvalidNkey("seed is not a user seed".into()));
        }

        let inner = Ed25519KeyPair::from_seed_unchecked(&raw[2..])
            .map_err(|e| NatsError::InvalidNkey(e.to_string()))?;
        let public_key = encode_checked(PREFIX_BYTE_USER, inner.public_key().as_ref());
        Ok(Self { inner, public_key })
    }

    #[must_use]
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    #[must_use]
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.inner.sign(data).as_ref().to_vec()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl NonceSigner for KeyPair {
    fn sign(&self, nonce: &[u8]) -> Result<Vec<u8>> {
        Ok(KeyPair::sign(self, nonce))
    }
}

/// Raw Ed25519 key bytes of an encoded user public key (`U...`).
pub fn decode_user_public_key(public_key: &str) -> Result<[u8; PUBLIC_KEY_LEN]> {
    let raw = decode_checked(public_key.trim())?;
    if raw.len() != 1 + PUBLIC_KEY_LEN || raw[0] != PREFIX_BYTE_USER {
        return Err(NatsError::InvalidNkey("not a user public key".into()));
    }
    let mut key = [0u8; PUBLIC_KEY_LEN];
    key.copy_from_slice(&raw[1..]);
    Ok(key)
}

/// Verifies a signature made by the holder of `public_key`.
pub fn verify(public_key: &str, data: &[u8], signature: &[u8]) -> Result<()> {
    let key = decode_user_public_key(public_key)?;
    UnparsedPublicKey::new(&ED25519, key)
        .verify(data, signature)
        .map_err(|_| NatsError::InvalidNkey("signature verification failed".into()))
}

fn encode_checked(prefix: u8, payload: &[u8]) -> String {
    let mut raw = Vec::with_capacity(payload.len() + 3);
    raw.push(prefix);
    raw.extend_from_slice(payload);
    let crc = crc16(&raw);
    raw.extend_from_slice(&crc.to_le_bytes());
    base32_encode(&raw)
}

fn decode_checked(encoded: &str) -> Result<Vec<u8>> {
    let mut raw = base32_decode(encoded)?;
    if raw.len() < 3 {
        return Err(NatsError::InvalidNkey("key is too short".into()));
    }
    let split = raw.len() - 2;
    let expected = u16::from_le_bytes([raw[split], raw[split + 1]]);
    raw.truncate(split);
    if crc16(&raw) != expected {
        return Err(NatsError::InvalidNkey("checksum mismatch".into()));
    }
    Ok(raw)
}

/// CRC-16/XMODEM: polynomial 0x1021, initial value 0.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for &byte in data {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(char::from(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize]));
        }
    }
    if bits > 0 {
        out.push(char::from(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize]));
    }
    out
}

#[allow(clippy::cast_possible_truncation)]
fn base32_decode(encoded: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(encoded.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for c in encoded.bytes() {
        let value = match c {
            b'A'..=b'Z' => c - b'A',
            b'2'..=b'7' => c - b'2' + 26,
            _ => {
                return Err(NatsError::InvalidNkey(format!(
                    "invalid base32 character {:?}",
                    char::from(c)
                )))
            }
        };
        buffer = (buffer << 5) | u32::from(value);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
        }
    }
    Ok(out)
}
