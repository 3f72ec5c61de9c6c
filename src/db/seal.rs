//! At-rest sealing for account credentials. When `MIP_CREDENTIAL_KEY` is
//! set, the `credentials` column holds an AES-256-GCM envelope; otherwise it
//! holds plain JSON which is transparently re-sealed once a key appears.

use anyhow::{anyhow, Context, Result};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use crate::db::models::Credentials;

pub const CREDENTIAL_KEY_ENV: &str = "MIP_CREDENTIAL_KEY";
const CREDENTIAL_KEY_BYTES: usize = 32;
const CREDENTIAL_NONCE_BYTES: usize = 12;
const CREDENTIAL_ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SealedEnvelope {
    version: u8,
    nonce_hex: String,
    ciphertext_hex: String,
}

/// Resolve the sealing key from the environment, if configured.
pub fn sealing_key() -> Result<Option<[u8; CREDENTIAL_KEY_BYTES]>> {
    let raw = std::env::var(CREDENTIAL_KEY_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    raw.map(|value| parse_key_hex(&value))
        .transpose()
        .with_context(|| format!("{CREDENTIAL_KEY_ENV} must be 64 hex characters (32 bytes)"))
}

pub fn seal_credentials(
    credentials: &Credentials,
    key_bytes: &[u8; CREDENTIAL_KEY_BYTES],
) -> Result<String> {
    let mut plaintext = serde_json::to_vec(credentials).context("serialize credentials")?;

    let unbound_key = UnboundKey::new(&AES_256_GCM, key_bytes)
        .map_err(|_| anyhow!("construct AES-256-GCM key"))?;
    let key = LessSafeKey::new(unbound_key);

    let mut nonce_bytes = [0u8; CREDENTIAL_NONCE_BYTES];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| anyhow!("generate random nonce for credential sealing"))?;

    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::empty(),
        &mut plaintext,
    )
    .map_err(|_| anyhow!("seal account credentials"))?;

    let envelope = SealedEnvelope {
        version: CREDENTIAL_ENVELOPE_VERSION,
        nonce_hex: hex_encode(&nonce_bytes),
        ciphertext_hex: hex_encode(&plaintext),
    };

    serde_json::to_string(&envelope).context("serialize sealed credential envelope")
}

pub fn unseal_credentials(
    raw: &str,
    key_bytes: &[u8; CREDENTIAL_KEY_BYTES],
) -> Result<Credentials> {
    let envelope: SealedEnvelope =
        serde_json::from_str(raw).context("parse sealed credential envelope")?;

    if envelope.version != CREDENTIAL_ENVELOPE_VERSION {
        return Err(anyhow!(
            "unsupported credential envelope version {}",
            envelope.version
        ));
    }

    let nonce_vec = hex_decode(&envelope.nonce_hex).context("decode envelope nonce")?;
    let nonce_bytes: [u8; CREDENTIAL_NONCE_BYTES] = nonce_vec
        .try_into()
        .map_err(|_| anyhow!("invalid nonce length in credential envelope"))?;
    let mut ciphertext =
        hex_decode(&envelope.ciphertext_hex).context("decode envelope ciphertext")?;

    let unbound_key = UnboundKey::new(&AES_256_GCM, key_bytes)
        .map_err(|_| anyhow!("construct AES-256-GCM key"))?;
    let key = LessSafeKey::new(unbound_key);

    let plaintext = key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut ciphertext,
        )
        .map_err(|_| anyhow!("unseal account credentials"))?;

    serde_json::from_slice(plaintext).context("parse unsealed credentials")
}

fn parse_key_hex(raw: &str) -> Result<[u8; CREDENTIAL_KEY_BYTES]> {
    let decoded = hex_decode(raw).context("decode credential key hex")?;
    decoded
        .try_into()
        .map_err(|_| anyhow!("credential key must be 32 bytes"))
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

fn hex_decode(raw: &str) -> Result<Vec<u8>> {
    let value = raw.trim();
    if value.len() % 2 != 0 {
        return Err(anyhow!("hex string length must be even"));
    }

    let mut out = Vec::with_capacity(value.len() / 2);
    let bytes = value.as_bytes();
    let mut idx = 0usize;
    while idx < bytes.len() {
        let hi = decode_hex_nibble(bytes[idx]).ok_or_else(|| anyhow!("invalid hex digit"))?;
        let lo = decode_hex_nibble(bytes[idx + 1]).ok_or_else(|| anyhow!("invalid hex digit"))?;
        out.push((hi << 4) | lo);
        idx += 2;
    }
    Ok(out)
}

fn decode_hex_nibble(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
