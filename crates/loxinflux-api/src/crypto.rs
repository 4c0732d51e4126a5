//! Session encryption for Miniserver commands.
//!
//! A fresh AES-256 key and IV are generated per connection and handed to the
//! Miniserver wrapped in its RSA public key. Afterwards every sensitive
//! command travels as `jdev/sys/enc/{base64(AES-CBC("salt/{salt}/{cmd}\0"))}`.

use std::time::{Duration, Instant};

use aes::Aes256;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use cbc::cipher::block_padding::ZeroPadding;
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use rand::{CryptoRng, RngCore};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};

use crate::error::Error;
use crate::protocol::commands;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const SALT_LEN: usize = 2;

/// Rotate the salt after this many commands...
pub const SALT_MAX_USES: u32 = 100;
/// ...or after this long, whichever comes first.
pub const SALT_MAX_AGE: Duration = Duration::from_secs(60 * 60);

// ── Public key ──────────────────────────────────────────────────────

/// Parse the key returned by `jdev/sys/getPublicKey`.
///
/// The Miniserver labels it `CERTIFICATE` but the body is an SPKI public
/// key, usually without line breaks.
pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey, Error> {
    let body: String = pem
        .replace("-----BEGIN CERTIFICATE-----", "")
        .replace("-----END CERTIFICATE-----", "")
        .replace("-----BEGIN PUBLIC KEY-----", "")
        .replace("-----END PUBLIC KEY-----", "")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let der = BASE64
        .decode(body.as_bytes())
        .map_err(|e| Error::PublicKey(format!("base64: {e}")))?;

    RsaPublicKey::from_public_key_der(&der)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(&der))
        .map_err(|e| Error::PublicKey(e.to_string()))
}

// ── Salt ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SaltState {
    current: String,
    uses: u32,
    created: Instant,
}

impl SaltState {
    fn new<R: RngCore>(rng: &mut R, now: Instant) -> Self {
        Self {
            current: random_hex(rng, SALT_LEN),
            uses: 0,
            created: now,
        }
    }

    /// Prefix for the next encrypted command, rotating when due.
    fn next_prefix<R: RngCore>(&mut self, rng: &mut R, now: Instant) -> String {
        let expired = now.saturating_duration_since(self.created) >= SALT_MAX_AGE;
        if self.uses >= SALT_MAX_USES || expired {
            let old = std::mem::replace(&mut self.current, random_hex(rng, SALT_LEN));
            self.uses = 1;
            self.created = now;
            tracing::debug!("rotating command salt");
            format!("nextSalt/{old}/{}/", self.current)
        } else {
            self.uses += 1;
            format!("salt/{}/", self.current)
        }
    }
}

fn random_hex<R: RngCore>(rng: &mut R, len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ── Session cipher ──────────────────────────────────────────────────

/// Symmetric key material for one connection.
///
/// Dropped with the connection; a reconnect always negotiates a new one.
pub struct SessionCipher {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
    salt: SaltState,
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("salt_uses", &self.salt.uses)
            .finish_non_exhaustive()
    }
}

impl SessionCipher {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut iv);
        let salt = SaltState::new(rng, Instant::now());
        Self { key, iv, salt }
    }

    /// The `keyexchange` argument: `"{hex key}:{hex iv}"` RSA-encrypted and
    /// base64-encoded.
    pub fn wrap_session_key<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        public_key: &RsaPublicKey,
    ) -> Result<String, Error> {
        let plain = format!("{}:{}", hex::encode(self.key), hex::encode(self.iv));
        let wrapped = public_key
            .encrypt(rng, Pkcs1v15Encrypt, plain.as_bytes())
            .map_err(|e| Error::Crypto(format!("RSA encrypt: {e}")))?;
        Ok(BASE64.encode(wrapped))
    }

    /// Encrypt `command` into a full `jdev/sys/enc/...` command path.
    pub fn encrypt_command<R: RngCore>(&mut self, rng: &mut R, command: &str) -> String {
        self.encrypt_command_at(rng, command, Instant::now())
    }

    fn encrypt_command_at<R: RngCore>(&mut self, rng: &mut R, command: &str, now: Instant) -> String {
        let prefix = self.salt.next_prefix(rng, now);
        let plain = format!("{prefix}{command}\0");
        let cipher = Aes256CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<ZeroPadding>(plain.as_bytes());
        commands::encrypted(&BASE64.encode(cipher))
    }
}
