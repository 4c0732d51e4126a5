use chrono::{DateTime, TimeDelta, Utc};
use hmac::{Hmac, Mac};
use rsa::RsaPublicKey;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use url::Url;

use crate::crypto::parse_public_key;
use crate::error::Error;
use crate::protocol::{LoxResponse, commands};

/// Token timestamps count seconds from 2009-01-01T00:00:00Z.
const LOXONE_EPOCH_SECS: i64 = 1_230_768_000;

/// Credentials for a Miniserver user.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub password: SecretString,
    /// Needed only for devices protected by a visualisation password.
    pub visu_password: Option<SecretString>,
}

/// Hash function announced by the Miniserver for credential hashing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum HashAlg {
    #[default]
    #[serde(rename = "SHA1")]
    Sha1,
    #[serde(rename = "SHA256")]
    Sha256,
}

impl HashAlg {
    /// Upper-case hex digest of `input`.
    fn digest_upper(self, input: &str) -> String {
        match self {
            Self::Sha1 => hex::encode_upper(Sha1::digest(input.as_bytes())),
            Self::Sha256 => hex::encode_upper(Sha256::digest(input.as_bytes())),
        }
    }

    /// Lower-case hex HMAC of `message` keyed with the hex-encoded `key`.
    fn hmac_hex(self, key_hex: &str, message: &str) -> Result<String, Error> {
        let key = hex::decode(key_hex).map_err(|e| Error::Crypto(format!("hmac key: {e}")))?;
        let invalid = |e: hmac::digest::InvalidLength| Error::Crypto(format!("hmac key: {e}"));
        Ok(match self {
            Self::Sha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(&key).map_err(invalid)?;
                mac.update(message.as_bytes());
                hex::encode(mac.finalize().into_bytes())
            }
            Self::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(&key).map_err(invalid)?;
                mac.update(message.as_bytes());
                hex::encode(mac.finalize().into_bytes())
            }
        })
    }
}

/// Answer to `getkey2` and `getvisusalt`.
#[derive(Debug, Clone, Deserialize)]
pub struct KeySalt {
    pub key: String,
    pub salt: String,
    #[serde(rename = "hashAlg", default)]
    pub hash_alg: HashAlg,
}

impl KeySalt {
    /// `hmac(key, "{user}:{upper(sha(password:salt))}")`, sent with `getjwt`.
    pub fn credential_hash(&self, user: &str, password: &SecretString) -> Result<String, Error> {
        let pw_hash = self
            .hash_alg
            .digest_upper(&format!("{}:{}", password.expose_secret(), self.salt));
        self.hash_alg.hmac_hex(&self.key, &format!("{user}:{pw_hash}"))
    }

    /// `hmac(key, upper(sha(visu_password:salt)))`, sent with `sps/ios`.
    pub fn visu_hash(&self, visu_password: &SecretString) -> Result<String, Error> {
        let pw_hash = self
            .hash_alg
            .digest_upper(&format!("{}:{}", visu_password.expose_secret(), self.salt));
        self.hash_alg.hmac_hex(&self.key, &pw_hash)
    }
}

/// `hmac(one_time_key, token)`, sent with `refreshjwt`.
pub fn token_hash(alg: HashAlg, one_time_key_hex: &str, token: &SecretString) -> Result<String, Error> {
    alg.hmac_hex(one_time_key_hex, token.expose_secret())
}

/// Answer to `getjwt`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    pub token: String,
    #[serde(default)]
    pub key: String,
    pub valid_until: i64,
    #[serde(default)]
    pub token_rights: u32,
    #[serde(default)]
    pub unsecure_pass: bool,
}

/// Answer to `refreshjwt`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRenewal {
    pub valid_until: i64,
    #[serde(default)]
    pub unsecure_pass: bool,
}

/// A bearer token and its validity.
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub token: SecretString,
    pub valid_until: DateTime<Utc>,
    pub rights: u32,
}

fn from_loxone_time(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(LOXONE_EPOCH_SECS.saturating_add(secs), 0).unwrap_or(DateTime::UNIX_EPOCH)
}

impl AuthToken {
    pub fn from_grant(grant: TokenGrant) -> Self {
        if grant.unsecure_pass {
            tracing::warn!("Miniserver reports an insecure password for this user");
        }
        Self {
            token: SecretString::from(grant.token),
            valid_until: from_loxone_time(grant.valid_until),
            rights: grant.token_rights,
        }
    }

    pub fn renew(&mut self, renewal: &TokenRenewal) {
        self.valid_until = from_loxone_time(renewal.valid_until);
    }

    /// When the token should be refreshed.
    pub fn refresh_at(&self, margin: TimeDelta) -> DateTime<Utc> {
        self.valid_until - margin
    }
}

/// Fetch and parse the Miniserver's RSA public key over plain HTTP(S).
pub async fn fetch_public_key(http: &reqwest::Client, base: &Url) -> Result<RsaPublicKey, Error> {
    let url = base.join(commands::GET_PUBLIC_KEY)?;
    tracing::debug!(%url, "fetching public key");

    let body = http.get(url).send().await?.error_for_status()?.text().await?;
    let response = LoxResponse::parse(&body).map_err(|e| Error::PublicKey(e.to_string()))?;
    let response = response
        .require_success("getPublicKey")
        .map_err(|e| Error::PublicKey(e.to_string()))?;
    parse_public_key(&response.value_text())
}
