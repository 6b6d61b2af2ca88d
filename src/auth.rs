//! Credential verification for the control channel
//!
//! The stored secret selects the variant: empty means open access, a
//! `scrypt$<salt>$<hash>` triple means a salted hash, anything else is
//! compared as plaintext. The triple test is deliberately lossy - a
//! plaintext secret that happens to look like a stored hash is resolved
//! in favor of the hash variant.

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rand::RngCore;

/// Identifier carried in the first field of a stored hash string
pub const SCRYPT_ID: &str = "scrypt";

// Fixed scrypt cost parameters. Changing these invalidates stored hashes.
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const SCRYPT_DKLEN: usize = 32;

const SALT_LEN: usize = 16;

#[derive(Debug, Clone)]
pub enum Auth {
    /// No secret configured; every credential succeeds
    None,
    /// Exact plaintext comparison
    Plain(String),
    /// Salted scrypt hash, decoded from `scrypt$<salt-hex>$<hash-hex>`
    Scrypt { salt: Vec<u8>, hash: Vec<u8> },
}

impl Auth {
    /// Select the variant from a stored-secret string.
    ///
    /// Exactly three `$`-separated fields whose first is the scrypt id and
    /// whose salt and hash fields hex-decode select `Scrypt`; an empty or
    /// absent string selects `None`; everything else is `Plain`.
    pub fn from_stored(stored: Option<&str>) -> Self {
        let stored = match stored {
            Some(s) if !s.is_empty() => s,
            _ => return Auth::None,
        };
        let fields: Vec<&str> = stored.split('$').collect();
        if fields.len() == 3 && fields[0] == SCRYPT_ID {
            if let (Ok(salt), Ok(hash)) = (hex_decode(fields[1]), hex_decode(fields[2])) {
                return Auth::Scrypt { salt, hash };
            }
        }
        Auth::Plain(stored.to_string())
    }

    /// Hash a secret into a storable string, drawing a fresh random salt.
    /// Two calls on the same secret yield different strings.
    pub fn new_scrypt(secret: &str) -> Result<String> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let hash = derive(secret.as_bytes(), &salt)?;
        Ok(format!(
            "{}${}${}",
            SCRYPT_ID,
            hex_encode(&salt),
            hex_encode(&hash)
        ))
    }

    /// Verify a presented credential against the stored secret.
    pub fn authenticate(&self, credential: Option<&str>) -> bool {
        match self {
            Auth::None => true,
            Auth::Plain(secret) => credential == Some(secret.as_str()),
            Auth::Scrypt { salt, hash } => match credential {
                Some(cred) => derive(cred.as_bytes(), salt)
                    .map(|derived| derived == *hash)
                    .unwrap_or(false),
                None => false,
            },
        }
    }

    /// Whether clients must present a credential (feeds discovery payloads)
    pub fn required(&self) -> bool {
        !matches!(self, Auth::None)
    }
}

fn derive(credential: &[u8], salt: &[u8]) -> Result<Vec<u8>> {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, SCRYPT_DKLEN)
        .context("scrypt parameters")?;
    let mut out = vec![0u8; SCRYPT_DKLEN];
    scrypt::scrypt(credential, salt, &params, &mut out).context("scrypt derivation")?;
    Ok(out)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(s: &str) -> Result<Vec<u8>> {
    if s.is_empty() || s.len() % 2 != 0 {
        anyhow::bail!("invalid hex length");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).context("invalid hex digit"))
        .collect()
}
