use std::fmt::{self, Display, Formatter};

use rand::RngCore;
use zeroize::Zeroize;

use crate::error::SyncError;

pub const MIN_ITERATIONS: u32 = 4096;
const SALT_LEN: usize = 32;

/// The SASL/SCRAM mechanisms the broker's admin API accepts (RFC 5802).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ScramMechanism {
    #[serde(rename = "SCRAM-SHA-256")]
    Sha256,
    #[serde(rename = "SCRAM-SHA-512")]
    Sha512,
}

impl ScramMechanism {
    /// PBKDF2 output length: 32 bytes for SHA-256, 64 for SHA-512.
    fn output_len(self) -> usize {
        match self {
            ScramMechanism::Sha256 => 32,
            ScramMechanism::Sha512 => 64,
        }
    }
}

impl Display for ScramMechanism {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ScramMechanism::Sha256 => write!(f, "SCRAM-SHA-256"),
            ScramMechanism::Sha512 => write!(f, "SCRAM-SHA-512"),
        }
    }
}

/// The immutable triple the broker stores against a principal. Opaque to
/// every caller except the broker's admin RPC: nothing in this crate ever
/// derives a plaintext back out of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScramVerifier {
    pub mechanism: ScramMechanism,
    pub salt: Vec<u8>,
    pub salted_password: Vec<u8>,
    pub iterations: u32,
}

/// Derive an RFC 5802 SCRAM verifier from a plaintext password.
///
/// Fails with [`SyncError::InvalidInput`] if the password is empty or
/// `iterations < MIN_ITERATIONS`. The plaintext is wiped from the stack
/// slot it occupies here before returning, on every path.
pub fn generate(
    password: &str,
    mechanism: ScramMechanism,
    iterations: u32,
) -> Result<ScramVerifier, SyncError> {
    let mut salt = vec![0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    generate_with_salt(password, mechanism, iterations, salt)
}

/// Same as [`generate`] but with an injected salt, so tests can assert
/// bit-identical output against a fixed vector.
pub fn generate_with_salt(
    password: &str,
    mechanism: ScramMechanism,
    iterations: u32,
    salt: Vec<u8>,
) -> Result<ScramVerifier, SyncError> {
    if password.is_empty() {
        return Err(SyncError::InvalidInput("password must not be empty".into()));
    }
    if iterations < MIN_ITERATIONS {
        return Err(SyncError::InvalidInput(format!(
            "iterations must be >= {MIN_ITERATIONS}, got {iterations}"
        )));
    }

    let mut password_bytes = password.as_bytes().to_vec();
    let mut salted_password = vec![0u8; mechanism.output_len()];
    match mechanism {
        ScramMechanism::Sha256 => {
            pbkdf2::pbkdf2_hmac::<sha2::Sha256>(&password_bytes, &salt, iterations, &mut salted_password);
        }
        ScramMechanism::Sha512 => {
            pbkdf2::pbkdf2_hmac::<sha2::Sha512>(&password_bytes, &salt, iterations, &mut salted_password);
        }
    }
    password_bytes.zeroize();

    Ok(ScramVerifier {
        mechanism,
        salt,
        salted_password,
        iterations,
    })
}
