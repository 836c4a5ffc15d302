//! Challenge-response authentication of physical sockets.
//!
//! The relay writes a random challenge as soon as it accepts a socket; the
//! peer proves possession of the Ed25519 private key by answering with a
//! signature over the challenge. Nothing else is exchanged until the socket is
//! trusted.

use std::time::Duration;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the random challenge.
pub const CHALLENGE_SIZE: usize = 32;

/// Size of an Ed25519 signature.
pub const SIGNATURE_SIZE: usize = 64;

/// Size of an Ed25519 key, raw.
pub const KEY_SIZE: usize = 32;

/// Handshake and key material errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid key: expected {expected} hex characters, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("signature verification failed")]
    BadSignature,

    #[error("random number generator failed: {0}")]
    Random(String),

    #[error("handshake I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AuthResult<T> = std::result::Result<T, AuthError>;

fn parse_key_bytes(hex_key: &str) -> AuthResult<[u8; KEY_SIZE]> {
    let trimmed = hex_key.trim();
    if trimmed.len() != KEY_SIZE * 2 {
        return Err(AuthError::InvalidKeyLength {
            expected: KEY_SIZE * 2,
            actual: trimmed.len(),
        });
    }
    let mut bytes = [0u8; KEY_SIZE];
    hex::decode_to_slice(trimmed, &mut bytes).map_err(|e| AuthError::InvalidKey(e.to_string()))?;
    Ok(bytes)
}

/// Private key of the party that answers challenges.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Parses a hex-encoded 32-byte Ed25519 private key.
    pub fn from_hex(hex_key: &str) -> AuthResult<Self> {
        let bytes = parse_key_bytes(hex_key)?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&bytes),
        })
    }

    /// Generates a fresh key from OS randomness.
    pub fn generate() -> AuthResult<Self> {
        let mut bytes = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut bytes).map_err(|e| AuthError::Random(e.to_string()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&bytes),
        })
    }

    /// Returns the matching public key.
    pub fn verifier(&self) -> Verifier {
        Verifier {
            verifying_key: self.signing_key.verifying_key(),
        }
    }

    /// Signs a challenge.
    pub fn sign(&self, challenge: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(challenge).to_bytes()
    }

    /// Hex encoding of the private key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.verifier().to_hex())
            .finish_non_exhaustive()
    }
}

/// Public key that challenge answers are verified against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verifier {
    verifying_key: VerifyingKey,
}

impl Verifier {
    /// Parses a hex-encoded 32-byte Ed25519 public key.
    pub fn from_hex(hex_key: &str) -> AuthResult<Self> {
        let bytes = parse_key_bytes(hex_key)?;
        let verifying_key =
            VerifyingKey::from_bytes(&bytes).map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        Ok(Self { verifying_key })
    }

    /// Checks a signature over `challenge`.
    pub fn verify(&self, challenge: &[u8], signature: &[u8; SIGNATURE_SIZE]) -> AuthResult<()> {
        let signature = Signature::from_bytes(signature);
        self.verifying_key
            .verify(challenge, &signature)
            .map_err(|_| AuthError::BadSignature)
    }

    /// Hex encoding of the public key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.verifying_key.to_bytes())
    }
}

/// Generates a fresh keypair, returned as `(private_hex, public_hex)`.
pub fn generate_keypair() -> AuthResult<(String, String)> {
    let identity = Identity::generate()?;
    let public = identity.verifier().to_hex();
    Ok((identity.to_hex(), public))
}

/// Challenges a freshly accepted socket and verifies its answer.
///
/// The whole exchange, including writing the challenge, is bounded by
/// `timeout`.
pub async fn challenge_peer<S>(stream: &mut S, verifier: &Verifier, timeout: Duration) -> AuthResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut challenge = [0u8; CHALLENGE_SIZE];
    getrandom::getrandom(&mut challenge).map_err(|e| AuthError::Random(e.to_string()))?;

    let exchange = async {
        stream.write_all(&challenge).await?;
        stream.flush().await?;
        let mut signature = [0u8; SIGNATURE_SIZE];
        stream.read_exact(&mut signature).await?;
        Ok::<_, AuthError>(signature)
    };

    let signature = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| AuthError::Timeout(timeout))??;

    verifier.verify(&challenge, &signature)
}

/// Reads the relay's challenge and answers it with a signature.
pub async fn answer_challenge<S>(stream: &mut S, identity: &Identity, timeout: Duration) -> AuthResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        let mut challenge = [0u8; CHALLENGE_SIZE];
        stream.read_exact(&mut challenge).await?;
        stream.write_all(&identity.sign(&challenge)).await?;
        stream.flush().await?;
        Ok::<_, AuthError>(())
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| AuthError::Timeout(timeout))?
}
