//! Ed25519 signatures, SHA-256 identity addressing, random nonces.

use crate::types::{Hash, IdentityId, ImageId, PublicKeyBytes, RelayToken, CHALLENGE_SIZE};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::info;

pub const PUBKEY_SIZE: usize = 32;
pub const SECRET_SIZE: usize = 32;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid public key")]
    InvalidPublicKey,
}

/// Server or client signing identity.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret(secret: [u8; SECRET_SIZE]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&secret),
        }
    }

    pub fn public(&self) -> PublicKeyBytes {
        self.signing.verifying_key().to_bytes()
    }

    pub fn secret(&self) -> [u8; SECRET_SIZE] {
        self.signing.to_bytes()
    }

    /// Identity address of this keypair: SHA-256 of the public key.
    pub fn identity_id(&self) -> IdentityId {
        identity_id(&self.public())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}

/// Verify an Ed25519 signature. `signature` must be exactly 64 bytes.
pub fn verify(
    pubkey: &PublicKeyBytes,
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let vk = VerifyingKey::from_bytes(pubkey).map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature)?;
    let sig = Signature::from_bytes(&sig_bytes);
    vk.verify(message, &sig)
        .map_err(|_| CryptoError::InvalidSignature)
}

/// True when the bytes decode as an Ed25519 point.
pub fn is_valid_public_key(pubkey: &PublicKeyBytes) -> bool {
    VerifyingKey::from_bytes(pubkey).is_ok()
}

pub fn sha256(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

/// Identity address: SHA-256 of the Ed25519 public key.
pub fn identity_id(pubkey: &PublicKeyBytes) -> IdentityId {
    sha256(pubkey)
}

/// Fresh 32-byte conversation challenge.
pub fn random_challenge() -> [u8; CHALLENGE_SIZE] {
    let mut out = [0u8; CHALLENGE_SIZE];
    OsRng.fill_bytes(&mut out);
    out
}

/// Fresh 128-bit relay token.
pub fn random_token() -> RelayToken {
    let mut out = [0u8; 16];
    OsRng.fill_bytes(&mut out);
    out
}

/// Fresh 128-bit image blob id.
pub fn random_image_id() -> ImageId {
    let mut out = [0u8; 16];
    OsRng.fill_bytes(&mut out);
    out
}

/// Short hex fingerprint of an id or key for logging.
pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(&bytes[..bytes.len().min(8)])
}

/// Load the node keypair from `data_dir/node_key.bin`, generating and saving
/// a fresh one if the file does not exist.
pub fn load_or_generate_keypair(data_dir: &Path) -> io::Result<Keypair> {
    let key_path = data_dir.join("node_key.bin");

    if key_path.exists() {
        let data = std::fs::read(&key_path)?;
        if data.len() != SECRET_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid keypair file",
            ));
        }

        let mut secret = [0u8; SECRET_SIZE];
        secret.copy_from_slice(&data);

        info!("Loaded node keypair from {:?}", key_path);
        Ok(Keypair::from_secret(secret))
    } else {
        let keypair = Keypair::generate();

        std::fs::create_dir_all(data_dir)?;
        std::fs::write(&key_path, keypair.secret())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&key_path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&key_path, perms)?;
        }

        info!(
            "Generated new node keypair, saved to {:?}, identity: {}",
            key_path,
            fingerprint(&keypair.identity_id())
        );
        Ok(keypair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let kp = Keypair::generate();
        let msg = b"conversation challenge";
        let sig = kp.sign(msg);
        assert!(verify(&kp.public(), msg, &sig).is_ok());
        assert!(verify(&kp.public(), b"other message", &sig).is_err());
    }

    #[test]
    fn test_verify_wrong_key() {
        let kp1 = Keypair::generate();
        let kp2 = Keypair::generate();
        let sig = kp1.sign(b"msg");
        assert!(verify(&kp2.public(), b"msg", &sig).is_err());
    }

    #[test]
    fn test_verify_bad_signature_length() {
        let kp = Keypair::generate();
        assert!(verify(&kp.public(), b"msg", &[0u8; 63]).is_err());
    }

    #[test]
    fn test_identity_id_is_pubkey_digest() {
        let kp = Keypair::generate();
        assert_eq!(kp.identity_id(), sha256(&kp.public()));
    }

    #[test]
    fn test_challenges_unique() {
        assert_ne!(random_challenge(), random_challenge());
        assert_ne!(random_token(), random_token());
    }

    #[test]
    fn test_keypair_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let kp1 = load_or_generate_keypair(dir.path()).unwrap();
        let kp2 = load_or_generate_keypair(dir.path()).unwrap();
        assert_eq!(kp1.public(), kp2.public());
    }
}
