//! Unit tests for the crypto module: Ed25519 signing and SHA-256 identity
//! addressing.

use haven::{identity_id, sha256, verify, Keypair};

#[test]
fn test_sha256_deterministic() {
    let hash1 = sha256(b"test");
    let hash2 = sha256(b"test");
    assert_eq!(hash1, hash2);

    let hash3 = sha256(b"different");
    assert_ne!(hash1, hash3);
}

#[test]
fn test_sign_verify() {
    let kp = Keypair::generate();
    let msg = b"test message";
    let sig = kp.sign(msg);
    assert!(verify(&kp.public(), msg, &sig).is_ok());
}

#[test]
fn test_sign_verify_wrong_message() {
    let kp = Keypair::generate();
    let sig = kp.sign(b"original message");

    assert!(verify(&kp.public(), b"tampered message", &sig).is_err());
}

#[test]
fn test_sign_verify_wrong_key() {
    let kp1 = Keypair::generate();
    let kp2 = Keypair::generate();
    let sig = kp1.sign(b"test message");

    assert!(verify(&kp2.public(), b"test message", &sig).is_err());
}

#[test]
fn test_keypair_unique() {
    let kp1 = Keypair::generate();
    let kp2 = Keypair::generate();

    assert_ne!(kp1.public(), kp2.public());
}

#[test]
fn test_identity_id_binding() {
    // The wire address of an identity is exactly the digest of its key.
    let kp = Keypair::generate();
    assert_eq!(kp.identity_id(), identity_id(&kp.public()));
    assert_eq!(kp.identity_id(), sha256(&kp.public()));
}
