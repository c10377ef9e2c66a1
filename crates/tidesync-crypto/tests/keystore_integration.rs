//! Key-store lifecycle integration tests.
//!
//! These run the production Argon2id parameters, so each derivation costs
//! real time; the scenarios are batched to keep the total reasonable.

use tidesync_crypto::keys::KeyStore;
use tidesync_crypto::{CipherAlgorithm, CryptoError, decrypt_bytes, encrypt_bytes};

#[test]
fn master_lifecycle_and_password_change() {
    let dir = tempfile::tempdir().unwrap();
    let store = KeyStore::open(dir.path().join("keys")).unwrap();
    assert!(!store.is_initialized());

    let master = store.init_master(b"first-password").unwrap();
    assert!(store.is_initialized());

    // Double init refuses.
    assert!(store.init_master(b"whatever").is_err());

    // Wrong password is a distinct failure class.
    assert!(matches!(
        store.unlock_master(b"not-the-password"),
        Err(CryptoError::WrongPassword)
    ));

    // Share keys wrapped under this master survive a password change
    // without re-encryption: the master bytes themselves are unchanged.
    let share = store.share_key(&master, "share1").unwrap();
    let container = encrypt_bytes(b"contents", &share, "k1", CipherAlgorithm::Aes256Gcm).unwrap();

    store.change_password(b"first-password", b"second-password").unwrap();

    assert!(matches!(
        store.unlock_master(b"first-password"),
        Err(CryptoError::WrongPassword)
    ));
    let master_again = store.unlock_master(b"second-password").unwrap();
    assert_eq!(master_again.as_bytes(), master.as_bytes());

    let share_again = store.share_key(&master_again, "share1").unwrap();
    assert_eq!(decrypt_bytes(&container, &share_again).unwrap(), b"contents");
}

#[test]
fn recovery_secret_unlocks_master() {
    let dir = tempfile::tempdir().unwrap();
    let store = KeyStore::open(dir.path().join("keys")).unwrap();

    let master = store.init_master(b"password").unwrap();
    let recovery_hex = store.generate_recovery(&master).unwrap();
    assert_eq!(recovery_hex.len(), 64);

    let recovered = store.unlock_with_recovery(&recovery_hex).unwrap();
    assert_eq!(recovered.as_bytes(), master.as_bytes());

    // A wrong recovery secret fails authentication, not parsing.
    let wrong = "00".repeat(32);
    assert!(matches!(
        store.unlock_with_recovery(&wrong),
        Err(CryptoError::WrongPassword)
    ));
}
