//! Field-level secret codec: AES-256-CBC with PKCS#7 padding and a random
//! IV per call, stored as `ivHex:cipherHex`.
//!
//! The key is the configured passphrase normalized to 32 bytes: truncated
//! when longer, right-padded with `'0'` when shorter. This is weak key
//! derivation, kept byte-for-byte so existing ciphertext still decrypts.
//! Replacing it needs a re-encryption migration.

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

use crate::error::CodecError;
use crate::record::{Record, Value};
use crate::schema::SchemaDescriptor;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;
const BLOCK_SIZE: usize = 16;

/// Filler byte used to pad short passphrases.
pub const KEY_FILLER: u8 = b'0';

/// Passphrase used when `ENCRYPTION_KEY` is unset. Anything encrypted with
/// it is effectively plaintext to anyone holding this source.
pub const DEFAULT_PASSPHRASE: &str = "your-32-character-secret-key-here";

/// Truncate or pad a passphrase to exactly [`KEY_SIZE`] bytes.
pub fn normalize_key(passphrase: &[u8]) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([KEY_FILLER; KEY_SIZE]);
    let len = passphrase.len().min(KEY_SIZE);
    key[..len].copy_from_slice(&passphrase[..len]);
    key
}

/// Symmetric codec for sensitive string fields.
pub struct SecretCodec {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl std::fmt::Debug for SecretCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCodec")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl SecretCodec {
    pub fn new(passphrase: &SecretString) -> Self {
        let raw = passphrase.expose_secret();
        if raw.len() < KEY_SIZE {
            tracing::warn!(
                "Encryption passphrase is {} bytes; padding to {} weakens the key",
                raw.len(),
                KEY_SIZE
            );
        }
        Self {
            key: normalize_key(raw.as_bytes()),
        }
    }

    pub fn from_passphrase(passphrase: &str) -> Self {
        Self {
            key: normalize_key(passphrase.as_bytes()),
        }
    }

    /// Encrypt with a fresh random IV; the same plaintext never yields the
    /// same output twice.
    pub fn encrypt(&self, plaintext: &str) -> String {
        let mut iv = [0u8; IV_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut iv);
        self.encrypt_with_iv(plaintext, &iv)
    }

    fn encrypt_with_iv(&self, plaintext: &str, iv: &[u8; IV_SIZE]) -> String {
        let key: &[u8; KEY_SIZE] = &self.key;
        let ciphertext = Aes256CbcEnc::new(key.into(), iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        format!("{}:{}", hex::encode(iv), hex::encode(ciphertext))
    }

    pub fn decrypt(&self, secret: &str) -> Result<String, CodecError> {
        let (iv, ciphertext) = split_secret(secret)?;
        if ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(CodecError::DecryptionFailed(format!(
                "ciphertext length {} is not a multiple of {}",
                ciphertext.len(),
                BLOCK_SIZE
            )));
        }
        let key: &[u8; KEY_SIZE] = &self.key;
        let plaintext = Aes256CbcDec::new(key.into(), (&iv).into())
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| {
                CodecError::DecryptionFailed("bad padding (wrong key or tampered data)".to_string())
            })?;
        String::from_utf8(plaintext).map_err(|_| {
            CodecError::DecryptionFailed("plaintext is not valid UTF-8".to_string())
        })
    }

    /// Shape check only; says nothing about which key produced the value.
    pub fn is_encrypted(value: &str) -> bool {
        split_secret(value).is_ok()
    }

    /// Encrypt every sensitive field present in `record` in place. Null
    /// fields are left alone.
    pub fn encrypt_fields(
        &self,
        record: &mut Record,
        schema: &SchemaDescriptor,
    ) -> Result<(), CodecError> {
        for field in schema.sensitive_fields() {
            match record.get(&field.name) {
                Some(Value::Text(plain)) => {
                    let sealed = self.encrypt(plain);
                    record.insert(field.name.clone(), sealed);
                }
                Some(Value::Null) | None => {}
                Some(other) => {
                    return Err(CodecError::MalformedSecret(format!(
                        "sensitive field '{}' must be a string, got {}",
                        field.name,
                        other.kind()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Decrypt every sensitive field present in `record` in place.
    pub fn decrypt_fields(
        &self,
        record: &mut Record,
        schema: &SchemaDescriptor,
    ) -> Result<(), CodecError> {
        for field in schema.sensitive_fields() {
            match record.get(&field.name) {
                Some(Value::Text(sealed)) => {
                    let plain = self.decrypt(sealed)?;
                    record.insert(field.name.clone(), plain);
                }
                Some(Value::Null) | None => {}
                Some(other) => {
                    return Err(CodecError::MalformedSecret(format!(
                        "sensitive field '{}' must be a string, got {}",
                        field.name,
                        other.kind()
                    )));
                }
            }
        }
        Ok(())
    }
}

fn split_secret(secret: &str) -> Result<([u8; IV_SIZE], Vec<u8>), CodecError> {
    let mut parts = secret.split(':');
    let (Some(iv_hex), Some(cipher_hex), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(CodecError::MalformedSecret(
            "expected exactly one ':' separator".to_string(),
        ));
    };
    if iv_hex.is_empty() || cipher_hex.is_empty() {
        return Err(CodecError::MalformedSecret(
            "iv and ciphertext must both be non-empty".to_string(),
        ));
    }
    let iv_bytes = hex::decode(iv_hex)
        .map_err(|e| CodecError::MalformedSecret(format!("iv is not hex: {e}")))?;
    let iv: [u8; IV_SIZE] = iv_bytes.try_into().map_err(|bytes: Vec<u8>| {
        CodecError::MalformedSecret(format!("iv must be {IV_SIZE} bytes, got {}", bytes.len()))
    })?;
    let ciphertext = hex::decode(cipher_hex)
        .map_err(|e| CodecError::MalformedSecret(format!("ciphertext is not hex: {e}")))?;
    Ok((iv, ciphertext))
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::{DEFAULT_PASSPHRASE, KEY_FILLER, SecretCodec, normalize_key};
    use crate::error::CodecError;
    use crate::record::{Record, Value};
    use crate::schema::builtin;

    // Produced by the storage layer's original encryption routine with a
    // fixed IV, so these pin on-disk compatibility.
    const SHORT_KEY_VECTOR: &str = "000102030405060708090a0b0c0d0e0f:\
        72cf5553c52c2a4751f11f1fc91f0bf06fb1de511f134e2f53f7c3e0b34e6a75";
    const DEFAULT_KEY_VECTOR: &str =
        "0f0e0d0c0b0a09080706050403020100:104c8d843edc61cb8ed2a36f5228a67e";

    fn codec() -> SecretCodec {
        SecretCodec::from_passphrase("unit-test-passphrase")
    }

    #[test]
    fn round_trip_preserves_plaintext() {
        let codec = codec();
        for plain in ["", "sk-abcdef0123456789abcdef", "ключ-🔑", &"x".repeat(100)] {
            let sealed = codec.encrypt(plain);
            assert_eq!(codec.decrypt(&sealed).expect("decrypt"), plain);
        }
    }

    #[test]
    fn encrypt_is_non_deterministic() {
        let codec = codec();
        let a = codec.encrypt("same");
        let b = codec.encrypt("same");
        assert_ne!(a, b);
        assert_eq!(a.matches(':').count(), 1);
        assert_eq!(a.split(':').next().map(str::len), Some(32));
    }

    #[test]
    fn decrypts_stored_vectors() {
        let short = SecretCodec::from_passphrase("short-key");
        assert_eq!(
            short.decrypt(SHORT_KEY_VECTOR).expect("short key vector"),
            "sk-abcdef0123456789abcdef"
        );
        let default = SecretCodec::from_passphrase(DEFAULT_PASSPHRASE);
        assert_eq!(
            default.decrypt(DEFAULT_KEY_VECTOR).expect("default key vector"),
            "sk-or-v1-test"
        );
    }

    #[test]
    fn fixed_iv_encryption_matches_stored_vector() {
        let short = SecretCodec::from_passphrase("short-key");
        let iv: [u8; 16] = core::array::from_fn(|i| i as u8);
        assert_eq!(
            short.encrypt_with_iv("sk-abcdef0123456789abcdef", &iv),
            SHORT_KEY_VECTOR
        );
    }

    #[test]
    fn key_normalization_pads_and_truncates() {
        let padded = normalize_key(b"abc");
        assert_eq!(&padded[..3], b"abc");
        assert!(padded[3..].iter().all(|b| *b == KEY_FILLER));

        let long = "k".repeat(40);
        let truncated = normalize_key(long.as_bytes());
        assert_eq!(&truncated[..], "k".repeat(32).as_bytes());

        // A short key and its explicitly padded form are the same key.
        let sealed = SecretCodec::from_passphrase("abc").encrypt("secret");
        let explicit = format!("abc{}", "0".repeat(29));
        assert_eq!(
            SecretCodec::from_passphrase(&explicit)
                .decrypt(&sealed)
                .expect("same key"),
            "secret"
        );
    }

    #[test]
    fn malformed_secrets_are_rejected() {
        let codec = codec();
        for bad in [
            "not-a-valid-format",
            "abc:def:123",
            ":00",
            "00:",
            "zz:00",
            "0011:00112233445566778899aabbccddeeff",
            "000102030405060708090a0b0c0d0e0f:nothex",
        ] {
            assert!(
                matches!(codec.decrypt(bad), Err(CodecError::MalformedSecret(_))),
                "{bad} should be malformed"
            );
        }
    }

    #[test]
    fn altered_ciphertext_fails_decryption() {
        let short = SecretCodec::from_passphrase("short-key");
        let mut tampered = SHORT_KEY_VECTOR.to_string();
        tampered.pop();
        tampered.push('4');
        assert!(matches!(
            short.decrypt(&tampered),
            Err(CodecError::DecryptionFailed(_))
        ));

        let truncated = &SHORT_KEY_VECTOR[..SHORT_KEY_VECTOR.len() - 2];
        assert!(matches!(
            short.decrypt(truncated),
            Err(CodecError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let other = SecretCodec::from_passphrase("other-key");
        assert!(matches!(
            other.decrypt(SHORT_KEY_VECTOR),
            Err(CodecError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn sensitive_fields_round_trip_through_records() {
        let codec = SecretCodec::new(&SecretString::from("record-key".to_string()));
        let schema = builtin::openai_providers();
        let mut record = Record::new()
            .with("id", "p1")
            .with("name", "Acme")
            .with("apiKey", "sk-abcdef0123456789abcdef");

        codec.encrypt_fields(&mut record, &schema).expect("seal");
        let sealed = record.get_str("apiKey").expect("apiKey").to_string();
        assert!(SecretCodec::is_encrypted(&sealed));
        assert_eq!(record.get_str("name"), Some("Acme"));

        codec.decrypt_fields(&mut record, &schema).expect("open");
        assert_eq!(record.get_str("apiKey"), Some("sk-abcdef0123456789abcdef"));
    }

    #[test]
    fn non_string_sensitive_field_is_rejected() {
        let schema = builtin::openai_providers();
        let mut record = Record::new().with("id", "p1").with("apiKey", 42);
        assert!(codec().encrypt_fields(&mut record, &schema).is_err());
        let mut nulled = Record::new().with("id", "p1").with("apiKey", Value::Null);
        assert!(codec().encrypt_fields(&mut nulled, &schema).is_ok());
    }

    #[test]
    fn debug_output_redacts_key() {
        let rendered = format!("{:?}", codec());
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("unit-test"));
    }
}
