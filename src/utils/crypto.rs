//! Asymmetric envelope: signing, verification, encryption, decryption.
//!
//! Wraps a static long-term RSA keypair (2048-bit) behind `PrivateKey` and
//! `PublicKey`. Signatures are PKCS#1 v1.5 over SHA-256 digests; encryption is
//! whole-buffer PKCS#1 v1.5, which bounds the plaintext to the key's capacity
//! (`PublicKey::max_plaintext_len`). This module knows nothing about frames —
//! it operates purely on byte sequences.

use crate::error::{ProtocolError, Result};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

/// Modulus size for generated keys.
pub const KEY_BITS: usize = 2048;

/// PKCS#1 v1.5 encryption overhead: the plaintext must leave room for
/// `00 02 <at least 8 nonzero pad bytes> 00`.
const PKCS1V15_OVERHEAD: usize = 11;

/// Long-term private key. Public half is derivable via [`to_public_key`].
///
/// [`to_public_key`]: PrivateKey::to_public_key
#[derive(Clone)]
pub struct PrivateKey {
    inner: RsaPrivateKey,
}

impl PrivateKey {
    /// Generate a fresh random keypair at the default modulus size.
    pub fn random() -> Result<Self> {
        Self::random_with_bits(KEY_BITS)
    }

    /// Generate a keypair at an explicit modulus size.
    ///
    /// Encrypting a *signed* buffer requires the recipient's modulus to
    /// exceed the signer's signature block, so recipients of signed and
    /// encrypted frames need a larger key than the default.
    pub fn random_with_bits(bits: usize) -> Result<Self> {
        let mut rng = rand::rngs::OsRng;
        let inner = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| ProtocolError::Custom(format!("key generation failed: {e}")))?;
        Ok(Self { inner })
    }

    /// Derive the public half.
    pub fn to_public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.to_public_key(),
        }
    }

    /// Sign `data`, returning the detached signature bytes.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let signing_key = SigningKey::<Sha256>::new(self.inner.clone());
        let signature = signing_key
            .try_sign(data)
            .map_err(|e| ProtocolError::Custom(format!("signing failed: {e}")))?;
        Ok(signature.to_vec())
    }

    /// Decrypt a whole-buffer ciphertext produced by [`PublicKey::encrypt`].
    ///
    /// Fails with [`ProtocolError::DecryptionFailure`] on key mismatch or a
    /// corrupted ciphertext.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.inner
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|_| ProtocolError::DecryptionFailure)
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print key material
        f.debug_struct("PrivateKey").finish_non_exhaustive()
    }
}

/// Public key: verification and encryption, plus DER transport for the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey {
    inner: RsaPublicKey,
}

impl PublicKey {
    /// Verify a detached signature over `data`.
    ///
    /// Returns `false` on any mismatch — the caller decides whether that is
    /// fatal.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let verifying_key = VerifyingKey::<Sha256>::new(self.inner.clone());
        let Ok(signature) = Signature::try_from(signature) else {
            return false;
        };
        verifying_key.verify(data, &signature).is_ok()
    }

    /// Encrypt `plaintext` as a single ciphertext.
    ///
    /// Fails with [`ProtocolError::EncryptionFailure`] if `plaintext` exceeds
    /// [`max_plaintext_len`](PublicKey::max_plaintext_len). There is no
    /// chunking: the ceiling is a hard protocol limit.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if plaintext.len() > self.max_plaintext_len() {
            return Err(ProtocolError::EncryptionFailure);
        }
        let mut rng = rand::rngs::OsRng;
        self.inner
            .encrypt(&mut rng, Pkcs1v15Encrypt, plaintext)
            .map_err(|_| ProtocolError::EncryptionFailure)
    }

    /// Largest plaintext this key can encrypt in one buffer.
    pub fn max_plaintext_len(&self) -> usize {
        self.inner.size().saturating_sub(PKCS1V15_OVERHEAD)
    }

    /// Encode as DER (SubjectPublicKeyInfo) for transmission.
    pub fn to_der(&self) -> Result<Vec<u8>> {
        let doc = self
            .inner
            .to_public_key_der()
            .map_err(|e| ProtocolError::Custom(format!("public key encoding failed: {e}")))?;
        Ok(doc.as_bytes().to_vec())
    }

    /// Decode from DER (SubjectPublicKeyInfo) received off the wire.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let inner = RsaPublicKey::from_public_key_der(der)
            .map_err(|e| ProtocolError::Custom(format!("public key decoding failed: {e}")))?;
        Ok(Self { inner })
    }
}
