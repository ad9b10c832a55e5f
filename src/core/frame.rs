//! Wire frame codec: length-prefixed, optionally signed and encrypted frames.
//!
//! Wire format (network byte order):
//!
//! ```text
//! [length:4][opcode:1]{signature block}{payload}
//! signature block (optional) = [sigLen:2][sig bytes]
//! ```
//!
//! `length` counts every byte after itself. A `length == 0` frame is a
//! keep-alive and carries no opcode or payload. When a frame is encrypted,
//! `{signature block}{payload}` is replaced on the wire by a single
//! ciphertext of the same logical content.
//!
//! Build order is fixed: `append*` → [`sign`] → [`encrypt`] →
//! [`prepend_opcode`] → [`build`]. Reading mirrors it: length, opcode,
//! [`decrypt`] (before any signature handling), [`verify_signature`], then
//! field reads. Signing before encryption is a protocol constant; reversing
//! it breaks interoperability.
//!
//! [`sign`]: FrameBuilder::sign
//! [`encrypt`]: FrameBuilder::encrypt
//! [`prepend_opcode`]: FrameBuilder::prepend_opcode
//! [`build`]: FrameBuilder::build
//! [`decrypt`]: FrameReader::decrypt
//! [`verify_signature`]: FrameReader::verify_signature

use crate::error::{constants, ProtocolError, Result};
use crate::utils::crypto::{PrivateKey, PublicKey};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length prefix preceding every frame.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the opcode field.
pub const OPCODE_SIZE: usize = 1;

/// Size of the signature-length field inside a signature block.
pub const SIGNATURE_LENGTH_SIZE: usize = 2;

/// Incrementally builds one frame.
///
/// Field encoding is agnostic to security policy: any packet type composes
/// authentication and confidentiality independently by choosing which of
/// [`sign`](Self::sign) and [`encrypt`](Self::encrypt) to call.
#[derive(Debug, Default)]
pub struct FrameBuilder {
    body: BytesMut,
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self {
            body: BytesMut::new(),
        }
    }

    /// Append an unsigned integer at a fixed width (1, 2, 4 or 8 bytes),
    /// network byte order.
    ///
    /// Fails with [`ProtocolError::InvalidWidth`] when the width is not one
    /// of the supported sizes or the value does not fit in it.
    pub fn append_uint(&mut self, value: u64, width: usize) -> Result<&mut Self> {
        if !matches!(width, 1 | 2 | 4 | 8) {
            return Err(ProtocolError::InvalidWidth { value, width });
        }
        if width < 8 && value >= 1u64 << (8 * width) {
            return Err(ProtocolError::InvalidWidth { value, width });
        }
        let be = value.to_be_bytes();
        self.body.put_slice(&be[8 - width..]);
        Ok(self)
    }

    /// Append a raw byte run.
    pub fn append_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.body.put_slice(data);
        self
    }

    /// Sign everything appended so far and prepend the signature block
    /// (`sigLen(2) + sig`) ahead of it.
    ///
    /// Legal with an empty buffer: the signature then covers an empty
    /// sequence, and the block is still written.
    pub fn sign(&mut self, key: &PrivateKey) -> Result<&mut Self> {
        let signature = key.sign(&self.body)?;
        let mut framed =
            BytesMut::with_capacity(SIGNATURE_LENGTH_SIZE + signature.len() + self.body.len());
        framed.put_u16(signature.len() as u16);
        framed.put_slice(&signature);
        framed.extend_from_slice(&self.body);
        self.body = framed;
        Ok(self)
    }

    /// Encrypt the current contents (signature block and payload, or payload
    /// alone) as one ciphertext for the recipient.
    ///
    /// Whole-buffer asymmetric encryption: fails with
    /// [`ProtocolError::EncryptionFailure`] when the buffer exceeds the
    /// recipient key's capacity. There is no chunking.
    pub fn encrypt(&mut self, key: &PublicKey) -> Result<&mut Self> {
        let ciphertext = key.encrypt(&self.body)?;
        self.body = BytesMut::from(&ciphertext[..]);
        Ok(self)
    }

    /// Insert the opcode ahead of the (possibly signed/encrypted) buffer.
    pub fn prepend_opcode(&mut self, opcode: u8) -> &mut Self {
        let mut framed = BytesMut::with_capacity(OPCODE_SIZE + self.body.len());
        framed.put_u8(opcode);
        framed.extend_from_slice(&self.body);
        self.body = framed;
        self
    }

    /// Finalize: emit `[length][everything built so far]`.
    pub fn build(self) -> Bytes {
        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + self.body.len());
        frame.put_u32(self.body.len() as u32);
        frame.extend_from_slice(&self.body);
        frame.freeze()
    }

    /// The zero-length keep-alive frame.
    pub fn keep_alive() -> Bytes {
        Bytes::from_static(&[0u8; LENGTH_PREFIX_SIZE])
    }
}

/// Reads one frame, mirroring the builder step by step.
#[derive(Debug)]
pub struct FrameReader {
    buf: Bytes,
}

impl FrameReader {
    /// Wrap frame bytes. Accepts either a full frame (call
    /// [`read_u32`](Self::read_u32) first for the prefix) or a reassembled
    /// body with the prefix already stripped.
    pub fn new(frame: impl Into<Bytes>) -> Self {
        Self { buf: frame.into() }
    }

    fn take(&mut self, n: usize) -> Result<Bytes> {
        if self.buf.len() < n {
            return Err(ProtocolError::TruncatedFrame);
        }
        Ok(self.buf.split_to(n))
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(self.take(2)?.get_u16())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(self.take(4)?.get_u32())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(self.take(8)?.get_u64())
    }

    /// Read a raw byte run of exactly `n` bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes> {
        self.take(n)
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Cheap handle on everything not yet consumed, without advancing.
    pub fn remaining_bytes(&self) -> Bytes {
        self.buf.clone()
    }

    /// Decrypt everything not yet consumed, replacing it with the recovered
    /// plaintext (signature block and payload, or payload alone).
    ///
    /// Must run before [`verify_signature`](Self::verify_signature): frames
    /// are signed before they are encrypted.
    pub fn decrypt(&mut self, key: &PrivateKey) -> Result<&mut Self> {
        let plaintext = key.decrypt(&self.buf)?;
        self.buf = Bytes::from(plaintext);
        Ok(self)
    }

    /// Consume the signature block and verify it over the payload bytes that
    /// follow.
    ///
    /// Returns `Ok(false)` on mismatch — not an error; the caller decides
    /// whether mismatch is fatal. Errors only on a structurally malformed
    /// block.
    pub fn verify_signature(&mut self, key: &PublicKey) -> Result<bool> {
        let sig_len = self.read_u16()? as usize;
        if self.buf.len() < sig_len {
            return Err(ProtocolError::Custom(
                constants::ERR_MALFORMED_SIGNATURE_BLOCK.into(),
            ));
        }
        let signature = self.take(sig_len)?;
        Ok(key.verify(&self.buf, &signature))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn plain_frame_has_exact_layout() {
        let mut pb = FrameBuilder::new();
        pb.append_uint(0x1234, 2).unwrap();
        pb.append_uint(0xABCDE, 4).unwrap();
        let frame = pb.build();

        let expected = [
            0, 0, 0, 6, // length
            0x12, 0x34, // first field
            0x00, 0x0A, 0xBC, 0xDE, // second field
        ];
        assert_eq!(&frame[..], &expected[..]);
    }

    #[test]
    fn length_prefix_counts_bytes_after_itself() {
        // widths summing to 1 + 2 + 4 + 8 + 3 raw = 18
        let mut pb = FrameBuilder::new();
        pb.append_uint(7, 1).unwrap();
        pb.append_uint(0xFFFF, 2).unwrap();
        pb.append_uint(u32::MAX as u64, 4).unwrap();
        pb.append_uint(u64::MAX, 8).unwrap();
        pb.append_bytes(&[1, 2, 3]);
        let frame = pb.build();

        let mut pr = FrameReader::new(frame.clone());
        let prefix = pr.read_u32().unwrap() as usize;
        assert_eq!(prefix, frame.len() - LENGTH_PREFIX_SIZE);
        assert_eq!(prefix, 18);
    }

    #[test]
    fn invalid_widths_are_rejected() {
        let mut pb = FrameBuilder::new();
        assert!(matches!(
            pb.append_uint(0x100, 1),
            Err(ProtocolError::InvalidWidth { value: 0x100, width: 1 })
        ));
        assert!(matches!(
            pb.append_uint(5, 3),
            Err(ProtocolError::InvalidWidth { .. })
        ));
        assert!(matches!(
            pb.append_uint(0x1_0000_0000, 4),
            Err(ProtocolError::InvalidWidth { .. })
        ));
    }

    #[test]
    fn signed_frame_roundtrip() {
        let private = PrivateKey::random().unwrap();
        let public = private.to_public_key();

        let mut pb = FrameBuilder::new();
        pb.append_uint(0x1234, 2).unwrap();
        pb.append_uint(0xABCDE, 4).unwrap();
        pb.sign(&private).unwrap();
        pb.prepend_opcode(0x03);
        let built = pb.build();

        let mut pr = FrameReader::new(built.clone());
        let prefix = pr.read_u32().unwrap() as usize;
        assert_eq!(prefix, built.len() - LENGTH_PREFIX_SIZE);
        assert_eq!(pr.read_u8().unwrap(), 0x03);
        assert!(pr.verify_signature(&public).unwrap());
        assert_eq!(&pr.read_bytes(6).unwrap()[..], &[0x12, 0x34, 0x00, 0x0A, 0xBC, 0xDE]);
    }

    #[test]
    fn signed_frame_structural_layout() {
        let private = PrivateKey::random().unwrap();

        let mut pb = FrameBuilder::new();
        pb.append_uint(0x1234, 2).unwrap();
        pb.append_uint(0xABCDE, 4).unwrap();
        pb.sign(&private).unwrap();
        pb.prepend_opcode(0x03);
        let built = pb.build();

        let mut pr = FrameReader::new(built);
        let prefix = pr.read_u32().unwrap() as usize;
        assert_eq!(pr.read_u8().unwrap(), 0x03);
        let sig_len = pr.read_u16().unwrap() as usize;
        let _sig = pr.read_bytes(sig_len).unwrap();
        // opcode + sigLen field + signature + 6 payload bytes
        assert_eq!(prefix, OPCODE_SIZE + SIGNATURE_LENGTH_SIZE + sig_len + 6);
        assert_eq!(pr.remaining(), 6);
    }

    #[test]
    fn verify_with_wrong_key_returns_false() {
        let private = PrivateKey::random().unwrap();
        let other = PrivateKey::random().unwrap().to_public_key();

        let mut pb = FrameBuilder::new();
        pb.append_uint(0x1234, 2).unwrap();
        pb.sign(&private).unwrap();
        let built = pb.build();

        let mut pr = FrameReader::new(built);
        pr.read_u32().unwrap();
        assert!(!pr.verify_signature(&other).unwrap());
        // mismatch is not fatal: field reads still proceed
        assert_eq!(pr.read_u16().unwrap(), 0x1234);
    }

    #[test]
    fn encrypted_frame_roundtrip() {
        let private = PrivateKey::random().unwrap();
        let public = private.to_public_key();

        let mut pb = FrameBuilder::new();
        pb.append_uint(0x1234, 2).unwrap();
        pb.append_uint(0xABCDE, 4).unwrap();
        pb.encrypt(&public).unwrap();
        pb.prepend_opcode(0x03);
        let built = pb.build();

        let mut pr = FrameReader::new(built);
        pr.read_u32().unwrap();
        assert_eq!(pr.read_u8().unwrap(), 0x03);
        pr.decrypt(&private).unwrap();
        assert_eq!(&pr.read_bytes(6).unwrap()[..], &[0x12, 0x34, 0x00, 0x0A, 0xBC, 0xDE]);
        assert_eq!(pr.remaining(), 0);
    }

    #[test]
    fn signed_then_encrypted_frame_roundtrip() {
        // the recipient key must be large enough to take the signature
        // block and payload in one ciphertext
        let receiver = PrivateKey::random_with_bits(3072).unwrap();
        let sender = PrivateKey::random().unwrap();

        let mut pb = FrameBuilder::new();
        pb.append_uint(0x1234, 2).unwrap();
        pb.append_uint(0xABCDE, 4).unwrap();
        pb.sign(&sender).unwrap();
        pb.encrypt(&receiver.to_public_key()).unwrap();
        pb.prepend_opcode(0x03);
        let built = pb.build();

        let mut pr = FrameReader::new(built);
        pr.read_u32().unwrap();
        assert_eq!(pr.read_u8().unwrap(), 0x03);
        // decrypt must come first: the signature block is inside the ciphertext
        pr.decrypt(&receiver).unwrap();
        assert!(pr.verify_signature(&sender.to_public_key()).unwrap());
        assert_eq!(&pr.read_bytes(6).unwrap()[..], &[0x12, 0x34, 0x00, 0x0A, 0xBC, 0xDE]);
    }

    #[test]
    fn sign_without_payload_still_writes_block() {
        let private = PrivateKey::random().unwrap();
        let public = private.to_public_key();

        let mut pb = FrameBuilder::new();
        pb.sign(&private).unwrap();
        let built = pb.build();

        let mut pr = FrameReader::new(built.clone());
        pr.read_u32().unwrap();
        assert!(pr.verify_signature(&public).unwrap());

        let mut pr = FrameReader::new(built);
        pr.read_u32().unwrap();
        let sig_len = pr.read_u16().unwrap() as usize;
        assert!(sig_len > 0);
        assert_eq!(pr.read_bytes(sig_len).unwrap().len(), sig_len);
        assert_eq!(pr.remaining(), 0);
    }

    #[test]
    fn oversized_plaintext_fails_encryption() {
        let public = PrivateKey::random().unwrap().to_public_key();
        let mut pb = FrameBuilder::new();
        pb.append_bytes(&vec![0u8; public.max_plaintext_len() + 1]);
        assert!(matches!(
            pb.encrypt(&public),
            Err(ProtocolError::EncryptionFailure)
        ));
    }

    #[test]
    fn keep_alive_is_four_zero_bytes() {
        assert_eq!(&FrameBuilder::keep_alive()[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn truncated_reads_error() {
        let mut pr = FrameReader::new(Bytes::from_static(&[1, 2]));
        assert!(matches!(pr.read_u32(), Err(ProtocolError::TruncatedFrame)));
    }
}
