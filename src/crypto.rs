//! AES-128-CTR frame cipher
//!
//! Each frame is encrypted with a fresh CTR instance whose initial counter
//! block is the frame header, so ciphertext length always equals plaintext
//! length and no padding is involved.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;
use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::{FRAME_HEADER_SIZE, SESSION_KEY_SIZE};
use crate::error::CryptoError;
use crate::protocol::FrameHeader;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Session cipher context (key installed once per handshake)
#[derive(Clone)]
pub struct FrameCipher {
    key: [u8; SESSION_KEY_SIZE],
}

impl FrameCipher {
    pub fn new(key: [u8; SESSION_KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Create from an arbitrary slice, rejecting anything but 16 bytes
    pub fn from_slice(key: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; SESSION_KEY_SIZE] = key.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self::new(key))
    }

    /// XOR `data` with the keystream starting at counter block `nonce`
    pub fn apply_keystream(
        &self,
        nonce: &[u8; FRAME_HEADER_SIZE],
        data: &mut [u8],
    ) -> Result<(), CryptoError> {
        let mut cipher = Aes128Ctr::new(&self.key.into(), &(*nonce).into());
        cipher
            .try_apply_keystream(data)
            .map_err(|_| CryptoError::Keystream)
    }

    /// Produce `header || ciphertext`
    pub fn seal(&self, header: &FrameHeader, plaintext: &[u8]) -> Result<Bytes, CryptoError> {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + plaintext.len());
        buf.put_slice(header.as_bytes());
        buf.put_slice(plaintext);

        self.apply_keystream(header.as_bytes(), &mut buf[FRAME_HEADER_SIZE..])?;
        Ok(buf.freeze())
    }

    /// Decrypt the bytes following `header`
    pub fn open(&self, header: &FrameHeader, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut plaintext = ciphertext.to_vec();
        self.apply_keystream(header.as_bytes(), &mut plaintext)?;
        Ok(plaintext)
    }
}

impl std::fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KEY: [u8; 16] = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77,
        0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF,
    ];
    const TEMPLATE: [u8; 16] = [
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08,
        0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10,
    ];

    #[test]
    fn test_seal_open_loopback_lengths() {
        let cipher = FrameCipher::new(KEY);

        for len in [0usize, 1, 960, 65_000] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let header = FrameHeader::new(&TEMPLATE, len, 7).unwrap();

            let sealed = cipher.seal(&header, &plaintext).unwrap();
            assert_eq!(sealed.len(), FRAME_HEADER_SIZE + len);
            assert_eq!(&sealed[..FRAME_HEADER_SIZE], header.as_bytes());

            let opened = cipher.open(&header, &sealed[FRAME_HEADER_SIZE..]).unwrap();
            assert_eq!(opened, plaintext);
        }
    }

    #[test]
    fn test_ciphertext_differs_per_sequence() {
        let cipher = FrameCipher::new(KEY);
        let plaintext = [0u8; 32];

        let a = cipher.seal(&FrameHeader::new(&TEMPLATE, 32, 1).unwrap(), &plaintext).unwrap();
        let b = cipher.seal(&FrameHeader::new(&TEMPLATE, 32, 2).unwrap(), &plaintext).unwrap();
        assert_ne!(&a[FRAME_HEADER_SIZE..], &b[FRAME_HEADER_SIZE..]);
    }

    #[test]
    fn test_known_keystream_block() {
        // first keystream block is AES_k(nonce)
        use aes::cipher::{BlockEncrypt, KeyInit};

        let cipher = FrameCipher::new(KEY);
        let mut data = [0u8; 16];
        cipher.apply_keystream(&TEMPLATE, &mut data).unwrap();

        let block_cipher = Aes128::new(&KEY.into());
        let mut block = aes::Block::from(TEMPLATE);
        block_cipher.encrypt_block(&mut block);
        assert_eq!(data.as_slice(), block.as_slice());
    }

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        assert!(FrameCipher::from_slice(&[0u8; 15]).is_err());
        assert!(FrameCipher::from_slice(&[0u8; 32]).is_err());
        assert!(FrameCipher::from_slice(&KEY).is_ok());
    }

    proptest! {
        #[test]
        fn prop_open_inverts_seal(
            key in any::<[u8; 16]>(),
            template in any::<[u8; 16]>(),
            sequence in any::<u32>(),
            payload in proptest::collection::vec(any::<u8>(), 0..2048),
        ) {
            let cipher = FrameCipher::new(key);
            let header = FrameHeader::new(&template, payload.len(), sequence).unwrap();
            let sealed = cipher.seal(&header, &payload).unwrap();
            let opened = cipher.open(&header, &sealed[FRAME_HEADER_SIZE..]).unwrap();
            prop_assert_eq!(opened, payload);
        }
    }
}
