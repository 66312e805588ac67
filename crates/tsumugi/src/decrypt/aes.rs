use aes::{
    cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyInit, KeyIvInit, StreamCipher},
    Aes128,
};

use crate::{
    error::{TsumugiError, TsumugiResult},
    hls::key::sequence_iv,
    model::{EncryptionContext, EncryptionMethod},
};

type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes128EcbDec = ecb::Decryptor<Aes128>;
type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Decrypts whole HLS segments in memory.
#[derive(Clone)]
pub struct SegmentDecryptor {
    method: EncryptionMethod,
    key: [u8; 16],
    iv: Option<[u8; 16]>,
}

impl SegmentDecryptor {
    pub fn new(method: EncryptionMethod, key: [u8; 16], iv: Option<[u8; 16]>) -> Self {
        Self { method, key, iv }
    }

    /// `None` unless `context` is segment-level AES.
    pub fn from_context(context: &EncryptionContext) -> Option<Self> {
        match context {
            EncryptionContext::Aes { method, key, iv } if *method != EncryptionMethod::None => {
                Some(Self::new(*method, *key, *iv))
            }
            _ => None,
        }
    }

    pub fn method(&self) -> EncryptionMethod {
        self.method
    }

    /// Decrypt the payload of the segment with media sequence `sequence`.
    pub fn decrypt(&self, sequence: u64, data: &[u8]) -> TsumugiResult<Vec<u8>> {
        let iv = self.iv.unwrap_or_else(|| sequence_iv(sequence));
        let bad_padding = |_| {
            TsumugiError::DecryptionError(format!(
                "segment {sequence} has invalid padding, the key is probably wrong"
            ))
        };

        match self.method {
            EncryptionMethod::None => Ok(data.to_vec()),
            EncryptionMethod::Cbc => Aes128CbcDec::new(&self.key.into(), &iv.into())
                .decrypt_padded_vec_mut::<Pkcs7>(data)
                .map_err(bad_padding),
            EncryptionMethod::Ecb => Aes128EcbDec::new(&self.key.into())
                .decrypt_padded_vec_mut::<Pkcs7>(data)
                .map_err(bad_padding),
            EncryptionMethod::Ctr => {
                let mut buffer = data.to_vec();
                Aes128Ctr::new(&self.key.into(), &iv.into()).apply_keystream(&mut buffer);
                Ok(buffer)
            }
        }
    }
}
