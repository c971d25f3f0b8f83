use crate::error::{Result, TunnelError};
use openssl::rand::rand_bytes;
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher as SymmCipher};
use std::fmt;

/// 对称密钥长度（AES-256）
pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// 伪装层的可选加密
///
/// `aad` 是伪装 TCP 首部的前 12 字节（端口、序列号、确认号）
pub trait Cipher: Send + Sync + fmt::Debug {
    /// 密文相对明文多出的字节数
    fn overhead(&self) -> usize;

    fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>;

    /// 认证失败返回临时错误，调用方丢弃该帧即可
    fn open(&self, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>>;
}

/// AES-256-GCM，线上格式 `[nonce:12][ciphertext][tag:16]`
pub struct AesGcmCipher {
    key: [u8; KEY_LEN],
}

impl AesGcmCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] = key.try_into().map_err(|_| {
            TunnelError::tls(format!("key must be {} bytes, got {}", KEY_LEN, key.len()))
        })?;
        Ok(Self { key })
    }

    /// 生成随机密钥
    pub fn generate_key() -> Result<[u8; KEY_LEN]> {
        let mut key = [0u8; KEY_LEN];
        rand_bytes(&mut key).map_err(|e| TunnelError::tls(e.to_string()))?;
        Ok(key)
    }
}

impl fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesGcmCipher").finish_non_exhaustive()
    }
}

impl Cipher for AesGcmCipher {
    fn overhead(&self) -> usize {
        NONCE_LEN + TAG_LEN
    }

    fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand_bytes(&mut nonce).map_err(|e| TunnelError::tls(e.to_string()))?;

        let mut tag = [0u8; TAG_LEN];
        let ciphertext = encrypt_aead(
            SymmCipher::aes_256_gcm(),
            &self.key,
            Some(&nonce),
            aad,
            plaintext,
            &mut tag,
        )
        .map_err(|e| TunnelError::tls(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len() + TAG_LEN);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    fn open(&self, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(TunnelError::truncated(NONCE_LEN + TAG_LEN, sealed.len()));
        }
        let (nonce, rest) = sealed.split_at(NONCE_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
        decrypt_aead(
            SymmCipher::aes_256_gcm(),
            &self.key,
            Some(nonce),
            aad,
            ciphertext,
            tag,
        )
        .map_err(|_| TunnelError::temporary("frame authentication failed"))
    }
}
