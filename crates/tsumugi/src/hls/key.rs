use base64::{engine::general_purpose::STANDARD, Engine};
use url::Url;

use crate::{
    error::{TsumugiError, TsumugiResult},
    util::http::HttpClient,
};

/// Fetch an `EXT-X-KEY` URI and decode it into a raw AES-128 key.
pub async fn fetch_key(client: &HttpClient, url: Url) -> TsumugiResult<[u8; 16]> {
    tracing::debug!("Fetching key from {url}");
    let data = client.fetch(url, None).await?;
    decode_key(&data)
}

/// Accepts 16 raw bytes, 32 hex characters or base64 of 16 bytes.
pub fn decode_key(data: &[u8]) -> TsumugiResult<[u8; 16]> {
    if let Ok(key) = <[u8; 16]>::try_from(data) {
        return Ok(key);
    }

    let text = String::from_utf8_lossy(data);
    let text = text.trim();
    let decoded = if text.len() == 32 && text.chars().all(|c| c.is_ascii_hexdigit()) {
        hex::decode(text)?
    } else {
        STANDARD
            .decode(text)
            .map_err(|_| TsumugiError::InvalidAesKey(data.to_vec()))?
    };

    decoded
        .try_into()
        .map_err(|_| TsumugiError::InvalidAesKey(data.to_vec()))
}

/// Parse an `IV` attribute, with or without the `0x` prefix.
pub fn parse_iv(iv: &str) -> TsumugiResult<[u8; 16]> {
    let iv = iv.trim();
    let digits = iv
        .strip_prefix("0x")
        .or_else(|| iv.strip_prefix("0X"))
        .unwrap_or(iv);

    u128::from_str_radix(digits, 16)
        .map(u128::to_be_bytes)
        .map_err(|_| TsumugiError::DecryptionError(format!("invalid IV: {iv}")))
}

/// IV used when the key tag has none: the media sequence as a big-endian
/// 128-bit integer.
pub fn sequence_iv(sequence: u64) -> [u8; 16] {
    (sequence as u128).to_be_bytes()
}
