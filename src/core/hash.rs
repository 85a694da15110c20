use std::fmt;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_128;

/// 定宽 hash 长度（字节）。word / URL 两种 key 统一使用同一宽度。
pub const HASH_LEN: usize = 12;

fn truncated_xxh3(data: &[u8]) -> [u8; HASH_LEN] {
    let wide = xxh3_128(data).to_be_bytes();
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&wide[..HASH_LEN]);
    out
}

fn fmt_hex(bytes: &[u8], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for b in bytes {
        write!(f, "{:02x}", b)?;
    }
    Ok(())
}

/// 索引词的定宽标识；派生的 `Ord` 即字节序基础全序。
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WordHash([u8; HASH_LEN]);

impl WordHash {
    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// 从原始词形派生（xxh3-128 截断）。
    pub fn of(term: &str) -> Self {
        Self(truncated_xxh3(term.as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Debug for WordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WordHash(")?;
        fmt_hex(&self.0, f)?;
        write!(f, ")")
    }
}

impl fmt::Display for WordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_hex(&self.0, f)
    }
}

/// 文档（URL）的定宽标识。
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UrlHash([u8; HASH_LEN]);

impl UrlHash {
    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn of(url: &str) -> Self {
        Self(truncated_xxh3(url.as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Debug for UrlHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UrlHash(")?;
        fmt_hex(&self.0, f)?;
        write!(f, ")")
    }
}

impl fmt::Display for UrlHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_hex(&self.0, f)
    }
}

/// 当前 Unix 时间（毫秒）。container 的 `updated` 时间戳统一用该刻度。
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_hash_is_stable_and_distinct() {
        assert_eq!(WordHash::of("plasma"), WordHash::of("plasma"));
        assert_ne!(WordHash::of("plasma"), WordHash::of("kelondro"));
    }

    #[test]
    fn ord_follows_byte_order() {
        let a = WordHash::from_bytes([0u8; HASH_LEN]);
        let mut high = [0u8; HASH_LEN];
        high[0] = 0xff;
        let b = WordHash::from_bytes(high);
        assert!(a < b);
    }

    #[test]
    fn display_is_hex() {
        let h = WordHash::from_bytes([0xab; HASH_LEN]);
        assert_eq!(h.to_string(), "ab".repeat(HASH_LEN));
    }
}
