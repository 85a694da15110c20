use std::path::Path;

use serde::Deserialize;

/// 缓存预算：两个内存层各自的词数上限 + 共享的 flush 批大小。
///
/// 每次 flush 的硬上限（5000）与 URL 数二级压力阈值（2048）是工程常数，
/// 见 `index::cached`，不进配置。
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheBudget {
    /// extern 层（对端推送）词数上限
    pub extern_max_words: usize,
    /// intern 层（本机产出）词数上限
    pub intern_max_words: usize,
    /// 每轮 flush 迁移的 container 数
    pub flush_batch_size: usize,
}

impl Default for CacheBudget {
    fn default() -> Self {
        Self {
            extern_max_words: 10_000,
            intern_max_words: 10_000,
            flush_batch_size: 2000,
        }
    }
}

impl CacheBudget {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_expectations() {
        let b = CacheBudget::default();
        assert_eq!(b.flush_batch_size, 2000);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let b = CacheBudget::from_toml_str("extern_max_words = 64\n").unwrap();
        assert_eq!(b.extern_max_words, 64);
        assert_eq!(b.intern_max_words, 10_000);
        assert_eq!(b.flush_batch_size, 2000);
    }

    #[test]
    fn garbage_toml_is_an_error() {
        assert!(CacheBudget::from_toml_str("extern_max_words = \"no\"").is_err());
    }
}
