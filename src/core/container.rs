use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::core::hash::{UrlHash, WordHash};

/// posting 的来源层：本机产出（intern）或对端推送（extern）。
/// 两层各自独立限额、独立淘汰策略。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tier {
    Intern,
    Extern,
}

impl Tier {
    pub fn label(self) -> &'static str {
        match self {
            Tier::Intern => "intern",
            Tier::Extern => "extern",
        }
    }
}

/// 单条 posting：文档 hash + 不透明的元数据负载。
/// container 内以 UrlHash 去重；payload 的二进制格式由上层定义，这里不解析。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingEntry {
    pub url: UrlHash,
    pub payload: Vec<u8>,
}

impl PostingEntry {
    pub fn new(url: UrlHash, payload: Vec<u8>) -> Self {
        Self { url, payload }
    }
}

/// 一个 word hash 下的 posting 列表。
///
/// 合并契约（`add_all_unique`）：只补充缺失的 UrlHash，绝不覆盖已有 entry；
/// `updated` 取两者较新值。查询路径按 extern → intern → backend 的顺序
/// 以该契约合并，因此先合并的来源对重复 key 胜出。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingContainer {
    word: WordHash,
    entries: BTreeMap<UrlHash, Vec<u8>>,
    updated: u64,
}

impl PostingContainer {
    pub fn new(word: WordHash) -> Self {
        Self {
            word,
            entries: BTreeMap::new(),
            updated: 0,
        }
    }

    pub fn with_entries(
        word: WordHash,
        entries: impl IntoIterator<Item = PostingEntry>,
        updated: u64,
    ) -> Self {
        let mut c = Self::new(word);
        for e in entries {
            c.insert(e);
        }
        c.updated = updated;
        c
    }

    pub fn word(&self) -> WordHash {
        self.word
    }

    pub fn updated(&self) -> u64 {
        self.updated
    }

    pub fn touch(&mut self, update_time: u64) {
        self.updated = self.updated.max(update_time);
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, url: &UrlHash) -> bool {
        self.entries.contains_key(url)
    }

    pub fn get(&self, url: &UrlHash) -> Option<&[u8]> {
        self.entries.get(url).map(|p| p.as_slice())
    }

    /// 插入一条 posting；已存在同 UrlHash 时保留旧值并返回 false。
    pub fn insert(&mut self, entry: PostingEntry) -> bool {
        use std::collections::btree_map::Entry;
        match self.entries.entry(entry.url) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(entry.payload);
                true
            }
        }
    }

    /// 吸收 `other` 中本 container 缺失的 entry；返回补充条数。
    /// 已有 entry 不被覆盖，`updated` 取较新者。
    pub fn add_all_unique(&mut self, other: &PostingContainer) -> usize {
        let mut added = 0;
        for (url, payload) in &other.entries {
            if !self.entries.contains_key(url) {
                self.entries.insert(*url, payload.clone());
                added += 1;
            }
        }
        self.updated = self.updated.max(other.updated);
        added
    }

    pub fn remove(&mut self, url: &UrlHash) -> bool {
        self.entries.remove(url).is_some()
    }

    pub fn remove_many(&mut self, urls: &HashSet<UrlHash>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|url, _| !urls.contains(url));
        before - self.entries.len()
    }

    /// 按 URL 选择集收窄后的副本；filter 只缩小范围，不改变合并优先级。
    pub fn filtered(&self, filter: &HashSet<UrlHash>) -> PostingContainer {
        let mut c = PostingContainer::new(self.word);
        c.updated = self.updated;
        for (url, payload) in &self.entries {
            if filter.contains(url) {
                c.entries.insert(*url, payload.clone());
            }
        }
        c
    }

    pub fn iter(&self) -> impl Iterator<Item = PostingEntry> + '_ {
        self.entries
            .iter()
            .map(|(url, payload)| PostingEntry::new(*url, payload.clone()))
    }

    pub fn urls(&self) -> impl Iterator<Item = &UrlHash> {
        self.entries.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(tag: &str) -> UrlHash {
        UrlHash::of(tag)
    }

    fn container(word: &str, entries: &[(&str, &[u8])], updated: u64) -> PostingContainer {
        PostingContainer::with_entries(
            WordHash::of(word),
            entries
                .iter()
                .map(|(u, p)| PostingEntry::new(url(u), p.to_vec())),
            updated,
        )
    }

    #[test]
    fn insert_never_overwrites() {
        let mut c = container("w", &[("u1", b"old")], 10);
        assert!(!c.insert(PostingEntry::new(url("u1"), b"new".to_vec())));
        assert_eq!(c.get(&url("u1")), Some(b"old".as_slice()));
        assert!(c.insert(PostingEntry::new(url("u2"), b"x".to_vec())));
        assert_eq!(c.size(), 2);
    }

    #[test]
    fn add_all_unique_keeps_existing_and_takes_newer_timestamp() {
        let mut a = container("w", &[("u1", b"a1")], 10);
        let b = container("w", &[("u1", b"b1"), ("u2", b"b2")], 42);

        assert_eq!(a.add_all_unique(&b), 1);
        assert_eq!(a.get(&url("u1")), Some(b"a1".as_slice()));
        assert_eq!(a.get(&url("u2")), Some(b"b2".as_slice()));
        assert_eq!(a.updated(), 42);

        // 反向合并不回退时间戳
        let mut b2 = b;
        b2.add_all_unique(&a);
        assert_eq!(b2.updated(), 42);
    }

    #[test]
    fn remove_many_counts_removed() {
        let mut c = container("w", &[("u1", b"1"), ("u2", b"2"), ("u3", b"3")], 0);
        let victims: HashSet<UrlHash> = [url("u1"), url("u3"), url("ghost")].into_iter().collect();
        assert_eq!(c.remove_many(&victims), 2);
        assert_eq!(c.size(), 1);
        assert!(c.contains(&url("u2")));
    }

    #[test]
    fn filtered_narrows_without_mutating() {
        let c = container("w", &[("u1", b"1"), ("u2", b"2")], 7);
        let keep: HashSet<UrlHash> = [url("u2")].into_iter().collect();
        let f = c.filtered(&keep);
        assert_eq!(f.size(), 1);
        assert!(f.contains(&url("u2")));
        assert_eq!(f.updated(), 7);
        assert_eq!(c.size(), 2);
    }
}
