use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::core::{PostingContainer, Tier, UrlHash, WordHash};
use crate::index::seq::{BoxedSeq, VecSeq};
use crate::index::{ContainerSource, RamTier};

/// 淘汰候选视图：策略据此挑选下一个被 flush 的 word。
#[derive(Clone, Copy, Debug)]
pub struct FlushCandidate {
    pub word: WordHash,
    pub entry_count: usize,
    /// 最近一次读/写的逻辑时刻（单调 tick，不是墙钟）
    pub last_access: u64,
}

/// 可插拔的淘汰候选策略。intern / extern 两层可以配不同启发式。
pub trait FlushPolicy: Send + Sync {
    fn pick(&self, candidates: &mut dyn Iterator<Item = FlushCandidate>) -> Option<WordHash>;
}

/// 最久未访问优先。
pub struct LruFirst;

impl FlushPolicy for LruFirst {
    fn pick(&self, candidates: &mut dyn Iterator<Item = FlushCandidate>) -> Option<WordHash> {
        candidates.min_by_key(|c| c.last_access).map(|c| c.word)
    }
}

/// 最大 container 优先；同大小时最久未访问者先走。
pub struct LargestFirst;

impl FlushPolicy for LargestFirst {
    fn pick(&self, candidates: &mut dyn Iterator<Item = FlushCandidate>) -> Option<WordHash> {
        candidates
            .max_by(|a, b| {
                a.entry_count
                    .cmp(&b.entry_count)
                    .then(b.last_access.cmp(&a.last_access))
            })
            .map(|c| c.word)
    }
}

struct TierInner {
    containers: BTreeMap<WordHash, PostingContainer>,
    /// posting 总条数，随插入/删除增量维护（避免每次求和）
    url_count: usize,
}

/// 有界内存层的参考实现。
///
/// container 表用一把 RwLock 保护；access tick 走 DashMap，读路径刷新
/// 热度时不争用表锁。
pub struct RamCache {
    tier: Tier,
    max_word_count: usize,
    inner: RwLock<TierInner>,
    access: DashMap<WordHash, u64>,
    tick: AtomicU64,
    policy: Box<dyn FlushPolicy>,
}

impl RamCache {
    pub fn new(tier: Tier, max_word_count: usize, policy: Box<dyn FlushPolicy>) -> Self {
        Self {
            tier,
            max_word_count,
            inner: RwLock::new(TierInner {
                containers: BTreeMap::new(),
                url_count: 0,
            }),
            access: DashMap::new(),
            tick: AtomicU64::new(0),
            policy,
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    fn touch(&self, word: WordHash) {
        let t = self.tick.fetch_add(1, Ordering::Relaxed);
        self.access.insert(word, t);
    }

    fn last_access(&self, word: &WordHash) -> u64 {
        self.access.get(word).map(|v| *v).unwrap_or(0)
    }
}

impl RamTier for RamCache {
    fn add(&self, mut container: PostingContainer, update_time: u64, _source: Tier) {
        let word = container.word();
        container.touch(update_time);

        let mut inner = self.inner.write();
        match inner.containers.get_mut(&word) {
            Some(existing) => {
                let added = existing.add_all_unique(&container);
                existing.touch(update_time);
                inner.url_count += added;
            }
            None => {
                inner.url_count += container.size();
                inner.containers.insert(word, container);
            }
        }
        drop(inner);
        self.touch(word);
    }

    fn max_word_count(&self) -> usize {
        self.max_word_count
    }

    fn best_flush_candidate(&self) -> Option<WordHash> {
        let inner = self.inner.read();
        let mut candidates = inner.containers.iter().map(|(word, c)| FlushCandidate {
            word: *word,
            entry_count: c.size(),
            last_access: self.last_access(word),
        });
        self.policy.pick(&mut candidates)
    }

    fn cached_url_count(&self) -> usize {
        self.inner.read().url_count
    }
}

impl ContainerSource for RamCache {
    fn get_container(
        &self,
        word: &WordHash,
        url_filter: Option<&HashSet<UrlHash>>,
        _max_time_millis: i64,
    ) -> Option<PostingContainer> {
        let inner = self.inner.read();
        let c = inner.containers.get(word)?;
        let result = match url_filter {
            Some(filter) => c.filtered(filter),
            None => c.clone(),
        };
        drop(inner);
        self.touch(*word);
        Some(result)
    }

    fn has_container(&self, word: &WordHash) -> bool {
        self.inner.read().containers.contains_key(word)
    }

    fn index_size(&self, word: &WordHash) -> usize {
        self.inner
            .read()
            .containers
            .get(word)
            .map(|c| c.size())
            .unwrap_or(0)
    }

    fn size(&self) -> usize {
        self.inner.read().containers.len()
    }

    fn delete_container(&self, word: &WordHash) -> Option<PostingContainer> {
        let mut inner = self.inner.write();
        let c = inner.containers.remove(word)?;
        inner.url_count -= c.size();
        drop(inner);
        self.access.remove(word);
        Some(c)
    }

    fn remove_entry(&self, word: &WordHash, url: &UrlHash) -> bool {
        let mut inner = self.inner.write();
        let Some(c) = inner.containers.get_mut(word) else {
            return false;
        };
        if !c.remove(url) {
            return false;
        }
        inner.url_count -= 1;
        // 空 container 不留：word 计数保持可信
        if inner.containers.get(word).is_some_and(|c| c.is_empty()) {
            inner.containers.remove(word);
            drop(inner);
            self.access.remove(word);
        }
        true
    }

    fn remove_entries(&self, word: &WordHash, urls: &HashSet<UrlHash>) -> usize {
        let mut inner = self.inner.write();
        let Some(c) = inner.containers.get_mut(word) else {
            return 0;
        };
        let removed = c.remove_many(urls);
        inner.url_count -= removed;
        if inner.containers.get(word).is_some_and(|c| c.is_empty()) {
            inner.containers.remove(word);
            drop(inner);
            self.access.remove(word);
        }
        removed
    }

    fn ordered_containers(&self, start: Option<WordHash>) -> BoxedSeq {
        // 冻结快照：BTreeMap 迭代即基础序
        let items: Vec<PostingContainer> =
            self.inner.read().containers.values().cloned().collect();
        Box::new(VecSeq::new(Arc::new(items), start))
    }

    fn close(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.write();
        tracing::debug!(
            "Closing {} tier: {} words, {} postings",
            self.tier.label(),
            inner.containers.len(),
            inner.url_count
        );
        inner.containers.clear();
        inner.url_count = 0;
        self.access.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::HASH_LEN;
    use crate::core::PostingEntry;

    fn h(first: u8) -> WordHash {
        let mut b = [0u8; HASH_LEN];
        b[0] = first;
        WordHash::from_bytes(b)
    }

    fn container(first: u8, urls: &[&str]) -> PostingContainer {
        PostingContainer::with_entries(
            h(first),
            urls.iter()
                .map(|u| PostingEntry::new(UrlHash::of(u), u.as_bytes().to_vec())),
            0,
        )
    }

    fn lru_cache(max: usize) -> RamCache {
        RamCache::new(Tier::Extern, max, Box::new(LruFirst))
    }

    #[test]
    fn add_merges_without_overwriting() {
        let cache = lru_cache(10);
        let url = UrlHash::of("u1");
        let mut first = PostingContainer::new(h(1));
        first.insert(PostingEntry::new(url, b"first".to_vec()));
        let mut second = PostingContainer::new(h(1));
        second.insert(PostingEntry::new(url, b"second".to_vec()));
        second.insert(PostingEntry::new(UrlHash::of("u2"), b"x".to_vec()));

        cache.add(first, 10, Tier::Extern);
        cache.add(second, 20, Tier::Extern);

        let c = cache.get_container(&h(1), None, -1).unwrap();
        assert_eq!(c.get(&url), Some(b"first".as_slice()));
        assert_eq!(c.size(), 2);
        assert_eq!(c.updated(), 20);
        assert_eq!(cache.size(), 1);
        assert_eq!(cache.cached_url_count(), 2);
    }

    #[test]
    fn lru_policy_picks_least_recently_touched() {
        let cache = lru_cache(10);
        cache.add(container(1, &["a"]), 0, Tier::Extern);
        cache.add(container(2, &["b"]), 0, Tier::Extern);
        cache.add(container(3, &["c"]), 0, Tier::Extern);

        // 读 word1 / word3，word2 变为最冷
        cache.get_container(&h(1), None, -1);
        cache.get_container(&h(3), None, -1);

        assert_eq!(cache.best_flush_candidate(), Some(h(2)));
    }

    #[test]
    fn largest_first_policy_picks_biggest_container() {
        let cache = RamCache::new(Tier::Intern, 10, Box::new(LargestFirst));
        cache.add(container(1, &["a"]), 0, Tier::Intern);
        cache.add(container(2, &["b", "c", "d"]), 0, Tier::Intern);
        cache.add(container(3, &["e", "f"]), 0, Tier::Intern);

        assert_eq!(cache.best_flush_candidate(), Some(h(2)));
    }

    #[test]
    fn best_candidate_on_empty_tier_is_none() {
        assert!(lru_cache(10).best_flush_candidate().is_none());
    }

    #[test]
    fn remove_entry_drops_emptied_container() {
        let cache = lru_cache(10);
        cache.add(container(1, &["only"]), 0, Tier::Extern);

        assert!(cache.remove_entry(&h(1), &UrlHash::of("only")));
        assert!(!cache.has_container(&h(1)));
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.cached_url_count(), 0);
        // 幂等：再删是 no-op
        assert!(!cache.remove_entry(&h(1), &UrlHash::of("only")));
    }

    #[test]
    fn remove_entries_returns_removed_count() {
        let cache = lru_cache(10);
        cache.add(container(1, &["a", "b", "c"]), 0, Tier::Extern);
        let victims: HashSet<UrlHash> =
            [UrlHash::of("a"), UrlHash::of("ghost")].into_iter().collect();
        assert_eq!(cache.remove_entries(&h(1), &victims), 1);
        assert_eq!(cache.cached_url_count(), 2);
    }

    #[test]
    fn delete_container_returns_it_and_updates_counts() {
        let cache = lru_cache(10);
        cache.add(container(5, &["a", "b"]), 0, Tier::Extern);
        let c = cache.delete_container(&h(5)).unwrap();
        assert_eq!(c.size(), 2);
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.cached_url_count(), 0);
        assert!(cache.delete_container(&h(5)).is_none());
    }

    #[test]
    fn ordered_containers_is_sorted_and_restartable() {
        let cache = lru_cache(10);
        cache.add(container(7, &["a"]), 0, Tier::Extern);
        cache.add(container(2, &["b"]), 0, Tier::Extern);
        cache.add(container(5, &["c"]), 0, Tier::Extern);

        let seq = cache.ordered_containers(Some(h(3)));
        let words: Vec<u8> = seq.map(|c| c.word().as_bytes()[0]).collect();
        assert_eq!(words, vec![5, 7]);

        let full = cache.ordered_containers(None);
        let words: Vec<u8> = full.map(|c| c.word().as_bytes()[0]).collect();
        assert_eq!(words, vec![2, 5, 7]);
    }

    #[test]
    fn url_filter_narrows_result() {
        let cache = lru_cache(10);
        cache.add(container(1, &["a", "b"]), 0, Tier::Extern);
        let keep: HashSet<UrlHash> = [UrlHash::of("b")].into_iter().collect();
        let c = cache.get_container(&h(1), Some(&keep), -1).unwrap();
        assert_eq!(c.size(), 1);
        assert!(c.contains(&UrlHash::of("b")));
    }
}
