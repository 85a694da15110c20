use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::core::{CacheBudget, PostingContainer, Tier, UrlHash, WordHash};
use crate::index::order::ContainerOrder;
use crate::index::ram::{LargestFirst, LruFirst, RamCache};
use crate::index::seq::{BoxedSeq, MergeSeq, RotateSeq};
use crate::index::{BackendStore, ContainerSource, RamTier};
use crate::stats::{CacheReport, TierStats};

/// 单次 flush 批次的硬上限（批缓冲分配失败视为致命，上限是唯一缓解）
const FLUSH_HARD_CAP: usize = 5000;
/// 层内 posting 总条数的二级压力阈值（与词数触发独立的泄压阀）
const URL_PRESSURE_LIMIT: usize = 2048;
/// 预算耗尽或剩余除数为零时的兜底单词时间预算（毫秒）
const FALLBACK_ALLOTMENT_MILLIS: i64 = 100;

/// flush 状态，原子可读；纯观测值，绝不用作同步手段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushState {
    Idle,
    Flushing,
}

/// 分层 posting 缓存引擎：两个有界内存层（intern / extern）+ 持久
/// collection store。
///
/// - 写入经 `add_entries` 按来源入层；extern 来量不受本机控制，入层即做
///   压力检查（`flush_control`）。
/// - 查询合并三个来源；重复 UrlHash 按 extern > intern > backend 取先到者。
/// - `control` 是引擎唯一互斥域：flush 批次（选取 → 摘除 → 批量落盘）与
///   close 在其内串行；其余读/删路径不与 flush 互斥，依赖各来源自身的
///   单操作线程安全。
pub struct CachedIndex {
    ri_extern: Arc<dyn RamTier>,
    ri_intern: Arc<dyn RamTier>,
    backend: Arc<dyn BackendStore>,
    order: ContainerOrder,
    flush_batch_size: AtomicUsize,
    /// 仅在 flush 批次执行期间为 true（观测用）
    busy_cache_flush: AtomicBool,
    control: Mutex<()>,
    flush_requested: AtomicBool,
    flush_notify: Notify,
}

impl CachedIndex {
    pub fn new(
        ri_extern: Arc<dyn RamTier>,
        ri_intern: Arc<dyn RamTier>,
        backend: Arc<dyn BackendStore>,
        flush_batch_size: usize,
    ) -> Self {
        Self {
            ri_extern,
            ri_intern,
            backend,
            order: ContainerOrder::new(),
            flush_batch_size: AtomicUsize::new(flush_batch_size),
            busy_cache_flush: AtomicBool::new(false),
            control: Mutex::new(()),
            flush_requested: AtomicBool::new(false),
            flush_notify: Notify::new(),
        }
    }

    /// 按预算组装默认层：extern 用 LRU（对端流量访问局部性强），
    /// intern 用最大 container 优先（尽快腾出大块内存）。
    pub fn with_budget(budget: &CacheBudget, backend: Arc<dyn BackendStore>) -> Self {
        let ri_extern = Arc::new(RamCache::new(
            Tier::Extern,
            budget.extern_max_words,
            Box::new(LruFirst),
        ));
        let ri_intern = Arc::new(RamCache::new(
            Tier::Intern,
            budget.intern_max_words,
            Box::new(LargestFirst),
        ));
        Self::new(ri_extern, ri_intern, backend, budget.flush_batch_size)
    }

    fn tier(&self, tier: Tier) -> &Arc<dyn RamTier> {
        match tier {
            Tier::Extern => &self.ri_extern,
            Tier::Intern => &self.ri_intern,
        }
    }

    pub fn set_flush_batch_size(&self, n: usize) {
        self.flush_batch_size.store(n, Ordering::Relaxed);
    }

    pub fn flush_state(&self) -> FlushState {
        if self.busy_cache_flush.load(Ordering::Acquire) {
            FlushState::Flushing
        } else {
            FlushState::Idle
        }
    }

    /// 合入一个 container。intern 走本机可控路径，不做压力检查；
    /// extern 来自对端、量不可控，入层后同步跑一次 `flush_control`，
    /// URL 压力则合并触发维护循环。
    pub fn add_entries(
        &self,
        container: PostingContainer,
        update_time: u64,
        source: Tier,
    ) -> anyhow::Result<()> {
        match source {
            Tier::Intern => {
                self.ri_intern.add(container, update_time, Tier::Intern);
                Ok(())
            }
            Tier::Extern => {
                self.ri_extern.add(container, update_time, Tier::Extern);
                self.flush_control()?;
                if self.ri_extern.cached_url_count() > URL_PRESSURE_LIMIT {
                    self.request_flush();
                }
                Ok(())
            }
        }
    }

    /// 压力检查：两层独立判断，但在同一临界区内完成，避免与并发
    /// flush / close 交织。
    pub fn flush_control(&self) -> anyhow::Result<()> {
        let _g = self.control.lock();
        let flush = self.flush_batch_size.load(Ordering::Relaxed);
        for tier in [&self.ri_extern, &self.ri_intern] {
            if tier.size() > tier.max_word_count() {
                let overflow = tier.size() + flush - tier.max_word_count();
                self.flush_cache_locked(tier.as_ref(), overflow)?;
            }
        }
        Ok(())
    }

    /// 把至多 `count` 个 container 从指定层迁入 backend。
    pub fn flush_cache(&self, tier: Tier, count: usize) -> anyhow::Result<()> {
        let _g = self.control.lock();
        self.flush_cache_locked(self.tier(tier).as_ref(), count)
    }

    /// 必须已持有 `control` 锁。选取 → 摘除 → 单次批量写，对其他 flush /
    /// close 原子；层被掏空则提前结束。
    fn flush_cache_locked(&self, ram: &dyn RamTier, count: usize) -> anyhow::Result<()> {
        if count == 0 {
            return Ok(());
        }
        let count = count.min(FLUSH_HARD_CAP);

        self.busy_cache_flush.store(true, Ordering::Release);
        let mut batch = Vec::with_capacity(count.min(ram.size()));
        for _ in 0..count {
            if ram.size() == 0 {
                break;
            }
            let Some(word) = ram.best_flush_candidate() else {
                break;
            };
            if let Some(c) = ram.delete_container(&word) {
                batch.push(c);
            }
        }
        let flushed = batch.len();
        let result = if batch.is_empty() {
            Ok(())
        } else {
            self.backend.add_batch(batch)
        };
        self.busy_cache_flush.store(false, Ordering::Release);
        result?;

        if flushed > 0 {
            tracing::debug!("Flushed {} containers to backend", flushed);
        }
        Ok(())
    }

    /// 维护通道：每层先跑一个整批，再单个摘除直到 posting 总条数回到
    /// 二级阈值之下；结束后主动回吐 RSS（大批 map 腾空之后最划算）。
    pub fn flush_cache_some(&self) -> anyhow::Result<()> {
        let flush = self.flush_batch_size.load(Ordering::Relaxed);
        for tier in [&self.ri_extern, &self.ri_intern] {
            {
                let _g = self.control.lock();
                self.flush_cache_locked(tier.as_ref(), flush)?;
            }
            while tier.cached_url_count() > URL_PRESSURE_LIMIT {
                let _g = self.control.lock();
                self.flush_cache_locked(tier.as_ref(), 1)?;
                if tier.size() == 0 {
                    break;
                }
            }
        }
        maybe_trim_rss();
        Ok(())
    }

    /// 合并触发：只有 false->true 才唤醒一次，避免写风暴下 notify 风暴。
    fn request_flush(&self) {
        if !self.flush_requested.swap(true, Ordering::AcqRel) {
            self.flush_notify.notify_one();
        }
    }

    /// 定期维护循环：周期或压力唤醒时跑 `flush_cache_some`。
    pub async fn flush_loop(self: Arc<Self>, interval_secs: u64) {
        let interval = std::time::Duration::from_secs(interval_secs);
        loop {
            // flush 请求优先：避免压力长期积压
            if self.flush_requested.swap(false, Ordering::AcqRel) {
                if let Err(e) = self.flush_cache_some() {
                    tracing::error!("Cache flush failed (flush requested): {}", e);
                    // 避免失败后自旋
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {},
                _ = self.flush_notify.notified() => {},
            }
            self.flush_requested.store(false, Ordering::Release);

            if let Err(e) = self.flush_cache_some() {
                tracing::error!("Cache flush failed: {}", e);
            }
        }
    }

    pub fn has_container(&self, word: &WordHash) -> bool {
        self.ri_extern.has_container(word)
            || self.ri_intern.has_container(word)
            || self.backend.has_container(word)
    }

    /// 三源合并读。内存层不限时；`max_time_millis` 只约束 backend 读
    /// （负值 = 不限时）。`url_filter` 只收窄各源的返回，不改变合并优先级。
    /// 三源皆无时返回 None。
    pub fn get_container(
        &self,
        word: &WordHash,
        url_filter: Option<&HashSet<UrlHash>>,
        max_time_millis: i64,
    ) -> Option<PostingContainer> {
        let container = self.ri_extern.get_container(word, url_filter, -1);
        let container = merge_first_wins(container, self.ri_intern.get_container(word, url_filter, -1));

        let backend_time = if max_time_millis < 0 { -1 } else { max_time_millis };
        merge_first_wins(
            container,
            self.backend.get_container(word, url_filter, backend_time),
        )
    }

    /// 批量读：每步把剩余预算重摊给未处理的 hash（快查询把省下的预算让给
    /// 后面的），预算耗尽或除数为零时退化为固定兜底值而不是中止。
    /// `interrupt_if_empty` 时任一 hash 查空立即返回空表（合取短路用）。
    pub fn get_containers(
        &self,
        words: &HashSet<WordHash>,
        url_filter: Option<&HashSet<UrlHash>>,
        interrupt_if_empty: bool,
        max_time_millis: i64,
    ) -> HashMap<WordHash, PostingContainer> {
        let start = Instant::now();
        let mut containers = HashMap::with_capacity(words.len());

        for word in words {
            let elapsed = start.elapsed().as_millis() as i64;
            let allotment = step_allotment(max_time_millis, elapsed, words.len(), containers.len());

            let single = self.get_container(word, url_filter, allotment);
            let empty = single.as_ref().map(|c| c.is_empty()).unwrap_or(true);
            if empty && interrupt_if_empty {
                return HashMap::new();
            }
            containers.insert(*word, single.unwrap_or_else(|| PostingContainer::new(*word)));
        }
        containers
    }

    /// 合并后 container 的 `updated`；无该词时 0。
    pub fn update_time(&self, word: &WordHash) -> u64 {
        self.get_container(word, None, -1)
            .map(|c| c.updated())
            .unwrap_or(0)
    }

    /// 三源 word 数的最大值（不是和：flush 前后一个词可能同时出现在层与
    /// backend 里，三源不保证互斥）。
    pub fn size(&self) -> usize {
        self.backend
            .size()
            .max(self.ri_intern.size())
            .max(self.ri_extern.size())
    }

    /// 该词在三源的 posting 条数之和；合并去重前的原始值，可能重复计数。
    pub fn index_size(&self, word: &WordHash) -> usize {
        self.backend.index_size(word) + self.ri_intern.index_size(word) + self.ri_extern.index_size(word)
    }

    /// 从三个来源摘除该词并按 extern > intern > backend 合并返回；
    /// 三源皆无时 None。
    pub fn delete_container(&self, word: &WordHash) -> Option<PostingContainer> {
        let c = self.ri_extern.delete_container(word);
        let c = merge_first_wins(c, self.ri_intern.delete_container(word));
        merge_first_wins(c, self.backend.delete_container(word))
    }

    /// 三源无条件都尝试删（不因先删中而短路，保证别的来源不残留陈旧副本）；
    /// 任一来源删中即 true。
    pub fn remove_entry(&self, word: &WordHash, url: &UrlHash) -> bool {
        let in_extern = self.ri_extern.remove_entry(word, url);
        let in_intern = self.ri_intern.remove_entry(word, url);
        let in_backend = self.backend.remove_entry(word, url);
        in_extern | in_intern | in_backend
    }

    /// 各来源删除条数之和。
    pub fn remove_entries(&self, word: &WordHash, urls: &HashSet<UrlHash>) -> usize {
        self.ri_extern.remove_entries(word, urls)
            + self.ri_intern.remove_entries(word, urls)
            + self.backend.remove_entries(word, urls)
    }

    /// 环形导出：以 `start` 旋转序收集至多 `count` 个非空 container。
    /// `ram_only` 时 `count` 另按 extern 层大小封顶。
    pub fn index_container_set(
        &self,
        start: WordHash,
        ram_only: bool,
        rotate: bool,
        count: usize,
    ) -> Vec<PostingContainer> {
        let count = if ram_only {
            count.min(self.ri_extern.size())
        } else {
            count
        };

        let mut containers = Vec::new();
        let mut seq = self.word_containers(start, ram_only, rotate);
        while containers.len() < count {
            match seq.next() {
                Some(c) if !c.is_empty() => containers.push(c),
                Some(_) => continue,
                None => break,
            }
        }
        containers
    }

    /// container 序列：`ram_only` 时只走 extern 层，否则归并 extern 层与
    /// backend（extern 作合并基底）；`rotate` 时在 `start` 处回绕成单圈。
    pub fn word_containers(&self, start: WordHash, ram_only: bool, rotate: bool) -> BoxedSeq {
        // 回绕段依赖从头构造的底层序列；不旋转时直接从 start 起步
        let seq_start = if rotate { None } else { Some(start) };
        let seq: BoxedSeq = if ram_only {
            self.ri_extern.ordered_containers(seq_start)
        } else {
            Box::new(MergeSeq::new(
                self.ri_extern.ordered_containers(seq_start),
                self.backend.ordered_containers(seq_start),
                self.order.clone(),
            ))
        };
        if rotate {
            Box::new(RotateSeq::new(seq, start))
        } else {
            seq
        }
    }

    /// 固定顺序关停：intern 层 → extern 层 → backend，全程持引擎锁。
    pub fn close(&self) -> anyhow::Result<()> {
        let _g = self.control.lock();
        self.ri_intern.close()?;
        self.ri_extern.close()?;
        self.backend.close()
    }

    pub fn cache_report(&self) -> CacheReport {
        CacheReport {
            flushing: self.flush_state() == FlushState::Flushing,
            extern_tier: TierStats {
                words: self.ri_extern.size(),
                max_words: self.ri_extern.max_word_count(),
                urls: self.ri_extern.cached_url_count(),
            },
            intern_tier: TierStats {
                words: self.ri_intern.size(),
                max_words: self.ri_intern.max_word_count(),
                urls: self.ri_intern.cached_url_count(),
            },
            backend_words: self.backend.size(),
            process_rss_bytes: CacheReport::read_process_rss(),
        }
    }
}

/// 先到者胜的合并：`base` 在、`extra` 也在时按 `add_all_unique` 吸收
/// （base 的 entry 不被覆盖）；`base` 缺席则直接采用 `extra`。
fn merge_first_wins(
    base: Option<PostingContainer>,
    extra: Option<PostingContainer>,
) -> Option<PostingContainer> {
    match (base, extra) {
        (Some(mut b), Some(e)) => {
            b.add_all_unique(&e);
            Some(b)
        }
        (Some(b), None) => Some(b),
        (None, e) => e,
    }
}

/// 单个 hash 的时间份额：`(总预算 − 已耗) / 未处理数`。
/// 预算为负 = 不限时；预算耗尽或除数为零时返回固定兜底值（预算是软性的，
/// 宁可超时也不中止）。
fn step_allotment(max_time_millis: i64, elapsed_millis: i64, total: usize, done: usize) -> i64 {
    if max_time_millis < 0 {
        return -1;
    }
    let left = total.saturating_sub(done) as i64;
    let remaining = max_time_millis - elapsed_millis;
    if remaining <= 0 || left == 0 {
        return FALLBACK_ALLOTMENT_MILLIS;
    }
    remaining / left
}

#[cfg(feature = "mimalloc")]
fn maybe_trim_rss() {
    // mimalloc 作为全局分配器时，glibc 的 malloc_trim 无效，需要调用 mimalloc 自己的回收。
    extern "C" {
        fn mi_collect(force: bool);
    }
    unsafe { mi_collect(true) };
}

#[cfg(all(not(feature = "mimalloc"), target_os = "linux", target_env = "gnu"))]
fn maybe_trim_rss() {
    // glibc malloc 的主动回吐：释放尽可能多的空闲块回 OS。
    unsafe {
        libc::malloc_trim(0);
    }
}

#[cfg(all(
    not(feature = "mimalloc"),
    not(all(target_os = "linux", target_env = "gnu"))
))]
fn maybe_trim_rss() {}
