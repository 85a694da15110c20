pub mod cached;
pub mod order;
pub mod ram;
pub mod seq;

use std::collections::HashSet;

use crate::core::{PostingContainer, Tier, UrlHash, WordHash};
use crate::index::seq::BoxedSeq;

/// 三个 posting 来源（两个内存层 + backend）共享的读/删/遍历面。
///
/// ## 契约（重要）
/// - 每个实现自身的单次操作必须线程安全；引擎只对 flush/close 加锁。
/// - `max_time_millis` 仅对 backend 有意义（负值 = 不限时）；内存层不受
///   时间预算约束，实现可以忽略该参数。
/// - `ordered_containers` 返回按基础序排列的可重启序列；`start` 给定时
///   从第一个 `>= start` 的 key 开始。
pub trait ContainerSource: Send + Sync {
    fn get_container(
        &self,
        word: &WordHash,
        url_filter: Option<&HashSet<UrlHash>>,
        max_time_millis: i64,
    ) -> Option<PostingContainer>;

    fn has_container(&self, word: &WordHash) -> bool;

    /// 该 word 在本来源中的 posting 条数（词不存在为 0）。
    fn index_size(&self, word: &WordHash) -> usize;

    /// 本来源持有的 word 数。
    fn size(&self) -> usize;

    fn delete_container(&self, word: &WordHash) -> Option<PostingContainer>;

    fn remove_entry(&self, word: &WordHash, url: &UrlHash) -> bool;

    fn remove_entries(&self, word: &WordHash, urls: &HashSet<UrlHash>) -> usize;

    fn ordered_containers(&self, start: Option<WordHash>) -> BoxedSeq;

    fn close(&self) -> anyhow::Result<()>;
}

/// 有界内存层（intern / extern 各一个实例）。
pub trait RamTier: ContainerSource {
    /// 合入一个 container（`add_all_unique` 语义，已有 entry 不被覆盖）。
    fn add(&self, container: PostingContainer, update_time: u64, source: Tier);

    fn max_word_count(&self) -> usize;

    /// 层自定策略选出的下一个待 flush word；层为空时 None。
    fn best_flush_candidate(&self) -> Option<WordHash>;

    /// 层内缓存的 posting 总条数（区别于 word 数，二级压力阈值用）。
    fn cached_url_count(&self) -> usize;
}

/// 持久 collection store：批量写入能力之外与内存层同面。
pub trait BackendStore: ContainerSource {
    fn add_batch(&self, batch: Vec<PostingContainer>) -> anyhow::Result<()>;
}

pub use cached::{CachedIndex, FlushState};
pub use order::ContainerOrder;
pub use ram::{FlushCandidate, FlushPolicy, LargestFirst, LruFirst, RamCache};
pub use seq::{ContainerSeq, MergeSeq, RotateSeq, VecSeq};
