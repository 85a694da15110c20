use std::sync::Arc;

use crate::core::{PostingContainer, WordHash};
use crate::index::order::ContainerOrder;

/// 惰性、有限、可重启的 container 序列。
///
/// `clone_seq` 的语义对齐可克隆迭代器：返回一个从**构造起点**重新开始的
/// 等价序列（与当前消费进度无关），底层快照共享。MergeSeq / RotateSeq 都
/// 依赖该语义实现重启与回绕。
pub trait ContainerSeq: Iterator<Item = PostingContainer> + Send {
    fn clone_seq(&self) -> BoxedSeq;
}

pub type BoxedSeq = Box<dyn ContainerSeq>;

/// 快照序列：一段已按基础序排好的 container 列表 + 起始偏移。
/// 层实现（RamCache / CollectionStore）用它把内部状态冻结成可克隆序列。
pub struct VecSeq {
    items: Arc<Vec<PostingContainer>>,
    start: usize,
    pos: usize,
}

impl VecSeq {
    /// `items` 必须已按基础序升序排列；`start_at` 给定时从第一个
    /// `>= start_at` 的元素开始。
    pub fn new(items: Arc<Vec<PostingContainer>>, start_at: Option<WordHash>) -> Self {
        let start = match start_at {
            None => 0,
            Some(h) => items.partition_point(|c| c.word() < h),
        };
        Self {
            items,
            start,
            pos: start,
        }
    }

    pub fn empty() -> Self {
        Self::new(Arc::new(Vec::new()), None)
    }
}

impl Iterator for VecSeq {
    type Item = PostingContainer;

    fn next(&mut self) -> Option<PostingContainer> {
        let item = self.items.get(self.pos)?.clone();
        self.pos += 1;
        Some(item)
    }
}

impl ContainerSeq for VecSeq {
    fn clone_seq(&self) -> BoxedSeq {
        Box::new(Self {
            items: self.items.clone(),
            start: self.start,
            pos: self.start,
        })
    }
}

/// 两路有序归并。输入各自已按 `order` 升序；key 相同时以
/// `add_all_unique` 合并为一个 container 再输出——左输入为合并基底，
/// 因此重复 UrlHash 左边胜出（引擎以 extern 为左、backend 为右，保持
/// extern 优先）。两个输入都可重启时本序列可重启。
pub struct MergeSeq {
    a: BoxedSeq,
    b: BoxedSeq,
    head_a: Option<PostingContainer>,
    head_b: Option<PostingContainer>,
    order: ContainerOrder,
}

impl MergeSeq {
    pub fn new(a: BoxedSeq, b: BoxedSeq, order: ContainerOrder) -> Self {
        Self {
            a,
            b,
            head_a: None,
            head_b: None,
            order,
        }
    }
}

impl Iterator for MergeSeq {
    type Item = PostingContainer;

    fn next(&mut self) -> Option<PostingContainer> {
        if self.head_a.is_none() {
            self.head_a = self.a.next();
        }
        if self.head_b.is_none() {
            self.head_b = self.b.next();
        }

        match (self.head_a.is_some(), self.head_b.is_some()) {
            (false, false) => None,
            (true, false) => self.head_a.take(),
            (false, true) => self.head_b.take(),
            (true, true) => {
                use std::cmp::Ordering;
                let wa = self.head_a.as_ref().map(|c| c.word())?;
                let wb = self.head_b.as_ref().map(|c| c.word())?;
                match self.order.cmp(&wa, &wb) {
                    Ordering::Less => self.head_a.take(),
                    Ordering::Greater => self.head_b.take(),
                    Ordering::Equal => {
                        let mut merged = self.head_a.take()?;
                        if let Some(rhs) = self.head_b.take() {
                            merged.add_all_unique(&rhs);
                        }
                        Some(merged)
                    }
                }
            }
        }
    }
}

impl ContainerSeq for MergeSeq {
    fn clone_seq(&self) -> BoxedSeq {
        Box::new(Self::new(
            self.a.clone_seq(),
            self.b.clone_seq(),
            self.order.clone(),
        ))
    }
}

/// 环形回绕：对一个按**未旋转**基础序排列的序列，先输出第一个
/// `>= pivot` 的元素到末尾，再从 `base` 的全新克隆从头输出 `< pivot`
/// 的元素，到达 `>= pivot` 处停止（不重复输出 pivot 段）。
///
/// 净效果：以 pivot 为起点对 key 空间做恰好一整圈的遍历。有限、每次
/// 构造一趟；`clone_seq` 得到新的一趟，可反复包装。
///
/// 约束：`base` 必须是从序列起点构造的（`clone_seq` 回绕段依赖这一点）。
pub struct RotateSeq {
    base: BoxedSeq,
    wrap: Option<BoxedSeq>,
    pivot: WordHash,
    wrapping: bool,
    done: bool,
}

impl RotateSeq {
    pub fn new(base: BoxedSeq, pivot: WordHash) -> Self {
        Self {
            base,
            wrap: None,
            pivot,
            wrapping: false,
            done: false,
        }
    }
}

impl Iterator for RotateSeq {
    type Item = PostingContainer;

    fn next(&mut self) -> Option<PostingContainer> {
        if self.done {
            return None;
        }

        if !self.wrapping {
            // 第一段：跳过开头 < pivot 的前缀，输出 >= pivot 的尾段
            loop {
                match self.base.next() {
                    Some(c) if c.word() < self.pivot => continue,
                    Some(c) => return Some(c),
                    None => {
                        self.wrapping = true;
                        self.wrap = Some(self.base.clone_seq());
                        break;
                    }
                }
            }
        }

        // 回绕段：从头输出 < pivot 的元素，遇到 >= pivot 即整圈结束
        let wrap = self.wrap.as_mut()?;
        match wrap.next() {
            Some(c) if c.word() < self.pivot => Some(c),
            _ => {
                self.done = true;
                None
            }
        }
    }
}

impl ContainerSeq for RotateSeq {
    fn clone_seq(&self) -> BoxedSeq {
        Box::new(Self::new(self.base.clone_seq(), self.pivot))
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

    fn c(first: u8, urls: &[&str]) -> PostingContainer {
        PostingContainer::with_entries(
            h(first),
            urls.iter()
                .map(|u| PostingEntry::new(crate::core::UrlHash::of(u), u.as_bytes().to_vec())),
            first as u64,
        )
    }

    fn seq(containers: Vec<PostingContainer>) -> BoxedSeq {
        Box::new(VecSeq::new(Arc::new(containers), None))
    }

    fn words(s: BoxedSeq) -> Vec<u8> {
        s.map(|c| c.word().as_bytes()[0]).collect()
    }

    #[test]
    fn vec_seq_starts_at_first_key_at_or_after_start() {
        let v = Arc::new(vec![c(1, &["a"]), c(3, &["b"]), c(5, &["c"])]);
        let s = VecSeq::new(v, Some(h(2)));
        assert_eq!(words(Box::new(s)), vec![3, 5]);
    }

    #[test]
    fn vec_seq_clone_restarts_at_construction_start() {
        let v = Arc::new(vec![c(1, &["a"]), c(3, &["b"]), c(5, &["c"])]);
        let mut s = VecSeq::new(v, Some(h(3)));
        assert_eq!(s.next().unwrap().word(), h(3));
        let restarted = s.clone_seq();
        assert_eq!(words(restarted), vec![3, 5]);
    }

    #[test]
    fn merge_interleaves_disjoint_keys_in_order() {
        let m = MergeSeq::new(
            seq(vec![c(1, &["a"]), c(5, &["b"])]),
            seq(vec![c(2, &["c"]), c(9, &["d"])]),
            ContainerOrder::new(),
        );
        assert_eq!(words(Box::new(m)), vec![1, 2, 5, 9]);
    }

    #[test]
    fn merge_combines_equal_keys_left_wins() {
        let url = crate::core::UrlHash::of("dup");
        let mut left = PostingContainer::new(h(4));
        left.insert(PostingEntry::new(url, b"left".to_vec()));
        let mut right = PostingContainer::new(h(4));
        right.insert(PostingEntry::new(url, b"right".to_vec()));
        right.insert(PostingEntry::new(crate::core::UrlHash::of("only"), b"r2".to_vec()));

        let mut m = MergeSeq::new(seq(vec![left]), seq(vec![right]), ContainerOrder::new());
        let merged = m.next().unwrap();
        assert!(m.next().is_none());
        assert_eq!(merged.size(), 2);
        assert_eq!(merged.get(&url), Some(b"left".as_slice()));
    }

    #[test]
    fn merge_is_restartable() {
        let mut m = MergeSeq::new(
            seq(vec![c(1, &["a"])]),
            seq(vec![c(2, &["b"])]),
            ContainerOrder::new(),
        );
        assert_eq!(m.next().unwrap().word(), h(1));
        let again = m.clone_seq();
        assert_eq!(words(again), vec![1, 2]);
    }

    #[test]
    fn rotate_yields_each_key_once_starting_at_pivot() {
        let all = vec![c(1, &["a"]), c(4, &["b"]), c(5, &["c"]), c(9, &["d"])];
        let r = RotateSeq::new(seq(all), h(5));
        assert_eq!(words(Box::new(r)), vec![5, 9, 1, 4]);
    }

    #[test]
    fn rotate_with_pivot_between_keys_starts_at_next_key() {
        let all = vec![c(1, &["a"]), c(4, &["b"]), c(9, &["c"])];
        let r = RotateSeq::new(seq(all), h(5));
        assert_eq!(words(Box::new(r)), vec![9, 1, 4]);
    }

    #[test]
    fn rotate_with_smallest_pivot_is_plain_pass() {
        let all = vec![c(1, &["a"]), c(4, &["b"])];
        let r = RotateSeq::new(seq(all), h(0));
        assert_eq!(words(Box::new(r)), vec![1, 4]);
    }

    #[test]
    fn rotate_over_empty_base_is_empty() {
        let r = RotateSeq::new(Box::new(VecSeq::empty()), h(3));
        assert_eq!(words(Box::new(r)), Vec::<u8>::new());
    }

    #[test]
    fn rotate_clone_gives_a_fresh_full_pass() {
        let all = vec![c(2, &["a"]), c(6, &["b"]), c(8, &["c"])];
        let mut r = RotateSeq::new(seq(all), h(6));
        assert_eq!(r.next().unwrap().word(), h(6));
        let second_pass = r.clone_seq();
        assert_eq!(words(second_pass), vec![6, 8, 2]);
    }

    #[test]
    fn rotate_over_merge_covers_both_sources() {
        let m = MergeSeq::new(
            seq(vec![c(2, &["a"]), c(7, &["b"])]),
            seq(vec![c(4, &["c"])]),
            ContainerOrder::new(),
        );
        let r = RotateSeq::new(Box::new(m), h(4));
        assert_eq!(words(Box::new(r)), vec![4, 7, 2]);
    }
}
