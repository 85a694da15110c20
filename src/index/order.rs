use std::cmp::Ordering;

use crate::core::WordHash;

/// word hash 空间上的全序 + 环形旋转变换。
///
/// 基础序是定宽字节序（即 `WordHash` 派生的 `Ord`）。`rotate(pivot)` 得到
/// 一个新视图：所有 `>= pivot` 的 key 排在所有 `< pivot` 之前，段内相对
/// 顺序不变——相当于把 key 空间在 pivot 处剪开成环，调用方遍历时无需
/// 自己处理回绕。可克隆：两个独立的旋转视图可以共存。
#[derive(Clone, Debug, Default)]
pub struct ContainerOrder {
    pivot: Option<WordHash>,
}

impl ContainerOrder {
    pub fn new() -> Self {
        Self { pivot: None }
    }

    pub fn rotated(pivot: WordHash) -> Self {
        Self { pivot: Some(pivot) }
    }

    /// 返回在 `pivot` 处剪开的旋转视图；`self` 不变。
    pub fn rotate(&self, pivot: WordHash) -> Self {
        Self { pivot: Some(pivot) }
    }

    pub fn pivot(&self) -> Option<WordHash> {
        self.pivot
    }

    /// key 所在的环段：0 = pivot 及其后（先输出），1 = pivot 之前（回绕段）。
    fn segment(&self, hash: &WordHash) -> u8 {
        match &self.pivot {
            None => 0,
            Some(p) => {
                if hash >= p {
                    0
                } else {
                    1
                }
            }
        }
    }

    pub fn cmp(&self, a: &WordHash, b: &WordHash) -> Ordering {
        self.segment(a)
            .cmp(&self.segment(b))
            .then_with(|| a.cmp(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::HASH_LEN;

    fn h(first: u8) -> WordHash {
        let mut b = [0u8; HASH_LEN];
        b[0] = first;
        WordHash::from_bytes(b)
    }

    #[test]
    fn base_order_is_byte_order() {
        let order = ContainerOrder::new();
        assert_eq!(order.cmp(&h(1), &h(2)), Ordering::Less);
        assert_eq!(order.cmp(&h(2), &h(2)), Ordering::Equal);
        assert_eq!(order.cmp(&h(3), &h(2)), Ordering::Greater);
    }

    #[test]
    fn rotation_puts_keys_at_or_after_pivot_first() {
        let order = ContainerOrder::new().rotate(h(5));
        // >= pivot 的段整体小于 < pivot 的段
        assert_eq!(order.cmp(&h(5), &h(1)), Ordering::Less);
        assert_eq!(order.cmp(&h(9), &h(4)), Ordering::Less);
        // 段内保持基础序
        assert_eq!(order.cmp(&h(5), &h(9)), Ordering::Less);
        assert_eq!(order.cmp(&h(1), &h(4)), Ordering::Less);
    }

    #[test]
    fn rotated_sort_is_a_single_ring_pass() {
        let order = ContainerOrder::new().rotate(h(5));
        let mut keys = vec![h(9), h(1), h(5), h(4), h(7)];
        keys.sort_by(|a, b| order.cmp(a, b));
        assert_eq!(keys, vec![h(5), h(7), h(9), h(1), h(4)]);
    }

    #[test]
    fn two_rotated_views_are_independent() {
        let base = ContainerOrder::new();
        let r1 = base.rotate(h(3));
        let r2 = base.rotate(h(8));
        assert_eq!(r1.cmp(&h(3), &h(1)), Ordering::Less);
        assert_eq!(r2.cmp(&h(3), &h(1)), Ordering::Greater);
        assert!(base.pivot().is_none());
    }
}
