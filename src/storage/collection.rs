use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::core::{PostingContainer, UrlHash, WordHash};
use crate::index::seq::{BoxedSeq, VecSeq};
use crate::index::{BackendStore, ContainerSource};

/// collection 文件 Header
const MAGIC: u32 = 0x5257_4943; // "RWIC"
const VERSION_CURRENT: u32 = 1;
const STATE_COMMITTED: u32 = 0x0000_0001;
const STATE_INCOMPLETE: u32 = 0xFFFF_FFFF;
const HEADER_SIZE: usize = 4 + 4 + 4 + 4 + 4; // magic + version + state + data_len + checksum

const SNAP_FILE: &str = "collection.db";
const LOG_FILE: &str = "collection.log";

/// 简单校验和（非加密，仅用于发现截断/随机翻转）。
fn checksum32(data: &[u8]) -> u32 {
    let mut s: u32 = 0;
    for &b in data {
        s = s.wrapping_add(b as u32);
        s = s.rotate_left(3);
    }
    s
}

/// op log 记录：快照之间的增量变更，open 时按序回放。
#[derive(Serialize, Deserialize)]
enum StoreOp {
    AddBatch(Vec<PostingContainer>),
    Delete(WordHash),
    RemoveEntry(WordHash, UrlHash),
    RemoveEntries(WordHash, Vec<UrlHash>),
}

/// 持久 posting collection store。
///
/// 布局：
/// - `collection.db` — 已提交快照（header 校验：magic/version/state/len/checksum）
/// - `collection.log` — 快照之后的 framed op log（`len + crc + bincode(op)`）
///
/// open 时先加载合法快照再回放 op log；损坏的快照与截断的 log 尾部只告警
/// 不报错（以空状态/部分回放继续）。`close()` 把当前状态原子落盘为新快照
/// （tmp + rename + fsync(dir)）并清空 log。
pub struct CollectionStore {
    dir: PathBuf,
    snap_path: PathBuf,
    log_path: PathBuf,
    inner: RwLock<BTreeMap<WordHash, PostingContainer>>,
    log: Mutex<File>,
}

impl CollectionStore {
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let snap_path = dir.join(SNAP_FILE);
        let log_path = dir.join(LOG_FILE);

        let mut map = load_snapshot_if_valid(&snap_path);
        replay_log(&log_path, &mut map);

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            snap_path,
            log_path,
            inner: RwLock::new(map),
            log: Mutex::new(log),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn append_op(&self, op: &StoreOp) -> anyhow::Result<()> {
        let payload = bincode::serialize(op)?;
        let len: u32 = payload
            .len()
            .try_into()
            .map_err(|_| anyhow::anyhow!("Store op too large (>{} bytes)", u32::MAX))?;
        let crc = checksum32(&payload);

        let mut f = self.log.lock();
        f.write_all(&len.to_le_bytes())?;
        f.write_all(&crc.to_le_bytes())?;
        f.write_all(&payload)?;
        f.flush()?;
        Ok(())
    }

    /// 删除/剔除属于 best-effort 持久化：log 追加失败只告警，不回滚内存态。
    fn append_op_best_effort(&self, op: &StoreOp) {
        if let Err(e) = self.append_op(op) {
            tracing::warn!("Collection log append failed (continuing in memory): {}", e);
        }
    }

    /// 原子写快照：tmp 全量写 → fsync → rename → fsync(dir)。
    fn write_snapshot(&self, map: &BTreeMap<WordHash, PostingContainer>) -> anyhow::Result<()> {
        let containers: Vec<&PostingContainer> = map.values().collect();
        let body = bincode::serialize(&containers)?;
        let data_len: u32 = body
            .len()
            .try_into()
            .map_err(|_| anyhow::anyhow!("Snapshot too large (>{} bytes)", u32::MAX))?;
        let crc = checksum32(&body);

        let tmp_path = self.snap_path.with_extension("db.tmp");
        let mut file = File::create(&tmp_path)?;
        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        header[4..8].copy_from_slice(&VERSION_CURRENT.to_le_bytes());
        header[8..12].copy_from_slice(&STATE_COMMITTED.to_le_bytes());
        header[12..16].copy_from_slice(&data_len.to_le_bytes());
        header[16..20].copy_from_slice(&crc.to_le_bytes());
        file.write_all(&header)?;
        file.write_all(&body)?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, &self.snap_path)?;
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }

        tracing::info!(
            "Collection snapshot written: {} words, {} bytes",
            map.len(),
            HEADER_SIZE + body.len()
        );
        Ok(())
    }
}

impl BackendStore for CollectionStore {
    /// 一次 flush 批次的唯一写入口；摊薄写放大。
    fn add_batch(&self, batch: Vec<PostingContainer>) -> anyhow::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        {
            let mut inner = self.inner.write();
            for c in &batch {
                apply_add(&mut inner, c);
            }
        }
        self.append_op(&StoreOp::AddBatch(batch))
    }
}

impl ContainerSource for CollectionStore {
    fn get_container(
        &self,
        word: &WordHash,
        url_filter: Option<&HashSet<UrlHash>>,
        max_time_millis: i64,
    ) -> Option<PostingContainer> {
        let start = Instant::now();
        let inner = self.inner.read();
        let c = inner.get(word)?;

        let Some(filter) = url_filter else {
            return Some(c.clone());
        };

        // 时间预算只约束 backend 读；超时返回已收集的部分结果（软预算）。
        let mut out = PostingContainer::new(*word);
        out.touch(c.updated());
        for (i, entry) in c.iter().enumerate() {
            if max_time_millis >= 0 && i % 256 == 255 {
                let elapsed = start.elapsed().as_millis() as i64;
                if elapsed > max_time_millis {
                    tracing::debug!(
                        "Backend read for {} hit time budget after {} entries",
                        word,
                        out.size()
                    );
                    break;
                }
            }
            if filter.contains(&entry.url) {
                out.insert(entry);
            }
        }
        Some(out)
    }

    fn has_container(&self, word: &WordHash) -> bool {
        self.inner.read().contains_key(word)
    }

    fn index_size(&self, word: &WordHash) -> usize {
        self.inner.read().get(word).map(|c| c.size()).unwrap_or(0)
    }

    fn size(&self) -> usize {
        self.inner.read().len()
    }

    fn delete_container(&self, word: &WordHash) -> Option<PostingContainer> {
        let c = self.inner.write().remove(word)?;
        self.append_op_best_effort(&StoreOp::Delete(*word));
        Some(c)
    }

    fn remove_entry(&self, word: &WordHash, url: &UrlHash) -> bool {
        let removed = {
            let mut inner = self.inner.write();
            let Some(c) = inner.get_mut(word) else {
                return false;
            };
            let removed = c.remove(url);
            if removed && c.is_empty() {
                inner.remove(word);
            }
            removed
        };
        if removed {
            self.append_op_best_effort(&StoreOp::RemoveEntry(*word, *url));
        }
        removed
    }

    fn remove_entries(&self, word: &WordHash, urls: &HashSet<UrlHash>) -> usize {
        let removed = {
            let mut inner = self.inner.write();
            let Some(c) = inner.get_mut(word) else {
                return 0;
            };
            let removed = c.remove_many(urls);
            if removed > 0 && c.is_empty() {
                inner.remove(word);
            }
            removed
        };
        if removed > 0 {
            self.append_op_best_effort(&StoreOp::RemoveEntries(
                *word,
                urls.iter().copied().collect(),
            ));
        }
        removed
    }

    fn ordered_containers(&self, start: Option<WordHash>) -> BoxedSeq {
        let items: Vec<PostingContainer> = self.inner.read().values().cloned().collect();
        Box::new(VecSeq::new(Arc::new(items), start))
    }

    /// 落盘为新快照并清空 op log（log 已被快照吸收）。
    fn close(&self) -> anyhow::Result<()> {
        let inner = self.inner.read();
        self.write_snapshot(&inner)?;
        drop(inner);

        let mut log = self.log.lock();
        *log = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.log_path)?;
        Ok(())
    }
}

fn apply_add(map: &mut BTreeMap<WordHash, PostingContainer>, c: &PostingContainer) {
    match map.get_mut(&c.word()) {
        Some(existing) => {
            existing.add_all_unique(c);
        }
        None => {
            map.insert(c.word(), c.clone());
        }
    }
}

fn apply_op(map: &mut BTreeMap<WordHash, PostingContainer>, op: StoreOp) {
    match op {
        StoreOp::AddBatch(batch) => {
            for c in &batch {
                apply_add(map, c);
            }
        }
        StoreOp::Delete(word) => {
            map.remove(&word);
        }
        StoreOp::RemoveEntry(word, url) => {
            if let Some(c) = map.get_mut(&word) {
                c.remove(&url);
                if c.is_empty() {
                    map.remove(&word);
                }
            }
        }
        StoreOp::RemoveEntries(word, urls) => {
            if let Some(c) = map.get_mut(&word) {
                let set: HashSet<UrlHash> = urls.into_iter().collect();
                c.remove_many(&set);
                if c.is_empty() {
                    map.remove(&word);
                }
            }
        }
    }
}

/// 加载快照；任何 header / checksum / 反序列化不一致都拒绝并以空表继续。
fn load_snapshot_if_valid(path: &Path) -> BTreeMap<WordHash, PostingContainer> {
    let mut map = BTreeMap::new();
    if !path.exists() {
        return map;
    }

    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!("Collection snapshot unreadable, starting empty: {}", e);
            return map;
        }
    };
    if data.len() < HEADER_SIZE {
        tracing::warn!("Collection snapshot too small, ignoring");
        return map;
    }

    let field =
        |i: usize| -> u32 { u32::from_le_bytes(data[i * 4..i * 4 + 4].try_into().unwrap()) };
    let (magic, version, state, data_len, stored_crc) =
        (field(0), field(1), field(2), field(3) as usize, field(4));

    if magic != MAGIC {
        tracing::warn!("Collection snapshot magic mismatch: {:#x} != {:#x}", magic, MAGIC);
        return map;
    }
    if version != VERSION_CURRENT {
        tracing::warn!("Collection snapshot version mismatch: {}", version);
        return map;
    }
    if state != STATE_COMMITTED {
        tracing::warn!("Collection snapshot state INCOMPLETE, ignoring");
        return map;
    }

    let body = &data[HEADER_SIZE..];
    if body.len() != data_len {
        tracing::warn!("Collection snapshot data length mismatch");
        return map;
    }
    let computed = checksum32(body);
    if computed != stored_crc {
        tracing::warn!(
            "Collection snapshot checksum mismatch: {} != {}",
            computed,
            stored_crc
        );
        return map;
    }

    match bincode::deserialize::<Vec<PostingContainer>>(body) {
        Ok(containers) => {
            for c in containers {
                map.insert(c.word(), c);
            }
            tracing::info!("Loaded collection snapshot: {} words", map.len());
        }
        Err(e) => {
            tracing::warn!("Collection snapshot deserialize failed: {}", e);
        }
    }
    map
}

/// 回放 op log；损坏/截断的尾部记录丢弃并告警。
fn replay_log(path: &Path, map: &mut BTreeMap<WordHash, PostingContainer>) {
    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(_) => return, // 没有 log 就没有增量
    };

    let mut pos = 0usize;
    let mut replayed = 0usize;
    let mut truncated = 0usize;
    while pos + 8 <= data.len() {
        let len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().unwrap());
        let body_start = pos + 8;
        if body_start + len > data.len() {
            truncated += 1;
            break;
        }
        let payload = &data[body_start..body_start + len];
        if checksum32(payload) != crc {
            truncated += 1;
            break;
        }
        match bincode::deserialize::<StoreOp>(payload) {
            Ok(op) => {
                apply_op(map, op);
                replayed += 1;
            }
            Err(e) => {
                tracing::warn!("Collection log record undecodable, stopping replay: {}", e);
                truncated += 1;
                break;
            }
        }
        pos = body_start + len;
    }

    if replayed > 0 || truncated > 0 {
        tracing::info!(
            "Collection log replay: ops={} truncated_tail={}",
            replayed,
            truncated
        );
    }
}
