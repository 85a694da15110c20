use std::fmt;

/// 单个内存层的占用概览。
#[derive(Clone, Copy, Debug, Default)]
pub struct TierStats {
    /// 缓存的 word 数
    pub words: usize,
    /// word 数上限（flush 收敛目标）
    pub max_words: usize,
    /// 缓存的 posting 总条数
    pub urls: usize,
}

/// 缓存状态报告。
///
/// 三个来源各自独立取数，不构成跨源一致快照；只作观测指标，
/// 不参与任何正确性判断。
#[derive(Clone, Debug, Default)]
pub struct CacheReport {
    /// 是否正有 flush 批次在执行
    pub flushing: bool,
    /// extern 层（对端推送）
    pub extern_tier: TierStats,
    /// intern 层（本机产出）
    pub intern_tier: TierStats,
    /// backend 持有的 word 数
    pub backend_words: usize,
    /// 进程级 RSS（从 /proc/self/statm 读取）
    pub process_rss_bytes: u64,
}

impl CacheReport {
    /// 从 /proc/self/statm 读取进程 RSS
    pub fn read_process_rss() -> u64 {
        std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|s| {
                // statm 格式: size resident shared text lib data dt (单位: 页)
                let parts: Vec<&str> = s.split_whitespace().collect();
                parts.get(1)?.parse::<u64>().ok()
            })
            .map(|pages| pages * 4096) // x86_64 page size
            .unwrap_or(0)
    }
}

fn human_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

impl fmt::Display for CacheReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           rwi-cache Cache Report                 ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(
            f,
            "║ Process RSS: {:>35} ║",
            human_bytes(self.process_rss_bytes)
        )?;
        writeln!(
            f,
            "║ Flush state: {:>35} ║",
            if self.flushing { "FLUSHING" } else { "IDLE" }
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        for (label, t) in [("extern", &self.extern_tier), ("intern", &self.intern_tier)] {
            writeln!(f, "║ {} tier:                                     ║", label)?;
            writeln!(
                f,
                "║   words:        {:>10} / {:<10}          ║",
                t.words, t.max_words
            )?;
            writeln!(
                f,
                "║   postings:     {:>10}                       ║",
                t.urls
            )?;
        }
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(
            f,
            "║ Backend words:  {:>10}                       ║",
            self.backend_words
        )?;
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_bytes_scales() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.00 KB");
        assert_eq!(human_bytes(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn display_renders_both_tiers() {
        let r = CacheReport {
            extern_tier: TierStats {
                words: 3,
                max_words: 10,
                urls: 7,
            },
            ..Default::default()
        };
        let s = r.to_string();
        assert!(s.contains("extern tier"));
        assert!(s.contains("intern tier"));
        assert!(s.contains("IDLE"));
    }
}
