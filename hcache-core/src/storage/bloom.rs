//! # Bloom Filter
//!
//! 磁盘键集合的近似成员测试。没有假阴性：只要 `put` 过的键，
//! `might_contain` 一定返回 `true`。删除的键不会从过滤器中移除，
//! 只会产生假阳性。
//!
//! 哈希：`xxh3_128(key)` 拆成两个 64 位半值做 double hashing，
//! 第 i 个探针为 `h1 + i * h2 (mod m)`。

use xxhash_rust::xxh3::xxh3_128;

/// 默认假阳性率
pub const DEFAULT_FPP: f64 = 0.03;

/// 最小预期容量
pub const MIN_EXPECTED_INSERTIONS: u64 = 64 * 1024;

const MAX_HASHES: u32 = 16;

/// 位数组 Bloom filter
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    inserted: u64,
}

impl BloomFilter {
    /// 按预期插入数与默认假阳性率创建
    pub fn with_capacity(expected_insertions: u64) -> Self {
        Self::with_fpp(expected_insertions, DEFAULT_FPP)
    }

    pub fn with_fpp(expected_insertions: u64, fpp: f64) -> Self {
        let n = expected_insertions.max(1) as f64;
        let fpp = fpp.clamp(f64::MIN_POSITIVE, 0.5);
        let ln2 = std::f64::consts::LN_2;

        let m = (-n * fpp.ln() / (ln2 * ln2)).ceil().max(64.0) as u64;
        let words = m.saturating_add(63) as usize / 64;
        let num_bits = words as u64 * 64;
        let k = ((num_bits as f64 / n) * ln2).round() as u32;

        Self {
            bits: vec![0; words],
            num_bits,
            num_hashes: k.clamp(1, MAX_HASHES),
            inserted: 0,
        }
    }

    /// 磁盘表的过滤器容量：`max(64K, 2 * 行数)`
    pub fn sized_for(row_count: u64) -> Self {
        Self::with_capacity(MIN_EXPECTED_INSERTIONS.max(row_count.saturating_mul(2)))
    }

    pub fn put(&mut self, key: &[u8]) {
        let (h1, h2) = split_hash(key);
        for i in 0..self.num_hashes as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.bits[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
        self.inserted += 1;
    }

    pub fn might_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = split_hash(key);
        (0..self.num_hashes as u64).all(|i| {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.bits[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0
        })
    }

    pub fn bit_size(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// 累计 `put` 次数（含重复键）
    pub fn insertions(&self) -> u64 {
        self.inserted
    }
}

fn split_hash(key: &[u8]) -> (u64, u64) {
    let h = xxh3_128(key);
    let h1 = h as u64;
    // h2 为奇数，保证探针序列遍历不同位置
    let h2 = ((h >> 64) as u64) | 1;
    (h1, h2)
}
