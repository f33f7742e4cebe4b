// block_cache.rs — ダイレクトマップ方式のライトバック・ブロックキャッシュ
//
// ブロックデバイスとファイルシステムの間に入り、最近使ったブロックを
// 保持してデバイス I/O を減らす。書き込みはスロットに溜めておき、
// 追い出されるときか sync() のときにまとめてデバイスへ書き戻す。
//
// ## 設計概要
//
// - スロット数は初期化時に固定。記述子とブロックデータはまとめて 1 回だけ確保する
// - (デバイス, ブロック番号) から 1 つのスロットがハッシュで決まる。
//   チェインも再探索もしないので、衝突した相手は必ず追い出される
// - 各スロットは spin::Mutex で守る。ロックを保持している間がそのスロットの
//   LOCKED 状態で、同じスロットへの読み書きは直列化される
// - 異なるスロット間には順序の保証がない
//
// スロットの状態遷移:
//   EMPTY → CLEAN → DIRTY → (追い出しで書き戻し) → 新しい内容で CLEAN
//
// デバイスのエラーは解釈せずにそのまま返す。自動リトライもしない。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use k68_blockdev::{check_buffer, BlockDevice, BlockError, BLOCK_SIZE};
use spin::Mutex;

use crate::error::KernelError;

/// 起動時に使うデフォルトのスロット数
pub const DEFAULT_CACHE_BLOCKS: usize = 64;

/// スロット選択ハッシュの乗数（2^32 / 黄金比に近い素数）
pub const HASH_PRIME: u32 = 2_654_435_761;

/// スレッド間で共有できるブロックデバイスへの参照
pub type DeviceRef = Arc<Mutex<dyn BlockDevice + Send>>;

/// キャッシュから見たデバイス。
///
/// `id` がハッシュとスロット照合に使うデバイスの同一性。
/// 同じ id で別のデバイスを登録してはいけない。
#[derive(Clone)]
pub struct CacheDevice {
    id: u32,
    device: DeviceRef,
}

impl CacheDevice {
    pub fn new(id: u32, device: DeviceRef) -> Self {
        CacheDevice { id, device }
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

/// キャッシュスロット 1 つ分（記述子 + ブロックデータ）
struct Slot {
    /// このスロットを占めているデバイス。None なら空
    device: Option<CacheDevice>,
    /// このスロットを占めているブロック番号
    block: u32,
    /// デバイスより新しい内容を持っている
    dirty: bool,
    data: [u8; BLOCK_SIZE],
}

impl Slot {
    const fn empty() -> Self {
        Slot {
            device: None,
            block: 0,
            dirty: false,
            data: [0; BLOCK_SIZE],
        }
    }

    fn holds(&self, device_id: u32, block: u32) -> bool {
        matches!(&self.device, Some(d) if d.id == device_id) && self.block == block
    }
}

/// キャッシュの統計カウンタ。
///
/// ロックを取らずに読むので、並行して動いている操作に対しては近似値。
#[derive(Debug, Default)]
pub struct CacheStats {
    pub reads: AtomicU32,
    pub hits: AtomicU32,
    pub misses: AtomicU32,
    /// ダーティなブロックを追い出して書き戻した回数
    pub evictions: AtomicU32,
    pub writes: AtomicU32,
    /// 追い出しと sync を合わせたデバイスへの書き戻し回数
    pub write_backs: AtomicU32,
}

/// CacheStats のある時点の値
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStatsSnapshot {
    pub reads: u32,
    pub hits: u32,
    pub misses: u32,
    pub evictions: u32,
    pub writes: u32,
    pub write_backs: u32,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            write_backs: self.write_backs.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// ダイレクトマップ方式のライトバック・キャッシュ
pub struct BlockCache {
    slots: Vec<Mutex<Slot>>,
    stats: CacheStats,
}

impl BlockCache {
    /// `cache_size` スロットのキャッシュを作る。
    ///
    /// 記述子とデータ領域はここで 1 回だけヒープから確保し、以後は再確保しない。
    ///
    /// # エラー
    /// - `InvalidArgument`: cache_size が 0
    /// - `OutOfMemory`: ヒープが足りない
    pub fn new(cache_size: usize) -> Result<Self, KernelError> {
        if cache_size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(cache_size)
            .map_err(|_| KernelError::OutOfMemory)?;
        for _ in 0..cache_size {
            slots.push(Mutex::new(Slot::empty()));
        }
        log::info!(
            "block_cache: {} slots ({} KiB)",
            cache_size,
            cache_size * BLOCK_SIZE / 1024
        );
        Ok(BlockCache {
            slots,
            stats: CacheStats::default(),
        })
    }

    /// スロット数
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// (デバイス, ブロック) が対応するスロット番号。
    ///
    /// `((id XOR block) * HASH_PRIME) mod スロット数`。乗算は 32 ビットで折り返す。
    pub fn slot_for(&self, device_id: u32, block: u32) -> usize {
        ((device_id ^ block).wrapping_mul(HASH_PRIME) as usize) % self.slots.len()
    }

    /// 統計カウンタへの参照。ロックは取らない
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// 1 ブロック読み込む。
    ///
    /// スロットに目的のブロックがなければ、ダーティな先住者を元のデバイスに
    /// 書き戻してから（失敗したらスロットはそのまま）デバイスから読み込む。
    /// 最後にスロットの内容を `buf` にコピーする。
    pub fn read(&self, device: &CacheDevice, block: u32, buf: &mut [u8]) -> Result<(), BlockError> {
        check_buffer(buf.len(), 1)?;
        CacheStats::bump(&self.stats.reads);

        let mut slot = self.slots[self.slot_for(device.id, block)].lock();
        if slot.holds(device.id, block) {
            CacheStats::bump(&self.stats.hits);
        } else {
            CacheStats::bump(&self.stats.misses);
            self.evict(&mut slot)?;

            let result = device.device.lock().read_block(block, &mut slot.data);
            if let Err(e) = result {
                // 中身が半端になっているかもしれないので空にしておく
                slot.device = None;
                return Err(e);
            }
            slot.device = Some(device.clone());
            slot.block = block;
            slot.dirty = false;
        }
        buf[..BLOCK_SIZE].copy_from_slice(&slot.data);
        Ok(())
    }

    /// `start` から `count` ブロックを順に読み込む。
    ///
    /// 最初のエラーで中断し、それ以降のブロックは読まない。
    pub fn read_multi(
        &self,
        device: &CacheDevice,
        start: u32,
        count: usize,
        buf: &mut [u8],
    ) -> Result<(), BlockError> {
        check_buffer(buf.len(), count)?;
        for (i, chunk) in buf.chunks_exact_mut(BLOCK_SIZE).take(count).enumerate() {
            let block = block_at(start, i)?;
            self.read(device, block, chunk)?;
        }
        Ok(())
    }

    /// 1 ブロック書き込む（ライトバック）。
    ///
    /// デバイスにはまだ書かず、スロットをダーティにするだけ。
    /// スロットに別のダーティなブロックがあれば先に書き戻す。
    pub fn write(&self, device: &CacheDevice, block: u32, buf: &[u8]) -> Result<(), BlockError> {
        check_buffer(buf.len(), 1)?;
        CacheStats::bump(&self.stats.writes);

        let mut slot = self.slots[self.slot_for(device.id, block)].lock();
        if !slot.holds(device.id, block) {
            self.evict(&mut slot)?;
            slot.device = Some(device.clone());
            slot.block = block;
        }
        slot.data.copy_from_slice(&buf[..BLOCK_SIZE]);
        slot.dirty = true;
        Ok(())
    }

    /// `start` から `count` ブロックを順に書き込む。最初のエラーで中断する
    pub fn write_multi(
        &self,
        device: &CacheDevice,
        start: u32,
        count: usize,
        buf: &[u8],
    ) -> Result<(), BlockError> {
        check_buffer(buf.len(), count)?;
        for (i, chunk) in buf.chunks_exact(BLOCK_SIZE).take(count).enumerate() {
            let block = block_at(start, i)?;
            self.write(device, block, chunk)?;
        }
        Ok(())
    }

    /// ダーティなスロットをすべて書き戻す。
    ///
    /// スロット番号の順に処理し、最初の失敗でそのまま中断する。
    /// それまでに書き戻したスロットはクリーンになっている。
    pub fn sync(&self) -> Result<(), BlockError> {
        let mut flushed = 0usize;
        for slot in self.slots.iter() {
            let mut slot = slot.lock();
            if !slot.dirty {
                continue;
            }
            if let Some(owner) = &slot.device {
                self.write_back(owner, slot.block, &slot.data)?;
                flushed += 1;
            }
            slot.dirty = false;
        }
        if flushed > 0 {
            log::debug!("block_cache: sync flushed {} blocks", flushed);
        }
        Ok(())
    }

    /// スロットの先住者がダーティなら元のデバイスへ書き戻す
    fn evict(&self, slot: &mut Slot) -> Result<(), BlockError> {
        if !slot.dirty {
            return Ok(());
        }
        if let Some(owner) = &slot.device {
            self.write_back(owner, slot.block, &slot.data)?;
            CacheStats::bump(&self.stats.evictions);
        }
        slot.dirty = false;
        Ok(())
    }

    fn write_back(&self, owner: &CacheDevice, block: u32, data: &[u8]) -> Result<(), BlockError> {
        if let Err(e) = owner.device.lock().write_block(block, data) {
            log::warn!(
                "block_cache: write-back of block {} to device {} failed: {}",
                block,
                owner.id,
                e
            );
            return Err(e);
        }
        CacheStats::bump(&self.stats.write_backs);
        Ok(())
    }
}

/// `start + i` をブロック番号として求める。u32 を超えたら InvalidArgument
fn block_at(start: u32, i: usize) -> Result<u32, BlockError> {
    u32::try_from(i)
        .ok()
        .and_then(|i| start.checked_add(i))
        .ok_or(BlockError::InvalidArgument)
}
