// slab_allocator.rs — ビットマップ方式のスラブアロケータ
//
// ファイルシステムのノード、ルーティングエントリ、パケットバッファなど、
// 小さくて頻繁に確保・解放される固定サイズのカーネルオブジェクト用のアロケータ。
//
// ## 設計概要
//
// 起動時に 1 つの連続領域をエクステント表からもらい、SLAB_SIZE バイトずつ
// NSLABS 個のスラブに切り分ける。スラブ i はサイズクラス
// 2^(SLAB_MIN_RADIX + i) バイト専用で、サイズクラスごとにスラブは 1 つだけ。
//
// 各スラブの空き管理は 1 オブジェクト 1 ビットのビットマップ（1 = 使用中）。
// ビットマップ自身はスラブ先頭のオブジェクトスロットに置き、
// そのスロットは作成時に使用中としてマークしておく。
//
// 確保時はビットマップを 32 ビットずつ走査し、全ビットが立っていないワードの
// 最下位の 0 ビットを使う。番号の小さいオブジェクトが常に優先される。
//
// 確保結果は生ポインタではなく (スラブ番号, オブジェクト番号) の
// SlabObject ハンドルで返す。アドレスからハンドルへの逆引きも O(1)。
//
// このモジュール自体はロックを持たない。排他制御は allocator.rs 側の
// spin::Mutex で行う。

use core::ptr;

use crate::error::KernelError;

// =============================================================================
// サイズクラスの定義
// =============================================================================

/// スラブ 1 つの大きさの log2
pub const SLAB_SIZE_LOG2: usize = 10;

/// スラブ 1 つの大きさ（バイト）
pub const SLAB_SIZE: usize = 1 << SLAB_SIZE_LOG2;

/// 最小のサイズクラス（2^1 = 2 バイト）
pub const SLAB_MIN_RADIX: u32 = 1;

/// 最大のサイズクラス（2^6 = 64 バイト）
pub const SLAB_MAX_RADIX: u32 = 6;

/// スラブの数（= サイズクラスの数）
pub const NSLABS: usize = (SLAB_MAX_RADIX - SLAB_MIN_RADIX + 1) as usize;

/// init() が必要とする領域の大きさ
pub const SLAB_REGION_SIZE: usize = NSLABS * SLAB_SIZE;

/// ビットマップの 1 ワードあたりのビット数
const WORD_BITS: usize = 32;

// =============================================================================
// SlabObject — 確保済みオブジェクトのハンドル
// =============================================================================

/// スラブから確保したオブジェクトを指すハンドル。
///
/// `slab` はスラブ配列のインデックス、`index` はスラブ内のオブジェクト番号。
/// 実アドレスは `SlabAllocator::address_of()` で求める。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabObject {
    slab: usize,
    index: usize,
}

impl SlabObject {
    pub fn slab_index(&self) -> usize {
        self.slab
    }

    pub fn object_index(&self) -> usize {
        self.index
    }

    /// このオブジェクトのサイズクラス（radix）
    pub fn radix(&self) -> u32 {
        SLAB_MIN_RADIX + self.slab as u32
    }

    /// このオブジェクトの大きさ（バイト）
    pub fn size(&self) -> usize {
        1 << self.radix()
    }
}

// =============================================================================
// Slab — 1 つのサイズクラスを受け持つスラブ
// =============================================================================

/// SLAB_SIZE バイトの領域を 2^radix バイトのオブジェクトに等分したもの。
#[derive(Debug, Clone, Copy)]
struct Slab {
    /// 領域の先頭アドレス。ビットマップもここから始まる
    base: usize,
    /// サイズクラス。作成後は変わらない
    radix: u32,
}

impl Slab {
    const fn empty() -> Self {
        Slab { base: 0, radix: 0 }
    }

    /// オブジェクト数 N = SLAB_SIZE / 2^radix
    fn object_count(&self) -> usize {
        SLAB_SIZE >> self.radix
    }

    /// ビットマップの大きさ ⌈N/8⌉ バイト
    fn bitmap_bytes(&self) -> usize {
        self.object_count().div_ceil(8)
    }

    fn bitmap_words(&self) -> usize {
        self.object_count().div_ceil(WORD_BITS)
    }

    /// ビットマップ自身が占めるオブジェクト数 ⌈ビットマップの大きさ / オブジェクトサイズ⌉
    fn reserved_objects(&self) -> usize {
        self.bitmap_bytes().div_ceil(1 << self.radix)
    }

    fn word_ptr(&self, word: usize) -> *mut u32 {
        (self.base as *mut u32).wrapping_add(word)
    }

    /// ビットマップのワードを読む。
    ///
    /// メモリ上はリトルエンディアンで持つので、CPU のエンディアンに関係なく
    /// オブジェクト i のビットはビットマップの (i / 8) バイト目の (i % 8) ビット目になる。
    fn read_word(&self, word: usize) -> u32 {
        // SAFETY: init() の前提により base から bitmap_words() ワードは
        // このスラブ専用の書き込み可能なメモリ
        u32::from_le(unsafe { ptr::read(self.word_ptr(word)) })
    }

    fn write_word(&mut self, word: usize, value: u32) {
        // SAFETY: read_word() と同じ
        unsafe { ptr::write(self.word_ptr(word), value.to_le()) }
    }

    /// スラブを初期化する。
    ///
    /// ビットマップを 0 クリアしてから、ビットマップ自身が載っている
    /// スロットと、最終ワードのうち実在しないオブジェクトのビットを立てる。
    fn init(&mut self, base: usize, radix: u32) {
        self.base = base;
        self.radix = radix;

        for w in 0..self.bitmap_words() {
            self.write_word(w, 0);
        }
        for index in 0..self.reserved_objects() {
            self.set_bit(index);
        }
        for index in self.object_count()..self.bitmap_words() * WORD_BITS {
            self.set_bit(index);
        }
    }

    fn set_bit(&mut self, index: usize) {
        let w = index / WORD_BITS;
        let word = self.read_word(w);
        self.write_word(w, word | (1 << (index % WORD_BITS)));
    }

    fn clear_bit(&mut self, index: usize) {
        let w = index / WORD_BITS;
        let word = self.read_word(w);
        self.write_word(w, word & !(1 << (index % WORD_BITS)));
    }

    fn test_bit(&self, index: usize) -> bool {
        self.read_word(index / WORD_BITS) & (1 << (index % WORD_BITS)) != 0
    }

    /// 空いている最小番号のオブジェクトを確保する。
    /// 満杯なら何も変更せずに None。
    fn alloc(&mut self) -> Option<usize> {
        for w in 0..self.bitmap_words() {
            let word = self.read_word(w);
            if let Some(bit) = lowest_clear_bit(word) {
                self.write_word(w, word | (1 << bit));
                return Some(w * WORD_BITS + bit as usize);
            }
        }
        None
    }

    fn free_count(&self) -> usize {
        (0..self.bitmap_words())
            .map(|w| self.read_word(w).count_zeros() as usize)
            .sum()
    }
}

/// 32 ビットワード中の最下位の 0 ビットの位置を返す。全ビット 1 なら None。
///
/// 下位から連続する 1 の数がそのまま最初の 0 の位置になる。
#[inline]
pub fn lowest_clear_bit(word: u32) -> Option<u32> {
    if word == u32::MAX {
        None
    } else {
        Some(word.trailing_ones())
    }
}

// =============================================================================
// SlabAllocator — スラブアロケータ本体
// =============================================================================

/// サイズクラスごとに 1 つずつ、計 NSLABS 個のスラブを束ねたアロケータ。
pub struct SlabAllocator {
    /// スラブ領域全体の先頭アドレス
    region_base: usize,
    /// radix の小さい順に並んだスラブ
    slabs: [Slab; NSLABS],
    /// init() 済みかどうか
    ready: bool,
}

impl SlabAllocator {
    /// 未初期化状態のアロケータを作成する。
    /// const fn なので static 変数の初期化に使える。
    pub const fn new() -> Self {
        SlabAllocator {
            region_base: 0,
            slabs: [Slab::empty(); NSLABS],
            ready: false,
        }
    }

    /// スラブアロケータを初期化する。
    ///
    /// `base` から SLAB_SIZE バイトずつ、radix の小さい順にスラブを切り出す。
    /// 失敗はしない。領域の大きさは検査しない（呼び出し側の前提条件）。
    ///
    /// # Safety
    /// - `base..base + SLAB_REGION_SIZE` が書き込み可能で、このアロケータ専用であること
    /// - `base` が 4 バイト境界に揃っていること
    pub unsafe fn init(&mut self, base: usize) {
        debug_assert!(base % core::mem::align_of::<u32>() == 0);
        self.region_base = base;
        let mut slab_base = base;
        for (i, slab) in self.slabs.iter_mut().enumerate() {
            slab.init(slab_base, SLAB_MIN_RADIX + i as u32);
            slab_base += SLAB_SIZE;
        }
        self.ready = true;
    }

    /// 要求サイズを受け持つサイズクラス（radix）を求める。
    ///
    /// 次の 2 のべき乗に切り上げる。SLAB_MIN_RADIX 未満は SLAB_MIN_RADIX に揃え、
    /// SLAB_MAX_RADIX を超える場合と 0 の場合は None。
    pub fn size_class(size: usize) -> Option<u32> {
        if size == 0 {
            return None;
        }
        let radix = usize::BITS - (size - 1).leading_zeros();
        let radix = radix.max(SLAB_MIN_RADIX);
        if radix > SLAB_MAX_RADIX { None } else { Some(radix) }
    }

    /// `size` バイトのオブジェクトを確保する。
    ///
    /// # エラー
    /// - `InvalidArgument`: size が 0、またはどのサイズクラスにも収まらない
    ///   （呼び出し側はヒープにフォールバックする）
    /// - `OutOfMemory`: 該当クラスのスラブが満杯、または未初期化
    pub fn allocate(&mut self, size: usize) -> Result<SlabObject, KernelError> {
        let radix = Self::size_class(size).ok_or(KernelError::InvalidArgument)?;
        self.allocate_radix(radix)
    }

    /// サイズクラスを直接指定して確保する
    pub fn allocate_radix(&mut self, radix: u32) -> Result<SlabObject, KernelError> {
        if !(SLAB_MIN_RADIX..=SLAB_MAX_RADIX).contains(&radix) {
            return Err(KernelError::InvalidArgument);
        }
        if !self.ready {
            return Err(KernelError::OutOfMemory);
        }
        let slab = (radix - SLAB_MIN_RADIX) as usize;
        match self.slabs[slab].alloc() {
            Some(index) => Ok(SlabObject { slab, index }),
            None => Err(KernelError::OutOfMemory),
        }
    }

    /// オブジェクトを解放する。
    ///
    /// 二重解放や別のアロケータのハンドルは検出しない。
    /// ビットマップが壊れるだけで、結果は未定義。
    pub fn free(&mut self, object: SlabObject) {
        let slab = &mut self.slabs[object.slab];
        debug_assert!(object.index >= slab.reserved_objects());
        slab.clear_bit(object.index);
    }

    /// ハンドルの指すオブジェクトの先頭アドレス
    pub fn address_of(&self, object: SlabObject) -> usize {
        let slab = &self.slabs[object.slab];
        slab.base + (object.index << slab.radix)
    }

    /// アドレスから所有スラブとオブジェクト番号を逆引きする。
    ///
    /// スラブ領域の外なら None。領域内ならオブジェクト境界に切り捨てる。
    pub fn object_at(&self, addr: usize) -> Option<SlabObject> {
        if !self.ready || addr < self.region_base || addr >= self.region_base + SLAB_REGION_SIZE {
            return None;
        }
        let slab = (addr - self.region_base) >> SLAB_SIZE_LOG2;
        let index = (addr - self.slabs[slab].base) >> self.slabs[slab].radix;
        Some(SlabObject { slab, index })
    }

    /// オブジェクトが使用中かどうか（診断用）
    pub fn is_allocated(&self, object: SlabObject) -> bool {
        self.slabs[object.slab].test_bit(object.index)
    }

    /// サイズクラス `radix` の空きオブジェクト数
    pub fn free_objects(&self, radix: u32) -> usize {
        match self.slab_for(radix) {
            Some(slab) => slab.free_count(),
            None => 0,
        }
    }

    /// サイズクラス `radix` で確保できるオブジェクトの総数（ビットマップ分を除く）
    pub fn capacity(&self, radix: u32) -> usize {
        match self.slab_for(radix) {
            Some(slab) => slab.object_count() - slab.reserved_objects(),
            None => 0,
        }
    }

    /// ビットマップのために予約されたオブジェクト数
    pub fn reserved_objects(&self, radix: u32) -> usize {
        match self.slab_for(radix) {
            Some(slab) => slab.reserved_objects(),
            None => 0,
        }
    }

    /// スラブ領域全体 (先頭, 大きさ)
    pub fn region(&self) -> (usize, usize) {
        (self.region_base, SLAB_REGION_SIZE)
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    fn slab_for(&self, radix: u32) -> Option<&Slab> {
        if !self.ready || !(SLAB_MIN_RADIX..=SLAB_MAX_RADIX).contains(&radix) {
            return None;
        }
        Some(&self.slabs[(radix - SLAB_MIN_RADIX) as usize])
    }
}

impl Default for SlabAllocator {
    fn default() -> Self {
        Self::new()
    }
}
