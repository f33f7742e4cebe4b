// memory.rs — 物理メモリのエクステント表
//
// 起動時にプラットフォーム固有のプローブ処理が見つけた物理メモリ領域を
// {base, length, flags} の組として記録する。記録が終わった後は読み取り専用で、
// ヒープやスラブの初期化処理がここから使える RAM を探す。
//
// ヒープが立ち上がる前に埋める表なので、Vec ではなく固定長配列で持つ。
// 仮想メモリはないので、アドレスはそのまま物理アドレス。

use core::ops::BitOr;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::error::KernelError;

/// 表に登録できるエクステントの最大数
pub const MAX_EXTENTS: usize = 16;

/// エクステントの属性ビット。
///
/// 所有者 (USER/KERNEL) と種別 (RAM/ROM/PERIPHERAL/VACANT) を OR で組み合わせる。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtentFlags(u32);

impl ExtentFlags {
    pub const NONE: ExtentFlags = ExtentFlags(0);
    pub const USER: ExtentFlags = ExtentFlags(1 << 0);
    pub const KERNEL: ExtentFlags = ExtentFlags(1 << 1);
    pub const RAM: ExtentFlags = ExtentFlags(1 << 2);
    pub const ROM: ExtentFlags = ExtentFlags(1 << 3);
    pub const PERIPHERAL: ExtentFlags = ExtentFlags(1 << 4);
    pub const VACANT: ExtentFlags = ExtentFlags(1 << 5);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        ExtentFlags(bits)
    }

    /// `mask` のビットをすべて含んでいれば true。
    /// 空のマスクはどのエクステントにもマッチする。
    pub const fn contains(self, mask: ExtentFlags) -> bool {
        self.0 & mask.0 == mask.0
    }
}

impl BitOr for ExtentFlags {
    type Output = ExtentFlags;

    fn bitor(self, rhs: ExtentFlags) -> ExtentFlags {
        ExtentFlags(self.0 | rhs.0)
    }
}

/// 連続した物理メモリ領域 1 つ分
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryExtent {
    /// 先頭の物理アドレス
    pub base: usize,
    /// 長さ（バイト）
    pub length: usize,
    /// 属性
    pub flags: ExtentFlags,
}

impl MemoryExtent {
    pub const fn new(base: usize, length: usize, flags: ExtentFlags) -> Self {
        MemoryExtent { base, length, flags }
    }

    /// 末尾アドレス（排他的）。アドレス空間を一周する場合は None。
    pub fn end(&self) -> Option<usize> {
        self.base.checked_add(self.length)
    }

    /// `base < addr < base + length` なら true。
    ///
    /// 両端とも厳密な比較なので、先頭アドレスちょうどは含まれない。
    fn strictly_contains(&self, addr: usize) -> bool {
        self.base < addr && addr < self.base + self.length
    }

    fn overlaps(&self, other: &MemoryExtent) -> bool {
        self.base < other.base + other.length && other.base < self.base + self.length
    }
}

/// エクステント表。
///
/// 登録順を保持する。問い合わせはすべて線形走査。
pub struct ExtentRegistry {
    extents: [Option<MemoryExtent>; MAX_EXTENTS],
    count: usize,
}

impl ExtentRegistry {
    /// 空の表を作る。const fn なので static の初期化にも使える。
    pub const fn new() -> Self {
        ExtentRegistry {
            extents: [None; MAX_EXTENTS],
            count: 0,
        }
    }

    /// エクステントを末尾に追加する。
    ///
    /// # エラー
    /// - `InvalidArgument`: 長さ 0、アドレス空間の折り返し、既存エクステントとの重なり
    /// - `OutOfMemory`: 表が満杯
    pub fn add(&mut self, extent: MemoryExtent) -> Result<(), KernelError> {
        if extent.length == 0 || extent.end().is_none() {
            return Err(KernelError::InvalidArgument);
        }
        if self.iter().any(|e| e.overlaps(&extent)) {
            return Err(KernelError::InvalidArgument);
        }
        if self.count == MAX_EXTENTS {
            return Err(KernelError::OutOfMemory);
        }
        self.extents[self.count] = Some(extent);
        self.count += 1;
        Ok(())
    }

    /// 登録順にエクステントを列挙する
    pub fn iter(&self) -> impl Iterator<Item = &MemoryExtent> {
        self.extents[..self.count].iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn matching(&self, mask: ExtentFlags) -> impl Iterator<Item = &MemoryExtent> {
        self.iter().filter(move |e| e.flags.contains(mask))
    }

    /// `mask` にマッチする中で最も長いエクステントを返す。
    /// 同じ長さなら先に登録されたものが勝つ。
    pub fn largest_extent(&self, mask: ExtentFlags) -> Option<&MemoryExtent> {
        let mut best: Option<&MemoryExtent> = None;
        for e in self.matching(mask) {
            if best.is_none_or(|b| e.length > b.length) {
                best = Some(e);
            }
        }
        best
    }

    /// `mask` にマッチするエクステントの長さの合計
    pub fn total_size(&self, mask: ExtentFlags) -> usize {
        self.matching(mask).map(|e| e.length).sum()
    }

    /// `mask` にマッチするエクステントの末尾アドレスの最大値。
    /// 1 つもマッチしなければ 0（ヌルアドレス）。
    pub fn highest_address(&self, mask: ExtentFlags) -> usize {
        self.matching(mask)
            .map(|e| e.base + e.length)
            .max()
            .unwrap_or(0)
    }

    /// `addr` を（開区間として）含むエクステントを返す
    pub fn containing_extent(&self, addr: usize) -> Option<&MemoryExtent> {
        self.iter().find(|e| e.strictly_contains(addr))
    }
}

impl Default for ExtentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    /// システム全体のエクステント表。
    /// 起動時のプローブ処理が埋め、アロケータ初期化より前に完成していること。
    pub static ref EXTENTS: Mutex<ExtentRegistry> = Mutex::new(ExtentRegistry::new());
}

/// プラットフォームのプローブ処理から呼ばれる登録口
pub fn register_extent(
    base: usize,
    length: usize,
    flags: ExtentFlags,
) -> Result<(), KernelError> {
    let extent = MemoryExtent::new(base, length, flags);
    EXTENTS.lock().add(extent)?;
    log::debug!(
        "memory: extent {:#x}-{:#x} flags={:#x}",
        base,
        base + length,
        flags.bits()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KRAM: ExtentFlags =
        ExtentFlags::from_bits(ExtentFlags::KERNEL.bits() | ExtentFlags::RAM.bits());
    const URAM: ExtentFlags =
        ExtentFlags::from_bits(ExtentFlags::USER.bits() | ExtentFlags::RAM.bits());

    fn sample() -> ExtentRegistry {
        let mut reg = ExtentRegistry::new();
        let rom = ExtentFlags::ROM | ExtentFlags::KERNEL;
        reg.add(MemoryExtent::new(0x0000_0000, 0x1_0000, rom)).unwrap();
        reg.add(MemoryExtent::new(0x0001_0000, 0x4_0000, KRAM)).unwrap();
        reg.add(MemoryExtent::new(0x0010_0000, 0x8_0000, URAM)).unwrap();
        reg.add(MemoryExtent::new(0x0020_0000, 0x8_0000, URAM)).unwrap();
        reg.add(MemoryExtent::new(0x00F0_0000, 0x1000, ExtentFlags::PERIPHERAL)).unwrap();
        reg
    }

    #[test]
    fn test_total_size_matches_manual_sum() {
        let reg = sample();
        let masks = [
            KRAM,
            URAM,
            ExtentFlags::RAM,
            ExtentFlags::KERNEL,
            ExtentFlags::NONE,
            ExtentFlags::VACANT,
        ];
        for mask in masks {
            let manual: usize = reg
                .iter()
                .filter(|e| e.flags.bits() & mask.bits() == mask.bits())
                .map(|e| e.length)
                .sum();
            assert_eq!(reg.total_size(mask), manual);
        }
        assert_eq!(reg.total_size(ExtentFlags::RAM), 0x4_0000 + 0x8_0000 + 0x8_0000);
    }

    #[test]
    fn test_largest_extent_first_found_wins_ties() {
        let reg = sample();
        let largest = reg.largest_extent(URAM).unwrap();
        assert_eq!(largest.base, 0x0010_0000);
        for e in reg.iter().filter(|e| e.flags.contains(URAM)) {
            assert!(largest.length >= e.length);
        }
        assert_eq!(reg.largest_extent(KRAM).unwrap().base, 0x0001_0000);
        assert!(reg.largest_extent(ExtentFlags::VACANT).is_none());
    }

    #[test]
    fn test_highest_address() {
        let reg = sample();
        assert_eq!(reg.highest_address(ExtentFlags::RAM), 0x0028_0000);
        assert_eq!(reg.highest_address(KRAM), 0x0005_0000);
        assert_eq!(reg.highest_address(ExtentFlags::VACANT), 0);
    }

    #[test]
    fn test_containing_extent_excludes_exact_base() {
        let reg = sample();
        // 先頭ちょうどは含まれない（厳密比較）
        assert!(reg.containing_extent(0x0001_0000).is_none());
        assert_eq!(reg.containing_extent(0x0001_0001).unwrap().base, 0x0001_0000);
        assert_eq!(reg.containing_extent(0x0004_FFFF).unwrap().base, 0x0001_0000);
        // 末尾（排他的）も含まれない
        assert!(reg.containing_extent(0x0008_0000).is_none());
        assert!(reg.containing_extent(0x00E0_0000).is_none());
    }

    #[test]
    fn test_add_rejects_bad_extents() {
        let mut reg = sample();
        assert_eq!(
            reg.add(MemoryExtent::new(0x0003_0000, 0x100, KRAM)),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            reg.add(MemoryExtent::new(0x0040_0000, 0, KRAM)),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            reg.add(MemoryExtent::new(usize::MAX - 0xF, 0x20, KRAM)),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(reg.len(), 5);
    }

    #[test]
    fn test_add_until_full() {
        let mut reg = ExtentRegistry::new();
        for i in 0..MAX_EXTENTS {
            reg.add(MemoryExtent::new(i * 0x1000, 0x1000, ExtentFlags::VACANT)).unwrap();
        }
        assert_eq!(
            reg.add(MemoryExtent::new(0x10_0000, 0x1000, ExtentFlags::VACANT)),
            Err(KernelError::OutOfMemory)
        );
        assert_eq!(reg.iter().count(), MAX_EXTENTS);
    }

    #[test]
    fn test_register_extent_fills_global_table() {
        // EXTENTS に触るのはこのテストだけ
        let base = 0x7000_0000;
        register_extent(base, 0x1_0000, KRAM).unwrap();
        register_extent(base + 0x1_0000, 0x2_0000, URAM).unwrap();

        // 重なり・長さ 0・折り返しは拒否され、表は変わらない
        assert_eq!(
            register_extent(base + 0x8000, 0x100, KRAM),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            register_extent(base + 0x4_0000, 0, KRAM),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            register_extent(usize::MAX - 0xF, 0x20, KRAM),
            Err(KernelError::InvalidArgument)
        );

        let table = EXTENTS.lock();
        assert_eq!(table.len(), 2);
        assert_eq!(table.largest_extent(URAM).unwrap().base, base + 0x1_0000);
        assert_eq!(table.containing_extent(base + 1).unwrap().flags, KRAM);
        assert_eq!(table.highest_address(ExtentFlags::RAM), base + 0x3_0000);
    }
}
