// allocator.rs — kmalloc / umalloc のフロントエンド
//
// スラブアロケータ、カーネルヒープ、ユーザーヒープの 3 つを束ね、
// それぞれを spin::Mutex で包んで公開する。下位モジュールはロックを持たないので、
// 排他制御はすべてこの境界で行う。
//
// ## 設計概要
//
// - kmalloc 系: まずスラブに頼み、サイズクラス外かクラスが満杯なら
//   カーネルヒープにフォールバックする
// - umalloc 系: ユーザーヒープだけを使う。カーネルヒープとはフリーリストを共有しない
// - kfree は、アドレスがスラブ領域に入っていればスラブへ、そうでなければ
//   カーネルヒープへ返す
// - 2 つ以上のロックを同時に取ることはない
//
// 起動時の init() はエクステント表から領域を選ぶ。
//   スラブ領域 + カーネルヒープ: KERNEL|RAM の最大エクステント
//   ユーザーヒープ: USER|RAM の最大エクステント（同じエクステントなら半分ずつ）
//
// KernelAllocator を #[global_allocator] に指定すれば alloc crate の
// Vec, Box なども同じ経路で確保される。

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use spin::Mutex;

use crate::error::{kernel_fatal, KernelError};
use crate::heap::{align_up, Heap, HEAP_ALIGN};
use crate::memory::{ExtentFlags, ExtentRegistry, EXTENTS};
use crate::slab_allocator::{SlabAllocator, NSLABS, SLAB_MIN_RADIX, SLAB_REGION_SIZE, SLAB_SIZE};

/// init() が決めたメモリ配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    /// スラブ領域の先頭（SLAB_SIZE 境界）
    pub slab_base: usize,
    /// カーネルヒープ (先頭, 大きさ)
    pub kernel_heap: (usize, usize),
    /// ユーザーヒープ (先頭, 大きさ)。USER RAM がなければ None
    pub user_heap: Option<(usize, usize)>,
}

/// 使用状況のスナップショット
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStats {
    /// サイズクラスごとの空きオブジェクト数（radix の小さい順）
    pub slab_free: [usize; NSLABS],
    pub kernel_heap_used: usize,
    pub kernel_heap_free: usize,
    pub user_heap_used: usize,
    pub user_heap_free: usize,
}

/// カーネルのメモリ管理一式
pub struct KernelMemory {
    slabs: Mutex<SlabAllocator>,
    kernel_heap: Mutex<Heap>,
    user_heap: Mutex<Heap>,
}

impl KernelMemory {
    pub const fn new() -> Self {
        KernelMemory {
            slabs: Mutex::new(SlabAllocator::new()),
            kernel_heap: Mutex::new(Heap::empty()),
            user_heap: Mutex::new(Heap::empty()),
        }
    }

    /// エクステント表から領域を切り出して 3 つのアロケータを初期化する。
    ///
    /// # エラー
    /// - `OutOfMemory`: KERNEL RAM がない、またはスラブ領域が収まらない
    ///
    /// # Safety
    /// 表に載っている RAM が実在し、ほかの誰にも使われていないこと。
    /// 既存の確保はすべて無効になる。
    pub unsafe fn init(&self, registry: &ExtentRegistry) -> Result<MemoryLayout, KernelError> {
        let kernel_ram = ExtentFlags::KERNEL | ExtentFlags::RAM;
        let user_ram = ExtentFlags::USER | ExtentFlags::RAM;

        let kext = registry.largest_extent(kernel_ram).ok_or(KernelError::OutOfMemory)?;
        let kend = kext.end().ok_or(KernelError::InvalidArgument)?;

        // スラブ領域はオブジェクトが自然にアラインされるよう SLAB_SIZE 境界から
        let slab_base = align_up(kext.base, SLAB_SIZE);
        let slab_end = slab_base
            .checked_add(SLAB_REGION_SIZE)
            .filter(|&end| end <= kend)
            .ok_or(KernelError::OutOfMemory)?;

        let (kernel_heap, user_heap) = match registry.largest_extent(user_ram) {
            Some(uext) if uext.base == kext.base => {
                let half = (kend - slab_end) / 2;
                let mid = slab_end + half;
                ((slab_end, half), Some((mid, kend - mid)))
            }
            Some(uext) => ((slab_end, kend - slab_end), Some((uext.base, uext.length))),
            None => {
                log::warn!("memory: no USER RAM extent, user heap disabled");
                ((slab_end, kend - slab_end), None)
            }
        };

        unsafe {
            self.slabs.lock().init(slab_base);
            self.kernel_heap.lock().init(kernel_heap.0, kernel_heap.1);
            match user_heap {
                Some((start, size)) => self.user_heap.lock().init(start, size),
                None => *self.user_heap.lock() = Heap::empty(),
            }
        }

        log::info!(
            "memory: slab {:#x}-{:#x}, kernel heap {:#x}-{:#x}",
            slab_base,
            slab_end,
            kernel_heap.0,
            kernel_heap.0 + kernel_heap.1
        );
        if let Some((start, size)) = user_heap {
            log::info!("memory: user heap {:#x}-{:#x}", start, start + size);
        }

        Ok(MemoryLayout {
            slab_base,
            kernel_heap,
            user_heap,
        })
    }

    // =========================================================================
    // カーネル用
    // =========================================================================

    /// カーネル用に `size` バイト確保する。
    ///
    /// スラブのサイズクラスに収まればスラブから、収まらないかクラスが
    /// 満杯ならカーネルヒープから確保する。内容は初期化しない。
    pub fn kmalloc(&self, size: usize) -> Result<NonNull<u8>, KernelError> {
        if size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        if let Some(ptr) = self.slab_alloc(size) {
            return Ok(ptr);
        }
        self.kernel_heap.lock().allocate(size)
    }

    /// `count * size` バイトを確保してゼロで埋める
    pub fn kcalloc(&self, count: usize, size: usize) -> Result<NonNull<u8>, KernelError> {
        let total = count.checked_mul(size).ok_or(KernelError::OutOfMemory)?;
        let ptr = self.kmalloc(total)?;
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, total) };
        Ok(ptr)
    }

    /// カーネル用の確保を `new_size` バイトに変更する。
    ///
    /// スラブオブジェクトは同じサイズクラスに収まればそのまま返す。
    /// それ以外は新しく確保してコピーし、古いほうを解放する。
    /// 失敗した場合、元の確保はそのまま残る。
    ///
    /// # Safety
    /// `ptr` は kmalloc 系で確保され、まだ解放されていないこと
    pub unsafe fn krealloc(
        &self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Result<NonNull<u8>, KernelError> {
        if new_size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let object = self.slabs.lock().object_at(ptr.as_ptr() as usize);
        let Some(object) = object else {
            return unsafe { self.kernel_heap.lock().realloc(ptr, new_size) };
        };

        if SlabAllocator::size_class(new_size) == Some(object.radix()) {
            return Ok(ptr);
        }
        let new_ptr = self.kmalloc(new_size)?;
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), object.size().min(new_size));
            self.kfree(ptr);
        }
        Ok(new_ptr)
    }

    /// kmalloc 系で確保した領域を解放する。
    ///
    /// # Safety
    /// `ptr` は kmalloc 系で確保され、まだ解放されていないこと
    pub unsafe fn kfree(&self, ptr: NonNull<u8>) {
        {
            let mut slabs = self.slabs.lock();
            if let Some(object) = slabs.object_at(ptr.as_ptr() as usize) {
                slabs.free(object);
                return;
            }
        }
        let mut heap = self.kernel_heap.lock();
        debug_assert!(heap.contains(ptr.as_ptr()));
        unsafe { heap.free(ptr) };
    }

    // =========================================================================
    // ユーザー用
    // =========================================================================

    /// ユーザーヒープから `size` バイト確保する
    pub fn umalloc(&self, size: usize) -> Result<NonNull<u8>, KernelError> {
        self.user_heap.lock().allocate(size)
    }

    pub fn ucalloc(&self, count: usize, size: usize) -> Result<NonNull<u8>, KernelError> {
        self.user_heap.lock().calloc(count, size)
    }

    /// # Safety
    /// `ptr` は umalloc 系で確保され、まだ解放されていないこと
    pub unsafe fn urealloc(
        &self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Result<NonNull<u8>, KernelError> {
        unsafe { self.user_heap.lock().realloc(ptr, new_size) }
    }

    /// # Safety
    /// `ptr` は umalloc 系で確保され、まだ解放されていないこと
    pub unsafe fn ufree(&self, ptr: NonNull<u8>) {
        let mut heap = self.user_heap.lock();
        debug_assert!(heap.contains(ptr.as_ptr()));
        unsafe { heap.free(ptr) };
    }

    // =========================================================================
    // Layout 付きの確保（GlobalAlloc 用）
    // =========================================================================

    /// アラインメント付きで確保する。
    ///
    /// スラブオブジェクトは 2^radix 境界に並ぶので、サイズを align まで
    /// 切り上げればアラインメントも満たされる。ヒープは HEAP_ALIGN までしか
    /// 保証できないので、それより大きい align はスラブでしか扱えない。
    pub fn allocate_layout(&self, layout: Layout) -> Result<NonNull<u8>, KernelError> {
        let size = layout.size().max(layout.align());
        if layout.align() <= HEAP_ALIGN {
            return self.kmalloc(size);
        }
        self.slab_alloc(size).ok_or(KernelError::OutOfMemory)
    }

    /// 使用状況のスナップショット。
    ///
    /// ロックを 1 つずつ取るので、3 つの値は同じ瞬間のものとは限らない。
    pub fn stats(&self) -> MemoryStats {
        let mut stats = MemoryStats::default();
        {
            let slabs = self.slabs.lock();
            for (i, free) in stats.slab_free.iter_mut().enumerate() {
                *free = slabs.free_objects(SLAB_MIN_RADIX + i as u32);
            }
        }
        {
            let heap = self.kernel_heap.lock();
            stats.kernel_heap_used = heap.used_bytes();
            stats.kernel_heap_free = heap.free_bytes();
        }
        {
            let heap = self.user_heap.lock();
            stats.user_heap_used = heap.used_bytes();
            stats.user_heap_free = heap.free_bytes();
        }
        stats
    }

    /// スラブから確保する。クラス外・満杯・未初期化なら None
    fn slab_alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let mut slabs = self.slabs.lock();
        let object = slabs.allocate(size).ok()?;
        NonNull::new(slabs.address_of(object) as *mut u8)
    }
}

impl Default for KernelMemory {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// グローバルインスタンス
// =============================================================================

/// システム全体のメモリ管理
pub static KERNEL_MEMORY: KernelMemory = KernelMemory::new();

/// 起動時にシステムのエクステント表 (EXTENTS) からアロケータを初期化する。
///
/// プラットフォームのメモリ検出処理が register_extent() で表を埋めた後に呼ぶ。
/// 失敗したら続行できないので kernel_fatal() で停止する。
///
/// # Safety
/// KernelMemory::init と同じ。1 回だけ、ほかの確保より前に呼ぶこと。
pub unsafe fn init() -> MemoryLayout {
    let registry = EXTENTS.lock();
    unsafe { init_from(&KERNEL_MEMORY, &registry) }
}

/// `memory` を `registry` から初期化し、失敗したら kernel_fatal() で停止する。
///
/// # Safety
/// KernelMemory::init と同じ
pub unsafe fn init_from(memory: &KernelMemory, registry: &ExtentRegistry) -> MemoryLayout {
    match unsafe { memory.init(registry) } {
        Ok(layout) => layout,
        Err(e) => kernel_fatal(format_args!("memory init failed: {}", e)),
    }
}

pub fn kmalloc(size: usize) -> Result<NonNull<u8>, KernelError> {
    KERNEL_MEMORY.kmalloc(size)
}

pub fn kcalloc(count: usize, size: usize) -> Result<NonNull<u8>, KernelError> {
    KERNEL_MEMORY.kcalloc(count, size)
}

/// # Safety
/// KernelMemory::krealloc と同じ
pub unsafe fn krealloc(ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, KernelError> {
    unsafe { KERNEL_MEMORY.krealloc(ptr, new_size) }
}

/// # Safety
/// KernelMemory::kfree と同じ
pub unsafe fn kfree(ptr: NonNull<u8>) {
    unsafe { KERNEL_MEMORY.kfree(ptr) }
}

pub fn umalloc(size: usize) -> Result<NonNull<u8>, KernelError> {
    KERNEL_MEMORY.umalloc(size)
}

pub fn ucalloc(count: usize, size: usize) -> Result<NonNull<u8>, KernelError> {
    KERNEL_MEMORY.ucalloc(count, size)
}

/// # Safety
/// KernelMemory::urealloc と同じ
pub unsafe fn urealloc(ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, KernelError> {
    unsafe { KERNEL_MEMORY.urealloc(ptr, new_size) }
}

/// # Safety
/// KernelMemory::ufree と同じ
pub unsafe fn ufree(ptr: NonNull<u8>) {
    unsafe { KERNEL_MEMORY.ufree(ptr) }
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// KernelMemory のカーネル側を alloc crate に見せるアダプタ。
///
/// ボードのバイナリで `#[global_allocator]` に指定する。
/// `global-allocator` feature を有効にするとこのクレートが KERNEL_MEMORY で登録する。
pub struct KernelAllocator {
    memory: &'static KernelMemory,
}

impl KernelAllocator {
    pub const fn new(memory: &'static KernelMemory) -> Self {
        KernelAllocator { memory }
    }
}

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.memory.allocate_layout(layout) {
            Ok(ptr) => ptr.as_ptr(),
            // null を返すと alloc crate の OOM ハンドラが処理する
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            unsafe { self.memory.kfree(ptr) }
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(old) = NonNull::new(ptr) else {
            return ptr::null_mut();
        };
        if layout.align() <= HEAP_ALIGN {
            // スラブのクラスが align を下回らないように切り上げる
            return match unsafe { self.memory.krealloc(old, new_size.max(layout.align())) } {
                Ok(p) => p.as_ptr(),
                Err(_) => ptr::null_mut(),
            };
        }
        // 大きいアラインメントはスラブ内でしか保証できないので確保し直す
        let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
            return ptr::null_mut();
        };
        match self.memory.allocate_layout(new_layout) {
            Ok(new_ptr) => {
                unsafe {
                    ptr::copy_nonoverlapping(ptr, new_ptr.as_ptr(), layout.size().min(new_size));
                    self.memory.kfree(old);
                }
                new_ptr.as_ptr()
            }
            Err(_) => ptr::null_mut(),
        }
    }
}

#[cfg(feature = "global-allocator")]
#[global_allocator]
static GLOBAL: KernelAllocator = KernelAllocator::new(&KERNEL_MEMORY);
