// lib.rs — k68 カーネルのメモリ管理サブシステム
//
// 68000 系シングルボードコンピュータ向けカーネルのうち、メモリまわりを
// まとめたクレート。仮想メモリはなく、アドレスはすべて物理アドレス。
//
// - memory:         起動時に見つけた物理メモリ領域の表
// - slab_allocator: 小さい固定サイズオブジェクト用のビットマップ式スラブ
// - heap:           フリーリスト式の汎用ヒープ（カーネル用とユーザー用）
// - allocator:      kmalloc / umalloc とグローバルアロケータ
// - block_cache:    ブロックデバイスのライトバック・キャッシュ
//
// テストはホストの std 上で動かすので、no_std はテスト時だけ外す。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod allocator;
pub mod block_cache;
pub mod error;
pub mod heap;
pub mod logger;
pub mod memory;
pub mod slab_allocator;

pub use error::{kernel_fatal, KernelError};
