#![no_std]

use core::fmt;

/// ブロックサイズ（バイト）。システム全体で固定。
/// デバイスごとにネゴシエーションはしない。
pub const BLOCK_SIZE: usize = 512;

/// ブロックデバイスの抽象インターフェース。
///
/// 512 バイトブロックを前提にしている。論理ブロック番号から
/// 物理メディア上の位置への変換はドライバ側の責任。
pub trait BlockDevice {
    /// `start` から `count` ブロックを `buf` に読み込む。
    /// `buf` は `count * BLOCK_SIZE` バイト以上あること。
    fn read_blocks(&mut self, start: u32, count: usize, buf: &mut [u8]) -> Result<(), BlockError>;

    /// `buf` の先頭 `count * BLOCK_SIZE` バイトを `start` から書き込む。
    fn write_blocks(&mut self, start: u32, count: usize, buf: &[u8]) -> Result<(), BlockError>;

    /// 1 ブロック読み取り
    fn read_block(&mut self, block: u32, buf: &mut [u8]) -> Result<(), BlockError> {
        self.read_blocks(block, 1, buf)
    }

    /// 1 ブロック書き込み
    fn write_block(&mut self, block: u32, buf: &[u8]) -> Result<(), BlockError> {
        self.write_blocks(block, 1, buf)
    }
}

/// ブロックデバイスエラー
///
/// ドライバ固有のエラーはここに畳み込んで上位へそのまま伝播する。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// 転送失敗・タイムアウトなど
    IoError,
    /// 範囲外のブロック番号、短すぎるバッファ
    InvalidArgument,
    /// チェックサム不一致やメディア不良
    MediaError,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockError::IoError => write!(f, "device I/O error"),
            BlockError::InvalidArgument => write!(f, "invalid block request"),
            BlockError::MediaError => write!(f, "checksum or media error"),
        }
    }
}

/// `count` ブロック分の転送に `len` バイトのバッファで足りるか調べる。
pub fn check_buffer(len: usize, count: usize) -> Result<(), BlockError> {
    match count.checked_mul(BLOCK_SIZE) {
        Some(needed) if len >= needed => Ok(()),
        _ => Err(BlockError::InvalidArgument),
    }
}
