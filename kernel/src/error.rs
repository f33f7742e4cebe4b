// error.rs — カーネル共通のエラー型
//
// アロケータやエクステント表は例外的な制御移動を使わず、
// Result で失敗を返す。呼び出し側は必ず検査して上へ伝播すること。
//
// カーネルレベルのメモリ枯渇には回復手段がない。起動時など
// どうしても続行できない場合は kernel_fatal() で停止する。

use core::fmt;

use k68_blockdev::BlockError;

/// カーネル内部のエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// ヒープまたはスラブが枯渇した
    OutOfMemory,
    /// 長さ 0 の要求、範囲外のサイズクラスなど
    InvalidArgument,
    /// ブロックデバイスのエラー（解釈せずにそのまま運ぶ）
    Device(BlockError),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "out of memory"),
            KernelError::InvalidArgument => write!(f, "invalid argument"),
            KernelError::Device(e) => write!(f, "device error: {}", e),
        }
    }
}

impl From<BlockError> for KernelError {
    fn from(e: BlockError) -> Self {
        KernelError::Device(e)
    }
}

/// 回復不能なエラーでカーネルを停止する。
///
/// ログに error レベルで残してから panic する。実機では panic ハンドラが
/// CPU を止めるので、ここから戻ることはない。
#[cold]
pub fn kernel_fatal(args: fmt::Arguments) -> ! {
    log::error!("kernel_fatal: {}", args);
    panic!("kernel_fatal: {}", args);
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_block_error_passes_through() {
        let e: KernelError = BlockError::MediaError.into();
        assert_eq!(e, KernelError::Device(BlockError::MediaError));
    }

    #[test]
    fn test_display() {
        assert_eq!(KernelError::OutOfMemory.to_string(), "out of memory");
        assert_eq!(
            KernelError::Device(BlockError::IoError).to_string(),
            "device error: device I/O error"
        );
    }
}
