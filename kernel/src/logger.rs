// logger.rs — log クレートのバックエンド
//
// log::info!() などのマクロの出力先をコンソールにつなぐ。
// UART などの実デバイスはこのクレートの外にあるので、
// ConsoleSink トレイトを実装したものを init_logger() に渡してもらう。
//
// 出力形式: `[LEVEL] target: message`

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

use crate::error::KernelError;

/// ログの出力先（シリアルコンソールなど）
pub trait ConsoleSink: Sync {
    fn write_str(&self, s: &str);
}

struct LoggerState {
    sink: Option<&'static dyn ConsoleSink>,
    level: LevelFilter,
}

/// ConsoleSink に書き出すロガー
pub struct KernelLogger {
    state: Mutex<LoggerState>,
}

impl KernelLogger {
    pub const fn new() -> Self {
        KernelLogger {
            state: Mutex::new(LoggerState {
                sink: None,
                level: LevelFilter::Info,
            }),
        }
    }

    /// 出力先と最大レベルを設定する
    pub fn configure(&self, sink: &'static dyn ConsoleSink, level: LevelFilter) {
        let mut state = self.state.lock();
        state.sink = Some(sink);
        state.level = level;
    }
}

impl Default for KernelLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        let state = self.state.lock();
        state.sink.is_some() && metadata.level() <= state.level
    }

    fn log(&self, record: &Record) {
        let state = self.state.lock();
        let Some(sink) = state.sink else {
            return;
        };
        if record.level() > state.level {
            return;
        }
        // 書き込みに失敗しても知らせる手段がないので捨てる
        let _ = format_record(&mut SinkWriter(sink), record);
    }

    fn flush(&self) {}
}

struct SinkWriter(&'static dyn ConsoleSink);

impl Write for SinkWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

/// 1 レコードを `[LEVEL] target: message\n` の形で書き出す
pub fn format_record(w: &mut impl Write, record: &Record) -> fmt::Result {
    writeln!(w, "[{}] {}: {}", record.level(), record.target(), record.args())
}

static LOGGER: KernelLogger = KernelLogger::new();
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// カーネルのロガーを `sink` に向けて log クレートに登録する。
///
/// 2 回目以降の呼び出しは出力先とレベルの変更だけ行う。
/// ほかのロガーがすでに登録されていれば `InvalidArgument`。
pub fn init_logger(
    sink: &'static dyn ConsoleSink,
    level: LevelFilter,
) -> Result<(), KernelError> {
    LOGGER.configure(sink, level);
    if !INSTALLED.swap(true, Ordering::AcqRel) && log::set_logger(&LOGGER).is_err() {
        INSTALLED.store(false, Ordering::Release);
        return Err(KernelError::InvalidArgument);
    }
    log::set_max_level(level);
    Ok(())
}
