#![cfg_attr(not(test), no_std)]

use core::fmt;

use klocks::Once;
use log::{self, Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

/// 日志的输出端，通常是串口控制台
pub trait LogSink: Sync {
    fn write_log(&self, args: fmt::Arguments<'_>);
}

/// a simple logger
struct SimpleLogger {
    clog: LevelFilter,
    sink: &'static dyn LogSink,
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.clog >= metadata.level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let color = level_color(record.level());
        self.sink.write_log(format_args!(
            "\u{1B}[{}m[{:>5}] {}\u{1B}[0m\n",
            color,
            record.level(),
            record.args(),
        ));
    }

    fn flush(&self) {}
}

fn level_color(level: Level) -> u8 {
    match level {
        Level::Error => 31, // Red
        Level::Warn => 93,  // BrightYellow
        Level::Info => 34,  // Blue
        Level::Debug => 32, // Green
        Level::Trace => 90, // BrightBlack
    }
}

/// 根据编译时的 `KERNEL_CLOG` 决定控制台的日志级别，缺省为关闭
pub fn clog_level() -> LevelFilter {
    parse_level(option_env!("KERNEL_CLOG"))
}

fn parse_level(level: Option<&str>) -> LevelFilter {
    match level {
        Some("ERROR") => LevelFilter::Error,
        Some("WARN") => LevelFilter::Warn,
        Some("INFO") => LevelFilter::Info,
        Some("DEBUG") => LevelFilter::Debug,
        Some("TRACE") => LevelFilter::Trace,
        _ => LevelFilter::Off,
    }
}

static LOGGER: Once<SimpleLogger> = Once::new();

/// 安装日志后端，重复安装会返回错误
pub fn try_init(sink: &'static dyn LogSink) -> Result<(), SetLoggerError> {
    try_init_with_level(sink, clog_level())
}

pub fn try_init_with_level(
    sink: &'static dyn LogSink,
    clog: LevelFilter,
) -> Result<(), SetLoggerError> {
    let logger = LOGGER.call_once(|| SimpleLogger { clog, sink });
    log::set_logger(logger)?;
    log::set_max_level(logger.clog);
    Ok(())
}

/// initiate logger
///
/// 只应当调用一次
pub fn init(sink: &'static dyn LogSink) {
    if try_init(sink).is_err() {
        panic!("logger has been initialized");
    }
}
