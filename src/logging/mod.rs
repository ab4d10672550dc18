//! 日志初始化.
//!
//! 双输出:
//! - console: 彩色, 写到 stderr (stdout 留给解码输出)
//! - file: 无色, 按天滚动到 `{directory}/{prefix}.{date}.log`
//!
//! 文件级别可被 `TAO_LOG` 环境变量覆盖. 库 crate 通过 `log` 门面输出,
//! 由 tracing-subscriber 桥接到同一订阅器.

use anyhow::{Context, Result};
use chrono::{Datelike, Local, NaiveDate, Timelike};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{self, FormatEvent, FormatFields, format::Writer},
    layer::{Layer, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
};

mod maintenance;

/// 覆盖文件日志级别的环境变量
pub const LOG_ENV: &str = "TAO_LOG";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// 文件日志级别 (EnvFilter 语法)
    pub level: String,
    #[serde(default = "default_console_level")]
    pub console_level: String,
    pub directory: String,
    pub file_prefix: String,
    #[serde(default = "default_true")]
    pub console: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_true")]
    pub compress_history: bool,
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> i64 {
    30
}

fn default_console_level() -> String {
    "warn".to_string()
}

impl LoggingConfig {
    /// 按 `-v` 次数生成配置: 0=info, 1=debug, 2+=trace; 控制台比文件低一级
    pub fn for_verbosity(file_prefix: &str, verbosity: u8) -> Self {
        let (level, console_level) = match verbosity {
            0 => ("info", "warn"),
            1 => ("debug", "info"),
            _ => ("trace", "debug"),
        };
        Self {
            level: level.to_string(),
            console_level: console_level.to_string(),
            directory: "logs".to_string(),
            file_prefix: file_prefix.to_string(),
            console: true,
            retention_days: default_retention_days(),
            compress_history: true,
        }
    }

    /// 从 JSON 文本解析
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("解析日志配置失败")
    }

    /// 从 JSON 文件加载
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("读取日志配置失败, path={}", path.display()))?;
        Self::from_json(&text)
    }
}

static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// 初始化全局日志; 进程内只能成功一次
pub fn init(config: LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory)
        .with_context(|| format!("创建日志目录失败, path={}", config.directory))?;

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(&config.file_prefix)
        .filename_suffix("log")
        .build(&config.directory)
        .context("创建日志文件失败")?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(&config.level));
    let file_layer = fmt::Layer::default()
        .with_writer(non_blocking)
        .with_ansi(false)
        .event_format(FileFormatter)
        .with_filter(file_filter);

    let console_layer = config.console.then(|| {
        fmt::Layer::default()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .event_format(ConsoleFormatter)
            .with_filter(EnvFilter::new(&config.console_level))
    });

    Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("日志系统已初始化")?;
    LOG_GUARD.set(guard).ok();

    maintenance::spawn_log_maintenance(config);
    Ok(())
}

/// 指定日期的日志文件路径 (与滚动文件命名一致)
pub fn log_path_for(directory: &Path, prefix: &str, date: NaiveDate) -> PathBuf {
    directory.join(format!("{}.{}.log", prefix, date.format("%Y-%m-%d")))
}

/// 当天的日志文件路径
pub fn current_log_path(config: &LoggingConfig) -> PathBuf {
    log_path_for(Path::new(&config.directory), &config.file_prefix, Local::now().date_naive())
}

/// Console 格式: 彩色, 带时间戳和源码位置
struct ConsoleFormatter;

impl<S, N> FormatEvent<S, N> for ConsoleFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = Local::now();
        let meta = event.metadata();
        let color = match *meta.level() {
            tracing::Level::ERROR => "\x1b[31m",
            tracing::Level::WARN => "\x1b[33m",
            tracing::Level::INFO => "\x1b[32m",
            _ => "\x1b[34m",
        };
        write!(
            writer,
            "[{:02}:{:02}:{:02}.{:03}] {}{:5}\x1b[0m {}:{} > ",
            now.hour(),
            now.minute(),
            now.second(),
            now.timestamp_subsec_millis(),
            color,
            meta.level(),
            meta.file().unwrap_or("unknown"),
            meta.line().unwrap_or(0)
        )?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// File 格式: 无色, 时间戳 + 级别 + 消息
struct FileFormatter;

impl<S, N> FormatEvent<S, N> for FileFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = Local::now();
        write!(
            writer,
            "[{:02}-{:02} {:02}:{:02}:{:02}.{:03}] {:5} > ",
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second(),
            now.timestamp_subsec_millis(),
            event.metadata().level(),
        )?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_path_for() {
        let date = NaiveDate::from_ymd_opt(2026, 2, 6).unwrap();
        let path = log_path_for(Path::new("logs"), "tao-cli", date);
        assert_eq!(path, PathBuf::from("logs/tao-cli.2026-02-06.log"));
    }

    #[test]
    fn test_verbosity_级别() {
        assert_eq!(LoggingConfig::for_verbosity("x", 0).level, "info");
        assert_eq!(LoggingConfig::for_verbosity("x", 1).level, "debug");
        let cfg = LoggingConfig::for_verbosity("x", 5);
        assert_eq!(cfg.level, "trace");
        assert_eq!(cfg.console_level, "debug");
    }

    #[test]
    fn test_json_配置默认字段() {
        let cfg = LoggingConfig::from_json(r#"{"level":"debug","directory":"out","file_prefix":"hevc"}"#).unwrap();
        assert_eq!(cfg.console_level, "warn");
        assert!(cfg.console);
        assert_eq!(cfg.retention_days, 30);
        assert!(cfg.compress_history);
    }

    #[test]
    fn test_json_缺少字段报错() {
        assert!(LoggingConfig::from_json(r#"{"level":"debug"}"#).is_err());
    }
}
