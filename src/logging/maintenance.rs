//! 日志目录维护: 删除过期日志, 压缩历史日志.
//!
//! 文件滚动由 tracing-appender 完成, 这里只处理已经滚动出去的旧文件.

use super::LoggingConfig;
use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Local, NaiveDate};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// 在后台线程执行一次日志目录清理
pub(super) fn spawn_log_maintenance(config: LoggingConfig) {
    let spawned = std::thread::Builder::new()
        .name("tao-log-maintenance".to_string())
        .spawn(move || {
            let today = Local::now().date_naive();
            match cleanup_logs(&config, today) {
                Ok(report) => debug!(
                    "日志维护完成: 删除 {} 个, 压缩 {} 个",
                    report.removed, report.compressed
                ),
                Err(err) => error!("清理日志失败: {}", err),
            }
        });
    if let Err(err) = spawned {
        error!("启动日志维护线程失败: {}", err);
    }
}

/// 一次清理的结果
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct CleanupReport {
    pub removed: usize,
    pub compressed: usize,
}

/// 以 `today` 为基准清理日志目录
///
/// 早于保留期的日志 (含 .gz) 被删除; 非当天的未压缩日志在启用压缩时转为 .gz.
pub(crate) fn cleanup_logs(config: &LoggingConfig, today: NaiveDate) -> Result<CleanupReport> {
    let directory = Path::new(&config.directory);
    let mut report = CleanupReport::default();
    if !directory.exists() {
        return Ok(report);
    }

    let cutoff = today - ChronoDuration::days(config.retention_days);
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some((date, compressed)) = parse_rotated_log_name(&file_name, &config.file_prefix) else {
            continue;
        };
        let file_path = entry.path();

        if date < cutoff {
            if fs::remove_file(&file_path).is_ok() {
                report.removed += 1;
            }
            continue;
        }
        if config.compress_history && !compressed && date < today {
            match compress_to_gz(&file_path) {
                Ok(()) => report.compressed += 1,
                Err(err) => error!("压缩日志失败: {}", err),
            }
        }
    }
    Ok(report)
}

fn compress_to_gz(path: &Path) -> Result<()> {
    let gz_path = PathBuf::from(format!("{}.gz", path.display()));
    if gz_path.exists() {
        return Ok(());
    }

    let mut input = File::open(path).with_context(|| format!("打开待压缩日志失败, path={}", path.display()))?;
    let output =
        File::create(&gz_path).with_context(|| format!("创建压缩日志失败, path={}", gz_path.display()))?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;
    fs::remove_file(path).with_context(|| format!("删除已压缩日志失败, path={}", path.display()))?;
    Ok(())
}

/// 解析 `{prefix}.{YYYY-MM-DD}.log[.gz]`, 返回日期与是否已压缩
pub(crate) fn parse_rotated_log_name(file_name: &str, prefix: &str) -> Option<(NaiveDate, bool)> {
    let rest = file_name.strip_prefix(prefix)?.strip_prefix('.')?;
    let (date_part, compressed) = match rest.strip_suffix(".log.gz") {
        Some(date_part) => (date_part, true),
        None => (rest.strip_suffix(".log")?, false),
    };
    if date_part.len() != 10 {
        return None;
    }
    let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()?;
    Some((date, compressed))
}
