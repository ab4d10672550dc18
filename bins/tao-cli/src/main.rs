//! tao-cli - HEVC 解码命令行工具
//!
//! - `decode`: 把 Annex-B 或长度前缀码流解码为原始 YUV
//! - `info`: 列出 NAL 单元与参数集信息

mod decode;
mod info;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;

use tao_hevc::logging::{self, LoggingConfig};

#[derive(Parser, Debug)]
#[command(name = "tao-cli", version, about = "纯 Rust HEVC/H.265 解码工具")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// 日志级别 (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// 日志配置文件 (JSON), 优先于 -v
    #[arg(long = "log-config", global = true)]
    log_config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 解码码流, 输出原始 YUV
    Decode(DecodeArgs),
    /// 显示码流的 NAL 单元与参数集
    Info(InfoArgs),
}

#[derive(clap::Args, Debug)]
pub(crate) struct DecodeArgs {
    /// 输入码流路径
    pub input: PathBuf,

    /// 输出 YUV 文件路径
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// 严格模式: 分片错误立即终止
    #[arg(long)]
    pub strict: bool,

    /// 工作线程数
    #[arg(long, default_value_t = 1)]
    pub threads: usize,

    /// 输出运动/码率元数据侧平面到文件
    #[arg(long)]
    pub metadata: Option<PathBuf>,

    /// 长度前缀字节数 (1-4); 未指定时按 Annex-B 起始码拆分
    #[arg(long = "length-size", value_parser = clap::value_parser!(u8).range(1..=4))]
    pub length_size: Option<u8>,

    /// 随机接入后仍解码 RASL 图像
    #[arg(long = "no-skip-rasl")]
    pub no_skip_rasl: bool,

    /// 最多输出的帧数
    #[arg(short = 'n', long = "frames")]
    pub max_frames: Option<u64>,
}

#[derive(clap::Args, Debug)]
pub(crate) struct InfoArgs {
    /// 输入码流路径
    pub input: PathBuf,

    /// 长度前缀字节数 (1-4); 未指定时按 Annex-B 起始码拆分
    #[arg(long = "length-size", value_parser = clap::value_parser!(u8).range(1..=4))]
    pub length_size: Option<u8>,

    /// 逐个列出 NAL 单元
    #[arg(long)]
    pub nals: bool,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli) {
        eprintln!("警告: 日志初始化失败: {e:#}");
    }

    let result = match &cli.command {
        Command::Decode(args) => decode::run(args),
        Command::Info(args) => info::run(args),
    };
    if let Err(e) = result {
        log::error!("{e:#}");
        eprintln!("错误: {e:#}");
        process::exit(1);
    }
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let config = match &cli.log_config {
        Some(path) => LoggingConfig::load(path)?,
        None => LoggingConfig::for_verbosity("tao-cli", cli.verbose),
    };
    logging::init(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_命令行定义有效() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_解析_decode_参数() {
        let cli = Cli::try_parse_from([
            "tao-cli", "decode", "in.h265", "-o", "out.yuv", "--strict", "--threads", "4", "-vv",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Command::Decode(args) = cli.command else {
            panic!("应解析为 decode 子命令");
        };
        assert_eq!(args.input, PathBuf::from("in.h265"));
        assert_eq!(args.output, Some(PathBuf::from("out.yuv")));
        assert!(args.strict);
        assert_eq!(args.threads, 4);
        assert_eq!(args.length_size, None);
    }

    #[test]
    fn test_length_size_超出范围报错() {
        assert!(Cli::try_parse_from(["tao-cli", "info", "in.h265", "--length-size", "5"]).is_err());
    }
}
