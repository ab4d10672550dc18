//! # tao-hevc
//!
//! 纯 Rust 实现的 HEVC/H.265 解码器.
//!
//! - **语法解析**: NAL 单元, VPS/SPS/PPS, 分片段头
//! - **重建**: 编码四叉树, 帧内/帧间预测, 反量化与反变换, PCM
//! - **环路滤波**: 去块与 SAO
//! - **图像管理**: POC, 参考图像集, DPB 输出与 bumping
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use tao_hevc::codec::{Decoder, Frame, HevcDecoder, HevcDecoderConfig, Packet};
//!
//! let data = std::fs::read("stream.h265").unwrap();
//! let mut decoder = HevcDecoder::new(HevcDecoderConfig::default());
//! decoder.send_packet(&Packet::from_data(data)).unwrap();
//! decoder.send_packet(&Packet::empty()).unwrap();
//! while let Ok(Frame::Video(frame)) = decoder.receive_frame() {
//!     println!("poc={} {}x{}", frame.poc, frame.width, frame.height);
//! }
//! ```
//!
//! # Crate 结构
//!
//! | Crate | 功能 |
//! |-------|------|
//! | `tao-core` | 位读写, 错误类型, 像素格式 |
//! | `tao-codec` | 解码器 trait 与 HEVC 解码器 |

/// 核心类型与工具
pub use tao_core as core;

/// 解码器框架与 HEVC 解码器
pub use tao_codec as codec;

/// 日志初始化与日志文件维护
pub mod logging;

/// 获取版本号
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
