//! # tao-core
//!
//! Tao HEVC 解码器核心库, 提供错误类型, 位流读写与像素格式定义.
//!
//! - [`bitreader::BitReader`]: 参数集与分片头的 Exp-Golomb 位读取
//! - [`bitwriter::BitWriter`]: 测试与基准中构造码流
//! - [`PixelFormat`]: 由 chroma_format_idc 与位深推导的输出格式

pub mod bitreader;
pub mod bitwriter;
pub mod error;
pub mod pixel_format;

// 重导出常用类型
pub use error::{TaoError, TaoResult};
pub use pixel_format::PixelFormat;
