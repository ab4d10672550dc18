//! # tao-codec
//!
//! Tao HEVC/H.265 解码器库, 提供 Decoder trait 与 Packet/Frame 抽象.
//!
//! ## 使用示例
//!
//! ```rust,no_run
//! use tao_codec::{Decoder, HevcDecoder, HevcDecoderConfig, Packet};
//!
//! let mut decoder = HevcDecoder::new(HevcDecoderConfig::default());
//! let data: Vec<u8> = std::fs::read("input.h265").unwrap();
//! decoder.send_packet(&Packet::from_data(data)).unwrap();
//! decoder.send_packet(&Packet::empty()).unwrap();
//! while let Ok(frame) = decoder.receive_frame() {
//!     let tao_codec::Frame::Video(v) = frame;
//!     println!("poc={} {}x{}", v.poc, v.width, v.height);
//! }
//! ```

pub mod decoder;
pub mod decoders;
pub mod frame;
pub mod packet;

// 重导出常用类型
pub use decoder::Decoder;
pub use decoders::h265::{HevcDecoder, HevcDecoderConfig, MetadataLayout};
pub use frame::{Frame, PictureType, VideoFrame};
pub use packet::Packet;
