use crate::decoder::Decoder;
use crate::packet::Packet;

use super::{HevcDecoder, HevcDecoderConfig};

mod helpers;
mod prediction;
mod progress;
mod quadtree;

#[test]
fn test_create_返回_hevc_解码器() {
    let dec = HevcDecoder::create().unwrap();
    assert_eq!(dec.name(), "hevc");
}

#[test]
fn test_未送数据时需要更多数据() {
    let mut dec = HevcDecoder::new(HevcDecoderConfig::default());
    assert!(matches!(dec.receive_frame(), Err(tao_core::TaoError::NeedMoreData)));
}

#[test]
fn test_空包刷新后返回_eof() {
    let mut dec = HevcDecoder::new(HevcDecoderConfig::default());
    dec.send_packet(&Packet::empty()).unwrap();
    assert!(matches!(dec.receive_frame(), Err(tao_core::TaoError::Eof)));
}

#[test]
fn test_垃圾数据在非严格模式下不报错() {
    let mut dec = HevcDecoder::new(HevcDecoderConfig::default());
    let garbage = [0u8, 0, 1, 0x80, 0x01, 0xAA];
    dec.send_packet(&Packet::from_data(garbage.to_vec())).unwrap();
    assert!(matches!(dec.receive_frame(), Err(tao_core::TaoError::NeedMoreData)));
    assert_eq!(dec.frame_count(), 0);
}
