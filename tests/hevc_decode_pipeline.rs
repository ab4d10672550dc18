//! 合成 HEVC 码流的端到端解码测试.

mod common;

use std::fs;
use std::io::Write;

use tao_hevc::codec::decoders::h265::nal::{NalUnit, NalUnitType, group_access_units, split_annex_b};
use tao_hevc::codec::decoders::h265::params::ParameterSetCache;
use tao_hevc::codec::{Decoder, Frame, HevcDecoder, HevcDecoderConfig, Packet, VideoFrame};
use tao_hevc::core::{PixelFormat, TaoError};

use common::*;

fn drain(decoder: &mut HevcDecoder) -> Vec<VideoFrame> {
    decoder
        .receive_available()
        .unwrap()
        .into_iter()
        .map(|Frame::Video(frame)| frame)
        .collect()
}

/// 按访问单元逐包送入, 最后刷新
fn decode_by_access_unit(stream: &[u8], config: HevcDecoderConfig) -> Vec<VideoFrame> {
    let nals = split_annex_b(stream);
    let mut decoder = HevcDecoder::new(config);
    let mut frames = Vec::new();
    for unit in group_access_units(&nals) {
        let packet = annex_b(&unit.iter().map(|n| n.to_vec()).collect::<Vec<_>>());
        decoder.send_packet(&Packet::from_data(packet)).unwrap();
        frames.extend(drain(&mut decoder));
    }
    decoder.send_packet(&Packet::empty()).unwrap();
    frames.extend(drain(&mut decoder));
    assert!(matches!(decoder.receive_frame(), Err(TaoError::Eof)));
    frames
}

fn gradient(c: usize, x: usize, y: usize) -> u8 {
    (16 + c * 48 + x * 3 + y * 2) as u8
}

#[test]
fn test_整段码流单包解码() {
    let params = SequenceParams::new(64, 48);
    let stream = synthetic_stream(&params, 3);

    let mut decoder = HevcDecoder::new(HevcDecoderConfig::default());
    decoder.send_packet(&Packet::from_data(stream)).unwrap();
    decoder.send_packet(&Packet::empty()).unwrap();
    let frames = drain(&mut decoder);

    assert_eq!(frames.iter().map(|f| f.poc).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    assert_eq!(decoder.frame_count(), 4);
    for frame in &frames {
        assert_eq!((frame.width, frame.height), (64, 48));
        assert_eq!(frame.pixel_format, PixelFormat::Yuv420p);
        assert!(frame.complete);
        assert_eq!(frame.data[0].len(), 64 * 48);
        assert_eq!(frame.data[1].len(), 32 * 24);
        assert!(frame.data.iter().flatten().all(|&v| v == 128), "无残差的 DC 预测应为中间灰");
    }
    assert!(frames[0].is_keyframe);
    assert!(!frames[1].is_keyframe);
}

#[test]
fn test_按访问单元解码_pcm_与跳过帧() {
    let params = SequenceParams {
        pcm: true,
        ..SequenceParams::new(32, 32)
    };
    let mut nals = parameter_set_nals(&params);
    nals.push(pcm_idr_nal(&params, gradient));
    nals.push(skip_p_nal(&params, 1));
    nals.push(skip_p_nal(&params, 2));
    let stream = annex_b(&nals);

    let frames = decode_by_access_unit(&stream, HevcDecoderConfig::default());
    assert_eq!(frames.len(), 3);
    let idr = &frames[0];
    assert_eq!(idr.linesize, vec![32, 16, 16]);
    assert_eq!(idr.data[0][20 * 32 + 17], gradient(0, 17, 20));
    assert_eq!(idr.data[1][9 * 16 + 12], gradient(1, 12, 9));
    assert_eq!(idr.data[2][15 * 16 + 15], gradient(2, 15, 15));
    for frame in &frames[1..] {
        assert_eq!(frame.data, idr.data, "零运动跳过帧应复制参考帧");
    }
}

#[test]
fn test_解码结果写入_yuv_文件() {
    let params = SequenceParams::new(48, 32);
    let stream = synthetic_stream(&params, 2);
    let frames = decode_by_access_unit(&stream, HevcDecoderConfig::default());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.yuv");
    let mut file = fs::File::create(&path).unwrap();
    for frame in &frames {
        for plane in &frame.data {
            file.write_all(plane).unwrap();
        }
    }
    drop(file);

    let expected = PixelFormat::Yuv420p.frame_size(48, 32).unwrap() * 3;
    assert_eq!(fs::metadata(&path).unwrap().len() as usize, expected);
}

#[test]
fn test_参数集解析与访问单元分组() {
    let params = SequenceParams::new(1920, 1080);
    let stream = synthetic_stream(&params, 4);
    let nals = split_annex_b(&stream);
    assert_eq!(nals.len(), 8);
    assert_eq!(group_access_units(&nals).len(), 5);

    let mut cache = ParameterSetCache::default();
    for raw in &nals {
        let nal = NalUnit::parse(raw).unwrap();
        match nal.nal_type {
            NalUnitType::Vps => {
                cache.insert_vps(nal.payload()).unwrap();
            }
            NalUnitType::Sps => {
                let sps = cache.insert_sps(nal.payload()).unwrap();
                assert_eq!((sps.width, sps.height), (1920, 1080));
                assert_eq!(sps.ctb_size(), 16);
                assert_eq!((sps.ctb_width, sps.ctb_height), (120, 68));
            }
            NalUnitType::Pps => {
                cache.insert_pps(nal.payload()).unwrap();
            }
            _ => {}
        }
    }
    assert!(cache.get_sps(0).is_some());
    assert!(cache.get_pps(0).is_some());
}

#[test]
fn test_截断码流_宽松模式输出不完整帧() {
    let params = SequenceParams::new(64, 64);
    let mut nals = parameter_set_nals(&params);
    let mut idr = intra_idr_nal(&params);
    idr.truncate(idr.len() / 2);
    nals.push(idr);
    let stream = annex_b(&nals);

    let frames = decode_by_access_unit(&stream, HevcDecoderConfig::default());
    assert_eq!(frames.len(), 1);
    assert!(!frames[0].complete);
}

#[test]
fn test_截断码流_严格模式报错() {
    let params = SequenceParams::new(64, 64);
    let mut nals = parameter_set_nals(&params);
    let mut idr = intra_idr_nal(&params);
    idr.truncate(idr.len() / 2);
    nals.push(idr);

    let config = HevcDecoderConfig {
        strict: true,
        ..HevcDecoderConfig::default()
    };
    let mut decoder = HevcDecoder::new(config);
    assert!(decoder.send_packet(&Packet::from_data(annex_b(&nals))).is_err());
}

#[test]
fn test_多线程解码结果一致() {
    let params = SequenceParams::new(64, 64);
    let stream = synthetic_stream(&params, 2);
    let single = decode_by_access_unit(&stream, HevcDecoderConfig::default());
    let multi = decode_by_access_unit(
        &stream,
        HevcDecoderConfig {
            threads: 4,
            ..HevcDecoderConfig::default()
        },
    );
    assert_eq!(single.len(), multi.len());
    for (a, b) in single.iter().zip(&multi) {
        assert_eq!(a.poc, b.poc);
        assert_eq!(a.data, b.data);
    }
}

#[test]
fn test_flush_后从新的_idr_继续() {
    let params = SequenceParams::new(32, 32);
    let stream = synthetic_stream(&params, 1);
    let mut decoder = HevcDecoder::new(HevcDecoderConfig::default());
    decoder.send_packet(&Packet::from_data(stream)).unwrap();
    assert_eq!(drain(&mut decoder).len(), 2);

    decoder.flush();
    assert!(matches!(decoder.receive_frame(), Err(TaoError::NeedMoreData)));

    // 参数集保留, 只送 IDR 即可解码
    let idr = annex_b(&[intra_idr_nal(&params)]);
    decoder.send_packet(&Packet::from_data(idr)).unwrap();
    let frames = drain(&mut decoder);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].poc, 0);
}
