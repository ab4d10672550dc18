//! `decode` 子命令: 码流 -> 原始 YUV.

use anyhow::{Context, Result, bail};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Instant;

use tao_codec::decoders::h265::nal::{group_access_units, split_annex_b, split_length_prefixed};
use tao_codec::{Decoder, Frame, HevcDecoder, HevcDecoderConfig, Packet, VideoFrame};
use tao_core::TaoError;

use crate::DecodeArgs;

/// 解码统计
#[derive(Debug, Default)]
struct DecodeSummary {
    access_units: usize,
    frames: u64,
    incomplete: u64,
    bytes: u64,
    width: u32,
    height: u32,
}

pub(crate) fn run(args: &DecodeArgs) -> Result<()> {
    let data = std::fs::read(&args.input)
        .with_context(|| format!("无法读取输入文件 '{}'", args.input.display()))?;
    let length_size = args.length_size.map(usize::from);
    let nals = match length_size {
        Some(size) => split_length_prefixed(&data, size).context("拆分长度前缀码流失败")?,
        None => split_annex_b(&data),
    };
    if nals.is_empty() {
        bail!("输入中没有找到 NAL 单元");
    }
    let units = group_access_units(&nals);

    eprintln!("tao-cli 版本 {} -- HEVC 解码", tao_hevc::version());
    eprintln!("输入: {} ({} 个 NAL, {} 个访问单元)", args.input.display(), nals.len(), units.len());

    let config = HevcDecoderConfig {
        strict: args.strict,
        threads: args.threads.max(1),
        export_metadata: args.metadata.is_some(),
        nal_length_size: length_size,
        skip_rasl: !args.no_skip_rasl,
        ..HevcDecoderConfig::default()
    };
    let mut decoder = HevcDecoder::new(config);

    let mut output = create_writer(args.output.as_deref())?;
    let mut metadata = create_writer(args.metadata.as_deref())?;
    let mut summary = DecodeSummary {
        access_units: units.len(),
        ..DecodeSummary::default()
    };
    let limit = args.max_frames.unwrap_or(u64::MAX);
    let started = Instant::now();

    for (index, unit) in units.iter().enumerate() {
        let mut packet = Packet::from_data(pack_access_unit(unit, length_size));
        packet.pts = index as i64;
        decoder
            .send_packet(&packet)
            .with_context(|| format!("解码访问单元 #{index} 失败"))?;
        if drain_frames(&mut decoder, &mut output, &mut metadata, &mut summary, limit)? {
            break;
        }
    }
    if summary.frames < limit {
        decoder.send_packet(&Packet::empty()).context("刷新解码器失败")?;
        drain_frames(&mut decoder, &mut output, &mut metadata, &mut summary, limit)?;
    }

    if let Some(writer) = output.as_mut() {
        writer.flush().context("写入输出文件失败")?;
    }
    if let Some(writer) = metadata.as_mut() {
        writer.flush().context("写入元数据文件失败")?;
    }

    let elapsed = started.elapsed().as_secs_f64();
    tracing::info!(
        frames = summary.frames,
        incomplete = summary.incomplete,
        elapsed_ms = (elapsed * 1000.0) as u64,
        "解码完成"
    );
    eprintln!(
        "完成: {} 个访问单元, 输出 {} 帧 ({}x{}), 不完整 {} 帧, 写入 {} 字节, 耗时 {:.2}s",
        summary.access_units,
        summary.frames,
        summary.width,
        summary.height,
        summary.incomplete,
        summary.bytes,
        elapsed
    );
    Ok(())
}

fn create_writer(path: Option<&std::path::Path>) -> Result<Option<BufWriter<File>>> {
    path.map(|p| {
        File::create(p)
            .map(BufWriter::new)
            .with_context(|| format!("无法创建输出文件 '{}'", p.display()))
    })
    .transpose()
}

/// 重新封装一个访问单元的 NAL
fn pack_access_unit(nals: &[&[u8]], length_size: Option<usize>) -> Vec<u8> {
    let mut out = Vec::with_capacity(nals.iter().map(|n| n.len() + 4).sum());
    for nal in nals {
        match length_size {
            Some(size) => {
                let len = (nal.len() as u32).to_be_bytes();
                out.extend_from_slice(&len[4 - size..]);
            }
            None => out.extend_from_slice(&[0, 0, 0, 1]),
        }
        out.extend_from_slice(nal);
    }
    out
}

/// 取出所有可用帧; 达到帧数上限时返回 true
fn drain_frames(
    decoder: &mut HevcDecoder,
    output: &mut Option<BufWriter<File>>,
    metadata: &mut Option<BufWriter<File>>,
    summary: &mut DecodeSummary,
    limit: u64,
) -> Result<bool> {
    while summary.frames < limit {
        let frame = match decoder.receive_frame() {
            Ok(Frame::Video(frame)) => frame,
            Err(TaoError::NeedMoreData) | Err(TaoError::Eof) => return Ok(false),
            Err(e) => return Err(e).context("取出解码帧失败"),
        };
        log::debug!(
            "输出帧: poc={}, type={:?}, complete={}",
            frame.poc,
            frame.picture_type,
            frame.complete
        );
        if let Some(writer) = output.as_mut() {
            summary.bytes += write_planes(writer, &frame.data)?;
        }
        if let Some(writer) = metadata.as_mut() {
            write_planes(writer, &frame.side_planes)?;
        }
        record_frame(summary, &frame);
    }
    Ok(true)
}

fn write_planes(writer: &mut impl Write, planes: &[Vec<u8>]) -> Result<u64> {
    let mut written = 0u64;
    for plane in planes {
        writer.write_all(plane).context("写入帧数据失败")?;
        written += plane.len() as u64;
    }
    Ok(written)
}

fn record_frame(summary: &mut DecodeSummary, frame: &VideoFrame) {
    summary.frames += 1;
    if !frame.complete {
        summary.incomplete += 1;
    }
    summary.width = frame.width;
    summary.height = frame.height;
}
