//! `info` 子命令: 列出 NAL 单元与参数集.

use anyhow::{Context, Result, bail};
use std::collections::BTreeMap;

use tao_codec::decoders::h265::nal::{
    NalUnit, NalUnitType, group_access_units, split_annex_b, split_length_prefixed,
};
use tao_codec::decoders::h265::params::{ParameterSetCache, Pps, Sps};

use crate::InfoArgs;

pub(crate) fn run(args: &InfoArgs) -> Result<()> {
    let data = std::fs::read(&args.input)
        .with_context(|| format!("无法读取输入文件 '{}'", args.input.display()))?;
    let nals = match args.length_size {
        Some(size) => split_length_prefixed(&data, usize::from(size)).context("拆分长度前缀码流失败")?,
        None => split_annex_b(&data),
    };
    if nals.is_empty() {
        bail!("输入中没有找到 NAL 单元");
    }

    println!("输入: {} ({} 字节)", args.input.display(), data.len());
    println!("NAL 单元: {}, 访问单元: {}", nals.len(), group_access_units(&nals).len());

    let mut params = ParameterSetCache::default();
    let mut counts: BTreeMap<u8, (NalUnitType, usize)> = BTreeMap::new();
    if args.nals {
        println!("{:>6}  {:<12} {:>5} {:>3} {:>8}", "序号", "类型", "layer", "tid", "大小");
    }
    for (index, raw) in nals.iter().enumerate() {
        let nal = match NalUnit::parse(raw) {
            Ok(nal) => nal,
            Err(e) => {
                log::warn!("NAL #{index} 头部无效: {e}");
                continue;
            }
        };
        if args.nals {
            println!(
                "{:>6}  {:<12} {:>5} {:>3} {:>8}",
                index,
                format!("{:?}", nal.nal_type),
                nal.layer_id,
                nal.temporal_id,
                raw.len()
            );
        }
        counts
            .entry(nal.nal_type.type_id())
            .or_insert((nal.nal_type, 0))
            .1 += 1;
        if nal.layer_id != 0 {
            continue;
        }
        let parsed = match nal.nal_type {
            NalUnitType::Vps => params.insert_vps(nal.payload()).map(|vps| {
                println!(
                    "VPS #{}: max_sub_layers={}, profile_idc={}, level_idc={}",
                    vps.vps_id, vps.max_sub_layers, vps.ptl.profile_idc, vps.ptl.level_idc
                );
            }),
            NalUnitType::Sps => params.insert_sps(nal.payload()).map(|sps| print_sps(&sps)),
            NalUnitType::Pps => params.insert_pps(nal.payload()).map(|pps| print_pps(&pps)),
            _ => Ok(()),
        };
        if let Err(e) = parsed {
            println!("NAL #{index} ({:?}) 解析失败: {e}", nal.nal_type);
        }
    }

    println!("类型统计:");
    for (id, (nal_type, count)) in &counts {
        println!("  {:>2} {:<12} {}", id, format!("{nal_type:?}"), count);
    }
    Ok(())
}

fn print_sps(sps: &Sps) {
    println!(
        "SPS #{}: {}x{} (输出 {}x{}), chroma_format_idc={}, bit_depth={}/{}",
        sps.sps_id,
        sps.width,
        sps.height,
        sps.output_width(),
        sps.output_height(),
        sps.chroma_format_idc,
        sps.bit_depth,
        sps.bit_depth_chroma
    );
    let ordering = sps.highest_sub_layer();
    println!(
        "  ctb={} ({}x{}), max_dec_pic_buffering={}, num_reorder_pics={}",
        sps.ctb_size(),
        sps.ctb_width,
        sps.ctb_height,
        ordering.max_dec_pic_buffering,
        ordering.num_reorder_pics
    );
    println!(
        "  profile_idc={}, level_idc={}, sao={}, pcm={}, amp={}, tmvp={}, st_rps={}",
        sps.ptl.profile_idc,
        sps.ptl.level_idc,
        sps.sao_enabled,
        sps.pcm_enabled,
        sps.amp_enabled,
        sps.temporal_mvp_enabled,
        sps.st_rps.len()
    );
}

fn print_pps(pps: &Pps) {
    println!(
        "PPS #{} (SPS #{}): tiles={} ({}x{}), wpp={}, cu_qp_delta={}, weighted_pred={}/{}",
        pps.pps_id,
        pps.sps_id,
        pps.tiles_enabled,
        pps.num_tile_columns,
        pps.num_tile_rows,
        pps.entropy_coding_sync_enabled,
        pps.cu_qp_delta_enabled,
        pps.weighted_pred,
        pps.weighted_bipred
    );
    println!(
        "  dependent_slices={}, deblocking_disabled={}, beta_offset={}, tc_offset={}",
        pps.dependent_slice_segments_enabled, pps.disable_dbf, pps.beta_offset, pps.tc_offset
    );
}
