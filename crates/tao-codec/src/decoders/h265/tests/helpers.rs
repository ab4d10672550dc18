use tao_core::TaoResult;
use tao_core::bitwriter::{BitWriter, escape_rbsp};

use super::super::context::{LocalContext, SideArrays};
use super::super::ctu::CtuDecoder;
use super::super::dsp::ReferenceDsp;
use super::super::mvp::SpatialMotionPredictor;
use super::super::nal::NalUnit;
use super::super::params::ParameterSetCache;
use super::super::progress::WppSync;
use super::super::refs::{DecodedPicture, RefPicList, SliceRefs};
use super::super::slice_header::{SliceHeader, SliceParseState, ceil_log2, parse_slice_header};
use super::super::syntax::RawSyntaxReader;

pub const NAL_TRAIL_R: u8 = 1;
pub const NAL_RASL_N: u8 = 8;
pub const NAL_IDR_W_RADL: u8 = 19;
pub const NAL_CRA: u8 = 21;
pub const NAL_VPS: u8 = 32;
pub const NAL_SPS: u8 = 33;
pub const NAL_PPS: u8 = 34;
pub const NAL_EOS: u8 = 36;

/// 测试码流的序列/图像级参数
#[derive(Debug, Clone)]
pub struct StreamParams {
    pub width: u32,
    pub height: u32,
    pub chroma_format_idc: u32,
    pub log2_min_cb: u32,
    pub log2_diff_max_min_cb: u32,
    /// conformance window (左, 右, 上, 下), 色度单位
    pub conf_win: Option<[u32; 4]>,
    pub max_dec_pic_buffering: u32,
    pub num_reorder_pics: u32,
    pub sao: bool,
    /// PCM 8 bit, 8x8..16x16, 不做环路滤波
    pub pcm: bool,
    pub init_qp: i32,
    pub cu_qp_delta: bool,
    pub dependent_slices: bool,
    pub weighted_pred: bool,
    pub tiles: Option<(u32, u32)>,
    pub wpp: bool,
    pub disable_deblocking: bool,
    pub amp: bool,
    /// SPS 允许长期参考 (SPS 内不列候选)
    pub long_term_refs: bool,
    /// PPS slice_segment_header_extension_present_flag
    pub slice_header_extension: bool,
    pub log2_parallel_merge_level: u32,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            width: 16,
            height: 16,
            chroma_format_idc: 1,
            log2_min_cb: 3,
            log2_diff_max_min_cb: 1,
            conf_win: None,
            max_dec_pic_buffering: 2,
            num_reorder_pics: 0,
            sao: false,
            pcm: false,
            init_qp: 26,
            cu_qp_delta: false,
            dependent_slices: false,
            weighted_pred: false,
            tiles: None,
            wpp: false,
            disable_deblocking: true,
            amp: false,
            long_term_refs: false,
            slice_header_extension: false,
            log2_parallel_merge_level: 2,
        }
    }
}

/// 分片段头参数
#[derive(Debug, Clone)]
pub struct SliceParams {
    pub nal_type: u8,
    /// 0=B 1=P 2=I
    pub slice_type: u32,
    pub first_slice: bool,
    pub dependent: bool,
    pub segment_addr: u32,
    pub poc_lsb: u32,
    pub slice_qp_delta: i32,
    pub five_minus_max_num_merge_cand: u32,
    pub no_output_of_prior_pics: bool,
    /// 加权预测: luma_log2_weight_denom
    pub weight_denom: u32,
    /// L0 第 0 项的 (delta_luma_weight, luma_offset); None 时权重标志为 0
    pub luma_weight: Option<(i32, i32)>,
    pub mvd_l1_zero: bool,
    /// 一个分片头长期参考: (poc_lsb_lt, delta_poc_msb_cycle_lt)
    pub long_term: Option<(u32, Option<u32>)>,
    /// 分片头扩展: (声明的长度, 实际写入的字节)
    pub header_extension: Option<(u32, Vec<u8>)>,
}

impl SliceParams {
    pub fn idr() -> Self {
        Self {
            nal_type: NAL_IDR_W_RADL,
            slice_type: 2,
            first_slice: true,
            dependent: false,
            segment_addr: 0,
            poc_lsb: 0,
            slice_qp_delta: 0,
            five_minus_max_num_merge_cand: 4,
            no_output_of_prior_pics: false,
            weight_denom: 0,
            luma_weight: None,
            mvd_l1_zero: false,
            long_term: None,
            header_extension: None,
        }
    }

    pub fn p_frame(poc_lsb: u32) -> Self {
        Self {
            nal_type: NAL_TRAIL_R,
            slice_type: 1,
            poc_lsb,
            ..Self::idr()
        }
    }

    pub fn b_frame(poc_lsb: u32) -> Self {
        Self {
            slice_type: 0,
            ..Self::p_frame(poc_lsb)
        }
    }

    pub fn cra(poc_lsb: u32) -> Self {
        Self {
            nal_type: NAL_CRA,
            poc_lsb,
            ..Self::idr()
        }
    }
}

// ============================================================
// NAL 封装
// ============================================================

/// 加 NAL 头并插入 emulation prevention 字节
pub fn nal_bytes(nal_type: u8, rbsp: &[u8]) -> Vec<u8> {
    let mut out = vec![nal_type << 1, 1];
    out.extend_from_slice(&escape_rbsp(rbsp));
    out
}

/// 以 4 字节起始码拼接
pub fn annex_b(nals: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for nal in nals {
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(nal);
    }
    out
}

/// 以 4 字节长度前缀拼接
pub fn length_prefixed(nals: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for nal in nals {
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
    out
}

// ============================================================
// 参数集
// ============================================================

fn write_ptl(bw: &mut BitWriter) {
    bw.write_bits(0, 2); // profile_space
    bw.write_bit(0); // tier
    bw.write_bits(1, 5); // Main
    bw.write_bits(0x6000_0000, 32);
    bw.write_bits(0b1001, 4);
    bw.write_bits(0, 32);
    bw.write_bits(0, 12);
    bw.write_bits(93, 8); // level 3.1
}

pub fn build_vps() -> Vec<u8> {
    let mut bw = BitWriter::new();
    bw.write_bits(0, 4);
    bw.write_bits(3, 2);
    bw.write_bits(0, 6);
    bw.write_bits(0, 3);
    bw.write_bit(1);
    bw.write_bits(0xFFFF, 16);
    write_ptl(&mut bw);
    bw.write_trailing_bits();
    bw.finish()
}

pub fn build_sps(p: &StreamParams) -> Vec<u8> {
    let mut bw = BitWriter::new();
    bw.write_bits(0, 4); // vps_id
    bw.write_bits(0, 3); // max_sub_layers_minus1
    bw.write_bit(1);
    write_ptl(&mut bw);
    bw.write_ue(0); // sps_id
    bw.write_ue(p.chroma_format_idc);
    if p.chroma_format_idc == 3 {
        bw.write_bit(0);
    }
    bw.write_ue(p.width);
    bw.write_ue(p.height);
    match p.conf_win {
        Some(win) => {
            bw.write_bit(1);
            for v in win {
                bw.write_ue(v);
            }
        }
        None => bw.write_bit(0),
    }
    bw.write_ue(0); // bit_depth_luma_minus8
    bw.write_ue(0);
    bw.write_ue(4); // log2_max_poc_lsb = 8
    bw.write_bit(1); // sub_layer_ordering_info_present
    bw.write_ue(p.max_dec_pic_buffering - 1);
    bw.write_ue(p.num_reorder_pics);
    bw.write_ue(0);
    bw.write_ue(p.log2_min_cb - 3);
    bw.write_ue(p.log2_diff_max_min_cb);
    bw.write_ue(0); // log2_min_tb = 2
    let log2_ctb = p.log2_min_cb + p.log2_diff_max_min_cb;
    bw.write_ue(log2_ctb.min(5) - 2);
    bw.write_ue(0); // max_transform_hierarchy_depth_inter
    bw.write_ue(0); // max_transform_hierarchy_depth_intra
    bw.write_bit(0); // scaling_list_enabled
    bw.write_bit(u32::from(p.amp));
    bw.write_bit(u32::from(p.sao));
    bw.write_bit(u32::from(p.pcm));
    if p.pcm {
        bw.write_bits(7, 4);
        bw.write_bits(7, 4);
        bw.write_ue(0); // log2_min_pcm = 3
        bw.write_ue(1); // log2_max_pcm = 4
        bw.write_bit(1); // pcm_loop_filter_disabled
    }
    // 一个短期 RPS: 参考前一帧
    bw.write_ue(1);
    bw.write_ue(1);
    bw.write_ue(0);
    bw.write_ue(0);
    bw.write_bit(1);
    bw.write_bit(u32::from(p.long_term_refs));
    if p.long_term_refs {
        bw.write_ue(0); // num_long_term_ref_pics_sps
    }
    bw.write_bit(0); // temporal_mvp
    bw.write_bit(0); // strong_intra_smoothing
    bw.write_bit(0); // vui
    bw.write_bit(0); // sps_extension
    bw.write_trailing_bits();
    bw.finish()
}

pub fn build_pps(p: &StreamParams) -> Vec<u8> {
    let mut bw = BitWriter::new();
    bw.write_ue(0);
    bw.write_ue(0);
    bw.write_bit(u32::from(p.dependent_slices));
    bw.write_bit(0); // output_flag_present
    bw.write_bits(0, 3);
    bw.write_bit(0); // sign_data_hiding
    bw.write_bit(0); // cabac_init_present
    bw.write_ue(0);
    bw.write_ue(0);
    bw.write_se(p.init_qp - 26);
    bw.write_bit(0); // constrained_intra_pred
    bw.write_bit(0); // transform_skip
    bw.write_bit(u32::from(p.cu_qp_delta));
    if p.cu_qp_delta {
        bw.write_ue(0);
    }
    bw.write_se(0);
    bw.write_se(0);
    bw.write_bit(0); // slice_chroma_qp_offsets_present
    bw.write_bit(u32::from(p.weighted_pred));
    bw.write_bit(0); // weighted_bipred
    bw.write_bit(0); // transquant_bypass
    bw.write_bit(u32::from(p.tiles.is_some()));
    bw.write_bit(u32::from(p.wpp));
    if let Some((cols, rows)) = p.tiles {
        bw.write_ue(cols - 1);
        bw.write_ue(rows - 1);
        bw.write_bit(1); // uniform_spacing
        bw.write_bit(1); // loop_filter_across_tiles
    }
    bw.write_bit(0); // loop_filter_across_slices
    bw.write_bit(1); // deblocking_filter_control_present
    bw.write_bit(0); // override_enabled
    bw.write_bit(u32::from(p.disable_deblocking));
    if !p.disable_deblocking {
        bw.write_se(0);
        bw.write_se(0);
    }
    bw.write_bit(0); // pps_scaling_list_data_present
    bw.write_bit(0); // lists_modification_present
    bw.write_ue(p.log2_parallel_merge_level - 2);
    bw.write_bit(u32::from(p.slice_header_extension));
    bw.write_bit(0); // pps_extension
    bw.write_trailing_bits();
    bw.finish()
}

/// VPS/SPS/PPS 三个 NAL
pub fn parameter_set_nals(p: &StreamParams) -> Vec<Vec<u8>> {
    vec![
        nal_bytes(NAL_VPS, &build_vps()),
        nal_bytes(NAL_SPS, &build_sps(p)),
        nal_bytes(NAL_PPS, &build_pps(p)),
    ]
}

pub fn build_cache(p: &StreamParams) -> ParameterSetCache {
    let mut cache = ParameterSetCache::default();
    cache.insert_vps(&build_vps()).expect("VPS 应可解析");
    cache.insert_sps(&build_sps(p)).expect("SPS 应可解析");
    cache.insert_pps(&build_pps(p)).expect("PPS 应可解析");
    cache
}

// ============================================================
// 分片
// ============================================================

fn ctb_count(p: &StreamParams) -> u32 {
    let ctb = 1u32 << (p.log2_min_cb + p.log2_diff_max_min_cb);
    p.width.div_ceil(ctb) * p.height.div_ceil(ctb)
}

/// 写分片段头 (含 byte_alignment)
pub fn write_slice_header(bw: &mut BitWriter, p: &StreamParams, s: &SliceParams, entry_points: &[u32]) {
    let irap = (16..=23).contains(&s.nal_type);
    let idr = s.nal_type == 19 || s.nal_type == 20;
    bw.write_bit(u32::from(s.first_slice));
    if irap {
        bw.write_bit(u32::from(s.no_output_of_prior_pics));
    }
    bw.write_ue(0); // pps_id
    if !s.first_slice {
        if p.dependent_slices {
            bw.write_bit(u32::from(s.dependent));
        }
        bw.write_bits(s.segment_addr, ceil_log2(ctb_count(p)));
    }
    if !s.dependent {
        bw.write_ue(s.slice_type);
        if !idr {
            bw.write_bits(s.poc_lsb, 8);
            bw.write_bit(1); // short_term_ref_pic_set_sps_flag
            if p.long_term_refs {
                match s.long_term {
                    None => bw.write_ue(0),
                    Some((lsb, cycle)) => {
                        bw.write_ue(1); // num_long_term_pics
                        bw.write_bits(lsb, 8);
                        bw.write_bit(1); // used_by_curr_pic_lt_flag
                        bw.write_bit(u32::from(cycle.is_some()));
                        if let Some(cycle) = cycle {
                            bw.write_ue(cycle);
                        }
                    }
                }
            }
        }
        if p.sao {
            bw.write_bit(0);
            if p.chroma_format_idc != 0 {
                bw.write_bit(0);
            }
        }
        if s.slice_type != 2 {
            bw.write_bit(0); // num_ref_idx_active_override
            if s.slice_type == 0 {
                bw.write_bit(u32::from(s.mvd_l1_zero));
            }
            if p.weighted_pred && s.slice_type == 1 {
                bw.write_ue(s.weight_denom);
                if p.chroma_format_idc != 0 {
                    bw.write_se(0);
                }
                bw.write_bit(u32::from(s.luma_weight.is_some()));
                if p.chroma_format_idc != 0 {
                    bw.write_bit(0); // chroma_weight_l0_flag
                }
                if let Some((delta_weight, offset)) = s.luma_weight {
                    bw.write_se(delta_weight);
                    bw.write_se(offset);
                }
            }
            bw.write_ue(s.five_minus_max_num_merge_cand);
        }
        bw.write_se(s.slice_qp_delta);
    }
    if p.tiles.is_some() || p.wpp {
        bw.write_ue(entry_points.len() as u32);
        if !entry_points.is_empty() {
            bw.write_ue(15); // offset_len = 16
            for &e in entry_points {
                bw.write_bits(e - 1, 16);
            }
        }
    }
    if p.slice_header_extension {
        match &s.header_extension {
            Some((length, data)) => {
                bw.write_ue(*length);
                bw.write_bytes(data);
            }
            None => bw.write_ue(0),
        }
    }
    bw.write_bit(1);
    bw.align_to_byte();
}

/// 由若干子码流组装分片 NAL, 入口点取各子码流长度
pub fn slice_nal(p: &StreamParams, s: &SliceParams, substreams: &[Vec<u8>]) -> Vec<u8> {
    let entry_points: Vec<u32> = substreams
        .iter()
        .take(substreams.len().saturating_sub(1))
        .map(|b| b.len() as u32)
        .collect();
    let mut bw = BitWriter::new();
    write_slice_header(&mut bw, p, s, &entry_points);
    for sub in substreams {
        bw.write_bytes(sub);
    }
    nal_bytes(s.nal_type, &bw.finish())
}

/// 只有分片头, 没有分片数据 (用于分片头解析测试)
pub fn slice_header_nal(p: &StreamParams, s: &SliceParams) -> Vec<u8> {
    slice_nal(p, s, &[vec![0x80]])
}

// ============================================================
// CTU 比特构造 (原始比特语法)
// ============================================================

/// 帧内 2Nx2N CU, DC 模式, 无残差
pub fn write_intra_cu(bw: &mut BitWriter, with_part_mode: bool) {
    if with_part_mode {
        bw.write_ue(0); // PART_2Nx2N
    }
    bw.write_bit(1); // prev_intra_luma_pred_flag
    bw.write_ue(0); // mpm_idx
    bw.write_ue(4); // intra_chroma_pred_mode: 沿用亮度
    bw.write_bit(0); // cbf_cb
    bw.write_bit(0); // cbf_cr
    bw.write_bit(0); // cbf_luma
}

/// 一个不划分的帧内 CTU, 后接 end_of_slice_segment_flag
pub fn write_intra_ctu(bw: &mut BitWriter, end_of_slice: bool) {
    bw.write_bit(0); // split_cu_flag
    write_intra_cu(bw, false);
    bw.write_bit(u32::from(end_of_slice));
}

/// 一个 PCM CTU (16x16, 4:2:0), 样本值由 `sample(c, x, y)` 给出
pub fn write_pcm_ctu(bw: &mut BitWriter, sample: impl Fn(usize, usize, usize) -> u8) {
    write_pcm_ctu_at(bw, 0, 0, true, sample);
}

/// 位于亮度 (x0, y0) 的 PCM CTU, `sample` 取各分量平面内的绝对坐标
pub fn write_pcm_ctu_at(
    bw: &mut BitWriter,
    x0: usize,
    y0: usize,
    end_of_slice: bool,
    sample: impl Fn(usize, usize, usize) -> u8,
) {
    bw.write_bit(0); // split_cu_flag
    bw.write_bit(1); // pcm_flag
    bw.align_to_byte();
    for y in 0..16 {
        for x in 0..16 {
            bw.write_bits(u32::from(sample(0, x0 + x, y0 + y)), 8);
        }
    }
    for c in 1..3 {
        for y in 0..8 {
            for x in 0..8 {
                bw.write_bits(u32::from(sample(c, x0 / 2 + x, y0 / 2 + y)), 8);
            }
        }
    }
    bw.write_bit(u32::from(end_of_slice));
}

/// 一个跳过 CU (合并候选 0) 的 CTU
pub fn write_skip_ctu(bw: &mut BitWriter, end_of_slice: bool) {
    bw.write_bit(0); // split_cu_flag
    bw.write_bit(1); // cu_skip_flag
    bw.write_bit(u32::from(end_of_slice));
}

/// 一个 AMVP 预测单元 (参考列表各只有一项, 不写 ref_idx)
#[derive(Debug, Clone, Copy, Default)]
pub struct AmvpPu {
    /// B 分片写 inter_pred_idc (0=L0 1=L1 2=BI); P 分片为 None
    pub inter_pred_idc: Option<u32>,
    /// 各列表的 mvd, 1/4 像素
    pub mvd: [(i32, i32); 2],
    pub mvp_flag: [bool; 2],
}

impl AmvpPu {
    pub fn l0(mvd: (i32, i32)) -> Self {
        Self {
            mvd: [mvd, (0, 0)],
            ..Self::default()
        }
    }
}

/// 写一个 AMVP 预测单元; `mvd_l1_zero` 时双向 PU 省略 L1 的 mvd
pub fn write_amvp_pu(bw: &mut BitWriter, pu: &AmvpPu, mvd_l1_zero: bool) {
    bw.write_bit(0); // merge_flag
    if let Some(idc) = pu.inter_pred_idc {
        bw.write_ue(idc);
    }
    let idc = pu.inter_pred_idc.unwrap_or(0);
    for list in 0..2 {
        if (list == 0 && idc == 1) || (list == 1 && idc == 0) {
            continue;
        }
        if !(list == 1 && mvd_l1_zero && idc == 2) {
            bw.write_se(pu.mvd[list].0);
            bw.write_se(pu.mvd[list].1);
        }
        bw.write_bit(u32::from(pu.mvp_flag[list]));
    }
}

/// 帧间 CU: cu_skip_flag 0, pred_mode_flag 0, part_mode, 各 PU, rqt_root_cbf 0
pub fn write_inter_cu(bw: &mut BitWriter, part_mode: u32, pus: &[AmvpPu], mvd_l1_zero: bool) {
    bw.write_bit(0); // cu_skip_flag
    bw.write_bit(0); // pred_mode_flag
    bw.write_ue(part_mode);
    for pu in pus {
        write_amvp_pu(bw, pu, mvd_l1_zero);
    }
    bw.write_bit(0); // rqt_root_cbf
}

/// 不划分的帧间 CTU
pub fn write_inter_ctu(bw: &mut BitWriter, part_mode: u32, pus: &[AmvpPu], mvd_l1_zero: bool, end_of_slice: bool) {
    bw.write_bit(0); // split_cu_flag
    write_inter_cu(bw, part_mode, pus, mvd_l1_zero);
    bw.write_bit(u32::from(end_of_slice));
}

/// 结束当前子码流: 末尾补 rbsp 结束位
pub fn finish_last(mut bw: BitWriter) -> Vec<u8> {
    bw.write_trailing_bits();
    bw.finish()
}

// ============================================================
// 直接驱动 CtuDecoder
// ============================================================

pub struct DirectDecode {
    pub sh: SliceHeader,
    pub pic: DecodedPicture,
    pub side: SideArrays,
    pub syntax: RawSyntaxReader,
    pub lc: LocalContext,
    pub result: TaoResult<()>,
}

/// 解析分片头并解码一个分片段, 不经过 DPB (参考列表为空)
pub fn decode_slice_direct(p: &StreamParams, s: &SliceParams, substreams: &[Vec<u8>]) -> DirectDecode {
    let ctb_rows = p.height.div_ceil(1 << (p.log2_min_cb + p.log2_diff_max_min_cb));
    decode_slice_with_sync(p, s, substreams, &WppSync::new(ctb_rows as usize))
}

/// 同 [`decode_slice_direct`], 使用调用方提供的行同步
pub fn decode_slice_with_sync(p: &StreamParams, s: &SliceParams, substreams: &[Vec<u8>], wpp: &WppSync) -> DirectDecode {
    let cache = build_cache(p);
    let raw = slice_nal(p, s, substreams);
    let nal = NalUnit::parse(&raw).expect("分片 NAL 应可解析");
    let mut state = SliceParseState::default();
    let sh = parse_slice_header(&nal, &cache, None, &mut state).expect("分片头应可解析");
    let sps = state.active_sps.clone().expect("应激活 SPS");
    let pps = state.active_pps.clone().expect("应激活 PPS");

    let mut pic = DecodedPicture::allocate(&sps, state.poc).expect("图像分配失败");
    pic.slice_refs.push(SliceRefs::default());
    let mut side = SideArrays::allocate(&sps).expect("边信息分配失败");
    let refs: [RefPicList; 2] = Default::default();
    let mut syntax = RawSyntaxReader::new();
    let dsp = ReferenceDsp::new();
    let mvp = SpatialMotionPredictor;
    let mut lc = LocalContext::default();

    let result = {
        let mut ctu = CtuDecoder {
            sps: &sps,
            pps: &pps,
            sh: &sh,
            pic: &mut pic,
            side: &mut side,
            refs: &refs,
            syntax: &mut syntax,
            dsp: &dsp,
            mvp: &mvp,
            metadata: None,
            lc: &mut lc,
            slice_idx: 0,
        };
        ctu.decode_slice_data(&nal, wpp)
    };
    DirectDecode {
        sh,
        pic,
        side,
        syntax,
        lc,
        result,
    }
}
