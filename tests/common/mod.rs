//! 集成测试与基准共用的合成码流构造.
//!
//! 码流使用原始比特语法 (与 `RawSyntaxReader` 对应), 只含单分片图像:
//! 16x16 CTB, 8 bit 4:2:0, 去块关闭.

#![allow(dead_code)]

use tao_hevc::core::bitwriter::{BitWriter, escape_rbsp};

pub const NAL_TRAIL_R: u8 = 1;
pub const NAL_IDR_W_RADL: u8 = 19;
pub const NAL_VPS: u8 = 32;
pub const NAL_SPS: u8 = 33;
pub const NAL_PPS: u8 = 34;

/// 序列参数
#[derive(Debug, Clone, Copy)]
pub struct SequenceParams {
    pub width: u32,
    pub height: u32,
    pub num_reorder_pics: u32,
    pub pcm: bool,
}

impl SequenceParams {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            num_reorder_pics: 0,
            pcm: false,
        }
    }

    pub fn ctb_count(&self) -> u32 {
        self.width.div_ceil(16) * self.height.div_ceil(16)
    }
}

/// 加 NAL 头并插入 emulation prevention 字节
pub fn nal_bytes(nal_type: u8, rbsp: &[u8]) -> Vec<u8> {
    let mut out = vec![nal_type << 1, 1];
    out.extend_from_slice(&escape_rbsp(rbsp));
    out
}

pub fn annex_b(nals: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for nal in nals {
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(nal);
    }
    out
}

fn write_ptl(bw: &mut BitWriter) {
    bw.write_bits(0, 2);
    bw.write_bit(0);
    bw.write_bits(1, 5); // Main
    bw.write_bits(0x6000_0000, 32);
    bw.write_bits(0b1001, 4);
    bw.write_bits(0, 32);
    bw.write_bits(0, 12);
    bw.write_bits(93, 8);
}

pub fn vps_rbsp() -> Vec<u8> {
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

pub fn sps_rbsp(p: &SequenceParams) -> Vec<u8> {
    let mut bw = BitWriter::new();
    bw.write_bits(0, 4);
    bw.write_bits(0, 3);
    bw.write_bit(1);
    write_ptl(&mut bw);
    bw.write_ue(0); // sps_id
    bw.write_ue(1); // 4:2:0
    bw.write_ue(p.width);
    bw.write_ue(p.height);
    bw.write_bit(0); // conformance_window
    bw.write_ue(0);
    bw.write_ue(0);
    bw.write_ue(4); // log2_max_poc_lsb = 8
    bw.write_bit(1);
    bw.write_ue(p.num_reorder_pics + 1); // max_dec_pic_buffering_minus1
    bw.write_ue(p.num_reorder_pics);
    bw.write_ue(0);
    bw.write_ue(0); // log2_min_cb = 3
    bw.write_ue(1); // CTB 16
    bw.write_ue(0); // log2_min_tb = 2
    bw.write_ue(2); // log2_max_tb = 4
    bw.write_ue(0);
    bw.write_ue(0);
    bw.write_bit(0); // scaling_list
    bw.write_bit(0); // amp
    bw.write_bit(0); // sao
    bw.write_bit(u32::from(p.pcm));
    if p.pcm {
        bw.write_bits(7, 4);
        bw.write_bits(7, 4);
        bw.write_ue(0);
        bw.write_ue(1);
        bw.write_bit(1);
    }
    // 一个短期 RPS: 参考前一帧
    bw.write_ue(1);
    bw.write_ue(1);
    bw.write_ue(0);
    bw.write_ue(0);
    bw.write_bit(1);
    bw.write_bit(0); // long_term_ref_pics_present
    bw.write_bit(0); // temporal_mvp
    bw.write_bit(0); // strong_intra_smoothing
    bw.write_bit(0); // vui
    bw.write_bit(0); // sps_extension
    bw.write_trailing_bits();
    bw.finish()
}

pub fn pps_rbsp() -> Vec<u8> {
    let mut bw = BitWriter::new();
    bw.write_ue(0);
    bw.write_ue(0);
    bw.write_bit(0); // dependent_slice_segments
    bw.write_bit(0); // output_flag_present
    bw.write_bits(0, 3);
    bw.write_bit(0); // sign_data_hiding
    bw.write_bit(0); // cabac_init_present
    bw.write_ue(0);
    bw.write_ue(0);
    bw.write_se(0); // init_qp = 26
    bw.write_bit(0); // constrained_intra_pred
    bw.write_bit(0); // transform_skip
    bw.write_bit(0); // cu_qp_delta
    bw.write_se(0);
    bw.write_se(0);
    bw.write_bit(0);
    bw.write_bit(0); // weighted_pred
    bw.write_bit(0); // weighted_bipred
    bw.write_bit(0); // transquant_bypass
    bw.write_bit(0); // tiles
    bw.write_bit(0); // entropy_coding_sync
    bw.write_bit(0); // loop_filter_across_slices
    bw.write_bit(1); // deblocking_filter_control_present
    bw.write_bit(0);
    bw.write_bit(1); // pps_deblocking_filter_disabled
    bw.write_bit(0);
    bw.write_bit(0);
    bw.write_ue(0);
    bw.write_bit(0);
    bw.write_bit(0);
    bw.write_trailing_bits();
    bw.finish()
}

pub fn parameter_set_nals(p: &SequenceParams) -> Vec<Vec<u8>> {
    vec![
        nal_bytes(NAL_VPS, &vps_rbsp()),
        nal_bytes(NAL_SPS, &sps_rbsp(p)),
        nal_bytes(NAL_PPS, &pps_rbsp()),
    ]
}

/// 单分片图像的分片头 (含 byte_alignment)
fn write_slice_header(bw: &mut BitWriter, nal_type: u8, poc_lsb: u32) {
    let idr = nal_type == NAL_IDR_W_RADL;
    bw.write_bit(1); // first_slice_segment_in_pic
    if idr {
        bw.write_bit(0); // no_output_of_prior_pics
    }
    bw.write_ue(0); // pps_id
    bw.write_ue(if idr { 2 } else { 1 }); // I / P
    if !idr {
        bw.write_bits(poc_lsb, 8);
        bw.write_bit(1); // short_term_ref_pic_set_sps_flag
        bw.write_bit(0); // num_ref_idx_active_override
        bw.write_ue(4); // five_minus_max_num_merge_cand
    }
    bw.write_se(0); // slice_qp_delta
    bw.write_bit(1);
    bw.align_to_byte();
}

/// 全帧内 IDR 图像: 每个 CTU 一个 DC 模式 CU, 无残差
pub fn intra_idr_nal(p: &SequenceParams) -> Vec<u8> {
    let mut bw = BitWriter::new();
    write_slice_header(&mut bw, NAL_IDR_W_RADL, 0);
    let count = p.ctb_count();
    for i in 0..count {
        bw.write_bit(0); // split_cu_flag
        bw.write_bit(1); // prev_intra_luma_pred_flag
        bw.write_ue(0); // mpm_idx
        bw.write_ue(4); // intra_chroma_pred_mode
        bw.write_bit(0); // cbf_cb
        bw.write_bit(0); // cbf_cr
        bw.write_bit(0); // cbf_luma
        bw.write_bit(u32::from(i + 1 == count));
    }
    bw.write_trailing_bits();
    nal_bytes(NAL_IDR_W_RADL, &bw.finish())
}

/// PCM IDR 图像, 样本值由 `sample(plane, x, y)` 给出 (图像坐标)
pub fn pcm_idr_nal(p: &SequenceParams, sample: impl Fn(usize, usize, usize) -> u8) -> Vec<u8> {
    let mut bw = BitWriter::new();
    write_slice_header(&mut bw, NAL_IDR_W_RADL, 0);
    let ctb_cols = p.width.div_ceil(16) as usize;
    let count = p.ctb_count() as usize;
    for i in 0..count {
        let (x0, y0) = ((i % ctb_cols) * 16, (i / ctb_cols) * 16);
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
        bw.write_bit(u32::from(i + 1 == count));
    }
    bw.write_trailing_bits();
    nal_bytes(NAL_IDR_W_RADL, &bw.finish())
}

/// 全跳过 P 图像: 每个 CTU 复制参考帧
pub fn skip_p_nal(p: &SequenceParams, poc_lsb: u32) -> Vec<u8> {
    let mut bw = BitWriter::new();
    write_slice_header(&mut bw, NAL_TRAIL_R, poc_lsb);
    let count = p.ctb_count();
    for i in 0..count {
        bw.write_bit(0); // split_cu_flag
        bw.write_bit(1); // cu_skip_flag
        bw.write_bit(u32::from(i + 1 == count));
    }
    bw.write_trailing_bits();
    nal_bytes(NAL_TRAIL_R, &bw.finish())
}

/// 参数集 + 帧内 IDR + `p_frames` 个跳过 P 帧
pub fn synthetic_stream(p: &SequenceParams, p_frames: u32) -> Vec<u8> {
    let mut nals = parameter_set_nals(p);
    nals.push(intra_idr_nal(p));
    for poc in 1..=p_frames {
        nals.push(skip_p_nal(p, poc & 0xFF));
    }
    annex_b(&nals)
}
