//! HEVC 参数集 (VPS/SPS/PPS) 解析与缓存.
//!
//! 参数集一旦解析完成即不可变, 以 `Arc` 形式被分片引用.
//! 同一 id 的新参数集整体替换旧值; SPS 被替换时, 所有引用它的 PPS 一并失效.
//!
//! PPS 解析依赖 SPS 几何信息, 同时生成 tile 扫描相关的派生表:
//! - `ctb_addr_rs_to_ts` / `ctb_addr_ts_to_rs`: 光栅扫描与 tile 扫描地址互换
//! - `tile_id`: tile 扫描地址所属 tile
//! - `min_tb_addr_zs`: 最小变换块的 z 扫描序号, 用于邻居可用性判断

use std::sync::Arc;

use log::{debug, warn};
use tao_core::bitreader::BitReader;
use tao_core::{TaoError, TaoResult};

use super::tables::{DEFAULT_SCALING_LIST_INTER, DEFAULT_SCALING_LIST_INTRA, diag_scan};

/// VPS 表容量
pub const MAX_VPS_COUNT: usize = 16;
/// SPS 表容量
pub const MAX_SPS_COUNT: usize = 16;
/// PPS 表容量
pub const MAX_PPS_COUNT: usize = 64;
/// 最大子层数
pub const MAX_SUB_LAYERS: usize = 7;
/// SPS 中短期参考图像集数量上限
pub const MAX_SHORT_TERM_RPS_COUNT: usize = 64;
/// SPS 中长期参考图像数量上限
pub const MAX_LONG_TERM_REF_PICS: usize = 32;
/// 单个列表最大参考数
pub const MAX_REFS: usize = 16;
/// CTB 最大 log2 尺寸
pub const MAX_LOG2_CTB_SIZE: u32 = 6;

// ============================================================
// 参考图像集
// ============================================================

/// 短期参考图像集
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortTermRps {
    /// 负向 (POC 更小) 图像数量
    pub num_negative_pics: usize,
    /// 图像总数
    pub num_delta_pocs: usize,
    /// 帧间 RPS 预测时参考集的图像数量 (分片头中用于计算比特数)
    pub rps_idx_num_delta_pocs: usize,
    /// 相对当前图像的 POC 差
    pub delta_poc: [i32; 32],
    /// 是否被当前图像使用
    pub used: [bool; 32],
}

impl Default for ShortTermRps {
    fn default() -> Self {
        Self {
            num_negative_pics: 0,
            num_delta_pocs: 0,
            rps_idx_num_delta_pocs: 0,
            delta_poc: [0; 32],
            used: [false; 32],
        }
    }
}

/// 解析 short_term_ref_pic_set
///
/// `existing` 为 SPS 中已解析的集合; `in_slice_header` 为 true 时表示
/// 集合位于分片头 (此时可用 delta_idx 选择任意预测源).
pub fn parse_short_term_rps(
    br: &mut BitReader,
    existing: &[ShortTermRps],
    in_slice_header: bool,
) -> TaoResult<ShortTermRps> {
    let mut rps = ShortTermRps::default();
    let inter_rps_pred = !existing.is_empty() && br.read_flag()?;

    if inter_rps_pred {
        let delta_idx = if in_slice_header {
            let v = br.read_ue()? as usize + 1;
            if v > existing.len() {
                return Err(TaoError::InvalidData(format!(
                    "HEVC: delta_idx 超出范围, delta_idx={}, nb_st_rps={}",
                    v,
                    existing.len()
                )));
            }
            v
        } else {
            1
        };
        let ref_rps = &existing[existing.len() - delta_idx];
        rps.rps_idx_num_delta_pocs = ref_rps.num_delta_pocs;

        let delta_rps_sign = br.read_flag()?;
        let abs_delta_rps = br.read_ue()? as i32 + 1;
        if abs_delta_rps > 32768 {
            return Err(TaoError::InvalidData(format!(
                "HEVC: abs_delta_rps 超出范围, value={}",
                abs_delta_rps
            )));
        }
        let delta_rps = if delta_rps_sign {
            -abs_delta_rps
        } else {
            abs_delta_rps
        };

        let mut pairs: Vec<(i32, bool)> = Vec::with_capacity(ref_rps.num_delta_pocs + 1);
        for i in 0..=ref_rps.num_delta_pocs {
            let used = br.read_flag()?;
            let use_delta = used || br.read_flag()?;
            if use_delta {
                let delta_poc = if i < ref_rps.num_delta_pocs {
                    delta_rps + ref_rps.delta_poc[i]
                } else {
                    delta_rps
                };
                if pairs.len() >= 32 {
                    return Err(TaoError::InvalidData(
                        "HEVC: 帧间预测 RPS 图像数量过多".into(),
                    ));
                }
                pairs.push((delta_poc, used));
            }
        }

        // 升序排列, 再把负向部分翻转为由近及远
        pairs.sort_by_key(|&(poc, _)| poc);
        let num_negative = pairs.iter().filter(|&&(poc, _)| poc < 0).count();
        pairs[..num_negative].reverse();

        rps.num_delta_pocs = pairs.len();
        rps.num_negative_pics = num_negative;
        for (k, (poc, used)) in pairs.into_iter().enumerate() {
            rps.delta_poc[k] = poc;
            rps.used[k] = used;
        }
    } else {
        let num_negative = br.read_ue()? as usize;
        let num_positive = br.read_ue()? as usize;
        if num_negative >= MAX_REFS || num_positive >= MAX_REFS {
            return Err(TaoError::InvalidData(format!(
                "HEVC: 短期 RPS 图像数量过多, negative={}, positive={}",
                num_negative, num_positive
            )));
        }
        rps.num_negative_pics = num_negative;
        rps.num_delta_pocs = num_negative + num_positive;

        let mut prev = 0i32;
        for i in 0..num_negative {
            prev -= br.read_ue()? as i32 + 1;
            rps.delta_poc[i] = prev;
            rps.used[i] = br.read_flag()?;
        }
        prev = 0;
        for i in 0..num_positive {
            prev += br.read_ue()? as i32 + 1;
            rps.delta_poc[num_negative + i] = prev;
            rps.used[num_negative + i] = br.read_flag()?;
        }
    }
    Ok(rps)
}

// ============================================================
// 缩放列表
// ============================================================

/// 缩放列表 (光栅顺序存储, 16x16/32x32 使用 8x8 上采样)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingList {
    /// [size_id][matrix_id][光栅位置]
    pub sl: [[[u8; 64]; 6]; 4],
    /// 16x16 与 32x32 的 DC 值 [size_id - 2][matrix_id]
    pub sl_dc: [[u8; 6]; 2],
}

impl Default for ScalingList {
    fn default() -> Self {
        let mut list = Self {
            sl: [[[16; 64]; 6]; 4],
            sl_dc: [[16; 6]; 2],
        };
        let scan = diag_scan(8);
        for size_id in 1..4 {
            for matrix_id in 0..6 {
                let table = if matrix_id < 3 {
                    &DEFAULT_SCALING_LIST_INTRA
                } else {
                    &DEFAULT_SCALING_LIST_INTER
                };
                for (i, &(x, y)) in scan.iter().enumerate() {
                    list.sl[size_id][matrix_id][y * 8 + x] = table[i];
                }
            }
        }
        list
    }
}

impl ScalingList {
    /// 查询缩放因子 m[x][y]
    pub fn factor(&self, log2_size: u32, matrix_id: usize, x: usize, y: usize) -> i32 {
        let size_id = (log2_size - 2) as usize;
        match size_id {
            0 => i32::from(self.sl[0][matrix_id][y * 4 + x]),
            1 => i32::from(self.sl[1][matrix_id][y * 8 + x]),
            2 | 3 => {
                if x == 0 && y == 0 {
                    return i32::from(self.sl_dc[size_id - 2][matrix_id]);
                }
                let shift = size_id - 1;
                i32::from(self.sl[size_id][matrix_id][(y >> shift) * 8 + (x >> shift)])
            }
            _ => 16,
        }
    }

    /// 解析 scaling_list_data()
    pub fn parse(br: &mut BitReader, chroma_format_idc: u32) -> TaoResult<Self> {
        let mut list = Self::default();
        let scan4 = diag_scan(4);
        let scan8 = diag_scan(8);

        for size_id in 0..4usize {
            let step = if size_id == 3 { 3 } else { 1 };
            for matrix_id in (0..6usize).step_by(step) {
                let pred_mode_flag = br.read_flag()?;
                if !pred_mode_flag {
                    let delta = br.read_ue()? as usize * step;
                    if delta > matrix_id {
                        return Err(TaoError::InvalidData(format!(
                            "HEVC: scaling_list_pred_matrix_id_delta 非法, size_id={}, delta={}",
                            size_id, delta
                        )));
                    }
                    if delta != 0 {
                        let src = matrix_id - delta;
                        list.sl[size_id][matrix_id] = list.sl[size_id][src];
                        if size_id > 1 {
                            list.sl_dc[size_id - 2][matrix_id] = list.sl_dc[size_id - 2][src];
                        }
                    }
                } else {
                    let mut next_coef = 8i32;
                    let coef_num = if size_id == 0 { 16 } else { 64 };
                    if size_id > 1 {
                        let dc = br.read_se()? + 8;
                        if !(1..=255).contains(&dc) {
                            return Err(TaoError::InvalidData(format!(
                                "HEVC: scaling_list_dc_coef 非法, value={}",
                                dc
                            )));
                        }
                        next_coef = dc;
                        list.sl_dc[size_id - 2][matrix_id] = dc as u8;
                    }
                    for i in 0..coef_num {
                        let delta = br.read_se()?;
                        next_coef = (next_coef + delta + 256).rem_euclid(256);
                        let pos = if size_id == 0 {
                            let (x, y) = scan4[i];
                            y * 4 + x
                        } else {
                            let (x, y) = scan8[i];
                            y * 8 + x
                        };
                        list.sl[size_id][matrix_id][pos] = next_coef as u8;
                    }
                }
            }
        }

        // 4:4:4 的 32x32 色度矩阵沿用 16x16
        if chroma_format_idc == 3 {
            for matrix_id in [1usize, 2, 4, 5] {
                list.sl[3][matrix_id] = list.sl[2][matrix_id];
                list.sl_dc[1][matrix_id] = list.sl_dc[0][matrix_id];
            }
        }
        Ok(list)
    }
}

// ============================================================
// profile_tier_level / VPS
// ============================================================

/// profile_tier_level 中的通用部分
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileTierLevel {
    pub profile_space: u8,
    pub tier_flag: bool,
    pub profile_idc: u8,
    pub level_idc: u8,
}

fn parse_profile_tier_level(br: &mut BitReader, max_sub_layers: usize) -> TaoResult<ProfileTierLevel> {
    let profile_space = br.read_bits(2)? as u8;
    let tier_flag = br.read_flag()?;
    let profile_idc = br.read_bits(5)? as u8;
    br.skip_bits(32)?; // general_profile_compatibility_flag[32]
    br.skip_bits(4)?; // progressive/interlaced/non_packed/frame_only
    br.skip_bits(44)?; // 约束标志与保留位
    let level_idc = br.read_bits(8)? as u8;

    let mut profile_present = [false; MAX_SUB_LAYERS];
    let mut level_present = [false; MAX_SUB_LAYERS];
    for i in 0..max_sub_layers.saturating_sub(1) {
        profile_present[i] = br.read_flag()?;
        level_present[i] = br.read_flag()?;
    }
    if max_sub_layers > 1 {
        for _ in max_sub_layers - 1..8 {
            br.skip_bits(2)?; // reserved_zero_2bits
        }
    }
    for i in 0..max_sub_layers.saturating_sub(1) {
        if profile_present[i] {
            br.skip_bits(88)?;
        }
        if level_present[i] {
            br.skip_bits(8)?;
        }
    }

    Ok(ProfileTierLevel {
        profile_space,
        tier_flag,
        profile_idc,
        level_idc,
    })
}

/// 视频参数集
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vps {
    pub vps_id: u32,
    pub max_layers: u32,
    pub max_sub_layers: usize,
    pub temporal_id_nesting: bool,
    pub ptl: ProfileTierLevel,
}

/// 解析 VPS (RBSP 不含 NAL 头)
pub fn parse_vps(payload: &[u8]) -> TaoResult<Vps> {
    let mut br = BitReader::new(payload);
    let vps_id = br.read_bits(4)?;
    if br.read_bits(2)? != 3 {
        return Err(TaoError::InvalidData("HEVC: vps_reserved_three_2bits 不为 3".into()));
    }
    let max_layers = br.read_bits(6)? + 1;
    let max_sub_layers = br.read_bits(3)? as usize + 1;
    let temporal_id_nesting = br.read_flag()?;
    if br.read_bits(16)? != 0xFFFF {
        return Err(TaoError::InvalidData("HEVC: vps_reserved_ffff_16bits 不为 0xffff".into()));
    }
    if max_sub_layers > MAX_SUB_LAYERS {
        return Err(TaoError::InvalidData(format!(
            "HEVC: vps_max_sub_layers 超出范围, value={}",
            max_sub_layers
        )));
    }
    let ptl = parse_profile_tier_level(&mut br, max_sub_layers)?;
    Ok(Vps {
        vps_id,
        max_layers,
        max_sub_layers,
        temporal_id_nesting,
        ptl,
    })
}

// ============================================================
// SPS
// ============================================================

/// 子层排序信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubLayerOrdering {
    pub max_dec_pic_buffering: u32,
    pub num_reorder_pics: u32,
    pub max_latency_increase_plus1: u32,
}

/// PCM 参数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PcmParams {
    pub bit_depth: u32,
    pub bit_depth_chroma: u32,
    pub log2_min_pcm_cb_size: u32,
    pub log2_max_pcm_cb_size: u32,
    pub loop_filter_disabled: bool,
}

/// 序列参数集
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sps {
    pub sps_id: u32,
    pub vps_id: u32,
    pub max_sub_layers: usize,
    pub ptl: ProfileTierLevel,
    pub chroma_format_idc: u32,
    pub separate_colour_plane: bool,
    /// 亮度宽度 (编码尺寸)
    pub width: u32,
    /// 亮度高度 (编码尺寸)
    pub height: u32,
    /// conformance window (左, 右, 上, 下), 亮度样本单位
    pub conf_win: [u32; 4],
    pub bit_depth: u32,
    pub bit_depth_chroma: u32,
    pub log2_max_poc_lsb: u32,
    pub sub_layers: [SubLayerOrdering; MAX_SUB_LAYERS],
    pub log2_min_cb_size: u32,
    pub log2_diff_max_min_cb_size: u32,
    pub log2_min_tb_size: u32,
    pub log2_max_tb_size: u32,
    pub max_transform_hierarchy_depth_inter: u32,
    pub max_transform_hierarchy_depth_intra: u32,
    pub scaling_list_enabled: bool,
    pub scaling_list: ScalingList,
    pub amp_enabled: bool,
    pub sao_enabled: bool,
    pub pcm_enabled: bool,
    pub pcm: PcmParams,
    pub st_rps: Vec<ShortTermRps>,
    pub long_term_ref_pics_present: bool,
    pub lt_ref_pic_poc_lsb_sps: Vec<u32>,
    pub used_by_curr_pic_lt_sps: Vec<bool>,
    pub temporal_mvp_enabled: bool,
    pub strong_intra_smoothing_enabled: bool,
    pub vui_present: bool,
    // range extension
    pub transform_skip_rotation_enabled: bool,
    pub transform_skip_context_enabled: bool,
    pub implicit_rdpcm_enabled: bool,
    pub explicit_rdpcm_enabled: bool,
    pub extended_precision_processing: bool,
    pub intra_smoothing_disabled: bool,
    pub high_precision_offsets_enabled: bool,
    pub persistent_rice_adaptation_enabled: bool,
    pub cabac_bypass_alignment_enabled: bool,

    // 派生几何
    pub log2_ctb_size: u32,
    pub ctb_width: u32,
    pub ctb_height: u32,
    pub min_cb_width: u32,
    pub min_cb_height: u32,
    pub min_tb_width: u32,
    pub min_tb_height: u32,
    /// 运动场以 4x4 为单位
    pub min_pu_width: u32,
    pub min_pu_height: u32,
    pub hshift: [u32; 3],
    pub vshift: [u32; 3],
    pub qp_bd_offset: i32,
}

impl Sps {
    /// ChromaArrayType (独立色彩平面时为 0)
    pub fn chroma_array_type(&self) -> u32 {
        if self.separate_colour_plane {
            0
        } else {
            self.chroma_format_idc
        }
    }

    /// CTB 边长
    pub fn ctb_size(&self) -> u32 {
        1 << self.log2_ctb_size
    }

    /// CTB 总数
    pub fn ctb_count(&self) -> u32 {
        self.ctb_width * self.ctb_height
    }

    /// 最高子层的排序信息
    pub fn highest_sub_layer(&self) -> &SubLayerOrdering {
        &self.sub_layers[self.max_sub_layers - 1]
    }

    /// 平面数量 (单色为 1)
    pub fn plane_count(&self) -> usize {
        if self.chroma_format_idc == 0 { 1 } else { 3 }
    }

    /// 输出宽度 (应用 conformance window)
    pub fn output_width(&self) -> u32 {
        self.width - self.conf_win[0] - self.conf_win[1]
    }

    /// 输出高度 (应用 conformance window)
    pub fn output_height(&self) -> u32 {
        self.height - self.conf_win[2] - self.conf_win[3]
    }
}

fn chroma_shifts(chroma_format_idc: u32) -> (u32, u32) {
    match chroma_format_idc {
        1 => (1, 1),
        2 => (1, 0),
        _ => (0, 0),
    }
}

/// 解析 SPS (RBSP 不含 NAL 头)
pub fn parse_sps(payload: &[u8]) -> TaoResult<Sps> {
    let mut br = BitReader::new(payload);

    let vps_id = br.read_bits(4)?;
    let max_sub_layers = br.read_bits(3)? as usize + 1;
    if max_sub_layers > MAX_SUB_LAYERS {
        return Err(TaoError::InvalidData(format!(
            "HEVC: sps_max_sub_layers 超出范围, value={}",
            max_sub_layers
        )));
    }
    let _temporal_id_nesting = br.read_flag()?;
    let ptl = parse_profile_tier_level(&mut br, max_sub_layers)?;

    let sps_id = br.read_ue()?;
    if sps_id as usize >= MAX_SPS_COUNT {
        return Err(TaoError::InvalidData(format!("HEVC: SPS id 超出范围, id={}", sps_id)));
    }

    let chroma_format_idc = br.read_ue()?;
    if chroma_format_idc > 3 {
        return Err(TaoError::InvalidData(format!(
            "HEVC: chroma_format_idc 非法, value={}",
            chroma_format_idc
        )));
    }
    let separate_colour_plane = chroma_format_idc == 3 && br.read_flag()?;
    let effective_chroma = if separate_colour_plane { 0 } else { chroma_format_idc };

    let width = br.read_ue()?;
    let height = br.read_ue()?;
    if width == 0 || height == 0 || width > 16888 || height > 16888 {
        return Err(TaoError::InvalidData(format!(
            "HEVC: 图像尺寸非法, {}x{}",
            width, height
        )));
    }

    let (sub_w, sub_h) = chroma_shifts(effective_chroma);
    let mut conf_win = [0u32; 4];
    if br.read_flag()? {
        conf_win[0] = br.read_ue()? << sub_w;
        conf_win[1] = br.read_ue()? << sub_w;
        conf_win[2] = br.read_ue()? << sub_h;
        conf_win[3] = br.read_ue()? << sub_h;
        if conf_win[0] + conf_win[1] >= width || conf_win[2] + conf_win[3] >= height {
            return Err(TaoError::InvalidData(format!(
                "HEVC: conformance window 非法, {:?}",
                conf_win
            )));
        }
    }

    let bit_depth = br.read_ue()? + 8;
    let bit_depth_chroma = br.read_ue()? + 8;
    if bit_depth > 12 || bit_depth_chroma > 12 {
        return Err(TaoError::Unsupported(format!(
            "HEVC: 位深 {} / {} 不受支持",
            bit_depth, bit_depth_chroma
        )));
    }
    if effective_chroma != 0 && bit_depth != bit_depth_chroma {
        return Err(TaoError::Unsupported(format!(
            "HEVC: 亮度与色度位深不同 ({} / {})",
            bit_depth, bit_depth_chroma
        )));
    }

    let log2_max_poc_lsb = br.read_ue()? + 4;
    if log2_max_poc_lsb > 16 {
        return Err(TaoError::InvalidData(format!(
            "HEVC: log2_max_pic_order_cnt_lsb 超出范围, value={}",
            log2_max_poc_lsb
        )));
    }

    let mut sub_layers = [SubLayerOrdering::default(); MAX_SUB_LAYERS];
    let sub_layer_ordering_info = br.read_flag()?;
    let start = if sub_layer_ordering_info { 0 } else { max_sub_layers - 1 };
    for layer in sub_layers.iter_mut().take(max_sub_layers).skip(start) {
        layer.max_dec_pic_buffering = br.read_ue()? + 1;
        layer.num_reorder_pics = br.read_ue()?;
        layer.max_latency_increase_plus1 = br.read_ue()?;
        if layer.max_dec_pic_buffering > MAX_REFS as u32 + 1 {
            return Err(TaoError::InvalidData(format!(
                "HEVC: sps_max_dec_pic_buffering 超出范围, value={}",
                layer.max_dec_pic_buffering
            )));
        }
        if layer.num_reorder_pics > layer.max_dec_pic_buffering - 1 {
            warn!(
                "HEVC: sps_max_num_reorder_pics={} 大于 max_dec_pic_buffering-1, 已修正",
                layer.num_reorder_pics
            );
            layer.max_dec_pic_buffering = layer.num_reorder_pics + 1;
        }
    }
    if !sub_layer_ordering_info {
        let top = sub_layers[start];
        for layer in sub_layers.iter_mut().take(start) {
            *layer = top;
        }
    }

    let log2_min_cb_size = br.read_ue()? + 3;
    let log2_diff_max_min_cb_size = br.read_ue()?;
    let log2_min_tb_size = br.read_ue()? + 2;
    let log2_diff_max_min_tb_size = br.read_ue()?;
    let log2_max_tb_size = log2_min_tb_size + log2_diff_max_min_tb_size;
    let max_transform_hierarchy_depth_inter = br.read_ue()?;
    let max_transform_hierarchy_depth_intra = br.read_ue()?;

    let log2_ctb_size = log2_min_cb_size + log2_diff_max_min_cb_size;
    if !(4..=MAX_LOG2_CTB_SIZE).contains(&log2_ctb_size) {
        return Err(TaoError::InvalidData(format!(
            "HEVC: CTB 尺寸非法, log2_ctb_size={}",
            log2_ctb_size
        )));
    }
    if log2_min_tb_size >= log2_min_cb_size {
        return Err(TaoError::InvalidData(format!(
            "HEVC: 最小变换块不小于最小编码块, tb={}, cb={}",
            log2_min_tb_size, log2_min_cb_size
        )));
    }
    if log2_max_tb_size > log2_ctb_size.min(5) {
        return Err(TaoError::InvalidData(format!(
            "HEVC: 最大变换块尺寸非法, log2_max_tb_size={}",
            log2_max_tb_size
        )));
    }
    if max_transform_hierarchy_depth_inter > log2_ctb_size - log2_min_tb_size
        || max_transform_hierarchy_depth_intra > log2_ctb_size - log2_min_tb_size
    {
        return Err(TaoError::InvalidData(format!(
            "HEVC: max_transform_hierarchy_depth 超出范围, inter={}, intra={}",
            max_transform_hierarchy_depth_inter, max_transform_hierarchy_depth_intra
        )));
    }
    if width & ((1 << log2_min_cb_size) - 1) != 0 || height & ((1 << log2_min_cb_size) - 1) != 0 {
        return Err(TaoError::InvalidData(format!(
            "HEVC: 图像尺寸 {}x{} 不是最小编码块 {} 的整数倍",
            width,
            height,
            1 << log2_min_cb_size
        )));
    }

    let scaling_list_enabled = br.read_flag()?;
    let mut scaling_list = ScalingList::default();
    if scaling_list_enabled && br.read_flag()? {
        scaling_list = ScalingList::parse(&mut br, chroma_format_idc)?;
    }

    let amp_enabled = br.read_flag()?;
    let sao_enabled = br.read_flag()?;
    let pcm_enabled = br.read_flag()?;
    let mut pcm = PcmParams::default();
    if pcm_enabled {
        pcm.bit_depth = br.read_bits(4)? + 1;
        pcm.bit_depth_chroma = br.read_bits(4)? + 1;
        pcm.log2_min_pcm_cb_size = br.read_ue()? + 3;
        pcm.log2_max_pcm_cb_size = pcm.log2_min_pcm_cb_size + br.read_ue()?;
        if pcm.bit_depth > bit_depth || pcm.bit_depth_chroma > bit_depth_chroma {
            return Err(TaoError::InvalidData(format!(
                "HEVC: PCM 位深 {}/{} 大于图像位深 {}/{}",
                pcm.bit_depth, pcm.bit_depth_chroma, bit_depth, bit_depth_chroma
            )));
        }
        if pcm.log2_max_pcm_cb_size > log2_ctb_size.min(5) {
            return Err(TaoError::InvalidData(format!(
                "HEVC: PCM 最大尺寸非法, log2={}",
                pcm.log2_max_pcm_cb_size
            )));
        }
        pcm.loop_filter_disabled = br.read_flag()?;
    }

    let nb_st_rps = br.read_ue()? as usize;
    if nb_st_rps > MAX_SHORT_TERM_RPS_COUNT {
        return Err(TaoError::InvalidData(format!(
            "HEVC: num_short_term_ref_pic_sets 超出范围, value={}",
            nb_st_rps
        )));
    }
    let mut st_rps = Vec::with_capacity(nb_st_rps);
    for _ in 0..nb_st_rps {
        let rps = parse_short_term_rps(&mut br, &st_rps, false)?;
        st_rps.push(rps);
    }

    let long_term_ref_pics_present = br.read_flag()?;
    let mut lt_ref_pic_poc_lsb_sps = Vec::new();
    let mut used_by_curr_pic_lt_sps = Vec::new();
    if long_term_ref_pics_present {
        let num = br.read_ue()? as usize;
        if num > MAX_LONG_TERM_REF_PICS {
            return Err(TaoError::InvalidData(format!(
                "HEVC: num_long_term_ref_pics_sps 超出范围, value={}",
                num
            )));
        }
        for _ in 0..num {
            lt_ref_pic_poc_lsb_sps.push(br.read_bits(log2_max_poc_lsb)?);
            used_by_curr_pic_lt_sps.push(br.read_flag()?);
        }
    }

    let temporal_mvp_enabled = br.read_flag()?;
    let strong_intra_smoothing_enabled = br.read_flag()?;

    let vui_present = br.read_flag()?;
    if vui_present {
        skip_vui(&mut br, max_sub_layers)?;
    }

    let mut sps = Sps {
        sps_id,
        vps_id,
        max_sub_layers,
        ptl,
        chroma_format_idc,
        separate_colour_plane,
        width,
        height,
        conf_win,
        bit_depth,
        bit_depth_chroma,
        log2_max_poc_lsb,
        sub_layers,
        log2_min_cb_size,
        log2_diff_max_min_cb_size,
        log2_min_tb_size,
        log2_max_tb_size,
        max_transform_hierarchy_depth_inter,
        max_transform_hierarchy_depth_intra,
        scaling_list_enabled,
        scaling_list,
        amp_enabled,
        sao_enabled,
        pcm_enabled,
        pcm,
        st_rps,
        long_term_ref_pics_present,
        lt_ref_pic_poc_lsb_sps,
        used_by_curr_pic_lt_sps,
        temporal_mvp_enabled,
        strong_intra_smoothing_enabled,
        vui_present,
        transform_skip_rotation_enabled: false,
        transform_skip_context_enabled: false,
        implicit_rdpcm_enabled: false,
        explicit_rdpcm_enabled: false,
        extended_precision_processing: false,
        intra_smoothing_disabled: false,
        high_precision_offsets_enabled: false,
        persistent_rice_adaptation_enabled: false,
        cabac_bypass_alignment_enabled: false,
        log2_ctb_size,
        ctb_width: width.div_ceil(1 << log2_ctb_size),
        ctb_height: height.div_ceil(1 << log2_ctb_size),
        min_cb_width: width >> log2_min_cb_size,
        min_cb_height: height >> log2_min_cb_size,
        min_tb_width: width >> log2_min_tb_size,
        min_tb_height: height >> log2_min_tb_size,
        min_pu_width: width >> 2,
        min_pu_height: height >> 2,
        hshift: [0, sub_w, sub_w],
        vshift: [0, sub_h, sub_h],
        qp_bd_offset: 6 * (bit_depth as i32 - 8),
    };

    // sps_extension
    if br.bits_left() > 0 && br.read_flag()? {
        let range_extension = br.read_flag()?;
        let multilayer_extension = br.read_flag()?;
        let ext_3d = br.read_flag()?;
        let _extension_5bits = br.read_bits(5)?;
        if range_extension {
            sps.transform_skip_rotation_enabled = br.read_flag()?;
            sps.transform_skip_context_enabled = br.read_flag()?;
            sps.implicit_rdpcm_enabled = br.read_flag()?;
            sps.explicit_rdpcm_enabled = br.read_flag()?;
            sps.extended_precision_processing = br.read_flag()?;
            sps.intra_smoothing_disabled = br.read_flag()?;
            sps.high_precision_offsets_enabled = br.read_flag()?;
            sps.persistent_rice_adaptation_enabled = br.read_flag()?;
            sps.cabac_bypass_alignment_enabled = br.read_flag()?;
            if sps.extended_precision_processing {
                warn!("HEVC: extended_precision_processing_flag 不受支持, 按普通精度解码");
            }
            if sps.cabac_bypass_alignment_enabled {
                warn!("HEVC: cabac_bypass_alignment_enabled_flag 不受支持");
            }
        }
        if multilayer_extension || ext_3d {
            debug!("HEVC: 忽略 SPS 多层/3D 扩展");
        }
    }

    debug!(
        "HEVC: SPS id={} {}x{} chroma={} bit_depth={} ctb={} min_cb={} st_rps={}",
        sps.sps_id,
        sps.width,
        sps.height,
        sps.chroma_format_idc,
        sps.bit_depth,
        sps.ctb_size(),
        1 << sps.log2_min_cb_size,
        sps.st_rps.len()
    );
    Ok(sps)
}

/// 跳过 VUI (只需保证码流位置正确)
fn skip_vui(br: &mut BitReader, max_sub_layers: usize) -> TaoResult<()> {
    if br.read_flag()? {
        let aspect_ratio_idc = br.read_bits(8)?;
        if aspect_ratio_idc == 255 {
            br.skip_bits(32)?; // sar_width + sar_height
        }
    }
    if br.read_flag()? {
        br.skip_bits(1)?; // overscan_appropriate_flag
    }
    if br.read_flag()? {
        br.skip_bits(4)?; // video_format + video_full_range_flag
        if br.read_flag()? {
            br.skip_bits(24)?; // colour_primaries, transfer, matrix
        }
    }
    if br.read_flag()? {
        br.read_ue()?;
        br.read_ue()?;
    }
    br.skip_bits(3)?; // neutral_chroma, field_seq, frame_field_info_present
    if br.read_flag()? {
        for _ in 0..4 {
            br.read_ue()?; // default display window
        }
    }
    if br.read_flag()? {
        br.skip_bits(64)?; // num_units_in_tick + time_scale
        if br.read_flag()? {
            br.read_ue()?; // num_ticks_poc_diff_one_minus1
        }
        if br.read_flag()? {
            skip_hrd_parameters(br, true, max_sub_layers)?;
        }
    }
    if br.read_flag()? {
        br.skip_bits(3)?;
        for _ in 0..5 {
            br.read_ue()?;
        }
    }
    Ok(())
}

fn skip_sub_layer_hrd(br: &mut BitReader, nb_cpb: u32, sub_pic_hrd: bool) -> TaoResult<()> {
    for _ in 0..nb_cpb {
        br.read_ue()?; // bit_rate_value_minus1
        br.read_ue()?; // cpb_size_value_minus1
        if sub_pic_hrd {
            br.read_ue()?;
            br.read_ue()?;
        }
        br.skip_bits(1)?; // cbr_flag
    }
    Ok(())
}

/// 跳过 hrd_parameters()
pub(super) fn skip_hrd_parameters(
    br: &mut BitReader,
    common_inf_present: bool,
    max_sub_layers: usize,
) -> TaoResult<()> {
    let mut nal_hrd = false;
    let mut vcl_hrd = false;
    let mut sub_pic_hrd = false;
    if common_inf_present {
        nal_hrd = br.read_flag()?;
        vcl_hrd = br.read_flag()?;
        if nal_hrd || vcl_hrd {
            sub_pic_hrd = br.read_flag()?;
            if sub_pic_hrd {
                br.skip_bits(8 + 5 + 1 + 5)?;
            }
            br.skip_bits(8)?; // bit_rate_scale + cpb_size_scale
            if sub_pic_hrd {
                br.skip_bits(4)?;
            }
            br.skip_bits(15)?;
        }
    }
    for _ in 0..max_sub_layers {
        let fixed_pic_rate_general = br.read_flag()?;
        let fixed_pic_rate_within_cvs = fixed_pic_rate_general || br.read_flag()?;
        let mut low_delay = false;
        if fixed_pic_rate_within_cvs {
            br.read_ue()?; // elemental_duration_in_tc_minus1
        } else {
            low_delay = br.read_flag()?;
        }
        let nb_cpb = if low_delay { 1 } else { br.read_ue()? + 1 };
        if nb_cpb > 32 {
            return Err(TaoError::InvalidData(format!(
                "HEVC: cpb_cnt 超出范围, value={}",
                nb_cpb
            )));
        }
        if nal_hrd {
            skip_sub_layer_hrd(br, nb_cpb, sub_pic_hrd)?;
        }
        if vcl_hrd {
            skip_sub_layer_hrd(br, nb_cpb, sub_pic_hrd)?;
        }
    }
    Ok(())
}

// ============================================================
// PPS
// ============================================================

/// 图像参数集
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pps {
    pub pps_id: u32,
    pub sps_id: u32,
    pub dependent_slice_segments_enabled: bool,
    pub output_flag_present: bool,
    pub num_extra_slice_header_bits: u32,
    pub sign_data_hiding: bool,
    pub cabac_init_present: bool,
    pub num_ref_idx_l0_default_active: u32,
    pub num_ref_idx_l1_default_active: u32,
    pub init_qp_minus26: i32,
    pub constrained_intra_pred: bool,
    pub transform_skip_enabled: bool,
    pub cu_qp_delta_enabled: bool,
    pub diff_cu_qp_delta_depth: u32,
    pub cb_qp_offset: i32,
    pub cr_qp_offset: i32,
    pub slice_chroma_qp_offsets_present: bool,
    pub weighted_pred: bool,
    pub weighted_bipred: bool,
    pub transquant_bypass_enabled: bool,
    pub tiles_enabled: bool,
    pub entropy_coding_sync_enabled: bool,
    pub num_tile_columns: u32,
    pub num_tile_rows: u32,
    pub uniform_spacing: bool,
    pub loop_filter_across_tiles_enabled: bool,
    pub loop_filter_across_slices_enabled: bool,
    pub deblocking_filter_control_present: bool,
    pub deblocking_filter_override_enabled: bool,
    pub disable_dbf: bool,
    /// beta_offset (已乘 2)
    pub beta_offset: i32,
    /// tc_offset (已乘 2)
    pub tc_offset: i32,
    pub scaling_list: Option<ScalingList>,
    pub lists_modification_present: bool,
    pub log2_parallel_merge_level: u32,
    pub slice_header_extension_present: bool,
    // range extension
    pub log2_max_transform_skip_block_size: u32,
    pub cross_component_prediction_enabled: bool,
    pub chroma_qp_offset_list_enabled: bool,
    pub diff_cu_chroma_qp_offset_depth: u32,
    pub cb_qp_offset_list: Vec<i32>,
    pub cr_qp_offset_list: Vec<i32>,
    pub log2_sao_offset_scale_luma: u32,
    pub log2_sao_offset_scale_chroma: u32,

    // 派生表
    pub column_width: Vec<u32>,
    pub row_height: Vec<u32>,
    pub col_bd: Vec<u32>,
    pub row_bd: Vec<u32>,
    pub col_idx_x: Vec<u32>,
    pub ctb_addr_rs_to_ts: Vec<u32>,
    pub ctb_addr_ts_to_rs: Vec<u32>,
    pub tile_id: Vec<u32>,
    pub tile_pos_rs: Vec<u32>,
    pub min_tb_addr_zs: Vec<u32>,
}

/// 解析 PPS (RBSP 不含 NAL 头), 需要所引用的 SPS 已存在
pub fn parse_pps(payload: &[u8], sps_table: &[Option<Arc<Sps>>]) -> TaoResult<Pps> {
    let mut br = BitReader::new(payload);

    let pps_id = br.read_ue()?;
    if pps_id as usize >= MAX_PPS_COUNT {
        return Err(TaoError::InvalidData(format!("HEVC: PPS id 超出范围, id={}", pps_id)));
    }
    let sps_id = br.read_ue()?;
    if sps_id as usize >= MAX_SPS_COUNT {
        return Err(TaoError::InvalidData(format!("HEVC: SPS id 超出范围, id={}", sps_id)));
    }
    let sps = sps_table
        .get(sps_id as usize)
        .and_then(|s| s.as_ref())
        .ok_or_else(|| TaoError::InvalidData(format!("HEVC: PPS 引用的 SPS 不存在, id={}", sps_id)))?;

    let dependent_slice_segments_enabled = br.read_flag()?;
    let output_flag_present = br.read_flag()?;
    let num_extra_slice_header_bits = br.read_bits(3)?;
    let sign_data_hiding = br.read_flag()?;
    let cabac_init_present = br.read_flag()?;
    let num_ref_idx_l0_default_active = br.read_ue()? + 1;
    let num_ref_idx_l1_default_active = br.read_ue()? + 1;
    if num_ref_idx_l0_default_active > MAX_REFS as u32 || num_ref_idx_l1_default_active > MAX_REFS as u32 {
        return Err(TaoError::InvalidData(format!(
            "HEVC: num_ref_idx_default_active 超出范围, l0={}, l1={}",
            num_ref_idx_l0_default_active, num_ref_idx_l1_default_active
        )));
    }
    let init_qp_minus26 = br.read_se()?;
    if !(-(26 + sps.qp_bd_offset)..=25).contains(&init_qp_minus26) {
        return Err(TaoError::InvalidData(format!(
            "HEVC: init_qp_minus26 超出范围, value={}",
            init_qp_minus26
        )));
    }
    let constrained_intra_pred = br.read_flag()?;
    let transform_skip_enabled = br.read_flag()?;
    let cu_qp_delta_enabled = br.read_flag()?;
    let diff_cu_qp_delta_depth = if cu_qp_delta_enabled { br.read_ue()? } else { 0 };
    if diff_cu_qp_delta_depth > sps.log2_diff_max_min_cb_size {
        return Err(TaoError::InvalidData(format!(
            "HEVC: diff_cu_qp_delta_depth 超出范围, value={}",
            diff_cu_qp_delta_depth
        )));
    }
    let cb_qp_offset = br.read_se()?;
    let cr_qp_offset = br.read_se()?;
    if !(-12..=12).contains(&cb_qp_offset) || !(-12..=12).contains(&cr_qp_offset) {
        return Err(TaoError::InvalidData(format!(
            "HEVC: pps chroma qp offset 超出范围, cb={}, cr={}",
            cb_qp_offset, cr_qp_offset
        )));
    }
    let slice_chroma_qp_offsets_present = br.read_flag()?;
    let weighted_pred = br.read_flag()?;
    let weighted_bipred = br.read_flag()?;
    let transquant_bypass_enabled = br.read_flag()?;
    let tiles_enabled = br.read_flag()?;
    let entropy_coding_sync_enabled = br.read_flag()?;

    let mut num_tile_columns = 1u32;
    let mut num_tile_rows = 1u32;
    let mut uniform_spacing = true;
    let mut loop_filter_across_tiles_enabled = true;
    let mut explicit_columns = Vec::new();
    let mut explicit_rows = Vec::new();
    if tiles_enabled {
        num_tile_columns = br.read_ue()? + 1;
        num_tile_rows = br.read_ue()? + 1;
        if num_tile_columns > sps.ctb_width || num_tile_rows > sps.ctb_height {
            return Err(TaoError::InvalidData(format!(
                "HEVC: tile 数量超出 CTB 范围, columns={}, rows={}",
                num_tile_columns, num_tile_rows
            )));
        }
        uniform_spacing = br.read_flag()?;
        if !uniform_spacing {
            for _ in 0..num_tile_columns - 1 {
                explicit_columns.push(br.read_ue()? + 1);
            }
            for _ in 0..num_tile_rows - 1 {
                explicit_rows.push(br.read_ue()? + 1);
            }
        }
        loop_filter_across_tiles_enabled = br.read_flag()?;
    }
    let loop_filter_across_slices_enabled = br.read_flag()?;

    let deblocking_filter_control_present = br.read_flag()?;
    let mut deblocking_filter_override_enabled = false;
    let mut disable_dbf = false;
    let mut beta_offset = 0;
    let mut tc_offset = 0;
    if deblocking_filter_control_present {
        deblocking_filter_override_enabled = br.read_flag()?;
        disable_dbf = br.read_flag()?;
        if !disable_dbf {
            let beta = br.read_se()?;
            let tc = br.read_se()?;
            if !(-6..=6).contains(&beta) || !(-6..=6).contains(&tc) {
                return Err(TaoError::InvalidData(format!(
                    "HEVC: pps deblocking offset 超出范围, beta={}, tc={}",
                    beta, tc
                )));
            }
            beta_offset = beta * 2;
            tc_offset = tc * 2;
        }
    }

    let scaling_list = if br.read_flag()? {
        Some(ScalingList::parse(&mut br, sps.chroma_format_idc)?)
    } else {
        None
    };
    let lists_modification_present = br.read_flag()?;
    let log2_parallel_merge_level = br.read_ue()? + 2;
    if log2_parallel_merge_level > sps.log2_ctb_size {
        return Err(TaoError::InvalidData(format!(
            "HEVC: log2_parallel_merge_level 超出范围, value={}",
            log2_parallel_merge_level
        )));
    }
    let slice_header_extension_present = br.read_flag()?;

    let mut pps = Pps {
        pps_id,
        sps_id,
        dependent_slice_segments_enabled,
        output_flag_present,
        num_extra_slice_header_bits,
        sign_data_hiding,
        cabac_init_present,
        num_ref_idx_l0_default_active,
        num_ref_idx_l1_default_active,
        init_qp_minus26,
        constrained_intra_pred,
        transform_skip_enabled,
        cu_qp_delta_enabled,
        diff_cu_qp_delta_depth,
        cb_qp_offset,
        cr_qp_offset,
        slice_chroma_qp_offsets_present,
        weighted_pred,
        weighted_bipred,
        transquant_bypass_enabled,
        tiles_enabled,
        entropy_coding_sync_enabled,
        num_tile_columns,
        num_tile_rows,
        uniform_spacing,
        loop_filter_across_tiles_enabled,
        loop_filter_across_slices_enabled,
        deblocking_filter_control_present,
        deblocking_filter_override_enabled,
        disable_dbf,
        beta_offset,
        tc_offset,
        scaling_list,
        lists_modification_present,
        log2_parallel_merge_level,
        slice_header_extension_present,
        log2_max_transform_skip_block_size: 2,
        cross_component_prediction_enabled: false,
        chroma_qp_offset_list_enabled: false,
        diff_cu_chroma_qp_offset_depth: 0,
        cb_qp_offset_list: Vec::new(),
        cr_qp_offset_list: Vec::new(),
        log2_sao_offset_scale_luma: 0,
        log2_sao_offset_scale_chroma: 0,
        column_width: Vec::new(),
        row_height: Vec::new(),
        col_bd: Vec::new(),
        row_bd: Vec::new(),
        col_idx_x: Vec::new(),
        ctb_addr_rs_to_ts: Vec::new(),
        ctb_addr_ts_to_rs: Vec::new(),
        tile_id: Vec::new(),
        tile_pos_rs: Vec::new(),
        min_tb_addr_zs: Vec::new(),
    };

    if br.bits_left() > 0 && br.read_flag()? {
        let range_extension = br.read_flag()?;
        let _multilayer = br.read_flag()?;
        let _ext_3d = br.read_flag()?;
        let _ext_5bits = br.read_bits(5)?;
        if range_extension {
            parse_pps_range_extension(&mut br, &mut pps, sps)?;
        }
    }

    build_tile_tables(&mut pps, sps, &explicit_columns, &explicit_rows)?;

    debug!(
        "HEVC: PPS id={} sps={} tiles={}x{} wpp={} cu_qp_delta={} init_qp={}",
        pps.pps_id,
        pps.sps_id,
        pps.num_tile_columns,
        pps.num_tile_rows,
        pps.entropy_coding_sync_enabled,
        pps.cu_qp_delta_enabled,
        26 + pps.init_qp_minus26
    );
    Ok(pps)
}

fn parse_pps_range_extension(br: &mut BitReader, pps: &mut Pps, sps: &Sps) -> TaoResult<()> {
    if pps.transform_skip_enabled {
        pps.log2_max_transform_skip_block_size = br.read_ue()? + 2;
        if pps.log2_max_transform_skip_block_size > 5 {
            return Err(TaoError::InvalidData(format!(
                "HEVC: log2_max_transform_skip_block_size 超出范围, value={}",
                pps.log2_max_transform_skip_block_size
            )));
        }
    }
    pps.cross_component_prediction_enabled = br.read_flag()?;
    if pps.cross_component_prediction_enabled && sps.chroma_format_idc != 3 {
        return Err(TaoError::InvalidData(
            "HEVC: 交叉分量预测仅允许用于 4:4:4".into(),
        ));
    }
    pps.chroma_qp_offset_list_enabled = br.read_flag()?;
    if pps.chroma_qp_offset_list_enabled {
        pps.diff_cu_chroma_qp_offset_depth = br.read_ue()?;
        let len = br.read_ue()? as usize + 1;
        if len > 6 {
            return Err(TaoError::InvalidData(format!(
                "HEVC: chroma_qp_offset_list_len 超出范围, value={}",
                len
            )));
        }
        for _ in 0..len {
            let cb = br.read_se()?;
            let cr = br.read_se()?;
            if !(-12..=12).contains(&cb) || !(-12..=12).contains(&cr) {
                return Err(TaoError::InvalidData(format!(
                    "HEVC: chroma qp offset list 超出范围, cb={}, cr={}",
                    cb, cr
                )));
            }
            pps.cb_qp_offset_list.push(cb);
            pps.cr_qp_offset_list.push(cr);
        }
    }
    let max_scale = (sps.bit_depth as i32 - 10).max(0) as u32;
    pps.log2_sao_offset_scale_luma = br.read_ue()?;
    pps.log2_sao_offset_scale_chroma = br.read_ue()?;
    if pps.log2_sao_offset_scale_luma > max_scale || pps.log2_sao_offset_scale_chroma > max_scale {
        return Err(TaoError::InvalidData(format!(
            "HEVC: log2_sao_offset_scale 超出范围, luma={}, chroma={}",
            pps.log2_sao_offset_scale_luma, pps.log2_sao_offset_scale_chroma
        )));
    }
    Ok(())
}

/// 计算 tile 相关派生表
fn build_tile_tables(pps: &mut Pps, sps: &Sps, columns: &[u32], rows: &[u32]) -> TaoResult<()> {
    let cols = pps.num_tile_columns as usize;
    let nrows = pps.num_tile_rows as usize;

    pps.column_width = vec![0; cols];
    pps.row_height = vec![0; nrows];
    if pps.uniform_spacing {
        for i in 0..cols {
            pps.column_width[i] = ((i as u32 + 1) * sps.ctb_width) / pps.num_tile_columns
                - (i as u32 * sps.ctb_width) / pps.num_tile_columns;
        }
        for i in 0..nrows {
            pps.row_height[i] = ((i as u32 + 1) * sps.ctb_height) / pps.num_tile_rows
                - (i as u32 * sps.ctb_height) / pps.num_tile_rows;
        }
    } else {
        let mut sum = 0u32;
        for (i, &w) in columns.iter().enumerate() {
            pps.column_width[i] = w;
            sum += w;
        }
        if sum >= sps.ctb_width {
            return Err(TaoError::InvalidData(format!(
                "HEVC: tile 列宽之和 {} 超出 ctb_width {}",
                sum, sps.ctb_width
            )));
        }
        pps.column_width[cols - 1] = sps.ctb_width - sum;

        sum = 0;
        for (i, &h) in rows.iter().enumerate() {
            pps.row_height[i] = h;
            sum += h;
        }
        if sum >= sps.ctb_height {
            return Err(TaoError::InvalidData(format!(
                "HEVC: tile 行高之和 {} 超出 ctb_height {}",
                sum, sps.ctb_height
            )));
        }
        pps.row_height[nrows - 1] = sps.ctb_height - sum;
    }

    pps.col_bd = vec![0; cols + 1];
    pps.row_bd = vec![0; nrows + 1];
    for i in 0..cols {
        pps.col_bd[i + 1] = pps.col_bd[i] + pps.column_width[i];
    }
    for i in 0..nrows {
        pps.row_bd[i + 1] = pps.row_bd[i] + pps.row_height[i];
    }

    pps.col_idx_x = vec![0; sps.ctb_width as usize];
    let mut j = 0u32;
    for (i, idx) in pps.col_idx_x.iter_mut().enumerate() {
        if i as u32 >= pps.col_bd[j as usize + 1] {
            j += 1;
        }
        *idx = j;
    }

    let ctb_count = sps.ctb_count() as usize;
    pps.ctb_addr_rs_to_ts = vec![0; ctb_count];
    pps.ctb_addr_ts_to_rs = vec![0; ctb_count];
    for rs in 0..ctb_count {
        let tb_x = rs as u32 % sps.ctb_width;
        let tb_y = rs as u32 / sps.ctb_width;
        let tile_x = pps.col_idx_x[tb_x as usize] as usize;
        let mut tile_y = 0usize;
        for i in 0..nrows {
            if tb_y >= pps.row_bd[i] {
                tile_y = i;
            }
        }
        let mut val = 0u32;
        for i in 0..tile_x {
            val += pps.row_height[tile_y] * pps.column_width[i];
        }
        for i in 0..tile_y {
            val += sps.ctb_width * pps.row_height[i];
        }
        val += (tb_y - pps.row_bd[tile_y]) * pps.column_width[tile_x] + tb_x - pps.col_bd[tile_x];
        pps.ctb_addr_rs_to_ts[rs] = val;
        pps.ctb_addr_ts_to_rs[val as usize] = rs as u32;
    }

    pps.tile_id = vec![0; ctb_count];
    pps.tile_pos_rs = Vec::with_capacity(cols * nrows);
    let mut tile_idx = 0u32;
    for j in 0..nrows {
        for i in 0..cols {
            for y in pps.row_bd[j]..pps.row_bd[j + 1] {
                for x in pps.col_bd[i]..pps.col_bd[i + 1] {
                    let rs = (y * sps.ctb_width + x) as usize;
                    pps.tile_id[pps.ctb_addr_rs_to_ts[rs] as usize] = tile_idx;
                }
            }
            pps.tile_pos_rs.push(pps.row_bd[j] * sps.ctb_width + pps.col_bd[i]);
            tile_idx += 1;
        }
    }

    let log2_diff = sps.log2_ctb_size - sps.log2_min_tb_size;
    let tb_w = (sps.ctb_width << log2_diff) as usize;
    let tb_h = (sps.ctb_height << log2_diff) as usize;
    pps.min_tb_addr_zs = vec![0; tb_w * tb_h];
    for y in 0..tb_h {
        for x in 0..tb_w {
            let ctb_rs = (y >> log2_diff) * sps.ctb_width as usize + (x >> log2_diff);
            let mut val = pps.ctb_addr_rs_to_ts[ctb_rs] << (log2_diff * 2);
            for i in 0..log2_diff {
                let m = 1usize << i;
                if m & x != 0 {
                    val += (m * m) as u32;
                }
                if m & y != 0 {
                    val += (2 * m * m) as u32;
                }
            }
            pps.min_tb_addr_zs[y * tb_w + x] = val;
        }
    }
    Ok(())
}

impl Pps {
    /// min_tb_addr_zs 表的行宽 (按 CTB 对齐)
    pub fn min_tb_stride(&self, sps: &Sps) -> usize {
        (sps.ctb_width << (sps.log2_ctb_size - sps.log2_min_tb_size)) as usize
    }

    /// 当前生效的缩放列表 (PPS 优先于 SPS)
    pub fn effective_scaling_list<'a>(&'a self, sps: &'a Sps) -> Option<&'a ScalingList> {
        if !sps.scaling_list_enabled {
            return None;
        }
        Some(self.scaling_list.as_ref().unwrap_or(&sps.scaling_list))
    }
}

// ============================================================
// 参数集缓存
// ============================================================

/// VPS/SPS/PPS 缓存表
#[derive(Debug, Clone)]
pub struct ParameterSetCache {
    pub vps: Vec<Option<Arc<Vps>>>,
    pub sps: Vec<Option<Arc<Sps>>>,
    pub pps: Vec<Option<Arc<Pps>>>,
}

impl Default for ParameterSetCache {
    fn default() -> Self {
        Self {
            vps: vec![None; MAX_VPS_COUNT],
            sps: vec![None; MAX_SPS_COUNT],
            pps: vec![None; MAX_PPS_COUNT],
        }
    }
}

impl ParameterSetCache {
    /// 解析并存入 VPS
    pub fn insert_vps(&mut self, payload: &[u8]) -> TaoResult<Arc<Vps>> {
        let vps = Arc::new(parse_vps(payload)?);
        self.vps[vps.vps_id as usize] = Some(vps.clone());
        Ok(vps)
    }

    /// 解析并存入 SPS
    ///
    /// 内容有变化时移除所有引用该 SPS 的 PPS.
    pub fn insert_sps(&mut self, payload: &[u8]) -> TaoResult<Arc<Sps>> {
        let sps = parse_sps(payload)?;
        if self.vps[sps.vps_id as usize].is_none() {
            debug!("HEVC: SPS 引用的 VPS {} 尚不存在", sps.vps_id);
        }
        let id = sps.sps_id as usize;
        if let Some(old) = &self.sps[id] {
            if **old == sps {
                return Ok(old.clone());
            }
            for slot in self.pps.iter_mut() {
                if slot.as_ref().is_some_and(|p| p.sps_id == sps.sps_id) {
                    *slot = None;
                }
            }
        }
        let sps = Arc::new(sps);
        self.sps[id] = Some(sps.clone());
        Ok(sps)
    }

    /// 解析并存入 PPS
    pub fn insert_pps(&mut self, payload: &[u8]) -> TaoResult<Arc<Pps>> {
        let pps = Arc::new(parse_pps(payload, &self.sps)?);
        self.pps[pps.pps_id as usize] = Some(pps.clone());
        Ok(pps)
    }

    /// 按 id 查找 PPS
    pub fn get_pps(&self, pps_id: u32) -> Option<&Arc<Pps>> {
        self.pps.get(pps_id as usize).and_then(|p| p.as_ref())
    }

    /// 按 id 查找 SPS
    pub fn get_sps(&self, sps_id: u32) -> Option<&Arc<Sps>> {
        self.sps.get(sps_id as usize).and_then(|s| s.as_ref())
    }

    /// 清空全部参数集
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
