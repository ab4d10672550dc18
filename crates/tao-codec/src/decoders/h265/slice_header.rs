//! HEVC 分片头解析.
//!
//! 解析顺序遵循 slice_segment_header() 语法. 非独立分片段 (dependent slice segment)
//! 继承前一个独立分片段的全部字段, 只重新读取段地址与入口点.
//!
//! 解析过程会修改跨 NAL 的解码状态 (POC, 序列计数, 当前激活的参数集),
//! 这些状态集中在 [`SliceParseState`] 中, 由解码器持有.

use std::sync::Arc;

use log::{debug, warn};
use tao_core::bitreader::BitReader;
use tao_core::{TaoError, TaoResult};

use super::nal::{NalUnit, NalUnitType};
use super::params::{MAX_REFS, ParameterSetCache, Pps, ShortTermRps, Sps, parse_short_term_rps};
use super::refs::compute_poc;

/// 分片类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SliceType {
    #[default]
    B,
    P,
    I,
}

impl SliceType {
    fn from_ue(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::B),
            1 => Some(Self::P),
            2 => Some(Self::I),
            _ => None,
        }
    }

    /// 参考列表数量
    pub fn list_count(&self) -> usize {
        match self {
            Self::B => 2,
            Self::P => 1,
            Self::I => 0,
        }
    }
}

/// 分片头中的长期参考图像集
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LongTermRps {
    pub poc: Vec<i32>,
    pub used: Vec<bool>,
    /// 为 true 时 poc 为完整 POC, 否则只比较低位
    pub poc_msb_present: Vec<bool>,
}

/// 加权预测表
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u32,
    pub chroma_log2_weight_denom: u32,
    /// [list][ref_idx]
    pub luma_weight: [[i32; MAX_REFS]; 2],
    /// [list][ref_idx], 未按位深缩放
    pub luma_offset: [[i32; MAX_REFS]; 2],
    /// [list][ref_idx][cb/cr]
    pub chroma_weight: [[[i32; 2]; MAX_REFS]; 2],
    /// [list][ref_idx][cb/cr], 未按位深缩放
    pub chroma_offset: [[[i32; 2]; MAX_REFS]; 2],
}

impl Default for PredWeightTable {
    fn default() -> Self {
        Self {
            luma_log2_weight_denom: 0,
            chroma_log2_weight_denom: 0,
            luma_weight: [[1; MAX_REFS]; 2],
            luma_offset: [[0; MAX_REFS]; 2],
            chroma_weight: [[[1; 2]; MAX_REFS]; 2],
            chroma_offset: [[[0; 2]; MAX_REFS]; 2],
        }
    }
}

/// 分片段头
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SliceHeader {
    pub first_slice_in_pic: bool,
    pub no_output_of_prior_pics: bool,
    pub pps_id: u32,
    pub dependent_slice_segment: bool,
    pub slice_segment_addr: u32,
    pub slice_addr: u32,
    pub slice_type: SliceType,
    pub pic_output_flag: bool,
    pub colour_plane_id: u8,
    pub pic_order_cnt_lsb: u32,
    /// 当前分片使用的短期 RPS (IDR 为 None)
    pub short_term_rps: Option<ShortTermRps>,
    /// 引用 SPS 中的短期 RPS 时的下标
    pub short_term_rps_idx: Option<usize>,
    /// 分片头内联短期 RPS 占用的比特数
    pub short_term_ref_pic_set_size: usize,
    pub long_term_rps: LongTermRps,
    /// 长期 RPS 占用的比特数
    pub long_term_ref_pic_set_size: usize,
    pub slice_temporal_mvp_enabled: bool,
    /// slice_sao_luma_flag / slice_sao_chroma_flag (按分量)
    pub sao_enabled: [bool; 3],
    pub nb_refs: [usize; 2],
    pub rpl_modification_flag: [bool; 2],
    pub list_entry_lx: [[u8; 32]; 2],
    pub mvd_l1_zero: bool,
    pub cabac_init_flag: bool,
    pub collocated_list: usize,
    pub collocated_ref_idx: usize,
    pub pwt: PredWeightTable,
    pub max_num_merge_cand: u32,
    pub slice_qp_delta: i32,
    pub slice_cb_qp_offset: i32,
    pub slice_cr_qp_offset: i32,
    pub cu_chroma_qp_offset_enabled: bool,
    pub disable_deblocking_filter: bool,
    /// 已乘 2
    pub beta_offset: i32,
    /// 已乘 2
    pub tc_offset: i32,
    pub loop_filter_across_slices_enabled: bool,
    /// 入口点偏移 (offset_minus1 + 1, 以转义字节计)
    pub entry_point_offset: Vec<u32>,
    /// 分片数据在 RBSP (含 NAL 头) 中的起始字节
    pub data_offset: usize,
    pub slice_qp: i32,
    pub slice_ctb_addr_rs: u32,
}

impl SliceHeader {
    /// 是否为帧内分片
    pub fn is_intra(&self) -> bool {
        self.slice_type == SliceType::I
    }

    /// 当前分片是否启用加权预测
    pub fn uses_weighted_prediction(&self, pps: &Pps) -> bool {
        (self.slice_type == SliceType::P && pps.weighted_pred)
            || (self.slice_type == SliceType::B && pps.weighted_bipred)
    }
}

/// 跨 NAL 的分片头解析状态
#[derive(Debug, Clone)]
pub struct SliceParseState {
    pub active_sps: Option<Arc<Sps>>,
    pub active_pps: Option<Arc<Pps>>,
    /// 解码序列号 (IDR/BLA/SPS 切换时递增, 回绕)
    pub seq_decode: u8,
    /// 随机接入点 POC; i32::MAX 表示刚开始随机接入, i32::MIN 表示无需跳过
    pub max_ra: i32,
    pub last_eos: bool,
    pub poc_tid0: i32,
    pub poc: i32,
    pub slice_idx: u32,
    pub slice_initialized: bool,
    pub strict: bool,
    /// 本次解析要求清空参考帧
    pub clear_refs: bool,
    /// 本次解析切换了 SPS
    pub sps_changed: bool,
}

impl Default for SliceParseState {
    fn default() -> Self {
        Self {
            active_sps: None,
            active_pps: None,
            seq_decode: 0,
            max_ra: i32::MAX,
            last_eos: false,
            poc_tid0: 0,
            poc: 0,
            slice_idx: 0,
            slice_initialized: false,
            strict: false,
            clear_refs: false,
            sps_changed: false,
        }
    }
}

/// 向上取整的 log2 (0 和 1 都返回 0)
pub(crate) fn ceil_log2(v: u32) -> u32 {
    if v <= 1 { 0 } else { 32 - (v - 1).leading_zeros() }
}

/// 解析分片段头
///
/// `prev` 为同一图像中前一个分片段的头, 非独立分片段从中继承字段.
pub fn parse_slice_header(
    nal: &NalUnit,
    params: &ParameterSetCache,
    prev: Option<&SliceHeader>,
    state: &mut SliceParseState,
) -> TaoResult<SliceHeader> {
    let payload = nal.payload();
    let mut br = BitReader::new(payload);
    let nal_type = nal.nal_type;
    state.clear_refs = false;
    state.sps_changed = false;

    let first_slice_in_pic = br.read_flag()?;
    if (nal_type.is_idr() || nal_type.is_bla()) && first_slice_in_pic {
        state.seq_decode = state.seq_decode.wrapping_add(1);
        state.max_ra = i32::MAX;
        if nal_type.is_idr() {
            state.clear_refs = true;
        }
    }
    let mut no_output_of_prior_pics = false;
    if nal_type.is_irap() {
        no_output_of_prior_pics = br.read_flag()?;
    }
    if nal_type == NalUnitType::Cra && state.last_eos {
        no_output_of_prior_pics = true;
    }

    let pps_id = br.read_ue()?;
    let pps = params
        .get_pps(pps_id)
        .ok_or_else(|| TaoError::InvalidData(format!("HEVC: PPS id 超出范围或不存在, id={}", pps_id)))?
        .clone();
    if !first_slice_in_pic
        && state
            .active_pps
            .as_ref()
            .is_some_and(|active| !Arc::ptr_eq(active, &pps))
    {
        return Err(TaoError::InvalidData(format!(
            "HEVC: 同一图像的分片之间 PPS 发生变化, pps_id={}",
            pps_id
        )));
    }
    let sps = params
        .get_sps(pps.sps_id)
        .ok_or_else(|| TaoError::InvalidData(format!("HEVC: SPS 不存在, id={}", pps.sps_id)))?
        .clone();
    state.active_pps = Some(pps.clone());

    let sps_switch = state.active_sps.as_ref().is_none_or(|active| !Arc::ptr_eq(active, &sps));
    if sps_switch {
        if let Some(last) = &state.active_sps
            && nal_type.is_irap()
            && nal_type != NalUnitType::Cra
        {
            if sps.width != last.width
                    || sps.height != last.height
                    || sps.highest_sub_layer().max_dec_pic_buffering
                        != last.highest_sub_layer().max_dec_pic_buffering
            {
                no_output_of_prior_pics = false;
            }
        }
        state.clear_refs = true;
        state.sps_changed = true;
        state.active_sps = Some(sps.clone());
        state.seq_decode = state.seq_decode.wrapping_add(1);
        state.max_ra = i32::MAX;
        debug!(
            "HEVC: 激活 SPS id={} ({}x{})",
            sps.sps_id, sps.width, sps.height
        );
    }

    let mut dependent_slice_segment = false;
    let slice_segment_addr;
    let mut slice_addr = prev.map_or(0, |p| p.slice_addr);
    if !first_slice_in_pic {
        if pps.dependent_slice_segments_enabled {
            dependent_slice_segment = br.read_flag()?;
        }
        let len = ceil_log2(sps.ctb_count());
        slice_segment_addr = br.read_bits(len)?;
        if slice_segment_addr >= sps.ctb_count() {
            return Err(TaoError::InvalidData(format!(
                "HEVC: slice_segment_address 非法, value={}, ctb_count={}",
                slice_segment_addr,
                sps.ctb_count()
            )));
        }
        if !dependent_slice_segment {
            slice_addr = slice_segment_addr;
            state.slice_idx += 1;
        }
    } else {
        slice_segment_addr = 0;
        slice_addr = 0;
        state.slice_idx = 0;
        state.slice_initialized = false;
    }

    let mut sh = if dependent_slice_segment {
        if !state.slice_initialized {
            return Err(TaoError::InvalidData("HEVC: 缺少独立分片段".into()));
        }
        match prev {
            Some(p) => p.clone(),
            None => return Err(TaoError::InvalidData("HEVC: 缺少独立分片段".into())),
        }
    } else {
        SliceHeader::default()
    };
    sh.first_slice_in_pic = first_slice_in_pic;
    sh.no_output_of_prior_pics = no_output_of_prior_pics;
    sh.pps_id = pps_id;
    sh.dependent_slice_segment = dependent_slice_segment;
    sh.slice_segment_addr = slice_segment_addr;
    sh.slice_addr = slice_addr;

    if !dependent_slice_segment {
        state.slice_initialized = false;
        parse_independent_fields(&mut br, nal, &sps, &pps, &mut sh, state)?;
    }

    parse_entry_points(&mut br, &sps, &pps, &mut sh)?;

    if pps.slice_header_extension_present {
        let length = br.read_ue()? as usize;
        let bits = length
            .checked_mul(8)
            .filter(|&bits| bits <= br.bits_left())
            .ok_or_else(|| {
                TaoError::InvalidData(format!(
                    "HEVC: 分片头扩展长度越界, length={}, 剩余 {} 位",
                    length,
                    br.bits_left()
                ))
            })?;
        br.seek_bits(br.bits_read() + bits)?;
        warn!("HEVC: 忽略分片头扩展数据 ({} 字节)", length);
    }

    // byte_alignment()
    if !br.read_flag()? {
        warn!("HEVC: 分片头对齐位不为 1");
    }
    br.align_to_byte();
    sh.data_offset = br.byte_position() + 2;

    sh.slice_qp = 26 + pps.init_qp_minus26 + sh.slice_qp_delta;
    if sh.slice_qp > 51 || sh.slice_qp < -sps.qp_bd_offset {
        return Err(TaoError::InvalidData(format!(
            "HEVC: slice_qp {} 超出范围 [{}, 51]",
            sh.slice_qp, -sps.qp_bd_offset
        )));
    }

    sh.slice_ctb_addr_rs = sh.slice_segment_addr;
    if sh.slice_ctb_addr_rs == 0 && sh.dependent_slice_segment {
        return Err(TaoError::InvalidData("HEVC: 非独立分片段地址不能为 0".into()));
    }

    state.slice_initialized = true;
    Ok(sh)
}

fn parse_independent_fields(
    br: &mut BitReader,
    nal: &NalUnit,
    sps: &Sps,
    pps: &Pps,
    sh: &mut SliceHeader,
    state: &mut SliceParseState,
) -> TaoResult<()> {
    let nal_type = nal.nal_type;

    for _ in 0..pps.num_extra_slice_header_bits {
        br.skip_bits(1)?; // slice_reserved_flag
    }

    let raw_type = br.read_ue()?;
    sh.slice_type = SliceType::from_ue(raw_type)
        .ok_or_else(|| TaoError::InvalidData(format!("HEVC: 未知的分片类型 {}", raw_type)))?;
    if nal_type.is_irap() && sh.slice_type != SliceType::I {
        return Err(TaoError::InvalidData("HEVC: IRAP 图像中出现帧间分片".into()));
    }

    sh.pic_output_flag = true;
    if pps.output_flag_present {
        sh.pic_output_flag = br.read_flag()?;
    }
    if sps.separate_colour_plane {
        sh.colour_plane_id = br.read_bits(2)? as u8;
    }

    if !nal_type.is_idr() {
        sh.pic_order_cnt_lsb = br.read_bits(sps.log2_max_poc_lsb)?;
        let mut poc = compute_poc(state.poc_tid0, sps.log2_max_poc_lsb, sh.pic_order_cnt_lsb, nal_type);
        if !sh.first_slice_in_pic && poc != state.poc {
            if state.strict {
                return Err(TaoError::InvalidData(format!(
                    "HEVC: 分片之间 POC 不一致 {} -> {}",
                    state.poc, poc
                )));
            }
            warn!("HEVC: 忽略分片之间的 POC 变化 {} -> {}", state.poc, poc);
            poc = state.poc;
        }
        state.poc = poc;

        let short_term_ref_pic_set_sps_flag = br.read_flag()?;
        if !short_term_ref_pic_set_sps_flag {
            let start = br.bits_read();
            let rps = parse_short_term_rps(br, &sps.st_rps, true)?;
            sh.short_term_ref_pic_set_size = br.bits_read() - start;
            sh.short_term_rps = Some(rps);
            sh.short_term_rps_idx = None;
        } else {
            if sps.st_rps.is_empty() {
                return Err(TaoError::InvalidData("HEVC: SPS 中没有短期参考图像集".into()));
            }
            let numbits = ceil_log2(sps.st_rps.len() as u32);
            let idx = if numbits > 0 { br.read_bits(numbits)? as usize } else { 0 };
            let rps = sps.st_rps.get(idx).ok_or_else(|| {
                TaoError::InvalidData(format!("HEVC: short_term_ref_pic_set_idx 越界, idx={}", idx))
            })?;
            sh.short_term_rps = Some(*rps);
            sh.short_term_rps_idx = Some(idx);
            sh.short_term_ref_pic_set_size = 0;
        }

        let start = br.bits_read();
        match decode_lt_rps(br, sps, state.poc, sh.pic_order_cnt_lsb) {
            Ok(lt) => sh.long_term_rps = lt,
            Err(err) => {
                if state.strict {
                    return Err(err);
                }
                warn!("HEVC: 无效的长期参考图像集: {}", err);
                sh.long_term_rps = LongTermRps::default();
            }
        }
        sh.long_term_ref_pic_set_size = br.bits_read() - start;

        sh.slice_temporal_mvp_enabled = sps.temporal_mvp_enabled && br.read_flag()?;
    } else {
        sh.short_term_rps = None;
        sh.short_term_rps_idx = None;
        state.poc = 0;
    }

    if nal.temporal_id == 0 && !nal_type.is_sub_layer_non_reference() && !nal_type.is_radl() && !nal_type.is_rasl() {
        state.poc_tid0 = state.poc;
    }

    if sps.sao_enabled {
        sh.sao_enabled[0] = br.read_flag()?;
        let chroma = sps.chroma_array_type() != 0 && br.read_flag()?;
        sh.sao_enabled[1] = chroma;
        sh.sao_enabled[2] = chroma;
    } else {
        sh.sao_enabled = [false; 3];
    }

    sh.nb_refs = [0, 0];
    if sh.slice_type != SliceType::I {
        sh.nb_refs[0] = pps.num_ref_idx_l0_default_active as usize;
        if sh.slice_type == SliceType::B {
            sh.nb_refs[1] = pps.num_ref_idx_l1_default_active as usize;
        }
        if br.read_flag()? {
            sh.nb_refs[0] = br.read_ue()? as usize + 1;
            if sh.slice_type == SliceType::B {
                sh.nb_refs[1] = br.read_ue()? as usize + 1;
            }
        }
        if sh.nb_refs[0] > MAX_REFS || sh.nb_refs[1] > MAX_REFS {
            return Err(TaoError::InvalidData(format!(
                "HEVC: 参考帧数量过多 {}/{}",
                sh.nb_refs[0], sh.nb_refs[1]
            )));
        }

        sh.rpl_modification_flag = [false, false];
        let nb_refs = frame_nb_refs(sh);
        if nb_refs == 0 {
            return Err(TaoError::InvalidData("HEVC: P/B 分片没有可用参考帧".into()));
        }
        if pps.lists_modification_present && nb_refs > 1 {
            let bits = ceil_log2(nb_refs as u32);
            for list in 0..sh.slice_type.list_count() {
                sh.rpl_modification_flag[list] = br.read_flag()?;
                if sh.rpl_modification_flag[list] {
                    for i in 0..sh.nb_refs[list] {
                        sh.list_entry_lx[list][i] = br.read_bits(bits)? as u8;
                    }
                }
            }
        }

        if sh.slice_type == SliceType::B {
            sh.mvd_l1_zero = br.read_flag()?;
        }
        sh.cabac_init_flag = pps.cabac_init_present && br.read_flag()?;

        sh.collocated_ref_idx = 0;
        sh.collocated_list = 0;
        if sh.slice_temporal_mvp_enabled {
            if sh.slice_type == SliceType::B {
                sh.collocated_list = usize::from(!br.read_flag()?);
            }
            if sh.nb_refs[sh.collocated_list] > 1 {
                sh.collocated_ref_idx = br.read_ue()? as usize;
                if sh.collocated_ref_idx >= sh.nb_refs[sh.collocated_list] {
                    return Err(TaoError::InvalidData(format!(
                        "HEVC: collocated_ref_idx 非法, value={}",
                        sh.collocated_ref_idx
                    )));
                }
            }
        }

        if sh.uses_weighted_prediction(pps) {
            sh.pwt = parse_pred_weight_table(br, sps, sh.slice_type, &sh.nb_refs)?;
        } else {
            sh.pwt = PredWeightTable::default();
        }

        let five_minus = br.read_ue()?;
        if five_minus > 4 {
            return Err(TaoError::InvalidData(format!(
                "HEVC: 合并候选数量非法, five_minus_max_num_merge_cand={}",
                five_minus
            )));
        }
        sh.max_num_merge_cand = 5 - five_minus;
    }

    sh.slice_qp_delta = br.read_se()?;
    if pps.slice_chroma_qp_offsets_present {
        sh.slice_cb_qp_offset = br.read_se()?;
        sh.slice_cr_qp_offset = br.read_se()?;
        if !(-12..=12).contains(&sh.slice_cb_qp_offset)
            || !(-12..=12).contains(&sh.slice_cr_qp_offset)
            || !(-12..=12).contains(&(pps.cb_qp_offset + sh.slice_cb_qp_offset))
            || !(-12..=12).contains(&(pps.cr_qp_offset + sh.slice_cr_qp_offset))
        {
            return Err(TaoError::InvalidData(format!(
                "HEVC: 分片色度 QP 偏移超出范围, cb={}, cr={}",
                sh.slice_cb_qp_offset, sh.slice_cr_qp_offset
            )));
        }
    } else {
        sh.slice_cb_qp_offset = 0;
        sh.slice_cr_qp_offset = 0;
    }

    sh.cu_chroma_qp_offset_enabled = pps.chroma_qp_offset_list_enabled && br.read_flag()?;

    if pps.deblocking_filter_control_present {
        let override_flag = pps.deblocking_filter_override_enabled && br.read_flag()?;
        if override_flag {
            sh.disable_deblocking_filter = br.read_flag()?;
            if !sh.disable_deblocking_filter {
                let beta = br.read_se()?;
                let tc = br.read_se()?;
                if !(-6..=6).contains(&beta) || !(-6..=6).contains(&tc) {
                    return Err(TaoError::InvalidData(format!(
                        "HEVC: 分片去块偏移超出范围, beta={}, tc={}",
                        beta, tc
                    )));
                }
                sh.beta_offset = beta * 2;
                sh.tc_offset = tc * 2;
            }
        } else {
            sh.disable_deblocking_filter = pps.disable_dbf;
            sh.beta_offset = pps.beta_offset;
            sh.tc_offset = pps.tc_offset;
        }
    } else {
        sh.disable_deblocking_filter = false;
        sh.beta_offset = 0;
        sh.tc_offset = 0;
    }

    sh.loop_filter_across_slices_enabled = if pps.loop_filter_across_slices_enabled
        && (sh.sao_enabled[0] || sh.sao_enabled[1] || !sh.disable_deblocking_filter)
    {
        br.read_flag()?
    } else {
        pps.loop_filter_across_slices_enabled
    };
    Ok(())
}

/// 当前图像可用的参考帧数量 (短期与长期中被当前图像使用的部分)
pub fn frame_nb_refs(sh: &SliceHeader) -> usize {
    let mut count = 0;
    if let Some(rps) = &sh.short_term_rps {
        count += rps.used[..rps.num_delta_pocs].iter().filter(|&&u| u).count();
    }
    count += sh.long_term_rps.used.iter().filter(|&&u| u).count();
    count
}

fn parse_entry_points(br: &mut BitReader, sps: &Sps, pps: &Pps, sh: &mut SliceHeader) -> TaoResult<()> {
    sh.entry_point_offset.clear();
    if !pps.tiles_enabled && !pps.entropy_coding_sync_enabled {
        return Ok(());
    }
    let count = br.read_ue()?;
    let limit = if pps.tiles_enabled && pps.entropy_coding_sync_enabled {
        sps.ctb_count()
    } else if pps.entropy_coding_sync_enabled {
        sps.ctb_height
    } else {
        sps.ctb_count()
    };
    if count > limit {
        return Err(TaoError::InvalidData(format!(
            "HEVC: 入口点数量 {} 超过上限 {}",
            count, limit
        )));
    }
    if count == 0 {
        return Ok(());
    }
    let offset_len = br.read_ue()? + 1;
    if offset_len > 32 {
        return Err(TaoError::InvalidData(format!(
            "HEVC: offset_len_minus1 超出范围, offset_len={}",
            offset_len
        )));
    }
    let segments = offset_len >> 4;
    let rest = offset_len & 15;
    sh.entry_point_offset.try_reserve_exact(count as usize)?;
    for _ in 0..count {
        let mut val: u64 = 0;
        for _ in 0..segments {
            val = (val << 16) + u64::from(br.read_bits(16)?);
        }
        if rest != 0 {
            val = (val << rest) + u64::from(br.read_bits(rest)?);
        }
        let val = u32::try_from(val + 1)
            .map_err(|_| TaoError::InvalidData("HEVC: 入口点偏移溢出".into()))?;
        sh.entry_point_offset.push(val);
    }
    Ok(())
}

fn parse_pred_weight_table(
    br: &mut BitReader,
    sps: &Sps,
    slice_type: SliceType,
    nb_refs: &[usize; 2],
) -> TaoResult<PredWeightTable> {
    let mut pwt = PredWeightTable {
        luma_log2_weight_denom: br.read_ue()?,
        ..PredWeightTable::default()
    };
    if pwt.luma_log2_weight_denom > 7 {
        return Err(TaoError::InvalidData(format!(
            "HEVC: luma_log2_weight_denom 超出范围, value={}",
            pwt.luma_log2_weight_denom
        )));
    }
    let has_chroma = sps.chroma_array_type() != 0;
    if has_chroma {
        let delta = br.read_se()?;
        pwt.chroma_log2_weight_denom = (pwt.luma_log2_weight_denom as i32 + delta).clamp(0, 7) as u32;
    }
    let luma_default = 1 << pwt.luma_log2_weight_denom;
    let chroma_default = 1 << pwt.chroma_log2_weight_denom;
    let half_range_c = if sps.high_precision_offsets_enabled {
        1 << (sps.bit_depth_chroma - 1)
    } else {
        128
    };
    let offset_range = if sps.high_precision_offsets_enabled {
        1 << (sps.bit_depth - 1)
    } else {
        128
    };

    for list in 0..slice_type.list_count() {
        let n = nb_refs[list];
        let mut luma_flags = [false; MAX_REFS];
        let mut chroma_flags = [false; MAX_REFS];
        for (i, flag) in luma_flags.iter_mut().enumerate().take(n) {
            *flag = br.read_flag()?;
            if !*flag {
                pwt.luma_weight[list][i] = luma_default;
                pwt.luma_offset[list][i] = 0;
            }
        }
        if has_chroma {
            for flag in chroma_flags.iter_mut().take(n) {
                *flag = br.read_flag()?;
            }
        }
        for i in 0..n {
            if luma_flags[i] {
                let delta = br.read_se()?;
                let offset = br.read_se()?;
                if !(-128..=127).contains(&delta) || !(-offset_range..offset_range).contains(&offset) {
                    return Err(TaoError::InvalidData(format!(
                        "HEVC: 亮度加权参数超出范围, delta_weight={}, offset={}",
                        delta, offset
                    )));
                }
                pwt.luma_weight[list][i] = luma_default + delta;
                pwt.luma_offset[list][i] = offset;
            }
            if chroma_flags[i] {
                for c in 0..2 {
                    let delta_weight = br.read_se()?;
                    let delta_offset = br.read_se()?;
                    if !(-128..=127).contains(&delta_weight) {
                        return Err(TaoError::InvalidData(format!(
                            "HEVC: 色度加权参数超出范围, delta_weight={}",
                            delta_weight
                        )));
                    }
                    let weight = chroma_default + delta_weight;
                    pwt.chroma_weight[list][i][c] = weight;
                    pwt.chroma_offset[list][i][c] = (delta_offset
                        - ((half_range_c * weight) >> pwt.chroma_log2_weight_denom)
                        + half_range_c)
                        .clamp(-half_range_c, half_range_c - 1);
                }
            } else {
                pwt.chroma_weight[list][i] = [chroma_default; 2];
                pwt.chroma_offset[list][i] = [0; 2];
            }
        }
    }
    Ok(pwt)
}

/// 长期参考图像的来源
enum LongTermRpsSource {
    /// SPS 候选列表下标
    Sps(usize),
    SliceHeader,
}

/// 解析分片头中的长期参考图像集
fn decode_lt_rps(br: &mut BitReader, sps: &Sps, cur_poc: i32, slice_poc_lsb: u32) -> TaoResult<LongTermRps> {
    let mut rps = LongTermRps::default();
    if !sps.long_term_ref_pics_present {
        return Ok(rps);
    }
    let max_poc_lsb = 1i64 << sps.log2_max_poc_lsb;
    let max_msb_cycle = 1i64 << (32 - sps.log2_max_poc_lsb);
    let num_lt_sps = sps.lt_ref_pic_poc_lsb_sps.len();

    let nb_sps = if num_lt_sps > 0 { br.read_ue()? as usize } else { 0 };
    let nb_sh = br.read_ue()? as usize;
    if nb_sps > num_lt_sps || nb_sps + nb_sh > 32 {
        return Err(TaoError::InvalidData(format!(
            "HEVC: 长期参考图像数量非法, nb_sps={}, nb_sh={}",
            nb_sps, nb_sh
        )));
    }

    let mut prev_delta_msb = 0i64;
    for i in 0..nb_sps + nb_sh {
        let source = if i < nb_sps {
            let idx = if num_lt_sps > 1 {
                br.read_bits(ceil_log2(num_lt_sps as u32))? as usize
            } else {
                0
            };
            LongTermRpsSource::Sps(idx)
        } else {
            LongTermRpsSource::SliceHeader
        };
        let (mut poc, used) = match source {
            LongTermRpsSource::Sps(idx) => {
                let poc = *sps.lt_ref_pic_poc_lsb_sps.get(idx).ok_or_else(|| {
                    TaoError::InvalidData(format!("HEVC: lt_idx_sps 越界, idx={}", idx))
                })?;
                (poc as i32, sps.used_by_curr_pic_lt_sps[idx])
            }
            LongTermRpsSource::SliceHeader => {
                let poc = br.read_bits(sps.log2_max_poc_lsb)? as i32;
                (poc, br.read_flag()?)
            }
        };

        let msb_present = br.read_flag()?;
        if msb_present {
            let cycle = i64::from(br.read_ue()?);
            if cycle >= max_msb_cycle {
                return Err(TaoError::InvalidData(format!(
                    "HEVC: delta_poc_msb_cycle_lt 越界, value={}, 上限 {}",
                    cycle, max_msb_cycle
                )));
            }
            let mut delta = cycle;
            if i != 0 && i != nb_sps {
                delta += prev_delta_msb;
            }
            let lt_poc = i64::from(poc) + i64::from(cur_poc) - delta * max_poc_lsb - i64::from(slice_poc_lsb);
            poc = i32::try_from(lt_poc)
                .map_err(|_| TaoError::InvalidData(format!("HEVC: 长期参考图像 POC 溢出: {}", lt_poc)))?;
            prev_delta_msb = delta;
        }
        rps.poc.push(poc);
        rps.used.push(used);
        rps.poc_msb_present.push(msb_present);
    }
    Ok(rps)
}
