//! HEVC NAL 单元拆分与 RBSP 提取.
//!
//! NAL 头部为 2 字节:
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ forbidden(1) | type(6) | layer_id(6) | tid(3) │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! RBSP 提取时去除 emulation prevention 字节 (00 00 03 -> 00 00),
//! 并记录每个被移除字节在输出中的位置, 供 entry point 偏移校正使用.

use log::debug;
use tao_core::{TaoError, TaoResult};

/// HEVC NAL 单元类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    /// TRAIL_N (非参考尾随图像)
    TrailN,
    /// TRAIL_R (参考尾随图像)
    TrailR,
    /// TSA_N
    TsaN,
    /// TSA_R
    TsaR,
    /// STSA_N
    StsaN,
    /// STSA_R
    StsaR,
    /// RADL_N
    RadlN,
    /// RADL_R
    RadlR,
    /// RASL_N
    RaslN,
    /// RASL_R
    RaslR,
    /// BLA_W_LP (Broken Link Access)
    BlaWLp,
    /// BLA_W_RADL
    BlaWRadl,
    /// BLA_N_LP
    BlaNLp,
    /// IDR_W_RADL (Instantaneous Decoding Refresh)
    IdrWRadl,
    /// IDR_N_LP
    IdrNLp,
    /// CRA_NUT (Clean Random Access)
    Cra,
    /// VPS (Video Parameter Set)
    Vps,
    /// SPS (Sequence Parameter Set)
    Sps,
    /// PPS (Picture Parameter Set)
    Pps,
    /// AUD (Access Unit Delimiter)
    Aud,
    /// EOS (End of Sequence)
    Eos,
    /// EOB (End of Bitstream)
    Eob,
    /// FD (Filler Data)
    FillerData,
    /// PREFIX_SEI
    PrefixSei,
    /// SUFFIX_SEI
    SuffixSei,
    /// 保留或未定义类型
    Reserved(u8),
}

impl NalUnitType {
    /// 从类型编号创建
    pub fn from_type_id(id: u8) -> Self {
        match id {
            0 => Self::TrailN,
            1 => Self::TrailR,
            2 => Self::TsaN,
            3 => Self::TsaR,
            4 => Self::StsaN,
            5 => Self::StsaR,
            6 => Self::RadlN,
            7 => Self::RadlR,
            8 => Self::RaslN,
            9 => Self::RaslR,
            16 => Self::BlaWLp,
            17 => Self::BlaWRadl,
            18 => Self::BlaNLp,
            19 => Self::IdrWRadl,
            20 => Self::IdrNLp,
            21 => Self::Cra,
            32 => Self::Vps,
            33 => Self::Sps,
            34 => Self::Pps,
            35 => Self::Aud,
            36 => Self::Eos,
            37 => Self::Eob,
            38 => Self::FillerData,
            39 => Self::PrefixSei,
            40 => Self::SuffixSei,
            _ => Self::Reserved(id),
        }
    }

    /// 获取类型编号
    pub fn type_id(&self) -> u8 {
        match self {
            Self::TrailN => 0,
            Self::TrailR => 1,
            Self::TsaN => 2,
            Self::TsaR => 3,
            Self::StsaN => 4,
            Self::StsaR => 5,
            Self::RadlN => 6,
            Self::RadlR => 7,
            Self::RaslN => 8,
            Self::RaslR => 9,
            Self::BlaWLp => 16,
            Self::BlaWRadl => 17,
            Self::BlaNLp => 18,
            Self::IdrWRadl => 19,
            Self::IdrNLp => 20,
            Self::Cra => 21,
            Self::Vps => 32,
            Self::Sps => 33,
            Self::Pps => 34,
            Self::Aud => 35,
            Self::Eos => 36,
            Self::Eob => 37,
            Self::FillerData => 38,
            Self::PrefixSei => 39,
            Self::SuffixSei => 40,
            Self::Reserved(id) => *id,
        }
    }

    /// 是否为已定义的分片类型
    pub fn is_slice(&self) -> bool {
        matches!(self.type_id(), 0..=9 | 16..=21)
    }

    /// 是否为 IRAP (Intra Random Access Point)
    pub fn is_irap(&self) -> bool {
        matches!(self.type_id(), 16..=23)
    }

    /// 是否为 IDR
    pub fn is_idr(&self) -> bool {
        matches!(self, Self::IdrWRadl | Self::IdrNLp)
    }

    /// 是否为 BLA
    pub fn is_bla(&self) -> bool {
        matches!(self, Self::BlaWLp | Self::BlaWRadl | Self::BlaNLp)
    }

    /// 是否为 RADL
    pub fn is_radl(&self) -> bool {
        matches!(self, Self::RadlN | Self::RadlR)
    }

    /// 是否为 RASL
    pub fn is_rasl(&self) -> bool {
        matches!(self, Self::RaslN | Self::RaslR)
    }

    /// 是否为子层非参考图像 (TRAIL_N, TSA_N, STSA_N, RADL_N, RASL_N 以及保留的 N 类型)
    pub fn is_sub_layer_non_reference(&self) -> bool {
        let id = self.type_id();
        id <= 14 && id % 2 == 0
    }
}

/// 一个已提取 RBSP 的 NAL 单元
#[derive(Debug, Clone)]
pub struct NalUnit {
    /// NAL 类型
    pub nal_type: NalUnitType,
    /// nuh_layer_id
    pub layer_id: u8,
    /// TemporalId (nuh_temporal_id_plus1 - 1)
    pub temporal_id: u8,
    /// RBSP 数据 (含 2 字节 NAL 头, 已去除 emulation prevention)
    pub rbsp: Vec<u8>,
    /// 被移除的 0x03 在 RBSP 中的位置 (前一个 0x00 的下标)
    pub skipped_bytes_pos: Vec<usize>,
}

impl NalUnit {
    /// 从原始 NAL 字节 (含头, 含 emulation prevention) 构建
    pub fn parse(raw: &[u8]) -> TaoResult<Self> {
        let (rbsp, skipped_bytes_pos) = extract_rbsp(raw);
        if rbsp.len() < 2 {
            return Err(TaoError::InvalidData("HEVC: NAL 数据太短".into()));
        }
        let (nal_type, layer_id, temporal_id) = parse_nal_header(&rbsp)?;
        Ok(Self {
            nal_type,
            layer_id,
            temporal_id,
            rbsp,
            skipped_bytes_pos,
        })
    }

    /// 去掉 NAL 头后的载荷
    pub fn payload(&self) -> &[u8] {
        &self.rbsp[2..]
    }
}

/// 解析 2 字节 NAL 头
///
/// forbidden_zero_bit 必须为 0, nuh_temporal_id_plus1 不能为 0.
pub fn parse_nal_header(data: &[u8]) -> TaoResult<(NalUnitType, u8, u8)> {
    if data.len() < 2 {
        return Err(TaoError::InvalidData("HEVC: NAL 头不完整".into()));
    }
    if data[0] & 0x80 != 0 {
        return Err(TaoError::InvalidData("HEVC: forbidden_zero_bit 不为 0".into()));
    }
    let nal_type = NalUnitType::from_type_id((data[0] >> 1) & 0x3F);
    let layer_id = ((data[0] & 1) << 5) | (data[1] >> 3);
    let tid_plus1 = data[1] & 0x07;
    if tid_plus1 == 0 {
        return Err(TaoError::InvalidData(
            "HEVC: nuh_temporal_id_plus1 为 0".into(),
        ));
    }
    Ok((nal_type, layer_id, tid_plus1 - 1))
}

/// 提取 RBSP
///
/// - 00 00 03 -> 00 00, 记录输出位置 (第二个 0x00 的下标)
/// - 遇到 00 00 00/01/02 视为下一个起始码, NAL 在此结束
pub fn extract_rbsp(src: &[u8]) -> (Vec<u8>, Vec<usize>) {
    let mut dst = Vec::with_capacity(src.len());
    let mut skipped = Vec::new();
    let mut si = 0usize;
    let len = src.len();

    while si + 2 < len {
        if src[si] == 0 && src[si + 1] == 0 && src[si + 2] <= 3 {
            if src[si + 2] == 3 {
                dst.push(0);
                dst.push(0);
                si += 3;
                skipped.push(dst.len() - 1);
                continue;
            }
            // 下一个起始码
            return (dst, skipped);
        }
        dst.push(src[si]);
        si += 1;
    }
    dst.extend_from_slice(&src[si..]);
    (dst, skipped)
}

// ============================================================
// 访问单元拆分
// ============================================================

/// 从 Annex B 格式拆分原始 NAL 字节 (去掉起始码与尾随零字节)
pub fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0usize;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut nals = Vec::with_capacity(starts.len());
    for (idx, &start) in starts.iter().enumerate() {
        let mut end = starts
            .get(idx + 1)
            .map(|&next| next - 3)
            .unwrap_or(data.len());
        while end > start && data[end - 1] == 0 {
            end -= 1;
        }
        if end > start {
            nals.push(&data[start..end]);
        }
    }
    nals
}

/// 从长度前缀格式拆分原始 NAL 字节
pub fn split_length_prefixed(data: &[u8], length_size: usize) -> TaoResult<Vec<&[u8]>> {
    if !(1..=4).contains(&length_size) {
        return Err(TaoError::InvalidArgument(format!(
            "HEVC: NAL 长度字段大小非法, length_size={}",
            length_size
        )));
    }
    let mut nals = Vec::new();
    let mut pos = 0usize;
    while pos + length_size <= data.len() {
        let len = data[pos..pos + length_size]
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | b as usize);
        pos += length_size;
        if len == 0 || pos + len > data.len() {
            return Err(TaoError::InvalidData(format!(
                "HEVC: NAL 长度非法, len={}, 剩余={}",
                len,
                data.len() - pos
            )));
        }
        nals.push(&data[pos..pos + len]);
        pos += len;
    }
    if pos != data.len() {
        debug!("HEVC: 长度前缀数据末尾有 {} 字节残留", data.len() - pos);
    }
    Ok(nals)
}

/// 把 NAL 序列按访问单元分组
///
/// 已出现分片后, 遇到 AUD/VPS/SPS/PPS/前缀 SEI/保留前缀类型 或
/// first_slice_segment_in_pic_flag 为 1 的分片即开始新的访问单元.
/// 非 0 层的 NAL 不参与判断.
pub fn group_access_units<'d>(nals: &[&'d [u8]]) -> Vec<Vec<&'d [u8]>> {
    let mut units: Vec<Vec<&'d [u8]>> = Vec::new();
    let mut current: Vec<&'d [u8]> = Vec::new();
    let mut seen_slice = false;
    for &raw in nals {
        let starts_new = match parse_nal_header(raw) {
            Ok((nal_type, 0, _)) => {
                let id = nal_type.type_id();
                if nal_type.is_slice() {
                    let first = raw.get(2).is_some_and(|b| b & 0x80 != 0);
                    let boundary = seen_slice && first;
                    seen_slice = true;
                    boundary
                } else {
                    seen_slice && matches!(id, 32..=35 | 39 | 41..=44 | 48..=55)
                }
            }
            _ => false,
        };
        if starts_new {
            units.push(std::mem::take(&mut current));
            seen_slice = parse_nal_header(raw).is_ok_and(|(t, _, _)| t.is_slice());
        }
        current.push(raw);
    }
    if !current.is_empty() {
        units.push(current);
    }
    units
}

// ============================================================
// HEVCDecoderConfigurationRecord
// ============================================================

/// hvcC 配置
#[derive(Debug, Clone, Default)]
pub struct HvccConfig {
    /// NAL 长度字段大小
    pub length_size: usize,
    /// 参数集 NAL (VPS/SPS/PPS/SEI, 原始字节含头)
    pub nal_units: Vec<Vec<u8>>,
}

/// 解析 HEVCDecoderConfigurationRecord
pub fn parse_hvcc_config(data: &[u8]) -> TaoResult<HvccConfig> {
    if data.len() < 23 {
        return Err(TaoError::InvalidData("HEVC: hvcC 数据太短".into()));
    }
    // byte 21: constantFrameRate(2) | numTemporalLayers(3) | temporalIdNested(1) | lengthSizeMinusOne(2)
    let length_size = usize::from(data[21] & 0x03) + 1;
    let num_arrays = data[22];

    let mut nal_units = Vec::new();
    let mut pos = 23usize;
    for _ in 0..num_arrays {
        if pos + 3 > data.len() {
            return Err(TaoError::InvalidData("HEVC: hvcC 数组头截断".into()));
        }
        let num_nalus = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
        pos += 3;
        for _ in 0..num_nalus {
            if pos + 2 > data.len() {
                return Err(TaoError::InvalidData("HEVC: hvcC NAL 长度截断".into()));
            }
            let nal_len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
            pos += 2;
            if pos + nal_len > data.len() {
                return Err(TaoError::InvalidData("HEVC: hvcC NAL 数据截断".into()));
            }
            nal_units.push(data[pos..pos + nal_len].to_vec());
            pos += nal_len;
        }
    }

    Ok(HvccConfig {
        length_size,
        nal_units,
    })
}
