//! 分片数据语法元素读取接口.
//!
//! 核心解码流程只依赖 [`SyntaxReader`]: 每个语法元素一个方法, 上下文选择所需的
//! ctxInc 由核心计算后传入. 熵解码后端 (CABAC 等) 实现该 trait 即可接入.
//!
//! [`RawSyntaxReader`] 是参考后端: 标志位占 1 个原始比特, 多值元素使用 Exp-Golomb,
//! 残差以 (位置, 电平) 列表表示. 合成码流与单元测试都基于它构造.

use tao_core::bitreader::BitReader;
use tao_core::{TaoError, TaoResult};

use super::slice_header::SliceType;

/// 熵解码上下文初始化参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextInit {
    pub slice_type: SliceType,
    pub cabac_init_flag: bool,
    pub slice_qp: i32,
}

impl ContextInit {
    /// initType (0: I, 1/2: P/B, cabac_init_flag 交换)
    pub fn init_type(&self) -> u8 {
        match (self.slice_type, self.cabac_init_flag) {
            (SliceType::I, _) => 0,
            (SliceType::P, false) | (SliceType::B, true) => 1,
            (SliceType::P, true) | (SliceType::B, false) => 2,
        }
    }
}

/// 系数扫描顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanOrder {
    #[default]
    Diagonal,
    Horizontal,
    Vertical,
}

/// 残差块解析参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResidualParams {
    pub x0: usize,
    pub y0: usize,
    pub log2_trafo_size: u32,
    pub c_idx: usize,
    pub scan: ScanOrder,
    /// 是否可能出现 transform_skip_flag
    pub transform_skip_allowed: bool,
    /// 帧间块且启用显式 RDPCM (还需 transform skip 或 bypass)
    pub explicit_rdpcm_allowed: bool,
    pub sign_data_hiding: bool,
    pub cu_transquant_bypass: bool,
    pub intra: bool,
}

/// 显式 RDPCM 方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdpcmDir {
    Horizontal,
    Vertical,
}

/// 一个变换块的系数电平
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidualBlock {
    /// 光栅顺序 coeffs[y * size + x]
    pub coeffs: Vec<i32>,
    pub transform_skip: bool,
    pub explicit_rdpcm: Option<RdpcmDir>,
}

/// 分片数据语法元素读取
///
/// 所有方法在码流耗尽或数值非法时返回 `InvalidData`.
/// 返回原始编码值的方法 (如 `part_mode`) 由调用方检查取值范围.
pub trait SyntaxReader: Send {
    /// 以子码流 (entry point 之间的字节) 重新初始化
    fn start(&mut self, data: &[u8]) -> TaoResult<()>;

    /// 按分片参数重置全部上下文
    fn reset_contexts(&mut self, init: &ContextInit);
    /// 保存上下文 (WPP 第 2 个 CTB 之后)
    fn save_contexts(&mut self);
    /// 载入已保存的上下文 (WPP 行首)
    fn load_contexts(&mut self);

    /// 已消耗的字节数
    fn position_bytes(&self) -> usize;

    fn end_of_slice_segment_flag(&mut self) -> TaoResult<bool>;
    fn end_of_subset_one_bit(&mut self) -> TaoResult<bool>;

    // SAO
    fn sao_merge_flag(&mut self) -> TaoResult<bool>;
    /// 0: 不启用, 1: 带偏移, 2: 边缘偏移
    fn sao_type_idx(&mut self) -> TaoResult<u8>;
    fn sao_offset_abs(&mut self, max: u32) -> TaoResult<u32>;
    fn sao_offset_sign(&mut self) -> TaoResult<bool>;
    fn sao_band_position(&mut self) -> TaoResult<u8>;
    fn sao_eo_class(&mut self) -> TaoResult<u8>;

    // 编码单元
    fn split_coding_unit_flag(&mut self, ctx_inc: u8) -> TaoResult<bool>;
    fn cu_transquant_bypass_flag(&mut self) -> TaoResult<bool>;
    fn cu_skip_flag(&mut self, ctx_inc: u8) -> TaoResult<bool>;
    /// true 表示帧内
    fn pred_mode_flag(&mut self) -> TaoResult<bool>;
    /// 原始 part_mode 码值
    fn part_mode(&mut self, log2_cb_size: u32, amp_enabled: bool) -> TaoResult<u8>;
    fn pcm_flag(&mut self) -> TaoResult<bool>;
    /// 读取 `len` 字节 PCM 样本, 之后熵解码器从下一字节重新开始
    fn pcm_samples(&mut self, len: usize) -> TaoResult<Vec<u8>>;

    // 帧内模式
    fn prev_intra_luma_pred_flag(&mut self) -> TaoResult<bool>;
    fn mpm_idx(&mut self) -> TaoResult<u8>;
    fn rem_intra_luma_pred_mode(&mut self) -> TaoResult<u8>;
    fn intra_chroma_pred_mode(&mut self) -> TaoResult<u8>;

    // 帧间预测
    fn merge_flag(&mut self) -> TaoResult<bool>;
    fn merge_idx(&mut self, max_num_merge_cand: u32) -> TaoResult<u32>;
    /// 0: PRED_L0, 1: PRED_L1, 2: PRED_BI
    fn inter_pred_idc(&mut self, n_pb_w_plus_h: usize, ct_depth: u8) -> TaoResult<u8>;
    fn ref_idx(&mut self, num_ref_idx_active: usize) -> TaoResult<u32>;
    fn mvd(&mut self) -> TaoResult<(i32, i32)>;
    fn mvp_flag(&mut self) -> TaoResult<bool>;

    // 变换树
    fn rqt_root_cbf(&mut self) -> TaoResult<bool>;
    fn split_transform_flag(&mut self, log2_trafo_size: u32) -> TaoResult<bool>;
    fn cbf_cb_cr(&mut self, trafo_depth: u32) -> TaoResult<bool>;
    fn cbf_luma(&mut self, trafo_depth: u32) -> TaoResult<bool>;

    // 量化
    fn cu_qp_delta_abs(&mut self) -> TaoResult<u32>;
    fn cu_qp_delta_sign_flag(&mut self) -> TaoResult<bool>;
    fn cu_chroma_qp_offset_flag(&mut self) -> TaoResult<bool>;
    fn cu_chroma_qp_offset_idx(&mut self, list_len: usize) -> TaoResult<u32>;

    // 跨分量预测
    fn log2_res_scale_abs_plus1(&mut self, c: usize) -> TaoResult<u8>;
    fn res_scale_sign_flag(&mut self, c: usize) -> TaoResult<bool>;

    /// residual_coding()
    fn residual_coding(&mut self, params: &ResidualParams) -> TaoResult<ResidualBlock>;
}

// ============================================================
// 原始比特参考后端
// ============================================================

/// 原始比特语法读取器
///
/// 编码约定:
/// - 标志: 1 bit
/// - sao_band_position / rem_intra_luma_pred_mode: 5 bit, sao_eo_class: 2 bit
/// - 其余多值元素: ue(v), mvd 为两个 se(v)
/// - 残差: [transform_skip 1 bit] [explicit_rdpcm 1 bit [方向 1 bit]]
///   ue(非零系数个数) 后接 (ue(光栅位置), se(电平)) 对
#[derive(Debug, Default)]
pub struct RawSyntaxReader {
    data: Vec<u8>,
    pos: usize,
    /// 上下文重置次数
    pub context_resets: usize,
    /// 上下文保存次数
    pub context_saves: usize,
    /// 上下文载入次数
    pub context_loads: usize,
}

impl RawSyntaxReader {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_reader<T>(&mut self, f: impl FnOnce(&mut BitReader) -> TaoResult<T>) -> TaoResult<T> {
        let mut br = BitReader::new(&self.data);
        br.seek_bits(self.pos).map_err(truncated)?;
        let value = f(&mut br).map_err(truncated)?;
        self.pos = br.bits_read();
        Ok(value)
    }

    fn flag(&mut self) -> TaoResult<bool> {
        self.with_reader(|br| br.read_flag())
    }

    fn ue(&mut self) -> TaoResult<u32> {
        self.with_reader(|br| br.read_ue())
    }

    fn bits(&mut self, n: u32) -> TaoResult<u32> {
        self.with_reader(|br| br.read_bits(n))
    }

    fn ue_bounded(&mut self, name: &str, max: u32) -> TaoResult<u32> {
        let v = self.ue()?;
        if v > max {
            return Err(TaoError::InvalidData(format!("HEVC: {} 超出范围, value={}, max={}", name, v, max)));
        }
        Ok(v)
    }
}

fn truncated(err: TaoError) -> TaoError {
    match err {
        TaoError::Eof => TaoError::InvalidData("HEVC: 分片数据提前结束".into()),
        other => other,
    }
}

impl SyntaxReader for RawSyntaxReader {
    fn start(&mut self, data: &[u8]) -> TaoResult<()> {
        self.data.clear();
        self.data.try_reserve_exact(data.len())?;
        self.data.extend_from_slice(data);
        self.pos = 0;
        Ok(())
    }

    fn reset_contexts(&mut self, _init: &ContextInit) {
        self.context_resets += 1;
    }

    fn save_contexts(&mut self) {
        self.context_saves += 1;
    }

    fn load_contexts(&mut self) {
        self.context_loads += 1;
    }

    fn position_bytes(&self) -> usize {
        self.pos.div_ceil(8)
    }

    fn end_of_slice_segment_flag(&mut self) -> TaoResult<bool> {
        self.flag()
    }

    fn end_of_subset_one_bit(&mut self) -> TaoResult<bool> {
        self.flag()
    }

    fn sao_merge_flag(&mut self) -> TaoResult<bool> {
        self.flag()
    }

    fn sao_type_idx(&mut self) -> TaoResult<u8> {
        Ok(self.ue_bounded("sao_type_idx", 2)? as u8)
    }

    fn sao_offset_abs(&mut self, max: u32) -> TaoResult<u32> {
        self.ue_bounded("sao_offset_abs", max)
    }

    fn sao_offset_sign(&mut self) -> TaoResult<bool> {
        self.flag()
    }

    fn sao_band_position(&mut self) -> TaoResult<u8> {
        Ok(self.bits(5)? as u8)
    }

    fn sao_eo_class(&mut self) -> TaoResult<u8> {
        Ok(self.bits(2)? as u8)
    }

    fn split_coding_unit_flag(&mut self, _ctx_inc: u8) -> TaoResult<bool> {
        self.flag()
    }

    fn cu_transquant_bypass_flag(&mut self) -> TaoResult<bool> {
        self.flag()
    }

    fn cu_skip_flag(&mut self, _ctx_inc: u8) -> TaoResult<bool> {
        self.flag()
    }

    fn pred_mode_flag(&mut self) -> TaoResult<bool> {
        self.flag()
    }

    fn part_mode(&mut self, _log2_cb_size: u32, _amp_enabled: bool) -> TaoResult<u8> {
        Ok(self.ue_bounded("part_mode", 7)? as u8)
    }

    fn pcm_flag(&mut self) -> TaoResult<bool> {
        self.flag()
    }

    fn pcm_samples(&mut self, len: usize) -> TaoResult<Vec<u8>> {
        self.pos = self.pos.div_ceil(8) * 8;
        let start = self.pos / 8;
        let end = start + len;
        let bytes = self
            .data
            .get(start..end)
            .ok_or_else(|| TaoError::InvalidData(format!("HEVC: PCM 样本不完整, 需要 {} 字节", len)))?
            .to_vec();
        self.pos = end * 8;
        Ok(bytes)
    }

    fn prev_intra_luma_pred_flag(&mut self) -> TaoResult<bool> {
        self.flag()
    }

    fn mpm_idx(&mut self) -> TaoResult<u8> {
        Ok(self.ue_bounded("mpm_idx", 2)? as u8)
    }

    fn rem_intra_luma_pred_mode(&mut self) -> TaoResult<u8> {
        Ok(self.bits(5)? as u8)
    }

    fn intra_chroma_pred_mode(&mut self) -> TaoResult<u8> {
        Ok(self.ue_bounded("intra_chroma_pred_mode", 4)? as u8)
    }

    fn merge_flag(&mut self) -> TaoResult<bool> {
        self.flag()
    }

    fn merge_idx(&mut self, max_num_merge_cand: u32) -> TaoResult<u32> {
        self.ue_bounded("merge_idx", max_num_merge_cand.saturating_sub(1))
    }

    fn inter_pred_idc(&mut self, _n_pb_w_plus_h: usize, _ct_depth: u8) -> TaoResult<u8> {
        Ok(self.ue_bounded("inter_pred_idc", 2)? as u8)
    }

    fn ref_idx(&mut self, num_ref_idx_active: usize) -> TaoResult<u32> {
        self.ue_bounded("ref_idx", num_ref_idx_active.saturating_sub(1) as u32)
    }

    fn mvd(&mut self) -> TaoResult<(i32, i32)> {
        self.with_reader(|br| Ok((br.read_se()?, br.read_se()?)))
    }

    fn mvp_flag(&mut self) -> TaoResult<bool> {
        self.flag()
    }

    fn rqt_root_cbf(&mut self) -> TaoResult<bool> {
        self.flag()
    }

    fn split_transform_flag(&mut self, _log2_trafo_size: u32) -> TaoResult<bool> {
        self.flag()
    }

    fn cbf_cb_cr(&mut self, _trafo_depth: u32) -> TaoResult<bool> {
        self.flag()
    }

    fn cbf_luma(&mut self, _trafo_depth: u32) -> TaoResult<bool> {
        self.flag()
    }

    fn cu_qp_delta_abs(&mut self) -> TaoResult<u32> {
        self.ue()
    }

    fn cu_qp_delta_sign_flag(&mut self) -> TaoResult<bool> {
        self.flag()
    }

    fn cu_chroma_qp_offset_flag(&mut self) -> TaoResult<bool> {
        self.flag()
    }

    fn cu_chroma_qp_offset_idx(&mut self, list_len: usize) -> TaoResult<u32> {
        self.ue_bounded("cu_chroma_qp_offset_idx", list_len.saturating_sub(1) as u32)
    }

    fn log2_res_scale_abs_plus1(&mut self, _c: usize) -> TaoResult<u8> {
        Ok(self.ue_bounded("log2_res_scale_abs_plus1", 4)? as u8)
    }

    fn res_scale_sign_flag(&mut self, _c: usize) -> TaoResult<bool> {
        self.flag()
    }

    fn residual_coding(&mut self, params: &ResidualParams) -> TaoResult<ResidualBlock> {
        let size = 1usize << params.log2_trafo_size;
        let area = size * size;
        let transform_skip = params.transform_skip_allowed && self.flag()?;
        let explicit_rdpcm = if params.explicit_rdpcm_allowed
            && (transform_skip || params.cu_transquant_bypass)
            && self.flag()?
        {
            Some(if self.flag()? {
                RdpcmDir::Vertical
            } else {
                RdpcmDir::Horizontal
            })
        } else {
            None
        };
        let count = self.ue_bounded("残差系数个数", area as u32)? as usize;
        let mut coeffs = Vec::new();
        coeffs.try_reserve_exact(area)?;
        coeffs.resize(area, 0);
        for _ in 0..count {
            let (pos, level) = self.with_reader(|br| Ok((br.read_ue()? as usize, br.read_se()?)))?;
            let slot = coeffs
                .get_mut(pos)
                .ok_or_else(|| TaoError::InvalidData(format!("HEVC: 残差系数位置越界, pos={}", pos)))?;
            *slot = level.clamp(-32768, 32767);
        }
        Ok(ResidualBlock {
            coeffs,
            transform_skip,
            explicit_rdpcm,
        })
    }
}
