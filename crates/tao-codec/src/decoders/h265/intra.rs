//! 帧内预测: 模式推导与参考样本构造.

use tao_core::{TaoError, TaoResult};

use super::ctu::CtuDecoder;
use super::dsp::{INTRA_ANGULAR_34, INTRA_DC, INTRA_PLANAR, INTRA_VERTICAL, IntraParams, IntraRefs};
use super::picture::{MvField, PredFlag};
use super::tables::{INTRA_CHROMA_TABLE, TAB_MODE_IDX};

/// 由左/上相邻模式构造 3 个最可能模式
pub(crate) fn mpm_candidates(cand_left: u32, cand_up: u32) -> [u32; 3] {
    if cand_left == cand_up {
        if cand_left < 2 {
            [INTRA_PLANAR, INTRA_DC, INTRA_VERTICAL]
        } else {
            [
                cand_left,
                2 + ((cand_left + 29) & 31),
                2 + ((cand_left - 2 + 1) & 31),
            ]
        }
    } else {
        let third = if cand_left != INTRA_PLANAR && cand_up != INTRA_PLANAR {
            INTRA_PLANAR
        } else if cand_left != INTRA_DC && cand_up != INTRA_DC {
            INTRA_DC
        } else {
            INTRA_VERTICAL
        };
        [cand_left, cand_up, third]
    }
}

/// rem_intra_luma_pred_mode 映射到实际模式
pub(crate) fn rem_to_mode(rem: u32, mut candidates: [u32; 3]) -> u32 {
    candidates.sort_unstable();
    let mut mode = rem;
    for c in candidates {
        if mode >= c {
            mode += 1;
        }
    }
    mode
}

/// intra_chroma_pred_mode 推导色度模式 (4 表示沿用亮度模式)
fn chroma_mode(chroma_pred_mode: u8, luma_mode: u32) -> u32 {
    match INTRA_CHROMA_TABLE.get(usize::from(chroma_pred_mode)) {
        Some(&m) if u32::from(m) == luma_mode => INTRA_ANGULAR_34,
        Some(&m) => u32::from(m),
        None => luma_mode,
    }
}

impl CtuDecoder<'_> {
    /// 帧内 PU: 读取亮度与色度预测模式
    pub(super) fn intra_prediction_unit(&mut self, x0: usize, y0: usize, log2_cb_size: u32) -> TaoResult<()> {
        let split = usize::from(self.lc.cu.intra_split);
        let pb_size = (1usize << log2_cb_size) >> split;
        let side = split + 1;

        let mut prev_flags = [false; 4];
        for flag in prev_flags.iter_mut().take(side * side) {
            *flag = self.syntax.prev_intra_luma_pred_flag()?;
        }

        for i in 0..side {
            for j in 0..side {
                let blk = 2 * i + j;
                let x = x0 + pb_size * j;
                let y = y0 + pb_size * i;
                let candidates = self.mpm_for(x, y);
                let mode = if prev_flags[blk] {
                    let idx = self.syntax.mpm_idx()?;
                    *candidates
                        .get(usize::from(idx))
                        .ok_or_else(|| TaoError::InvalidData(format!("HEVC: mpm_idx 越界: {}", idx)))?
                } else {
                    let rem = u32::from(self.syntax.rem_intra_luma_pred_mode()?);
                    rem_to_mode(rem, candidates)
                };
                if mode > INTRA_ANGULAR_34 {
                    return Err(TaoError::InvalidData(format!("HEVC: 帧内模式越界: {}", mode)));
                }
                self.lc.pu.intra_pred_mode[blk] = mode;
                self.side.set_ipm(x, y, pb_size, mode as u8);
                self.pic.motion.fill(x, y, pb_size, pb_size, MvField::default());
            }
        }

        match self.sps.chroma_array_type() {
            0 => {}
            3 => {
                for blk in 0..side * side {
                    let code = self.syntax.intra_chroma_pred_mode()?;
                    self.lc.pu.chroma_mode_c[blk] = code;
                    self.lc.pu.intra_pred_mode_c[blk] = chroma_mode(code, self.lc.pu.intra_pred_mode[blk]);
                }
            }
            2 => {
                let code = self.syntax.intra_chroma_pred_mode()?;
                self.lc.pu.chroma_mode_c[0] = code;
                let mode_idx = chroma_mode(code, self.lc.pu.intra_pred_mode[0]);
                self.lc.pu.intra_pred_mode_c[0] = u32::from(TAB_MODE_IDX[mode_idx as usize]);
            }
            _ => {
                let code = self.syntax.intra_chroma_pred_mode()?;
                self.lc.pu.chroma_mode_c[0] = code;
                self.lc.pu.intra_pred_mode_c[0] = chroma_mode(code, self.lc.pu.intra_pred_mode[0]);
            }
        }
        Ok(())
    }

    /// (x0, y0) 处亮度 PB 的最可能模式
    fn mpm_for(&self, x0: usize, y0: usize) -> [u32; 3] {
        let log2_ctb = self.sps.log2_ctb_size;
        let ctb_mask = (1usize << log2_ctb) - 1;
        let x0b = x0 & ctb_mask;
        let y0b = y0 & ctb_mask;

        let cand_left = if self.lc.ctb_left_flag || x0b != 0 {
            u32::from(self.side.ipm_at(x0 - 1, y0))
        } else {
            INTRA_DC
        };
        // 上方候选不跨越 CTB 行
        let cand_up = if y0b != 0 {
            u32::from(self.side.ipm_at(x0, y0 - 1))
        } else {
            INTRA_DC
        };
        mpm_candidates(cand_left, cand_up)
    }

    // ========================================================
    // 预测样本生成
    // ========================================================

    /// 对分量 c_idx 的 N x N 块做帧内预测
    ///
    /// (x0, y0) 为亮度坐标 (4:2:2 色度下半块时 y0 为色度行号), log2_size 为分量尺寸.
    pub(super) fn intra_pred(&mut self, x0: usize, y0: usize, log2_size: u32, c_idx: usize) {
        let sps = self.sps;
        let hshift = sps.hshift[c_idx];
        let vshift = sps.vshift[c_idx];
        let x = x0 >> hshift;
        let y = y0 >> vshift;
        let mode = if c_idx == 0 {
            self.lc.tu.intra_pred_mode
        } else {
            self.lc.tu.intra_pred_mode_c
        };
        let bit_depth = if c_idx == 0 { sps.bit_depth } else { sps.bit_depth_chroma };

        let refs = self.build_intra_refs(x, y, log2_size, c_idx, bit_depth);
        let params = IntraParams {
            log2_size,
            mode,
            bit_depth,
            filter_refs: (c_idx == 0 || sps.chroma_array_type() == 3) && !sps.intra_smoothing_disabled,
            strong_smoothing: sps.strong_intra_smoothing_enabled && c_idx == 0,
            edge_filters: c_idx == 0
                && log2_size < 5
                && !(sps.implicit_rdpcm_enabled && self.lc.cu.cu_transquant_bypass),
        };
        let size = 1usize << log2_size;
        let dsp = self.dsp;
        let Some(plane) = self.pic.picture.planes.get_mut(c_idx) else {
            return;
        };
        let mut dst = plane.region_mut(x, y, size, size);
        dsp.intra_pred(&mut dst, &refs, &params);
    }

    /// 参考样本可用性判断与替换 (8.4.4.2.2), (x, y) 为分量坐标
    fn build_intra_refs(&self, x: usize, y: usize, log2_size: u32, c_idx: usize, bit_depth: u32) -> IntraRefs {
        let sps = self.sps;
        let hshift = sps.hshift[c_idx];
        let vshift = sps.vshift[c_idx];
        let n = 1i32 << log2_size;
        let plane = &self.pic.picture.planes[c_idx];
        let avail = self.availability();
        let constrained = self.pps.constrained_intra_pred;
        let x_cur = (x << hshift) as i32;
        let y_cur = (y << vshift) as i32;

        let sample = |xn: i32, yn: i32| -> Option<u16> {
            if xn < 0 || yn < 0 {
                return None;
            }
            let xl = xn << hshift;
            let yl = yn << vshift;
            if !avail.z_scan(x_cur, y_cur, xl, yl) {
                return None;
            }
            if constrained && self.pic.motion.at(xl as usize, yl as usize).pred_flag != PredFlag::Intra {
                return None;
            }
            Some(plane.get(xn as usize, yn as usize))
        };

        // 顺序: p[-1][2N-1] .. p[-1][-1], p[0][-1] .. p[2N-1][-1]
        let (xi, yi) = (x as i32, y as i32);
        let total = (4 * n + 1) as usize;
        let mut line: Vec<Option<u16>> = Vec::with_capacity(total);
        for k in (0..2 * n).rev() {
            line.push(sample(xi - 1, yi + k));
        }
        line.push(sample(xi - 1, yi - 1));
        for k in 0..2 * n {
            line.push(sample(xi + k, yi - 1));
        }

        let filled: Vec<u16> = match line.iter().flatten().next() {
            None => vec![1 << (bit_depth - 1); total],
            Some(&first) => {
                let mut prev = first;
                line.iter()
                    .map(|s| {
                        if let Some(v) = s {
                            prev = *v;
                        }
                        prev
                    })
                    .collect()
            }
        };

        let two_n = 2 * n as usize;
        let corner = filled[two_n];
        let mut left = Vec::with_capacity(two_n + 1);
        left.push(corner);
        left.extend(filled[..two_n].iter().rev());
        let mut top = Vec::with_capacity(two_n + 1);
        top.push(corner);
        top.extend_from_slice(&filled[two_n + 1..]);
        IntraRefs { top, left }
    }
}
