//! 变换树, 变换单元与残差重建.
//!
//! 残差重建顺序: 反量化, (旋转), 反变换 / 变换跳过 / 旁路, RDPCM,
//! 跨分量预测, 叠加到预测样本上.

use log::warn;
use tao_core::{TaoError, TaoResult};

use super::context::{PartMode, PredMode, SideArrays};
use super::ctu::CtuDecoder;
use super::dsp::{INTRA_HORIZONTAL, INTRA_VERTICAL, TransformKind};
use super::syntax::{RdpcmDir, ResidualParams, ScanOrder};
use super::tables::{LEVEL_SCALE, chroma_qp};

/// 小尺寸帧内块按预测方向选择扫描顺序
fn intra_scan(mode: u32) -> ScanOrder {
    match mode {
        6..=14 => ScanOrder::Vertical,
        22..=30 => ScanOrder::Horizontal,
        _ => ScanOrder::Diagonal,
    }
}

impl CtuDecoder<'_> {
    /// transform_tree()
    ///
    /// `parent_cbf` 为父节点的 [cbf_cb, cbf_cr], 每项含 4:2:2 上下两个子块的标志.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn transform_tree(
        &mut self,
        x0: usize,
        y0: usize,
        x_base: usize,
        y_base: usize,
        cb_x_base: usize,
        cb_y_base: usize,
        log2_cb_size: u32,
        log2_trafo_size: u32,
        trafo_depth: u32,
        blk_idx: usize,
        parent_cbf: [[bool; 2]; 2],
    ) -> TaoResult<()> {
        let sps = self.sps;
        let chroma_type = sps.chroma_array_type();
        let cu = self.lc.cu;

        if cu.intra_split {
            if trafo_depth == 1 {
                let c_blk = if chroma_type == 3 { blk_idx } else { 0 };
                self.lc.tu.intra_pred_mode = self.lc.pu.intra_pred_mode[blk_idx];
                self.lc.tu.intra_pred_mode_c = self.lc.pu.intra_pred_mode_c[c_blk];
                self.lc.tu.chroma_mode_c = self.lc.pu.chroma_mode_c[c_blk];
            }
        } else {
            self.lc.tu.intra_pred_mode = self.lc.pu.intra_pred_mode[0];
            self.lc.tu.intra_pred_mode_c = self.lc.pu.intra_pred_mode_c[0];
            self.lc.tu.chroma_mode_c = self.lc.pu.chroma_mode_c[0];
        }

        let split = if log2_trafo_size <= sps.log2_max_tb_size
            && log2_trafo_size > sps.log2_min_tb_size
            && trafo_depth < cu.max_trafo_depth
            && !(cu.intra_split && trafo_depth == 0)
        {
            self.syntax.split_transform_flag(log2_trafo_size)?
        } else {
            let inter_split = sps.max_transform_hierarchy_depth_inter == 0
                && cu.pred_mode == PredMode::Inter
                && cu.part_mode != PartMode::Part2Nx2N
                && trafo_depth == 0;
            log2_trafo_size > sps.log2_max_tb_size || (cu.intra_split && trafo_depth == 0) || inter_split
        };

        let mut cbf = parent_cbf;
        if chroma_type != 0 && (log2_trafo_size > 2 || chroma_type == 3) {
            for flags in cbf.iter_mut() {
                if trafo_depth == 0 || flags[0] {
                    flags[0] = self.syntax.cbf_cb_cr(trafo_depth)?;
                    if chroma_type == 2 && (!split || log2_trafo_size == 3) {
                        flags[1] = self.syntax.cbf_cb_cr(trafo_depth)?;
                    }
                }
            }
        }

        if split {
            let half = (1usize << log2_trafo_size) >> 1;
            let children = [(x0, y0), (x0 + half, y0), (x0, y0 + half), (x0 + half, y0 + half)];
            for (idx, (x, y)) in children.into_iter().enumerate() {
                self.transform_tree(
                    x,
                    y,
                    x0,
                    y0,
                    cb_x_base,
                    cb_y_base,
                    log2_cb_size,
                    log2_trafo_size - 1,
                    trafo_depth + 1,
                    idx,
                    cbf,
                )?;
            }
            return Ok(());
        }

        let any_chroma = cbf[0][0] || cbf[1][0] || (chroma_type == 2 && (cbf[0][1] || cbf[1][1]));
        let cbf_luma = if cu.pred_mode == PredMode::Intra || trafo_depth != 0 || any_chroma {
            self.syntax.cbf_luma(trafo_depth)?
        } else {
            true
        };

        self.transform_unit(
            x0,
            y0,
            x_base,
            y_base,
            cb_x_base,
            cb_y_base,
            log2_trafo_size,
            blk_idx,
            cbf_luma,
            cbf,
        )?;

        let size = 1usize << log2_trafo_size;
        if cbf_luma {
            let log2_min_tb = sps.log2_min_tb_size;
            let cells = size >> log2_min_tb;
            let stride = self.side.cbf_stride;
            SideArrays::fill_grid(
                &mut self.side.cbf_luma,
                stride,
                x0 >> log2_min_tb,
                y0 >> log2_min_tb,
                cells,
                cells,
                1,
            );
        }
        if !self.sh.disable_deblocking_filter {
            self.boundary_strengths(x0, y0, log2_trafo_size);
        }
        if self.pps.transquant_bypass_enabled && cu.cu_transquant_bypass {
            self.side.mark_bypass(x0, y0, size);
        }
        Ok(())
    }

    /// transform_unit(): 帧内预测与各分量残差
    #[allow(clippy::too_many_arguments)]
    fn transform_unit(
        &mut self,
        x0: usize,
        y0: usize,
        x_base: usize,
        y_base: usize,
        cb_x_base: usize,
        cb_y_base: usize,
        log2_trafo_size: u32,
        blk_idx: usize,
        cbf_luma: bool,
        cbf: [[bool; 2]; 2],
    ) -> TaoResult<()> {
        let sps = self.sps;
        let pps = self.pps;
        let chroma_type = sps.chroma_array_type();
        let intra = self.lc.cu.pred_mode == PredMode::Intra;
        let log2_trafo_size_c = log2_trafo_size - sps.hshift[1];
        let sub_blocks = if chroma_type == 2 { 2 } else { 1 };

        if intra {
            self.intra_pred(x0, y0, log2_trafo_size, 0);
        }

        let cbf_chroma = cbf[0][0] || cbf[1][0] || (chroma_type == 2 && (cbf[0][1] || cbf[1][1]));
        if !cbf_luma && !cbf_chroma {
            if chroma_type != 0 && intra {
                if log2_trafo_size > 2 || chroma_type == 3 {
                    for i in 0..sub_blocks {
                        let y = y0 + (i << log2_trafo_size_c);
                        self.intra_pred(x0, y, log2_trafo_size_c, 1);
                        self.intra_pred(x0, y, log2_trafo_size_c, 2);
                    }
                } else if blk_idx == 3 {
                    for i in 0..sub_blocks {
                        let y = y_base + (i << log2_trafo_size);
                        self.intra_pred(x_base, y, log2_trafo_size, 1);
                        self.intra_pred(x_base, y, log2_trafo_size, 2);
                    }
                }
            }
            return Ok(());
        }

        if pps.cu_qp_delta_enabled && !self.lc.tu.is_cu_qp_delta_coded {
            let abs = self.syntax.cu_qp_delta_abs()? as i32;
            let mut delta = abs;
            if abs != 0 && self.syntax.cu_qp_delta_sign_flag()? {
                delta = -abs;
            }
            self.lc.tu.cu_qp_delta = delta;
            self.lc.tu.is_cu_qp_delta_coded = true;
            let half_off = sps.qp_bd_offset / 2;
            if delta < -(26 + half_off) || delta > 25 + half_off {
                return Err(TaoError::InvalidData(format!(
                    "HEVC: cu_qp_delta 超出范围: {}",
                    delta
                )));
            }
            self.set_qpy(cb_x_base, cb_y_base);
        }

        if self.sh.cu_chroma_qp_offset_enabled
            && cbf_chroma
            && !self.lc.cu.cu_transquant_bypass
            && !self.lc.tu.is_cu_chroma_qp_offset_coded
        {
            if self.syntax.cu_chroma_qp_offset_flag()? {
                let len = pps.cb_qp_offset_list.len();
                let idx = if len > 1 {
                    self.syntax.cu_chroma_qp_offset_idx(len)? as usize
                } else {
                    0
                };
                let (Some(&cb), Some(&cr)) = (pps.cb_qp_offset_list.get(idx), pps.cr_qp_offset_list.get(idx)) else {
                    return Err(TaoError::InvalidData(format!("HEVC: cu_chroma_qp_offset_idx 越界: {}", idx)));
                };
                self.lc.tu.cu_qp_offset_cb = cb;
                self.lc.tu.cu_qp_offset_cr = cr;
            } else {
                self.lc.tu.cu_qp_offset_cb = 0;
                self.lc.tu.cu_qp_offset_cr = 0;
            }
            self.lc.tu.is_cu_chroma_qp_offset_coded = true;
        }

        let mut scan = ScanOrder::Diagonal;
        let mut scan_c = ScanOrder::Diagonal;
        if intra && log2_trafo_size < 4 {
            scan = intra_scan(self.lc.tu.intra_pred_mode);
            scan_c = intra_scan(self.lc.tu.intra_pred_mode_c);
        }
        self.lc.tu.cross_pf = false;

        if cbf_luma {
            self.residual(x0, y0, log2_trafo_size, scan, 0)?;
        }

        if chroma_type != 0 && (log2_trafo_size > 2 || chroma_type == 3) {
            self.lc.tu.cross_pf = pps.cross_component_prediction_enabled
                && cbf_luma
                && (self.lc.cu.pred_mode == PredMode::Inter || self.lc.tu.chroma_mode_c == 4);
            for c_idx in 1..3 {
                if self.lc.tu.cross_pf {
                    self.cross_component_scale(c_idx - 1)?;
                }
                for i in 0..sub_blocks {
                    let y = y0 + (i << log2_trafo_size_c);
                    if intra {
                        self.intra_pred(x0, y, log2_trafo_size_c, c_idx);
                    }
                    if cbf[c_idx - 1][i] {
                        self.residual(x0, y, log2_trafo_size_c, scan_c, c_idx)?;
                    } else if self.lc.tu.cross_pf {
                        self.cross_component_only(x0, y, log2_trafo_size_c, c_idx);
                    }
                }
            }
        } else if chroma_type != 0 && blk_idx == 3 {
            for c_idx in 1..3 {
                for i in 0..sub_blocks {
                    let y = y_base + (i << log2_trafo_size);
                    if intra {
                        self.intra_pred(x_base, y, log2_trafo_size, c_idx);
                    }
                    if cbf[c_idx - 1][i] {
                        self.residual(x_base, y, log2_trafo_size, scan_c, c_idx)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// log2_res_scale_abs_plus1 / res_scale_sign_flag
    fn cross_component_scale(&mut self, c: usize) -> TaoResult<()> {
        let abs_plus1 = self.syntax.log2_res_scale_abs_plus1(c)?;
        self.lc.tu.res_scale_val = if abs_plus1 != 0 {
            let sign = self.syntax.res_scale_sign_flag(c)?;
            (1 << (abs_plus1 - 1)) * if sign { -1 } else { 1 }
        } else {
            0
        };
        Ok(())
    }

    /// 色度无残差时只叠加由亮度残差预测的部分
    fn cross_component_only(&mut self, x0: usize, y0: usize, log2_size: u32, c_idx: usize) {
        let size = 1usize << log2_size;
        let scale = self.lc.tu.res_scale_val;
        let residual: Vec<i32> = self
            .lc
            .residual_y
            .iter()
            .take(size * size)
            .map(|&r| (scale * r) >> 3)
            .collect();
        if residual.len() < size * size {
            return;
        }
        self.put_residual(x0, y0, log2_size, c_idx, &residual);
    }

    // ========================================================
    // 残差重建
    // ========================================================

    /// 解析并重建一个变换块的残差, (x0, y0) 为亮度坐标
    fn residual(&mut self, x0: usize, y0: usize, log2_size: u32, scan: ScanOrder, c_idx: usize) -> TaoResult<()> {
        let sps = self.sps;
        let pps = self.pps;
        let dsp = self.dsp;
        let cu = self.lc.cu;
        let intra = cu.pred_mode == PredMode::Intra;
        let bypass = cu.cu_transquant_bypass;
        let bit_depth = if c_idx == 0 { sps.bit_depth } else { sps.bit_depth_chroma };
        let pred_mode_intra = if c_idx == 0 {
            self.lc.tu.intra_pred_mode
        } else {
            self.lc.tu.intra_pred_mode_c
        };

        let params = ResidualParams {
            x0: x0 >> sps.hshift[c_idx],
            y0: y0 >> sps.vshift[c_idx],
            log2_trafo_size: log2_size,
            c_idx,
            scan,
            transform_skip_allowed: pps.transform_skip_enabled
                && !bypass
                && log2_size <= pps.log2_max_transform_skip_block_size,
            explicit_rdpcm_allowed: !intra && sps.explicit_rdpcm_enabled,
            sign_data_hiding: pps.sign_data_hiding,
            cu_transquant_bypass: bypass,
            intra,
        };
        let block = self.syntax.residual_coding(&params)?;
        let ts = block.transform_skip;
        let mut res = block.coeffs;

        if !bypass {
            self.dequantize(&mut res, c_idx, log2_size, ts);
        }
        if (ts || bypass) && sps.transform_skip_rotation_enabled && log2_size == 2 && intra {
            res.reverse();
        }

        let implicit_rdpcm =
            sps.implicit_rdpcm_enabled && intra && (pred_mode_intra == INTRA_HORIZONTAL || pred_mode_intra == INTRA_VERTICAL);
        let rdpcm_vertical = match block.explicit_rdpcm {
            Some(dir) => Some(dir == RdpcmDir::Vertical),
            None if implicit_rdpcm => Some(pred_mode_intra == INTRA_VERTICAL),
            None => None,
        };

        let extended = sps.extended_precision_processing;
        if bypass {
            if let Some(vertical) = rdpcm_vertical {
                dsp.rdpcm(&mut res, log2_size, vertical);
            }
        } else if ts {
            dsp.transform_skip(&mut res, log2_size, bit_depth, extended);
            if let Some(vertical) = rdpcm_vertical {
                dsp.rdpcm(&mut res, log2_size, vertical);
            }
        } else {
            let kind = if intra && c_idx == 0 && log2_size == 2 {
                TransformKind::Dst
            } else {
                TransformKind::Dct
            };
            dsp.inverse_transform(&mut res, log2_size, kind, bit_depth, extended);
        }

        if c_idx > 0 && self.lc.tu.cross_pf {
            let scale = self.lc.tu.res_scale_val;
            for (r, &y) in res.iter_mut().zip(self.lc.residual_y.iter()) {
                *r += (scale * y) >> 3;
            }
        }

        self.put_residual(x0, y0, log2_size, c_idx, &res);
        if c_idx == 0 {
            self.lc.residual_y = res;
        }
        Ok(())
    }

    /// 残差叠加到重建平面并写入残差侧平面
    fn put_residual(&mut self, x0: usize, y0: usize, log2_size: u32, c_idx: usize, residual: &[i32]) {
        let sps = self.sps;
        let size = 1usize << log2_size;
        let xc = x0 >> sps.hshift[c_idx];
        let yc = y0 >> sps.vshift[c_idx];
        let bit_depth = if c_idx == 0 { sps.bit_depth } else { sps.bit_depth_chroma };
        let Some(plane) = self.pic.picture.planes.get_mut(c_idx) else {
            warn!("HEVC: 分量 {} 不存在, 残差被丢弃", c_idx);
            return;
        };
        let mut dst = plane.region_mut(xc, yc, size, size);
        self.dsp.add_residual(&mut dst, residual, log2_size, bit_depth);
        if let Some(meta) = self.metadata {
            meta.write_residual(&mut self.pic.side_planes, c_idx, xc, yc, size, residual);
        }
    }

    /// 分量 c_idx 的量化参数 (已加 QpBdOffset)
    fn component_qp(&self, c_idx: usize) -> i32 {
        let sps = self.sps;
        let off = sps.qp_bd_offset;
        let qp_y = self.lc.qp_y;
        match c_idx {
            0 => qp_y + off,
            _ => {
                let (pps_off, slice_off, cu_off) = if c_idx == 1 {
                    (self.pps.cb_qp_offset, self.sh.slice_cb_qp_offset, self.lc.tu.cu_qp_offset_cb)
                } else {
                    (self.pps.cr_qp_offset, self.sh.slice_cr_qp_offset, self.lc.tu.cu_qp_offset_cr)
                };
                let qpi = (qp_y + pps_off + slice_off + cu_off).clamp(-off, 57);
                chroma_qp(qpi, sps.chroma_format_idc) + off
            }
        }
    }

    /// 反量化 (8.6.3), 系数原位缩放
    fn dequantize(&self, coeffs: &mut [i32], c_idx: usize, log2_size: u32, transform_skip: bool) {
        let sps = self.sps;
        let bit_depth = if c_idx == 0 { sps.bit_depth } else { sps.bit_depth_chroma };
        let log2_range = if sps.extended_precision_processing {
            15.max(bit_depth + 6)
        } else {
            15
        };
        let coeff_max = (1i64 << log2_range) - 1;
        let coeff_min = -(1i64 << log2_range);
        let bd_shift = bit_depth + log2_size + 10 - log2_range;
        let add = 1i64 << (bd_shift - 1);

        let qp = self.component_qp(c_idx).max(0);
        let scale = i64::from(LEVEL_SCALE[(qp % 6) as usize]) << (qp / 6);
        let list = if transform_skip && log2_size > 2 {
            None
        } else {
            self.pps.effective_scaling_list(sps)
        };
        let matrix_id = 3 * usize::from(self.lc.cu.pred_mode != PredMode::Intra) + c_idx;

        let size = 1usize << log2_size;
        for y in 0..size {
            for x in 0..size {
                let c = &mut coeffs[y * size + x];
                if *c == 0 {
                    continue;
                }
                let m = list.map_or(16, |l| l.factor(log2_size, matrix_id, x, y));
                let v = (i64::from(*c) * i64::from(m) * scale + add) >> bd_shift;
                *c = v.clamp(coeff_min, coeff_max) as i32;
            }
        }
    }
}
