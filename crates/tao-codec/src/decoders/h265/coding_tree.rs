//! 编码四叉树与编码单元.

use log::warn;
use tao_core::bitreader::BitReader;
use tao_core::{TaoError, TaoResult};

use super::context::{PartMode, PredMode, SideArrays};
use super::ctu::{CtuDecoder, QuadtreeStatus};
use super::dsp::INTRA_DC;
use super::picture::MvField;

impl CtuDecoder<'_> {
    /// coding_quadtree(): 递归解码以 (x0, y0) 为左上角的编码树节点
    ///
    /// `bit_idx` 为节点在四叉树位图中的序号 (根为 0, 子节点 4i+1..=4i+4).
    pub(super) fn coding_quadtree(
        &mut self,
        x0: usize,
        y0: usize,
        log2_cb_size: u32,
        ct_depth: u8,
        bit_idx: usize,
        ctb_addr_rs: usize,
    ) -> TaoResult<QuadtreeStatus> {
        let sps = self.sps;
        let pps = self.pps;
        let width = sps.width as usize;
        let height = sps.height as usize;
        let log2_ctb = sps.log2_ctb_size;
        let cb_size = 1usize << log2_cb_size;

        let split = if x0 + cb_size <= width && y0 + cb_size <= height && log2_cb_size > sps.log2_min_cb_size {
            let ctx_inc = self.split_ctx_inc(x0, y0, ct_depth);
            self.syntax.split_coding_unit_flag(ctx_inc)?
        } else {
            log2_cb_size > sps.log2_min_cb_size
        };

        if pps.cu_qp_delta_enabled && log2_cb_size + pps.diff_cu_qp_delta_depth >= log2_ctb {
            self.lc.tu.is_cu_qp_delta_coded = false;
            self.lc.tu.cu_qp_delta = 0;
        }
        if self.sh.cu_chroma_qp_offset_enabled && log2_cb_size + pps.diff_cu_chroma_qp_offset_depth >= log2_ctb {
            self.lc.tu.is_cu_chroma_qp_offset_coded = false;
            self.lc.tu.cu_qp_offset_cb = 0;
            self.lc.tu.cu_qp_offset_cr = 0;
        }

        if !split {
            self.coding_unit(x0, y0, log2_cb_size, ct_depth)?;
            let ctb_size = 1usize << log2_ctb;
            let at_ctb_end_x = (x0 + cb_size) % ctb_size == 0 || x0 + cb_size >= width;
            let at_ctb_end_y = (y0 + cb_size) % ctb_size == 0 || y0 + cb_size >= height;
            if at_ctb_end_x && at_ctb_end_y && self.syntax.end_of_slice_segment_flag()? {
                return Ok(QuadtreeStatus::EndOfSlice);
            }
            return Ok(QuadtreeStatus::Continue);
        }

        if let Some(meta) = self.metadata {
            meta.mark_split(&mut self.pic.side_planes, ctb_addr_rs, bit_idx);
        }
        let half = cb_size >> 1;
        let x1 = x0 + half;
        let y1 = y0 + half;
        let child = log2_cb_size - 1;
        let depth = ct_depth + 1;

        let mut status = self.coding_quadtree(x0, y0, child, depth, 4 * bit_idx + 1, ctb_addr_rs)?;
        if status == QuadtreeStatus::Continue && x1 < width {
            status = self.coding_quadtree(x1, y0, child, depth, 4 * bit_idx + 2, ctb_addr_rs)?;
        }
        if status == QuadtreeStatus::Continue && y1 < height {
            status = self.coding_quadtree(x0, y1, child, depth, 4 * bit_idx + 3, ctb_addr_rs)?;
        }
        if status == QuadtreeStatus::Continue && x1 < width && y1 < height {
            status = self.coding_quadtree(x1, y1, child, depth, 4 * bit_idx + 4, ctb_addr_rs)?;
        }

        let qp_block_mask = (1usize << (log2_ctb - pps.diff_cu_qp_delta_depth)) - 1;
        if (x0 + cb_size) & qp_block_mask == 0 && (y0 + cb_size) & qp_block_mask == 0 {
            self.lc.qpy_pred = self.lc.qp_y;
        }

        if status == QuadtreeStatus::EndOfSlice {
            return Ok(status);
        }
        if x0 + cb_size >= width && y0 + cb_size >= height {
            return Ok(QuadtreeStatus::EndOfSlice);
        }
        Ok(QuadtreeStatus::Continue)
    }

    /// split_cu_flag 的 ctxInc: 左/上相邻 CU 深度大于当前深度的个数
    fn split_ctx_inc(&self, x0: usize, y0: usize, ct_depth: u8) -> u8 {
        let log2_min_cb = self.sps.log2_min_cb_size;
        let ctb_mask = (1usize << self.sps.log2_ctb_size) - 1;
        let mut inc = 0;
        if (self.lc.ctb_left_flag || x0 & ctb_mask != 0) && self.side.ct_depth_at(x0 - 1, y0, log2_min_cb) > ct_depth {
            inc += 1;
        }
        if (self.lc.ctb_up_flag || y0 & ctb_mask != 0) && self.side.ct_depth_at(x0, y0 - 1, log2_min_cb) > ct_depth {
            inc += 1;
        }
        inc
    }

    fn skip_ctx_inc(&self, x0: usize, y0: usize) -> u8 {
        let log2_min_cb = self.sps.log2_min_cb_size;
        let ctb_mask = (1usize << self.sps.log2_ctb_size) - 1;
        let mut inc = 0;
        if (self.lc.ctb_left_flag || x0 & ctb_mask != 0) && self.side.skip_flag_at(x0 - 1, y0, log2_min_cb) != 0 {
            inc += 1;
        }
        if (self.lc.ctb_up_flag || y0 & ctb_mask != 0) && self.side.skip_flag_at(x0, y0 - 1, log2_min_cb) != 0 {
            inc += 1;
        }
        inc
    }

    // ========================================================
    // 编码单元
    // ========================================================

    fn coding_unit(&mut self, x0: usize, y0: usize, log2_cb_size: u32, ct_depth: u8) -> TaoResult<()> {
        let sps = self.sps;
        let pps = self.pps;
        let cb_size = 1usize << log2_cb_size;
        let log2_min_cb = sps.log2_min_cb_size;
        let min_cb_width = self.side.min_cb_width;
        let (xc, yc) = (x0 >> log2_min_cb, y0 >> log2_min_cb);
        let cb_cells = cb_size >> log2_min_cb;

        self.lc.cu_start_bytes = self.syntax.position_bytes();
        if let Some(meta) = self.metadata {
            meta.reset_residual(&mut self.pic.side_planes, x0, y0, cb_size);
        }

        self.lc.cu = Default::default();
        self.lc.cu.x = x0;
        self.lc.cu.y = y0;
        self.lc.cu.log2_cb_size = log2_cb_size;
        self.lc.cu.pred_mode = PredMode::Intra;
        self.lc.pu.intra_pred_mode = [INTRA_DC; 4];

        if pps.transquant_bypass_enabled {
            self.lc.cu.cu_transquant_bypass = self.syntax.cu_transquant_bypass_flag()?;
            if self.lc.cu.cu_transquant_bypass {
                self.side.mark_bypass(x0, y0, cb_size);
            }
        }

        let mut skip = false;
        if !self.sh.is_intra() {
            let ctx_inc = self.skip_ctx_inc(x0, y0);
            skip = self.syntax.cu_skip_flag(ctx_inc)?;
            self.lc.cu.pred_mode = if skip { PredMode::Skip } else { PredMode::Inter };
        }
        SideArrays::fill_grid(&mut self.side.skip_flag, min_cb_width, xc, yc, cb_cells, cb_cells, u8::from(skip));

        if skip {
            self.prediction_unit(x0, y0, cb_size, cb_size, log2_cb_size, 0, ct_depth)?;
            self.side.set_ipm(x0, y0, cb_size, INTRA_DC as u8);
            if !self.sh.disable_deblocking_filter {
                self.boundary_strengths(x0, y0, log2_cb_size);
            }
        } else {
            self.coding_unit_body(x0, y0, log2_cb_size, ct_depth)?;
        }

        if pps.cu_qp_delta_enabled && !self.lc.tu.is_cu_qp_delta_coded {
            self.set_qpy(x0, y0);
        }
        let qp_y = self.lc.qp_y as i8;
        SideArrays::fill_grid(&mut self.side.qp_y_tab, min_cb_width, xc, yc, cb_cells, cb_cells, qp_y);

        let qp_block_mask = (1usize << (sps.log2_ctb_size - pps.diff_cu_qp_delta_depth)) - 1;
        if (x0 + cb_size) & qp_block_mask == 0 && (y0 + cb_size) & qp_block_mask == 0 {
            self.lc.qpy_pred = self.lc.qp_y;
        }

        SideArrays::fill_grid(&mut self.side.ct_depth, min_cb_width, xc, yc, cb_cells, cb_cells, ct_depth);

        if let Some(meta) = self.metadata {
            let bytes = self.syntax.position_bytes().saturating_sub(self.lc.cu_start_bytes);
            meta.write_bit_density(&mut self.pic.side_planes, x0, y0, log2_cb_size, bytes);
        }
        Ok(())
    }

    /// 非跳过 CU: 预测模式, 划分, PCM/帧内/帧间预测与变换树
    fn coding_unit_body(&mut self, x0: usize, y0: usize, log2_cb_size: u32, ct_depth: u8) -> TaoResult<()> {
        let sps = self.sps;
        let cb_size = 1usize << log2_cb_size;

        if !self.sh.is_intra() {
            self.lc.cu.pred_mode = if self.syntax.pred_mode_flag()? {
                PredMode::Intra
            } else {
                PredMode::Inter
            };
        }
        let intra = self.lc.cu.pred_mode == PredMode::Intra;

        let part_mode = if !intra || log2_cb_size == sps.log2_min_cb_size {
            let code = self.syntax.part_mode(log2_cb_size, sps.amp_enabled)?;
            self.check_part_mode(code, intra, log2_cb_size)?
        } else {
            PartMode::Part2Nx2N
        };
        self.lc.cu.part_mode = part_mode;
        self.lc.cu.intra_split = intra && part_mode == PartMode::PartNxN;

        let mut merge_flag = false;
        if intra {
            let pcm = &sps.pcm;
            if part_mode == PartMode::Part2Nx2N
                && sps.pcm_enabled
                && log2_cb_size >= pcm.log2_min_pcm_cb_size
                && log2_cb_size <= pcm.log2_max_pcm_cb_size
            {
                self.lc.cu.pcm_flag = self.syntax.pcm_flag()?;
            }
            if self.lc.cu.pcm_flag {
                self.side.set_ipm(x0, y0, cb_size, INTRA_DC as u8);
                self.pcm_sample(x0, y0, log2_cb_size)?;
                if pcm.loop_filter_disabled {
                    self.side.mark_bypass(x0, y0, cb_size);
                }
            } else {
                self.intra_prediction_unit(x0, y0, log2_cb_size)?;
            }
            self.pic.motion.fill(x0, y0, cb_size, cb_size, MvField::default());
        } else {
            self.side.set_ipm(x0, y0, cb_size, INTRA_DC as u8);
            for (part_idx, (dx, dy, w, h)) in part_mode.partitions(cb_size).into_iter().enumerate() {
                merge_flag = self.prediction_unit(x0 + dx, y0 + dy, w, h, log2_cb_size, part_idx, ct_depth)?;
            }
        }

        if self.lc.cu.pcm_flag {
            if !self.sh.disable_deblocking_filter {
                self.boundary_strengths(x0, y0, log2_cb_size);
            }
            return Ok(());
        }

        let rqt_root_cbf = if !intra && !(part_mode == PartMode::Part2Nx2N && merge_flag) {
            self.syntax.rqt_root_cbf()?
        } else {
            true
        };
        if rqt_root_cbf {
            self.lc.cu.max_trafo_depth = if intra {
                sps.max_transform_hierarchy_depth_intra + u32::from(self.lc.cu.intra_split)
            } else {
                sps.max_transform_hierarchy_depth_inter
            };
            self.transform_tree(x0, y0, x0, y0, x0, y0, log2_cb_size, log2_cb_size, 0, 0, [[false; 2]; 2])?;
        } else if !self.sh.disable_deblocking_filter {
            self.boundary_strengths(x0, y0, log2_cb_size);
        }
        Ok(())
    }

    /// 校验 part_mode 码值
    fn check_part_mode(&self, code: u8, intra: bool, log2_cb_size: u32) -> TaoResult<PartMode> {
        let sps = self.sps;
        let invalid = || TaoError::InvalidData(format!("HEVC: 非法 part_mode={}, log2_cb={}", code, log2_cb_size));
        let mode = PartMode::from_code(code).ok_or_else(invalid)?;
        let ok = if intra {
            matches!(mode, PartMode::Part2Nx2N | PartMode::PartNxN)
        } else if mode == PartMode::PartNxN {
            log2_cb_size == sps.log2_min_cb_size && log2_cb_size > 3
        } else if mode.is_amp() {
            sps.amp_enabled && log2_cb_size > sps.log2_min_cb_size
        } else {
            true
        };
        if !ok {
            warn!("HEVC: part_mode {:?} 与 CU 尺寸不符", mode);
            return Err(invalid());
        }
        Ok(mode)
    }

    // ========================================================
    // PCM
    // ========================================================

    /// pcm_sample(): 读取并写入原始样本
    fn pcm_sample(&mut self, x0: usize, y0: usize, log2_cb_size: u32) -> TaoResult<()> {
        let sps = self.sps;
        let dsp = self.dsp;
        let pcm = sps.pcm;
        let cb_size = 1usize << log2_cb_size;
        let has_chroma = sps.chroma_array_type() != 0;

        let mut length = cb_size * cb_size * pcm.bit_depth as usize;
        if has_chroma {
            let chroma_area = (cb_size >> sps.hshift[1]) * (cb_size >> sps.vshift[1]);
            length += 2 * chroma_area * pcm.bit_depth_chroma as usize;
        }
        let bytes = self.syntax.pcm_samples(length.div_ceil(8))?;
        let mut br = BitReader::new(&bytes);

        let samples = read_pcm(&mut br, cb_size * cb_size, pcm.bit_depth)?;
        let mut dst = self.pic.picture.planes[0].region_mut(x0, y0, cb_size, cb_size);
        dsp.put_pcm(&mut dst, &samples, cb_size, pcm.bit_depth, sps.bit_depth);

        if has_chroma {
            let w = cb_size >> sps.hshift[1];
            let h = cb_size >> sps.vshift[1];
            let xc = x0 >> sps.hshift[1];
            let yc = y0 >> sps.vshift[1];
            for c in 1..3 {
                let samples = read_pcm(&mut br, w * h, pcm.bit_depth_chroma)?;
                // 4:2:2 的 w x 2w 块按两个上下相叠的方块写入
                for (i, square) in samples.chunks(w * w).enumerate() {
                    let mut dst = self.pic.picture.planes[c].region_mut(xc, yc + i * w, w, w);
                    dsp.put_pcm(&mut dst, square, w, pcm.bit_depth_chroma, sps.bit_depth_chroma);
                }
            }
        }
        Ok(())
    }
}

fn read_pcm(br: &mut BitReader, count: usize, bit_depth: u32) -> TaoResult<Vec<u16>> {
    let mut samples = Vec::new();
    samples.try_reserve_exact(count)?;
    for _ in 0..count {
        samples.push(br.read_bits(bit_depth)? as u16);
    }
    Ok(samples)
}
