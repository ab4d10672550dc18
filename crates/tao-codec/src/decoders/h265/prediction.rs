//! 帧间预测单元: 合并/AMVP 语法, 运动场与运动元数据.

use tao_core::{TaoError, TaoResult};

use super::context::PredMode;
use super::ctu::CtuDecoder;
use super::mvp::PuGeometry;
use super::picture::{Mv, MvField, PredFlag};
use super::slice_header::SliceType;

/// inter_pred_idc
const PRED_L0: u8 = 0;
const PRED_L1: u8 = 1;
const PRED_BI: u8 = 2;

impl CtuDecoder<'_> {
    /// prediction_unit(): 返回 merge_flag
    #[allow(clippy::too_many_arguments)]
    pub(super) fn prediction_unit(
        &mut self,
        x0: usize,
        y0: usize,
        n_pb_w: usize,
        n_pb_h: usize,
        log2_cb_size: u32,
        part_idx: usize,
        ct_depth: u8,
    ) -> TaoResult<bool> {
        let cu = self.lc.cu;
        let geom = PuGeometry {
            x_cb: cu.x as i32,
            y_cb: cu.y as i32,
            n_cb_s: 1 << log2_cb_size,
            x_pb: x0 as i32,
            y_pb: y0 as i32,
            n_pb_w: n_pb_w as i32,
            n_pb_h: n_pb_h as i32,
            part_idx,
            part_mode: cu.part_mode,
        };

        let skip = cu.pred_mode == PredMode::Skip;
        let merge_flag = skip || self.syntax.merge_flag()?;
        let mvf = if merge_flag {
            let max = self.sh.max_num_merge_cand;
            let merge_idx = if max > 1 { self.syntax.merge_idx(max)? } else { 0 };
            if merge_idx >= max.max(1) {
                return Err(TaoError::InvalidData(format!("HEVC: merge_idx 越界: {}", merge_idx)));
            }
            let ctx = self.mvp_context();
            self.mvp.merge_candidate(&ctx, &geom, merge_idx as usize)
        } else {
            self.amvp_mode(&geom, ct_depth)?
        };

        self.pic.motion.fill(x0, y0, n_pb_w, n_pb_h, mvf);

        if let Some(meta) = self.metadata {
            let ref_poc = |list: usize| {
                usize::try_from(mvf.ref_idx[list])
                    .ok()
                    .and_then(|idx| self.refs[list].get(idx))
                    .map_or(0, |e| e.poc)
            };
            let ref_pocs = [ref_poc(0), ref_poc(1)];
            let poc = self.pic.poc;
            meta.write_motion(&mut self.pic.side_planes, x0, y0, n_pb_w, n_pb_h, &mvf, poc, ref_pocs);
        }

        self.motion_compensate(x0, y0, n_pb_w, n_pb_h, &mvf);
        Ok(!skip && merge_flag)
    }

    /// AMVP: inter_pred_idc, ref_idx, mvd 与 mvp 标志
    fn amvp_mode(&mut self, geom: &PuGeometry, ct_depth: u8) -> TaoResult<MvField> {
        let sh = self.sh;
        let n_pb_w = geom.n_pb_w as usize;
        let n_pb_h = geom.n_pb_h as usize;
        let inter_pred_idc = if sh.slice_type == SliceType::B {
            self.syntax.inter_pred_idc(n_pb_w + n_pb_h, ct_depth)?
        } else {
            PRED_L0
        };
        if inter_pred_idc > PRED_BI || (inter_pred_idc == PRED_BI && n_pb_w + n_pb_h == 12) {
            return Err(TaoError::InvalidData(format!(
                "HEVC: 非法 inter_pred_idc={} ({}x{})",
                inter_pred_idc, n_pb_w, n_pb_h
            )));
        }

        let mut mvf = MvField::default();
        let mut uses = [false; 2];
        for list in 0..2 {
            let wanted = match list {
                0 => inter_pred_idc != PRED_L1,
                _ => inter_pred_idc != PRED_L0,
            };
            if !wanted {
                continue;
            }
            let nb_refs = sh.nb_refs[list];
            let ref_idx = if nb_refs > 1 { self.syntax.ref_idx(nb_refs)? as usize } else { 0 };
            if ref_idx >= nb_refs.max(1) {
                return Err(TaoError::InvalidData(format!("HEVC: ref_idx_l{} 越界: {}", list, ref_idx)));
            }
            let mvd = if list == 1 && sh.mvd_l1_zero && inter_pred_idc == PRED_BI {
                Mv::default()
            } else {
                let (x, y) = self.syntax.mvd()?;
                let component = |v: i32| {
                    i16::try_from(v).map_err(|_| TaoError::InvalidData(format!("HEVC: mvd 超出 16 位范围: {}", v)))
                };
                Mv::new(component(x)?, component(y)?)
            };
            let mvp_flag = self.syntax.mvp_flag()?;
            let ctx = self.mvp_context();
            let mvp = self.mvp.amvp_predictor(&ctx, geom, list, ref_idx, mvp_flag);
            mvf.mv[list] = mvp.wrapping_add(mvd);
            mvf.ref_idx[list] = ref_idx as i8;
            uses[list] = true;
        }
        mvf.pred_flag = PredFlag::from_lists(uses[0], uses[1]);
        Ok(mvf)
    }
}
