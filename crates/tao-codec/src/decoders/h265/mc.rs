//! 运动补偿: 亮度/色度插值, 单向/双向与加权输出.

use log::warn;

use super::ctu::CtuDecoder;
use super::dsp::{DspKernels, WeightParams};
use super::picture::{MvField, Plane, PlaneView, PredFlag};
use super::refs::DecodedPicture;

/// 亮度 8 抽头窗口: 左上 3 个, 右下 4 个样本
const QPEL_BEFORE: i32 = 3;
const QPEL_AFTER: i32 = 4;
/// 色度 4 抽头窗口
const EPEL_BEFORE: i32 = 1;
const EPEL_AFTER: i32 = 2;

/// 插值窗口是否越过参考平面边缘
fn needs_edge_emulation(x: i32, y: i32, width: usize, height: usize, plane_w: usize, plane_h: usize, before: i32, after: i32) -> bool {
    let (w, h) = (width as i32, height as i32);
    x < before || y < before || x >= plane_w as i32 - w - after || y >= plane_h as i32 - h - after
}

/// 取插值用的参考窗口, 返回 (视图, x, y)
///
/// 窗口越界时先把它复制到 `padded` 并做边缘扩展, 坐标换算到扩展缓冲内.
#[allow(clippy::too_many_arguments)]
fn reference_window<'a>(
    dsp: &dyn DspKernels,
    src: PlaneView<'a>,
    padded: &'a mut Option<Plane>,
    x: i32,
    y: i32,
    width: usize,
    height: usize,
    before: i32,
    after: i32,
) -> (PlaneView<'a>, i32, i32) {
    if !needs_edge_emulation(x, y, width, height, src.width(), src.height(), before, after) {
        return (src, x, y);
    }
    let span = (before + after) as usize;
    let plane = padded.insert(dsp.emulated_edge(&src, x - before, y - before, width + span, height + span));
    (plane.view(), before, before)
}

impl CtuDecoder<'_> {
    /// 对一个 PU 做运动补偿, 缺失参考帧时跳过
    pub(super) fn motion_compensate(&mut self, x0: usize, y0: usize, width: usize, height: usize, mvf: &MvField) {
        if mvf.pred_flag == PredFlag::Intra {
            return;
        }
        let refs = self.refs;
        let mut pics: [Option<&DecodedPicture>; 2] = [None, None];
        for (list, slot) in pics.iter_mut().enumerate() {
            if !mvf.pred_flag.uses(list) {
                continue;
            }
            let entry = usize::try_from(mvf.ref_idx[list])
                .ok()
                .and_then(|idx| refs[list].get(idx));
            let Some(entry) = entry else {
                warn!(
                    "HEVC: 参考帧缺失, list={}, ref_idx={}, 跳过运动补偿",
                    list, mvf.ref_idx[list]
                );
                return;
            };
            let pic = entry.pic.as_ref();
            let row = ((i32::from(mvf.mv[list].y) >> 2) + (y0 + height) as i32 + 9).max(0);
            pic.progress.await_row(row);
            *slot = Some(pic);
        }

        let components = if self.sps.chroma_array_type() != 0 { 3 } else { 1 };
        for c_idx in 0..components {
            self.predict_component(c_idx, x0, y0, width, height, mvf, pics);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn predict_component(
        &mut self,
        c_idx: usize,
        x0: usize,
        y0: usize,
        width: usize,
        height: usize,
        mvf: &MvField,
        pics: [Option<&DecodedPicture>; 2],
    ) {
        let sps = self.sps;
        let dsp = self.dsp;
        let hshift = sps.hshift[c_idx];
        let vshift = sps.vshift[c_idx];
        let xc = (x0 >> hshift) as i32;
        let yc = (y0 >> vshift) as i32;
        let w = width >> hshift;
        let h = height >> vshift;
        let bit_depth = if c_idx == 0 { sps.bit_depth } else { sps.bit_depth_chroma };

        let mut preds: [Vec<i16>; 2] = [Vec::new(), Vec::new()];
        for (list, pic) in pics.iter().enumerate() {
            let Some(pic) = pic else {
                continue;
            };
            let Some(plane) = pic.picture.planes.get(c_idx) else {
                return;
            };
            let mv = mvf.mv[list];
            let (mvx, mvy) = (i32::from(mv.x), i32::from(mv.y));
            let buf = &mut preds[list];
            buf.resize(w * h, 0);
            let mut padded = None;
            if c_idx == 0 {
                let (mx, my) = ((mvx & 3) as u32, (mvy & 3) as u32);
                let (x, y) = (xc + (mvx >> 2), yc + (mvy >> 2));
                let (src, x, y) = reference_window(dsp, plane.view(), &mut padded, x, y, w, h, QPEL_BEFORE, QPEL_AFTER);
                dsp.interpolate_luma(buf, &src, x, y, mx, my, w, h, bit_depth);
            } else {
                let mx = (mvx & ((1 << (2 + hshift)) - 1)) << (1 - hshift);
                let my = (mvy & ((1 << (2 + vshift)) - 1)) << (1 - vshift);
                let x = xc + (mvx >> (2 + hshift));
                let y = yc + (mvy >> (2 + vshift));
                let (src, x, y) = reference_window(dsp, plane.view(), &mut padded, x, y, w, h, EPEL_BEFORE, EPEL_AFTER);
                dsp.interpolate_chroma(buf, &src, x, y, mx as u32, my as u32, w, h, bit_depth);
            }
        }

        let weight = self
            .sh
            .uses_weighted_prediction(self.pps)
            .then(|| self.weight_params(c_idx, mvf, bit_depth));
        let mut dst = self.pic.picture.planes[c_idx].region_mut(xc as usize, yc as usize, w, h);
        match (pics[0].is_some(), pics[1].is_some(), weight) {
            (true, true, None) => dsp.put_bi(&mut dst, &preds[0], &preds[1], w, h, bit_depth),
            (true, true, Some(wp)) => dsp.put_bi_weighted(&mut dst, &preds[0], &preds[1], w, h, bit_depth, &wp),
            (l0, _, None) => {
                let src = if l0 { &preds[0] } else { &preds[1] };
                dsp.put_uni(&mut dst, src, w, h, bit_depth);
            }
            (l0, _, Some(wp)) => {
                let src = if l0 { &preds[0] } else { &preds[1] };
                dsp.put_uni_weighted(&mut dst, src, w, h, bit_depth, &wp);
            }
        }
    }

    /// 显式加权参数; 单向时使用 w0/o0
    fn weight_params(&self, c_idx: usize, mvf: &MvField, bit_depth: u32) -> WeightParams {
        let sps = self.sps;
        let pwt = &self.sh.pwt;
        let denom = if c_idx == 0 {
            pwt.luma_log2_weight_denom
        } else {
            pwt.chroma_log2_weight_denom
        };
        let offset_shift = if sps.high_precision_offsets_enabled { 0 } else { bit_depth - 8 };
        let lookup = |list: usize| -> (i32, i32) {
            let idx = mvf.ref_idx[list].max(0) as usize;
            if c_idx == 0 {
                (pwt.luma_weight[list][idx], pwt.luma_offset[list][idx] << offset_shift)
            } else {
                (
                    pwt.chroma_weight[list][idx][c_idx - 1],
                    pwt.chroma_offset[list][idx][c_idx - 1] << offset_shift,
                )
            }
        };
        let lists: Vec<usize> = (0..2).filter(|&l| mvf.pred_flag.uses(l)).collect();
        let (w0, o0) = lookup(lists.first().copied().unwrap_or(0));
        let (w1, o1) = lists.get(1).map_or((0, 0), |&l| lookup(l));
        WeightParams {
            log2_wd: denom + 14 - bit_depth,
            w0,
            w1,
            o0,
            o1,
        }
    }
}
