//! 运动矢量预测: 合并候选与 AMVP 预测子.
//!
//! [`MotionPredictor`] 由 CTU 解码器在每个帧间 PU 上调用.
//! [`SpatialMotionPredictor`] 实现标准候选构造:
//! 空域 A1 B1 B0 A0 B2, 时域 (同位图像右下/中心), 组合双向以及零候选.

use super::context::{Availability, PartMode};
use super::params::{Pps, Sps};
use super::picture::{MotionField, Mv, MvField, PredFlag};
use super::refs::{DecodedPicture, RefPicList};
use super::slice_header::{SliceHeader, SliceType};

/// 当前 PU 的几何信息 (亮度坐标)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PuGeometry {
    pub x_cb: i32,
    pub y_cb: i32,
    pub n_cb_s: i32,
    pub x_pb: i32,
    pub y_pb: i32,
    pub n_pb_w: i32,
    pub n_pb_h: i32,
    pub part_idx: usize,
    pub part_mode: PartMode,
}

/// 预测所需的只读上下文
pub struct MvpContext<'a> {
    pub sps: &'a Sps,
    pub pps: &'a Pps,
    pub sh: &'a SliceHeader,
    pub poc: i32,
    /// 当前图像的运动场 (已解码部分)
    pub motion: &'a MotionField,
    pub avail: Availability<'a>,
    pub refs: &'a [RefPicList; 2],
}

impl MvpContext<'_> {
    fn ref_poc(&self, list: usize, idx: i8) -> Option<i32> {
        if idx < 0 {
            return None;
        }
        self.refs[list].get(idx as usize).map(|e| e.poc)
    }

    fn is_long_term(&self, list: usize, idx: i8) -> bool {
        idx >= 0 && self.refs[list].get(idx as usize).is_some_and(|e| e.long_term)
    }

    fn collocated(&self) -> Option<&DecodedPicture> {
        if !self.sh.slice_temporal_mvp_enabled || self.sh.slice_type == SliceType::I {
            return None;
        }
        let entry = self.refs[self.sh.collocated_list].get(self.sh.collocated_ref_idx)?;
        Some(entry.pic.as_ref())
    }

    /// 所有参考图像的 POC 都不大于当前 POC
    fn no_backward_pred(&self) -> bool {
        self.refs.iter().all(|l| l.entries.iter().all(|e| e.poc <= self.poc))
    }

    /// 6.4.2 预测块可用性 (同时排除帧内块)
    fn pu_available(&self, pu: &PuGeometry, x_n: i32, y_n: i32) -> bool {
        let same_cb = pu.x_cb <= x_n && pu.y_cb <= y_n && pu.x_cb + pu.n_cb_s > x_n && pu.y_cb + pu.n_cb_s > y_n;
        let available = if same_cb {
            !(pu.n_pb_w << 1 == pu.n_cb_s
                && pu.n_pb_h << 1 == pu.n_cb_s
                && pu.part_idx == 1
                && pu.y_cb + pu.n_pb_h <= y_n
                && pu.x_cb + pu.n_pb_w > x_n)
        } else {
            self.avail.z_scan(pu.x_pb, pu.y_pb, x_n, y_n)
        };
        available && self.motion.at(x_n as usize, y_n as usize).pred_flag != PredFlag::Intra
    }
}

/// 运动矢量预测接口
pub trait MotionPredictor: Send + Sync {
    /// 合并模式: 返回第 merge_idx 个候选
    fn merge_candidate(&self, ctx: &MvpContext, pu: &PuGeometry, merge_idx: usize) -> MvField;

    /// AMVP: 返回列表 `list` 中参考 `ref_idx` 的预测矢量
    fn amvp_predictor(&self, ctx: &MvpContext, pu: &PuGeometry, list: usize, ref_idx: usize, mvp_flag: bool) -> Mv;
}

/// 标准候选构造的预测器
#[derive(Debug, Clone, Copy, Default)]
pub struct SpatialMotionPredictor;

/// 组合双向候选的 (l0, l1) 下标顺序
const COMB_IDX: [(usize, usize); 12] = [
    (0, 1),
    (1, 0),
    (0, 2),
    (2, 0),
    (1, 2),
    (2, 1),
    (0, 3),
    (3, 0),
    (1, 3),
    (3, 1),
    (2, 3),
    (3, 2),
];

/// 按 POC 距离缩放矢量 (8.5.3.2.8)
pub fn scale_mv(mv: Mv, td: i32, tb: i32) -> Mv {
    let td = td.clamp(-128, 127);
    let tb = tb.clamp(-128, 127);
    if td == 0 {
        return mv;
    }
    let tx = (16384 + (td.abs() >> 1)) / td;
    let factor = ((tb * tx + 32) >> 6).clamp(-4096, 4095);
    let scale = |c: i16| {
        let p = factor * i32::from(c);
        (p.signum() * ((p.abs() + 127) >> 8)).clamp(-32768, 32767) as i16
    };
    Mv::new(scale(mv.x), scale(mv.y))
}

impl SpatialMotionPredictor {
    /// 时域候选 (8.5.3.2.8)
    fn temporal(&self, ctx: &MvpContext, pu: &PuGeometry, list: usize, ref_idx: usize) -> Option<Mv> {
        let col = ctx.collocated()?;
        let sps = ctx.sps;
        let log2_ctb = sps.log2_ctb_size;
        let x_br = pu.x_pb + pu.n_pb_w;
        let y_br = pu.y_pb + pu.n_pb_h;
        if (pu.y_pb >> log2_ctb) == (y_br >> log2_ctb) && y_br < sps.height as i32 && x_br < sps.width as i32 {
            let mv = self.collocated_mv(ctx, col, (x_br >> 4) << 4, (y_br >> 4) << 4, list, ref_idx);
            if mv.is_some() {
                return mv;
            }
        }
        let x_ctr = ((pu.x_pb + (pu.n_pb_w >> 1)) >> 4) << 4;
        let y_ctr = ((pu.y_pb + (pu.n_pb_h >> 1)) >> 4) << 4;
        self.collocated_mv(ctx, col, x_ctr, y_ctr, list, ref_idx)
    }

    fn collocated_mv(&self, ctx: &MvpContext, col: &DecodedPicture, x: i32, y: i32, list: usize, ref_idx: usize) -> Option<Mv> {
        let (x, y) = (x as usize, y as usize);
        if (x >> 2) >= col.motion.width || (y >> 2) >= col.motion.height {
            return None;
        }
        let cell = col.motion.at(x, y);
        let list_col = match cell.pred_flag {
            PredFlag::Intra => return None,
            PredFlag::L1 => 1,
            PredFlag::L0 => 0,
            PredFlag::Bi => {
                if ctx.no_backward_pred() {
                    list
                } else {
                    // 与 collocated_from_l0_flag 相同的列表
                    1 - ctx.sh.collocated_list
                }
            }
        };
        let col_refs = col.refs_at(x, y, ctx.sps.log2_ctb_size, ctx.sps.ctb_width as usize)?;
        let col_ref_idx = usize::try_from(cell.ref_idx[list_col]).ok()?;
        let col_ref_poc = *col_refs.poc[list_col].get(col_ref_idx)?;
        let col_lt = col_refs.is_long_term[list_col].get(col_ref_idx).copied().unwrap_or(false);
        let cur = ctx.refs[list].get(ref_idx)?;
        if cur.long_term != col_lt {
            return None;
        }
        let mv_col = cell.mv[list_col];
        let col_diff = col.poc - col_ref_poc;
        let cur_diff = ctx.poc - cur.poc;
        if cur.long_term || col_diff == cur_diff {
            Some(mv_col)
        } else {
            Some(scale_mv(mv_col, col_diff, cur_diff))
        }
    }

    fn spatial_merge(&self, ctx: &MvpContext, pu: &PuGeometry, out: &mut Vec<MvField>) {
        let plevel = ctx.pps.log2_parallel_merge_level;
        let same_region = |x_n: i32, y_n: i32| (pu.x_pb >> plevel) == (x_n >> plevel) && (pu.y_pb >> plevel) == (y_n >> plevel);
        let fetch = |x_n: i32, y_n: i32| -> Option<MvField> {
            if same_region(x_n, y_n) || !ctx.pu_available(pu, x_n, y_n) {
                return None;
            }
            Some(*ctx.motion.at(x_n as usize, y_n as usize))
        };

        let (x, y, w, h) = (pu.x_pb, pu.y_pb, pu.n_pb_w, pu.n_pb_h);
        let vertical_second = pu.part_idx == 1
            && matches!(pu.part_mode, PartMode::PartNx2N | PartMode::PartnLx2N | PartMode::PartnRx2N);
        let horizontal_second = pu.part_idx == 1
            && matches!(pu.part_mode, PartMode::Part2NxN | PartMode::Part2NxnU | PartMode::Part2NxnD);

        let a1 = if vertical_second { None } else { fetch(x - 1, y + h - 1) };
        let b1 = if horizontal_second {
            None
        } else {
            fetch(x + w - 1, y - 1).filter(|b| a1 != Some(*b))
        };
        let b0 = fetch(x + w, y - 1).filter(|c| b1 != Some(*c));
        let a0 = fetch(x - 1, y + h).filter(|c| a1 != Some(*c));
        let count = [a1, b1, b0, a0].iter().filter(|c| c.is_some()).count();
        let b2 = if count == 4 {
            None
        } else {
            fetch(x - 1, y - 1).filter(|c| a1 != Some(*c) && b1 != Some(*c))
        };
        out.extend([a1, b1, b0, a0, b2].into_iter().flatten());
    }

    fn merge_list(&self, ctx: &MvpContext, pu: &PuGeometry) -> Vec<MvField> {
        let max = ctx.sh.max_num_merge_cand as usize;
        let mut list = Vec::with_capacity(max.max(1));
        self.spatial_merge(ctx, pu, &mut list);

        if ctx.sh.slice_temporal_mvp_enabled && list.len() < max {
            let l0 = self.temporal(ctx, pu, 0, 0);
            let l1 = if ctx.sh.slice_type == SliceType::B {
                self.temporal(ctx, pu, 1, 0)
            } else {
                None
            };
            if l0.is_some() || l1.is_some() {
                list.push(MvField {
                    pred_flag: PredFlag::from_lists(l0.is_some(), l1.is_some()),
                    mv: [l0.unwrap_or_default(), l1.unwrap_or_default()],
                    ref_idx: [if l0.is_some() { 0 } else { -1 }, if l1.is_some() { 0 } else { -1 }],
                });
            }
        }
        list.truncate(max);

        let num_orig = list.len();
        if ctx.sh.slice_type == SliceType::B && num_orig > 1 && num_orig < max {
            for &(i0, i1) in COMB_IDX.iter().take(num_orig * (num_orig - 1)) {
                if list.len() >= max {
                    break;
                }
                let l0 = list[i0];
                let l1 = list[i1];
                if l0.pred_flag.uses(0)
                    && l1.pred_flag.uses(1)
                    && (ctx.ref_poc(0, l0.ref_idx[0]) != ctx.ref_poc(1, l1.ref_idx[1]) || l0.mv[0] != l1.mv[1])
                {
                    list.push(MvField {
                        pred_flag: PredFlag::Bi,
                        mv: [l0.mv[0], l1.mv[1]],
                        ref_idx: [l0.ref_idx[0], l1.ref_idx[1]],
                    });
                }
            }
        }

        let num_ref_idx = if ctx.sh.slice_type == SliceType::P {
            ctx.sh.nb_refs[0]
        } else {
            ctx.sh.nb_refs[0].min(ctx.sh.nb_refs[1])
        };
        let mut zero_idx = 0usize;
        while list.len() < max {
            let ref_idx = if zero_idx < num_ref_idx { zero_idx as i8 } else { 0 };
            list.push(if ctx.sh.slice_type == SliceType::P {
                MvField {
                    pred_flag: PredFlag::L0,
                    mv: [Mv::default(); 2],
                    ref_idx: [ref_idx, -1],
                }
            } else {
                MvField {
                    pred_flag: PredFlag::Bi,
                    mv: [Mv::default(); 2],
                    ref_idx: [ref_idx, ref_idx],
                }
            });
            zero_idx += 1;
        }
        list
    }

    /// AMVP 的空域候选: 先找同一参考图像, 再找可缩放的候选
    fn amvp_spatial(&self, ctx: &MvpContext, pu: &PuGeometry, list: usize, ref_idx: usize) -> (Option<Mv>, Option<Mv>) {
        let (x, y, w, h) = (pu.x_pb, pu.y_pb, pu.n_pb_w, pu.n_pb_h);
        let target_poc = ctx.ref_poc(list, ref_idx as i8);
        let target_lt = ctx.is_long_term(list, ref_idx as i8);
        let other = 1 - list;

        let fetch = |x_n: i32, y_n: i32| -> Option<MvField> {
            ctx.pu_available(pu, x_n, y_n).then(|| *ctx.motion.at(x_n as usize, y_n as usize))
        };
        let same_pic = |c: &MvField| -> Option<Mv> {
            for l in [list, other] {
                if c.pred_flag.uses(l) && ctx.ref_poc(l, c.ref_idx[l]) == target_poc {
                    return Some(c.mv[l]);
                }
            }
            None
        };
        let scaled = |c: &MvField| -> Option<Mv> {
            for l in [list, other] {
                if c.pred_flag.uses(l) && ctx.is_long_term(l, c.ref_idx[l]) == target_lt {
                    let mv = c.mv[l];
                    let (Some(n_poc), Some(t_poc)) = (ctx.ref_poc(l, c.ref_idx[l]), target_poc) else {
                        return Some(mv);
                    };
                    if target_lt || n_poc == t_poc {
                        return Some(mv);
                    }
                    return Some(scale_mv(mv, ctx.poc - n_poc, ctx.poc - t_poc));
                }
            }
            None
        };

        let a = [fetch(x - 1, y + h), fetch(x - 1, y + h - 1)];
        let is_scaled = a.iter().any(Option::is_some);
        let mut mv_a = a.iter().flatten().find_map(same_pic);
        if mv_a.is_none() {
            mv_a = a.iter().flatten().find_map(scaled);
        }

        let b = [fetch(x + w, y - 1), fetch(x + w - 1, y - 1), fetch(x - 1, y - 1)];
        let mut mv_b = b.iter().flatten().find_map(same_pic);
        if !is_scaled {
            if mv_a.is_none() && mv_b.is_some() {
                mv_a = mv_b;
            }
            mv_b = b.iter().flatten().find_map(scaled);
        }
        (mv_a, mv_b)
    }
}

impl MotionPredictor for SpatialMotionPredictor {
    fn merge_candidate(&self, ctx: &MvpContext, pu: &PuGeometry, merge_idx: usize) -> MvField {
        let orig_w = pu.n_pb_w;
        let orig_h = pu.n_pb_h;
        // 并行合并: 8x8 CU 的所有 PU 共享 2Nx2N 候选列表
        let geom = if ctx.pps.log2_parallel_merge_level > 2 && pu.n_cb_s == 8 {
            PuGeometry {
                x_pb: pu.x_cb,
                y_pb: pu.y_cb,
                n_pb_w: pu.n_cb_s,
                n_pb_h: pu.n_cb_s,
                part_idx: 0,
                ..*pu
            }
        } else {
            *pu
        };
        let list = self.merge_list(ctx, &geom);
        let mut cand = list.get(merge_idx).copied().unwrap_or_default();
        if cand.pred_flag == PredFlag::Bi && orig_w + orig_h == 12 {
            cand.pred_flag = PredFlag::L0;
            cand.ref_idx[1] = -1;
        }
        cand
    }

    fn amvp_predictor(&self, ctx: &MvpContext, pu: &PuGeometry, list: usize, ref_idx: usize, mvp_flag: bool) -> Mv {
        let (mv_a, mv_b) = self.amvp_spatial(ctx, pu, list, ref_idx);
        let mut cands: Vec<Mv> = Vec::with_capacity(3);
        match (mv_a, mv_b) {
            (Some(a), Some(b)) if a == b => cands.push(a),
            (a, b) => cands.extend(a.into_iter().chain(b)),
        }
        if cands.len() < 2
            && let Some(col) = self.temporal(ctx, pu, list, ref_idx)
        {
            cands.push(col);
        }
        cands.resize(2, Mv::default());
        cands[usize::from(mvp_flag)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_mv_同距离不变() {
        let mv = Mv::new(12, -7);
        assert_eq!(scale_mv(mv, 2, 2), mv);
    }

    #[test]
    fn test_scale_mv_距离减半() {
        // td = 4, tb = 2: tx = 4096, factor = 128, mv/2
        assert_eq!(scale_mv(Mv::new(16, -16), 4, 2), Mv::new(8, -8));
    }

    #[test]
    fn test_scale_mv_反向() {
        assert_eq!(scale_mv(Mv::new(8, 0), 1, -1), Mv::new(-8, 0));
    }
}
