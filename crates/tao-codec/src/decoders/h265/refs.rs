//! 参考图像管理.
//!
//! - POC 计算 (由 pocTid0 推导 MSB)
//! - 解码图像缓冲 (DPB): 参考标记, RPS 应用, 缺失参考帧生成
//! - 参考列表构建 (含 list modification)
//! - 输出/bumping: 按 POC 顺序输出, 新序列开始时清空旧序列

use std::sync::Arc;

use bitflags::bitflags;
use log::{debug, warn};
use tao_core::{TaoError, TaoResult};

use super::nal::NalUnitType;
use super::params::{MAX_REFS, Sps};
use super::picture::{MotionField, Picture};
use super::progress::FrameProgress;
use super::slice_header::{SliceHeader, SliceType};
use crate::frame::PictureType;

/// DPB 容量上限
pub const MAX_DPB_SIZE: usize = 32;

/// 计算 POC
///
/// prevPocTid0 取低位与高位, 按 lsb 回绕方向调整 MSB. BLA 图像 MSB 恒为 0.
pub fn compute_poc(poc_tid0: i32, log2_max_poc_lsb: u32, poc_lsb: u32, nal_type: NalUnitType) -> i32 {
    let max_poc_lsb = 1i32 << log2_max_poc_lsb;
    let prev_poc_lsb = poc_tid0 % max_poc_lsb;
    let prev_poc_msb = poc_tid0 - prev_poc_lsb;
    let poc_lsb = poc_lsb as i32;

    let mut poc_msb = if poc_lsb < prev_poc_lsb && prev_poc_lsb - poc_lsb >= max_poc_lsb / 2 {
        prev_poc_msb + max_poc_lsb
    } else if poc_lsb > prev_poc_lsb && poc_lsb - prev_poc_lsb > max_poc_lsb / 2 {
        prev_poc_msb - max_poc_lsb
    } else {
        prev_poc_msb
    };
    if nal_type.is_bla() {
        poc_msb = 0;
    }
    poc_msb + poc_lsb
}

// ============================================================
// 解码图像
// ============================================================

/// 一个分片的参考 POC 列表 (供后续图像的时域 MV 预测使用)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SliceRefs {
    pub poc: [Vec<i32>; 2],
    pub is_long_term: [Vec<bool>; 2],
}

/// 已解码 (或正在解码) 的图像
#[derive(Debug)]
pub struct DecodedPicture {
    pub poc: i32,
    pub picture: Picture,
    pub motion: MotionField,
    /// 按分片序号索引
    pub slice_refs: Vec<SliceRefs>,
    /// 每个 CTB (光栅序) 所属的分片序号
    pub ctb_slice_idx: Vec<u16>,
    pub progress: Arc<FrameProgress>,
    pub picture_type: PictureType,
    pub is_keyframe: bool,
    pub pts: i64,
    /// 所有 CTU 都已成功解码
    pub complete: bool,
    /// 元数据侧平面
    pub side_planes: Vec<Vec<u8>>,
    /// 缺失参考时生成的灰帧
    pub generated: bool,
    /// conformance window (左, 右, 上, 下)
    pub conf_win: [u32; 4],
    pub chroma_format_idc: u32,
}

impl DecodedPicture {
    /// 按 SPS 几何分配空图像
    pub fn allocate(sps: &Sps, poc: i32) -> TaoResult<Self> {
        let picture = Picture::new(
            sps.width as usize,
            sps.height as usize,
            sps.plane_count(),
            sps.hshift,
            sps.vshift,
            sps.bit_depth,
            sps.bit_depth_chroma,
        )?;
        let motion = MotionField::new(sps.min_pu_width as usize, sps.min_pu_height as usize)?;
        let mut ctb_slice_idx = Vec::new();
        ctb_slice_idx.try_reserve_exact(sps.ctb_count() as usize)?;
        ctb_slice_idx.resize(sps.ctb_count() as usize, 0);
        Ok(Self {
            poc,
            picture,
            motion,
            slice_refs: Vec::new(),
            ctb_slice_idx,
            progress: Arc::new(FrameProgress::new()),
            picture_type: PictureType::None,
            is_keyframe: false,
            pts: crate::packet::NOPTS_VALUE,
            complete: false,
            side_planes: Vec::new(),
            generated: false,
            conf_win: sps.conf_win,
            chroma_format_idc: sps.chroma_format_idc,
        })
    }

    /// 亮度位置 (x, y) 所在分片的参考信息
    pub fn refs_at(&self, x: usize, y: usize, log2_ctb_size: u32, ctb_width: usize) -> Option<&SliceRefs> {
        let ctb = (y >> log2_ctb_size) * ctb_width + (x >> log2_ctb_size);
        let idx = *self.ctb_slice_idx.get(ctb)? as usize;
        self.slice_refs.get(idx)
    }
}

// ============================================================
// 参考列表
// ============================================================

/// 参考列表中的一项
#[derive(Debug, Clone)]
pub struct RefEntry {
    pub pic: Arc<DecodedPicture>,
    pub poc: i32,
    pub long_term: bool,
}

/// 一个参考列表
#[derive(Debug, Clone, Default)]
pub struct RefPicList {
    pub entries: Vec<RefEntry>,
}

impl RefPicList {
    pub fn get(&self, idx: usize) -> Option<&RefEntry> {
        self.entries.get(idx)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pocs(&self) -> Vec<i32> {
        self.entries.iter().map(|e| e.poc).collect()
    }

    pub fn long_term_flags(&self) -> Vec<bool> {
        self.entries.iter().map(|e| e.long_term).collect()
    }
}

/// RPS 的五个子集
#[derive(Debug, Clone, Default)]
pub struct RpsLists {
    pub st_curr_before: Vec<RefEntry>,
    pub st_curr_after: Vec<RefEntry>,
    pub st_foll: Vec<RefEntry>,
    pub lt_curr: Vec<RefEntry>,
    pub lt_foll: Vec<RefEntry>,
}

impl RpsLists {
    /// 当前图像可用的参考帧数量
    pub fn curr_count(&self) -> usize {
        self.st_curr_before.len() + self.st_curr_after.len() + self.lt_curr.len()
    }
}

/// 由 RPS 构建分片的参考列表
pub fn build_ref_lists(sh: &SliceHeader, rps: &RpsLists) -> TaoResult<[RefPicList; 2]> {
    let mut lists = [RefPicList::default(), RefPicList::default()];
    if sh.slice_type == SliceType::I {
        return Ok(lists);
    }
    if rps.curr_count() == 0 {
        return Err(TaoError::InvalidData("HEVC: RPS 中没有当前图像可用的参考帧".into()));
    }
    for list_idx in 0..sh.slice_type.list_count() {
        let order: [&Vec<RefEntry>; 3] = if list_idx == 0 {
            [&rps.st_curr_before, &rps.st_curr_after, &rps.lt_curr]
        } else {
            [&rps.st_curr_after, &rps.st_curr_before, &rps.lt_curr]
        };
        let target = sh.nb_refs[list_idx].max(1);
        let mut tmp: Vec<RefEntry> = Vec::with_capacity(MAX_REFS);
        while tmp.len() < target {
            for cand in order {
                for entry in cand {
                    if tmp.len() >= MAX_REFS {
                        break;
                    }
                    tmp.push(entry.clone());
                }
            }
            if tmp.len() >= MAX_REFS {
                break;
            }
        }

        let list = &mut lists[list_idx];
        if sh.rpl_modification_flag[list_idx] {
            for i in 0..sh.nb_refs[list_idx] {
                let idx = usize::from(sh.list_entry_lx[list_idx][i]);
                let entry = tmp.get(idx).ok_or_else(|| {
                    TaoError::InvalidData(format!("HEVC: list_entry_l{} 越界, idx={}", list_idx, idx))
                })?;
                list.entries.push(entry.clone());
            }
        } else {
            list.entries.extend(tmp.into_iter().take(sh.nb_refs[list_idx]));
        }
    }
    Ok(lists)
}

// ============================================================
// DPB
// ============================================================

bitflags! {
    /// DPB 中图像的状态
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RefFlags: u8 {
        /// 等待输出
        const OUTPUT = 1 << 0;
        const SHORT_REF = 1 << 1;
        const LONG_REF = 1 << 2;
        /// DPB 满时强制输出
        const BUMPING = 1 << 3;
    }
}

/// DPB 中的一项
#[derive(Debug, Clone)]
pub struct DpbEntry {
    pub pic: Arc<DecodedPicture>,
    pub flags: RefFlags,
    /// 所属解码序列号
    pub sequence: u8,
}

/// 解码图像缓冲
#[derive(Debug, Default)]
pub struct Dpb {
    pub entries: Vec<DpbEntry>,
    /// 当前正在输出的序列
    pub seq_output: u8,
}

impl Dpb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 清除所有参考标记 (IDR 或 SPS 切换)
    pub fn clear_refs(&mut self) {
        for e in &mut self.entries {
            e.flags.remove(RefFlags::SHORT_REF | RefFlags::LONG_REF);
        }
        self.drop_unused();
    }

    /// 清空 DPB
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn drop_unused(&mut self) {
        self.entries.retain(|e| !e.flags.is_empty());
    }

    /// 加入已解码完成的图像
    pub fn insert(&mut self, pic: Arc<DecodedPicture>, flags: RefFlags, sequence: u8) -> TaoResult<()> {
        if self.entries.len() >= MAX_DPB_SIZE {
            return Err(TaoError::InvalidData(format!("HEVC: DPB 已满 ({} 帧)", self.entries.len())));
        }
        self.entries.push(DpbEntry { pic, flags, sequence });
        Ok(())
    }

    fn find_ref(&self, poc: i32, mask: i32, use_msb: bool, cur_poc: i32, sequence: u8) -> Option<usize> {
        self.entries.iter().position(|e| {
            e.sequence == sequence
                && (e.pic.poc & mask) == poc
                && (use_msb || e.pic.poc != cur_poc)
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn add_candidate(
        &mut self,
        sps: &Sps,
        poc: i32,
        flag: RefFlags,
        use_msb: bool,
        cur_poc: i32,
        sequence: u8,
        out: &mut Vec<RefEntry>,
    ) -> TaoResult<()> {
        let mask = if use_msb { -1 } else { (1 << sps.log2_max_poc_lsb) - 1 };
        let idx = match self.find_ref(poc, mask, use_msb, cur_poc, sequence) {
            Some(idx) => idx,
            None => {
                warn!("HEVC: 参考帧缺失, 生成灰帧, poc={}", poc);
                let pic = generate_missing_ref(sps, poc)?;
                self.insert(Arc::new(pic), RefFlags::empty(), sequence)?;
                self.entries.len() - 1
            }
        };
        let entry = &mut self.entries[idx];
        entry.flags.insert(flag);
        out.push(RefEntry {
            pic: entry.pic.clone(),
            poc: entry.pic.poc,
            long_term: flag.contains(RefFlags::LONG_REF),
        });
        Ok(())
    }

    /// 按分片头的 RPS 重新标记参考帧, 返回五个 RPS 子集
    pub fn apply_rps(&mut self, sps: &Sps, sh: &SliceHeader, cur_poc: i32, sequence: u8) -> TaoResult<RpsLists> {
        let mut lists = RpsLists::default();
        let Some(st) = sh.short_term_rps.as_ref() else {
            self.clear_refs();
            return Ok(lists);
        };

        for e in &mut self.entries {
            if e.sequence == sequence {
                e.flags.remove(RefFlags::SHORT_REF | RefFlags::LONG_REF);
            }
        }

        for i in 0..st.num_delta_pocs {
            let poc = cur_poc + st.delta_poc[i];
            let out = if !st.used[i] {
                &mut lists.st_foll
            } else if i < st.num_negative_pics {
                &mut lists.st_curr_before
            } else {
                &mut lists.st_curr_after
            };
            self.add_candidate(sps, poc, RefFlags::SHORT_REF, true, cur_poc, sequence, out)?;
        }

        let lt = &sh.long_term_rps;
        for i in 0..lt.poc.len() {
            let out = if lt.used[i] { &mut lists.lt_curr } else { &mut lists.lt_foll };
            self.add_candidate(sps, lt.poc[i], RefFlags::LONG_REF, lt.poc_msb_present[i], cur_poc, sequence, out)?;
        }

        self.drop_unused();
        debug!(
            "HEVC: RPS poc={} before={} after={} lt={}",
            cur_poc,
            lists.st_curr_before.len(),
            lists.st_curr_after.len(),
            lists.lt_curr.len()
        );
        Ok(lists)
    }

    /// IRAP 且 no_output_of_prior_pics: 丢弃旧序列中等待输出的图像
    pub fn discard_pending_output(&mut self, cur_poc: i32) {
        let seq = self.seq_output;
        for e in &mut self.entries {
            if !e.flags.contains(RefFlags::BUMPING) && e.pic.poc != cur_poc && e.sequence == seq {
                e.flags.remove(RefFlags::OUTPUT);
            }
        }
        self.drop_unused();
    }

    /// DPB 满时标记 bumping, 返回被标记的图像数
    pub fn bump(&mut self, max_dec_pic_buffering: usize, cur_poc: i32, sequence: u8) -> usize {
        let in_use = self
            .entries
            .iter()
            .filter(|e| e.sequence == sequence && !e.flags.is_empty() && e.pic.poc != cur_poc)
            .count();
        if in_use < max_dec_pic_buffering {
            return 0;
        }
        let min_poc = self
            .entries
            .iter()
            .filter(|e| e.sequence == sequence && e.flags.contains(RefFlags::OUTPUT) && e.pic.poc != cur_poc)
            .map(|e| e.pic.poc)
            .min();
        let Some(min_poc) = min_poc else {
            return 0;
        };
        let mut marked = 0;
        for e in &mut self.entries {
            if e.flags.contains(RefFlags::OUTPUT) && e.sequence == sequence && e.pic.poc <= min_poc {
                e.flags.insert(RefFlags::BUMPING);
                marked += 1;
            }
        }
        marked
    }

    /// 取出下一个应输出的图像
    ///
    /// 旧序列的图像总是先全部输出; 当前序列在等待输出的图像多于 `num_reorder` 时
    /// (或存在 bumping 标记, 或 flush) 输出 POC 最小者.
    pub fn output(&mut self, seq_decode: u8, num_reorder: usize, flush: bool) -> Option<Arc<DecodedPicture>> {
        loop {
            let seq = self.seq_output;
            let pending = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.flags.contains(RefFlags::OUTPUT) && e.sequence == seq);
            let mut nb_output = 0;
            let mut bumping = false;
            let mut best: Option<(usize, i32)> = None;
            for (i, e) in pending {
                nb_output += 1;
                bumping |= e.flags.contains(RefFlags::BUMPING);
                if best.is_none_or(|(_, poc)| e.pic.poc < poc) {
                    best = Some((i, e.pic.poc));
                }
            }

            if !flush && seq == seq_decode && nb_output <= num_reorder && !bumping {
                return None;
            }
            if let Some((idx, _)) = best {
                let entry = &mut self.entries[idx];
                entry.flags.remove(RefFlags::OUTPUT | RefFlags::BUMPING);
                let pic = entry.pic.clone();
                self.drop_unused();
                return Some(pic);
            }
            if seq != seq_decode {
                self.seq_output = seq.wrapping_add(1);
            } else {
                return None;
            }
        }
    }
}

/// 生成缺失参考帧: 样本为 1 << (bd - 1), 运动场全为帧内
pub fn generate_missing_ref(sps: &Sps, poc: i32) -> TaoResult<DecodedPicture> {
    let mut pic = DecodedPicture::allocate(sps, poc)?;
    pic.generated = true;
    pic.complete = true;
    pic.progress.finish();
    Ok(pic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_poc_回绕() {
        // max_poc_lsb = 16
        assert_eq!(compute_poc(14, 4, 1, NalUnitType::TrailR), 17);
        assert_eq!(compute_poc(17, 4, 15, NalUnitType::TrailR), 15);
        assert_eq!(compute_poc(5, 4, 7, NalUnitType::TrailR), 7);
        assert_eq!(compute_poc(40, 4, 3, NalUnitType::BlaWLp), 3);
    }

    #[test]
    fn test_compute_poc_负值前驱() {
        // pocTid0 = -3: 截断取余得 lsb = -3, lsb 14 视为向后回绕
        assert_eq!(compute_poc(-3, 4, 14, NalUnitType::TrailR), -2);
    }
}
