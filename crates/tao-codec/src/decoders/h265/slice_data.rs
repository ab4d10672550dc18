//! 分片段数据: 子码流定位, 熵解码上下文初始化与 CTU 循环.
//!
//! 入口点偏移以含 emulation prevention 字节的长度表示, 而子码流在去转义后的
//! RBSP 中定位, 因此每个区间都需要扣除落在其中的被移除字节.
//! 启用 WPP 时每行第 2 个 CTB 解码后保存上下文, 下一行行首在右上 CTB
//! 可用时载入. 行的调度在单线程内按顺序进行, [`WppSync`] 记录行进度与中止标志.

use std::ops::Range;

use log::{debug, warn};
use tao_core::{TaoError, TaoResult};

use super::ctu::{CtuDecoder, QuadtreeStatus};
use super::nal::NalUnit;
use super::progress::WppSync;
use super::syntax::ContextInit;

/// 计算各子码流在 RBSP 中的字节区间
///
/// - `data_offset`: 分片头结束处在 RBSP 中的位置 (含 2 字节 NAL 头)
/// - `entry_points`: 入口点偏移 (转义字节计)
/// - `skipped`: 被移除的 0x03 之前那个 0x00 在 RBSP 中的下标, 升序
pub fn substream_ranges(
    rbsp_len: usize,
    data_offset: usize,
    entry_points: &[u32],
    skipped: &[usize],
) -> TaoResult<Vec<Range<usize>>> {
    if data_offset > rbsp_len {
        return Err(TaoError::InvalidData(format!(
            "HEVC: 分片数据起点 {} 超出 NAL 长度 {}",
            data_offset, rbsp_len
        )));
    }
    // 第 k 个被移除字节在转义码流中的位置
    let escaped: Vec<usize> = skipped.iter().enumerate().map(|(k, &p)| p + 1 + k).collect();
    let to_escaped = |r: usize| r + skipped.iter().filter(|&&p| p < r).count();
    let to_rbsp = |e: usize| e - escaped.iter().filter(|&&p| p < e).count();

    let mut ranges = Vec::with_capacity(entry_points.len() + 1);
    let mut start = data_offset;
    let mut escaped_pos = to_escaped(data_offset);
    for (i, &offset) in entry_points.iter().enumerate() {
        escaped_pos += offset as usize;
        let end = to_rbsp(escaped_pos);
        if end > rbsp_len {
            return Err(TaoError::InvalidData(format!(
                "HEVC: 第 {} 个子码流越过 NAL 末尾 ({} > {})",
                i, end, rbsp_len
            )));
        }
        ranges.push(start..end);
        start = end;
    }
    ranges.push(start..rbsp_len);
    Ok(ranges)
}

impl CtuDecoder<'_> {
    /// 解码一个分片段的全部 CTU
    ///
    /// 出错的 CTU 的分片地址被置为 -1, 行同步被中止.
    pub fn decode_slice_data(&mut self, nal: &NalUnit, wpp: &WppSync) -> TaoResult<()> {
        let sps = self.sps;
        let pps = self.pps;
        let sh = self.sh;
        let ctb_count = sps.ctb_count() as usize;
        let start_ts = pps
            .ctb_addr_rs_to_ts
            .get(sh.slice_ctb_addr_rs as usize)
            .copied()
            .ok_or_else(|| TaoError::InvalidData(format!("HEVC: 分片地址越界: {}", sh.slice_ctb_addr_rs)))?
            as usize;

        if sh.dependent_slice_segment {
            if start_ts == 0 {
                return Err(TaoError::InvalidData("HEVC: 依赖分片段位于图像起点".into()));
            }
            let prev_rs = pps.ctb_addr_ts_to_rs[start_ts - 1] as usize;
            if self.side.tab_slice_address[prev_rs] != sh.slice_addr as i32 {
                return Err(TaoError::InvalidData(format!(
                    "HEVC: 依赖分片段与前一分片地址不一致: {} != {}",
                    self.side.tab_slice_address[prev_rs], sh.slice_addr
                )));
            }
        }

        let ranges = substream_ranges(
            nal.rbsp.len(),
            sh.data_offset,
            &sh.entry_point_offset,
            &nal.skipped_bytes_pos,
        )?;
        debug!(
            "HEVC: 分片段 addr={} 起始 ts={} 子码流 {} 个",
            sh.slice_segment_addr,
            start_ts,
            ranges.len()
        );

        self.lc.first_qp_group = !sh.dependent_slice_segment;
        if !pps.cu_qp_delta_enabled {
            self.lc.qp_y = sh.slice_qp;
        }
        self.lc.tu.cu_qp_offset_cb = 0;
        self.lc.tu.cu_qp_offset_cr = 0;

        let result = self.decode_entry(&ranges, nal, start_ts, ctb_count, wpp);
        if result.is_err() {
            wpp.signal_abort();
        }
        result
    }

    fn decode_entry(
        &mut self,
        ranges: &[Range<usize>],
        nal: &NalUnit,
        start_ts: usize,
        ctb_count: usize,
        wpp: &WppSync,
    ) -> TaoResult<()> {
        let pps = self.pps;
        let ctb_width = self.side.ctb_width;
        let mut substream = 0usize;
        self.syntax.start(&nal.rbsp[ranges[0].clone()])?;
        self.init_contexts(start_ts, true);

        let mut ts = start_ts;
        while ts < ctb_count {
            if wpp.is_aborted() {
                return Err(TaoError::InvalidData("HEVC: 行同步已中止".into()));
            }
            let rs = pps.ctb_addr_ts_to_rs[ts] as usize;
            let (col, row) = (rs % ctb_width, rs / ctb_width);

            if ts != start_ts && self.starts_substream(ts) {
                substream += 1;
                let range = ranges.get(substream).ok_or_else(|| {
                    TaoError::InvalidData(format!("HEVC: 入口点不足, 需要第 {} 个子码流", substream))
                })?;
                self.syntax.start(&nal.rbsp[range.clone()])?;
                self.init_contexts(ts, false);
            }

            if pps.entropy_coding_sync_enabled && self.column_in_tile(rs) == 0 && row > 0 && !wpp.await_ctb(row - 1, 2) {
                return Err(TaoError::InvalidData("HEVC: 行同步已中止".into()));
            }

            let status = match self.decode_ctu(ts) {
                Ok(status) => status,
                Err(e) => {
                    self.side.tab_slice_address[rs] = -1;
                    return Err(e);
                }
            };
            ts += 1;

            if pps.entropy_coding_sync_enabled && self.column_in_tile(rs) == 1 {
                self.syntax.save_contexts();
            }
            wpp.report(row, (col + 1) as i32);
            if col + 1 == ctb_width || (ts < ctb_count && pps.ctb_addr_ts_to_rs[ts] as usize / ctb_width != row) {
                wpp.finish_row(row);
            }

            if status == QuadtreeStatus::EndOfSlice {
                break;
            }
            if ts < ctb_count && self.starts_substream(ts) && !self.syntax.end_of_subset_one_bit()? {
                warn!("HEVC: end_of_subset_one_bit 为 0, ts={}", ts);
            }
        }

        debug!("HEVC: 分片段结束于 ts={}", ts);
        Ok(())
    }

    /// 所在 tile 内的 CTB 列号
    fn column_in_tile(&self, ctb_addr_rs: usize) -> usize {
        let pps = self.pps;
        let col = ctb_addr_rs % self.side.ctb_width;
        if !pps.tiles_enabled {
            return col;
        }
        let tile_col = pps.col_idx_x.get(col).copied().unwrap_or(0) as usize;
        col - pps.col_bd.get(tile_col).copied().unwrap_or(0) as usize
    }

    fn tile_start(&self, ts: usize) -> bool {
        ts == 0 || (self.pps.tiles_enabled && self.pps.tile_id[ts] != self.pps.tile_id[ts - 1])
    }

    /// 该 CTB 是否开始一个新的子码流 (tile 起点或 WPP 行首)
    fn starts_substream(&self, ts: usize) -> bool {
        let rs = self.pps.ctb_addr_ts_to_rs[ts] as usize;
        self.tile_start(ts) || (self.pps.entropy_coding_sync_enabled && self.column_in_tile(rs) == 0)
    }

    /// 子码流起点的上下文初始化
    ///
    /// tile 起点总是重置; WPP 行首在右上 CTB 属于同一分片时载入保存的上下文,
    /// 否则重置; 独立分片段起点重置; 依赖分片段沿用上一分片段结束时的上下文.
    fn init_contexts(&mut self, ts: usize, slice_start: bool) {
        let sh = self.sh;
        let pps = self.pps;
        let init = ContextInit {
            slice_type: sh.slice_type,
            cabac_init_flag: sh.cabac_init_flag,
            slice_qp: sh.slice_qp,
        };
        let rs = pps.ctb_addr_ts_to_rs[ts] as usize;
        let ctb_width = self.side.ctb_width;

        if self.tile_start(ts) {
            self.syntax.reset_contexts(&init);
        } else if pps.entropy_coding_sync_enabled && self.column_in_tile(rs) == 0 {
            let row = rs / ctb_width;
            let tr_available = row > 0 && {
                let tr = rs - ctb_width + 1;
                (rs + 1) % ctb_width != 0
                    && self.column_in_tile(tr) == 1
                    && self.side.tab_slice_address[tr] == sh.slice_addr as i32
            };
            if tr_available {
                self.syntax.load_contexts();
            } else {
                self.syntax.reset_contexts(&init);
            }
        } else if slice_start && !sh.dependent_slice_segment {
            self.syntax.reset_contexts(&init);
        }
    }
}
