use tao_core::TaoError;
use tao_core::bitwriter::BitWriter;

use super::super::progress::WppSync;
use super::helpers::*;

fn all_luma(d: &DirectDecode, value: u16) -> bool {
    d.pic.picture.planes[0].data.iter().all(|&v| v == value)
}

#[test]
fn test_单个帧内_cu_不划分() {
    let p = StreamParams::default();
    let mut bw = BitWriter::new();
    write_intra_ctu(&mut bw, true);
    let d = decode_slice_direct(&p, &SliceParams::idr(), &[finish_last(bw)]);
    d.result.as_ref().unwrap();

    assert_eq!(d.side.tab_slice_address, vec![0]);
    assert_eq!(d.side.ct_depth_at(0, 0, 3), 0);
    assert_eq!(d.side.ct_depth_at(15, 15, 3), 0);
    assert_eq!(d.side.qp_y_at(8, 8, 3), 26);
    // 无可用相邻样本时 DC 预测为 1 << (bd - 1)
    assert!(all_luma(&d, 128));
    assert!(d.pic.picture.planes[1].data.iter().all(|&v| v == 128));
    assert_eq!(d.syntax.context_resets, 1);
}

#[test]
fn test_ctb_划分为四个_cu() {
    let p = StreamParams::default();
    let mut bw = BitWriter::new();
    bw.write_bit(1); // split_cu_flag
    for _ in 0..4 {
        write_intra_cu(&mut bw, true);
    }
    bw.write_bit(1); // end_of_slice_segment_flag
    let d = decode_slice_direct(&p, &SliceParams::idr(), &[finish_last(bw)]);
    d.result.as_ref().unwrap();

    for (x, y) in [(0, 0), (8, 0), (0, 8), (15, 15)] {
        assert_eq!(d.side.ct_depth_at(x, y, 3), 1, "({}, {}) 的编码树深度", x, y);
    }
    assert!(all_luma(&d, 128));
}

#[test]
fn test_最小_cb_不读取划分标志() {
    // CTB 等于最小 CB 时 split_cu_flag 推断为 0, 直接进入 part_mode
    let p = StreamParams {
        log2_min_cb: 4,
        log2_diff_max_min_cb: 0,
        ..StreamParams::default()
    };
    let mut bw = BitWriter::new();
    write_intra_cu(&mut bw, true);
    bw.write_bit(1);
    let d = decode_slice_direct(&p, &SliceParams::idr(), &[finish_last(bw)]);
    d.result.as_ref().unwrap();
    assert_eq!(d.side.tab_slice_address, vec![0]);
}

#[test]
fn test_slice_qp_写入_qp_表() {
    let p = StreamParams::default();
    let s = SliceParams {
        slice_qp_delta: 4,
        ..SliceParams::idr()
    };
    let mut bw = BitWriter::new();
    write_intra_ctu(&mut bw, true);
    let d = decode_slice_direct(&p, &s, &[finish_last(bw)]);
    d.result.as_ref().unwrap();
    assert_eq!(d.sh.slice_qp, 30);
    assert_eq!(d.lc.qp_y, 30);
    assert_eq!(d.side.qp_y_at(0, 0, 3), 30);
}

#[test]
fn test_cu_qp_delta_更新量化参数() {
    let p = StreamParams {
        cu_qp_delta: true,
        ..StreamParams::default()
    };
    let mut bw = BitWriter::new();
    bw.write_bit(0); // split_cu_flag
    bw.write_bit(1);
    bw.write_ue(0);
    bw.write_ue(4);
    bw.write_bit(0); // cbf_cb
    bw.write_bit(0); // cbf_cr
    bw.write_bit(1); // cbf_luma
    bw.write_ue(2); // cu_qp_delta_abs
    bw.write_bit(0); // 正号
    bw.write_ue(0); // 零个非零系数
    bw.write_bit(1);
    let d = decode_slice_direct(&p, &SliceParams::idr(), &[finish_last(bw)]);
    d.result.as_ref().unwrap();
    assert_eq!(d.side.qp_y_at(0, 0, 3), 28);
    assert!(all_luma(&d, 128), "全零残差不改变预测");
}

#[test]
fn test_cu_qp_delta_超出范围() {
    let p = StreamParams {
        cu_qp_delta: true,
        ..StreamParams::default()
    };
    let mut bw = BitWriter::new();
    bw.write_bit(0);
    bw.write_bit(1);
    bw.write_ue(0);
    bw.write_ue(4);
    bw.write_bit(0);
    bw.write_bit(0);
    bw.write_bit(1);
    bw.write_ue(26); // 8 bit 时上限为 25
    bw.write_bit(0);
    bw.write_ue(0);
    bw.write_bit(1);
    let d = decode_slice_direct(&p, &SliceParams::idr(), &[finish_last(bw)]);
    let err = d.result.unwrap_err();
    assert!(matches!(err, TaoError::InvalidData(ref msg) if msg.contains("cu_qp_delta")));
    assert_eq!(d.side.tab_slice_address, vec![-1], "出错的 CTB 分片地址应置为 -1");
}

#[test]
fn test_数据提前结束报错() {
    let p = StreamParams::default();
    // 只有 split_cu_flag 与 prev_intra_luma_pred_flag
    let d = decode_slice_direct(&p, &SliceParams::idr(), &[vec![0x40]]);
    assert!(d.result.is_err());
    assert_eq!(d.side.tab_slice_address, vec![-1]);
}

#[test]
fn test_pcm_样本写入图像() {
    let p = StreamParams {
        pcm: true,
        ..StreamParams::default()
    };
    let sample = |c: usize, x: usize, y: usize| (c * 60 + x + y * 3) as u8;
    let mut bw = BitWriter::new();
    write_pcm_ctu(&mut bw, sample);
    let d = decode_slice_direct(&p, &SliceParams::idr(), &[finish_last(bw)]);
    d.result.as_ref().unwrap();

    let planes = &d.pic.picture.planes;
    assert_eq!(planes[0].get(0, 0), 0);
    assert_eq!(planes[0].get(15, 15), 15 + 45);
    assert_eq!(planes[1].get(7, 2), u16::from(sample(1, 7, 2)));
    assert_eq!(planes[2].get(3, 7), u16::from(sample(2, 3, 7)));
    assert!(d.side.is_pcm_at(4, 4));
}

#[test]
fn test_wpp_行首载入上下文() {
    let p = StreamParams {
        width: 32,
        height: 32,
        wpp: true,
        ..StreamParams::default()
    };
    let mut row0 = BitWriter::new();
    write_intra_ctu(&mut row0, false);
    write_intra_ctu(&mut row0, false);
    row0.write_bit(1); // end_of_subset_one_bit
    let mut row1 = BitWriter::new();
    write_intra_ctu(&mut row1, false);
    write_intra_ctu(&mut row1, true);

    let d = decode_slice_direct(&p, &SliceParams::idr(), &[row0.finish(), finish_last(row1)]);
    d.result.as_ref().unwrap();
    assert_eq!(d.sh.entry_point_offset.len(), 1);
    assert_eq!(d.side.tab_slice_address, vec![0, 0, 0, 0]);
    assert_eq!(d.syntax.context_resets, 1, "只有分片起点重置");
    assert_eq!(d.syntax.context_saves, 2, "每行第 2 个 CTB 后保存");
    assert_eq!(d.syntax.context_loads, 1, "第 2 行行首载入");
}

#[test]
fn test_wpp_缺少入口点报错() {
    let p = StreamParams {
        width: 32,
        height: 32,
        wpp: true,
        ..StreamParams::default()
    };
    let mut bw = BitWriter::new();
    write_intra_ctu(&mut bw, false);
    write_intra_ctu(&mut bw, false);
    bw.write_bit(1);
    write_intra_ctu(&mut bw, false);
    write_intra_ctu(&mut bw, true);
    let d = decode_slice_direct(&p, &SliceParams::idr(), &[finish_last(bw)]);
    let err = d.result.unwrap_err();
    assert!(matches!(err, TaoError::InvalidData(ref msg) if msg.contains("入口点")));
}

#[test]
fn test_行同步已中止时停止解码() {
    let p = StreamParams::default();
    let mut bw = BitWriter::new();
    write_intra_ctu(&mut bw, true);
    let sync = WppSync::new(1);
    sync.signal_abort();
    let d = decode_slice_with_sync(&p, &SliceParams::idr(), &[finish_last(bw)], &sync);
    let err = d.result.unwrap_err();
    assert!(matches!(err, TaoError::InvalidData(ref msg) if msg.contains("中止")));
    assert_eq!(d.side.tab_slice_address, vec![-1], "未解码的 CTB 保持无效");
}

#[test]
fn test_中止标志在每个_ctb_前检查() {
    // 无 WPP 的 32x32 分片
    let p = StreamParams {
        width: 32,
        height: 32,
        ..StreamParams::default()
    };
    let mut bw = BitWriter::new();
    for i in 0..4 {
        write_intra_ctu(&mut bw, i == 3);
    }
    let sync = WppSync::new(2);
    sync.signal_abort();
    let d = decode_slice_with_sync(&p, &SliceParams::idr(), &[finish_last(bw)], &sync);
    assert!(d.result.is_err());
    assert!(d.side.tab_slice_address.iter().all(|&a| a == -1));
}
