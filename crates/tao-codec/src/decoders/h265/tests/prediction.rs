use std::sync::Arc;

use tao_core::TaoError;
use tao_core::bitwriter::BitWriter;

use crate::decoder::Decoder;
use crate::frame::{Frame, VideoFrame};
use crate::packet::Packet;

use super::super::context::{Availability, PartMode};
use super::super::mvp::{MotionPredictor, MvpContext, PuGeometry, SpatialMotionPredictor};
use super::super::nal::NalUnit;
use super::super::params::{Pps, Sps};
use super::super::picture::{MotionField, Mv, MvField, PredFlag};
use super::super::refs::{DecodedPicture, RefEntry, RefPicList, SliceRefs};
use super::super::slice_header::{SliceHeader, SliceParseState, parse_slice_header};
use super::super::{HevcDecoder, HevcDecoderConfig};

use super::helpers::*;

// ============================================================
// 候选构造
// ============================================================

/// 48x48 图像上的预测上下文, 运动场与参考列表由测试填写
struct Fixture {
    sps: Arc<Sps>,
    pps: Pps,
    sh: SliceHeader,
    poc: i32,
    motion: MotionField,
    slice_addr: Vec<i32>,
    refs: [RefPicList; 2],
}

impl Fixture {
    fn new(s: &SliceParams) -> Self {
        let p = StreamParams {
            width: 48,
            height: 48,
            ..StreamParams::default()
        };
        let cache = build_cache(&p);
        let raw = slice_header_nal(&p, s);
        let nal = NalUnit::parse(&raw).expect("分片 NAL 应可解析");
        let mut state = SliceParseState::default();
        let mut sh = parse_slice_header(&nal, &cache, None, &mut state).expect("分片头应可解析");
        sh.max_num_merge_cand = 5;
        let sps = state.active_sps.clone().expect("应激活 SPS");
        let pps = state.active_pps.as_deref().cloned().expect("应激活 PPS");
        let motion = DecodedPicture::allocate(&sps, state.poc).expect("图像分配失败").motion;
        let slice_addr = vec![0; sps.ctb_count() as usize];
        Self {
            sps,
            pps,
            sh,
            poc: state.poc,
            motion,
            slice_addr,
            refs: Default::default(),
        }
    }

    fn with_refs(mut self, l0: &[i32], l1: &[i32]) -> Self {
        for (list, pocs) in [l0, l1].into_iter().enumerate() {
            for &poc in pocs {
                let pic = DecodedPicture::allocate(&self.sps, poc).expect("图像分配失败");
                self.refs[list].entries.push(ref_entry(pic));
            }
        }
        self
    }

    fn ctx(&self) -> MvpContext<'_> {
        MvpContext {
            sps: &self.sps,
            pps: &self.pps,
            sh: &self.sh,
            poc: self.poc,
            motion: &self.motion,
            avail: Availability {
                sps: &self.sps,
                pps: &self.pps,
                tab_slice_address: &self.slice_addr,
            },
            refs: &self.refs,
        }
    }

    fn merge(&self, pu: &PuGeometry, idx: usize) -> MvField {
        SpatialMotionPredictor.merge_candidate(&self.ctx(), pu, idx)
    }

    fn amvp(&self, pu: &PuGeometry, ref_idx: usize, mvp_flag: bool) -> Mv {
        SpatialMotionPredictor.amvp_predictor(&self.ctx(), pu, 0, ref_idx, mvp_flag)
    }
}

fn ref_entry(pic: DecodedPicture) -> RefEntry {
    RefEntry {
        poc: pic.poc,
        pic: Arc::new(pic),
        long_term: false,
    }
}

/// (16, 16) 处 8x8 CU 的 2Nx2N PU; 五个空域相邻位置都位于此前的 CTB 中
fn cu_at_16() -> PuGeometry {
    PuGeometry {
        x_cb: 16,
        y_cb: 16,
        n_cb_s: 8,
        x_pb: 16,
        y_pb: 16,
        n_pb_w: 8,
        n_pb_h: 8,
        part_idx: 0,
        part_mode: PartMode::Part2Nx2N,
    }
}

/// 同一 CU 按 2NxN 划分时的下半 PU (8x4)
fn lower_half_2nxn() -> PuGeometry {
    PuGeometry {
        y_pb: 20,
        n_pb_h: 4,
        part_idx: 1,
        part_mode: PartMode::Part2NxN,
        ..cu_at_16()
    }
}

const A1: (usize, usize) = (12, 20);
const A0: (usize, usize) = (12, 24);
const B0: (usize, usize) = (24, 12);
const B1: (usize, usize) = (20, 12);
const B2: (usize, usize) = (12, 12);

fn put(f: &mut Fixture, at: (usize, usize), mvf: MvField) {
    f.motion.fill(at.0, at.1, 4, 4, mvf);
}

fn l0(x: i16, y: i16) -> MvField {
    MvField {
        pred_flag: PredFlag::L0,
        mv: [Mv::new(x, y), Mv::default()],
        ref_idx: [0, -1],
    }
}

fn l1(x: i16, y: i16) -> MvField {
    MvField {
        pred_flag: PredFlag::L1,
        mv: [Mv::default(), Mv::new(x, y)],
        ref_idx: [-1, 0],
    }
}

fn zero_l0(ref_idx: i8) -> MvField {
    MvField {
        ref_idx: [ref_idx, -1],
        ..l0(0, 0)
    }
}

/// 五个相邻位置各放一个不同的 L0 矢量
fn fill_all_neighbours(f: &mut Fixture) {
    put(f, A1, l0(1, 0));
    put(f, B1, l0(2, 0));
    put(f, B0, l0(3, 0));
    put(f, A0, l0(4, 0));
    put(f, B2, l0(5, 0));
}

#[test]
fn test_合并列表空域顺序() {
    let mut f = Fixture::new(&SliceParams::p_frame(1)).with_refs(&[0], &[]);
    fill_all_neighbours(&mut f);
    let pu = cu_at_16();
    let got: Vec<MvField> = (0..5).map(|i| f.merge(&pu, i)).collect();
    // 前四个都可用时不再检查 B2
    assert_eq!(got, vec![l0(1, 0), l0(2, 0), l0(3, 0), l0(4, 0), zero_l0(0)]);
}

#[test]
fn test_合并列表_b2_补位与去重() {
    let mut f = Fixture::new(&SliceParams::p_frame(1)).with_refs(&[0], &[]);
    put(&mut f, A1, l0(1, 0));
    put(&mut f, B1, l0(1, 0));
    put(&mut f, B2, l0(5, 0));
    let pu = cu_at_16();
    assert_eq!(f.merge(&pu, 0), l0(1, 0));
    assert_eq!(f.merge(&pu, 1), l0(5, 0), "与 A1 相同的 B1 被剔除");
    assert_eq!(f.merge(&pu, 2), zero_l0(0));
}

#[test]
fn test_合并列表零候选遍历参考下标() {
    let mut f = Fixture::new(&SliceParams::p_frame(1)).with_refs(&[0, -1], &[]);
    f.sh.nb_refs[0] = 2;
    let pu = cu_at_16();
    assert_eq!(f.merge(&pu, 0), zero_l0(0));
    assert_eq!(f.merge(&pu, 1), zero_l0(1));
    assert_eq!(f.merge(&pu, 2), zero_l0(0), "参考下标用尽后回到 0");
}

#[test]
fn test_b_分片组合双向候选() {
    let mut f = Fixture::new(&SliceParams::b_frame(4)).with_refs(&[0], &[8]);
    put(&mut f, A1, l0(4, 0));
    put(&mut f, B1, l1(0, 4));
    let pu = cu_at_16();
    assert_eq!(f.merge(&pu, 0), l0(4, 0));
    assert_eq!(f.merge(&pu, 1), l1(0, 4));
    assert_eq!(
        f.merge(&pu, 2),
        MvField {
            pred_flag: PredFlag::Bi,
            mv: [Mv::new(4, 0), Mv::new(0, 4)],
            ref_idx: [0, 0],
        }
    );
    let zero = f.merge(&pu, 3);
    assert_eq!(zero.pred_flag, PredFlag::Bi, "B 分片的零候选为双向");
    assert_eq!(zero.mv, [Mv::default(); 2]);
}

#[test]
fn test_8x4_双向合并候选转为单向() {
    let mut f = Fixture::new(&SliceParams::b_frame(4)).with_refs(&[0], &[8]);
    let bi = MvField {
        pred_flag: PredFlag::Bi,
        mv: [Mv::new(4, 0), Mv::new(0, 4)],
        ref_idx: [0, 0],
    };
    put(&mut f, A1, bi);
    let cand = f.merge(&lower_half_2nxn(), 0);
    assert_eq!(cand.pred_flag, PredFlag::L0);
    assert_eq!(cand.mv[0], Mv::new(4, 0));
    assert_eq!(cand.ref_idx, [0, -1]);

    // 8x8 PU 保持双向
    assert_eq!(f.merge(&cu_at_16(), 0), bi);
}

#[test]
fn test_2nxn_第二个_pu_的合并候选() {
    let mut f = Fixture::new(&SliceParams::p_frame(1)).with_refs(&[0], &[]);
    fill_all_neighbours(&mut f);
    let pu = lower_half_2nxn();
    // B1 落在第一个 PU 内被排除, B0 尚未解码, B2 位置 (15, 19) 为帧内
    assert_eq!(f.merge(&pu, 0), l0(1, 0));
    assert_eq!(f.merge(&pu, 1), l0(4, 0));
    assert_eq!(f.merge(&pu, 2), zero_l0(0));
}

#[test]
fn test_并行合并_8x8_cu_共享候选列表() {
    let mut f = Fixture::new(&SliceParams::p_frame(1)).with_refs(&[0], &[]);
    fill_all_neighbours(&mut f);
    f.pps.log2_parallel_merge_level = 3;
    let pu = lower_half_2nxn();
    // 按整个 CU 构造: A1 B1 B0 A0
    assert_eq!(f.merge(&pu, 1), l0(2, 0));
    assert_eq!(f.merge(&pu, 2), l0(3, 0));
    assert_eq!(f.merge(&pu, 1), f.merge(&cu_at_16(), 1));
}

#[test]
fn test_并行合并区域内的相邻块不可用() {
    let mut f = Fixture::new(&SliceParams::p_frame(1)).with_refs(&[0], &[]);
    fill_all_neighbours(&mut f);
    f.pps.log2_parallel_merge_level = 5;
    let pu = cu_at_16();
    assert_eq!(f.merge(&pu, 0), zero_l0(0));
}

#[test]
fn test_时域合并候选按_poc_距离缩放() {
    let mut f = Fixture::new(&SliceParams::p_frame(4));
    let mut col = DecodedPicture::allocate(&f.sps, 0).unwrap();
    col.motion.fill(16, 16, 16, 16, l0(12, 0));
    col.slice_refs.push(SliceRefs {
        poc: [vec![-8], Vec::new()],
        is_long_term: [vec![false], Vec::new()],
    });
    f.refs[0].entries.push(ref_entry(col));
    f.sh.slice_temporal_mvp_enabled = true;
    f.sh.collocated_list = 0;
    f.sh.collocated_ref_idx = 0;

    // 同位块距离 8, 当前距离 4
    let pu = cu_at_16();
    assert_eq!(f.merge(&pu, 0), l0(6, 0));
    assert_eq!(f.amvp(&pu, 0, false), Mv::new(6, 0));
}

#[test]
fn test_amvp_mvp_flag_选择候选() {
    let mut f = Fixture::new(&SliceParams::p_frame(1)).with_refs(&[0], &[]);
    put(&mut f, A1, l0(8, 0));
    put(&mut f, B1, l0(0, 8));
    let pu = cu_at_16();
    assert_eq!(f.amvp(&pu, 0, false), Mv::new(8, 0));
    assert_eq!(f.amvp(&pu, 0, true), Mv::new(0, 8));
}

#[test]
fn test_amvp_相同候选合并后补零() {
    let mut f = Fixture::new(&SliceParams::p_frame(1)).with_refs(&[0], &[]);
    put(&mut f, A1, l0(8, 0));
    put(&mut f, B1, l0(8, 0));
    let pu = cu_at_16();
    assert_eq!(f.amvp(&pu, 0, false), Mv::new(8, 0));
    assert_eq!(f.amvp(&pu, 0, true), Mv::default());
}

#[test]
fn test_amvp_不同参考图像的候选被缩放() {
    let mut f = Fixture::new(&SliceParams::p_frame(4)).with_refs(&[3, 2], &[]);
    put(&mut f, A1, l0(8, 0));
    // 相邻块参考距离 1, 目标参考距离 2
    assert_eq!(f.amvp(&cu_at_16(), 1, false), Mv::new(16, 0));
    assert_eq!(f.amvp(&cu_at_16(), 0, false), Mv::new(8, 0));
}

// ============================================================
// 帧间解码
// ============================================================

/// 参考图像: 亮度 20 + 2x + y, 色度 60 + x + y
fn ramp(c: usize, x: usize, y: usize) -> u8 {
    if c == 0 { (20 + 2 * x + y) as u8 } else { (60 + x + y) as u8 }
}

fn ref_luma(x: usize, y: usize) -> u8 {
    ramp(0, x.min(47), y.min(47))
}

fn inter_params() -> StreamParams {
    StreamParams {
        width: 48,
        height: 48,
        pcm: true,
        ..StreamParams::default()
    }
}

/// 参数集 + 9 个 PCM CTU 组成的 IDR
fn ramp_idr(p: &StreamParams) -> Vec<u8> {
    let mut bw = BitWriter::new();
    for ctb in 0..9 {
        write_pcm_ctu_at(&mut bw, (ctb % 3) * 16, (ctb / 3) * 16, ctb == 8, ramp);
    }
    let mut nals = parameter_set_nals(p);
    nals.push(slice_nal(p, &SliceParams::idr(), &[finish_last(bw)]));
    annex_b(&nals)
}

/// 第一个 CTU 由 `first` 写出, 其余 CTU 为零 mvd 的 2Nx2N AMVP
fn inter_picture(p: &StreamParams, s: &SliceParams, first: impl FnOnce(&mut BitWriter), rest: AmvpPu) -> Vec<u8> {
    let mut bw = BitWriter::new();
    first(&mut bw);
    for ctb in 1..9 {
        write_inter_ctu(&mut bw, 0, &[rest], s.mvd_l1_zero, ctb == 8);
    }
    annex_b(&[slice_nal(p, s, &[finish_last(bw)])])
}

/// 解码 IDR 与一帧帧间图像, 返回帧间图像
fn decode_pair(p: &StreamParams, inter: Vec<u8>, strict: bool) -> VideoFrame {
    let config = HevcDecoderConfig {
        strict,
        ..HevcDecoderConfig::default()
    };
    let mut dec = HevcDecoder::new(config);
    dec.send_packet(&Packet::from_data(ramp_idr(p))).unwrap();
    dec.send_packet(&Packet::from_data(inter)).unwrap();
    dec.send_packet(&Packet::empty()).unwrap();
    let mut frames = Vec::new();
    loop {
        match dec.receive_frame() {
            Ok(Frame::Video(f)) => frames.push(f),
            Err(TaoError::NeedMoreData) | Err(TaoError::Eof) => break,
            Err(e) => panic!("取帧失败: {}", e),
        }
    }
    assert_eq!(frames.len(), 2);
    assert!(frames[1].complete);
    frames.remove(1)
}

fn luma(f: &VideoFrame, x: usize, y: usize) -> u8 {
    f.data[0][y * f.linesize[0] + x]
}

#[test]
fn test_amvp_整像素运动沿相邻块传播() {
    let p = inter_params();
    let s = SliceParams::p_frame(1);
    // (2, 1) 像素
    let first = |bw: &mut BitWriter| write_inter_ctu(bw, 0, &[AmvpPu::l0((8, 4))], false, false);
    let f = decode_pair(&p, inter_picture(&p, &s, first, AmvpPu::l0((0, 0))), true);
    // 中间 CTU 直接读取参考, 右侧与底部 CTU 的窗口越界走边缘扩展
    for y in 0..48 {
        for x in 0..48 {
            assert_eq!(luma(&f, x, y), ref_luma(x + 2, y + 1), "({}, {})", x, y);
        }
    }
}

#[test]
fn test_越过左上边缘的运动取边缘样本() {
    let p = inter_params();
    let s = SliceParams::p_frame(1);
    // (-8, -8) 像素
    let first = |bw: &mut BitWriter| write_inter_ctu(bw, 0, &[AmvpPu::l0((-32, -32))], false, false);
    let f = decode_pair(&p, inter_picture(&p, &s, first, AmvpPu::l0((0, 0))), true);
    for y in 0..16usize {
        for x in 0..16usize {
            let expect = ramp(0, x.saturating_sub(8), y.saturating_sub(8));
            assert_eq!(luma(&f, x, y), expect, "({}, {})", x, y);
        }
    }
}

#[test]
fn test_半像素亮度插值() {
    let p = inter_params();
    let s = SliceParams::p_frame(1);
    let first = |bw: &mut BitWriter| write_inter_ctu(bw, 0, &[AmvpPu::l0((2, 0))], false, false);
    let f = decode_pair(&p, inter_picture(&p, &s, first, AmvpPu::l0((0, 0))), true);
    // 线性斜坡上半像素位置为两侧均值, 只检查窗口不越界的列
    for y in 0..48 {
        for x in 3..=43 {
            assert_eq!(luma(&f, x, y), ref_luma(x, y) + 1, "({}, {})", x, y);
        }
    }
}

#[test]
fn test_nx2n_第二个_pu_沿用左侧预测子() {
    let p = inter_params();
    let s = SliceParams::p_frame(1);
    let first = |bw: &mut BitWriter| {
        write_inter_ctu(bw, 2, &[AmvpPu::l0((8, 4)), AmvpPu::l0((8, 0))], false, false);
    };
    let f = decode_pair(&p, inter_picture(&p, &s, first, AmvpPu::l0((0, 0))), true);
    for y in 0..16 {
        for x in 0..8 {
            assert_eq!(luma(&f, x, y), ref_luma(x + 2, y + 1));
        }
        for x in 8..16 {
            assert_eq!(luma(&f, x, y), ref_luma(x + 4, y + 1), "左 PU 预测子 + (2, 0) 像素");
        }
    }
}

#[test]
fn test_amp_2nxnu_mvp_flag_取零候选() {
    let p = StreamParams {
        amp: true,
        ..inter_params()
    };
    let s = SliceParams::p_frame(1);
    let lower = AmvpPu {
        mvp_flag: [true, false],
        ..AmvpPu::l0((0, 0))
    };
    let first = |bw: &mut BitWriter| write_inter_ctu(bw, 4, &[AmvpPu::l0((8, 4)), lower], false, false);
    let f = decode_pair(&p, inter_picture(&p, &s, first, AmvpPu::l0((0, 0))), true);
    for x in 0..16 {
        for y in 0..4 {
            assert_eq!(luma(&f, x, y), ref_luma(x + 2, y + 1), "上方 16x4");
        }
        for y in 4..16 {
            assert_eq!(luma(&f, x, y), ref_luma(x, y), "下方 16x12 使用零预测子");
        }
    }
}

#[test]
fn test_b_双向预测取平均() {
    let p = inter_params();
    let s = SliceParams::b_frame(1);
    let bi = AmvpPu {
        inter_pred_idc: Some(2),
        mvd: [(16, 0), (0, 8)],
        mvp_flag: [false; 2],
    };
    let rest = AmvpPu {
        inter_pred_idc: Some(0),
        ..AmvpPu::default()
    };
    let first = |bw: &mut BitWriter| write_inter_ctu(bw, 0, &[bi], false, false);
    let f = decode_pair(&p, inter_picture(&p, &s, first, rest), true);
    for y in 0..16 {
        for x in 0..16 {
            // (ref + 8 + ref + 2) / 2
            assert_eq!(luma(&f, x, y), ref_luma(x, y) + 5, "({}, {})", x, y);
        }
    }
}

#[test]
fn test_mvd_l1_zero_省略_l1_mvd() {
    let p = inter_params();
    let s = SliceParams {
        mvd_l1_zero: true,
        ..SliceParams::b_frame(1)
    };
    let bi = AmvpPu {
        inter_pred_idc: Some(2),
        mvd: [(16, 0), (0, 0)],
        mvp_flag: [false; 2],
    };
    let rest = AmvpPu {
        inter_pred_idc: Some(0),
        ..AmvpPu::default()
    };
    let first = |bw: &mut BitWriter| write_inter_ctu(bw, 0, &[bi], true, false);
    let f = decode_pair(&p, inter_picture(&p, &s, first, rest), true);
    for y in 0..16 {
        for x in 0..16 {
            assert_eq!(luma(&f, x, y), ref_luma(x, y) + 4, "({}, {})", x, y);
        }
    }
}

#[test]
fn test_加权单向预测() {
    let p = StreamParams {
        weighted_pred: true,
        ..inter_params()
    };
    let s = SliceParams {
        weight_denom: 1,
        luma_weight: Some((1, -20)),
        ..SliceParams::p_frame(1)
    };
    let first = |bw: &mut BitWriter| write_inter_ctu(bw, 0, &[AmvpPu::l0((0, 0))], false, false);
    let f = decode_pair(&p, inter_picture(&p, &s, first, AmvpPu::l0((0, 0))), true);
    for y in 0..48 {
        for x in 0..48 {
            // 权重 3/2, 偏移 -20
            let r = u32::from(ref_luma(x, y));
            assert_eq!(u32::from(luma(&f, x, y)), (3 * r + 1) / 2 - 20, "({}, {})", x, y);
        }
    }
    // 色度没有显式权重
    assert_eq!(f.data[1][5 * f.linesize[1] + 3], ramp(1, 3, 5));
}

// ============================================================
// 语法错误
// ============================================================

#[test]
fn test_8x4_双向_amvp_报错() {
    let p = StreamParams::default();
    let mut bw = BitWriter::new();
    bw.write_bit(1); // split_cu_flag
    let bi = AmvpPu {
        inter_pred_idc: Some(2),
        ..AmvpPu::default()
    };
    write_inter_cu(&mut bw, 1, &[bi, bi], false);
    let d = decode_slice_direct(&p, &SliceParams::b_frame(1), &[finish_last(bw)]);
    let err = d.result.unwrap_err();
    assert!(matches!(err, TaoError::InvalidData(ref msg) if msg.contains("非法 inter_pred_idc")));
}

#[test]
fn test_8x4_单向_amvp_写入运动场() {
    let p = StreamParams::default();
    let mut bw = BitWriter::new();
    bw.write_bit(1); // split_cu_flag
    let pu = AmvpPu {
        inter_pred_idc: Some(0),
        mvd: [(6, -2), (0, 0)],
        mvp_flag: [false; 2],
    };
    write_inter_cu(&mut bw, 1, &[pu, pu], false);
    for i in 0..3 {
        bw.write_bit(1); // cu_skip_flag
        if i == 2 {
            bw.write_bit(1); // end_of_slice_segment_flag
        }
    }
    let d = decode_slice_direct(&p, &SliceParams::b_frame(1), &[finish_last(bw)]);
    d.result.as_ref().unwrap();
    let top = d.pic.motion.at(0, 0);
    assert_eq!(top.pred_flag, PredFlag::L0);
    assert_eq!(top.mv[0], Mv::new(6, -2));
    assert_eq!(d.pic.motion.at(4, 4).pred_flag, PredFlag::L0);
}

#[test]
fn test_mvd_超出_16_位报错() {
    let p = StreamParams::default();
    let mut bw = BitWriter::new();
    write_inter_ctu(&mut bw, 0, &[AmvpPu::l0((40_000, 0))], false, true);
    let d = decode_slice_direct(&p, &SliceParams::p_frame(1), &[finish_last(bw)]);
    let err = d.result.unwrap_err();
    assert!(matches!(err, TaoError::InvalidData(ref msg) if msg.contains("mvd")));
    assert_eq!(d.side.tab_slice_address, vec![-1]);
}
