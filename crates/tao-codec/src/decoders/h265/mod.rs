//! H.265/HEVC 视频解码器.
//!
//! 解码核心按访问单元处理 NAL 序列:
//! - 参数集 (VPS/SPS/PPS) 解析后存入 [`params::ParameterSetCache`]
//! - 分片段头解析, 首个分片段启动新图像 (RPS, DPB, 侧表分配)
//! - 分片数据按子码流 (tile / WPP 行) 解码 CTU, 语法元素来自 [`syntax::SyntaxReader`]
//! - 图像结束时执行去块滤波与 SAO, 放入 DPB, 按 POC 顺序输出
//!
//! 熵解码, DSP 与运动矢量预测都是可替换的协作者 (trait 对象),
//! 默认使用 [`syntax::RawSyntaxReader`], [`dsp::ReferenceDsp`] 与
//! [`mvp::SpatialMotionPredictor`].
//!
//! # 错误处理
//! 严格模式下任何分片错误都从 `send_packet` 返回;
//! 宽松模式下记录警告并继续处理下一个 NAL, 出错的图像标记为不完整.

mod coding_tree;
pub mod config;
pub mod context;
pub mod ctu;
pub mod dsp;
pub mod filter;
mod intra;
mod mc;
pub mod metadata;
pub mod mvp;
pub mod nal;
pub mod params;
pub mod picture;
mod prediction;
pub mod progress;
pub mod refs;
pub mod slice_data;
pub mod slice_header;
pub mod syntax;
pub mod tables;
mod transform_tree;
#[cfg(test)]
mod tests;

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, warn};
use tao_core::{PixelFormat, TaoError, TaoResult};

use crate::decoder::Decoder;
use crate::frame::{Frame, PictureType, VideoFrame};
use crate::packet::Packet;

pub use config::{HevcDecoderConfig, MetadataLayout};

use context::{LocalContext, SideArrays};
use ctu::CtuDecoder;
use dsp::{DspKernels, ReferenceDsp};
use filter::LoopFilter;
use metadata::MetadataWriter;
use mvp::{MotionPredictor, SpatialMotionPredictor};
use nal::{NalUnit, NalUnitType, parse_hvcc_config, split_annex_b, split_length_prefixed};
use params::{ParameterSetCache, Pps, Sps};
use progress::WppSync;
use refs::{DecodedPicture, Dpb, RefFlags, RefPicList, RpsLists, SliceRefs, build_ref_lists};
use slice_header::{SliceHeader, SliceParseState, SliceType, parse_slice_header};
use syntax::{RawSyntaxReader, SyntaxReader};

// ============================================================
// 当前图像
// ============================================================

/// 正在解码的图像及其参数
struct CurrentPicture {
    pic: DecodedPicture,
    sps: Arc<Sps>,
    pps: Arc<Pps>,
    rps: RpsLists,
    metadata: Option<MetadataWriter>,
    /// pic_output_flag
    output: bool,
    sequence: u8,
    /// 有分片解码失败
    failed: bool,
    /// 整帧共享的行进度, 各分片段沿用
    wpp: WppSync,
}

// ============================================================
// 解码器
// ============================================================

/// HEVC 解码器
pub struct HevcDecoder {
    config: HevcDecoderConfig,
    params: ParameterSetCache,
    state: SliceParseState,
    dpb: Dpb,
    current: Option<CurrentPicture>,
    /// 上一个独立分片段的头 (依赖分片段继承其字段)
    prev_sh: Option<SliceHeader>,
    /// 当前图像的 RASL 被跳过, 其余分片段一并忽略
    skipping_picture: bool,
    side: SideArrays,
    side_sps: Option<Arc<Sps>>,
    lc: LocalContext,
    syntax: Box<dyn SyntaxReader>,
    dsp: Box<dyn DspKernels>,
    mvp: Box<dyn MotionPredictor>,
    length_size: Option<usize>,
    output_queue: VecDeque<Frame>,
    flushing: bool,
    frame_count: u64,
}

impl HevcDecoder {
    /// 创建默认配置的 HEVC 解码器实例
    pub fn create() -> TaoResult<Box<dyn Decoder>> {
        Ok(Box::new(Self::new(HevcDecoderConfig::default())))
    }

    /// 按配置创建, 使用默认协作者
    pub fn new(config: HevcDecoderConfig) -> Self {
        Self::with_components(
            config,
            Box::new(RawSyntaxReader::new()),
            Box::new(ReferenceDsp::new()),
            Box::new(SpatialMotionPredictor),
        )
    }

    /// 指定熵解码, DSP 与运动矢量预测实现
    pub fn with_components(
        config: HevcDecoderConfig,
        syntax: Box<dyn SyntaxReader>,
        dsp: Box<dyn DspKernels>,
        mvp: Box<dyn MotionPredictor>,
    ) -> Self {
        let state = SliceParseState {
            strict: config.strict,
            ..SliceParseState::default()
        };
        Self {
            length_size: config.nal_length_size,
            config,
            params: ParameterSetCache::default(),
            state,
            dpb: Dpb::new(),
            current: None,
            prev_sh: None,
            skipping_picture: false,
            side: SideArrays::default(),
            side_sps: None,
            lc: LocalContext::default(),
            syntax,
            dsp,
            mvp,
            output_queue: VecDeque::new(),
            flushing: false,
            frame_count: 0,
        }
    }

    /// 当前配置
    pub fn config(&self) -> &HevcDecoderConfig {
        &self.config
    }

    /// 参数集缓存
    pub fn parameter_sets(&self) -> &ParameterSetCache {
        &self.params
    }

    /// 已输出的帧数
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// 按错误策略处理单个 NAL 的结果
    fn check(&self, result: TaoResult<()>, what: &str) -> TaoResult<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_recoverable() => {
                warn!("HEVC: {} 跳过不支持的特性: {}", what, e);
                Ok(())
            }
            Err(e) if self.config.strict => Err(e),
            Err(e) => {
                warn!("HEVC: {} 解码失败, 继续: {}", what, e);
                Ok(())
            }
        }
    }

    // ========================================================
    // NAL 分发
    // ========================================================

    fn decode_nal(&mut self, nal: &NalUnit, pts: i64) -> TaoResult<()> {
        if nal.layer_id != 0 {
            debug!("HEVC: 跳过 nuh_layer_id={} 的 NAL {:?}", nal.layer_id, nal.nal_type);
            return Ok(());
        }
        match nal.nal_type {
            NalUnitType::Vps => {
                self.params.insert_vps(nal.payload())?;
            }
            NalUnitType::Sps => {
                let sps = self.params.insert_sps(nal.payload())?;
                debug!(
                    "HEVC: SPS id={} {}x{} chroma_format_idc={} bit_depth={}",
                    sps.sps_id, sps.width, sps.height, sps.chroma_format_idc, sps.bit_depth
                );
            }
            NalUnitType::Pps => {
                self.params.insert_pps(nal.payload())?;
            }
            NalUnitType::Eos | NalUnitType::Eob => {
                self.finish_picture()?;
                self.state.seq_decode = self.state.seq_decode.wrapping_add(1);
                self.state.max_ra = i32::MAX;
                self.state.last_eos = true;
            }
            NalUnitType::Aud | NalUnitType::PrefixSei | NalUnitType::SuffixSei | NalUnitType::FillerData => {}
            t if t.is_slice() => self.decode_slice_nal(nal, pts)?,
            t => debug!("HEVC: 跳过 NAL 类型 {:?}", t),
        }
        Ok(())
    }

    fn decode_slice_nal(&mut self, nal: &NalUnit, pts: i64) -> TaoResult<()> {
        let sh = match parse_slice_header(nal, &self.params, self.prev_sh.as_ref(), &mut self.state) {
            Ok(sh) => sh,
            Err(e) => {
                if let Some(cur) = self.current.as_mut() {
                    cur.failed = true;
                }
                return Err(e);
            }
        };
        if !sh.dependent_slice_segment {
            self.prev_sh = Some(sh.clone());
        }

        if sh.first_slice_in_pic {
            self.finish_picture()?;
            if self.skip_random_access_leading(nal.nal_type) {
                debug!("HEVC: 跳过 RASL 图像 poc={}", self.state.poc);
                self.skipping_picture = true;
                return Ok(());
            }
            self.skipping_picture = false;
            self.frame_start(nal, &sh, pts)?;
        } else if self.skipping_picture {
            return Ok(());
        }

        if self.current.is_none() {
            warn!("HEVC: 缺少图像的首个分片段, 忽略分片 addr={}", sh.slice_segment_addr);
            return Ok(());
        }
        self.decode_slice(nal, &sh)
    }

    /// RASL 跳过判断, 同时维护随机接入点 POC
    fn skip_random_access_leading(&mut self, nal_type: NalUnitType) -> bool {
        let poc = self.state.poc;
        if self.state.max_ra == i32::MAX {
            if nal_type == NalUnitType::Cra || nal_type.is_bla() {
                self.state.max_ra = poc;
            } else if nal_type.is_idr() {
                self.state.max_ra = i32::MIN;
            }
        }
        if nal_type.is_rasl() && poc <= self.state.max_ra {
            return self.config.skip_rasl;
        }
        if nal_type == NalUnitType::RaslR && poc > self.state.max_ra {
            self.state.max_ra = i32::MIN;
        }
        false
    }

    // ========================================================
    // 图像开始 / 结束
    // ========================================================

    fn frame_start(&mut self, nal: &NalUnit, sh: &SliceHeader, pts: i64) -> TaoResult<()> {
        let sps = self
            .state
            .active_sps
            .clone()
            .ok_or_else(|| TaoError::InvalidData("HEVC: 没有激活的 SPS".into()))?;
        let pps = self
            .state
            .active_pps
            .clone()
            .ok_or_else(|| TaoError::InvalidData("HEVC: 没有激活的 PPS".into()))?;
        let poc = self.state.poc;
        let sequence = self.state.seq_decode;
        let nal_type = nal.nal_type;

        if self.state.clear_refs {
            self.dpb.clear_refs();
        }
        if self.side_sps.as_ref().is_some_and(|s| Arc::ptr_eq(s, &sps)) {
            self.side.reset_for_picture();
        } else {
            self.side = SideArrays::allocate(&sps)?;
            self.side_sps = Some(sps.clone());
        }

        let mut pic = DecodedPicture::allocate(&sps, poc)?;
        pic.pts = pts;
        pic.is_keyframe = nal_type.is_irap();
        pic.picture_type = match sh.slice_type {
            SliceType::I => PictureType::I,
            SliceType::P => PictureType::P,
            SliceType::B => PictureType::B,
        };

        let metadata = self.config.export_metadata.then(|| {
            MetadataWriter::new(
                self.config.metadata_layout,
                sps.width as usize,
                sps.height as usize,
                sps.ctb_count() as usize,
                sps.hshift,
                sps.vshift,
            )
        });
        if let Some(meta) = metadata {
            pic.side_planes = meta.allocate()?;
            meta.write_header(&mut pic.side_planes, sh.slice_type);
        }

        let no_rasl_output =
            nal_type.is_idr() || nal_type.is_bla() || (nal_type == NalUnitType::Cra && self.state.last_eos);
        if nal_type.is_irap() && no_rasl_output && sh.no_output_of_prior_pics {
            self.dpb.discard_pending_output(poc);
        }
        self.state.last_eos = false;

        let rps = match self.dpb.apply_rps(&sps, sh, poc, sequence) {
            Ok(rps) => rps,
            Err(e) => {
                pic.progress.abort();
                return Err(e);
            }
        };

        debug!(
            "HEVC: 图像开始 poc={} 类型={:?} nal={:?} seq={}",
            poc, sh.slice_type, nal_type, sequence
        );
        let wpp = WppSync::new(sps.ctb_height as usize);
        self.current = Some(CurrentPicture {
            pic,
            sps,
            pps,
            rps,
            metadata,
            output: sh.pic_output_flag,
            sequence,
            failed: false,
            wpp,
        });
        Ok(())
    }

    fn decode_slice(&mut self, nal: &NalUnit, sh: &SliceHeader) -> TaoResult<()> {
        let Some(cur) = self.current.as_mut() else {
            return Ok(());
        };
        let refs: [RefPicList; 2] = match build_ref_lists(sh, &cur.rps) {
            Ok(refs) => refs,
            Err(e) => {
                cur.failed = true;
                return Err(e);
            }
        };
        let slice_idx = self.state.slice_idx as usize;
        if cur.pic.slice_refs.len() <= slice_idx {
            cur.pic.slice_refs.resize(slice_idx + 1, SliceRefs::default());
        }
        cur.pic.slice_refs[slice_idx] = SliceRefs {
            poc: [refs[0].pocs(), refs[1].pocs()],
            is_long_term: [refs[0].long_term_flags(), refs[1].long_term_flags()],
        };

        let ctb_width = cur.sps.ctb_width as usize;
        cur.wpp.begin_segment(sh.slice_ctb_addr_rs as usize / ctb_width.max(1));
        let mut ctu = CtuDecoder {
            sps: &cur.sps,
            pps: &cur.pps,
            sh,
            pic: &mut cur.pic,
            side: &mut self.side,
            refs: &refs,
            syntax: self.syntax.as_mut(),
            dsp: self.dsp.as_ref(),
            mvp: self.mvp.as_ref(),
            metadata: cur.metadata,
            lc: &mut self.lc,
            slice_idx: slice_idx as u16,
        };
        let result = ctu.decode_slice_data(nal, &cur.wpp);
        if result.is_err() {
            cur.failed = true;
        }
        result
    }

    /// 环路滤波, 放入 DPB 并输出就绪的图像
    fn finish_picture(&mut self) -> TaoResult<()> {
        let Some(mut cur) = self.current.take() else {
            return Ok(());
        };
        let filter = LoopFilter {
            sps: &cur.sps,
            pps: &cur.pps,
            side: &self.side,
            dsp: self.dsp.as_ref(),
        };
        let parallel = self.config.threads > 1;
        filter.deblock(&mut cur.pic.picture, parallel);
        filter.sao(&mut cur.pic.picture, parallel);

        let decoded_all = self.side.tab_slice_address.iter().all(|&a| a >= 0);
        cur.pic.complete = !cur.failed && decoded_all;
        if !cur.pic.complete {
            warn!("HEVC: 图像 poc={} 解码不完整", cur.pic.poc);
        }
        cur.pic.progress.finish();

        let poc = cur.pic.poc;
        let layer = cur.sps.highest_sub_layer();
        let max_dec = layer.max_dec_pic_buffering as usize;
        let num_reorder = layer.num_reorder_pics as usize;
        let mut flags = RefFlags::SHORT_REF;
        if cur.output {
            flags |= RefFlags::OUTPUT;
        }
        self.dpb.insert(Arc::new(cur.pic), flags, cur.sequence)?;
        self.dpb.bump(max_dec, poc, cur.sequence);
        self.output_pictures(num_reorder, false);
        Ok(())
    }

    fn output_pictures(&mut self, num_reorder: usize, flush: bool) {
        while let Some(pic) = self.dpb.output(self.state.seq_decode, num_reorder, flush) {
            debug!("HEVC: 输出 poc={}", pic.poc);
            self.output_queue.push_back(Frame::Video(picture_to_frame(&pic)));
            self.frame_count += 1;
        }
    }

    fn split_nals<'d>(&self, data: &'d [u8]) -> TaoResult<Vec<&'d [u8]>> {
        match self.length_size {
            Some(size) => split_length_prefixed(data, size),
            None => Ok(split_annex_b(data)),
        }
    }
}

/// 把解码图像转为输出帧 (应用 conformance window)
pub fn picture_to_frame(pic: &DecodedPicture) -> VideoFrame {
    let picture = &pic.picture;
    let [left, right, top, bottom] = pic.conf_win.map(|v| v as usize);
    let luma = &picture.planes[0];
    let width = luma.width.saturating_sub(left + right);
    let height = luma.height.saturating_sub(top + bottom);
    let pixel_format = PixelFormat::from_chroma_format(pic.chroma_format_idc, picture.bit_depth);

    let mut frame = VideoFrame::new(width as u32, height as u32, pixel_format);
    frame.data.clear();
    frame.linesize.clear();
    for (c, plane) in picture.planes.iter().enumerate() {
        let (hs, vs) = (picture.hshift[c], picture.vshift[c]);
        let bit_depth = picture.bit_depth_of(c);
        let w = width >> hs;
        let h = height >> vs;
        let bytes = if bit_depth > 8 { 2 } else { 1 };
        frame.data.push(plane.pack(left >> hs, top >> vs, w, h, bit_depth));
        frame.linesize.push(w * bytes);
    }
    frame.pts = pic.pts;
    frame.poc = pic.poc;
    frame.is_keyframe = pic.is_keyframe;
    frame.picture_type = pic.picture_type;
    frame.complete = pic.complete;
    frame.side_planes = pic.side_planes.clone();
    frame
}

// ============================================================
// Decoder trait 实现
// ============================================================

impl Decoder for HevcDecoder {
    fn name(&self) -> &str {
        "hevc"
    }

    fn open(&mut self, extradata: &[u8]) -> TaoResult<()> {
        if extradata.is_empty() {
            return Ok(());
        }
        let config = parse_hvcc_config(extradata)?;
        if self.config.nal_length_size.is_none() {
            self.length_size = Some(config.length_size);
        }
        for raw in &config.nal_units {
            let nal = NalUnit::parse(raw)?;
            let result = self.decode_nal(&nal, crate::packet::NOPTS_VALUE);
            self.check(result, "hvcC 参数集")?;
        }
        debug!(
            "HEVC: 解码器已打开, length_size={:?}, 参数集 {} 个",
            self.length_size,
            config.nal_units.len()
        );
        Ok(())
    }

    fn send_packet(&mut self, packet: &Packet) -> TaoResult<()> {
        if packet.is_empty() {
            self.flushing = true;
            let result = self.finish_picture();
            self.output_pictures(0, true);
            return self.check(result, "flush");
        }

        let nals = self.split_nals(&packet.data)?;
        for raw in nals {
            let nal = match NalUnit::parse(raw) {
                Ok(nal) => nal,
                Err(e) => {
                    self.check(Err(e), "NAL 头")?;
                    continue;
                }
            };
            let result = self.decode_nal(&nal, packet.pts);
            self.check(result, "NAL")?;
        }
        let result = self.finish_picture();
        self.check(result, "图像结束")
    }

    fn receive_frame(&mut self) -> TaoResult<Frame> {
        if let Some(frame) = self.output_queue.pop_front() {
            Ok(frame)
        } else if self.flushing {
            Err(TaoError::Eof)
        } else {
            Err(TaoError::NeedMoreData)
        }
    }

    fn flush(&mut self) {
        self.current = None;
        self.prev_sh = None;
        self.skipping_picture = false;
        self.dpb.clear();
        self.output_queue.clear();
        self.flushing = false;
        self.state.seq_decode = self.state.seq_decode.wrapping_add(1);
        self.state.max_ra = i32::MAX;
        self.state.slice_initialized = false;
    }
}
