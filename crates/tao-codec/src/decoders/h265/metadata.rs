//! 运动/码率元数据侧平面.
//!
//! 侧平面 0 为元数据区, 以 4x4 单元数 `pu_res = (高 / 4) * (行宽 / 4)` 为基本长度:
//! - `[0, 8·pu_res)`: L0 x, L0 y, L1 x, L1 y 四个 i16 (小端) 平面
//! - `[8·pu_res, 10·pu_res)`: L0/L1 的 POC 差 (u8)
//! - `bit_density_plane_index · pu_res` 起: 每个 8x8 单元的码率密度
//! - `header_plane_index · pu_res` 起: 魔数与帧类型, 保留区之后为每 CTU 的四叉树位图
//!
//! 侧平面 1..=3 为各分量的残差平面 (零点为 `residual_bias`).

use tao_core::TaoResult;

use super::config::MetadataLayout;
use super::picture::MvField;
use super::slice_header::SliceType;

fn alloc(len: usize, value: u8) -> TaoResult<Vec<u8>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)?;
    v.resize(len, value);
    Ok(v)
}

/// 元数据写入器 (只保存几何信息, 数据在图像的侧平面里)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataWriter {
    pub layout: MetadataLayout,
    /// 亮度行宽 (样本数)
    pub stride: usize,
    pub height: usize,
    pub ctb_count: usize,
    /// 各分量的 (宽, 高)
    pub component_size: [(usize, usize); 3],
    pub hshift: [u32; 3],
    pub vshift: [u32; 3],
}

impl MetadataWriter {
    pub fn new(
        layout: MetadataLayout,
        width: usize,
        height: usize,
        ctb_count: usize,
        hshift: [u32; 3],
        vshift: [u32; 3],
    ) -> Self {
        let component_size = [0, 1, 2].map(|c| (width >> hshift[c], height >> vshift[c]));
        Self {
            layout,
            stride: width,
            height,
            ctb_count,
            component_size,
            hshift,
            vshift,
        }
    }

    /// 4x4 单元总数
    pub fn pu_res(&self) -> usize {
        (self.height >> 2) * (self.stride >> 2)
    }

    fn pu_stride(&self) -> usize {
        self.stride >> 2
    }

    /// 元数据头在侧平面 0 中的偏移
    pub fn header_offset(&self) -> usize {
        self.pu_res() * self.layout.header_plane_index
    }

    /// 第 ctb_rs 个 CTU 的四叉树位图偏移
    pub fn quadtree_offset(&self, ctb_rs: usize) -> usize {
        self.header_offset() + self.layout.quadtree_offset + ctb_rs * self.layout.quadtree_bytes_per_ctu
    }

    /// 分配全部侧平面
    pub fn allocate(&self) -> TaoResult<Vec<Vec<u8>>> {
        let meta_len = self.quadtree_offset(self.ctb_count);
        let mut planes = vec![alloc(meta_len, 0)?];
        for &(w, h) in &self.component_size {
            planes.push(alloc(w * h, self.layout.residual_bias)?);
        }
        Ok(planes)
    }

    /// 写入魔数与帧类型 (I=0, P=1, B=2)
    pub fn write_header(&self, planes: &mut [Vec<u8>], slice_type: SliceType) {
        let off = self.header_offset();
        let Some(meta) = planes.first_mut() else {
            return;
        };
        if off + 3 > meta.len() {
            return;
        }
        meta[off..off + 2].copy_from_slice(&self.layout.magic);
        meta[off + 2] = match slice_type {
            SliceType::I => 0,
            SliceType::P => 1,
            SliceType::B => 2,
        };
    }

    /// 写入一个 PU 的运动矢量与 POC 差
    #[allow(clippy::too_many_arguments)]
    pub fn write_motion(
        &self,
        planes: &mut [Vec<u8>],
        x0: usize,
        y0: usize,
        width: usize,
        height: usize,
        mvf: &MvField,
        poc: i32,
        ref_pocs: [i32; 2],
    ) {
        let Some(meta) = planes.first_mut() else {
            return;
        };
        let pu_res = self.pu_res();
        let pu_stride = self.pu_stride();
        let put_i16 = |meta: &mut Vec<u8>, plane: usize, idx: usize, v: i16| {
            let off = pu_res * plane + idx * 2;
            if let Some(dst) = meta.get_mut(off..off + 2) {
                dst.copy_from_slice(&v.to_le_bytes());
            }
        };
        for y in (y0 >> 2)..((y0 + height) >> 2).min(self.height >> 2) {
            for x in (x0 >> 2)..((x0 + width) >> 2).min(pu_stride) {
                let idx = y * pu_stride + x;
                if mvf.pred_flag.uses(0) {
                    put_i16(meta, 0, idx, mvf.mv[0].x);
                    put_i16(meta, 2, idx, mvf.mv[0].y);
                    if let Some(d) = meta.get_mut(pu_res * 8 + idx) {
                        *d = (poc - ref_pocs[0]) as u8;
                    }
                }
                if mvf.pred_flag.uses(1) {
                    put_i16(meta, 4, idx, mvf.mv[1].x);
                    put_i16(meta, 6, idx, mvf.mv[1].y);
                    if let Some(d) = meta.get_mut(pu_res * 9 + idx) {
                        *d = (ref_pocs[1] - poc) as u8;
                    }
                }
            }
        }
    }

    /// 写入 CU 的码率密度: 每 8x8 单元 bytes·8 / (cb/8)²
    pub fn write_bit_density(&self, planes: &mut [Vec<u8>], x0: usize, y0: usize, log2_cb_size: u32, bytes: usize) {
        let Some(meta) = planes.first_mut() else {
            return;
        };
        let cells = (1usize << log2_cb_size) >> 3;
        if cells == 0 {
            return;
        }
        let density = (bytes * 8 / (cells * cells)).min(255) as u8;
        let base = self.pu_res() * self.layout.bit_density_plane_index;
        let stride = self.stride >> 3;
        for y in (y0 >> 3)..(y0 >> 3) + cells {
            for x in (x0 >> 3)..((x0 >> 3) + cells).min(stride) {
                if let Some(d) = meta.get_mut(base + y * stride + x) {
                    *d = density;
                }
            }
        }
    }

    /// 标记四叉树节点 bit_idx 已分裂
    pub fn mark_split(&self, planes: &mut [Vec<u8>], ctb_rs: usize, bit_idx: usize) {
        if bit_idx >= self.layout.quadtree_bytes_per_ctu * 8 {
            return;
        }
        let off = self.quadtree_offset(ctb_rs) + bit_idx / 8;
        if let Some(byte) = planes.first_mut().and_then(|m| m.get_mut(off)) {
            *byte |= 1 << (bit_idx % 8);
        }
    }

    /// 把 CU 覆盖的残差平面重置为零点
    pub fn reset_residual(&self, planes: &mut [Vec<u8>], x0: usize, y0: usize, cb_size: usize) {
        for c in 0..3 {
            let (w, h) = self.component_size[c];
            let Some(plane) = planes.get_mut(c + 1) else {
                continue;
            };
            let xs = x0 >> self.hshift[c];
            let ys = y0 >> self.vshift[c];
            let bw = cb_size >> self.hshift[c];
            let bh = cb_size >> self.vshift[c];
            for y in ys..(ys + bh).min(h) {
                let end = (xs + bw).min(w);
                if xs < end {
                    plane[y * w + xs..y * w + end].fill(self.layout.residual_bias);
                }
            }
        }
    }

    /// 写入一个变换块的残差 (分量坐标)
    pub fn write_residual(&self, planes: &mut [Vec<u8>], c_idx: usize, x0: usize, y0: usize, size: usize, residual: &[i32]) {
        let (w, h) = self.component_size[c_idx];
        let Some(plane) = planes.get_mut(c_idx + 1) else {
            return;
        };
        let bias = i32::from(self.layout.residual_bias);
        for y in 0..size.min(h.saturating_sub(y0)) {
            for x in 0..size.min(w.saturating_sub(x0)) {
                plane[(y0 + y) * w + x0 + x] = (bias + residual[y * size + x]).clamp(0, 255) as u8;
            }
        }
    }
}
