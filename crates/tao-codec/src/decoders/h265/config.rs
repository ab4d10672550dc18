//! HEVC 解码器配置.

/// 运动/码率元数据侧平面的布局
///
/// 默认值与既有分析工具读取的格式一致:
/// - 运动平面: 4 个 i16 平面 (L0 x/y, L1 x/y) + 2 个 u8 POC 差平面, 每个 4x4 单元一项
/// - 码率密度平面: 每个 8x8 单元一项, 位于运动平面之后
/// - 元数据头: 魔数与帧类型, 其后保留区再放 CTU 四叉树位图
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataLayout {
    /// 码率密度平面相对缓冲区起点的偏移 (以 4x4 单元数计的倍数)
    pub bit_density_plane_index: usize,
    /// 元数据头相对缓冲区起点的偏移 (以 4x4 单元数计的倍数)
    pub header_plane_index: usize,
    /// 头部与四叉树位图之间的保留字节数
    pub quadtree_offset: usize,
    /// 每个 CTU 的四叉树位图字节数
    pub quadtree_bytes_per_ctu: usize,
    /// 魔数
    pub magic: [u8; 2],
    /// 残差平面的零点
    pub residual_bias: u8,
}

impl Default for MetadataLayout {
    fn default() -> Self {
        Self {
            bit_density_plane_index: 10,
            header_plane_index: 12,
            quadtree_offset: 1024,
            quadtree_bytes_per_ctu: 12,
            magic: [4, 2],
            residual_bias: 128,
        }
    }
}

/// HEVC 解码器配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HevcDecoderConfig {
    /// 严格模式: 任何分片错误都从 `send_packet` 返回
    pub strict: bool,
    /// 行级工作线程数 (1 表示单线程)
    pub threads: usize,
    /// 是否导出运动/码率元数据侧平面
    pub export_metadata: bool,
    /// 元数据布局
    pub metadata_layout: MetadataLayout,
    /// 长度前缀字节数; None 表示 Annex-B 起始码 (或由 hvcC 给出)
    pub nal_length_size: Option<usize>,
    /// 随机接入后跳过 RASL 图像
    pub skip_rasl: bool,
}

impl Default for HevcDecoderConfig {
    fn default() -> Self {
        Self {
            strict: false,
            threads: 1,
            export_metadata: false,
            metadata_layout: MetadataLayout::default(),
            nal_length_size: None,
            skip_rasl: true,
        }
    }
}
