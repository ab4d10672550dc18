//! 解码器 trait 定义.

use tao_core::{TaoError, TaoResult};

use crate::frame::Frame;
use crate::packet::Packet;

/// 解码器 trait
///
/// 解码流程:
/// 1. 可选: `open()` 传入容器给出的解码器配置 (hvcC)
/// 2. `send_packet()` 送入一个访问单元
/// 3. `receive_frame()` 取出按输出顺序排列的帧, 直到 `NeedMoreData`
/// 4. 送入空包 (flush) 后继续取帧, 直到 `Eof`
pub trait Decoder: Send {
    /// 解码器名称
    fn name(&self) -> &str;

    /// 使用容器提供的 extradata 配置解码器
    ///
    /// 默认实现为空操作.
    fn open(&mut self, _extradata: &[u8]) -> TaoResult<()> {
        Ok(())
    }

    /// 送入一个压缩数据包, 空包表示刷新 (flush)
    fn send_packet(&mut self, packet: &Packet) -> TaoResult<()>;

    /// 取出一帧
    ///
    /// - `Err(TaoError::NeedMoreData)`: 需要送入更多数据包
    /// - `Err(TaoError::Eof)`: 已刷新且所有帧已取出
    fn receive_frame(&mut self) -> TaoResult<Frame>;

    /// 取出当前所有可用帧
    fn receive_available(&mut self) -> TaoResult<Vec<Frame>> {
        let mut frames = Vec::new();
        loop {
            match self.receive_frame() {
                Ok(frame) => frames.push(frame),
                Err(TaoError::NeedMoreData) | Err(TaoError::Eof) => return Ok(frames),
                Err(e) => return Err(e),
            }
        }
    }

    /// 清空内部状态 (参考帧, 输出队列), 参数集保留
    fn flush(&mut self);
}
