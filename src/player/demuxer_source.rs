use crate::core::{EncodedPacket, Result, StreamDescriptor, StreamKind};

/// 一次读包的结果
#[derive(Debug)]
pub enum ReadOutcome {
    Packet(EncodedPacket),
    /// 暂时性失败或不关心的流，丢弃后继续读
    Skipped,
    EndOfStream,
}

/// 已打开的容器
///
/// 不同来源（FFmpeg 文件、内存数据等）实现这个接口，
/// Demuxer 线程只通过它读包和 seek。
pub trait ContainerSource: Send {
    /// 某类流的描述；没有该流时返回 `None`
    fn descriptor(&self, kind: StreamKind) -> Option<StreamDescriptor>;

    fn read_packet(&mut self) -> ReadOutcome;

    /// 向后偏置的时间戳 seek；`stream` 为 `None` 时不指定流
    fn seek(&mut self, seconds: f64, stream: Option<StreamKind>) -> Result<()>;

    /// 总时长（秒），未知为 0
    fn duration(&self) -> f64;

    /// 获取描述信息（用于调试）
    fn description(&self) -> String;

    fn has_stream(&self, kind: StreamKind) -> bool {
        self.descriptor(kind).is_some()
    }
}

/// 按路径打开容器
pub trait ContainerOpener: Send + Sync {
    fn open(&self, path: &str) -> Result<Box<dyn ContainerSource>>;
}
