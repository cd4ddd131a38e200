use crate::core::state::PlayerState;
use ffmpeg_next as ffmpeg;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// 逻辑流类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Audio,
    Video,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Audio => "audio",
            StreamKind::Video => "video",
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            StreamKind::Audio => "🔊",
            StreamKind::Video => "🎬",
        }
    }
}

/// 时间基（分数）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
}

impl TimeBase {
    pub const MILLIS: TimeBase = TimeBase { num: 1, den: 1000 };
    pub const MICROS: TimeBase = TimeBase { num: 1, den: 1_000_000 };

    pub fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// 把时间基下的刻度换算成秒；分母为 0 时返回 0
    pub fn to_seconds(&self, ticks: i64) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        ticks as f64 * self.num as f64 / self.den as f64
    }

    pub fn from_seconds(&self, seconds: f64) -> i64 {
        if self.num == 0 {
            return 0;
        }
        (seconds * self.den as f64 / self.num as f64).round() as i64
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        TimeBase::MILLIS
    }
}

impl From<ffmpeg::Rational> for TimeBase {
    fn from(r: ffmpeg::Rational) -> Self {
        TimeBase::new(r.numerator(), r.denominator())
    }
}

/// 数据包性质：真实负载或控制标记
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Data,
    /// 丢弃解码器内部的旧参考帧
    Flush,
    /// 流结束，解码器应排空缓冲
    EndOfStream,
}

/// 压缩数据包（由 Demuxer 产生，由唯一一个解码线程消费）
#[derive(Clone)]
pub struct EncodedPacket {
    pub stream: StreamKind,
    pub kind: PacketKind,
    pub data: Vec<u8>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub key_frame: bool,
    pub time_base: TimeBase,
    /// 产生该包时的 seek 代数
    pub generation: u64,
}

impl EncodedPacket {
    pub fn new(stream: StreamKind, data: Vec<u8>, pts: Option<i64>, time_base: TimeBase) -> Self {
        Self {
            stream,
            kind: PacketKind::Data,
            data,
            pts,
            dts: None,
            key_frame: false,
            time_base,
            generation: 0,
        }
    }

    pub fn flush_marker(stream: StreamKind) -> Self {
        Self::marker(stream, PacketKind::Flush)
    }

    pub fn end_marker(stream: StreamKind) -> Self {
        Self::marker(stream, PacketKind::EndOfStream)
    }

    fn marker(stream: StreamKind, kind: PacketKind) -> Self {
        Self {
            stream,
            kind,
            data: Vec::new(),
            pts: None,
            dts: None,
            key_frame: false,
            time_base: TimeBase::default(),
            generation: 0,
        }
    }

    pub fn is_flush(&self) -> bool {
        self.kind == PacketKind::Flush
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.kind == PacketKind::EndOfStream
    }

    pub fn with_key_frame(mut self, key: bool) -> Self {
        self.key_frame = key;
        self
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn pts_seconds(&self) -> Option<f64> {
        self.pts.map(|p| self.time_base.to_seconds(p))
    }
}

impl fmt::Debug for EncodedPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedPacket")
            .field("stream", &self.stream)
            .field("kind", &self.kind)
            .field("len", &self.data.len())
            .field("pts", &self.pts)
            .field("key_frame", &self.key_frame)
            .field("generation", &self.generation)
            .finish()
    }
}

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    RGBA,
    YUV420P,
    NV12,
}

impl PixelFormat {
    /// 紧密排列时每个平面的 (行字节数, 行数)
    pub fn plane_dims(&self, width: u32, height: u32) -> Vec<(usize, usize)> {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = ((w + 1) / 2, (h + 1) / 2);
        match self {
            PixelFormat::RGBA => vec![(w * 4, h)],
            PixelFormat::YUV420P => vec![(w, h), (cw, ch), (cw, ch)],
            PixelFormat::NV12 => vec![(w, h), (cw * 2, ch)],
        }
    }
}

/// 音频采样格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    F32,
    I16,
    Other,
}

/// 视频帧数据（平面紧密排列）
#[derive(Debug, Clone)]
pub struct VideoData {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<Vec<u8>>,
}

impl VideoData {
    pub fn has_valid_dimensions(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

/// 音频帧数据（交织 f32）
#[derive(Debug, Clone)]
pub struct AudioData {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioData {
    /// 每声道采样数
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }
}

#[derive(Debug, Clone)]
pub enum FramePayload {
    Video(VideoData),
    Audio(AudioData),
    /// 流结束哨兵
    EndOfStream,
}

/// 平台输出缓冲租约：必须显式归还，且只能归还一次
pub struct OutputBufferLease {
    buffer_id: i64,
    release: Option<Box<dyn FnOnce(i64) + Send>>,
}

impl OutputBufferLease {
    pub fn new(buffer_id: i64, release: impl FnOnce(i64) + Send + 'static) -> Self {
        Self {
            buffer_id,
            release: Some(Box::new(release)),
        }
    }

    pub fn buffer_id(&self) -> i64 {
        self.buffer_id
    }

    pub fn is_released(&self) -> bool {
        self.release.is_none()
    }

    /// 提前归还；之后 Drop 不再重复归还
    pub fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release(self.buffer_id);
        }
    }
}

impl Drop for OutputBufferLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for OutputBufferLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputBufferLease")
            .field("buffer_id", &self.buffer_id)
            .field("released", &self.is_released())
            .finish()
    }
}

/// 解码后的音频或视频单元
#[derive(Debug)]
pub struct DecodedFrame {
    pub pts: Option<i64>,
    pub time_base: TimeBase,
    pub payload: FramePayload,
    pub lease: Option<OutputBufferLease>,
    pub generation: u64,
}

impl DecodedFrame {
    pub fn video(pts: Option<i64>, time_base: TimeBase, data: VideoData) -> Self {
        Self {
            pts,
            time_base,
            payload: FramePayload::Video(data),
            lease: None,
            generation: 0,
        }
    }

    pub fn audio(pts: Option<i64>, time_base: TimeBase, data: AudioData) -> Self {
        Self {
            pts,
            time_base,
            payload: FramePayload::Audio(data),
            lease: None,
            generation: 0,
        }
    }

    pub fn end_of_stream() -> Self {
        Self {
            pts: None,
            time_base: TimeBase::default(),
            payload: FramePayload::EndOfStream,
            lease: None,
            generation: 0,
        }
    }

    pub fn with_lease(mut self, lease: OutputBufferLease) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self.payload, FramePayload::EndOfStream)
    }

    pub fn pts_seconds(&self) -> Option<f64> {
        self.pts.map(|p| self.time_base.to_seconds(p))
    }

    pub fn as_video(&self) -> Option<&VideoData> {
        match &self.payload {
            FramePayload::Video(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_audio(&self) -> Option<&AudioData> {
        match &self.payload {
            FramePayload::Audio(a) => Some(a),
            _ => None,
        }
    }
}

/// FFmpeg 编解码参数的独立拷贝
///
/// `Parameters::clone` 会做一次深拷贝并且不再持有所属容器，
/// 因此可以安全地跨线程移动。
#[derive(Clone)]
pub struct CodecParameters(Arc<ffmpeg::codec::Parameters>);

unsafe impl Send for CodecParameters {}
unsafe impl Sync for CodecParameters {}

impl CodecParameters {
    pub fn new(params: &ffmpeg::codec::Parameters) -> Self {
        Self(Arc::new(params.clone()))
    }

    pub fn to_parameters(&self) -> ffmpeg::codec::Parameters {
        (*self.0).clone()
    }
}

impl fmt::Debug for CodecParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodecParameters({:?})", self.0.id())
    }
}

/// 流描述 / 解码器配置，配置后不可变
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub stream: StreamKind,
    pub codec_name: String,
    pub extradata: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub pixel_format: Option<PixelFormat>,
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: Option<SampleFormat>,
    pub time_base: TimeBase,
    pub parameters: Option<CodecParameters>,
}

pub type StreamDescriptor = DecoderConfig;

impl DecoderConfig {
    pub fn video(codec_name: &str, width: u32, height: u32, time_base: TimeBase) -> Self {
        Self {
            stream: StreamKind::Video,
            codec_name: codec_name.to_string(),
            extradata: Vec::new(),
            width,
            height,
            pixel_format: Some(PixelFormat::YUV420P),
            sample_rate: 0,
            channels: 0,
            sample_format: None,
            time_base,
            parameters: None,
        }
    }

    pub fn audio(codec_name: &str, sample_rate: u32, channels: u16, time_base: TimeBase) -> Self {
        Self {
            stream: StreamKind::Audio,
            codec_name: codec_name.to_string(),
            extradata: Vec::new(),
            width: 0,
            height: 0,
            pixel_format: None,
            sample_rate,
            channels,
            sample_format: Some(SampleFormat::F32),
            time_base,
            parameters: None,
        }
    }

    pub fn with_extradata(mut self, extradata: Vec<u8>) -> Self {
        self.extradata = extradata;
        self
    }
}

/// 视频解码输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

/// 音频解码输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

/// 音频输出设备格式（固定采样率 / 声道数 / 16 位）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSpec {
    pub sample_rate: u32,
    pub channels: u16,
    pub buffer_frames: usize,
}

impl AudioSpec {
    /// 一次回调需要的 i16 样本数
    pub fn buffer_samples(&self) -> usize {
        self.buffer_frames * self.channels as usize
    }
}

/// 流水线内部事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEvent {
    StreamCompleted(StreamKind),
}

/// 播放器状态快照（命令行 `--status-json` 输出）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerStatus {
    pub state: PlayerState,
    pub position: f64,
    pub duration: f64,
    pub volume: f32,
    pub width: u32,
    pub height: u32,
    pub has_audio: bool,
    pub has_video: bool,
}
