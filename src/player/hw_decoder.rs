use crate::core::{
    DecodedFrame, DecoderConfig, EncodedPacket, OutputBufferLease, PixelFormat, PlayerError, Result,
    StreamKind, TimeBase, VideoData, VideoFormat,
};
use crate::player::decoder::{Decoder, Received};
use log::{debug, info, warn};
use std::sync::Arc;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// 交给平台编解码器的输入格式
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeFormat {
    pub mime: String,
    pub width: u32,
    pub height: u32,
    /// Annex B 形式的 SPS/PPS
    pub csd: Vec<u8>,
}

/// 平台解码输出：平面图像 + 必须显式归还的缓冲句柄
#[derive(Debug, Clone)]
pub struct PlatformOutput {
    pub buffer_id: i64,
    pub pts_us: Option<i64>,
    pub end_of_stream: bool,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub planes: Vec<Vec<u8>>,
}

/// 平台编解码器实例（例如托管运行时里的硬件解码器对象）
///
/// 所有方法取 `&self`，实现方负责内部同步；
/// `release_output` 可能在渲染线程调用。
pub trait PlatformCodec: Send + Sync {
    /// 送入一段 Annex B 数据；实现方自行等待输入缓冲
    ///
    /// `pts_us` 为 `None` 表示包没有时间戳，对应输出的 `pts_us` 也应为 `None`。
    fn queue_input(&self, data: &[u8], pts_us: Option<i64>, key_frame: bool) -> Result<()>;

    fn queue_end_of_stream(&self) -> Result<()>;

    /// 非阻塞取输出；`None` 表示暂时没有
    fn dequeue_output(&self) -> Result<Option<PlatformOutput>>;

    fn release_output(&self, buffer_id: i64);

    fn flush(&self) -> Result<()>;

    fn close(&self) {}
}

/// 到平台编解码能力的注入句柄（代替进程级全局运行时句柄）
pub trait CodecBridge: Send + Sync {
    fn supports(&self, mime: &str) -> bool;

    fn create(&self, format: &BridgeFormat) -> Result<Arc<dyn PlatformCodec>>;
}

/// 从 avcC 解析出的参数集
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcConfig {
    pub nal_length_size: usize,
    pub sps: Vec<Vec<u8>>,
    pub pps: Vec<Vec<u8>>,
}

impl AvcConfig {
    /// 起始码 + SPS/PPS
    pub fn parameter_sets_annexb(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in self.sps.iter().chain(self.pps.iter()) {
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(nal);
        }
        out
    }
}

fn bad_extradata(msg: &str) -> PlayerError {
    PlayerError::ConfigureError(format!("avcC 解析失败: {}", msg))
}

/// 解析 AVCDecoderConfigurationRecord
pub fn parse_avcc(extradata: &[u8]) -> Result<AvcConfig> {
    if extradata.len() < 7 || extradata[0] != 1 {
        return Err(bad_extradata("不是 avcC 格式"));
    }
    let nal_length_size = (extradata[4] & 0x03) as usize + 1;
    let mut pos = 5;

    let read_sets = |pos: &mut usize, count: usize| -> Result<Vec<Vec<u8>>> {
        let mut sets = Vec::with_capacity(count);
        for _ in 0..count {
            let header = extradata.get(*pos..*pos + 2).ok_or_else(|| bad_extradata("长度字段越界"))?;
            let len = u16::from_be_bytes([header[0], header[1]]) as usize;
            *pos += 2;
            let nal = extradata.get(*pos..*pos + len).ok_or_else(|| bad_extradata("参数集越界"))?;
            sets.push(nal.to_vec());
            *pos += len;
        }
        Ok(sets)
    };

    let sps_count = (extradata[pos] & 0x1f) as usize;
    pos += 1;
    let sps = read_sets(&mut pos, sps_count)?;
    let pps_count = *extradata.get(pos).ok_or_else(|| bad_extradata("缺少 PPS 计数"))? as usize;
    pos += 1;
    let pps = read_sets(&mut pos, pps_count)?;

    Ok(AvcConfig {
        nal_length_size,
        sps,
        pps,
    })
}

/// 长度前缀 NAL（大端）转为起始码分隔
pub fn avcc_to_annexb(data: &[u8], nal_length_size: usize) -> Result<Vec<u8>> {
    if !(1..=4).contains(&nal_length_size) {
        return Err(PlayerError::DecodeError(format!("非法 NAL 长度字段: {}", nal_length_size)));
    }
    let mut out = Vec::with_capacity(data.len() + 16);
    let mut pos = 0;
    while pos < data.len() {
        let header = data
            .get(pos..pos + nal_length_size)
            .ok_or_else(|| PlayerError::DecodeError("NAL 长度字段被截断".to_string()))?;
        let len = header.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
        pos += nal_length_size;
        let nal = data
            .get(pos..pos + len)
            .ok_or_else(|| PlayerError::DecodeError(format!("NAL 长度 {} 超出包大小", len)))?;
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(nal);
        pos += len;
    }
    Ok(out)
}

fn is_annexb(data: &[u8]) -> bool {
    data.starts_with(&START_CODE) || data.starts_with(&[0, 0, 1])
}

/// 硬件加速视频解码器（H.264）
///
/// 把容器里的长度前缀码流转换成起始码码流，关键帧前补 SPS/PPS，
/// 再交给平台编解码器。输出帧携带平台缓冲租约，帧被消费（drop）时归还。
pub struct HardwareDecoder {
    bridge: Arc<dyn CodecBridge>,
    codec: Option<Arc<dyn PlatformCodec>>,
    avc: Option<AvcConfig>,
    parameter_sets: Vec<u8>,
    time_base: TimeBase,
    format: Option<VideoFormat>,
    name: String,
}

impl HardwareDecoder {
    pub const MIME_AVC: &'static str = "video/avc";

    pub fn new(bridge: Arc<dyn CodecBridge>) -> Self {
        Self {
            bridge,
            codec: None,
            avc: None,
            parameter_sets: Vec::new(),
            time_base: TimeBase::default(),
            format: None,
            name: "hardware".to_string(),
        }
    }

    /// 这条流能否走硬解
    pub fn can_handle(bridge: &dyn CodecBridge, config: &DecoderConfig) -> bool {
        config.stream == StreamKind::Video
            && config.codec_name == "h264"
            && !config.extradata.is_empty()
            && bridge.supports(Self::MIME_AVC)
    }

    fn codec(&self) -> Result<&Arc<dyn PlatformCodec>> {
        self.codec
            .as_ref()
            .ok_or_else(|| PlayerError::DecodeError("硬件解码器尚未配置".to_string()))
    }

    /// 转成起始码码流，关键帧补参数集
    pub fn prepare_input(&self, packet: &EncodedPacket) -> Result<Vec<u8>> {
        let payload = match &self.avc {
            Some(avc) if !is_annexb(&packet.data) => avcc_to_annexb(&packet.data, avc.nal_length_size)?,
            _ => packet.data.clone(),
        };
        if packet.key_frame && !self.parameter_sets.is_empty() {
            let mut out = Vec::with_capacity(self.parameter_sets.len() + payload.len());
            out.extend_from_slice(&self.parameter_sets);
            out.extend_from_slice(&payload);
            Ok(out)
        } else {
            Ok(payload)
        }
    }
}

impl Decoder for HardwareDecoder {
    fn configure(&mut self, config: &DecoderConfig) -> Result<()> {
        if config.stream != StreamKind::Video {
            return Err(PlayerError::ConfigureError("硬件解码只支持视频流".to_string()));
        }
        let (avc, parameter_sets) = if is_annexb(&config.extradata) {
            (None, config.extradata.clone())
        } else {
            let avc = parse_avcc(&config.extradata)?;
            let sets = avc.parameter_sets_annexb();
            (Some(avc), sets)
        };

        let format = BridgeFormat {
            mime: Self::MIME_AVC.to_string(),
            width: config.width,
            height: config.height,
            csd: parameter_sets.clone(),
        };
        let codec = self.bridge.create(&format)?;
        info!(
            "🎬 硬件视频解码器已配置: {}x{} (NAL 长度字段 {} 字节)",
            config.width,
            config.height,
            avc.as_ref().map(|a| a.nal_length_size).unwrap_or(0)
        );

        self.codec = Some(codec);
        self.avc = avc;
        self.parameter_sets = parameter_sets;
        self.time_base = config.time_base;
        self.format = Some(VideoFormat {
            width: config.width,
            height: config.height,
            pixel_format: config.pixel_format.unwrap_or(PixelFormat::NV12),
        });
        self.name = format!("hardware/{}", config.codec_name);
        Ok(())
    }

    fn send_packet(&mut self, packet: &EncodedPacket) -> Result<()> {
        let data = self.prepare_input(packet)?;
        let pts_us = packet
            .pts
            .map(|p| TimeBase::MICROS.from_seconds(self.time_base.to_seconds(p)));
        self.codec()?.queue_input(&data, pts_us, packet.key_frame)
    }

    fn receive_frame(&mut self) -> Result<Received> {
        let codec = self.codec()?.clone();
        let output = match codec.dequeue_output()? {
            Some(output) => output,
            None => return Ok(Received::TryAgain),
        };

        if output.end_of_stream {
            codec.release_output(output.buffer_id);
            debug!("🎬 硬件解码器输出结束");
            return Ok(Received::EndOfStream);
        }

        if output.width != 0 && output.height != 0 {
            self.format = Some(VideoFormat {
                width: output.width,
                height: output.height,
                pixel_format: output.format,
            });
        }

        let buffer_id = output.buffer_id;
        let releaser = codec.clone();
        let frame = DecodedFrame::video(
            output.pts_us,
            TimeBase::MICROS,
            VideoData {
                format: output.format,
                width: output.width,
                height: output.height,
                planes: output.planes,
            },
        )
        .with_lease(OutputBufferLease::new(buffer_id, move |id| releaser.release_output(id)));
        Ok(Received::Frame(frame))
    }

    fn is_ready(&self) -> bool {
        self.codec.is_some()
    }

    fn flush(&mut self) {
        if let Some(codec) = &self.codec {
            if let Err(e) = codec.flush() {
                warn!("硬件解码器 flush 失败: {}", e);
            }
        }
    }

    fn signal_end_of_stream(&mut self) -> Result<()> {
        self.codec()?.queue_end_of_stream()
    }

    fn video_format(&self) -> Option<VideoFormat> {
        self.format
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for HardwareDecoder {
    fn drop(&mut self) {
        if let Some(codec) = self.codec.take() {
            codec.close();
        }
    }
}
