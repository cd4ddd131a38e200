use crate::core::{
    AudioData, AudioFormat, DecodedFrame, DecoderConfig, EncodedPacket, PixelFormat, PlayerError,
    Result, SampleFormat, StreamKind, TimeBase, VideoData, VideoFormat,
};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::util::channel_layout::ChannelLayout;
use ffmpeg_next::{codec, software, util};
use log::{debug, info};

/// `receive_frame` 的结果；`TryAgain` 是正常情况，不是错误
#[derive(Debug)]
pub enum Received {
    Frame(DecodedFrame),
    TryAgain,
    EndOfStream,
}

/// 解码器能力接口（软解 / 硬解两种实现）
pub trait Decoder: Send {
    /// 绑定到一条流；配置后流描述不再改变
    fn configure(&mut self, config: &DecoderConfig) -> Result<()>;

    fn send_packet(&mut self, packet: &EncodedPacket) -> Result<()>;

    /// 非阻塞取帧
    fn receive_frame(&mut self) -> Result<Received>;

    fn is_ready(&self) -> bool;

    /// 丢弃内部缓冲和参考帧（seek 之后）
    fn flush(&mut self);

    /// 通知输入结束，之后 `receive_frame` 会排空缓冲帧
    fn signal_end_of_stream(&mut self) -> Result<()>;

    fn video_format(&self) -> Option<VideoFormat> {
        None
    }

    fn audio_format(&self) -> Option<AudioFormat> {
        None
    }

    fn name(&self) -> &str;
}

/// 按行拷贝，去掉 stride 填充
fn copy_plane(data: &[u8], stride: usize, row_bytes: usize, rows: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(row_bytes * rows);
    for y in 0..rows {
        let start = y * stride;
        match data.get(start..start + row_bytes) {
            Some(row) => out.extend_from_slice(row),
            None => break,
        }
    }
    out
}

struct VideoState {
    decoder: codec::decoder::Video,
    scaler: Option<(software::scaling::Context, util::format::Pixel, u32, u32)>,
}

struct AudioState {
    decoder: codec::decoder::Audio,
    converter: Option<(software::resampling::Context, util::format::Sample, ChannelLayout, u32)>,
}

enum SoftwareState {
    Unconfigured,
    Video(VideoState),
    Audio(AudioState),
}

/// 软件解码器（FFmpeg）
///
/// 视频统一输出 YUV420P，音频统一输出交织 f32（保持原采样率和声道，
/// 采样率/声道转换由音频输出负责）。
pub struct SoftwareDecoder {
    state: SoftwareState,
    time_base: TimeBase,
    name: String,
    frames_out: u64,
}

// SwsContext / SwrContext 本身不是 Send，但每个解码器实例只在一个解码线程中使用
unsafe impl Send for SoftwareDecoder {}

impl SoftwareDecoder {
    pub fn new() -> Self {
        Self {
            state: SoftwareState::Unconfigured,
            time_base: TimeBase::default(),
            name: "software".to_string(),
            frames_out: 0,
        }
    }

    fn convert_video(state: &mut VideoState, frame: util::frame::Video, time_base: TimeBase) -> Result<DecodedFrame> {
        let pts = frame.timestamp().or(frame.pts());
        let (width, height) = (frame.width(), frame.height());

        let converted;
        let source = if frame.format() == util::format::Pixel::YUV420P {
            &frame
        } else {
            let rebuild = match &state.scaler {
                Some((_, format, w, h)) => *format != frame.format() || *w != width || *h != height,
                None => true,
            };
            if rebuild {
                debug!("🔧 初始化 scaler: {:?} {}x{} -> YUV420P", frame.format(), width, height);
                let ctx = software::scaling::Context::get(
                    frame.format(),
                    width,
                    height,
                    util::format::Pixel::YUV420P,
                    width,
                    height,
                    software::scaling::Flags::BILINEAR,
                )?;
                state.scaler = Some((ctx, frame.format(), width, height));
            }
            let mut out = util::frame::Video::empty();
            if let Some((scaler, ..)) = state.scaler.as_mut() {
                scaler.run(&frame, &mut out)?;
            }
            converted = out;
            &converted
        };

        let planes = PixelFormat::YUV420P
            .plane_dims(width, height)
            .into_iter()
            .enumerate()
            .map(|(i, (row_bytes, rows))| copy_plane(source.data(i), source.stride(i), row_bytes, rows))
            .collect();

        Ok(DecodedFrame::video(
            pts,
            time_base,
            VideoData {
                format: PixelFormat::YUV420P,
                width,
                height,
                planes,
            },
        ))
    }

    fn convert_audio(state: &mut AudioState, mut frame: util::frame::Audio, time_base: TimeBase) -> Result<DecodedFrame> {
        let pts = frame.timestamp().or(frame.pts());
        let rate = frame.rate();
        let channels = frame.channels();
        let packed_f32 = util::format::Sample::F32(util::format::sample::Type::Packed);

        let converted;
        let source = if frame.format() == packed_f32 {
            &frame
        } else {
            let layout = if frame.channel_layout().is_empty() {
                ChannelLayout::default(channels as i32)
            } else {
                frame.channel_layout()
            };
            frame.set_channel_layout(layout);

            let rebuild = match &state.converter {
                Some((_, format, l, r)) => *format != frame.format() || *l != layout || *r != rate,
                None => true,
            };
            if rebuild {
                debug!("🔧 初始化采样格式转换: {:?} -> f32 packed ({} Hz, {} 声道)", frame.format(), rate, channels);
                let ctx = software::resampling::Context::get(frame.format(), layout, rate, packed_f32, layout, rate)?;
                state.converter = Some((ctx, frame.format(), layout, rate));
            }
            let mut out = util::frame::Audio::empty();
            if let Some((converter, ..)) = state.converter.as_mut() {
                converter.run(&frame, &mut out)?;
            }
            converted = out;
            &converted
        };

        let count = source.samples() * channels as usize;
        let bytes = source.data(0);
        let samples: Vec<f32> = bytes
            .chunks_exact(4)
            .take(count)
            .map(bytemuck::pod_read_unaligned::<f32>)
            .collect();

        Ok(DecodedFrame::audio(
            pts,
            time_base,
            AudioData {
                sample_rate: rate,
                channels,
                samples,
            },
        ))
    }
}

impl Default for SoftwareDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for SoftwareDecoder {
    fn configure(&mut self, config: &DecoderConfig) -> Result<()> {
        let params = config
            .parameters
            .as_ref()
            .ok_or_else(|| PlayerError::ConfigureError(format!("{}: 缺少编解码参数", config.codec_name)))?;
        let context = codec::context::Context::from_parameters(params.to_parameters())?;

        self.state = match config.stream {
            StreamKind::Video => {
                let decoder = context.decoder().video()?;
                info!(
                    "🎬 软件视频解码器: {} {}x{}, 格式: {:?}",
                    config.codec_name,
                    decoder.width(),
                    decoder.height(),
                    decoder.format()
                );
                SoftwareState::Video(VideoState { decoder, scaler: None })
            }
            StreamKind::Audio => {
                let decoder = context.decoder().audio()?;
                info!(
                    "🔊 软件音频解码器: {} {} Hz, {} 声道, 格式: {:?}",
                    config.codec_name,
                    decoder.rate(),
                    decoder.channels(),
                    decoder.format()
                );
                SoftwareState::Audio(AudioState { decoder, converter: None })
            }
        };
        self.time_base = config.time_base;
        self.name = format!("software/{}", config.codec_name);
        Ok(())
    }

    fn send_packet(&mut self, packet: &EncodedPacket) -> Result<()> {
        let mut av_packet = ffmpeg::Packet::copy(&packet.data);
        av_packet.set_pts(packet.pts);
        av_packet.set_dts(packet.dts);
        if packet.key_frame {
            av_packet.set_flags(codec::packet::Flags::KEY);
        }

        let result = match &mut self.state {
            SoftwareState::Video(s) => s.decoder.send_packet(&av_packet),
            SoftwareState::Audio(s) => s.decoder.send_packet(&av_packet),
            SoftwareState::Unconfigured => {
                return Err(PlayerError::DecodeError("解码器尚未配置".to_string()));
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(ffmpeg::Error::Eof) => {
                // 已经送过 EOF：重置后丢弃本包
                debug!("{} 收到 EOF（send_packet），执行 flush 并忽略本次包", self.name);
                self.flush();
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn receive_frame(&mut self) -> Result<Received> {
        let time_base = self.time_base;
        let result = match &mut self.state {
            SoftwareState::Video(s) => {
                let mut frame = util::frame::Video::empty();
                match s.decoder.receive_frame(&mut frame) {
                    Ok(()) => Self::convert_video(s, frame, time_base).map(Received::Frame),
                    Err(e) => Err(e.into()),
                }
            }
            SoftwareState::Audio(s) => {
                let mut frame = util::frame::Audio::empty();
                match s.decoder.receive_frame(&mut frame) {
                    Ok(()) => Self::convert_audio(s, frame, time_base).map(Received::Frame),
                    Err(e) => Err(e.into()),
                }
            }
            SoftwareState::Unconfigured => return Ok(Received::TryAgain),
        }
        .map_err(ReceiveError::from_player);

        match result {
            Ok(received) => {
                self.frames_out += 1;
                Ok(received)
            }
            Err(ReceiveError::Again) => Ok(Received::TryAgain),
            Err(ReceiveError::Eof) => Ok(Received::EndOfStream),
            Err(ReceiveError::Failed(e)) => Err(e),
        }
    }

    fn is_ready(&self) -> bool {
        !matches!(self.state, SoftwareState::Unconfigured)
    }

    fn flush(&mut self) {
        match &mut self.state {
            SoftwareState::Video(s) => s.decoder.flush(),
            SoftwareState::Audio(s) => s.decoder.flush(),
            SoftwareState::Unconfigured => {}
        }
    }

    fn signal_end_of_stream(&mut self) -> Result<()> {
        let result = match &mut self.state {
            SoftwareState::Video(s) => s.decoder.send_eof(),
            SoftwareState::Audio(s) => s.decoder.send_eof(),
            SoftwareState::Unconfigured => return Ok(()),
        };
        match result {
            Ok(()) | Err(ffmpeg::Error::Eof) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn video_format(&self) -> Option<VideoFormat> {
        match &self.state {
            SoftwareState::Video(s) => Some(VideoFormat {
                width: s.decoder.width(),
                height: s.decoder.height(),
                pixel_format: PixelFormat::YUV420P,
            }),
            _ => None,
        }
    }

    fn audio_format(&self) -> Option<AudioFormat> {
        match &self.state {
            SoftwareState::Audio(s) => Some(AudioFormat {
                sample_rate: s.decoder.rate(),
                channels: s.decoder.channels(),
                sample_format: SampleFormat::F32,
            }),
            _ => None,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 区分 EAGAIN / EOF / 真正的失败
enum ReceiveError {
    Again,
    Eof,
    Failed(PlayerError),
}

impl ReceiveError {
    fn from_player(e: PlayerError) -> Self {
        match e {
            PlayerError::FFmpegError(ffmpeg::Error::Other { errno }) if errno == util::error::EAGAIN => {
                ReceiveError::Again
            }
            PlayerError::FFmpegError(ffmpeg::Error::Eof) => ReceiveError::Eof,
            other => ReceiveError::Failed(other),
        }
    }
}
