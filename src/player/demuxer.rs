use crate::core::{
    CodecParameters, EncodedPacket, PixelFormat, PlayerError, Result, SampleFormat, StreamDescriptor, StreamKind,
    TimeBase,
};
use crate::player::demuxer_source::{ContainerOpener, ContainerSource, ReadOutcome};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, format, media};
use log::{debug, info, warn};
use std::sync::Once;

static FFMPEG_INIT: Once = Once::new();

/// 初始化 FFmpeg（只执行一次）
pub fn ensure_ffmpeg_initialized() {
    FFMPEG_INIT.call_once(|| {
        if let Err(e) = ffmpeg::init() {
            warn!("FFmpeg 初始化失败: {}", e);
        }
    });
}

struct SelectedStream {
    index: usize,
    descriptor: StreamDescriptor,
}

/// 基于 FFmpeg 的容器源 - 只关心第一条音频流和第一条视频流
pub struct FfmpegSource {
    input_ctx: format::context::Input,
    video: Option<SelectedStream>,
    audio: Option<SelectedStream>,
    source_path: String,
    read_errors: u64,
}

impl FfmpegSource {
    /// 打开媒体文件
    pub fn open(path: &str) -> Result<Self> {
        ensure_ffmpeg_initialized();
        info!("正在打开文件: {}", path);

        let input_ctx = format::input(&path)
            .map_err(|e| PlayerError::OpenError(format!("{}: {}", path, e)))?;

        // 这里只读流参数，不创建解码器；解码器不可用留给解码器工厂处理
        let video = Self::select(&input_ctx, media::Type::Video, StreamKind::Video);
        let audio = Self::select(&input_ctx, media::Type::Audio, StreamKind::Audio);

        if video.is_none() && audio.is_none() {
            return Err(PlayerError::NoPlayableStream);
        }

        debug!("视频流索引: {:?}", video.as_ref().map(|s| s.index));
        debug!("音频流索引: {:?}", audio.as_ref().map(|s| s.index));

        Ok(Self {
            input_ctx,
            video,
            audio,
            source_path: path.to_string(),
            read_errors: 0,
        })
    }

    fn select(input_ctx: &format::context::Input, medium: media::Type, kind: StreamKind) -> Option<SelectedStream> {
        let stream = input_ctx.streams().find(|s| s.parameters().medium() == medium)?;
        let descriptor = describe(&stream.parameters(), TimeBase::from(stream.time_base()), kind);
        info!(
            "{} 选中{}流 #{}: {} ({}x{} / {} Hz {} 声道)",
            kind.icon(),
            kind.as_str(),
            stream.index(),
            descriptor.codec_name,
            descriptor.width,
            descriptor.height,
            descriptor.sample_rate,
            descriptor.channels
        );
        Some(SelectedStream {
            index: stream.index(),
            descriptor,
        })
    }

    fn stream_index(&self, kind: StreamKind) -> Option<usize> {
        match kind {
            StreamKind::Video => self.video.as_ref().map(|s| s.index),
            StreamKind::Audio => self.audio.as_ref().map(|s| s.index),
        }
    }

    fn selected(&self, kind: StreamKind) -> Option<&SelectedStream> {
        match kind {
            StreamKind::Video => self.video.as_ref(),
            StreamKind::Audio => self.audio.as_ref(),
        }
    }
}

impl ContainerSource for FfmpegSource {
    fn descriptor(&self, kind: StreamKind) -> Option<StreamDescriptor> {
        self.selected(kind).map(|s| s.descriptor.clone())
    }

    fn read_packet(&mut self) -> ReadOutcome {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input_ctx) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return ReadOutcome::EndOfStream,
            Err(e) => {
                self.read_errors += 1;
                if self.read_errors <= 5 || self.read_errors % 100 == 0 {
                    warn!("读取包失败（已跳过，第 {} 次）: {}", self.read_errors, e);
                }
                return ReadOutcome::Skipped;
            }
        }

        let index = packet.stream();
        let kind = if Some(index) == self.stream_index(StreamKind::Video) {
            StreamKind::Video
        } else if Some(index) == self.stream_index(StreamKind::Audio) {
            StreamKind::Audio
        } else {
            // 其他流（字幕、数据等）直接丢弃
            return ReadOutcome::Skipped;
        };

        let time_base = match self.selected(kind) {
            Some(s) => s.descriptor.time_base,
            None => return ReadOutcome::Skipped,
        };
        let data = packet.data().map(|d| d.to_vec()).unwrap_or_default();
        let mut encoded = EncodedPacket::new(kind, data, packet.pts(), time_base).with_key_frame(packet.is_key());
        encoded.dts = packet.dts();
        ReadOutcome::Packet(encoded)
    }

    fn seek(&mut self, seconds: f64, stream: Option<StreamKind>) -> Result<()> {
        let seconds = seconds.max(0.0);
        let (stream_index, timestamp) = match stream.and_then(|k| self.selected(k)) {
            Some(s) => (s.index as i32, s.descriptor.time_base.from_seconds(seconds)),
            None => (-1, TimeBase::MICROS.from_seconds(seconds)),
        };
        debug!("av_seek_frame(stream={}, ts={})", stream_index, timestamp);
        let ret = unsafe {
            ffmpeg::ffi::av_seek_frame(
                self.input_ctx.as_mut_ptr(),
                stream_index,
                timestamp,
                ffmpeg::ffi::AVSEEK_FLAG_BACKWARD as i32,
            )
        };
        if ret < 0 {
            return Err(PlayerError::FFmpegError(ffmpeg::Error::from(ret)));
        }
        Ok(())
    }

    fn duration(&self) -> f64 {
        let micros = self.input_ctx.duration();
        if micros <= 0 {
            0.0
        } else {
            TimeBase::MICROS.to_seconds(micros)
        }
    }

    fn description(&self) -> String {
        format!("FFmpeg Demuxer: {}", self.source_path)
    }
}

/// 只从流参数构造流描述，不打开解码器
///
/// 声道数缺失时按立体声处理。
fn describe(params: &codec::Parameters, time_base: TimeBase, kind: StreamKind) -> StreamDescriptor {
    let codec_name = params.id().name().to_string();
    // ffmpeg-next 没有封装这些字段，直接读取 AVCodecParameters
    let raw = unsafe { &*params.as_ptr() };
    let mut descriptor = match kind {
        StreamKind::Video => {
            let width = raw.width.max(0) as u32;
            let height = raw.height.max(0) as u32;
            let mut d = StreamDescriptor::video(&codec_name, width, height, time_base);
            d.pixel_format = pixel_format(raw.format);
            d
        }
        StreamKind::Audio => {
            let channels = if raw.channels > 0 {
                raw.channels as u16
            } else {
                warn!("音频流 {} 没有声道数，按 2 声道处理", codec_name);
                2
            };
            let mut d = StreamDescriptor::audio(&codec_name, raw.sample_rate.max(0) as u32, channels, time_base);
            d.sample_format = Some(sample_format(raw.format));
            d
        }
    };
    descriptor.extradata = if raw.extradata.is_null() || raw.extradata_size <= 0 {
        Vec::new()
    } else {
        unsafe { std::slice::from_raw_parts(raw.extradata, raw.extradata_size as usize).to_vec() }
    };
    descriptor.parameters = Some(CodecParameters::new(params));
    descriptor
}

fn pixel_format(raw: i32) -> Option<PixelFormat> {
    use ffmpeg::ffi::AVPixelFormat::*;
    match raw {
        f if f == AV_PIX_FMT_YUV420P as i32 => Some(PixelFormat::YUV420P),
        f if f == AV_PIX_FMT_NV12 as i32 => Some(PixelFormat::NV12),
        f if f == AV_PIX_FMT_RGBA as i32 => Some(PixelFormat::RGBA),
        _ => None,
    }
}

fn sample_format(raw: i32) -> SampleFormat {
    use ffmpeg::ffi::AVSampleFormat::*;
    match raw {
        f if f == AV_SAMPLE_FMT_FLT as i32 || f == AV_SAMPLE_FMT_FLTP as i32 => SampleFormat::F32,
        f if f == AV_SAMPLE_FMT_S16 as i32 || f == AV_SAMPLE_FMT_S16P as i32 => SampleFormat::I16,
        _ => SampleFormat::Other,
    }
}

/// 默认打开器：用 FFmpeg 打开本地文件
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegOpener;

impl ContainerOpener for FfmpegOpener {
    fn open(&self, path: &str) -> Result<Box<dyn ContainerSource>> {
        Ok(Box::new(FfmpegSource::open(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffmpeg::ffi::{AVCodecID, AVMediaType, AVPixelFormat, AVSampleFormat};

    fn audio_params(codec: AVCodecID, channels: i32) -> codec::Parameters {
        let mut params = codec::Parameters::new();
        unsafe {
            let raw = params.as_mut_ptr();
            (*raw).codec_type = AVMediaType::AVMEDIA_TYPE_AUDIO;
            (*raw).codec_id = codec;
            (*raw).sample_rate = 48000;
            (*raw).channels = channels;
            (*raw).format = AVSampleFormat::AV_SAMPLE_FMT_FLTP as i32;
        }
        params
    }

    #[test]
    fn audio_stream_without_decoder_is_still_described() {
        let params = audio_params(AVCodecID::AV_CODEC_ID_NONE, 2);
        let d = describe(&params, TimeBase::new(1, 48000), StreamKind::Audio);
        assert_eq!(d.stream, StreamKind::Audio);
        assert_eq!(d.sample_rate, 48000);
        assert_eq!(d.channels, 2);
        assert_eq!(d.sample_format, Some(SampleFormat::F32));
        assert_eq!(d.time_base, TimeBase::new(1, 48000));
        assert!(d.extradata.is_empty());
        assert!(d.parameters.is_some());
    }

    #[test]
    fn missing_channel_count_falls_back_to_stereo() {
        let params = audio_params(AVCodecID::AV_CODEC_ID_PCM_S16LE, 0);
        let d = describe(&params, TimeBase::new(1, 48000), StreamKind::Audio);
        assert_eq!(d.channels, 2);
    }

    #[test]
    fn video_dimensions_come_from_parameters() {
        let mut params = codec::Parameters::new();
        unsafe {
            let raw = params.as_mut_ptr();
            (*raw).codec_type = AVMediaType::AVMEDIA_TYPE_VIDEO;
            (*raw).codec_id = AVCodecID::AV_CODEC_ID_H264;
            (*raw).width = 1280;
            (*raw).height = 720;
            (*raw).format = AVPixelFormat::AV_PIX_FMT_NV12 as i32;
        }
        let d = describe(&params, TimeBase::new(1, 90000), StreamKind::Video);
        assert_eq!((d.width, d.height), (1280, 720));
        assert_eq!(d.pixel_format, Some(PixelFormat::NV12));
        assert_eq!(d.codec_name, "h264");
    }
}
