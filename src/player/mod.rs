// 播放流水线：解封装 → 解码 → 音频输出 / 帧节奏 → 控制器

pub mod audio_output;
pub mod decode_thread;
pub mod decoder;
pub mod decoder_factory;
pub mod demuxer;
pub mod demuxer_source;
pub mod demuxer_thread;
pub mod hw_decoder;
pub mod manager;
pub mod render_feed;
pub mod resampler;

use std::process;
use std::thread;

/// 日志前缀：进程号与线程号
pub(crate) fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

pub use audio_output::{AudioCallback, AudioDevice, AudioDeviceFactory, AudioSink, CpalAudioDevice};
pub use decode_thread::{DecodeWorker, FrameQueue};
pub use decoder::{Decoder, Received, SoftwareDecoder};
pub use decoder_factory::{configure_with_retry, DecoderFactory, PlatformDecoderFactory};
pub use demuxer::{FfmpegOpener, FfmpegSource};
pub use demuxer_source::{ContainerOpener, ContainerSource, ReadOutcome};
pub use demuxer_thread::{Demuxer, PacketQueue};
pub use hw_decoder::{BridgeFormat, CodecBridge, HardwareDecoder, PlatformCodec, PlatformOutput};
pub use manager::{PlaybackController, PlayerBuilder};
pub use render_feed::{DisplayConsumer, DisplayHandle, PaceDecision, RenderFeed, RenderStats, SurfaceHandle};
pub use resampler::{create_resampler, LinearResampler, Resampler, SwrResampler};
