#![allow(dead_code)]

use myy_engine::core::{
    AudioData, AudioSpec, DecodedFrame, DecoderConfig, EncodedPacket, EngineConfig, PixelFormat,
    PlayerError, ResamplerKind, Result, StreamDescriptor, StreamKind, TimeBase, VideoData,
};
use myy_engine::player::{
    AudioCallback, AudioDevice, AudioDeviceFactory, ContainerOpener, ContainerSource, Decoder,
    DecoderFactory, DisplayConsumer, ReadOutcome, Received, SurfaceHandle,
};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const WIDTH: u32 = 4;
pub const HEIGHT: u32 = 2;
pub const SAMPLE_RATE: u32 = 1000;

/// 内存中的合成片段：25fps 视频 + 每包 20ms 的单声道音频，时间基为毫秒
#[derive(Clone)]
pub struct Clip {
    pub duration_ms: i64,
    /// 所有时间戳的偏移，用来区分不同片段
    pub offset_ms: i64,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    /// 音频包的负载字节，解码后成为采样值 `level / 256`
    pub audio_level: u8,
}

impl Clip {
    pub fn new(duration_ms: i64) -> Self {
        Self {
            duration_ms,
            offset_ms: 0,
            video_codec: Some("raw".to_string()),
            audio_codec: Some("pcm".to_string()),
            audio_level: 0x20,
        }
    }

    pub fn offset(mut self, offset_ms: i64) -> Self {
        self.offset_ms = offset_ms;
        self
    }

    pub fn video_codec(mut self, codec: Option<&str>) -> Self {
        self.video_codec = codec.map(str::to_string);
        self
    }

    pub fn audio_codec(mut self, codec: Option<&str>) -> Self {
        self.audio_codec = codec.map(str::to_string);
        self
    }

    pub fn audio_level(mut self, level: u8) -> Self {
        self.audio_level = level;
        self
    }

    fn packets(&self) -> Vec<EncodedPacket> {
        let mut packets = Vec::new();
        if self.video_codec.is_some() {
            for pts in (0..self.duration_ms).step_by(40) {
                packets.push(
                    EncodedPacket::new(
                        StreamKind::Video,
                        vec![0x10; 8],
                        Some(pts + self.offset_ms),
                        TimeBase::MILLIS,
                    )
                    .with_key_frame(true),
                );
            }
        }
        if self.audio_codec.is_some() {
            for pts in (0..self.duration_ms).step_by(20) {
                packets.push(EncodedPacket::new(
                    StreamKind::Audio,
                    vec![self.audio_level; 20],
                    Some(pts + self.offset_ms),
                    TimeBase::MILLIS,
                ));
            }
        }
        packets.sort_by_key(|p| p.pts);
        packets
    }
}

pub struct MemorySource {
    clip: Clip,
    packets: Vec<EncodedPacket>,
    cursor: usize,
    seeks: Arc<Mutex<Vec<f64>>>,
}

impl ContainerSource for MemorySource {
    fn descriptor(&self, kind: StreamKind) -> Option<StreamDescriptor> {
        match kind {
            StreamKind::Video => self
                .clip
                .video_codec
                .as_deref()
                .map(|codec| DecoderConfig::video(codec, WIDTH, HEIGHT, TimeBase::MILLIS)),
            StreamKind::Audio => self
                .clip
                .audio_codec
                .as_deref()
                .map(|codec| DecoderConfig::audio(codec, SAMPLE_RATE, 1, TimeBase::MILLIS)),
        }
    }

    fn read_packet(&mut self) -> ReadOutcome {
        match self.packets.get(self.cursor) {
            Some(packet) => {
                self.cursor += 1;
                ReadOutcome::Packet(packet.clone())
            }
            None => ReadOutcome::EndOfStream,
        }
    }

    fn seek(&mut self, seconds: f64, _stream: Option<StreamKind>) -> Result<()> {
        self.seeks.lock().push(seconds);
        let target = (seconds * 1000.0).round() as i64 + self.clip.offset_ms;
        self.cursor = self
            .packets
            .iter()
            .position(|p| p.pts.unwrap_or(0) >= target)
            .unwrap_or(self.packets.len());
        Ok(())
    }

    fn duration(&self) -> f64 {
        self.clip.duration_ms as f64 / 1000.0
    }

    fn description(&self) -> String {
        format!("memory clip ({} packets)", self.packets.len())
    }
}

/// 按名字打开内存片段；未注册的名字返回打开失败
#[derive(Default)]
pub struct MemoryOpener {
    clips: Mutex<HashMap<String, Clip>>,
    pub seeks: Arc<Mutex<Vec<f64>>>,
}

impl MemoryOpener {
    pub fn with(self, name: &str, clip: Clip) -> Self {
        self.clips.lock().insert(name.to_string(), clip);
        self
    }
}

impl ContainerOpener for MemoryOpener {
    fn open(&self, path: &str) -> Result<Box<dyn ContainerSource>> {
        let clip = self
            .clips
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| PlayerError::OpenError(format!("no such clip: {}", path)))?;
        let packets = clip.packets();
        Ok(Box::new(MemorySource {
            clip,
            packets,
            cursor: 0,
            seeks: self.seeks.clone(),
        }))
    }
}

/// 解码器收到的输入，按到达顺序记录
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecoderInput {
    Data(StreamKind, i64),
    Flush(StreamKind),
}

/// 每个数据包直接产出一帧；codec 名为 "broken" 时配置失败
pub struct PassthroughDecoder {
    config: Option<DecoderConfig>,
    pending: VecDeque<DecodedFrame>,
    draining: bool,
    log: Arc<Mutex<Vec<DecoderInput>>>,
}

impl Decoder for PassthroughDecoder {
    fn configure(&mut self, config: &DecoderConfig) -> Result<()> {
        if config.codec_name == "broken" {
            return Err(PlayerError::ConfigureError("broken codec".to_string()));
        }
        self.config = Some(config.clone());
        Ok(())
    }

    fn send_packet(&mut self, packet: &EncodedPacket) -> Result<()> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| PlayerError::DecodeError("not configured".to_string()))?;
        let pts = packet.pts.unwrap_or(0);
        self.log.lock().push(DecoderInput::Data(config.stream, pts));
        let frame = match config.stream {
            StreamKind::Video => DecodedFrame::video(
                packet.pts,
                packet.time_base,
                VideoData {
                    format: PixelFormat::YUV420P,
                    width: config.width,
                    height: config.height,
                    planes: PixelFormat::YUV420P
                        .plane_dims(config.width, config.height)
                        .into_iter()
                        .map(|(row, rows)| vec![0x80; row * rows])
                        .collect(),
                },
            ),
            StreamKind::Audio => DecodedFrame::audio(
                packet.pts,
                packet.time_base,
                AudioData {
                    sample_rate: config.sample_rate,
                    channels: config.channels,
                    samples: vec![
                        packet.data.first().map_or(0.0, |&b| b as f32 / 256.0);
                        packet.data.len() * config.channels as usize
                    ],
                },
            ),
        };
        self.pending.push_back(frame);
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Received> {
        match self.pending.pop_front() {
            Some(frame) => Ok(Received::Frame(frame)),
            None if self.draining => Ok(Received::EndOfStream),
            None => Ok(Received::TryAgain),
        }
    }

    fn is_ready(&self) -> bool {
        self.config.is_some()
    }

    fn flush(&mut self) {
        self.pending.clear();
        self.draining = false;
        if let Some(config) = &self.config {
            self.log.lock().push(DecoderInput::Flush(config.stream));
        }
    }

    fn signal_end_of_stream(&mut self) -> Result<()> {
        self.draining = true;
        Ok(())
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

#[derive(Default)]
pub struct PassthroughFactory {
    pub log: Arc<Mutex<Vec<DecoderInput>>>,
}

impl PassthroughFactory {
    /// 某条流在最后一次 flush 之后收到的数据包时间戳
    pub fn data_after_last_flush(&self, kind: StreamKind) -> Vec<i64> {
        let log = self.log.lock();
        let start = log
            .iter()
            .rposition(|e| *e == DecoderInput::Flush(kind))
            .map_or(0, |i| i + 1);
        log[start..]
            .iter()
            .filter_map(|e| match e {
                DecoderInput::Data(k, pts) if *k == kind => Some(*pts),
                _ => None,
            })
            .collect()
    }

    pub fn flushes(&self, kind: StreamKind) -> usize {
        self.log.lock().iter().filter(|e| **e == DecoderInput::Flush(kind)).count()
    }
}

impl DecoderFactory for PassthroughFactory {
    fn create(&self, config: &DecoderConfig) -> Result<Box<dyn Decoder>> {
        let mut decoder = PassthroughDecoder {
            config: None,
            pending: VecDeque::new(),
            draining: false,
            log: self.log.clone(),
        };
        decoder.configure(config)?;
        Ok(Box::new(decoder))
    }
}

/// 记录显示过的帧
#[derive(Default)]
pub struct DisplayLog {
    pub surface: Option<SurfaceHandle>,
    pub displayed: Vec<f64>,
    pub surface_sizes: Vec<(u32, u32)>,
    pub fail_create: bool,
}

#[derive(Clone, Default)]
pub struct RecordingDisplay {
    pub log: Arc<Mutex<DisplayLog>>,
}

impl RecordingDisplay {
    pub fn failing() -> Self {
        let display = Self::default();
        display.log.lock().fail_create = true;
        display
    }

    pub fn displayed(&self) -> Vec<f64> {
        self.log.lock().displayed.clone()
    }
}

impl DisplayConsumer for RecordingDisplay {
    fn create_surface(&mut self, surface: SurfaceHandle) -> Result<()> {
        let mut log = self.log.lock();
        if log.fail_create {
            return Err(PlayerError::Other("surface rejected".to_string()));
        }
        log.surface = Some(surface);
        Ok(())
    }

    fn destroy_surface(&mut self) {
        self.log.lock().surface = None;
    }

    fn has_surface(&self) -> bool {
        self.log.lock().surface.is_some()
    }

    fn on_surface_changed(&mut self, width: u32, height: u32) {
        self.log.lock().surface_sizes.push((width, height));
    }

    fn display(&mut self, frame: &DecodedFrame) -> Result<()> {
        if let Some(pts) = frame.pts_seconds() {
            self.log.lock().displayed.push(pts);
        }
        Ok(())
    }

    fn present(&mut self) {}
}

/// 以真实节奏拉取回调的假音频设备
pub struct TickingAudioDevice {
    playing: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    heard: Arc<Mutex<BTreeSet<i16>>>,
}

impl TickingAudioDevice {
    pub fn factory() -> AudioDeviceFactory {
        Self::recording(Arc::new(Mutex::new(BTreeSet::new())))
    }

    /// 所有设备实例输出过的非零采样值都记到 `heard`
    pub fn recording(heard: Arc<Mutex<BTreeSet<i16>>>) -> AudioDeviceFactory {
        Arc::new(move || -> Result<Box<dyn AudioDevice>> {
            Ok(Box::new(TickingAudioDevice {
                playing: Arc::new(AtomicBool::new(false)),
                running: Arc::new(AtomicBool::new(false)),
                handle: None,
                heard: heard.clone(),
            }))
        })
    }

    /// 采样值 `level / 256` 经过输出转换后的 i16 值
    pub fn level_to_i16(level: u8) -> i16 {
        (level as f32 / 256.0 * i16::MAX as f32) as i16
    }

    /// 打开总是失败的设备
    pub fn unavailable() -> AudioDeviceFactory {
        Arc::new(|| -> Result<Box<dyn AudioDevice>> {
            Err(PlayerError::AudioError("no output device".to_string()))
        })
    }
}

impl AudioDevice for TickingAudioDevice {
    fn open(&mut self, spec: AudioSpec, mut callback: AudioCallback) -> Result<AudioSpec> {
        let playing = self.playing.clone();
        let running = self.running.clone();
        let heard = self.heard.clone();
        running.store(true, Ordering::Release);
        let period = Duration::from_secs_f64(spec.buffer_frames as f64 / spec.sample_rate as f64);
        let handle = thread::Builder::new()
            .name("test-audio-device".to_string())
            .spawn(move || {
                let mut buffer = vec![0i16; spec.buffer_samples()];
                let mut next = Instant::now();
                while running.load(Ordering::Acquire) {
                    if playing.load(Ordering::Acquire) {
                        callback(&mut buffer);
                        heard.lock().extend(buffer.iter().copied().filter(|&s| s != 0));
                    }
                    next += period;
                    if let Some(wait) = next.checked_duration_since(Instant::now()) {
                        thread::sleep(wait);
                    } else {
                        next = Instant::now();
                    }
                }
            })
            .map_err(|e| PlayerError::AudioError(e.to_string()))?;
        self.handle = Some(handle);
        Ok(spec)
    }

    fn set_playing(&mut self, playing: bool) -> Result<()> {
        self.playing.store(playing, Ordering::Release);
        Ok(())
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn name(&self) -> String {
        "ticking".to_string()
    }
}

/// 测试用配置：1kHz 单声道、10ms 回调、线性重采样
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.audio.sample_rate = SAMPLE_RATE;
    config.audio.channels = 1;
    config.audio.buffer_frames = 10;
    config.audio.resampler = ResamplerKind::Linear;
    config.demux.eos_poll_ms = 10;
    config
}

/// 轮询直到条件成立或超时
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
