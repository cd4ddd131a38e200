use crate::core::{
    AudioConfig, AudioSpec, Clock, ClockSource, FramePayload, PipelineEvent, PlayerError, ResamplerKind, Result,
    SeekGeneration, StreamKind, Synchronizer, TimeBase,
};
use crate::player::decode_thread::FrameQueue;
use crate::player::log_ctx;
use crate::player::resampler::{create_resampler, Resampler};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig, SupportedStreamConfigRange};
use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// 平台音频层回调：每次填满一块交织 i16 缓冲
pub type AudioCallback = Box<dyn FnMut(&mut [i16]) + Send>;

/// 平台音频层（拉模式）
pub trait AudioDevice: Send {
    /// 打开设备并注册回调，返回设备实际使用的格式
    fn open(&mut self, spec: AudioSpec, callback: AudioCallback) -> Result<AudioSpec>;

    fn set_playing(&mut self, playing: bool) -> Result<()>;

    fn close(&mut self);

    fn name(&self) -> String {
        "audio-device".to_string()
    }
}

/// 每个会话创建一个新的音频设备
pub type AudioDeviceFactory = Arc<dyn Fn() -> Result<Box<dyn AudioDevice>> + Send + Sync>;

/// cpal 音频设备（设备端使用 f32，回调内做 i16 → f32 转换）
pub struct CpalAudioDevice {
    stream: Option<Stream>,
}

// cpal::Stream 本身不是 Send；它只被持有它的 AudioSink 创建、暂停和销毁，
// 这些调用都经由控制器的串行化入口发生
unsafe impl Send for CpalAudioDevice {}

impl CpalAudioDevice {
    pub fn new() -> Self {
        Self { stream: None }
    }

    pub fn factory() -> AudioDeviceFactory {
        Arc::new(|| Ok(Box::new(CpalAudioDevice::new()) as Box<dyn AudioDevice>))
    }

    /// 选择设备支持的配置（不支持请求格式时回退到常见格式）
    fn pick_config(device: &Device, spec: AudioSpec) -> Result<StreamConfig> {
        let requested = [(spec.sample_rate, spec.channels)];
        let fallback = [(48000, 2), (44100, 2), (48000, 1), (44100, 1)];

        for (i, (rate, channels)) in requested.iter().chain(fallback.iter()).enumerate() {
            let config = StreamConfig {
                channels: *channels,
                sample_rate: cpal::SampleRate(*rate),
                buffer_size: cpal::BufferSize::Default,
            };
            let supported = device
                .supported_output_configs()
                .map_err(|e| PlayerError::AudioError(format!("无法获取支持的音频配置: {}", e)))?;
            let mut compatible = false;
            for range in supported {
                if Self::is_config_compatible(&config, &range) {
                    compatible = true;
                    break;
                }
            }
            if compatible {
                if i > 0 {
                    warn!(
                        "⚠️  音频设备不支持 {} Hz, {} 声道，回退到 {} Hz, {} 声道",
                        spec.sample_rate, spec.channels, rate, channels
                    );
                }
                return Ok(config);
            }
        }

        Err(PlayerError::AudioError(format!(
            "音频设备不支持任何标准配置 (原请求: {} Hz, {} 声道)",
            spec.sample_rate, spec.channels
        )))
    }

    fn is_config_compatible(config: &StreamConfig, supported: &SupportedStreamConfigRange) -> bool {
        let rate_in_range = config.sample_rate.0 >= supported.min_sample_rate().0
            && config.sample_rate.0 <= supported.max_sample_rate().0;
        rate_in_range && config.channels == supported.channels()
    }
}

impl Default for CpalAudioDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDevice for CpalAudioDevice {
    fn open(&mut self, spec: AudioSpec, mut callback: AudioCallback) -> Result<AudioSpec> {
        self.close();

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlayerError::AudioError("无法找到音频输出设备".to_string()))?;
        debug!("使用音频设备: {}", device.name().unwrap_or_default());

        let config = Self::pick_config(&device, spec)?;
        let actual = AudioSpec {
            sample_rate: config.sample_rate.0,
            channels: config.channels,
            buffer_frames: spec.buffer_frames,
        };

        let mut scratch: Vec<i16> = Vec::new();
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0);
                    callback(&mut scratch);
                    for (out, sample) in data.iter_mut().zip(scratch.iter()) {
                        *out = *sample as f32 / 32768.0;
                    }
                },
                move |err| {
                    error!("音频流错误: {}", err);
                },
                None,
            )
            .map_err(|e| PlayerError::AudioError(format!("创建音频流失败: {}", e)))?;

        self.stream = Some(stream);
        info!("🔊 音频输出已打开: {} Hz, {} 声道", actual.sample_rate, actual.channels);
        Ok(actual)
    }

    fn set_playing(&mut self, playing: bool) -> Result<()> {
        let Some(stream) = self.stream.as_ref() else {
            return Ok(());
        };
        if playing {
            stream
                .play()
                .map_err(|e| PlayerError::AudioError(format!("启动音频流失败: {}", e)))
        } else {
            stream
                .pause()
                .map_err(|e| PlayerError::AudioError(format!("暂停音频流失败: {}", e)))
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            info!("音频输出已停止");
        }
    }

    fn name(&self) -> String {
        "cpal".to_string()
    }
}

impl Drop for CpalAudioDevice {
    fn drop(&mut self) {
        self.close();
    }
}

struct SinkInner {
    spec: AudioSpec,
    time_base: TimeBase,
    resampler: Box<dyn Resampler>,
    /// 上一帧转换后没放进缓冲的部分
    leftover: Vec<i16>,
    leftover_pos: usize,
    /// leftover 中下一个采样的 pts（秒）
    leftover_pts: Option<f64>,
}

impl SinkInner {
    fn clear_leftover(&mut self) {
        self.leftover.clear();
        self.leftover_pos = 0;
        self.leftover_pts = None;
    }

    fn seconds_for(&self, samples: usize) -> f64 {
        let channels = self.spec.channels.max(1) as usize;
        if self.spec.sample_rate == 0 {
            0.0
        } else {
            (samples / channels) as f64 / self.spec.sample_rate as f64
        }
    }
}

struct SinkShared {
    frames: Arc<FrameQueue>,
    sync: Arc<Synchronizer>,
    generation: Arc<SeekGeneration>,
    inner: Mutex<SinkInner>,
    running: AtomicBool,
    paused: AtomicBool,
    volume: AtomicU32,
    completed: AtomicBool,
    events: Option<Sender<PipelineEvent>>,
    callbacks: AtomicU64,
    underruns: AtomicU64,
    resample_errors: AtomicU64,
    stale: AtomicU64,
}

impl SinkShared {
    fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    fn fill_buffer(&self, out: &mut [i16]) {
        if !self.running.load(Ordering::Acquire) || self.paused.load(Ordering::Acquire) {
            out.fill(0);
            return;
        }
        self.callbacks.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        let mut written = 0;

        // 1. 先用上一次剩下的
        if inner.leftover_pos < inner.leftover.len() {
            let start = inner.leftover_pos;
            let n = (inner.leftover.len() - start).min(out.len());
            out[..n].copy_from_slice(&inner.leftover[start..start + n]);
            if let Some(pts) = inner.leftover_pts {
                self.sync.update(Clock::new(pts), ClockSource::Audio);
                inner.leftover_pts = Some(pts + inner.seconds_for(n));
            }
            inner.leftover_pos += n;
            written = n;
            if inner.leftover_pos >= inner.leftover.len() {
                inner.clear_leftover();
            }
        }

        // 2. 非阻塞取帧并重采样，直到填满或队列为空
        while written < out.len() {
            let Some(frame) = self.frames.try_pop() else {
                break;
            };
            if !self.generation.is_current(frame.generation) {
                self.stale.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let time_base = if frame.time_base.den > 0 { frame.time_base } else { inner.time_base };
            let pts = frame.pts.map(|p| time_base.to_seconds(p));

            let data = match &frame.payload {
                FramePayload::Audio(data) => data,
                FramePayload::EndOfStream => {
                    if !self.completed.swap(true, Ordering::AcqRel) {
                        info!("{} 🔊 音频播放到结尾", log_ctx());
                        if let Some(events) = &self.events {
                            let _ = events.send(PipelineEvent::StreamCompleted(StreamKind::Audio));
                        }
                    }
                    continue;
                }
                FramePayload::Video(_) => continue,
            };

            let inner = &mut *inner;
            inner.clear_leftover();
            if let Err(e) = inner.resampler.process(data, &mut inner.leftover) {
                let errors = self.resample_errors.fetch_add(1, Ordering::Relaxed) + 1;
                if errors <= 5 || errors % 100 == 0 {
                    warn!("{} 🔊 重采样失败（已丢弃该帧）: {}", log_ctx(), e);
                }
                inner.clear_leftover();
                continue;
            }

            // 帧首采样落在本次缓冲的 written 处，时钟记为本次缓冲首采样的时间
            if let Some(pts) = pts {
                let anchor = pts - inner.seconds_for(written);
                self.sync.update(Clock::new(anchor), ClockSource::Audio);
            }

            let n = inner.leftover.len().min(out.len() - written);
            out[written..written + n].copy_from_slice(&inner.leftover[..n]);
            written += n;
            inner.leftover_pos = n;
            let advance = inner.seconds_for(n);
            inner.leftover_pts = pts.map(|p| p + advance);
            if inner.leftover_pos >= inner.leftover.len() {
                inner.clear_leftover();
            }
        }
        drop(inner);

        // 3. 不够的部分补静音
        if written < out.len() {
            out[written..].fill(0);
            if written == 0 && !self.completed.load(Ordering::Relaxed) {
                self.underruns.fetch_add(1, Ordering::Relaxed);
            }
        }

        // 4. 音量
        let volume = self.volume();
        if volume < 0.999 {
            for sample in out[..written].iter_mut() {
                *sample = (*sample as f32 * volume) as i16;
            }
        }
    }
}

/// 音频输出：平台回调从帧队列拉数据，重采样后写入固定格式的输出缓冲
///
/// 回调里不做任何阻塞等待，队列空了就补静音。暂停或停止后回调只输出静音。
pub struct AudioSink {
    shared: Arc<SinkShared>,
    device: Box<dyn AudioDevice>,
    resampler_kind: ResamplerKind,
    opened: bool,
}

impl AudioSink {
    pub fn new(
        frames: Arc<FrameQueue>,
        sync: Arc<Synchronizer>,
        generation: Arc<SeekGeneration>,
        device: Box<dyn AudioDevice>,
        config: &AudioConfig,
        events: Option<Sender<PipelineEvent>>,
    ) -> Self {
        let spec = config.spec();
        Self {
            shared: Arc::new(SinkShared {
                frames,
                sync,
                generation,
                inner: Mutex::new(SinkInner {
                    spec,
                    time_base: TimeBase::default(),
                    resampler: create_resampler(config.resampler, spec),
                    leftover: Vec::with_capacity(spec.buffer_samples()),
                    leftover_pos: 0,
                    leftover_pts: None,
                }),
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                volume: AtomicU32::new(config.volume.clamp(0.0, 1.0).to_bits()),
                completed: AtomicBool::new(false),
                events,
                callbacks: AtomicU64::new(0),
                underruns: AtomicU64::new(0),
                resample_errors: AtomicU64::new(0),
                stale: AtomicU64::new(0),
            }),
            device,
            resampler_kind: config.resampler,
            opened: false,
        }
    }

    /// 设定输出格式和流的时间基
    pub fn prepare(&mut self, spec: AudioSpec, time_base: TimeBase) {
        let mut inner = self.shared.inner.lock();
        if inner.spec != spec {
            inner.resampler = create_resampler(self.resampler_kind, spec);
            inner.spec = spec;
        } else {
            inner.resampler.reset();
        }
        inner.time_base = time_base;
        inner.clear_leftover();
        self.shared.completed.store(false, Ordering::Release);
        info!(
            "{} 🔊 音频输出就绪: {} Hz, {} 声道, 时间基 {}/{}, 重采样 {}",
            log_ctx(),
            spec.sample_rate,
            spec.channels,
            time_base.num,
            time_base.den,
            inner.resampler.name()
        );
    }

    pub fn spec(&self) -> AudioSpec {
        self.shared.inner.lock().spec
    }

    /// 打开设备并注册回调；设备格式与请求不同时按实际格式重建重采样器
    pub fn open(&mut self) -> Result<()> {
        if self.opened {
            return Ok(());
        }
        let requested = self.spec();
        let shared = self.shared.clone();
        let callback: AudioCallback = Box::new(move |buffer: &mut [i16]| shared.fill_buffer(buffer));
        let actual = self.device.open(requested, callback)?;
        if actual != requested {
            let mut inner = self.shared.inner.lock();
            inner.resampler = create_resampler(self.resampler_kind, actual);
            inner.spec = actual;
            inner.clear_leftover();
        }
        self.opened = true;
        Ok(())
    }

    /// 开始播放（必要时先打开设备）
    pub fn start(&mut self) -> Result<()> {
        self.open()?;
        self.shared.paused.store(false, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);
        self.device.set_playing(true)?;
        info!("{} 🔊 音频输出已启动 ({})", log_ctx(), self.device.name());
        Ok(())
    }

    pub fn pause(&mut self) {
        self.shared.paused.store(true, Ordering::Release);
        if let Err(e) = self.device.set_playing(false) {
            warn!("{} ⚠️ {}", log_ctx(), e);
        }
    }

    pub fn resume(&mut self) {
        self.shared.paused.store(false, Ordering::Release);
        if let Err(e) = self.device.set_playing(true) {
            warn!("{} ⚠️ {}", log_ctx(), e);
        }
    }

    pub fn stop(&mut self) {
        let was_running = self.shared.running.swap(false, Ordering::AcqRel);
        if self.opened {
            self.device.close();
            self.opened = false;
        }
        self.shared.inner.lock().clear_leftover();
        if was_running {
            info!(
                "{} 🔊 音频输出已停止（回调 {}，欠载 {}，过期帧 {}）",
                log_ctx(),
                self.shared.callbacks.load(Ordering::Relaxed),
                self.shared.underruns.load(Ordering::Relaxed),
                self.shared.stale.load(Ordering::Relaxed)
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// 设置音量 (0.0 - 1.0)
    pub fn set_volume(&self, volume: f32) {
        self.shared.volume.store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        self.shared.volume()
    }

    /// seek 之后丢弃已转换但未播放的数据
    pub fn flush_pending(&self) {
        let mut inner = self.shared.inner.lock();
        inner.clear_leftover();
        inner.resampler.reset();
        self.shared.completed.store(false, Ordering::Release);
    }

    pub fn is_completed(&self) -> bool {
        self.shared.completed.load(Ordering::Acquire)
    }

    /// 回调体；平台音频层和测试都经由这里取数据
    pub fn fill_buffer(&self, out: &mut [i16]) {
        self.shared.fill_buffer(out);
    }
}

impl Drop for AudioSink {
    fn drop(&mut self) {
        self.stop();
    }
}
