use crate::core::{
    BoundedQueue, ClockSource, EngineConfig, PipelineEvent, PlayerError, PlayerState, PlayerStatus, QueueConfig,
    Result, SeekGeneration, StreamKind, Synchronizer,
};
use crate::player::audio_output::{AudioDeviceFactory, AudioSink, CpalAudioDevice};
use crate::player::decode_thread::{DecodeWorker, FrameQueue};
use crate::player::decoder_factory::{DecoderFactory, PlatformDecoderFactory};
use crate::player::demuxer::FfmpegOpener;
use crate::player::demuxer_source::ContainerOpener;
use crate::player::demuxer_thread::{Demuxer, PacketQueue};
use crate::player::hw_decoder::CodecBridge;
use crate::player::log_ctx;
use crate::player::render_feed::{DisplayConsumer, DisplayHandle, RenderFeed, SurfaceHandle};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// 事件线程轮询间隔
const EVENT_POLL: Duration = Duration::from_millis(100);
/// 等待显示表面时的唤醒间隔
const SURFACE_POLL: Duration = Duration::from_millis(50);

/// 一个会话的四条有界队列
struct Queues {
    video_packets: Arc<PacketQueue>,
    audio_packets: Arc<PacketQueue>,
    video_frames: Arc<FrameQueue>,
    audio_frames: Arc<FrameQueue>,
}

impl Queues {
    fn new(config: &QueueConfig) -> Self {
        Self {
            video_packets: Arc::new(BoundedQueue::new("video-packets", config.video_packets)),
            audio_packets: Arc::new(BoundedQueue::new("audio-packets", config.audio_packets)),
            video_frames: Arc::new(BoundedQueue::new("video-frames", config.video_frames)),
            audio_frames: Arc::new(BoundedQueue::new("audio-frames", config.audio_frames)),
        }
    }

    /// 清空并恢复全部队列，返回丢弃的元素数
    fn flush_all(&self) -> usize {
        let dropped = self.video_packets.flush()
            + self.audio_packets.flush()
            + self.video_frames.flush()
            + self.audio_frames.flush();
        self.resume_all();
        dropped
    }

    /// 暂停期间队列保留数据，但不再接收也不再交出
    fn pause_all(&self) {
        self.video_packets.pause();
        self.audio_packets.pause();
        self.video_frames.pause();
        self.audio_frames.pause();
    }

    fn resume_all(&self) {
        self.video_packets.resume();
        self.audio_packets.resume();
        self.video_frames.resume();
        self.audio_frames.resume();
    }

    fn len(&self) -> usize {
        self.video_packets.len() + self.audio_packets.len() + self.video_frames.len() + self.audio_frames.len()
    }
}

/// 主时钟选择：配置的时钟所在的流不存在时退到外部时钟（或音频时钟）
fn choose_master(configured: ClockSource, has_audio: bool, has_video: bool) -> ClockSource {
    match configured {
        ClockSource::Audio if !has_audio => ClockSource::External,
        ClockSource::Video if !has_video => {
            if has_audio {
                ClockSource::Audio
            } else {
                ClockSource::External
            }
        }
        other => other,
    }
}

/// 一次 prepare 对应的全部组件
///
/// 线程按 解封装 → 解码 → 音频输出 → 渲染 的顺序启动，按相反顺序停止。
/// 每次 seek 推进 `generation`，各线程据此丢弃 seek 之前的包和帧。
struct Session {
    path: String,
    sync: Arc<Synchronizer>,
    generation: Arc<SeekGeneration>,
    queues: Queues,
    demuxer: Demuxer,
    video: Option<DecodeWorker>,
    audio: Option<DecodeWorker>,
    sink: Option<AudioSink>,
    render: Option<RenderFeed>,
    duration: f64,
    video_size: (u32, u32),
    start_at: f64,
    started: bool,
}

impl Session {
    fn has_video(&self) -> bool {
        self.video.is_some()
    }

    fn has_audio(&self) -> bool {
        self.sink.is_some()
    }

    /// 还有线程在跑（或音频设备还开着）
    fn is_running(&self) -> bool {
        self.demuxer.is_started()
            || self.video.as_ref().map_or(false, |w| w.is_started())
            || self.audio.as_ref().map_or(false, |w| w.is_started())
            || self.sink.as_ref().map_or(false, |s| s.is_running())
            || self.render.as_ref().map_or(false, |r| r.is_started())
    }

    fn start(&mut self) -> Result<()> {
        self.demuxer.start()?;
        if let Some(worker) = self.video.as_mut() {
            worker.start()?;
        }
        if let Some(worker) = self.audio.as_mut() {
            worker.start()?;
        }
        if let Some(sink) = self.sink.as_mut() {
            sink.start()?;
        }
        if let Some(render) = self.render.as_mut() {
            render.start()?;
        }
        self.started = true;

        // 启动前可能被暂停过（PREPARED -> PAUSED），这里统一放行
        self.sync.unfreeze();
        self.sync.reset(self.start_at);
        self.resume_workers();
        info!(
            "{} ▶️ 播放线程已启动: {} (起点 {:.3}s, 主时钟 {:?})",
            log_ctx(),
            self.path,
            self.start_at,
            self.sync.master()
        );
        Ok(())
    }

    fn pause(&mut self) {
        self.demuxer.pause();
        if let Some(worker) = &self.video {
            worker.pause();
        }
        if let Some(worker) = &self.audio {
            worker.pause();
        }
        if let Some(sink) = self.sink.as_mut() {
            sink.pause();
        }
        if let Some(render) = &self.render {
            render.pause();
        }
        self.queues.pause_all();
        self.sync.freeze();
        debug!("{} ⏸️ 流水线已暂停，队列中保留 {} 项", log_ctx(), self.queues.len());
    }

    /// 未启动过则启动，否则恢复
    fn resume(&mut self) -> Result<()> {
        if !self.started {
            return self.start();
        }
        self.sync.unfreeze();
        self.resume_workers();
        Ok(())
    }

    fn resume_workers(&mut self) {
        self.queues.resume_all();
        self.demuxer.resume();
        if let Some(worker) = &self.video {
            worker.resume();
        }
        if let Some(worker) = &self.audio {
            worker.resume();
        }
        if let Some(sink) = self.sink.as_mut() {
            sink.resume();
        }
        if let Some(render) = &self.render {
            render.resume();
        }
    }

    fn clamp_target(&self, seconds: f64) -> f64 {
        let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
        if self.duration > 0.0 {
            seconds.min(self.duration)
        } else {
            seconds
        }
    }

    /// 调用方负责在此之前暂停流水线
    fn seek(&mut self, target: f64) {
        let generation = self.generation.advance();
        if let Some(render) = &self.render {
            render.settle();
        }
        let dropped = self.queues.flush_all();
        // flush_all 会恢复队列，恢复播放之前保持暂停
        self.queues.pause_all();
        if let Some(sink) = &self.sink {
            sink.flush_pending();
        }
        if let Some(render) = &self.render {
            render.clear_completed();
        }
        self.sync.reset(target);
        self.start_at = target;
        if self.demuxer.has_pending_seek() {
            debug!("{} ⏩ 上一个 seek 目标还没执行，改为 {:.3}s", log_ctx(), target);
        }
        self.demuxer.seek_to(target);
        debug!("{} 🧹 seek 清空队列，丢弃 {} 项（代数 {}）", log_ctx(), dropped, generation);
    }

    /// 每条活跃的流都已播到结尾
    fn is_completed(&self) -> bool {
        let video_done = self.render.as_ref().map_or(true, |r| r.is_completed());
        let audio_done = self.sink.as_ref().map_or(true, |s| s.is_completed());
        (self.has_video() || self.has_audio()) && video_done && audio_done
    }

    fn position(&self) -> f64 {
        if !self.started {
            return self.start_at;
        }
        let t = self.sync.get_current_time().max(0.0);
        if self.duration > 0.0 {
            t.min(self.duration)
        } else {
            t
        }
    }

    fn set_volume(&self, volume: f32) {
        if let Some(sink) = &self.sink {
            sink.set_volume(volume);
        }
    }

    /// 反向停止所有线程并清空队列；重复调用无副作用
    fn stop(&mut self) {
        let was_running = self.is_running();
        if let Some(render) = self.render.as_mut() {
            render.stop();
        }
        if let Some(sink) = self.sink.as_mut() {
            sink.stop();
        }
        if let Some(worker) = self.audio.as_mut() {
            worker.stop();
        }
        if let Some(worker) = self.video.as_mut() {
            worker.stop();
        }
        self.demuxer.stop();
        let dropped = self.queues.flush_all();
        if was_running {
            info!(
                "{} ⏹️ 会话已停止: {} (解码视频帧 {}，音频帧 {}，丢弃 {} 项)",
                log_ctx(),
                self.path,
                self.video.as_ref().map_or(0, |w| w.frames_decoded()),
                self.audio.as_ref().map_or(0, |w| w.frames_decoded()),
                dropped
            );
        }
        self.started = false;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 播放控制器
///
/// 所有公开调用经由内部互斥锁串行化，可在任意线程调用。状态只在状态锁内修改，
/// 启停线程等副作用在状态提交之后、状态锁之外执行。
pub struct PlaybackController {
    config: EngineConfig,
    op_lock: Mutex<()>,
    state: Mutex<PlayerState>,
    session: Mutex<Option<Session>>,
    display: DisplayHandle,
    surface_lock: Mutex<()>,
    surface_cond: Condvar,
    opener: Arc<dyn ContainerOpener>,
    decoders: Arc<dyn DecoderFactory>,
    audio_devices: AudioDeviceFactory,
    events: Sender<PipelineEvent>,
    volume: AtomicU32,
    resume_on_attach: AtomicBool,
    session_has_video: AtomicBool,
    stopped: AtomicBool,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackController {
    pub fn builder() -> PlayerBuilder {
        PlayerBuilder::new()
    }

    fn transition(&self, to: PlayerState) -> bool {
        let mut state = self.state.lock();
        let from = *state;
        if from == to {
            return true;
        }
        if !from.can_transition_to(to) {
            warn!("{} ⚠️ 非法状态转换: {} -> {}", log_ctx(), from, to);
            return false;
        }
        *state = to;
        info!("{} 🔄 状态: {} -> {}", log_ctx(), from, to);
        true
    }

    fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.session.lock().as_mut().map(f)
    }

    fn teardown_session(&self) {
        let old = self.session.lock().take();
        self.session_has_video.store(false, Ordering::Release);
        if let Some(mut session) = old {
            info!("{} 🧹 释放旧会话: {}", log_ctx(), session.path);
            session.stop();
        }
    }

    fn build_session(&self, path: &str) -> Result<Session> {
        let config = &self.config;
        let source = self.opener.open(path)?;
        let video_desc = source.descriptor(StreamKind::Video);
        let audio_desc = source.descriptor(StreamKind::Audio);
        if video_desc.is_none() && audio_desc.is_none() {
            return Err(PlayerError::NoPlayableStream);
        }

        let queues = Queues::new(&config.queues);

        // 视频解码器配置失败直接中止
        let video_decoder = match &video_desc {
            Some(desc) => Some(self.decoders.create(desc)?),
            None => None,
        };

        // 音频解码器配置失败降级为纯视频播放
        let mut audio_decoder = match &audio_desc {
            Some(desc) => match self.decoders.create(desc) {
                Ok(decoder) => Some(decoder),
                Err(e) if video_decoder.is_some() => {
                    warn!("{} ⚠️ 音频解码器不可用，降级为纯视频播放: {}", log_ctx(), e);
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        let has_video = video_decoder.is_some();
        let generation = Arc::new(SeekGeneration::new());
        let mut sync = Arc::new(Synchronizer::new(choose_master(
            config.sync.master,
            audio_decoder.is_some(),
            has_video,
        )));

        let audio_time_base = match (&audio_decoder, &audio_desc) {
            (Some(_), Some(desc)) => Some(desc.time_base),
            _ => None,
        };
        let mut sink = None;
        if let Some(time_base) = audio_time_base {
            let opened = (self.audio_devices)().and_then(|device| -> Result<AudioSink> {
                let mut sink = AudioSink::new(
                    queues.audio_frames.clone(),
                    sync.clone(),
                    generation.clone(),
                    device,
                    &config.audio,
                    Some(self.events.clone()),
                );
                sink.set_volume(self.volume());
                sink.prepare(config.audio.spec(), time_base);
                sink.open()?;
                Ok(sink)
            });
            match opened {
                Ok(opened) => sink = Some(opened),
                Err(e) if has_video => {
                    warn!("{} ⚠️ 音频设备不可用，降级为纯视频播放: {}", log_ctx(), e);
                    audio_decoder = None;
                    sync = Arc::new(Synchronizer::new(choose_master(config.sync.master, false, true)));
                }
                Err(e) => return Err(e),
            }
        }

        let video_packets = video_decoder.as_ref().map(|_| queues.video_packets.clone());
        let audio_packets = audio_decoder.as_ref().map(|_| queues.audio_packets.clone());
        let demuxer = Demuxer::new(source, video_packets, audio_packets, generation.clone(), config);
        let duration = demuxer.get_duration();

        let video = video_decoder.map(|decoder| {
            DecodeWorker::new(
                StreamKind::Video,
                decoder,
                queues.video_packets.clone(),
                queues.video_frames.clone(),
                generation.clone(),
                config,
            )
        });
        let audio = audio_decoder.map(|decoder| {
            DecodeWorker::new(
                StreamKind::Audio,
                decoder,
                queues.audio_packets.clone(),
                queues.audio_frames.clone(),
                generation.clone(),
                config,
            )
        });

        let video_size = video
            .as_ref()
            .and_then(|w| w.video_format())
            .map(|f| (f.width, f.height))
            .or_else(|| video_desc.as_ref().map(|d| (d.width, d.height)))
            .unwrap_or((0, 0));

        let render = video.as_ref().map(|_| {
            RenderFeed::new(
                self.display.clone(),
                queues.video_frames.clone(),
                sync.clone(),
                generation.clone(),
                config,
                Some(self.events.clone()),
            )
        });

        info!(
            "{} ✅ 会话就绪: {} (视频: {}, 音频: {}, {}x{}, 时长 {:.2}s)",
            log_ctx(),
            path,
            video.as_ref().map_or("无", |w| w.decoder_name()),
            audio.as_ref().map_or("无", |w| w.decoder_name()),
            video_size.0,
            video_size.1,
            duration
        );

        Ok(Session {
            path: path.to_string(),
            sync,
            generation,
            queues,
            demuxer,
            video,
            audio,
            sink,
            render,
            duration,
            video_size,
            start_at: 0.0,
            started: false,
        })
    }

    /// 打开媒体并进入 PREPARED
    ///
    /// 已有会话时先拆除旧会话（PLAYING / SEEKING / ERROR 经由 INIT）；
    /// 已经是 PREPARED 时新会话建好后替换旧会话，失败则保留旧会话。
    pub fn prepare(&self, path: &str) -> bool {
        let _op = self.op_lock.lock();
        let from = self.get_player_state();
        match from {
            PlayerState::Stopped => {
                warn!("{} ⚠️ 播放器已停止，不能再 prepare", log_ctx());
                return false;
            }
            PlayerState::Playing | PlayerState::Seeking | PlayerState::Error => {
                self.transition(PlayerState::Init);
                self.teardown_session();
            }
            PlayerState::Paused | PlayerState::Completed => self.teardown_session(),
            PlayerState::Init | PlayerState::Prepared => {}
        }

        info!("{} 📂 准备播放: {}", log_ctx(), path);
        match self.build_session(path) {
            Ok(session) => {
                let has_video = session.has_video();
                let old = self.session.lock().replace(session);
                if let Some(mut old) = old {
                    old.stop();
                }
                self.session_has_video.store(has_video, Ordering::Release);
                self.resume_on_attach.store(false, Ordering::Release);
                self.transition(PlayerState::Prepared)
            }
            Err(e) => {
                error!("{} ❌ 准备播放失败: {}", log_ctx(), e);
                if matches!(from, PlayerState::Paused | PlayerState::Completed) {
                    self.transition(PlayerState::Init);
                }
                false
            }
        }
    }

    fn wait_for_surface(&self) -> bool {
        if !self.session_has_video.load(Ordering::Acquire) {
            return !self.stopped.load(Ordering::Acquire);
        }
        let mut guard = self.surface_lock.lock();
        let mut announced = false;
        while !self.display.has_surface() {
            if self.stopped.load(Ordering::Acquire) {
                return false;
            }
            if !announced {
                info!("{} ⏳ 等待显示表面...", log_ctx());
                announced = true;
            }
            self.surface_cond.wait_for(&mut guard, SURFACE_POLL);
        }
        !self.stopped.load(Ordering::Acquire)
    }

    /// 开始播放；有视频流时阻塞到显示表面就绪
    pub fn playback(&self) -> bool {
        if !self.wait_for_surface() {
            return false;
        }
        let _op = self.op_lock.lock();
        match self.get_player_state() {
            PlayerState::Playing => true,
            PlayerState::Prepared | PlayerState::Paused => self.enter_playing(),
            PlayerState::Completed => self.replay(),
            state => {
                warn!("{} ⚠️ 当前状态 {} 不能开始播放", log_ctx(), state);
                false
            }
        }
    }

    fn enter_playing(&self) -> bool {
        if !self.transition(PlayerState::Playing) {
            return false;
        }
        self.resume_on_attach.store(false, Ordering::Release);
        let result = self
            .with_session(|s| s.resume())
            .unwrap_or_else(|| Err(PlayerError::Other("没有可播放的会话".to_string())));
        if let Err(e) = result {
            error!("{} ❌ 启动播放失败: {}", log_ctx(), e);
            self.transition(PlayerState::Error);
            return false;
        }
        true
    }

    /// COMPLETED 之后从头播放
    fn replay(&self) -> bool {
        if !self.transition(PlayerState::Playing) {
            return false;
        }
        info!("{} 🔁 从头重新播放", log_ctx());
        let result = self
            .with_session(|s| {
                s.seek(0.0);
                s.resume()
            })
            .unwrap_or_else(|| Err(PlayerError::Other("没有可播放的会话".to_string())));
        if let Err(e) = result {
            error!("{} ❌ 重新播放失败: {}", log_ctx(), e);
            self.transition(PlayerState::Error);
            return false;
        }
        true
    }

    pub fn pause(&self) -> bool {
        let _op = self.op_lock.lock();
        match self.get_player_state() {
            PlayerState::Paused => true,
            PlayerState::Playing => {
                self.transition(PlayerState::Paused);
                self.with_session(|s| s.pause());
                info!("{} ⏸️ 已暂停", log_ctx());
                true
            }
            state => {
                debug!("{} 状态 {} 下忽略 pause", log_ctx(), state);
                false
            }
        }
    }

    pub fn resume(&self) -> bool {
        let _op = self.op_lock.lock();
        match self.get_player_state() {
            PlayerState::Playing => true,
            PlayerState::Paused => {
                if self.session_has_video.load(Ordering::Acquire) && !self.display.has_surface() {
                    info!("{} ⏳ 没有显示表面，等表面绑定后再恢复", log_ctx());
                    self.resume_on_attach.store(true, Ordering::Release);
                    return false;
                }
                self.enter_playing()
            }
            PlayerState::Completed => self.replay(),
            state => {
                debug!("{} 状态 {} 下忽略 resume", log_ctx(), state);
                false
            }
        }
    }

    /// 停止并释放所有组件；STOPPED 为终态，再次调用无副作用
    pub fn stop(&self) -> bool {
        self.stopped.store(true, Ordering::Release);
        {
            let _guard = self.surface_lock.lock();
            self.surface_cond.notify_all();
        }

        {
            let _op = self.op_lock.lock();
            if self.get_player_state() == PlayerState::Stopped {
                return true;
            }
            self.transition(PlayerState::Stopped);
            self.teardown_session();
            self.display.post(|display| display.destroy_surface());
        }

        // 事件线程可能正在等 op_lock，放锁之后再 join
        let watcher = self.watcher.lock().take();
        if let Some(handle) = watcher {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("{} ❌ 事件线程 panic", log_ctx());
            }
        }
        info!("{} ⏹️ 播放器已停止", log_ctx());
        true
    }

    /// 跳转到 `seconds`：PLAYING/PAUSED → SEEKING → 原状态
    pub fn seek_to(&self, seconds: f64) -> bool {
        let _op = self.op_lock.lock();
        let from = self.get_player_state();
        if !matches!(from, PlayerState::Playing | PlayerState::Paused) {
            warn!("{} ⚠️ 状态 {} 下不能 seek", log_ctx(), from);
            return false;
        }
        if !self.transition(PlayerState::Seeking) {
            return false;
        }

        let target = self.with_session(|s| {
            let target = s.clamp_target(seconds);
            s.pause();
            s.seek(target);
            target
        });
        info!("{} ⏩ seek 到 {:.3}s", log_ctx(), target.unwrap_or(0.0));

        self.transition(from);
        if from == PlayerState::Playing {
            let result = self.with_session(|s| s.resume()).unwrap_or(Ok(()));
            if let Err(e) = result {
                error!("{} ❌ seek 后恢复播放失败: {}", log_ctx(), e);
                self.transition(PlayerState::Error);
                return false;
            }
        }
        true
    }

    /// 绑定显示表面；失败只返回 false，不改变播放状态
    pub fn attach_surface(&self, surface: SurfaceHandle) -> bool {
        let result = {
            let _op = self.op_lock.lock();
            if self.stopped.load(Ordering::Acquire) {
                return false;
            }
            self.display.call(move |display| display.create_surface(surface))
        };
        let ok = match result {
            Ok(Ok(())) => {
                info!("{} 🖼️ 显示表面已绑定: {:?}", log_ctx(), surface);
                true
            }
            Ok(Err(e)) | Err(e) => {
                error!("{} ❌ 创建显示表面失败: {}", log_ctx(), e);
                false
            }
        };
        {
            let _guard = self.surface_lock.lock();
            self.surface_cond.notify_all();
        }
        if ok && self.resume_on_attach.swap(false, Ordering::AcqRel) {
            info!("{} ▶️ 表面恢复，继续播放", log_ctx());
            self.resume();
        }
        ok
    }

    /// 解绑显示表面；播放中则降为 PAUSED，解码状态保留
    pub fn detach_surface(&self) -> bool {
        let _op = self.op_lock.lock();
        if self.get_player_state() == PlayerState::Playing {
            self.transition(PlayerState::Paused);
            self.with_session(|s| s.pause());
            self.resume_on_attach.store(true, Ordering::Release);
        }
        match self.display.call(|display| display.destroy_surface()) {
            Ok(()) => {
                info!("{} 🖼️ 显示表面已解绑", log_ctx());
                true
            }
            Err(e) => {
                error!("{} ❌ 解绑显示表面失败: {}", log_ctx(), e);
                false
            }
        }
    }

    pub fn surface_size_changed(&self, width: u32, height: u32) {
        debug!("{} 🖼️ 表面尺寸变化: {}x{}", log_ctx(), width, height);
        self.display.post(move |display| display.on_surface_changed(width, height));
    }

    /// 设置音量 (0.0 - 1.0)
    pub fn set_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        self.volume.store(volume.to_bits(), Ordering::Relaxed);
        self.with_session(|s| s.set_volume(volume));
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    pub fn get_player_state(&self) -> PlayerState {
        *self.state.lock()
    }

    /// 时长（秒），没有会话或未知为 0
    pub fn get_duration(&self) -> f64 {
        self.with_session(|s| s.duration).unwrap_or(0.0)
    }

    pub fn get_video_width(&self) -> u32 {
        self.with_session(|s| s.video_size.0).unwrap_or(0)
    }

    pub fn get_video_height(&self) -> u32 {
        self.with_session(|s| s.video_size.1).unwrap_or(0)
    }

    pub fn is_playing(&self) -> bool {
        self.get_player_state() == PlayerState::Playing
    }

    /// 当前播放位置（主时钟，秒）
    pub fn position(&self) -> f64 {
        self.with_session(|s| s.position()).unwrap_or(0.0)
    }

    pub fn status(&self) -> PlayerStatus {
        let (has_audio, has_video) = self.with_session(|s| (s.has_audio(), s.has_video())).unwrap_or((false, false));
        PlayerStatus {
            state: self.get_player_state(),
            position: self.position(),
            duration: self.get_duration(),
            volume: self.volume(),
            width: self.get_video_width(),
            height: self.get_video_height(),
            has_audio,
            has_video,
        }
    }

    fn handle_event(&self, event: PipelineEvent) {
        let PipelineEvent::StreamCompleted(kind) = event;
        let _op = self.op_lock.lock();
        if self.get_player_state() != PlayerState::Playing {
            return;
        }
        let (done, demux_at_end) = self
            .with_session(|s| (s.is_completed(), s.demuxer.is_at_end()))
            .unwrap_or((false, false));
        if !done {
            debug!(
                "{} {} 流已结束，等待其它流（解封装已到末尾: {}）",
                log_ctx(),
                kind.icon(),
                demux_at_end
            );
            return;
        }
        if self.transition(PlayerState::Completed) {
            self.with_session(|s| s.pause());
            info!("{} 🏁 播放完成", log_ctx());
        }
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(mut session) = self.session.get_mut().take() {
            session.stop();
        }
    }
}

fn watch_events(controller: Weak<PlaybackController>, events: Receiver<PipelineEvent>) {
    debug!("{} 📨 事件线程启动", log_ctx());
    loop {
        match events.recv_timeout(EVENT_POLL) {
            Ok(event) => match controller.upgrade() {
                Some(controller) => controller.handle_event(event),
                None => break,
            },
            Err(RecvTimeoutError::Timeout) => match controller.upgrade() {
                Some(controller) if !controller.stopped.load(Ordering::Acquire) => {}
                _ => break,
            },
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("{} 📨 事件线程退出", log_ctx());
}

/// 组装播放控制器：配置、显示端、音频设备、容器打开器、解码器工厂、编解码桥
pub struct PlayerBuilder {
    config: EngineConfig,
    display: Option<Box<dyn DisplayConsumer>>,
    audio_devices: Option<AudioDeviceFactory>,
    opener: Option<Arc<dyn ContainerOpener>>,
    decoders: Option<Arc<dyn DecoderFactory>>,
    bridge: Option<Arc<dyn CodecBridge>>,
}

impl PlayerBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            display: None,
            audio_devices: None,
            opener: None,
            decoders: None,
            bridge: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn display(mut self, display: Box<dyn DisplayConsumer>) -> Self {
        self.display = Some(display);
        self
    }

    pub fn audio_device_factory(mut self, factory: AudioDeviceFactory) -> Self {
        self.audio_devices = Some(factory);
        self
    }

    pub fn container_opener(mut self, opener: Arc<dyn ContainerOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    pub fn decoder_factory(mut self, factory: Arc<dyn DecoderFactory>) -> Self {
        self.decoders = Some(factory);
        self
    }

    /// 平台编解码桥（硬件解码）；未设置解码器工厂时由默认工厂使用
    pub fn codec_bridge(mut self, bridge: Arc<dyn CodecBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn build(self) -> Result<Arc<PlaybackController>> {
        let PlayerBuilder {
            config,
            display,
            audio_devices,
            opener,
            decoders,
            bridge,
        } = self;
        config.validate()?;
        let display = display.ok_or_else(|| PlayerError::ConfigError("缺少显示端".to_string()))?;

        let decoders = decoders
            .unwrap_or_else(|| Arc::new(PlatformDecoderFactory::new(bridge, config.decoder.clone())));
        let opener = opener.unwrap_or_else(|| Arc::new(FfmpegOpener));
        let audio_devices = audio_devices.unwrap_or_else(CpalAudioDevice::factory);
        let (events_tx, events_rx) = crossbeam_channel::unbounded();

        let controller = Arc::new(PlaybackController {
            volume: AtomicU32::new(config.audio.volume.clamp(0.0, 1.0).to_bits()),
            config,
            op_lock: Mutex::new(()),
            state: Mutex::new(PlayerState::Init),
            session: Mutex::new(None),
            display: DisplayHandle::new(display),
            surface_lock: Mutex::new(()),
            surface_cond: Condvar::new(),
            opener,
            decoders,
            audio_devices,
            events: events_tx,
            resume_on_attach: AtomicBool::new(false),
            session_has_video: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            watcher: Mutex::new(None),
        });

        let weak = Arc::downgrade(&controller);
        let watcher = thread::Builder::new()
            .name("player-events".to_string())
            .spawn(move || watch_events(weak, events_rx))?;
        *controller.watcher.lock() = Some(watcher);

        info!("{} 🎮 播放控制器已创建", log_ctx());
        Ok(controller)
    }
}

impl Default for PlayerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
