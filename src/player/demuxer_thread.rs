use crate::core::{
    Backpressure, BoundedQueue, EncodedPacket, EngineConfig, PushError, Result, SeekGeneration,
    StreamDescriptor, StreamKind, WorkerControl,
};
use crate::player::demuxer_source::{ContainerSource, ReadOutcome};
use crate::player::log_ctx;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub type PacketQueue = BoundedQueue<EncodedPacket>;

const LOG_FIRST_N: u64 = 5;

#[derive(Default)]
struct DemuxStats {
    video_packets: AtomicU64,
    audio_packets: AtomicU64,
    skipped: AtomicU64,
    stale: AtomicU64,
}

struct DemuxShared {
    source: Mutex<Box<dyn ContainerSource>>,
    control: WorkerControl,
    pending_seek: Mutex<Option<f64>>,
    generation: Arc<SeekGeneration>,
    at_eos: AtomicBool,
    video_queue: Option<Arc<PacketQueue>>,
    audio_queue: Option<Arc<PacketQueue>>,
    backpressure: Backpressure,
    push_timeout: Duration,
    eos_poll: Duration,
    stats: DemuxStats,
}

/// 解封装器：持有容器源和读包线程
///
/// - 读到的包按流类型推入各自的有界包队列
/// - `seek_to` 只记录目标（电平触发），由读包线程执行
/// - 每个包带着读取时的 seek 代数；投递前代数已过期的包直接丢弃
/// - 读到末尾后推入结束标记，然后按固定间隔空转等待 seek / stop
pub struct Demuxer {
    shared: Arc<DemuxShared>,
    video: Option<StreamDescriptor>,
    audio: Option<StreamDescriptor>,
    duration: f64,
    thread_handle: Option<JoinHandle<()>>,
}

impl Demuxer {
    pub fn new(
        source: Box<dyn ContainerSource>,
        video_queue: Option<Arc<PacketQueue>>,
        audio_queue: Option<Arc<PacketQueue>>,
        generation: Arc<SeekGeneration>,
        config: &EngineConfig,
    ) -> Self {
        let video = source.descriptor(StreamKind::Video);
        let audio = source.descriptor(StreamKind::Audio);
        let duration = source.duration();
        info!(
            "{} 📦 Demuxer 就绪: {} (时长 {:.2}s, 视频: {}, 音频: {})",
            log_ctx(),
            source.description(),
            duration,
            video.is_some(),
            audio.is_some()
        );

        // 没有对应流就不需要对应的队列
        let video_queue = video_queue.filter(|_| video.is_some());
        let audio_queue = audio_queue.filter(|_| audio.is_some());

        Self {
            shared: Arc::new(DemuxShared {
                source: Mutex::new(source),
                control: WorkerControl::new(),
                pending_seek: Mutex::new(None),
                generation,
                at_eos: AtomicBool::new(false),
                video_queue,
                audio_queue,
                backpressure: config.demux_backpressure,
                push_timeout: config.queues.push_timeout(),
                eos_poll: Duration::from_millis(config.demux.eos_poll_ms),
                stats: DemuxStats::default(),
            }),
            video,
            audio,
            duration,
            thread_handle: None,
        }
    }

    /// 配置解码器所需的流描述
    pub fn get_codec_parameters(&self, kind: StreamKind) -> Option<StreamDescriptor> {
        match kind {
            StreamKind::Video => self.video.clone(),
            StreamKind::Audio => self.audio.clone(),
        }
    }

    pub fn has_stream(&self, kind: StreamKind) -> bool {
        match kind {
            StreamKind::Video => self.video.is_some(),
            StreamKind::Audio => self.audio.is_some(),
        }
    }

    /// 容器时长（秒），未知为 0
    pub fn get_duration(&self) -> f64 {
        self.duration
    }

    /// 记录 seek 目标；连续多次调用只有最后一次生效
    pub fn seek_to(&self, seconds: f64) {
        info!("{} ⏩ Demuxer 记录 seek 目标: {:.3}s", log_ctx(), seconds);
        *self.shared.pending_seek.lock() = Some(seconds.max(0.0));
    }

    pub fn has_pending_seek(&self) -> bool {
        self.shared.pending_seek.lock().is_some()
    }

    pub fn is_at_end(&self) -> bool {
        self.shared.at_eos.load(Ordering::SeqCst)
    }

    pub fn start(&mut self) -> Result<()> {
        if self.thread_handle.is_some() {
            return Ok(());
        }
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("demuxer".into())
            .spawn(move || demux_loop(&shared))?;
        self.thread_handle = Some(handle);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.thread_handle.is_some()
    }

    pub fn pause(&self) {
        self.shared.control.pause();
    }

    pub fn resume(&self) {
        self.shared.control.resume();
    }

    /// 停止并 join 读包线程；重复调用无副作用
    pub fn stop(&mut self) {
        self.shared.control.stop();
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                error!("{} ❌ Demuxer 线程 panic", log_ctx());
            }
            info!("{} ✅ Demuxer 线程已停止", log_ctx());
        }
    }
}

impl Drop for Demuxer {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            warn!("{} ⚠ Demuxer 被 drop 时线程仍在运行，正在停止", log_ctx());
            self.stop();
        }
    }
}

fn demux_loop(shared: &DemuxShared) {
    info!("{} 🎬 Demuxer 线程启动", log_ctx());
    let control = &shared.control;
    let mut generation = shared.generation.current();

    while control.is_running() {
        if !control.wait_while_paused(shared.eos_poll) {
            continue;
        }

        let pending = shared.pending_seek.lock().take();
        if let Some(target) = pending {
            generation = perform_seek(shared, target);
            continue;
        }

        if shared.at_eos.load(Ordering::SeqCst) {
            control.sleep(shared.eos_poll);
            continue;
        }

        let depth = [&shared.video_queue, &shared.audio_queue]
            .iter()
            .filter_map(|q| q.as_ref().map(|q| q.len()))
            .max()
            .unwrap_or(0);
        if depth > shared.backpressure.hard_limit {
            control.sleep(Duration::from_millis(shared.backpressure.hard_sleep_ms));
            continue;
        }
        if let Some(delay) = shared.backpressure.delay_for(depth) {
            control.sleep(delay);
        }

        let outcome = shared.source.lock().read_packet();
        match outcome {
            ReadOutcome::Packet(packet) => {
                let counter = match packet.stream {
                    StreamKind::Video => &shared.stats.video_packets,
                    StreamKind::Audio => &shared.stats.audio_packets,
                };
                let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
                if n <= LOG_FIRST_N || n % 500 == 0 {
                    debug!(
                        "{} {} Demuxer 读取{}包 #{} (pts={:?})",
                        log_ctx(),
                        packet.stream.icon(),
                        packet.stream.as_str(),
                        n,
                        packet.pts
                    );
                }
                deliver(shared, packet.with_generation(generation));
            }
            ReadOutcome::Skipped => {
                shared.stats.skipped.fetch_add(1, Ordering::Relaxed);
            }
            ReadOutcome::EndOfStream => {
                info!("{} 📄 Demuxer 到达文件末尾，发送结束标记并等待命令（Seek/Stop）", log_ctx());
                for kind in active_streams(shared) {
                    deliver(shared, EncodedPacket::end_marker(kind).with_generation(generation));
                }
                shared.at_eos.store(true, Ordering::SeqCst);
            }
        }
    }

    info!(
        "{} 🛑 Demuxer 线程退出（视频包 {}，音频包 {}，跳过 {}，过期 {}）",
        log_ctx(),
        shared.stats.video_packets.load(Ordering::Relaxed),
        shared.stats.audio_packets.load(Ordering::Relaxed),
        shared.stats.skipped.load(Ordering::Relaxed),
        shared.stats.stale.load(Ordering::Relaxed)
    );
}

fn active_streams(shared: &DemuxShared) -> Vec<StreamKind> {
    let mut kinds = Vec::with_capacity(2);
    if shared.video_queue.is_some() {
        kinds.push(StreamKind::Video);
    }
    if shared.audio_queue.is_some() {
        kinds.push(StreamKind::Audio);
    }
    kinds
}

/// 依次尝试视频流、音频流、不指定流；返回之后读到的包所属的代数
///
/// seek 失败时也发出 flush 标记，下游照常切换到新的代数，只是数据从当前位置继续。
fn perform_seek(shared: &DemuxShared, target: f64) -> u64 {
    let generation = shared.generation.current();
    let mut candidates = Vec::with_capacity(3);
    if shared.video_queue.is_some() {
        candidates.push(Some(StreamKind::Video));
    }
    if shared.audio_queue.is_some() {
        candidates.push(Some(StreamKind::Audio));
    }
    candidates.push(None);

    let mut succeeded = false;
    {
        let mut source = shared.source.lock();
        for stream in candidates {
            match source.seek(target, stream) {
                Ok(()) => {
                    info!("{} ✅ Demuxer seek 成功: {:.3}s (stream={:?})", log_ctx(), target, stream);
                    succeeded = true;
                    break;
                }
                Err(e) => warn!("{} ⚠️ seek {:.3}s 失败 (stream={:?}): {}", log_ctx(), target, stream, e),
            }
        }
    }

    if succeeded {
        shared.at_eos.store(false, Ordering::SeqCst);
    } else {
        error!("{} ❌ Demuxer seek {:.3}s 全部失败，继续从当前位置读取", log_ctx(), target);
    }

    for kind in active_streams(shared) {
        if let Some(queue) = queue_for(shared, kind) {
            let dropped = queue.flush();
            queue.resume();
            if dropped > 0 {
                debug!("{} 🧹 清空{}包队列: {} 个", log_ctx(), kind.as_str(), dropped);
            }
        }
        deliver(shared, EncodedPacket::flush_marker(kind).with_generation(generation));
    }
    generation
}

fn queue_for(shared: &DemuxShared, kind: StreamKind) -> Option<&Arc<PacketQueue>> {
    match kind {
        StreamKind::Video => shared.video_queue.as_ref(),
        StreamKind::Audio => shared.audio_queue.as_ref(),
    }
}

/// 推入对应的包队列；队列满时重试，flush 或代数过期时丢弃
fn deliver(shared: &DemuxShared, packet: EncodedPacket) {
    let queue = match queue_for(shared, packet.stream) {
        Some(queue) => queue,
        None => return,
    };
    let control = &shared.control;
    let mut item = packet;
    loop {
        if !shared.generation.is_current(item.generation) {
            let stale = shared.stats.stale.fetch_add(1, Ordering::Relaxed) + 1;
            if stale <= LOG_FIRST_N {
                debug!("{} 🧹 丢弃 seek 前读到的{}包 (pts={:?})", log_ctx(), item.stream.as_str(), item.pts);
            }
            return;
        }
        match queue.push(item, shared.push_timeout) {
            Ok(()) => return,
            Err(PushError::Flushing(_)) => return,
            Err(PushError::Timeout(back)) => {
                if !control.is_running() {
                    return;
                }
                item = back;
            }
            Err(PushError::Paused(back)) => {
                if control.is_paused() {
                    control.wait_while_paused(shared.eos_poll);
                } else {
                    control.sleep(shared.push_timeout);
                }
                if !control.is_running() {
                    return;
                }
                item = back;
            }
        }
    }
}
