use crate::core::{
    AudioFormat, Backpressure, BoundedQueue, DecodedFrame, EngineConfig, PacketKind, PlayerError,
    PushError, Result, SeekGeneration, StreamKind, VideoFormat, WorkerControl,
};
use crate::player::decoder::{Decoder, Received};
use crate::player::demuxer_thread::PacketQueue;
use crate::player::log_ctx;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub type FrameQueue = BoundedQueue<DecodedFrame>;

/// 结束标记后等待异步解码器排空的最大轮询次数
const MAX_DRAIN_POLLS: u32 = 500;

#[derive(Default)]
struct DecodeStats {
    packets: AtomicU64,
    frames: AtomicU64,
    send_errors: AtomicU64,
    stale: AtomicU64,
}

struct DecodeShared {
    kind: StreamKind,
    control: WorkerControl,
    packets: Arc<PacketQueue>,
    frames: Arc<FrameQueue>,
    generation: Arc<SeekGeneration>,
    backpressure: Backpressure,
    pop_timeout: Duration,
    push_timeout: Duration,
    try_again_sleep: Duration,
    stats: DecodeStats,
}

/// 单条流的解码线程
///
/// 包队列 → 解码器 → 帧队列，处理 flush / 结束标记，按帧队列深度限流。
/// 帧沿用最近一个包的 seek 代数，代数过期的包和帧都不再往下游送。
pub struct DecodeWorker {
    shared: Arc<DecodeShared>,
    decoder: Option<Box<dyn Decoder>>,
    decoder_name: String,
    video_format: Option<VideoFormat>,
    audio_format: Option<AudioFormat>,
    thread_handle: Option<JoinHandle<()>>,
}

impl DecodeWorker {
    pub fn new(
        kind: StreamKind,
        decoder: Box<dyn Decoder>,
        packets: Arc<PacketQueue>,
        frames: Arc<FrameQueue>,
        generation: Arc<SeekGeneration>,
        config: &EngineConfig,
    ) -> Self {
        let backpressure = match kind {
            StreamKind::Video => config.video_backpressure,
            StreamKind::Audio => config.audio_backpressure,
        };
        Self {
            decoder_name: decoder.name().to_string(),
            video_format: decoder.video_format(),
            audio_format: decoder.audio_format(),
            decoder: Some(decoder),
            shared: Arc::new(DecodeShared {
                kind,
                control: WorkerControl::new(),
                packets,
                frames,
                generation,
                backpressure,
                pop_timeout: config.queues.pop_timeout(),
                push_timeout: config.queues.push_timeout(),
                try_again_sleep: Duration::from_millis(config.decoder.try_again_sleep_ms),
                stats: DecodeStats::default(),
            }),
            thread_handle: None,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.shared.kind
    }

    pub fn decoder_name(&self) -> &str {
        &self.decoder_name
    }

    pub fn video_format(&self) -> Option<VideoFormat> {
        self.video_format
    }

    pub fn audio_format(&self) -> Option<AudioFormat> {
        self.audio_format
    }

    pub fn start(&mut self) -> Result<()> {
        if self.thread_handle.is_some() {
            return Ok(());
        }
        let mut decoder = self
            .decoder
            .take()
            .ok_or_else(|| PlayerError::Other("解码线程已经启动过".to_string()))?;
        let shared = self.shared.clone();
        let name = format!("{}-decoder", shared.kind.as_str());
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || decode_loop(&shared, decoder.as_mut()))?;
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

    pub fn stop(&mut self) {
        self.shared.control.stop();
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                error!("{} ❌ {} 解码线程 panic", log_ctx(), self.shared.kind.as_str());
            }
        }
    }

    pub fn frames_decoded(&self) -> u64 {
        self.shared.stats.frames.load(Ordering::Relaxed)
    }
}

impl Drop for DecodeWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn decode_loop(shared: &DecodeShared, decoder: &mut dyn Decoder) {
    let icon = shared.kind.icon();
    info!("{} {} {} 解码线程启动: {}", log_ctx(), icon, shared.kind.as_str(), decoder.name());
    let control = &shared.control;
    let mut generation = shared.generation.current();

    while control.is_running() {
        if !control.wait_while_paused(shared.pop_timeout) {
            continue;
        }

        // ========== 队列限流：防止过度解码 ==========
        let depth = shared.frames.len();
        if depth > shared.backpressure.hard_limit {
            control.sleep(Duration::from_millis(shared.backpressure.hard_sleep_ms));
            continue;
        }
        if let Some(delay) = shared.backpressure.delay_for(depth) {
            control.sleep(delay);
        }

        let packet = match shared.packets.pop(shared.pop_timeout) {
            Some(packet) => packet,
            None => continue,
        };

        if packet.kind != PacketKind::Flush && !shared.generation.is_current(packet.generation) {
            let stale = shared.stats.stale.fetch_add(1, Ordering::Relaxed) + 1;
            if stale <= 5 {
                debug!("{} {} 丢弃 seek 前的包 (pts={:?})", log_ctx(), icon, packet.pts);
            }
            continue;
        }

        match packet.kind {
            PacketKind::Flush => {
                generation = packet.generation;
                decoder.flush();
                let dropped = shared.frames.flush();
                shared.frames.resume();
                debug!("{} {} 收到 flush 标记（代数 {}），丢弃 {} 帧", log_ctx(), icon, generation, dropped);
            }
            PacketKind::EndOfStream => {
                generation = packet.generation;
                info!("{} {} 收到结束标记，排空解码器", log_ctx(), icon);
                if let Err(e) = decoder.signal_end_of_stream() {
                    warn!("{} {} 通知解码器结束失败: {}", log_ctx(), icon, e);
                }
                drain(shared, decoder, generation, true);
                deliver(shared, DecodedFrame::end_of_stream().with_generation(generation));
            }
            PacketKind::Data => {
                generation = packet.generation;
                let n = shared.stats.packets.fetch_add(1, Ordering::Relaxed) + 1;
                if let Err(e) = decoder.send_packet(&packet) {
                    let errors = shared.stats.send_errors.fetch_add(1, Ordering::Relaxed) + 1;
                    if errors <= 5 || errors % 100 == 0 {
                        warn!("{} {} 解码错误（已跳过包 #{}）: {}", log_ctx(), icon, n, e);
                    }
                    continue;
                }
                drain(shared, decoder, generation, false);
            }
        }
    }

    info!(
        "{} {} {} 解码线程结束（包 {}，帧 {}，失败 {}，过期 {}）",
        log_ctx(),
        icon,
        shared.kind.as_str(),
        shared.stats.packets.load(Ordering::Relaxed),
        shared.stats.frames.load(Ordering::Relaxed),
        shared.stats.send_errors.load(Ordering::Relaxed),
        shared.stats.stale.load(Ordering::Relaxed)
    );
}

/// 取出解码器当前能给出的全部帧；`until_end` 时一直等到解码器报告结束
fn drain(shared: &DecodeShared, decoder: &mut dyn Decoder, generation: u64, until_end: bool) {
    let mut polls = 0;
    while shared.control.is_running() {
        match decoder.receive_frame() {
            Ok(Received::Frame(frame)) => {
                let n = shared.stats.frames.fetch_add(1, Ordering::Relaxed) + 1;
                if n % 500 == 0 {
                    debug!(
                        "{} {} 已解码 {} 帧（帧队列 {}）",
                        log_ctx(),
                        shared.kind.icon(),
                        n,
                        shared.frames.len()
                    );
                }
                deliver(shared, frame.with_generation(generation));
            }
            Ok(Received::TryAgain) => {
                if !until_end {
                    return;
                }
                polls += 1;
                if polls > MAX_DRAIN_POLLS {
                    warn!("{} {} 等待解码器排空超时", log_ctx(), shared.kind.icon());
                    return;
                }
                shared.control.sleep(shared.try_again_sleep);
            }
            Ok(Received::EndOfStream) => return,
            Err(e) => {
                warn!("{} {} 取帧失败（已跳过）: {}", log_ctx(), shared.kind.icon(), e);
                return;
            }
        }
    }
}

/// 推入帧队列；flush 中或代数过期的帧直接释放
fn deliver(shared: &DecodeShared, frame: DecodedFrame) {
    let control = &shared.control;
    let mut item = frame;
    loop {
        if !shared.generation.is_current(item.generation) {
            shared.stats.stale.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match shared.frames.push(item, shared.push_timeout) {
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
                    control.wait_while_paused(shared.pop_timeout);
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
