use crate::core::{
    Clock, ClockSource, DecodedFrame, EngineConfig, PipelineEvent, PlayerError, Result, SeekGeneration,
    StreamKind, SyncConfig, Synchronizer, WorkerControl,
};
use crate::player::decode_thread::FrameQueue;
use crate::player::log_ctx;
use crossbeam::queue::SegQueue;
use crossbeam_channel::{RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// 宿主提供的显示表面句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(pub u64);

/// 外部显示端：上传、绘制和交换都由它负责，只在渲染线程上被调用
pub trait DisplayConsumer: Send {
    fn create_surface(&mut self, surface: SurfaceHandle) -> Result<()>;
    fn destroy_surface(&mut self);
    fn has_surface(&self) -> bool;
    fn on_surface_changed(&mut self, width: u32, height: u32);
    fn display(&mut self, frame: &DecodedFrame) -> Result<()>;
    fn present(&mut self);
}

pub type RenderTask = Box<dyn FnOnce(&mut dyn DisplayConsumer) + Send>;

/// 投递到渲染线程执行的任务队列（无锁）
#[derive(Default)]
pub struct TaskQueue {
    tasks: SegQueue<RenderTask>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, task: RenderTask) {
        self.tasks.push(task);
    }

    /// 执行当前排队的所有任务，返回执行数量
    pub fn run_all(&self, display: &mut dyn DisplayConsumer) -> usize {
        let mut n = 0;
        while let Some(task) = self.tasks.pop() {
            task(display);
            n += 1;
        }
        n
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// 等待渲染线程执行任务的上限
const CALL_TIMEOUT: Duration = Duration::from_secs(2);

/// 显示端的跨线程入口
///
/// 渲染线程在跑时，操作以任务形式投递过去执行；否则直接在调用线程上执行。
/// 显示端跨会话保留，换源不会丢掉已绑定的表面。
#[derive(Clone)]
pub struct DisplayHandle {
    display: Arc<Mutex<Box<dyn DisplayConsumer>>>,
    tasks: Arc<TaskQueue>,
    render_active: Arc<AtomicBool>,
}

impl DisplayHandle {
    pub fn new(display: Box<dyn DisplayConsumer>) -> Self {
        Self {
            display: Arc::new(Mutex::new(display)),
            tasks: Arc::new(TaskQueue::new()),
            render_active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn has_surface(&self) -> bool {
        self.display.lock().has_surface()
    }

    pub fn is_render_active(&self) -> bool {
        self.render_active.load(Ordering::Acquire)
    }

    /// 执行一个操作并取回结果
    pub fn call<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn DisplayConsumer) -> R + Send + 'static,
    {
        if !self.is_render_active() {
            let mut display = self.display.lock();
            return Ok(f(&mut **display));
        }

        let (tx, rx) = crossbeam_channel::bounded(1);
        self.tasks.post(Box::new(move |display| {
            let _ = tx.send(f(display));
        }));

        let deadline = Instant::now() + CALL_TIMEOUT;
        loop {
            match rx.recv_timeout(Duration::from_millis(10)) {
                Ok(result) => return Ok(result),
                Err(RecvTimeoutError::Timeout) => {
                    // 渲染线程已退出时，剩下的任务由调用方自己执行
                    if !self.is_render_active() {
                        self.run_pending();
                    }
                    if Instant::now() >= deadline {
                        return Err(PlayerError::SurfaceError("渲染线程无响应".to_string()));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(PlayerError::SurfaceError("渲染任务被丢弃".to_string()));
                }
            }
        }
    }

    /// 投递一个不需要结果的操作
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce(&mut dyn DisplayConsumer) + Send + 'static,
    {
        if self.is_render_active() {
            self.tasks.post(Box::new(f));
        } else {
            let mut display = self.display.lock();
            f(&mut **display);
        }
    }

    fn run_pending(&self) -> usize {
        let mut display = self.display.lock();
        self.tasks.run_all(&mut **display)
    }
}

/// 单帧的节奏决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaceDecision {
    Display,
    Wait(Duration),
    Drop,
}

/// `diff = 视频时间 - 主时钟时间`（秒）
///
/// 落后超过阈值立即显示；只有开启丢帧、落后超过丢帧阈值且后面还有帧排队时才丢弃。
/// 超前超过阈值时休眠 `min(上限, diff)` 后再显示。
pub fn pace(diff: f64, frames_waiting: usize, config: &SyncConfig) -> PaceDecision {
    let threshold = config.threshold_secs();
    if diff <= -threshold {
        if config.drop_late_frames && -diff > config.drop_threshold_secs() && frames_waiting > 0 {
            PaceDecision::Drop
        } else {
            PaceDecision::Display
        }
    } else if diff >= threshold {
        PaceDecision::Wait(Duration::from_secs_f64(diff).min(config.max_sleep()))
    } else {
        PaceDecision::Display
    }
}

/// 渲染统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub rendered: u64,
    pub dropped: u64,
    pub late: u64,
    pub skipped: u64,
    /// seek 之前解码出来、没有显示的帧
    pub stale: u64,
}

#[derive(Default)]
struct RenderCounters {
    rendered: AtomicU64,
    dropped: AtomicU64,
    late: AtomicU64,
    skipped: AtomicU64,
    stale: AtomicU64,
}

impl RenderCounters {
    fn snapshot(&self) -> RenderStats {
        RenderStats {
            rendered: self.rendered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            late: self.late.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
        }
    }
}

struct RenderShared {
    control: WorkerControl,
    frames: Arc<FrameQueue>,
    sync: Arc<Synchronizer>,
    generation: Arc<SeekGeneration>,
    display: DisplayHandle,
    config: SyncConfig,
    pop_timeout: Duration,
    events: Option<Sender<PipelineEvent>>,
    stats: RenderCounters,
    completed: AtomicBool,
}

/// 帧节奏线程：取视频帧、与主时钟比较、等待或显示
pub struct RenderFeed {
    shared: Arc<RenderShared>,
    thread_handle: Option<JoinHandle<()>>,
}

impl RenderFeed {
    pub fn new(
        display: DisplayHandle,
        frames: Arc<FrameQueue>,
        sync: Arc<Synchronizer>,
        generation: Arc<SeekGeneration>,
        config: &EngineConfig,
        events: Option<Sender<PipelineEvent>>,
    ) -> Self {
        Self {
            shared: Arc::new(RenderShared {
                control: WorkerControl::new(),
                frames,
                sync,
                generation,
                display,
                config: config.sync.clone(),
                pop_timeout: config.queues.pop_timeout(),
                events,
                stats: RenderCounters::default(),
                completed: AtomicBool::new(false),
            }),
            thread_handle: None,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.thread_handle.is_some() {
            return Ok(());
        }
        let shared = self.shared.clone();
        shared.display.render_active.store(true, Ordering::Release);
        let handle = thread::Builder::new().name("render".to_string()).spawn(move || {
            render_loop(&shared);
            shared.display.render_active.store(false, Ordering::Release);
            shared.display.run_pending();
        });
        match handle {
            Ok(handle) => {
                self.thread_handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.display.render_active.store(false, Ordering::Release);
                Err(e.into())
            }
        }
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
                error!("{} ❌ 渲染线程 panic", log_ctx());
                self.shared.display.render_active.store(false, Ordering::Release);
            }
        }
    }

    pub fn stats(&self) -> RenderStats {
        self.shared.stats.snapshot()
    }

    /// 是否已经消费了结束哨兵（seek 后由 `clear_completed` 复位）
    pub fn is_completed(&self) -> bool {
        self.shared.completed.load(Ordering::Acquire)
    }

    pub fn clear_completed(&self) {
        self.shared.completed.store(false, Ordering::Release);
    }

    /// 等正在进行的一次显示结束；调用前已推进 seek 代数时，之后显示的都是新代数的帧
    pub fn settle(&self) {
        drop(self.shared.display.display.lock());
    }
}

impl Drop for RenderFeed {
    fn drop(&mut self) {
        self.stop();
    }
}

fn render_loop(shared: &RenderShared) {
    info!("{} 🎬 渲染线程启动（主时钟 {:?}）", log_ctx(), shared.sync.master());
    let control = &shared.control;
    let threshold = shared.config.threshold_secs();

    while control.is_running() {
        // 跨线程任务在暂停时也要执行（表面变化等）
        let ran = shared.display.run_pending();
        if ran > 0 {
            debug!("{} 🎬 执行了 {} 个渲染任务", log_ctx(), ran);
        }

        if !control.wait_while_paused(shared.pop_timeout) {
            continue;
        }

        let frame = match shared.frames.pop(shared.pop_timeout) {
            Some(frame) => frame,
            None => continue,
        };

        if !shared.generation.is_current(frame.generation) {
            shared.stats.stale.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        if frame.is_end_of_stream() {
            info!("{} 🎬 视频播放到结尾", log_ctx());
            shared.completed.store(true, Ordering::Release);
            if let Some(events) = &shared.events {
                let _ = events.send(PipelineEvent::StreamCompleted(StreamKind::Video));
            }
            continue;
        }

        let pts = match (frame.pts_seconds(), frame.as_video()) {
            (Some(pts), Some(video)) if video.has_valid_dimensions() => pts,
            _ => {
                shared.stats.skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        // 先读主时钟：主时钟就是视频时钟时不能拿刚写入的值比较
        let master_time = shared.sync.get_current_time();
        shared.sync.update(Clock::new(pts), ClockSource::Video);
        let diff = pts - master_time;

        let mut waited = false;
        match pace(diff, shared.frames.len(), &shared.config) {
            PaceDecision::Drop => {
                let dropped = shared.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped <= 5 || dropped % 100 == 0 {
                    warn!("{} ⚠️ 视频严重落后 {:.0}ms，丢弃帧 (累计 {})", log_ctx(), -diff * 1000.0, dropped);
                }
                continue;
            }
            PaceDecision::Wait(delay) => {
                if !control.sleep(delay) {
                    break;
                }
                waited = true;
            }
            PaceDecision::Display => {
                if diff <= -threshold {
                    shared.stats.late.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let mut display = shared.display.display.lock();
        // 等待期间可能发生了 seek
        if !shared.generation.is_current(frame.generation) {
            drop(display);
            shared.stats.stale.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        if waited {
            // 视频时钟以真正显示的时刻为锚点
            shared.sync.update(Clock::new(pts), ClockSource::Video);
        }
        if display.has_surface() {
            if let Err(e) = display.display(&frame) {
                warn!("{} ⚠️ 显示帧失败: {}", log_ctx(), e);
            }
            display.present();
        }
        drop(display);

        let rendered = shared.stats.rendered.fetch_add(1, Ordering::Relaxed) + 1;
        if rendered % 300 == 0 {
            debug!(
                "{} 🎬 已渲染 {} 帧 (pts {:.3}s, diff {:+.1}ms, 帧队列 {})",
                log_ctx(),
                rendered,
                pts,
                diff * 1000.0,
                shared.frames.len()
            );
        }
    }

    let stats = shared.stats.snapshot();
    info!(
        "{} 🎬 渲染线程结束（显示 {}，丢弃 {}，迟到 {}，跳过 {}，过期 {}）",
        log_ctx(),
        stats.rendered,
        stats.dropped,
        stats.late,
        stats.skipped,
        stats.stale
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BoundedQueue, PixelFormat, TimeBase, VideoData};

    fn sync_config() -> SyncConfig {
        SyncConfig::default()
    }

    #[test]
    fn in_sync_frames_display_immediately() {
        assert_eq!(pace(0.0, 0, &sync_config()), PaceDecision::Display);
        assert_eq!(pace(0.039, 0, &sync_config()), PaceDecision::Display);
        assert_eq!(pace(-0.039, 0, &sync_config()), PaceDecision::Display);
    }

    #[test]
    fn early_frames_wait_up_to_cap() {
        assert_eq!(pace(0.07, 0, &sync_config()), PaceDecision::Wait(Duration::from_millis(70)));
        assert_eq!(pace(3.0, 0, &sync_config()), PaceDecision::Wait(Duration::from_millis(100)));
    }

    #[test]
    fn late_frames_display_unless_dropping_enabled() {
        let mut config = sync_config();
        assert_eq!(pace(-2.0, 5, &config), PaceDecision::Display);

        config.drop_late_frames = true;
        assert_eq!(pace(-2.0, 5, &config), PaceDecision::Drop);
        // 后面没有帧时仍然显示
        assert_eq!(pace(-2.0, 0, &config), PaceDecision::Display);
        assert_eq!(pace(-0.1, 5, &config), PaceDecision::Display);
    }

    #[test]
    fn task_queue_runs_in_order() {
        struct Recorder(Vec<(u32, u32)>);
        impl DisplayConsumer for Recorder {
            fn create_surface(&mut self, _surface: SurfaceHandle) -> Result<()> {
                Ok(())
            }
            fn destroy_surface(&mut self) {}
            fn has_surface(&self) -> bool {
                false
            }
            fn on_surface_changed(&mut self, width: u32, height: u32) {
                self.0.push((width, height));
            }
            fn display(&mut self, _frame: &DecodedFrame) -> Result<()> {
                Ok(())
            }
            fn present(&mut self) {}
        }

        let queue = TaskQueue::new();
        queue.post(Box::new(|d| d.on_surface_changed(1, 1)));
        queue.post(Box::new(|d| d.on_surface_changed(2, 2)));
        let mut recorder = Recorder(Vec::new());
        assert_eq!(queue.run_all(&mut recorder), 2);
        assert_eq!(recorder.0, vec![(1, 1), (2, 2)]);
        assert!(queue.is_empty());
    }

    struct Counting {
        surface: bool,
        shown: Arc<Mutex<Vec<f64>>>,
    }

    impl DisplayConsumer for Counting {
        fn create_surface(&mut self, _surface: SurfaceHandle) -> Result<()> {
            self.surface = true;
            Ok(())
        }
        fn destroy_surface(&mut self) {
            self.surface = false;
        }
        fn has_surface(&self) -> bool {
            self.surface
        }
        fn on_surface_changed(&mut self, _width: u32, _height: u32) {}
        fn display(&mut self, frame: &DecodedFrame) -> Result<()> {
            self.shown.lock().push(frame.pts_seconds().unwrap_or(-1.0));
            Ok(())
        }
        fn present(&mut self) {}
    }

    fn video_frame(pts_ms: i64, width: u32) -> DecodedFrame {
        DecodedFrame::video(
            Some(pts_ms),
            TimeBase::MILLIS,
            VideoData {
                format: PixelFormat::RGBA,
                width,
                height: 2,
                planes: vec![vec![0; width as usize * 8]],
            },
        )
    }

    #[test]
    fn render_thread_displays_in_order_and_skips_invalid() {
        let shown = Arc::new(Mutex::new(Vec::new()));
        let handle = DisplayHandle::new(Box::new(Counting {
            surface: false,
            shown: shown.clone(),
        }));
        handle.call(|d| d.create_surface(SurfaceHandle(1))).unwrap().unwrap();

        let frames: Arc<FrameQueue> = Arc::new(BoundedQueue::new("video-frames", 8));
        let sync = Arc::new(Synchronizer::new(ClockSource::External));
        sync.reset(0.0);
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut feed = RenderFeed::new(
            handle.clone(),
            frames.clone(),
            sync,
            Arc::new(SeekGeneration::new()),
            &EngineConfig::default(),
            Some(tx),
        );

        for (pts, width) in [(0, 2), (10, 0), (20, 2)] {
            frames.push(video_frame(pts, width), Duration::from_millis(10)).unwrap();
        }
        frames.push(DecodedFrame::end_of_stream(), Duration::from_millis(10)).unwrap();
        feed.start().unwrap();

        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event, PipelineEvent::StreamCompleted(StreamKind::Video));
        assert!(feed.is_completed());

        // 渲染线程运行时，表面操作经由任务队列执行
        assert!(handle.is_render_active());
        assert!(handle.call(|d| d.has_surface()).unwrap());
        feed.stop();
        assert!(!handle.is_render_active());

        assert_eq!(*shown.lock(), vec![0.0, 0.02]);
        let stats = feed.stats();
        assert_eq!(stats.rendered, 2);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn frames_from_before_a_seek_are_not_shown() {
        let shown = Arc::new(Mutex::new(Vec::new()));
        let handle = DisplayHandle::new(Box::new(Counting {
            surface: true,
            shown: shown.clone(),
        }));
        let frames: Arc<FrameQueue> = Arc::new(BoundedQueue::new("video-frames", 8));
        let sync = Arc::new(Synchronizer::new(ClockSource::External));
        sync.reset(0.0);
        let generation = Arc::new(SeekGeneration::new());
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut feed = RenderFeed::new(
            handle,
            frames.clone(),
            sync,
            generation.clone(),
            &EngineConfig::default(),
            Some(tx),
        );

        frames.push(video_frame(0, 2), Duration::from_millis(10)).unwrap();
        frames.push(DecodedFrame::end_of_stream(), Duration::from_millis(10)).unwrap();
        generation.advance();
        frames.push(video_frame(20, 2).with_generation(1), Duration::from_millis(10)).unwrap();
        frames
            .push(DecodedFrame::end_of_stream().with_generation(1), Duration::from_millis(10))
            .unwrap();
        feed.start().unwrap();

        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event, PipelineEvent::StreamCompleted(StreamKind::Video));
        feed.settle();
        feed.stop();
        assert!(rx.try_recv().is_err());

        assert_eq!(*shown.lock(), vec![0.02]);
        let stats = feed.stats();
        assert_eq!(stats.rendered, 1);
        assert_eq!(stats.stale, 2);
    }
}
