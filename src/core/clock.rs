use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// 时钟来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockSource {
    Audio,
    Video,
    External,
}

impl ClockSource {
    fn slot(self) -> usize {
        match self {
            ClockSource::Audio => 0,
            ClockSource::Video => 1,
            ClockSource::External => 2,
        }
    }
}

/// 单个时钟：`now() = pts + (当前墙钟 - 更新时刻)`
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    pts: f64,             // 秒
    updated_at: Instant,
}

impl Clock {
    pub fn new(pts: f64) -> Self {
        Self::at(pts, Instant::now())
    }

    pub fn at(pts: f64, updated_at: Instant) -> Self {
        Self { pts, updated_at }
    }

    pub fn pts(&self) -> f64 {
        self.pts
    }

    pub fn updated_at(&self) -> Instant {
        self.updated_at
    }

    pub fn now(&self) -> f64 {
        self.now_at(Instant::now())
    }

    pub fn now_at(&self, instant: Instant) -> f64 {
        self.pts + instant.saturating_duration_since(self.updated_at).as_secs_f64()
    }

    fn shift(&mut self, d: Duration) {
        self.updated_at += d;
    }
}

struct SyncInner {
    clocks: [Clock; 3],
    frozen_at: Option<Instant>,
}

/// 音视频同步器：持有音频、视频、外部三个独立时钟，并报告主时钟时间
///
/// 主时钟在构造时确定。暂停时所有时钟冻结在暂停时刻，恢复时整体平移，
/// 因此暂停期间的墙钟流逝不会计入播放位置。
pub struct Synchronizer {
    master: ClockSource,
    inner: Mutex<SyncInner>,
}

impl Synchronizer {
    pub fn new(master: ClockSource) -> Self {
        let now = Instant::now();
        Self {
            master,
            inner: Mutex::new(SyncInner {
                clocks: [Clock::at(0.0, now); 3],
                frozen_at: None,
            }),
        }
    }

    pub fn master(&self) -> ClockSource {
        self.master
    }

    /// 覆盖指定来源的时钟
    pub fn update(&self, clock: Clock, source: ClockSource) {
        let mut inner = self.inner.lock();
        let clock = match inner.frozen_at {
            // 冻结期间写入的时钟以冻结时刻为锚点
            Some(frozen) if clock.updated_at > frozen => Clock::at(clock.pts, frozen),
            _ => clock,
        };
        inner.clocks[source.slot()] = clock;
    }

    pub fn clock(&self, source: ClockSource) -> Clock {
        self.inner.lock().clocks[source.slot()]
    }

    /// 指定来源的当前时间（秒）
    pub fn time_of(&self, source: ClockSource) -> f64 {
        let inner = self.inner.lock();
        let at = inner.frozen_at.unwrap_or_else(Instant::now);
        inner.clocks[source.slot()].now_at(at)
    }

    /// 主时钟当前时间（秒）
    pub fn get_current_time(&self) -> f64 {
        self.time_of(self.master)
    }

    /// 把三个时钟统一重置到 `pts`
    pub fn reset(&self, pts: f64) {
        let mut inner = self.inner.lock();
        let at = inner.frozen_at.unwrap_or_else(Instant::now);
        inner.clocks = [Clock::at(pts, at); 3];
    }

    pub fn freeze(&self) {
        let mut inner = self.inner.lock();
        if inner.frozen_at.is_none() {
            inner.frozen_at = Some(Instant::now());
        }
    }

    pub fn unfreeze(&self) {
        let mut inner = self.inner.lock();
        if let Some(frozen) = inner.frozen_at.take() {
            let paused_for = frozen.elapsed();
            for clock in inner.clocks.iter_mut() {
                clock.shift(paused_for);
            }
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.lock().frozen_at.is_some()
    }
}

impl Default for Synchronizer {
    fn default() -> Self {
        Self::new(ClockSource::Audio)
    }
}
