use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 背压阈值：下游队列深度超过软上限时小睡，超过硬上限时多睡
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backpressure {
    pub soft_limit: usize,
    pub hard_limit: usize,
    pub soft_sleep_ms: u64,
    pub hard_sleep_ms: u64,
}

impl Backpressure {
    pub const fn new(soft_limit: usize, hard_limit: usize, soft_sleep_ms: u64, hard_sleep_ms: u64) -> Self {
        Self {
            soft_limit,
            hard_limit,
            soft_sleep_ms,
            hard_sleep_ms,
        }
    }

    /// 给定下游深度，生产者应休眠的时长
    pub fn delay_for(&self, depth: usize) -> Option<Duration> {
        if depth > self.hard_limit {
            Some(Duration::from_millis(self.hard_sleep_ms))
        } else if depth > self.soft_limit {
            Some(Duration::from_millis(self.soft_sleep_ms))
        } else {
            None
        }
    }
}

struct ControlState {
    running: bool,
    paused: bool,
}

/// 工作线程的运行 / 暂停控制
///
/// 所有等待都有上限，`stop()` 会唤醒处于暂停或休眠中的线程。
pub struct WorkerControl {
    state: Mutex<ControlState>,
    cond: Condvar,
}

impl WorkerControl {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ControlState {
                running: true,
                paused: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// 以暂停状态创建
    pub fn paused() -> Self {
        let control = Self::new();
        control.state.lock().paused = true;
        control
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn pause(&self) {
        self.state.lock().paused = true;
        self.cond.notify_all();
    }

    pub fn resume(&self) {
        self.state.lock().paused = false;
        self.cond.notify_all();
    }

    pub fn stop(&self) {
        self.state.lock().running = false;
        self.cond.notify_all();
    }

    /// 暂停期间最多等待 `timeout`；返回 true 表示可以继续干活
    pub fn wait_while_paused(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.running && state.paused {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.running && !state.paused
    }

    /// 可被 `stop()` 打断的休眠；返回是否仍在运行
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut state = self.state.lock();
        while state.running {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.running
    }
}

impl Default for WorkerControl {
    fn default() -> Self {
        Self::new()
    }
}

/// seek 代数：每次 seek 加一
///
/// 包和帧带着产生时的代数在队列里流动，各阶段只处理当前代数的数据，
/// 旧代数的数据即使在 flush 之后才被推入队列也会被丢弃。
#[derive(Debug, Default)]
pub struct SeekGeneration(AtomicU64);

impl SeekGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// 进入下一代，返回新的代数
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.current() == generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn backpressure_tiers() {
        let bp = Backpressure::new(12, 20, 2, 10);
        assert_eq!(bp.delay_for(5), None);
        assert_eq!(bp.delay_for(12), None);
        assert_eq!(bp.delay_for(13), Some(Duration::from_millis(2)));
        assert_eq!(bp.delay_for(21), Some(Duration::from_millis(10)));
    }

    #[test]
    fn stop_interrupts_sleep() {
        let control = Arc::new(WorkerControl::new());
        let c = control.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let running = c.sleep(Duration::from_secs(5));
            (running, start.elapsed())
        });
        thread::sleep(Duration::from_millis(20));
        control.stop();
        let (running, elapsed) = handle.join().unwrap();
        assert!(!running);
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn resume_releases_paused_waiter() {
        let control = Arc::new(WorkerControl::paused());
        assert!(!control.wait_while_paused(Duration::from_millis(10)));
        let c = control.clone();
        let handle = thread::spawn(move || c.wait_while_paused(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        control.resume();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn generation_advances_and_expires_old_tags() {
        let generation = SeekGeneration::new();
        assert!(generation.is_current(0));
        assert_eq!(generation.advance(), 1);
        assert!(!generation.is_current(0));
        assert!(generation.is_current(1));
    }
}
