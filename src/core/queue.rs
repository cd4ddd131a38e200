use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// 入队失败时原样交还数据
pub enum PushError<T> {
    /// 等待超时，队列仍满
    Timeout(T),
    /// 队列正在 flush，数据已过期
    Flushing(T),
    /// 队列被暂停，调用方保留数据稍后重试
    Paused(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Timeout(item) | PushError::Flushing(item) | PushError::Paused(item) => item,
        }
    }

    pub fn is_flushing(&self) -> bool {
        matches!(self, PushError::Flushing(_))
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Timeout(_) => f.write_str("Timeout(..)"),
            PushError::Flushing(_) => f.write_str("Flushing(..)"),
            PushError::Paused(_) => f.write_str("Paused(..)"),
        }
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    flushing: bool,
    paused: bool,
}

/// 线程安全的有界阻塞队列
///
/// - `push`/`pop` 都有超时，等待期间遇到 flush 或 pause 立即返回失败
/// - `flush` 丢弃（释放）所有数据并保持 flushing，直到 `resume`
/// - `pause` 只唤醒等待者，不丢数据
pub struct BoundedQueue<T> {
    name: &'static str,
    capacity: usize,
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                flushing: false,
                paused: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn is_flushing(&self) -> bool {
        self.state.lock().flushing
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// 阻塞入队，最多等待 `timeout`
    pub fn push(&self, item: T, timeout: Duration) -> Result<(), PushError<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.flushing {
                return Err(PushError::Flushing(item));
            }
            if state.paused {
                return Err(PushError::Paused(item));
            }
            if state.items.len() < self.capacity {
                state.items.push_back(item);
                drop(state);
                self.not_empty.notify_one();
                return Ok(());
            }
            if self.not_full.wait_until(&mut state, deadline).timed_out() {
                // 超时前最后检查一次
                if !state.flushing && !state.paused && state.items.len() < self.capacity {
                    continue;
                }
                return Err(if state.flushing {
                    PushError::Flushing(item)
                } else if state.paused {
                    PushError::Paused(item)
                } else {
                    PushError::Timeout(item)
                });
            }
        }
    }

    /// 阻塞出队，最多等待 `timeout`；空、flush 或暂停时返回 `None`
    pub fn pop(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.flushing || state.paused {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                if state.flushing || state.paused {
                    return None;
                }
                let item = state.items.pop_front();
                if item.is_some() {
                    drop(state);
                    self.not_full.notify_one();
                }
                return item;
            }
        }
    }

    /// 非阻塞出队（音频回调中使用）
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        if state.flushing || state.paused {
            return None;
        }
        let item = state.items.pop_front();
        if item.is_some() {
            drop(state);
            self.not_full.notify_one();
        }
        item
    }

    /// 标记 flushing，丢弃全部数据并唤醒所有等待者；返回丢弃的数量
    pub fn flush(&self) -> usize {
        let drained: Vec<T> = {
            let mut state = self.state.lock();
            state.flushing = true;
            state.items.drain(..).collect()
        };
        self.not_empty.notify_all();
        self.not_full.notify_all();
        // 在锁外释放，避免 Drop（如平台缓冲归还）持锁执行
        let count = drained.len();
        drop(drained);
        count
    }

    /// 唤醒等待者但不丢数据
    pub fn pause(&self) {
        self.state.lock().paused = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// 清除 flushing / paused 标记，重新接受读写
    pub fn resume(&self) {
        {
            let mut state = self.state.lock();
            state.flushing = false;
            state.paused = false;
        }
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BoundedQueue")
            .field("name", &self.name)
            .field("len", &state.items.len())
            .field("capacity", &self.capacity)
            .field("flushing", &state.flushing)
            .field("paused", &state.paused)
            .finish()
    }
}
