//! 播放引擎：解封装、软/硬解码、有界队列、音视频同步、音频输出与帧节奏控制，
//! 由 [`PlaybackController`] 状态机统一编排。

pub mod core;
pub mod player;

pub use crate::core::{EngineConfig, PlayerError, PlayerState, PlayerStatus, Result};
pub use crate::player::{PlaybackController, PlayerBuilder};
