use crate::core::clock::ClockSource;
use crate::core::control::Backpressure;
use crate::core::error::{PlayerError, Result};
use crate::core::types::AudioSpec;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 队列容量与等待超时
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub video_packets: usize,
    pub audio_packets: usize,
    pub video_frames: usize,
    pub audio_frames: usize,
    pub pop_timeout_ms: u64,
    pub push_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            video_packets: 256,
            audio_packets: 256,
            video_frames: 24,
            audio_frames: 96,
            pop_timeout_ms: 10,
            push_timeout_ms: 20,
        }
    }
}

impl QueueConfig {
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }
}

/// 同步与帧节奏
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// 同步阈值，|diff| 小于它视为同步
    pub threshold_ms: u64,
    /// 视频超前时单次休眠上限
    pub max_sleep_ms: u64,
    /// 严重落后时是否丢帧（默认关闭，每一帧都显示）
    pub drop_late_frames: bool,
    pub drop_threshold_ms: u64,
    pub master: ClockSource,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            threshold_ms: 40,
            max_sleep_ms: 100,
            drop_late_frames: false,
            drop_threshold_ms: 500,
            master: ClockSource::Audio,
        }
    }
}

impl SyncConfig {
    pub fn threshold_secs(&self) -> f64 {
        self.threshold_ms as f64 / 1000.0
    }

    pub fn drop_threshold_secs(&self) -> f64 {
        self.drop_threshold_ms as f64 / 1000.0
    }

    pub fn max_sleep(&self) -> Duration {
        Duration::from_millis(self.max_sleep_ms)
    }
}

/// 音频重采样实现
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResamplerKind {
    /// FFmpeg swresample
    #[default]
    Swr,
    /// 纯 Rust 线性插值
    Linear,
}

/// 音频输出格式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub buffer_frames: usize,
    pub volume: f32,
    pub resampler: ResamplerKind,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            buffer_frames: 2048,
            volume: 1.0,
            resampler: ResamplerKind::Swr,
        }
    }
}

impl AudioConfig {
    pub fn spec(&self) -> AudioSpec {
        AudioSpec {
            sample_rate: self.sample_rate,
            channels: self.channels,
            buffer_frames: self.buffer_frames,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemuxConfig {
    /// 读到文件末尾后的轮询间隔
    pub eos_poll_ms: u64,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self { eos_poll_ms: 100 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodingConfig {
    /// 有编解码桥时优先硬解
    pub prefer_hardware: bool,
    /// configure 尝试次数（含首次）
    pub configure_attempts: u32,
    /// 解码器返回 "try again" 时的短休眠
    pub try_again_sleep_ms: u64,
}

impl Default for DecodingConfig {
    fn default() -> Self {
        Self {
            prefer_hardware: true,
            configure_attempts: 2,
            try_again_sleep_ms: 1,
        }
    }
}

/// 引擎配置（TOML）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub queues: QueueConfig,
    pub video_backpressure: Backpressure,
    pub audio_backpressure: Backpressure,
    pub demux_backpressure: Backpressure,
    pub sync: SyncConfig,
    pub audio: AudioConfig,
    pub demux: DemuxConfig,
    pub decoder: DecodingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queues: QueueConfig::default(),
            video_backpressure: Backpressure::new(12, 20, 2, 10),
            audio_backpressure: Backpressure::new(50, 80, 5, 15),
            demux_backpressure: Backpressure::new(160, 224, 2, 10),
            sync: SyncConfig::default(),
            audio: AudioConfig::default(),
            demux: DemuxConfig::default(),
            decoder: DecodingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        log::info!("📄 加载配置文件: {}", path.display());
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| PlayerError::ConfigError(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let q = &self.queues;
        let capacities = [
            ("video_packets", q.video_packets),
            ("audio_packets", q.audio_packets),
            ("video_frames", q.video_frames),
            ("audio_frames", q.audio_frames),
        ];
        for (name, cap) in capacities {
            if cap == 0 {
                return Err(PlayerError::ConfigError(format!("队列容量 {} 不能为 0", name)));
            }
        }

        let tiers = [
            ("video_backpressure", &self.video_backpressure),
            ("audio_backpressure", &self.audio_backpressure),
            ("demux_backpressure", &self.demux_backpressure),
        ];
        for (name, bp) in tiers {
            if bp.soft_limit > bp.hard_limit {
                return Err(PlayerError::ConfigError(format!(
                    "{}: soft_limit ({}) 大于 hard_limit ({})",
                    name, bp.soft_limit, bp.hard_limit
                )));
            }
        }

        if self.audio.sample_rate == 0 || self.audio.channels == 0 || self.audio.buffer_frames == 0 {
            return Err(PlayerError::ConfigError("音频输出格式不能包含 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.audio.volume) {
            return Err(PlayerError::ConfigError(format!("音量超出范围: {}", self.audio.volume)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.audio.sample_rate, 44_100);
        assert_eq!(config.sync.threshold_ms, 40);
        assert!(!config.sync.drop_late_frames);
        assert_eq!(config.sync.master, ClockSource::Audio);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [sync]
            threshold_ms = 25
            drop_late_frames = true

            [video_backpressure]
            soft_limit = 4
            hard_limit = 8
            soft_sleep_ms = 1
            hard_sleep_ms = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.sync.threshold_ms, 25);
        assert!(config.sync.drop_late_frames);
        assert_eq!(config.sync.max_sleep_ms, 100);
        assert_eq!(config.video_backpressure.hard_limit, 8);
        assert_eq!(config.queues, QueueConfig::default());
    }

    #[test]
    fn rejects_zero_capacity_and_inverted_limits() {
        assert!(EngineConfig::from_toml_str("[queues]\nvideo_frames = 0").is_err());
        let inverted = "[audio_backpressure]\nsoft_limit = 9\nhard_limit = 3\nsoft_sleep_ms = 1\nhard_sleep_ms = 1";
        assert!(matches!(
            EngineConfig::from_toml_str(inverted),
            Err(PlayerError::ConfigError(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[demux]\neos_poll_ms = 50\n\n[sync]\nmaster = \"external\"").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.demux.eos_poll_ms, 50);
        assert_eq!(config.sync.master, ClockSource::External);
    }

    #[test]
    fn serialises_back_to_toml() {
        let text = EngineConfig::default().to_toml_string().unwrap();
        let parsed = EngineConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, EngineConfig::default());
    }
}
