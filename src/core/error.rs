use crate::core::state::PlayerState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("FFmpeg 错误: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("无法打开文件: {0}")]
    OpenError(String),

    #[error("容器中没有可播放的音频或视频流")]
    NoPlayableStream,

    #[error("解码器配置失败: {0}")]
    ConfigureError(String),

    #[error("解码错误: {0}")]
    DecodeError(String),

    #[error("音频输出错误: {0}")]
    AudioError(String),

    #[error("显示表面错误: {0}")]
    SurfaceError(String),

    #[error("非法状态转换: {from:?} -> {to:?}")]
    InvalidTransition { from: PlayerState, to: PlayerState },

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("其他错误: {0}")]
    Other(String),
}

impl From<toml::de::Error> for PlayerError {
    fn from(e: toml::de::Error) -> Self {
        PlayerError::ConfigError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;
