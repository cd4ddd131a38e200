use crate::core::{DecoderConfig, DecodingConfig, PlayerError, Result};
use crate::player::decoder::{Decoder, SoftwareDecoder};
use crate::player::hw_decoder::{CodecBridge, HardwareDecoder};
use log::{info, warn};
use std::sync::Arc;

/// 按流描述创建并配置好解码器
///
/// 调用方只看到 [`Decoder`] 接口，软解还是硬解由工厂决定。
pub trait DecoderFactory: Send + Sync {
    fn create(&self, config: &DecoderConfig) -> Result<Box<dyn Decoder>>;
}

/// 用 `make` 构造实例并配置，最多尝试 `attempts` 次，每次都是新实例
pub fn configure_with_retry<F>(make: F, config: &DecoderConfig, attempts: u32) -> Result<Box<dyn Decoder>>
where
    F: Fn() -> Box<dyn Decoder>,
{
    let attempts = attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        let mut decoder = make();
        match decoder.configure(config) {
            Ok(()) => return Ok(decoder),
            Err(e) => {
                warn!(
                    "⚠️ {} 解码器配置失败（第 {}/{} 次）: {}",
                    config.stream.as_str(),
                    attempt,
                    attempts,
                    e
                );
                last_error = Some(e);
            }
        }
    }
    Err(match last_error {
        Some(PlayerError::ConfigureError(msg)) => PlayerError::ConfigureError(msg),
        Some(other) => PlayerError::ConfigureError(other.to_string()),
        None => PlayerError::ConfigureError(config.codec_name.clone()),
    })
}

/// 默认工厂：有编解码桥且流适合时优先硬解，否则（或硬解失败）软解
pub struct PlatformDecoderFactory {
    bridge: Option<Arc<dyn CodecBridge>>,
    settings: DecodingConfig,
}

impl PlatformDecoderFactory {
    pub fn new(bridge: Option<Arc<dyn CodecBridge>>, settings: DecodingConfig) -> Self {
        Self { bridge, settings }
    }

    pub fn software_only(settings: DecodingConfig) -> Self {
        Self::new(None, settings)
    }

    fn hardware_bridge(&self, config: &DecoderConfig) -> Option<Arc<dyn CodecBridge>> {
        if !cfg!(feature = "hwaccel") || !self.settings.prefer_hardware {
            return None;
        }
        let bridge = self.bridge.as_ref()?;
        if HardwareDecoder::can_handle(&**bridge, config) {
            Some(bridge.clone())
        } else {
            None
        }
    }
}

impl DecoderFactory for PlatformDecoderFactory {
    fn create(&self, config: &DecoderConfig) -> Result<Box<dyn Decoder>> {
        let attempts = self.settings.configure_attempts;

        if let Some(bridge) = self.hardware_bridge(config) {
            let make = || Box::new(HardwareDecoder::new(bridge.clone())) as Box<dyn Decoder>;
            match configure_with_retry(make, config, attempts) {
                Ok(decoder) => {
                    info!("✓ 使用硬件解码: {}", decoder.name());
                    return Ok(decoder);
                }
                Err(e) => info!("硬件解码不可用: {}, 回退到软件解码", e),
            }
        }

        let decoder = configure_with_retry(
            || Box::new(SoftwareDecoder::new()) as Box<dyn Decoder>,
            config,
            attempts,
        )?;
        info!("✓ 使用软件解码: {}", decoder.name());
        Ok(decoder)
    }
}
