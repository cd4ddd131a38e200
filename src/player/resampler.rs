use crate::core::{AudioData, AudioSpec, PlayerError, ResamplerKind, Result};
use ffmpeg_next::util::channel_layout::ChannelLayout;
use ffmpeg_next::{software, util};
use log::debug;

/// 有状态重采样器：交织 f32 → 输出格式的交织 i16
pub trait Resampler: Send {
    /// 转换一帧，结果追加到 `out`
    fn process(&mut self, input: &AudioData, out: &mut Vec<i16>) -> Result<()>;

    /// 丢弃内部状态（seek / 换源之后）
    fn reset(&mut self);

    fn name(&self) -> &'static str;
}

pub fn create_resampler(kind: ResamplerKind, spec: AudioSpec) -> Box<dyn Resampler> {
    match kind {
        ResamplerKind::Swr => Box::new(SwrResampler::new(spec)),
        ResamplerKind::Linear => Box::new(LinearResampler::new(spec)),
    }
}

#[inline]
fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// 输出声道 `c` 取自哪个输入声道；单声道输出取前两个声道的平均
#[inline]
fn mix(frame: &[f32], out_channels: u16, c: usize) -> f32 {
    match (frame.len(), out_channels) {
        (0, _) => 0.0,
        (n, 1) if n >= 2 => (frame[0] + frame[1]) * 0.5,
        (n, _) => frame[c.min(n - 1)],
    }
}

/// 纯 Rust 线性插值重采样器
///
/// 小数读位置跨帧保留，上一帧最后一个采样作为下一帧插值的左端点，
/// 因此连续帧之间不会出现相位跳变。
pub struct LinearResampler {
    spec: AudioSpec,
    input_rate: u32,
    input_channels: u16,
    /// 下一个输出采样在当前输入帧中的位置；-1..0 表示位于上一帧末尾与本帧开头之间
    pos: f64,
    last: Option<Vec<f32>>,
}

impl LinearResampler {
    pub fn new(spec: AudioSpec) -> Self {
        Self {
            spec,
            input_rate: 0,
            input_channels: 0,
            pos: 0.0,
            last: None,
        }
    }
}

impl Resampler for LinearResampler {
    fn process(&mut self, input: &AudioData, out: &mut Vec<i16>) -> Result<()> {
        let n = input.frames();
        if n == 0 || input.sample_rate == 0 {
            return Ok(());
        }
        if input.sample_rate != self.input_rate || input.channels != self.input_channels {
            debug!(
                "🔧 线性重采样: {} Hz/{} 声道 -> {} Hz/{} 声道",
                input.sample_rate, input.channels, self.spec.sample_rate, self.spec.channels
            );
            self.reset();
            self.input_rate = input.sample_rate;
            self.input_channels = input.channels;
        }

        let in_ch = input.channels as usize;
        let out_ch = self.spec.channels as usize;
        let step = input.sample_rate as f64 / self.spec.sample_rate as f64;
        let frame_at = |i: usize| &input.samples[i * in_ch..(i + 1) * in_ch];
        let last_index = (n - 1) as f64;

        while self.pos <= last_index {
            let base = self.pos.floor();
            let frac = (self.pos - base) as f32;
            for c in 0..out_ch {
                let (a, b) = if base < 0.0 {
                    let left = self.last.as_ref().map(|l| l[c]).unwrap_or(0.0);
                    (left, mix(frame_at(0), self.spec.channels, c))
                } else {
                    let i = base as usize;
                    let a = mix(frame_at(i), self.spec.channels, c);
                    let b = if i + 1 < n { mix(frame_at(i + 1), self.spec.channels, c) } else { a };
                    (a, b)
                };
                out.push(to_i16(a + (b - a) * frac));
            }
            self.pos += step;
        }

        self.pos -= n as f64;
        let tail = frame_at(n - 1);
        self.last = Some((0..out_ch).map(|c| mix(tail, self.spec.channels, c)).collect());
        Ok(())
    }

    fn reset(&mut self) {
        self.pos = 0.0;
        self.last = None;
    }

    fn name(&self) -> &'static str {
        "linear"
    }
}

fn layout_for(channels: u16) -> ChannelLayout {
    match channels {
        1 => ChannelLayout::MONO,
        2 => ChannelLayout::STEREO,
        n => ChannelLayout::default(n as i32),
    }
}

/// FFmpeg swresample 重采样器（状态保存在 SwrContext 中）
pub struct SwrResampler {
    spec: AudioSpec,
    context: Option<(software::resampling::Context, u32, u16)>,
}

// SwrContext 只在音频回调中使用，同一时刻只有一个线程访问
unsafe impl Send for SwrResampler {}

impl SwrResampler {
    pub fn new(spec: AudioSpec) -> Self {
        Self { spec, context: None }
    }

    fn ensure_context(&mut self, rate: u32, channels: u16) -> Result<&mut software::resampling::Context> {
        let stale = !matches!(&self.context, Some((_, r, c)) if *r == rate && *c == channels);
        if stale {
            debug!(
                "🔧 初始化音频重采样器: {}Hz/{}ch → {}Hz/{}ch",
                rate, channels, self.spec.sample_rate, self.spec.channels
            );
            let ctx = software::resampling::Context::get(
                util::format::Sample::F32(util::format::sample::Type::Packed),
                layout_for(channels),
                rate,
                util::format::Sample::I16(util::format::sample::Type::Packed),
                layout_for(self.spec.channels),
                self.spec.sample_rate,
            )?;
            self.context = Some((ctx, rate, channels));
        }
        self.context
            .as_mut()
            .map(|(ctx, ..)| ctx)
            .ok_or_else(|| PlayerError::AudioError("重采样器未初始化".to_string()))
    }
}

impl Resampler for SwrResampler {
    fn process(&mut self, input: &AudioData, out: &mut Vec<i16>) -> Result<()> {
        let frames = input.frames();
        if frames == 0 {
            return Ok(());
        }
        let out_channels = self.spec.channels as usize;

        let mut frame = util::frame::Audio::new(
            util::format::Sample::F32(util::format::sample::Type::Packed),
            frames,
            layout_for(input.channels),
        );
        frame.set_rate(input.sample_rate);
        let bytes: &[u8] = bytemuck::cast_slice(&input.samples[..frames * input.channels as usize]);
        frame.data_mut(0)[..bytes.len()].copy_from_slice(bytes);

        let ctx = self.ensure_context(input.sample_rate, input.channels)?;
        let mut resampled = util::frame::Audio::empty();
        ctx.run(&frame, &mut resampled)?;

        let count = resampled.samples() * out_channels;
        out.extend(
            resampled
                .data(0)
                .chunks_exact(2)
                .take(count)
                .map(bytemuck::pod_read_unaligned::<i16>),
        );
        Ok(())
    }

    fn reset(&mut self) {
        self.context = None;
    }

    fn name(&self) -> &'static str {
        "swr"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(rate: u32, channels: u16) -> AudioSpec {
        AudioSpec {
            sample_rate: rate,
            channels,
            buffer_frames: 256,
        }
    }

    fn mono(rate: u32, samples: Vec<f32>) -> AudioData {
        AudioData {
            sample_rate: rate,
            channels: 1,
            samples,
        }
    }

    #[test]
    fn same_rate_passes_through_and_duplicates_mono() {
        let mut r = LinearResampler::new(spec(8000, 2));
        let mut out = Vec::new();
        r.process(&mono(8000, vec![0.0, 0.5, -0.5]), &mut out).unwrap();
        assert_eq!(out, vec![0, 0, 16383, 16383, -16383, -16383]);
    }

    #[test]
    fn upsampling_doubles_frame_count_across_frames() {
        let mut r = LinearResampler::new(spec(16000, 1));
        let mut out = Vec::new();
        r.process(&mono(8000, vec![0.0; 100]), &mut out).unwrap();
        r.process(&mono(8000, vec![0.0; 100]), &mut out).unwrap();
        // 插值窗口带来一个采样的延迟
        assert_eq!(out.len(), 399);
    }

    #[test]
    fn interpolates_between_frames() {
        let mut r = LinearResampler::new(spec(2, 1));
        let mut out = Vec::new();
        // 1 Hz -> 2 Hz: 第二帧开头插值落在上一帧末尾和本帧开头之间
        r.process(&mono(1, vec![0.0]), &mut out).unwrap();
        r.process(&mono(1, vec![1.0]), &mut out).unwrap();
        assert_eq!(out, vec![0, 16383, i16::MAX]);
    }

    #[test]
    fn downmix_to_mono_averages() {
        let mut r = LinearResampler::new(spec(100, 1));
        let mut out = Vec::new();
        let stereo = AudioData {
            sample_rate: 100,
            channels: 2,
            samples: vec![1.0, 0.0],
        };
        r.process(&stereo, &mut out).unwrap();
        assert_eq!(out, vec![16383]);
    }

    #[test]
    fn clamps_out_of_range_samples() {
        assert_eq!(to_i16(2.0), i16::MAX);
        assert_eq!(to_i16(-2.0), -i16::MAX);
    }
}
