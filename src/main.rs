use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use myy_engine::player::{CpalAudioDevice, DisplayConsumer, SurfaceHandle};
use myy_engine::core::{DecodedFrame, EngineConfig, PlayerState};
use myy_engine::PlaybackController;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

/// 命令行播放器：无窗口，解码后的视频帧只做统计
#[derive(Parser, Debug)]
#[command(name = "myy-engine", version, about = "MYY 播放引擎命令行前端")]
struct Cli {
    /// 媒体文件路径
    file: String,

    /// TOML 配置文件
    #[arg(long)]
    config: Option<PathBuf>,

    /// 音量 0-100
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    volume: Option<u8>,

    /// 开始播放后跳转到指定秒数
    #[arg(long)]
    seek: Option<f64>,

    /// 最长播放秒数
    #[arg(long)]
    max_seconds: Option<u64>,

    /// 输出调试日志
    #[arg(long)]
    debug: bool,

    /// 状态行以 JSON 输出
    #[arg(long)]
    status_json: bool,
}

/// 无窗口显示端：记录帧数与最后一帧的时间戳
#[derive(Default)]
struct HeadlessDisplay {
    surface: Option<SurfaceHandle>,
    frames: u64,
    last_pts: Option<f64>,
    size: (u32, u32),
}

impl DisplayConsumer for HeadlessDisplay {
    fn create_surface(&mut self, surface: SurfaceHandle) -> myy_engine::Result<()> {
        self.surface = Some(surface);
        Ok(())
    }

    fn destroy_surface(&mut self) {
        if self.surface.take().is_some() {
            info!(
                "🖼️ 无窗口显示端: 共显示 {} 帧, 最后 pts {:?}, 表面 {}x{}",
                self.frames, self.last_pts, self.size.0, self.size.1
            );
        }
    }

    fn has_surface(&self) -> bool {
        self.surface.is_some()
    }

    fn on_surface_changed(&mut self, width: u32, height: u32) {
        self.size = (width, height);
    }

    fn display(&mut self, frame: &DecodedFrame) -> myy_engine::Result<()> {
        self.frames += 1;
        self.last_pts = frame.pts_seconds();
        if self.frames % 250 == 0 {
            if let Some(video) = frame.as_video() {
                debug!(
                    "🖼️ 第 {} 帧: {}x{} {:?}, pts {:?}",
                    self.frames, video.width, video.height, video.format, self.last_pts
                );
            }
        }
        Ok(())
    }

    fn present(&mut self) {}
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    env_logger::Builder::from_default_env().filter_level(level).init();

    info!("🎬 MYY 播放引擎启动");

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path).with_context(|| format!("读取配置失败: {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(volume) = cli.volume {
        config.audio.volume = volume as f32 / 100.0;
    }

    let player = PlaybackController::builder()
        .config(config)
        .display(Box::new(HeadlessDisplay::default()))
        .audio_device_factory(CpalAudioDevice::factory())
        .build()
        .context("创建播放器失败")?;

    if !player.prepare(&cli.file) {
        player.stop();
        anyhow::bail!("无法打开: {}", cli.file);
    }
    if !player.attach_surface(SurfaceHandle(0)) {
        warn!("⚠️ 绑定显示端失败");
    }
    if !player.playback() {
        player.stop();
        anyhow::bail!("无法开始播放: {}", cli.file);
    }
    if let Some(position) = cli.seek {
        if !player.seek_to(position) {
            warn!("⚠️ seek 到 {:.2}s 失败", position);
        }
    }

    let started = Instant::now();
    let limit = cli.max_seconds.map(Duration::from_secs);
    let mut last_report: Option<Instant> = None;
    loop {
        let state = player.get_player_state();
        if last_report.map_or(true, |t| t.elapsed() >= Duration::from_secs(1)) {
            last_report = Some(Instant::now());
            if cli.status_json {
                println!("{}", serde_json::to_string(&player.status())?);
            } else {
                println!(
                    "[{}] {:>8.2}s / {:.2}s  {}x{}",
                    state,
                    player.position(),
                    player.get_duration(),
                    player.get_video_width(),
                    player.get_video_height()
                );
            }
        }
        if matches!(state, PlayerState::Completed | PlayerState::Error | PlayerState::Stopped) {
            break;
        }
        if limit.is_some_and(|limit| started.elapsed() >= limit) {
            info!("⏱️ 达到最长播放时间");
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }

    let final_state = player.get_player_state();
    player.stop();
    info!("👋 退出 (最终状态 {})", final_state);
    if final_state == PlayerState::Error {
        anyhow::bail!("播放出错");
    }
    Ok(())
}
