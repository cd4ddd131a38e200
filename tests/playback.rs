mod common;

use common::{test_config, wait_until, Clip, MemoryOpener, PassthroughFactory, RecordingDisplay, TickingAudioDevice};
use myy_engine::core::{PlayerState, StreamKind};
use myy_engine::player::{AudioDeviceFactory, SurfaceHandle};
use myy_engine::PlaybackController;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct Harness {
    player: Arc<PlaybackController>,
    display: RecordingDisplay,
    decoders: Arc<PassthroughFactory>,
    opener: Arc<MemoryOpener>,
}

fn harness_with(opener: MemoryOpener, display: RecordingDisplay, audio: AudioDeviceFactory) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let opener = Arc::new(opener);
    let decoders = Arc::new(PassthroughFactory::default());
    let player = PlaybackController::builder()
        .config(test_config())
        .display(Box::new(display.clone()))
        .audio_device_factory(audio)
        .container_opener(opener.clone())
        .decoder_factory(decoders.clone())
        .build()
        .unwrap();
    Harness {
        player,
        display,
        decoders,
        opener,
    }
}

fn harness(opener: MemoryOpener) -> Harness {
    harness_with(opener, RecordingDisplay::default(), TickingAudioDevice::factory())
}

fn playing(h: &Harness, name: &str) {
    assert!(h.player.prepare(name));
    assert!(h.player.attach_surface(SurfaceHandle(1)));
    assert!(h.player.playback());
    assert_eq!(h.player.get_player_state(), PlayerState::Playing);
}

#[test]
fn plays_frames_in_order_and_stops() {
    let h = harness(MemoryOpener::default().with("clip", Clip::new(2000)));
    assert_eq!(h.player.get_player_state(), PlayerState::Init);
    assert!(h.player.prepare("clip"));
    assert_eq!(h.player.get_player_state(), PlayerState::Prepared);
    assert_eq!(h.player.get_duration(), 2.0);
    assert_eq!(h.player.get_video_width(), common::WIDTH);
    assert_eq!(h.player.get_video_height(), common::HEIGHT);

    assert!(h.player.attach_surface(SurfaceHandle(1)));
    assert!(h.player.playback());
    assert!(h.player.is_playing());

    assert!(wait_until(Duration::from_secs(2), || h.display.displayed().len() >= 5));
    let shown = h.display.displayed();
    assert!(shown.windows(2).all(|w| w[0] <= w[1]), "frames out of order: {:?}", shown);
    assert!(h.player.position() > 0.0);

    let status = h.player.status();
    assert!(status.has_audio);
    assert!(status.has_video);

    assert!(h.player.stop());
    assert_eq!(h.player.get_player_state(), PlayerState::Stopped);
    assert!(h.player.stop());
    assert!(!h.player.prepare("clip"));
    assert!(!h.player.playback());
}

#[test]
fn playback_waits_for_surface() {
    let h = harness(MemoryOpener::default().with("clip", Clip::new(2000)));
    assert!(h.player.prepare("clip"));

    let done = Arc::new(AtomicBool::new(false));
    let waiter = {
        let player = h.player.clone();
        let done = done.clone();
        thread::spawn(move || {
            let ok = player.playback();
            done.store(true, Ordering::Release);
            ok
        })
    };
    thread::sleep(Duration::from_millis(150));
    assert!(!done.load(Ordering::Acquire));
    assert_eq!(h.player.get_player_state(), PlayerState::Prepared);

    assert!(h.player.attach_surface(SurfaceHandle(7)));
    assert!(waiter.join().unwrap());
    assert_eq!(h.player.get_player_state(), PlayerState::Playing);
    h.player.stop();
}

#[test]
fn stop_releases_playback_waiting_for_surface() {
    let h = harness(MemoryOpener::default().with("clip", Clip::new(2000)));
    assert!(h.player.prepare("clip"));
    let waiter = {
        let player = h.player.clone();
        thread::spawn(move || player.playback())
    };
    thread::sleep(Duration::from_millis(100));
    assert!(h.player.stop());
    assert!(!waiter.join().unwrap());
    assert_eq!(h.player.get_player_state(), PlayerState::Stopped);
}

#[test]
fn audio_only_clip_needs_no_surface() {
    let h = harness(MemoryOpener::default().with("song", Clip::new(1000).video_codec(None)));
    assert!(h.player.prepare("song"));
    assert!(h.player.playback());
    assert_eq!(h.player.get_player_state(), PlayerState::Playing);
    assert!(wait_until(Duration::from_secs(2), || h.player.position() > 0.1));
    assert!(h.display.displayed().is_empty());
    h.player.stop();
}

#[test]
fn seek_discards_stale_packets() {
    let h = harness(MemoryOpener::default().with("clip", Clip::new(2000)));
    playing(&h, "clip");
    assert!(wait_until(Duration::from_secs(2), || !h.display.displayed().is_empty()));

    assert!(h.player.seek_to(1.0));
    assert_eq!(h.player.get_player_state(), PlayerState::Playing);
    assert_eq!(h.opener.seeks.lock().last().copied(), Some(1.0));

    assert!(wait_until(Duration::from_secs(2), || {
        h.decoders.flushes(StreamKind::Video) >= 1 && !h.decoders.data_after_last_flush(StreamKind::Video).is_empty()
    }));
    let after = h.decoders.data_after_last_flush(StreamKind::Video);
    assert!(after.iter().all(|&pts| pts >= 1000), "stale packets after flush: {:?}", after);
    assert!(h.player.position() >= 1.0);
    h.player.stop();
}

#[test]
fn forward_seeks_never_show_earlier_frames() {
    let h = harness(MemoryOpener::default().with("long", Clip::new(60_000)));
    playing(&h, "long");
    assert!(wait_until(Duration::from_secs(2), || !h.display.displayed().is_empty()));

    for target in [5.0, 12.5, 30.0, 47.0] {
        assert!(h.player.seek_to(target));
        let from = h.display.displayed().len();
        assert!(wait_until(Duration::from_secs(2), || h.display.displayed().len() > from + 3));
        let shown = h.display.displayed();
        assert!(
            shown[from..].iter().all(|&pts| pts >= target),
            "frames before {}s shown after the seek: {:?}",
            target,
            &shown[from..]
        );
    }
    h.player.stop();
}

#[test]
fn seek_while_paused_stays_paused() {
    let h = harness(MemoryOpener::default().with("clip", Clip::new(2000)));
    playing(&h, "clip");
    assert!(h.player.pause());
    assert!(h.player.seek_to(1.5));
    assert_eq!(h.player.get_player_state(), PlayerState::Paused);
    assert!((h.player.position() - 1.5).abs() < 1e-6);
    h.player.stop();
}

#[test]
fn seek_rejected_outside_playback() {
    let h = harness(MemoryOpener::default().with("clip", Clip::new(2000)));
    assert!(!h.player.seek_to(1.0));
    assert!(h.player.prepare("clip"));
    assert!(!h.player.seek_to(1.0));
    assert_eq!(h.player.get_player_state(), PlayerState::Prepared);
    h.player.stop();
}

#[test]
fn pause_freezes_position() {
    let h = harness(MemoryOpener::default().with("clip", Clip::new(2000)));
    playing(&h, "clip");
    assert!(wait_until(Duration::from_secs(2), || h.player.position() > 0.1));

    assert!(h.player.pause());
    assert!(h.player.pause());
    assert_eq!(h.player.get_player_state(), PlayerState::Paused);
    let frozen = h.player.position();
    thread::sleep(Duration::from_millis(200));
    assert!((h.player.position() - frozen).abs() < 0.02);

    assert!(h.player.resume());
    assert_eq!(h.player.get_player_state(), PlayerState::Playing);
    assert!(wait_until(Duration::from_secs(2), || h.player.position() > frozen + 0.05));
    h.player.stop();
}

#[test]
fn detach_pauses_and_attach_resumes() {
    let h = harness(MemoryOpener::default().with("clip", Clip::new(2000)));
    playing(&h, "clip");

    assert!(h.player.detach_surface());
    assert_eq!(h.player.get_player_state(), PlayerState::Paused);
    assert!(!h.player.resume());
    assert_eq!(h.player.get_player_state(), PlayerState::Paused);

    assert!(h.player.attach_surface(SurfaceHandle(2)));
    assert_eq!(h.player.get_player_state(), PlayerState::Playing);
    h.player.stop();
}

#[test]
fn failed_surface_attach_keeps_state() {
    let h = harness_with(
        MemoryOpener::default().with("clip", Clip::new(2000)),
        RecordingDisplay::failing(),
        TickingAudioDevice::factory(),
    );
    assert!(h.player.prepare("clip"));
    assert!(!h.player.attach_surface(SurfaceHandle(3)));
    assert_eq!(h.player.get_player_state(), PlayerState::Prepared);
    h.player.stop();
}

#[test]
fn second_prepare_replaces_session() {
    let heard = Arc::new(Mutex::new(BTreeSet::new()));
    let h = harness_with(
        MemoryOpener::default()
            .with("first", Clip::new(2000).audio_level(0x20))
            .with("second", Clip::new(2000).offset(100_000).audio_level(0x60)),
        RecordingDisplay::default(),
        TickingAudioDevice::recording(heard.clone()),
    );
    playing(&h, "first");
    assert!(wait_until(Duration::from_secs(2), || !h.display.displayed().is_empty()));
    assert!(wait_until(Duration::from_secs(2), || !heard.lock().is_empty()));

    assert!(h.player.prepare("second"));
    assert_eq!(h.player.get_player_state(), PlayerState::Prepared);
    let before = h.display.displayed().len();
    heard.lock().clear();

    assert!(h.player.playback());
    assert!(wait_until(Duration::from_secs(2), || h.display.displayed().len() > before + 2));
    let shown = h.display.displayed();
    assert!(shown[before..].iter().all(|&pts| pts >= 100.0), "old session leaked: {:?}", &shown[before..]);

    // 两个片段的音频采样值不同，设备上只能出现新片段的
    assert!(wait_until(Duration::from_secs(2), || !heard.lock().is_empty()));
    thread::sleep(Duration::from_millis(100));
    let expected: BTreeSet<i16> = [TickingAudioDevice::level_to_i16(0x60)].into_iter().collect();
    assert_eq!(*heard.lock(), expected, "old session audio reached the device");
    h.player.stop();
}

#[test]
fn prepare_twice_without_playing() {
    let h = harness(MemoryOpener::default().with("clip", Clip::new(2000)));
    assert!(h.player.prepare("clip"));
    assert!(h.player.prepare("clip"));
    assert_eq!(h.player.get_player_state(), PlayerState::Prepared);

    // 新文件打开失败时保留原会话
    assert!(!h.player.prepare("missing"));
    assert_eq!(h.player.get_player_state(), PlayerState::Prepared);
    assert_eq!(h.player.get_duration(), 2.0);
    h.player.stop();
}

#[test]
fn reaches_completed_and_replays() {
    let h = harness(MemoryOpener::default().with("short", Clip::new(400)));
    playing(&h, "short");
    assert!(wait_until(Duration::from_secs(5), || h.player.get_player_state() == PlayerState::Completed));
    assert!((h.player.position() - 0.4).abs() < 0.1);
    assert!(!h.player.seek_to(0.1));

    let shown = h.display.displayed().len();
    assert!(h.player.playback());
    assert_eq!(h.player.get_player_state(), PlayerState::Playing);
    assert!(wait_until(Duration::from_secs(2), || h.display.displayed().len() > shown));
    h.player.stop();
}

#[test]
fn missing_file_stays_init() {
    let h = harness(MemoryOpener::default());
    assert!(!h.player.prepare("nothing-here"));
    assert_eq!(h.player.get_player_state(), PlayerState::Init);
    h.player.stop();
}

#[test]
fn video_configure_failure_aborts_prepare() {
    let h = harness(MemoryOpener::default().with("clip", Clip::new(1000).video_codec(Some("broken"))));
    assert!(!h.player.prepare("clip"));
    assert_eq!(h.player.get_player_state(), PlayerState::Init);
    h.player.stop();
}

#[test]
fn audio_configure_failure_degrades_to_video() {
    let h = harness(MemoryOpener::default().with("clip", Clip::new(1000).audio_codec(Some("broken"))));
    assert!(h.player.prepare("clip"));
    let status = h.player.status();
    assert!(status.has_video);
    assert!(!status.has_audio);

    assert!(h.player.attach_surface(SurfaceHandle(1)));
    assert!(h.player.playback());
    assert!(wait_until(Duration::from_secs(2), || !h.display.displayed().is_empty()));
    h.player.stop();
}

#[test]
fn missing_audio_device_degrades_to_video() {
    let h = harness_with(
        MemoryOpener::default().with("clip", Clip::new(600)),
        RecordingDisplay::default(),
        TickingAudioDevice::unavailable(),
    );
    playing(&h, "clip");
    assert!(!h.player.status().has_audio);
    assert!(wait_until(Duration::from_secs(5), || h.player.get_player_state() == PlayerState::Completed));
    h.player.stop();
}

#[test]
fn volume_is_clamped() {
    let h = harness(MemoryOpener::default().with("clip", Clip::new(1000)));
    h.player.set_volume(1.5);
    assert_eq!(h.player.volume(), 1.0);
    h.player.set_volume(-0.2);
    assert_eq!(h.player.volume(), 0.0);
    h.player.set_volume(0.4);
    assert!(h.player.prepare("clip"));
    assert_eq!(h.player.status().volume, 0.4);
    h.player.stop();
}
