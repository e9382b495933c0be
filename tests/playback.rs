use crossbeam_channel::Receiver;
use myy_playback::core::{MediaStatus, PixelFormat, PlaybackState, PlayerConfig, PlayerEvent, SampleFormat};
use myy_playback::player::{PlaybackManager, RecordingSink, SyntheticLoader};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn config() -> PlayerConfig {
    PlayerConfig {
        async_load: false,
        notify_interval_ms: 50,
        stop_timeout_ms: 2000,
        ..PlayerConfig::default()
    }
}

fn wait_for(events: &Receiver<PlayerEvent>, timeout: Duration, target: PlayerEvent) -> bool {
    let deadline = Instant::now() + timeout;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(left) {
            Ok(ev) if ev == target => return true,
            Ok(_) => {}
            Err(_) => return false,
        }
    }
    false
}

#[test]
fn short_audio_is_padded_with_silence() {
    let player = PlaybackManager::new(config(), Arc::new(SyntheticLoader::new())).unwrap();
    let video = RecordingSink::new("video", PixelFormat::RGBA);
    let audio = RecordingSink::new("audio", SampleFormat::I16);
    let audio_ts = audio.timestamps();
    player.add_video_sink(Box::new(video));
    player.add_audio_sink(Box::new(audio));
    let events = player.events();

    player
        .load("synthetic://gap?fps=25&video_duration=1&audio_duration=0.7")
        .unwrap();
    player.play().unwrap();
    assert!(wait_for(&events, Duration::from_secs(8), PlayerEvent::StateChanged(PlaybackState::Stopped)));

    let audio_ts = audio_ts.lock().clone();
    let last = audio_ts.iter().copied().fold(f64::MIN, f64::max);
    assert!(last >= 0.85, "audio ended at {last}");
    assert_eq!(player.media_status(), MediaStatus::EndOfMedia);
}

#[test]
fn stalled_source_stops_playback() {
    let player = PlaybackManager::new(config(), Arc::new(SyntheticLoader::new())).unwrap();
    player.add_video_sink(Box::new(RecordingSink::new("video", PixelFormat::RGBA)));
    let events = player.events();

    player.load("synthetic://stall?fps=25&duration=10&audio=0&stall_after=10").unwrap();
    player.play().unwrap();
    assert!(wait_for(&events, Duration::from_secs(5), PlayerEvent::MediaStatusChanged(MediaStatus::Stalled)));
    assert!(wait_for(&events, Duration::from_secs(5), PlayerEvent::StateChanged(PlaybackState::Stopped)));
    assert!(!player.is_playing());
}

#[test]
fn speed_and_repeat_are_reported() {
    let player = PlaybackManager::new(config(), Arc::new(SyntheticLoader::new())).unwrap();
    let events = player.events();
    player.set_speed(2.0);
    player.set_repeat(-1);
    assert_eq!(player.speed(), 2.0);
    assert_eq!(player.repeat(), i32::MAX);
    assert!(wait_for(&events, Duration::from_secs(1), PlayerEvent::SpeedChanged(2.0)));
    assert!(wait_for(&events, Duration::from_secs(1), PlayerEvent::RepeatChanged(i32::MAX)));
}
