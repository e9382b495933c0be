use anyhow::Result;
use log::info;
use myy_playback::core::{PixelFormat, PlayerConfig, PlayerEvent, SampleFormat};
use myy_playback::player::{NullSink, PlaybackManager, SyntheticLoader};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 演示用的默认地址：4 秒 25fps 视频 + 8kHz 立体声
const DEMO_URL: &str = "synthetic://demo?fps=25&width=64&height=36&duration=4";

fn main() -> Result<()> {
    // 初始化日志
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("🎬 MYY Playback - 播放引擎演示启动");

    // 用法: myy_playback [config.json] [url]
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) if path.ends_with(".json") => {
            info!("📄 加载配置: {}", path);
            PlayerConfig::from_json_file(&path)?
        }
        _ => PlayerConfig::default(),
    };
    let url = args.next().unwrap_or_else(|| DEMO_URL.to_string());

    let player = PlaybackManager::new(config, Arc::new(SyntheticLoader::new()))?;
    player.add_video_sink(Box::new(NullSink::new(PixelFormat::RGBA)));
    player.add_audio_sink(Box::new(NullSink::new(SampleFormat::F32)));
    let events = player.events();

    player.load(&url)?;
    player.play()?;

    let deadline = Instant::now() + Duration::from_secs(60);
    let mut started = false;
    while Instant::now() < deadline {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(PlayerEvent::PositionChanged(pos)) => info!("⏱ 位置: {}ms / {}ms", pos, player.duration()),
            Ok(PlayerEvent::LoadFailed(error)) => anyhow::bail!("加载失败: {}", error),
            Ok(PlayerEvent::StateChanged(state)) => {
                info!("🎬 状态: {:?}", state);
                if state == myy_playback::PlaybackState::Playing {
                    started = true;
                } else if started && state == myy_playback::PlaybackState::Stopped {
                    break;
                }
            }
            Ok(event) => info!("📨 {:?}", event),
            Err(_) => {}
        }
    }

    let stats = player.statistics();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    player.stop();
    info!("👋 演示结束");
    Ok(())
}
