// 播放引擎：解复用、解码线程、音视频同步与播放控制

pub mod core;
pub mod player;

pub use crate::core::{MediaInfo, MediaStatus, PlaybackState, PlayerConfig, PlayerError, PlayerEvent, Result};
pub use crate::player::PlaybackManager;
