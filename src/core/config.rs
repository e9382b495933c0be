// 播放器配置（JSON 可加载）

use super::error::Result;
use super::types::{BufferMode, MediaEndAction, SeekType};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 单个数据包队列的缓冲配置
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub mode: BufferMode,
    /// Time 模式为毫秒，Bytes 模式为字节，Packets 模式为包数
    pub value: i64,
    /// 队列上限 = value * max（>= 1.0）
    pub max: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            mode: BufferMode::Time,
            value: 2000,
            max: 1.5,
        }
    }
}

/// 音视频同步参数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// 音视频偏差阈值（秒）
    pub sync_threshold: f64,
    /// 连续慢帧超过该值时允许跳到下一个关键帧
    pub slow_skip: u32,
    /// 连续慢帧达到该值时让解码器丢弃非参考帧
    pub slow_frame_drop: u32,
    /// 落后超过该值（秒）直接跳帧
    pub hard_skip_lag: f64,
    /// 视频比音频长出该值（秒）时补齐静音
    pub av_gap_threshold: f64,
    /// 静音补齐的最大时长（秒）
    pub max_silence: f64,
    /// 可中断等待的时间片（毫秒）
    pub wait_slice_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_threshold: 0.2,
            slow_skip: 20,
            slow_frame_drop: 10,
            hard_skip_lag: 2.0,
            av_gap_threshold: 0.1,
            max_silence: 5.0,
            wait_slice_ms: 20,
        }
    }
}

impl SyncConfig {
    pub fn wait_slice(&self) -> Duration {
        Duration::from_millis(self.wait_slice_ms.max(1))
    }
}

/// 播放器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub video_buffer: BufferConfig,
    pub audio_buffer: BufferConfig,
    pub sync: SyncConfig,
    /// 位置通知间隔（毫秒）
    pub notify_interval_ms: u64,
    /// 是否在后台线程池中加载媒体
    pub async_load: bool,
    /// 后台线程池大小
    pub worker_threads: usize,
    pub seek_type: SeekType,
    pub media_end_action: MediaEndAction,
    /// 位置是否相对于媒体起始时间
    pub relative_time_mode: bool,
    /// stop 时等待每个线程退出的上限（毫秒）
    pub stop_timeout_ms: u64,
    /// 单步操作的超时（毫秒）
    pub step_timeout_ms: u64,
    /// 解码线程的 PTS 历史长度
    pub pts_history: usize,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            video_buffer: BufferConfig::default(),
            audio_buffer: BufferConfig::default(),
            sync: SyncConfig::default(),
            notify_interval_ms: 500,
            async_load: true,
            worker_threads: 2,
            seek_type: SeekType::Accurate,
            media_end_action: MediaEndAction::Default,
            relative_time_mode: true,
            stop_timeout_ms: 3000,
            step_timeout_ms: 200,
            pts_history: 30,
        }
    }
}

impl PlayerConfig {
    /// 从 JSON 文件加载，缺失字段使用默认值
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let mut config: PlayerConfig = serde_json::from_str(text)?;
        config.normalize();
        Ok(config)
    }

    /// 修正越界的配置值
    pub fn normalize(&mut self) {
        self.video_buffer.value = self.video_buffer.value.max(0);
        self.audio_buffer.value = self.audio_buffer.value.max(0);
        self.video_buffer.max = self.video_buffer.max.max(1.0);
        self.audio_buffer.max = self.audio_buffer.max.max(1.0);
        self.notify_interval_ms = self.notify_interval_ms.max(1);
        self.worker_threads = self.worker_threads.max(1);
        self.pts_history = self.pts_history.max(2);
    }

    pub fn notify_interval(&self) -> Duration {
        Duration::from_millis(self.notify_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_json_uses_defaults() {
        let cfg = PlayerConfig::from_json_str(r#"{ "notify_interval_ms": 100, "sync": { "slow_skip": 30 } }"#).unwrap();
        assert_eq!(cfg.notify_interval_ms, 100);
        assert_eq!(cfg.sync.slow_skip, 30);
        assert_eq!(cfg.sync.slow_frame_drop, 10);
        assert_eq!(cfg.video_buffer, BufferConfig::default());
    }

    #[test]
    fn buffer_max_is_clamped() {
        let cfg = PlayerConfig::from_json_str(r#"{ "audio_buffer": { "max": 0.5 } }"#).unwrap();
        assert_eq!(cfg.audio_buffer.max, 1.0);
    }

    #[test]
    fn negative_buffer_value_is_clamped() {
        let cfg = PlayerConfig::from_json_str(r#"{ "video_buffer": { "value": -300 }, "audio_buffer": { "value": 800 } }"#)
            .unwrap();
        assert_eq!(cfg.video_buffer.value, 0);
        assert_eq!(cfg.audio_buffer.value, 800);
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "seek_type": "key_frame", "media_end_action": "pause" }}"#).unwrap();
        let cfg = PlayerConfig::from_json_file(file.path()).unwrap();
        assert_eq!(cfg.seek_type, SeekType::KeyFrame);
        assert_eq!(cfg.media_end_action, MediaEndAction::Pause);
    }

    #[test]
    fn invalid_json_is_config_error() {
        let err = PlayerConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, crate::core::PlayerError::ConfigError(_)));
    }
}
