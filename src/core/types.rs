use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// 数据包类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// 普通压缩数据
    Data,
    /// 流结束
    Eof,
    /// 结束并要求解码线程退出
    Quit,
    /// Seek 哨兵：携带同步栅栏 ID（0 表示无栅栏）
    Seek { sync_id: u32 },
    /// 末尾补齐的静音包
    Silence,
}

/// 压缩数据包（解复用器输出，解码器输入）
///
/// 时间单位统一为秒。数据包在线程间按值移动，负载使用 `Bytes` 共享底层内存。
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: PacketKind,
    pub data: Bytes,
    pub pts: f64,
    pub dts: f64,
    pub duration: f64,
    pub key_frame: bool,
}

impl Packet {
    pub fn new(data: Bytes, pts: f64, dts: f64, duration: f64, key_frame: bool) -> Self {
        Self {
            kind: PacketKind::Data,
            data,
            pts,
            dts,
            duration,
            key_frame,
        }
    }

    /// 流结束包
    pub fn eof() -> Self {
        Self::marker(PacketKind::Eof, 0.0)
    }

    /// 退出包：解码线程收到后结束循环
    pub fn quit() -> Self {
        Self::marker(PacketKind::Quit, 0.0)
    }

    /// Seek 哨兵，pts 为目标位置（秒）
    pub fn seek_sentinel(pts: f64, sync_id: u32) -> Self {
        Self::marker(PacketKind::Seek { sync_id }, pts)
    }

    /// 静音补齐包
    pub fn silence(pts: f64, duration: f64) -> Self {
        let mut pkt = Self::marker(PacketKind::Silence, pts);
        pkt.duration = duration;
        pkt
    }

    fn marker(kind: PacketKind, pts: f64) -> Self {
        Self {
            kind,
            data: Bytes::new(),
            pts,
            dts: pts,
            duration: 0.0,
            key_frame: true,
        }
    }

    /// 是否携带真实媒体数据（参与缓冲统计）
    pub fn is_media(&self) -> bool {
        matches!(self.kind, PacketKind::Data | PacketKind::Silence)
    }

    /// Eof 或 Quit
    pub fn is_eof(&self) -> bool {
        matches!(self.kind, PacketKind::Eof | PacketKind::Quit)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// 丢弃已被解码器消费的前 n 字节
    pub fn skip(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data = self.data.slice(n..);
    }
}

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    RGBA,
    RGB,
    YUV420P,
    NV12,
}

impl PixelFormat {
    /// 单帧数据大小（字节）
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::RGBA => w * h * 4,
            PixelFormat::RGB => w * h * 3,
            PixelFormat::YUV420P | PixelFormat::NV12 => w * h + 2 * (w.div_ceil(2) * h.div_ceil(2)),
        }
    }
}

/// 音频采样格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    F32,
    I16,
}

/// 交错排列的采样数据
#[derive(Debug, Clone, PartialEq)]
pub enum SampleBuffer {
    F32(Vec<f32>),
    I16(Vec<i16>),
}

impl SampleBuffer {
    pub fn format(&self) -> SampleFormat {
        match self {
            SampleBuffer::F32(_) => SampleFormat::F32,
            SampleBuffer::I16(_) => SampleFormat::I16,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SampleBuffer::F32(s) => s.len(),
            SampleBuffer::I16(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 视频帧数据
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub timestamp: f64,     // 显示时间戳（秒）
    pub duration: f64,      // 帧持续时间（秒）
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Bytes,        // CPU 内存数据
}

/// 音频帧数据
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub timestamp: f64,     // 显示时间戳（秒）
    pub duration: f64,      // 帧持续时间（秒）
    pub sample_rate: u32,
    pub channels: u16,
    pub data: SampleBuffer,
}

impl AudioFrame {
    /// 生成静音帧
    pub fn silence(timestamp: f64, duration: f64, sample_rate: u32, channels: u16) -> Self {
        let samples = (duration.max(0.0) * sample_rate as f64).round() as usize * channels as usize;
        Self {
            timestamp,
            duration,
            sample_rate,
            channels,
            data: SampleBuffer::F32(vec![0.0; samples]),
        }
    }
}

/// 解码帧的公共接口，OutputSet 通过它做按格式的转换与分发
pub trait MediaFrame: Clone + Send + 'static {
    type Format: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn timestamp(&self) -> f64;
    fn format(&self) -> Self::Format;
    fn is_valid(&self) -> bool;
    /// 转换为目标格式，不支持时返回 None
    fn convert(&self, format: Self::Format) -> Option<Self>;
}

impl MediaFrame for VideoFrame {
    type Format = PixelFormat;

    fn timestamp(&self) -> f64 {
        self.timestamp
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && !self.data.is_empty()
    }

    fn convert(&self, format: PixelFormat) -> Option<Self> {
        super::convert::convert_video(self, format)
    }
}

impl MediaFrame for AudioFrame {
    type Format = SampleFormat;

    fn timestamp(&self) -> f64 {
        self.timestamp
    }

    fn format(&self) -> SampleFormat {
        self.data.format()
    }

    fn is_valid(&self) -> bool {
        self.sample_rate > 0 && self.channels > 0
    }

    fn convert(&self, format: SampleFormat) -> Option<Self> {
        Some(super::convert::convert_audio(self, format))
    }
}

/// 流类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Audio,
    Video,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Audio => "audio",
            StreamKind::Video => "video",
        }
    }
}

/// 播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

/// 媒体状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaStatus {
    NoMedia,
    Loading,
    Loaded,
    /// 数据源无法继续提供数据
    Stalled,
    Buffering,
    Buffered,
    EndOfMedia,
    InvalidMedia,
}

/// Seek 方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeekType {
    /// 精确 seek：丢弃目标之前的帧
    #[default]
    Accurate,
    /// 关键帧 seek：停在目标之前最近的关键帧
    KeyFrame,
}

/// 缓冲计量方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferMode {
    /// 以毫秒计
    #[default]
    Time,
    Bytes,
    Packets,
}

/// 播放到末尾后的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaEndAction {
    /// 结束解复用线程并停止
    #[default]
    Default,
    /// 停在最后一帧，等待 seek
    Pause,
}

/// 播放器对外通知
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    StateChanged(PlaybackState),
    MediaStatusChanged(MediaStatus),
    /// 当前位置（毫秒）
    PositionChanged(i64),
    /// seek 完成后的位置（毫秒）
    SeekFinished(i64),
    StepFinished,
    BufferProgressChanged(f64),
    Loaded(MediaInfo),
    LoadFailed(String),
    SpeedChanged(f64),
    RepeatChanged(i32),
}

/// 媒体信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub url: String,
    pub duration: i64,          // 总时长（毫秒）
    pub start_time: i64,        // 起始时间（毫秒）
    pub has_video: bool,
    pub has_audio: bool,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub video_codec: String,
    pub audio_codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_rate: u64,
    pub seekable: bool,
}

/// 单路流统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamStatistics {
    pub available: bool,
    pub codec: String,
    pub decoder: String,
    /// 容器声明的帧率
    pub frame_rate: f64,
    /// 实测的解码/显示帧率
    pub decoded_fps: f64,
    /// 当前时间（秒）
    pub current_time: f64,
    pub total_frames: u64,
    pub dropped_frames: u64,
    pub skipped_frames: u64,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u16,
}

/// 播放统计（可序列化，便于诊断输出）
#[derive(Debug, Clone, Default, Serialize)]
pub struct Statistics {
    pub url: String,
    pub start_time: i64,
    pub duration: i64,
    pub bit_rate: u64,
    pub audio: StreamStatistics,
    pub video: StreamStatistics,
}

impl Statistics {
    pub fn from_media_info(info: &MediaInfo) -> Self {
        Self {
            url: info.url.clone(),
            start_time: info.start_time,
            duration: info.duration,
            bit_rate: info.bit_rate,
            audio: StreamStatistics {
                available: info.has_audio,
                codec: info.audio_codec.clone(),
                sample_rate: info.sample_rate,
                channels: info.channels,
                ..Default::default()
            },
            video: StreamStatistics {
                available: info.has_video,
                codec: info.video_codec.clone(),
                frame_rate: info.fps,
                width: info.width,
                height: info.height,
                ..Default::default()
            },
        }
    }
}

pub type SharedStatistics = Arc<RwLock<Statistics>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_skip_consumes_prefix() {
        let mut pkt = Packet::new(Bytes::from_static(b"abcdef"), 1.0, 1.0, 0.04, true);
        pkt.skip(2);
        assert_eq!(&pkt.data[..], b"cdef");
        pkt.skip(100);
        assert!(pkt.data.is_empty());
    }

    #[test]
    fn markers_are_not_media() {
        assert!(!Packet::eof().is_media());
        assert!(Packet::quit().is_eof());
        assert!(!Packet::seek_sentinel(3.0, 7).is_eof());
        assert!(Packet::silence(1.0, 0.5).is_media());
    }

    #[test]
    fn silence_frame_has_expected_samples() {
        let f = AudioFrame::silence(0.0, 0.5, 8000, 2);
        assert_eq!(f.data.len(), 8000);
        assert_eq!(f.format(), SampleFormat::F32);
    }
}
