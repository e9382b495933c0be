// 合成媒体源：确定性的原始视频 + PCM 交错码流
//
// 用于演示程序和测试，行为与真实容器一致：按 pts 交错输出、
// seek 落在目标之前的关键帧、读完后 at_end() 为 true。

use crate::core::{MediaInfo, Packet, PixelFormat, PlayerError, Result, SeekType};
use crate::player::decoder::RAW_FLAG_DISPOSABLE;
use crate::player::demuxer_source::{DemuxerSource, MediaPacket};
use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, info};

pub const SYNTHETIC_SCHEME: &str = "synthetic://";

const VIDEO_STREAM: usize = 0;
const AUDIO_STREAM: usize = 1;
const EPS: f64 = 1e-6;

/// 合成码流参数，时间单位为秒
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticConfig {
    pub url: String,
    /// 0 表示没有视频流
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// 关键帧间隔（帧数）
    pub key_interval: u32,
    /// 0 表示没有音频流
    pub sample_rate: u32,
    pub channels: u16,
    /// 每个音频包的采样数
    pub audio_frame_samples: u32,
    pub video_duration: f64,
    pub audio_duration: f64,
    pub start_time: f64,
    /// 读取这么多个包之后模拟数据源停滞
    pub stall_after: Option<usize>,
    /// 视频流只是封面图
    pub attached_picture: bool,
    /// false 模拟不支持 seek 的直播流
    pub seekable: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            url: format!("{}default", SYNTHETIC_SCHEME),
            fps: 25.0,
            width: 32,
            height: 18,
            pixel_format: PixelFormat::RGBA,
            key_interval: 12,
            sample_rate: 8000,
            channels: 2,
            audio_frame_samples: 800,
            video_duration: 10.0,
            audio_duration: 10.0,
            start_time: 0.0,
            stall_after: None,
            attached_picture: false,
            seekable: true,
        }
    }
}

impl SyntheticConfig {
    pub fn with_video(mut self, fps: f64, width: u32, height: u32) -> Self {
        self.fps = fps;
        self.width = width;
        self.height = height;
        self
    }

    pub fn without_video(mut self) -> Self {
        self.fps = 0.0;
        self
    }

    pub fn with_audio(mut self, sample_rate: u32, channels: u16) -> Self {
        self.sample_rate = sample_rate;
        self.channels = channels;
        self
    }

    pub fn without_audio(mut self) -> Self {
        self.sample_rate = 0;
        self
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.video_duration = seconds;
        self.audio_duration = seconds;
        self
    }

    pub fn with_key_interval(mut self, frames: u32) -> Self {
        self.key_interval = frames.max(1);
        self
    }

    pub fn with_start_time(mut self, seconds: f64) -> Self {
        self.start_time = seconds;
        self
    }

    pub fn with_pixel_format(mut self, format: PixelFormat) -> Self {
        self.pixel_format = format;
        self
    }

    pub fn has_video(&self) -> bool {
        self.fps > 0.0 && self.video_duration > 0.0
    }

    pub fn has_audio(&self) -> bool {
        self.sample_rate > 0 && self.channels > 0 && self.audio_duration > 0.0
    }

    /// 解析 `synthetic://name?fps=25&duration=10&audio=8000` 形式的地址
    ///
    /// 支持的参数：fps, width, height, format(rgba/rgb/yuv420p/nv12), gop,
    /// audio(采样率，0 关闭), channels, frame_samples, duration, video_duration,
    /// audio_duration, start, stall_after, cover, seekable。
    pub fn from_url(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix(SYNTHETIC_SCHEME)
            .ok_or_else(|| PlayerError::OpenError(format!("不支持的地址: {}", url)))?;
        let mut config = Self {
            url: url.to_string(),
            ..Default::default()
        };
        let Some((_, query)) = rest.split_once('?') else {
            return Ok(config);
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| PlayerError::OpenError(format!("参数格式错误: {}", pair)))?;
            let bad = || PlayerError::OpenError(format!("参数值错误: {}={}", key, value));
            let num = || value.parse::<f64>().map_err(|_| bad());
            match key {
                "fps" => config.fps = num()?,
                "width" => config.width = num()? as u32,
                "height" => config.height = num()? as u32,
                "format" => {
                    config.pixel_format = match value.to_ascii_lowercase().as_str() {
                        "rgba" => PixelFormat::RGBA,
                        "rgb" => PixelFormat::RGB,
                        "yuv420p" => PixelFormat::YUV420P,
                        "nv12" => PixelFormat::NV12,
                        _ => return Err(bad()),
                    }
                }
                "gop" => config.key_interval = (num()? as u32).max(1),
                "audio" => config.sample_rate = num()? as u32,
                "channels" => config.channels = num()? as u16,
                "frame_samples" => config.audio_frame_samples = (num()? as u32).max(1),
                "duration" => {
                    config.video_duration = num()?;
                    config.audio_duration = config.video_duration;
                }
                "video_duration" => config.video_duration = num()?,
                "audio_duration" => config.audio_duration = num()?,
                "start" => config.start_time = num()?,
                "stall_after" => config.stall_after = Some(num()? as usize),
                "cover" => config.attached_picture = value == "1" || value == "true",
                "seekable" => config.seekable = value == "1" || value == "true",
                _ => debug!("忽略未知参数 {}", key),
            }
        }
        if !config.has_video() && !config.has_audio() {
            return Err(PlayerError::NoStreams);
        }
        Ok(config)
    }
}

/// 合成数据源
pub struct SyntheticSource {
    config: SyntheticConfig,
    info: MediaInfo,
    video_frames: u64,
    audio_packets: u64,
    next_video: u64,
    next_audio: u64,
    packets_read: usize,
    at_end: bool,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        let video_frames = if config.has_video() {
            if config.attached_picture {
                1
            } else {
                (config.video_duration * config.fps - EPS).ceil().max(1.0) as u64
            }
        } else {
            0
        };
        let audio_packets = if config.has_audio() {
            (config.audio_duration / Self::audio_packet_duration(&config) - EPS).ceil().max(1.0) as u64
        } else {
            0
        };
        let duration = if config.attached_picture {
            config.audio_duration
        } else {
            config.video_duration.max(config.audio_duration)
        };
        let frame_bytes = if config.has_video() {
            config.pixel_format.frame_size(config.width, config.height) as f64
        } else {
            0.0
        };
        let info = MediaInfo {
            url: config.url.clone(),
            duration: (duration * 1000.0) as i64,
            start_time: (config.start_time * 1000.0) as i64,
            has_video: config.has_video(),
            has_audio: config.has_audio(),
            width: config.width,
            height: config.height,
            fps: if config.has_video() { config.fps } else { 0.0 },
            video_codec: if config.has_video() { "rawvideo".into() } else { String::new() },
            audio_codec: if config.has_audio() { "pcm_s16le".into() } else { String::new() },
            sample_rate: config.sample_rate,
            channels: config.channels,
            bit_rate: (frame_bytes * config.fps * 8.0) as u64 + config.sample_rate as u64 * config.channels as u64 * 16,
            seekable: config.seekable,
        };
        info!(
            "🧪 合成媒体源: {} 视频帧, {} 音频包, 时长 {}ms",
            video_frames, audio_packets, info.duration
        );
        Self {
            config,
            info,
            video_frames,
            audio_packets,
            next_video: 0,
            next_audio: 0,
            packets_read: 0,
            at_end: video_frames == 0 && audio_packets == 0,
        }
    }

    pub fn from_url(url: &str) -> Result<Self> {
        Ok(Self::new(SyntheticConfig::from_url(url)?))
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    fn audio_packet_duration(config: &SyntheticConfig) -> f64 {
        config.audio_frame_samples.max(1) as f64 / config.sample_rate.max(1) as f64
    }

    fn video_pts(&self, index: u64) -> f64 {
        self.config.start_time + index as f64 / self.config.fps
    }

    fn audio_pts(&self, index: u64) -> f64 {
        self.config.start_time + index as f64 * Self::audio_packet_duration(&self.config)
    }

    fn is_key(&self, index: u64) -> bool {
        self.config.attached_picture || index % self.config.key_interval.max(1) as u64 == 0
    }

    fn video_packet(&self, index: u64) -> Packet {
        let pts = self.video_pts(index);
        let key = self.is_key(index);
        let gop_pos = index % self.config.key_interval.max(1) as u64;
        let flags = if !key && gop_pos % 2 == 1 { RAW_FLAG_DISPOSABLE } else { 0 };
        let size = self.config.pixel_format.frame_size(self.config.width, self.config.height);
        let mut buf = BytesMut::with_capacity(size + 1);
        buf.put_u8(flags);
        buf.put_bytes((index % 251) as u8, size);
        let duration = if self.config.attached_picture { 0.0 } else { 1.0 / self.config.fps };
        Packet::new(buf.freeze(), pts, pts, duration, key)
    }

    fn audio_packet(&self, index: u64) -> Packet {
        let pts = self.audio_pts(index);
        let samples = self.config.audio_frame_samples.max(1) as usize;
        let channels = self.config.channels.max(1) as usize;
        let mut buf = BytesMut::with_capacity(samples * channels * 2);
        for s in 0..samples {
            // 锯齿波
            let v = (((index as usize * samples + s) % 64) as i16 - 32) * 256;
            for _ in 0..channels {
                buf.put_i16_le(v);
            }
        }
        let data: Bytes = buf.freeze();
        Packet::new(data, pts, pts, Self::audio_packet_duration(&self.config), true)
    }
}

impl DemuxerSource for SyntheticSource {
    fn read_packet(&mut self) -> Result<Option<MediaPacket>> {
        if let Some(limit) = self.config.stall_after {
            if self.packets_read >= limit {
                return Err(PlayerError::Stalled(format!("{} 在 {} 个包后停滞", self.config.url, limit)));
            }
        }
        let video_left = self.next_video < self.video_frames;
        let audio_left = self.next_audio < self.audio_packets;
        let take_video = match (video_left, audio_left) {
            (false, false) => {
                self.at_end = true;
                return Ok(None);
            }
            (true, false) => true,
            (false, true) => false,
            (true, true) => self.video_pts(self.next_video) <= self.audio_pts(self.next_audio) + EPS,
        };
        self.packets_read += 1;
        let media_packet = if take_video {
            let packet = self.video_packet(self.next_video);
            self.next_video += 1;
            MediaPacket {
                packet,
                stream_index: VIDEO_STREAM,
            }
        } else {
            let packet = self.audio_packet(self.next_audio);
            self.next_audio += 1;
            MediaPacket {
                packet,
                stream_index: AUDIO_STREAM,
            }
        };
        Ok(Some(media_packet))
    }

    fn seek(&mut self, timestamp_ms: i64, seek_type: SeekType) -> Result<()> {
        if !self.config.seekable {
            return Err(PlayerError::SeekError(format!("{} 不支持 seek", self.config.url)));
        }
        let target = (timestamp_ms as f64 / 1000.0 - self.config.start_time).max(0.0);
        let mut audio_from = target;
        if self.video_frames > 0 {
            let gop = self.config.key_interval.max(1) as u64;
            let frame = ((target * self.config.fps + EPS).floor() as u64).min(self.video_frames - 1);
            let key = if self.config.attached_picture { 0 } else { frame - frame % gop };
            self.next_video = if self.config.attached_picture {
                // 封面图只在开头出现一次
                if target > 0.0 { 1 } else { 0 }
            } else {
                key
            };
            if !self.config.attached_picture {
                audio_from = self.video_pts(key) - self.config.start_time;
            }
        }
        if self.audio_packets > 0 {
            let packet = (audio_from / Self::audio_packet_duration(&self.config) + EPS).floor() as u64;
            self.next_audio = packet.min(self.audio_packets);
        }
        self.at_end = self.next_video >= self.video_frames && self.next_audio >= self.audio_packets;
        debug!(
            "🧪 合成源 seek {}ms ({:?}): video #{} audio #{}",
            timestamp_ms, seek_type, self.next_video, self.next_audio
        );
        Ok(())
    }

    fn at_end(&self) -> bool {
        self.at_end
    }

    fn media_info(&self) -> &MediaInfo {
        &self.info
    }

    fn video_stream_index(&self) -> Option<usize> {
        (self.video_frames > 0).then_some(VIDEO_STREAM)
    }

    fn audio_stream_index(&self) -> Option<usize> {
        (self.audio_packets > 0).then_some(AUDIO_STREAM)
    }

    fn has_attached_picture(&self) -> bool {
        self.config.attached_picture && self.video_frames > 0
    }

    fn is_seekable(&self) -> bool {
        self.config.seekable
    }

    fn description(&self) -> String {
        format!("Synthetic Demuxer: {}", self.config.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(fps: f64, gop: u32, duration: f64) -> SyntheticSource {
        SyntheticSource::new(
            SyntheticConfig::default()
                .with_video(fps, 4, 2)
                .with_key_interval(gop)
                .with_duration(duration),
        )
    }

    fn drain(src: &mut SyntheticSource) -> Vec<MediaPacket> {
        let mut out = Vec::new();
        while let Some(p) = src.read_packet().unwrap() {
            out.push(p);
        }
        out
    }

    #[test]
    fn packets_are_interleaved_by_pts() {
        let mut src = source(25.0, 12, 1.0);
        let packets = drain(&mut src);
        assert!(src.at_end());
        let mut last = f64::MIN;
        for p in &packets {
            assert!(p.packet.pts + 0.1 >= last);
            last = last.max(p.packet.pts);
        }
        let video = packets.iter().filter(|p| p.stream_index == VIDEO_STREAM).count();
        let audio = packets.iter().filter(|p| p.stream_index == AUDIO_STREAM).count();
        assert_eq!(video, 25);
        assert_eq!(audio, 10);
    }

    #[test]
    fn seek_lands_on_previous_key_frame() {
        let mut src = source(2.0, 4, 20.0);
        src.seek(9500, SeekType::Accurate).unwrap();
        let first_video = drain(&mut src)
            .into_iter()
            .find(|p| p.stream_index == VIDEO_STREAM)
            .unwrap();
        assert!(first_video.packet.key_frame);
        assert_eq!(first_video.packet.pts, 8.0);
    }

    #[test]
    fn seek_past_end_reports_end() {
        let mut src = source(25.0, 12, 1.0).config().clone().without_audio();
        src.video_duration = 1.0;
        let mut src = SyntheticSource::new(src);
        src.seek(5000, SeekType::KeyFrame).unwrap();
        assert!(!src.at_end());
        let rest = drain(&mut src);
        assert!(rest.len() <= 12);
        assert!(src.at_end());
    }

    #[test]
    fn odd_frames_inside_gop_are_disposable() {
        let src = source(25.0, 4, 1.0);
        assert_eq!(src.video_packet(0).data[0], 0);
        assert_eq!(src.video_packet(1).data[0], RAW_FLAG_DISPOSABLE);
        assert_eq!(src.video_packet(2).data[0], 0);
        assert_eq!(src.video_packet(4).data[0], 0);
    }

    #[test]
    fn unseekable_source_rejects_seek() {
        let config = SyntheticConfig::from_url("synthetic://live?fps=25&duration=2&seekable=0").unwrap();
        let mut src = SyntheticSource::new(config);
        assert!(!src.is_seekable());
        assert!(!src.media_info().seekable);
        let first = src.read_packet().unwrap().unwrap();
        assert!(matches!(src.seek(1000, SeekType::Accurate), Err(PlayerError::SeekError(_))));
        // 读取位置不受失败的 seek 影响
        let second = src.read_packet().unwrap().unwrap();
        assert!(second.packet.pts >= first.packet.pts);
    }

    #[test]
    fn stall_after_limit() {
        let mut config = SyntheticConfig::default();
        config.stall_after = Some(3);
        let mut src = SyntheticSource::new(config);
        for _ in 0..3 {
            assert!(src.read_packet().unwrap().is_some());
        }
        assert!(matches!(src.read_packet(), Err(PlayerError::Stalled(_))));
    }

    #[test]
    fn url_parameters() {
        let config = SyntheticConfig::from_url("synthetic://clip?fps=2&duration=12&audio=0&gop=4").unwrap();
        assert_eq!(config.fps, 2.0);
        assert_eq!(config.video_duration, 12.0);
        assert!(!config.has_audio());
        assert_eq!(config.key_interval, 4);
        assert!(SyntheticConfig::from_url("file:///tmp/a.mp4").is_err());
        assert!(SyntheticConfig::from_url("synthetic://x?fps=abc").is_err());
        assert!(matches!(
            SyntheticConfig::from_url("synthetic://x?fps=0&audio=0"),
            Err(PlayerError::NoStreams)
        ));
    }
}
