use crate::core::{AudioFrame, Packet, PixelFormat, SampleBuffer, VideoFrame};
use log::{debug, warn};
use std::collections::HashMap;

/// 帧丢弃策略（对应解码器的 skip_frame 选项）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SkipFrame {
    /// 正常解码
    #[default]
    Default,
    /// 丢弃非参考帧（追帧时使用）
    NonRef,
}

/// 解码器选项
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecoderOptions {
    pub skip_frame: SkipFrame,
    pub extra: HashMap<String, String>,
}

impl DecoderOptions {
    pub fn frame_drop() -> Self {
        Self {
            skip_frame: SkipFrame::NonRef,
            ..Default::default()
        }
    }
}

/// 解码器抽象接口：一次解码一个包，最多产出一帧
pub trait Decoder<F>: Send {
    fn name(&self) -> &str;

    /// 解码数据包，失败返回 false
    fn decode(&mut self, packet: &Packet) -> bool;

    /// 取出最近一次解码得到的帧
    fn frame(&mut self) -> Option<F>;

    /// 丢弃内部缓存（seek 后调用）
    fn flush(&mut self);

    fn set_options(&mut self, options: &DecoderOptions);

    /// 上一个包中尚未消费的字节数
    fn undecoded_size(&self) -> usize {
        0
    }
}

pub type VideoDecoder = Box<dyn Decoder<VideoFrame>>;
pub type AudioDecoder = Box<dyn Decoder<AudioFrame>>;

/// 原始视频帧头：bit0 表示可丢弃（非参考帧）
pub const RAW_FLAG_DISPOSABLE: u8 = 0x01;

/// 原始视频解码器
///
/// 包格式：1 字节标志 + 一帧完整像素数据
pub struct RawVideoDecoder {
    width: u32,
    height: u32,
    format: PixelFormat,
    options: DecoderOptions,
    frame: Option<VideoFrame>,
    dropped: u64,
}

impl RawVideoDecoder {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            options: DecoderOptions::default(),
            frame: None,
            dropped: 0,
        }
    }

    /// 因 skip_frame 丢弃的帧数
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Decoder<VideoFrame> for RawVideoDecoder {
    fn name(&self) -> &str {
        "rawvideo"
    }

    fn decode(&mut self, packet: &Packet) -> bool {
        self.frame = None;
        let Some((&flags, pixels)) = packet.data.split_first() else {
            return false;
        };
        let expected = self.format.frame_size(self.width, self.height);
        if pixels.len() != expected {
            warn!("原始视频包大小错误: {} != {}", pixels.len(), expected);
            return false;
        }
        if self.options.skip_frame == SkipFrame::NonRef && flags & RAW_FLAG_DISPOSABLE != 0 {
            self.dropped += 1;
            return true;
        }
        self.frame = Some(VideoFrame {
            timestamp: packet.pts,
            duration: packet.duration,
            width: self.width,
            height: self.height,
            format: self.format,
            data: packet.data.slice(1..),
        });
        true
    }

    fn frame(&mut self) -> Option<VideoFrame> {
        self.frame.take()
    }

    fn flush(&mut self) {
        self.frame = None;
    }

    fn set_options(&mut self, options: &DecoderOptions) {
        if self.options.skip_frame != options.skip_frame {
            debug!("rawvideo skip_frame: {:?} -> {:?}", self.options.skip_frame, options.skip_frame);
        }
        self.options = options.clone();
    }
}

/// PCM 解码器（交错排列的 16 位小端采样）
pub struct PcmDecoder {
    sample_rate: u32,
    channels: u16,
    frame: Option<AudioFrame>,
}

impl PcmDecoder {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            frame: None,
        }
    }
}

impl Decoder<AudioFrame> for PcmDecoder {
    fn name(&self) -> &str {
        "pcm_s16le"
    }

    fn decode(&mut self, packet: &Packet) -> bool {
        self.frame = None;
        let block = 2 * self.channels as usize;
        if packet.data.is_empty() || packet.data.len() % block != 0 {
            return false;
        }
        let samples: Vec<i16> = packet
            .data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        let duration = (samples.len() / self.channels as usize) as f64 / self.sample_rate as f64;
        self.frame = Some(AudioFrame {
            timestamp: packet.pts,
            duration,
            sample_rate: self.sample_rate,
            channels: self.channels,
            data: SampleBuffer::I16(samples),
        });
        true
    }

    fn frame(&mut self) -> Option<AudioFrame> {
        self.frame.take()
    }

    fn flush(&mut self) {
        self.frame = None;
    }

    fn set_options(&mut self, _options: &DecoderOptions) {}
}
