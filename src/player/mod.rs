// 播放器核心模块

pub mod packet_buffer;   // 带缓冲策略的数据包队列
pub mod decoder;         // 解码器接口
pub mod output;          // 输出端集合
pub mod decode_thread;   // 解码线程基础设施
pub mod video_thread;
pub mod audio_thread;
pub mod demuxer_source;  // 数据源抽象接口
pub mod demuxer_thread;  // 解复用线程（seek/单步/缓冲/结束处理）
pub mod synthetic;       // 合成数据源（测试和演示）
pub mod loader;          // 媒体加载（可异步）
pub mod manager;

pub use packet_buffer::PacketBuffer;
pub use decoder::{AudioDecoder, Decoder, DecoderOptions, PcmDecoder, RawVideoDecoder, SkipFrame, VideoDecoder};
pub use output::{FrameSink, NullSink, OutputId, OutputSet, RecordingSink};
pub use decode_thread::{DecodeThread, StepMode};
pub use video_thread::VideoThread;
pub use audio_thread::AudioThread;
pub use demuxer_source::{DemuxerSource, MediaPacket};
pub use demuxer_thread::DemuxerThread;
pub use synthetic::{SyntheticConfig, SyntheticSource};
pub use loader::{LoadResult, LoadedMedia, MediaLoader, SyntheticLoader};
pub use manager::PlaybackManager;
