use crate::core::{MediaInfo, Packet, Result, SeekType, StreamKind};

/// 媒体包（可跨线程传递）
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub packet: Packet,
    pub stream_index: usize,
}

/// Demuxer 数据源抽象接口
///
/// 这个 trait 定义了所有 Demuxer 实现必须提供的方法
/// 不同的媒体源（本地文件、网络流、内存流等）可以实现这个接口
pub trait DemuxerSource: Send {
    /// 读取下一个媒体包
    ///
    /// 返回：
    /// - Ok(Some(packet)): 成功读取一个包
    /// - Ok(None): 到达文件末尾
    /// - Err(PlayerError::Stalled): 数据源停滞（网络超时等），解复用线程退出
    /// - Err(e): 其他读取错误，跳过该包
    fn read_packet(&mut self) -> Result<Option<MediaPacket>>;

    /// Seek 到指定位置（毫秒，绝对时间）
    fn seek(&mut self, timestamp_ms: i64, seek_type: SeekType) -> Result<()>;

    /// 是否已读到末尾
    fn at_end(&self) -> bool;

    /// 获取媒体信息
    fn media_info(&self) -> &MediaInfo;

    /// 获取视频流索引
    fn video_stream_index(&self) -> Option<usize>;

    /// 获取音频流索引
    fn audio_stream_index(&self) -> Option<usize>;

    /// 视频流是否只是封面图（不参与同步）
    fn has_attached_picture(&self) -> bool {
        false
    }

    /// 是否支持 seek
    fn is_seekable(&self) -> bool {
        true
    }

    /// 媒体起始时间（毫秒）
    fn start_time_ms(&self) -> i64 {
        self.media_info().start_time
    }

    /// 媒体总时长（毫秒）
    fn duration_ms(&self) -> i64 {
        self.media_info().duration
    }

    /// 按流索引判断包所属的流
    fn stream_kind(&self, stream_index: usize) -> Option<StreamKind> {
        if Some(stream_index) == self.audio_stream_index() {
            Some(StreamKind::Audio)
        } else if Some(stream_index) == self.video_stream_index() {
            Some(StreamKind::Video)
        } else {
            None
        }
    }

    /// 获取描述信息（用于调试）
    fn description(&self) -> String;
}
