use crate::core::{log_ctx, MediaInfo, PlayerError, Result};
use crate::player::decoder::{AudioDecoder, PcmDecoder, RawVideoDecoder, VideoDecoder};
use crate::player::demuxer_source::DemuxerSource;
use crate::player::synthetic::{SyntheticConfig, SyntheticSource, SYNTHETIC_SCHEME};
use crossbeam_channel::Sender;
use log::{error, info};
use std::sync::Arc;

/// 打开后的媒体：数据源 + 各流的解码器
pub struct LoadedMedia {
    pub demuxer: Box<dyn DemuxerSource>,
    pub video_decoder: Option<VideoDecoder>,
    pub audio_decoder: Option<AudioDecoder>,
    pub info: MediaInfo,
}

impl LoadedMedia {
    /// 丢弃没有解码器的流；两个流都不可用时报错
    pub fn validate(self) -> Result<Self> {
        let has_video = self.video_decoder.is_some() && self.demuxer.video_stream_index().is_some();
        let has_audio = self.audio_decoder.is_some() && self.demuxer.audio_stream_index().is_some();
        if !has_video && !has_audio {
            return Err(PlayerError::NoStreams);
        }
        Ok(self)
    }
}

/// 媒体加载器：根据地址创建数据源和解码器（可能很耗时，在后台线程中调用）
pub trait MediaLoader: Send + Sync {
    fn open(&self, url: &str) -> Result<LoadedMedia>;
}

/// 加载结果
pub enum LoadResult {
    /// 创建成功
    Success { media: LoadedMedia, url: String },
    /// 创建失败
    Failed { url: String, error: String },
}

impl LoadResult {
    pub fn from_result(url: &str, result: Result<LoadedMedia>) -> Self {
        match result.and_then(LoadedMedia::validate) {
            Ok(media) => LoadResult::Success {
                media,
                url: url.to_string(),
            },
            Err(e) => LoadResult::Failed {
                url: url.to_string(),
                error: e.to_string(),
            },
        }
    }
}

/// 在阻塞线程池中加载，结果通过通道送回
///
/// 使用方法：
/// ```ignore
/// let (tx, rx) = unbounded();
/// load_async(&runtime, loader, url, tx);
/// if let Ok(LoadResult::Success { media, .. }) = rx.recv() { /* ... */ }
/// ```
pub fn load_async(runtime: &tokio::runtime::Handle, loader: Arc<dyn MediaLoader>, url: String, result_tx: Sender<LoadResult>) {
    runtime.spawn_blocking(move || {
        info!("{} 🔨 开始在后台加载媒体: {}", log_ctx(), url);
        let result = LoadResult::from_result(&url, loader.open(&url));
        if let Err(e) = result_tx.send(result) {
            error!("{} ❌ 发送加载结果失败: {}", log_ctx(), e);
        } else {
            info!("{} ✅ 加载结果已发送", log_ctx());
        }
    });
}

/// 合成媒体加载器：`synthetic://` 地址，原始视频 + PCM 解码器
#[derive(Debug, Default, Clone)]
pub struct SyntheticLoader {
    preset: Option<SyntheticConfig>,
}

impl SyntheticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// 忽略地址参数，总是使用给定配置（地址仍然写入媒体信息）
    pub fn with_config(config: SyntheticConfig) -> Self {
        Self { preset: Some(config) }
    }
}

impl MediaLoader for SyntheticLoader {
    fn open(&self, url: &str) -> Result<LoadedMedia> {
        let config = match &self.preset {
            Some(preset) => SyntheticConfig {
                url: url.to_string(),
                ..preset.clone()
            },
            None => {
                if !url.starts_with(SYNTHETIC_SCHEME) {
                    return Err(PlayerError::OpenError(format!("不支持的地址: {}", url)));
                }
                SyntheticConfig::from_url(url)?
            }
        };
        info!("{} 📁 打开合成媒体: {}", log_ctx(), url);
        let source = SyntheticSource::new(config.clone());
        let info = source.media_info().clone();
        let video_decoder: Option<VideoDecoder> = source
            .video_stream_index()
            .map(|_| Box::new(RawVideoDecoder::new(config.width, config.height, config.pixel_format)) as VideoDecoder);
        let audio_decoder: Option<AudioDecoder> = source
            .audio_stream_index()
            .map(|_| Box::new(PcmDecoder::new(config.sample_rate, config.channels)) as AudioDecoder);
        Ok(LoadedMedia {
            demuxer: Box::new(source),
            video_decoder,
            audio_decoder,
            info,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    #[test]
    fn synthetic_loader_builds_decoders_per_stream() {
        let media = SyntheticLoader::new().open("synthetic://a?audio=0").unwrap();
        assert!(media.video_decoder.is_some());
        assert!(media.audio_decoder.is_none());
        assert!(media.info.has_video);
        assert!(!media.info.has_audio);
    }

    #[test]
    fn unsupported_url_fails() {
        let result = LoadResult::from_result("/tmp/x.mkv", SyntheticLoader::new().open("/tmp/x.mkv"));
        assert!(matches!(result, LoadResult::Failed { .. }));
    }

    #[test]
    fn async_load_delivers_result() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let (tx, rx) = unbounded();
        load_async(runtime.handle(), Arc::new(SyntheticLoader::new()), "synthetic://b".to_string(), tx);
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            LoadResult::Success { media, url } => {
                assert_eq!(url, "synthetic://b");
                assert!(media.info.has_audio && media.info.has_video);
            }
            LoadResult::Failed { error, .. } => panic!("load failed: {error}"),
        }
    }
}
