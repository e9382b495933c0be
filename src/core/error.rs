use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("配置解析错误: {0}")]
    ConfigError(#[from] serde_json::Error),

    #[error("无法打开媒体: {0}")]
    OpenError(String),

    #[error("媒体中没有可播放的音视频流")]
    NoStreams,

    #[error("Seek 失败: {0}")]
    SeekError(String),

    #[error("数据源停滞: {0}")]
    Stalled(String),

    #[error("状态错误: {0}")]
    InvalidState(String),

    #[error("线程错误: {0}")]
    ThreadError(String),
}

pub type Result<T> = std::result::Result<T, PlayerError>;
