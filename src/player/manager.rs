// 播放管理器：加载媒体、播放状态机、位置/重复控制、对外通知
//
// 命令（load/play/stop）由 ops 锁串行化；查询只取 inner 锁。
// 通知线程转发解复用线程的事件，定时上报位置并处理 A-B 重复和播放结束。

use crate::core::{
    log_ctx, AudioFrame, ClockType, MediaEndAction, MediaInfo, MediaStatus, PlaybackClock, PlaybackState, PlayerConfig,
    PlayerError, PlayerEvent, Result, SeekType, SharedStatistics, Statistics, StreamKind, VideoFrame,
};
use crate::player::audio_thread::{self, AudioState, AudioThread};
use crate::player::decode_thread::{DecodeThread, ThreadShared};
use crate::player::decoder::{AudioDecoder, VideoDecoder};
use crate::player::demuxer_source::DemuxerSource;
use crate::player::demuxer_thread::{DemuxSetup, DemuxerThread};
use crate::player::loader::{load_async, LoadResult, LoadedMedia, MediaLoader};
use crate::player::output::{FrameSink, OutputId, OutputSet};
use crate::player::packet_buffer::PacketBuffer;
use crate::player::video_thread::{self, VideoState, VideoThread};
use crossbeam_channel::{bounded, never, select, unbounded, Receiver, Sender, TrySendError};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// 通知线程在没有事件时的最长等待
const NOTIFY_POLL: Duration = Duration::from_millis(50);
/// 单步后恢复播放时往回 seek 的距离（毫秒）
const RESUME_AFTER_STEP_MS: i64 = 100;
/// 对外事件队列容量，调用方不读取时丢弃新事件
pub const EVENT_QUEUE_CAPACITY: usize = 256;
/// 停止位置默认值：媒体末尾
pub const MEDIA_END: i64 = i64::MAX;

/// 把用户位置限制在 [media_start, media_stop] 内，负值表示从末尾往回数
///
/// media_stop 为 None 表示时长未知（例如不可 seek 的流）。
pub fn normalize_position(pos: i64, media_start: i64, media_stop: Option<i64>) -> i64 {
    let pos = if pos < 0 {
        match media_stop {
            Some(stop) => stop.saturating_add(pos),
            None => media_start,
        }
    } else {
        pos
    };
    let pos = media_stop.map_or(pos, |stop| pos.min(stop));
    pos.max(media_start)
}

/// 空闲（未播放）时保存的数据源和解码器
struct Media {
    demuxer: Box<dyn DemuxerSource>,
    video_decoder: Option<VideoDecoder>,
    audio_decoder: Option<AudioDecoder>,
}

/// 一次播放会话的线程
struct Session {
    demux: DemuxerThread,
    video: Option<Arc<VideoThread>>,
    audio: Option<Arc<AudioThread>>,
    /// 没有启动线程的流（例如没有音频输出）保留其解码器
    spare_video: Option<VideoDecoder>,
    spare_audio: Option<AudioDecoder>,
    events: Receiver<PlayerEvent>,
    generation: u64,
}

impl Session {
    /// 停止所有线程并取回数据源和解码器；有线程未能按时退出时返回 None
    fn shutdown(self, timeout: Duration) -> Option<Media> {
        let Session {
            demux,
            video,
            audio,
            spare_video,
            spare_audio,
            ..
        } = self;
        let source = demux.join_timeout(timeout);
        let video_decoder = video.map(|t| recover_decoder(t, timeout, VideoState::take_decoder));
        let audio_decoder = audio.map(|t| recover_decoder(t, timeout, AudioState::take_decoder));
        let video_decoder = match video_decoder {
            Some(decoder) => Some(decoder?),
            None => spare_video,
        };
        let audio_decoder = match audio_decoder {
            Some(decoder) => Some(decoder?),
            None => spare_audio,
        };
        Some(Media {
            demuxer: source?,
            video_decoder,
            audio_decoder,
        })
    }
}

fn recover_decoder<S: Send + 'static, D>(
    thread: Arc<DecodeThread<S>>,
    timeout: Duration,
    take: impl FnOnce(&mut S) -> Option<D>,
) -> Option<D> {
    match Arc::try_unwrap(thread) {
        Ok(thread) => thread.join_timeout(timeout).and_then(|mut state| take(&mut state)),
        Err(thread) => {
            warn!("{} ⚠ {} 解码线程仍被占用，放弃回收解码器", log_ctx(), thread.kind().as_str());
            thread.stop();
            None
        }
    }
}

struct Inner {
    /// 位置相对于媒体起始时间
    relative: bool,
    state: PlaybackState,
    status: MediaStatus,
    url: Option<String>,
    info: Option<MediaInfo>,
    media: Option<Media>,
    session: Option<Session>,
    clock: PlaybackClock,
    generation: u64,
    play_after_load: bool,
    repeat_max: i32,
    repeat_current: i32,
    start_position: i64,
    stop_position: i64,
    start_norm: i64,
    stop_norm: Option<i64>,
    seek_type: SeekType,
    end_action: MediaEndAction,
    force_fps: f64,
    seeking: bool,
    was_stepping: bool,
    last_known_good: i64,
}

impl Inner {
    fn time_offset(&self) -> i64 {
        match &self.info {
            Some(info) if self.relative => info.start_time,
            _ => 0,
        }
    }

    /// 用户坐标下的媒体起点
    fn media_start_position(&self) -> i64 {
        match &self.info {
            Some(info) if !self.relative => info.start_time,
            _ => 0,
        }
    }

    /// 用户坐标下的媒体终点，时长未知时为 None
    fn media_stop_position(&self) -> Option<i64> {
        let info = self.info.as_ref()?;
        if info.duration <= 0 || !info.seekable {
            return None;
        }
        Some(self.media_start_position() + info.duration)
    }

    fn update_norms(&mut self) {
        let start = self.media_start_position();
        let stop = self.media_stop_position();
        self.start_norm = normalize_position(self.start_position, start, stop);
        self.stop_norm = if self.stop_position == MEDIA_END {
            stop
        } else {
            Some(normalize_position(self.stop_position, start, stop))
        };
    }
}

/// 播放器内部共享部分（通知线程和后台加载也会访问）
struct Engine {
    config: RwLock<PlayerConfig>,
    loader: Arc<dyn MediaLoader>,
    events: Sender<PlayerEvent>,
    load_tx: Sender<LoadResult>,
    video_outputs: Arc<OutputSet<VideoFrame>>,
    audio_outputs: Arc<OutputSet<AudioFrame>>,
    stats: SharedStatistics,
    ops: Mutex<()>,
    inner: Mutex<Inner>,
    shutdown: AtomicBool,
}

/// 后台任务执行器：自带的 tokio 运行时或外部注入的句柄
enum Executor {
    Owned(tokio::runtime::Runtime),
    Injected(tokio::runtime::Handle),
}

impl Executor {
    fn handle(&self) -> tokio::runtime::Handle {
        match self {
            Executor::Owned(runtime) => runtime.handle().clone(),
            Executor::Injected(handle) => handle.clone(),
        }
    }
}

/// 播放管理器
pub struct PlaybackManager {
    engine: Arc<Engine>,
    executor: Option<Executor>,
    events: Receiver<PlayerEvent>,
    notifier: Option<JoinHandle<()>>,
}

impl PlaybackManager {
    /// 创建播放器，后台加载使用自带的线程池
    pub fn new(config: PlayerConfig, loader: Arc<dyn MediaLoader>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("player-worker")
            .enable_all()
            .build()?;
        Self::build(config, loader, Executor::Owned(runtime))
    }

    /// 创建播放器，后台加载使用调用方提供的运行时
    pub fn with_executor(config: PlayerConfig, loader: Arc<dyn MediaLoader>, handle: tokio::runtime::Handle) -> Result<Self> {
        Self::build(config, loader, Executor::Injected(handle))
    }

    fn build(mut config: PlayerConfig, loader: Arc<dyn MediaLoader>, executor: Executor) -> Result<Self> {
        info!("{} 🎮 创建播放管理器...", log_ctx());
        config.normalize();
        let (events_tx, events_rx) = bounded(EVENT_QUEUE_CAPACITY);
        let (load_tx, load_rx) = unbounded();
        let clock = PlaybackClock::new();
        let inner = Inner {
            relative: config.relative_time_mode,
            state: PlaybackState::Stopped,
            status: MediaStatus::NoMedia,
            url: None,
            info: None,
            media: None,
            session: None,
            clock,
            generation: 0,
            play_after_load: false,
            repeat_max: 0,
            repeat_current: -1,
            start_position: 0,
            stop_position: MEDIA_END,
            start_norm: 0,
            stop_norm: None,
            seek_type: config.seek_type,
            end_action: config.media_end_action,
            force_fps: 0.0,
            seeking: false,
            was_stepping: false,
            last_known_good: 0,
        };
        let engine = Arc::new(Engine {
            config: RwLock::new(config),
            loader,
            events: events_tx,
            load_tx,
            video_outputs: Arc::new(OutputSet::new()),
            audio_outputs: Arc::new(OutputSet::new()),
            stats: Arc::new(RwLock::new(Statistics::default())),
            ops: Mutex::new(()),
            inner: Mutex::new(inner),
            shutdown: AtomicBool::new(false),
        });
        let notifier_engine = engine.clone();
        let notifier = thread::Builder::new()
            .name("player-notify".to_string())
            .spawn(move || notifier_engine.notify_loop(load_rx))
            .map_err(|e| PlayerError::ThreadError(format!("无法启动通知线程: {}", e)))?;
        info!("{} ✅ 播放管理器创建完成", log_ctx());
        Ok(Self {
            engine,
            executor: Some(executor),
            events: events_rx,
            notifier: Some(notifier),
        })
    }

    /// 事件接收端（可以克隆给多个消费者，每个事件只会被取走一次）
    ///
    /// 队列容量为 EVENT_QUEUE_CAPACITY，满了之后的新事件被丢弃。
    pub fn events(&self) -> Receiver<PlayerEvent> {
        self.events.clone()
    }

    pub fn config(&self) -> PlayerConfig {
        self.engine.config.read().clone()
    }

    /// 加载媒体。async_load 开启时在后台完成，结果以 Loaded/LoadFailed 事件通知
    pub fn load(&self, url: &str) -> Result<()> {
        let _ops = self.engine.ops.lock();
        self.engine.stop_locked();
        let async_load = self.engine.config.read().async_load;
        {
            let mut inner = self.engine.inner.lock();
            inner.url = Some(url.to_string());
            inner.info = None;
            inner.media = None;
            inner.generation += 1;
            self.engine.set_status(&mut inner, MediaStatus::Loading);
        }
        info!("{} 📂 加载媒体: {} (async={})", log_ctx(), url, async_load);
        match (async_load, self.executor.as_ref()) {
            (true, Some(executor)) => {
                load_async(&executor.handle(), self.engine.loader.clone(), url.to_string(), self.engine.load_tx.clone());
                Ok(())
            }
            _ => {
                let result = LoadResult::from_result(url, self.engine.loader.open(url));
                self.engine.finish_load(result)
            }
        }
    }

    /// 开始播放。未加载时先加载（异步加载完成后自动开始）
    pub fn play(&self) -> Result<()> {
        let ops = self.engine.ops.lock();
        let mut inner = self.engine.inner.lock();
        if inner.session.is_some() {
            debug!("{} play() when playing", log_ctx());
            return Ok(());
        }
        if inner.media.is_none() {
            if inner.status == MediaStatus::Loading {
                inner.play_after_load = true;
                return Ok(());
            }
            let Some(url) = inner.url.clone() else {
                return Err(PlayerError::InvalidState("没有加载媒体，无法播放".to_string()));
            };
            info!("{} 🔄 媒体需要重新加载: {}", log_ctx(), url);
            drop(inner);
            drop(ops);
            self.load(&url)?;
            let _ops = self.engine.ops.lock();
            let mut inner = self.engine.inner.lock();
            if inner.media.is_none() {
                if inner.status != MediaStatus::Loading {
                    return Err(PlayerError::InvalidState("媒体加载失败，无法播放".to_string()));
                }
                inner.play_after_load = true;
                return Ok(());
            }
            return self.engine.start_session(&mut inner);
        }
        self.engine.start_session(&mut inner)
    }

    /// 暂停/继续
    pub fn pause(&self, paused: bool) {
        self.engine.pause(paused);
    }

    pub fn toggle_pause(&self) {
        let paused = self.is_paused();
        self.engine.pause(!paused);
    }

    /// 停止播放。可重复调用，等待线程退出的时间有上限
    pub fn stop(&self) {
        let _ops = self.engine.ops.lock();
        self.engine.stop_locked();
    }

    /// 跳转到指定位置（毫秒）
    pub fn seek(&self, position_ms: i64) {
        self.set_position(position_ms);
    }

    /// 按时长比例跳转，r ∈ [0, 1]
    pub fn seek_ratio(&self, r: f64) {
        let duration = self.duration();
        let start = {
            let inner = self.engine.inner.lock();
            inner.media_start_position()
        };
        self.set_position(start + (r.clamp(0.0, 1.0) * duration as f64) as i64);
    }

    /// 跳转（毫秒，用户坐标）。位置会被限制到 [起始位置, 停止位置]
    pub fn set_position(&self, position_ms: i64) {
        let mut inner = self.engine.inner.lock();
        self.engine.set_position(&mut inner, position_ms);
    }

    pub fn step_forward(&self) {
        self.engine.pause(true);
        let mut inner = self.engine.inner.lock();
        let Some(session) = inner.session.as_ref() else {
            return;
        };
        session.demux.step_forward();
        inner.was_stepping = true;
    }

    pub fn step_backward(&self) {
        self.engine.pause(true);
        let mut inner = self.engine.inner.lock();
        let Some(session) = inner.session.as_ref() else {
            return;
        };
        session.demux.step_backward();
        inner.was_stepping = true;
    }

    /// 重复次数，-1 表示无限
    pub fn set_repeat(&self, max: i32) {
        let max = if max < 0 { i32::MAX } else { max };
        self.engine.inner.lock().repeat_max = max;
        self.engine.emit(PlayerEvent::RepeatChanged(max));
    }

    pub fn repeat(&self) -> i32 {
        self.engine.inner.lock().repeat_max
    }

    pub fn current_repeat(&self) -> i32 {
        self.engine.inner.lock().repeat_current
    }

    pub fn set_speed(&self, speed: f64) {
        if speed.is_nan() || speed <= 0.0 {
            warn!("{} ⚠ 无效的播放速度 {}", log_ctx(), speed);
            return;
        }
        let clock = self.engine.inner.lock().clock.clone();
        if (clock.speed() - speed).abs() < f64::EPSILON {
            return;
        }
        clock.set_speed(speed);
        info!("{} ⏩ 播放速度: {}", log_ctx(), speed);
        self.engine.emit(PlayerEvent::SpeedChanged(speed));
    }

    pub fn speed(&self) -> f64 {
        self.engine.inner.lock().clock.speed()
    }

    pub fn set_start_position(&self, pos: i64) {
        let mut inner = self.engine.inner.lock();
        inner.start_position = pos;
        inner.update_norms();
    }

    pub fn set_stop_position(&self, pos: i64) {
        let mut inner = self.engine.inner.lock();
        inner.stop_position = pos;
        inner.update_norms();
    }

    /// A-B 区间；start > stop 时忽略
    pub fn set_time_range(&self, start: i64, stop: i64) {
        if stop != MEDIA_END && start > stop && stop >= 0 {
            warn!("{} ⚠ 无效的时间范围 {}..{}", log_ctx(), start, stop);
            return;
        }
        let mut inner = self.engine.inner.lock();
        inner.stop_position = stop;
        inner.start_position = start;
        inner.update_norms();
    }

    pub fn start_position(&self) -> i64 {
        self.engine.inner.lock().start_norm
    }

    pub fn stop_position(&self) -> Option<i64> {
        self.engine.inner.lock().stop_norm
    }

    pub fn set_seek_type(&self, seek_type: SeekType) {
        self.engine.inner.lock().seek_type = seek_type;
    }

    pub fn seek_type(&self) -> SeekType {
        self.engine.inner.lock().seek_type
    }

    pub fn set_media_end_action(&self, action: MediaEndAction) {
        let mut inner = self.engine.inner.lock();
        inner.end_action = action;
        if let Some(session) = inner.session.as_ref() {
            session.demux.set_media_end_action(action);
        }
    }

    pub fn media_end_action(&self) -> MediaEndAction {
        self.engine.inner.lock().end_action
    }

    /// 强制视频帧率。0 使用码流帧率；负值只在码流没有时间戳时使用
    pub fn set_frame_rate(&self, fps: f64) {
        let mut inner = self.engine.inner.lock();
        inner.force_fps = fps;
        Engine::apply_frame_rate(&inner);
    }

    pub fn forced_frame_rate(&self) -> f64 {
        self.engine.inner.lock().force_fps
    }

    /// 截取当前显示的视频帧
    pub fn capture(&self, timeout: Duration) -> Option<VideoFrame> {
        let rx = {
            let inner = self.engine.inner.lock();
            inner.session.as_ref()?.video.as_ref()?.capture()
        };
        rx.recv_timeout(timeout).ok().flatten()
    }

    pub fn add_video_sink(&self, sink: Box<dyn FrameSink<VideoFrame>>) -> OutputId {
        self.engine.video_outputs.add_output(sink)
    }

    pub fn remove_video_sink(&self, id: OutputId) -> Option<Box<dyn FrameSink<VideoFrame>>> {
        self.engine.video_outputs.remove_output(id)
    }

    pub fn add_audio_sink(&self, sink: Box<dyn FrameSink<AudioFrame>>) -> OutputId {
        self.engine.audio_outputs.add_output(sink)
    }

    pub fn remove_audio_sink(&self, id: OutputId) -> Option<Box<dyn FrameSink<AudioFrame>>> {
        self.engine.audio_outputs.remove_output(id)
    }

    /// 输出端暂停/恢复（全部输出端暂停时解码线程挂起）
    pub fn notify_sink_paused(&self, kind: StreamKind, id: OutputId, paused: bool) {
        match kind {
            StreamKind::Video => self.engine.video_outputs.notify_pause_change(id, paused),
            StreamKind::Audio => self.engine.audio_outputs.notify_pause_change(id, paused),
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.engine.inner.lock().state
    }

    pub fn is_playing(&self) -> bool {
        self.engine.inner.lock().session.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.engine.inner.lock().state == PlaybackState::Paused
    }

    pub fn media_status(&self) -> MediaStatus {
        self.engine.inner.lock().status
    }

    pub fn is_loaded(&self) -> bool {
        self.engine.inner.lock().info.is_some()
    }

    pub fn media_info(&self) -> Option<MediaInfo> {
        self.engine.inner.lock().info.clone()
    }

    /// 当前位置（毫秒，用户坐标）
    pub fn position(&self) -> i64 {
        self.engine.position(&self.engine.inner.lock())
    }

    /// 界面显示用的位置：seek/缓冲/单步期间返回最近一次 seek 的位置
    pub fn display_position(&self) -> i64 {
        let mut inner = self.engine.inner.lock();
        let offset = inner.time_offset();
        let Some(session) = inner.session.as_ref() else {
            return 0;
        };
        let unsettled = inner.seeking || session.demux.has_seek_tasks() || session.demux.is_buffering();
        let pts = if unsettled || inner.was_stepping {
            session.demux.last_seek_pos()
        } else if session.video.is_some() {
            (inner.clock.video_time() * 1000.0) as i64
        } else {
            (inner.clock.value() * 1000.0) as i64
        };
        if pts < 0 {
            return inner.last_known_good - offset;
        }
        inner.last_known_good = pts;
        pts - offset
    }

    /// 媒体时长（毫秒）
    pub fn duration(&self) -> i64 {
        self.engine.inner.lock().info.as_ref().map_or(0, |i| i.duration)
    }

    pub fn buffer_progress(&self) -> f64 {
        let inner = self.engine.inner.lock();
        inner.session.as_ref().map_or(0.0, |s| s.demux.buffer_progress())
    }

    pub fn buffered(&self) -> i64 {
        let inner = self.engine.inner.lock();
        inner.session.as_ref().map_or(0, |s| s.demux.buffered())
    }

    pub fn statistics(&self) -> Statistics {
        self.engine.stats.read().clone()
    }
}

impl Drop for PlaybackManager {
    fn drop(&mut self) {
        info!("{} 🧹 销毁播放管理器", log_ctx());
        self.engine.shutdown.store(true, Ordering::Release);
        self.stop();
        let timeout = self.engine.config.read().stop_timeout();
        if let Some(handle) = self.notifier.take() {
            let deadline = Instant::now() + timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                error!("{} ⏱ 通知线程未能按时退出", log_ctx());
            }
        }
        if let Some(Executor::Owned(runtime)) = self.executor.take() {
            runtime.shutdown_timeout(timeout);
        }
    }
}

impl Engine {
    fn emit(&self, event: PlayerEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => debug!("{} 事件队列已满，丢弃 {:?}", log_ctx(), event),
            Err(TrySendError::Disconnected(_)) => debug!("{} 播放器事件接收端已关闭", log_ctx()),
        }
    }

    fn set_status(&self, inner: &mut Inner, status: MediaStatus) {
        if inner.status == status {
            return;
        }
        inner.status = status;
        self.emit(PlayerEvent::MediaStatusChanged(status));
    }

    fn set_state(&self, inner: &mut Inner, state: PlaybackState) {
        if inner.state == state {
            return;
        }
        inner.state = state;
        info!("{} 🎬 播放状态: {:?}", log_ctx(), state);
        self.emit(PlayerEvent::StateChanged(state));
    }

    fn position(&self, inner: &Inner) -> i64 {
        let Some(session) = inner.session.as_ref() else {
            return 0;
        };
        let offset = inner.time_offset();
        if inner.seeking || session.demux.has_seek_tasks() {
            return session.demux.last_seek_pos() - offset;
        }
        (inner.clock.value() * 1000.0) as i64 - offset
    }

    /// 安装加载结果（同步加载或通知线程收到后台结果时调用）
    fn finish_load(&self, result: LoadResult) -> Result<()> {
        let mut inner = self.inner.lock();
        match result {
            LoadResult::Success { media, url } => {
                if inner.url.as_deref() != Some(url.as_str()) || inner.status != MediaStatus::Loading {
                    debug!("{} 丢弃过期的加载结果: {}", log_ctx(), url);
                    return Ok(());
                }
                let LoadedMedia {
                    demuxer,
                    video_decoder,
                    audio_decoder,
                    info,
                } = media;
                info!(
                    "{} ✅ 媒体已加载: {} ({}ms, video={}, audio={})",
                    log_ctx(),
                    url,
                    info.duration,
                    info.has_video,
                    info.has_audio
                );
                // 新媒体使用新时钟，保留速度和自动选择设置
                let old = inner.clock.clone();
                let clock = PlaybackClock::new();
                clock.set_speed(old.speed());
                clock.set_clock_auto(old.is_clock_auto());
                if !old.is_clock_auto() {
                    clock.set_clock_type(old.clock_type());
                }
                inner.clock = clock;
                *self.stats.write() = Statistics::from_media_info(&info);
                inner.info = Some(info.clone());
                inner.media = Some(Media {
                    demuxer,
                    video_decoder,
                    audio_decoder,
                });
                inner.update_norms();
                self.set_status(&mut inner, MediaStatus::Loaded);
                self.emit(PlayerEvent::Loaded(info));
                if std::mem::take(&mut inner.play_after_load) {
                    self.start_session(&mut inner)?;
                }
                Ok(())
            }
            LoadResult::Failed { url, error } => {
                if inner.url.as_deref() != Some(url.as_str()) || inner.status != MediaStatus::Loading {
                    return Ok(());
                }
                error!("{} ❌ 加载失败: {} ({})", log_ctx(), url, error);
                inner.play_after_load = false;
                self.set_status(&mut inner, MediaStatus::InvalidMedia);
                self.emit(PlayerEvent::LoadFailed(error.clone()));
                Err(PlayerError::OpenError(error))
            }
        }
    }

    /// 启动解码线程和解复用线程（调用方持有 ops 锁）
    fn start_session(&self, inner: &mut Inner) -> Result<()> {
        let Some(media) = inner.media.take() else {
            return Err(PlayerError::InvalidState("媒体尚未加载".to_string()));
        };
        let Some(info) = inner.info.clone() else {
            inner.media = Some(media);
            return Err(PlayerError::InvalidState("缺少媒体信息".to_string()));
        };
        let config = self.config.read().clone();
        let Media {
            mut demuxer,
            mut video_decoder,
            mut audio_decoder,
        } = media;

        let use_video = video_decoder.is_some() && demuxer.video_stream_index().is_some();
        let use_audio =
            audio_decoder.is_some() && demuxer.audio_stream_index().is_some() && !self.audio_outputs.is_empty();
        if !use_video && !use_audio {
            warn!("{} ⚠ 没有可播放的流（音频需要至少一个音频输出）", log_ctx());
            inner.media = Some(Media {
                demuxer,
                video_decoder,
                audio_decoder,
            });
            return Err(PlayerError::NoStreams);
        }

        let clock = inner.clock.clone();
        clock.reset();
        if clock.is_clock_auto() {
            let clock_type = if use_audio { ClockType::Audio } else { ClockType::External };
            info!("{} 🕐 自动选择时钟: {:?}", log_ctx(), clock_type);
            clock.set_clock_type(clock_type);
        }
        clock.set_initial_value(info.start_time as f64 / 1000.0);

        if demuxer.is_seekable() {
            if let Err(e) = demuxer.seek(info.start_time, SeekType::Accurate) {
                warn!("{} ⚠ 回到起点失败: {}", log_ctx(), e);
            }
        }
        {
            let mut stats = self.stats.write();
            *stats = Statistics::from_media_info(&info);
            stats.audio.available = use_audio;
            stats.video.available = use_video;
        }

        let (thread_tx, thread_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();

        let active_video = if use_video { video_decoder.take() } else { None };
        let video = match active_video {
            Some(mut decoder) => {
                decoder.flush();
                let packets = Arc::new(PacketBuffer::with_config("video", config.video_buffer));
                let shared = Arc::new(ThreadShared::new(
                    StreamKind::Video,
                    packets,
                    clock.clone(),
                    thread_tx.clone(),
                    self.stats.clone(),
                    config.sync,
                    config.pts_history,
                ));
                let mut state = VideoState::new(decoder, self.video_outputs.clone());
                state.set_frame_rate(inner.force_fps);
                Some(Arc::new(video_thread::spawn(shared, state)?))
            }
            None => None,
        };
        let active_audio = if use_audio { audio_decoder.take() } else { None };
        let audio = match active_audio {
            Some(mut decoder) => {
                decoder.flush();
                let packets = Arc::new(PacketBuffer::with_config("audio", config.audio_buffer));
                let shared = Arc::new(ThreadShared::new(
                    StreamKind::Audio,
                    packets,
                    clock.clone(),
                    thread_tx.clone(),
                    self.stats.clone(),
                    config.sync,
                    config.pts_history,
                ));
                let state = AudioState::new(decoder, self.audio_outputs.clone(), info.sample_rate, info.channels);
                Some(Arc::new(audio_thread::spawn(shared, state)?))
            }
            None => None,
        };
        drop(thread_tx);

        let demux = DemuxerThread::start(
            demuxer,
            DemuxSetup {
                clock: clock.clone(),
                video: video.clone(),
                audio: audio.clone(),
                thread_events: thread_rx,
                player_events: event_tx,
                sync: config.sync,
                audio_buffer_value: config.audio_buffer.value,
                end_action: inner.end_action,
                step_timeout: Duration::from_millis(config.step_timeout_ms),
                stop_timeout: config.stop_timeout(),
                time_offset_ms: inner.time_offset(),
            },
        )?;
        clock.start();

        inner.session = Some(Session {
            demux,
            video,
            audio,
            spare_video: video_decoder,
            spare_audio: audio_decoder,
            events: event_rx,
            generation: inner.generation,
        });
        Self::apply_frame_rate(inner);
        if inner.repeat_current < 0 {
            inner.repeat_current = 0;
        }
        inner.seeking = false;
        inner.was_stepping = false;
        inner.update_norms();
        self.set_state(inner, PlaybackState::Playing);

        let media_start = inner.media_start_position();
        if inner.start_norm > media_start {
            let start = inner.start_norm;
            self.set_position(inner, start);
        }
        Ok(())
    }

    fn apply_frame_rate(inner: &Inner) {
        let Some(session) = inner.session.as_ref() else {
            return;
        };
        let Some(video) = session.video.as_ref() else {
            return;
        };
        let fps = inner.force_fps;
        if fps > 0.0 && session.audio.is_none() {
            inner.clock.set_clock_type(ClockType::Video);
        } else if inner.clock.is_clock_auto() {
            let clock_type = if session.audio.is_some() { ClockType::Audio } else { ClockType::External };
            inner.clock.set_clock_type(clock_type);
        }
        debug!("{} 🎞 视频帧率: {}", log_ctx(), fps);
        video.set_frame_rate(fps);
    }

    fn set_position(&self, inner: &mut Inner, position: i64) {
        let Some(session) = inner.session.as_ref() else {
            return;
        };
        let mut pos = position.max(inner.start_norm);
        if let Some(stop) = inner.stop_norm {
            pos = pos.min(stop);
        }
        let media_start = inner.media_start_position();
        let absolute = if inner.relative { pos.max(0) + inner.time_offset() } else { pos.max(media_start) };
        session.demux.seek(absolute, Some(absolute), inner.seek_type);
        inner.seeking = true;
        self.emit(PlayerEvent::PositionChanged(pos));
    }

    fn pause(&self, paused: bool) {
        let mut inner = self.inner.lock();
        if inner.session.is_none() {
            return;
        }
        let is_paused = inner.state == PlaybackState::Paused;
        if is_paused == paused {
            return;
        }
        if !paused && std::mem::take(&mut inner.was_stepping) {
            // 单步后恢复：回到稍早的位置重新开始，让音频时钟重新对齐
            let pos = self.position(&inner) - RESUME_AFTER_STEP_MS;
            self.set_position(&mut inner, pos);
        }
        let Some(session) = inner.session.as_ref() else {
            return;
        };
        session.demux.pause(paused);
        if let Some(audio) = session.audio.as_ref() {
            audio.pause(paused);
        }
        if let Some(video) = session.video.as_ref() {
            video.pause(paused);
        }
        inner.clock.pause(paused);
        info!("{} {} ", log_ctx(), if paused { "⏸ 暂停" } else { "▶ 继续" });
        self.set_state(&mut inner, if paused { PlaybackState::Paused } else { PlaybackState::Playing });
    }

    /// 停止当前会话（调用方持有 ops 锁）
    fn stop_locked(&self) {
        let session = {
            let mut inner = self.inner.lock();
            inner.play_after_load = false;
            inner.seeking = false;
            inner.was_stepping = false;
            inner.repeat_current = -1;
            inner.session.take()
        };
        let Some(session) = session else {
            return;
        };
        info!("{} ⏹️  停止播放", log_ctx());
        self.teardown(session);
        let mut inner = self.inner.lock();
        self.set_state(&mut inner, PlaybackState::Stopped);
        info!("{} ✅ 停止播放完成，所有线程已清理", log_ctx());
    }

    /// 停止会话线程并把数据源/解码器放回，便于不重新加载就再次播放
    fn teardown(&self, session: Session) {
        let timeout = self.config.read().stop_timeout();
        let generation = session.generation;
        let media = session.shutdown(timeout);
        let mut inner = self.inner.lock();
        inner.clock.reset();
        if generation != inner.generation {
            return;
        }
        match media {
            Some(media) => inner.media = Some(media),
            None => warn!("{} ⚠ 未能取回数据源/解码器，下次播放将重新加载", log_ctx()),
        }
    }

    /// 解复用线程结束：按重复设置重新播放或停止
    fn on_demux_finished(&self) {
        let _ops = self.ops.lock();
        let (session, again) = {
            let mut inner = self.inner.lock();
            let Some(session) = inner.session.take() else {
                return;
            };
            let stalled = inner.status == MediaStatus::Stalled;
            let done = inner.repeat_current < 0 || (inner.repeat_current >= inner.repeat_max && inner.repeat_max >= 0);
            inner.seeking = false;
            info!(
                "{} 📄 解复用线程结束. repeat: {}/{}",
                log_ctx(),
                inner.repeat_current,
                inner.repeat_max
            );
            let shutting_down = self.shutdown.load(Ordering::Acquire);
            (session, !stalled && !done && !shutting_down)
        };
        self.teardown(session);
        let mut inner = self.inner.lock();
        if again {
            inner.repeat_current += 1;
            info!("{} 🔁 重新播放 ({}/{})", log_ctx(), inner.repeat_current, inner.repeat_max);
            if let Err(e) = self.start_session(&mut inner) {
                error!("{} ❌ 重新播放失败: {}", log_ctx(), e);
                inner.repeat_current = -1;
                self.set_state(&mut inner, PlaybackState::Stopped);
            }
        } else {
            inner.repeat_current = -1;
            self.set_state(&mut inner, PlaybackState::Stopped);
        }
    }

    /// 转发会话事件，同时维护播放器状态
    fn on_session_event(&self, event: PlayerEvent) {
        let mut finished = false;
        {
            let mut inner = self.inner.lock();
            match event {
                PlayerEvent::SeekFinished(pos) => {
                    inner.seeking = false;
                    self.emit(PlayerEvent::SeekFinished(pos));
                    self.emit(PlayerEvent::PositionChanged(pos));
                    return;
                }
                PlayerEvent::MediaStatusChanged(status) => {
                    self.set_status(&mut inner, status);
                    match status {
                        MediaStatus::EndOfMedia => {
                            let end_paused = inner.session.as_ref().is_some_and(|s| s.demux.is_end_paused());
                            if end_paused {
                                self.set_state(&mut inner, PlaybackState::Paused);
                            } else {
                                finished = true;
                            }
                        }
                        MediaStatus::Stalled => finished = true,
                        _ => {}
                    }
                }
                other => self.emit(other),
            }
        }
        if finished {
            self.on_demux_finished();
        }
    }

    /// 定时通知：上报位置，处理 A-B 重复
    fn tick(&self, last_emitted: &mut Option<i64>) {
        let mut stop = false;
        let mut demux_finished = None;
        {
            let mut inner = self.inner.lock();
            let Some(session) = inner.session.as_ref() else {
                *last_emitted = None;
                return;
            };
            if session.demux.is_finished() {
                demux_finished = Some(session.events.clone());
            } else {
                if inner.seeking && !session.demux.has_seek_tasks() && inner.clock.sync_id() == 0 {
                    inner.seeking = false;
                }
                let t = self.position(&inner);
                let media_start = inner.media_start_position();
                let media_stop = inner.media_stop_position();
                let mut emit_pos = !inner.seeking;
                match inner.stop_norm {
                    None => {}
                    Some(stop_norm) => {
                        if t < inner.start_norm && inner.start_norm != media_start && !inner.seeking {
                            let start = inner.start_norm;
                            self.set_position(&mut inner, start);
                            emit_pos = false;
                        } else if t > stop_norm && Some(stop_norm) != media_stop {
                            // A-B 区间到达终点
                            emit_pos = false;
                            if inner.repeat_max >= 0 && inner.repeat_current >= inner.repeat_max {
                                info!("{} ⏹ 到达停止位置 {}，不再重复", log_ctx(), stop_norm);
                                stop = true;
                            } else if !inner.seeking {
                                inner.repeat_current += 1;
                                let start = inner.start_norm;
                                debug!("{} 🔁 A-B 重复 {}/{}", log_ctx(), inner.repeat_current, inner.repeat_max);
                                self.set_position(&mut inner, start);
                            }
                        }
                    }
                }
                if emit_pos && *last_emitted != Some(t) {
                    *last_emitted = Some(t);
                    self.emit(PlayerEvent::PositionChanged(t));
                }
            }
        }
        if let Some(pending) = demux_finished {
            // 线程退出前发出的事件先处理，保证状态（Stalled 等）正确
            for event in pending.try_iter() {
                self.on_session_event(event);
            }
            self.on_demux_finished();
        } else if stop {
            let _ops = self.ops.lock();
            self.stop_locked();
        }
    }

    fn notify_loop(self: Arc<Self>, load_rx: Receiver<LoadResult>) {
        info!("{} 🔔 通知线程启动", log_ctx());
        let mut last_tick = Instant::now();
        let mut last_emitted = None;
        while !self.shutdown.load(Ordering::Acquire) {
            let interval = self.config.read().notify_interval();
            let session_rx = self.inner.lock().session.as_ref().map(|s| s.events.clone());
            let session_rx = session_rx.unwrap_or_else(never);
            let wait = interval.saturating_sub(last_tick.elapsed()).min(NOTIFY_POLL);
            select! {
                recv(load_rx) -> result => {
                    if let Ok(result) = result {
                        let _ops = self.ops.lock();
                        if let Err(e) = self.finish_load(result) {
                            debug!("{} 后台加载结果: {}", log_ctx(), e);
                        }
                    }
                }
                recv(session_rx) -> event => {
                    if let Ok(event) = event {
                        self.on_session_event(event);
                    }
                }
                default(wait) => {}
            }
            if last_tick.elapsed() >= interval {
                last_tick = Instant::now();
                self.tick(&mut last_emitted);
            }
        }
        info!("{} 🔕 通知线程退出", log_ctx());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PixelFormat;
    use crate::player::loader::SyntheticLoader;
    use crate::player::output::RecordingSink;

    fn test_config() -> PlayerConfig {
        PlayerConfig {
            async_load: false,
            notify_interval_ms: 50,
            stop_timeout_ms: 2000,
            ..PlayerConfig::default()
        }
    }

    fn player_with(config: PlayerConfig) -> (PlaybackManager, Arc<parking_lot::Mutex<Vec<f64>>>) {
        let player = PlaybackManager::new(config, Arc::new(SyntheticLoader::new())).unwrap();
        let sink = RecordingSink::new("record", PixelFormat::RGBA);
        let frames = sink.timestamps();
        player.add_video_sink(Box::new(sink));
        (player, frames)
    }

    fn wait_event(events: &Receiver<PlayerEvent>, timeout: Duration, pred: impl Fn(&PlayerEvent) -> bool) -> Option<PlayerEvent> {
        let deadline = Instant::now() + timeout;
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match events.recv_timeout(left) {
                Ok(ev) if pred(&ev) => return Some(ev),
                Ok(_) => {}
                Err(_) => return None,
            }
        }
        None
    }

    fn is_stopped(ev: &PlayerEvent) -> bool {
        *ev == PlayerEvent::StateChanged(PlaybackState::Stopped)
    }

    #[test]
    fn negative_positions_count_from_end() {
        assert_eq!(normalize_position(-1000, 0, Some(10_000)), 9000);
        assert_eq!(normalize_position(-20_000, 0, Some(10_000)), 0);
        assert_eq!(normalize_position(-1000, 0, None), 0);
    }

    #[test]
    fn positions_are_clamped_to_media_range() {
        assert_eq!(normalize_position(15_000, 0, Some(10_000)), 10_000);
        assert_eq!(normalize_position(500, 1000, Some(11_000)), 1000);
        assert_eq!(normalize_position(MEDIA_END, 1000, None), MEDIA_END);
        assert_eq!(normalize_position(3000, 1000, Some(11_000)), 3000);
    }

    #[test]
    fn undrained_events_stay_bounded() {
        let (player, _) = player_with(test_config());
        let events = player.events();
        for i in 0..(EVENT_QUEUE_CAPACITY as i32 * 4) {
            player.set_repeat(i);
        }
        assert_eq!(events.len(), EVENT_QUEUE_CAPACITY);
        assert_eq!(events.try_recv().unwrap(), PlayerEvent::RepeatChanged(0));
        while events.try_recv().is_ok() {}
        player.set_repeat(3);
        assert_eq!(events.try_recv().unwrap(), PlayerEvent::RepeatChanged(3));
    }

    #[test]
    fn plays_to_end_and_replays_without_reload() {
        let (player, frames) = player_with(test_config());
        let events = player.events();
        player.load("synthetic://short?fps=10&duration=0.5&audio=0").unwrap();
        assert_eq!(player.media_status(), MediaStatus::Loaded);
        player.play().unwrap();
        assert!(player.is_playing());
        assert!(wait_event(&events, Duration::from_secs(5), is_stopped).is_some());
        assert_eq!(player.media_status(), MediaStatus::EndOfMedia);
        assert_eq!(player.current_repeat(), -1);
        let last = frames.lock().last().copied().unwrap();
        assert!((last - 0.4).abs() < 1e-6, "last frame {last}");

        player.play().unwrap();
        assert!(player.is_playing());
        player.stop();
        player.stop();
        assert_eq!(player.state(), PlaybackState::Stopped);
        assert!(!player.is_playing());
    }

    #[test]
    fn seek_delivers_frames_from_target() {
        let (player, frames) = player_with(test_config());
        let events = player.events();
        player.load("synthetic://seek?fps=25&duration=10").unwrap();
        player.play().unwrap();
        thread::sleep(Duration::from_millis(300));
        player.seek(5000);
        let finished = wait_event(&events, Duration::from_secs(5), |ev| matches!(ev, PlayerEvent::SeekFinished(_)));
        match finished {
            Some(PlayerEvent::SeekFinished(pos)) => assert!(pos >= 4950, "seek finished at {pos}"),
            other => panic!("no seek finished event: {other:?}"),
        }
        // 时钟从目标位置重新开始，而不是接着 seek 前的位置走
        let position = player.position();
        assert!((4900..5600).contains(&position), "position after seek {position}");
        thread::sleep(Duration::from_millis(100));
        let frames = frames.lock().clone();
        let first = frames.iter().position(|t| *t >= 4.95).unwrap();
        assert!(frames[first] < 5.1);
        // 旧队列被清空：seek 之后不会再出现目标之前的帧
        assert!(frames[first..].iter().all(|t| *t >= 4.95));
        player.stop();
    }

    #[test]
    fn repeat_restarts_from_beginning() {
        let (player, frames) = player_with(test_config());
        let events = player.events();
        player.set_repeat(1);
        player.load("synthetic://repeat?fps=10&duration=0.5&audio=0").unwrap();
        player.play().unwrap();
        assert!(wait_event(&events, Duration::from_secs(8), is_stopped).is_some());
        let starts = frames.lock().iter().filter(|t| **t == 0.0).count();
        assert_eq!(starts, 2);
        assert_eq!(player.current_repeat(), -1);
    }

    #[test]
    fn load_failure_reports_invalid_media() {
        let (player, _) = player_with(test_config());
        let events = player.events();
        assert!(player.load("file:///missing.mkv").is_err());
        assert_eq!(player.media_status(), MediaStatus::InvalidMedia);
        assert!(wait_event(&events, Duration::from_secs(1), |ev| matches!(ev, PlayerEvent::LoadFailed(_))).is_some());
        assert!(player.play().is_err());
    }

    #[test]
    fn async_load_starts_playback_when_ready() {
        let config = PlayerConfig {
            async_load: true,
            ..test_config()
        };
        let (player, _) = player_with(config);
        let events = player.events();
        player.load("synthetic://async?fps=10&duration=2&audio=0").unwrap();
        player.play().unwrap();
        let playing = wait_event(&events, Duration::from_secs(5), |ev| {
            *ev == PlayerEvent::StateChanged(PlaybackState::Playing)
        });
        assert!(playing.is_some());
        assert!(player.is_loaded());
        assert_eq!(player.duration(), 2000);
        player.stop();
    }

    #[test]
    fn pause_freezes_position() {
        let (player, _) = player_with(test_config());
        player.load("synthetic://pause?fps=25&duration=5&audio=0").unwrap();
        player.play().unwrap();
        thread::sleep(Duration::from_millis(300));
        player.pause(true);
        assert_eq!(player.state(), PlaybackState::Paused);
        let before = player.position();
        thread::sleep(Duration::from_millis(300));
        assert!((player.position() - before).abs() <= 5);
        player.toggle_pause();
        assert_eq!(player.state(), PlaybackState::Playing);
        player.stop();
    }

    #[test]
    fn step_backward_after_end_pause() {
        let config = PlayerConfig {
            media_end_action: MediaEndAction::Pause,
            ..test_config()
        };
        let (player, frames) = player_with(config);
        let events = player.events();
        player.load("synthetic://end?fps=2&gop=2&duration=10.25&audio=0").unwrap();
        player.play().unwrap();
        player.seek(9000);
        let end = wait_event(&events, Duration::from_secs(8), |ev| {
            *ev == PlayerEvent::MediaStatusChanged(MediaStatus::EndOfMedia)
        });
        assert!(end.is_some());
        let last = frames.lock().last().copied().unwrap();
        assert!((last - 10.0).abs() < 1e-6, "last frame {last}");
        assert!(player.is_playing());

        assert!(player.is_paused());
        let delivered_before = frames.lock().len();

        player.step_backward();
        assert!(wait_event(&events, Duration::from_secs(3), |ev| *ev == PlayerEvent::StepFinished).is_some());
        thread::sleep(Duration::from_millis(300));
        let stepped = frames.lock()[delivered_before..].to_vec();
        assert_eq!(stepped.len(), 1, "frames after step: {stepped:?}");
        assert!((stepped[0] - 9.5).abs() < 1e-6, "stepped to {}", stepped[0]);
        assert!(player.is_paused());
        assert_eq!(player.state(), PlaybackState::Paused);
        player.stop();
    }
}
