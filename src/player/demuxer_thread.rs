// 解复用线程
//
// 读包并分发到音视频队列（带背压），处理 seek 任务槽、单步、EOF 与静音补齐。
// 解码线程通过 ThreadEvent 通道回报 seek/单步结果，本线程转换成 PlayerEvent。

use crate::core::{
    log_ctx, ClockType, MediaEndAction, MediaStatus, Packet, PlaybackClock, PlayerError, PlayerEvent, Result, SeekType,
    StreamKind, SyncConfig,
};
use crate::player::audio_thread::AudioThread;
use crate::player::decode_thread::{StepMode, ThreadEvent};
use crate::player::demuxer_source::{DemuxerSource, MediaPacket};
use crate::player::packet_buffer::{EmptyCallback, PacketBuffer};
use crate::player::video_thread::VideoThread;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// 暂停时等待事件/唤醒的时长
const PAUSE_WAIT: Duration = Duration::from_millis(100);
/// 到达末尾后等待解码线程消费的轮询间隔
const END_WAIT: Duration = Duration::from_millis(100);
/// 队列满时单次入队等待，超时后处理事件再重试
const PUT_WAIT: Duration = Duration::from_millis(20);
/// 回退单步扫描时往前 seek 的距离（毫秒）
const STEP_BACK_SCAN_MS: i64 = 500;
/// 缓冲进度变化小于该值时不上报
const PROGRESS_STEP: f64 = 0.01;

/// 缓冲进度是否值得再次上报（last 为 NaN 表示本轮缓冲还没有上报过）
fn progress_changed(last: f64, now: f64) -> bool {
    last.is_nan() || (now - last).abs() >= PROGRESS_STEP || (now >= 1.0 && last < 1.0)
}

/// seek 类任务，放在容量为 1 的任务槽中
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DemuxTask {
    Seek {
        /// 绝对位置（毫秒）
        pos: i64,
        /// 同时写入外部时钟的值（毫秒）
        external_pos: Option<i64>,
        seek_type: SeekType,
    },
    /// 回退到 pts；负值表示需要在码流中往回扫描
    StepBackward { pts: f64 },
}

/// 容量为 1 的任务槽：新任务替换尚未执行的任务
#[derive(Debug, Default)]
pub struct TaskSlot {
    pending: Mutex<Option<DemuxTask>>,
}

impl TaskSlot {
    /// 放入任务，返回被替换掉的旧任务
    pub fn put(&self, task: DemuxTask) -> Option<DemuxTask> {
        self.pending.lock().replace(task)
    }

    pub fn take(&self) -> Option<DemuxTask> {
        self.pending.lock().take()
    }

    pub fn clear(&self) {
        self.pending.lock().take();
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_none()
    }
}

/// 音频比视频先结束时生成补齐的静音包
///
/// last_vpts / last_apts 为最后读到的视频/音频包 pts，last_adur 为最后一个音频包的时长。
pub fn silence_filler(last_vpts: f64, last_apts: f64, last_adur: f64, sync: &SyncConfig) -> Option<Packet> {
    // 静音从音频结束处开始，到最后一个视频包为止
    let audio_end = last_apts + last_adur.max(0.0);
    let gap = last_vpts - audio_end;
    if gap <= sync.av_gap_threshold {
        return None;
    }
    Some(Packet::silence(audio_end, gap.min(sync.max_silence)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stepping {
    Forward,
    Backward { deadline: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeekScope {
    All,
    /// 回退单步：只有视频线程参与
    VideoStep,
}

#[derive(Debug)]
struct Control {
    /// 读包循环是否挂起
    paused: bool,
    /// 用户请求的暂停（单步/seek 结束后恢复到该状态）
    user_paused: bool,
    /// 读包循环结束标志
    end: bool,
    end_action: MediaEndAction,
    end_paused: bool,
    stepping: Option<Stepping>,
    saved_clock: Option<(ClockType, bool)>,
    running_task: bool,
    last_seek_pos: i64,
}

/// 启动解复用线程所需的上下文
pub struct DemuxSetup {
    pub clock: PlaybackClock,
    pub video: Option<Arc<VideoThread>>,
    pub audio: Option<Arc<AudioThread>>,
    pub thread_events: Receiver<ThreadEvent>,
    pub player_events: Sender<PlayerEvent>,
    pub sync: SyncConfig,
    /// 音频队列的正常缓冲值（主缓冲为视频时使用）
    pub audio_buffer_value: i64,
    pub end_action: MediaEndAction,
    pub step_timeout: Duration,
    pub stop_timeout: Duration,
    /// 相对时间模式下的偏移（毫秒），上报位置时减去
    pub time_offset_ms: i64,
}

/// 解复用线程与控制方共享的状态
pub struct DemuxShared {
    clock: PlaybackClock,
    video: Option<Arc<VideoThread>>,
    audio: Option<Arc<AudioThread>>,
    player_events: Sender<PlayerEvent>,
    sync: SyncConfig,
    step_timeout: Duration,
    stop_timeout: Duration,
    time_offset_ms: i64,
    primary: StreamKind,
    control: Mutex<Control>,
    tasks: TaskSlot,
    stop: AtomicBool,
    at_end: AtomicBool,
    buffering: AtomicBool,
    last_progress: Mutex<f64>,
    wake_tx: Sender<()>,
}

impl DemuxShared {
    fn queue(&self, kind: StreamKind) -> Option<&PacketBuffer> {
        match kind {
            StreamKind::Audio => self.audio.as_ref().map(|t| &**t.packets()),
            StreamKind::Video => self.video.as_ref().map(|t| &**t.packets()),
        }
    }

    fn primary_buffer(&self) -> Option<&PacketBuffer> {
        self.queue(self.primary)
    }

    fn emit(&self, event: PlayerEvent) {
        if self.player_events.send(event).is_err() {
            debug!("{} 播放器事件接收端已关闭", log_ctx());
        }
    }

    fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    fn is_paused(&self) -> bool {
        self.control.lock().paused
    }

    fn is_end(&self) -> bool {
        self.control.lock().end
    }

    fn to_position_ms(&self, pts: f64) -> i64 {
        (pts * 1000.0) as i64 - self.time_offset_ms
    }

    /// 主缓冲的 buffering 状态变化时上报
    fn update_buffer_state(&self) {
        let Some(buffer) = self.primary_buffer() else {
            return;
        };
        let was = self.buffering.load(Ordering::Acquire);
        if was {
            self.emit_progress(buffer.buffer_progress());
        }
        let now = buffer.is_buffering();
        if was == now {
            return;
        }
        self.buffering.store(now, Ordering::Release);
        debug!("{} 📶 {} 缓冲状态: {}", log_ctx(), buffer.name(), if now { "buffering" } else { "buffered" });
        self.emit(PlayerEvent::MediaStatusChanged(if now {
            MediaStatus::Buffering
        } else {
            MediaStatus::Buffered
        }));
        if now {
            self.emit_progress(buffer.buffer_progress());
        } else {
            *self.last_progress.lock() = f64::NAN;
        }
    }

    fn emit_progress(&self, progress: f64) {
        {
            let mut last = self.last_progress.lock();
            if !progress_changed(*last, progress) {
                return;
            }
            *last = progress;
        }
        self.emit(PlayerEvent::BufferProgressChanged(progress));
    }

    /// 解码线程发现队列为空：立即检测 buffering，并解除两个队列的满阻塞
    fn on_queue_empty(&self) {
        if self.is_end() || self.at_end.load(Ordering::Acquire) {
            return;
        }
        self.update_buffer_state();
        for kind in [StreamKind::Video, StreamKind::Audio] {
            if let Some(queue) = self.queue(kind) {
                queue.block_full(false);
            }
        }
    }

    fn restore_clock(&self, control: &mut Control) {
        if let Some((clock_type, auto)) = control.saved_clock.take() {
            self.clock.set_clock_auto(auto);
            self.clock.set_clock_type(clock_type);
        }
    }

    /// 单步交付了一帧（或回退单步扫描失败）：恢复暂停和时钟
    fn finish_step(&self, pts: f64) {
        let mut control = self.control.lock();
        let stepping = control.stepping.take();
        if control.user_paused {
            control.paused = true;
        }
        self.restore_clock(&mut control);
        self.clock.update_value(pts);
        self.clock.update_external_clock((pts * 1000.0) as i64);
        control.last_seek_pos = (pts * 1000.0) as i64;
        drop(control);
        info!("{} 👣 单步完成 {:?} @{:.3}", log_ctx(), stepping, pts);
        self.emit(PlayerEvent::StepFinished);
    }

    /// 单步过程中视频解码到 EOF
    fn eof_on_step(&self) {
        let mut control = self.control.lock();
        match control.stepping {
            Some(Stepping::Forward) => {
                control.stepping = None;
                control.user_paused = false;
                control.paused = false;
                control.end = true;
                self.restore_clock(&mut control);
            }
            Some(Stepping::Backward { .. }) => {
                control.stepping = None;
                if control.user_paused {
                    control.paused = true;
                }
            }
            None => return,
        }
        drop(control);
        info!("{} 📄 单步时到达末尾", log_ctx());
        self.emit(PlayerEvent::StepFinished);
    }

    fn restore_user_pause(&self) {
        let mut control = self.control.lock();
        if control.user_paused {
            control.paused = true;
            debug!("{} ⏸ 暂停中的 seek 已完成，恢复暂停", log_ctx());
        }
    }
}

/// 解复用线程句柄
pub struct DemuxerThread {
    shared: Arc<DemuxShared>,
    handle: Option<JoinHandle<Box<dyn DemuxerSource>>>,
}

impl DemuxerThread {
    /// 启动解复用线程。线程退出时返回数据源，便于重新播放
    pub fn start(source: Box<dyn DemuxerSource>, setup: DemuxSetup) -> Result<Self> {
        let has_pic = source.has_attached_picture();
        let primary = match (&setup.video, &setup.audio) {
            (None, None) => return Err(PlayerError::NoStreams),
            (Some(_), Some(_)) if has_pic => StreamKind::Audio,
            (None, Some(_)) => StreamKind::Audio,
            (Some(_), _) => StreamKind::Video,
        };
        let (wake_tx, wake_rx) = bounded(1);
        let shared = Arc::new(DemuxShared {
            clock: setup.clock,
            video: setup.video,
            audio: setup.audio,
            player_events: setup.player_events,
            sync: setup.sync,
            step_timeout: setup.step_timeout,
            stop_timeout: setup.stop_timeout,
            time_offset_ms: setup.time_offset_ms,
            primary,
            control: Mutex::new(Control {
                paused: false,
                user_paused: false,
                end: false,
                end_action: setup.end_action,
                end_paused: false,
                stepping: None,
                saved_clock: None,
                running_task: false,
                last_seek_pos: 0,
            }),
            tasks: TaskSlot::default(),
            stop: AtomicBool::new(false),
            at_end: AtomicBool::new(false),
            buffering: AtomicBool::new(false),
            last_progress: Mutex::new(f64::NAN),
            wake_tx,
        });

        for kind in [StreamKind::Audio, StreamKind::Video] {
            if let Some(queue) = shared.queue(kind) {
                let weak: Weak<DemuxShared> = Arc::downgrade(&shared);
                let callback: EmptyCallback = Arc::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.on_queue_empty();
                    }
                });
                queue.clear();
                queue.set_blocking(true);
                queue.set_empty_callback(Some(callback));
            }
        }

        let mut demux_loop = DemuxLoop {
            shared: shared.clone(),
            source,
            events: setup.thread_events,
            wake: wake_rx,
            audio_buffer_value: setup.audio_buffer_value,
            has_pic,
            last_apts: 0.0,
            last_adur: 0.0,
            last_vpts: 0.0,
            was_end: false,
            stalled: false,
            fence_waiting: Vec::new(),
            resume_pause_after_seek: false,
        };
        let handle = thread::Builder::new()
            .name("demux".to_string())
            .spawn(move || demux_loop.run())
            .map_err(|e| PlayerError::ThreadError(format!("无法启动解复用线程: {}", e)))?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// 请求 seek（毫秒，绝对时间）。替换尚未执行的 seek
    pub fn seek(&self, pos: i64, external_pos: Option<i64>, seek_type: SeekType) {
        {
            let mut control = self.shared.control.lock();
            if !self.shared.stop.load(Ordering::Acquire) {
                control.end = false;
            }
        }
        // 队列可能阻塞了 put，先清空
        for kind in [StreamKind::Audio, StreamKind::Video] {
            if let Some(queue) = self.shared.queue(kind) {
                queue.clear();
            }
        }
        if let Some(old) = self.shared.tasks.put(DemuxTask::Seek {
            pos,
            external_pos,
            seek_type,
        }) {
            debug!("{} 🗑 丢弃未执行的任务 {:?}", log_ctx(), old);
        }
        info!("{} ⏩ 请求 seek 到 {}ms ({:?})", log_ctx(), pos, seek_type);
        self.shared.wake();
    }

    /// 是否有未完成的 seek / 单步
    pub fn has_seek_tasks(&self) -> bool {
        let mut control = self.shared.control.lock();
        if let Some(Stepping::Backward { deadline }) = control.stepping {
            if Instant::now() > deadline {
                debug!("{} ⏱ 回退单步超时，不再等待", log_ctx());
                control.stepping = None;
            }
        }
        !self.shared.tasks.is_empty() || control.running_task || control.stepping.is_some()
    }

    /// 暂停状态下前进一帧
    pub fn step_forward(&self) {
        let Some(video) = self.shared.video.as_ref() else {
            warn!("{} ⚠ 没有视频流，无法单步", log_ctx());
            return;
        };
        if self.is_end() || self.has_seek_tasks() {
            return;
        }
        let clock = &self.shared.clock;
        let mut control = self.shared.control.lock();
        control.stepping = Some(Stepping::Forward);
        control.user_paused = true;
        if control.saved_clock.is_none() {
            control.saved_clock = Some((clock.clock_type(), clock.is_clock_auto()));
        }
        clock.set_clock_type(ClockType::Video);
        video.set_step_mode(StepMode::StepOnce);
        video.packets().block_full(false);
        control.paused = false;
        drop(control);
        info!("{} 👣 前进单步", log_ctx());
        self.shared.wake();
    }

    /// 回退到解码历史中的上一帧
    pub fn step_backward(&self) {
        let Some(video) = self.shared.video.as_ref() else {
            warn!("{} ⚠ 没有视频流，无法单步", log_ctx());
            return;
        };
        if self.has_seek_tasks() {
            return;
        }
        let pre_pts = video.previous_history_pts();
        if pre_pts == 0.0 {
            debug!("{} 没有可回退的帧", log_ctx());
            return;
        }
        {
            let mut control = self.shared.control.lock();
            if !self.shared.stop.load(Ordering::Acquire) {
                control.end = false;
            }
            control.user_paused = true;
            control.paused = true;
        }
        if let Some(audio) = self.shared.audio.as_ref() {
            audio.packets().clear();
        }
        video.packets().clear();
        self.shared.tasks.put(DemuxTask::StepBackward { pts: pre_pts });
        info!("{} 👣 回退单步 -> {:.3}", log_ctx(), pre_pts);
        self.shared.wake();
    }

    pub fn pause(&self, paused: bool) {
        let mut control = self.shared.control.lock();
        control.user_paused = paused;
        if control.paused == paused {
            return;
        }
        control.paused = paused;
        if !paused {
            control.end_paused = false;
            drop(control);
            self.shared.wake();
        }
    }

    /// 读包循环是否挂起
    pub fn is_paused(&self) -> bool {
        self.shared.is_paused()
    }

    pub fn is_user_paused(&self) -> bool {
        self.shared.control.lock().user_paused
    }

    pub fn is_end(&self) -> bool {
        self.shared.is_end()
    }

    /// 媒体结束时按 MediaEndAction::Pause 停在了末尾
    pub fn is_end_paused(&self) -> bool {
        self.shared.control.lock().end_paused
    }

    pub fn is_stepping(&self) -> bool {
        self.shared.control.lock().stepping.is_some()
    }

    /// 最近一次 seek/单步的位置（毫秒，绝对时间）
    pub fn last_seek_pos(&self) -> i64 {
        self.shared.control.lock().last_seek_pos
    }

    pub fn set_media_end_action(&self, action: MediaEndAction) {
        self.shared.control.lock().end_action = action;
    }

    pub fn media_end_action(&self) -> MediaEndAction {
        self.shared.control.lock().end_action
    }

    pub fn primary_stream(&self) -> StreamKind {
        self.shared.primary
    }

    pub fn is_buffering(&self) -> bool {
        self.shared.buffering.load(Ordering::Acquire)
    }

    pub fn buffer_progress(&self) -> f64 {
        self.shared.primary_buffer().map_or(0.0, |b| b.buffer_progress())
    }

    pub fn buffered(&self) -> i64 {
        self.shared.primary_buffer().map_or(0, |b| b.buffered())
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// 请求停止：停止解码线程并让读包循环退出
    pub fn stop(&self) {
        info!("{} 🛑 DemuxerThread::stop() called", log_ctx());
        self.shared.stop.store(true, Ordering::Release);
        self.shared.tasks.clear();
        for kind in [StreamKind::Audio, StreamKind::Video] {
            if let Some(queue) = self.shared.queue(kind) {
                queue.clear();
                queue.block_full(false);
            }
        }
        if let Some(audio) = self.shared.audio.as_ref() {
            audio.stop();
        }
        if let Some(video) = self.shared.video.as_ref() {
            video.stop();
        }
        {
            let mut control = self.shared.control.lock();
            control.end = true;
            control.paused = false;
            control.user_paused = false;
        }
        self.shared.wake();
    }

    /// 停止并等待线程退出，超时后放弃（线程被分离）
    pub fn join_timeout(mut self, timeout: Duration) -> Option<Box<dyn DemuxerSource>> {
        self.stop();
        let handle = self.handle.take()?;
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                error!("{} ⏱ 解复用线程在 {:?} 内未退出，放弃等待", log_ctx(), timeout);
                return None;
            }
            self.shared.wake();
            thread::sleep(Duration::from_millis(5));
        }
        match handle.join() {
            Ok(source) => Some(source),
            Err(_) => {
                error!("{} ❌ 解复用线程 panic", log_ctx());
                None
            }
        }
    }
}

impl Drop for DemuxerThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                warn!("{} ⚠ DemuxerThread 被 drop，但可能未调用 stop()，发送停止请求", log_ctx());
                self.stop();
            }
        }
    }
}

/// 读包循环的局部状态（只在解复用线程中访问）
struct DemuxLoop {
    shared: Arc<DemuxShared>,
    source: Box<dyn DemuxerSource>,
    events: Receiver<ThreadEvent>,
    wake: Receiver<()>,
    audio_buffer_value: i64,
    has_pic: bool,
    last_apts: f64,
    last_adur: f64,
    last_vpts: f64,
    was_end: bool,
    stalled: bool,
    /// 尚未关闭本次 seek 栅栏的线程
    fence_waiting: Vec<StreamKind>,
    resume_pause_after_seek: bool,
}

impl DemuxLoop {
    fn run(mut self) -> Box<dyn DemuxerSource> {
        info!("{} 🎬 Demuxer 线程启动: {}", log_ctx(), self.source.description());
        let mut packet_count: u64 = 0;

        while !self.shared.is_end() {
            self.process_events();
            self.process_next_task();

            if self.source.at_end() {
                self.shared.at_end.store(true, Ordering::Release);
                if self.handle_end() {
                    break;
                }
                continue;
            }
            self.shared.at_end.store(false, Ordering::Release);
            self.was_end = false;

            if self.try_pause() {
                continue;
            }
            self.shared.update_buffer_state();

            match self.source.read_packet() {
                Ok(Some(media_packet)) => {
                    packet_count += 1;
                    self.route(media_packet);
                }
                Ok(None) => continue,
                Err(PlayerError::Stalled(msg)) => {
                    error!("{} ❌ 数据源停滞: {}", log_ctx(), msg);
                    self.stalled = true;
                    break;
                }
                Err(e) => {
                    debug!("读取包失败: {}", e);
                    continue;
                }
            }
        }

        self.shared.buffering.store(false, Ordering::Release);
        self.finish_decode_threads();

        if self.stalled {
            self.shared.emit(PlayerEvent::MediaStatusChanged(MediaStatus::Stalled));
        } else if !self.shared.stop.load(Ordering::Acquire) {
            self.shared.emit(PlayerEvent::MediaStatusChanged(MediaStatus::EndOfMedia));
        }
        info!("{} 🛑 Demuxer 线程退出（共读取 {} 个包）", log_ctx(), packet_count);
        self.source
    }

    fn route(&mut self, media_packet: MediaPacket) {
        let Some(kind) = self.source.stream_kind(media_packet.stream_index) else {
            return;
        };
        let pkt = media_packet.packet;
        match kind {
            StreamKind::Audio => {
                self.last_apts = pkt.pts;
                self.last_adur = pkt.duration;
                let Some(audio) = self.shared.audio.clone() else {
                    return;
                };
                let aqueue = audio.packets();
                if audio.is_finished() {
                    aqueue.clear();
                    return;
                }
                if self.shared.primary != StreamKind::Audio {
                    let primary_buffering = self.shared.primary_buffer().is_some_and(|b| b.is_buffering());
                    aqueue.set_buffer_value(if primary_buffering { i64::MAX } else { self.audio_buffer_value });
                }
                // 没有视频时总是满阻塞；封面图只有一帧
                let video_gone = self.shared.video.as_ref().map_or(true, |v| v.is_finished());
                aqueue.block_full(video_gone || self.has_pic);
                self.put_packet(StreamKind::Audio, pkt);
            }
            StreamKind::Video => {
                let Some(video) = self.shared.video.clone() else {
                    return;
                };
                let vqueue = video.packets();
                if video.is_finished() {
                    vqueue.clear();
                    return;
                }
                let audio_ready = self
                    .shared
                    .audio
                    .as_ref()
                    .map_or(true, |a| a.is_finished() || a.packets().is_enough());
                vqueue.block_full(audio_ready);
                let pts = pkt.pts;
                if self.put_packet(StreamKind::Video, pkt) {
                    self.last_vpts = pts;
                }
            }
        }
    }

    /// 入队；队列满时继续处理事件，有新的 seek 或停止时放弃该包
    fn put_packet(&mut self, kind: StreamKind, mut pkt: Packet) -> bool {
        loop {
            let Some(queue) = self.shared.queue(kind) else {
                return false;
            };
            match queue.put_timeout(pkt, PUT_WAIT) {
                Ok(()) => return true,
                Err(back) => pkt = back,
            }
            self.process_events();
            if self.shared.is_end() || !self.shared.tasks.is_empty() {
                return false;
            }
        }
    }

    /// 返回 true 表示读包循环应当退出
    fn handle_end(&mut self) -> bool {
        if !self.was_end {
            if self.shared.audio.is_some() {
                if let Some(silence) = silence_filler(self.last_vpts, self.last_apts, self.last_adur, &self.shared.sync) {
                    info!(
                        "{} 🔇 音频先结束 (v={:.3} a={:.3})，补 {:.3}s 静音",
                        log_ctx(),
                        self.last_vpts,
                        self.last_apts,
                        silence.duration
                    );
                    self.put_packet(StreamKind::Audio, silence);
                }
                self.last_apts = 0.0;
                self.last_vpts = 0.0;
                self.put_packet(StreamKind::Audio, Packet::eof());
            }
            if self.shared.video.is_some() {
                self.put_packet(StreamKind::Video, Packet::eof());
            }
            if self.shared.buffering.swap(false, Ordering::AcqRel) {
                self.shared.emit(PlayerEvent::MediaStatusChanged(MediaStatus::Buffered));
            }
            self.was_end = true;
            info!("{} 📄 Demuxer 到达文件末尾，等待解码线程消费", log_ctx());
        }

        let queues_empty = [StreamKind::Audio, StreamKind::Video]
            .into_iter()
            .filter_map(|kind| self.shared.queue(kind))
            .all(|q| q.is_empty());
        let mut control = self.shared.control.lock();
        if !control.user_paused && queues_empty {
            match control.end_action {
                MediaEndAction::Default => return true,
                MediaEndAction::Pause => {
                    control.user_paused = true;
                    control.paused = true;
                    control.end_paused = true;
                    drop(control);
                    info!("{} ⏸ 媒体结束，停在末尾", log_ctx());
                    self.shared.clock.pause(true);
                    if let Some(audio) = self.shared.audio.as_ref() {
                        audio.pause(true);
                    }
                    if let Some(video) = self.shared.video.as_ref() {
                        video.pause(true);
                    }
                    self.shared.emit(PlayerEvent::MediaStatusChanged(MediaStatus::EndOfMedia));
                }
            }
        } else {
            drop(control);
        }
        self.wait_events(END_WAIT);
        false
    }

    fn try_pause(&mut self) -> bool {
        if !self.shared.is_paused() {
            return false;
        }
        self.wait_events(PAUSE_WAIT);
        true
    }

    /// 等待解码线程事件或外部唤醒
    fn wait_events(&mut self, timeout: Duration) {
        let event = select! {
            recv(self.events) -> ev => match ev {
                Ok(ev) => Some(ev),
                Err(_) => {
                    thread::sleep(timeout);
                    None
                }
            },
            recv(self.wake) -> _ => None,
            default(timeout) => None,
        };
        if let Some(event) = event {
            self.handle_event(event);
        }
        self.process_events();
    }

    fn process_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: ThreadEvent) {
        match event {
            ThreadEvent::SeekFinished { kind, pts } => {
                if kind == self.shared.primary {
                    self.shared.emit(PlayerEvent::SeekFinished(self.shared.to_position_ms(pts)));
                }
                if let Some(i) = self.fence_waiting.iter().position(|k| *k == kind) {
                    self.fence_waiting.remove(i);
                    if self.fence_waiting.is_empty() && self.resume_pause_after_seek {
                        self.resume_pause_after_seek = false;
                        self.shared.restore_user_pause();
                    }
                }
            }
            ThreadEvent::StepFrameDelivered { pts, .. } => self.shared.finish_step(pts),
            ThreadEvent::EofDecoded(StreamKind::Video) => self.shared.eof_on_step(),
            ThreadEvent::EofDecoded(StreamKind::Audio) => {}
            ThreadEvent::Finished(kind) => debug!("{} {} 解码线程已结束", log_ctx(), kind.as_str()),
        }
    }

    fn process_next_task(&mut self) {
        let Some(task) = self.shared.tasks.take() else {
            return;
        };
        self.shared.control.lock().running_task = true;
        self.process_events();
        match task {
            DemuxTask::Seek {
                pos,
                external_pos,
                seek_type,
            } => {
                for kind in [StreamKind::Audio, StreamKind::Video] {
                    if let Some(queue) = self.shared.queue(kind) {
                        queue.clear();
                    }
                }
                if let Some(video) = self.shared.video.as_ref() {
                    video.set_drop_frame_on_seek(true);
                }
                self.seek_internal(pos, seek_type, external_pos, SeekScope::All);
            }
            DemuxTask::StepBackward { pts } => self.step_backward_task(pts),
        }
        self.shared.control.lock().running_task = false;
    }

    fn step_backward_task(&mut self, pts: f64) {
        let Some(video) = self.shared.video.clone() else {
            return;
        };
        self.shared.control.lock().stepping = Some(Stepping::Backward {
            deadline: Instant::now() + self.shared.step_timeout,
        });
        video.packets().clear();
        let target = if pts > 0.0 {
            pts
        } else {
            match self.scan_previous_video_pts(-pts) {
                Some(t) => t,
                None => {
                    warn!("{} ⚠ 找不到 {:.3} 之前的视频帧", log_ctx(), -pts);
                    self.shared.finish_step(-pts);
                    return;
                }
            }
        };
        debug!("{} step backward: {}ms", log_ctx(), (target * 1000.0) as i64);
        video.set_drop_frame_on_seek(false);
        self.seek_internal((target * 1000.0) as i64, SeekType::Accurate, None, SeekScope::VideoStep);
    }

    /// 往前 seek 一段，扫描视频包找到 current 之前的那一帧，目标取两帧之间偏前的位置
    fn scan_previous_video_pts(&mut self, current: f64) -> Option<f64> {
        let video_index = self.source.video_stream_index()?;
        let from = ((current * 1000.0) as i64 - STEP_BACK_SCAN_MS).max(0);
        if let Err(e) = self.source.seek(from, SeekType::Accurate) {
            warn!("{} ⚠ 回退扫描 seek 失败: {}", log_ctx(), e);
            return None;
        }
        let mut ts = Vec::new();
        loop {
            match self.source.read_packet() {
                Ok(Some(mp)) if mp.stream_index == video_index => {
                    let t = mp.packet.pts;
                    ts.push(t);
                    if t >= current {
                        break;
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        let t0 = ts.pop()?;
        let prev = *ts.last()?;
        Some(prev - (t0 - prev) / 2.0)
    }

    fn seek_internal(&mut self, pos: i64, seek_type: SeekType, external_pos: Option<i64>, scope: SeekScope) {
        info!("{} ⏩ seek 到 {}ms ({:?}, {:?})", log_ctx(), pos, seek_type, scope);
        if let Err(e) = self.source.seek(pos, seek_type) {
            error!("{} ❌ Seek 失败: {}", log_ctx(), e);
            self.shared.control.lock().stepping = None;
            return;
        }
        self.was_end = false;
        self.shared.at_end.store(self.source.at_end(), Ordering::Release);

        let shared = self.shared.clone();
        let audio = match scope {
            SeekScope::All => shared.audio.as_ref().filter(|t| !t.is_finished()),
            SeekScope::VideoStep => None,
        };
        let video = shared.video.as_ref().filter(|t| !t.is_finished());
        let video_joins = video.is_some() && (scope == SeekScope::VideoStep || !self.has_pic);

        let mut participants = Vec::new();
        if audio.is_some() {
            participants.push(StreamKind::Audio);
        }
        if video_joins {
            participants.push(StreamKind::Video);
        }
        let clock = &shared.clock;
        let sync_id = clock.sync_start(participants.len() as u32);
        let target = pos as f64 / 1000.0;
        if let Some(ext) = external_pos {
            clock.update_external_clock(ext.max(0));
        }
        clock.update_value(target);

        if let Some(audio) = audio {
            audio.packets().clear();
            audio.request_seek();
            put_sentinel(audio.packets(), Packet::seek_sentinel(target, sync_id));
        }
        if let Some(video) = video {
            video.packets().clear();
            video.request_seek();
            let id = if video_joins { sync_id } else { 0 };
            put_sentinel(video.packets(), Packet::seek_sentinel(target, id));
        }

        let mut control = shared.control.lock();
        control.last_seek_pos = pos;
        self.fence_waiting = participants;
        self.resume_pause_after_seek = false;
        match scope {
            SeekScope::VideoStep => {
                if let Some(video) = video {
                    video.set_step_mode(StepMode::StepOnce);
                }
                control.paused = false;
            }
            SeekScope::All if control.paused => {
                // 暂停中 seek：参与线程越过栅栏后重新挂起
                if let Some(audio) = audio {
                    audio.set_step_mode(StepMode::Continuous);
                }
                if let Some(video) = video.filter(|_| video_joins) {
                    video.set_step_mode(StepMode::Continuous);
                }
                control.paused = false;
                self.resume_pause_after_seek = !self.fence_waiting.is_empty();
            }
            SeekScope::All => {}
        }
    }

    /// 发送 Quit 包并等待解码线程退出
    fn finish_decode_threads(&mut self) {
        let deadline = Instant::now() + self.shared.stop_timeout;
        if let Some(audio) = self.shared.audio.as_ref() {
            audio.packets().block_full(false);
            audio.packets().put(Packet::quit());
            audio.pause(false);
        }
        if let Some(video) = self.shared.video.as_ref() {
            video.packets().block_full(false);
            video.packets().put(Packet::quit());
            video.pause(false);
        }
        let finished = |shared: &DemuxShared| {
            shared.audio.as_ref().map_or(true, |t| t.is_finished())
                && shared.video.as_ref().map_or(true, |t| t.is_finished())
        };
        while !finished(&self.shared) {
            if Instant::now() >= deadline {
                error!("{} ⏱ 解码线程在 {:?} 内未退出", log_ctx(), self.shared.stop_timeout);
                return;
            }
            self.process_events();
            thread::sleep(Duration::from_millis(10));
        }
    }
}

/// 放入 seek 哨兵：临时关闭满队列阻塞，保证缓冲值很小的队列也能放入
fn put_sentinel(queue: &PacketBuffer, sentinel: Packet) {
    let block_full = queue.is_blocking_full();
    queue.block_full(false);
    queue.put(sentinel);
    queue.block_full(block_full);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_fills_audio_gap_before_eof() {
        let sync = SyncConfig::default();
        let pkt = silence_filler(10.0, 9.7, 0.0, &sync).unwrap();
        assert!(pkt.is_media());
        assert!((pkt.duration - 0.3).abs() < 1e-6);
        assert!((pkt.pts - 9.7).abs() < 1e-9);
    }

    #[test]
    fn silence_ends_at_last_video_pts() {
        let sync = SyncConfig::default();
        let pkt = silence_filler(10.0, 9.6, 0.1, &sync).unwrap();
        assert!((pkt.pts - 9.7).abs() < 1e-9);
        assert!((pkt.duration - 0.3).abs() < 1e-9);
        assert!((pkt.pts + pkt.duration - 10.0).abs() < 1e-9);

        let pkt = silence_filler(0.96, 0.6, 0.1, &sync).unwrap();
        assert!((pkt.pts + pkt.duration - 0.96).abs() < 1e-9);
        // 音频包本身已经覆盖到视频末尾附近
        assert!(silence_filler(10.0, 9.85, 0.1, &sync).is_none());
    }

    #[test]
    fn small_gap_needs_no_silence() {
        let sync = SyncConfig::default();
        assert!(silence_filler(10.0, 9.95, 0.02, &sync).is_none());
        assert!(silence_filler(9.0, 9.5, 0.02, &sync).is_none());
    }

    #[test]
    fn silence_is_bounded() {
        let sync = SyncConfig::default();
        let pkt = silence_filler(100.0, 1.0, 0.1, &sync).unwrap();
        assert_eq!(pkt.duration, sync.max_silence);
        assert!((pkt.pts - 1.1).abs() < 1e-9);
    }

    #[test]
    fn buffer_progress_is_reported_on_change_only() {
        assert!(progress_changed(f64::NAN, 0.0));
        assert!(!progress_changed(0.25, 0.25));
        assert!(!progress_changed(0.25, 0.255));
        assert!(progress_changed(0.25, 0.26));
        assert!(progress_changed(0.995, 1.0));
        assert!(!progress_changed(1.0, 1.0));
    }

    fn video_pipeline(url: &str) -> (DemuxerThread, Arc<VideoThread>, PlaybackClock) {
        use crate::core::{BufferConfig, PixelFormat, Statistics};
        use crate::player::decode_thread::ThreadShared;
        use crate::player::decoder::RawVideoDecoder;
        use crate::player::output::OutputSet;
        use crate::player::synthetic::SyntheticSource;
        use crate::player::video_thread::{self, VideoState};
        use crossbeam_channel::unbounded;
        use parking_lot::RwLock;

        let source = SyntheticSource::from_url(url).unwrap();
        let (width, height) = (source.config().width, source.config().height);
        let clock = PlaybackClock::new();
        clock.set_clock_type(ClockType::External);
        let (thread_tx, thread_rx) = unbounded();
        let (player_tx, _player_rx) = unbounded();
        let shared = Arc::new(ThreadShared::new(
            StreamKind::Video,
            Arc::new(PacketBuffer::with_config("video", BufferConfig::default())),
            clock.clone(),
            thread_tx,
            Arc::new(RwLock::new(Statistics::default())),
            SyncConfig::default(),
            30,
        ));
        let decoder = Box::new(RawVideoDecoder::new(width, height, PixelFormat::RGBA));
        let video = Arc::new(video_thread::spawn(shared, VideoState::new(decoder, Arc::new(OutputSet::new()))).unwrap());
        // 解码线程挂起，队列内容只由解复用线程决定
        video.pause(true);
        let demux = DemuxerThread::start(
            Box::new(source),
            DemuxSetup {
                clock: clock.clone(),
                video: Some(video.clone()),
                audio: None,
                thread_events: thread_rx,
                player_events: player_tx,
                sync: SyncConfig::default(),
                audio_buffer_value: 2000,
                end_action: MediaEndAction::Default,
                step_timeout: Duration::from_millis(200),
                stop_timeout: Duration::from_secs(2),
                time_offset_ms: 0,
            },
        )
        .unwrap();
        clock.start();
        (demux, video, clock)
    }

    #[test]
    fn seek_flushes_queue_and_resets_external_clock() {
        let (demux, video, clock) = video_pipeline("synthetic://flush?fps=25&gop=12&duration=20&audio=0");
        let deadline = Instant::now() + Duration::from_secs(2);
        while video.packets().len() < 10 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(video.packets().len() >= 10);

        demux.seek(10_000, Some(10_000), SeekType::Accurate);
        let deadline = Instant::now() + Duration::from_secs(2);
        while demux.has_seek_tasks() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!demux.has_seek_tasks());
        assert!((clock.value() - 10.0).abs() < 0.2, "clock at {}", clock.value());
        assert_eq!(demux.last_seek_pos(), 10_000);

        let first = video.packets().take_timeout(Duration::from_millis(100)).unwrap();
        assert!(matches!(first.kind, crate::core::PacketKind::Seek { .. }), "first packet {:?}", first.kind);
        assert!((first.pts - 10.0).abs() < 1e-9);
        // 关键帧 9.6 之前的旧包都已被清掉
        while let Some(pkt) = video.packets().take_timeout(Duration::from_millis(20)) {
            if pkt.is_media() {
                assert!(pkt.pts >= 9.6 - 1e-9, "stale packet {}", pkt.pts);
            }
        }
        demux.stop();
        drop(video);
        assert!(demux.join_timeout(Duration::from_secs(3)).is_some());
    }

    #[test]
    fn task_slot_keeps_only_latest() {
        let slot = TaskSlot::default();
        assert!(slot.is_empty());
        let first = DemuxTask::Seek {
            pos: 1000,
            external_pos: None,
            seek_type: SeekType::Accurate,
        };
        let second = DemuxTask::Seek {
            pos: 5000,
            external_pos: Some(5000),
            seek_type: SeekType::KeyFrame,
        };
        assert_eq!(slot.put(first), None);
        assert_eq!(slot.put(second), Some(first));
        assert_eq!(slot.take(), Some(second));
        assert!(slot.take().is_none());
    }

    #[test]
    fn sentinel_bypasses_full_queue() {
        let queue = PacketBuffer::new("sentinel");
        queue.set_buffer_mode(crate::core::BufferMode::Packets);
        queue.set_buffer_value(1);
        queue.set_buffer_max(1.0);
        queue.put(Packet::new(bytes::Bytes::from_static(&[1]), 0.0, 0.0, 0.04, true));
        assert!(queue.check_full());
        put_sentinel(&queue, Packet::seek_sentinel(1.0, 3));
        assert_eq!(queue.len(), 2);
        assert!(queue.is_blocking_full());
        assert!(queue.is_blocking_empty());
    }

    #[test]
    fn sentinel_keeps_queue_blocking_state() {
        let queue = PacketBuffer::new("unblocked");
        queue.set_blocking(false);
        put_sentinel(&queue, Packet::seek_sentinel(1.0, 3));
        assert!(!queue.is_blocking_full());
        assert!(!queue.is_blocking_empty());

        queue.block_empty(true);
        put_sentinel(&queue, Packet::seek_sentinel(2.0, 4));
        assert!(!queue.is_blocking_full());
        assert!(queue.is_blocking_empty());
        assert_eq!(queue.len(), 2);
    }
}
