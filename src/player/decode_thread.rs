// 解码线程公共部分
//
// 音频/视频解码线程共享：任务队列、暂停/单步、seek 请求、PTS 历史、
// 可中断等待、有超时的 join。具体的解码循环在 audio_thread / video_thread 中。

use crate::core::{log_ctx, ClockType, MediaFrame, PlaybackClock, PlayerError, Result, SharedStatistics, StreamKind, SyncConfig};
use crate::player::decoder::Decoder;
use crate::player::output::OutputSet;
use crate::player::packet_buffer::PacketBuffer;
use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// 暂停时的轮询间隔（期间继续处理任务）
const PAUSE_WAIT: Duration = Duration::from_millis(100);

/// 单步模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// 遵守暂停标志
    None,
    /// 暂停状态下交付一帧，然后重新挂起
    StepOnce,
    /// 暂停状态下继续运行，直到本线程关闭自己的 seek 栅栏
    Continuous,
}

/// 解码线程发往解复用线程的通知
#[derive(Debug, Clone, PartialEq)]
pub enum ThreadEvent {
    /// 单步模式下交付了一帧
    StepFrameDelivered { kind: StreamKind, pts: f64 },
    /// 解码到 EOF
    EofDecoded(StreamKind),
    /// seek 后的第一帧已交付（或遇到 EOF）
    SeekFinished { kind: StreamKind, pts: f64 },
    /// 线程退出
    Finished(StreamKind),
}

/// 解码帧的 PTS 历史（环形）
#[derive(Debug, Clone)]
pub struct PtsHistory {
    entries: VecDeque<(f64, Instant)>,
    capacity: usize,
}

impl PtsHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(2),
        }
    }

    pub fn push(&mut self, pts: f64) {
        self.push_at(pts, Instant::now());
    }

    pub fn push_at(&mut self, pts: f64, at: Instant) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((pts, at));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<f64> {
        self.entries.back().map(|(pts, _)| *pts)
    }

    /// 回退单步的目标：
    /// - 空历史返回 0
    /// - 只有一个条目时返回它的相反数
    /// - 否则返回最近一个严格小于最后一帧的 pts，找不到时返回最早条目的相反数
    ///
    /// 负值表示调用方需要自己在码流中往回找。
    pub fn previous(&self) -> f64 {
        let Some(&(current, _)) = self.entries.back() else {
            return 0.0;
        };
        if self.entries.len() == 1 {
            return -current;
        }
        self.entries
            .iter()
            .rev()
            .skip(1)
            .map(|(pts, _)| *pts)
            .find(|pts| *pts < current)
            .unwrap_or_else(|| -self.entries.front().map(|(pts, _)| *pts).unwrap_or(0.0))
    }

    /// 实测解码帧率
    pub fn frame_rate(&self) -> f64 {
        let (Some((_, first)), Some((_, last))) = (self.entries.front(), self.entries.back()) else {
            return 0.0;
        };
        let span = last.duration_since(*first).as_secs_f64();
        if self.entries.len() < 2 || span <= 0.0 {
            return 0.0;
        }
        (self.entries.len() - 1) as f64 / span
    }
}

/// 调度到解码线程执行的任务，在两个包之间执行
pub type Task<S> = Box<dyn FnOnce(&mut S) + Send>;

#[derive(Debug)]
struct RunState {
    paused: bool,
    step: StepMode,
}

/// 解码线程与控制方共享的状态
pub struct ThreadShared<S> {
    kind: StreamKind,
    stop: AtomicBool,
    seek_requested: AtomicBool,
    drop_frame_on_seek: AtomicBool,
    run: Mutex<RunState>,
    run_cond: Condvar,
    tasks: Mutex<Vec<Task<S>>>,
    history: Mutex<PtsHistory>,
    packets: Arc<PacketBuffer>,
    clock: PlaybackClock,
    events: Sender<ThreadEvent>,
    stats: SharedStatistics,
    sync: SyncConfig,
}

impl<S> ThreadShared<S> {
    pub fn new(
        kind: StreamKind,
        packets: Arc<PacketBuffer>,
        clock: PlaybackClock,
        events: Sender<ThreadEvent>,
        stats: SharedStatistics,
        sync: SyncConfig,
        history: usize,
    ) -> Self {
        Self {
            kind,
            stop: AtomicBool::new(false),
            seek_requested: AtomicBool::new(false),
            drop_frame_on_seek: AtomicBool::new(true),
            run: Mutex::new(RunState {
                paused: false,
                step: StepMode::None,
            }),
            run_cond: Condvar::new(),
            tasks: Mutex::new(Vec::new()),
            history: Mutex::new(PtsHistory::new(history)),
            packets,
            clock,
            events,
            stats,
            sync,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn packets(&self) -> &PacketBuffer {
        &self.packets
    }

    pub fn clock(&self) -> &PlaybackClock {
        &self.clock
    }

    pub fn stats(&self) -> &SharedStatistics {
        &self.stats
    }

    pub fn sync(&self) -> &SyncConfig {
        &self.sync
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// 取走 seek 请求标志
    pub fn take_seek_request(&self) -> bool {
        self.seek_requested.swap(false, Ordering::AcqRel)
    }

    pub fn seek_requested(&self) -> bool {
        self.seek_requested.load(Ordering::Acquire)
    }

    /// 执行所有待处理任务
    pub fn process_tasks(&self, state: &mut S) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task(state);
        }
    }

    /// 暂停（且不在单步模式）时挂起一段时间，返回是否挂起过
    pub fn try_pause(&self) -> bool {
        let mut run = self.run.lock();
        if !run.paused || run.step != StepMode::None || self.is_stopped() {
            return false;
        }
        self.run_cond.wait_for(&mut run, PAUSE_WAIT);
        true
    }

    pub fn step_mode(&self) -> StepMode {
        self.run.lock().step
    }

    /// 记录解码得到的帧 pts
    pub fn record_decoded(&self, pts: f64) {
        self.history.lock().push(pts);
    }

    pub fn decode_frame_rate(&self) -> f64 {
        self.history.lock().frame_rate()
    }

    pub fn last_decoded(&self) -> Option<f64> {
        self.history.lock().last()
    }

    /// seek 期间是否允许解码器丢弃非参考帧
    pub fn drop_frame_on_seek(&self) -> bool {
        self.drop_frame_on_seek.load(Ordering::Acquire)
    }

    /// 一帧已交付：单步模式下重新挂起并通知
    pub fn frame_delivered(&self, pts: f64) {
        let mut run = self.run.lock();
        if run.step == StepMode::StepOnce {
            run.step = StepMode::None;
            run.paused = true;
            drop(run);
            debug!("{} 👣 {} 单步交付 pts={:.3}", log_ctx(), self.kind.as_str(), pts);
            self.send(ThreadEvent::StepFrameDelivered { kind: self.kind, pts });
        }
    }

    /// 本线程的 seek 栅栏已关闭
    pub fn seek_settled(&self, pts: f64) {
        {
            let mut run = self.run.lock();
            if run.step == StepMode::Continuous {
                run.step = StepMode::None;
            }
        }
        self.send(ThreadEvent::SeekFinished { kind: self.kind, pts });
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    pub fn send(&self, event: ThreadEvent) {
        if self.events.send(event).is_err() {
            debug!("{} {} 事件接收端已关闭", log_ctx(), self.kind.as_str());
        }
    }

    /// 可中断等待 seconds 秒，按 wait_slice 切片；期间处理任务并响应暂停。
    ///
    /// pts > 0 且时钟不是视频时钟时，每个切片根据时钟重新计算剩余时间。
    /// 被 stop 或 seek 打断时返回 false。
    pub fn wait_and_check(&self, state: &mut S, seconds: f64, pts: f64) -> bool {
        if seconds <= 0.0 {
            return true;
        }
        let slice = self.sync.wait_slice().as_secs_f64();
        let recompute = pts > 0.0 && self.clock.clock_type() != ClockType::Video;
        let speed = self.clock.speed();
        let mut remaining = if recompute { seconds } else { seconds / speed };
        while remaining > 0.0 {
            if self.is_stopped() || self.seek_requested() {
                return false;
            }
            self.process_tasks(state);
            if self.try_pause() {
                continue;
            }
            let step = remaining.min(slice);
            thread::sleep(Duration::from_secs_f64(step));
            if recompute {
                // 外部时钟已经包含了速度
                remaining = (pts - self.clock.value()).min(remaining - step);
            } else {
                remaining -= step;
            }
        }
        !(self.is_stopped() || self.seek_requested())
    }
}

/// 解码线程状态中可以被替换的解码器/输出集合
pub trait DecoderSlot: Send + 'static {
    type Frame: MediaFrame;

    fn replace_decoder(&mut self, decoder: Box<dyn Decoder<Self::Frame>>);

    fn replace_outputs(&mut self, outputs: Arc<OutputSet<Self::Frame>>);
}

/// 解码线程句柄
///
/// 线程退出时返回其状态（包含解码器），便于 stop 后重新播放。
pub struct DecodeThread<S: Send + 'static> {
    shared: Arc<ThreadShared<S>>,
    handle: Option<JoinHandle<S>>,
}

impl<S: Send + 'static> DecodeThread<S> {
    /// 启动线程，run 为具体的解码循环
    pub fn spawn<L>(shared: Arc<ThreadShared<S>>, state: S, run: L) -> Result<Self>
    where
        L: FnOnce(&ThreadShared<S>, S) -> S + Send + 'static,
    {
        let kind = shared.kind;
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-decode", kind.as_str()))
            .spawn(move || {
                info!("{} 🎬 {} 解码线程启动", log_ctx(), kind.as_str());
                let state = run(&thread_shared, state);
                thread_shared.send(ThreadEvent::Finished(kind));
                info!("{} 🛑 {} 解码线程退出", log_ctx(), kind.as_str());
                state
            })
            .map_err(|e| PlayerError::ThreadError(format!("无法启动 {} 解码线程: {}", kind.as_str(), e)))?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    pub fn kind(&self) -> StreamKind {
        self.shared.kind
    }

    pub fn packets(&self) -> &Arc<PacketBuffer> {
        &self.shared.packets
    }

    pub fn pause(&self, paused: bool) {
        let mut run = self.shared.run.lock();
        run.paused = paused;
        if !paused {
            run.step = StepMode::None;
        }
        drop(run);
        self.shared.run_cond.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.run.lock().paused
    }

    pub fn set_step_mode(&self, step: StepMode) {
        self.shared.run.lock().step = step;
        self.shared.run_cond.notify_all();
    }

    pub fn step_mode(&self) -> StepMode {
        self.shared.step_mode()
    }

    /// 请求停止：置停止标志并解除队列阻塞
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.packets.set_blocking(false);
        self.shared.run_cond.notify_all();
    }

    /// 通知线程丢弃手上的包并等待 seek 哨兵
    pub fn request_seek(&self) {
        self.shared.seek_requested.store(true, Ordering::Release);
    }

    pub fn set_drop_frame_on_seek(&self, drop: bool) {
        self.shared.drop_frame_on_seek.store(drop, Ordering::Release);
    }

    pub fn schedule_task(&self, task: Task<S>) {
        self.shared.tasks.lock().push(task);
        self.shared.run_cond.notify_all();
    }

    pub fn previous_history_pts(&self) -> f64 {
        self.shared.history.lock().previous()
    }

    pub fn last_history_pts(&self) -> Option<f64> {
        self.shared.history.lock().last()
    }

    pub fn decode_frame_rate(&self) -> f64 {
        self.shared.decode_frame_rate()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// 停止并等待线程退出，超时后放弃（线程被分离）
    pub fn join_timeout(mut self, timeout: Duration) -> Option<S> {
        self.stop();
        let handle = self.handle.take()?;
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                error!("{} ⏱ {} 解码线程在 {:?} 内未退出，放弃等待", log_ctx(), self.kind().as_str(), timeout);
                return None;
            }
            self.shared.packets.set_blocking(false);
            self.shared.run_cond.notify_all();
            thread::sleep(Duration::from_millis(5));
        }
        match handle.join() {
            Ok(state) => Some(state),
            Err(_) => {
                error!("{} ❌ {} 解码线程 panic", log_ctx(), self.kind().as_str());
                None
            }
        }
    }
}

impl<S: DecoderSlot> DecodeThread<S> {
    /// 替换解码器（在下一个任务检查点生效）
    pub fn set_decoder(&self, decoder: Box<dyn Decoder<S::Frame>>) {
        self.schedule_task(Box::new(move |state: &mut S| state.replace_decoder(decoder)));
    }

    /// 替换输出集合（在下一个任务检查点生效）
    pub fn set_output(&self, outputs: Arc<OutputSet<S::Frame>>) {
        self.schedule_task(Box::new(move |state: &mut S| state.replace_outputs(outputs)));
    }
}

impl<S: Send + 'static> Drop for DecodeThread<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                warn!("{} ⚠ {} 解码线程被 drop，发送停止请求", log_ctx(), self.shared.kind.as_str());
            }
            self.shared.stop.store(true, Ordering::Release);
            self.shared.packets.set_blocking(false);
            self.shared.run_cond.notify_all();
        }
    }
}

/// 解码出错包的去重保护：同一块负载连续两次解不出帧就丢弃
#[derive(Debug, Default)]
pub struct InvalidFrameGuard {
    last: Option<usize>,
}

impl InvalidFrameGuard {
    /// 返回 true 表示应当丢弃该包
    pub fn should_drop(&mut self, data: &[u8]) -> bool {
        let ptr = data.as_ptr() as usize;
        if self.last == Some(ptr) {
            self.last = None;
            true
        } else {
            self.last = Some(ptr);
            false
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Statistics;
    use crossbeam_channel::unbounded;
    use parking_lot::RwLock;

    #[test]
    fn previous_pts_finds_earlier_entry() {
        let mut h = PtsHistory::new(30);
        assert_eq!(h.previous(), 0.0);
        h.push(9.0);
        assert_eq!(h.previous(), -9.0);
        h.push(9.5);
        h.push(10.0);
        assert_eq!(h.previous(), 9.5);
    }

    #[test]
    fn previous_pts_without_smaller_entry_returns_negated_oldest() {
        let mut h = PtsHistory::new(30);
        h.push(3.0);
        h.push(4.0);
        h.push(2.0);
        assert_eq!(h.previous(), -3.0);
    }

    #[test]
    fn history_is_bounded() {
        let mut h = PtsHistory::new(3);
        for i in 0..10 {
            h.push(i as f64);
        }
        assert_eq!(h.len(), 3);
        assert_eq!(h.previous(), 8.0);
    }

    #[test]
    fn frame_rate_from_wall_time() {
        let mut h = PtsHistory::new(30);
        let t0 = Instant::now();
        for i in 0..11 {
            h.push_at(i as f64 * 0.04, t0 + Duration::from_millis(i * 40));
        }
        assert!((h.frame_rate() - 25.0).abs() < 0.01);
    }

    #[test]
    fn invalid_frame_guard_drops_on_repeat() {
        let data = vec![1u8, 2, 3];
        let other = vec![4u8];
        let mut guard = InvalidFrameGuard::default();
        assert!(!guard.should_drop(&data));
        assert!(guard.should_drop(&data));
        assert!(!guard.should_drop(&other));
    }

    fn shared() -> (Arc<ThreadShared<Vec<u32>>>, crossbeam_channel::Receiver<ThreadEvent>) {
        let (tx, rx) = unbounded();
        let shared = Arc::new(ThreadShared::new(
            StreamKind::Video,
            Arc::new(PacketBuffer::new("test")),
            PlaybackClock::new(),
            tx,
            Arc::new(RwLock::new(Statistics::default())),
            SyncConfig::default(),
            30,
        ));
        (shared, rx)
    }

    #[test]
    fn tasks_run_in_thread_and_state_is_returned() {
        let (shared, rx) = shared();
        let thread = DecodeThread::spawn(shared, Vec::new(), |ctx, mut state| {
            while !ctx.is_stopped() {
                ctx.process_tasks(&mut state);
                if !ctx.try_pause() {
                    thread::sleep(Duration::from_millis(5));
                }
            }
            ctx.process_tasks(&mut state);
            state
        })
        .unwrap();
        thread.pause(true);
        thread.schedule_task(Box::new(|s: &mut Vec<u32>| s.push(7)));
        thread::sleep(Duration::from_millis(150));
        let state = thread.join_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(state, vec![7]);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), ThreadEvent::Finished(StreamKind::Video));
    }

    #[test]
    fn step_once_reparks_after_one_frame() {
        let (shared, rx) = shared();
        {
            let mut run = shared.run.lock();
            run.paused = true;
            run.step = StepMode::StepOnce;
        }
        assert!(!shared.try_pause());
        shared.frame_delivered(1.0);
        assert_eq!(shared.step_mode(), StepMode::None);
        assert!(shared.try_pause());
        assert_eq!(
            rx.try_recv().unwrap(),
            ThreadEvent::StepFrameDelivered { kind: StreamKind::Video, pts: 1.0 }
        );
    }

    #[test]
    fn continuous_step_ends_when_seek_settles() {
        let (shared, rx) = shared();
        {
            let mut run = shared.run.lock();
            run.paused = true;
            run.step = StepMode::Continuous;
        }
        shared.frame_delivered(2.0);
        assert_eq!(shared.step_mode(), StepMode::Continuous);
        shared.seek_settled(2.0);
        assert_eq!(shared.step_mode(), StepMode::None);
        assert_eq!(rx.try_recv().unwrap(), ThreadEvent::SeekFinished { kind: StreamKind::Video, pts: 2.0 });
    }

    #[test]
    fn wait_is_interrupted_by_seek() {
        let (shared, _rx) = shared();
        let start = Instant::now();
        let s = shared.clone();
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(60));
            s.seek_requested.store(true, Ordering::Release);
        });
        let mut state = Vec::new();
        assert!(!shared.wait_and_check(&mut state, 5.0, 0.0));
        assert!(start.elapsed() < Duration::from_secs(1));
        waker.join().unwrap();
    }
}
