// 输出集合：把解码帧分发给多个输出端

use crate::core::MediaFrame;
use log::warn;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// 输出端（渲染器、音频设备等）
pub trait FrameSink<F: MediaFrame>: Send {
    fn name(&self) -> &str;

    fn is_supported(&self, format: F::Format) -> bool;

    fn preferred_format(&self) -> F::Format;

    /// 接收一帧，返回是否被接受
    fn receive(&mut self, frame: F) -> bool;

    /// 输出延迟（秒），音频设备用于修正音频时钟
    fn delay(&self) -> f64 {
        0.0
    }
}

pub type OutputId = u64;

/// 被移除的输出端为 None，正在分发的线程仍可能持有它的引用
type SharedSink<F> = Arc<Mutex<Option<Box<dyn FrameSink<F>>>>>;

struct OutputEntry<F: MediaFrame> {
    id: OutputId,
    sink: SharedSink<F>,
    paused: bool,
}

struct OutputsInner<F: MediaFrame> {
    entries: Vec<OutputEntry<F>>,
    next_id: OutputId,
}

impl<F: MediaFrame> OutputsInner<F> {
    fn paused_count(&self) -> usize {
        self.entries.iter().filter(|e| e.paused).count()
    }

    fn snapshot(&self, include_paused: bool) -> Vec<SharedSink<F>> {
        self.entries
            .iter()
            .filter(|e| include_paused || !e.paused)
            .map(|e| e.sink.clone())
            .collect()
    }
}

/// 线程安全的输出集合
///
/// 分发帧时不持有集合锁，输出端可以在 receive 中调用 notify_pause_change、
/// add_output 或 clear_outputs。remove_output 会等待该输出端当前的 receive 结束，
/// 因此不能在被移除的输出端自己的 receive 中调用。
pub struct OutputSet<F: MediaFrame> {
    inner: Mutex<OutputsInner<F>>,
    pause_lock: Mutex<()>,
    pause_cond: Condvar,
}

impl<F: MediaFrame> OutputSet<F> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(OutputsInner {
                entries: Vec::new(),
                next_id: 1,
            }),
            pause_lock: Mutex::new(()),
            pause_cond: Condvar::new(),
        }
    }

    pub fn add_output(&self, sink: Box<dyn FrameSink<F>>) -> OutputId {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push(OutputEntry {
            id,
            sink: Arc::new(Mutex::new(Some(sink))),
            paused: false,
        });
        drop(inner);
        self.resume_thread();
        id
    }

    pub fn remove_output(&self, id: OutputId) -> Option<Box<dyn FrameSink<F>>> {
        let mut inner = self.inner.lock();
        let pos = inner.entries.iter().position(|e| e.id == id)?;
        let entry = inner.entries.remove(pos);
        drop(inner);
        self.resume_thread();
        let sink = entry.sink.lock().take();
        sink
    }

    pub fn clear_outputs(&self) {
        let entries = std::mem::take(&mut self.inner.lock().entries);
        drop(entries);
        self.resume_thread();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 输出端暂停状态变化
    pub fn notify_pause_change(&self, id: OutputId, paused: bool) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.iter_mut().find(|e| e.id == id) else {
            return;
        };
        entry.paused = paused;
        drop(inner);
        if !paused {
            self.resume_thread();
        }
    }

    /// 所有输出端都已暂停，解码线程可以挂起
    pub fn can_pause_thread(&self) -> bool {
        let inner = self.inner.lock();
        !inner.entries.is_empty() && inner.paused_count() == inner.entries.len()
    }

    /// 挂起调用线程，直到 resume_thread 或超时
    pub fn pause_thread(&self, timeout: Duration) {
        let mut guard = self.pause_lock.lock();
        self.pause_cond.wait_for(&mut guard, timeout);
    }

    pub fn resume_thread(&self) {
        let _guard = self.pause_lock.lock();
        self.pause_cond.notify_all();
    }

    /// 分发一帧。不支持原格式的输出端收到转换后的帧，每种目标格式只转换一次。
    /// 返回接受该帧的输出端数量
    pub fn send_frame(&self, frame: &F) -> usize {
        let sinks = self.inner.lock().snapshot(false);
        let source_format = frame.format();
        let mut converted: HashMap<F::Format, Option<F>> = HashMap::new();
        let mut accepted = 0;
        for shared in &sinks {
            let mut slot = shared.lock();
            let Some(sink) = slot.as_mut() else {
                continue;
            };
            let out = if sink.is_supported(source_format) {
                frame.clone()
            } else {
                let target = sink.preferred_format();
                let cached = converted.entry(target).or_insert_with(|| frame.convert(target));
                match cached {
                    Some(f) => f.clone(),
                    None => {
                        warn!("输出端 {} 不支持 {:?}，且无法转换为 {:?}", sink.name(), source_format, target);
                        continue;
                    }
                }
            };
            if sink.receive(out) {
                accepted += 1;
            }
        }
        accepted
    }

    /// 所有输出端中的最大延迟
    pub fn max_delay(&self) -> f64 {
        let sinks = self.inner.lock().snapshot(true);
        sinks
            .iter()
            .filter_map(|shared| shared.lock().as_ref().map(|sink| sink.delay()))
            .fold(0.0, f64::max)
    }
}

impl<F: MediaFrame> Default for OutputSet<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// 丢弃所有帧的输出端
pub struct NullSink<Fmt> {
    format: Fmt,
}

impl<Fmt> NullSink<Fmt> {
    pub fn new(format: Fmt) -> Self {
        Self { format }
    }
}

impl<F: MediaFrame> FrameSink<F> for NullSink<F::Format> {
    fn name(&self) -> &str {
        "null"
    }

    fn is_supported(&self, _format: F::Format) -> bool {
        true
    }

    fn preferred_format(&self) -> F::Format {
        self.format
    }

    fn receive(&mut self, _frame: F) -> bool {
        true
    }
}

/// 记录收到的帧时间戳，用于诊断与测试
pub struct RecordingSink<Fmt> {
    name: String,
    format: Fmt,
    strict: bool,
    delay: f64,
    timestamps: Arc<Mutex<Vec<f64>>>,
}

impl<Fmt: Copy + PartialEq> RecordingSink<Fmt> {
    /// 接受任何格式
    pub fn new(name: impl Into<String>, format: Fmt) -> Self {
        Self {
            name: name.into(),
            format,
            strict: false,
            delay: 0.0,
            timestamps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 只接受 format，其他格式需要转换
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn with_delay(mut self, delay: f64) -> Self {
        self.delay = delay;
        self
    }

    /// 时间戳记录的共享句柄
    pub fn timestamps(&self) -> Arc<Mutex<Vec<f64>>> {
        self.timestamps.clone()
    }
}

impl<F: MediaFrame> FrameSink<F> for RecordingSink<F::Format> {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_supported(&self, format: F::Format) -> bool {
        !self.strict || format == self.format
    }

    fn preferred_format(&self) -> F::Format {
        self.format
    }

    fn receive(&mut self, frame: F) -> bool {
        if self.strict && frame.format() != self.format {
            return false;
        }
        self.timestamps.lock().push(frame.timestamp());
        true
    }

    fn delay(&self) -> f64 {
        self.delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PixelFormat, VideoFrame};
    use bytes::Bytes;
    use std::thread;
    use std::time::Instant;

    fn rgba_frame(ts: f64) -> VideoFrame {
        VideoFrame {
            timestamp: ts,
            duration: 0.04,
            width: 1,
            height: 1,
            format: PixelFormat::RGBA,
            data: Bytes::from_static(&[10, 20, 30, 255]),
        }
    }

    #[test]
    fn broadcasts_and_converts() {
        let set: OutputSet<VideoFrame> = OutputSet::new();
        let any = RecordingSink::new("any", PixelFormat::RGBA);
        let rgb = RecordingSink::new("rgb", PixelFormat::RGB).strict();
        let yuv = RecordingSink::new("yuv", PixelFormat::NV12).strict();
        let (a, b, c) = (any.timestamps(), rgb.timestamps(), yuv.timestamps());
        set.add_output(Box::new(any));
        set.add_output(Box::new(rgb));
        set.add_output(Box::new(yuv));

        assert_eq!(set.send_frame(&rgba_frame(1.0)), 2);
        assert_eq!(*a.lock(), vec![1.0]);
        assert_eq!(*b.lock(), vec![1.0]);
        assert!(c.lock().is_empty());
    }

    #[test]
    fn pause_count_controls_thread_pause() {
        let set: OutputSet<VideoFrame> = OutputSet::new();
        assert!(!set.can_pause_thread());
        let id1 = set.add_output(Box::new(NullSink::new(PixelFormat::RGBA)));
        let id2 = set.add_output(Box::new(NullSink::new(PixelFormat::RGBA)));
        set.notify_pause_change(id1, true);
        assert!(!set.can_pause_thread());
        set.notify_pause_change(id2, true);
        set.notify_pause_change(id2, true);
        assert!(set.can_pause_thread());
        assert_eq!(set.send_frame(&rgba_frame(0.0)), 0);
        set.notify_pause_change(id1, false);
        assert!(!set.can_pause_thread());
        assert!(set.remove_output(id2).is_some());
        assert!(set.remove_output(id2).is_none());
    }

    #[test]
    fn resume_wakes_paused_thread() {
        let set: Arc<OutputSet<VideoFrame>> = Arc::new(OutputSet::new());
        let s = set.clone();
        let start = Instant::now();
        let handle = thread::spawn(move || s.pause_thread(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(50));
        set.resume_thread();
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    /// 在 receive 中修改所属集合的输出端
    struct SelfPausingSink {
        outputs: Arc<OutputSet<VideoFrame>>,
        id: Arc<Mutex<OutputId>>,
        clear_after: usize,
        received: usize,
    }

    impl FrameSink<VideoFrame> for SelfPausingSink {
        fn name(&self) -> &str {
            "self-pausing"
        }

        fn is_supported(&self, _format: PixelFormat) -> bool {
            true
        }

        fn preferred_format(&self) -> PixelFormat {
            PixelFormat::RGBA
        }

        fn receive(&mut self, _frame: VideoFrame) -> bool {
            self.received += 1;
            let id = *self.id.lock();
            self.outputs.notify_pause_change(id, true);
            if self.received >= self.clear_after {
                self.outputs.clear_outputs();
            }
            true
        }
    }

    #[test]
    fn sink_may_change_outputs_while_receiving() {
        let set: Arc<OutputSet<VideoFrame>> = Arc::new(OutputSet::new());
        let id_cell = Arc::new(Mutex::new(0));
        let id = set.add_output(Box::new(SelfPausingSink {
            outputs: set.clone(),
            id: id_cell.clone(),
            clear_after: 2,
            received: 0,
        }));
        *id_cell.lock() = id;
        let other = RecordingSink::new("other", PixelFormat::RGBA);
        let other_ts = other.timestamps();
        set.add_output(Box::new(other));

        let s = set.clone();
        let handle = thread::spawn(move || {
            let first = s.send_frame(&rgba_frame(1.0));
            // 第一个输出端已在 receive 中暂停自己
            let second = s.send_frame(&rgba_frame(2.0));
            s.notify_pause_change(id, false);
            let third = s.send_frame(&rgba_frame(3.0));
            (first, second, third)
        });
        let deadline = Instant::now() + Duration::from_secs(2);
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(handle.is_finished(), "send_frame blocked on a reentrant sink");
        let (first, second, third) = handle.join().unwrap();
        assert_eq!((first, second, third), (2, 1, 2));
        assert_eq!(*other_ts.lock(), vec![1.0, 2.0, 3.0]);
        // 第二次 receive 清空了集合
        assert!(set.is_empty());
        assert_eq!(set.send_frame(&rgba_frame(4.0)), 0);
    }

    #[test]
    fn removed_sink_is_returned() {
        let set: OutputSet<VideoFrame> = OutputSet::new();
        let sink = RecordingSink::new("a", PixelFormat::RGBA);
        let ts = sink.timestamps();
        let id = set.add_output(Box::new(sink));
        let mut removed = set.remove_output(id).unwrap();
        assert_eq!(set.send_frame(&rgba_frame(1.0)), 0);
        assert!(removed.receive(rgba_frame(2.0)));
        assert_eq!(*ts.lock(), vec![2.0]);
    }

    #[test]
    fn max_delay_over_sinks() {
        let set: OutputSet<VideoFrame> = OutputSet::new();
        set.add_output(Box::new(RecordingSink::new("a", PixelFormat::RGBA).with_delay(0.05)));
        set.add_output(Box::new(RecordingSink::new("b", PixelFormat::RGBA).with_delay(0.12)));
        assert_eq!(set.max_delay(), 0.12);
    }
}
