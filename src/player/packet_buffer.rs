// 数据包缓冲队列
//
// 单生产者（解复用线程）/ 单消费者（解码线程）。
// 缓冲量 = upper - lower，单位由 BufferMode 决定。

use crate::core::{BufferConfig, BufferMode, Packet};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 吞吐量历史采样数
const HISTORY_SIZE: usize = 16;
/// 阻塞等待的轮询间隔
const WAIT_STEP: Duration = Duration::from_millis(100);

pub type EmptyCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct BufferSample {
    at: Instant,
    value: i64,   // 累计入队量（按模式）
    bytes: i64,   // 累计入队字节
}

struct BufferState {
    queue: VecDeque<Packet>,
    mode: BufferMode,
    value: i64,
    max: f64,
    lower: i64,
    upper: i64,
    buffering: bool,
    block_empty: bool,
    block_full: bool,
    total_value: i64,
    total_bytes: i64,
    history: VecDeque<BufferSample>,
}

impl BufferState {
    fn buffered(&self) -> i64 {
        self.upper - self.lower
    }

    fn is_full(&self) -> bool {
        self.buffered() as f64 >= self.value as f64 * self.max
    }

    /// 队首第一个媒体包的 pts（毫秒）
    fn front_media_ms(&self) -> Option<i64> {
        self.queue.iter().find(|p| p.is_media()).map(|p| pts_ms(p.pts))
    }

    fn recompute(&mut self) {
        match self.mode {
            BufferMode::Time => {
                self.lower = self.front_media_ms().unwrap_or(0);
                let last = self.queue.iter().rev().find(|p| p.is_media()).map(|p| pts_ms(p.pts));
                self.upper = last.unwrap_or(0).max(self.lower);
            }
            BufferMode::Bytes => {
                self.lower = 0;
                self.upper = self.queue.iter().map(|p| p.size() as i64).sum();
            }
            BufferMode::Packets => {
                self.lower = 0;
                self.upper = self.queue.iter().filter(|p| p.is_media()).count() as i64;
            }
        }
    }

    fn on_put(&mut self, packet: &Packet) {
        if !packet.is_media() {
            return;
        }
        let size = packet.size() as i64;
        match self.mode {
            BufferMode::Time => {
                self.lower = self.front_media_ms().unwrap_or(0);
                self.upper = pts_ms(packet.pts).max(self.lower);
                self.total_value = self.upper;
            }
            BufferMode::Bytes => {
                self.upper += size;
                self.total_value += size;
            }
            BufferMode::Packets => {
                self.upper += 1;
                self.total_value += 1;
            }
        }
        self.total_bytes += size;
        if self.history.len() >= HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back(BufferSample {
            at: Instant::now(),
            value: self.total_value,
            bytes: self.total_bytes,
        });

        if self.buffering && self.buffered() >= self.value {
            self.buffering = false;
            self.history.clear();
        }
    }

    fn on_take(&mut self, packet: &Packet) {
        if self.queue.is_empty() {
            self.buffering = true;
            self.lower = 0;
            self.upper = 0;
            return;
        }
        if !packet.is_media() {
            return;
        }
        match self.mode {
            BufferMode::Time => {
                self.lower = self.front_media_ms().unwrap_or(self.upper);
                self.upper = self.upper.max(self.lower);
            }
            BufferMode::Bytes => {
                self.upper = (self.upper - packet.size() as i64).max(0);
            }
            BufferMode::Packets => {
                self.upper = (self.upper - 1).max(0);
            }
        }
    }

    fn speed(&self, use_bytes: bool) -> f64 {
        let (Some(first), Some(last)) = (self.history.front(), self.history.back()) else {
            return 0.0;
        };
        let dt = first.at.elapsed().as_secs_f64();
        if dt <= f64::EPSILON {
            return 0.0;
        }
        let delta = if use_bytes {
            last.bytes - first.bytes
        } else {
            last.value - first.value
        };
        if delta < 0 {
            return 0.0;
        }
        delta as f64 / dt
    }
}

fn pts_ms(pts: f64) -> i64 {
    (pts * 1000.0).round() as i64
}

/// 带缓冲状态机的阻塞队列
pub struct PacketBuffer {
    name: &'static str,
    state: Mutex<BufferState>,
    not_empty: Condvar,
    not_full: Condvar,
    empty_callback: Mutex<Option<EmptyCallback>>,
}

impl PacketBuffer {
    pub fn new(name: &'static str) -> Self {
        Self::with_config(name, BufferConfig::default())
    }

    pub fn with_config(name: &'static str, config: BufferConfig) -> Self {
        Self {
            name,
            state: Mutex::new(BufferState {
                queue: VecDeque::new(),
                mode: config.mode,
                value: config.value.max(0),
                max: config.max.max(1.0),
                lower: 0,
                upper: 0,
                buffering: true,
                block_empty: true,
                block_full: true,
                total_value: 0,
                total_bytes: 0,
                history: VecDeque::with_capacity(HISTORY_SIZE),
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            empty_callback: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 入队。队列已满且允许阻塞时等待消费者
    pub fn put(&self, packet: Packet) {
        let mut st = self.state.lock();
        while st.block_full && st.is_full() {
            self.not_full.wait_for(&mut st, WAIT_STEP);
        }
        st.on_put(&packet);
        st.queue.push_back(packet);
        drop(st);
        self.not_empty.notify_one();
    }

    /// 最多等待 timeout 的入队，仍然满时把包交还给调用方
    pub fn put_timeout(&self, packet: Packet, timeout: Duration) -> std::result::Result<(), Packet> {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        while st.block_full && st.is_full() {
            if self.not_full.wait_until(&mut st, deadline).timed_out() && st.block_full && st.is_full() {
                return Err(packet);
            }
        }
        st.on_put(&packet);
        st.queue.push_back(packet);
        drop(st);
        self.not_empty.notify_one();
        Ok(())
    }

    /// 阻塞出队。阻塞被关闭且队列为空时返回 None
    pub fn take(&self) -> Option<Packet> {
        loop {
            if let Some(pkt) = self.take_timeout(WAIT_STEP) {
                return Some(pkt);
            }
            if !self.state.lock().block_empty {
                return None;
            }
        }
    }

    /// 最多等待 timeout 的出队
    pub fn take_timeout(&self, timeout: Duration) -> Option<Packet> {
        let empty = self.state.lock().queue.is_empty();
        if empty {
            self.notify_empty();
        }

        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        while st.queue.is_empty() {
            if !st.block_empty {
                return None;
            }
            if self.not_empty.wait_until(&mut st, deadline).timed_out() && st.queue.is_empty() {
                return None;
            }
        }
        let pkt = st.queue.pop_front()?;
        st.on_take(&pkt);
        drop(st);
        self.not_full.notify_one();
        Some(pkt)
    }

    fn notify_empty(&self) {
        let callback = self.empty_callback.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// 消费者发现队列为空时的回调（在队列锁外调用）
    pub fn set_empty_callback(&self, callback: Option<EmptyCallback>) {
        *self.empty_callback.lock() = callback;
    }

    pub fn clear(&self) {
        let mut st = self.state.lock();
        st.queue.clear();
        st.lower = 0;
        st.upper = 0;
        st.total_value = 0;
        st.total_bytes = 0;
        st.buffering = true;
        st.history.clear();
        drop(st);
        self.not_full.notify_all();
    }

    /// 同时开关两端的阻塞
    pub fn set_blocking(&self, blocking: bool) {
        let mut st = self.state.lock();
        st.block_empty = blocking;
        st.block_full = blocking;
        drop(st);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn block_empty(&self, block: bool) {
        self.state.lock().block_empty = block;
        if !block {
            self.not_empty.notify_all();
        }
    }

    pub fn block_full(&self, block: bool) {
        self.state.lock().block_full = block;
        if !block {
            self.not_full.notify_all();
        }
    }

    pub fn is_blocking_empty(&self) -> bool {
        self.state.lock().block_empty
    }

    pub fn is_blocking_full(&self) -> bool {
        self.state.lock().block_full
    }

    pub fn set_buffer_mode(&self, mode: BufferMode) {
        let mut st = self.state.lock();
        if st.mode == mode {
            return;
        }
        st.mode = mode;
        st.history.clear();
        st.total_value = 0;
        st.recompute();
    }

    pub fn buffer_mode(&self) -> BufferMode {
        self.state.lock().mode
    }

    pub fn set_buffer_value(&self, value: i64) {
        self.state.lock().value = value.max(0);
        self.not_full.notify_all();
    }

    pub fn buffer_value(&self) -> i64 {
        self.state.lock().value
    }

    /// 上限比例，小于 1.0 时按 1.0 处理
    pub fn set_buffer_max(&self, max: f64) {
        self.state.lock().max = if max.is_nan() { 1.0 } else { max.max(1.0) };
        self.not_full.notify_all();
    }

    pub fn buffer_max(&self) -> f64 {
        self.state.lock().max
    }

    pub fn buffered(&self) -> i64 {
        self.state.lock().buffered()
    }

    pub fn lower_bound(&self) -> i64 {
        self.state.lock().lower
    }

    pub fn upper_bound(&self) -> i64 {
        self.state.lock().upper
    }

    pub fn is_buffering(&self) -> bool {
        self.state.lock().buffering
    }

    pub fn buffer_progress(&self) -> f64 {
        let st = self.state.lock();
        if st.value <= 0 {
            return 1.0;
        }
        (st.buffered() as f64 / st.value as f64).clamp(0.0, 1.0)
    }

    /// 入队速度（每秒的模式单位）
    pub fn buffer_speed(&self) -> f64 {
        self.state.lock().speed(false)
    }

    pub fn buffer_speed_in_bytes(&self) -> f64 {
        self.state.lock().speed(true)
    }

    /// 缓冲量已达上限（生产者应停止入队）
    pub fn check_full(&self) -> bool {
        self.state.lock().is_full()
    }

    pub fn check_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    pub fn is_enough(&self) -> bool {
        let st = self.state.lock();
        st.buffered() >= st.value
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.check_empty()
    }
}

impl std::fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("PacketBuffer")
            .field("name", &self.name)
            .field("len", &st.queue.len())
            .field("buffered", &st.buffered())
            .field("buffering", &st.buffering)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn pkt(pts: f64) -> Packet {
        Packet::new(Bytes::from_static(&[0u8; 100]), pts, pts, 0.04, true)
    }

    fn time_buffer(value: i64) -> PacketBuffer {
        PacketBuffer::with_config(
            "test",
            BufferConfig {
                mode: BufferMode::Time,
                value,
                max: 1.5,
            },
        )
    }

    #[test]
    fn buffering_flips_at_buffer_value() {
        let buf = time_buffer(500);
        for i in 0..20 {
            let pts = i as f64 * 0.04;
            buf.put(pkt(pts));
            assert!(buf.buffered() >= 0);
            assert_eq!(buf.buffered(), buf.upper_bound() - buf.lower_bound());
            assert!((0.0..=1.0).contains(&buf.buffer_progress()));
            if i <= 12 {
                assert!(buf.is_buffering(), "pts {pts:.2} should still be buffering");
            } else {
                assert!(!buf.is_buffering(), "pts {pts:.2} should be buffered");
            }
        }
    }

    #[test]
    fn pts_rounds_to_nearest_millisecond() {
        assert_eq!(pts_ms(0.999999), 1000);
        assert_eq!(pts_ms(0.29), 290);
        assert_eq!(pts_ms(-0.0004), 0);

        // 0.0 到 0.999999 正好是 1 秒的缓冲
        let buf = time_buffer(1000);
        buf.put(pkt(0.0));
        buf.put(pkt(0.999999));
        assert_eq!(buf.buffered(), 1000);
        assert!(!buf.is_buffering());
    }

    #[test]
    fn negative_configured_value_is_clamped() {
        let buf = time_buffer(-500);
        assert_eq!(buf.buffer_value(), 0);
        buf.set_buffer_value(-1);
        assert_eq!(buf.buffer_value(), 0);
    }

    #[test]
    fn draining_returns_to_buffering() {
        let buf = time_buffer(100);
        for i in 0..5 {
            buf.put(pkt(i as f64 * 0.04));
        }
        assert!(!buf.is_buffering());
        for _ in 0..4 {
            buf.take().unwrap();
            assert!(!buf.is_buffering());
        }
        buf.take().unwrap();
        assert!(buf.is_buffering());
        assert_eq!(buf.buffered(), 0);
    }

    #[test]
    fn out_of_order_pts_never_goes_negative() {
        let buf = time_buffer(500);
        buf.put(pkt(1.0));
        buf.put(pkt(0.5));
        assert!(buf.buffered() >= 0);
        buf.take().unwrap();
        assert!(buf.buffered() >= 0);
    }

    #[test]
    fn bytes_and_packets_modes() {
        let buf = PacketBuffer::new("bytes");
        buf.set_buffer_mode(BufferMode::Bytes);
        buf.put(pkt(0.0));
        buf.put(pkt(0.04));
        assert_eq!(buf.buffered(), 200);
        buf.set_buffer_mode(BufferMode::Packets);
        assert_eq!(buf.buffered(), 2);
        buf.put(Packet::eof());
        assert_eq!(buf.buffered(), 2);
        buf.take().unwrap();
        assert_eq!(buf.buffered(), 1);
    }

    #[test]
    fn check_full_uses_max_ratio() {
        let buf = PacketBuffer::new("full");
        buf.set_buffer_mode(BufferMode::Packets);
        buf.set_buffer_value(2);
        buf.set_buffer_max(0.2);
        assert_eq!(buf.buffer_max(), 1.0);
        buf.put(pkt(0.0));
        assert!(!buf.check_full());
        buf.put(pkt(0.04));
        assert!(buf.check_full());
        assert!(buf.is_enough());
    }

    #[test]
    fn take_returns_none_when_unblocked() {
        let buf = Arc::new(PacketBuffer::new("unblock"));
        let b = buf.clone();
        let handle = thread::spawn(move || b.take());
        thread::sleep(Duration::from_millis(50));
        buf.set_blocking(false);
        assert!(handle.join().unwrap().is_none());
    }

    #[test]
    fn full_put_blocks_until_take() {
        let buf = Arc::new(PacketBuffer::new("block"));
        buf.set_buffer_mode(BufferMode::Packets);
        buf.set_buffer_value(1);
        buf.set_buffer_max(1.0);
        buf.put(pkt(0.0));
        let b = buf.clone();
        let handle = thread::spawn(move || b.put(pkt(0.04)));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(buf.len(), 1);
        buf.take().unwrap();
        handle.join().unwrap();
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn put_timeout_hands_packet_back_when_full() {
        let buf = PacketBuffer::new("timeout");
        buf.set_buffer_mode(BufferMode::Packets);
        buf.set_buffer_value(1);
        buf.set_buffer_max(1.0);
        assert!(buf.put_timeout(pkt(0.0), Duration::from_millis(10)).is_ok());
        let back = buf.put_timeout(pkt(0.04), Duration::from_millis(20)).unwrap_err();
        assert_eq!(back.pts, 0.04);
        buf.block_full(false);
        assert!(buf.put_timeout(back, Duration::from_millis(10)).is_ok());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn clear_resets_state() {
        let buf = time_buffer(40);
        buf.put(pkt(0.0));
        buf.put(pkt(0.08));
        assert!(!buf.is_buffering());
        buf.clear();
        assert!(buf.is_buffering());
        assert_eq!(buf.buffered(), 0);
        assert!(buf.check_empty());
    }

    #[test]
    fn empty_callback_runs_outside_lock() {
        let buf = Arc::new(PacketBuffer::new("cb"));
        let hits = Arc::new(AtomicUsize::new(0));
        let (b, h) = (buf.clone(), hits.clone());
        buf.set_empty_callback(Some(Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
            // 回调内可以访问同一个队列
            b.block_full(false);
        })));
        assert!(buf.take_timeout(Duration::from_millis(10)).is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn speed_is_non_negative() {
        let buf = time_buffer(10_000);
        for i in 0..4 {
            buf.put(pkt(i as f64 * 0.04));
            thread::sleep(Duration::from_millis(5));
        }
        assert!(buf.buffer_speed() > 0.0);
        assert!(buf.buffer_speed_in_bytes() > 0.0);
    }
}
