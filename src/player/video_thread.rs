// 视频解码线程：解码 + 音视频同步 + 丢帧策略

use crate::core::{log_ctx, ClockType, MediaFrame, Packet, PacketKind, Result, StreamKind, SyncConfig, VideoFrame};
use crate::player::decode_thread::{DecodeThread, DecoderSlot, InvalidFrameGuard, ThreadEvent, ThreadShared};
use crate::player::decoder::{Decoder, DecoderOptions, VideoDecoder};
use crate::player::output::OutputSet;
use crossbeam_channel::{bounded, Receiver};
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// 取包等待时间，超时后回到循环顶部处理任务
const TAKE_WAIT: Duration = Duration::from_millis(100);
/// 输出端全部暂停时的挂起时间
const OUTPUT_PAUSE_WAIT: Duration = Duration::from_millis(100);
/// 连续多少个包没有 pts 时认为码流无时间戳
const MAX_NO_PTS: u32 = 5;
/// 无时间戳码流的默认帧率
const FALLBACK_FPS: f64 = 24.0;
/// seek 目标附近的容差（秒），不在此范围内的帧可以丢弃非参考帧
const SEEK_NEAR_TARGET: f64 = -0.05;

pub type VideoThread = DecodeThread<VideoState>;

/// 视频线程私有状态，只在线程内部（或通过任务）访问
pub struct VideoState {
    decoder: Option<VideoDecoder>,
    generation: u64,
    outputs: Arc<OutputSet<VideoFrame>>,
    force_fps: f64,
    force_dt_ms: u64,
    displayed: Option<VideoFrame>,
}

impl VideoState {
    pub fn new(decoder: VideoDecoder, outputs: Arc<OutputSet<VideoFrame>>) -> Self {
        Self {
            decoder: Some(decoder),
            generation: 0,
            outputs,
            force_fps: 0.0,
            force_dt_ms: 0,
            displayed: None,
        }
    }

    /// 强制帧率。0 关闭；负值只在码流没有时间戳时生效
    pub fn set_frame_rate(&mut self, fps: f64) {
        self.force_fps = fps;
        self.force_dt_ms = if fps > 0.0 { (1000.0 / fps) as u64 } else { 0 };
    }

    /// 取回解码器（线程退出后复用）
    pub fn take_decoder(&mut self) -> Option<VideoDecoder> {
        self.decoder.take()
    }

    pub fn displayed_frame(&self) -> Option<&VideoFrame> {
        self.displayed.as_ref()
    }
}

impl DecoderSlot for VideoState {
    type Frame = VideoFrame;

    fn replace_decoder(&mut self, decoder: Box<dyn Decoder<VideoFrame>>) {
        info!("{} 🔁 视频解码器切换为 {}", log_ctx(), decoder.name());
        self.decoder = Some(decoder);
        self.generation += 1;
    }

    fn replace_outputs(&mut self, outputs: Arc<OutputSet<VideoFrame>>) {
        self.outputs = outputs;
    }
}

impl DecodeThread<VideoState> {
    pub fn set_frame_rate(&self, fps: f64) {
        self.schedule_task(Box::new(move |state: &mut VideoState| state.set_frame_rate(fps)));
    }

    /// 截取当前显示的帧（在解码线程中取出）
    pub fn capture(&self) -> Receiver<Option<VideoFrame>> {
        let (tx, rx) = bounded(1);
        self.schedule_task(Box::new(move |state: &mut VideoState| {
            let _ = tx.send(state.displayed.clone());
        }));
        rx
    }
}

/// 启动视频解码线程
pub fn spawn(shared: Arc<ThreadShared<VideoState>>, state: VideoState) -> Result<VideoThread> {
    DecodeThread::spawn(shared, state, |ctx, mut state| {
        VideoLoop::new().run(ctx, &mut state);
        ctx.packets().clear();
        state
    })
}

/// 慢帧处理决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlowPath {
    /// 跳过解码直到下一个关键帧
    HardSkip,
    /// 又慢了一帧
    Slower,
    /// 追上来了，慢帧计数减一
    Recover,
    Steady,
}

/// 根据上一次与本次的偏差决定慢帧处理
///
/// delay 为上一包的偏差，diff 为本包的偏差（负数表示视频落后）。
pub fn slow_path(delay: f64, diff: f64, seeking: bool, nb_slow: u32, key_frame: bool, cfg: &SyncConfig) -> SlowPath {
    if delay < -0.5 && delay > diff {
        if seeking {
            return SlowPath::Steady;
        }
        let lagging = diff < -cfg.hard_skip_lag || (nb_slow > cfg.slow_skip && diff < -1.0);
        if lagging && !key_frame {
            SlowPath::HardSkip
        } else {
            SlowPath::Slower
        }
    } else if nb_slow >= cfg.slow_frame_drop {
        SlowPath::Recover
    } else {
        SlowPath::Steady
    }
}

/// 同步到音频时，根据实际偏差调整累计的 v_a 修正量
pub fn adjust_av_drift(v_a: f64, observed: f64) -> f64 {
    if observed.abs() < 1e-9 {
        return v_a;
    }
    let mut v = v_a;
    if observed < -0.1 {
        if v <= observed {
            v -= 0.01;
        } else {
            v = (observed + v) * 0.5;
        }
    } else if observed < -0.002 {
        v -= 0.001;
    } else if observed < 0.002 {
    } else if observed < 0.1 {
        v += 0.001;
    } else if v >= observed {
        v += 0.01;
    } else {
        v = (observed + v) * 0.5;
    }
    if !(-2.0..=2.0).contains(&v) {
        v /= 2.0;
    }
    v
}

/// 太快时的休眠时长
pub fn too_fast_sleep(nb_fast: u32, diff: f64) -> f64 {
    (0.01 * (nb_fast >> 1) as f64).min(diff)
}

/// 解码循环的局部状态
struct VideoLoop {
    pkt: Option<Packet>,
    wait_key_frame: bool,
    nb_slow: u32,
    nb_fast: u32,
    /// 第一次 seek 不能用丢帧解码：-1 表示已完成过一次无丢帧的 seek
    seek_count: i32,
    v_a: f64,
    nb_no_pts: u32,
    delay: f64,
    render_pts0: Option<f64>,
    sync_id: u32,
    frame_drop: bool,
    generation: u64,
    guard: InvalidFrameGuard,
    start: Instant,
    last_deliver: Option<Instant>,
    normal_opts: DecoderOptions,
    drop_opts: DecoderOptions,
}

impl VideoLoop {
    fn new() -> Self {
        Self {
            pkt: None,
            wait_key_frame: false,
            nb_slow: 0,
            nb_fast: 0,
            seek_count: 0,
            v_a: 0.0,
            nb_no_pts: 0,
            delay: 0.0,
            render_pts0: None,
            sync_id: 0,
            frame_drop: false,
            generation: 0,
            guard: InvalidFrameGuard::default(),
            start: Instant::now(),
            last_deliver: None,
            normal_opts: DecoderOptions::default(),
            drop_opts: DecoderOptions::frame_drop(),
        }
    }

    fn finish_seek(&mut self, ctx: &ThreadShared<VideoState>, pts: f64) {
        self.render_pts0 = None;
        ctx.clock().sync_end_once(self.sync_id);
        debug!("{} 🎯 视频 seek 完成 @{:.3} id={}", log_ctx(), pts, self.sync_id);
        ctx.seek_settled(pts);
        if self.seek_count == -1 {
            self.seek_count = 1;
        } else if self.seek_count > 0 {
            self.seek_count += 1;
        }
    }

    fn display_fps(&self, ctx: &ThreadShared<VideoState>) -> f64 {
        let fps = ctx.decode_frame_rate();
        if fps > 0.0 {
            return fps;
        }
        let declared = ctx.stats().read().video.frame_rate;
        if declared > 0.0 {
            declared
        } else {
            FALLBACK_FPS
        }
    }

    fn run(&mut self, ctx: &ThreadShared<VideoState>, state: &mut VideoState) {
        let cfg = *ctx.sync();
        let clock = ctx.clock().clone();
        self.generation = state.generation;

        while !ctx.is_stopped() {
            ctx.process_tasks(state);
            // seek 期间不暂停
            if self.render_pts0.is_none() && ctx.try_pause() {
                continue;
            }

            if ctx.take_seek_request() {
                debug!("{} ⏩ 视频线程收到 seek 请求", log_ctx());
                self.pkt = None;
                thread::sleep(Duration::from_millis(1));
            } else if clock.sync_id() > 0 {
                // 自己已经完成，等待其他线程关闭栅栏
                if self.render_pts0.is_none() && self.sync_id > 0 {
                    thread::sleep(Duration::from_millis(10));
                    self.v_a = 0.0;
                    continue;
                }
            } else {
                self.sync_id = 0;
            }

            let mut pkt = match self.pkt.take() {
                Some(p) => p,
                None => match ctx.packets().take_timeout(TAKE_WAIT) {
                    Some(p) => p,
                    None => continue,
                },
            };

            match pkt.kind {
                PacketKind::Eof | PacketKind::Quit => {
                    self.wait_key_frame = false;
                }
                PacketKind::Seek { sync_id } => {
                    self.wait_key_frame = true;
                    if let Some(decoder) = state.decoder.as_mut() {
                        decoder.flush();
                    }
                    self.render_pts0 = (pkt.pts >= 0.0).then_some(pkt.pts);
                    self.sync_id = sync_id;
                    debug!("{} 🧹 视频 seek 哨兵: target={:.3} id={}", log_ctx(), pkt.pts, sync_id);
                    ctx.clear_history();
                    self.v_a = 0.0;
                    self.guard.reset();
                    continue;
                }
                PacketKind::Data | PacketKind::Silence => {}
            }

            if pkt.pts <= 0.0 && !pkt.is_eof() && !pkt.data.is_empty() {
                self.nb_no_pts += 1;
            } else {
                self.nb_no_pts = 0;
            }
            if self.nb_no_pts > MAX_NO_PTS {
                let fps = if state.force_fps < 0.0 { -state.force_fps } else { FALLBACK_FPS };
                if state.force_dt_ms == 0 {
                    warn!("{} ⚠ 码流可能没有时间戳，强制帧率 {} fps", log_ctx(), fps);
                    state.set_frame_rate(fps);
                }
                clock.set_clock_auto(false);
                clock.set_clock_type(ClockType::Video);
            }

            let clock_type = clock.clock_type();
            let sync_audio = clock_type == ClockType::Audio;
            let sync_video = clock_type == ClockType::Video;

            let dts = pkt.dts;
            let mut diff = if dts > 0.0 { dts - clock.value() + self.v_a } else { self.v_a };
            if pkt.is_eof() {
                diff = self.delay.max(1.0 / self.display_fps(ctx)).min(1.0);
            }
            if diff < 0.0 && sync_video {
                diff = 0.0;
            }
            if diff > cfg.sync_threshold {
                self.nb_fast += 1;
            } else {
                self.nb_fast /= 2;
            }

            let seeking = self.render_pts0.is_some();
            if seeking {
                self.nb_slow = 0;
                self.nb_fast = 0;
            }

            match slow_path(self.delay, diff, seeking, self.nb_slow, pkt.key_frame, &cfg) {
                SlowPath::HardSkip => {
                    info!("{} 🐢 视频落后 {:.3}s，跳过解码直到下一个关键帧", log_ctx(), diff);
                    self.nb_slow = 0;
                    self.wait_key_frame = true;
                    self.v_a = 0.0;
                    ctx.stats().write().video.skipped_frames += 1;
                    continue;
                }
                SlowPath::Slower => {
                    self.nb_slow += 1;
                    debug!("frame slow count: {}. v-a: {:.3}", self.nb_slow, diff);
                }
                SlowPath::Recover => self.nb_slow = self.nb_slow.saturating_sub(1),
                SlowPath::Steady => {}
            }

            self.delay = diff;
            if seeking {
                diff = 0.0;
            }

            if !sync_audio && diff > 0.0 {
                if state.force_fps <= 0.0 && !ctx.wait_and_check(state, diff, dts) {
                    continue;
                }
                diff = 0.0;
            }

            clock.update_video_time(dts);

            let mut skip_render = false;
            if diff.abs() >= 0.5 && !seeking {
                if diff < 0.0 {
                    if self.nb_slow > cfg.slow_skip {
                        skip_render = !pkt.key_frame && self.nb_slow % 2 == 1;
                    }
                } else {
                    let s = too_fast_sleep(self.nb_fast, diff);
                    warn!("{} 🐇 视频太快，休眠 {:.2}s (nb_fast={}, v_a={:.4})", log_ctx(), s, self.nb_fast, self.v_a);
                    if !ctx.wait_and_check(state, s, dts) {
                        continue;
                    }
                    diff = 0.0;
                }
            }

            if diff > 0.0 && diff < 1.0 && !seeking && !ctx.wait_and_check(state, diff, dts) {
                continue;
            }

            if self.wait_key_frame {
                if !pkt.key_frame {
                    self.v_a = 0.0;
                    continue;
                }
                self.wait_key_frame = false;
            }

            let frame_drop_before = self.frame_drop;
            match self.render_pts0 {
                Some(target) if pkt.pts - target < SEEK_NEAR_TARGET => {
                    if self.seek_count > 0 && ctx.drop_frame_on_seek() {
                        self.frame_drop = true;
                    } else {
                        self.seek_count = -1;
                    }
                }
                _ => self.frame_drop = self.nb_slow >= cfg.slow_frame_drop,
            }

            let generation_changed = self.generation != state.generation;
            if generation_changed {
                self.generation = state.generation;
                if !pkt.key_frame {
                    self.wait_key_frame = true;
                    self.v_a = 0.0;
                    continue;
                }
                debug!("decoder changed. decoding key frame");
            }

            let Some(decoder) = state.decoder.as_mut() else {
                if pkt.kind == PacketKind::Quit {
                    break;
                }
                continue;
            };
            if generation_changed || self.frame_drop != frame_drop_before {
                decoder.set_options(if self.frame_drop { &self.drop_opts } else { &self.normal_opts });
            }

            if !decoder.decode(&pkt) {
                if pkt.is_eof() {
                    ctx.send(ThreadEvent::EofDecoded(StreamKind::Video));
                    if let Some(target) = self.render_pts0 {
                        let last = ctx.last_decoded().unwrap_or(target);
                        debug!("{} 🎯 视频在 EOF 处结束 seek: {:.3}", log_ctx(), last);
                        self.finish_seek(ctx, last);
                    }
                    if pkt.kind == PacketKind::Quit {
                        break;
                    }
                } else {
                    debug!("视频解码失败. undecoded: {}/{}", decoder.undecoded_size(), pkt.size());
                    ctx.stats().write().video.dropped_frames += 1;
                }
                continue;
            }

            if !pkt.is_eof() {
                let consumed = pkt.size().saturating_sub(decoder.undecoded_size());
                pkt.skip(consumed);
            }

            let Some(mut frame) = decoder.frame().filter(|f| f.is_valid()) else {
                if pkt.is_eof() || !pkt.data.is_empty() {
                    if self.guard.should_drop(&pkt.data) {
                        warn!("{} ⚠ 解码器无法产出有效帧，丢弃剩余 {} 字节", log_ctx(), pkt.size());
                        if pkt.is_eof() {
                            // 排空完成，按 EOF 处理
                            ctx.send(ThreadEvent::EofDecoded(StreamKind::Video));
                            if pkt.kind == PacketKind::Quit {
                                break;
                            }
                        }
                    } else {
                        self.pkt = Some(pkt);
                    }
                }
                continue;
            };
            self.guard.reset();

            if frame.timestamp < 0.0 {
                frame.timestamp = pkt.pts;
            }
            let pts = frame.timestamp;
            ctx.record_decoded(pts);

            if let Some(target) = self.render_pts0 {
                if pts < target {
                    if pkt.is_eof() {
                        self.pkt = Some(pkt);
                    }
                    self.v_a = 0.0;
                    continue;
                }
                self.finish_seek(ctx, pts);
            }

            if skip_render {
                debug!("skip rendering @{:.3}", pts);
                self.v_a = 0.0;
                ctx.stats().write().video.skipped_frames += 1;
                continue;
            }

            let outputs = state.outputs.clone();
            while outputs.can_pause_thread() && !ctx.is_stopped() {
                outputs.pause_thread(OUTPUT_PAUSE_WAIT);
                ctx.process_tasks(state);
            }

            if state.force_dt_ms > 0 {
                let now = Instant::now();
                let since_last = self.last_deliver.map_or(0, |t| now.duration_since(t).as_millis() as i64);
                let delta = if self.last_deliver.is_some() { state.force_dt_ms as i64 - since_last } else { 0 };
                if frame.timestamp <= 0.0 {
                    let started = now.duration_since(self.start).as_millis() as i64 + delta.max(0);
                    frame.timestamp = started as f64 / 1000.0;
                    clock.update_value(frame.timestamp);
                }
                if delta > 0 && !ctx.wait_and_check(state, delta as f64 / 1000.0, -1.0) {
                    continue;
                }
            }

            outputs.send_frame(&frame);
            ctx.frame_delivered(frame.timestamp);
            if state.force_dt_ms > 0 {
                self.last_deliver = Some(Instant::now());
            }

            {
                let mut stats = ctx.stats().write();
                stats.video.current_time = frame.timestamp;
                stats.video.total_frames += 1;
                stats.video.decoded_fps = ctx.decode_frame_rate();
                if let Some(decoder) = state.decoder.as_ref() {
                    if stats.video.decoder != decoder.name() {
                        stats.video.decoder = decoder.name().to_string();
                    }
                }
            }

            if clock.clock_type() == ClockType::Audio {
                self.v_a = adjust_av_drift(self.v_a, frame.timestamp - clock.value());
            }
            state.displayed = Some(frame);

            if pkt.is_eof() || !pkt.data.is_empty() {
                self.pkt = Some(pkt);
            }
        }
        info!("{} 🛑 视频解码循环结束", log_ctx());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_skip_when_far_behind() {
        let cfg = SyncConfig::default();
        assert_eq!(slow_path(-0.6, -2.5, false, 0, false, &cfg), SlowPath::HardSkip);
        // 关键帧不跳
        assert_eq!(slow_path(-0.6, -2.5, false, 0, true, &cfg), SlowPath::Slower);
        // seek 中不计慢帧
        assert_eq!(slow_path(-0.6, -2.5, true, 0, false, &cfg), SlowPath::Steady);
    }

    #[test]
    fn persistent_slowness_triggers_skip() {
        let cfg = SyncConfig::default();
        assert_eq!(slow_path(-0.8, -1.2, false, 20, false, &cfg), SlowPath::Slower);
        assert_eq!(slow_path(-0.8, -1.2, false, 21, false, &cfg), SlowPath::HardSkip);
    }

    #[test]
    fn recovering_decrements_slow_count() {
        let cfg = SyncConfig::default();
        assert_eq!(slow_path(0.0, 0.01, false, 10, false, &cfg), SlowPath::Recover);
        assert_eq!(slow_path(0.0, 0.01, false, 9, false, &cfg), SlowPath::Steady);
        // 偏差在好转（diff > delay）也不算慢
        assert_eq!(slow_path(-0.8, -0.6, false, 3, false, &cfg), SlowPath::Steady);
    }

    #[test]
    fn too_fast_sleep_is_bounded_by_diff() {
        assert_eq!(too_fast_sleep(0, 0.7), 0.0);
        assert!((too_fast_sleep(10, 0.7) - 0.05).abs() < 1e-9);
        assert_eq!(too_fast_sleep(1000, 0.7), 0.7);
    }

    #[test]
    fn drift_adjustment_converges_and_is_bounded() {
        assert_eq!(adjust_av_drift(0.0, 0.0), 0.0);
        assert!((adjust_av_drift(0.0, 0.05) - 0.001).abs() < 1e-12);
        assert!((adjust_av_drift(0.0, -0.05) + 0.001).abs() < 1e-12);
        assert!((adjust_av_drift(0.0, 0.5) - 0.25).abs() < 1e-12);
        assert!(adjust_av_drift(1.9, 3.0).abs() <= 2.0);
    }
}
