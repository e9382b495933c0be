// 音频解码线程
//
// 使用音频时钟时，本线程是同步主控：按采样时长节拍交付帧并写时钟。
// 其他时钟下只是跟随时钟交付。

use crate::core::{log_ctx, AudioFrame, ClockType, MediaFrame, Packet, PacketKind, Result, StreamKind};
use crate::player::decode_thread::{DecodeThread, DecoderSlot, InvalidFrameGuard, ThreadEvent, ThreadShared};
use crate::player::decoder::{AudioDecoder, Decoder};
use crate::player::output::OutputSet;
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const TAKE_WAIT: Duration = Duration::from_millis(100);
const OUTPUT_PAUSE_WAIT: Duration = Duration::from_millis(100);
/// 静音包拆分成的帧长度（秒）
const SILENCE_CHUNK: f64 = 0.1;
/// 落后超过该值时重新建立节拍锚点
const PACER_RESYNC: f64 = 0.2;

pub type AudioThread = DecodeThread<AudioState>;

/// 音频线程私有状态
pub struct AudioState {
    decoder: Option<AudioDecoder>,
    outputs: Arc<OutputSet<AudioFrame>>,
    sample_rate: u32,
    channels: u16,
}

impl AudioState {
    pub fn new(decoder: AudioDecoder, outputs: Arc<OutputSet<AudioFrame>>, sample_rate: u32, channels: u16) -> Self {
        Self {
            decoder: Some(decoder),
            outputs,
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
        }
    }

    pub fn take_decoder(&mut self) -> Option<AudioDecoder> {
        self.decoder.take()
    }
}

impl DecoderSlot for AudioState {
    type Frame = AudioFrame;

    fn replace_decoder(&mut self, decoder: Box<dyn Decoder<AudioFrame>>) {
        info!("{} 🔁 音频解码器切换为 {}", log_ctx(), decoder.name());
        self.decoder = Some(decoder);
    }

    fn replace_outputs(&mut self, outputs: Arc<OutputSet<AudioFrame>>) {
        self.outputs = outputs;
    }
}

pub fn spawn(shared: Arc<ThreadShared<AudioState>>, state: AudioState) -> Result<AudioThread> {
    DecodeThread::spawn(shared, state, |ctx, mut state| {
        AudioLoop::default().run(ctx, &mut state);
        ctx.packets().clear();
        state
    })
}

/// 模拟音频设备的消费节拍：以第一帧为锚点，按 pts 差值/速度计算交付时刻
#[derive(Debug, Default)]
pub struct AudioPacer {
    anchor: Option<(Instant, f64, f64)>,
}

impl AudioPacer {
    pub fn reset(&mut self) {
        self.anchor = None;
    }

    /// 交付 pts 之前还需要等待的秒数
    pub fn wait_for(&mut self, pts: f64, speed: f64) -> f64 {
        if let Some((wall, base, anchor_speed)) = self.anchor {
            if anchor_speed == speed && pts >= base {
                let wait = (pts - base) / speed - wall.elapsed().as_secs_f64();
                if wait >= -PACER_RESYNC {
                    return wait.max(0.0);
                }
            }
        }
        self.anchor = Some((Instant::now(), pts, speed));
        0.0
    }
}

#[derive(Default)]
struct AudioLoop {
    pkt: Option<Packet>,
    render_pts0: Option<f64>,
    sync_id: u32,
    pacer: AudioPacer,
    guard: InvalidFrameGuard,
    last_pts: f64,
}

impl AudioLoop {
    fn finish_seek(&mut self, ctx: &ThreadShared<AudioState>, pts: f64) {
        self.render_pts0 = None;
        ctx.clock().sync_end_once(self.sync_id);
        debug!("{} 🎯 音频 seek 完成 @{:.3} id={}", log_ctx(), pts, self.sync_id);
        ctx.seek_settled(pts);
    }

    fn handle_eof(&mut self, ctx: &ThreadShared<AudioState>) {
        ctx.send(ThreadEvent::EofDecoded(StreamKind::Audio));
        if self.render_pts0.is_some() {
            let last = self.last_pts;
            self.finish_seek(ctx, last);
        }
    }

    /// 交付一帧；返回 false 表示被 stop/seek 打断
    fn deliver(&mut self, ctx: &ThreadShared<AudioState>, state: &mut AudioState, frame: AudioFrame) -> bool {
        let pts = frame.timestamp();
        self.last_pts = pts;
        if let Some(target) = self.render_pts0 {
            if pts < target {
                return true;
            }
            self.finish_seek(ctx, pts);
            self.pacer.reset();
        }

        let outputs = state.outputs.clone();
        while outputs.can_pause_thread() && !ctx.is_stopped() {
            outputs.pause_thread(OUTPUT_PAUSE_WAIT);
            ctx.process_tasks(state);
        }

        let clock = ctx.clock();
        if clock.clock_type() == ClockType::Audio {
            let wait = self.pacer.wait_for(pts, clock.speed());
            if !ctx.wait_and_check(state, wait, -1.0) {
                return false;
            }
            outputs.send_frame(&frame);
            clock.update_value(pts);
            clock.update_delay(outputs.max_delay());
        } else {
            // 跟随外部/视频时钟
            let diff = pts - clock.value();
            if diff > 0.0 && !ctx.wait_and_check(state, diff, pts) {
                return false;
            }
            outputs.send_frame(&frame);
        }
        ctx.record_decoded(pts);
        ctx.frame_delivered(pts);

        let mut stats = ctx.stats().write();
        stats.audio.current_time = pts;
        stats.audio.total_frames += 1;
        true
    }

    fn run(&mut self, ctx: &ThreadShared<AudioState>, state: &mut AudioState) {
        let clock = ctx.clock().clone();
        while !ctx.is_stopped() {
            ctx.process_tasks(state);
            if self.render_pts0.is_none() && ctx.try_pause() {
                self.pacer.reset();
                continue;
            }

            if ctx.take_seek_request() {
                debug!("{} ⏩ 音频线程收到 seek 请求", log_ctx());
                self.pkt = None;
                thread::sleep(Duration::from_millis(1));
            } else if clock.sync_id() > 0 {
                if self.render_pts0.is_none() && self.sync_id > 0 {
                    thread::sleep(Duration::from_millis(10));
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
                PacketKind::Seek { sync_id } => {
                    if let Some(decoder) = state.decoder.as_mut() {
                        decoder.flush();
                    }
                    self.render_pts0 = (pkt.pts >= 0.0).then_some(pkt.pts);
                    self.sync_id = sync_id;
                    self.last_pts = pkt.pts;
                    self.pacer.reset();
                    self.guard.reset();
                    ctx.clear_history();
                    debug!("{} 🧹 音频 seek 哨兵: target={:.3} id={}", log_ctx(), pkt.pts, sync_id);
                    continue;
                }
                PacketKind::Silence => {
                    debug!("{} 🔇 静音补齐 {:.3}s @{:.3}", log_ctx(), pkt.duration, pkt.pts);
                    let mut offset = 0.0;
                    while offset < pkt.duration && !ctx.is_stopped() && !ctx.seek_requested() {
                        let len = SILENCE_CHUNK.min(pkt.duration - offset);
                        let frame = AudioFrame::silence(pkt.pts + offset, len, state.sample_rate, state.channels);
                        if !self.deliver(ctx, state, frame) {
                            break;
                        }
                        offset += len;
                    }
                    continue;
                }
                PacketKind::Data | PacketKind::Eof | PacketKind::Quit => {}
            }

            let Some(decoder) = state.decoder.as_mut() else {
                if pkt.is_eof() {
                    self.handle_eof(ctx);
                    if pkt.kind == PacketKind::Quit {
                        break;
                    }
                }
                continue;
            };

            if !decoder.decode(&pkt) {
                if pkt.is_eof() {
                    self.handle_eof(ctx);
                    if pkt.kind == PacketKind::Quit {
                        break;
                    }
                } else {
                    debug!("音频解码失败. undecoded: {}/{}", decoder.undecoded_size(), pkt.size());
                    ctx.stats().write().audio.dropped_frames += 1;
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
                        warn!("{} ⚠ 音频解码器无法产出有效帧，丢弃该包", log_ctx());
                        if pkt.is_eof() {
                            self.handle_eof(ctx);
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

            if !self.deliver(ctx, state, frame) {
                continue;
            }
            if pkt.is_eof() || !pkt.data.is_empty() {
                self.pkt = Some(pkt);
            }
        }
        info!("{} 🛑 音频解码循环结束", log_ctx());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pacer_anchors_on_first_frame() {
        let mut pacer = AudioPacer::default();
        assert_eq!(pacer.wait_for(5.0, 1.0), 0.0);
        let wait = pacer.wait_for(5.1, 1.0);
        assert!(wait > 0.05 && wait <= 0.1, "wait {wait}");
        // 双倍速时同样的 pts 差只需一半时间（速度变化会重新锚定）
        assert_eq!(pacer.wait_for(5.2, 2.0), 0.0);
        let wait = pacer.wait_for(5.4, 2.0);
        assert!(wait > 0.05 && wait <= 0.1, "wait {wait}");
    }

    #[test]
    fn pacer_resyncs_when_far_behind() {
        let mut pacer = AudioPacer::default();
        pacer.wait_for(1.0, 1.0);
        thread::sleep(Duration::from_millis(300));
        assert_eq!(pacer.wait_for(1.02, 1.0), 0.0);
        let wait = pacer.wait_for(1.12, 1.0);
        assert!(wait > 0.05, "wait {wait}");
    }

    #[test]
    fn pacer_reanchors_on_backwards_pts() {
        let mut pacer = AudioPacer::default();
        pacer.wait_for(10.0, 1.0);
        assert_eq!(pacer.wait_for(2.0, 1.0), 0.0);
    }
}
