use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 漂移校正周期
const CORRECTION_INTERVAL: Duration = Duration::from_secs(1);

/// 时钟来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockType {
    /// 音频线程写入的 pts 驱动
    Audio,
    /// 墙上时钟积分
    External,
    /// 视频线程写入的 pts 驱动
    Video,
}

/// 时钟运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    Running,
    Paused,
    Stopped,
}

/// 播放时钟 - 用于音视频同步
///
/// 时间单位为秒。克隆得到的是同一个时钟的句柄。
#[derive(Clone)]
pub struct PlaybackClock {
    inner: Arc<Mutex<ClockInner>>,
}

struct ClockInner {
    clock_type: ClockType,
    auto_clock: bool,
    speed: f64,
    initial_value: f64,         // 起始值（媒体 start time）
    pts: f64,                   // 音频 pts 或外部时钟累计值
    pts_v: f64,                 // 最近的视频 pts
    delay: f64,                 // 音频输出延迟
    state: ClockState,
    timer: Option<Instant>,     // 外部时钟计时起点，None 表示暂停
    avg_err: f64,               // 漂移校正量（秒/次）
    nb_restarted: u32,          // 本校正周期内的积分次数
    last_pts: f64,
    last_correction: Instant,
    sync_id: u32,
    next_sync_id: u32,
    nb_sync: u32,
}

impl ClockInner {
    fn integrate(&mut self) {
        if let Some(timer) = self.timer {
            let now = Instant::now();
            self.nb_restarted += 1;
            self.pts += ((now - timer).as_secs_f64() + self.avg_err) * self.speed;
            self.timer = Some(now);
        }
    }

    fn external_value(&mut self) -> f64 {
        self.integrate();
        self.correct();
        self.pts + self.initial_value
    }

    /// 每秒一次：比较墙上时间与时钟前进量，累计平均误差
    fn correct(&mut self) {
        if self.state != ClockState::Running || self.timer.is_none() {
            return;
        }
        let elapsed = self.last_correction.elapsed();
        if elapsed < CORRECTION_INTERVAL {
            return;
        }
        let value = self.pts + self.initial_value;
        let delta_pts = (value - self.last_pts) / self.speed;
        let err = elapsed.as_secs_f64() - delta_pts;
        if (err * 10.0).abs() < CORRECTION_INTERVAL.as_secs_f64() || self.clock_type == ClockType::Video {
            self.avg_err += err / (self.nb_restarted + 1) as f64;
        }
        self.last_pts = value;
        self.last_correction = Instant::now();
        self.nb_restarted = 0;
    }

    fn value(&mut self) -> f64 {
        match self.clock_type {
            ClockType::Audio => {
                if self.pts == 0.0 {
                    self.initial_value
                } else {
                    self.pts + self.delay
                }
            }
            ClockType::External => self.external_value(),
            ClockType::Video => self.pts_v,
        }
    }
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockInner {
                clock_type: ClockType::Audio,
                auto_clock: true,
                speed: 1.0,
                initial_value: 0.0,
                pts: 0.0,
                pts_v: 0.0,
                delay: 0.0,
                state: ClockState::Stopped,
                timer: None,
                avg_err: 0.0,
                nb_restarted: 0,
                last_pts: 0.0,
                last_correction: Instant::now(),
                sync_id: 0,
                next_sync_id: 0,
                nb_sync: 0,
            })),
        }
    }

    /// 获取当前时钟值（秒）
    pub fn value(&self) -> f64 {
        self.inner.lock().value()
    }

    /// 音频/视频线程上报的 pts，外部时钟忽略
    pub fn update_value(&self, pts: f64) {
        let mut inner = self.inner.lock();
        match inner.clock_type {
            ClockType::Audio => inner.pts = pts,
            ClockType::Video => inner.pts_v = pts,
            ClockType::External => {}
        }
    }

    /// 记录最近显示的视频 pts
    pub fn update_video_time(&self, pts: f64) {
        self.inner.lock().pts_v = pts;
    }

    pub fn video_time(&self) -> f64 {
        self.inner.lock().pts_v
    }

    /// 音频输出延迟（秒）
    pub fn update_delay(&self, delay: f64) {
        self.inner.lock().delay = delay;
    }

    pub fn delay(&self) -> f64 {
        self.inner.lock().delay
    }

    /// 强制设定时间基准（毫秒），用于 seek。音频时钟由音频线程驱动，此处忽略
    pub fn update_external_clock(&self, msecs: i64) {
        let mut inner = self.inner.lock();
        if inner.clock_type == ClockType::Audio {
            return;
        }
        inner.pts = msecs as f64 / 1000.0 - inner.initial_value;
        if inner.state == ClockState::Running {
            inner.timer = Some(Instant::now());
        }
        inner.last_pts = inner.pts + inner.initial_value;
        inner.last_correction = Instant::now();
        if inner.clock_type == ClockType::Video {
            inner.pts_v = msecs as f64 / 1000.0;
        }
    }

    /// 用另一个时钟的当前值重新同步外部时钟
    pub fn update_external_clock_from(&self, other: &PlaybackClock) {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return;
        }
        let value = other.value();
        let mut inner = self.inner.lock();
        if inner.clock_type != ClockType::External {
            return;
        }
        inner.pts = value - inner.initial_value;
        if inner.state == ClockState::Running {
            inner.timer = Some(Instant::now());
        }
        inner.last_pts = value;
    }

    /// 打开一个同步栅栏，需要 n 个参与者各调用一次 `sync_end_once`
    pub fn sync_start(&self, count: u32) -> u32 {
        let mut inner = self.inner.lock();
        inner.next_sync_id = inner.next_sync_id.wrapping_add(1).max(1);
        inner.sync_id = inner.next_sync_id;
        inner.nb_sync = count;
        if count == 0 {
            inner.sync_id = 0;
        }
        inner.next_sync_id
    }

    /// 参与者关闭栅栏。返回栅栏是否已经全部关闭
    pub fn sync_end_once(&self, id: u32) -> bool {
        let mut inner = self.inner.lock();
        if id != inner.sync_id {
            return inner.sync_id == 0;
        }
        inner.nb_sync = inner.nb_sync.saturating_sub(1);
        if inner.nb_sync == 0 {
            inner.sync_id = 0;
        }
        inner.sync_id == 0
    }

    /// 当前打开的栅栏，0 表示 seek 已完全结束
    pub fn sync_id(&self) -> u32 {
        self.inner.lock().sync_id
    }

    /// 开始计时
    pub fn start(&self) {
        let mut inner = self.inner.lock();
        inner.state = ClockState::Running;
        inner.timer = Some(Instant::now());
        inner.last_correction = Instant::now();
        inner.nb_restarted = 0;
    }

    pub fn pause(&self, paused: bool) {
        let mut inner = self.inner.lock();
        if paused {
            if inner.state != ClockState::Running {
                return;
            }
            inner.integrate();
            inner.timer = None;
            inner.state = ClockState::Paused;
        } else {
            if inner.state == ClockState::Running {
                return;
            }
            inner.state = ClockState::Running;
            inner.timer = Some(Instant::now());
            inner.last_correction = Instant::now();
            inner.last_pts = inner.pts + inner.initial_value;
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().state != ClockState::Running
    }

    pub fn state(&self) -> ClockState {
        self.inner.lock().state
    }

    /// 清除累计值、漂移和栅栏，保留速度和自动选择设置
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.initial_value = 0.0;
        inner.pts = 0.0;
        inner.pts_v = 0.0;
        inner.delay = 0.0;
        inner.state = ClockState::Stopped;
        inner.timer = None;
        inner.avg_err = 0.0;
        inner.nb_restarted = 0;
        inner.last_pts = 0.0;
        inner.last_correction = Instant::now();
        inner.sync_id = 0;
        inner.nb_sync = 0;
    }

    /// 设置播放速率
    pub fn set_speed(&self, speed: f64) {
        if speed.is_nan() || speed <= 0.0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.integrate();
        inner.speed = speed;
    }

    pub fn speed(&self) -> f64 {
        self.inner.lock().speed
    }

    pub fn set_clock_type(&self, clock_type: ClockType) {
        let mut inner = self.inner.lock();
        if inner.clock_type == clock_type {
            return;
        }
        // 切到外部时钟时从当前值继续走
        let value = inner.value();
        inner.clock_type = clock_type;
        if clock_type == ClockType::External {
            inner.pts = value - inner.initial_value;
            if inner.state == ClockState::Running {
                inner.timer = Some(Instant::now());
            }
        }
    }

    pub fn clock_type(&self) -> ClockType {
        self.inner.lock().clock_type
    }

    /// 是否由播放器根据媒体自动选择时钟来源
    pub fn set_clock_auto(&self, auto: bool) {
        self.inner.lock().auto_clock = auto;
    }

    pub fn is_clock_auto(&self) -> bool {
        self.inner.lock().auto_clock
    }

    /// 起始值（秒），通常为媒体的 start time
    pub fn set_initial_value(&self, value: f64) {
        self.inner.lock().initial_value = value;
    }

    pub fn initial_value(&self) -> f64 {
        self.inner.lock().initial_value
    }
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PlaybackClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PlaybackClock")
            .field("type", &inner.clock_type)
            .field("speed", &inner.speed)
            .field("state", &inner.state)
            .field("sync_id", &inner.sync_id)
            .finish()
    }
}
