//! # Idle Detection
//!
//! Raises [`ChannelEvent::AllIdle`] when a channel saw neither a read nor a write for a
//! whole window.
//!
//! The detector does not poll. It arms one timer for the window; on expiry it measures
//! the time since the last activity. If the full window passed, the channel is idle and
//! the timer is re-armed for another window; otherwise the timer is re-armed for the
//! remaining slack only.
//!
//! [`IdleTimeoutDetector`] holds the arithmetic and works on explicit instants, so it can
//! be tested without a runtime. [`IdleStateHandler`] wires it into a pipeline.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::Result;
use crate::pipeline::{
    ChannelEvent, ChannelHandler, Frame, HandlerContext, InboundHandler, OutboundHandler, TimerSink,
};
use crate::utils::metrics::global_metrics;

/// Lifecycle of a detector. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    Uninitialized,
    Initialized,
    Destroyed,
}

/// Outcome of a timer expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleCheck {
    pub idle: bool,
    /// When to check again.
    pub next_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct IdleTimeoutDetector {
    window: Duration,
    state: IdleState,
    last_read: Instant,
    last_write: Instant,
}

impl IdleTimeoutDetector {
    pub fn new(window: Duration) -> Self {
        let now = Instant::now();
        Self {
            window,
            state: IdleState::Uninitialized,
            last_read: now,
            last_write: now,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn state(&self) -> IdleState {
        self.state
    }

    /// Starts detection at `now` and returns the first timer delay. `None` if already
    /// initialized or destroyed, or if the window is zero (detection disabled).
    pub fn initialize(&mut self, now: Instant) -> Option<Duration> {
        if self.state != IdleState::Uninitialized {
            return None;
        }
        self.state = IdleState::Initialized;
        self.last_read = now;
        self.last_write = now;
        if self.window.is_zero() {
            None
        } else {
            Some(self.window)
        }
    }

    pub fn record_read(&mut self, now: Instant) {
        self.last_read = now;
    }

    pub fn record_write(&mut self, now: Instant) {
        self.last_write = now;
    }

    /// Evaluates a timer expiry at `now`. `None` unless initialized.
    pub fn on_timeout(&mut self, now: Instant) -> Option<IdleCheck> {
        if self.state != IdleState::Initialized {
            return None;
        }
        let last_activity = self.last_read.max(self.last_write);
        let elapsed = now.saturating_duration_since(last_activity);
        if elapsed >= self.window {
            Some(IdleCheck {
                idle: true,
                next_delay: self.window,
            })
        } else {
            Some(IdleCheck {
                idle: false,
                next_delay: self.window - elapsed,
            })
        }
    }

    pub fn destroy(&mut self) {
        self.state = IdleState::Destroyed;
    }
}

/// A cancellable one-shot timer. Arming replaces the previous timer.
#[derive(Debug, Default)]
pub struct IdleTimer {
    handle: Option<JoinHandle<()>>,
}

impl IdleTimer {
    /// Fires `sink` after `delay`. Without a tokio runtime nothing is armed.
    pub fn arm(&mut self, delay: Duration, sink: TimerSink) {
        self.cancel();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                self.handle = Some(runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    sink.fire();
                }));
            }
            Err(_) => trace!("No runtime, idle timer not armed"),
        }
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Pipeline handler around [`IdleTimeoutDetector`].
#[derive(Debug)]
pub struct IdleStateHandler {
    detector: IdleTimeoutDetector,
    timer: IdleTimer,
}

impl IdleStateHandler {
    pub fn new(window: Duration) -> Self {
        Self {
            detector: IdleTimeoutDetector::new(window),
            timer: IdleTimer::default(),
        }
    }

    pub fn state(&self) -> IdleState {
        self.detector.state()
    }

    fn initialize(&mut self, ctx: &mut HandlerContext<'_>) {
        if let Some(delay) = self.detector.initialize(Instant::now()) {
            self.schedule(ctx, delay);
        }
    }

    fn schedule(&mut self, ctx: &mut HandlerContext<'_>, delay: Duration) {
        match ctx.timer_sink() {
            Some(sink) => self.timer.arm(delay, sink),
            None => trace!("Channel has no timer support"),
        }
    }

    fn destroy(&mut self) {
        self.detector.destroy();
        self.timer.cancel();
    }
}

impl ChannelHandler for IdleStateHandler {
    fn handler_added(&mut self, ctx: &mut HandlerContext<'_>) -> Result<()> {
        if ctx.channel().is_active() {
            self.initialize(ctx);
        }
        Ok(())
    }

    fn handler_removed(&mut self, _ctx: &mut HandlerContext<'_>) -> Result<()> {
        self.destroy();
        Ok(())
    }

    fn channel_active(&mut self, ctx: &mut HandlerContext<'_>) -> Result<()> {
        self.initialize(ctx);
        Ok(())
    }

    fn channel_inactive(&mut self, _ctx: &mut HandlerContext<'_>) -> Result<()> {
        self.destroy();
        Ok(())
    }

    fn on_timer(&mut self, ctx: &mut HandlerContext<'_>) -> Result<()> {
        let Some(check) = self.detector.on_timeout(Instant::now()) else {
            return Ok(());
        };
        self.schedule(ctx, check.next_delay);
        if check.idle {
            debug!(
                window_ms = self.detector.window().as_millis() as u64,
                remote = ?ctx.channel().remote,
                "Channel idle"
            );
            global_metrics().idle_event();
            ctx.fire_user_event(ChannelEvent::AllIdle);
        }
        Ok(())
    }

    fn create_new_instance(&self) -> Box<dyn ChannelHandler> {
        Box::new(IdleStateHandler::new(self.detector.window()))
    }

    fn as_inbound(&mut self) -> Option<&mut dyn InboundHandler> {
        Some(self)
    }

    fn as_outbound(&mut self) -> Option<&mut dyn OutboundHandler> {
        Some(self)
    }
}

impl InboundHandler for IdleStateHandler {
    fn read(&mut self, _ctx: &mut HandlerContext<'_>, frame: Frame) -> Result<Option<Frame>> {
        self.detector.record_read(Instant::now());
        Ok(Some(frame))
    }
}

impl OutboundHandler for IdleStateHandler {
    fn write(&mut self, _ctx: &mut HandlerContext<'_>, frame: Frame) -> Result<Frame> {
        self.detector.record_write(Instant::now());
        Ok(frame)
    }
}
