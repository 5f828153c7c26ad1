//! Dead-peer detection: read deadline, periodic probe and bounded writes.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use courier_shared::constants::{PING_INTERVAL_SECS, READ_DEADLINE_SECS, WRITE_DEADLINE_SECS};

use crate::error::TransportError;
use crate::transport::{Frame, FrameSink, FrameStream};

/// Per-session liveness timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Liveness {
    /// Period of the writer's probe, independent of other outbound traffic.
    pub ping_interval: Duration,
    /// Window in which some inbound frame must arrive.
    pub read_deadline: Duration,
    /// Upper bound on a single write.
    pub write_deadline: Duration,
}

impl Default for Liveness {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(PING_INTERVAL_SECS),
            read_deadline: Duration::from_secs(READ_DEADLINE_SECS),
            write_deadline: Duration::from_secs(WRITE_DEADLINE_SECS),
        }
    }
}

/// Sliding deadline for inbound traffic. Any frame, including a probe
/// acknowledgement, pushes it forward.
#[derive(Debug)]
pub struct ReadDeadline {
    window: Duration,
    deadline: Instant,
}

impl ReadDeadline {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: Instant::now() + window,
        }
    }

    pub fn refresh(&mut self) {
        self.deadline = Instant::now() + self.window;
    }

    /// Read the next frame. `Ok(None)` means the peer ended the stream.
    pub async fn read<S: FrameStream>(&self, stream: &mut S) -> Result<Option<Frame>, TransportError> {
        match time::timeout_at(self.deadline, stream.next()).await {
            Ok(Some(Ok(frame))) => Ok(Some(frame)),
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => Ok(None),
            Err(_) => Err(TransportError::ReadTimeout(self.window)),
        }
    }
}

/// Fires every period whether or not the writer has been busy. A peer that
/// only receives still gets probed, and its replies keep its read deadline
/// alive.
pub struct ProbeTimer {
    interval: Interval,
}

impl ProbeTimer {
    pub fn new(period: Duration) -> Self {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

pub fn probe_frame() -> Frame {
    Frame::Ping(Vec::new())
}

/// Send one frame, failing with [`TransportError::WriteTimeout`] if the
/// transport does not accept it within `limit`.
pub async fn write_with_deadline<S: FrameSink>(
    sink: &mut S,
    frame: Frame,
    limit: Duration,
) -> Result<(), TransportError> {
    match time::timeout(limit, sink.send(frame)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::WriteTimeout(limit)),
    }
}
