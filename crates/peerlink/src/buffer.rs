use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::ChannelError;
use crate::provider::Frame;

/// Outstanding bytes on the channel above which sends pause.
pub const MAX_BUFFERED_AMOUNT: usize = 8 * 1024 * 1024;
pub const RETRY_DELAY: Duration = Duration::from_millis(50);

/// The transmit side seen by the buffer.
pub trait FrameSink {
    fn is_open(&self) -> bool;
    fn buffered_amount(&self) -> usize;
    fn send(&self, frame: &Frame) -> Result<(), ChannelError>;
}

/// What the owner must do after a buffer operation.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Flush {
    /// Arm the retry timer; the buffer is throttled until `resume` runs.
    pub schedule_retry: bool,
    /// The channel rejected a write; the connection must close.
    pub fatal: Option<ChannelError>,
}

enum Attempt {
    Sent,
    Throttled,
    Rejected,
    Failed(ChannelError),
}

/// Ordered outbound queue with high-water-mark throttling.
#[derive(Debug)]
pub struct SendBuffer {
    queue: VecDeque<Frame>,
    throttled: bool,
    high_water_mark: usize,
}

impl Default for SendBuffer {
    fn default() -> Self {
        Self::new(MAX_BUFFERED_AMOUNT)
    }
}

impl SendBuffer {
    pub fn new(high_water_mark: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            throttled: false,
            high_water_mark,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Send now when possible, otherwise append to the tail.
    pub fn buffered_send(&mut self, frame: Frame, sink: &dyn FrameSink) -> Flush {
        let mut flush = Flush::default();
        if self.throttled {
            self.queue.push_back(frame);
            return flush;
        }
        // Frames can still be queued here when an earlier send hit a closed
        // sink. This one goes out directly, ahead of them.
        match try_send(&frame, sink, self.high_water_mark, &mut self.throttled) {
            Attempt::Sent => {}
            Attempt::Throttled => {
                flush.schedule_retry = true;
                self.queue.push_back(frame);
            }
            Attempt::Rejected => self.queue.push_back(frame),
            Attempt::Failed(err) => {
                flush.fatal = Some(err);
                self.queue.push_back(frame);
            }
        }
        flush
    }

    /// Retry timer fired: lift the throttle and drain from the head.
    pub fn resume(&mut self, sink: &dyn FrameSink) -> Flush {
        self.throttled = false;
        self.drain(sink)
    }

    /// Send queued frames head first, stopping at the first one that does not go out.
    pub fn drain(&mut self, sink: &dyn FrameSink) -> Flush {
        let mut flush = Flush::default();
        if !sink.is_open() {
            return flush;
        }
        while let Some(head) = self.queue.front() {
            match try_send(head, sink, self.high_water_mark, &mut self.throttled) {
                Attempt::Sent => {
                    self.queue.pop_front();
                    trace!(target: "peerlink::buffer", remaining = self.queue.len(), "drained frame");
                }
                Attempt::Throttled => {
                    flush.schedule_retry = true;
                    break;
                }
                Attempt::Rejected => break,
                Attempt::Failed(err) => {
                    flush.fatal = Some(err);
                    break;
                }
            }
        }
        flush
    }
}

fn try_send(
    frame: &Frame,
    sink: &dyn FrameSink,
    high_water_mark: usize,
    throttled: &mut bool,
) -> Attempt {
    if !sink.is_open() {
        return Attempt::Rejected;
    }
    let buffered = sink.buffered_amount();
    if buffered > high_water_mark {
        debug!(
            target: "peerlink::buffer",
            buffered,
            high_water_mark,
            "channel backpressure; pausing sends"
        );
        *throttled = true;
        return Attempt::Throttled;
    }
    match sink.send(frame) {
        Ok(()) => Attempt::Sent,
        Err(err) => {
            *throttled = true;
            Attempt::Failed(err)
        }
    }
}
