//! The `Command` trait and its shared bookkeeping, replacing
//! `AbstractCommand`'s virtual-dispatch base class with composition: every
//! concrete command embeds a `CommandBase` and implements `step`.

use std::time::{Duration, Instant};

use mio::Token;

use crate::cuid::Cuid;
use crate::engine::DownloadEngine;
use crate::error::DlResult;
use crate::request::Request;

/// What a command's execution step produced this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The command finished; the dispatcher drops it and its interests.
    Done,
    /// The command re-queued itself or spawned a successor; the
    /// dispatcher moves on without inspecting it further this tick.
    Yield,
}

/// Which readiness conditions a command is currently waiting on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interests {
    pub read: bool,
    pub write: bool,
    pub resolver: bool,
}

impl Interests {
    pub fn any(&self) -> bool {
        self.read || self.write || self.resolver
    }

    pub fn none() -> Self {
        Self::default()
    }
}

/// Fields every command carries: identity, the request it drives (if
/// any), its registered interests and socket token, and the
/// timeout/progress timestamp used to raise a retry when nothing fires
/// for too long.
pub struct CommandBase {
    pub cuid: Cuid,
    pub request: Option<Request>,
    pub interests: Interests,
    pub token: Option<Token>,
    pub timeout: Duration,
    pub checkpoint: Instant,
}

impl CommandBase {
    pub fn new(cuid: Cuid, timeout: Duration) -> Self {
        Self {
            cuid,
            request: None,
            interests: Interests::none(),
            token: None,
            timeout,
            checkpoint: Instant::now(),
        }
    }

    pub fn with_request(cuid: Cuid, request: Request, timeout: Duration) -> Self {
        Self {
            request: Some(request),
            ..Self::new(cuid, timeout)
        }
    }

    /// Resets the progress timestamp; called whenever a registered
    /// interest actually fires.
    pub fn reset_checkpoint(&mut self) {
        self.checkpoint = Instant::now();
    }

    pub fn timed_out(&self) -> bool {
        self.interests.any() && self.checkpoint.elapsed() >= self.timeout
    }

    /// True iff the step is allowed to run this tick: either it has no
    /// registered interest (fresh command, always eligible), or at least
    /// one of its registered interests fired.
    pub fn eligible(&self, readable: bool, writable: bool, resolver_done: bool) -> bool {
        if !self.interests.any() {
            return true;
        }
        (self.interests.read && readable)
            || (self.interests.write && writable)
            || (self.interests.resolver && resolver_done)
    }
}

/// A resumable unit of work driven by the dispatcher.
pub trait Command {
    fn base(&self) -> &CommandBase;
    fn base_mut(&mut self) -> &mut CommandBase;

    /// Advances the command by one step. Invoked only when the dispatcher
    /// has determined the command is eligible to run this tick (see
    /// `CommandBase::eligible`). Must not block.
    fn step(&mut self, engine: &mut DownloadEngine) -> DlResult<StepOutcome>;

    fn cuid(&self) -> Cuid {
        self.base().cuid
    }

    /// Invoked by the dispatcher when a step raises an abort-class error,
    /// or a retry-class error that has exhausted `max_tries`: release any
    /// segment/piece held, deactivate the peer, drop the socket
    /// registration. Default does nothing.
    fn on_failure(&mut self, _engine: &mut DownloadEngine) {}

    /// Invoked by the dispatcher when a step raises a retry-class error
    /// that is still under `max_tries`, before the command is re-queued
    /// after `retry_wait`: drop the dead socket/registration and any
    /// in-flight protocol state, and rewind to the command's initial
    /// phase so the next run opens a fresh connection. Default does
    /// nothing (commands with no connection state, like the swarm
    /// driver, have nothing to rewind).
    fn reset_for_retry(&mut self, _engine: &mut DownloadEngine) {}

    /// Invoked by the dispatcher's abort path when the segment manager
    /// has a reserved fallback request queued: the command should
    /// enqueue a fresh replacement for it. Default does nothing — only
    /// segment transfers use the reserved-request fallback.
    fn spawn_reserved(&self, _engine: &mut DownloadEngine, _request: Request) {}
}
