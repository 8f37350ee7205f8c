//! The cooperative single-thread tick loop.
//!
//! Ownership note: the original design lets a command push itself back
//! onto the queue from inside its own execution step (it holds a
//! reference-counted handle to itself). Rust's ownership rules don't
//! allow a `&mut self` method to move its own box into a collection, so
//! here the dispatcher takes ownership of each command for the duration
//! of its step and re-queues it itself on `Yield`; a command that wants a
//! successor queued instead pushes that successor via `engine.push(..)`
//! during `step` and returns `Done` for itself.

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::engine::command::StepOutcome;
use crate::engine::DownloadEngine;
use crate::error::DlError;

const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Runs ticks until the segment manager reports the download finished,
/// the halt flag is set, or the queue and delayed list are both empty
/// with no commands left to drive. Returns an error only for a `Fatal`
/// condition raised by some command's step.
pub fn run(engine: &mut DownloadEngine) -> Result<(), DlError> {
    loop {
        if engine.segments.finished() || engine.is_halted() {
            break;
        }
        if engine.commands.is_empty() && engine.delayed.is_empty() {
            break;
        }
        tick(engine)?;
    }
    Ok(())
}

fn tick(engine: &mut DownloadEngine) -> Result<(), DlError> {
    engine
        .sockets
        .poll(POLL_TIMEOUT)
        .map_err(|e| DlError::fatal(format!("socket multiplexer poll failed: {e}")))?;

    // advance delayed commands whose wait has expired
    let now = Instant::now();
    let ready_delayed: Vec<_> = engine
        .delayed
        .iter()
        .enumerate()
        .filter(|(_, (at, _))| *at <= now)
        .map(|(i, _)| i)
        .collect();
    for &i in ready_delayed.iter().rev() {
        let (_, command) = engine.delayed.remove(i);
        engine.commands.push_back(command);
    }

    let batch: Vec<_> = engine.commands.drain(..).collect();
    for mut command in batch {
        let token = command.base().token;
        let (readable, writable) = match token {
            Some(t) => (engine.sockets.is_readable(t), engine.sockets.is_writable(t)),
            None => (false, false),
        };
        // name-resolver completion is always synchronous in this crate
        // (see DESIGN.md's Open Question decision), so there is never a
        // pending resolver interest to observe here.
        let resolver_done = false;

        if !command.base().eligible(readable, writable, resolver_done) {
            if command.base().timed_out() {
                handle_error(engine, command, DlError::retry("command timed out waiting for I/O"));
                continue;
            }
            engine.commands.push_back(command);
            continue;
        }
        if readable || writable || resolver_done {
            command.base_mut().reset_checkpoint();
        }

        match command.step(engine) {
            Ok(StepOutcome::Done) => {
                debug!("command {} completed", command.cuid());
            }
            Ok(StepOutcome::Yield) => {
                engine.commands.push_back(command);
            }
            Err(err) => handle_error(engine, command, err),
        }
    }
    Ok(())
}

fn handle_error(engine: &mut DownloadEngine, mut command: Box<dyn crate::engine::command::Command>, err: DlError) {
    match err {
        DlError::Fatal(reason) => {
            warn!("command {} raised fatal error: {reason}", command.cuid());
            engine.halt();
        }
        DlError::Retry(reason) => {
            let try_count = command.base_mut().request.as_mut().map(|r| {
                r.add_try_count();
                r.try_count()
            });
            let under_budget = try_count.map(|n| n < engine.conf.max_tries).unwrap_or(false);
            if under_budget {
                debug!("command {} retrying after: {reason}", command.cuid());
                let at = Instant::now() + engine.conf.retry_wait;
                command.reset_for_retry(engine);
                command.base_mut().interests = crate::engine::command::Interests::none();
                engine.delay(at, command);
            } else {
                warn!("command {} exhausted retries, aborting: {reason}", command.cuid());
                abort(engine, command);
            }
        }
        DlError::Abort(reason) => {
            warn!("command {} aborted: {reason}", command.cuid());
            abort(engine, command);
        }
    }
}

fn abort(engine: &mut DownloadEngine, mut command: Box<dyn crate::engine::command::Command>) {
    command.on_failure(engine);
    engine.segments.add_error();
    if let Some(request) = engine.segments.pop_reserved() {
        command.spawn_reserved(engine, request);
    }
}
