//! The download engine: owns the command deque, the segment manager,
//! the optional peer/piece manager (swarm mode), and the socket
//! multiplexer every command shares.

pub mod command;
pub mod dispatcher;
pub mod socket;

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::conf::Conf;
use crate::cuid::CuidCounter;
use crate::disk::DiskAdaptor;
use crate::error::{DlError, DlResult};
use crate::piece_manager::PieceManager;
use crate::segment::SegmentManager;
use command::Command;
use socket::SocketMultiplexer;

/// The process-wide halt flag a signal handler publishes into; the
/// dispatcher observes it between ticks. Replaces a global
/// request-info pointer with an atomic boolean shareable across the
/// (single) engine thread and the signal handler.
pub type HaltFlag = Arc<AtomicBool>;

pub struct DownloadEngine {
    pub conf: Conf,
    pub segments: SegmentManager,
    pub pieces: Option<PieceManager>,
    pub disk: DiskAdaptor,
    pub cuids: CuidCounter,
    pub sockets: SocketMultiplexer,
    pub commands: VecDeque<Box<dyn Command>>,
    pub delayed: Vec<(Instant, Box<dyn Command>)>,
    halt: HaltFlag,
}

impl DownloadEngine {
    pub fn new(
        conf: Conf,
        segments: SegmentManager,
        pieces: Option<PieceManager>,
        disk: DiskAdaptor,
    ) -> io::Result<Self> {
        Ok(Self {
            conf,
            segments,
            pieces,
            disk,
            cuids: CuidCounter::new(),
            sockets: SocketMultiplexer::new()?,
            commands: VecDeque::new(),
            delayed: Vec::new(),
            halt: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn push(&mut self, command: Box<dyn Command>) {
        self.commands.push_back(command);
    }

    pub fn delay(&mut self, at: Instant, command: Box<dyn Command>) {
        self.delayed.push((at, command));
    }

    pub fn is_halted(&self) -> bool {
        self.halt.load(Ordering::SeqCst)
    }

    pub fn halt(&self) {
        self.halt.store(true, Ordering::SeqCst);
    }

    /// A clone of the halt flag, to be installed into a signal handler.
    pub fn halt_handle(&self) -> HaltFlag {
        Arc::clone(&self.halt)
    }

    pub fn next_cuid(&mut self) -> crate::cuid::Cuid {
        self.cuids.next()
    }

    /// Swarm-mode commands only run when the engine was built in swarm
    /// mode, so `pieces` is always populated for them; this turns the
    /// `None` case into an abort instead of a panic.
    pub fn pieces_mut(&mut self) -> DlResult<&mut PieceManager> {
        self.pieces
            .as_mut()
            .ok_or_else(|| DlError::abort("peer command running without a piece manager"))
    }
}
