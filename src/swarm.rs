//! Torrent-mode orchestration: keeps the active peer count within bounds
//! by dialing known-but-inactive peers, and watches for whole-torrent
//! completion so the dispatcher's single exit condition still applies.
//!
//! Grounded in aria2's `TorrentMan`/`PeerChokeCommand` duo, which re-runs
//! this same "top up active peers, notice completion" housekeeping once
//! per cooperative turn rather than driving it from a one-shot command.

use std::time::Duration;

use mio::net::TcpStream;

use crate::cuid::Cuid;
use crate::engine::command::{Command, CommandBase, StepOutcome};
use crate::engine::DownloadEngine;
use crate::error::{DlError, DlResult};
use crate::peer::connection::PeerConnectionCommand;

/// Runs once per tick for the lifetime of a torrent download: dials
/// fresh peers while under the active-peer floor, and force-finishes the
/// segment manager once every piece is verified.
pub struct SwarmDriverCommand {
    base: CommandBase,
    my_id: [u8; 20],
    info_hash: [u8; 20],
}

impl SwarmDriverCommand {
    pub fn new(cuid: Cuid, my_id: [u8; 20], info_hash: [u8; 20], timeout: Duration) -> Self {
        Self {
            base: CommandBase::new(cuid, timeout),
            my_id,
            info_hash,
        }
    }

    fn dial_one(&mut self, engine: &mut DownloadEngine) -> DlResult<()> {
        let pieces = engine.pieces_mut()?;
        if !pieces.wants_more_active_peers() {
            return Ok(());
        }
        let Some(peer) = pieces.get_peer() else { return Ok(()) };
        let addr = peer.addr;
        let id = peer.id;

        // non-blocking connect: completion is observed as write-readiness
        // once `PeerConnectionCommand` registers the stream on its first step.
        let stream = TcpStream::connect(addr).map_err(|e| DlError::retry(format!("peer dial failed: {e}")))?;

        // mark active now that a command is about to reference this peer,
        // not after its handshake completes — otherwise `get_peer()` keeps
        // handing out the same still-connecting peer every tick and the
        // driver spawns a duplicate `PeerConnectionCommand` to it each
        // time. `PeerConnectionCommand::on_failure` deactivates it again
        // if the connection never completes.
        engine.pieces_mut()?.activate_peer(id);

        let next_cuid = engine.next_cuid();
        let command = PeerConnectionCommand::new(next_cuid, id, self.my_id, self.info_hash, stream, engine.conf.timeout);
        engine.push(Box::new(command));
        Ok(())
    }
}

impl Command for SwarmDriverCommand {
    fn base(&self) -> &CommandBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut CommandBase {
        &mut self.base
    }

    fn step(&mut self, engine: &mut DownloadEngine) -> DlResult<StepOutcome> {
        if let Ok(pieces) = engine.pieces_mut() {
            if pieces.has_all_pieces() {
                engine.segments.force_finish();
                return Ok(StepOutcome::Done);
            }
        }
        // dialing is best-effort: a single unreachable peer must not
        // abort the whole swarm driver.
        let _ = self.dial_one(engine);
        Ok(StepOutcome::Yield)
    }
}
