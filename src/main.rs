use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use rand::Rng;
use url::Url;

use swarmget::cli::Cli;
use swarmget::disk::DiskAdaptor;
use swarmget::engine::{dispatcher, DownloadEngine};
use swarmget::http::commands::HttpTransferCommand;
use swarmget::logging;
use swarmget::metainfo::Metainfo;
use swarmget::piece::Piece;
use swarmget::piece_manager::PieceManager;
use swarmget::request::{ProtocolHint, Request};
use swarmget::segment::SegmentManager;
use swarmget::sidecar::{sidecar_path, SidecarState, UsedPieceRecord};
use swarmget::swarm::SwarmDriverCommand;
use swarmget::tracker::http::{AnnounceCommand, AnnounceRequest};
use swarmget::tracker::udp::UdpTrackerCommand;

fn generate_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    rand::thread_rng().fill(&mut id);
    id[..8].copy_from_slice(b"-SG0001-");
    id
}

/// Issues a blocking HEAD request to learn the target's length before any
/// segment can be carved out. Run once, before the dispatcher exists, so
/// it isn't bound by the cooperative no-blocking-in-a-step rule.
fn probe_content_length(url: &Url) -> Result<u64> {
    let host = url.host_str().ok_or_else(|| anyhow!("url has no host"))?;
    let port = url.port_or_known_default().unwrap_or(80);
    let mut stream = TcpStream::connect((host, port)).context("connecting to probe content length")?;
    let path = if url.path().is_empty() { "/" } else { url.path() };
    let request = format!("HEAD {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes())?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;

    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut header_storage);
    parsed.parse(&response).context("parsing HEAD response")?;
    let status = parsed.code.unwrap_or(0);
    if status >= 400 {
        return Err(anyhow!("HEAD request returned status {status}"));
    }
    parsed
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or_else(|| anyhow!("server response had no Content-Length header"))
}

fn run_http(cli: &Cli, url_str: &str) -> Result<()> {
    let conf = cli.to_conf();
    let url = Url::parse(url_str).context("parsing --url")?;
    let output_path = PathBuf::from(&cli.out);
    let sidecar = sidecar_path(&output_path);

    let (segments, total_length) = if sidecar.exists() {
        let state = SidecarState::load(&sidecar).context("loading resume sidecar")?;
        log::info!("resuming {} bytes across {} segments", state.total_length, state.segments.len());
        (SegmentManager::from_segments(state.segments), state.total_length)
    } else {
        let total_length = probe_content_length(&url)?;
        (SegmentManager::new(total_length, conf.split), total_length)
    };

    let disk = DiskAdaptor::from_single_file(&output_path, total_length)?;
    let mut engine = DownloadEngine::new(conf.clone(), segments, None, disk)?;

    for _ in 0..conf.split {
        let cuid = engine.next_cuid();
        let request = Request::new(url.clone(), ProtocolHint::RequestResponse);
        engine.push(Box::new(HttpTransferCommand::new(cuid, request, conf.timeout)));
    }

    let halt = engine.halt_handle();
    dispatcher::run(&mut engine).map_err(|e| anyhow!("download failed: {e}"))?;

    if engine.segments.finished() {
        let _ = std::fs::remove_file(&sidecar);
        println!("download complete: {}", output_path.display());
    } else if halt.load(std::sync::atomic::Ordering::SeqCst) {
        let state = SidecarState {
            total_length,
            segments: engine.segments.segments().to_vec(),
            swarm_bitfield: None,
            used_pieces: Vec::new(),
        };
        state.save(&sidecar).context("saving resume sidecar")?;
        println!("halted, progress saved to {}", sidecar.display());
    } else {
        println!("download stalled after exhausting retries ({} errors)", engine.segments.errors());
    }
    Ok(())
}

fn run_torrent(cli: &Cli, file: &str) -> Result<()> {
    let conf = cli.to_conf();
    let metainfo = Metainfo::from_file(file).context("parsing torrent metainfo")?;
    let output_dir = PathBuf::from(&cli.out);
    let disk = DiskAdaptor::from_metainfo(&metainfo, &output_dir)?;
    let sidecar = sidecar_path(&output_dir);

    let mut pieces = PieceManager::new(metainfo.piece_hashes(), metainfo.piece_length(), metainfo.length());
    if sidecar.exists() {
        let state = SidecarState::load(&sidecar).context("loading resume sidecar")?;
        log::info!("resuming torrent: {} used pieces restored", state.used_pieces.len());
        if let Some(bitfield) = state.swarm_bitfield {
            pieces.set_bitfield(bitfield);
        }
        for record in state.used_pieces {
            let length = pieces.piece_length(record.index);
            pieces.restore_used_piece(Piece::from_saved(record.index, length, record.num_blocks, record.block_bitfield));
        }
    }

    let segments = SegmentManager::new(metainfo.length(), 1);
    let mut engine = DownloadEngine::new(conf.clone(), segments, Some(pieces), disk)?;

    let my_id = generate_peer_id();
    let info_hash = metainfo.info_hash();

    for announce_url in metainfo.announce_urls() {
        let Ok(url) = Url::parse(&announce_url) else { continue };
        let cuid = engine.next_cuid();
        match url.scheme() {
            "udp" => {
                if let Ok(command) = UdpTrackerCommand::new(cuid, &url, info_hash, my_id, conf.listen_port, metainfo.length(), conf.timeout) {
                    engine.push(Box::new(command));
                }
            }
            "http" | "https" => {
                let request = AnnounceRequest {
                    info_hash,
                    peer_id: my_id,
                    port: conf.listen_port,
                    uploaded: Some(0),
                    downloaded: Some(0),
                    left: Some(metainfo.length()),
                    compact: Some(1),
                    no_peer_id: None,
                    event: Some("started".to_string()),
                    ip: None,
                    numwant: Some(50),
                    key: None,
                    trackerid: None,
                };
                if let Ok(command) = AnnounceCommand::new(cuid, &url, &request, conf.timeout) {
                    engine.push(Box::new(command));
                }
            }
            _ => {}
        }
    }

    let driver_cuid = engine.next_cuid();
    engine.push(Box::new(SwarmDriverCommand::new(driver_cuid, my_id, info_hash, conf.timeout)));

    let halt = engine.halt_handle();
    dispatcher::run(&mut engine).map_err(|e| anyhow!("swarm download failed: {e}"))?;

    if engine.segments.finished() {
        let _ = std::fs::remove_file(&sidecar);
        println!("torrent complete: {}", output_dir.display());
    } else if halt.load(std::sync::atomic::Ordering::SeqCst) {
        let pieces = engine
            .pieces_mut()
            .map_err(|e| anyhow!("torrent mode lost its piece manager: {e}"))?;
        let state = SidecarState {
            total_length: metainfo.length(),
            segments: Vec::new(),
            swarm_bitfield: Some(pieces.local_bitfield().clone()),
            used_pieces: pieces
                .used_pieces()
                .iter()
                .map(|p| UsedPieceRecord {
                    index: p.index,
                    block_bitfield: p.block_bitfield_bytes(),
                    num_blocks: p.num_blocks(),
                })
                .collect(),
        };
        state.save(&sidecar).context("saving resume sidecar")?;
        println!("halted, progress saved to {}", sidecar.display());
    } else {
        println!("swarm halted before every piece was verified ({} errors)", engine.segments.errors());
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    match (&cli.url, &cli.file) {
        (Some(url), None) => run_http(&cli, url),
        (None, Some(file)) => run_torrent(&cli, file),
        (Some(_), Some(_)) => Err(anyhow!("--url and --file are mutually exclusive")),
        (None, None) => Err(anyhow!("one of --url or --file is required")),
    }
}
