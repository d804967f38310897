//! Thin CLI wiring around the core: a `download` subcommand that drives
//! the coordinator to completion and a `seed` subcommand that runs the
//! upload server against an on-disk source. Neither subcommand is part
//! of the tested core surface — see SPEC_FULL.md's "out of scope"
//! collaborators (terminal menu, CLI argument surface).

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use swarmcore::active::{ActiveUpload, ActiveUploads};
use swarmcore::coordinator::{DownloadCoordinator, PeerInfo};
use swarmcore::piece_store::PieceStore;
use swarmcore::torrent::Metainfo;
use swarmcore::tracker::http::{self, AnnounceEvent, AnnounceParams};
use swarmcore::upload_server::UploadServer;
use swarmcore::utils::generate_peer_id;

#[derive(Parser)]
#[command(version, about = "A minimal BitTorrent-style peer client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download the content described by a .torrent file.
    Download {
        /// Path to the .torrent file.
        file: PathBuf,
        /// Directory to write the completed content to.
        #[arg(short, long)]
        out: PathBuf,
        /// Port advertised to the tracker (this client does not accept
        /// inbound connections while downloading).
        #[arg(short, long, default_value_t = 6881)]
        port: u16,
    },
    /// Seed the content described by a .torrent file from a source path
    /// already on disk.
    Seed {
        /// Path to the .torrent file.
        file: PathBuf,
        /// Path to the already-downloaded file (single-file torrents) or
        /// directory tree (multi-file torrents) to serve from.
        source: PathBuf,
        /// Port to listen for incoming peer connections on.
        #[arg(short, long, default_value_t = 6881)]
        port: u16,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Download { file, out, port } => run_download(&file, &out, port),
        Command::Seed { file, source, port } => run_seed(&file, &source, port),
    }
}

fn run_download(file: &PathBuf, out: &PathBuf, port: u16) -> Result<()> {
    let metainfo = Metainfo::from_path(file).with_context(|| format!("reading {}", file.display()))?;
    let peer_id = generate_peer_id();
    let tracker_url = metainfo
        .announce
        .clone()
        .context("torrent file has no announce URL")?;

    log::info!("downloading {} ({} pieces)", metainfo.name, metainfo.piece_count());

    let started = http::announce(
        &tracker_url,
        &AnnounceParams {
            info_hash: metainfo.infohash,
            peer_id,
            ip: None,
            port,
            uploaded: 0,
            downloaded: 0,
            left: metainfo.total_size,
            numwant: Some(50),
            event: AnnounceEvent::Started,
        },
    )
    .context("initial tracker announce failed")?;

    let peers: Vec<PeerInfo> = started
        .peers
        .iter()
        .map(|p| PeerInfo { ip: p.ip, port: p.port, peer_id: p.peer_id })
        .collect();
    if peers.is_empty() {
        bail!("tracker returned no peers");
    }

    let store = Arc::new(PieceStore::new(metainfo.clone()));
    let coordinator = DownloadCoordinator::new(metainfo.clone(), peer_id, store.clone());
    let report = coordinator.download(&peers, out);

    let left = metainfo.piece_size.saturating_mul(store.remaining() as u64);
    let event = if report.is_ok() { AnnounceEvent::Completed } else { AnnounceEvent::Stopped };
    let _ = http::announce(
        &tracker_url,
        &AnnounceParams {
            info_hash: metainfo.infohash,
            peer_id,
            ip: None,
            port,
            uploaded: 0,
            downloaded: metainfo.total_size.saturating_sub(left),
            left,
            numwant: None,
            event,
        },
    );

    match report {
        Ok(outcome) => {
            log::info!("download finished: {outcome:?}");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn run_seed(file: &PathBuf, source: &PathBuf, port: u16) -> Result<()> {
    let metainfo = Metainfo::from_path(file).with_context(|| format!("reading {}", file.display()))?;
    let peer_id = generate_peer_id();
    let store = Arc::new(
        PieceStore::from_existing_file(metainfo.clone(), source)
            .with_context(|| format!("hashing source data at {}", source.display()))?,
    );

    let uploads = Arc::new(ActiveUploads::new());
    uploads.insert(Arc::new(ActiveUpload::new(metainfo.clone(), store)))?;

    if let Some(tracker_url) = &metainfo.announce {
        let _ = http::announce(
            tracker_url,
            &AnnounceParams {
                info_hash: metainfo.infohash,
                peer_id,
                ip: None::<IpAddr>,
                port,
                uploaded: 0,
                downloaded: metainfo.total_size,
                left: 0,
                numwant: Some(0),
                event: AnnounceEvent::Started,
            },
        );
    }

    log::info!("seeding {} on port {port}", metainfo.name);
    let server = UploadServer::new(peer_id, uploads);
    let (_stop_tx, stop_rx) = crossbeam::channel::bounded(1);
    server
        .run(std::net::SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), port), stop_rx)
        .map_err(|e| anyhow::anyhow!("upload server failed: {e}"))
}
