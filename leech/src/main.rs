use std::path::PathBuf;
use leech::{Config, FileStore, MetaInfo, Torrent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {

    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        eprintln!("usage: leech <file.torrent> [output dir]");
        std::process::exit(2);
    };

    let mut config = Config::default();
    if let Some(dir) = args.next() {
        config.dir = PathBuf::from(dir);
    }

    // Set up logging.
    let format = tracing_subscriber::fmt::format();
    let sub = tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .event_format(format)
        .finish();
    tracing::subscriber::set_global_default(sub)?;

    let metainfo = MetaInfo::new(&path).map_err(|e| {
        tracing::error!("failed to load {}: {}", path, e);
        e
    })?;
    tracing::info!(
        "{} ({}, {} pieces, info hash {})",
        metainfo.name(),
        metainfo.size_fmt(),
        metainfo.num_pieces(),
        metainfo.info_hash_hex(),
    );

    let store = FileStore::new(&config.dir, &metainfo);
    let mut torrent = Torrent::new(&metainfo, config, Box::new(store));

    let handle = torrent.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.stop().ok();
        }
    });

    torrent.start_download().await?;
    let stats = torrent.stats();
    tracing::info!("finished at {:.1}%", stats.percentage);
    Ok(())
}
