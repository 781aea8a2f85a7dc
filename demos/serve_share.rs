//! Share server example
//!
//! Registers a remote file and serves it through the range proxy, so any
//! HTTP client (a media player, curl) can stream it while it downloads.
//!
//! Usage: cargo run --example serve_share -- <url> [listen-addr]

use gosh_share::{FileDescriptor, FileHash, ShareConfig, ShareEvent, ShareManager};
use sha1::{Digest, Sha1};
use std::env;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gosh_share=debug")),
        )
        .init();

    let url = env::args()
        .nth(1)
        .unwrap_or_else(|| "https://httpbin.org/bytes/4096".to_string());
    let addr = env::args()
        .nth(2)
        .unwrap_or_else(|| "127.0.0.1:8080".to_string());

    let manager = ShareManager::new(ShareConfig::default()).await?;

    // Without a published hash the URL itself keys the share
    let name = url.rsplit('/').next().unwrap_or("download").to_string();
    let file = FileDescriptor::new(name).with_hash(FileHash::sha1(Sha1::digest(url.as_bytes()).to_vec()));
    let id = manager.register_source(&file, None, &[url.clone()])?;

    let server = manager.serve(addr.as_str()).await?;
    let prefix = &manager.config().proxy.path_prefix;
    println!("Serving {url}");
    println!("  at http://{}{prefix}{id}", server.local_addr());
    println!("Press Ctrl-C to stop");

    let mut events = manager.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ShareEvent::Progress { progress, .. }) => {
                    if let Some(pct) = progress.percentage() {
                        println!("{pct:.1}% ({} bytes)", progress.transferred);
                    }
                }
                Ok(event) => println!("{event:?}"),
                Err(e) => {
                    eprintln!("Event error: {e}");
                    break;
                }
            },
        }
    }

    manager.shutdown();
    server.shutdown().await;
    Ok(())
}
