//! Tails every matching file in a set of directories, printing each line.
//!
//! Usage:
//!     tail <dir-glob> [file-glob] [status-file]
//!
//! Logging is controlled through `RUST_LOG`, e.g. `RUST_LOG=linetrack=debug`.

use std::path::Path;

use tracing_subscriber::EnvFilter;

use linetrack::{Config, Tailer};

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let mut config = Config::new(args.next().unwrap_or_else(|| ".".to_string()));
    if let Some(file_pattern) = args.next() {
        config = config.with_file_pattern(file_pattern);
    }
    if let Some(status_file) = args.next() {
        config = config.with_status_file(status_file);
    }

    let tailer = Tailer::new(config)?;
    let sink = |source: &Path, line: &[u8]| {
        print!("({}) {}", source.display(), String::from_utf8_lossy(line));
    };

    tailer
        .run(sink, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
