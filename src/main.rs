mod app;

use std::path::PathBuf;

use comtrade_view::{logging, JsonFileStore, ViewerConfig};

fn usage() -> ! {
    eprintln!("usage: comtrade-view [--config <viewer.yaml>] [merged.json]");
    std::process::exit(2);
}

fn storage_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".comtrade-view"))
        .unwrap_or_else(|| PathBuf::from(".comtrade-view"))
}

fn main() -> eframe::Result<()> {
    logging::init(logging::level_from_str(
        &std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
    ));

    let mut config_path: Option<PathBuf> = None;
    let mut initial: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => match args.next() {
                Some(p) => config_path = Some(PathBuf::from(p)),
                None => usage(),
            },
            "-h" | "--help" => usage(),
            _ if initial.is_none() => initial = Some(PathBuf::from(arg)),
            _ => usage(),
        }
    }

    let config = match config_path {
        Some(path) => ViewerConfig::load_from_path(&path).unwrap_or_else(|e| {
            tracing::error!("config {} not usable, using defaults: {e}", path.display());
            ViewerConfig::default()
        }),
        None => ViewerConfig::default(),
    };

    let dir = storage_dir();
    let storage = match JsonFileStore::new(&dir) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("store at {} unavailable ({e}); using the temp directory", dir.display());
            match JsonFileStore::new(std::env::temp_dir().join("comtrade-view")) {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("no writable settings directory: {e}");
                    std::process::exit(1);
                }
            }
        }
    };

    app::run(config, storage, initial)
}
