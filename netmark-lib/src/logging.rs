use std::fs::OpenOptions;
use std::io;
use std::path::Path;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

pub type FileFmtLayer =
    fmt::Layer<tracing_subscriber::Registry, fmt::format::DefaultFields, fmt::format::Format, BoxMakeWriter>;

pub type LogReloadHandle = reload::Handle<FileFmtLayer, tracing_subscriber::Registry>;

const DEFAULT_LOG_FILTER: &str = "info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

pub fn make_file_fmt_layer(log_path: &Path) -> Result<FileFmtLayer, io::Error> {
    let file = OpenOptions::new().create(true).append(true).open(log_path)?;
    Ok(fmt::layer().with_writer(BoxMakeWriter::new(file)).with_ansi(false))
}

/// Installs the file layer behind a reload handle so SIGHUP can swap in a
/// fresh layer after external rotation.
pub fn setup_log_file(layer: FileFmtLayer) -> LogReloadHandle {
    let (reload_layer, reload_handle): (reload::Layer<FileFmtLayer, tracing_subscriber::Registry>, LogReloadHandle) =
        reload::Layer::new(layer);
    tracing_subscriber::registry().with(reload_layer).with(env_filter()).init();
    reload_handle
}

pub fn setup_stdout() {
    tracing_subscriber::fmt().with_env_filter(env_filter()).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_layer_creates_the_log_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("netmark.log");
        let _layer = make_file_fmt_layer(&path)?;
        assert!(path.exists());
        Ok(())
    }

    #[test]
    fn missing_parent_directory_is_an_error() {
        let result = make_file_fmt_layer(Path::new("/nonexistent-dir-for-test/netmark.log"));
        assert!(result.is_err());
    }
}
