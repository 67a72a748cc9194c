use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};

use tracing_subscriber::{EnvFilter, filter::LevelFilter, prelude::*};

use crate::settings::LogFormat;

static INIT: Once = Once::new();

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Path of the run log written into `log_dir`.
pub fn run_log_path(log_dir: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    log_dir.join(format!("faultline-{stamp}.log"))
}

/// Initialize tracing once based on config and environment:
/// - stderr gets the fmt layer, filtered by `RUST_LOG` (default `info`)
/// - if `log_file` is given, the full debug-level run log is also written there
///
/// The `log_format` parameter controls whether logs are output as human-readable
/// text (default) or structured JSON.
pub fn init(log_format: LogFormat, log_file: Option<&Path>) -> anyhow::Result<()> {
    let mut init_result: Option<anyhow::Result<()>> = None;
    INIT.call_once(|| {
        let result = {
            let env_filter = build_env_filter();

            match log_format {
                LogFormat::Text => {
                    let fmt_layer = tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .with_level(true)
                        .with_writer(std::io::stderr)
                        .compact()
                        .with_filter(env_filter);
                    init_with_fmt_layer(fmt_layer, log_file)
                }
                LogFormat::Json => {
                    let fmt_layer = tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .with_level(true)
                        .with_writer(std::io::stderr)
                        .json()
                        .with_filter(env_filter);
                    init_with_fmt_layer(fmt_layer, log_file)
                }
            }
        };
        init_result = Some(result);
    });
    if let Some(res) = init_result {
        res
    } else {
        Ok(())
    }
}

fn init_with_fmt_layer<L>(fmt_layer: L, log_file: Option<&Path>) -> anyhow::Result<()>
where
    L: tracing_subscriber::Layer<tracing_subscriber::Registry> + Send + Sync + 'static,
{
    let base = tracing_subscriber::registry().with(fmt_layer);

    if let Some(path) = log_file {
        let file = File::create(path)?;
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_writer(Mutex::new(file))
            .with_filter(LevelFilter::DEBUG);
        base.with(file_layer).try_init()?;
    } else {
        base.try_init()?;
    }
    Ok(())
}

/// Run an async test body with tracing installed.
pub async fn with_test_tracing<F, Fut, T>(_test_name: &str, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    // Another test binary thread may have installed the subscriber already.
    let _ = init(LogFormat::Text, None);
    f().await
}

/// Run a sync test body with tracing installed.
/// This is the synchronous equivalent of `with_test_tracing`.
pub fn with_test_tracing_sync<F, T>(_test_name: &str, f: F) -> T
where
    F: FnOnce() -> T,
{
    let _ = init(LogFormat::Text, None);
    f()
}
