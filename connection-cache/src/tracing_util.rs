use std::io::IsTerminal;
use std::str::FromStr;

use anyhow::Result;
use tracing_subscriber::filter::{Directive, LevelFilter};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const OUR_CRATES: &[&str] = &["connection_cache", "connection_cache_probe"];

const TLS_CRATES: &[&str] = &["rustls", "tokio_rustls"];

/// Output formats for logging messages.
pub enum Format {
    /// Standard, human readable format.
    Raw,
    /// JSON, machine readable format.
    Json,
}

/// Initialize tracing and log to stderr. When `verbose` is `true` our crates
/// log at TRACE and the TLS stack at DEBUG; otherwise we log at INFO only.
pub fn init(format: Format, verbose: bool) -> Result<()> {
    let is_terminal = std::io::stderr().is_terminal();
    let terminal_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(is_terminal)
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    let env_filter = match verbose {
        true => env_filter_with_crates(vec![
            (OUR_CRATES.to_vec(), LevelFilter::TRACE),
            (TLS_CRATES.to_vec(), LevelFilter::DEBUG),
        ])?,
        false => env_filter_with_crates(vec![(OUR_CRATES.to_vec(), LevelFilter::INFO)])?,
    };

    let terminal_layer = match format {
        Format::Json => terminal_layer.json().with_filter(env_filter).boxed(),
        Format::Raw => terminal_layer.with_filter(env_filter).boxed(),
    };

    tracing_subscriber::registry().with(terminal_layer).try_init()?;

    tracing::debug!(verbose, "Initialized tracing");

    Ok(())
}

/// Controls which crate's logs get through and from which level. `RUST_LOG`
/// directives are kept and extended.
fn env_filter_with_crates(crates: Vec<(Vec<&str>, LevelFilter)>) -> Result<EnvFilter> {
    let mut filter = EnvFilter::from_default_env();

    for (crate_names, level_filter) in crates {
        for crate_name in crate_names {
            filter = filter.add_directive(Directive::from_str(&format!(
                "{}={}",
                crate_name, &level_filter
            ))?);
        }
    }

    Ok(filter)
}
