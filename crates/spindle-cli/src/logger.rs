use std::io::IsTerminal;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERBOSE_FILTER: &str =
    "spindle=debug,spindle_core=debug,spindle_registry=debug,spindle_resolver=debug,spindle_installer=debug,spindle_cli=debug";
const DEFAULT_FILTER: &str =
    "spindle=info,spindle_registry=info,spindle_resolver=info,spindle_installer=info,spindle_cli=info";

/// Logs go to stderr so command output on stdout stays parseable.
pub(crate) fn init_logger(verbose: bool) {
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none())
        .compact();

    let _ = tracing_subscriber::registry()
        .with(log_filter(verbose))
        .with(fmt_layer)
        .try_init();
}

pub(crate) fn log_filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new(VERBOSE_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    }
}
