//! ---
//! cobus_section: "01-core-functionality"
//! cobus_subsection: "module"
//! cobus_type: "source"
//! cobus_scope: "code"
//! cobus_description: "Shared primitives and utilities for the bus runtime."
//! cobus_version: "v0.0.0-prealpha"
//! cobus_owner: "tbd"
//! ---
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const LOG_ENV: &str = "COBUS_LOG";

static INIT: OnceCell<()> = OnceCell::new();

/// Map the numeric `--logger` CLI level onto a tracing filter directive.
///
/// The scale follows the harness contract: 0=trace, 1=debug, 2=info,
/// 3=warn, 4=error, 5 and above disable logging.
pub fn level_directive(level: u8) -> &'static str {
    match level {
        0 => "trace",
        1 => "debug",
        2 => "info",
        3 => "warn",
        4 => "error",
        _ => "off",
    }
}

/// Initialize the tracing subscriber for a daemon.
///
/// `COBUS_LOG` overrides the filter when set (e.g. `debug,cobus_transport=trace`),
/// falling back to the standard `RUST_LOG` variable and finally to the numeric
/// CLI level. Output is plain single-line text on stdout: the external harness
/// string-matches captured standard output, so the format is part of the
/// observable contract.
pub fn init_tracing(service_name: &str, logger_level: u8) {
    INIT.get_or_init(|| {
        let filter = match std::env::var(LOG_ENV) {
            Ok(directive) => EnvFilter::try_new(directive).unwrap_or_else(|err| {
                eprintln!(
                    "invalid {} directive ({}); using --logger level",
                    LOG_ENV, err
                );
                EnvFilter::new(level_directive(logger_level))
            }),
            Err(_) => EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level_directive(logger_level))),
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).without_time())
            .try_init()
            .ok();
        info!(service = %service_name, logger_level, "tracing initialised");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_levels_map_to_directives() {
        assert_eq!(level_directive(0), "trace");
        assert_eq!(level_directive(2), "info");
        assert_eq!(level_directive(4), "error");
        assert_eq!(level_directive(9), "off");
    }

    #[test]
    fn init_is_idempotent() {
        init_tracing("test", 2);
        init_tracing("test", 0);
    }
}
