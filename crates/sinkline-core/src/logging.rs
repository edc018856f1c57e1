//! Console logging through `log` + `env_logger`

/// ANSI color code and padded label for a log level.
fn level_style(level: log::Level, color: bool) -> (&'static str, &'static str, &'static str) {
    let label = match level {
        log::Level::Error => "ERROR",
        log::Level::Warn => "WARN ",
        log::Level::Info => "INFO ",
        log::Level::Debug => "DEBUG",
        log::Level::Trace => "TRACE",
    };
    if !color {
        return ("", label, "");
    }
    let ansi = match level {
        log::Level::Error => "\x1b[31m",
        log::Level::Warn => "\x1b[33m",
        log::Level::Info => "\x1b[32m",
        log::Level::Debug => "\x1b[36m",
        log::Level::Trace => "\x1b[35m",
    };
    (ansi, label, "\x1b[0m")
}

/// Environment variable holding the console filter (`RUST_LOG` syntax)
pub const LOG_ENV: &str = "SINKLINE_LOG";

/// Initialize console logging.
///
/// `debug` lowers the default level; `SINKLINE_LOG` overrides both. Colors are
/// used only when stderr is a terminal. Safe to call more than once.
pub fn init_logging(debug: bool) {
    use std::io::{IsTerminal, Write};

    let default_level = if debug { "debug" } else { "info" };
    let color = std::io::stderr().is_terminal();

    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().filter_or(LOG_ENV, default_level),
    )
    .format(move |buf, record| {
        let (pre, label, post) = level_style(record.level(), color);
        writeln!(
            buf,
            "{} [{pre}{label}{post}] {}",
            buf.timestamp_millis(),
            record.args()
        )
    })
    .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_labels_are_padded() {
        assert_eq!(level_style(log::Level::Info, false), ("", "INFO ", ""));
        assert_eq!(level_style(log::Level::Error, true).1, "ERROR");
    }

    #[test]
    fn init_twice_is_harmless() {
        init_logging(false);
        init_logging(true);
    }
}
