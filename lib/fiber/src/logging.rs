pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the process root logger writing to stderr at the requested level.
/// Unrecognised levels fall back to `info`. Component loggers are derived from
/// the returned logger with `log.new(o!(...))`.
pub fn init(level: &str) -> Logger {
    let level = match level {
        "critical" | "error" | "warning" | "info" | "debug" | "trace" => level,
        _ => "info",
    };

    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    ))
    .expect("Error parsing logger configuration");

    config.build_logger().expect("Error building logger")
}

/// Logger that swallows everything. Components constructed without a parent
/// logger use this.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
