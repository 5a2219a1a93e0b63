pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the standard terminal logger used by the binaries. Library code
/// never calls this; it takes an `Into<Option<&Logger>>` and falls back to
/// `Discard` instead.
pub fn term_logger() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Embedded logger config must parse");

    config.build_logger().expect("Error building terminal logger")
}

/// Resolves an optional parent logger into a child logger, falling back to
/// a discarding root.
pub fn child_or_discard<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        None => Logger::root(Discard, o!()),
    }
}
