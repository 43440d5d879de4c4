use slog::{o, Drain, Level, Logger};

/// Build the root logger with a terminal drain at the given level.
pub fn build_logger(debug_level: &str) -> Result<Logger, String> {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build();

    let drain = match debug_level {
        "info" => drain.filter_level(Level::Info),
        "debug" => drain.filter_level(Level::Debug),
        "trace" => drain.filter_level(Level::Trace),
        "warn" => drain.filter_level(Level::Warning),
        "error" => drain.filter_level(Level::Error),
        "crit" => drain.filter_level(Level::Critical),
        unknown => return Err(format!("Unknown log level: {}", unknown)),
    };

    Ok(Logger::root(drain.fuse(), o!()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_levels() {
        assert!(build_logger("verbose").is_err());
    }
}
