use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;

use crate::config::LogLevel;

fn level_filter(level: &LogLevel) -> LevelFilter {
    match level {
        LogLevel::Error => LevelFilter::Error,
        LogLevel::Warn => LevelFilter::Warn,
        LogLevel::Info => LevelFilter::Info,
        LogLevel::Debug => LevelFilter::Debug,
        LogLevel::Trace => LevelFilter::Trace,
    }
}

/// Initialize the logging system
///
/// `RUST_LOG` directives, when present, refine the given level per module.
pub fn init(level: &LogLevel) {
    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .filter(None, level_filter(level));

    if let Ok(directives) = std::env::var("RUST_LOG") {
        builder.parse_filters(&directives);
    }

    // Another logger may already be installed by the host
    let _ = builder.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter_mapping() {
        assert_eq!(level_filter(&LogLevel::Warn), LevelFilter::Warn);
        assert_eq!(level_filter(&LogLevel::Trace), LevelFilter::Trace);
    }

    #[test]
    fn test_init_twice_does_not_panic() {
        init(&LogLevel::Debug);
        init(&LogLevel::Info);
    }
}
