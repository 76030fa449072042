use std::io::Write;

use log::LevelFilter;

const DEFAULT_LEVEL: LevelFilter = LevelFilter::Info;

/// Parse a level name as accepted on the command line. `warning` is
/// accepted as an alias for `warn`; unknown names fall back to info.
pub fn parse_level(level: Option<&str>) -> LevelFilter {
    let Some(level) = level.map(str::trim) else {
        return DEFAULT_LEVEL;
    };
    if level.eq_ignore_ascii_case("warning") {
        return LevelFilter::Warn;
    }
    level.parse::<LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Unknown log level '{}', using {}", level, DEFAULT_LEVEL);
        DEFAULT_LEVEL
    })
}

/// Install the global logger. `RUST_LOG`, when set, overrides `level`.
/// Calling this more than once is harmless.
pub fn init_logging(level: Option<&str>) {
    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .filter(None, parse_level(level))
        // reqwest/hyper are noisy at debug
        .filter_module("hyper", LevelFilter::Warn)
        .filter_module("hyper_util", LevelFilter::Warn);

    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }

    let _ = builder.try_init();
}
