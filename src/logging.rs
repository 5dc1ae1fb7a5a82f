use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;

use crate::config::{Config, LogFormat};

/// Resolved logging settings: the CLI flag wins over the config file, and
/// everything falls back to pretty console output at info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

/// Installs the global subscriber that the proxy spans, recorder warnings,
/// and index maintenance logs flow through.
pub fn init(config: &Config, cli_level: Option<&str>) -> anyhow::Result<()> {
    let LogSettings { level, format } = resolve(config, cli_level)?;

    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true);
    match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    }
    .map_err(|err| anyhow!("install tracing subscriber: {err}"))
}

fn resolve(config: &Config, cli_level: Option<&str>) -> anyhow::Result<LogSettings> {
    let logging = config.logging.as_ref();

    let raw_level = cli_level
        .or_else(|| logging.and_then(|logging| logging.level.as_deref()))
        .unwrap_or("info");
    let level = raw_level
        .trim()
        .to_ascii_lowercase()
        .parse::<LevelFilter>()
        .map_err(|_| anyhow!("unrecognized log level `{raw_level}`"))?;

    let format = logging
        .and_then(|logging| logging.format)
        .unwrap_or(LogFormat::Pretty);

    Ok(LogSettings { level, format })
}

#[cfg(test)]
mod tests {
    use super::resolve;
    use crate::config::{Config, LogFormat};
    use tracing_subscriber::filter::LevelFilter;

    fn config_with_logging() -> Config {
        Config::from_toml_str(
            r#"
[logging]
level = "warn"
format = "json"
"#,
        )
        .expect("config should parse")
    }

    #[test]
    fn defaults_are_pretty_at_info() {
        let settings = resolve(&Config::default(), None).unwrap();
        assert_eq!(settings.level, LevelFilter::INFO);
        assert_eq!(settings.format, LogFormat::Pretty);
    }

    #[test]
    fn config_file_settings_apply() {
        let settings = resolve(&config_with_logging(), None).unwrap();
        assert_eq!(settings.level, LevelFilter::WARN);
        assert_eq!(settings.format, LogFormat::Json);
    }

    #[test]
    fn cli_flag_overrides_config_level_case_insensitively() {
        let settings = resolve(&config_with_logging(), Some("Debug")).unwrap();
        assert_eq!(settings.level, LevelFilter::DEBUG);
        // Format still comes from the config.
        assert_eq!(settings.format, LogFormat::Json);
    }

    #[test]
    fn unrecognized_level_is_rejected() {
        let err = resolve(&Config::default(), Some("chatty")).unwrap_err();
        assert!(
            err.to_string().contains("unrecognized log level"),
            "unexpected error: {err}"
        );
    }
}
