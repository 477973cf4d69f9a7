use std::path::Path;

use tracing::info;

use crate::{Config, Result};

/// Environment prefix; `ARTEMIS__PIPELINE__READY_POLL_MS=50` overrides `pipeline.ready_poll_ms`
pub const ENV_PREFIX: &str = "ARTEMIS";

/// Load configuration: built-in defaults, then the optional TOML file, then the environment
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        info!("Loading configuration from {}", path.display());
        builder = builder.add_source(config::File::from(path).required(true));
    }

    let config = builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize::<Config>()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_file() {
        let config = load_config(None).unwrap();
        assert_eq!(config.status.interval_ms, 1000);
        assert_eq!(config.capture.cooling_setpoint, -10);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[pipeline]\nready_poll_ms = 25\n\n[simulator]\nwidth = 320\nfast_mode = false"
        )
        .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.pipeline.ready_poll_ms, 25);
        assert_eq!(config.pipeline.stream_wait_ms, 10);
        assert_eq!(config.simulator.width, 320);
        assert_eq!(config.simulator.height, 480);
        assert!(!config.simulator.fast_mode);
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = load_config(Some(Path::new("/nonexistent/artemis.toml")));
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }
}
