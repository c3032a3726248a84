use anyhow::{anyhow, Context, Result};

use crate::{config::Settings, port_detect};

/// Non-empty value of `name`, if set.
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

pub fn parse_env_u32(name: &str, default: u32) -> Result<u32> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u32>()
            .with_context(|| format!("{name} must be an unsigned integer")),
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(anyhow!("{name} invalid: {err}")),
    }
}

pub fn parse_env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{name} must be an unsigned integer")),
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(anyhow!("{name} invalid: {err}")),
    }
}

pub fn require_port(settings: &Settings) -> Result<String> {
    if let Some(port) = &settings.port {
        return Ok(port.clone());
    }

    let candidates = port_detect::list_candidates();
    if let Some(port) = port_detect::pick_port(&candidates, settings.port_hint.as_deref()) {
        return Ok(port);
    }

    let mut message = String::from(
        "no serial port given and autodetection was not conclusive. Use --port or M65FTP_PORT.",
    );
    if !candidates.is_empty() {
        message.push_str(" Candidates:\n");
        for candidate in candidates {
            message.push_str("  - ");
            message.push_str(&candidate);
            message.push('\n');
        }
    }
    Err(anyhow!(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_env_values_parse_or_default() {
        std::env::set_var("M65FTP_TEST_NUMERIC_OK", " 250 ");
        std::env::set_var("M65FTP_TEST_NUMERIC_BAD", "many");
        assert_eq!(parse_env_u32("M65FTP_TEST_NUMERIC_OK", 1).unwrap(), 250);
        assert_eq!(parse_env_u64("M65FTP_TEST_NUMERIC_UNSET", 7).unwrap(), 7);
        assert!(parse_env_u32("M65FTP_TEST_NUMERIC_BAD", 1).is_err());
    }

    #[test]
    fn blank_strings_count_as_unset() {
        std::env::set_var("M65FTP_TEST_BLANK", "   ");
        assert_eq!(env_string("M65FTP_TEST_BLANK"), None);
        assert_eq!(env_string("M65FTP_TEST_NEVER_SET"), None);
    }

    #[test]
    fn explicit_port_skips_detection() {
        let settings = Settings {
            port: Some("/dev/ttyUSB9".to_string()),
            ..Settings::default()
        };
        assert_eq!(require_port(&settings).unwrap(), "/dev/ttyUSB9");
    }
}
