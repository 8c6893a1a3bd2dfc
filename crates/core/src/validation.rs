//! Configuration validation support

use config::ConfigError;

/// Trait for validating configuration values after they have been loaded
pub trait ValidateConfig {
    /// Validate the configuration
    ///
    /// Returns Ok(()) if valid, or an error describing what's wrong
    fn validate(&self) -> Result<(), ConfigError>;
}

/// Common validation helpers
pub mod validators {
    use config::ConfigError;

    /// Validate that a port number is valid (1-65535)
    pub fn validate_port(port: u16, field: &str) -> Result<(), ConfigError> {
        if port == 0 {
            return Err(ConfigError::Message(format!(
                "{field}: port must be between 1 and 65535"
            )));
        }
        Ok(())
    }

    /// Validate that a string is not empty
    pub fn validate_not_empty(value: &str, field: &str) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::Message(format!("{field}: cannot be empty")));
        }
        Ok(())
    }

    /// Validate that a value is within range
    pub fn validate_range<T: PartialOrd + std::fmt::Display>(
        value: T,
        min: T,
        max: T,
        field: &str,
    ) -> Result<(), ConfigError> {
        if value < min || value > max {
            return Err(ConfigError::Message(format!(
                "{field}: must be between {min} and {max}"
            )));
        }
        Ok(())
    }

    /// Validate that a string is one of an allowed set
    pub fn validate_one_of(value: &str, allowed: &[&str], field: &str) -> Result<(), ConfigError> {
        if !allowed.contains(&value) {
            return Err(ConfigError::Message(format!(
                "{field}: must be one of {allowed:?}, got {value:?}"
            )));
        }
        Ok(())
    }

    /// Validate a `host:port` pair, where host may be a name, an IPv4 address
    /// or a bracketed IPv6 address
    pub fn validate_host_port(value: &str, field: &str) -> Result<(), ConfigError> {
        let Some((host, port)) = value.rsplit_once(':') else {
            return Err(ConfigError::Message(format!(
                "{field}: expected host:port, got {value:?}"
            )));
        };
        validate_not_empty(host.trim_start_matches('[').trim_end_matches(']'), field)?;
        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::Message(format!("{field}: invalid port {port:?}")))?;
        validate_port(port, field)
    }
}
