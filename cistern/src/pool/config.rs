use std::time::Duration;

use crate::config::ParseError;

/// Pool sizing, timeout, and retry options.
///
/// Read once at pool construction; nothing here changes for the life of the
/// pool.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PoolConfig {
    /// Connections eagerly built at construction.
    pub initial_pool_size: usize,
    /// Hard upper bound on `total`. `0` means unbounded.
    pub max_pool_size: usize,
    /// Upper bound on `available`; releases that would exceed it discard the
    /// connection instead of pooling it.
    pub max_idle_pool_size: usize,
    /// Max wait when the pool is saturated before `checkout` fails with
    /// `PoolTimeout`.
    pub checkout_timeout: Duration,
    /// Additional attempts `Pool::retry` makes after the first.
    pub retry_attempts: u32,
    /// Sleep between retry attempts.
    pub retry_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_pool_size: 1,
            max_pool_size: 1,
            max_idle_pool_size: 1,
            checkout_timeout: Duration::from_secs_f64(5.0),
            retry_attempts: 1,
            retry_delay: Duration::from_secs_f64(1.0),
        }
    }
}

impl PoolConfig {
    /// Parse the recognized pool parameters out of a query-parameter list,
    /// returning the config plus everything left over for the driver to
    /// interpret on its own.
    pub fn from_params(params: &[(String, String)]) -> Result<(Self, Vec<(String, String)>), ParseError> {
        let mut config = Self::default();
        let mut leftover = Vec::new();

        for (key, value) in params {
            match key.as_str() {
                "initial_pool_size" => config.initial_pool_size = parse_usize(key, value)?,
                "max_pool_size" => config.max_pool_size = parse_usize(key, value)?,
                "max_idle_pool_size" => config.max_idle_pool_size = parse_usize(key, value)?,
                "checkout_timeout" => config.checkout_timeout = parse_secs(key, value)?,
                "retry_attempts" => config.retry_attempts = parse_u32(key, value)?,
                "retry_delay" => config.retry_delay = parse_secs(key, value)?,
                _ => leftover.push((key.clone(), value.clone())),
            }
        }

        Ok((config, leftover))
    }

    /// `max_pool_size == 0` is interpreted as unbounded.
    pub fn is_unbounded(&self) -> bool {
        self.max_pool_size == 0
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ParseError> {
    value.parse().map_err(|_| ParseError::invalid(key))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ParseError> {
    value.parse().map_err(|_| ParseError::invalid(key))
}

fn parse_secs(key: &str, value: &str) -> Result<Duration, ParseError> {
    let secs: f64 = value.parse().map_err(|_| ParseError::invalid(key))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(ParseError::invalid(key));
    }
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = PoolConfig::default();
        assert_eq!(c.initial_pool_size, 1);
        assert_eq!(c.max_pool_size, 1);
        assert_eq!(c.max_idle_pool_size, 1);
        assert_eq!(c.checkout_timeout, Duration::from_secs(5));
        assert_eq!(c.retry_attempts, 1);
        assert_eq!(c.retry_delay, Duration::from_secs(1));
    }

    #[test]
    fn parses_recognized_and_forwards_rest() {
        let params = vec![
            ("max_pool_size".into(), "10".into()),
            ("checkout_timeout".into(), "0.25".into()),
            ("sslmode".into(), "require".into()),
        ];
        let (config, leftover) = PoolConfig::from_params(&params).unwrap();
        assert_eq!(config.max_pool_size, 10);
        assert_eq!(config.checkout_timeout, Duration::from_secs_f64(0.25));
        assert_eq!(leftover, vec![("sslmode".to_owned(), "require".to_owned())]);
    }

    #[test]
    fn rejects_malformed_numbers() {
        let params = vec![("max_pool_size".into(), "not-a-number".into())];
        assert!(PoolConfig::from_params(&params).is_err());
    }

    #[test]
    fn zero_max_pool_size_is_unbounded() {
        let c = PoolConfig {
            max_pool_size: 0,
            ..Default::default()
        };
        assert!(c.is_unbounded());
    }
}
