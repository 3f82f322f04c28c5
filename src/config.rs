use clap::builder::BoolishValueParser;
use clap::error::ErrorKind;
use clap::{ArgAction, Parser};
use dotenvy::dotenv;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_ROOT_TOPIC: &str = "summit/lab4";

/// Broker connection and lab layout. Every flag falls back to its environment
/// variable, so the same binary runs from a shell or inside a container.
#[derive(Debug, Clone, Parser)]
#[command(name = "lab-watch", version)]
#[command(about = "Watch MQTT lab topics and raise an alert whenever a value changes")]
pub struct Config {
    /// MQTT broker to connect to (IP or hostname)
    #[arg(short = 'b', long = "broker", env = "MQTT_BROKER")]
    pub mqtt_host: String,

    /// MQTT broker port
    #[arg(short = 'p', long = "port", env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    /// Username to authenticate to the broker
    #[arg(short = 'u', long = "user", env = "MQTT_USER")]
    pub mqtt_username: String,

    /// Password of the user
    #[arg(short = 'P', long = "password", env = "MQTT_PASS", hide_env_values = true)]
    pub mqtt_password: String,

    /// Quantity of labs to set up and monitor
    #[arg(
        short = 'l',
        long = "labs",
        env = "MQTT_LABS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub labs: u16,

    /// Enable debug output
    #[arg(
        short = 'v',
        long = "verbose",
        env = "VERBOSE",
        action = ArgAction::SetTrue,
        value_parser = BoolishValueParser::new()
    )]
    pub verbose: bool,

    /// Prefix of every lab topic
    #[arg(long, env = "MQTT_ROOT_TOPIC", default_value = DEFAULT_ROOT_TOPIC)]
    pub root_topic: String,

    /// Re-publish alerts as JSON to this topic (alerts are always logged)
    #[arg(long, env = "MQTT_ALERT_TOPIC")]
    pub alert_topic: Option<String>,

    /// Seconds to wait for the broker to accept the first connection
    #[arg(long, env = "MQTT_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Initial delay between reconnect attempts, doubled after each failure
    #[arg(long = "retry-interval-ms", env = "MQTT_RETRY_INTERVAL_MS", default_value_t = 1000)]
    pub mqtt_retry_interval_ms: u64,

    /// Consecutive failed reconnects before giving up, -1 for unlimited
    #[arg(
        long = "max-retries",
        env = "MQTT_MAX_RETRIES",
        default_value_t = -1,
        allow_negative_numbers = true
    )]
    pub mqtt_max_retries: i32,

    /// Publish the initial `False` value to every lab topic after connecting
    #[arg(
        long,
        env = "MQTT_SEED_LABS",
        default_value_t = true,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub seed_labs: bool,

    /// Publish Home Assistant discovery configs for the demo devices
    #[arg(
        long,
        env = "MQTT_DISCOVERY",
        default_value_t = true,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub discovery: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable or flag {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

fn prepend_root_topic(root: &str, topic: &str) -> String {
    if !root.is_empty() {
        format!("{}/{}", root.trim_end_matches('/'), topic.trim_start_matches('/'))
    } else {
        topic.to_string()
    }
}

impl Config {
    /// Load `.env`, parse flags and environment, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        dotenv().ok();

        let config = Self::from_args(std::env::args_os())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without exiting the process on bad input. Help and version
    /// requests are still printed and exit immediately.
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::try_parse_from(args).map_err(|e| match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => e.exit(),
            _ => ConfigError::ParsingError(e.render().to_string()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        const MIN_RETRY_INTERVAL: u64 = 100;
        const MAX_RETRY_INTERVAL: u64 = 1_000_000;
        const MAX_CONNECT_TIMEOUT: u64 = 300;

        if self.mqtt_host.trim().is_empty() {
            return Err(ConfigError::MissingOrInvalid("MQTT_BROKER".to_string()));
        }
        if self.mqtt_username.is_empty() {
            return Err(ConfigError::MissingOrInvalid("MQTT_USER".to_string()));
        }
        if self.mqtt_password.is_empty() {
            return Err(ConfigError::MissingOrInvalid("MQTT_PASS".to_string()));
        }
        if !(MIN_RETRY_INTERVAL..=MAX_RETRY_INTERVAL).contains(&self.mqtt_retry_interval_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_RETRY_INTERVAL_MS must be between {} and {} ms",
                MIN_RETRY_INTERVAL, MAX_RETRY_INTERVAL
            )));
        }
        if !(1..=MAX_CONNECT_TIMEOUT).contains(&self.connect_timeout_secs) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_CONNECT_TIMEOUT_SECS must be between 1 and {} s",
                MAX_CONNECT_TIMEOUT
            )));
        }
        if self.mqtt_max_retries < -1 {
            return Err(ConfigError::ParsingError(
                "MQTT_MAX_RETRIES must be -1 (unlimited) or a non-negative integer".to_string(),
            ));
        }
        if matches!(&self.alert_topic, Some(topic) if topic.trim().is_empty()) {
            return Err(ConfigError::MissingOrInvalid("MQTT_ALERT_TOPIC".to_string()));
        }

        Ok(())
    }

    /// `<root>/group<N>/completed` for every lab, in lab order.
    pub fn lab_topics(&self) -> Vec<String> {
        (0..self.labs)
            .map(|lab| prepend_root_topic(&self.root_topic, &format!("group{}/completed", lab)))
            .collect()
    }

    pub fn status_topic(&self) -> String {
        prepend_root_topic(&self.root_topic, "/status")
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.mqtt_retry_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn parse(extra: &[&str]) -> Config {
        let mut args = vec!["lab-watch", "-b", "broker.local", "-u", "lab", "-P", "secret"];
        args.extend_from_slice(extra);
        Config::try_parse_from(args).expect("arguments should parse")
    }

    #[test]
    fn defaults_follow_documented_contract() {
        let config = parse(&[]);
        assert_eq!(config.mqtt_port, 1883);
        assert_eq!(config.labs, 10);
        assert_eq!(config.root_topic, DEFAULT_ROOT_TOPIC);
        assert_eq!(config.mqtt_max_retries, -1);
        assert!(config.alert_topic.is_none());
        assert!(config.seed_labs);
        assert!(config.discovery);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn ten_labs_yield_ten_distinct_topics() {
        let topics = parse(&["--labs", "10"]).lab_topics();
        assert_eq!(topics.len(), 10);
        assert_eq!(topics.iter().collect::<HashSet<_>>().len(), 10);
        assert_eq!(topics[0], "summit/lab4/group0/completed");
        assert_eq!(topics[9], "summit/lab4/group9/completed");
    }

    #[test]
    fn root_topic_slashes_are_normalised() {
        let config = parse(&["--root-topic", "site/", "--labs", "1"]);
        assert_eq!(config.lab_topics(), vec!["site/group0/completed".to_string()]);
        assert_eq!(config.status_topic(), "site/status");
    }

    #[test]
    fn zero_labs_is_rejected() {
        let result = Config::try_parse_from([
            "lab-watch", "-b", "broker", "-u", "lab", "-P", "secret", "--labs", "0",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn flags_and_switches_parse() {
        let config = parse(&[
            "-v",
            "--max-retries",
            "-1",
            "--seed-labs",
            "false",
            "--discovery",
            "no",
            "--alert-topic",
            "summit/lab4/alerts",
        ]);
        assert!(config.verbose);
        assert!(!config.seed_labs);
        assert!(!config.discovery);
        assert_eq!(config.alert_topic.as_deref(), Some("summit/lab4/alerts"));
    }

    #[test]
    fn retry_interval_out_of_range_is_rejected() {
        let config = parse(&["--retry-interval-ms", "10"]);
        assert!(matches!(config.validate(), Err(ConfigError::ParsingError(_))));
    }

    #[test]
    fn retry_interval_flag_is_accepted() {
        let config = parse(&["--retry-interval-ms", "250"]);
        assert_eq!(config.retry_interval(), Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bad_flag_values_become_config_errors() {
        let result = Config::from_args([
            "lab-watch", "-b", "broker", "-u", "lab", "-P", "secret", "--port", "not-a-port",
        ]);
        assert!(matches!(result, Err(ConfigError::ParsingError(_))));
    }

    #[test]
    fn negative_retries_below_unlimited_are_rejected() {
        let config = parse(&["--max-retries", "-5"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_credentials_are_rejected() {
        let mut config = parse(&[]);
        config.mqtt_password.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingOrInvalid(name)) if name == "MQTT_PASS"
        ));
    }
}
