use std::net::SocketAddr;

use crate::{availability::StayPolicy, error::Error};

#[derive(Clone, Debug)]
pub struct Config {
    pub database_file: String,
    pub bind_addr: SocketAddr,
    pub stay: StayPolicy,
    pub auto_approve_on_payment: bool,
    pub seed_demo_data: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_file: "stayhub.db".to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 37373)),
            stay: StayPolicy::default(),
            auto_approve_on_payment: true,
            seed_demo_data: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, falling back to defaults for unset keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let defaults = Config::default();
        let database_file = lookup("DATABASE_FILE").unwrap_or(defaults.database_file);
        let bind_addr = parse_or(&lookup, "BIND_ADDR", defaults.bind_addr)?;
        let min_stay = parse_or(&lookup, "MIN_STAY", defaults.stay.min_stay)?;
        let max_stay = parse_or(&lookup, "MAX_STAY", defaults.stay.max_stay)?;
        let auto_approve_on_payment = parse_flag(
            &lookup,
            "AUTO_APPROVE_ON_PAYMENT",
            defaults.auto_approve_on_payment,
        )?;
        let seed_demo_data = parse_flag(&lookup, "SEED_DEMO_DATA", defaults.seed_demo_data)?;

        if min_stay == 0 || min_stay > max_stay {
            return Err(Error::Config(format!(
                "MIN_STAY ({min_stay}) must be at least 1 and not exceed MAX_STAY ({max_stay})"
            )));
        }

        Ok(Self {
            database_file,
            bind_addr,
            stay: StayPolicy { min_stay, max_stay },
            auto_approve_on_payment,
            seed_demo_data,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, Error> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{key} has an invalid value {raw:?}"))),
    }
}

fn parse_flag(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool, Error> {
    match lookup(key).map(|raw| raw.trim().to_lowercase()) {
        None => Ok(default),
        Some(raw) => match raw.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(Error::Config(format!("{key} must be a boolean, got {raw:?}"))),
        },
    }
}
