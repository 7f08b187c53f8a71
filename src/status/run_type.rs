use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Cadence bucket of a backup run, ordered from finest to coarsest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl RunType {
    pub const ALL: [RunType; 5] = [
        RunType::Hourly,
        RunType::Daily,
        RunType::Weekly,
        RunType::Monthly,
        RunType::Yearly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Hourly => "hourly",
            RunType::Daily => "daily",
            RunType::Weekly => "weekly",
            RunType::Monthly => "monthly",
            RunType::Yearly => "yearly",
        }
    }

    /// Nominal time between two runs of this type.
    pub fn interval(&self) -> Duration {
        let secs = match self {
            RunType::Hourly => 3600,
            RunType::Daily => 24 * 3600,
            RunType::Weekly => 7 * 24 * 3600,
            RunType::Monthly => 30 * 24 * 3600,
            RunType::Yearly => 365 * 24 * 3600,
        };
        Duration::from_secs(secs)
    }

    /// Deadline used when the configuration does not override it.
    pub fn default_timeout(&self) -> Duration {
        self.interval() / 2
    }

    /// Lock conflicts are routine for the finest run type only.
    pub fn is_finest(&self) -> bool {
        *self == RunType::Hourly
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        RunType::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown run type '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_follows_cadence() {
        assert!(RunType::Hourly < RunType::Daily);
        assert!(RunType::Monthly < RunType::Yearly);
        assert!(RunType::Hourly.is_finest());
        assert!(!RunType::Daily.is_finest());
    }

    #[test]
    fn test_default_timeout_is_half_interval() {
        assert_eq!(RunType::Hourly.default_timeout().as_secs(), 1800);
        assert_eq!(RunType::Daily.default_timeout().as_secs(), 43200);
    }

    #[test]
    fn test_parse() {
        assert_eq!("weekly".parse::<RunType>().unwrap(), RunType::Weekly);
        assert!("fortnightly".parse::<RunType>().is_err());
    }
}
