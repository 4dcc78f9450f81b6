//! Log format selection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LogError;

/// Concrete on-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Zip archive with one entry per sample; supports random access and append.
    #[default]
    Eval,
    /// Single JSON document; whole-file read/write.
    Json,
}

impl LogFormat {
    pub const ALL: [LogFormat; 2] = [LogFormat::Eval, LogFormat::Json];

    pub fn extension(&self) -> &'static str {
        match self {
            LogFormat::Eval => ".eval",
            LogFormat::Json => ".json",
        }
    }

    /// Format implied by the extension of `location`, if any.
    pub fn from_location(location: &str) -> Option<LogFormat> {
        let lower = location.to_ascii_lowercase();
        LogFormat::ALL
            .into_iter()
            .find(|f| lower.ends_with(f.extension()))
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Eval => f.write_str("eval"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eval" => Ok(LogFormat::Eval),
            "json" => Ok(LogFormat::Json),
            other => Err(LogError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Requested format, possibly deferred to the location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatChoice {
    #[default]
    Auto,
    Fixed(LogFormat),
}

impl FormatChoice {
    /// Extension of `location` wins, then the native format.
    pub fn resolve(&self, location: &str) -> LogFormat {
        match self {
            FormatChoice::Fixed(format) => *format,
            FormatChoice::Auto => LogFormat::from_location(location).unwrap_or_default(),
        }
    }
}

impl From<LogFormat> for FormatChoice {
    fn from(format: LogFormat) -> Self {
        FormatChoice::Fixed(format)
    }
}

impl FromStr for FormatChoice {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("auto") {
            Ok(FormatChoice::Auto)
        } else {
            s.parse().map(FormatChoice::Fixed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_resolves_by_extension() {
        assert_eq!(FormatChoice::Auto.resolve("logs/a.json"), LogFormat::Json);
        assert_eq!(FormatChoice::Auto.resolve("s3://b/a.EVAL"), LogFormat::Eval);
        assert_eq!(FormatChoice::Auto.resolve("logs/noext"), LogFormat::Eval);
    }

    #[test]
    fn fixed_ignores_extension() {
        let choice = FormatChoice::Fixed(LogFormat::Json);
        assert_eq!(choice.resolve("a.eval"), LogFormat::Json);
    }

    #[test]
    fn parse_choices() {
        assert_eq!("auto".parse::<FormatChoice>().unwrap(), FormatChoice::Auto);
        assert_eq!(
            "JSON".parse::<FormatChoice>().unwrap(),
            FormatChoice::Fixed(LogFormat::Json)
        );
        assert!("yaml".parse::<LogFormat>().is_err());
    }
}
