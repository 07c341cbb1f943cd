use serde::{Deserialize, Serialize};

/// Severity filter applied to one component's log output.
///
/// Ordered from least to most verbose so that `level >= LogLevel::Warning`
/// style comparisons read naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Fatal,
    Error,
    Warning,
    Milestone,
    Info,
    Debug,
}

/// Per-component log level set, as propagated by `SetLogLevels`. Each field
/// is `None` when that component's level is left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingLevels {
    pub default_level: Option<LogLevel>,
    pub client_level: Option<LogLevel>,
    pub session_server_level: Option<LogLevel>,
    pub ipc_level: Option<LogLevel>,
    pub server_manager_level: Option<LogLevel>,
    pub common_level: Option<LogLevel>,
}

impl LoggingLevels {
    /// A `LoggingLevels` where every component is set to the same level.
    pub fn uniform(level: LogLevel) -> Self {
        LoggingLevels {
            default_level: Some(level),
            client_level: Some(level),
            session_server_level: Some(level),
            ipc_level: Some(level),
            server_manager_level: Some(level),
            common_level: Some(level),
        }
    }

    /// Decodes the `logLevel` config key's bitmask into a uniform level set.
    /// Bit layout, least to most verbose, matches `LogLevel`'s declaration
    /// order: bit 0 = Fatal is always implied, higher set bits raise the
    /// effective level to the highest one present.
    pub fn from_bitmask(mask: u32) -> Self {
        let levels = [
            LogLevel::Fatal,
            LogLevel::Error,
            LogLevel::Warning,
            LogLevel::Milestone,
            LogLevel::Info,
            LogLevel::Debug,
        ];
        let level = levels
            .iter()
            .enumerate()
            .filter(|(bit, _)| mask & (1 << bit) != 0)
            .map(|(_, lvl)| *lvl)
            .max()
            .unwrap_or(LogLevel::Error);
        LoggingLevels::uniform(level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmask_zero_defaults_to_error() {
        assert_eq!(
            LoggingLevels::from_bitmask(0).default_level,
            Some(LogLevel::Error)
        );
    }

    #[test]
    fn bitmask_picks_highest_set_level() {
        // bits for Fatal(0), Warning(2), Debug(5) set
        let mask = 0b100101;
        let levels = LoggingLevels::from_bitmask(mask);
        assert_eq!(levels.default_level, Some(LogLevel::Debug));
    }
}
