//! Process exit status

use super::config::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    /// Errors in any phase, an aborted apply, or a non-equivalent validation
    Failure,
    Config,
    /// Signal or declined prompt
    Cancelled,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::Config => 2,
            Self::Cancelled => 130,
        }
    }

    /// Status for an error that escaped a command
    pub fn from_error(error: &anyhow::Error) -> Self {
        if error.downcast_ref::<ConfigError>().is_some() {
            Self::Config
        } else {
            Self::Failure
        }
    }

    /// The more severe of two statuses
    pub fn worst(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    fn severity(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::Config => 2,
            Self::Cancelled => 3,
        }
    }
}
