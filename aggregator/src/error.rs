//! Failure taxonomy shared by the pipeline stages.
//!
//! None of these ever reach a caller. Every class degrades to "missing value" for the affected
//! keys and is only visible as the `class` field on log lines.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// A submission could not be enqueued onto the coalescing channel.
    ChannelOverflow,
    /// The retrying downstream call did not finish within the dispatch timeout.
    DownstreamTimeout,
    /// The downstream call kept failing until retries ran out.
    DownstreamFailure,
    /// A result could not be pushed into a collector's result stream.
    CollectorFault,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChannelOverflow => "channel_overflow",
            Self::DownstreamTimeout => "downstream_timeout",
            Self::DownstreamFailure => "downstream_failure",
            Self::CollectorFault => "collector_fault",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
