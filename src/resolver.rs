//! Target bootstrap: make sure the log group and stream exist before appending.

use tracing::{debug, error, info};

use crate::api::{ApiError, LogsApi};

/// Readiness of the (group, stream) target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetState {
    /// Not checked yet, or the last check failed in transport
    #[default]
    Unresolved,

    /// Group and stream exist
    Ready,

    /// The group does not exist; terminal
    Disabled,
}

impl TargetState {
    pub fn is_disabled(self) -> bool {
        self == TargetState::Disabled
    }
}

impl std::fmt::Display for TargetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetState::Unresolved => write!(f, "unresolved"),
            TargetState::Ready => write!(f, "ready"),
            TargetState::Disabled => write!(f, "disabled"),
        }
    }
}

/// Memoized existence check for one (group, stream) pair.
#[derive(Debug)]
pub struct TargetResolver {
    group: String,
    stream: String,
    state: TargetState,
}

impl TargetResolver {
    pub fn new(group: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            stream: stream.into(),
            state: TargetState::Unresolved,
        }
    }

    pub fn state(&self) -> TargetState {
        self.state
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Resolve the target if it has not been resolved yet.
    ///
    /// A missing group disables the target without returning an error.
    /// Transport failures are returned and leave the state `Unresolved`, so
    /// the next call starts over.
    pub async fn ensure_ready(&mut self, api: &dyn LogsApi) -> Result<TargetState, ApiError> {
        if self.state != TargetState::Unresolved {
            return Ok(self.state);
        }

        let groups = api.describe_log_groups(&self.group).await?;
        debug!(group = %self.group, matches = groups.len(), "Log groups retrieved");

        if groups.first().map(|g| g.log_group_name.as_str()) != Some(self.group.as_str()) {
            error!(
                group = %self.group,
                "Log group not found, disabling CloudWatch delivery"
            );
            self.state = TargetState::Disabled;
            return Ok(self.state);
        }

        let streams = api.describe_log_streams(&self.group, &self.stream).await?;
        debug!(stream = %self.stream, matches = streams.len(), "Log streams retrieved");

        if streams.first().map(|s| s.log_stream_name.as_str()) != Some(self.stream.as_str()) {
            match api.create_log_stream(&self.group, &self.stream).await {
                Ok(()) => {
                    info!(group = %self.group, stream = %self.stream, "Created log stream");
                }
                Err(ApiError::ResourceAlreadyExists(_)) => {
                    debug!(stream = %self.stream, "Log stream created concurrently");
                }
                Err(e) => return Err(e),
            }
        }

        self.state = TargetState::Ready;
        Ok(self.state)
    }
}
