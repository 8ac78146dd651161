// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

/// Lifecycle of one ceremony. Terminal states keep the previous group
/// intact; only `Complete` installs a new one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DkgStatus {
    Fresh,
    Proposed,
    Accepted,
    Executing,
    Complete,
    TimedOut,
    Aborted,
    Evicted,
    Failed,
}

impl DkgStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DkgStatus::Complete
                | DkgStatus::TimedOut
                | DkgStatus::Aborted
                | DkgStatus::Evicted
                | DkgStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DkgStatus::Fresh => "Fresh",
            DkgStatus::Proposed => "Proposed",
            DkgStatus::Accepted => "Accepted",
            DkgStatus::Executing => "Executing",
            DkgStatus::Complete => "Complete",
            DkgStatus::TimedOut => "TimedOut",
            DkgStatus::Aborted => "Aborted",
            DkgStatus::Evicted => "Evicted",
            DkgStatus::Failed => "Failed",
        }
    }
}

impl Default for DkgStatus {
    fn default() -> Self {
        DkgStatus::Fresh
    }
}

impl std::fmt::Display for DkgStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!DkgStatus::Fresh.is_terminal());
        assert!(!DkgStatus::Executing.is_terminal());
        assert!(DkgStatus::Complete.is_terminal());
        assert!(DkgStatus::Evicted.is_terminal());
    }
}
