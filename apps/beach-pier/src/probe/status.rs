use time::OffsetDateTime;

use crate::error::ProbeFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Checking,
    Connected,
    Disconnected,
    Connecting,
}

/// The two mutually exclusive regions of the lab page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Panel {
    Terminal,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Indicator {
    pub color: &'static str,
    pub label: &'static str,
}

/// Commands shown in the fallback panel.
pub const SETUP_INSTRUCTIONS: &[&str] = &[
    "cargo install --path apps/beach-pier",
    "beach-pier --listen-addr 127.0.0.1:7681",
];

/// UI state driven by probe results.
///
/// Only one panel is stored, so "both visible" or "none visible" cannot be
/// represented. The status only moves on a completed probe, except for the
/// explicit `connecting` step of a manual reconnect.
#[derive(Debug, Clone)]
pub struct StatusBoard {
    status: ConnectionStatus,
    panel: Panel,
    last_checked: Option<OffsetDateTime>,
    last_failure: Option<String>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self {
            status: ConnectionStatus::Checking,
            panel: Panel::Fallback,
            last_checked: None,
            last_failure: None,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn panel(&self) -> Panel {
        self.panel
    }

    pub fn is_visible(&self, panel: Panel) -> bool {
        self.panel == panel
    }

    pub fn last_checked(&self) -> Option<OffsetDateTime> {
        self.last_checked
    }

    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    /// Reconnect is offered only while the bridge is known to be down.
    pub fn can_reconnect(&self) -> bool {
        self.status == ConnectionStatus::Disconnected
    }

    pub fn begin_reconnect(&mut self) {
        self.status = ConnectionStatus::Connecting;
    }

    pub fn record(&mut self, outcome: &Result<(), ProbeFailure>, at: OffsetDateTime) {
        self.last_checked = Some(at);
        match outcome {
            Ok(()) => {
                self.status = ConnectionStatus::Connected;
                self.panel = Panel::Terminal;
                self.last_failure = None;
            }
            Err(failure) => {
                self.status = ConnectionStatus::Disconnected;
                self.panel = Panel::Fallback;
                self.last_failure = Some(failure.to_string());
            }
        }
    }

    pub fn indicator(&self) -> Indicator {
        match self.status {
            ConnectionStatus::Checking => Indicator {
                color: "yellow",
                label: "Checking terminal server...",
            },
            ConnectionStatus::Connecting => Indicator {
                color: "yellow",
                label: "Connecting...",
            },
            ConnectionStatus::Connected => Indicator {
                color: "green",
                label: "Terminal server connected",
            },
            ConnectionStatus::Disconnected => Indicator {
                color: "red",
                label: "Terminal server not running",
            },
        }
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exactly_one_visible(board: &StatusBoard) -> bool {
        board.is_visible(Panel::Terminal) != board.is_visible(Panel::Fallback)
    }

    #[test]
    fn starts_checking_with_fallback_shown() {
        let board = StatusBoard::new();
        assert_eq!(board.status(), ConnectionStatus::Checking);
        assert_eq!(board.panel(), Panel::Fallback);
        assert!(board.last_checked().is_none());
        assert!(!board.can_reconnect());
        assert!(exactly_one_visible(&board));
    }

    #[test]
    fn probe_results_swap_panels_and_keep_exclusivity() {
        let mut board = StatusBoard::new();
        let now = OffsetDateTime::now_utc();

        board.record(&Err(ProbeFailure::Timeout), now);
        assert_eq!(board.status(), ConnectionStatus::Disconnected);
        assert_eq!(board.indicator().color, "red");
        assert_eq!(board.last_failure(), Some("probe timed out"));
        assert!(board.can_reconnect());
        assert!(exactly_one_visible(&board));

        board.begin_reconnect();
        assert_eq!(board.status(), ConnectionStatus::Connecting);
        // Still showing what the last completed probe decided.
        assert_eq!(board.panel(), Panel::Fallback);
        assert!(exactly_one_visible(&board));

        board.record(&Ok(()), now);
        assert_eq!(board.status(), ConnectionStatus::Connected);
        assert_eq!(board.panel(), Panel::Terminal);
        assert!(board.last_failure().is_none());
        assert_eq!(board.last_checked(), Some(now));
        assert!(exactly_one_visible(&board));
    }
}
