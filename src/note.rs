//! Observability notes emitted by every supervised component.

use serde::{Deserialize, Serialize};

/// Short tag describing a state transition or attempt.
///
/// Notes are the only way outside code learns about internal retries. They are
/// delivered over a broadcast channel, so subscribers that fall behind lose the
/// oldest notes rather than slowing the component down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Note {
    /// Resource acquired or converged.
    Ready,
    /// Acquisition failed; another attempt is scheduled.
    Retry,
    /// Operational error absorbed locally.
    Error,
    /// Received bytes discarded because no response prefix was found.
    Skip,
    /// A response started but did not complete within one dispatch.
    Begin,
    /// More bytes of an unfinished response arrived.
    Middle,
    /// A complete framed response was received.
    Response,
    /// The PPP dialer was launched.
    Pppd,
    /// A route to the PPP subnet was added.
    Route,
    /// The IMEI request was written to the modem.
    #[serde(rename = "requestIMEI")]
    RequestImei,
    /// The signal quality request was written to the modem.
    #[serde(rename = "requestRSSI")]
    RequestRssi,
}

impl Note {
    /// Wire-style tag for logs and status output.
    pub fn tag(self) -> &'static str {
        match self {
            Note::Ready => "ready",
            Note::Retry => "retry",
            Note::Error => "error",
            Note::Skip => "skip",
            Note::Begin => "begin",
            Note::Middle => "middle",
            Note::Response => "response",
            Note::Pppd => "pppd",
            Note::Route => "route",
            Note::RequestImei => "requestIMEI",
            Note::RequestRssi => "requestRSSI",
        }
    }
}

impl std::fmt::Display for Note {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}
