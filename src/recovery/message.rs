use serde::{Deserialize, Serialize};

use crate::types::{Result, TxId};

/// Asks a peer about transactions left prepared locally.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TxStateRequest {
    pub transaction_ids: Vec<TxId>,
}

/// Peer answer: transactions to roll back (including ones it has never seen).
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TxStateResponse {
    pub rollback_transaction_ids: Vec<TxId>,
    /// Transactions the peer saw committed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub committed_transaction_ids: Vec<TxId>,
}

/// Recovery protocol message.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecoveryMessage {
    TxStateRequest(TxStateRequest),
    TxStateResponse(TxStateResponse),
}

impl RecoveryMessage {
    /// JSON encoding for transports that carry text.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses [`RecoveryMessage::to_json`] output.
    pub fn from_json(src: &str) -> Result<Self> {
        Ok(serde_json::from_str(src)?)
    }

    /// Name used in log events.
    pub fn kind(&self) -> &'static str {
        match self {
            RecoveryMessage::TxStateRequest(_) => "tx_state.request",
            RecoveryMessage::TxStateResponse(_) => "tx_state.response",
        }
    }
}
