use std::fmt;

use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    Sensor,
    Image,
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Branch::Sensor => f.write_str("sensor"),
            Branch::Image => f.write_str("image"),
        }
    }
}

/// `Idle → Acquiring → Processing → Persisting → Idle`, until `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchState {
    Idle,
    Acquiring,
    Processing,
    Persisting,
    Stopped,
}

/// Publishing side of one branch's state.
pub struct StateCell {
    tx: watch::Sender<BranchState>,
}

impl StateCell {
    pub fn new() -> (Self, watch::Receiver<BranchState>) {
        let (tx, rx) = watch::channel(BranchState::Idle);
        (Self { tx }, rx)
    }

    pub fn set(&self, state: BranchState) {
        self.tx.send_replace(state);
    }

    pub fn get(&self) -> BranchState {
        *self.tx.borrow()
    }
}
