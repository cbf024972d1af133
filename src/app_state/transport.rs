use crate::{ActionTarget, Error, MessageIndex, MutationOperation, Patch, PatchType, SyncAction};
use async_trait::async_trait;

/// One change to push to the other devices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingMutation {
    pub operation: MutationOperation,
    pub action: SyncAction,
    pub target: ActionTarget,
}

impl PendingMutation {
    pub fn set(action: SyncAction, target: ActionTarget) -> Self {
        Self {
            operation: MutationOperation::Set,
            action,
            target,
        }
    }

    pub fn remove(action: SyncAction, target: ActionTarget) -> Self {
        Self {
            operation: MutationOperation::Remove,
            action,
            target,
        }
    }
}

/// An encrypted outgoing patch, ready for the transport layer.
#[derive(Clone, Debug, PartialEq)]
pub struct PatchRequest {
    pub category: PatchType,
    pub indexes: Vec<MessageIndex>,
    pub patch: Patch,
}

/// Server acknowledgement of a pushed patch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchAck {
    pub category: PatchType,
    pub version: u64,
}

/// Sends app-state patches to the server.
#[async_trait]
pub trait PatchTransport: Send + Sync {
    /// Resolves once the server acknowledged the patch.
    async fn push(&self, request: PatchRequest) -> Result<PatchAck, Error>;
}
