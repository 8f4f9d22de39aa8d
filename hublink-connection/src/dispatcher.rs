//! Hub dispatch collaborator.

use crate::connection::HubConnection;
use crate::error::ConnectionError;
use async_trait::async_trait;
use hublink_protocol::{HubMessage, TargetRegistry};
use std::sync::Arc;

/// Handles invocations the peer sends to this side.
///
/// `dispatch` runs on the connection's read path, so long-running work
/// (streams in particular) should be spawned onto its own task and reply
/// through [`HubConnection::send_reply`]. Returning an error ends the
/// connection.
#[async_trait]
pub trait HubDispatcher: Send + Sync {
    /// Targets this dispatcher serves, used to bind inbound arguments.
    fn targets(&self) -> Arc<TargetRegistry>;

    /// Receives a forwarded `Invocation`, `StreamInvocation` or
    /// `CancelInvocation`.
    async fn dispatch(
        &self,
        connection: &Arc<HubConnection>,
        message: HubMessage,
    ) -> Result<(), ConnectionError>;

    /// Called once the connection is torn down.
    async fn disconnected(&self, _connection: &Arc<HubConnection>) {}
}
