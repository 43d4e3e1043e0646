use async_trait::async_trait;

use crate::protocol::ParticipantId;

/// Supplies the stable identifier of the local participant.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn local_id(&self) -> Result<ParticipantId, anyhow::Error>;
}

/// An identity fixed at construction time.
#[derive(Debug, Clone)]
pub struct StaticIdentity(pub ParticipantId);

impl StaticIdentity {
    pub fn new(id: impl Into<ParticipantId>) -> Self {
        Self(id.into())
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn local_id(&self) -> Result<ParticipantId, anyhow::Error> {
        Ok(self.0.clone())
    }
}
