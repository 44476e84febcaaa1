//! Typed client over one instance session

use crate::common::{Error, Result};
use crate::topology::model::CLUSTERSET_CHANNEL;
use crate::topology::session::{
    decode_rows, ChannelRow, GroupMemberRow, MemberInfoRow, Row, Session, SessionProvider,
    Statement, SystemVariable,
};
use std::sync::Arc;
use std::time::Duration;

/// A connected instance. Every statement is bounded by `timeout`.
#[derive(Clone)]
pub struct Instance {
    session: Arc<dyn Session>,
    address: String,
    timeout: Duration,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("address", &self.address)
            .finish()
    }
}

impl Instance {
    pub async fn connect(
        provider: &dyn SessionProvider,
        address: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let session = tokio::time::timeout(timeout, provider.connect(address))
            .await
            .map_err(|_| Error::unreachable(address, "connect timed out"))??;
        Ok(Self {
            session,
            address: address.to_string(),
            timeout,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub async fn execute(&self, statement: Statement) -> Result<Vec<Row>> {
        tracing::debug!("{} <- {}", self.address, statement);
        tokio::time::timeout(self.timeout, self.session.execute(&statement))
            .await
            .map_err(|_| Error::Timeout(format!("'{}' on {}", statement, self.address)))?
    }

    pub async fn close(&self) {
        self.session.close().await;
    }

    // === Status reads ===

    pub async fn member_info(&self) -> Result<MemberInfoRow> {
        let rows = self.execute(Statement::QueryMemberInfo).await?;
        decode_rows::<MemberInfoRow>(rows)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Statement {
                address: self.address.clone(),
                reason: "member info query returned no rows".into(),
            })
    }

    pub async fn group_members(&self) -> Result<Vec<GroupMemberRow>> {
        decode_rows(self.execute(Statement::QueryGroupMembers).await?)
    }

    pub async fn channels(&self) -> Result<Vec<ChannelRow>> {
        decode_rows(self.execute(Statement::QueryReplicationChannels).await?)
    }

    pub async fn clusterset_channel(&self) -> Result<Option<ChannelRow>> {
        Ok(self
            .channels()
            .await?
            .into_iter()
            .find(|c| c.channel == CLUSTERSET_CHANNEL))
    }

    // === Server variables ===

    pub async fn set_global(&self, variable: SystemVariable, value: u32) -> Result<()> {
        self.execute(Statement::SetGlobal { variable, value }).await?;
        Ok(())
    }

    pub async fn set_super_read_only(&self, enabled: bool) -> Result<()> {
        self.set_global(SystemVariable::SuperReadOnly, u32::from(enabled))
            .await
    }

    pub async fn set_auto_increment(&self, (increment, offset): (u32, u32)) -> Result<()> {
        self.set_global(SystemVariable::AutoIncrementIncrement, increment)
            .await?;
        self.set_global(SystemVariable::AutoIncrementOffset, offset)
            .await
    }

    // === ClusterSet channel ===

    /// (Re)point the ClusterSet channel at `source` and start it
    pub async fn configure_clusterset_channel(&self, source: &str) -> Result<()> {
        let channel = CLUSTERSET_CHANNEL.to_string();
        self.execute(Statement::StopReplica {
            channel: channel.clone(),
        })
        .await?;
        self.execute(Statement::ChangeReplicationSource {
            channel: channel.clone(),
            source: source.to_string(),
        })
        .await?;
        self.execute(Statement::StartReplica { channel }).await?;
        Ok(())
    }

    /// Stop the ClusterSet channel and forget its configuration
    pub async fn remove_clusterset_channel(&self) -> Result<()> {
        let channel = CLUSTERSET_CHANNEL.to_string();
        self.execute(Statement::StopReplica {
            channel: channel.clone(),
        })
        .await?;
        self.execute(Statement::ResetReplica { channel }).await?;
        Ok(())
    }
}
