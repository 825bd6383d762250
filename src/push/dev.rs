// =============================================================================
// Development push sink - logs instead of delivering
// =============================================================================

use async_trait::async_trait;
use tracing::info;

use super::{token_prefix, PushPayload, PushProvider};

/// Log-only provider used when no APNs credentials are configured.
#[derive(Debug, Default)]
pub struct DevProvider;

#[async_trait]
impl PushProvider for DevProvider {
    async fn send(&self, device_token: &str, payload: &PushPayload) -> anyhow::Result<()> {
        info!(
            token = %token_prefix(device_token),
            title = %payload.title,
            body = %payload.body,
            user_uuid = %payload.user_uuid,
            server_id = %payload.server_id,
            event_type = %payload.event_type,
            "push (dev sink)"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "dev"
    }
}
