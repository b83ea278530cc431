use crate::config::CertConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

pub const CERT_RENEW_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Issues and renews the TLS certificate of a node. Only consulted for TLS nodes whose
/// certificate mode asks for managed certificates.
#[async_trait]
pub trait CertManager: Send + Sync {
    /// Make sure a usable certificate exists before the node is (re)added to the engine.
    async fn request_cert(&self, tag: &str, config: &CertConfig) -> Result<()>;

    async fn renew_cert(&self, tag: &str, config: &CertConfig) -> Result<()>;
}
