//! Stack bootstrap

use crate::config::TcapStackConfig;
use crate::errors::Result;
use crate::sccp::SccpProvider;
use crate::tcap::TcapProvider;
use std::sync::Arc;
use tracing::info;

/// TCAP stack bound to one SCCP transport
pub struct TcapStack {
    config: TcapStackConfig,
    provider: Arc<TcapProvider>,
}

impl TcapStack {
    /// Validate `config` and build the provider
    pub fn new(config: TcapStackConfig, transport: Arc<dyn SccpProvider>) -> Result<Self> {
        config.validate()?;
        let provider = TcapProvider::new(config.provider.clone(), transport)?;
        Ok(Self { config, provider })
    }

    pub fn start(&self) -> Result<()> {
        self.provider.start()?;
        info!(ssn = self.config.provider.ssn, "TCAP stack started");
        Ok(())
    }

    pub fn stop(&self) {
        self.provider.stop();
        info!(ssn = self.config.provider.ssn, "TCAP stack stopped");
    }

    pub fn provider(&self) -> &Arc<TcapProvider> {
        &self.provider
    }

    pub fn config(&self) -> &TcapStackConfig {
        &self.config
    }
}
