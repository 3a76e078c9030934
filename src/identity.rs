//! The CSI Identity service: plugin info, capabilities, probe.

use crate::{
    csi::{
        identity_server::Identity, GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse,
        GetPluginInfoRequest, GetPluginInfoResponse, ProbeRequest, ProbeResponse,
    },
    plugin_capabilities::plugin_capabilities,
    CSI_PLUGIN_NAME,
};
use std::collections::HashMap;
use tonic::{Request, Response, Status};
use tracing::{debug, instrument};

#[derive(Debug, Default)]
pub struct IdentityService {}

const CSI_PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tonic::async_trait]
impl Identity for IdentityService {
    #[instrument(skip_all)]
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        debug!(
            "Request to get CSI plugin info, plugin: {}:{}",
            CSI_PLUGIN_NAME, CSI_PLUGIN_VERSION,
        );
        Ok(Response::new(GetPluginInfoResponse {
            name: CSI_PLUGIN_NAME.to_string(),
            vendor_version: CSI_PLUGIN_VERSION.to_string(),
            // Optional manifest is empty.
            manifest: HashMap::new(),
        }))
    }

    #[instrument(skip_all)]
    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        Ok(Response::new(GetPluginCapabilitiesResponse {
            capabilities: plugin_capabilities(),
        }))
    }

    #[instrument(skip_all)]
    async fn probe(
        &self,
        _request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        debug!("Request to probe CSI plugin");
        Ok(Response::new(ProbeResponse { ready: Some(true) }))
    }
}
