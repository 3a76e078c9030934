use crate::csi::{
    plugin_capability::{service::Type as PluginServiceType, Service, Type::Service as ServiceCapability},
    PluginCapability,
};

/// This returns the exhaustive set of capabilities for this CSI driver.
pub fn plugin_capabilities() -> Vec<PluginCapability> {
    let service_capabilities = &[
        PluginServiceType::ControllerService,
        PluginServiceType::VolumeAccessibilityConstraints,
    ];

    service_capabilities
        .iter()
        .map(|capability| PluginCapability {
            r#type: Some(ServiceCapability(Service {
                r#type: *capability as i32,
            })),
        })
        .collect()
}
