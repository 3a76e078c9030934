/// The CSI plugin's name.
pub const CSI_PLUGIN_NAME: &str = "csi.cloudstack.apache.org";

/// Topology segment key carrying the CloudStack zone.
pub const ZONE_TOPOLOGY_KEY: &str = "topology.csi.cloudstack.apache.org/zone";
/// Topology segment key carrying the CloudStack host, when known.
pub const HOST_TOPOLOGY_KEY: &str = "topology.csi.cloudstack.apache.org/host";

/// Storage class parameter naming the disk offering new volumes are created
/// from. Required on every CreateVolume request.
pub const DISK_OFFERING_PARAMETER: &str = "csi.cloudstack.apache.org/disk-offering-id";

/// Publish context key carrying the cloud-assigned device ordinal.
pub const DEVICE_ID_CONTEXT_KEY: &str = "deviceID";

/// Default CSI endpoint when none is given on the command line.
pub const DEFAULT_CSI_ENDPOINT: &str = "unix://tmp/csi.sock";

/// Operating mode of the driver process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Serve only the Controller (and Identity) service.
    Controller,
    /// Serve only the Node (and Identity) service.
    Node,
    /// Serve Controller, Node and Identity services together.
    All,
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(mode: &str) -> Result<Self, Self::Err> {
        match mode {
            "controller" => Ok(Mode::Controller),
            "node" => Ok(Mode::Node),
            "all" => Ok(Mode::All),
            other => Err(format!("unknown driver mode: {other}")),
        }
    }
}

/// The generated CSI protocol types and service stubs.
pub mod csi {
    tonic::include_proto!("csi.v1");
}

/// The CloudStack connector: data model, error taxonomy, API client.
pub mod cloud;

/// The CSI Controller service.
pub mod controller;

/// The CSI Identity service.
pub mod identity;

/// Per-identifier and per-operation-kind serialization of volume work.
pub mod limiter;

/// The CSI Node service.
pub mod node;

/// The plugin capability set.
pub mod plugin_capabilities;

/// Zone/host topology mapping.
pub mod topology;

/// Byte and gigabyte arithmetic.
pub mod util;
