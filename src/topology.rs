//! Mapping between CSI topology segments and CloudStack zone/host
//! identifiers.

use crate::{csi, HOST_TOPOLOGY_KEY, ZONE_TOPOLOGY_KEY};
use std::collections::HashMap;
use tonic::Status;

/// CloudStack placement of a volume or node. The zone is always present;
/// the host is only known for some hypervisor setups.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Topology {
    pub zone_id: String,
    pub host_id: String,
}

impl Topology {
    /// A topology pinned to a zone, with no host constraint.
    pub fn zone(zone_id: impl Into<String>) -> Self {
        Self {
            zone_id: zone_id.into(),
            host_id: String::new(),
        }
    }
}

impl TryFrom<&csi::Topology> for Topology {
    type Error = Status;

    fn try_from(topology: &csi::Topology) -> Result<Self, Self::Error> {
        let zone_id = topology
            .segments
            .get(ZONE_TOPOLOGY_KEY)
            .ok_or_else(|| Status::invalid_argument("no zone in topology segments"))?
            .clone();
        let host_id = topology
            .segments
            .get(HOST_TOPOLOGY_KEY)
            .cloned()
            .unwrap_or_default();
        Ok(Self { zone_id, host_id })
    }
}

impl From<Topology> for csi::Topology {
    fn from(topology: Topology) -> Self {
        let mut segments = HashMap::new();
        segments.insert(ZONE_TOPOLOGY_KEY.to_string(), topology.zone_id);
        if !topology.host_id.is_empty() {
            segments.insert(HOST_TOPOLOGY_KEY.to_string(), topology.host_id);
        }
        csi::Topology { segments }
    }
}
