use crate::api::VirtualMachineInstance;
use crate::constants::ANNOTATION_ISTIO_INJECT;

pub const ENVOY_ADMIN_PORT: u16 = 15000;
pub const ENVOY_OUTBOUND_PORT: u16 = 15001;
pub const ENVOY_INBOUND_PORT: u16 = 15006;
pub const ENVOY_TUNNEL_PORT: u16 = 15008;
pub const ENVOY_MERGED_PROMETHEUS_TELEMETRY_PORT: u16 = 15020;
pub const ENVOY_HEALTH_CHECK_PORT: u16 = 15021;
pub const ENVOY_PROMETHEUS_TELEMETRY_PORT: u16 = 15090;

/// Service mesh sidecar queries needed when rendering port forwarding.
pub trait SidecarPolicy: Send + Sync {
    fn injection_enabled(&self, vmi: &VirtualMachineInstance) -> bool;
    fn reserved_ports(&self) -> Vec<u16>;
}

#[derive(Clone, Debug)]
pub struct Istio {
    reserved_ports: Vec<u16>,
}

impl Istio {
    pub fn with_reserved_ports(reserved_ports: Vec<u16>) -> Self {
        Self { reserved_ports }
    }
}

impl Default for Istio {
    fn default() -> Self {
        Self {
            reserved_ports: default_reserved_ports(),
        }
    }
}

impl SidecarPolicy for Istio {
    fn injection_enabled(&self, vmi: &VirtualMachineInstance) -> bool {
        vmi.annotation(ANNOTATION_ISTIO_INJECT)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    fn reserved_ports(&self) -> Vec<u16> {
        self.reserved_ports.clone()
    }
}

pub fn default_reserved_ports() -> Vec<u16> {
    vec![
        ENVOY_ADMIN_PORT,
        ENVOY_OUTBOUND_PORT,
        ENVOY_INBOUND_PORT,
        ENVOY_TUNNEL_PORT,
        ENVOY_MERGED_PROMETHEUS_TELEMETRY_PORT,
        ENVOY_HEALTH_CHECK_PORT,
        ENVOY_PROMETHEUS_TELEMETRY_PORT,
    ]
}
