//! Rendering of VM interfaces into domain interface entries.
//!
//! Each backend implements [`DomainSpecGenerator`]. A generator reads the
//! VM interface and, where needed, the links in the pod network namespace,
//! then rewrites the domain entry whose alias matches the interface name.

use anyhow::{Result, anyhow};
use log::{debug, error, warn};

use crate::api::{BindingMethod, Interface, Port, VirtualMachineInstance};
use crate::constants::{IFACE_BACKEND_PASST, IFACE_TYPE_USER, MANAGED_NO};
use crate::domain::{
    Domain, Interface as DomainInterface, InterfaceBackend, InterfacePortForward, InterfaceSource,
    InterfaceTarget, Mac, Mtu, PortForwardRange, Protocol,
};
use crate::network::istio::SidecarPolicy;
use crate::network::link::{LinkError, LinkLookup, resolve_declared_address};
use crate::network::names::tap_device_name;

pub trait DomainSpecGenerator {
    fn generate(&mut self) -> Result<()>;
}

/// Collaborators shared by every generator of one VM instance.
#[derive(Clone, Copy)]
pub struct GeneratorDeps<'a> {
    pub vmi: &'a VirtualMachineInstance,
    pub links: &'a dyn LinkLookup,
    pub sidecar: &'a dyn SidecarPolicy,
    pub passt_log_file: &'a str,
}

/// Selects the generator for the binding of `vmi_iface`. Bindings that are
/// not rendered by a generator yield `None`.
pub fn generator_for<'a>(
    deps: GeneratorDeps<'a>,
    vmi_iface: &'a Interface,
    pod_iface_name: &'a str,
    domain: &'a mut Domain,
) -> Option<Box<dyn DomainSpecGenerator + 'a>> {
    match vmi_iface.binding_method()? {
        BindingMethod::Bridge | BindingMethod::Masquerade => Some(Box::new(
            TapSpecGenerator::new(vmi_iface, domain, pod_iface_name, deps.links),
        )),
        BindingMethod::Passt => Some(Box::new(PasstSpecGenerator::new(
            vmi_iface,
            domain,
            pod_iface_name,
            deps,
        ))),
        BindingMethod::Sriov => None,
    }
}

pub struct TapSpecGenerator<'a> {
    vmi_iface: &'a Interface,
    domain: &'a mut Domain,
    pod_iface_name: &'a str,
    links: &'a dyn LinkLookup,
}

struct TapDescriptor {
    mac: Option<Mac>,
    mtu: Mtu,
    target: InterfaceTarget,
}

impl<'a> TapSpecGenerator<'a> {
    pub fn new(
        vmi_iface: &'a Interface,
        domain: &'a mut Domain,
        pod_iface_name: &'a str,
        links: &'a dyn LinkLookup,
    ) -> Self {
        Self {
            vmi_iface,
            domain,
            pod_iface_name,
            links,
        }
    }

    fn discover_descriptor(&self) -> Result<TapDescriptor> {
        let pod_link = self
            .links
            .link_by_name(self.pod_iface_name)
            .inspect_err(|e| {
                error!(
                    "failed to get a link for interface {}: {}",
                    self.pod_iface_name, e
                )
            })?;
        let mac = match resolve_declared_address(self.vmi_iface)? {
            Some(mac) => Some(mac),
            None => pod_link.mac,
        };
        let target = self.target_name()?;
        Ok(TapDescriptor {
            mac: mac.map(|m| Mac {
                address: m.to_string(),
            }),
            mtu: Mtu {
                size: pod_link.mtu.to_string(),
            },
            target: InterfaceTarget {
                device: target,
                managed: MANAGED_NO.into(),
            },
        })
    }

    // Prefer the tap device derived from the pod interface name, falling back
    // to the pod interface itself when no such device exists.
    fn target_name(&self) -> Result<String> {
        let tap_name = tap_device_name(self.pod_iface_name);
        match self.links.link_by_name(&tap_name) {
            Ok(_) => Ok(tap_name),
            Err(LinkError::NotFound(_)) => {
                debug!(
                    "Tap device {} not found, using {} as target",
                    tap_name, self.pod_iface_name
                );
                Ok(self.pod_iface_name.to_string())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl DomainSpecGenerator for TapSpecGenerator<'_> {
    fn generate(&mut self) -> Result<()> {
        let descriptor = self.discover_descriptor()?;
        // A missing entry is skipped, unlike the passt generator which fails.
        match self.domain.interface_by_alias_mut(&self.vmi_iface.name) {
            Some(iface) => {
                iface.mtu = Some(descriptor.mtu);
                iface.mac = descriptor.mac;
                iface.target = Some(descriptor.target);
            }
            None => debug!(
                "Interface {} not found in domain, skipping",
                self.vmi_iface.name
            ),
        }
        Ok(())
    }
}

pub struct PasstSpecGenerator<'a> {
    vmi_iface: &'a Interface,
    domain: &'a mut Domain,
    pod_iface_name: &'a str,
    vmi: &'a VirtualMachineInstance,
    sidecar: &'a dyn SidecarPolicy,
    log_file: &'a str,
}

impl<'a> PasstSpecGenerator<'a> {
    pub fn new(
        vmi_iface: &'a Interface,
        domain: &'a mut Domain,
        pod_iface_name: &'a str,
        deps: GeneratorDeps<'a>,
    ) -> Self {
        Self {
            vmi_iface,
            domain,
            pod_iface_name,
            vmi: deps.vmi,
            sidecar: deps.sidecar,
            log_file: deps.passt_log_file,
        }
    }

    fn generate_interface(&self, iface: &DomainInterface) -> DomainInterface {
        let mut generated = iface.clone();
        generated.iface_type = IFACE_TYPE_USER.into();
        generated.source = InterfaceSource {
            device: self.pod_iface_name.into(),
            ..Default::default()
        };
        generated.backend = Some(InterfaceBackend {
            backend_type: IFACE_BACKEND_PASST.into(),
            log_file: self.log_file.into(),
        });
        generated.port_forward = self.generate_port_forward();
        generated.mac = if self.vmi_iface.mac_address.is_empty() {
            None
        } else {
            Some(Mac {
                address: self.vmi_iface.mac_address.clone(),
            })
        };
        generated
    }

    fn generate_port_forward(&self) -> Vec<InterfacePortForward> {
        let reserved = if self.sidecar.injection_enabled(self.vmi) {
            self.sidecar.reserved_ports()
        } else {
            Vec::new()
        };
        port_forward_rules(&self.vmi_iface.ports, &reserved)
    }
}

impl DomainSpecGenerator for PasstSpecGenerator<'_> {
    fn generate(&mut self) -> Result<()> {
        let index = self
            .domain
            .interface_index_by_alias(&self.vmi_iface.name)
            .ok_or_else(|| {
                anyhow!(
                    "failed to find interface {} in domain spec",
                    self.vmi_iface.name
                )
            })?;
        let generated = self.generate_interface(&self.domain.devices.interfaces[index]);
        self.domain.devices.interfaces[index] = generated;
        Ok(())
    }
}

fn port_protocol(protocol: &str) -> Option<Protocol> {
    if protocol.is_empty() || protocol.eq_ignore_ascii_case("tcp") {
        Some(Protocol::Tcp)
    } else if protocol.eq_ignore_ascii_case("udp") {
        Some(Protocol::Udp)
    } else {
        None
    }
}

/// Builds passt forwarding rules. Reserved ports are excluded from TCP ahead
/// of the declared ports. With nothing declared and nothing reserved, every
/// TCP and UDP port is forwarded.
pub fn port_forward_rules(ports: &[Port], reserved: &[u16]) -> Vec<InterfacePortForward> {
    let mut tcp: Vec<PortForwardRange> = reserved
        .iter()
        .map(|&port| PortForwardRange::excluded(port))
        .collect();
    let mut udp = Vec::new();

    for port in ports {
        match port_protocol(&port.protocol) {
            Some(Protocol::Tcp) => tcp.push(PortForwardRange::port(port.port)),
            Some(Protocol::Udp) => udp.push(PortForwardRange::port(port.port)),
            None => warn!("protocol {} is not supported by passt", port.protocol),
        }
    }

    if tcp.is_empty() && udp.is_empty() {
        return vec![
            InterfacePortForward::all(Protocol::Tcp),
            InterfacePortForward::all(Protocol::Udp),
        ];
    }

    let mut rules = Vec::with_capacity(2);
    if !tcp.is_empty() {
        rules.push(InterfacePortForward {
            proto: Protocol::Tcp,
            ranges: tcp,
        });
    }
    if !udp.is_empty() {
        rules.push(InterfacePortForward {
            proto: Protocol::Udp,
            ranges: udp,
        });
    }
    rules
}
