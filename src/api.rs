use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque, stable identifier of a VM instance.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    pub fn new<S: Into<String>>(uid: S) -> Self {
        Self(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uid {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstance {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: VirtualMachineInstanceSpec,
}

impl VirtualMachineInstance {
    pub fn uid(&self) -> &Uid {
        &self.metadata.uid
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(String::as_str)
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.spec.domain.devices.interfaces
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub uid: Uid,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceSpec {
    #[serde(default)]
    pub domain: DomainSpec,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    #[serde(default)]
    pub devices: Devices,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Devices {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,
}

/// A network interface as declared on the VM instance.
///
/// Exactly one of the binding fields is expected to be set. The binding
/// decides which backend renders the interface into the domain.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac_address: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<Port>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<InterfaceBridge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub masquerade: Option<InterfaceMasquerade>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passt: Option<InterfacePasst>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sriov: Option<InterfaceSriov>,
}

impl Interface {
    pub fn binding_method(&self) -> Option<BindingMethod> {
        if self.bridge.is_some() {
            Some(BindingMethod::Bridge)
        } else if self.masquerade.is_some() {
            Some(BindingMethod::Masquerade)
        } else if self.passt.is_some() {
            Some(BindingMethod::Passt)
        } else if self.sriov.is_some() {
            Some(BindingMethod::Sriov)
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BindingMethod {
    Bridge,
    Masquerade,
    Passt,
    Sriov,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct InterfaceBridge {}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct InterfaceMasquerade {}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct InterfacePasst {}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct InterfaceSriov {}

/// A port exposed by the guest. An empty protocol means TCP.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    pub port: u16,
}
