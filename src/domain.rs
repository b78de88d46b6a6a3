//! Model of the virtualization daemon's domain document.
//!
//! Only the parts the network provisioning touches are modelled. The
//! document is owned by the caller; generators find an interface entry by
//! its alias and overwrite fields in place. Everything else is kept in the
//! `extra` maps and written back unchanged.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::ALIAS_USER_DEFINED_PREFIX;

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Domain {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub devices: Devices,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Domain {
    /// Position of the interface entry whose alias name equals `name`.
    pub fn interface_index_by_alias(&self, name: &str) -> Option<usize> {
        self.devices
            .interfaces
            .iter()
            .position(|iface| iface.alias_name() == Some(name))
    }

    pub fn interface_by_alias(&self, name: &str) -> Option<&Interface> {
        self.interface_index_by_alias(name)
            .map(|i| &self.devices.interfaces[i])
    }

    pub fn interface_by_alias_mut(&mut self, name: &str) -> Option<&mut Interface> {
        self.interface_index_by_alias(name)
            .map(|i| &mut self.devices.interfaces[i])
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Devices {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    #[serde(rename = "type", default)]
    pub iface_type: String,
    #[serde(default, skip_serializing_if = "InterfaceSource::is_empty")]
    pub source: InterfaceSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<InterfaceTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<Model>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<Mac>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<Mtu>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<Alias>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<InterfaceBackend>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_forward: Vec<InterfacePortForward>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Interface {
    pub fn alias_name(&self) -> Option<&str> {
        self.alias.as_ref().map(Alias::name)
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceSource {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bridge: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InterfaceSource {
    pub fn is_empty(&self) -> bool {
        self.device.is_empty() && self.bridge.is_empty() && self.extra.is_empty()
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceTarget {
    pub device: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub managed: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Model {
    #[serde(rename = "type")]
    pub model_type: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Mac {
    pub address: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Mtu {
    pub size: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceBackend {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub backend_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log_file: String,
}

/// Name correlating a domain interface with the VM interface it renders.
///
/// User-defined aliases carry a `ua-` prefix in the serialized document,
/// which is not part of the name.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(from = "AliasRepr", into = "AliasRepr")]
pub struct Alias {
    name: String,
    user_defined: bool,
}

impl Alias {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            user_defined: false,
        }
    }

    pub fn new_user_defined<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            user_defined: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_user_defined(&self) -> bool {
        self.user_defined
    }
}

#[derive(Deserialize, Serialize)]
struct AliasRepr {
    name: String,
}

impl From<AliasRepr> for Alias {
    fn from(repr: AliasRepr) -> Self {
        match repr.name.strip_prefix(ALIAS_USER_DEFINED_PREFIX) {
            Some(name) => Alias::new_user_defined(name),
            None => Alias::new(repr.name),
        }
    }
}

impl From<Alias> for AliasRepr {
    fn from(alias: Alias) -> Self {
        let name = if alias.user_defined {
            format!("{}{}", ALIAS_USER_DEFINED_PREFIX, alias.name)
        } else {
            alias.name
        };
        AliasRepr { name }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Forwarding rule for one protocol. No ranges means every port.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfacePortForward {
    pub proto: Protocol,
    #[serde(rename = "range", default, skip_serializing_if = "Vec::is_empty")]
    pub ranges: Vec<PortForwardRange>,
}

impl InterfacePortForward {
    pub fn all(proto: Protocol) -> Self {
        Self {
            proto,
            ranges: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardRange {
    pub start: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<u16>,
    #[serde(default, with = "yes_no", skip_serializing_if = "is_false")]
    pub exclude: bool,
}

impl PortForwardRange {
    pub fn port(start: u16) -> Self {
        Self {
            start,
            ..Default::default()
        }
    }

    pub fn excluded(start: u16) -> Self {
        Self {
            start,
            end: None,
            exclude: true,
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

mod yes_no {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(if *value { "yes" } else { "no" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        let value = String::deserialize(deserializer)?;
        match value.as_str() {
            "yes" => Ok(true),
            "no" | "" => Ok(false),
            other => Err(D::Error::custom(format!(
                "invalid value {}, expected yes or no",
                other
            ))),
        }
    }
}
