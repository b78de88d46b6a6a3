use std::fmt;
use std::num::NonZeroI32;
use std::str::FromStr;

use anyhow::{Context, Error, Result, anyhow};
use futures::StreamExt;
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use rtnetlink::{Error as NlError, Handle as NlHandle, new_connection};
use rustix::io::Errno;
use thiserror::Error as ThisError;
use tokio::runtime::{Builder, Handle as RtHandle, Runtime};

use crate::api::Interface;

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

// Accepts 00:11:22:33:44:55, 00-11-22-33-44-55 and 0011.2233.4455.
impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || anyhow!("invalid MAC address {}", s);
        let groups: Vec<&str> = match s.len() {
            17 => {
                let sep = match s.as_bytes()[2] {
                    b':' => ':',
                    b'-' => '-',
                    _ => return Err(invalid()),
                };
                s.split(sep).collect()
            }
            14 => s.split('.').collect(),
            _ => return Err(invalid()),
        };
        let valid_groups = match groups.len() {
            6 => groups.iter().all(|g| g.len() == 2),
            3 => s.len() == 14 && groups.iter().all(|g| g.len() == 4),
            _ => false,
        };
        if !valid_groups {
            return Err(invalid());
        }
        let hex = groups.concat();
        if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let mut octets = [0u8; 6];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
        }
        Ok(Self(octets))
    }
}

/// Kernel attributes of a link, as seen in the current network namespace.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LinkAttrs {
    pub name: String,
    pub mac: Option<MacAddress>,
    pub mtu: u32,
}

#[derive(Debug, ThisError)]
pub enum LinkError {
    #[error("link {0} not found")]
    NotFound(String),
    #[error("failed to get link {name}: {source}")]
    Netlink {
        name: String,
        #[source]
        source: NlError,
    },
}

/// Resolves link names in the current network namespace.
pub trait LinkLookup {
    fn link_by_name(&self, name: &str) -> Result<LinkAttrs, LinkError>;
}

/// Parses the MAC address declared on a VM interface, if any.
pub fn resolve_declared_address(iface: &Interface) -> Result<Option<MacAddress>> {
    if iface.mac_address.is_empty() {
        return Ok(None);
    }
    iface
        .mac_address
        .parse()
        .map(Some)
        .with_context(|| format!("unable to parse MAC address of interface {}", iface.name))
}

pub(crate) struct NetlinkConnection {
    handle: NlHandle,
}

impl NetlinkConnection {
    pub(crate) fn new() -> Result<Self> {
        let rt = RtHandle::try_current().map_err(|_| anyhow!("tokio is not running"))?;
        let (connection, handle, _) =
            new_connection().map_err(|e| anyhow!("unable to create netlink socket: {}", e))?;
        rt.spawn(connection);
        Ok(Self { handle })
    }

    pub(crate) async fn link_by_name(&self, name: &str) -> Result<LinkAttrs, LinkError> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.next().await {
            Some(Ok(link)) => Ok(extract_link_attrs(link)),
            Some(Err(NlError::NetlinkError(msg)))
                if msg.code.map(NonZeroI32::get) == Some(-Errno::NODEV.raw_os_error()) =>
            {
                Err(LinkError::NotFound(name.into()))
            }
            Some(Err(e)) => Err(LinkError::Netlink {
                name: name.into(),
                source: e,
            }),
            None => Err(LinkError::NotFound(name.into())),
        }
    }
}

/// Blocking link lookup over rtnetlink.
///
/// The netlink socket is bound to the namespace of the thread that calls
/// `new`, so construct it after entering the target namespace.
pub struct NetlinkLinks {
    rt: Runtime,
    nl: NetlinkConnection,
}

impl NetlinkLinks {
    pub fn new() -> Result<Self> {
        let rt = Builder::new_current_thread()
            .enable_io()
            .build()
            .context("unable to create netlink runtime")?;
        let nl = {
            let _guard = rt.enter();
            NetlinkConnection::new().context("failed to create netlink connection")?
        };
        Ok(Self { rt, nl })
    }
}

impl LinkLookup for NetlinkLinks {
    fn link_by_name(&self, name: &str) -> Result<LinkAttrs, LinkError> {
        self.rt.block_on(self.nl.link_by_name(name))
    }
}

fn extract_link_attrs(link: LinkMessage) -> LinkAttrs {
    let mut attrs = LinkAttrs::default();
    for nla in link.attributes {
        match nla {
            LinkAttribute::IfName(n) => attrs.name = n,
            LinkAttribute::Address(addr) if addr.len() == 6 => {
                let mut mac = [0u8; 6];
                mac.copy_from_slice(&addr[..6]);
                attrs.mac = Some(MacAddress(mac));
            }
            LinkAttribute::Mtu(mtu) => attrs.mtu = mtu,
            _ => {}
        }
    }
    attrs
}
