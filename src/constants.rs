pub const ANNOTATION_ISTIO_INJECT: &str = "sidecar.istio.io/inject";

pub const ALIAS_USER_DEFINED_PREFIX: &str = "ua-";

pub const DIR_PROC: &str = "/proc";

pub const FILE_CONFIG: &str = "/etc/virt-netsetup/config.yaml";
pub const FILE_PASST_LOG: &str = "/var/run/kubevirt/passt.log";

pub const IFACE_BACKEND_PASST: &str = "passt";
pub const IFACE_TYPE_ETHERNET: &str = "ethernet";
pub const IFACE_TYPE_USER: &str = "user";

pub const MANAGED_NO: &str = "no";

// IFNAMSIZ includes the trailing NUL.
pub const MAX_IFACE_NAME_LEN: usize = 15;

pub const TAP_NAME_PREFIX: &str = "tap";
