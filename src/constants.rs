pub const DIR_DISK_BY_LABEL: &str = "/dev/disk/by-label";
pub const DIR_MNT: &str = "/mnt";

pub const FILE_PROC_CMDLINE: &str = "/proc/cmdline";
pub const FILE_SMBIOS_SERIAL: &str = "/sys/class/dmi/id/product_serial";

pub const CIDATA_LABEL: &str = "cidata";
pub const CIDATA_META_DATA: &str = "meta-data";
pub const CIDATA_NETWORK_CONFIG: &str = "network-config";
pub const CIDATA_USER_DATA: &str = "user-data";

pub const HCLOUD_METADATA_ENDPOINT: &str = "http://169.254.169.254/hetzner/v1/metadata";
pub const HCLOUD_NETWORK_ENDPOINT: &str =
    "http://169.254.169.254/hetzner/v1/metadata/network-config";
pub const HCLOUD_USER_DATA_ENDPOINT: &str = "http://169.254.169.254/hetzner/v1/userdata";

pub const SCALEWAY_METADATA_ENDPOINT: &str = "http://169.254.42.42/conf?format=json";
pub const SCALEWAY_USER_DATA_ENDPOINT: &str = "http://169.254.42.42/user_data/cloud-init";

pub const ENV_DEBUG: &str = "PLATFORM_METADATA_DEBUG";
pub const KERNEL_PARAM_PLATFORM: &str = "platform";

pub const CLOUD_CONFIG_HEADER: &[u8] = b"#cloud-config";
