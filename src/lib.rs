mod backoff;
pub mod cli;
pub mod cloudinit;
pub mod constants;
pub mod error;
pub mod fs;
pub mod logger;
pub mod netconf;
pub mod platform;
pub mod transport;
