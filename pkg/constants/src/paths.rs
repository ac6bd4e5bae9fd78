//! Filesystem path constants.

/// Default config file path for the controller binary.
pub const DEFAULT_CONFIG: &str = "/etc/converge/config.yaml";

/// Default data directory for the state store.
pub const DEFAULT_DATA_DIR: &str = "/tmp/converge-data";
