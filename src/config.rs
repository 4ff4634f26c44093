//! Switch initial configuration shapes consumed from the environment
//! loader. Parsing/loading the surrounding config file is out of scope for
//! this crate; these types exist so an embedder can hand the switch a
//! `serde`-deserialized value directly.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PortType {
    Usp,
    Dsp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortConfig {
    #[serde(rename = "type")]
    pub port_type: PortType,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualSwitchConfig {
    pub upstream_port_index: usize,
    pub vppb_counts: usize,
    /// Port index per vPPB, or `-1` to leave that vPPB unbound at startup.
    pub initial_bounds: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SldConfig {
    pub port_index: usize,
    pub memory_size: u64,
    pub memory_file: String,
    pub serial_number: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MldLdConfig {
    pub ld_id: u8,
    pub memory_size: u64,
    pub memory_file: String,
    pub serial_number: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MldConfig {
    pub mld_port_index: usize,
    pub lds: Vec<MldLdConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchConfig {
    pub ports: Vec<PortConfig>,
    pub virtual_switches: Vec<VirtualSwitchConfig>,
    #[serde(default)]
    pub slds: Vec<SldConfig>,
    #[serde(default)]
    pub mlds: Vec<MldConfig>,
}
