//! The consumer-facing relay-map document shape, byte-compatible with the
//! mesh-VPN client's own `tailcfg.DERPMap`/`DERPRegion`/`DERPNode` — hence
//! the Pascal-cased field names, which stay as-is rather than following
//! Rust's usual `snake_case` convention.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RelayMap {
    #[serde(rename = "HomeParams")]
    pub home_params: HomeParams,
    #[serde(rename = "Regions")]
    pub regions: HashMap<u32, RegionEntry>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HomeParams {
    #[serde(rename = "RegionScore")]
    pub region_score: HashMap<u32, f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegionEntry {
    #[serde(rename = "RegionID")]
    pub region_id: u32,
    #[serde(rename = "RegionCode")]
    pub region_code: String,
    #[serde(rename = "RegionName")]
    pub region_name: String,
    #[serde(rename = "Nodes")]
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Node {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "RegionID")]
    pub region_id: u32,
    #[serde(rename = "HostName")]
    pub host_name: String,
    #[serde(rename = "IPv4", skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Ipv4Addr>,
    #[serde(rename = "IPv6", skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Ipv6Addr>,
    #[serde(rename = "DERPPort")]
    pub derp_port: u16,
    #[serde(
        rename = "InsecureForTests",
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub insecure_for_tests: bool,
}
