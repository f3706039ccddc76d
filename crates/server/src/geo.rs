// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pure in-memory IP geolocation.
//!
//! Lookups are longest-prefix matches over a static table: a small built-in
//! seed plus an optional JSON data file loaded once at startup. Misses yield
//! all-`None` fields; nothing downstream treats that as an error.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Enrichment result for a peer IP. All fields optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub country_code: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub isp: Option<String>,
}

/// One table row as it appears in the JSON data file.
#[derive(Debug, Clone, Deserialize)]
struct GeoFileEntry {
    cidr: String,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default)]
    isp: Option<String>,
}

struct Prefix {
    network: u32,
    len: u8,
    info: GeoInfo,
}

/// In-memory prefix table. Construction is the only fallible step; lookups
/// never fail and never perform I/O.
pub struct GeoResolver {
    prefixes: Vec<Prefix>,
}

impl GeoResolver {
    /// Build a resolver from the built-in seed table plus an optional data
    /// file. A bad file is a warning, not a startup failure.
    pub fn load(data_file: Option<&Path>) -> Self {
        let mut prefixes = builtin_table();

        if let Some(path) = data_file {
            match std::fs::read_to_string(path) {
                Ok(contents) => match serde_json::from_str::<Vec<GeoFileEntry>>(&contents) {
                    Ok(entries) => {
                        let before = prefixes.len();
                        for entry in entries {
                            match parse_cidr(&entry.cidr) {
                                Some((network, len)) => prefixes.push(Prefix {
                                    network,
                                    len,
                                    info: GeoInfo {
                                        country_code: entry.country,
                                        city: entry.city,
                                        latitude: entry.lat,
                                        longitude: entry.lon,
                                        isp: entry.isp,
                                    },
                                }),
                                None => {
                                    tracing::warn!(cidr = %entry.cidr, "geoip: skipping bad cidr")
                                }
                            }
                        }
                        tracing::info!(
                            loaded = prefixes.len() - before,
                            path = %path.display(),
                            "geoip: data file loaded"
                        );
                    }
                    Err(e) => tracing::warn!(err = %e, "geoip: data file is not valid JSON"),
                },
                Err(e) => tracing::warn!(err = %e, path = %path.display(), "geoip: cannot read data file"),
            }
        }

        // Longest prefix first so the linear scan returns the most specific hit.
        prefixes.sort_by(|a, b| b.len.cmp(&a.len));
        Self { prefixes }
    }

    /// Look up geo fields for a peer address. IPv6 and unknown ranges miss.
    pub fn lookup(&self, addr: IpAddr) -> GeoInfo {
        let IpAddr::V4(v4) = addr else {
            return GeoInfo::default();
        };
        let ip = u32::from(v4);
        for prefix in &self.prefixes {
            if masked(ip, prefix.len) == masked(prefix.network, prefix.len) {
                return prefix.info.clone();
            }
        }
        GeoInfo::default()
    }

    /// Convenience for textual peer addresses; unparseable input misses.
    pub fn lookup_str(&self, addr: &str) -> GeoInfo {
        match addr.parse::<IpAddr>() {
            Ok(ip) => self.lookup(ip),
            Err(_) => GeoInfo::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

fn masked(ip: u32, len: u8) -> u32 {
    if len == 0 {
        0
    } else {
        ip & (u32::MAX << (32 - u32::from(len.min(32))))
    }
}

fn parse_cidr(cidr: &str) -> Option<(u32, u8)> {
    let (addr, len) = cidr.split_once('/')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let len: u8 = len.parse().ok()?;
    if len > 32 {
        return None;
    }
    Some((u32::from(addr), len))
}

fn seed(cidr: &str, country: &str, city: &str, lat: f64, lon: f64, isp: &str) -> Option<Prefix> {
    let (network, len) = parse_cidr(cidr)?;
    Some(Prefix {
        network,
        len,
        info: GeoInfo {
            country_code: Some(country.to_owned()),
            city: Some(city.to_owned()),
            latitude: Some(lat),
            longitude: Some(lon),
            isp: Some(isp.to_owned()),
        },
    })
}

/// Well-known anycast/public resolver ranges, enough for smoke tests and
/// deployments that have not mounted a data file yet.
fn builtin_table() -> Vec<Prefix> {
    [
        seed("8.8.8.0/24", "US", "Mountain View", 37.4056, -122.0775, "Google LLC"),
        seed("8.8.4.0/24", "US", "Mountain View", 37.4056, -122.0775, "Google LLC"),
        seed("1.1.1.0/24", "AU", "Sydney", -33.8688, 151.2093, "Cloudflare"),
        seed("1.0.0.0/24", "AU", "Sydney", -33.8688, 151.2093, "Cloudflare"),
        seed("9.9.9.0/24", "US", "Berkeley", 37.8715, -122.2730, "Quad9"),
        seed("208.67.222.0/24", "US", "San Francisco", 37.7749, -122.4194, "Cisco OpenDNS"),
    ]
    .into_iter()
    .flatten()
    .collect()
}

#[cfg(test)]
#[path = "geo_tests.rs"]
mod tests;
