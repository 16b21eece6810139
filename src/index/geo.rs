// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Geospatial helpers.
//!
//! The in-memory backend computes distances and geohashes here using the same
//! earth model Redis uses, so both backends answer geo queries alike.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::traits::{GeoMatch, GeoPoint, IndexError};

/// Earth radius used by Redis' GEO commands, in meters.
pub const EARTH_RADIUS_M: f64 = 6_372_797.560_856;

const GEOHASH_ALPHABET: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";
const GEOHASH_LEN: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoUnit {
    #[default]
    M,
    Km,
    Mi,
    Ft,
}

impl GeoUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M => "m",
            Self::Km => "km",
            Self::Mi => "mi",
            Self::Ft => "ft",
        }
    }

    pub fn meters_per_unit(&self) -> f64 {
        match self {
            Self::M => 1.0,
            Self::Km => 1000.0,
            Self::Mi => 1609.34,
            Self::Ft => 0.3048,
        }
    }

    pub fn from_meters(&self, meters: f64) -> f64 {
        meters / self.meters_per_unit()
    }

    pub fn to_meters(&self, value: f64) -> f64 {
        value * self.meters_per_unit()
    }
}

impl FromStr for GeoUnit {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "m" => Ok(Self::M),
            "km" => Ok(Self::Km),
            "mi" => Ok(Self::Mi),
            "ft" => Ok(Self::Ft),
            other => Err(IndexError::InvalidPayload(format!("unknown distance unit '{}'", other))),
        }
    }
}

/// Where a radius search is centered.
#[derive(Debug, Clone, PartialEq)]
pub enum GeoCenter {
    Point(GeoPoint),
    /// An existing member of the same collection
    Member(String),
}

/// Great-circle distance in meters.
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let u = ((lat2 - lat1) / 2.0).sin();
    let v = ((b.longitude - a.longitude).to_radians() / 2.0).sin();
    let h = u * u + lat1.cos() * lat2.cos() * v * v;
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Standard 11-character base32 geohash.
pub fn geohash(point: GeoPoint) -> String {
    let (mut lon_lo, mut lon_hi) = (-180.0_f64, 180.0_f64);
    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let mut out = String::with_capacity(GEOHASH_LEN);
    let mut even = true;
    let mut bits = 0u8;
    let mut idx = 0usize;

    while out.len() < GEOHASH_LEN {
        // Even bits refine longitude, odd bits latitude
        let (lo, hi, value) = if even {
            (&mut lon_lo, &mut lon_hi, point.longitude)
        } else {
            (&mut lat_lo, &mut lat_hi, point.latitude)
        };
        let mid = (*lo + *hi) / 2.0;
        idx <<= 1;
        if value >= mid {
            idx |= 1;
            *lo = mid;
        } else {
            *hi = mid;
        }
        even = !even;
        bits += 1;
        if bits == 5 {
            out.push(GEOHASH_ALPHABET[idx] as char);
            bits = 0;
            idx = 0;
        }
    }
    out
}

/// Members within `radius` of `center`, nearest first.
pub fn search<'a>(
    members: impl IntoIterator<Item = (&'a String, &'a GeoPoint)>,
    center: GeoPoint,
    radius: f64,
    unit: GeoUnit,
) -> Vec<GeoMatch> {
    let limit_m = unit.to_meters(radius);
    let mut found: Vec<(f64, GeoMatch)> = members
        .into_iter()
        .filter_map(|(member, point)| {
            let meters = haversine_m(center, *point);
            (meters <= limit_m).then(|| {
                (
                    meters,
                    GeoMatch {
                        member: member.clone(),
                        distance: unit.from_meters(meters),
                        position: *point,
                    },
                )
            })
        })
        .collect();
    found.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.member.cmp(&b.1.member)));
    found.into_iter().map(|(_, m)| m).collect()
}
