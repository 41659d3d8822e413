/// Region registry for the flood risk service.
///
/// Defines the monitored regions, each with a representative coordinate
/// that the feature resolver queries the terrain, water-body and rainfall
/// layers at. This is the single source of truth for region ids; all other
/// modules should reference regions from here rather than hardcoding ids.
///
/// The registry is loaded from a TOML file (see `regions.toml` at the
/// repository root) so deployments can add districts without a rebuild.

use serde::Deserialize;
use std::collections::HashSet;
use std::fs;

use crate::config::ConfigError;
use crate::ingest::iem::AsosStation;
use crate::model::{Coordinate, RegionId};

// ---------------------------------------------------------------------------
// Lookup seam
// ---------------------------------------------------------------------------

/// Resolves a region id to the coordinate its features are measured at.
pub trait RegionLookup: Send + Sync {
    fn coordinate_of(&self, region_id: &RegionId) -> Option<Coordinate>;

    /// People living in the region, when known. Quoted in alert messages.
    fn population_of(&self, _region_id: &RegionId) -> Option<u64> {
        None
    }
}

// ---------------------------------------------------------------------------
// Region metadata
// ---------------------------------------------------------------------------

/// Metadata for a single monitored region.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Region {
    pub id: RegionId,
    /// Human-readable region name.
    pub name: String,
    /// Administrative district the region belongs to.
    pub district: String,
    /// Representative point, usually the most flood-exposed settlement.
    #[serde(flatten)]
    pub location: Coordinate,
    /// Exposed population, where known. Quoted in the region's alert
    /// messages.
    #[serde(default)]
    pub population: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RegionFile {
    #[serde(default)]
    regions: Vec<Region>,
    #[serde(default)]
    asos_stations: Vec<AsosStationEntry>,
}

#[derive(Debug, Deserialize)]
struct AsosStationEntry {
    station_id: String,
    #[serde(flatten)]
    location: Coordinate,
}

/// All monitored regions plus the ASOS stations available to serve them.
#[derive(Debug, Clone, Default)]
pub struct RegionRegistry {
    regions: Vec<Region>,
    asos_stations: Vec<AsosStation>,
}

impl RegionRegistry {
    pub fn new(regions: Vec<Region>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for region in &regions {
            if !seen.insert(region.id.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate region id '{}'",
                    region.id
                )));
            }
            if region.name.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "region '{}' has an empty name",
                    region.id
                )));
            }
        }
        Ok(RegionRegistry {
            regions,
            asos_stations: Vec::new(),
        })
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn asos_stations(&self) -> &[AsosStation] {
        &self.asos_stations
    }

    /// Returns the ids of all monitored regions, in file order.
    pub fn all_region_ids(&self) -> Vec<RegionId> {
        self.regions.iter().map(|r| r.id.clone()).collect()
    }

    /// Looks up a region by id. Returns `None` if not found.
    pub fn find_region(&self, region_id: &RegionId) -> Option<&Region> {
        self.regions.iter().find(|r| &r.id == region_id)
    }

    pub fn regions_in_district(&self, district: &str) -> Vec<&Region> {
        self.regions
            .iter()
            .filter(|r| r.district.eq_ignore_ascii_case(district))
            .collect()
    }
}

impl RegionLookup for RegionRegistry {
    fn coordinate_of(&self, region_id: &RegionId) -> Option<Coordinate> {
        self.find_region(region_id).map(|r| r.location)
    }

    fn population_of(&self, region_id: &RegionId) -> Option<u64> {
        self.find_region(region_id).and_then(|r| r.population)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

pub fn load_regions(path: &str) -> Result<RegionRegistry, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;
    parse_regions(&text)
}

pub fn parse_regions(text: &str) -> Result<RegionRegistry, ConfigError> {
    let file: RegionFile = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let mut registry = RegionRegistry::new(file.regions)?;
    let mut seen = HashSet::new();
    for entry in file.asos_stations {
        if !seen.insert(entry.station_id.clone()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate ASOS station '{}'",
                entry.station_id
            )));
        }
        registry.asos_stations.push(AsosStation {
            station_id: entry.station_id,
            location: entry.location,
        });
    }
    Ok(registry)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[regions]]
        id = "nsanje"
        name = "Nsanje Boma"
        district = "Nsanje"
        latitude = -16.92
        longitude = 35.26
        population = 299168

        [[regions]]
        id = "chikwawa"
        name = "Chikwawa"
        district = "Chikwawa"
        latitude = -16.03
        longitude = 34.80

        [[regions]]
        id = "bangula"
        name = "Bangula"
        district = "Nsanje"
        latitude = -16.58
        longitude = 35.11

        [[asos_stations]]
        station_id = "FWCL"
        latitude = -15.679
        longitude = 34.974
    "#;

    #[test]
    fn test_shipped_registry_parses() {
        let registry = parse_regions(include_str!("../regions.toml")).expect("regions.toml parses");
        assert_eq!(registry.regions().len(), 6);
        assert_eq!(registry.regions_in_district("nsanje").len(), 2);
        assert_eq!(registry.asos_stations().len(), 3);
    }

    #[test]
    fn test_sample_registry_parses() {
        let registry = parse_regions(SAMPLE).expect("sample should parse");
        assert_eq!(registry.regions().len(), 3);
        assert_eq!(registry.asos_stations().len(), 1);
        assert_eq!(registry.all_region_ids()[0].as_str(), "nsanje");
    }

    #[test]
    fn test_find_region_returns_correct_entry() {
        let registry = parse_regions(SAMPLE).unwrap();
        let id = RegionId::parse("chikwawa").unwrap();
        let region = registry.find_region(&id).expect("chikwawa should be in registry");
        assert_eq!(region.name, "Chikwawa");
        assert_eq!(region.population, None);
        assert_eq!(registry.coordinate_of(&id), Some(region.location));
        assert_eq!(registry.population_of(&id), None);

        let nsanje = RegionId::parse("nsanje").unwrap();
        assert_eq!(registry.population_of(&nsanje), Some(299168));
    }

    #[test]
    fn test_find_region_returns_none_for_unknown_id() {
        let registry = parse_regions(SAMPLE).unwrap();
        let id = RegionId::parse("karonga").unwrap();
        assert!(registry.find_region(&id).is_none());
        assert!(registry.coordinate_of(&id).is_none());
    }

    #[test]
    fn test_regions_in_district_groups_by_district() {
        let registry = parse_regions(SAMPLE).unwrap();
        let nsanje = registry.regions_in_district("nsanje");
        assert_eq!(nsanje.len(), 2);
    }

    #[test]
    fn test_duplicate_region_ids_are_rejected() {
        let text = r#"
            [[regions]]
            id = "nsanje"
            name = "A"
            district = "Nsanje"
            latitude = -16.9
            longitude = 35.2

            [[regions]]
            id = "nsanje"
            name = "B"
            district = "Nsanje"
            latitude = -16.9
            longitude = 35.2
        "#;
        assert!(matches!(parse_regions(text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_malformed_region_id_is_rejected() {
        let text = r#"
            [[regions]]
            id = "not valid"
            name = "A"
            district = "X"
            latitude = 0.0
            longitude = 0.0
        "#;
        assert!(matches!(parse_regions(text), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_out_of_bounds_coordinate_is_rejected() {
        let text = r#"
            [[regions]]
            id = "nowhere"
            name = "A"
            district = "X"
            latitude = 123.0
            longitude = 0.0
        "#;
        assert!(parse_regions(text).is_err());
    }
}
