use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
#[cfg(debug_assertions)]
use log::info;
use log::warn;

use crate::sensors::{TemperatureSample, TemperatureSensor};

pub const THERMAL_ROOT: &str = "/sys/class/thermal";

#[derive(Debug, Clone)]
struct Zone {
    kind: String,
    temp_path: PathBuf,
}

/// Maximum over a set of kernel thermal zones.
///
/// The SoC can show a spread of ~10 °C between clusters, so the hottest
/// selected zone is what the EC gets.
#[derive(Debug)]
pub struct ThermalZoneSource {
    zones: Vec<Zone>,
}

impl ThermalZoneSource {
    /// Finds the `thermal_zone*` directories whose `type` is in `wanted`.
    pub fn discover(root: &Path, wanted: &[String]) -> Result<Self> {
        let entries = fs::read_dir(root)
            .with_context(|| format!("Cannot list thermal zones in {}", root.display()))?;

        let mut zones: Vec<Zone> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("thermal_zone"))
            .filter_map(|entry| {
                let dir = entry.path();
                let kind = fs::read_to_string(dir.join("type")).ok()?.trim().to_string();
                wanted.contains(&kind).then(|| Zone {
                    kind,
                    temp_path: dir.join("temp"),
                })
            })
            .collect();
        zones.sort_by(|a, b| a.kind.cmp(&b.kind));

        if zones.is_empty() {
            bail!(
                "None of the thermal zones {:?} exist under {}",
                wanted,
                root.display()
            );
        }
        if zones.len() < wanted.len() {
            warn!(
                "Found {} of {} configured thermal zones: {:?}",
                zones.len(),
                wanted.len(),
                zones.iter().map(|z| z.kind.as_str()).collect::<Vec<_>>()
            );
        }

        #[cfg(debug_assertions)]
        {
            for zone in &zones {
                info!("Using thermal zone {} at {}", zone.kind, zone.temp_path.display());
            }
        }

        Ok(Self { zones })
    }

    pub fn zone_names(&self) -> Vec<&str> {
        self.zones.iter().map(|z| z.kind.as_str()).collect()
    }

    fn read_zone(zone: &Zone) -> Result<f32> {
        let text = fs::read_to_string(&zone.temp_path)
            .with_context(|| format!("Cannot read {}", zone.temp_path.display()))?;
        let millidegrees: i64 = text
            .trim()
            .parse()
            .with_context(|| format!("Malformed temperature in {}", zone.temp_path.display()))?;
        Ok(millidegrees as f32 / 1000.0)
    }

    /// Hottest readable zone. Zones that fail are skipped with a warning.
    pub fn read_max(&self) -> Result<f32> {
        self.zones
            .iter()
            .filter_map(|zone| match Self::read_zone(zone) {
                Ok(celsius) => Some(celsius),
                Err(e) => {
                    warn!("Skipping thermal zone {}: {e:#}", zone.kind);
                    None
                }
            })
            .reduce(f32::max)
            .ok_or_else(|| anyhow!("No thermal zone could be read"))
    }
}

#[async_trait]
impl TemperatureSensor for ThermalZoneSource {
    async fn sample(&self) -> Result<TemperatureSample> {
        self.read_max().map(TemperatureSample::now)
    }

    fn name(&self) -> String {
        format!("thermal:{}", self.zone_names().join("+"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn zone(root: &Path, index: u32, kind: &str, temp: &str) {
        let dir = root.join(format!("thermal_zone{index}"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("type"), format!("{kind}\n")).unwrap();
        fs::write(dir.join("temp"), format!("{temp}\n")).unwrap();
    }

    fn wanted(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn fixture() -> TempDir {
        let root = tempfile::tempdir().unwrap();
        zone(root.path(), 0, "cpu0-0-top-thermal", "48500");
        zone(root.path(), 1, "cpu1-0-top-thermal", "57250");
        zone(root.path(), 2, "gpuss-0-thermal", "41000");
        zone(root.path(), 3, "battery", "30000");
        fs::create_dir_all(root.path().join("cooling_device0")).unwrap();
        root
    }

    #[tokio::test]
    async fn reports_hottest_selected_zone() {
        let root = fixture();
        let source = ThermalZoneSource::discover(
            root.path(),
            &wanted(&["cpu0-0-top-thermal", "cpu1-0-top-thermal", "gpuss-0-thermal"]),
        )
        .unwrap();

        let sample = source.sample().await.unwrap();
        assert_eq!(sample.celsius, 57.25);
    }

    #[test]
    fn unselected_zones_are_ignored() {
        let root = fixture();
        zone(root.path(), 4, "hot-but-ignored", "99000");
        let source =
            ThermalZoneSource::discover(root.path(), &wanted(&["gpuss-0-thermal"])).unwrap();
        assert_eq!(source.zone_names(), vec!["gpuss-0-thermal"]);
        assert_eq!(source.read_max().unwrap(), 41.0);
    }

    #[test]
    fn partial_discovery_still_works() {
        let root = fixture();
        let source = ThermalZoneSource::discover(
            root.path(),
            &wanted(&["cpu0-0-top-thermal", "cpu2-0-top-thermal"]),
        )
        .unwrap();
        assert_eq!(source.zone_names(), vec!["cpu0-0-top-thermal"]);
    }

    #[test]
    fn no_matching_zone_is_an_error() {
        let root = fixture();
        assert!(ThermalZoneSource::discover(root.path(), &wanted(&["nope"])).is_err());
    }

    #[test]
    fn unreadable_zone_is_skipped() {
        let root = fixture();
        let source = ThermalZoneSource::discover(
            root.path(),
            &wanted(&["cpu0-0-top-thermal", "cpu1-0-top-thermal"]),
        )
        .unwrap();
        fs::write(root.path().join("thermal_zone1/temp"), "garbage").unwrap();
        assert_eq!(source.read_max().unwrap(), 48.5);

        fs::remove_file(root.path().join("thermal_zone0/temp")).unwrap();
        assert!(source.read_max().is_err());
    }

    #[test]
    fn name_lists_zones() {
        let root = fixture();
        let source = ThermalZoneSource::discover(
            root.path(),
            &wanted(&["gpuss-0-thermal", "cpu0-0-top-thermal"]),
        )
        .unwrap();
        assert_eq!(source.name(), "thermal:cpu0-0-top-thermal+gpuss-0-thermal");
    }
}
