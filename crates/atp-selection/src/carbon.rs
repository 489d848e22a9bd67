//! Carbon-aware routing weights.
//!
//! A pure function over the configured region -> grid-intensity map. In
//! carbon-aware mode the selection engine re-sorts its initial cost ordering
//! by weighted cost before any other filter. No I/O.

use std::collections::HashMap;

use atp_core::config::CarbonSettings;

/// Intensity assumed for regions missing from the configured map.
const DEFAULT_INTENSITY: f64 = 400.0;

pub struct CarbonTracker {
    enabled: bool,
    region_intensity: HashMap<String, f64>,
}

impl CarbonTracker {
    pub fn new(settings: &CarbonSettings) -> Self {
        Self {
            enabled: settings.enabled,
            region_intensity: settings.region_intensity.clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Grid intensity for a region in gCO2e/kWh.
    pub fn intensity(&self, region: &str) -> f64 {
        self.region_intensity
            .get(region)
            .copied()
            .unwrap_or(DEFAULT_INTENSITY)
    }

    /// Cost weighted by the region's carbon intensity. 1000 gCO2e/kWh
    /// doubles the effective cost; a 250 g region adds 25 %.
    pub fn routing_weight(&self, region: &str, base_cost: f64) -> f64 {
        if !self.enabled {
            return base_cost;
        }
        base_cost * (1.0 + self.intensity(region) / 1000.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(enabled: bool) -> CarbonTracker {
        CarbonTracker::new(&CarbonSettings {
            enabled,
            ..CarbonSettings::default()
        })
    }

    #[test]
    fn disabled_tracker_passes_cost_through() {
        let t = tracker(false);
        assert_eq!(t.routing_weight("asia-east", 2.0), 2.0);
    }

    #[test]
    fn dirtier_region_weighs_more() {
        let t = tracker(true);
        let clean = t.routing_weight("eu-west", 1.0); // 190 g
        let dirty = t.routing_weight("asia-east", 1.0); // 540 g
        assert!(dirty > clean);
        assert!((clean - 1.19).abs() < 1e-9);
        assert!((dirty - 1.54).abs() < 1e-9);
    }

    #[test]
    fn unknown_region_uses_default_intensity() {
        let t = tracker(true);
        assert!((t.routing_weight("mars-1", 1.0) - 1.4).abs() < 1e-9);
    }

    #[test]
    fn weighting_can_reorder_a_cost_ranking() {
        let t = tracker(true);
        // Cheap-but-dirty vs slightly pricier-but-clean.
        let dirty = t.routing_weight("asia-east", 1.00); // 1.54
        let clean = t.routing_weight("eu-west", 1.25); // 1.4875
        assert!(clean < dirty);
    }
}
