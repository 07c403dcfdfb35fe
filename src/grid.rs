use serde::Serialize;

use crate::domain::BoundingBox;
use crate::error::GpmError;

const MICRO: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridAxis {
    start_micro: i64,
    step_micro: i64,
    len: usize,
}

impl GridAxis {
    pub const fn new(start_micro: i64, step_micro: i64, len: usize) -> Self {
        Self {
            start_micro,
            step_micro,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn center(&self, index: usize) -> f64 {
        let micro = self.start_micro + self.step_micro * index as i64;
        (micro as f64 / MICRO * 100.0).round() / 100.0
    }

    pub fn centers(&self) -> Vec<f64> {
        (0..self.len).map(|index| self.center(index)).collect()
    }

    /// Index of the cell whose center is closest to `value`; ties go to the
    /// lower index.
    pub fn nearest(&self, value: f64) -> usize {
        if self.len == 0 {
            return 0;
        }
        let target = (value * MICRO).round() as i64;
        let offset = target - self.start_micro;
        let lower = offset.div_euclid(self.step_micro).clamp(0, self.len as i64 - 1);
        let upper = (lower + 1).min(self.len as i64 - 1);
        let distance = |index: i64| (self.start_micro + self.step_micro * index - target).abs();
        if distance(upper) < distance(lower) {
            upper as usize
        } else {
            lower as usize
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalGrid {
    pub lon: GridAxis,
    pub lat: GridAxis,
}

impl Default for GlobalGrid {
    fn default() -> Self {
        Self::IMERG
    }
}

impl GlobalGrid {
    pub const IMERG: GlobalGrid = GlobalGrid {
        lon: GridAxis::new(-179_950_000, 100_000, 3600),
        lat: GridAxis::new(-89_950_000, 100_000, 1800),
    };

    pub fn to_indices(&self, bbox: &BoundingBox) -> Result<GridWindow, GpmError> {
        let min_lon = self.lon.nearest(bbox.min_lon);
        let max_lon = self.lon.nearest(bbox.max_lon);
        let min_lat = self.lat.nearest(bbox.min_lat);
        let max_lat = self.lat.nearest(bbox.max_lat);

        if min_lon >= max_lon {
            return Err(GpmError::InvalidBoundingBox(format!(
                "min_lon must be smaller than max_lon on the grid ({bbox} maps to lon index {min_lon}..{max_lon})"
            )));
        }
        if min_lat >= max_lat {
            return Err(GpmError::InvalidBoundingBox(format!(
                "min_lat must be smaller than max_lat on the grid ({bbox} maps to lat index {min_lat}..{max_lat})"
            )));
        }

        Ok(GridWindow {
            min_lon,
            max_lon,
            min_lat,
            max_lat,
            lon_range: (self.lon.center(min_lon), self.lon.center(max_lon)),
            lat_range: (self.lat.center(min_lat), self.lat.center(max_lat)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GridWindow {
    pub min_lon: usize,
    pub max_lon: usize,
    pub min_lat: usize,
    pub max_lat: usize,
    pub lon_range: (f64, f64),
    pub lat_range: (f64, f64),
}

impl GridWindow {
    pub fn lon_count(&self) -> usize {
        self.max_lon - self.min_lon + 1
    }

    pub fn lat_count(&self) -> usize {
        self.max_lat - self.min_lat + 1
    }

    pub fn contains_lon(&self, lon: f64) -> bool {
        within(lon, self.lon_range)
    }

    pub fn contains_lat(&self, lat: f64) -> bool {
        within(lat, self.lat_range)
    }
}

fn within(value: f64, (low, high): (f64, f64)) -> bool {
    const TOLERANCE: f64 = 1e-4;
    value >= low - TOLERANCE && value <= high + TOLERANCE
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn axis_centers_cover_globe() {
        let grid = GlobalGrid::IMERG;
        assert_eq!(grid.lon.center(0), -179.95);
        assert_eq!(grid.lon.center(3599), 179.95);
        assert_eq!(grid.lat.center(0), -89.95);
        assert_eq!(grid.lat.center(1799), 89.95);
        assert_eq!(grid.lat.centers().len(), 1800);
    }

    #[test]
    fn nearest_breaks_ties_low() {
        let grid = GlobalGrid::IMERG;
        // -72.0 sits exactly between -72.05 (1079) and -71.95 (1080).
        assert_eq!(grid.lon.nearest(-72.0), 1079);
        assert_eq!(grid.lon.nearest(-71.96), 1080);
        assert_eq!(grid.lon.nearest(-200.0), 0);
        assert_eq!(grid.lon.nearest(200.0), 3599);
    }

    #[test]
    fn maps_example_box() {
        let bbox = BoundingBox::new(-33.0, 3.0, -72.0, -35.0).unwrap();
        let window = GlobalGrid::default().to_indices(&bbox).unwrap();
        assert_eq!((window.min_lon, window.max_lon), (1079, 1449));
        assert_eq!((window.min_lat, window.max_lat), (569, 929));
        assert_eq!(window.lon_range, (-72.05, -35.05));
        assert_eq!(window.lat_range, (-33.05, 2.95));
    }

    #[test]
    fn single_cell_box_is_rejected() {
        let bbox = BoundingBox::new(0.01, 0.04, 0.01, 0.04).unwrap();
        let err = GlobalGrid::default().to_indices(&bbox).unwrap_err();
        assert_matches!(err, GpmError::InvalidBoundingBox(_));
    }
}
