use serde::Serialize;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::providers::Coordinate;

/// `[lon, lat]`, GeoJSON axis order.
pub type Position = [f64; 2];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FootprintKind {
    Venue,
    Parking,
}

impl FootprintKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FootprintKind::Venue => "venue",
            FootprintKind::Parking => "parking",
        }
    }
}

/// A single closed exterior ring.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    ring: Vec<Position>,
}

impl Polygon {
    pub fn ring(&self) -> &[Position] {
        &self.ring
    }

    pub fn is_closed(&self) -> bool {
        self.ring.len() >= 4 && self.ring.first() == self.ring.last()
    }

    /// Shoelace area in square degrees; positive for counter-clockwise rings.
    pub fn signed_area(&self) -> f64 {
        self.ring
            .windows(2)
            .map(|pair| pair[0][0] * pair[1][1] - pair[1][0] * pair[0][1])
            .sum::<f64>()
            / 2.0
    }
}

/// Axis-aligned square centred on `coord`, counter-clockwise from the
/// south-west corner.
fn square(coord: &Coordinate, half_width: f64) -> AppResult<Polygon> {
    if !half_width.is_finite() || half_width <= 0.0 {
        return Err(AppError::InvalidGeometry(format!(
            "half-width must be positive, got {half_width}"
        )));
    }
    let (lon, lat) = (coord.lon, coord.lat);
    if !(lat - half_width >= -90.0 && lat + half_width <= 90.0) {
        return Err(AppError::InvalidGeometry(format!(
            "square of half-width {half_width} around lat {lat} leaves the globe"
        )));
    }
    let ring = vec![
        [lon - half_width, lat - half_width],
        [lon + half_width, lat - half_width],
        [lon + half_width, lat + half_width],
        [lon - half_width, lat + half_width],
        [lon - half_width, lat - half_width],
    ];
    Ok(Polygon { ring })
}

pub fn venue_polygon(coord: &Coordinate, half_width: f64) -> AppResult<Polygon> {
    square(coord, half_width)
}

pub fn parking_polygon(coord: &Coordinate, half_width: f64) -> AppResult<Polygon> {
    square(coord, half_width)
}

#[derive(Debug, Clone)]
pub struct FootprintGenerator {
    venue_half_width: f64,
    parking_half_width: Option<f64>,
}

impl FootprintGenerator {
    /// Pass `None` for `parking_half_width` to emit venue footprints only.
    pub fn new(venue_half_width: f64, parking_half_width: Option<f64>) -> AppResult<Self> {
        if !venue_half_width.is_finite() || venue_half_width <= 0.0 {
            return Err(AppError::InvalidGeometry(format!(
                "venue half-width must be positive, got {venue_half_width}"
            )));
        }
        if let Some(parking) = parking_half_width {
            if !parking.is_finite() || parking <= venue_half_width {
                return Err(AppError::InvalidGeometry(format!(
                    "parking half-width {parking} must exceed venue half-width {venue_half_width}"
                )));
            }
        }
        Ok(Self {
            venue_half_width,
            parking_half_width,
        })
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        Self::new(
            config.venue_half_width,
            config
                .include_parking
                .then_some(config.parking_half_width),
        )
    }

    pub fn footprints_per_record(&self) -> usize {
        if self.parking_half_width.is_some() {
            2
        } else {
            1
        }
    }

    pub fn footprints(&self, coord: &Coordinate) -> AppResult<Vec<(FootprintKind, Polygon)>> {
        let mut footprints = vec![(
            FootprintKind::Venue,
            venue_polygon(coord, self.venue_half_width)?,
        )];
        if let Some(half_width) = self.parking_half_width {
            footprints.push((FootprintKind::Parking, parking_polygon(coord, half_width)?));
        }
        Ok(footprints)
    }
}
