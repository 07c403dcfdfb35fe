use std::fmt;
use std::str::FromStr;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::GpmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawDateRange")]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

#[derive(Deserialize)]
struct RawDateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl TryFrom<RawDateRange> for DateRange {
    type Error = GpmError;

    fn try_from(raw: RawDateRange) -> Result<Self, Self::Error> {
        Self::new(raw.start, raw.end)
    }
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, GpmError> {
        if start > end {
            return Err(GpmError::InvalidRequest(format!(
                "date range start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn days(&self) -> Vec<NaiveDate> {
        let mut days = Vec::new();
        let mut current = Some(self.start);
        while let Some(day) = current {
            if day > self.end {
                break;
            }
            days.push(day);
            current = day.checked_add_days(Days::new(1));
        }
        days
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

impl FromStr for DateRange {
    type Err = GpmError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (start, end) = value
            .trim()
            .split_once("..")
            .ok_or_else(|| GpmError::InvalidRequest(format!("invalid date range: {value}")))?;
        Self::new(parse_date(start)?, parse_date(end)?)
    }
}

pub fn parse_date(value: &str) -> Result<NaiveDate, GpmError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|err| GpmError::InvalidRequest(format!("invalid date {value}: {err}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Result<Self, GpmError> {
        let bbox = Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        };
        bbox.validate()?;
        Ok(bbox)
    }

    pub fn validate(&self) -> Result<(), GpmError> {
        let values = [self.min_lat, self.max_lat, self.min_lon, self.max_lon];
        if values.iter().any(|value| !value.is_finite()) {
            return Err(GpmError::InvalidBoundingBox(format!(
                "non-finite bound in {self}"
            )));
        }
        if !(-90.0..=90.0).contains(&self.min_lat) || !(-90.0..=90.0).contains(&self.max_lat) {
            return Err(GpmError::InvalidBoundingBox(format!(
                "latitude outside [-90, 90] in {self}"
            )));
        }
        if !(-180.0..=180.0).contains(&self.min_lon) || !(-180.0..=180.0).contains(&self.max_lon)
        {
            return Err(GpmError::InvalidBoundingBox(format!(
                "longitude outside [-180, 180] in {self}"
            )));
        }
        if self.min_lat >= self.max_lat {
            return Err(GpmError::InvalidBoundingBox(
                "min_lat must be smaller than max_lat".to_string(),
            ));
        }
        if self.min_lon >= self.max_lon {
            return Err(GpmError::InvalidBoundingBox(
                "min_lon must be smaller than max_lon".to_string(),
            ));
        }
        Ok(())
    }

    pub fn global() -> Self {
        Self {
            min_lat: -90.0,
            max_lat: 90.0,
            min_lon: -180.0,
            max_lon: 180.0,
        }
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lat[{}, {}] lon[{}, {}]",
            self.min_lat, self.max_lat, self.min_lon, self.max_lon
        )
    }
}

impl FromStr for BoundingBox {
    type Err = GpmError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| GpmError::InvalidBoundingBox(format!("{value}: {err}")))?;
        match parts.as_slice() {
            [min_lat, max_lat, min_lon, max_lon] => {
                Self::new(*min_lat, *max_lat, *min_lon, *max_lon)
            }
            _ => Err(GpmError::InvalidBoundingBox(format!(
                "expected min_lat,max_lat,min_lon,max_lon, got {value}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableSelection {
    Single(String),
    Many(Vec<String>),
}

impl VariableSelection {
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let raw = match self {
            VariableSelection::Single(name) => std::slice::from_ref(name),
            VariableSelection::Many(list) => list.as_slice(),
        };
        for name in raw {
            let name = name.trim();
            if !name.is_empty() && !names.iter().any(|existing| existing == name) {
                names.push(name.to_string());
            }
        }
        names
    }
}

impl From<&str> for VariableSelection {
    fn from(value: &str) -> Self {
        VariableSelection::Single(value.to_string())
    }
}

impl From<Vec<String>> for VariableSelection {
    fn from(value: Vec<String>) -> Self {
        VariableSelection::Many(value)
    }
}

impl FromStr for VariableSelection {
    type Err = GpmError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let names = value
            .split(',')
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect::<Vec<_>>();
        if names.is_empty() {
            return Err(GpmError::InvalidRequest("no variables requested".to_string()));
        }
        Ok(VariableSelection::Many(names))
    }
}
