//! Domain types shared by the ingestion pipeline and the HTTP surface

use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CommonError;

/// Catalog entity types published in every monthly dump
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Artists,
    Labels,
    Masters,
    Releases,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::Artists,
        EntityType::Labels,
        EntityType::Masters,
        EntityType::Releases,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Artists => "artists",
            EntityType::Labels => "labels",
            EntityType::Masters => "masters",
            EntityType::Releases => "releases",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "artists" | "artist" => Ok(EntityType::Artists),
            "labels" | "label" => Ok(EntityType::Labels),
            "masters" | "master" => Ok(EntityType::Masters),
            "releases" | "release" => Ok(EntityType::Releases),
            other => Err(CommonError::UnknownEntityType(other.to_string())),
        }
    }
}

/// Calendar month identifying one dump, rendered as `YYYY-MM`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MonthKey {
    year: i32,
    month: u32,
}

impl MonthKey {
    pub fn new(year: i32, month: u32) -> Result<Self, CommonError> {
        if !(1..=12).contains(&month) || !(1000..=9999).contains(&year) {
            return Err(CommonError::InvalidMonthKey(format!("{}-{}", year, month)));
        }
        Ok(Self { year, month })
    }

    /// Month containing the current UTC date
    pub fn current() -> Self {
        let now = Utc::now();
        Self {
            year: now.year(),
            month: now.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// Date stamp used in dump file names, always the first of the month (`20250201`)
    pub fn dump_stamp(&self) -> String {
        format!("{:04}{:02}01", self.year, self.month)
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for MonthKey {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CommonError::InvalidMonthKey(s.to_string());
        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year = year.parse().map_err(|_| invalid())?;
        let month = month.parse().map_err(|_| invalid())?;
        Self::new(year, month).map_err(|_| invalid())
    }
}

impl TryFrom<String> for MonthKey {
    type Error = CommonError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MonthKey> for String {
    fn from(value: MonthKey) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_month_key_parse_and_display() {
        let key: MonthKey = "2025-02".parse().unwrap();
        assert_eq!(key.year(), 2025);
        assert_eq!(key.month(), 2);
        assert_eq!(key.to_string(), "2025-02");
        assert_eq!(key.dump_stamp(), "20250201");
    }

    #[test]
    fn test_month_key_rejects_garbage() {
        for bad in ["2025-13", "2025-00", "25-01", "2025/01", "2025-1", ""] {
            assert!(bad.parse::<MonthKey>().is_err(), "{} should not parse", bad);
        }
    }

    #[test]
    fn test_month_key_serde_as_string() {
        let key: MonthKey = "2024-11".parse().unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"2024-11\"");
        let back: MonthKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_str::<MonthKey>("\"nope\"").is_err());
    }

    #[test]
    fn test_entity_type_round_trip() {
        for entity in EntityType::ALL {
            assert_eq!(entity.as_str().parse::<EntityType>().unwrap(), entity);
        }
        assert_eq!("release".parse::<EntityType>().unwrap(), EntityType::Releases);
        assert!("tracks".parse::<EntityType>().is_err());
    }
}
