use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBand {
    pub min: f64,
    pub grade: String,
    pub remark: String,
}

impl GradeBand {
    fn new(min: f64, grade: &str, remark: &str) -> Self {
        Self {
            min,
            grade: grade.to_string(),
            remark: remark.to_string(),
        }
    }
}

/// Banding table over a score range of `0..=out_of`.
///
/// Bands are kept sorted by `min` descending so lookup walks from the highest
/// threshold downward and stops at the first band the value reaches.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeScale {
    pub out_of: f64,
    pub bands: Vec<GradeBand>,
}

pub const STANDARD_OUT_OF: f64 = 100.0;
pub const MIDTERM_OUT_OF: f64 = 50.0;

impl GradeScale {
    pub fn new(out_of: f64, mut bands: Vec<GradeBand>) -> Result<Self, String> {
        if bands.is_empty() {
            return Err("grade scale needs at least one band".to_string());
        }
        for b in &bands {
            if !b.min.is_finite() || b.min < 0.0 || b.min > out_of {
                return Err(format!(
                    "band {} minimum must be between 0 and {}",
                    b.grade, out_of
                ));
            }
            if b.grade.trim().is_empty() {
                return Err("band grade must not be empty".to_string());
            }
        }
        bands.sort_by(|a, b| b.min.partial_cmp(&a.min).unwrap_or(Ordering::Equal));
        if bands.windows(2).any(|w| w[0].min == w[1].min) {
            return Err("band minimums must be unique".to_string());
        }
        Ok(Self { out_of, bands })
    }

    pub fn standard() -> Self {
        Self {
            out_of: STANDARD_OUT_OF,
            bands: vec![
                GradeBand::new(75.0, "A1", "Excellent"),
                GradeBand::new(70.0, "A2", "Very Good"),
                GradeBand::new(65.0, "B2", "Good"),
                GradeBand::new(60.0, "B3", "Good"),
                GradeBand::new(55.0, "C4", "Credit"),
                GradeBand::new(50.0, "C5", "Credit"),
                GradeBand::new(45.0, "C6", "Pass"),
                GradeBand::new(40.0, "D7", "Pass"),
                GradeBand::new(35.0, "E8", "Weak"),
                GradeBand::new(0.0, "F9", "Fail"),
            ],
        }
    }

    pub fn midterm() -> Self {
        Self {
            out_of: MIDTERM_OUT_OF,
            bands: vec![
                GradeBand::new(38.0, "A1", "Excellent"),
                GradeBand::new(35.0, "A2", "Very Good"),
                GradeBand::new(33.0, "B2", "Good"),
                GradeBand::new(30.0, "B3", "Good"),
                GradeBand::new(28.0, "C4", "Credit"),
                GradeBand::new(25.0, "C5", "Credit"),
                GradeBand::new(23.0, "C6", "Pass"),
                GradeBand::new(20.0, "D7", "Pass"),
                GradeBand::new(18.0, "E8", "Weak"),
                GradeBand::new(0.0, "F9", "Fail"),
            ],
        }
    }

    /// Band for a value already expressed in this scale's units. Values below
    /// every threshold land in the lowest band.
    pub fn band_for_score(&self, score: f64) -> Option<&GradeBand> {
        self.bands
            .iter()
            .find(|b| score >= b.min)
            .or_else(|| self.bands.last())
    }

    pub fn band_for_percent(&self, percent: f64) -> Option<&GradeBand> {
        self.band_for_score(percent * self.out_of / 100.0)
    }

    pub fn grade_for_percent(&self, percent: f64) -> (String, String) {
        self.band_for_percent(percent)
            .map(|b| (b.grade.clone(), b.remark.clone()))
            .unwrap_or_default()
    }
}

/// The pair of scales a workspace grades with.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingScales {
    pub standard: GradeScale,
    pub midterm: GradeScale,
}

impl Default for GradingScales {
    fn default() -> Self {
        Self {
            standard: GradeScale::standard(),
            midterm: GradeScale::midterm(),
        }
    }
}

impl GradingScales {
    pub fn for_midterm(&self, is_midterm: bool) -> &GradeScale {
        if is_midterm {
            &self.midterm
        } else {
            &self.standard
        }
    }
}

pub fn parse_bands(raw: &serde_json::Value, out_of: f64) -> Result<GradeScale, String> {
    let Some(items) = raw.as_array() else {
        return Err("bands must be an array".to_string());
    };
    let mut bands = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            return Err(format!("bands[{}] must be an object", i));
        };
        let Some(min) = obj.get("min").and_then(|v| v.as_f64()) else {
            return Err(format!("bands[{}].min must be a number", i));
        };
        let Some(grade) = obj.get("grade").and_then(|v| v.as_str()) else {
            return Err(format!("bands[{}].grade must be a string", i));
        };
        let remark = match obj.get("remark") {
            None => "",
            Some(v) if v.is_null() => "",
            Some(v) => v
                .as_str()
                .ok_or_else(|| format!("bands[{}].remark must be a string", i))?,
        };
        bands.push(GradeBand::new(min, grade.trim(), remark.trim()));
    }
    GradeScale::new(out_of, bands)
}

pub fn trait_rating_label(rating: i64) -> &'static str {
    match rating {
        5 => "Excellent",
        4 => "Very Good",
        3 => "Good",
        2 => "Fair",
        1 => "Poor",
        _ => "",
    }
}
