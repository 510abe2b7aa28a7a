use crate::db;
use crate::grading::{self, GradeScale, GradingScales, MIDTERM_OUT_OF, STANDARD_OUT_OF};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupSection {
    Grading,
    Reports,
}

impl SetupSection {
    pub const ALL: [SetupSection; 2] = [SetupSection::Grading, SetupSection::Reports];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "grading" => Some(Self::Grading),
            "reports" => Some(Self::Reports),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Grading => "grading",
            Self::Reports => "reports",
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::Grading => "setup.grading",
            Self::Reports => "setup.reports",
        }
    }
}

pub fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Grading => json!({
            "passThreshold": 50.0,
            "weightBySubjectCredit": false,
            "bands": GradeScale::standard().bands,
            "midtermBands": GradeScale::midterm().bands,
        }),
        SetupSection::Reports => json!({
            "showSubjectPosition": true,
            "showAttendance": true,
            "showTraits": true,
            "schoolHeader": null
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool()
        .ok_or_else(|| format!("{} must be a boolean", key))
}

fn parse_f64_range(v: &Value, key: &str, min: f64, max: f64) -> Result<f64, String> {
    let Some(n) = v.as_f64() else {
        return Err(format!("{} must be a number", key));
    };
    if n < min || n > max {
        return Err(format!("{} must be between {} and {}", key, min, max));
    }
    Ok(n)
}

fn parse_nullable_string_max(v: &Value, key: &str, max_len: usize) -> Result<Value, String> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    let Some(s) = v.as_str() else {
        return Err(format!("{} must be a string or null", key));
    };
    let t = s.trim();
    if t.chars().count() > max_len {
        return Err(format!("{} must be at most {} characters", key, max_len));
    }
    if t.is_empty() {
        return Ok(Value::Null);
    }
    Ok(Value::String(t.to_string()))
}

pub fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Grading => match k.as_str() {
                "passThreshold" => {
                    obj.insert(k.clone(), json!(parse_f64_range(v, k, 0.0, 100.0)?));
                }
                "weightBySubjectCredit" => {
                    obj.insert(k.clone(), json!(parse_bool(v, k)?));
                }
                "bands" => {
                    let scale = grading::parse_bands(v, STANDARD_OUT_OF)
                        .map_err(|e| format!("bands: {}", e))?;
                    obj.insert(k.clone(), json!(scale.bands));
                }
                "midtermBands" => {
                    let scale = grading::parse_bands(v, MIDTERM_OUT_OF)
                        .map_err(|e| format!("midtermBands: {}", e))?;
                    obj.insert(k.clone(), json!(scale.bands));
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
            SetupSection::Reports => match k.as_str() {
                "showSubjectPosition" | "showAttendance" | "showTraits" => {
                    obj.insert(k.clone(), json!(parse_bool(v, k)?));
                }
                "schoolHeader" => {
                    obj.insert(k.clone(), parse_nullable_string_max(v, k, 200)?);
                }
                _ => return Err(format!("unknown reports field: {}", k)),
            },
        }
    }
    Ok(())
}

pub fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed stored values fall back to defaults field by field.
            for (k, v) in saved_obj {
                let mut single = Map::new();
                single.insert(k.clone(), v.clone());
                if let Err(e) = merge_section_patch(section, &mut current, &single) {
                    tracing::warn!(section = section.name(), error = %e, "ignoring stored setting");
                }
            }
        }
    }
    Ok(current)
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradingConfig {
    pub pass_threshold: f64,
    pub weight_by_subject_credit: bool,
    pub scales: GradingScales,
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            pass_threshold: 50.0,
            weight_by_subject_credit: false,
            scales: GradingScales::default(),
        }
    }
}

impl GradingConfig {
    pub fn from_section(v: &Value) -> Self {
        let defaults = Self::default();
        let standard = v
            .get("bands")
            .and_then(|b| grading::parse_bands(b, STANDARD_OUT_OF).ok())
            .unwrap_or(defaults.scales.standard);
        let midterm = v
            .get("midtermBands")
            .and_then(|b| grading::parse_bands(b, MIDTERM_OUT_OF).ok())
            .unwrap_or(defaults.scales.midterm);
        Self {
            pass_threshold: v
                .get("passThreshold")
                .and_then(|x| x.as_f64())
                .unwrap_or(defaults.pass_threshold),
            weight_by_subject_credit: v
                .get("weightBySubjectCredit")
                .and_then(|x| x.as_bool())
                .unwrap_or(defaults.weight_by_subject_credit),
            scales: GradingScales { standard, midterm },
        }
    }

    pub fn load(conn: &Connection) -> anyhow::Result<Self> {
        Ok(Self::from_section(&load_section(conn, SetupSection::Grading)?))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportsConfig {
    pub show_subject_position: bool,
    pub show_attendance: bool,
    pub show_traits: bool,
    pub school_header: Option<String>,
}

impl ReportsConfig {
    pub fn load(conn: &Connection) -> anyhow::Result<Self> {
        let v = load_section(conn, SetupSection::Reports)?;
        let flag = |k: &str| v.get(k).and_then(|x| x.as_bool()).unwrap_or(true);
        Ok(Self {
            show_subject_position: flag("showSubjectPosition"),
            show_attendance: flag("showAttendance"),
            show_traits: flag("showTraits"),
            school_header: v
                .get("schoolHeader")
                .and_then(|x| x.as_str())
                .map(|s| s.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grading_patch_validates_fields() {
        let mut cur = default_section(SetupSection::Grading);
        let patch = json!({ "passThreshold": 45, "weightBySubjectCredit": true });
        merge_section_patch(SetupSection::Grading, &mut cur, patch.as_object().expect("obj"))
            .expect("merge");
        let cfg = GradingConfig::from_section(&cur);
        assert_eq!(cfg.pass_threshold, 45.0);
        assert!(cfg.weight_by_subject_credit);
        assert_eq!(cfg.scales.standard, GradeScale::standard());

        for bad in [
            json!({ "passThreshold": 120 }),
            json!({ "weightBySubjectCredit": "yes" }),
            json!({ "bands": [] }),
            json!({ "colour": "red" }),
        ] {
            let mut cur = default_section(SetupSection::Grading);
            assert!(merge_section_patch(SetupSection::Grading, &mut cur, bad.as_object().expect("obj")).is_err());
        }
    }

    #[test]
    fn stored_bands_drive_grading_config() {
        let conn = db::open_in_memory().expect("db");
        db::settings_set_json(
            &conn,
            SetupSection::Grading.key(),
            &json!({
                "bands": [{ "min": 0, "grade": "F" }, { "min": 50, "grade": "P" }],
                "passThreshold": "oops"
            }),
        )
        .expect("store");
        let cfg = GradingConfig::load(&conn).expect("load");
        assert_eq!(cfg.pass_threshold, 50.0);
        assert_eq!(cfg.scales.standard.grade_for_percent(50.0).0, "P");
        assert_eq!(cfg.scales.midterm, GradeScale::midterm());
    }
}
