use crate::calc::{
    self, AlignedComponent, AlignedRecord, AlignmentWarning, ExamType, MarkDistribution,
    PromotionCandidate, PromotionDecision, RawComponent, RawScoreRecord, ResultSummary,
    RosterStudent, SubjectPick, SubjectStats, SummaryOptions,
};
use crate::config::{GradingConfig, ReportsConfig};
use crate::grading::{self, GradeScale};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<rusqlite::Error> for CalcError {
    fn from(e: rusqlite::Error) -> Self {
        tracing::error!(error = %e, "results query failed");
        CalcError::new("db_query_failed", e.to_string())
    }
}

impl From<anyhow::Error> for CalcError {
    fn from(e: anyhow::Error) -> Self {
        CalcError::new("db_query_failed", format!("{e:#}"))
    }
}

/// Which results a request is about: one class, one exam of one term.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultsScope {
    pub class_id: String,
    pub session_id: String,
    pub term: i64,
    pub exam_type: ExamType,
}

fn param_str(params: &serde_json::Value, key: &str) -> Result<String, CalcError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CalcError::new("bad_params", format!("missing {}", key)))
}

pub fn parse_exam_type(params: &serde_json::Value) -> Result<ExamType, CalcError> {
    match params.get("examType") {
        None => Ok(ExamType::Final),
        Some(v) if v.is_null() => Ok(ExamType::Final),
        Some(v) => v.as_str().and_then(ExamType::parse).ok_or_else(|| {
            CalcError::new("bad_params", "examType must be one of: midterm, final")
                .with_details(serde_json::json!({ "examType": v }))
        }),
    }
}

pub fn parse_scope(params: &serde_json::Value) -> Result<ResultsScope, CalcError> {
    let class_id = param_str(params, "classId")?;
    let session_id = param_str(params, "sessionId")?;
    let Some(term) = params.get("term").and_then(|v| v.as_i64()) else {
        return Err(CalcError::new("bad_params", "term must be an integer"));
    };
    Ok(ResultsScope {
        class_id,
        session_id,
        term,
        exam_type: parse_exam_type(params)?,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassInfo {
    pub id: String,
    pub name: String,
    pub school_id: Option<String>,
    pub next_class_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub term_count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectInfo {
    pub id: String,
    pub name: String,
    pub code: Option<String>,
    pub credit_hours: f64,
}

pub fn load_class(conn: &Connection, class_id: &str) -> Result<ClassInfo, CalcError> {
    conn.query_row(
        "SELECT id, name, school_id, next_class_id FROM classes WHERE id = ?",
        [class_id],
        |r| {
            Ok(ClassInfo {
                id: r.get(0)?,
                name: r.get(1)?,
                school_id: r.get(2)?,
                next_class_id: r.get(3)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| CalcError::new("not_found", "class not found"))
}

pub fn load_session(conn: &Connection, session_id: &str) -> Result<SessionInfo, CalcError> {
    conn.query_row(
        "SELECT id, name, term_count FROM sessions WHERE id = ?",
        [session_id],
        |r| {
            Ok(SessionInfo {
                id: r.get(0)?,
                name: r.get(1)?,
                term_count: r.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| CalcError::new("not_found", "session not found"))
}

pub fn check_term(session: &SessionInfo, term: i64) -> Result<(), CalcError> {
    if term < 1 || term > session.term_count {
        return Err(
            CalcError::new("bad_params", "term is outside the session's terms").with_details(
                serde_json::json!({ "term": term, "termCount": session.term_count }),
            ),
        );
    }
    Ok(())
}

pub fn display_name(last: &str, first: &str) -> String {
    format!("{}, {}", last, first)
}

pub fn load_roster(
    conn: &Connection,
    class_id: &str,
    active_only: bool,
) -> Result<Vec<RosterStudent>, CalcError> {
    let mut stmt = conn.prepare(
        "SELECT id, last_name, first_name, active
         FROM students
         WHERE class_id = ?
         ORDER BY sort_order",
    )?;
    let rows = stmt
        .query_map([class_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok((
                RosterStudent {
                    id: r.get(0)?,
                    display_name: display_name(&last, &first),
                },
                r.get::<_, i64>(3)? != 0,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .filter(|(_, active)| !active_only || *active)
        .map(|(s, _)| s)
        .collect())
}

/// Everyone a results scope covers: the current roster, then students who have
/// score records for (class, session, term) but have since moved to another
/// class. `active_only` filters the current roster only.
pub fn load_scope_roster(
    conn: &Connection,
    class_id: &str,
    session_id: &str,
    term: i64,
    active_only: bool,
) -> Result<Vec<RosterStudent>, CalcError> {
    let mut roster = load_roster(conn, class_id, active_only)?;
    let mut stmt = conn.prepare(
        "SELECT DISTINCT s.id, s.last_name, s.first_name
         FROM students s
         JOIN score_records r ON r.student_id = s.id
         WHERE r.class_id = ?1 AND r.session_id = ?2 AND r.term = ?3
           AND s.class_id IS NOT ?1
         ORDER BY s.last_name, s.first_name, s.id",
    )?;
    let former = stmt
        .query_map((class_id, session_id, term), |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok(RosterStudent {
                id: r.get(0)?,
                display_name: display_name(&last, &first),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    if !former.is_empty() {
        tracing::debug!(class = %class_id, former = former.len(), "results include students who left the class");
    }
    roster.extend(former);
    Ok(roster)
}

/// Subjects offered to the class in offering order, followed by any subject that
/// only appears in score records.
pub fn load_class_subjects(conn: &Connection, class_id: &str) -> Result<Vec<SubjectInfo>, CalcError> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.name, s.code, s.credit_hours
         FROM subjects s
         LEFT JOIN class_subjects cs ON cs.subject_id = s.id AND cs.class_id = ?1
         WHERE cs.class_id IS NOT NULL
            OR s.id IN (SELECT subject_id FROM score_records WHERE class_id = ?1)
         ORDER BY cs.sort_order IS NULL, cs.sort_order, s.name",
    )?;
    let rows = stmt
        .query_map([class_id], |r| {
            Ok(SubjectInfo {
                id: r.get(0)?,
                name: r.get(1)?,
                code: r.get(2)?,
                credit_hours: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_distributions(conn: &Connection) -> Result<Vec<MarkDistribution>, CalcError> {
    let mut stmt = conn.prepare(
        "SELECT id, name, exam_type, session_id, term, school_id, created_at
         FROM mark_distributions
         ORDER BY created_at, id",
    )?;
    let heads = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, Option<i64>>(4)?,
                r.get::<_, Option<String>>(5)?,
                r.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut comp_stmt = conn.prepare(
        "SELECT distribution_id, id, label, weight, kind
         FROM mark_distribution_components
         ORDER BY distribution_id, sort_order",
    )?;
    let mut components: HashMap<String, Vec<calc::DistributionComponent>> = HashMap::new();
    let rows = comp_stmt.query_map([], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, String>(2)?,
            r.get::<_, i64>(3)?,
            r.get::<_, String>(4)?,
        ))
    })?;
    for row in rows {
        let (dist_id, id, label, weight, kind) = row?;
        let kind = calc::ComponentKind::parse(&kind).unwrap_or(calc::ComponentKind::Regular);
        components
            .entry(dist_id)
            .or_default()
            .push(calc::DistributionComponent {
                id,
                label,
                weight,
                kind,
            });
    }

    let mut out = Vec::with_capacity(heads.len());
    for (id, name, exam_type, session_id, term, school_id, created_at) in heads {
        let Some(exam_type) = ExamType::parse(&exam_type) else {
            tracing::warn!(distribution = %id, exam_type = %exam_type, "skipping distribution with unknown exam type");
            continue;
        };
        let comps = components.remove(&id).unwrap_or_default();
        out.push(MarkDistribution {
            id,
            name,
            exam_type,
            session_id,
            term,
            school_id,
            created_at,
            components: comps,
        });
    }
    Ok(out)
}

fn placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(",")
}

/// Raw records of one class/term/session. Both exam types are always loaded so
/// final records can carry their midterm forward.
pub fn load_raw_records(
    conn: &Connection,
    class_id: &str,
    session_id: &str,
    term: i64,
    subject_id: Option<&str>,
) -> Result<Vec<RawScoreRecord>, CalcError> {
    let mut sql = String::from(
        "SELECT id, student_id, subject_id, exam_type, term, session_id
         FROM score_records
         WHERE class_id = ? AND session_id = ? AND term = ?",
    );
    let mut binds: Vec<Value> = vec![
        Value::Text(class_id.to_string()),
        Value::Text(session_id.to_string()),
        Value::Integer(term),
    ];
    if let Some(sid) = subject_id {
        sql.push_str(" AND subject_id = ?");
        binds.push(Value::Text(sid.to_string()));
    }
    sql.push_str(" ORDER BY subject_id, student_id, exam_type");

    let mut stmt = conn.prepare(&sql)?;
    let heads = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)?,
                r.get::<_, String>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    if heads.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<Value> = heads.iter().map(|h| Value::Text(h.0.clone())).collect();
    let comp_sql = format!(
        "SELECT record_id, component_id, label, score, max_score
         FROM score_components
         WHERE record_id IN ({})
         ORDER BY record_id, sort_order",
        placeholders(ids.len())
    );
    let mut comp_stmt = conn.prepare(&comp_sql)?;
    let mut by_record: HashMap<String, Vec<RawComponent>> = HashMap::new();
    let rows = comp_stmt.query_map(params_from_iter(ids), |r| {
        Ok((
            r.get::<_, String>(0)?,
            RawComponent {
                component_id: r.get(1)?,
                label: r.get(2)?,
                score: r.get(3)?,
                max_score: r.get(4)?,
            },
        ))
    })?;
    for row in rows {
        let (record_id, comp) = row?;
        by_record.entry(record_id).or_default().push(comp);
    }

    let mut out = Vec::with_capacity(heads.len());
    for (id, student_id, subject_id, exam_type, term, session_id) in heads {
        let Some(exam_type) = ExamType::parse(&exam_type) else {
            tracing::warn!(record = %id, exam_type = %exam_type, "skipping score record with unknown exam type");
            continue;
        };
        let components = by_record.remove(&id).unwrap_or_default();
        out.push(RawScoreRecord {
            id,
            student_id,
            subject_id,
            exam_type,
            term,
            session_id,
            components,
        });
    }
    Ok(out)
}

pub fn align_loaded(
    records: &[RawScoreRecord],
    distributions: &[MarkDistribution],
    school_id: Option<&str>,
) -> Vec<AlignedRecord> {
    let aligned = calc::align_records(records, |r| {
        calc::resolve_distribution(
            distributions,
            &calc::DistributionQuery {
                exam_type: r.exam_type,
                session_id: Some(r.session_id.as_str()),
                term: Some(r.term),
                school_id,
            },
        )
    });
    for a in &aligned {
        if !a.warnings.is_empty() {
            tracing::warn!(
                record = %a.record_id,
                student = %a.student_id,
                subject = %a.subject_id,
                warnings = a.warnings.len(),
                "score record needed normalization"
            );
        }
    }
    aligned
}

struct LoadedScope {
    class: ClassInfo,
    session: SessionInfo,
    roster: Vec<RosterStudent>,
    subjects: Vec<SubjectInfo>,
    aligned: Vec<AlignedRecord>,
    config: GradingConfig,
}

fn load_scope(
    conn: &Connection,
    scope: &ResultsScope,
    subject_id: Option<&str>,
) -> Result<LoadedScope, CalcError> {
    let class = load_class(conn, &scope.class_id)?;
    let session = load_session(conn, &scope.session_id)?;
    check_term(&session, scope.term)?;
    let roster = load_scope_roster(conn, &class.id, &session.id, scope.term, false)?;
    let subjects = load_class_subjects(conn, &class.id)?;
    let distributions = load_distributions(conn)?;
    let raw = load_raw_records(conn, &class.id, &session.id, scope.term, subject_id)?;
    let aligned = in_roster(align_loaded(&raw, &distributions, class.school_id.as_deref()), &roster);
    let config = GradingConfig::load(conn)?;
    Ok(LoadedScope {
        class,
        session,
        roster,
        subjects,
        aligned,
        config,
    })
}

/// Summaries, subject positions and subject stats all rank this one population.
fn in_roster(aligned: Vec<AlignedRecord>, roster: &[RosterStudent]) -> Vec<AlignedRecord> {
    let ids: HashSet<&str> = roster.iter().map(|s| s.id.as_str()).collect();
    aligned
        .into_iter()
        .filter(|a| ids.contains(a.student_id.as_str()))
        .collect()
}

fn scale_for<'a>(config: &'a GradingConfig, exam_type: ExamType) -> &'a GradeScale {
    config.scales.for_midterm(exam_type == ExamType::Midterm)
}

fn credits_of(subjects: &[SubjectInfo]) -> HashMap<String, f64> {
    subjects
        .iter()
        .map(|s| (s.id.clone(), s.credit_hours))
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetRow {
    pub student_id: String,
    pub display_name: String,
    pub record_id: Option<String>,
    pub components: Vec<AlignedComponent>,
    pub total_score: f64,
    pub max_score: f64,
    pub percentage: f64,
    pub grade: String,
    pub remark: String,
    pub carry_forward: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<AlignmentWarning>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreSheet {
    pub class: ClassInfo,
    pub session: SessionInfo,
    pub subject: SubjectInfo,
    pub term: i64,
    pub exam_type: ExamType,
    pub distribution: Option<MarkDistribution>,
    pub rows: Vec<SheetRow>,
}

/// Score entry sheet for one subject. Every active student gets a row; students
/// without a record show the template with zero scores.
pub fn compute_score_sheet(
    conn: &Connection,
    scope: &ResultsScope,
    subject_id: &str,
) -> Result<ScoreSheet, CalcError> {
    let subject = conn
        .query_row(
            "SELECT id, name, code, credit_hours FROM subjects WHERE id = ?",
            [subject_id],
            |r| {
                Ok(SubjectInfo {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    code: r.get(2)?,
                    credit_hours: r.get(3)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| CalcError::new("not_found", "subject not found"))?;

    let class = load_class(conn, &scope.class_id)?;
    let session = load_session(conn, &scope.session_id)?;
    check_term(&session, scope.term)?;
    let roster = load_scope_roster(conn, &class.id, &session.id, scope.term, true)?;
    let distributions = load_distributions(conn)?;
    let raw = load_raw_records(conn, &class.id, &session.id, scope.term, Some(&subject.id))?;
    let aligned = align_loaded(&raw, &distributions, class.school_id.as_deref());
    let config = GradingConfig::load(conn)?;
    let scale = scale_for(&config, scope.exam_type);

    let template = calc::resolve_distribution(
        &distributions,
        &calc::DistributionQuery {
            exam_type: scope.exam_type,
            session_id: Some(&session.id),
            term: Some(scope.term),
            school_id: class.school_id.as_deref(),
        },
    );

    let by_student: HashMap<&str, &AlignedRecord> = aligned
        .iter()
        .filter(|a| a.exam_type == scope.exam_type)
        .map(|a| (a.student_id.as_str(), a))
        .collect();
    let midterms: HashMap<&str, &AlignedRecord> = aligned
        .iter()
        .filter(|a| a.exam_type == ExamType::Midterm)
        .map(|a| (a.student_id.as_str(), a))
        .collect();

    let mut rows = Vec::with_capacity(roster.len());
    for st in &roster {
        let blank;
        let (record_id, rec) = match by_student.get(st.id.as_str()) {
            Some(a) => (Some(a.record_id.clone()), *a),
            None => {
                let empty = RawScoreRecord {
                    id: String::new(),
                    student_id: st.id.clone(),
                    subject_id: subject.id.clone(),
                    exam_type: scope.exam_type,
                    term: scope.term,
                    session_id: session.id.clone(),
                    components: Vec::new(),
                };
                let mid = if scope.exam_type == ExamType::Final {
                    midterms.get(st.id.as_str()).copied()
                } else {
                    None
                };
                blank = calc::align_record(&empty, template, mid);
                (None, &blank)
            }
        };
        let (grade, remark) = scale.grade_for_percent(rec.percentage);
        // Blank rows always report the missing-template case; drop the noise.
        let warnings = if record_id.is_some() {
            rec.warnings.clone()
        } else {
            Vec::new()
        };
        rows.push(SheetRow {
            student_id: st.id.clone(),
            display_name: st.display_name.clone(),
            record_id,
            components: rec.components.clone(),
            total_score: rec.total_score,
            max_score: rec.max_score,
            percentage: rec.percentage,
            grade,
            remark,
            carry_forward: rec.carry_forward,
            warnings,
        });
    }

    Ok(ScoreSheet {
        class,
        session,
        subject,
        term: scope.term,
        exam_type: scope.exam_type,
        distribution: template.cloned(),
        rows,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedSubjectStats {
    pub name: String,
    #[serde(flatten)]
    pub stats: SubjectStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassResults {
    pub class: ClassInfo,
    pub session: SessionInfo,
    pub term: i64,
    pub exam_type: ExamType,
    pub weighted_by_credit: bool,
    pub summaries: Vec<ResultSummary>,
    pub subject_stats: Vec<NamedSubjectStats>,
    pub warning_count: usize,
}

fn named_stats(subjects: &[SubjectInfo], aligned: &[AlignedRecord], exam_type: ExamType) -> Vec<NamedSubjectStats> {
    subjects
        .iter()
        .map(|s| NamedSubjectStats {
            name: s.name.clone(),
            stats: calc::subject_stats(aligned, &s.id, exam_type),
        })
        .filter(|s| s.stats.student_count > 0)
        .collect()
}

fn summaries_for(loaded: &LoadedScope, exam_type: ExamType) -> Vec<ResultSummary> {
    calc::compute_summaries(
        &loaded.aligned,
        &loaded.roster,
        exam_type,
        &credits_of(&loaded.subjects),
        SummaryOptions {
            weight_by_credit: loaded.config.weight_by_subject_credit,
        },
        scale_for(&loaded.config, exam_type),
    )
}

pub fn compute_class_results(conn: &Connection, scope: &ResultsScope) -> Result<ClassResults, CalcError> {
    let loaded = load_scope(conn, scope, None)?;
    let summaries = summaries_for(&loaded, scope.exam_type);
    let subject_stats = named_stats(&loaded.subjects, &loaded.aligned, scope.exam_type);
    let warning_count = loaded
        .aligned
        .iter()
        .filter(|a| a.exam_type == scope.exam_type)
        .map(|a| a.warnings.len())
        .sum();
    Ok(ClassResults {
        weighted_by_credit: loaded.config.weight_by_subject_credit,
        class: loaded.class,
        session: loaded.session,
        term: scope.term,
        exam_type: scope.exam_type,
        summaries,
        subject_stats,
        warning_count,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadsheetRow {
    pub student_id: String,
    pub display_name: String,
    pub scores: HashMap<String, f64>,
    pub average: f64,
    pub grade: String,
    pub position: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Broadsheet {
    pub class: ClassInfo,
    pub session: SessionInfo,
    pub term: i64,
    pub exam_type: ExamType,
    pub subjects: Vec<SubjectInfo>,
    pub rows: Vec<BroadsheetRow>,
    pub subject_stats: Vec<NamedSubjectStats>,
}

pub fn compute_broadsheet(conn: &Connection, scope: &ResultsScope) -> Result<Broadsheet, CalcError> {
    let loaded = load_scope(conn, scope, None)?;
    let summaries = summaries_for(&loaded, scope.exam_type);

    let mut scores: HashMap<&str, HashMap<String, f64>> = HashMap::new();
    for a in loaded.aligned.iter().filter(|a| a.exam_type == scope.exam_type) {
        scores
            .entry(a.student_id.as_str())
            .or_default()
            .insert(a.subject_id.clone(), a.percentage);
    }
    let rows = summaries
        .iter()
        .map(|s| BroadsheetRow {
            student_id: s.student_id.clone(),
            display_name: s.display_name.clone(),
            scores: scores.remove(s.student_id.as_str()).unwrap_or_default(),
            average: s.average,
            grade: s.grade.clone(),
            position: s.position,
        })
        .collect();
    let subject_stats = named_stats(&loaded.subjects, &loaded.aligned, scope.exam_type);

    Ok(Broadsheet {
        class: loaded.class,
        session: loaded.session,
        term: scope.term,
        exam_type: scope.exam_type,
        subjects: loaded.subjects,
        rows,
        subject_stats,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionModel {
    pub class: ClassInfo,
    pub session: SessionInfo,
    pub final_term: i64,
    pub threshold: f64,
    pub candidates: Vec<PromotionCandidate>,
}

pub fn load_overrides(
    conn: &Connection,
    session_id: &str,
) -> Result<HashMap<String, PromotionDecision>, CalcError> {
    let mut stmt = conn.prepare(
        "SELECT student_id, decision FROM promotion_overrides WHERE session_id = ?",
    )?;
    let rows = stmt
        .query_map([session_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut out = HashMap::new();
    for (student_id, decision) in rows {
        match PromotionDecision::parse(&decision) {
            Some(d) => {
                out.insert(student_id, d);
            }
            None => {
                tracing::warn!(student = %student_id, decision = %decision, "ignoring unknown promotion override");
            }
        }
    }
    Ok(out)
}

/// Promotion list from the final exam of the session's last term.
pub fn compute_promotion_model(
    conn: &Connection,
    class_id: &str,
    session_id: &str,
) -> Result<PromotionModel, CalcError> {
    let session = load_session(conn, session_id)?;
    let scope = ResultsScope {
        class_id: class_id.to_string(),
        session_id: session_id.to_string(),
        term: session.term_count,
        exam_type: ExamType::Final,
    };
    let mut loaded = load_scope(conn, &scope, None)?;
    loaded.roster = load_scope_roster(conn, class_id, session_id, scope.term, true)?;
    let summaries = summaries_for(&loaded, ExamType::Final);
    let overrides = load_overrides(conn, session_id)?;
    let threshold = loaded.config.pass_threshold;
    let candidates = calc::promotion_candidates(&loaded.roster, &summaries, &overrides, threshold);
    Ok(PromotionModel {
        class: loaded.class,
        final_term: loaded.session.term_count,
        session: loaded.session,
        threshold,
        candidates,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportStudent {
    pub id: String,
    pub display_name: String,
    pub admission_no: Option<String>,
    pub gender: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSubjectRow {
    pub subject_id: String,
    pub name: String,
    pub code: Option<String>,
    pub components: Vec<AlignedComponent>,
    pub total_score: f64,
    pub max_score: f64,
    pub percentage: f64,
    pub grade: String,
    pub remark: String,
    pub carry_forward: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    pub class_average: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSummary {
    pub days_open: i64,
    pub days_present: i64,
    pub days_absent: i64,
    pub percent_present: f64,
}

impl AttendanceSummary {
    pub fn new(days_open: i64, days_present: i64) -> Self {
        let present = days_present.clamp(0, days_open.max(0));
        let percent_present = if days_open > 0 {
            calc::round_off_1_decimal(100.0 * present as f64 / days_open as f64)
        } else {
            0.0
        };
        Self {
            days_open,
            days_present: present,
            days_absent: (days_open - present).max(0),
            percent_present,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraitRow {
    pub name: String,
    pub rating: i64,
    pub label: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCard {
    pub student: ReportStudent,
    pub class: ClassInfo,
    pub session: SessionInfo,
    pub term: i64,
    pub exam_type: ExamType,
    pub school_header: Option<String>,
    pub subjects: Vec<ReportSubjectRow>,
    pub summary: Option<ResultSummary>,
    pub class_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attendance: Option<AttendanceSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traits: Option<Vec<TraitRow>>,
    pub best_subject: Option<SubjectPick>,
    pub weakest_subject: Option<SubjectPick>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promotion: Option<PromotionCandidate>,
    pub generated_at: String,
}

pub fn load_attendance(
    conn: &Connection,
    student_id: &str,
    session_id: &str,
    term: i64,
) -> Result<Option<AttendanceSummary>, CalcError> {
    let row: Option<(i64, i64)> = conn
        .query_row(
            "SELECT days_open, days_present FROM attendance_records
             WHERE student_id = ? AND session_id = ? AND term = ?",
            (student_id, session_id, term),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    Ok(row.map(|(open, present)| AttendanceSummary::new(open, present)))
}

pub fn load_traits(
    conn: &Connection,
    student_id: &str,
    session_id: &str,
    term: i64,
) -> Result<Vec<TraitRow>, CalcError> {
    let mut stmt = conn.prepare(
        "SELECT trait, rating FROM trait_ratings
         WHERE student_id = ? AND session_id = ? AND term = ?
         ORDER BY trait",
    )?;
    let rows = stmt
        .query_map((student_id, session_id, term), |r| {
            let rating: i64 = r.get(1)?;
            Ok(TraitRow {
                name: r.get(0)?,
                rating,
                label: grading::trait_rating_label(rating).to_string(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn compose_report_card(
    conn: &Connection,
    scope: &ResultsScope,
    student_id: &str,
) -> Result<ReportCard, CalcError> {
    let student = conn
        .query_row(
            "SELECT id, last_name, first_name, admission_no, gender
             FROM students WHERE id = ?",
            [student_id],
            |r| {
                let last: String = r.get(1)?;
                let first: String = r.get(2)?;
                Ok(ReportStudent {
                    id: r.get(0)?,
                    display_name: display_name(&last, &first),
                    admission_no: r.get(3)?,
                    gender: r.get(4)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| CalcError::new("not_found", "student not found"))?;

    let loaded = load_scope(conn, scope, None)?;
    if !loaded.roster.iter().any(|s| s.id == student.id) {
        return Err(CalcError::new("not_found", "student has no place in this class for the session")
            .with_details(serde_json::json!({
                "studentId": student.id,
                "classId": loaded.class.id,
            })));
    }
    let reports = ReportsConfig::load(conn)?;
    let scale = scale_for(&loaded.config, scope.exam_type);
    let summaries = summaries_for(&loaded, scope.exam_type);

    let mut subjects = Vec::new();
    for subj in &loaded.subjects {
        let Some(rec) = loaded.aligned.iter().find(|a| {
            a.student_id == student.id && a.subject_id == subj.id && a.exam_type == scope.exam_type
        }) else {
            continue;
        };
        let (grade, remark) = scale.grade_for_percent(rec.percentage);
        let position = if reports.show_subject_position {
            calc::subject_positions(&loaded.aligned, &subj.id, scope.exam_type)
                .get(&student.id)
                .copied()
        } else {
            None
        };
        subjects.push(ReportSubjectRow {
            subject_id: subj.id.clone(),
            name: subj.name.clone(),
            code: subj.code.clone(),
            components: rec.components.clone(),
            total_score: rec.total_score,
            max_score: rec.max_score,
            percentage: rec.percentage,
            grade,
            remark,
            carry_forward: rec.carry_forward,
            position,
            class_average: calc::subject_stats(&loaded.aligned, &subj.id, scope.exam_type).average,
        });
    }

    let picks: Vec<SubjectPick> = subjects
        .iter()
        .map(|s| SubjectPick {
            subject_id: s.subject_id.clone(),
            name: s.name.clone(),
            percentage: s.percentage,
        })
        .collect();
    let (best_subject, weakest_subject) = calc::best_and_weakest(&picks);

    let attendance = if reports.show_attendance {
        load_attendance(conn, &student.id, &loaded.session.id, scope.term)?
    } else {
        None
    };
    let traits = if reports.show_traits {
        Some(load_traits(conn, &student.id, &loaded.session.id, scope.term)?)
    } else {
        None
    };

    let promotion = if scope.exam_type == ExamType::Final && scope.term == loaded.session.term_count {
        let overrides = load_overrides(conn, &loaded.session.id)?;
        let me = RosterStudent {
            id: student.id.clone(),
            display_name: student.display_name.clone(),
        };
        calc::promotion_candidates(
            std::slice::from_ref(&me),
            &summaries,
            &overrides,
            loaded.config.pass_threshold,
        )
        .into_iter()
        .next()
    } else {
        None
    };

    Ok(ReportCard {
        summary: summaries.iter().find(|s| s.student_id == student.id).cloned(),
        class_size: summaries.len(),
        student,
        class: loaded.class,
        session: loaded.session,
        term: scope.term,
        exam_type: scope.exam_type,
        school_header: reports.school_header,
        subjects,
        attendance,
        traits,
        best_subject,
        weakest_subject,
        promotion,
        generated_at: crate::db::now_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;

    fn seed(conn: &Connection) {
        conn.execute_batch(
            "INSERT INTO sessions(id, name, term_count) VALUES('s1', '2024/2025', 3);
             INSERT INTO classes(id, name) VALUES('c1', 'JSS 1');
             INSERT INTO subjects(id, name, credit_hours) VALUES('math', 'Mathematics', 1);
             INSERT INTO subjects(id, name, credit_hours) VALUES('eng', 'English', 1);
             INSERT INTO class_subjects(class_id, subject_id, sort_order) VALUES('c1', 'math', 0);
             INSERT INTO class_subjects(class_id, subject_id, sort_order) VALUES('c1', 'eng', 1);
             INSERT INTO students(id, class_id, last_name, first_name, active, sort_order)
               VALUES('a', 'c1', 'Ade', 'Bola', 1, 0);
             INSERT INTO students(id, class_id, last_name, first_name, active, sort_order)
               VALUES('b', 'c1', 'Obi', 'Chi', 1, 1);
             INSERT INTO mark_distributions(id, name, exam_type, created_at)
               VALUES('fin', 'Final', 'final', '2024-01-01');
             INSERT INTO mark_distribution_components(id, distribution_id, sort_order, label, weight, kind)
               VALUES('f1', 'fin', 0, 'CA', 40, 'regular');
             INSERT INTO mark_distribution_components(id, distribution_id, sort_order, label, weight, kind)
               VALUES('f2', 'fin', 1, 'Exam', 60, 'regular');",
        )
        .expect("seed");
        let records = [("r1", "a", "math", 30.0, 50.0), ("r2", "b", "math", 20.0, 30.0), ("r3", "a", "eng", 40.0, 70.0)];
        for (id, student, subject, ca, exam) in records {
            conn.execute(
                "INSERT INTO score_records(id, class_id, student_id, subject_id, exam_type, term, session_id)
                 VALUES(?, 'c1', ?, ?, 'final', 3, 's1')",
                (id, student, subject),
            )
            .expect("record");
            conn.execute(
                "INSERT INTO score_components(id, record_id, label, score, max_score, sort_order)
                 VALUES(?, ?, 'CA', ?, 40, 0), (?, ?, 'Exam', ?, 60, 1)",
                (format!("{id}-1"), id, ca, format!("{id}-2"), id, exam),
            )
            .expect("components");
        }
    }

    fn scope() -> ResultsScope {
        ResultsScope {
            class_id: "c1".to_string(),
            session_id: "s1".to_string(),
            term: 3,
            exam_type: ExamType::Final,
        }
    }

    #[test]
    fn class_results_rank_loaded_records() {
        let conn = db::open_in_memory().expect("db");
        seed(&conn);
        let res = compute_class_results(&conn, &scope()).expect("results");
        assert_eq!(res.summaries.len(), 2);
        // a: math 30+50=80, eng 40+60(clamped)=100 -> 90; b: 20+30=50
        assert_eq!(res.summaries[0].student_id, "a");
        assert_eq!(res.summaries[0].average, 90.0);
        assert_eq!(res.summaries[1].average, 50.0);
        assert_eq!(res.summaries[1].position, 2);
        assert_eq!(res.warning_count, 1);
        assert_eq!(res.subject_stats[0].name, "Mathematics");
    }

    #[test]
    fn report_card_picks_best_and_weakest() {
        let conn = db::open_in_memory().expect("db");
        seed(&conn);
        let card = compose_report_card(&conn, &scope(), "a").expect("card");
        assert_eq!(card.subjects.len(), 2);
        assert_eq!(card.best_subject.map(|s| s.subject_id), Some("eng".to_string()));
        assert_eq!(card.weakest_subject.map(|s| s.subject_id), Some("math".to_string()));
        assert_eq!(card.class_size, 2);
        let promo = card.promotion.expect("final term card carries promotion");
        assert!(promo.promoted);
    }

    #[test]
    fn moved_students_keep_their_place_in_past_results() {
        let conn = db::open_in_memory().expect("db");
        seed(&conn);
        conn.execute_batch(
            "INSERT INTO classes(id, name) VALUES('c2', 'JSS 2');
             UPDATE students SET class_id = 'c2', sort_order = 0 WHERE id = 'a';",
        )
        .expect("move");

        let res = compute_class_results(&conn, &scope()).expect("results");
        assert_eq!(res.summaries.len(), 2);
        assert_eq!(res.summaries[0].student_id, "a");
        assert_eq!(res.summaries[1].position, 2);

        let roster = load_scope_roster(&conn, "c1", "s1", 3, true).expect("roster");
        let ids: Vec<&str> = roster.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(roster[1].display_name, display_name("Ade", "Bola"));
        assert_eq!(load_scope_roster(&conn, "c1", "s1", 1, true).expect("term 1").len(), 1);

        let card = compose_report_card(&conn, &scope(), "a").expect("card");
        assert_eq!(card.class_size, 2);
        assert_eq!(card.summary.map(|s| s.position), Some(1));
        assert_eq!(card.subjects[0].position, Some(1));
    }

    #[test]
    fn report_card_refuses_students_outside_the_class() {
        let conn = db::open_in_memory().expect("db");
        seed(&conn);
        conn.execute_batch(
            "INSERT INTO classes(id, name) VALUES('c2', 'JSS 2');
             INSERT INTO students(id, class_id, last_name, first_name, active, sort_order)
               VALUES('x', 'c2', 'Uche', 'Ify', 1, 0);",
        )
        .expect("outsider");
        let e = compose_report_card(&conn, &scope(), "x").expect_err("not in class");
        assert_eq!(e.code, "not_found");
        let e = compose_report_card(&conn, &scope(), "ghost").expect_err("unknown");
        assert_eq!(e.code, "not_found");
    }

    #[test]
    fn scope_requires_known_term() {
        let conn = db::open_in_memory().expect("db");
        seed(&conn);
        let mut s = scope();
        s.term = 4;
        let e = compute_class_results(&conn, &s).expect_err("term 4");
        assert_eq!(e.code, "bad_params");

        let e = parse_scope(&json!({ "classId": "c1", "sessionId": "s1", "term": 1, "examType": "quiz" }))
            .expect_err("bad exam type");
        assert_eq!(e.code, "bad_params");
    }

    #[test]
    fn attendance_summary_clamps_present_days() {
        let a = AttendanceSummary::new(60, 45);
        assert_eq!(a.days_absent, 15);
        assert_eq!(a.percent_present, 75.0);
        let a = AttendanceSummary::new(10, 12);
        assert_eq!(a.days_present, 10);
        assert_eq!(a.days_absent, 0);
    }
}
