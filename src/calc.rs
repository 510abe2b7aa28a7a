use crate::grading::GradeScale;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Round-half-up to one decimal: `Int(10*x + 0.5) / 10`.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExamType {
    Midterm,
    Final,
}

impl ExamType {
    pub fn as_str(self) -> &'static str {
        match self {
            ExamType::Midterm => "midterm",
            ExamType::Final => "final",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "midterm" => Some(ExamType::Midterm),
            "final" => Some(ExamType::Final),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Regular,
    CarryForward,
}

impl ComponentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ComponentKind::Regular => "regular",
            ComponentKind::CarryForward => "carry_forward",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "regular" => Some(ComponentKind::Regular),
            "carry_forward" => Some(ComponentKind::CarryForward),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionComponent {
    pub id: String,
    pub label: String,
    pub weight: i64,
    pub kind: ComponentKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkDistribution {
    pub id: String,
    pub name: String,
    pub exam_type: ExamType,
    pub session_id: Option<String>,
    pub term: Option<i64>,
    pub school_id: Option<String>,
    pub created_at: String,
    pub components: Vec<DistributionComponent>,
}

impl MarkDistribution {
    pub fn total_weight(&self) -> i64 {
        self.components.iter().map(|c| c.weight).sum()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DistributionQuery<'a> {
    pub exam_type: ExamType,
    pub session_id: Option<&'a str>,
    pub term: Option<i64>,
    pub school_id: Option<&'a str>,
}

/// Fallback chain: (type, session, term) -> (type, session) -> (type, term) -> (type).
const RESOLVE_LEVELS: [(bool, bool); 4] = [(true, true), (true, false), (false, true), (false, false)];

pub fn resolve_distribution<'a>(
    candidates: &'a [MarkDistribution],
    query: &DistributionQuery<'_>,
) -> Option<&'a MarkDistribution> {
    let eligible: Vec<&MarkDistribution> = candidates
        .iter()
        .filter(|d| d.exam_type == query.exam_type)
        .filter(|d| match d.school_id.as_deref() {
            None => true,
            Some(s) => query.school_id == Some(s),
        })
        .collect();

    for (match_session, match_term) in RESOLVE_LEVELS {
        if match_session && query.session_id.is_none() {
            continue;
        }
        if match_term && query.term.is_none() {
            continue;
        }
        let best = eligible
            .iter()
            .copied()
            .filter(|d| !match_session || d.session_id.as_deref() == query.session_id)
            .filter(|d| !match_term || d.term == query.term)
            .max_by(|a, b| {
                resolve_rank(a, match_session, match_term)
                    .cmp(&resolve_rank(b, match_session, match_term))
                    .then_with(|| a.created_at.cmp(&b.created_at))
                    .then_with(|| a.id.cmp(&b.id))
            });
        if best.is_some() {
            return best;
        }
    }
    None
}

// School-scoped beats unscoped; then templates that leave the ignored keys unset.
fn resolve_rank(d: &MarkDistribution, match_session: bool, match_term: bool) -> (bool, usize) {
    let mut generic = 0;
    if !match_session && d.session_id.is_none() {
        generic += 1;
    }
    if !match_term && d.term.is_none() {
        generic += 1;
    }
    (d.school_id.is_some(), generic)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawComponent {
    #[serde(default)]
    pub component_id: Option<String>,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub max_score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawScoreRecord {
    pub id: String,
    pub student_id: String,
    pub subject_id: String,
    pub exam_type: ExamType,
    pub term: i64,
    pub session_id: String,
    pub components: Vec<RawComponent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlignedComponent {
    pub component_id: Option<String>,
    pub label: String,
    pub score: f64,
    pub max_score: f64,
    pub kind: ComponentKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum AlignmentWarning {
    #[serde(rename_all = "camelCase")]
    ScoreClamped { label: String, raw: f64, max_score: f64 },
    #[serde(rename_all = "camelCase")]
    UnmatchedComponent { label: String },
    #[serde(rename_all = "camelCase")]
    MissingMidterm { label: String },
    NoDistribution,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlignedRecord {
    pub record_id: String,
    pub student_id: String,
    pub subject_id: String,
    pub exam_type: ExamType,
    pub term: i64,
    pub session_id: String,
    pub distribution_id: Option<String>,
    pub components: Vec<AlignedComponent>,
    pub total_score: f64,
    pub max_score: f64,
    pub percentage: f64,
    pub carry_forward: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<AlignmentWarning>,
}

pub fn carry_forward_value(midterm_total: f64, midterm_max: f64, weight: f64) -> f64 {
    if midterm_max <= 0.0 {
        return 0.0;
    }
    round_off_1_decimal(midterm_total / midterm_max * weight)
}

fn clamp_score(
    label: &str,
    raw: f64,
    max_score: f64,
    warnings: &mut Vec<AlignmentWarning>,
) -> f64 {
    let v = if raw.is_finite() { raw } else { 0.0 };
    let clamped = v.clamp(0.0, max_score);
    if clamped != raw {
        warnings.push(AlignmentWarning::ScoreClamped {
            label: label.to_string(),
            raw,
            max_score,
        });
    }
    clamped
}

fn find_raw_match(
    raw: &[RawComponent],
    used: &[bool],
    template: &DistributionComponent,
) -> Option<usize> {
    let by_id = raw.iter().enumerate().position(|(i, c)| {
        !used[i] && c.component_id.as_deref() == Some(template.id.as_str())
    });
    if by_id.is_some() {
        return by_id;
    }
    let wanted = template.label.trim();
    raw.iter()
        .enumerate()
        .position(|(i, c)| !used[i] && c.label.trim().eq_ignore_ascii_case(wanted))
}

/// Rebuild a record's components against its template and recompute totals.
///
/// `midterm` must be the already aligned midterm record for the same student,
/// subject, term and session; it feeds any carry-forward component of a final
/// record.
pub fn align_record(
    raw: &RawScoreRecord,
    template: Option<&MarkDistribution>,
    midterm: Option<&AlignedRecord>,
) -> AlignedRecord {
    let mut warnings = Vec::new();
    let mut components = Vec::new();
    let mut carry_forward = None;

    match template {
        Some(dist) => {
            let mut used = vec![false; raw.components.len()];
            for tc in &dist.components {
                let max_score = (tc.weight as f64).max(0.0);
                let matched = find_raw_match(&raw.components, &used, tc);
                if let Some(i) = matched {
                    used[i] = true;
                }
                let stored = matched.map(|i| raw.components[i].score).unwrap_or(0.0);

                let score = if tc.kind == ComponentKind::CarryForward
                    && raw.exam_type == ExamType::Final
                {
                    match midterm {
                        Some(mid) => {
                            let v = carry_forward_value(mid.total_score, mid.max_score, max_score);
                            carry_forward = Some(v);
                            v.clamp(0.0, max_score)
                        }
                        None => {
                            warnings.push(AlignmentWarning::MissingMidterm {
                                label: tc.label.clone(),
                            });
                            clamp_score(&tc.label, stored, max_score, &mut warnings)
                        }
                    }
                } else {
                    clamp_score(&tc.label, stored, max_score, &mut warnings)
                };

                components.push(AlignedComponent {
                    component_id: Some(tc.id.clone()),
                    label: tc.label.clone(),
                    score,
                    max_score,
                    kind: tc.kind,
                });
            }
            for (i, c) in raw.components.iter().enumerate() {
                if !used[i] {
                    warnings.push(AlignmentWarning::UnmatchedComponent {
                        label: c.label.clone(),
                    });
                }
            }
        }
        None => {
            warnings.push(AlignmentWarning::NoDistribution);
            for c in &raw.components {
                let max_score = if c.max_score.is_finite() {
                    c.max_score.max(0.0)
                } else {
                    0.0
                };
                let score = clamp_score(&c.label, c.score, max_score, &mut warnings);
                components.push(AlignedComponent {
                    component_id: c.component_id.clone(),
                    label: c.label.clone(),
                    score,
                    max_score,
                    kind: ComponentKind::Regular,
                });
            }
        }
    }

    let total_score = round_off_1_decimal(components.iter().map(|c| c.score).sum());
    let max_score: f64 = components.iter().map(|c| c.max_score).sum();
    let percentage = if max_score > 0.0 {
        round_off_1_decimal(100.0 * total_score / max_score)
    } else {
        0.0
    };

    AlignedRecord {
        record_id: raw.id.clone(),
        student_id: raw.student_id.clone(),
        subject_id: raw.subject_id.clone(),
        exam_type: raw.exam_type,
        term: raw.term,
        session_id: raw.session_id.clone(),
        distribution_id: template.map(|d| d.id.clone()),
        components,
        total_score,
        max_score,
        percentage,
        carry_forward,
        warnings,
    }
}

type MidtermKey = (String, String, i64, String);

fn midterm_key(student_id: &str, subject_id: &str, term: i64, session_id: &str) -> MidtermKey {
    (
        student_id.to_string(),
        subject_id.to_string(),
        term,
        session_id.to_string(),
    )
}

/// Align a batch. Midterm records are aligned before final records so the
/// carry-forward of a final record always reads an aligned midterm. Output order
/// matches input order.
pub fn align_records<'a, F>(records: &[RawScoreRecord], mut template_for: F) -> Vec<AlignedRecord>
where
    F: FnMut(&RawScoreRecord) -> Option<&'a MarkDistribution>,
{
    let mut out: Vec<Option<AlignedRecord>> = vec![None; records.len()];
    let mut midterms: HashMap<MidtermKey, usize> = HashMap::new();

    for (i, r) in records.iter().enumerate() {
        if r.exam_type != ExamType::Midterm {
            continue;
        }
        let aligned = align_record(r, template_for(r), None);
        midterms.insert(
            midterm_key(&r.student_id, &r.subject_id, r.term, &r.session_id),
            i,
        );
        out[i] = Some(aligned);
    }

    for (i, r) in records.iter().enumerate() {
        if r.exam_type == ExamType::Midterm {
            continue;
        }
        let key = midterm_key(&r.student_id, &r.subject_id, r.term, &r.session_id);
        let mid = midterms.get(&key).and_then(|&j| out[j].clone());
        out[i] = Some(align_record(r, template_for(r), mid.as_ref()));
    }

    out.into_iter().flatten().collect()
}

/// Standard competition ranking over values already sorted descending.
pub fn competition_positions(sorted_desc: &[f64]) -> Vec<usize> {
    let mut positions = Vec::with_capacity(sorted_desc.len());
    for (i, v) in sorted_desc.iter().enumerate() {
        if i > 0 && sorted_desc[i - 1] == *v {
            positions.push(positions[i - 1]);
        } else {
            positions.push(i + 1);
        }
    }
    positions
}

#[derive(Debug, Clone)]
pub struct RosterStudent {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryOptions {
    pub weight_by_credit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSummary {
    pub student_id: String,
    pub display_name: String,
    pub subject_count: usize,
    pub total_percentage: f64,
    pub average: f64,
    pub grade: String,
    pub remark: String,
    pub position: usize,
}

/// Per-student averages for one exam type, ranked with competition ranking.
/// Records for students missing from the roster are ignored.
pub fn compute_summaries(
    records: &[AlignedRecord],
    roster: &[RosterStudent],
    exam_type: ExamType,
    credits: &HashMap<String, f64>,
    options: SummaryOptions,
    scale: &GradeScale,
) -> Vec<ResultSummary> {
    let names: HashMap<&str, &str> = roster
        .iter()
        .map(|s| (s.id.as_str(), s.display_name.as_str()))
        .collect();

    // student -> (sum of percentages, weighted sum, weight, subject count)
    let mut acc: HashMap<&str, (f64, f64, f64, usize)> = HashMap::new();
    for r in records.iter().filter(|r| r.exam_type == exam_type) {
        if !names.contains_key(r.student_id.as_str()) {
            continue;
        }
        let credit = credits.get(&r.subject_id).copied().unwrap_or(1.0).max(0.0);
        let e = acc.entry(r.student_id.as_str()).or_insert((0.0, 0.0, 0.0, 0));
        e.0 += r.percentage;
        e.1 += r.percentage * credit;
        e.2 += credit;
        e.3 += 1;
    }

    let mut rows: Vec<ResultSummary> = acc
        .into_iter()
        .map(|(student_id, (sum, weighted, weight, count))| {
            let raw_avg = if options.weight_by_credit && weight > 0.0 {
                weighted / weight
            } else if count > 0 {
                sum / count as f64
            } else {
                0.0
            };
            let average = round_off_1_decimal(raw_avg);
            let (grade, remark) = scale.grade_for_percent(average);
            ResultSummary {
                student_id: student_id.to_string(),
                display_name: names.get(student_id).copied().unwrap_or("").to_string(),
                subject_count: count,
                total_percentage: round_off_1_decimal(sum),
                average,
                grade,
                remark,
                position: 0,
            }
        })
        .collect();

    rows.sort_by(|a, b| {
        b.average
            .partial_cmp(&a.average)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.display_name.cmp(&b.display_name))
            .then_with(|| a.student_id.cmp(&b.student_id))
    });
    let averages: Vec<f64> = rows.iter().map(|r| r.average).collect();
    for (row, pos) in rows.iter_mut().zip(competition_positions(&averages)) {
        row.position = pos;
    }
    rows
}

/// Competition-ranked position of every student within one subject.
pub fn subject_positions(
    records: &[AlignedRecord],
    subject_id: &str,
    exam_type: ExamType,
) -> HashMap<String, usize> {
    let mut rows: Vec<(&str, f64)> = records
        .iter()
        .filter(|r| r.subject_id == subject_id && r.exam_type == exam_type)
        .map(|r| (r.student_id.as_str(), r.percentage))
        .collect();
    rows.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(b.0))
    });
    let values: Vec<f64> = rows.iter().map(|r| r.1).collect();
    rows.iter()
        .zip(competition_positions(&values))
        .map(|((id, _), pos)| (id.to_string(), pos))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectStats {
    pub subject_id: String,
    pub student_count: usize,
    pub average: f64,
    pub highest: f64,
    pub lowest: f64,
}

pub fn subject_stats(records: &[AlignedRecord], subject_id: &str, exam_type: ExamType) -> SubjectStats {
    let values: Vec<f64> = records
        .iter()
        .filter(|r| r.subject_id == subject_id && r.exam_type == exam_type)
        .map(|r| r.percentage)
        .collect();
    if values.is_empty() {
        return SubjectStats {
            subject_id: subject_id.to_string(),
            student_count: 0,
            average: 0.0,
            highest: 0.0,
            lowest: 0.0,
        };
    }
    let sum: f64 = values.iter().sum();
    SubjectStats {
        subject_id: subject_id.to_string(),
        student_count: values.len(),
        average: round_off_1_decimal(sum / values.len() as f64),
        highest: values.iter().copied().fold(f64::MIN, f64::max),
        lowest: values.iter().copied().fold(f64::MAX, f64::min),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionDecision {
    Promote,
    Hold,
}

impl PromotionDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            PromotionDecision::Promote => "promote",
            PromotionDecision::Hold => "hold",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "promote" => Some(PromotionDecision::Promote),
            "hold" => Some(PromotionDecision::Hold),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Auto,
    Override,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionCandidate {
    pub student_id: String,
    pub display_name: String,
    pub average: Option<f64>,
    pub grade: Option<String>,
    pub position: Option<usize>,
    pub auto_promote: bool,
    pub override_decision: Option<PromotionDecision>,
    pub promoted: bool,
    pub source: DecisionSource,
}

pub fn auto_promotes(average: f64, threshold: f64) -> bool {
    average >= threshold
}

/// One candidate per roster student. Students without a final-term summary
/// are never auto-promoted but still honour an override.
pub fn promotion_candidates(
    roster: &[RosterStudent],
    summaries: &[ResultSummary],
    overrides: &HashMap<String, PromotionDecision>,
    threshold: f64,
) -> Vec<PromotionCandidate> {
    let by_student: HashMap<&str, &ResultSummary> = summaries
        .iter()
        .map(|s| (s.student_id.as_str(), s))
        .collect();

    let mut out: Vec<PromotionCandidate> = roster
        .iter()
        .map(|st| {
            let summary = by_student.get(st.id.as_str()).copied();
            let auto_promote = summary
                .map(|s| auto_promotes(s.average, threshold))
                .unwrap_or(false);
            let override_decision = overrides.get(&st.id).copied();
            let (promoted, source) = match override_decision {
                Some(d) => (d == PromotionDecision::Promote, DecisionSource::Override),
                None => (auto_promote, DecisionSource::Auto),
            };
            PromotionCandidate {
                student_id: st.id.clone(),
                display_name: st.display_name.clone(),
                average: summary.map(|s| s.average),
                grade: summary.map(|s| s.grade.clone()),
                position: summary.map(|s| s.position),
                auto_promote,
                override_decision,
                promoted,
                source,
            }
        })
        .collect();

    out.sort_by(|a, b| {
        let pa = a.position.unwrap_or(usize::MAX);
        let pb = b.position.unwrap_or(usize::MAX);
        pa.cmp(&pb).then_with(|| a.display_name.cmp(&b.display_name))
    });
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectPick {
    pub subject_id: String,
    pub name: String,
    pub percentage: f64,
}

/// Best and weakest subject by percentage; ties go to the subject name that
/// sorts first.
pub fn best_and_weakest(subjects: &[SubjectPick]) -> (Option<SubjectPick>, Option<SubjectPick>) {
    let best = subjects
        .iter()
        .min_by(|a, b| {
            b.percentage
                .partial_cmp(&a.percentage)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        })
        .cloned();
    let weakest = subjects
        .iter()
        .min_by(|a, b| {
            a.percentage
                .partial_cmp(&b.percentage)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        })
        .cloned();
    (best, weakest)
}
