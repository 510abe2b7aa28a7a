mod common;

use common::{seed_class, Fixture, Sidecar};
use serde_json::json;

fn one_student_scoring(sc: &mut Sidecar, score: f64) -> Fixture {
    let fx = seed_class(sc, 1, &[("Ade", "Bola")], &["Mathematics"]);
    sc.ok(
        "distributions.create",
        json!({ "name": "Exam", "examType": "final", "components": [{ "label": "Exam", "weight": 100 }] }),
    );
    sc.ok(
        "scores.save",
        json!({
            "classId": fx.class_id,
            "sessionId": fx.session_id,
            "term": 1,
            "subjectId": fx.subjects[0],
            "rows": [{ "studentId": fx.students[0], "components": [{ "label": "Exam", "score": score }] }]
        }),
    );
    fx
}

fn summary_grade(sc: &mut Sidecar, fx: &Fixture) -> (String, String) {
    let res = sc.ok(
        "results.classSummary",
        json!({ "classId": fx.class_id, "sessionId": fx.session_id, "term": 1 }),
    );
    let row = &res["summaries"][0];
    (
        row["grade"].as_str().unwrap_or("").to_string(),
        row["remark"].as_str().unwrap_or("").to_string(),
    )
}

#[test]
fn defaults_are_reported_before_anything_is_saved() {
    let (mut sc, _ws) = Sidecar::with_workspace("resultsd-setup-defaults");
    let setup = sc.ok("setup.get", json!({}));
    assert_eq!(setup["grading"]["passThreshold"], json!(50.0));
    assert_eq!(setup["grading"]["weightBySubjectCredit"], json!(false));
    assert_eq!(setup["grading"]["bands"][0]["grade"], "A1");
    assert_eq!(setup["grading"]["bands"][0]["min"], json!(75.0));
    assert_eq!(setup["grading"]["midtermBands"][0]["min"], json!(38.0));
    assert_eq!(setup["reports"]["showAttendance"], json!(true));
    assert!(setup["reports"]["schoolHeader"].is_null());
}

#[test]
fn custom_bands_change_grades_and_persist() {
    let (mut sc, ws) = Sidecar::with_workspace("resultsd-setup-bands");
    let fx = one_student_scoring(&mut sc, 72.0);
    assert_eq!(summary_grade(&mut sc, &fx), ("A2".to_string(), "Very Good".to_string()));

    let updated = sc.ok(
        "setup.update",
        json!({ "section": "grading", "patch": { "bands": [
            { "min": 0, "grade": "F", "remark": "Fail" },
            { "min": 70, "grade": "A", "remark": "Top" },
            { "min": 50, "grade": "C" }
        ] } }),
    );
    assert_eq!(updated["section"], "grading");
    // Stored highest threshold first.
    assert_eq!(updated["values"]["bands"][0]["grade"], "A");
    assert_eq!(updated["values"]["bands"][2]["grade"], "F");
    assert_eq!(summary_grade(&mut sc, &fx), ("A".to_string(), "Top".to_string()));

    drop(sc);
    let mut sc = Sidecar::spawn();
    sc.ok("workspace.select", json!({ "path": ws.to_string_lossy() }));
    let setup = sc.ok("setup.get", json!({}));
    assert_eq!(setup["grading"]["bands"].as_array().map(|b| b.len()), Some(3));
    assert_eq!(summary_grade(&mut sc, &fx), ("A".to_string(), "Top".to_string()));
}

#[test]
fn invalid_patches_are_rejected_without_saving() {
    let (mut sc, _ws) = Sidecar::with_workspace("resultsd-setup-invalid");
    let bad = [
        json!({ "section": "finance", "patch": {} }),
        json!({ "section": "grading" }),
        json!({ "section": "grading", "patch": { "passThreshold": 120 } }),
        json!({ "section": "grading", "patch": { "weightBySubjectCredit": "yes" } }),
        json!({ "section": "grading", "patch": { "bands": [] } }),
        json!({ "section": "grading", "patch": { "bands": [{ "min": 101, "grade": "A" }] } }),
        json!({ "section": "grading", "patch": { "bands": [
            { "min": 50, "grade": "A" }, { "min": 50, "grade": "B" }
        ] } }),
        json!({ "section": "grading", "patch": { "midtermBands": [{ "min": 60, "grade": "A" }] } }),
        json!({ "section": "grading", "patch": { "colour": "blue" } }),
        json!({ "section": "reports", "patch": { "showTraits": 1 } }),
    ];
    for params in bad {
        assert_eq!(sc.err_code("setup.update", params.clone()), "bad_params", "{}", params);
    }
    let setup = sc.ok("setup.get", json!({}));
    assert_eq!(setup["grading"]["passThreshold"], json!(50.0));
    assert_eq!(setup["grading"]["bands"].as_array().map(|b| b.len()), Some(10));
}

#[test]
fn report_sections_can_be_switched_off() {
    let (mut sc, _ws) = Sidecar::with_workspace("resultsd-setup-reports");
    let fx = one_student_scoring(&mut sc, 64.0);
    sc.ok(
        "attendance.set",
        json!({
            "sessionId": fx.session_id,
            "term": 1,
            "rows": [{ "studentId": fx.students[0], "daysOpen": 50, "daysPresent": 50 }]
        }),
    );
    let params = json!({
        "classId": fx.class_id,
        "sessionId": fx.session_id,
        "term": 1,
        "studentId": fx.students[0]
    });

    let card = sc.ok("reports.reportCardModel", params.clone());
    assert_eq!(card["attendance"]["percentPresent"], json!(100.0));
    assert_eq!(card["traits"], json!([]));
    assert_eq!(card["subjects"][0]["position"], json!(1));
    assert_eq!(card["subjects"][0]["grade"], "B3");

    sc.ok(
        "setup.update",
        json!({ "section": "reports", "patch": {
            "showAttendance": false,
            "showTraits": false,
            "showSubjectPosition": false,
            "schoolHeader": "  Hillside Academy  "
        } }),
    );
    let card = sc.ok("reports.reportCardModel", params);
    assert!(card["attendance"].is_null());
    assert!(card["traits"].is_null());
    assert!(card["subjects"][0]["position"].is_null());
    assert_eq!(card["schoolHeader"], "Hillside Academy");
}
