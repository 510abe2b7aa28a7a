mod common;

use common::{seed_class, str_of, Fixture, Sidecar};
use serde_json::{json, Value};

fn build() -> (Sidecar, Fixture, String) {
    let (mut sc, _ws) = Sidecar::with_workspace("resultsd-scores");
    let fx = seed_class(&mut sc, 3, &[("Ade", "Bola"), ("Obi", "Chi")], &["Mathematics"]);
    let dist = sc.ok(
        "distributions.create",
        json!({
            "name": "Final",
            "examType": "final",
            "components": [{ "label": "CA", "weight": 40 }, { "label": "Exam", "weight": 60 }]
        }),
    );
    let dist_id = str_of(&dist, "distributionId");
    (sc, fx, dist_id)
}

fn save_params(fx: &Fixture, exam: &str, rows: Value) -> Value {
    json!({
        "classId": fx.class_id,
        "sessionId": fx.session_id,
        "term": 1,
        "examType": exam,
        "subjectId": fx.subjects[0],
        "rows": rows,
    })
}

fn without(mut v: Value, key: &str) -> Value {
    if let Some(obj) = v.as_object_mut() {
        obj.remove(key);
    }
    v
}

fn codes(row: &Value) -> Vec<String> {
    row["warnings"]
        .as_array()
        .map(|w| {
            w.iter()
                .filter_map(|x| x["code"].as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn malformed_saves_are_rejected() {
    let (mut sc, fx, _) = build();
    let other = str_of(&sc.ok("classes.create", json!({ "name": "JSS 2" })), "classId");
    let outsider = str_of(
        &sc.ok(
            "students.create",
            json!({ "classId": other, "lastName": "Uche", "firstName": "Ify" }),
        ),
        "studentId",
    );
    let a = &fx.students[0];
    let exam = |score: Value| json!([{ "studentId": a, "components": [{ "label": "Exam", "score": score }] }]);

    let no_subject = without(save_params(&fx, "final", exam(json!(10))), "subjectId");
    assert_eq!(sc.err_code("scores.save", no_subject), "bad_params");

    let mut term_four = save_params(&fx, "final", exam(json!(10)));
    term_four["term"] = json!(4);
    assert_eq!(sc.err_code("scores.save", term_four), "bad_params");

    let mut term_zero = save_params(&fx, "final", exam(json!(10)));
    term_zero["term"] = json!(0);
    assert_eq!(sc.err_code("scores.save", term_zero), "bad_params");

    assert_eq!(sc.err_code("scores.save", save_params(&fx, "quiz", exam(json!(10)))), "bad_params");
    assert_eq!(sc.err_code("scores.save", save_params(&fx, "final", exam(json!("ten")))), "bad_params");
    assert_eq!(sc.err_code("scores.save", save_params(&fx, "final", json!({}))), "bad_params");

    let dup = json!([
        { "studentId": a, "components": [] },
        { "studentId": a, "components": [] }
    ]);
    assert_eq!(sc.err_code("scores.save", save_params(&fx, "final", dup)), "bad_params");

    let unlabeled = json!([{ "studentId": a, "components": [{ "score": 5 }] }]);
    assert_eq!(sc.err_code("scores.save", save_params(&fx, "final", unlabeled)), "bad_params");

    let foreign = json!([{ "studentId": outsider, "components": [] }]);
    assert_eq!(sc.err_code("scores.save", save_params(&fx, "final", foreign)), "bad_params");
    let ghost = json!([{ "studentId": "ghost", "components": [] }]);
    assert_eq!(sc.err_code("scores.save", save_params(&fx, "final", ghost)), "not_found");

    // Nothing was written by any of the rejected saves.
    let open = without(save_params(&fx, "final", Value::Null), "rows");
    let sheet = sc.ok("scores.sheetOpen", open);
    assert!(sheet["rows"].as_array().expect("rows").iter().all(|r| r["recordId"].is_null()));
}

#[test]
fn raw_scores_are_kept_and_realigned_on_read() {
    let (mut sc, fx, dist_id) = build();
    let rows = json!([
        { "studentId": fx.students[0], "components": [
            { "label": "CA", "score": 10 }, { "label": "Exam", "score": 75 }
        ] },
        { "studentId": fx.students[1], "components": [
            { "label": "CA", "score": 30 }, { "label": "Project", "score": 5 }
        ] }
    ]);
    let saved = sc.ok("scores.save", save_params(&fx, "final", rows));
    let first_record = str_of(&saved["saved"][0], "recordId");

    let ade = &saved["sheet"]["rows"][0];
    assert_eq!(ade["components"][1]["score"], json!(60.0));
    assert_eq!(ade["totalScore"], json!(70.0));
    assert_eq!(codes(ade), vec!["score_clamped"]);
    assert_eq!(ade["warnings"][0]["raw"], json!(75.0));
    assert_eq!(ade["warnings"][0]["maxScore"], json!(60.0));

    let obi = &saved["sheet"]["rows"][1];
    assert_eq!(obi["percentage"], json!(30.0));
    assert_eq!(codes(obi), vec!["unmatched_component"]);

    // A wider Exam component now takes the stored 75 unclamped.
    sc.ok(
        "distributions.update",
        json!({ "distributionId": dist_id, "patch": { "components": [
            { "label": "CA", "weight": 20 }, { "label": "Exam", "weight": 80 }
        ] } }),
    );
    let open = without(save_params(&fx, "final", Value::Null), "rows");
    let sheet = sc.ok("scores.sheetOpen", open.clone());
    assert_eq!(sheet["rows"][0]["totalScore"], json!(85.0));
    assert!(codes(&sheet["rows"][0]).is_empty());

    // Saving again replaces the components of the same record.
    let again = sc.ok(
        "scores.save",
        save_params(&fx, "final", json!([
            { "studentId": fx.students[0], "components": [{ "label": "Exam", "score": 50 }] }
        ])),
    );
    assert_eq!(str_of(&again["saved"][0], "recordId"), first_record);
    assert_eq!(again["sheet"]["rows"][0]["totalScore"], json!(50.0));

    sc.ok("scores.delete", json!({ "recordId": first_record }));
    let sheet = sc.ok("scores.sheetOpen", open);
    assert!(sheet["rows"][0]["recordId"].is_null());
    assert_eq!(sc.err_code("scores.delete", json!({ "recordId": first_record })), "not_found");
}

#[test]
fn records_without_a_template_keep_their_own_maxima() {
    let (mut sc, fx, _) = build();
    let saved = sc.ok(
        "scores.save",
        save_params(&fx, "midterm", json!([
            { "studentId": fx.students[0], "components": [{ "label": "Quiz", "score": 8, "maxScore": 10 }] }
        ])),
    );
    assert!(saved["sheet"]["distribution"].is_null());
    let row = &saved["sheet"]["rows"][0];
    assert_eq!(row["percentage"], json!(80.0));
    assert_eq!(codes(row), vec!["no_distribution"]);
}

#[test]
fn deletes_refuse_while_scores_exist_and_class_delete_cascades() {
    let (mut sc, fx, _) = build();
    sc.ok(
        "scores.save",
        save_params(&fx, "final", json!([
            { "studentId": fx.students[0], "components": [{ "label": "Exam", "score": 40 }] }
        ])),
    );
    sc.ok(
        "attendance.set",
        json!({ "sessionId": fx.session_id, "term": 1,
                "rows": [{ "studentId": fx.students[0], "daysOpen": 10, "daysPresent": 9 }] }),
    );

    assert_eq!(sc.err_code("subjects.delete", json!({ "subjectId": fx.subjects[0] })), "conflict");
    assert_eq!(sc.err_code("students.delete", json!({ "studentId": fx.students[0] })), "conflict");
    assert_eq!(sc.err_code("sessions.delete", json!({ "sessionId": fx.session_id })), "conflict");
    let shrink = sc.request(
        "sessions.update",
        json!({ "sessionId": fx.session_id, "patch": { "termCount": 2 } }),
    );
    assert_eq!(shrink["ok"], json!(true), "{}", shrink);
    sc.ok("students.delete", json!({ "studentId": fx.students[1] }));

    sc.ok("classes.delete", json!({ "classId": fx.class_id }));
    assert_eq!(sc.err_code("students.list", json!({ "classId": fx.class_id })), "not_found");
    sc.ok("subjects.delete", json!({ "subjectId": fx.subjects[0] }));
    sc.ok("sessions.delete", json!({ "sessionId": fx.session_id }));
}

#[test]
fn attendance_bounds_are_checked() {
    let (mut sc, fx, _) = build();
    let set = |open: i64, present: i64| {
        json!({ "sessionId": fx.session_id, "term": 1,
                "rows": [{ "studentId": fx.students[0], "daysOpen": open, "daysPresent": present }] })
    };
    assert_eq!(sc.err_code("attendance.set", set(10, 11)), "bad_params");
    assert_eq!(sc.err_code("attendance.set", set(400, 10)), "bad_params");
    assert_eq!(sc.err_code("attendance.set", set(-1, 0)), "bad_params");
    sc.ok("attendance.set", set(20, 15));

    let got = sc.ok(
        "attendance.get",
        json!({ "classId": fx.class_id, "sessionId": fx.session_id, "term": 1 }),
    );
    assert_eq!(got["rows"][0]["attendance"]["daysAbsent"], json!(5));
    assert_eq!(got["rows"][0]["attendance"]["percentPresent"], json!(75.0));
    assert!(got["rows"][1]["attendance"].is_null());

    let bad_trait = json!({ "sessionId": fx.session_id, "term": 1,
        "rows": [{ "studentId": fx.students[0], "traits": { "Neatness": 6 } }] });
    assert_eq!(sc.err_code("traits.set", bad_trait), "bad_params");
    sc.ok(
        "traits.set",
        json!({ "sessionId": fx.session_id, "term": 1,
                "rows": [{ "studentId": fx.students[0], "traits": { "Neatness": 3 } }] }),
    );
    sc.ok(
        "traits.set",
        json!({ "sessionId": fx.session_id, "term": 1,
                "rows": [{ "studentId": fx.students[0], "traits": { "Neatness": null } }] }),
    );
    let got = sc.ok(
        "traits.get",
        json!({ "classId": fx.class_id, "sessionId": fx.session_id, "term": 1 }),
    );
    assert_eq!(got["rows"][0]["traits"], json!([]));
}
