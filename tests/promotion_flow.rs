mod common;

use common::{seed_class, str_of, Fixture, Sidecar};
use serde_json::{json, Value};

fn build() -> (Sidecar, Fixture) {
    let (mut sc, _ws) = Sidecar::with_workspace("resultsd-promotion");
    let fx = seed_class(
        &mut sc,
        2,
        &[("Pam", "Ola"), ("Quist", "Ada"), ("Roe", "Ben")],
        &["Mathematics"],
    );
    sc.ok(
        "distributions.create",
        json!({
            "name": "Exam only",
            "examType": "final",
            "components": [{ "label": "Exam", "weight": 100 }]
        }),
    );
    // Roe sits no final exam.
    sc.ok(
        "scores.save",
        json!({
            "classId": fx.class_id,
            "sessionId": fx.session_id,
            "term": 2,
            "examType": "final",
            "subjectId": fx.subjects[0],
            "rows": [
                { "studentId": fx.students[0], "components": [{ "label": "Exam", "score": 50 }] },
                { "studentId": fx.students[1], "components": [{ "label": "Exam", "score": 49.9 }] }
            ]
        }),
    );
    (sc, fx)
}

fn candidates(sc: &mut Sidecar, fx: &Fixture) -> Vec<Value> {
    let res = sc.ok(
        "promotion.candidates",
        json!({ "classId": fx.class_id, "sessionId": fx.session_id }),
    );
    assert_eq!(res["finalTerm"], json!(2));
    res["candidates"].as_array().cloned().expect("candidates")
}

fn set_override(sc: &mut Sidecar, fx: &Fixture, student: usize, decision: Value) -> Value {
    sc.ok(
        "promotion.setOverride",
        json!({
            "studentId": fx.students[student],
            "sessionId": fx.session_id,
            "decision": decision,
            "note": "reviewed by form teacher"
        }),
    )
}

#[test]
fn threshold_decides_and_missing_results_never_auto_promote() {
    let (mut sc, fx) = build();
    let list = candidates(&mut sc, &fx);
    assert_eq!(list.len(), 3);

    assert_eq!(list[0]["studentId"], json!(fx.students[0]));
    assert_eq!(list[0]["average"], json!(50.0));
    assert_eq!(list[0]["promoted"], json!(true));
    assert_eq!(list[0]["source"], "auto");

    assert_eq!(list[1]["studentId"], json!(fx.students[1]));
    assert_eq!(list[1]["autoPromote"], json!(false));
    assert_eq!(list[1]["promoted"], json!(false));

    assert_eq!(list[2]["studentId"], json!(fx.students[2]));
    assert!(list[2]["average"].is_null());
    assert!(list[2]["position"].is_null());
    assert_eq!(list[2]["promoted"], json!(false));
}

#[test]
fn overrides_win_until_cleared() {
    let (mut sc, fx) = build();
    let set = set_override(&mut sc, &fx, 1, json!("promote"));
    assert_eq!(set["decision"], "promote");
    set_override(&mut sc, &fx, 2, json!("HOLD"));

    let list = candidates(&mut sc, &fx);
    assert_eq!(list[1]["promoted"], json!(true));
    assert_eq!(list[1]["source"], "override");
    assert_eq!(list[1]["overrideDecision"], "promote");
    assert_eq!(list[2]["promoted"], json!(false));
    assert_eq!(list[2]["source"], "override");

    let cleared = set_override(&mut sc, &fx, 1, Value::Null);
    assert!(cleared["decision"].is_null());
    let list = candidates(&mut sc, &fx);
    assert_eq!(list[1]["promoted"], json!(false));
    assert_eq!(list[1]["source"], "auto");
    assert!(list[1]["overrideDecision"].is_null());

    let code = sc.err_code(
        "promotion.setOverride",
        json!({ "studentId": fx.students[0], "sessionId": fx.session_id, "decision": "maybe" }),
    );
    assert_eq!(code, "bad_params");
    let code = sc.err_code(
        "promotion.setOverride",
        json!({ "studentId": "nobody", "sessionId": fx.session_id, "decision": "hold" }),
    );
    assert_eq!(code, "not_found");
}

#[test]
fn threshold_follows_grading_setup() {
    let (mut sc, fx) = build();
    sc.ok(
        "setup.update",
        json!({ "section": "grading", "patch": { "passThreshold": 45 } }),
    );
    let res = sc.ok(
        "promotion.candidates",
        json!({ "classId": fx.class_id, "sessionId": fx.session_id }),
    );
    assert_eq!(res["threshold"], json!(45.0));
    assert_eq!(res["candidates"][1]["promoted"], json!(true));
}

#[test]
fn finalize_snapshots_and_moves_promoted_students() {
    let (mut sc, fx) = build();
    set_override(&mut sc, &fx, 1, json!("promote"));

    let first = sc.ok(
        "promotion.finalize",
        json!({ "classId": fx.class_id, "sessionId": fx.session_id }),
    );
    assert_eq!(first["promotedCount"], json!(2));
    assert_eq!(first["heldCount"], json!(1));
    assert_eq!(first["movedCount"], json!(0));
    assert!(first["nextClassId"].is_null());

    let code = sc.err_code(
        "promotion.finalize",
        json!({ "classId": fx.class_id, "sessionId": fx.session_id, "applyMoves": true }),
    );
    assert_eq!(code, "bad_params");

    let next = str_of(&sc.ok("classes.create", json!({ "name": "JSS 2", "level": 2 })), "classId");
    sc.ok(
        "classes.update",
        json!({ "classId": fx.class_id, "patch": { "nextClassId": next } }),
    );
    let applied = sc.ok(
        "promotion.finalize",
        json!({ "classId": fx.class_id, "sessionId": fx.session_id, "applyMoves": true }),
    );
    assert_eq!(applied["movedCount"], json!(2));
    assert_eq!(applied["nextClassId"], json!(next));

    let moved = sc.ok("students.list", json!({ "classId": next }));
    let ids: Vec<String> = moved["students"]
        .as_array()
        .expect("students")
        .iter()
        .map(|s| str_of(s, "id"))
        .collect();
    assert_eq!(ids, vec![fx.students[0].clone(), fx.students[1].clone()]);
    let left = sc.ok("students.list", json!({ "classId": fx.class_id }));
    assert_eq!(left["students"].as_array().map(|s| s.len()), Some(1));

    let snaps = sc.ok("promotion.snapshots", json!({ "classId": fx.class_id }));
    let snaps = snaps["snapshots"].as_array().expect("snapshots");
    assert_eq!(snaps.len(), 2);
    for s in snaps {
        assert_eq!(s["sessionId"], json!(fx.session_id));
        assert_eq!(s["candidates"].as_array().map(|c| c.len()), Some(3));
        assert_eq!(s["threshold"], json!(50.0));
    }
}

#[test]
fn past_results_survive_promotion_moves() {
    let (mut sc, fx) = build();
    let next = str_of(&sc.ok("classes.create", json!({ "name": "JSS 2", "level": 2 })), "classId");
    sc.ok(
        "classes.update",
        json!({ "classId": fx.class_id, "patch": { "nextClassId": next } }),
    );
    let applied = sc.ok(
        "promotion.finalize",
        json!({ "classId": fx.class_id, "sessionId": fx.session_id, "applyMoves": true }),
    );
    assert_eq!(applied["movedCount"], json!(1));

    let scope = json!({
        "classId": fx.class_id,
        "sessionId": fx.session_id,
        "term": 2,
        "examType": "final"
    });
    let res = sc.ok("results.classSummary", scope.clone());
    let summaries = res["summaries"].as_array().expect("summaries");
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0]["studentId"], json!(fx.students[0]));
    assert_eq!(summaries[0]["position"], json!(1));
    assert_eq!(summaries[1]["studentId"], json!(fx.students[1]));
    assert_eq!(summaries[1]["position"], json!(2));

    let mut card_params = scope.clone();
    card_params["studentId"] = json!(fx.students[0]);
    let card = sc.ok("reports.reportCardModel", card_params);
    assert_eq!(card["classSize"], json!(2));
    assert_eq!(card["summary"]["position"], json!(1));
    assert_eq!(card["subjects"][0]["position"], json!(1));

    let mut sheet = scope.clone();
    sheet["subjectId"] = json!(fx.subjects[0]);
    let sheet = sc.ok("scores.sheetOpen", sheet);
    assert_eq!(sheet["rows"].as_array().map(|r| r.len()), Some(3));

    // The moved student is still listed but is not moved a second time.
    assert_eq!(candidates(&mut sc, &fx).len(), 3);
    let again = sc.ok(
        "promotion.finalize",
        json!({ "classId": fx.class_id, "sessionId": fx.session_id, "applyMoves": true }),
    );
    assert_eq!(again["promotedCount"], json!(1));
    assert_eq!(again["movedCount"], json!(0));
}

#[test]
fn report_card_needs_a_student_of_the_class() {
    let (mut sc, fx) = build();
    let other = str_of(&sc.ok("classes.create", json!({ "name": "JSS 2" })), "classId");
    let outsider = str_of(
        &sc.ok(
            "students.create",
            json!({ "classId": other, "lastName": "Uche", "firstName": "Ify" }),
        ),
        "studentId",
    );
    let params = |student: &str| {
        json!({
            "classId": fx.class_id,
            "sessionId": fx.session_id,
            "term": 2,
            "studentId": student
        })
    };
    assert_eq!(sc.err_code("reports.reportCardModel", params(&outsider)), "not_found");
    assert_eq!(sc.err_code("reports.reportCardModel", params("nobody")), "not_found");

    // A current member without scores still gets a card.
    let card = sc.ok("reports.reportCardModel", params(&fx.students[2]));
    assert!(card["summary"].is_null());
    assert_eq!(card["classSize"], json!(2));
}

#[test]
fn moving_a_student_appends_them_to_the_target_class() {
    let (mut sc, fx) = build();
    let next = str_of(&sc.ok("classes.create", json!({ "name": "JSS 2" })), "classId");
    let sam = str_of(
        &sc.ok(
            "students.create",
            json!({ "classId": next, "lastName": "Sam", "firstName": "Eke" }),
        ),
        "studentId",
    );

    sc.ok(
        "students.update",
        json!({ "studentId": fx.students[2], "patch": { "classId": next } }),
    );
    let list = sc.ok("students.list", json!({ "classId": next }));
    let list = list["students"].as_array().expect("students");
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["id"], json!(sam));
    assert_eq!(list[1]["id"], json!(fx.students[2]));
    assert_eq!(list[1]["sortOrder"], json!(1));
}
