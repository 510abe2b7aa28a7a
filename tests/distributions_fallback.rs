mod common;

use common::{str_of, Sidecar};
use serde_json::{json, Value};

fn create(sc: &mut Sidecar, name: &str, scope: Value) -> String {
    let mut params = json!({
        "name": name,
        "examType": "final",
        "components": [{ "label": "CA", "weight": 40 }, { "label": "Exam", "weight": 60 }]
    });
    if let (Some(obj), Some(extra)) = (params.as_object_mut(), scope.as_object()) {
        for (k, v) in extra {
            obj.insert(k.clone(), v.clone());
        }
    }
    str_of(&sc.ok("distributions.create", params), "distributionId")
}

fn resolved_name(sc: &mut Sidecar, query: Value) -> Option<String> {
    let res = sc.ok("distributions.resolve", query);
    res["distribution"]["name"].as_str().map(|s| s.to_string())
}

#[test]
fn resolution_falls_back_from_exact_to_generic() {
    let (mut sc, _ws) = Sidecar::with_workspace("resultsd-dist-fallback");
    let s = str_of(&sc.ok("sessions.create", json!({ "name": "2024/2025" })), "sessionId");
    let s2 = str_of(&sc.ok("sessions.create", json!({ "name": "2025/2026" })), "sessionId");
    let school = str_of(&sc.ok("schools.create", json!({ "name": "Hillside" })), "schoolId");

    create(&mut sc, "generic", json!({}));
    create(&mut sc, "term two", json!({ "term": 2 }));
    create(&mut sc, "session", json!({ "sessionId": s }));
    create(&mut sc, "exact", json!({ "sessionId": s, "term": 1 }));
    create(&mut sc, "hillside", json!({ "schoolId": school }));

    let q = |session: &str, term: i64| json!({ "examType": "final", "sessionId": session, "term": term });
    assert_eq!(resolved_name(&mut sc, q(&s, 1)).as_deref(), Some("exact"));
    assert_eq!(resolved_name(&mut sc, q(&s, 2)).as_deref(), Some("session"));
    assert_eq!(resolved_name(&mut sc, q(&s2, 2)).as_deref(), Some("term two"));
    assert_eq!(resolved_name(&mut sc, q(&s2, 3)).as_deref(), Some("generic"));

    let mut with_school = q(&s2, 3);
    with_school["schoolId"] = json!(school);
    assert_eq!(resolved_name(&mut sc, with_school).as_deref(), Some("hillside"));
    // A more specific unscoped template still beats a school-wide one.
    let mut with_school = q(&s, 1);
    with_school["schoolId"] = json!(school);
    assert_eq!(resolved_name(&mut sc, with_school).as_deref(), Some("exact"));

    // classId resolves through the class's school.
    let class = str_of(
        &sc.ok("classes.create", json!({ "name": "JSS 1", "schoolId": school })),
        "classId",
    );
    let mut via_class = q(&s2, 3);
    via_class["classId"] = json!(class);
    assert_eq!(resolved_name(&mut sc, via_class).as_deref(), Some("hillside"));

    assert_eq!(
        resolved_name(&mut sc, json!({ "examType": "midterm", "sessionId": s, "term": 1 })),
        None
    );
}

#[test]
fn component_rules_are_enforced() {
    let (mut sc, _ws) = Sidecar::with_workspace("resultsd-dist-rules");
    let s = str_of(
        &sc.ok("sessions.create", json!({ "name": "2024/2025", "termCount": 2 })),
        "sessionId",
    );

    let bad = [
        json!({ "name": "dup", "examType": "final",
                "components": [{ "label": "CA", "weight": 40 }, { "label": "ca", "weight": 60 }] }),
        json!({ "name": "heavy", "examType": "final",
                "components": [{ "label": "Exam", "weight": 101 }] }),
        json!({ "name": "two carries", "examType": "final",
                "components": [
                    { "label": "M1", "weight": 10, "kind": "carry_forward" },
                    { "label": "M2", "weight": 10, "kind": "carry_forward" },
                    { "label": "Exam", "weight": 80 }
                ] }),
        json!({ "name": "carry on midterm", "examType": "midterm",
                "components": [{ "label": "M", "weight": 100, "kind": "carry_forward" }] }),
        json!({ "name": "empty", "examType": "final", "components": [] }),
        json!({ "name": "quiz", "examType": "quiz",
                "components": [{ "label": "Exam", "weight": 100 }] }),
        json!({ "name": "term 3", "examType": "final", "sessionId": s, "term": 3,
                "components": [{ "label": "Exam", "weight": 100 }] }),
    ];
    for params in bad {
        assert_eq!(sc.err_code("distributions.create", params.clone()), "bad_params", "{}", params);
    }

    let created = sc.ok(
        "distributions.create",
        json!({ "name": "short", "examType": "midterm",
                "components": [{ "label": "Test", "weight": 20 }, { "label": "Quiz", "weight": 20 }] }),
    );
    assert_eq!(created["warnings"][0]["code"], "weights_not_100");
    assert_eq!(created["warnings"][0]["totalWeight"], json!(40));
    let id = str_of(&created, "distributionId");

    let updated = sc.ok(
        "distributions.update",
        json!({ "distributionId": id, "patch": {
            "name": "Midterm",
            "components": [{ "label": "Test", "weight": 50 }, { "label": "Quiz", "weight": 50 }]
        } }),
    );
    assert_eq!(updated["warnings"], json!([]));
    let opened = sc.ok("distributions.open", json!({ "distributionId": id }));
    assert_eq!(opened["distribution"]["name"], "Midterm");
    assert_eq!(opened["distribution"]["totalWeight"], json!(100));
    assert_eq!(opened["distribution"]["components"][1]["label"], "Quiz");

    let listed = sc.ok("distributions.list", json!({ "examType": "midterm" }));
    assert_eq!(listed["distributions"].as_array().map(|d| d.len()), Some(1));
    let listed = sc.ok("distributions.list", json!({ "examType": "final" }));
    assert_eq!(listed["distributions"], json!([]));

    sc.ok("distributions.delete", json!({ "distributionId": id }));
    assert_eq!(
        sc.err_code("distributions.open", json!({ "distributionId": id })),
        "not_found"
    );
}
