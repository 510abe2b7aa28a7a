#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    pub fn spawn() -> Self {
        let exe = env!("CARGO_BIN_EXE_resultsd");
        let mut child = Command::new(exe)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn resultsd");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
        }
    }

    /// Spawn and select a fresh workspace.
    pub fn with_workspace(prefix: &str) -> (Self, PathBuf) {
        let workspace = temp_dir(prefix);
        let mut sc = Self::spawn();
        sc.ok("workspace.select", json!({ "path": workspace.to_string_lossy() }));
        (sc, workspace)
    }

    pub fn send_line(&mut self, line: &str) -> serde_json::Value {
        writeln!(self.stdin, "{}", line).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut resp = String::new();
        self.reader.read_line(&mut resp).expect("read response line");
        assert!(!resp.trim().is_empty(), "empty response for {}", line);
        serde_json::from_str(resp.trim()).expect("parse response json")
    }

    pub fn request(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({ "id": id, "method": method, "params": params });
        let value = self.send_line(&payload.to_string());
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    pub fn ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let resp = self.request(method, params);
        assert_eq!(
            resp.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "{} failed: {}",
            method,
            resp
        );
        resp["result"].clone()
    }

    /// Returns the error code of a request that must fail.
    pub fn err_code(&mut self, method: &str, params: serde_json::Value) -> String {
        let resp = self.request(method, params);
        assert_eq!(
            resp.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            resp
        );
        resp["error"]["code"].as_str().unwrap_or("").to_string()
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn str_of(v: &serde_json::Value, key: &str) -> String {
    v[key].as_str().unwrap_or_else(|| panic!("missing {} in {}", key, v)).to_string()
}

/// Session, class, students and subjects shared by most flows.
pub struct Fixture {
    pub session_id: String,
    pub class_id: String,
    pub students: Vec<String>,
    pub subjects: Vec<String>,
}

pub fn seed_class(
    sc: &mut Sidecar,
    term_count: i64,
    students: &[(&str, &str)],
    subjects: &[&str],
) -> Fixture {
    let session = sc.ok(
        "sessions.create",
        json!({ "name": "2024/2025", "termCount": term_count }),
    );
    let class = sc.ok("classes.create", json!({ "name": "JSS 1", "level": 1 }));
    let class_id = str_of(&class, "classId");

    let students = students
        .iter()
        .map(|(last, first)| {
            let r = sc.ok(
                "students.create",
                json!({ "classId": class_id, "lastName": last, "firstName": first }),
            );
            str_of(&r, "studentId")
        })
        .collect();
    let subjects: Vec<String> = subjects
        .iter()
        .map(|name| str_of(&sc.ok("subjects.create", json!({ "name": name })), "subjectId"))
        .collect();
    let offering: Vec<_> = subjects.iter().map(|id| json!({ "subjectId": id })).collect();
    sc.ok(
        "classes.subjects.set",
        json!({ "classId": class_id, "subjects": offering }),
    );

    Fixture {
        session_id: str_of(&session, "sessionId"),
        class_id,
        students,
        subjects,
    }
}
