//! Black-box stdio protocol tests against the real binary, covering the
//! end-to-end scenarios enumerated in spec §8.

use std::io::{Read, Write};
use std::process::{Command, Stdio};

fn run_session(cache_dir: &std::path::Path, input: &str) -> (String, std::process::ExitStatus) {
    let mut child = Command::new(env!("CARGO_BIN_EXE_gocica"))
        .env("GOCICA_CACHE_DIR", cache_dir)
        .env("GOCICA_LOG_LEVEL", "silent")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn gocica");

    child
        .stdin
        .take()
        .unwrap()
        .write_all(input.as_bytes())
        .unwrap();

    let mut stdout = String::new();
    child.stdout.take().unwrap().read_to_string(&mut stdout).unwrap();
    let status = child.wait().unwrap();
    (stdout, status)
}

fn lines(output: &str) -> Vec<serde_json::Value> {
    output
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| serde_json::from_str(l).expect("response line is valid JSON"))
        .collect()
}

#[test]
fn startup_handshake_on_immediate_eof() {
    let dir = tempfile::tempdir().unwrap();
    let (output, status) = run_session(dir.path(), "");
    let responses = lines(&output);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0]["ID"], 0);
    let known: Vec<&str> = responses[0]["KnownCommands"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert!(known.contains(&"close"));
    assert!(known.contains(&"get"));
    assert!(known.contains(&"put"));
    assert!(status.success());
}

#[test]
fn miss_then_put_then_hit() {
    let dir = tempfile::tempdir().unwrap();
    let body_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"hello");
    let input = format!(
        "{{\"ID\":1,\"Command\":\"get\",\"ActionID\":\"A\"}}\n\
         {{\"ID\":2,\"Command\":\"put\",\"ActionID\":\"A\",\"OutputID\":\"O\",\"BodySize\":5}}\n\"{body_b64}\"\n\
         {{\"ID\":3,\"Command\":\"get\",\"ActionID\":\"A\"}}\n\
         {{\"ID\":4,\"Command\":\"close\"}}\n"
    );
    let (output, status) = run_session(dir.path(), &input);
    let responses = lines(&output);

    let miss = responses.iter().find(|r| r["ID"] == 1).unwrap();
    assert_eq!(miss["Miss"], true);

    let put = responses.iter().find(|r| r["ID"] == 2).unwrap();
    let disk_path = put["DiskPath"].as_str().unwrap();
    assert!(disk_path.ends_with("o-O"));
    assert_eq!(std::fs::read_to_string(disk_path).unwrap(), "hello");

    let hit = responses.iter().find(|r| r["ID"] == 3).unwrap();
    assert_eq!(hit["OutputID"], "O");
    assert_eq!(hit["Size"], 5);
    assert!(hit["DiskPath"].as_str().unwrap().ends_with("o-O"));

    assert!(status.success());
}

#[test]
fn output_id_path_encoding_replaces_slashes() {
    let dir = tempfile::tempdir().unwrap();
    let body_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"x");
    let input = format!(
        "{{\"ID\":1,\"Command\":\"put\",\"ActionID\":\"A\",\"OutputID\":\"a/b/c\",\"BodySize\":1}}\n\"{body_b64}\"\n\
         {{\"ID\":2,\"Command\":\"get\",\"ActionID\":\"A\"}}\n\
         {{\"ID\":3,\"Command\":\"close\"}}\n"
    );
    let (output, status) = run_session(dir.path(), &input);
    let responses = lines(&output);

    let put = responses.iter().find(|r| r["ID"] == 1).unwrap();
    assert!(put["DiskPath"].as_str().unwrap().ends_with("o-a-b-c"));

    let get = responses.iter().find(|r| r["ID"] == 2).unwrap();
    assert_eq!(get["OutputID"], "a/b/c");
    assert!(get["DiskPath"].as_str().unwrap().ends_with("o-a-b-c"));

    assert!(status.success());
}

#[test]
fn zero_byte_payload_round_trips_to_an_empty_file() {
    let dir = tempfile::tempdir().unwrap();
    let input = "{\"ID\":1,\"Command\":\"put\",\"ActionID\":\"A\",\"OutputID\":\"O\",\"BodySize\":0}\n\
                 {\"ID\":2,\"Command\":\"get\",\"ActionID\":\"A\"}\n\
                 {\"ID\":3,\"Command\":\"close\"}\n";
    let (output, status) = run_session(dir.path(), input);
    let responses = lines(&output);

    let put = responses.iter().find(|r| r["ID"] == 1).unwrap();
    let disk_path = put["DiskPath"].as_str().unwrap();
    assert_eq!(std::fs::read(disk_path).unwrap().len(), 0);

    let get = responses.iter().find(|r| r["ID"] == 2).unwrap();
    assert_eq!(get["Size"], 0);

    assert!(status.success());
}

#[test]
fn close_is_idempotent_across_two_requests() {
    let dir = tempfile::tempdir().unwrap();
    let input = "{\"ID\":1,\"Command\":\"close\"}\n{\"ID\":2,\"Command\":\"close\"}\n";
    let (output, status) = run_session(dir.path(), input);
    let responses = lines(&output);

    // handshake + two close acks
    assert_eq!(responses.len(), 3);
    for id in [1, 2] {
        let r = responses.iter().find(|r| r["ID"] == id).unwrap();
        assert!(r.get("Err").is_none());
    }
    assert!(status.success());
}

#[test]
fn eof_without_close_still_persists_the_index() {
    let dir = tempfile::tempdir().unwrap();
    let body_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"hello");
    let input = format!(
        "{{\"ID\":1,\"Command\":\"put\",\"ActionID\":\"A\",\"OutputID\":\"O\",\"BodySize\":5}}\n\"{body_b64}\"\n"
    );
    let (_output, status) = run_session(dir.path(), &input);
    assert!(status.success());

    // A fresh process against the same cache dir still serves the hit
    // (spec §8: the close handler must have run on EOF to persist the
    // index, even without an explicit `close` request).
    let (output2, status2) = run_session(
        dir.path(),
        "{\"ID\":1,\"Command\":\"get\",\"ActionID\":\"A\"}\n{\"ID\":2,\"Command\":\"close\"}\n",
    );
    let responses = lines(&output2);
    let get = responses.iter().find(|r| r["ID"] == 1).unwrap();
    assert_eq!(get["OutputID"], "O");
    assert_eq!(get["Size"], 5);
    assert!(status2.success());
}

#[test]
fn malformed_body_size_is_a_per_request_error_not_a_crash() {
    let dir = tempfile::tempdir().unwrap();
    // Declares BodySize 5 but the base64 body decodes to 2 bytes.
    let body_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"hi");
    let input = format!(
        "{{\"ID\":1,\"Command\":\"put\",\"ActionID\":\"A\",\"OutputID\":\"O\",\"BodySize\":5}}\n\"{body_b64}\"\n\
         {{\"ID\":2,\"Command\":\"get\",\"ActionID\":\"A\"}}\n\
         {{\"ID\":3,\"Command\":\"close\"}}\n"
    );
    let (output, status) = run_session(dir.path(), &input);
    let responses = lines(&output);

    let put = responses.iter().find(|r| r["ID"] == 1).unwrap();
    assert!(put["Err"].is_string());

    // The stream stayed in sync: later requests still parse and execute.
    let get = responses.iter().find(|r| r["ID"] == 2).unwrap();
    assert_eq!(get["Miss"], true);

    assert!(status.success());
}
