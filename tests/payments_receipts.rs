use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
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

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schooladmind");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schooladmind");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn setup_pupil(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> (String, String) {
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let year_id = request_ok(
        stdin,
        reader,
        "year",
        "years.create",
        json!({ "name": "2025/26" }),
    )
    .get("id")
    .and_then(|v| v.as_str())
    .expect("year id")
    .to_string();
    let class_id = request_ok(
        stdin,
        reader,
        "class",
        "classes.create",
        json!({ "name": "P6", "level": 6 }),
    )
    .get("id")
    .and_then(|v| v.as_str())
    .expect("class id")
    .to_string();
    let pupil_id = request_ok(
        stdin,
        reader,
        "pupil",
        "pupils.register",
        json!({
            "firstName": "Ama",
            "lastName": "Okello",
            "admissionNumber": "ADM-100",
            "classId": class_id,
            "academicYearId": year_id
        }),
    )
    .get("id")
    .and_then(|v| v.as_str())
    .expect("pupil id")
    .to_string();
    (year_id, pupil_id)
}

#[test]
fn receipts_are_sequential_and_well_formed() {
    let workspace = temp_dir("schooladmin-payments-receipts");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (year_id, pupil_id) = setup_pupil(&mut stdin, &mut reader, &workspace);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "pay1",
        "payments.record",
        json!({
            "pupilId": pupil_id,
            "academicYearId": year_id,
            "amount": 25000.0,
            "term": 1,
            "paymentMethod": "cash",
            "recordedBy": "bursar-1"
        }),
    );
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "pay2",
        "payments.record",
        json!({
            "pupilId": pupil_id,
            "academicYearId": year_id,
            "amount": 10000.0,
            "term": 2,
            "paymentMethod": "mobile money"
        }),
    );

    let receipt1 = first
        .get("receiptNumber")
        .and_then(|v| v.as_str())
        .expect("receipt 1");
    let receipt2 = second
        .get("receiptNumber")
        .and_then(|v| v.as_str())
        .expect("receipt 2");
    // RCP-YYYYMMDD-NNNN
    assert!(receipt1.starts_with("RCP-"), "bad receipt {}", receipt1);
    assert_eq!(receipt1.len(), "RCP-20260302-0001".len());
    assert!(receipt1.ends_with("-0001"));
    assert!(receipt2.ends_with("-0002"));
    assert_ne!(receipt1, receipt2);

    let txn1 = first
        .get("transactionReference")
        .and_then(|v| v.as_str())
        .expect("txn 1");
    let txn2 = second
        .get("transactionReference")
        .and_then(|v| v.as_str())
        .expect("txn 2");
    // TXN-YYYYMMDDHHMMSS-NNNN
    assert!(txn1.starts_with("TXN-"), "bad reference {}", txn1);
    assert_eq!(txn1.len(), "TXN-20260302143005-0001".len());
    assert_ne!(txn1, txn2);

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "payments.listForPupil",
        json!({ "pupilId": pupil_id }),
    );
    assert_eq!(
        listed.get("totalPaid").and_then(|v| v.as_f64()),
        Some(35000.0)
    );
    assert_eq!(
        listed
            .get("payments")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(2)
    );

    let today = request_ok(&mut stdin, &mut reader, "today", "payments.today", json!({}));
    assert_eq!(today.get("total").and_then(|v| v.as_f64()), Some(35000.0));
    let today_rows = today
        .get("payments")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("today rows");
    assert_eq!(today_rows.len(), 2);
    assert_eq!(
        today_rows[0].get("studentName").and_then(|v| v.as_str()),
        Some("Ama Okello")
    );
}

#[test]
fn payment_validation_and_correction() {
    let workspace = temp_dir("schooladmin-payments-validation");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (year_id, pupil_id) = setup_pupil(&mut stdin, &mut reader, &workspace);

    let zero = request(
        &mut stdin,
        &mut reader,
        "zero",
        "payments.record",
        json!({
            "pupilId": pupil_id,
            "academicYearId": year_id,
            "amount": 0.0,
            "term": 1,
            "paymentMethod": "cash"
        }),
    );
    assert_eq!(zero.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        zero.pointer("/error/code").and_then(|v| v.as_str()),
        Some("bad_params")
    );

    let ghost = request(
        &mut stdin,
        &mut reader,
        "ghost",
        "payments.record",
        json!({
            "pupilId": "no-such-pupil",
            "academicYearId": year_id,
            "amount": 5000.0,
            "term": 1,
            "paymentMethod": "cash"
        }),
    );
    assert_eq!(
        ghost.pointer("/error/code").and_then(|v| v.as_str()),
        Some("not_found")
    );

    let recorded = request_ok(
        &mut stdin,
        &mut reader,
        "pay",
        "payments.record",
        json!({
            "pupilId": pupil_id,
            "academicYearId": year_id,
            "amount": 5000.0,
            "term": 1,
            "paymentMethod": "cash"
        }),
    );
    let payment_id = recorded
        .get("id")
        .and_then(|v| v.as_str())
        .expect("payment id")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "edit",
        "payments.update",
        json!({
            "paymentId": payment_id,
            "academicYearId": year_id,
            "amount": 7500.0,
            "term": 1,
            "paymentDate": "2026-03-02",
            "paymentMethod": "bank",
            "notes": "corrected teller amount"
        }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "payments.listForPupil",
        json!({ "pupilId": pupil_id }),
    );
    assert_eq!(
        listed.get("totalPaid").and_then(|v| v.as_f64()),
        Some(7500.0)
    );

    let missing = request(
        &mut stdin,
        &mut reader,
        "missing",
        "payments.update",
        json!({
            "paymentId": "no-such-payment",
            "academicYearId": year_id,
            "amount": 1000.0,
            "term": 1,
            "paymentDate": "2026-03-02",
            "paymentMethod": "cash"
        }),
    );
    assert_eq!(
        missing.pointer("/error/code").and_then(|v| v.as_str()),
        Some("not_found")
    );
}
