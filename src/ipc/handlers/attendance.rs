use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::{NaiveDate, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const STATUSES: [&str; 2] = ["present", "absent"];

fn parse_date(raw: &str) -> Option<String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(|d| d.format("%Y-%m-%d").to_string())
}

fn handle_attendance_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let pupil_id = match req.params.get("pupilId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing pupilId", None),
    };
    let status = match req.params.get("status").and_then(|v| v.as_str()) {
        Some(v) if STATUSES.contains(&v) => v.to_string(),
        Some(other) => {
            return err(
                &req.id,
                "bad_params",
                "status must be one of: present, absent",
                Some(json!({ "status": other })),
            )
        }
        None => return err(&req.id, "bad_params", "missing status", None),
    };
    let attendance_date = match req.params.get("attendanceDate").and_then(|v| v.as_str()) {
        None => Utc::now().date_naive().format("%Y-%m-%d").to_string(),
        Some(raw) => match parse_date(raw) {
            Some(d) => d,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "attendanceDate must be YYYY-MM-DD",
                    Some(json!({ "attendanceDate": raw })),
                )
            }
        },
    };
    let teacher_id = req.params.get("teacherId").and_then(|v| v.as_str());

    // Class, stream and year travel with the register row so the
    // listing survives later pupil transfers.
    let pupil: Option<(Option<String>, Option<String>, Option<String>)> = match conn
        .query_row(
            "SELECT class_id, stream_id, academic_year_id FROM pupils WHERE id = ?",
            [pupil_id.as_str()],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((class_id, stream_id, academic_year_id)) = pupil else {
        return err(&req.id, "not_found", "pupil not found", None);
    };

    let now = Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO attendance(
            id, pupil_id, class_id, stream_id, academic_year_id,
            attendance_date, status, teacher_id, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(pupil_id, attendance_date) DO UPDATE SET
            status = excluded.status,
            teacher_id = excluded.teacher_id,
            updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &pupil_id,
            &class_id,
            &stream_id,
            &academic_year_id,
            &attendance_date,
            &status,
            teacher_id,
            &now,
            &now,
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    let record_id: String = match conn.query_row(
        "SELECT id FROM attendance WHERE pupil_id = ? AND attendance_date = ?",
        (&pupil_id, &attendance_date),
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "id": record_id,
            "pupilId": pupil_id,
            "attendanceDate": attendance_date,
            "status": status,
        }),
    )
}

fn handle_attendance_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut sql = "SELECT a.id, a.pupil_id, p.first_name, p.last_name, p.admission_number,
                a.class_id, a.stream_id, a.attendance_date, a.status, a.teacher_id
         FROM attendance a
         JOIN pupils p ON p.id = a.pupil_id
         WHERE 1=1"
        .to_string();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(pupil_id) = req.params.get("pupilId").and_then(|v| v.as_str()) {
        sql.push_str(" AND a.pupil_id = ?");
        binds.push(Value::Text(pupil_id.to_string()));
    }
    if let Some(class_id) = req.params.get("classId").and_then(|v| v.as_str()) {
        sql.push_str(" AND a.class_id = ?");
        binds.push(Value::Text(class_id.to_string()));
    }
    if let Some(year_id) = req.params.get("academicYearId").and_then(|v| v.as_str()) {
        sql.push_str(" AND a.academic_year_id = ?");
        binds.push(Value::Text(year_id.to_string()));
    }
    for (key, clause) in [
        ("dateFrom", " AND a.attendance_date >= ?"),
        ("dateTo", " AND a.attendance_date <= ?"),
    ] {
        if let Some(raw) = req.params.get(key).and_then(|v| v.as_str()) {
            let Some(date) = parse_date(raw) else {
                return err(
                    &req.id,
                    "bad_params",
                    format!("{} must be YYYY-MM-DD", key),
                    Some(json!({ key: raw })),
                );
            };
            sql.push_str(clause);
            binds.push(Value::Text(date));
        }
    }
    sql.push_str(" ORDER BY a.attendance_date DESC, p.admission_number");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let records = match stmt
        .query_map(params_from_iter(binds), |r| {
            let first: String = r.get(2)?;
            let last: String = r.get(3)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "pupilId": r.get::<_, String>(1)?,
                "pupilName": format!("{} {}", first, last),
                "admissionNumber": r.get::<_, Option<String>>(4)?,
                "classId": r.get::<_, Option<String>>(5)?,
                "streamId": r.get::<_, Option<String>>(6)?,
                "attendanceDate": r.get::<_, String>(7)?,
                "status": r.get::<_, String>(8)?,
                "teacherId": r.get::<_, Option<String>>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let present = records
        .iter()
        .filter(|r| r.get("status").and_then(|v| v.as_str()) == Some("present"))
        .count();
    let total = records.len();
    let absent = total - present;
    let attendance_rate = if total > 0 {
        (present as f64 / total as f64 * 1000.0).round() / 10.0
    } else {
        0.0
    };

    ok(
        &req.id,
        json!({
            "records": records,
            "summary": {
                "present": present,
                "absent": absent,
                "total": total,
                "attendanceRate": attendance_rate,
            }
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.record" => Some(handle_attendance_record(state, req)),
        "attendance.list" => Some(handle_attendance_list(state, req)),
        _ => None,
    }
}
