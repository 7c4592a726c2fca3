use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde_json::json;
use uuid::Uuid;

fn handle_years_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let start_year = req.params.get("startYear").and_then(|v| v.as_i64());
    let end_year = req.params.get("endYear").and_then(|v| v.as_i64());

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO academic_years(id, name, start_year, end_year, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (&id, &name, start_year, end_year, Utc::now().to_rfc3339()),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "id": id, "name": name }))
}

fn handle_years_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, start_year, end_year, is_active
         FROM academic_years ORDER BY name DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let years = match stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "startYear": r.get::<_, Option<i64>>(2)?,
                "endYear": r.get::<_, Option<i64>>(3)?,
                "isActive": r.get::<_, i64>(4)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "years": years }))
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let level = req.params.get("level").and_then(|v| v.as_i64());

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name, level) VALUES(?, ?, ?)",
        (&id, &name, level),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "id": id, "name": name }))
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare("SELECT id, name, level FROM classes ORDER BY level, name") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let classes = match stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "level": r.get::<_, Option<i64>>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "classes": classes }))
}

fn handle_streams_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute("INSERT INTO streams(id, name) VALUES(?, ?)", (&id, &name)) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "id": id, "name": name }))
}

fn handle_streams_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare("SELECT id, name FROM streams ORDER BY name") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let streams = match stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "streams": streams }))
}

fn handle_pupils_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let first_name = match req.params.get("firstName").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing firstName", None),
    };
    let last_name = match req.params.get("lastName").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing lastName", None),
    };
    let gender = req.params.get("gender").and_then(|v| v.as_str());
    let admission_number = req.params.get("admissionNumber").and_then(|v| v.as_str());
    let class_id = req.params.get("classId").and_then(|v| v.as_str());
    let stream_id = req.params.get("streamId").and_then(|v| v.as_str());
    let academic_year_id = req.params.get("academicYearId").and_then(|v| v.as_str());

    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO pupils(id, first_name, last_name, gender, admission_number,
                            class_id, stream_id, academic_year_id, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &first_name,
            &last_name,
            gender,
            admission_number,
            class_id,
            stream_id,
            academic_year_id,
            &now,
            &now,
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({
            "id": id,
            "firstName": first_name,
            "lastName": last_name,
            "admissionNumber": admission_number,
        }),
    )
}

fn pupil_rows(
    conn: &Connection,
    sql: &str,
    binds: Vec<Value>,
) -> Result<Vec<serde_json::Value>, rusqlite::Error> {
    let mut stmt = conn.prepare(sql)?;
    stmt.query_map(params_from_iter(binds), |r| {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "firstName": r.get::<_, String>(1)?,
            "lastName": r.get::<_, String>(2)?,
            "gender": r.get::<_, Option<String>>(3)?,
            "admissionNumber": r.get::<_, Option<String>>(4)?,
            "classId": r.get::<_, Option<String>>(5)?,
            "streamId": r.get::<_, Option<String>>(6)?,
            "academicYearId": r.get::<_, Option<String>>(7)?,
            "enrollmentStatus": r.get::<_, String>(8)?,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
}

const PUPIL_COLUMNS: &str = "id, first_name, last_name, gender, admission_number,
    class_id, stream_id, academic_year_id, enrollment_status";

fn handle_pupils_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut sql = format!("SELECT {} FROM pupils WHERE 1=1", PUPIL_COLUMNS);
    let mut binds: Vec<Value> = Vec::new();
    if let Some(class_id) = req.params.get("classId").and_then(|v| v.as_str()) {
        sql.push_str(" AND class_id = ?");
        binds.push(Value::Text(class_id.to_string()));
    }
    if let Some(year_id) = req.params.get("academicYearId").and_then(|v| v.as_str()) {
        sql.push_str(" AND academic_year_id = ?");
        binds.push(Value::Text(year_id.to_string()));
    }
    let status = req
        .params
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or("active");
    if status != "all" {
        sql.push_str(" AND enrollment_status = ?");
        binds.push(Value::Text(status.to_string()));
    }
    sql.push_str(" ORDER BY admission_number");

    match pupil_rows(conn, &sql, binds) {
        Ok(pupils) => ok(&req.id, json!({ "pupils": pupils })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_pupils_search(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let query = match req.params.get("query").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing query", None),
    };

    let mut sql = format!(
        "SELECT {} FROM pupils
         WHERE enrollment_status = 'active'
           AND (first_name LIKE ? OR last_name LIKE ? OR admission_number LIKE ?)",
        PUPIL_COLUMNS
    );
    let pattern = format!("%{}%", query);
    let mut binds: Vec<Value> = vec![
        Value::Text(pattern.clone()),
        Value::Text(pattern.clone()),
        Value::Text(pattern),
    ];
    if let Some(year_id) = req.params.get("academicYearId").and_then(|v| v.as_str()) {
        sql.push_str(" AND academic_year_id = ?");
        binds.push(Value::Text(year_id.to_string()));
    }
    sql.push_str(" ORDER BY admission_number LIMIT 50");

    match pupil_rows(conn, &sql, binds) {
        Ok(pupils) => ok(&req.id, json!({ "pupils": pupils })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_assignments_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let teacher_id = match req.params.get("teacherId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing teacherId", None),
    };
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let stream_id = match req.params.get("streamId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing streamId", None),
    };

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO teacher_assignments(id, teacher_id, class_id, stream_id, assigned_date)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(teacher_id, class_id, stream_id) DO UPDATE SET
            is_active = 1,
            assigned_date = excluded.assigned_date",
        (
            &id,
            &teacher_id,
            &class_id,
            &stream_id,
            Utc::now().to_rfc3339(),
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_assignments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let teacher_id = match req.params.get("teacherId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing teacherId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT a.id, a.class_id, c.name, a.stream_id, s.name
         FROM teacher_assignments a
         JOIN classes c ON c.id = a.class_id
         JOIN streams s ON s.id = a.stream_id
         WHERE a.teacher_id = ? AND a.is_active = 1
         ORDER BY c.level, c.name, s.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let assignments = match stmt
        .query_map([teacher_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "classId": r.get::<_, String>(1)?,
                "className": r.get::<_, String>(2)?,
                "streamId": r.get::<_, String>(3)?,
                "streamName": r.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "assignments": assignments }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "years.create" => Some(handle_years_create(state, req)),
        "years.list" => Some(handle_years_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.list" => Some(handle_classes_list(state, req)),
        "streams.create" => Some(handle_streams_create(state, req)),
        "streams.list" => Some(handle_streams_list(state, req)),
        "pupils.register" => Some(handle_pupils_register(state, req)),
        "pupils.list" => Some(handle_pupils_list(state, req)),
        "pupils.search" => Some(handle_pupils_search(state, req)),
        "assignments.set" => Some(handle_assignments_set(state, req)),
        "assignments.list" => Some(handle_assignments_list(state, req)),
        _ => None,
    }
}
