use crate::fees::{self, FeeError, FeeStatus, LedgerFilters, OutstandingFilters};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn engine_err(id: &str, e: FeeError) -> serde_json::Value {
    err(id, &e.code, e.message, None)
}

fn parse_term(req: &Request) -> Result<Option<i64>, serde_json::Value> {
    match req.params.get("term") {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => match v.as_i64() {
            Some(t) if (1..=3).contains(&t) => Ok(Some(t)),
            _ => Err(err(&req.id, "bad_params", "term must be 1, 2 or 3", None)),
        },
    }
}

fn handle_categories_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let description = req.params.get("description").and_then(|v| v.as_str());

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO fee_categories(id, name, description) VALUES(?, ?, ?)",
        (&id, &name, description),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "id": id, "name": name }))
}

fn handle_categories_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, description FROM fee_categories WHERE is_active = 1 ORDER BY name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let categories = match stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "description": r.get::<_, Option<String>>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "categories": categories }))
}

struct StructureAmounts {
    term1: f64,
    term2: f64,
    term3: f64,
}

fn parse_amounts(params: &serde_json::Value) -> Result<StructureAmounts, String> {
    let read = |key: &str| -> Result<f64, String> {
        match params.get(key) {
            None | Some(serde_json::Value::Null) => Ok(0.0),
            Some(v) => match v.as_f64() {
                Some(a) if a.is_finite() && a >= 0.0 => Ok(a),
                _ => Err(format!("{} must be a number >= 0", key)),
            },
        }
    };
    Ok(StructureAmounts {
        term1: read("term1Amount")?,
        term2: read("term2Amount")?,
        term3: read("term3Amount")?,
    })
}

/// Upsert keyed on (year, class, stream-or-class-wide, category). The
/// unique index on that tuple uses an expression, so the probe is a
/// SELECT rather than ON CONFLICT.
fn save_structure(
    conn: &Connection,
    academic_year_id: &str,
    class_id: &str,
    stream_id: Option<&str>,
    fee_category_id: &str,
    amounts: &StructureAmounts,
) -> Result<String, FeeError> {
    let annual = amounts.term1 + amounts.term2 + amounts.term3;
    let now = Utc::now().to_rfc3339();

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM fee_structures
             WHERE academic_year_id = ? AND class_id = ? AND fee_category_id = ?
               AND COALESCE(stream_id, '') = COALESCE(?, '')",
            (academic_year_id, class_id, fee_category_id, stream_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| FeeError::new("db_query_failed", e.to_string()))?;

    if let Some(id) = existing {
        conn.execute(
            "UPDATE fee_structures
             SET term1_amount = ?, term2_amount = ?, term3_amount = ?,
                 annual_amount = ?, is_active = 1, updated_at = ?
             WHERE id = ?",
            (amounts.term1, amounts.term2, amounts.term3, annual, &now, &id),
        )
        .map_err(|e| FeeError::new("db_insert_failed", e.to_string()))?;
        Ok(id)
    } else {
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO fee_structures(
                id, academic_year_id, class_id, stream_id, fee_category_id,
                term1_amount, term2_amount, term3_amount, annual_amount, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &id,
                academic_year_id,
                class_id,
                stream_id,
                fee_category_id,
                amounts.term1,
                amounts.term2,
                amounts.term3,
                annual,
                &now,
            ),
        )
        .map_err(|e| FeeError::new("db_insert_failed", e.to_string()))?;
        Ok(id)
    }
}

fn handle_structure_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let academic_year_id = match req.params.get("academicYearId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing academicYearId", None),
    };
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let fee_category_id = match req.params.get("feeCategoryId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing feeCategoryId", None),
    };
    let stream_id = req.params.get("streamId").and_then(|v| v.as_str());
    let amounts = match parse_amounts(&req.params) {
        Ok(a) => a,
        Err(message) => return err(&req.id, "bad_params", message, None),
    };

    match save_structure(
        conn,
        &academic_year_id,
        &class_id,
        stream_id,
        &fee_category_id,
        &amounts,
    ) {
        Ok(id) => ok(&req.id, json!({ "id": id })),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_structure_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let academic_year_id = match req.params.get("academicYearId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing academicYearId", None),
    };
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let stream_id = req.params.get("streamId").and_then(|v| v.as_str());
    let term = match parse_term(req) {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    let mut sql = String::from(
        "SELECT s.id, s.fee_category_id, c.name, s.stream_id,
                s.term1_amount, s.term2_amount, s.term3_amount, s.annual_amount
         FROM fee_structures s
         JOIN fee_categories c ON c.id = s.fee_category_id
         WHERE s.academic_year_id = ? AND s.class_id = ? AND s.is_active = 1",
    );
    if stream_id.is_some() {
        sql.push_str(" AND (s.stream_id IS NULL OR s.stream_id = ?)");
    } else {
        sql.push_str(" AND s.stream_id IS NULL");
    }
    // A term filter keeps only rows that actually charge in that term.
    match term {
        Some(1) => sql.push_str(" AND s.term1_amount > 0"),
        Some(2) => sql.push_str(" AND s.term2_amount > 0"),
        Some(3) => sql.push_str(" AND s.term3_amount > 0"),
        _ => {}
    }
    sql.push_str(" ORDER BY c.name");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let map_row = |r: &rusqlite::Row| -> rusqlite::Result<serde_json::Value> {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "feeCategoryId": r.get::<_, String>(1)?,
            "categoryName": r.get::<_, String>(2)?,
            "streamId": r.get::<_, Option<String>>(3)?,
            "term1Amount": r.get::<_, f64>(4)?,
            "term2Amount": r.get::<_, f64>(5)?,
            "term3Amount": r.get::<_, f64>(6)?,
            "annualAmount": r.get::<_, f64>(7)?,
        }))
    };
    let rows = if let Some(stream) = stream_id {
        stmt.query_map((&academic_year_id, &class_id, stream), map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    } else {
        stmt.query_map((&academic_year_id, &class_id), map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    };
    let structures = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let assigned_total =
        match fees::resolve_assigned_total(conn, &academic_year_id, &class_id, stream_id, term) {
            Ok(v) => v,
            Err(e) => return engine_err(&req.id, e),
        };

    ok(
        &req.id,
        json!({ "structures": structures, "assignedTotal": assigned_total }),
    )
}

fn handle_structure_bulk_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let academic_year_id = match req.params.get("academicYearId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing academicYearId", None),
    };
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let stream_id = req
        .params
        .get("streamId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let Some(entries) = req.params.get("entries").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing entries[]", None);
    };

    let mut updated: usize = 0;
    let mut errors: Vec<serde_json::Value> = Vec::new();

    for (i, entry) in entries.iter().enumerate() {
        let Some(obj) = entry.as_object() else {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": format!("entry at index {} must be an object", i),
            }));
            continue;
        };
        let Some(fee_category_id) = obj.get("feeCategoryId").and_then(|v| v.as_str()) else {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": format!("entry at index {} missing feeCategoryId", i),
            }));
            continue;
        };
        let amounts = match parse_amounts(entry) {
            Ok(a) => a,
            Err(message) => {
                errors.push(json!({
                    "index": i,
                    "code": "bad_params",
                    "message": message,
                }));
                continue;
            }
        };

        match save_structure(
            conn,
            &academic_year_id,
            &class_id,
            stream_id.as_deref(),
            fee_category_id,
            &amounts,
        ) {
            Ok(_) => updated += 1,
            Err(e) => errors.push(json!({
                "index": i,
                "code": e.code,
                "message": e.message,
            })),
        }
    }

    let rejected = errors.len();
    let mut result = json!({ "ok": true, "updated": updated });
    if rejected > 0 {
        result["rejected"] = json!(rejected);
        result["errors"] = json!(errors);
    }
    ok(&req.id, result)
}

fn handle_student_ledger(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let academic_year_id = match req.params.get("academicYearId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing academicYearId", None),
    };
    let term = match parse_term(req) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let status = match req.params.get("status").and_then(|v| v.as_str()) {
        None => None,
        Some(raw) => match FeeStatus::parse_filter(raw) {
            Some(s) => Some(s),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "status must be one of: fully_paid, partially_paid, outstanding",
                    Some(json!({ "status": raw })),
                )
            }
        },
    };

    let filters = LedgerFilters {
        academic_year_id,
        term,
        class_id: req
            .params
            .get("classId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        status,
        search: req
            .params
            .get("search")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    };

    let rows = match fees::student_ledger(conn, &filters) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };

    let fully_paid = rows.iter().filter(|r| r.status == "Fully Paid").count();
    let partially_paid = rows.iter().filter(|r| r.status == "Partially Paid").count();
    let outstanding = rows.iter().filter(|r| r.status == "Outstanding").count();

    ok(
        &req.id,
        json!({
            "rows": serde_json::to_value(&rows).unwrap_or_else(|_| json!([])),
            "summary": {
                "fullyPaid": fully_paid,
                "partiallyPaid": partially_paid,
                "outstanding": outstanding,
            }
        }),
    )
}

fn handle_outstanding(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let academic_year_id = match req.params.get("academicYearId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing academicYearId", None),
    };
    let term = match parse_term(req) {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    let filters = OutstandingFilters {
        academic_year_id,
        term,
        class_id: req
            .params
            .get("classId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        amount_range: req
            .params
            .get("amountRange")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        page: req.params.get("page").and_then(|v| v.as_i64()).unwrap_or(1),
        per_page: req
            .params
            .get("perPage")
            .and_then(|v| v.as_i64())
            .unwrap_or(50),
    };

    match fees::outstanding_page(conn, &filters) {
        Ok(page) => ok(
            &req.id,
            serde_json::to_value(&page).unwrap_or_else(|_| json!({})),
        ),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_dashboard(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let academic_year_id = match req.params.get("academicYearId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing academicYearId", None),
    };

    match fees::dashboard_stats(conn, &academic_year_id, Utc::now().date_naive()) {
        Ok(stats) => ok(
            &req.id,
            serde_json::to_value(&stats).unwrap_or_else(|_| json!({})),
        ),
        Err(e) => engine_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "feeCategories.create" => Some(handle_categories_create(state, req)),
        "feeCategories.list" => Some(handle_categories_list(state, req)),
        "feeStructure.save" => Some(handle_structure_save(state, req)),
        "feeStructure.get" => Some(handle_structure_get(state, req)),
        "feeStructure.bulkUpdate" => Some(handle_structure_bulk_update(state, req)),
        "fees.studentLedger" => Some(handle_student_ledger(state, req)),
        "fees.outstanding" => Some(handle_outstanding(state, req)),
        "fees.dashboard" => Some(handle_dashboard(state, req)),
        _ => None,
    }
}
