use crate::fees::{self, FeeError, NewPayment, PaymentEdit};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

fn engine_err(id: &str, e: FeeError) -> serde_json::Value {
    err(id, &e.code, e.message, None)
}

fn handle_payments_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let pupil_id = match req.params.get("pupilId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing pupilId", None),
    };
    let academic_year_id = match req.params.get("academicYearId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing academicYearId", None),
    };
    let amount = match req.params.get("amount").and_then(|v| v.as_f64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing/invalid amount", None),
    };
    let term = match req.params.get("term").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing/invalid term", None),
    };
    let payment_method = match req.params.get("paymentMethod").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing paymentMethod", None),
    };

    let payment = NewPayment {
        pupil_id,
        academic_year_id,
        amount,
        term,
        payment_method,
        notes: req
            .params
            .get("notes")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        recorded_by: req
            .params
            .get("recordedBy")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    };

    match fees::record_payment(conn, &payment, Utc::now()) {
        Ok(record) => ok(
            &req.id,
            serde_json::to_value(&record).unwrap_or_else(|_| json!({})),
        ),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_payments_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let payment_id = match req.params.get("paymentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing paymentId", None),
    };
    let academic_year_id = match req.params.get("academicYearId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing academicYearId", None),
    };
    let amount = match req.params.get("amount").and_then(|v| v.as_f64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing/invalid amount", None),
    };
    let term = match req.params.get("term").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing/invalid term", None),
    };
    let payment_date = match req.params.get("paymentDate").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing paymentDate", None),
    };
    let payment_method = match req.params.get("paymentMethod").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing paymentMethod", None),
    };

    let edit = PaymentEdit {
        academic_year_id,
        amount,
        term,
        payment_date,
        payment_method,
        notes: req
            .params
            .get("notes")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    };

    match fees::update_payment(conn, &payment_id, &edit) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_payments_list_for_pupil(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let pupil_id = match req.params.get("pupilId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing pupilId", None),
    };

    let payments = match fees::payments_for_pupil(conn, &pupil_id) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };
    let total_paid: f64 = payments.iter().map(|p| p.amount).sum();

    ok(
        &req.id,
        json!({
            "payments": serde_json::to_value(&payments).unwrap_or_else(|_| json!([])),
            "totalPaid": total_paid,
        }),
    )
}

fn handle_payments_today(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let payments = match fees::todays_payments(conn, Utc::now().date_naive()) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };
    let total: f64 = payments.iter().map(|p| p.amount).sum();

    ok(
        &req.id,
        json!({
            "payments": serde_json::to_value(&payments).unwrap_or_else(|_| json!([])),
            "total": total,
        }),
    )
}

fn handle_methods_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO payment_methods(id, name) VALUES(?, ?)",
        (&id, &name),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "id": id, "name": name }))
}

fn handle_methods_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn
        .prepare("SELECT id, name FROM payment_methods WHERE is_active = 1 ORDER BY name")
    {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let methods = match stmt
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
    ok(&req.id, json!({ "methods": methods }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "payments.record" => Some(handle_payments_record(state, req)),
        "payments.update" => Some(handle_payments_update(state, req)),
        "payments.listForPupil" => Some(handle_payments_list_for_pupil(state, req)),
        "payments.today" => Some(handle_payments_today(state, req)),
        "paymentMethods.create" => Some(handle_methods_create(state, req)),
        "paymentMethods.list" => Some(handle_methods_list(state, req)),
        _ => None,
    }
}
