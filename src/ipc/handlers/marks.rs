use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::ranking::{self, MarksInput, RankError, SubjectScores};
use chrono::Utc;
use serde_json::json;

fn engine_err(id: &str, e: RankError) -> serde_json::Value {
    err(id, &e.code, e.message, None)
}

fn parse_score(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<i64>, (String, serde_json::Value)> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => match v.as_i64() {
            Some(s) => Ok(Some(s)),
            None => Err((
                format!("{} must be an integer score", key),
                json!({ "value": v }),
            )),
        },
    }
}

fn parse_scores(req: &Request) -> Result<SubjectScores, serde_json::Value> {
    let mut read = |key: &str| -> Result<Option<i64>, serde_json::Value> {
        parse_score(&req.params, key)
            .map_err(|(message, details)| err(&req.id, "bad_params", message, Some(details)))
    };
    Ok(SubjectScores {
        english: read("english")?,
        mathematics: read("mathematics")?,
        science: read("science")?,
        social_studies: read("socialStudies")?,
    })
}

fn handle_marks_save(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let term = match req.params.get("term").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing/invalid term", None),
    };
    let exam_type = match req.params.get("examType").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing examType", None),
    };
    let scores = match parse_scores(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let input = MarksInput {
        pupil_id,
        academic_year_id,
        term,
        exam_type,
        scores,
    };
    match ranking::save_marks(conn, &input, Utc::now()) {
        Ok(sheet) => ok(
            &req.id,
            serde_json::to_value(&sheet).unwrap_or_else(|_| json!({})),
        ),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_marks_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
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
    let term = match req.params.get("term").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing/invalid term", None),
    };
    let exam_type = match req.params.get("examType").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing examType", None),
    };

    match ranking::get_marks(conn, &pupil_id, &academic_year_id, term, &exam_type) {
        Ok(Some(sheet)) => ok(
            &req.id,
            json!({ "sheet": serde_json::to_value(&sheet).unwrap_or_else(|_| json!({})) }),
        ),
        Ok(None) => ok(&req.id, json!({ "sheet": null })),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_marks_recalculate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let academic_year_id = match req.params.get("academicYearId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing academicYearId", None),
    };
    let term = match req.params.get("term").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing/invalid term", None),
    };
    let exam_type = match req.params.get("examType").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing examType", None),
    };

    match ranking::recompute_positions(conn, &academic_year_id, term, &exam_type) {
        Ok(updated) => ok(&req.id, json!({ "updated": updated })),
        Err(e) => engine_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.save" => Some(handle_marks_save(state, req)),
        "marks.get" => Some(handle_marks_get(state, req)),
        "marks.recalculatePositions" => Some(handle_marks_recalculate(state, req)),
        _ => None,
    }
}
