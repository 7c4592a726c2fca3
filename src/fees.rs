use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct FeeError {
    pub code: String,
    pub message: String,
}

impl FeeError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    fn db(e: impl std::fmt::Display) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

pub type FeeResult<T> = Result<T, FeeError>;

/// Fee status partitions all (assigned >= 0, paid >= 0) pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeStatus {
    FullyPaid,
    PartiallyPaid,
    Outstanding,
}

impl FeeStatus {
    pub fn classify(assigned: f64, paid: f64) -> FeeStatus {
        if outstanding(assigned, paid) == 0.0 {
            FeeStatus::FullyPaid
        } else if paid > 0.0 {
            FeeStatus::PartiallyPaid
        } else {
            FeeStatus::Outstanding
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FeeStatus::FullyPaid => "Fully Paid",
            FeeStatus::PartiallyPaid => "Partially Paid",
            FeeStatus::Outstanding => "Outstanding",
        }
    }

    pub fn parse_filter(raw: &str) -> Option<FeeStatus> {
        match raw {
            "fully_paid" => Some(FeeStatus::FullyPaid),
            "partially_paid" => Some(FeeStatus::PartiallyPaid),
            "outstanding" => Some(FeeStatus::Outstanding),
            _ => None,
        }
    }
}

/// Assigned minus paid, floored at zero. A class with no configured
/// structure therefore reads as fully paid; the two cases are not
/// distinguishable at this layer.
pub fn outstanding(assigned: f64, paid: f64) -> f64 {
    (assigned - paid).max(0.0)
}

fn term_expr(term: Option<i64>) -> &'static str {
    match term {
        Some(1) => "term1_amount",
        Some(2) => "term2_amount",
        Some(3) => "term3_amount",
        _ => "term1_amount + term2_amount + term3_amount",
    }
}

/// Sum of configured fee amounts for (year, class), optionally restricted
/// to one term. Class-wide rows (NULL stream) always count; stream-specific
/// rows count only when that stream is named. Missing year/class yields 0.
pub fn resolve_assigned_total(
    conn: &Connection,
    academic_year_id: &str,
    class_id: &str,
    stream_id: Option<&str>,
    term: Option<i64>,
) -> FeeResult<f64> {
    let sql = if stream_id.is_some() {
        format!(
            "SELECT COALESCE(SUM({}), 0)
             FROM fee_structures
             WHERE academic_year_id = ? AND class_id = ? AND is_active = 1
               AND (stream_id IS NULL OR stream_id = ?)",
            term_expr(term)
        )
    } else {
        format!(
            "SELECT COALESCE(SUM({}), 0)
             FROM fee_structures
             WHERE academic_year_id = ? AND class_id = ? AND is_active = 1
               AND stream_id IS NULL",
            term_expr(term)
        )
    };

    let total: f64 = if let Some(stream) = stream_id {
        conn.query_row(&sql, (academic_year_id, class_id, stream), |r| r.get(0))
    } else {
        conn.query_row(&sql, (academic_year_id, class_id), |r| r.get(0))
    }
    .map_err(FeeError::db)?;

    Ok(total.max(0.0))
}

/// Per-class assigned totals for one year, over class-wide rows. Used by
/// the listing paths so a page of pupils costs one structure scan.
pub fn assigned_totals_by_class(
    conn: &Connection,
    academic_year_id: &str,
    term: Option<i64>,
) -> FeeResult<HashMap<String, f64>> {
    let sql = format!(
        "SELECT class_id, COALESCE(SUM({}), 0)
         FROM fee_structures
         WHERE academic_year_id = ? AND is_active = 1 AND stream_id IS NULL
         GROUP BY class_id",
        term_expr(term)
    );
    let mut stmt = conn.prepare(&sql).map_err(FeeError::db)?;
    let rows = stmt
        .query_map([academic_year_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(FeeError::db)?;
    Ok(rows.into_iter().collect())
}

/// Total recorded payments for one pupil, optionally scoped.
pub fn total_paid(
    conn: &Connection,
    pupil_id: &str,
    academic_year_id: Option<&str>,
    term: Option<i64>,
) -> FeeResult<f64> {
    let mut sql = "SELECT COALESCE(SUM(amount), 0) FROM payments WHERE pupil_id = ?".to_string();
    let mut binds: Vec<Value> = vec![Value::Text(pupil_id.to_string())];
    if let Some(year) = academic_year_id {
        sql.push_str(" AND academic_year_id = ?");
        binds.push(Value::Text(year.to_string()));
    }
    if let Some(t) = term {
        sql.push_str(" AND term = ?");
        binds.push(Value::Integer(t));
    }
    conn.query_row(&sql, params_from_iter(binds), |r| r.get(0))
        .map_err(FeeError::db)
}

/// One grouped sum across a whole batch of pupils. Pupils with no payments
/// are simply absent from the map.
pub fn paid_totals(
    conn: &Connection,
    pupil_ids: &[String],
    academic_year_id: Option<&str>,
    term: Option<i64>,
) -> FeeResult<HashMap<String, f64>> {
    if pupil_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let placeholders = std::iter::repeat("?")
        .take(pupil_ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let mut sql = format!(
        "SELECT pupil_id, COALESCE(SUM(amount), 0)
         FROM payments
         WHERE pupil_id IN ({})",
        placeholders
    );
    let mut binds: Vec<Value> = pupil_ids
        .iter()
        .map(|id| Value::Text(id.clone()))
        .collect();
    if let Some(year) = academic_year_id {
        sql.push_str(" AND academic_year_id = ?");
        binds.push(Value::Text(year.to_string()));
    }
    if let Some(t) = term {
        sql.push_str(" AND term = ?");
        binds.push(Value::Integer(t));
    }
    sql.push_str(" GROUP BY pupil_id");

    let mut stmt = conn.prepare(&sql).map_err(FeeError::db)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(FeeError::db)?;
    Ok(rows.into_iter().collect())
}

#[derive(Debug, Clone, Default)]
pub struct LedgerFilters {
    pub academic_year_id: String,
    pub term: Option<i64>,
    pub class_id: Option<String>,
    pub status: Option<FeeStatus>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerRow {
    pub pupil_id: String,
    pub first_name: String,
    pub last_name: String,
    pub admission_number: Option<String>,
    pub class_name: String,
    pub stream_name: String,
    pub assigned: f64,
    pub paid: f64,
    pub outstanding: f64,
    pub status: &'static str,
}

struct LedgerPupil {
    id: String,
    first_name: String,
    last_name: String,
    admission_number: Option<String>,
    class_id: Option<String>,
    stream_id: Option<String>,
}

fn name_map(conn: &Connection, table: &str) -> FeeResult<HashMap<String, String>> {
    let sql = format!("SELECT id, name FROM {}", table);
    let mut stmt = conn.prepare(&sql).map_err(FeeError::db)?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(FeeError::db)?;
    Ok(rows.into_iter().collect())
}

/// Per-pupil fee position for listing pages: assigned, paid, outstanding,
/// status. Active pupils only; one structure scan plus one grouped payment
/// sum regardless of page size.
pub fn student_ledger(conn: &Connection, filters: &LedgerFilters) -> FeeResult<Vec<LedgerRow>> {
    let class_names = name_map(conn, "classes")?;
    let stream_names = name_map(conn, "streams")?;

    let mut sql = "SELECT id, first_name, last_name, admission_number, class_id, stream_id
         FROM pupils
         WHERE enrollment_status = 'active' AND academic_year_id = ?"
        .to_string();
    let mut binds: Vec<Value> = vec![Value::Text(filters.academic_year_id.clone())];
    if let Some(class_id) = &filters.class_id {
        sql.push_str(" AND class_id = ?");
        binds.push(Value::Text(class_id.clone()));
    }
    if let Some(search) = &filters.search {
        sql.push_str(
            " AND (first_name LIKE ? OR last_name LIKE ? OR admission_number LIKE ?)",
        );
        let pattern = format!("%{}%", search);
        binds.push(Value::Text(pattern.clone()));
        binds.push(Value::Text(pattern.clone()));
        binds.push(Value::Text(pattern));
    }
    sql.push_str(" ORDER BY admission_number");

    let mut stmt = conn.prepare(&sql).map_err(FeeError::db)?;
    let pupils: Vec<LedgerPupil> = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(LedgerPupil {
                id: r.get(0)?,
                first_name: r.get(1)?,
                last_name: r.get(2)?,
                admission_number: r.get(3)?,
                class_id: r.get(4)?,
                stream_id: r.get(5)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(FeeError::db)?;

    let assigned_by_class =
        assigned_totals_by_class(conn, &filters.academic_year_id, filters.term)?;
    let pupil_ids: Vec<String> = pupils.iter().map(|p| p.id.clone()).collect();
    let paid_by_pupil = paid_totals(
        conn,
        &pupil_ids,
        Some(filters.academic_year_id.as_str()),
        filters.term,
    )?;

    let mut rows = Vec::with_capacity(pupils.len());
    for p in pupils {
        let assigned = p
            .class_id
            .as_deref()
            .and_then(|c| assigned_by_class.get(c))
            .copied()
            .unwrap_or(0.0);
        let paid = paid_by_pupil.get(&p.id).copied().unwrap_or(0.0);
        let status = FeeStatus::classify(assigned, paid);
        if let Some(wanted) = filters.status {
            if status != wanted {
                continue;
            }
        }
        rows.push(LedgerRow {
            class_name: p
                .class_id
                .as_deref()
                .and_then(|c| class_names.get(c).cloned())
                .unwrap_or_else(|| "N/A".to_string()),
            stream_name: p
                .stream_id
                .as_deref()
                .and_then(|s| stream_names.get(s).cloned())
                .unwrap_or_else(|| "N/A".to_string()),
            pupil_id: p.id,
            first_name: p.first_name,
            last_name: p.last_name,
            admission_number: p.admission_number,
            assigned,
            paid,
            outstanding: outstanding(assigned, paid),
            status: status.label(),
        });
    }
    Ok(rows)
}

#[derive(Debug, Clone, Default)]
pub struct OutstandingFilters {
    pub academic_year_id: String,
    pub term: Option<i64>,
    pub class_id: Option<String>,
    pub amount_range: Option<String>,
    pub page: i64,
    pub per_page: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutstandingRow {
    pub pupil_id: String,
    pub first_name: String,
    pub last_name: String,
    pub admission_number: Option<String>,
    pub class_name: String,
    pub outstanding: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutstandingPage {
    pub rows: Vec<OutstandingRow>,
    pub page: i64,
    pub per_page: i64,
    pub total_count: i64,
    pub total_pages: i64,
}

fn amount_range_matches(range: &str, amount: f64) -> bool {
    match range {
        "0-50000" => amount > 0.0 && amount < 50_000.0,
        "50000-100000" => (50_000.0..100_000.0).contains(&amount),
        "100000-200000" => (100_000.0..200_000.0).contains(&amount),
        "200000+" => amount >= 200_000.0,
        _ => true,
    }
}

/// Paginated listing of pupils with money still owed. Pagination runs over
/// pupils whose class has a configured structure; zero-outstanding rows and
/// rows outside the amount bucket are dropped from the page after the
/// grouped payment sum.
pub fn outstanding_page(
    conn: &Connection,
    filters: &OutstandingFilters,
) -> FeeResult<OutstandingPage> {
    let page = filters.page.max(1);
    let per_page = if filters.per_page > 0 {
        filters.per_page
    } else {
        50
    };

    let class_names = name_map(conn, "classes")?;
    let assigned_by_class =
        assigned_totals_by_class(conn, &filters.academic_year_id, filters.term)?;

    let classes_with_fees: Vec<String> = assigned_by_class.keys().cloned().collect();
    if classes_with_fees.is_empty() {
        return Ok(OutstandingPage {
            rows: Vec::new(),
            page,
            per_page,
            total_count: 0,
            total_pages: 1,
        });
    }

    let placeholders = std::iter::repeat("?")
        .take(classes_with_fees.len())
        .collect::<Vec<_>>()
        .join(",");
    let mut where_clause = format!(
        "enrollment_status = 'active' AND academic_year_id = ? AND class_id IN ({})",
        placeholders
    );
    let mut binds: Vec<Value> = vec![Value::Text(filters.academic_year_id.clone())];
    for c in &classes_with_fees {
        binds.push(Value::Text(c.clone()));
    }
    if let Some(class_id) = &filters.class_id {
        where_clause.push_str(" AND class_id = ?");
        binds.push(Value::Text(class_id.clone()));
    }

    let count_sql = format!("SELECT COUNT(*) FROM pupils WHERE {}", where_clause);
    let total_count: i64 = conn
        .query_row(&count_sql, params_from_iter(binds.clone()), |r| r.get(0))
        .map_err(FeeError::db)?;
    let total_pages = ((total_count + per_page - 1) / per_page).max(1);

    let page_sql = format!(
        "SELECT id, first_name, last_name, admission_number, class_id
         FROM pupils WHERE {}
         ORDER BY admission_number LIMIT ? OFFSET ?",
        where_clause
    );
    binds.push(Value::Integer(per_page));
    binds.push(Value::Integer((page - 1) * per_page));

    let mut stmt = conn.prepare(&page_sql).map_err(FeeError::db)?;
    let pupils: Vec<(String, String, String, Option<String>, Option<String>)> = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(FeeError::db)?;

    let pupil_ids: Vec<String> = pupils.iter().map(|p| p.0.clone()).collect();
    let paid_by_pupil = paid_totals(
        conn,
        &pupil_ids,
        Some(filters.academic_year_id.as_str()),
        filters.term,
    )?;

    let mut rows = Vec::new();
    for (id, first_name, last_name, admission_number, class_id) in pupils {
        let assigned = class_id
            .as_deref()
            .and_then(|c| assigned_by_class.get(c))
            .copied()
            .unwrap_or(0.0);
        let paid = paid_by_pupil.get(&id).copied().unwrap_or(0.0);
        let owed = outstanding(assigned, paid);
        if owed <= 0.0 {
            continue;
        }
        if let Some(range) = &filters.amount_range {
            if !amount_range_matches(range, owed) {
                continue;
            }
        }
        rows.push(OutstandingRow {
            class_name: class_id
                .as_deref()
                .and_then(|c| class_names.get(c).cloned())
                .unwrap_or_else(|| "Unknown".to_string()),
            pupil_id: id,
            first_name,
            last_name,
            admission_number,
            outstanding: owed,
        });
    }

    Ok(OutstandingPage {
        rows,
        page,
        per_page,
        total_count,
        total_pages,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total_students: i64,
    pub todays_payment_count: i64,
    pub todays_total: f64,
    pub outstanding_count: i64,
}

pub fn dashboard_stats(
    conn: &Connection,
    academic_year_id: &str,
    today: NaiveDate,
) -> FeeResult<DashboardStats> {
    let total_students: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM pupils
             WHERE academic_year_id = ? AND enrollment_status = 'active'",
            [academic_year_id],
            |r| r.get(0),
        )
        .map_err(FeeError::db)?;

    let (todays_payment_count, todays_total): (i64, f64) = conn
        .query_row(
            "SELECT COUNT(*), COALESCE(SUM(amount), 0) FROM payments WHERE payment_date = ?",
            [today.format("%Y-%m-%d").to_string()],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(FeeError::db)?;

    let ledger = student_ledger(
        conn,
        &LedgerFilters {
            academic_year_id: academic_year_id.to_string(),
            ..Default::default()
        },
    )?;
    let outstanding_count = ledger.iter().filter(|r| r.outstanding > 0.0).count() as i64;

    Ok(DashboardStats {
        total_students,
        todays_payment_count,
        todays_total,
        outstanding_count,
    })
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub pupil_id: String,
    pub academic_year_id: String,
    pub amount: f64,
    pub term: i64,
    pub payment_method: String,
    pub notes: Option<String>,
    pub recorded_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub id: String,
    pub pupil_id: String,
    pub academic_year_id: String,
    pub amount: f64,
    pub term: i64,
    pub payment_date: String,
    pub payment_method: String,
    pub receipt_number: String,
    pub transaction_reference: String,
    pub notes: Option<String>,
    pub recorded_by: Option<String>,
    pub recorded_at: String,
}

/// Draws the next value of a named sequence. Runs inside the caller's
/// transaction so the bump and the row insert commit together.
fn next_sequence(conn: &Connection, scope: &str) -> FeeResult<i64> {
    conn.execute(
        "INSERT INTO receipt_counters(scope, next_seq) VALUES(?, 1)
         ON CONFLICT(scope) DO UPDATE SET next_seq = next_seq + 1",
        [scope],
    )
    .map_err(FeeError::db)?;
    conn.query_row(
        "SELECT next_seq FROM receipt_counters WHERE scope = ?",
        [scope],
        |r| r.get(0),
    )
    .map_err(FeeError::db)
}

/// Records a payment with generated receipt and transaction references.
/// The sequence bump and insert share one transaction; the UNIQUE columns
/// make a duplicate reference a hard failure rather than a silent clash.
pub fn record_payment(
    conn: &mut Connection,
    payment: &NewPayment,
    now: DateTime<Utc>,
) -> FeeResult<PaymentRecord> {
    if !payment.amount.is_finite() || payment.amount <= 0.0 {
        return Err(FeeError::new("bad_params", "amount must be > 0"));
    }
    if !(1..=3).contains(&payment.term) {
        return Err(FeeError::new("bad_params", "term must be 1, 2 or 3"));
    }

    let pupil_exists: Option<String> = conn
        .query_row(
            "SELECT id FROM pupils WHERE id = ?",
            [payment.pupil_id.as_str()],
            |r| r.get(0),
        )
        .optional()
        .map_err(FeeError::db)?;
    if pupil_exists.is_none() {
        return Err(FeeError::new("not_found", "pupil not found"));
    }

    let tx = conn.transaction().map_err(FeeError::db)?;

    let day = now.format("%Y%m%d").to_string();
    let seq = next_sequence(&tx, &format!("payments-{}", day))?;
    let receipt_number = format!("RCP-{}-{:04}", day, seq);
    let transaction_reference = format!("TXN-{}-{:04}", now.format("%Y%m%d%H%M%S"), seq);

    let record = PaymentRecord {
        id: Uuid::new_v4().to_string(),
        pupil_id: payment.pupil_id.clone(),
        academic_year_id: payment.academic_year_id.clone(),
        amount: payment.amount,
        term: payment.term,
        payment_date: now.date_naive().format("%Y-%m-%d").to_string(),
        payment_method: payment.payment_method.clone(),
        receipt_number,
        transaction_reference,
        notes: payment.notes.clone(),
        recorded_by: payment.recorded_by.clone(),
        recorded_at: now.to_rfc3339(),
    };

    tx.execute(
        "INSERT INTO payments(
            id, pupil_id, academic_year_id, amount, term, payment_date,
            payment_method, receipt_number, transaction_reference, notes,
            recorded_by, recorded_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &record.id,
            &record.pupil_id,
            &record.academic_year_id,
            record.amount,
            record.term,
            &record.payment_date,
            &record.payment_method,
            &record.receipt_number,
            &record.transaction_reference,
            &record.notes,
            &record.recorded_by,
            &record.recorded_at,
        ),
    )
    .map_err(|e| FeeError::new("db_insert_failed", e.to_string()))?;

    tx.commit().map_err(FeeError::db)?;
    Ok(record)
}

#[derive(Debug, Clone)]
pub struct PaymentEdit {
    pub academic_year_id: String,
    pub amount: f64,
    pub term: i64,
    pub payment_date: String,
    pub payment_method: String,
    pub notes: Option<String>,
}

/// Explicit correction of a settled payment.
pub fn update_payment(conn: &Connection, payment_id: &str, edit: &PaymentEdit) -> FeeResult<()> {
    if !edit.amount.is_finite() || edit.amount <= 0.0 {
        return Err(FeeError::new("bad_params", "amount must be > 0"));
    }
    if !(1..=3).contains(&edit.term) {
        return Err(FeeError::new("bad_params", "term must be 1, 2 or 3"));
    }

    let updated = conn
        .execute(
            "UPDATE payments
             SET academic_year_id = ?, amount = ?, term = ?, payment_date = ?,
                 payment_method = ?, notes = ?
             WHERE id = ?",
            (
                &edit.academic_year_id,
                edit.amount,
                edit.term,
                &edit.payment_date,
                &edit.payment_method,
                &edit.notes,
                payment_id,
            ),
        )
        .map_err(FeeError::db)?;
    if updated == 0 {
        return Err(FeeError::new("not_found", "payment not found"));
    }
    Ok(())
}

pub fn payments_for_pupil(conn: &Connection, pupil_id: &str) -> FeeResult<Vec<PaymentRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, pupil_id, academic_year_id, amount, term, payment_date,
                    payment_method, receipt_number, transaction_reference, notes,
                    recorded_by, recorded_at
             FROM payments
             WHERE pupil_id = ?
             ORDER BY payment_date DESC, recorded_at DESC",
        )
        .map_err(FeeError::db)?;
    stmt.query_map([pupil_id], |r| {
        Ok(PaymentRecord {
            id: r.get(0)?,
            pupil_id: r.get(1)?,
            academic_year_id: r.get(2)?,
            amount: r.get(3)?,
            term: r.get(4)?,
            payment_date: r.get(5)?,
            payment_method: r.get(6)?,
            receipt_number: r.get(7)?,
            transaction_reference: r.get(8)?,
            notes: r.get(9)?,
            recorded_by: r.get(10)?,
            recorded_at: r.get(11)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(FeeError::db)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TodayPayment {
    pub receipt_number: String,
    pub student_name: String,
    pub amount: f64,
    pub payment_method: String,
    pub recorded_at: String,
}

pub fn todays_payments(conn: &Connection, today: NaiveDate) -> FeeResult<Vec<TodayPayment>> {
    let mut stmt = conn
        .prepare(
            "SELECT p.receipt_number, u.first_name, u.last_name, p.amount,
                    p.payment_method, p.recorded_at
             FROM payments p
             JOIN pupils u ON u.id = p.pupil_id
             WHERE p.payment_date = ?
             ORDER BY p.recorded_at DESC",
        )
        .map_err(FeeError::db)?;
    stmt.query_map([today.format("%Y-%m-%d").to_string()], |r| {
        let first: String = r.get(1)?;
        let last: String = r.get(2)?;
        Ok(TodayPayment {
            receipt_number: r.get(0)?,
            student_name: format!("{} {}", first, last),
            amount: r.get(3)?,
            payment_method: r.get(4)?,
            recorded_at: r.get(5)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(FeeError::db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rusqlite::Connection;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        crate::db::init_schema(&conn).expect("init schema");
        conn
    }

    fn seed_year(conn: &Connection, id: &str, name: &str) {
        conn.execute(
            "INSERT INTO academic_years(id, name) VALUES(?, ?)",
            (id, name),
        )
        .expect("insert year");
    }

    fn seed_class(conn: &Connection, id: &str, name: &str) {
        conn.execute("INSERT INTO classes(id, name) VALUES(?, ?)", (id, name))
            .expect("insert class");
    }

    fn seed_stream(conn: &Connection, id: &str, name: &str) {
        conn.execute("INSERT INTO streams(id, name) VALUES(?, ?)", (id, name))
            .expect("insert stream");
    }

    fn seed_category(conn: &Connection, id: &str, name: &str) {
        conn.execute(
            "INSERT INTO fee_categories(id, name) VALUES(?, ?)",
            (id, name),
        )
        .expect("insert category");
    }

    fn seed_structure(
        conn: &Connection,
        id: &str,
        year: &str,
        class: &str,
        stream: Option<&str>,
        category: &str,
        t1: f64,
        t2: f64,
        t3: f64,
    ) {
        conn.execute(
            "INSERT INTO fee_structures(
                id, academic_year_id, class_id, stream_id, fee_category_id,
                term1_amount, term2_amount, term3_amount, annual_amount)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (id, year, class, stream, category, t1, t2, t3, t1 + t2 + t3),
        )
        .expect("insert structure");
    }

    fn seed_pupil(conn: &Connection, id: &str, adm: &str, class: &str, year: &str) {
        conn.execute(
            "INSERT INTO pupils(id, first_name, last_name, admission_number,
                                class_id, academic_year_id)
             VALUES(?, ?, ?, ?, ?, ?)",
            (id, "Test", "Pupil", adm, class, year),
        )
        .expect("insert pupil");
    }

    #[test]
    fn classification_partitions_all_pairs() {
        assert_eq!(FeeStatus::classify(0.0, 0.0), FeeStatus::FullyPaid);
        assert_eq!(FeeStatus::classify(100.0, 100.0), FeeStatus::FullyPaid);
        assert_eq!(FeeStatus::classify(100.0, 150.0), FeeStatus::FullyPaid);
        assert_eq!(FeeStatus::classify(100.0, 40.0), FeeStatus::PartiallyPaid);
        assert_eq!(FeeStatus::classify(100.0, 0.0), FeeStatus::Outstanding);
    }

    #[test]
    fn partially_paid_example_from_ledger() {
        assert_eq!(outstanding(100_000.0, 40_000.0), 60_000.0);
        assert_eq!(
            FeeStatus::classify(100_000.0, 40_000.0).label(),
            "Partially Paid"
        );
    }

    #[test]
    fn unconfigured_class_reads_fully_paid() {
        // No structure at all, payments of 5000: outstanding floors at zero.
        assert_eq!(outstanding(0.0, 5_000.0), 0.0);
        assert_eq!(FeeStatus::classify(0.0, 5_000.0), FeeStatus::FullyPaid);
    }

    #[test]
    fn resolver_sums_single_row_exactly() {
        let conn = test_conn();
        seed_year(&conn, "y1", "2025/26");
        seed_class(&conn, "c1", "P1");
        seed_category(&conn, "fc1", "Tuition");
        seed_structure(&conn, "fs1", "y1", "c1", None, "fc1", 100.0, 200.0, 300.0);

        let all = resolve_assigned_total(&conn, "y1", "c1", None, None).expect("resolve all");
        assert_eq!(all, 600.0);
        let t2 = resolve_assigned_total(&conn, "y1", "c1", None, Some(2)).expect("resolve t2");
        assert_eq!(t2, 200.0);
    }

    #[test]
    fn resolver_counts_stream_rows_only_when_named() {
        let conn = test_conn();
        seed_year(&conn, "y1", "2025/26");
        seed_class(&conn, "c1", "P1");
        seed_stream(&conn, "s1", "East");
        seed_category(&conn, "fc1", "Tuition");
        seed_category(&conn, "fc2", "Transport");
        seed_structure(&conn, "fs1", "y1", "c1", None, "fc1", 100.0, 0.0, 0.0);
        seed_structure(&conn, "fs2", "y1", "c1", Some("s1"), "fc2", 50.0, 0.0, 0.0);

        let class_wide =
            resolve_assigned_total(&conn, "y1", "c1", None, None).expect("class-wide");
        assert_eq!(class_wide, 100.0);
        let with_stream =
            resolve_assigned_total(&conn, "y1", "c1", Some("s1"), None).expect("with stream");
        assert_eq!(with_stream, 150.0);
    }

    #[test]
    fn resolver_is_permissive_on_missing_scope() {
        let conn = test_conn();
        let total =
            resolve_assigned_total(&conn, "no-year", "no-class", None, None).expect("resolve");
        assert_eq!(total, 0.0);
    }

    #[test]
    fn inactive_structures_are_ignored() {
        let conn = test_conn();
        seed_year(&conn, "y1", "2025/26");
        seed_class(&conn, "c1", "P1");
        seed_category(&conn, "fc1", "Tuition");
        seed_structure(&conn, "fs1", "y1", "c1", None, "fc1", 100.0, 100.0, 100.0);
        conn.execute("UPDATE fee_structures SET is_active = 0 WHERE id = 'fs1'", [])
            .expect("deactivate");

        let total = resolve_assigned_total(&conn, "y1", "c1", None, None).expect("resolve");
        assert_eq!(total, 0.0);
    }

    #[test]
    fn grouped_paid_totals_cover_the_batch() {
        let mut conn = test_conn();
        seed_year(&conn, "y1", "2025/26");
        seed_class(&conn, "c1", "P1");
        seed_pupil(&conn, "p1", "ADM-001", "c1", "y1");
        seed_pupil(&conn, "p2", "ADM-002", "c1", "y1");
        seed_pupil(&conn, "p3", "ADM-003", "c1", "y1");

        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        for (pupil, amount) in [("p1", 10_000.0), ("p1", 5_000.0), ("p2", 7_500.0)] {
            record_payment(
                &mut conn,
                &NewPayment {
                    pupil_id: pupil.to_string(),
                    academic_year_id: "y1".to_string(),
                    amount,
                    term: 1,
                    payment_method: "cash".to_string(),
                    notes: None,
                    recorded_by: None,
                },
                now,
            )
            .expect("record payment");
        }

        let ids = vec!["p1".to_string(), "p2".to_string(), "p3".to_string()];
        let totals = paid_totals(&conn, &ids, Some("y1"), None).expect("paid totals");
        assert_eq!(totals.get("p1").copied(), Some(15_000.0));
        assert_eq!(totals.get("p2").copied(), Some(7_500.0));
        assert_eq!(totals.get("p3"), None);
    }

    #[test]
    fn adding_a_payment_never_increases_outstanding() {
        let mut conn = test_conn();
        seed_year(&conn, "y1", "2025/26");
        seed_class(&conn, "c1", "P1");
        seed_category(&conn, "fc1", "Tuition");
        seed_structure(&conn, "fs1", "y1", "c1", None, "fc1", 30_000.0, 30_000.0, 40_000.0);
        seed_pupil(&conn, "p1", "ADM-001", "c1", "y1");

        let assigned = resolve_assigned_total(&conn, "y1", "c1", None, None).expect("assigned");
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let mut previous = outstanding(
            assigned,
            total_paid(&conn, "p1", Some("y1"), None).expect("paid"),
        );
        for amount in [20_000.0, 50_000.0, 40_000.0] {
            record_payment(
                &mut conn,
                &NewPayment {
                    pupil_id: "p1".to_string(),
                    academic_year_id: "y1".to_string(),
                    amount,
                    term: 1,
                    payment_method: "cash".to_string(),
                    notes: None,
                    recorded_by: None,
                },
                now,
            )
            .expect("record payment");
            let current = outstanding(
                assigned,
                total_paid(&conn, "p1", Some("y1"), None).expect("paid"),
            );
            assert!(current <= previous);
            assert!(current >= 0.0);
            previous = current;
        }
        assert_eq!(previous, 0.0);
    }

    #[test]
    fn receipt_numbers_follow_format_and_sequence() {
        let mut conn = test_conn();
        seed_year(&conn, "y1", "2025/26");
        seed_class(&conn, "c1", "P1");
        seed_pupil(&conn, "p1", "ADM-001", "c1", "y1");

        let now = Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 5).unwrap();
        let new_payment = NewPayment {
            pupil_id: "p1".to_string(),
            academic_year_id: "y1".to_string(),
            amount: 1_000.0,
            term: 1,
            payment_method: "cash".to_string(),
            notes: None,
            recorded_by: Some("bursar-1".to_string()),
        };

        let first = record_payment(&mut conn, &new_payment, now).expect("first payment");
        assert_eq!(first.receipt_number, "RCP-20260302-0001");
        assert_eq!(first.transaction_reference, "TXN-20260302143005-0001");

        let second = record_payment(&mut conn, &new_payment, now).expect("second payment");
        assert_eq!(second.receipt_number, "RCP-20260302-0002");
        assert_eq!(second.transaction_reference, "TXN-20260302143005-0002");
    }

    #[test]
    fn payment_validation_rejects_bad_amount_and_term() {
        let mut conn = test_conn();
        seed_year(&conn, "y1", "2025/26");
        seed_class(&conn, "c1", "P1");
        seed_pupil(&conn, "p1", "ADM-001", "c1", "y1");

        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let mut payment = NewPayment {
            pupil_id: "p1".to_string(),
            academic_year_id: "y1".to_string(),
            amount: 0.0,
            term: 1,
            payment_method: "cash".to_string(),
            notes: None,
            recorded_by: None,
        };
        let err = record_payment(&mut conn, &payment, now).expect_err("zero amount");
        assert_eq!(err.code, "bad_params");

        payment.amount = 500.0;
        payment.term = 4;
        let err = record_payment(&mut conn, &payment, now).expect_err("bad term");
        assert_eq!(err.code, "bad_params");

        payment.term = 1;
        payment.pupil_id = "ghost".to_string();
        let err = record_payment(&mut conn, &payment, now).expect_err("missing pupil");
        assert_eq!(err.code, "not_found");
    }

    #[test]
    fn ledger_classifies_mixed_cohort() {
        let mut conn = test_conn();
        seed_year(&conn, "y1", "2025/26");
        seed_class(&conn, "c1", "P1");
        seed_category(&conn, "fc1", "Tuition");
        seed_structure(&conn, "fs1", "y1", "c1", None, "fc1", 50_000.0, 25_000.0, 25_000.0);
        seed_pupil(&conn, "p1", "ADM-001", "c1", "y1");
        seed_pupil(&conn, "p2", "ADM-002", "c1", "y1");
        seed_pupil(&conn, "p3", "ADM-003", "c1", "y1");

        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        for (pupil, amount) in [("p1", 100_000.0), ("p2", 40_000.0)] {
            record_payment(
                &mut conn,
                &NewPayment {
                    pupil_id: pupil.to_string(),
                    academic_year_id: "y1".to_string(),
                    amount,
                    term: 1,
                    payment_method: "cash".to_string(),
                    notes: None,
                    recorded_by: None,
                },
                now,
            )
            .expect("record payment");
        }

        let rows = student_ledger(
            &conn,
            &LedgerFilters {
                academic_year_id: "y1".to_string(),
                ..Default::default()
            },
        )
        .expect("ledger");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].status, "Fully Paid");
        assert_eq!(rows[0].outstanding, 0.0);
        assert_eq!(rows[1].status, "Partially Paid");
        assert_eq!(rows[1].outstanding, 60_000.0);
        assert_eq!(rows[2].status, "Outstanding");
        assert_eq!(rows[2].outstanding, 100_000.0);
        assert_eq!(rows[2].class_name, "P1");
    }
}
