use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct RankError {
    pub code: String,
    pub message: String,
}

impl RankError {
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

pub type RankResult<T> = Result<T, RankError>;

/// Raw subject scores as entered. A `None` subject was not sat.
#[derive(Debug, Clone, Default)]
pub struct SubjectScores {
    pub english: Option<i64>,
    pub mathematics: Option<i64>,
    pub science: Option<i64>,
    pub social_studies: Option<i64>,
}

impl SubjectScores {
    fn entries(&self) -> [(&'static str, Option<i64>); 4] {
        [
            ("english", self.english),
            ("mathematics", self.mathematics),
            ("science", self.science),
            ("social_studies", self.social_studies),
        ]
    }

    /// Every present score must sit in 0..=100; one bad subject rejects
    /// the whole sheet.
    pub fn validate(&self) -> RankResult<()> {
        for (subject, score) in self.entries() {
            if let Some(s) = score {
                if !(0..=100).contains(&s) {
                    return Err(RankError::new(
                        "bad_params",
                        format!("{} score {} out of range 0..=100", subject, s),
                    ));
                }
            }
        }
        Ok(())
    }
}

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub fn letter_grade(score: f64) -> &'static str {
    if score >= 80.0 {
        "A"
    } else if score >= 70.0 {
        "B+"
    } else if score >= 65.0 {
        "B"
    } else if score >= 60.0 {
        "C+"
    } else if score >= 55.0 {
        "C"
    } else if score >= 50.0 {
        "D+"
    } else if score >= 45.0 {
        "D"
    } else if score >= 40.0 {
        "E"
    } else {
        "F"
    }
}

pub fn subject_remark(score: f64) -> &'static str {
    if score >= 80.0 {
        "Excellent"
    } else if score >= 70.0 {
        "Very Good"
    } else if score >= 60.0 {
        "Good"
    } else if score >= 50.0 {
        "Fair"
    } else if score >= 40.0 {
        "Poor"
    } else {
        "Very Poor"
    }
}

pub fn general_comment(average: f64) -> &'static str {
    if average >= 80.0 {
        "Outstanding performance. Keep it up!"
    } else if average >= 70.0 {
        "Very good performance. Aim for excellence."
    } else if average >= 60.0 {
        "Good performance. Room for improvement."
    } else if average >= 50.0 {
        "Fair performance. Need to work harder."
    } else {
        "Poor performance. Significant improvement needed."
    }
}

#[derive(Debug, Clone, Default)]
struct Derived {
    total: Option<i64>,
    average: Option<f64>,
    english_grade: Option<&'static str>,
    mathematics_grade: Option<&'static str>,
    science_grade: Option<&'static str>,
    social_studies_grade: Option<&'static str>,
    overall_grade: Option<&'static str>,
    english_remark: Option<&'static str>,
    mathematics_remark: Option<&'static str>,
    science_remark: Option<&'static str>,
    social_studies_remark: Option<&'static str>,
    general_comment: Option<&'static str>,
}

/// Derives totals, grades, remarks and the general comment from raw
/// scores. Average runs over the subjects actually sat, rounded to two
/// decimals. Re-deriving from the same scores is idempotent.
fn derive(scores: &SubjectScores) -> Derived {
    let present: Vec<i64> = scores.entries().iter().filter_map(|(_, s)| *s).collect();
    let mut d = Derived::default();
    if !present.is_empty() {
        let total: i64 = present.iter().sum();
        let average = round2(total as f64 / present.len() as f64);
        d.total = Some(total);
        d.average = Some(average);
        d.overall_grade = Some(letter_grade(average));
        d.general_comment = Some(general_comment(average));
    }
    d.english_grade = scores.english.map(|s| letter_grade(s as f64));
    d.mathematics_grade = scores.mathematics.map(|s| letter_grade(s as f64));
    d.science_grade = scores.science.map(|s| letter_grade(s as f64));
    d.social_studies_grade = scores.social_studies.map(|s| letter_grade(s as f64));
    d.english_remark = scores.english.map(|s| subject_remark(s as f64));
    d.mathematics_remark = scores.mathematics.map(|s| subject_remark(s as f64));
    d.science_remark = scores.science.map(|s| subject_remark(s as f64));
    d.social_studies_remark = scores.social_studies.map(|s| subject_remark(s as f64));
    d
}

#[derive(Debug, Clone)]
pub struct MarksInput {
    pub pupil_id: String,
    pub academic_year_id: String,
    pub term: i64,
    pub exam_type: String,
    pub scores: SubjectScores,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkSheet {
    pub id: String,
    pub pupil_id: String,
    pub academic_year_id: String,
    pub term: i64,
    pub exam_type: String,
    pub english: Option<i64>,
    pub mathematics: Option<i64>,
    pub science: Option<i64>,
    pub social_studies: Option<i64>,
    pub total_marks: Option<i64>,
    pub average: Option<f64>,
    pub english_grade: Option<String>,
    pub mathematics_grade: Option<String>,
    pub science_grade: Option<String>,
    pub social_studies_grade: Option<String>,
    pub overall_grade: Option<String>,
    pub english_remark: Option<String>,
    pub mathematics_remark: Option<String>,
    pub science_remark: Option<String>,
    pub social_studies_remark: Option<String>,
    pub general_comment: Option<String>,
    pub position_in_stream: Option<i64>,
    pub position_in_class: Option<i64>,
    pub stream_student_count: Option<i64>,
    pub class_student_count: Option<i64>,
}

fn read_sheet(row: &rusqlite::Row) -> rusqlite::Result<MarkSheet> {
    Ok(MarkSheet {
        id: row.get(0)?,
        pupil_id: row.get(1)?,
        academic_year_id: row.get(2)?,
        term: row.get(3)?,
        exam_type: row.get(4)?,
        english: row.get(5)?,
        mathematics: row.get(6)?,
        science: row.get(7)?,
        social_studies: row.get(8)?,
        total_marks: row.get(9)?,
        average: row.get(10)?,
        english_grade: row.get(11)?,
        mathematics_grade: row.get(12)?,
        science_grade: row.get(13)?,
        social_studies_grade: row.get(14)?,
        overall_grade: row.get(15)?,
        english_remark: row.get(16)?,
        mathematics_remark: row.get(17)?,
        science_remark: row.get(18)?,
        social_studies_remark: row.get(19)?,
        general_comment: row.get(20)?,
        position_in_stream: row.get(21)?,
        position_in_class: row.get(22)?,
        stream_student_count: row.get(23)?,
        class_student_count: row.get(24)?,
    })
}

const SHEET_COLUMNS: &str = "id, pupil_id, academic_year_id, term, exam_type,
    english, mathematics, science, social_studies, total_marks, average,
    english_grade, mathematics_grade, science_grade, social_studies_grade,
    overall_grade, english_remark, mathematics_remark, science_remark,
    social_studies_remark, general_comment, position_in_stream,
    position_in_class, stream_student_count, class_student_count";

pub fn get_marks(
    conn: &Connection,
    pupil_id: &str,
    academic_year_id: &str,
    term: i64,
    exam_type: &str,
) -> RankResult<Option<MarkSheet>> {
    let sql = format!(
        "SELECT {} FROM pupil_marks
         WHERE pupil_id = ? AND academic_year_id = ? AND term = ? AND exam_type = ?",
        SHEET_COLUMNS
    );
    conn.query_row(&sql, (pupil_id, academic_year_id, term, exam_type), read_sheet)
        .optional()
        .map_err(RankError::db)
}

/// Validates, derives, upserts, and reranks the cohort, all in one
/// transaction. A reader never sees the new sheet with stale positions.
pub fn save_marks(
    conn: &mut Connection,
    input: &MarksInput,
    now: DateTime<Utc>,
) -> RankResult<MarkSheet> {
    input.scores.validate()?;
    if !(1..=3).contains(&input.term) {
        return Err(RankError::new("bad_params", "term must be 1, 2 or 3"));
    }
    if input.exam_type.trim().is_empty() {
        return Err(RankError::new("bad_params", "exam_type must be non-empty"));
    }

    let pupil: Option<String> = conn
        .query_row(
            "SELECT id FROM pupils WHERE id = ?",
            [input.pupil_id.as_str()],
            |r| r.get(0),
        )
        .optional()
        .map_err(RankError::db)?;
    if pupil.is_none() {
        return Err(RankError::new("not_found", "pupil not found"));
    }

    let d = derive(&input.scores);
    let stamp = now.to_rfc3339();

    let tx = conn.transaction().map_err(RankError::db)?;
    tx.execute(
        "INSERT INTO pupil_marks(
            id, pupil_id, academic_year_id, term, exam_type,
            english, mathematics, science, social_studies,
            total_marks, average,
            english_grade, mathematics_grade, science_grade, social_studies_grade,
            overall_grade,
            english_remark, mathematics_remark, science_remark, social_studies_remark,
            general_comment, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(pupil_id, academic_year_id, term, exam_type) DO UPDATE SET
            english = excluded.english,
            mathematics = excluded.mathematics,
            science = excluded.science,
            social_studies = excluded.social_studies,
            total_marks = excluded.total_marks,
            average = excluded.average,
            english_grade = excluded.english_grade,
            mathematics_grade = excluded.mathematics_grade,
            science_grade = excluded.science_grade,
            social_studies_grade = excluded.social_studies_grade,
            overall_grade = excluded.overall_grade,
            english_remark = excluded.english_remark,
            mathematics_remark = excluded.mathematics_remark,
            science_remark = excluded.science_remark,
            social_studies_remark = excluded.social_studies_remark,
            general_comment = excluded.general_comment,
            updated_at = excluded.updated_at",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            input.pupil_id,
            input.academic_year_id,
            input.term,
            input.exam_type,
            input.scores.english,
            input.scores.mathematics,
            input.scores.science,
            input.scores.social_studies,
            d.total,
            d.average,
            d.english_grade,
            d.mathematics_grade,
            d.science_grade,
            d.social_studies_grade,
            d.overall_grade,
            d.english_remark,
            d.mathematics_remark,
            d.science_remark,
            d.social_studies_remark,
            d.general_comment,
            stamp,
            stamp,
        ],
    )
    .map_err(|e| RankError::new("db_insert_failed", e.to_string()))?;

    // A null total means no subject was sat; nothing to rank.
    if d.total.is_some() {
        rerank_cohort(&tx, &input.academic_year_id, input.term, &input.exam_type)?;
    }
    tx.commit().map_err(RankError::db)?;

    let sheet = get_marks(
        conn,
        &input.pupil_id,
        &input.academic_year_id,
        input.term,
        &input.exam_type,
    )?;
    sheet.ok_or_else(|| RankError::new("db_query_failed", "saved sheet not found"))
}

/// Explicit whole-cohort rerank. Returns the number of sheets updated.
pub fn recompute_positions(
    conn: &mut Connection,
    academic_year_id: &str,
    term: i64,
    exam_type: &str,
) -> RankResult<usize> {
    let tx = conn.transaction().map_err(RankError::db)?;
    let updated = rerank_cohort(&tx, academic_year_id, term, exam_type)?;
    tx.commit().map_err(RankError::db)?;
    Ok(updated)
}

struct CohortRow {
    id: String,
    total: i64,
    class_id: Option<String>,
    stream_id: Option<String>,
}

/// Rewrites positions and cohort sizes for every ranked sheet in the
/// (year, term, exam_type) cohort. Cohorts join through active pupils;
/// rows without a total are skipped. Sort is stable descending on total,
/// so ties keep retrieval (rowid) order and take sequential positions.
fn rerank_cohort(
    conn: &Connection,
    academic_year_id: &str,
    term: i64,
    exam_type: &str,
) -> RankResult<usize> {
    let mut stmt = conn
        .prepare(
            "SELECT m.id, m.total_marks, p.class_id, p.stream_id
             FROM pupil_marks m
             JOIN pupils p ON p.id = m.pupil_id
             WHERE m.academic_year_id = ? AND m.term = ? AND m.exam_type = ?
               AND m.total_marks IS NOT NULL
               AND p.enrollment_status = 'active'
             ORDER BY m.rowid",
        )
        .map_err(RankError::db)?;
    let rows: Vec<CohortRow> = stmt
        .query_map((academic_year_id, term, exam_type), |r| {
            Ok(CohortRow {
                id: r.get(0)?,
                total: r.get(1)?,
                class_id: r.get(2)?,
                stream_id: r.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(RankError::db)?;

    let mut class_groups: HashMap<String, Vec<(String, i64)>> = HashMap::new();
    let mut stream_groups: HashMap<(String, String), Vec<(String, i64)>> = HashMap::new();
    for row in &rows {
        if let Some(class) = &row.class_id {
            class_groups
                .entry(class.clone())
                .or_default()
                .push((row.id.clone(), row.total));
            if let Some(stream) = &row.stream_id {
                stream_groups
                    .entry((class.clone(), stream.clone()))
                    .or_default()
                    .push((row.id.clone(), row.total));
            }
        }
    }

    let mut class_positions: HashMap<String, (i64, i64)> = HashMap::new();
    for members in class_groups.values_mut() {
        members.sort_by(|a, b| b.1.cmp(&a.1));
        let count = members.len() as i64;
        for (i, (id, _)) in members.iter().enumerate() {
            class_positions.insert(id.clone(), (i as i64 + 1, count));
        }
    }
    let mut stream_positions: HashMap<String, (i64, i64)> = HashMap::new();
    for members in stream_groups.values_mut() {
        members.sort_by(|a, b| b.1.cmp(&a.1));
        let count = members.len() as i64;
        for (i, (id, _)) in members.iter().enumerate() {
            stream_positions.insert(id.clone(), (i as i64 + 1, count));
        }
    }

    // A pupil without a class belongs to no partition; leave that sheet
    // alone rather than reporting it as ranked.
    let mut updated = 0usize;
    for row in &rows {
        let Some(class) = class_positions.get(&row.id) else {
            continue;
        };
        let stream = stream_positions.get(&row.id);
        conn.execute(
            "UPDATE pupil_marks
             SET position_in_class = ?, class_student_count = ?,
                 position_in_stream = ?, stream_student_count = ?
             WHERE id = ?",
            rusqlite::params![
                class.0,
                class.1,
                stream.map(|s| s.0),
                stream.map(|s| s.1),
                row.id,
            ],
        )
        .map_err(RankError::db)?;
        updated += 1;
    }
    Ok(updated)
}
