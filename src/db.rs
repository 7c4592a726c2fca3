use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("schooladmin.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Builds the full schema. Split out of `open_db` so engine tests can run
/// against `Connection::open_in_memory()`.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_years(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            start_year INTEGER,
            end_year INTEGER,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            level INTEGER
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS streams(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS pupils(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            gender TEXT,
            admission_number TEXT UNIQUE,
            class_id TEXT,
            stream_id TEXT,
            academic_year_id TEXT,
            enrollment_status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(stream_id) REFERENCES streams(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pupils_class ON pupils(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pupils_year ON pupils(academic_year_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pupils_status ON pupils(enrollment_status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_assignments(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            stream_id TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            assigned_date TEXT,
            UNIQUE(teacher_id, class_id, stream_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(stream_id) REFERENCES streams(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teacher_assignments_teacher
         ON teacher_assignments(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_categories(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT,
            is_active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    // stream_id NULL means the structure applies class-wide.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_structures(
            id TEXT PRIMARY KEY,
            academic_year_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            stream_id TEXT,
            fee_category_id TEXT NOT NULL,
            term1_amount REAL NOT NULL DEFAULT 0,
            term2_amount REAL NOT NULL DEFAULT 0,
            term3_amount REAL NOT NULL DEFAULT 0,
            annual_amount REAL NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT,
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(stream_id) REFERENCES streams(id),
            FOREIGN KEY(fee_category_id) REFERENCES fee_categories(id)
        )",
        [],
    )?;
    ensure_fee_structures_stream_column(conn)?;
    // At most one active structure per (year, class, stream, category).
    // NULL streams collapse to '' so class-wide rows are unique too.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_fee_structures_tuple
         ON fee_structures(academic_year_id, class_id, COALESCE(stream_id, ''), fee_category_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_structures_year_class
         ON fee_structures(academic_year_id, class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS payment_methods(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            is_active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS payments(
            id TEXT PRIMARY KEY,
            pupil_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            amount REAL NOT NULL CHECK(amount > 0),
            term INTEGER NOT NULL,
            payment_date TEXT NOT NULL,
            payment_method TEXT NOT NULL,
            receipt_number TEXT NOT NULL UNIQUE,
            transaction_reference TEXT NOT NULL UNIQUE,
            notes TEXT,
            recorded_by TEXT,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY(pupil_id) REFERENCES pupils(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_pupil ON payments(pupil_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_year ON payments(academic_year_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_date ON payments(payment_date)",
        [],
    )?;

    // Dedicated receipt sequence, bumped inside the payment transaction.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS receipt_counters(
            scope TEXT PRIMARY KEY,
            next_seq INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS pupil_marks(
            id TEXT PRIMARY KEY,
            pupil_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            term INTEGER NOT NULL,
            exam_type TEXT NOT NULL,
            english INTEGER,
            mathematics INTEGER,
            science INTEGER,
            social_studies INTEGER,
            total_marks INTEGER,
            average REAL,
            english_grade TEXT,
            mathematics_grade TEXT,
            science_grade TEXT,
            social_studies_grade TEXT,
            overall_grade TEXT,
            english_remark TEXT,
            mathematics_remark TEXT,
            science_remark TEXT,
            social_studies_remark TEXT,
            general_comment TEXT,
            position_in_stream INTEGER,
            position_in_class INTEGER,
            stream_student_count INTEGER,
            class_student_count INTEGER,
            created_at TEXT,
            updated_at TEXT,
            UNIQUE(pupil_id, academic_year_id, term, exam_type),
            FOREIGN KEY(pupil_id) REFERENCES pupils(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id)
        )",
        [],
    )?;
    ensure_pupil_marks_cohort_counts(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pupil_marks_cohort
         ON pupil_marks(academic_year_id, term, exam_type)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pupil_marks_pupil ON pupil_marks(pupil_id)",
        [],
    )?;

    // One row per pupil per day; re-marking the same day overwrites.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            pupil_id TEXT NOT NULL,
            class_id TEXT,
            stream_id TEXT,
            academic_year_id TEXT,
            attendance_date TEXT NOT NULL,
            status TEXT NOT NULL,
            teacher_id TEXT,
            created_at TEXT,
            updated_at TEXT,
            UNIQUE(pupil_id, attendance_date),
            FOREIGN KEY(pupil_id) REFERENCES pupils(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_pupil ON attendance(pupil_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(attendance_date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_class ON attendance(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            id TEXT PRIMARY KEY,
            category TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT,
            value_type TEXT NOT NULL DEFAULT 'string',
            description TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT,
            UNIQUE(category, key)
        )",
        [],
    )?;

    Ok(())
}

fn ensure_fee_structures_stream_column(conn: &Connection) -> anyhow::Result<()> {
    // Older workspaces kept one structure per (year, class, category) with
    // no stream scoping. Existing rows become class-wide (NULL stream).
    if table_has_column(conn, "fee_structures", "stream_id")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE fee_structures ADD COLUMN stream_id TEXT", [])?;
    Ok(())
}

fn ensure_pupil_marks_cohort_counts(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "pupil_marks", "stream_student_count")? {
        conn.execute(
            "ALTER TABLE pupil_marks ADD COLUMN stream_student_count INTEGER",
            [],
        )?;
    }
    if !table_has_column(conn, "pupil_marks", "class_student_count")? {
        conn.execute(
            "ALTER TABLE pupil_marks ADD COLUMN class_student_count INTEGER",
            [],
        )?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
