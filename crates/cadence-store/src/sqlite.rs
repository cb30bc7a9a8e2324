use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Datelike, Duration, SecondsFormat, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use cadence_core::error::{CadenceError, Result};
use cadence_core::facts::{BehaviorFacts, SubjectProfile};
use cadence_core::traits::{EnrollmentStore, FactsProvider, ScenarioStore, SubjectMutator};
use cadence_core::types::{
    Advance, Enrollment, EnrollmentId, EnrollmentStatus, NewEnrollment, Scenario, ScenarioId,
    SubjectId,
};

/// Upper bound on host parameters bound in one `IN (...)` lookup.
const MAX_BATCH: usize = 500;

const ENROLLMENT_COLUMNS: &str = "id, scenario_id, subject_id, current_step, status, \
     next_fire_at, exit_reason, version, created_at, updated_at";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS scenarios (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        body TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS enrollments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        scenario_id TEXT NOT NULL,
        subject_id TEXT NOT NULL,
        current_step INTEGER NOT NULL,
        status TEXT NOT NULL,
        next_fire_at TEXT,
        exit_reason TEXT,
        version INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (scenario_id, subject_id)
    );

    CREATE INDEX IF NOT EXISTS idx_enrollments_due
        ON enrollments(status, next_fire_at);
    CREATE INDEX IF NOT EXISTS idx_enrollments_subject
        ON enrollments(subject_id, status);

    CREATE TABLE IF NOT EXISTS subject_tags (
        subject_id TEXT NOT NULL,
        tag_id TEXT NOT NULL,
        assigned_at TEXT NOT NULL,
        PRIMARY KEY (subject_id, tag_id)
    );

    CREATE TABLE IF NOT EXISTS subject_attrs (
        subject_id TEXT PRIMARY KEY,
        mark TEXT,
        menu_id TEXT,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS visits (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        subject_id TEXT NOT NULL,
        visited_at TEXT NOT NULL,
        amount REAL NOT NULL DEFAULT 0,
        is_reorder INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_visits_subject
        ON visits(subject_id, visited_at);
";

/// SQLite-backed scenario, enrollment and subject store.
///
/// Every mutating operation is one SQL statement, so it is atomic with
/// respect to other connections to the same database file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CadenceError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode so several processes can tick the same file
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )
        .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        info!(path = %path.display(), "Store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CadenceError::Database(e.to_string()))
    }

    /// Record a qualifying visit for behavioral rules.
    pub fn record_visit(
        &self,
        subject: &SubjectId,
        visited_at: DateTime<Utc>,
        amount: f64,
        is_reorder: bool,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO visits (subject_id, visited_at, amount, is_reorder) VALUES (?1, ?2, ?3, ?4)",
            params![subject.as_str(), ts(visited_at), amount, is_reorder],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Current menu of a subject, if one was ever assigned.
    pub fn subject_menu(&self, subject: &SubjectId) -> Result<Option<String>> {
        let conn = self.lock()?;
        let menu: Option<Option<String>> = conn
            .query_row(
                "SELECT menu_id FROM subject_attrs WHERE subject_id = ?1",
                params![subject.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(menu.flatten())
    }

    /// Profile of a single subject.
    pub fn subject_profile(&self, subject: &SubjectId) -> Result<SubjectProfile> {
        let conn = self.lock()?;
        let mut profiles = load_profiles(&conn, std::slice::from_ref(subject))?;
        Ok(profiles.remove(subject).unwrap_or_default())
    }

    fn apply(
        &self,
        id: EnrollmentId,
        expected_version: Option<i64>,
        advance: &Advance,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let (step, next_fire_at, reason) = match advance {
            Advance::Continue { step, next_fire_at } => {
                (Some(*step as i64), Some(fire_ts(*next_fire_at)?), None)
            }
            Advance::Complete => (None, None, None),
            Advance::Exit { reason } => (None, None, Some(reason.clone())),
        };

        // current_step is kept as-is when the enrollment leaves the program.
        let changed = conn
            .execute(
                "UPDATE enrollments
                 SET current_step = COALESCE(?1, current_step),
                     status = ?2,
                     next_fire_at = ?3,
                     exit_reason = COALESCE(?4, exit_reason),
                     version = version + 1,
                     updated_at = ?5
                 WHERE id = ?6
                   AND status = 'active'
                   AND (?7 IS NULL OR version = ?7)",
                params![
                    step,
                    advance.status().as_str(),
                    next_fire_at,
                    reason,
                    ts(now),
                    id.0,
                    expected_version,
                ],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }
}

impl ScenarioStore for SqliteStore {
    fn save_scenario(&self, scenario: &Scenario) -> BoxFuture<'_, Result<()>> {
        let body = serde_json::to_string(scenario);
        let id = scenario.id.to_string();
        let name = scenario.name.clone();
        let enabled = scenario.enabled;

        Box::pin(async move {
            let body = body?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO scenarios (id, name, enabled, body, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    enabled = excluded.enabled,
                    body = excluded.body,
                    updated_at = excluded.updated_at",
                params![id, name, enabled, body, ts(Utc::now())],
            )
            .map_err(db_err)?;
            debug!(scenario = %id, "Scenario saved");
            Ok(())
        })
    }

    fn load_scenario(&self, id: &ScenarioId) -> BoxFuture<'_, Result<Option<Scenario>>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM scenarios WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            match body {
                Some(body) => Ok(Some(serde_json::from_str(&body)?)),
                None => Ok(None),
            }
        })
    }

    fn list_scenarios(&self) -> BoxFuture<'_, Result<Vec<Scenario>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare("SELECT body FROM scenarios ORDER BY name ASC, id ASC")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db_err)?;

            let mut scenarios = Vec::new();
            for row in rows {
                let body = row.map_err(db_err)?;
                scenarios.push(serde_json::from_str(&body)?);
            }
            Ok(scenarios)
        })
    }
}

impl EnrollmentStore for SqliteStore {
    fn insert_enrollment(&self, new: &NewEnrollment) -> BoxFuture<'_, Result<Option<Enrollment>>> {
        let new = new.clone();
        Box::pin(async move {
            let next_fire_at = fire_ts(new.next_fire_at)?;
            let conn = self.lock()?;
            let now = ts(Utc::now());
            let inserted = conn
                .execute(
                    "INSERT INTO enrollments
                        (scenario_id, subject_id, current_step, status, next_fire_at,
                         version, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 'active', ?4, 0, ?5, ?5)
                     ON CONFLICT(scenario_id, subject_id) DO NOTHING",
                    params![
                        new.scenario_id.as_str(),
                        new.subject_id.as_str(),
                        new.first_step as i64,
                        next_fire_at,
                        now,
                    ],
                )
                .map_err(db_err)?;
            if inserted == 0 {
                return Ok(None);
            }
            let id = EnrollmentId(conn.last_insert_rowid());
            load_enrollment(&conn, id)
        })
    }

    fn due_enrollments(
        &self,
        now: DateTime<Utc>,
        after: Option<EnrollmentId>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Enrollment>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let sql = format!(
                "SELECT {} FROM enrollments
                 WHERE status = 'active' AND next_fire_at <= ?1 AND id > ?2
                 ORDER BY id ASC
                 LIMIT ?3",
                ENROLLMENT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = stmt
                .query_map(
                    params![ts(now), after.map(|a| a.0).unwrap_or(0), limit as i64],
                    EnrollmentRow::from_row,
                )
                .map_err(db_err)?;
            collect_enrollments(rows)
        })
    }

    fn claim_transition(
        &self,
        id: EnrollmentId,
        expected_version: i64,
        advance: &Advance,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<bool>> {
        let advance = advance.clone();
        Box::pin(async move { self.apply(id, Some(expected_version), &advance, now) })
    }

    fn force_transition(
        &self,
        id: EnrollmentId,
        advance: &Advance,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<bool>> {
        let advance = advance.clone();
        Box::pin(async move { self.apply(id, None, &advance, now) })
    }

    fn exit_all(
        &self,
        subject: &SubjectId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<usize>> {
        let subject = subject.clone();
        let reason = reason.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let changed = conn
                .execute(
                    "UPDATE enrollments
                     SET status = 'exited', next_fire_at = NULL, exit_reason = ?1,
                         version = version + 1, updated_at = ?2
                     WHERE subject_id = ?3 AND status = 'active'",
                    params![reason, ts(now), subject.as_str()],
                )
                .map_err(db_err)?;
            Ok(changed)
        })
    }

    fn load_enrollment(&self, id: EnrollmentId) -> BoxFuture<'_, Result<Option<Enrollment>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            load_enrollment(&conn, id)
        })
    }

    fn subject_enrollments(&self, subject: &SubjectId) -> BoxFuture<'_, Result<Vec<Enrollment>>> {
        let subject = subject.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            let sql = format!(
                "SELECT {} FROM enrollments WHERE subject_id = ?1 ORDER BY id ASC",
                ENROLLMENT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = stmt
                .query_map(params![subject.as_str()], EnrollmentRow::from_row)
                .map_err(db_err)?;
            collect_enrollments(rows)
        })
    }
}

impl FactsProvider for SqliteStore {
    fn profiles(
        &self,
        subjects: &[SubjectId],
    ) -> BoxFuture<'_, Result<HashMap<SubjectId, SubjectProfile>>> {
        let subjects = subjects.to_vec();
        Box::pin(async move {
            let conn = self.lock()?;
            load_profiles(&conn, &subjects)
        })
    }

    fn behavior(
        &self,
        subjects: &[SubjectId],
        window_days: Option<u32>,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<HashMap<SubjectId, BehaviorFacts>>> {
        let subjects = subjects.to_vec();
        Box::pin(async move {
            let conn = self.lock()?;
            let cutoff = match window_days {
                Some(days) => ts(now - Duration::days(days as i64)),
                None => String::new(),
            };

            let mut facts = HashMap::with_capacity(subjects.len());
            for chunk in subjects.chunks(MAX_BATCH) {
                let sql = format!(
                    "SELECT subject_id, COUNT(*), COALESCE(SUM(amount), 0),
                            MAX(visited_at), COALESCE(SUM(is_reorder), 0)
                     FROM visits
                     WHERE visited_at >= ? AND visited_at <= ? AND subject_id IN ({})
                     GROUP BY subject_id",
                    placeholders(chunk.len())
                );
                let mut values = vec![cutoff.clone(), ts(now)];
                values.extend(chunk.iter().map(|s| s.0.clone()));

                let mut stmt = conn.prepare(&sql).map_err(db_err)?;
                let rows = stmt
                    .query_map(params_from_iter(values.iter()), |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, f64>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    })
                    .map_err(db_err)?;

                for row in rows {
                    let (subject, visits, total, last, reorders) = row.map_err(db_err)?;
                    let last_visit = last.as_deref().map(parse_ts).transpose()?;
                    facts.insert(
                        SubjectId(subject),
                        BehaviorFacts {
                            visit_count: visits.max(0) as u64,
                            purchase_total: total,
                            last_visit,
                            reorder_count: reorders.max(0) as u64,
                        },
                    );
                }
            }
            Ok(facts)
        })
    }
}

impl SubjectMutator for SqliteStore {
    fn add_tag(&self, subject: &SubjectId, tag_id: &str) -> BoxFuture<'_, Result<()>> {
        let subject = subject.clone();
        let tag_id = tag_id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO subject_tags (subject_id, tag_id, assigned_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(subject_id, tag_id) DO NOTHING",
                params![subject.as_str(), tag_id, ts(Utc::now())],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn remove_tag(&self, subject: &SubjectId, tag_id: &str) -> BoxFuture<'_, Result<()>> {
        let subject = subject.clone();
        let tag_id = tag_id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "DELETE FROM subject_tags WHERE subject_id = ?1 AND tag_id = ?2",
                params![subject.as_str(), tag_id],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn set_mark(&self, subject: &SubjectId, mark: &str) -> BoxFuture<'_, Result<()>> {
        let subject = subject.clone();
        let mark = mark.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO subject_attrs (subject_id, mark, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(subject_id) DO UPDATE SET
                    mark = excluded.mark, updated_at = excluded.updated_at",
                params![subject.as_str(), mark, ts(Utc::now())],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn set_menu(&self, subject: &SubjectId, menu_id: &str) -> BoxFuture<'_, Result<()>> {
        let subject = subject.clone();
        let menu_id = menu_id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO subject_attrs (subject_id, menu_id, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(subject_id) DO UPDATE SET
                    menu_id = excluded.menu_id, updated_at = excluded.updated_at",
                params![subject.as_str(), menu_id, ts(Utc::now())],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }
}

/// Raw enrollment columns before timestamp and status parsing.
struct EnrollmentRow {
    id: i64,
    scenario_id: String,
    subject_id: String,
    current_step: i64,
    status: String,
    next_fire_at: Option<String>,
    exit_reason: Option<String>,
    version: i64,
    created_at: String,
    updated_at: String,
}

impl EnrollmentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            scenario_id: row.get(1)?,
            subject_id: row.get(2)?,
            current_step: row.get(3)?,
            status: row.get(4)?,
            next_fire_at: row.get(5)?,
            exit_reason: row.get(6)?,
            version: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_enrollment(self) -> Result<Enrollment> {
        let status = EnrollmentStatus::parse(&self.status).ok_or_else(|| {
            CadenceError::Database(format!(
                "enrollment {} has unknown status '{}'",
                self.id, self.status
            ))
        })?;
        Ok(Enrollment {
            id: EnrollmentId(self.id),
            scenario_id: ScenarioId(self.scenario_id),
            subject_id: SubjectId(self.subject_id),
            current_step: self.current_step.max(0) as usize,
            status,
            next_fire_at: self.next_fire_at.as_deref().map(parse_ts).transpose()?,
            exit_reason: self.exit_reason,
            version: self.version,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

/// Rows that cannot be decoded are logged and skipped so one bad row never
/// hides the rest.
fn collect_enrollments(
    rows: impl Iterator<Item = rusqlite::Result<EnrollmentRow>>,
) -> Result<Vec<Enrollment>> {
    let mut enrollments = Vec::new();
    for row in rows {
        let row = row.map_err(db_err)?;
        let id = row.id;
        match row.into_enrollment() {
            Ok(enrollment) => enrollments.push(enrollment),
            Err(e) => warn!(enrollment = id, error = %e, "Skipping unreadable enrollment row"),
        }
    }
    Ok(enrollments)
}

fn load_enrollment(conn: &Connection, id: EnrollmentId) -> Result<Option<Enrollment>> {
    let sql = format!("SELECT {} FROM enrollments WHERE id = ?1", ENROLLMENT_COLUMNS);
    conn.query_row(&sql, params![id.0], EnrollmentRow::from_row)
        .optional()
        .map_err(db_err)?
        .map(EnrollmentRow::into_enrollment)
        .transpose()
}

fn load_profiles(
    conn: &Connection,
    subjects: &[SubjectId],
) -> Result<HashMap<SubjectId, SubjectProfile>> {
    let mut profiles: HashMap<SubjectId, SubjectProfile> = HashMap::with_capacity(subjects.len());

    for chunk in subjects.chunks(MAX_BATCH) {
        let ids: Vec<&str> = chunk.iter().map(|s| s.as_str()).collect();

        let sql = format!(
            "SELECT subject_id, tag_id FROM subject_tags WHERE subject_id IN ({})",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_from_iter(ids.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err)?;
        for row in rows {
            let (subject, tag) = row.map_err(db_err)?;
            profiles.entry(SubjectId(subject)).or_default().tags.insert(tag);
        }

        let sql = format!(
            "SELECT subject_id, mark FROM subject_attrs
             WHERE mark IS NOT NULL AND subject_id IN ({})",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_from_iter(ids.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err)?;
        for row in rows {
            let (subject, mark) = row.map_err(db_err)?;
            profiles.entry(SubjectId(subject)).or_default().mark = Some(mark);
        }
    }
    Ok(profiles)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Fixed-width UTC timestamps so text comparison matches time order.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Like [`ts`], but refuses instants whose year does not fit four digits.
fn fire_ts(t: DateTime<Utc>) -> Result<String> {
    if (0..=9999).contains(&t.year()) {
        Ok(ts(t))
    } else {
        Err(CadenceError::Database(format!(
            "fire time {} is outside the storable range",
            t
        )))
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CadenceError::Database(format!("bad timestamp '{}': {}", s, e)))
}

fn db_err(e: rusqlite::Error) -> CadenceError {
    CadenceError::Database(e.to_string())
}
