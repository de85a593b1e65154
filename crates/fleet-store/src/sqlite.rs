use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use fleet_core::dag::StepGraph;
use fleet_core::error::{FleetError, Result};
use fleet_core::route::{EventRoute, HandoffRoute, OrgSettings, UserSequencePreference};
use fleet_core::run::{RunStatus, SequenceRun};
use fleet_core::sequence::SequenceDefinition;
use fleet_core::traits::{CatalogStore, DebounceStore, RunStore};
use fleet_core::types::{Channel, OrgId, RunId, Scope, UserId};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS event_routes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        org_id TEXT,
        event_type TEXT NOT NULL,
        sequence_key TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        conditions TEXT,
        is_active INTEGER NOT NULL DEFAULT 1
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_event_routes_scope
        ON event_routes(COALESCE(org_id, ''), event_type, sequence_key);

    CREATE TABLE IF NOT EXISTS sequence_definitions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        org_id TEXT,
        sequence_key TEXT NOT NULL,
        version INTEGER NOT NULL,
        is_current INTEGER NOT NULL DEFAULT 1,
        definition TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_sequence_definitions_version
        ON sequence_definitions(COALESCE(org_id, ''), sequence_key, version);

    CREATE TABLE IF NOT EXISTS handoff_routes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        org_id TEXT,
        source_sequence_key TEXT NOT NULL,
        source_step_skill TEXT NOT NULL,
        target_event_type TEXT NOT NULL,
        context_mapping TEXT NOT NULL DEFAULT '{}',
        conditions TEXT,
        delay_minutes INTEGER NOT NULL DEFAULT 0,
        is_active INTEGER NOT NULL DEFAULT 1
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_handoff_routes_scope
        ON handoff_routes(COALESCE(org_id, ''), source_sequence_key, source_step_skill, target_event_type);

    CREATE TABLE IF NOT EXISTS user_sequence_preferences (
        user_id TEXT NOT NULL,
        org_id TEXT NOT NULL,
        sequence_type TEXT NOT NULL,
        is_enabled INTEGER NOT NULL,
        delivery_channel TEXT,
        PRIMARY KEY (user_id, org_id, sequence_type)
    );

    CREATE TABLE IF NOT EXISTS org_settings (
        org_id TEXT PRIMARY KEY,
        settings TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS debounce_records (
        trigger_key TEXT PRIMARY KEY,
        last_fired_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sequence_runs (
        run_id TEXT PRIMARY KEY,
        org_id TEXT NOT NULL,
        sequence_key TEXT NOT NULL,
        version INTEGER NOT NULL,
        status TEXT NOT NULL,
        data TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sequence_runs_status
        ON sequence_runs(status, updated_at);
";

/// SQLite-backed catalog, run and debounce store.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FleetError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        // Other processes may hold the write lock on a shared database
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;

        // WAL lets readers proceed while a run is being written
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| FleetError::Database(e.to_string()))
    }
}

fn db_err(e: rusqlite::Error) -> FleetError {
    FleetError::Database(e.to_string())
}

fn scope_column(scope: &Scope) -> Option<String> {
    scope.org_id().map(|id| id.to_string())
}

fn scope_from_column(org_id: Option<String>) -> Result<Scope> {
    match org_id {
        None => Ok(Scope::Platform),
        Some(s) => s
            .parse::<OrgId>()
            .map(Scope::Org)
            .map_err(|e| FleetError::Database(format!("bad org_id '{}': {}", s, e))),
    }
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

type RouteRow = (Option<String>, String, String, i32, Option<String>, bool);

impl CatalogStore for SqliteStore {
    fn routes_for(&self, event_type: &str, org_id: OrgId) -> Result<Vec<EventRoute>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT org_id, event_type, sequence_key, priority, conditions, is_active
                 FROM event_routes
                 WHERE event_type = ?1 AND (org_id IS NULL OR org_id = ?2)
                 ORDER BY id",
            )
            .map_err(db_err)?;

        let rows: Vec<RouteRow> = stmt
            .query_map(params![event_type, org_id.to_string()], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })
            .map_err(db_err)?
            .collect::<std::result::Result<_, _>>()
            .map_err(db_err)?;

        rows.into_iter()
            .map(|(org, event_type, sequence_key, priority, conditions, is_active)| {
                Ok(EventRoute {
                    scope: scope_from_column(org)?,
                    event_type,
                    sequence_key,
                    priority,
                    conditions,
                    is_active,
                })
            })
            .collect()
    }

    fn upsert_route(&self, route: &EventRoute) -> Result<()> {
        if let Some(expr) = &route.conditions {
            fleet_core::condition::Condition::parse(expr)?;
        }
        let conn = self.conn()?;
        let org = scope_column(&route.scope);
        let updated = conn
            .execute(
                "UPDATE event_routes SET priority = ?4, conditions = ?5, is_active = ?6
                 WHERE org_id IS ?1 AND event_type = ?2 AND sequence_key = ?3",
                params![
                    org,
                    route.event_type,
                    route.sequence_key,
                    route.priority,
                    route.conditions,
                    route.is_active
                ],
            )
            .map_err(db_err)?;
        if updated == 0 {
            conn.execute(
                "INSERT INTO event_routes (org_id, event_type, sequence_key, priority, conditions, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    org,
                    route.event_type,
                    route.sequence_key,
                    route.priority,
                    route.conditions,
                    route.is_active
                ],
            )
            .map_err(db_err)?;
        }
        Ok(())
    }

    fn definition(
        &self,
        sequence_key: &str,
        scope: Scope,
        version: Option<u32>,
    ) -> Result<Option<SequenceDefinition>> {
        let conn = self.conn()?;
        let org = scope_column(&scope);
        let json: Option<String> = match version {
            Some(v) => conn
                .query_row(
                    "SELECT definition FROM sequence_definitions
                     WHERE org_id IS ?1 AND sequence_key = ?2 AND version = ?3",
                    params![org, sequence_key, v],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?,
            None => conn
                .query_row(
                    "SELECT definition FROM sequence_definitions
                     WHERE org_id IS ?1 AND sequence_key = ?2 AND is_current = 1
                     ORDER BY version DESC LIMIT 1",
                    params![org, sequence_key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?,
        };
        json.map(|j| serde_json::from_str(&j).map_err(FleetError::from))
            .transpose()
    }

    fn insert_definition(&self, definition: &SequenceDefinition) -> Result<SequenceDefinition> {
        // A definition that is not a DAG never reaches the table.
        StepGraph::build(definition)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        let org = scope_column(&definition.scope);

        let latest: Option<u32> = tx
            .query_row(
                "SELECT MAX(version) FROM sequence_definitions
                 WHERE org_id IS ?1 AND sequence_key = ?2",
                params![org, definition.sequence_key],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        let latest = latest.unwrap_or(0);

        let version = match definition.version {
            0 => latest + 1,
            v if v > latest => v,
            v => {
                return Err(FleetError::Config(format!(
                    "sequence {} ({}) already has version {}; versions are append-only",
                    definition.sequence_key, definition.scope, v
                )))
            }
        };

        let mut stored = definition.clone();
        stored.version = version;
        if stored.is_current {
            tx.execute(
                "UPDATE sequence_definitions SET is_current = 0
                 WHERE org_id IS ?1 AND sequence_key = ?2",
                params![org, stored.sequence_key],
            )
            .map_err(db_err)?;
        }

        // Keep the stored JSON in step with the is_current column.
        let json = serde_json::to_string(&stored)?;
        tx.execute(
            "INSERT INTO sequence_definitions (org_id, sequence_key, version, is_current, definition, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                org,
                stored.sequence_key,
                version,
                stored.is_current,
                json,
                timestamp(stored.created_at)
            ],
        )
        .map_err(db_err)?;

        if stored.is_current {
            let rows: Vec<(i64, String)> = {
                let mut stmt = tx
                    .prepare(
                        "SELECT id, definition FROM sequence_definitions
                         WHERE org_id IS ?1 AND sequence_key = ?2 AND version != ?3",
                    )
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![org, stored.sequence_key, version], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })
                    .map_err(db_err)?
                    .collect::<std::result::Result<_, _>>()
                    .map_err(db_err)?;
                rows
            };
            for (id, json) in rows {
                let mut old: SequenceDefinition = serde_json::from_str(&json)?;
                if old.is_current {
                    old.is_current = false;
                    tx.execute(
                        "UPDATE sequence_definitions SET definition = ?1 WHERE id = ?2",
                        params![serde_json::to_string(&old)?, id],
                    )
                    .map_err(db_err)?;
                }
            }
        }

        tx.commit().map_err(db_err)?;
        info!(
            sequence = %stored.sequence_key,
            scope = %stored.scope,
            version,
            steps = stored.steps.len(),
            "Sequence definition stored"
        );
        Ok(stored)
    }

    fn list_definitions(&self) -> Result<Vec<SequenceDefinition>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT definition FROM sequence_definitions ORDER BY sequence_key, id")
            .map_err(db_err)?;
        let rows: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .map_err(db_err)?
            .collect::<std::result::Result<_, _>>()
            .map_err(db_err)?;
        rows.iter()
            .map(|j| serde_json::from_str(j).map_err(FleetError::from))
            .collect()
    }

    fn handoff_routes_for(
        &self,
        source_sequence_key: &str,
        source_step_skill: &str,
        org_id: OrgId,
    ) -> Result<Vec<HandoffRoute>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT org_id, source_sequence_key, source_step_skill, target_event_type,
                        context_mapping, conditions, delay_minutes, is_active
                 FROM handoff_routes
                 WHERE source_sequence_key = ?1 AND source_step_skill = ?2
                   AND (org_id IS NULL OR org_id = ?3)
                 ORDER BY id",
            )
            .map_err(db_err)?;

        #[allow(clippy::type_complexity)]
        let rows: Vec<(Option<String>, String, String, String, String, Option<String>, u32, bool)> =
            stmt.query_map(
                params![source_sequence_key, source_step_skill, org_id.to_string()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                },
            )
            .map_err(db_err)?
            .collect::<std::result::Result<_, _>>()
            .map_err(db_err)?;

        rows.into_iter()
            .map(|(org, source, skill, target, mapping, conditions, delay, active)| {
                Ok(HandoffRoute {
                    scope: scope_from_column(org)?,
                    source_sequence_key: source,
                    source_step_skill: skill,
                    target_event_type: target,
                    context_mapping: serde_json::from_str(&mapping)?,
                    conditions,
                    delay_minutes: delay,
                    is_active: active,
                })
            })
            .collect()
    }

    fn upsert_handoff_route(&self, route: &HandoffRoute) -> Result<()> {
        if let Some(expr) = &route.conditions {
            fleet_core::condition::Condition::parse(expr)?;
        }
        let conn = self.conn()?;
        let org = scope_column(&route.scope);
        let mapping = serde_json::to_string(&route.context_mapping)?;
        let updated = conn
            .execute(
                "UPDATE handoff_routes
                 SET context_mapping = ?5, conditions = ?6, delay_minutes = ?7, is_active = ?8
                 WHERE org_id IS ?1 AND source_sequence_key = ?2
                   AND source_step_skill = ?3 AND target_event_type = ?4",
                params![
                    org,
                    route.source_sequence_key,
                    route.source_step_skill,
                    route.target_event_type,
                    mapping,
                    route.conditions,
                    route.delay_minutes,
                    route.is_active
                ],
            )
            .map_err(db_err)?;
        if updated == 0 {
            conn.execute(
                "INSERT INTO handoff_routes (org_id, source_sequence_key, source_step_skill,
                    target_event_type, context_mapping, conditions, delay_minutes, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    org,
                    route.source_sequence_key,
                    route.source_step_skill,
                    route.target_event_type,
                    mapping,
                    route.conditions,
                    route.delay_minutes,
                    route.is_active
                ],
            )
            .map_err(db_err)?;
        }
        Ok(())
    }

    fn user_preference(
        &self,
        user_id: UserId,
        org_id: OrgId,
        sequence_type: &str,
    ) -> Result<Option<UserSequencePreference>> {
        let conn = self.conn()?;
        let row: Option<(bool, Option<String>)> = conn
            .query_row(
                "SELECT is_enabled, delivery_channel FROM user_sequence_preferences
                 WHERE user_id = ?1 AND org_id = ?2 AND sequence_type = ?3",
                params![user_id.to_string(), org_id.to_string(), sequence_type],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;

        row.map(|(is_enabled, channel)| {
            let delivery_channel = channel
                .map(|c| c.parse::<Channel>().map_err(FleetError::Database))
                .transpose()?;
            Ok(UserSequencePreference {
                user_id,
                org_id,
                sequence_type: sequence_type.to_string(),
                is_enabled,
                delivery_channel,
            })
        })
        .transpose()
    }

    fn upsert_user_preference(&self, pref: &UserSequencePreference) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO user_sequence_preferences (user_id, org_id, sequence_type, is_enabled, delivery_channel)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, org_id, sequence_type)
             DO UPDATE SET is_enabled = excluded.is_enabled, delivery_channel = excluded.delivery_channel",
            params![
                pref.user_id.to_string(),
                pref.org_id.to_string(),
                pref.sequence_type,
                pref.is_enabled,
                pref.delivery_channel.map(|c| c.to_string())
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn org_settings(&self, org_id: OrgId) -> Result<Option<OrgSettings>> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT settings FROM org_settings WHERE org_id = ?1",
                params![org_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        json.map(|j| serde_json::from_str(&j).map_err(FleetError::from))
            .transpose()
    }

    fn upsert_org_settings(&self, settings: &OrgSettings) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO org_settings (org_id, settings) VALUES (?1, ?2)
             ON CONFLICT(org_id) DO UPDATE SET settings = excluded.settings",
            params![settings.org_id.to_string(), serde_json::to_string(settings)?],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

impl RunStore for SqliteStore {
    fn save_run(&self, run: &SequenceRun) -> Result<()> {
        let conn = self.conn()?;
        let data = serde_json::to_string(run)?;
        conn.execute(
            "INSERT INTO sequence_runs (run_id, org_id, sequence_key, version, status, data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(run_id) DO UPDATE SET
                status = excluded.status,
                data = excluded.data,
                updated_at = excluded.updated_at",
            params![
                run.run_id.0,
                run.event.org_id.to_string(),
                run.sequence_key,
                run.version,
                run.status.to_string(),
                data,
                timestamp(run.created_at),
                timestamp(run.updated_at)
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn load_run(&self, run_id: &RunId) -> Result<Option<SequenceRun>> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT data FROM sequence_runs WHERE run_id = ?1",
                params![run_id.0],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        json.map(|j| serde_json::from_str(&j).map_err(FleetError::from))
            .transpose()
    }

    fn list_runs(&self, status: Option<RunStatus>, limit: usize) -> Result<Vec<SequenceRun>> {
        let conn = self.conn()?;
        let limit = limit as i64;
        let rows: Vec<String> = match status {
            Some(status) => {
                let mut stmt = conn
                    .prepare(
                        "SELECT data FROM sequence_runs WHERE status = ?1
                         ORDER BY updated_at DESC LIMIT ?2",
                    )
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![status.to_string(), limit], |row| row.get(0))
                    .map_err(db_err)?
                    .collect::<std::result::Result<_, _>>()
                    .map_err(db_err)?;
                rows
            }
            None => {
                let mut stmt = conn
                    .prepare("SELECT data FROM sequence_runs ORDER BY updated_at DESC LIMIT ?1")
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![limit], |row| row.get(0))
                    .map_err(db_err)?
                    .collect::<std::result::Result<_, _>>()
                    .map_err(db_err)?;
                rows
            }
        };
        rows.iter()
            .map(|j| serde_json::from_str(j).map_err(FleetError::from))
            .collect()
    }
}

impl DebounceStore for SqliteStore {
    fn should_fire_at(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        // Insert-or-advance in one statement; the WHERE leaves a live record untouched.
        let changed = conn
            .execute(
                "INSERT INTO debounce_records (trigger_key, last_fired_at) VALUES (?1, ?2)
                 ON CONFLICT(trigger_key) DO UPDATE SET last_fired_at = excluded.last_fired_at
                 WHERE excluded.last_fired_at - debounce_records.last_fired_at > ?3",
                params![key, now.timestamp_millis(), window_ms],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM debounce_records WHERE last_fired_at < ?1",
                params![cutoff.timestamp_millis()],
            )
            .map_err(db_err)?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::sequence::Step;
    use fleet_core::types::{Context, Event};

    fn store() -> SqliteStore {
        SqliteStore::in_memory().unwrap()
    }

    fn meeting_def(scope: Scope) -> SequenceDefinition {
        SequenceDefinition::new(
            "meeting_ended",
            scope,
            vec![
                Step::new("summarize"),
                Step::new("notify-slack-summary").depends_on(["summarize"]),
            ],
        )
    }

    #[test]
    fn test_routes_include_platform_and_own_org_only() {
        let store = store();
        let org = OrgId::new();
        let other = OrgId::new();
        store
            .upsert_route(&EventRoute::new(Scope::Platform, "meeting_ended", "meeting_ended", 10))
            .unwrap();
        store
            .upsert_route(&EventRoute::new(Scope::Org(org), "meeting_ended", "meeting_ended", 20))
            .unwrap();
        store
            .upsert_route(&EventRoute::new(Scope::Org(other), "meeting_ended", "other_seq", 5))
            .unwrap();

        let routes = store.routes_for("meeting_ended", org).unwrap();
        assert_eq!(routes.len(), 2);
        assert!(routes.iter().any(|r| r.scope == Scope::Platform));
        assert!(routes.iter().any(|r| r.scope == Scope::Org(org)));
    }

    #[test]
    fn test_route_upsert_updates_in_place() {
        let store = store();
        let route = EventRoute::new(Scope::Platform, "email_received", "triage", 1);
        store.upsert_route(&route).unwrap();
        store.upsert_route(&route.clone().disabled()).unwrap();
        let routes = store.routes_for("email_received", OrgId::new()).unwrap();
        assert_eq!(routes.len(), 1);
        assert!(!routes[0].is_active);
    }

    #[test]
    fn test_route_with_malformed_condition_rejected() {
        let store = store();
        let route = EventRoute::new(Scope::Platform, "x", "y", 0).when("confidence >= high");
        assert!(matches!(
            store.upsert_route(&route),
            Err(FleetError::Condition { .. })
        ));
    }

    #[test]
    fn test_insert_definition_assigns_versions() {
        let store = store();
        let v1 = store.insert_definition(&meeting_def(Scope::Platform)).unwrap();
        let v2 = store.insert_definition(&meeting_def(Scope::Platform)).unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);

        let current = store
            .definition("meeting_ended", Scope::Platform, None)
            .unwrap()
            .unwrap();
        assert_eq!(current.version, 2);

        let pinned = store
            .definition("meeting_ended", Scope::Platform, Some(1))
            .unwrap()
            .unwrap();
        assert_eq!(pinned.version, 1);
        assert!(!pinned.is_current);

        assert!(store
            .definition("meeting_ended", Scope::Platform, Some(9))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_versions_are_scoped() {
        let store = store();
        let org = OrgId::new();
        store.insert_definition(&meeting_def(Scope::Platform)).unwrap();
        store.insert_definition(&meeting_def(Scope::Platform)).unwrap();
        let org_v = store.insert_definition(&meeting_def(Scope::Org(org))).unwrap();
        assert_eq!(org_v.version, 1);
        assert!(store
            .definition("meeting_ended", Scope::Org(OrgId::new()), None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_explicit_version_must_advance() {
        let store = store();
        let mut def = meeting_def(Scope::Platform);
        def.version = 3;
        assert_eq!(store.insert_definition(&def).unwrap().version, 3);
        assert!(matches!(
            store.insert_definition(&def),
            Err(FleetError::Config(_))
        ));
    }

    #[test]
    fn test_cyclic_definition_never_persisted() {
        let store = store();
        let def = SequenceDefinition::new(
            "loop",
            Scope::Platform,
            vec![
                Step::new("a").depends_on(["b"]),
                Step::new("b").depends_on(["a"]),
            ],
        );
        assert!(matches!(
            store.insert_definition(&def),
            Err(FleetError::CyclicDependency { .. })
        ));
        assert!(store.list_definitions().unwrap().is_empty());
    }

    #[test]
    fn test_handoff_routes_roundtrip() {
        let store = store();
        let org = OrgId::new();
        let route = HandoffRoute::new("email_received", "detect-intents", "proposal_generation")
            .when("intent == send_proposal AND confidence >= 0.7")
            .map("deal_id", "deal.id")
            .delayed(5);
        store.upsert_handoff_route(&route).unwrap();

        let found = store
            .handoff_routes_for("email_received", "detect-intents", org)
            .unwrap();
        assert_eq!(found, vec![route]);
        assert!(store
            .handoff_routes_for("email_received", "other-skill", org)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_preferences_and_org_settings() {
        let store = store();
        let org = OrgId::new();
        let user = UserId::new();
        assert!(store.user_preference(user, org, "meeting_ended").unwrap().is_none());

        let pref = UserSequencePreference {
            user_id: user,
            org_id: org,
            sequence_type: "meeting_ended".into(),
            is_enabled: false,
            delivery_channel: Some(Channel::Email),
        };
        store.upsert_user_preference(&pref).unwrap();
        assert_eq!(
            store.user_preference(user, org, "meeting_ended").unwrap(),
            Some(pref)
        );

        let mut settings = OrgSettings::new(org);
        settings.enabled_sequences.insert("meeting_ended".into(), false);
        settings.default_channel = Some(Channel::InApp);
        store.upsert_org_settings(&settings).unwrap();
        assert_eq!(store.org_settings(org).unwrap(), Some(settings));
    }

    #[test]
    fn test_run_persistence() {
        let store = store();
        let def = meeting_def(Scope::Platform);
        let event = Event::new("meeting_ended", OrgId::new(), Context::new());
        let mut run = SequenceRun::new(&def, event, &[0, 1]);
        store.save_run(&run).unwrap();

        run.status = RunStatus::AwaitingApproval;
        run.touch();
        store.save_run(&run).unwrap();

        let loaded = store.load_run(&run.run_id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::AwaitingApproval);
        assert_eq!(
            store
                .list_runs(Some(RunStatus::AwaitingApproval), 10)
                .unwrap()
                .len(),
            1
        );
        assert!(store.list_runs(Some(RunStatus::Failed), 10).unwrap().is_empty());
        assert!(store.load_run(&RunId::new()).unwrap().is_none());
    }

    #[test]
    fn test_debounce_window() {
        let store = store();
        let t0 = Utc::now();
        let window = Duration::from_secs(60);
        assert!(store.should_fire_at("run:k", window, t0).unwrap());
        assert!(!store
            .should_fire_at("run:k", window, t0 + chrono::Duration::seconds(30))
            .unwrap());
        assert!(!store
            .should_fire_at("run:k", window, t0 + chrono::Duration::seconds(60))
            .unwrap());
        assert!(store
            .should_fire_at("run:k", window, t0 + chrono::Duration::seconds(61))
            .unwrap());
    }

    fn count_winners(stores: Vec<std::sync::Arc<SqliteStore>>, per_store: usize) -> usize {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let wins = std::sync::Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = stores
            .iter()
            .flat_map(|store| std::iter::repeat(store.clone()).take(per_store))
            .map(|store| {
                let wins = wins.clone();
                std::thread::spawn(move || {
                    if store.should_fire("run:storm", Duration::from_secs(60)).unwrap() {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        wins.load(Ordering::SeqCst)
    }

    #[test]
    fn test_debounce_concurrent_callers_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(SqliteStore::open(&dir.path().join("fleet.db")).unwrap());
        assert_eq!(count_winners(vec![store], 32), 1);
    }

    #[test]
    fn test_debounce_single_winner_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.db");
        let stores = (0..4)
            .map(|_| std::sync::Arc::new(SqliteStore::open(&path).unwrap()))
            .collect();
        assert_eq!(count_winners(stores, 4), 1);
    }

    #[test]
    fn test_debounce_purge() {
        let store = store();
        let now = Utc::now();
        store
            .should_fire_at("old", Duration::from_secs(1), now - chrono::Duration::days(2))
            .unwrap();
        store.should_fire_at("new", Duration::from_secs(1), now).unwrap();
        assert_eq!(
            store.purge_older_than(now - chrono::Duration::days(1)).unwrap(),
            1
        );
    }
}
