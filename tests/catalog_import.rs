use std::io::Write;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;

use fleet_core::catalog::CatalogFile;
use fleet_core::config::EngineConfig;
use fleet_core::error::Result;
use fleet_core::run::{RunStatus, StepStatus};
use fleet_core::traits::CatalogStore;
use fleet_core::types::{Channel, Context, Event, OrgId, Scope};
use fleet_engine::{EventDisposition, Fleet, FnSkill, SkillContext, SkillRegistry};
use fleet_store::SqliteStore;

const CATALOG: &str = r#"
[[sequences]]
sequence_key = "meeting_ended"
description = "Post-meeting follow-up"
default_channel = "in_app"

[[sequences.steps]]
skill = "summarize"
criticality = "critical"

[[sequences.steps]]
skill = "notify"
depends_on = ["summarize"]

[[routes]]
event_type = "meeting.ended"
sequence_key = "meeting_ended"
priority = 10
conditions = 'source == "zoom"'
"#;

fn write_catalog(text: &str) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(text.as_bytes()).expect("write catalog");
    tmp
}

fn skills() -> SkillRegistry {
    let mut registry = SkillRegistry::new();
    registry.register(FnSkill::new("summarize", |input: Context, _ctx: SkillContext| {
        Box::pin(async move {
            let meeting = input.get_str("meeting_id").unwrap_or_default().to_string();
            Ok(Context::from_value(json!({ "summary": format!("notes for {}", meeting) })))
        }) as BoxFuture<'static, Result<Context>>
    }));
    registry.register(FnSkill::new("notify", |input: Context, _ctx: SkillContext| {
        Box::pin(async move {
            let delivered = input.contains_key("summary");
            Ok(Context::from_value(json!({ "delivered": delivered })))
        }) as BoxFuture<'static, Result<Context>>
    }));
    registry
}

#[test]
fn test_import_is_repeatable_and_versions_advance() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = SqliteStore::open(&dir.path().join("fleet.db")).expect("open store");
    let catalog = CatalogFile::load(write_catalog(CATALOG).path()).expect("load catalog");

    let first = catalog.apply(&store).expect("first import");
    assert_eq!(first.sequences, vec![("meeting_ended".to_string(), "platform".to_string(), 1)]);
    assert_eq!(first.routes, 1);

    let second = catalog.apply(&store).expect("second import");
    assert_eq!(second.sequences[0].2, 2);

    // Routes are upserted, not duplicated.
    let routes = store.routes_for("meeting.ended", OrgId::new()).unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].scope, Scope::Platform);

    let current = store
        .definition("meeting_ended", Scope::Platform, None)
        .unwrap()
        .expect("current definition");
    assert_eq!(current.version, 2);
    assert_eq!(current.default_channel, Some(Channel::InApp));
}

#[test]
fn test_invalid_catalog_writes_nothing() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = SqliteStore::open(&dir.path().join("fleet.db")).expect("open store");
    let catalog = CatalogFile::load(
        write_catalog(
            r#"
[[sequences]]
sequence_key = "broken"

[[sequences.steps]]
skill = "a"
depends_on = ["missing"]

[[routes]]
event_type = "x"
sequence_key = "broken"
"#,
        )
        .path(),
    )
    .expect("load catalog");

    assert!(catalog.apply(&store).is_err());
    assert!(store.routes_for("x", OrgId::new()).unwrap().is_empty());
    assert!(store.list_definitions().unwrap().is_empty());
}

#[tokio::test]
async fn test_imported_catalog_drives_a_run() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = Arc::new(SqliteStore::open(&dir.path().join("fleet.db")).expect("open store"));
    CatalogFile::parse(CATALOG)
        .expect("parse catalog")
        .apply(&*store)
        .expect("import");

    let fleet = Fleet::builder(
        EngineConfig::default(),
        store.clone(),
        store.clone(),
        store.clone(),
        Arc::new(skills()),
    )
    .build();

    let org = OrgId::new();
    let mut payload = Context::new();
    payload.set_str("source", "zoom");
    payload.set_str("meeting_id", "m-42");
    let outcome = fleet
        .handle_event(Event::new("meeting.ended", org, payload))
        .await
        .expect("handle event");

    assert_eq!(outcome.disposition, EventDisposition::Processed);
    assert_eq!(outcome.runs.len(), 1);
    let run = &outcome.runs[0];
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.channel, Channel::InApp);
    assert_eq!(run.step_status("notify"), Some(StepStatus::Succeeded));
    assert_eq!(run.context.get_str("summary"), Some("notes for m-42"));
    assert_eq!(run.context.get("delivered"), Some(&json!(true)));

    // The route condition filters other sources.
    let mut payload = Context::new();
    payload.set_str("source", "teams");
    let outcome = fleet
        .handle_event(Event::new("meeting.ended", org, payload))
        .await
        .expect("handle event");
    assert_eq!(outcome.disposition, EventDisposition::NoRoute);
}
