#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use fleet_core::config::EngineConfig;
use fleet_core::error::{FleetError, Result};
use fleet_core::route::EventRoute;
use fleet_core::run::ApprovalRequest;
use fleet_core::sequence::{SequenceDefinition, Step};
use fleet_core::traits::{CatalogStore, NotificationSink, SkillCall, SkillExecutor};
use fleet_core::types::{Channel, Context, Scope};
use fleet_engine::Fleet;
use fleet_store::SqliteStore;

/// What a scripted skill does when called.
#[derive(Clone)]
pub enum Behavior {
    Output(Value),
    Fail(String),
    /// Sleep, then return the output.
    Slow(Duration, Value),
    Panic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mark {
    Start(String),
    End(String),
}

/// Skill executor driven by a per-skill script. Unscripted skills sleep
/// briefly and return `{"<skill>": "done"}`.
pub struct ScriptedSkills {
    script: Mutex<HashMap<String, Behavior>>,
    log: Mutex<Vec<Mark>>,
    inputs: Mutex<HashMap<String, Context>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

struct RunningGuard<'a> {
    skills: &'a ScriptedSkills,
    step: String,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.skills.running.fetch_sub(1, Ordering::SeqCst);
        self.skills
            .log
            .lock()
            .unwrap()
            .push(Mark::End(self.step.clone()));
    }
}

impl ScriptedSkills {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            inputs: Mutex::new(HashMap::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        })
    }

    pub fn script(&self, skill: &str, behavior: Behavior) {
        self.script
            .lock()
            .unwrap()
            .insert(skill.to_string(), behavior);
    }

    pub fn log(&self) -> Vec<Mark> {
        self.log.lock().unwrap().clone()
    }

    pub fn calls(&self, step: &str) -> usize {
        self.log()
            .iter()
            .filter(|m| **m == Mark::Start(step.to_string()))
            .count()
    }

    pub fn input_of(&self, step: &str) -> Option<Context> {
        self.inputs.lock().unwrap().get(step).cloned()
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Position of a mark in the log.
    pub fn position(&self, mark: Mark) -> usize {
        self.log()
            .iter()
            .position(|m| *m == mark)
            .unwrap_or_else(|| panic!("{mark:?} not in log"))
    }
}

impl SkillExecutor for ScriptedSkills {
    fn execute(&self, call: SkillCall) -> BoxFuture<'_, Result<Context>> {
        Box::pin(async move {
            let behavior = self
                .script
                .lock()
                .unwrap()
                .get(&call.skill)
                .cloned()
                .unwrap_or_else(|| {
                    let mut done = serde_json::Map::new();
                    done.insert(call.skill.clone(), Value::from("done"));
                    Behavior::Slow(Duration::from_millis(10), Value::Object(done))
                });

            self.inputs
                .lock()
                .unwrap()
                .insert(call.step.clone(), call.input.clone());
            self.log.lock().unwrap().push(Mark::Start(call.step.clone()));
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            let _guard = RunningGuard {
                skills: self,
                step: call.step.clone(),
            };

            match behavior {
                Behavior::Output(value) => Ok(Context::from_value(value)),
                Behavior::Fail(message) => Err(FleetError::StepExecution {
                    step: call.step,
                    message,
                }),
                Behavior::Slow(delay, value) => {
                    tokio::time::sleep(delay).await;
                    Ok(Context::from_value(value))
                }
                Behavior::Panic => panic!("skill {} exploded", call.skill),
            }
        })
    }
}

/// Records approval requests instead of delivering them.
#[derive(Default)]
pub struct RecordingSink {
    pub requests: Mutex<Vec<(ApprovalRequest, Channel)>>,
}

impl NotificationSink for RecordingSink {
    fn request_approval(
        &self,
        request: &ApprovalRequest,
        channel: Channel,
    ) -> BoxFuture<'_, Result<()>> {
        self.requests
            .lock()
            .unwrap()
            .push((request.clone(), channel));
        Box::pin(async { Ok(()) })
    }
}

pub struct Harness {
    pub fleet: Arc<Fleet>,
    pub store: Arc<SqliteStore>,
    pub skills: Arc<ScriptedSkills>,
    pub sink: Arc<RecordingSink>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        Self::on_store(config, store)
    }

    /// Build a fleet over an existing store, e.g. to simulate a restart.
    pub fn on_store(config: EngineConfig, store: Arc<SqliteStore>) -> Self {
        let skills = ScriptedSkills::new();
        let sink = Arc::new(RecordingSink::default());
        let fleet = Fleet::builder(
            config,
            store.clone(),
            store.clone(),
            store.clone(),
            skills.clone(),
        )
        .notifier(sink.clone())
        .build();
        Self {
            fleet: Arc::new(fleet),
            store,
            skills,
            sink,
        }
    }

    /// Publish a platform sequence and a platform route to it.
    pub fn platform_sequence(&self, event_type: &str, key: &str, steps: Vec<Step>) {
        self.fleet
            .registry()
            .publish(SequenceDefinition::new(key, Scope::Platform, steps))
            .unwrap();
        self.store
            .upsert_route(&EventRoute::new(Scope::Platform, event_type, key, 0))
            .unwrap();
    }
}
