use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use fleet_core::error::{FleetError, Result};
use fleet_core::traits::{ConfigResolver, ModelSelector, SkillCall, SkillExecutor};
use fleet_core::types::{Context, OrgId, RunId, UserId};

/// What a local skill sees besides its input.
#[derive(Clone)]
pub struct SkillContext {
    pub run_id: RunId,
    pub sequence_key: String,
    pub step: String,
    pub org_id: OrgId,
    pub user_id: Option<UserId>,
    pub attempt: u32,
    /// Model selection owned by the host; None when not wired.
    pub models: Option<Arc<dyn ModelSelector>>,
    /// Hierarchical agent configuration owned by the host.
    pub config: Option<Arc<dyn ConfigResolver>>,
}

impl SkillContext {
    /// Resolve an agent config key for this step's org and user.
    pub async fn config_value(&self, agent_type: &str, key: &str) -> Result<Option<serde_json::Value>> {
        match &self.config {
            Some(resolver) => {
                resolver
                    .resolve_config(self.org_id, self.user_id, agent_type, key)
                    .await
            }
            None => Ok(None),
        }
    }
}

/// A skill executed in-process.
pub trait Skill: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn execute(&self, input: Context, ctx: SkillContext) -> BoxFuture<'_, Result<Context>>;
}

/// Adapter turning a closure into a [`Skill`].
pub struct FnSkill<F> {
    name: String,
    f: F,
}

impl<F> FnSkill<F>
where
    F: Fn(Context, SkillContext) -> BoxFuture<'static, Result<Context>> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Skill for FnSkill<F>
where
    F: Fn(Context, SkillContext) -> BoxFuture<'static, Result<Context>> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, input: Context, ctx: SkillContext) -> BoxFuture<'_, Result<Context>> {
        (self.f)(input, ctx)
    }
}

/// Registry of local skills. Skills it does not know go to the fallback
/// executor when one is set.
pub struct SkillRegistry {
    skills: HashMap<String, Arc<dyn Skill>>,
    fallback: Option<Arc<dyn SkillExecutor>>,
    models: Option<Arc<dyn ModelSelector>>,
    config: Option<Arc<dyn ConfigResolver>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self {
            skills: HashMap::new(),
            fallback: None,
            models: None,
            config: None,
        }
    }

    /// Register a skill.
    pub fn register(&mut self, skill: impl Skill) {
        let name = skill.name().to_string();
        self.skills.insert(name, Arc::new(skill));
    }

    /// Get a skill by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Skill>> {
        self.skills.get(name).cloned()
    }

    /// List registered skill names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.skills.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn SkillExecutor>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_models(mut self, models: Arc<dyn ModelSelector>) -> Self {
        self.models = Some(models);
        self
    }

    pub fn with_config(mut self, config: Arc<dyn ConfigResolver>) -> Self {
        self.config = Some(config);
        self
    }
}

impl Default for SkillRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SkillExecutor for SkillRegistry {
    fn execute(&self, call: SkillCall) -> BoxFuture<'_, Result<Context>> {
        Box::pin(async move {
            if let Some(skill) = self.get(&call.skill) {
                let ctx = SkillContext {
                    run_id: call.run_id,
                    sequence_key: call.sequence_key,
                    step: call.step,
                    org_id: call.org_id,
                    user_id: call.user_id,
                    attempt: call.attempt,
                    models: self.models.clone(),
                    config: self.config.clone(),
                };
                return skill.execute(call.input, ctx).await;
            }
            match &self.fallback {
                Some(fallback) => {
                    debug!(skill = %call.skill, step = %call.step, "Skill not local, using fallback");
                    fallback.execute(call).await
                }
                None => Err(FleetError::SkillNotFound(call.skill)),
            }
        })
    }
}
