pub mod approval;
pub mod completion;
pub mod dispatch;
pub mod executor;
pub mod fleet;
pub mod handoff;
pub mod notify;
pub mod preference;
pub mod registry;
pub mod routing;
pub mod skills;

pub use approval::ApprovalBroker;
pub use completion::{CompletionBroker, DispatchingExecutor};
pub use dispatch::{Dispatcher, HttpTransport, Transport};
pub use executor::{ExecutorConfig, SequenceExecutor};
pub use fleet::{EventDisposition, EventOutcome, Fleet};
pub use handoff::HandoffEngine;
pub use notify::{LogNotifier, WebhookNotifier};
pub use preference::{PreferenceDecision, PreferenceGate};
pub use registry::{SequenceRegistry, ValidatedSequence};
pub use routing::{RouteMatch, RouteResolver};
pub use skills::{FnSkill, Skill, SkillContext, SkillRegistry};
