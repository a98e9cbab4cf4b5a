//! Skills: declarative multi-step tool workflows
//!
//! A skill names the tools it needs and lists steps that run in order.
//! Tool steps run through the same governed pipeline as direct invocations
//! and store their results in an output bag; assertions check the bag as
//! preconditions or postconditions. When a step fails the run halts and
//! the rollback steps run in reverse order.
//!
//! # Example
//!
//! ```rust
//! use ostiary_core::skills::SkillDefinition;
//!
//! let skill = SkillDefinition::from_yaml(r#"
//! name: hash-text
//! version: 1.0.0
//! required_tools: [sha256]
//! steps:
//!   - type: tool
//!     id: hash
//!     tool: sha256
//!     input: { text: "{{input.text}}" }
//!   - type: assert
//!     id: has-digest
//!     predicate: { op: exists, path: hash.digest }
//! "#).unwrap();
//!
//! assert_eq!(skill.steps.len(), 2);
//! assert!(skill.validate().is_ok());
//! ```

mod runner;
mod skill;

pub use runner::{
    INPUT_KEY, RunState, SkillRunResult, SkillRunner, StepKind, StepOutcome, StepStatus,
    ToolInvoker,
};
pub use skill::{
    AssertPhase, AssertStep, Predicate, PredicateFn, SkillDefinition, SkillStep, ToolStep,
    render_template, resolve_path,
};
