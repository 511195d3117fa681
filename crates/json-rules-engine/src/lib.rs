//! JSON 驱动的规则引擎
//!
//! 规则完全以数据（JSON）编写：声明式的条件树 + 事实文档，引擎判定
//! 条件树是否为真，产出结构化结果并派发成功/失败事件。支持：
//! - 布尔组合（all / any / not）与命名条件复用
//! - 优先级分层、短路求值、层内并发（信号量限流）与协作式取消
//! - 事实仓库：静态 / 动态（计算）事实，按 (路径, params) 记忆化
//! - 严格类型比较的默认操作符集与自定义操作符注册
//! - 进程内事件总线，fire-and-forget 派发
//!
//! ```no_run
//! use json_rules_engine::{Engine, EngineOptions};
//!
//! # async fn demo() -> json_rules_engine::Result<()> {
//! let engine = Engine::new(EngineOptions::default());
//! engine.add_rule_from_json(r#"{
//!     "name": "foulOut",
//!     "conditions": {"any": [
//!         {"all": [
//!             {"fact": "gameDuration", "operator": "equal", "value": 40},
//!             {"fact": "personalFoulCount", "operator": "greaterThanInclusive", "value": 5}
//!         ]},
//!         {"all": [
//!             {"fact": "gameDuration", "operator": "equal", "value": 48},
//!             {"fact": "personalFoulCount", "operator": "greaterThanInclusive", "value": 6}
//!         ]}
//!     ]},
//!     "event": {"type": "fouledOut"}
//! }"#)?;
//!
//! let outcome = engine.run(br#"{"personalFoulCount": 6, "gameDuration": 40}"#).await?;
//! assert_eq!(outcome.events[0].event_type, "fouledOut");
//! # Ok(())
//! # }
//! ```

pub mod almanac;
pub mod condition;
pub mod context;
pub mod debug;
pub mod engine;
pub mod error;
pub mod events;
pub mod fact;
pub mod operators;
pub mod rule;
pub mod value;

pub use almanac::{Almanac, AlmanacOptions, PathResolver, default_path_resolver};
pub use condition::{
    BooleanCondition, Condition, ConditionEvaluation, ConditionReference, LeafCondition,
    NotCondition,
};
pub use context::ExecutionContext;
pub use debug::{debug_enabled, init_debug_logging};
pub use engine::{Engine, EngineOptions, EngineStatus, RunOutcome};
pub use error::{EngineError, Result};
pub use events::{Event, EventBus, EventHandler, Outcome};
pub use fact::{DynamicFactCallback, Fact, FactOptions, FactParams, FactStore};
pub use operators::{Operator, OperatorRegistry, default_operators};
pub use rule::{EventConfig, Rule, RuleConfig, RuleResult};
pub use value::ValueNode;
