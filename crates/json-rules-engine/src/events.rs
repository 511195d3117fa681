//! 事件模型与进程内事件总线
//!
//! 规则命中或落空时派发事件。总线按主题名组织回调列表，发布为
//! fire-and-forget：每个订阅者在独立任务中异步执行，发布方不等待、
//! 订阅者的失败不影响求值流程。

use crate::almanac::Almanac;
use crate::error::EngineError;
use crate::fact::FactParams;
use crate::rule::RuleResult;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// 规则事件
///
/// params 中的条目可以是字面值，也可以是 `{ "fact": path }` 形式的
/// 事实引用；开启 `replace_facts_in_event_params` 时在出结果的时刻
/// 替换为实时解析出的事实值。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "FactParams::is_empty")]
    pub params: FactParams,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            params: FactParams::new(),
        }
    }

    pub fn with_params(event_type: impl Into<String>, params: FactParams) -> Self {
        Self {
            event_type: event_type.into(),
            params,
        }
    }
}

/// 事件结果归属
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Outcome {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            other => Err(EngineError::InvalidOutcome(other.to_string())),
        }
    }
}

/// 事件订阅回调
///
/// 回调收到事件本体、本次运行的 Almanac 以及触发事件的规则结果。
pub type EventHandler = Arc<dyn Fn(&Event, &Almanac, &RuleResult) + Send + Sync>;

/// 进程内事件总线
///
/// 主题名 → 回调列表。发布方逐个订阅者 spawn 独立任务，互不阻塞。
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<DashMap<String, Vec<EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅主题
    pub fn subscribe(&self, topic: impl Into<String>, handler: EventHandler) {
        let topic = topic.into();
        debug!(topic = %topic, "订阅事件主题");
        self.handlers.entry(topic).or_default().push(handler);
    }

    /// 主题下的订阅者数量
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.handlers.get(topic).map(|h| h.len()).unwrap_or(0)
    }

    /// 发布事件（fire-and-forget）
    ///
    /// 必须在 tokio 运行时内调用；没有订阅者时不产生任何任务。
    pub fn publish(
        &self,
        topic: &str,
        event: &Event,
        almanac: &Arc<Almanac>,
        result: &Arc<RuleResult>,
    ) {
        let handlers = match self.handlers.get(topic) {
            Some(entry) if !entry.is_empty() => entry.value().clone(),
            _ => return,
        };

        debug!(topic = %topic, subscribers = handlers.len(), "发布事件");
        for handler in handlers {
            let topic = topic.to_string();
            let event = event.clone();
            let almanac = almanac.clone();
            let result = result.clone();
            tokio::spawn(async move {
                // 订阅回调的 panic 记录后吞掉，不影响求值流程
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    handler(&event, &almanac, &result)
                }));
                if outcome.is_err() {
                    warn!(topic = %topic, "事件订阅回调 panic，已忽略");
                }
            });
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("topics", &self.handlers.len())
            .finish()
    }
}
