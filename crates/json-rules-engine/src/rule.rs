//! 规则与规则求值
//!
//! 规则把条件树、事件模板和优先级绑在一起。每次求值先把条件树克隆为
//! 单次运行的快照，叶子的 `fact_result` / `result` 写回落在快照上，
//! 规则定义保持不可变，并发运行互不干扰。
//!
//! 布尔节点的子条件按有效优先级分层，层内并发求值（计数信号量限流），
//! 层间按降序短路：`any` 在首个为真的层返回，`all` 在任一为假的层失败。

use crate::almanac::Almanac;
use crate::condition::{BooleanCondition, Condition, NotCondition};
use crate::context::ExecutionContext;
use crate::error::{EngineError, Result};
use crate::events::{Event, EventBus, EventHandler, Outcome};
use crate::fact::{FactParams, FactStore};
use crate::operators::OperatorRegistry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

/// 引擎上注册的命名条件表
pub(crate) type NamedConditions = Arc<DashMap<String, Condition>>;

/// 单次运行捕获的求值依赖快照
///
/// 运行期间对引擎的注册表不做写操作，规则求值只读取这份快照，
/// 避免与 setup 阶段的变更交错。
#[derive(Clone)]
pub(crate) struct EvaluationServices {
    pub operators: OperatorRegistry,
    pub conditions: NamedConditions,
    pub facts: FactStore,
    pub allow_undefined_conditions: bool,
    pub replace_facts_in_event_params: bool,
    /// 单个布尔节点的并发上限
    pub max_condition_concurrency: usize,
}

/// 规则事件模板配置
#[derive(Debug, Clone, Deserialize)]
pub struct EventConfig {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub params: Option<FactParams>,
}

/// 规则配置
///
/// 可直接由规则 JSON 反序列化；成功/失败回调只能程序化设置。
#[derive(Clone, Deserialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    pub conditions: Condition,
    pub event: EventConfig,
    #[serde(skip)]
    pub on_success: Option<EventHandler>,
    #[serde(skip)]
    pub on_failure: Option<EventHandler>,
}

/// 规则
pub struct Rule {
    name: String,
    priority: i64,
    conditions: Condition,
    event: Event,
    bus: EventBus,
}

impl Rule {
    pub fn new(config: RuleConfig) -> Result<Self> {
        let priority = config.priority.unwrap_or(1);
        if priority <= 0 {
            return Err(EngineError::InvalidRule(
                "规则优先级必须大于零".to_string(),
            ));
        }
        if config.event.event_type.is_empty() {
            return Err(EngineError::InvalidRule(
                "规则必须提供事件类型".to_string(),
            ));
        }
        config.conditions.validate()?;

        let bus = EventBus::new();
        if let Some(handler) = config.on_success {
            bus.subscribe(Outcome::Success.as_str(), handler);
        }
        if let Some(handler) = config.on_failure {
            bus.subscribe(Outcome::Failure.as_str(), handler);
        }

        Ok(Self {
            name: config.name.unwrap_or_default(),
            priority,
            conditions: config.conditions,
            event: Event {
                event_type: config.event.event_type,
                params: config.event.params.unwrap_or_default(),
            },
            bus,
        })
    }

    /// 从规则 JSON 严格解析
    pub fn from_json(text: &str) -> Result<Self> {
        let config: RuleConfig = serde_json::from_str(text)?;
        Self::new(config)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn conditions(&self) -> &Condition {
        &self.conditions
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    /// 订阅本规则的成功事件
    pub fn on_success(&self, handler: EventHandler) {
        self.bus.subscribe(Outcome::Success.as_str(), handler);
    }

    /// 订阅本规则的失败事件
    pub fn on_failure(&self, handler: EventHandler) {
        self.bus.subscribe(Outcome::Failure.as_str(), handler);
    }

    /// 序列化视图
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "name": self.name,
            "priority": self.priority,
            "conditions": self.conditions.to_json()?,
            "event": serde_json::to_value(&self.event)?,
        }))
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_json()?)?)
    }

    /// 求值规则，返回带条件快照的结果
    ///
    /// 结果确定后在规则自身的总线上发布 success / failure 事件
    /// （fire-and-forget），随后才把结果交还引擎。
    pub(crate) async fn evaluate(
        &self,
        ctx: Arc<ExecutionContext>,
        almanac: Arc<Almanac>,
        services: Arc<EvaluationServices>,
    ) -> Result<RuleResult> {
        debug!(rule = %self.name, "开始求值规则");
        let (result, snapshot) = eval_node(
            self.conditions.clone(),
            ctx.clone(),
            almanac.clone(),
            services.clone(),
        )
        .await?;

        // 根节点短路：any 命中或 all 落空时标记提前终止并取消本规则
        // 作用域，引擎据运行级标记跳过尚未调度的优先级层。按求值后的
        // 快照判断形态，条件引用因此以展开后的节点为准。
        match &snapshot {
            Condition::Any(_) if result => {
                ctx.trigger_stop_early("any 条件成功，提前终止");
            }
            Condition::All(_) if !result => {
                ctx.trigger_stop_early("all 条件失败，提前终止");
            }
            _ => {}
        }

        let mut rule_result = RuleResult {
            name: self.name.clone(),
            priority: self.priority,
            conditions: snapshot,
            event: self.event.clone(),
            result: Some(result),
        };

        if services.replace_facts_in_event_params {
            rule_result.resolve_event_params(&almanac)?;
        }

        let outcome = if result {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        let shared = Arc::new(rule_result.clone());
        self.bus
            .publish(outcome.as_str(), &shared.event, &almanac, &shared);

        debug!(rule = %self.name, result, "规则求值完成");
        Ok(rule_result)
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("event", &self.event.event_type)
            .finish()
    }
}

/// 规则求值结果
#[derive(Debug, Clone, Serialize)]
pub struct RuleResult {
    pub name: String,
    pub priority: i64,
    /// 求值后的条件快照，叶子带 factResult / result
    pub conditions: Condition,
    /// 解析完成的事件（开启参数替换时事实引用已替换为实时值）
    pub event: Event,
    /// 三态结果：未求值 / 真 / 假
    pub result: Option<bool>,
}

impl RuleResult {
    /// 事件参数中的事实引用替换为实时解析出的值
    pub(crate) fn resolve_event_params(&mut self, almanac: &Almanac) -> Result<()> {
        for value in self.event.params.values_mut() {
            *value = almanac.get_value(value)?;
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// 聚合方式
#[derive(Clone, Copy)]
enum Aggregate {
    All,
    Any,
}

/// 递归求值条件节点
///
/// 返回布尔结果与求值后的快照子树；父节点按原序组装子快照，
/// 聚合因此与调度顺序无关。
pub(crate) fn eval_node(
    condition: Condition,
    ctx: Arc<ExecutionContext>,
    almanac: Arc<Almanac>,
    services: Arc<EvaluationServices>,
) -> Pin<Box<dyn Future<Output = Result<(bool, Condition)>> + Send>> {
    Box::pin(async move {
        // 已取消的求值不再访问 Almanac，快照保持未求值状态
        if ctx.is_cancelled() {
            return Ok((false, condition));
        }

        match condition {
            Condition::Leaf(mut leaf) => {
                let eval = leaf.evaluate(&almanac, &services.operators)?;
                leaf.fact_result = Some(eval.lhs);
                leaf.result = Some(eval.result);
                Ok((eval.result, Condition::Leaf(leaf)))
            }
            Condition::Ref(reference) => {
                let named = services
                    .conditions
                    .get(&reference.name)
                    .map(|entry| entry.value().clone());
                match named {
                    Some(resolved) => {
                        debug!(name = %reference.name, "展开命名条件");
                        // 快照中引用节点被展开后的子树替换
                        eval_node(resolved, ctx, almanac, services).await
                    }
                    None if services.allow_undefined_conditions => {
                        Ok((false, Condition::Ref(reference)))
                    }
                    None => Err(EngineError::UndefinedCondition(reference.name)),
                }
            }
            Condition::Not(not) => {
                let NotCondition {
                    priority,
                    name,
                    child,
                } = not;
                let (child_result, child_snapshot) =
                    eval_node(*child, ctx, almanac, services).await?;
                Ok((
                    !child_result,
                    Condition::Not(NotCondition {
                        priority,
                        name,
                        child: Box::new(child_snapshot),
                    }),
                ))
            }
            Condition::All(group) => {
                let BooleanCondition {
                    priority,
                    name,
                    children,
                } = group;
                let (result, children) =
                    eval_group(children, Aggregate::All, ctx, almanac, services).await?;
                Ok((
                    result,
                    Condition::All(BooleanCondition {
                        priority,
                        name,
                        children,
                    }),
                ))
            }
            Condition::Any(group) => {
                let BooleanCondition {
                    priority,
                    name,
                    children,
                } = group;
                let (result, children) =
                    eval_group(children, Aggregate::Any, ctx, almanac, services).await?;
                Ok((
                    result,
                    Condition::Any(BooleanCondition {
                        priority,
                        name,
                        children,
                    }),
                ))
            }
        }
    })
}

/// 按优先级分层并发求值一组子条件
///
/// 未被求值的子条件（后续层被短路、或被取消的 worker）在快照中
/// 保留原始节点；其槽位按 false 计入，聚合结果只在未触发提前终止时
/// 可信。
async fn eval_group(
    children: Vec<Condition>,
    aggregate: Aggregate,
    ctx: Arc<ExecutionContext>,
    almanac: Arc<Almanac>,
    services: Arc<EvaluationServices>,
) -> Result<(bool, Vec<Condition>)> {
    if children.is_empty() {
        // 空组语义：all 为真空真，any 为假
        return Ok((matches!(aggregate, Aggregate::All), Vec::new()));
    }
    if children.len() == 1 {
        // 单个子条件直接求值，跳过分层
        let child = children.into_iter().next().expect("单元素组非空");
        let (result, snapshot) = eval_node(child, ctx, almanac, services).await?;
        return Ok((result, vec![snapshot]));
    }

    let tiers = prioritize_children(&children, &services.facts);

    let mut slots: Vec<Option<Condition>> = (0..children.len()).map(|_| None).collect();
    let mut originals: Vec<Option<Condition>> = children.into_iter().map(Some).collect();
    let mut outcome = matches!(aggregate, Aggregate::All);

    for tier in tiers {
        if ctx.is_cancelled() {
            break;
        }

        let semaphore = Arc::new(Semaphore::new(services.max_condition_concurrency));
        let mut join_set: JoinSet<(usize, Result<(bool, Condition)>)> = JoinSet::new();

        for index in tier {
            let Some(child) = originals[index].take() else {
                continue;
            };
            let semaphore = semaphore.clone();
            let ctx = ctx.clone();
            let almanac = almanac.clone();
            let services = services.clone();
            join_set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (index, Ok((false, child))),
                };
                // 未开始的 worker 观察到取消信号后立即返回未求值快照
                if ctx.is_cancelled() {
                    return (index, Ok((false, child)));
                }
                (index, eval_node(child, ctx, almanac, services).await)
            });
        }

        // 等全部 worker 结束再聚合；已启动的 worker 即便出现短路
        // 也会写完自己的槽位
        let mut tier_error: Option<EngineError> = None;
        let mut tier_results: Vec<bool> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, Ok((result, snapshot)))) => {
                    tier_results.push(result);
                    slots[index] = Some(snapshot);
                }
                Ok((_, Err(e))) => {
                    if tier_error.is_none() {
                        tier_error = Some(e);
                    }
                }
                Err(join_err) => {
                    if tier_error.is_none() {
                        tier_error =
                            Some(EngineError::Internal(format!("条件求值任务异常: {join_err}")));
                    }
                }
            }
        }
        if let Some(error) = tier_error {
            return Err(error);
        }

        match aggregate {
            Aggregate::All => {
                // 任一层出现 false 即整体失败，后续层不再调度
                if tier_results.iter().any(|result| !result) {
                    outcome = false;
                    break;
                }
            }
            Aggregate::Any => {
                // 首个为真的层即整体成功
                if tier_results.iter().any(|result| *result) {
                    outcome = true;
                    break;
                }
            }
        }
    }

    let snapshots = slots
        .into_iter()
        .zip(originals)
        .map(|(slot, original)| match slot {
            Some(snapshot) => snapshot,
            None => original.expect("槽位与原始节点互斥"),
        })
        .collect();
    Ok((outcome, snapshots))
}

/// 子条件按有效优先级分层，层按降序排列
///
/// 有效优先级：节点自身 priority → 叶子引用事实的 priority → 0。
fn prioritize_children(children: &[Condition], facts: &FactStore) -> Vec<Vec<usize>> {
    let mut tiers: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (index, child) in children.iter().enumerate() {
        let priority = child.priority().unwrap_or_else(|| match child {
            Condition::Leaf(leaf) => facts
                .get(&leaf.fact)
                .map(|fact| fact.priority())
                .unwrap_or(0),
            _ => 0,
        });
        tiers.entry(priority).or_default().push(index);
    }
    tiers.into_values().rev().collect()
}
