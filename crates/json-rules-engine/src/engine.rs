//! 规则引擎
//!
//! 长生命周期的规则/操作符/事实/命名条件注册表，外加一次性的运行
//! 生命周期：解析事实 → 装入 Almanac → 规则按优先级降序分层并发求值 →
//! 结果与事件按完成序落账并派发。注册表的变更只允许发生在 setup 阶段，
//! 每次运行捕获一份不可变快照。

use crate::almanac::{Almanac, AlmanacOptions};
use crate::condition::Condition;
use crate::context::ExecutionContext;
use crate::error::{EngineError, Result};
use crate::events::{Event, EventBus, EventHandler, Outcome};
use crate::fact::{DynamicFactCallback, Fact, FactOptions, FactStore};
use crate::operators::{Operator, OperatorRegistry};
use crate::rule::{EvaluationServices, NamedConditions, Rule, RuleConfig, RuleResult};
use crate::value::ValueNode;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// 引擎配置
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineOptions {
    /// 未定义事实按 null 处理而非报错
    pub allow_undefined_facts: bool,
    /// 未注册的命名条件按 false 处理而非报错
    pub allow_undefined_conditions: bool,
    /// 出结果时把事件参数中的事实引用替换为实时值
    pub replace_facts_in_event_params: bool,
    /// 单个布尔节点的并发 worker 上限
    pub max_condition_concurrency: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            allow_undefined_facts: false,
            allow_undefined_conditions: false,
            replace_facts_in_event_params: false,
            max_condition_concurrency: 10,
        }
    }
}

/// 引擎状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Ready,
    Running,
    Finished,
}

/// 一次运行的完整产出
#[derive(Debug)]
pub struct RunOutcome {
    /// 本次运行的 Almanac（含完整事件日志与结果账本）
    pub almanac: Arc<Almanac>,
    /// 判真的规则结果
    pub results: Vec<RuleResult>,
    /// 判假或未求值的规则结果
    pub failure_results: Vec<RuleResult>,
    /// 成功事件（插入序）
    pub events: Vec<Event>,
    /// 失败事件（插入序）
    pub failure_events: Vec<Event>,
}

/// 规则引擎
pub struct Engine {
    rules: RwLock<Vec<Arc<Rule>>>,
    operators: OperatorRegistry,
    conditions: NamedConditions,
    facts: FactStore,
    options: EngineOptions,
    status: RwLock<EngineStatus>,
    prioritized: RwLock<Option<Vec<Vec<Arc<Rule>>>>>,
    bus: EventBus,
}

impl Engine {
    /// 创建引擎并装入默认操作符集
    pub fn new(options: EngineOptions) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            operators: OperatorRegistry::with_defaults(),
            conditions: Arc::new(DashMap::new()),
            facts: FactStore::new(),
            options,
            status: RwLock::new(EngineStatus::Ready),
            prioritized: RwLock::new(None),
            bus: EventBus::new(),
        }
    }

    /// 创建引擎并批量装入规则
    pub fn with_rules(rules: Vec<Rule>, options: EngineOptions) -> Self {
        let engine = Self::new(options);
        engine.add_rules(rules);
        engine
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.read()
    }

    pub fn options(&self) -> EngineOptions {
        self.options
    }

    // ==================== 规则管理 ====================

    /// 注册规则，返回共享句柄（可用于按身份移除或追加订阅）
    pub fn add_rule(&self, rule: Rule) -> Arc<Rule> {
        info!(rule = rule.name(), priority = rule.priority(), "注册规则");
        let rule = Arc::new(rule);
        self.rules.write().push(rule.clone());
        self.invalidate_prioritized();
        rule
    }

    /// 从配置注册规则
    pub fn add_rule_from_config(&self, config: RuleConfig) -> Result<Arc<Rule>> {
        Ok(self.add_rule(Rule::new(config)?))
    }

    /// 从规则 JSON 注册规则
    pub fn add_rule_from_json(&self, text: &str) -> Result<Arc<Rule>> {
        Ok(self.add_rule(Rule::from_json(text)?))
    }

    /// 批量注册规则
    pub fn add_rules(&self, rules: Vec<Rule>) -> Vec<Arc<Rule>> {
        rules.into_iter().map(|rule| self.add_rule(rule)).collect()
    }

    /// 按名称替换既有规则
    pub fn update_rule(&self, rule: Rule) -> Result<Arc<Rule>> {
        let mut rules = self.rules.write();
        let Some(index) = rules.iter().position(|r| r.name() == rule.name()) else {
            return Err(EngineError::InvalidRule(format!(
                "更新的规则不存在: {}",
                rule.name()
            )));
        };
        info!(rule = rule.name(), "更新规则");
        let rule = Arc::new(rule);
        rules[index] = rule.clone();
        drop(rules);
        self.invalidate_prioritized();
        Ok(rule)
    }

    /// 按身份移除规则，返回是否存在
    pub fn remove_rule(&self, rule: &Arc<Rule>) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| !Arc::ptr_eq(r, rule));
        let removed = rules.len() != before;
        drop(rules);
        if removed {
            self.invalidate_prioritized();
        }
        removed
    }

    /// 按名称移除规则，返回是否存在
    pub fn remove_rule_by_name(&self, name: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.name() != name);
        let removed = rules.len() != before;
        drop(rules);
        if removed {
            info!(rule = name, "移除规则");
            self.invalidate_prioritized();
        }
        removed
    }

    /// 当前规则快照（注册序）
    pub fn rules(&self) -> Vec<Arc<Rule>> {
        self.rules.read().clone()
    }

    /// 规则按优先级降序分层，结果缓存到下一次注册表变更
    pub fn prioritize_rules(&self) -> Vec<Vec<Arc<Rule>>> {
        if let Some(cached) = self.prioritized.read().as_ref() {
            return cached.clone();
        }

        let mut tiers: BTreeMap<i64, Vec<Arc<Rule>>> = BTreeMap::new();
        for rule in self.rules.read().iter() {
            tiers.entry(rule.priority()).or_default().push(rule.clone());
        }
        let computed: Vec<Vec<Arc<Rule>>> = tiers.into_values().rev().collect();

        *self.prioritized.write() = Some(computed.clone());
        computed
    }

    fn invalidate_prioritized(&self) {
        *self.prioritized.write() = None;
    }

    // ==================== 操作符管理 ====================

    /// 注册自定义操作符，同名覆盖
    pub fn add_operator(&self, operator: Operator) {
        self.operators.register(operator);
    }

    /// 以名称 + 回调注册自定义操作符
    pub fn add_operator_fn(
        &self,
        name: impl Into<String>,
        callback: impl Fn(&ValueNode, &ValueNode) -> bool + Send + Sync + 'static,
    ) -> Result<()> {
        self.operators.register(Operator::new(name, callback)?);
        Ok(())
    }

    /// 移除操作符，返回是否存在
    pub fn remove_operator(&self, name: &str) -> bool {
        self.operators.remove(name)
    }

    // ==================== 事实管理 ====================

    /// 注册静态事实
    pub fn add_fact(
        &self,
        path: impl Into<String>,
        value: ValueNode,
        options: Option<FactOptions>,
    ) -> Result<()> {
        let fact = Fact::new_static(path, value, options.unwrap_or_default())?;
        self.facts.set(fact);
        Ok(())
    }

    /// 注册动态（计算）事实
    pub fn add_calculated_fact(
        &self,
        path: impl Into<String>,
        callback: DynamicFactCallback,
        options: Option<FactOptions>,
    ) -> Result<()> {
        let fact = Fact::new_dynamic(path, callback, options.unwrap_or_default())?;
        self.facts.set(fact);
        Ok(())
    }

    /// 移除事实，返回是否存在
    pub fn remove_fact(&self, path: &str) -> bool {
        self.facts.delete(path)
    }

    pub fn get_fact(&self, path: &str) -> Option<Arc<Fact>> {
        self.facts.get(path)
    }

    // ==================== 命名条件管理 ====================

    /// 注册可复用的命名条件
    ///
    /// 根节点必须是 all / any / not 或条件引用。
    pub fn set_condition(&self, name: impl Into<String>, condition: Condition) -> Result<()> {
        if !condition.is_boolean_operator() && !condition.is_reference() {
            return Err(EngineError::InvalidCondition(
                "命名条件的根节点必须是 all、any、not 或条件引用".to_string(),
            ));
        }
        condition.validate()?;
        let name = name.into();
        debug!(name = %name, "注册命名条件");
        self.conditions.insert(name, condition);
        Ok(())
    }

    /// 移除命名条件，返回是否存在
    pub fn remove_condition(&self, name: &str) -> bool {
        self.conditions.remove(name).is_some()
    }

    // ==================== 事件订阅 ====================

    /// 订阅引擎总线
    ///
    /// 内置主题：`success` / `failure`；规则判真时还会以事件自身的
    /// type 作为主题发布一次。
    pub fn subscribe(&self, topic: impl Into<String>, handler: EventHandler) {
        self.bus.subscribe(topic, handler);
    }

    // ==================== 运行 ====================

    /// 强制引擎进入 finished，跳过尚未调度的优先级层
    pub fn stop(&self) {
        info!("engine 被要求停止");
        *self.status.write() = EngineStatus::Finished;
    }

    /// 以 JSON 字节为事实输入运行
    pub async fn run(&self, facts: &[u8]) -> Result<RunOutcome> {
        let root = ValueNode::parse(facts)?;
        self.run_parsed(root, None).await
    }

    /// 以已构造的 JSON 对象为事实输入运行
    pub async fn run_with_map(
        &self,
        facts: serde_json::Map<String, serde_json::Value>,
    ) -> Result<RunOutcome> {
        self.run_parsed(ValueNode::from(serde_json::Value::Object(facts)), None)
            .await
    }

    /// 运行并桥接外部关停信号：信号触发后未开始的求值全部短路
    pub async fn run_with_shutdown(
        &self,
        facts: &[u8],
        shutdown: watch::Receiver<bool>,
    ) -> Result<RunOutcome> {
        let root = ValueNode::parse(facts)?;
        self.run_parsed(root, Some(shutdown)).await
    }

    async fn run_parsed(
        &self,
        root: ValueNode,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> Result<RunOutcome> {
        debug!("engine 开始运行");
        *self.status.write() = EngineStatus::Running;

        let outcome = self.run_internal(root, shutdown).await;

        // 运行结束后引擎不得停留在 running，错误路径同样收口
        *self.status.write() = EngineStatus::Finished;
        debug!("engine 运行结束");
        outcome
    }

    async fn run_internal(
        &self,
        root: ValueNode,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> Result<RunOutcome> {
        let rule_count = self.rules.read().len();
        let almanac = Arc::new(Almanac::with_capacity(
            root,
            AlmanacOptions {
                allow_undefined_facts: self.options.allow_undefined_facts,
                path_resolver: None,
            },
            rule_count,
        ));

        // 装入引擎注册的事实；动态事实在此强制首算，回调 panic 兜底
        let seeded = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            for fact in self.facts.entries() {
                almanac.seed_fact(fact);
            }
        }));
        if seeded.is_err() {
            warn!("动态事实计算发生 panic，本次运行中止");
            return Err(EngineError::Internal(
                "动态事实计算发生 panic".to_string(),
            ));
        }

        let ctx = Arc::new(ExecutionContext::new());
        if let Some(mut shutdown) = shutdown {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                // 外部关停信号桥接为运行取消
                loop {
                    if *shutdown.borrow() {
                        ctx.cancel();
                        break;
                    }
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            });
        }

        let services = Arc::new(EvaluationServices {
            operators: self.operators.clone(),
            conditions: self.conditions.clone(),
            facts: self.facts.clone(),
            allow_undefined_conditions: self.options.allow_undefined_conditions,
            replace_facts_in_event_params: self.options.replace_facts_in_event_params,
            max_condition_concurrency: self.options.max_condition_concurrency,
        });

        for tier in self.prioritize_rules() {
            self.evaluate_rules(&tier, &almanac, &ctx, &services).await?;
            if ctx.stop_early() {
                debug!(reason = %ctx.message(), "提前终止，跳过后续优先级层");
                break;
            }
        }

        let mut results = Vec::new();
        let mut failure_results = Vec::new();
        for result in almanac.get_results() {
            if result.result == Some(true) {
                results.push(result);
            } else {
                failure_results.push(result);
            }
        }

        Ok(RunOutcome {
            results,
            failure_results,
            events: almanac.get_events(Some(Outcome::Success)),
            failure_events: almanac.get_events(Some(Outcome::Failure)),
            almanac,
        })
    }

    /// 并发求值一个优先级层内的所有规则
    ///
    /// 结果按完成序收集：落账、记事件、派发总线，单线程逐条处理，
    /// 事件日志顺序即规则完成顺序。
    async fn evaluate_rules(
        &self,
        rules: &[Arc<Rule>],
        almanac: &Arc<Almanac>,
        ctx: &Arc<ExecutionContext>,
        services: &Arc<EvaluationServices>,
    ) -> Result<()> {
        if *self.status.read() != EngineStatus::Running {
            debug!("engine 状态已非 running，跳过剩余规则");
            return Ok(());
        }

        let mut join_set: JoinSet<Result<RuleResult>> = JoinSet::new();
        for rule in rules {
            if ctx.stop_early() {
                break;
            }
            let rule = rule.clone();
            // 每条规则继承独立的子作用域：规则内部的短路取消不波及
            // 同层已在途的兄弟规则
            let rule_ctx = Arc::new(ctx.child());
            let almanac = almanac.clone();
            let services = services.clone();
            join_set.spawn(async move { rule.evaluate(rule_ctx, almanac, services).await });
        }

        while let Some(joined) = join_set.join_next().await {
            let rule_result = match joined {
                Ok(Ok(result)) => result,
                // 任一规则报错即中止本次运行，已完成规则的结果保留在 almanac
                Ok(Err(error)) => return Err(error),
                Err(join_error) => {
                    return Err(EngineError::Internal(format!(
                        "规则求值任务异常: {join_error}"
                    )));
                }
            };

            debug!(
                rule = %rule_result.name,
                result = ?rule_result.result,
                "收到规则结果"
            );
            almanac.add_result(rule_result.clone());

            let shared = Arc::new(rule_result);
            if shared.result == Some(true) {
                almanac.add_event(shared.event.clone(), Outcome::Success);
                self.bus
                    .publish(Outcome::Success.as_str(), &shared.event, almanac, &shared);
                self.bus
                    .publish(&shared.event.event_type, &shared.event, almanac, &shared);
            } else {
                almanac.add_event(shared.event.clone(), Outcome::Failure);
                self.bus
                    .publish(Outcome::Failure.as_str(), &shared.event, almanac, &shared);
            }
        }

        Ok(())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("rules", &self.rules.read().len())
            .field("operators", &self.operators.len())
            .field("facts", &self.facts.len())
            .field("status", &self.status())
            .finish()
    }
}
