//! Almanac：单次运行的事实解析与事件账本
//!
//! 解析顺序：结果缓存 → 注册的事实（静态/动态）→ 原始事实 JSON 的
//! 路径查找。动态事实的计算结果按缓存键（路径 + params）记忆化，
//! 单次运行内至多计算一次。事件日志与规则结果按插入序保留。

use crate::error::{EngineError, Result};
use crate::events::{Event, Outcome};
use crate::fact::{Fact, FactParams, FactStore};
use crate::rule::RuleResult;
use crate::value::ValueNode;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// 路径解析函数：在 JSON 值树内解析点分路径
pub type PathResolver = Arc<dyn Fn(&ValueNode, &str) -> Option<ValueNode> + Send + Sync>;

/// 默认路径解析：点分路径，对象按键取值，数组支持数字下标
/// （如 `order.items.0.name`）
pub fn default_path_resolver() -> PathResolver {
    Arc::new(|root: &ValueNode, path: &str| {
        let mut current = root;
        for part in path.split('.') {
            match current {
                ValueNode::Object(map) => {
                    current = map.get(part)?;
                }
                ValueNode::Array(items) => {
                    let index: usize = part.parse().ok()?;
                    current = items.get(index)?;
                }
                _ => return None,
            }
        }
        Some(current.clone())
    })
}

/// Almanac 构建选项
#[derive(Clone, Default)]
pub struct AlmanacOptions {
    pub allow_undefined_facts: bool,
    /// 自定义路径解析；缺省使用点分路径解析
    pub path_resolver: Option<PathResolver>,
}

#[derive(Debug, Default)]
struct EventLog {
    success: Vec<Event>,
    failure: Vec<Event>,
}

/// 单次运行的事实解析缓存与事件账本
pub struct Almanac {
    raw_facts: ValueNode,
    facts: FactStore,
    cache: DashMap<String, ValueNode>,
    allow_undefined_facts: bool,
    path_resolver: PathResolver,
    events: Mutex<EventLog>,
    results: Mutex<Vec<RuleResult>>,
}

impl Almanac {
    pub fn new(raw_facts: ValueNode, options: AlmanacOptions) -> Self {
        Self::with_capacity(raw_facts, options, 0)
    }

    /// 预留规则结果容量（通常为引擎中的规则数）
    pub fn with_capacity(
        raw_facts: ValueNode,
        options: AlmanacOptions,
        results_capacity: usize,
    ) -> Self {
        Self {
            raw_facts,
            facts: FactStore::new(),
            cache: DashMap::new(),
            allow_undefined_facts: options.allow_undefined_facts,
            path_resolver: options.path_resolver.unwrap_or_else(default_path_resolver),
            events: Mutex::new(EventLog::default()),
            results: Mutex::new(Vec::with_capacity(results_capacity)),
        }
    }

    /// 原始事实 JSON 根
    pub fn raw_facts(&self) -> &ValueNode {
        &self.raw_facts
    }

    /// 把事实装入本次运行
    ///
    /// 静态事实立即写入缓存；动态事实强制一次首算并缓存结果
    /// （关闭缓存的动态事实只注册，不预热）。
    pub fn seed_fact(&self, fact: Arc<Fact>) {
        let empty = FactParams::new();
        if let Some(key) = fact.cache_key(&empty) {
            let value = fact.calculate(self, &empty);
            self.cache.insert(key, value);
        }
        debug!(path = fact.path(), "almanac 装入事实");
        self.facts.set_shared(fact);
    }

    /// 运行期显式插入静态事实
    pub fn add_runtime_fact(&self, path: impl Into<String>, value: ValueNode) -> Result<()> {
        let path = path.into();
        debug!(path = %path, "almanac 插入运行期事实");
        let fact = Fact::new_static(path, value, Default::default())?;
        self.seed_fact(Arc::new(fact));
        Ok(())
    }

    /// 解析事实值
    ///
    /// `extract_path` 存在时在解析出的值上做二次路径提取（值必须是
    /// 对象或数组，否则原样返回）。
    pub fn fact_value(
        &self,
        path: &str,
        params: &FactParams,
        extract_path: Option<&str>,
    ) -> Result<ValueNode> {
        // 1. 注册的事实：按缓存键记忆化
        if let Some(fact) = self.facts.get(path) {
            let value = match fact.cache_key(params) {
                Some(key) => {
                    if let Some(hit) = self.cache.get(&key) {
                        debug!(path = %path, "almanac 缓存命中");
                        hit.clone()
                    } else {
                        debug!(path = %path, "almanac 缓存未命中，计算事实");
                        let value = fact.calculate(self, params);
                        self.cache.insert(key, value.clone());
                        value
                    }
                }
                // 关闭缓存的事实每次重算
                None => fact.calculate(self, params),
            };
            return self.extract(value, extract_path, path);
        }

        // 2. 原始事实 JSON 的路径查找，结果按路径缓存
        if let Some(hit) = self.cache.get(path) {
            debug!(path = %path, "almanac 缓存命中");
            return self.extract(hit.clone(), extract_path, path);
        }
        match (self.path_resolver)(&self.raw_facts, path) {
            Some(value) => {
                self.cache.insert(path.to_string(), value.clone());
                self.extract(value, extract_path, path)
            }
            None if self.allow_undefined_facts => Ok(ValueNode::Null),
            None => Err(EngineError::UndefinedFact(path.to_string())),
        }
    }

    /// 在事实值上做二次路径提取
    fn extract(
        &self,
        value: ValueNode,
        extract_path: Option<&str>,
        fact_path: &str,
    ) -> Result<ValueNode> {
        let Some(sub_path) = extract_path else {
            return Ok(value);
        };
        if !value.is_object() && !value.is_array() {
            debug!(
                path = %fact_path,
                sub_path = %sub_path,
                value_type = value.type_name(),
                "事实值不是对象，跳过路径提取"
            );
            return Ok(value);
        }
        match (self.path_resolver)(&value, sub_path) {
            Some(extracted) => Ok(extracted),
            None if self.allow_undefined_facts => Ok(ValueNode::Null),
            None => Err(EngineError::UndefinedFact(format!(
                "{} (路径 {})",
                fact_path, sub_path
            ))),
        }
    }

    /// 把值解释为字面量或事实引用
    ///
    /// `{ "fact": path, "params"?: {...}, "path"?: "..." }` 形式的对象
    /// 解析为实时事实值，其余值原样返回。事件参数替换使用此入口。
    pub fn get_value(&self, value: &ValueNode) -> Result<ValueNode> {
        let Some(map) = value.as_object() else {
            return Ok(value.clone());
        };
        let Some(ValueNode::String(fact_path)) = map.get("fact") else {
            return Ok(value.clone());
        };

        let params = match map.get("params").and_then(ValueNode::as_object) {
            Some(p) => p.clone(),
            None => FactParams::new(),
        };
        let extract_path = map.get("path").and_then(ValueNode::as_str);
        self.fact_value(fact_path, &params, extract_path)
    }

    /// 追加成功或失败事件
    pub fn add_event(&self, event: Event, outcome: Outcome) {
        let mut log = self.events.lock();
        match outcome {
            Outcome::Success => log.success.push(event),
            Outcome::Failure => log.failure.push(event),
        }
    }

    /// 读取事件日志；`None` 返回成功与失败的合并视图
    pub fn get_events(&self, outcome: Option<Outcome>) -> Vec<Event> {
        let log = self.events.lock();
        match outcome {
            Some(Outcome::Success) => log.success.clone(),
            Some(Outcome::Failure) => log.failure.clone(),
            None => {
                let mut all = log.success.clone();
                all.extend(log.failure.iter().cloned());
                all
            }
        }
    }

    /// 追加规则结果
    pub fn add_result(&self, result: RuleResult) {
        self.results.lock().push(result);
    }

    /// 读取全部规则结果（插入序）
    pub fn get_results(&self) -> Vec<RuleResult> {
        self.results.lock().clone()
    }
}

impl std::fmt::Debug for Almanac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Almanac")
            .field("allow_undefined_facts", &self.allow_undefined_facts)
            .field("cached_values", &self.cache.len())
            .field("registered_facts", &self.facts.len())
            .finish()
    }
}
