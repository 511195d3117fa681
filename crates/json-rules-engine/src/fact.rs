//! 事实定义与事实仓库
//!
//! 事实由点分路径标识（如 `user.lastName`），分静态与动态两种：
//! 静态事实在注册时携带固定值；动态事实携带回调，在单次运行内按
//! 缓存键（路径 + 条件 params）至多计算一次。

use crate::almanac::Almanac;
use crate::error::{EngineError, Result};
use crate::value::ValueNode;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, instrument};

/// 条件传递给动态事实的参数表
pub type FactParams = HashMap<String, ValueNode>;

/// 动态事实回调
///
/// 回调可以通过 Almanac 读取其他事实（含递归解析），返回计算出的值。
pub type DynamicFactCallback = Arc<dyn Fn(&Almanac, &FactParams) -> ValueNode + Send + Sync>;

/// 事实选项
#[derive(Debug, Clone, Copy)]
pub struct FactOptions {
    /// 是否在单次运行内缓存计算结果
    pub cache: bool,
    /// 条件分层时的优先级，必须 ≥ 1
    pub priority: i64,
}

impl Default for FactOptions {
    fn default() -> Self {
        Self {
            cache: true,
            priority: 1,
        }
    }
}

enum FactKind {
    Static(ValueNode),
    Dynamic(DynamicFactCallback),
}

/// 事实定义
pub struct Fact {
    path: String,
    kind: FactKind,
    options: FactOptions,
}

impl Fact {
    /// 创建静态事实
    pub fn new_static(
        path: impl Into<String>,
        value: ValueNode,
        options: FactOptions,
    ) -> Result<Self> {
        Self::new(path, FactKind::Static(value), options)
    }

    /// 创建动态事实
    pub fn new_dynamic(
        path: impl Into<String>,
        callback: DynamicFactCallback,
        options: FactOptions,
    ) -> Result<Self> {
        Self::new(path, FactKind::Dynamic(callback), options)
    }

    fn new(path: impl Into<String>, kind: FactKind, options: FactOptions) -> Result<Self> {
        let path = path.into();
        if path.is_empty() {
            return Err(EngineError::InvalidRule("事实路径不能为空".to_string()));
        }
        if options.priority < 1 {
            return Err(EngineError::InvalidRule(format!(
                "事实 {} 的优先级必须 ≥ 1，当前为 {}",
                path, options.priority
            )));
        }
        Ok(Self {
            path,
            kind,
            options,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn priority(&self) -> i64 {
        self.options.priority
    }

    pub fn is_static(&self) -> bool {
        matches!(self.kind, FactKind::Static(_))
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.kind, FactKind::Dynamic(_))
    }

    /// 计算事实值：静态事实直接取值，动态事实执行回调
    pub fn calculate(&self, almanac: &Almanac, params: &FactParams) -> ValueNode {
        match &self.kind {
            FactKind::Static(value) => value.clone(),
            FactKind::Dynamic(callback) => callback(almanac, params),
        }
    }

    /// 计算缓存键；事实配置为不缓存时返回 None
    ///
    /// 键由路径与规范化后的 params 组成，键序无关：语义相同的参数表
    /// 共享同一条缓存。
    pub fn cache_key(&self, params: &FactParams) -> Option<String> {
        if !self.options.cache {
            return None;
        }
        Some(canonical_cache_key(&self.path, params))
    }
}

impl std::fmt::Debug for Fact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fact")
            .field("path", &self.path)
            .field(
                "kind",
                &match self.kind {
                    FactKind::Static(_) => "static",
                    FactKind::Dynamic(_) => "dynamic",
                },
            )
            .field("options", &self.options)
            .finish()
    }
}

/// 由路径与参数表生成规范化缓存键
pub(crate) fn canonical_cache_key(path: &str, params: &FactParams) -> String {
    if params.is_empty() {
        return path.to_string();
    }
    // BTreeMap 保证键序稳定
    let ordered: BTreeMap<&str, serde_json::Value> = params
        .iter()
        .map(|(k, v)| (k.as_str(), v.raw()))
        .collect();
    let encoded = serde_json::to_string(&ordered).unwrap_or_default();
    format!("{}?{}", path, encoded)
}

/// 事实仓库
///
/// 路径 → 事实的线程安全映射。规范键是路径字符串本身，内部哈希
/// 只是查找优化。
#[derive(Debug, Clone, Default)]
pub struct FactStore {
    facts: Arc<DashMap<String, Arc<Fact>>>,
}

impl FactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册事实，同路径覆盖
    #[instrument(skip(self, fact), fields(path = fact.path()))]
    pub fn set(&self, fact: Fact) {
        debug!("注册事实");
        self.facts.insert(fact.path().to_string(), Arc::new(fact));
    }

    /// 注册已共享的事实，避免克隆
    pub fn set_shared(&self, fact: Arc<Fact>) {
        self.facts.insert(fact.path().to_string(), fact);
    }

    pub fn get(&self, path: &str) -> Option<Arc<Fact>> {
        self.facts.get(path).map(|entry| entry.value().clone())
    }

    /// 删除事实，返回是否存在
    pub fn delete(&self, path: &str) -> bool {
        self.facts.remove(path).is_some()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.facts.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// 当前所有事实的快照
    pub fn entries(&self) -> Vec<Arc<Fact>> {
        self.facts.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_static_fact() {
        let fact = Fact::new_static("user.age", ValueNode::from(21i64), FactOptions::default())
            .unwrap();
        assert!(fact.is_static());
        assert_eq!(fact.priority(), 1);
    }

    #[test]
    fn test_empty_path_rejected() {
        let err = Fact::new_static("", ValueNode::Null, FactOptions::default()).unwrap_err();
        assert_eq!(err.code(), "INVALID_RULE");
    }

    #[test]
    fn test_invalid_priority_rejected() {
        let opts = FactOptions {
            cache: true,
            priority: 0,
        };
        assert!(Fact::new_static("x", ValueNode::Null, opts).is_err());
    }

    #[test]
    fn test_cache_key_includes_params() {
        let fact =
            Fact::new_static("score", ValueNode::from(1i64), FactOptions::default()).unwrap();

        let empty = FactParams::new();
        assert_eq!(fact.cache_key(&empty).unwrap(), "score");

        let mut params = FactParams::new();
        params.insert("season".to_string(), ValueNode::from("winter"));
        let keyed = fact.cache_key(&params).unwrap();
        assert_ne!(keyed, "score");
        assert!(keyed.starts_with("score?"));
    }

    #[test]
    fn test_cache_key_is_order_independent() {
        let mut a = FactParams::new();
        a.insert("x".to_string(), ValueNode::from(1i64));
        a.insert("y".to_string(), ValueNode::from(2i64));

        let mut b = FactParams::new();
        b.insert("y".to_string(), ValueNode::from(2i64));
        b.insert("x".to_string(), ValueNode::from(1i64));

        assert_eq!(canonical_cache_key("f", &a), canonical_cache_key("f", &b));
    }

    #[test]
    fn test_cache_disabled_yields_no_key() {
        let opts = FactOptions {
            cache: false,
            priority: 1,
        };
        let fact = Fact::new_static("score", ValueNode::from(1i64), opts).unwrap();
        assert!(fact.cache_key(&FactParams::new()).is_none());
    }

    #[test]
    fn test_store_crud() {
        let store = FactStore::new();
        assert!(store.is_empty());

        store.set(
            Fact::new_static("a", ValueNode::from(json!(1)), FactOptions::default()).unwrap(),
        );
        store.set(
            Fact::new_static("b", ValueNode::from(json!(2)), FactOptions::default()).unwrap(),
        );
        assert_eq!(store.len(), 2);
        assert!(store.contains("a"));
        assert!(store.get("a").unwrap().is_static());

        // 同路径覆盖
        store.set(
            Fact::new_static("a", ValueNode::from(json!(9)), FactOptions::default()).unwrap(),
        );
        assert_eq!(store.len(), 2);

        assert!(store.delete("a"));
        assert!(!store.delete("a"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_concurrent_writes() {
        let store = FactStore::new();
        let clone = store.clone();

        let handle = std::thread::spawn(move || {
            for i in 0..100 {
                clone.set(
                    Fact::new_static(
                        format!("fact-{}", i),
                        ValueNode::from(i as i64),
                        FactOptions::default(),
                    )
                    .unwrap(),
                );
            }
        });

        for i in 100..200 {
            store.set(
                Fact::new_static(
                    format!("fact-{}", i),
                    ValueNode::from(i as i64),
                    FactOptions::default(),
                )
                .unwrap(),
            );
        }

        handle.join().unwrap();
        assert_eq!(store.len(), 200);
    }
}
