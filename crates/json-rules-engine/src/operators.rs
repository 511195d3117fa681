//! 操作符定义与注册表
//!
//! 操作符是对一对值的命名二元谓词，附带一个事实值校验器。
//! 求值契约：`apply(a, b) = validator(a) && callback(a, b)`；
//! 校验器拒绝时返回 false 而非错误，由规则作者通过操作符选择承担类型责任。

use crate::error::{EngineError, Result};
use crate::value::ValueNode;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// 操作符回调：左侧为事实值，右侧为条件中声明的期望值
pub type OperatorCallback = Arc<dyn Fn(&ValueNode, &ValueNode) -> bool + Send + Sync>;

/// 事实值校验器：在回调之前对左侧值做类型把关
pub type FactValueValidator = Arc<dyn Fn(&ValueNode) -> bool + Send + Sync>;

/// 条件操作符
#[derive(Clone)]
pub struct Operator {
    name: String,
    callback: OperatorCallback,
    validator: FactValueValidator,
}

impl Operator {
    /// 创建操作符，校验器缺省为恒真
    pub fn new(
        name: impl Into<String>,
        callback: impl Fn(&ValueNode, &ValueNode) -> bool + Send + Sync + 'static,
    ) -> Result<Self> {
        Self::with_validator(name, Arc::new(callback), Arc::new(|_| true))
    }

    /// 创建带校验器的操作符
    pub fn with_validator(
        name: impl Into<String>,
        callback: OperatorCallback,
        validator: FactValueValidator,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(EngineError::InvalidRule("操作符名称不能为空".to_string()));
        }
        Ok(Self {
            name,
            callback,
            validator,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 对一对值求值：先过校验器，再执行回调
    pub fn apply(&self, fact_value: &ValueNode, expected: &ValueNode) -> bool {
        (self.validator)(fact_value) && (self.callback)(fact_value, expected)
    }
}

impl std::fmt::Debug for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operator").field("name", &self.name).finish()
    }
}

/// 操作符注册表
///
/// 名称在同一引擎内唯一，重复注册按覆盖处理。别名是共享回调的独立注册。
#[derive(Debug, Clone, Default)]
pub struct OperatorRegistry {
    operators: Arc<DashMap<String, Arc<Operator>>>,
}

impl OperatorRegistry {
    /// 创建空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建并装入默认操作符集
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        for op in default_operators() {
            registry.register(op);
        }
        registry
    }

    /// 注册操作符，同名覆盖
    pub fn register(&self, operator: Operator) {
        debug!(name = operator.name(), "注册操作符");
        self.operators
            .insert(operator.name().to_string(), Arc::new(operator));
    }

    /// 查找操作符
    pub fn lookup(&self, name: &str) -> Option<Arc<Operator>> {
        self.operators.get(name).map(|entry| entry.value().clone())
    }

    /// 移除操作符，返回是否存在
    pub fn remove(&self, name: &str) -> bool {
        self.operators.remove(name).is_some()
    }

    /// 按名称求值，未注册的名称报错
    pub fn apply(&self, name: &str, fact_value: &ValueNode, expected: &ValueNode) -> Result<bool> {
        let op = self
            .lookup(name)
            .ok_or_else(|| EngineError::UnknownOperator(name.to_string()))?;
        Ok(op.apply(fact_value, expected))
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }
}

/// 数值校验器：左侧必须是 number
fn number_validator() -> FactValueValidator {
    Arc::new(|value: &ValueNode| value.is_number())
}

/// 字符串校验器：左侧必须是 string
fn string_validator() -> FactValueValidator {
    Arc::new(|value: &ValueNode| value.is_string())
}

/// 数组校验器：左侧必须是 array
fn array_validator() -> FactValueValidator {
    Arc::new(|value: &ValueNode| value.is_array())
}

/// 为一组别名注册同一个回调与校验器
fn alias_group(
    operators: &mut Vec<Operator>,
    names: &[&str],
    validator: FactValueValidator,
    callback: impl Fn(&ValueNode, &ValueNode) -> bool + Send + Sync + 'static,
) {
    let callback: OperatorCallback = Arc::new(callback);
    for name in names {
        operators.push(
            Operator::with_validator(*name, callback.clone(), validator.clone())
                .expect("默认操作符名称非空"),
        );
    }
}

/// 默认操作符集
///
/// 别名共享同一语义：`equal`/`eq`/`=`、`notEqual`/`ne`/`!=`、
/// 数值比较的单词/缩写/符号三套名称，以及字符串前后缀与包含检查。
pub fn default_operators() -> Vec<Operator> {
    let mut operators = Vec::new();
    let any = Arc::new(|_: &ValueNode| true) as FactValueValidator;

    // 相等与不等：结构化严格比较，类型不同即不等
    alias_group(&mut operators, &["equal", "eq", "="], any.clone(), |a, b| {
        a == b
    });
    alias_group(&mut operators, &["notEqual", "ne", "!="], any.clone(), |a, b| {
        a != b
    });

    // 成员检查：右侧为数组
    alias_group(&mut operators, &["in"], any.clone(), |a, b| {
        b.as_array().is_some_and(|items| items.contains(a))
    });
    alias_group(&mut operators, &["notIn"], any.clone(), |a, b| {
        !b.as_array().is_some_and(|items| items.contains(a))
    });

    // 包含检查：左侧为数组
    alias_group(&mut operators, &["contains"], array_validator(), |a, b| {
        a.as_array().is_some_and(|items| items.contains(b))
    });
    alias_group(
        &mut operators,
        &["doesNotContain"],
        array_validator(),
        |a, b| !a.as_array().is_some_and(|items| items.contains(b)),
    );

    // 数值比较：两侧都必须是 number
    alias_group(
        &mut operators,
        &["lessThan", "lt", "<"],
        number_validator(),
        |a, b| matches!((a.as_f64(), b.as_f64()), (Some(x), Some(y)) if x < y),
    );
    alias_group(
        &mut operators,
        &["lessThanInclusive", "lte", "<="],
        number_validator(),
        |a, b| matches!((a.as_f64(), b.as_f64()), (Some(x), Some(y)) if x <= y),
    );
    alias_group(
        &mut operators,
        &["greaterThan", "gt", ">"],
        number_validator(),
        |a, b| matches!((a.as_f64(), b.as_f64()), (Some(x), Some(y)) if x > y),
    );
    alias_group(
        &mut operators,
        &["greaterThanInclusive", "gte", ">="],
        number_validator(),
        |a, b| matches!((a.as_f64(), b.as_f64()), (Some(x), Some(y)) if x >= y),
    );

    // 字符串操作：两侧都必须是 string
    alias_group(&mut operators, &["startsWith"], string_validator(), |a, b| {
        matches!((a.as_str(), b.as_str()), (Some(x), Some(y)) if x.starts_with(y))
    });
    alias_group(&mut operators, &["endsWith"], string_validator(), |a, b| {
        matches!((a.as_str(), b.as_str()), (Some(x), Some(y)) if x.ends_with(y))
    });
    alias_group(&mut operators, &["includes"], string_validator(), |a, b| {
        matches!((a.as_str(), b.as_str()), (Some(x), Some(y)) if x.contains(y))
    });

    operators
}
