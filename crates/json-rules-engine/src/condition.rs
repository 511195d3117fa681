//! 条件树
//!
//! 递归 AST：布尔组合（all / any / not）、命名条件引用、以及
//! fact-operator-value 叶子比较。结构约束在 JSON 解码时一次性校验，
//! 带标签的枚举让非法形态（布尔字段与叶子字段混用等）无从构造。

use crate::almanac::Almanac;
use crate::error::{EngineError, Result};
use crate::fact::FactParams;
use crate::operators::OperatorRegistry;
use crate::value::ValueNode;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

/// 条件节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCondition", into = "RawCondition")]
pub enum Condition {
    /// 合取：全部子条件为真
    All(BooleanCondition),
    /// 析取：任一子条件为真
    Any(BooleanCondition),
    /// 取反：单个子条件
    Not(NotCondition),
    /// 引用引擎上注册的命名条件
    Ref(ConditionReference),
    /// 叶子比较
    Leaf(LeafCondition),
}

/// all / any 节点
#[derive(Debug, Clone, PartialEq)]
pub struct BooleanCondition {
    pub priority: Option<i64>,
    pub name: Option<String>,
    pub children: Vec<Condition>,
}

/// not 节点
#[derive(Debug, Clone, PartialEq)]
pub struct NotCondition {
    pub priority: Option<i64>,
    pub name: Option<String>,
    pub child: Box<Condition>,
}

/// 命名条件引用
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionReference {
    pub name: String,
}

/// 叶子比较条件
///
/// `fact_result` 与 `result` 在求值后写入单次运行的快照节点，
/// 规则定义本身保持不可变。
#[derive(Debug, Clone, PartialEq)]
pub struct LeafCondition {
    pub fact: String,
    pub operator: String,
    pub value: ValueNode,
    /// 在事实值上做二次提取的子路径
    pub path: Option<String>,
    /// 转发给动态事实回调的参数表
    pub params: Option<FactParams>,
    pub priority: Option<i64>,
    pub name: Option<String>,
    pub fact_result: Option<ValueNode>,
    pub result: Option<bool>,
}

/// 叶子求值结果
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionEvaluation {
    pub result: bool,
    pub lhs: ValueNode,
    pub rhs: ValueNode,
    pub operator: String,
}

impl Condition {
    /// 节点自身声明的优先级
    pub fn priority(&self) -> Option<i64> {
        match self {
            Self::All(group) | Self::Any(group) => group.priority,
            Self::Not(not) => not.priority,
            Self::Ref(_) => None,
            Self::Leaf(leaf) => leaf.priority,
        }
    }

    /// 布尔组合节点的操作名
    pub fn boolean_operator(&self) -> Option<&'static str> {
        match self {
            Self::All(_) => Some("all"),
            Self::Any(_) => Some("any"),
            Self::Not(_) => Some("not"),
            _ => None,
        }
    }

    pub fn is_boolean_operator(&self) -> bool {
        self.boolean_operator().is_some()
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Ref(_))
    }

    /// 校验结构约束
    ///
    /// JSON 解码路径已经过校验；此入口覆盖程序化构造的条件树。
    pub fn validate(&self) -> Result<()> {
        if let Some(priority) = self.priority() {
            if priority <= 0 {
                return Err(EngineError::InvalidCondition(
                    "priority 必须大于零".to_string(),
                ));
            }
        }
        match self {
            Self::All(group) | Self::Any(group) => {
                for child in &group.children {
                    child.validate()?;
                }
            }
            Self::Not(not) => not.child.validate()?,
            Self::Ref(reference) => {
                if reference.name.is_empty() {
                    return Err(EngineError::InvalidCondition(
                        "条件引用的名称不能为空".to_string(),
                    ));
                }
            }
            Self::Leaf(leaf) => {
                if leaf.fact.is_empty() || leaf.operator.is_empty() {
                    return Err(EngineError::InvalidCondition(
                        "fact、operator、value 三者必须同时提供".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// 序列化视图，省略未设置的字段
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// 序列化为 JSON 字符串
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// 叶子求值：解析事实值（LHS），以条件中的 value 为 RHS 派发操作符
    ///
    /// 仅叶子支持此调用；布尔节点与条件引用由规则的递归求值驱动。
    pub fn evaluate(
        &self,
        almanac: &Almanac,
        operators: &OperatorRegistry,
    ) -> Result<ConditionEvaluation> {
        match self {
            Self::Leaf(leaf) => leaf.evaluate(almanac, operators),
            Self::Ref(_) => Err(EngineError::InvalidCondition(
                "无法对条件引用执行 evaluate()".to_string(),
            )),
            _ => Err(EngineError::InvalidCondition(
                "无法对布尔条件执行 evaluate()".to_string(),
            )),
        }
    }
}

impl LeafCondition {
    /// 解析事实值并派发操作符
    pub fn evaluate(
        &self,
        almanac: &Almanac,
        operators: &OperatorRegistry,
    ) -> Result<ConditionEvaluation> {
        let empty = FactParams::new();
        let params = self.params.as_ref().unwrap_or(&empty);
        let lhs = almanac.fact_value(&self.fact, params, self.path.as_deref())?;
        let result = operators.apply(&self.operator, &lhs, &self.value)?;

        debug!(
            fact = %self.fact,
            operator = %self.operator,
            lhs = %lhs,
            rhs = %self.value,
            result,
            "叶子条件求值"
        );

        Ok(ConditionEvaluation {
            result,
            lhs,
            rhs: self.value.clone(),
            operator: self.operator.clone(),
        })
    }
}

/// 条件的 JSON 线格式
///
/// 所有字段并置的中间结构；`TryFrom` 在解码时施加结构约束并分拣出
/// 具体的节点形态。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawCondition {
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    operator: Option<String>,
    // value 字段允许显式的 JSON null：区分 "未提供" 与 "值为 null"
    #[serde(
        default,
        deserialize_with = "deserialize_present_value",
        skip_serializing_if = "Option::is_none"
    )]
    value: Option<ValueNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<FactParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    all: Option<Vec<Condition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    any: Option<Vec<Condition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    not: Option<Box<Condition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    condition: Option<String>,
    #[serde(rename = "factResult", skip_serializing_if = "Option::is_none")]
    fact_result: Option<ValueNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<bool>,
}

/// 字段出现即视为已提供，JSON null 解码为 `Some(ValueNode::Null)`
fn deserialize_present_value<'de, D>(deserializer: D) -> std::result::Result<Option<ValueNode>, D::Error>
where
    D: Deserializer<'de>,
{
    ValueNode::deserialize(deserializer).map(Some)
}

impl TryFrom<RawCondition> for Condition {
    type Error = EngineError;

    fn try_from(raw: RawCondition) -> Result<Self> {
        if let Some(priority) = raw.priority {
            if priority <= 0 {
                return Err(EngineError::InvalidCondition(
                    "priority 必须大于零".to_string(),
                ));
            }
        }

        let has_leaf_fields = raw.fact.is_some() || raw.operator.is_some() || raw.value.is_some();
        let shapes = [
            raw.all.is_some(),
            raw.any.is_some(),
            raw.not.is_some(),
            raw.condition.is_some(),
            has_leaf_fields,
        ];
        let shape_count = shapes.iter().filter(|present| **present).count();

        if shape_count > 1 {
            return Err(EngineError::InvalidCondition(
                "all、any、not、条件引用与 fact 比较互斥，只能出现一种".to_string(),
            ));
        }
        if shape_count == 0 {
            return Err(EngineError::InvalidCondition(
                "条件必须是 all、any、not、条件引用或 fact 比较之一".to_string(),
            ));
        }

        // path 与 params 只属于叶子比较
        if !has_leaf_fields && (raw.path.is_some() || raw.params.is_some()) {
            return Err(EngineError::InvalidCondition(
                "path 与 params 只能在提供 fact 比较时设置".to_string(),
            ));
        }

        if let Some(children) = raw.all {
            return Ok(Self::All(BooleanCondition {
                priority: raw.priority,
                name: raw.name,
                children,
            }));
        }
        if let Some(children) = raw.any {
            return Ok(Self::Any(BooleanCondition {
                priority: raw.priority,
                name: raw.name,
                children,
            }));
        }
        if let Some(child) = raw.not {
            return Ok(Self::Not(NotCondition {
                priority: raw.priority,
                name: raw.name,
                child,
            }));
        }
        if let Some(name) = raw.condition {
            if name.is_empty() {
                return Err(EngineError::InvalidCondition(
                    "条件引用的名称不能为空".to_string(),
                ));
            }
            return Ok(Self::Ref(ConditionReference { name }));
        }

        let (Some(fact), Some(operator), Some(value)) = (raw.fact, raw.operator, raw.value) else {
            return Err(EngineError::InvalidCondition(
                "fact、operator、value 三者必须同时提供".to_string(),
            ));
        };
        if fact.is_empty() || operator.is_empty() {
            return Err(EngineError::InvalidCondition(
                "fact、operator、value 三者必须同时提供".to_string(),
            ));
        }

        Ok(Self::Leaf(LeafCondition {
            fact,
            operator,
            value,
            path: raw.path,
            params: raw.params,
            priority: raw.priority,
            name: raw.name,
            fact_result: raw.fact_result,
            result: raw.result,
        }))
    }
}

impl From<Condition> for RawCondition {
    fn from(condition: Condition) -> Self {
        match condition {
            Condition::All(group) => RawCondition {
                priority: group.priority,
                name: group.name,
                all: Some(group.children),
                ..Default::default()
            },
            Condition::Any(group) => RawCondition {
                priority: group.priority,
                name: group.name,
                any: Some(group.children),
                ..Default::default()
            },
            Condition::Not(not) => RawCondition {
                priority: not.priority,
                name: not.name,
                not: Some(not.child),
                ..Default::default()
            },
            Condition::Ref(reference) => RawCondition {
                condition: Some(reference.name),
                ..Default::default()
            },
            Condition::Leaf(leaf) => RawCondition {
                priority: leaf.priority,
                name: leaf.name,
                fact: Some(leaf.fact),
                operator: Some(leaf.operator),
                value: Some(leaf.value),
                path: leaf.path,
                params: leaf.params,
                fact_result: leaf.fact_result,
                result: leaf.result,
                ..Default::default()
            },
        }
    }
}
