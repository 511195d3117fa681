//! 条件求值的值模型
//!
//! 所有比较都在这个带标签的值树上进行：类型严格、不做隐式转换。
//! 数值统一为 f64，与 JSON number 的语义一致。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 带标签的 JSON 值
///
/// 相等比较是结构化且类型严格的：标签不同即不相等，绝不做类型转换
/// （`Number(1.0)` 不等于 `String("1")`）。数值序只对 `Number` 有定义，
/// 由具体操作符负责。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueNode {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<ValueNode>),
    Object(HashMap<String, ValueNode>),
}

impl ValueNode {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Self::Bool(_))
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Self::Number(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Self::String(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Self::Array(_))
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object(_))
    }

    /// 两个值是否携带相同的类型标签
    pub fn same_type(&self, other: &ValueNode) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[ValueNode]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&HashMap<String, ValueNode>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// 获取值的类型名称，用于日志和错误信息
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
        }
    }

    /// 还原为 serde_json 的原生表示，仅用于调试输出
    pub fn raw(&self) -> serde_json::Value {
        self.clone().into()
    }

    /// 从 JSON 字节解析
    pub fn parse(bytes: &[u8]) -> crate::error::Result<ValueNode> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        Ok(value.into())
    }
}

impl std::fmt::Display for ValueNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw())
    }
}

impl From<serde_json::Value> for ValueNode {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            // 整数与浮点统一为 f64，比较时不再区分表示形式
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(ValueNode::from).collect())
            }
            serde_json::Value::Object(map) => Self::Object(
                map.into_iter()
                    .map(|(k, v)| (k, ValueNode::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<ValueNode> for serde_json::Value {
    fn from(value: ValueNode) -> Self {
        match value {
            ValueNode::Null => serde_json::Value::Null,
            ValueNode::Bool(b) => serde_json::Value::Bool(b),
            ValueNode::Number(n) => serde_json::Number::from_f64(n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueNode::String(s) => serde_json::Value::String(s),
            ValueNode::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            ValueNode::Object(map) => serde_json::Value::Object(
                map.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

impl From<bool> for ValueNode {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for ValueNode {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for ValueNode {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<&str> for ValueNode {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for ValueNode {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}
