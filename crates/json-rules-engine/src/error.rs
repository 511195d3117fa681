//! 规则引擎错误类型

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    // ==================== 规则定义错误 ====================
    #[error("无效的规则: {0}")]
    InvalidRule(String),

    #[error("无效的条件: {0}")]
    InvalidCondition(String),

    // ==================== 求值错误 ====================
    #[error("未知的操作符: {0}")]
    UnknownOperator(String),

    #[error("未定义的事实: {0}")]
    UndefinedFact(String),

    #[error("未定义的命名条件: {0}")]
    UndefinedCondition(String),

    #[error("无效的事件结果: {0}，仅支持 success | failure")]
    InvalidOutcome(String),

    // ==================== 输入与运行时错误 ====================
    #[error("JSON 解析失败: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRule(_) => "INVALID_RULE",
            Self::InvalidCondition(_) => "INVALID_CONDITION",
            Self::UnknownOperator(_) => "UNKNOWN_OPERATOR",
            Self::UndefinedFact(_) => "UNDEFINED_FACT",
            Self::UndefinedCondition(_) => "UNDEFINED_CONDITION",
            Self::InvalidOutcome(_) => "INVALID_OUTCOME",
            Self::Parse(_) => "PARSE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = EngineError::UndefinedFact("user.age".to_string());
        assert_eq!(err.code(), "UNDEFINED_FACT");
        assert!(err.to_string().contains("user.age"));
    }

    #[test]
    fn test_parse_error_from_serde() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{bad json").unwrap_err();
        let err = EngineError::from(parse_err);
        assert_eq!(err.code(), "PARSE_ERROR");
    }
}
