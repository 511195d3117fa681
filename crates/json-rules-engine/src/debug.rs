//! 调试开关
//!
//! 与上游生态约定一致：当环境变量 `DEBUG` 包含子串 `json-rules-engine` 时
//! 开启调试输出。环境变量在进程内只读取一次；引擎内部的诊断统一走
//! `tracing::debug!`，由这里安装的 subscriber 决定是否落到 stdout。

use std::sync::LazyLock;

static DEBUG_ENABLED: LazyLock<bool> = LazyLock::new(|| {
    std::env::var("DEBUG")
        .map(|v| v.contains("json-rules-engine"))
        .unwrap_or(false)
});

/// 调试开关是否开启
pub fn debug_enabled() -> bool {
    *DEBUG_ENABLED
}

/// 按调试开关初始化日志输出
///
/// 库本身从不隐式安装全局 subscriber；调用方（通常是测试或宿主程序）
/// 在入口处调用一次即可。开关关闭或已有全局 subscriber 时为空操作。
pub fn init_debug_logging() {
    if !debug_enabled() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(true)
        .with_writer(std::io::stdout)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_without_flag_is_noop() {
        // 未设置 DEBUG 时初始化不应 panic
        init_debug_logging();
    }
}
