//! 运行执行上下文
//!
//! 取消信号按树状作用域组织：引擎的一次运行持有根上下文，每条规则
//! 继承出自己的子作用域（布尔节点不再细分，短路由聚合逻辑完成）。
//! 子作用域的取消只影响自身子树；根作用域取消（外部关停、引擎停止）
//! 向下传播到所有规则。提前终止标记写在运行级，引擎据此跳过尚未调度
//! 的优先级层。

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// 执行上下文
///
/// 求值器在进入每个子节点、以及访问 Almanac 之前都应检查
/// `is_cancelled`。已经开始的 worker 不会被打断，会写完自己的槽位；
/// 取消只阻止尚未开始的求值。
#[derive(Debug)]
pub struct ExecutionContext {
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    /// 父作用域的取消信号；根上下文无父
    parent_cancel: Option<watch::Receiver<bool>>,
    /// 本作用域的提前终止标记
    stop_early: Arc<AtomicBool>,
    /// 运行级提前终止标记（根上下文与 stop_early 同源）
    run_stop_early: Arc<AtomicBool>,
    /// 首条终止原因，整个运行共享
    message: Arc<Mutex<String>>,
}

impl ExecutionContext {
    /// 创建根上下文（每次 run 一个）
    pub fn new() -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let stop_early = Arc::new(AtomicBool::new(false));
        Self {
            cancel_tx,
            cancel_rx,
            parent_cancel: None,
            run_stop_early: stop_early.clone(),
            stop_early,
            message: Arc::new(Mutex::new(String::new())),
        }
    }

    /// 派生规则级子作用域
    ///
    /// 子作用域有独立的取消信号与提前终止标记，但共享运行级标记与
    /// 终止原因；父作用域取消后子作用域视为已取消。
    pub fn child(&self) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            cancel_tx,
            cancel_rx,
            parent_cancel: Some(self.cancel_rx.clone()),
            stop_early: Arc::new(AtomicBool::new(false)),
            run_stop_early: self.run_stop_early.clone(),
            message: self.message.clone(),
        }
    }

    /// 取消本作用域，重复调用无副作用
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    /// 本作用域或任一祖先是否已取消
    pub fn is_cancelled(&self) -> bool {
        if *self.cancel_rx.borrow() {
            return true;
        }
        self.parent_cancel
            .as_ref()
            .is_some_and(|parent| *parent.borrow())
    }

    /// 本作用域是否已触发提前终止
    pub fn stop_early(&self) -> bool {
        self.stop_early.load(Ordering::Acquire)
    }

    /// 运行级是否已触发提前终止
    pub fn run_stop_early(&self) -> bool {
        self.run_stop_early.load(Ordering::Acquire)
    }

    /// 标记提前终止并取消本作用域尚未开始的求值
    ///
    /// 同时点亮运行级标记，引擎据此不再调度后续优先级层；
    /// 只保留首条终止原因。
    pub fn trigger_stop_early(&self, message: &str) {
        if !self.stop_early.swap(true, Ordering::AcqRel) {
            let mut slot = self.message.lock();
            if slot.is_empty() {
                *slot = message.to_string();
            }
            tracing::debug!(reason = message, "触发提前终止");
        }
        self.run_stop_early.store(true, Ordering::Release);
        self.cancel();
    }

    /// 终止原因（未触发时为空字符串）
    pub fn message(&self) -> String {
        self.message.lock().clone()
    }

    /// 订阅本作用域的取消信号，供外部关停信号桥接使用
    pub fn cancel_receiver(&self) -> watch::Receiver<bool> {
        self.cancel_rx.clone()
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let ctx = ExecutionContext::new();
        assert!(!ctx.is_cancelled());
        assert!(!ctx.stop_early());
        assert!(!ctx.run_stop_early());
        assert_eq!(ctx.message(), "");
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let ctx = ExecutionContext::new();
        ctx.cancel();
        ctx.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_trigger_stop_early_keeps_first_message() {
        let ctx = ExecutionContext::new();
        ctx.trigger_stop_early("第一条原因");
        ctx.trigger_stop_early("第二条原因");

        assert!(ctx.stop_early());
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.message(), "第一条原因");
    }

    #[test]
    fn test_parent_cancel_propagates_to_child() {
        let root = ExecutionContext::new();
        let child = root.child();

        assert!(!child.is_cancelled());
        root.cancel();
        assert!(child.is_cancelled());
        // 子作用域自身的信号保持未触发
        assert!(!*child.cancel_rx.borrow());
    }

    #[test]
    fn test_child_cancel_does_not_leak_to_root_or_sibling() {
        let root = ExecutionContext::new();
        let left = root.child();
        let right = root.child();

        left.cancel();
        assert!(left.is_cancelled());
        assert!(!root.is_cancelled());
        assert!(!right.is_cancelled());
    }

    #[test]
    fn test_child_trigger_raises_run_level_flag_only() {
        let root = ExecutionContext::new();
        let left = root.child();
        let right = root.child();

        left.trigger_stop_early("any 条件成功，提前终止");

        // 运行级标记点亮，引擎据此跳过后续层
        assert!(root.stop_early());
        assert!(root.run_stop_early());
        // 兄弟作用域既未取消也未被标记，已在途的规则照常完成
        assert!(!right.is_cancelled());
        assert!(!right.stop_early());
        assert_eq!(root.message(), "any 条件成功，提前终止");
    }
}
