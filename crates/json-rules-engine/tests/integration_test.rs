//! 规则引擎集成测试
//!
//! 覆盖完整的规则装载、求值、事件派发工作流，以及并发确定性、
//! 优先级分层与缓存记忆化等跨模块性质。

use json_rules_engine::{
    Condition, Engine, EngineOptions, FactOptions, Outcome, Rule, ValueNode,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 犯规离场规则：两套赛制各自的犯规上限
fn foul_out_rule() -> String {
    json!({
        "name": "fouledOutRule",
        "conditions": {"any": [
            {"all": [
                {"fact": "gameDuration", "operator": "equal", "value": 40},
                {"fact": "personalFoulCount", "operator": "greaterThanInclusive", "value": 5}
            ]},
            {"all": [
                {"fact": "gameDuration", "operator": "equal", "value": 48},
                {"fact": "personalFoulCount", "operator": "greaterThanInclusive", "value": 6}
            ]}
        ]},
        "event": {"type": "fouledOut"}
    })
    .to_string()
}

// ==================== 端到端场景 ====================

/// 场景一：40 分钟赛制下 6 次犯规触发离场
#[tokio::test]
async fn test_foul_out() {
    let engine = Engine::default();
    engine.add_rule_from_json(&foul_out_rule()).unwrap();

    let outcome = engine
        .run(br#"{"personalFoulCount": 6, "gameDuration": 40}"#)
        .await
        .unwrap();

    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.results[0].result, Some(true));
    assert_eq!(outcome.events.len(), 1);
    assert_eq!(outcome.events[0].event_type, "fouledOut");
    assert!(outcome.failure_events.is_empty());
}

/// 场景二：差一次犯规，规则落空并产生失败事件
#[tokio::test]
async fn test_miss_by_one() {
    let engine = Engine::default();
    engine.add_rule_from_json(&foul_out_rule()).unwrap();

    let outcome = engine
        .run(br#"{"personalFoulCount": 4, "gameDuration": 40}"#)
        .await
        .unwrap();

    assert!(outcome.results.is_empty());
    assert_eq!(outcome.failure_results.len(), 1);
    assert_eq!(outcome.failure_results[0].result, Some(false));
    assert_eq!(outcome.failure_events.len(), 1);
    assert_eq!(outcome.failure_events[0].event_type, "fouledOut");
}

/// 场景三：点分路径取嵌套字段做字符串后缀匹配
#[tokio::test]
async fn test_ends_with_on_nested_path() {
    let engine = Engine::default();
    engine
        .add_rule_from_json(
            &json!({
                "name": "lastNameRule",
                "conditions": {"all": [
                    {"fact": "user.lastName", "operator": "endsWith", "value": "er"}
                ]},
                "event": {"type": "lastNameMatched"}
            })
            .to_string(),
        )
        .unwrap();

    let outcome = engine
        .run(br#"{"user": {"lastName": "Sooter"}}"#)
        .await
        .unwrap();

    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.events[0].event_type, "lastNameMatched");
}

/// 场景四：允许未定义事实时，缺失路径判假但运行不报错
#[tokio::test]
async fn test_undefined_fact_with_allow_undefined() {
    let engine = Engine::new(EngineOptions {
        allow_undefined_facts: true,
        ..Default::default()
    });
    engine
        .add_rule_from_json(
            &json!({
                "name": "scoreRule",
                "conditions": {"all": [
                    {"fact": "score", "operator": "greaterThan", "value": 10}
                ]},
                "event": {"type": "highScore"}
            })
            .to_string(),
        )
        .unwrap();

    let outcome = engine.run(br#"{"unrelated": true}"#).await.unwrap();

    assert!(outcome.results.is_empty());
    assert_eq!(outcome.failure_results.len(), 1);
    assert_eq!(outcome.failure_results[0].result, Some(false));
}

/// 场景五：动态事实判假，且两个叶子引用同一事实时回调只执行一次
#[tokio::test]
async fn test_dynamic_fact_invoked_once() {
    let engine = Engine::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    engine
        .add_calculated_fact(
            "personalFoulLimit",
            Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                ValueNode::from(50i64)
            }),
            None,
        )
        .unwrap();

    engine
        .add_rule_from_json(
            &json!({
                "name": "limitRule",
                "conditions": {"all": [
                    {"fact": "personalFoulLimit", "operator": "greaterThan", "value": 60},
                    {"fact": "personalFoulLimit", "operator": "greaterThan", "value": 0}
                ]},
                "event": {"type": "overLimit"}
            })
            .to_string(),
        )
        .unwrap();

    let outcome = engine.run(br#"{}"#).await.unwrap();

    // 50 > 60 为假 → 规则落空
    assert!(outcome.results.is_empty());
    assert_eq!(outcome.failure_results.len(), 1);
    // 两个叶子共享同一缓存键，回调只执行一次
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// 场景六：命名条件注册后由规则引用
#[tokio::test]
async fn test_named_condition_reference() {
    let engine = Engine::default();
    let adult: Condition = serde_json::from_value(json!({
        "all": [
            {"fact": "age", "operator": "greaterThanInclusive", "value": 18}
        ]
    }))
    .unwrap();
    engine.set_condition("adultPlayer", adult).unwrap();

    engine
        .add_rule_from_json(
            &json!({
                "name": "adultRule",
                "conditions": {"condition": "adultPlayer"},
                "event": {"type": "adultVerified"}
            })
            .to_string(),
        )
        .unwrap();

    let outcome = engine.run(br#"{"age": 21}"#).await.unwrap();

    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.events[0].event_type, "adultVerified");
}

// ==================== 跨模块性质 ====================

/// 同一输入反复运行，聚合结果与调度顺序无关
#[tokio::test]
async fn test_result_deterministic_across_runs() {
    let engine = Engine::default();
    engine
        .add_rule_from_json(
            &json!({
                "name": "wide",
                "conditions": {"all": [
                    {"fact": "a", "operator": "equal", "value": 1},
                    {"fact": "b", "operator": "equal", "value": 2},
                    {"fact": "c", "operator": "equal", "value": 3},
                    {"fact": "d", "operator": "equal", "value": 4},
                    {"fact": "e", "operator": "equal", "value": 5},
                    {"fact": "f", "operator": "equal", "value": 6},
                    {"fact": "g", "operator": "equal", "value": 7},
                    {"fact": "h", "operator": "equal", "value": 8},
                    {"fact": "i", "operator": "equal", "value": 9},
                    {"fact": "j", "operator": "equal", "value": 10},
                    {"fact": "k", "operator": "equal", "value": 11},
                    {"fact": "l", "operator": "equal", "value": 99}
                ]},
                "event": {"type": "wideEvent"}
            })
            .to_string(),
        )
        .unwrap();

    let facts = br#"{"a":1,"b":2,"c":3,"d":4,"e":5,"f":6,"g":7,"h":8,"i":9,"j":10,"k":11,"l":12}"#;
    for _ in 0..10 {
        let outcome = engine.run(facts).await.unwrap();
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.failure_results.len(), 1);
    }
}

/// 规则按优先级降序分层；高优先级层短路后低优先级层不再调度
#[tokio::test]
async fn test_priority_tiers_descending_with_short_circuit() {
    let engine = Engine::default();
    let low_tier_calls = Arc::new(AtomicUsize::new(0));
    let counter = low_tier_calls.clone();
    engine
        .add_calculated_fact(
            "lowTierProbe",
            Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                ValueNode::Bool(true)
            }),
            Some(FactOptions {
                cache: false,
                priority: 1,
            }),
        )
        .unwrap();

    engine
        .add_rule_from_json(
            &json!({
                "name": "high",
                "priority": 10,
                "conditions": {"any": [
                    {"fact": "x", "operator": "equal", "value": 1},
                    {"fact": "x", "operator": "equal", "value": 2}
                ]},
                "event": {"type": "highEvent"}
            })
            .to_string(),
        )
        .unwrap();
    engine
        .add_rule_from_json(
            &json!({
                "name": "low",
                "priority": 1,
                "conditions": {"all": [
                    {"fact": "lowTierProbe", "operator": "equal", "value": true}
                ]},
                "event": {"type": "lowEvent"}
            })
            .to_string(),
        )
        .unwrap();

    let outcome = engine.run(br#"{"x": 1}"#).await.unwrap();

    // 高优先级的 any 命中触发提前终止
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.results[0].name, "high");
    assert_eq!(outcome.almanac.get_results().len(), 1);
    // 低优先级规则引用的动态事实从未被计算
    assert_eq!(low_tier_calls.load(Ordering::SeqCst), 0);
}

/// 规则 JSON 往返：公开 API 构造的规则序列化后能解析回等价规则
#[tokio::test]
async fn test_rule_round_trip() {
    let rule = Rule::from_json(&foul_out_rule()).unwrap();
    let text = rule.to_json_string().unwrap();
    let parsed = Rule::from_json(&text).unwrap();

    assert_eq!(parsed.name(), rule.name());
    assert_eq!(parsed.priority(), rule.priority());
    assert_eq!(parsed.conditions(), rule.conditions());
    assert_eq!(parsed.event(), rule.event());

    // 往返后的规则求值行为一致
    let engine = Engine::default();
    engine.add_rule(parsed);
    let outcome = engine
        .run(br#"{"personalFoulCount": 6, "gameDuration": 40}"#)
        .await
        .unwrap();
    assert_eq!(outcome.results.len(), 1);
}

/// 快照写回：结果中的叶子带 factResult / result，事件日志按结果分桶
#[tokio::test]
async fn test_result_snapshot_and_event_log() {
    let engine = Engine::default();
    engine.add_rule_from_json(&foul_out_rule()).unwrap();

    let outcome = engine
        .run(br#"{"personalFoulCount": 6, "gameDuration": 40}"#)
        .await
        .unwrap();

    let result_json = outcome.results[0].to_json().unwrap();
    // any → 第一个 all 分支的两个叶子均已求值
    let first_branch = &result_json["conditions"]["any"][0]["all"];
    assert_eq!(first_branch[0]["result"], json!(true));
    assert_eq!(first_branch[0]["factResult"], json!(40.0));
    assert_eq!(first_branch[1]["result"], json!(true));

    let almanac = &outcome.almanac;
    assert_eq!(almanac.get_events(Some(Outcome::Success)).len(), 1);
    assert_eq!(almanac.get_events(Some(Outcome::Failure)).len(), 0);
    assert_eq!(almanac.get_events(None).len(), 1);
}

/// 多规则同层并发：全部结果落账，成功/失败事件与结果桶一致
#[tokio::test]
async fn test_many_rules_in_one_tier() {
    let engine = Engine::default();
    for i in 0..20 {
        engine
            .add_rule_from_json(
                &json!({
                    "name": format!("rule-{}", i),
                    "conditions": {"all": [
                        {"fact": "threshold", "operator": "greaterThan", "value": i}
                    ]},
                    "event": {"type": format!("event-{}", i)}
                })
                .to_string(),
            )
            .unwrap();
    }

    let outcome = engine.run(br#"{"threshold": 10}"#).await.unwrap();

    // threshold=10 > i 对 i∈[0,10) 成立
    assert_eq!(outcome.results.len(), 10);
    assert_eq!(outcome.failure_results.len(), 10);
    assert_eq!(outcome.events.len(), 10);
    assert_eq!(outcome.failure_events.len(), 10);
    assert_eq!(outcome.almanac.get_results().len(), 20);
}

/// 运行期事实插入后可被后续解析读取
#[tokio::test]
async fn test_runtime_fact_via_dynamic_callback() {
    let engine = Engine::default();
    // 动态事实借 Almanac 读取原始事实再派生新值
    engine
        .add_calculated_fact(
            "doubled",
            Arc::new(|almanac, _| {
                let base = almanac
                    .fact_value("base", &Default::default(), None)
                    .ok()
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0);
                ValueNode::Number(base * 2.0)
            }),
            None,
        )
        .unwrap();

    engine
        .add_rule_from_json(
            &json!({
                "name": "doubledRule",
                "conditions": {"all": [
                    {"fact": "doubled", "operator": "equal", "value": 42}
                ]},
                "event": {"type": "doubledEvent"}
            })
            .to_string(),
        )
        .unwrap();

    let outcome = engine.run(br#"{"base": 21}"#).await.unwrap();
    assert_eq!(outcome.results.len(), 1);
}

/// not 组合与嵌套布尔树
#[tokio::test]
async fn test_nested_not_combination() {
    let engine = Engine::default();
    engine
        .add_rule_from_json(
            &json!({
                "name": "eligible",
                "conditions": {"all": [
                    {"fact": "age", "operator": "greaterThanInclusive", "value": 18},
                    {"not": {"fact": "banned", "operator": "equal", "value": true}}
                ]},
                "event": {"type": "eligibleEvent"}
            })
            .to_string(),
        )
        .unwrap();

    let outcome = engine
        .run(br#"{"age": 30, "banned": false}"#)
        .await
        .unwrap();
    assert_eq!(outcome.results.len(), 1);

    let outcome = engine
        .run(br#"{"age": 30, "banned": true}"#)
        .await
        .unwrap();
    assert!(outcome.results.is_empty());
}
