//! 规则引擎性能基准测试
//!
//! 覆盖操作符求值、条件解析与完整的引擎运行路径。

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use json_rules_engine::{Condition, Engine, EngineOptions, OperatorRegistry, ValueNode};
use serde_json::json;
use std::hint::black_box;

fn node(value: serde_json::Value) -> ValueNode {
    ValueNode::from(value)
}

/// 操作符求值基准
fn bench_operator_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("operator_apply");
    let registry = OperatorRegistry::with_defaults();

    let lhs = node(json!(1000));
    let rhs = node(json!(500));
    group.bench_function("greaterThan", |b| {
        b.iter(|| registry.apply(black_box("greaterThan"), black_box(&lhs), black_box(&rhs)))
    });

    let text = node(json!("hello world"));
    let suffix = node(json!("world"));
    group.bench_function("endsWith", |b| {
        b.iter(|| registry.apply(black_box("endsWith"), black_box(&text), black_box(&suffix)))
    });

    let deep_a = node(json!({"user": {"tags": ["a", "b"], "age": 30}}));
    let deep_b = node(json!({"user": {"tags": ["a", "b"], "age": 30}}));
    group.bench_function("equal_deep_object", |b| {
        b.iter(|| registry.apply(black_box("equal"), black_box(&deep_a), black_box(&deep_b)))
    });

    group.finish();
}

/// in 操作符随列表大小的伸缩
fn bench_in_operator_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("in_operator_scaling");
    let registry = OperatorRegistry::with_defaults();
    let target = node(json!("target"));

    for size in [5, 50, 500].iter() {
        let list: Vec<serde_json::Value> = (0..*size)
            .map(|i| {
                if i == size - 1 {
                    json!("target")
                } else {
                    json!(format!("item_{}", i))
                }
            })
            .collect();
        let list = node(serde_json::Value::Array(list));

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| registry.apply(black_box("in"), black_box(&target), black_box(&list)))
        });
    }

    group.finish();
}

/// 条件 JSON 解析基准
fn bench_condition_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("condition_parse");

    let leaf = json!({"fact": "user.age", "operator": "greaterThanInclusive", "value": 18})
        .to_string();
    group.bench_function("leaf", |b| {
        b.iter(|| serde_json::from_str::<Condition>(black_box(&leaf)).unwrap())
    });

    let nested = json!({
        "any": [
            {"all": [
                {"fact": "gameDuration", "operator": "equal", "value": 40},
                {"fact": "personalFoulCount", "operator": "greaterThanInclusive", "value": 5}
            ]},
            {"all": [
                {"fact": "gameDuration", "operator": "equal", "value": 48},
                {"fact": "personalFoulCount", "operator": "greaterThanInclusive", "value": 6}
            ]}
        ]
    })
    .to_string();
    group.bench_function("nested_tree", |b| {
        b.iter(|| serde_json::from_str::<Condition>(black_box(&nested)).unwrap())
    });

    group.finish();
}

/// 完整运行基准：规则装载一次，反复对不同事实求值
fn bench_engine_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_run");
    let runtime = tokio::runtime::Runtime::new().expect("构建 tokio 运行时");

    let engine = Engine::new(EngineOptions::default());
    engine
        .add_rule_from_json(
            &json!({
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
            .to_string(),
        )
        .unwrap();

    let matching = br#"{"personalFoulCount": 6, "gameDuration": 40}"#;
    group.bench_function("foul_out_match", |b| {
        b.iter(|| runtime.block_on(engine.run(black_box(matching))).unwrap())
    });

    let missing = br#"{"personalFoulCount": 4, "gameDuration": 40}"#;
    group.bench_function("foul_out_miss", |b| {
        b.iter(|| runtime.block_on(engine.run(black_box(missing))).unwrap())
    });

    group.finish();
}

/// 宽条件树的并发求值基准
fn bench_wide_condition_tree(c: &mut Criterion) {
    let mut group = c.benchmark_group("wide_condition_tree");
    group.sample_size(50);
    let runtime = tokio::runtime::Runtime::new().expect("构建 tokio 运行时");

    for width in [4usize, 16, 64].iter() {
        let children: Vec<serde_json::Value> = (0..*width)
            .map(|i| json!({"fact": format!("f{}", i), "operator": "equal", "value": 1}))
            .collect();
        let engine = Engine::new(EngineOptions::default());
        engine
            .add_rule_from_json(
                &json!({
                    "name": "wide",
                    "conditions": {"all": children},
                    "event": {"type": "wideEvent"}
                })
                .to_string(),
            )
            .unwrap();

        let mut facts = serde_json::Map::new();
        for i in 0..*width {
            facts.insert(format!("f{}", i), json!(1));
        }
        let body = serde_json::to_vec(&serde_json::Value::Object(facts)).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(width), width, |b, _| {
            b.iter(|| runtime.block_on(engine.run(black_box(&body))).unwrap())
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_operator_apply,
    bench_in_operator_scaling,
    bench_condition_parse,
    bench_engine_run,
    bench_wide_condition_tree,
);

criterion_main!(benches);
