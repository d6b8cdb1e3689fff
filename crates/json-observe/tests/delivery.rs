mod common;

use std::time::Duration;

use json_observe::{ChangeKind, Clock, Container, DeliveryMode, Value};
use serde_json::json;

use common::{manual_registry, ms, Collector};

fn kinds_and_paths(pairs: &[(ChangeKind, &str)]) -> Vec<(ChangeKind, String)> {
    pairs.iter().map(|(k, p)| (*k, p.to_string())).collect()
}

#[test]
fn batched_writes_arrive_in_one_flush() {
    let (registry, clock) = manual_registry(10_000, 10);
    let doc = Container::object();
    let collector = Collector::default();
    let root = registry
        .create(&doc, 50u64, Some(collector.observer()))
        .unwrap();

    root.set("a", 1).unwrap();
    root.set("b", 2).unwrap();
    root.set("a", 3).unwrap();

    assert_eq!(collector.flush_count(), 0);
    assert_eq!(registry.pending_changes(&root), Ok(3));
    assert_eq!(registry.pending_tasks(), 1);
    assert_eq!(registry.next_deadline(), Some(clock.now() + ms(50)));

    clock.advance(ms(49));
    assert_eq!(registry.run_due_tasks(), 0);
    clock.advance(ms(1));
    assert_eq!(registry.run_due_tasks(), 1);

    assert_eq!(collector.flush_count(), 1);
    assert_eq!(
        collector.paths(),
        kinds_and_paths(&[
            (ChangeKind::Add, "a"),
            (ChangeKind::Add, "b"),
            (ChangeKind::Update, "a"),
        ])
    );
    assert_eq!(registry.pending_changes(&root), Ok(0));
    assert_eq!(registry.next_deadline(), None);
}

#[test]
fn batched_true_uses_configured_delay() {
    let (registry, clock) = manual_registry(10_000, 25);
    let doc = Container::object();
    let collector = Collector::default();
    let root = registry.create(&doc, true, Some(collector.observer())).unwrap();

    root.set("x", 1).unwrap();
    root.set("y", 2).unwrap();
    clock.advance(ms(24));
    registry.run_due_tasks();
    assert_eq!(collector.flush_count(), 0);

    clock.advance(ms(1));
    registry.run_due_tasks();
    assert_eq!(collector.flush_count(), 1);
    assert_eq!(collector.records().len(), 2);

    root.set("z", 3).unwrap();
    assert_eq!(registry.pending_tasks(), 1);
    clock.advance(Duration::from_millis(25));
    registry.run_due_tasks();
    assert_eq!(collector.flush_count(), 2);
}

#[test]
fn explicit_delivery_modes() {
    let (registry, clock) = manual_registry(10_000, 10);
    let collector = Collector::default();
    let root = registry
        .create(
            Container::object(),
            DeliveryMode::Batched(Some(ms(5))),
            Some(collector.observer()),
        )
        .unwrap();
    root.set("k", 1).unwrap();
    clock.advance(ms(5));
    registry.run_due_tasks();
    assert_eq!(collector.flush_count(), 1);

    let immediate = Collector::default();
    let other = registry
        .create(Container::object(), DeliveryMode::Immediate, Some(immediate.observer()))
        .unwrap();
    other.set("k", 1).unwrap();
    assert_eq!(immediate.flush_count(), 1);
    assert_eq!(registry.pending_tasks(), 0);
}

#[test]
fn flush_for_removed_context_is_a_no_op() {
    let (registry, clock) = manual_registry(10_000, 10);
    let collector = Collector::default();
    let root = registry
        .create(Container::object(), true, Some(collector.observer()))
        .unwrap();
    root.set("k", 1).unwrap();
    registry.remove(&root);

    clock.advance(ms(10));
    assert_eq!(registry.run_due_tasks(), 1);
    assert_eq!(collector.flush_count(), 0);
}

#[test]
fn paused_changes_are_never_delivered() {
    let (registry, _clock) = manual_registry(10_000, 10);
    let doc = Container::object();
    let collector = Collector::default();
    let root = registry
        .create(&doc, false, Some(collector.observer()))
        .unwrap();

    registry.pause(&root).unwrap();
    root.set("a", 1).unwrap();
    root.set("b", 2).unwrap();
    assert_eq!(collector.flush_count(), 0);
    assert_eq!(doc.get("a"), Some(Value::from(1)));

    registry.resume(&root).unwrap();
    assert_eq!(collector.flush_count(), 0);

    root.set("c", 3).unwrap();
    assert_eq!(collector.flush_count(), 1);
    assert_eq!(collector.paths(), kinds_and_paths(&[(ChangeKind::Add, "c")]));
    assert_eq!(registry.pending_changes(&root), Ok(0));
}

#[test]
fn paused_batched_context_schedules_nothing() {
    let (registry, clock) = manual_registry(10_000, 10);
    let collector = Collector::default();
    let root = registry
        .create(Container::object(), true, Some(collector.observer()))
        .unwrap();

    registry.pause(&root).unwrap();
    root.set("a", 1).unwrap();
    assert_eq!(registry.pending_tasks(), 0);

    registry.resume(&root).unwrap();
    root.set("b", 1).unwrap();
    clock.advance(ms(10));
    registry.run_due_tasks();
    assert_eq!(collector.paths(), kinds_and_paths(&[(ChangeKind::Add, "b")]));
}

#[test]
fn pause_changes_records_without_writing() {
    let (registry, _clock) = manual_registry(10_000, 10);
    let doc = Container::from_json(&json!({"a": 1})).unwrap();
    let collector = Collector::default();
    let root = registry
        .create(&doc, false, Some(collector.observer()))
        .unwrap();

    registry.pause_changes(&root).unwrap();
    root.set("a", 5).unwrap();
    root.set("b", 6).unwrap();

    assert_eq!(
        collector.paths(),
        kinds_and_paths(&[(ChangeKind::Update, "a"), (ChangeKind::Add, "b")])
    );
    assert_eq!(doc.to_json(), json!({"a": 1}));

    registry.resume_changes(&root).unwrap();
    collector.clear();
    root.set("a", 5).unwrap();

    assert_eq!(collector.paths(), kinds_and_paths(&[(ChangeKind::Update, "a")]));
    assert_eq!(collector.records()[0].previous_value, Some(Value::from(1)));
    assert_eq!(doc.to_json(), json!({"a": 5}));
}

#[test]
fn observer_failure_is_isolated_in_batched_flush() {
    let (registry, clock) = manual_registry(10_000, 10);
    let collector = Collector::default();
    let root = registry
        .create(Container::object(), true, None)
        .unwrap();
    registry
        .observe(&root, |_| panic!("boom"))
        .unwrap();
    let forward = collector.observer();
    registry.observe(&root, move |changes| forward(changes)).unwrap();

    root.set("a", 1).unwrap();
    clock.advance(ms(10));
    assert_eq!(registry.run_due_tasks(), 1);
    assert_eq!(collector.flush_count(), 1);

    root.set("b", 1).unwrap();
    clock.advance(ms(10));
    registry.run_due_tasks();
    assert_eq!(collector.flush_count(), 2);
}

#[test]
fn flush_firing_while_paused_leaves_the_backlog_for_the_next_flush() {
    let (registry, clock) = manual_registry(10_000, 10);
    let doc = Container::object();
    let collector = Collector::default();
    let root = registry.create(&doc, true, Some(collector.observer())).unwrap();

    root.set("a", 1).unwrap();
    registry.pause(&root).unwrap();
    clock.advance(ms(10));
    assert_eq!(registry.run_due_tasks(), 1);
    assert_eq!(collector.flush_count(), 0);
    assert_eq!(registry.pending_changes(&root), Ok(1));

    registry.resume(&root).unwrap();
    clock.advance(ms(10));
    assert_eq!(registry.run_due_tasks(), 0);
    assert_eq!(collector.flush_count(), 0);

    root.set("b", 2).unwrap();
    assert_eq!(registry.pending_tasks(), 1);
    clock.advance(ms(10));
    assert_eq!(registry.run_due_tasks(), 1);
    assert_eq!(collector.flush_sizes(), [2]);
    assert_eq!(
        collector.paths(),
        kinds_and_paths(&[(ChangeKind::Add, "a"), (ChangeKind::Add, "b")])
    );

    clock.advance(ms(10));
    assert_eq!(registry.run_due_tasks(), 0);
    assert_eq!(collector.flush_sizes(), [2]);
    assert_eq!(registry.pending_changes(&root), Ok(0));
}
