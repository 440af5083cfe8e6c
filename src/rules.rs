//! The rule engine (C5): correlation rule satisfaction, deterministic
//! selection, derived fields, and per-rule emission dedup.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{CorrelationRule, LineageEntry, MonoEvent, MultiEvent};
use crate::window::{chrono_duration, SlidingWindowBuffer};

/// Evaluates a fixed set of [`CorrelationRule`]s against a
/// [`SlidingWindowBuffer`], emitting at most one [`MultiEvent`] per rule
/// per call and suppressing re-emission of an identical selection (§4.5).
pub struct RuleEngine {
    rules: Vec<CorrelationRule>,
    last_emission: HashMap<String, HashSet<Uuid>>,
}

impl RuleEngine {
    #[must_use]
    pub fn new(rules: Vec<CorrelationRule>) -> Self {
        Self {
            rules,
            last_emission: HashMap::new(),
        }
    }

    #[must_use]
    pub fn rules(&self) -> &[CorrelationRule] {
        &self.rules
    }

    /// Evaluates every rule once against `buffer`, returning the multi
    /// events to emit, in rule order.
    pub fn evaluate(&mut self, buffer: &SlidingWindowBuffer, now: DateTime<Utc>) -> Vec<MultiEvent> {
        let mut emissions = Vec::new();

        for rule in &self.rules {
            let Some(multi) = evaluate_rule(rule, buffer, now) else {
                continue;
            };

            let selection: HashSet<Uuid> = multi.source_events.iter().copied().collect();
            let is_repeat = self.last_emission.get(&rule.name) == Some(&selection);
            if is_repeat {
                continue;
            }

            self.last_emission.insert(rule.name.clone(), selection);
            emissions.push(multi);
        }

        emissions
    }
}

/// Orders by "newest wins": later timestamp, then larger `event_id` on a
/// timestamp tie (§4.5 tie-break).
fn newer(a: &MonoEvent, b: &MonoEvent) -> std::cmp::Ordering {
    a.timestamp.cmp(&b.timestamp).then(a.event_id.cmp(&b.event_id))
}

fn evaluate_rule(
    rule: &CorrelationRule,
    buffer: &SlidingWindowBuffer,
    now: DateTime<Utc>,
) -> Option<MultiEvent> {
    let candidates: Vec<&MonoEvent> = buffer.iter_recent(rule.window_duration, now).collect();

    let mut picked: Vec<&MonoEvent> = Vec::with_capacity(rule.min_events as usize);
    let mut picked_ids: HashSet<Uuid> = HashSet::with_capacity(rule.min_events as usize);

    for event_type in &rule.required_event_types {
        let newest = candidates
            .iter()
            .copied()
            .filter(|e| &e.event_type == event_type)
            .max_by(|a, b| newer(a, b))?;
        picked.push(newest);
        picked_ids.insert(newest.event_id);
    }

    if picked.len() < rule.min_events as usize {
        let mut remaining: Vec<&MonoEvent> = candidates
            .iter()
            .copied()
            .filter(|e| {
                rule.required_event_types.contains(&e.event_type) && !picked_ids.contains(&e.event_id)
            })
            .collect();
        remaining.sort_by(|a, b| newer(b, a));

        for event in remaining {
            if picked.len() >= rule.min_events as usize {
                break;
            }
            picked_ids.insert(event.event_id);
            picked.push(event);
        }

        if picked.len() < rule.min_events as usize {
            return None;
        }
    }

    let max_ts = picked.iter().map(|e| e.timestamp).max()?;
    let min_ts = picked.iter().map(|e| e.timestamp).min()?;
    if max_ts - min_ts > chrono_duration(rule.window_duration) {
        return None;
    }

    let integrated_value = picked.iter().map(|e| e.value).sum::<f64>() / picked.len() as f64;
    let confidence = (picked.len() as f64 / 3.0).min(1.0);

    let mut lineage: HashMap<String, LineageEntry> = HashMap::new();
    for event in &picked {
        lineage
            .entry(event.source_stream.clone())
            .and_modify(|existing| {
                let existing_is_newer = existing.timestamp > event.timestamp
                    || (existing.timestamp == event.timestamp && existing.event_id > event.event_id);
                if !existing_is_newer {
                    existing.event_id = event.event_id;
                    existing.timestamp = event.timestamp;
                    existing.value = event.value;
                }
            })
            .or_insert_with(|| LineageEntry {
                event_id: event.event_id,
                timestamp: event.timestamp,
                value: event.value,
            });
    }

    Some(MultiEvent {
        event_id: Uuid::now_v7(),
        timestamp: now,
        source_events: picked.iter().map(|e| e.event_id).collect(),
        correlation_rule: rule.name.clone(),
        integrated_value,
        confidence,
        lineage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventType, Metadata};
    use chrono::Duration as ChronoDuration;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn mono(now: DateTime<Utc>, offset_secs: i64, source_stream: &str, event_type: &str, value: f64) -> MonoEvent {
        MonoEvent::new(
            now + ChronoDuration::milliseconds((offset_secs * 1000) as i64),
            source_stream,
            event_type,
            value,
            Metadata::new(),
        )
        .unwrap()
    }

    fn rule_ab() -> CorrelationRule {
        let mut types = BTreeSet::new();
        types.insert(EventType::new("A"));
        types.insert(EventType::new("B"));
        CorrelationRule::new("AB", Duration::from_secs(2), types, 2).unwrap()
    }

    fn rule_abc() -> CorrelationRule {
        let mut types = BTreeSet::new();
        types.insert(EventType::new("A"));
        types.insert(EventType::new("B"));
        types.insert(EventType::new("C"));
        CorrelationRule::new("ABC", Duration::from_secs(2), types, 3).unwrap()
    }

    #[test]
    fn single_rule_firing() {
        let now = Utc::now();
        let mut buffer = SlidingWindowBuffer::new(100, Duration::from_secs(2));
        let a = mono(now, 0, "s1", "A", 10.0);
        let b = mono(now, 1, "s2", "B", 20.0);
        buffer.push(a.clone(), now + ChronoDuration::seconds(0));
        buffer.push(b.clone(), now + ChronoDuration::seconds(1));

        let mut engine = RuleEngine::new(vec![rule_ab()]);
        let emissions = engine.evaluate(&buffer, now + ChronoDuration::seconds(1));

        assert_eq!(emissions.len(), 1);
        let multi = &emissions[0];
        assert_eq!(multi.source_events, vec![a.event_id, b.event_id]);
        assert!((multi.integrated_value - 15.0).abs() < 1e-9);
        assert!((multi.confidence - (2.0 / 3.0)).abs() < 1e-9);
        let mut streams: Vec<&String> = multi.lineage.keys().collect();
        streams.sort();
        assert_eq!(streams, vec!["s1", "s2"]);
    }

    #[test]
    fn three_way_convergence() {
        let now = Utc::now();
        let mut buffer = SlidingWindowBuffer::new(100, Duration::from_secs(2));
        buffer.push(mono(now, 0, "s1", "A", 10.0), now);
        buffer.push(mono(now, 500, "s2", "B", 20.0), now + ChronoDuration::milliseconds(500));
        buffer.push(mono(now, 1000, "s3", "C", 30.0), now + ChronoDuration::seconds(1));

        let mut engine = RuleEngine::new(vec![rule_abc()]);
        let emissions = engine.evaluate(&buffer, now + ChronoDuration::seconds(1));

        assert_eq!(emissions.len(), 1);
        let multi = &emissions[0];
        assert!((multi.integrated_value - 20.0).abs() < 1e-9);
        assert!((multi.confidence - 1.0).abs() < 1e-9);
        assert_eq!(multi.lineage.len(), 3);
    }

    #[test]
    fn out_of_window_suppression() {
        let now = Utc::now();
        let mut buffer = SlidingWindowBuffer::new(100, Duration::from_secs(2));
        buffer.push(mono(now, 0, "s1", "A", 10.0), now);
        // B arrives at t=3, well after A was pruned (max_window=2s)
        buffer.push(mono(now, 3, "s2", "B", 20.0), now + ChronoDuration::seconds(3));

        let mut engine = RuleEngine::new(vec![rule_ab()]);
        let emissions = engine.evaluate(&buffer, now + ChronoDuration::seconds(3));
        assert!(emissions.is_empty());
    }

    #[test]
    fn rule_dedup_on_duplicate_trigger() {
        let now = Utc::now();
        let mut buffer = SlidingWindowBuffer::new(100, Duration::from_secs(2));
        let a = mono(now, 0, "s1", "A", 10.0);
        let b1 = mono(now, 0, "s2", "B", 20.0);
        buffer.push(a.clone(), now);
        buffer.push(b1.clone(), now);

        let mut engine = RuleEngine::new(vec![rule_ab()]);
        let first = engine.evaluate(&buffer, now);
        assert_eq!(first.len(), 1);

        // same selection re-evaluated: no duplicate emission
        let repeat = engine.evaluate(&buffer, now);
        assert!(repeat.is_empty());

        // a newer B arrives; A is unchanged
        let b2 = mono(now, 1, "s2", "B", 25.0);
        buffer.push(b2.clone(), now + ChronoDuration::seconds(1));
        let second = engine.evaluate(&buffer, now + ChronoDuration::seconds(1));

        assert_eq!(second.len(), 1);
        assert_eq!(second[0].source_events, vec![a.event_id, b2.event_id]);
        assert_ne!(second[0].source_events, first[0].source_events);
    }

    #[test]
    fn missing_required_type_does_not_fire() {
        let now = Utc::now();
        let mut buffer = SlidingWindowBuffer::new(100, Duration::from_secs(2));
        buffer.push(mono(now, 0, "s1", "A", 10.0), now);

        let mut engine = RuleEngine::new(vec![rule_ab()]);
        assert!(engine.evaluate(&buffer, now).is_empty());
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: whenever a rule fires, `integrated_value` (the mean of
        /// the picked events' values) falls within the min/max of those
        /// values, for any finite value pair.
        #[test]
        fn integrated_value_stays_within_picked_range(a_value in -1e6_f64..1e6, b_value in -1e6_f64..1e6) {
            let now = Utc::now();
            let mut buffer = SlidingWindowBuffer::new(100, Duration::from_secs(2));
            buffer.push(mono(now, 0, "s1", "A", a_value), now);
            buffer.push(mono(now, 0, "s2", "B", b_value), now);

            let mut engine = RuleEngine::new(vec![rule_ab()]);
            let emissions = engine.evaluate(&buffer, now);

            prop_assert_eq!(emissions.len(), 1);
            let integrated = emissions[0].integrated_value;
            let lo = a_value.min(b_value);
            let hi = a_value.max(b_value);
            prop_assert!(integrated >= lo - 1e-6 && integrated <= hi + 1e-6);
        }
    }
}
