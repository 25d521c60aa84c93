//! Assertions over orders, versions, and progress streams.

use crate::cache::CacheVersion;
use crate::core::{ProgressEvent, ProgressEventKind};
use crate::pipeline::StageDefinition;
use std::collections::HashMap;
use std::sync::Arc;

/// Asserts that every stage appears after all of its dependencies that are
/// part of the order.
pub fn assert_topological(order: &[Arc<StageDefinition>]) {
    let position: HashMap<&str, usize> = order
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();
    for (i, stage) in order.iter().enumerate() {
        for dep in &stage.depends_on {
            if let Some(&at) = position.get(dep.as_str()) {
                assert!(
                    at < i,
                    "Stage '{}' at {i} runs before its dependency '{dep}' at {at}",
                    stage.name
                );
            }
        }
    }
}

/// Asserts versions are numbered `1..=n` with exactly one current.
pub fn assert_versions_consistent(versions: &[CacheVersion]) {
    let numbers: Vec<u32> = versions.iter().map(|v| v.version).collect();
    let expected: Vec<u32> = (1..=u32::try_from(versions.len()).unwrap_or(u32::MAX)).collect();
    assert_eq!(numbers, expected, "Versions are not numbered 1..=n");
    if !versions.is_empty() {
        let current = versions.iter().filter(|v| v.is_current).count();
        assert_eq!(current, 1, "Expected exactly one current version, found {current}");
    }
}

/// Asserts that overall progress never decreases and never exceeds 100,
/// and that the stream ends with `Completed` at exactly 100.
pub fn assert_progress_completed(events: &[ProgressEvent]) {
    let Some(last) = events.last() else {
        panic!("Progress stream is empty");
    };
    for pair in events.windows(2) {
        assert!(
            pair[0].overall_progress_percent <= pair[1].overall_progress_percent,
            "Progress went backwards: {} -> {}",
            pair[0].overall_progress_percent,
            pair[1].overall_progress_percent
        );
    }
    for event in events {
        assert!(
            event.overall_progress_percent <= 100.0,
            "Progress exceeded 100: {}",
            event.overall_progress_percent
        );
        if event.kind != ProgressEventKind::Completed {
            assert!(
                event.overall_progress_percent < 100.0 || event.kind == ProgressEventKind::StageFinished,
                "Reported 100% before completion"
            );
        }
    }
    assert_eq!(last.kind, ProgressEventKind::Completed, "Stream did not end with Completed");
    assert!(
        (last.overall_progress_percent - 100.0).abs() < f64::EPSILON,
        "Completed event reported {}",
        last.overall_progress_percent
    );
}
