//! Assertion helpers over the event stream of a run.

use ak_protocol::ipc::Event;
use ak_protocol::run_models::StageStatus;

/// Global percentages of every progress event, in emission order.
pub fn progress_values(events: &[Event]) -> Vec<f64> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Progress { event, .. } => Some(event.percent),
            _ => None,
        })
        .collect()
}

/// Global progress never moves backward and stays within 0..=100.
pub fn assert_monotonic_progress(events: &[Event]) {
    let values = progress_values(events);
    for pair in values.windows(2) {
        assert!(
            pair[1] >= pair[0],
            "progress went backward: {} -> {} in {values:?}",
            pair[0],
            pair[1]
        );
    }
    assert!(values.iter().all(|v| (0.0..=100.0).contains(v)));
}

/// First event is `RunStarted` and exactly one terminal event comes last.
pub fn assert_event_sequence(events: &[Event]) {
    assert!(!events.is_empty(), "Event sequence is empty");
    assert!(
        matches!(events[0], Event::RunStarted { .. }),
        "First event should be RunStarted, got: {:?}",
        events[0]
    );

    let terminal: Vec<&Event> = events.iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminal.len(), 1, "expected one terminal event: {terminal:?}");
    let last = events.last().unwrap();
    assert!(last.is_terminal(), "Last event should be terminal, got: {last:?}");
}

/// Status updates emitted for `stage`, as `(status, skipped)`.
pub fn stage_updates(events: &[Event], stage: &str) -> Vec<(StageStatus, bool)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::StageStatusUpdate {
                stage: s,
                status,
                skipped,
                ..
            } if s == stage => Some((*status, *skipped)),
            _ => None,
        })
        .collect()
}

/// Raw output lines forwarded for `stage`.
pub fn raw_lines(events: &[Event], stage: &str) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Progress { event, .. } if event.stage == stage => event.raw_line.clone(),
            _ => None,
        })
        .collect()
}

pub fn has_failure(events: &[Event]) -> bool {
    events.iter().any(|e| matches!(e, Event::RunFailed { .. }))
}
