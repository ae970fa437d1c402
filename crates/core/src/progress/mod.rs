//! Mapping of stage-local progress onto one global percentage stream.
//!
//! Each stage owns a slice `(base, span)` of the global 0–100 range. Local
//! progress reported by a stage is clamped to 0–100 and projected into its
//! slice. The global value never moves backward: updates below the last value
//! reported for the same stage are dropped.

use ak_protocol::ipc::Event;
use ak_protocol::pipeline_models::ProgressRange;
use ak_protocol::run_models::ProgressEvent;
use std::collections::HashMap;
use tokio::sync::mpsc::Sender;
use uuid::Uuid;

/// Project a local percentage into a stage's slice of global progress.
///
/// ```
/// use ak_core::progress::global_percent;
/// use ak_protocol::pipeline_models::ProgressRange;
///
/// assert_eq!(global_percent(ProgressRange::new(40.0, 50.0), 50.0), 65.0);
/// assert_eq!(global_percent(ProgressRange::new(40.0, 50.0), 250.0), 90.0);
/// ```
pub fn global_percent(range: ProgressRange, local_percent: f64) -> f64 {
    let local = if local_percent.is_nan() {
        0.0
    } else {
        local_percent.clamp(0.0, 100.0)
    };
    (range.base + local / 100.0 * range.span).clamp(0.0, 100.0)
}

/// Forwards progress of one run to its event channel.
pub struct ProgressAggregator {
    run_id: Uuid,
    events_tx: Sender<Event>,
    stage_last: HashMap<String, f64>,
    global: f64,
    last_message: String,
}

impl ProgressAggregator {
    pub fn new(run_id: Uuid, events_tx: Sender<Event>) -> Self {
        Self {
            run_id,
            events_tx,
            stage_last: HashMap::new(),
            global: 0.0,
            last_message: String::new(),
        }
    }

    /// Last global percentage delivered.
    pub fn percent(&self) -> f64 {
        self.global
    }

    /// Last human readable message delivered.
    pub fn last_message(&self) -> &str {
        &self.last_message
    }

    /// Report stage-local progress.
    ///
    /// Returns the delivered event, or `None` when the update was dropped
    /// because it would move the stage's progress backward.
    pub async fn report(
        &mut self,
        stage: &str,
        range: ProgressRange,
        local_percent: f64,
        message: impl Into<String>,
        raw_line: Option<String>,
    ) -> Option<ProgressEvent> {
        let computed = global_percent(range, local_percent);
        if let Some(last) = self.stage_last.get(stage) {
            if computed < *last {
                tracing::trace!(stage, computed, last, "dropped out-of-order progress");
                return None;
            }
        }

        let percent = computed.max(self.global);
        self.stage_last.insert(stage.to_string(), percent);
        self.deliver(stage, percent, message.into(), raw_line).await
    }

    /// Forward a raw output line at the stage's current progress.
    pub async fn line(&mut self, stage: &str, range: ProgressRange, raw_line: String) {
        let percent = self
            .stage_last
            .get(stage)
            .copied()
            .unwrap_or(range.base)
            .max(self.global);
        self.stage_last.insert(stage.to_string(), percent);
        let message = raw_line.trim().to_string();
        self.deliver(stage, percent, message, Some(raw_line)).await;
    }

    /// Report the end of the pipeline at 100%.
    pub async fn finish(&mut self, stage: &str, message: impl Into<String>) {
        self.stage_last.insert(stage.to_string(), 100.0);
        self.deliver(stage, 100.0, message.into(), None).await;
    }

    async fn deliver(
        &mut self,
        stage: &str,
        percent: f64,
        message: String,
        raw_line: Option<String>,
    ) -> Option<ProgressEvent> {
        self.global = percent;
        if raw_line.is_none() || !message.is_empty() {
            self.last_message.clone_from(&message);
        }

        let event = ProgressEvent {
            stage: stage.to_string(),
            percent,
            message,
            raw_line,
        };
        let _ = self
            .events_tx
            .send(Event::Progress {
                run_id: self.run_id,
                event: event.clone(),
            })
            .await;
        Some(event)
    }
}
