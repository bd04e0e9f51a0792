//! Per-turn latency marks
//!
//! Components record named milestones; when the turn ends the session logs the
//! time between consecutive marks on one line.

use parking_lot::Mutex;
use std::time::Instant;
use tracing::info;

#[derive(Default)]
pub struct Timeline {
    marks: Mutex<Vec<(&'static str, Instant)>>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, name: &'static str) {
        self.marks.lock().push((name, Instant::now()));
    }

    /// Render marks as `name +Nms` relative to the previous mark, and reset.
    pub fn take_report(&self) -> String {
        let marks = std::mem::take(&mut *self.marks.lock());
        let mut previous: Option<Instant> = None;
        marks
            .into_iter()
            .map(|(name, at)| {
                let delta = previous.map_or(0, |p| at.duration_since(p).as_millis());
                previous = Some(at);
                format!("{name} +{delta}ms")
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn log(&self, session_id: &str) {
        let report = self.take_report();
        if !report.is_empty() {
            info!("⏱️ [{}] {}", session_id, report);
        }
    }
}
