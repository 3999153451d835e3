//! Execution Timeline
//!
//! Records when nodes start and finish, for run reports and an ASCII
//! Gantt chart. Registered as an observer on the engine.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

use super::observer::ExecutionObserver;
use crate::execution::{NodeExecution, Status};

/// Type of timeline event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventType {
    /// Node began running
    Started,
    /// Node suspended on a task or an operator
    Waiting,
    /// Node reached a terminal status
    Finished(Status),
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Node execution id
    pub node_execution_id: String,
    /// Display label, `identifier` or `identifier#attempt`
    pub label: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Span {
    start: u128,
    end: Option<u128>,
    status: Option<Status>,
}

/// Tracks the execution timeline of plan runs.
#[derive(Debug)]
pub struct ExecutionTimeline {
    events: Mutex<Vec<TimelineEvent>>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            start_time: Instant::now(),
        }
    }

    /// Records an event for a node.
    pub fn add_event(&self, node_execution_id: &str, label: &str, event_type: EventType) {
        self.events.lock().push(TimelineEvent {
            node_execution_id: node_execution_id.to_string(),
            label: label.to_string(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    /// Returns all recorded events.
    pub fn events(&self) -> Vec<TimelineEvent> {
        self.events.lock().clone()
    }

    /// Returns the total elapsed time since timeline creation.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    fn spans(&self) -> Vec<(String, Span)> {
        let mut order: Vec<String> = Vec::new();
        let mut spans: HashMap<String, (String, Span)> = HashMap::new();

        for event in self.events.lock().iter() {
            let elapsed = event.timestamp.duration_since(self.start_time).as_millis();
            match &event.event_type {
                EventType::Started => {
                    if !spans.contains_key(&event.node_execution_id) {
                        order.push(event.node_execution_id.clone());
                        spans.insert(
                            event.node_execution_id.clone(),
                            (
                                event.label.clone(),
                                Span {
                                    start: elapsed,
                                    end: None,
                                    status: None,
                                },
                            ),
                        );
                    }
                }
                EventType::Waiting => {}
                EventType::Finished(status) => {
                    if let Some((_, span)) = spans.get_mut(&event.node_execution_id) {
                        span.end = Some(elapsed);
                        span.status = Some(*status);
                    }
                }
            }
        }

        order.into_iter().filter_map(|id| spans.remove(&id)).collect()
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Each finished node is a bar placed relative to the total run time.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.start_time.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        let mut spans = self.spans();
        spans.sort_by_key(|(_, span)| span.start);

        for (label, span) in spans {
            let (end, status) = match (span.end, span.status) {
                (Some(end), Some(status)) => (end, status),
                _ => continue,
            };
            let start_pos = (span.start as f64 * scale) as usize;
            let width = ((end.saturating_sub(span.start)) as f64 * scale).max(1.0) as usize;
            let mark = if status.is_failure() { "x" } else { "#" };

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&mark.repeat(width));

            output.push_str(&format!(
                "{:12} |{:50}| {} ({} ms)\n",
                truncate(&label, 12),
                bar,
                status,
                end.saturating_sub(span.start)
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// Returns node durations in milliseconds, keyed by label.
    pub fn durations(&self) -> HashMap<String, u128> {
        self.spans()
            .into_iter()
            .filter_map(|(label, span)| span.end.map(|end| (label, end.saturating_sub(span.start))))
            .collect()
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionObserver for ExecutionTimeline {
    fn on_node_status(&self, node: &NodeExecution, previous: Status) {
        let label = match node.retry_count() {
            0 => node.identifier.clone(),
            n => format!("{}#{}", node.identifier, n + 1),
        };

        let event = match node.status {
            Status::Running if previous == Status::Queued => EventType::Started,
            Status::AsyncWaiting | Status::InterventionWaiting => EventType::Waiting,
            status if status.is_terminal() => {
                // Nodes that never ran still get a zero-length bar.
                if previous == Status::Queued || previous == Status::Paused {
                    self.add_event(&node.id, &label, EventType::Started);
                }
                EventType::Finished(status)
            }
            _ => return,
        };
        self.add_event(&node.id, &label, event);
    }
}

/// Truncates a string to a maximum length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
