//! Runtime detection of overlapping reads and writes across commands.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use tracing::error;

use kiln_core::{IgnoreLock as _, ObjectId, ObjectUrl};

use crate::step::StepId;

#[derive(Debug)]
struct AccessWindow {
    title: String,
    start: Instant,
    end: Option<Instant>,
    reads: Vec<ObjectUrl>,
    writes: Vec<(ObjectUrl, ObjectId)>,
}

impl AccessWindow {
    fn overlaps(&self, start: Instant, end: Instant) -> bool {
        self.start <= end && self.end.is_none_or(|own_end| own_end >= start)
    }
}

/// Watches the actual reads and writes of executing commands and reports
/// temporal overlaps on the same url as hazards.
///
/// This is the runtime complement to the static merge check: the merge
/// check reasons about declared maps, the monitor about wall-clock
/// execution windows. Hazards are diagnostics; they never fail the build
/// by themselves.
#[derive(Debug, Default)]
pub struct IoMonitor {
    windows: Mutex<HashMap<StepId, AccessWindow>>,
    hazards: AtomicUsize,
}

impl IoMonitor {
    /// Creates an empty monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens an access window for a command that starts executing,
    /// recording a read per declared input.
    pub fn command_started(&self, step: StepId, title: &str, inputs: &[ObjectUrl]) {
        let mut windows = self.windows.lock_ignore_poison();
        windows.insert(
            step,
            AccessWindow {
                title: title.to_owned(),
                start: Instant::now(),
                end: None,
                reads: inputs.to_vec(),
                writes: Vec::new(),
            },
        );
    }

    /// Closes a command's access window, recording its writes, and checks
    /// the closed window against every overlapping one.
    pub fn command_finished(&self, step: StepId, outputs: &[(ObjectUrl, ObjectId)]) {
        let now = Instant::now();
        let mut windows = self.windows.lock_ignore_poison();

        let Some(mut window) = windows.remove(&step) else {
            return;
        };
        window.end = Some(now);
        window.writes = outputs.to_vec();

        for other in windows.values() {
            if !other.overlaps(window.start, now) {
                continue;
            }
            for (url, id) in &window.writes {
                if other.reads.contains(url) {
                    self.report(
                        "write overlapped a concurrent read",
                        url,
                        &window.title,
                        &other.title,
                    );
                }
                if other
                    .writes
                    .iter()
                    .any(|(other_url, other_id)| other_url == url && other_id != id)
                {
                    self.report(
                        "two concurrent writes produced different objects",
                        url,
                        &window.title,
                        &other.title,
                    );
                }
            }
            for url in &window.reads {
                if other.writes.iter().any(|(other_url, _)| other_url == url) {
                    self.report(
                        "read overlapped a concurrent write",
                        url,
                        &window.title,
                        &other.title,
                    );
                }
            }
        }

        windows.insert(step, window);
        Self::collect_garbage(&mut windows);
    }

    /// Number of hazards reported so far.
    pub fn hazard_count(&self) -> usize {
        self.hazards.load(Ordering::Relaxed)
    }

    fn report(&self, what: &str, url: &ObjectUrl, first: &str, second: &str) {
        self.hazards.fetch_add(1, Ordering::Relaxed);
        error!(
            url = %url,
            first_step = first,
            second_step = second,
            "io hazard: {what}"
        );
    }

    /// Drops closed windows that can no longer overlap any running
    /// command.
    fn collect_garbage(windows: &mut HashMap<StepId, AccessWindow>) {
        let Some(earliest_running) = windows
            .values()
            .filter(|window| window.end.is_none())
            .map(|window| window.start)
            .min()
        else {
            windows.retain(|_, window| window.end.is_none());
            return;
        };
        windows.retain(|_, window| {
            window.end.is_none_or(|end| end >= earliest_running)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlapping_write_and_read_is_a_hazard() {
        let monitor = IoMonitor::new();
        let reader = StepId::new();
        let writer = StepId::new();
        let url = ObjectUrl::file("assets/grass.png");

        monitor.command_started(reader, "reader", std::slice::from_ref(&url));
        monitor.command_started(writer, "writer", &[]);
        monitor.command_finished(writer, &[(url, ObjectId::digest(b"new"))]);
        assert_eq!(monitor.hazard_count(), 1);
    }

    #[test]
    fn test_disjoint_windows_are_not_hazards() {
        let monitor = IoMonitor::new();
        let first = StepId::new();
        let second = StepId::new();
        let url = ObjectUrl::file("assets/grass.png");

        monitor.command_started(first, "first", &[]);
        monitor.command_finished(first, &[(url.clone(), ObjectId::digest(b"new"))]);

        // Second starts after first finished; the closed window has been
        // garbage collected, and even if it had not, ids are equal.
        monitor.command_started(second, "second", std::slice::from_ref(&url));
        monitor.command_finished(second, &[]);
        assert_eq!(monitor.hazard_count(), 0);
    }

    #[test]
    fn test_concurrent_identical_writes_are_not_hazards() {
        let monitor = IoMonitor::new();
        let first = StepId::new();
        let second = StepId::new();
        let url = ObjectUrl::content("fonts/atlas");
        let blob = ObjectId::digest(b"same");

        monitor.command_started(first, "first", &[]);
        monitor.command_started(second, "second", &[]);
        monitor.command_finished(first, &[(url.clone(), blob)]);
        monitor.command_finished(second, &[(url, blob)]);
        assert_eq!(monitor.hazard_count(), 0);
    }

    #[test]
    fn test_concurrent_differing_writes_are_hazards() {
        let monitor = IoMonitor::new();
        let first = StepId::new();
        let second = StepId::new();
        let url = ObjectUrl::content("fonts/atlas");

        monitor.command_started(first, "first", &[]);
        monitor.command_started(second, "second", &[]);
        monitor.command_finished(first, &[(url.clone(), ObjectId::digest(b"a"))]);
        monitor.command_finished(second, &[(url, ObjectId::digest(b"b"))]);
        assert_eq!(monitor.hazard_count(), 1);
    }
}
