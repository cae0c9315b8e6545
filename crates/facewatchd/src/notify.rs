//! Show-once and cooldown gating for identity notifications.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use facewatch_core::{Clock, IdentityId};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// A notification the consumer should display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub identity_id: IdentityId,
    pub label: String,
    pub secondary_id: Option<String>,
    pub important: bool,
    pub distance: f32,
    pub shown_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct LabelState {
    last_shown_at: DateTime<Utc>,
    currently_shown: bool,
}

pub struct NotificationGate {
    clock: Arc<dyn Clock>,
    state: Mutex<HashMap<String, LabelState>>,
}

impl NotificationGate {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LabelState>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True if `label` may be shown now. A true answer marks it shown.
    pub fn should_show(&self, label: &str, cooldown: Duration) -> bool {
        let now = self.clock.now();
        let mut state = self.lock();
        if let Some(entry) = state.get(label) {
            if entry.currently_shown {
                return false;
            }
            // A clock step backwards counts as "not yet elapsed".
            let elapsed = (now - entry.last_shown_at).to_std().unwrap_or(Duration::ZERO);
            if elapsed < cooldown {
                return false;
            }
        }
        state.insert(
            label.to_string(),
            LabelState {
                last_shown_at: now,
                currently_shown: true,
            },
        );
        true
    }

    /// The consumer closed the notification. The cooldown keeps running.
    pub fn release(&self, label: &str) -> bool {
        match self.lock().get_mut(label) {
            Some(entry) if entry.currently_shown => {
                entry.currently_shown = false;
                true
            }
            _ => false,
        }
    }

    /// Forget every label. Returns how many were tracked.
    pub fn reset(&self) -> usize {
        let mut state = self.lock();
        let n = state.len();
        state.clear();
        n
    }

    pub fn tracked(&self) -> usize {
        self.lock().len()
    }
}

/// Display stand-in: log each notification and hand it to `close` once it
/// has been up for `display`.
///
/// One task owns every open notification. Deadlines are queued in arrival
/// order, which is also expiry order since `display` is fixed. When the
/// channel closes the remaining notifications are closed on schedule and the
/// function returns.
pub async fn display_notifications(
    mut rx: mpsc::Receiver<Notification>,
    display: Duration,
    close: impl Fn(&Notification),
) {
    let mut showing: VecDeque<(Instant, Notification)> = VecDeque::new();
    let mut open = true;
    loop {
        let next = showing.front().map(|(deadline, _)| *deadline);
        if !open && next.is_none() {
            break;
        }
        tokio::select! {
            received = rx.recv(), if open => match received {
                Some(note) => {
                    tracing::info!(
                        identity_id = %note.identity_id,
                        label = %note.label,
                        secondary_id = ?note.secondary_id,
                        important = note.important,
                        "face recognized"
                    );
                    showing.push_back((Instant::now() + display, note));
                }
                None => open = false,
            },
            _ = tokio::time::sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                if let Some((_, note)) = showing.pop_front() {
                    close(&note);
                }
            }
        }
    }
    tracing::debug!("notification display stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use facewatch_core::ManualClock;

    const COOLDOWN: Duration = Duration::from_secs(30);

    fn gate() -> (Arc<ManualClock>, NotificationGate) {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        (clock.clone(), NotificationGate::new(clock))
    }

    #[test]
    fn test_first_sighting_shows() {
        let (_, gate) = gate();
        assert!(gate.should_show("Alice", COOLDOWN));
        assert_eq!(gate.tracked(), 1);
    }

    #[test]
    fn test_currently_shown_blocks() {
        let (clock, gate) = gate();
        assert!(gate.should_show("Alice", COOLDOWN));
        clock.advance(chrono::Duration::seconds(120));
        assert!(!gate.should_show("Alice", COOLDOWN));
    }

    #[test]
    fn test_release_keeps_cooldown() {
        let (clock, gate) = gate();
        assert!(gate.should_show("Alice", COOLDOWN));
        assert!(gate.release("Alice"));
        assert!(!gate.should_show("Alice", COOLDOWN));

        clock.advance(chrono::Duration::seconds(29));
        assert!(!gate.release("Alice"));
        assert!(!gate.should_show("Alice", COOLDOWN));

        clock.advance(chrono::Duration::seconds(1));
        assert!(gate.should_show("Alice", COOLDOWN));
    }

    #[test]
    fn test_never_twice_within_cooldown() {
        let (clock, gate) = gate();
        let mut shown_at = Vec::new();
        for step in 0..200 {
            if gate.should_show("Alice", COOLDOWN) {
                shown_at.push(step);
            }
            gate.release("Alice");
            clock.advance(chrono::Duration::seconds(1));
        }
        assert!(shown_at.windows(2).all(|w| w[1] - w[0] >= 30), "{shown_at:?}");
        assert_eq!(shown_at.len(), 7);
    }

    #[test]
    fn test_labels_are_independent() {
        let (_, gate) = gate();
        assert!(gate.should_show("Alice", COOLDOWN));
        assert!(gate.should_show("Bob", COOLDOWN));
        assert!(!gate.release("Carol"));
    }

    #[test]
    fn test_clock_going_backwards() {
        let (clock, gate) = gate();
        assert!(gate.should_show("Alice", COOLDOWN));
        gate.release("Alice");
        clock.advance(chrono::Duration::seconds(-600));
        assert!(!gate.should_show("Alice", COOLDOWN));
    }

    #[test]
    fn test_reset() {
        let (_, gate) = gate();
        gate.should_show("Alice", COOLDOWN);
        gate.should_show("Bob", COOLDOWN);
        assert_eq!(gate.reset(), 2);
        assert!(gate.should_show("Alice", COOLDOWN));
    }

    fn note(label: &str) -> Notification {
        Notification {
            identity_id: IdentityId(1),
            label: label.into(),
            secondary_id: None,
            important: false,
            distance: 0.1,
            shown_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_display_closes_each_notification_once() {
        let display = Duration::from_millis(40);
        let closed = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel(8);
        let sink = closed.clone();
        let started = std::time::Instant::now();
        let task = tokio::spawn(display_notifications(rx, display, move |n| {
            sink.lock().unwrap().push((n.label.clone(), started.elapsed()));
        }));

        tx.send(note("Alice")).await.unwrap();
        tx.send(note("Bob")).await.unwrap();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        let closed = closed.lock().unwrap();
        let labels: Vec<&str> = closed.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(labels, ["Alice", "Bob"]);
        assert!(closed.iter().all(|(_, after)| *after >= display));
    }

    #[tokio::test]
    async fn test_display_stops_when_idle_channel_closes() {
        let (tx, rx) = mpsc::channel::<Notification>(1);
        drop(tx);
        tokio::time::timeout(
            Duration::from_secs(1),
            display_notifications(rx, Duration::from_secs(60), |_| panic!("nothing to close")),
        )
        .await
        .unwrap();
    }
}
