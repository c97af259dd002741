//! Background device-presence monitor.
//!
//! A session's I/O must never race a locator call on the same port, so the
//! monitor is gated on a shared session-active flag: while the flag is set it
//! performs no discovery at all and backs off to a slower cadence. The owner
//! receives presence changes over a channel and decides what to do with them;
//! the monitor itself never opens a port or drives protocol traffic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::device;

/// Presence change reported to the session owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    /// A download-mode device appeared on the named port.
    Added(String),
    /// The device disappeared.
    Removed,
    /// The device moved to a different port between ticks.
    Changed {
        /// Previous port name.
        old: String,
        /// Current port name.
        new: String,
    },
}

/// Polling cadence of the monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Tick interval while no session is active.
    pub poll_idle: Duration,
    /// Back-off interval while a session holds the link.
    pub poll_session: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_idle: Duration::from_secs(2),
            poll_session: Duration::from_secs(5),
        }
    }
}

/// Handle to a running monitor thread.
pub struct PortMonitor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PortMonitor {
    /// Spawn a monitor using the passive device locator.
    pub fn spawn(events: Sender<PortEvent>, session_active: Arc<AtomicBool>) -> Self {
        Self::spawn_with(MonitorConfig::default(), events, session_active, || {
            device::find_download_port().map(|p| p.name)
        })
    }

    /// Spawn a monitor with a custom cadence and locator.
    pub fn spawn_with<F>(
        config: MonitorConfig,
        events: Sender<PortEvent>,
        session_active: Arc<AtomicBool>,
        locator: F,
    ) -> Self
    where
        F: Fn() -> Option<String> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = thread::spawn(move || {
            let mut last: Option<String> = None;

            while !stop_flag.load(Ordering::Relaxed) {
                if session_active.load(Ordering::Relaxed) {
                    // The locator must not touch the port under an active
                    // session; wait out the back-off without probing.
                    trace!("session active; monitor tick skipped");
                    sleep_responsive(&stop_flag, config.poll_session);
                    continue;
                }

                let current = locator();
                match (&last, &current) {
                    (None, Some(name)) => {
                        debug!("monitor: device appeared on {name}");
                        if events.send(PortEvent::Added(name.clone())).is_err() {
                            break;
                        }
                    }
                    (Some(_), None) => {
                        debug!("monitor: device removed");
                        if events.send(PortEvent::Removed).is_err() {
                            break;
                        }
                    }
                    (Some(old), Some(new)) if old != new => {
                        debug!("monitor: device moved {old} -> {new}");
                        let event = PortEvent::Changed {
                            old: old.clone(),
                            new: new.clone(),
                        };
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                    _ => {}
                }
                last = current;

                sleep_responsive(&stop_flag, config.poll_idle);
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop the monitor and join its thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PortMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sleep in short slices so a stop request does not wait out a full tick.
fn sleep_responsive(stop: &AtomicBool, total: Duration) {
    let started = Instant::now();
    while started.elapsed() < total {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        thread::sleep(Duration::from_millis(20).min(total));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::sync::Mutex;

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            poll_idle: Duration::from_millis(10),
            poll_session: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_added_and_removed_events() {
        let (tx, rx) = mpsc::channel();
        let session_active = Arc::new(AtomicBool::new(false));

        // Scripted presence: absent, present, present, absent, absent ...
        let script = Mutex::new(
            vec![
                None,
                Some("COM7".to_string()),
                Some("COM7".to_string()),
                None,
            ]
            .into_iter(),
        );
        let monitor = PortMonitor::spawn_with(
            fast_config(),
            tx,
            Arc::clone(&session_active),
            move || script.lock().unwrap().next().flatten(),
        );

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first, PortEvent::Added("COM7".to_string()));
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(second, PortEvent::Removed);

        monitor.stop();
    }

    #[test]
    fn test_changed_event_when_port_moves() {
        let (tx, rx) = mpsc::channel();
        let session_active = Arc::new(AtomicBool::new(false));

        let script = Mutex::new(
            vec![Some("COM3".to_string()), Some("COM9".to_string())].into_iter(),
        );
        let monitor = PortMonitor::spawn_with(
            fast_config(),
            tx,
            Arc::clone(&session_active),
            move || script.lock().unwrap().next().flatten(),
        );

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            PortEvent::Added("COM3".to_string())
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            PortEvent::Changed {
                old: "COM3".to_string(),
                new: "COM9".to_string(),
            }
        );

        monitor.stop();
    }

    #[test]
    fn test_no_locator_calls_while_session_active() {
        let (tx, _rx) = mpsc::channel();
        let session_active = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_locator = Arc::clone(&calls);

        let monitor = PortMonitor::spawn_with(
            fast_config(),
            tx,
            Arc::clone(&session_active),
            move || {
                calls_in_locator.fetch_add(1, Ordering::Relaxed);
                None
            },
        );

        thread::sleep(Duration::from_millis(150));
        assert_eq!(
            calls.load(Ordering::Relaxed),
            0,
            "locator must stay idle under an active session"
        );

        // Releasing the flag lets the polling resume.
        session_active.store(false, Ordering::Relaxed);
        thread::sleep(Duration::from_millis(150));
        assert!(calls.load(Ordering::Relaxed) > 0);

        monitor.stop();
    }

    #[test]
    fn test_stop_joins_promptly() {
        let (tx, _rx) = mpsc::channel();
        let monitor = PortMonitor::spawn_with(
            MonitorConfig {
                poll_idle: Duration::from_secs(60),
                poll_session: Duration::from_secs(60),
            },
            tx,
            Arc::new(AtomicBool::new(false)),
            || None,
        );

        let started = Instant::now();
        monitor.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
