//! Progress events published by the dispatch engine. Workers only ever send
//! on an unbounded channel; rendering happens on the reporter thread.

use std::sync::mpsc::{Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub average: Option<Duration>,
    pub eta: Option<Duration>,
}

impl StatsSnapshot {
    pub fn finished(&self) -> usize {
        self.succeeded + self.failed
    }
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Started {
        total: usize,
        skipped: usize,
        workers: usize,
    },
    UnitFinished {
        trial_index: u32,
        ok: bool,
        elapsed: Duration,
        detail: Option<String>,
        snapshot: StatsSnapshot,
    },
    Aborted {
        reason: String,
    },
    Finished {
        snapshot: StatsSnapshot,
        elapsed: Duration,
    },
}

pub type ProgressSender = Sender<ProgressEvent>;

fn fmt_secs(d: Option<Duration>) -> String {
    match d {
        Some(d) => format!("{:.1}s", d.as_secs_f64()),
        None => "-".to_string(),
    }
}

/// Spawns the thread that renders progress through `tracing`. It exits when
/// every sender has been dropped.
pub fn spawn_reporter(rx: Receiver<ProgressEvent>) -> JoinHandle<()> {
    thread::spawn(move || {
        for event in rx {
            match event {
                ProgressEvent::Started {
                    total,
                    skipped,
                    workers,
                } => info!(total, skipped, workers, "dispatch started"),
                ProgressEvent::UnitFinished {
                    trial_index,
                    ok,
                    elapsed,
                    detail,
                    snapshot,
                } => {
                    let line = format!(
                        "[{}/{}] trial {} {} in {:.1}s (avg {}, eta {})",
                        snapshot.finished(),
                        snapshot.total,
                        trial_index,
                        if ok { "ok" } else { "failed" },
                        elapsed.as_secs_f64(),
                        fmt_secs(snapshot.average),
                        fmt_secs(snapshot.eta),
                    );
                    match detail {
                        Some(detail) if !ok => warn!("{}: {}", line, detail),
                        _ => info!("{}", line),
                    }
                }
                ProgressEvent::Aborted { reason } => warn!(%reason, "dispatch aborted"),
                ProgressEvent::Finished { snapshot, elapsed } => info!(
                    succeeded = snapshot.succeeded,
                    failed = snapshot.failed,
                    total = snapshot.total,
                    elapsed = %fmt_secs(Some(elapsed)),
                    "dispatch finished"
                ),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn reporter_drains_and_exits_when_senders_drop() {
        let (tx, rx) = mpsc::channel();
        let handle = spawn_reporter(rx);
        let snapshot = StatsSnapshot {
            total: 2,
            succeeded: 1,
            failed: 0,
            average: Some(Duration::from_millis(1500)),
            eta: Some(Duration::from_millis(1500)),
        };
        tx.send(ProgressEvent::Started {
            total: 2,
            skipped: 0,
            workers: 1,
        })
        .unwrap();
        tx.send(ProgressEvent::UnitFinished {
            trial_index: 1,
            ok: true,
            elapsed: Duration::from_millis(1500),
            detail: None,
            snapshot,
        })
        .unwrap();
        drop(tx);
        handle.join().expect("reporter exits cleanly");
        assert_eq!(snapshot.finished(), 1);
        assert_eq!(fmt_secs(snapshot.average), "1.5s");
        assert_eq!(fmt_secs(None), "-");
    }
}
