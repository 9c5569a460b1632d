use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use parking_lot::Mutex;

use super::{CompletionTimeService, GctPublisher, Tracker, WriterId};
use crate::error::CompletionTimeError;

/// Completion time service that applies submissions on the submitting thread.
///
/// Every submission updates the tracker and republishes GCT under one lock, so a
/// worker spinning on a dependency sees progress as soon as the last blocking writer
/// reports, and the published minimum always matches a consistent set of markers.
#[derive(Debug)]
pub struct DirectCompletionTimeService {
    tracker: Mutex<Tracker>,
    publisher: GctPublisher,
    shut_down: AtomicBool,
}

impl DirectCompletionTimeService {
    pub fn new(writer_count: usize, peer_ids: &[String]) -> Self {
        Self {
            tracker: Mutex::new(Tracker::new(writer_count, peer_ids)),
            publisher: GctPublisher::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    fn update(
        &self,
        apply: impl FnOnce(&mut Tracker) -> Result<(), CompletionTimeError>,
    ) -> Result<(), CompletionTimeError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(CompletionTimeError::ShutDown);
        }
        let mut tracker = self.tracker.lock();
        apply(&mut tracker)?;
        self.publisher.publish(tracker.global());
        Ok(())
    }
}

impl CompletionTimeService for DirectCompletionTimeService {
    fn submit_initiated_time(
        &self,
        writer: WriterId,
        time_ms: i64,
    ) -> Result<(), CompletionTimeError> {
        self.update(|tracker| tracker.initiate(writer, time_ms))
    }

    fn submit_completed_time(
        &self,
        writer: WriterId,
        time_ms: i64,
    ) -> Result<(), CompletionTimeError> {
        self.update(|tracker| tracker.complete(writer, time_ms))
    }

    fn submit_external_completion_time(
        &self,
        peer: &str,
        time_ms: i64,
    ) -> Result<(), CompletionTimeError> {
        self.update(|tracker| tracker.external(peer, time_ms))
    }

    fn global_completion_time(&self) -> Option<i64> {
        self.publisher.current()
    }

    fn global_completion_time_future(
        &self,
        target_ms: i64,
    ) -> BoxFuture<'static, Result<i64, CompletionTimeError>> {
        self.publisher.wait_for(target_ms)
    }

    fn shutdown(&self) -> Result<(), CompletionTimeError> {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            tracing::debug!("direct completion time service shut down");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    fn service(writers: usize) -> DirectCompletionTimeService {
        DirectCompletionTimeService::new(writers, &[])
    }

    #[test]
    fn gct_is_unknown_until_every_writer_reports() {
        let cts = service(2);
        cts.submit_initiated_time(WriterId(0), 0).unwrap();
        cts.submit_completed_time(WriterId(0), 0).unwrap();
        assert_eq!(cts.global_completion_time(), None);

        cts.submit_initiated_time(WriterId(1), 0).unwrap();
        cts.submit_completed_time(WriterId(1), 0).unwrap();
        assert_eq!(cts.global_completion_time(), Some(0));
    }

    #[test]
    fn pending_operation_holds_gct_below_its_timestamp() {
        let cts = service(2);
        for w in 0..2 {
            cts.submit_initiated_time(WriterId(w), 0).unwrap();
            cts.submit_completed_time(WriterId(w), 0).unwrap();
        }
        cts.submit_initiated_time(WriterId(0), 10).unwrap();
        cts.submit_initiated_time(WriterId(1), 20).unwrap();
        assert_eq!(cts.global_completion_time(), Some(9));

        cts.submit_completed_time(WriterId(0), 10).unwrap();
        assert_eq!(cts.global_completion_time(), Some(10));

        cts.submit_initiated_time(WriterId(0), 30).unwrap();
        assert_eq!(cts.global_completion_time(), Some(19));

        cts.submit_completed_time(WriterId(1), 20).unwrap();
        cts.submit_completed_time(WriterId(0), 30).unwrap();
        assert_eq!(cts.global_completion_time(), Some(20));
    }

    #[test]
    fn second_operation_at_a_completed_timestamp_holds_gct() {
        let cts = service(1);
        cts.submit_initiated_time(WriterId(0), 10).unwrap();
        cts.submit_completed_time(WriterId(0), 10).unwrap();
        assert_eq!(cts.global_completion_time(), Some(10));

        cts.submit_initiated_time(WriterId(0), 10).unwrap();
        assert_eq!(cts.global_completion_time(), Some(9));
        cts.submit_completed_time(WriterId(0), 10).unwrap();
        assert_eq!(cts.global_completion_time(), Some(10));
    }

    #[test]
    fn ordering_violations_are_rejected_without_moving_gct() {
        let cts = service(1);
        cts.submit_initiated_time(WriterId(0), 5).unwrap();
        cts.submit_completed_time(WriterId(0), 5).unwrap();

        assert!(matches!(
            cts.submit_initiated_time(WriterId(0), 4),
            Err(CompletionTimeError::InitiatedBeforeCompleted { .. })
        ));
        assert!(matches!(
            cts.submit_completed_time(WriterId(0), 6),
            Err(CompletionTimeError::CompletedWithoutInitiated { .. })
        ));
        assert_eq!(
            cts.submit_initiated_time(WriterId(7), 6),
            Err(CompletionTimeError::UnknownWriter(WriterId(7)))
        );
        assert_eq!(cts.global_completion_time(), Some(5));
    }

    #[test]
    fn external_peers_take_part_in_the_minimum() {
        let cts = DirectCompletionTimeService::new(1, &["peer-a".to_string()]);
        cts.submit_initiated_time(WriterId(0), 10).unwrap();
        cts.submit_completed_time(WriterId(0), 10).unwrap();
        assert_eq!(cts.global_completion_time(), None);

        cts.submit_external_completion_time("peer-a", 7).unwrap();
        assert_eq!(cts.global_completion_time(), Some(7));

        assert_eq!(
            cts.submit_external_completion_time("peer-a", 3),
            Err(CompletionTimeError::ExternalTimeRegressed {
                peer: "peer-a".to_string(),
                previous: 7,
                submitted: 3
            })
        );
        assert!(matches!(
            cts.submit_external_completion_time("peer-b", 3),
            Err(CompletionTimeError::UnknownPeer(_))
        ));
        cts.submit_external_completion_time("peer-a", 50).unwrap();
        assert_eq!(cts.global_completion_time(), Some(10));
    }

    #[test]
    fn submissions_after_shutdown_fail() {
        let cts = service(1);
        cts.shutdown().unwrap();
        cts.shutdown().unwrap();
        assert_eq!(
            cts.submit_initiated_time(WriterId(0), 1),
            Err(CompletionTimeError::ShutDown)
        );
        assert_eq!(
            cts.submit_external_completion_time("anyone", 1),
            Err(CompletionTimeError::ShutDown)
        );
    }

    #[test]
    fn gct_is_monotone_under_concurrent_writers() {
        let cts = Arc::new(service(4));
        let observer = {
            let cts = Arc::clone(&cts);
            thread::spawn(move || {
                let mut last = None;
                for _ in 0..10_000 {
                    let now = cts.global_completion_time();
                    assert!(now >= last, "gct went from {last:?} to {now:?}");
                    last = now;
                }
            })
        };
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let cts = Arc::clone(&cts);
                thread::spawn(move || {
                    for t in (w as i64..2_000).step_by(4) {
                        cts.submit_initiated_time(WriterId(w), t).unwrap();
                        cts.submit_completed_time(WriterId(w), t).unwrap();
                    }
                })
            })
            .collect();
        for h in writers {
            h.join().unwrap();
        }
        observer.join().unwrap();
        assert_eq!(cts.global_completion_time(), Some(1996));
    }

    #[tokio::test]
    async fn future_resolves_after_dependency_completes() {
        let cts = Arc::new(service(1));
        cts.submit_initiated_time(WriterId(0), 0).unwrap();
        cts.submit_completed_time(WriterId(0), 0).unwrap();
        let waiter = cts.global_completion_time_future(100);

        let writer = Arc::clone(&cts);
        tokio::task::spawn_blocking(move || {
            thread::sleep(Duration::from_millis(10));
            writer.submit_initiated_time(WriterId(0), 100).unwrap();
            writer.submit_completed_time(WriterId(0), 100).unwrap();
        });

        let gct = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("gct never reached 100");
        assert_eq!(gct, Ok(100));
    }
}
