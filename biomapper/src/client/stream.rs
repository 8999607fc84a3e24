//! Polling progress stream.

use super::{ClientError, ClientResult, JobApi};
use crate::jobs::{JobStatus, ProgressEvent};
use futures::stream::{self, FusedStream, StreamExt};
use std::time::Duration;

struct StreamState<'a, A: ?Sized> {
    api: &'a A,
    job_id: &'a str,
    interval: Duration,
    last: Option<(JobStatus, u64, Option<String>)>,
    polled: bool,
    done: bool,
}

/// Polls a job and yields an event each time its status, progress or
/// current step changes.
///
/// The stream ends after the event for the terminal state, or after the
/// first failed status call. It cannot be restarted.
pub fn stream_progress<'a, A>(
    api: &'a A,
    job_id: &'a str,
    poll_interval: Duration,
) -> impl FusedStream<Item = ClientResult<ProgressEvent>> + 'a
where
    A: JobApi + ?Sized,
{
    let state = StreamState {
        api,
        job_id,
        interval: poll_interval,
        last: None,
        polled: false,
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        loop {
            if state.polled {
                tokio::time::sleep(state.interval).await;
            }
            state.polled = true;

            let report = match state.api.status(state.job_id).await {
                Ok(report) => report,
                Err(err) => {
                    state.done = true;
                    return Some((Err(ClientError::Api(err)), state));
                }
            };

            if report.is_terminal() {
                state.done = true;
                return Some((Ok(ProgressEvent::from(&report)), state));
            }

            let key = (report.status, report.progress.to_bits(), report.current_step.clone());
            if state.last.as_ref() != Some(&key) {
                state.last = Some(key);
                return Some((Ok(ProgressEvent::from(&report)), state));
            }
        }
    })
    .fuse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::JsonMap;
    use crate::errors::{BiomapperError, Result};
    use crate::jobs::{JobHandle, JobStatusReport, StrategySource};
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays a fixed sequence of statuses, repeating the last one.
    struct ReplayApi {
        reports: Mutex<VecDeque<JobStatusReport>>,
        calls: Mutex<usize>,
    }

    impl ReplayApi {
        fn new(steps: &[(JobStatus, f64)]) -> Self {
            let reports = steps
                .iter()
                .map(|(status, progress)| JobStatusReport {
                    job_id: "job".into(),
                    status: *status,
                    progress: *progress,
                    message: None,
                    current_step: None,
                    error_kind: None,
                    updated_at: Utc::now(),
                })
                .collect();
            Self {
                reports: Mutex::new(reports),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl JobApi for ReplayApi {
        async fn submit(&self, _strategy: StrategySource, _parameters: JsonMap) -> Result<JobHandle> {
            Err(BiomapperError::Internal("not supported".into()))
        }

        async fn status(&self, _job_id: &str) -> Result<JobStatusReport> {
            *self.calls.lock() += 1;
            let mut reports = self.reports.lock();
            let report = if reports.len() > 1 { reports.pop_front() } else { reports.front().cloned() };
            report.ok_or_else(|| BiomapperError::NotFound("job".into()))
        }

        async fn result(&self, _job_id: &str) -> Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }

        async fn cancel(&self, _job_id: &str) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_yields_only_changes_and_ends() {
        let api = ReplayApi::new(&[
            (JobStatus::Pending, 0.0),
            (JobStatus::Pending, 0.0),
            (JobStatus::Running, 0.0),
            (JobStatus::Running, 50.0),
            (JobStatus::Running, 50.0),
            (JobStatus::Completed, 100.0),
        ]);

        let events: Vec<_> = stream_progress(&api, "job", Duration::from_millis(10))
            .map(|e| e.unwrap())
            .collect()
            .await;

        let seen: Vec<_> = events.iter().map(|e| (e.status, e.progress)).collect();
        assert_eq!(
            seen,
            vec![
                (JobStatus::Pending, 0.0),
                (JobStatus::Running, 0.0),
                (JobStatus::Running, 50.0),
                (JobStatus::Completed, 100.0),
            ]
        );
        assert_eq!(*api.calls.lock(), 6);
    }

    #[tokio::test]
    async fn test_stream_is_not_restartable() {
        let api = ReplayApi::new(&[(JobStatus::Failed, 10.0)]);
        let mut stream = Box::pin(stream_progress(&api, "job", Duration::from_millis(1)));

        assert!(stream.next().await.unwrap().unwrap().is_final());
        assert!(stream.next().await.is_none());
        assert!(stream.is_terminated());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_ends_on_api_error() {
        let api = ReplayApi::new(&[]);
        let events: Vec<_> = stream_progress(&api, "job", Duration::from_millis(1)).collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(ClientError::Api(_))));
    }
}
