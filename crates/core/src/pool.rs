//! Bounded package worker pool shared by the export and import engines.

use std::future::Future;

use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::errors::SyncError;
use crate::models::SyncReport;

/// Run `work` for every package with at most `jobs` packages in flight.
///
/// Failures are recorded and the run continues. With `fail_fast` no new
/// package is started after the first failure; packages already running
/// finish, the rest are reported as skipped. A fatal error stops scheduling
/// the same way and is returned once the running packages are done.
pub(crate) async fn run_packages<F, Fut>(
    packages: Vec<String>,
    jobs: usize,
    fail_fast: bool,
    work: F,
) -> Result<SyncReport, SyncError>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
{
    let jobs = jobs.max(1);
    let mut report = SyncReport::default();
    let mut pending = packages.into_iter();
    let mut tasks = JoinSet::new();
    let mut stopped = false;
    let mut fatal = None;

    loop {
        while !stopped && tasks.len() < jobs {
            let Some(package) = pending.next() else {
                break;
            };
            let fut = work(package.clone());
            tasks.spawn(async move { (package, fut.await) });
        }

        let Some(joined) = tasks.join_next().await else {
            break;
        };
        match joined {
            Ok((package, Ok(()))) => {
                info!(package = %package, "package done");
                report.success(package);
            }
            Ok((package, Err(e))) if e.is_fatal() => {
                error!(package = %package, error = %e, "fatal error, stopping");
                stopped = true;
                fatal.get_or_insert(e);
            }
            Ok((package, Err(e))) => {
                error!(package = %package, error = %e, "package failed");
                report.failure(package, &e);
                if fail_fast {
                    stopped = true;
                }
            }
            Err(e) => {
                error!(error = %e, "package task aborted");
                report.failure("<task>", &e);
                if fail_fast {
                    stopped = true;
                }
            }
        }
    }

    if let Some(e) = fatal {
        return Err(e);
    }
    report.skipped.extend(pending);
    if !report.skipped.is_empty() {
        warn!(count = report.skipped.len(), "packages skipped after failure");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{RemoteError, StorageError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_run() {
        let report = run_packages(names(&["a", "b", "c"]), 2, false, |p| async move {
            if p == "b" {
                Err(RemoteError::NotFound(p).into())
            } else {
                Ok(())
            }
        })
        .await
        .unwrap()
        .finish();
        assert_eq!(report.succeeded, vec!["a", "c"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "b");
        assert!(report.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_fail_fast_skips_remaining() {
        let report = run_packages(names(&["a", "b", "c", "d"]), 1, true, |p| async move {
            if p == "b" {
                Err(SyncError::InvalidTree("broken".into()))
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();
        assert_eq!(report.succeeded, vec!["a"]);
        assert_eq!(report.skipped, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn test_fatal_error_aborts() {
        let started = Arc::new(AtomicUsize::new(0));
        let counter = started.clone();
        let result = run_packages(names(&["a", "b", "c"]), 1, false, move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(StorageError::Misconfigured("no storage".into()).into())
            }
        })
        .await;
        assert!(matches!(result, Err(SyncError::Storage(_))));
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_run() {
        let report = run_packages(Vec::new(), 4, false, |_| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(report, SyncReport::default());
    }
}
