//! System-wide concurrency cap with priority and fair scheduling.
//!
//! Every worker kind acquires a [`Permit`] from the one
//! [`GlobalConcurrencyManager`] before doing I/O-bound work; nothing else in
//! the pipeline is allowed to bypass it. See `ctp-worker` for the per-kind
//! pool that sits on top of this.

mod engine;
mod types;

pub use engine::{spawn_permit_sweeper, GlobalConcurrencyManager};
pub use types::{
    AcquireOptions, ConcurrencyMetrics, ConcurrencyObserver, Permit, PermitId, TracingObserver,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn cap_is_never_exceeded_under_stress() {
        let mgr = Arc::new(GlobalConcurrencyManager::new(100));

        let mut handles = Vec::new();
        for _ in 0..150 {
            let mgr = Arc::clone(&mgr);
            handles.push(tokio::spawn(async move {
                mgr.acquire(
                    "A",
                    AcquireOptions {
                        timeout: Duration::from_millis(200),
                        priority: None,
                    },
                )
                .await
            }));
        }

        let mut succeeded = 0;
        let mut timed_out = 0;
        let mut permits = Vec::new();
        for h in handles {
            match h.await.unwrap() {
                Ok(p) => {
                    succeeded += 1;
                    permits.push(p);
                }
                Err(ctp_errors::CtpError::Timeout(_)) => timed_out += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(succeeded, 100);
        assert_eq!(timed_out, 50);

        let metrics = mgr.metrics().await;
        assert_eq!(metrics.current_concurrency, 100);

        for p in permits {
            assert!(mgr.release(p.id).await.is_ok());
        }

        let metrics = mgr.metrics().await;
        assert_eq!(metrics.current_concurrency, 0);
        assert_eq!(
            metrics.total_acquired - metrics.total_released - metrics.total_expired,
            metrics.current_concurrency as u64
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn priority_waiter_preempts_lower_priority_waiters() {
        let mgr = Arc::new(GlobalConcurrencyManager::new(1));

        let first = mgr
            .acquire(
                "low",
                AcquireOptions {
                    timeout: Duration::from_secs(1),
                    priority: Some(1),
                },
            )
            .await
            .unwrap();

        let mgr2 = Arc::clone(&mgr);
        let low_waiter = tokio::spawn(async move {
            mgr2.acquire(
                "low",
                AcquireOptions {
                    timeout: Duration::from_secs(5),
                    priority: Some(1),
                },
            )
            .await
        });

        // give the low-priority waiter time to enqueue first
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mgr3 = Arc::clone(&mgr);
        let critical_waiter = tokio::spawn(async move {
            mgr3.acquire(
                "critical",
                AcquireOptions {
                    timeout: Duration::from_secs(5),
                    priority: Some(10),
                },
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(mgr.release(first.id).await.is_ok());

        let critical_permit = critical_waiter.await.unwrap().unwrap();
        assert_eq!(critical_permit.worker_kind, "critical");

        assert!(mgr.release(critical_permit.id).await.is_ok());
        let low_permit = low_waiter.await.unwrap().unwrap();
        assert_eq!(low_permit.worker_kind, "low");
        let _ = mgr.release(low_permit.id).await;
    }

    #[tokio::test]
    async fn double_release_is_rejected() {
        let mgr = GlobalConcurrencyManager::new(1);
        let permit = mgr
            .acquire("A", AcquireOptions::default())
            .await
            .unwrap();
        assert!(mgr.release(permit.id).await.is_ok());
        assert!(matches!(
            mgr.release(permit.id).await,
            Err(ctp_errors::CtpError::AlreadyReleased { permit_id }) if permit_id == permit.id.0
        ));
    }

    #[tokio::test]
    async fn shutdown_rejects_new_acquires_and_drains_waiters() {
        let mgr = Arc::new(GlobalConcurrencyManager::new(1));
        let _held = mgr.acquire("A", AcquireOptions::default()).await.unwrap();

        let mgr2 = Arc::clone(&mgr);
        let waiter = tokio::spawn(async move {
            mgr2.acquire(
                "A",
                AcquireOptions {
                    timeout: Duration::from_secs(5),
                    priority: None,
                },
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        mgr.shutdown().await;

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ctp_errors::CtpError::ShutDown)));

        let result = mgr.acquire("A", AcquireOptions::default()).await;
        assert!(matches!(result, Err(ctp_errors::CtpError::ShutDown)));
    }
}
