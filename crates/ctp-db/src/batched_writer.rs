//! Buffers rows in memory and flushes them in one round trip, triggered by
//! whichever of size, time, or an explicit call comes first. Used in front
//! of the POI and evidence tables, which otherwise see one INSERT per
//! finding under heavy fan-out.

use std::sync::Arc;
use std::time::Duration;

use ctp_errors::Result;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// `F` performs the actual multi-row insert; it receives the full buffered
/// batch and is expected to either insert all of it or return an error (no
/// partial-batch semantics — the caller decides whether to retry the whole
/// batch).
pub struct BatchedWriter<T, F> {
    buffer: Mutex<Vec<T>>,
    max_size: usize,
    max_age: Duration,
    last_flush: Mutex<Instant>,
    flush_fn: F,
}

impl<T, F, Fut> BatchedWriter<T, F>
where
    T: Send + 'static,
    F: Fn(Vec<T>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    pub fn new(max_size: usize, max_age: Duration, flush_fn: F) -> Self {
        Self {
            buffer: Mutex::new(Vec::with_capacity(max_size)),
            max_size,
            max_age,
            last_flush: Mutex::new(Instant::now()),
            flush_fn,
        }
    }

    /// Pushes one item. Flushes synchronously (before returning) if the
    /// batch just hit `max_size`.
    pub async fn push(self: &Arc<Self>, item: T) -> Result<()> {
        let should_flush = {
            let mut buf = self.buffer.lock().await;
            buf.push(item);
            buf.len() >= self.max_size
        };
        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Flushes if `max_age` has elapsed since the last flush, regardless of
    /// buffer size. Intended to be called from a periodic tick alongside
    /// `push`, not as the only flush trigger.
    pub async fn flush_if_stale(self: &Arc<Self>) -> Result<()> {
        let stale = {
            let last = self.last_flush.lock().await;
            last.elapsed() >= self.max_age
        };
        if stale {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn flush(self: &Arc<Self>) -> Result<()> {
        let batch = {
            let mut buf = self.buffer.lock().await;
            if buf.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *buf)
        };

        let result = (self.flush_fn)(batch).await;
        *self.last_flush.lock().await = Instant::now();
        result
    }

    pub async fn pending_len(&self) -> usize {
        self.buffer.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn flushes_automatically_at_max_size() {
        let flushed = Arc::new(AtomicUsize::new(0));
        let flushed_clone = Arc::clone(&flushed);

        let writer = Arc::new(BatchedWriter::new(
            3,
            Duration::from_secs(3600),
            move |batch: Vec<i32>| {
                let flushed = Arc::clone(&flushed_clone);
                async move {
                    flushed.fetch_add(batch.len(), Ordering::SeqCst);
                    Ok(())
                }
            },
        ));

        writer.push(1).await.unwrap();
        writer.push(2).await.unwrap();
        assert_eq!(flushed.load(Ordering::SeqCst), 0);
        writer.push(3).await.unwrap();
        assert_eq!(flushed.load(Ordering::SeqCst), 3);
        assert_eq!(writer.pending_len().await, 0);
    }

    #[tokio::test]
    async fn explicit_flush_empties_a_partial_batch() {
        let flushed = Arc::new(AtomicUsize::new(0));
        let flushed_clone = Arc::clone(&flushed);

        let writer = Arc::new(BatchedWriter::new(
            100,
            Duration::from_secs(3600),
            move |batch: Vec<i32>| {
                let flushed = Arc::clone(&flushed_clone);
                async move {
                    flushed.fetch_add(batch.len(), Ordering::SeqCst);
                    Ok(())
                }
            },
        ));

        writer.push(1).await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(flushed.load(Ordering::SeqCst), 1);
    }
}
