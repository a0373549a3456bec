//! The `FirstSuccess` coordinator (spec §4.8, §9 "Coalescing"): the first
//! concurrent caller for a key runs an expensive `attempt`; everyone else
//! who shows up while it is running waits for that attempt instead of
//! starting their own. Once any attempt succeeds, the coordinator latches
//! "succeeded" forever and every future caller — waiters and newcomers
//! alike — takes the cheap `fallback` path instead. On failure the next
//! caller (owner or waiter) gets to retry.
//!
//! Built on a `tokio::sync::Mutex`-guarded state machine plus a
//! single-value `watch` channel per attempt, rather than a condition
//! variable — the async idiom the rest of this crate uses for
//! coordinating tasks.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

enum State {
    Idle,
    Running(watch::Receiver<Option<bool>>),
    Succeeded,
}

/// One coordinator per key (e.g. per OutputID). Cheap to clone; clones
/// share the same latch, which is the point: the combined cache keeps one
/// of these per OutputID in a shared map.
#[derive(Clone)]
pub struct FirstSuccess {
    state: Arc<Mutex<State>>,
}

impl Default for FirstSuccess {
    fn default() -> Self {
        FirstSuccess {
            state: Arc::new(Mutex::new(State::Idle)),
        }
    }
}

/// Resets the coordinator to `Idle` and wakes any waiters with a failure
/// signal if the owner's task is dropped (cancelled or panicked) before
/// reporting its own outcome, so a crashed attempt never wedges the
/// coordinator forever.
struct OwnerGuard {
    state: Arc<Mutex<State>>,
    tx: Option<watch::Sender<Option<bool>>>,
}

impl OwnerGuard {
    async fn finish(mut self, succeeded: bool) {
        let tx = self.tx.take().expect("finish called once");
        {
            let mut guard = self.state.lock().await;
            *guard = if succeeded {
                State::Succeeded
            } else {
                State::Idle
            };
        }
        let _ = tx.send(Some(succeeded));
    }
}

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            // Best-effort synchronous reset: try_lock avoids blocking the
            // drop glue; if contended, the next caller observes a stale
            // `Running` whose sender is already gone and falls through to
            // the `changed()` error path below, which also retries.
            if let Ok(mut guard) = self.state.try_lock() {
                *guard = State::Idle;
            }
            let _ = tx.send(Some(false));
        }
    }
}

impl FirstSuccess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `attempt` if this caller is first in line (or first to retry
    /// after a failed attempt); otherwise waits on the in-flight attempt.
    /// Once any attempt has ever succeeded, every caller takes the cheap
    /// `fallback` path instead.
    pub async fn run<T, E, Att, AttFut, Fbk, FbkFut>(
        &self,
        mut attempt: Att,
        mut fallback: Fbk,
    ) -> Result<T, E>
    where
        Att: FnMut() -> AttFut,
        AttFut: Future<Output = Result<T, E>>,
        Fbk: FnMut() -> FbkFut,
        FbkFut: Future<Output = Result<T, E>>,
    {
        loop {
            enum Role {
                Own(OwnerGuard),
                Wait(watch::Receiver<Option<bool>>),
                Done,
            }

            let role = {
                let mut guard = self.state.lock().await;
                match &*guard {
                    State::Succeeded => Role::Done,
                    State::Running(rx) => Role::Wait(rx.clone()),
                    State::Idle => {
                        let (tx, rx) = watch::channel(None);
                        *guard = State::Running(rx);
                        Role::Own(OwnerGuard {
                            state: self.state.clone(),
                            tx: Some(tx),
                        })
                    }
                }
            };

            match role {
                Role::Done => return fallback().await,
                Role::Own(guard) => {
                    let result = attempt().await;
                    let succeeded = result.is_ok();
                    guard.finish(succeeded).await;
                    if succeeded {
                        return result;
                    }
                    continue;
                }
                Role::Wait(mut rx) => {
                    if rx.changed().await.is_err() {
                        // Owner vanished without a clean finish; retry.
                        continue;
                    }
                    match *rx.borrow() {
                        Some(true) => return fallback().await,
                        _ => continue,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn only_one_attempt_runs_concurrently() {
        let coord = FirstSuccess::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let fallbacks = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let coord = coord.clone();
            let attempts = attempts.clone();
            let fallbacks = fallbacks.clone();
            handles.push(tokio::spawn(async move {
                let attempts = attempts.clone();
                let fallbacks = fallbacks.clone();
                coord
                    .run::<(), (), _, _, _, _>(
                        || {
                            let attempts = attempts.clone();
                            async move {
                                attempts.fetch_add(1, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(20)).await;
                                Ok(())
                            }
                        },
                        || {
                            let fallbacks = fallbacks.clone();
                            async move {
                                fallbacks.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            }
                        },
                    )
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(fallbacks.load(Ordering::SeqCst), 9);
    }

    #[tokio::test]
    async fn failed_attempt_lets_next_caller_retry() {
        let coord = FirstSuccess::new();
        let tries = Arc::new(AtomicUsize::new(0));

        for i in 0..3 {
            let tries = tries.clone();
            let result: Result<(), &'static str> = coord
                .run(
                    || {
                        let tries = tries.clone();
                        async move {
                            let n = tries.fetch_add(1, Ordering::SeqCst);
                            if n < 2 {
                                Err("not yet")
                            } else {
                                Ok(())
                            }
                        }
                    },
                    || async { Ok(()) },
                )
                .await;
            if i == 2 {
                assert!(result.is_ok());
            }
        }
        assert_eq!(tries.load(Ordering::SeqCst), 3);
    }
}
