//! Per-key deduplication of token fetches
//!
//! At most one fetch per key is in flight at a time. Callers that find a fetch
//! already running wait for it to finish instead of issuing their own request,
//! then either read the freshly cached token or receive the same error the
//! fetch produced.
//!
//! The lock guarding the cache is never held across an `.await`. Fetches run
//! outside the lock, so fetches for different keys proceed concurrently.

use std::{collections::HashMap, future::Future};

use parking_lot::RwLock;
use quickbase_clock::{Clock, System, UnixTime};
use tokio::sync::watch;

use crate::{AccessToken, AuthError, Credential};

type Outcome = Option<Result<(), AuthError>>;

/// The state guarded by a [`SingleFlight`]'s lock
#[derive(Debug)]
pub(crate) struct FlightState<S> {
    entries: HashMap<String, Credential>,
    in_flight: HashMap<String, watch::Receiver<Outcome>>,
    /// Strategy-specific state that must change atomically with the cache
    pub(crate) extra: S,
}

impl<S> FlightState<S> {
    fn valid_token(&self, key: &str, now: UnixTime) -> Option<AccessToken> {
        self.entries
            .get(key)
            .filter(|credential| credential.is_valid_at(now))
            .map(|credential| credential.access_token().to_owned())
    }

    pub(crate) fn entry(&self, key: &str) -> Option<&Credential> {
        self.entries.get(key)
    }

    pub(crate) fn insert(&mut self, key: impl Into<String>, credential: Credential) {
        self.entries.insert(key.into(), credential);
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<Credential> {
        self.entries.remove(key)
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }
}

/// A token cache that deduplicates concurrent fetches for the same key
#[derive(Debug)]
pub(crate) struct SingleFlight<S = (), C = System> {
    state: RwLock<FlightState<S>>,
    clock: C,
}

enum Election<'a, S, C, T> {
    Cached(AccessToken),
    Leader(FlightGuard<'a, S, C>, T),
}

impl<S, C> SingleFlight<S, C> {
    pub(crate) fn new(extra: S, clock: C) -> Self {
        Self {
            state: RwLock::new(FlightState {
                entries: HashMap::new(),
                in_flight: HashMap::new(),
                extra,
            }),
            clock,
        }
    }

    pub(crate) fn clock(&self) -> &C {
        &self.clock
    }

    /// Runs `f` with shared access to the guarded state
    pub(crate) fn read<R>(&self, f: impl FnOnce(&FlightState<S>) -> R) -> R {
        f(&self.state.read())
    }

    /// Runs `f` with exclusive access to the guarded state
    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut FlightState<S>) -> R) -> R {
        f(&mut self.state.write())
    }

    /// Drops the cached entry for `key`, returning whether one was present
    pub(crate) fn invalidate(&self, key: &str) -> bool {
        self.write(|state| state.remove(key).is_some())
    }

    /// Stores a credential for `key` without fetching
    pub(crate) fn insert(&self, key: impl Into<String>, credential: Credential) {
        self.write(|state| state.insert(key, credential));
    }

    /// Drops every cached entry; fetches in flight are unaffected
    pub(crate) fn clear(&self) {
        self.write(FlightState::clear);
    }
}

impl<S, C: Clock> SingleFlight<S, C> {
    /// Gets the cached token for `key` if it is still valid
    pub(crate) fn cached(&self, key: &str) -> Option<AccessToken> {
        let now = self.clock.now();
        self.state.read().valid_token(key, now)
    }

    /// Gets a valid token for `key`, fetching one if required
    ///
    /// `prepare` runs under the exclusive lock only for the caller that will
    /// perform the fetch, and its output is handed to `fetch`. If `prepare`
    /// fails, no fetch is started and the error is returned directly.
    pub(crate) async fn get_or_fetch<T, P, F, Fut>(
        &self,
        key: &str,
        prepare: P,
        fetch: F,
    ) -> Result<AccessToken, AuthError>
    where
        P: FnMut(&mut S) -> Result<T, AuthError>,
        F: FnOnce(T) -> Fut,
        Fut: Future<Output = Result<Credential, AuthError>>,
    {
        self.get_or_fetch_committed(key, prepare, fetch, |_| Ok(()))
            .await
    }

    /// Like [`get_or_fetch()`][Self::get_or_fetch()], but a successful fetch
    /// is only cached if `commit` accepts it
    ///
    /// `commit` runs under the exclusive lock that completes the flight. If it
    /// fails, nothing is cached and its error becomes the outcome shared with
    /// every waiter.
    pub(crate) async fn get_or_fetch_committed<T, P, F, Fut, K>(
        &self,
        key: &str,
        prepare: P,
        fetch: F,
        commit: K,
    ) -> Result<AccessToken, AuthError>
    where
        P: FnMut(&mut S) -> Result<T, AuthError>,
        F: FnOnce(T) -> Fut,
        Fut: Future<Output = Result<Credential, AuthError>>,
        K: FnOnce(&mut S) -> Result<(), AuthError>,
    {
        match self.elect(key, prepare).await? {
            Election::Cached(token) => Ok(token),
            Election::Leader(guard, prepared) => {
                let result = fetch(prepared).await;
                guard.complete(result, commit)
            }
        }
    }

    async fn elect<T, P>(&self, key: &str, mut prepare: P) -> Result<Election<'_, S, C, T>, AuthError>
    where
        P: FnMut(&mut S) -> Result<T, AuthError>,
    {
        loop {
            if let Some(token) = self.cached(key) {
                tracing::trace!(resource_key = key, "using cached token");
                return Ok(Election::Cached(token));
            }

            let mut waiter = {
                let mut guard = self.state.write();
                let state = &mut *guard;

                // Another caller may have finished a fetch between the read and
                // write locks.
                if let Some(token) = state.valid_token(key, self.clock.now()) {
                    tracing::trace!(resource_key = key, "token cached while acquiring lock");
                    return Ok(Election::Cached(token));
                }

                if let Some(waiter) = state.in_flight.get(key).cloned() {
                    waiter
                } else {
                    let prepared = prepare(&mut state.extra)?;
                    let (tx, rx) = watch::channel(None);
                    state.in_flight.insert(key.to_owned(), rx);

                    tracing::debug!(resource_key = key, "no valid token cached, fetching");

                    return Ok(Election::Leader(
                        FlightGuard {
                            flights: self,
                            key: key.to_owned(),
                            tx: Some(tx),
                        },
                        prepared,
                    ));
                }
            };

            tracing::trace!(resource_key = key, "token fetch already in flight, waiting");

            // A closed channel without an outcome means the fetching caller was
            // cancelled; start over and possibly take its place.
            let outcome = waiter
                .wait_for(Option::is_some)
                .await
                .map(|outcome| outcome.clone())
                .ok()
                .flatten();

            if let Some(Err(error)) = outcome {
                return Err(error);
            }
        }
    }
}

/// Marks an in-flight fetch; removes the marker even if the fetch is abandoned
struct FlightGuard<'a, S, C> {
    flights: &'a SingleFlight<S, C>,
    key: String,
    tx: Option<watch::Sender<Outcome>>,
}

impl<S, C> FlightGuard<'_, S, C> {
    fn complete(
        mut self,
        result: Result<Credential, AuthError>,
        commit: impl FnOnce(&mut S) -> Result<(), AuthError>,
    ) -> Result<AccessToken, AuthError> {
        let mut state = self.flights.state.write();

        let result = result.and_then(|credential| {
            commit(&mut state.extra)?;
            let token = credential.access_token().to_owned();
            state.insert(self.key.clone(), credential);
            Ok(token)
        });

        state.in_flight.remove(&self.key);

        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(result.as_ref().map(|_| ()).map_err(Clone::clone)));
        }

        drop(state);
        result
    }
}

impl<S, C> Drop for FlightGuard<'_, S, C> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.flights.state.write().in_flight.remove(&self.key);
            tracing::debug!(resource_key = %self.key, "token fetch abandoned before completing");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use quickbase_clock::TestClock;
    use reqwest::StatusCode;

    use super::*;

    type Flights = SingleFlight<(), TestClock>;

    fn flights() -> (Arc<Flights>, TestClock) {
        let clock = TestClock::new(UnixTime(1_000_000));
        (Arc::new(SingleFlight::new((), clock.clone())), clock)
    }

    async fn slow_fetch(
        calls: Arc<AtomicUsize>,
        token: &'static str,
    ) -> Result<Credential, AuthError> {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<_, AuthError>(Credential::new(AccessToken::from_static(token)))
    }

    mod when_many_callers_share_a_key {
        use super::*;

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn only_one_fetch_is_issued() {
            let (flights, _) = flights();
            let calls = Arc::new(AtomicUsize::new(0));

            let tasks: Vec<_> = (0..16)
                .map(|_| {
                    let flights = flights.clone();
                    let calls = calls.clone();
                    tokio::spawn(async move {
                        flights
                            .get_or_fetch("table1", |_| Ok(()), |()| slow_fetch(calls, "shared"))
                            .await
                    })
                })
                .collect();

            for task in tasks {
                let token = task.await.unwrap().unwrap();
                assert_eq!(token.as_str(), "shared");
            }

            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert!(!flights.read(|s| s.is_in_flight("table1")));
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn a_failed_fetch_is_reported_to_every_waiter() {
            let (flights, _) = flights();
            let calls = Arc::new(AtomicUsize::new(0));
            let (open, gate) = tokio::sync::oneshot::channel::<()>();

            let leader = {
                let flights = flights.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    flights
                        .get_or_fetch(
                            "table1",
                            |_| Ok(()),
                            |()| async move {
                                calls.fetch_add(1, Ordering::SeqCst);
                                let _ = gate.await;
                                Err::<Credential, _>(AuthError::Rejected {
                                    status: StatusCode::FORBIDDEN,
                                    message: "denied".into(),
                                })
                            },
                        )
                        .await
                })
            };

            while !flights.read(|s| s.is_in_flight("table1")) {
                tokio::task::yield_now().await;
            }

            let followers: Vec<_> = (0..4)
                .map(|_| {
                    let flights = flights.clone();
                    let calls = calls.clone();
                    tokio::spawn(async move {
                        flights
                            .get_or_fetch("table1", |_| Ok(()), |()| slow_fetch(calls, "late"))
                            .await
                    })
                })
                .collect();

            tokio::time::sleep(Duration::from_millis(100)).await;
            open.send(()).unwrap();

            assert!(matches!(
                leader.await.unwrap(),
                Err(AuthError::Rejected { .. })
            ));
            for follower in followers {
                assert!(matches!(
                    follower.await.unwrap(),
                    Err(AuthError::Rejected { .. })
                ));
            }
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert!(flights.read(|s| s.entry("table1").is_none()));
        }
    }

    mod when_callers_use_different_keys {
        use super::*;

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn fetches_proceed_concurrently() {
            let (flights, _) = flights();
            let (open, gate) = tokio::sync::oneshot::channel::<()>();

            let blocked = {
                let flights = flights.clone();
                tokio::spawn(async move {
                    flights
                        .get_or_fetch(
                            "slow",
                            |_| Ok(()),
                            |()| async move {
                                let _ = gate.await;
                                Ok::<_, AuthError>(Credential::new(AccessToken::from_static("slow-token")))
                            },
                        )
                        .await
                })
            };

            while !flights.read(|s| s.is_in_flight("slow")) {
                tokio::task::yield_now().await;
            }

            let fast = tokio::time::timeout(
                Duration::from_secs(1),
                flights.get_or_fetch(
                    "fast",
                    |_| Ok(()),
                    |()| async { Ok::<_, AuthError>(Credential::new(AccessToken::from_static("fast-token"))) },
                ),
            )
            .await
            .expect("fetch for an unrelated key must not wait")
            .unwrap();

            assert_eq!(fast.as_str(), "fast-token");

            open.send(()).unwrap();
            assert_eq!(blocked.await.unwrap().unwrap().as_str(), "slow-token");
        }
    }

    mod when_the_cached_token_expires {
        use super::*;

        #[tokio::test]
        async fn the_next_call_fetches_again() {
            let (flights, clock) = flights();
            let calls = Arc::new(AtomicUsize::new(0));

            let fetch = |calls: Arc<AtomicUsize>, clock: TestClock| async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                let token = AccessToken::new(format!("token-{}", n));
                Ok::<_, AuthError>(Credential::with_lifespan(token, Duration::from_millis(500), &clock))
            };

            let first = flights
                .get_or_fetch("t", |_| Ok(()), |()| fetch(calls.clone(), clock.clone()))
                .await
                .unwrap();

            clock.advance(Duration::from_millis(499));
            let cached = flights
                .get_or_fetch("t", |_| Ok(()), |()| fetch(calls.clone(), clock.clone()))
                .await
                .unwrap();
            assert_eq!(first, cached);
            assert_eq!(calls.load(Ordering::SeqCst), 1);

            clock.advance(Duration::from_millis(2));
            let refreshed = flights
                .get_or_fetch("t", |_| Ok(()), |()| fetch(calls.clone(), clock.clone()))
                .await
                .unwrap();
            assert_eq!(refreshed.as_str(), "token-1");
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        }
    }

    mod when_prepare_fails {
        use super::*;

        #[tokio::test]
        async fn no_fetch_is_started_and_no_marker_remains() {
            let (flights, _) = flights();
            let calls = Arc::new(AtomicUsize::new(0));

            let result = flights
                .get_or_fetch(
                    "t",
                    |_| Err::<(), _>(AuthError::SessionExpired),
                    |()| slow_fetch(calls.clone(), "never"),
                )
                .await;

            assert!(matches!(result, Err(AuthError::SessionExpired)));
            assert_eq!(calls.load(Ordering::SeqCst), 0);
            assert!(!flights.read(|s| s.is_in_flight("t")));
        }
    }

    mod when_the_fetching_caller_is_cancelled {
        use super::*;

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn a_waiter_takes_over() {
            let (flights, _) = flights();

            let abandoned = {
                let flights = flights.clone();
                tokio::spawn(async move {
                    flights
                        .get_or_fetch(
                            "t",
                            |_| Ok(()),
                            |()| async {
                                std::future::pending::<()>().await;
                                Ok::<_, AuthError>(Credential::new(AccessToken::from_static("never")))
                            },
                        )
                        .await
                })
            };

            while !flights.read(|s| s.is_in_flight("t")) {
                tokio::task::yield_now().await;
            }

            let waiter = {
                let flights = flights.clone();
                tokio::spawn(async move {
                    flights
                        .get_or_fetch(
                            "t",
                            |_| Ok(()),
                            |()| async { Ok::<_, AuthError>(Credential::new(AccessToken::from_static("second"))) },
                        )
                        .await
                })
            };

            tokio::time::sleep(Duration::from_millis(20)).await;
            abandoned.abort();

            let token = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter must not be stranded")
                .unwrap()
                .unwrap();
            assert_eq!(token.as_str(), "second");
        }
    }

    mod when_the_commit_is_refused {
        use super::*;

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn nothing_is_cached_and_waiters_share_the_refusal() {
            let clock = TestClock::new(UnixTime(1_000_000));
            let flights = Arc::new(SingleFlight::new(true, clock));
            let (open, gate) = tokio::sync::oneshot::channel::<()>();

            let leader = {
                let flights = flights.clone();
                tokio::spawn(async move {
                    flights
                        .get_or_fetch_committed(
                            "t",
                            |_| Ok(()),
                            |()| async move {
                                let _ = gate.await;
                                Ok::<_, AuthError>(Credential::new(AccessToken::from_static("late")))
                            },
                            |accepting: &mut bool| {
                                if *accepting {
                                    Ok(())
                                } else {
                                    Err(AuthError::SessionExpired)
                                }
                            },
                        )
                        .await
                })
            };

            while !flights.read(|s| s.is_in_flight("t")) {
                tokio::task::yield_now().await;
            }

            let waiter = {
                let flights = flights.clone();
                tokio::spawn(async move {
                    flights
                        .get_or_fetch("t", |_| Ok(()), |()| async {
                            Ok::<_, AuthError>(Credential::new(AccessToken::from_static("never")))
                        })
                        .await
                })
            };

            tokio::time::sleep(Duration::from_millis(20)).await;
            flights.write(|s| s.extra = false);
            open.send(()).unwrap();

            assert!(matches!(leader.await.unwrap(), Err(AuthError::SessionExpired)));
            assert!(matches!(waiter.await.unwrap(), Err(AuthError::SessionExpired)));
            assert!(flights.cached("t").is_none());
            assert!(!flights.read(|s| s.is_in_flight("t")));
        }
    }

    #[tokio::test]
    async fn invalidating_forces_a_fetch() {
        let (flights, _) = flights();
        flights.insert("t", Credential::new(AccessToken::from_static("old")));
        assert_eq!(flights.cached("t").unwrap().as_str(), "old");

        assert!(flights.invalidate("t"));
        assert!(!flights.invalidate("t"));

        let token = flights
            .get_or_fetch(
                "t",
                |_| Ok(()),
                |()| async { Ok::<_, AuthError>(Credential::new(AccessToken::from_static("new"))) },
            )
            .await
            .unwrap();
        assert_eq!(token.as_str(), "new");
    }
}
