//! Coalesced token refresh.
//!
//! When several requests fail with an expired access token at once, only the
//! first one for a given refresh token calls the refresh endpoint. The rest
//! wait in a per-token queue and are replayed, in arrival order, once the new
//! credentials arrive. A failed refresh fails every queued request with the
//! same error.
//!
//! A token's entry lives until every replay has answered. Requests that fail
//! with the old token while replays are still running reuse the credentials
//! already obtained instead of refreshing again.
//!
//! The refresh and the replays run in detached tasks, so a caller that goes
//! away does not strand the others queued behind it.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::credentials::{CredentialPair, SharedCredentialStore};
use crate::dispatch::{BackendResponse, DEFAULT_TIMEOUT, SharedBackend};
use crate::error::{ProxyError, Result};
use crate::translate::OutboundRequest;

/// A request parked until its refresh settles.
struct Waiter {
    request: OutboundRequest,
    store: SharedCredentialStore,
    reply: oneshot::Sender<Result<BackendResponse>>,
}

/// Per refresh token state. No entry means idle.
enum RefreshState {
    /// The refresh call is in flight.
    Refreshing(Vec<Waiter>),
    /// New credentials are in hand and `outstanding` replays have not
    /// answered yet.
    Draining {
        pair: CredentialPair,
        outstanding: usize,
    },
}

impl RefreshState {
    fn pending(&self) -> usize {
        match self {
            RefreshState::Refreshing(waiters) => waiters.len(),
            RefreshState::Draining { outstanding, .. } => *outstanding,
        }
    }
}

enum Role {
    Leader,
    Queued,
    Late(CredentialPair, Waiter),
}

struct Inner {
    backend: SharedBackend,
    timeout: Duration,
    queues: Mutex<HashMap<String, RefreshState>>,
}

/// Deduplicates refresh calls per refresh token.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(backend: SharedBackend) -> Self {
        Self::with_timeout(backend, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(backend: SharedBackend, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                timeout,
                queues: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Queue `request` behind a refresh of `pair` and wait for its replay.
    ///
    /// Starts the refresh if none is in flight for `pair.refresh`.
    pub async fn register_failure(
        &self,
        pair: CredentialPair,
        request: OutboundRequest,
        store: SharedCredentialStore,
    ) -> Result<BackendResponse> {
        let key = pair.refresh.token().to_string();
        let (reply, outcome) = oneshot::channel();
        let waiter = Waiter {
            request,
            store,
            reply,
        };

        let role = {
            let mut queues = self.inner.queues.lock();
            match queues.entry(key.clone()) {
                Entry::Occupied(mut slot) => match slot.get_mut() {
                    RefreshState::Refreshing(waiters) => {
                        waiters.push(waiter);
                        tracing::debug!(waiters = waiters.len(), "Joined in-flight token refresh");
                        Role::Queued
                    }
                    RefreshState::Draining {
                        pair: fresh,
                        outstanding,
                    } => {
                        *outstanding += 1;
                        Role::Late(fresh.clone(), waiter)
                    }
                },
                Entry::Vacant(slot) => {
                    slot.insert(RefreshState::Refreshing(vec![waiter]));
                    Role::Leader
                }
            }
        };

        let inner = self.inner.clone();
        match role {
            Role::Leader => {
                tracing::info!("Access token expired, refreshing");
                tokio::spawn(async move { inner.refresh_and_drain(key, pair).await });
            }
            Role::Late(fresh, waiter) => {
                tracing::debug!("Token already refreshed, replaying with new credentials");
                tokio::spawn(async move { inner.replay(&key, &fresh, waiter).await });
            }
            Role::Queued => {}
        }

        outcome.await.map_err(|_| {
            ProxyError::Network("token refresh ended without settling this request".to_string())
        })?
    }

    /// Number of requests waiting on `refresh_token`, queued or replaying.
    pub fn queued(&self, refresh_token: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(refresh_token)
            .map_or(0, RefreshState::pending)
    }

    /// Number of refresh tokens with a refresh or replays outstanding.
    pub fn in_flight(&self) -> usize {
        self.inner.queues.lock().len()
    }
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("timeout", &self.inner.timeout)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Inner {
    async fn refresh_and_drain(&self, key: String, pair: CredentialPair) {
        let outcome = match tokio::time::timeout(self.timeout, self.backend.refresh(&pair)).await {
            Ok(Ok(tokens)) => {
                CredentialPair::from_tokens(&tokens.access_token, &tokens.refresh_token)
                    .map_err(|e| ProxyError::InvalidRefreshResponse(e.to_string()))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProxyError::RefreshTimeout(self.timeout)),
        };

        match outcome {
            Ok(new_pair) => {
                let waiters = {
                    let mut queues = self.queues.lock();
                    let waiters = match queues.remove(&key) {
                        Some(RefreshState::Refreshing(waiters)) => waiters,
                        _ => Vec::new(),
                    };
                    if !waiters.is_empty() {
                        queues.insert(
                            key.clone(),
                            RefreshState::Draining {
                                pair: new_pair.clone(),
                                outstanding: waiters.len(),
                            },
                        );
                    }
                    waiters
                };

                tracing::info!(waiters = waiters.len(), "Token refreshed, replaying requests");
                let replays = waiters
                    .into_iter()
                    .map(|waiter| self.replay(&key, &new_pair, waiter));
                join_all(replays).await;
            }
            Err(e) => {
                // Rejections go out under the lock so no caller can slip in
                // between the failure and the entry's removal.
                let mut queues = self.queues.lock();
                let waiters = match queues.remove(&key) {
                    Some(RefreshState::Refreshing(waiters)) => waiters,
                    _ => Vec::new(),
                };
                tracing::warn!(waiters = waiters.len(), error = %e, "Token refresh failed");
                for waiter in waiters {
                    let _ = waiter.reply.send(Err(e.clone()));
                }
            }
        }
    }

    /// Persist `pair` for the waiter, resend its request and answer it.
    async fn replay(&self, key: &str, pair: &CredentialPair, waiter: Waiter) {
        waiter.store.replace(pair.clone());
        let result = match waiter.request.with_bearer(pair.access.token()) {
            Ok(replay) => self.backend.send(&replay).await,
            Err(e) => Err(e),
        };
        let _ = waiter.reply.send(result);
        self.finish_replay(key);
    }

    fn finish_replay(&self, key: &str) {
        let mut queues = self.queues.lock();
        let drained = match queues.get_mut(key) {
            Some(RefreshState::Draining { outstanding, .. }) => {
                *outstanding = outstanding.saturating_sub(1);
                *outstanding == 0
            }
            _ => false,
        };
        if drained {
            queues.remove(key);
            tracing::debug!("Token refresh drained");
        }
    }
}
