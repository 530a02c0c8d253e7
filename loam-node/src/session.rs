use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use loam_core::{GatewayId, SessionToken};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// State kept for one gateway session.
#[derive(Debug, Clone)]
pub struct Session {
    pub gateway_id: GatewayId,
    pub opened_at: jiff::Timestamp,
    pub last_seen: Instant,
    pub uploads: u64,
    /// Times the session was picked up again by a new connection.
    pub resumes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opened {
    pub token: SessionToken,
    pub resumed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub gateway_id: String,
    pub opened_at: jiff::Timestamp,
    pub uploads: u64,
    pub resumes: u32,
}

/// Live backhaul sessions, keyed by token.
///
/// A token survives the connection that created it. A gateway that reconnects
/// over a different path presents the token in its Hello and continues the
/// same session.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionToken, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume `resume` if it names a live session of the same gateway,
    /// otherwise open a fresh one.
    pub fn open(&self, gateway_id: GatewayId, resume: Option<SessionToken>) -> Opened {
        if let Some(token) = resume
            && let Some(mut session) = self.sessions.get_mut(&token)
            && session.gateway_id == gateway_id
        {
            session.last_seen = Instant::now();
            session.resumes += 1;
            tracing::info!(gateway_id = %gateway_id.0, resumes = session.resumes, "session resumed");
            return Opened {
                token,
                resumed: true,
            };
        }

        if let Some(token) = resume {
            tracing::debug!(
                gateway_id = %gateway_id.0,
                ?token,
                "unknown session, opening a new one"
            );
        }

        let token = loop {
            let candidate = SessionToken(rand::random());
            if !self.sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        self.sessions.insert(
            token,
            Session {
                gateway_id,
                opened_at: jiff::Timestamp::now(),
                last_seen: Instant::now(),
                uploads: 0,
                resumes: 0,
            },
        );
        tracing::info!(gateway_id = %gateway_id.0, "session opened");

        Opened {
            token,
            resumed: false,
        }
    }

    /// Record an upload on `token`. False when the session is gone.
    pub fn touch(&self, token: SessionToken) -> bool {
        match self.sessions.get_mut(&token) {
            Some(mut session) => {
                session.last_seen = Instant::now();
                session.uploads += 1;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, token: SessionToken) -> Option<Session> {
        self.sessions.get(&token).map(|s| s.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop sessions idle for longer than `max_idle`, returning how many went.
    pub fn expire_idle(&self, max_idle: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.last_seen.elapsed() <= max_idle);
        before - self.sessions.len()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.sessions
            .iter()
            .map(|entry| SessionSummary {
                gateway_id: entry.gateway_id.0.to_string(),
                opened_at: entry.opened_at,
                uploads: entry.uploads,
                resumes: entry.resumes,
            })
            .collect()
    }
}

/// Periodically drop sessions that stayed idle past `idle_timeout`.
#[tracing::instrument(skip_all)]
pub async fn run_session_sweeper(
    sessions: Arc<SessionRegistry>,
    idle_timeout: Duration,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let expired = sessions.expire_idle(idle_timeout);
                if expired > 0 {
                    tracing::info!(expired, live = sessions.len(), "expired idle sessions");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;

    fn gateway(n: u128) -> GatewayId {
        GatewayId(Ulid(n))
    }

    #[test]
    fn resume_keeps_the_token() {
        let sessions = SessionRegistry::new();
        let first = sessions.open(gateway(1), None);
        assert!(!first.resumed);

        let again = sessions.open(gateway(1), Some(first.token));
        assert_eq!(
            again,
            Opened {
                token: first.token,
                resumed: true
            }
        );
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions.get(first.token).unwrap().resumes, 1);
    }

    #[test]
    fn foreign_or_unknown_token_opens_a_new_session() {
        let sessions = SessionRegistry::new();
        let first = sessions.open(gateway(1), None);

        let other = sessions.open(gateway(2), Some(first.token));
        assert!(!other.resumed);
        assert_ne!(other.token, first.token);

        let stale = sessions.open(gateway(1), Some(SessionToken(42)));
        assert!(!stale.resumed);
        assert_eq!(sessions.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_expire() {
        let sessions = SessionRegistry::new();
        let idle = sessions.open(gateway(1), None);
        let busy = sessions.open(gateway(2), None);

        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(sessions.touch(busy.token));
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(sessions.expire_idle(Duration::from_secs(60)), 1);
        assert!(!sessions.touch(idle.token));
        assert_eq!(sessions.get(busy.token).unwrap().uploads, 1);
    }
}
