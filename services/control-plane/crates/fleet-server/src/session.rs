//! Per-agent session tokens.
//!
//! A token is valid only while it is the one stored on the agent record,
//! i.e. until the next successful registration for that agent id.

use fleet_common::Agent;
use uuid::Uuid;

const TOKEN_PREFIX: &str = "session_";

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionAuthenticator;

impl SessionAuthenticator {
    /// Mint a fresh token for `agent_id`.
    #[must_use]
    pub fn issue(&self, agent_id: &str) -> String {
        let token = format!("{TOKEN_PREFIX}{}", Uuid::new_v4().simple());
        tracing::debug!(agent_id, "issued session token");
        token
    }

    /// True only for an exact match with the agent's current token.
    #[must_use]
    pub fn validate(&self, agent: &Agent, token: &str) -> bool {
        !token.is_empty() && constant_time_eq(agent.session_token.as_bytes(), token.as_bytes())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
