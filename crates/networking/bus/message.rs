use serde::{Deserialize, Serialize};
use std::fmt::Display;

use automine_common::types::{
    AgentId, JobKind, OreObservation, Position, QuarryConfig, QuarryId, Tunnel, TunnelId,
    TunnelState,
};
use automine_common::utils::unix_now_ms;

/// Protocol string carried by every envelope. Bump the suffix on any
/// incompatible wire change.
pub const PROTOCOL: &str = "auto_mine/2";

/// Fleet traffic. Every variant's payload is fixed; unknown variants fail
/// decoding rather than being half-understood.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Heartbeat {
        status: String,
        job: Option<JobKind>,
        fuel: u32,
        config_version: u64,
    },
    ConfigRequest,
    ConfigResponse {
        config: QuarryConfig,
    },
    ConfigUpdate {
        config: QuarryConfig,
    },
    /// Ask the leader for tunnel work.
    JobRequest,
    /// Leader's answer: the tunnel now claimed for the addressee.
    Assign {
        tunnel: Tunnel,
    },
    /// Return a tunnel to the leader with the progress it reached.
    JobRelease {
        tunnel: TunnelId,
        progress: u32,
        state: TunnelState,
    },
    /// A fresh ore sighting, for fleet-wide dedupe of ore jobs.
    OreFound {
        observation: OreObservation,
    },
    /// A vein was consumed; peers promote the listed cells to mined.
    OreMined {
        block: String,
        mined: Vec<Position>,
    },
    Recall {
        active: bool,
    },
    /// Sent once a recalled agent is parked on the spawn column.
    HomeAck,
}

impl Message {
    pub const fn kind(&self) -> &'static str {
        match self {
            Message::Heartbeat { .. } => "heartbeat",
            Message::ConfigRequest => "config_request",
            Message::ConfigResponse { .. } => "config_response",
            Message::ConfigUpdate { .. } => "config_update",
            Message::JobRequest => "job_request",
            Message::Assign { .. } => "assign",
            Message::JobRelease { .. } => "job_release",
            Message::OreFound { .. } => "ore_found",
            Message::OreMined { .. } => "ore_mined",
            Message::Recall { .. } => "recall",
            Message::HomeAck => "home_ack",
        }
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind())
    }
}

/// One datagram. `seq` is monotonic per sender and survives restarts (the
/// sender persists its counter), so receivers can drop replays without
/// breaking after a crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub protocol: String,
    pub quarry: QuarryId,
    pub sender: AgentId,
    pub seq: u64,
    pub timestamp_ms: u64,
    /// `None` for broadcast; `Some(agent)` for directed traffic that other
    /// receivers must ignore.
    pub to: Option<AgentId>,
    pub message: Message,
}

impl Envelope {
    pub fn new(
        quarry: QuarryId,
        sender: AgentId,
        seq: u64,
        to: Option<AgentId>,
        message: Message,
    ) -> Self {
        Self {
            protocol: PROTOCOL.to_string(),
            quarry,
            sender,
            seq,
            timestamp_ms: unix_now_ms(),
            to,
            message,
        }
    }

    /// Whether this envelope should be processed by `local` on `quarry`.
    pub fn accepted_by(&self, local: AgentId, quarry: &QuarryId) -> bool {
        self.protocol == PROTOCOL
            && &self.quarry == quarry
            && self.sender != local
            && self.to.is_none_or(|target| target == local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use automine_common::types::Position;

    #[test]
    fn wire_format_is_tagged_snake_case() {
        let envelope = Envelope::new(
            QuarryId::from("alpha"),
            AgentId(1),
            7,
            None,
            Message::Heartbeat {
                status: "idle".into(),
                job: None,
                fuel: 512,
                config_version: 3,
            },
        );
        let text = serde_json::to_string(&envelope).expect("encode");
        assert!(text.contains("\"type\":\"heartbeat\""));
        assert!(text.contains("\"protocol\":\"auto_mine/2\""));

        let decoded: Envelope = serde_json::from_str(&text).expect("decode");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn directed_envelopes_filter_by_addressee() {
        let quarry = QuarryId::from("alpha");
        let env = Envelope::new(
            quarry.clone(),
            AgentId(1),
            0,
            Some(AgentId(2)),
            Message::Assign {
                tunnel: Tunnel::new(TunnelId(0), Position::ORIGIN, 4),
            },
        );
        assert!(env.accepted_by(AgentId(2), &quarry));
        assert!(!env.accepted_by(AgentId(3), &quarry));
        // Senders never process their own datagrams.
        assert!(!env.accepted_by(AgentId(1), &quarry));
    }

    #[test]
    fn foreign_quarries_are_rejected() {
        let env = Envelope::new(
            QuarryId::from("alpha"),
            AgentId(1),
            0,
            None,
            Message::Recall { active: true },
        );
        assert!(!env.accepted_by(AgentId(2), &QuarryId::from("beta")));
    }
}
