//! Peer reputation.
//!
//! Every peer carries two sub-scores in `[-100, 100]`: `req_resp` for direct
//! request/response interaction and `gossip` for broadcast behaviour. Both decay
//! toward zero with an exponential half-life. The composite score drives the
//! peer's state:
//!
//! - `Healthy`: eligible for requests
//! - `Disconnected`: composite at or below the disconnect threshold
//! - `Banned`: composite at or below the ban threshold; frozen for a cool-down
//!
//! States move downward on penalties and upward only through decay.

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

pub const MAX_SCORE: f64 = 100.0;
pub const MIN_SCORE: f64 = -100.0;

/// Scores this close to zero are snapped to zero after decay.
const DECAY_FLOOR: f64 = 1e-3;

/// Scoring parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreConfig {
    /// Time for a sub-score to halve on its own.
    pub half_life_secs: u64,
    /// How long a banned peer's score stays frozen.
    pub ban_cool_down_secs: u64,
    pub disconnect_threshold: f64,
    pub ban_threshold: f64,
    /// Multiplier applied to the gossip sub-score in the composite.
    pub gossip_weight: f64,
    /// Floor on the weighted gossip contribution. Must sit above `disconnect_threshold`.
    pub gossip_negative_cap: f64,
    /// Ceiling on the weighted gossip contribution.
    pub gossip_positive_cap: f64,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            half_life_secs: 600,
            ban_cool_down_secs: 30 * 60,
            disconnect_threshold: -20.0,
            ban_threshold: -50.0,
            gossip_weight: 0.5,
            gossip_negative_cap: -10.0,
            gossip_positive_cap: 5.0,
        }
    }
}

impl ScoreConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.half_life_secs == 0 {
            return Err("half_life_secs must be positive");
        }
        if self.ban_threshold >= self.disconnect_threshold {
            return Err("ban_threshold must be below disconnect_threshold");
        }
        if self.gossip_negative_cap <= self.disconnect_threshold {
            return Err("gossip_negative_cap must sit above disconnect_threshold");
        }
        if self.gossip_positive_cap < 0.0 || self.gossip_weight < 0.0 {
            return Err("gossip weight and positive cap must be non-negative");
        }
        Ok(())
    }

    pub fn half_life(&self) -> Duration {
        Duration::from_secs(self.half_life_secs)
    }

    pub fn ban_cool_down(&self) -> Duration {
        Duration::from_secs(self.ban_cool_down_secs)
    }
}

/// Severity of a peer fault, from the peer's point of view how much we tolerate it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerAction {
    /// Immediately ban.
    Fatal,
    /// Two of these reach the disconnect threshold.
    LowTolerance,
    MidTolerance,
    HighTolerance,
}

impl PeerAction {
    pub fn score_delta(self) -> f64 {
        match self {
            PeerAction::Fatal => MIN_SCORE * 2.0,
            PeerAction::LowTolerance => -10.0,
            PeerAction::MidTolerance => -5.0,
            PeerAction::HighTolerance => -1.0,
        }
    }
}

/// How a request to a peer went wrong, as far as scoring is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestFailure {
    /// No first byte or next item within the deadline.
    Timeout,
    /// The peer does not speak the protocol.
    UnsupportedProtocol,
    /// The stream ended before the single expected item.
    IncompleteStream,
    /// Bad framing, bad status byte, oversize or undecodable payload.
    Malformed,
    /// Well-formed data that failed cryptographic verification.
    InvalidData,
    /// Context bytes for a fork this chain does not have.
    WrongNetwork,
    /// The peer answered with a server error status.
    ServerError,
    /// The peer does not have the requested data.
    ResourceUnavailable,
    /// A well-formed response with nothing the requester could use, for a
    /// request that data must exist for.
    NothingUsable,
    /// Connection-level failure while the request was in flight.
    ConnectionError,
}

/// Penalty for a failed request.
///
/// `load_bearing` is true for the light client protocols the sync depends on.
/// Optional protocols are not held against a peer that doesn't implement them.
pub fn penalty_for(failure: RequestFailure, load_bearing: bool) -> Option<PeerAction> {
    match failure {
        RequestFailure::UnsupportedProtocol if load_bearing => Some(PeerAction::MidTolerance),
        RequestFailure::UnsupportedProtocol => None,
        RequestFailure::Timeout if load_bearing => Some(PeerAction::MidTolerance),
        RequestFailure::Timeout => Some(PeerAction::HighTolerance),
        RequestFailure::IncompleteStream if load_bearing => Some(PeerAction::MidTolerance),
        RequestFailure::IncompleteStream => Some(PeerAction::HighTolerance),
        RequestFailure::Malformed => Some(PeerAction::LowTolerance),
        RequestFailure::InvalidData => Some(PeerAction::LowTolerance),
        RequestFailure::WrongNetwork => Some(PeerAction::Fatal),
        RequestFailure::ServerError => Some(PeerAction::HighTolerance),
        RequestFailure::ResourceUnavailable => None,
        RequestFailure::NothingUsable if load_bearing => Some(PeerAction::MidTolerance),
        RequestFailure::NothingUsable => Some(PeerAction::HighTolerance),
        RequestFailure::ConnectionError => Some(PeerAction::HighTolerance),
    }
}

/// Connection eligibility derived from the composite score.
/// Ordered from best to worst.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ScoreState {
    Healthy,
    Disconnected,
    Banned,
}

impl ScoreState {
    fn worse(self) -> Self {
        match self {
            ScoreState::Healthy => ScoreState::Disconnected,
            _ => ScoreState::Banned,
        }
    }

    fn better(self) -> Self {
        match self {
            ScoreState::Banned => ScoreState::Disconnected,
            _ => ScoreState::Healthy,
        }
    }
}

impl std::fmt::Display for ScoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScoreState::Healthy => write!(f, "healthy"),
            ScoreState::Disconnected => write!(f, "disconnected"),
            ScoreState::Banned => write!(f, "banned"),
        }
    }
}

/// The reputation of a single peer.
#[derive(Clone, Debug)]
pub struct Score {
    req_resp: f64,
    gossip: f64,
    composite: f64,
    state: ScoreState,
    cool_down_until: Option<Instant>,
    last_decay: Instant,
}

impl Score {
    pub fn new(now: Instant) -> Self {
        Self {
            req_resp: 0.0,
            gossip: 0.0,
            composite: 0.0,
            state: ScoreState::Healthy,
            cool_down_until: None,
            last_decay: now,
        }
    }

    pub fn req_resp(&self) -> f64 {
        self.req_resp
    }

    pub fn gossip(&self) -> f64 {
        self.gossip
    }

    pub fn composite(&self) -> f64 {
        self.composite
    }

    pub fn state(&self) -> ScoreState {
        self.state
    }

    pub fn cool_down_until(&self) -> Option<Instant> {
        self.cool_down_until
    }

    /// Banned and still inside the cool-down.
    pub fn is_frozen(&self, now: Instant) -> bool {
        self.state == ScoreState::Banned && self.cool_down_until.is_some_and(|until| now < until)
    }

    /// Apply a request/response penalty. Returns the states entered, in order.
    pub fn apply_action(
        &mut self,
        action: PeerAction,
        config: &ScoreConfig,
        now: Instant,
    ) -> Vec<ScoreState> {
        if self.is_frozen(now) {
            return Vec::new();
        }
        self.req_resp = (self.req_resp + action.score_delta()).clamp(MIN_SCORE, MAX_SCORE);
        self.update_state(config, now, false)
    }

    /// Adjust the gossip sub-score. Returns the states entered, in order.
    pub fn apply_gossip(&mut self, delta: f64, config: &ScoreConfig, now: Instant) -> Vec<ScoreState> {
        if self.is_frozen(now) {
            return Vec::new();
        }
        self.gossip = (self.gossip + delta).clamp(MIN_SCORE, MAX_SCORE);
        self.update_state(config, now, false)
    }

    /// Decay both sub-scores toward zero. Frozen scores are left alone and
    /// resume decaying from the end of their cool-down.
    pub fn decay(&mut self, config: &ScoreConfig, now: Instant) -> Vec<ScoreState> {
        if self.is_frozen(now) {
            self.last_decay = now;
            return Vec::new();
        }

        let start = match self.cool_down_until {
            Some(until) if until > self.last_decay => until,
            _ => self.last_decay,
        };
        let elapsed = now.saturating_duration_since(start);
        self.last_decay = now;

        let factor = 0.5f64.powf(elapsed.as_secs_f64() / config.half_life().as_secs_f64());
        self.req_resp = snap_to_zero(self.req_resp * factor);
        self.gossip = snap_to_zero(self.gossip * factor);
        self.update_state(config, now, true)
    }

    fn update_state(&mut self, config: &ScoreConfig, now: Instant, allow_recovery: bool) -> Vec<ScoreState> {
        let weighted_gossip = (self.gossip * config.gossip_weight)
            .clamp(config.gossip_negative_cap, config.gossip_positive_cap);
        self.composite = self.req_resp + weighted_gossip;

        let target = if self.composite <= config.ban_threshold {
            ScoreState::Banned
        } else if self.composite <= config.disconnect_threshold {
            ScoreState::Disconnected
        } else {
            ScoreState::Healthy
        };

        let mut entered = Vec::new();
        while target > self.state {
            self.state = self.state.worse();
            if self.state == ScoreState::Banned {
                self.cool_down_until = Some(now + config.ban_cool_down());
            }
            entered.push(self.state);
        }
        while allow_recovery && target < self.state {
            self.state = self.state.better();
            entered.push(self.state);
        }
        if self.state != ScoreState::Banned {
            self.cool_down_until = None;
        }
        entered
    }
}

fn snap_to_zero(value: f64) -> f64 {
    if value.abs() < DECAY_FLOOR {
        0.0
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ScoreConfig::default().validate().is_ok());
        let bad = ScoreConfig {
            gossip_negative_cap: -30.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_two_low_tolerance_faults_disconnect() {
        let config = ScoreConfig::default();
        let now = Instant::now();
        let mut score = Score::new(now);

        assert!(score.apply_action(PeerAction::LowTolerance, &config, now).is_empty());
        assert_eq!(
            score.apply_action(PeerAction::LowTolerance, &config, now),
            vec![ScoreState::Disconnected]
        );
        assert_eq!(score.composite(), -20.0);
    }

    #[test]
    fn test_fatal_reports_both_transitions() {
        let config = ScoreConfig::default();
        let now = Instant::now();
        let mut score = Score::new(now);

        let entered = score.apply_action(PeerAction::Fatal, &config, now);
        assert_eq!(entered, vec![ScoreState::Disconnected, ScoreState::Banned]);
        assert_eq!(score.req_resp(), MIN_SCORE);
        assert_eq!(score.cool_down_until(), Some(now + config.ban_cool_down()));
    }

    #[test]
    fn test_gossip_alone_never_disconnects() {
        let config = ScoreConfig::default();
        let now = Instant::now();
        let mut score = Score::new(now);

        for _ in 0..50 {
            assert!(score.apply_gossip(-10.0, &config, now).is_empty());
        }
        assert_eq!(score.gossip(), MIN_SCORE);
        assert_eq!(score.composite(), config.gossip_negative_cap);
        assert_eq!(score.state(), ScoreState::Healthy);
    }

    #[test]
    fn test_positive_gossip_bonus_is_bounded() {
        let config = ScoreConfig::default();
        let now = Instant::now();
        let mut score = Score::new(now);

        for _ in 0..200 {
            score.apply_gossip(1.0, &config, now);
        }
        assert_eq!(score.composite(), config.gossip_positive_cap);
        // The bonus offsets part of a penalty
        score.apply_action(PeerAction::LowTolerance, &config, now);
        score.apply_action(PeerAction::LowTolerance, &config, now);
        assert_eq!(score.state(), ScoreState::Healthy);
        score.apply_action(PeerAction::LowTolerance, &config, now);
        assert_eq!(score.state(), ScoreState::Disconnected);
    }

    #[test]
    fn test_decay_halves_per_half_life() {
        let config = ScoreConfig::default();
        let start = Instant::now();
        let mut score = Score::new(start);
        score.apply_action(PeerAction::LowTolerance, &config, start);

        score.decay(&config, start + config.half_life());
        assert!((score.req_resp() + 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_banned_score_frozen_then_recovers() {
        let config = ScoreConfig::default();
        let start = Instant::now();
        let mut score = Score::new(start);
        score.apply_action(PeerAction::Fatal, &config, start);

        // Inside the cool-down nothing moves
        let during = start + Duration::from_secs(29 * 60);
        assert!(score.decay(&config, during).is_empty());
        assert_eq!(score.req_resp(), MIN_SCORE);
        assert!(score.apply_action(PeerAction::LowTolerance, &config, during).is_empty());
        assert_eq!(score.req_resp(), MIN_SCORE);

        // One half-life after the cool-down: -50 is still a ban
        let expiry = start + config.ban_cool_down();
        score.decay(&config, expiry + Duration::from_secs(599));
        assert_eq!(score.state(), ScoreState::Banned);

        let entered = score.decay(&config, expiry + Duration::from_secs(700));
        assert_eq!(entered, vec![ScoreState::Disconnected]);

        let entered = score.decay(&config, expiry + Duration::from_secs(1400));
        assert_eq!(entered, vec![ScoreState::Healthy]);
        assert_eq!(score.cool_down_until(), None);
    }

    #[test]
    fn test_recovery_only_through_decay() {
        let config = ScoreConfig::default();
        let now = Instant::now();
        let mut score = Score::new(now);
        score.apply_action(PeerAction::LowTolerance, &config, now);
        score.apply_action(PeerAction::LowTolerance, &config, now);
        assert_eq!(score.state(), ScoreState::Disconnected);

        // Good gossip lifts the composite but not the state
        for _ in 0..20 {
            score.apply_gossip(1.0, &config, now);
        }
        assert!(score.composite() > config.disconnect_threshold);
        assert_eq!(score.state(), ScoreState::Disconnected);

        assert_eq!(score.decay(&config, now), vec![ScoreState::Healthy]);
    }

    #[test]
    fn test_method_aware_penalties() {
        assert_eq!(
            penalty_for(RequestFailure::UnsupportedProtocol, true),
            Some(PeerAction::MidTolerance)
        );
        assert_eq!(penalty_for(RequestFailure::UnsupportedProtocol, false), None);
        assert_eq!(
            penalty_for(RequestFailure::Timeout, false),
            Some(PeerAction::HighTolerance)
        );
        assert_eq!(
            penalty_for(RequestFailure::InvalidData, true),
            Some(PeerAction::LowTolerance)
        );
        assert_eq!(penalty_for(RequestFailure::ResourceUnavailable, true), None);
        assert_eq!(
            penalty_for(RequestFailure::NothingUsable, true),
            Some(PeerAction::MidTolerance)
        );
    }
}
