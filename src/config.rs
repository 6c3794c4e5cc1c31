// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process-wide tunables, analogous to the `omx__globals` struct: one
// instance per process, handed to `Endpoint::open` and immutable for the
// endpoint's lifetime.

/// Tunable thresholds and limits for the messaging engine.
///
/// Construct with [`Config::default`] for the built-in defaults, or
/// [`Config::from_env`] to pick up the `OMX_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Payloads at or below this size are sent inline in the packet header.
    pub tiny_max: u32,
    /// Payloads at or below this size are copied whole into one packet.
    pub small_max: u32,
    /// Payloads at or below this size are fragmented inline; above it,
    /// rendezvous/pull is used instead.
    pub medium_max: u32,
    /// Maximum bytes per medium fragment.
    pub medium_frag_max: u32,
    /// Maximum number of fragments per medium message.
    pub medium_frags_max: u8,
    /// Number of sendq slots (shared free-list pool for outgoing payloads).
    pub sendq_entries: u32,
    /// Number of recvq slots (shared pool for incoming unexpected payloads).
    pub recvq_entries: u32,
    /// Maximum simultaneously-registered pinned regions per endpoint.
    pub user_region_max: u16,
    /// Threshold of received-but-not-acked fragments before a partner moves
    /// from the delayed ack list to the immediate one.
    pub not_acked_max: u8,
    /// Delayed-ack tick rate; `ack_delay_jiffies ≈ 1000 / ack_per_second`.
    pub ack_per_second: u32,
    /// Resend tick rate; `resend_delay_jiffies ≈ 1000 / resend_per_second`.
    pub resend_per_second: u32,
    /// Per-request retransmission cap before the partner is disconnected.
    pub resends_max: u32,
    /// Maximum bytes per pull-reply frame.
    pub pull_reply_length_max: u32,
    /// Frames per pull block (fixed at 7, see DESIGN.md Open Question a).
    pub replies_per_block: u8,
    /// Timeout before a stalled pull handle re-issues its current block.
    pub pull_resend_timeout_ms: u64,
    /// Timeout of unacked sends before the partner is disconnected outright.
    pub disconnect_timeout_ms: u64,
    /// Whether an endpoint may send to itself via a loopback shortcut.
    pub self_comms: bool,
    /// Rendezvous threshold override for same-host partners.
    pub shared_rndv_threshold: u32,
    /// Number of context-id partition bits for unexpected-queue matching.
    pub ctxids_bits: u8,
    /// If set, `wait` spins before blocking instead of sleeping immediately.
    pub waitspin: bool,
}

impl Config {
    /// Derived: `BLOCK_LENGTH_MAX = pull_reply_length_max * replies_per_block`.
    pub fn pull_block_length_max(&self) -> u32 {
        self.pull_reply_length_max * self.replies_per_block as u32
    }

    pub fn ack_delay_ms(&self) -> u64 {
        1000 / self.ack_per_second as u64
    }

    pub fn resend_delay_ms(&self) -> u64 {
        1000 / self.resend_per_second as u64
    }

    /// Build a `Config` from `OMX_*` environment variables (§6), falling
    /// back to defaults on absence or parse failure.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();

        if let Some(v) = env_u32("OMX_RESENDS_MAX") {
            cfg.resends_max = v;
        }
        if let Some(v) = env_u8("OMX_NOTACKED_MAX") {
            cfg.not_acked_max = v;
        }
        if let Some(v) = env_u32("OMX_SHARED_RNDV_THRESHOLD") {
            cfg.shared_rndv_threshold = v;
        }
        if let Some(v) = env_u8("OMX_CTXIDS") {
            cfg.ctxids_bits = v;
        }
        if env_bool("OMX_DISABLE_SELF") {
            cfg.self_comms = false;
        }
        if env_bool("OMX_WAITSPIN") {
            cfg.waitspin = true;
        }

        cfg
    }
}

fn env_u32(name: &str) -> Option<u32> {
    match std::env::var(name) {
        Ok(s) => match s.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                log::warn!("{name}={s:?} is not a valid integer, ignoring");
                None
            }
        },
        Err(_) => None,
    }
}

fn env_u8(name: &str) -> Option<u8> {
    env_u32(name).map(|v| v.min(u8::MAX as u32) as u8)
}

fn env_bool(name: &str) -> bool {
    matches!(std::env::var(name).as_deref(), Ok("1") | Ok("true") | Ok("yes"))
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tiny_max: 32,
            small_max: 128,
            medium_max: 32 * 1024,
            medium_frag_max: 4096,
            medium_frags_max: 8,
            sendq_entries: 256,
            recvq_entries: 256,
            user_region_max: 32,
            not_acked_max: 4,
            ack_per_second: 64,
            resend_per_second: 2,
            resends_max: 1000,
            pull_reply_length_max: 8192,
            replies_per_block: 7,
            pull_resend_timeout_ms: 1000,
            disconnect_timeout_ms: 60_000,
            self_comms: true,
            shared_rndv_threshold: 32 * 1024,
            ctxids_bits: 0,
            waitspin: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.tiny_max, 32);
        assert_eq!(cfg.pull_block_length_max(), 8192 * 7);
        assert_eq!(cfg.ack_delay_ms(), 1000 / 64);
        assert_eq!(cfg.resend_delay_ms(), 500);
    }

    #[test]
    fn from_env_falls_back_on_bad_value() {
        std::env::set_var("OMX_RESENDS_MAX", "not-a-number");
        let cfg = Config::from_env();
        assert_eq!(cfg.resends_max, Config::default().resends_max);
        std::env::remove_var("OMX_RESENDS_MAX");
    }
}
