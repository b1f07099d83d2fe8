//! Network misbehaviour on the response path.
//!
//! Per response, in order: optional latency, drop check, fragmentation into
//! separate writes, forced-close check. Requests are never touched. The
//! default profile is disabled and writes the response exactly as built.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_fault_ranges"))]
pub struct FaultProfile {
    pub delay_ms_min: u64,
    pub delay_ms_max: u64,
    #[validate(range(min = 1))]
    pub chunk_min: usize,
    #[validate(range(min = 1))]
    pub chunk_max: usize,
    /// Probability that a response is silently discarded.
    #[validate(range(min = 0.0, max = 1.0))]
    pub drop_rate: f64,
    /// Probability that the connection is closed right after a response.
    #[validate(range(min = 0.0, max = 1.0))]
    pub close_rate: f64,
    /// Random seed for reproducibility (None = random)
    pub seed: Option<u64>,
}

impl Default for FaultProfile {
    fn default() -> Self {
        Self {
            delay_ms_min: 0,
            delay_ms_max: 0,
            chunk_min: 1,
            chunk_max: 1,
            drop_rate: 0.0,
            close_rate: 0.0,
            seed: None,
        }
    }
}

impl FaultProfile {
    pub fn is_disabled(&self) -> bool {
        self.delay_ms_max == 0
            && self.chunk_max <= 1
            && self.drop_rate <= 0.0
            && self.close_rate <= 0.0
    }
}

fn validate_fault_ranges(profile: &FaultProfile) -> Result<(), ValidationError> {
    if profile.delay_ms_min > profile.delay_ms_max {
        return Err(ValidationError::new("delay_ms_min exceeds delay_ms_max"));
    }
    if profile.chunk_min > profile.chunk_max {
        return Err(ValidationError::new("chunk_min exceeds chunk_max"));
    }
    Ok(())
}

/// What happened to a response after injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    Dropped,
    /// Sent, and the connection must now be closed.
    SentThenClose,
}

/// Decisions drawn for one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub delay: Duration,
    /// `None` when the response is dropped.
    pub fragments: Option<Vec<Vec<u8>>>,
    pub close: bool,
}

/// Applies a [`FaultProfile`] to outgoing responses of one connection.
#[derive(Debug)]
pub struct FaultInjector {
    profile: FaultProfile,
    rng: StdRng,
}

impl FaultInjector {
    pub fn new(profile: FaultProfile) -> Self {
        Self::for_connection(profile, 0)
    }

    /// Seeded profiles give each connection its own reproducible stream.
    pub fn for_connection(profile: FaultProfile, connection: u64) -> Self {
        let rng = match profile.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(connection)),
            None => StdRng::from_entropy(),
        };
        Self { profile, rng }
    }

    pub fn profile(&self) -> &FaultProfile {
        &self.profile
    }

    pub fn plan(&mut self, response: &[u8]) -> Plan {
        let delay = if self.profile.delay_ms_max > 0 {
            let max = self.profile.delay_ms_max;
            let ms = self.rng.gen_range(self.profile.delay_ms_min.min(max)..=max);
            Duration::from_millis(ms)
        } else {
            Duration::ZERO
        };

        if self.chance(self.profile.drop_rate) {
            return Plan {
                delay,
                fragments: None,
                close: false,
            };
        }

        let fragments = self.fragment(response);
        let close = self.chance(self.profile.close_rate);
        Plan {
            delay,
            fragments: Some(fragments),
            close,
        }
    }

    /// Write `response` to `writer` under the profile.
    pub async fn deliver<W>(&mut self, writer: &mut W, response: &[u8]) -> std::io::Result<Outcome>
    where
        W: AsyncWrite + Unpin,
    {
        let plan = self.plan(response);
        if !plan.delay.is_zero() {
            tokio::time::sleep(plan.delay).await;
        }
        let Some(fragments) = plan.fragments else {
            return Ok(Outcome::Dropped);
        };
        for fragment in &fragments {
            writer.write_all(fragment).await?;
            writer.flush().await?;
        }
        Ok(if plan.close {
            Outcome::SentThenClose
        } else {
            Outcome::Sent
        })
    }

    fn chance(&mut self, rate: f64) -> bool {
        rate > 0.0 && self.rng.gen_bool(rate.min(1.0))
    }

    /// Split into a uniform number of non-empty pieces within the chunk range.
    fn fragment(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        if self.profile.chunk_max <= 1 || data.len() <= 1 {
            return vec![data.to_vec()];
        }
        let max = self.profile.chunk_max;
        let pieces = self
            .rng
            .gen_range(self.profile.chunk_min.clamp(1, max)..=max)
            .min(data.len());
        if pieces <= 1 {
            return vec![data.to_vec()];
        }

        let mut cuts: Vec<usize> = rand::seq::index::sample(&mut self.rng, data.len() - 1, pieces - 1)
            .into_iter()
            .map(|i| i + 1)
            .collect();
        cuts.sort_unstable();

        let mut fragments = Vec::with_capacity(pieces);
        let mut start = 0;
        for cut in cuts.into_iter().chain(std::iter::once(data.len())) {
            fragments.push(data[start..cut].to_vec());
            start = cut;
        }
        fragments
    }
}
