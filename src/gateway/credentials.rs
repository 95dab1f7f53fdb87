//! Backend credential pool.
//!
//! The pool owns every backend API key together with its selection weight and
//! hands one out per request. Three strategies are available; the default,
//! [`SelectionStrategy::WeightedRoundRobin`], picks a weight tier at random in
//! proportion to its mass (`weight * tier size`) and then rotates through the
//! tier's members in order, so equal-weight keys are used strictly in turn.
//!
//! All cursor state lives behind one mutex owned by the pool. Critical sections
//! are index arithmetic plus a bounded walk over the tiers; nothing awaits or
//! performs I/O while the lock is held.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::GatewayError;
use crate::utils::http::truncate_chars;

const KEY_PREVIEW_CHARS: usize = 8;

#[derive(Clone, PartialEq)]
pub struct Credential {
    id: usize,
    name: String,
    secret: String,
    weight: f64,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("secret", &"<redacted>")
            .field("weight", &self.weight)
            .finish()
    }
}

impl Credential {
    pub fn new(
        id: usize,
        name: impl Into<String>,
        secret: impl Into<String>,
        weight: f64,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            secret: secret.into(),
            weight,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Whether the credential takes part in weighted selection.
    pub fn has_positive_weight(&self) -> bool {
        self.weight > 0.0
    }

    pub fn key_preview(&self) -> String {
        truncate_chars(&self.secret, KEY_PREVIEW_CHARS)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    Weighted,
    #[default]
    WeightedRoundRobin,
}

impl SelectionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            SelectionStrategy::RoundRobin => "round_robin",
            SelectionStrategy::Weighted => "weighted",
            SelectionStrategy::WeightedRoundRobin => "weighted_round_robin",
        }
    }
}

/// Source of uniform draws in `[0, 1)` used by the weighted strategies.
pub trait Entropy: Send + Sync {
    fn next_unit(&self) -> f64;
}

#[derive(Debug, Default)]
pub struct SystemEntropy;

impl Entropy for SystemEntropy {
    fn next_unit(&self) -> f64 {
        let mut bytes = [0u8; 8];
        if getrandom::fill(&mut bytes).is_err() {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|duration| duration.subsec_nanos())
                .unwrap_or(0);
            return f64::from(nanos) / 1_000_000_000.0;
        }
        // 53 random mantissa bits give an exact, uniformly spaced value in [0, 1).
        let bits = u64::from_le_bytes(bytes) >> 11;
        bits as f64 / (1u64 << 53) as f64
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CredentialPreview {
    pub id: usize,
    pub name: String,
    pub weight: f64,
    pub key_preview: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TierStats {
    pub weight: f64,
    pub size: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolStats {
    pub count: usize,
    pub total_weight: f64,
    pub cursor: usize,
    pub tiers: Vec<TierStats>,
    pub keys: Vec<CredentialPreview>,
}

#[derive(Debug)]
struct Tier {
    weight: f64,
    members: Vec<usize>,
    cursor: usize,
}

impl Tier {
    fn mass(&self) -> f64 {
        if self.weight > 0.0 {
            self.weight * self.members.len() as f64
        } else {
            0.0
        }
    }
}

#[derive(Debug)]
struct PoolState {
    credentials: Vec<Credential>,
    // Sorted by descending weight.
    tiers: Vec<Tier>,
    total_weight: f64,
    cursor: usize,
}

impl PoolState {
    fn new(credentials: Vec<Credential>) -> Self {
        let mut tiers: Vec<Tier> = Vec::new();
        for (idx, credential) in credentials.iter().enumerate() {
            let bits = credential.weight.to_bits();
            match tiers.iter_mut().find(|tier| tier.weight.to_bits() == bits) {
                Some(tier) => tier.members.push(idx),
                None => tiers.push(Tier {
                    weight: credential.weight,
                    members: vec![idx],
                    cursor: 0,
                }),
            }
        }
        tiers.sort_by(|a, b| b.weight.total_cmp(&a.weight));

        let total_weight = credentials
            .iter()
            .filter(|credential| credential.has_positive_weight())
            .map(Credential::weight)
            .sum();

        Self {
            credentials,
            tiers,
            total_weight,
            cursor: 0,
        }
    }

    fn next_round_robin(&mut self) -> Credential {
        let credential = self.credentials[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.credentials.len();
        credential
    }

    fn pick_weighted(&self, draw: f64) -> Credential {
        let mut cumulative = 0.0;
        let mut last_eligible = None;
        for credential in self
            .credentials
            .iter()
            .filter(|credential| credential.has_positive_weight())
        {
            cumulative += credential.weight;
            if draw < cumulative {
                return credential.clone();
            }
            last_eligible = Some(credential);
        }
        last_eligible
            .or_else(|| self.credentials.last())
            .cloned()
            .unwrap_or_else(|| self.credentials[0].clone())
    }

    /// Walks tiers heaviest first. A draw landing exactly on a boundary
    /// belongs to the heavier tier; if rounding leaves the draw past the last
    /// boundary the heaviest tier wins.
    fn pick_tier(&self, draw: f64) -> usize {
        let mut cumulative = 0.0;
        for (idx, tier) in self.tiers.iter().enumerate() {
            let mass = tier.mass();
            if mass <= 0.0 {
                continue;
            }
            cumulative += mass;
            if draw <= cumulative {
                return idx;
            }
        }
        0
    }

    fn next_in_tier(&mut self, tier_idx: usize) -> Credential {
        let tier = &mut self.tiers[tier_idx];
        let member = tier.members[tier.cursor];
        tier.cursor = (tier.cursor + 1) % tier.members.len();
        self.credentials[member].clone()
    }
}

pub struct CredentialPool {
    state: Mutex<PoolState>,
    entropy: Box<dyn Entropy>,
}

impl std::fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("CredentialPool")
            .field("count", &state.credentials.len())
            .field("total_weight", &state.total_weight)
            .finish()
    }
}

impl CredentialPool {
    pub fn new(credentials: Vec<Credential>) -> Result<Self, GatewayError> {
        validate_credentials(&credentials)?;
        let state = PoolState::new(credentials);
        tracing::info!(
            keys = state.credentials.len(),
            total_weight = state.total_weight,
            tiers = state.tiers.len(),
            "initialized credential pool"
        );
        for credential in &state.credentials {
            tracing::info!(name = %credential.name, weight = credential.weight, "credential");
        }
        Ok(Self {
            state: Mutex::new(state),
            entropy: Box::new(SystemEntropy),
        })
    }

    pub fn with_entropy(mut self, entropy: impl Entropy + 'static) -> Self {
        self.entropy = Box::new(entropy);
        self
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().credentials.is_empty()
    }

    pub fn select(&self, strategy: SelectionStrategy) -> Credential {
        match strategy {
            SelectionStrategy::RoundRobin => self.select_round_robin(),
            SelectionStrategy::Weighted => self.select_weighted_random(),
            SelectionStrategy::WeightedRoundRobin => self.select_weighted_round_robin(),
        }
    }

    /// Plain rotation over the whole pool, ignoring weights.
    pub fn select_round_robin(&self) -> Credential {
        let credential = self.lock().next_round_robin();
        tracing::debug!(name = %credential.name, "selected credential (round-robin)");
        credential
    }

    /// Independent weighted draw; falls back to rotation when no credential
    /// has a positive weight.
    pub fn select_weighted_random(&self) -> Credential {
        let unit = self.entropy.next_unit();
        let mut state = self.lock();
        if state.total_weight <= 0.0 || state.total_weight.is_nan() {
            let credential = state.next_round_robin();
            drop(state);
            tracing::debug!(name = %credential.name, "selected credential (fallback round-robin)");
            return credential;
        }
        let credential = state.pick_weighted(unit * state.total_weight);
        drop(state);
        tracing::debug!(
            name = %credential.name,
            weight = credential.weight,
            "selected credential (weighted)"
        );
        credential
    }

    /// Weighted tier choice followed by strict rotation inside the tier.
    pub fn select_weighted_round_robin(&self) -> Credential {
        let unit = self.entropy.next_unit();
        let mut state = self.lock();
        if state.total_weight <= 0.0 || state.total_weight.is_nan() {
            let credential = state.next_round_robin();
            drop(state);
            tracing::debug!(name = %credential.name, "selected credential (fallback round-robin)");
            return credential;
        }
        let tier_idx = state.pick_tier(unit * state.total_weight);
        let credential = state.next_in_tier(tier_idx);
        drop(state);
        tracing::debug!(
            name = %credential.name,
            weight = credential.weight,
            "selected credential (weighted round-robin)"
        );
        credential
    }

    pub fn by_name(&self, name: &str) -> Option<Credential> {
        self.lock()
            .credentials
            .iter()
            .find(|credential| credential.name == name)
            .cloned()
    }

    /// First credential in configured order. Leaves every cursor untouched,
    /// for calls that must not shift the chat rotation.
    pub fn primary(&self) -> Option<Credential> {
        self.lock().credentials.first().cloned()
    }

    pub fn all(&self) -> Vec<Credential> {
        self.lock().credentials.clone()
    }

    /// Swaps in a new credential set and resets every cursor. On error the
    /// current set stays in place.
    pub fn replace(&self, credentials: Vec<Credential>) -> Result<(), GatewayError> {
        validate_credentials(&credentials)?;
        let next = PoolState::new(credentials);
        let (count, total_weight) = (next.credentials.len(), next.total_weight);
        *self.lock() = next;
        tracing::info!(keys = count, total_weight, "replaced credential pool");
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            count: state.credentials.len(),
            total_weight: state.total_weight,
            cursor: state.cursor,
            tiers: state
                .tiers
                .iter()
                .map(|tier| TierStats {
                    weight: tier.weight,
                    size: tier.members.len(),
                })
                .collect(),
            keys: state
                .credentials
                .iter()
                .map(|credential| CredentialPreview {
                    id: credential.id,
                    name: credential.name.clone(),
                    weight: credential.weight,
                    key_preview: credential.key_preview(),
                })
                .collect(),
        }
    }
}

fn validate_credentials(credentials: &[Credential]) -> Result<(), GatewayError> {
    if credentials.is_empty() {
        return Err(GatewayError::InvalidConfiguration {
            reason: "at least one API key is required".to_string(),
        });
    }
    for (idx, credential) in credentials.iter().enumerate() {
        if credential.secret.trim().is_empty() {
            return Err(GatewayError::InvalidConfiguration {
                reason: format!("API key at index {idx} is empty"),
            });
        }
        if credentials[..idx]
            .iter()
            .any(|other| other.name == credential.name)
        {
            return Err(GatewayError::InvalidConfiguration {
                reason: format!("duplicate API key name: {}", credential.name),
            });
        }
    }
    Ok(())
}
