//! Hash-Time-Lock Contract entity and secret commitment

use chrono::{DateTime, Utc};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HtlcStatus {
    Active,
    Claimed,
    Refunded,
    Expired,
}

impl HtlcStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HtlcStatus::Active => "active",
            HtlcStatus::Claimed => "claimed",
            HtlcStatus::Refunded => "refunded",
            HtlcStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(HtlcStatus::Active),
            "claimed" => Some(HtlcStatus::Claimed),
            "refunded" => Some(HtlcStatus::Refunded),
            "expired" => Some(HtlcStatus::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for HtlcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An HTLC as tracked off-chain. `address` is the chain-local lock
/// identifier and primary key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Htlc {
    pub address: String,
    pub order_id: String,
    pub hashed_secret: String,
    pub amount: U256,
    pub token: String,
    pub sender: String,
    pub receiver: String,
    pub timeout_height: u64,
    pub timeout_timestamp: i64,
    pub status: HtlcStatus,
    pub chain_id: String,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub revealed_secret: Option<String>,
}

impl Htlc {
    /// Whether a refund may be submitted at the given chain height
    pub fn refundable_at(&self, current_height: u64) -> bool {
        self.status == HtlcStatus::Active && current_height >= self.timeout_height
    }

    /// Mark the lock claimed with its revealed secret
    pub fn mark_claimed(&mut self, secret_hex: &str, at: DateTime<Utc>) {
        self.status = HtlcStatus::Claimed;
        self.claimed_at = Some(at);
        self.revealed_secret = Some(secret_hex.to_string());
    }
}

/// Commitment over a 32-byte secret: double SHA-256, identical across all
/// supported chain families. A chain contract using a different pre-image
/// encoding must adapt at its adapter boundary.
pub fn hash_secret(secret: &[u8; 32]) -> [u8; 32] {
    let first = Sha256::digest(secret);
    let second = Sha256::digest(first);
    second.into()
}

/// Check a hex-encoded revealed secret against a hex-encoded commitment.
/// Rejects anything that is not exactly 32 bytes of hex.
pub fn verify_secret(secret_hex: &str, hashed_secret_hex: &str) -> bool {
    let secret_hex = secret_hex.trim_start_matches("0x");
    let hashed_hex = hashed_secret_hex.trim_start_matches("0x");

    let Ok(bytes) = hex::decode(secret_hex) else {
        return false;
    };
    let Ok(secret) = <[u8; 32]>::try_from(bytes.as_slice()) else {
        return false;
    };
    let Ok(expected) = hex::decode(hashed_hex) else {
        return false;
    };

    hash_secret(&secret).as_slice() == expected.as_slice()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commitment_is_double_sha256() {
        let secret = [7u8; 32];
        let manual = Sha256::digest(Sha256::digest(secret));
        assert_eq!(hash_secret(&secret), <[u8; 32]>::from(manual));
    }

    #[test]
    fn verify_secret_accepts_matching_preimage() {
        let secret = [42u8; 32];
        let hashed = hex::encode(hash_secret(&secret));
        assert!(verify_secret(&hex::encode(secret), &hashed));
        assert!(verify_secret(
            &format!("0x{}", hex::encode(secret)),
            &format!("0x{}", hashed)
        ));
    }

    #[test]
    fn verify_secret_rejects_bad_input() {
        let secret = [42u8; 32];
        let hashed = hex::encode(hash_secret(&secret));
        // wrong pre-image
        assert!(!verify_secret(&hex::encode([41u8; 32]), &hashed));
        // wrong length
        assert!(!verify_secret("deadbeef", &hashed));
        // not hex at all
        assert!(!verify_secret("zzzz", &hashed));
    }

    #[test]
    fn refundable_only_past_height_timeout() {
        let htlc = Htlc {
            address: "lock-1".into(),
            order_id: "ord-1".into(),
            hashed_secret: "00".repeat(32),
            amount: U256::from(1u64),
            token: "ETH".into(),
            sender: "0xsender".into(),
            receiver: "0xreceiver".into(),
            timeout_height: 500,
            timeout_timestamp: 0,
            status: HtlcStatus::Active,
            chain_id: "ethereum".into(),
            created_at: Utc::now(),
            claimed_at: None,
            revealed_secret: None,
        };
        assert!(!htlc.refundable_at(499));
        assert!(htlc.refundable_at(500));

        let mut claimed = htlc.clone();
        claimed.mark_claimed("ab", Utc::now());
        assert!(!claimed.refundable_at(1000));
    }
}
