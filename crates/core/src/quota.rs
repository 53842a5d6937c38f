//! Quota account view.

use crate::ids::UserId;
use serde::{Deserialize, Serialize};

/// A user's storage allowance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaAccount {
    pub user_id: UserId,
    pub limit_bytes: u64,
    pub used_bytes: u64,
}

impl QuotaAccount {
    /// Bytes still available once `reserved` in-flight bytes are accounted for.
    pub fn available(&self, reserved: u64) -> u64 {
        self.limit_bytes
            .saturating_sub(self.used_bytes.saturating_add(reserved))
    }

    /// Whether `bytes` more fit next to `reserved` in-flight bytes.
    pub fn can_fit(&self, reserved: u64, bytes: u64) -> bool {
        self.used_bytes
            .checked_add(reserved)
            .and_then(|v| v.checked_add(bytes))
            .is_some_and(|total| total <= self.limit_bytes)
    }

    pub fn usage(&self) -> QuotaUsage {
        QuotaUsage {
            quota: self.limit_bytes,
            used_quota: self.used_bytes,
        }
    }
}

/// Quota response `{quota, usedQuota}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUsage {
    pub quota: u64,
    pub used_quota: u64,
}
