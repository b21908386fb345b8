//! Common types used across Wedmatch

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SharedError;

// =============================================================================
// ID Wrappers
// =============================================================================

/// User ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Sentinel quota meaning "unlimited requests"
pub const UNLIMITED_REQUESTS: i32 = 999_999;

/// Subscription status stored on the entitlement record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    #[default]
    Inactive,
    Active,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            // Legacy rows used an empty string for "never subscribed"
            "inactive" | "" => Ok(Self::Inactive),
            other => Err(SharedError::UnknownStatus(other.to_string())),
        }
    }
}

/// How the renewal date of a plan is derived when it is bought outside a
/// recurring subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenewalPolicy {
    /// Never renews; `renewal_date` stays null
    Perpetual,
    /// Access lasts a fixed number of days from the purchase
    FixedDays(i64),
}

/// Static description of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanSpec {
    pub display_name: &'static str,
    pub slug: &'static str,
    pub monthly_requests: i32,
    pub recurring: bool,
    pub one_time_renewal: RenewalPolicy,
}

/// Closed set of plans the matching app sells.
///
/// Plan names arrive from the client and from provider metadata as free text;
/// they are parsed into this enum once at the boundary and never compared as
/// strings afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    #[default]
    Free,
    Monthly,
    Premium,
    Unlimited,
    UnlimitedPromo,
}

static PLAN_CATALOG: [(PlanKind, PlanSpec); 5] = [
    (
        PlanKind::Free,
        PlanSpec {
            display_name: "Free Plan",
            slug: "free",
            monthly_requests: 0,
            recurring: false,
            one_time_renewal: RenewalPolicy::FixedDays(30),
        },
    ),
    (
        PlanKind::Monthly,
        PlanSpec {
            display_name: "Monthly Plan",
            slug: "monthly",
            monthly_requests: 10,
            recurring: true,
            one_time_renewal: RenewalPolicy::FixedDays(30),
        },
    ),
    (
        PlanKind::Premium,
        PlanSpec {
            display_name: "Premium Plan",
            slug: "premium",
            monthly_requests: 15,
            recurring: true,
            one_time_renewal: RenewalPolicy::FixedDays(30),
        },
    ),
    (
        PlanKind::Unlimited,
        PlanSpec {
            display_name: "Unlimited Plan",
            slug: "unlimited",
            monthly_requests: UNLIMITED_REQUESTS,
            recurring: false,
            one_time_renewal: RenewalPolicy::Perpetual,
        },
    ),
    (
        PlanKind::UnlimitedPromo,
        PlanSpec {
            display_name: "Unlimited Plan (Promo)",
            slug: "unlimited_promo",
            monthly_requests: UNLIMITED_REQUESTS,
            recurring: false,
            one_time_renewal: RenewalPolicy::Perpetual,
        },
    ),
];

impl PlanKind {
    pub const ALL: [PlanKind; 5] = [
        PlanKind::Free,
        PlanKind::Monthly,
        PlanKind::Premium,
        PlanKind::Unlimited,
        PlanKind::UnlimitedPromo,
    ];

    pub fn spec(&self) -> &'static PlanSpec {
        // PLAN_CATALOG is indexed in declaration order
        &PLAN_CATALOG[*self as usize].1
    }

    pub fn display_name(&self) -> &'static str {
        self.spec().display_name
    }

    pub fn slug(&self) -> &'static str {
        self.spec().slug
    }

    /// Request allowance granted per period
    pub fn monthly_requests(&self) -> i32 {
        self.spec().monthly_requests
    }

    pub fn is_recurring(&self) -> bool {
        self.spec().recurring
    }

    pub fn is_unlimited(&self) -> bool {
        self.monthly_requests() == UNLIMITED_REQUESTS
    }

    /// Plans that are sold as a single purchase (no provider subscription)
    pub fn is_one_time(&self) -> bool {
        !self.is_recurring() && *self != PlanKind::Free
    }

    pub fn one_time_renewal(&self) -> RenewalPolicy {
        self.spec().one_time_renewal
    }

    /// Strict lookup by display name or slug (case-insensitive)
    pub fn lookup(name: &str) -> Option<Self> {
        let normalized = name.trim().to_lowercase();
        if normalized.is_empty() {
            return None;
        }
        PLAN_CATALOG
            .iter()
            .find(|(_, spec)| {
                spec.display_name.to_lowercase() == normalized
                    || spec.slug == normalized
                    || spec.slug.replace('_', " ") == normalized
            })
            .map(|(kind, _)| *kind)
    }

    /// Lenient lookup used at the request boundary: unrecognized plan names
    /// carry no allowance and therefore resolve to `Free`.
    pub fn from_name(name: &str) -> Self {
        match Self::lookup(name) {
            Some(kind) => kind,
            None => {
                tracing::warn!(plan_name = %name, "Unrecognized plan name, treating as free plan");
                PlanKind::Free
            }
        }
    }
}

impl std::fmt::Display for PlanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

impl std::str::FromStr for PlanKind {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::lookup(s).ok_or_else(|| SharedError::UnknownPlan(s.to_string()))
    }
}
