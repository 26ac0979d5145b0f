//! Credit package catalog
//!
//! Translates the opaque `packageId` carried in checkout session metadata
//! into a credit amount. Pure lookup against a static table; unknown ids fail
//! closed (no grant) and are reported by the caller as a configuration gap.

/// A purchasable credit package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditPackage {
    pub id: &'static str,
    pub name: &'static str,
    pub credits: i32,
    /// Bonus credits included with larger packages.
    pub bonus: i32,
}

impl CreditPackage {
    /// Credits granted on purchase, bonus included.
    pub fn total_credits(&self) -> i32 {
        self.credits + self.bonus
    }
}

pub const CREDIT_PACKAGES: &[CreditPackage] = &[
    CreditPackage {
        id: "credit-5",
        name: "Starter Pack",
        credits: 5,
        bonus: 0,
    },
    CreditPackage {
        id: "credit-15",
        name: "Creator Pack",
        credits: 15,
        bonus: 2,
    },
    CreditPackage {
        id: "credit-30",
        name: "Pro Pack",
        credits: 30,
        bonus: 5,
    },
];

/// Look up a package by its metadata id.
pub fn find_package(package_id: &str) -> Option<&'static CreditPackage> {
    CREDIT_PACKAGES.iter().find(|p| p.id == package_id)
}
