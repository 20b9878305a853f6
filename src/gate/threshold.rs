//! Minimum score policy.
//!
//! The base comes from the workflow's risk class, complexity moves it by one
//! point, and a security-trigger override raises it by up to three. The
//! result never drops below the risk class base and never exceeds 10.

use crate::workflow::{Complexity, RiskClass};

pub const MAX_SCORE: f64 = 10.0;

pub fn base_score(risk: RiskClass) -> i32 {
    match risk {
        RiskClass::TimeCritical => 6,
        RiskClass::Standard => 7,
        RiskClass::Critical => 8,
        RiskClass::Security => 9,
    }
}

fn complexity_adjustment(complexity: Complexity) -> i32 {
    match complexity {
        Complexity::Low => -1,
        Complexity::Medium => 0,
        Complexity::High => 1,
    }
}

/// Minimum passing score for a gate without an explicit `minimum_score`.
pub fn minimum_score(risk: RiskClass, complexity: Complexity, security_override: u8) -> f64 {
    let base = base_score(risk);
    let mut min = (base + complexity_adjustment(complexity)).clamp(1, MAX_SCORE as i32);
    if security_override > 0 {
        min = (min + i32::from(security_override.min(3))).max(base);
    }
    f64::from(min.min(MAX_SCORE as i32))
}
