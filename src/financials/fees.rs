//! Flat-rate fee schedule used when the provider reports no itemized fees.

use crate::financials::round_cents;

const FVF_RATE: f64 = 0.10;
const FVF_TIER_CAP: f64 = 750.0;
const FVF_EXCESS_RATE: f64 = 0.02;
const PAYMENT_RATE: f64 = 0.029;
const PAYMENT_FIXED: f64 = 0.30;
pub const LISTING_FEE: f64 = 0.35;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeeEstimate {
    pub final_value_fee: f64,
    pub payment_fee: f64,
    pub listing_fee: f64,
}

/// 10% of the price up to $750 plus 2% of the excess.
pub fn final_value_fee(price: f64) -> f64 {
    let price = price.max(0.0);
    let tiered = price.min(FVF_TIER_CAP) * FVF_RATE;
    let excess = (price - FVF_TIER_CAP).max(0.0) * FVF_EXCESS_RATE;
    round_cents(tiered + excess)
}

pub fn payment_fee(price: f64) -> f64 {
    round_cents(price.max(0.0) * PAYMENT_RATE + PAYMENT_FIXED)
}

pub fn estimate(price: f64) -> FeeEstimate {
    FeeEstimate {
        final_value_fee: final_value_fee(price),
        payment_fee: payment_fee(price),
        listing_fee: LISTING_FEE,
    }
}
