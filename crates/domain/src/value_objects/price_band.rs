use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Optional floor/ceiling on the pool price.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBand {
    #[serde(default)]
    pub floor: Option<Decimal>,
    #[serde(default)]
    pub ceiling: Option<Decimal>,
}

/// Which bound a price broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BandViolation {
    BelowFloor { price: Decimal, floor: Decimal },
    AboveCeiling { price: Decimal, ceiling: Decimal },
}

impl fmt::Display for BandViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BandViolation::BelowFloor { price, floor } => {
                write!(f, "price {price} below floor {floor}")
            }
            BandViolation::AboveCeiling { price, ceiling } => {
                write!(f, "price {price} above ceiling {ceiling}")
            }
        }
    }
}

impl PriceBand {
    pub fn new(floor: Option<Decimal>, ceiling: Option<Decimal>) -> Self {
        Self { floor, ceiling }
    }

    pub fn is_configured(&self) -> bool {
        self.floor.is_some() || self.ceiling.is_some()
    }

    pub fn violation(&self, price: Decimal) -> Option<BandViolation> {
        if let Some(floor) = self.floor
            && price < floor
        {
            return Some(BandViolation::BelowFloor { price, floor });
        }
        if let Some(ceiling) = self.ceiling
            && price > ceiling
        {
            return Some(BandViolation::AboveCeiling { price, ceiling });
        }
        None
    }

    pub fn contains(&self, price: Decimal) -> bool {
        self.violation(price).is_none()
    }
}
