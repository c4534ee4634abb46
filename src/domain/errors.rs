use thiserror::Error;

/// Entity construction and parse failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid order side: {0}")]
    InvalidOrderSide(String),

    #[error("Invalid order type: {0}")]
    InvalidOrderType(String),

    #[error("Invalid trade side: {0}")]
    InvalidTradeSide(String),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Limit orders must have a price")]
    LimitOrderWithoutPrice,
}

/// Machine-readable risk rejection kinds, persisted with every risk event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskViolationKind {
    KillSwitch,
    DailyLossLimit,
    MaxPositions,
    PositionSize,
    StopLossMissing,
    StopLossTooWide,
}

impl RiskViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskViolationKind::KillSwitch => "KILL_SWITCH",
            RiskViolationKind::DailyLossLimit => "DAILY_LOSS_LIMIT",
            RiskViolationKind::MaxPositions => "MAX_POSITIONS",
            RiskViolationKind::PositionSize => "POSITION_SIZE",
            RiskViolationKind::StopLossMissing => "STOP_LOSS_MISSING",
            RiskViolationKind::StopLossTooWide => "STOP_LOSS_TOO_WIDE",
        }
    }
}

impl std::fmt::Display for RiskViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A trade signal rejected by the risk gate
#[derive(Debug, Error, Clone)]
#[error("Trade rejected ({kind}): {detail}")]
pub struct RiskViolation {
    pub kind: RiskViolationKind,
    pub detail: String,
}

impl RiskViolation {
    pub fn new(kind: RiskViolationKind, detail: impl Into<String>) -> Self {
        RiskViolation {
            kind,
            detail: detail.into(),
        }
    }
}

/// Order lifecycle failures
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    #[error("Illegal order status transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    #[error("No active exchange configured")]
    NoActiveExchange,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Database error: {0}")]
    Database(#[from] crate::persistence::DatabaseError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_violation_display() {
        let violation = RiskViolation::new(
            RiskViolationKind::StopLossTooWide,
            "stop-loss 6.98% is too wide (max 4.00%)",
        );
        assert_eq!(
            violation.to_string(),
            "Trade rejected (STOP_LOSS_TOO_WIDE): stop-loss 6.98% is too wide (max 4.00%)"
        );
    }

    #[test]
    fn test_violation_kind_strings() {
        assert_eq!(RiskViolationKind::DailyLossLimit.as_str(), "DAILY_LOSS_LIMIT");
        assert_eq!(RiskViolationKind::KillSwitch.as_str(), "KILL_SWITCH");
    }

    #[test]
    fn test_illegal_transition_display() {
        let err = OrderError::IllegalTransition {
            from: "FILLED".to_string(),
            to: "OPEN".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Illegal order status transition from FILLED to OPEN"
        );
    }
}
