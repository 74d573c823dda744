use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub(crate) struct ErrorBody {
    pub(crate) detail: String,
}

#[derive(Debug)]
pub(crate) struct ApiError {
    pub(crate) status: StatusCode,
    pub(crate) detail: String,
}

impl ApiError {
    pub(crate) fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self { status, detail: detail.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(ErrorBody { detail: self.detail })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, value.to_string())
    }
}

// Why a bid attempt was turned away. These are values, not errors: the bid
// result carries them and a rejected event is still recorded for each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum RejectReason {
    InvalidAmount,
    UnsupportedMode,
    DelayedNotLive,
    DelayedCutoffPassed,
    BelowStartingPrice,
    BelowMinimumIncrement,
    AuctionNotFound,
    AuctionNotBiddable,
    LockContention,
}

impl RejectReason {
    pub(crate) fn code(&self) -> &'static str {
        match self {
            RejectReason::InvalidAmount => "INVALID_AMOUNT",
            RejectReason::UnsupportedMode => "UNSUPPORTED_MODE",
            RejectReason::DelayedNotLive => "DELAYED_NOT_LIVE",
            RejectReason::DelayedCutoffPassed => "DELAYED_CUTOFF_PASSED",
            RejectReason::BelowStartingPrice => "BELOW_STARTING_PRICE",
            RejectReason::BelowMinimumIncrement => "BELOW_MINIMUM_INCREMENT",
            RejectReason::AuctionNotFound => "AUCTION_NOT_FOUND",
            RejectReason::AuctionNotBiddable => "AUCTION_NOT_BIDDABLE",
            RejectReason::LockContention => "LOCK_CONTENTION",
        }
    }

    pub(crate) fn detail(&self) -> &'static str {
        match self {
            RejectReason::InvalidAmount => "Bid amount must be a positive whole-dollar value",
            RejectReason::UnsupportedMode => "Bid mode must be IMMEDIATE or DELAYED",
            RejectReason::DelayedNotLive => "Delayed bids are only accepted while the auction is live",
            RejectReason::DelayedCutoffPassed => "Delayed bid registration has closed for this auction",
            RejectReason::BelowStartingPrice => "Bid is below the starting price",
            RejectReason::BelowMinimumIncrement => "Bid does not meet the minimum increment",
            RejectReason::AuctionNotFound => "Auction not found",
            RejectReason::AuctionNotBiddable => "Auction is not open for bidding",
            RejectReason::LockContention => "Auction is busy, please retry",
        }
    }

    // Transient rejections are safe to retry as-is; everything else needs a
    // different bid.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, RejectReason::LockContention)
    }
}
