//! Billing error types

use thiserror::Error;

/// Billing-specific errors
///
/// Coupon validation failures are deliberately NOT represented here: they are
/// reported inside the price breakdown (non-fatal) so the caller can decide
/// whether to reject the request or proceed at full price.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Payment provider error: {0}")]
    Provider(String),

    #[error("Payment method is already attached to another customer")]
    PaymentMethodAlreadyAttached,

    #[error("Payment method is not attached to any customer")]
    PaymentMethodNotAttached,

    #[error("Webhook signature verification failed")]
    SignatureInvalid,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::Provider(err.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => BillingError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db_err) => {
                // PostgreSQL unique violation backs the one-open-subscription
                // invariant; surface it as a conflict, not a 500.
                if db_err.code().as_deref() == Some("23505") {
                    return BillingError::Conflict("resource already exists".to_string());
                }
                BillingError::Database(db_err.to_string())
            }
            _ => BillingError::Database(err.to_string()),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
