//! Payment collaborator contract
//!
//! The engine never talks to a wallet directly. A [`PaymentProvider`] issues
//! invoices and reports whether they have been paid; the invoice monitor polls
//! it until the invoice settles or the payment window closes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentError {
    #[error("invoice creation failed: {0}")]
    InvoiceCreation(String),

    #[error("payment status check failed: {0}")]
    StatusCheck(String),

    #[error("wallet unavailable: {0}")]
    Unavailable(String),
}

/// Settlement state reported by the payment collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Expired,
}

/// What the payment collaborator returns when it issues an invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedInvoice {
    pub encoded_invoice: String,
    pub payment_hash: String,
    pub expires_at: DateTime<Utc>,
}

/// An invoice attached to a job.
///
/// Only `status` changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub payment_hash: String,
    /// Bolt11 (or equivalent) payment request
    pub encoded_invoice: String,
    pub amount_msats: u64,
    pub expires_at: DateTime<Utc>,
    pub status: InvoiceStatus,
}

impl Invoice {
    pub fn from_issued(issued: IssuedInvoice, amount_msats: u64) -> Self {
        Self {
            payment_hash: issued.payment_hash,
            encoded_invoice: issued.encoded_invoice,
            amount_msats,
            expires_at: issued.expires_at,
            status: InvoiceStatus::Pending,
        }
    }
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Issue an invoice for `amount_msats`.
    async fn create_invoice(
        &self,
        amount_msats: u64,
        memo: &str,
    ) -> Result<IssuedInvoice, PaymentError>;

    /// Current settlement state of the invoice with this payment hash.
    async fn check_status(&self, payment_hash: &str) -> Result<InvoiceStatus, PaymentError>;
}
