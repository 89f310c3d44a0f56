//! Remote Ledger Record Types
//!
//! Wire representations of the provider's contacts, invoices and payments,
//! plus the per-record validation applied before anything touches local
//! storage. These types live only for the duration of one pull batch; the
//! durable forms are the `Local*` records in the db module.

use crate::db::{LocalContact, LocalInvoice, LocalPayment};
use serde::{Deserialize, Serialize};

/// Record-level rejection reasons surfaced in pull results
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("{entity} {id}: missing required field {field}")]
    MissingField {
        entity: &'static str,
        id: String,
        field: &'static str,
    },

    #[error("payment {id}: must reference exactly one target document, found none")]
    MissingTarget { id: String },

    #[error("payment {id}: must reference exactly one target document, found {count}")]
    AmbiguousTarget { id: String, count: usize },

    #[error("{entity} {id}: record is deleted on the ledger")]
    Deleted { entity: &'static str, id: String },
}

/// Reference to a document a payment settles
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRef {
    #[serde(
        rename = "ID",
        alias = "InvoiceID",
        alias = "CreditNoteID",
        alias = "OverpaymentID",
        alias = "PrepaymentID"
    )]
    pub id: String,
}

/// The document kind a payment is applied against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentTarget {
    Invoice,
    CreditNote,
    Overpayment,
    Prepayment,
}

impl PaymentTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentTarget::Invoice => "invoice",
            PaymentTarget::CreditNote => "credit_note",
            PaymentTarget::Overpayment => "overpayment",
            PaymentTarget::Prepayment => "prepayment",
        }
    }
}

// ============================================================================
// Contacts
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct RemoteContact {
    #[serde(rename = "ContactID")]
    pub contact_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tax_number: Option<String>,

    #[serde(default)]
    pub is_customer: bool,

    #[serde(default)]
    pub is_supplier: bool,

    #[serde(default = "default_status")]
    pub contact_status: String,

    #[serde(rename = "UpdatedDateUTC", skip_serializing_if = "Option::is_none")]
    pub updated_date_utc: Option<String>,
}

fn default_status() -> String {
    "ACTIVE".to_string()
}

impl RemoteContact {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.contact_id.trim().is_empty() {
            return Err(ValidationError::MissingField {
                entity: "contact",
                id: "<unknown>".to_string(),
                field: "ContactID",
            });
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingField {
                entity: "contact",
                id: self.contact_id.clone(),
                field: "Name",
            });
        }
        if self.contact_status.eq_ignore_ascii_case("DELETED") {
            return Err(ValidationError::Deleted {
                entity: "contact",
                id: self.contact_id.clone(),
            });
        }
        Ok(())
    }

    pub fn to_local(&self) -> LocalContact {
        LocalContact {
            remote_id: self.contact_id.clone(),
            name: self.name.clone(),
            email: self.email_address.clone(),
            phone: self.phone.clone(),
            tax_number: self.tax_number.clone(),
            is_customer: self.is_customer,
            is_supplier: self.is_supplier,
            updated_at: self.updated_date_utc.clone().unwrap_or_default(),
        }
    }

    /// Build the wire form of a local contact for a write-back
    pub fn from_local(local: &LocalContact) -> Self {
        Self {
            contact_id: local.remote_id.clone(),
            name: local.name.clone(),
            email_address: local.email.clone(),
            phone: local.phone.clone(),
            tax_number: local.tax_number.clone(),
            is_customer: local.is_customer,
            is_supplier: local.is_supplier,
            contact_status: "ACTIVE".to_string(),
            updated_date_utc: Some(local.updated_at.clone()),
        }
    }
}

// ============================================================================
// Invoices
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct RemoteInvoice {
    #[serde(rename = "InvoiceID")]
    pub invoice_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_number: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<DocumentRef>,

    #[serde(default = "default_status")]
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency_code: Option<String>,

    #[serde(default)]
    pub total: f64,

    #[serde(default)]
    pub amount_due: f64,

    #[serde(default)]
    pub amount_paid: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,

    #[serde(rename = "UpdatedDateUTC", skip_serializing_if = "Option::is_none")]
    pub updated_date_utc: Option<String>,
}

impl RemoteInvoice {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.invoice_id.trim().is_empty() {
            return Err(ValidationError::MissingField {
                entity: "invoice",
                id: "<unknown>".to_string(),
                field: "InvoiceID",
            });
        }
        if self.contact.is_none() {
            return Err(ValidationError::MissingField {
                entity: "invoice",
                id: self.invoice_id.clone(),
                field: "Contact",
            });
        }
        if self.status.eq_ignore_ascii_case("DELETED") {
            return Err(ValidationError::Deleted {
                entity: "invoice",
                id: self.invoice_id.clone(),
            });
        }
        Ok(())
    }

    pub fn to_local(&self) -> LocalInvoice {
        LocalInvoice {
            remote_id: self.invoice_id.clone(),
            invoice_number: self.invoice_number.clone(),
            contact_remote_id: self.contact.as_ref().map(|c| c.id.clone()),
            status: self.status.clone(),
            currency: self.currency_code.clone(),
            total: self.total,
            amount_due: self.amount_due,
            amount_paid: self.amount_paid,
            issued_on: self.date.clone(),
            due_on: self.due_date.clone(),
            updated_at: self.updated_date_utc.clone().unwrap_or_default(),
        }
    }
}

// ============================================================================
// Payments
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct RemotePayment {
    #[serde(rename = "PaymentID")]
    pub payment_id: String,

    #[serde(default)]
    pub amount: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency_code: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,

    #[serde(default = "default_status")]
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,

    #[serde(rename = "UpdatedDateUTC", skip_serializing_if = "Option::is_none")]
    pub updated_date_utc: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice: Option<DocumentRef>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub credit_note: Option<DocumentRef>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub overpayment: Option<DocumentRef>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub prepayment: Option<DocumentRef>,
}

impl RemotePayment {
    /// The single document this payment settles.
    /// A payment referencing zero or several documents is malformed.
    pub fn target(&self) -> Result<(PaymentTarget, &DocumentRef), ValidationError> {
        let mut found: Vec<(PaymentTarget, &DocumentRef)> = Vec::new();
        if let Some(r) = &self.invoice {
            found.push((PaymentTarget::Invoice, r));
        }
        if let Some(r) = &self.credit_note {
            found.push((PaymentTarget::CreditNote, r));
        }
        if let Some(r) = &self.overpayment {
            found.push((PaymentTarget::Overpayment, r));
        }
        if let Some(r) = &self.prepayment {
            found.push((PaymentTarget::Prepayment, r));
        }

        match found.len() {
            0 => Err(ValidationError::MissingTarget {
                id: self.payment_id.clone(),
            }),
            1 => Ok(found.remove(0)),
            n => Err(ValidationError::AmbiguousTarget {
                id: self.payment_id.clone(),
                count: n,
            }),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.payment_id.trim().is_empty() {
            return Err(ValidationError::MissingField {
                entity: "payment",
                id: "<unknown>".to_string(),
                field: "PaymentID",
            });
        }
        if self.status.eq_ignore_ascii_case("DELETED") {
            return Err(ValidationError::Deleted {
                entity: "payment",
                id: self.payment_id.clone(),
            });
        }
        self.target().map(|_| ())
    }

    pub fn to_local(&self) -> Result<LocalPayment, ValidationError> {
        let (kind, doc) = self.target()?;
        Ok(LocalPayment {
            remote_id: self.payment_id.clone(),
            target_kind: kind.as_str().to_string(),
            target_remote_id: doc.id.clone(),
            amount: self.amount,
            currency: self.currency_code.clone(),
            reference: self.reference.clone(),
            status: self.status.clone(),
            paid_on: self.date.clone(),
            updated_at: self.updated_date_utc.clone().unwrap_or_default(),
        })
    }
}

// ============================================================================
// Page Envelopes
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ContactsPage {
    #[serde(rename = "Contacts", default)]
    pub contacts: Vec<RemoteContact>,
}

#[derive(Debug, Deserialize)]
pub struct InvoicesPage {
    #[serde(rename = "Invoices", default)]
    pub invoices: Vec<RemoteInvoice>,
}

#[derive(Debug, Deserialize)]
pub struct PaymentsPage {
    #[serde(rename = "Payments", default)]
    pub payments: Vec<RemotePayment>,
}

/// Write envelope for contact upserts
#[derive(Debug, Serialize)]
pub struct ContactsWrite {
    #[serde(rename = "Contacts")]
    pub contacts: Vec<RemoteContact>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payment() -> RemotePayment {
        RemotePayment {
            payment_id: "pay-1".to_string(),
            amount: 440.0,
            currency_code: Some("AUD".to_string()),
            reference: Some("EFT 1001".to_string()),
            status: "AUTHORISED".to_string(),
            date: Some("2026-03-02".to_string()),
            updated_date_utc: Some("2026-03-02T01:00:00+00:00".to_string()),
            invoice: Some(DocumentRef {
                id: "inv-1".to_string(),
            }),
            credit_note: None,
            overpayment: None,
            prepayment: None,
        }
    }

    #[test]
    fn test_payment_with_single_target_is_valid() {
        let payment = sample_payment();
        assert!(payment.validate().is_ok());

        let local = payment.to_local().unwrap();
        assert_eq!(local.target_kind, "invoice");
        assert_eq!(local.target_remote_id, "inv-1");
    }

    #[test]
    fn test_payment_without_target_is_invalid() {
        let mut payment = sample_payment();
        payment.invoice = None;

        let err = payment.validate().unwrap_err();
        assert!(matches!(err, ValidationError::MissingTarget { .. }));
    }

    #[test]
    fn test_payment_with_two_targets_is_invalid() {
        let mut payment = sample_payment();
        payment.prepayment = Some(DocumentRef {
            id: "pre-1".to_string(),
        });

        let err = payment.validate().unwrap_err();
        assert!(matches!(err, ValidationError::AmbiguousTarget { count: 2, .. }));
    }

    #[test]
    fn test_deleted_payment_is_invalid() {
        let mut payment = sample_payment();
        payment.status = "DELETED".to_string();

        let err = payment.validate().unwrap_err();
        assert!(matches!(err, ValidationError::Deleted { .. }));
    }

    #[test]
    fn test_contact_requires_name() {
        let contact = RemoteContact {
            contact_id: "c-1".to_string(),
            name: "  ".to_string(),
            email_address: None,
            phone: None,
            tax_number: None,
            is_customer: true,
            is_supplier: false,
            contact_status: "ACTIVE".to_string(),
            updated_date_utc: None,
        };

        let err = contact.validate().unwrap_err();
        assert!(matches!(
            err,
            ValidationError::MissingField { field: "Name", .. }
        ));
    }

    #[test]
    fn test_payment_deserializes_target_aliases() {
        let json = r#"{
            "PaymentID": "pay-9",
            "Amount": 10.0,
            "Status": "AUTHORISED",
            "CreditNote": { "CreditNoteID": "cn-4" }
        }"#;

        let payment: RemotePayment = serde_json::from_str(json).unwrap();
        let (kind, doc) = payment.target().unwrap();
        assert_eq!(kind, PaymentTarget::CreditNote);
        assert_eq!(doc.id, "cn-4");
    }

    #[test]
    fn test_invoice_round_trips_to_local() {
        let json = r#"{
            "InvoiceID": "inv-77",
            "InvoiceNumber": "INV-0077",
            "Contact": { "ID": "c-3" },
            "Status": "AUTHORISED",
            "CurrencyCode": "AUD",
            "Total": 990.0,
            "AmountDue": 490.0,
            "AmountPaid": 500.0,
            "Date": "2026-02-20",
            "DueDate": "2026-03-20",
            "UpdatedDateUTC": "2026-02-21T00:00:00+00:00"
        }"#;

        let invoice: RemoteInvoice = serde_json::from_str(json).unwrap();
        assert!(invoice.validate().is_ok());

        let local = invoice.to_local();
        assert_eq!(local.remote_id, "inv-77");
        assert_eq!(local.contact_remote_id.as_deref(), Some("c-3"));
        assert_eq!(local.amount_due, 490.0);
    }
}
