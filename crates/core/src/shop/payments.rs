use chrono::Utc;
use tracing::info;

use super::{
    add_to_balance, discount_key, ensure_not_blocked, ensure_positive, fresh_id,
    purchase::{consume_discount, usable_discount},
    user_mut, Shop,
};
use crate::{
    document::{DiscountLink, PaymentRequest, Status, Transaction, TransactionKind, UserId},
    error::ShopError,
};

/// Identifiers and amounts of a submitted top-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentTicket {
    /// Key of the payment request.
    pub request_id: String,
    /// Key of the pending deposit in the ledger.
    pub transaction_id: String,
    /// Amount the user has to transfer.
    pub amount_due: i64,
    /// Amount credited once an admin approves the receipt.
    pub credit: i64,
}

impl Shop {
    /// File a top-up receipt for review. `amount` is the balance the user
    /// asks for; a discount code lowers what they have to transfer.
    pub fn submit_payment(
        &self,
        user: UserId,
        amount: i64,
        photo_id: &str,
        code: Option<&str>,
    ) -> Result<PaymentTicket, ShopError> {
        ensure_positive(amount)?;
        let code = code.map(discount_key);
        self.store.update(|document| {
            let now = Utc::now();
            ensure_not_blocked(document, user)?;
            user_mut(document, user)?;

            let discount = match code.as_deref() {
                Some(code) => Some(DiscountLink {
                    code: code.to_string(),
                    discount_amount: usable_discount(document, code, now)?.discount_for(amount),
                    original_amount: amount,
                }),
                None => None,
            };
            let amount_due = amount - discount.as_ref().map_or(0, |d| d.discount_amount);
            consume_discount(document, code.as_deref());

            let mut rng = rand::thread_rng();
            let request_id = fresh_id(&document.payment_requests, &mut rng);
            let transaction_id = fresh_id(&document.transactions, &mut rng);
            document.payment_requests.insert(
                request_id.clone(),
                PaymentRequest {
                    user_id: user,
                    amount: amount_due,
                    original_amount: amount,
                    photo_id: photo_id.to_string(),
                    status: Status::Pending,
                    discount: discount.clone(),
                    transaction_id: transaction_id.clone(),
                    timestamp: now,
                },
            );
            document.transactions.insert(
                transaction_id.clone(),
                Transaction {
                    user_id: user,
                    amount: amount_due,
                    kind: TransactionKind::Deposit,
                    item: None,
                    location: None,
                    status: Status::Pending,
                    discount,
                    request_id: Some(request_id.clone()),
                    timestamp: now,
                },
            );
            info!(user, amount, amount_due, request = %request_id, "payment submitted");
            Ok(PaymentTicket {
                request_id,
                transaction_id,
                amount_due,
                credit: amount,
            })
        })
    }

    /// Approve a pending receipt and credit the user. Returns the new balance.
    pub fn approve_payment(&self, request_id: &str) -> Result<i64, ShopError> {
        self.store.update(|document| {
            let request = pending_request(document, request_id)?;
            let (user, credit, transaction_id) = (
                request.user_id,
                request.original_amount,
                request.transaction_id.clone(),
            );

            let balance = add_to_balance(&mut user_mut(document, user)?.balance, credit)?;
            mark(document, request_id, &transaction_id, Status::Approved);
            info!(user, credit, balance, request = request_id, "payment approved");
            Ok(balance)
        })
    }

    /// Reject a pending receipt.
    pub fn reject_payment(&self, request_id: &str) -> Result<(), ShopError> {
        self.store.update(|document| {
            let transaction_id = pending_request(document, request_id)?
                .transaction_id
                .clone();
            mark(document, request_id, &transaction_id, Status::Rejected);
            info!(request = request_id, "payment rejected");
            Ok(())
        })
    }

    /// Pending receipts, oldest first.
    pub fn pending_payments(&self) -> Vec<(String, PaymentRequest)> {
        let mut pending: Vec<_> = self
            .store
            .read(false)
            .payment_requests
            .into_iter()
            .filter(|(_, request)| request.status == Status::Pending)
            .collect();
        pending.sort_by_key(|(_, request)| request.timestamp);
        pending
    }
}

fn pending_request<'a>(
    document: &'a crate::document::Document,
    request_id: &str,
) -> Result<&'a PaymentRequest, ShopError> {
    let request = document
        .payment_requests
        .get(request_id)
        .ok_or_else(|| ShopError::UnknownPayment(request_id.to_string()))?;
    if request.status != Status::Pending {
        return Err(ShopError::AlreadyDecided {
            id: request_id.to_string(),
            status: request.status,
        });
    }
    Ok(request)
}

fn mark(
    document: &mut crate::document::Document,
    request_id: &str,
    transaction_id: &str,
    status: Status,
) {
    if let Some(request) = document.payment_requests.get_mut(request_id) {
        request.status = status;
    }
    if let Some(transaction) = document.transactions.get_mut(transaction_id) {
        transaction.status = status;
    }
}
