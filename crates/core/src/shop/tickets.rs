use chrono::Utc;
use tracing::info;

use super::{ensure_not_blocked, fresh_id, Shop};
use crate::{
    document::{Sender, Ticket, TicketMessage, TicketStatus, UserId},
    error::ShopError,
};

impl Shop {
    /// Open a support ticket with its first message. Returns the ticket id.
    pub fn open_ticket(&self, user: UserId, subject: &str, text: &str) -> Result<String, ShopError> {
        let text = non_empty(text)?;
        self.store.update(|document| {
            ensure_not_blocked(document, user)?;
            if document.user(user).is_none() {
                return Err(ShopError::UnknownUser(user.to_string()));
            }

            let now = Utc::now();
            let id = fresh_id(&document.tickets, &mut rand::thread_rng());
            document.tickets.insert(
                id.clone(),
                Ticket {
                    user_id: user,
                    subject: subject.trim().to_string(),
                    status: TicketStatus::Open,
                    created_at: now,
                    messages: vec![TicketMessage {
                        sender: Sender::User,
                        text,
                        timestamp: now,
                    }],
                },
            );
            info!(user, ticket = %id, "ticket opened");
            Ok(id)
        })
    }

    /// Append a message. An admin reply marks the ticket answered, a user
    /// reply reopens it.
    pub fn reply_ticket(
        &self,
        id: &str,
        sender: Sender,
        text: &str,
    ) -> Result<TicketStatus, ShopError> {
        let text = non_empty(text)?;
        self.store.update(|document| {
            let ticket = document
                .tickets
                .get_mut(id)
                .ok_or_else(|| ShopError::UnknownTicket(id.to_string()))?;
            if ticket.status == TicketStatus::Closed {
                return Err(ShopError::TicketClosed(id.to_string()));
            }

            ticket.messages.push(TicketMessage {
                sender,
                text,
                timestamp: Utc::now(),
            });
            ticket.status = match sender {
                Sender::Admin => TicketStatus::Answered,
                Sender::User => TicketStatus::Open,
            };
            info!(ticket = id, ?sender, "ticket reply");
            Ok(ticket.status)
        })
    }

    /// Close a ticket; later replies are refused.
    pub fn close_ticket(&self, id: &str) -> Result<(), ShopError> {
        self.store.update(|document| {
            let ticket = document
                .tickets
                .get_mut(id)
                .ok_or_else(|| ShopError::UnknownTicket(id.to_string()))?;
            ticket.status = TicketStatus::Closed;
            info!(ticket = id, "ticket closed");
            Ok(())
        })
    }

    /// Tickets opened by `user`, newest first.
    pub fn tickets_for(&self, user: UserId) -> Vec<(String, Ticket)> {
        sorted(
            self.store
                .read(false)
                .tickets
                .into_iter()
                .filter(|(_, ticket)| ticket.user_id == user),
        )
    }

    /// Tickets waiting on an admin, newest first.
    pub fn open_tickets(&self) -> Vec<(String, Ticket)> {
        sorted(
            self.store
                .read(false)
                .tickets
                .into_iter()
                .filter(|(_, ticket)| ticket.status == TicketStatus::Open),
        )
    }
}

fn non_empty(text: &str) -> Result<String, ShopError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ShopError::EmptyMessage);
    }
    Ok(text.to_string())
}

fn sorted(tickets: impl Iterator<Item = (String, Ticket)>) -> Vec<(String, Ticket)> {
    let mut tickets: Vec<_> = tickets.collect();
    tickets.sort_by(|(_, a), (_, b)| b.created_at.cmp(&a.created_at));
    tickets
}

#[cfg(test)]
mod tests {
    use super::super::testing::shop_with_user;
    use super::*;
    use anyhow::Result;

    #[test]
    fn replies_move_status_back_and_forth() -> Result<()> {
        let (_dir, shop) = shop_with_user(1, 0)?;
        let id = shop.open_ticket(1, "No traffic", "the tunnel is up but nothing loads")?;
        assert_eq!(shop.open_tickets().len(), 1);

        assert_eq!(shop.reply_ticket(&id, Sender::Admin, "restart the client")?, TicketStatus::Answered);
        assert!(shop.open_tickets().is_empty());
        assert_eq!(shop.reply_ticket(&id, Sender::User, "still broken")?, TicketStatus::Open);

        let tickets = shop.tickets_for(1);
        let (_, ticket) = &tickets[0];
        assert_eq!(ticket.messages.len(), 3);
        assert_eq!(ticket.messages[1].sender, Sender::Admin);
        Ok(())
    }

    #[test]
    fn closed_tickets_refuse_replies() -> Result<()> {
        let (_dir, shop) = shop_with_user(1, 0)?;
        let id = shop.open_ticket(1, "Refund", "please")?;
        shop.close_ticket(&id)?;

        assert!(matches!(
            shop.reply_ticket(&id, Sender::User, "hello?"),
            Err(ShopError::TicketClosed(_))
        ));
        assert!(matches!(
            shop.reply_ticket(&id, Sender::Admin, "  "),
            Err(ShopError::EmptyMessage)
        ));
        assert!(matches!(
            shop.close_ticket("NOPE"),
            Err(ShopError::UnknownTicket(_))
        ));
        Ok(())
    }

    #[test]
    fn blocked_and_unknown_users_cannot_open() -> Result<()> {
        let (_dir, shop) = shop_with_user(1, 0)?;
        shop.block_user(1)?;
        assert!(matches!(
            shop.open_ticket(1, "hi", "text"),
            Err(ShopError::Blocked(1))
        ));
        assert!(matches!(
            shop.open_ticket(9, "hi", "text"),
            Err(ShopError::UnknownUser(_))
        ));
        assert!(shop.tickets_for(1).is_empty());
        Ok(())
    }
}
