//! Concrete feeds. Application code listens on the local event names below
//! and never touches the hub transport directly.

use serde_json::{json, Value};

use super::manager::{ConnectionManager, Feed};
use crate::error::SessionResult;

/// Customer support / order chat.
pub struct ChatFeed;

impl Feed for ChatFeed {
    fn endpoint(&self) -> &'static str {
        "chat"
    }

    fn events(&self) -> &'static [(&'static str, &'static str)] {
        &[
            ("ReceiveMessage", "message"),
            ("MessageRead", "message_read"),
            ("UserTyping", "typing"),
        ]
    }
}

pub type ChatManager = ConnectionManager<ChatFeed>;

impl ConnectionManager<ChatFeed> {
    pub async fn send_message(&self, conversation_id: &str, content: &str) -> SessionResult<Value> {
        self.invoke("SendMessage", vec![json!(conversation_id), json!(content)])
            .await
    }

    pub async fn join_conversation(&self, conversation_id: &str) -> SessionResult<()> {
        self.invoke("JoinConversation", vec![json!(conversation_id)])
            .await?;
        Ok(())
    }

    pub async fn leave_conversation(&self, conversation_id: &str) -> SessionResult<()> {
        self.invoke("LeaveConversation", vec![json!(conversation_id)])
            .await?;
        Ok(())
    }

    pub async fn send_typing(&self, conversation_id: &str) -> SessionResult<()> {
        self.invoke("Typing", vec![json!(conversation_id)]).await?;
        Ok(())
    }
}

/// Order status, promotions and account notices.
pub struct NotificationFeed;

impl Feed for NotificationFeed {
    fn endpoint(&self) -> &'static str {
        "notifications"
    }

    fn events(&self) -> &'static [(&'static str, &'static str)] {
        &[
            ("ReceiveNotification", "notification"),
            ("NotificationRead", "notification_read"),
        ]
    }
}

pub type NotificationManager = ConnectionManager<NotificationFeed>;

impl ConnectionManager<NotificationFeed> {
    pub async fn mark_as_read(&self, notification_id: &str) -> SessionResult<()> {
        self.invoke("MarkAsRead", vec![json!(notification_id)]).await?;
        Ok(())
    }

    pub async fn mark_all_as_read(&self) -> SessionResult<()> {
        self.invoke("MarkAllAsRead", Vec::new()).await?;
        Ok(())
    }
}
