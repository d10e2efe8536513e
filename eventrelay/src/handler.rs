use async_trait::async_trait;

use eventrelay_lib::kafka::KafkaSender;
use eventrelay_lib::stream::{Message, MessageHandler, PartitionContext};
use eventrelay_lib::util::HandlerError;

/// Prints every message and optionally produces its text to another topic, keeping the original key.
#[derive(Default)]
pub struct ConsoleRelay {
    forward: Option<(KafkaSender, String)>,
}

impl ConsoleRelay {
    pub fn forwarding(sender: KafkaSender, topic: impl Into<String>) -> Self {
        ConsoleRelay {
            forward: Some((sender, topic.into())),
        }
    }
}

#[async_trait]
impl MessageHandler for ConsoleRelay {
    async fn handle(&self, context: &PartitionContext, message: &Message, text: &str) -> Result<(), HandlerError> {
        println!("Read '{}' from: {}@{}", text, context, message.offset);

        if let Some((sender, topic)) = &self.forward {
            sender
                .send_raw(topic, message.key.as_deref(), text.as_bytes())
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn printing_never_fails() {
        let relay = ConsoleRelay::default();
        let context = PartitionContext::new("baseball-events", "eventrelay", "0", Uuid::nil());
        let message = Message::new("0", 42, "HR");

        assert!(relay.handle(&context, &message, "HR").await.is_ok());
    }
}
