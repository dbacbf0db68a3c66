//! SQS-backed message queue used to receive document generation requests.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_sqs::Client;
use tokio::sync::OnceCell;
use tracing::{debug, error};

/// A typed message attribute value as delivered by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    String(String),
    Binary(Vec<u8>),
}

/// A message envelope as received, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub message_id: String,
    /// Opaque token required to delete the message.
    pub receipt_handle: String,
    pub body: Option<String>,
    pub attributes: HashMap<String, AttributeValue>,
}

/// Receive/delete operations against a managed queue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Receives up to `max_messages`, hiding them from other consumers for
    /// `visibility_timeout` and long-polling for up to `wait_time`.
    ///
    /// Returns `Ok(None)` when the poll yielded no batch.
    async fn receive(
        &self,
        max_messages: i32,
        visibility_timeout: Duration,
        wait_time: Duration,
    ) -> Result<Option<Vec<ReceivedMessage>>>;

    /// Acknowledges a message using the receipt handle from its receive.
    async fn delete(&self, receipt_handle: &str) -> Result<()>;
}

/// [`MessageQueue`] over an SQS queue looked up by name.
///
/// The queue URL is resolved on first use and cached for the lifetime of the client.
pub struct SqsQueue {
    client: Client,
    queue_name: String,
    queue_url: OnceCell<String>,
}

impl SqsQueue {
    pub fn new(client: Client, queue_name: impl Into<String>) -> Self {
        Self {
            client,
            queue_name: queue_name.into(),
            queue_url: OnceCell::new(),
        }
    }

    async fn queue_url(&self) -> Result<&str> {
        let url = self
            .queue_url
            .get_or_try_init(|| async {
                let output = self
                    .client
                    .get_queue_url()
                    .queue_name(&self.queue_name)
                    .send()
                    .await
                    .with_context(|| format!("Queue {} doesn't exist", self.queue_name))?;
                output
                    .queue_url
                    .with_context(|| format!("No URL returned for queue {}", self.queue_name))
            })
            .await?;
        Ok(url.as_str())
    }
}

#[async_trait]
impl MessageQueue for SqsQueue {
    async fn receive(
        &self,
        max_messages: i32,
        visibility_timeout: Duration,
        wait_time: Duration,
    ) -> Result<Option<Vec<ReceivedMessage>>> {
        let queue_url = self.queue_url().await?;
        let output = self
            .client
            .receive_message()
            .queue_url(queue_url)
            .message_attribute_names("All")
            .max_number_of_messages(max_messages)
            .visibility_timeout(duration_secs(visibility_timeout))
            .wait_time_seconds(duration_secs(wait_time))
            .send()
            .await
            .context("Failed to receive messages from queue")?;

        let Some(messages) = output.messages.filter(|m| !m.is_empty()) else {
            return Ok(None);
        };

        let batch = messages
            .into_iter()
            .filter_map(|message| {
                let (Some(message_id), Some(receipt_handle)) =
                    (message.message_id, message.receipt_handle)
                else {
                    error!("Message missing id or receipt handle, skipping");
                    return None;
                };
                let attributes = message
                    .message_attributes
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|(name, value)| {
                        if let Some(text) = value.string_value {
                            Some((name, AttributeValue::String(text)))
                        } else if let Some(blob) = value.binary_value {
                            Some((name, AttributeValue::Binary(blob.into_inner())))
                        } else {
                            debug!(attribute = %name, "Ignoring attribute without value");
                            None
                        }
                    })
                    .collect();
                Some(ReceivedMessage {
                    message_id,
                    receipt_handle,
                    body: message.body,
                    attributes,
                })
            })
            .collect::<Vec<_>>();

        debug!(batch_size = batch.len(), "Received message batch");
        Ok(Some(batch))
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        let queue_url = self.queue_url().await?;
        self.client
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .context("Failed to delete message from queue")?;
        Ok(())
    }
}

fn duration_secs(duration: Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}
