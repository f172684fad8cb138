//! Completion notifications for operations running outside of the caller's flow.
//!
//! Every in-flight operation has its own [`Topic`], derived from operation kind and
//! target entity. The caller subscribes to the topic *before* dispatching the operation,
//! then awaits a single [`Completion`]. Topics are single-use: the channel is released as soon
//! as the completion is published, or when the [`Subscription`] is dropped.
//!
//! Completions are published with the [`Ticket`] of the subscription they answer, so a late
//! completion of an abandoned subscription never reaches a newer subscriber of the same topic.
//!
//! # Example
//!
//! ```rust
//! # async fn test() {
//! use download_sources::notifier::{Completion, CompletionNotifier, Topic};
//! use tokio::time::Duration;
//!
//! let notifier = CompletionNotifier::new();
//! let topic = Topic::delete_download_source(1);
//!
//! let subscription = notifier.subscribe(topic).unwrap();
//! notifier.publish(subscription.ticket(), Completion::Done);
//!
//! let completion = subscription.wait(Duration::from_secs(1)).await.unwrap();
//! assert_eq!(completion, Completion::Done);
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio::time::{self, Duration};
use tracing::{debug, trace};

use crate::errors::NotifyError;
use crate::SourceId;

/// Kind of operation reporting its completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Removal of a download source by the worker.
    DeleteDownloadSource,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match *self {
                Self::DeleteDownloadSource => "download_sources:delete",
            }
        )
    }
}

/// Name of a completion channel.
///
/// Rendered as `"<operation>:<id>"`, e.g. `"download_sources:delete:42"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Topic {
    operation: Operation,
    id: SourceId,
}

impl Topic {
    pub fn new(operation: Operation, id: SourceId) -> Self {
        Self { operation, id }
    }

    /// Topic of removal of download source `id`.
    pub fn delete_download_source(id: SourceId) -> Self {
        Self::new(Operation::DeleteDownloadSource, id)
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn id(&self) -> SourceId {
        self.id
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.operation, self.id)
    }
}

/// Single message delivered on a topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Operation finished.
    Done,

    /// Operation could not be completed.
    Failed(String),
}

/// Identifies a single subscription to a topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Ticket {
    topic: Topic,
    token: u64,
}

impl Ticket {
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

struct Slot {
    token: u64,
    sender: oneshot::Sender<Completion>,
}

#[derive(Default)]
struct Inner {
    slots: Mutex<HashMap<Topic, Slot>>,
    next_token: AtomicU64,
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, HashMap<Topic, Slot>> {
        // Slots map stays consistent even if a holder panicked.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registry of completion channels.
///
/// Cheap to clone, all clones share the same channels.
#[derive(Clone, Default)]
pub struct CompletionNotifier {
    inner: Arc<Inner>,
}

impl CompletionNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open channel for `topic`.
    ///
    /// Only one subscriber per topic is allowed at a time.
    pub fn subscribe(&self, topic: Topic) -> Result<Subscription, NotifyError> {
        let mut slots = self.inner.slots();
        if slots.contains_key(&topic) {
            return Err(NotifyError::TopicBusy(topic));
        }
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        slots.insert(topic, Slot { token, sender });
        trace!("subscribed to '{}'", topic);
        Ok(Subscription {
            topic,
            token,
            receiver,
            notifier: self.clone(),
        })
    }

    /// Deliver `completion` to the subscription identified by `ticket` and release the channel.
    ///
    /// Returns `false` if the subscription is gone, e.g. it timed out or was dropped.
    pub fn publish(&self, ticket: Ticket, completion: Completion) -> bool {
        let topic = ticket.topic;
        let slot = {
            let mut slots = self.inner.slots();
            match slots.get(&topic) {
                Some(slot) if slot.token == ticket.token => slots.remove(&topic),
                _ => None,
            }
        };
        match slot {
            Some(slot) => {
                trace!("publishing {:?} to '{}'", completion, topic);
                slot.sender.send(completion).is_ok()
            }
            None => {
                debug!("no subscriber on '{}', dropping {:?}", topic, completion);
                false
            }
        }
    }

    /// Number of open channels.
    pub fn open_channels(&self) -> usize {
        self.inner.slots().len()
    }

    fn release(&self, topic: Topic, token: u64) {
        let mut slots = self.inner.slots();
        if slots.get(&topic).is_some_and(|slot| slot.token == token) {
            trace!("releasing '{}'", topic);
            slots.remove(&topic);
        }
    }
}

impl fmt::Debug for CompletionNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionNotifier")
            .field("open_channels", &self.open_channels())
            .finish()
    }
}

/// Subscription to a single completion.
///
/// Releases its channel on drop.
pub struct Subscription {
    topic: Topic,
    token: u64,
    receiver: oneshot::Receiver<Completion>,
    notifier: CompletionNotifier,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Ticket to publish the completion with.
    pub fn ticket(&self) -> Ticket {
        Ticket {
            topic: self.topic,
            token: self.token,
        }
    }

    /// Wait for the completion at most `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<Completion, NotifyError> {
        match time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(completion)) => Ok(completion),
            Ok(Err(_)) => Err(NotifyError::Closed(self.topic)),
            Err(_) => Err(NotifyError::TimedOut {
                topic: self.topic,
                after: timeout,
            }),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.notifier.release(self.topic, self.token);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_topic_name() {
        assert_eq!(
            Topic::delete_download_source(42).to_string(),
            "download_sources:delete:42"
        );
        assert_ne!(
            Topic::delete_download_source(1),
            Topic::delete_download_source(2)
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_publish_after_subscribe() {
        let notifier = CompletionNotifier::new();
        let topic = Topic::delete_download_source(1);
        let subscription = notifier.subscribe(topic).unwrap();

        assert!(notifier.publish(subscription.ticket(), Completion::Done));
        assert_eq!(notifier.open_channels(), 0);

        let completion = subscription.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(completion, Completion::Done);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_publish_from_other_task() {
        let notifier = CompletionNotifier::new();
        let topic = Topic::delete_download_source(1);
        let subscription = notifier.subscribe(topic).unwrap();

        let publisher = notifier.clone();
        let ticket = subscription.ticket();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            publisher.publish(ticket, Completion::Failed("disk is full".to_string()));
        });

        let completion = subscription.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(completion, Completion::Failed("disk is full".to_string()));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_fires_only_once() {
        let notifier = CompletionNotifier::new();
        let topic = Topic::delete_download_source(1);
        let subscription = notifier.subscribe(topic).unwrap();

        assert!(notifier.publish(subscription.ticket(), Completion::Done));
        assert!(!notifier.publish(subscription.ticket(), Completion::Done));
    }

    #[test]
    #[traced_test]
    fn test_publish_without_subscriber() {
        let notifier = CompletionNotifier::new();
        let ticket = notifier
            .subscribe(Topic::delete_download_source(3))
            .unwrap()
            .ticket();
        assert!(!notifier.publish(ticket, Completion::Done));
        assert!(logs_contain("no subscriber on 'download_sources:delete:3'"));
    }

    #[test]
    fn test_single_subscriber_per_topic() {
        let notifier = CompletionNotifier::new();
        let topic = Topic::delete_download_source(1);
        let _subscription = notifier.subscribe(topic).unwrap();

        assert!(matches!(
            notifier.subscribe(topic),
            Err(NotifyError::TopicBusy(busy)) if busy == topic
        ));
        assert!(notifier.subscribe(Topic::delete_download_source(2)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout() {
        let notifier = CompletionNotifier::new();
        let topic = Topic::delete_download_source(1);
        let subscription = notifier.subscribe(topic).unwrap();

        let result = subscription.wait(Duration::from_secs(30)).await;
        assert!(matches!(
            result,
            Err(NotifyError::TimedOut { after, .. }) if after == Duration::from_secs(30)
        ));
        assert_eq!(notifier.open_channels(), 0);
    }

    #[test]
    fn test_drop_releases_channel() {
        let notifier = CompletionNotifier::new();
        let topic = Topic::delete_download_source(1);
        let subscription = notifier.subscribe(topic).unwrap();
        assert_eq!(notifier.open_channels(), 1);

        drop(subscription);
        assert_eq!(notifier.open_channels(), 0);
        assert!(notifier.subscribe(topic).is_ok());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_late_completion_skips_newer_subscriber() {
        let notifier = CompletionNotifier::new();
        let topic = Topic::delete_download_source(1);

        let abandoned = notifier.subscribe(topic).unwrap();
        let late_ticket = abandoned.ticket();
        drop(abandoned);

        let subscription = notifier.subscribe(topic).unwrap();
        assert!(!notifier.publish(late_ticket, Completion::Failed("late".to_string())));
        assert_eq!(notifier.open_channels(), 1);

        assert!(notifier.publish(subscription.ticket(), Completion::Done));
        let completion = subscription.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(completion, Completion::Done);
    }
}
