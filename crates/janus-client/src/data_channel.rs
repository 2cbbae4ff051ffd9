use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::NegotiationError;
use crate::webrtc::{DataChannel, EngineResult};

struct Slot {
    channel: Arc<dyn DataChannel>,
    open: bool,
    pending: VecDeque<String>,
}

/// A handle's data channels keyed by label, with messages queued until each opens.
#[derive(Default)]
pub(crate) struct DataChannels {
    slots: HashMap<String, Slot>,
}

impl DataChannels {
    pub fn contains(&self, label: &str) -> bool {
        self.slots.contains_key(label)
    }

    pub fn is_open(&self, label: &str) -> bool {
        self.slots.get(label).is_some_and(|slot| slot.open)
    }

    pub fn pending(&self, label: &str) -> usize {
        self.slots.get(label).map_or(0, |slot| slot.pending.len())
    }

    /// Tracks a channel we created; it stays closed until the engine reports it open.
    pub fn insert(&mut self, channel: Arc<dyn DataChannel>) {
        let label = channel.label();
        self.slots.insert(
            label,
            Slot {
                channel,
                open: false,
                pending: VecDeque::new(),
            },
        );
    }

    /// Tracks a channel the remote side created. A local channel with the same
    /// label keeps its queue.
    pub fn adopt(&mut self, channel: Arc<dyn DataChannel>) {
        let label = channel.label();
        match self.slots.get_mut(&label) {
            Some(slot) => slot.channel = channel,
            None => self.insert(channel),
        }
    }

    /// Sends right away on an open channel, queues otherwise.
    pub async fn send(&mut self, label: &str, text: String) -> EngineResult<()> {
        let slot = self.slots.get_mut(label).ok_or_else(|| {
            NegotiationError::InvalidRequest(format!("no data channel labelled {label}"))
        })?;
        if slot.open {
            return slot.channel.send_text(&text).await;
        }
        trace!(label, queued = slot.pending.len() + 1, "data channel not open, queueing");
        slot.pending.push_back(text);
        Ok(())
    }

    /// Marks the channel open and flushes its queue in order. On a send
    /// failure the rest of the queue stays pending and the channel stays closed.
    pub async fn mark_open(&mut self, label: &str) -> EngineResult<usize> {
        let Some(slot) = self.slots.get_mut(label) else {
            debug!(label, "open for an unknown data channel");
            return Ok(0);
        };
        let mut flushed = 0;
        while let Some(text) = slot.pending.pop_front() {
            if let Err(err) = slot.channel.send_text(&text).await {
                slot.pending.push_front(text);
                return Err(err);
            }
            flushed += 1;
        }
        slot.open = true;
        Ok(flushed)
    }

    pub fn mark_closed(&mut self, label: &str) {
        if let Some(slot) = self.slots.get_mut(label) {
            slot.open = false;
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingChannel {
        label: String,
        sent: Mutex<Vec<String>>,
        fail_on: Mutex<Option<String>>,
    }

    impl RecordingChannel {
        fn new(label: &str) -> Arc<Self> {
            Arc::new(Self {
                label: label.to_string(),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl DataChannel for RecordingChannel {
        fn label(&self) -> String {
            self.label.clone()
        }

        async fn send_text(&self, text: &str) -> EngineResult<()> {
            if self.fail_on.lock().as_deref() == Some(text) {
                return Err(NegotiationError::Engine("send failed".into()));
            }
            self.sent.lock().push(text.to_string());
            Ok(())
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn queued_messages_flush_in_order_once() {
        let channel = RecordingChannel::new("chat");
        let mut channels = DataChannels::default();
        channels.insert(channel.clone());

        for text in ["one", "two", "three"] {
            channels.send("chat", text.to_string()).await.unwrap();
        }
        assert!(channel.sent.lock().is_empty());
        assert_eq!(channels.pending("chat"), 3);

        assert_eq!(channels.mark_open("chat").await.unwrap(), 3);
        channels.send("chat", "four".into()).await.unwrap();
        assert_eq!(*channel.sent.lock(), vec!["one", "two", "three", "four"]);
        assert_eq!(channels.pending("chat"), 0);
    }

    #[tokio::test]
    async fn failed_flush_keeps_the_rest_queued() {
        let channel = RecordingChannel::new("chat");
        *channel.fail_on.lock() = Some("two".into());
        let mut channels = DataChannels::default();
        channels.insert(channel.clone());
        for text in ["one", "two", "three"] {
            channels.send("chat", text.to_string()).await.unwrap();
        }

        assert!(channels.mark_open("chat").await.is_err());
        assert!(!channels.is_open("chat"));
        assert_eq!(channels.pending("chat"), 2);

        *channel.fail_on.lock() = None;
        assert_eq!(channels.mark_open("chat").await.unwrap(), 2);
        assert_eq!(*channel.sent.lock(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn unknown_label_is_rejected() {
        let mut channels = DataChannels::default();
        let err = channels.send("missing", "x".into()).await.unwrap_err();
        assert!(matches!(err, NegotiationError::InvalidRequest(_)));
        assert_eq!(channels.mark_open("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn adopting_a_remote_channel_keeps_the_queue() {
        let local = RecordingChannel::new("chat");
        let remote = RecordingChannel::new("chat");
        let mut channels = DataChannels::default();
        channels.insert(local.clone());
        channels.send("chat", "hello".into()).await.unwrap();
        channels.adopt(remote.clone());
        channels.mark_open("chat").await.unwrap();
        assert_eq!(*remote.sent.lock(), vec!["hello"]);
        assert!(local.sent.lock().is_empty());
    }
}
