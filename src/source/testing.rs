//! In-memory [`MessageSource`] with scripted media behaviour, shared by the
//! download and engine tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_util::{stream, StreamExt};

use super::{MediaDescriptor, MediaStream, Message, MessageSource, Sender, SourceError};
use crate::types::{MediaKind, MessageId};

/// What one `fetch_media` call does.
#[derive(Debug, Clone)]
pub(crate) enum MediaStep {
    Bytes(Vec<u8>),
    Timeout,
    Stale,
    Reject(u16),
    /// Stream that never yields; only ends through the transfer timeout.
    Hang,
}

#[derive(Default)]
pub(crate) struct ScriptedSource {
    messages: Mutex<BTreeMap<MessageId, Message>>,
    media_steps: Mutex<HashMap<String, VecDeque<MediaStep>>>,
    media_calls: Mutex<Vec<String>>,
    pub(crate) fetch_message_calls: AtomicU32,
    pub(crate) batch_calls: AtomicU32,
    pub(crate) fail_batches: AtomicBool,
}

pub(crate) fn text_message(id: MessageId) -> Message {
    Message {
        id,
        date: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(id),
        sender: Sender {
            id: Some(100),
            name: Some("alice".to_string()),
        },
        text: format!("message {id}"),
        media: None,
        chat_id: Some(-1001),
        views: None,
        forwards: None,
        reply_to_id: None,
    }
}

pub(crate) fn media_message(id: MessageId, kind: MediaKind, file_name: Option<&str>) -> Message {
    let mut msg = text_message(id);
    msg.media = Some(MediaDescriptor {
        kind,
        remote_reference: format!("ref-{id}"),
        file_name: file_name.map(str::to_string),
        mime_type: None,
        format: None,
        byte_size: 0,
    });
    msg
}

impl ScriptedSource {
    pub(crate) fn with_messages(messages: impl IntoIterator<Item = Message>) -> Self {
        let source = Self::default();
        for msg in messages {
            source.put_message(msg);
        }
        source
    }

    pub(crate) fn put_message(&self, msg: Message) {
        self.messages.lock().unwrap().insert(msg.id, msg);
    }

    /// Queue behaviours for a media reference; once drained, fetches
    /// succeed with [`default_bytes`].
    pub(crate) fn script(&self, reference: &str, steps: impl IntoIterator<Item = MediaStep>) {
        self.media_steps
            .lock()
            .unwrap()
            .entry(reference.to_string())
            .or_default()
            .extend(steps);
    }

    pub(crate) fn media_calls(&self) -> Vec<String> {
        self.media_calls.lock().unwrap().clone()
    }

    pub(crate) fn media_calls_for(&self, reference: &str) -> usize {
        self.media_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| *r == reference)
            .count()
    }
}

pub(crate) fn default_bytes(reference: &str) -> Vec<u8> {
    format!("content of {reference}").into_bytes()
}

#[async_trait]
impl MessageSource for ScriptedSource {
    async fn fetch_messages_after(
        &self,
        cursor: MessageId,
        limit: usize,
    ) -> Result<Vec<Message>, SourceError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_batches.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("connection lost".to_string()));
        }
        let messages = self.messages.lock().unwrap();
        Ok(messages
            .range(cursor + 1..)
            .take(limit)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn fetch_message(&self, id: MessageId) -> Result<Option<Message>, SourceError> {
        self.fetch_message_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.messages.lock().unwrap().get(&id).cloned())
    }

    async fn fetch_media(&self, media: &MediaDescriptor) -> Result<MediaStream, SourceError> {
        let reference = media.remote_reference.clone();
        self.media_calls.lock().unwrap().push(reference.clone());
        let step = self
            .media_steps
            .lock()
            .unwrap()
            .get_mut(&reference)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| MediaStep::Bytes(default_bytes(&reference)));
        match step {
            MediaStep::Bytes(bytes) => Ok(stream::iter(vec![Ok(bytes)]).boxed()),
            MediaStep::Timeout => Err(SourceError::Timeout(format!("fetching {reference}"))),
            MediaStep::Stale => Err(SourceError::StaleReference(reference)),
            MediaStep::Reject(status) => Err(SourceError::Rejected {
                status,
                reason: "Forbidden".to_string(),
            }),
            MediaStep::Hang => Ok(stream::pending().boxed()),
        }
    }
}
