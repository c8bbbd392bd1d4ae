//! Session correlator: maps run IDs to answer slots and applies inbound frames.
//!
//! Slots are created optimistically on submit, mutated only by frames carrying their
//! run ID and never removed. Only a `stream-end` frame (or an explicit [`expire`])
//! clears `is_loading`; stop and refresh leave completion to the server.
//!
//! [`expire`]: SessionCorrelator::expire

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chatwire_core::{ChatId, ClientType, MsgId, RunId};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::answer::AnswerSlot;
use crate::api::HistoryMessage;
use crate::auth::{current_token, TokenProvider};
use crate::connection::ConnectionManager;
use crate::error::{Result, TransportError};
use crate::notice::{Notice, Notifier};
use crate::protocol::{InboundFrame, OutboundCommand, SendQuery, StopQuery};

const UPDATE_BUFFER: usize = 256;

/// Destination of outbound commands.
///
/// Implemented by [`ConnectionManager`]; tests substitute a recording sink.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Deliver `command` to the server.
    async fn send(&self, command: &OutboundCommand) -> Result<()>;
}

#[async_trait]
impl CommandSink for ConnectionManager {
    async fn send(&self, command: &OutboundCommand) -> Result<()> {
        ConnectionManager::send(self, command).await
    }
}

/// Change notification for UI re-rendering.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotUpdate {
    /// A pending slot was appended.
    Created(AnswerSlot),
    /// A `message` frame was merged.
    Updated(AnswerSlot),
    /// The run finished, by `stream-end` or local expiry.
    Completed(AnswerSlot),
    /// The command for a run could not be sent. The slot stays loading.
    SendFailed {
        /// Affected run.
        run_id: RunId,
        /// Failure description.
        error: String,
    },
    /// A conversation was replaced by a history page.
    Replaced {
        /// Affected chat.
        chat_id: ChatId,
    },
}

/// What [`SessionCorrelator::on_frame`] did with a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Merged into a loading slot.
    Applied(RunId),
    /// Merged and the run completed.
    Completed(RunId),
    /// No slot for the run; dropped.
    UnknownRun(RunId),
    /// The frame names no run; dropped.
    NoRunId,
}

#[derive(Default)]
struct Conversations {
    chats: HashMap<ChatId, Vec<AnswerSlot>>,
    runs: HashMap<RunId, (ChatId, usize)>,
}

impl Conversations {
    fn slot(&self, run_id: &RunId) -> Option<&AnswerSlot> {
        let (chat_id, index) = self.runs.get(run_id)?;
        self.chats.get(chat_id)?.get(*index)
    }

    fn slot_mut(&mut self, run_id: &RunId) -> Option<&mut AnswerSlot> {
        let (chat_id, index) = self.runs.get(run_id)?;
        self.chats.get_mut(chat_id)?.get_mut(*index)
    }

    fn push(&mut self, slot: AnswerSlot) {
        let slots = self.chats.entry(slot.chat_id.clone()).or_default();
        self.runs
            .insert(slot.run_id.clone(), (slot.chat_id.clone(), slots.len()));
        slots.push(slot);
    }

    fn replace(&mut self, chat_id: &ChatId, slots: Vec<AnswerSlot>) {
        self.runs.retain(|_, (owner, _)| owner != chat_id);
        for (index, slot) in slots.iter().enumerate() {
            self.runs
                .insert(slot.run_id.clone(), (chat_id.clone(), index));
        }
        self.chats.insert(chat_id.clone(), slots);
    }
}

struct Inner {
    sink: Arc<dyn CommandSink>,
    tokens: Arc<dyn TokenProvider>,
    notifier: Arc<dyn Notifier>,
    client_type: ClientType,
    conversations: Mutex<Conversations>,
    updates: broadcast::Sender<SlotUpdate>,
}

/// Correlates streamed frames with the questions that caused them.
///
/// Cloning is cheap and shares state.
#[derive(Clone)]
pub struct SessionCorrelator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCorrelator")
            .field("client_type", &self.inner.client_type)
            .finish_non_exhaustive()
    }
}

impl SessionCorrelator {
    /// Create a correlator sending through `sink`.
    #[must_use]
    pub fn new(
        sink: Arc<dyn CommandSink>,
        tokens: Arc<dyn TokenProvider>,
        notifier: Arc<dyn Notifier>,
        client_type: ClientType,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Self {
            inner: Arc::new(Inner {
                sink,
                tokens,
                notifier,
                client_type,
                conversations: Mutex::new(Conversations::default()),
                updates,
            }),
        }
    }

    /// Register as the frame consumer of `connection` and apply frames until the
    /// registration is replaced or the connection manager stops.
    pub fn attach(&self, connection: &ConnectionManager) -> JoinHandle<()> {
        let mut frames = connection.frames();
        let correlator = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                correlator.on_frame(&frame);
            }
            tracing::debug!("Frame consumer detached");
        })
    }

    /// Subscribe to slot changes.
    #[must_use]
    pub fn updates(&self) -> broadcast::Receiver<SlotUpdate> {
        self.inner.updates.subscribe()
    }

    /// Ask a question.
    ///
    /// Appends a loading slot under a fresh run ID and returns immediately; the send
    /// runs in the background. A failed send is reported as
    /// [`SlotUpdate::SendFailed`] and a connection notice, and the slot stays loading
    /// until it is expired.
    pub fn submit(&self, chat_id: ChatId, query: impl Into<String>) -> RunId {
        let query = query.into();
        let run_id = RunId::generate();
        let msg_id = MsgId::generate();

        let slot = AnswerSlot::pending(chat_id.clone(), run_id.clone(), msg_id.clone(), query.clone());
        self.inner.conversations.lock().push(slot.clone());
        self.publish(SlotUpdate::Created(slot));
        tracing::info!(run_id = %run_id, chat_id = %chat_id, "Query submitted");

        let command = OutboundCommand::SendQuery(SendQuery {
            chat_id,
            query,
            run_id: run_id.clone(),
            msg_id,
            client_type: self.inner.client_type,
            access_token: current_token(self.inner.tokens.as_ref()),
        });
        self.spawn_send(command);

        run_id
    }

    /// Apply one inbound frame.
    pub fn on_frame(&self, frame: &InboundFrame) -> FrameOutcome {
        let (Some(run_id), Some(payload)) = (frame.run_id(), frame.payload.as_ref()) else {
            tracing::debug!(id = %frame.id, "Frame without run ID, dropping");
            return FrameOutcome::NoRunId;
        };

        let update = {
            let mut conversations = self.inner.conversations.lock();
            let Some(slot) = conversations.slot_mut(&run_id) else {
                tracing::debug!(run_id = %run_id, "No slot for run, dropping frame");
                return FrameOutcome::UnknownRun(run_id);
            };

            slot.apply(payload);
            if frame.is_stream_end() {
                slot.complete();
                SlotUpdate::Completed(slot.clone())
            } else {
                SlotUpdate::Updated(slot.clone())
            }
        };

        let outcome = if matches!(update, SlotUpdate::Completed(_)) {
            tracing::info!(run_id = %run_id, "Run completed");
            FrameOutcome::Completed(run_id)
        } else {
            tracing::trace!(run_id = %run_id, "Run updated");
            FrameOutcome::Applied(run_id)
        };
        self.publish(update);
        outcome
    }

    /// Ask the server to stop a run. The slot keeps loading until `stream-end`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownRun` if the run has no slot, or the send error.
    pub async fn stop(&self, run_id: &RunId) -> Result<()> {
        let command = OutboundCommand::StopQuery(self.stop_query(run_id, run_id)?);
        tracing::info!(run_id = %run_id, "Stopping run");
        self.inner.sink.send(&command).await
    }

    /// Stop a run and resubmit its question.
    ///
    /// Appends a loading slot for the new attempt and returns its run ID.
    ///
    /// # Errors
    ///
    /// Returns `UnknownRun` if the run has no slot, or the send error. On a send error
    /// the new slot stays loading until it is expired.
    pub async fn refresh(&self, run_id: &RunId) -> Result<RunId> {
        let new_run = RunId::generate();
        let query = self.stop_query(run_id, &new_run)?;

        let slot = {
            let mut conversations = self.inner.conversations.lock();
            let previous = conversations
                .slot(run_id)
                .ok_or_else(|| TransportError::UnknownRun(run_id.clone()))?;
            let slot = AnswerSlot::pending(
                previous.chat_id.clone(),
                new_run.clone(),
                MsgId::generate(),
                previous.query.clone(),
            );
            conversations.push(slot.clone());
            slot
        };
        self.publish(SlotUpdate::Created(slot));
        tracing::info!(run_id = %run_id, new_run_id = %new_run, "Refreshing run");

        match self.inner.sink.send(&OutboundCommand::RefreshQuery(query)).await {
            Ok(()) => Ok(new_run),
            Err(e) => {
                self.report_send_failure(&new_run, &e);
                Err(e)
            }
        }
    }

    /// Locally finish a run that will never see its `stream-end`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownRun` if the run has no slot.
    pub fn expire(&self, run_id: &RunId) -> Result<()> {
        let slot = {
            let mut conversations = self.inner.conversations.lock();
            let slot = conversations
                .slot_mut(run_id)
                .ok_or_else(|| TransportError::UnknownRun(run_id.clone()))?;
            if !slot.is_loading {
                return Ok(());
            }
            slot.complete();
            slot.clone()
        };
        tracing::info!(run_id = %run_id, "Run expired locally");
        self.publish(SlotUpdate::Completed(slot));
        Ok(())
    }

    /// Replace a conversation with a history page.
    pub fn replace_history(&self, chat_id: &ChatId, page: &[HistoryMessage]) {
        let slots: Vec<AnswerSlot> = page
            .iter()
            .flat_map(|message| {
                message.chat_query_answer_list.iter().map(move |record| {
                    let mut slot = AnswerSlot::from_record(chat_id.clone(), message.msg_id(), record);
                    if slot.query.is_empty() {
                        slot.query.clone_from(&message.query);
                    }
                    slot
                })
            })
            .collect();

        tracing::debug!(chat_id = %chat_id, slots = slots.len(), "Conversation replaced from history");
        self.inner.conversations.lock().replace(chat_id, slots);
        self.publish(SlotUpdate::Replaced {
            chat_id: chat_id.clone(),
        });
    }

    /// Slots of a conversation, in insertion order.
    #[must_use]
    pub fn conversation(&self, chat_id: &ChatId) -> Vec<AnswerSlot> {
        self.inner
            .conversations
            .lock()
            .chats
            .get(chat_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of one slot.
    #[must_use]
    pub fn slot(&self, run_id: &RunId) -> Option<AnswerSlot> {
        self.inner.conversations.lock().slot(run_id).cloned()
    }

    /// Runs still waiting for their `stream-end`.
    #[must_use]
    pub fn pending_runs(&self) -> Vec<RunId> {
        let conversations = self.inner.conversations.lock();
        let mut runs: Vec<RunId> = conversations
            .chats
            .values()
            .flatten()
            .filter(|slot| slot.is_loading)
            .map(|slot| slot.run_id.clone())
            .collect();
        runs.sort();
        runs
    }

    fn stop_query(&self, target: &RunId, run_id: &RunId) -> Result<StopQuery> {
        let conversations = self.inner.conversations.lock();
        let slot = conversations
            .slot(target)
            .ok_or_else(|| TransportError::UnknownRun(target.clone()))?;
        Ok(StopQuery {
            run_id: run_id.clone(),
            query_id: slot.query_id.clone(),
            chat_id: Some(slot.chat_id.clone()),
            client_type: self.inner.client_type,
            access_token: current_token(self.inner.tokens.as_ref()),
        })
    }

    fn spawn_send(&self, command: OutboundCommand) {
        let correlator = self.clone();
        tokio::spawn(async move {
            if let Err(e) = correlator.inner.sink.send(&command).await {
                correlator.report_send_failure(command.run_id(), &e);
            }
        });
    }

    fn report_send_failure(&self, run_id: &RunId, error: &TransportError) {
        tracing::error!(run_id = %run_id, error = %error, "Failed to send command");
        self.inner.notifier.notify(Notice::ConnectionError {
            message: error.to_string(),
        });
        self.publish(SlotUpdate::SendFailed {
            run_id: run_id.clone(),
            error: error.to_string(),
        });
    }

    fn publish(&self, update: SlotUpdate) {
        let _ = self.inner.updates.send(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use crate::notice::RecordingNotifier;
    use crate::protocol::decode_frame;
    use crate::testing::{message_frame, stream_end_frame};
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        fail: bool,
        sent: Mutex<Vec<OutboundCommand>>,
    }

    #[async_trait]
    impl CommandSink for RecordingSink {
        async fn send(&self, command: &OutboundCommand) -> Result<()> {
            if self.fail {
                return Err(TransportError::OpenTimeout(Duration::from_millis(50)));
            }
            self.sent.lock().push(command.clone());
            Ok(())
        }
    }

    fn correlator_with(sink: Arc<RecordingSink>, notifier: &RecordingNotifier) -> SessionCorrelator {
        SessionCorrelator::new(
            sink,
            Arc::new(StaticToken::new("tok")),
            Arc::new(notifier.clone()),
            ClientType::WechatMp,
        )
    }

    fn correlator(notifier: &RecordingNotifier) -> SessionCorrelator {
        correlator_with(Arc::new(RecordingSink::default()), notifier)
    }

    fn frame(text: &str) -> InboundFrame {
        decode_frame(text).unwrap()
    }

    fn chat() -> ChatId {
        ChatId::new("chat-1").unwrap()
    }

    #[tokio::test]
    async fn submit_creates_loading_slot() {
        let session = correlator(&RecordingNotifier::new());
        let run_id = session.submit(chat(), "gold?");

        let slots = session.conversation(&chat());
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].run_id, run_id);
        assert!(slots[0].is_loading);
        assert_eq!(session.pending_runs(), vec![run_id]);
    }

    async fn sent(sink: &RecordingSink, count: usize) -> Vec<OutboundCommand> {
        for _ in 0..200 {
            if sink.sent.lock().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        sink.sent.lock().clone()
    }

    #[tokio::test]
    async fn submit_sends_query_with_token() {
        let sink = Arc::new(RecordingSink::default());
        let session = correlator_with(sink.clone(), &RecordingNotifier::new());
        let run_id = session.submit(chat(), "黄金 price?");

        let commands = sent(&sink, 1).await;
        let OutboundCommand::SendQuery(query) = &commands[0] else {
            panic!("expected send-query, got {:?}", commands[0]);
        };
        assert_eq!(query.run_id, run_id);
        assert_eq!(query.chat_id, chat());
        assert_eq!(query.query, "黄金 price?");
        assert_eq!(query.access_token, "tok");
        assert_eq!(query.client_type, ClientType::WechatMp);
    }

    #[tokio::test]
    async fn stop_sends_command_but_keeps_loading() {
        let sink = Arc::new(RecordingSink::default());
        let session = correlator_with(sink.clone(), &RecordingNotifier::new());
        let run_id = session.submit(chat(), "q");
        sent(&sink, 1).await;
        session.on_frame(&frame(&message_frame(&json!({"runId": run_id.as_str(), "queryId": "q-7"}))));

        session.stop(&run_id).await.unwrap();

        let commands = sent(&sink, 2).await;
        let OutboundCommand::StopQuery(stop) = &commands[1] else {
            panic!("expected stop-query, got {:?}", commands[1]);
        };
        assert_eq!(stop.run_id, run_id);
        assert_eq!(stop.query_id.as_ref().map(|q| q.as_str()), Some("q-7"));
        assert_eq!(stop.chat_id, Some(chat()));
        assert!(session.slot(&run_id).unwrap().is_loading);
    }

    #[tokio::test]
    async fn refresh_appends_new_run() {
        let sink = Arc::new(RecordingSink::default());
        let session = correlator_with(sink.clone(), &RecordingNotifier::new());
        let run_id = session.submit(chat(), "again?");
        sent(&sink, 1).await;
        session.on_frame(&frame(&stream_end_frame(&json!({"runId": run_id.as_str(), "queryId": "q-1"}))));

        let new_run = session.refresh(&run_id).await.unwrap();

        assert_ne!(new_run, run_id);
        let slots = session.conversation(&chat());
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[1].run_id, new_run);
        assert_eq!(slots[1].query, "again?");
        assert!(slots[1].is_loading);

        let commands = sent(&sink, 2).await;
        let OutboundCommand::RefreshQuery(refresh) = &commands[1] else {
            panic!("expected refresh-query, got {:?}", commands[1]);
        };
        assert_eq!(refresh.run_id, new_run);
        assert_eq!(refresh.query_id.as_ref().map(|q| q.as_str()), Some("q-1"));
    }

    #[tokio::test]
    async fn interleaved_runs_stay_isolated() {
        let session = correlator(&RecordingNotifier::new());
        let first = session.submit(chat(), "one");
        let second = session.submit(chat(), "two");

        session.on_frame(&frame(&message_frame(&json!({"runId": first.as_str(), "message": "a1"}))));
        session.on_frame(&frame(&message_frame(&json!({"runId": second.as_str(), "message": "b1"}))));
        session.on_frame(&frame(&message_frame(&json!({"runId": first.as_str(), "message": "a2"}))));

        let slots = session.conversation(&chat());
        assert_eq!(slots[0].query, "one");
        assert_eq!(slots[0].message, "a2");
        assert_eq!(slots[1].query, "two");
        assert_eq!(slots[1].message, "b1");
    }

    #[tokio::test]
    async fn only_stream_end_clears_loading() {
        let session = correlator(&RecordingNotifier::new());
        let run_id = session.submit(chat(), "q");

        for _ in 0..3 {
            let outcome = session.on_frame(&frame(&message_frame(&json!({"runId": run_id.as_str()}))));
            assert_eq!(outcome, FrameOutcome::Applied(run_id.clone()));
            assert!(session.slot(&run_id).unwrap().is_loading);
        }

        let outcome = session.on_frame(&frame(&stream_end_frame(&json!({
            "runId": run_id.as_str(), "response": "final"
        }))));
        assert_eq!(outcome, FrameOutcome::Completed(run_id.clone()));
        let slot = session.slot(&run_id).unwrap();
        assert!(!slot.is_loading);
        assert_eq!(slot.response, "final");
    }

    #[tokio::test]
    async fn unknown_and_missing_runs_are_dropped() {
        let session = correlator(&RecordingNotifier::new());
        session.submit(chat(), "q");

        let outcome = session.on_frame(&frame(&message_frame(&json!({"runId": "elsewhere"}))));
        assert_eq!(outcome, FrameOutcome::UnknownRun(RunId::new("elsewhere").unwrap()));

        let outcome = session.on_frame(&frame(&message_frame(&json!({"message": "orphan"}))));
        assert_eq!(outcome, FrameOutcome::NoRunId);
        assert_eq!(session.conversation(&chat())[0].message, "");
    }

    #[tokio::test]
    async fn stock_data_survives_malformed_steps() {
        let session = correlator(&RecordingNotifier::new());
        let run_id = session.submit(chat(), "gold?");
        let stock = json!([{"name": "AU", "metadata": {"symbol": ["AU"]}, "data": [{"close": 1}]}]);
        let data = json!({"analysis_data": stock.to_string()}).to_string();

        session.on_frame(&frame(&message_frame(&json!({
            "runId": run_id.as_str(), "message": "m", "data": data
        }))));
        assert_eq!(session.slot(&run_id).unwrap().stock_data.len(), 1);

        session.on_frame(&frame(&message_frame(&json!({
            "runId": run_id.as_str(), "steps": "{broken"
        }))));

        let slot = session.slot(&run_id).unwrap();
        assert!(slot.steps.is_empty());
        assert_eq!(slot.stock_data.len(), 1);
        assert_eq!(slot.message, "m");
    }

    #[tokio::test]
    async fn failed_send_reports_and_keeps_loading() {
        let notifier = RecordingNotifier::new();
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..RecordingSink::default()
        });
        let session = correlator_with(sink, &notifier);
        let mut updates = session.updates();

        let run_id = session.submit(chat(), "q");

        assert!(matches!(updates.recv().await.unwrap(), SlotUpdate::Created(_)));
        match updates.recv().await.unwrap() {
            SlotUpdate::SendFailed { run_id: failed, .. } => assert_eq!(failed, run_id),
            other => panic!("unexpected update {other:?}"),
        }
        assert!(session.slot(&run_id).unwrap().is_loading);
        assert!(matches!(notifier.notices()[0], Notice::ConnectionError { .. }));

        session.expire(&run_id).unwrap();
        assert!(!session.slot(&run_id).unwrap().is_loading);
        assert!(matches!(updates.recv().await.unwrap(), SlotUpdate::Completed(_)));
    }

    #[tokio::test]
    async fn stop_unknown_run_fails_fast() {
        let session = correlator(&RecordingNotifier::new());
        let err = session.stop(&RunId::new("nope").unwrap()).await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownRun(_)));
        assert!(session.expire(&RunId::new("nope").unwrap()).is_err());
    }

    #[tokio::test]
    async fn replace_history_rebuilds_index() {
        let session = correlator(&RecordingNotifier::new());
        let live = session.submit(chat(), "live");

        let page: Vec<HistoryMessage> = serde_json::from_value(json!([{
            "chatId": "chat-1",
            "query": "old question",
            "msgId": "m-1",
            "chatQueryAnswerList": [{
                "runId": "H1",
                "response": "old answer",
                "steps": "[{\"node\":\"n\",\"message\":\"\",\"thinking\":null}]"
            }]
        }]))
        .unwrap();
        session.replace_history(&chat(), &page);

        let slots = session.conversation(&chat());
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].query, "old question");
        assert!(!slots[0].is_loading);
        assert!(slots[0].steps[0].finished);
        assert!(session.slot(&live).is_none());

        let history_run = RunId::new("H1").unwrap();
        let outcome = session.on_frame(&frame(&message_frame(&json!({"runId": "H1", "message": "late"}))));
        assert_eq!(outcome, FrameOutcome::Applied(history_run.clone()));
        assert_eq!(session.slot(&history_run).unwrap().message, "late");
    }
}
