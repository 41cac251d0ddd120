//! One chat conversation: the published message list, the loading flag, the
//! last error and the cancellation handle of the active turn.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use snafu::ResultExt;
use tokio::sync::{oneshot, watch};

use crate::accumulator::ResponseAccumulator;
use crate::error::{ChatError, ChatResult, SchemaSnafu, TurnInProgressSnafu};
use crate::events::StreamEvent;
use crate::message::{Arguments, FollowUp, InputRequest, Message};
use crate::reconcile::{reconcile, truncate_and_replace, visible_follow_ups};
use crate::transport::{ChatRequest, ChatTransport};
use crate::turn::{TurnId, TurnState, TurnTransition, TurnTransitionRejection};
use crate::validate::check;

/// Everything a view needs to draw the conversation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatSnapshot {
    /// History followed by the response of the current or last turn.
    pub messages: Vec<Message>,
    /// True from the start of a turn until it completes, fails or is stopped.
    pub is_loading: bool,
    /// Error text of the last failed turn. Cleared when a new turn starts.
    pub error: Option<String>,
    pub turn: TurnState,
}

impl ChatSnapshot {
    /// Suggestions of the last message, hidden while a turn is loading.
    pub fn follow_ups(&self) -> &[FollowUp] {
        visible_follow_ups(&self.messages, self.is_loading)
    }
}

/// Request flags sent with every turn of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Request an event stream instead of a single JSON body.
    pub stream: bool,
    /// Lets the assistant run functions without asking for confirmation.
    pub autorun: Option<bool>,
    /// Names the function the assistant must pick.
    pub force_select_function: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            stream: true,
            autorun: None,
            force_select_function: None,
        }
    }
}

/// How a turn that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The stream closed, or the whole response arrived.
    Completed,
    /// [`ChatSession::stop`] ended the turn. Partial output stays published.
    Cancelled,
}

struct ActiveCancel {
    turn: TurnId,
    tx: oneshot::Sender<()>,
}

struct SessionInner {
    transport: Arc<dyn ChatTransport>,
    options: SessionOptions,
    state: watch::Sender<ChatSnapshot>,
    cancel: Mutex<Option<ActiveCancel>>,
    next_turn: AtomicU64,
}

/// Cheap to clone; clones share the conversation.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<SessionInner>,
}

impl ChatSession {
    /// Session with default options, starting from `initial_messages`.
    pub fn new(transport: impl ChatTransport + 'static, initial_messages: Vec<Message>) -> Self {
        Self::with_options(transport, initial_messages, SessionOptions::default())
    }

    /// Session with explicit request options.
    pub fn with_options(
        transport: impl ChatTransport + 'static,
        initial_messages: Vec<Message>,
        options: SessionOptions,
    ) -> Self {
        let (state, _) = watch::channel(ChatSnapshot {
            messages: initial_messages,
            ..ChatSnapshot::default()
        });
        Self {
            inner: Arc::new(SessionInner {
                transport: Arc::new(transport),
                options,
                state,
                cancel: Mutex::new(None),
                next_turn: AtomicU64::new(1),
            }),
        }
    }

    /// Options given at construction.
    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    /// Receives every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.inner.state.subscribe()
    }

    /// Copy of the latest published snapshot.
    pub fn snapshot(&self) -> ChatSnapshot {
        self.inner.state.borrow().clone()
    }

    /// Currently published messages.
    pub fn messages(&self) -> Vec<Message> {
        self.inner.state.borrow().messages.clone()
    }

    /// Whether a turn is in flight.
    pub fn is_loading(&self) -> bool {
        self.inner.state.borrow().is_loading
    }

    /// Error text of the last failed turn, if any.
    pub fn error(&self) -> Option<String> {
        self.inner.state.borrow().error.clone()
    }

    /// Runs one turn: publishes `message` (if any) right away, sends the
    /// history and publishes the response as it arrives.
    ///
    /// Rejected with [`ChatError::TurnInProgress`] while another turn is
    /// streaming. On failure the partial response stays published and the
    /// error text is recorded on the snapshot.
    pub async fn append(&self, message: Option<Message>) -> ChatResult<TurnOutcome> {
        if let Some(message) = &message {
            check(message).context(SchemaSnafu {
                stage: "validate-appended-message",
            })?;
        }

        let turn = TurnId::new(self.inner.next_turn.fetch_add(1, Ordering::Relaxed));
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let prefix = self.begin_turn(turn, message, cancel_tx)?;
        tracing::debug!(turn = turn.0, prefix_len = prefix.len(), "turn started");

        let result = self.run_turn(turn, &prefix, cancel_rx).await;
        self.finish_turn(turn, result)
    }

    /// Aborts the active turn. Returns `false` when nothing was streaming.
    ///
    /// The cancellation handle is armed in the same step that publishes
    /// `is_loading = true` and disarmed in the step that clears it, so a
    /// snapshot that shows a loading turn can always be stopped.
    pub fn stop(&self) -> bool {
        match self.cancel_slot().take() {
            Some(active) => {
                tracing::debug!(turn = active.turn.0, "stop requested");
                let _ = active.tx.send(());
                true
            }
            None => false,
        }
    }

    /// Replaces the history and asks the backend to continue from it.
    pub async fn set_messages(&self, messages: Vec<Message>) -> ChatResult<TurnOutcome> {
        self.replace_history(messages, "set-messages")?;
        self.append(None).await
    }

    /// Drops every message from `index` on, puts `updated` in its place and
    /// reloads.
    pub async fn edit(&self, index: usize, updated: Message) -> ChatResult<TurnOutcome> {
        check(&updated).context(SchemaSnafu {
            stage: "validate-edited-message",
        })?;
        let history = truncate_and_replace(&self.messages(), index, updated);
        self.set_messages(history).await
    }

    /// Answers an input request with the filled form values.
    pub async fn submit_input(
        &self,
        request: &InputRequest,
        values: Arguments,
    ) -> ChatResult<TurnOutcome> {
        self.append(Some(Message::input_response(&request.name, values)))
            .await
    }

    /// Empties the conversation. Rejected while a turn is streaming.
    pub fn clear_messages(&self) -> ChatResult<()> {
        let mut outcome = Ok(());
        self.inner
            .state
            .send_if_modified(|snapshot| match snapshot.turn.apply(TurnTransition::ResetToIdle) {
                Ok(next) => {
                    snapshot.turn = next;
                    snapshot.messages.clear();
                    snapshot.error = None;
                    true
                }
                Err(rejection) => {
                    outcome = Err(rejection_error("clear-messages", rejection));
                    false
                }
            });
        outcome
    }

    fn cancel_slot(&self) -> MutexGuard<'_, Option<ActiveCancel>> {
        self.inner
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn replace_history(&self, messages: Vec<Message>, stage: &'static str) -> ChatResult<()> {
        let mut outcome = Ok(());
        self.inner.state.send_if_modified(|snapshot| {
            if let Some(active) = snapshot.turn.active_turn() {
                outcome = TurnInProgressSnafu { stage, active }.fail();
                return false;
            }
            snapshot.messages = messages;
            true
        });
        outcome
    }

    /// Marks the turn as streaming, arms its cancellation handle and publishes
    /// the optimistic history in one step, so two callers cannot both start.
    fn begin_turn(
        &self,
        turn: TurnId,
        message: Option<Message>,
        cancel: oneshot::Sender<()>,
    ) -> ChatResult<Vec<Message>> {
        let mut outcome = Ok(Vec::new());
        self.inner.state.send_if_modified(|snapshot| {
            match snapshot.turn.apply(TurnTransition::Start(turn)) {
                Ok(next) => {
                    *self.cancel_slot() = Some(ActiveCancel { turn, tx: cancel });
                    if let Some(message) = message {
                        snapshot.messages.push(message);
                    }
                    snapshot.turn = next;
                    snapshot.is_loading = true;
                    snapshot.error = None;
                    outcome = Ok(snapshot.messages.clone());
                    true
                }
                Err(rejection) => {
                    outcome = Err(rejection_error("begin-turn", rejection));
                    false
                }
            }
        });
        outcome
    }

    fn request(&self, messages: Vec<Message>) -> ChatRequest {
        let options = &self.inner.options;
        ChatRequest {
            messages,
            stream: options.stream,
            autorun: options.autorun,
            force_select_function: options.force_select_function.clone(),
        }
    }

    fn publish(&self, prefix: &[Message], streamed: Vec<Message>) {
        let messages = reconcile(prefix, streamed);
        self.inner
            .state
            .send_modify(|snapshot| snapshot.messages = messages);
    }

    async fn run_turn(
        &self,
        turn: TurnId,
        prefix: &[Message],
        mut cancel_rx: oneshot::Receiver<()>,
    ) -> ChatResult<TurnOutcome> {
        let request = self.request(prefix.to_vec());
        let transport = &self.inner.transport;

        if !request.stream {
            let messages = tokio::select! {
                biased;
                _ = &mut cancel_rx => return Ok(TurnOutcome::Cancelled),
                completed = transport.complete(&request) => completed?,
            };
            tracing::debug!(turn = turn.0, received = messages.len(), "completion received");
            self.publish(prefix, messages);
            return Ok(TurnOutcome::Completed);
        }

        let mut events = tokio::select! {
            biased;
            _ = &mut cancel_rx => return Ok(TurnOutcome::Cancelled),
            opened = transport.open_stream(&request) => opened?,
        };

        let mut accumulator = ResponseAccumulator::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = &mut cancel_rx => return Ok(TurnOutcome::Cancelled),
                next = events.next() => next,
            };

            let Some(event) = next else {
                return Ok(TurnOutcome::Completed);
            };
            let event = event?;
            tracing::trace!(turn = turn.0, kind = event.kind(), "stream event");

            match event {
                StreamEvent::Open { status } => {
                    tracing::debug!(turn = turn.0, status, "response stream open");
                }
                StreamEvent::Ping => {}
                StreamEvent::Patch(ops) => {
                    accumulator.apply(&ops)?;
                    let streamed = accumulator.messages()?;
                    self.publish(prefix, streamed);
                }
                StreamEvent::Error(payload) => return Err(payload.into()),
                StreamEvent::Close => {
                    tracing::debug!(
                        turn = turn.0,
                        patches = accumulator.patches_applied(),
                        "response stream closed"
                    );
                    return Ok(TurnOutcome::Completed);
                }
            }
        }
    }

    fn finish_turn(
        &self,
        turn: TurnId,
        result: ChatResult<TurnOutcome>,
    ) -> ChatResult<TurnOutcome> {
        let transition = match &result {
            Ok(TurnOutcome::Completed) => TurnTransition::Complete(turn),
            Ok(TurnOutcome::Cancelled) => TurnTransition::Cancel(turn),
            Err(error) => TurnTransition::Fail {
                turn,
                message: error.user_message(),
            },
        };

        self.inner.state.send_modify(|snapshot| {
            {
                let mut slot = self.cancel_slot();
                if slot.as_ref().is_some_and(|active| active.turn == turn) {
                    slot.take();
                }
            }
            match snapshot.turn.apply(transition) {
                Ok(next) => snapshot.turn = next,
                Err(rejection) => {
                    tracing::warn!(turn = turn.0, ?rejection, "turn state out of sync");
                }
            }
            snapshot.is_loading = false;
            if let Err(error) = &result {
                snapshot.error = Some(error.user_message());
            }
        });

        match &result {
            Ok(TurnOutcome::Completed) => tracing::info!(turn = turn.0, "turn completed"),
            Ok(TurnOutcome::Cancelled) => tracing::info!(turn = turn.0, "turn cancelled"),
            Err(error) => tracing::warn!(turn = turn.0, error = %error, "turn failed"),
        }
        result
    }
}

fn rejection_error(stage: &'static str, rejection: TurnTransitionRejection) -> ChatError {
    match rejection {
        TurnTransitionRejection::AlreadyStreaming { active, .. }
        | TurnTransitionRejection::StillStreaming(active) => {
            ChatError::TurnInProgress { stage, active }
        }
        rejection => ChatError::TurnRejected { stage, rejection },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use futures::stream;
    use serde_json::json;

    use super::*;
    use crate::events::ApiErrorPayload;
    use crate::message::{Dataframe, FunctionMessage, Output, Stage};
    use crate::patch::PatchOp;
    use crate::transport::{BoxFuture, EventStream};
    use crate::validate::validate;

    /// Replays canned event lists, one per request, and records the requests.
    #[derive(Default)]
    struct ScriptedTransport {
        scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
        requests: Mutex<Vec<ChatRequest>>,
        /// Leaves every stream open once its script runs out.
        hold_open: bool,
    }

    impl ScriptedTransport {
        fn with(scripts: Vec<Vec<StreamEvent>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                ..Self::default()
            })
        }

        fn held_open(scripts: Vec<Vec<StreamEvent>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                hold_open: true,
                ..Self::default()
            })
        }

        fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl ChatTransport for ScriptedTransport {
        fn open_stream<'a>(
            &'a self,
            request: &'a ChatRequest,
        ) -> BoxFuture<'a, ChatResult<EventStream>> {
            self.requests.lock().unwrap().push(request.clone());
            let events = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
            let hold_open = self.hold_open;
            Box::pin(async move {
                let events = stream::iter(events.into_iter().map(Ok::<_, ChatError>));
                let events: EventStream = if hold_open {
                    Box::pin(events.chain(stream::pending()))
                } else {
                    Box::pin(events)
                };
                Ok(events)
            })
        }

        fn complete<'a>(
            &'a self,
            request: &'a ChatRequest,
        ) -> BoxFuture<'a, ChatResult<Vec<Message>>> {
            self.requests.lock().unwrap().push(request.clone());
            Box::pin(async { Ok(vec![Message::assistant_text("whole")]) })
        }
    }

    fn patch(raw: serde_json::Value) -> StreamEvent {
        StreamEvent::Patch(serde_json::from_value::<Vec<PatchOp>>(raw).unwrap())
    }

    #[tokio::test]
    async fn streamed_patches_are_published_after_the_prefix() {
        let transport = ScriptedTransport::with(vec![vec![
            StreamEvent::Open { status: 200 },
            patch(json!([{"op": "add", "path": "/messages/0", "value": {"role": "assistant", "content": ""}}])),
            StreamEvent::Ping,
            patch(json!([{"op": "replace", "path": "/messages/0/content", "value": "Hello"}])),
            StreamEvent::Close,
        ]]);
        let session = ChatSession::new(transport.clone(), vec![]);

        let outcome = session.append(Some(Message::user_text("hi"))).await.unwrap();

        assert_eq!(outcome, TurnOutcome::Completed);
        let snapshot = session.snapshot();
        assert_eq!(
            snapshot.messages,
            vec![Message::user_text("hi"), Message::assistant_text("Hello")]
        );
        assert!(!snapshot.is_loading);
        assert_eq!(snapshot.error, None);
        assert_eq!(snapshot.turn, TurnState::Done(TurnId(1)));
        assert_eq!(transport.requests()[0].messages, vec![Message::user_text("hi")]);
    }

    #[tokio::test]
    async fn every_publish_keeps_the_whole_prefix_in_front() {
        let history = vec![
            Message::user_text("q1"),
            Message::assistant_text("a1"),
            Message::user_text("q2"),
        ];
        let call = validate(&json!({
            "role": "assistant",
            "function_call": {"name": "sales", "arguments": {"region": "emea"}}
        }))
        .unwrap();
        let result = validate(&json!({
            "role": "function",
            "name": "sales",
            "stage": "confirmed",
            "outputs": [{"type": "text", "text": "42 units"}]
        }))
        .unwrap();
        let transport = ScriptedTransport::with(vec![vec![
            patch(json!([{"op": "add", "path": "/messages/-", "value": serde_json::to_value(&call).unwrap()}])),
            patch(json!([{"op": "add", "path": "/messages/-", "value": {"role": "function", "stage": "unconfirmed", "name": "sales"}}])),
            patch(json!([
                {"op": "replace", "path": "/messages/1/stage", "value": "confirmed"},
                {"op": "add", "path": "/messages/1/outputs", "value": [{"type": "text", "text": "42 units"}]}
            ])),
            StreamEvent::Close,
        ]]);
        let session = ChatSession::new(transport.clone(), history.clone());
        let mut prefix = history;
        prefix.push(Message::user_text("q3"));

        let mut updates = session.subscribe();
        let turn = tokio::spawn({
            let session = session.clone();
            async move { session.append(Some(Message::user_text("q3"))).await }
        });
        updates
            .wait_for(|snapshot| {
                if snapshot.is_loading {
                    assert_eq!(snapshot.messages[..prefix.len()], prefix[..]);
                }
                matches!(snapshot.turn, TurnState::Done(_))
            })
            .await
            .unwrap();
        assert_eq!(turn.await.unwrap().unwrap(), TurnOutcome::Completed);

        let messages = session.messages();
        assert_eq!(messages[..4], prefix[..]);
        assert_eq!(messages[4..], [call, result]);
        assert_eq!(transport.requests()[0].messages, prefix);
    }

    #[tokio::test]
    async fn stop_after_a_patch_keeps_the_partial_reply() {
        let transport = ScriptedTransport::held_open(vec![vec![
            StreamEvent::Open { status: 200 },
            patch(json!([{"op": "add", "path": "/messages/0", "value": {"role": "assistant", "content": "Hal"}}])),
        ]]);
        let session = ChatSession::new(transport, vec![]);

        let mut updates = session.subscribe();
        let turn = tokio::spawn({
            let session = session.clone();
            async move { session.append(Some(Message::user_text("q"))).await }
        });
        updates
            .wait_for(|snapshot| snapshot.messages.len() == 2)
            .await
            .unwrap();

        assert!(session.stop());
        assert_eq!(turn.await.unwrap().unwrap(), TurnOutcome::Cancelled);
        let snapshot = session.snapshot();
        assert_eq!(
            snapshot.messages,
            vec![Message::user_text("q"), Message::assistant_text("Hal")]
        );
        assert_eq!(snapshot.error, None);
        assert!(!snapshot.is_loading);
        assert_eq!(snapshot.turn, TurnState::Cancelled(TurnId(1)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn a_published_loading_turn_can_always_be_stopped() {
        let session = ChatSession::new(ScriptedTransport::held_open(vec![]), vec![]);

        for round in 0..200 {
            let mut updates = session.subscribe();
            let turn = tokio::spawn({
                let session = session.clone();
                async move { session.append(Some(Message::user_text("q"))).await }
            });
            updates
                .wait_for(|snapshot| snapshot.is_loading)
                .await
                .unwrap();

            assert!(session.stop(), "turn of round {round} ignored stop");
            assert_eq!(turn.await.unwrap().unwrap(), TurnOutcome::Cancelled);
        }
        assert!(!session.is_loading());
        assert!(!session.stop());
    }

    #[tokio::test]
    async fn api_error_halts_the_turn_and_keeps_partial_output() {
        let transport = ScriptedTransport::with(vec![vec![
            patch(json!([{"op": "add", "path": "/messages/0", "value": {"role": "assistant", "content": "par"}}])),
            StreamEvent::Error(ApiErrorPayload {
                code: None,
                detail: Some("backend down".to_string()),
            }),
            patch(json!([{"op": "replace", "path": "/messages/0/content", "value": "never"}])),
        ]]);
        let session = ChatSession::new(transport, vec![]);

        let error = session.append(Some(Message::user_text("q"))).await.unwrap_err();

        assert!(matches!(error, ChatError::Api { .. }));
        let snapshot = session.snapshot();
        assert_eq!(snapshot.error.as_deref(), Some("backend down"));
        assert_eq!(snapshot.messages[1], Message::assistant_text("par"));
        assert!(!snapshot.is_loading);
    }

    #[tokio::test]
    async fn non_streaming_turns_publish_the_whole_response() {
        let transport = ScriptedTransport::with(vec![]);
        let session = ChatSession::with_options(
            transport.clone(),
            vec![],
            SessionOptions {
                stream: false,
                autorun: Some(true),
                force_select_function: None,
            },
        );

        session.append(Some(Message::user_text("q"))).await.unwrap();

        assert_eq!(
            session.messages(),
            vec![Message::user_text("q"), Message::assistant_text("whole")]
        );
        let request = &transport.requests()[0];
        assert!(!request.stream);
        assert_eq!(request.autorun, Some(true));
    }

    #[tokio::test]
    async fn invalid_messages_are_rejected_before_publishing() {
        let session = ChatSession::new(ScriptedTransport::with(vec![]), vec![]);
        let bad = Message::Function(FunctionMessage {
            name: None,
            stage: Stage::Confirmed,
            outputs: vec![Output::Dataframe {
                dataframe: Dataframe {
                    cols: vec!["a".to_string()],
                    rows: vec![vec!["1".to_string(), "2".to_string()]],
                },
                title: None,
            }],
        });

        let error = session.append(Some(bad)).await.unwrap_err();

        assert!(matches!(error, ChatError::Schema { .. }));
        assert!(session.messages().is_empty());
        assert_eq!(session.snapshot().turn, TurnState::Idle);
    }

    #[tokio::test]
    async fn edit_truncates_and_reloads() {
        let transport = ScriptedTransport::with(vec![vec![
            patch(json!([{"op": "add", "path": "/messages/-", "value": {"role": "assistant", "content": "new answer"}}])),
        ]]);
        let session = ChatSession::new(
            transport.clone(),
            vec![
                Message::user_text("old question"),
                Message::assistant_text("old answer"),
            ],
        );

        session
            .edit(0, Message::user_text("new question"))
            .await
            .unwrap();

        assert_eq!(
            session.messages(),
            vec![
                Message::user_text("new question"),
                Message::assistant_text("new answer"),
            ]
        );
        assert_eq!(
            transport.requests()[0].messages,
            vec![Message::user_text("new question")]
        );
    }

    #[tokio::test]
    async fn clear_resets_history_and_error() {
        let transport = ScriptedTransport::with(vec![vec![StreamEvent::Error(ApiErrorPayload {
            code: None,
            detail: None,
        })]]);
        let session = ChatSession::new(transport, vec![]);
        let _ = session.append(Some(Message::user_text("q"))).await;
        assert_eq!(session.error().as_deref(), Some("Unknown error"));

        session.clear_messages().unwrap();

        let snapshot = session.snapshot();
        assert!(snapshot.messages.is_empty());
        assert_eq!(snapshot.error, None);
        assert_eq!(snapshot.turn, TurnState::Idle);
    }

    #[test]
    fn stop_without_active_turn_is_a_no_op() {
        let session = ChatSession::new(ScriptedTransport::with(vec![]), vec![]);
        assert!(!session.stop());
        assert!(!session.is_loading());
    }
}
