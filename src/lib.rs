//! bevy_gemini_chat: a thin bevy wrapper over the gemini `generateContent` api.
//!
//! - one request per user message; only the latest message is sent.
//! - replies (and failures) land as turns in a per-session `History` component.
//! - never blocks the main thread: on native each exchange runs on a tiny
//!   tokio runtime; on wasm it is spawned onto the browser event loop.
//! - all history mutation happens on the main thread in `ChatSet::Drain`, so
//!   overlapping submissions append in completion order without races.
//!
//! api reference: https://ai.google.dev/api/generate-content

use bevy::prelude::*;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use flume::{Receiver, Sender, TryRecvError};
use futures_lite::FutureExt as _;

pub mod config;
pub mod history;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, GeminiConfig};
pub use history::{
    handle_user_input, submit, ConversationTurn, ErrorAttribution, History, BOT_MARKER, ERROR_LABEL,
};
pub use transport::{classify, GeminiTransport, ResponseResult, Transport};
pub use wire::{GenerateContentRequest, GenerationConfig, ShapeError};

/// the transport every session talks through.
#[derive(Resource, Clone)]
pub struct ChatTransport(pub Arc<dyn Transport>);

impl ChatTransport {
    pub fn new(transport: impl Transport) -> Self {
        Self(Arc::new(transport))
    }

    pub fn gemini(config: GeminiConfig) -> Self {
        Self::new(GeminiTransport::new(config))
    }
}

/// on native we keep a tiny tokio runtime to drive exchanges.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Resource, Clone)]
pub struct TokioRt(pub Arc<tokio::runtime::Runtime>);

#[cfg(not(target_arch = "wasm32"))]
impl Default for TokioRt {
    fn default() -> Self {
        info!(target: "bevy_gemini_chat", "GeminiChat: initializing Tokio multi-thread runtime (native)");
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("tokio runtime");
        Self(Arc::new(rt))
    }
}

/// system ordering so uis can run after we emit events
#[derive(SystemSet, Debug, Hash, PartialEq, Eq, Clone)]
pub enum ChatSet {
    /// turns are appended and Chat* events emitted here (in `Update`)
    Drain,
}

/// attach this to an entity you want to chat with.
///
/// the entity gets an empty `History` alongside; removing the session (or
/// despawning the entity) cancels whatever it still has in flight.
#[derive(Component, Clone, Debug, Default)]
#[require(History)]
pub struct ChatSession {
    /// what fills the user slot of a failed turn.
    pub error_attribution: ErrorAttribution,
}

/// one user submission for a session entity.
#[derive(Event, Debug, Clone)]
pub struct ChatSubmit {
    pub entity: Entity,
    pub text: String,
}

/// helper to submit user text on a session entity. empty text is sent as-is.
pub fn send_user_text(commands: &mut Commands, target: Entity, text: impl Into<String>) {
    let text = text.into();
    info!(target: "bevy_gemini_chat", "send_user_text -> '{}' (len={})", text, text.len());
    commands.send_event(ChatSubmit { entity: target, text });
}

#[derive(Event, Debug)]
pub struct ChatStarted {
    pub entity: Entity,
    pub request: u64,
}

/// a turn was appended to the session's `History`.
#[derive(Event, Debug, Clone)]
pub struct ChatTurnEvt {
    pub entity: Entity,
    pub request: u64,
    pub turn: ConversationTurn,
}

/// emitted next to `ChatTurnEvt` when the exchange failed.
#[derive(Event, Debug)]
pub struct ChatErrorEvt {
    pub entity: Entity,
    pub error: String,
}

/// cross-thread inbox; exchange tasks send, main thread drains.
#[derive(Resource, Clone)]
struct ChatInbox {
    tx: Sender<ExchangeMsg>,
    rx: Receiver<ExchangeMsg>,
}

impl Default for ChatInbox {
    fn default() -> Self {
        let (tx, rx) = flume::bounded(2048);
        Self { tx, rx }
    }
}

#[derive(Debug)]
enum ExchangeMsg {
    Done {
        entity: Entity,
        request: u64,
        user_text: String,
        result: ResponseResult,
    },
}

/// send to inbox; waits (without blocking the worker) while full, ignores disconnected
async fn push_inbox(tx: &Sender<ExchangeMsg>, msg: ExchangeMsg) {
    let _ = tx.send_async(msg).await;
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

struct Pending {
    request: u64,
    #[cfg(not(target_arch = "wasm32"))]
    abort: tokio::task::AbortHandle,
}

/// exchanges that have been spawned but not drained yet, per session.
#[derive(Resource, Default)]
pub struct InFlight {
    next_request: u64,
    per_entity: HashMap<Entity, Vec<Pending>>,
}

impl InFlight {
    pub fn pending(&self, entity: Entity) -> usize {
        self.per_entity.get(&entity).map_or(0, Vec::len)
    }

    fn next_id(&mut self) -> u64 {
        self.next_request += 1;
        self.next_request
    }

    fn track(&mut self, entity: Entity, pending: Pending) {
        self.per_entity.entry(entity).or_default().push(pending);
    }

    fn finish(&mut self, entity: Entity, request: u64) {
        if let Some(list) = self.per_entity.get_mut(&entity) {
            list.retain(|p| p.request != request);
            if list.is_empty() {
                self.per_entity.remove(&entity);
            }
        }
    }

    /// aborts every pending exchange for `entity`; returns how many there were.
    fn cancel(&mut self, entity: Entity) -> usize {
        let Some(list) = self.per_entity.remove(&entity) else {
            return 0;
        };
        #[cfg(not(target_arch = "wasm32"))]
        for p in &list {
            p.abort.abort();
        }
        list.len()
    }
}

/// bevy plugin: wires systems, events, resources.
///
/// uses an existing `ChatTransport` if one is inserted before the plugin;
/// otherwise builds a `GeminiTransport` from a `GeminiConfig` resource, or
/// from `GeminiConfig::from_env()` when there is none.
/// on native, also inserts a tiny tokio runtime resource by default.
pub struct GeminiChatPlugin;

impl Plugin for GeminiChatPlugin {
    fn build(&self, app: &mut App) {
        info!(target: "bevy_gemini_chat", "GeminiChatPlugin: build()");
        app.init_resource::<ChatInbox>()
            .init_resource::<InFlight>()
            .add_event::<ChatSubmit>()
            .add_event::<ChatStarted>()
            .add_event::<ChatTurnEvt>()
            .add_event::<ChatErrorEvt>()
            .configure_sets(Update, ChatSet::Drain)
            // spawn + cancel first; exchanges continue off-thread
            .add_systems(
                Update,
                (spawn_chat_requests, cancel_ended_sessions).before(ChatSet::Drain),
            )
            .add_systems(Update, drain_chat_inbox.in_set(ChatSet::Drain));

        #[cfg(not(target_arch = "wasm32"))]
        if app.world().get_resource::<TokioRt>().is_none() {
            app.insert_resource(TokioRt::default());
        }

        if app.world().get_resource::<ChatTransport>().is_none() {
            let config = app
                .world()
                .get_resource::<GeminiConfig>()
                .cloned()
                .unwrap_or_else(GeminiConfig::from_env);
            app.insert_resource(ChatTransport::gemini(config));
        }
    }
}

/// spawns one async exchange per submission.
fn spawn_chat_requests(
    transport: Res<ChatTransport>,
    inbox: Res<ChatInbox>,
    mut in_flight: ResMut<InFlight>,
    mut submits: EventReader<ChatSubmit>,
    sessions: Query<(), With<ChatSession>>,
    mut ev_start: EventWriter<ChatStarted>,

    // native-only: small runtime to drive the exchange futures
    #[cfg(not(target_arch = "wasm32"))] rt: Res<TokioRt>,
) {
    for ChatSubmit { entity, text } in submits.read() {
        let entity = *entity;
        if sessions.get(entity).is_err() {
            warn!(target: "bevy_gemini_chat", "submit for {:?} ignored: no ChatSession", entity);
            continue;
        }

        let request = in_flight.next_id();
        let transport = transport.0.clone();
        let inbox_tx = inbox.tx.clone();
        let user_text = text.clone();
        info!(target: "bevy_gemini_chat",
            "spawn_chat_requests: entity={:?} request={} text_len={}",
            entity, request, user_text.len()
        );

        let run = async move {
            // a panicking transport still yields exactly one turn
            let result = match AssertUnwindSafe(transport.send(&user_text)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(target: "bevy_gemini_chat", "request {} panicked: {}", request, message);
                    ResponseResult::TransportError(format!("exchange panicked: {message}"))
                }
            };
            debug!(target: "bevy_gemini_chat", "request {} finished: success={}", request, result.is_success());
            push_inbox(&inbox_tx, ExchangeMsg::Done { entity, request, user_text, result }).await;
        };

        #[cfg(not(target_arch = "wasm32"))]
        {
            let handle = rt.0.spawn(run);
            in_flight.track(entity, Pending { request, abort: handle.abort_handle() });
        }
        #[cfg(target_arch = "wasm32")]
        {
            // wasm path: runs on the browser event loop, yields at the fetch.
            wasm_bindgen_futures::spawn_local(run);
            in_flight.track(entity, Pending { request });
        }

        ev_start.write(ChatStarted { entity, request });
    }
}

/// session ended: release anything it still waits on.
fn cancel_ended_sessions(
    mut removed: RemovedComponents<ChatSession>,
    mut in_flight: ResMut<InFlight>,
) {
    for entity in removed.read() {
        let cancelled = in_flight.cancel(entity);
        if cancelled > 0 {
            info!(target: "bevy_gemini_chat", "session {:?} ended: cancelled {} pending request(s)", entity, cancelled);
        }
    }
}

/// drains the inbox, appends turns and emits user-facing events.
fn drain_chat_inbox(
    inbox: Res<ChatInbox>,
    mut in_flight: ResMut<InFlight>,
    mut sessions: Query<(&ChatSession, &mut History)>,
    mut ev_turn: EventWriter<ChatTurnEvt>,
    mut ev_err: EventWriter<ChatErrorEvt>,
) {
    // cap per frame to avoid long frames on bursts
    const MAX_PER_FRAME: usize = 512;
    for _ in 0..MAX_PER_FRAME {
        let msg = match inbox.rx.try_recv() {
            Ok(m) => m,
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => break,
        };
        let ExchangeMsg::Done { entity, request, user_text, result } = msg;
        in_flight.finish(entity, request);

        let Ok((session, mut history)) = sessions.get_mut(entity) else {
            debug!(target: "bevy_gemini_chat", "request {} for ended session {:?} discarded", request, entity);
            continue;
        };

        if let Some(error) = result.error_description() {
            error!(target: "bevy_gemini_chat", "chat error (entity={:?}): {}", entity, error);
            ev_err.write(ChatErrorEvt { entity, error });
        }
        let turn = history
            .append_turn_with(&user_text, &result, session.error_attribution)
            .clone();
        ev_turn.write(ChatTurnEvt { entity, request, turn });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bevy::app::AppExit;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl Transport for Echo {
        async fn send(&self, user_text: &str) -> ResponseResult {
            ResponseResult::Success(format!("echo: {user_text}"))
        }
    }

    struct Hang;

    #[async_trait]
    impl Transport for Hang {
        async fn send(&self, _user_text: &str) -> ResponseResult {
            std::future::pending().await
        }
    }

    fn plugin_app(transport: ChatTransport) -> App {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.add_event::<AppExit>();
        app.insert_resource(transport);
        app.add_plugins(GeminiChatPlugin);
        app
    }

    fn drain_app() -> App {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.add_event::<ChatTurnEvt>();
        app.add_event::<ChatErrorEvt>();
        app.insert_resource(ChatInbox::default());
        app.init_resource::<InFlight>();
        app.add_systems(Update, super::drain_chat_inbox);
        app
    }

    fn done(entity: Entity, request: u64, user_text: &str, result: ResponseResult) -> ExchangeMsg {
        ExchangeMsg::Done { entity, request, user_text: user_text.into(), result }
    }

    #[test]
    fn send_user_text_queues_a_submission() {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.add_event::<ChatSubmit>();

        let e = app.world_mut().spawn(ChatSession::default()).id();
        {
            let mut commands = app.world_mut().commands();
            super::send_user_text(&mut commands, e, "hello world");
        }
        app.world_mut().flush();

        let mut ev = app.world_mut().resource_mut::<Events<ChatSubmit>>();
        let submits: Vec<_> = ev.drain().collect();
        assert_eq!(submits.len(), 1);
        assert_eq!(submits[0].entity, e);
        assert_eq!(submits[0].text, "hello world");
    }

    #[test]
    fn session_starts_with_empty_history() {
        let mut world = World::new();
        let e = world.spawn(ChatSession::default()).id();
        assert_eq!(world.entity(e).get::<History>(), Some(&History::new()));
    }

    #[test]
    fn drain_appends_turns_and_emits_events() {
        let mut app = drain_app();
        let e = app.world_mut().spawn(ChatSession::default()).id();

        {
            let tx = app.world().resource::<ChatInbox>().tx.clone();
            tx.send(done(e, 1, "Hello", ResponseResult::Success("Hi there".into()))).unwrap();
            tx.send(done(e, 2, "again", ResponseResult::Failure { status: 500, body: "server error".into() }))
                .unwrap();
        }
        app.update();

        let history = app.world().entity(e).get::<History>().expect("History exists").clone();
        assert_eq!(
            history.turns(),
            &[
                ConversationTurn::new("Hello", "🤖 Hi there"),
                ConversationTurn::new("Error:", "API Error 500: server error"),
            ]
        );
        {
            let mut ev = app.world_mut().resource_mut::<Events<ChatTurnEvt>>();
            let turns: Vec<_> = ev.drain().collect();
            assert_eq!(turns.len(), 2);
            assert_eq!(turns[0].request, 1);
            assert_eq!(turns[1].turn.user, "Error:");
        }
        {
            let mut ev = app.world_mut().resource_mut::<Events<ChatErrorEvt>>();
            let errs: Vec<_> = ev.drain().collect();
            assert_eq!(errs.len(), 1);
            assert!(errs[0].error.contains("500"));
        }
    }

    #[test]
    fn drain_honors_session_error_attribution() {
        let mut app = drain_app();
        let e = app
            .world_mut()
            .spawn(ChatSession { error_attribution: ErrorAttribution::UserText })
            .id();
        {
            let tx = app.world().resource::<ChatInbox>().tx.clone();
            tx.send(done(e, 1, "keep me", ResponseResult::TransportError("dns failure".into()))).unwrap();
        }
        app.update();

        let history = app.world().entity(e).get::<History>().unwrap();
        assert_eq!(history.turns(), &[ConversationTurn::new("keep me", "dns failure")]);
    }

    #[test]
    fn results_for_ended_sessions_are_dropped() {
        let mut app = drain_app();
        let e = app.world_mut().spawn(ChatSession::default()).id();
        app.world_mut().despawn(e);
        {
            let tx = app.world().resource::<ChatInbox>().tx.clone();
            tx.send(done(e, 7, "late", ResponseResult::Success("too late".into()))).unwrap();
        }
        app.update();

        let mut ev = app.world_mut().resource_mut::<Events<ChatTurnEvt>>();
        assert_eq!(ev.drain().count(), 0);
    }

    #[test]
    fn exchange_round_trips_through_the_plugin() {
        let mut app = plugin_app(ChatTransport::new(Echo));
        let e = app.world_mut().spawn(ChatSession::default()).id();
        {
            let mut commands = app.world_mut().commands();
            send_user_text(&mut commands, e, "ping");
            send_user_text(&mut commands, e, "ping");
        }
        app.world_mut().flush();

        for _ in 0..500 {
            app.update();
            if app.world().entity(e).get::<History>().unwrap().len() == 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }

        let history = app.world().entity(e).get::<History>().unwrap();
        assert_eq!(history.len(), 2, "identical submissions are not deduplicated");
        assert!(history.iter().all(|t| *t == ConversationTurn::new("ping", "🤖 echo: ping")));
        assert_eq!(app.world().resource::<InFlight>().pending(e), 0);
    }

    #[test]
    fn despawning_a_session_cancels_pending_requests() {
        let mut app = plugin_app(ChatTransport::new(Hang));
        let e = app.world_mut().spawn(ChatSession::default()).id();
        {
            let mut commands = app.world_mut().commands();
            send_user_text(&mut commands, e, "never answered");
        }
        app.world_mut().flush();
        app.update();
        assert_eq!(app.world().resource::<InFlight>().pending(e), 1);

        app.world_mut().despawn(e);
        app.update();
        assert_eq!(app.world().resource::<InFlight>().pending(e), 0);
    }

    #[test]
    fn submit_without_session_is_ignored() {
        let mut app = plugin_app(ChatTransport::new(Echo));
        let e = app.world_mut().spawn_empty().id();
        {
            let mut commands = app.world_mut().commands();
            send_user_text(&mut commands, e, "orphan");
        }
        app.world_mut().flush();
        app.update();

        assert_eq!(app.world().resource::<InFlight>().pending(e), 0);
        let mut ev = app.world_mut().resource_mut::<Events<ChatStarted>>();
        assert_eq!(ev.drain().count(), 0);
    }

    struct Explodes;

    #[async_trait]
    impl Transport for Explodes {
        async fn send(&self, _user_text: &str) -> ResponseResult {
            panic!("transport exploded")
        }
    }

    #[test]
    fn panicking_transport_still_records_a_turn() {
        let mut app = plugin_app(ChatTransport::new(Explodes));
        let e = app.world_mut().spawn(ChatSession::default()).id();
        {
            let mut commands = app.world_mut().commands();
            send_user_text(&mut commands, e, "boom?");
        }
        app.world_mut().flush();

        for _ in 0..500 {
            app.update();
            if !app.world().entity(e).get::<History>().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }

        let history = app.world().entity(e).get::<History>().unwrap();
        assert_eq!(
            history.turns(),
            &[ConversationTurn::new("Error:", "exchange panicked: transport exploded")]
        );
        assert_eq!(app.world().resource::<InFlight>().pending(e), 0);
    }

    #[test]
    fn ending_a_session_closes_its_http_connection() {
        let (endpoint, accepted) = crate::testing::silent_server();
        let mut app = plugin_app(ChatTransport::gemini(GeminiConfig::new("k").with_endpoint(endpoint)));
        let e = app.world_mut().spawn(ChatSession::default()).id();
        {
            let mut commands = app.world_mut().commands();
            send_user_text(&mut commands, e, "hello?");
        }
        app.world_mut().flush();
        app.update();

        let stream = accepted
            .recv_timeout(Duration::from_secs(5))
            .expect("request reached the server");
        assert_eq!(app.world().resource::<InFlight>().pending(e), 1);

        app.world_mut().despawn(e);
        app.update();
        assert_eq!(app.world().resource::<InFlight>().pending(e), 0);
        assert!(
            crate::testing::closed_by_peer(stream, Duration::from_secs(2)),
            "connection left open after the session ended"
        );
    }

    #[test]
    fn full_inbox_does_not_block_the_worker() {
        // one worker thread: a blocking send here would deadlock the receiver below
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let (tx, rx) = flume::bounded(1);
        let e = Entity::PLACEHOLDER;

        rt.block_on(async move {
            let producer = tokio::spawn(async move {
                for request in 1..=3 {
                    push_inbox(&tx, done(e, request, "x", ResponseResult::Success("y".into()))).await;
                }
            });
            let mut seen = Vec::new();
            for _ in 0..3 {
                let ExchangeMsg::Done { request, .. } = rx.recv_async().await.unwrap();
                seen.push(request);
            }
            producer.await.unwrap();
            assert_eq!(seen, vec![1, 2, 3]);
        });
    }
}
