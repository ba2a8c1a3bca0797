//! Session controller
//!
//! Drives the single `CallSession` through
//! Idle -> AwaitingPermission -> Initializing -> Active <-> Speaking -> Ending -> Idle.
//! User intents, remote session events and the completions of spawned
//! async work (permission, open, close, greeting, cleanup timer) all arrive
//! through `run`, one at a time, so transitions never interleave.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::error::CallError;
use crate::events::CallEvent;
use crate::permission::{Permission, PermissionGate};
use crate::remote::{OpenedSession, RemoteEvent, SessionClient, SessionError, SessionHandle};

use super::session::{CallSession, MicPermission, Phase};
use super::view::CallView;

/// User intents accepted from the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Start a call when idle, end it when connected
    ToggleCall,
}

/// Per-call parameters
#[derive(Debug, Clone)]
pub struct CallSettings {
    /// Remote agent to open sessions with
    pub agent_id: String,
    /// Opening message sent once per connected call
    pub greeting: String,
    /// How long `Ending` absorbs trailing remote events before resetting
    pub cleanup_delay: Duration,
    /// Upper bound on a remote `close`; past it the session counts as closed
    pub close_timeout: Duration,
}

/// Results of work spawned off the controller loop, tagged with the call
/// they belong to
enum Completion {
    Permission {
        call_id: u64,
        result: Permission,
    },
    Opened {
        call_id: u64,
        result: Result<OpenedSession, SessionError>,
    },
    Greeted {
        call_id: u64,
        result: Result<(), SessionError>,
    },
    Closed {
        call_id: u64,
        handle: SessionHandle,
        result: Result<(), SessionError>,
    },
    CleanupElapsed {
        call_id: u64,
    },
}

/// Everything the controller reacts to
enum Input {
    Intent(Intent),
    Remote(RemoteEvent),
    /// The remote client dropped its end of the event stream
    RemoteClosed,
    Completion(Completion),
}

/// Owns the call session and mediates the permission gate, the remote
/// session client and the presentation layer
pub struct SessionController {
    session: CallSession,
    settings: CallSettings,
    gate: Arc<dyn PermissionGate>,
    client: Arc<dyn SessionClient>,
    /// Incremented for every started call
    call_id: u64,
    call_started_at: Option<Instant>,
    phase_entered_at: Option<Instant>,
    /// End intent received before the remote open resolved
    end_requested: bool,
    close_in_flight: bool,
    cleanup_elapsed: bool,
    last_error: Option<CallError>,
    /// Subscription to the current session's events, dropped on Idle
    remote_events: Option<mpsc::Receiver<RemoteEvent>>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl SessionController {
    /// Create a controller with an idle session
    pub fn new(
        settings: CallSettings,
        gate: Arc<dyn PermissionGate>,
        client: Arc<dyn SessionClient>,
        event_tx: broadcast::Sender<CallEvent>,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            session: CallSession::new(),
            settings,
            gate,
            client,
            call_id: 0,
            call_started_at: None,
            phase_entered_at: None,
            end_requested: false,
            close_in_flight: false,
            cleanup_elapsed: false,
            last_error: None,
            remote_events: None,
            completion_tx,
            completion_rx,
            event_tx,
        }
    }

    #[cfg(test)]
    pub fn session(&self) -> &CallSession {
        &self.session
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.session.phase()
    }

    /// Current rendered view
    pub fn view(&self) -> CallView {
        CallView::render(&self.session, self.last_error.as_ref())
    }

    /// Run the controller until the intent channel closes
    pub async fn run(&mut self, mut intent_rx: mpsc::Receiver<Intent>) {
        info!(
            agent_id = %self.settings.agent_id,
            cleanup_delay_ms = self.settings.cleanup_delay.as_millis() as u64,
            "session controller started in Idle phase"
        );

        while let Some(input) = self.next_input(&mut intent_rx).await {
            self.handle(input);
        }

        info!("session controller stopped");
    }

    /// Wait for the next input. Returns `None` once intents are closed.
    async fn next_input(&mut self, intent_rx: &mut mpsc::Receiver<Intent>) -> Option<Input> {
        tokio::select! {
            intent = intent_rx.recv() => intent.map(Input::Intent),
            Some(completion) = self.completion_rx.recv() => Some(Input::Completion(completion)),
            event = next_remote_event(&mut self.remote_events) => Some(match event {
                Some(event) => Input::Remote(event),
                None => Input::RemoteClosed,
            }),
        }
    }

    fn handle(&mut self, input: Input) {
        match input {
            Input::Intent(Intent::ToggleCall) => self.toggle_call(),
            Input::Remote(event) => self.on_remote_event(event),
            Input::RemoteClosed => {
                debug!(call_id = self.call_id, "remote event stream ended");
                self.remote_events = None;
                self.on_remote_event(RemoteEvent::Disconnected);
            }
            Input::Completion(completion) => self.on_completion(completion),
        }
    }

    /// Handle the toggle intent. Behavior depends only on the phase.
    pub fn toggle_call(&mut self) {
        let call_id = self.call_id;
        match self.session.phase {
            Phase::Idle => self.start_call(),
            Phase::Initializing if self.session.handle.is_some() => {
                info!(call_id, "call ended by user before connecting");
                self.begin_teardown(None);
            }
            Phase::AwaitingPermission | Phase::Initializing => {
                if self.end_requested {
                    debug!(call_id, "end already requested, toggle ignored");
                } else {
                    info!(call_id, phase = %self.session.phase, "end requested before session opened, deferring");
                    self.end_requested = true;
                }
            }
            Phase::Active | Phase::Speaking => {
                info!(call_id, "call ended by user");
                self.begin_teardown(None);
            }
            Phase::Ending => {
                debug!(call_id, "teardown in progress, toggle ignored");
            }
        }
    }

    fn start_call(&mut self) {
        if !self.session.can_start() {
            debug!(
                phase = %self.session.phase,
                pending_cleanup = self.session.pending_cleanup,
                "start rejected"
            );
            return;
        }

        self.call_id += 1;
        self.call_started_at = Some(Instant::now());
        self.end_requested = false;
        self.last_error = None;

        let call_id = self.call_id;
        self.emit(CallEvent::CallStarted { call_id });
        self.transition_to(Phase::AwaitingPermission);

        let gate = Arc::clone(&self.gate);
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = gate.request_audio_capture().await;
            let _ = tx.send(Completion::Permission { call_id, result });
        });
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Permission { call_id, result } => self.on_permission(call_id, result),
            Completion::Opened { call_id, result } => self.on_opened(call_id, result),
            Completion::Greeted { call_id, result } => self.on_greeted(call_id, result),
            Completion::Closed {
                call_id,
                handle,
                result,
            } => self.on_closed(call_id, handle, result),
            Completion::CleanupElapsed { call_id } => self.on_cleanup_elapsed(call_id),
        }
    }

    fn on_permission(&mut self, call_id: u64, result: Permission) {
        if call_id != self.call_id || self.session.phase != Phase::AwaitingPermission {
            debug!(call_id, "stale permission result dropped");
            return;
        }

        self.session.mic = result.into();

        match result {
            Permission::Denied => {
                warn!(call_id, "microphone permission denied");
                self.last_error = Some(CallError::PermissionDenied);
                self.enter_idle();
            }
            Permission::Granted if self.end_requested => {
                info!(call_id, "call cancelled before session open");
                self.enter_idle();
            }
            Permission::Granted => {
                self.transition_to(Phase::Initializing);

                let client = Arc::clone(&self.client);
                let agent_id = self.settings.agent_id.clone();
                let tx = self.completion_tx.clone();
                tokio::spawn(async move {
                    let result = client.open(&agent_id).await;
                    let _ = tx.send(Completion::Opened { call_id, result });
                });
            }
        }
    }

    fn on_opened(&mut self, call_id: u64, result: Result<OpenedSession, SessionError>) {
        if call_id != self.call_id || self.session.phase != Phase::Initializing {
            if let Ok(opened) = result {
                warn!(call_id, handle = %opened.handle, "session opened for a finished call, closing it");
                self.spawn_close(call_id, opened.handle);
            }
            return;
        }

        match result {
            Ok(OpenedSession { handle, events }) => {
                info!(call_id, %handle, "remote session opened");
                self.session.handle = Some(handle);

                if self.end_requested {
                    info!(call_id, "honoring deferred end request");
                    drop(events);
                    self.begin_teardown(None);
                } else {
                    self.remote_events = Some(events);
                }
            }
            Err(e) => {
                error!(call_id, ?e, "failed to open remote session");
                self.begin_teardown(Some(CallError::SessionOpenFailed(e.to_string())));
            }
        }
    }

    fn on_remote_event(&mut self, event: RemoteEvent) {
        let call_id = self.call_id;
        let phase = self.session.phase;
        debug!(call_id, %event, %phase, "remote event");

        match event {
            RemoteEvent::Connected => match phase {
                Phase::Initializing if self.end_requested => {
                    debug!(call_id, "connected after end was requested, not activating");
                }
                Phase::Initializing => {
                    self.transition_to(Phase::Active);
                    self.greet_once();
                }
                Phase::Active | Phase::Speaking => {
                    debug!(call_id, "duplicate connected event ignored");
                }
                _ => {}
            },
            RemoteEvent::Speaking(true) => {
                if phase == Phase::Active {
                    self.transition_to(Phase::Speaking);
                }
            }
            RemoteEvent::Speaking(false) => {
                if phase == Phase::Speaking {
                    self.transition_to(Phase::Active);
                }
            }
            RemoteEvent::Message(payload) => {
                if phase.is_connected() || phase == Phase::Initializing {
                    info!(call_id, bytes = payload.len(), "message from agent");
                    self.emit(CallEvent::AgentMessage { call_id, payload });
                }
            }
            RemoteEvent::Disconnected => {
                if phase != Phase::Ending {
                    info!(call_id, "remote session disconnected");
                }
                self.begin_teardown(None);
            }
            RemoteEvent::Error(reason) => {
                self.begin_teardown(Some(CallError::SessionRuntimeError(reason)));
            }
        }
    }

    /// Send the greeting unless this Active period already had one
    fn greet_once(&mut self) {
        if self.session.has_greeted {
            return;
        }
        let Some(handle) = self.session.handle.clone() else {
            warn!(call_id = self.call_id, "connected without a session handle, skipping greeting");
            return;
        };

        self.session.has_greeted = true;

        let call_id = self.call_id;
        let client = Arc::clone(&self.client);
        let greeting = self.settings.greeting.clone();
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = client.send_message(&handle, &greeting).await;
            let _ = tx.send(Completion::Greeted { call_id, result });
        });
    }

    fn on_greeted(&mut self, call_id: u64, result: Result<(), SessionError>) {
        match result {
            Ok(()) => {
                debug!(call_id, "greeting delivered");
                if call_id == self.call_id {
                    self.emit(CallEvent::GreetingSent { call_id });
                }
            }
            Err(e) => {
                // Not retried, the call carries on without it
                let err = CallError::GreetingSendFailed(e.to_string());
                warn!(call_id, error = %err, "greeting not delivered");
            }
        }
    }

    /// Single teardown path for user hangup, remote disconnect and errors.
    ///
    /// Requests arriving while a teardown is pending are swallowed.
    fn begin_teardown(&mut self, cause: Option<CallError>) {
        let call_id = self.call_id;
        if self.session.pending_cleanup {
            debug!(call_id, "teardown already pending, request swallowed");
            return;
        }
        if self.session.phase == Phase::Idle {
            debug!(call_id, "no call to tear down");
            return;
        }

        if let Some(err) = cause {
            warn!(call_id, error = %err, "call ending on error");
            self.last_error = Some(err);
        }

        self.session.pending_cleanup = true;
        self.session.has_greeted = false;
        self.cleanup_elapsed = false;
        self.transition_to(Phase::Ending);

        if let Some(handle) = self.session.handle.clone() {
            self.close_in_flight = true;
            self.spawn_close(call_id, handle);
        }

        let delay = self.settings.cleanup_delay;
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Completion::CleanupElapsed { call_id });
        });
    }

    fn spawn_close(&self, call_id: u64, handle: SessionHandle) {
        let client = Arc::clone(&self.client);
        let limit = self.settings.close_timeout;
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(limit, client.close(&handle)).await {
                Ok(result) => result,
                Err(_) => Err(SessionError::CloseTimedOut(limit)),
            };
            let _ = tx.send(Completion::Closed {
                call_id,
                handle,
                result,
            });
        });
    }

    fn on_closed(&mut self, call_id: u64, handle: SessionHandle, result: Result<(), SessionError>) {
        if let Err(e) = result {
            warn!(call_id, %handle, ?e, "close failed, treating session as closed");
        } else {
            debug!(call_id, %handle, "remote session closed");
        }

        if call_id != self.call_id || !self.close_in_flight {
            return;
        }
        self.close_in_flight = false;
        self.settle_if_ready();
    }

    fn on_cleanup_elapsed(&mut self, call_id: u64) {
        if call_id != self.call_id || self.session.phase != Phase::Ending {
            return;
        }
        self.cleanup_elapsed = true;
        self.settle_if_ready();
    }

    /// Ending becomes Idle once the delay elapsed and no close is in flight
    fn settle_if_ready(&mut self) {
        if self.session.phase != Phase::Ending || !self.cleanup_elapsed {
            return;
        }
        if self.close_in_flight {
            debug!(call_id = self.call_id, "cleanup delay elapsed, waiting for close");
            return;
        }
        self.enter_idle();
    }

    fn enter_idle(&mut self) {
        let call_id = self.call_id;

        self.remote_events = None;
        self.session.clear_call();
        self.end_requested = false;
        self.close_in_flight = false;
        self.cleanup_elapsed = false;
        self.transition_to(Phase::Idle);

        let duration_ms = self
            .call_started_at
            .take()
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        let error = self
            .last_error
            .as_ref()
            .filter(|e| e.is_user_visible())
            .map(|e| e.to_string());

        info!(call_id, duration_ms, ?error, "call ended");
        self.emit(CallEvent::CallEnded {
            call_id,
            duration_ms,
            error,
        });
    }

    /// Perform a phase transition and publish the new view
    fn transition_to(&mut self, new_phase: Phase) {
        let old_phase = self.session.phase;
        if old_phase == new_phase {
            return;
        }

        debug_assert!(
            new_phase != Phase::Initializing || self.session.mic == MicPermission::Granted,
            "Initializing requires granted microphone"
        );

        let duration_ms = self
            .phase_entered_at
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        info!(
            call_id = self.call_id,
            from = %old_phase,
            to = %new_phase,
            duration_ms = duration_ms,
            "phase transition"
        );

        self.session.phase = new_phase;
        self.phase_entered_at = if new_phase != Phase::Idle {
            Some(Instant::now())
        } else {
            None
        };

        debug_assert!(!self.session.has_greeted || new_phase.is_connected());

        self.emit(CallEvent::PhaseChanged {
            from: old_phase,
            to: new_phase,
            duration_ms,
            view: self.view(),
        });
    }

    fn emit(&self, event: CallEvent) {
        debug!(%event, "emitting call event");
        let _ = self.event_tx.send(event);
    }
}

/// Next event of the current session, pending forever when unsubscribed
async fn next_remote_event(events: &mut Option<mpsc::Receiver<RemoteEvent>>) -> Option<RemoteEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;

    struct MockGate {
        answer: Permission,
        calls: AtomicUsize,
    }

    impl MockGate {
        fn granting() -> Self {
            Self {
                answer: Permission::Granted,
                calls: AtomicUsize::new(0),
            }
        }

        fn denying() -> Self {
            Self {
                answer: Permission::Denied,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PermissionGate for MockGate {
        async fn request_audio_capture(&self) -> Permission {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer
        }
    }

    /// Remote client that records calls and lets tests inject events
    #[derive(Default)]
    struct MockClient {
        fail_open: bool,
        fail_send: bool,
        /// Holds `open` until notified
        open_release: Option<Arc<Notify>>,
        /// Holds `close` until notified
        close_release: Option<Arc<Notify>>,
        open_calls: AtomicUsize,
        close_calls: AtomicUsize,
        open_now: AtomicUsize,
        max_open: AtomicUsize,
        sent: Mutex<Vec<String>>,
        events: Mutex<Option<mpsc::Sender<RemoteEvent>>>,
    }

    impl MockClient {
        fn open_calls(&self) -> usize {
            self.open_calls.load(Ordering::SeqCst)
        }

        fn close_calls(&self) -> usize {
            self.close_calls.load(Ordering::SeqCst)
        }

        fn max_open(&self) -> usize {
            self.max_open.load(Ordering::SeqCst)
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }

        async fn emit(&self, event: RemoteEvent) {
            let tx = self.events.lock().unwrap().clone();
            if let Some(tx) = tx {
                tx.send(event).await.unwrap();
            }
        }

        /// Drop the event stream without a disconnect event
        fn hang_up(&self) {
            self.events.lock().unwrap().take();
        }
    }

    #[async_trait]
    impl SessionClient for MockClient {
        async fn open(&self, agent_id: &str) -> Result<OpenedSession, SessionError> {
            let n = self.open_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(release) = &self.open_release {
                release.notified().await;
            }
            if self.fail_open {
                return Err(SessionError::Open("refused".into()));
            }

            let now = self.open_now.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_open.fetch_max(now, Ordering::SeqCst);

            let (tx, rx) = mpsc::channel(16);
            *self.events.lock().unwrap() = Some(tx);
            Ok(OpenedSession {
                handle: SessionHandle::new(format!("{agent_id}-{n}")),
                events: rx,
            })
        }

        async fn close(&self, _handle: &SessionHandle) -> Result<(), SessionError> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(release) = &self.close_release {
                release.notified().await;
            }
            self.open_now.fetch_sub(1, Ordering::SeqCst);
            self.events.lock().unwrap().take();
            Ok(())
        }

        async fn send_message(&self, _handle: &SessionHandle, text: &str) -> Result<(), SessionError> {
            self.sent.lock().unwrap().push(text.to_string());
            if self.fail_send {
                return Err(SessionError::Send("socket closed".into()));
            }
            Ok(())
        }
    }

    struct Harness {
        sm: SessionController,
        gate: Arc<MockGate>,
        client: Arc<MockClient>,
        events: broadcast::Receiver<CallEvent>,
        intents: mpsc::Receiver<Intent>,
        _intent_tx: mpsc::Sender<Intent>,
    }

    impl Harness {
        fn new(gate: MockGate, client: MockClient) -> Self {
            let (event_tx, events) = broadcast::channel(64);
            let (intent_tx, intents) = mpsc::channel(8);
            let gate = Arc::new(gate);
            let client = Arc::new(client);
            let settings = CallSettings {
                agent_id: "agent-1".into(),
                greeting: "hello".into(),
                cleanup_delay: Duration::from_millis(100),
                close_timeout: Duration::from_secs(2),
            };
            let sm = SessionController::new(settings, gate.clone(), client.clone(), event_tx);
            Self {
                sm,
                gate,
                client,
                events,
                intents,
                _intent_tx: intent_tx,
            }
        }

        /// Feed inputs to the controller for `ms` of (paused) time
        async fn pump(&mut self, ms: u64) {
            let deadline = tokio::time::sleep(Duration::from_millis(ms));
            tokio::pin!(deadline);
            loop {
                let input = tokio::select! {
                    biased;
                    input = self.sm.next_input(&mut self.intents) => input,
                    _ = &mut deadline => None,
                };
                match input {
                    Some(input) => self.sm.handle(input),
                    None => break,
                }
            }
        }

        /// Start a call and bring it to Active
        async fn connect(&mut self) {
            self.sm.toggle_call();
            self.pump(10).await;
            assert_eq!(self.sm.phase(), Phase::Initializing);
            self.client.emit(RemoteEvent::Connected).await;
            self.pump(10).await;
            assert_eq!(self.sm.phase(), Phase::Active);
        }

        /// Phases entered since the last call, in order
        fn phases(&mut self) -> Vec<Phase> {
            let mut phases = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                if let CallEvent::PhaseChanged { to, .. } = event {
                    phases.push(to);
                }
            }
            phases
        }
    }

    #[test]
    fn test_initial_state() {
        let (tx, _rx) = broadcast::channel(16);
        let settings = CallSettings {
            agent_id: "a".into(),
            greeting: "g".into(),
            cleanup_delay: Duration::from_millis(100),
            close_timeout: Duration::from_secs(2),
        };
        let sm = SessionController::new(
            settings,
            Arc::new(MockGate::granting()),
            Arc::new(MockClient::default()),
            tx,
        );
        assert_eq!(sm.phase(), Phase::Idle);
        assert_eq!(sm.session().mic(), MicPermission::Unknown);
        assert_eq!(sm.view(), CallView::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_never_opens() {
        let mut h = Harness::new(MockGate::denying(), MockClient::default());

        h.sm.toggle_call();
        assert!(h.sm.view().is_busy);
        h.pump(10).await;

        assert_eq!(h.sm.phase(), Phase::Idle);
        assert_eq!(h.sm.session().mic(), MicPermission::Denied);
        assert_eq!(h.client.open_calls(), 0);
        assert_eq!(h.phases(), vec![Phase::AwaitingPermission, Phase::Idle]);

        let view = h.sm.view();
        assert_eq!(view.display_text, "AI Powered Tips");
        assert_eq!(view.action_label, "Ask");
        assert!(!view.is_busy);
        assert_eq!(view.notice.as_deref(), Some("microphone access denied"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_call_greets_and_follows_speech() {
        let mut h = Harness::new(MockGate::granting(), MockClient::default());

        h.connect().await;
        assert!(h.sm.session().has_greeted());
        assert_eq!(h.client.sent(), vec!["hello".to_string()]);
        assert_eq!(h.sm.view().display_text, "Listening...");
        assert!(h.sm.view().is_connected);

        h.client.emit(RemoteEvent::Speaking(true)).await;
        h.pump(10).await;
        assert_eq!(h.sm.phase(), Phase::Speaking);
        assert_eq!(h.sm.view().display_text, "Talking...");

        h.client.emit(RemoteEvent::Speaking(false)).await;
        h.pump(10).await;
        assert_eq!(h.sm.phase(), Phase::Active);
        assert_eq!(h.sm.view().display_text, "Listening...");
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_connected_greets_once() {
        let mut h = Harness::new(MockGate::granting(), MockClient::default());

        h.connect().await;
        h.client.emit(RemoteEvent::Connected).await;
        h.client.emit(RemoteEvent::Connected).await;
        h.pump(10).await;

        assert_eq!(h.sm.phase(), Phase::Active);
        assert_eq!(h.client.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_error_debounces_back_to_idle() {
        let mut h = Harness::new(MockGate::granting(), MockClient::default());
        h.connect().await;

        h.client.emit(RemoteEvent::Error("boom".into())).await;
        h.pump(10).await;

        assert_eq!(h.sm.phase(), Phase::Ending);
        assert!(h.sm.session().pending_cleanup());
        assert!(!h.sm.session().has_greeted());
        assert_eq!(h.client.close_calls(), 1);
        assert!(h.sm.view().is_busy);
        assert!(h.sm.view().notice.unwrap().contains("boom"));

        h.pump(200).await;

        assert_eq!(h.sm.phase(), Phase::Idle);
        assert!(!h.sm.session().has_greeted());
        assert!(h.sm.session().handle().is_none());
        assert!(!h.sm.session().pending_cleanup());
        assert!(!h.sm.view().is_busy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_then_disconnect_burst_tears_down_once() {
        let mut h = Harness::new(MockGate::granting(), MockClient::default());
        h.connect().await;
        h.phases();

        h.client.emit(RemoteEvent::Error("reset".into())).await;
        h.client.emit(RemoteEvent::Disconnected).await;
        h.pump(200).await;

        assert_eq!(h.sm.phase(), Phase::Idle);
        assert_eq!(h.client.close_calls(), 1);
        assert_eq!(h.phases(), vec![Phase::Ending, Phase::Idle]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_during_initializing_closes_after_open() {
        let release = Arc::new(Notify::new());
        let client = MockClient {
            open_release: Some(release.clone()),
            ..Default::default()
        };
        let mut h = Harness::new(MockGate::granting(), client);

        h.sm.toggle_call();
        h.pump(10).await;
        assert_eq!(h.sm.phase(), Phase::Initializing);
        assert_eq!(h.client.open_calls(), 1);

        h.sm.toggle_call();
        h.sm.toggle_call();
        h.pump(10).await;
        assert_eq!(h.client.close_calls(), 0);
        assert_eq!(h.sm.phase(), Phase::Initializing);

        release.notify_one();
        h.pump(10).await;
        assert_eq!(h.client.close_calls(), 1);
        assert_eq!(h.sm.phase(), Phase::Ending);

        h.pump(200).await;
        assert_eq!(h.sm.phase(), Phase::Idle);
        assert_eq!(h.client.close_calls(), 1);
        assert!(!h.phases().contains(&Phase::Active));
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_after_open_before_connected() {
        let mut h = Harness::new(MockGate::granting(), MockClient::default());

        h.sm.toggle_call();
        h.pump(10).await;
        assert_eq!(h.sm.phase(), Phase::Initializing);
        assert!(h.sm.session().handle().is_some());

        h.sm.toggle_call();
        h.sm.toggle_call();
        assert_eq!(h.sm.phase(), Phase::Ending);

        // Late connect from the session being closed
        h.client.emit(RemoteEvent::Connected).await;
        h.pump(500).await;

        assert_eq!(h.sm.phase(), Phase::Idle);
        assert_eq!(h.client.close_calls(), 1);
        assert!(h.client.sent().is_empty());
        assert!(!h.phases().contains(&Phase::Active));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_before_connected_tears_down() {
        let mut h = Harness::new(MockGate::granting(), MockClient::default());

        h.sm.toggle_call();
        h.pump(10).await;
        assert_eq!(h.sm.phase(), Phase::Initializing);

        h.client.emit(RemoteEvent::Error("handshake failed".into())).await;
        h.pump(10).await;
        assert_eq!(h.sm.phase(), Phase::Ending);
        assert_eq!(h.client.close_calls(), 1);
        assert!(h.sm.view().notice.unwrap().contains("handshake failed"));

        h.pump(200).await;
        assert_eq!(h.sm.phase(), Phase::Idle);
        assert!(h.sm.session().handle().is_none());
        assert!(h.client.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_close_still_returns_to_idle() {
        let client = MockClient {
            close_release: Some(Arc::new(Notify::new())),
            ..Default::default()
        };
        let mut h = Harness::new(MockGate::granting(), client);
        h.connect().await;

        h.sm.toggle_call();
        h.pump(1_000).await;
        assert_eq!(h.sm.phase(), Phase::Ending);

        h.pump(2_000).await;
        assert_eq!(h.sm.phase(), Phase::Idle);
        assert!(!h.sm.session().pending_cleanup());

        h.sm.toggle_call();
        h.pump(10).await;
        assert_eq!(h.gate.calls(), 2);
        assert_eq!(h.sm.phase(), Phase::Initializing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_toggle_while_awaiting_permission() {
        let mut h = Harness::new(MockGate::granting(), MockClient::default());

        h.sm.toggle_call();
        assert_eq!(h.sm.phase(), Phase::AwaitingPermission);
        h.sm.toggle_call();
        h.sm.toggle_call();
        h.pump(10).await;

        assert_eq!(h.sm.phase(), Phase::Idle);
        assert_eq!(h.gate.calls(), 1);
        assert_eq!(h.client.open_calls(), 0);
        assert_eq!(h.sm.session().mic(), MicPermission::Granted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_during_ending_is_ignored() {
        let mut h = Harness::new(MockGate::granting(), MockClient::default());
        h.connect().await;

        h.sm.toggle_call();
        assert_eq!(h.sm.phase(), Phase::Ending);
        assert!(!h.sm.session().has_greeted());
        h.sm.toggle_call();
        h.pump(10).await;
        h.sm.toggle_call();

        assert_eq!(h.sm.phase(), Phase::Ending);
        assert_eq!(h.client.close_calls(), 1);
        assert_eq!(h.gate.calls(), 1);

        h.pump(200).await;
        assert_eq!(h.sm.phase(), Phase::Idle);

        h.sm.toggle_call();
        h.pump(10).await;
        assert_eq!(h.gate.calls(), 2);
        assert_eq!(h.sm.phase(), Phase::Initializing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_lands_in_ending() {
        let client = MockClient {
            fail_open: true,
            ..Default::default()
        };
        let mut h = Harness::new(MockGate::granting(), client);

        h.sm.toggle_call();
        h.pump(10).await;
        assert_eq!(h.sm.phase(), Phase::Ending);
        assert_eq!(h.client.close_calls(), 0);
        assert!(h.sm.view().notice.unwrap().contains("refused"));

        h.pump(200).await;
        assert_eq!(h.sm.phase(), Phase::Idle);
        assert!(h.sm.view().notice.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_greeting_failure_keeps_call_alive() {
        let client = MockClient {
            fail_send: true,
            ..Default::default()
        };
        let mut h = Harness::new(MockGate::granting(), client);

        h.connect().await;
        h.pump(50).await;

        assert_eq!(h.sm.phase(), Phase::Active);
        assert_eq!(h.client.sent().len(), 1);
        assert_eq!(h.client.close_calls(), 0);
        assert_eq!(h.sm.view().notice, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_close_delays_idle() {
        let release = Arc::new(Notify::new());
        let client = MockClient {
            close_release: Some(release.clone()),
            ..Default::default()
        };
        let mut h = Harness::new(MockGate::granting(), client);
        h.connect().await;

        h.sm.toggle_call();
        h.pump(200).await;
        assert_eq!(h.sm.phase(), Phase::Ending);

        release.notify_one();
        h.pump(10).await;
        assert_eq!(h.sm.phase(), Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_is_a_disconnect() {
        let mut h = Harness::new(MockGate::granting(), MockClient::default());
        h.connect().await;

        h.client.hang_up();
        h.pump(10).await;
        assert_eq!(h.sm.phase(), Phase::Ending);
        assert_eq!(h.client.close_calls(), 1);

        h.pump(200).await;
        assert_eq!(h.sm.phase(), Phase::Idle);
        assert_eq!(h.sm.view().notice, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_two_sessions_open() {
        let mut h = Harness::new(MockGate::granting(), MockClient::default());

        for _ in 0..4 {
            // Cancelled before open
            h.sm.toggle_call();
            h.sm.toggle_call();
            h.pump(5).await;
            assert_eq!(h.sm.phase(), Phase::Idle);

            h.sm.toggle_call();
            h.pump(5).await;
            h.client.emit(RemoteEvent::Connected).await;
            h.pump(5).await;
            h.sm.toggle_call();
            h.sm.toggle_call();
            h.pump(150).await;
            assert_eq!(h.sm.phase(), Phase::Idle);
        }

        assert_eq!(h.client.open_calls(), 4);
        assert_eq!(h.client.close_calls(), 4);
        assert_eq!(h.client.max_open(), 1);
        assert_eq!(h.client.sent().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_end_reports_clean_call() {
        let mut h = Harness::new(MockGate::granting(), MockClient::default());
        h.connect().await;

        h.sm.toggle_call();
        h.pump(200).await;

        let mut ended = None;
        while let Ok(event) = h.events.try_recv() {
            if let CallEvent::CallEnded { call_id, error, .. } = event {
                ended = Some((call_id, error));
            }
        }
        assert_eq!(ended, Some((1, None)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_processes_intents() {
        let (event_tx, mut events) = broadcast::channel(16);
        let (intent_tx, intent_rx) = mpsc::channel(8);
        let settings = CallSettings {
            agent_id: "agent-1".into(),
            greeting: "hello".into(),
            cleanup_delay: Duration::from_millis(100),
            close_timeout: Duration::from_secs(2),
        };
        let mut sm = SessionController::new(
            settings,
            Arc::new(MockGate::denying()),
            Arc::new(MockClient::default()),
            event_tx,
        );

        let task = tokio::spawn(async move {
            sm.run(intent_rx).await;
            sm.phase()
        });

        intent_tx.send(Intent::ToggleCall).await.unwrap();
        loop {
            if let CallEvent::CallEnded { error, .. } = events.recv().await.unwrap() {
                assert_eq!(error.as_deref(), Some("microphone access denied"));
                break;
            }
        }

        drop(intent_tx);
        assert_eq!(task.await.unwrap(), Phase::Idle);
    }
}
