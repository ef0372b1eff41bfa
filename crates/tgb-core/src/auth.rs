//! Interactive account sign-in.
//!
//! [`SessionAuthenticator`] drives the phone → code → (password) challenge through the
//! protocol client's `login` entry point. Where answers come from is an
//! [`InputProvider`]: [`TerminalInput`] for a console operator, [`PendingInputs`] when
//! answers arrive out-of-band (HTTP form, socket, bot command).

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin};
use tokio::sync::{oneshot, Mutex};

use crate::{
    domain::SessionToken,
    errors::Error,
    events::{log, Event, EventSink, Status},
    ports::{InputKind, InputProvider, LoginPrompts, ProtocolClient},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthState {
    Disconnected,
    AwaitingPhone,
    AwaitingCode,
    AwaitingPassword,
    Authenticated,
}

impl AuthState {
    fn awaiting(kind: InputKind) -> Self {
        match kind {
            InputKind::Phone => AuthState::AwaitingPhone,
            InputKind::Code => AuthState::AwaitingCode,
            InputKind::Password => AuthState::AwaitingPassword,
        }
    }
}

#[derive(Debug)]
struct AuthInner {
    state: AuthState,
    last_requested: Option<InputKind>,
}

pub struct SessionAuthenticator {
    input: Arc<dyn InputProvider>,
    events: Arc<dyn EventSink>,
    inner: std::sync::Mutex<AuthInner>,
}

impl SessionAuthenticator {
    pub fn new(input: Arc<dyn InputProvider>, events: Arc<dyn EventSink>) -> Self {
        Self {
            input,
            events,
            inner: std::sync::Mutex::new(AuthInner {
                state: AuthState::Disconnected,
                last_requested: None,
            }),
        }
    }

    pub fn state(&self) -> AuthState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AuthInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: AuthState) {
        self.lock().state = state;
    }

    /// Connect and sign in, reusing the client's session when it is already authorized.
    ///
    /// On success the resumable token is returned and also emitted as `Event::Session`.
    pub async fn authenticate(&self, client: &dyn ProtocolClient) -> Result<SessionToken> {
        log(self.events.as_ref(), "Starting Telegram client...");
        if let Err(e) = client.connect().await {
            self.set_state(AuthState::Disconnected);
            log(self.events.as_ref(), format!("Could not connect: {e}"));
            return Err(e);
        }

        let token = if client.check_authorized().await? {
            log(self.events.as_ref(), "Saved session is still valid.");
            client.export_session().await?
        } else {
            match client.login(self).await {
                Ok(token) => token,
                Err(e) => {
                    {
                        let mut inner = self.lock();
                        inner.state = AuthState::Disconnected;
                        inner.last_requested = None;
                    }
                    log(self.events.as_ref(), format!("Login failed: {e}"));
                    return Err(match e {
                        Error::AuthChallenge(m) => Error::AuthChallenge(m),
                        other => Error::AuthChallenge(other.to_string()),
                    });
                }
            }
        };

        self.set_state(AuthState::Authenticated);
        log(self.events.as_ref(), "Login successful!");
        self.events.emit(Event::Status(Status::Ready));
        self.events.emit(Event::Session(token.clone()));
        Ok(token)
    }

    async fn ask(&self, kind: InputKind) -> Result<String> {
        {
            let mut inner = self.lock();
            inner.state = AuthState::awaiting(kind);
            inner.last_requested = Some(kind);
        }
        let (msg, status) = match kind {
            InputKind::Phone => ("Waiting for phone number...", Status::WaitingPhone),
            InputKind::Code => ("Waiting for login code...", Status::WaitingCode),
            InputKind::Password => ("Waiting for 2FA password...", Status::WaitingPassword),
        };
        log(self.events.as_ref(), msg);
        self.events.emit(Event::Status(status));
        self.input.request(kind).await
    }
}

#[async_trait]
impl LoginPrompts for SessionAuthenticator {
    async fn phone_number(&self) -> Result<String> {
        self.ask(InputKind::Phone).await
    }

    async fn phone_code(&self) -> Result<String> {
        self.ask(InputKind::Code).await
    }

    async fn password(&self) -> Result<String> {
        self.ask(InputKind::Password).await
    }

    fn on_error(&self, err: &Error) {
        {
            let mut inner = self.lock();
            inner.state = inner
                .last_requested
                .map(AuthState::awaiting)
                .unwrap_or(AuthState::Disconnected);
        }
        tracing::warn!("login challenge rejected: {err}");
        log(self.events.as_ref(), format!("Client error: {err}"));
    }
}

/// Out-of-band answers: one pending slot per input kind.
#[derive(Default)]
pub struct PendingInputs {
    slots: std::sync::Mutex<HashMap<InputKind, oneshot::Sender<String>>>,
}

impl PendingInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the pending wait for `kind`. Returns false (and does nothing) when no one waits.
    pub fn submit_input(&self, kind: InputKind, value: impl Into<String>) -> bool {
        let pending = self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&kind);
        match pending {
            Some(tx) => tx.send(value.into()).is_ok(),
            None => false,
        }
    }

    /// String-keyed submit for transports that carry `{ type, value }`.
    pub fn submit_named(&self, kind: &str, value: impl Into<String>) -> Result<bool> {
        let kind = InputKind::parse(kind)
            .ok_or_else(|| Error::AuthChallenge(format!("unknown input type: {kind}")))?;
        Ok(self.submit_input(kind, value))
    }

    pub fn is_waiting(&self, kind: InputKind) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .is_some_and(|tx| !tx.is_closed())
    }
}

#[async_trait]
impl InputProvider for PendingInputs {
    async fn request(&self, kind: InputKind) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        // A newer request for the same kind replaces a stale one.
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind, tx);
        rx.await.map_err(|_| {
            Error::AuthChallenge(format!("{} input was abandoned", kind.as_str()))
        })
    }
}

/// Console prompts on stderr, answers read from stdin.
pub struct TerminalInput {
    stdin: Mutex<BufReader<Stdin>>,
}

impl TerminalInput {
    pub fn new() -> Self {
        Self {
            stdin: Mutex::new(BufReader::new(tokio::io::stdin())),
        }
    }
}

impl Default for TerminalInput {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InputProvider for TerminalInput {
    async fn request(&self, kind: InputKind) -> Result<String> {
        let label = match kind {
            InputKind::Phone => "Phone number (international format): ",
            InputKind::Code => "Login code: ",
            InputKind::Password => "2FA password: ",
        };
        let mut err = tokio::io::stderr();
        err.write_all(label.as_bytes()).await?;
        err.flush().await?;

        let mut line = String::new();
        let n = self.stdin.lock().await.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::AuthChallenge(format!(
                "stdin closed while waiting for {}",
                kind.as_str()
            )));
        }
        Ok(line.trim().to_string())
    }
}
