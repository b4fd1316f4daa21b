use std::sync::Arc;

use futures::{
    future,
    stream::{self, BoxStream},
    StreamExt,
};
use thiserror::Error;
use tokio::sync::watch;

use crate::{Profile, TokenSet};

/// An authenticated session: a token set and the profile claimed by its
/// identity token
#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    tokens: TokenSet,
    profile: Profile,
}

impl Session {
    pub(crate) fn new(tokens: TokenSet, profile: Profile) -> Self {
        Self { tokens, profile }
    }

    /// The session's token set
    pub fn tokens(&self) -> &TokenSet {
        &self.tokens
    }

    /// The session's profile
    pub fn profile(&self) -> &Profile {
        &self.profile
    }
}

/// A snapshot of the authentication state
///
/// Tokens and profile are held together, so one is present exactly when the
/// other is. `auth_ready` is false only while startup recovery is running; no
/// consumer should treat a missing session as "logged out" before then.
#[derive(Clone, Debug, Default)]
pub struct AuthState {
    session: Option<Arc<Session>>,
    auth_ready: bool,
    epoch: u64,
}

impl AuthState {
    /// Whether startup recovery has finished
    #[inline]
    pub fn auth_ready(&self) -> bool {
        self.auth_ready
    }

    /// The current session, if any
    #[inline]
    pub fn session(&self) -> Option<&Session> {
        self.session.as_deref()
    }

    /// The current token set, if any
    #[inline]
    pub fn tokens(&self) -> Option<&TokenSet> {
        self.session().map(Session::tokens)
    }

    /// The current profile, if any
    #[inline]
    pub fn profile(&self) -> Option<&Profile> {
        self.session().map(Session::profile)
    }

    /// Whether a session is present
    #[inline]
    pub fn logged_in(&self) -> bool {
        self.session.is_some()
    }

    /// Whether the current profile carries `role`
    ///
    /// Always false without a session.
    pub fn is_in_role(&self, role: &str) -> bool {
        self.profile().map_or(false, |p| p.has_role(role))
    }

    /// Identifies the current session; changes whenever a session is
    /// committed or ended
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// A partial update to the authentication state
///
/// Only the fields carried by the patch are overwritten.
#[derive(Debug, Default)]
#[must_use]
pub(crate) struct StatePatch {
    session: Option<Option<Arc<Session>>>,
    ready: bool,
}

impl StatePatch {
    pub(crate) fn ready() -> Self {
        Self {
            session: None,
            ready: true,
        }
    }

    pub(crate) fn session(session: Session) -> Self {
        Self {
            session: Some(Some(Arc::new(session))),
            ready: false,
        }
    }

    pub(crate) fn signed_out() -> Self {
        Self {
            session: Some(None),
            ready: false,
        }
    }

    pub(crate) fn and_ready(mut self) -> Self {
        self.ready = true;
        self
    }

    /// Applies the patch, reporting whether anything changed
    pub(crate) fn apply(self, state: &mut AuthState) -> bool {
        let mut changed = false;

        if let Some(session) = self.session {
            state.session = session;
            state.epoch += 1;
            changed = true;
        }

        if self.ready && !state.auth_ready {
            state.auth_ready = true;
            changed = true;
        }

        changed
    }
}

/// The session owner was dropped and no further states will be published
#[derive(Clone, Copy, Debug, Error)]
#[error("session state publisher quit")]
pub struct StatePublisherQuit;

impl From<watch::error::RecvError> for StatePublisherQuit {
    fn from(_: watch::error::RecvError) -> Self {
        Self
    }
}

/// A read-only view of the authentication state
///
/// Every stream replays the latest state to a new subscriber and then emits
/// on each change. Streams observe the latest state; a slow consumer may skip
/// intermediate states.
#[derive(Clone, Debug)]
pub struct StateWatcher {
    rx: watch::Receiver<AuthState>,
}

impl StateWatcher {
    pub(crate) fn new(rx: watch::Receiver<AuthState>) -> Self {
        Self { rx }
    }

    /// A snapshot of the current state
    pub fn current(&self) -> AuthState {
        self.rx.borrow().clone()
    }

    /// Whether the current profile carries `role`
    pub fn is_in_role(&self, role: &str) -> bool {
        self.rx.borrow().is_in_role(role)
    }

    /// Waits for the next state change
    pub async fn changed(&mut self) -> Result<(), StatePublisherQuit> {
        Ok(self.rx.changed().await?)
    }

    /// Waits until startup recovery has finished and returns that state
    pub async fn wait_ready(&mut self) -> Result<AuthState, StatePublisherQuit> {
        let state = self.rx.wait_for(AuthState::auth_ready).await?;
        Ok(state.clone())
    }

    /// Every state, starting with the current one
    pub fn states(&self) -> BoxStream<'static, AuthState> {
        stream::unfold((self.rx.clone(), true), |(mut rx, first)| async move {
            if !first {
                rx.changed().await.ok()?;
            }
            let state = rx.borrow_and_update().clone();
            Some((state, (rx, false)))
        })
        .boxed()
    }

    fn ready_states(&self) -> BoxStream<'static, AuthState> {
        self.states()
            .filter(|state| future::ready(state.auth_ready()))
            .boxed()
    }

    /// The token set, once startup recovery has finished
    pub fn tokens(&self) -> BoxStream<'static, Option<TokenSet>> {
        self.ready_states()
            .map(|state| state.tokens().cloned())
            .boxed()
    }

    /// The profile, once startup recovery has finished
    pub fn profile(&self) -> BoxStream<'static, Option<Profile>> {
        self.ready_states()
            .map(|state| state.profile().cloned())
            .boxed()
    }

    /// Whether a session is present, once startup recovery has finished
    pub fn logged_in(&self) -> BoxStream<'static, bool> {
        self.ready_states().map(|state| state.logged_in()).boxed()
    }

    /// Whether the profile carries `role`, once startup recovery has finished
    pub fn role(&self, role: impl Into<String>) -> BoxStream<'static, bool> {
        let role = role.into();
        self.ready_states()
            .map(move |state| state.is_in_role(&role))
            .boxed()
    }
}
