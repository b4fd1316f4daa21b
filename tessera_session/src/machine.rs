use std::{
    error, fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};

use futures::{
    future::{BoxFuture, Shared},
    stream::BoxStream,
    FutureExt,
};
use tessera_clock::{Clock, System, UnixMillis};
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    claims::{ClaimsDecoder, UnverifiedJwtDecoder},
    gateway::{AuthorityClient, PasswordGrant, Registration, TokenGateway, DEFAULT_SCOPE},
    state::{AuthState, Session, StatePatch, StateWatcher},
    store::{KeyValueStore, TokenStore, DEFAULT_STORAGE_KEY},
    AuthError, RefreshToken, TokenSet,
};

/// How the delay before the next automatic refresh is derived
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RefreshSchedule {
    /// Half of the time remaining until the access token expires
    ///
    /// For a token set acquired just now this is half of its lifetime. For a
    /// token set restored from storage it accounts for the time already spent.
    #[default]
    HalfRemaining,

    /// Half of the lifetime the authority reported when the set was issued
    HalfLifetime,
}

impl RefreshSchedule {
    /// The delay before refreshing `tokens`, as of `now`
    pub fn delay(self, tokens: &TokenSet, now: UnixMillis) -> Duration {
        match self {
            Self::HalfRemaining => tokens.until_expired_at(now) / 2,
            Self::HalfLifetime => tokens.expires_in() / 2,
        }
    }
}

/// Configuration of an [`AuthStateMachine`]
#[derive(Clone, Debug)]
pub struct SessionConfig {
    storage_key: String,
    scope: String,
    refresh_schedule: RefreshSchedule,
    min_refresh_delay: Duration,
}

impl Default for SessionConfig {
    /// Default session configuration
    ///
    /// Stores tokens under `auth-tokens`, requests the `openid offline_access`
    /// scope, and refreshes at half the remaining lifetime but never sooner
    /// than one second after the previous acquisition.
    fn default() -> Self {
        Self {
            storage_key: DEFAULT_STORAGE_KEY.to_owned(),
            scope: DEFAULT_SCOPE.to_owned(),
            refresh_schedule: RefreshSchedule::default(),
            min_refresh_delay: Duration::from_secs(1),
        }
    }
}

impl SessionConfig {
    /// Sets the key the token set is persisted under
    pub fn with_storage_key(mut self, storage_key: impl Into<String>) -> Self {
        self.storage_key = storage_key.into();
        self
    }

    /// Sets the scope requested with each grant
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Sets how the automatic refresh delay is derived
    pub fn with_refresh_schedule(mut self, refresh_schedule: RefreshSchedule) -> Self {
        self.refresh_schedule = refresh_schedule;
        self
    }

    /// Sets the shortest delay an automatic refresh is armed with
    pub fn with_min_refresh_delay(mut self, min_refresh_delay: Duration) -> Self {
        self.min_refresh_delay = min_refresh_delay;
        self
    }
}

/// The automatic refresh currently armed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduledRefresh {
    /// When the refresh will run
    pub due: UnixMillis,
    /// The delay the timer was armed with
    pub delay: Duration,
}

type RefreshFlight = Shared<BoxFuture<'static, Result<TokenSet, AuthError>>>;

/// A refresh started for the session identified by `epoch`
struct InFlightRefresh {
    epoch: u64,
    flight: RefreshFlight,
}

struct ArmedTimer {
    id: u64,
    scheduled: ScheduledRefresh,
    handle: JoinHandle<()>,
}

/// Owns the authentication state and the token lifecycle
///
/// A single instance is constructed by the application and shared by cloning
/// the handle. Consumers observe the state through [`StateWatcher`]; only the
/// operations on this type change it.
#[derive(Clone)]
pub struct AuthStateMachine {
    inner: Arc<Inner>,
}

struct Inner {
    gateway: TokenGateway,
    store: TokenStore,
    decoder: Arc<dyn ClaimsDecoder>,
    clock: Arc<dyn Clock + Send + Sync>,
    refresh_schedule: RefreshSchedule,
    min_refresh_delay: Duration,
    state: watch::Sender<AuthState>,
    init: tokio::sync::OnceCell<Result<TokenSet, AuthError>>,
    transitions: tokio::sync::Mutex<()>,
    refresh: Mutex<Option<InFlightRefresh>>,
    timer: Mutex<Option<ArmedTimer>>,
    next_timer_id: AtomicU64,
}

impl AuthStateMachine {
    /// Constructs a state machine using the system clock and default configuration
    pub fn new(authority: Arc<dyn AuthorityClient>, kv: Arc<dyn KeyValueStore>) -> Self {
        Self::with_config(authority, kv, SessionConfig::default())
    }

    /// Constructs a state machine using the system clock
    pub fn with_config(
        authority: Arc<dyn AuthorityClient>,
        kv: Arc<dyn KeyValueStore>,
        config: SessionConfig,
    ) -> Self {
        Self::with_parts(
            authority,
            kv,
            Arc::new(UnverifiedJwtDecoder),
            Arc::new(System),
            config,
        )
    }

    /// Constructs a state machine from all of its collaborators
    pub fn with_parts(
        authority: Arc<dyn AuthorityClient>,
        kv: Arc<dyn KeyValueStore>,
        decoder: Arc<dyn ClaimsDecoder>,
        clock: Arc<dyn Clock + Send + Sync>,
        config: SessionConfig,
    ) -> Self {
        let (state, _) = watch::channel(AuthState::default());
        let inner = Inner {
            gateway: TokenGateway::new(authority, clock.clone()).with_scope(config.scope),
            store: TokenStore::new(kv, config.storage_key),
            decoder,
            clock,
            refresh_schedule: config.refresh_schedule,
            min_refresh_delay: config.min_refresh_delay,
            state,
            init: tokio::sync::OnceCell::new(),
            transitions: tokio::sync::Mutex::new(()),
            refresh: Mutex::new(None),
            timer: Mutex::new(None),
            next_timer_id: AtomicU64::new(0),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Restores the persisted session, if any
    ///
    /// Recovery runs once; every call receives the outcome of that run. A
    /// still-valid stored session is restored without contacting the
    /// authority, an expired one is refreshed, and one that cannot be
    /// refreshed is discarded. Whatever happens, the state is ready afterwards.
    ///
    /// # Errors
    ///
    /// [`AuthError::NoStoredSession`] if there was nothing (usable) to restore,
    /// [`AuthError::SessionExpired`] if the stored session could not be renewed.
    pub async fn init(&self) -> Result<TokenSet, AuthError> {
        self.inner
            .init
            .get_or_init(|| self.inner.startup())
            .await
            .clone()
    }

    /// Logs in with resource owner credentials
    ///
    /// On failure the state is left untouched.
    ///
    /// # Errors
    ///
    /// [`AuthError::AuthRejected`] with the authority's payload if the
    /// credentials were refused, [`AuthError::Decode`] if the issued identity
    /// token could not be decoded.
    pub async fn login(&self, credentials: &PasswordGrant) -> Result<TokenSet, AuthError> {
        let tokens = self.inner.gateway.acquire(credentials).await?;
        self.inner.commit(tokens, None).await
    }

    /// Registers a new account; does not log in
    ///
    /// # Errors
    ///
    /// [`AuthError::AuthRejected`] with the authority's payload if the
    /// registration was refused.
    pub async fn register(&self, registration: &Registration) -> Result<(), AuthError> {
        self.inner.gateway.register(registration).await
    }

    /// Ends the session
    ///
    /// Clears the persisted token set, cancels the scheduled refresh, and
    /// resets the session. Readiness is not affected. Safe to call when not
    /// logged in.
    pub async fn logout(&self) {
        self.inner.end_session(None).await;
    }

    /// Refreshes the current session immediately
    ///
    /// Concurrent calls for the same session share a single request to the
    /// authority. A refresh still in flight for a session that has since ended
    /// is never shared with its successor. A failure does not end the session;
    /// that is up to the caller.
    ///
    /// # Errors
    ///
    /// Any failure is reported as [`AuthError::SessionExpired`].
    pub async fn refresh_now(&self) -> Result<TokenSet, AuthError> {
        self.inner.refresh_now().await
    }

    /// Whether the profile carries `role`, re-evaluated on every state change
    pub fn is_in_role(&self, role: impl Into<String>) -> BoxStream<'static, bool> {
        self.watcher().role(role)
    }

    /// A read-only view of the state
    pub fn watcher(&self) -> StateWatcher {
        StateWatcher::new(self.inner.state.subscribe())
    }

    /// A snapshot of the current state
    pub fn state(&self) -> AuthState {
        self.inner.state.borrow().clone()
    }

    /// The automatic refresh currently armed, if any
    pub fn scheduled_refresh(&self) -> Option<ScheduledRefresh> {
        self.inner.timer_slot().as_ref().map(|t| t.scheduled)
    }
}

impl fmt::Debug for AuthStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AuthStateMachine")
            .field("gateway", &self.inner.gateway)
            .field("store", &self.inner.store)
            .field("state", &*self.inner.state.borrow())
            .field("scheduled_refresh", &self.scheduled_refresh())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn apply(&self, patch: StatePatch) {
        self.state.send_if_modified(|state| patch.apply(state));
    }

    fn epoch(&self) -> u64 {
        self.state.borrow().epoch()
    }

    fn timer_slot(&self) -> MutexGuard<'_, Option<ArmedTimer>> {
        self.timer.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn startup(self: &Arc<Self>) -> Result<TokenSet, AuthError> {
        let outcome = self.recover().await;
        self.apply(StatePatch::ready());

        match &outcome {
            Ok(tokens) => tracing::info!(
                expiry = tokens.expiration_date().0,
                "restored session"
            ),
            Err(AuthError::NoStoredSession) => tracing::debug!("no session to restore"),
            Err(error) => tracing::info!(
                error = (error as &dyn error::Error),
                "unable to restore session"
            ),
        }

        outcome
    }

    async fn recover(self: &Arc<Self>) -> Result<TokenSet, AuthError> {
        let tokens = self.store.load().await.ok_or(AuthError::NoStoredSession)?;

        let profile = match self.decoder.decode(tokens.id_token()) {
            Ok(profile) => profile,
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "stored identity token is corrupt, discarding stored session"
                );
                self.store.clear().await;
                return Err(AuthError::NoStoredSession);
            }
        };

        let now = self.clock.now();
        let epoch = {
            let _transition = self.transitions.lock().await;
            self.apply(StatePatch::session(Session::new(tokens.clone(), profile)));

            if !tokens.is_expired_at(now) {
                self.apply(StatePatch::ready());
                self.schedule_refresh(&tokens);
                return Ok(tokens);
            }

            self.epoch()
        };

        tracing::debug!(
            expiry = tokens.expiration_date().0,
            now = now.0,
            "stored session has expired, refreshing"
        );

        match self.refresh_now().await {
            Ok(tokens) => Ok(tokens),
            Err(_) => {
                self.end_session(Some(epoch)).await;
                Err(AuthError::SessionExpired)
            }
        }
    }

    async fn refresh_now(self: &Arc<Self>) -> Result<TokenSet, AuthError> {
        self.refresh_flight().await
    }

    /// Joins the refresh in flight for the current session, or starts one
    fn refresh_flight(self: &Arc<Self>) -> RefreshFlight {
        let mut slot = self.refresh.lock().unwrap_or_else(|p| p.into_inner());

        let (epoch, refresh_token) = {
            let state = self.state.borrow();
            let refresh_token = state.tokens().map(|t| t.refresh_token().to_owned());
            (state.epoch(), refresh_token)
        };

        if let Some(in_flight) = slot.as_ref() {
            if in_flight.epoch == epoch && in_flight.flight.peek().is_none() {
                tracing::debug!(epoch, "joining refresh already in flight");
                return in_flight.flight.clone();
            }
        }

        let flight = Arc::clone(self)
            .perform_refresh(epoch, refresh_token)
            .boxed()
            .shared();

        *slot = Some(InFlightRefresh {
            epoch,
            flight: flight.clone(),
        });

        flight
    }

    async fn perform_refresh(
        self: Arc<Self>,
        epoch: u64,
        refresh_token: Option<RefreshToken>,
    ) -> Result<TokenSet, AuthError> {
        let refresh_token = refresh_token.ok_or_else(|| {
            tracing::debug!("no session to refresh");
            AuthError::SessionExpired
        })?;

        let tokens = self.gateway.refresh(&refresh_token).await?;

        self.commit(tokens, Some(epoch)).await.map_err(|error| {
            if let AuthError::Decode(error) = &error {
                tracing::warn!(
                    error = (error as &dyn error::Error),
                    "refreshed identity token is corrupt"
                );
            }
            AuthError::SessionExpired
        })
    }

    /// Fans a newly acquired token set out to storage, state, and scheduling
    ///
    /// With `expected_epoch`, the set is discarded if the session changed
    /// since the request was made.
    async fn commit(
        self: &Arc<Self>,
        tokens: TokenSet,
        expected_epoch: Option<u64>,
    ) -> Result<TokenSet, AuthError> {
        let profile = self.decoder.decode(tokens.id_token())?;

        let _transition = self.transitions.lock().await;

        if let Some(expected) = expected_epoch {
            let current = self.epoch();
            if current != expected {
                tracing::debug!(
                    expected,
                    current,
                    "session changed while tokens were in flight, discarding"
                );
                return Err(AuthError::SessionExpired);
            }
        }

        self.store.save(&tokens).await;
        self.apply(StatePatch::session(Session::new(tokens.clone(), profile)).and_ready());
        self.schedule_refresh(&tokens);

        tracing::debug!(expiry = tokens.expiration_date().0, "committed token set");

        Ok(tokens)
    }

    /// Ends the session, unless `expected_epoch` no longer identifies it
    async fn end_session(&self, expected_epoch: Option<u64>) -> bool {
        let _transition = self.transitions.lock().await;

        if let Some(expected) = expected_epoch {
            if self.epoch() != expected {
                tracing::debug!("session already replaced, not ending it");
                return false;
            }
        }

        self.store.clear().await;
        self.cancel_refresh();
        self.apply(StatePatch::signed_out());

        tracing::info!("session ended");
        true
    }

    fn schedule_refresh(self: &Arc<Self>, tokens: &TokenSet) {
        let now = self.clock.now();
        let delay = self
            .refresh_schedule
            .delay(tokens, now)
            .max(self.min_refresh_delay);
        let scheduled = ScheduledRefresh {
            due: now + delay,
            delay,
        };
        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);

        let mut slot = self.timer_slot();
        let handle = tokio::spawn(refresh_when_due(
            Arc::downgrade(self),
            self.clock.clone(),
            id,
            scheduled.due,
        ));

        if let Some(previous) = slot.replace(ArmedTimer {
            id,
            scheduled,
            handle,
        }) {
            previous.handle.abort();
            tracing::trace!(previous = previous.id, "cancelled previous refresh timer");
        }

        tracing::debug!(
            timer = id,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            due = scheduled.due.0,
            "scheduled token refresh"
        );
    }

    fn cancel_refresh(&self) {
        if let Some(timer) = self.timer_slot().take() {
            timer.handle.abort();
            tracing::trace!(timer = timer.id, "cancelled refresh timer");
        }
    }

    /// Removes the timer from the slot if it is still the armed one
    fn disarm(&self, id: u64) -> bool {
        let mut slot = self.timer_slot();
        match slot.as_ref() {
            Some(timer) if timer.id == id => {
                slot.take();
                true
            }
            _ => false,
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let slot = self.timer.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(timer) = slot.take() {
            timer.handle.abort();
        }
    }
}

async fn refresh_when_due(
    inner: Weak<Inner>,
    clock: Arc<dyn Clock + Send + Sync>,
    id: u64,
    due: UnixMillis,
) {
    // The runtime's timer does not advance while the machine is suspended, so
    // sleep in short slices and check the wall clock in between.
    const HEARTBEAT: Duration = Duration::from_secs(30);
    loop {
        let now = clock.now();
        if now >= due {
            break;
        }

        let delay = (due - now).min(HEARTBEAT);
        tracing::trace!(
            timer = id,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "refresh not yet due, sleeping…"
        );
        tokio::time::sleep(delay).await;
    }

    let Some(inner) = inner.upgrade() else {
        tracing::debug!(timer = id, "session owner dropped, halting refreshes");
        return;
    };

    if !inner.disarm(id) {
        tracing::trace!(timer = id, "refresh timer superseded");
        return;
    }

    let epoch = inner.epoch();
    tracing::debug!(timer = id, "refreshing tokens on schedule");

    if let Err(error) = inner.refresh_now().await {
        tracing::warn!(
            timer = id,
            error = (&error as &dyn error::Error),
            "scheduled refresh failed, ending session"
        );
        inner.end_session(Some(epoch)).await;
    }
}
