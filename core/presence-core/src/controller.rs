//! Session controller: owns the background threads and the shared activity.
//!
//! Two threads cooperate with the host's own calls to [`SessionController::update`]:
//!
//! - **heartbeat**: connects (retrying with a fixed backoff), ships the latest
//!   activity, then ticks [`PresenceClient::update`] until the channel drops
//!   and falls back to reconnecting.
//! - **idle**: switches the displayed activity to the idle variant once no
//!   update has arrived for the configured threshold.
//!
//! The client and the activity share one mutex. It is held across a single
//! client call and never across a sleep, so channel requests are totally
//! ordered and never overlap. Connecting takes the lock once per slot, so a
//! scan over unresponsive slots neither starves the host nor outlives a stop.

use presence_protocol::PresenceActivity;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::client::{ErrorCallback, PresenceClient};
use crate::config::PresenceConfig;
use crate::error::PresenceError;
use crate::stop::StopSignal;
use crate::transport::{Connector, IPC_SLOT_COUNT};

const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
const IDLE_DETAILS: &str = "Idle";

/// Timers and display policy the background loops run with.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub client_id: u64,
    pub heartbeat_interval: Duration,
    pub reconnect_backoff: Duration,
    pub idle_threshold: Duration,
    pub idle_check_interval: Duration,
    pub hide_idle_status: bool,
    /// Keep the elapsed-time anchor across reconnects instead of starting a
    /// new epoch on every connect.
    pub preserve_start_time: bool,
    pub elapsed_time: bool,
    pub editor_name: String,
    pub idle_image: String,
    /// Upper bound on how long [`SessionController::close`] waits per thread.
    pub join_timeout: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &PresenceConfig) -> Self {
        Self {
            client_id: config.client_id(),
            heartbeat_interval: config.heartbeat_interval(),
            reconnect_backoff: config.reconnect_backoff(),
            idle_threshold: config.idle_threshold(),
            idle_check_interval: IDLE_CHECK_INTERVAL,
            hide_idle_status: config.hide_idle_status,
            preserve_start_time: config.preserve_start_time_across_reconnects,
            elapsed_time: config.elapsed_time,
            editor_name: config.editor_name.clone(),
            idle_image: config.idle_image.clone(),
            join_timeout: config.write_timeout() + config.read_timeout() + Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    NotStarted,
    Running,
    Stopped,
}

struct Session {
    client: PresenceClient,
    /// Latest activity from the host, sent or not.
    pending: Option<PresenceActivity>,
    /// What the peer is currently showing, as last acknowledged.
    last_sent: Option<PresenceActivity>,
    idle: bool,
    last_update: Instant,
    epoch_start: Option<i64>,
}

impl Session {
    /// `activity` with the elapsed-time anchor applied.
    fn stamped(&self, activity: &PresenceActivity, settings: &SessionSettings) -> PresenceActivity {
        let mut activity = activity.clone();
        if !settings.elapsed_time {
            activity.start_time = 0;
        } else if activity.start_time == 0 {
            activity.start_time = self.epoch_start.unwrap_or(0);
        }
        activity
    }

    fn idle_activity(&self, settings: &SessionSettings) -> PresenceActivity {
        let start_time = self
            .pending
            .as_ref()
            .map(|pending| self.stamped(pending, settings).start_time)
            .unwrap_or_else(|| {
                if settings.elapsed_time {
                    self.epoch_start.unwrap_or(0)
                } else {
                    0
                }
            });

        PresenceActivity {
            details: IDLE_DETAILS.to_string(),
            large_image: settings.idle_image.clone(),
            large_text: settings.editor_name.clone(),
            start_time,
            ..Default::default()
        }
    }

    /// Ships whatever the peer should be showing right now. Used after a
    /// (re)connect and after the epoch is reset.
    fn push_current(&mut self, settings: &SessionSettings) {
        self.last_sent = None;

        if self.idle {
            let idle = self.idle_activity(settings);
            if let Err(err) = self.client.set_idle_status(Some(&idle)) {
                tracing::debug!(error = %err, "Failed to push idle activity");
            }
            return;
        }

        let outgoing = match &self.pending {
            Some(pending) => self.stamped(pending, settings),
            None => return,
        };
        match self.client.set_presence(&outgoing) {
            Ok(()) => self.last_sent = Some(outgoing),
            Err(err) => tracing::debug!(error = %err, "Failed to push pending activity"),
        }
    }
}

struct Shared {
    session: Mutex<Session>,
    stop: StopSignal,
    settings: SessionSettings,
    clock: fn() -> i64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Like [`lock`](Self::lock), but gives up once `deadline` has passed.
    fn lock_before(&self, deadline: Instant) -> Option<MutexGuard<'_, Session>> {
        loop {
            match self.session.try_lock() {
                Ok(session) => return Some(session),
                Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) if Instant::now() < deadline => {
                    thread::sleep(JOIN_POLL_INTERVAL)
                }
                Err(TryLockError::WouldBlock) => return None,
            }
        }
    }

    /// One full slot scan. The lock is released between slots and the scan
    /// ends early once stop fires.
    fn try_connect(&self) -> bool {
        for slot in 0..IPC_SLOT_COUNT {
            if self.stop.is_stopped() {
                return false;
            }
            let mut session = self.lock();
            if let Ok(slot) = session.client.connect_slot(self.settings.client_id, slot) {
                self.on_connected(&mut session, slot);
                return true;
            }
        }
        false
    }

    fn on_connected(&self, session: &mut Session, slot: u8) {
        if session.epoch_start.is_none() || !self.settings.preserve_start_time {
            session.epoch_start = Some((self.clock)());
        }
        tracing::debug!(slot, epoch_start = ?session.epoch_start, "Presence epoch established");
        session.push_current(&self.settings);
    }

    /// One heartbeat tick. Returns whether the channel is still up.
    fn heartbeat(&self) -> bool {
        let mut session = self.lock();
        if let Err(err) = session.client.update() {
            tracing::debug!(error = %err, "Heartbeat failed");
        }
        let connected = session.client.is_connected();
        if !connected {
            session.last_sent = None;
        }
        connected
    }

    fn idle_tick(&self) {
        if self.settings.hide_idle_status {
            return;
        }

        let mut session = self.lock();
        if session.idle || session.last_update.elapsed() < self.settings.idle_threshold {
            return;
        }

        session.idle = true;
        session.last_sent = None;
        tracing::info!(
            idle_for_secs = session.last_update.elapsed().as_secs(),
            "Editor idle; switching to idle presence"
        );

        if session.client.is_connected() {
            let idle = session.idle_activity(&self.settings);
            if let Err(err) = session.client.set_idle_status(Some(&idle)) {
                tracing::debug!(error = %err, "Failed to set idle presence");
            }
        }
    }
}

pub struct SessionController {
    shared: Arc<Shared>,
    lifecycle: Lifecycle,
    threads: Vec<JoinHandle<()>>,
}

impl SessionController {
    pub fn new(config: &PresenceConfig, connector: Box<dyn Connector>) -> Self {
        Self::with_error_callback(config, connector, default_error_callback())
    }

    pub fn with_error_callback(
        config: &PresenceConfig,
        connector: Box<dyn Connector>,
        on_error: ErrorCallback,
    ) -> Self {
        let client = PresenceClient::new(connector)
            .with_timeouts(config.write_timeout(), config.read_timeout())
            .with_ping_every(config.ping_every_ticks)
            .with_error_callback(on_error);
        Self::from_client(SessionSettings::from_config(config), client)
    }

    /// Controller over the platform's default local-socket transport.
    #[cfg(unix)]
    pub fn with_default_transport(config: &PresenceConfig) -> Self {
        Self::new(
            config,
            Box::new(crate::transport::UnixSocketConnector::from_env()),
        )
    }

    pub fn from_client(settings: SessionSettings, client: PresenceClient) -> Self {
        Self::build(settings, client, epoch_now)
    }

    fn build(settings: SessionSettings, client: PresenceClient, clock: fn() -> i64) -> Self {
        let session = Session {
            client,
            pending: None,
            last_sent: None,
            idle: false,
            last_update: Instant::now(),
            epoch_start: None,
        };
        Self {
            shared: Arc::new(Shared {
                session: Mutex::new(session),
                stop: StopSignal::new(),
                settings,
                clock,
            }),
            lifecycle: Lifecycle::NotStarted,
            threads: Vec::new(),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Spawns the heartbeat and idle threads. Calling it again while running
    /// is a no-op; a stopped controller cannot be restarted.
    pub fn start(&mut self) -> Result<(), PresenceError> {
        match self.lifecycle {
            Lifecycle::Running => return Ok(()),
            Lifecycle::Stopped => {
                tracing::warn!("Ignoring start on a stopped presence session");
                return Ok(());
            }
            Lifecycle::NotStarted => {}
        }

        self.shared.lock().last_update = Instant::now();

        let heartbeat = spawn_loop("presence-heartbeat", &self.shared, run_heartbeat)?;
        self.threads.push(heartbeat);
        match spawn_loop("presence-idle", &self.shared, run_idle_monitor) {
            Ok(idle) => self.threads.push(idle),
            Err(err) => {
                self.close();
                return Err(err);
            }
        }

        self.lifecycle = Lifecycle::Running;
        tracing::info!("Presence session started");
        Ok(())
    }

    /// Records `activity` as the latest state and sends it if it differs from
    /// what the peer shows.
    ///
    /// Returns `Ok(true)` when a frame was written, `Ok(false)` when nothing
    /// changed. While disconnected the activity is kept and shipped on the
    /// next successful connect; the call itself fails with
    /// [`PresenceError::NotConnected`].
    pub fn update(&self, activity: PresenceActivity) -> Result<bool, PresenceError> {
        let settings = &self.shared.settings;
        let mut session = self.shared.lock();
        session.last_update = Instant::now();
        session.pending = Some(activity);

        if session.idle {
            session.idle = false;
            session.last_sent = None;
            session.client.set_idle_status(None)?;
            tracing::info!("Editor active again; leaving idle presence");
        }

        let outgoing = match &session.pending {
            Some(pending) => session.stamped(pending, settings),
            None => return Ok(false),
        };
        if session.last_sent.as_ref() == Some(&outgoing) {
            return Ok(false);
        }

        session.client.set_presence(&outgoing)?;
        session.last_sent = Some(outgoing);
        Ok(true)
    }

    /// Starts a new elapsed-time epoch and re-sends the current activity.
    pub fn reset_elapsed(&self) {
        let mut session = self.shared.lock();
        session.epoch_start = Some((self.shared.clock)());
        if session.client.is_connected() {
            session.push_current(&self.shared.settings);
        }
    }

    pub fn check_connection(&self) -> Result<(), PresenceError> {
        self.shared.lock().client.check_connection()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().client.is_connected()
    }

    pub fn is_idle(&self) -> bool {
        self.shared.lock().idle
    }

    /// Stops both threads, then clears the activity and closes the channel.
    /// Waiting for the threads and for the session lock shares one
    /// `join_timeout` deadline. Idempotent.
    pub fn close(&mut self) {
        if self.lifecycle == Lifecycle::Stopped {
            return;
        }
        self.shared.stop.stop();

        let deadline = Instant::now() + self.shared.settings.join_timeout;
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("presence").to_string();
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL_INTERVAL);
            }
            if !handle.is_finished() {
                tracing::warn!(thread = %name, "Presence thread did not stop in time; detaching");
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!(thread = %name, "Presence thread panicked");
            }
        }

        match self.shared.lock_before(deadline) {
            Some(mut session) => session.client.close(),
            // The detached thread drops its handle when it finishes; the
            // client then closes itself.
            None => tracing::warn!("Presence session still busy; skipping activity clear"),
        }
        self.lifecycle = Lifecycle::Stopped;
        tracing::info!("Presence session closed");
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_loop(
    name: &str,
    shared: &Arc<Shared>,
    body: fn(&Shared),
) -> Result<JoinHandle<()>, PresenceError> {
    let shared = Arc::clone(shared);
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || body(&shared))
        .map_err(|source| PresenceError::Io {
            context: "spawn presence thread",
            source,
        })
}

fn run_heartbeat(shared: &Shared) {
    let settings = &shared.settings;
    while !shared.stop.is_stopped() {
        let retries = match connect_with_backoff(
            || shared.try_connect(),
            settings.reconnect_backoff,
            &shared.stop,
        ) {
            Some(retries) => retries,
            None => return,
        };
        tracing::info!(retries, "Presence peer connected");

        loop {
            if shared.stop.sleep(settings.heartbeat_interval) {
                return;
            }
            if !shared.heartbeat() {
                tracing::info!("Presence peer disconnected; reconnecting");
                break;
            }
        }
    }
}

fn run_idle_monitor(shared: &Shared) {
    while !shared.stop.sleep(shared.settings.idle_check_interval) {
        shared.idle_tick();
    }
}

/// Calls `attempt` until it succeeds, sleeping `backoff` between failures.
/// Returns the number of failed attempts, or `None` once `stop` fires.
pub fn connect_with_backoff<F>(mut attempt: F, backoff: Duration, stop: &StopSignal) -> Option<u32>
where
    F: FnMut() -> bool,
{
    let mut retries = 0u32;
    loop {
        if stop.is_stopped() {
            return None;
        }
        if attempt() {
            return Some(retries);
        }

        retries = retries.saturating_add(1);
        if retries == 1 {
            tracing::info!(backoff_ms = backoff.as_millis() as u64, "Presence peer unavailable; retrying");
        } else {
            tracing::trace!(retries, "Presence peer still unavailable");
        }
        if stop.sleep(backoff) {
            return None;
        }
    }
}

fn default_error_callback() -> ErrorCallback {
    Arc::new(|message: &str| tracing::warn!(error = %message, "Presence error"))
}

fn epoch_now() -> i64 {
    chrono::Utc::now().timestamp()
}
