//! Lifecycle management for the two listening sessions.
//!
//! Mode A is a broad passive scan accepting every advertisement; mode B is
//! a targeted watch of one selected peer. The modes are independent and
//! mutually exclusive by convention. Each active session is an explicit
//! owned object wrapping the backend's listening handle, so idempotent
//! stop and "stop everything regardless of what was active" fall out of
//! `Option::take` instead of ambient flags.
//!
//! The radio itself lives behind [`ScanBackend`]; platform binaries
//! implement it (NimBLE in `firmware-std`) and push the advertisements
//! they observe onto the shared [`crate::router::AdvChannel`].

/// Shared session status, as exposed to the display collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Scanning,
    Error,
    Unsupported,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Error => "error",
            Self::Unsupported => "unsupported",
        }
    }
}

/// Which listening mode is currently active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    None,
    BroadScan,
    TargetedWatch,
}

impl ScanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::BroadScan => "broad-scan",
            Self::TargetedWatch => "targeted-watch",
        }
    }
}

/// Why a session failed to start. Reported once through the shared error
/// state; never retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartError {
    /// The host has no usable scanning capability.
    Unsupported,
    PermissionDenied,
    AdapterUnavailable,
    /// Backend-specific failure outside the above.
    Failed,
}

impl StartError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unsupported => "scanning unsupported on this host",
            Self::PermissionDenied => "permission denied",
            Self::AdapterUnavailable => "adapter unavailable",
            Self::Failed => "session start failed",
        }
    }
}

/// Result of a targeted-watch start that did not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStart {
    Watching,
    /// The selection step ended without a peer (user cancelled or the
    /// selection window elapsed). Not an error; status returns to idle.
    SelectionCancelled,
}

/// Seam to the host radio. Handles own the underlying listening resources:
/// the backend must halt event delivery and deregister its callback when
/// the matching stop is called with the handle.
pub trait ScanBackend {
    /// Live broad-scan resource (thread + stop flag, RAII guard, ...).
    type ScanHandle;
    /// Live targeted-watch resource, including its cancellation signal.
    type WatchHandle;
    /// Identity of a selectable broadcasting peer.
    type Peer;

    /// Begin a broad passive scan accepting all advertisements.
    fn start_broad_scan(&mut self) -> Result<Self::ScanHandle, StartError>;

    /// Tear down a broad scan. Must synchronously halt delivery.
    fn stop_broad_scan(&mut self, handle: Self::ScanHandle);

    /// Pick one peer broadcasting the vendor identifier. `Ok(None)` is the
    /// user-cancellation-equivalent outcome and is not an error.
    fn select_peer(&mut self) -> Result<Option<Self::Peer>, StartError>;

    /// Begin a cancellable watch scoped to the selected peer.
    fn start_watch(&mut self, peer: Self::Peer) -> Result<Self::WatchHandle, StartError>;

    /// Cancel a targeted watch promptly.
    fn stop_watch(&mut self, handle: Self::WatchHandle);
}

/// An active broad passive scan (mode A). Owns the listening handle;
/// stopping consumes the session.
pub struct BroadScanSession<H> {
    handle: H,
}

impl<H> BroadScanSession<H> {
    fn new(handle: H) -> Self {
        Self { handle }
    }

    fn into_handle(self) -> H {
        self.handle
    }
}

/// An active targeted watch of a single peer (mode B).
pub struct TargetedWatchSession<H> {
    handle: H,
}

impl<H> TargetedWatchSession<H> {
    fn new(handle: H) -> Self {
        Self { handle }
    }

    fn into_handle(self) -> H {
        self.handle
    }
}

/// Owner of both session lifecycles, the shared status, and the last
/// start error.
pub struct SessionManager<B: ScanBackend> {
    backend: B,
    broad: Option<BroadScanSession<B::ScanHandle>>,
    watch: Option<TargetedWatchSession<B::WatchHandle>>,
    status: SessionStatus,
    last_error: Option<StartError>,
}

impl<B: ScanBackend> SessionManager<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            broad: None,
            watch: None,
            status: SessionStatus::Idle,
            last_error: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// The targeted watch is the more specific claim, so it wins if both
    /// sessions are somehow active (they are exclusive by convention).
    pub fn mode(&self) -> ScanMode {
        if self.watch.is_some() {
            ScanMode::TargetedWatch
        } else if self.broad.is_some() {
            ScanMode::BroadScan
        } else {
            ScanMode::None
        }
    }

    pub fn last_error(&self) -> Option<StartError> {
        self.last_error
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Start the broad passive scan. A no-op when it is already active.
    pub fn start_broad_scan(&mut self) -> Result<(), StartError> {
        if self.broad.is_some() {
            return Ok(());
        }
        match self.backend.start_broad_scan() {
            Ok(handle) => {
                self.broad = Some(BroadScanSession::new(handle));
                self.status = SessionStatus::Scanning;
                self.last_error = None;
                log::info!("broad scan started");
                Ok(())
            }
            Err(e) => {
                self.record_failure(e);
                Err(e)
            }
        }
    }

    /// Stop the broad scan. Idempotent; safe when already inactive.
    pub fn stop_broad_scan(&mut self) {
        if let Some(session) = self.broad.take() {
            self.backend.stop_broad_scan(session.into_handle());
            log::info!("broad scan stopped");
        }
        self.refresh_status();
    }

    /// Run the peer selection and, when a peer is chosen, start a watch
    /// scoped to it. A cancelled selection resets to idle silently.
    pub fn start_targeted_watch(&mut self) -> Result<WatchStart, StartError> {
        if self.watch.is_some() {
            return Ok(WatchStart::Watching);
        }
        let peer = match self.backend.select_peer() {
            Ok(Some(peer)) => peer,
            Ok(None) => {
                log::info!("peer selection cancelled");
                self.refresh_status();
                return Ok(WatchStart::SelectionCancelled);
            }
            Err(e) => {
                self.record_failure(e);
                return Err(e);
            }
        };
        match self.backend.start_watch(peer) {
            Ok(handle) => {
                self.watch = Some(TargetedWatchSession::new(handle));
                self.status = SessionStatus::Scanning;
                self.last_error = None;
                log::info!("targeted watch started");
                Ok(WatchStart::Watching)
            }
            Err(e) => {
                self.record_failure(e);
                Err(e)
            }
        }
    }

    /// Cancel the targeted watch. Idempotent; safe when already inactive.
    pub fn stop_targeted_watch(&mut self) {
        if let Some(session) = self.watch.take() {
            self.backend.stop_watch(session.into_handle());
            log::info!("targeted watch stopped");
        }
        self.refresh_status();
    }

    /// Unconditional cleanup: stop whichever sessions are active and reset
    /// the shared status to idle, clearing any recorded start error.
    pub fn stop_all(&mut self) {
        if let Some(session) = self.broad.take() {
            self.backend.stop_broad_scan(session.into_handle());
            log::info!("broad scan stopped");
        }
        if let Some(session) = self.watch.take() {
            self.backend.stop_watch(session.into_handle());
            log::info!("targeted watch stopped");
        }
        self.status = SessionStatus::Idle;
        self.last_error = None;
    }

    fn record_failure(&mut self, e: StartError) {
        self.status = match e {
            StartError::Unsupported => SessionStatus::Unsupported,
            _ => SessionStatus::Error,
        };
        self.last_error = Some(e);
        log::error!("session start failed: {}", e.as_str());
    }

    fn refresh_status(&mut self) {
        self.status = if self.broad.is_some() || self.watch.is_some() {
            SessionStatus::Scanning
        } else {
            SessionStatus::Idle
        };
    }
}
