//! Collaborator contracts the tab worker is built against.
//!
//! Every browser-facing surface sits behind a trait so the worker can be
//! driven by the TCP bridge in production and by recording fakes in tests.

use async_trait::async_trait;
use scrobbler_proto::connectors::ConnectorRegistry;
use scrobbler_proto::options::OptionsManager;
use scrobbler_proto::protocol::{
    ActionView, ConnectorInfo, ControllerMode, ExtensionEvent, InjectResult, MenuItem, PageState,
    SongCorrection, SongInfo, TabId, TabMessage,
};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("browser is not connected")]
    Disconnected,
    #[error("browser did not answer {method} within {timeout_ms} ms")]
    Timeout {
        method: &'static str,
        timeout_ms: u64,
    },
    #[error("bridge channel closed")]
    ChannelClosed,
    #[error("browser reported an error: {0}")]
    Remote(String),
    #[error("unexpected reply to {method}: {source}")]
    BadReply {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("no song is playing")]
    NoSong,
    #[error("connector is disabled")]
    Disabled,
}

// ── browser surface ───────────────────────────────────────────────────────────

#[async_trait]
pub trait ConnectorResolver: Send + Sync {
    async fn find_connector(&self, url: &str) -> Option<ConnectorInfo>;
}

#[async_trait]
pub trait Injector: Send + Sync {
    /// `Matched` for a page that now runs the connector, `Injected` only when
    /// an earlier injection into the same document is still live.
    async fn inject(
        &self,
        tab_id: TabId,
        connector: &ConnectorInfo,
    ) -> Result<InjectResult, BridgeError>;
}

/// The browser-wide icon/badge.
#[async_trait]
pub trait BrowserAction: Send + Sync {
    async fn update(&self, tab_id: TabId, view: ActionView) -> Result<(), BridgeError>;
    async fn update_love(&self, tab_id: TabId, is_loved: bool) -> Result<(), BridgeError>;
    async fn reset(&self) -> Result<(), BridgeError>;
}

#[async_trait]
pub trait Browser: Send + Sync {
    async fn current_tab_id(&self) -> Result<TabId, BridgeError>;
    async fn send_to_tab(&self, tab_id: TabId, message: TabMessage) -> Result<(), BridgeError>;
    async fn remove_all_menu_items(&self) -> Result<(), BridgeError>;
    async fn create_menu_item(&self, item: MenuItem) -> Result<(), BridgeError>;
    async fn notify(&self, event: ExtensionEvent) -> Result<(), BridgeError>;
}

#[async_trait]
pub trait OptionsStore: Send + Sync {
    async fn is_connector_enabled(&self, connector: &ConnectorInfo) -> bool;
    async fn set_connector_enabled(
        &self,
        connector: &ConnectorInfo,
        enabled: bool,
    ) -> anyhow::Result<()>;
}

#[async_trait]
impl ConnectorResolver for ConnectorRegistry {
    async fn find_connector(&self, url: &str) -> Option<ConnectorInfo> {
        self.find_for_url(url).cloned()
    }
}

#[async_trait]
impl OptionsStore for OptionsManager {
    async fn is_connector_enabled(&self, connector: &ConnectorInfo) -> bool {
        OptionsManager::is_connector_enabled(self, &connector.id).await
    }

    async fn set_connector_enabled(
        &self,
        connector: &ConnectorInfo,
        enabled: bool,
    ) -> anyhow::Result<()> {
        OptionsManager::set_connector_enabled(self, &connector.id, enabled).await
    }
}

// ── controllers ───────────────────────────────────────────────────────────────

/// Per-tab state machine for one connector instance.
#[async_trait]
pub trait Controller: Send + Sync {
    fn connector(&self) -> &ConnectorInfo;
    fn mode(&self) -> ControllerMode;
    fn is_enabled(&self) -> bool;
    fn set_enabled(&mut self, enabled: bool);
    fn current_song(&self) -> Option<SongInfo>;
    /// Page reported a new player state.
    fn on_state_changed(&mut self, state: PageState);
    fn correct_song(&mut self, correction: SongCorrection);
    async fn toggle_love(&mut self, is_loved: bool) -> Result<(), ControllerError>;
    fn skip_current_song(&mut self);
    fn reset_song_data(&mut self);
    /// Teardown.  No notices are emitted afterwards.
    fn finish(&mut self);
}

pub trait ControllerFactory: Send + Sync {
    fn create(
        &self,
        tab_id: TabId,
        connector: ConnectorInfo,
        enabled: bool,
        events: ControllerEvents,
    ) -> Box<dyn Controller>;
}

/// Icon contract derived from a controller.
pub fn action_view(controller: &dyn Controller) -> ActionView {
    let song = controller.current_song();
    ActionView {
        mode: controller.mode(),
        connector_label: controller.connector().label.clone(),
        song_label: song.as_ref().and_then(|s| s.label()),
        is_loved: song.map(|s| s.is_loved).unwrap_or(false),
    }
}

// ── controller → worker notices ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum NoticeKind {
    ModeChanged(ControllerMode),
    SongUpdated(Option<SongInfo>),
}

/// A notice tagged with the controller instance that raised it, so the
/// worker can drop notices from controllers it already replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerNotice {
    pub tab_id: TabId,
    pub instance: u64,
    pub kind: NoticeKind,
}

/// Listener handed to a controller at construction time.
#[derive(Debug, Clone)]
pub struct ControllerEvents {
    tab_id: TabId,
    instance: u64,
    tx: mpsc::UnboundedSender<ControllerNotice>,
}

impl ControllerEvents {
    pub fn new(tab_id: TabId, instance: u64, tx: mpsc::UnboundedSender<ControllerNotice>) -> Self {
        Self {
            tab_id,
            instance,
            tx,
        }
    }

    pub fn tab_id(&self) -> TabId {
        self.tab_id
    }

    pub fn mode_changed(&self, mode: ControllerMode) {
        self.send(NoticeKind::ModeChanged(mode));
    }

    pub fn song_updated(&self, song: Option<SongInfo>) {
        self.send(NoticeKind::SongUpdated(song));
    }

    fn send(&self, kind: NoticeKind) {
        // Worker gone means we are shutting down.
        let _ = self.tx.send(ControllerNotice {
            tab_id: self.tab_id,
            instance: self.instance,
            kind,
        });
    }
}
