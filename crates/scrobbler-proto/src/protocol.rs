use serde::{Deserialize, Serialize};
use std::fmt;

/// Current bridge protocol version.  Bump this when the wire format changes
/// in a breaking way.  The browser shim sends its version in `Hello` and the
/// daemon refuses to talk to an incompatible one.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound for a single frame body.  Anything larger is treated as a
/// corrupt stream.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

// ── identifiers ───────────────────────────────────────────────────────────────

/// Browser tab identifier.  Serialized as the bare number the browser uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub i32);

impl TabId {
    /// Sentinel for "no tab".  Matches `browser.tabs.TAB_ID_NONE`.
    pub const NO_TAB: TabId = TabId(-1);

    pub fn is_none(self) -> bool {
        self == Self::NO_TAB
    }
}

impl Default for TabId {
    fn default() -> Self {
        Self::NO_TAB
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Site adapter descriptor.  Immutable once loaded from the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorInfo {
    pub id: String,
    pub label: String,
    /// WebExtension-style match patterns, e.g. `*://music.example.com/*`.
    #[serde(default)]
    pub matches: Vec<String>,
    /// Content script the browser injects for this connector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub js: Option<String>,
}

// ── controller state ──────────────────────────────────────────────────────────

/// State of a per-tab controller.
///
/// The worker only cares about the active/inactive split (see
/// [`ControllerMode::is_active`]); the individual values drive the icon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ControllerMode {
    /// Connector attached, nothing recognised yet.
    #[default]
    Base,
    /// Song info is being resolved.
    Loading,
    Playing,
    Paused,
    /// Something plays but the metadata is not usable.
    Unknown,
    /// The current song is filtered out.
    Ignored,
    Scrobbled,
    Skipped,
    /// Connector switched off by the user.
    Disabled,
    Err,
    Unsupported,
    /// Scrobbling this page is disallowed by the connector.
    Disallowed,
}

impl ControllerMode {
    /// True when the controller represents playback worth surfacing in the
    /// browser-wide action.
    pub fn is_active(self) -> bool {
        !self.is_inactive()
    }

    /// Disabled, no song, or nothing the user can act on.
    pub fn is_inactive(self) -> bool {
        matches!(
            self,
            ControllerMode::Base
                | ControllerMode::Disabled
                | ControllerMode::Unsupported
                | ControllerMode::Disallowed
        )
    }
}

/// Outcome of asking the browser to inject a connector into a tab.
///
/// A page that has no connector script yet is answered `Matched` once the
/// script is in place; that is the only answer that gets the tab a
/// controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InjectResult {
    /// The script from an earlier injection is still running in the page.
    /// The tab keeps whatever controller it has.
    Injected,
    /// The connector applies and its script is now in place, whether it was
    /// injected by this call or found already loaded.  The daemon attaches a
    /// fresh controller and sends the tab `EVENT_READY`.
    Matched,
    /// No connector applies to this URL.
    NoMatch,
}

// ── song data ─────────────────────────────────────────────────────────────────

/// Raw player state scraped by a content script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageState {
    pub artist: Option<String>,
    pub track: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    /// Seconds.
    pub duration: Option<f64>,
    /// Seconds.
    pub current_time: Option<f64>,
    pub is_playing: bool,
    pub unique_id: Option<String>,
    pub track_art: Option<String>,
}

impl PageState {
    pub fn has_song(&self) -> bool {
        non_empty(&self.artist) && non_empty(&self.track)
    }
}

/// Metadata the user typed in to replace what the page reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SongCorrection {
    pub artist: Option<String>,
    pub track: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
}

/// Snapshot of a controller's current song, as shown to the popup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongInfo {
    pub artist: Option<String>,
    pub track: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub duration: Option<f64>,
    pub unique_id: Option<String>,
    pub track_art: Option<String>,
    pub connector_label: String,
    pub is_loved: bool,
    pub is_skipped: bool,
    pub is_scrobbled: bool,
    pub is_corrected_by_user: bool,
}

impl SongInfo {
    pub fn is_valid(&self) -> bool {
        non_empty(&self.artist) && non_empty(&self.track)
    }

    /// "Artist - Track", or `None` until both are known.
    pub fn label(&self) -> Option<String> {
        match (&self.artist, &self.track) {
            (Some(artist), Some(track)) if self.is_valid() => {
                Some(format!("{} - {}", artist, track))
            }
            _ => None,
        }
    }
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false)
}

// ── extension messages ────────────────────────────────────────────────────────

/// Request/response messages sent by content scripts and the popup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Request {
    /// Tab-independent: always answers with the active tab id.
    #[serde(rename = "REQUEST_ACTIVE_TABID")]
    ActiveTabId,
    #[serde(rename = "REQUEST_GET_SONG")]
    GetSong,
    #[serde(rename = "REQUEST_CORRECT_SONG")]
    CorrectSong(SongCorrection),
    #[serde(rename = "REQUEST_TOGGLE_LOVE", rename_all = "camelCase")]
    ToggleLove { is_loved: bool },
    #[serde(rename = "REQUEST_SKIP_SONG")]
    SkipSong,
    #[serde(rename = "REQUEST_RESET_SONG")]
    ResetSong,
}

impl Request {
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::ActiveTabId => "REQUEST_ACTIVE_TABID",
            Request::GetSong => "REQUEST_GET_SONG",
            Request::CorrectSong(_) => "REQUEST_CORRECT_SONG",
            Request::ToggleLove { .. } => "REQUEST_TOGGLE_LOVE",
            Request::SkipSong => "REQUEST_SKIP_SONG",
            Request::ResetSong => "REQUEST_RESET_SONG",
        }
    }
}

/// Reply to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Response {
    ActiveTabId(TabId),
    Song(Option<SongInfo>),
    /// Handled, nothing to return.
    Ok,
    /// No controller for the tab, or the controller rejected the request.
    Unavailable,
    Error(String),
}

/// Fire-and-forget events streamed over a content script's port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PortEvent {
    #[serde(rename = "EVENT_STATE_CHANGED")]
    StateChanged(PageState),
}

/// Messages the background sends into a tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TabMessage {
    #[serde(rename = "EVENT_READY")]
    Ready,
}

/// Notifications for other parts of the extension (popup, options page).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ExtensionEvent {
    #[serde(rename = "EVENT_SONG_UPDATED", rename_all = "camelCase")]
    SongUpdated {
        tab_id: TabId,
        song: Option<SongInfo>,
    },
    #[serde(rename = "EVENT_CONNECTOR_ACTIVATED", rename_all = "camelCase")]
    ConnectorActivated {
        tab_id: TabId,
        connector: ConnectorInfo,
    },
}

/// Keyboard shortcuts registered by the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BrowserCommand {
    ToggleConnector,
    LoveSong,
    UnloveSong,
}

impl BrowserCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserCommand::ToggleConnector => "toggle-connector",
            BrowserCommand::LoveSong => "love-song",
            BrowserCommand::UnloveSong => "unlove-song",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "toggle-connector" => Some(BrowserCommand::ToggleConnector),
            "love-song" => Some(BrowserCommand::LoveSong),
            "unlove-song" => Some(BrowserCommand::UnloveSong),
            _ => None,
        }
    }
}

// ── browser surface ───────────────────────────────────────────────────────────

/// What the browser action (icon, badge, title) should display for a tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionView {
    pub mode: ControllerMode,
    pub connector_label: String,
    pub song_label: Option<String>,
    pub is_loved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItem {
    pub id: String,
    pub title: String,
}

/// Calls the daemon makes into the browser shim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum BrowserCall {
    /// Replies with an [`InjectResult`].  `INJECTED` is reserved for pages
    /// still running the script from a previous call on the same document.
    Inject {
        tab_id: TabId,
        connector: ConnectorInfo,
    },
    CurrentTab,
    SendToTab {
        tab_id: TabId,
        message: TabMessage,
    },
    RemoveAllMenuItems,
    CreateMenuItem {
        item: MenuItem,
    },
    UpdateAction {
        tab_id: TabId,
        view: ActionView,
    },
    UpdateLove {
        tab_id: TabId,
        is_loved: bool,
    },
    ResetAction,
    Notify {
        event: ExtensionEvent,
    },
}

impl BrowserCall {
    pub fn method(&self) -> &'static str {
        match self {
            BrowserCall::Inject { .. } => "inject",
            BrowserCall::CurrentTab => "current_tab",
            BrowserCall::SendToTab { .. } => "send_to_tab",
            BrowserCall::RemoveAllMenuItems => "remove_all_menu_items",
            BrowserCall::CreateMenuItem { .. } => "create_menu_item",
            BrowserCall::UpdateAction { .. } => "update_action",
            BrowserCall::UpdateLove { .. } => "update_love",
            BrowserCall::ResetAction => "reset_action",
            BrowserCall::Notify { .. } => "notify",
        }
    }
}

/// Result of a [`BrowserCall`], reported back by the shim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    Ok {
        #[serde(default)]
        value: serde_json::Value,
    },
    Error {
        message: String,
    },
}

// ── bridge envelope ───────────────────────────────────────────────────────────

/// Frames sent by the browser shim to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FromBrowser {
    Hello { protocol_version: u32 },
    TabUpdated { tab_id: TabId, url: String },
    TabActivated { tab_id: TabId },
    TabRemoved { tab_id: TabId },
    Command { command: BrowserCommand },
    Request {
        request_id: u64,
        tab_id: TabId,
        request: Request,
    },
    PortMessage { tab_id: TabId, event: PortEvent },
    MenuClicked { item_id: String },
    CallResult { call_id: u64, result: CallOutcome },
}

/// Frames sent by the daemon to the browser shim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToBrowser {
    Welcome { protocol_version: u32 },
    Call { call_id: u64, call: BrowserCall },
    Response { request_id: u64, response: Response },
    Log { message: String },
}

/// Wrapper for socket communication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    FromBrowser(FromBrowser),
    ToBrowser(ToBrowser),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    /// Total length (header + body) of the first frame in `data`, or `None`
    /// until the whole frame has arrived.
    pub fn frame_len(data: &[u8]) -> Option<usize> {
        if data.len() < 4 {
            return None;
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            return None;
        }
        Some(4 + len)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len > MAX_FRAME_LEN {
            anyhow::bail!("Frame of {} bytes exceeds limit", len);
        }
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}
