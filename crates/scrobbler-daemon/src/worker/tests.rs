use super::*;

use std::collections::{BTreeSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use scrobbler_proto::protocol::{ActionView, BrowserCall, MenuItem, PageState, SongCorrection};

use crate::controller::PageControllerFactory;

// ── fakes ─────────────────────────────────────────────────────────────────────

fn alpha() -> ConnectorInfo {
    ConnectorInfo {
        id: "alpha".to_string(),
        label: "Alpha".to_string(),
        matches: vec!["*://alpha.test/*".to_string()],
        js: None,
    }
}

fn beta() -> ConnectorInfo {
    ConnectorInfo {
        id: "beta".to_string(),
        label: "Beta".to_string(),
        matches: vec!["*://beta.test/*".to_string()],
        js: None,
    }
}

const ALPHA_URL: &str = "https://alpha.test/player";
const BETA_URL: &str = "https://beta.test/listen";
const PLAIN_URL: &str = "https://example.org/";

struct FakeResolver;

#[async_trait]
impl ConnectorResolver for FakeResolver {
    async fn find_connector(&self, url: &str) -> Option<ConnectorInfo> {
        if url.starts_with("https://alpha.test/") {
            Some(alpha())
        } else if url.starts_with("https://beta.test/") {
            Some(beta())
        } else {
            None
        }
    }
}

/// Answers injections from a script, `Matched` once the script runs out.
#[derive(Default)]
struct ScriptedInjector {
    script: Mutex<VecDeque<InjectResult>>,
    calls: Mutex<Vec<TabId>>,
}

impl ScriptedInjector {
    fn push(&self, result: InjectResult) {
        self.script.lock().unwrap().push_back(result);
    }
}

#[async_trait]
impl Injector for ScriptedInjector {
    async fn inject(
        &self,
        tab_id: TabId,
        _connector: &ConnectorInfo,
    ) -> Result<InjectResult, BridgeError> {
        self.calls.lock().unwrap().push(tab_id);
        Ok(self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(InjectResult::Matched))
    }
}

/// Records every browser-facing call in order.
#[derive(Default)]
struct RecordingBrowser {
    current_tab: Mutex<TabId>,
    calls: Mutex<Vec<BrowserCall>>,
}

impl RecordingBrowser {
    fn calls(&self) -> Vec<BrowserCall> {
        self.calls.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, call: BrowserCall) -> Result<(), BridgeError> {
        self.calls.lock().unwrap().push(call);
        Ok(())
    }

    fn menu_titles(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BrowserCall::CreateMenuItem { item } => Some(item.title),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Browser for RecordingBrowser {
    async fn current_tab_id(&self) -> Result<TabId, BridgeError> {
        Ok(*self.current_tab.lock().unwrap())
    }

    async fn send_to_tab(&self, tab_id: TabId, message: TabMessage) -> Result<(), BridgeError> {
        self.record(BrowserCall::SendToTab { tab_id, message })
    }

    async fn remove_all_menu_items(&self) -> Result<(), BridgeError> {
        self.record(BrowserCall::RemoveAllMenuItems)
    }

    async fn create_menu_item(&self, item: MenuItem) -> Result<(), BridgeError> {
        self.record(BrowserCall::CreateMenuItem { item })
    }

    async fn notify(&self, event: ExtensionEvent) -> Result<(), BridgeError> {
        self.record(BrowserCall::Notify { event })
    }
}

#[async_trait]
impl BrowserAction for RecordingBrowser {
    async fn update(&self, tab_id: TabId, view: ActionView) -> Result<(), BridgeError> {
        self.record(BrowserCall::UpdateAction { tab_id, view })
    }

    async fn update_love(&self, tab_id: TabId, is_loved: bool) -> Result<(), BridgeError> {
        self.record(BrowserCall::UpdateLove { tab_id, is_loved })
    }

    async fn reset(&self) -> Result<(), BridgeError> {
        self.record(BrowserCall::ResetAction)
    }
}

#[derive(Default)]
struct FakeOptions {
    disabled: Mutex<BTreeSet<String>>,
}

#[async_trait]
impl OptionsStore for FakeOptions {
    async fn is_connector_enabled(&self, connector: &ConnectorInfo) -> bool {
        !self.disabled.lock().unwrap().contains(&connector.id)
    }

    async fn set_connector_enabled(
        &self,
        connector: &ConnectorInfo,
        enabled: bool,
    ) -> anyhow::Result<()> {
        let mut disabled = self.disabled.lock().unwrap();
        if enabled {
            disabled.remove(&connector.id);
        } else {
            disabled.insert(connector.id.clone());
        }
        Ok(())
    }
}

// ── harness ───────────────────────────────────────────────────────────────────

struct Harness {
    worker: TabWorker,
    notices: mpsc::UnboundedReceiver<ControllerNotice>,
    browser: Arc<RecordingBrowser>,
    injector: Arc<ScriptedInjector>,
    options: Arc<FakeOptions>,
}

impl Harness {
    fn new() -> Self {
        let browser = Arc::new(RecordingBrowser::default());
        let injector = Arc::new(ScriptedInjector::default());
        let options = Arc::new(FakeOptions::default());
        let collab = Collaborators {
            resolver: Arc::new(FakeResolver),
            injector: injector.clone(),
            action: browser.clone(),
            browser: browser.clone(),
            options: options.clone(),
            controllers: Arc::new(PageControllerFactory),
        };
        let (notice_tx, notices) = mpsc::unbounded_channel();

        Self {
            worker: TabWorker::new(collab, notice_tx),
            notices,
            browser,
            injector,
            options,
        }
    }

    /// Feed queued controller notices back into the worker.
    async fn settle(&mut self) {
        while let Ok(notice) = self.notices.try_recv() {
            self.worker.process_controller_notice(notice).await;
        }
    }

    async fn focus(&mut self, tab_id: i32) {
        self.worker.process_tab_change(TabId(tab_id)).await;
        self.settle().await;
    }

    async fn open(&mut self, tab_id: i32, url: &str) {
        self.worker.process_tab_update(TabId(tab_id), url).await;
        self.settle().await;
    }

    async fn play(&mut self, tab_id: i32, artist: &str, track: &str) {
        let state = PageState {
            artist: Some(artist.to_string()),
            track: Some(track.to_string()),
            is_playing: true,
            ..Default::default()
        };
        self.worker
            .process_port_message(TabId(tab_id), PortEvent::StateChanged(state));
        self.settle().await;
    }

    fn instance(&self, tab_id: i32) -> Option<u64> {
        self.worker
            .controllers
            .get(&TabId(tab_id))
            .map(|entry| entry.instance)
    }

    fn menu_action_for(&self, wanted: MenuAction) -> Option<String> {
        self.worker
            .menu_actions
            .iter()
            .find(|(_, action)| **action == wanted)
            .map(|(id, _)| id.clone())
    }

    /// The active tab is unset, a tab in an active mode, or the current tab
    /// when that tab has a controller.
    fn assert_active_tab_invariant(&self) {
        let w = &self.worker;
        let active = w.active_tab_id;
        if active.is_none() {
            return;
        }
        let mode = w
            .mode_of(active)
            .unwrap_or_else(|| panic!("active tab {} has no controller", active));
        assert!(
            mode.is_active() || active == w.current_tab_id,
            "active tab {} is inactive ({:?}) and not current",
            active,
            mode
        );
    }
}

// ── injection ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_matched_injection_takes_over_action() {
    let mut h = Harness::new();
    h.focus(1).await;
    h.browser.clear();

    h.open(1, ALPHA_URL).await;

    assert_eq!(h.worker.controllers.len(), 1);
    assert_eq!(h.worker.active_tab_id, TabId(1));

    let calls = h.browser.calls();
    assert!(calls.contains(&BrowserCall::SendToTab {
        tab_id: TabId(1),
        message: TabMessage::Ready,
    }));
    assert!(calls.contains(&BrowserCall::Notify {
        event: ExtensionEvent::ConnectorActivated {
            tab_id: TabId(1),
            connector: alpha(),
        },
    }));
    assert!(calls.iter().any(|call| matches!(
        call,
        BrowserCall::UpdateAction { tab_id, view } if *tab_id == TabId(1) && view.connector_label == "Alpha"
    )));
    assert_eq!(
        h.browser.menu_titles(),
        vec![
            "Disable Alpha connector".to_string(),
            "Disable connector until tab is closed".to_string(),
        ]
    );
    h.assert_active_tab_invariant();
}

#[tokio::test]
async fn test_repeated_injection_keeps_controller() {
    let mut h = Harness::new();
    h.focus(1).await;
    h.open(1, ALPHA_URL).await;
    let first = h.instance(1);

    h.injector.push(InjectResult::Injected);
    h.browser.clear();
    h.open(1, ALPHA_URL).await;

    assert_eq!(h.instance(1), first);
    assert!(h.browser.calls().is_empty());
}

#[tokio::test]
async fn test_fresh_page_gets_controller() {
    let mut h = Harness::new();
    h.focus(1).await;

    // First sight of the page: the script goes in and the shim says Matched.
    h.injector.push(InjectResult::Matched);
    h.open(1, ALPHA_URL).await;
    h.play(1, "Artist", "Track").await;

    assert_eq!(h.worker.controllers.len(), 1);
    assert_eq!(h.worker.active_tab_id, TabId(1));
    assert_eq!(h.worker.mode_of(TabId(1)), Some(ControllerMode::Playing));
}

#[tokio::test]
async fn test_matched_again_replaces_controller() {
    let mut h = Harness::new();
    h.focus(1).await;
    h.open(1, ALPHA_URL).await;
    let first = h.instance(1);

    h.open(1, BETA_URL).await;

    assert_eq!(h.worker.controllers.len(), 1);
    assert_ne!(h.instance(1), first);
    assert_eq!(
        h.worker.controllers[&TabId(1)].controller.connector().id,
        "beta"
    );
}

#[tokio::test]
async fn test_navigating_away_unloads_controller() {
    let mut h = Harness::new();
    h.focus(1).await;
    h.open(1, ALPHA_URL).await;
    h.browser.clear();

    h.open(1, PLAIN_URL).await;

    assert!(h.worker.controllers.is_empty());
    assert_eq!(h.worker.active_tab_id, TabId::NO_TAB);
    let calls = h.browser.calls();
    assert!(calls.contains(&BrowserCall::ResetAction));
    assert!(calls.contains(&BrowserCall::RemoveAllMenuItems));
    assert!(h.worker.menu_actions.is_empty());
}

#[tokio::test]
async fn test_injector_no_match_unloads_controller() {
    let mut h = Harness::new();
    h.focus(1).await;
    h.open(1, ALPHA_URL).await;

    h.injector.push(InjectResult::NoMatch);
    let result = h
        .worker
        .try_to_inject_connector(TabId(1), Some(alpha()))
        .await
        .unwrap();

    assert_eq!(result, InjectResult::NoMatch);
    assert!(h.worker.controllers.is_empty());
    assert_eq!(h.worker.active_tab_id, TabId::NO_TAB);
}

#[tokio::test]
async fn test_plain_page_never_calls_injector() {
    let mut h = Harness::new();
    h.open(4, PLAIN_URL).await;

    assert!(h.injector.calls.lock().unwrap().is_empty());
    assert!(h.worker.controllers.is_empty());
}

#[tokio::test]
async fn test_disabled_connector_starts_disabled() {
    let mut h = Harness::new();
    h.options.disabled.lock().unwrap().insert("alpha".to_string());
    h.focus(1).await;
    h.open(1, ALPHA_URL).await;

    let entry = &h.worker.controllers[&TabId(1)];
    assert!(!entry.controller.is_enabled());
    assert_eq!(entry.controller.mode(), ControllerMode::Disabled);
    assert_eq!(h.browser.menu_titles()[0], "Enable Alpha connector");
}

// ── active tab election ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_playing_tab_keeps_action_when_user_switches_tabs() {
    let mut h = Harness::new();
    h.focus(1).await;
    h.open(1, ALPHA_URL).await;
    h.play(1, "Artist", "Track").await;
    assert_eq!(h.worker.active_tab_id, TabId(1));

    h.focus(2).await;
    h.browser.clear();
    h.open(2, BETA_URL).await;

    assert_eq!(h.worker.current_tab_id, TabId(2));
    assert_eq!(h.worker.active_tab_id, TabId(1));
    assert!(!h
        .browser
        .calls()
        .iter()
        .any(|call| matches!(call, BrowserCall::UpdateAction { tab_id, .. } if *tab_id == TabId(2))));

    // Tab 2's menu still offers to toggle the playing tab's connector.
    assert!(h
        .menu_action_for(MenuAction::ToggleConnector { tab_id: TabId(1) })
        .is_some());
    assert!(h
        .menu_action_for(MenuAction::ToggleConnector { tab_id: TabId(2) })
        .is_some());
    assert_eq!(
        h.browser.menu_titles(),
        vec![
            "Disable Beta connector".to_string(),
            "Disable connector until tab is closed".to_string(),
            "Disable Alpha connector".to_string(),
        ]
    );
    h.assert_active_tab_invariant();
}

#[tokio::test]
async fn test_plain_current_tab_offers_playing_tab_toggle() {
    let mut h = Harness::new();
    h.focus(1).await;
    h.open(1, ALPHA_URL).await;
    h.play(1, "Artist", "Track").await;

    h.browser.clear();
    h.focus(2).await;
    h.open(2, PLAIN_URL).await;

    assert_eq!(h.worker.current_tab_id, TabId(2));
    assert_eq!(h.worker.active_tab_id, TabId(1));
    assert_eq!(
        h.browser.menu_titles(),
        vec!["Disable Alpha connector".to_string()]
    );
    h.assert_active_tab_invariant();
}

#[tokio::test]
async fn test_menu_skips_duplicate_connector() {
    let mut h = Harness::new();
    h.focus(1).await;
    h.open(1, ALPHA_URL).await;
    h.play(1, "Artist", "Track").await;
    h.focus(2).await;
    h.open(2, ALPHA_URL).await;

    let menu = h.worker.build_menu(TabId(2));
    assert_eq!(menu.len(), 2);
    assert!(menu
        .iter()
        .all(|(action, _)| !matches!(action, MenuAction::ToggleConnector { tab_id } if *tab_id == TabId(1))));
}

#[tokio::test]
async fn test_switching_to_tab_without_controller() {
    let mut h = Harness::new();
    h.focus(1).await;
    h.open(1, ALPHA_URL).await;
    assert_eq!(h.worker.active_tab_id, TabId(1));

    // Tab 1 never played, so the idle controller gives the action up.
    h.browser.clear();
    h.focus(3).await;

    assert_eq!(h.worker.active_tab_id, TabId::NO_TAB);
    assert!(h.browser.calls().contains(&BrowserCall::ResetAction));
    h.assert_active_tab_invariant();
}

#[tokio::test]
async fn test_background_tab_that_starts_playing_becomes_active() {
    let mut h = Harness::new();
    h.open(1, ALPHA_URL).await;
    assert_eq!(h.worker.active_tab_id, TabId::NO_TAB);

    h.focus(5).await;
    h.play(1, "Artist", "Track").await;

    assert_eq!(h.worker.active_tab_id, TabId(1));
    h.assert_active_tab_invariant();
}

#[tokio::test]
async fn test_removing_active_tab_elects_another_playing_tab() {
    let mut h = Harness::new();
    h.focus(1).await;
    h.open(1, ALPHA_URL).await;
    h.play(1, "Artist", "One").await;
    h.open(2, BETA_URL).await;
    h.play(2, "Artist", "Two").await;
    assert_eq!(h.worker.active_tab_id, TabId(2));

    h.focus(3).await;
    h.worker.process_tab_remove(TabId(2)).await;
    h.settle().await;

    assert_eq!(h.worker.active_tab_id, TabId(1));
    assert!(!h.worker.controllers.contains_key(&TabId(2)));
    h.assert_active_tab_invariant();
}

#[tokio::test]
async fn test_removing_last_tab_resets_action() {
    let mut h = Harness::new();
    h.focus(1).await;
    h.open(1, ALPHA_URL).await;
    h.play(1, "Artist", "Track").await;
    h.browser.clear();

    h.worker.process_tab_remove(TabId(1)).await;

    assert_eq!(h.worker.active_tab_id, TabId::NO_TAB);
    assert!(h.worker.controllers.is_empty());
    let calls = h.browser.calls();
    assert!(calls.contains(&BrowserCall::ResetAction));
    assert!(calls.contains(&BrowserCall::RemoveAllMenuItems));
}

#[tokio::test]
async fn test_active_tab_going_idle_hands_action_to_current_tab() {
    let mut h = Harness::new();
    h.focus(1).await;
    h.open(1, ALPHA_URL).await;
    h.play(1, "Artist", "Track").await;
    h.focus(2).await;
    h.open(2, BETA_URL).await;
    assert_eq!(h.worker.active_tab_id, TabId(1));

    let response = h.worker.process_message(TabId(1), Request::ResetSong).await;
    assert_eq!(response, Response::Ok);
    h.settle().await;

    assert_eq!(h.worker.active_tab_id, TabId(2));
    h.assert_active_tab_invariant();
}

#[tokio::test]
async fn test_menu_follows_current_tab_when_active_tab_goes_idle() {
    let mut h = Harness::new();
    h.focus(1).await;
    h.open(1, ALPHA_URL).await;
    h.play(1, "Artist", "One").await;
    h.open(2, BETA_URL).await;
    h.play(2, "Artist", "Two").await;
    h.focus(3).await;
    assert_eq!(h.worker.active_tab_id, TabId(2));

    h.browser.clear();
    h.worker.process_message(TabId(2), Request::ResetSong).await;
    h.settle().await;

    assert_eq!(h.worker.active_tab_id, TabId(1));
    assert_eq!(h.worker.menu_tab_id, TabId(3));
    assert_eq!(
        h.browser.menu_titles(),
        vec!["Disable Alpha connector".to_string()]
    );
    assert!(h
        .menu_action_for(MenuAction::ToggleConnector { tab_id: TabId(1) })
        .is_some());
    h.assert_active_tab_invariant();
}

#[tokio::test]
async fn test_should_update_browser_action_has_no_side_effects() {
    let mut h = Harness::new();
    h.focus(1).await;
    h.open(1, ALPHA_URL).await;
    h.play(1, "Artist", "Track").await;
    h.focus(2).await;
    h.browser.clear();

    let before = serde_json::to_value(h.worker.snapshot()).unwrap();
    let first = h.worker.should_update_browser_action(TabId(2));
    let second = h.worker.should_update_browser_action(TabId(2));
    let after = serde_json::to_value(h.worker.snapshot()).unwrap();

    assert!(!first);
    assert_eq!(first, second);
    assert_eq!(before, after);
    assert!(h.browser.calls().is_empty());
    assert!(h.worker.should_update_browser_action(TabId(1)));
}

#[tokio::test]
async fn test_single_playing_tab_wins_election_from_any_current_tab() {
    let mut h = Harness::new();
    h.open(1, ALPHA_URL).await;
    h.open(2, BETA_URL).await;
    h.play(2, "Artist", "Track").await;

    for current in [1, 2, 3] {
        h.focus(current).await;
        assert_eq!(h.worker.find_active_tab_id(), TabId(2));
    }
}

#[tokio::test]
async fn test_at_most_one_controller_per_tab() {
    let mut h = Harness::new();
    h.focus(1).await;
    for url in [ALPHA_URL, BETA_URL, ALPHA_URL] {
        h.open(1, url).await;
    }
    h.open(2, ALPHA_URL).await;

    assert_eq!(h.worker.controllers.len(), 2);
    let snapshot = h.worker.snapshot();
    let ids: Vec<TabId> = snapshot.tabs.iter().map(|t| t.tab_id).collect();
    assert_eq!(ids, vec![TabId(1), TabId(2)]);
}

// ── notices ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_notices_from_replaced_controller_are_dropped() {
    let mut h = Harness::new();
    h.open(1, ALPHA_URL).await;

    // Queue notices from the first controller without delivering them.
    h.worker.process_port_message(
        TabId(1),
        PortEvent::StateChanged(PageState {
            artist: Some("Artist".to_string()),
            track: Some("Track".to_string()),
            is_playing: true,
            ..Default::default()
        }),
    );
    h.worker.process_tab_update(TabId(1), ALPHA_URL).await;
    h.browser.clear();
    h.settle().await;

    assert!(h.browser.calls().is_empty());
    assert_eq!(h.worker.active_tab_id, TabId::NO_TAB);
    assert_eq!(h.worker.mode_of(TabId(1)), Some(ControllerMode::Base));
}

#[tokio::test]
async fn test_song_update_is_broadcast() {
    let mut h = Harness::new();
    h.focus(1).await;
    h.open(1, ALPHA_URL).await;
    h.browser.clear();

    h.play(1, "Artist", "Track").await;

    let calls = h.browser.calls();
    assert!(calls.iter().any(|call| matches!(
        call,
        BrowserCall::Notify { event: ExtensionEvent::SongUpdated { tab_id, song: Some(song) } }
            if *tab_id == TabId(1) && song.label().as_deref() == Some("Artist - Track")
    )));
    assert!(calls.iter().any(|call| matches!(
        call,
        BrowserCall::UpdateAction { view, .. } if view.mode == ControllerMode::Playing
    )));
}

// ── commands & requests ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_active_tab_request_without_controller() {
    let mut h = Harness::new();
    h.focus(1).await;
    h.open(1, ALPHA_URL).await;

    let response = h.worker.process_message(TabId(42), Request::ActiveTabId).await;
    assert_eq!(response, Response::ActiveTabId(TabId(1)));

    let response = h.worker.process_message(TabId(42), Request::GetSong).await;
    assert_eq!(response, Response::Unavailable);
}

#[tokio::test]
async fn test_song_requests_reach_controller() {
    let mut h = Harness::new();
    h.focus(1).await;
    h.open(1, ALPHA_URL).await;
    h.play(1, "Artsit", "Track").await;

    let correction = SongCorrection {
        artist: Some("Artist".to_string()),
        ..Default::default()
    };
    let response = h
        .worker
        .process_message(TabId(1), Request::CorrectSong(correction))
        .await;
    assert_eq!(response, Response::Ok);

    match h.worker.process_message(TabId(1), Request::GetSong).await {
        Response::Song(Some(song)) => {
            assert_eq!(song.artist.as_deref(), Some("Artist"));
            assert!(song.is_corrected_by_user);
        }
        other => panic!("unexpected {:?}", other),
    }

    let response = h.worker.process_message(TabId(1), Request::SkipSong).await;
    assert_eq!(response, Response::Ok);
    h.settle().await;
    assert_eq!(h.worker.mode_of(TabId(1)), Some(ControllerMode::Skipped));
}

#[tokio::test]
async fn test_love_command_targets_active_tab() {
    let mut h = Harness::new();
    h.focus(1).await;
    h.open(1, ALPHA_URL).await;
    h.play(1, "Artist", "Track").await;
    h.focus(2).await;
    h.browser.clear();

    h.worker.process_command(BrowserCommand::LoveSong).await;
    h.settle().await;

    assert!(h.browser.calls().contains(&BrowserCall::UpdateLove {
        tab_id: TabId(1),
        is_loved: true,
    }));
    let song = h.worker.controllers[&TabId(1)].controller.current_song();
    assert!(song.map(|s| s.is_loved).unwrap_or(false));
}

#[tokio::test]
async fn test_love_request_without_song_is_an_error() {
    let mut h = Harness::new();
    h.focus(1).await;
    h.open(1, ALPHA_URL).await;

    let response = h
        .worker
        .process_message(TabId(1), Request::ToggleLove { is_loved: true })
        .await;
    assert!(matches!(response, Response::Error(_)));
}

#[tokio::test]
async fn test_controller_requests_for_unknown_tab_are_unavailable() {
    let mut h = Harness::new();
    h.focus(1).await;
    h.open(1, ALPHA_URL).await;

    for request in [
        Request::GetSong,
        Request::CorrectSong(SongCorrection::default()),
        Request::ToggleLove { is_loved: true },
        Request::SkipSong,
        Request::ResetSong,
    ] {
        let response = h.worker.process_message(TabId(9), request).await;
        assert_eq!(response, Response::Unavailable);
    }
    assert!(h.worker.controllers.contains_key(&TabId(1)));
}

#[tokio::test]
async fn test_toggle_command_falls_back_to_current_tab() {
    let mut h = Harness::new();
    // Open while no tab is current so the idle controller never owns the action.
    h.open(1, ALPHA_URL).await;
    *h.browser.current_tab.lock().unwrap() = TabId(1);
    h.worker.process_browser_connected().await;
    assert_eq!(h.worker.active_tab_id, TabId::NO_TAB);
    assert_eq!(h.worker.current_tab_id, TabId(1));

    h.worker.process_command(BrowserCommand::ToggleConnector).await;
    h.settle().await;

    assert!(!h.worker.controllers[&TabId(1)].controller.is_enabled());
    assert!(h.options.disabled.lock().unwrap().contains("alpha"));
}

#[tokio::test]
async fn test_love_command_falls_back_to_current_tab() {
    let mut h = Harness::new();
    h.open(1, ALPHA_URL).await;
    *h.browser.current_tab.lock().unwrap() = TabId(1);
    h.worker.process_browser_connected().await;

    // The page has a song, but its mode change has not reached the worker,
    // so no tab has been promoted yet.
    h.worker.process_port_message(
        TabId(1),
        PortEvent::StateChanged(PageState {
            artist: Some("Artist".to_string()),
            track: Some("Track".to_string()),
            is_playing: true,
            ..Default::default()
        }),
    );
    assert_eq!(h.worker.active_tab_id, TabId::NO_TAB);
    h.browser.clear();

    h.worker.process_command(BrowserCommand::LoveSong).await;

    let loves: Vec<BrowserCall> = h
        .browser
        .calls()
        .into_iter()
        .filter(|call| matches!(call, BrowserCall::UpdateLove { .. }))
        .collect();
    assert_eq!(
        loves,
        vec![BrowserCall::UpdateLove {
            tab_id: TabId(1),
            is_loved: true,
        }]
    );
}

#[tokio::test]
async fn test_command_without_controllers_is_ignored() {
    let mut h = Harness::new();
    h.focus(1).await;
    h.browser.clear();

    h.worker.process_command(BrowserCommand::LoveSong).await;

    assert!(h.browser.calls().is_empty());
}

// ── menu clicks ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_menu_toggle_persists_choice() {
    let mut h = Harness::new();
    h.focus(1).await;
    h.open(1, ALPHA_URL).await;

    let item = h
        .menu_action_for(MenuAction::ToggleConnector { tab_id: TabId(1) })
        .unwrap();
    h.worker.process_menu_click(&item).await;
    h.settle().await;

    assert!(!h.worker.controllers[&TabId(1)].controller.is_enabled());
    assert!(h.options.disabled.lock().unwrap().contains("alpha"));

    // The rebuilt menu offers to turn it back on.
    let item = h
        .menu_action_for(MenuAction::ToggleConnector { tab_id: TabId(1) })
        .unwrap();
    h.worker.process_menu_click(&item).await;
    h.settle().await;

    assert!(h.worker.controllers[&TabId(1)].controller.is_enabled());
    assert!(h.options.disabled.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_disable_until_tab_closed_is_not_persisted() {
    let mut h = Harness::new();
    h.focus(1).await;
    h.open(1, ALPHA_URL).await;

    let item = h
        .menu_action_for(MenuAction::DisableUntilTabClosed { tab_id: TabId(1) })
        .unwrap();
    h.worker.process_menu_click(&item).await;
    h.settle().await;

    assert!(!h.worker.controllers[&TabId(1)].controller.is_enabled());
    assert!(h.options.disabled.lock().unwrap().is_empty());

    h.worker.process_tab_remove(TabId(1)).await;
    h.open(7, ALPHA_URL).await;
    assert!(h.worker.controllers[&TabId(7)].controller.is_enabled());
}

#[tokio::test]
async fn test_unknown_menu_item_is_ignored() {
    let mut h = Harness::new();
    h.focus(1).await;
    h.open(1, ALPHA_URL).await;
    h.browser.clear();

    h.worker.process_menu_click("scrobbler-menu-999").await;

    assert!(h.browser.calls().is_empty());
    assert!(h.worker.controllers[&TabId(1)].controller.is_enabled());
}

// ── connection & loop ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_browser_disconnect_drops_everything() {
    let mut h = Harness::new();
    h.focus(1).await;
    h.open(1, ALPHA_URL).await;
    h.play(1, "Artist", "Track").await;

    h.worker.process_browser_disconnected();

    assert!(h.worker.controllers.is_empty());
    assert_eq!(h.worker.active_tab_id, TabId::NO_TAB);
    assert_eq!(h.worker.current_tab_id, TabId::NO_TAB);
    assert!(h.worker.menu_actions.is_empty());
}

#[tokio::test]
async fn test_run_loop_serves_snapshots() {
    let h = Harness::new();
    let (notice_tx, notice_rx) = mpsc::unbounded_channel();
    let worker = TabWorker::new(h.worker.collab.clone(), notice_tx);
    let (event_tx, event_rx) = mpsc::channel(16);
    let task = tokio::spawn(worker.run(event_rx, notice_rx));

    event_tx.send(WorkerEvent::TabActivated(TabId(1))).await.unwrap();
    event_tx
        .send(WorkerEvent::TabUpdated {
            tab_id: TabId(1),
            url: ALPHA_URL.to_string(),
        })
        .await
        .unwrap();
    let (reply_tx, reply_rx) = oneshot::channel();
    event_tx
        .send(WorkerEvent::Request {
            tab_id: TabId(9),
            request: Request::ActiveTabId,
            reply: reply_tx,
        })
        .await
        .unwrap();
    assert_eq!(reply_rx.await.unwrap(), Response::ActiveTabId(TabId(1)));

    let (snap_tx, snap_rx) = oneshot::channel();
    event_tx.send(WorkerEvent::Snapshot(snap_tx)).await.unwrap();
    let snapshot = snap_rx.await.unwrap();
    assert_eq!(snapshot.current_tab, TabId(1));
    assert_eq!(snapshot.tabs.len(), 1);
    assert_eq!(snapshot.tabs[0].connector.id, "alpha");

    drop(event_tx);
    task.await.unwrap().unwrap();
}
