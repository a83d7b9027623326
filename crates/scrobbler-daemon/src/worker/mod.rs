/// TabWorker — single-owner event loop for all per-tab state.
///
/// Owns the tab → controller map plus the current/active tab ids.  Every
/// input (bridge frames, HTTP commands, controller notices) is funnelled into
/// `TabWorker::run` so handlers never race each other; they may still suspend on
/// browser calls, so any lookup after an await treats a missing controller as
/// a no-op.
///
/// Invariant after every handler: `active_tab_id` is `NO_TAB`, a tab whose
/// controller is in an active mode, or the current tab when that tab has a
/// controller.
use std::collections::HashMap;
use std::sync::Arc;

use scrobbler_proto::protocol::{
    BrowserCommand, ConnectorInfo, ControllerMode, ExtensionEvent, InjectResult, PortEvent,
    Request, Response, SongInfo, TabId, TabMessage,
};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::browser::{
    action_view, BridgeError, Browser, BrowserAction, ConnectorResolver, Controller,
    ControllerEvents, ControllerFactory, ControllerNotice, Injector, NoticeKind, OptionsStore,
};

mod menu;

pub use menu::MenuAction;

#[cfg(test)]
mod tests;

// ── WorkerEvent ───────────────────────────────────────────────────────────────

/// All inputs into the worker loop.
#[derive(Debug)]
pub enum WorkerEvent {
    /// The browser shim said hello.
    BrowserConnected,
    /// The browser shim went away; every tab is unknown now.
    BrowserDisconnected,
    TabUpdated {
        tab_id: TabId,
        url: String,
    },
    TabActivated(TabId),
    TabRemoved(TabId),
    Command(BrowserCommand),
    Request {
        tab_id: TabId,
        request: Request,
        reply: oneshot::Sender<Response>,
    },
    PortMessage {
        tab_id: TabId,
        event: PortEvent,
    },
    MenuClicked(String),
    Snapshot(oneshot::Sender<WorkerSnapshot>),
    Shutdown,
}

// ── snapshots ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct TabSnapshot {
    pub tab_id: TabId,
    pub connector: ConnectorInfo,
    pub mode: ControllerMode,
    pub enabled: bool,
    pub song: Option<SongInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub current_tab: TabId,
    pub active_tab: TabId,
    pub tabs: Vec<TabSnapshot>,
}

// ── collaborators ─────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Collaborators {
    pub resolver: Arc<dyn ConnectorResolver>,
    pub injector: Arc<dyn Injector>,
    pub action: Arc<dyn BrowserAction>,
    pub browser: Arc<dyn Browser>,
    pub options: Arc<dyn OptionsStore>,
    pub controllers: Arc<dyn ControllerFactory>,
}

struct ControllerEntry {
    controller: Box<dyn Controller>,
    /// Distinguishes this controller from earlier ones on the same tab.
    instance: u64,
}

// ── TabWorker ─────────────────────────────────────────────────────────────────

pub struct TabWorker {
    collab: Collaborators,
    controllers: HashMap<TabId, ControllerEntry>,
    /// Tab the user is looking at.
    current_tab_id: TabId,
    /// Tab owning the browser action and menu.
    active_tab_id: TabId,
    /// Click targets of the menu as last built.
    menu_actions: HashMap<String, MenuAction>,
    /// Tab the menu was last built for.
    menu_tab_id: TabId,
    next_instance: u64,
    next_menu_item: u64,
    notice_tx: mpsc::UnboundedSender<ControllerNotice>,
}

impl TabWorker {
    pub fn new(collab: Collaborators, notice_tx: mpsc::UnboundedSender<ControllerNotice>) -> Self {
        Self {
            collab,
            controllers: HashMap::new(),
            current_tab_id: TabId::NO_TAB,
            active_tab_id: TabId::NO_TAB,
            menu_actions: HashMap::new(),
            menu_tab_id: TabId::NO_TAB,
            next_instance: 1,
            next_menu_item: 1,
            notice_tx,
        }
    }

    /// Run the worker loop.  Returns on `Shutdown` or when every event
    /// sender is gone.
    pub async fn run(
        mut self,
        mut event_rx: mpsc::Receiver<WorkerEvent>,
        mut notice_rx: mpsc::UnboundedReceiver<ControllerNotice>,
    ) -> anyhow::Result<()> {
        info!("TabWorker: starting event loop");

        loop {
            tokio::select! {
                evt = event_rx.recv() => match evt {
                    None => {
                        info!("TabWorker: event channel closed, shutting down");
                        break;
                    }
                    Some(WorkerEvent::Shutdown) => {
                        info!("TabWorker: shutdown requested");
                        break;
                    }
                    Some(evt) => self.handle_event(evt).await,
                },
                Some(notice) = notice_rx.recv() => {
                    self.process_controller_notice(notice).await;
                }
            }
        }

        self.unload_all_controllers();
        Ok(())
    }

    async fn handle_event(&mut self, evt: WorkerEvent) {
        match evt {
            WorkerEvent::BrowserConnected => self.process_browser_connected().await,
            WorkerEvent::BrowserDisconnected => self.process_browser_disconnected(),
            WorkerEvent::TabUpdated { tab_id, url } => self.process_tab_update(tab_id, &url).await,
            WorkerEvent::TabActivated(tab_id) => self.process_tab_change(tab_id).await,
            WorkerEvent::TabRemoved(tab_id) => self.process_tab_remove(tab_id).await,
            WorkerEvent::Command(cmd) => self.process_command(cmd).await,
            WorkerEvent::Request {
                tab_id,
                request,
                reply,
            } => {
                let response = self.process_message(tab_id, request).await;
                // Requester may have given up.
                let _ = reply.send(response);
            }
            WorkerEvent::PortMessage { tab_id, event } => {
                self.process_port_message(tab_id, event)
            }
            WorkerEvent::MenuClicked(item_id) => self.process_menu_click(&item_id).await,
            WorkerEvent::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            WorkerEvent::Shutdown => {}
        }
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let mut tabs: Vec<TabSnapshot> = self
            .controllers
            .iter()
            .map(|(tab_id, entry)| TabSnapshot {
                tab_id: *tab_id,
                connector: entry.controller.connector().clone(),
                mode: entry.controller.mode(),
                enabled: entry.controller.is_enabled(),
                song: entry.controller.current_song(),
            })
            .collect();
        tabs.sort_by_key(|t| t.tab_id);

        WorkerSnapshot {
            current_tab: self.current_tab_id,
            active_tab: self.active_tab_id,
            tabs,
        }
    }

    // ── browser connection ────────────────────────────────────────────────────

    async fn process_browser_connected(&mut self) {
        self.current_tab_id = match self.collab.browser.current_tab_id().await {
            Ok(tab_id) => tab_id,
            Err(e) => {
                warn!("TabWorker: unable to query current tab: {}", e);
                TabId::NO_TAB
            }
        };
        info!("TabWorker: browser connected, current tab {}", self.current_tab_id);
    }

    fn process_browser_disconnected(&mut self) {
        info!(
            "TabWorker: browser disconnected, dropping {} controllers",
            self.controllers.len()
        );
        self.unload_all_controllers();
        self.current_tab_id = TabId::NO_TAB;
        self.active_tab_id = TabId::NO_TAB;
        self.menu_actions.clear();
        self.menu_tab_id = TabId::NO_TAB;
    }

    // ── tab lifecycle ─────────────────────────────────────────────────────────

    pub async fn process_tab_update(&mut self, tab_id: TabId, url: &str) {
        let connector = self.collab.resolver.find_connector(url).await;
        debug!(
            "TabWorker: tab {} updated, connector {:?}",
            tab_id,
            connector.as_ref().map(|c| c.id.as_str())
        );

        if let Err(e) = self.try_to_inject_connector(tab_id, connector).await {
            warn!("TabWorker: unable to inject connector into tab {}: {}", tab_id, e);
        }
    }

    pub async fn process_tab_change(&mut self, tab_id: TabId) {
        self.current_tab_id = tab_id;

        if self.should_update_browser_action(tab_id) {
            // A tab without a controller has nothing to own the action with.
            self.active_tab_id = if self.controllers.contains_key(&tab_id) {
                tab_id
            } else {
                TabId::NO_TAB
            };
            self.update_browser_action(tab_id).await;
        }

        self.update_context_menu(tab_id).await;
    }

    pub async fn process_tab_remove(&mut self, removed_tab_id: TabId) {
        self.unload_controller(removed_tab_id);

        if removed_tab_id == self.active_tab_id {
            self.active_tab_id = TabId::NO_TAB;
            self.update_last_active_tab().await;
        }
    }

    // ── injection ─────────────────────────────────────────────────────────────

    /// The only place controller entries are created or destroyed (outside
    /// of tab removal and browser disconnect).
    pub async fn try_to_inject_connector(
        &mut self,
        tab_id: TabId,
        connector: Option<ConnectorInfo>,
    ) -> Result<InjectResult, BridgeError> {
        let Some(connector) = connector else {
            self.handle_no_match(tab_id).await;
            return Ok(InjectResult::NoMatch);
        };

        let result = self.collab.injector.inject(tab_id, &connector).await?;
        debug!(
            "TabWorker: inject {} into tab {} -> {:?}",
            connector.id, tab_id, result
        );

        match result {
            InjectResult::Injected => {}
            InjectResult::NoMatch => self.handle_no_match(tab_id).await,
            InjectResult::Matched => self.handle_match(tab_id, connector).await,
        }

        Ok(result)
    }

    async fn handle_no_match(&mut self, tab_id: TabId) {
        if self.controllers.contains_key(&tab_id) {
            self.unload_controller(tab_id);
            self.update_last_active_tab().await;
        }
    }

    async fn handle_match(&mut self, tab_id: TabId, connector: ConnectorInfo) {
        self.unload_controller(tab_id);

        let enabled = self.collab.options.is_connector_enabled(&connector).await;
        self.create_controller(tab_id, connector.clone(), enabled);

        if self.should_update_browser_action(tab_id) {
            self.active_tab_id = tab_id;
            self.update_browser_action(tab_id).await;
        }
        self.update_context_menu(tab_id).await;

        if let Err(e) = self
            .collab
            .browser
            .send_to_tab(tab_id, TabMessage::Ready)
            .await
        {
            debug!("TabWorker: EVENT_READY to tab {} failed: {}", tab_id, e);
        }

        let event = ExtensionEvent::ConnectorActivated { tab_id, connector };
        if let Err(e) = self.collab.browser.notify(event).await {
            debug!("TabWorker: connector activation notice failed: {}", e);
        }
    }

    fn create_controller(&mut self, tab_id: TabId, connector: ConnectorInfo, enabled: bool) {
        let instance = self.next_instance;
        self.next_instance += 1;

        info!(
            "TabWorker: created controller #{} ({}) for tab {}",
            instance, connector.id, tab_id
        );

        let events = ControllerEvents::new(tab_id, instance, self.notice_tx.clone());
        let controller = self
            .collab
            .controllers
            .create(tab_id, connector, enabled, events);
        self.controllers.insert(
            tab_id,
            ControllerEntry {
                controller,
                instance,
            },
        );
    }

    fn unload_controller(&mut self, tab_id: TabId) {
        if let Some(mut entry) = self.controllers.remove(&tab_id) {
            info!(
                "TabWorker: removed controller #{} for tab {}",
                entry.instance, tab_id
            );
            entry.controller.finish();
        }
    }

    fn unload_all_controllers(&mut self) {
        for (_, mut entry) in self.controllers.drain() {
            entry.controller.finish();
        }
    }

    // ── active tab election ───────────────────────────────────────────────────

    fn mode_of(&self, tab_id: TabId) -> Option<ControllerMode> {
        self.controllers
            .get(&tab_id)
            .map(|entry| entry.controller.mode())
    }

    /// Whether `tab_id` may take over the browser action.  An active tab
    /// keeps it against any other tab; an inactive controller only takes it
    /// when its tab is in front.
    pub fn should_update_browser_action(&self, tab_id: TabId) -> bool {
        if let Some(mode) = self.mode_of(self.active_tab_id) {
            if mode.is_active() && tab_id != self.active_tab_id {
                return false;
            }
        }

        if let Some(mode) = self.mode_of(tab_id) {
            if mode.is_inactive() && tab_id != self.current_tab_id {
                return false;
            }
        }

        true
    }

    /// With several active controllers the first one found wins; map
    /// iteration order is unspecified.
    pub fn find_active_tab_id(&self) -> TabId {
        if let Some(mode) = self.mode_of(self.current_tab_id) {
            if mode.is_active() {
                return self.current_tab_id;
            }
        }

        if let Some((tab_id, _)) = self
            .controllers
            .iter()
            .find(|(_, entry)| entry.controller.mode().is_active())
        {
            return *tab_id;
        }

        if self.controllers.contains_key(&self.current_tab_id) {
            return self.current_tab_id;
        }

        TabId::NO_TAB
    }

    pub async fn update_last_active_tab(&mut self) {
        let tab_id = self.elect_active_tab().await;
        if tab_id.is_none() {
            self.clear_context_menu().await;
        } else {
            self.update_context_menu(tab_id).await;
        }
    }

    /// Pick the active tab afresh and point the browser action at it.  The
    /// menu is left to the caller.
    async fn elect_active_tab(&mut self) -> TabId {
        let tab_id = self.find_active_tab_id();
        self.active_tab_id = tab_id;

        if tab_id.is_none() {
            debug!("TabWorker: no active tab left");
            self.reset_browser_action().await;
        } else {
            debug!("TabWorker: active tab is now {}", tab_id);
            self.update_browser_action(tab_id).await;
        }
        tab_id
    }

    // ── controller notices ────────────────────────────────────────────────────

    pub async fn process_controller_notice(&mut self, notice: ControllerNotice) {
        let current = self
            .controllers
            .get(&notice.tab_id)
            .map(|entry| entry.instance);
        if current != Some(notice.instance) {
            debug!(
                "TabWorker: dropping notice from stale controller #{} on tab {}",
                notice.instance, notice.tab_id
            );
            return;
        }

        match notice.kind {
            NoticeKind::ModeChanged(mode) => {
                self.process_controller_mode_change(notice.tab_id, mode)
                    .await
            }
            NoticeKind::SongUpdated(song) => {
                self.process_song_update(notice.tab_id, song).await
            }
        }
    }

    pub async fn process_controller_mode_change(&mut self, tab_id: TabId, mode: ControllerMode) {
        debug!("TabWorker: tab {} mode -> {:?}", tab_id, mode);

        if tab_id != self.active_tab_id {
            if mode.is_inactive() {
                return;
            }
            self.active_tab_id = tab_id;
            self.update_context_menu(self.current_tab_id).await;
        }

        if mode.is_inactive() {
            // The active tab just went quiet; hand the action to whichever
            // tab deserves it now.  The menu stays with the tab in front.
            self.elect_active_tab().await;
            self.update_context_menu(self.current_tab_id).await;
        } else {
            self.update_browser_action(tab_id).await;
        }
    }

    async fn process_song_update(&mut self, tab_id: TabId, song: Option<SongInfo>) {
        let event = ExtensionEvent::SongUpdated { tab_id, song };
        if let Err(e) = self.collab.browser.notify(event).await {
            debug!("TabWorker: song update notice failed: {}", e);
        }

        if tab_id == self.active_tab_id {
            self.update_browser_action(tab_id).await;
        }
    }

    // ── browser action ────────────────────────────────────────────────────────

    async fn update_browser_action(&self, tab_id: TabId) {
        let result = match self.controllers.get(&tab_id) {
            Some(entry) => {
                let view = action_view(entry.controller.as_ref());
                self.collab.action.update(tab_id, view).await
            }
            None => self.collab.action.reset().await,
        };
        if let Err(e) = result {
            debug!("TabWorker: browser action update failed: {}", e);
        }
    }

    async fn reset_browser_action(&self) {
        if let Err(e) = self.collab.action.reset().await {
            debug!("TabWorker: browser action reset failed: {}", e);
        }
    }

    // ── commands & messages ───────────────────────────────────────────────────

    /// Commands act on the active tab, falling back to the current one.
    fn command_target(&self) -> Option<TabId> {
        [self.active_tab_id, self.current_tab_id]
            .into_iter()
            .find(|tab_id| self.controllers.contains_key(tab_id))
    }

    pub async fn process_command(&mut self, command: BrowserCommand) {
        let Some(tab_id) = self.command_target() else {
            debug!("TabWorker: command {} ignored, no controller", command.as_str());
            return;
        };
        info!("TabWorker: command {} on tab {}", command.as_str(), tab_id);

        match command {
            BrowserCommand::ToggleConnector => {
                let enabled = match self.controllers.get(&tab_id) {
                    Some(entry) => !entry.controller.is_enabled(),
                    None => return,
                };
                self.set_connector_state(tab_id, enabled, true).await;
            }
            BrowserCommand::LoveSong | BrowserCommand::UnloveSong => {
                let is_loved = command == BrowserCommand::LoveSong;
                self.toggle_love(tab_id, is_loved).await;
            }
        }
    }

    async fn toggle_love(&mut self, tab_id: TabId, is_loved: bool) -> Response {
        let Some(entry) = self.controllers.get_mut(&tab_id) else {
            warn!("TabWorker: love toggle for tab {} without a controller", tab_id);
            return Response::Unavailable;
        };

        match entry.controller.toggle_love(is_loved).await {
            Ok(()) => {
                if let Err(e) = self.collab.action.update_love(tab_id, is_loved).await {
                    debug!("TabWorker: love indicator update failed: {}", e);
                }
                Response::Ok
            }
            Err(e) => {
                warn!("TabWorker: unable to toggle love on tab {}: {}", tab_id, e);
                Response::Error(e.to_string())
            }
        }
    }

    pub async fn process_message(&mut self, tab_id: TabId, request: Request) -> Response {
        let name = request.type_name();
        debug!("TabWorker: {} for tab {}", name, tab_id);

        match request {
            Request::ActiveTabId => Response::ActiveTabId(self.active_tab_id),
            Request::ToggleLove { is_loved } => self.toggle_love(tab_id, is_loved).await,
            Request::GetSong => {
                self.with_controller(tab_id, name, |c| Response::Song(c.current_song()))
            }
            Request::CorrectSong(correction) => self.with_controller(tab_id, name, |c| {
                c.correct_song(correction);
                Response::Ok
            }),
            Request::SkipSong => self.with_controller(tab_id, name, |c| {
                c.skip_current_song();
                Response::Ok
            }),
            Request::ResetSong => self.with_controller(tab_id, name, |c| {
                c.reset_song_data();
                Response::Ok
            }),
        }
    }

    fn with_controller(
        &mut self,
        tab_id: TabId,
        request: &str,
        f: impl FnOnce(&mut dyn Controller) -> Response,
    ) -> Response {
        match self.controllers.get_mut(&tab_id) {
            Some(entry) => f(entry.controller.as_mut()),
            None => {
                warn!("TabWorker: {} for tab {} without a controller", request, tab_id);
                Response::Unavailable
            }
        }
    }

    pub fn process_port_message(&mut self, tab_id: TabId, event: PortEvent) {
        let Some(entry) = self.controllers.get_mut(&tab_id) else {
            debug!("TabWorker: port event for tab {} without a controller", tab_id);
            return;
        };

        match event {
            PortEvent::StateChanged(state) => entry.controller.on_state_changed(state),
        }
    }

    /// Flip a tab's connector on or off.  `persist` records the choice in the
    /// options store for every future tab of that connector.
    async fn set_connector_state(&mut self, tab_id: TabId, enabled: bool, persist: bool) {
        let Some(entry) = self.controllers.get_mut(&tab_id) else {
            debug!("TabWorker: tab {} has no controller to toggle", tab_id);
            return;
        };
        entry.controller.set_enabled(enabled);
        let connector = entry.controller.connector().clone();
        info!(
            "TabWorker: {} {} on tab {}",
            if enabled { "enabled" } else { "disabled" },
            connector.id,
            tab_id
        );

        if persist {
            if let Err(e) = self
                .collab
                .options
                .set_connector_enabled(&connector, enabled)
                .await
            {
                warn!("TabWorker: unable to save connector option: {}", e);
            }
        }

        let menu_tab_id = if self.menu_tab_id.is_none() {
            self.current_tab_id
        } else {
            self.menu_tab_id
        };
        self.update_context_menu(menu_tab_id).await;

        if self.should_update_browser_action(tab_id) {
            self.update_browser_action(tab_id).await;
        }
    }
}
