//! Context menu for the page.  The menu API cannot edit items in place, so
//! the whole menu is removed and rebuilt on every visible transition.

use scrobbler_proto::protocol::{MenuItem, TabId};
use tracing::debug;

use super::TabWorker;
use crate::i18n;

/// What a menu item does when clicked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuAction {
    /// Flip the connector of `tab_id` and persist the choice.
    ToggleConnector { tab_id: TabId },
    /// Disable the connector of `tab_id` for the lifetime of the tab only.
    DisableUntilTabClosed { tab_id: TabId },
}

impl TabWorker {
    /// Items the menu for `tab_id` should show, in display order.
    pub(super) fn build_menu(&self, tab_id: TabId) -> Vec<(MenuAction, String)> {
        let mut items = Vec::new();
        let tab_ctrl = self.controllers.get(&tab_id).map(|e| &e.controller);

        if let Some(ctrl) = tab_ctrl {
            items.push((
                MenuAction::ToggleConnector { tab_id },
                toggle_title(&ctrl.connector().label, ctrl.is_enabled()),
            ));
            if ctrl.is_enabled() {
                items.push((
                    MenuAction::DisableUntilTabClosed { tab_id },
                    i18n::message("menuDisableUntilTabClosed", &[]),
                ));
            }
        }

        if tab_id != self.active_tab_id {
            if let Some(active) = self.controllers.get(&self.active_tab_id) {
                let active_ctrl = &active.controller;
                let same_connector = tab_ctrl
                    .map(|c| c.connector().id == active_ctrl.connector().id)
                    .unwrap_or(false);
                if !same_connector {
                    items.push((
                        MenuAction::ToggleConnector {
                            tab_id: self.active_tab_id,
                        },
                        toggle_title(&active_ctrl.connector().label, active_ctrl.is_enabled()),
                    ));
                }
            }
        }

        items
    }

    pub(super) async fn update_context_menu(&mut self, tab_id: TabId) {
        self.clear_context_menu().await;
        self.menu_tab_id = tab_id;

        for (action, title) in self.build_menu(tab_id) {
            let id = format!("scrobbler-menu-{}", self.next_menu_item);
            self.next_menu_item += 1;

            self.menu_actions.insert(id.clone(), action);
            let item = MenuItem { id, title };
            if let Err(e) = self.collab.browser.create_menu_item(item).await {
                debug!("TabWorker: unable to create menu item: {}", e);
            }
        }
    }

    pub(super) async fn clear_context_menu(&mut self) {
        self.menu_actions.clear();
        self.menu_tab_id = TabId::NO_TAB;
        if let Err(e) = self.collab.browser.remove_all_menu_items().await {
            debug!("TabWorker: unable to clear menu: {}", e);
        }
    }

    pub async fn process_menu_click(&mut self, item_id: &str) {
        let Some(action) = self.menu_actions.get(item_id).copied() else {
            debug!("TabWorker: click on unknown menu item {}", item_id);
            return;
        };

        match action {
            MenuAction::ToggleConnector { tab_id } => {
                let Some(entry) = self.controllers.get(&tab_id) else {
                    debug!("TabWorker: menu target tab {} is gone", tab_id);
                    return;
                };
                let enabled = !entry.controller.is_enabled();
                self.set_connector_state(tab_id, enabled, true).await;
            }
            MenuAction::DisableUntilTabClosed { tab_id } => {
                self.set_connector_state(tab_id, false, false).await;
            }
        }
    }
}

fn toggle_title(label: &str, enabled: bool) -> String {
    let key = if enabled {
        "menuDisableConnector"
    } else {
        "menuEnableConnector"
    };
    i18n::message(key, &[label])
}
