//! Built-in page controller: turns the player state reported by a content
//! script into a song snapshot and a controller mode.
//!
//! Mode derivation:
//!   disabled                      -> Disabled
//!   nothing reported / no player  -> Base
//!   playing without usable tags   -> Unknown
//!   song skipped by the user      -> Skipped
//!   song playing / paused         -> Playing / Paused

use async_trait::async_trait;
use scrobbler_proto::protocol::{
    ConnectorInfo, ControllerMode, PageState, SongCorrection, SongInfo, TabId,
};
use tracing::{debug, info};

use crate::browser::{Controller, ControllerError, ControllerEvents, ControllerFactory};

pub struct PageController {
    connector: ConnectorInfo,
    enabled: bool,
    mode: ControllerMode,
    song: Option<SongInfo>,
    /// Identity of the song as the page reported it, before corrections.
    song_key: Option<SongKey>,
    /// Last state reported by the page; replayed when re-enabled.
    last_state: Option<PageState>,
    events: ControllerEvents,
    finished: bool,
}

impl PageController {
    pub fn new(connector: ConnectorInfo, enabled: bool, events: ControllerEvents) -> Self {
        let mode = if enabled {
            ControllerMode::Base
        } else {
            ControllerMode::Disabled
        };
        Self {
            connector,
            enabled,
            mode,
            song: None,
            song_key: None,
            last_state: None,
            events,
            finished: false,
        }
    }

    fn tab_id(&self) -> TabId {
        self.events.tab_id()
    }

    fn set_mode(&mut self, mode: ControllerMode) {
        if self.mode == mode {
            return;
        }
        debug!("PageController[{}]: {:?} -> {:?}", self.tab_id(), self.mode, mode);
        self.mode = mode;
        if !self.finished {
            self.events.mode_changed(mode);
        }
    }

    fn publish_song(&self) {
        if !self.finished {
            self.events.song_updated(self.song.clone());
        }
    }

    fn derive_mode(&self, state: Option<&PageState>) -> ControllerMode {
        if !self.enabled {
            return ControllerMode::Disabled;
        }
        let Some(state) = state else {
            return ControllerMode::Base;
        };
        match &self.song {
            Some(song) if song.is_skipped => ControllerMode::Skipped,
            Some(_) if state.is_playing => ControllerMode::Playing,
            Some(_) => ControllerMode::Paused,
            None if state.is_playing => ControllerMode::Unknown,
            None => ControllerMode::Base,
        }
    }

    fn song_from_state(&self, state: &PageState) -> SongInfo {
        SongInfo {
            artist: state.artist.clone(),
            track: state.track.clone(),
            album: state.album.clone(),
            album_artist: state.album_artist.clone(),
            duration: state.duration,
            unique_id: state.unique_id.clone(),
            track_art: state.track_art.clone(),
            connector_label: self.connector.label.clone(),
            ..Default::default()
        }
    }

    /// Apply a page state; returns true when the song snapshot changed.
    fn update_song(&mut self, state: &PageState) -> bool {
        if !state.has_song() {
            self.song_key = None;
            return self.song.take().is_some();
        }

        let key = SongKey::from_state(state);
        if self.song.is_none() || self.song_key.as_ref() != Some(&key) {
            let song = self.song_from_state(state);
            info!(
                "PageController[{}]: new song {:?}",
                self.tab_id(),
                song.label()
            );
            self.song = Some(song);
            self.song_key = Some(key);
            return true;
        }

        let Some(song) = self.song.as_mut() else {
            return false;
        };
        let mut changed = false;
        if state.duration.is_some() && song.duration != state.duration {
            song.duration = state.duration;
            changed = true;
        }
        if state.track_art.is_some() && song.track_art != state.track_art {
            song.track_art = state.track_art.clone();
            changed = true;
        }
        changed
    }
}

/// Same song when the page gives the same unique id, or (without ids) the
/// same artist and track.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SongKey {
    UniqueId(String),
    Tags(Option<String>, Option<String>),
}

impl SongKey {
    fn from_state(state: &PageState) -> Self {
        match &state.unique_id {
            Some(id) => SongKey::UniqueId(id.clone()),
            None => SongKey::Tags(state.artist.clone(), state.track.clone()),
        }
    }
}

#[async_trait]
impl Controller for PageController {
    fn connector(&self) -> &ConnectorInfo {
        &self.connector
    }

    fn mode(&self) -> ControllerMode {
        self.mode
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        if enabled {
            if let Some(state) = self.last_state.clone() {
                if self.update_song(&state) {
                    self.publish_song();
                }
            }
        }
        let mode = self.derive_mode(self.last_state.as_ref());
        self.set_mode(mode);
    }

    fn current_song(&self) -> Option<SongInfo> {
        self.song.clone()
    }

    fn on_state_changed(&mut self, state: PageState) {
        if self.finished {
            return;
        }
        if self.enabled && self.update_song(&state) {
            self.publish_song();
        }
        let mode = if self.enabled {
            self.derive_mode(Some(&state))
        } else {
            ControllerMode::Disabled
        };
        self.last_state = Some(state);
        self.set_mode(mode);
    }

    fn correct_song(&mut self, correction: SongCorrection) {
        let Some(song) = self.song.as_mut() else {
            debug!("PageController[{}]: nothing to correct", self.tab_id());
            return;
        };

        if let Some(artist) = correction.artist {
            song.artist = Some(artist);
        }
        if let Some(track) = correction.track {
            song.track = Some(track);
        }
        if let Some(album) = correction.album {
            song.album = Some(album);
        }
        if let Some(album_artist) = correction.album_artist {
            song.album_artist = Some(album_artist);
        }
        song.is_corrected_by_user = true;
        self.publish_song();
    }

    async fn toggle_love(&mut self, is_loved: bool) -> Result<(), ControllerError> {
        if !self.enabled {
            return Err(ControllerError::Disabled);
        }
        let Some(song) = self.song.as_mut() else {
            return Err(ControllerError::NoSong);
        };
        song.is_loved = is_loved;
        self.publish_song();
        Ok(())
    }

    fn skip_current_song(&mut self) {
        let Some(song) = self.song.as_mut() else {
            return;
        };
        song.is_skipped = true;
        self.publish_song();
        self.set_mode(ControllerMode::Skipped);
    }

    fn reset_song_data(&mut self) {
        self.song = None;
        self.song_key = None;
        self.publish_song();
        let mode = if self.enabled {
            ControllerMode::Base
        } else {
            ControllerMode::Disabled
        };
        self.set_mode(mode);
    }

    fn finish(&mut self) {
        debug!("PageController[{}]: finished", self.tab_id());
        self.finished = true;
    }
}

pub struct PageControllerFactory;

impl ControllerFactory for PageControllerFactory {
    fn create(
        &self,
        _tab_id: TabId,
        connector: ConnectorInfo,
        enabled: bool,
        events: ControllerEvents,
    ) -> Box<dyn Controller> {
        Box::new(PageController::new(connector, enabled, events))
    }
}
