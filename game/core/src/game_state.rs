use crate::dialog::Dialog;
use crate::instance::{InstanceState, StateId};
use crate::main_thread::{MainThread, Token};
use crate::net::event::{ConnectionEvent, EventKind};
use crate::net::support::ErrorKind;
use crate::signal::{ListenerId, Signal};
use crate::text::{self, Language, Text};
use crate::worker::Worker;
use flint::{choose, ConversationId};
use hashbrown::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Seats visible on the board. The wire allows a full byte of player
/// numbers; only these slots are replicated.
pub const N_VISIBLE_PLAYERS: usize = 6;

pub const PLAYER_FLAG_CONNECTED: u8 = 1 << 0;
pub const PLAYER_FLAG_TYPING: u8 = 1 << 1;
pub const PLAYER_FLAG_NEXT_TURN: u8 = 1 << 2;

/// How long a player keeps shouting after the last shout event.
const SHOUT_TIME: Duration = Duration::from_secs(10);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StartType {
    NewGame,
    JoinGame,
}

/// One revealed tile, as replicated from the server.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Tile {
    pub num: u8,
    pub x: i16,
    pub y: i16,
    pub letter: char,
    pub last_player_moved: u8,
}

/// A "something changed" notification. Emitted on the main thread during
/// the idle flush, always suppressed when the new value equals the old one.
#[derive(Debug, Clone)]
pub enum ModifiedEvent {
    PlayerFlags,
    PlayerName { player_num: u8, name: String },
    ShoutingPlayer,
    ConversationId,
    Dialog,
    NTiles,
    Language,
    RemainingTiles,
    Note { text: String },
    Reset,
    Connected,
    HasPlayerName,
    StartType,
    Page,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ModifiedType {
    PlayerFlags,
    PlayerName,
    ShoutingPlayer,
    ConversationId,
    Dialog,
    NTiles,
    Language,
    RemainingTiles,
    Note,
    Reset,
    Connected,
    HasPlayerName,
    StartType,
    Page,
}

impl ModifiedEvent {
    pub fn modified_type(&self) -> ModifiedType {
        match self {
            ModifiedEvent::PlayerFlags => ModifiedType::PlayerFlags,
            ModifiedEvent::PlayerName { .. } => ModifiedType::PlayerName,
            ModifiedEvent::ShoutingPlayer => ModifiedType::ShoutingPlayer,
            ModifiedEvent::ConversationId => ModifiedType::ConversationId,
            ModifiedEvent::Dialog => ModifiedType::Dialog,
            ModifiedEvent::NTiles => ModifiedType::NTiles,
            ModifiedEvent::Language => ModifiedType::Language,
            ModifiedEvent::RemainingTiles => ModifiedType::RemainingTiles,
            ModifiedEvent::Note { .. } => ModifiedType::Note,
            ModifiedEvent::Reset => ModifiedType::Reset,
            ModifiedEvent::Connected => ModifiedType::Connected,
            ModifiedEvent::HasPlayerName => ModifiedType::HasPlayerName,
            ModifiedEvent::StartType => ModifiedType::StartType,
            ModifiedEvent::Page => ModifiedType::Page,
        }
    }
}

#[derive(Clone, Default)]
struct Player {
    name: Option<String>,
    flags: u8,
}

/// The replicated model. Mutated only during the main-thread flush and by
/// main-thread setters; the mutex is never held across a signal emission so
/// listeners can read back synchronously.
struct Model {
    players: [Player; N_VISIBLE_PLAYERS],

    shouting_player: i32,
    remove_shout_token: Option<Token>,

    conversation_id: Option<ConversationId>,
    connected: bool,

    dialog: Dialog,
    page: u32,
    self_num: u8,
    has_player_name: bool,

    tiles: HashMap<u8, Tile>,
    /// Tile numbers ordered oldest-update-first; repaints want the newest
    /// tiles drawn last.
    tile_order: Vec<u8>,
    /// One past the highest tile number seen. The server deals tiles with
    /// consecutive numbers, so this doubles as the dealt count.
    tile_index_len: usize,

    n_tiles: i32,
    language: Language,
    start_type: StartType,

    reset_on_idle_token: Option<Token>,
}

/// State the worker-side listener touches. Guarded by its own mutex; the
/// lock order is worker lock → this lock, never the reverse.
struct Shared {
    queue: Vec<ConnectionEvent>,
    spare: Vec<ConnectionEvent>,
    flush_token: Option<Token>,
    instance: InstanceState,
    listener: Option<ListenerId>,
}

struct Inner {
    worker: Arc<Worker>,
    main_thread: Arc<MainThread>,

    model: Mutex<Model>,
    shared: Mutex<Shared>,

    event_signal: Signal<ConnectionEvent>,
    modified_signal: Signal<ModifiedEvent>,
}

/// The main-thread facade over the connection engine: a replica of the room
/// state plus command methods. Connection events arrive on the worker
/// thread, are queued, and are applied during `MainThread` idle flushes;
/// both signals only ever fire from the main thread.
pub struct GameState {
    inner: Arc<Inner>,
}

impl GameState {
    pub fn new(
        main_thread: Arc<MainThread>,
        worker: Arc<Worker>,
        default_language: &str,
    ) -> GameState {
        let inner = Arc::new(Inner {
            worker,
            main_thread,
            model: Mutex::new(Model {
                players: Default::default(),
                shouting_player: -1,
                remove_shout_token: None,
                conversation_id: None,
                connected: false,
                dialog: Dialog::Name,
                page: 0,
                self_num: 0,
                has_player_name: false,
                tiles: HashMap::new(),
                tile_order: Vec::new(),
                tile_index_len: 0,
                n_tiles: 0,
                language: Language::from_code(default_language),
                start_type: StartType::NewGame,
                reset_on_idle_token: None,
            }),
            shared: Mutex::new(Shared {
                queue: Vec::new(),
                spare: Vec::new(),
                flush_token: None,
                instance: InstanceState::new(),
                listener: None,
            }),
            event_signal: Signal::new(),
            modified_signal: Signal::new(),
        });

        let weak = Arc::downgrade(&inner);
        let listener = inner.worker.lock().event_signal().add(move |event| {
            if let Some(inner) = weak.upgrade() {
                Inner::on_connection_event(&inner, event);
            }
        });

        inner.lock_shared().listener = Some(listener);

        GameState { inner }
    }

    /// Fires from the idle flush with a copy of every connection event, in
    /// arrival order, after the model has been updated.
    pub fn event_signal(&self) -> &Signal<ConnectionEvent> {
        &self.inner.event_signal
    }

    pub fn modified_signal(&self) -> &Signal<ModifiedEvent> {
        &self.inner.modified_signal
    }

    pub fn get_n_tiles(&self) -> i32 {
        self.inner.lock_model().n_tiles
    }

    pub fn get_remaining_tiles(&self) -> i32 {
        let model = self.inner.lock_model();
        model.n_tiles - model.tile_index_len as i32
    }

    pub fn get_language(&self) -> Language {
        self.inner.lock_model().language
    }

    pub fn foreach_tile<F: FnMut(&Tile)>(&self, mut callback: F) {
        let tiles: Vec<Tile> = {
            let model = self.inner.lock_model();
            model
                .tile_order
                .iter()
                .map(|num| model.tiles[num])
                .collect()
        };

        for tile in &tiles {
            callback(tile);
        }
    }

    pub fn foreach_player<F: FnMut(u8, Option<&str>, u8)>(&self, mut callback: F) {
        let players: Vec<Player> = self.inner.lock_model().players.to_vec();

        for (player_num, player) in players.iter().enumerate() {
            callback(player_num as u8, player.name.as_deref(), player.flags);
        }
    }

    pub fn get_self(&self) -> u8 {
        self.inner.lock_model().self_num
    }

    pub fn get_shouting_player(&self) -> i32 {
        self.inner.lock_model().shouting_player
    }

    pub fn get_conversation_id(&self) -> Option<ConversationId> {
        self.inner.lock_model().conversation_id
    }

    pub fn get_dialog(&self) -> Dialog {
        self.inner.lock_model().dialog
    }

    pub fn set_dialog(&self, dialog: Dialog) {
        self.inner.set_dialog(dialog);
    }

    /// Dismisses the current dialog. Falls back to the name dialog while no
    /// player name exists, because the game cannot start without one.
    pub fn close_dialog(&self) {
        self.inner.close_dialog();
    }

    pub fn get_page(&self) -> u32 {
        self.inner.lock_model().page
    }

    pub fn set_page(&self, page: u32) {
        self.inner.set_page(page);
    }

    pub fn get_connected(&self) -> bool {
        self.inner.lock_model().connected
    }

    /// True once any tile has been revealed.
    pub fn get_started(&self) -> bool {
        self.inner.lock_model().tile_index_len > 0
    }

    pub fn get_start_type(&self) -> StartType {
        self.inner.lock_model().start_type
    }

    pub fn set_start_type(&self, start_type: StartType) {
        self.inner.set_start_type(start_type);
    }

    pub fn get_has_player_name(&self) -> bool {
        self.inner.lock_model().has_player_name
    }

    pub fn shout(&self) {
        self.inner.worker.lock().shout();
    }

    pub fn turn(&self) {
        self.inner.worker.lock().turn();
    }

    pub fn move_tile(&self, tile_num: u8, x: i16, y: i16) {
        self.inner.worker.lock().move_tile(tile_num, x, y);
    }

    pub fn set_n_tiles(&self, n_tiles: u8) {
        self.inner.worker.lock().set_n_tiles(n_tiles);
    }

    pub fn set_language(&self, language_code: &str) {
        self.inner.worker.lock().set_language(language_code);
    }

    pub fn send_message(&self, text: &str) {
        self.inner.worker.lock().send_message(text);
    }

    pub fn set_typing(&self, typing: bool) {
        self.inner.worker.lock().set_typing(typing);
    }

    pub fn leave(&self) {
        self.inner.worker.lock().leave();
    }

    pub fn set_player_name(&self, player_name: &str) {
        self.inner.worker.lock().set_player_name(player_name);
        self.inner.set_has_player_name(true);
    }

    /// Surfaces a transient text note to the shell. Pure notification; no
    /// model state is involved.
    pub fn set_note(&self, text: &str) {
        self.inner.set_note(text.to_owned());
    }

    /// Resets the engine and every replicated observable back to
    /// construction defaults, preserving the language. Ends with exactly one
    /// RESET notification.
    pub fn reset(&self) {
        Inner::reset_full(&self.inner, None);
    }

    /// Like [`GameState::reset`] but pins a conversation id so the next
    /// connection joins that game.
    pub fn reset_for_conversation_id(&self, conversation_id: ConversationId) {
        Inner::reset_full(&self.inner, Some(conversation_id));
    }

    /// Serialises the instance-state checkpoint. Callable from any thread.
    pub fn save_instance_state(&self) -> String {
        self.inner.lock_shared().instance.save()
    }

    /// Loads a checkpoint produced by [`GameState::save_instance_state`] and
    /// applies it: the pinned identity goes to the engine, the dialog and
    /// page to the model. Main thread only.
    pub fn load_instance_state(&self, source: &str) {
        let (id, dialog, page) = {
            let mut shared = self.inner.lock_shared();
            shared.instance.load(source);
            (shared.instance.id, shared.instance.dialog, shared.instance.page)
        };

        match id {
            StateId::None => (),
            StateId::Conversation(conversation_id) => {
                self.inner.worker.lock().set_conversation_id(conversation_id);
            }
            StateId::Person(person_id) => {
                self.inner.worker.lock().set_person_id(person_id);

                // A person id means the server already has a name for us.
                self.inner.set_has_player_name(true);
            }
        }

        self.inner.set_start_type(match id {
            StateId::Conversation(_) => StartType::JoinGame,
            _ => StartType::NewGame,
        });

        self.inner.set_dialog(dialog);
        self.inner.set_page(page);
    }
}

impl Drop for GameState {
    fn drop(&mut self) {
        // Unregister from the engine first so no further events can queue,
        // then cancel everything already scheduled.
        let listener = self.inner.lock_shared().listener.take();

        if let Some(listener) = listener {
            self.inner.worker.lock().event_signal().remove(listener);
        }

        let flush_token = self.inner.lock_shared().flush_token.take();

        if let Some(token) = flush_token {
            self.inner.main_thread.cancel(token);
        }

        let (reset_token, shout_token) = {
            let mut model = self.inner.lock_model();
            (
                model.reset_on_idle_token.take(),
                model.remove_shout_token.take(),
            )
        };

        if let Some(token) = reset_token {
            self.inner.main_thread.cancel(token);
        }

        if let Some(token) = shout_token {
            self.inner.main_thread.cancel(token);
        }

        self.inner.lock_shared().queue.clear();
    }
}

impl Inner {
    fn lock_model(&self) -> std::sync::MutexGuard<'_, Model> {
        self.model.lock().expect("Game state model lock poisoned")
    }

    fn lock_shared(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().expect("Game state queue lock poisoned")
    }

    /// Runs on the worker thread with the worker lock held: copy the event,
    /// mirror identity into the instance state and schedule one flush.
    fn on_connection_event(this: &Arc<Inner>, event: &ConnectionEvent) {
        // Poll changes are frequent and only interesting to the worker.
        if let EventKind::PollChanged(_) = event.kind {
            return;
        }

        let mut shared = this.lock_shared();

        shared.queue.push(event.clone());

        if let EventKind::Header { person_id, .. } = event.kind {
            // Recorded immediately so a checkpoint taken before the next
            // flush still carries the seat.
            shared.instance.id = StateId::Person(person_id);
        }

        if shared.flush_token.is_none() {
            let weak = Arc::downgrade(this);
            shared.flush_token = Some(this.main_thread.queue_idle(move || {
                if let Some(inner) = weak.upgrade() {
                    Inner::flush_queue(&inner);
                }
            }));
        }
    }

    /// The idle flush: steal the queue, apply each event to the model and
    /// re-emit it. Runs on the main thread.
    fn flush_queue(this: &Arc<Inner>) {
        let events = {
            let mut shared = this.lock_shared();
            shared.flush_token = None;

            let spare = std::mem::take(&mut shared.spare);
            std::mem::replace(&mut shared.queue, spare)
        };

        for event in &events {
            Inner::handle_event(this, event);
            this.event_signal.emit(event);
        }

        let mut spare = events;
        spare.clear();
        this.lock_shared().spare = spare;
    }

    fn handle_event(this: &Arc<Inner>, event: &ConnectionEvent) {
        match &event.kind {
            EventKind::Header { self_num, .. } => {
                // The header means the connection has succeeded.
                this.lock_model().self_num = *self_num;
                this.set_connected(true);
            }
            EventKind::ConversationId(id) => this.set_conversation_id(Some(*id)),
            EventKind::PlayerNameChanged { player_num, name } => {
                this.handle_player_name_changed(*player_num, name);
            }
            EventKind::PlayerFlagsChanged { player_num, flags } => {
                this.handle_player_flags_changed(*player_num, *flags, event.synced);
            }
            EventKind::PlayerShouted { player_num } => {
                Inner::handle_player_shouted(this, *player_num);
            }
            EventKind::TileChanged {
                num,
                x,
                y,
                letter,
                last_player_moved,
            } => {
                this.handle_tile_changed(Tile {
                    num: *num,
                    x: *x,
                    y: *y,
                    letter: *letter,
                    last_player_moved: *last_player_moved,
                });
            }
            EventKind::NTilesChanged(n_tiles) => this.handle_n_tiles_changed(*n_tiles),
            EventKind::LanguageChanged(code) => this.handle_language_changed(code),
            EventKind::Error(kind) => Inner::handle_error(this, *kind),
            EventKind::End => Inner::queue_reset_on_idle(this),
            EventKind::Message { .. }
            | EventKind::RunningStateChanged(_)
            | EventKind::PollChanged(_) => (),
        }
    }

    fn handle_player_name_changed(&self, player_num: u8, name: &str) {
        if player_num as usize >= N_VISIBLE_PLAYERS {
            return;
        }

        {
            let mut model = self.lock_model();
            model.players[player_num as usize].name = Some(name.to_owned());
        }

        self.modified_signal.emit(&ModifiedEvent::PlayerName {
            player_num,
            name: name.to_owned(),
        });
    }

    fn handle_player_flags_changed(&self, player_num: u8, flags: u8, synced: bool) {
        if player_num as usize >= N_VISIBLE_PLAYERS {
            return;
        }

        let note = {
            let mut model = self.lock_model();
            let old_flags = model.players[player_num as usize].flags;

            if old_flags == flags {
                return;
            }

            model.players[player_num as usize].flags = flags;

            if synced && (old_flags ^ flags) & PLAYER_FLAG_CONNECTED != 0 {
                model.player_note(player_num)
            } else {
                None
            }
        };

        if let Some(note) = note {
            self.set_note(note);
        }

        self.modified_signal.emit(&ModifiedEvent::PlayerFlags);
    }

    fn handle_player_shouted(this: &Arc<Inner>, player_num: u8) {
        let weak = Arc::downgrade(this);
        let token = this.main_thread.queue_timeout(SHOUT_TIME, move || {
            if let Some(inner) = weak.upgrade() {
                inner.shout_timeout_fired();
            }
        });

        let (old_token, changed) = {
            let mut model = this.lock_model();
            let old_token = model.remove_shout_token.replace(token);

            let changed = model.shouting_player != i32::from(player_num);
            if changed {
                model.shouting_player = i32::from(player_num);
            }

            (old_token, changed)
        };

        if let Some(old_token) = old_token {
            this.main_thread.cancel(old_token);
        }

        if changed {
            this.modified_signal.emit(&ModifiedEvent::ShoutingPlayer);
        }
    }

    fn shout_timeout_fired(&self) {
        let changed = {
            let mut model = self.lock_model();
            model.remove_shout_token = None;

            if model.shouting_player == -1 {
                false
            } else {
                model.shouting_player = -1;
                true
            }
        };

        if changed {
            self.modified_signal.emit(&ModifiedEvent::ShoutingPlayer);
        }
    }

    fn remove_shout(&self) {
        let (token, changed) = {
            let mut model = self.lock_model();
            let token = model.remove_shout_token.take();

            if model.shouting_player == -1 {
                (token, false)
            } else {
                model.shouting_player = -1;
                (token, true)
            }
        };

        if let Some(token) = token {
            self.main_thread.cancel(token);
        }

        if changed {
            self.modified_signal.emit(&ModifiedEvent::ShoutingPlayer);
        }
    }

    fn handle_tile_changed(&self, tile: Tile) {
        let (close_invite, grew) = {
            let mut model = self.lock_model();

            let old_len = model.tile_index_len;

            if model.tiles.insert(tile.num, tile).is_some() {
                model.tile_order.retain(|&num| num != tile.num);
            }
            model.tile_order.push(tile.num);

            model.tile_index_len = model.tile_index_len.max(tile.num as usize + 1);

            // The invite dialog covers the board when the game starts;
            // close it when the first tile lands so the tile is visible.
            let close_invite = old_len == 0 && model.dialog == Dialog::InviteLink;

            (close_invite, model.tile_index_len > old_len)
        };

        if close_invite {
            self.close_dialog();
        }

        if grew {
            self.modified_signal.emit(&ModifiedEvent::RemainingTiles);
        }
    }

    fn handle_n_tiles_changed(&self, n_tiles: u8) {
        {
            let mut model = self.lock_model();

            if model.n_tiles == i32::from(n_tiles) {
                return;
            }

            model.n_tiles = i32::from(n_tiles);
        }

        self.modified_signal.emit(&ModifiedEvent::NTiles);
        self.modified_signal.emit(&ModifiedEvent::RemainingTiles);
    }

    fn handle_language_changed(&self, code: &str) {
        let language = Language::from_code(code);

        {
            let mut model = self.lock_model();

            if model.language == language {
                return;
            }

            model.language = language;
        }

        self.modified_signal.emit(&ModifiedEvent::Language);
    }

    fn handle_error(this: &Arc<Inner>, kind: ErrorKind) {
        this.set_connected(false);

        let note = match kind {
            ErrorKind::BadPlayerId | ErrorKind::BadConversationId => Text::BadGame,
            ErrorKind::ConversationFull => Text::GameFull,
            _ => return,
        };

        Inner::queue_reset_on_idle(this);

        let text = text::get(this.lock_model().language, note);
        this.set_note(text.to_owned());
    }

    fn queue_reset_on_idle(this: &Arc<Inner>) {
        let mut model = this.lock_model();

        if model.reset_on_idle_token.is_some() {
            return;
        }

        let weak = Arc::downgrade(this);
        model.reset_on_idle_token = Some(this.main_thread.queue_idle(move || {
            if let Some(inner) = weak.upgrade() {
                {
                    inner.lock_model().reset_on_idle_token = None;
                }
                Inner::reset_full(&inner, None);
            }
        }));
    }

    fn reset_full(this: &Arc<Inner>, conversation_id: Option<ConversationId>) {
        let language_code = this.lock_model().language.code();

        {
            let mut connection = this.worker.lock();
            connection.reset();
            connection.set_default_language(language_code);

            if let Some(conversation_id) = conversation_id {
                connection.set_conversation_id(conversation_id);
            }

            connection.set_running(true);
        }

        let flush_token = {
            let mut shared = this.lock_shared();

            shared.queue.clear();

            shared.instance.id = match conversation_id {
                Some(conversation_id) => StateId::Conversation(conversation_id),
                None => StateId::None,
            };

            shared.flush_token.take()
        };

        if let Some(token) = flush_token {
            this.main_thread.cancel(token);
        }

        let reset_token = this.lock_model().reset_on_idle_token.take();

        if let Some(token) = reset_token {
            this.main_thread.cancel(token);
        }

        this.set_has_player_name(false);
        this.remove_shout();
        this.set_conversation_id(conversation_id);
        this.reset_player_names();
        this.reset_player_flags();
        this.set_dialog(Dialog::Name);
        this.set_start_type(match conversation_id {
            Some(_) => StartType::JoinGame,
            None => StartType::NewGame,
        });
        this.reset_tiles();
        this.set_connected(false);

        this.modified_signal.emit(&ModifiedEvent::Reset);
    }

    fn reset_player_names(&self) {
        let blanked: Vec<u8> = {
            let mut model = self.lock_model();

            (0..N_VISIBLE_PLAYERS as u8)
                .filter(|&player_num| {
                    let player = &mut model.players[player_num as usize];

                    match &player.name {
                        Some(name) if !name.is_empty() => {
                            player.name = Some(String::new());
                            true
                        }
                        _ => false,
                    }
                })
                .collect()
        };

        for player_num in blanked {
            self.modified_signal.emit(&ModifiedEvent::PlayerName {
                player_num,
                name: String::new(),
            });
        }
    }

    fn reset_player_flags(&self) {
        let changed = {
            let mut model = self.lock_model();
            let mut changed = false;

            for player in model.players.iter_mut() {
                if player.flags != 0 {
                    player.flags = 0;
                    changed = true;
                }
            }

            changed
        };

        if changed {
            self.modified_signal.emit(&ModifiedEvent::PlayerFlags);
        }
    }

    fn reset_tiles(&self) {
        let had_tiles = {
            let mut model = self.lock_model();
            let had_tiles = model.tile_index_len > 0;

            model.tiles.clear();
            model.tile_order.clear();
            model.tile_index_len = 0;
            model.n_tiles = 0;
            model.self_num = 0;

            had_tiles
        };

        if had_tiles {
            self.modified_signal.emit(&ModifiedEvent::RemainingTiles);
        }
    }

    fn set_connected(&self, value: bool) {
        {
            let mut model = self.lock_model();

            if model.connected == value {
                return;
            }

            model.connected = value;
        }

        self.modified_signal.emit(&ModifiedEvent::Connected);
    }

    fn set_conversation_id(&self, value: Option<ConversationId>) {
        {
            let mut model = self.lock_model();

            if model.conversation_id == value {
                return;
            }

            model.conversation_id = value;
        }

        self.modified_signal.emit(&ModifiedEvent::ConversationId);
    }

    fn set_has_player_name(&self, value: bool) {
        {
            let mut model = self.lock_model();

            if model.has_player_name == value {
                return;
            }

            model.has_player_name = value;
        }

        self.modified_signal.emit(&ModifiedEvent::HasPlayerName);
    }

    fn set_dialog(&self, dialog: Dialog) {
        {
            let mut model = self.lock_model();

            if model.dialog == dialog {
                return;
            }

            model.dialog = dialog;
        }

        self.lock_shared().instance.dialog = dialog;

        self.modified_signal.emit(&ModifiedEvent::Dialog);
    }

    fn close_dialog(&self) {
        let has_player_name = self.lock_model().has_player_name;

        self.set_dialog(choose!(has_player_name => Dialog::None, Dialog::Name));
    }

    fn set_page(&self, page: u32) {
        {
            let mut model = self.lock_model();

            if model.page == page {
                return;
            }

            model.page = page;
        }

        self.lock_shared().instance.page = page;

        self.modified_signal.emit(&ModifiedEvent::Page);
    }

    fn set_start_type(&self, start_type: StartType) {
        {
            let mut model = self.lock_model();

            if model.start_type == start_type {
                return;
            }

            model.start_type = start_type;
        }

        self.modified_signal.emit(&ModifiedEvent::StartType);
    }

    fn set_note(&self, text: String) {
        self.modified_signal.emit(&ModifiedEvent::Note { text });
    }
}

impl Model {
    /// The joined/left note for a seat, or None when the change concerns
    /// ourselves or an unnamed player.
    fn player_note(&self, player_num: u8) -> Option<String> {
        if player_num == self.self_num {
            return None;
        }

        let player = &self.players[player_num as usize];

        let name = match &player.name {
            Some(name) if !name.is_empty() => name,
            _ => return None,
        };

        let note = if player.flags & PLAYER_FLAG_CONNECTED != 0 {
            Text::PlayerJoined
        } else {
            Text::PlayerLeft
        };

        Some(text::format_player_note(self.language, note, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::Connection;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Instant;

    struct Harness {
        listener: TcpListener,
        main_thread: Arc<MainThread>,
        worker: Arc<Worker>,
        game_state: Option<GameState>,
        server: Option<TcpStream>,
        idle_flag: Arc<AtomicBool>,
    }

    impl Harness {
        fn new() -> Harness {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();

            let idle_flag = Arc::new(AtomicBool::new(false));
            let flag = idle_flag.clone();
            let main_thread = MainThread::new(Box::new(move || {
                flag.store(true, Ordering::SeqCst);
            }));

            let mut connection = Connection::new(None);
            connection.set_room("test_room");
            connection.set_address(listener.local_addr().unwrap());

            let worker = Arc::new(Worker::new(connection, None).unwrap());

            let game_state = GameState::new(main_thread.clone(), worker.clone(), "en");

            assert!(!game_state.get_has_player_name());

            Harness {
                listener,
                main_thread,
                worker,
                game_state: Some(game_state),
                server: None,
                idle_flag,
            }
        }

        fn started() -> Harness {
            let mut harness = Harness::new();
            harness.start();
            harness
        }

        fn negotiated() -> Harness {
            let mut harness = Harness::started();
            harness.negotiate();
            harness
        }

        fn gs(&self) -> &GameState {
            self.game_state.as_ref().unwrap()
        }

        fn accept_connection(&mut self) {
            let (server, _) = self.listener.accept().unwrap();
            server
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();
            self.server = Some(server);
        }

        fn start(&mut self) {
            let (events, _modifieds, remove) = self.install_listeners();

            self.worker.lock().set_running(true);
            self.gs().set_player_name("test_player");

            assert!(self.gs().get_has_player_name());

            self.accept_connection();
            self.wait_for_idle_queue();

            remove(self);

            let events = events.lock().unwrap();
            assert!(
                events
                    .iter()
                    .any(|event| matches!(event.kind, EventKind::RunningStateChanged(true))),
                "No running-state event after starting the connection"
            );
        }

        fn write_data(&mut self, data: &[u8]) {
            self.server.as_mut().unwrap().write_all(data).unwrap();
        }

        fn expect_data(&mut self, expected: &[u8]) {
            let server = self.server.as_mut().unwrap();

            let mut buf = vec![0u8; expected.len()];
            server.read_exact(&mut buf).unwrap();

            assert_eq!(buf, expected, "Data read from client does not match expected");
        }

        /// Waits for the main thread to announce a pending flush. Locking
        /// the worker afterwards guarantees the full event batch has been
        /// queued before the caller flushes.
        fn wait_for_idle_queue_no_flush(&mut self) {
            let limit = Instant::now() + Duration::from_secs(12);

            while !self.idle_flag.load(Ordering::SeqCst) {
                assert!(
                    Instant::now() < limit,
                    "The game state didn't queue an idle event when one was expected"
                );
                thread::sleep(Duration::from_millis(5));
            }

            self.idle_flag.store(false, Ordering::SeqCst);

            drop(self.worker.lock());
        }

        fn wait_for_idle_queue(&mut self) {
            self.wait_for_idle_queue_no_flush();
            self.main_thread.flush_idle_events();
        }

        /// Installs collecting listeners on both signals, returning the
        /// collections and a closure that removes the listeners.
        #[allow(clippy::type_complexity)]
        fn install_listeners(
            &self,
        ) -> (
            Arc<Mutex<Vec<ConnectionEvent>>>,
            Arc<Mutex<Vec<ModifiedEvent>>>,
            Box<dyn FnOnce(&Harness)>,
        ) {
            let events: Arc<Mutex<Vec<ConnectionEvent>>> = Arc::new(Mutex::new(Vec::new()));
            let modifieds: Arc<Mutex<Vec<ModifiedEvent>>> = Arc::new(Mutex::new(Vec::new()));

            let event_sink = events.clone();
            let event_id = self.gs().event_signal().add(move |event| {
                event_sink.lock().unwrap().push(event.clone());
            });

            let modified_sink = modifieds.clone();
            let modified_id = self.gs().modified_signal().add(move |event| {
                modified_sink.lock().unwrap().push(event.clone());
            });

            let remove = Box::new(move |harness: &Harness| {
                harness.gs().event_signal().remove(event_id);
                harness.gs().modified_signal().remove(modified_id);
            });

            (events, modifieds, remove)
        }

        /// Writes `data`, waits for the idle flush and returns everything
        /// both signals emitted.
        fn collect_response(&mut self, data: &[u8]) -> (Vec<ConnectionEvent>, Vec<ModifiedEvent>) {
            let (events, modifieds, remove) = self.install_listeners();

            self.write_data(data);
            self.wait_for_idle_queue();

            remove(self);

            let events = events.lock().unwrap().clone();
            let modifieds = modifieds.lock().unwrap().clone();

            (events, modifieds)
        }

        fn check_no_modification(&mut self, data: &[u8]) {
            let (_, modifieds) = self.collect_response(data);

            assert!(
                modifieds.is_empty(),
                "Received modification event when none was expected: {:?}",
                modifieds
            );
        }

        fn negotiate(&mut self) {
            self.expect_data(
                b"GET / HTTP/1.1\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  \r\n",
            );
            self.write_data(b"\r\n\r\n");
            self.expect_data(b"\x82\x17\x80test_room\x00test_player\x00");
            self.send_player_id();
        }

        fn send_player_id(&mut self) {
            let (events, _) = self.collect_response(b"\x82\x0a\x00ghijklmn\x00");

            let header = events
                .iter()
                .find_map(|event| match event.kind {
                    EventKind::Header { person_id, self_num } => Some((person_id, self_num)),
                    _ => None,
                })
                .expect("No header event received");

            assert_eq!(header, (0x6e6d_6c6b_6a69_6867, 0));
            assert_eq!(self.gs().get_self(), 0);
        }

        fn add_player(&mut self) {
            let (events, modifieds) = self.collect_response(b"\x82\x09\x04\x01George\x00");

            assert!(events.iter().any(|event| matches!(
                &event.kind,
                EventKind::PlayerNameChanged { player_num: 1, name } if name == "George"
            )));
            assert!(modifieds.iter().any(|modified| matches!(
                modified,
                ModifiedEvent::PlayerName { player_num: 1, name } if name == "George"
            )));
        }

        fn set_player_flags(&mut self, player_num: u8, flags: u8, expect_modified: bool) {
            let (events, modifieds) =
                self.collect_response(&[0x82, 0x03, 0x05, player_num, flags]);

            assert!(events.iter().any(|event| matches!(
                event.kind,
                EventKind::PlayerFlagsChanged { player_num: p, flags: f }
                    if p == player_num && f == flags
            )));

            let had_flags_modified = modifieds
                .iter()
                .any(|m| m.modified_type() == ModifiedType::PlayerFlags);

            assert_eq!(had_flags_modified, expect_modified);
        }

        fn send_shout(&mut self, player_num: u8, expect_modified: bool) {
            let (events, modifieds) = self.collect_response(&[0x82, 0x02, 0x06, player_num]);

            assert!(events
                .iter()
                .all(|event| matches!(event.kind, EventKind::PlayerShouted { .. })));
            assert!(!events.is_empty());

            let had_shout_modified = modifieds
                .iter()
                .any(|m| m.modified_type() == ModifiedType::ShoutingPlayer);
            assert_eq!(had_shout_modified, expect_modified);

            assert_eq!(self.gs().get_shouting_player(), i32::from(player_num));
        }

        fn send_tile(
            &mut self,
            num: u8,
            x: i16,
            y: i16,
            letter: char,
            player: u8,
            expected_remaining: Option<i32>,
        ) {
            let mut frame = vec![0x82, 0, 0x03, num];
            frame.extend_from_slice(&x.to_le_bytes());
            frame.extend_from_slice(&y.to_le_bytes());

            let mut letter_buf = [0u8; 4];
            frame.extend_from_slice(letter.encode_utf8(&mut letter_buf).as_bytes());
            frame.push(0);
            frame.push(player);
            frame[1] = (frame.len() - 2) as u8;

            let (events, modifieds) = self.collect_response(&frame);

            assert!(
                events.iter().any(|event| matches!(
                    event.kind,
                    EventKind::TileChanged { num: n, x: ex, y: ey, letter: l, .. }
                        if n == num && ex == x && ey == y && l == letter
                )),
                "Tile from event does not match sent tile"
            );

            if let Some(expected_remaining) = expected_remaining {
                assert!(modifieds
                    .iter()
                    .any(|m| m.modified_type() == ModifiedType::RemainingTiles));
                assert_eq!(self.gs().get_remaining_tiles(), expected_remaining);
            }
        }

        fn set_to_french(&mut self) {
            let (_, modifieds) = self.collect_response(b"\x82\x04\x0cfr\x00");

            assert!(modifieds
                .iter()
                .any(|m| m.modified_type() == ModifiedType::Language));
            assert_eq!(self.gs().get_language(), Language::French);
        }

        fn send_conversation_id(&mut self) {
            let (_, modifieds) =
                self.collect_response(b"\x82\x09\x09\x81\x82\x83\x84\x85\x86\x87\x88");

            assert!(modifieds
                .iter()
                .any(|m| m.modified_type() == ModifiedType::ConversationId));
            assert_eq!(
                self.gs().get_conversation_id(),
                Some(0x8887_8685_8483_8281)
            );
        }
    }

    fn modified_mask(modifieds: &[ModifiedEvent]) -> u32 {
        modifieds
            .iter()
            .fold(0, |mask, m| mask | 1 << m.modified_type() as u32)
    }

    fn mask_of(types: &[ModifiedType]) -> u32 {
        types.iter().fold(0, |mask, &t| mask | 1 << t as u32)
    }

    #[test]
    fn test_self() {
        let harness = Harness::negotiated();

        assert_eq!(harness.gs().get_self(), 0);
        assert!(harness.gs().get_connected());
    }

    #[test]
    fn test_connected_lifecycle() {
        let mut harness = Harness::started();

        assert!(!harness.gs().get_connected());

        harness.negotiate();
        assert!(harness.gs().get_connected());

        // Dropping the server side closes the socket; the error must clear
        // the connected flag.
        let (_, modifieds, remove) = harness.install_listeners();
        harness.server = None;
        harness.wait_for_idle_queue();
        remove(&harness);

        assert!(!harness.gs().get_connected());
        assert!(modifieds.lock().unwrap()
            .iter()
            .any(|m| m.modified_type() == ModifiedType::Connected));
    }

    #[test]
    fn test_reset() {
        let mut harness = Harness::negotiated();

        harness.set_to_french();
        harness.send_tile(0, 1, 2, 'C', 0, None);
        harness.add_player();
        harness.set_player_flags(1, 1, true);
        harness.send_shout(1, true);
        harness.send_conversation_id();

        // Leave an unflushed event in the queue so the reset has something
        // to drop.
        harness.write_data(b"\x82\x04\x01\x00!\x00");
        harness.wait_for_idle_queue_no_flush();

        harness.gs().set_dialog(Dialog::InviteLink);
        harness.gs().set_start_type(StartType::JoinGame);

        let (events, modifieds, remove) = harness.install_listeners();

        harness.gs().reset();
        harness.main_thread.flush_idle_events();

        remove(&harness);

        assert!(
            events.lock().unwrap().is_empty(),
            "Events were triggered after resetting the game state"
        );

        let expected = mask_of(&[
            ModifiedType::Dialog,
            ModifiedType::Reset,
            ModifiedType::PlayerName,
            ModifiedType::PlayerFlags,
            ModifiedType::ShoutingPlayer,
            ModifiedType::StartType,
            ModifiedType::ConversationId,
            ModifiedType::RemainingTiles,
            ModifiedType::Connected,
            ModifiedType::HasPlayerName,
        ]);

        assert_eq!(modified_mask(&modifieds.lock().unwrap()), expected);

        let resets = modifieds
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.modified_type() == ModifiedType::Reset)
            .count();
        assert_eq!(resets, 1);

        // The language survives; everything else reverts
        assert_eq!(harness.gs().get_language(), Language::French);
        assert_eq!(harness.gs().get_dialog(), Dialog::Name);

        let mut n_tiles = 0;
        harness.gs().foreach_tile(|_| n_tiles += 1);
        assert_eq!(n_tiles, 0);

        harness.gs().foreach_player(|_, name, flags| {
            assert!(name.map_or(true, str::is_empty));
            assert_eq!(flags, 0);
        });

        assert!(!harness.gs().get_connected());
        assert!(!harness.gs().get_has_player_name());
        assert_eq!(harness.gs().get_shouting_player(), -1);
        assert!(!harness.gs().get_started());
        assert_eq!(harness.gs().get_start_type(), StartType::NewGame);
        assert_eq!(harness.gs().get_conversation_id(), None);

        // The person id is gone from the instance state
        assert_eq!(harness.gs().save_instance_state(), "dialog=name");
    }

    #[test]
    fn test_reset_for_conversation_id() {
        let mut harness = Harness::negotiated();

        harness
            .gs()
            .reset_for_conversation_id(0xfedc_ba98_7654_3210);

        assert_eq!(harness.gs().get_start_type(), StartType::JoinGame);

        harness.gs().set_player_name("bob");
        assert!(harness.gs().get_has_player_name());

        // The engine reconnects; the new socket must carry the join
        harness.accept_connection();

        harness.expect_data(
            b"GET / HTTP/1.1\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              \r\n",
        );
        harness.write_data(b"\r\n\r\n");
        harness.expect_data(b"\x82\x0d\x8d\x10\x32\x54\x76\x98\xba\xdc\xfebob\x00");
    }

    fn check_join_error(error_frame: &[u8], expected_kind: ErrorKind, expected_note: &str) {
        let mut harness = Harness::negotiated();

        let (events, modifieds, remove) = harness.install_listeners();

        harness.write_data(error_frame);
        harness.wait_for_idle_queue();

        {
            let events = events.lock().unwrap();
            let errors: Vec<_> = events
                .iter()
                .filter_map(|event| match event.kind {
                    EventKind::Error(kind) => Some(kind),
                    _ => None,
                })
                .collect();

            assert_eq!(errors, vec![expected_kind]);
        }

        // The reset is deferred to the next idle flush
        assert!(!modifieds
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.modified_type() == ModifiedType::Reset));
        assert!(
            harness.idle_flag.load(Ordering::SeqCst),
            "No idle queued after the join error event"
        );

        harness.wait_for_idle_queue();

        remove(&harness);

        let modifieds = modifieds.lock().unwrap();

        assert!(modifieds
            .iter()
            .any(|m| m.modified_type() == ModifiedType::Reset));
        assert!(modifieds.iter().any(|m| matches!(
            m,
            ModifiedEvent::Note { text } if text == expected_note
        )));
    }

    #[test]
    fn test_bad_player_id_error() {
        check_join_error(
            b"\x82\x01\x0b",
            ErrorKind::BadPlayerId,
            "This game is no longer available. Please start a new one instead.",
        );
    }

    #[test]
    fn test_game_full_error() {
        check_join_error(
            b"\x82\x01\x0d",
            ErrorKind::ConversationFull,
            "This game is full. Please start a new one instead.",
        );
    }

    #[test]
    fn test_end() {
        let mut harness = Harness::negotiated();

        let (events, modifieds, remove) = harness.install_listeners();

        harness.write_data(b"\x82\x01\x08");
        harness.wait_for_idle_queue();

        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event.kind, EventKind::End)));
        assert!(!modifieds
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.modified_type() == ModifiedType::Reset));

        harness.wait_for_idle_queue();

        remove(&harness);

        let modifieds = modifieds.lock().unwrap();

        assert!(modifieds
            .iter()
            .any(|m| m.modified_type() == ModifiedType::Reset));
        // A clean end is not an error; no note
        assert!(!modifieds
            .iter()
            .any(|m| m.modified_type() == ModifiedType::Note));
    }

    #[test]
    fn test_dangling_bad_id() {
        let mut harness = Harness::negotiated();

        let (events, remove) = harness.collect_event_listener();

        harness.write_data(b"\x82\x01\x0b");
        harness.wait_for_idle_queue();

        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event.kind, EventKind::Error(ErrorKind::BadPlayerId))));
        assert!(
            harness.idle_flag.load(Ordering::SeqCst),
            "No idle queued after getting the bad id event"
        );

        remove(&harness);

        // Free the game state while the reset is still pending, then flush:
        // the cancelled idle must not fire into freed state.
        harness.game_state = None;

        harness.main_thread.flush_idle_events();
    }

    impl Harness {
        /// Like install_listeners but only the event side, for tests that
        /// drop the game state mid-flight.
        #[allow(clippy::type_complexity)]
        fn collect_event_listener(
            &self,
        ) -> (Arc<Mutex<Vec<ConnectionEvent>>>, Box<dyn FnOnce(&Harness)>) {
            let events: Arc<Mutex<Vec<ConnectionEvent>>> = Arc::new(Mutex::new(Vec::new()));

            let sink = events.clone();
            let id = self.gs().event_signal().add(move |event| {
                sink.lock().unwrap().push(event.clone());
            });

            let remove = Box::new(move |harness: &Harness| {
                harness.gs().event_signal().remove(id);
            });

            (events, remove)
        }
    }

    fn check_player_connected_note(joining: bool, expected_note: &str) {
        let mut harness = Harness::negotiated();

        harness.add_player();

        if joining {
            // Park the flags at 0 so the sync'd change below toggles them on
            harness.set_player_flags(1, 1, true);
            harness.set_player_flags(1, 0, true);
        } else {
            harness.set_player_flags(1, 1, true);
        }

        // Flag changes before the sync point are history; no notes
        let (_, modifieds) = harness.collect_response(if joining {
            b"\x82\x01\x07\x82\x03\x05\x01\x01"
        } else {
            b"\x82\x01\x07\x82\x03\x05\x01\x00"
        });

        let notes: Vec<_> = modifieds
            .iter()
            .filter_map(|m| match m {
                ModifiedEvent::Note { text } => Some(text.clone()),
                _ => None,
            })
            .collect();

        assert_eq!(notes, vec![expected_note.to_owned()]);
        assert!(modifieds
            .iter()
            .any(|m| m.modified_type() == ModifiedType::PlayerFlags));

        // Changing unrelated flags doesn't repeat the note
        let (_, modifieds) = harness.collect_response(if joining {
            b"\x82\x03\x05\x01\x03"
        } else {
            b"\x82\x03\x05\x01\x02"
        });
        assert!(!modifieds.iter().any(|m| m.modified_type() == ModifiedType::Note));

        // A player with no name produces no note
        let (_, modifieds) = harness.collect_response(b"\x82\x03\x05\x02\x01");
        assert!(!modifieds.iter().any(|m| m.modified_type() == ModifiedType::Note));

        // Give ourselves a name; self transitions never produce a note
        harness.write_data(b"\x82\x06\x04\x00bob\x00");
        harness.wait_for_idle_queue();

        let (_, modifieds) = harness.collect_response(b"\x82\x03\x05\x00\x01");
        assert!(!modifieds.iter().any(|m| m.modified_type() == ModifiedType::Note));
    }

    #[test]
    fn test_player_joined_note() {
        check_player_connected_note(true, "George joined the game");
    }

    #[test]
    fn test_player_left_note() {
        check_player_connected_note(false, "George left the game");
    }

    #[test]
    fn test_unsynced_flag_changes_produce_no_note() {
        let mut harness = Harness::negotiated();

        harness.add_player();

        let (_, modifieds) = harness.collect_response(b"\x82\x03\x05\x01\x01");

        assert!(modifieds
            .iter()
            .any(|m| m.modified_type() == ModifiedType::PlayerFlags));
        assert!(!modifieds.iter().any(|m| m.modified_type() == ModifiedType::Note));
    }

    #[test]
    fn test_load_instance_state() {
        let mut harness = Harness::new();

        harness
            .gs()
            .load_instance_state("person_id=5,dialog=none");

        assert_eq!(harness.gs().get_dialog(), Dialog::None);
        assert!(harness.gs().get_has_player_name());

        harness.worker.lock().set_running(true);
        harness.gs().set_player_name("test_player");
        harness.accept_connection();

        harness.expect_data(
            b"GET / HTTP/1.1\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              \r\n",
        );
        harness.write_data(b"\r\n\r\n");

        // The loaded person id turns the hello into a reconnect
        harness.expect_data(b"\x82\x0b\x81\x05\x00\x00\x00\x00\x00\x00\x00\x00\x00");
    }

    #[test]
    fn test_load_empty_instance_state() {
        let mut harness = Harness::new();

        harness.gs().load_instance_state("");

        assert!(!harness.gs().get_has_player_name());

        // An empty checkpoint starts a regular new game
        harness.start();
        harness.negotiate();
    }

    #[test]
    fn test_load_conversation_instance_state() {
        let mut harness = Harness::new();

        harness.gs().load_instance_state("conversation_id=5");

        assert_eq!(harness.gs().get_start_type(), StartType::JoinGame);

        harness.worker.lock().set_running(true);
        harness.gs().set_player_name("test_player");
        harness.accept_connection();

        harness.expect_data(
            b"GET / HTTP/1.1\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              \r\n",
        );
        harness.write_data(b"\r\n\r\n");

        harness.expect_data(b"\x82\x15\x8d\x05\x00\x00\x00\x00\x00\x00\x00test_player\x00");
    }

    #[test]
    fn test_save_instance_state() {
        let harness = Harness::negotiated();

        harness.gs().set_dialog(Dialog::None);

        assert_eq!(
            harness.gs().save_instance_state(),
            "person_id=6e6d6c6b6a696867,dialog=none"
        );
    }

    #[test]
    fn test_save_instance_state_conversation() {
        let harness = Harness::negotiated();

        harness.gs().reset_for_conversation_id(5);

        assert_eq!(
            harness.gs().save_instance_state(),
            "conversation_id=0000000000000005,dialog=name"
        );
    }

    #[test]
    fn test_save_load_roundtrip_through_game_state() {
        let harness = Harness::negotiated();

        harness.gs().set_dialog(Dialog::Guide);
        harness.gs().set_page(2);

        let saved = harness.gs().save_instance_state();
        harness.gs().load_instance_state(&saved);

        assert_eq!(harness.gs().save_instance_state(), saved);
    }

    #[test]
    fn test_typing_modified() {
        let mut harness = Harness::negotiated();

        let (_, modifieds) = harness.collect_response(b"\x82\x03\x05\x00\x03");

        assert!(modifieds
            .iter()
            .any(|m| m.modified_type() == ModifiedType::PlayerFlags));

        let mut found_connected = false;
        harness.gs().foreach_player(|_, _, flags| {
            if flags & PLAYER_FLAG_CONNECTED != 0 {
                assert!(!found_connected, "Only one connected player expected");
                assert_eq!(flags, 3);
                found_connected = true;
            }
        });
        assert!(found_connected);

        // The same flags again must not modify anything
        harness.check_no_modification(b"\x82\x03\x05\x00\x03");
    }

    #[test]
    fn test_send_all_tiles() {
        let mut harness = Harness::negotiated();

        // Tell the game state how many tiles there are so that it can
        // calculate the remaining tiles.
        harness.write_data(b"\x82\x02\x02\xff");
        harness.wait_for_idle_queue();
        assert_eq!(harness.gs().get_n_tiles(), 255);

        let mut max_tile: i32 = -1;

        for i in 0u16..256 {
            // Send them in a strange order
            let tile_num = ((i & 0xfc) | ((i & 2) >> 1) | ((i & 1) << 1)) as u8;

            let is_new_max = i32::from(tile_num) > max_tile;
            max_tile = max_tile.max(i32::from(tile_num));

            let x = (u16::from(tile_num).wrapping_mul(257)) as i16;
            let y = if tile_num & 1 != 0 {
                -(i16::from(tile_num))
            } else {
                i16::from(tile_num)
            };

            harness.send_tile(
                tile_num,
                x,
                y,
                (b'A' + tile_num % 26) as char,
                tile_num / 2,
                if is_new_max { Some(255 - max_tile - 1) } else { None },
            );
        }

        // Update one of the tiles; the enumeration set must not change
        harness.send_tile(1, 257, -1, 'B', 0, None);

        let mut seen = [false; 256];
        let mut count = 0;

        harness.gs().foreach_tile(|tile| {
            assert!(!seen[tile.num as usize], "Tile reported more than once");
            seen[tile.num as usize] = true;
            count += 1;

            if tile.num != 1 {
                let x = (u16::from(tile.num).wrapping_mul(257)) as i16;
                let y = if tile.num & 1 != 0 {
                    -(i16::from(tile.num))
                } else {
                    i16::from(tile.num)
                };

                assert_eq!((tile.x, tile.y), (x, y), "Wrong tile position reported");
                assert_eq!(tile.letter, (b'A' + tile.num % 26) as char);
            }
        });

        assert_eq!(count, 256);
    }

    #[test]
    fn test_send_all_players() {
        let mut harness = Harness::negotiated();

        for i in 0u16..256 {
            // Send them in a strange order
            let player_num = (i ^ 1) as u8;
            let name = format!("Player {}", player_num);

            let mut frame = vec![0x82, 0, 0x04, player_num];
            frame.extend_from_slice(name.as_bytes());
            frame.push(0);
            frame[1] = (frame.len() - 2) as u8;

            let (events, _) = harness.collect_response(&frame);

            assert!(events.iter().any(|event| matches!(
                &event.kind,
                EventKind::PlayerNameChanged { player_num: p, name: n }
                    if *p == player_num && *n == name
            )));

            let flags = player_num & 0x3;
            let expect_modified = flags != 0 && (player_num as usize) < N_VISIBLE_PLAYERS;
            harness.set_player_flags(player_num, flags, expect_modified);
        }

        // Update one of the players
        harness.add_player();

        let mut next_player_num = 0u8;
        harness.gs().foreach_player(|player_num, name, flags| {
            assert_eq!(player_num, next_player_num);
            next_player_num += 1;

            let expected_name = if player_num == 1 {
                "George".to_owned()
            } else {
                format!("Player {}", player_num)
            };

            assert_eq!(name, Some(expected_name.as_str()));
            assert_eq!(flags, player_num & 0x3);
        });

        assert_eq!(next_player_num as usize, N_VISIBLE_PLAYERS);
    }

    #[test]
    fn test_shouting() {
        let mut harness = Harness::negotiated();

        harness.add_player();
        harness.send_shout(1, true);

        // The same shout again triggers no modification
        harness.send_shout(1, false);

        let shout_start = Instant::now();
        harness.send_shout(0, true);

        thread::sleep(Duration::from_millis(9500));
        harness.main_thread.flush_idle_events();

        assert_eq!(harness.gs().get_shouting_player(), 0);

        // This waits long enough to see the shout clear
        let (_, modifieds, remove) = harness.install_listeners();
        harness.wait_for_idle_queue();
        remove(&harness);

        assert!(modifieds
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.modified_type() == ModifiedType::ShoutingPlayer));
        assert_eq!(harness.gs().get_shouting_player(), -1);

        let delay = shout_start.elapsed().as_secs_f32();
        assert!(
            (delay - 10.0).abs() < 0.5,
            "Expected the shout to clear after 10 seconds but it took {}",
            delay
        );
    }

    #[test]
    fn test_non_visible_shouting() {
        let mut harness = Harness::negotiated();

        harness.write_data(
            b"\x82\x04\x04\x01g\x00\
              \x82\x04\x04\x02h\x00\
              \x82\x04\x04\x03i\x00\
              \x82\x04\x04\x04j\x00\
              \x82\x04\x04\x05k\x00\
              \x82\x04\x04\x06l\x00",
        );
        harness.wait_for_idle_queue();

        // A seat outside the board still shouts
        harness.send_shout(6, true);
        harness.send_shout(1, true);
    }

    #[test]
    fn test_send_commands() {
        let mut harness = Harness::negotiated();

        harness.gs().shout();
        harness.expect_data(b"\x82\x01\x8a");

        harness.gs().turn();
        harness.expect_data(b"\x82\x01\x89");

        harness.gs().move_tile(5, 4, 2);
        harness.expect_data(b"\x82\x06\x88\x05\x04\x00\x02\x00");

        harness.gs().set_n_tiles(10);
        harness.expect_data(b"\x82\x02\x8b\x0a");

        harness.gs().set_language("fr");
        harness.expect_data(b"\x82\x04\x8efr\x00");

        harness.gs().set_typing(true);
        harness.expect_data(b"\x82\x01\x86");

        harness.gs().set_typing(false);
        harness.expect_data(b"\x82\x01\x87");

        harness.gs().send_message("Hello, world!");
        harness.expect_data(b"\x82\x0f\x85Hello, world!\x00");

        harness.gs().leave();
        harness.expect_data(b"\x82\x01\x84");
    }

    #[test]
    fn test_conversation_id() {
        let mut harness = Harness::negotiated();

        assert_eq!(harness.gs().get_conversation_id(), None);

        harness.send_conversation_id();

        // The same id again must not emit a modification
        harness.check_no_modification(b"\x82\x09\x09\x81\x82\x83\x84\x85\x86\x87\x88");
    }

    #[test]
    fn test_dialog() {
        let harness = Harness::new();

        assert_eq!(harness.gs().get_dialog(), Dialog::Name);

        let (_, modifieds, remove) = harness.install_listeners();

        harness.gs().set_dialog(Dialog::None);
        harness.gs().set_dialog(Dialog::None);

        remove(&harness);

        let modifieds = modifieds.lock().unwrap();
        let dialog_events = modifieds
            .iter()
            .filter(|m| m.modified_type() == ModifiedType::Dialog)
            .count();

        assert_eq!(dialog_events, 1);
        assert_eq!(harness.gs().get_dialog(), Dialog::None);
    }

    #[test]
    fn test_page() {
        let harness = Harness::new();

        assert_eq!(harness.gs().get_page(), 0);

        let (_, modifieds, remove) = harness.install_listeners();

        harness.gs().set_page(1);
        harness.gs().set_page(1);

        remove(&harness);

        let modifieds = modifieds.lock().unwrap();
        let page_events = modifieds
            .iter()
            .filter(|m| m.modified_type() == ModifiedType::Page)
            .count();

        assert_eq!(page_events, 1);
        assert_eq!(harness.gs().get_page(), 1);
    }

    #[test]
    fn test_n_tiles() {
        let mut harness = Harness::negotiated();

        let (_, modifieds) = harness.collect_response(b"\x82\x02\x02\x05");

        let mask = modified_mask(&modifieds);
        assert_eq!(
            mask,
            mask_of(&[ModifiedType::NTiles, ModifiedType::RemainingTiles])
        );

        assert_eq!(harness.gs().get_n_tiles(), 5);
        assert_eq!(harness.gs().get_remaining_tiles(), 5);

        harness.check_no_modification(b"\x82\x02\x02\x05");
    }

    #[test]
    fn test_language() {
        let mut harness = Harness::negotiated();

        let cases: [(&[u8], Language); 5] = [
            (b"\x82\x04\x0ceo\x00", Language::Esperanto),
            // Unknown languages resort to English
            (b"\x82\x04\x0c??\x00", Language::English),
            (b"\x82\x04\x0cfr\x00", Language::French),
            (b"\x82\x07\x0cen-sv\x00", Language::EnglishShavian),
            (b"\x82\x04\x0cen\x00", Language::English),
        ];

        for (frame, expected) in &cases {
            let (_, modifieds) = harness.collect_response(frame);

            assert!(modifieds
                .iter()
                .any(|m| m.modified_type() == ModifiedType::Language));
            assert_eq!(harness.gs().get_language(), *expected);
        }
    }

    #[test]
    fn test_note() {
        let harness = Harness::negotiated();

        let expected = "Ne eblas manĝi kokoson kun la ŝelo";

        let (_, modifieds, remove) = harness.install_listeners();

        harness.gs().set_note(expected);

        remove(&harness);

        let modifieds = modifieds.lock().unwrap();

        assert!(modifieds.iter().any(|m| matches!(
            m,
            ModifiedEvent::Note { text } if text == expected
        )));
    }

    #[test]
    fn test_started() {
        let mut harness = Harness::negotiated();

        assert!(!harness.gs().get_started());

        harness.send_tile(0, 10, 15, 'W', 0, None);

        assert!(harness.gs().get_started());
    }

    #[test]
    fn test_has_player_name() {
        let harness = Harness::new();

        let (_, modifieds, remove) = harness.install_listeners();

        assert!(!harness.gs().get_has_player_name());

        harness.gs().set_player_name("test_player");
        assert!(harness.gs().get_has_player_name());

        // Setting the name again must not emit the event a second time
        harness.gs().set_player_name("bob");

        remove(&harness);

        let count = modifieds
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.modified_type() == ModifiedType::HasPlayerName)
            .count();

        assert_eq!(count, 1);
    }

    #[test]
    fn test_close_dialog() {
        let mut harness = Harness::new();

        harness.gs().set_dialog(Dialog::Guide);
        harness.gs().close_dialog();

        // Without a name, closing falls back to the name dialog
        assert_eq!(harness.gs().get_dialog(), Dialog::Name);

        harness.start();

        harness.gs().set_dialog(Dialog::Guide);
        harness.gs().close_dialog();

        assert_eq!(harness.gs().get_dialog(), Dialog::None);
    }

    #[test]
    fn test_first_tile_close_dialog() {
        let mut harness = Harness::negotiated();

        harness.gs().set_dialog(Dialog::InviteLink);

        let (_, modifieds) =
            harness.collect_response(b"\x82\x09\x03\x00\x01\x00\x02\x00A\x00\x00");

        assert!(
            modifieds
                .iter()
                .any(|m| m.modified_type() == ModifiedType::Dialog),
            "No dialog change after revealing the first tile"
        );
        assert_eq!(harness.gs().get_dialog(), Dialog::None);

        // Only the first tile closes the dialog
        harness.gs().set_dialog(Dialog::InviteLink);

        let (_, modifieds) =
            harness.collect_response(b"\x82\x09\x03\x01\x1e\x00\x0c\x00B\x00\x00");

        assert!(!modifieds
            .iter()
            .any(|m| m.modified_type() == ModifiedType::Dialog));
        assert_eq!(harness.gs().get_dialog(), Dialog::InviteLink);
    }
}
