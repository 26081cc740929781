//! The room: a single-task state machine plus the lockstep tick engine.
//!
//! One dedicated task owns all non-atomic room state and multiplexes five
//! event sources with `select!`: client registration, retirement, decoded
//! session messages, control commands (game-world requests, join queries,
//! destruction), and — only while in game — the tick timer. Everything that
//! mutates the client table or the stage happens here; the only
//! cross-task mutable state are the atomic counters on [`ClientRecord`] and
//! [`RoomShared`].
//!
//! Outbound traffic never blocks the loop: each payload is serialised once
//! and every session write runs in its own fire-and-forget task. A slow or
//! dead client costs nothing but a logged error; the redundancy window
//! re-delivers whatever a datagram loss ate.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Interval;

use shared::{
    ClientInputData, JoinResult, JoinSuccess, RoomInfo, SessionRequest, SessionResponse, Stage,
};

use crate::client::ClientRecord;
use crate::config::LockstepSection;
use crate::error::ServerError;
use crate::frame_store::FrameStore;
use crate::id_alloc::{round_up_to_64, IdAllocator};
use crate::token::TokenService;
use crate::world::{GameWorld, RoomContext, WorldFactory, WorldOptions};

/// How long a disconnected client's uid and record stay reserved so a
/// token-bearing reconnect can reclaim them.
pub const RECONNECT_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// Room state readable from outside the loop task: identification, the
/// stage and frame counters, activity tracking, and the membership mirror
/// the admission path and game worlds query.
pub struct RoomShared {
    pub id: u32,
    pub name: String,
    key: String,
    pub max_clients: u32,
    pub tokens: TokenService,
    stage: AtomicU32,
    next_frame: AtomicU32,
    last_active_ms: AtomicU64,
    players: RwLock<Vec<u32>>,
    destroyed: AtomicBool,
}

impl RoomShared {
    fn new(id: u32, name: String, key: String, max_clients: u32) -> RoomShared {
        RoomShared {
            id,
            name,
            key,
            max_clients,
            tokens: TokenService::new(),
            stage: AtomicU32::new(Stage::InLobby.as_u32()),
            next_frame: AtomicU32::new(1),
            last_active_ms: AtomicU64::new(now_ms()),
            players: RwLock::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn stage(&self) -> Stage {
        Stage::from_u32(self.stage.load(Ordering::Acquire)).unwrap_or(Stage::Closed)
    }

    fn set_stage(&self, stage: Stage) {
        self.stage.store(stage.as_u32(), Ordering::Release);
    }

    /// The frame the tick engine will produce next.
    pub fn current_frame(&self) -> u32 {
        self.next_frame.load(Ordering::Acquire)
    }

    fn advance_frame(&self) {
        self.next_frame.fetch_add(1, Ordering::AcqRel);
    }

    fn reset_frames(&self) {
        self.next_frame.store(1, Ordering::Release);
    }

    pub fn touch(&self) {
        self.last_active_ms.store(now_ms(), Ordering::Release);
    }

    /// Time since the room last saw any activity.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_active_ms.load(Ordering::Acquire);
        Duration::from_millis(now_ms().saturating_sub(last))
    }

    pub fn player_ids(&self) -> Vec<u32> {
        self.players.read().unwrap().clone()
    }

    pub fn player_count(&self) -> u32 {
        self.players.read().unwrap().len() as u32
    }

    pub fn has_key(&self) -> bool {
        !self.key.is_empty()
    }

    /// Length-independent-time key comparison.
    pub fn check_key(&self, key: &str) -> bool {
        let (a, b) = (self.key.as_bytes(), key.as_bytes());
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

/// A decoded client message on its way to the room loop.
pub struct ClientMessage {
    pub record: Arc<ClientRecord>,
    pub request: SessionRequest,
}

/// Control-plane commands for a room loop: game-world requests, admission
/// queries, uid bookkeeping and destruction.
pub enum RoomCommand {
    Broadcast(Vec<u8>),
    SendTo(u32, Vec<u8>),
    SendToMultiple(Vec<u32>, Vec<u8>),
    Kick { uid: u32, reason: String },
    Destroy,
    /// Admission asks: may this join proceed, and under which uid?
    JoinQuery {
        reconnect_uid: Option<u32>,
        reply: oneshot::Sender<Result<u32, ServerError>>,
    },
    /// Return a uid whose admission fell through after allocation.
    ReleaseUser(u32),
    /// Grace period over: drop the record if it is still disconnected.
    Reap(u32),
}

/// The handle the registry and the admission path hold on a live room.
pub struct RoomHandle {
    pub shared: Arc<RoomShared>,
    register_tx: mpsc::Sender<Arc<ClientRecord>>,
    unregister_tx: mpsc::Sender<Arc<ClientRecord>>,
    incoming_tx: mpsc::Sender<ClientMessage>,
    control_tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    /// Hands a freshly admitted client to the room loop. Returns false when
    /// the register queue is full or the room is gone; the caller must then
    /// close the session and release the uid.
    pub fn register(&self, record: Arc<ClientRecord>) -> bool {
        match self.register_tx.try_send(record) {
            Ok(()) => true,
            Err(e) => {
                warn!("room {}: failed to register client: {}", self.shared.id, e);
                false
            }
        }
    }

    /// Retires a client whose read loop ended. Dropping the event on a full
    /// queue is a liveness relief valve; the session is force-closed so the
    /// record cannot linger half-alive.
    pub fn unregister(&self, record: Arc<ClientRecord>) {
        if let Err(mpsc::error::TrySendError::Full(record)) = self.unregister_tx.try_send(record) {
            warn!(
                "room {}: unregister queue full, force-closing session of {}",
                self.shared.id,
                record.uid()
            );
            let session = record.session().clone();
            tokio::spawn(async move { session.close().await });
        }
    }

    /// Sender the read loops push decoded messages through.
    pub fn incoming(&self) -> mpsc::Sender<ClientMessage> {
        self.incoming_tx.clone()
    }

    /// Runs the admission checks that need loop-owned state (room full,
    /// reconnect conflict, game-world vote) and allocates the uid.
    pub async fn join_query(&self, reconnect_uid: Option<u32>) -> Result<u32, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.control_tx
            .send(RoomCommand::JoinQuery {
                reconnect_uid,
                reply,
            })
            .map_err(|_| ServerError::RoomNotFound(self.shared.id))?;
        rx.await
            .map_err(|_| ServerError::RoomNotFound(self.shared.id))?
    }

    pub fn release_user(&self, uid: u32) {
        let _ = self.control_tx.send(RoomCommand::ReleaseUser(uid));
    }

    /// Requests teardown. Idempotent; the actual work happens at most once
    /// on the loop task.
    pub fn destroy(&self) {
        let _ = self.control_tx.send(RoomCommand::Destroy);
    }
}

/// The loop-owned half of a room.
pub struct Room {
    shared: Arc<RoomShared>,
    cfg: LockstepSection,
    world: Box<dyn GameWorld>,
    clients: HashMap<u32, Arc<ClientRecord>>,
    store: FrameStore,
    alloc: IdAllocator,
    register_rx: mpsc::Receiver<Arc<ClientRecord>>,
    unregister_rx: mpsc::Receiver<Arc<ClientRecord>>,
    incoming_rx: mpsc::Receiver<ClientMessage>,
    control_rx: mpsc::UnboundedReceiver<RoomCommand>,
    control_tx: mpsc::UnboundedSender<RoomCommand>,
    ticker: Option<Interval>,
    stop_tx: mpsc::Sender<u32>,
}

impl Room {
    /// Builds a room, instantiates its game world, starts the loop task and
    /// returns the handle. `stop_tx` is the registry's stop-signal bus; the
    /// room sends its own id there exactly once when it dies.
    pub fn spawn(
        id: u32,
        name: String,
        key: String,
        cfg: &LockstepSection,
        factory: &WorldFactory,
        stop_tx: mpsc::Sender<u32>,
    ) -> Arc<RoomHandle> {
        let client_cap = cfg.max_clients_per_room.max(1) as usize;
        let (register_tx, register_rx) = mpsc::channel(client_cap);
        let (unregister_tx, unregister_rx) = mpsc::channel(client_cap);
        let (incoming_tx, incoming_rx) = mpsc::channel(client_cap * 16);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(RoomShared::new(
            id,
            name,
            key,
            cfg.max_clients_per_room as u32,
        ));
        let ctx = RoomContext::new(Arc::downgrade(&shared), control_tx.clone());
        let world = factory(ctx.clone());

        let room = Room {
            shared: Arc::clone(&shared),
            cfg: cfg.clone(),
            world,
            clients: HashMap::new(),
            store: FrameStore::new(),
            alloc: IdAllocator::new(round_up_to_64(cfg.max_clients_per_room as u32 + 1)),
            register_rx,
            unregister_rx,
            incoming_rx,
            control_rx,
            control_tx,
            ticker: None,
            stop_tx,
        };

        let handle = Arc::new(RoomHandle {
            shared,
            register_tx,
            unregister_tx,
            incoming_tx,
            control_tx: room.control_tx.clone(),
        });

        tokio::spawn(room.run(ctx));
        handle
    }

    async fn run(mut self, ctx: RoomContext) {
        info!("room {} started", self.shared.id);
        contain(self.shared.id, "on_create_room", {
            let world = &mut self.world;
            move || world.on_create_room(ctx)
        });

        loop {
            if self.shared.stage() == Stage::Closed {
                break;
            }
            let in_game = self.shared.stage() == Stage::InGame && self.ticker.is_some();

            tokio::select! {
                record = self.register_rx.recv() => match record {
                    Some(record) => self.handle_register(record),
                    None => break,
                },
                record = self.unregister_rx.recv() => match record {
                    Some(record) => self.handle_unregister(record),
                    None => break,
                },
                msg = self.incoming_rx.recv() => match msg {
                    Some(msg) => self.handle_message(msg),
                    None => break,
                },
                cmd = self.control_rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = tick_ready(&mut self.ticker), if in_game => self.run_game_tick(),
            }
        }

        self.destroy();
    }

    // ---- registration -------------------------------------------------

    fn handle_register(&mut self, record: Arc<ClientRecord>) {
        let uid = record.uid();
        debug!("room {}: registering client {}", self.shared.id, uid);
        self.shared.touch();

        if let Some(old) = self.clients.get(&uid) {
            // Reconnect rebind: the new session takes over the old record's
            // progress; the stale session is closed out of band.
            record.adopt_progress(old);
            let stale = old.session().clone();
            tokio::spawn(async move { stale.close().await });
        }
        self.clients.insert(uid, Arc::clone(&record));
        self.sync_player_list();

        let token = self.shared.tokens.issue(uid, self.shared.id);
        let extra = contain(self.shared.id, "on_player_join", {
            let world = &mut self.world;
            let is_reconnect = record.is_reconnected;
            move || world.on_player_join(uid, is_reconnect)
        })
        .unwrap_or_default();

        let info = self.room_info();
        let welcome = SessionResponse::Join {
            code: 200,
            result: JoinResult::Success(JoinSuccess {
                room_id: self.shared.id,
                user_id: uid,
                reconnect_token: token,
                room_info: info.clone(),
                data: extra,
            }),
        };
        self.unicast(&record, &welcome);

        // Membership update for everyone else; the token is private to the
        // joiner.
        let update = SessionResponse::Join {
            code: 200,
            result: JoinResult::Success(JoinSuccess {
                room_id: self.shared.id,
                user_id: uid,
                reconnect_token: String::new(),
                room_info: info,
                data: Vec::new(),
            }),
        };
        self.broadcast(&update, &[uid]);

        info!(
            "room {}: client {} registered ({} in room)",
            self.shared.id,
            uid,
            self.clients.len()
        );
    }

    fn handle_unregister(&mut self, record: Arc<ClientRecord>) {
        let uid = record.uid();
        match self.clients.get(&uid) {
            Some(current) if Arc::ptr_eq(current, &record) => {
                debug!("room {}: client {} disconnected", self.shared.id, uid);
                let session = record.session().clone();
                tokio::spawn(async move { session.close().await });

                contain(self.shared.id, "on_player_leave", {
                    let world = &mut self.world;
                    move || world.on_player_leave(uid)
                });

                // The record and its uid stay reserved for the grace
                // period so a reconnect token can reclaim them.
                let control = self.control_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(RECONNECT_GRACE_PERIOD).await;
                    let _ = control.send(RoomCommand::Reap(uid));
                });
            }
            // The record was already replaced by a reconnect or removed;
            // the late unregister from the dead read loop is a no-op.
            _ => {}
        }
    }

    fn reap(&mut self, uid: u32) {
        if let Some(record) = self.clients.get(&uid) {
            if !record.session().is_connected() {
                debug!(
                    "room {}: grace period over, releasing uid {}",
                    self.shared.id, uid
                );
                self.clients.remove(&uid);
                self.alloc.free(uid);
                self.sync_player_list();
            }
        }
    }

    // ---- messages -----------------------------------------------------

    fn handle_message(&mut self, msg: ClientMessage) {
        self.shared.touch();
        let room_id = self.shared.id;
        contain(room_id, "message handler", || self.dispatch(msg));
    }

    fn dispatch(&mut self, msg: ClientMessage) {
        let uid = msg.record.uid();
        let stage = self.shared.stage();

        match msg.request {
            SessionRequest::InLobby { data } => {
                self.world.on_handle_in_lobby(uid, &data);
            }

            SessionRequest::ToPreparing { data } => {
                if stage != Stage::InLobby {
                    debug!("room {}: ToPreparing ignored in {:?}", self.shared.id, stage);
                    return;
                }
                if self.world.on_handle_to_preparing_stage(uid, &data) {
                    self.change_stage(stage.forward(), data);
                }
            }

            SessionRequest::Ready { is_ready, data } => {
                if stage != Stage::Preparing {
                    debug!("room {}: Ready ignored in {:?}", self.shared.id, stage);
                    return;
                }
                msg.record.set_ready(is_ready);
                self.world.on_handle_ready(uid, is_ready, &data);

                let ready_ids = self.ready_ids();
                self.broadcast(
                    &SessionResponse::ReadyCountUpdate {
                        ready_ids,
                        total: self.clients.len() as u32,
                    },
                    &[],
                );

                if self.all_ready() {
                    self.change_stage(stage.forward(), Vec::new());
                }
            }

            SessionRequest::ToInLobby { data } => {
                if stage != Stage::Preparing && stage != Stage::PostGame {
                    debug!("room {}: ToInLobby ignored in {:?}", self.shared.id, stage);
                    return;
                }
                if self.world.on_handle_to_lobby_stage(uid, &data) {
                    self.reset_to_lobby();
                    self.broadcast(
                        &SessionResponse::StageChange {
                            new_stage: Stage::InLobby,
                            data,
                        },
                        &[],
                    );
                }
            }

            SessionRequest::Loaded { data: _ } => {
                if stage != Stage::Loading {
                    debug!("room {}: Loaded ignored in {:?}", self.shared.id, stage);
                    return;
                }
                msg.record.set_loaded(true);
                self.world.on_handle_loaded(uid);

                let loaded_ids = self.loaded_ids();
                self.broadcast(
                    &SessionResponse::LoadedCountUpdate {
                        loaded_ids,
                        total: self.clients.len() as u32,
                    },
                    &[],
                );

                if self.all_loaded() {
                    self.ticker = Some(tokio::time::interval(self.cfg.frame_interval()));
                    self.change_stage(stage.forward(), Vec::new());
                }
            }

            SessionRequest::InGameFrames {
                frame_id,
                ack_frame_id,
                data,
            } => {
                if stage != Stage::InGame {
                    return;
                }
                // The read loop already folded the report into the record's
                // atomics; loopback callers without a read loop go through
                // here.
                msg.record.update_frames(frame_id, ack_frame_id);
                self.world.on_receive_client_input(
                    uid,
                    ClientInputData {
                        uid,
                        frame_id,
                        data,
                    },
                );
            }

            SessionRequest::Other { data } => {
                self.world.on_receive_other_data(uid, &data);
            }

            SessionRequest::EndGame { status_code, data } => {
                if stage != Stage::InGame {
                    debug!("room {}: EndGame ignored in {:?}", self.shared.id, stage);
                    return;
                }
                if self.world.on_handle_end_game(uid, status_code, &data) {
                    self.ticker = None;
                    self.change_stage(stage.forward(), data);
                }
            }

            SessionRequest::PostGameData { data } => {
                if stage != Stage::PostGame {
                    debug!(
                        "room {}: PostGameData ignored in {:?}",
                        self.shared.id, stage
                    );
                    return;
                }
                if self.world.on_handle_post_game_data(uid, &data) {
                    self.reset_to_lobby();
                    self.broadcast(
                        &SessionResponse::StageChange {
                            new_stage: Stage::InLobby,
                            data,
                        },
                        &[],
                    );
                }
            }
        }
    }

    fn change_stage(&mut self, new_stage: Stage, data: Vec<u8>) {
        let old = self.shared.stage();
        self.shared.set_stage(new_stage);
        info!(
            "room {}: stage {:?} -> {:?}",
            self.shared.id, old, new_stage
        );
        self.broadcast(&SessionResponse::StageChange { new_stage, data }, &[]);
    }

    /// Back to the lobby: frame history dropped, frame counter rewound,
    /// ticker stopped, per-client progress cleared. Disconnected records
    /// lose their grace reservation at this boundary.
    fn reset_to_lobby(&mut self) {
        self.shared.set_stage(Stage::InLobby);
        self.shared.reset_frames();
        self.store.reset();
        self.ticker = None;

        let stale: Vec<u32> = self
            .clients
            .iter()
            .filter(|(_, r)| !r.session().is_connected())
            .map(|(uid, _)| *uid)
            .collect();
        for uid in stale {
            self.clients.remove(&uid);
            self.alloc.free(uid);
        }
        for record in self.clients.values() {
            record.reset_progress();
        }
        self.sync_player_list();
    }

    // ---- lockstep tick ------------------------------------------------

    fn run_game_tick(&mut self) {
        // Nobody home: no state advance, no activity update.
        if self.clients.is_empty() {
            debug!("room {}: no clients online, skipping tick", self.shared.id);
            return;
        }

        let frame_id = self.shared.current_frame();

        // Pessimistic mode stalls the clock while anyone lags too far.
        if let Some(max_delay) = self.cfg.effective_max_delay() {
            let min_frame = frame_id.saturating_sub(max_delay);
            if self
                .clients
                .values()
                .any(|r| r.latest_next_frame() < min_frame)
            {
                return;
            }
        }

        self.shared.touch();

        let room_id = self.shared.id;
        contain(room_id, "world tick", {
            let world = &mut self.world;
            move || world.tick()
        });
        let frame = contain(room_id, "get_frame_data", {
            let world = &mut self.world;
            move || world.get_frame_data(frame_id, WorldOptions { chunk_id: 0 })
        });
        // A panicking world produced nothing; the tick is unsuccessful and
        // the frame counter must not move.
        let Some(frame) = frame else { return };

        self.store.insert(frame_id, frame);
        if let Some(snapshot) = contain(room_id, "get_snapshot", {
            let world = &mut self.world;
            move || world.get_snapshot(frame_id, WorldOptions { chunk_id: 0 })
        })
        .flatten()
        {
            self.store.insert_snapshot(frame_id, snapshot.data);
        }

        // Advance before dispatch so a slow fan-out never stalls the clock.
        self.shared.advance_frame();

        // Size the shared window by the most-behind client.
        let mut oldest_ack = u32::MAX;
        for record in self.clients.values() {
            let ack = record.latest_ack_next_frame();
            if ack < frame_id {
                oldest_ack = oldest_ack.min(ack);
            }
        }

        if oldest_ack == u32::MAX {
            // Everyone is caught up: empty packet as a keep-alive.
            self.broadcast(&SessionResponse::InGameFrames { frames: Vec::new() }, &[]);
            return;
        }

        let window = self.store.window(oldest_ack, frame_id);
        for record in self.clients.values() {
            let ack = record.latest_ack_next_frame();
            if ack >= frame_id {
                continue;
            }
            let frames = window[(ack - oldest_ack) as usize..].to_vec();
            let session = record.session().clone();
            let uid = record.uid();
            tokio::spawn(async move {
                let resp = SessionResponse::InGameFrames { frames };
                match shared::encode_response(&resp) {
                    Ok(bytes) => {
                        if let Err(e) = session.send_datagram(bytes).await {
                            debug!("frame packet for client {} lost: {}", uid, e);
                        }
                    }
                    Err(e) => error!("failed to encode frame packet for {}: {}", uid, e),
                }
            });
        }
    }

    // ---- control commands ---------------------------------------------

    /// Returns true when the loop must exit.
    fn handle_command(&mut self, cmd: RoomCommand) -> bool {
        match cmd {
            RoomCommand::Broadcast(data) => self.broadcast_raw(data, &[]),
            RoomCommand::SendTo(uid, data) => {
                if let Some(record) = self.clients.get(&uid) {
                    self.send_raw(record, data);
                }
            }
            RoomCommand::SendToMultiple(uids, data) => {
                for uid in uids {
                    if let Some(record) = self.clients.get(&uid) {
                        self.send_raw(record, data.clone());
                    }
                }
            }
            RoomCommand::Kick { uid, reason } => {
                if let Some(record) = self.clients.remove(&uid) {
                    info!("room {}: kicking client {}: {}", self.shared.id, uid, reason);
                    self.alloc.free(uid);
                    self.sync_player_list();
                    let session = record.session().clone();
                    tokio::spawn(async move {
                        session
                            .close_with_error(1000, &format!("kicked: {}", reason))
                            .await;
                    });
                }
            }
            RoomCommand::Destroy => return true,
            RoomCommand::JoinQuery {
                reconnect_uid,
                reply,
            } => {
                let _ = reply.send(self.answer_join_query(reconnect_uid));
            }
            RoomCommand::ReleaseUser(uid) => {
                // Only safe while no record holds the uid (admission fell
                // through between allocation and registration).
                if !self.clients.contains_key(&uid) {
                    self.alloc.free(uid);
                }
            }
            RoomCommand::Reap(uid) => self.reap(uid),
        }
        false
    }

    fn answer_join_query(&mut self, reconnect_uid: Option<u32>) -> Result<u32, ServerError> {
        if self.shared.stage() == Stage::Closed || self.shared.is_destroyed() {
            return Err(ServerError::RoomNotFound(self.shared.id));
        }
        let is_reconnect = reconnect_uid.is_some();

        if let Some(uid) = reconnect_uid {
            if let Some(existing) = self.clients.get(&uid) {
                if existing.session().is_connected() {
                    return Err(ServerError::Conflict(format!(
                        "user {} is still connected",
                        uid
                    )));
                }
                if !self.world_vote_join(is_reconnect) {
                    return Err(ServerError::Forbidden("game world refused the join".into()));
                }
                // Their slot is still reserved; hand the uid back.
                return Ok(uid);
            }
            // The reservation was already reaped: fall through to a fresh
            // slot, keeping the reconnect flag for the world.
        }

        if self.clients.len() >= self.shared.max_clients as usize {
            return Err(ServerError::Conflict(format!(
                "room {} is full",
                self.shared.id
            )));
        }
        if !self.world_vote_join(is_reconnect) {
            return Err(ServerError::Forbidden("game world refused the join".into()));
        }
        self.alloc.allocate()
    }

    fn world_vote_join(&mut self, is_reconnect: bool) -> bool {
        contain(self.shared.id, "could_join_room", {
            let world = &mut self.world;
            move || world.could_join_room(is_reconnect)
        })
        .unwrap_or(false)
    }

    // ---- teardown -----------------------------------------------------

    fn destroy(&mut self) {
        if self.shared.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            "room {} destroying (stage {:?}, {} clients, idle {:?})",
            self.shared.id,
            self.shared.stage(),
            self.clients.len(),
            self.shared.idle_for(),
        );

        self.shared.set_stage(Stage::Closed);
        self.ticker = None;

        for record in self.clients.values() {
            let session = record.session().clone();
            tokio::spawn(async move { session.close().await });
        }
        self.clients.clear();
        self.sync_player_list();

        contain(self.shared.id, "on_destroy", {
            let world = &mut self.world;
            move || world.on_destroy()
        });

        if let Err(e) = self.stop_tx.try_send(self.shared.id) {
            warn!(
                "room {}: failed to notify registry of shutdown: {}",
                self.shared.id, e
            );
        }
    }

    // ---- helpers ------------------------------------------------------

    fn sync_player_list(&self) {
        let mut ids: Vec<u32> = self.clients.keys().copied().collect();
        ids.sort_unstable();
        *self.shared.players.write().unwrap() = ids;
    }

    fn room_info(&self) -> RoomInfo {
        RoomInfo {
            name: self.shared.name.clone(),
            max_clients: self.shared.max_clients,
            current_clients: self.clients.len() as u32,
            user_ids: self.shared.player_ids(),
        }
    }

    fn ready_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .clients
            .values()
            .filter(|r| r.is_ready())
            .map(|r| r.uid())
            .collect();
        ids.sort_unstable();
        ids
    }

    fn loaded_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .clients
            .values()
            .filter(|r| r.is_loaded())
            .map(|r| r.uid())
            .collect();
        ids.sort_unstable();
        ids
    }

    fn all_ready(&self) -> bool {
        !self.clients.is_empty() && self.clients.values().all(|r| r.is_ready())
    }

    fn all_loaded(&self) -> bool {
        !self.clients.is_empty() && self.clients.values().all(|r| r.is_loaded())
    }

    /// Serialises once, then fans out one send task per connected client.
    fn broadcast(&self, resp: &SessionResponse, exclude: &[u32]) {
        match shared::encode_response(resp) {
            Ok(bytes) => self.broadcast_raw(bytes, exclude),
            Err(e) => error!("room {}: broadcast encode failed: {}", self.shared.id, e),
        }
    }

    fn broadcast_raw(&self, bytes: Vec<u8>, exclude: &[u32]) {
        for (uid, record) in &self.clients {
            if exclude.contains(uid) || !record.session().is_connected() {
                continue;
            }
            self.send_raw(record, bytes.clone());
        }
    }

    fn unicast(&self, record: &Arc<ClientRecord>, resp: &SessionResponse) {
        match shared::encode_response(resp) {
            Ok(bytes) => self.send_raw(record, bytes),
            Err(e) => error!("room {}: unicast encode failed: {}", self.shared.id, e),
        }
    }

    fn send_raw(&self, record: &Arc<ClientRecord>, bytes: Vec<u8>) {
        let session = record.session().clone();
        let uid = record.uid();
        tokio::spawn(async move {
            if let Err(e) = session.send_datagram(bytes).await {
                debug!("send to client {} failed: {}", uid, e);
            }
        });
    }
}

async fn tick_ready(ticker: &mut Option<Interval>) {
    match ticker.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Recovery barrier around handler and world-hook invocations: a panic is
/// logged and the loop keeps running.
fn contain<R>(room_id: u32, what: &str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!("room {}: recovered from panic in {}: {}", room_id, what, msg);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use crate::world::DefaultWorld;
    use shared::decode_response;
    use std::time::Duration;

    fn lockstep_cfg(frame_interval_ms: u32) -> LockstepSection {
        LockstepSection {
            frame_interval: frame_interval_ms,
            ..LockstepSection::default()
        }
    }

    fn spawn_room(cfg: &LockstepSection) -> (Arc<RoomHandle>, mpsc::Receiver<u32>) {
        let (stop_tx, stop_rx) = mpsc::channel(8);
        // Mirror production: the registry keeps its own clone of `stop_tx`
        // alongside each room's, so the bus outlives any single room. Leak
        // a clone here so the test's `stop_rx` doesn't see the channel
        // close when the spawned room's copy is dropped.
        std::mem::forget(stop_tx.clone());
        let handle = Room::spawn(
            1,
            "test-room".to_string(),
            String::new(),
            cfg,
            &DefaultWorld::factory(),
            stop_tx,
        );
        (handle, stop_rx)
    }

    /// Admits a loopback client the way the admission path would and
    /// returns the record plus the peer end of the session.
    async fn admit(handle: &RoomHandle) -> (Arc<ClientRecord>, Session) {
        let uid = handle.join_query(None).await.expect("join refused");
        let (session, peer) = Session::local_pair();
        let record = Arc::new(ClientRecord::new(uid, session, false));
        assert!(handle.register(Arc::clone(&record)));
        (record, peer)
    }

    async fn recv_response(peer: &Session) -> SessionResponse {
        let bytes = tokio::time::timeout(Duration::from_secs(1), peer.recv_datagram())
            .await
            .expect("timed out waiting for datagram")
            .expect("session closed");
        decode_response(&bytes).expect("undecodable response")
    }

    #[tokio::test]
    async fn join_query_allocates_distinct_uids() {
        let (handle, _stop) = spawn_room(&lockstep_cfg(66));
        let a = handle.join_query(None).await.unwrap();
        let b = handle.join_query(None).await.unwrap();
        assert_ne!(a, b);
        assert_ne!(a, 0);
    }

    #[tokio::test]
    async fn join_query_enforces_room_cap() {
        let cfg = LockstepSection {
            max_clients_per_room: 1,
            ..lockstep_cfg(66)
        };
        let (handle, _stop) = spawn_room(&cfg);
        let (_rec, _peer) = admit(&handle).await;
        // Give the loop a beat to process the registration.
        tokio::time::sleep(Duration::from_millis(20)).await;

        match handle.join_query(None).await {
            Err(ServerError::Conflict(_)) => {}
            other => panic!("expected room-full conflict, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn register_unicasts_token_and_broadcasts_membership() {
        let (handle, _stop) = spawn_room(&lockstep_cfg(66));

        let (rec_a, peer_a) = admit(&handle).await;
        match recv_response(&peer_a).await {
            SessionResponse::Join { code, result } => {
                assert_eq!(code, 200);
                match result {
                    JoinResult::Success(s) => {
                        assert_eq!(s.user_id, rec_a.uid());
                        assert!(!s.reconnect_token.is_empty());
                        let claim = handle
                            .shared
                            .tokens
                            .verify(&s.reconnect_token)
                            .expect("token must verify against the room secret");
                        assert_eq!(claim.user_id, rec_a.uid());
                        assert_eq!(claim.room_id, 1);
                    }
                    JoinResult::Fail(f) => panic!("join failed: {}", f.message),
                }
            }
            other => panic!("expected Join, got {:?}", other),
        }

        let (rec_b, peer_b) = admit(&handle).await;
        // B's own welcome.
        match recv_response(&peer_b).await {
            SessionResponse::Join { .. } => {}
            other => panic!("expected Join, got {:?}", other),
        }
        // A sees the membership update with the token blanked.
        match recv_response(&peer_a).await {
            SessionResponse::Join { result, .. } => match result {
                JoinResult::Success(s) => {
                    assert_eq!(s.user_id, rec_b.uid());
                    assert!(s.reconnect_token.is_empty());
                    assert_eq!(s.room_info.current_clients, 2);
                }
                JoinResult::Fail(f) => panic!("unexpected failure: {}", f.message),
            },
            other => panic!("expected membership Join, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn ready_flow_advances_to_loading() {
        let (handle, _stop) = spawn_room(&lockstep_cfg(66));
        let incoming = handle.incoming();

        let (rec_a, peer_a) = admit(&handle).await;
        let (rec_b, _peer_b) = admit(&handle).await;
        recv_response(&peer_a).await; // welcome
        recv_response(&peer_a).await; // membership

        incoming
            .send(ClientMessage {
                record: Arc::clone(&rec_a),
                request: SessionRequest::ToPreparing { data: vec![] },
            })
            .await
            .unwrap();
        match recv_response(&peer_a).await {
            SessionResponse::StageChange { new_stage, .. } => {
                assert_eq!(new_stage, Stage::Preparing)
            }
            other => panic!("expected StageChange, got {:?}", other),
        }

        incoming
            .send(ClientMessage {
                record: Arc::clone(&rec_a),
                request: SessionRequest::Ready {
                    is_ready: true,
                    data: vec![],
                },
            })
            .await
            .unwrap();
        match recv_response(&peer_a).await {
            SessionResponse::ReadyCountUpdate { ready_ids, total } => {
                assert_eq!(ready_ids, vec![rec_a.uid()]);
                assert_eq!(total, 2);
            }
            other => panic!("expected ReadyCountUpdate, got {:?}", other),
        }

        incoming
            .send(ClientMessage {
                record: Arc::clone(&rec_b),
                request: SessionRequest::Ready {
                    is_ready: true,
                    data: vec![],
                },
            })
            .await
            .unwrap();
        // The count update and the stage change fan out as independent
        // send tasks, so their arrival order is unspecified.
        loop {
            match recv_response(&peer_a).await {
                SessionResponse::ReadyCountUpdate { ready_ids, .. } => {
                    assert_eq!(ready_ids.len(), 2);
                }
                SessionResponse::StageChange { new_stage, .. } => {
                    assert_eq!(new_stage, Stage::Loading);
                    break;
                }
                other => panic!("unexpected response: {:?}", other),
            }
        }
        assert_eq!(handle.shared.stage(), Stage::Loading);
    }

    #[tokio::test]
    async fn stage_gating_ignores_out_of_stage_messages() {
        let (handle, _stop) = spawn_room(&lockstep_cfg(66));
        let incoming = handle.incoming();
        let (rec, peer) = admit(&handle).await;
        recv_response(&peer).await; // welcome

        // Ready in the lobby must not do anything.
        incoming
            .send(ClientMessage {
                record: Arc::clone(&rec),
                request: SessionRequest::Ready {
                    is_ready: true,
                    data: vec![],
                },
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(handle.shared.stage(), Stage::InLobby);
    }

    #[tokio::test]
    async fn destroy_emits_exactly_one_stop_signal() {
        let (handle, mut stop_rx) = spawn_room(&lockstep_cfg(66));
        handle.destroy();
        handle.destroy();
        handle.destroy();

        let id = tokio::time::timeout(Duration::from_secs(1), stop_rx.recv())
            .await
            .expect("stop signal expected")
            .expect("bus closed");
        assert_eq!(id, 1);

        // No second signal may arrive.
        let second = tokio::time::timeout(Duration::from_millis(100), stop_rx.recv()).await;
        assert!(second.is_err(), "destroy must fire at most once");
        assert_eq!(handle.shared.stage(), Stage::Closed);
    }

    #[tokio::test]
    async fn panicking_world_does_not_kill_the_room() {
        struct PanickyWorld(DefaultWorld);
        impl GameWorld for PanickyWorld {
            fn on_create_room(&mut self, ctx: RoomContext) {
                self.0.on_create_room(ctx)
            }
            fn could_join_room(&mut self, r: bool) -> bool {
                self.0.could_join_room(r)
            }
            fn on_player_join(&mut self, uid: u32, r: bool) -> Vec<u8> {
                self.0.on_player_join(uid, r)
            }
            fn on_player_leave(&mut self, uid: u32) {
                self.0.on_player_leave(uid)
            }
            fn on_handle_in_lobby(&mut self, _uid: u32, _data: &[u8]) {
                panic!("lobby handler exploded");
            }
            fn on_handle_to_preparing_stage(&mut self, uid: u32, d: &[u8]) -> bool {
                self.0.on_handle_to_preparing_stage(uid, d)
            }
            fn on_handle_ready(&mut self, uid: u32, r: bool, d: &[u8]) {
                self.0.on_handle_ready(uid, r, d)
            }
            fn on_handle_to_lobby_stage(&mut self, uid: u32, d: &[u8]) -> bool {
                self.0.on_handle_to_lobby_stage(uid, d)
            }
            fn on_handle_loaded(&mut self, uid: u32) {
                self.0.on_handle_loaded(uid)
            }
            fn on_receive_client_input(&mut self, uid: u32, i: ClientInputData) {
                self.0.on_receive_client_input(uid, i)
            }
            fn on_receive_other_data(&mut self, uid: u32, d: &[u8]) {
                self.0.on_receive_other_data(uid, d)
            }
            fn on_handle_end_game(&mut self, uid: u32, c: u32, d: &[u8]) -> bool {
                self.0.on_handle_end_game(uid, c, d)
            }
            fn on_handle_post_game_data(&mut self, uid: u32, d: &[u8]) -> bool {
                self.0.on_handle_post_game_data(uid, d)
            }
            fn tick(&mut self) {
                self.0.tick()
            }
            fn get_frame_data(&mut self, f: u32, o: WorldOptions) -> shared::FrameData {
                self.0.get_frame_data(f, o)
            }
            fn get_snapshot(&mut self, f: u32, o: WorldOptions) -> Option<crate::world::Snapshot> {
                self.0.get_snapshot(f, o)
            }
            fn on_destroy(&mut self) {
                self.0.on_destroy()
            }
        }

        let (stop_tx, _stop_rx) = mpsc::channel(8);
        let factory: WorldFactory =
            Arc::new(|_ctx| Box::new(PanickyWorld(DefaultWorld::new())) as Box<dyn GameWorld>);
        let handle = Room::spawn(
            2,
            "panicky".to_string(),
            String::new(),
            &lockstep_cfg(66),
            &factory,
            stop_tx,
        );

        let (rec, peer) = admit(&handle).await;
        recv_response(&peer).await; // welcome

        handle
            .incoming()
            .send(ClientMessage {
                record: Arc::clone(&rec),
                request: SessionRequest::InLobby { data: vec![1] },
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The loop survived the panic and still answers queries.
        assert!(handle.join_query(None).await.is_ok());
        assert_ne!(handle.shared.stage(), Stage::Closed);
    }

    #[tokio::test]
    async fn room_context_commands_flow_through_the_loop() {
        struct CommandingWorld {
            inner: DefaultWorld,
            ctx: Option<RoomContext>,
        }
        impl GameWorld for CommandingWorld {
            fn on_create_room(&mut self, ctx: RoomContext) {
                self.ctx = Some(ctx.clone());
                self.inner.on_create_room(ctx);
            }
            fn could_join_room(&mut self, r: bool) -> bool {
                self.inner.could_join_room(r)
            }
            fn on_player_join(&mut self, uid: u32, r: bool) -> Vec<u8> {
                self.inner.on_player_join(uid, r)
            }
            fn on_player_leave(&mut self, uid: u32) {
                self.inner.on_player_leave(uid)
            }
            fn on_handle_in_lobby(&mut self, _uid: u32, data: &[u8]) {
                if let Some(ctx) = &self.ctx {
                    ctx.broadcast(data.to_vec());
                }
            }
            fn on_handle_to_preparing_stage(&mut self, uid: u32, d: &[u8]) -> bool {
                self.inner.on_handle_to_preparing_stage(uid, d)
            }
            fn on_handle_ready(&mut self, uid: u32, r: bool, d: &[u8]) {
                self.inner.on_handle_ready(uid, r, d)
            }
            fn on_handle_to_lobby_stage(&mut self, uid: u32, d: &[u8]) -> bool {
                self.inner.on_handle_to_lobby_stage(uid, d)
            }
            fn on_handle_loaded(&mut self, uid: u32) {
                self.inner.on_handle_loaded(uid)
            }
            fn on_receive_client_input(&mut self, uid: u32, i: ClientInputData) {
                self.inner.on_receive_client_input(uid, i)
            }
            fn on_receive_other_data(&mut self, uid: u32, _data: &[u8]) {
                if let Some(ctx) = &self.ctx {
                    ctx.kick_player(uid, "requested");
                }
            }
            fn on_handle_end_game(&mut self, uid: u32, c: u32, d: &[u8]) -> bool {
                self.inner.on_handle_end_game(uid, c, d)
            }
            fn on_handle_post_game_data(&mut self, uid: u32, d: &[u8]) -> bool {
                self.inner.on_handle_post_game_data(uid, d)
            }
            fn tick(&mut self) {
                self.inner.tick()
            }
            fn get_frame_data(&mut self, f: u32, o: WorldOptions) -> shared::FrameData {
                self.inner.get_frame_data(f, o)
            }
            fn get_snapshot(&mut self, f: u32, o: WorldOptions) -> Option<crate::world::Snapshot> {
                self.inner.get_snapshot(f, o)
            }
            fn on_destroy(&mut self) {
                self.inner.on_destroy()
            }
        }

        let (stop_tx, _stop_rx) = mpsc::channel(8);
        let factory: WorldFactory = Arc::new(|_ctx| {
            Box::new(CommandingWorld {
                inner: DefaultWorld::new(),
                ctx: None,
            }) as Box<dyn GameWorld>
        });
        let handle = Room::spawn(
            3,
            "commanding".to_string(),
            String::new(),
            &lockstep_cfg(66),
            &factory,
            stop_tx,
        );
        let incoming = handle.incoming();
        let (rec, peer) = admit(&handle).await;
        recv_response(&peer).await; // welcome

        // The world broadcasts the lobby payload verbatim.
        incoming
            .send(ClientMessage {
                record: Arc::clone(&rec),
                request: SessionRequest::InLobby { data: vec![7, 8] },
            })
            .await
            .unwrap();
        let raw = tokio::time::timeout(Duration::from_secs(1), peer.recv_datagram())
            .await
            .expect("broadcast expected")
            .unwrap();
        assert_eq!(raw, vec![7, 8]);

        // The world kicks on Other: the session closes and the record is
        // retired.
        incoming
            .send(ClientMessage {
                record: Arc::clone(&rec),
                request: SessionRequest::Other { data: vec![] },
            })
            .await
            .unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if peer.recv_datagram().await.is_err() {
                    break;
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "kicked session should close");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.shared.player_count(), 0);
    }
}
