use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

use islandgold_core::coordinator::{Coordinator, JoinError, Outbound, TickOutcome};
use islandgold_core::match_state::MatchPhase;
use islandgold_core::net::protocol::encode_server_message;
use islandgold_core::player::{ConnectionId, PlayerId, Pose, ScoreEntry};
use islandgold_core::treasure::TreasureId;

/// Per-connection sender for outbound WebSocket binary frames.
/// Bounded so a slow client cannot grow server memory without limit.
/// Uses `Bytes` so one encoded frame is shared by every recipient.
pub type PlayerSender = mpsc::Sender<Bytes>;

/// Commands sent from WebSocket handlers (and the admin API) to a match actor.
#[derive(Debug)]
pub enum MatchCommand {
    Join {
        conn: ConnectionId,
        display_name: String,
        sender: PlayerSender,
        reply: oneshot::Sender<Result<PlayerId, JoinError>>,
    },
    Leave {
        conn: ConnectionId,
    },
    Move {
        conn: ConnectionId,
        pose: Pose,
    },
    Collect {
        conn: ConnectionId,
        treasure_id: TreasureId,
        generation: Option<u64>,
    },
    Ready {
        conn: ConnectionId,
    },
    Reset {
        reply: oneshot::Sender<MatchSummary>,
    },
    Summary {
        reply: oneshot::Sender<MatchSummary>,
    },
    Stop,
}

/// Point-in-time view of a match for the status API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchSummary {
    pub match_id: String,
    pub generation: u64,
    pub phase: MatchPhase,
    pub time_remaining: u32,
    pub players: usize,
    pub treasures_remaining: usize,
    pub leader: Option<PlayerId>,
    pub scores: Vec<ScoreEntry>,
}

impl MatchSummary {
    fn of(match_id: &str, coordinator: &Coordinator) -> Self {
        let state = coordinator.state();
        let (leader, scores) = state.standings();
        Self {
            match_id: match_id.to_string(),
            generation: state.generation,
            phase: state.phase,
            time_remaining: state.time_remaining,
            players: state.players.len(),
            treasures_remaining: state.uncollected_treasures().count(),
            leader,
            scores,
        }
    }
}

/// Cloneable handle to a running match actor.
#[derive(Debug, Clone)]
pub struct MatchHandle {
    match_id: String,
    tx: mpsc::UnboundedSender<MatchCommand>,
}

impl MatchHandle {
    pub fn match_id(&self) -> &str {
        &self.match_id
    }

    /// Queue a command. Returns false if the actor has stopped.
    pub fn send(&self, cmd: MatchCommand) -> bool {
        self.tx.send(cmd).is_ok()
    }

    /// Register `conn`; its frames start flowing into `sender` on success.
    /// `None` if the actor has stopped.
    pub async fn join(
        &self,
        conn: ConnectionId,
        display_name: String,
        sender: PlayerSender,
    ) -> Option<Result<PlayerId, JoinError>> {
        let (reply, rx) = oneshot::channel();
        if !self.send(MatchCommand::Join {
            conn,
            display_name,
            sender,
            reply,
        }) {
            return None;
        }
        rx.await.ok()
    }

    pub async fn summary(&self) -> Option<MatchSummary> {
        let (reply, rx) = oneshot::channel();
        if !self.send(MatchCommand::Summary { reply }) {
            return None;
        }
        rx.await.ok()
    }

    /// Reset the match and return the summary of the new generation.
    pub async fn reset(&self) -> Option<MatchSummary> {
        let (reply, rx) = oneshot::channel();
        if !self.send(MatchCommand::Reset { reply }) {
            return None;
        }
        rx.await.ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the actor that owns `coordinator`. All commands for the match are
/// applied one at a time in arrival order; the clock ticks every `tick`.
pub fn spawn_match(
    match_id: String,
    coordinator: Coordinator,
    tick: Duration,
) -> (MatchHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let span = tracing::info_span!("match", match_id = %match_id);
    let actor = MatchActor {
        match_id: match_id.clone(),
        coordinator,
        senders: BTreeMap::new(),
    };
    let task = tokio::spawn(actor.run(rx, tick).instrument(span));
    (MatchHandle { match_id, tx }, task)
}

struct MatchActor {
    match_id: String,
    coordinator: Coordinator,
    senders: BTreeMap<ConnectionId, PlayerSender>,
}

impl MatchActor {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<MatchCommand>, tick: Duration) {
        let mut interval = tokio::time::interval_at(Instant::now() + tick, tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            generation = self.coordinator.generation(),
            phase = ?self.coordinator.phase(),
            "Match actor started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.coordinator.tick() {
                        TickOutcome::Ended => tracing::info!("Match clock ran out"),
                        TickOutcome::Reset => tracing::info!(
                            generation = self.coordinator.generation(),
                            "Match reset after pause"
                        ),
                        TickOutcome::Counting(_) | TickOutcome::Idle => {},
                    }
                    self.flush();
                }
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        tracing::debug!("All match handles dropped");
                        break;
                    };
                    if !self.handle(cmd) {
                        break;
                    }
                    self.flush();
                }
            }
        }
        tracing::info!("Match actor stopped");
    }

    /// Apply one command. Returns false to stop the actor.
    fn handle(&mut self, cmd: MatchCommand) -> bool {
        match cmd {
            MatchCommand::Join {
                conn,
                display_name,
                sender,
                reply,
            } => {
                // A repeat join must not displace the live sender.
                let fresh = !self.senders.contains_key(&conn);
                if fresh {
                    // Registered before joining so the snapshot reaches it.
                    self.senders.insert(conn, sender);
                }
                let result = self
                    .coordinator
                    .join(conn, &display_name)
                    .map(|player| player.id);
                if fresh && result.is_err() {
                    self.senders.remove(&conn);
                }
                let _ = reply.send(result);
            },
            MatchCommand::Leave { conn } => {
                self.senders.remove(&conn);
                self.coordinator.leave(conn);
            },
            MatchCommand::Move { conn, pose } => {
                if let Err(reason) = self.coordinator.move_player(conn, pose) {
                    tracing::debug!(conn_id = conn, %reason, "Move rejected");
                }
            },
            MatchCommand::Collect {
                conn,
                treasure_id,
                generation,
            } => {
                // Rejections are logged by the coordinator and never echoed.
                let _ = self
                    .coordinator
                    .collect_treasure(conn, &treasure_id, generation);
            },
            MatchCommand::Ready { conn } => {
                if let Err(reason) = self.coordinator.mark_ready(conn) {
                    tracing::debug!(conn_id = conn, %reason, "Ready rejected");
                }
            },
            MatchCommand::Reset { reply } => {
                self.coordinator.reset();
                let _ = reply.send(MatchSummary::of(&self.match_id, &self.coordinator));
            },
            MatchCommand::Summary { reply } => {
                let _ = reply.send(MatchSummary::of(&self.match_id, &self.coordinator));
            },
            MatchCommand::Stop => return false,
        }
        true
    }

    /// Encode each queued message once and hand it to its recipients.
    ///
    /// A connection whose queue is full has missed a frame its mirror may
    /// depend on, so it is dropped from the match: its sender goes away
    /// (closing the socket) and it leaves the coordinator. A reconnect gets
    /// a fresh snapshot.
    fn flush(&mut self) {
        loop {
            let outbox = self.coordinator.drain_outbox();
            if outbox.is_empty() {
                return;
            }
            let mut lagging: Vec<ConnectionId> = Vec::new();
            for Outbound { to, message } in outbox {
                let data = match encode_server_message(&message) {
                    Ok(data) => Bytes::from(data),
                    Err(e) => {
                        tracing::error!(error = %e, msg_type = ?message.message_type(), "Failed to encode");
                        continue;
                    },
                };
                for (&conn, sender) in &self.senders {
                    if !to.includes(conn) || lagging.contains(&conn) {
                        continue;
                    }
                    match sender.try_send(data.clone()) {
                        Ok(()) => {},
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            tracing::warn!(conn_id = conn, msg_type = ?message.message_type(), "Outbound queue full, disconnecting");
                            lagging.push(conn);
                        },
                        // Writer gone; the read loop will deliver the Leave.
                        Err(mpsc::error::TrySendError::Closed(_)) => {},
                    }
                }
            }
            if lagging.is_empty() {
                return;
            }
            // Departures queue PlayerLeft for the rest, so go round again.
            for conn in lagging {
                self.senders.remove(&conn);
                self.coordinator.leave(conn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use islandgold_core::net::messages::ServerMessage;
    use islandgold_core::net::protocol::decode_server_message;
    use islandgold_core::player::Vec3;
    use islandgold_core::test_helpers::{make_treasure, scripted_coordinator};
    use islandgold_core::treasure::TreasureKind;

    use super::*;

    const FAST: Duration = Duration::from_millis(20);
    const SLOW: Duration = Duration::from_secs(3600);

    async fn next_msg(rx: &mut mpsc::Receiver<Bytes>) -> ServerMessage {
        let data = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed");
        decode_server_message(&data).unwrap()
    }

    async fn join(handle: &MatchHandle, conn: ConnectionId) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(64);
        handle
            .join(conn, format!("P{conn}"), tx)
            .await
            .unwrap()
            .unwrap();
        rx
    }

    #[tokio::test]
    async fn joiner_receives_snapshot_then_start() {
        let coordinator =
            scripted_coordinator(30, vec![make_treasure("t1", TreasureKind::Large)]);
        let (handle, task) = spawn_match("m".to_string(), coordinator, SLOW);
        let mut rx = join(&handle, 1).await;

        match next_msg(&mut rx).await {
            ServerMessage::Snapshot(s) => {
                assert_eq!(s.your_id, 1);
                assert_eq!(s.snapshot.treasures.len(), 1);
            },
            other => panic!("Expected Snapshot, got: {other:?}"),
        }
        assert!(matches!(next_msg(&mut rx).await, ServerMessage::MatchStarted(_)));

        handle.send(MatchCommand::Stop);
        let _ = task.await;
    }

    #[tokio::test]
    async fn collect_is_broadcast_to_all() {
        let coordinator =
            scripted_coordinator(30, vec![make_treasure("t1", TreasureKind::Medium)]);
        let (handle, task) = spawn_match("m".to_string(), coordinator, SLOW);
        let mut rx1 = join(&handle, 1).await;
        let mut rx2 = join(&handle, 2).await;
        // rx1: snapshot, started, joined(2). rx2: snapshot.
        for _ in 0..3 {
            next_msg(&mut rx1).await;
        }
        next_msg(&mut rx2).await;

        for conn in [2, 1] {
            handle.send(MatchCommand::Collect {
                conn,
                treasure_id: "t1".to_string(),
                generation: Some(1),
            });
        }
        for rx in [&mut rx1, &mut rx2] {
            match next_msg(rx).await {
                ServerMessage::TreasureCollected(c) => {
                    assert_eq!(c.collector_id, 2);
                    assert_eq!(c.new_score, 3);
                },
                other => panic!("Expected TreasureCollected, got: {other:?}"),
            }
        }

        let summary = handle.summary().await.unwrap();
        assert_eq!(summary.treasures_remaining, 0);
        assert_eq!(summary.leader, Some(2));
        // The losing claim produced nothing.
        assert!(rx1.try_recv().is_err());

        handle.send(MatchCommand::Stop);
        let _ = task.await;
    }

    #[tokio::test]
    async fn moves_skip_the_mover() {
        let coordinator = scripted_coordinator(30, Vec::new());
        let (handle, task) = spawn_match("m".to_string(), coordinator, SLOW);
        let mut rx1 = join(&handle, 1).await;
        let mut rx2 = join(&handle, 2).await;
        for _ in 0..3 {
            next_msg(&mut rx1).await;
        }
        next_msg(&mut rx2).await;

        handle.send(MatchCommand::Move {
            conn: 2,
            pose: Pose::new(Vec3::new(1.0, 2.0, 3.0), 0.5),
        });
        match next_msg(&mut rx1).await {
            ServerMessage::PlayerMoved(m) => assert_eq!(m.player_id, 2),
            other => panic!("Expected PlayerMoved, got: {other:?}"),
        }
        let _ = handle.summary().await;
        assert!(rx2.try_recv().is_err());

        handle.send(MatchCommand::Stop);
        let _ = task.await;
    }

    #[tokio::test]
    async fn clock_runs_out_and_match_over_is_sent() {
        let coordinator = scripted_coordinator(3, Vec::new());
        let (handle, task) = spawn_match("m".to_string(), coordinator, FAST);
        let mut rx = join(&handle, 1).await;

        let mut clock = Vec::new();
        loop {
            match next_msg(&mut rx).await {
                ServerMessage::TimeUpdate(t) => clock.push(t.time_remaining),
                ServerMessage::MatchOver(o) => {
                    assert_eq!(o.winner_id, Some(1));
                    break;
                },
                _ => {},
            }
        }
        assert_eq!(clock, vec![2, 1, 0]);
        assert_eq!(handle.summary().await.unwrap().phase, MatchPhase::Ended);

        handle.send(MatchCommand::Stop);
        let _ = task.await;
    }

    #[tokio::test]
    async fn duplicate_join_keeps_first_registration() {
        let coordinator = scripted_coordinator(30, Vec::new());
        let (handle, task) = spawn_match("m".to_string(), coordinator, SLOW);
        let mut rx = join(&handle, 1).await;
        next_msg(&mut rx).await;
        next_msg(&mut rx).await;

        let (tx, mut dup_rx) = mpsc::channel(8);
        let result = handle.join(1, "again".to_string(), tx).await.unwrap();
        assert_eq!(result, Err(JoinError::DuplicateConnection(1)));
        assert_eq!(handle.summary().await.unwrap().players, 1);

        // The original connection still hears about later events.
        let _rx2 = join(&handle, 2).await;
        match next_msg(&mut rx).await {
            ServerMessage::PlayerJoined(j) => assert_eq!(j.player.id, 2),
            other => panic!("Expected PlayerJoined, got: {other:?}"),
        }
        assert!(dup_rx.recv().await.is_none());

        handle.send(MatchCommand::Stop);
        let _ = task.await;
    }

    #[tokio::test]
    async fn leave_then_reset_via_handle() {
        let coordinator = scripted_coordinator(30, Vec::new());
        let (handle, task) = spawn_match("m".to_string(), coordinator, SLOW);
        let _rx1 = join(&handle, 1).await;
        let _rx2 = join(&handle, 2).await;
        handle.send(MatchCommand::Leave { conn: 1 });
        let summary = handle.reset().await.unwrap();
        assert_eq!(summary.generation, 2);
        assert_eq!(summary.players, 1);

        handle.send(MatchCommand::Stop);
        let _ = task.await;
        assert!(handle.is_closed());
        assert!(handle.summary().await.is_none());
    }

    #[tokio::test]
    async fn lagging_connection_is_dropped_from_the_match() {
        let coordinator =
            scripted_coordinator(30, vec![make_treasure("t1", TreasureKind::Small)]);
        let (handle, task) = spawn_match("m".to_string(), coordinator, SLOW);
        // Room for snapshot, started and one more frame.
        let (tx, mut slow) = mpsc::channel(3);
        handle.join(1, "slow".to_string(), tx).await.unwrap().unwrap();
        let mut fast = join(&handle, 2).await;
        next_msg(&mut fast).await;

        for i in 0..4 {
            handle.send(MatchCommand::Move {
                conn: 2,
                pose: Pose::new(Vec3::new(i as f32, 0.0, 0.0), 0.0),
            });
        }
        handle.send(MatchCommand::Collect {
            conn: 2,
            treasure_id: "t1".to_string(),
            generation: Some(1),
        });

        let summary = handle.summary().await.unwrap();
        assert_eq!(summary.players, 1);
        assert_eq!(summary.treasures_remaining, 0);

        // The slow queue holds what fit, then closes.
        let mut received = Vec::new();
        while let Some(data) = slow.recv().await {
            received.push(decode_server_message(&data).unwrap());
        }
        assert_eq!(received.len(), 3);
        assert!(matches!(received[0], ServerMessage::Snapshot(_)));

        match next_msg(&mut fast).await {
            ServerMessage::PlayerLeft(l) => assert_eq!(l.player_id, 1),
            other => panic!("Expected PlayerLeft, got: {other:?}"),
        }
        match next_msg(&mut fast).await {
            ServerMessage::TreasureCollected(c) => assert_eq!(c.collector_id, 2),
            other => panic!("Expected TreasureCollected, got: {other:?}"),
        }

        handle.send(MatchCommand::Stop);
        let _ = task.await;
    }
}
