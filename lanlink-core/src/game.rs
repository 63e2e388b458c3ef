//! Tic-tac-toe: per-game state machine, turn dedup and result exchange.

use std::collections::{HashMap, HashSet};

use rand::Rng;

use crate::core::{CoreError, DispatchError, Event, Node, OutboundAction};
use crate::identity::{random_hex_id, PeerId};
use crate::protocol::{GameResult, Message, MessageKind, Symbol};
use crate::reliable::RecentKeys;
use crate::router::Inbound;
use crate::token::{self, Scope};

pub type Board = [Option<Symbol>; 9];

const LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameStatus {
    Waiting,
    InProgress,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameOutcome {
    Win { symbol: Symbol, line: [usize; 3] },
    Draw,
}

/// First uniform line wins; a full board without one is a draw; otherwise `None`.
pub fn check_game_over(board: &Board) -> Option<GameOutcome> {
    for line in LINES {
        if let [Some(a), Some(b), Some(c)] = line.map(|i| board[i]) {
            if a == b && b == c {
                return Some(GameOutcome::Win { symbol: a, line });
            }
        }
    }
    board
        .iter()
        .all(Option::is_some)
        .then_some(GameOutcome::Draw)
}

/// Caller-chosen game id: `g` plus a number in 0..=255.
pub fn new_game_id() -> String {
    format!("g{}", rand::thread_rng().gen_range(0..=255u8))
}

#[derive(Debug, Clone)]
pub struct Game {
    pub id: String,
    pub opponent: PeerId,
    pub my_symbol: Symbol,
    pub board: Board,
    pub turn: u32,
    pub my_turn: bool,
    pub status: GameStatus,
    pub last_activity: f64,
}

impl Game {
    /// Three rows of `X`, `O` or the cell number.
    pub fn render(&self) -> String {
        self.board
            .chunks(3)
            .enumerate()
            .map(|(row, cells)| {
                cells
                    .iter()
                    .enumerate()
                    .map(|(col, c)| match c {
                        Some(s) => s.to_string(),
                        None => (row * 3 + col).to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" | ")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Default)]
pub struct GameState {
    games: HashMap<String, Game>,
    /// `(opponent, game_id, turn)` of every applied remote move.
    seen_moves: HashSet<(PeerId, String, u32)>,
    /// Recently ended ids; late moves for these are ACKed and ignored.
    finished: RecentKeys,
}

impl GameState {
    fn finish(&mut self, game_id: &str) -> Option<Game> {
        self.finished.insert(game_id);
        self.seen_moves.retain(|(_, g, _)| g != game_id);
        self.games.remove(game_id)
    }

    pub(crate) fn drop_idle(&mut self, now: f64, ttl: f64) -> usize {
        let idle: Vec<String> = self
            .games
            .values()
            .filter(|g| now - g.last_activity > ttl)
            .map(|g| g.id.clone())
            .collect();
        for id in &idle {
            tracing::info!(game = %id, "idle game dropped");
            self.finish(id);
        }
        idle.len()
    }
}

impl Node {
    /// Invite a peer; the inviter moves first.
    pub fn invite(
        &mut self,
        peer: &PeerId,
        game_id: &str,
        symbol: Symbol,
        now: f64,
    ) -> Result<Vec<OutboundAction>, CoreError> {
        let to = self.peer_addr(peer)?;
        if self.games.games.contains_key(game_id) {
            return Err(CoreError::GameExists(game_id.to_string()));
        }
        let msg = Message::TictactoeInvite {
            message_id: random_hex_id(16),
            from: self.profile.id.clone(),
            to: peer.clone(),
            game_id: game_id.to_string(),
            symbol,
            timestamp: now,
            token: self.issue_token(Scope::Game, now),
        };
        let mut out = Vec::new();
        self.emit(&mut out, to, &msg, now)?;
        self.games.finished.remove(game_id);
        self.games.games.insert(
            game_id.to_string(),
            Game {
                id: game_id.to_string(),
                opponent: peer.clone(),
                my_symbol: symbol,
                board: [None; 9],
                turn: 0,
                my_turn: true,
                status: GameStatus::Waiting,
                last_activity: now,
            },
        );
        Ok(out)
    }

    /// Place this peer's symbol at `position` (0..9).
    pub fn play(
        &mut self,
        game_id: &str,
        position: usize,
        now: f64,
    ) -> Result<Vec<OutboundAction>, CoreError> {
        let game = self
            .games
            .games
            .get(game_id)
            .ok_or_else(|| CoreError::UnknownGame(game_id.to_string()))?;
        if !game.my_turn {
            return Err(CoreError::NotYourTurn(game_id.to_string()));
        }
        if position > 8 {
            return Err(CoreError::InvalidPosition(position));
        }
        if game.board[position].is_some() {
            return Err(CoreError::CellOccupied(position));
        }
        let to = self
            .id_addr(&game.opponent)
            .ok_or_else(|| CoreError::UnknownPeer(game.opponent.clone()))?;
        let (opponent, symbol, turn) = (game.opponent.clone(), game.my_symbol, game.turn + 1);
        let msg = Message::TictactoeMove {
            message_id: random_hex_id(16),
            from: self.profile.id.clone(),
            to: opponent,
            game_id: game_id.to_string(),
            position: position as i64,
            symbol,
            turn,
            token: self.issue_token(Scope::Game, now),
        };
        let mut out = Vec::new();
        self.emit(&mut out, to, &msg, now)?;

        let Some(game) = self.games.games.get_mut(game_id) else {
            return Ok(out);
        };
        game.board[position] = Some(symbol);
        game.turn = turn;
        game.my_turn = false;
        game.status = GameStatus::InProgress;
        game.last_activity = now;
        if let Some(outcome) = check_game_over(&game.board) {
            let result = match outcome {
                GameOutcome::Win { .. } => GameResult::Win,
                GameOutcome::Draw => GameResult::Draw,
            };
            self.conclude(&mut out, game_id, result, outcome, now)?;
        }
        Ok(out)
    }

    /// Give up out of band. No game-over evaluation.
    pub fn forfeit(&mut self, game_id: &str, now: f64) -> Result<Vec<OutboundAction>, CoreError> {
        let game = self
            .games
            .games
            .get(game_id)
            .ok_or_else(|| CoreError::UnknownGame(game_id.to_string()))?;
        let to = self
            .id_addr(&game.opponent)
            .ok_or_else(|| CoreError::UnknownPeer(game.opponent.clone()))?;
        let msg = Message::TictactoeResult {
            message_id: random_hex_id(16),
            from: self.profile.id.clone(),
            to: game.opponent.clone(),
            game_id: game_id.to_string(),
            result: GameResult::Forfeit,
            symbol: game.my_symbol,
            timestamp: now,
            winning_line: None,
        };
        let mut out = Vec::new();
        self.emit(&mut out, to, &msg, now)?;
        if let Some(game) = self.games.finish(game_id) {
            out.push(OutboundAction::Notify(Event::GameEnded {
                game_id: game.id,
                opponent: game.opponent,
                result: GameResult::Forfeit,
                winning_line: None,
            }));
        }
        Ok(out)
    }

    /// Send RESULT for a finished board and drop local state.
    fn conclude(
        &mut self,
        out: &mut Vec<OutboundAction>,
        game_id: &str,
        result: GameResult,
        outcome: GameOutcome,
        now: f64,
    ) -> Result<(), crate::wire::EncodeError> {
        let Some(mut game) = self.games.finish(game_id) else {
            return Ok(());
        };
        game.status = GameStatus::Finished;
        let winning_line = match outcome {
            GameOutcome::Win { line, .. } => Some(line),
            GameOutcome::Draw => None,
        };
        tracing::info!(game = %game_id, %result, "game over");
        if let Some(to) = self.id_addr(&game.opponent) {
            let msg = Message::TictactoeResult {
                message_id: random_hex_id(16),
                from: self.profile.id.clone(),
                to: game.opponent.clone(),
                game_id: game_id.to_string(),
                result,
                symbol: game.my_symbol,
                timestamp: now,
                winning_line,
            };
            self.emit(out, to, &msg, now)?;
        }
        out.push(OutboundAction::Notify(Event::GameEnded {
            game_id: game.id,
            opponent: game.opponent,
            result,
            winning_line,
        }));
        Ok(())
    }

    pub fn games(&self) -> impl Iterator<Item = &Game> {
        self.games.games.values()
    }

    pub fn game(&self, game_id: &str) -> Option<&Game> {
        self.games.games.get(game_id)
    }
}

pub(crate) fn handle_invite(
    node: &mut Node,
    inbound: Inbound,
    out: &mut Vec<OutboundAction>,
) -> Result<(), DispatchError> {
    let Message::TictactoeInvite {
        message_id,
        from,
        to,
        game_id,
        symbol,
        token: raw_token,
        ..
    } = inbound.message
    else {
        return Ok(());
    };
    if to != node.profile.id {
        return Ok(());
    }
    if !token::validate(&raw_token, Scope::Game, Some(&from), inbound.now) {
        return Err(DispatchError::Unauthorized {
            kind: MessageKind::TictactoeInvite,
            reason: "invalid game token",
        });
    }
    node.push_ack(out, &message_id, inbound.source)?;
    if node.games.games.contains_key(&game_id) {
        tracing::debug!(game = %game_id, "duplicate invite");
        return Ok(());
    }
    let my_symbol = symbol.opposite();
    node.games.finished.remove(&game_id);
    node.games.games.insert(
        game_id.clone(),
        Game {
            id: game_id.clone(),
            opponent: from.clone(),
            my_symbol,
            board: [None; 9],
            turn: 0,
            my_turn: false,
            status: GameStatus::Waiting,
            last_activity: inbound.now,
        },
    );
    out.push(OutboundAction::Notify(Event::GameInvite {
        game_id,
        from,
        my_symbol,
    }));
    Ok(())
}

pub(crate) fn handle_move(
    node: &mut Node,
    inbound: Inbound,
    out: &mut Vec<OutboundAction>,
) -> Result<(), DispatchError> {
    let Message::TictactoeMove {
        message_id,
        from,
        to,
        game_id,
        position,
        symbol,
        turn,
        token: raw_token,
    } = inbound.message
    else {
        return Ok(());
    };
    if to != node.profile.id {
        return Ok(());
    }
    if !token::validate(&raw_token, Scope::Game, Some(&from), inbound.now) {
        return Err(DispatchError::Unauthorized {
            kind: MessageKind::TictactoeMove,
            reason: "invalid game token",
        });
    }
    // Every recognized move is ACKed, applied or not, so the sender stops retrying.
    node.push_ack(out, &message_id, inbound.source)?;
    let now = inbound.now;
    let state = &mut node.games;
    if state.finished.contains(&game_id) {
        return Ok(());
    }
    let key = (from.clone(), game_id.clone(), turn);
    if state.seen_moves.contains(&key) {
        tracing::debug!(game = %game_id, turn, "duplicate move");
        return Ok(());
    }
    let Some(position) = usize::try_from(position).ok().filter(|p| *p < 9) else {
        return Ok(());
    };
    let game = state.games.entry(game_id.clone()).or_insert_with(|| Game {
        id: game_id.clone(),
        opponent: from.clone(),
        my_symbol: symbol.opposite(),
        board: [None; 9],
        turn: 0,
        my_turn: false,
        status: GameStatus::InProgress,
        last_activity: now,
    });
    if game.opponent != from || game.board[position].is_some() || symbol == game.my_symbol {
        return Ok(());
    }
    game.board[position] = Some(symbol);
    game.turn = turn;
    game.my_turn = true;
    game.status = GameStatus::InProgress;
    game.last_activity = now;
    let outcome = check_game_over(&game.board);
    state.seen_moves.insert(key);
    out.push(OutboundAction::Notify(Event::GameMove {
        game_id: game_id.clone(),
        from,
        position,
        symbol,
    }));
    if let Some(outcome) = outcome {
        let result = match outcome {
            GameOutcome::Win { .. } => GameResult::Loss,
            GameOutcome::Draw => GameResult::Draw,
        };
        node.conclude(out, &game_id, result, outcome, now)?;
    }
    Ok(())
}

pub(crate) fn handle_result(
    node: &mut Node,
    inbound: Inbound,
    out: &mut Vec<OutboundAction>,
) -> Result<(), DispatchError> {
    let Message::TictactoeResult {
        message_id,
        from,
        to,
        game_id,
        result,
        winning_line,
        ..
    } = inbound.message
    else {
        return Ok(());
    };
    if to != node.profile.id {
        return Ok(());
    }
    node.push_ack(out, &message_id, inbound.source)?;
    if node.games.games.get(&game_id).is_some_and(|g| g.opponent != from) {
        return Ok(());
    }
    let Some(game) = node.games.finish(&game_id) else {
        return Ok(());
    };
    // Their result, seen from our side.
    let mine = match result {
        GameResult::Win => GameResult::Loss,
        GameResult::Loss => GameResult::Win,
        other => other,
    };
    tracing::info!(game = %game_id, result = %mine, "game over");
    out.push(OutboundAction::Notify(Event::GameEnded {
        game_id,
        opponent: game.opponent,
        result: mine,
        winning_line,
    }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tests::{deliver_to, events, introduce, node, sends, source, T0};

    fn board(cells: &str) -> Board {
        let mut b = [None; 9];
        for (i, c) in cells.chars().enumerate() {
            b[i] = match c {
                'X' => Some(Symbol::X),
                'O' => Some(Symbol::O),
                _ => None,
            };
        }
        b
    }

    #[test]
    fn top_row_wins() {
        assert_eq!(
            check_game_over(&board("XXX......")),
            Some(GameOutcome::Win {
                symbol: Symbol::X,
                line: [0, 1, 2]
            })
        );
    }

    #[test]
    fn diagonal_wins() {
        assert_eq!(
            check_game_over(&board("..O.O.O..")),
            Some(GameOutcome::Win {
                symbol: Symbol::O,
                line: [2, 4, 6]
            })
        );
    }

    #[test]
    fn full_board_without_line_is_draw() {
        assert_eq!(check_game_over(&board("XOXXOOOXX")), Some(GameOutcome::Draw));
    }

    #[test]
    fn unfinished_board_has_no_result() {
        assert_eq!(check_game_over(&board("XO.......")), None);
        assert_eq!(check_game_over(&board(".........")), None);
    }

    #[test]
    fn game_id_shape() {
        let id = new_game_id();
        assert!(id.starts_with('g'));
        assert!(id[1..].parse::<u8>().is_ok());
    }

    fn started() -> (Node, Node) {
        let mut a = node("alice", "10.0.0.1");
        let mut b = node("bob", "10.0.0.2");
        introduce(&mut a, &mut b, T0);
        let out = a.invite(b.id(), "g1", Symbol::X, T0).unwrap();
        let got = deliver_to(&mut b, source(&a), &out, T0);
        assert!(matches!(&events(&got)[0], Event::GameInvite { my_symbol: Symbol::O, .. }));
        deliver_to(&mut a, source(&b), &got, T0);
        (a, b)
    }

    #[test]
    fn turns_enforced_locally() {
        let (mut a, mut b) = started();
        assert!(matches!(b.play("g1", 0, T0), Err(CoreError::NotYourTurn(_))));
        assert!(matches!(a.play("g1", 9, T0), Err(CoreError::InvalidPosition(9))));
        assert!(matches!(a.play("nope", 0, T0), Err(CoreError::UnknownGame(_))));
        let out = a.play("g1", 4, T0).unwrap();
        deliver_to(&mut b, source(&a), &out, T0);
        assert!(b.game("g1").unwrap().my_turn);
        assert!(matches!(b.play("g1", 4, T0), Err(CoreError::CellOccupied(4))));
        assert!(matches!(
            a.invite(b.id(), "g1", Symbol::X, T0),
            Err(CoreError::GameExists(_))
        ));
    }

    #[test]
    fn duplicate_move_applied_once_but_acked() {
        let (mut a, mut b) = started();
        let out = a.play("g1", 0, T0 + 1.0).unwrap();
        deliver_to(&mut b, source(&a), &out, T0 + 1.0);
        let out2 = b.play("g1", 1, T0 + 2.0).unwrap();
        deliver_to(&mut a, source(&b), &out2, T0 + 2.0);

        // Retransmission of turn 1 after the board moved on.
        let again = deliver_to(&mut b, source(&a), &out, T0 + 3.0);
        assert!(matches!(&sends(&again)[..], [Message::Ack { .. }]));
        let g = b.game("g1").unwrap();
        assert_eq!(g.board, board("XO......."));
        assert!(!g.my_turn);
    }

    #[test]
    fn win_sends_results_both_ways_and_clears_state() {
        let (mut a, mut b) = started();
        let mut t = T0;
        for (mover_is_a, pos) in [(true, 0), (false, 3), (true, 1), (false, 4)] {
            t += 1.0;
            if mover_is_a {
                let out = a.play("g1", pos, t).unwrap();
                deliver_to(&mut b, source(&a), &out, t);
            } else {
                let out = b.play("g1", pos, t).unwrap();
                deliver_to(&mut a, source(&b), &out, t);
            }
        }
        let out = a.play("g1", 2, t + 1.0).unwrap();
        assert!(events(&out).contains(&Event::GameEnded {
            game_id: "g1".into(),
            opponent: b.id().clone(),
            result: GameResult::Win,
            winning_line: Some([0, 1, 2]),
        }));
        assert!(a.game("g1").is_none());

        let got = deliver_to(&mut b, source(&a), &out, t + 1.0);
        assert!(events(&got).iter().any(|e| matches!(
            e,
            Event::GameEnded { result: GameResult::Loss, winning_line: Some([0, 1, 2]), .. }
        )));
        assert!(b.game("g1").is_none());
        assert!(sends(&got).iter().any(|m| matches!(
            m,
            Message::TictactoeResult { result: GameResult::Loss, .. }
        )));

        // Late move for a finished game is ACKed and ignored.
        let late = deliver_to(&mut b, source(&a), &out, t + 2.0);
        assert!(events(&late).is_empty());
        assert!(b.game("g1").is_none());
    }

    #[test]
    fn forfeit_notifies_opponent() {
        let (mut a, mut b) = started();
        let out = a.forfeit("g1", T0 + 1.0).unwrap();
        assert!(a.game("g1").is_none());
        let got = deliver_to(&mut b, source(&a), &out, T0 + 1.0);
        assert!(events(&got).iter().any(|e| matches!(
            e,
            Event::GameEnded { result: GameResult::Forfeit, .. }
        )));
        assert!(b.game("g1").is_none());
    }

    #[test]
    fn move_for_unknown_game_recreates_state() {
        let mut a = node("alice", "10.0.0.1");
        let mut b = node("bob", "10.0.0.2");
        introduce(&mut a, &mut b, T0);
        a.invite(b.id(), "g9", Symbol::X, T0).unwrap();
        let out = a.play("g9", 8, T0).unwrap();
        deliver_to(&mut b, source(&a), &out, T0);
        let g = b.game("g9").unwrap();
        assert_eq!(g.my_symbol, Symbol::O);
        assert_eq!(g.board[8], Some(Symbol::X));
        assert!(g.my_turn);
    }

    #[test]
    fn idle_games_dropped_by_cleanup() {
        let (mut a, _b) = started();
        a.cleanup(T0 + 100.0);
        assert!(a.game("g1").is_some());
        a.cleanup(T0 + 901.0);
        assert!(a.game("g1").is_none());
    }
}
