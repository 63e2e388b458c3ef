//! Interactive command reader on stdin and user-facing event output.

use std::path::PathBuf;

use lanlink_core::game::new_game_id;
use lanlink_core::{unix_now, CoreError, Event, Node, OutboundAction, PeerId, Symbol};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use crate::net::Context;
use crate::transfer::save_received_file;

const HELP: &str = "\
commands:
  peers | following | followers | posts | groups | games | offers
  dms <peer>                      group_log <group>
  follow <peer>                   unfollow <peer>
  post <text>                     like <post_ts> | unlike <post_ts>
  dm <peer> <text>                dm_token <peer> <token> <text>
  revoke <message_id>
  group_create <name> <m1,m2>     group_update <group> <add|-> <remove|->
  group_msg <group> <text>
  invite <peer>                   move <game> <0-8>     forfeit <game>
  send_file <peer> <path> [description]                 accept <file_id>
  help | quit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Peers,
    Following,
    Followers,
    Posts,
    Groups,
    Games,
    Offers,
    Dms(String),
    GroupLog(String),
    Follow(String),
    Unfollow(String),
    Post(String),
    Dm { peer: String, text: String },
    DmToken { peer: String, token: String, text: String },
    Revoke(String),
    Like(String),
    Unlike(String),
    GroupCreate { name: String, members: Vec<String> },
    GroupUpdate { group: String, add: Vec<String>, remove: Vec<String> },
    GroupMsg { group: String, text: String },
    Invite(String),
    Move { game: String, position: usize },
    Forfeit(String),
    SendFile { peer: String, path: PathBuf, description: String },
    Accept(String),
    Quit,
}

fn list_arg(s: &str) -> Vec<String> {
    if s == "-" {
        return Vec::new();
    }
    s.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse one input line. `Ok(None)` for a blank line.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    // `n` leading words, then the remainder as free text.
    let words = |n: usize| -> Result<(Vec<&str>, &str), String> {
        let mut parts = rest.splitn(n + 1, char::is_whitespace);
        let mut head = Vec::with_capacity(n);
        for _ in 0..n {
            match parts.next().filter(|p| !p.is_empty()) {
                Some(p) => head.push(p),
                None => return Err(format!("usage error for '{verb}', try 'help'")),
            }
        }
        Ok((head, parts.next().unwrap_or("").trim()))
    };
    let text = |s: &str| -> Result<String, String> {
        if s.is_empty() {
            Err(format!("'{verb}' needs text"))
        } else {
            Ok(s.to_string())
        }
    };
    let one = || words(1).map(|(w, _)| w[0].to_string());
    let cmd = match verb {
        "help" | "?" => Command::Help,
        "peers" => Command::Peers,
        "following" => Command::Following,
        "followers" => Command::Followers,
        "posts" => Command::Posts,
        "groups" => Command::Groups,
        "games" => Command::Games,
        "offers" => Command::Offers,
        "dms" => Command::Dms(one()?),
        "group_log" => Command::GroupLog(one()?),
        "follow" => Command::Follow(one()?),
        "unfollow" => Command::Unfollow(one()?),
        "post" => Command::Post(text(rest)?),
        "dm" => {
            let (w, t) = words(1)?;
            Command::Dm {
                peer: w[0].to_string(),
                text: text(t)?,
            }
        }
        "dm_token" => {
            let (w, t) = words(2)?;
            Command::DmToken {
                peer: w[0].to_string(),
                token: w[1].to_string(),
                text: text(t)?,
            }
        }
        "revoke" => Command::Revoke(one()?),
        "like" => Command::Like(one()?),
        "unlike" => Command::Unlike(one()?),
        "group_create" => {
            let (w, t) = words(1)?;
            Command::GroupCreate {
                name: w[0].to_string(),
                members: list_arg(t),
            }
        }
        "group_update" => {
            let (w, _) = words(3)?;
            Command::GroupUpdate {
                group: w[0].to_string(),
                add: list_arg(w[1]),
                remove: list_arg(w[2]),
            }
        }
        "group_msg" => {
            let (w, t) = words(1)?;
            Command::GroupMsg {
                group: w[0].to_string(),
                text: text(t)?,
            }
        }
        "invite" => Command::Invite(one()?),
        "move" => {
            let (w, _) = words(2)?;
            let position = w[1]
                .parse()
                .map_err(|_| format!("'{}' is not a board position", w[1]))?;
            Command::Move {
                game: w[0].to_string(),
                position,
            }
        }
        "forfeit" => Command::Forfeit(one()?),
        "send_file" => {
            let (w, t) = words(2)?;
            Command::SendFile {
                peer: w[0].to_string(),
                path: PathBuf::from(w[1]),
                description: t.to_string(),
            }
        }
        "accept" => Command::Accept(one()?),
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command '{other}', try 'help'")),
    };
    Ok(Some(cmd))
}

/// Resolve a peer by full id, username or display name. Unknown names pass through as ids.
pub fn resolve_peer(node: &Node, name: &str) -> PeerId {
    let exact = PeerId::from(name);
    if node.peers().contains(&exact) {
        return exact;
    }
    let mut matches = node
        .peers()
        .iter()
        .filter(|p| p.id.username() == name || p.display_name == name);
    match (matches.next(), matches.next()) {
        (Some(p), None) => p.id.clone(),
        _ => exact,
    }
}

/// Read commands until `quit`, EOF or shutdown.
pub async fn run_reader(mut ctx: Context, shutdown_tx: watch::Sender<bool>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{HELP}");
    loop {
        let line = tokio::select! {
            l = lines.next_line() => l,
            _ = ctx.shutdown.changed() => break,
        };
        let line = match line {
            Ok(Some(l)) => l,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "stdin read failed");
                break;
            }
        };
        match parse(&line) {
            Ok(Some(Command::Quit)) => break,
            Ok(Some(cmd)) => execute(&ctx, cmd).await,
            Ok(None) => {}
            Err(msg) => println!("{msg}"),
        }
    }
    let _ = shutdown_tx.send(true);
}

async fn execute(ctx: &Context, cmd: Command) {
    // File contents are read before taking the lock.
    let file = match &cmd {
        Command::SendFile { path, .. } => match tokio::fs::read(path).await {
            Ok(data) => Some(data),
            Err(e) => {
                println!("cannot read {}: {e}", path.display());
                return;
            }
        },
        _ => None,
    };
    let result = {
        let mut node = ctx.node.lock().await;
        apply(&mut node, cmd, file, unix_now())
    };
    match result {
        Ok(actions) => ctx.perform(actions).await,
        Err(e) => println!("error: {e}"),
    }
}

/// Run one command against the node. Read-only commands print and return no actions.
fn apply(
    node: &mut Node,
    cmd: Command,
    file: Option<Vec<u8>>,
    now: f64,
) -> Result<Vec<OutboundAction>, CoreError> {
    let actions = match cmd {
        Command::Help => {
            println!("{HELP}");
            Vec::new()
        }
        Command::Peers => {
            for p in node.peers().iter() {
                println!("{} ({}) {} last seen {:.0}s ago", p.display_name, p.id, p.status, now - p.last_seen);
            }
            Vec::new()
        }
        Command::Following => {
            node.following().for_each(|id| println!("{id}"));
            Vec::new()
        }
        Command::Followers => {
            node.followers().for_each(|id| println!("{id}"));
            Vec::new()
        }
        Command::Posts => {
            for p in node.received_posts() {
                let mark = if p.liked { "*" } else { " " };
                println!("{mark} [{}] {}: {}", p.timestamp, p.author, p.content);
            }
            for p in node.sent_posts() {
                println!("  [{}] me: {} ({} likes)", p.timestamp, p.content, p.likes.len());
            }
            Vec::new()
        }
        Command::Groups => {
            for g in node.owned_groups().chain(node.joined_groups()) {
                let members: Vec<&str> = g.members.iter().map(PeerId::as_str).collect();
                println!("{} '{}' owner {} members {}", g.id, g.name, g.owner, members.join(","));
            }
            Vec::new()
        }
        Command::Games => {
            for g in node.games() {
                let turn = if g.my_turn { "your turn" } else { "waiting" };
                println!("{} vs {} as {} ({turn})\n{}", g.id, g.opponent, g.my_symbol, g.render());
            }
            Vec::new()
        }
        Command::Offers => {
            for o in node.pending_offers() {
                println!("{} {} ({} bytes, {}) from {}: {}", o.file_id, o.filename, o.filesize, o.filetype, o.from, o.description);
            }
            Vec::new()
        }
        Command::Dms(name) => {
            let id = resolve_peer(node, &name);
            for r in node.dm_history(&id) {
                println!("[{:.0}] {} -> {}: {}", r.timestamp, r.from, r.to, r.content);
            }
            Vec::new()
        }
        Command::GroupLog(group) => {
            for e in node.group_history(&group) {
                println!("[{:.0}] {}: {}", e.timestamp, e.from, e.content);
            }
            Vec::new()
        }
        Command::Follow(name) => {
            let id = resolve_peer(node, &name);
            node.follow(&id, now)?
        }
        Command::Unfollow(name) => {
            let id = resolve_peer(node, &name);
            node.unfollow(&id, now)?
        }
        Command::Post(text) => {
            let (ts, actions) = node.post(&text, now)?;
            println!("posted {ts}");
            actions
        }
        Command::Dm { peer: name, text } => {
            let id = resolve_peer(node, &name);
            node.send_dm(&id, &text, now)?.1
        }
        Command::DmToken {
            peer: name,
            token,
            text,
        } => {
            let id = resolve_peer(node, &name);
            node.send_dm_with_token(&id, &text, Some(&token), now)?.1
        }
        Command::Revoke(message_id) => {
            node.revoke_dm_token(&message_id, now)?;
            println!("token for {message_id} marked expired");
            Vec::new()
        }
        Command::Like(ts) => node.like(&ts, now)?,
        Command::Unlike(ts) => node.unlike(&ts, now)?,
        Command::GroupCreate { name, members } => {
            let ids: Vec<PeerId> = members.iter().map(|m| resolve_peer(node, m)).collect();
            let (gid, actions) = node.create_group(&name, &ids, now)?;
            println!("created group {gid}");
            actions
        }
        Command::GroupUpdate { group, add, remove } => {
            let add: Vec<PeerId> = add.iter().map(|m| resolve_peer(node, m)).collect();
            let remove: Vec<PeerId> = remove.iter().map(|m| resolve_peer(node, m)).collect();
            node.update_group(&group, &add, &remove, now)?
        }
        Command::GroupMsg { group, text } => node.send_group_message(&group, &text, now)?,
        Command::Invite(name) => {
            let id = resolve_peer(node, &name);
            let mut game_id = new_game_id();
            while node.game(&game_id).is_some() {
                game_id = new_game_id();
            }
            let actions = node.invite(&id, &game_id, Symbol::X, now)?;
            println!("invited {id} to {game_id}; you are X and move first");
            actions
        }
        Command::Move { game, position } => node.play(&game, position, now)?,
        Command::Forfeit(game) => node.forfeit(&game, now)?,
        Command::SendFile {
            peer: name,
            path,
            description,
        } => {
            let id = resolve_peer(node, &name);
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file.bin".to_string());
            let (file_id, actions) =
                node.send_file(&id, &filename, file.unwrap_or_default(), &description, now)?;
            println!("offered {filename} as {file_id}");
            actions
        }
        Command::Accept(file_id) => node.accept_file(&file_id, now)?,
        Command::Quit => Vec::new(),
    };
    Ok(actions)
}

/// Print an event; completed files are saved first.
pub async fn show_event(ctx: &Context, event: Event) {
    match event {
        Event::PeerDiscovered { id, display_name } => println!("+ {display_name} ({id}) is online"),
        Event::PeerEvicted { id } => println!("- {id} went silent"),
        Event::NewFollower { id } => println!("{id} follows you"),
        Event::LostFollower { id } => println!("{id} unfollowed you"),
        Event::PostReceived {
            from,
            timestamp,
            content,
        } => println!("[post {timestamp}] {from}: {content}"),
        Event::PostLiked {
            by,
            post_timestamp,
            action,
            likes,
        } => println!("{by} {action:?}d your post {post_timestamp} ({likes} likes)"),
        Event::DmReceived {
            from,
            content,
            avatar,
            ..
        } => {
            let pic = avatar
                .and_then(|a| a.decode().ok().map(|b| (a.mime_type, b.len())))
                .map(|(mime, n)| format!(" [avatar {mime}, {n} bytes]"))
                .unwrap_or_default();
            println!("[dm] {from}{pic}: {content}");
        }
        Event::DeliveryFailed { key, kind, to } => {
            println!("! {kind} {key} to {to} was never acknowledged")
        }
        Event::GroupJoined {
            group_id,
            group_name,
            owner,
        } => println!("joined group '{group_name}' ({group_id}) owned by {owner}"),
        Event::GroupLeft {
            group_id,
            group_name,
        } => println!("removed from group '{group_name}' ({group_id})"),
        Event::GroupMessage {
            group_id,
            from,
            content,
        } => println!("[{group_id}] {from}: {content}"),
        Event::GameInvite {
            game_id,
            from,
            my_symbol,
        } => println!("{from} invited you to {game_id}; you are {my_symbol}"),
        Event::GameMove { game_id, from, position, .. } => {
            let board = ctx.node.lock().await.game(&game_id).map(|g| g.render());
            println!("{from} played {position} in {game_id}");
            if let Some(board) = board {
                println!("{board}");
            }
        }
        Event::GameEnded {
            game_id,
            opponent,
            result,
            winning_line,
        } => match winning_line {
            Some(line) => println!("{game_id} vs {opponent}: {result} on {line:?}"),
            None => println!("{game_id} vs {opponent}: {result}"),
        },
        Event::FileOffered {
            file_id,
            from,
            filename,
            filesize,
            description,
        } => println!("{from} offers {filename} ({filesize} bytes) as {file_id}: {description}; 'accept {file_id}' to receive"),
        Event::FileReceived {
            file_id,
            from,
            filename,
            data,
            verified,
        } => match save_received_file(&ctx.download_dir, &filename, &data).await {
            Ok(path) => {
                let check = match verified {
                    Some(true) => "verified",
                    Some(false) => "HASH MISMATCH",
                    None => "unverified",
                };
                println!("received {file_id} from {from} -> {} ({check})", path.display());
            }
            Err(e) => tracing::error!(file = %file_id, error = %e, "cannot save received file"),
        },
        Event::FileDelivered { file_id, to } => println!("{to} received {file_id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_free_text_tail() {
        assert_eq!(
            parse("dm bob hello there  friend").unwrap(),
            Some(Command::Dm {
                peer: "bob".into(),
                text: "hello there  friend".into()
            })
        );
        assert_eq!(
            parse("post  hi all ").unwrap(),
            Some(Command::Post("hi all".into()))
        );
    }

    #[test]
    fn parses_lists_and_dashes() {
        assert_eq!(
            parse("group_update team1 - bob,carol").unwrap(),
            Some(Command::GroupUpdate {
                group: "team1".into(),
                add: vec![],
                remove: vec!["bob".into(), "carol".into()],
            })
        );
        assert_eq!(
            parse("group_create Team bob, carol").unwrap(),
            Some(Command::GroupCreate {
                name: "Team".into(),
                members: vec!["bob".into(), "carol".into()],
            })
        );
    }

    #[test]
    fn parses_moves_and_files() {
        assert_eq!(
            parse("move g12 4").unwrap(),
            Some(Command::Move {
                game: "g12".into(),
                position: 4
            })
        );
        assert!(parse("move g12 four").is_err());
        assert_eq!(
            parse("send_file bob ./a.png my cat").unwrap(),
            Some(Command::SendFile {
                peer: "bob".into(),
                path: PathBuf::from("./a.png"),
                description: "my cat".into(),
            })
        );
    }

    #[test]
    fn blank_unknown_and_incomplete() {
        assert_eq!(parse("   ").unwrap(), None);
        assert!(parse("dance").is_err());
        assert!(parse("dm bob").is_err());
        assert!(parse("follow").is_err());
        assert_eq!(parse("quit").unwrap(), Some(Command::Quit));
    }

    #[test]
    fn resolves_by_username() {
        use lanlink_core::{LocalProfile, NodeConfig};
        let mut node = Node::new(
            LocalProfile::new("alice", "10.0.0.1".parse().unwrap(), "Alice"),
            NodeConfig::default(),
        );
        let bytes = lanlink_core::Message::Profile {
            from: PeerId::from("bob@10.0.0.2"),
            display_name: "Bobby".into(),
            status: String::new(),
            avatar: None,
        }
        .encode()
        .unwrap();
        node.handle_datagram(&bytes, "10.0.0.2:50999".parse().unwrap(), 1.0)
            .unwrap();
        assert_eq!(resolve_peer(&node, "bob").as_str(), "bob@10.0.0.2");
        assert_eq!(resolve_peer(&node, "Bobby").as_str(), "bob@10.0.0.2");
        assert_eq!(resolve_peer(&node, "zed@10.0.0.9").as_str(), "zed@10.0.0.9");
    }
}
