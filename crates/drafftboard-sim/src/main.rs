//! Drafftboard session simulator.
//!
//! Runs two sessions in one process, relays their messages the way the
//! room server would, and logs what each participant ends up seeing.
//! Pass a JSON config file as the first argument to override defaults.

use drafftboard_core::identity::local_identity;
use drafftboard_core::{
    BoardSession, DecorationKind, MemoryIdentityStore, PointerEvent, ReplicatedMap,
    SerializableColor, SessionConfig, SyncError, SyncResult, ToolKind,
};
use kurbo::Affine;
use std::time::{Duration, Instant};

const ROOM: &str = "sim";
const MAX_RELAY_ROUNDS: usize = 32;

fn main() {
    env_logger::init();
    log::info!("Starting Drafftboard simulator");

    if let Err(e) = run() {
        log::error!("Simulation failed: {}", e);
        std::process::exit(1);
    }
}

fn load_config() -> SyncResult<SessionConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let json = std::fs::read_to_string(&path)
                .map_err(|e| SyncError::Store(format!("Failed to read {}: {}", path, e)))?;
            log::info!("Loaded config from {}", path);
            SessionConfig::from_json(&json)
        }
        None => Ok(SessionConfig::default()),
    }
}

/// Hand every queued message to every other session until the room is quiet.
fn relay(sessions: &mut [&mut BoardSession], now: Instant) -> SyncResult<()> {
    for _ in 0..MAX_RELAY_ROUNDS {
        let mut pending = Vec::new();
        for (i, session) in sessions.iter_mut().enumerate() {
            pending.extend(session.take_outgoing().into_iter().map(|m| (i, m)));
        }
        if pending.is_empty() {
            return Ok(());
        }
        log::debug!("Relaying {} messages", pending.len());
        for (from, message) in pending {
            for (i, session) in sessions.iter_mut().enumerate() {
                if i != from {
                    session.handle_message(&message, now)?;
                }
            }
        }
    }
    log::warn!("Relay still busy after {} rounds", MAX_RELAY_ROUNDS);
    Ok(())
}

fn report(session: &BoardSession) {
    let names: Vec<String> = session
        .participants()
        .into_iter()
        .map(|p| p.name)
        .collect();
    log::info!(
        "[{}] {} shapes, participants: {}",
        session.identity().name,
        session.scene().len(),
        names.join(", ")
    );
    for (id, json) in session.replica().entries() {
        log::info!("[{}]   record {}: {}", session.identity().name, id, json);
    }
    for decoration in session.scene().decorations() {
        let what = match &decoration.kind {
            DecorationKind::CursorAvatar { label, .. } => format!("cursor of {}", label),
            DecorationKind::SelectionBorder { target, .. } => format!("border around {}", target),
            DecorationKind::NameTag { label, target, .. } => {
                format!("name tag '{}' over {}", label, target)
            }
        };
        log::info!(
            "[{}]   {} at ({:.1}, {:.1}) {:.1}x{:.1}",
            session.identity().name,
            what,
            decoration.bounds.x0,
            decoration.bounds.y0,
            decoration.bounds.width(),
            decoration.bounds.height()
        );
    }
}

fn run() -> SyncResult<()> {
    let config = load_config()?;
    let step = config.throttle_interval() + Duration::from_millis(1);

    let mut ann = BoardSession::new(
        ROOM,
        local_identity("Ann", &MemoryIdentityStore::new()),
        config.clone(),
    );
    let mut bob = BoardSession::new(
        ROOM,
        local_identity("Bob", &MemoryIdentityStore::new()),
        config,
    );

    let mut now = Instant::now();
    ann.connect();
    bob.connect();
    relay(&mut [&mut ann, &mut bob], now)?;

    // Ann drags out a rectangle.
    ann.set_tool(ToolKind::Rect)?;
    ann.pointer_down(PointerEvent::new(100.0, 100.0, now))?;
    for i in 1..=5 {
        now += step;
        let offset = f64::from(i) * 30.0;
        ann.pointer_move(PointerEvent::new(100.0 + offset, 100.0 + offset / 2.0, now))?;
        relay(&mut [&mut ann, &mut bob], now)?;
    }
    ann.pointer_up(PointerEvent::new(250.0, 175.0, now))?;
    relay(&mut [&mut ann, &mut bob], now)?;

    // Bob grabs it, moves it, and recolors it.
    bob.set_tool(ToolKind::Select)?;
    now += step;
    bob.pointer_down(PointerEvent::new(150.0, 120.0, now))?;
    for i in 1..=4 {
        now += step;
        bob.pointer_move(PointerEvent::new(150.0 + f64::from(i) * 20.0, 120.0, now))?;
        relay(&mut [&mut ann, &mut bob], now)?;
    }
    bob.pointer_up(PointerEvent::new(230.0, 120.0, now))?;
    now += step;
    bob.set_fill(SerializableColor::new(0x22, 0xaa, 0x44, 255), now)?;
    now += step;
    bob.transform_selection(Affine::rotate(0.25), now)?;
    bob.finish_transform(now)?;
    relay(&mut [&mut ann, &mut bob], now)?;

    // Ann scribbles while Bob still holds the selection.
    ann.set_tool(ToolKind::Freehand)?;
    now += step;
    ann.pointer_down(PointerEvent::new(40.0, 300.0, now))?;
    for i in 1..=8 {
        let x = 40.0 + f64::from(i) * 15.0;
        let y = 300.0 + if i % 2 == 0 { 10.0 } else { -10.0 };
        ann.pointer_move(PointerEvent::new(x, y, now))?;
    }
    ann.pointer_up(PointerEvent::new(160.0, 300.0, now))?;
    relay(&mut [&mut ann, &mut bob], now)?;

    report(&ann);
    report(&bob);

    let converged = ann.replica().entries() == bob.replica().entries();
    if converged {
        log::info!("Replicas converged");
    } else {
        log::warn!("Replicas diverged");
    }

    bob.disconnect();
    relay(&mut [&mut ann, &mut bob], now)?;
    log::info!(
        "After Bob leaves, Ann sees {} participants",
        ann.participants().len()
    );

    let summary = serde_json::json!({
        "room": ROOM,
        "shapes": ann.scene().len(),
        "converged": converged,
    });
    println!("{}", summary);
    Ok(())
}
