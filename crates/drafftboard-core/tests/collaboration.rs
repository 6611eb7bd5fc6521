//! Multi-session scenarios over an in-process relay.

use drafftboard_core::scene::DecorationKind;
use drafftboard_core::tools::PointerEvent;
use drafftboard_core::{
    BoardSession, CrdtReplica, FontStyle, Geometry, Identity, ReplicatedMap, SerializableColor,
    SessionConfig, ShapeId, TextAlign, ToolKind, WireMessage,
};
use std::time::{Duration, Instant};

fn identity(name: &str) -> Identity {
    Identity {
        id: format!("user-{}", name),
        name: name.to_string(),
        color: "#3366ff".to_string(),
    }
}

fn session(name: &str) -> BoardSession {
    BoardSession::new("board", identity(name), SessionConfig::default())
}

/// Deliver every queued message to every other session until nothing is left.
fn relay(sessions: &mut [&mut BoardSession], now: Instant) {
    for _ in 0..32 {
        let mut pending = Vec::new();
        for (i, session) in sessions.iter_mut().enumerate() {
            for message in session.take_outgoing() {
                pending.push((i, message));
            }
        }
        if pending.is_empty() {
            return;
        }
        for (from, message) in pending {
            for (i, session) in sessions.iter_mut().enumerate() {
                if i != from {
                    session.handle_message(&message, now).unwrap();
                }
            }
        }
    }
    panic!("Relay did not settle");
}

fn ev(t0: Instant, ms: u64, x: f64, y: f64) -> PointerEvent {
    PointerEvent::new(x, y, t0 + Duration::from_millis(ms))
}

fn draw_rect(session: &mut BoardSession, t0: Instant, from: (f64, f64), to: (f64, f64)) -> ShapeId {
    session.set_tool(ToolKind::Rect).unwrap();
    session.pointer_down(ev(t0, 0, from.0, from.1)).unwrap();
    session.pointer_move(ev(t0, 5, to.0, to.1)).unwrap();
    session.pointer_up(ev(t0, 10, to.0, to.1)).unwrap();
    session
        .scene()
        .z_order()
        .last()
        .cloned()
        .expect("rect was created")
}

fn connected_pair(t0: Instant) -> (BoardSession, BoardSession) {
    let mut a = session("ann");
    let mut b = session("bob");
    a.connect();
    b.connect();
    relay(&mut [&mut a, &mut b], t0);
    (a, b)
}

fn indicator_border(session: &BoardSession, owner: &str) -> Option<kurbo::Rect> {
    session
        .scene()
        .decorations()
        .iter()
        .find(|d| matches!(&d.kind, DecorationKind::SelectionBorder { owner: o, .. } if o == owner))
        .map(|d| d.bounds)
}

#[test]
fn create_and_see() {
    let t0 = Instant::now();
    let (mut a, mut b) = connected_pair(t0);

    let id = draw_rect(&mut a, t0, (100.0, 100.0), (150.0, 160.0));
    relay(&mut [&mut a, &mut b], t0);

    let shape = b.scene().get(&id).expect("B sees the rect");
    let record = shape.to_record();
    assert_eq!(record.kind, "rect");
    assert_eq!(record.left, 100.0);
    assert_eq!(record.top, 100.0);
    assert_eq!(record.width, Some(50.0));
    assert_eq!(record.height, Some(60.0));
    assert_eq!(record, a.scene().get(&id).unwrap().to_record());
    assert_eq!(a.stored_record(&id), b.stored_record(&id));
}

#[test]
fn creation_is_published_only_on_release() {
    let t0 = Instant::now();
    let (mut a, mut b) = connected_pair(t0);

    a.set_tool(ToolKind::Rect).unwrap();
    a.pointer_down(ev(t0, 0, 0.0, 0.0)).unwrap();
    a.pointer_move(ev(t0, 10, 40.0, 40.0)).unwrap();
    a.pointer_move(ev(t0, 100, 80.0, 80.0)).unwrap();
    relay(&mut [&mut a, &mut b], t0 + Duration::from_millis(100));
    assert!(b.scene().is_empty());
    assert!(a.replica().is_empty());

    a.pointer_up(ev(t0, 110, 80.0, 80.0)).unwrap();
    relay(&mut [&mut a, &mut b], t0 + Duration::from_millis(110));
    assert_eq!(b.scene().len(), 1);
}

#[test]
fn select_and_drag_visibility() {
    let t0 = Instant::now();
    let (mut a, mut b) = connected_pair(t0);
    let id = draw_rect(&mut a, t0, (100.0, 100.0), (150.0, 140.0));
    relay(&mut [&mut a, &mut b], t0);

    // Press on the shape selects it.
    a.pointer_down(ev(t0, 20, 110.0, 110.0)).unwrap();
    relay(&mut [&mut a, &mut b], t0 + Duration::from_millis(20));
    let border = indicator_border(&b, "user-ann").expect("B shows A's selection");
    assert_eq!(border.x0, 95.0);
    assert_eq!(border.y0, 95.0);
    assert_eq!(border.width(), 60.0);
    assert_eq!(border.height(), 50.0);
    assert!(indicator_border(&a, "user-ann").is_none());

    // Leading publish on the first move.
    a.pointer_move(ev(t0, 30, 130.0, 110.0)).unwrap();
    relay(&mut [&mut a, &mut b], t0 + Duration::from_millis(30));
    assert_eq!(b.scene().get(&id).unwrap().placement.left, 120.0);
    assert_eq!(indicator_border(&b, "user-ann").unwrap().x0, 115.0);

    // Coalesced until release.
    a.pointer_move(ev(t0, 40, 140.0, 110.0)).unwrap();
    a.pointer_move(ev(t0, 50, 150.0, 110.0)).unwrap();
    relay(&mut [&mut a, &mut b], t0 + Duration::from_millis(50));
    assert_eq!(b.scene().get(&id).unwrap().placement.left, 120.0);

    a.pointer_up(ev(t0, 60, 160.0, 110.0)).unwrap();
    relay(&mut [&mut a, &mut b], t0 + Duration::from_millis(60));
    assert_eq!(b.scene().get(&id).unwrap().placement.left, 150.0);
    assert_eq!(indicator_border(&b, "user-ann").unwrap().x0, 145.0);
    assert!(a.next_deadline().is_none());
}

#[test]
fn trailing_publish_fires_after_interval() {
    let t0 = Instant::now();
    let (mut a, mut b) = connected_pair(t0);
    let id = draw_rect(&mut a, t0, (0.0, 0.0), (50.0, 50.0));
    relay(&mut [&mut a, &mut b], t0);

    a.pointer_down(ev(t0, 100, 10.0, 10.0)).unwrap();
    a.pointer_move(ev(t0, 110, 20.0, 10.0)).unwrap();
    a.pointer_move(ev(t0, 120, 30.0, 10.0)).unwrap();
    relay(&mut [&mut a, &mut b], t0 + Duration::from_millis(120));
    assert_eq!(b.scene().get(&id).unwrap().placement.left, 10.0);

    a.pump(t0 + Duration::from_millis(160)).unwrap();
    relay(&mut [&mut a, &mut b], t0 + Duration::from_millis(160));
    assert_eq!(b.scene().get(&id).unwrap().placement.left, 20.0);
}

#[test]
fn concurrent_edits_converge() {
    let t0 = Instant::now();
    let (mut a, mut b) = connected_pair(t0);
    let id = draw_rect(&mut a, t0, (0.0, 0.0), (40.0, 40.0));
    relay(&mut [&mut a, &mut b], t0);

    let t1 = t0 + Duration::from_millis(500);
    assert!(a.select(&id));
    assert!(b.select(&id));
    a.set_fill(SerializableColor::new(255, 0, 0, 255), t1).unwrap();
    b.set_fill(SerializableColor::new(0, 0, 255, 255), t1).unwrap();
    relay(&mut [&mut a, &mut b], t1);

    let a_record = a.scene().get(&id).unwrap().to_record();
    let b_record = b.scene().get(&id).unwrap().to_record();
    assert_eq!(a_record, b_record);
    assert_eq!(a.stored_record(&id), b.stored_record(&id));
    assert!(a_record.fill == "#ff0000" || a_record.fill == "#0000ff");
}

#[test]
fn remote_application_is_not_echoed() {
    let t0 = Instant::now();
    let (mut a, mut b) = connected_pair(t0);
    draw_rect(&mut a, t0, (0.0, 0.0), (40.0, 40.0));

    for message in a.take_outgoing() {
        b.handle_message(&message, t0).unwrap();
    }
    let echoed = b
        .take_outgoing()
        .iter()
        .filter(|json| matches!(WireMessage::from_json(json), Ok(WireMessage::Sync { .. })))
        .count();
    assert_eq!(echoed, 0);
    assert_eq!(b.scene().len(), 1);
}

#[test]
fn replaying_an_update_is_idempotent() {
    let t0 = Instant::now();
    let (mut a, mut b) = connected_pair(t0);
    draw_rect(&mut a, t0, (0.0, 0.0), (40.0, 40.0));
    let messages = a.take_outgoing();

    for message in &messages {
        b.handle_message(message, t0).unwrap();
    }
    let renders = b.scene().render_requests();
    let before: Vec<_> = b.scene().shapes_ordered().map(|s| s.to_record()).collect();
    for message in &messages {
        b.handle_message(message, t0).unwrap();
    }
    let after: Vec<_> = b.scene().shapes_ordered().map(|s| s.to_record()).collect();
    assert_eq!(before, after);
    assert_eq!(b.scene().render_requests(), renders);
}

#[test]
fn deletion_propagates_and_drops_indicators() {
    let t0 = Instant::now();
    let (mut a, mut b) = connected_pair(t0);
    let id = draw_rect(&mut a, t0, (0.0, 0.0), (40.0, 40.0));
    relay(&mut [&mut a, &mut b], t0);
    a.select(&id);
    relay(&mut [&mut a, &mut b], t0);
    assert!(indicator_border(&b, "user-ann").is_some());

    assert_eq!(a.delete_selected(t0).unwrap(), 1);
    relay(&mut [&mut a, &mut b], t0);
    assert!(b.scene().get(&id).is_none());
    assert!(b.stored_record(&id).is_none());
    assert!(indicator_border(&b, "user-ann").is_none());
}

#[test]
fn participant_leaves() {
    let t0 = Instant::now();
    let mut a = session("ann");
    let mut b = session("bob");
    let mut c = session("cid");
    a.connect();
    b.connect();
    c.connect();
    relay(&mut [&mut a, &mut b, &mut c], t0);

    let id = draw_rect(&mut a, t0, (0.0, 0.0), (40.0, 40.0));
    a.select(&id);
    a.pointer_move(ev(t0, 20, 5.0, 5.0)).unwrap();
    relay(&mut [&mut a, &mut b, &mut c], t0);

    for peer in [&b, &c] {
        assert!(peer.renderer().cursor_for("user-ann").is_some());
        assert!(indicator_border(peer, "user-ann").is_some());
        assert_eq!(peer.participants().len(), 3);
    }

    a.disconnect();
    relay(&mut [&mut a, &mut b, &mut c], t0);
    for peer in [&b, &c] {
        assert!(peer.renderer().cursor_for("user-ann").is_none());
        assert!(indicator_border(peer, "user-ann").is_none());
        assert!(
            peer.scene()
                .decorations()
                .iter()
                .all(|d| d.kind.owner() != "user-ann")
        );
        assert_eq!(peer.participants().len(), 2);
        assert!(peer.scene().contains(&id));
    }
}

#[test]
fn silent_participant_expires() {
    let t0 = Instant::now();
    let (mut a, mut b) = connected_pair(t0);
    a.pointer_move(ev(t0, 0, 1.0, 1.0)).unwrap();
    relay(&mut [&mut a, &mut b], t0);
    assert!(b.renderer().cursor_for("user-ann").is_some());

    // A's process stalls: it never pumps again, so no heartbeat goes out.
    b.pump(t0 + Duration::from_secs(31)).unwrap();
    assert!(b.renderer().cursor_for("user-ann").is_none());
    assert_eq!(b.participants().len(), 1);
}

#[test]
fn late_joiner_receives_existing_shapes() {
    let t0 = Instant::now();
    let mut a = session("ann");
    a.connect();
    let first = draw_rect(&mut a, t0, (0.0, 0.0), (10.0, 10.0));
    let second = draw_rect(&mut a, t0, (20.0, 20.0), (30.0, 30.0));
    a.take_outgoing();

    let mut b = session("bob");
    b.connect();
    relay(&mut [&mut a, &mut b], t0);
    assert!(b.scene().contains(&first));
    assert!(b.scene().contains(&second));
    assert_eq!(b.participants().len(), 2);
}

#[test]
fn offline_edits_sent_on_connect() {
    let t0 = Instant::now();
    let mut b = session("bob");
    b.connect();
    let mut a = session("ann");
    let id = draw_rect(&mut a, t0, (0.0, 0.0), (10.0, 10.0));
    assert!(a.take_outgoing().is_empty());

    a.connect();
    relay(&mut [&mut a, &mut b], t0);
    assert!(b.scene().contains(&id));
}

#[test]
fn malformed_remote_record_is_skipped() {
    let t0 = Instant::now();
    let (mut a, mut b) = connected_pair(t0);
    let good = draw_rect(&mut a, t0, (0.0, 0.0), (10.0, 10.0));
    relay(&mut [&mut a, &mut b], t0);

    let mut rogue = CrdtReplica::new();
    rogue.set("broken", r#"{"id":"broken","kind":"rect"}"#).unwrap();
    let bytes = rogue.export_snapshot().unwrap();
    let message = WireMessage::sync("board", "rogue", &bytes).to_json().unwrap();
    b.handle_message(&message, t0).unwrap();

    assert!(!b.scene().contains(&ShapeId::from("broken")));
    assert!(b.scene().contains(&good));
}

#[test]
fn multi_selection_move_publishes_absolute_positions() {
    let t0 = Instant::now();
    let (mut a, mut b) = connected_pair(t0);
    let left = draw_rect(&mut a, t0, (0.0, 0.0), (20.0, 20.0));
    let right = draw_rect(&mut a, t0, (50.0, 0.0), (70.0, 20.0));
    relay(&mut [&mut a, &mut b], t0);

    assert!(a.select_many(&[left.clone(), right.clone()]));
    a.pointer_down(ev(t0, 100, 55.0, 5.0)).unwrap();
    a.pointer_move(ev(t0, 110, 65.0, 15.0)).unwrap();
    a.pointer_up(ev(t0, 120, 65.0, 15.0)).unwrap();
    relay(&mut [&mut a, &mut b], t0 + Duration::from_millis(120));

    let remote_left = b.scene().get(&left).unwrap();
    let remote_right = b.scene().get(&right).unwrap();
    assert!((remote_left.placement.left - 10.0).abs() < 1e-9);
    assert!((remote_left.placement.top - 10.0).abs() < 1e-9);
    assert!((remote_right.placement.left - 60.0).abs() < 1e-9);
}

#[test]
fn layer_order_stays_local() {
    let t0 = Instant::now();
    let (mut a, mut b) = connected_pair(t0);
    let bottom = draw_rect(&mut a, t0, (0.0, 0.0), (10.0, 10.0));
    let top = draw_rect(&mut a, t0, (5.0, 5.0), (15.0, 15.0));
    relay(&mut [&mut a, &mut b], t0);

    assert!(a.bring_forward(&bottom));
    relay(&mut [&mut a, &mut b], t0);
    assert_eq!(a.scene().z_order(), &[top.clone(), bottom.clone()]);
    assert_eq!(b.scene().z_order().len(), 2);
}

#[test]
fn idle_participant_stays_visible() {
    let t0 = Instant::now();
    let (mut a, mut b) = connected_pair(t0);
    let id = draw_rect(&mut a, t0, (0.0, 0.0), (40.0, 40.0));
    a.select(&id);
    relay(&mut [&mut a, &mut b], t0);
    assert!(indicator_border(&b, "user-ann").is_some());

    // Nobody touches anything, but both hosts keep pumping.
    for step in 1..=9 {
        let now = t0 + Duration::from_secs(10 * step);
        a.pump(now).unwrap();
        b.pump(now).unwrap();
        relay(&mut [&mut a, &mut b], now);
        assert!(indicator_border(&b, "user-ann").is_some(), "lost at {}s", 10 * step);
        assert_eq!(b.participants().len(), 2);
        assert_eq!(a.participants().len(), 2);
    }
}

#[test]
fn switching_tool_mid_creation_publishes_the_shape() {
    let t0 = Instant::now();
    let (mut a, mut b) = connected_pair(t0);
    a.set_tool(ToolKind::Rect).unwrap();
    a.pointer_down(ev(t0, 0, 0.0, 0.0)).unwrap();
    a.pointer_move(ev(t0, 10, 30.0, 30.0)).unwrap();
    a.set_tool(ToolKind::Select).unwrap();
    relay(&mut [&mut a, &mut b], t0 + Duration::from_millis(10));

    assert_eq!(a.scene().len(), 1);
    assert_eq!(a.replica().len(), 1);
    assert_eq!(b.scene().len(), 1);
}

#[test]
fn lost_release_then_new_drag_keeps_both_shapes() {
    let t0 = Instant::now();
    let (mut a, mut b) = connected_pair(t0);
    a.set_tool(ToolKind::Rect).unwrap();
    a.pointer_down(ev(t0, 0, 0.0, 0.0)).unwrap();
    a.pointer_move(ev(t0, 10, 20.0, 20.0)).unwrap();
    a.pointer_up(PointerEvent::without_point(t0 + Duration::from_millis(20)))
        .unwrap();
    a.pointer_down(ev(t0, 30, 100.0, 100.0)).unwrap();
    a.pointer_move(ev(t0, 40, 140.0, 140.0)).unwrap();
    a.pointer_up(ev(t0, 50, 140.0, 140.0)).unwrap();
    relay(&mut [&mut a, &mut b], t0 + Duration::from_millis(50));

    assert_eq!(a.scene().len(), 2);
    assert_eq!(a.replica().len(), 2);
    assert_eq!(b.scene().len(), 2);
}

#[test]
fn text_and_corner_edits_replicate() {
    let t0 = Instant::now();
    let (mut a, mut b) = connected_pair(t0);
    a.set_tool(ToolKind::Text).unwrap();
    a.pointer_down(ev(t0, 0, 10.0, 10.0)).unwrap();
    a.pointer_up(ev(t0, 5, 10.0, 10.0)).unwrap();
    let text = a.scene().z_order().last().cloned().unwrap();
    let rect = draw_rect(&mut a, t0 + Duration::from_millis(10), (100.0, 0.0), (160.0, 40.0));
    relay(&mut [&mut a, &mut b], t0 + Duration::from_millis(20));

    let mut now = t0 + Duration::from_millis(100);
    let mut tick = || {
        now += Duration::from_millis(100);
        now
    };
    assert!(a.select(&text));
    assert!(a.set_text("hello\nworld", tick()).unwrap());
    assert!(a.set_font_size(40.0, tick()).unwrap());
    assert!(a.set_font_family("Courier New", tick()).unwrap());
    assert!(a.set_text_align(TextAlign::Center, tick()).unwrap());
    assert!(a.set_font_style(FontStyle::Italic, tick()).unwrap());
    assert!(a.select(&rect));
    let last = tick();
    assert!(a.set_corner_radius(8.0, last).unwrap());
    relay(&mut [&mut a, &mut b], last);

    match &b.scene().get(&text).unwrap().geometry {
        Geometry::Text {
            content,
            font_size,
            format,
            ..
        } => {
            assert_eq!(content, "hello\nworld");
            assert_eq!(*font_size, 40.0);
            assert_eq!(format.font_family, "Courier New");
            assert_eq!(format.align, TextAlign::Center);
            assert_eq!(format.font_style, FontStyle::Italic);
        }
        other => panic!("Expected text, got {:?}", other),
    }
    assert!(matches!(
        b.scene().get(&rect).unwrap().geometry,
        Geometry::Rect { corner_radius, .. } if corner_radius == 8.0
    ));
    assert_eq!(a.stored_record(&text), b.stored_record(&text));
}

#[test]
fn delete_concurrent_with_edit_converges() {
    let t0 = Instant::now();
    let (mut a, mut b) = connected_pair(t0);
    let id = draw_rect(&mut a, t0, (0.0, 0.0), (40.0, 40.0));
    relay(&mut [&mut a, &mut b], t0);

    let t1 = t0 + Duration::from_millis(500);
    assert!(a.select(&id));
    assert!(b.select(&id));
    assert_eq!(a.delete_selected(t1).unwrap(), 1);
    b.set_stroke(SerializableColor::new(0, 128, 0, 255), t1).unwrap();
    relay(&mut [&mut a, &mut b], t1);

    // Either the delete or the edit wins, but both replicas agree.
    assert_eq!(a.scene().contains(&id), b.scene().contains(&id));
    assert_eq!(a.stored_record(&id), b.stored_record(&id));
    if let (Some(left), Some(right)) = (a.scene().get(&id), b.scene().get(&id)) {
        assert_eq!(left.to_record(), right.to_record());
        assert_eq!(left.to_record().stroke, "#008000");
    }
}

#[test]
fn remote_delete_clears_advertised_selection() {
    let t0 = Instant::now();
    let (mut a, mut b) = connected_pair(t0);
    let id = draw_rect(&mut a, t0, (0.0, 0.0), (40.0, 40.0));
    relay(&mut [&mut a, &mut b], t0);
    assert!(b.select(&id));
    relay(&mut [&mut a, &mut b], t0);
    assert!(indicator_border(&a, "user-bob").is_some());

    assert!(a.select(&id));
    a.delete_selected(t0).unwrap();
    relay(&mut [&mut a, &mut b], t0);

    assert!(b.scene().active_selection().is_none());
    assert!(b.local_presence().selection.is_none());
    assert!(indicator_border(&a, "user-bob").is_none());
}
