//! Two-way binding between the local scene and the replicated map.
//!
//! Outbound, shapes are serialized into the map either immediately
//! (`publish`) or through the per-target throttle (`publish_throttled`).
//! Inbound, remote change batches are applied to the scene with the echo
//! flag held so nothing written while applying them is sent back out.

use crate::error::SyncResult;
use crate::replica::{ChangeAction, KeyChange, ReplicatedMap};
use crate::scene::{ActiveSelection, Scene};
use crate::shapes::{Shape, ShapeId, SharedRecord};
use crate::throttle::Throttle;
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// What a publish covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PublishTarget {
    Shape(ShapeId),
    /// Every member of the active selection.
    Selection,
}

/// Marks that remote changes are being applied.
#[derive(Debug, Clone, Default)]
pub struct EchoFlag(Rc<Cell<bool>>);

impl EchoFlag {
    pub fn is_set(&self) -> bool {
        self.0.get()
    }

    /// Set the flag until the returned guard is dropped.
    pub fn hold(&self) -> EchoGuard {
        let previous = self.0.replace(true);
        EchoGuard {
            flag: self.0.clone(),
            previous,
        }
    }
}

/// Restores the echo flag on drop, including on early return.
#[derive(Debug)]
pub struct EchoGuard {
    flag: Rc<Cell<bool>>,
    previous: bool,
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        self.flag.set(self.previous);
    }
}

/// Result of applying one remote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Added,
    Updated,
    Removed,
    /// Nothing to do: already present, identical, or unknown target.
    Skipped,
}

/// Counts for one applied batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Added => self.added += 1,
            ApplyOutcome::Updated => self.updated += 1,
            ApplyOutcome::Removed => self.removed += 1,
            ApplyOutcome::Skipped => self.skipped += 1,
        }
    }

    /// Whether anything in the scene changed.
    pub fn changed(&self) -> bool {
        self.added + self.updated + self.removed > 0
    }
}

/// Scene ↔ replicated map binding.
#[derive(Debug)]
pub struct SyncAdapter {
    throttle: Throttle<PublishTarget>,
    echo: EchoFlag,
}

impl SyncAdapter {
    pub fn new(throttle_interval: Duration) -> Self {
        Self {
            throttle: Throttle::new(throttle_interval),
            echo: EchoFlag::default(),
        }
    }

    pub fn echo_flag(&self) -> &EchoFlag {
        &self.echo
    }

    pub fn has_pending(&self) -> bool {
        self.throttle.has_pending()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.throttle.next_deadline()
    }

    /// Records to write for a target, read from the scene right now.
    ///
    /// Members of a multi-selection carry their absolute matrix so receivers
    /// do not interpret selection-relative placement as absolute.
    fn records_for(target: &PublishTarget, scene: &Scene) -> Vec<SharedRecord> {
        let ids = match target {
            PublishTarget::Shape(id) => vec![id.clone()],
            PublishTarget::Selection => match scene.active_selection() {
                Some(ActiveSelection::Multi { members, .. }) => members.clone(),
                Some(ActiveSelection::Single(id)) => vec![id.clone()],
                None => Vec::new(),
            },
        };
        ids.iter()
            .filter_map(|id| {
                let shape = scene.get(id)?;
                let record = shape.to_record();
                if scene.is_multi_member(id) {
                    Some(record.with_matrix(scene.effective_affine(id)?))
                } else {
                    Some(record)
                }
            })
            .collect()
    }

    /// Write the target's current state to the map. Supersedes any pending
    /// throttled publish of the same target. Returns the number of records written.
    pub fn publish(
        &mut self,
        target: &PublishTarget,
        scene: &mut Scene,
        replica: &mut impl ReplicatedMap,
    ) -> SyncResult<usize> {
        if self.echo.is_set() {
            log::trace!("Suppressed publish of {:?} while applying remote changes", target);
            return Ok(0);
        }
        self.throttle.cancel(target);
        let records = Self::records_for(target, scene);
        for record in &records {
            replica.set(&record.id, &record.to_json()?)?;
        }
        if !records.is_empty() {
            scene.request_render();
        }
        Ok(records.len())
    }

    /// Publish through the throttle: the first call in a window writes
    /// immediately, later calls are coalesced into a trailing write picked up
    /// by [`SyncAdapter::flush_due`].
    pub fn publish_throttled(
        &mut self,
        target: &PublishTarget,
        now: Instant,
        scene: &mut Scene,
        replica: &mut impl ReplicatedMap,
    ) -> SyncResult<usize> {
        if self.echo.is_set() {
            return Ok(0);
        }
        if self.throttle.request(target.clone(), now) {
            self.publish(target, scene, replica)
        } else {
            Ok(0)
        }
    }

    /// Perform trailing writes whose window has closed.
    pub fn flush_due(
        &mut self,
        now: Instant,
        scene: &mut Scene,
        replica: &mut impl ReplicatedMap,
    ) -> SyncResult<usize> {
        let mut written = 0;
        for target in self.throttle.due(now) {
            written += self.publish(&target, scene, replica)?;
        }
        Ok(written)
    }

    /// Perform every pending trailing write now.
    pub fn flush_all(
        &mut self,
        scene: &mut Scene,
        replica: &mut impl ReplicatedMap,
    ) -> SyncResult<usize> {
        let mut written = 0;
        for target in self.throttle.take_pending() {
            written += self.publish(&target, scene, replica)?;
        }
        Ok(written)
    }

    /// Drop pending trailing writes. Returns how many were dropped.
    pub fn discard_pending(&mut self) -> usize {
        self.throttle.take_pending().len()
    }

    /// Remove the target's shapes from the map. The caller removes them from the scene.
    pub fn delete(
        &mut self,
        target: &PublishTarget,
        scene: &Scene,
        replica: &mut impl ReplicatedMap,
    ) -> SyncResult<usize> {
        if self.echo.is_set() {
            return Ok(0);
        }
        self.throttle.cancel(target);
        let ids = match target {
            PublishTarget::Shape(id) => vec![id.clone()],
            PublishTarget::Selection => scene.selected_ids(),
        };
        for id in &ids {
            self.throttle.cancel(&PublishTarget::Shape(id.clone()));
            replica.delete(id.as_str())?;
        }
        Ok(ids.len())
    }

    /// Apply a remote change batch to the scene. Local-origin changes are
    /// ignored. A failing item is logged and skipped; the rest still apply.
    pub fn on_remote_batch(
        &mut self,
        changes: &[KeyChange],
        scene: &mut Scene,
        replica: &impl ReplicatedMap,
    ) -> BatchReport {
        let _echo = self.echo.hold();
        let mut report = BatchReport::default();
        for change in changes.iter().filter(|c| !c.local_origin) {
            let result = match change.action {
                ChangeAction::Add => Self::apply_add(&change.id, replica, scene),
                ChangeAction::Update => Self::apply_update(&change.id, replica, scene),
                ChangeAction::Delete => Ok(Self::apply_delete(&change.id, scene)),
            };
            match result {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    log::warn!("Skipping remote change to {}: {}", change.id, e);
                    report.failed += 1;
                }
            }
        }
        if report.changed() {
            log::debug!(
                "Applied remote batch: {} added, {} updated, {} removed",
                report.added,
                report.updated,
                report.removed
            );
        }
        report
    }

    /// Instantiate every record in the map that the scene lacks.
    pub fn reconcile(&mut self, scene: &mut Scene, replica: &impl ReplicatedMap) -> BatchReport {
        let changes: Vec<KeyChange> = replica
            .entries()
            .into_iter()
            .filter(|(id, _)| !scene.contains(&ShapeId::from(id.as_str())))
            .map(|(id, _)| KeyChange::remote(id, ChangeAction::Add))
            .collect();
        self.on_remote_batch(&changes, scene, replica)
    }

    fn apply_add(
        id: &str,
        replica: &impl ReplicatedMap,
        scene: &mut Scene,
    ) -> SyncResult<ApplyOutcome> {
        let Some(json) = replica.get(id) else {
            return Ok(ApplyOutcome::Skipped);
        };
        if scene.contains(&ShapeId::from(id)) {
            return Self::apply_update(id, replica, scene);
        }
        let record = SharedRecord::from_json(id, &json)?;
        let shape = Shape::from_record(&record)?;
        scene.add_shape(shape);
        Ok(ApplyOutcome::Added)
    }

    fn apply_update(
        id: &str,
        replica: &impl ReplicatedMap,
        scene: &mut Scene,
    ) -> SyncResult<ApplyOutcome> {
        let shape_id = ShapeId::from(id);
        let Some(json) = replica.get(id) else {
            return Ok(ApplyOutcome::Skipped);
        };
        let Some(local) = scene.get(&shape_id) else {
            log::debug!("Ignoring update for unknown shape {}", id);
            return Ok(ApplyOutcome::Skipped);
        };
        if local.to_record().to_json()? == json {
            return Ok(ApplyOutcome::Skipped);
        }

        let record = SharedRecord::from_json(id, &json)?;
        // Validate against a copy so a bad record leaves the scene untouched.
        let mut updated = local.clone();
        updated.apply_record(&record)?;
        scene.detach_member(&shape_id);
        scene.modify(&shape_id, |shape| *shape = updated);
        Ok(ApplyOutcome::Updated)
    }

    fn apply_delete(id: &str, scene: &mut Scene) -> ApplyOutcome {
        match scene.remove_shape(&ShapeId::from(id)) {
            Some(_) => ApplyOutcome::Removed,
            None => ApplyOutcome::Skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::MemoryReplica;
    use kurbo::{Affine, Point, Vec2};

    const INTERVAL: Duration = Duration::from_millis(50);

    fn setup() -> (SyncAdapter, Scene, MemoryReplica) {
        (SyncAdapter::new(INTERVAL), Scene::new(), MemoryReplica::new())
    }

    fn record_json(shape: &Shape) -> String {
        shape.to_record().to_json().unwrap()
    }

    #[test]
    fn test_echo_guard_resets_on_drop() {
        let flag = EchoFlag::default();
        {
            let _guard = flag.hold();
            assert!(flag.is_set());
            {
                let _inner = flag.hold();
            }
            assert!(flag.is_set());
        }
        assert!(!flag.is_set());
    }

    #[test]
    fn test_publish_writes_record() {
        let (mut sync, mut scene, mut replica) = setup();
        let shape = Shape::rect(Point::new(1.0, 2.0), 3.0, 4.0);
        let id = shape.id().clone();
        scene.add_shape(shape.clone());

        let written = sync
            .publish(&PublishTarget::Shape(id.clone()), &mut scene, &mut replica)
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(replica.get(id.as_str()), Some(record_json(&shape)));
    }

    #[test]
    fn test_publish_suppressed_while_echo_held() {
        let (mut sync, mut scene, mut replica) = setup();
        let shape = Shape::rect(Point::ZERO, 3.0, 4.0);
        let id = shape.id().clone();
        scene.add_shape(shape);

        let guard = sync.echo_flag().hold();
        let target = PublishTarget::Shape(id);
        assert_eq!(sync.publish(&target, &mut scene, &mut replica).unwrap(), 0);
        assert_eq!(
            sync.publish_throttled(&target, Instant::now(), &mut scene, &mut replica)
                .unwrap(),
            0
        );
        assert_eq!(sync.delete(&target, &scene, &mut replica).unwrap(), 0);
        drop(guard);
        assert!(replica.is_empty());
    }

    #[test]
    fn test_throttled_drag_writes_leading_and_trailing() {
        let (mut sync, mut scene, mut replica) = setup();
        let shape = Shape::rect(Point::ZERO, 10.0, 10.0);
        let id = shape.id().clone();
        scene.add_shape(shape);
        let target = PublishTarget::Shape(id.clone());
        let sub = replica.subscribe();
        let t0 = Instant::now();

        for step in 0..5u64 {
            scene.translate_shape(&id, Vec2::new(1.0, 0.0));
            sync.publish_throttled(
                &target,
                t0 + Duration::from_millis(step * 10),
                &mut scene,
                &mut replica,
            )
            .unwrap();
        }
        assert_eq!(sub.drain().len(), 1);
        assert!(sync.has_pending());

        let written = sync.flush_due(t0 + INTERVAL, &mut scene, &mut replica).unwrap();
        assert_eq!(written, 1);
        let stored = SharedRecord::from_json(id.as_str(), &replica.get(id.as_str()).unwrap())
            .unwrap();
        assert!((stored.left - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_publish_cancels_pending_trailing_write() {
        let (mut sync, mut scene, mut replica) = setup();
        let shape = Shape::rect(Point::ZERO, 10.0, 10.0);
        let id = shape.id().clone();
        scene.add_shape(shape);
        let target = PublishTarget::Shape(id);
        let t0 = Instant::now();

        sync.publish_throttled(&target, t0, &mut scene, &mut replica).unwrap();
        sync.publish_throttled(&target, t0 + Duration::from_millis(5), &mut scene, &mut replica)
            .unwrap();
        sync.publish(&target, &mut scene, &mut replica).unwrap();
        assert!(!sync.has_pending());
        assert_eq!(
            sync.flush_due(t0 + INTERVAL, &mut scene, &mut replica).unwrap(),
            0
        );
    }

    #[test]
    fn test_selection_publish_carries_matrix() {
        let (mut sync, mut scene, mut replica) = setup();
        let a = Shape::rect(Point::ZERO, 10.0, 10.0);
        let b = Shape::rect(Point::new(50.0, 0.0), 10.0, 10.0);
        let (a_id, b_id) = (a.id().clone(), b.id().clone());
        scene.add_shape(a);
        scene.add_shape(b);
        scene.select_many(&[a_id.clone(), b_id.clone()]);
        scene.transform_selection(Affine::translate((7.0, 0.0)));

        let written = sync
            .publish(&PublishTarget::Selection, &mut scene, &mut replica)
            .unwrap();
        assert_eq!(written, 2);
        let stored = SharedRecord::from_json(b_id.as_str(), &replica.get(b_id.as_str()).unwrap())
            .unwrap();
        let matrix = stored.matrix.unwrap();
        assert!((matrix[4] - 57.0).abs() < 1e-9);
        assert!((stored.left - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_remote_add_update_delete() {
        let (mut sync, mut scene, mut replica) = setup();
        let shape = Shape::rect(Point::new(100.0, 100.0), 50.0, 60.0);
        let id = shape.id().clone();

        let batch = replica.apply_remote(vec![(id.as_str(), Some(&record_json(&shape)))]);
        let report = sync.on_remote_batch(&batch, &mut scene, &replica);
        assert_eq!(report.added, 1);
        assert_eq!(scene.get(&id).unwrap().to_record(), shape.to_record());

        let mut moved = shape.clone();
        moved.translate(Vec2::new(10.0, 0.0));
        let batch = replica.apply_remote(vec![(id.as_str(), Some(&record_json(&moved)))]);
        let report = sync.on_remote_batch(&batch, &mut scene, &replica);
        assert_eq!(report.updated, 1);
        assert!((scene.get(&id).unwrap().coords().x0 - 110.0).abs() < 1e-9);

        let batch = replica.apply_remote(vec![(id.as_str(), None)]);
        let report = sync.on_remote_batch(&batch, &mut scene, &replica);
        assert_eq!(report.removed, 1);
        assert!(scene.is_empty());
    }

    #[test]
    fn test_identical_update_skips_render() {
        let (mut sync, mut scene, mut replica) = setup();
        let shape = Shape::rect(Point::ZERO, 5.0, 5.0);
        let id = shape.id().clone();
        scene.add_shape(shape.clone());
        let renders = scene.render_requests();

        let changes = vec![KeyChange::remote(id.as_str(), ChangeAction::Update)];
        replica.set(id.as_str(), &record_json(&shape)).unwrap();
        let report = sync.on_remote_batch(&changes, &mut scene, &replica);
        assert_eq!(report.skipped, 1);
        assert_eq!(scene.render_requests(), renders);
    }

    #[test]
    fn test_malformed_item_does_not_abort_batch() {
        let (mut sync, mut scene, mut replica) = setup();
        let good = Shape::circle(Point::ZERO, 20.0);
        let good_json = record_json(&good);
        let batch = replica.apply_remote(vec![
            ("bad", Some(r#"{"id":"bad","kind":"rect"}"#)),
            (good.id().as_str(), Some(&good_json)),
        ]);
        let report = sync.on_remote_batch(&batch, &mut scene, &replica);
        assert_eq!(report.failed, 1);
        assert_eq!(report.added, 1);
        assert!(scene.contains(good.id()));
        assert!(!sync.echo_flag().is_set());
    }

    #[test]
    fn test_local_origin_changes_ignored() {
        let (mut sync, mut scene, mut replica) = setup();
        let shape = Shape::rect(Point::ZERO, 5.0, 5.0);
        replica
            .set(shape.id().as_str(), &record_json(&shape))
            .unwrap();
        let changes = vec![KeyChange::local(shape.id().as_str(), ChangeAction::Add)];
        let report = sync.on_remote_batch(&changes, &mut scene, &replica);
        assert_eq!(report, BatchReport::default());
        assert!(scene.is_empty());
    }

    #[test]
    fn test_remote_apply_does_not_write_back() {
        let (mut sync, mut scene, mut replica) = setup();
        let sub = replica.subscribe();
        let shape = Shape::rect(Point::ZERO, 5.0, 5.0);
        let batch = replica.apply_remote(vec![(shape.id().as_str(), Some(&record_json(&shape)))]);
        sub.drain();
        sync.on_remote_batch(&batch, &mut scene, &replica);
        assert!(sub.is_empty());
    }

    #[test]
    fn test_update_for_unknown_shape_is_noop() {
        let (mut sync, mut scene, mut replica) = setup();
        let shape = Shape::rect(Point::ZERO, 5.0, 5.0);
        replica
            .set(shape.id().as_str(), &record_json(&shape))
            .unwrap();
        let changes = vec![KeyChange::remote(shape.id().as_str(), ChangeAction::Update)];
        let report = sync.on_remote_batch(&changes, &mut scene, &replica);
        assert_eq!(report.skipped, 1);
        assert!(scene.is_empty());
    }

    #[test]
    fn test_reconcile_instantiates_missing() {
        let (mut sync, mut scene, mut replica) = setup();
        let a = Shape::rect(Point::ZERO, 5.0, 5.0);
        let b = Shape::circle(Point::ZERO, 5.0);
        replica.set(a.id().as_str(), &record_json(&a)).unwrap();
        replica.set(b.id().as_str(), &record_json(&b)).unwrap();
        scene.add_shape(a.clone());

        let report = sync.reconcile(&mut scene, &replica);
        assert_eq!(report.added, 1);
        assert_eq!(scene.len(), 2);
    }

    #[test]
    fn test_delete_selection_removes_records() {
        let (mut sync, mut scene, mut replica) = setup();
        let a = Shape::rect(Point::ZERO, 5.0, 5.0);
        let b = Shape::rect(Point::new(20.0, 0.0), 5.0, 5.0);
        let ids = vec![a.id().clone(), b.id().clone()];
        scene.add_shape(a);
        scene.add_shape(b);
        scene.select_many(&ids);
        sync.publish(&PublishTarget::Selection, &mut scene, &mut replica)
            .unwrap();
        assert_eq!(replica.len(), 2);

        let removed = sync
            .delete(&PublishTarget::Selection, &scene, &mut replica)
            .unwrap();
        assert_eq!(removed, 2);
        assert!(replica.is_empty());
    }
}
