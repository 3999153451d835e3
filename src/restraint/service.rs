//! Resource Restraint Service
//!
//! Limits how many executions may hold a scarce resource at once.
//!
//! Each `(restraint, resource unit)` pair has its own queue guarded by its
//! own mutex. Orders are drawn while that mutex is held, so a queue is
//! always sorted by order and activation walks it front to back. An
//! instance only becomes ACTIVE when every older instance of the unit is
//! ACTIVE or FINISHED and its permits fit.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use super::model::{HoldingScope, InstanceState, ResourceRestraint, RestraintInstance};
use crate::error::RestraintError;

/// Told about BLOCKED -> ACTIVE promotions, after the queue is unlocked.
pub trait ActivationListener: Send + Sync {
    fn on_activated(&self, instance: &RestraintInstance);
}

type UnitKey = (String, String);

#[derive(Debug, Default)]
struct UnitQueue {
    instances: Vec<RestraintInstance>,
}

impl UnitQueue {
    fn active_permits(&self) -> u32 {
        self.instances
            .iter()
            .filter(|i| i.state == InstanceState::Active)
            .map(|i| i.permits)
            .sum()
    }

    fn has_blocked(&self) -> bool {
        self.instances.iter().any(|i| i.state == InstanceState::Blocked)
    }

    /// Activates blocked instances in order until one does not fit.
    fn promote(&mut self, capacity: u32, now: DateTime<Utc>) -> Vec<RestraintInstance> {
        let mut active = self.active_permits();
        let mut promoted = Vec::new();

        for instance in self.instances.iter_mut().filter(|i| i.state == InstanceState::Blocked) {
            if active + instance.permits > capacity {
                break;
            }
            instance.state = InstanceState::Active;
            instance.acquired_at = Some(now);
            active += instance.permits;
            promoted.push(instance.clone());
        }
        promoted
    }
}

/// Capacity-limited, order-fair permit queues.
#[derive(Default)]
pub struct ResourceRestraintService {
    restraints: RwLock<HashMap<String, ResourceRestraint>>,
    units: RwLock<HashMap<UnitKey, Arc<Mutex<UnitQueue>>>>,
    index: RwLock<HashMap<String, UnitKey>>,
    listeners: RwLock<Vec<Arc<dyn ActivationListener>>>,
    next_order: AtomicU64,
}

impl ResourceRestraintService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_restraint(&self, name: impl Into<String>, capacity: u32) -> Result<ResourceRestraint, RestraintError> {
        let name = name.into();
        let mut restraints = self.restraints.write();
        if restraints.values().any(|r| r.name == name) {
            return Err(RestraintError::DuplicateRestraint(name));
        }

        let restraint = ResourceRestraint::new(name, capacity);
        info!("Registered restraint '{}' with capacity {}", restraint.name, capacity);
        restraints.insert(restraint.id.clone(), restraint.clone());
        Ok(restraint)
    }

    pub fn restraint(&self, id: &str) -> Option<ResourceRestraint> {
        self.restraints.read().get(id).cloned()
    }

    pub fn restraint_by_name(&self, name: &str) -> Option<ResourceRestraint> {
        self.restraints.read().values().find(|r| r.name == name).cloned()
    }

    pub fn add_listener(&self, listener: Arc<dyn ActivationListener>) {
        self.listeners.write().push(listener);
    }

    /// Requests `permits` on `resource_unit`. The returned instance is
    /// ACTIVE if it could be granted right away, BLOCKED otherwise.
    pub fn acquire(
        &self,
        restraint_id: &str,
        resource_unit: &str,
        release_entity_id: &str,
        scope: HoldingScope,
        permits: u32,
    ) -> Result<RestraintInstance, RestraintError> {
        if permits == 0 {
            return Err(RestraintError::ZeroPermits);
        }
        let restraint = self
            .restraint(restraint_id)
            .ok_or_else(|| RestraintError::RestraintNotFound(restraint_id.to_string()))?;
        if permits > restraint.capacity {
            return Err(RestraintError::PermitsExceedCapacity {
                restraint: restraint.name,
                requested: permits,
                capacity: restraint.capacity,
            });
        }

        let key = (restraint_id.to_string(), resource_unit.to_string());
        let queue = self.queue(&key);
        let instance = {
            let mut queue = queue.lock();
            let order = self.next_order.fetch_add(1, Ordering::SeqCst) + 1;
            let fits = !queue.has_blocked() && queue.active_permits() + permits <= restraint.capacity;
            let now = Utc::now();

            let instance = RestraintInstance {
                id: Uuid::new_v4().to_string(),
                restraint_id: restraint_id.to_string(),
                resource_unit: resource_unit.to_string(),
                release_entity_id: release_entity_id.to_string(),
                scope,
                permits,
                order,
                state: if fits { InstanceState::Active } else { InstanceState::Blocked },
                created_at: now,
                acquired_at: if fits { Some(now) } else { None },
            };
            queue.instances.push(instance.clone());
            self.index.write().insert(instance.id.clone(), key);
            instance
        };

        debug!(
            "Instance {} of '{}' on '{}' is {} ({} permit(s), order {})",
            instance.id, restraint.name, resource_unit, instance.state, permits, instance.order
        );
        Ok(instance)
    }

    /// Returns an instance's permits and activates whoever now fits.
    /// Finishing a finished instance changes nothing.
    pub fn finish_instance(&self, instance_id: &str, resource_unit: &str) -> Result<RestraintInstance, RestraintError> {
        let not_found = || RestraintError::InstanceNotFound(instance_id.to_string());

        let key = self.index.read().get(instance_id).cloned().ok_or_else(not_found)?;
        if key.1 != resource_unit {
            return Err(not_found());
        }
        let capacity = self.restraint(&key.0).map(|r| r.capacity).ok_or_else(not_found)?;
        let queue = self.units.read().get(&key).cloned().ok_or_else(not_found)?;

        let (finished, promoted) = {
            let mut queue = queue.lock();
            let instance = queue
                .instances
                .iter_mut()
                .find(|i| i.id == instance_id)
                .ok_or_else(not_found)?;
            if instance.state == InstanceState::Finished {
                return Ok(instance.clone());
            }
            instance.state = InstanceState::Finished;
            let finished = instance.clone();
            (finished, queue.promote(capacity, Utc::now()))
        };

        debug!("Instance {} finished; {} promoted", instance_id, promoted.len());
        self.announce(&promoted);
        Ok(finished)
    }

    /// Removes every instance held by one of `release_entity_ids` under
    /// `scope`, then re-evaluates the affected units.
    pub fn delete_instances_for_release_type(&self, release_entity_ids: &[String], scope: HoldingScope) -> usize {
        let queues: Vec<(UnitKey, Arc<Mutex<UnitQueue>>)> = self
            .units
            .read()
            .iter()
            .map(|(key, queue)| (key.clone(), Arc::clone(queue)))
            .collect();

        let mut deleted = 0;
        for (key, queue) in queues {
            let capacity = match self.restraint(&key.0) {
                Some(restraint) => restraint.capacity,
                None => continue,
            };

            let (removed, promoted) = {
                let mut queue = queue.lock();
                let mut removed = Vec::new();
                queue.instances.retain(|i| {
                    let matches = i.scope == scope && release_entity_ids.contains(&i.release_entity_id);
                    if matches {
                        removed.push(i.id.clone());
                    }
                    !matches
                });
                let promoted = if removed.is_empty() {
                    Vec::new()
                } else {
                    queue.promote(capacity, Utc::now())
                };
                (removed, promoted)
            };

            if !removed.is_empty() {
                let mut index = self.index.write();
                for id in &removed {
                    index.remove(id);
                }
                deleted += removed.len();
                debug!("Released {} instance(s) on '{}'", removed.len(), key.1);
            }
            self.announce(&promoted);
        }
        deleted
    }

    pub fn get_instance(&self, instance_id: &str) -> Option<RestraintInstance> {
        let key = self.index.read().get(instance_id).cloned()?;
        let queue = self.units.read().get(&key).cloned()?;
        let queue = queue.lock();
        queue.instances.iter().find(|i| i.id == instance_id).cloned()
    }

    /// Permits currently held on a unit.
    pub fn active_permits(&self, restraint_id: &str, resource_unit: &str) -> u32 {
        let key = (restraint_id.to_string(), resource_unit.to_string());
        self.units
            .read()
            .get(&key)
            .map(|q| q.lock().active_permits())
            .unwrap_or(0)
    }

    /// Instances of a unit in order.
    pub fn instances_for(&self, restraint_id: &str, resource_unit: &str) -> Vec<RestraintInstance> {
        let key = (restraint_id.to_string(), resource_unit.to_string());
        self.units
            .read()
            .get(&key)
            .map(|q| q.lock().instances.clone())
            .unwrap_or_default()
    }

    fn queue(&self, key: &UnitKey) -> Arc<Mutex<UnitQueue>> {
        if let Some(queue) = self.units.read().get(key) {
            return Arc::clone(queue);
        }
        Arc::clone(self.units.write().entry(key.clone()).or_default())
    }

    fn announce(&self, promoted: &[RestraintInstance]) {
        if promoted.is_empty() {
            return;
        }
        let listeners = self.listeners.read().clone();
        for instance in promoted {
            info!(
                "Instance {} acquired {} permit(s) on '{}'",
                instance.id, instance.permits, instance.resource_unit
            );
            for listener in &listeners {
                if catch_unwind(AssertUnwindSafe(|| listener.on_activated(instance))).is_err() {
                    error!("Activation listener panicked for instance {}", instance.id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Default)]
    struct Recorder {
        activated: Mutex<Vec<String>>,
    }

    impl ActivationListener for Recorder {
        fn on_activated(&self, instance: &RestraintInstance) {
            self.activated.lock().push(instance.id.clone());
        }
    }

    fn service_with(capacity: u32) -> (ResourceRestraintService, String) {
        let service = ResourceRestraintService::new();
        let restraint = service.register_restraint("db", capacity).unwrap();
        (service, restraint.id)
    }

    #[test]
    fn test_register_rejects_duplicate_names() {
        let (service, _) = service_with(1);
        assert_eq!(
            service.register_restraint("db", 3),
            Err(RestraintError::DuplicateRestraint("db".to_string()))
        );
        assert!(service.restraint_by_name("db").is_some());
    }

    #[test]
    fn test_acquire_validates_request() {
        let (service, id) = service_with(2);
        assert_eq!(
            service.acquire(&id, "u", "e", HoldingScope::Node, 0),
            Err(RestraintError::ZeroPermits)
        );
        assert!(matches!(
            service.acquire(&id, "u", "e", HoldingScope::Node, 3),
            Err(RestraintError::PermitsExceedCapacity { requested: 3, capacity: 2, .. })
        ));
        assert!(matches!(
            service.acquire("missing", "u", "e", HoldingScope::Node, 1),
            Err(RestraintError::RestraintNotFound(_))
        ));
    }

    #[test]
    fn test_capacity_blocks_and_finish_promotes() {
        let (service, id) = service_with(2);
        let recorder = Arc::new(Recorder::default());
        service.add_listener(recorder.clone());

        let a = service.acquire(&id, "u", "p1", HoldingScope::Plan, 1).unwrap();
        let b = service.acquire(&id, "u", "p2", HoldingScope::Plan, 1).unwrap();
        let c = service.acquire(&id, "u", "p3", HoldingScope::Plan, 1).unwrap();
        assert!(a.is_active() && b.is_active());
        assert_eq!(c.state, InstanceState::Blocked);
        assert_eq!(service.active_permits(&id, "u"), 2);

        service.finish_instance(&a.id, "u").unwrap();
        assert_eq!(service.get_instance(&c.id).unwrap().state, InstanceState::Active);
        assert_eq!(*recorder.activated.lock(), vec![c.id.clone()]);
        assert_eq!(service.active_permits(&id, "u"), 2);
    }

    #[test]
    fn test_blocked_head_is_not_overtaken() {
        let (service, id) = service_with(3);
        let big_holder = service.acquire(&id, "u", "e1", HoldingScope::Node, 2).unwrap();
        let wide = service.acquire(&id, "u", "e2", HoldingScope::Node, 2).unwrap();
        // Would fit, but an older request is waiting.
        let small = service.acquire(&id, "u", "e3", HoldingScope::Node, 1).unwrap();

        assert!(big_holder.is_active());
        assert_eq!(wide.state, InstanceState::Blocked);
        assert_eq!(small.state, InstanceState::Blocked);

        service.finish_instance(&big_holder.id, "u").unwrap();
        assert!(service.get_instance(&wide.id).unwrap().is_active());
        assert!(service.get_instance(&small.id).unwrap().is_active());
    }

    #[test]
    fn test_promotion_stops_at_first_misfit() {
        let (service, id) = service_with(2);
        let holder = service.acquire(&id, "u", "e1", HoldingScope::Node, 2).unwrap();
        let one = service.acquire(&id, "u", "e2", HoldingScope::Node, 1).unwrap();
        let two = service.acquire(&id, "u", "e3", HoldingScope::Node, 2).unwrap();
        let three = service.acquire(&id, "u", "e4", HoldingScope::Node, 1).unwrap();

        service.finish_instance(&holder.id, "u").unwrap();
        assert!(service.get_instance(&one.id).unwrap().is_active());
        assert_eq!(service.get_instance(&two.id).unwrap().state, InstanceState::Blocked);
        assert_eq!(service.get_instance(&three.id).unwrap().state, InstanceState::Blocked);
    }

    #[test]
    fn test_finish_is_idempotent() {
        let (service, id) = service_with(1);
        let recorder = Arc::new(Recorder::default());
        service.add_listener(recorder.clone());

        let a = service.acquire(&id, "u", "e1", HoldingScope::Node, 1).unwrap();
        let b = service.acquire(&id, "u", "e2", HoldingScope::Node, 1).unwrap();

        service.finish_instance(&a.id, "u").unwrap();
        let again = service.finish_instance(&a.id, "u").unwrap();
        assert_eq!(again.state, InstanceState::Finished);
        assert_eq!(recorder.activated.lock().len(), 1);
        assert!(service.get_instance(&b.id).unwrap().is_active());

        assert!(matches!(
            service.finish_instance(&a.id, "other-unit"),
            Err(RestraintError::InstanceNotFound(_))
        ));
    }

    #[test]
    fn test_units_are_independent() {
        let (service, id) = service_with(1);
        let a = service.acquire(&id, "east", "e1", HoldingScope::Node, 1).unwrap();
        let b = service.acquire(&id, "west", "e2", HoldingScope::Node, 1).unwrap();
        assert!(a.is_active() && b.is_active());
    }

    #[test]
    fn test_delete_by_release_entity_promotes() {
        let (service, id) = service_with(1);
        let held = service.acquire(&id, "u", "plan-1", HoldingScope::Plan, 1).unwrap();
        let waiting = service.acquire(&id, "u", "plan-2", HoldingScope::Plan, 1).unwrap();

        // Scope must match as well as the entity.
        assert_eq!(service.delete_instances_for_release_type(&["plan-1".to_string()], HoldingScope::Node), 0);
        assert_eq!(service.delete_instances_for_release_type(&["plan-1".to_string()], HoldingScope::Plan), 1);

        assert!(service.get_instance(&held.id).is_none());
        assert!(service.get_instance(&waiting.id).unwrap().is_active());
        assert_eq!(service.instances_for(&id, "u").len(), 1);
    }

    #[test]
    fn test_concurrent_acquire_respects_capacity_and_order() {
        let (service, id) = service_with(3);
        let service = Arc::new(service);

        let handles: Vec<_> = (0..16)
            .map(|n| {
                let service = Arc::clone(&service);
                let id = id.clone();
                thread::spawn(move || {
                    service
                        .acquire(&id, "u", &format!("e{}", n), HoldingScope::Node, 1)
                        .unwrap()
                })
            })
            .collect();
        let mut instances: Vec<RestraintInstance> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        instances.sort_by_key(|i| i.order);

        assert_eq!(service.active_permits(&id, "u"), 3);
        assert!(instances[..3].iter().all(|i| i.is_active()));
        assert!(instances[3..].iter().all(|i| i.state == InstanceState::Blocked));

        // Drain one at a time; activation follows order.
        for k in 0..13 {
            service.finish_instance(&instances[k].id, "u").unwrap();
            assert!(service.active_permits(&id, "u") <= 3);
            assert!(service.get_instance(&instances[k + 3].id).unwrap().is_active());
        }
    }
}
