//! Board-scope registry of routes, observers, timers and names
//!
//! Ids are serial and never reused within a connection; lookups on a
//! removed id simply return `None`.

use crate::descriptor::DescId;
use crate::error::{LinkError, Result};
use crate::route::route::{Observer, ObserverId, Route, RouteId, TimerId, TimerTask};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct RouteRegistry {
    routes: HashMap<RouteId, Route>,
    observers: HashMap<ObserverId, Observer>,
    timers: HashMap<TimerId, TimerTask>,
    /// Producer names registered by completed routes
    names: HashMap<String, DescId>,
    next_route: u32,
    next_observer: u32,
    next_timer: u32,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ----- routes --------------------------------------------------------

    pub(crate) fn next_route_id(&mut self) -> RouteId {
        let id = RouteId(self.next_route);
        self.next_route += 1;
        id
    }

    pub(crate) fn insert_route(&mut self, route: Route) {
        self.routes.insert(route.id(), route);
    }

    pub fn route(&self, id: RouteId) -> Option<&Route> {
        self.routes.get(&id)
    }

    pub(crate) fn route_mut(&mut self, id: RouteId) -> Option<&mut Route> {
        self.routes.get_mut(&id)
    }

    pub(crate) fn remove_route(&mut self, id: RouteId) -> Option<Route> {
        self.routes.remove(&id)
    }

    pub fn route_ids(&self) -> Vec<RouteId> {
        let mut ids: Vec<_> = self.routes.keys().copied().collect();
        ids.sort();
        ids
    }

    // ----- observers -----------------------------------------------------

    pub(crate) fn next_observer_id(&mut self) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        id
    }

    pub(crate) fn insert_observer(&mut self, observer: Observer) {
        self.observers.insert(observer.id(), observer);
    }

    pub fn observer(&self, id: ObserverId) -> Option<&Observer> {
        self.observers.get(&id)
    }

    pub(crate) fn remove_observer(&mut self, id: ObserverId) -> Option<Observer> {
        self.observers.remove(&id)
    }

    // ----- timers --------------------------------------------------------

    pub(crate) fn next_timer_id(&mut self) -> TimerId {
        let id = TimerId(self.next_timer);
        self.next_timer += 1;
        id
    }

    pub(crate) fn insert_timer(&mut self, timer: TimerTask) {
        self.timers.insert(timer.id(), timer);
    }

    pub fn timer(&self, id: TimerId) -> Option<&TimerTask> {
        self.timers.get(&id)
    }

    pub(crate) fn timer_mut(&mut self, id: TimerId) -> Option<&mut TimerTask> {
        self.timers.get_mut(&id)
    }

    pub(crate) fn remove_timer(&mut self, id: TimerId) -> Option<TimerTask> {
        self.timers.remove(&id)
    }

    // ----- names ---------------------------------------------------------

    pub(crate) fn register_name(&mut self, name: &str, desc: DescId) -> Result<()> {
        if self.names.contains_key(name) {
            return Err(LinkError::InvalidRoute(format!(
                "name \"{name}\" is already registered"
            )));
        }
        self.names.insert(name.to_string(), desc);
        Ok(())
    }

    pub(crate) fn release_names(&mut self, names: &[String]) {
        for name in names {
            self.names.remove(name);
        }
    }

    pub fn lookup_name(&self, name: &str) -> Option<DescId> {
        self.names.get(name).copied()
    }

    pub(crate) fn names(&self) -> &HashMap<String, DescId> {
        &self.names
    }

    /// Drain everything, returning the routes for teardown
    pub(crate) fn drain_routes(&mut self) -> Vec<Route> {
        self.names.clear();
        self.observers.clear();
        self.timers.clear();
        self.routes.drain().map(|(_, r)| r).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Layout;
    use crate::descriptor::{DescriptorArena, SignalClass};

    #[test]
    fn test_serial_ids_never_reused() {
        let mut reg = RouteRegistry::new();
        let a = reg.next_route_id();
        let b = reg.next_route_id();
        assert_ne!(a, b);

        reg.insert_route(Route::new(a, Vec::new(), Vec::new(), Vec::new(), Vec::new()));
        reg.remove_route(a).unwrap();
        let c = reg.next_route_id();
        assert_ne!(c, a);
        assert!(reg.route(a).is_none());
    }

    #[test]
    fn test_name_lifecycle() {
        let mut arena = DescriptorArena::new();
        let desc = arena.sensor(
            0x05,
            0x03,
            Layout::scalar(2, false),
            1.0,
            SignalClass::Sensor,
            None,
        );
        let mut reg = RouteRegistry::new();
        reg.register_name("temp", desc).unwrap();
        assert!(reg.register_name("temp", desc).is_err());
        assert_eq!(reg.lookup_name("temp"), Some(desc));

        reg.release_names(&["temp".to_string()]);
        assert_eq!(reg.lookup_name("temp"), None);
        reg.register_name("temp", desc).unwrap();
    }
}
