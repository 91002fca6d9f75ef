//! Named registry of managers
//!
//! Owned by the application and passed where it is needed; there is no
//! process-wide instance.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use netcore_core::{kdebug, kinfo};

use crate::manager::Manager;

#[derive(Default)]
pub struct Engine {
    managers: RwLock<BTreeMap<String, Arc<Manager>>>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under `manager.name()`. Returns `false` if the name is taken.
    pub fn add(&self, manager: Arc<Manager>) -> bool {
        let mut map = self.managers.write().unwrap();
        let name = manager.name().to_string();
        if map.contains_key(&name) {
            return false;
        }
        kdebug!("engine: registered {}", name);
        map.insert(name, manager);
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<Manager>> {
        self.managers.read().unwrap().get(name).cloned()
    }

    /// Registered names in order.
    pub fn list(&self) -> Vec<String> {
        self.managers.read().unwrap().keys().cloned().collect()
    }

    /// Stop and unregister `name`.
    pub fn kill(&self, name: &str) -> bool {
        let removed = self.managers.write().unwrap().remove(name);
        match removed {
            Some(m) => {
                m.stop();
                kinfo!("engine: killed {}", name);
                true
            }
            None => false,
        }
    }

    /// Stop every manager and clear the registry.
    pub fn stop_all(&self) {
        let all: Vec<_> = std::mem::take(&mut *self.managers.write().unwrap()).into_values().collect();
        for m in all {
            m.stop();
        }
    }

    pub fn len(&self) -> usize {
        self.managers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerState;
    use netcore_core::{ManagerSetting, Mode};
    use netcore_exec::InlineExecutor;

    fn manager(name: &str) -> Arc<Manager> {
        let setting = ManagerSetting::new(name).mode(Mode::Select);
        Arc::new(Manager::new(setting, Arc::new(InlineExecutor::new())).unwrap())
    }

    #[test]
    fn test_registry() {
        let engine = Engine::new();
        assert!(engine.add(manager("b")));
        assert!(engine.add(manager("a")));
        assert!(!engine.add(manager("a")));
        assert_eq!(engine.list(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(engine.get("a").unwrap().name(), "a");
        assert!(engine.get("zzz").is_none());
    }

    #[test]
    fn test_kill_and_stop_all() {
        let engine = Engine::new();
        let a = manager("a");
        let b = manager("b");
        engine.add(a.clone());
        engine.add(b.clone());
        assert!(a.start());
        assert!(b.start());

        assert!(engine.kill("a"));
        assert!(!engine.kill("a"));
        assert_eq!(a.state(), ManagerState::Stopped);
        assert_eq!(b.state(), ManagerState::Running);

        engine.stop_all();
        assert!(engine.is_empty());
        assert_eq!(b.state(), ManagerState::Stopped);
    }
}
