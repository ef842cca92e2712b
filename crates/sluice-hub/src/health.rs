//! # Readiness
//!
//! Each pipeline component moves `NotReady → Ready`, and may later become
//! `Failed`. `Failed` is terminal. The hub is ready once every registered
//! component is.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum Readiness {
    NotReady,
    Ready,
    Failed(String),
}

impl Readiness {
    fn can_become(&self, next: &Readiness) -> bool {
        match (self, next) {
            (Readiness::Failed(_), _) => false,
            (_, Readiness::NotReady) => false,
            (Readiness::NotReady, _) => true,
            (Readiness::Ready, Readiness::Failed(_)) => true,
            (Readiness::Ready, Readiness::Ready) => true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub ready: bool,
    pub components: BTreeMap<String, Readiness>,
}

pub struct Health {
    components: RwLock<BTreeMap<String, Readiness>>,
}

impl Health {
    pub fn new(components: &[&str]) -> Self {
        Self {
            components: RwLock::new(
                components
                    .iter()
                    .map(|name| (name.to_string(), Readiness::NotReady))
                    .collect(),
            ),
        }
    }

    pub fn mark_ready(&self, component: &str) -> bool {
        self.transition(component, Readiness::Ready)
    }

    pub fn mark_failed(&self, component: &str, reason: impl Into<String>) -> bool {
        self.transition(component, Readiness::Failed(reason.into()))
    }

    fn transition(&self, component: &str, next: Readiness) -> bool {
        let mut components = self
            .components
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let current = components
            .entry(component.to_string())
            .or_insert(Readiness::NotReady);
        if !current.can_become(&next) {
            tracing::warn!(component, "ignoring readiness change {:?} -> {:?}", current, next);
            return false;
        }
        *current = next;
        true
    }

    pub fn state(&self, component: &str) -> Option<Readiness> {
        self.components
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(component)
            .cloned()
    }

    pub fn is_ready(&self) -> bool {
        let components = self.components.read().unwrap_or_else(PoisonError::into_inner);
        !components.is_empty() && components.values().all(|s| *s == Readiness::Ready)
    }

    pub fn report(&self) -> HealthReport {
        let components = self
            .components
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let ready = !components.is_empty() && components.values().all(|s| *s == Readiness::Ready);
        HealthReport { ready, components }
    }
}
