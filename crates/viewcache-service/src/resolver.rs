//! Resolution of the references a compiled plan is built from.

use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;

use crate::types::{Portfolio, UniqueId, VersionCorrection, ViewDefinition};

/// Resolves references to live objects at a given resolution time.
///
/// The shared cache only persists references to views and portfolios, and uses this to turn
/// them back into objects when reading a plan.
pub trait TargetResolver: Send + Sync + std::fmt::Debug {
    fn resolve_view(
        &self,
        id: &UniqueId,
        version_correction: &VersionCorrection,
    ) -> Option<Arc<ViewDefinition>>;

    fn resolve_portfolio(
        &self,
        id: &UniqueId,
        version_correction: &VersionCorrection,
    ) -> Option<Arc<Portfolio>>;
}

/// A [`TargetResolver`] over objects held in memory.
///
/// Objects are resolved by their exact [`UniqueId`], regardless of the resolution time.
#[derive(Debug, Default)]
pub struct InMemoryTargetResolver {
    views: RwLock<FxHashMap<UniqueId, Arc<ViewDefinition>>>,
    portfolios: RwLock<FxHashMap<UniqueId, Arc<Portfolio>>>,
}

impl InMemoryTargetResolver {
    pub fn add_view(&self, view: Arc<ViewDefinition>) {
        let mut views = self.views.write().unwrap();
        views.insert(view.unique_id.clone(), view);
    }

    pub fn remove_view(&self, id: &UniqueId) -> Option<Arc<ViewDefinition>> {
        self.views.write().unwrap().remove(id)
    }

    pub fn add_portfolio(&self, portfolio: Arc<Portfolio>) {
        let mut portfolios = self.portfolios.write().unwrap();
        portfolios.insert(portfolio.unique_id.clone(), portfolio);
    }
}

impl TargetResolver for InMemoryTargetResolver {
    fn resolve_view(&self, id: &UniqueId, _: &VersionCorrection) -> Option<Arc<ViewDefinition>> {
        self.views.read().unwrap().get(id).cloned()
    }

    fn resolve_portfolio(&self, id: &UniqueId, _: &VersionCorrection) -> Option<Arc<Portfolio>> {
        self.portfolios.read().unwrap().get(id).cloned()
    }
}
