use crate::strategy::{
    error::StrategyError, sma::SmaCrossover, EngineParams, SignalEvaluator,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Constructs a boxed evaluator from engine-specific params.
pub type EvaluatorFactory = fn(&EngineParams) -> Result<Box<dyn SignalEvaluator>, StrategyError>;

/// Control-plane description of a registered engine.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct EngineInfo {
    pub name: String,
    pub available: bool,
}

/// Registry of named [`SignalEvaluator`] factories.
///
/// Adapters are registered statically at build time and resolved by name at deploy; there
/// is no dynamic loading.
#[derive(Default)]
pub struct EngineRegistry {
    engines: IndexMap<String, EvaluatorFactory>,
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("engines", &self.engines.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in engines.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("sma_crossover", SmaCrossover::from_params);
        registry
    }

    pub fn register<S: Into<String>>(&mut self, name: S, factory: EvaluatorFactory) {
        self.engines.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.engines.contains_key(name)
    }

    /// Construct an evaluator instance for the named engine.
    pub fn resolve(
        &self,
        name: &str,
        params: &EngineParams,
    ) -> Result<Box<dyn SignalEvaluator>, StrategyError> {
        let factory = self
            .engines
            .get(name)
            .ok_or_else(|| StrategyError::UnknownEngine(name.to_owned()))?;
        factory(params)
    }

    /// Engines listing for the control plane.
    pub fn engines(&self) -> Vec<EngineInfo> {
        self.engines
            .keys()
            .map(|name| EngineInfo {
                name: name.clone(),
                available: true,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_resolves_sma_crossover() {
        let registry = EngineRegistry::with_builtin();
        assert!(registry.contains("sma_crossover"));
        assert!(registry.resolve("sma_crossover", &EngineParams::new()).is_ok());
    }

    #[test]
    fn unknown_engine_is_an_error() {
        let registry = EngineRegistry::with_builtin();
        assert!(matches!(
            registry.resolve("vectorbt", &EngineParams::new()),
            Err(StrategyError::UnknownEngine(_))
        ));
    }

    #[test]
    fn invalid_params_propagate_from_factory() {
        let registry = EngineRegistry::with_builtin();
        let mut params = EngineParams::new();
        params.insert("fast".into(), serde_json::json!(50));
        params.insert("slow".into(), serde_json::json!(10));

        assert!(matches!(
            registry.resolve("sma_crossover", &params),
            Err(StrategyError::InvalidParams(_))
        ));
    }
}
