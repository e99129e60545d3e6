use crate::{
    runner::StopOptions,
    statistic::StatisticsSnapshot,
    strategy::registry::EngineInfo,
    system::StrategyRecord,
    types::StrategyId,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Contract types for the control-plane surface.
///
/// The HTTP shell (out of scope here) maps requests onto
/// [`Supervisor`](super::Supervisor) calls and serialises these responses verbatim.

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeployValidateResponse {
    pub valid: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeployStartResponse {
    pub id: StrategyId,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StrategyListResponse {
    pub strategies: Vec<StrategyRecord>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StatisticsResponse {
    pub metrics: StatisticsSnapshot,
}

/// Body of `POST /strategies/{id}/stop`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StopRequest {
    #[serde(default)]
    pub liquidate: bool,
    #[serde(default)]
    pub force: bool,
}

impl From<StopRequest> for StopOptions {
    fn from(request: StopRequest) -> Self {
        Self {
            liquidate: request.liquidate,
            force: request.force,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EnginesResponse {
    pub engines: Vec<EngineInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UploadResponse {
    pub path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_request_defaults_to_graceful() {
        let request: StopRequest = serde_json::from_str("{}").unwrap();
        assert!(!request.liquidate);
        assert!(!request.force);

        let options = StopOptions::from(StopRequest {
            liquidate: true,
            force: false,
        });
        assert!(options.liquidate);
    }
}
