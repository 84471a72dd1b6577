use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::{monitor::MonitorState, AppState};

#[derive(Debug, Serialize)]
pub struct FleetResponse {
    pub instance_id: String,
    pub distributed: bool,
    pub instance_count: usize,
    pub members: Vec<String>,
    pub state: MonitorState,
    pub backends: Vec<String>,
}

/// GET /fleet - This replica's view of the monitor fleet
pub async fn fleet_status(State(state): State<Arc<AppState>>) -> Json<FleetResponse> {
    let monitor = &state.monitor;
    Json(FleetResponse {
        instance_id: monitor.instance_id().to_string(),
        distributed: monitor.is_distributed(),
        instance_count: monitor.instance_count(),
        members: monitor.members(),
        state: monitor.state(),
        backends: state.registry.kinds(),
    })
}
