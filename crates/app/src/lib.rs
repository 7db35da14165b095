pub mod activity;
pub mod config;
pub mod routes;

use sandbox::launcher::build_launcher;
use sandbox::{ExecutionLimits, ExecutionSupervisor};

use activity::SessionActivity;
use config::AppConfig;
use routes::AppState;

pub fn build_state(config: &AppConfig) -> AppState {
    let launcher = build_launcher(config.to_launch_config());
    AppState {
        supervisor: ExecutionSupervisor::new(launcher, ExecutionLimits::default()),
        activity: SessionActivity::new(),
    }
}
