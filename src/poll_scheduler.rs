//! Periodic status polling.

use std::sync::Arc;

use crate::{atdome_model::ATDomeCmd, coordinator::EngineState, error::ATDomeError};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Never connected.
    #[default]
    Idle,
    Polling,
    /// The connection the loop was polling is gone.
    Stopped,
}

/// Which status command to send on cycle `n_status`.
///
/// Every `short_per_full`th request is a full status, starting with the
/// first one.
pub fn status_command(n_status: usize, short_per_full: usize) -> ATDomeCmd {
    if n_status % short_per_full == 0 {
        ATDomeCmd::GetFullStatus
    } else {
        ATDomeCmd::GetShortStatus
    }
}

/// Poll status until connection `generation` is closed or lost.
pub(crate) async fn run_status_loop(engine: Arc<EngineState>, generation: u64) {
    log::debug!("Status loop starting.");
    let short_per_full = engine.config.short_per_full;
    let mut n_status: usize = 0;

    while engine.is_connected(generation) {
        let atdome_cmd = status_command(n_status, short_per_full);
        n_status = (n_status + 1) % short_per_full;

        match engine.poll_status(&atdome_cmd).await {
            Ok(()) => {}
            Err(ATDomeError::NotConnected) => break,
            Err(err) if err.is_connection_fatal() => break,
            Err(err) => log::warn!("Status request failed: {err}"),
        }

        engine.sleep_interruptible().await;
    }

    engine.stop_polling(generation);
    log::debug!("Status loop ended.");
}
