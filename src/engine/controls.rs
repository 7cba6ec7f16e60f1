//! Interactive controls sampled between iterations.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Operator command delivered over IPC.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Control {
    /// Hold before the next iteration until `Resume` or `Quit`.
    Pause,
    /// Leave the paused state.
    Resume,
    /// Rotate the head job to the tail of `pending`.
    Skip,
    /// Stop with `UserCancelled`.
    Quit,
}

/// What the scheduler does after sampling controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    /// Proceed with the iteration.
    Continue,
    /// Skip the head job, then proceed.
    Skip,
    /// Terminate.
    Quit,
}

/// Drain queued controls. A `Pause` blocks until `Resume`, `Quit`, or
/// cancellation; `on_pause` is called with the paused flag on each
/// transition.
pub async fn sample(
    rx: &mut mpsc::Receiver<Control>,
    cancel: &CancellationToken,
    mut on_pause: impl FnMut(bool),
) -> ControlAction {
    let mut action = ControlAction::Continue;

    while let Ok(control) = rx.try_recv() {
        match control {
            Control::Quit => return ControlAction::Quit,
            Control::Skip => action = ControlAction::Skip,
            Control::Resume => {}
            Control::Pause => {
                info!("paused");
                on_pause(true);
                let resumed = wait_for_resume(rx, cancel, &mut action).await;
                on_pause(false);
                if !resumed {
                    return ControlAction::Quit;
                }
                info!("resumed");
            }
        }
    }

    action
}

async fn wait_for_resume(
    rx: &mut mpsc::Receiver<Control>,
    cancel: &CancellationToken,
    action: &mut ControlAction,
) -> bool {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return false,
            control = rx.recv() => match control {
                Some(Control::Resume) => return true,
                Some(Control::Quit) | None => return false,
                Some(Control::Skip) => *action = ControlAction::Skip,
                Some(Control::Pause) => {}
            },
        }
    }
}
