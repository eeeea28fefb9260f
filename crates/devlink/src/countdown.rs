use std::time::Duration;

use tokio::runtime::Handle;

use tokio_util::sync::CancellationToken;

use tracing::warn;

// A single-slot countdown.
//
// At most one timer is pending per slot. Arming cancels the pending timer
// before handing out a new token, and every arming bumps the generation so
// that a timer which has already fired but lost the race against a re-arm
// can recognise it is stale.
#[derive(Debug, Default)]
pub(crate) struct CountdownSlot {
    generation: u64,
    armed: Option<CancellationToken>,
}

impl CountdownSlot {
    pub(crate) fn rearm(&mut self) -> (u64, CancellationToken) {
        let _ = self.disarm();
        self.generation = self.generation.wrapping_add(1);
        let token = CancellationToken::new();
        self.armed = Some(token.clone());
        (self.generation, token)
    }

    pub(crate) fn disarm(&mut self) -> bool {
        self.armed.take().is_some_and(|token| {
            token.cancel();
            true
        })
    }

    // Consumes the slot if `generation` is still the armed one.
    pub(crate) fn expire(&mut self, generation: u64) -> bool {
        if self.armed.is_some() && self.generation == generation {
            self.armed = None;
            true
        } else {
            false
        }
    }

    pub(crate) const fn is_armed(&self) -> bool {
        self.armed.is_some()
    }
}

// Runs `on_expiry` after `period`, unless `token` is cancelled first.
//
// Returns `false` when no tokio runtime is available to run the timer.
pub(crate) fn spawn_countdown<F>(token: CancellationToken, period: Duration, on_expiry: F) -> bool
where
    F: FnOnce() + Send + 'static,
{
    let Ok(handle) = Handle::try_current() else {
        warn!("No tokio runtime available, countdown of {period:?} is not armed");
        return false;
    };

    drop(handle.spawn(async move {
        if token
            .run_until_cancelled(tokio::time::sleep(period))
            .await
            .is_some()
        {
            on_expiry();
        }
    }));
    true
}
