//! Human-like "typing…" / "recording…" pacing for outgoing replies.
//!
//! An imitator starts signalling as soon as a reply is being generated. Once
//! the text is known it keeps signalling until roughly as much time has passed
//! as a person would need to type it, then lets the caller send.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chatbot::messenger::{ChatActivity, Messenger};
use crate::chatbot::timing::RandomSource;

const MIN_PAUSE: Duration = Duration::from_millis(1500);
const MAX_PAUSE: Duration = Duration::from_secs(10);
/// Pacing per character of the final text.
const PER_CHAR: Duration = Duration::from_millis(30);
/// Pacing stops once it is this close to the target.
const TOLERANCE: Duration = Duration::from_secs(1);
/// Stop signalling if no text shows up for this long.
const SAFETY_CUTOFF: Duration = Duration::from_secs(60);

/// Signals activity in a chat until the reply is ready to send.
///
/// Dropping the imitator stops it immediately. `cancel` is the persona's
/// cancellation scope; it also stops the pacing tail.
pub struct ReplyImitator {
    text_tx: Option<oneshot::Sender<usize>>,
    task: Option<JoinHandle<()>>,
    kill: CancellationToken,
}

impl ReplyImitator {
    pub fn start(
        messenger: Arc<dyn Messenger>,
        activity: ChatActivity,
        random: Arc<dyn RandomSource>,
        cancel: CancellationToken,
    ) -> Self {
        let (text_tx, text_rx) = oneshot::channel();
        let kill = CancellationToken::new();
        let task = tokio::spawn(imitate(messenger, activity, random, text_rx, cancel, kill.clone()));
        Self {
            text_tx: Some(text_tx),
            task: Some(task),
            kill,
        }
    }

    /// Hand over the final text and wait until pacing is done.
    pub async fn finish_replying(mut self, text: &str) {
        if let Some(tx) = self.text_tx.take() {
            // The task may already have stopped (cancelled); nothing to pace then.
            let _ = tx.send(text.chars().count());
        }
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!("Reply imitator task failed: {e}");
        }
    }
}

impl Drop for ReplyImitator {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

async fn imitate(
    messenger: Arc<dyn Messenger>,
    activity: ChatActivity,
    random: Arc<dyn RandomSource>,
    mut text_rx: oneshot::Receiver<usize>,
    cancel: CancellationToken,
    kill: CancellationToken,
) {
    let started = Instant::now();
    let cutoff = started + SAFETY_CUTOFF;

    // Phase 1: signal until the text is known or the cutoff passes.
    let mut signalling = true;
    let text_len = loop {
        if signalling {
            signal(messenger.as_ref(), activity).await;
        }
        let pause = random.between(MIN_PAUSE, MAX_PAUSE);
        tokio::select! {
            biased;

            _ = kill.cancelled() => return,
            _ = cancel.cancelled() => return,
            received = &mut text_rx => match received {
                Ok(len) => break len,
                Err(_) => return,
            },
            _ = sleep_until(cutoff), if signalling => {
                debug!("No reply text after {:?}, stop signalling", SAFETY_CUTOFF);
                signalling = false;
            }
            _ = sleep(pause), if signalling => {}
        }
    };

    // Phase 2: keep up appearances until the typing time is plausible.
    let target = PER_CHAR * text_len as u32;
    loop {
        let elapsed = started.elapsed();
        if elapsed + TOLERANCE >= target {
            return;
        }
        let remaining = target - elapsed;
        signal(messenger.as_ref(), activity).await;
        let pause = random.between(MIN_PAUSE, MAX_PAUSE).min(remaining);
        tokio::select! {
            biased;

            _ = kill.cancelled() => return,
            _ = cancel.cancelled() => return,
            _ = sleep(pause) => {}
        }
    }
}

async fn signal(messenger: &dyn Messenger, activity: ChatActivity) {
    if let Err(e) = messenger.notify_activity(activity).await {
        warn!("Failed to signal {:?}: {e}", activity);
    }
}
