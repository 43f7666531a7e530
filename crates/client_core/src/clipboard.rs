use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::sync::watch;

/// How long the "link copied" indicator stays on.
pub const COPY_INDICATOR_RESET: Duration = Duration::from_secs(2);

pub trait Clipboard: Send + Sync {
    fn write_text(&self, text: &str) -> anyhow::Result<()>;
}

/// Clipboard that only remembers what was written.
#[derive(Default)]
pub struct MemoryClipboard {
    contents: Mutex<Vec<String>>,
}

impl MemoryClipboard {
    pub fn contents(&self) -> Vec<String> {
        match self.contents.lock() {
            Ok(contents) => contents.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Clipboard for MemoryClipboard {
    fn write_text(&self, text: &str) -> anyhow::Result<()> {
        self.contents
            .lock()
            .map_err(|_| anyhow::anyhow!("clipboard lock poisoned"))?
            .push(text.to_string());
        Ok(())
    }
}

/// Transient "copied" flag that switches itself off after a delay. A newer
/// copy restarts the delay.
#[derive(Clone)]
pub struct CopyIndicator {
    state: Arc<watch::Sender<bool>>,
    generation: Arc<AtomicU64>,
    reset_after: Duration,
}

impl Default for CopyIndicator {
    fn default() -> Self {
        Self::new(COPY_INDICATOR_RESET)
    }
}

impl CopyIndicator {
    pub fn new(reset_after: Duration) -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
            generation: Arc::new(AtomicU64::new(0)),
            reset_after,
        }
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    pub fn is_on(&self) -> bool {
        *self.state.borrow()
    }

    pub fn mark_copied(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_replace(true);

        let state = Arc::clone(&self.state);
        let current = Arc::clone(&self.generation);
        let reset_after = self.reset_after;
        tokio::spawn(async move {
            tokio::time::sleep(reset_after).await;
            if current.load(Ordering::SeqCst) == generation {
                state.send_replace(false);
            }
        });
    }
}
