use tokio::select;
use tokio::signal::ctrl_c;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Owner side of the stop signal shared by every background loop.
///
/// The signal fires once, on the first of SIGINT, SIGTERM, a
/// [`ShutdownTrigger::begin`] call, or the owner being dropped, and stays
/// set afterwards. Listeners created after the signal fired observe it
/// immediately.
#[derive(Debug)]
pub struct Shutdown {
    pub signal_task: JoinHandle<()>,

    trigger: ShutdownTrigger,
    listener: ShutdownListener,
}

/// Cloneable handle that any task can use to start the shutdown, e.g. on
/// an unrecoverable internal error.
#[derive(Clone, Debug)]
pub struct ShutdownTrigger(mpsc::UnboundedSender<()>);

#[derive(Clone, Debug)]
pub struct ShutdownListener(watch::Receiver<bool>);

impl Shutdown {
    pub fn new() -> Shutdown {
        // Flips to true exactly once; the channel closing means the same thing.
        let (stopping_tx, stopping_rx) = watch::channel(false);

        // Send a value or drop every sender to stop without an OS signal.
        let (begin_tx, begin_rx) = mpsc::unbounded_channel();

        let signal_task = tokio::spawn(async move {
            wait_for_stop_signal(begin_rx).await;
            // The listener held on the Shutdown keeps at least one receiver
            // alive, so the send cannot fail while the owner exists.
            stopping_tx.send(true).ok();
        });

        Shutdown {
            trigger: ShutdownTrigger(begin_tx),
            signal_task,
            listener: ShutdownListener(stopping_rx),
        }
    }

    pub fn listener(&self) -> ShutdownListener {
        self.listener.clone()
    }

    pub fn trigger(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    /// Start the shutdown from inside the process.
    pub fn begin(&self) {
        self.trigger.begin();
    }
}

impl Default for Shutdown {
    fn default() -> Shutdown {
        Shutdown::new()
    }
}

impl ShutdownTrigger {
    pub fn begin(&self) {
        self.0.send(()).ok();
    }
}

#[cfg(unix)]
async fn wait_for_stop_signal(mut begin_rx: mpsc::UnboundedReceiver<()>) {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            select! {
                _ = ctrl_c() => {},
                _ = terminate.recv() => {},
                _ = begin_rx.recv() => {},
            };
        }
        // No signal handler slots left; interactive interrupt still works.
        Err(_) => {
            select! {
                _ = ctrl_c() => {},
                _ = begin_rx.recv() => {},
            };
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_stop_signal(mut begin_rx: mpsc::UnboundedReceiver<()>) {
    select! {
        _ = ctrl_c() => {},
        _ = begin_rx.recv() => {},
    };
}

impl ShutdownListener {
    pub fn shutting_down(&mut self) -> bool {
        *self.0.borrow()
    }

    pub async fn wait(&mut self) {
        if *self.0.borrow() {
            return;
        }

        loop {
            match self.0.changed().await {
                Ok(_) => {
                    if *self.0.borrow() {
                        return;
                    }
                }
                // Sender gone, which only happens once the signal task ran.
                Err(_) => return,
            }
        }
    }
}
