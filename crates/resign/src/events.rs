use tokio::sync::mpsc;

/// Progress notifications pushed while a session runs.
///
/// The terminal disposition is the value returned by
/// [`Session::run`](crate::Session::run); it is not mirrored onto this
/// channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Message(String),
    Warning(String),
}

pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Sending side of the progress stream. Every event is also mirrored to the
/// `log` facade, so dropping the receiver loses nothing but structure.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

impl EventSender {
    pub fn message(&self, text: impl Into<String>) {
        let text = text.into();
        log::info!("{text}");
        self.tx.send(Event::Message(text)).ok();
    }

    pub fn warning(&self, text: impl Into<String>) {
        let text = text.into();
        log::warn!("{text}");
        self.tx.send(Event::Warning(text)).ok();
    }
}
