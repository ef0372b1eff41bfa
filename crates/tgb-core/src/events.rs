//! Observer-facing event stream (log / status / progress / session).

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::domain::SessionToken;

/// Coarse lifecycle status pushed to observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    WaitingPhone,
    WaitingCode,
    WaitingPassword,
    Ready,
    Sending,
    Stopping,
    Finished,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::WaitingPhone => "waiting_phone",
            Status::WaitingCode => "waiting_code",
            Status::WaitingPassword => "waiting_password",
            Status::Ready => "ready",
            Status::Sending => "sending",
            Status::Stopping => "stopping",
            Status::Finished => "finished",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
    pub percent: u8,
}

impl Progress {
    /// `current` is 1-based. Percent is rounded half away from zero.
    pub fn new(current: usize, total: usize) -> Self {
        let percent = if total == 0 {
            100
        } else {
            ((current as f64 / total as f64) * 100.0).round() as u8
        };
        Self {
            current,
            total,
            percent,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Log(String),
    Status(Status),
    Progress(Progress),
    Session(SessionToken),
}

/// Receiver of observer events. Emission never blocks the caller.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Writes events through `tracing` only.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEvents;

impl EventSink for TracingEvents {
    fn emit(&self, event: Event) {
        match event {
            Event::Log(msg) => tracing::info!("{msg}"),
            Event::Status(s) => tracing::debug!(status = s.as_str(), "status"),
            Event::Progress(p) => {
                tracing::debug!(current = p.current, total = p.total, percent = p.percent, "progress")
            }
            Event::Session(_) => tracing::debug!("session token issued"),
        }
    }
}

impl EventSink for mpsc::UnboundedSender<Event> {
    fn emit(&self, event: Event) {
        // A dropped receiver just means nobody is watching anymore.
        let _ = self.send(event);
    }
}

/// Fan-out to several sinks (e.g. tracing + a socket push channel).
#[derive(Clone, Default)]
pub struct Broadcast {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl Broadcast {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for Broadcast {
    fn emit(&self, event: Event) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

pub(crate) fn log(events: &dyn EventSink, msg: impl Into<String>) {
    events.emit(Event::Log(msg.into()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_rounds_like_the_progress_bar() {
        assert_eq!(Progress::new(1, 3).percent, 33);
        assert_eq!(Progress::new(2, 3).percent, 67);
        assert_eq!(Progress::new(3, 3).percent, 100);
        assert_eq!(Progress::new(1, 8).percent, 13);
    }

    #[tokio::test]
    async fn channel_sink_forwards_and_tolerates_closed_receiver() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.emit(Event::Status(Status::Ready));
        assert_eq!(rx.recv().await, Some(Event::Status(Status::Ready)));
        drop(rx);
        tx.emit(Event::Log("nobody listening".to_string()));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_sink() {
        let (a, mut ra) = mpsc::unbounded_channel();
        let (b, mut rb) = mpsc::unbounded_channel();
        let fan = Broadcast::new(vec![Arc::new(a), Arc::new(b)]);
        fan.emit(Event::Log("hi".to_string()));
        assert_eq!(ra.recv().await, Some(Event::Log("hi".to_string())));
        assert_eq!(rb.recv().await, Some(Event::Log("hi".to_string())));
    }
}
