//! Bulk-send dispatch loop.
//!
//! One run walks the contact list strictly in order:
//! - progress event, then a single delivery attempt per contact
//! - the outcome is handed to an [`OutcomeSink`] and awaited before moving on
//! - provider throttles (`FLOOD_WAIT`) pause the loop for the requested time plus one second
//! - `stop()` is cooperative: the in-flight contact finishes, the next one never starts

use std::{sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    contacts::{self, RawContacts},
    domain::{AssetHandle, ContactRecord, DeliveryOutcome, DeliveryStatus, ImageRef},
    errors::{Error, FailureKind},
    events::{log, Event, EventSink, Progress, Status},
    media,
    ports::{OutcomeSink, ProtocolClient},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Preparing,
    Running,
    Stopping,
    Finished,
}

/// Everything a caller supplies for one bulk send.
#[derive(Clone, Debug)]
pub struct BulkSendRequest {
    pub source: RawContacts,
    pub message_template: String,
    pub default_image: Option<ImageRef>,
    pub delay: Duration,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunReport {
    pub total: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rate_limit_pauses: usize,
    pub sink_failures: usize,
    pub stopped: bool,
}

/// Per-run state. Dropped when `start` returns.
struct BulkSendJob {
    message_template: String,
    default_image: Option<ImageRef>,
    uploaded_default: Option<AssetHandle>,
    delay: Duration,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct LoopInner {
    state: LoopState,
    cancel: Option<CancellationToken>,
}

/// Sequential broadcaster bound to one authenticated client.
pub struct DispatchLoop {
    client: Arc<dyn ProtocolClient>,
    events: Arc<dyn EventSink>,
    inner: Mutex<LoopInner>,
}

impl DispatchLoop {
    pub fn new(client: Arc<dyn ProtocolClient>, events: Arc<dyn EventSink>) -> Self {
        Self {
            client,
            events,
            inner: Mutex::new(LoopInner {
                state: LoopState::Idle,
                cancel: None,
            }),
        }
    }

    pub async fn state(&self) -> LoopState {
        self.inner.lock().await.state
    }

    /// Request a cooperative stop. Returns false when nothing is running.
    pub async fn stop(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if !matches!(inner.state, LoopState::Preparing | LoopState::Running) {
            return false;
        }
        inner.state = LoopState::Stopping;
        if let Some(cancel) = &inner.cancel {
            cancel.cancel();
        }
        drop(inner);

        log(
            self.events.as_ref(),
            "Stop requested. Sending will halt after the current message.",
        );
        self.events.emit(Event::Status(Status::Stopping));
        true
    }

    /// Run one bulk send to completion (or until stopped).
    ///
    /// Only an unreadable contact source, an unauthorized client or a concurrent run
    /// fail the call; per-contact problems are reported through `sink`.
    pub async fn start(
        &self,
        req: BulkSendRequest,
        sink: &dyn OutcomeSink,
    ) -> Result<RunReport> {
        let cancel = CancellationToken::new();
        {
            let mut inner = self.inner.lock().await;
            if matches!(
                inner.state,
                LoopState::Preparing | LoopState::Running | LoopState::Stopping
            ) {
                return Err(Error::AlreadyRunning);
            }
            inner.state = LoopState::Preparing;
            inner.cancel = Some(cancel.clone());
        }

        let result = self.run(req, sink, cancel).await;

        {
            let mut inner = self.inner.lock().await;
            inner.state = LoopState::Finished;
            inner.cancel = None;
        }
        match &result {
            Ok(r) => log(
                self.events.as_ref(),
                format!(
                    "Bulk send finished: {} sent, {} skipped, {} failed of {}.",
                    r.succeeded, r.skipped, r.failed, r.total
                ),
            ),
            Err(e) => log(self.events.as_ref(), format!("Bulk send aborted: {e}")),
        }
        self.events.emit(Event::Status(Status::Finished));

        result
    }

    async fn run(
        &self,
        req: BulkSendRequest,
        sink: &dyn OutcomeSink,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        if !self.client.check_authorized().await? {
            log(self.events.as_ref(), "Error: client is not connected.");
            return Err(Error::NotAuthorized);
        }

        let uploaded_default = self.upload_default(req.default_image.as_ref()).await;

        let contacts = contacts::normalize(&req.source)?;
        let total = contacts.len();
        log(
            self.events.as_ref(),
            format!("Loaded {total} contacts for sending."),
        );

        let job = BulkSendJob {
            message_template: req.message_template,
            default_image: req.default_image,
            uploaded_default,
            delay: req.delay,
            cancel,
        };

        {
            let mut inner = self.inner.lock().await;
            if inner.state == LoopState::Preparing {
                inner.state = LoopState::Running;
            }
        }
        self.events.emit(Event::Status(Status::Sending));

        let mut report = RunReport {
            total,
            ..RunReport::default()
        };

        for (i, contact) in contacts.iter().enumerate() {
            if job.cancel.is_cancelled() {
                log(self.events.as_ref(), "Bulk send interrupted by user.");
                report.stopped = true;
                break;
            }

            self.events
                .emit(Event::Progress(Progress::new(i + 1, total)));
            report.attempted += 1;

            let attempt = self.deliver(i, contact, &job).await;
            let mut backoff = None;
            let outcome = match attempt {
                Ok(()) => {
                    report.succeeded += 1;
                    outcome(contact, DeliveryStatus::Success, None)
                }
                Err(e) => match e.classify() {
                    FailureKind::Skip(detail) => {
                        report.skipped += 1;
                        outcome(contact, DeliveryStatus::Skipped, Some(detail))
                    }
                    FailureKind::RateLimit { seconds } => {
                        report.failed += 1;
                        backoff = Some(seconds);
                        outcome(contact, DeliveryStatus::Error, Some(e.to_string()))
                    }
                    FailureKind::Delivery(detail) => {
                        report.failed += 1;
                        log(
                            self.events.as_ref(),
                            format!("Failed for {}: {detail}", contact.phone),
                        );
                        outcome(contact, DeliveryStatus::Error, Some(detail))
                    }
                },
            };

            if let Err(e) = sink.record(&outcome).await {
                report.sink_failures += 1;
                tracing::warn!(phone = %contact.phone, "outcome sink failed: {e}");
                log(
                    self.events.as_ref(),
                    format!("Could not record outcome for {}: {e}", contact.phone),
                );
            }

            if let Some(seconds) = backoff {
                report.rate_limit_pauses += 1;
                log(
                    self.events.as_ref(),
                    format!("Waiting out FLOOD_WAIT of {seconds}s..."),
                );
                pause(&job.cancel, Duration::from_secs(seconds + 1)).await;
            }

            if i + 1 < total && !job.cancel.is_cancelled() {
                pause(&job.cancel, job.delay).await;
            }
        }

        if job.cancel.is_cancelled() {
            report.stopped = true;
        }
        Ok(report)
    }

    /// Upload the default image once so every send can reuse the handle.
    async fn upload_default(&self, default_image: Option<&ImageRef>) -> Option<AssetHandle> {
        let image = default_image.filter(|i| i.is_usable())?;
        log(
            self.events.as_ref(),
            "Uploading the default image once for reuse...",
        );
        match self.client.upload_asset(image).await {
            Ok(handle) => {
                log(
                    self.events.as_ref(),
                    "Upload complete. The image will be reused for every contact.",
                );
                Some(handle)
            }
            Err(e) => {
                tracing::warn!("default image pre-upload failed: {e}");
                log(
                    self.events.as_ref(),
                    format!("Pre-upload failed: {e}. Sending the image directly instead."),
                );
                None
            }
        }
    }

    async fn deliver(&self, index: usize, contact: &ContactRecord, job: &BulkSendJob) -> Result<()> {
        let message = contact
            .message
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(&job.message_template);
        if message.trim().is_empty() {
            log(
                self.events.as_ref(),
                format!("[SKIP] {}: empty message", contact.phone),
            );
            return Err(Error::EmptyMessage);
        }

        let imported = self
            .client
            .import_contact(&contact.phone, correlation_id(index))
            .await?;
        let Some(user) = imported.users.first() else {
            log(
                self.events.as_ref(),
                format!("[WARN] No Telegram user found for {}", contact.phone),
            );
            return Err(Error::NoSuchUser);
        };

        match media::resolve(
            contact,
            job.default_image.as_ref(),
            job.uploaded_default.as_ref(),
        ) {
            Some(asset) => {
                self.client
                    .send_file_with_caption(user, &asset, message)
                    .await?;
                log(
                    self.events.as_ref(),
                    format!("[SUCCESS] Image + message sent to {}", contact.phone),
                );
            }
            None => {
                self.client.send_message(user, message).await?;
                log(
                    self.events.as_ref(),
                    format!("[SUCCESS] Message sent to {}", contact.phone),
                );
            }
        }
        Ok(())
    }
}

/// Import-request id: wall clock millis offset by the contact's position, unique within a run.
fn correlation_id(index: usize) -> i64 {
    chrono::Utc::now().timestamp_millis() + index as i64 + 1
}

fn outcome(contact: &ContactRecord, status: DeliveryStatus, detail: Option<String>) -> DeliveryOutcome {
    DeliveryOutcome {
        contact: contact.clone(),
        status,
        detail,
    }
}

/// Time-based wait that ends early when the run is stopped.
async fn pause(cancel: &CancellationToken, d: Duration) {
    if d.is_zero() {
        return;
    }
    tokio::select! {
        _ = sleep(d) => {}
        _ = cancel.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AssetRef, ImportedContacts, PeerUser, RemoteContact, SessionToken};
    use crate::ports::LoginPrompts;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::{mpsc, Notify};
    use tokio::time::Instant;

    #[derive(Clone, Debug, PartialEq)]
    enum Call {
        Import(String),
        Text(i64, String),
        File(i64, AssetRef, String),
        Upload,
    }

    enum Fail {
        Flood(u64),
        Broken(&'static str),
    }

    #[derive(Default)]
    struct FakeClient {
        unauthorized: bool,
        fail_upload: bool,
        unknown: HashSet<String>,
        fail_send: StdMutex<HashMap<String, Fail>>,
        calls: StdMutex<Vec<(Instant, Call)>>,
        correlation_ids: StdMutex<Vec<i64>>,
        /// (phone, entered, release): block the send to `phone` until released.
        gate: Option<(String, Arc<Notify>, Arc<Notify>)>,
    }

    impl FakeClient {
        fn calls(&self) -> Vec<Call> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(_, c)| c.clone())
                .collect()
        }

        fn import_times(&self) -> Vec<(String, Instant)> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(t, c)| match c {
                    Call::Import(p) => Some((p.clone(), *t)),
                    _ => None,
                })
                .collect()
        }

        fn push(&self, call: Call) {
            self.calls.lock().unwrap().push((Instant::now(), call));
        }

        async fn maybe_fail(&self, user: &PeerUser) -> Result<()> {
            let phone = user.id.to_string();
            if let Some((gated, entered, release)) = &self.gate {
                if *gated == phone {
                    entered.notify_one();
                    release.notified().await;
                }
            }
            match self.fail_send.lock().unwrap().remove(&phone) {
                Some(Fail::Flood(s)) => Err(Error::Provider {
                    message: format!("A wait of {s} seconds is required (caused by FLOOD_WAIT)"),
                    wait_seconds: Some(s),
                }),
                Some(Fail::Broken(m)) => Err(Error::provider(m)),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl ProtocolClient for FakeClient {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn check_authorized(&self) -> Result<bool> {
            Ok(!self.unauthorized)
        }

        async fn login(&self, _prompts: &dyn LoginPrompts) -> Result<SessionToken> {
            Err(Error::External("not used".to_string()))
        }

        async fn export_session(&self) -> Result<SessionToken> {
            Ok(SessionToken("s".to_string()))
        }

        async fn import_contact(&self, phone: &str, correlation_id: i64) -> Result<ImportedContacts> {
            self.push(Call::Import(phone.to_string()));
            self.correlation_ids.lock().unwrap().push(correlation_id);
            if self.unknown.contains(phone) {
                return Ok(ImportedContacts::default());
            }
            Ok(ImportedContacts {
                users: vec![PeerUser {
                    id: phone.parse().unwrap(),
                    access_hash: None,
                }],
            })
        }

        async fn send_message(&self, user: &PeerUser, text: &str) -> Result<()> {
            self.push(Call::Text(user.id, text.to_string()));
            self.maybe_fail(user).await
        }

        async fn send_file_with_caption(
            &self,
            user: &PeerUser,
            asset: &AssetRef,
            caption: &str,
        ) -> Result<()> {
            self.push(Call::File(user.id, asset.clone(), caption.to_string()));
            self.maybe_fail(user).await
        }

        async fn upload_asset(&self, _image: &ImageRef) -> Result<AssetHandle> {
            self.push(Call::Upload);
            if self.fail_upload {
                return Err(Error::Upload("FILE_PARTS_INVALID".to_string()));
            }
            Ok(AssetHandle("H1".to_string()))
        }

        async fn list_contacts(&self) -> Result<Vec<RemoteContact>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct Collect {
        outcomes: StdMutex<Vec<DeliveryOutcome>>,
        fail: bool,
    }

    impl Collect {
        fn statuses(&self) -> Vec<(String, DeliveryStatus, Option<String>)> {
            self.outcomes
                .lock()
                .unwrap()
                .iter()
                .map(|o| (o.contact.phone.clone(), o.status, o.detail.clone()))
                .collect()
        }
    }

    #[async_trait]
    impl OutcomeSink for Collect {
        async fn record(&self, outcome: &DeliveryOutcome) -> Result<()> {
            self.outcomes.lock().unwrap().push(outcome.clone());
            if self.fail {
                return Err(Error::External("db down".to_string()));
            }
            Ok(())
        }
    }

    fn csv_request(csv: &str, template: &str, delay_ms: u64) -> BulkSendRequest {
        BulkSendRequest {
            source: RawContacts::Delimited(csv.to_string()),
            message_template: template.to_string(),
            default_image: None,
            delay: Duration::from_millis(delay_ms),
        }
    }

    fn setup(client: FakeClient) -> (Arc<FakeClient>, Arc<DispatchLoop>, mpsc::UnboundedReceiver<Event>) {
        let client = Arc::new(client);
        let (tx, rx) = mpsc::unbounded_channel();
        let lp = Arc::new(DispatchLoop::new(client.clone(), Arc::new(tx)));
        (client, lp, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn progress_counts_up_with_rounded_percent() {
        let (_client, lp, mut rx) = setup(FakeClient::default());
        let sink = Collect::default();
        let report = lp
            .start(csv_request("phone\n1\n2\n3\n", "Hi", 0), &sink)
            .await
            .unwrap();

        assert_eq!(report.succeeded, 3);
        let progress: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                Event::Progress(p) => Some((p.current, p.total, p.percent)),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![(1, 3, 33), (2, 3, 67), (3, 3, 100)]);
        assert_eq!(lp.state().await, LoopState::Finished);
    }

    #[tokio::test]
    async fn empty_message_is_skipped_without_network() {
        let (client, lp, _rx) = setup(FakeClient::default());
        let sink = Collect::default();
        let report = lp
            .start(csv_request("phone,message\n1,\n2,   \n", "", 0), &sink)
            .await
            .unwrap();

        assert_eq!(report.skipped, 2);
        assert!(client.calls().is_empty());
        assert_eq!(
            sink.statuses(),
            vec![
                ("1".to_string(), DeliveryStatus::Skipped, Some("empty message".to_string())),
                ("2".to_string(), DeliveryStatus::Skipped, Some("empty message".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn contact_override_beats_template() {
        let (client, lp, _rx) = setup(FakeClient::default());
        let sink = Collect::default();
        lp.start(csv_request("phone,message\n7,Custom\n8,\n", "Default", 0), &sink)
            .await
            .unwrap();

        let texts: Vec<_> = client
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Text(id, t) => Some((id, t)),
                _ => None,
            })
            .collect();
        assert_eq!(
            texts,
            vec![(7, "Custom".to_string()), (8, "Default".to_string())]
        );
    }

    #[tokio::test]
    async fn unknown_user_is_skipped_and_nothing_sent() {
        let client = FakeClient {
            unknown: HashSet::from(["5".to_string()]),
            ..Default::default()
        };
        let (client, lp, _rx) = setup(client);
        let sink = Collect::default();
        lp.start(csv_request("phone\n5\n6\n", "Hi", 0), &sink)
            .await
            .unwrap();

        assert_eq!(
            sink.statuses(),
            vec![
                ("5".to_string(), DeliveryStatus::Skipped, Some("no such user".to_string())),
                ("6".to_string(), DeliveryStatus::Success, None),
            ]
        );
        assert!(!client
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Text(5, _))));
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_the_run() {
        let client = FakeClient::default();
        client
            .fail_send
            .lock()
            .unwrap()
            .insert("1".to_string(), Fail::Broken("PEER_FLOOD"));
        let (_client, lp, _rx) = setup(client);
        let sink = Collect::default();
        let report = lp
            .start(csv_request("phone\n1\n2\n", "Hi", 0), &sink)
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.rate_limit_pauses, 0);
        assert_eq!(
            sink.statuses()[0],
            ("1".to_string(), DeliveryStatus::Error, Some("PEER_FLOOD".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn flood_wait_pauses_before_next_contact() {
        let client = FakeClient::default();
        client
            .fail_send
            .lock()
            .unwrap()
            .insert("1".to_string(), Fail::Flood(5));
        let (client, lp, _rx) = setup(client);
        let sink = Collect::default();
        let report = lp
            .start(csv_request("phone\n1\n2\n", "Hi", 0), &sink)
            .await
            .unwrap();

        assert_eq!(report.rate_limit_pauses, 1);
        let times = client.import_times();
        assert_eq!(times.len(), 2);
        assert_eq!(times[1].0, "2");
        assert!(times[1].1 - times[0].1 >= Duration::from_secs(6));
        assert_eq!(sink.statuses()[1].1, DeliveryStatus::Success);
        assert_eq!(sink.statuses()[0].1, DeliveryStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn flood_wait_and_regular_delay_stack() {
        let client = FakeClient::default();
        client
            .fail_send
            .lock()
            .unwrap()
            .insert("1".to_string(), Fail::Flood(2));
        let (client, lp, _rx) = setup(client);
        let sink = Collect::default();
        lp.start(csv_request("phone\n1\n2\n", "Hi", 1500), &sink)
            .await
            .unwrap();

        let times = client.import_times();
        assert!(times[1].1 - times[0].1 >= Duration::from_millis(4500));
    }

    #[tokio::test(start_paused = true)]
    async fn delay_is_not_applied_after_last_contact() {
        let (_client, lp, _rx) = setup(FakeClient::default());
        let sink = Collect::default();
        let started = Instant::now();
        lp.start(csv_request("phone\n1\n2\n", "Hi", 3000), &sink)
            .await
            .unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(3000));
        assert!(elapsed < Duration::from_millis(6000));
    }

    #[tokio::test]
    async fn stop_during_delivery_finishes_current_contact_only() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let client = FakeClient {
            gate: Some(("2".to_string(), entered.clone(), release.clone())),
            ..Default::default()
        };
        let (client, lp, _rx) = setup(client);
        let sink = Arc::new(Collect::default());

        let task = {
            let lp = lp.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                lp.start(csv_request("phone\n1\n2\n3\n", "Hi", 0), sink.as_ref())
                    .await
            })
        };

        entered.notified().await;
        assert!(lp.stop().await);
        assert_eq!(lp.state().await, LoopState::Stopping);
        release.notify_one();

        let report = task.await.unwrap().unwrap();
        assert!(report.stopped);
        assert_eq!(report.attempted, 2);
        let phones: Vec<_> = sink.statuses().into_iter().map(|s| s.0).collect();
        assert_eq!(phones, vec!["1".to_string(), "2".to_string()]);
        assert!(!client.calls().contains(&Call::Import("3".to_string())));
        assert!(!lp.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_pacing_ends_wait_and_skips_next_contact() {
        let (client, lp, _rx) = setup(FakeClient::default());
        let sink = Arc::new(Collect::default());
        let t0 = Instant::now();

        let task = {
            let lp = lp.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                lp.start(csv_request("phone\n1\n2\n", "Hi", 60_000), sink.as_ref())
                    .await
            })
        };

        sleep(Duration::from_secs(1)).await;
        assert_eq!(lp.state().await, LoopState::Running);
        assert!(lp.stop().await);

        let report = task.await.unwrap().unwrap();
        assert!(report.stopped);
        assert_eq!(report.attempted, 1);
        assert!(t0.elapsed() < Duration::from_secs(5), "waited {:?}", t0.elapsed());
        let imports: Vec<_> = client.import_times().into_iter().map(|(p, _)| p).collect();
        assert_eq!(imports, vec!["1".to_string()]);
        assert_eq!(lp.state().await, LoopState::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_flood_backoff_ends_wait_and_skips_next_contact() {
        let client = FakeClient {
            fail_send: StdMutex::new(HashMap::from([("1".to_string(), Fail::Flood(30))])),
            ..Default::default()
        };
        let (client, lp, _rx) = setup(client);
        let sink = Arc::new(Collect::default());
        let t0 = Instant::now();

        let task = {
            let lp = lp.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                lp.start(csv_request("phone\n1\n2\n", "Hi", 0), sink.as_ref())
                    .await
            })
        };

        sleep(Duration::from_secs(1)).await;
        assert!(lp.stop().await);

        let report = task.await.unwrap().unwrap();
        assert!(report.stopped);
        assert_eq!(report.rate_limit_pauses, 1);
        assert!(t0.elapsed() < Duration::from_secs(5), "waited {:?}", t0.elapsed());
        let imports: Vec<_> = client.import_times().into_iter().map(|(p, _)| p).collect();
        assert_eq!(imports, vec!["1".to_string()]);
        assert_eq!(sink.statuses()[0].1, DeliveryStatus::Error);
    }

    #[tokio::test]
    async fn second_start_while_running_is_rejected() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let client = FakeClient {
            gate: Some(("1".to_string(), entered.clone(), release.clone())),
            ..Default::default()
        };
        let (_client, lp, _rx) = setup(client);

        let task = {
            let lp = lp.clone();
            tokio::spawn(async move {
                lp.start(csv_request("phone\n1\n", "Hi", 0), &crate::ports::NullSink)
                    .await
            })
        };
        entered.notified().await;

        let second = lp
            .start(csv_request("phone\n9\n", "Hi", 0), &crate::ports::NullSink)
            .await;
        assert!(matches!(second, Err(Error::AlreadyRunning)));

        release.notify_one();
        task.await.unwrap().unwrap();
        assert_eq!(lp.state().await, LoopState::Finished);
    }

    #[tokio::test]
    async fn uploaded_default_is_reused_for_every_contact() {
        let (client, lp, _rx) = setup(FakeClient::default());
        let sink = Collect::default();
        let mut req = csv_request("phone\n1\n2\n", "Promo", 0);
        req.default_image = Some(ImageRef::blob(vec![0xff, 0xd8]));
        lp.start(req, &sink).await.unwrap();

        let calls = client.calls();
        assert_eq!(calls.iter().filter(|c| **c == Call::Upload).count(), 1);
        let handle = AssetRef::Uploaded(AssetHandle("H1".to_string()));
        assert!(calls.contains(&Call::File(1, handle.clone(), "Promo".to_string())));
        assert!(calls.contains(&Call::File(2, handle, "Promo".to_string())));
    }

    #[tokio::test]
    async fn failed_upload_falls_back_to_raw_image() {
        let client = FakeClient {
            fail_upload: true,
            ..Default::default()
        };
        let (client, lp, _rx) = setup(client);
        let sink = Collect::default();
        let blob = ImageRef::blob(vec![1, 2, 3]);
        let mut req = csv_request("phone\n1\n", "Promo", 0);
        req.default_image = Some(blob.clone());
        let report = lp.start(req, &sink).await.unwrap();

        assert_eq!(report.succeeded, 1);
        assert!(client
            .calls()
            .contains(&Call::File(1, AssetRef::Local(blob), "Promo".to_string())));
    }

    #[tokio::test]
    async fn unauthorized_client_is_rejected_before_any_send() {
        let client = FakeClient {
            unauthorized: true,
            ..Default::default()
        };
        let (client, lp, mut rx) = setup(client);
        let err = lp
            .start(csv_request("phone\n1\n", "Hi", 0), &crate::ports::NullSink)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotAuthorized));
        assert!(client.calls().is_empty());
        assert!(drain(&mut rx).contains(&Event::Status(Status::Finished)));
    }

    #[tokio::test]
    async fn bad_source_aborts_before_any_send() {
        let (client, lp, _rx) = setup(FakeClient::default());
        let err = lp
            .start(
                csv_request("phone\n\"1\n", "Hi", 0),
                &crate::ports::NullSink,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SourceFormat(_)));
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn sink_failures_are_counted_and_loop_continues() {
        let (_client, lp, mut rx) = setup(FakeClient::default());
        let sink = Collect {
            fail: true,
            ..Default::default()
        };
        let report = lp
            .start(csv_request("phone\n1\n2\n", "Hi", 0), &sink)
            .await
            .unwrap();
        assert_eq!(report.sink_failures, 2);
        assert_eq!(report.succeeded, 2);
        let logs = drain(&mut rx);
        assert!(logs.iter().any(|e| matches!(
            e,
            Event::Log(m) if m.starts_with("Could not record outcome for 1")
        )));
    }

    #[tokio::test]
    async fn correlation_ids_are_unique_within_a_run() {
        let (client, lp, _rx) = setup(FakeClient::default());
        lp.start(
            csv_request("phone\n1\n2\n3\n4\n", "Hi", 0),
            &crate::ports::NullSink,
        )
        .await
        .unwrap();
        let ids = client.correlation_ids.lock().unwrap().clone();
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }
}
