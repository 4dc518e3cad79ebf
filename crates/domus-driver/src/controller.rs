use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use flume::{Receiver, Sender};

use parking_lot::Mutex;

use reqwest::blocking::Client;

use serde::Deserialize;

use tracing::{debug, error, info};

use crate::config::DriverConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::event::EventSignal;
use crate::queue::{Method, Request};
use crate::transport::{Command, Inbound, Transport};
use crate::wait;

// Path of the controller home page, requested to obtain a session cookie.
const HOME_PATH: &str = "/";
const LOGIN_STATUS_PATH: &str = "/api/loginStatus";
const SETTINGS_INFO_PATH: &str = "/api/settings/info";
const REFRESH_STATES_PATH: &str = "/api/refreshStates";

fn transport_error(error: impl Into<Cow<'static, str>>) -> Error {
    Error::new(ErrorKind::Transport, error)
}

#[derive(Deserialize)]
struct LoginStatus {
    status: bool,
}

#[derive(Deserialize)]
struct RefreshMarker {
    last: Option<u64>,
}

// Responses waiting to be taken by the driver.
//
// The signal is set if and only if the inbox is not empty.
struct Inbox {
    responses: Mutex<VecDeque<Inbound>>,
    signal: Arc<EventSignal>,
}

impl Inbox {
    fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            signal: Arc::new(EventSignal::new("Controller")),
        }
    }

    fn push(&self, inbound: Inbound) {
        let mut responses = self.responses.lock();
        responses.push_back(inbound);
        self.signal.set();
    }

    fn pop(&self) -> Option<Inbound> {
        let mut responses = self.responses.lock();
        let inbound = responses.pop_front();
        if responses.is_empty() {
            self.signal.clear();
        }
        inbound
    }

    fn clear(&self) {
        let mut responses = self.responses.lock();
        responses.clear();
        self.signal.clear();
    }
}

enum Job {
    Send(Request),
    Exit,
}

// The state owned by the worker thread performing the HTTP requests.
struct Session {
    client: Client,
    base_url: String,
    username: String,
    password: String,
    last_refresh: Option<u64>,
    connected: Arc<EventSignal>,
    inbox: Arc<Inbox>,
    jobs: Sender<Job>,
}

impl Session {
    fn run(mut self, receiver: Receiver<Job>, stop: Arc<EventSignal>) {
        debug!("Entering the controller loop");

        while let Ok(job) = receiver.recv() {
            if stop.is_set() {
                break;
            }

            let request = match job {
                Job::Send(request) => request,
                Job::Exit => break,
            };

            if let Err(e) = self.perform(&request) {
                error!("Request `{} {}` failed: {e}", request.method(), request.path());
                self.inbox.push(Inbound::error(e.to_string()));
            }
        }

        debug!("Exiting the controller loop");
    }

    fn url(&self, request: &Request) -> String {
        match (request.path(), self.last_refresh) {
            (REFRESH_STATES_PATH, Some(last)) => {
                format!("{}{REFRESH_STATES_PATH}?last={last}&lang=en", self.base_url)
            }
            (path, _) => format!("{}{path}", self.base_url),
        }
    }

    fn perform(&mut self, request: &Request) -> Result<()> {
        let url = self.url(request);
        debug!("Sending `{} {url}`", request.method());

        let method = match request.method() {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
        };

        let mut builder = self
            .client
            .request(method, &url)
            .basic_auth(&self.username, Some(&self.password));
        if let Some(params) = request.params() {
            builder = builder.body(params.to_owned());
        }

        let body = builder.send()?.error_for_status()?.text()?;

        match Command::from_path(request.path()) {
            Command::LoginStatus => self.login_status(&body),
            Command::RefreshStates => {
                self.last_refresh = serde_json::from_str::<RefreshMarker>(&body)
                    .ok()
                    .and_then(|marker| marker.last)
                    .or(self.last_refresh);
                self.inbox.push(Inbound::new(request.path(), body));
                self.enqueue(Request::get(REFRESH_STATES_PATH));
                Ok(())
            }
            Command::Unknown(_) if !request.path().starts_with("/api/") => Ok(()),
            _ => {
                self.inbox.push(Inbound::new(request.path(), body));
                Ok(())
            }
        }
    }

    fn login_status(&self, body: &str) -> Result<()> {
        let login: LoginStatus = serde_json::from_str(body)?;
        if login.status {
            info!("Controller login succeeded");
            self.connected.set();
        } else {
            debug!("Controller login pending, requesting the home page again");
            self.enqueue(Request::get(HOME_PATH));
            self.enqueue(Request::get(LOGIN_STATUS_PATH));
        }
        Ok(())
    }

    fn enqueue(&self, request: Request) {
        // The receiver lives as long as this session.
        let _ = self.jobs.send(Job::Send(request));
    }
}

struct Worker {
    jobs: Sender<Job>,
    stop: Arc<EventSignal>,
    handle: JoinHandle<()>,
}

/// A [`Transport`] for a Fibaro Home Center 2 controller reachable on the
/// local network.
///
/// Requests are performed one at a time by a background worker thread,
/// which keeps the session cookies and authenticates every request. Once
/// the first `/api/refreshStates` response has been received, the worker
/// keeps long-polling the controller for state changes.
pub struct Hc2Controller {
    config: DriverConfig,
    inbox: Arc<Inbox>,
    worker: Option<Worker>,
}

impl std::fmt::Debug for Hc2Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hc2Controller")
            .field("base_url", &self.config.base_url())
            .field("running", &self.worker.is_some())
            .finish_non_exhaustive()
    }
}

impl Hc2Controller {
    /// Creates a closed [`Hc2Controller`].
    #[must_use]
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            inbox: Arc::new(Inbox::new()),
            worker: None,
        }
    }

    fn schedule(&self, request: Request) -> Result<()> {
        let worker = self
            .worker
            .as_ref()
            .ok_or_else(|| transport_error("The controller session is not open"))?;
        worker
            .jobs
            .send(Job::Send(request))
            .map_err(|_| transport_error("The controller worker has stopped"))
    }

    fn spawn_worker(&mut self, connected: Arc<EventSignal>) -> Result<()> {
        let client = Client::builder()
            .cookie_store(true)
            .no_proxy()
            .timeout(self.config.request_timeout_duration())
            .build()?;

        let (jobs, receiver) = flume::unbounded();
        let stop = Arc::new(EventSignal::new("Controller Stop"));

        let session = Session {
            client,
            base_url: self.config.base_url(),
            username: self.config.username().into(),
            password: self.config.password().into(),
            last_refresh: None,
            connected,
            inbox: Arc::clone(&self.inbox),
            jobs: jobs.clone(),
        };

        let handle = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("hc2-{}", self.config.network_id()))
                .spawn(move || session.run(receiver, stop))
                .map_err(|e| transport_error(format!("Cannot spawn the controller worker: {e}")))?
        };

        self.worker = Some(Worker { jobs, stop, handle });
        Ok(())
    }
}

impl Transport for Hc2Controller {
    fn open(&mut self, network_id: &str) -> Result<()> {
        info!("Opening the controller session for `{network_id}`");

        self.close();

        let connected = Arc::new(EventSignal::new("Connected"));
        self.spawn_worker(Arc::clone(&connected))?;

        self.schedule(Request::get(HOME_PATH))?;
        self.schedule(Request::get(LOGIN_STATUS_PATH))?;

        if !wait::single(&connected, Some(self.config.open_timeout_duration())) {
            self.close();
            return Err(Error::new(
                ErrorKind::Initialization,
                format!("The login to `{}` has timed out", self.config.base_url()),
            ));
        }

        self.schedule(Request::get(SETTINGS_INFO_PATH))
    }

    fn send(&mut self, request: &Request) -> Result<()> {
        self.schedule(request.clone())
    }

    fn receive(&mut self) -> Option<Inbound> {
        self.inbox.pop()
    }

    fn data_signal(&self) -> Arc<EventSignal> {
        Arc::clone(&self.inbox.signal)
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            debug!("Closing the controller session");
            worker.stop.set();
            let _ = worker.jobs.send(Job::Exit);
            if worker.handle.join().is_err() {
                error!("The controller worker has panicked");
            }
        }
        self.inbox.clear();
    }
}

impl Drop for Hc2Controller {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::config::DriverConfig;
    use crate::error::ErrorKind;
    use crate::queue::Request;
    use crate::transport::{Command, Inbound, Transport};

    use super::{Hc2Controller, Inbox};

    #[test]
    fn inbox_signal_follows_contents() {
        let inbox = Inbox::new();
        assert!(!inbox.signal.is_set());

        inbox.push(Inbound::new("/api/rooms", "[]"));
        inbox.push(Inbound::error("Connection refused"));
        assert!(inbox.signal.is_set());

        assert_eq!(inbox.pop().unwrap().command, Command::Rooms);
        assert!(inbox.signal.is_set());
        assert_eq!(inbox.pop().unwrap().command, Command::Error);
        assert!(!inbox.signal.is_set());
        assert!(inbox.pop().is_none());
    }

    #[test]
    fn send_without_session() {
        let mut controller = Hc2Controller::new(DriverConfig::new("HC2-000001", "127.0.0.1"));
        let error = controller.send(&Request::get("/api/devices")).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Transport);
        assert!(controller.receive().is_none());
    }

    #[test]
    fn open_unreachable_controller() {
        // Nothing listens on port 9 of the loopback interface.
        let config = DriverConfig::new("HC2-000001", "127.0.0.1")
            .port(9)
            .request_timeout(Duration::from_secs(1))
            .open_timeout(Duration::from_secs(1));
        let mut controller = Hc2Controller::new(config);

        let error = controller.open("HC2-000001").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Initialization);

        // The worker is stopped and every failure report discarded.
        assert!(controller.receive().is_none());
        assert!(!controller.data_signal().is_set());
    }
}
