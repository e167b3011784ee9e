//! The orchestrator: one actor task that owns every piece of mutable VM state.
//!
//! ```text
//! Orchestrator (handle, Clone)
//!     │  Command + oneshot reply
//!     ▼
//! mpsc ──► Actor ──► spawned work (acquire, install, start, stop)
//!     ▲       │              │
//!     │       │              └─► Event (progress, *Finished) ──┐
//!     │       ├─► watch<LifecycleState>      current state      │
//!     │       ├─► broadcast<LifecycleState>  every transition   │
//!     │       └─► LogStream                                     │
//!     └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Commands and notifications share one channel and are handled strictly in
//! arrival order. The actor never awaits engine work itself; it only records
//! that the work started and applies the outcome when it comes back. Spawned
//! work reaches the actor through a weak sender, so dropping every
//! [`Orchestrator`] handle ends the actor.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::engine::{EngineError, Hypervisor, InstanceEvent, InstanceEvents, Started};
use crate::log_stream::LogStream;
use crate::vm::bundle::BundleLocation;
use crate::vm::catalog::ImageCatalog;
use crate::vm::configuration::ConfigurationBuilder;
use crate::vm::download::Transport;
use crate::vm::error::{VmError, VmResult};
use crate::vm::image::ImageAcquirer;
use crate::vm::installer::Installer;
use crate::vm::lifecycle::LifecycleController;
use crate::vm::progress::{ProgressReporter, ProgressSender, ProgressStream, ProgressUpdate};
use crate::vm::requirements;
use crate::vm::{InstallationImage, LifecycleState, Policy, StatusReport};

const TRANSITION_CAPACITY: usize = 64;

/// External capabilities the orchestrator drives.
#[derive(Clone)]
pub struct Services {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub catalog: Arc<dyn ImageCatalog>,
    pub transport: Arc<dyn Transport>,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

type Reply<T> = oneshot::Sender<VmResult<T>>;

enum Message {
    Command(Command),
    Event(Event),
    Shutdown(oneshot::Sender<()>),
}

enum Command {
    CheckStatus(Reply<StatusReport>),
    AcquireImage(Reply<ProgressStream<InstallationImage>>),
    ImportImage(PathBuf, Reply<InstallationImage>),
    Install(Reply<ProgressStream<()>>),
    Start(Reply<()>),
    Stop(Reply<()>),
}

enum StartFailure {
    /// Requirements or configuration failed; the engine never ran.
    Preparation(VmError),
    Engine(EngineError),
}

enum Event {
    AcquireFinished {
        result: VmResult<InstallationImage>,
        stream: ProgressSender<InstallationImage>,
    },
    ImportFinished {
        result: VmResult<InstallationImage>,
        reply: Reply<InstallationImage>,
    },
    InstallProgress(f64),
    InstallFinished {
        result: VmResult<()>,
        stream: ProgressSender<()>,
    },
    StartFinished {
        generation: u64,
        outcome: Result<Started, StartFailure>,
        reply: Reply<()>,
    },
    StopFinished {
        generation: u64,
        result: Result<(), EngineError>,
        reply: Reply<()>,
    },
    Instance {
        generation: u64,
        event: InstanceEvent,
    },
}

/// Hand `event` to the actor. Returns it if the actor is gone.
fn deliver(events: &mpsc::WeakUnboundedSender<Message>, event: Event) -> Option<Event> {
    let Some(tx) = events.upgrade() else {
        return Some(event);
    };
    match tx.send(Message::Event(event)) {
        Ok(()) => None,
        Err(mpsc::error::SendError(Message::Event(event))) => Some(event),
        Err(_) => None,
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable handle to the orchestrator actor for one bundle.
#[derive(Clone)]
pub struct Orchestrator {
    tx: mpsc::UnboundedSender<Message>,
    state: watch::Receiver<LifecycleState>,
    transitions: broadcast::Sender<LifecycleState>,
    logs: LogStream,
    location: BundleLocation,
}

impl Orchestrator {
    /// Spawn the actor for the bundle at `root`. Must be called inside a
    /// tokio runtime. The bundle directory is created on first use.
    pub fn spawn(root: impl Into<PathBuf>, policy: Policy, services: Services) -> Self {
        let location = BundleLocation::at(root);
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LifecycleState::Unconfigured);
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        let logs = LogStream::new();

        let actor = Actor {
            root: location.root.clone(),
            location: None,
            acquirer: ImageAcquirer::new(
                Arc::clone(&services.catalog),
                Arc::clone(&services.transport),
                Arc::clone(&services.hypervisor),
            ),
            builder: ConfigurationBuilder::new(Arc::clone(&services.hypervisor), policy.clone()),
            installer: Installer::new(Arc::clone(&services.hypervisor), policy.clone()),
            hypervisor: services.hypervisor,
            policy,
            lifecycle: LifecycleController::new(),
            installing: None,
            acquiring: false,
            state_tx,
            transitions: transitions.clone(),
            logs: logs.clone(),
            events: tx.downgrade(),
        };
        tokio::spawn(actor.run(rx));

        Self {
            tx,
            state: state_rx,
            transitions,
            logs,
            location,
        }
    }

    /// Resolve the bundle and report what it holds.
    pub async fn check_status(&self) -> VmResult<StatusReport> {
        self.request(Command::CheckStatus).await
    }

    /// Make sure the bundle has a restore image, downloading the newest
    /// supported one if needed.
    pub async fn acquire_image(&self) -> VmResult<ProgressStream<InstallationImage>> {
        self.request(Command::AcquireImage).await
    }

    /// Copy a local restore image into the bundle.
    pub async fn import_image(&self, source: impl Into<PathBuf>) -> VmResult<InstallationImage> {
        let source = source.into();
        self.request(|reply| Command::ImportImage(source, reply))
            .await
    }

    /// Install the guest from the bundle's image.
    pub async fn install(&self) -> VmResult<ProgressStream<()>> {
        self.request(Command::Install).await
    }

    /// Boot the installed guest. Resolves once it is running.
    pub async fn start(&self) -> VmResult<()> {
        self.request(Command::Start).await
    }

    /// Stop the running guest. Resolves once it has stopped.
    pub async fn stop(&self) -> VmResult<()> {
        self.request(Command::Stop).await
    }

    /// Stop a running guest and end the actor. Later commands fail with
    /// [`VmError::Shutdown`].
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Message::Shutdown(reply)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state.borrow().clone()
    }

    /// Latest-value view of the state.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.clone()
    }

    /// Every published transition, in order.
    pub fn transitions(&self) -> broadcast::Receiver<LifecycleState> {
        self.transitions.subscribe()
    }

    pub fn logs(&self) -> &LogStream {
        &self.logs
    }

    pub fn location(&self) -> &BundleLocation {
        &self.location
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> VmResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::Command(command(reply)))
            .map_err(|_| VmError::Shutdown)?;
        rx.await.map_err(|_| VmError::Shutdown)?
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct Actor {
    root: PathBuf,
    location: Option<BundleLocation>,
    policy: Policy,
    hypervisor: Arc<dyn Hypervisor>,
    acquirer: ImageAcquirer,
    builder: ConfigurationBuilder,
    installer: Installer,
    lifecycle: LifecycleController,
    /// Progress of the running installation, if any.
    installing: Option<f64>,
    /// An acquisition or import is running.
    acquiring: bool,
    state_tx: watch::Sender<LifecycleState>,
    transitions: broadcast::Sender<LifecycleState>,
    logs: LogStream,
    events: mpsc::WeakUnboundedSender<Message>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        debug!(root = %self.root.display(), "orchestrator started");
        while let Some(message) = rx.recv().await {
            match message {
                Message::Command(command) => self.handle_command(command),
                Message::Event(event) => self.handle_event(event),
                Message::Shutdown(reply) => {
                    self.shut_down().await;
                    let _ = reply.send(());
                    return;
                }
            }
        }
        // Every handle is gone.
        self.shut_down().await;
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::CheckStatus(reply) => {
                let result = self.check_status();
                self.respond("Status check", reply, result);
            }
            Command::AcquireImage(reply) => {
                let result = self.acquire_image();
                self.respond("Image acquisition", reply, result);
            }
            Command::ImportImage(source, reply) => self.import_image(source, reply),
            Command::Install(reply) => {
                let result = self.install();
                self.respond("Install", reply, result);
            }
            Command::Start(reply) => self.start(reply),
            Command::Stop(reply) => self.stop(reply),
        }
    }

    /// Reply to a command that finished or failed synchronously.
    fn respond<T>(&self, command: &str, reply: Reply<T>, result: VmResult<T>) {
        match result {
            Ok(value) => {
                let _ = reply.send(Ok(value));
            }
            Err(e) => self.reject(command, reply, e),
        }
    }

    /// Refuse a command before any work started.
    fn reject<T>(&self, command: &str, reply: Reply<T>, error: VmError) {
        self.logs.error(format!("{command} rejected: {error}"));
        let _ = reply.send(Err(error));
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::AcquireFinished { result, stream } => {
                self.acquiring = false;
                match &result {
                    Ok(image) => self.logs.info(format!("Restore image ready: {image}")),
                    Err(e) => self.logs.error(format!("Failed to acquire restore image: {e}")),
                }
                self.publish();
                let _ = stream.send(ProgressUpdate::Finished(result));
            }
            Event::ImportFinished { result, reply } => {
                self.acquiring = false;
                match &result {
                    Ok(image) => self.logs.info(format!("Imported restore image: {image}")),
                    Err(e) => self.logs.error(format!("Failed to import restore image: {e}")),
                }
                self.publish();
                let _ = reply.send(result);
            }
            Event::InstallProgress(fraction) => {
                if self.installing.is_some() {
                    self.installing = Some(fraction);
                    self.publish();
                }
            }
            Event::InstallFinished { result, stream } => {
                self.installing = None;
                match &result {
                    Ok(()) => self.logs.info("Installation complete"),
                    Err(e) => self.logs.error(format!("Installation failed: {e}")),
                }
                self.publish();
                let _ = stream.send(ProgressUpdate::Finished(result));
            }
            Event::StartFinished {
                generation,
                outcome,
                reply,
            } => self.start_finished(generation, outcome, reply),
            Event::StopFinished {
                generation,
                result,
                reply,
            } => {
                let result = self.lifecycle.stop_finished(generation, result);
                match &result {
                    Ok(()) => self.logs.info("VM stopped"),
                    Err(e) => self.logs.error(format!("Failed to stop VM: {e}")),
                }
                self.publish();
                let _ = reply.send(result);
            }
            Event::Instance { generation, event } => {
                if self.lifecycle.instance_event(generation, event.clone()) {
                    match event {
                        InstanceEvent::GuestStopped => self.logs.info("Guest shut down"),
                        InstanceEvent::StoppedWithError(reason) => {
                            self.logs.error(format!("VM stopped with error: {reason}"))
                        }
                    }
                    self.publish();
                }
            }
        }
    }

    // --- Commands ---

    fn check_status(&mut self) -> VmResult<StatusReport> {
        let location = self.location()?;
        let status = location.status(&self.policy);
        self.publish();
        Ok(StatusReport {
            has_image: status.has_image,
            is_installed: status.is_installed,
            state: self.derive_state(),
        })
    }

    fn acquire_image(&mut self) -> VmResult<ProgressStream<InstallationImage>> {
        if self.acquiring {
            return Err(VmError::AlreadyInProgress);
        }
        let location = self.location()?;
        self.acquiring = true;
        self.logs.info("Acquiring restore image...");

        let (stream_tx, stream) = ProgressStream::channel();
        let acquirer = self.acquirer.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let progress_tx = stream_tx.clone();
            let mut reporter = ProgressReporter::new(move |fraction| {
                let _ = progress_tx.send(ProgressUpdate::Progress(fraction));
            });
            let result = acquirer.ensure_acquired(&location, &mut reporter).await;
            deliver(
                &events,
                Event::AcquireFinished {
                    result,
                    stream: stream_tx,
                },
            );
        });
        Ok(stream)
    }

    fn import_image(&mut self, source: PathBuf, reply: Reply<InstallationImage>) {
        let location = match self.begin_import() {
            Ok(location) => location,
            Err(e) => return self.reject("Image import", reply, e),
        };
        self.acquiring = true;
        self.logs
            .info(format!("Importing restore image from {}...", source.display()));

        let acquirer = self.acquirer.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = acquirer.import(&location, &source).await;
            deliver(&events, Event::ImportFinished { result, reply });
        });
    }

    fn begin_import(&mut self) -> VmResult<BundleLocation> {
        if self.acquiring {
            return Err(VmError::AlreadyInProgress);
        }
        self.location()
    }

    fn install(&mut self) -> VmResult<ProgressStream<()>> {
        if self.installing.is_some() || self.installer.is_active() {
            return Err(VmError::AlreadyInProgress);
        }
        if self.lifecycle.is_live() {
            return Err(VmError::invalid_transition("install", self.derive_state()));
        }
        let location = self.location()?;
        let status = location.status(&self.policy);
        if status.is_installed {
            self.logs.info("VM already installed");
            return Ok(ProgressStream::finished(Ok(())));
        }
        if !status.has_image {
            return Err(VmError::invalid_transition("install", self.derive_state()));
        }

        self.installing = Some(0.0);
        self.logs.info("Installing macOS...");
        self.publish();

        let (stream_tx, stream) = ProgressStream::channel();
        let hypervisor = Arc::clone(&self.hypervisor);
        let builder = self.builder.clone();
        let installer = self.installer.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let progress_tx = stream_tx.clone();
            let progress_events = events.clone();
            let reporter = ProgressReporter::new(move |fraction| {
                let _ = progress_tx.send(ProgressUpdate::Progress(fraction));
                deliver(&progress_events, Event::InstallProgress(fraction));
            });

            let result: VmResult<()> = async {
                let requirements = requirements::resolve(hypervisor.as_ref(), &location.image).await?;
                let config = builder.build_blocking(&location, &requirements).await?;
                installer
                    .install(&location, &config, &location.image, reporter)
                    .await
            }
            .await;

            deliver(
                &events,
                Event::InstallFinished {
                    result,
                    stream: stream_tx,
                },
            );
        });
        Ok(stream)
    }

    fn start(&mut self, reply: Reply<()>) {
        let (generation, location) = match self.begin_start() {
            Ok(started) => started,
            Err(e) => return self.reject("Start", reply, e),
        };
        self.logs.info("Starting VM...");
        self.publish();

        let hypervisor = Arc::clone(&self.hypervisor);
        let builder = self.builder.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let outcome = prepare_and_start(hypervisor.as_ref(), &builder, &location).await;
            let undelivered = deliver(
                &events,
                Event::StartFinished {
                    generation,
                    outcome,
                    reply,
                },
            );
            // Nobody is left to own the instance.
            if let Some(Event::StartFinished {
                outcome: Ok(started),
                ..
            }) = undelivered
            {
                let _ = started.instance.stop().await;
            }
        });
    }

    fn begin_start(&mut self) -> VmResult<(u64, BundleLocation)> {
        if self.installing.is_some() {
            return Err(VmError::invalid_transition("start", self.derive_state()));
        }
        let location = self.location()?;
        if !location.status(&self.policy).is_installed {
            return Err(VmError::invalid_transition("start", self.derive_state()));
        }
        let generation = self.lifecycle.begin_start()?;
        Ok((generation, location))
    }

    fn start_finished(
        &mut self,
        generation: u64,
        outcome: Result<Started, StartFailure>,
        reply: Reply<()>,
    ) {
        let result = match outcome {
            Ok(Started { instance, events }) => {
                if self.lifecycle.start_succeeded(generation, Arc::clone(&instance)) {
                    self.forward_instance_events(generation, events);
                    self.logs.info("VM started");
                    Ok(())
                } else {
                    self.logs.warn("Discarding a VM whose start was superseded");
                    tokio::spawn(async move {
                        let _ = instance.stop().await;
                    });
                    Err(VmError::Instance("start was superseded".into()))
                }
            }
            Err(StartFailure::Preparation(e)) => {
                self.lifecycle.start_aborted(generation);
                self.logs.error(format!("Failed to start VM: {e}"));
                Err(e)
            }
            Err(StartFailure::Engine(e)) => {
                let reason = e.to_string();
                self.lifecycle.start_failed(generation, reason.clone());
                self.logs.error(format!("Failed to start VM: {reason}"));
                Err(VmError::Instance(reason))
            }
        };
        self.publish();
        let _ = reply.send(result);
    }

    fn stop(&mut self, reply: Reply<()>) {
        let (generation, instance) = match self.lifecycle.begin_stop() {
            Ok(pair) => pair,
            Err(e) => return self.reject("Stop", reply, e),
        };
        self.logs.info("Stopping VM...");
        self.publish();

        let events = self.events.clone();
        tokio::spawn(async move {
            let result = instance.stop().await;
            deliver(
                &events,
                Event::StopFinished {
                    generation,
                    result,
                    reply,
                },
            );
        });
    }

    async fn shut_down(&mut self) {
        if let Ok((generation, instance)) = self.lifecycle.begin_stop() {
            self.logs.warn("Stopping VM before exit...");
            let result = instance.stop().await;
            if let Err(e) = self.lifecycle.stop_finished(generation, result) {
                self.logs.error(format!("Failed to stop VM: {e}"));
            }
            self.publish();
        }
        info!(root = %self.root.display(), "orchestrator shut down");
    }

    // --- Helpers ---

    /// Resolve the bundle on first use.
    fn location(&mut self) -> VmResult<BundleLocation> {
        if let Some(location) = &self.location {
            return Ok(location.clone());
        }
        let location = BundleLocation::resolve(&self.root)?;
        let root = location.root.clone();
        tokio::spawn(async move { crate::paths::exclude_from_backups(&root).await });
        self.location = Some(location.clone());
        Ok(location)
    }

    fn forward_instance_events(&self, generation: u64, mut events: InstanceEvents) {
        let sink = self.events.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if deliver(&sink, Event::Instance { generation, event }).is_some() {
                    return;
                }
            }
        });
    }

    /// The single published state.
    fn derive_state(&self) -> LifecycleState {
        if let Some(fraction) = self.installing {
            return LifecycleState::Installing(fraction);
        }
        let lifecycle = self.lifecycle.state();
        if lifecycle != LifecycleState::Stopped || self.lifecycle.has_run() {
            return lifecycle;
        }
        match &self.location {
            None => LifecycleState::Unconfigured,
            Some(location) => {
                let status = location.status(&self.policy);
                if status.is_installed {
                    LifecycleState::Installed
                } else if status.has_image {
                    LifecycleState::ImagePresent
                } else {
                    LifecycleState::ImageMissing
                }
            }
        }
    }

    fn publish(&self) {
        let state = self.derive_state();
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        });
        if changed {
            debug!(%state, "state published");
            let _ = self.transitions.send(state);
        }
    }
}

async fn prepare_and_start(
    hypervisor: &dyn Hypervisor,
    builder: &ConfigurationBuilder,
    location: &BundleLocation,
) -> Result<Started, StartFailure> {
    let requirements = requirements::resolve(hypervisor, &location.image)
        .await
        .map_err(StartFailure::Preparation)?;
    let config = builder
        .build_blocking(location, &requirements)
        .await
        .map_err(StartFailure::Preparation)?;
    hypervisor.start(&config).await.map_err(|e| {
        warn!(error = %e, "engine failed to start the VM");
        StartFailure::Engine(e)
    })
}
