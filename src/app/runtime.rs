use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::adapters::channel::RequestResponseChannel;
use crate::adapters::db::{open_connection, run_migrations};
use crate::adapters::keba_debug_file::ScriptedTransport;
use crate::adapters::keba_udp::{Transport, TransportError, UdpTransport, resolve_peer};
use crate::adapters::notifier::{
    DisabledNotifier, HttpLivenessNotifier, LivenessNotifier, NotifierError,
};
use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::probe::{ProbeError, ProbeOutcome, ProbeSequencer};
use crate::app::services::{SqliteWallboxStore, WallboxStore};
use crate::domain::polling::{PollIntervals, ProbeSignal, PushNotice};
use crate::domain::session_time::Clock;

#[derive(Debug, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// What one scheduler iteration did.
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    Probed(ProbeOutcome),
    Push(PushNotice),
    Quiet,
}

/// Decides between a full probe and a passive wait for pushed datagrams.
pub struct PollingScheduler<T, S, C, N> {
    sequencer: ProbeSequencer<T, S, C>,
    notifier: N,
    intervals: PollIntervals,
    probe_signal: ProbeSignal,
    last_probe: Option<Instant>,
}

impl<T, S, C, N> PollingScheduler<T, S, C, N>
where
    T: Transport,
    S: WallboxStore,
    C: Clock,
    N: LivenessNotifier,
{
    /// The first iteration always probes.
    pub fn new(
        mut sequencer: ProbeSequencer<T, S, C>,
        notifier: N,
        intervals: PollIntervals,
    ) -> Self {
        let probe_signal = ProbeSignal::raised();
        sequencer.channel_mut().set_probe_signal(probe_signal.clone());

        Self {
            sequencer,
            notifier,
            intervals,
            probe_signal,
            last_probe: None,
        }
    }

    pub fn sequencer(&self) -> &ProbeSequencer<T, S, C> {
        &self.sequencer
    }

    pub fn probe_signal(&self) -> &ProbeSignal {
        &self.probe_signal
    }

    pub fn listen_timeout(&self) -> Duration {
        self.intervals.effective(self.sequencer.last_state())
    }

    pub fn tick(&mut self) -> Result<Tick, ProbeError> {
        let forced = self.probe_signal.take();
        if forced || self.probe_due() {
            return self.probe();
        }

        let timeout = self.listen_timeout();
        let payload = match self.sequencer.channel_mut().listen(timeout) {
            Ok(payload) => payload,
            Err(error) => {
                self.probe_signal.raise();
                return Err(error.into());
            }
        };

        let Some(payload) = payload else {
            tracing::debug!(timeout_s = timeout.as_secs(), "no push received, forcing probe");
            self.probe_signal.raise();
            return Ok(Tick::Quiet);
        };

        let notice = PushNotice::classify(&payload);
        if notice.requires_probe() {
            tracing::info!(
                push = %String::from_utf8_lossy(&payload),
                ?notice,
                "push requires a full probe"
            );
            self.probe_signal.raise();
        } else {
            tracing::trace!(push = %String::from_utf8_lossy(&payload), "energy progress push");
        }

        Ok(Tick::Push(notice))
    }

    fn probe_due(&self) -> bool {
        let interval = self.listen_timeout();
        self.last_probe
            .is_none_or(|last_probe| last_probe.elapsed() >= interval)
    }

    fn probe(&mut self) -> Result<Tick, ProbeError> {
        let outcome = match self.sequencer.probe() {
            Ok(outcome) => outcome,
            Err(error) => {
                self.probe_signal.raise();
                return Err(error);
            }
        };

        self.last_probe = Some(Instant::now());
        tracing::info!(
            state = outcome.state.as_str(),
            new_sessions = outcome.new_sessions.len(),
            "probe completed"
        );

        if let Err(error) = self.notifier.notify() {
            tracing::warn!(error = %error, "liveness notification failed");
        }

        Ok(Tick::Probed(outcome))
    }
}

pub fn start_scheduler<T, S, C, N>(
    mut scheduler: PollingScheduler<T, S, C, N>,
    stop_flag: Arc<AtomicBool>,
    error_delay: Duration,
) -> JoinHandle<()>
where
    T: Transport + Send + 'static,
    S: WallboxStore + Send + 'static,
    C: Clock + Send + 'static,
    N: LivenessNotifier + Send + 'static,
{
    std::thread::spawn(move || {
        while !stop_flag.load(Ordering::SeqCst) {
            if let Err(error) = scheduler.tick() {
                tracing::warn!(error = %error, "scheduler iteration failed");
                std::thread::sleep(error_delay);
            }
        }
    })
}

pub fn run(config: AppConfig) -> Result<(), AppError> {
    let mut connection = open_connection(&config.db_path).map_err(AppError::database_init)?;
    run_migrations(&mut connection).map_err(AppError::database_init)?;
    let store = SqliteWallboxStore::new(Arc::new(Mutex::new(connection)));

    let transport = build_transport(&config).map_err(AppError::runtime)?;
    let notifier = build_notifier(&config).map_err(AppError::runtime)?;
    let channel = RequestResponseChannel::new(transport, config.channel_options());
    let sequencer = ProbeSequencer::new(channel, store, SystemClock);
    let scheduler = PollingScheduler::new(sequencer, notifier, config.poll_intervals());

    let stop_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&stop_flag);
    ctrlc::set_handler(move || {
        tracing::info!("shutdown requested, stopping after current iteration");
        handler_flag.store(true, Ordering::SeqCst);
    })
    .map_err(AppError::runtime)?;

    let scheduler_handle = start_scheduler(
        scheduler,
        Arc::clone(&stop_flag),
        Duration::from_millis(config.error_retry_delay_ms),
    );

    if scheduler_handle.join().is_err() {
        return Err(AppError::runtime("scheduler thread panicked"));
    }

    tracing::info!("scheduler stopped");
    Ok(())
}

fn build_transport(config: &AppConfig) -> Result<Box<dyn Transport + Send>, TransportError> {
    match &config.debug_script {
        Some(path) => {
            let peer = resolve_peer(&config.keba_ip, config.keba_udp_port)?;
            tracing::warn!(script = %path, "replaying scripted datagrams instead of UDP");
            Ok(Box::new(ScriptedTransport::from_file(path, peer)?))
        }
        None => Ok(Box::new(UdpTransport::for_device(
            &config.keba_ip,
            config.keba_udp_port,
        )?)),
    }
}

fn build_notifier(config: &AppConfig) -> Result<Box<dyn LivenessNotifier + Send>, NotifierError> {
    match &config.heartbeat_url {
        Some(url) => Ok(Box::new(HttpLivenessNotifier::new(
            url.clone(),
            Duration::from_millis(config.heartbeat_timeout_ms),
        )?)),
        None => Ok(Box::new(DisabledNotifier)),
    }
}
