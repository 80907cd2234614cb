use crate::config::ServerConfig;
use crate::coordinator::{Coordinator, CoordinatorError};
use crate::error::{exit_code, BookieError};
use crate::retry::RetryPolicy;
use crate::telemetry::{
    SharedMetricsRegistry, STATUS_READ_ONLY, STATUS_UNREGISTERED, STATUS_WRITABLE,
};
use log::{error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Availability mode of the bookie. `ShuttingDown` is tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookieMode {
    Writable,
    ReadOnly,
}

/// Atomic mode flags shared between the bookie and its state service.
#[derive(Debug, Default)]
pub struct ModeFlags {
    read_only: AtomicBool,
    shutting_down: AtomicBool,
    registered: AtomicBool,
    running: AtomicBool,
}

impl ModeFlags {
    pub fn mode(&self) -> BookieMode {
        if self.read_only.load(Ordering::SeqCst) {
            BookieMode::ReadOnly
        } else {
            BookieMode::Writable
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn set_shutting_down(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::SeqCst);
    }

    /// CAS into read-only; false when already read-only.
    fn enter_read_only(&self) -> bool {
        self.read_only
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// CAS into writable; false when already writable.
    fn enter_writable(&self) -> bool {
        self.read_only
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn status_gauge(&self) -> i64 {
        if !self.is_registered() {
            STATUS_UNREGISTERED
        } else if self.is_read_only() {
            STATUS_READ_ONLY
        } else {
            STATUS_WRITABLE
        }
    }
}

/// Commands processed by the single-threaded state service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateCommand {
    TransitionWritable,
    TransitionReadOnly,
    Reregister,
    Stop,
}

/// Everything a mode transition needs, shared with the service thread.
pub struct StateDriver {
    pub config: Arc<ServerConfig>,
    pub coordinator: Arc<dyn Coordinator>,
    pub flags: Arc<ModeFlags>,
    pub metrics: SharedMetricsRegistry,
    pub shutdown_tx: Sender<i32>,
    pub stop_retries: Arc<AtomicBool>,
}

impl StateDriver {
    fn registration_path(&self, mode: BookieMode) -> String {
        let bookie_id = self.config.bookie_id();
        match mode {
            BookieMode::Writable => format!("{}/{}", self.config.available_path(), bookie_id),
            BookieMode::ReadOnly => format!("{}/{}", self.config.readonly_path(), bookie_id),
        }
    }

    fn publish_status(&self) {
        self.metrics
            .set_gauge("bookie.server_status", self.flags.status_gauge());
    }

    /// Waits out a stale ephemeral node left by a previous session, then
    /// creates our own registration node.
    fn register_at(&self, path: &str) -> Result<(), BookieError> {
        self.flags.set_registered(false);
        self.publish_status();
        if self.coordinator.exists(path)? {
            if self.coordinator.owns_ephemeral(path)? {
                self.flags.set_registered(true);
                self.publish_status();
                return Ok(());
            }
            let timeout = Duration::from_millis(self.config.session_timeout_ms);
            info!(
                "event=stale_registration_node path={path} waiting_ms={}",
                timeout.as_millis()
            );
            if !self.coordinator.await_removal(path, timeout)? {
                return Err(BookieError::Coordinator(CoordinatorError::NodeExists {
                    path: path.to_string(),
                }));
            }
        }
        self.coordinator.create_ephemeral(path)?;
        self.flags.set_registered(true);
        self.publish_status();
        info!("event=bookie_registered path={path}");
        Ok(())
    }

    /// Registers under the path matching the current mode.
    pub fn register_current_mode(&self) -> Result<(), BookieError> {
        let mode = self.flags.mode();
        if mode == BookieMode::ReadOnly {
            self.ensure_readonly_parent()?;
        }
        self.register_at(&self.registration_path(mode))
    }

    fn ensure_readonly_parent(&self) -> Result<(), BookieError> {
        match self
            .coordinator
            .create_persistent(&self.config.readonly_path(), &[])
        {
            Ok(()) | Err(CoordinatorError::NodeExists { .. }) => Ok(()),
            Err(err) => Err(BookieError::Coordinator(err)),
        }
    }

    fn delete_quietly(&self, path: &str) {
        match self.coordinator.delete_node(path) {
            Ok(()) => {}
            Err(CoordinatorError::NoNode { .. }) => {
                warn!("event=registration_node_already_gone path={path}");
            }
            Err(err) => {
                warn!("event=registration_node_delete_failed path={path} error={err}");
            }
        }
    }

    fn trigger_shutdown(&self, code: i32) {
        if self.shutdown_tx.send(code).is_err() {
            error!("event=shutdown_trigger_lost code={code}");
        }
    }

    fn transition_to_read_only(&self) {
        if self.flags.is_shutting_down() {
            return;
        }
        if !self.flags.enter_read_only() {
            return;
        }
        if !self.config.readonly_mode_enabled {
            warn!("event=readonly_mode_disabled action=shutdown");
            self.trigger_shutdown(exit_code::BOOKIE_EXCEPTION);
            return;
        }
        info!("event=transition_to_readonly");
        self.metrics.inc_counter("bookie.readonly_transitions", 1);
        let result = self.ensure_readonly_parent().and_then(|()| {
            self.register_at(&self.registration_path(BookieMode::ReadOnly))
        });
        match result {
            Ok(()) => {
                self.delete_quietly(&self.registration_path(BookieMode::Writable));
                self.publish_status();
            }
            Err(err) => {
                error!("event=readonly_transition_failed error={err} action=shutdown");
                self.trigger_shutdown(exit_code::BOOKIE_EXCEPTION);
            }
        }
    }

    fn transition_to_writable(&self) {
        if self.flags.is_shutting_down() {
            return;
        }
        if !self.flags.enter_writable() {
            return;
        }
        info!("event=transition_to_writable");
        self.metrics.inc_counter("bookie.writable_transitions", 1);
        match self.register_at(&self.registration_path(BookieMode::Writable)) {
            Ok(()) => {
                self.delete_quietly(&self.registration_path(BookieMode::ReadOnly));
                self.publish_status();
            }
            Err(err) => {
                error!("event=writable_transition_failed error={err} action=shutdown");
                self.trigger_shutdown(exit_code::BOOKIE_EXCEPTION);
            }
        }
    }

    /// Steady-state re-registration after a session expiry, with bounded
    /// exponential backoff; exhaustion shuts the bookie down.
    fn reregister(&self) {
        if self.flags.is_shutting_down() {
            return;
        }
        let policy = RetryPolicy::exponential(
            self.config.reregister_max_attempts,
            Duration::from_millis(self.config.reregister_backoff_start_ms),
            Duration::from_millis(self.config.reregister_backoff_max_ms),
        );
        let mut retry = policy.handle();
        loop {
            if self.stop_retries.load(Ordering::SeqCst) {
                return;
            }
            match self.register_current_mode() {
                Ok(()) => return,
                Err(err) => match retry.next_delay() {
                    Some(delay) => {
                        warn!(
                            "event=reregister_retry attempt={} delay_ms={} error={err}",
                            retry.attempts(),
                            delay.as_millis()
                        );
                        thread::sleep(delay);
                    }
                    None => {
                        error!("event=reregister_exhausted error={err} action=shutdown");
                        self.trigger_shutdown(exit_code::REG_FAIL);
                        return;
                    }
                },
            }
        }
    }
}

/// Serializes mode transitions on one worker thread, so concurrent disk
/// events coalesce into a single observable transition.
pub struct StateService {
    driver: Arc<StateDriver>,
    sender: Sender<StateCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StateService {
    pub fn start(driver: StateDriver) -> Self {
        let driver = Arc::new(driver);
        let (sender, receiver) = channel();
        let worker_driver = Arc::clone(&driver);
        let worker = thread::spawn(move || Self::run(worker_driver, receiver));
        Self {
            driver,
            sender,
            worker: Mutex::new(Some(worker)),
        }
    }

    fn run(driver: Arc<StateDriver>, receiver: Receiver<StateCommand>) {
        while let Ok(command) = receiver.recv() {
            match command {
                StateCommand::TransitionWritable => driver.transition_to_writable(),
                StateCommand::TransitionReadOnly => driver.transition_to_read_only(),
                StateCommand::Reregister => driver.reregister(),
                StateCommand::Stop => return,
            }
        }
    }

    pub fn sender(&self) -> Sender<StateCommand> {
        self.sender.clone()
    }

    pub fn submit(&self, command: StateCommand) {
        if self.sender.send(command).is_err() {
            warn!("event=state_service_stopped command_dropped={command:?}");
        }
    }

    pub fn driver(&self) -> &Arc<StateDriver> {
        &self.driver
    }

    pub fn shutdown(&self) {
        self.driver.stop_retries.store(true, Ordering::SeqCst);
        let _ = self.sender.send(StateCommand::Stop);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("event=state_service_panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::MemoryCoordinator;
    use std::sync::mpsc;

    fn driver_fixture(
        coordinator: Arc<MemoryCoordinator>,
        readonly_enabled: bool,
    ) -> (StateDriver, mpsc::Receiver<i32>) {
        let (shutdown_tx, shutdown_rx) = channel();
        let config = ServerConfig {
            readonly_mode_enabled: readonly_enabled,
            session_timeout_ms: 200,
            ..ServerConfig::default()
        };
        let driver = StateDriver {
            config: Arc::new(config),
            coordinator,
            flags: Arc::new(ModeFlags::default()),
            metrics: SharedMetricsRegistry::new("bindery"),
            shutdown_tx,
            stop_retries: Arc::new(AtomicBool::new(false)),
        };
        (driver, shutdown_rx)
    }

    #[test]
    fn readonly_transition_moves_registration_node() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let (driver, _rx) = driver_fixture(coordinator.clone(), true);
        driver.register_current_mode().unwrap();
        let writable_path = driver.registration_path(BookieMode::Writable);
        let readonly_path = driver.registration_path(BookieMode::ReadOnly);
        assert!(coordinator.exists(&writable_path).unwrap());

        driver.transition_to_read_only();
        assert!(driver.flags.is_read_only());
        assert!(coordinator.exists(&readonly_path).unwrap());
        assert!(!coordinator.exists(&writable_path).unwrap());

        driver.transition_to_writable();
        assert!(!driver.flags.is_read_only());
        assert!(coordinator.exists(&writable_path).unwrap());
        assert!(!coordinator.exists(&readonly_path).unwrap());
    }

    #[test]
    fn second_readonly_transition_is_a_noop() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let (driver, _rx) = driver_fixture(coordinator, true);
        driver.register_current_mode().unwrap();
        driver.transition_to_read_only();
        let transitions_before = driver
            .metrics
            .snapshot()
            .counters
            .get("bindery.bookie.readonly_transitions")
            .copied();
        driver.transition_to_read_only();
        let transitions_after = driver
            .metrics
            .snapshot()
            .counters
            .get("bindery.bookie.readonly_transitions")
            .copied();
        assert_eq!(transitions_before, transitions_after);
    }

    #[test]
    fn readonly_disabled_triggers_shutdown_instead() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let (driver, shutdown_rx) = driver_fixture(coordinator, false);
        driver.register_current_mode().unwrap();
        driver.transition_to_read_only();
        assert_eq!(shutdown_rx.recv().unwrap(), exit_code::BOOKIE_EXCEPTION);
    }

    #[test]
    fn transitions_are_noops_while_shutting_down() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let (driver, _rx) = driver_fixture(coordinator.clone(), true);
        driver.register_current_mode().unwrap();
        driver.flags.set_shutting_down();
        driver.transition_to_read_only();
        assert!(!driver.flags.is_read_only());
        assert!(coordinator
            .exists(&driver.registration_path(BookieMode::Writable))
            .unwrap());
    }

    #[test]
    fn reregister_recovers_after_session_expiry() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let (driver, _rx) = driver_fixture(coordinator.clone(), true);
        driver.register_current_mode().unwrap();
        coordinator.expire_session();
        let path = driver.registration_path(BookieMode::Writable);
        assert!(!coordinator.exists(&path).unwrap());
        driver.reregister();
        assert!(coordinator.exists(&path).unwrap());
        assert!(driver.flags.is_registered());
    }

    #[test]
    fn reregister_exhaustion_triggers_reg_fail_shutdown() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let (mut driver, shutdown_rx) = driver_fixture(coordinator.clone(), true);
        driver.config = Arc::new(ServerConfig {
            reregister_max_attempts: 2,
            reregister_backoff_start_ms: 1,
            reregister_backoff_max_ms: 2,
            ..(*driver.config).clone()
        });
        coordinator.set_unavailable(true);
        driver.reregister();
        assert_eq!(shutdown_rx.recv().unwrap(), exit_code::REG_FAIL);
    }

    #[test]
    fn state_service_serializes_concurrent_transitions() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let (driver, _rx) = driver_fixture(coordinator, true);
        driver.register_current_mode().unwrap();
        let service = StateService::start(driver);
        for _ in 0..8 {
            service.submit(StateCommand::TransitionReadOnly);
        }
        service.shutdown();
        let snapshot = service.driver().metrics.snapshot();
        assert_eq!(
            snapshot.counters["bindery.bookie.readonly_transitions"],
            1
        );
        assert!(service.driver().flags.is_read_only());
    }
}
