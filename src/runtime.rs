// Control task: the one place that touches motors
//
// Socket sessions, the datagram queue, the watchdog and admin requests all
// end up here, so every PWM write happens on this task. Other tasks talk to
// it through a ControlHandle.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{Args, COMMAND_QUEUE_CAPACITY, IDLE_SLEEP_TIMEOUT, POWER_CHECK_INTERVAL, QUEUE_DRAIN_INTERVAL};
use crate::messages::{Command, VehicleStatus, ERR_FORCE_DISCONNECT};
use crate::motor::{Board, MotorRegistry, RegistryError, SimulatedBoard};
use crate::power::PowerManager;
use crate::store::{ConfigStore, JsonFileStore};
use crate::udp::{CommandQueue, DatagramListener};
use crate::watchdog::Watchdog;
use crate::ws::session::{self, AttachOutcome, Outbound, Role, SessionArbiter, SessionId};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Where a command came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Session(SessionId),
    Datagram,
    Admin,
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Control task has stopped")]
    Stopped,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

enum ControlEvent {
    Attach {
        role: Role,
        outbound: mpsc::Sender<Outbound>,
        reply: oneshot::Sender<AttachOutcome>,
    },
    Detach(SessionId),
    Command {
        origin: Origin,
        command: Command,
    },
    UpdateMinPower {
        name: String,
        value: i64,
        reply: oneshot::Sender<bool>,
    },
    UpdateReversed {
        name: String,
        reversed: bool,
        reply: oneshot::Sender<bool>,
    },
    GetAssignments {
        reply: oneshot::Sender<BTreeMap<String, u8>>,
    },
    SetAssignments {
        assignments: BTreeMap<String, u8>,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    ForceDisconnect {
        reply: oneshot::Sender<bool>,
    },
    Sleep {
        reply: oneshot::Sender<()>,
    },
    Wake {
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<VehicleStatus>,
    },
}

/// Cloneable sender side of the control task
#[derive(Clone)]
pub struct ControlHandle {
    events: mpsc::Sender<ControlEvent>,
}

impl ControlHandle {
    async fn send(&self, event: ControlEvent) -> Result<(), ControlError> {
        self.events.send(event).await.map_err(|_| ControlError::Stopped)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> ControlEvent) -> Result<T, ControlError> {
        let (reply, response) = oneshot::channel();
        self.send(make(reply)).await?;
        response.await.map_err(|_| ControlError::Stopped)
    }

    pub async fn attach(&self, role: Role, outbound: mpsc::Sender<Outbound>) -> Result<AttachOutcome, ControlError> {
        self.request(|reply| ControlEvent::Attach { role, outbound, reply })
            .await
    }

    pub async fn detach(&self, id: SessionId) {
        // Nothing to detach from once the task is gone
        let _ = self.send(ControlEvent::Detach(id)).await;
    }

    /// Queue a command for dispatch
    pub async fn command(&self, origin: Origin, command: Command) -> Result<(), ControlError> {
        self.send(ControlEvent::Command { origin, command }).await
    }

    pub async fn update_min_power(&self, name: &str, value: i64) -> Result<bool, ControlError> {
        let name = name.to_string();
        self.request(|reply| ControlEvent::UpdateMinPower { name, value, reply })
            .await
    }

    pub async fn update_reversed(&self, name: &str, reversed: bool) -> Result<bool, ControlError> {
        let name = name.to_string();
        self.request(|reply| ControlEvent::UpdateReversed { name, reversed, reply })
            .await
    }

    pub async fn get_motor_assignments(&self) -> Result<BTreeMap<String, u8>, ControlError> {
        self.request(|reply| ControlEvent::GetAssignments { reply }).await
    }

    pub async fn set_motor_assignments(&self, assignments: BTreeMap<String, u8>) -> Result<(), ControlError> {
        self.request(|reply| ControlEvent::SetAssignments { assignments, reply })
            .await??;
        Ok(())
    }

    /// Kick the controlling session. False if nobody was controlling.
    pub async fn force_disconnect(&self) -> Result<bool, ControlError> {
        self.request(|reply| ControlEvent::ForceDisconnect { reply }).await
    }

    /// Stop every motor and cut driver power
    pub async fn sleep(&self) -> Result<(), ControlError> {
        self.request(|reply| ControlEvent::Sleep { reply }).await
    }

    pub async fn wake(&self) -> Result<(), ControlError> {
        self.request(|reply| ControlEvent::Wake { reply }).await
    }

    pub async fn status(&self) -> Result<VehicleStatus, ControlError> {
        self.request(|reply| ControlEvent::Status { reply }).await
    }
}

/// Owns the registry, the sessions and driver power
pub struct VehicleControlService {
    registry: MotorRegistry,
    watchdog: Watchdog,
    power: PowerManager,
    sessions: SessionArbiter,
    queue: Arc<CommandQueue>,
}

impl VehicleControlService {
    pub fn new(
        board: Box<dyn Board>,
        store: Box<dyn ConfigStore>,
        timeout: Duration,
        queue: Arc<CommandQueue>,
    ) -> Self {
        let power = PowerManager::new(board.as_ref(), IDLE_SLEEP_TIMEOUT);
        let registry = MotorRegistry::new(board, store, timeout);
        Self {
            registry,
            watchdog: Watchdog::new(timeout),
            power,
            sessions: SessionArbiter::new(),
            queue,
        }
    }

    pub fn registry(&self) -> &MotorRegistry {
        &self.registry
    }

    pub fn is_asleep(&self) -> bool {
        self.power.is_asleep()
    }

    pub fn status(&self) -> VehicleStatus {
        let settings = self.registry.settings();
        VehicleStatus {
            vehicle_type: settings.vehicle_type.clone(),
            tag: settings.vehicle_tag.clone(),
            vehicle_name: settings.vehicle_name.clone(),
            busy: self.sessions.is_busy(),
            asleep: self.power.is_asleep(),
        }
    }

    /// Apply one command; socket, datagram and admin commands all go through here
    ///
    /// Stops are echoed to every other open socket afterwards.
    pub fn dispatch(&mut self, origin: Origin, command: &Command) {
        if self.power.is_asleep() {
            debug!("Vehicle asleep, dropping {:?}", command);
            return;
        }
        self.power.mark_active(Instant::now());

        let result = match command {
            Command::Set { name, dir, power } => self.registry.set_motor(name, *dir, *power),
            Command::Stop { name } => self.registry.stop_motor(name),
            Command::StopAll => {
                self.registry.stop_all();
                Ok(())
            }
        };
        match result {
            Ok(()) => {}
            Err(RegistryError::UnknownMotor(name)) => debug!("Ignoring command for unknown motor {}", name),
            Err(e) => warn!("Command {:?} failed: {}", command, e),
        }

        if command.is_stop() {
            let except = match origin {
                Origin::Session(id) => Some(id),
                Origin::Datagram | Origin::Admin => None,
            };
            match command.to_json() {
                Ok(text) => self.sessions.broadcast(except, &text),
                Err(e) => warn!("Failed to encode broadcast: {}", e),
            }
        }
    }

    /// Apply everything the datagram receiver has queued, oldest first
    pub fn drain_queue(&mut self) -> usize {
        let commands = self.queue.drain();
        for command in &commands {
            self.dispatch(Origin::Datagram, command);
        }
        commands.len()
    }

    pub fn sweep(&mut self, now: Instant) -> usize {
        self.watchdog.sweep(&mut self.registry, now)
    }

    /// Power down when nothing has been commanded for the idle timeout
    pub fn check_idle(&mut self, now: Instant) -> bool {
        if !self.power.should_sleep(now) {
            return false;
        }
        info!("No commands for {:?}, going to sleep", IDLE_SLEEP_TIMEOUT);
        self.power.shutdown(&mut self.registry);
        true
    }

    fn handle_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Attach { role, outbound, reply } => {
                let _ = reply.send(self.sessions.attach(role, outbound));
            }
            ControlEvent::Detach(id) => {
                self.sessions.detach(id);
            }
            ControlEvent::Command { origin, command } => {
                if let Origin::Session(id) = origin {
                    if !self.sessions.is_controller(id) {
                        debug!("Ignoring command from non-controlling session {}", id);
                        return;
                    }
                }
                self.dispatch(origin, &command);
            }
            ControlEvent::UpdateMinPower { name, value, reply } => {
                let _ = reply.send(self.registry.update_min_power(&name, value));
            }
            ControlEvent::UpdateReversed { name, reversed, reply } => {
                let _ = reply.send(self.registry.update_reversed(&name, reversed));
            }
            ControlEvent::GetAssignments { reply } => {
                let _ = reply.send(self.registry.get_motor_assignments());
            }
            ControlEvent::SetAssignments { assignments, reply } => {
                let result = self.registry.set_motor_assignments(assignments);
                if let Err(e) = &result {
                    warn!("Rejected motor assignments: {}", e);
                }
                let _ = reply.send(result);
            }
            ControlEvent::ForceDisconnect { reply } => {
                let _ = reply.send(self.sessions.force_disconnect(ERR_FORCE_DISCONNECT));
            }
            ControlEvent::Sleep { reply } => {
                self.power.shutdown(&mut self.registry);
                let _ = reply.send(());
            }
            ControlEvent::Wake { reply } => {
                self.power.wake();
                let _ = reply.send(());
            }
            ControlEvent::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    /// Start the control task
    pub fn spawn(self) -> (ControlHandle, JoinHandle<()>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (ControlHandle { events }, tokio::spawn(self.run(rx)))
    }

    /// Run until every ControlHandle is dropped, then stop all motors
    async fn run(mut self, mut events: mpsc::Receiver<ControlEvent>) {
        let mut watchdog_tick = interval(self.watchdog.interval());
        let mut drain_tick = interval(QUEUE_DRAIN_INTERVAL);
        let mut power_tick = interval(POWER_CHECK_INTERVAL);
        for tick in [&mut watchdog_tick, &mut drain_tick, &mut power_tick] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        info!(
            "Control task started: {}ms motor timeout, {}ms watchdog interval",
            self.watchdog.timeout().as_millis(),
            self.watchdog.interval().as_millis()
        );

        loop {
            tokio::select! {
                _ = watchdog_tick.tick() => {
                    self.sweep(Instant::now());
                }
                _ = drain_tick.tick() => {
                    self.drain_queue();
                }
                _ = power_tick.tick() => {
                    self.check_idle(Instant::now());
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }

        self.registry.stop_all();
        info!("Control task stopped");
    }
}

pub async fn run(args: Args) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let store = JsonFileStore::open(args.config.clone())?;
    info!("Vehicle configuration: {}", store.path().display());
    warn!("No hardware backend; motor outputs drive a simulated board");

    let queue = Arc::new(CommandQueue::new(COMMAND_QUEUE_CAPACITY));
    let service = VehicleControlService::new(
        Box::new(SimulatedBoard::new()),
        Box::new(store),
        args.motor_timeout(),
        Arc::clone(&queue),
    );
    let vehicle = service.registry().vehicle();
    info!(
        "Vehicle: {} ({}), motors: {:?}",
        vehicle.friendly_name,
        service.status().tag.unwrap_or_default(),
        service.registry().get_motor_assignments()
    );
    let (control, control_task) = service.spawn();

    let _datagrams = if args.no_udp {
        info!("Datagram channel disabled");
        None
    } else {
        let addr = SocketAddr::from(([0, 0, 0, 0], args.udp_port));
        Some(DatagramListener::bind(addr, queue)?)
    };

    let listener = TcpListener::bind(args.listen).await?;
    info!("Listening for sockets on {}", listener.local_addr()?);

    tokio::select! {
        result = session::serve(listener, control.clone()) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    control.sleep().await?;
    control_task.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Direction;
    use crate::store::{MemoryStore, VehicleConfig};
    use crate::ws::frame::Frame;

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn service() -> (VehicleControlService, SimulatedBoard, Arc<CommandQueue>) {
        let board = SimulatedBoard::new();
        let queue = Arc::new(CommandQueue::new(100));
        let service = VehicleControlService::new(
            Box::new(board.clone()),
            Box::new(MemoryStore::new(VehicleConfig::default())),
            TIMEOUT,
            Arc::clone(&queue),
        );
        (service, board, queue)
    }

    fn set(name: &str, power: f64) -> Command {
        Command::Set {
            name: name.into(),
            dir: Direction::Fwd,
            power,
        }
    }

    fn attach(service: &mut VehicleControlService, role: Role) -> (SessionId, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        match service.sessions.attach(role, tx) {
            AttachOutcome::Attached(id) => (id, rx),
            AttachOutcome::Busy => panic!("unexpected busy"),
        }
    }

    #[test]
    fn test_dispatch_drives_and_stops() {
        let (mut service, board, _) = service();
        service.dispatch(Origin::Admin, &set("left", 50.0));
        assert_eq!(board.duty(1), Some(52767));

        service.dispatch(Origin::Admin, &Command::Stop { name: "left".into() });
        assert_eq!(board.duty(1), Some(0));

        // unknown names are ignored
        service.dispatch(Origin::Admin, &set("wings", 100.0));
        assert!(!service.registry().any_running());
    }

    #[test]
    fn test_queue_drain_matches_direct_dispatch() {
        let (mut direct, direct_board, _) = service();
        let (mut queued, queued_board, queue) = service();
        let commands = vec![
            set("left", 30.0),
            set("bed", 1.0),
            set("right", 80.0),
            Command::Stop { name: "left".into() },
        ];

        for command in &commands {
            direct.dispatch(Origin::Admin, command);
            assert!(queue.push(command.clone()));
        }
        assert_eq!(queued.drain_queue(), commands.len());
        assert!(queue.is_empty());

        for pin in [1, 2, 3, 4, 5, 6] {
            assert_eq!(direct_board.duty(pin), queued_board.duty(pin), "pin {}", pin);
        }
    }

    #[test]
    fn test_stop_broadcasts_to_other_sockets() {
        let (mut service, _, _) = service();
        let (controller, mut controller_rx) = attach(&mut service, Role::Controller);
        let (_, mut observer_rx) = attach(&mut service, Role::Observer);

        service.dispatch(Origin::Session(controller), &Command::StopAll);
        assert!(controller_rx.try_recv().is_err());
        assert_eq!(
            observer_rx.try_recv().unwrap(),
            Outbound::Frame(Frame::Text(r#"{"action":"stop_all"}"#.into()))
        );

        // sets are not broadcast
        service.dispatch(Origin::Session(controller), &set("left", 10.0));
        assert!(observer_rx.try_recv().is_err());

        // a datagram stop reaches the controller too
        service.dispatch(Origin::Datagram, &Command::Stop { name: "bed".into() });
        assert!(controller_rx.try_recv().is_ok());
        assert!(observer_rx.try_recv().is_ok());
    }

    #[test]
    fn test_nameless_stop_is_still_echoed() {
        let (mut service, board, _) = service();
        let (controller, _controller_rx) = attach(&mut service, Role::Controller);
        let (_, mut observer_rx) = attach(&mut service, Role::Observer);
        service.dispatch(Origin::Admin, &set("left", 100.0));

        let stop = Command::parse(r#"{"action":"stop"}"#).unwrap();
        service.dispatch(Origin::Session(controller), &stop);
        assert_eq!(
            observer_rx.try_recv().unwrap(),
            Outbound::Frame(Frame::Text(r#"{"action":"stop","name":""}"#.into()))
        );
        // nothing was named, so nothing stopped
        assert_eq!(board.duty(1), Some(crate::config::MAX_DUTY));
    }

    #[test]
    fn test_observer_commands_are_ignored() {
        let (mut service, board, _) = service();
        let (observer, _rx) = attach(&mut service, Role::Observer);
        service.handle_event(ControlEvent::Command {
            origin: Origin::Session(observer),
            command: set("left", 100.0),
        });
        assert_eq!(board.duty(1), Some(0));
    }

    #[test]
    fn test_watchdog_stops_stale_motors() {
        let (mut service, board, _) = service();
        service.dispatch(Origin::Admin, &set("left", 100.0));
        service.dispatch(Origin::Admin, &set("bed", 1.0));

        let now = Instant::now();
        assert_eq!(service.sweep(now), 0);
        assert_eq!(service.sweep(now + TIMEOUT + Duration::from_millis(50)), 2);
        assert_eq!(board.duty(1), Some(0));
        assert_eq!(board.duty(5), Some(0));
    }

    #[test]
    fn test_commands_dropped_while_asleep() {
        let (mut service, board, _) = service();
        service.dispatch(Origin::Admin, &set("left", 100.0));

        let (reply, _) = oneshot::channel();
        service.handle_event(ControlEvent::Sleep { reply });
        assert!(service.is_asleep());
        assert_eq!(board.duty(1), Some(0));
        assert_eq!(board.level(crate::config::DRIVER_ENABLE_PIN), Some(false));

        service.dispatch(Origin::Admin, &set("left", 100.0));
        assert_eq!(board.duty(1), Some(0));

        let (reply, _) = oneshot::channel();
        service.handle_event(ControlEvent::Wake { reply });
        service.dispatch(Origin::Admin, &set("left", 100.0));
        assert_eq!(board.duty(1), Some(65535));
    }

    #[test]
    fn test_idle_auto_sleep() {
        let (mut service, _, _) = service();
        let now = Instant::now();
        assert!(!service.check_idle(now));
        assert!(service.check_idle(now + IDLE_SLEEP_TIMEOUT + Duration::from_secs(1)));
        assert!(service.status().asleep);
    }

    #[tokio::test]
    async fn test_handle_admin_round_trips() {
        let (service, board, _) = service();
        let (control, _task) = service.spawn();

        assert!(control.update_min_power("left", 50_000).await.unwrap());
        assert!(!control.update_min_power("nope", 1).await.unwrap());
        assert!(control.update_reversed("right", true).await.unwrap());

        let assignments = control.get_motor_assignments().await.unwrap();
        assert_eq!(assignments.get("left"), Some(&1));

        let mut swapped = assignments.clone();
        swapped.insert("left".into(), 2);
        swapped.insert("right".into(), 1);
        control.set_motor_assignments(swapped.clone()).await.unwrap();
        assert_eq!(control.get_motor_assignments().await.unwrap(), swapped);

        let duplicate = BTreeMap::from([("left".to_string(), 1), ("right".to_string(), 1)]);
        assert!(matches!(
            control.set_motor_assignments(duplicate).await,
            Err(ControlError::Registry(RegistryError::AssignmentConflict { .. }))
        ));
        assert_eq!(control.get_motor_assignments().await.unwrap(), swapped);

        // left now drives pins 3/4 with the persisted floor
        control.command(Origin::Admin, set("left", 0.5)).await.unwrap();
        let status = control.status().await.unwrap();
        assert!(!status.busy);
        assert_eq!(board.duty(3), Some(50_000 + (15_535.0 * 0.005) as u16));
    }

    #[tokio::test]
    async fn test_watchdog_runs_on_control_task() {
        let (service, board, _) = service();
        let (control, _task) = service.spawn();

        control.command(Origin::Admin, set("left", 100.0)).await.unwrap();
        // the status round trip happens after the command is applied
        control.status().await.unwrap();
        assert_eq!(board.duty(1), Some(65535));

        tokio::time::sleep(TIMEOUT * 3).await;
        assert_eq!(board.duty(1), Some(0));
    }

    #[tokio::test]
    async fn test_handle_fails_once_task_is_gone() {
        let (service, _, _) = service();
        let (control, task) = service.spawn();
        task.abort();
        let _ = task.await;
        assert!(matches!(control.status().await, Err(ControlError::Stopped)));
    }
}
