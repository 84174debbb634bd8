mod command;
mod connection;
mod error;
mod presence;
mod readiness;
mod session;
mod tracking;
mod transport;

use clap::{Parser, ValueEnum};
use connection::ConnectionConfig;
use presence::{PresenceConfig, PresenceCoordinator, PresencePolicy, UpdateOrigin};
use readiness::Readiness;
use robofleet_shared::{
    tracking as defaults, timing, BoundingBox, Command, DetectedObject, RobotId, RobotStatus, SessionRole, Topic,
};
use session::{SessionConfig, SessionRegistry, StepOutcome, TeardownConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracking::{CameraFrame, ScriptedDetector, TrackingConfig};
use transport::{MemoryBroker, PubSubTransport, RecordingVideo};

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Role {
    Operator,
    Robot,
}

impl From<Role> for SessionRole {
    fn from(role: Role) -> Self {
        match role {
            Role::Operator => SessionRole::Operator,
            Role::Robot => SessionRole::Robot,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "control-station")]
#[command(author, version, about = "Robot fleet control station")]
struct Args {
    /// Number of robots in the fleet (ids 0..N)
    #[arg(long, default_value_t = 5)]
    robot_count: u32,

    /// Robot to open a control session for
    #[arg(long, default_value_t = 0)]
    robot: RobotId,

    /// Which side of the link this station plays
    #[arg(long, value_enum, default_value_t = Role::Operator)]
    role: Role,

    /// Camera image is mirrored (front-facing camera)
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    mirrored: bool,

    /// Consecutive empty frames before tracking forces STOP
    #[arg(long, default_value_t = defaults::EMPTY_FRAME_THRESHOLD)]
    empty_frame_threshold: u32,

    /// Center dead zone is frame width divided by this
    #[arg(long, default_value_t = defaults::CENTER_TOLERANCE_DIVISOR)]
    tolerance_divisor: u32,

    /// Bounded number of broker connect attempts
    #[arg(long, default_value_t = timing::CONNECT_MAX_ATTEMPTS)]
    connect_attempts: u32,

    /// Refuse this many connect attempts of each session link
    #[arg(long, default_value_t = 0)]
    fail_connects: u32,

    /// Delay every connect attempt of each session link
    #[arg(long, default_value_t = 0)]
    connect_delay_ms: u64,

    /// Let an operator returning from an offline robot mark it online
    #[arg(long)]
    no_sticky_offline: bool,

    /// Publish offline / OFF / STOP for every robot before starting
    #[arg(long)]
    reset_fleet: bool,
}

const HELP: &str = "Commands: w/a/s/d/x or FORWARD..STOP, ai, see <x> <y> <w> <h>, empty, fail <reason>, \
open <id>, use <id>, close [id], sessions, status, set <id> <status>, traffic [topic], retained <id>, quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let role = SessionRole::from(args.role);
    info!("Control station starting: robot {} as {}", args.robot, role);

    let connection = ConnectionConfig {
        max_attempts: args.connect_attempts,
        ..Default::default()
    };

    let broker = MemoryBroker::new();
    let presence_transport: Arc<dyn PubSubTransport> = Arc::new(broker.client("presence"));
    let (presence, mut updates) = PresenceCoordinator::start(
        presence_transport,
        PresenceConfig {
            robot_count: args.robot_count,
            policy: PresencePolicy {
                sticky_offline: !args.no_sticky_offline,
            },
            connection: ConnectionConfig {
                client_id: "presence".into(),
                ..connection.clone()
            },
        },
    );

    // Spawn view update logger
    tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            let origin = match update.origin {
                UpdateOrigin::Local => "local",
                UpdateOrigin::Remote => "remote",
            };
            info!("[VIEW] Robot {} is {} ({})", update.robot_id, update.status, origin);
        }
    });

    if args.reset_fleet {
        presence.reset_fleet().await?;
    }
    let readiness = presence.settled().await;
    info!("Presence tracking {} robots, transport {:?}", presence.robot_count(), readiness);
    info!("Robots available to {}: {:?}", role, presence.available(role).await?);

    let station = Station {
        broker: broker.clone(),
        video: RecordingVideo::new(),
        detector: Arc::new(ScriptedDetector::new()),
        registry: SessionRegistry::new(),
        presence: presence.clone(),
        config: SessionConfig {
            role,
            connection,
            tracking: TrackingConfig {
                mirrored: args.mirrored,
                empty_frame_threshold: args.empty_frame_threshold,
                tolerance_divisor: args.tolerance_divisor,
                ..Default::default()
            },
            teardown: TeardownConfig::default(),
        },
        fail_connects: args.fail_connects,
        connect_delay: Duration::from_millis(args.connect_delay_ms),
    };

    let mut current = args.robot;
    station.open(current).await?;
    info!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sequence = 0u64;

    while let Ok(Some(line)) = lines.next_line().await {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some(&verb) = words.first() else {
            continue;
        };

        match verb {
            "quit" | "exit" => break,
            "help" => info!("{}", HELP),
            "ai" => match station.registry.toggle_ai(current).await {
                Ok(mode) => info!("Robot {} mode is now {}", current, mode),
                Err(e) => error!("Toggle failed: {}", e),
            },
            "open" | "use" => {
                let Some(id) = words.get(1).and_then(|w| w.parse::<RobotId>().ok()) else {
                    warn!("Usage: {} <id>", verb);
                    continue;
                };
                if verb == "open" {
                    if let Err(e) = station.open(id).await {
                        error!("Open failed: {}", e);
                        continue;
                    }
                } else if station.registry.mode(id).await.is_none() {
                    warn!("Robot {} has no open session", id);
                    continue;
                }
                current = id;
                info!("Now controlling robot {}", current);
            }
            "close" => {
                let id = words.get(1).and_then(|w| w.parse().ok()).unwrap_or(current);
                station.close(id).await;
            }
            "sessions" => {
                for id in station.registry.open_ids().await {
                    let mode = station.registry.mode(id).await;
                    let marker = if id == current { "*" } else { " " };
                    info!(" {}robot {}: {:?}", marker, id, mode);
                }
                info!("{} session(s) open", station.registry.count().await);
            }
            "status" => match presence.snapshot().await {
                Ok(statuses) => {
                    for (id, status) in statuses.iter().enumerate() {
                        info!("  robot {}: {}", id, status);
                    }
                }
                Err(e) => error!("Status unavailable: {}", e),
            },
            "set" => {
                let parsed = match words[1..] {
                    [id, status] => id.parse::<RobotId>().ok().zip(status.parse::<RobotStatus>().ok()),
                    _ => None,
                };
                let Some((id, status)) = parsed else {
                    warn!("Usage: set <id> <status>");
                    continue;
                };
                if let Err(e) = presence.set_local_status(id, status).await {
                    error!("Status not set: {}", e);
                }
            }
            "traffic" => {
                let entries: Vec<String> = match words.get(1) {
                    Some(topic) => broker.payloads(topic),
                    None => broker
                        .history()
                        .into_iter()
                        .map(|m| format!("{} {}", m.topic, String::from_utf8_lossy(&m.payload)))
                        .collect(),
                };
                for entry in entries {
                    info!("  {}", entry);
                }
            }
            "retained" => {
                let Some(id) = words.get(1).and_then(|w| w.parse::<RobotId>().ok()) else {
                    warn!("Usage: retained <id>");
                    continue;
                };
                for topic in [Topic::status(id), Topic::ai_mode(id), Topic::control(id)] {
                    let topic = topic.to_string();
                    match broker.retained(&topic) {
                        Some(payload) => info!("  {} = {}", topic, String::from_utf8_lossy(&payload)),
                        None => info!("  {} has no retained value", topic),
                    }
                }
            }
            "see" | "empty" | "fail" => {
                if station.detector.remaining() > 0 {
                    warn!("Previous detection not consumed yet, is the robot autonomous?");
                }
                match verb {
                    "see" => match parse_box(&words[1..]) {
                        Some(bounds) => station
                            .detector
                            .push_objects(vec![DetectedObject::new(bounds).with_label("person", 1.0)]),
                        None => {
                            warn!("Usage: see <x> <y> <w> <h>");
                            continue;
                        }
                    },
                    "fail" => station.detector.push_failure(words[1..].join(" ")),
                    _ => station.detector.push_objects(Vec::new()),
                }

                sequence += 1;
                if let Some(frames) = station.registry.frames(current).await {
                    frames.push(CameraFrame::new(sequence, 640, 480));
                }
            }
            other => match parse_command(other) {
                Some(command) => match station.registry.send_command(current, command).await {
                    Ok(true) => {}
                    Ok(false) => info!("{} ignored while autonomous", command),
                    Err(e) => error!("Command failed: {}", e),
                },
                None => warn!("Unknown input: {}", other),
            },
        }
    }

    for id in station.registry.open_ids().await {
        station.close(id).await;
    }
    let leftover = station.registry.close_all().await;
    if !leftover.is_empty() {
        warn!("{} session(s) closed late", leftover.len());
    }
    info!("Video engine calls: {:?}", station.video.calls());
    presence.shutdown().await;

    info!("Control station stopped");
    Ok(())
}

/// Everything a console session needs to open and close robot links
struct Station {
    broker: MemoryBroker,
    video: RecordingVideo,
    detector: Arc<ScriptedDetector>,
    registry: SessionRegistry,
    presence: PresenceCoordinator,
    config: SessionConfig,
    fail_connects: u32,
    connect_delay: Duration,
}

impl Station {
    async fn open(&self, robot_id: RobotId) -> anyhow::Result<()> {
        let role = self.config.role;
        let status = self.presence.status(robot_id).await?;
        if !status.available_for(role) {
            warn!("Robot {} is {}, not normally available to {}", robot_id, status, role);
        }

        let client_id = format!("station-{}", robot_id);
        let transport = self
            .broker
            .client(client_id.clone())
            .fail_connects(self.fail_connects)
            .with_connect_delay(self.connect_delay);
        let config = SessionConfig {
            connection: ConnectionConfig {
                client_id,
                ..self.config.connection.clone()
            },
            ..self.config.clone()
        };

        self.registry
            .open(
                robot_id,
                Arc::new(transport),
                Arc::new(self.video.clone()),
                self.detector.clone(),
                config,
            )
            .await?;

        if let Some(mut mode) = self.registry.watch_mode(robot_id).await {
            tokio::spawn(async move {
                while mode.changed().await.is_ok() {
                    let current = *mode.borrow_and_update();
                    info!("[MODE] Robot {} is {}", robot_id, current);
                }
            });
        }

        match self.registry.wait_ready(robot_id).await? {
            Readiness::Ready => info!("Robot {} link ready", robot_id),
            other => warn!("Robot {} link {:?}, commands will be dropped", robot_id, other),
        }
        Ok(())
    }

    async fn close(&self, robot_id: RobotId) {
        match self.registry.close(robot_id).await {
            Ok(report) => {
                if let Some(stats) = report.dispatch {
                    info!(
                        "Robot {}: {} forwarded, {} deduplicated, {} dropped",
                        robot_id, stats.forwarded, stats.deduplicated, stats.dropped
                    );
                }
                for step in report.failed_steps() {
                    if let Some(StepOutcome::Failed(reason)) = report.outcome(step) {
                        warn!("Robot {} teardown: {} failed: {}", robot_id, step, reason);
                    }
                }
                if report.is_clean() {
                    info!("Robot {} released", robot_id);
                }
            }
            Err(e) => {
                error!("Close failed: {}", e);
                return;
            }
        }

        match self.presence.control_returned(robot_id, self.config.role).await {
            Ok(outcome) => info!("Robot {} returned: {:?}", robot_id, outcome),
            Err(e) => error!("Return not recorded: {}", e),
        }
    }
}

fn parse_command(input: &str) -> Option<Command> {
    match input {
        "w" => Some(Command::Forward),
        "s" => Some(Command::Backward),
        "a" => Some(Command::Left),
        "d" => Some(Command::Right),
        "x" => Some(Command::Stop),
        other => other.parse().ok(),
    }
}

fn parse_box(args: &[&str]) -> Option<BoundingBox> {
    let values: Vec<i32> = args.iter().map(|a| a.parse().ok()).collect::<Option<_>>()?;
    match values[..] {
        [x, y, width, height] => Some(BoundingBox::new(x, y, width, height)),
        _ => None,
    }
}
