use std::sync::{Arc, Weak};
use std::time::Duration;

use clap::{Parser, ValueEnum};

use domus::notification::{Notification, NotificationKind};

use domus_driver::config::DriverConfig;
use domus_driver::error::Error;
use domus_driver::event::WatcherContext;
use domus_driver::manager::Manager;

use flume::Sender;

use tracing::{Level, error, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    const fn level(self) -> Level {
        match self {
            Self::Error => Level::ERROR,
            Self::Warn => Level::WARN,
            Self::Info => Level::INFO,
            Self::Debug => Level::DEBUG,
            Self::Trace => Level::TRACE,
        }
    }
}

#[derive(Parser)]
#[command(
    version,
    about,
    long_about = "Connects to home-automation controllers, waits for all their nodes to be discovered, and logs every value change."
)]
struct Cli {
    /// JSON configuration file listing the drivers to start.
    #[arg(short, long, conflicts_with_all = ["network", "host"])]
    config: Option<String>,

    /// Serial number of a single controller.
    #[arg(short, long, requires = "host")]
    network: Option<String>,

    /// Host of a single controller.
    #[arg(long, requires = "network")]
    host: Option<String>,

    /// Port of a single controller.
    #[arg(short, long, default_value_t = 80)]
    port: u16,

    /// Login username of a single controller.
    #[arg(short, long, default_value = "admin")]
    username: String,

    /// Login password of a single controller.
    #[arg(long, default_value = "")]
    password: String,

    /// Seconds to wait for the nodes to be discovered.
    #[arg(short, long, default_value_t = 60)]
    wait: u64,

    /// Logging level.
    #[arg(short, long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

// Discovery milestones awaited by the main thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Milestone {
    Ready,
    Failed,
    AllNodesQueried,
}

struct Logger {
    manager: Weak<Manager>,
    milestones: Sender<Milestone>,
}

impl Logger {
    fn value_changed(&self, notification: &Notification) {
        let (Some(manager), Some(value_id)) = (self.manager.upgrade(), notification.value_id())
        else {
            return;
        };

        let network_id = value_id.network_id();
        let node_id = value_id.node_id();

        let name = manager.node_name(network_id, node_id).unwrap_or_default();
        let location = manager
            .node_location_name(network_id, node_id)
            .unwrap_or_else(|_| "Unknown".into());

        match manager.value_as_string(value_id) {
            Ok(value) => info!(
                "Node {node_id:>3}: {name} in {location} changed {} to {value}",
                value_id.value_type()
            ),
            Err(e) => warn!("Cannot read `{value_id}`: {e}"),
        }
    }
}

fn on_notification(notification: &Notification, context: &WatcherContext) {
    let Some(logger) = context.downcast_ref::<Logger>() else {
        return;
    };

    let milestone = match notification.kind() {
        NotificationKind::DriverReady => Some(Milestone::Ready),
        NotificationKind::DriverFailed => Some(Milestone::Failed),
        NotificationKind::AllNodesQueried => Some(Milestone::AllNodesQueried),
        NotificationKind::ValueChanged => {
            logger.value_changed(notification);
            None
        }
        _ => None,
    };

    info!("{notification}");

    if let Some(milestone) = milestone {
        // The receiver lives until the manager is closed.
        let _ = logger.milestones.send(milestone);
    }
}

fn print_nodes(manager: &Manager) {
    for network_id in manager.network_ids() {
        let Ok(node_ids) = manager.node_ids(&network_id) else {
            continue;
        };

        println!("------------------------------------------------------------");
        for node_id in node_ids {
            println!(
                "Node id: {node_id}, Name: {}, Room: {}, Type: {}, Light: {}, Dead: {}, Desc: {}",
                manager.node_name(&network_id, &node_id).unwrap_or_default(),
                manager
                    .node_location_name(&network_id, &node_id)
                    .unwrap_or_default(),
                manager.node_type(&network_id, &node_id).unwrap_or_default(),
                manager
                    .is_node_light(&network_id, &node_id)
                    .unwrap_or_default(),
                manager
                    .is_node_dead(&network_id, &node_id)
                    .unwrap_or_default(),
                manager
                    .node_description(&network_id, &node_id)
                    .unwrap_or_default(),
            );

            for value_id in manager
                .value_ids(&network_id, &node_id)
                .unwrap_or_default()
            {
                println!(
                    "    ValueID: {value_id}, Value: {}",
                    manager.value_as_string(&value_id).unwrap_or_default()
                );
            }
        }
    }
    println!("------------------------------------------------------------");
}

fn main() -> Result<(), Error> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level.level())
        .with_target(false)
        .init();

    let manager = Manager::new();

    let (milestones, receiver) = flume::unbounded();
    let logger: WatcherContext = Arc::new(Logger {
        manager: Arc::downgrade(&manager),
        milestones,
    });
    let _ = manager.subscribe(on_notification, Arc::clone(&logger));

    match (cli.config, cli.network, cli.host) {
        (Some(config), _, _) => manager.read_config(config)?,
        (None, Some(network), Some(host)) => manager.add_driver(
            DriverConfig::new(network, host)
                .port(cli.port)
                .credentials(cli.username, cli.password),
        )?,
        _ => {
            error!("Either a configuration file or a controller network and host are required");
            return Ok(());
        }
    }

    let drivers = manager.network_ids().len();
    let mut pending = drivers;
    let mut queried = 0;

    info!("Waiting up to {} seconds for {drivers} driver(s)", cli.wait);

    let deadline = std::time::Instant::now() + Duration::from_secs(cli.wait);
    while queried < pending {
        match receiver.recv_deadline(deadline) {
            Ok(Milestone::AllNodesQueried) => queried += 1,
            Ok(Milestone::Failed) => pending = pending.saturating_sub(1),
            Ok(Milestone::Ready) => {}
            Err(_) => {
                warn!("Discovery has not completed in time");
                break;
            }
        }
    }

    print_nodes(&manager);

    if pending > 0 {
        println!("Logging value changes, press Enter to quit");
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
    }

    let _ = manager.unsubscribe(on_notification, &logger);
    manager.close();

    Ok(())
}
