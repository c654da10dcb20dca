//! Node bootstrap: wires the frame plane (C3/C4) to the AX.25 session layer
//! (C5), the BBS (C6), the Message Alerter (C7), Chat (C8/C9/C10), the
//! Weather Alert Repeater (C11) and the background timers (C12), then runs
//! until SIGINT/SIGTERM.

mod alerter;
mod aprs;
mod ax25;
mod background;
mod bbs;
mod callsign;
mod channel;
mod chat;
mod config;
mod kiss;
mod persistence;
mod session;
mod weather;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use env_logger::Builder;
use log::{error, info, LevelFilter};

use alerter::Alerter;
use ax25::{Control, Frame, UnnumberedKind};
use background::spawn as spawn_background;
use bbs::{BbsFsm, BbsStore, BbsUsers};
use callsign::Callsign;
use channel::adapter::{AgwAdapter, ChannelAdapter, KissTcpAdapter, MockAdapter, SerialAdapter};
use channel::manager::{Channel, ChannelManager, FrameEvent, Role};
use chat::{ChatManager, ChatSync, LoopbackTransport, MeshTransport};
use config::{ChannelConfig, NodeConfig};
use persistence::FileStore;
use session::SessionManager;
use weather::WeatherRepeater;

fn init_logger() {
    let mut builder = Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.filter_level(LevelFilter::Info);
    builder.init();
}

fn config_path() -> PathBuf {
    std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("config.toml"))
}

fn build_adapter(cfg: &ChannelConfig) -> Result<Box<dyn ChannelAdapter>> {
    let adapter: Box<dyn ChannelAdapter> = match cfg.kind.as_str() {
        "serial" => {
            let device = cfg.device.as_deref().context("serial channel requires `device`")?;
            let baud = cfg.baud.unwrap_or(9600);
            Box::new(SerialAdapter::new(device, baud))
        }
        "kiss-tcp" => {
            let host = cfg.host.as_deref().context("kiss-tcp channel requires `host`")?;
            let port = cfg.port.context("kiss-tcp channel requires `port`")?;
            Box::new(KissTcpAdapter::new(format!("{host}:{port}")))
        }
        "agw" => {
            let host = cfg.host.as_deref().context("agw channel requires `host`")?;
            let port = cfg.port.context("agw channel requires `port`")?;
            Box::new(AgwAdapter::new(format!("{host}:{port}")))
        }
        "mock" => Box::new(MockAdapter::new()),
        other => anyhow::bail!("unknown channel kind: {other}"),
    };
    Ok(adapter)
}

fn channel_from_config(cfg: &ChannelConfig, own_callsign: Callsign) -> Result<Channel> {
    let mut channel = Channel::new(cfg.id, cfg.name.clone(), own_callsign);
    channel.role = if cfg.fill_in { Role::FillIn } else { Role::Wide };
    channel.max_wide_n = cfg.max_wide_n;
    channel.append_digi_callsign = cfg.append_digi_callsign;
    channel.id_on_repeat = cfg.id_on_repeat;
    channel.explicit_digis = cfg
        .explicit_digis
        .iter()
        .map(|s| s.parse())
        .collect::<Result<Vec<_>, _>>()
        .context("invalid explicit digi callsign in config")?;
    Ok(channel)
}

/// True for control-field shapes that belong to the connected-mode session
/// layer (SABM/DISC/I/S frames); UI frames (APRS) and UA/DM responses we
/// send ourselves are not forwarded here.
fn is_session_traffic(frame: &Frame) -> bool {
    match frame.control {
        Control::Info { .. } | Control::Supervisory { .. } => true,
        Control::Unnumbered { kind, .. } => matches!(kind, UnnumberedKind::SABM | UnnumberedKind::DISC),
    }
}

fn spawn_frame_to_session_bridge(channel_manager: ChannelManager, sessions: SessionManager, own_callsigns: Vec<(u32, Callsign)>) {
    let mut events = channel_manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let FrameEvent::Frame { channel, parsed, .. } = event {
                if !is_session_traffic(&parsed) {
                    continue;
                }
                let Some((_, own_callsign)) = own_callsigns.iter().find(|(id, _)| *id == channel) else {
                    continue;
                };
                if !parsed.dest().callsign.base_eq(own_callsign) {
                    continue;
                }
                sessions.handle_frame(channel, own_callsign, (*parsed).clone()).await;
            }
        }
    });
}

async fn shutdown_cascade(channel_manager: &ChannelManager, sessions: &SessionManager, background_shutdown: tokio::sync::watch::Sender<bool>) {
    info!("shutdown: cancelling background timers");
    let _ = background_shutdown.send(true);

    info!("shutdown: draining active sessions");
    for key in sessions.active_sessions().await {
        sessions.disconnect(&key).await;
    }

    info!("shutdown: closing channels");
    for channel in channel_manager.list_channels().await {
        channel_manager.remove_channel(channel.id).await;
    }
}

async fn run() -> Result<()> {
    let path = config_path();
    let config = NodeConfig::load(&path).with_context(|| format!("loading config from {}", path.display()))?;
    let own_callsign: Callsign = config
        .own_callsign
        .parse()
        .with_context(|| format!("invalid own-callsign `{}`", config.own_callsign))?;

    info!("starting node {} as {own_callsign}", config.node_id);

    let channel_manager = ChannelManager::new();
    let mut own_callsigns = Vec::new();
    for channel_cfg in &config.channels {
        let own = channel_cfg
            .own_callsign
            .parse::<Callsign>()
            .with_context(|| format!("invalid own-callsign for channel {}", channel_cfg.id))?;
        let channel = channel_from_config(channel_cfg, own.clone())?;
        let adapter = build_adapter(channel_cfg)?;
        own_callsigns.push((channel_cfg.id, own));
        channel_manager.add_channel(channel, adapter).await;
    }

    let sessions = SessionManager::with_inactivity_timeout(
        channel_manager.clone(),
        Duration::from_secs(config.bbs.inactivity_timeout_sec),
    );
    spawn_frame_to_session_bridge(channel_manager.clone(), sessions.clone(), own_callsigns);

    let data_dir: PathBuf = config.data_dir.clone().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("data"));
    std::fs::create_dir_all(&data_dir).with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let persistence = Arc::new(FileStore::new(data_dir));
    let store = Arc::new(BbsStore::with_persistence(persistence.clone()));
    let users = Arc::new(BbsUsers::with_persistence(persistence));

    let bbs = BbsFsm::new(own_callsign.clone(), sessions.clone(), store.clone(), users);
    bbs.spawn();

    let alerter = Alerter::new(channel_manager.clone(), store, own_callsign.clone(), config.alerter.default_channel);
    alerter.spawn();

    let chat = ChatManager::new();
    let transport: Arc<dyn MeshTransport> = Arc::new(LoopbackTransport::new());
    let sync = ChatSync::new(config.node_id.clone(), chat, transport);
    sync.spawn();

    let weather = WeatherRepeater::new(
        channel_manager.clone(),
        own_callsign,
        config.weather.digipeat_channels.clone(),
        config.weather.same_codes.clone(),
    );
    weather.spawn();

    let metrics_interval = Duration::from_secs(config.background.metrics_check_interval_sec);
    let background_shutdown = spawn_background(channel_manager.clone(), sessions.clone(), alerter, metrics_interval);

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    shutdown_cascade(&channel_manager, &sessions, background_shutdown).await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() {
    init_logger();
    if let Err(err) = run().await {
        error!("fatal init error: {err:#}");
        std::process::exit(1);
    }
}
