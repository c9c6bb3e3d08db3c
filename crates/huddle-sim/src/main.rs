//! Two simulated clients sharing one room over loopback transports.
//!
//! Usage: `huddle-sim [config.json] [store-dir]`. Without a config file every
//! setting takes its default; without a store directory members are kept in
//! memory only.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use huddle_core::adapters::codec::JsonBroadcastCodec;
use huddle_core::adapters::loopback::{BroadcastHub, PresenceHub};
use huddle_core::adapters::reporter::TracingReporter;
use huddle_core::adapters::rtc::SimulatedRtc;
use huddle_core::adapters::store::{InMemoryStore, JsonFileStore};
use huddle_core::adapters::token::StaticTokenProvider;
use huddle_core::application::ports::LocalStore;
use huddle_core::application::session::{RoomSession, SessionDeps};
use huddle_core::domain::config::SessionConfig;
use huddle_core::domain::member::{MemberId, MemberPatch};

const ROOM: &str = "main";

struct Client {
    session: Arc<RoomSession>,
    rtc: Arc<SimulatedRtc>,
}

fn load_config(path: Option<&str>) -> anyhow::Result<SessionConfig> {
    let Some(path) = path else {
        return Ok(SessionConfig::default());
    };
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))
}

fn client(
    config: &SessionConfig,
    presence: &Arc<PresenceHub>,
    broadcast: &Arc<BroadcastHub>,
    store_dir: Option<&PathBuf>,
    name: &str,
) -> Client {
    let store: Arc<dyn LocalStore> = match store_dir {
        Some(dir) => Arc::new(JsonFileStore::new(dir.join(name))),
        None => Arc::new(InMemoryStore::new()),
    };
    let rtc = Arc::new(SimulatedRtc::new());
    let session = RoomSession::new(
        config.clone(),
        SessionDeps {
            presence: Arc::new(presence.connect()),
            broadcast: Arc::new(broadcast.connect()),
            codec: Arc::new(JsonBroadcastCodec),
            rtc: rtc.clone(),
            tokens: Arc::new(StaticTokenProvider::new("sim-secret")),
            store,
            reporter: Arc::new(TracingReporter),
        },
    );
    Client { session, rtc }
}

fn log_members(label: &str, client: &Client) {
    for m in client.session.members() {
        info!(
            viewer = label,
            id = %m.id,
            name = %m.name,
            status = ?m.voice_status,
            level = format!("{:.2}", m.level),
            muted = m.muted,
            "Member"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let config = load_config(args.next().as_deref())?;
    let store_dir = args.next().map(PathBuf::from);

    let presence = PresenceHub::new();
    let broadcast = BroadcastHub::new();
    let alice = client(&config, &presence, &broadcast, store_dir.as_ref(), "alice");
    let bob = client(&config, &presence, &broadcast, store_dir.as_ref(), "bob");

    let mut rng = rand::thread_rng();
    for (client, id, name) in [(&alice, "alice", "Alice"), (&bob, "bob", "Bob")] {
        let mut member = client.session.restore_member(MemberId::new(id), name);
        member.transport_session_id = Some(rng.gen_range(1..=9_999));
        if let Err(e) = client.session.join(ROOM, member).await {
            // Presence may still be up with voice failed.
            warn!(id, "Join incomplete: {e}");
        }
    }

    info!("Alice starts talking");
    for _ in 0..10 {
        alice.rtc.set_input_level(rng.gen_range(0.5..0.9));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    log_members("bob", &bob);

    info!("Alice goes quiet, Bob mutes and sets a status");
    alice.rtc.set_input_level(0.0);
    bob.session.set_muted(true).await?;
    bob.session
        .update_profile(MemberPatch {
            game: Some("reviewing PRs".into()),
            ..MemberPatch::default()
        })
        .await?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    log_members("alice", &alice);

    for (label, client) in [("alice", &alice), ("bob", &bob)] {
        if let Err(e) = client.session.leave().await {
            warn!(label, "Leave failed: {e}");
        }
    }
    info!(remaining = presence.snapshot(ROOM).len(), "Room closed");
    Ok(())
}
