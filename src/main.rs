use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use peercall::{Client, ClientConfig, Event, FileIdentityStore};

// A terminal front end for the call client.
//
// Usage:
//   cargo run                                      # connect and wait for calls
//   cargo run -- --auto-accept                     # answer every incoming call
//   cargo run -- --call user_ab12cd                # dial a participant
//   cargo run -- -s ws://relay.example:8080        # custom relay

#[derive(Parser, Debug)]
#[command(name = "peercall", about = "Peer-to-peer calls over a signaling relay")]
struct Args {
    /// Relay WebSocket URL
    #[arg(short, long, default_value = peercall::config::DEFAULT_SERVER_URL)]
    server: String,

    /// Where the local participant id is persisted
    #[arg(short, long, default_value = "identity.json")]
    identity_file: String,

    /// Participant to call once connected
    #[arg(short, long)]
    call: Option<String>,

    /// Accept incoming calls without asking
    #[arg(short, long)]
    auto_accept: bool,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    rt.block_on(async {
        let auto_accept = args.auto_accept;
        let client = match Client::builder()
            .with_config(ClientConfig::default().with_server_url(&args.server))
            .with_identity(FileIdentityStore::new(&args.identity_file))
            .on_event(move |event, client| async move {
                match event {
                    Event::Connection(state) => info!("Relay {state}"),
                    Event::IncomingCall { from } => {
                        info!("📞 Incoming call from {from}");
                        if auto_accept {
                            if let Err(e) = client.accept_call().await {
                                error!("Failed to accept call from {from}: {e}");
                            }
                        } else {
                            info!("Run with --auto-accept to answer; declining");
                            if let Err(e) = client.reject_call().await {
                                warn!("Failed to decline call: {e}");
                            }
                        }
                    }
                    Event::CallActive { remote } => info!("✅ In call with {remote}"),
                    Event::CallEnded {
                        remote,
                        reason,
                        duration_secs,
                    } => match duration_secs {
                        Some(secs) => info!("Call with {remote} ended ({reason:?}) after {secs}s"),
                        None => info!("Call with {remote} ended ({reason:?})"),
                    },
                    Event::RemoteMedia {
                        remote: Some(remote),
                    } => info!("Receiving media from {remote}"),
                    Event::RemoteMedia { remote: None } => info!("Receiving remote media"),
                    Event::Error(notice) => warn!("{notice}"),
                }
            })
            .build()
            .await
        {
            Ok(client) => client,
            Err(e) => {
                error!("Failed to build client: {e}");
                return;
            }
        };

        if let Err(e) = client.connect().await {
            error!("Failed to connect: {e}");
            return;
        }
        if let Some(id) = client.local_id() {
            info!("Your id is {id}");
        }

        if let Some(remote) = args.call
            && let Err(e) = client.call_user(remote.as_str()).await
        {
            error!("Failed to call {remote}: {e}");
        }

        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {e}");
        }
        info!("Shutting down");
        client.end_call().await;
        client.disconnect().await;
    });
}
